//! End-to-end behavior of the engines against real stores.

use bytes::Bytes;
use coffre_backends::{LocalStore, MemoryStore};
use coffre_core::catalog::{list_snapshots, tree};
use coffre_core::chunker::Chunker;
use coffre_core::get::{GetSettings, get};
use coffre_core::object::{
    self, EntryKind, FileEntry, SnapshotHeader, encode_file_entry, encode_snapshot_header,
};
use coffre_core::put::{PutSettings, put};
use coffre_core::{AccessMode, Error, ObjectId, ObjectStore, ObjectType, Scheduler};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Snapshot entries keep the relative path of their source, so a restored
/// tree nests under the same components.
fn restored_root(dest: &Path, src: &Path) -> PathBuf {
    let mut out = dest.to_path_buf();
    for component in src.components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

fn small_chunks(name: &str) -> PutSettings {
    PutSettings {
        name: name.to_string(),
        chunk_avg_size: 256,
        time: Some(1_700_000_000),
    }
}

fn write_source_tree(root: &Path) {
    std::fs::create_dir_all(root.join("docs/inner")).unwrap();
    std::fs::write(root.join("docs/readme.md"), b"# readme\n").unwrap();
    std::fs::write(
        root.join("docs/inner/data.bin"),
        (0..20_000u32).map(|i| (i % 253) as u8).collect::<Vec<_>>(),
    )
    .unwrap();
    std::fs::write(root.join("empty.txt"), b"").unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink("docs/readme.md", root.join("link.md")).unwrap();
}

fn assert_trees_equal(left: &Path, right: &Path) {
    let mut names: Vec<_> = std::fs::read_dir(left)
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    names.sort();
    let mut other: Vec<_> = std::fs::read_dir(right)
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    other.sort();
    assert_eq!(names, other);

    for name in names {
        let a = left.join(&name);
        let b = right.join(&name);
        let meta_a = std::fs::symlink_metadata(&a).unwrap();
        if meta_a.is_dir() {
            assert_trees_equal(&a, &b);
        } else if meta_a.is_symlink() {
            assert_eq!(
                std::fs::read_link(&a).unwrap(),
                std::fs::read_link(&b).unwrap()
            );
        } else {
            assert_eq!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());
        }
    }
}

#[tokio::test]
async fn local_store_round_trip() {
    let src = tempfile::tempdir().unwrap();
    write_source_tree(src.path());

    let repo = tempfile::tempdir().unwrap();
    let store = Arc::new(
        LocalStore::init(repo.path(), "full-secret", "write-secret")
            .await
            .unwrap(),
    );

    let scheduler = Scheduler::new(4);
    let (id, stats) = put(
        store.clone(),
        &scheduler,
        &small_chunks("nightly"),
        &[src.path().to_path_buf()],
    )
    .await
    .unwrap();
    assert!(stats.written > 0);

    // Restore through a freshly opened store.
    let reopened = Arc::new(LocalStore::open(repo.path(), "full-secret").await.unwrap());
    assert_eq!(reopened.mode(), AccessMode::Full);

    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("restored");
    let restored = get(reopened, &scheduler, &id, &GetSettings::default(), &dest)
        .await
        .unwrap();

    assert_eq!(restored, stats.len);
    let root = restored_root(&dest, src.path());
    assert_trees_equal(src.path(), &root);
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let repo = tempfile::tempdir().unwrap();
    LocalStore::init(repo.path(), "full-secret", "write-secret")
        .await
        .unwrap();

    let result = LocalStore::open(repo.path(), "nope").await;
    assert!(matches!(result, Err(Error::InvalidPassword)));
}

#[tokio::test]
async fn write_only_key_backs_up_but_cannot_read() {
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("file.txt"), b"agent data").unwrap();

    let repo = tempfile::tempdir().unwrap();
    LocalStore::init(repo.path(), "full-secret", "write-secret")
        .await
        .unwrap();

    let agent_store = Arc::new(LocalStore::open(repo.path(), "write-secret").await.unwrap());
    assert_eq!(agent_store.mode(), AccessMode::WriteOnly);

    let scheduler = Scheduler::new(2);
    let (id, _) = put(
        agent_store.clone(),
        &scheduler,
        &small_chunks("agent"),
        &[src.path().to_path_buf()],
    )
    .await
    .unwrap();

    // Every read surface is gated for the write-only key.
    let out = tempfile::tempdir().unwrap();
    let result = get(
        agent_store.clone(),
        &scheduler,
        &id,
        &GetSettings::default(),
        &out.path().join("x"),
    )
    .await;
    assert!(matches!(result, Err(Error::InsufficientPermissions)));
    assert!(matches!(
        list_snapshots(agent_store.clone(), &scheduler).await,
        Err(Error::InsufficientPermissions)
    ));
    assert!(matches!(
        tree(agent_store, &scheduler, &id, -1).await,
        Err(Error::InsufficientPermissions)
    ));

    // The full key restores what the agent backed up.
    let full_store = Arc::new(LocalStore::open(repo.path(), "full-secret").await.unwrap());
    let dest = out.path().join("restored");
    get(full_store, &scheduler, &id, &GetSettings::default(), &dest)
        .await
        .unwrap();
    let root = restored_root(&dest, src.path());
    assert_eq!(std::fs::read(root.join("file.txt")).unwrap(), b"agent data");
}

#[tokio::test]
async fn permission_gate_fires_before_any_backend_read() {
    let store = Arc::new(MemoryStore::with_mode(AccessMode::WriteOnly));
    let scheduler = Scheduler::new(2);
    let id = ObjectId::from_data(b"anything");

    let out = tempfile::tempdir().unwrap();
    assert!(matches!(
        get(
            store.clone(),
            &scheduler,
            &id,
            &GetSettings::default(),
            &out.path().join("x")
        )
        .await,
        Err(Error::InsufficientPermissions)
    ));
    assert!(matches!(
        list_snapshots(store.clone(), &scheduler).await,
        Err(Error::InsufficientPermissions)
    ));
    assert!(matches!(
        tree(store.clone(), &scheduler, &id, -1).await,
        Err(Error::InsufficientPermissions)
    ));
    assert_eq!(store.read_count(), 0);
}

#[tokio::test]
async fn shared_content_is_stored_once() {
    let src = tempfile::tempdir().unwrap();
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 239) as u8).collect();
    std::fs::write(src.path().join("a.txt"), &data).unwrap();
    std::fs::write(src.path().join("b.txt"), &data).unwrap();

    let store = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::new(4);
    let (id, stats) = put(
        store.clone(),
        &scheduler,
        &small_chunks("dedup"),
        &[src.path().to_path_buf()],
    )
    .await
    .unwrap();

    let chunk_count = Chunker::new(256).chunk_data(&Bytes::from(data.clone())).len();
    assert_eq!(store.count_kind(ObjectType::Chunk), chunk_count);
    // Identical files collapse into one File object under content
    // addressing; one directory and one snapshot complete the graph.
    assert_eq!(store.count_kind(ObjectType::File), 1);
    assert_eq!(store.count_kind(ObjectType::Directory2), 1);
    assert_eq!(store.count_kind(ObjectType::Snapshot2), 1);
    assert_eq!(store.write_count() as usize, chunk_count + 3);

    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("restored");
    let restored = get(store, &scheduler, &id, &GetSettings::default(), &dest)
        .await
        .unwrap();

    assert_eq!(stats.len, 2 * data.len() as i64);
    assert_eq!(restored, 2 * data.len() as i64);
    let root = restored_root(&dest, src.path());
    assert_eq!(std::fs::read(root.join("a.txt")).unwrap(), data);
    assert_eq!(std::fs::read(root.join("b.txt")).unwrap(), data);
}

#[tokio::test]
async fn listing_decodes_headers_and_sorts_by_time() {
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("f"), b"payload").unwrap();

    let store = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::new(2);

    let mut newer = small_chunks("newer");
    newer.time = Some(2_000_000_000);
    put(store.clone(), &scheduler, &newer, &[src.path().to_path_buf()])
        .await
        .unwrap();

    std::fs::write(src.path().join("g"), b"more payload").unwrap();
    let mut older = small_chunks("older");
    older.time = Some(1_000_000_000);
    put(store.clone(), &scheduler, &older, &[src.path().to_path_buf()])
        .await
        .unwrap();

    let snapshots = list_snapshots(store, &scheduler).await.unwrap();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].name.as_deref(), Some("older"));
    assert_eq!(snapshots[1].name.as_deref(), Some("newer"));
    assert!(snapshots[0].time < snapshots[1].time);
    assert!(snapshots[0].stored > 0);
}

#[tokio::test]
async fn tree_walk_matches_put_layout() {
    let src = tempfile::tempdir().unwrap();
    write_source_tree(src.path());

    let store = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::new(4);
    let (id, _) = put(
        store.clone(),
        &scheduler,
        &small_chunks("walk"),
        &[src.path().to_path_buf()],
    )
    .await
    .unwrap();

    let rows = tree(store, &scheduler, &id, -1).await.unwrap();

    let mut names: Vec<&str> = rows.iter().map(|row| row.name.as_str()).collect();
    names.sort_unstable();
    // The put root itself is the single top-level snapshot entry, named by
    // its relative source path.
    let top_name: String = src
        .path()
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");
    let mut expected = vec!["docs", "inner", "readme.md", "data.bin", "empty.txt"];
    #[cfg(unix)]
    expected.push("link.md");
    expected.push(top_name.as_str());
    expected.sort_unstable();
    assert_eq!(names, expected);

    let data_row = rows.iter().find(|row| row.name == "data.bin").unwrap();
    assert_eq!(data_row.size, Some(20_000));
    assert!(data_row.readable);
}

/// A generation-1 directory written by an older agent stays readable.
#[tokio::test]
async fn extracts_generation_1_objects() {
    let store = Arc::new(MemoryStore::new());
    let chunk = store
        .write_object(ObjectType::Chunk, b"legacy chunk data")
        .await
        .unwrap();

    let mut dir_payload = Vec::new();
    dir_payload.push(1u8); // kind: file
    dir_payload.extend_from_slice(chunk.id.as_bytes());
    dir_payload.extend_from_slice(&1_600_000_000i64.to_le_bytes());
    dir_payload.extend_from_slice(&0o644u32.to_le_bytes());
    dir_payload.extend_from_slice(b"old.txt\0");
    assert_eq!(dir_payload.len(), object::ENTRY_PREFIX_LEN_1 + 8);
    let dir = store
        .write_object(ObjectType::Directory1, &dir_payload)
        .await
        .unwrap();

    let mut snap_payload = Vec::new();
    encode_snapshot_header(
        &mut snap_payload,
        &SnapshotHeader {
            name: "legacy".to_string(),
            time: 1_600_000_000,
            len: 17,
            stored: 0,
        },
    )
    .unwrap();
    // Snapshot1 entries use the generation-1 record layout as well.
    snap_payload.push(0u8); // kind: directory
    snap_payload.extend_from_slice(dir.id.as_bytes());
    snap_payload.extend_from_slice(&1_600_000_000i64.to_le_bytes());
    snap_payload.extend_from_slice(&0o755u32.to_le_bytes());
    snap_payload.extend_from_slice(b"data\0");
    let snap = store
        .write_object(ObjectType::Snapshot1, &snap_payload)
        .await
        .unwrap();
    store.tag_snapshot(&snap.id, "legacy").await.unwrap();

    let scheduler = Scheduler::new(2);
    let snapshots = list_snapshots(store.clone(), &scheduler).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].name.as_deref(), Some("legacy"));

    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("restored");
    let restored = get(store, &scheduler, &snap.id, &GetSettings::default(), &dest)
        .await
        .unwrap();

    assert_eq!(restored, 17);
    assert_eq!(
        std::fs::read(dest.join("data/old.txt")).unwrap(),
        b"legacy chunk data"
    );
}

#[tokio::test]
async fn flat_extraction_drops_directory_structure() {
    let store = Arc::new(MemoryStore::new());
    let chunk = store
        .write_object(ObjectType::Chunk, b"flattened")
        .await
        .unwrap();

    let mut payload = Vec::new();
    encode_snapshot_header(
        &mut payload,
        &SnapshotHeader {
            name: "flat".to_string(),
            time: 1,
            len: 9,
            stored: 0,
        },
    )
    .unwrap();
    encode_file_entry(
        &mut payload,
        &FileEntry {
            kind: EntryKind::File,
            id: chunk.id,
            name: "deeply/nested/file.txt".to_string(),
            mtime: 0,
            btime: 0,
            mode: 0o644,
            uid: 0,
            gid: 0,
        },
    );
    let snap = store
        .write_object(ObjectType::Snapshot2, &payload)
        .await
        .unwrap();

    let scheduler = Scheduler::new(2);
    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("flat");
    get(
        store,
        &scheduler,
        &snap.id,
        &GetSettings { flat: true },
        &dest,
    )
    .await
    .unwrap();

    assert_eq!(std::fs::read(dest.join("file.txt")).unwrap(), b"flattened");
    assert!(!dest.join("deeply").exists());
}

#[tokio::test]
async fn partial_failure_leaves_good_siblings_in_place() {
    let store = Arc::new(MemoryStore::new());
    let good = store
        .write_object(ObjectType::Chunk, b"good sibling")
        .await
        .unwrap();
    let missing = ObjectId::from_data(b"object that was never written");

    let mut payload = Vec::new();
    for (id, name) in [(good.id, "keep-a"), (missing, "broken"), (good.id, "keep-b")] {
        encode_file_entry(
            &mut payload,
            &FileEntry {
                kind: EntryKind::File,
                id,
                name: name.to_string(),
                mtime: 0,
                btime: 0,
                mode: 0o644,
                uid: 0,
                gid: 0,
            },
        );
    }
    let dir = store
        .write_object(ObjectType::Directory2, &payload)
        .await
        .unwrap();

    let scheduler = Scheduler::new(4);
    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("partial");
    let result = get(store, &scheduler, &dir.id, &GetSettings::default(), &dest).await;

    assert!(matches!(result, Err(Error::NotFound { .. })));
    assert_eq!(std::fs::read(dest.join("keep-a")).unwrap(), b"good sibling");
    assert_eq!(std::fs::read(dest.join("keep-b")).unwrap(), b"good sibling");
    assert!(!dest.join("broken").exists());
}

#[tokio::test]
async fn destination_checks_fail_fast() {
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("f"), b"x").unwrap();

    let store = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::new(2);
    let (id, _) = put(
        store.clone(),
        &scheduler,
        &small_chunks("dest"),
        &[src.path().to_path_buf()],
    )
    .await
    .unwrap();

    // Populated directory: refused.
    let busy = tempfile::tempdir().unwrap();
    std::fs::write(busy.path().join("occupied"), b"y").unwrap();
    let result = get(
        store.clone(),
        &scheduler,
        &id,
        &GetSettings::default(),
        busy.path(),
    )
    .await;
    assert!(matches!(result, Err(Error::DestinationNotEmpty { .. })));

    // Existing empty directory: fine.
    let empty = tempfile::tempdir().unwrap();
    get(
        store.clone(),
        &scheduler,
        &id,
        &GetSettings::default(),
        empty.path(),
    )
    .await
    .unwrap();

    // Absent directory: created.
    let fresh = tempfile::tempdir().unwrap();
    get(
        store,
        &scheduler,
        &id,
        &GetSettings::default(),
        &fresh.path().join("does/not/exist"),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn local_blobs_verify_their_digest() {
    let repo = tempfile::tempdir().unwrap();
    let store = LocalStore::init(repo.path(), "full-secret", "write-secret")
        .await
        .unwrap();

    let write = store
        .write_object(ObjectType::Chunk, b"will be corrupted")
        .await
        .unwrap();
    assert!(write.new);

    // Same content again: dedup hit, same id.
    let again = store
        .write_object(ObjectType::Chunk, b"will be corrupted")
        .await
        .unwrap();
    assert_eq!(write.id, again.id);
    assert!(!again.new);

    // Swap the blob for a different object's content.
    let other = store
        .write_object(ObjectType::Chunk, b"different content")
        .await
        .unwrap();
    let hex = write.id.to_hex();
    let other_hex = other.id.to_hex();
    std::fs::copy(
        repo.path().join("objects").join(&other_hex[..2]).join(&other_hex),
        repo.path().join("objects").join(&hex[..2]).join(&hex),
    )
    .unwrap();

    let result = store.read_object(&write.id).await;
    assert!(matches!(result, Err(Error::MalformedObject { .. })));
}
