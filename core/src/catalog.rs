//! Snapshot listing and read-only tree walking.

use crate::error::{Error, Result};
use crate::object::{self, EntryKind};
use crate::store::ObjectStore;
use crate::task::Scheduler;
use crate::types::{AccessMode, ObjectId, ObjectType};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub id: ObjectId,
    pub name: Option<String>,
    pub time: i64,
    /// Logical bytes described by the snapshot.
    pub len: i64,
    /// Encoded bytes backing the snapshot, its own object included.
    pub stored: i64,
}

/// Decode every tagged snapshot, oldest first. Tags that do not resolve
/// to a well-formed snapshot are logged and skipped rather than failing
/// the whole listing.
pub async fn list_snapshots(
    store: Arc<dyn ObjectStore>,
    scheduler: &Scheduler,
) -> Result<Vec<SnapshotInfo>> {
    if store.mode() != AccessMode::Full {
        return Err(Error::InsufficientPermissions);
    }

    let ids = store.list_tags().await?;

    let snapshots = Arc::new(Mutex::new(Vec::with_capacity(ids.len())));
    let mut scope = scheduler.scope();

    for id in ids {
        let store = store.clone();
        let scheduler = scheduler.clone();
        let snapshots = snapshots.clone();
        scope.spawn(async move {
            let (kind, payload) = {
                let _slot = scheduler.slot().await?;
                store.read_object(&id).await?
            };

            if !kind.is_snapshot() {
                warn!(object = %id, "object is not a snapshot (ignoring)");
                return Ok(());
            }
            let header = match object::decode_snapshot_header(&id, &payload) {
                Ok(header) => header,
                Err(err) => {
                    warn!(object = %id, "malformed snapshot object (ignoring): {err}");
                    return Ok(());
                }
            };

            snapshots.lock().await.push(SnapshotInfo {
                id,
                name: (!header.name.is_empty()).then(|| header.name.clone()),
                time: header.time,
                len: header.len,
                stored: header.stored + payload.len() as i64,
            });
            Ok(())
        });
    }
    scope.sync().await?;

    let mut snapshots = Arc::try_unwrap(snapshots)
        .map_err(|_| Error::Task("listing tasks still running".to_string()))?
        .into_inner();
    snapshots.sort_by_key(|snapshot| snapshot.time);
    Ok(snapshots)
}

/// One row of a depth-annotated, pre-order object listing.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub depth: usize,
    pub kind: EntryKind,
    pub id: ObjectId,
    pub name: String,
    pub mtime: i64,
    pub mode: u32,
    /// Resolved for readable files only.
    pub size: Option<i64>,
    /// Resolved for readable links only.
    pub target: Option<String>,
    /// Whether the entry's object was read; entries past the depth budget
    /// are listed but not resolved or expanded.
    pub readable: bool,
}

struct TreeContext {
    store: Arc<dyn ObjectStore>,
    scheduler: Scheduler,
}

/// Pre-order walk of the object graph under `id`, the same recursion the
/// extraction engine performs but without filesystem writes. A negative
/// `max_depth` walks without limit.
pub async fn tree(
    store: Arc<dyn ObjectStore>,
    scheduler: &Scheduler,
    id: &ObjectId,
    max_depth: i32,
) -> Result<Vec<TreeEntry>> {
    if store.mode() != AccessMode::Full {
        return Err(Error::InsufficientPermissions);
    }

    let ctx = Arc::new(TreeContext {
        store,
        scheduler: scheduler.clone(),
    });

    let (kind, payload) = ctx.read_object(id).await?;

    match kind {
        ObjectType::Directory1 | ObjectType::Directory2 => {
            ctx.walk_entries(*id, kind, payload, 0, max_depth).await
        }
        ObjectType::Snapshot1 | ObjectType::Snapshot2 => {
            object::decode_snapshot_header(id, &payload)?;
            let entries = payload.slice(object::SNAPSHOT_HEADER_LEN..);
            ctx.walk_entries(*id, kind, entries, 0, max_depth).await
        }
        ObjectType::File => {
            let (_, file_len) = object::decode_chunk_entries(id, &payload)?;
            Ok(vec![root_entry(EntryKind::File, *id, Some(file_len), None)])
        }
        ObjectType::Chunk => Ok(vec![root_entry(
            EntryKind::File,
            *id,
            Some(payload.len() as i64),
            None,
        )]),
        ObjectType::Link => {
            let target = std::str::from_utf8(&payload)
                .map_err(|_| Error::MalformedObject {
                    id: id.to_hex(),
                    reason: "link target is not valid UTF-8".to_string(),
                })?
                .to_string();
            Ok(vec![root_entry(EntryKind::Link, *id, None, Some(target))])
        }
    }
}

fn root_entry(
    kind: EntryKind,
    id: ObjectId,
    size: Option<i64>,
    target: Option<String>,
) -> TreeEntry {
    TreeEntry {
        depth: 0,
        kind,
        id,
        name: id.short_string(),
        mtime: 0,
        mode: 0,
        size,
        target,
        readable: true,
    }
}

impl TreeContext {
    async fn read_object(&self, id: &ObjectId) -> Result<(ObjectType, Bytes)> {
        let _slot = self.scheduler.slot().await?;
        self.store.read_object(id).await
    }

    /// List one directory level, expanding children concurrently while
    /// keeping the emitted order pre-order deterministic.
    fn walk_entries(
        self: Arc<Self>,
        owner: ObjectId,
        kind: ObjectType,
        payload: Bytes,
        depth: usize,
        remaining: i32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<TreeEntry>>> + Send>> {
        Box::pin(async move {
            let mut entries = Vec::new();
            for decoded in object::decode_file_entries(&owner, kind, &payload)? {
                entries.push(decoded?);
            }

            if remaining == 0 {
                // Depth budget exhausted: emit the level without reading.
                return Ok(entries
                    .into_iter()
                    .map(|entry| TreeEntry {
                        depth,
                        kind: entry.kind,
                        id: entry.id,
                        name: entry.name,
                        mtime: entry.mtime,
                        mode: entry.mode,
                        size: None,
                        target: None,
                        readable: false,
                    })
                    .collect());
            }

            let slots: Arc<Mutex<Vec<Option<Vec<TreeEntry>>>>> =
                Arc::new(Mutex::new(vec![None; entries.len()]));
            let mut scope = self.scheduler.scope();

            for (index, entry) in entries.into_iter().enumerate() {
                let ctx = self.clone();
                let slots = slots.clone();
                let next_remaining = if remaining < 0 {
                    remaining
                } else {
                    remaining - 1
                };
                scope.spawn(async move {
                    let rows = ctx.walk_entry(entry, depth, next_remaining).await?;
                    slots.lock().await[index] = Some(rows);
                    Ok(())
                });
            }
            scope.sync().await?;

            let mut slots = slots.lock().await;
            let mut rows = Vec::new();
            for slot in slots.iter_mut() {
                rows.extend(
                    slot.take()
                        .ok_or_else(|| Error::Task("missing tree result".to_string()))?,
                );
            }
            Ok(rows)
        })
    }

    async fn walk_entry(
        self: Arc<Self>,
        entry: object::FileEntry,
        depth: usize,
        remaining: i32,
    ) -> Result<Vec<TreeEntry>> {
        let (kind, payload) = self.read_object(&entry.id).await?;

        let mut row = TreeEntry {
            depth,
            kind: entry.kind,
            id: entry.id,
            name: entry.name,
            mtime: entry.mtime,
            mode: entry.mode,
            size: None,
            target: None,
            readable: true,
        };

        match entry.kind {
            EntryKind::Directory => {
                if !kind.is_directory() {
                    return Err(Error::TypeMismatch {
                        id: entry.id.to_hex(),
                        expected: "directory",
                    });
                }
                let children = self
                    .walk_entries(entry.id, kind, payload, depth + 1, remaining)
                    .await?;

                let mut rows = Vec::with_capacity(children.len() + 1);
                rows.push(row);
                rows.extend(children);
                Ok(rows)
            }
            EntryKind::File => {
                row.size = match kind {
                    ObjectType::File => {
                        let (_, file_len) = object::decode_chunk_entries(&entry.id, &payload)?;
                        Some(file_len)
                    }
                    ObjectType::Chunk => Some(payload.len() as i64),
                    _ => {
                        return Err(Error::TypeMismatch {
                            id: entry.id.to_hex(),
                            expected: "file",
                        });
                    }
                };
                Ok(vec![row])
            }
            EntryKind::Link => {
                if kind != ObjectType::Link {
                    return Err(Error::TypeMismatch {
                        id: entry.id.to_hex(),
                        expected: "link",
                    });
                }
                row.target = Some(
                    std::str::from_utf8(&payload)
                        .map_err(|_| Error::MalformedObject {
                            id: entry.id.to_hex(),
                            reason: "link target is not valid UTF-8".to_string(),
                        })?
                        .to_string(),
                );
                Ok(vec![row])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{FileEntry, SnapshotHeader, encode_file_entry, encode_snapshot_header};
    use crate::testutil::MockStore;

    fn plain_entry(kind: EntryKind, id: ObjectId, name: &str) -> FileEntry {
        FileEntry {
            kind,
            id,
            name: name.to_string(),
            mtime: 0,
            btime: 0,
            mode: 0o644,
            uid: 0,
            gid: 0,
        }
    }

    fn insert_snapshot(store: &MockStore, name: &str, time: i64) -> ObjectId {
        let chunk_id = store.insert(ObjectType::Chunk, format!("data-{name}").into_bytes());

        let mut payload = Vec::new();
        encode_snapshot_header(
            &mut payload,
            &SnapshotHeader {
                name: name.to_string(),
                time,
                len: 9,
                stored: 100,
            },
        )
        .unwrap();
        encode_file_entry(&mut payload, &plain_entry(EntryKind::File, chunk_id, "f"));
        store.insert(ObjectType::Snapshot2, payload)
    }

    #[tokio::test]
    async fn lists_snapshots_sorted_by_time() {
        let store = Arc::new(MockStore::new());
        let late = insert_snapshot(&store, "late", 2000);
        let early = insert_snapshot(&store, "early", 1000);

        let runtime_store: Arc<dyn ObjectStore> = store.clone();
        runtime_store.tag_snapshot(&late, "late").await.unwrap();
        runtime_store.tag_snapshot(&early, "early").await.unwrap();

        let scheduler = Scheduler::new(2);
        let snapshots = list_snapshots(runtime_store, &scheduler).await.unwrap();

        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].name.as_deref(), Some("early"));
        assert_eq!(snapshots[1].name.as_deref(), Some("late"));
        assert!(snapshots[0].stored > 100);
    }

    #[tokio::test]
    async fn skips_tags_that_are_not_snapshots() {
        let store = Arc::new(MockStore::new());
        let good = insert_snapshot(&store, "good", 1);
        let bogus = store.insert(ObjectType::Chunk, b"not a snapshot".to_vec());
        let truncated = store.insert(ObjectType::Snapshot2, vec![0u8; 16]);

        let runtime_store: Arc<dyn ObjectStore> = store.clone();
        runtime_store.tag_snapshot(&good, "good").await.unwrap();
        runtime_store.tag_snapshot(&bogus, "bogus").await.unwrap();
        runtime_store
            .tag_snapshot(&truncated, "truncated")
            .await
            .unwrap();

        let scheduler = Scheduler::new(2);
        let snapshots = list_snapshots(runtime_store, &scheduler).await.unwrap();

        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, good);
    }

    #[tokio::test]
    async fn listing_needs_a_full_key() {
        let store = Arc::new(MockStore::with_mode(AccessMode::WriteOnly));
        let scheduler = Scheduler::new(2);

        let result = list_snapshots(store.clone(), &scheduler).await;
        assert!(matches!(result, Err(Error::InsufficientPermissions)));
        assert_eq!(store.read_count(), 0);
    }

    fn build_nested_tree(store: &MockStore) -> ObjectId {
        let chunk_id = store.insert(ObjectType::Chunk, vec![1u8; 64]);

        let mut deep_payload = Vec::new();
        encode_file_entry(
            &mut deep_payload,
            &plain_entry(EntryKind::File, chunk_id, "leaf.bin"),
        );
        let deep_id = store.insert(ObjectType::Directory2, deep_payload);

        let mut root_payload = Vec::new();
        encode_file_entry(
            &mut root_payload,
            &plain_entry(EntryKind::Directory, deep_id, "deep"),
        );
        encode_file_entry(
            &mut root_payload,
            &plain_entry(EntryKind::File, chunk_id, "top.bin"),
        );
        store.insert(ObjectType::Directory2, root_payload)
    }

    #[tokio::test]
    async fn walks_in_preorder_with_depths() {
        let store = Arc::new(MockStore::new());
        let root_id = build_nested_tree(&store);

        let scheduler = Scheduler::new(4);
        let rows = tree(store, &scheduler, &root_id, -1).await.unwrap();

        let summary: Vec<(usize, &str, bool)> = rows
            .iter()
            .map(|row| (row.depth, row.name.as_str(), row.readable))
            .collect();
        assert_eq!(
            summary,
            vec![
                (0, "deep", true),
                (1, "leaf.bin", true),
                (0, "top.bin", true),
            ]
        );
        assert_eq!(rows[1].size, Some(64));
    }

    #[tokio::test]
    async fn depth_budget_stops_expansion_but_still_lists() {
        let store = Arc::new(MockStore::new());
        let root_id = build_nested_tree(&store);

        let scheduler = Scheduler::new(4);
        let rows = tree(store, &scheduler, &root_id, 1).await.unwrap();

        let summary: Vec<(usize, &str, bool)> = rows
            .iter()
            .map(|row| (row.depth, row.name.as_str(), row.readable))
            .collect();
        assert_eq!(
            summary,
            vec![
                (0, "deep", true),
                (1, "leaf.bin", false),
                (0, "top.bin", true),
            ]
        );
        assert_eq!(rows[1].size, None);
    }

    #[tokio::test]
    async fn depth_zero_lists_the_top_level_unresolved() {
        let store = Arc::new(MockStore::new());
        let root_id = build_nested_tree(&store);

        let scheduler = Scheduler::new(4);
        let rows = tree(store, &scheduler, &root_id, 0).await.unwrap();

        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| !row.readable));
    }
}
