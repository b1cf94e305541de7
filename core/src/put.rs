//! Ingest engine: split sources into content-defined chunks, deduplicate
//! by digest, and assemble file, directory and snapshot objects bottom-up.

use crate::chunker::{Chunker, DEFAULT_AVG_CHUNK_SIZE};
use crate::error::{Error, Result};
use crate::object::{self, ChunkEntry, EntryKind, FileEntry, SnapshotHeader};
use crate::store::ObjectStore;
use crate::task::Scheduler;
use crate::types::{ObjectId, ObjectType};
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;
use tracing::error;

#[derive(Debug, Clone)]
pub struct PutSettings {
    /// Human-discoverable snapshot name written into the header and bound
    /// to the root id as a tag.
    pub name: String,
    pub chunk_avg_size: u32,
    /// Snapshot time in unix seconds; the current time when unset.
    pub time: Option<i64>,
}

impl Default for PutSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            chunk_avg_size: DEFAULT_AVG_CHUNK_SIZE,
            time: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PutStats {
    /// Logical bytes described by the snapshot.
    pub len: i64,
    /// Encoded bytes backing the snapshot's object graph, shared objects
    /// counted once per reference.
    pub stored: i64,
    /// Encoded bytes physically written by this run; dedup hits excluded.
    pub written: i64,
}

struct PutContext {
    store: Arc<dyn ObjectStore>,
    scheduler: Scheduler,
    chunker: Chunker,
    stored: AtomicI64,
    written: AtomicI64,
}

/// Back up `paths` as one snapshot, tag its root object and return the
/// root id. Identical content is stored once no matter how many files or
/// snapshots reference it.
pub async fn put(
    store: Arc<dyn ObjectStore>,
    scheduler: &Scheduler,
    settings: &PutSettings,
    paths: &[PathBuf],
) -> Result<(ObjectId, PutStats)> {
    if paths.is_empty() {
        return Err(Error::Other("nothing to back up".to_string()));
    }

    let ctx = Arc::new(PutContext {
        store,
        scheduler: scheduler.clone(),
        chunker: Chunker::new(settings.chunk_avg_size),
        stored: AtomicI64::new(0),
        written: AtomicI64::new(0),
    });

    let slots: Arc<Mutex<Vec<Option<(FileEntry, i64)>>>> =
        Arc::new(Mutex::new(vec![None; paths.len()]));
    let mut scope = ctx.scheduler.scope();
    let mut failure = None;

    for (index, path) in paths.iter().enumerate() {
        // Top-level entries may encode nested relative paths; everything
        // else about the name rules still applies.
        let name = match snapshot_entry_name(path)
            .and_then(|name| object::validate_entry_name(&name, true).map(|_| name))
        {
            Ok(name) => name,
            Err(err) => {
                error!(path = %path.display(), "refusing to back up: {err}");
                failure = Some(err);
                break;
            }
        };

        let ctx = ctx.clone();
        let path = path.clone();
        let slots = slots.clone();
        scope.spawn(async move {
            let meta = tokio::fs::symlink_metadata(&path).await?;
            let (kind, id, len) = ctx.store_path(path.clone()).await.inspect_err(|err| {
                error!(path = %path.display(), "backup failed: {err}");
            })?;
            let entry = entry_from_metadata(kind, id, name, &meta);
            slots.lock().await[index] = Some((entry, len));
            Ok(())
        });
    }

    // Paths already dispatched finish before the failure is reported.
    let synced = scope.sync().await;
    if let Some(err) = failure {
        return Err(err);
    }
    synced?;

    let slots = slots.lock().await;
    let mut entries_buf = Vec::new();
    let mut total_len = 0i64;
    for slot in slots.iter() {
        let (entry, len) = slot
            .as_ref()
            .ok_or_else(|| Error::Task("missing backup result".to_string()))?;
        total_len += len;
        object::encode_file_entry(&mut entries_buf, entry);
    }

    // `stored` is a pure function of the backed-up content, which keeps
    // the snapshot payload, and therefore the root id, deterministic.
    let header = SnapshotHeader {
        name: settings.name.clone(),
        time: settings.time.unwrap_or_else(unix_now),
        len: total_len,
        stored: ctx.stored.load(Ordering::SeqCst),
    };

    let mut payload = Vec::with_capacity(object::SNAPSHOT_HEADER_LEN + entries_buf.len());
    object::encode_snapshot_header(&mut payload, &header)?;
    payload.extend_from_slice(&entries_buf);

    let id = ctx.write_object(ObjectType::Snapshot2, &payload).await?;
    ctx.store.tag_snapshot(&id, &header.name).await?;

    let stats = PutStats {
        len: total_len,
        stored: ctx.stored.load(Ordering::SeqCst),
        written: ctx.written.load(Ordering::SeqCst),
    };
    Ok((id, stats))
}

impl PutContext {
    async fn store_path(self: Arc<Self>, path: PathBuf) -> Result<(EntryKind, ObjectId, i64)> {
        let meta = tokio::fs::symlink_metadata(&path).await?;

        if meta.is_dir() {
            let (id, len) = self.store_directory(path).await?;
            Ok((EntryKind::Directory, id, len))
        } else if meta.is_symlink() {
            let id = self.store_link(&path).await?;
            Ok((EntryKind::Link, id, 0))
        } else {
            let (id, len) = self.store_file(&path).await?;
            Ok((EntryKind::File, id, len))
        }
    }

    /// Children first: a directory object cannot be written until every
    /// child id is known.
    fn store_directory(
        self: Arc<Self>,
        path: PathBuf,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(ObjectId, i64)>> + Send>> {
        Box::pin(async move {
            let mut children: Vec<(String, PathBuf, std::fs::Metadata)> = Vec::new();
            let mut reader = tokio::fs::read_dir(&path).await?;
            while let Some(dirent) = reader.next_entry().await? {
                let name = dirent
                    .file_name()
                    .to_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::UnsafeName {
                        name: dirent.file_name().to_string_lossy().into_owned(),
                    })?;
                object::validate_entry_name(&name, false)?;

                let meta = dirent.metadata().await?;
                children.push((name, dirent.path(), meta));
            }

            // Identical trees must produce identical payloads, and therefore
            // identical ids.
            children.sort_by(|a, b| a.0.cmp(&b.0));

            let slots: Arc<Mutex<Vec<Option<(EntryKind, ObjectId, i64)>>>> =
                Arc::new(Mutex::new(vec![None; children.len()]));
            let mut scope = self.scheduler.scope();

            for (index, (_, child_path, _)) in children.iter().enumerate() {
                let ctx = self.clone();
                let child_path = child_path.clone();
                let slots = slots.clone();
                scope.spawn(async move {
                    let result = ctx
                        .store_path(child_path.clone())
                        .await
                        .inspect_err(|err| {
                            error!(path = %child_path.display(), "failed to back up entry: {err}");
                        })?;
                    slots.lock().await[index] = Some(result);
                    Ok(())
                });
            }
            scope.sync().await?;

            let slots = slots.lock().await;
            let mut payload = Vec::new();
            let mut total = 0i64;
            for ((name, _, meta), slot) in children.iter().zip(slots.iter()) {
                let (kind, id, len) =
                    slot.ok_or_else(|| Error::Task("missing backup result".to_string()))?;
                total += len;
                let entry = entry_from_metadata(kind, id, name.clone(), meta);
                object::encode_file_entry(&mut payload, &entry);
            }

            let id = self.write_object(ObjectType::Directory2, &payload).await?;
            Ok((id, total))
        })
    }

    async fn store_file(self: Arc<Self>, path: &Path) -> Result<(ObjectId, i64)> {
        let data = Bytes::from(tokio::fs::read(path).await?);
        let file_len = data.len() as i64;
        let chunks = self.chunker.chunk_data(&data);

        let slots: Arc<Mutex<Vec<Option<ObjectId>>>> =
            Arc::new(Mutex::new(vec![None; chunks.len()]));
        let mut scope = self.scheduler.scope();

        for (index, chunk) in chunks.iter().enumerate() {
            let ctx = self.clone();
            let data = chunk.data.clone();
            let slots = slots.clone();
            scope.spawn(async move {
                let id = ctx.write_object(ObjectType::Chunk, &data).await?;
                slots.lock().await[index] = Some(id);
                Ok(())
            });
        }
        scope.sync().await?;

        let slots = slots.lock().await;
        let mut entries = Vec::with_capacity(chunks.len());
        for (chunk, id) in chunks.iter().zip(slots.iter()) {
            let id = id.ok_or_else(|| Error::Task("missing chunk id".to_string()))?;
            entries.push(ChunkEntry {
                id,
                offset: chunk.offset as i64,
                len: chunk.len() as i64,
            });
        }

        let payload = object::encode_chunk_entries(&entries, file_len)?;
        let id = self.write_object(ObjectType::File, &payload).await?;
        Ok((id, file_len))
    }

    async fn store_link(&self, path: &Path) -> Result<ObjectId> {
        let target = tokio::fs::read_link(path).await?;
        let target = target.to_str().ok_or_else(|| {
            Error::Other(format!(
                "link target of '{}' is not valid UTF-8",
                path.display()
            ))
        })?;
        self.write_object(ObjectType::Link, target.as_bytes()).await
    }

    /// The dedup point: the store skips the physical write when the
    /// digest already exists.
    async fn write_object(&self, kind: ObjectType, data: &[u8]) -> Result<ObjectId> {
        let _slot = self.scheduler.slot().await?;
        let write = self.store.write_object(kind, data).await?;
        self.stored.fetch_add(write.len as i64, Ordering::Relaxed);
        if write.new {
            self.written.fetch_add(write.len as i64, Ordering::Relaxed);
        }
        Ok(write.id)
    }
}

/// Relative snapshot-entry name for a source path: root and current-dir
/// components are dropped, parent-dir components are refused.
fn snapshot_entry_name(path: &Path) -> Result<String> {
    let unsafe_name = || Error::UnsafeName {
        name: path.display().to_string(),
    };

    let mut parts: Vec<&str> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(unsafe_name)?),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return Err(unsafe_name()),
        }
    }

    if parts.is_empty() {
        return Err(unsafe_name());
    }
    Ok(parts.join("/"))
}

fn entry_from_metadata(
    kind: EntryKind,
    id: ObjectId,
    name: String,
    meta: &std::fs::Metadata,
) -> FileEntry {
    let unix_seconds = |time: std::io::Result<std::time::SystemTime>| {
        time.ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    };
    let mtime = unix_seconds(meta.modified());
    let btime = unix_seconds(meta.created());

    #[cfg(unix)]
    let (mode, uid, gid) = {
        use std::os::unix::fs::MetadataExt;
        (meta.mode(), meta.uid(), meta.gid())
    };
    #[cfg(not(unix))]
    let (mode, uid, gid) = (if meta.is_dir() { 0o755 } else { 0o644 }, 0, 0);

    FileEntry {
        kind,
        id,
        name,
        mtime,
        btime,
        mode,
        uid,
        gid,
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
