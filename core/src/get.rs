//! Extraction engine: materialize a stored object subtree onto the
//! filesystem with bounded concurrency and strict validation.

use crate::error::{Error, Result};
use crate::object::{self, ChunkEntry, EntryKind, FileEntry};
use crate::store::ObjectStore;
use crate::task::Scheduler;
use crate::types::{AccessMode, ObjectId, ObjectType};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::error;

#[derive(Debug, Clone, Copy, Default)]
pub struct GetSettings {
    /// Drop the directory structure encoded in top-level snapshot entries
    /// and keep only the final path component of each.
    pub flat: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct ExtractOptions {
    allow_separators: bool,
    flatten: bool,
}

struct GetContext {
    store: Arc<dyn ObjectStore>,
    scheduler: Scheduler,
    restored: AtomicI64,
}

/// Reconstruct the object graph rooted at `id` under `dest` and return the
/// number of file bytes written.
///
/// The destination must be empty or absent. A failing entry aborts its own
/// subtree; sibling subtrees already dispatched run to completion, so the
/// caller gets partial output plus an error rather than a silent partial
/// success.
pub async fn get(
    store: Arc<dyn ObjectStore>,
    scheduler: &Scheduler,
    id: &ObjectId,
    settings: &GetSettings,
    dest: &Path,
) -> Result<i64> {
    if store.mode() != AccessMode::Full {
        return Err(Error::InsufficientPermissions);
    }

    let ctx = Arc::new(GetContext {
        store,
        scheduler: scheduler.clone(),
        restored: AtomicI64::new(0),
    });

    let (kind, payload) = ctx.read_object(id).await?;

    match kind {
        ObjectType::Chunk | ObjectType::File => {
            check_file_destination(dest)?;
            ctx.clone()
                .get_file(*id, kind, payload, dest.to_path_buf())
                .await?;
        }
        ObjectType::Directory1 | ObjectType::Directory2 => {
            prepare_destination_dir(dest).await?;
            ctx.clone()
                .extract_entries(
                    *id,
                    kind,
                    payload,
                    ExtractOptions::default(),
                    dest.to_path_buf(),
                )
                .await?;
        }
        ObjectType::Snapshot1 | ObjectType::Snapshot2 => {
            prepare_destination_dir(dest).await?;
            object::decode_snapshot_header(id, &payload)?;

            let entries = payload.slice(object::SNAPSHOT_HEADER_LEN..);
            let options = ExtractOptions {
                allow_separators: true,
                flatten: settings.flat,
            };
            ctx.clone()
                .extract_entries(*id, kind, entries, options, dest.to_path_buf())
                .await?;
        }
        ObjectType::Link => {
            check_file_destination(dest)?;
            let target = link_target(id, &payload)?;
            create_symlink(&target, dest).await?;
        }
    }

    Ok(ctx.restored.load(Ordering::Relaxed))
}

impl GetContext {
    async fn read_object(&self, id: &ObjectId) -> Result<(ObjectType, Bytes)> {
        let _slot = self.scheduler.slot().await?;
        self.store.read_object(id).await
    }

    /// Extract every entry of a directory or snapshot payload into `dest`,
    /// one concurrent task per entry. Returns once the whole subtree has
    /// been materialized.
    fn extract_entries(
        self: Arc<Self>,
        owner: ObjectId,
        kind: ObjectType,
        payload: Bytes,
        options: ExtractOptions,
        dest: PathBuf,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>> {
        Box::pin(async move {
            let mut scope = self.scheduler.scope();
            let mut failure: Option<Error> = None;

            for decoded in object::decode_file_entries(&owner, kind, &payload)? {
                let entry = match decoded {
                    Ok(entry) => entry,
                    Err(err) => {
                        error!(object = %owner, "bad entry in directory object: {err}");
                        failure = Some(err);
                        break;
                    }
                };

                if let Err(err) = object::validate_entry_name(&entry.name, options.allow_separators)
                {
                    error!(object = %owner, name = %entry.name, "refusing to extract entry: {err}");
                    failure = Some(err);
                    break;
                }

                let entry_path = if options.flatten {
                    dest.join(entry.name.rsplit('/').next().unwrap_or(&entry.name))
                } else {
                    let path = dest.join(&entry.name);
                    if options.allow_separators {
                        // Top-level snapshot entries may encode nested relative
                        // paths; their intermediate directories are created here,
                        // before any task depends on them.
                        if let Some(parent) = path.parent() {
                            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                                failure = Some(err.into());
                                break;
                            }
                        }
                    }
                    path
                };

                let ctx = self.clone();
                let entry_id = entry.id;
                let entry_name = entry.name.clone();
                let log_path = entry_path.clone();
                scope.spawn(async move {
                    ctx.extract_entry(entry, entry_path)
                        .await
                        .inspect_err(|err| {
                            error!(
                                object = %entry_id,
                                name = %entry_name,
                                path = %log_path.display(),
                                "extraction failed: {err}"
                            );
                        })
                });
            }

            // Entries already dispatched keep running even when a later entry
            // failed to validate.
            let synced = scope.sync().await;
            match failure {
                Some(err) => Err(err),
                None => synced,
            }
        })
    }

    async fn extract_entry(self: Arc<Self>, entry: FileEntry, path: PathBuf) -> Result<()> {
        let (kind, payload) = self.read_object(&entry.id).await?;

        match entry.kind {
            EntryKind::Directory => {
                if !kind.is_directory() {
                    return Err(Error::TypeMismatch {
                        id: entry.id.to_hex(),
                        expected: "directory",
                    });
                }

                // The directory must exist before its children's tasks are
                // scheduled.
                tokio::fs::create_dir_all(&path).await?;

                self.clone()
                    .extract_entries(entry.id, kind, payload, ExtractOptions::default(), path)
                    .await
            }
            EntryKind::File => {
                if kind != ObjectType::File && kind != ObjectType::Chunk {
                    return Err(Error::TypeMismatch {
                        id: entry.id.to_hex(),
                        expected: "file",
                    });
                }
                self.get_file(entry.id, kind, payload, path).await
            }
            EntryKind::Link => {
                if kind != ObjectType::Link {
                    return Err(Error::TypeMismatch {
                        id: entry.id.to_hex(),
                        expected: "link",
                    });
                }
                let target = link_target(&entry.id, &payload)?;
                create_symlink(&target, &path).await
            }
        }
    }

    /// Reconstruct one file. A `File` object is pre-sized to its declared
    /// length, then every chunk is written concurrently at its own offset;
    /// the offsets are disjoint by construction so no write serializes
    /// with another.
    async fn get_file(
        self: Arc<Self>,
        id: ObjectId,
        kind: ObjectType,
        payload: Bytes,
        path: PathBuf,
    ) -> Result<()> {
        let file = tokio::fs::File::create(&path).await?;

        let file_len = match kind {
            ObjectType::File => {
                let (entries, file_len) = object::decode_chunk_entries(&id, &payload)?;

                // Reserve the destination before any chunk task runs.
                file.set_len(file_len as u64).await?;
                let file = Arc::new(file.into_std().await);

                let mut scope = self.scheduler.scope();
                for entry in &entries {
                    let entry = *entry;
                    let ctx = self.clone();
                    let file = file.clone();
                    let log_path = path.clone();
                    scope.spawn(async move {
                        ctx.write_chunk(entry, file).await.inspect_err(|err| {
                            error!(
                                object = %entry.id,
                                path = %log_path.display(),
                                "failed to restore chunk: {err}"
                            );
                        })
                    });
                }
                scope.sync().await?;

                // The trailer decoded fine, but it must also agree with the
                // entries that were actually present.
                let end = entries
                    .last()
                    .map(|entry| entry.offset + entry.len)
                    .unwrap_or(0);
                if end != file_len {
                    return Err(Error::SizeMismatch {
                        id: id.to_hex(),
                        expected: file_len,
                        actual: end,
                    });
                }

                flush_file(file).await?;
                file_len
            }
            ObjectType::Chunk => {
                let file = Arc::new(file.into_std().await);
                let len = payload.len() as i64;

                {
                    let _slot = self.scheduler.slot().await?;
                    write_at(file.clone(), 0, payload).await?;
                }

                flush_file(file).await?;
                len
            }
            _ => {
                return Err(Error::TypeMismatch {
                    id: id.to_hex(),
                    expected: "file",
                });
            }
        };

        self.restored.fetch_add(file_len, Ordering::Relaxed);
        Ok(())
    }

    async fn write_chunk(&self, entry: ChunkEntry, file: Arc<std::fs::File>) -> Result<()> {
        if entry.offset < 0 || entry.len < 0 {
            return Err(Error::MalformedObject {
                id: entry.id.to_hex(),
                reason: "negative chunk offset or length".to_string(),
            });
        }

        let _slot = self.scheduler.slot().await?;

        let (kind, data) = self.store.read_object(&entry.id).await?;
        if kind != ObjectType::Chunk {
            return Err(Error::TypeMismatch {
                id: entry.id.to_hex(),
                expected: "chunk",
            });
        }
        if data.len() as i64 != entry.len {
            return Err(Error::SizeMismatch {
                id: entry.id.to_hex(),
                expected: entry.len,
                actual: data.len() as i64,
            });
        }

        write_at(file, entry.offset as u64, data).await
    }
}

fn link_target(id: &ObjectId, payload: &[u8]) -> Result<String> {
    std::str::from_utf8(payload)
        .map(str::to_string)
        .map_err(|_| Error::MalformedObject {
            id: id.to_hex(),
            reason: "link target is not valid UTF-8".to_string(),
        })
}

fn check_file_destination(path: &Path) -> Result<()> {
    if std::fs::symlink_metadata(path).is_ok() {
        return Err(Error::DestinationNotEmpty {
            path: path.display().to_string(),
        });
    }
    Ok(())
}

async fn prepare_destination_dir(path: &Path) -> Result<()> {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                Err(Error::DestinationNotEmpty {
                    path: path.display().to_string(),
                })
            } else {
                Ok(())
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(path).await?;
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotADirectory => {
            Err(Error::DestinationNotEmpty {
                path: path.display().to_string(),
            })
        }
        Err(err) => Err(err.into()),
    }
}

async fn write_at(file: Arc<std::fs::File>, offset: u64, data: Bytes) -> Result<()> {
    let result = tokio::task::spawn_blocking(move || write_at_blocking(&file, offset, &data))
        .await
        .map_err(|err| Error::Task(err.to_string()))?;
    Ok(result?)
}

#[cfg(unix)]
fn write_at_blocking(file: &std::fs::File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_at_blocking(file: &std::fs::File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut offset = offset;
    let mut data = data;
    while !data.is_empty() {
        let written = file.seek_write(data, offset)?;
        offset += written as u64;
        data = &data[written..];
    }
    Ok(())
}

async fn flush_file(file: Arc<std::fs::File>) -> Result<()> {
    let result = tokio::task::spawn_blocking(move || file.sync_all())
        .await
        .map_err(|err| Error::Task(err.to_string()))?;
    Ok(result?)
}

#[cfg(unix)]
async fn create_symlink(target: &str, path: &Path) -> Result<()> {
    tokio::fs::symlink(target, path).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn create_symlink(target: &str, path: &Path) -> Result<()> {
    tracing::warn!(
        path = %path.display(),
        target,
        "symbolic links are not supported on this platform, skipping"
    );
    Ok(())
}
