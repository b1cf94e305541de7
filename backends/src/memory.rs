use async_trait::async_trait;
use bytes::Bytes;
use coffre_core::store::ObjectWrite;
use coffre_core::{AccessMode, Error, ObjectId, ObjectStore, ObjectType, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Ephemeral in-memory object store.
///
/// Mostly useful for tests and scratch runs; the read and physical-write
/// counters make dedup and capability-gate behavior observable.
pub struct MemoryStore {
    objects: Mutex<HashMap<ObjectId, (ObjectType, Bytes)>>,
    tags: Mutex<Vec<(ObjectId, String)>>,
    mode: AccessMode,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_mode(AccessMode::Full)
    }

    pub fn with_mode(mode: AccessMode) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            tags: Mutex::new(Vec::new()),
            mode,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Physical writes performed; dedup hits are not counted.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().expect("store poisoned").len()
    }

    pub fn count_kind(&self, kind: ObjectType) -> usize {
        self.objects
            .lock()
            .expect("store poisoned")
            .values()
            .filter(|(stored, _)| *stored == kind)
            .count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn read_object(&self, id: &ObjectId) -> Result<(ObjectType, Bytes)> {
        if self.mode != AccessMode::Full {
            return Err(Error::InsufficientPermissions);
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .expect("store poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound { id: id.to_hex() })
    }

    async fn write_object(&self, kind: ObjectType, data: &[u8]) -> Result<ObjectWrite> {
        let id = ObjectId::from_data(data);
        let len = data.len() as u64;

        let mut objects = self.objects.lock().expect("store poisoned");
        if objects.contains_key(&id) {
            return Ok(ObjectWrite { id, len, new: false });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        objects.insert(id, (kind, Bytes::copy_from_slice(data)));
        Ok(ObjectWrite { id, len, new: true })
    }

    async fn list_tags(&self) -> Result<Vec<ObjectId>> {
        Ok(self
            .tags
            .lock()
            .expect("store poisoned")
            .iter()
            .map(|(id, _)| *id)
            .collect())
    }

    async fn tag_snapshot(&self, id: &ObjectId, name: &str) -> Result<()> {
        self.tags
            .lock()
            .expect("store poisoned")
            .push((*id, name.to_string()));
        Ok(())
    }

    fn mode(&self) -> AccessMode {
        self.mode
    }
}
