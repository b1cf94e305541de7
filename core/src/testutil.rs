//! In-memory instrumented store used by the engine tests.

use crate::error::{Error, Result};
use crate::store::{ObjectStore, ObjectWrite};
use crate::types::{AccessMode, ObjectId, ObjectType};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) struct MockStore {
    objects: Mutex<HashMap<ObjectId, (ObjectType, Bytes)>>,
    tags: Mutex<Vec<(ObjectId, String)>>,
    mode: AccessMode,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MockStore {
    pub fn new() -> Self {
        Self::with_mode(AccessMode::Full)
    }

    pub fn with_mode(mode: AccessMode) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            tags: Mutex::new(Vec::new()),
            mode,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, kind: ObjectType, data: Vec<u8>) -> ObjectId {
        let id = ObjectId::from_data(&data);
        self.objects
            .lock()
            .unwrap()
            .insert(id, (kind, Bytes::from(data)));
        id
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Physical writes, dedup hits excluded.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn count_kind(&self, kind: ObjectType) -> usize {
        self.objects
            .lock()
            .unwrap()
            .values()
            .filter(|(stored, _)| *stored == kind)
            .count()
    }
}

#[async_trait]
impl ObjectStore for MockStore {
    async fn read_object(&self, id: &ObjectId) -> Result<(ObjectType, Bytes)> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound { id: id.to_hex() })
    }

    async fn write_object(&self, kind: ObjectType, data: &[u8]) -> Result<ObjectWrite> {
        let id = ObjectId::from_data(data);
        let len = data.len() as u64;
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&id) {
            return Ok(ObjectWrite { id, len, new: false });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        objects.insert(id, (kind, Bytes::copy_from_slice(data)));
        Ok(ObjectWrite { id, len, new: true })
    }

    async fn list_tags(&self) -> Result<Vec<ObjectId>> {
        Ok(self.tags.lock().unwrap().iter().map(|(id, _)| *id).collect())
    }

    async fn tag_snapshot(&self, id: &ObjectId, name: &str) -> Result<()> {
        self.tags.lock().unwrap().push((*id, name.to_string()));
        Ok(())
    }

    fn mode(&self) -> AccessMode {
        self.mode
    }
}
