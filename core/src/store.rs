use crate::error::Result;
use crate::types::{AccessMode, ObjectId, ObjectType};
use async_trait::async_trait;
use bytes::Bytes;

/// Outcome of an idempotent object write.
#[derive(Debug, Clone, Copy)]
pub struct ObjectWrite {
    pub id: ObjectId,
    /// Encoded size of the blob in the backend. Must be a pure function
    /// of the payload so repeated backups of identical content stay
    /// byte-identical.
    pub len: u64,
    /// False when identical content was already present (dedup hit).
    pub new: bool,
}

/// Content-addressed blob store consumed by the ingest, extraction and
/// catalog engines. Implementations must be safe for concurrent use and
/// must not retry failed operations on behalf of the engines.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the plaintext payload of `id` together with its stored type
    /// tag. Fails with `NotFound` when no such object exists.
    async fn read_object(&self, id: &ObjectId) -> Result<(ObjectType, Bytes)>;

    /// Store `data` under its content digest. Idempotent: writing
    /// identical content twice returns the same id and performs at most
    /// one physical write.
    async fn write_object(&self, kind: ObjectType, data: &[u8]) -> Result<ObjectWrite>;

    /// Ids of all tagged snapshot roots.
    async fn list_tags(&self) -> Result<Vec<ObjectId>>;

    /// Bind a human-discoverable name to a snapshot root.
    async fn tag_snapshot(&self, id: &ObjectId, name: &str) -> Result<()>;

    /// Capability class of the key this store was opened with.
    fn mode(&self) -> AccessMode;
}
