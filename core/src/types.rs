use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Content digest of an object's plaintext payload, used both as the
/// storage key and as the only way to reference another object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_data(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short_string(&self) -> String {
        self.to_hex().chars().take(8).collect()
    }
}

impl From<blake3::Hash> for ObjectId {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl FromStr for ObjectId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        Ok(Self(array))
    }
}

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Stored type tag carried alongside each blob. The tag is not derivable
/// from the id, which hashes the payload only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Chunk,
    File,
    Directory1,
    Directory2,
    Snapshot1,
    Snapshot2,
    Link,
}

impl ObjectType {
    pub fn as_tag(self) -> u8 {
        match self {
            ObjectType::Chunk => 0,
            ObjectType::File => 1,
            ObjectType::Directory1 => 2,
            ObjectType::Directory2 => 3,
            ObjectType::Snapshot1 => 4,
            ObjectType::Snapshot2 => 5,
            ObjectType::Link => 6,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ObjectType::Chunk),
            1 => Some(ObjectType::File),
            2 => Some(ObjectType::Directory1),
            3 => Some(ObjectType::Directory2),
            4 => Some(ObjectType::Snapshot1),
            5 => Some(ObjectType::Snapshot2),
            6 => Some(ObjectType::Link),
            _ => None,
        }
    }

    pub fn is_directory(self) -> bool {
        matches!(self, ObjectType::Directory1 | ObjectType::Directory2)
    }

    pub fn is_snapshot(self) -> bool {
        matches!(self, ObjectType::Snapshot1 | ObjectType::Snapshot2)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectType::Chunk => "chunk",
            ObjectType::File => "file",
            ObjectType::Directory1 => "directory1",
            ObjectType::Directory2 => "directory2",
            ObjectType::Snapshot1 => "snapshot1",
            ObjectType::Snapshot2 => "snapshot2",
            ObjectType::Link => "link",
        };
        write!(f, "{name}")
    }
}

/// Capability class of the key a store was opened with. A write-only key
/// can create backups but never read them back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    Full,
    WriteOnly,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Full => write!(f, "full"),
            AccessMode::WriteOnly => write!(f, "write-only"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: u32,
    pub id: String,
    pub kdf_params: KdfParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub iterations: u32,
    pub memory: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

/// On-disk key file: the repository data key wrapped by a password-derived
/// master key, together with the capability class it grants.
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyFile {
    pub mode: AccessMode,
    pub encrypted_key: Vec<u8>,
    pub kdf_params: KdfParams,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            version: 1,
            id: uuid::Uuid::new_v4().to_string(),
            kdf_params: KdfParams::default(),
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        use rand::RngCore;
        let mut salt = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);

        Self {
            algorithm: "argon2id".to_string(),
            iterations: 1,
            memory: 65536,
            parallelism: 4,
            salt,
        }
    }
}
