use async_trait::async_trait;
use bytes::Bytes;
use coffre_core::crypto::{Encryptor, MasterKey};
use coffre_core::store::ObjectWrite;
use coffre_core::{
    AccessMode, Error, KeyFile, ObjectId, ObjectStore, ObjectType, RepoConfig, Result,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tracing::warn;

/// Framing overhead per blob: type tag byte + AEAD nonce + AEAD tag.
const BLOB_OVERHEAD: u64 = 1 + 12 + 16;

/// Content-addressed object store on a local filesystem.
///
/// Every object is one encrypted blob file keyed by the hex digest of its
/// plaintext payload, so identical content lands on the same path and the
/// second write is skipped.
///
/// # Repository layout
///
/// ```text
/// repository/
/// ├── config          # Repository configuration (JSON)
/// ├── keys/           # Password-wrapped data keys: full, write
/// ├── objects/        # One blob per object, fanned out by digest prefix
/// └── tags/           # Tag files naming snapshot root objects
/// ```
pub struct LocalStore {
    root: PathBuf,
    encryptor: Encryptor,
    mode: AccessMode,
}

impl LocalStore {
    /// Initialize a new repository: directory layout, fresh data key, and
    /// one wrapped key file per capability class. The full password
    /// unlocks reads and writes; the write-only password lets a backup
    /// agent add data without being able to read anything back.
    pub async fn init<P: AsRef<Path>>(
        path: P,
        full_password: &str,
        write_password: &str,
    ) -> Result<Self> {
        let root = path.as_ref().to_path_buf();

        if root.join("config").exists() {
            return Err(Error::RepositoryExists {
                path: root.display().to_string(),
            });
        }

        fs::create_dir_all(&root).await?;
        fs::create_dir_all(root.join("objects")).await?;
        fs::create_dir_all(root.join("keys")).await?;
        fs::create_dir_all(root.join("tags")).await?;

        let config = RepoConfig::default();
        let data_key = MasterKey::generate();

        let keys = [
            ("full", full_password, AccessMode::Full),
            ("write", write_password, AccessMode::WriteOnly),
        ];
        for (file_name, password, mode) in keys {
            let master = MasterKey::derive_from_password(
                password,
                &config.kdf_params.salt,
                &config.kdf_params,
            )?;
            let key_encryptor = Encryptor::new(master.as_bytes())?;
            let key_file = KeyFile {
                mode,
                encrypted_key: key_encryptor.encrypt(data_key.as_bytes())?,
                kdf_params: config.kdf_params.clone(),
            };
            let key_json = serde_json::to_string_pretty(&key_file)?;
            fs::write(root.join("keys").join(file_name), key_json).await?;
        }

        let config_json = serde_json::to_string_pretty(&config)?;
        fs::write(root.join("config"), config_json).await?;

        let encryptor = Encryptor::new(data_key.as_bytes())?;
        Ok(Self {
            root,
            encryptor,
            mode: AccessMode::Full,
        })
    }

    /// Open an existing repository. The access mode is whatever capability
    /// class the password unlocks.
    pub async fn open<P: AsRef<Path>>(path: P, password: &str) -> Result<Self> {
        let root = path.as_ref().to_path_buf();

        if !root.join("config").exists() {
            return Err(Error::RepositoryNotFound {
                path: root.display().to_string(),
            });
        }

        let config_data = fs::read_to_string(root.join("config")).await?;
        let config: RepoConfig = serde_json::from_str(&config_data)?;
        if config.version != 1 {
            return Err(Error::InvalidFormatVersion {
                version: config.version,
            });
        }

        let mut key_entries = fs::read_dir(root.join("keys")).await?;
        while let Some(entry) = key_entries.next_entry().await? {
            let key_data = fs::read_to_string(entry.path()).await?;
            let Ok(key_file) = serde_json::from_str::<KeyFile>(&key_data) else {
                continue;
            };

            let master = MasterKey::derive_from_password(
                password,
                &key_file.kdf_params.salt,
                &key_file.kdf_params,
            )?;
            let key_encryptor = Encryptor::new(master.as_bytes())?;
            let Ok(data_key) = key_encryptor.decrypt(&key_file.encrypted_key) else {
                continue;
            };

            let encryptor = Encryptor::new(&data_key)?;
            return Ok(Self {
                root,
                encryptor,
                mode: key_file.mode,
            });
        }

        Err(Error::InvalidPassword)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join("objects").join(&hex[..2]).join(&hex)
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn read_object(&self, id: &ObjectId) -> Result<(ObjectType, Bytes)> {
        if self.mode != AccessMode::Full {
            return Err(Error::InsufficientPermissions);
        }

        let path = self.object_path(id);
        let blob = match fs::read(&path).await {
            Ok(blob) => blob,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound { id: id.to_hex() });
            }
            Err(err) => {
                return Err(Error::Backend(format!("failed to read object '{id}': {err}")));
            }
        };

        let Some((&tag, ciphertext)) = blob.split_first() else {
            return Err(Error::MalformedObject {
                id: id.to_hex(),
                reason: "empty blob".to_string(),
            });
        };
        let kind = ObjectType::from_tag(tag).ok_or_else(|| Error::MalformedObject {
            id: id.to_hex(),
            reason: format!("unknown object type tag {tag:#04x}"),
        })?;

        let plaintext = self.encryptor.decrypt(ciphertext)?;
        if ObjectId::from_data(&plaintext) != *id {
            return Err(Error::MalformedObject {
                id: id.to_hex(),
                reason: "content does not match its digest".to_string(),
            });
        }

        Ok((kind, Bytes::from(plaintext)))
    }

    async fn write_object(&self, kind: ObjectType, data: &[u8]) -> Result<ObjectWrite> {
        let id = ObjectId::from_data(data);
        let len = data.len() as u64 + BLOB_OVERHEAD;

        let path = self.object_path(&id);
        match fs::try_exists(&path).await {
            Ok(true) => return Ok(ObjectWrite { id, len, new: false }),
            Ok(false) => {}
            Err(err) => {
                return Err(Error::Backend(format!(
                    "failed to probe object '{id}': {err}"
                )));
            }
        }

        let mut blob = Vec::with_capacity(len as usize);
        blob.push(kind.as_tag());
        blob.extend_from_slice(&self.encryptor.encrypt(data)?);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &blob)
            .await
            .map_err(|err| Error::Backend(format!("failed to write object '{id}': {err}")))?;

        Ok(ObjectWrite { id, len, new: true })
    }

    async fn list_tags(&self) -> Result<Vec<ObjectId>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(self.root.join("tags")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                warn!(tag = %file_name.to_string_lossy(), "ignoring malformed tag file");
                continue;
            };
            match ObjectId::from_str(name) {
                Ok(id) => ids.push(id),
                Err(_) => warn!(tag = name, "ignoring malformed tag file"),
            }
        }
        Ok(ids)
    }

    async fn tag_snapshot(&self, id: &ObjectId, name: &str) -> Result<()> {
        let path = self.root.join("tags").join(id.to_hex());
        fs::write(&path, name.as_bytes())
            .await
            .map_err(|err| Error::Backend(format!("failed to tag snapshot '{id}': {err}")))?;
        Ok(())
    }

    fn mode(&self) -> AccessMode {
        self.mode
    }
}
