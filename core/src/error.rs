use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Malformed object '{id}': {reason}")]
    MalformedObject { id: String, reason: String },

    #[error("Object '{id}' is not a {expected}")]
    TypeMismatch { id: String, expected: &'static str },

    #[error("Size mismatch for '{id}': expected {expected} bytes, got {actual}")]
    SizeMismatch { id: String, expected: i64, actual: i64 },

    #[error("Unsafe file name '{name}'")]
    UnsafeName { name: String },

    #[error("Object not found: {id}")]
    NotFound { id: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Cannot read from the repository with a write-only key")]
    InsufficientPermissions,

    #[error("Destination '{path}' already exists and is not empty")]
    DestinationNotEmpty { path: String },

    #[error("Repository not found at {path}")]
    RepositoryNotFound { path: String },

    #[error("Repository already exists at {path}")]
    RepositoryExists { path: String },

    #[error("Invalid repository format version: {version}")]
    InvalidFormatVersion { version: u32 },

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Task failed: {0}")]
    Task(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
