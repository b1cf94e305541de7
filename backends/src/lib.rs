pub mod local;
pub mod memory;
pub mod retry;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use retry::{RetryConfig, Retryable, RetryingStore, retry_with_backoff};
