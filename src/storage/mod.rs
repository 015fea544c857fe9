pub mod backend;
pub mod events;

pub use backend::{FileStorage, MemoryStorage, StorageBackend, StorageError};
pub use events::{SharedStorage, StorageChange, StorageSubscription};
