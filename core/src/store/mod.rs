// Store module: key/value backends, persisted settings and dedup windows

pub mod backend;
pub mod recent;
pub mod settings;

pub use backend::{MemoryStorage, SledStorage, StorageBackend, StorageError};
pub use recent::RecentIds;
pub use settings::{SettingsError, SettingsStore};
