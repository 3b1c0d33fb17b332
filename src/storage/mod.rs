// src/storage/mod.rs

pub mod file;
pub mod key_record;
pub mod memory;
pub mod traits;

pub use file::JsonFileStore;
pub use key_record::{preview, KeyRecord, PersistedKey, QuotaUsage, RemainingQuota};
pub use memory::InMemoryStore;
pub use traits::KeyStore;
