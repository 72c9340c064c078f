// Backup and Recovery System
// Checksummed file backups with a persisted catalog, retention and restore

pub mod manager;
pub mod queue;
pub mod retention;
pub mod storage;
pub mod types;

pub use manager::{BackupManager, EventHandler};
pub use queue::{Job, TaskQueue};
pub use retention::{group_by_source, select_for_removal};
pub use storage::{CatalogStore, JsonCatalogStore, MemoryCatalogStore};
pub use types::*;
