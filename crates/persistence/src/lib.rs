#![deny(warnings)]

//! Persistence layer: key-value backends, the unified record schema, typed
//! storage events and migrations from earlier storage generations.

pub mod events;
pub mod keys;
pub mod legacy;
pub mod snapshot;
pub mod store;
pub mod unified;

pub use events::{EventBus, StorageEvent, SubscriptionId};
pub use keys::{is_application_key, Component, RecordKey};
pub use legacy::{
    detect_generation, migrate_to_current, MigrationError, StepReport, StorageGeneration,
    CURRENT_GENERATION,
};
pub use snapshot::{checksum, SnapshotDiff, SnapshotEntry, StoreSnapshot};
pub use store::{FileStore, KeyValueStore, MemoryStore, SharedStore, StoreError};
pub use unified::{Dependencies, Priorities, StorageError, UnifiedStorage};

/// Returns the default file store path used for local saves.
pub fn default_store_path() -> &'static str {
    "./saves/tracker.json"
}
