// Claps Kernel
//
// Insert-only versioned entity store: every mutation appends a row
// linked to its predecessor, and exactly one row per entity is latest.

pub mod bootstrap;
pub mod chain;
pub mod config;
pub mod invariants;
pub mod kinds;
pub mod pipeline;
pub mod query;
pub mod replay;
pub mod schema;
pub mod store;

pub use bootstrap::{bootstrap, BootstrapError, BootstrapReport};
pub use chain::{EntityId, VersionId, VersionedRecord, EMPTY_VERSION};
pub use config::StoreConfig;
pub use kinds::{catalog, Entity, Versioned};
pub use pipeline::{Changes, VersionedStore};
pub use query::{Condition, CurrentRows, ListOptions, Scope};
pub use schema::{FieldType, Fields, Kind, Value};
pub use store::{MemoryStore, RecordStore, SqliteStore, StoreError};
