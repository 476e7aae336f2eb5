//! DataGrid Catalog - replica and namespace metadata
//!
//! This crate defines the catalog contract consulted by the replica engine
//! and provides two implementations: a process-local catalog and one
//! persisted in redb.

pub mod catalog;
pub mod memory;
pub mod persistent;
pub mod state;
pub mod store;
pub mod tables;

// Re-exports
pub use catalog::{Catalog, PathKind, ReplicaFilter, ReplicaPatch};
pub use memory::MemoryCatalog;
pub use persistent::RedbCatalog;
pub use store::{CatalogStore, StoreError};
