//! Redb table definitions for the persistent catalog.

use redb::TableDefinition;

// Namespace
// Key: logical path, Value: bincode-encoded Vec<ReplicaInfo>
pub const DATA_OBJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("data_objects");
// Key: collection path, Value: creation time
pub const COLLECTIONS: TableDefinition<&str, u64> = TableDefinition::new("collections");

// Resources
// Key: "resource\x00property"
pub const RESOURCE_PROPS: TableDefinition<&str, &str> = TableDefinition::new("resource_props");
pub const QUOTA_USAGE: TableDefinition<&str, u64> = TableDefinition::new("quota_usage");
// Key: group name, Value: bincode-encoded Vec<String>
pub const RESOURCE_GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("resource_groups");

// Catalog-wide
pub const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

pub const DEFAULT_RESOURCE_KEY: &str = "default_resource";
pub const NEXT_DATA_ID_KEY: &str = "next_data_id";

/// Composite key of a resource property
#[must_use]
pub fn property_key(resource: &str, key: &str) -> String {
    format!("{resource}\x00{key}")
}
