//! Catalog query and mutation contract
//!
//! The replica engine consults the catalog for what exists (data objects,
//! their replicas, collections) and records every physical change through
//! it. "No rows" is an empty result, never an error.

use datagrid_common::hierarchy::first_resource;
use datagrid_common::{ReplicaInfo, ReplicaStatus, ResourcePropertyStore, Result};

/// What a logical path names
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathKind {
    None,
    DataObject,
    Collection,
}

/// Row selection for [`Catalog::get_data_obj_info`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicaFilter {
    pub repl_num: Option<i32>,
    /// Resource appearing anywhere in the replica's hierarchy
    pub resource: Option<String>,
    pub good_only: bool,
}

impl ReplicaFilter {
    /// Every replica
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn repl_num(mut self, repl_num: i32) -> Self {
        self.repl_num = Some(repl_num);
        self
    }

    #[must_use]
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    #[must_use]
    pub const fn good_only(mut self) -> Self {
        self.good_only = true;
        self
    }

    #[must_use]
    pub fn matches(&self, replica: &ReplicaInfo) -> bool {
        if self.repl_num.is_some_and(|n| n != replica.repl_num) {
            return false;
        }
        if let Some(resource) = &self.resource
            && !replica.resc_hier.split('/').any(|r| r == resource)
        {
            return false;
        }
        !self.good_only || replica.status.is_good()
    }
}

/// Field updates for [`Catalog::modify_replica`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicaPatch {
    pub size: Option<u64>,
    pub checksum: Option<String>,
    pub status: Option<ReplicaStatus>,
    pub phy_path: Option<String>,
    pub resc_hier: Option<String>,
    pub modify_time: Option<u64>,
    /// Mark every other replica of the object stale
    pub mark_other_replicas_stale: bool,
}

impl ReplicaPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Apply the field updates to one row
    pub fn apply(&self, replica: &mut ReplicaInfo) {
        if let Some(size) = self.size {
            replica.size = size;
        }
        if let Some(checksum) = &self.checksum {
            replica.checksum.clone_from(checksum);
        }
        if let Some(status) = self.status {
            replica.status = status;
        }
        if let Some(phy_path) = &self.phy_path {
            replica.phy_path.clone_from(phy_path);
        }
        if let Some(hier) = &self.resc_hier {
            replica.resc_hier.clone_from(hier);
            replica.resc_name = first_resource(hier).to_string();
        }
        if let Some(time) = self.modify_time {
            replica.modify_time = time;
        }
    }
}

/// The catalog as seen by the replica engine
///
/// Resource properties (the round-robin pointer) are persisted through the
/// same catalog, so every implementation is also a property store.
pub trait Catalog: ResourcePropertyStore {
    fn stat_path(&self, path: &str) -> Result<PathKind>;

    /// Replicas of `obj_path` matching `filter`, in replica-number order
    fn get_data_obj_info(&self, obj_path: &str, filter: &ReplicaFilter)
        -> Result<Vec<ReplicaInfo>>;

    /// Ranked candidate root resources for a new object
    ///
    /// `requested` may name a resource group (expanded to its members) or a
    /// single resource; without it the default resource is used.
    fn get_resc_grp_for_create(&self, obj_path: &str, requested: Option<&str>)
        -> Result<Vec<String>>;

    /// Add a replica row
    ///
    /// A negative `repl_num` asks for the next free number and a zero
    /// `data_id` for the object's id (or a fresh one). Missing parent
    /// collections are created. Returns the stored row.
    fn register_replica(&self, replica: ReplicaInfo) -> Result<ReplicaInfo>;

    /// Update one row; `CatalogNoInfo` when it is gone
    fn modify_replica(&self, obj_path: &str, repl_num: i32, patch: &ReplicaPatch)
        -> Result<ReplicaInfo>;

    /// Remove one row; the data object disappears with its last replica
    fn unregister_replica(&self, obj_path: &str, repl_num: i32) -> Result<()>;

    /// Replica stored at `phy_path` on leaf resource `leaf`, if any
    fn find_by_physical_path(&self, leaf: &str, phy_path: &str) -> Result<Option<ReplicaInfo>>;

    /// Replicas of every data object below `coll`
    fn list_data_objects(&self, coll: &str, recursive: bool) -> Result<Vec<ReplicaInfo>>;

    /// Create a collection and its missing parents
    fn create_collection(&self, path: &str) -> Result<()>;

    /// Add `delta` bytes to a resource's usage, returning the new total
    fn update_quota_usage(&self, resource: &str, delta: i64) -> Result<u64>;

    fn quota_usage(&self, resource: &str) -> Result<u64>;

    fn define_resource_group(&self, name: &str, members: &[String]) -> Result<()>;

    fn set_default_resource(&self, name: Option<&str>) -> Result<()>;
}
