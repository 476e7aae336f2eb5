//! Process-local catalog

use crate::catalog::{Catalog, PathKind, ReplicaFilter, ReplicaPatch};
use crate::state::CatalogState;
use datagrid_common::{Error, ReplicaInfo, ResourcePropertyStore, Result};
use parking_lot::RwLock;

/// Catalog kept entirely in memory, used by tests and single-shot tools
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: RwLock<CatalogState>,
}

impl MemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourcePropertyStore for MemoryCatalog {
    fn get_property(&self, resource: &str, key: &str) -> Result<Option<String>> {
        Ok(self.state.read().get_property(resource, key))
    }

    fn compare_and_set_property(
        &self,
        resource: &str,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool> {
        Ok(self
            .state
            .write()
            .compare_and_set_property(resource, key, expected, value))
    }
}

impl Catalog for MemoryCatalog {
    fn stat_path(&self, path: &str) -> Result<PathKind> {
        Ok(self.state.read().stat_path(path))
    }

    fn get_data_obj_info(&self, obj_path: &str, filter: &ReplicaFilter) -> Result<Vec<ReplicaInfo>> {
        Ok(self.state.read().get_data_obj_info(obj_path, filter))
    }

    fn get_resc_grp_for_create(&self, obj_path: &str, requested: Option<&str>) -> Result<Vec<String>> {
        self.state.read().get_resc_grp_for_create(obj_path, requested)
    }

    fn register_replica(&self, replica: ReplicaInfo) -> Result<ReplicaInfo> {
        self.state
            .write()
            .register_replica(replica)
            .map(|(stored, _)| stored)
    }

    fn modify_replica(&self, obj_path: &str, repl_num: i32, patch: &ReplicaPatch) -> Result<ReplicaInfo> {
        self.state.write().modify_replica(obj_path, repl_num, patch)
    }

    fn unregister_replica(&self, obj_path: &str, repl_num: i32) -> Result<()> {
        self.state
            .write()
            .unregister_replica(obj_path, repl_num)
            .map(|_| ())
    }

    fn find_by_physical_path(&self, leaf: &str, phy_path: &str) -> Result<Option<ReplicaInfo>> {
        Ok(self.state.read().find_by_physical_path(leaf, phy_path))
    }

    fn list_data_objects(&self, coll: &str, recursive: bool) -> Result<Vec<ReplicaInfo>> {
        Ok(self.state.read().list_data_objects(coll, recursive))
    }

    fn create_collection(&self, path: &str) -> Result<()> {
        self.state.write().create_collection(path).map(|_| ())
    }

    fn update_quota_usage(&self, resource: &str, delta: i64) -> Result<u64> {
        Ok(self.state.write().update_quota_usage(resource, delta))
    }

    fn quota_usage(&self, resource: &str) -> Result<u64> {
        Ok(self.state.read().quota_usage(resource))
    }

    fn define_resource_group(&self, name: &str, members: &[String]) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_input("resource group name is empty"));
        }
        self.state
            .write()
            .groups
            .insert(name.to_string(), members.to_vec());
        Ok(())
    }

    fn set_default_resource(&self, name: Option<&str>) -> Result<()> {
        self.state.write().default_resource = name.map(str::to_string);
        Ok(())
    }
}
