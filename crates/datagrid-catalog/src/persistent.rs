//! Catalog persisted in redb
//!
//! Reads are answered from the in-memory state. Each mutation updates the
//! state under the write lock and then writes the touched keys in one
//! transaction; if that write fails the state is reloaded from disk so
//! memory never runs ahead of what was committed.

use crate::catalog::{Catalog, PathKind, ReplicaFilter, ReplicaPatch};
use crate::state::CatalogState;
use crate::store::{CatalogStore, Change, StoreResult};
use datagrid_common::{Error, ReplicaInfo, ResourcePropertyStore, Result};
use parking_lot::RwLock;
use std::path::Path;
use tracing::{error, info};

pub struct RedbCatalog {
    state: RwLock<CatalogState>,
    store: CatalogStore,
}

fn object_change<'a>(state: &'a CatalogState, obj_path: &'a str) -> Change<'a> {
    Change::DataObject(obj_path, state.objects.get(obj_path).map(Vec::as_slice))
}

fn collection_changes<'a>(state: &'a CatalogState, created: &'a [String]) -> Vec<Change<'a>> {
    created
        .iter()
        .map(|c| Change::Collection(c, state.collections.get(c).copied().unwrap_or(0)))
        .collect()
}

impl RedbCatalog {
    /// Open (or create) the catalog database and load it into memory
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let store = CatalogStore::open(path)?;
        let state = store.load_state()?;
        info!(
            "Loaded catalog from {}: {} data objects, {} collections",
            path.display(),
            state.objects.len(),
            state.collections.len()
        );
        Ok(Self {
            state: RwLock::new(state),
            store,
        })
    }

    /// Turn a failed write into an error after resyncing memory with disk
    fn settle(&self, state: &mut CatalogState, written: StoreResult<()>) -> Result<()> {
        let Err(e) = written else {
            return Ok(());
        };
        error!("Failed to persist catalog change: {}", e);
        match self.store.load_state() {
            Ok(reloaded) => *state = reloaded,
            Err(reload) => error!("Failed to reload catalog after write failure: {}", reload),
        }
        Err(e.into())
    }
}

impl ResourcePropertyStore for RedbCatalog {
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
        let mut state = self.state.write();
        if !state.compare_and_set_property(resource, key, expected, value) {
            return Ok(false);
        }
        let written = self.store.apply(&[Change::Property {
            resource,
            key,
            value,
        }]);
        self.settle(&mut state, written).map(|()| true)
    }
}

impl Catalog for RedbCatalog {
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
        let mut state = self.state.write();
        let (stored, created) = state.register_replica(replica)?;
        let written = {
            let mut changes = collection_changes(&state, &created);
            changes.push(object_change(&state, &stored.obj_path));
            changes.push(Change::NextDataId(state.next_data_id));
            self.store.apply(&changes)
        };
        self.settle(&mut state, written)?;
        Ok(stored)
    }

    fn modify_replica(&self, obj_path: &str, repl_num: i32, patch: &ReplicaPatch) -> Result<ReplicaInfo> {
        let mut state = self.state.write();
        let updated = state.modify_replica(obj_path, repl_num, patch)?;
        let written = self.store.apply(&[object_change(&state, obj_path)]);
        self.settle(&mut state, written)?;
        Ok(updated)
    }

    fn unregister_replica(&self, obj_path: &str, repl_num: i32) -> Result<()> {
        let mut state = self.state.write();
        state.unregister_replica(obj_path, repl_num)?;
        let written = self.store.apply(&[object_change(&state, obj_path)]);
        self.settle(&mut state, written)
    }

    fn find_by_physical_path(&self, leaf: &str, phy_path: &str) -> Result<Option<ReplicaInfo>> {
        Ok(self.state.read().find_by_physical_path(leaf, phy_path))
    }

    fn list_data_objects(&self, coll: &str, recursive: bool) -> Result<Vec<ReplicaInfo>> {
        Ok(self.state.read().list_data_objects(coll, recursive))
    }

    fn create_collection(&self, path: &str) -> Result<()> {
        let mut state = self.state.write();
        let created = state.create_collection(path)?;
        let written = self.store.apply(&collection_changes(&state, &created));
        self.settle(&mut state, written)
    }

    fn update_quota_usage(&self, resource: &str, delta: i64) -> Result<u64> {
        let mut state = self.state.write();
        let usage = state.update_quota_usage(resource, delta);
        let written = self.store.apply(&[Change::Quota(resource, usage)]);
        self.settle(&mut state, written)?;
        Ok(usage)
    }

    fn quota_usage(&self, resource: &str) -> Result<u64> {
        Ok(self.state.read().quota_usage(resource))
    }

    fn define_resource_group(&self, name: &str, members: &[String]) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_input("resource group name is empty"));
        }
        let mut state = self.state.write();
        state.groups.insert(name.to_string(), members.to_vec());
        let written = self.store.apply(&[Change::ResourceGroup(name, members)]);
        self.settle(&mut state, written)
    }

    fn set_default_resource(&self, name: Option<&str>) -> Result<()> {
        let mut state = self.state.write();
        state.default_resource = name.map(str::to_string);
        let written = self.store.apply(&[Change::DefaultResource(name)]);
        self.settle(&mut state, written)
    }
}
