//! Catalog contents and the rules for changing them
//!
//! Both catalog implementations keep a [`CatalogState`] behind a lock; the
//! persistent one additionally writes the touched keys to redb.

use crate::catalog::{PathKind, ReplicaFilter, ReplicaPatch};
use datagrid_common::{
    now_secs, validate_obj_path, Error, ReplicaInfo, Result,
};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Everything a catalog knows
#[derive(Debug, Default, Clone)]
pub struct CatalogState {
    /// Replica rows per data object, ordered by replica number
    pub(crate) objects: BTreeMap<String, Vec<ReplicaInfo>>,
    /// Collection path to creation time
    pub(crate) collections: BTreeMap<String, u64>,
    pub(crate) props: HashMap<(String, String), String>,
    pub(crate) quotas: HashMap<String, u64>,
    pub(crate) groups: BTreeMap<String, Vec<String>>,
    pub(crate) default_resource: Option<String>,
    pub(crate) next_data_id: u64,
}

/// Parent collections of a logical path, outermost first
pub(crate) fn ancestors(path: &str) -> Vec<&str> {
    path.match_indices('/')
        .map(|(idx, _)| idx)
        .filter(|&idx| idx > 0)
        .map(|idx| &path[..idx])
        .collect()
}

impl CatalogState {
    /// Restore an object's rows as loaded from storage
    pub(crate) fn insert_object(&mut self, obj_path: String, rows: Vec<ReplicaInfo>) {
        if let Some(max_id) = rows.iter().map(|r| r.data_id).max() {
            self.next_data_id = self.next_data_id.max(max_id);
        }
        if !rows.is_empty() {
            self.objects.insert(obj_path, rows);
        }
    }

    pub(crate) fn stat_path(&self, path: &str) -> PathKind {
        if self.objects.contains_key(path) {
            PathKind::DataObject
        } else if self.collections.contains_key(path) {
            PathKind::Collection
        } else {
            PathKind::None
        }
    }

    pub(crate) fn get_data_obj_info(&self, obj_path: &str, filter: &ReplicaFilter) -> Vec<ReplicaInfo> {
        self.objects
            .get(obj_path)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn get_resc_grp_for_create(
        &self,
        obj_path: &str,
        requested: Option<&str>,
    ) -> Result<Vec<String>> {
        let name = requested
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_resource.clone())
            .ok_or_else(|| {
                Error::NoResourceAvailable(format!(
                    "no resource requested for {obj_path} and no default resource"
                ))
            })?;
        match self.groups.get(&name) {
            Some(members) if members.is_empty() => Err(Error::NoResourceAvailable(format!(
                "resource group {name} has no members"
            ))),
            Some(members) => Ok(members.clone()),
            None => Ok(vec![name]),
        }
    }

    /// Insert a row; returns the stored row and the collections created for it
    pub(crate) fn register_replica(
        &mut self,
        mut replica: ReplicaInfo,
    ) -> Result<(ReplicaInfo, Vec<String>)> {
        validate_obj_path(&replica.obj_path)?;
        if replica.resc_hier.is_empty() {
            return Err(Error::invalid_input(format!(
                "replica of {} has no resource hierarchy",
                replica.obj_path
            )));
        }
        if self.collections.contains_key(&replica.obj_path) {
            return Err(Error::PathIsCollection(replica.obj_path));
        }

        let existing = self.objects.get(&replica.obj_path).map(Vec::as_slice).unwrap_or_default();
        if existing.iter().any(|r| r.resc_hier == replica.resc_hier) {
            return Err(Error::CopyAlreadyInResource {
                path: replica.obj_path,
                resource: replica.resc_hier,
            });
        }
        if replica.repl_num < 0 {
            replica.repl_num = existing.iter().map(|r| r.repl_num + 1).max().unwrap_or(0);
        } else if existing.iter().any(|r| r.repl_num == replica.repl_num) {
            return Err(Error::catalog(format!(
                "replica {} of {} is already registered",
                replica.repl_num, replica.obj_path
            )));
        }
        replica.data_id = match existing.first() {
            Some(first) => first.data_id,
            None if replica.data_id != 0 => replica.data_id,
            None => {
                self.next_data_id += 1;
                self.next_data_id
            }
        };
        self.next_data_id = self.next_data_id.max(replica.data_id);
        let now = now_secs();
        if replica.create_time == 0 {
            replica.create_time = now;
        }
        if replica.modify_time == 0 {
            replica.modify_time = replica.create_time;
        }
        if replica.resc_name.is_empty() {
            replica.resc_name = replica.root_resource().to_string();
        }

        let mut created = Vec::new();
        for coll in ancestors(&replica.obj_path) {
            if !self.collections.contains_key(coll) {
                self.collections.insert(coll.to_string(), now);
                created.push(coll.to_string());
            }
        }

        let rows = self.objects.entry(replica.obj_path.clone()).or_default();
        rows.push(replica.clone());
        rows.sort_by_key(|r| r.repl_num);
        info!(
            "Registered replica {} of {} on {} at {}",
            replica.repl_num, replica.obj_path, replica.resc_hier, replica.phy_path
        );
        Ok((replica, created))
    }

    pub(crate) fn modify_replica(
        &mut self,
        obj_path: &str,
        repl_num: i32,
        patch: &ReplicaPatch,
    ) -> Result<ReplicaInfo> {
        let rows = self
            .objects
            .get_mut(obj_path)
            .ok_or_else(|| Error::CatalogNoInfo(obj_path.to_string()))?;
        if let Some(hier) = &patch.resc_hier
            && rows.iter().any(|r| r.repl_num != repl_num && &r.resc_hier == hier)
        {
            return Err(Error::CopyAlreadyInResource {
                path: obj_path.to_string(),
                resource: hier.clone(),
            });
        }
        let idx = rows
            .iter()
            .position(|r| r.repl_num == repl_num)
            .ok_or_else(|| Error::CatalogNoInfo(format!("{obj_path} replica {repl_num}")))?;

        patch.apply(&mut rows[idx]);
        if patch.mark_other_replicas_stale {
            for (i, row) in rows.iter_mut().enumerate() {
                if i != idx && row.status.is_good() {
                    row.status.mark_stale();
                    debug!("Replica {} of {} is now stale", row.repl_num, obj_path);
                }
            }
        }
        Ok(rows[idx].clone())
    }

    /// Remove a row; returns true when the object itself is gone
    pub(crate) fn unregister_replica(&mut self, obj_path: &str, repl_num: i32) -> Result<bool> {
        let rows = self
            .objects
            .get_mut(obj_path)
            .ok_or_else(|| Error::CatalogNoInfo(obj_path.to_string()))?;
        let before = rows.len();
        rows.retain(|r| r.repl_num != repl_num);
        if rows.len() == before {
            return Err(Error::CatalogNoInfo(format!("{obj_path} replica {repl_num}")));
        }
        info!("Unregistered replica {} of {}", repl_num, obj_path);
        if rows.is_empty() {
            self.objects.remove(obj_path);
            return Ok(true);
        }
        Ok(false)
    }

    pub(crate) fn find_by_physical_path(&self, leaf: &str, phy_path: &str) -> Option<ReplicaInfo> {
        self.objects
            .values()
            .flatten()
            .find(|r| r.phy_path == phy_path && r.leaf_resource() == leaf)
            .cloned()
    }

    pub(crate) fn list_data_objects(&self, coll: &str, recursive: bool) -> Vec<ReplicaInfo> {
        let prefix = format!("{}/", coll.trim_end_matches('/'));
        self.objects
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter(|(path, _)| recursive || !path[prefix.len()..].contains('/'))
            .flat_map(|(_, rows)| rows.iter().cloned())
            .collect()
    }

    /// Create `path` and its parents; returns the collections that were new
    pub(crate) fn create_collection(&mut self, path: &str) -> Result<Vec<String>> {
        if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') {
            return Err(Error::invalid_input(format!("invalid collection path: {path}")));
        }
        if self.objects.contains_key(path) {
            return Err(Error::invalid_input(format!(
                "a data object already exists at {path}"
            )));
        }
        let now = now_secs();
        let mut created = Vec::new();
        for coll in ancestors(path).into_iter().chain(std::iter::once(path)) {
            if !self.collections.contains_key(coll) {
                self.collections.insert(coll.to_string(), now);
                created.push(coll.to_string());
            }
        }
        Ok(created)
    }

    pub(crate) fn update_quota_usage(&mut self, resource: &str, delta: i64) -> u64 {
        let usage = self.quotas.entry(resource.to_string()).or_default();
        *usage = usage.saturating_add_signed(delta);
        *usage
    }

    pub(crate) fn quota_usage(&self, resource: &str) -> u64 {
        self.quotas.get(resource).copied().unwrap_or(0)
    }

    pub(crate) fn get_property(&self, resource: &str, key: &str) -> Option<String> {
        self.props
            .get(&(resource.to_string(), key.to_string()))
            .cloned()
    }

    pub(crate) fn compare_and_set_property(
        &mut self,
        resource: &str,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> bool {
        let slot = (resource.to_string(), key.to_string());
        if self.props.get(&slot).map(String::as_str) != expected {
            return false;
        }
        self.props.insert(slot, value.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datagrid_common::ReplicaStatus;

    fn row(path: &str, hier: &str) -> ReplicaInfo {
        ReplicaInfo {
            obj_path: path.into(),
            repl_num: -1,
            resc_hier: hier.into(),
            phy_path: format!("/vault{path}"),
            status: ReplicaStatus::good(),
            ..ReplicaInfo::default()
        }
    }

    #[test]
    fn test_ancestors() {
        assert_eq!(ancestors("/z/home/u/f"), vec!["/z", "/z/home", "/z/home/u"]);
        assert!(ancestors("/z").is_empty());
    }

    #[test]
    fn test_register_assigns_numbers_and_collections() {
        let mut state = CatalogState::default();
        let (first, created) = state.register_replica(row("/z/home/u/f", "a")).unwrap();
        assert_eq!(first.repl_num, 0);
        assert_eq!(first.data_id, 1);
        assert_eq!(first.resc_name, "a");
        assert_eq!(created, vec!["/z", "/z/home", "/z/home/u"]);

        let (second, created) = state.register_replica(row("/z/home/u/f", "rr/b")).unwrap();
        assert_eq!(second.repl_num, 1);
        assert_eq!(second.data_id, 1);
        assert!(created.is_empty());

        let (other, _) = state.register_replica(row("/z/home/u/g", "a")).unwrap();
        assert_eq!(other.data_id, 2);

        assert_eq!(state.stat_path("/z/home/u"), PathKind::Collection);
        assert_eq!(state.stat_path("/z/home/u/f"), PathKind::DataObject);
        assert_eq!(state.stat_path("/z/nothing"), PathKind::None);
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut state = CatalogState::default();
        state.register_replica(row("/z/f", "a")).unwrap();
        let err = state.register_replica(row("/z/f", "a")).unwrap_err();
        assert!(matches!(err, Error::CopyAlreadyInResource { .. }));

        let mut explicit = row("/z/f", "b");
        explicit.repl_num = 0;
        assert!(matches!(
            state.register_replica(explicit).unwrap_err(),
            Error::Catalog(_)
        ));

        state.create_collection("/z/c").unwrap();
        assert!(matches!(
            state.register_replica(row("/z/c", "a")).unwrap_err(),
            Error::PathIsCollection(_)
        ));
    }

    #[test]
    fn test_modify_marks_others_stale() {
        let mut state = CatalogState::default();
        state.register_replica(row("/z/f", "a")).unwrap();
        state.register_replica(row("/z/f", "b")).unwrap();
        let patch = ReplicaPatch {
            size: Some(42),
            mark_other_replicas_stale: true,
            ..ReplicaPatch::default()
        };
        let updated = state.modify_replica("/z/f", 1, &patch).unwrap();
        assert_eq!(updated.size, 42);
        let rows = state.get_data_obj_info("/z/f", &ReplicaFilter::all());
        assert!(!rows[0].status.is_good());
        assert!(rows[1].status.is_good());
        assert_eq!(
            state.get_data_obj_info("/z/f", &ReplicaFilter::all().good_only()).len(),
            1
        );

        let moved = ReplicaPatch {
            resc_hier: Some("a".into()),
            ..ReplicaPatch::default()
        };
        assert!(matches!(
            state.modify_replica("/z/f", 1, &moved).unwrap_err(),
            Error::CopyAlreadyInResource { .. }
        ));
        assert!(state.modify_replica("/z/f", 7, &patch).unwrap_err().is_benign_catalog());
        assert!(state.modify_replica("/z/x", 0, &patch).unwrap_err().is_benign_catalog());
    }

    #[test]
    fn test_unregister_removes_object_with_last_replica() {
        let mut state = CatalogState::default();
        state.register_replica(row("/z/f", "a")).unwrap();
        state.register_replica(row("/z/f", "b")).unwrap();
        assert!(!state.unregister_replica("/z/f", 0).unwrap());
        assert!(state.unregister_replica("/z/f", 0).is_err());
        assert!(state.unregister_replica("/z/f", 1).unwrap());
        assert_eq!(state.stat_path("/z/f"), PathKind::None);
    }

    #[test]
    fn test_list_and_find() {
        let mut state = CatalogState::default();
        state.register_replica(row("/z/c/a/1.txt", "a")).unwrap();
        state.register_replica(row("/z/c/b/2.txt", "a")).unwrap();
        state.register_replica(row("/z/c/top", "a")).unwrap();
        state.register_replica(row("/z/cx/other", "a")).unwrap();

        let all: Vec<_> = state
            .list_data_objects("/z/c", true)
            .into_iter()
            .map(|r| r.obj_path)
            .collect();
        assert_eq!(all, vec!["/z/c/a/1.txt", "/z/c/b/2.txt", "/z/c/top"]);
        assert_eq!(state.list_data_objects("/z/c", false).len(), 1);

        let found = state.find_by_physical_path("a", "/vault/z/c/top").unwrap();
        assert_eq!(found.obj_path, "/z/c/top");
        assert!(state.find_by_physical_path("b", "/vault/z/c/top").is_none());
    }

    #[test]
    fn test_resource_groups_for_create() {
        let mut state = CatalogState::default();
        assert!(matches!(
            state.get_resc_grp_for_create("/z/f", None).unwrap_err(),
            Error::NoResourceAvailable(_)
        ));
        state.default_resource = Some("demo".into());
        assert_eq!(state.get_resc_grp_for_create("/z/f", None).unwrap(), vec!["demo"]);
        state.groups.insert("grp".into(), vec!["a".into(), "b".into()]);
        assert_eq!(
            state.get_resc_grp_for_create("/z/f", Some("grp")).unwrap(),
            vec!["a", "b"]
        );
        assert_eq!(
            state.get_resc_grp_for_create("/z/f", Some("solo")).unwrap(),
            vec!["solo"]
        );
    }

    #[test]
    fn test_quota_and_properties() {
        let mut state = CatalogState::default();
        assert_eq!(state.update_quota_usage("a", 100), 100);
        assert_eq!(state.update_quota_usage("a", -150), 0);
        assert!(state.compare_and_set_property("rr", "k", None, "x"));
        assert!(!state.compare_and_set_property("rr", "k", None, "y"));
        assert!(state.compare_and_set_property("rr", "k", Some("x"), "y"));
        assert_eq!(state.get_property("rr", "k").as_deref(), Some("y"));
    }
}
