//! Cache and archive tiers of compound resources
//!
//! Byte I/O on a compound resource only ever touches the cache tier. An
//! object whose only copy sits on the archive is staged into the cache
//! before it is opened, and a cache replica that was written is synced
//! back out to the archive before the close returns.

use crate::server::Server;
use datagrid_catalog::ReplicaPatch;
use datagrid_common::hierarchy::next_resource;
use datagrid_common::{
    now_secs, ClientConnection, Error, Operation, ReplicaInfo, ReplicaStatus, Result,
};
use datagrid_resource::compound::{tier_children, Compound};
use datagrid_resource::path::logical_to_physical;
use datagrid_resource::{ChildEntry, FileObject, ObjectRef, ResourceId};
use datagrid_catalog::ReplicaFilter;
use tracing::{debug, info};

/// Which side of a compound resource a replica lives on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Tier {
    Cache,
    Archive,
}

/// Compound ancestor of a replica and the tier the replica is on
#[derive(Clone, Copy, Debug)]
pub(crate) struct TierPlacement {
    pub compound: ResourceId,
    pub tier: Tier,
}

impl Server {
    /// Locate the compound resource `hier` passes through, if any
    pub(crate) fn compound_tier(&self, hier: &str) -> Result<Option<TierPlacement>> {
        let leaf = self.tree.leaf_of_hier(hier)?;
        let mut current = leaf.parent();
        while let Some(id) = current {
            let node = self.tree.node(id);
            if node.type_name() == Compound::TYPE_NAME {
                let (cache, archive) = tier_children(node)?;
                let below = next_resource(hier, node.name());
                let tier = if below == Some(cache.name.as_str()) {
                    Tier::Cache
                } else if below == Some(archive.name.as_str()) {
                    Tier::Archive
                } else {
                    return Err(Error::InvalidHierarchy(format!(
                        "\"{hier}\" does not pass through a tier of {}",
                        node.name()
                    )));
                };
                return Ok(Some(TierPlacement { compound: id, tier }));
            }
            current = node.parent();
        }
        Ok(None)
    }

    /// Replica of `obj_path` living below `child` of `compound`
    fn replica_on_tier(
        &self,
        obj_path: &str,
        compound: ResourceId,
        child: &ChildEntry,
    ) -> Result<Option<ReplicaInfo>> {
        let name = self.tree.node(compound).name();
        Ok(self
            .catalog
            .get_data_obj_info(obj_path, &ReplicaFilter::all())?
            .into_iter()
            .find(|r| next_resource(&r.resc_hier, name) == Some(child.name.as_str())))
    }

    /// Hierarchy a new replica below `child` of `compound` would use
    fn resolve_tier_for_create(
        &self,
        comm: &ClientConnection,
        obj_path: &str,
        compound: ResourceId,
        child: &ChildEntry,
        size: u64,
    ) -> Result<String> {
        let mut parser = self.tree.hierarchy_parser_of(compound);
        let mut file = FileObject::for_vote(obj_path, &[], None);
        file.size = size;
        let mut object = ObjectRef::File(file);
        let vote = self
            .tree
            .resolve_from(child.id, comm, Operation::Create, &mut object, &mut parser)?;
        if vote <= 0.0 {
            return Err(Error::NoResourceAvailable(format!(
                "tier {} of {} for {obj_path}",
                child.name,
                self.tree.node(compound).name()
            )));
        }
        Ok(parser.to_string())
    }

    /// Copy an archive replica into the cache tier and register it there
    ///
    /// An already good cache replica is returned as is.
    pub(crate) fn stage_to_cache(
        &self,
        comm: &ClientConnection,
        archive: &ReplicaInfo,
    ) -> Result<ReplicaInfo> {
        let placement = self
            .compound_tier(&archive.resc_hier)?
            .filter(|p| p.tier == Tier::Archive)
            .ok_or_else(|| {
                Error::invalid_input(format!(
                    "\"{}\" is not the archive tier of a compound resource",
                    archive.resc_hier
                ))
            })?;
        let (cache, _) = tier_children(self.tree.node(placement.compound))?;
        let existing = self.replica_on_tier(&archive.obj_path, placement.compound, cache)?;
        if let Some(current) = existing.as_ref().filter(|r| r.status.is_good()) {
            debug!("Cache replica of {} is current", current.obj_path);
            return Ok(current.clone());
        }

        let (hier, cache_path) = match &existing {
            Some(stale) => (stale.resc_hier.clone(), stale.phy_path.clone()),
            None => {
                let hier = self.resolve_tier_for_create(
                    comm,
                    &archive.obj_path,
                    placement.compound,
                    cache,
                    archive.size,
                )?;
                let leaf = self.tree.leaf_of_hier(&hier)?;
                let path = logical_to_physical(leaf.vault_path(), &archive.obj_path);
                (hier, path)
            }
        };

        self.tree
            .file_stage_to_cache(comm, &mut Self::data_object(archive), &cache_path)?;
        let mut staged = Self::data_object(archive);
        staged.set_physical_path(cache_path.clone());
        staged.set_resc_hier(hier.clone());
        let size = self.physical_size(comm, &mut staged)?;

        let row = match existing {
            Some(stale) => self.catalog.modify_replica(
                &stale.obj_path,
                stale.repl_num,
                &ReplicaPatch {
                    size: Some(size),
                    checksum: Some(archive.checksum.clone()),
                    status: Some(ReplicaStatus::good()),
                    modify_time: Some(now_secs()),
                    ..ReplicaPatch::default()
                },
            )?,
            None => self.catalog.register_replica(ReplicaInfo {
                repl_num: -1,
                resc_hier: hier,
                resc_name: String::new(),
                phy_path: cache_path,
                size,
                status: ReplicaStatus::good(),
                create_time: 0,
                modify_time: 0,
                ..archive.clone()
            })?,
        };
        info!(
            "Staged {} from {} to cache replica {} on {}",
            row.obj_path, archive.resc_hier, row.repl_num, row.resc_hier
        );
        Ok(row)
    }

    /// Copy a cache replica out to the archive tier and register it there
    pub(crate) fn sync_to_archive(
        &self,
        comm: &ClientConnection,
        cached: &ReplicaInfo,
    ) -> Result<ReplicaInfo> {
        let placement = self
            .compound_tier(&cached.resc_hier)?
            .filter(|p| p.tier == Tier::Cache)
            .ok_or_else(|| {
                Error::invalid_input(format!(
                    "\"{}\" is not the cache tier of a compound resource",
                    cached.resc_hier
                ))
            })?;
        let (_, archive) = tier_children(self.tree.node(placement.compound))?;
        let existing = self.replica_on_tier(&cached.obj_path, placement.compound, archive)?;

        let (hier, archive_path) = match &existing {
            Some(row) => (row.resc_hier.clone(), row.phy_path.clone()),
            None => {
                let hier = self.resolve_tier_for_create(
                    comm,
                    &cached.obj_path,
                    placement.compound,
                    archive,
                    cached.size,
                )?;
                let leaf = self.tree.leaf_of_hier(&hier)?;
                let path = logical_to_physical(leaf.vault_path(), &cached.obj_path);
                (hier, path)
            }
        };

        let mut target = Self::data_object(cached);
        target.set_physical_path(archive_path.clone());
        target.set_resc_hier(hier.clone());
        self.tree
            .file_sync_to_arch(comm, &mut target, &cached.phy_path)?;

        let row = match existing {
            Some(row) => self.catalog.modify_replica(
                &row.obj_path,
                row.repl_num,
                &ReplicaPatch {
                    size: Some(cached.size),
                    checksum: Some(cached.checksum.clone()),
                    status: Some(ReplicaStatus::good()),
                    modify_time: Some(now_secs()),
                    ..ReplicaPatch::default()
                },
            )?,
            None => self.catalog.register_replica(ReplicaInfo {
                repl_num: -1,
                resc_hier: hier,
                resc_name: String::new(),
                phy_path: archive_path,
                status: ReplicaStatus::good(),
                create_time: 0,
                modify_time: 0,
                ..cached.clone()
            })?,
        };
        info!(
            "Synced {} from cache {} to archive replica {} on {}",
            row.obj_path, cached.resc_hier, row.repl_num, row.resc_hier
        );
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::DataObjRequest;
    use crate::testutil::{comm, compound_server, put_bytes};
    use std::fs;

    #[test]
    fn test_put_on_compound_syncs_archive() {
        let (_dir, server) = compound_server();
        let cached = put_bytes(&server, "/tempZone/home/rods/c.txt", "comp", b"tiered bytes");
        assert_eq!(cached.resc_hier, "comp/cache");

        let replicas = server
            .catalog()
            .get_data_obj_info("/tempZone/home/rods/c.txt", &ReplicaFilter::all())
            .unwrap();
        assert_eq!(replicas.len(), 2);
        let archived = replicas.iter().find(|r| r.resc_hier == "comp/arch").unwrap();
        assert!(archived.status.is_good());
        assert_eq!(archived.size, 12);
        assert_eq!(fs::read(&archived.phy_path).unwrap(), b"tiered bytes");
    }

    #[test]
    fn test_open_stages_archive_only_object() {
        let (_dir, server) = compound_server();
        let obj = "/tempZone/home/rods/s.txt";
        put_bytes(&server, obj, "comp", b"staged");
        let cache = server
            .catalog()
            .get_data_obj_info(obj, &ReplicaFilter::all().resource("cache"))
            .unwrap()
            .remove(0);
        server
            .unlink(&comm(), DataObjRequest::new(obj).with_repl_num(cache.repl_num))
            .unwrap();
        assert!(!std::path::Path::new(&cache.phy_path).exists());

        let mut out = Vec::new();
        let n = server.get(&comm(), DataObjRequest::new(obj), &mut out).unwrap();
        assert_eq!(n, 6);
        assert_eq!(out, b"staged");
        let restaged = server
            .catalog()
            .get_data_obj_info(obj, &ReplicaFilter::all().resource("cache"))
            .unwrap();
        assert_eq!(restaged.len(), 1);
        assert!(restaged[0].status.is_good());
    }

    #[test]
    fn test_tier_of_plain_resource_is_none() {
        let (_dir, server) = compound_server();
        assert!(server.compound_tier("plain").unwrap().is_none());
        let placement = server.compound_tier("comp/arch").unwrap().unwrap();
        assert_eq!(placement.tier, Tier::Archive);
    }
}
