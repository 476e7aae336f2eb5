//! Occupied physical paths
//!
//! A physical create can land on a path that already holds a file. If no
//! catalog row claims that file it is an orphan and gets moved under the
//! vault's orphan directory; otherwise the new replica takes a suffixed
//! path next to it.

use crate::server::Server;
use datagrid_common::{ClientConnection, Error, ReplicaInfo, Result};
use datagrid_resource::path::orphan_path;
use datagrid_resource::{DataObject, ObjectRef, ResourceNode};
use tracing::{info, warn};

const MAX_PATH_ATTEMPTS: u32 = 100;

/// Who holds a physical path
#[derive(Debug)]
pub(crate) enum Occupant {
    Free,
    /// An orphan was there and has been moved to the given path
    Relocated(String),
    Owned(ReplicaInfo),
}

impl Server {
    fn path_exists(&self, comm: &ClientConnection, hier: &str, phy_path: &str) -> Result<bool> {
        let mut stat_ref = ObjectRef::Data(DataObject::new(phy_path, hier));
        match self.tree.file_stat(comm, &mut stat_ref) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Move the unowned file at `phy_path` under the vault's orphan directory
    pub(crate) fn relocate_orphan(
        &self,
        comm: &ClientConnection,
        leaf: &ResourceNode,
        hier: &str,
        phy_path: &str,
    ) -> Result<String> {
        for _ in 0..MAX_PATH_ATTEMPTS {
            let target = orphan_path(leaf.vault_path(), phy_path, rand::random::<u32>());
            if self.path_exists(comm, hier, &target)? {
                continue;
            }
            let mut orphan = ObjectRef::Data(DataObject::new(phy_path, hier));
            self.tree.file_rename(comm, &mut orphan, &target)?;
            info!(
                "Relocated orphan {} on resource {} to {}",
                phy_path,
                leaf.name(),
                target
            );
            return Ok(target);
        }
        Err(Error::internal(format!(
            "no free orphan path for {phy_path} on {}",
            leaf.name()
        )))
    }

    /// Find out who holds `phy_path`, moving it aside if nobody does
    pub(crate) fn check_and_handle_orphan(
        &self,
        comm: &ClientConnection,
        leaf: &ResourceNode,
        hier: &str,
        phy_path: &str,
    ) -> Result<Occupant> {
        if !self.path_exists(comm, hier, phy_path)? {
            return Ok(Occupant::Free);
        }
        match self.catalog.find_by_physical_path(leaf.name(), phy_path)? {
            Some(owner) => Ok(Occupant::Owned(owner)),
            None => self
                .relocate_orphan(comm, leaf, hier, phy_path)
                .map(Occupant::Relocated),
        }
    }

    /// Make room for a create whose physical path is taken
    ///
    /// Afterwards the object's physical path is free: either the orphan was
    /// moved away, or the path now carries a numeric suffix.
    pub(crate) fn resolve_dup_file_path(
        &self,
        comm: &ClientConnection,
        leaf: &ResourceNode,
        object: &mut ObjectRef,
    ) -> Result<()> {
        let phy_path = object.physical_path().to_string();
        let hier = object.resc_hier().to_string();
        match self.check_and_handle_orphan(comm, leaf, &hier, &phy_path)? {
            Occupant::Free | Occupant::Relocated(_) => Ok(()),
            Occupant::Owned(owner) => {
                warn!(
                    "Physical path {} already holds replica {} of {}",
                    phy_path, owner.repl_num, owner.obj_path
                );
                for n in 1..=MAX_PATH_ATTEMPTS {
                    let candidate = format!("{phy_path}.{n}");
                    if !self.path_exists(comm, &hier, &candidate)? {
                        object.set_physical_path(candidate);
                        return Ok(());
                    }
                }
                Err(Error::CopyAlreadyInResource {
                    path: owner.obj_path,
                    resource: leaf.name().to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::request::DataObjRequest;
    use crate::testutil::{comm, put_bytes, single_resource};
    use datagrid_resource::path::ORPHAN_DIR;
    use std::fs;

    #[test]
    fn test_orphan_occupant_is_relocated() {
        let (dir, server) = single_resource();
        let phy = dir.path().join("disk/home/rods/o.txt");
        fs::create_dir_all(phy.parent().unwrap()).unwrap();
        fs::write(&phy, b"left behind").unwrap();

        let replica = put_bytes(&server, "/tempZone/home/rods/o.txt", "disk", b"fresh");
        assert_eq!(replica.phy_path, phy.to_string_lossy());
        assert_eq!(fs::read(&phy).unwrap(), b"fresh");

        let orphans: Vec<_> = fs::read_dir(dir.path().join("disk").join(ORPHAN_DIR))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(orphans.len(), 1);
        assert_eq!(fs::read(&orphans[0]).unwrap(), b"left behind");
    }

    #[test]
    fn test_owned_occupant_gets_suffixed_path() {
        let (_dir, server) = single_resource();
        let first = put_bytes(&server, "/tempZone/home/rods/x.txt", "disk", b"one");
        server
            .catalog()
            .unregister_replica("/tempZone/home/rods/x.txt", first.repl_num)
            .unwrap();
        // same physical path, but now claimed by another object's row
        let mut claimed = first.clone();
        claimed.obj_path = "/tempZone/home/rods/other.txt".into();
        claimed.repl_num = -1;
        claimed.data_id = 0;
        server.catalog().register_replica(claimed).unwrap();

        let second = put_bytes(&server, "/tempZone/home/rods/x.txt", "disk", b"two");
        assert_eq!(second.phy_path, format!("{}.1", first.phy_path));
        assert_eq!(fs::read(&first.phy_path).unwrap(), b"one");

        let mut out = Vec::new();
        server
            .get(&comm(), DataObjRequest::new("/tempZone/home/rods/x.txt"), &mut out)
            .unwrap();
        assert_eq!(out, b"two");
    }
}
