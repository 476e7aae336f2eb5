//! Unpacking a bundle into registered replicas
//!
//! Every extracted file is hard-linked to the physical path its logical
//! path maps to and registered directly with the catalog. One subfile's
//! failure does not stop the others; failures are summed up at the end.

use crate::bundle::staging_dir_for;
use crate::close::size_delta;
use crate::orphan::Occupant;
use crate::request::UnbundleRequest;
use crate::server::Server;
use datagrid_catalog::{ReplicaFilter, ReplicaPatch};
use datagrid_common::error::FileOp;
use datagrid_common::{
    now_secs, ClientConnection, Error, PolicyHook, ReplicaInfo, ReplicaStatus, Result,
};
use datagrid_resource::path::{logical_to_physical, mkdir_for_file_path, mkdir_r};
use datagrid_resource::{ResolvedHierarchy, ResourceNode};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

impl Server {
    /// Extract a bundle object and register its members under `target_coll`
    pub fn unbundle(
        &self,
        comm: &ClientConnection,
        req: UnbundleRequest,
    ) -> Result<Vec<ReplicaInfo>> {
        let bundle = self
            .catalog
            .get_data_obj_info(&req.bundle_path, &ReplicaFilter::all().good_only())?
            .into_iter()
            .find(|r| {
                self.tree
                    .leaf_of_hier(&r.resc_hier)
                    .is_ok_and(|leaf| leaf.host() == self.tree.local_host())
            })
            .ok_or_else(|| {
                Error::DataObjectNotFound(format!("no local good replica of {}", req.bundle_path))
            })?;

        let roots = self
            .catalog
            .get_resc_grp_for_create(&req.target_coll, req.dest_resource.as_deref())?;
        let resolved = self.rank_for_create(comm, &req.target_coll, bundle.size, &roots)?;
        let Some(resolved) = resolved.into_iter().find(|r| r.local) else {
            return Err(Error::not_supported(format!(
                "unbundle of {} onto a remote host",
                req.bundle_path
            )));
        };
        let leaf = self.tree.get(&resolved.leaf)?;
        self.apply_policy(PolicyHook::BulkPutPolicy, comm, &bundle)?;

        let coll_phy = PathBuf::from(logical_to_physical(leaf.vault_path(), &req.target_coll));
        let staging = self.prepare_staging(comm, leaf, &resolved, &coll_phy)?;
        if let Err(e) = self
            .packer
            .unpack(Path::new(&bundle.phy_path), &staging)
        {
            if let Err(rm) = fs::remove_dir_all(&staging) {
                warn!("Staging {} not removed: {}", staging.display(), rm);
            }
            return Err(e);
        }

        let mut registered = Vec::new();
        let mut failed = 0;
        let mut first_error = None;
        let files: Vec<PathBuf> = WalkDir::new(&staging)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .collect();
        for staged in &files {
            let relative = staged
                .strip_prefix(&staging)
                .map_err(|e| Error::internal(e.to_string()))?;
            let obj_path = format!(
                "{}/{}",
                req.target_coll.trim_end_matches('/'),
                relative.to_string_lossy()
            );
            let result = self.register_subfile(comm, leaf, &resolved, &req, &obj_path, staged);
            if let Err(e) = fs::remove_file(staged)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("Staged file {} not removed: {}", staged.display(), e);
            }
            match result {
                Ok(row) => registered.push(row),
                Err(e) if e.is_benign_catalog() => {
                    debug!("Subfile {} vanished during unbundle: {}", obj_path, e);
                }
                Err(e) => {
                    warn!("Subfile {} of {} failed: {}", obj_path, req.bundle_path, e);
                    failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Err(e) = fs::remove_dir_all(&staging) {
            warn!("Staging {} not removed: {}", staging.display(), e);
        }

        self.apply_policy(PolicyHook::BulkPostProcess, comm, &bundle)?;
        info!(
            "Unbundled {} into {}: {} registered, {} failed",
            req.bundle_path,
            req.target_coll,
            registered.len(),
            failed
        );
        match first_error {
            Some(first) => Err(Error::PartialFailure {
                succeeded: registered.len(),
                required: registered.len() + failed,
                first: Box::new(first),
            }),
            None => Ok(registered),
        }
    }

    /// Empty staging directory below the target collection's physical path
    ///
    /// Anything already sitting at the chosen path is moved aside as an
    /// orphan, unless a replica owns it.
    fn prepare_staging(
        &self,
        comm: &ClientConnection,
        leaf: &ResourceNode,
        resolved: &ResolvedHierarchy,
        coll_phy: &Path,
    ) -> Result<PathBuf> {
        let staging = staging_dir_for(&coll_phy.join("bundle"));
        let staging_str = staging.display().to_string();
        match self.check_and_handle_orphan(comm, leaf, &resolved.hier, &staging_str)? {
            Occupant::Free => {}
            Occupant::Relocated(to) => debug!("Moved stale staging {} to {}", staging_str, to),
            Occupant::Owned(owner) => {
                return Err(Error::CopyAlreadyInResource {
                    path: owner.obj_path,
                    resource: leaf.name().to_string(),
                });
            }
        }
        mkdir_r(&staging, self.config.vault.default_dir_mode)
            .map_err(|e| Error::io(FileOp::Mkdir, leaf.name(), staging_str, e))?;
        Ok(staging)
    }

    /// Link one extracted file into place and register it
    fn register_subfile(
        &self,
        comm: &ClientConnection,
        leaf: &ResourceNode,
        resolved: &ResolvedHierarchy,
        req: &UnbundleRequest,
        obj_path: &str,
        staged: &Path,
    ) -> Result<ReplicaInfo> {
        let target = logical_to_physical(leaf.vault_path(), obj_path);
        let existing = self
            .catalog
            .get_data_obj_info(obj_path, &ReplicaFilter::all())?
            .into_iter()
            .find(|r| r.resc_hier == resolved.hier);

        let replace = match self.check_and_handle_orphan(comm, leaf, &resolved.hier, &target)? {
            Occupant::Free | Occupant::Relocated(_) => false,
            Occupant::Owned(owner) if req.force && owner.obj_path == obj_path => true,
            Occupant::Owned(owner) => {
                return Err(Error::CopyAlreadyInResource {
                    path: owner.obj_path,
                    resource: leaf.name().to_string(),
                });
            }
        };
        if existing.is_some() && !req.force {
            return Err(Error::CopyAlreadyInResource {
                path: obj_path.to_string(),
                resource: resolved.hier.clone(),
            });
        }

        mkdir_for_file_path(&target, self.config.vault.default_dir_mode)
            .map_err(|e| Error::io(FileOp::Mkdir, leaf.name(), target.clone(), e))?;
        // a replaced file keeps its bytes until the new row is in
        let linked = if replace {
            format!("{target}.{}", rand::random::<u32>())
        } else {
            target.clone()
        };
        fs::hard_link(staged, &linked)
            .map_err(|e| Error::io(FileOp::Link, leaf.name(), linked.clone(), e))?;
        let registered = fs::metadata(&linked)
            .map_err(|e| Error::io(FileOp::Stat, leaf.name(), linked.clone(), e))
            .and_then(|meta| {
                self.register_unbundled(comm, resolved, obj_path, &target, meta.len(), existing)
            });
        let row = match registered {
            Ok(row) => row,
            Err(e) => {
                if replace && let Err(rm) = fs::remove_file(&linked) {
                    warn!("Could not remove {}: {}", linked, rm);
                }
                return Err(e);
            }
        };
        if replace {
            fs::rename(&linked, &target).map_err(|e| {
                error!(
                    "Subfile {} registered but left at {}, {} still holds the old bytes: {}",
                    obj_path, linked, target, e
                );
                Error::io(FileOp::Rename, leaf.name(), target.clone(), e)
            })?;
        }
        debug!("Registered subfile {} at {}", obj_path, target);
        Ok(row)
    }

    /// Catalog row for an unbundled file of `size` bytes at `target`
    fn register_unbundled(
        &self,
        comm: &ClientConnection,
        resolved: &ResolvedHierarchy,
        obj_path: &str,
        target: &str,
        size: u64,
        existing: Option<ReplicaInfo>,
    ) -> Result<ReplicaInfo> {
        match existing {
            Some(old) => {
                let patch = ReplicaPatch {
                    size: Some(size),
                    checksum: Some(String::new()),
                    status: Some(ReplicaStatus::good()),
                    phy_path: Some(target.to_string()),
                    modify_time: Some(now_secs()),
                    mark_other_replicas_stale: true,
                    ..ReplicaPatch::default()
                };
                let row = self.catalog.modify_replica(obj_path, old.repl_num, &patch)?;
                self.adjust_quota(row.root_resource(), size_delta(old.size, size));
                Ok(row)
            }
            None => {
                let template = ReplicaInfo {
                    obj_path: obj_path.to_string(),
                    repl_num: -1,
                    resc_hier: resolved.hier.clone(),
                    phy_path: target.to_string(),
                    size,
                    status: ReplicaStatus::good(),
                    mode: self.config.vault.default_file_mode,
                    owner: comm.user.clone(),
                    ..ReplicaInfo::default()
                };
                let row = self.catalog.register_replica(template)?;
                self.adjust_quota(row.root_resource(), i64::try_from(size).unwrap_or(i64::MAX));
                Ok(row)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::DataObjRequest;
    use crate::testutil::{comm, failing_catalog_server, put_bytes, single_resource};
    use datagrid_catalog::PathKind;

    fn bundled(server: &Server) -> ReplicaInfo {
        put_bytes(server, "/tempZone/home/u/src/a/1.txt", "disk", b"one");
        put_bytes(server, "/tempZone/home/u/src/b/2.txt", "disk", b"two");
        server
            .bundle_collection(&comm(), "/tempZone/home/u/src", "/tempZone/home/u/b.tar", None)
            .unwrap()
    }

    fn request(force: bool) -> UnbundleRequest {
        UnbundleRequest {
            bundle_path: "/tempZone/home/u/b.tar".into(),
            target_coll: "/tempZone/home/u/dst".into(),
            dest_resource: Some("disk".into()),
            force,
        }
    }

    #[test]
    fn test_unbundle_registers_members() {
        let (dir, server) = single_resource();
        bundled(&server);
        let rows = server.unbundle(&comm(), request(false)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            server.catalog().stat_path("/tempZone/home/u/dst/a/1.txt").unwrap(),
            PathKind::DataObject
        );
        assert_eq!(fs::read(dir.path().join("disk/home/u/dst/b/2.txt")).unwrap(), b"two");
        let mut out = Vec::new();
        server
            .get(&comm(), DataObjRequest::new("/tempZone/home/u/dst/a/1.txt"), &mut out)
            .unwrap();
        assert_eq!(out, b"one");
    }

    #[test]
    fn test_collision_fails_one_subfile_only() {
        let (dir, server) = single_resource();
        bundled(&server);
        // a/1.txt already has a replica at the target path
        put_bytes(&server, "/tempZone/home/u/dst/a/1.txt", "disk", b"mine");

        let err = server.unbundle(&comm(), request(false)).unwrap_err();
        let Error::PartialFailure { succeeded, required, first } = err else {
            panic!("expected partial failure, got {err}");
        };
        assert_eq!((succeeded, required), (1, 2));
        assert!(matches!(*first, Error::CopyAlreadyInResource { .. }));
        assert_eq!(fs::read(dir.path().join("disk/home/u/dst/a/1.txt")).unwrap(), b"mine");
        assert_eq!(fs::read(dir.path().join("disk/home/u/dst/b/2.txt")).unwrap(), b"two");
    }

    #[test]
    fn test_force_overwrites_own_replica() {
        let (dir, server) = single_resource();
        bundled(&server);
        put_bytes(&server, "/tempZone/home/u/dst/a/1.txt", "disk", b"older");
        let rows = server.unbundle(&comm(), request(true)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(fs::read(dir.path().join("disk/home/u/dst/a/1.txt")).unwrap(), b"one");
        let info = server
            .catalog()
            .get_data_obj_info("/tempZone/home/u/dst/a/1.txt", &ReplicaFilter::all())
            .unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].size, 3);
    }

    #[test]
    fn test_orphan_at_target_is_moved_aside() {
        let (dir, server) = single_resource();
        bundled(&server);
        let target = dir.path().join("disk/home/u/dst/b/2.txt");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, b"stray").unwrap();

        server.unbundle(&comm(), request(false)).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"two");
        let orphans = fs::read_dir(dir.path().join("disk/orphan")).unwrap().count();
        assert_eq!(orphans, 1);
    }

    #[test]
    fn test_failed_overwrite_keeps_old_bytes() {
        let (dir, server, catalog) = failing_catalog_server();
        bundled(&server);
        let old = put_bytes(&server, "/tempZone/home/u/dst/a/1.txt", "disk", b"older");
        catalog.fail_modify(true);

        let err = server.unbundle(&comm(), request(true)).unwrap_err();
        assert!(matches!(
            err,
            Error::PartialFailure {
                succeeded: 1,
                required: 2,
                ..
            }
        ));
        let target = dir.path().join("disk/home/u/dst/a/1.txt");
        assert_eq!(fs::read(&target).unwrap(), b"older");
        let names: Vec<_> = fs::read_dir(target.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec!["1.txt"]);
        let info = server
            .catalog()
            .get_data_obj_info("/tempZone/home/u/dst/a/1.txt", &ReplicaFilter::all())
            .unwrap();
        assert_eq!(info[0].size, old.size);
    }
}
