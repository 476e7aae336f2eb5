//! Data object creation
//!
//! A create either reopens an existing object for overwrite (when forced or
//! aimed at a replica number) or places a new replica: the catalog ranks
//! the candidate resources, each candidate is asked for a vote, and the
//! physical file is created on the best one that works. Extra copies asked
//! for by the request are attached to the descriptor and made at close.

use crate::l1desc::{L1Descriptor, L1Handle};
use crate::remote::RemoteRequest;
use crate::request::DataObjRequest;
use crate::server::Server;
use datagrid_catalog::PathKind;
use datagrid_common::{
    validate_obj_path, ClientConnection, Error, OpenFlags, Operation, OperationType, PolicyHook,
    ReplicaInfo, ReplicaStatus, Result,
};
use datagrid_resource::path::logical_to_physical;
use datagrid_resource::redirect::resolve_resource_hierarchy;
use datagrid_resource::{FileObject, ObjectRef, ResolvedHierarchy};
use tracing::{debug, error, info, warn};

impl Server {
    /// Create a data object and open it for writing
    pub fn create(&self, comm: &ClientConnection, req: DataObjRequest) -> Result<L1Handle> {
        self.create_with(comm, req, OperationType::Create)
    }

    pub(crate) fn create_with(
        &self,
        comm: &ClientConnection,
        mut req: DataObjRequest,
        op_type: OperationType,
    ) -> Result<L1Handle> {
        validate_obj_path(&req.obj_path)?;
        req.flags = OpenFlags::CREATE;
        if let Some(host) = self.remote_zone_host(&req.obj_path)? {
            req.forwarded = true;
            return self.open_remote(&host, RemoteRequest::Create(req.clone()), op_type, req);
        }

        match self.catalog.stat_path(&req.obj_path)? {
            PathKind::Collection => Err(Error::PathIsCollection(req.obj_path)),
            PathKind::DataObject if req.force || req.repl_num.is_some() => {
                debug!("Create of existing {} reopens it for overwrite", req.obj_path);
                req.flags = OpenFlags::WRITE_TRUNCATE;
                let handle = self.open_existing(comm, req, op_type)?;
                self.descriptors.get(handle)?.lock().wrote = true;
                Ok(handle)
            }
            PathKind::DataObject => Err(Error::OverwriteWithoutForce(req.obj_path)),
            PathKind::None => self.create_new(comm, req, op_type),
        }
    }

    /// Candidate hierarchies for a new replica, best vote first
    ///
    /// Equal votes keep catalog order. A single candidate's failure is
    /// returned as is, so a down resource reports "resource down".
    pub(crate) fn rank_for_create(
        &self,
        comm: &ClientConnection,
        obj_path: &str,
        size: u64,
        roots: &[String],
    ) -> Result<Vec<ResolvedHierarchy>> {
        let mut file = FileObject::for_vote(obj_path, &[], None);
        file.size = size;

        let mut ranked = Vec::new();
        let mut first_error = None;
        for root in roots {
            match resolve_resource_hierarchy(
                &self.tree,
                comm,
                Operation::Create,
                &file,
                std::slice::from_ref(root),
            ) {
                Ok(resolved) => ranked.push(resolved),
                Err(e) if roots.len() == 1 => return Err(e),
                Err(e) => {
                    warn!("Create of {}: skipping candidate {}: {}", obj_path, root, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if ranked.is_empty() {
            return Err(first_error
                .unwrap_or_else(|| Error::NoResourceAvailable(format!("create of {obj_path}"))));
        }
        ranked.sort_by(|a, b| b.vote.total_cmp(&a.vote));
        Ok(ranked)
    }

    fn create_new(
        &self,
        comm: &ClientConnection,
        req: DataObjRequest,
        op_type: OperationType,
    ) -> Result<L1Handle> {
        let roots = self
            .catalog
            .get_resc_grp_for_create(&req.obj_path, req.dest_resource.as_deref())?;
        let ranked = self.rank_for_create(comm, &req.obj_path, req.data_size.unwrap_or(0), &roots)?;
        // candidates that cannot vote still count against ALL
        let required = req.copies.required(roots.len());

        let mut first_error = None;
        for (idx, resolved) in ranked.iter().enumerate() {
            match self.physical_create(comm, req.clone(), op_type, resolved) {
                Ok(handle) => {
                    let pending: Vec<String> = ranked[idx + 1..]
                        .iter()
                        .take(required.saturating_sub(1))
                        .map(|r| r.root.clone())
                        .collect();
                    if required > 1 {
                        debug!(
                            "Create of {} owes {} more copies on {:?}",
                            req.obj_path,
                            required - 1,
                            pending
                        );
                        let shared = self.descriptors.get(handle)?;
                        let mut desc = shared.lock();
                        desc.pending_targets = pending;
                        desc.copies_required = required;
                    }
                    return Ok(handle);
                }
                Err(e) => {
                    warn!(
                        "Create of {} on \"{}\" failed: {}",
                        req.obj_path, resolved.hier, e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(first_error
            .unwrap_or_else(|| Error::NoResourceAvailable(format!("create of {}", req.obj_path))))
    }

    /// Create the physical file on a resolved hierarchy and register it
    ///
    /// The row is registered stale with size 0 and becomes good at close.
    /// If registration fails the physical file stays where it is.
    fn physical_create(
        &self,
        comm: &ClientConnection,
        mut req: DataObjRequest,
        op_type: OperationType,
        resolved: &ResolvedHierarchy,
    ) -> Result<L1Handle> {
        req.flags = OpenFlags::CREATE;
        if !resolved.local {
            req.resc_hier = Some(resolved.hier.clone());
            req.forwarded = true;
            return self.open_remote(
                &resolved.leaf_host,
                RemoteRequest::Create(req.clone()),
                op_type,
                req,
            );
        }

        let leaf = self.tree.get(&resolved.leaf)?;
        let phy_path = logical_to_physical(leaf.vault_path(), &req.obj_path);
        let mut file = FileObject::new(&req.obj_path, phy_path, &resolved.hier);
        file.mode = self.file_mode(req.mode);
        file.flags = OpenFlags::CREATE;
        file.size = req.data_size.unwrap_or(0);
        file.creating = true;
        let mut object = ObjectRef::File(file);

        match self.tree.file_create(comm, &mut object) {
            Err(e) if e.is_already_exists() => {
                self.resolve_dup_file_path(comm, leaf, &mut object)?;
                self.tree.file_create(comm, &mut object)?;
            }
            other => other?,
        }

        let template = ReplicaInfo {
            obj_path: req.obj_path.clone(),
            repl_num: -1,
            resc_hier: resolved.hier.clone(),
            phy_path: object.physical_path().to_string(),
            size: 0,
            status: ReplicaStatus::STALE,
            data_type: req.data_type.clone(),
            mode: object.mode(),
            owner: comm.user.clone(),
            ..ReplicaInfo::default()
        };
        let replica = match self.catalog.register_replica(template) {
            Ok(row) => row,
            Err(e) => {
                error!(
                    "Registration of {} at {} failed, physical file left in place: {}",
                    req.obj_path,
                    object.physical_path(),
                    e
                );
                if let Err(close_err) = self.tree.file_close(comm, &mut object) {
                    warn!("Close of unregistered {} failed: {}", object.physical_path(), close_err);
                }
                return Err(e);
            }
        };
        if let Ok(file) = object.as_file_mut() {
            file.repl_num = replica.repl_num;
        }
        self.tree.file_registered(comm, &mut object)?;
        info!(
            "Created {} replica {} on \"{}\"",
            replica.obj_path, replica.repl_num, replica.resc_hier
        );

        let mut desc = L1Descriptor::new(op_type, req, replica.clone(), object);
        desc.wrote = true;
        let handle = self.allocate_descriptor(desc)?;
        if let Err(e) = self.apply_policy(PolicyHook::PostCreate, comm, &replica) {
            self.abort(comm, handle);
            return Err(e);
        }
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteReply;
    use crate::testutil::{
        comm, failing_catalog_server, put_bytes, single_resource, two_hosts, two_resources,
        RecordingRemote,
    };
    use std::sync::Arc;
    use datagrid_catalog::ReplicaFilter;
    use datagrid_common::{CopyCount, ResourceStatus};
    use std::fs;

    #[test]
    fn test_create_registers_newly_created_copy() {
        let (_dir, server) = single_resource();
        let handle = server
            .create(&comm(), DataObjRequest::new("/tempZone/home/u/f.txt").with_resource("disk"))
            .unwrap();
        {
            let desc = server.descriptor(handle).unwrap();
            let desc = desc.lock();
            assert_eq!(desc.replica.resc_hier, "disk");
            assert_eq!(desc.replica.status, ReplicaStatus::STALE);
        }
        server.write(&comm(), handle, b"hello").unwrap();
        let replica = server.close(&comm(), handle).unwrap();
        assert!(replica.status.is_good());
        assert_eq!(replica.size, 5);
        assert_eq!(replica.repl_num, 0);
    }

    #[test]
    fn test_existing_object_needs_force() {
        let (_dir, server) = single_resource();
        put_bytes(&server, "/tempZone/home/u/f.txt", "disk", b"one");
        let err = server
            .create(&comm(), DataObjRequest::new("/tempZone/home/u/f.txt"))
            .unwrap_err();
        assert!(matches!(err, Error::OverwriteWithoutForce(_)));

        let handle = server
            .create(&comm(), DataObjRequest::new("/tempZone/home/u/f.txt").with_force())
            .unwrap();
        server.write(&comm(), handle, b"second").unwrap();
        let replica = server.close(&comm(), handle).unwrap();
        assert_eq!(replica.size, 6);
        assert_eq!(fs::read(&replica.phy_path).unwrap(), b"second");
    }

    #[test]
    fn test_create_on_collection_is_path_error() {
        let (_dir, server) = single_resource();
        server.catalog().create_collection("/tempZone/home/u/dir").unwrap();
        let err = server
            .create(&comm(), DataObjRequest::new("/tempZone/home/u/dir"))
            .unwrap_err();
        assert!(matches!(err, Error::PathIsCollection(_)));
    }

    #[test]
    fn test_create_on_down_resource_reports_down() {
        let (dir, server) = single_resource();
        server.set_resource_status("disk", ResourceStatus::Down).unwrap();
        let err = server
            .create(&comm(), DataObjRequest::new("/tempZone/home/u/f.txt").with_resource("disk"))
            .unwrap_err();
        assert!(matches!(err, Error::ResourceDown(ref r) if r == "disk"));
        assert!(!dir.path().join("disk/home/u/f.txt").exists());
        assert!(
            server
                .catalog()
                .get_data_obj_info("/tempZone/home/u/f.txt", &ReplicaFilter::all())
                .unwrap()
                .is_empty()
        );
        assert_eq!(server.descriptor_usage().0, 0);
    }

    #[test]
    fn test_all_copies_made_at_close() {
        let (_dir, server) = two_resources();
        let req = DataObjRequest::new("/tempZone/home/u/g.txt")
            .with_resource("both")
            .with_copies(CopyCount::All);
        let handle = server.create(&comm(), req).unwrap();
        server.write(&comm(), handle, b"fan out").unwrap();
        server.close(&comm(), handle).unwrap();

        let replicas = server
            .catalog()
            .get_data_obj_info("/tempZone/home/u/g.txt", &ReplicaFilter::all().good_only())
            .unwrap();
        assert_eq!(replicas.len(), 2);
        for r in &replicas {
            assert_eq!(fs::read(&r.phy_path).unwrap(), b"fan out");
        }
    }

    #[test]
    fn test_registration_failure_keeps_physical_file() {
        let (dir, server, catalog) = failing_catalog_server();
        catalog.fail_register(true);
        let err = server
            .create(&comm(), DataObjRequest::new("/tempZone/home/u/p.txt").with_resource("disk"))
            .unwrap_err();
        assert!(matches!(err, Error::Catalog(_)));
        assert!(dir.path().join("disk/home/u/p.txt").exists());
        assert_eq!(server.descriptor_usage().0, 0);
    }

    #[test]
    fn test_put_writes_through_fresh_descriptor() {
        let (_dir, server) = single_resource();
        let handle = server
            .create(&comm(), DataObjRequest::new("/tempZone/home/u/plain"))
            .unwrap();
        assert_eq!(server.write(&comm(), handle, b"abc").unwrap(), 3);
        let replica = server.close(&comm(), handle).unwrap();
        assert_eq!(fs::read(&replica.phy_path).unwrap(), b"abc");

        let row = put_bytes(&server, "/tempZone/home/u/streamed", "disk", b"streamed");
        assert_eq!(row.size, 8);
    }

    #[test]
    fn test_cross_zone_create_is_writable() {
        let remote = Arc::new(RecordingRemote::default());
        let (_dir, server) = two_hosts(remote.clone());
        let obj = "/otherZone/home/u/f";
        remote.reply(RemoteReply::Opened {
            fd: 7,
            replica: ReplicaInfo {
                obj_path: obj.into(),
                ..ReplicaInfo::default()
            },
        });
        remote.reply(RemoteReply::Count(4));
        remote.reply(RemoteReply::Done);

        let handle = server.create(&comm(), DataObjRequest::new(obj)).unwrap();
        assert_eq!(server.write(&comm(), handle, b"data").unwrap(), 4);
        server.close(&comm(), handle).unwrap();

        let requests = remote.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|(host, _)| host == "zoneHost"));
        assert!(matches!(&requests[0].1, RemoteRequest::Create(req) if req.flags == OpenFlags::CREATE));
        assert!(matches!(&requests[1].1, RemoteRequest::Write { fd: 7, .. }));
        assert_eq!(server.descriptor_usage().0, 0);
    }

    #[test]
    fn test_create_short_of_copies_fails_at_close() {
        let (_dir, server) = two_resources();
        let obj = "/tempZone/home/u/n3";
        let req = DataObjRequest::new(obj)
            .with_resource("both")
            .with_copies(CopyCount::N(3));
        let handle = server.create(&comm(), req).unwrap();
        server.write(&comm(), handle, b"short").unwrap();
        let err = server.close(&comm(), handle).unwrap_err();
        assert!(matches!(
            err,
            Error::PartialFailure {
                succeeded: 2,
                required: 3,
                ..
            }
        ));

        // nothing made so far is rolled back
        let replicas = server
            .catalog()
            .get_data_obj_info(obj, &ReplicaFilter::all().good_only())
            .unwrap();
        assert_eq!(replicas.len(), 2);
        assert_eq!(server.descriptor_usage().0, 0);
    }

    #[test]
    fn test_create_all_copies_with_down_member() {
        let (_dir, server) = two_resources();
        server.set_resource_status("disk2", ResourceStatus::Down).unwrap();
        let obj = "/tempZone/home/u/all";
        let req = DataObjRequest::new(obj)
            .with_resource("both")
            .with_copies(CopyCount::All);
        let handle = server.create(&comm(), req).unwrap();
        server.write(&comm(), handle, b"lonely").unwrap();
        let err = server.close(&comm(), handle).unwrap_err();
        assert!(matches!(
            err,
            Error::PartialFailure {
                succeeded: 1,
                required: 2,
                ..
            }
        ));
        let replicas = server
            .catalog()
            .get_data_obj_info(obj, &ReplicaFilter::all())
            .unwrap();
        assert_eq!(replicas.len(), 1);
        assert!(replicas[0].status.is_good());
    }
}
