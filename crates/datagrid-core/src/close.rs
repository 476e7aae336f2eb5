//! Closing descriptors
//!
//! Close is where a write becomes a replica: the size is checked, the
//! checksum reconciled and the catalog row made good. Whatever happens,
//! the descriptor slot is released before close returns.

use crate::l1desc::{L1Descriptor, L1Handle};
use crate::remote::{unexpected, RemoteReply, RemoteRequest};
use crate::replicate::short_of_copies;
use crate::request::DataObjRequest;
use crate::server::Server;
use crate::staging::Tier;
use datagrid_catalog::ReplicaPatch;
use datagrid_common::{
    now_secs, ClientConnection, Error, OperationType, PolicyHook, ReplicaInfo, ReplicaStatus,
    Result, StagingMode,
};
use datagrid_resource::{DataObject, ObjectRef};
use tracing::{debug, error, info, warn};

impl Server {
    /// Finish the operation behind `handle` and free its descriptor
    pub fn close(&self, comm: &ClientConnection, handle: L1Handle) -> Result<ReplicaInfo> {
        let shared = self.descriptors.get(handle)?;
        let result = {
            let mut desc = shared.lock();
            self.close_descriptor(comm, &mut desc)
        };
        let released = self.descriptors.release(handle);
        let replica = result.inspect_err(|e| warn!("Close of descriptor {} failed: {}", handle, e))?;
        released?;
        Ok(replica)
    }

    /// Close the destination, then its paired source
    fn close_descriptor(
        &self,
        comm: &ClientConnection,
        desc: &mut L1Descriptor,
    ) -> Result<ReplicaInfo> {
        let src = desc.src.take();
        let result = self.finish(comm, desc, src);
        if let Some(src) = src {
            match (&result, self.close(comm, src)) {
                (Ok(_), Err(e)) => return Err(e),
                (Err(_), Err(e)) => warn!("Close of source descriptor {} failed: {}", src, e),
                _ => {}
            }
        }
        result
    }

    fn finish(
        &self,
        comm: &ClientConnection,
        desc: &mut L1Descriptor,
        src: Option<L1Handle>,
    ) -> Result<ReplicaInfo> {
        if let Some(remote) = desc.remote.take() {
            let close = RemoteRequest::Close {
                fd: remote.remote_fd,
            };
            return match self.remote.forward(&remote.host, close)? {
                RemoteReply::Done => Ok(desc.replica.clone()),
                RemoteReply::Replicas(mut rows) if !rows.is_empty() => Ok(rows.remove(0)),
                other => Err(unexpected(&remote.host, "close", &other)),
            };
        }

        if matches!(&desc.object, ObjectRef::File(f) if f.is_open()) {
            self.tree.file_close(comm, &mut desc.object)?;
        }
        if !desc.wrote && !desc.op_type.is_destination() {
            debug!("Close of unmodified {}", desc.request.obj_path);
            return Ok(desc.replica.clone());
        }

        let size = match desc.size_override {
            Some(size) => size,
            None => {
                let mut stat_ref = ObjectRef::Data(DataObject::new(
                    desc.object.physical_path(),
                    desc.object.resc_hier(),
                ));
                self.physical_size(comm, &mut stat_ref)?
            }
        };
        if !desc.request.no_size_check
            && let Some(expected) = desc.request.data_size
            && expected != size
        {
            error!(
                "Size of {} at {}: expected {} bytes, found {}",
                desc.request.obj_path,
                desc.object.physical_path(),
                expected,
                size
            );
            return Err(Error::CopyLength {
                path: desc.request.obj_path.clone(),
                expected,
                actual: size,
            });
        }

        let mut written = desc.replica.clone();
        written.phy_path = desc.object.physical_path().to_string();
        written.resc_hier = desc.object.resc_hier().to_string();
        written.size = size;

        let on_cache = self
            .compound_tier(&written.resc_hier)?
            .is_some_and(|p| p.tier == Tier::Cache);
        let checksum = if on_cache {
            None
        } else {
            self.proc_checksum_for_close(comm, desc, &written)?
        };
        let checksum_patch = match checksum {
            Some(value) if value != desc.replica.checksum => Some(value),
            Some(_) => None,
            None if desc.replica.has_checksum() => Some(String::new()),
            None => None,
        };

        let row = match desc.op_type {
            OperationType::PhymvDest => {
                let src = src.ok_or_else(|| {
                    Error::internal(format!("phymv of {} has no source", written.obj_path))
                })?;
                self.finish_phymv(comm, &written, checksum_patch, src)?
            }
            _ if desc.register_at_close => {
                let template = ReplicaInfo {
                    checksum: checksum_patch.unwrap_or_default(),
                    status: ReplicaStatus::good(),
                    create_time: 0,
                    modify_time: 0,
                    ..written.clone()
                };
                let row = self.catalog.register_replica(template).inspect_err(|e| {
                    error!(
                        "Registration of {} at {} failed, physical file left in place: {}",
                        written.obj_path, written.phy_path, e
                    );
                })?;
                if let Ok(file) = desc.object.as_file_mut() {
                    file.repl_num = row.repl_num;
                }
                self.tree.file_registered(comm, &mut desc.object)?;
                self.adjust_quota(row.root_resource(), i64::try_from(size).unwrap_or(i64::MAX));
                row
            }
            _ => {
                let patch = ReplicaPatch {
                    size: Some(size),
                    checksum: checksum_patch,
                    status: Some(ReplicaStatus::good()),
                    modify_time: Some(now_secs()),
                    mark_other_replicas_stale: !desc.op_type.is_destination(),
                    ..ReplicaPatch::default()
                };
                let row = self
                    .catalog
                    .modify_replica(&written.obj_path, written.repl_num, &patch)
                    .inspect_err(|e| {
                        error!(
                            "Update of replica {} of {} failed, physical file left in place: {}",
                            written.repl_num, written.obj_path, e
                        );
                    })?;
                let before = if desc.replica_existed { desc.replica.size } else { 0 };
                self.adjust_quota(row.root_resource(), size_delta(before, size));
                row
            }
        };
        if let Err(e) = self.tree.file_modified(comm, &mut desc.object) {
            warn!("Modified notification for {} failed: {}", row.phy_path, e);
        }
        info!(
            "Closed replica {} of {} on \"{}\" with {} bytes",
            row.repl_num, row.obj_path, row.resc_hier, row.size
        );

        let row = if on_cache {
            self.finish_compound(comm, desc, row)?
        } else {
            row
        };

        let pending = std::mem::take(&mut desc.pending_targets);
        if desc.copies_required > 1 {
            self.replicate_pending(comm, desc, &row, &pending)?;
        }

        let hook = match desc.op_type {
            OperationType::Put => Some(PolicyHook::PostPut),
            OperationType::CopyDest => Some(PolicyHook::PostCopy),
            OperationType::ReplicateDest => Some(PolicyHook::PostReplicate),
            OperationType::PhymvDest => Some(PolicyHook::PostPhymv),
            _ => None,
        };
        if let Some(hook) = hook {
            self.apply_policy(hook, comm, &row)?;
        }
        Ok(row)
    }

    /// Point the source row at the new location, then drop the old file
    ///
    /// The old file is only unlinked once the row update succeeded.
    fn finish_phymv(
        &self,
        comm: &ClientConnection,
        written: &ReplicaInfo,
        checksum_patch: Option<String>,
        src: L1Handle,
    ) -> Result<ReplicaInfo> {
        let source = self.descriptors.get(src)?.lock().replica.clone();
        let patch = ReplicaPatch {
            size: Some(written.size),
            checksum: checksum_patch,
            status: Some(ReplicaStatus::good()),
            phy_path: Some(written.phy_path.clone()),
            resc_hier: Some(written.resc_hier.clone()),
            modify_time: Some(now_secs()),
            mark_other_replicas_stale: false,
        };
        let row = self
            .catalog
            .modify_replica(&source.obj_path, source.repl_num, &patch)
            .inspect_err(|e| {
                error!(
                    "Move of replica {} of {} to \"{}\" not registered, source kept at {}: {}",
                    source.repl_num, source.obj_path, written.resc_hier, source.phy_path, e
                );
            })?;

        let mut old = Self::data_object(&source);
        match self.tree.file_unlink(comm, &mut old) {
            Ok(()) => {
                if let Err(e) = self.tree.file_unregistered(comm, &mut old) {
                    warn!("Unregistered notification for {} failed: {}", source.phy_path, e);
                }
            }
            Err(e) => warn!(
                "Moved replica {} of {} but its old file {} remains: {}",
                source.repl_num, source.obj_path, source.phy_path, e
            ),
        }
        self.adjust_quota(
            source.root_resource(),
            -i64::try_from(source.size).unwrap_or(i64::MAX),
        );
        self.adjust_quota(
            row.root_resource(),
            i64::try_from(row.size).unwrap_or(i64::MAX),
        );
        info!(
            "Moved replica {} of {} from \"{}\" to \"{}\"",
            row.repl_num, row.obj_path, source.resc_hier, row.resc_hier
        );
        Ok(row)
    }

    /// Sync a written cache replica to its archive, then checksum both
    fn finish_compound(
        &self,
        comm: &ClientConnection,
        desc: &mut L1Descriptor,
        cached: ReplicaInfo,
    ) -> Result<ReplicaInfo> {
        let archived = self.sync_to_archive(comm, &cached)?;
        desc.staging = StagingMode::SyncDest;

        let Some(value) = self.proc_checksum_for_close(comm, desc, &cached)? else {
            return Ok(cached);
        };
        let patch = ReplicaPatch {
            checksum: Some(value),
            ..ReplicaPatch::default()
        };
        self.catalog
            .modify_replica(&archived.obj_path, archived.repl_num, &patch)?;
        self.catalog
            .modify_replica(&cached.obj_path, cached.repl_num, &patch)
    }

    /// Make the extra copies a multi-copy create still owes
    fn replicate_pending(
        &self,
        comm: &ClientConnection,
        desc: &L1Descriptor,
        row: &ReplicaInfo,
        pending: &[String],
    ) -> Result<()> {
        let required = desc.copies_required;
        let mut succeeded = 1;
        let mut first_error = None;
        for root in pending {
            let mut req = DataObjRequest::new(&row.obj_path)
                .with_resource(root.as_str())
                .with_repl_num(row.repl_num);
            req.checksum = desc.request.checksum;
            match self.replicate(comm, req) {
                Ok(_) => succeeded += 1,
                Err(e) => {
                    warn!("Extra copy of {} on {} failed: {}", row.obj_path, root, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if succeeded < required {
            return Err(short_of_copies(&row.obj_path, succeeded, required, first_error));
        }
        Ok(())
    }

    pub(crate) fn adjust_quota(&self, resource: &str, delta: i64) {
        if delta == 0 {
            return;
        }
        if let Err(e) = self.catalog.update_quota_usage(resource, delta) {
            warn!("Quota update of {} by {} failed: {}", resource, delta, e);
        }
    }
}

pub(crate) fn size_delta(before: u64, after: u64) -> i64 {
    let before = i64::try_from(before).unwrap_or(i64::MAX);
    let after = i64::try_from(after).unwrap_or(i64::MAX);
    after - before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::open::read_request;
    use crate::testutil::{comm, failing_catalog_server, put_bytes, single_resource, RecordingRules};
    use datagrid_catalog::ReplicaFilter;
    use std::fs;

    #[test]
    fn test_read_only_close_leaves_row_alone() {
        let (_dir, server) = single_resource();
        let before = put_bytes(&server, "/tempZone/home/u/r", "disk", b"abc");
        let handle = server.open(&comm(), read_request("/tempZone/home/u/r")).unwrap();
        let after = server.close(&comm(), handle).unwrap();
        assert_eq!(before, after);
        assert!(server.descriptor(handle).is_err());
    }

    #[test]
    fn test_overwrite_marks_other_replicas_stale() {
        let (_dir, server) = crate::testutil::two_resources();
        let obj = "/tempZone/home/u/w";
        put_bytes(&server, obj, "disk1", b"v1");
        server
            .replicate(&comm(), DataObjRequest::new(obj).with_resource("disk2"))
            .unwrap();

        let req = DataObjRequest::new(obj)
            .with_src_resource("disk1")
            .with_flags(datagrid_common::OpenFlags::WRITE_TRUNCATE);
        let handle = server.open(&comm(), req).unwrap();
        server.write(&comm(), handle, b"version two").unwrap();
        server.close(&comm(), handle).unwrap();

        let rows = server
            .catalog()
            .get_data_obj_info(obj, &ReplicaFilter::all())
            .unwrap();
        let on1 = rows.iter().find(|r| r.resc_hier == "disk1").unwrap();
        let on2 = rows.iter().find(|r| r.resc_hier == "disk2").unwrap();
        assert!(on1.status.is_good());
        assert_eq!(on1.size, 11);
        assert!(on2.status.is_dirty());
    }

    #[test]
    fn test_modify_failure_keeps_bytes_and_frees_slot() {
        let (_dir, server, catalog) = failing_catalog_server();
        let handle = server
            .create(&comm(), DataObjRequest::new("/tempZone/home/u/m").with_resource("disk"))
            .unwrap();
        server.write(&comm(), handle, b"kept").unwrap();
        let phy = server.descriptor(handle).unwrap().lock().replica.phy_path.clone();
        catalog.fail_modify(true);
        let err = server.close(&comm(), handle).unwrap_err();
        assert!(matches!(err, Error::Catalog(_)));
        assert_eq!(fs::read(phy).unwrap(), b"kept");
        assert_eq!(server.descriptor_usage().0, 0);
    }

    #[test]
    fn test_put_hook_runs_after_registration() {
        let rules = std::sync::Arc::new(RecordingRules::default());
        let (_dir, server) = crate::testutil::single_resource_with_rules(rules.clone());
        put_bytes(&server, "/tempZone/home/u/h", "disk", b"x");
        assert_eq!(
            rules.hooks(),
            vec![PolicyHook::PostCreate, PolicyHook::PostPut]
        );
    }

    #[test]
    fn test_failing_put_hook_keeps_registration() {
        let rules = std::sync::Arc::new(RecordingRules::default());
        rules.fail_on(PolicyHook::PostPut);
        let (_dir, server) = crate::testutil::single_resource_with_rules(rules);
        let err = server
            .put(
                &comm(),
                DataObjRequest::new("/tempZone/home/u/h").with_resource("disk"),
                &mut &b"kept"[..],
            )
            .unwrap_err();
        assert!(matches!(err, Error::Policy { .. }));
        let rows = server
            .catalog()
            .get_data_obj_info("/tempZone/home/u/h", &ReplicaFilter::all())
            .unwrap();
        assert!(rows[0].status.is_good());
        assert_eq!(server.descriptor_usage().0, 0);
    }

    #[test]
    fn test_quota_tracks_written_bytes() {
        let (_dir, server) = single_resource();
        put_bytes(&server, "/tempZone/home/u/q1", "disk", b"12345");
        put_bytes(&server, "/tempZone/home/u/q2", "disk", b"123");
        assert_eq!(server.catalog().quota_usage("disk").unwrap(), 8);
    }

    #[test]
    fn test_physical_failure_at_close_frees_slot() {
        let (_dir, server) = single_resource();
        let obj = "/tempZone/home/u/vanished";
        let handle = server
            .create(&comm(), DataObjRequest::new(obj).with_resource("disk"))
            .unwrap();
        server.write(&comm(), handle, b"gone soon").unwrap();
        let phy = server.descriptor(handle).unwrap().lock().replica.phy_path.clone();
        fs::remove_file(&phy).unwrap();

        let err = server.close(&comm(), handle).unwrap_err();
        assert!(err.is_not_found(), "{err}");
        assert_eq!(server.descriptor_usage().0, 0);
        assert!(server.descriptor(handle).is_err());
        // the row never became good
        let rows = server
            .catalog()
            .get_data_obj_info(obj, &ReplicaFilter::all())
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].status.is_good());
    }
}
