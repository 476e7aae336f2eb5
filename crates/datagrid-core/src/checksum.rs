//! Replica checksums
//!
//! Checksums are computed by streaming the physical bytes through the
//! digest named by the stored value (or the configured default when none
//! is stored). Verification never corrects a stored value.

use crate::l1desc::L1Descriptor;
use crate::remote::{unexpected, RemoteReply, RemoteRequest};
use crate::request::ChecksumRequest;
use crate::server::Server;
use crate::staging::Tier;
use datagrid_catalog::{ReplicaFilter, ReplicaPatch};
use datagrid_common::{
    validate_obj_path, ChecksumAlgorithm, ChecksumCalculator, ChecksumFlag, ChecksumMode,
    ClientConnection, Error, OpenFlags, ReplicaInfo, ResourceClass, Result,
};
use datagrid_resource::{FileObject, ObjectRef};
use tracing::{debug, error, info, warn};

fn mismatch(obj_path: &str, expected: &str, actual: String) -> Error {
    error!(
        "Checksum mismatch for {}: expected {}, computed {}",
        obj_path, expected, actual
    );
    Error::ChecksumMismatch {
        path: obj_path.to_string(),
        expected: expected.to_string(),
        actual,
    }
}

impl Server {
    /// Algorithm to use against `reference`, or the configured default
    fn algorithm_for(&self, reference: &str) -> ChecksumAlgorithm {
        ChecksumAlgorithm::from_checksum(reference).unwrap_or(self.config.checksum.algorithm)
    }

    /// Digest the physical bytes of `replica`
    pub(crate) fn compute_checksum(
        &self,
        comm: &ClientConnection,
        replica: &ReplicaInfo,
        algorithm: ChecksumAlgorithm,
    ) -> Result<String> {
        let leaf = self.tree.leaf_of_hier(&replica.resc_hier)?;
        if leaf.host() != self.tree.local_host() {
            let request = ChecksumRequest::new(&replica.obj_path)
                .with_repl_num(replica.repl_num)
                .with_mode(ChecksumMode::Force);
            let host = leaf.host().to_string();
            return match self.remote.forward(&host, RemoteRequest::Checksum(request))? {
                RemoteReply::Checksum(value) => Ok(value),
                other => Err(unexpected(&host, "checksum", &other)),
            };
        }

        let mut file = FileObject::from_replica(replica);
        file.flags = OpenFlags::READ;
        let mut object = ObjectRef::File(file);
        self.tree.file_open(comm, &mut object)?;

        let mut calculator = ChecksumCalculator::new(algorithm);
        let mut buf = vec![0u8; self.config.transfer.buffer_size.max(1)];
        let read = loop {
            match self.tree.file_read(comm, &mut object, &mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => calculator.update(&buf[..n]),
                Err(e) => break Err(e),
            }
        };
        if let Err(e) = self.tree.file_close(comm, &mut object) {
            warn!("Close after checksum of {} failed: {}", replica.phy_path, e);
        }
        read?;
        let value = calculator.finalize();
        debug!(
            "Computed checksum {} for replica {} of {}",
            value, replica.repl_num, replica.obj_path
        );
        Ok(value)
    }

    fn store_checksum(&self, replica: &ReplicaInfo, value: &str) -> Result<()> {
        if replica.checksum == value {
            return Ok(());
        }
        self.catalog.modify_replica(
            &replica.obj_path,
            replica.repl_num,
            &ReplicaPatch {
                checksum: Some(value.to_string()),
                ..ReplicaPatch::default()
            },
        )?;
        info!(
            "Registered checksum {} for replica {} of {}",
            value, replica.repl_num, replica.obj_path
        );
        Ok(())
    }

    fn checksum_replica(
        &self,
        comm: &ClientConnection,
        replica: &ReplicaInfo,
        mode: ChecksumMode,
    ) -> Result<String> {
        match mode {
            ChecksumMode::Default if replica.has_checksum() => Ok(replica.checksum.clone()),
            ChecksumMode::Verify if replica.has_checksum() => {
                let algorithm = self.algorithm_for(&replica.checksum);
                let computed = self.compute_checksum(comm, replica, algorithm)?;
                if computed != replica.checksum {
                    return Err(mismatch(&replica.obj_path, &replica.checksum, computed));
                }
                Ok(computed)
            }
            ChecksumMode::Default | ChecksumMode::Verify | ChecksumMode::Force => {
                let algorithm = self.algorithm_for(&replica.checksum);
                let computed = self.compute_checksum(comm, replica, algorithm)?;
                self.store_checksum(replica, &computed)?;
                Ok(computed)
            }
        }
    }

    fn in_bundle_resource(&self, hier: &str) -> Result<bool> {
        for name in hier.split('/') {
            if self.tree.get(name)?.class() == ResourceClass::Bundle {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Compute, verify or look up the checksum of a data object
    ///
    /// Returns the checksum of the first replica handled.
    pub fn checksum(&self, comm: &ClientConnection, req: ChecksumRequest) -> Result<String> {
        validate_obj_path(&req.obj_path)?;
        if let Some(host) = self.remote_zone_host(&req.obj_path)? {
            return match self.remote.forward(&host, RemoteRequest::Checksum(req))? {
                RemoteReply::Checksum(value) => Ok(value),
                other => Err(unexpected(&host, "checksum", &other)),
            };
        }

        let mut filter = ReplicaFilter::all();
        if let Some(n) = req.repl_num {
            filter = filter.repl_num(n);
        }
        if let Some(resource) = &req.resource {
            filter = filter.resource(resource.as_str());
        }
        let replicas = self.catalog.get_data_obj_info(&req.obj_path, &filter)?;
        if replicas.is_empty() {
            return Err(match req.repl_num {
                Some(repl_num) => Error::ReplicaNotFound {
                    path: req.obj_path,
                    repl_num,
                },
                None => Error::DataObjectNotFound(req.obj_path),
            });
        }

        if req.all_replicas {
            return self.checksum_all(comm, &req, &replicas);
        }

        if req.mode == ChecksumMode::Default
            && let Some(trusted) = replicas
                .iter()
                .find(|r| r.status.is_good() && r.has_checksum())
        {
            return Ok(trusted.checksum.clone());
        }
        let target = replicas
            .iter()
            .find(|r| r.status.is_good())
            .unwrap_or(&replicas[0]);
        self.checksum_replica(comm, target, req.mode)
    }

    fn checksum_all(
        &self,
        comm: &ClientConnection,
        req: &ChecksumRequest,
        replicas: &[ReplicaInfo],
    ) -> Result<String> {
        let mut first = None;
        let mut first_error = None;
        let mut failed = 0usize;
        let mut handled = 0usize;
        for replica in replicas {
            if self.in_bundle_resource(&replica.resc_hier)? {
                debug!("Skipping bundle replica {} of {}", replica.repl_num, replica.obj_path);
                continue;
            }
            if let Some(placement) = self.compound_tier(&replica.resc_hier)?
                && placement.tier == Tier::Archive
                && replicas.iter().any(|other| {
                    other.status.is_good()
                        && self
                            .compound_tier(&other.resc_hier)
                            .ok()
                            .flatten()
                            .is_some_and(|p| p.compound == placement.compound && p.tier == Tier::Cache)
                })
            {
                debug!(
                    "Archive replica {} of {} covered by its cache copy",
                    replica.repl_num, replica.obj_path
                );
                continue;
            }
            handled += 1;
            match self.checksum_replica(comm, replica, req.mode) {
                Ok(value) => {
                    first.get_or_insert(value);
                }
                Err(e) => {
                    warn!(
                        "Checksum of replica {} of {} failed: {}",
                        replica.repl_num, replica.obj_path, e
                    );
                    failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }
        match (first, first_error) {
            (Some(value), None) => Ok(value),
            (None, None) => Err(Error::invalid_input(format!(
                "{} has no replica that can be checksummed",
                req.obj_path
            ))),
            (Some(_), Some(e)) if handled > failed => Err(Error::PartialFailure {
                succeeded: handled - failed,
                required: handled,
                first: Box::new(e),
            }),
            (_, Some(e)) => Err(e),
        }
    }

    /// Checksum to register when `desc` closes, if any
    ///
    /// `written` is the replica as it now sits on disk. A destination whose
    /// source carried a verified checksum must reproduce it, a client value
    /// must match what was written, and an overwrite of a checksummed
    /// replica is always recomputed.
    pub fn proc_checksum_for_close(
        &self,
        comm: &ClientConnection,
        desc: &L1Descriptor,
        written: &ReplicaInfo,
    ) -> Result<Option<String>> {
        if desc.request.no_checksum {
            return Ok(None);
        }

        if let Some(expected) = &desc.source_checksum {
            let computed = self.compute_checksum(comm, written, self.algorithm_for(expected))?;
            if &computed != expected {
                return Err(mismatch(&written.obj_path, expected, computed));
            }
            return Ok(Some(computed));
        }

        if let Some(expected) = &desc.request.checksum_value {
            let computed = self.compute_checksum(comm, written, self.algorithm_for(expected))?;
            if &computed != expected {
                return Err(mismatch(&written.obj_path, expected, computed));
            }
            return Ok(Some(computed));
        }

        let overwrite = desc.replica_existed && desc.replica.has_checksum();
        match desc.request.checksum {
            ChecksumFlag::Register | ChecksumFlag::Verify => {
                let computed =
                    self.compute_checksum(comm, written, self.algorithm_for(&desc.replica.checksum))?;
                Ok(Some(computed))
            }
            ChecksumFlag::Off if overwrite => {
                debug!("Overwrite of checksummed {} is re-verified", written.obj_path);
                let computed =
                    self.compute_checksum(comm, written, self.algorithm_for(&desc.replica.checksum))?;
                Ok(Some(computed))
            }
            ChecksumFlag::Off => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::DataObjRequest;
    use crate::testutil::{comm, failing_catalog_server, put_bytes, single_resource, two_resources};
    use datagrid_common::checksum::checksum_bytes;
    use std::fs;

    #[test]
    fn test_default_computes_once_then_trusts() {
        let (_dir, server) = single_resource();
        let replica = put_bytes(&server, "/tempZone/home/u/c", "disk", b"checksum me");
        let expected = checksum_bytes(b"checksum me", ChecksumAlgorithm::Md5);

        let first = server
            .checksum(&comm(), ChecksumRequest::new("/tempZone/home/u/c"))
            .unwrap();
        assert_eq!(first, expected);

        // a changed file is not noticed without verify
        fs::write(&replica.phy_path, b"tampered!!!").unwrap();
        let second = server
            .checksum(&comm(), ChecksumRequest::new("/tempZone/home/u/c"))
            .unwrap();
        assert_eq!(second, expected);

        let err = server
            .checksum(
                &comm(),
                ChecksumRequest::new("/tempZone/home/u/c").with_mode(ChecksumMode::Verify),
            )
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        // verify never corrects
        let stored = server
            .catalog()
            .get_data_obj_info("/tempZone/home/u/c", &ReplicaFilter::all())
            .unwrap();
        assert_eq!(stored[0].checksum, expected);
    }

    #[test]
    fn test_force_overwrites_stored_value() {
        let (_dir, server) = single_resource();
        let replica = put_bytes(&server, "/tempZone/home/u/c", "disk", b"one");
        server
            .checksum(&comm(), ChecksumRequest::new("/tempZone/home/u/c"))
            .unwrap();
        fs::write(&replica.phy_path, b"two").unwrap();
        let forced = server
            .checksum(
                &comm(),
                ChecksumRequest::new("/tempZone/home/u/c").with_mode(ChecksumMode::Force),
            )
            .unwrap();
        assert_eq!(forced, checksum_bytes(b"two", ChecksumAlgorithm::Md5));
    }

    #[test]
    fn test_all_replicas_checksummed() {
        let (_dir, server) = two_resources();
        put_bytes(&server, "/tempZone/home/u/a", "disk1", b"abc");
        server
            .replicate(
                &comm(),
                DataObjRequest::new("/tempZone/home/u/a").with_resource("disk2"),
            )
            .unwrap();
        server
            .checksum(
                &comm(),
                ChecksumRequest::new("/tempZone/home/u/a").with_all_replicas(),
            )
            .unwrap();
        let rows = server
            .catalog()
            .get_data_obj_info("/tempZone/home/u/a", &ReplicaFilter::all())
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.checksum == checksum_bytes(b"abc", ChecksumAlgorithm::Md5)));
    }

    #[test]
    fn test_client_checksum_verified_at_close() {
        let (_dir, server) = single_resource();
        let good = checksum_bytes(b"payload", ChecksumAlgorithm::Md5);
        let replica = server
            .put(
                &comm(),
                DataObjRequest::new("/tempZone/home/u/p")
                    .with_resource("disk")
                    .with_checksum_value(good.clone()),
                &mut &b"payload"[..],
            )
            .unwrap();
        assert_eq!(replica.checksum, good);

        let err = server
            .put(
                &comm(),
                DataObjRequest::new("/tempZone/home/u/q")
                    .with_resource("disk")
                    .with_checksum_value(good),
                &mut &b"other"[..],
            )
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_sha256_registration() {
        let (_dir, server) = single_resource();
        let replica = server
            .put(
                &comm(),
                DataObjRequest::new("/tempZone/home/u/s")
                    .with_resource("disk")
                    .with_checksum_flag(ChecksumFlag::Register)
                    .with_checksum_value(checksum_bytes(b"sha", ChecksumAlgorithm::Sha256)),
                &mut &b"sha"[..],
            )
            .unwrap();
        assert!(replica.checksum.starts_with("sha2:"));
    }

    #[test]
    fn test_overwrite_recomputes_existing_checksum() {
        let (_dir, server) = single_resource();
        server
            .put(
                &comm(),
                DataObjRequest::new("/tempZone/home/u/o")
                    .with_resource("disk")
                    .with_checksum_flag(ChecksumFlag::Register),
                &mut &b"first"[..],
            )
            .unwrap();
        let replica = server
            .put(
                &comm(),
                DataObjRequest::new("/tempZone/home/u/o").with_force(),
                &mut &b"second"[..],
            )
            .unwrap();
        assert_eq!(replica.checksum, checksum_bytes(b"second", ChecksumAlgorithm::Md5));
    }

    #[test]
    fn test_repeated_verify_is_stable_and_read_only() {
        let (_dir, server, catalog) = failing_catalog_server();
        let obj = "/tempZone/home/u/stable";
        put_bytes(&server, obj, "disk", b"same bytes");
        let registered = server
            .checksum(&comm(), ChecksumRequest::new(obj).with_mode(ChecksumMode::Force))
            .unwrap();

        // any catalog write from here on fails the call
        catalog.fail_modify(true);
        let verify = || {
            server
                .checksum(&comm(), ChecksumRequest::new(obj).with_mode(ChecksumMode::Verify))
                .unwrap()
        };
        let first = verify();
        let second = verify();
        assert_eq!(first, registered);
        assert_eq!(second, registered);
        let stored = server
            .catalog()
            .get_data_obj_info(obj, &ReplicaFilter::all())
            .unwrap();
        assert_eq!(stored[0].checksum, registered);
    }
}
