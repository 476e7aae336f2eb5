//! Replica removal

use crate::remote::{unexpected, RemoteReply, RemoteRequest};
use crate::request::DataObjRequest;
use crate::server::Server;
use datagrid_catalog::{PathKind, ReplicaFilter};
use datagrid_common::{validate_obj_path, ClientConnection, Error, ReplicaInfo, Result};
use tracing::{info, warn};

impl Server {
    /// Remove replicas of a data object
    ///
    /// `repl_num` or a resource selects replicas; with neither, every
    /// replica goes. A replica whose physical unlink fails keeps its row.
    pub fn unlink(&self, comm: &ClientConnection, req: DataObjRequest) -> Result<Vec<ReplicaInfo>> {
        validate_obj_path(&req.obj_path)?;
        if let Some(host) = self.remote_zone_host(&req.obj_path)? {
            return self.forward_unlink(&host, req);
        }
        match self.catalog.stat_path(&req.obj_path)? {
            PathKind::Collection => return Err(Error::PathIsCollection(req.obj_path)),
            PathKind::None => return Err(Error::DataObjectNotFound(req.obj_path)),
            PathKind::DataObject => {}
        }

        let mut filter = ReplicaFilter::all();
        if let Some(repl_num) = req.repl_num {
            filter = filter.repl_num(repl_num);
        }
        if let Some(resource) = req.src_resource.as_ref().or(req.dest_resource.as_ref()) {
            filter = filter.resource(resource.as_str());
        }
        let selected = self.catalog.get_data_obj_info(&req.obj_path, &filter)?;
        if selected.is_empty() {
            return Err(match req.repl_num {
                Some(repl_num) => Error::ReplicaNotFound {
                    path: req.obj_path,
                    repl_num,
                },
                None => Error::DataObjectNotFound(req.obj_path),
            });
        }

        let mut removed = Vec::new();
        let mut first_error = None;
        let mut failed = 0usize;
        for replica in selected {
            match self.unlink_replica(comm, &replica) {
                Ok(()) => removed.push(replica),
                Err(e) => {
                    warn!(
                        "Replica {} of {} on \"{}\" kept: {}",
                        replica.repl_num, replica.obj_path, replica.resc_hier, e
                    );
                    failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(first) if removed.is_empty() => Err(first),
            Some(first) => Err(Error::PartialFailure {
                succeeded: removed.len(),
                required: removed.len() + failed,
                first: Box::new(first),
            }),
            None => Ok(removed),
        }
    }

    fn forward_unlink(&self, host: &str, mut req: DataObjRequest) -> Result<Vec<ReplicaInfo>> {
        req.forwarded = true;
        match self.remote.forward(host, RemoteRequest::Unlink(req))? {
            RemoteReply::Replicas(rows) => Ok(rows),
            RemoteReply::Done => Ok(Vec::new()),
            other => Err(unexpected(host, "unlink", &other)),
        }
    }

    fn unlink_replica(&self, comm: &ClientConnection, replica: &ReplicaInfo) -> Result<()> {
        let leaf = self.tree.leaf_of_hier(&replica.resc_hier)?;
        if leaf.host() != self.tree.local_host() {
            let host = leaf.host().to_string();
            let req = DataObjRequest::new(&replica.obj_path).with_repl_num(replica.repl_num);
            self.forward_unlink(&host, req)?;
            return Ok(());
        }

        let mut object = Self::data_object(replica);
        match self.tree.file_unlink(comm, &mut object) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!("Physical file {} was already gone", replica.phy_path);
            }
            Err(e) => return Err(e),
        }
        self.catalog
            .unregister_replica(&replica.obj_path, replica.repl_num)?;
        if let Err(e) = self.tree.file_unregistered(comm, &mut object) {
            warn!("Unregistered notification for {} failed: {}", replica.phy_path, e);
        }
        self.adjust_quota(
            replica.root_resource(),
            -i64::try_from(replica.size).unwrap_or(i64::MAX),
        );
        info!(
            "Unlinked replica {} of {} from \"{}\"",
            replica.repl_num, replica.obj_path, replica.resc_hier
        );
        Ok(())
    }
}
