//! Opening existing data objects

use crate::l1desc::{L1Descriptor, L1Handle, RemoteDescriptor};
use crate::remote::{unexpected, RemoteReply, RemoteRequest};
use crate::request::DataObjRequest;
use crate::server::Server;
use crate::staging::Tier;
use datagrid_catalog::{PathKind, ReplicaFilter};
use datagrid_common::{
    validate_obj_path, ClientConnection, Error, OpenFlags, Operation, OperationType, PolicyHook,
    ReplicaInfo, Result, StagingMode,
};
use datagrid_resource::redirect::{candidates_for_open, resolve_resource_hierarchy};
use datagrid_resource::{FileObject, ObjectRef, ResolvedHierarchy};
use tracing::{debug, warn};

impl Server {
    /// Open a data object; a create flag on a missing object creates it
    pub fn open(&self, comm: &ClientConnection, req: DataObjRequest) -> Result<L1Handle> {
        self.open_with(comm, req, OperationType::Open)
    }

    pub(crate) fn open_with(
        &self,
        comm: &ClientConnection,
        mut req: DataObjRequest,
        op_type: OperationType,
    ) -> Result<L1Handle> {
        validate_obj_path(&req.obj_path)?;
        if let Some(host) = self.remote_zone_host(&req.obj_path)? {
            req.forwarded = true;
            return self.open_remote(&host, RemoteRequest::Open(req.clone()), op_type, req);
        }
        match self.catalog.stat_path(&req.obj_path)? {
            PathKind::Collection => Err(Error::PathIsCollection(req.obj_path)),
            PathKind::None if req.flags.create => self.create_with(comm, req, op_type),
            PathKind::None => Err(Error::DataObjectNotFound(req.obj_path)),
            PathKind::DataObject => self.open_existing(comm, req, op_type),
        }
    }

    /// Pick the replica that serves a read or write of `req`
    pub(crate) fn resolve_for_open(
        &self,
        comm: &ClientConnection,
        req: &DataObjRequest,
        replicas: &[ReplicaInfo],
    ) -> Result<(ResolvedHierarchy, ReplicaInfo)> {
        if replicas.is_empty() {
            return Err(Error::DataObjectNotFound(req.obj_path.clone()));
        }
        if let Some(repl_num) = req.repl_num
            && !replicas.iter().any(|r| r.repl_num == repl_num)
        {
            return Err(Error::ReplicaNotFound {
                path: req.obj_path.clone(),
                repl_num,
            });
        }
        let op = if req.flags.is_write() {
            Operation::Write
        } else {
            Operation::Open
        };
        let scope: Vec<ReplicaInfo> = match (&req.resc_hier, &req.src_resource) {
            (Some(hier), _) => replicas
                .iter()
                .filter(|r| &r.resc_hier == hier)
                .cloned()
                .collect(),
            (None, Some(resource)) => {
                let filter = ReplicaFilter::all().resource(resource.as_str());
                replicas.iter().filter(|r| filter.matches(r)).cloned().collect()
            }
            (None, None) => replicas.to_vec(),
        };
        if scope.is_empty() {
            return Err(Error::DataObjectNotFound(format!(
                "{} has no replica on {}",
                req.obj_path,
                req.resc_hier
                    .as_deref()
                    .or(req.src_resource.as_deref())
                    .unwrap_or_default()
            )));
        }
        let candidates = candidates_for_open(&scope);
        let file = FileObject::for_vote(&req.obj_path, &scope, req.repl_num);
        let resolved = resolve_resource_hierarchy(&self.tree, comm, op, &file, &candidates)?;
        let replica = scope
            .into_iter()
            .find(|r| r.resc_hier == resolved.hier)
            .ok_or_else(|| {
                Error::internal(format!(
                    "resolved \"{}\" for {} but no replica lives there",
                    resolved.hier, req.obj_path
                ))
            })?;
        Ok((resolved, replica))
    }

    pub(crate) fn open_existing(
        &self,
        comm: &ClientConnection,
        mut req: DataObjRequest,
        op_type: OperationType,
    ) -> Result<L1Handle> {
        let replicas = self
            .catalog
            .get_data_obj_info(&req.obj_path, &ReplicaFilter::all())?;
        let (resolved, mut replica) = self.resolve_for_open(comm, &req, &replicas)?;

        let mut staging = StagingMode::NoStaging;
        if self
            .compound_tier(&replica.resc_hier)?
            .is_some_and(|p| p.tier == Tier::Archive)
        {
            replica = self.stage_to_cache(comm, &replica)?;
            staging = StagingMode::StageSrc;
        }

        if !resolved.local {
            req.resc_hier = Some(replica.resc_hier.clone());
            req.forwarded = true;
            return self.open_remote(
                &resolved.leaf_host,
                RemoteRequest::Open(req.clone()),
                op_type,
                req,
            );
        }

        let mut file = FileObject::from_replica(&replica);
        file.flags = req.flags;
        file.repl_requested = req.repl_num;
        let mut object = ObjectRef::File(file);
        self.tree.file_open(comm, &mut object)?;
        debug!(
            "Opened replica {} of {} on \"{}\"",
            replica.repl_num, replica.obj_path, replica.resc_hier
        );

        let mut desc = L1Descriptor::new(op_type, req, replica.clone(), object);
        desc.staging = staging;
        desc.replica_existed = true;
        desc.wrote = desc.request.flags.truncate;
        let handle = self.allocate_descriptor(desc)?;
        if let Err(e) = self.apply_policy(PolicyHook::PostOpen, comm, &replica) {
            self.abort(comm, handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Forward an open or create to another server and track it locally
    pub(crate) fn open_remote(
        &self,
        host: &str,
        request: RemoteRequest,
        op_type: OperationType,
        req: DataObjRequest,
    ) -> Result<L1Handle> {
        let name = request.name();
        debug!("Forwarding {} of {} to {}", name, req.obj_path, host);
        let (fd, replica) = match self.remote.forward(host, request)? {
            RemoteReply::Opened { fd, replica } => (fd, replica),
            other => return Err(unexpected(host, name, &other)),
        };
        let object = Self::data_object(&replica);
        let wrote = req.flags.is_write() && op_type != OperationType::Open;
        let mut desc = L1Descriptor::new(op_type, req, replica, object);
        desc.wrote = wrote;
        desc.remote = Some(RemoteDescriptor {
            host: host.to_string(),
            remote_fd: fd,
        });
        self.descriptors.allocate(desc).inspect_err(|_| {
            if let Err(e) = self.remote.forward(host, RemoteRequest::Close { fd }) {
                warn!("Close of remote descriptor {} on {} failed: {}", fd, host, e);
            }
        })
    }

    /// Store a descriptor; on failure the descriptor and its open file are dropped
    pub(crate) fn allocate_descriptor(&self, desc: L1Descriptor) -> Result<L1Handle> {
        let path = desc.object.physical_path().to_string();
        self.descriptors
            .allocate(desc)
            .inspect_err(|e| warn!("No descriptor for {}, physical file closed: {}", path, e))
    }

    /// Drop a descriptor without registering anything
    pub(crate) fn abort(&self, comm: &ClientConnection, handle: L1Handle) {
        let desc = match self.descriptors.release(handle) {
            Ok(desc) => desc,
            Err(e) => {
                warn!("Abort of descriptor {} failed: {}", handle, e);
                return;
            }
        };
        let mut desc = desc.lock();
        if let Some(remote) = desc.remote.take() {
            let close = RemoteRequest::Close {
                fd: remote.remote_fd,
            };
            if let Err(e) = self.remote.forward(&remote.host, close) {
                warn!("Close of remote descriptor on {} failed: {}", remote.host, e);
            }
        } else if matches!(&desc.object, ObjectRef::File(f) if f.is_open())
            && let Err(e) = self.tree.file_close(comm, &mut desc.object)
        {
            warn!("Close of {} failed: {}", desc.object.physical_path(), e);
        }
        debug!("Aborted descriptor {} for {}", handle, desc.request.obj_path);
    }
}

/// Read-only request for an existing object
pub(crate) fn read_request(obj_path: &str) -> DataObjRequest {
    DataObjRequest::new(obj_path).with_flags(OpenFlags::READ)
}
