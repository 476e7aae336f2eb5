//! Replication and physical moves
//!
//! A replicate copies a good replica onto each target resource, either
//! into a new replica or over a stale one. Targets already holding a
//! current copy count as done without moving bytes. A phymv is a
//! replicate to one new location whose close repoints the source row and
//! only then removes the old file.

use crate::l1desc::{L1Descriptor, L1Handle};
use crate::open::read_request;
use crate::remote::{unexpected, RemoteReply, RemoteRequest};
use crate::request::{DataObjRequest, TransferOutcome};
use crate::server::Server;
use crate::staging::Tier;
use datagrid_catalog::ReplicaFilter;
use datagrid_common::{
    validate_obj_path, ClientConnection, CopyCount, Error, OpenFlags, OperationType, ReplicaInfo,
    ReplicaStatus, Result,
};
use datagrid_resource::path::logical_to_physical;
use datagrid_resource::{FileObject, ObjectRef, ResolvedHierarchy};
use tracing::{debug, info, warn};

/// Where one copy goes
#[derive(Debug)]
enum Target {
    /// Holds a good copy already
    Current(ReplicaInfo),
    /// Existing replica rewritten in place
    Update(ReplicaInfo),
    New(ResolvedHierarchy),
}

impl Target {
    fn describe(&self) -> &str {
        match self {
            Self::Current(r) | Self::Update(r) => &r.resc_hier,
            Self::New(resolved) => &resolved.hier,
        }
    }
}

/// Operation types for the two sides of a copy
#[derive(Clone, Copy, Debug)]
struct Sides {
    src: OperationType,
    dest: OperationType,
}

const REPLICATE: Sides = Sides {
    src: OperationType::ReplicateSrc,
    dest: OperationType::ReplicateDest,
};

const PHYMV: Sides = Sides {
    src: OperationType::PhymvSrc,
    dest: OperationType::PhymvDest,
};

/// Failure for a fan-out that ended with fewer copies than asked for
pub(crate) fn short_of_copies(
    obj_path: &str,
    succeeded: usize,
    required: usize,
    first: Option<Error>,
) -> Error {
    let first = first.unwrap_or_else(|| {
        Error::NoResourceAvailable(format!(
            "{succeeded} of {required} copies of {obj_path} could be placed"
        ))
    });
    Error::PartialFailure {
        succeeded,
        required,
        first: Box::new(first),
    }
}

impl Server {
    /// Copy a data object onto the requested resources
    pub fn replicate(&self, comm: &ClientConnection, req: DataObjRequest) -> Result<TransferOutcome> {
        validate_obj_path(&req.obj_path)?;
        if let Some(host) = self.remote_zone_host(&req.obj_path)? {
            return self.forward_transfer(&host, RemoteRequest::Replicate(req));
        }

        let all = self
            .catalog
            .get_data_obj_info(&req.obj_path, &ReplicaFilter::all())?;
        let source = self.pick_source(comm, &req, &all)?;
        let (targets, skipped) = if req.all_replicas {
            let stale = all
                .iter()
                .filter(|r| r.status.is_dirty() && r.repl_num != source.repl_num)
                .cloned()
                .map(Target::Update)
                .collect();
            (stale, Vec::new())
        } else {
            self.targets_for(comm, &req, &source, &all)?
        };
        if targets.is_empty() {
            debug!("Every replica of {} is current", req.obj_path);
            return Ok(TransferOutcome::default());
        }

        // roots that could not be placed on still count against ALL
        let required = if req.all_replicas {
            targets.len()
        } else {
            req.copies.required(targets.len() + skipped.len())
        };
        let mut outcome = TransferOutcome::default();
        let mut first_error = skipped.into_iter().next();
        for target in targets {
            if outcome.replicas.len() >= required {
                break;
            }
            let described = target.describe().to_string();
            match self.copy_to(comm, &req, &source, target, REPLICATE) {
                Ok((row, bytes)) => {
                    outcome.bytes_transferred += bytes;
                    outcome.replicas.push(row);
                }
                Err(e) => {
                    warn!("Replication of {} to \"{}\" failed: {}", req.obj_path, described, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        let succeeded = outcome.replicas.len();
        if succeeded >= required {
            return Ok(outcome);
        }
        match first_error {
            Some(first) if succeeded == 0 => Err(first),
            first => Err(short_of_copies(&req.obj_path, succeeded, required, first)),
        }
    }

    /// Move a replica to another resource
    pub fn phymv(&self, comm: &ClientConnection, req: DataObjRequest) -> Result<TransferOutcome> {
        validate_obj_path(&req.obj_path)?;
        if let Some(host) = self.remote_zone_host(&req.obj_path)? {
            return self.forward_transfer(&host, RemoteRequest::Phymv(req));
        }
        let dest = req
            .dest_resource
            .clone()
            .ok_or_else(|| Error::invalid_input(format!("phymv of {} needs a destination", req.obj_path)))?;

        let all = self
            .catalog
            .get_data_obj_info(&req.obj_path, &ReplicaFilter::all())?;
        if let Some(existing) = all.iter().find(|r| r.root_resource() == dest) {
            return Err(Error::CopyAlreadyInResource {
                path: req.obj_path.clone(),
                resource: existing.resc_hier.clone(),
            });
        }
        let source = self.pick_source(comm, &req, &all)?;
        let resolved = self
            .rank_for_create(comm, &req.obj_path, source.size, std::slice::from_ref(&dest))?
            .remove(0);
        let (row, bytes) = self.copy_to(comm, &req, &source, Target::New(resolved), PHYMV)?;
        Ok(TransferOutcome {
            bytes_transferred: bytes,
            replicas: vec![row],
        })
    }

    fn forward_transfer(&self, host: &str, request: RemoteRequest) -> Result<TransferOutcome> {
        let name = request.name();
        match self.remote.forward(host, request)? {
            RemoteReply::Replicas(replicas) => Ok(TransferOutcome {
                bytes_transferred: 0,
                replicas,
            }),
            RemoteReply::Done => Ok(TransferOutcome::default()),
            other => Err(unexpected(host, name, &other)),
        }
    }

    /// Good replica to copy from, staged out of an archive tier if needed
    fn pick_source(
        &self,
        comm: &ClientConnection,
        req: &DataObjRequest,
        all: &[ReplicaInfo],
    ) -> Result<ReplicaInfo> {
        if all.is_empty() {
            return Err(Error::DataObjectNotFound(req.obj_path.clone()));
        }
        let good: Vec<ReplicaInfo> = all.iter().filter(|r| r.status.is_good()).cloned().collect();
        if good.is_empty() {
            return Err(Error::DataObjectNotFound(format!(
                "{} has no good replica to copy from",
                req.obj_path
            )));
        }
        let mut src_req = read_request(&req.obj_path);
        src_req.repl_num = req.repl_num;
        src_req.src_resource.clone_from(&req.src_resource);
        let (_, source) = self.resolve_for_open(comm, &src_req, &good)?;
        if self
            .compound_tier(&source.resc_hier)?
            .is_some_and(|p| p.tier == Tier::Archive)
        {
            return self.stage_to_cache(comm, &source);
        }
        Ok(source)
    }

    /// One target per destination root, checked against every replica
    ///
    /// Roots that cannot take a new replica are returned with the reason,
    /// unless they are the only root asked for.
    fn targets_for(
        &self,
        comm: &ClientConnection,
        req: &DataObjRequest,
        source: &ReplicaInfo,
        all: &[ReplicaInfo],
    ) -> Result<(Vec<Target>, Vec<Error>)> {
        let roots = self
            .catalog
            .get_resc_grp_for_create(&req.obj_path, req.dest_resource.as_deref())?;
        let mut targets = Vec::new();
        let mut skipped = Vec::new();
        for root in &roots {
            let mut under_root: Vec<&ReplicaInfo> =
                all.iter().filter(|r| r.root_resource() == root).collect();
            // a compound root is served through its cache copy
            under_root.sort_by_key(|r| {
                !self
                    .compound_tier(&r.resc_hier)
                    .ok()
                    .flatten()
                    .is_some_and(|p| p.tier == Tier::Cache)
            });
            let target = match under_root.first() {
                Some(existing) if existing.repl_num == source.repl_num => {
                    Target::Current((*existing).clone())
                }
                Some(existing) if !req.force && is_current(existing, source) => {
                    Target::Current((*existing).clone())
                }
                Some(existing) => Target::Update((*existing).clone()),
                None => {
                    match self.rank_for_create(
                        comm,
                        &req.obj_path,
                        source.size,
                        std::slice::from_ref(root),
                    ) {
                        Ok(mut ranked) => Target::New(ranked.remove(0)),
                        Err(e) if roots.len() > 1 => {
                            warn!("No placement on {} for {}: {}", root, req.obj_path, e);
                            skipped.push(e);
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            };
            targets.push(target);
        }
        if targets.is_empty() {
            return Err(skipped.into_iter().next().unwrap_or_else(|| {
                Error::NoResourceAvailable(format!("replication of {}", req.obj_path))
            }));
        }
        Ok((targets, skipped))
    }

    /// Copy `source` onto `target`; returns the destination row and bytes moved
    fn copy_to(
        &self,
        comm: &ClientConnection,
        req: &DataObjRequest,
        source: &ReplicaInfo,
        target: Target,
        sides: Sides,
    ) -> Result<(ReplicaInfo, u64)> {
        if let Target::Current(current) = target {
            info!(
                "Replica {} of {} on \"{}\" is already current",
                current.repl_num, current.obj_path, current.resc_hier
            );
            return Ok((current, 0));
        }

        let src = self.open_source(comm, req, source, sides.src)?;
        let created = matches!(target, Target::New(_));
        let dest = match self.open_destination(comm, req, source, target, sides.dest) {
            Ok(dest) => dest,
            Err(e) => {
                self.abort(comm, src);
                return Err(e);
            }
        };
        {
            let shared = self.descriptors.get(dest)?;
            shared.lock().src = Some(src);
        }

        let moved = match self.transfer(comm, src, dest, req.threads) {
            Ok(moved) => moved,
            Err(e) => {
                let partial = self.descriptors.get(dest).ok().map(|d| {
                    let d = d.lock();
                    (d.remote.is_none() && created, Self::data_object(&d.replica))
                });
                self.abort(comm, dest);
                self.abort(comm, src);
                if let Some((true, mut object)) = partial
                    && let Err(unlink) = self.tree.file_unlink(comm, &mut object)
                {
                    warn!("Partial copy at {} not removed: {}", object.physical_path(), unlink);
                }
                return Err(e);
            }
        };
        let row = self.close(comm, dest)?;
        Ok((row, moved))
    }

    fn open_source(
        &self,
        comm: &ClientConnection,
        req: &DataObjRequest,
        source: &ReplicaInfo,
        op_type: OperationType,
    ) -> Result<L1Handle> {
        let mut src_req = read_request(&req.obj_path);
        src_req.repl_num = Some(source.repl_num);
        src_req.resc_hier = Some(source.resc_hier.clone());

        let leaf = self.tree.leaf_of_hier(&source.resc_hier)?;
        if leaf.host() != self.tree.local_host() {
            src_req.forwarded = true;
            let host = leaf.host().to_string();
            return self.open_remote(&host, RemoteRequest::Open(src_req.clone()), op_type, src_req);
        }

        let mut object = if self.on_mass_storage(&source.resc_hier)? {
            Self::data_object(source)
        } else {
            let mut file = FileObject::from_replica(source);
            file.flags = OpenFlags::READ;
            let mut object = ObjectRef::File(file);
            self.tree.file_open(comm, &mut object)?;
            object
        };
        if let Ok(file) = object.as_file_mut() {
            file.repl_requested = Some(source.repl_num);
        }
        let mut desc = L1Descriptor::new(op_type, src_req, source.clone(), object);
        desc.replica_existed = true;
        self.allocate_descriptor(desc)
    }

    fn open_destination(
        &self,
        comm: &ClientConnection,
        req: &DataObjRequest,
        source: &ReplicaInfo,
        target: Target,
        op_type: OperationType,
    ) -> Result<L1Handle> {
        let mut dest_req = DataObjRequest {
            obj_path: req.obj_path.clone(),
            flags: OpenFlags::WRITE_TRUNCATE,
            data_size: Some(source.size),
            checksum: req.checksum,
            no_checksum: req.no_checksum,
            threads: req.threads,
            ..DataObjRequest::default()
        };
        let source_checksum = (source.status.is_good() && source.has_checksum())
            .then(|| source.checksum.clone());

        let mut desc = match target {
            Target::Current(_) => {
                return Err(Error::internal("current replica needs no destination"));
            }
            Target::Update(existing) => {
                dest_req.repl_num = Some(existing.repl_num);
                dest_req.resc_hier = Some(existing.resc_hier.clone());
                let leaf = self.tree.leaf_of_hier(&existing.resc_hier)?;
                if leaf.host() != self.tree.local_host() {
                    let host = leaf.host().to_string();
                    dest_req.forwarded = true;
                    return self.open_remote(&host, RemoteRequest::Open(dest_req.clone()), op_type, dest_req);
                }
                let object = if self.on_mass_storage(&existing.resc_hier)? {
                    Self::data_object(&existing)
                } else {
                    let mut file = FileObject::from_replica(&existing);
                    file.flags = OpenFlags::WRITE_TRUNCATE;
                    file.repl_requested = Some(existing.repl_num);
                    let mut object = ObjectRef::File(file);
                    self.tree.file_open(comm, &mut object)?;
                    object
                };
                let mut desc = L1Descriptor::new(op_type, dest_req, existing, object);
                desc.replica_existed = true;
                desc
            }
            Target::New(resolved) => {
                dest_req.flags = OpenFlags::CREATE;
                dest_req.resc_hier = Some(resolved.hier.clone());
                if !resolved.local {
                    dest_req.forwarded = true;
                    return self.open_remote(
                        &resolved.leaf_host,
                        RemoteRequest::Create(dest_req.clone()),
                        op_type,
                        dest_req,
                    );
                }
                let leaf = self.tree.get(&resolved.leaf)?;
                let phy_path = logical_to_physical(leaf.vault_path(), &req.obj_path);
                let mut file = FileObject::new(&req.obj_path, phy_path, &resolved.hier);
                file.mode = self.file_mode(source.mode);
                file.flags = OpenFlags::CREATE;
                file.size = source.size;
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
                    repl_num: -1,
                    resc_name: String::new(),
                    resc_hier: resolved.hier.clone(),
                    phy_path: object.physical_path().to_string(),
                    size: 0,
                    checksum: String::new(),
                    status: ReplicaStatus::STALE,
                    mode: object.mode(),
                    create_time: 0,
                    modify_time: 0,
                    ..source.clone()
                };
                let mut desc = L1Descriptor::new(op_type, dest_req, template, object);
                desc.register_at_close = true;
                desc
            }
        };
        desc.source_checksum = source_checksum;
        self.allocate_descriptor(desc)
    }

}

/// A good replica with the source's size and checksum needs no copy
fn is_current(existing: &ReplicaInfo, source: &ReplicaInfo) -> bool {
    existing.status.is_good()
        && existing.size == source.size
        && existing.checksum == source.checksum
}
