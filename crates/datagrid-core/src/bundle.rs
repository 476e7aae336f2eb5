//! Packing a collection into one physical bundle
//!
//! Members are hard-linked into a staging directory next to the bundle's
//! physical file, the staging tree is packed, and the links are removed
//! again. The bundle object is registered even when packing fails, with
//! its size forced to zero.

use crate::l1desc::L1Handle;
use crate::request::DataObjRequest;
use crate::server::Server;
use datagrid_catalog::PathKind;
use datagrid_common::error::FileOp;
use datagrid_common::{ClientConnection, Error, OperationType, ReplicaInfo, Result};
use datagrid_resource::path::{mkdir_for_file_path, mkdir_r};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Name prefix of bundle staging directories
pub const TMP_PHY_BUN_DIR: &str = "tmpPhyBunDir";

/// Archive format used for bundles
pub trait ArchivePacker: Send + Sync {
    /// Pack the tree under `staging` into `archive`; returns the archive size
    fn pack(&self, staging: &Path, archive: &Path) -> Result<u64>;

    /// Extract `archive` into `staging`, refusing to replace existing files
    fn unpack(&self, archive: &Path, staging: &Path) -> Result<()>;
}

/// Plain ustar bundles
#[derive(Debug, Default, Clone, Copy)]
pub struct TarPacker;

impl ArchivePacker for TarPacker {
    fn pack(&self, staging: &Path, archive: &Path) -> Result<u64> {
        let file = File::create(archive).map_err(|e| {
            Error::Bundle(format!("cannot create {}: {e}", archive.display()))
        })?;
        let mut builder = tar::Builder::new(BufWriter::new(file));
        builder.follow_symlinks(false);

        for entry in WalkDir::new(staging).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Bundle(format!("walk of staging failed: {e}")))?;
            let name = entry
                .path()
                .strip_prefix(staging)
                .map_err(|e| Error::internal(e.to_string()))?;
            let appended = if entry.file_type().is_dir() {
                builder.append_dir(name, entry.path())
            } else {
                builder.append_path_with_name(entry.path(), name)
            };
            appended.map_err(|e| {
                Error::Bundle(format!("cannot add {} to bundle: {e}", name.display()))
            })?;
        }

        let mut writer = builder
            .into_inner()
            .map_err(|e| Error::Bundle(format!("cannot finish {}: {e}", archive.display())))?;
        writer.flush()?;
        let size = writer
            .get_ref()
            .metadata()
            .map(|m| m.len())
            .map_err(Error::Io)?;
        debug!("Packed {} into {} ({} bytes)", staging.display(), archive.display(), size);
        Ok(size)
    }

    fn unpack(&self, archive: &Path, staging: &Path) -> Result<()> {
        let file = File::open(archive)
            .map_err(|e| Error::Bundle(format!("cannot open {}: {e}", archive.display())))?;
        let mut archive_reader = tar::Archive::new(file);
        archive_reader.set_overwrite(false);
        archive_reader.set_preserve_permissions(true);
        archive_reader.unpack(staging).map_err(|e| {
            Error::Bundle(format!("cannot extract {}: {e}", archive.display()))
        })
    }
}

/// Fresh staging directory path beside `anchor`
pub(crate) fn staging_dir_for(anchor: &Path) -> PathBuf {
    let parent = anchor.parent().unwrap_or_else(|| Path::new("/"));
    parent.join(format!("{TMP_PHY_BUN_DIR}.{}", rand::random::<u32>()))
}

/// Remove a staging tree once its members are linked elsewhere
///
/// A member with a single remaining link means the staging copy is the
/// only copy; it is reported and left in place.
fn clean_staging(staging: &Path) -> Result<()> {
    let mut lone = 0;
    for entry in WalkDir::new(staging).min_depth(1).contents_first(true) {
        let entry = entry.map_err(|e| Error::Bundle(format!("walk of staging failed: {e}")))?;
        let path = entry.path();
        if entry.file_type().is_dir() {
            if let Err(e) = fs::remove_dir(path) {
                debug!("Staging directory {} kept: {}", path.display(), e);
            }
            continue;
        }
        let meta = entry
            .metadata()
            .map_err(|e| Error::Bundle(format!("stat of {} failed: {e}", path.display())))?;
        if meta.nlink() > 1 {
            fs::remove_file(path)
                .map_err(|e| Error::io(FileOp::Unlink, "", path.display().to_string(), e))?;
        } else {
            error!(
                "Staged file {} has a single link, staging area is corrupt",
                path.display()
            );
            lone += 1;
        }
    }
    if lone == 0 {
        fs::remove_dir(staging)
            .map_err(|e| Error::io(FileOp::Rmdir, "", staging.display().to_string(), e))?;
    }
    Ok(())
}

impl Server {
    /// Pack every data object below `coll` into the object `bundle_path`
    pub fn bundle_collection(
        &self,
        comm: &ClientConnection,
        coll: &str,
        bundle_path: &str,
        resource: Option<&str>,
    ) -> Result<ReplicaInfo> {
        if self.catalog.stat_path(coll)? != PathKind::Collection {
            return Err(Error::DataObjectNotFound(format!("collection {coll}")));
        }
        let members = self.bundle_members(coll)?;

        let mut req = DataObjRequest::new(bundle_path);
        req.dest_resource = resource.map(str::to_string);
        let handle = self.create_with(comm, req, OperationType::Bundle)?;

        let archive = {
            let shared = self.descriptors.get(handle)?;
            let desc = shared.lock();
            if desc.remote.is_some() {
                drop(desc);
                self.abort(comm, handle);
                return Err(Error::not_supported(format!(
                    "bundle {bundle_path} placed on a remote host"
                )));
            }
            PathBuf::from(desc.object.physical_path())
        };
        let staging = staging_dir_for(&archive);

        let packed = self
            .link_members(&staging, coll, &members)
            .and_then(|()| self.packer.pack(&staging, &archive));
        if staging.exists()
            && let Err(e) = clean_staging(&staging)
        {
            warn!("Cleanup of staging {} failed: {}", staging.display(), e);
        }

        match packed {
            Ok(size) => {
                let row = self.close(comm, handle)?;
                info!(
                    "Bundled {} objects of {} into {} ({} bytes)",
                    members.len(),
                    coll,
                    bundle_path,
                    size
                );
                Ok(row)
            }
            Err(e) => {
                error!("Packing of {} into {} failed: {}", coll, bundle_path, e);
                self.close_empty(comm, handle);
                Err(e)
            }
        }
    }

    /// One good replica per member object, keyed by logical path
    fn bundle_members(&self, coll: &str) -> Result<BTreeMap<String, ReplicaInfo>> {
        let mut members = BTreeMap::new();
        for replica in self.catalog.list_data_objects(coll, true)? {
            if !replica.status.is_good() || members.contains_key(&replica.obj_path) {
                continue;
            }
            let leaf = self.tree.leaf_of_hier(&replica.resc_hier)?;
            if leaf.host() != self.tree.local_host() {
                continue;
            }
            members.insert(replica.obj_path.clone(), replica);
        }
        Ok(members)
    }

    fn link_members(
        &self,
        staging: &Path,
        coll: &str,
        members: &BTreeMap<String, ReplicaInfo>,
    ) -> Result<()> {
        let dir_mode = self.config.vault.default_dir_mode;
        mkdir_r(staging, dir_mode)
            .map_err(|e| Error::io(FileOp::Mkdir, "", staging.display().to_string(), e))?;
        for (obj_path, replica) in members {
            let relative = obj_path
                .strip_prefix(coll)
                .unwrap_or(obj_path)
                .trim_start_matches('/');
            let link = staging.join(relative);
            mkdir_for_file_path(&link, dir_mode)
                .map_err(|e| Error::io(FileOp::Mkdir, "", link.display().to_string(), e))?;
            fs::hard_link(&replica.phy_path, &link).map_err(|e| {
                Error::io(FileOp::Link, replica.resc_hier.clone(), replica.phy_path.clone(), e)
            })?;
        }
        Ok(())
    }

    /// Register the placeholder with size zero after a failed pack
    fn close_empty(&self, comm: &ClientConnection, handle: L1Handle) {
        match self.descriptors.get(handle) {
            Ok(shared) => {
                let mut desc = shared.lock();
                desc.size_override = Some(0);
                desc.request.no_size_check = true;
            }
            Err(e) => {
                warn!("Bundle descriptor {} vanished: {}", handle, e);
                return;
            }
        }
        if let Err(e) = self.close(comm, handle) {
            warn!("Close of failed bundle descriptor {} failed: {}", handle, e);
        }
    }
}
