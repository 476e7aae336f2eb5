//! Request parameters for data object operations

use datagrid_common::{ChecksumFlag, ChecksumMode, CopyCount, OpenFlags};
use serde::{Deserialize, Serialize};

/// Input of create, open, put, get, replicate, phymv, checksum and unlink
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataObjRequest {
    pub obj_path: String,
    /// Destination resource or resource group
    pub dest_resource: Option<String>,
    /// Resource holding the replica to read from
    pub src_resource: Option<String>,
    pub repl_num: Option<i32>,
    pub copies: CopyCount,
    /// Overwrite an existing object or an up-to-date replica
    pub force: bool,
    pub flags: OpenFlags,
    /// File mode for new replicas; 0 uses the vault default
    pub mode: u32,
    pub data_type: String,
    /// Expected size, checked at close
    pub data_size: Option<u64>,
    pub no_size_check: bool,
    pub checksum: ChecksumFlag,
    /// Checksum supplied by the client
    pub checksum_value: Option<String>,
    pub no_checksum: bool,
    /// Parallel transfer workers; `Some(0)` forces a single stream
    pub threads: Option<usize>,
    /// Apply to every replica (update all stale copies, checksum all)
    pub all_replicas: bool,
    /// Hierarchy already resolved by the forwarding server
    pub resc_hier: Option<String>,
    /// Set on requests that arrived from another server
    pub forwarded: bool,
}

impl DataObjRequest {
    pub fn new(obj_path: impl Into<String>) -> Self {
        Self {
            obj_path: obj_path.into(),
            flags: OpenFlags::READ,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.dest_resource = Some(resource.into());
        self
    }

    #[must_use]
    pub fn with_src_resource(mut self, resource: impl Into<String>) -> Self {
        self.src_resource = Some(resource.into());
        self
    }

    #[must_use]
    pub const fn with_repl_num(mut self, repl_num: i32) -> Self {
        self.repl_num = Some(repl_num);
        self
    }

    #[must_use]
    pub const fn with_copies(mut self, copies: CopyCount) -> Self {
        self.copies = copies;
        self
    }

    #[must_use]
    pub const fn with_force(mut self) -> Self {
        self.force = true;
        self
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn with_size(mut self, size: u64) -> Self {
        self.data_size = Some(size);
        self
    }

    #[must_use]
    pub const fn with_checksum_flag(mut self, flag: ChecksumFlag) -> Self {
        self.checksum = flag;
        self
    }

    #[must_use]
    pub fn with_checksum_value(mut self, value: impl Into<String>) -> Self {
        self.checksum_value = Some(value.into());
        self
    }

    #[must_use]
    pub const fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    #[must_use]
    pub const fn with_all_replicas(mut self) -> Self {
        self.all_replicas = true;
        self
    }
}

/// Input of an explicit checksum request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumRequest {
    pub obj_path: String,
    pub repl_num: Option<i32>,
    pub resource: Option<String>,
    pub mode: ChecksumMode,
    /// Checksum every replica instead of one
    pub all_replicas: bool,
}

impl ChecksumRequest {
    pub fn new(obj_path: impl Into<String>) -> Self {
        Self {
            obj_path: obj_path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: ChecksumMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub const fn with_repl_num(mut self, repl_num: i32) -> Self {
        self.repl_num = Some(repl_num);
        self
    }

    #[must_use]
    pub const fn with_all_replicas(mut self) -> Self {
        self.all_replicas = true;
        self
    }
}

/// Input of an unbundle
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbundleRequest {
    /// Data object holding the packed archive
    pub bundle_path: String,
    /// Collection the subfiles are registered under
    pub target_coll: String,
    pub dest_resource: Option<String>,
    /// Allow replacing this collection's own replicas
    pub force: bool,
}

/// Summary of a replicate or phymv
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Bytes moved across all targets
    pub bytes_transferred: u64,
    /// Replicas written or found already current
    pub replicas: Vec<datagrid_common::ReplicaInfo>,
}
