//! Error types for DataGrid
//!
//! One error enum covers every layer. Each variant maps onto an
//! [`ErrorKind`] for callers that branch on the class of failure, and
//! physical I/O failures keep the OS error so the errno survives to the
//! top-level caller.

use derive_more::Display;
use thiserror::Error;

/// Common result type for DataGrid operations
pub type Result<T> = std::result::Result<T, Error>;

/// Physical operation that produced an I/O failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum FileOp {
    #[display("open")]
    Open,
    #[display("create")]
    Create,
    #[display("read")]
    Read,
    #[display("write")]
    Write,
    #[display("close")]
    Close,
    #[display("unlink")]
    Unlink,
    #[display("stat")]
    Stat,
    #[display("lseek")]
    Lseek,
    #[display("mkdir")]
    Mkdir,
    #[display("rmdir")]
    Rmdir,
    #[display("opendir")]
    Opendir,
    #[display("closedir")]
    Closedir,
    #[display("readdir")]
    Readdir,
    #[display("stage")]
    Stage,
    #[display("freespace")]
    Freespace,
    #[display("rename")]
    Rename,
    #[display("truncate")]
    Truncate,
    #[display("link")]
    Link,
}

impl FileOp {
    /// Legacy `UNIX_FILE_<OP>_ERR` base value
    #[must_use]
    pub const fn legacy_base(self) -> i32 {
        match self {
            Self::Open => -510_000,
            Self::Create => -511_000,
            Self::Read => -512_000,
            Self::Write => -513_000,
            Self::Close => -514_000,
            Self::Unlink => -515_000,
            Self::Stat => -516_000,
            Self::Lseek => -518_000,
            Self::Mkdir => -520_000,
            Self::Rmdir => -521_000,
            Self::Opendir => -522_000,
            Self::Closedir => -523_000,
            Self::Readdir => -524_000,
            Self::Stage => -525_000,
            Self::Freespace => -526_000,
            Self::Rename => -528_000,
            Self::Truncate => -529_000,
            Self::Link => -530_000,
        }
    }
}

/// Broad class of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    ResourceUnavailable,
    PhysicalIo,
    Consistency,
    Catalog,
    Conflict,
    PartialFailure,
    DescriptorExhausted,
    Policy,
    Remote,
    Internal,
}

/// Common error type for DataGrid
#[derive(Debug, Error)]
pub enum Error {
    // Physical I/O
    #[error("{op} failed on resource [{resource}] for \"{path}\": {source}")]
    PhysicalIo {
        op: FileOp,
        resource: String,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid resource hierarchy: {0}")]
    InvalidHierarchy(String),

    #[error("operation not supported: {0}")]
    OperationNotSupported(String),

    #[error("path is a collection: {0}")]
    PathIsCollection(String),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    // Resource availability
    #[error("resource is down: {0}")]
    ResourceDown(String),

    #[error("no resource available for {0}")]
    NoResourceAvailable(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("object of {size} bytes exceeds free space on resource [{resource}]")]
    FileTooLarge { resource: String, size: u64 },

    // Consistency
    #[error("size mismatch for {path}: expected {expected} bytes, found {actual}")]
    CopyLength {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("checksum mismatch for {path}: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    // Namespace state
    #[error("data object exists and overwrite was not forced: {0}")]
    OverwriteWithoutForce(String),

    #[error("data object not found: {0}")]
    DataObjectNotFound(String),

    #[error("replica {repl_num} of {path} not found")]
    ReplicaNotFound { path: String, repl_num: i32 },

    #[error("copy of {path} already in resource [{resource}]")]
    CopyAlreadyInResource { path: String, resource: String },

    // Descriptors
    #[error("out of descriptors: all {capacity} slots in use")]
    DescriptorsExhausted { capacity: usize },

    // Catalog
    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("catalog update matched no rows: {0}")]
    CatalogNoInfo(String),

    // Collaborators
    #[error("policy hook {hook} failed: {message}")]
    Policy { hook: String, message: String },

    #[error("remote call to {host} failed: {message}")]
    Remote { host: String, message: String },

    // Aggregates
    #[error("{succeeded} of {required} targets succeeded, first failure: {first}")]
    PartialFailure {
        succeeded: usize,
        required: usize,
        first: Box<Error>,
    },

    #[error("bundle error: {0}")]
    Bundle(String),

    // Internal
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

// Legacy status values reported by `Error::status_code`.
const SYS_INVALID_INPUT_PARAM: i32 = -130_000;
const SYS_NOT_SUPPORTED: i32 = -169_000;
const HIERARCHY_ERROR: i32 = -1_803_000;
const SYS_RESC_IS_DOWN: i32 = -32_000;
const SYS_RESC_DOES_NOT_EXIST: i32 = -78_000;
const USER_FILE_TOO_LARGE: i32 = -333_000;
const SYS_COPY_LEN_ERR: i32 = -27_000;
const USER_CHKSUM_MISMATCH: i32 = -314_000;
const USER_INPUT_PATH_ERR: i32 = -317_000;
const OVERWRITE_WITHOUT_FORCE_FLAG: i32 = -312_000;
const SYS_OUT_OF_FILE_DESC: i32 = -26_000;
const SYS_FILE_DESC_OUT_OF_RANGE: i32 = -23_000;
const SYS_COPY_ALREADY_IN_RESC: i32 = -46_000;
const CAT_NO_ROWS_FOUND: i32 = -808_000;
const CAT_SUCCESS_BUT_WITH_NO_INFO: i32 = -807_000;
const SYS_INTERNAL_ERR: i32 = -154_000;

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a catalog error
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    /// Create an operation-not-supported error
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::OperationNotSupported(msg.into())
    }

    /// Wrap an OS error from a physical operation
    pub fn io(
        op: FileOp,
        resource: impl Into<String>,
        path: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::PhysicalIo {
            op,
            resource: resource.into(),
            path: path.into(),
            source,
        }
    }

    /// Wrap this error with additional context, keeping it as the cause
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error beneath any context wrappers
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Broad class of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            Self::InvalidInput(_)
            | Self::InvalidHierarchy(_)
            | Self::OperationNotSupported(_)
            | Self::PathIsCollection(_)
            | Self::InvalidDescriptor(_)
            | Self::Configuration(_) => ErrorKind::InvalidInput,
            Self::ResourceDown(_)
            | Self::NoResourceAvailable(_)
            | Self::ResourceNotFound(_)
            | Self::FileTooLarge { .. } => ErrorKind::ResourceUnavailable,
            Self::PhysicalIo { .. } | Self::Io(_) => ErrorKind::PhysicalIo,
            Self::CopyLength { .. } | Self::ChecksumMismatch { .. } => ErrorKind::Consistency,
            Self::OverwriteWithoutForce(_) | Self::CopyAlreadyInResource { .. } => {
                ErrorKind::Conflict
            }
            Self::DataObjectNotFound(_)
            | Self::ReplicaNotFound { .. }
            | Self::Catalog(_)
            | Self::CatalogNoInfo(_) => ErrorKind::Catalog,
            Self::DescriptorsExhausted { .. } => ErrorKind::DescriptorExhausted,
            Self::Policy { .. } => ErrorKind::Policy,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::PartialFailure { .. } => ErrorKind::PartialFailure,
            Self::Bundle(_) | Self::Serialization(_) | Self::Internal(_) | Self::Context { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// OS errno carried by a physical I/O failure
    #[must_use]
    pub fn errno(&self) -> Option<i32> {
        match self.root() {
            Self::PhysicalIo { source, .. } | Self::Io(source) => source.raw_os_error(),
            Self::PartialFailure { first, .. } => first.errno(),
            _ => None,
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Self::DataObjectNotFound(_) | Self::ReplicaNotFound { .. } => true,
            Self::ResourceNotFound(_) => true,
            Self::PhysicalIo { source, .. } | Self::Io(source) => {
                source.kind() == std::io::ErrorKind::NotFound
            }
            _ => false,
        }
    }

    /// Check if the physical target already existed
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        match self.root() {
            Self::PhysicalIo { source, .. } | Self::Io(source) => {
                source.kind() == std::io::ErrorKind::AlreadyExists
            }
            _ => false,
        }
    }

    /// Catalog outcome that means the rows were already consumed elsewhere
    #[must_use]
    pub fn is_benign_catalog(&self) -> bool {
        matches!(self.root(), Self::CatalogNoInfo(_))
    }

    /// Legacy integer status, with errno folded in for physical failures
    #[must_use]
    pub fn status_code(&self) -> i32 {
        match self.root() {
            Self::PhysicalIo { op, source, .. } => {
                op.legacy_base() - source.raw_os_error().unwrap_or(0)
            }
            Self::Io(source) => SYS_INTERNAL_ERR - source.raw_os_error().unwrap_or(0),
            Self::InvalidInput(_) | Self::Configuration(_) => SYS_INVALID_INPUT_PARAM,
            Self::InvalidHierarchy(_) | Self::NoResourceAvailable(_) => HIERARCHY_ERROR,
            Self::OperationNotSupported(_) => SYS_NOT_SUPPORTED,
            Self::PathIsCollection(_) => USER_INPUT_PATH_ERR,
            Self::InvalidDescriptor(_) => SYS_FILE_DESC_OUT_OF_RANGE,
            Self::ResourceDown(_) => SYS_RESC_IS_DOWN,
            Self::ResourceNotFound(_) => SYS_RESC_DOES_NOT_EXIST,
            Self::FileTooLarge { .. } => USER_FILE_TOO_LARGE,
            Self::CopyLength { .. } => SYS_COPY_LEN_ERR,
            Self::ChecksumMismatch { .. } => USER_CHKSUM_MISMATCH,
            Self::OverwriteWithoutForce(_) => OVERWRITE_WITHOUT_FORCE_FLAG,
            Self::DataObjectNotFound(_) | Self::ReplicaNotFound { .. } => CAT_NO_ROWS_FOUND,
            Self::CopyAlreadyInResource { .. } => SYS_COPY_ALREADY_IN_RESC,
            Self::DescriptorsExhausted { .. } => SYS_OUT_OF_FILE_DESC,
            Self::CatalogNoInfo(_) => CAT_SUCCESS_BUT_WITH_NO_INFO,
            Self::PartialFailure { first, .. } => first.status_code(),
            Self::Catalog(_)
            | Self::Policy { .. }
            | Self::Remote { .. }
            | Self::Bundle(_)
            | Self::Serialization(_)
            | Self::Internal(_)
            | Self::Context { .. } => SYS_INTERNAL_ERR,
        }
    }
}

/// Context wrapping for results, preserving the original cause
pub trait ResultExt<T> {
    /// Wrap the error with a fixed message
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Wrap the error with a lazily built message
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}
