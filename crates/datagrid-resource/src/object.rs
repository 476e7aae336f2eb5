//! Targets of resource operations
//!
//! Every backend call receives an [`ObjectRef`]. File objects carry the
//! logical view of a data object plus an open handle once the leaf has
//! opened it; collection objects carry a directory cursor; data objects
//! are bare physical paths used for stat/unlink/rename style calls.

use datagrid_common::{Error, OpenFlags, ReplicaInfo, Result};
use std::fs::{File, ReadDir};

/// Per-replica input to the redirect vote
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalObject {
    pub repl_num: i32,
    pub resc_hier: String,
    pub is_dirty: bool,
}

impl From<&ReplicaInfo> for PhysicalObject {
    fn from(replica: &ReplicaInfo) -> Self {
        Self {
            repl_num: replica.repl_num,
            resc_hier: replica.resc_hier.clone(),
            is_dirty: replica.status.is_dirty(),
        }
    }
}

/// A data object as seen through one replica
#[derive(Debug, Default)]
pub struct FileObject {
    pub logical_path: String,
    pub physical_path: String,
    pub resc_hier: String,
    pub size: u64,
    pub mode: u32,
    pub flags: OpenFlags,
    pub repl_num: i32,
    /// Replica number the caller asked for, if any
    pub repl_requested: Option<i32>,
    /// Existing replicas, in catalog order
    pub replicas: Vec<PhysicalObject>,
    /// Set while the replica is being created rather than rewritten
    pub creating: bool,
    pub(crate) handle: Option<File>,
}

impl FileObject {
    pub fn new(
        logical_path: impl Into<String>,
        physical_path: impl Into<String>,
        resc_hier: impl Into<String>,
    ) -> Self {
        Self {
            logical_path: logical_path.into(),
            physical_path: physical_path.into(),
            resc_hier: resc_hier.into(),
            repl_num: -1,
            ..Self::default()
        }
    }

    /// File object addressing an existing replica
    #[must_use]
    pub fn from_replica(replica: &ReplicaInfo) -> Self {
        Self {
            logical_path: replica.obj_path.clone(),
            physical_path: replica.phy_path.clone(),
            resc_hier: replica.resc_hier.clone(),
            size: replica.size,
            mode: replica.mode,
            repl_num: replica.repl_num,
            ..Self::default()
        }
    }

    /// Vote input for an object with the given replicas
    #[must_use]
    pub fn for_vote(
        logical_path: &str,
        replicas: &[ReplicaInfo],
        repl_requested: Option<i32>,
    ) -> Self {
        Self {
            logical_path: logical_path.to_string(),
            repl_num: -1,
            repl_requested,
            replicas: replicas.iter().map(PhysicalObject::from).collect(),
            ..Self::default()
        }
    }

    /// Copy of the descriptive fields without the open handle
    #[must_use]
    pub fn detached(&self) -> Self {
        Self {
            logical_path: self.logical_path.clone(),
            physical_path: self.physical_path.clone(),
            resc_hier: self.resc_hier.clone(),
            size: self.size,
            mode: self.mode,
            flags: self.flags,
            repl_num: self.repl_num,
            repl_requested: self.repl_requested,
            replicas: self.replicas.clone(),
            creating: self.creating,
            handle: None,
        }
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.handle.is_some()
    }
}

/// A directory on a resource
#[derive(Debug, Default)]
pub struct CollectionObject {
    pub logical_path: String,
    pub physical_path: String,
    pub resc_hier: String,
    pub mode: u32,
    pub(crate) cursor: Option<ReadDir>,
}

impl CollectionObject {
    pub fn new(
        logical_path: impl Into<String>,
        physical_path: impl Into<String>,
        resc_hier: impl Into<String>,
    ) -> Self {
        Self {
            logical_path: logical_path.into(),
            physical_path: physical_path.into(),
            resc_hier: resc_hier.into(),
            ..Self::default()
        }
    }
}

/// A bare physical path on a resource
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataObject {
    pub physical_path: String,
    pub resc_hier: String,
    pub mode: u32,
    pub size: u64,
}

impl DataObject {
    pub fn new(physical_path: impl Into<String>, resc_hier: impl Into<String>) -> Self {
        Self {
            physical_path: physical_path.into(),
            resc_hier: resc_hier.into(),
            ..Self::default()
        }
    }
}

/// Target of a resource operation
#[derive(Debug)]
pub enum ObjectRef {
    File(FileObject),
    Collection(CollectionObject),
    Data(DataObject),
}

impl ObjectRef {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Collection(_) => "collection",
            Self::Data(_) => "data",
        }
    }

    #[must_use]
    pub fn physical_path(&self) -> &str {
        match self {
            Self::File(f) => &f.physical_path,
            Self::Collection(c) => &c.physical_path,
            Self::Data(d) => &d.physical_path,
        }
    }

    pub fn set_physical_path(&mut self, path: String) {
        match self {
            Self::File(f) => f.physical_path = path,
            Self::Collection(c) => c.physical_path = path,
            Self::Data(d) => d.physical_path = path,
        }
    }

    #[must_use]
    pub fn resc_hier(&self) -> &str {
        match self {
            Self::File(f) => &f.resc_hier,
            Self::Collection(c) => &c.resc_hier,
            Self::Data(d) => &d.resc_hier,
        }
    }

    pub fn set_resc_hier(&mut self, hier: String) {
        match self {
            Self::File(f) => f.resc_hier = hier,
            Self::Collection(c) => c.resc_hier = hier,
            Self::Data(d) => d.resc_hier = hier,
        }
    }

    #[must_use]
    pub const fn mode(&self) -> u32 {
        match self {
            Self::File(f) => f.mode,
            Self::Collection(c) => c.mode,
            Self::Data(d) => d.mode,
        }
    }

    /// Size the object is expected to have, zero for collections
    #[must_use]
    pub const fn size(&self) -> u64 {
        match self {
            Self::File(f) => f.size,
            Self::Collection(_) => 0,
            Self::Data(d) => d.size,
        }
    }

    pub fn as_file(&self) -> Result<&FileObject> {
        match self {
            Self::File(f) => Ok(f),
            other => Err(Error::invalid_input(format!(
                "expected a file object, got a {} object",
                other.kind()
            ))),
        }
    }

    pub fn as_file_mut(&mut self) -> Result<&mut FileObject> {
        match self {
            Self::File(f) => Ok(f),
            other => Err(Error::invalid_input(format!(
                "expected a file object, got a {} object",
                other.kind()
            ))),
        }
    }

    pub fn as_collection_mut(&mut self) -> Result<&mut CollectionObject> {
        match self {
            Self::Collection(c) => Ok(c),
            other => Err(Error::invalid_input(format!(
                "expected a collection object, got a {} object",
                other.kind()
            ))),
        }
    }
}

impl From<FileObject> for ObjectRef {
    fn from(file: FileObject) -> Self {
        Self::File(file)
    }
}

impl From<CollectionObject> for ObjectRef {
    fn from(coll: CollectionObject) -> Self {
        Self::Collection(coll)
    }
}

impl From<DataObject> for ObjectRef {
    fn from(data: DataObject) -> Self {
        Self::Data(data)
    }
}
