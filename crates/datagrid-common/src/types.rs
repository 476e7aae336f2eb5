//! Core type definitions for DataGrid
//!
//! Replica records, resource descriptions and the operation vocabulary
//! shared by the resource layer, the catalog and the server engine.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Replica status bits carried on every replica record
///
/// A replica is good once it was registered as a complete copy
/// (`NEWLY_CREATED_COPY`) and has not been marked `DIRTY` since.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaStatus(u8);

impl ReplicaStatus {
    pub const STALE: Self = Self(0);
    pub const NEWLY_CREATED_COPY: Self = Self(0x01);
    pub const OPEN_EXISTING_COPY: Self = Self(0x02);
    pub const DIRTY: Self = Self(0x04);

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x07)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub const fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Status of a freshly registered, complete copy
    #[must_use]
    pub const fn good() -> Self {
        Self::NEWLY_CREATED_COPY
    }

    #[must_use]
    pub const fn is_good(self) -> bool {
        self.contains(Self::NEWLY_CREATED_COPY) && !self.contains(Self::DIRTY)
    }

    #[must_use]
    pub const fn is_dirty(self) -> bool {
        !self.is_good()
    }

    /// Mark this replica as needing re-sync from a newer copy
    pub const fn mark_stale(&mut self) {
        self.remove(Self::NEWLY_CREATED_COPY);
        self.insert(Self::DIRTY);
    }
}

impl fmt::Debug for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::NEWLY_CREATED_COPY) {
            names.push("NEWLY_CREATED_COPY");
        }
        if self.contains(Self::OPEN_EXISTING_COPY) {
            names.push("OPEN_EXISTING_COPY");
        }
        if self.contains(Self::DIRTY) {
            names.push("DIRTY");
        }
        if names.is_empty() {
            names.push("STALE");
        }
        write!(f, "ReplicaStatus({})", names.join("|"))
    }
}

/// Resource operational status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    #[default]
    Up,
    Down,
}

impl FromStr for ResourceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            other => Err(Error::invalid_input(format!(
                "unknown resource status: {other}"
            ))),
        }
    }
}

/// Storage class of a resource
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    /// Plain storage that serves byte I/O directly
    #[default]
    Cache,
    Archive,
    Compound,
    Bundle,
}

/// Description of one resource as seen by callers outside the tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub name: String,
    pub type_name: String,
    pub class: ResourceClass,
    pub zone: String,
    pub host: String,
    pub vault_path: String,
    pub status: ResourceStatus,
    pub quota: Option<u64>,
    pub context: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
}

/// One physical instance of a data object
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub obj_path: String,
    pub data_id: u64,
    pub repl_num: i32,
    /// Root resource the replica was placed through
    pub resc_name: String,
    pub resc_group: String,
    /// Root-to-leaf path through the resource tree
    pub resc_hier: String,
    pub phy_path: String,
    pub size: u64,
    /// Empty when unknown or stale
    pub checksum: String,
    pub status: ReplicaStatus,
    pub data_type: String,
    pub mode: u32,
    pub owner: String,
    pub create_time: u64,
    pub modify_time: u64,
}

impl ReplicaInfo {
    /// Leaf resource actually holding the bytes
    #[must_use]
    pub fn leaf_resource(&self) -> &str {
        crate::hierarchy::last_resource(&self.resc_hier)
    }

    /// Root resource of the hierarchy
    #[must_use]
    pub fn root_resource(&self) -> &str {
        crate::hierarchy::first_resource(&self.resc_hier)
    }

    #[must_use]
    pub fn has_checksum(&self) -> bool {
        !self.checksum.is_empty()
    }

    /// Collection holding this object
    #[must_use]
    pub fn coll_path(&self) -> &str {
        split_obj_path(&self.obj_path).0
    }

    #[must_use]
    pub fn data_name(&self) -> &str {
        split_obj_path(&self.obj_path).1
    }
}

/// Operation kind understood by the redirect protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Open,
    Write,
}

impl Operation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Open => "OPEN",
            Self::Write => "WRITE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Ok(Self::Create),
            "OPEN" => Ok(Self::Open),
            "WRITE" => Ok(Self::Write),
            other => Err(Error::not_supported(format!(
                "redirect operation {other}"
            ))),
        }
    }
}

/// Role of an open descriptor in the overall request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    #[default]
    Create,
    Open,
    Put,
    Get,
    CopySrc,
    CopyDest,
    ReplicateSrc,
    ReplicateDest,
    PhymvSrc,
    PhymvDest,
    Bundle,
}

impl OperationType {
    /// Destination side of a copy, replicate or move
    #[must_use]
    pub const fn is_destination(self) -> bool {
        matches!(self, Self::CopyDest | Self::ReplicateDest | Self::PhymvDest)
    }

    #[must_use]
    pub const fn is_source(self) -> bool {
        matches!(self, Self::CopySrc | Self::ReplicateSrc | Self::PhymvSrc)
    }
}

/// How bytes reach a replica on a tiered resource
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StagingMode {
    #[default]
    NoStaging,
    /// Archive bytes are staged into a cache replica
    StageSrc,
    /// Cache bytes are synchronized out to an archive replica
    SyncDest,
}

/// Number of copies requested by a create or replicate
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyCount {
    #[default]
    One,
    N(usize),
    All,
}

impl CopyCount {
    /// Number of successful targets needed out of `candidates`
    #[must_use]
    pub fn required(self, candidates: usize) -> usize {
        match self {
            Self::One => 1,
            Self::N(n) => n.max(1),
            Self::All => candidates.max(1),
        }
    }
}

/// Checksum work attached to an open descriptor and done at close
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumFlag {
    #[default]
    Off,
    /// Compute and register
    Register,
    /// Compute and compare against a known value
    Verify,
}

/// Mode of an explicit checksum request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumMode {
    /// Trust a stored value, compute only when missing
    #[default]
    Default,
    /// Recompute and compare, never correcting
    Verify,
    /// Recompute and overwrite
    Force,
}

/// POSIX-style open intent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub const READ: Self = Self {
        read: true,
        write: false,
        create: false,
        truncate: false,
    };
    pub const WRITE: Self = Self {
        read: true,
        write: true,
        create: false,
        truncate: false,
    };
    pub const WRITE_TRUNCATE: Self = Self {
        read: true,
        write: true,
        create: false,
        truncate: true,
    };
    pub const CREATE: Self = Self {
        read: true,
        write: true,
        create: true,
        truncate: true,
    };

    #[must_use]
    pub const fn is_write(self) -> bool {
        self.write || self.truncate || self.create
    }
}

/// Identity of the client a request is served for
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConnection {
    /// Host the client connected from, compared against resource hosts
    pub client_host: String,
    pub user: String,
    pub zone: String,
}

impl ClientConnection {
    pub fn new(
        client_host: impl Into<String>,
        user: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            client_host: client_host.into(),
            user: user.into(),
            zone: zone.into(),
        }
    }
}

/// Split a logical path into its collection and final name
#[must_use]
pub fn split_obj_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

/// Zone component of an absolute logical path
#[must_use]
pub fn zone_of(path: &str) -> Option<&str> {
    path.strip_prefix('/')
        .and_then(|rest| rest.split('/').next())
        .filter(|zone| !zone.is_empty())
}

/// Check a logical path is absolute, normalized and names something below a zone
pub fn validate_obj_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::invalid_input("logical path is empty"));
    }
    if !path.starts_with('/') {
        return Err(Error::invalid_input(format!(
            "logical path must be absolute: {path}"
        )));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(Error::invalid_input(format!(
            "logical path has a trailing slash: {path}"
        )));
    }
    let components: Vec<&str> = path[1..].split('/').collect();
    if components.len() < 2 {
        return Err(Error::invalid_input(format!(
            "logical path must name an object below a zone: {path}"
        )));
    }
    if components
        .iter()
        .any(|c| c.is_empty() || *c == "." || *c == "..")
    {
        return Err(Error::invalid_input(format!(
            "logical path is not normalized: {path}"
        )));
    }
    Ok(())
}

/// Seconds since the Unix epoch
#[must_use]
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_status_flags() {
        let mut status = ReplicaStatus::good();
        assert!(status.is_good());
        assert!(!status.is_dirty());

        status.insert(ReplicaStatus::OPEN_EXISTING_COPY);
        assert!(status.is_good());

        status.mark_stale();
        assert!(status.is_dirty());
        assert!(status.contains(ReplicaStatus::DIRTY));
        assert!(!status.contains(ReplicaStatus::NEWLY_CREATED_COPY));

        assert!(ReplicaStatus::STALE.is_dirty());
        assert_eq!(ReplicaStatus::from_bits(0xff).bits(), 0x07);
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!("create".parse::<Operation>().unwrap(), Operation::Create);
        assert_eq!("OPEN".parse::<Operation>().unwrap(), Operation::Open);
        let err = "unlink".parse::<Operation>().unwrap_err();
        assert!(matches!(err, Error::OperationNotSupported(_)));
    }

    #[test]
    fn test_copy_count_required() {
        assert_eq!(CopyCount::One.required(3), 1);
        assert_eq!(CopyCount::N(2).required(3), 2);
        assert_eq!(CopyCount::N(0).required(3), 1);
        assert_eq!(CopyCount::All.required(3), 3);
        assert_eq!(CopyCount::All.required(0), 1);
    }

    #[test]
    fn test_split_and_zone() {
        assert_eq!(split_obj_path("/zoneA/home/u/f.txt"), ("/zoneA/home/u", "f.txt"));
        assert_eq!(split_obj_path("/zoneA"), ("/", "zoneA"));
        assert_eq!(zone_of("/zoneA/home/u"), Some("zoneA"));
        assert_eq!(zone_of("relative/path"), None);
    }

    #[test]
    fn test_validate_obj_path() {
        assert!(validate_obj_path("/zoneA/home/u/f.txt").is_ok());
        assert!(validate_obj_path("").is_err());
        assert!(validate_obj_path("zoneA/f").is_err());
        assert!(validate_obj_path("/zoneA").is_err());
        assert!(validate_obj_path("/zoneA/home/").is_err());
        assert!(validate_obj_path("/zoneA//f").is_err());
        assert!(validate_obj_path("/zoneA/../f").is_err());
    }

    #[test]
    fn test_replica_accessors() {
        let replica = ReplicaInfo {
            obj_path: "/zoneA/home/u/f.txt".into(),
            resc_hier: "rr/child1/leaf".into(),
            ..ReplicaInfo::default()
        };
        assert_eq!(replica.leaf_resource(), "leaf");
        assert_eq!(replica.root_resource(), "rr");
        assert_eq!(replica.coll_path(), "/zoneA/home/u");
        assert_eq!(replica.data_name(), "f.txt");
        assert!(!replica.has_checksum());
    }
}
