//! Cross-zone and cross-host forwarding
//!
//! When a logical path belongs to another zone, or resolution picks a leaf
//! on another host, the whole call is handed to the server there. The
//! transport is a collaborator; this module only fixes what goes over it.

use crate::request::{ChecksumRequest, DataObjRequest};
use datagrid_common::{Error, ReplicaInfo, Result};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;

/// Call forwarded to another server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteRequest {
    Create(DataObjRequest),
    Open(DataObjRequest),
    Read { fd: i32, len: usize },
    Write { fd: i32, data: Vec<u8> },
    Lseek { fd: i32, offset: i64, whence: Whence },
    Close { fd: i32 },
    Replicate(DataObjRequest),
    Phymv(DataObjRequest),
    Unlink(DataObjRequest),
    Checksum(ChecksumRequest),
}

impl RemoteRequest {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Open(_) => "open",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Lseek { .. } => "lseek",
            Self::Close { .. } => "close",
            Self::Replicate(_) => "replicate",
            Self::Phymv(_) => "phymv",
            Self::Unlink(_) => "unlink",
            Self::Checksum(_) => "checksum",
        }
    }
}

/// Serializable seek origin
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Whence {
    Start,
    Current,
    End,
}

/// Split a seek into its wire form
#[must_use]
pub fn encode_seek(pos: SeekFrom) -> (i64, Whence) {
    match pos {
        SeekFrom::Start(offset) => (i64::try_from(offset).unwrap_or(i64::MAX), Whence::Start),
        SeekFrom::Current(offset) => (offset, Whence::Current),
        SeekFrom::End(offset) => (offset, Whence::End),
    }
}

/// Rebuild a seek from its wire form
pub fn decode_seek(offset: i64, whence: Whence) -> Result<SeekFrom> {
    match whence {
        Whence::Start => u64::try_from(offset)
            .map(SeekFrom::Start)
            .map_err(|_| Error::invalid_input(format!("negative seek offset {offset}"))),
        Whence::Current => Ok(SeekFrom::Current(offset)),
        Whence::End => Ok(SeekFrom::End(offset)),
    }
}

/// Answer from another server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteReply {
    /// Descriptor opened there, with the replica it refers to
    Opened { fd: i32, replica: ReplicaInfo },
    Data(Vec<u8>),
    Count(u64),
    Checksum(String),
    Replicas(Vec<ReplicaInfo>),
    Done,
}

pub trait RemoteDispatcher: Send + Sync {
    /// Send `request` to the server at `host` and wait for its reply
    fn forward(&self, host: &str, request: RemoteRequest) -> Result<RemoteReply>;
}

/// Dispatcher for a server with no peers
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalOnlyDispatcher;

impl RemoteDispatcher for LocalOnlyDispatcher {
    fn forward(&self, host: &str, request: RemoteRequest) -> Result<RemoteReply> {
        Err(Error::Remote {
            host: host.to_string(),
            message: format!("no transport configured for {}", request.name()),
        })
    }
}

/// Unexpected reply shape
pub(crate) fn unexpected(host: &str, request: &str, reply: &RemoteReply) -> Error {
    Error::Remote {
        host: host.to_string(),
        message: format!("unexpected reply to {request}: {reply:?}"),
    }
}
