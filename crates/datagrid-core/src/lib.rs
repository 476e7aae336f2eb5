//! DataGrid replica engine
//!
//! Creates, opens, closes, replicates, moves, checksums, bundles and unlinks
//! the replicas of data objects on a tree of storage resources. Every
//! operation is a method on [`Server`]; open objects are addressed through
//! L1 descriptors.

pub mod admin;
pub mod bundle;
pub mod checksum;
pub mod close;
pub mod create;
pub mod io;
pub mod l1desc;
pub mod open;
mod orphan;
pub mod remote;
pub mod replicate;
pub mod request;
pub mod server;
mod staging;
mod transfer;
pub mod unbundle;
pub mod unlink;

#[cfg(test)]
mod testutil;

pub use bundle::{ArchivePacker, TarPacker, TMP_PHY_BUN_DIR};
pub use l1desc::{DescriptorTable, L1Descriptor, L1Handle};
pub use remote::{LocalOnlyDispatcher, RemoteDispatcher, RemoteReply, RemoteRequest, Whence};
pub use request::{ChecksumRequest, DataObjRequest, TransferOutcome, UnbundleRequest};
pub use server::{Server, ServerBuilder};
