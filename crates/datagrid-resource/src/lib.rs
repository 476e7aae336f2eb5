//! DataGrid Resource - storage backends and the resource tree
//!
//! This crate provides:
//! - The [`ResourceBackend`] contract every storage backend implements
//! - The [`ObjectRef`] sum type describing what an operation targets
//! - The arena-backed [`ResourceTree`] and its builder
//! - The vote-based redirect protocol picking a leaf for an operation
//! - Built-in backends: unixfilesystem, passthru, roundrobin, compound, mso

pub mod backend;
pub mod compound;
pub mod context;
pub mod mso;
pub mod object;
pub mod passthru;
pub mod path;
pub mod redirect;
pub mod registry;
pub mod roundrobin;
pub mod tree;
pub mod unixfs;

pub use backend::{DirEntry, FileStat, ResourceBackend};
pub use context::PluginContext;
pub use object::{CollectionObject, DataObject, FileObject, ObjectRef, PhysicalObject};
pub use redirect::{resolve_resource_hierarchy, ResolvedHierarchy};
pub use registry::{ResourceRegistry, ResourceTreeBuilder};
pub use tree::{ChildEntry, ResourceId, ResourceNode, ResourceTree};
