//! The resource plugin contract
//!
//! Leaf backends perform physical I/O on the path stored in the object
//! reference. Composite backends pick a child and forward through
//! [`PluginContext::dispatch`]. Lifecycle notifications default to no-ops.

use crate::context::PluginContext;
use crate::tree::{ChildEntry, ResourceNode, ResourceTree};
use datagrid_common::{HierarchyParser, Operation, Result};
use std::io::SeekFrom;

/// Result of a physical stat
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mode: u32,
    pub is_dir: bool,
    pub nlink: u64,
    pub mtime: i64,
}

/// One directory entry returned by `readdir`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
}

pub trait ResourceBackend: Send + Sync {
    /// Type name this backend is registered under
    fn type_name(&self) -> &'static str;

    /// Check the configured children fit this backend
    fn validate_children(&self, node: &ResourceNode) -> Result<()>;

    /// Called once after the tree is built
    fn start(&self, node: &ResourceNode, tree: &ResourceTree) -> Result<()> {
        let _ = (node, tree);
        Ok(())
    }

    fn create(&self, ctx: &mut PluginContext<'_>) -> Result<()>;
    fn open(&self, ctx: &mut PluginContext<'_>) -> Result<()>;
    fn read(&self, ctx: &mut PluginContext<'_>, buf: &mut [u8]) -> Result<usize>;
    fn write(&self, ctx: &mut PluginContext<'_>, buf: &[u8]) -> Result<usize>;
    fn close(&self, ctx: &mut PluginContext<'_>) -> Result<()>;
    fn unlink(&self, ctx: &mut PluginContext<'_>) -> Result<()>;
    fn stat(&self, ctx: &mut PluginContext<'_>) -> Result<FileStat>;
    fn lseek(&self, ctx: &mut PluginContext<'_>, pos: SeekFrom) -> Result<u64>;
    fn mkdir(&self, ctx: &mut PluginContext<'_>) -> Result<()>;
    fn rmdir(&self, ctx: &mut PluginContext<'_>) -> Result<()>;
    fn opendir(&self, ctx: &mut PluginContext<'_>) -> Result<()>;
    fn readdir(&self, ctx: &mut PluginContext<'_>) -> Result<Option<DirEntry>>;
    fn closedir(&self, ctx: &mut PluginContext<'_>) -> Result<()>;
    fn rename(&self, ctx: &mut PluginContext<'_>, new_path: &str) -> Result<()>;
    /// Truncate the physical file to the object's size
    fn truncate(&self, ctx: &mut PluginContext<'_>) -> Result<()>;
    fn freespace(&self, ctx: &mut PluginContext<'_>) -> Result<u64>;

    /// Copy the object's archive bytes into `cache_path`
    fn stage_to_cache(&self, ctx: &mut PluginContext<'_>, cache_path: &str) -> Result<()>;

    /// Copy `cache_path` out to the object's archive path
    fn sync_to_arch(&self, ctx: &mut PluginContext<'_>, cache_path: &str) -> Result<()>;

    fn registered(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn unregistered(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn modified(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn notify(&self, ctx: &mut PluginContext<'_>, operation: &str) -> Result<()> {
        let _ = (ctx, operation);
        Ok(())
    }

    /// Append this resource to `parser` and return its vote for `op`
    fn resolve_hierarchy(
        &self,
        ctx: &mut PluginContext<'_>,
        op: Operation,
        host: &str,
        parser: &mut HierarchyParser,
    ) -> Result<f32>;

    /// Recompute cached aggregate state; must be idempotent
    fn rebalance(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}

/// Reject children on a leaf resource
pub(crate) fn require_no_children(node: &ResourceNode) -> Result<()> {
    if node.children().is_empty() {
        Ok(())
    } else {
        Err(datagrid_common::Error::Configuration(format!(
            "{} resource {} cannot have children",
            node.type_name(),
            node.name()
        )))
    }
}

/// Require an exact number of children
pub(crate) fn require_children(node: &ResourceNode, count: usize) -> Result<&[ChildEntry]> {
    let children = node.children();
    if children.len() == count {
        Ok(children)
    } else {
        Err(datagrid_common::Error::Configuration(format!(
            "{} resource {} needs exactly {count} child(ren), has {}",
            node.type_name(),
            node.name(),
            children.len()
        )))
    }
}
