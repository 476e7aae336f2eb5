//! Single-child forwarding resource

use crate::backend::{require_children, DirEntry, FileStat, ResourceBackend};
use crate::context::PluginContext;
use crate::tree::ResourceNode;
use datagrid_common::{HierarchyParser, Operation, Result};
use std::io::SeekFrom;

/// Forwards every call to its only child
pub struct Passthru;

impl Passthru {
    pub const TYPE_NAME: &'static str = "passthru";
}

impl ResourceBackend for Passthru {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn validate_children(&self, node: &ResourceNode) -> Result<()> {
        require_children(node, 1).map(|_| ())
    }

    fn create(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        ctx.forward(|b, c| b.create(c))
    }

    fn open(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        ctx.forward(|b, c| b.open(c))
    }

    fn read(&self, ctx: &mut PluginContext<'_>, buf: &mut [u8]) -> Result<usize> {
        ctx.forward(|b, c| b.read(c, buf))
    }

    fn write(&self, ctx: &mut PluginContext<'_>, buf: &[u8]) -> Result<usize> {
        ctx.forward(|b, c| b.write(c, buf))
    }

    fn close(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        ctx.forward(|b, c| b.close(c))
    }

    fn unlink(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        ctx.forward(|b, c| b.unlink(c))
    }

    fn stat(&self, ctx: &mut PluginContext<'_>) -> Result<FileStat> {
        ctx.forward(|b, c| b.stat(c))
    }

    fn lseek(&self, ctx: &mut PluginContext<'_>, pos: SeekFrom) -> Result<u64> {
        ctx.forward(|b, c| b.lseek(c, pos))
    }

    fn mkdir(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        ctx.forward(|b, c| b.mkdir(c))
    }

    fn rmdir(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        ctx.forward(|b, c| b.rmdir(c))
    }

    fn opendir(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        ctx.forward(|b, c| b.opendir(c))
    }

    fn readdir(&self, ctx: &mut PluginContext<'_>) -> Result<Option<DirEntry>> {
        ctx.forward(|b, c| b.readdir(c))
    }

    fn closedir(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        ctx.forward(|b, c| b.closedir(c))
    }

    fn rename(&self, ctx: &mut PluginContext<'_>, new_path: &str) -> Result<()> {
        ctx.forward(|b, c| b.rename(c, new_path))
    }

    fn truncate(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        ctx.forward(|b, c| b.truncate(c))
    }

    fn freespace(&self, ctx: &mut PluginContext<'_>) -> Result<u64> {
        ctx.forward(|b, c| b.freespace(c))
    }

    fn stage_to_cache(&self, ctx: &mut PluginContext<'_>, cache_path: &str) -> Result<()> {
        ctx.forward(|b, c| b.stage_to_cache(c, cache_path))
    }

    fn sync_to_arch(&self, ctx: &mut PluginContext<'_>, cache_path: &str) -> Result<()> {
        ctx.forward(|b, c| b.sync_to_arch(c, cache_path))
    }

    fn registered(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        ctx.forward(|b, c| b.registered(c))
    }

    fn unregistered(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        ctx.forward(|b, c| b.unregistered(c))
    }

    fn modified(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        ctx.forward(|b, c| b.modified(c))
    }

    fn notify(&self, ctx: &mut PluginContext<'_>, operation: &str) -> Result<()> {
        ctx.forward(|b, c| b.notify(c, operation))
    }

    fn resolve_hierarchy(
        &self,
        ctx: &mut PluginContext<'_>,
        op: Operation,
        host: &str,
        parser: &mut HierarchyParser,
    ) -> Result<f32> {
        parser.add_child(ctx.name());
        let child = ctx.resource().children()[0].id;
        ctx.resolve_child(child, op, host, parser)
    }

    fn rebalance(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let child = ctx.resource().children()[0].id;
        ctx.dispatch(child, |b, c| b.rebalance(c))
    }
}
