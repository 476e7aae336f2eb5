//! Cache + archive composite
//!
//! Byte I/O always happens on the cache child. The archive child only
//! receives whole-file copies through `stage_to_cache` and `sync_to_arch`,
//! which the replica engine drives around opens and closes.

use crate::backend::{require_children, DirEntry, FileStat, ResourceBackend};
use crate::context::PluginContext;
use crate::object::ObjectRef;
use crate::redirect::VOTE_NONE;
use crate::tree::{ChildEntry, ResourceId, ResourceNode};
use datagrid_common::hierarchy::next_resource;
use datagrid_common::{Error, HierarchyParser, Operation, Result};
use std::io::SeekFrom;
use tracing::debug;

/// Child context naming the cache tier
pub const CACHE_CONTEXT: &str = "cache";
/// Child context naming the archive tier
pub const ARCHIVE_CONTEXT: &str = "archive";

pub struct Compound;

impl Compound {
    pub const TYPE_NAME: &'static str = "compound";
}

/// The cache and archive children of a compound resource
pub fn tier_children(node: &ResourceNode) -> Result<(&ChildEntry, &ChildEntry)> {
    let cache = node.child_with_context(CACHE_CONTEXT);
    let archive = node.child_with_context(ARCHIVE_CONTEXT);
    match (cache, archive) {
        (Some(cache), Some(archive)) => Ok((cache, archive)),
        _ => Err(Error::Configuration(format!(
            "compound resource {} needs one \"{CACHE_CONTEXT}\" and one \"{ARCHIVE_CONTEXT}\" child",
            node.name()
        ))),
    }
}

fn cache_child(ctx: &PluginContext<'_>) -> Result<ResourceId> {
    tier_children(ctx.resource()).map(|(cache, _)| cache.id)
}

fn archive_child(ctx: &PluginContext<'_>) -> Result<ResourceId> {
    tier_children(ctx.resource()).map(|(_, archive)| archive.id)
}

impl ResourceBackend for Compound {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn validate_children(&self, node: &ResourceNode) -> Result<()> {
        require_children(node, 2)?;
        tier_children(node).map(|_| ())
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
        let cache = cache_child(ctx)?;
        ctx.dispatch(cache, |b, c| b.mkdir(c))
    }

    fn rmdir(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let cache = cache_child(ctx)?;
        ctx.dispatch(cache, |b, c| b.rmdir(c))
    }

    fn opendir(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let cache = cache_child(ctx)?;
        ctx.dispatch(cache, |b, c| b.opendir(c))
    }

    fn readdir(&self, ctx: &mut PluginContext<'_>) -> Result<Option<DirEntry>> {
        let cache = cache_child(ctx)?;
        ctx.dispatch(cache, |b, c| b.readdir(c))
    }

    fn closedir(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let cache = cache_child(ctx)?;
        ctx.dispatch(cache, |b, c| b.closedir(c))
    }

    fn rename(&self, ctx: &mut PluginContext<'_>, new_path: &str) -> Result<()> {
        ctx.forward(|b, c| b.rename(c, new_path))
    }

    fn truncate(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        ctx.forward(|b, c| b.truncate(c))
    }

    fn freespace(&self, ctx: &mut PluginContext<'_>) -> Result<u64> {
        let cache = cache_child(ctx)?;
        ctx.dispatch(cache, |b, c| b.freespace(c))
    }

    fn stage_to_cache(&self, ctx: &mut PluginContext<'_>, cache_path: &str) -> Result<()> {
        let archive = archive_child(ctx)?;
        debug!(
            "Compound {} staging {} to cache path {}",
            ctx.name(),
            ctx.object.physical_path(),
            cache_path
        );
        ctx.dispatch(archive, |b, c| b.stage_to_cache(c, cache_path))
    }

    fn sync_to_arch(&self, ctx: &mut PluginContext<'_>, cache_path: &str) -> Result<()> {
        let archive = archive_child(ctx)?;
        debug!(
            "Compound {} syncing cache path {} to {}",
            ctx.name(),
            cache_path,
            ctx.object.physical_path()
        );
        ctx.dispatch(archive, |b, c| b.sync_to_arch(c, cache_path))
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
        let node = ctx.resource();
        parser.add_child(node.name());
        let (cache, archive) = tier_children(node)?;

        let child = match op {
            Operation::Create => cache.id,
            Operation::Open | Operation::Write => {
                let ObjectRef::File(file) = &*ctx.object else {
                    return Ok(VOTE_NONE);
                };
                let holds = |tier: &ChildEntry| {
                    file.replicas
                        .iter()
                        .any(|r| next_resource(&r.resc_hier, node.name()) == Some(tier.name.as_str()))
                };
                if holds(cache) {
                    cache.id
                } else if holds(archive) {
                    // the engine stages into the cache before any byte I/O
                    archive.id
                } else {
                    return Ok(VOTE_NONE);
                }
            }
        };
        ctx.resolve_child(child, op, host, parser)
    }

    fn rebalance(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let (cache, archive) = tier_children(ctx.resource())?;
        let (cache, archive) = (cache.id, archive.id);
        ctx.dispatch(cache, |b, c| b.rebalance(c))?;
        ctx.dispatch(archive, |b, c| b.rebalance(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{DataObject, FileObject};
    use crate::redirect::request_vote;
    use crate::registry::ResourceTreeBuilder;
    use crate::tree::ResourceTree;
    use datagrid_common::config::ResourceConfig;
    use datagrid_common::{ClientConnection, ReplicaInfo, ReplicaStatus, ResourceClass};
    use std::path::Path;

    fn compound_tree(root: &Path) -> ResourceTree {
        ResourceTreeBuilder::new()
            .resource(
                ResourceConfig::new("comp", "compound")
                    .with_class(ResourceClass::Compound)
                    .with_child("cache", CACHE_CONTEXT)
                    .with_child("arch", ARCHIVE_CONTEXT),
            )
            .resource(
                ResourceConfig::new("cache", "unixfilesystem")
                    .with_vault(root.join("cache").to_string_lossy()),
            )
            .resource(
                ResourceConfig::new("arch", "unixfilesystem")
                    .with_class(ResourceClass::Archive)
                    .with_vault(root.join("arch").to_string_lossy()),
            )
            .build()
            .unwrap()
    }

    fn comm() -> ClientConnection {
        ClientConnection::new("localhost", "u", "tempZone")
    }

    fn replica(repl_num: i32, hier: &str) -> ReplicaInfo {
        ReplicaInfo {
            repl_num,
            resc_hier: hier.into(),
            status: ReplicaStatus::good(),
            ..ReplicaInfo::default()
        }
    }

    #[test]
    fn test_create_routes_to_cache() {
        let dir = tempfile::tempdir().unwrap();
        let tree = compound_tree(dir.path());
        let file = FileObject::for_vote("/tempZone/f", &[], None);
        let (_, hier) = request_vote(&tree, &comm(), "comp", Operation::Create, &file).unwrap();
        assert_eq!(hier, "comp/cache");
    }

    #[test]
    fn test_open_prefers_cache_then_archive() {
        let dir = tempfile::tempdir().unwrap();
        let tree = compound_tree(dir.path());
        let both = [replica(0, "comp/arch"), replica(1, "comp/cache")];
        let file = FileObject::for_vote("/tempZone/f", &both, None);
        let (_, hier) = request_vote(&tree, &comm(), "comp", Operation::Open, &file).unwrap();
        assert_eq!(hier, "comp/cache");

        let archived = FileObject::for_vote("/tempZone/f", &both[..1], None);
        let (vote, hier) =
            request_vote(&tree, &comm(), "comp", Operation::Open, &archived).unwrap();
        assert_eq!(hier, "comp/arch");
        assert!(vote > 0.0);
    }

    #[test]
    fn test_stage_and_sync_go_through_archive() {
        let dir = tempfile::tempdir().unwrap();
        let tree = compound_tree(dir.path());
        std::fs::create_dir_all(dir.path().join("arch")).unwrap();
        std::fs::write(dir.path().join("arch/f"), b"tape bytes").unwrap();

        let cache_path = dir.path().join("cache/f");
        let mut obj = ObjectRef::from(DataObject::new("f", "comp/arch"));
        tree.file_stage_to_cache(&comm(), &mut obj, &cache_path.to_string_lossy())
            .unwrap();
        assert_eq!(std::fs::read(&cache_path).unwrap(), b"tape bytes");

        std::fs::write(&cache_path, b"fresh").unwrap();
        tree.file_sync_to_arch(&comm(), &mut obj, &cache_path.to_string_lossy())
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("arch/f")).unwrap(), b"fresh");
    }

    #[test]
    fn test_missing_tier_rejected() {
        let err = ResourceTreeBuilder::new()
            .resource(
                ResourceConfig::new("comp", "compound")
                    .with_child("a", CACHE_CONTEXT)
                    .with_child("b", CACHE_CONTEXT),
            )
            .resource(ResourceConfig::new("a", "unixfilesystem").with_vault("/a"))
            .resource(ResourceConfig::new("b", "unixfilesystem").with_vault("/b"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
