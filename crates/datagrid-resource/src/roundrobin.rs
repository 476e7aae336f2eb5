//! Round-robin composite
//!
//! Creates rotate over the children in a fixed order, skipping any child
//! that is down. The rotation pointer lives in the resource property store
//! under [`NEXT_CHILD_PROP`] so every server sharing the catalog sees the
//! same position. It only moves once a create has completed, through
//! [`RoundRobin::advance_rotation`].

use crate::backend::{DirEntry, FileStat, ResourceBackend};
use crate::context::PluginContext;
use crate::object::ObjectRef;
use crate::redirect::VOTE_NONE;
use crate::tree::{ChildEntry, ResourceNode, ResourceTree};
use datagrid_common::hierarchy::next_resource;
use datagrid_common::{Error, HierarchyParser, Operation, Result};
use std::collections::HashSet;
use std::io::SeekFrom;
use tracing::{debug, info, warn};

/// Property holding the name of the child the next create goes to
pub const NEXT_CHILD_PROP: &str = "round_robin_next_child";

const MAX_POINTER_UPDATE_ATTEMPTS: usize = 16;

pub struct RoundRobin;

impl RoundRobin {
    pub const TYPE_NAME: &'static str = "roundrobin";

    /// Move the rotation pointer to the child after `used`
    ///
    /// The write is a compare-and-set against the value read, retried if
    /// another server moved the pointer in between.
    pub fn advance_rotation(tree: &ResourceTree, node: &ResourceNode, used: &str) -> Result<String> {
        let order = rotation_order(node);
        let idx = order.iter().position(|c| c.name == used).ok_or_else(|| {
            Error::InvalidHierarchy(format!(
                "{used} is not a child of round robin resource {}",
                node.name()
            ))
        })?;
        let next = order[(idx + 1) % order.len()].name.clone();
        let props = tree.property_store();

        for _ in 0..MAX_POINTER_UPDATE_ATTEMPTS {
            let current = props.get_property(node.name(), NEXT_CHILD_PROP)?;
            if current.as_deref() == Some(next.as_str()) {
                return Ok(next);
            }
            if props.compare_and_set_property(
                node.name(),
                NEXT_CHILD_PROP,
                current.as_deref(),
                &next,
            )? {
                debug!(
                    "Round robin {} next child {:?} -> {}",
                    node.name(),
                    current,
                    next
                );
                return Ok(next);
            }
        }
        Err(Error::internal(format!(
            "round robin {}: pointer kept changing during update",
            node.name()
        )))
    }

    /// Child the next create will be sent to, skipping children that are down
    pub fn next_valid_child<'t>(tree: &'t ResourceTree, node: &'t ResourceNode) -> Result<&'t ChildEntry> {
        let order = rotation_order(node);
        let pointer = tree
            .property_store()
            .get_property(node.name(), NEXT_CHILD_PROP)?;
        let start = pointer
            .as_deref()
            .and_then(|p| order.iter().position(|c| c.name == p))
            .unwrap_or(0);
        (0..order.len())
            .map(|offset| order[(start + offset) % order.len()])
            .find(|child| !tree.node(child.id).is_down())
            .ok_or_else(|| {
                Error::NoResourceAvailable(format!(
                    "round robin resource {}: no valid child found",
                    node.name()
                ))
            })
    }
}

/// Children in rotation order
///
/// Children whose context is an integer come first, ordered by it; the rest
/// follow in configuration order.
#[must_use]
pub fn rotation_order(node: &ResourceNode) -> Vec<&ChildEntry> {
    let mut indexed: Vec<(u32, &ChildEntry)> = Vec::new();
    let mut rest = Vec::new();
    for child in node.children() {
        match child.context.trim().parse::<u32>() {
            Ok(idx) => indexed.push((idx, child)),
            Err(_) => rest.push(child),
        }
    }
    indexed.sort_by_key(|(idx, _)| *idx);
    indexed.into_iter().map(|(_, c)| c).chain(rest).collect()
}

/// Make sure the pointer names a current child
fn repair_pointer(tree: &ResourceTree, node: &ResourceNode) -> Result<()> {
    let order = rotation_order(node);
    let Some(first) = order.first() else {
        return Ok(());
    };
    let props = tree.property_store();
    for _ in 0..MAX_POINTER_UPDATE_ATTEMPTS {
        let current = props.get_property(node.name(), NEXT_CHILD_PROP)?;
        if let Some(name) = &current
            && order.iter().any(|c| &c.name == name)
        {
            return Ok(());
        }
        if props.compare_and_set_property(
            node.name(),
            NEXT_CHILD_PROP,
            current.as_deref(),
            &first.name,
        )? {
            if let Some(stale) = current {
                warn!(
                    "Round robin {} pointer named unknown child {}, reset to {}",
                    node.name(),
                    stale,
                    first.name
                );
            }
            return Ok(());
        }
    }
    Err(Error::internal(format!(
        "round robin {}: pointer kept changing during repair",
        node.name()
    )))
}

impl ResourceBackend for RoundRobin {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn validate_children(&self, node: &ResourceNode) -> Result<()> {
        if node.children().is_empty() {
            return Err(Error::Configuration(format!(
                "roundrobin resource {} has no children",
                node.name()
            )));
        }
        let mut seen = HashSet::new();
        for child in node.children() {
            if let Ok(idx) = child.context.trim().parse::<u32>()
                && !seen.insert(idx)
            {
                return Err(Error::Configuration(format!(
                    "roundrobin resource {}: position {idx} given to more than one child",
                    node.name()
                )));
            }
        }
        Ok(())
    }

    fn start(&self, node: &ResourceNode, tree: &ResourceTree) -> Result<()> {
        let Some(first) = rotation_order(node).first().map(|c| c.name.clone()) else {
            return Ok(());
        };
        // an existing pointer survives restarts
        if tree
            .property_store()
            .compare_and_set_property(node.name(), NEXT_CHILD_PROP, None, &first)?
        {
            info!("Round robin {} starts rotation at {}", node.name(), first);
        }
        Ok(())
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
        let child = ctx.next_child_in_hier()?;
        ctx.dispatch(child, |b, c| b.modified(c))?;
        if matches!(&*ctx.object, ObjectRef::File(f) if f.creating) {
            let tree = ctx.tree();
            let used = tree.node(child).name();
            Self::advance_rotation(tree, ctx.resource(), used)?;
        }
        Ok(())
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
        let tree = ctx.tree();
        let node = ctx.resource();
        parser.add_child(node.name());

        let child = match op {
            Operation::Create => Self::next_valid_child(tree, node)?.id,
            Operation::Open | Operation::Write => {
                let ObjectRef::File(file) = &*ctx.object else {
                    return Ok(VOTE_NONE);
                };
                let under_us = |hier: &str| {
                    next_resource(hier, node.name()).and_then(|name| node.child_named(name))
                };
                let requested = file
                    .repl_requested
                    .and_then(|n| file.replicas.iter().find(|r| r.repl_num == n))
                    .and_then(|r| under_us(&r.resc_hier));
                let Some(child) =
                    requested.or_else(|| file.replicas.iter().find_map(|r| under_us(&r.resc_hier)))
                else {
                    debug!(
                        "Round robin {} holds no replica of {}",
                        node.name(),
                        file.logical_path
                    );
                    return Ok(VOTE_NONE);
                };
                child
            }
        };
        ctx.resolve_child(child, op, host, parser)
    }

    fn rebalance(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let children: Vec<_> = ctx.resource().children().iter().map(|c| c.id).collect();
        for child in children {
            ctx.dispatch(child, |b, c| b.rebalance(c))?;
        }
        repair_pointer(ctx.tree(), ctx.resource())
    }
}
