//! Context passed to every backend call

use crate::object::ObjectRef;
use crate::tree::{ResourceId, ResourceNode, ResourceTree};
use crate::backend::ResourceBackend;
use datagrid_common::hierarchy::next_resource;
use datagrid_common::{ClientConnection, Error, HierarchyParser, Operation, Result};

/// The resource being called, the tree it lives in, the caller and the target
pub struct PluginContext<'a> {
    tree: &'a ResourceTree,
    id: ResourceId,
    pub comm: &'a ClientConnection,
    pub object: &'a mut ObjectRef,
}

impl<'a> PluginContext<'a> {
    pub(crate) const fn new(
        tree: &'a ResourceTree,
        id: ResourceId,
        comm: &'a ClientConnection,
        object: &'a mut ObjectRef,
    ) -> Self {
        Self {
            tree,
            id,
            comm,
            object,
        }
    }

    #[must_use]
    pub const fn tree(&self) -> &'a ResourceTree {
        self.tree
    }

    #[must_use]
    pub const fn id(&self) -> ResourceId {
        self.id
    }

    /// The resource this call is addressed to
    #[must_use]
    pub fn resource(&self) -> &'a ResourceNode {
        self.tree.node(self.id)
    }

    #[must_use]
    pub fn name(&self) -> &'a str {
        self.resource().name()
    }

    /// Run `f` against `child` with this context's caller and object
    pub fn dispatch<T>(
        &mut self,
        child: ResourceId,
        f: impl FnOnce(&dyn ResourceBackend, &mut PluginContext<'_>) -> Result<T>,
    ) -> Result<T> {
        let node = self.tree.node(child);
        let mut ctx = PluginContext {
            tree: self.tree,
            id: child,
            comm: self.comm,
            object: &mut *self.object,
        };
        f(node.backend(), &mut ctx)
    }

    /// Child named after this resource in the object's hierarchy
    pub fn next_child_in_hier(&self) -> Result<ResourceId> {
        let node = self.resource();
        let hier = self.object.resc_hier();
        let next = next_resource(hier, node.name()).ok_or_else(|| {
            Error::InvalidHierarchy(format!(
                "resource {} has no child in hierarchy \"{hier}\"",
                node.name()
            ))
        })?;
        node.child_named(next).ok_or_else(|| {
            Error::InvalidHierarchy(format!(
                "{next} is not a child of {} (hierarchy \"{hier}\")",
                node.name()
            ))
        })
    }

    /// Run `f` on the next resource of the object's hierarchy
    pub fn forward<T>(
        &mut self,
        f: impl FnOnce(&dyn ResourceBackend, &mut PluginContext<'_>) -> Result<T>,
    ) -> Result<T> {
        let child = self.next_child_in_hier()?;
        self.dispatch(child, f)
    }

    /// Forward a redirect request to `child`
    pub fn resolve_child(
        &mut self,
        child: ResourceId,
        op: Operation,
        host: &str,
        parser: &mut HierarchyParser,
    ) -> Result<f32> {
        self.dispatch(child, |backend, ctx| {
            backend.resolve_hierarchy(ctx, op, host, parser)
        })
    }
}
