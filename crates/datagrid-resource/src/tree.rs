//! Resource tree
//!
//! All resource instances live in one arena owned by the tree. Children are
//! referenced by [`ResourceId`], so composite backends never hold pointers to
//! one another; traversal always goes back through the tree.
//!
//! Byte-level calls start at the root named by the object's hierarchy and
//! are forwarded down by each composite until they reach the leaf.

use crate::backend::{DirEntry, FileStat, ResourceBackend};
use crate::context::PluginContext;
use crate::object::ObjectRef;
use datagrid_common::hierarchy::{first_resource, HierarchyParser};
use datagrid_common::{
    ClientConnection, Error, Operation, ResourceClass, ResourceInfo, ResourcePropertyStore,
    ResourceStatus, Result, RuleEngine,
};
use derive_more::Display;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::sync::Arc;
use tracing::info;

/// Index of a resource in the tree arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("resc#{_0}")]
pub struct ResourceId(pub(crate) usize);

/// A composite's reference to one child
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildEntry {
    pub name: String,
    pub context: String,
    pub id: ResourceId,
}

/// One resource instance
pub struct ResourceNode {
    pub(crate) id: ResourceId,
    pub(crate) name: String,
    pub(crate) type_name: String,
    pub(crate) class: ResourceClass,
    pub(crate) host: String,
    pub(crate) zone: String,
    pub(crate) vault_path: String,
    pub(crate) context: String,
    pub(crate) quota: Option<u64>,
    pub(crate) properties: BTreeMap<String, String>,
    pub(crate) status: RwLock<ResourceStatus>,
    pub(crate) parent: Option<ResourceId>,
    pub(crate) children: Vec<ChildEntry>,
    pub(crate) backend: Box<dyn ResourceBackend>,
}

impl std::fmt::Debug for ResourceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("host", &self.host)
            .field("status", &self.status())
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

impl ResourceNode {
    #[must_use]
    pub const fn id(&self) -> ResourceId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[must_use]
    pub const fn class(&self) -> ResourceClass {
        self.class
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn zone(&self) -> &str {
        &self.zone
    }

    #[must_use]
    pub fn vault_path(&self) -> &str {
        &self.vault_path
    }

    /// Free-form context string from the configuration
    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }

    #[must_use]
    pub const fn quota(&self) -> Option<u64> {
        self.quota
    }

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    #[must_use]
    pub const fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    #[must_use]
    pub fn status(&self) -> ResourceStatus {
        *self.status.read()
    }

    #[must_use]
    pub fn is_down(&self) -> bool {
        self.status() == ResourceStatus::Down
    }

    #[must_use]
    pub const fn parent(&self) -> Option<ResourceId> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> &[ChildEntry] {
        &self.children
    }

    #[must_use]
    pub fn child_named(&self, name: &str) -> Option<ResourceId> {
        self.children.iter().find(|c| c.name == name).map(|c| c.id)
    }

    #[must_use]
    pub fn child_with_context(&self, context: &str) -> Option<&ChildEntry> {
        self.children.iter().find(|c| c.context == context)
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    #[must_use]
    pub fn backend(&self) -> &dyn ResourceBackend {
        self.backend.as_ref()
    }
}

/// Arena of resource instances
pub struct ResourceTree {
    pub(crate) nodes: Vec<ResourceNode>,
    pub(crate) by_name: HashMap<String, ResourceId>,
    pub(crate) local_host: String,
    pub(crate) local_zone: String,
    pub(crate) props: Arc<dyn ResourcePropertyStore>,
    pub(crate) rules: Arc<dyn RuleEngine>,
}

impl std::fmt::Debug for ResourceTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTree")
            .field("local_host", &self.local_host)
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

impl ResourceTree {
    /// Start building a tree
    #[must_use]
    pub fn builder() -> crate::registry::ResourceTreeBuilder {
        crate::registry::ResourceTreeBuilder::new()
    }

    #[must_use]
    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    #[must_use]
    pub fn local_zone(&self) -> &str {
        &self.local_zone
    }

    #[must_use]
    pub fn property_store(&self) -> &dyn ResourcePropertyStore {
        self.props.as_ref()
    }

    #[must_use]
    pub fn rule_engine(&self) -> &dyn RuleEngine {
        self.rules.as_ref()
    }

    /// Node for an id handed out by this tree
    #[must_use]
    pub fn node(&self, id: ResourceId) -> &ResourceNode {
        &self.nodes[id.0]
    }

    pub fn id_of(&self, name: &str) -> Result<ResourceId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::ResourceNotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Result<&ResourceNode> {
        self.id_of(name).map(|id| self.node(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.iter()
    }

    /// Resources with no parent
    pub fn roots(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.iter().filter(|n| n.parent.is_none())
    }

    #[must_use]
    pub fn root_of(&self, id: ResourceId) -> ResourceId {
        let mut current = id;
        while let Some(parent) = self.node(current).parent {
            current = parent;
        }
        current
    }

    /// Hierarchy string from the root down to `id`
    #[must_use]
    pub fn hierarchy_of(&self, id: ResourceId) -> String {
        self.hierarchy_parser_of(id).to_string()
    }

    /// Parser holding the path from the root down to `id`
    #[must_use]
    pub fn hierarchy_parser_of(&self, id: ResourceId) -> HierarchyParser {
        let mut chain = vec![id];
        let mut current = id;
        while let Some(parent) = self.node(current).parent {
            chain.push(parent);
            current = parent;
        }
        let mut parser = HierarchyParser::new();
        for node in chain.iter().rev() {
            parser.add_child(self.node(*node).name());
        }
        parser
    }

    /// Check `hier` follows parent/child links and return its leaf
    pub fn leaf_of_hier(&self, hier: &str) -> Result<&ResourceNode> {
        let parser = HierarchyParser::parse(hier)?;
        let mut names = parser.iter();
        let root_name = names
            .next()
            .ok_or_else(|| Error::InvalidHierarchy(hier.to_string()))?;
        let mut node = self.get(root_name)?;
        if node.parent.is_some() {
            return Err(Error::InvalidHierarchy(format!(
                "{root_name} is not a root resource in \"{hier}\""
            )));
        }
        for name in names {
            let child = node.child_named(name).ok_or_else(|| {
                Error::InvalidHierarchy(format!(
                    "{name} is not a child of {} in \"{hier}\"",
                    node.name()
                ))
            })?;
            node = self.node(child);
        }
        if !node.is_leaf() {
            return Err(Error::InvalidHierarchy(format!(
                "\"{hier}\" ends at composite resource {}",
                node.name()
            )));
        }
        Ok(node)
    }

    /// Description of a resource for callers outside the tree
    pub fn info(&self, name: &str) -> Result<ResourceInfo> {
        let node = self.get(name)?;
        Ok(ResourceInfo {
            name: node.name.clone(),
            type_name: node.type_name.clone(),
            class: node.class,
            zone: node.zone.clone(),
            host: node.host.clone(),
            vault_path: node.vault_path.clone(),
            status: node.status(),
            quota: node.quota,
            context: node.context.clone(),
            parent: node.parent.map(|p| self.node(p).name.clone()),
            children: node.children.iter().map(|c| c.name.clone()).collect(),
        })
    }

    /// Mark a resource up or down
    pub fn set_status(&self, name: &str, status: ResourceStatus) -> Result<()> {
        let node = self.get(name)?;
        let mut current = node.status.write();
        if *current != status {
            info!("Resource {} status {:?} -> {:?}", name, *current, status);
            *current = status;
        }
        Ok(())
    }

    /// Run `f` on the root of the object's hierarchy
    pub fn call<T>(
        &self,
        comm: &ClientConnection,
        object: &mut ObjectRef,
        f: impl FnOnce(&dyn ResourceBackend, &mut PluginContext<'_>) -> Result<T>,
    ) -> Result<T> {
        let root = first_resource(object.resc_hier()).to_string();
        if root.is_empty() {
            return Err(Error::InvalidHierarchy(format!(
                "{} object at \"{}\" has no resource hierarchy",
                object.kind(),
                object.physical_path()
            )));
        }
        let id = self.id_of(&root)?;
        self.call_at(id, comm, object, f)
    }

    /// Run `f` on a specific resource
    pub fn call_at<T>(
        &self,
        id: ResourceId,
        comm: &ClientConnection,
        object: &mut ObjectRef,
        f: impl FnOnce(&dyn ResourceBackend, &mut PluginContext<'_>) -> Result<T>,
    ) -> Result<T> {
        let node = self.node(id);
        let mut ctx = PluginContext::new(self, id, comm, object);
        f(node.backend(), &mut ctx)
    }

    pub fn file_create(&self, comm: &ClientConnection, object: &mut ObjectRef) -> Result<()> {
        self.call(comm, object, |b, ctx| b.create(ctx))
    }

    pub fn file_open(&self, comm: &ClientConnection, object: &mut ObjectRef) -> Result<()> {
        self.call(comm, object, |b, ctx| b.open(ctx))
    }

    pub fn file_read(
        &self,
        comm: &ClientConnection,
        object: &mut ObjectRef,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.call(comm, object, |b, ctx| b.read(ctx, buf))
    }

    pub fn file_write(
        &self,
        comm: &ClientConnection,
        object: &mut ObjectRef,
        buf: &[u8],
    ) -> Result<usize> {
        self.call(comm, object, |b, ctx| b.write(ctx, buf))
    }

    pub fn file_close(&self, comm: &ClientConnection, object: &mut ObjectRef) -> Result<()> {
        self.call(comm, object, |b, ctx| b.close(ctx))
    }

    pub fn file_unlink(&self, comm: &ClientConnection, object: &mut ObjectRef) -> Result<()> {
        self.call(comm, object, |b, ctx| b.unlink(ctx))
    }

    pub fn file_stat(&self, comm: &ClientConnection, object: &mut ObjectRef) -> Result<FileStat> {
        self.call(comm, object, |b, ctx| b.stat(ctx))
    }

    pub fn file_lseek(
        &self,
        comm: &ClientConnection,
        object: &mut ObjectRef,
        pos: SeekFrom,
    ) -> Result<u64> {
        self.call(comm, object, |b, ctx| b.lseek(ctx, pos))
    }

    pub fn file_mkdir(&self, comm: &ClientConnection, object: &mut ObjectRef) -> Result<()> {
        self.call(comm, object, |b, ctx| b.mkdir(ctx))
    }

    pub fn file_rmdir(&self, comm: &ClientConnection, object: &mut ObjectRef) -> Result<()> {
        self.call(comm, object, |b, ctx| b.rmdir(ctx))
    }

    pub fn file_opendir(&self, comm: &ClientConnection, object: &mut ObjectRef) -> Result<()> {
        self.call(comm, object, |b, ctx| b.opendir(ctx))
    }

    pub fn file_readdir(
        &self,
        comm: &ClientConnection,
        object: &mut ObjectRef,
    ) -> Result<Option<DirEntry>> {
        self.call(comm, object, |b, ctx| b.readdir(ctx))
    }

    pub fn file_closedir(&self, comm: &ClientConnection, object: &mut ObjectRef) -> Result<()> {
        self.call(comm, object, |b, ctx| b.closedir(ctx))
    }

    pub fn file_rename(
        &self,
        comm: &ClientConnection,
        object: &mut ObjectRef,
        new_path: &str,
    ) -> Result<()> {
        self.call(comm, object, |b, ctx| b.rename(ctx, new_path))
    }

    pub fn file_truncate(&self, comm: &ClientConnection, object: &mut ObjectRef) -> Result<()> {
        self.call(comm, object, |b, ctx| b.truncate(ctx))
    }

    pub fn file_freespace(&self, comm: &ClientConnection, object: &mut ObjectRef) -> Result<u64> {
        self.call(comm, object, |b, ctx| b.freespace(ctx))
    }

    pub fn file_stage_to_cache(
        &self,
        comm: &ClientConnection,
        object: &mut ObjectRef,
        cache_path: &str,
    ) -> Result<()> {
        self.call(comm, object, |b, ctx| b.stage_to_cache(ctx, cache_path))
    }

    pub fn file_sync_to_arch(
        &self,
        comm: &ClientConnection,
        object: &mut ObjectRef,
        cache_path: &str,
    ) -> Result<()> {
        self.call(comm, object, |b, ctx| b.sync_to_arch(ctx, cache_path))
    }

    pub fn file_registered(&self, comm: &ClientConnection, object: &mut ObjectRef) -> Result<()> {
        self.call(comm, object, |b, ctx| b.registered(ctx))
    }

    pub fn file_unregistered(
        &self,
        comm: &ClientConnection,
        object: &mut ObjectRef,
    ) -> Result<()> {
        self.call(comm, object, |b, ctx| b.unregistered(ctx))
    }

    pub fn file_modified(&self, comm: &ClientConnection, object: &mut ObjectRef) -> Result<()> {
        self.call(comm, object, |b, ctx| b.modified(ctx))
    }

    pub fn file_notify(
        &self,
        comm: &ClientConnection,
        object: &mut ObjectRef,
        operation: &str,
    ) -> Result<()> {
        self.call(comm, object, |b, ctx| b.notify(ctx, operation))
    }

    /// Ask the subtree under `start` for a vote, continuing `parser`
    pub fn resolve_from(
        &self,
        start: ResourceId,
        comm: &ClientConnection,
        op: Operation,
        object: &mut ObjectRef,
        parser: &mut HierarchyParser,
    ) -> Result<f32> {
        let host = comm.client_host.clone();
        self.call_at(start, comm, object, |b, ctx| {
            b.resolve_hierarchy(ctx, op, &host, parser)
        })
    }

    /// Rebalance the subtree under `name`
    pub fn rebalance(&self, comm: &ClientConnection, name: &str) -> Result<()> {
        let id = self.id_of(name)?;
        let mut object = ObjectRef::Data(crate::object::DataObject::new(
            "",
            self.hierarchy_of(id),
        ));
        self.call_at(id, comm, &mut object, |b, ctx| b.rebalance(ctx))
    }
}
