//! Resource type registry and tree builder
//!
//! Configured type names map to backend constructors. The builder creates
//! one arena node per configured resource, links children by name, checks
//! each backend accepts its children and then starts every backend.

use crate::backend::ResourceBackend;
use crate::compound::Compound;
use crate::mso::MassStorageScript;
use crate::passthru::Passthru;
use crate::roundrobin::RoundRobin;
use crate::tree::{ChildEntry, ResourceId, ResourceNode, ResourceTree};
use crate::unixfs::UnixFileSystem;
use datagrid_common::config::ResourceConfig;
use datagrid_common::{
    Error, MemoryPropertyStore, NoopRuleEngine, ResourcePropertyStore, Result, RuleEngine,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Constructor for a backend type
pub type BackendFactory = fn(&ResourceConfig) -> Result<Box<dyn ResourceBackend>>;

/// Map from configured type names to backend constructors
#[derive(Clone)]
pub struct ResourceRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ResourceRegistry {
    /// Registry with no types
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in backend
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry
            .register(UnixFileSystem::TYPE_NAME, |_| Ok(Box::new(UnixFileSystem)))
            .register(Passthru::TYPE_NAME, |_| Ok(Box::new(Passthru)))
            .register(RoundRobin::TYPE_NAME, |_| Ok(Box::new(RoundRobin)))
            .register(Compound::TYPE_NAME, |_| Ok(Box::new(Compound)))
            .register(MassStorageScript::TYPE_NAME, |_| {
                Ok(Box::new(MassStorageScript))
            });
        registry
    }

    pub fn register(&mut self, type_name: &str, factory: BackendFactory) -> &mut Self {
        self.factories.insert(type_name.to_ascii_lowercase(), factory);
        self
    }

    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(&type_name.to_ascii_lowercase())
    }

    pub fn create(&self, config: &ResourceConfig) -> Result<Box<dyn ResourceBackend>> {
        let factory = self
            .factories
            .get(&config.type_name.to_ascii_lowercase())
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "resource {} has unknown type {}",
                    config.name, config.type_name
                ))
            })?;
        factory(config)
    }
}

/// Builder for [`ResourceTree`]
pub struct ResourceTreeBuilder {
    registry: ResourceRegistry,
    local_host: String,
    local_zone: String,
    props: Option<Arc<dyn ResourcePropertyStore>>,
    rules: Option<Arc<dyn RuleEngine>>,
    configs: Vec<ResourceConfig>,
}

impl Default for ResourceTreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceTreeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: ResourceRegistry::with_builtin(),
            local_host: "localhost".to_string(),
            local_zone: "tempZone".to_string(),
            props: None,
            rules: None,
            configs: Vec::new(),
        }
    }

    #[must_use]
    pub fn registry(mut self, registry: ResourceRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = host.into();
        self
    }

    #[must_use]
    pub fn local_zone(mut self, zone: impl Into<String>) -> Self {
        self.local_zone = zone.into();
        self
    }

    #[must_use]
    pub fn property_store(mut self, props: Arc<dyn ResourcePropertyStore>) -> Self {
        self.props = Some(props);
        self
    }

    #[must_use]
    pub fn rule_engine(mut self, rules: Arc<dyn RuleEngine>) -> Self {
        self.rules = Some(rules);
        self
    }

    #[must_use]
    pub fn resource(mut self, config: ResourceConfig) -> Self {
        self.configs.push(config);
        self
    }

    #[must_use]
    pub fn resources(mut self, configs: impl IntoIterator<Item = ResourceConfig>) -> Self {
        self.configs.extend(configs);
        self
    }

    pub fn build(self) -> Result<ResourceTree> {
        let mut nodes = Vec::with_capacity(self.configs.len());
        let mut by_name = HashMap::new();

        for (idx, config) in self.configs.iter().enumerate() {
            let id = ResourceId(idx);
            if by_name.insert(config.name.clone(), id).is_some() {
                return Err(Error::Configuration(format!(
                    "duplicate resource name {}",
                    config.name
                )));
            }
            let backend = self.registry.create(config)?;
            nodes.push(ResourceNode {
                id,
                name: config.name.clone(),
                type_name: backend.type_name().to_string(),
                class: config.class,
                host: config.host.clone(),
                zone: self.local_zone.clone(),
                vault_path: config.vault.clone(),
                context: config.context.clone(),
                quota: config.quota,
                properties: config.properties.clone(),
                status: RwLock::new(config.status),
                parent: None,
                children: Vec::new(),
                backend,
            });
        }

        for (idx, config) in self.configs.iter().enumerate() {
            for child in &config.children {
                let child_id = *by_name.get(&child.name).ok_or_else(|| {
                    Error::Configuration(format!(
                        "resource {} names unknown child {}",
                        config.name, child.name
                    ))
                })?;
                if child_id.0 == idx {
                    return Err(Error::Configuration(format!(
                        "resource {} cannot be its own child",
                        config.name
                    )));
                }
                if let Some(existing) = nodes[child_id.0].parent {
                    return Err(Error::Configuration(format!(
                        "resource {} already has parent {}",
                        child.name, nodes[existing.0].name
                    )));
                }
                nodes[child_id.0].parent = Some(ResourceId(idx));
                nodes[idx].children.push(ChildEntry {
                    name: child.name.clone(),
                    context: child.context.clone(),
                    id: child_id,
                });
            }
        }

        // every walk up the parent chain must reach a root
        for node in &nodes {
            let mut seen = 0;
            let mut current = node.parent;
            while let Some(parent) = current {
                seen += 1;
                if seen > nodes.len() {
                    return Err(Error::Configuration(format!(
                        "resource {} is part of a parent cycle",
                        node.name
                    )));
                }
                current = nodes[parent.0].parent;
            }
        }

        for node in &nodes {
            node.backend.validate_children(node)?;
        }

        let tree = ResourceTree {
            nodes,
            by_name,
            local_host: self.local_host,
            local_zone: self.local_zone,
            props: self
                .props
                .unwrap_or_else(|| Arc::new(MemoryPropertyStore::new())),
            rules: self.rules.unwrap_or_else(|| Arc::new(NoopRuleEngine)),
        };

        for node in tree.iter() {
            node.backend().start(node, &tree)?;
            debug!(
                "Started {} resource {} ({} children)",
                node.type_name(),
                node.name(),
                node.children().len()
            );
        }
        info!(
            "Resource tree ready: {} resources, {} roots",
            tree.nodes.len(),
            tree.roots().count()
        );
        Ok(tree)
    }
}
