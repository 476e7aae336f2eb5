//! Server state shared by every operation
//!
//! A [`Server`] owns the resource tree, the L1 descriptor table and the
//! handles to its collaborators (catalog, rule engine, remote transport,
//! archive packer). Operations live in their own modules as `impl Server`
//! blocks.

use crate::bundle::{ArchivePacker, TarPacker};
use crate::l1desc::{DescriptorTable, L1Handle, SharedDescriptor};
use crate::remote::{LocalOnlyDispatcher, RemoteDispatcher};
use datagrid_catalog::{Catalog, MemoryCatalog};
use datagrid_common::config::ResourceConfig;
use datagrid_common::{
    zone_of, ClientConnection, Error, NoopRuleEngine, PolicyContext, PolicyHook, ReplicaInfo,
    ResourcePropertyStore, Result, RuleEngine, ScriptRuleEngine, ServerConfig,
};
use datagrid_resource::unixfs::DIR_MODE_PROP;
use datagrid_resource::{DataObject, ObjectRef, ResourceRegistry, ResourceTree, ResourceTreeBuilder};
use std::sync::Arc;
use tracing::{error, info};

/// Replica lifecycle engine for one server process
pub struct Server {
    pub(crate) config: ServerConfig,
    pub(crate) tree: ResourceTree,
    pub(crate) catalog: Arc<dyn Catalog>,
    pub(crate) remote: Arc<dyn RemoteDispatcher>,
    pub(crate) packer: Arc<dyn ArchivePacker>,
    pub(crate) descriptors: DescriptorTable,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("zone", &self.config.server.zone)
            .field("host", &self.config.server.host)
            .field("tree", &self.tree)
            .finish_non_exhaustive()
    }
}

/// Builder wiring a [`Server`] to its collaborators
pub struct ServerBuilder {
    config: ServerConfig,
    registry: ResourceRegistry,
    catalog: Option<Arc<dyn Catalog>>,
    rules: Option<Arc<dyn RuleEngine>>,
    remote: Arc<dyn RemoteDispatcher>,
    packer: Arc<dyn ArchivePacker>,
}

impl ServerBuilder {
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: ResourceRegistry::with_builtin(),
            catalog: None,
            rules: None,
            remote: Arc::new(LocalOnlyDispatcher),
            packer: Arc::new(TarPacker),
        }
    }

    #[must_use]
    pub fn registry(mut self, registry: ResourceRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    #[must_use]
    pub fn rule_engine(mut self, rules: Arc<dyn RuleEngine>) -> Self {
        self.rules = Some(rules);
        self
    }

    #[must_use]
    pub fn remote(mut self, remote: Arc<dyn RemoteDispatcher>) -> Self {
        self.remote = remote;
        self
    }

    #[must_use]
    pub fn packer(mut self, packer: Arc<dyn ArchivePacker>) -> Self {
        self.packer = packer;
        self
    }

    pub fn build(self) -> Result<Server> {
        let config = self.config;
        config.validate()?;

        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(MemoryCatalog::new()));
        let rules: Arc<dyn RuleEngine> = match (self.rules, &config.server.script_dir) {
            (Some(rules), _) => rules,
            (None, Some(dir)) => Arc::new(ScriptRuleEngine::new(dir)),
            (None, None) => Arc::new(NoopRuleEngine),
        };
        let props: Arc<dyn ResourcePropertyStore> = catalog.clone();

        let dir_mode = format!("{:o}", config.vault.default_dir_mode);
        let resources = config.resources.iter().cloned().map(|resc: ResourceConfig| {
            if resc.properties.contains_key(DIR_MODE_PROP) {
                resc
            } else {
                resc.with_property(DIR_MODE_PROP, dir_mode.clone())
            }
        });
        let tree = ResourceTreeBuilder::new()
            .registry(self.registry)
            .local_host(config.server.host.clone())
            .local_zone(config.server.zone.clone())
            .property_store(props)
            .rule_engine(rules)
            .resources(resources)
            .build()?;

        for group in &config.resource_groups {
            catalog.define_resource_group(&group.name, &group.members)?;
        }
        if let Some(default) = &config.server.default_resource {
            catalog.set_default_resource(Some(default))?;
        }

        info!(
            "Server for zone {} on host {} ready with {} resources",
            config.server.zone,
            config.server.host,
            tree.iter().count()
        );
        Ok(Server {
            descriptors: DescriptorTable::new(config.descriptors.capacity),
            config,
            tree,
            catalog,
            remote: self.remote,
            packer: self.packer,
        })
    }
}

impl Server {
    #[must_use]
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub const fn tree(&self) -> &ResourceTree {
        &self.tree
    }

    #[must_use]
    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    #[must_use]
    pub fn local_zone(&self) -> &str {
        &self.config.server.zone
    }

    /// Look up an open descriptor
    pub fn descriptor(&self, handle: L1Handle) -> Result<SharedDescriptor> {
        self.descriptors.get(handle)
    }

    /// Host serving the zone of `obj_path` when that zone is not ours
    pub(crate) fn remote_zone_host(&self, obj_path: &str) -> Result<Option<String>> {
        match zone_of(obj_path) {
            Some(zone) if zone != self.local_zone() => self
                .config
                .zone_host(zone)
                .map(|host| Some(host.to_string()))
                .ok_or_else(|| Error::Remote {
                    host: zone.to_string(),
                    message: format!("no server known for zone {zone}"),
                }),
            _ => Ok(None),
        }
    }

    /// Mode for a new physical file
    pub(crate) const fn file_mode(&self, requested: u32) -> u32 {
        if requested == 0 {
            self.config.vault.default_file_mode
        } else {
            requested
        }
    }

    pub(crate) fn policy_context(comm: &ClientConnection, replica: &ReplicaInfo) -> PolicyContext {
        PolicyContext {
            obj_path: replica.obj_path.clone(),
            resc_hier: replica.resc_hier.clone(),
            phy_path: replica.phy_path.clone(),
            size: replica.size,
            repl_num: replica.repl_num,
            user: comm.user.clone(),
            ..PolicyContext::default()
        }
    }

    /// Run the policy bound to `hook`, logging a failure before returning it
    pub(crate) fn apply_policy(
        &self,
        hook: PolicyHook,
        comm: &ClientConnection,
        replica: &ReplicaInfo,
    ) -> Result<()> {
        let ctx = Self::policy_context(comm, replica);
        self.tree
            .rule_engine()
            .apply_policy(hook, &ctx)
            .inspect_err(|e| error!("{} failed for {}: {}", hook.name(), replica.obj_path, e))
    }

    /// Whole-file reference to a registered replica
    pub(crate) fn data_object(replica: &ReplicaInfo) -> ObjectRef {
        ObjectRef::Data(DataObject {
            physical_path: replica.phy_path.clone(),
            resc_hier: replica.resc_hier.clone(),
            mode: replica.mode,
            size: replica.size,
        })
    }

    /// Size of a physical file that has to exist
    pub(crate) fn physical_size(
        &self,
        comm: &ClientConnection,
        object: &mut ObjectRef,
    ) -> Result<u64> {
        self.tree
            .file_stat(comm, object)
            .map(|stat| stat.size)
            .inspect_err(|e| {
                error!(
                    "Stat of {} on \"{}\" failed: {}",
                    object.physical_path(),
                    object.resc_hier(),
                    e
                );
            })
    }
}
