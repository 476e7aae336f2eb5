//! Servers and collaborators shared by the unit tests

use crate::bundle::ArchivePacker;
use crate::remote::{RemoteDispatcher, RemoteReply, RemoteRequest};
use crate::request::DataObjRequest;
use crate::server::Server;
use datagrid_catalog::{Catalog, MemoryCatalog, PathKind, ReplicaFilter, ReplicaPatch};
use datagrid_common::config::{ResourceConfig, ResourceGroupConfig, ZoneConfig};
use datagrid_common::{
    ClientConnection, Error, PolicyContext, PolicyHook, ReplicaInfo, ResourceClass,
    ResourcePropertyStore, Result, RuleEngine, ServerConfig,
};
use datagrid_resource::compound::{ARCHIVE_CONTEXT, CACHE_CONTEXT};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

pub fn comm() -> ClientConnection {
    ClientConnection::new("localhost", "rods", "tempZone")
}

fn unixfs(dir: &TempDir, name: &str) -> ResourceConfig {
    ResourceConfig::new(name, "unixfilesystem").with_vault(dir.path().join(name).to_string_lossy())
}

fn config(resources: Vec<ResourceConfig>, default: &str) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.server.default_resource = Some(default.to_string());
    // small ranges so parallel transfers kick in on test-sized objects
    config.transfer.min_range_size = 64 * 1024;
    config.transfer.buffer_size = 16 * 1024;
    config.resources = resources;
    config
}

fn build(config: ServerConfig) -> Server {
    Server::builder(config).build().unwrap()
}

pub fn single_resource() -> (TempDir, Server) {
    let dir = tempfile::tempdir().unwrap();
    let server = build(config(vec![unixfs(&dir, "disk")], "disk"));
    (dir, server)
}

pub fn single_resource_with_rules(rules: Arc<RecordingRules>) -> (TempDir, Server) {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::builder(config(vec![unixfs(&dir, "disk")], "disk"))
        .rule_engine(rules)
        .build()
        .unwrap();
    (dir, server)
}

pub fn single_resource_with_packer(packer: Arc<dyn ArchivePacker>) -> (TempDir, Server) {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::builder(config(vec![unixfs(&dir, "disk")], "disk"))
        .packer(packer)
        .build()
        .unwrap();
    (dir, server)
}

/// `disk1` and `disk2`, grouped as `both`
pub fn two_resources() -> (TempDir, Server) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(vec![unixfs(&dir, "disk1"), unixfs(&dir, "disk2")], "disk1");
    config.resource_groups.push(ResourceGroupConfig {
        name: "both".into(),
        members: vec!["disk1".into(), "disk2".into()],
    });
    (dir, build(config))
}

/// Compound `comp` over `cache` and `arch`, plus a standalone `plain`
pub fn compound_server() -> (TempDir, Server) {
    let dir = tempfile::tempdir().unwrap();
    let resources = vec![
        ResourceConfig::new("comp", "compound")
            .with_class(ResourceClass::Compound)
            .with_child("cache", CACHE_CONTEXT)
            .with_child("arch", ARCHIVE_CONTEXT),
        unixfs(&dir, "cache"),
        unixfs(&dir, "arch").with_class(ResourceClass::Archive),
        unixfs(&dir, "plain"),
    ];
    let server = build(config(resources, "plain"));
    (dir, server)
}

/// Round robin `rr` over `rr0` and `rr1`
pub fn round_robin_server() -> (TempDir, Server) {
    let dir = tempfile::tempdir().unwrap();
    let resources = vec![
        ResourceConfig::new("rr", "roundrobin")
            .with_child("rr0", "0")
            .with_child("rr1", "1"),
        unixfs(&dir, "rr0"),
        unixfs(&dir, "rr1"),
    ];
    let server = build(config(resources, "rr"));
    (dir, server)
}

/// `disk` and `disk2` over a catalog that fails on demand
pub fn failing_catalog_server() -> (TempDir, Server, Arc<FailingCatalog>) {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(FailingCatalog::default());
    let server = Server::builder(config(vec![unixfs(&dir, "disk"), unixfs(&dir, "disk2")], "disk"))
        .catalog(catalog.clone())
        .build()
        .unwrap();
    (dir, server, catalog)
}

/// This server is `hostB` holding `rescB`; `rescA` lives on `hostA`
pub fn two_hosts(remote: Arc<RecordingRemote>) -> (TempDir, Server) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(
        vec![
            ResourceConfig::new("rescA", "unixfilesystem")
                .with_host("hostA")
                .with_vault(dir.path().join("a").to_string_lossy()),
            ResourceConfig::new("rescB", "unixfilesystem")
                .with_host("hostB")
                .with_vault(dir.path().join("b").to_string_lossy()),
        ],
        "rescB",
    );
    config.server.host = "hostB".into();
    config.zones.push(ZoneConfig {
        name: "otherZone".into(),
        host: "zoneHost".into(),
    });
    let server = Server::builder(config).remote(remote).build().unwrap();
    (dir, server)
}

/// Create `obj_path` on `resource` holding `data`
pub fn put_bytes(server: &Server, obj_path: &str, resource: &str, data: &[u8]) -> ReplicaInfo {
    server
        .put(
            &comm(),
            DataObjRequest::new(obj_path).with_resource(resource),
            &mut &data[..],
        )
        .unwrap()
}

/// Transport that records requests and plays back scripted replies
#[derive(Default)]
pub struct RecordingRemote {
    replies: Mutex<VecDeque<RemoteReply>>,
    requests: Mutex<Vec<(String, RemoteRequest)>>,
}

impl RecordingRemote {
    pub fn reply(&self, reply: RemoteReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn requests(&self) -> Vec<(String, RemoteRequest)> {
        self.requests.lock().clone()
    }
}

impl RemoteDispatcher for RecordingRemote {
    fn forward(&self, host: &str, request: RemoteRequest) -> Result<RemoteReply> {
        self.requests.lock().push((host.to_string(), request));
        self.replies.lock().pop_front().ok_or_else(|| Error::Remote {
            host: host.to_string(),
            message: "no reply scripted".into(),
        })
    }
}

/// Rule engine remembering the hooks it ran
#[derive(Default)]
pub struct RecordingRules {
    hooks: Mutex<Vec<PolicyHook>>,
    failing: Mutex<Option<PolicyHook>>,
}

impl RecordingRules {
    pub fn hooks(&self) -> Vec<PolicyHook> {
        self.hooks.lock().clone()
    }

    pub fn fail_on(&self, hook: PolicyHook) {
        *self.failing.lock() = Some(hook);
    }
}

impl RuleEngine for RecordingRules {
    fn apply_policy(&self, hook: PolicyHook, _ctx: &PolicyContext) -> Result<()> {
        self.hooks.lock().push(hook);
        if *self.failing.lock() == Some(hook) {
            return Err(Error::Policy {
                hook: hook.name().to_string(),
                message: "refused by test policy".into(),
            });
        }
        Ok(())
    }
}

/// Packer whose pack step always fails
pub struct FailingPacker;

impl ArchivePacker for FailingPacker {
    fn pack(&self, _staging: &Path, archive: &Path) -> Result<u64> {
        Err(Error::Bundle(format!("refusing to write {}", archive.display())))
    }

    fn unpack(&self, archive: &Path, _staging: &Path) -> Result<()> {
        Err(Error::Bundle(format!("refusing to read {}", archive.display())))
    }
}

/// Memory catalog whose writes can be made to fail
#[derive(Default)]
pub struct FailingCatalog {
    inner: MemoryCatalog,
    fail_register: AtomicBool,
    fail_modify: AtomicBool,
}

impl FailingCatalog {
    pub fn fail_register(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    pub fn fail_modify(&self, fail: bool) {
        self.fail_modify.store(fail, Ordering::SeqCst);
    }
}

impl ResourcePropertyStore for FailingCatalog {
    fn get_property(&self, resource: &str, key: &str) -> Result<Option<String>> {
        self.inner.get_property(resource, key)
    }

    fn compare_and_set_property(
        &self,
        resource: &str,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool> {
        self.inner.compare_and_set_property(resource, key, expected, value)
    }
}

impl Catalog for FailingCatalog {
    fn stat_path(&self, path: &str) -> Result<PathKind> {
        self.inner.stat_path(path)
    }

    fn get_data_obj_info(&self, obj_path: &str, filter: &ReplicaFilter) -> Result<Vec<ReplicaInfo>> {
        self.inner.get_data_obj_info(obj_path, filter)
    }

    fn get_resc_grp_for_create(&self, obj_path: &str, requested: Option<&str>) -> Result<Vec<String>> {
        self.inner.get_resc_grp_for_create(obj_path, requested)
    }

    fn register_replica(&self, replica: ReplicaInfo) -> Result<ReplicaInfo> {
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(Error::catalog("register refused"));
        }
        self.inner.register_replica(replica)
    }

    fn modify_replica(&self, obj_path: &str, repl_num: i32, patch: &ReplicaPatch) -> Result<ReplicaInfo> {
        if self.fail_modify.load(Ordering::SeqCst) {
            return Err(Error::catalog("modify refused"));
        }
        self.inner.modify_replica(obj_path, repl_num, patch)
    }

    fn unregister_replica(&self, obj_path: &str, repl_num: i32) -> Result<()> {
        self.inner.unregister_replica(obj_path, repl_num)
    }

    fn find_by_physical_path(&self, leaf: &str, phy_path: &str) -> Result<Option<ReplicaInfo>> {
        self.inner.find_by_physical_path(leaf, phy_path)
    }

    fn list_data_objects(&self, coll: &str, recursive: bool) -> Result<Vec<ReplicaInfo>> {
        self.inner.list_data_objects(coll, recursive)
    }

    fn create_collection(&self, path: &str) -> Result<()> {
        self.inner.create_collection(path)
    }

    fn update_quota_usage(&self, resource: &str, delta: i64) -> Result<u64> {
        self.inner.update_quota_usage(resource, delta)
    }

    fn quota_usage(&self, resource: &str) -> Result<u64> {
        self.inner.quota_usage(resource)
    }

    fn define_resource_group(&self, name: &str, members: &[String]) -> Result<()> {
        self.inner.define_resource_group(name, members)
    }

    fn set_default_resource(&self, name: Option<&str>) -> Result<()> {
        self.inner.set_default_resource(name)
    }
}
