//! Configuration types for DataGrid
//!
//! The server reads one TOML file. Every field has a default so a minimal
//! file only needs the zone, host and resource definitions.

use crate::checksum::ChecksumAlgorithm;
use crate::error::{Error, Result};
use crate::types::{ResourceClass, ResourceStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Top-level server configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub descriptors: DescriptorConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub checksum: ChecksumConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub resource_groups: Vec<ResourceGroupConfig>,
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
}

/// Identity of this server
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_zone")]
    pub zone: String,
    #[serde(default = "default_host")]
    pub host: String,
    /// Resource (or resource group) used when a request names none
    #[serde(default)]
    pub default_resource: Option<String>,
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
    /// Directory holding mass-storage scripts
    #[serde(default)]
    pub script_dir: Option<PathBuf>,
}

fn default_zone() -> String {
    "tempZone".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            zone: default_zone(),
            host: default_host(),
            default_resource: None,
            catalog_path: None,
            script_dir: None,
        }
    }
}

/// L1 descriptor table sizing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DescriptorConfig {
    #[serde(default = "default_descriptor_capacity")]
    pub capacity: usize,
}

const fn default_descriptor_capacity() -> usize {
    1026
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            capacity: default_descriptor_capacity(),
        }
    }
}

/// Byte-transfer tuning for replication and put/get
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Objects up to this size move through one buffer when no threads are requested
    #[serde(default = "default_single_buffer_threshold")]
    pub single_buffer_threshold: u64,
    #[serde(default = "default_threads")]
    pub default_threads: usize,
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Smallest range handed to one parallel transfer worker
    #[serde(default = "default_min_range_size")]
    pub min_range_size: u64,
}

const fn default_buffer_size() -> usize {
    4 * 1024 * 1024
}

const fn default_single_buffer_threshold() -> u64 {
    32 * 1024 * 1024
}

const fn default_threads() -> usize {
    4
}

const fn default_max_threads() -> usize {
    16
}

const fn default_min_range_size() -> u64 {
    1024 * 1024
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            single_buffer_threshold: default_single_buffer_threshold(),
            default_threads: default_threads(),
            max_threads: default_max_threads(),
            min_range_size: default_min_range_size(),
        }
    }
}

/// Permissions used when creating vault files and directories
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "default_dir_mode")]
    pub default_dir_mode: u32,
    #[serde(default = "default_file_mode")]
    pub default_file_mode: u32,
}

const fn default_dir_mode() -> u32 {
    0o750
}

const fn default_file_mode() -> u32 {
    0o600
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            default_dir_mode: default_dir_mode(),
            default_file_mode: default_file_mode(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChecksumConfig {
    #[serde(default)]
    pub algorithm: ChecksumAlgorithm,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// One resource instance in the tree
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub vault: String,
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default)]
    pub class: ResourceClass,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub quota: Option<u64>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub children: Vec<ChildConfig>,
}

impl ResourceConfig {
    /// Minimal description of a resource of `type_name`
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            host: default_host(),
            vault: String::new(),
            status: ResourceStatus::Up,
            class: ResourceClass::Cache,
            context: String::new(),
            quota: None,
            properties: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[must_use]
    pub fn with_vault(mut self, vault: impl Into<String>) -> Self {
        self.vault = vault.into();
        self
    }

    #[must_use]
    pub const fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub const fn with_class(mut self, class: ResourceClass) -> Self {
        self.class = class;
        self
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_child(mut self, name: impl Into<String>, context: impl Into<String>) -> Self {
        self.children.push(ChildConfig {
            name: name.into(),
            context: context.into(),
        });
        self
    }
}

/// Reference from a composite resource to one of its children
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChildConfig {
    pub name: String,
    #[serde(default)]
    pub context: String,
}

/// Ranked set of resources a create may be placed on
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceGroupConfig {
    pub name: String,
    pub members: Vec<String>,
}

/// Remote zone reachable through a federation host
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub name: String,
    pub host: String,
}

impl ServerConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Host serving a remote zone
    #[must_use]
    pub fn zone_host(&self, zone: &str) -> Option<&str> {
        self.zones
            .iter()
            .find(|z| z.name == zone)
            .map(|z| z.host.as_str())
    }

    /// Check names are unique and every child reference resolves
    pub fn validate(&self) -> Result<()> {
        if self.descriptors.capacity == 0 {
            return Err(Error::Configuration(
                "descriptor capacity must be positive".into(),
            ));
        }
        if self.transfer.buffer_size == 0 {
            return Err(Error::Configuration(
                "transfer buffer size must be positive".into(),
            ));
        }

        let mut names = HashSet::new();
        for resc in &self.resources {
            if resc.name.is_empty() || resc.name.contains('/') {
                return Err(Error::Configuration(format!(
                    "invalid resource name \"{}\"",
                    resc.name
                )));
            }
            if !names.insert(resc.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate resource name {}",
                    resc.name
                )));
            }
        }

        for resc in &self.resources {
            for child in &resc.children {
                if !names.contains(child.name.as_str()) {
                    return Err(Error::Configuration(format!(
                        "resource {} names unknown child {}",
                        resc.name, child.name
                    )));
                }
            }
        }

        for group in &self.resource_groups {
            if names.contains(group.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "resource group {} shadows a resource",
                    group.name
                )));
            }
            if let Some(missing) = group.members.iter().find(|m| !names.contains(m.as_str())) {
                return Err(Error::Configuration(format!(
                    "resource group {} names unknown resource {missing}",
                    group.name
                )));
            }
        }

        if let Some(default) = &self.server.default_resource {
            let known = names.contains(default.as_str())
                || self.resource_groups.iter().any(|g| &g.name == default);
            if !known {
                return Err(Error::Configuration(format!(
                    "default resource {default} is not defined"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[server]
zone = "zoneA"
host = "hostA"
default_resource = "demoResc"

[transfer]
single_buffer_threshold = 1024

[[resources]]
name = "demoResc"
type = "passthru"
children = [{ name = "leaf" }]

[[resources]]
name = "leaf"
type = "unixfilesystem"
host = "hostA"
vault = "/var/lib/datagrid/vault"
status = "down"

[[zones]]
name = "zoneB"
host = "icat.zoneb.example"
"#;

    #[test]
    fn test_parse_sample() {
        let config = ServerConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.server.zone, "zoneA");
        assert_eq!(config.descriptors.capacity, 1026);
        assert_eq!(config.transfer.single_buffer_threshold, 1024);
        assert_eq!(config.transfer.buffer_size, 4 * 1024 * 1024);
        assert_eq!(config.vault.default_dir_mode, 0o750);
        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.resources[1].status, ResourceStatus::Down);
        assert_eq!(config.resources[0].children[0].context, "");
        assert_eq!(config.zone_host("zoneB"), Some("icat.zoneb.example"));
        assert_eq!(config.zone_host("zoneC"), None);
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.server.zone, "tempZone");
        assert_eq!(config.checksum.algorithm, ChecksumAlgorithm::Md5);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_child() {
        let mut config = ServerConfig::default();
        config
            .resources
            .push(ResourceConfig::new("pt", "passthru").with_child("ghost", ""));
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let mut config = ServerConfig::default();
        config.resources.push(ResourceConfig::new("a", "unixfilesystem"));
        config.resources.push(ResourceConfig::new("a", "unixfilesystem"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.server.host, "hostA");
        assert!(ServerConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
