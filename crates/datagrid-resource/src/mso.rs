//! Mass-storage-object archive backend
//!
//! Replicas are objects behind an external service. Their physical path
//! has the form `//<code>:<locator>` and the bytes move only through the
//! rule engine microservices `msiobjget_<code>` (stage into a cache file)
//! and `msiobjput_<code>` (sync a cache file out). Everything else is
//! either a no-op or unsupported.

use crate::backend::{require_no_children, DirEntry, FileStat, ResourceBackend};
use crate::context::PluginContext;
use crate::object::ObjectRef;
use crate::redirect::{vote_for_open, VOTE_NONE};
use crate::tree::ResourceNode;
use datagrid_common::{Error, FileOp, HierarchyParser, OpenFlags, Operation, Result, ResultExt};
use nix::fcntl::OFlag;
use std::fs;
use std::io::SeekFrom;
use tracing::{debug, error};

pub const GET_MICROSERVICE_PREFIX: &str = "msiobjget_";
pub const PUT_MICROSERVICE_PREFIX: &str = "msiobjput_";

pub struct MassStorageScript;

impl MassStorageScript {
    pub const TYPE_NAME: &'static str = "mso";
}

/// Split `//<code>:<locator>` into the call code and `<code>:<locator>`
pub fn parse_object_path(phy_path: &str) -> Result<(&str, &str)> {
    let stripped = phy_path.strip_prefix("//").ok_or_else(|| {
        Error::invalid_input(format!("mso physical path must start with //: \"{phy_path}\""))
    })?;
    let (code, _) = stripped.split_once(':').ok_or_else(|| {
        Error::invalid_input(format!("[:] not found in physical path for mso \"{phy_path}\""))
    })?;
    if code.is_empty() {
        return Err(Error::invalid_input(format!(
            "mso physical path has an empty object type: \"{phy_path}\""
        )));
    }
    Ok((code, stripped))
}

fn open_flag_bits(flags: OpenFlags) -> i32 {
    let mut bits = if flags.is_write() {
        OFlag::O_RDWR
    } else {
        OFlag::O_RDONLY
    };
    if flags.create {
        bits |= OFlag::O_CREAT;
    }
    if flags.truncate {
        bits |= OFlag::O_TRUNC;
    }
    bits.bits()
}

fn unsupported(ctx: &PluginContext<'_>, what: &str) -> Error {
    Error::not_supported(format!("{what} on mso resource {}", ctx.name()))
}

fn invoke(ctx: &PluginContext<'_>, name: &str, args: &[String]) -> Result<()> {
    debug!("Resource {} invoking {} {:?}", ctx.name(), name, args);
    ctx.tree()
        .rule_engine()
        .invoke_microservice(name, args)
        .map_err(|e| {
            error!("Resource {}: {} failed: {}", ctx.name(), name, e);
            e
        })
        .with_context(|| format!("{name} for {}", ctx.object.physical_path()))
}

impl ResourceBackend for MassStorageScript {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn validate_children(&self, node: &ResourceNode) -> Result<()> {
        require_no_children(node)
    }

    fn create(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        Err(unsupported(ctx, "create"))
    }

    fn open(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        Err(unsupported(ctx, "open"))
    }

    fn read(&self, ctx: &mut PluginContext<'_>, _buf: &mut [u8]) -> Result<usize> {
        Err(unsupported(ctx, "read"))
    }

    fn write(&self, ctx: &mut PluginContext<'_>, _buf: &[u8]) -> Result<usize> {
        Err(unsupported(ctx, "write"))
    }

    fn close(&self, _ctx: &mut PluginContext<'_>) -> Result<()> {
        Ok(())
    }

    fn unlink(&self, _ctx: &mut PluginContext<'_>) -> Result<()> {
        Ok(())
    }

    fn stat(&self, _ctx: &mut PluginContext<'_>) -> Result<FileStat> {
        Ok(FileStat::default())
    }

    fn lseek(&self, ctx: &mut PluginContext<'_>, _pos: SeekFrom) -> Result<u64> {
        Err(unsupported(ctx, "lseek"))
    }

    fn mkdir(&self, _ctx: &mut PluginContext<'_>) -> Result<()> {
        Ok(())
    }

    fn rmdir(&self, _ctx: &mut PluginContext<'_>) -> Result<()> {
        Ok(())
    }

    fn opendir(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        Err(unsupported(ctx, "opendir"))
    }

    fn readdir(&self, ctx: &mut PluginContext<'_>) -> Result<Option<DirEntry>> {
        Err(unsupported(ctx, "readdir"))
    }

    fn closedir(&self, _ctx: &mut PluginContext<'_>) -> Result<()> {
        Ok(())
    }

    fn rename(&self, _ctx: &mut PluginContext<'_>, _new_path: &str) -> Result<()> {
        Ok(())
    }

    fn truncate(&self, _ctx: &mut PluginContext<'_>) -> Result<()> {
        Ok(())
    }

    fn freespace(&self, ctx: &mut PluginContext<'_>) -> Result<u64> {
        Err(unsupported(ctx, "freespace"))
    }

    fn stage_to_cache(&self, ctx: &mut PluginContext<'_>, cache_path: &str) -> Result<()> {
        let phy_path = ctx.object.physical_path().to_string();
        let (code, locator) = parse_object_path(&phy_path)?;
        let flags = match &*ctx.object {
            ObjectRef::File(f) => f.flags,
            _ => OpenFlags::READ,
        };
        let args = [
            locator.to_string(),
            ctx.object.mode().to_string(),
            open_flag_bits(flags).to_string(),
            cache_path.to_string(),
        ];
        invoke(ctx, &format!("{GET_MICROSERVICE_PREFIX}{code}"), &args)
    }

    fn sync_to_arch(&self, ctx: &mut PluginContext<'_>, cache_path: &str) -> Result<()> {
        let meta = fs::metadata(cache_path)
            .map_err(|e| Error::io(FileOp::Stat, ctx.name(), cache_path, e))?;
        if !meta.is_file() {
            return Err(Error::invalid_input(format!(
                "cache file {cache_path} is not a regular file"
            )));
        }
        let phy_path = ctx.object.physical_path().to_string();
        let (code, locator) = parse_object_path(&phy_path)?;
        let args = [
            locator.to_string(),
            cache_path.to_string(),
            meta.len().to_string(),
        ];
        invoke(ctx, &format!("{PUT_MICROSERVICE_PREFIX}{code}"), &args)
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
        match (op, &*ctx.object) {
            // objects only ever arrive through registration or sync
            (Operation::Create, _) => Ok(VOTE_NONE),
            (Operation::Open | Operation::Write, ObjectRef::File(file)) => {
                Ok(vote_for_open(node, file, host))
            }
            _ => Ok(VOTE_NONE),
        }
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
    use datagrid_common::{
        ClientConnection, PolicyContext, PolicyHook, ReplicaInfo, ReplicaStatus, RuleEngine,
    };
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingRules {
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl RuleEngine for RecordingRules {
        fn apply_policy(&self, _hook: PolicyHook, _ctx: &PolicyContext) -> Result<()> {
            Ok(())
        }

        fn invoke_microservice(&self, name: &str, args: &[String]) -> Result<()> {
            self.calls.lock().push((name.to_string(), args.to_vec()));
            if name.ends_with("_broken") {
                return Err(Error::Policy {
                    hook: name.to_string(),
                    message: "exit status 1".into(),
                });
            }
            Ok(())
        }
    }

    fn tree(rules: Arc<RecordingRules>) -> ResourceTree {
        ResourceTreeBuilder::new()
            .rule_engine(rules)
            .resource(ResourceConfig::new("mso", "mso"))
            .build()
            .unwrap()
    }

    fn comm() -> ClientConnection {
        ClientConnection::new("localhost", "u", "tempZone")
    }

    #[test]
    fn test_parse_object_path() {
        assert_eq!(
            parse_object_path("//http:example.org/a").unwrap(),
            ("http", "http:example.org/a")
        );
        assert!(parse_object_path("/plain/path").is_err());
        assert!(parse_object_path("//nocolon").is_err());
        assert!(parse_object_path("//:x").is_err());
    }

    #[test]
    fn test_stage_invokes_get_microservice() {
        let rules = Arc::new(RecordingRules::default());
        let tree = tree(rules.clone());
        let mut obj = ObjectRef::from(DataObject {
            mode: 0o640,
            ..DataObject::new("//s3:bucket/key", "mso")
        });
        tree.file_stage_to_cache(&comm(), &mut obj, "/cache/f").unwrap();

        let calls = rules.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "msiobjget_s3");
        assert_eq!(calls[0].1[0], "s3:bucket/key");
        assert_eq!(calls[0].1[1], (0o640).to_string());
        assert_eq!(calls[0].1[3], "/cache/f");
    }

    #[test]
    fn test_sync_requires_cache_file_and_passes_size() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("c");
        let rules = Arc::new(RecordingRules::default());
        let tree = tree(rules.clone());
        let mut obj = ObjectRef::from(DataObject::new("//s3:bucket/key", "mso"));

        let err = tree
            .file_sync_to_arch(&comm(), &mut obj, &cache.to_string_lossy())
            .unwrap_err();
        assert!(err.is_not_found());

        std::fs::write(&cache, b"12345").unwrap();
        tree.file_sync_to_arch(&comm(), &mut obj, &cache.to_string_lossy())
            .unwrap();
        let calls = rules.calls.lock();
        assert_eq!(calls[0].0, "msiobjput_s3");
        assert_eq!(calls[0].1[2], "5");
    }

    #[test]
    fn test_microservice_failure_propagates() {
        let rules = Arc::new(RecordingRules::default());
        let tree = tree(rules);
        let mut obj = ObjectRef::from(DataObject::new("//broken:x", "mso"));
        let err = tree
            .file_stage_to_cache(&comm(), &mut obj, "/cache/f")
            .unwrap_err();
        assert!(matches!(err.root(), Error::Policy { .. }));
    }

    #[test]
    fn test_byte_io_unsupported_and_votes() {
        let rules = Arc::new(RecordingRules::default());
        let tree = tree(rules);
        let mut obj = ObjectRef::from(FileObject::new("/tempZone/f", "//s3:k", "mso"));
        assert!(matches!(
            tree.file_open(&comm(), &mut obj),
            Err(Error::OperationNotSupported(_))
        ));
        tree.file_unlink(&comm(), &mut obj).unwrap();

        let file = FileObject::for_vote("/tempZone/f", &[], None);
        let (vote, _) = request_vote(&tree, &comm(), "mso", Operation::Create, &file).unwrap();
        assert!(vote.abs() < f32::EPSILON);

        let replicas = [ReplicaInfo {
            resc_hier: "mso".into(),
            status: ReplicaStatus::good(),
            ..ReplicaInfo::default()
        }];
        let file = FileObject::for_vote("/tempZone/f", &replicas, None);
        let (vote, _) = request_vote(&tree, &comm(), "mso", Operation::Open, &file).unwrap();
        assert!((vote - 1.0).abs() < f32::EPSILON);
    }
}
