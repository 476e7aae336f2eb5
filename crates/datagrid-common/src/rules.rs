//! Policy hook contract
//!
//! The engine calls out to a rule engine at fixed extension points and
//! only looks at the returned status. Microservice invocation is used by
//! the mass-storage resource to reach its transfer scripts.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, warn};

/// Fixed extension points
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PolicyHook {
    PostCreate,
    PostOpen,
    PostPut,
    PostCopy,
    PostReplicate,
    PostPhymv,
    BulkPutPolicy,
    BulkPostProcess,
}

impl PolicyHook {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PostCreate => "acPostProcForCreate",
            Self::PostOpen => "acPostProcForOpen",
            Self::PostPut => "acPostProcForPut",
            Self::PostCopy => "acPostProcForCopy",
            Self::PostReplicate => "acPostProcForRepl",
            Self::PostPhymv => "acPostProcForPhymv",
            Self::BulkPutPolicy => "acBulkPutPostProcPolicy",
            Self::BulkPostProcess => "acPostProcForBulkPut",
        }
    }
}

/// Values exposed to a policy hook
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyContext {
    pub obj_path: String,
    pub resc_hier: String,
    pub phy_path: String,
    pub size: u64,
    pub repl_num: i32,
    pub user: String,
    pub extra: BTreeMap<String, String>,
}

impl PolicyContext {
    pub fn new(obj_path: impl Into<String>) -> Self {
        Self {
            obj_path: obj_path.into(),
            ..Self::default()
        }
    }
}

pub trait RuleEngine: Send + Sync {
    /// Run the policy bound to `hook`
    fn apply_policy(&self, hook: PolicyHook, ctx: &PolicyContext) -> Result<()>;

    /// Invoke a named microservice with positional arguments
    fn invoke_microservice(&self, name: &str, args: &[String]) -> Result<()> {
        let _ = args;
        Err(Error::not_supported(format!("microservice {name}")))
    }
}

/// Rule engine with no policies bound
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRuleEngine;

impl RuleEngine for NoopRuleEngine {
    fn apply_policy(&self, hook: PolicyHook, ctx: &PolicyContext) -> Result<()> {
        debug!("No policy bound to {} for {}", hook.name(), ctx.obj_path);
        Ok(())
    }
}

/// Runs microservices as executables named after the microservice
#[derive(Clone, Debug)]
pub struct ScriptRuleEngine {
    script_dir: PathBuf,
}

impl ScriptRuleEngine {
    pub fn new(script_dir: impl Into<PathBuf>) -> Self {
        Self {
            script_dir: script_dir.into(),
        }
    }
}

impl RuleEngine for ScriptRuleEngine {
    fn apply_policy(&self, hook: PolicyHook, ctx: &PolicyContext) -> Result<()> {
        debug!("No policy bound to {} for {}", hook.name(), ctx.obj_path);
        Ok(())
    }

    fn invoke_microservice(&self, name: &str, args: &[String]) -> Result<()> {
        if name.contains('/') || name.is_empty() {
            return Err(Error::invalid_input(format!("bad microservice name {name}")));
        }
        let script = self.script_dir.join(name);
        debug!("Running {} {:?}", script.display(), args);
        let output = Command::new(&script).args(args).output().map_err(|e| {
            Error::Policy {
                hook: name.to_string(),
                message: format!("failed to run {}: {e}", script.display()),
            }
        })?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Microservice {} failed: {}", name, stderr.trim());
            Err(Error::Policy {
                hook: name.to_string(),
                message: format!("exit status {}: {}", output.status, stderr.trim()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_noop_engine() {
        let engine = NoopRuleEngine;
        assert!(engine
            .apply_policy(PolicyHook::PostPut, &PolicyContext::new("/z/f"))
            .is_ok());
        assert!(matches!(
            engine.invoke_microservice("msiobjget_http", &[]),
            Err(Error::OperationNotSupported(_))
        ));
    }

    #[test]
    fn test_hook_names() {
        assert_eq!(PolicyHook::PostPut.name(), "acPostProcForPut");
        assert_eq!(PolicyHook::PostReplicate.name(), "acPostProcForRepl");
    }

    #[test]
    fn test_script_engine_runs_script() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let script = dir.path().join("msiobjput_test");
        std::fs::write(&script, "#!/bin/sh\necho \"$1 $2\" > \"$3\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let engine = ScriptRuleEngine::new(dir.path());
        engine
            .invoke_microservice(
                "msiobjput_test",
                &["a".into(), "b".into(), out.display().to_string()],
            )
            .unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "a b");

        let err = engine.invoke_microservice("missing", &[]).unwrap_err();
        assert!(matches!(err, Error::Policy { .. }));
        assert!(engine.invoke_microservice("../x", &[]).is_err());
    }
}
