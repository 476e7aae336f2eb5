//! DataGrid Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, replica and resource types,
//! the resource hierarchy parser, checksum streaming, configuration and
//! the policy-hook contract used across all DataGrid components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod props;
pub mod rules;
pub mod types;

pub use checksum::{ChecksumAlgorithm, ChecksumCalculator};
pub use config::ServerConfig;
pub use error::{Error, ErrorKind, FileOp, Result, ResultExt};
pub use hierarchy::HierarchyParser;
pub use props::{MemoryPropertyStore, ResourcePropertyStore};
pub use rules::{NoopRuleEngine, PolicyContext, PolicyHook, RuleEngine, ScriptRuleEngine};
pub use types::*;
