//! Vault path helpers
//!
//! Physical paths of replicas mirror the logical namespace under a
//! resource's vault: `/zone/home/u/f` lands at `<vault>/home/u/f`.

use datagrid_common::{Error, Result};
use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

/// Subdirectory of a vault receiving relocated orphan files
pub const ORPHAN_DIR: &str = "orphan";

/// Prepend the vault to a relative physical path
///
/// Paths that are already absolute or already start with the vault are
/// returned unchanged.
pub fn generate_full_path(vault: &str, phy_path: &str) -> Result<String> {
    if vault.is_empty() {
        return Err(Error::invalid_input(format!(
            "resource has no vault path for \"{phy_path}\""
        )));
    }
    if phy_path.is_empty() {
        return Err(Error::invalid_input("physical path is empty"));
    }
    if phy_path.starts_with('/') || phy_path.starts_with(vault) {
        Ok(phy_path.to_string())
    } else {
        Ok(format!("{}/{phy_path}", vault.trim_end_matches('/')))
    }
}

/// Physical path for a logical path on a vault
#[must_use]
pub fn logical_to_physical(vault: &str, obj_path: &str) -> String {
    let relative = obj_path
        .strip_prefix('/')
        .and_then(|rest| rest.split_once('/'))
        .map_or(obj_path.trim_start_matches('/'), |(_zone, rest)| rest);
    format!("{}/{relative}", vault.trim_end_matches('/'))
}

/// Create a directory and any missing parents; existing directories are fine
pub fn mkdir_r(path: impl AsRef<Path>, mode: u32) -> io::Result<()> {
    let path = path.as_ref();
    match DirBuilder::new().recursive(true).mode(mode).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create the parent directories of a file path
pub fn mkdir_for_file_path(file_path: impl AsRef<Path>, mode: u32) -> io::Result<()> {
    match file_path.as_ref().parent() {
        Some(parent) if !parent.as_os_str().is_empty() => mkdir_r(parent, mode),
        _ => Ok(()),
    }
}

/// Location an orphan at `phy_path` is moved to
#[must_use]
pub fn orphan_path(vault: &str, phy_path: &str, suffix: u32) -> String {
    let name = Path::new(phy_path)
        .file_name()
        .map_or_else(|| "orphan".to_string(), |n| n.to_string_lossy().into_owned());
    format!(
        "{}/{ORPHAN_DIR}/{name}.{suffix}",
        vault.trim_end_matches('/')
    )
}
