//! POSIX vault backend
//!
//! Stores replicas as plain files under the resource's vault directory.
//! Physical paths handed in relative to the vault are made absolute on the
//! object before any system call.

use crate::backend::{require_no_children, DirEntry, FileStat, ResourceBackend};
use crate::context::PluginContext;
use crate::object::ObjectRef;
use crate::path::{generate_full_path, mkdir_for_file_path};
use crate::redirect::{vote_for_create, vote_for_open, VOTE_NONE};
use crate::tree::ResourceNode;
use datagrid_common::{Error, FileOp, HierarchyParser, Operation, Result};
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, error, warn};

/// Property giving the mode of directories created inside the vault (octal)
pub const DIR_MODE_PROP: &str = "default_vault_directory_mode";
/// Property reserving space on the vault; creates that would eat into it are refused
pub const MIN_FREE_SPACE_PROP: &str = "minimum_free_space_for_create_in_bytes";
/// Property overriding the measured free space, in bytes
pub const FREE_SPACE_PROP: &str = "freespace";

pub const DEFAULT_DIR_MODE: u32 = 0o750;
pub const DEFAULT_FILE_MODE: u32 = 0o600;

/// Holds `/dev/null` on descriptor 0 once a vault file was handed stdin's slot
static STDIN_PLACEHOLDER: OnceLock<File> = OnceLock::new();

pub struct UnixFileSystem;

impl UnixFileSystem {
    pub const TYPE_NAME: &'static str = "unixfilesystem";
}

fn log_io(op: FileOp, resource: &str, path: &str, source: io::Error) -> Error {
    error!("{} of {} on resource {} failed: {}", op, path, resource, source);
    Error::io(op, resource, path, source)
}

/// Make the object's physical path absolute under the vault and return it
fn check_params_and_path(ctx: &mut PluginContext<'_>) -> Result<String> {
    let vault = ctx.resource().vault_path();
    let full = generate_full_path(vault, ctx.object.physical_path())?;
    if full != ctx.object.physical_path() {
        ctx.object.set_physical_path(full.clone());
    }
    Ok(full)
}

fn dir_mode(node: &ResourceNode) -> u32 {
    node.property(DIR_MODE_PROP)
        .and_then(|m| u32::from_str_radix(m.trim_start_matches("0o"), 8).ok())
        .unwrap_or(DEFAULT_DIR_MODE)
}

const fn file_mode(mode: u32) -> u32 {
    if mode == 0 { DEFAULT_FILE_MODE } else { mode }
}

/// Never keep a vault file on descriptor 0
///
/// If stdin was closed, the first open lands on descriptor 0 and a later
/// close of "stdin" would silently close the replica. Park `/dev/null` there
/// and open the file again.
// TODO: drop once no deployment runs the server with stdin closed
fn avoid_stdin_descriptor(
    file: File,
    reopen: impl FnOnce() -> io::Result<File>,
) -> io::Result<File> {
    if file.as_raw_fd() != 0 {
        return Ok(file);
    }
    warn!("Physical open returned descriptor 0, reserving it and reopening");
    drop(file);
    let null = File::open("/dev/null")?;
    if let Err(null) = STDIN_PLACEHOLDER.set(null) {
        std::mem::forget(null);
    }
    reopen()
}

fn with_handle<T>(
    ctx: &mut PluginContext<'_>,
    op: FileOp,
    f: impl FnOnce(&mut File) -> io::Result<T>,
) -> Result<T> {
    let resource = ctx.name();
    let file = ctx.object.as_file_mut()?;
    let handle = file.handle.as_mut().ok_or_else(|| {
        Error::InvalidDescriptor(format!("{} is not open", file.physical_path))
    })?;
    f(handle).map_err(|e| log_io(op, resource, &file.physical_path, e))
}

/// Copy `src` to `dst`, checking every byte of the source arrived
fn copy_file(resource: &str, src: &str, dst: &str, dir_mode: u32, mode: u32) -> Result<u64> {
    let mut input = File::open(src).map_err(|e| log_io(FileOp::Open, resource, src, e))?;
    let expected = input
        .metadata()
        .map_err(|e| log_io(FileOp::Stat, resource, src, e))?
        .len();
    mkdir_for_file_path(dst, dir_mode).map_err(|e| log_io(FileOp::Mkdir, resource, dst, e))?;
    let mut output = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(dst)
        .map_err(|e| log_io(FileOp::Create, resource, dst, e))?;
    let copied =
        io::copy(&mut input, &mut output).map_err(|e| log_io(FileOp::Write, resource, dst, e))?;
    if copied != expected {
        error!(
            "Copy of {} to {} on resource {}: {} of {} bytes",
            src, dst, resource, copied, expected
        );
        return Err(Error::CopyLength {
            path: dst.to_string(),
            expected,
            actual: copied,
        });
    }
    debug!("Copied {} bytes from {} to {}", copied, src, dst);
    Ok(copied)
}

/// Free bytes on the filesystem holding `path`, walking up to the nearest existing directory
fn statvfs_free(path: &str) -> io::Result<u64> {
    let mut existing = Path::new(path);
    while !existing.exists() {
        existing = existing.parent().unwrap_or_else(|| Path::new("/"));
    }
    let stat = nix::sys::statvfs::statvfs(existing).map_err(io::Error::from)?;
    #[allow(clippy::useless_conversion)]
    let free = u64::from(stat.blocks_available()).saturating_mul(u64::from(stat.fragment_size()));
    Ok(free)
}

/// True when writing `size` bytes would eat into the reserved free space
fn exceeds_free_space(node: &ResourceNode, size: u64) -> bool {
    let Some(minimum) = node.property(MIN_FREE_SPACE_PROP) else {
        return false;
    };
    let Ok(minimum) = minimum.trim().parse::<u64>() else {
        error!(
            "Invalid {} \"{}\" on resource {}",
            MIN_FREE_SPACE_PROP,
            minimum,
            node.name()
        );
        return true;
    };
    let free = match node.property(FREE_SPACE_PROP) {
        Some(value) => match value.trim().parse::<u64>() {
            Ok(free) => free,
            Err(_) => {
                error!("Invalid free space \"{}\" on resource {}", value, node.name());
                return true;
            }
        },
        None => match statvfs_free(node.vault_path()) {
            Ok(free) => free,
            Err(e) => {
                error!("Cannot measure free space of resource {}: {}", node.name(), e);
                return true;
            }
        },
    };
    free < minimum || free - minimum < size
}

impl ResourceBackend for UnixFileSystem {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn validate_children(&self, node: &ResourceNode) -> Result<()> {
        require_no_children(node)?;
        if node.vault_path().is_empty() {
            return Err(Error::Configuration(format!(
                "unixfilesystem resource {} has no vault path",
                node.name()
            )));
        }
        Ok(())
    }

    fn create(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let path = check_params_and_path(ctx)?;
        let node = ctx.resource();
        let file = ctx.object.as_file_mut()?;
        mkdir_for_file_path(&path, dir_mode(node))
            .map_err(|e| log_io(FileOp::Mkdir, node.name(), &path, e))?;

        let mode = file_mode(file.mode);
        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&path)
            .and_then(|f| {
                avoid_stdin_descriptor(f, || OpenOptions::new().read(true).write(true).open(&path))
            })
            .map_err(|e| log_io(FileOp::Create, node.name(), &path, e))?;
        file.handle = Some(handle);
        debug!("Created {} on resource {}", path, node.name());
        Ok(())
    }

    fn open(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let path = check_params_and_path(ctx)?;
        let node = ctx.resource();
        let file = ctx.object.as_file_mut()?;
        let mode = file_mode(file.mode);
        let flags = file.flags;

        let mut options = OpenOptions::new();
        options
            .read(true)
            .write(flags.write || flags.truncate)
            .truncate(flags.truncate);
        if flags.create {
            options.write(true).create(true).mode(mode);
            mkdir_for_file_path(&path, dir_mode(node))
                .map_err(|e| log_io(FileOp::Mkdir, node.name(), &path, e))?;
        }
        let reopen = {
            let mut again = OpenOptions::new();
            again.read(true).write(flags.is_write());
            again
        };
        let handle = options
            .open(&path)
            .and_then(|f| avoid_stdin_descriptor(f, || reopen.open(&path)))
            .map_err(|e| log_io(FileOp::Open, node.name(), &path, e))?;
        file.handle = Some(handle);
        Ok(())
    }

    fn read(&self, ctx: &mut PluginContext<'_>, buf: &mut [u8]) -> Result<usize> {
        with_handle(ctx, FileOp::Read, |h| h.read(buf))
    }

    fn write(&self, ctx: &mut PluginContext<'_>, buf: &[u8]) -> Result<usize> {
        with_handle(ctx, FileOp::Write, |h| h.write_all(buf).map(|()| buf.len()))
    }

    fn close(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let file = ctx.object.as_file_mut()?;
        match file.handle.take() {
            Some(handle) => {
                drop(handle);
                Ok(())
            }
            None => Err(Error::InvalidDescriptor(format!(
                "{} is not open",
                file.physical_path
            ))),
        }
    }

    fn unlink(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let path = check_params_and_path(ctx)?;
        fs::remove_file(&path).map_err(|e| log_io(FileOp::Unlink, ctx.name(), &path, e))
    }

    fn stat(&self, ctx: &mut PluginContext<'_>) -> Result<FileStat> {
        let path = check_params_and_path(ctx)?;
        // callers log stat failures with their own context
        let meta =
            fs::metadata(&path).map_err(|e| Error::io(FileOp::Stat, ctx.name(), &path, e))?;
        Ok(FileStat {
            size: meta.len(),
            mode: meta.mode(),
            is_dir: meta.is_dir(),
            nlink: meta.nlink(),
            mtime: meta.mtime(),
        })
    }

    fn lseek(&self, ctx: &mut PluginContext<'_>, pos: SeekFrom) -> Result<u64> {
        with_handle(ctx, FileOp::Lseek, |h| h.seek(pos))
    }

    fn mkdir(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let path = check_params_and_path(ctx)?;
        let mode = match ctx.object.mode() {
            0 => dir_mode(ctx.resource()),
            mode => mode,
        };
        DirBuilder::new()
            .mode(mode)
            .create(&path)
            .map_err(|e| log_io(FileOp::Mkdir, ctx.name(), &path, e))
    }

    fn rmdir(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let path = check_params_and_path(ctx)?;
        fs::remove_dir(&path).map_err(|e| log_io(FileOp::Rmdir, ctx.name(), &path, e))
    }

    fn opendir(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let path = check_params_and_path(ctx)?;
        let resource = ctx.name();
        let coll = ctx.object.as_collection_mut()?;
        coll.cursor =
            Some(fs::read_dir(&path).map_err(|e| log_io(FileOp::Opendir, resource, &path, e))?);
        Ok(())
    }

    fn readdir(&self, ctx: &mut PluginContext<'_>) -> Result<Option<DirEntry>> {
        let resource = ctx.name();
        let coll = ctx.object.as_collection_mut()?;
        let cursor = coll.cursor.as_mut().ok_or_else(|| {
            Error::InvalidDescriptor(format!("{} is not open", coll.physical_path))
        })?;
        match cursor.next() {
            None => Ok(None),
            Some(Ok(entry)) => Ok(Some(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
            })),
            Some(Err(e)) => Err(log_io(FileOp::Readdir, resource, &coll.physical_path, e)),
        }
    }

    fn closedir(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let coll = ctx.object.as_collection_mut()?;
        coll.cursor.take().map(drop).ok_or_else(|| {
            Error::InvalidDescriptor(format!("{} is not open", coll.physical_path))
        })
    }

    fn rename(&self, ctx: &mut PluginContext<'_>, new_path: &str) -> Result<()> {
        let path = check_params_and_path(ctx)?;
        let node = ctx.resource();
        let target = generate_full_path(node.vault_path(), new_path)?;
        mkdir_for_file_path(&target, dir_mode(node))
            .map_err(|e| log_io(FileOp::Mkdir, node.name(), &target, e))?;
        fs::rename(&path, &target).map_err(|e| log_io(FileOp::Rename, node.name(), &path, e))?;
        debug!("Renamed {} to {} on resource {}", path, target, node.name());
        Ok(())
    }

    fn truncate(&self, ctx: &mut PluginContext<'_>) -> Result<()> {
        let path = check_params_and_path(ctx)?;
        let size = ctx.object.size();
        let len = i64::try_from(size)
            .map_err(|_| Error::invalid_input(format!("truncate length {size} out of range")))?;
        nix::unistd::truncate(path.as_str(), len)
            .map_err(|e| log_io(FileOp::Truncate, ctx.name(), &path, io::Error::from(e)))
    }

    fn freespace(&self, ctx: &mut PluginContext<'_>) -> Result<u64> {
        let node = ctx.resource();
        statvfs_free(node.vault_path())
            .map_err(|e| log_io(FileOp::Freespace, node.name(), node.vault_path(), e))
    }

    fn stage_to_cache(&self, ctx: &mut PluginContext<'_>, cache_path: &str) -> Result<()> {
        let path = check_params_and_path(ctx)?;
        let node = ctx.resource();
        copy_file(
            node.name(),
            &path,
            cache_path,
            dir_mode(node),
            file_mode(ctx.object.mode()),
        )
        .map(|_| ())
    }

    fn sync_to_arch(&self, ctx: &mut PluginContext<'_>, cache_path: &str) -> Result<()> {
        let path = check_params_and_path(ctx)?;
        let node = ctx.resource();
        copy_file(
            node.name(),
            cache_path,
            &path,
            dir_mode(node),
            file_mode(ctx.object.mode()),
        )
        .map(|_| ())
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
        let ObjectRef::File(file) = &*ctx.object else {
            return Ok(VOTE_NONE);
        };
        match op {
            Operation::Create => {
                if exceeds_free_space(node, file.size) {
                    warn!(
                        "Resource {} refuses create of {} ({} bytes): below free space reserve",
                        node.name(),
                        file.logical_path,
                        file.size
                    );
                    return Err(Error::FileTooLarge {
                        resource: node.name().to_string(),
                        size: file.size,
                    });
                }
                vote_for_create(node, host)
            }
            Operation::Open | Operation::Write => Ok(vote_for_open(node, file, host)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{CollectionObject, DataObject, FileObject};
    use crate::registry::ResourceTreeBuilder;
    use crate::tree::ResourceTree;
    use datagrid_common::config::ResourceConfig;
    use datagrid_common::{ClientConnection, OpenFlags};

    fn tree(vault: &Path) -> ResourceTree {
        ResourceTreeBuilder::new()
            .resource(
                ResourceConfig::new("disk", "unixfilesystem")
                    .with_vault(vault.to_string_lossy()),
            )
            .build()
            .unwrap()
    }

    fn comm() -> ClientConnection {
        ClientConnection::new("localhost", "alice", "tempZone")
    }

    #[test]
    fn test_create_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let tree = tree(dir.path());
        let comm = comm();

        let mut obj = ObjectRef::from(FileObject::new("/tempZone/home/alice/f", "home/alice/f", "disk"));
        tree.file_create(&comm, &mut obj).unwrap();
        let full = dir.path().join("home/alice/f");
        assert_eq!(obj.physical_path(), full.to_string_lossy());
        assert_eq!(tree.file_write(&comm, &mut obj, b"hello world").unwrap(), 11);
        tree.file_close(&comm, &mut obj).unwrap();
        assert!(tree.file_close(&comm, &mut obj).is_err());

        obj.as_file_mut().unwrap().flags = OpenFlags::READ;
        tree.file_open(&comm, &mut obj).unwrap();
        tree.file_lseek(&comm, &mut obj, SeekFrom::Start(6)).unwrap();
        let mut buf = [0u8; 16];
        let n = tree.file_read(&comm, &mut obj, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
        tree.file_close(&comm, &mut obj).unwrap();

        let stat = tree.file_stat(&comm, &mut obj).unwrap();
        assert_eq!(stat.size, 11);
        assert!(!stat.is_dir);
    }

    #[test]
    fn test_create_existing_reports_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("taken"), b"x").unwrap();
        let tree = tree(dir.path());
        let mut obj = ObjectRef::from(FileObject::new("/tempZone/taken", "taken", "disk"));
        let err = tree.file_create(&comm(), &mut obj).unwrap_err();
        assert!(err.is_already_exists());
        assert!(err.status_code() < 0);
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let tree = tree(dir.path());
        let mut obj = ObjectRef::from(FileObject::new("/tempZone/nope", "nope", "disk"));
        let err = tree.file_open(&comm(), &mut obj).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_rename_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"abc").unwrap();
        let tree = tree(dir.path());
        let mut obj = ObjectRef::from(DataObject::new("a", "disk"));
        tree.file_rename(&comm(), &mut obj, "x/y/b").unwrap();
        assert_eq!(std::fs::read(dir.path().join("x/y/b")).unwrap(), b"abc");
        assert!(!dir.path().join("a").exists());
    }

    #[test]
    fn test_truncate_and_unlink() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t"), b"0123456789").unwrap();
        let tree = tree(dir.path());
        let mut obj = ObjectRef::from(DataObject {
            size: 4,
            ..DataObject::new("t", "disk")
        });
        tree.file_truncate(&comm(), &mut obj).unwrap();
        assert_eq!(std::fs::read(dir.path().join("t")).unwrap(), b"0123");
        tree.file_unlink(&comm(), &mut obj).unwrap();
        assert!(!dir.path().join("t").exists());
    }

    #[test]
    fn test_directory_listing() {
        let dir = tempfile::tempdir().unwrap();
        let tree = tree(dir.path());
        let comm = comm();
        let mut coll = ObjectRef::from(CollectionObject::new("/tempZone/c", "c", "disk"));
        tree.file_mkdir(&comm, &mut coll).unwrap();
        std::fs::write(dir.path().join("c/one"), b"1").unwrap();

        tree.file_opendir(&comm, &mut coll).unwrap();
        let mut names = Vec::new();
        while let Some(entry) = tree.file_readdir(&comm, &mut coll).unwrap() {
            names.push(entry.name);
        }
        tree.file_closedir(&comm, &mut coll).unwrap();
        assert_eq!(names, vec!["one"]);

        std::fs::remove_file(dir.path().join("c/one")).unwrap();
        tree.file_rmdir(&comm, &mut coll).unwrap();
        assert!(!dir.path().join("c").exists());
    }

    #[test]
    fn test_stage_and_sync_copy_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("arch"), b"archived bytes").unwrap();
        let tree = tree(dir.path());
        let comm = comm();
        let cache = dir.path().join("cache/dir/f");
        let mut obj = ObjectRef::from(DataObject::new("arch", "disk"));
        tree.file_stage_to_cache(&comm, &mut obj, &cache.to_string_lossy())
            .unwrap();
        assert_eq!(std::fs::read(&cache).unwrap(), b"archived bytes");

        std::fs::write(&cache, b"updated").unwrap();
        tree.file_sync_to_arch(&comm, &mut obj, &cache.to_string_lossy())
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("arch")).unwrap(), b"updated");
    }

    #[test]
    fn test_free_space_reserve_refuses_create() {
        let tree = ResourceTreeBuilder::new()
            .resource(
                ResourceConfig::new("disk", "unixfilesystem")
                    .with_vault("/vault")
                    .with_property(MIN_FREE_SPACE_PROP, "1000")
                    .with_property(FREE_SPACE_PROP, "1500"),
            )
            .build()
            .unwrap();
        let node = tree.get("disk").unwrap();
        assert!(!exceeds_free_space(node, 500));
        assert!(exceeds_free_space(node, 501));

        let mut file = FileObject::for_vote("/tempZone/f", &[], None);
        file.size = 4096;
        let mut obj = ObjectRef::File(file);
        let mut parser = HierarchyParser::new();
        let err = tree
            .resolve_from(
                tree.id_of("disk").unwrap(),
                &comm(),
                Operation::Create,
                &mut obj,
                &mut parser,
            )
            .unwrap_err();
        assert!(matches!(err, Error::FileTooLarge { size: 4096, .. }));
    }

    #[test]
    fn test_invalid_reserve_refuses() {
        let tree = ResourceTreeBuilder::new()
            .resource(
                ResourceConfig::new("disk", "unixfilesystem")
                    .with_vault("/vault")
                    .with_property(MIN_FREE_SPACE_PROP, "-5"),
            )
            .build()
            .unwrap();
        assert!(exceeds_free_space(tree.get("disk").unwrap(), 0));
    }

    #[test]
    fn test_dir_mode_property() {
        let tree = ResourceTreeBuilder::new()
            .resource(
                ResourceConfig::new("disk", "unixfilesystem")
                    .with_vault("/vault")
                    .with_property(DIR_MODE_PROP, "0700"),
            )
            .resource(ResourceConfig::new("plain", "unixfilesystem").with_vault("/v2"))
            .build()
            .unwrap();
        assert_eq!(dir_mode(tree.get("disk").unwrap()), 0o700);
        assert_eq!(dir_mode(tree.get("plain").unwrap()), DEFAULT_DIR_MODE);
    }

    #[test]
    fn test_vault_required() {
        let err = ResourceTreeBuilder::new()
            .resource(ResourceConfig::new("disk", "unixfilesystem"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
