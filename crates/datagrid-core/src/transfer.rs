//! Byte transfer between an open source and destination descriptor
//!
//! Mass-storage replicas never serve byte I/O, so a source or destination
//! on one moves through the resource's stage/sync calls instead. Anything
//! else is copied through the descriptors: in one buffer for small
//! objects, as a single stream when either side is remote, or split into
//! ranges over worker threads when both sides are local.

use crate::l1desc::{L1Descriptor, L1Handle};
use crate::server::Server;
use crossbeam_channel::{unbounded, Receiver};
use datagrid_common::{ClientConnection, Error, OpenFlags, Result, StagingMode};
use datagrid_resource::mso::MassStorageScript;
use datagrid_resource::{DataObject, FileObject, ObjectRef};
use std::io::SeekFrom;
use std::ops::Range;
use tracing::{debug, info};

/// How the bytes of one copy move
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Strategy {
    /// Source is on a mass-storage resource and is staged into place
    StageFromArchive,
    /// Destination is on a mass-storage resource and is synced out
    SyncToArchive,
    SingleBuffer,
    Streamed(Route),
    Parallel(usize),
}

/// Which ends of a streamed copy live on this host
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Route {
    Local,
    LocalToRemote,
    RemoteToLocal,
    RemoteToRemote,
}

impl Route {
    const fn of(src: &L1Descriptor, dest: &L1Descriptor) -> Self {
        match (src.remote.is_some(), dest.remote.is_some()) {
            (false, false) => Self::Local,
            (false, true) => Self::LocalToRemote,
            (true, false) => Self::RemoteToLocal,
            (true, true) => Self::RemoteToRemote,
        }
    }
}

/// Split `0..size` into at most `parts` ranges of at least `min_len` bytes
fn split_ranges(size: u64, parts: usize, min_len: u64) -> Vec<Range<u64>> {
    if size == 0 {
        return Vec::new();
    }
    let parts = (parts.max(1) as u64).min(size.div_ceil(min_len.max(1))).max(1);
    let step = size.div_ceil(parts);
    (0..parts)
        .map(|i| i * step..((i + 1) * step).min(size))
        .filter(|r| !r.is_empty())
        .collect()
}

impl Server {
    pub(crate) fn on_mass_storage(&self, hier: &str) -> Result<bool> {
        Ok(self.tree.leaf_of_hier(hier)?.type_name() == MassStorageScript::TYPE_NAME)
    }

    pub(crate) fn choose_strategy(
        &self,
        src: &L1Descriptor,
        dest: &L1Descriptor,
        threads: Option<usize>,
    ) -> Result<Strategy> {
        if src.remote.is_none() && self.on_mass_storage(&src.replica.resc_hier)? {
            return Ok(Strategy::StageFromArchive);
        }
        if dest.remote.is_none() && self.on_mass_storage(dest.object.resc_hier())? {
            return Ok(Strategy::SyncToArchive);
        }
        let route = Route::of(src, dest);
        let size = src.replica.size;
        let transfer = &self.config.transfer;
        if size <= transfer.single_buffer_threshold && threads.unwrap_or(0) <= 1 {
            return Ok(Strategy::SingleBuffer);
        }
        let threads = threads
            .unwrap_or(transfer.default_threads)
            .min(transfer.max_threads);
        if route == Route::Local && threads > 1 && size > transfer.min_range_size {
            Ok(Strategy::Parallel(threads))
        } else {
            Ok(Strategy::Streamed(route))
        }
    }

    /// Move every byte of `src` into `dest`; returns the bytes moved
    pub(crate) fn transfer(
        &self,
        comm: &ClientConnection,
        src: L1Handle,
        dest: L1Handle,
        threads: Option<usize>,
    ) -> Result<u64> {
        let src_shared = self.descriptors.get(src)?;
        let dest_shared = self.descriptors.get(dest)?;
        let mut src = src_shared.lock();
        let mut dest = dest_shared.lock();

        let strategy = self.choose_strategy(&src, &dest, threads)?;
        debug!(
            "Copying {} bytes of {} from \"{}\" to \"{}\" with {:?}",
            src.replica.size,
            src.replica.obj_path,
            src.replica.resc_hier,
            dest.object.resc_hier(),
            strategy
        );
        let moved = match strategy {
            Strategy::StageFromArchive => {
                let target = dest.object.physical_path().to_string();
                self.tree
                    .file_stage_to_cache(comm, &mut Self::data_object(&src.replica), &target)?;
                dest.staging = StagingMode::StageSrc;
                dest.wrote = true;
                let mut stat_ref =
                    ObjectRef::Data(DataObject::new(target, dest.object.resc_hier()));
                self.physical_size(comm, &mut stat_ref)?
            }
            Strategy::SyncToArchive => {
                let cache_path = src.replica.phy_path.clone();
                self.tree
                    .file_sync_to_arch(comm, &mut dest.object, &cache_path)?;
                dest.staging = StagingMode::SyncDest;
                dest.wrote = true;
                dest.size_override = Some(src.replica.size);
                src.replica.size
            }
            Strategy::SingleBuffer => self.copy_single_buffer(comm, &mut src, &mut dest)?,
            Strategy::Streamed(_) => self.copy_streamed(comm, &mut src, &mut dest)?,
            Strategy::Parallel(threads) => self.copy_parallel(comm, &src, &mut dest, threads)?,
        };
        dest.bytes_written = dest.bytes_written.max(moved);
        Ok(moved)
    }

    fn copy_single_buffer(
        &self,
        comm: &ClientConnection,
        src: &mut L1Descriptor,
        dest: &mut L1Descriptor,
    ) -> Result<u64> {
        let size = usize::try_from(src.replica.size)
            .map_err(|_| Error::internal("object too large for one buffer"))?;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = self.desc_read(comm, src, &mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled > 0 {
            self.desc_write(comm, dest, &buf[..filled])?;
        } else {
            dest.wrote = true;
        }
        Ok(filled as u64)
    }

    fn copy_streamed(
        &self,
        comm: &ClientConnection,
        src: &mut L1Descriptor,
        dest: &mut L1Descriptor,
    ) -> Result<u64> {
        let mut buf = vec![0u8; self.config.transfer.buffer_size.max(1)];
        let mut total = 0u64;
        loop {
            let n = self.desc_read(comm, src, &mut buf)?;
            if n == 0 {
                break;
            }
            self.desc_write(comm, dest, &buf[..n])?;
            total += n as u64;
        }
        dest.wrote = true;
        Ok(total)
    }

    fn copy_parallel(
        &self,
        comm: &ClientConnection,
        src: &L1Descriptor,
        dest: &mut L1Descriptor,
        threads: usize,
    ) -> Result<u64> {
        let ranges = split_ranges(
            src.replica.size,
            threads,
            self.config.transfer.min_range_size,
        );
        let workers = ranges.len();
        let (tx, rx) = unbounded();
        for range in ranges {
            tx.send(range)
                .map_err(|_| Error::internal("transfer range queue closed"))?;
        }
        drop(tx);

        let dest_path = dest.object.physical_path().to_string();
        let dest_hier = dest.object.resc_hier().to_string();
        let results: Vec<Result<u64>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let rx = rx.clone();
                    let dest_path = dest_path.as_str();
                    let dest_hier = dest_hier.as_str();
                    s.spawn(move || self.copy_ranges(comm, src, dest_path, dest_hier, &rx))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(Error::internal("transfer worker panicked")))
                })
                .collect()
        });

        let mut total = 0;
        for result in results {
            total += result?;
        }
        dest.bytes_written += total;
        dest.wrote = true;
        info!(
            "Copied {} bytes of {} with {} workers",
            total, src.replica.obj_path, workers
        );
        Ok(total)
    }

    /// Worker loop: copy ranges from the queue through private handles
    fn copy_ranges(
        &self,
        comm: &ClientConnection,
        src: &L1Descriptor,
        dest_path: &str,
        dest_hier: &str,
        ranges: &Receiver<Range<u64>>,
    ) -> Result<u64> {
        let mut input = FileObject::from_replica(&src.replica);
        input.flags = OpenFlags::READ;
        let mut input = ObjectRef::File(input);
        let mut output = FileObject::new(&src.replica.obj_path, dest_path, dest_hier);
        output.flags = OpenFlags::WRITE;
        let mut output = ObjectRef::File(output);

        self.tree.file_open(comm, &mut input)?;
        if let Err(e) = self.tree.file_open(comm, &mut output) {
            let _ = self.tree.file_close(comm, &mut input);
            return Err(e);
        }
        let copied = self.copy_queue(comm, &mut input, &mut output, ranges);
        let closed_in = self.tree.file_close(comm, &mut input);
        let closed_out = self.tree.file_close(comm, &mut output);
        let copied = copied?;
        closed_in?;
        closed_out?;
        Ok(copied)
    }

    fn copy_queue(
        &self,
        comm: &ClientConnection,
        input: &mut ObjectRef,
        output: &mut ObjectRef,
        ranges: &Receiver<Range<u64>>,
    ) -> Result<u64> {
        let mut buf = vec![0u8; self.config.transfer.buffer_size.max(1)];
        let mut total = 0;
        for range in ranges {
            self.tree.file_lseek(comm, input, SeekFrom::Start(range.start))?;
            self.tree.file_lseek(comm, output, SeekFrom::Start(range.start))?;
            let mut left = range.end - range.start;
            while left > 0 {
                let want = usize::try_from(left).map_or(buf.len(), |l| l.min(buf.len()));
                let n = self.tree.file_read(comm, input, &mut buf[..want])?;
                if n == 0 {
                    return Err(Error::CopyLength {
                        path: input.physical_path().to_string(),
                        expected: range.end,
                        actual: range.end - left,
                    });
                }
                self.tree.file_write(comm, output, &buf[..n])?;
                left -= n as u64;
                total += n as u64;
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::DataObjRequest;
    use crate::testutil::{comm, put_bytes, two_resources};
    use std::fs;

    #[test]
    fn test_split_ranges() {
        assert!(split_ranges(0, 4, 1).is_empty());
        assert_eq!(split_ranges(10, 1, 1), vec![0..10]);
        assert_eq!(split_ranges(10, 3, 1), vec![0..4, 4..8, 8..10]);
        // never smaller than the minimum range
        assert_eq!(split_ranges(10, 8, 5), vec![0..5, 5..10]);
    }

    #[test]
    fn test_parallel_replicate_copies_every_byte() {
        let (_dir, server) = two_resources();
        let data: Vec<u8> = (0..300_000u32).map(|i| (i * 7 % 253) as u8).collect();
        put_bytes(&server, "/tempZone/home/u/big", "disk1", &data);
        let outcome = server
            .replicate(
                &comm(),
                DataObjRequest::new("/tempZone/home/u/big")
                    .with_resource("disk2")
                    .with_threads(3),
            )
            .unwrap();
        assert_eq!(outcome.bytes_transferred, data.len() as u64);
        let copy = &outcome.replicas[0];
        assert_eq!(fs::read(&copy.phy_path).unwrap(), data);
    }

    #[test]
    fn test_single_stream_when_threads_zero() {
        let (_dir, server) = two_resources();
        put_bytes(&server, "/tempZone/home/u/s", "disk1", b"streamed");
        let outcome = server
            .replicate(
                &comm(),
                DataObjRequest::new("/tempZone/home/u/s")
                    .with_resource("disk2")
                    .with_threads(0),
            )
            .unwrap();
        assert_eq!(outcome.bytes_transferred, 8);
    }
}
