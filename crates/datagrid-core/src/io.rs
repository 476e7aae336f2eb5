//! Byte I/O on open descriptors

use crate::l1desc::{L1Descriptor, L1Handle};
use crate::open::read_request;
use crate::remote::{encode_seek, unexpected, RemoteReply, RemoteRequest};
use crate::request::DataObjRequest;
use crate::server::Server;
use datagrid_common::{ClientConnection, Error, OperationType, ReplicaInfo, Result};
use std::io::{self, Read, SeekFrom, Write};
use tracing::{debug, warn};

impl Server {
    pub(crate) fn desc_read(
        &self,
        comm: &ClientConnection,
        desc: &mut L1Descriptor,
        buf: &mut [u8],
    ) -> Result<usize> {
        let Some(remote) = &desc.remote else {
            return self.tree.file_read(comm, &mut desc.object, buf);
        };
        let request = RemoteRequest::Read {
            fd: remote.remote_fd,
            len: buf.len(),
        };
        match self.remote.forward(&remote.host, request)? {
            RemoteReply::Data(data) if data.len() <= buf.len() => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            other => Err(unexpected(&remote.host, "read", &other)),
        }
    }

    pub(crate) fn desc_write(
        &self,
        comm: &ClientConnection,
        desc: &mut L1Descriptor,
        buf: &[u8],
    ) -> Result<usize> {
        let written = match &desc.remote {
            None => self.tree.file_write(comm, &mut desc.object, buf)?,
            Some(remote) => {
                let request = RemoteRequest::Write {
                    fd: remote.remote_fd,
                    data: buf.to_vec(),
                };
                match self.remote.forward(&remote.host, request)? {
                    RemoteReply::Count(n) => usize::try_from(n)
                        .map_err(|_| Error::internal(format!("remote wrote {n} bytes")))?,
                    other => return Err(unexpected(&remote.host, "write", &other)),
                }
            }
        };
        desc.bytes_written += written as u64;
        desc.wrote = true;
        Ok(written)
    }

    /// Read from an open descriptor; 0 means end of file
    pub fn read(&self, comm: &ClientConnection, handle: L1Handle, buf: &mut [u8]) -> Result<usize> {
        let shared = self.descriptors.get(handle)?;
        let mut desc = shared.lock();
        self.desc_read(comm, &mut desc, buf)
    }

    /// Write to a descriptor opened for writing
    pub fn write(&self, comm: &ClientConnection, handle: L1Handle, buf: &[u8]) -> Result<usize> {
        let shared = self.descriptors.get(handle)?;
        let mut desc = shared.lock();
        if !desc.request.flags.is_write() && !desc.op_type.is_destination() {
            return Err(Error::InvalidDescriptor(format!(
                "descriptor {handle} for {} is open read-only",
                desc.request.obj_path
            )));
        }
        self.desc_write(comm, &mut desc, buf)
    }

    /// Reposition an open descriptor
    pub fn lseek(&self, comm: &ClientConnection, handle: L1Handle, pos: SeekFrom) -> Result<u64> {
        let shared = self.descriptors.get(handle)?;
        let mut desc = shared.lock();
        let Some(remote) = &desc.remote else {
            return self.tree.file_lseek(comm, &mut desc.object, pos);
        };
        let (offset, whence) = encode_seek(pos);
        let request = RemoteRequest::Lseek {
            fd: remote.remote_fd,
            offset,
            whence,
        };
        match self.remote.forward(&remote.host, request)? {
            RemoteReply::Count(n) => Ok(n),
            other => Err(unexpected(&remote.host, "lseek", &other)),
        }
    }

    /// Create or overwrite an object with the bytes of `source`
    pub fn put(
        &self,
        comm: &ClientConnection,
        req: DataObjRequest,
        source: &mut dyn Read,
    ) -> Result<ReplicaInfo> {
        let handle = self.create_with(comm, req, OperationType::Put)?;
        let mut buf = vec![0u8; self.config.transfer.buffer_size.max(1)];
        let copied = loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(Error::Io(e)),
            };
            if let Err(e) = self.write(comm, handle, &buf[..n]) {
                break Err(e);
            }
        };
        if let Err(e) = copied {
            warn!("Put to descriptor {} failed, nothing registered: {}", handle, e);
            self.abort(comm, handle);
            return Err(e);
        }
        self.close(comm, handle)
    }

    /// Stream an object's bytes into `sink`
    pub fn get(
        &self,
        comm: &ClientConnection,
        req: DataObjRequest,
        sink: &mut dyn Write,
    ) -> Result<u64> {
        let mut req = req;
        req.flags = read_request(&req.obj_path).flags;
        let handle = self.open_with(comm, req, OperationType::Get)?;
        let mut buf = vec![0u8; self.config.transfer.buffer_size.max(1)];
        let mut total = 0u64;
        let copied = loop {
            match self.read(comm, handle, &mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    if let Err(e) = sink.write_all(&buf[..n]) {
                        break Err(Error::Io(e));
                    }
                    total += n as u64;
                }
                Err(e) => break Err(e),
            }
        };
        let closed = self.close(comm, handle);
        copied?;
        closed?;
        debug!("Get of descriptor {} returned {} bytes", handle, total);
        Ok(total)
    }
}
