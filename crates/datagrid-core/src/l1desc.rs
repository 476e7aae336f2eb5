//! L1 descriptor table
//!
//! One slot per open logical operation, shared by every connection served
//! by this process. Allocation and release are serialized by the table
//! lock; a descriptor's own fields sit behind a per-slot mutex that only
//! the owning connection takes. Handles carry the slot generation so a
//! released index can never be reached through a stale handle.

use crate::request::DataObjRequest;
use datagrid_common::{Error, OperationType, ReplicaInfo, Result, StagingMode};
use datagrid_resource::ObjectRef;
use derive_more::Display;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Indices below this are never handed out
pub const FIRST_USABLE_INDEX: usize = 3;

/// Opaque reference to an allocated descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[display("{index}.{generation}")]
pub struct L1Handle {
    index: u32,
    generation: u32,
}

impl L1Handle {
    /// Slot index, for log lines and remote replies
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }
}

/// Descriptor of an operation served by another server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteDescriptor {
    pub host: String,
    pub remote_fd: i32,
}

/// State of one open logical operation
#[derive(Debug)]
pub struct L1Descriptor {
    pub op_type: OperationType,
    pub request: DataObjRequest,
    /// Replica being read or written; `repl_num` is -1 until registered
    pub replica: ReplicaInfo,
    /// Physical object, holding the open file handle
    pub object: ObjectRef,
    pub staging: StagingMode,
    pub bytes_written: u64,
    pub wrote: bool,
    /// Source side of a replicate, copy or phymv
    pub src: Option<L1Handle>,
    /// Root resources still owed a copy by a multi-copy create
    pub pending_targets: Vec<String>,
    /// Good copies a multi-copy create must end with, this one included
    pub copies_required: usize,
    /// The catalog row is registered at close rather than at open
    pub register_at_close: bool,
    /// The replica held data before this operation
    pub replica_existed: bool,
    /// Verified checksum of the source a destination must match
    pub source_checksum: Option<String>,
    /// Size registered regardless of the physical size
    pub size_override: Option<u64>,
    pub remote: Option<RemoteDescriptor>,
}

impl L1Descriptor {
    #[must_use]
    pub fn new(op_type: OperationType, request: DataObjRequest, replica: ReplicaInfo, object: ObjectRef) -> Self {
        Self {
            op_type,
            request,
            replica,
            object,
            staging: StagingMode::NoStaging,
            bytes_written: 0,
            wrote: false,
            src: None,
            pending_targets: Vec::new(),
            copies_required: 1,
            register_at_close: false,
            replica_existed: false,
            source_checksum: None,
            size_override: None,
            remote: None,
        }
    }
}

pub type SharedDescriptor = Arc<Mutex<L1Descriptor>>;

#[derive(Default)]
struct Slot {
    generation: u32,
    desc: Option<SharedDescriptor>,
}

/// Fixed-capacity descriptor arena
pub struct DescriptorTable {
    slots: Mutex<Vec<Slot>>,
    capacity: usize,
}

impl DescriptorTable {
    /// Table with `capacity` slots, the first few of which are reserved
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(capacity.max(FIRST_USABLE_INDEX + 1), Slot::default);
        Self {
            capacity: slots.len(),
            slots: Mutex::new(slots),
        }
    }

    /// Store `desc` in a free slot
    pub fn allocate(&self, desc: L1Descriptor) -> Result<L1Handle> {
        let mut slots = self.slots.lock();
        let (index, slot) = slots
            .iter_mut()
            .enumerate()
            .skip(FIRST_USABLE_INDEX)
            .find(|(_, slot)| slot.desc.is_none())
            .ok_or(Error::DescriptorsExhausted {
                capacity: self.capacity,
            })?;
        slot.desc = Some(Arc::new(Mutex::new(desc)));
        let handle = L1Handle {
            index: u32::try_from(index).map_err(|_| Error::internal("descriptor index overflow"))?,
            generation: slot.generation,
        };
        debug!("Allocated L1 descriptor {}", handle);
        Ok(handle)
    }

    /// Descriptor behind a live handle
    pub fn get(&self, handle: L1Handle) -> Result<SharedDescriptor> {
        let slots = self.slots.lock();
        slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.desc.clone())
            .ok_or_else(|| Error::InvalidDescriptor(format!("L1 descriptor {handle}")))
    }

    /// Free the slot; the handle and any copy of it become invalid
    pub fn release(&self, handle: L1Handle) -> Result<SharedDescriptor> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.desc.is_some())
            .ok_or_else(|| Error::InvalidDescriptor(format!("L1 descriptor {handle}")))?;
        slot.generation = slot.generation.wrapping_add(1);
        let desc = slot
            .desc
            .take()
            .ok_or_else(|| Error::internal("released slot was empty"))?;
        debug!("Released L1 descriptor {}", handle);
        Ok(desc)
    }

    /// Number of descriptors currently allocated
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.desc.is_some()).count()
    }

    /// Number of descriptors that can be allocated at once
    #[must_use]
    pub const fn usable(&self) -> usize {
        self.capacity - FIRST_USABLE_INDEX
    }
}
