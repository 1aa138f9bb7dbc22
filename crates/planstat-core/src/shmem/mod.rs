//! Bounded pool of shared instrumentation slots.
//!
//! The region is created once, before any backend starts, and shared by all
//! processes of the group through an `Arc<SlotRegion>`:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ HEADER  Mutex<FreeList>                      │
//! │   head: Option<usize>   first free slot      │
//! │   next: [Option<usize>] link per slot        │
//! │   used + free == capacity                    │
//! ├──────────────────────────────────────────────┤
//! │ SLOTS   [Mutex<Slot>; capacity]              │
//! │   generation, owner metadata, Instrumentation│
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The header lock is held only for the O(1) pop/push and counter update.
//! A slot is in use exactly when its record has `in_shmem` set; free slots
//! hold a zeroed record. Every pick and every recycle bumps the slot's
//! generation, so a [`SlotRef`] that outlived its slot is detected and
//! ignored instead of touching someone else's record.
//!
//! Lock order is slot, then header. `pick` drops the header lock before it
//! stamps the slot.

mod provider;

pub use provider::{ShmemArena, ShmemError, ShmemProvider};

use crate::backend::ProcessRole;
use crate::config::InstrumentConfig;
use crate::instrument::{InstrumentOptions, Instrumentation};
use crate::plan::{DISPATCHER_SEGMENT, ExecFlags, NodeId, QueryIdentity, SegmentId};
use parking_lot::Mutex;
use std::fmt;
use std::mem::size_of;
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the slot region in the shared segment.
pub const REGION_NAME: &str = "Instrumentation slots";

/// Fatal error while setting up the slot region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrError {
    /// The shared segment could not provide the region.
    RegionReservation(ShmemError),
    /// The slot array could not be allocated.
    SlotArrayAllocation { slots: usize },
}

impl fmt::Display for InstrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrError::RegionReservation(e) => {
                write!(f, "failed to reserve instrumentation region: {}", e)
            }
            InstrError::SlotArrayAllocation { slots } => {
                write!(f, "failed to allocate {} instrumentation slots", slots)
            }
        }
    }
}

impl std::error::Error for InstrError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InstrError::RegionReservation(e) => Some(e),
            InstrError::SlotArrayAllocation { .. } => None,
        }
    }
}

impl From<ShmemError> for InstrError {
    fn from(e: ShmemError) -> Self {
        InstrError::RegionReservation(e)
    }
}

/// Who owns a slot and which node it measures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotMeta {
    pub pid: u32,
    pub query: QueryIdentity,
    pub segid: SegmentId,
    pub node_id: NodeId,
    pub eflags: ExecFlags,
}

impl Default for SlotMeta {
    fn default() -> Self {
        Self {
            pid: 0,
            query: QueryIdentity::default(),
            segid: DISPATCHER_SEGMENT,
            node_id: 0,
            eflags: ExecFlags::empty(),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    meta: SlotMeta,
    data: Instrumentation,
}

/// Handle to a picked slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotRef {
    index: usize,
    generation: u64,
}

impl SlotRef {
    pub fn index(&self) -> usize {
        self.index
    }
}

#[derive(Debug)]
struct FreeList {
    head: Option<usize>,
    next: Box<[Option<usize>]>,
    used: usize,
    free: usize,
}

/// Counters of the slot pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotUsage {
    pub capacity: usize,
    pub free: usize,
    pub used: usize,
}

/// Bytes needed for the header and `max_shmem_instruments` slots, or zero
/// when this process role does not use shared slots.
pub fn compute_region_size(config: &InstrumentConfig, role: ProcessRole) -> usize {
    if role == ProcessRole::Utility || config.max_shmem_instruments == 0 {
        return 0;
    }
    let per_slot = size_of::<Mutex<Slot>>() + size_of::<Option<usize>>();
    config
        .max_shmem_instruments
        .saturating_mul(per_slot)
        .saturating_add(size_of::<Mutex<FreeList>>())
}

/// Creates the slot region. Runs once, before any backend starts.
///
/// `provider` charges the region's size against the shared-memory budget;
/// the slots are then allocated here.
///
/// Returns `Ok(None)` when the region is disabled for this role or size.
/// Any error is fatal for the process group.
pub fn initialize_region(
    config: &InstrumentConfig,
    role: ProcessRole,
    provider: &mut dyn ShmemProvider,
) -> Result<Option<Arc<SlotRegion>>, InstrError> {
    let size = compute_region_size(config, role);
    if size == 0 {
        debug!(?role, "instrumentation slot region disabled");
        return Ok(None);
    }

    provider.reserve(REGION_NAME, size)?;
    let region = SlotRegion::new(config.max_shmem_instruments)?;

    info!(
        slots = config.max_shmem_instruments,
        bytes = size,
        "instrumentation slot region initialized"
    );
    Ok(Some(Arc::new(region)))
}

/// The shared slot pool.
#[derive(Debug)]
pub struct SlotRegion {
    header: Mutex<FreeList>,
    slots: Box<[Mutex<Slot>]>,
}

impl SlotRegion {
    /// Builds a region with every slot zeroed and linked into the free list.
    pub fn new(capacity: usize) -> Result<Self, InstrError> {
        let alloc_err = || InstrError::SlotArrayAllocation { slots: capacity };

        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity).map_err(|_| alloc_err())?;
        let mut next = Vec::new();
        next.try_reserve_exact(capacity).map_err(|_| alloc_err())?;

        for i in 0..capacity {
            slots.push(Mutex::new(Slot::default()));
            next.push(if i + 1 < capacity { Some(i + 1) } else { None });
        }

        Ok(Self {
            header: Mutex::new(FreeList {
                head: if capacity > 0 { Some(0) } else { None },
                next: next.into_boxed_slice(),
                used: 0,
                free: capacity,
            }),
            slots: slots.into_boxed_slice(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn usage(&self) -> SlotUsage {
        let list = self.header.lock();
        SlotUsage {
            capacity: self.slots.len(),
            free: list.free,
            used: list.used,
        }
    }

    /// Pops a free slot and stamps it with `meta`. `None` when exhausted.
    pub fn pick(&self, meta: SlotMeta, options: InstrumentOptions) -> Option<SlotRef> {
        let index = {
            let mut list = self.header.lock();
            let index = list.head?;
            list.head = list.next[index].take();
            list.free -= 1;
            list.used += 1;
            index
        };

        let mut slot = self.slots[index].lock();
        slot.generation = slot.generation.wrapping_add(1);
        slot.meta = meta;
        slot.data = Instrumentation {
            in_shmem: true,
            ..Instrumentation::new(options)
        };

        Some(SlotRef {
            index,
            generation: slot.generation,
        })
    }

    /// Returns a slot to the pool.
    ///
    /// When the node ran under EXPLAIN ANALYZE a private copy of its record
    /// is returned so the report can still read it. A stale or unknown
    /// handle is ignored.
    pub fn recycle(&self, slot: SlotRef) -> Option<Instrumentation> {
        let cell = self.slots.get(slot.index)?;
        let mut guard = cell.lock();
        if guard.generation != slot.generation || !guard.data.in_shmem {
            debug!(index = slot.index, "recycle of a slot that is no longer ours");
            return None;
        }

        let clone = guard
            .meta
            .eflags
            .contains(ExecFlags::EXPLAIN_ANALYZE)
            .then(|| guard.data.detached_copy());

        self.release_locked(slot.index, &mut guard);
        clone
    }

    /// Releases every in-use slot owned by `pid`. Returns how many were released.
    ///
    /// Allocation free; safe to call from a process-exit path. A second call
    /// for the same pid releases nothing.
    pub fn cleanup_process(&self, pid: u32) -> usize {
        let mut released = 0;
        for (index, cell) in self.slots.iter().enumerate() {
            let mut guard = cell.lock();
            if guard.data.in_shmem && guard.meta.pid == pid {
                self.release_locked(index, &mut guard);
                released += 1;
            }
        }
        if released > 0 {
            debug!(pid, released, "swept instrumentation slots of process");
        }
        released
    }

    /// Runs `f` on the record behind `slot` if the handle is still current.
    pub fn with_instr<R>(
        &self,
        slot: SlotRef,
        f: impl FnOnce(&mut Instrumentation) -> R,
    ) -> Option<R> {
        let mut guard = self.slots.get(slot.index)?.lock();
        if guard.generation != slot.generation || !guard.data.in_shmem {
            return None;
        }
        Some(f(&mut guard.data))
    }

    /// Owner metadata of a current handle.
    pub fn meta(&self, slot: SlotRef) -> Option<SlotMeta> {
        let guard = self.slots.get(slot.index)?.lock();
        (guard.generation == slot.generation && guard.data.in_shmem).then_some(guard.meta)
    }

    /// Number of in-use slots owned by `pid`.
    pub fn owned_by(&self, pid: u32) -> usize {
        self.slots
            .iter()
            .filter(|cell| {
                let guard = cell.lock();
                guard.data.in_shmem && guard.meta.pid == pid
            })
            .count()
    }

    // Wipes the slot, then relinks it at the head of the free list.
    fn release_locked(&self, index: usize, slot: &mut Slot) {
        slot.data = Instrumentation::default();
        slot.meta = SlotMeta::default();
        slot.generation = slot.generation.wrapping_add(1);

        let mut list = self.header.lock();
        list.next[index] = list.head;
        list.head = Some(index);
        list.free += 1;
        list.used -= 1;
    }
}
