//! Shared-memory provisioning.
//!
//! The process that sets up shared memory asks a provider for each named
//! region once, before any backend starts. [`ShmemArena`] is a fixed budget
//! that hands out named reservations and refuses anything past its capacity.
//!
//! A reservation is an accounting step only: it enforces the byte budget of
//! the shared segment and fails startup when the budget is exceeded. The
//! region's memory itself is allocated by its owner (see
//! [`SlotRegion::new`](super::SlotRegion::new)) and shared through an `Arc`.

use std::collections::HashMap;
use std::fmt;

/// Error type for shared-memory reservations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShmemError {
    /// Not enough room left in the shared segment.
    OutOfSharedMemory { requested: usize, available: usize },
    /// A region with this name was already handed out.
    AlreadyReserved(String),
}

impl fmt::Display for ShmemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmemError::OutOfSharedMemory {
                requested,
                available,
            } => write!(
                f,
                "out of shared memory: requested {} bytes, {} available",
                requested, available
            ),
            ShmemError::AlreadyReserved(name) => {
                write!(f, "shared memory region '{}' already reserved", name)
            }
        }
    }
}

impl std::error::Error for ShmemError {}

/// Hands out zero-initialized shared regions by name.
pub trait ShmemProvider {
    /// Reserves `size` bytes under `name`.
    fn reserve(&mut self, name: &str, size: usize) -> Result<(), ShmemError>;
}

/// Fixed-capacity shared-memory budget.
#[derive(Debug, Default)]
pub struct ShmemArena {
    capacity: usize,
    allocated: usize,
    segments: HashMap<String, usize>,
}

impl ShmemArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            allocated: 0,
            segments: HashMap::new(),
        }
    }

    /// Arena large enough for anything.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn available(&self) -> usize {
        self.capacity - self.allocated
    }

    /// Size of a named reservation, if present.
    pub fn segment_size(&self, name: &str) -> Option<usize> {
        self.segments.get(name).copied()
    }
}

impl ShmemProvider for ShmemArena {
    fn reserve(&mut self, name: &str, size: usize) -> Result<(), ShmemError> {
        if self.segments.contains_key(name) {
            return Err(ShmemError::AlreadyReserved(name.to_string()));
        }
        let available = self.available();
        if size > available {
            return Err(ShmemError::OutOfSharedMemory {
                requested: size,
                available,
            });
        }
        self.allocated += size;
        self.segments.insert(name.to_string(), size);
        Ok(())
    }
}
