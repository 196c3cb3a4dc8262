//! Error types of the GPU MMU.
//!
//! | Class | Type / variant | Handling |
//! |-------|----------------|----------|
//! | Resource exhaustion | [`PoolError::OutOfMemory`], [`MmuError::OutOfMemory`] | Retry after growing the pool. |
//! | Topology corruption | [`MmuError::Corruption`] | Logged; surfaced to the context owner, never retried. |
//! | Permission / policy | [`KillReason`] | Fatal to the faulting context only. |
//! | Transient hardware | [`HwError::Busy`] | Retried with bounded backoff. |
//! | Migration races | [`MigrationError::StateChanged`] | Benign; the caller retries later. |

use gpu_memory_addresses::Vpfn;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("page pool exhausted")]
    OutOfMemory,
    #[error("page pool is being reclaimed")]
    Busy,
    #[error("page class not available in this pool")]
    InvalidClass,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HwError {
    #[error("hardware busy")]
    Busy,
    #[error("address space not scheduled")]
    NotScheduled,
    #[error("hardware operation timed out")]
    Timeout,
    #[error("hardware reported a fault")]
    Fault,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MmuError {
    #[error("out of memory while updating page tables")]
    OutOfMemory,
    #[error("page table corruption at level {level}, index {index}")]
    Corruption { level: u8, index: u16 },
    #[error("invalid virtual range")]
    InvalidRange,
    #[error("no mapping at {0}")]
    NoMapping(Vpfn),
    #[error("operation would split the huge entry at {0}")]
    HugeSplit(Vpfn),
    #[error("hardware failure: {0}")]
    Hardware(#[from] HwError),
}

impl MmuError {
    /// Only resource exhaustion may be retried, and only after growing the pool.
    #[inline]
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::OutOfMemory)
    }
}

impl From<PoolError> for MmuError {
    fn from(_: PoolError) -> Self {
        Self::OutOfMemory
    }
}

/// Why a context was terminated by the fault handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KillReason {
    #[error("fault outside of any region")]
    Unmapped,
    #[error("fault beyond the backing of a non-growable region")]
    NotGrowable,
    #[error("read from a non-readable region")]
    ReadDenied,
    #[error("write to a read-only region")]
    WriteDenied,
    #[error("instruction fetch from a non-executable region")]
    ExecuteDenied,
    #[error("backing allocation failed")]
    OutOfMemory,
    #[error("page table corruption")]
    Corruption,
    #[error("hardware failure")]
    Hardware,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    #[error("page state changed during migration")]
    StateChanged,
    #[error("page is not movable")]
    NotMovable,
    #[error("page is not mapped")]
    NoMapping,
    #[error("owning context is gone")]
    ContextGone,
    #[error("target page is in use")]
    TargetInUse,
    #[error("out of memory")]
    OutOfMemory,
    #[error("hardware failure: {0}")]
    Hardware(#[from] HwError),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegionError {
    #[error("region overlaps an existing region")]
    Overlap,
    #[error("invalid region description")]
    InvalidDesc,
    #[error("no such region")]
    NotFound,
    #[error("context was killed")]
    ContextKilled,
    #[error("out of memory")]
    OutOfMemory,
    #[error("page table update failed: {0}")]
    Mmu(MmuError),
}

impl From<MmuError> for RegionError {
    fn from(e: MmuError) -> Self {
        match e {
            MmuError::OutOfMemory => Self::OutOfMemory,
            other => Self::Mmu(other),
        }
    }
}

impl From<PoolError> for RegionError {
    fn from(_: PoolError) -> Self {
        Self::OutOfMemory
    }
}
