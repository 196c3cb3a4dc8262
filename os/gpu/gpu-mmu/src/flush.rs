//! Cache and TLB maintenance after a table update.
//!
//! Every mutation ends in exactly one [`FlushCoordinator::flush`] call that
//! picks one of three strategies:
//!
//! | Strategy | When |
//! |----------|------|
//! | [`FlushStrategy::TlbOnly`] | Fresh entries were inserted into invalid slots. |
//! | [`FlushStrategy::CacheRange`] | Existing entries changed or were removed, no PGD was freed, the hardware flushes by range and the touched range is small. |
//! | [`FlushStrategy::CacheAll`] | Everything else, in particular teardown that frees PGDs. |
//!
//! TLB invalidation skips levels the operation did not touch.

use crate::error::{HwError, MmuError};
use crate::hardware::{AsNr, MmuHardware, retry_busy};
use crate::level::DirtyLevels;
use crate::stats::MmuStats;
use arrayvec::ArrayVec;
use gpu_memory_addresses::{PhysicalAddress, VpfnRange};
use gpu_sync::SpinLock;
use log::{debug, error};

/// Distinct physical spans remembered per operation before falling back to
/// a full cache flush.
const MAX_DIRTY_SPANS: usize = 8;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlushOp {
    /// Entries written into previously invalid slots.
    Insert,
    /// Existing entries retargeted or re-flagged.
    Update,
    /// Entries removed; `freed_pgds` if PGDs are about to be released.
    Teardown { freed_pgds: bool },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlushStrategy {
    TlbOnly,
    CacheRange,
    CacheAll,
}

/// Physical spans of PGD entries written by one operation.
#[derive(Debug, Default, Clone)]
pub struct DirtyLines {
    spans: ArrayVec<(PhysicalAddress, u64), MAX_DIRTY_SPANS>,
    overflowed: bool,
}

impl DirtyLines {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            spans: ArrayVec::new_const(),
            overflowed: false,
        }
    }

    /// Record `bytes` written at `pa`, merging with the previous span when
    /// adjacent.
    pub fn record(&mut self, pa: PhysicalAddress, bytes: u64) {
        if self.overflowed {
            return;
        }
        if let Some(last) = self.spans.last_mut() {
            if last.0.as_u64() + last.1 == pa.as_u64() {
                last.1 += bytes;
                return;
            }
            if last.0 == pa {
                last.1 = last.1.max(bytes);
                return;
            }
        }
        if self.spans.try_push((pa, bytes)).is_err() {
            self.overflowed = true;
        }
    }

    #[must_use]
    pub const fn is_overflowed(&self) -> bool {
        self.overflowed
    }

    #[must_use]
    pub fn spans(&self) -> &[(PhysicalAddress, u64)] {
        &self.spans
    }

    pub fn clear(&mut self) {
        self.spans.clear();
        self.overflowed = false;
    }
}

/// One flush request.
#[derive(Debug, Clone, Copy)]
pub struct FlushRequest<'a> {
    /// `None` if the table is not bound to a hardware address space.
    pub as_nr: Option<AsNr>,
    pub range: VpfnRange,
    pub dirty: DirtyLevels,
    pub op: FlushOp,
    pub lines: &'a DirtyLines,
}

#[derive(Debug, Clone, Copy)]
pub struct FlushCoordinator {
    range_flush_limit_pages: u64,
    hw_busy_retries: u32,
}

impl FlushCoordinator {
    #[must_use]
    pub const fn new(range_flush_limit_pages: u64, hw_busy_retries: u32) -> Self {
        Self {
            range_flush_limit_pages,
            hw_busy_retries,
        }
    }

    #[must_use]
    pub fn choose(&self, hw: &dyn MmuHardware, req: &FlushRequest<'_>) -> FlushStrategy {
        match req.op {
            FlushOp::Insert => FlushStrategy::TlbOnly,
            FlushOp::Teardown { freed_pgds: true } => FlushStrategy::CacheAll,
            FlushOp::Update | FlushOp::Teardown { freed_pgds: false } => {
                if hw.supports_range_flush()
                    && !req.lines.is_overflowed()
                    && req.range.count <= self.range_flush_limit_pages
                {
                    FlushStrategy::CacheRange
                } else {
                    FlushStrategy::CacheAll
                }
            }
        }
    }

    pub(crate) fn retry(
        &self,
        stats: &MmuStats,
        op: impl FnMut() -> Result<(), HwError>,
    ) -> Result<(), HwError> {
        retry_busy(self.hw_busy_retries, || stats.hw_busy(), op)
    }

    /// Perform the maintenance for `req` with the hardware mutex held.
    ///
    /// Busy hardware is retried; any other failure resets the device and
    /// is reported as [`MmuError::Hardware`].
    pub fn flush(
        &self,
        hw: &dyn MmuHardware,
        hw_lock: &SpinLock<()>,
        stats: &MmuStats,
        req: &FlushRequest<'_>,
    ) -> Result<FlushStrategy, MmuError> {
        let strategy = self.choose(hw, req);
        debug!(
            "flush {:?} of {:?} ({} pages, dirty {:?}) via {strategy:?}",
            req.op, req.range.start, req.range.count, req.dirty
        );
        match strategy {
            FlushStrategy::TlbOnly => stats.flush_tlb_only(),
            FlushStrategy::CacheRange => stats.flush_cache_range(),
            FlushStrategy::CacheAll => stats.flush_cache_all(),
        }

        let _hw = hw_lock.lock();
        let cache = match strategy {
            FlushStrategy::TlbOnly => Ok(()),
            FlushStrategy::CacheRange => req
                .lines
                .spans()
                .iter()
                .try_for_each(|&(pa, bytes)| self.retry(stats, || hw.flush_cache_range(pa, bytes))),
            FlushStrategy::CacheAll => self.retry(stats, || hw.flush_cache_all()),
        };

        let tlb = cache.and_then(|()| match req.as_nr {
            Some(as_nr) => match self.retry(stats, || {
                hw.invalidate_tlb(as_nr, req.range, req.dirty.skip_levels())
            }) {
                // Descheduled concurrently: nothing cached for it any more.
                Err(HwError::NotScheduled) => Ok(()),
                other => other,
            },
            None => Ok(()),
        });

        match tlb {
            Ok(()) => Ok(strategy),
            Err(e) => {
                error!("MMU flush failed ({e}), resetting the GPU");
                stats.device_resets();
                hw.reset();
                Err(MmuError::Hardware(e))
            }
        }
    }
}
