//! Hosted stand-ins for device memory, the system frame allocator and the
//! MMU registers.
//!
//! Used by the test suites and handy for exercising the engine without a
//! GPU. All doubles are cheap to clone where a test needs to keep a handle
//! after passing one to [`Device::new`](crate::Device::new).

use crate::error::HwError;
use crate::hardware::{AsNr, MmuHardware};
use crate::level::DirtyLevels;
use crate::memory::{FrameAlloc, PhysMemory};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use gpu_memory_addresses::{PageSize, PhysicalAddress, Size4K, VpfnRange};
use gpu_sync::SpinLock;

const WORDS_PER_FRAME: usize = 512;

/// Sparse physical memory; untouched words read as zero.
#[derive(Default)]
pub struct SimulatedRam {
    frames: SpinLock<BTreeMap<u64, Box<[u64; WORDS_PER_FRAME]>>>,
}

impl SimulatedRam {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the 4 KiB frame at `pa` with words derived from `seed`.
    pub fn fill_frame(&self, pa: PhysicalAddress, seed: u64) {
        let mut frame = Box::new([0_u64; WORDS_PER_FRAME]);
        for (i, w) in frame.iter_mut().enumerate() {
            *w = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ i as u64;
        }
        self.frames.with_lock(|f| f.insert(pa.pfn(), frame));
    }

    /// Copy of the 4 KiB frame at `pa`.
    #[must_use]
    pub fn frame(&self, pa: PhysicalAddress) -> Vec<u64> {
        self.frames.with_lock(|f| {
            f.get(&pa.pfn())
                .map_or_else(|| alloc::vec![0; WORDS_PER_FRAME], |w| w.to_vec())
        })
    }
}

impl PhysMemory for SimulatedRam {
    fn read_u64(&self, pa: PhysicalAddress) -> u64 {
        let word = (pa.page_offset::<Size4K>() / 8) as usize;
        self.frames
            .with_lock(|f| f.get(&pa.pfn()).map_or(0, |w| w[word]))
    }

    fn write_u64(&self, pa: PhysicalAddress, value: u64) {
        let word = (pa.page_offset::<Size4K>() / 8) as usize;
        self.frames.with_lock(|f| {
            f.entry(pa.pfn())
                .or_insert_with(|| Box::new([0; WORDS_PER_FRAME]))[word] = value;
        });
    }

    fn copy(&self, from: PhysicalAddress, to: PhysicalAddress, bytes: u64) {
        let frames = bytes.div_ceil(Size4K::SIZE);
        self.frames.with_lock(|f| {
            for i in 0..frames {
                match f.get(&(from.pfn() + i)).cloned() {
                    Some(w) => f.insert(to.pfn() + i, w),
                    None => f.remove(&(to.pfn() + i)),
                };
            }
        });
    }

    fn zero(&self, pa: PhysicalAddress, bytes: u64) {
        let frames = bytes.div_ceil(Size4K::SIZE);
        self.frames.with_lock(|f| {
            for i in 0..frames {
                f.remove(&(pa.pfn() + i));
            }
        });
    }
}

struct FrameState {
    next: u64,
    limit: usize,
    outstanding: usize,
    recycled: Vec<(PhysicalAddress, u32)>,
    fail_next: usize,
}

/// Bounded system frame allocator.
///
/// Hands out naturally aligned runs from a bump pointer and recycles freed
/// runs of the same order. Clones share state.
#[derive(Clone)]
pub struct SimulatedFrames {
    state: Arc<SpinLock<FrameState>>,
}

impl SimulatedFrames {
    /// First address handed out.
    pub const BASE: u64 = 0x1_0000_0000;

    /// Allocator that hands out at most `limit` 4 KiB frames at a time.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            state: Arc::new(SpinLock::new(FrameState {
                next: Self::BASE,
                limit,
                outstanding: 0,
                recycled: Vec::new(),
                fail_next: 0,
            })),
        }
    }

    /// 4 KiB frames currently handed out.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.with_lock(|s| s.outstanding)
    }

    pub fn set_limit(&self, limit: usize) {
        self.state.with_lock(|s| s.limit = limit);
    }

    /// Make the next `count` allocations fail.
    pub fn fail_next(&self, count: usize) {
        self.state.with_lock(|s| s.fail_next = count);
    }
}

impl FrameAlloc for SimulatedFrames {
    fn alloc_frames(&mut self, order: u32) -> Option<PhysicalAddress> {
        self.state.with_lock(|s| {
            if s.fail_next > 0 {
                s.fail_next -= 1;
                return None;
            }
            let frames = 1_usize << order;
            if s.outstanding + frames > s.limit {
                return None;
            }
            s.outstanding += frames;
            if let Some(i) = s.recycled.iter().position(|&(_, o)| o == order) {
                return Some(s.recycled.swap_remove(i).0);
            }
            let bytes = (frames as u64) * Size4K::SIZE;
            let base = s.next.next_multiple_of(bytes);
            s.next = base + bytes;
            Some(PhysicalAddress::new(base))
        })
    }

    fn free_frames(&mut self, base: PhysicalAddress, order: u32) {
        self.state.with_lock(|s| {
            s.outstanding -= 1 << order;
            s.recycled.push((base, order));
        });
    }
}

/// A hardware operation as seen by [`SimulatedHardware`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwOp {
    InvalidateTlb {
        as_nr: AsNr,
        range: VpfnRange,
        skip: DirtyLevels,
    },
    FlushCacheRange {
        pa: PhysicalAddress,
        bytes: u64,
    },
    FlushCacheAll,
    LockRange {
        as_nr: AsNr,
        range: VpfnRange,
    },
    UnlockRange {
        as_nr: AsNr,
    },
    Resume {
        as_nr: AsNr,
    },
    Reset,
}

/// Calls that [`SimulatedHardware::fail_call`] can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwCall {
    InvalidateTlb,
    FlushCacheRange,
    UnlockRange,
}

/// Records every call; knobs inject the failure modes of real hardware.
#[derive(Default)]
pub struct SimulatedHardware {
    ops: SpinLock<Vec<HwOp>>,
    range_flush: AtomicBool,
    busy_budget: AtomicU32,
    fail_flushes: AtomicBool,
    refuse_lock: AtomicBool,
    fail_after_lock: AtomicBool,
    /// Call kind and how many of them still succeed before it fails.
    fail_call: SpinLock<Option<(HwCall, u32)>>,
    locked: SpinLock<Option<(AsNr, VpfnRange)>>,
}

impl SimulatedHardware {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_range_flush(self, supported: bool) -> Self {
        self.range_flush.store(supported, Ordering::Relaxed);
        self
    }

    /// Everything recorded so far.
    #[must_use]
    pub fn ops(&self) -> Vec<HwOp> {
        self.ops.with_lock(|o| o.clone())
    }

    pub fn clear(&self) {
        self.ops.with_lock(Vec::clear);
    }

    /// Recorded operations matching `pred`.
    pub fn count(&self, pred: impl Fn(&HwOp) -> bool) -> usize {
        self.ops.with_lock(|o| o.iter().filter(|op| pred(op)).count())
    }

    /// The next `n` fallible calls report busy.
    pub fn inject_busy(&self, n: u32) {
        self.busy_budget.store(n, Ordering::Relaxed);
    }

    /// Cache flushes fail with [`HwError::Fault`].
    pub fn fail_flushes(&self, fail: bool) {
        self.fail_flushes.store(fail, Ordering::Relaxed);
    }

    /// Range locks fail with [`HwError::NotScheduled`].
    pub fn refuse_range_lock(&self, refuse: bool) {
        self.refuse_lock.store(refuse, Ordering::Relaxed);
    }

    /// Cache flushes fail while a range is locked.
    pub fn fail_while_locked(&self, fail: bool) {
        self.fail_after_lock.store(fail, Ordering::Relaxed);
    }

    /// Let `skip` calls of `call` succeed, then fail every further one with
    /// [`HwError::Fault`] until [`clear_failures`](Self::clear_failures).
    pub fn fail_call(&self, call: HwCall, skip: u32) {
        *self.fail_call.lock() = Some((call, skip));
    }

    pub fn clear_failures(&self) {
        *self.fail_call.lock() = None;
        self.fail_flushes(false);
        self.fail_while_locked(false);
    }

    /// Range currently locked, if any.
    #[must_use]
    pub fn locked_range(&self) -> Option<(AsNr, VpfnRange)> {
        *self.locked.lock()
    }

    fn record(&self, op: HwOp) {
        self.ops.with_lock(|o| o.push(op));
    }

    fn busy(&self) -> bool {
        self.busy_budget
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    fn call_result(&self, call: HwCall) -> Result<(), HwError> {
        self.fail_call.with_lock(|f| match f {
            Some((c, 0)) if *c == call => Err(HwError::Fault),
            Some((c, n)) if *c == call => {
                *n -= 1;
                Ok(())
            }
            _ => Ok(()),
        })
    }

    fn flush_result(&self) -> Result<(), HwError> {
        if self.fail_flushes.load(Ordering::Relaxed)
            || (self.fail_after_lock.load(Ordering::Relaxed) && self.locked.lock().is_some())
        {
            Err(HwError::Fault)
        } else {
            Ok(())
        }
    }
}

impl MmuHardware for SimulatedHardware {
    fn invalidate_tlb(
        &self,
        as_nr: AsNr,
        range: VpfnRange,
        skip_levels: DirtyLevels,
    ) -> Result<(), HwError> {
        if self.busy() {
            return Err(HwError::Busy);
        }
        self.record(HwOp::InvalidateTlb {
            as_nr,
            range,
            skip: skip_levels,
        });
        self.call_result(HwCall::InvalidateTlb)
    }

    fn flush_cache_range(&self, pa: PhysicalAddress, bytes: u64) -> Result<(), HwError> {
        if self.busy() {
            return Err(HwError::Busy);
        }
        self.record(HwOp::FlushCacheRange { pa, bytes });
        self.call_result(HwCall::FlushCacheRange)?;
        self.flush_result()
    }

    fn flush_cache_all(&self) -> Result<(), HwError> {
        if self.busy() {
            return Err(HwError::Busy);
        }
        self.record(HwOp::FlushCacheAll);
        self.flush_result()
    }

    fn supports_range_flush(&self) -> bool {
        self.range_flush.load(Ordering::Relaxed)
    }

    fn lock_range(&self, as_nr: AsNr, range: VpfnRange) -> Result<(), HwError> {
        if self.busy() {
            return Err(HwError::Busy);
        }
        if self.refuse_lock.load(Ordering::Relaxed) {
            return Err(HwError::NotScheduled);
        }
        self.record(HwOp::LockRange { as_nr, range });
        *self.locked.lock() = Some((as_nr, range));
        Ok(())
    }

    fn unlock_range(&self, as_nr: AsNr) -> Result<(), HwError> {
        if self.busy() {
            return Err(HwError::Busy);
        }
        self.record(HwOp::UnlockRange { as_nr });
        // A failed unlock leaves the range locked until reset.
        self.call_result(HwCall::UnlockRange)?;
        *self.locked.lock() = None;
        Ok(())
    }

    fn resume(&self, as_nr: AsNr) {
        self.record(HwOp::Resume { as_nr });
    }

    fn reset(&self) {
        self.record(HwOp::Reset);
        *self.locked.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_memory_addresses::Size2M;

    #[test]
    fn ram_copy_and_zero() {
        let ram = SimulatedRam::new();
        let a = PhysicalAddress::new(0x1000);
        let b = PhysicalAddress::new(0x8000);
        ram.fill_frame(a, 7);
        ram.copy(a, b, Size4K::SIZE);
        assert_eq!(ram.frame(a), ram.frame(b));
        ram.zero(a, Size4K::SIZE);
        assert_eq!(ram.read_u64(a + 16), 0);
        assert_ne!(ram.read_u64(b + 16), 0);
    }

    #[test]
    fn frames_are_naturally_aligned_and_bounded() {
        let mut f = SimulatedFrames::new(1024);
        let small = f.alloc_frames(0).unwrap();
        let large = f.alloc_frames(9).unwrap();
        assert!(small.is_aligned::<Size4K>());
        assert!(large.is_aligned::<Size2M>());
        assert_eq!(f.alloc_frames(9), None);
        f.free_frames(large, 9);
        assert_eq!(f.alloc_frames(9), Some(large));
        assert_eq!(f.outstanding(), 513);
    }

    #[test]
    fn busy_budget_is_consumed() {
        let hw = SimulatedHardware::new();
        hw.inject_busy(1);
        assert_eq!(hw.flush_cache_all(), Err(HwError::Busy));
        assert_eq!(hw.flush_cache_all(), Ok(()));
        assert_eq!(hw.ops(), vec![HwOp::FlushCacheAll]);
    }

    #[test]
    fn targeted_failure_skips_then_sticks() {
        let hw = SimulatedHardware::new();
        let pa = PhysicalAddress::new(0x1000);
        hw.fail_call(HwCall::FlushCacheRange, 1);
        assert_eq!(hw.flush_cache_range(pa, 8), Ok(()));
        assert_eq!(hw.flush_cache_range(pa, 8), Err(HwError::Fault));
        assert_eq!(hw.flush_cache_range(pa, 8), Err(HwError::Fault));
        assert_eq!(hw.flush_cache_all(), Ok(()));
        hw.clear_failures();
        assert_eq!(hw.flush_cache_range(pa, 8), Ok(()));
    }

    #[test]
    fn failed_unlock_keeps_the_range_until_reset() {
        let hw = SimulatedHardware::new();
        let range = VpfnRange::new(gpu_memory_addresses::Vpfn::new(0x10), 1);
        hw.fail_call(HwCall::UnlockRange, 0);
        hw.lock_range(0, range).unwrap();
        assert_eq!(hw.unlock_range(0), Err(HwError::Fault));
        assert!(hw.locked_range().is_some());
        hw.reset();
        assert!(hw.locked_range().is_none());
    }
}
