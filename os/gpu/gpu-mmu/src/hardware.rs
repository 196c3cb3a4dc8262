//! Boundary to the GPU's MMU registers.

use crate::error::HwError;
use crate::level::DirtyLevels;
use core::hint::spin_loop;
use gpu_memory_addresses::{PhysicalAddress, VpfnRange};

/// Hardware address-space slot a table is bound to while scheduled.
pub type AsNr = u32;

/// Register-level MMU operations consumed by the engine.
///
/// Every call is made with the device-wide hardware mutex held, so
/// implementations do not need to serialize against each other.
pub trait MmuHardware: Send + Sync {
    /// Invalidate translations of `range` in address space `as_nr`,
    /// skipping cached walks of the levels in `skip_levels`.
    fn invalidate_tlb(
        &self,
        as_nr: AsNr,
        range: VpfnRange,
        skip_levels: DirtyLevels,
    ) -> Result<(), HwError>;

    /// Write back and invalidate the data cache for a physical range.
    fn flush_cache_range(&self, pa: PhysicalAddress, bytes: u64) -> Result<(), HwError>;

    /// Write back and invalidate the whole data cache.
    fn flush_cache_all(&self) -> Result<(), HwError>;

    /// Whether [`flush_cache_range`](Self::flush_cache_range) is implemented
    /// in hardware (otherwise callers fall back to a full flush).
    fn supports_range_flush(&self) -> bool;

    /// Block GPU accesses to `range` of `as_nr` until
    /// [`unlock_range`](Self::unlock_range).
    fn lock_range(&self, as_nr: AsNr, range: VpfnRange) -> Result<(), HwError>;

    fn unlock_range(&self, as_nr: AsNr) -> Result<(), HwError>;

    /// Let a stalled address space continue after a fault.
    fn resume(&self, as_nr: AsNr);

    /// Full GPU reset; the last resort after a failed flush.
    fn reset(&self);
}

/// Run `op` until it stops reporting [`HwError::Busy`], at most `retries + 1`
/// times, backing off between attempts.
///
/// Returns [`HwError::Timeout`] once the budget is spent. `on_busy` is called
/// for every busy result.
pub(crate) fn retry_busy<T>(
    retries: u32,
    mut on_busy: impl FnMut(),
    mut op: impl FnMut() -> Result<T, HwError>,
) -> Result<T, HwError> {
    let mut backoff = 1_u32;
    for _ in 0..=retries {
        match op() {
            Err(HwError::Busy) => {
                on_busy();
                for _ in 0..backoff {
                    spin_loop();
                }
                backoff = (backoff * 2).min(256);
            }
            other => return other,
        }
    }
    log::warn!("hardware stayed busy for {} attempts", retries + 1);
    Err(HwError::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_results_are_retried() {
        let mut left = 3;
        let mut busy = 0;
        let r = retry_busy(
            5,
            || busy += 1,
            || {
                if left > 0 {
                    left -= 1;
                    Err(HwError::Busy)
                } else {
                    Ok(7)
                }
            },
        );
        assert_eq!(r, Ok(7));
        assert_eq!(busy, 3);
    }

    #[test]
    fn exhausted_budget_times_out() {
        let r: Result<(), _> = retry_busy(2, || {}, || Err(HwError::Busy));
        assert_eq!(r, Err(HwError::Timeout));
    }

    #[test]
    fn other_errors_pass_through() {
        let r: Result<(), _> = retry_busy(2, || {}, || Err(HwError::NotScheduled));
        assert_eq!(r, Err(HwError::NotScheduled));
    }
}
