//! Event counters.

use core::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Monotonic device-wide counters.
        #[derive(Debug, Default)]
        pub struct MmuStats {
            $($(#[$doc])* $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`MmuStats`].
        #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
        pub struct StatsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
            /// Acquisitions of the hardware register mutex that had to wait.
            /// Filled in by [`Device::stats`](crate::Device::stats).
            pub hw_lock_waits: u64,
        }

        impl MmuStats {
            $(
                #[inline]
                pub(crate) fn $name(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )*

            #[must_use]
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                    ..StatsSnapshot::default()
                }
            }
        }
    };
}

counters! {
    /// Stale mid-level entries skipped during teardown.
    stale_entries,
    flush_tlb_only,
    flush_cache_range,
    flush_cache_all,
    /// Hardware operations that returned busy.
    hw_busy,
    device_resets,
    faults_resolved,
    faults_duplicate,
    faults_killed,
    /// Pool growths triggered by the fault handler.
    fault_pool_grows,
    migrations_done,
    migrations_deferred,
    migrations_failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let s = MmuStats::default();
        s.stale_entries();
        s.stale_entries();
        s.device_resets();
        let snap = s.snapshot();
        assert_eq!(snap.stale_entries, 2);
        assert_eq!(snap.device_resets, 1);
        assert_eq!(snap.faults_killed, 0);
        assert_eq!(snap.hw_lock_waits, 0);
    }
}
