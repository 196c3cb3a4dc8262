//! GPU page-fault handling.
//!
//! A translation fault inside a growable region backs the missing pages
//! (rounded up to the region's extension step) and resumes the address
//! space. Everything else that cannot be satisfied kills the context.
//!
//! Resolution is a bounded loop with a "try" phase under the region lock
//! and a "grow" phase with every lock released:
//!
//! ```text
//! loop (max_fault_retries):
//!     lock regions -> find region -> check access -> already backed? resume
//!     take pages from pool ----- empty ----> unlock, grow pool, retry
//!     map pages --------- table out of PGDs -> unlock, grow pool, retry
//!     resume
//! ```

use crate::context::{Context, ContextId};
use crate::device::Device;
use crate::error::{KillReason, MmuError};
use crate::pool::PageClass;
use crate::region::RegionFlags;
use crate::LEVELS;
use alloc::vec::Vec;
use gpu_memory_addresses::Vpfn;
use log::{debug, trace};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// No valid translation.
    Translation,
    /// A translation exists but forbids the access.
    Permission,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Fault {
    pub context: ContextId,
    pub vpfn: Vpfn,
    pub access: Access,
    pub kind: FaultKind,
}

impl Fault {
    #[must_use]
    pub const fn translation(context: ContextId, vpfn: Vpfn, access: Access) -> Self {
        Self {
            context,
            vpfn,
            access,
            kind: FaultKind::Translation,
        }
    }

    #[must_use]
    pub const fn permission(context: ContextId, vpfn: Vpfn, access: Access) -> Self {
        Self {
            context,
            vpfn,
            access,
            kind: FaultKind::Permission,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Backing was added (`grown` GPU pages) and the address space resumed.
    Resumed { grown: u64 },
    /// The page was already backed; the address space was only resumed.
    Duplicate,
    Killed(KillReason),
    /// The context no longer exists.
    ContextGone,
}

const fn denied(flags: RegionFlags, access: Access) -> Option<KillReason> {
    match access {
        Access::Read if !flags.contains(RegionFlags::READ) => Some(KillReason::ReadDenied),
        Access::Write if !flags.contains(RegionFlags::WRITE) => Some(KillReason::WriteDenied),
        Access::Execute if !flags.contains(RegionFlags::EXECUTE) => {
            Some(KillReason::ExecuteDenied)
        }
        _ => None,
    }
}

impl Device {
    /// Resolve one GPU fault.
    pub fn handle_fault(&self, fault: Fault) -> FaultOutcome {
        let Some(context) = self.context(fault.context) else {
            debug!("fault for gone {} ignored", fault.context);
            return FaultOutcome::ContextGone;
        };
        if let Some(reason) = context.kill_reason() {
            return FaultOutcome::Killed(reason);
        }
        context.resolve_fault(&fault)
    }
}

impl Context {
    pub(crate) fn resolve_fault(&self, fault: &Fault) -> FaultOutcome {
        let config = self.shared.config;
        let stats = &self.shared.stats;

        for _ in 0..=config.max_fault_retries {
            if self.is_destroyed() {
                return FaultOutcome::ContextGone;
            }

            let mut regions = self.regions.lock();
            let Some(region) = regions.find_mut(fault.vpfn) else {
                drop(regions);
                return self.kill_for(KillReason::Unmapped);
            };
            if let Some(reason) = denied(region.desc.flags, fault.access) {
                drop(regions);
                return self.kill_for(reason);
            }

            let rel = fault.vpfn - region.desc.start;
            if rel < region.backed {
                drop(regions);
                trace!("{} fault at {:?} already backed", self.id, fault.vpfn);
                self.resume();
                stats.faults_duplicate();
                return FaultOutcome::Duplicate;
            }
            if !region.desc.flags.contains(RegionFlags::GROWABLE) {
                drop(regions);
                return self.kill_for(KillReason::NotGrowable);
            }

            let region_id = region.id;
            let class = region.class();
            let granule = region.desc.granule(&config);
            let grow = region.grow_amount(rel, granule);
            let count = (grow / granule) as usize;

            let mut pages = Vec::with_capacity(count);
            if self.shared.alloc_pages(class, count, &mut pages).is_err() {
                drop(regions);
                let missing = count
                    .saturating_sub(self.shared.pool.free_count(class))
                    .max(1);
                if self.shared.pool.grow(class, missing).is_err() {
                    return self.kill_for(KillReason::OutOfMemory);
                }
                stats.fault_pool_grows();
                continue;
            }

            match self.install(region, &pages) {
                Ok(()) => {
                    drop(regions);
                    debug!(
                        "{} fault at {:?} grew region {} by {grow} pages",
                        self.id,
                        fault.vpfn,
                        region_id.as_u64()
                    );
                    self.resume();
                    stats.faults_resolved();
                    return FaultOutcome::Resumed { grown: grow };
                }
                Err(e) if e.is_retryable() => {
                    drop(regions);
                    if self.shared.pool.grow(PageClass::Small, LEVELS - 1).is_err() {
                        return self.kill_for(KillReason::OutOfMemory);
                    }
                    stats.fault_pool_grows();
                }
                Err(MmuError::Hardware(_)) => {
                    drop(regions);
                    return self.kill_for(KillReason::Hardware);
                }
                Err(_) => {
                    drop(regions);
                    return self.kill_for(KillReason::Corruption);
                }
            }
        }
        self.kill_for(KillReason::OutOfMemory)
    }

    fn kill_for(&self, reason: KillReason) -> FaultOutcome {
        self.kill(reason);
        FaultOutcome::Killed(self.kill_reason().unwrap_or(reason))
    }

    fn resume(&self) {
        if let Some(as_nr) = self.table.address_space() {
            let _hw = self.shared.hw_lock.lock();
            self.shared.hw.resume(as_nr);
        }
    }
}
