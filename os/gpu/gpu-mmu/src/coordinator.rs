//! Interlock between page migration and GPU power transitions.
//!
//! Each side sets its own flag and then inspects the other one. Both flags
//! are sequentially consistent, so at most one side ever proceeds.

use core::hint::spin_loop;
use gpu_sync::{ExclusiveFlag, FlagGuard};
use log::debug;

/// Held for the duration of a GPU power transition.
pub type PowerTransition<'a> = FlagGuard<'a>;

#[derive(Default)]
pub struct MigrationCoordinator {
    migration: ExclusiveFlag,
    power: ExclusiveFlag,
}

impl MigrationCoordinator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            migration: ExclusiveFlag::new(),
            power: ExclusiveFlag::new(),
        }
    }

    /// Start a migration transaction.
    ///
    /// Waits for a concurrent migration to finish; returns `None` while a
    /// power transition is in progress.
    pub fn begin_migration(&self) -> Option<FlagGuard<'_>> {
        loop {
            if self.power.is_set() {
                return None;
            }
            if let Some(guard) = self.migration.try_acquire() {
                if self.power.is_set() {
                    debug!("power transition raced a migration, backing off");
                    return None;
                }
                return Some(guard);
            }
            spin_loop();
        }
    }

    /// Start a power transition; `None` while a migration is running.
    pub fn begin_power_transition(&self) -> Option<FlagGuard<'_>> {
        let guard = self.power.try_acquire()?;
        if self.migration.is_set() {
            return None;
        }
        Some(guard)
    }

    #[must_use]
    pub fn migration_in_progress(&self) -> bool {
        self.migration.is_set()
    }

    #[must_use]
    pub fn power_transition_in_progress(&self) -> bool {
        self.power.is_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_and_power_exclude_each_other() {
        let c = MigrationCoordinator::new();
        let m = c.begin_migration().expect("idle");
        assert!(c.migration_in_progress());
        assert!(c.begin_power_transition().is_none());
        assert!(!c.power_transition_in_progress());
        drop(m);

        let p = c.begin_power_transition().expect("idle");
        assert!(c.begin_migration().is_none());
        assert!(!c.migration_in_progress());
        drop(p);
        assert!(c.begin_migration().is_some());
    }
}
