use core::sync::atomic::{AtomicBool, Ordering};

/// A device-wide "operation in progress" flag.
///
/// Unlike [`SpinLock`](crate::SpinLock) this protects no data; it only
/// announces that a transaction is running so that other paths can detect it
/// and back off. All operations are sequentially consistent so that two flags
/// can form an interlock:
///
/// ```text
/// path A: acquire(flag_a); if flag_b.is_set() { release(flag_a); back off }
/// path B: acquire(flag_b); if flag_a.is_set() { release(flag_b); back off }
/// ```
///
/// At most one of the two paths proceeds.
pub struct ExclusiveFlag {
    held: AtomicBool,
}

impl Default for ExclusiveFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ExclusiveFlag {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Set the flag if it is clear. Returns a guard that clears it on drop.
    #[inline]
    pub fn try_acquire(&self) -> Option<FlagGuard<'_>> {
        self.held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            .then_some(FlagGuard { flag: self })
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

/// RAII guard of a set [`ExclusiveFlag`].
#[must_use = "dropping the guard clears the flag immediately"]
pub struct FlagGuard<'a> {
    flag: &'a ExclusiveFlag,
}

impl FlagGuard<'_> {
    /// The flag this guard holds.
    #[inline]
    pub const fn flag(&self) -> &ExclusiveFlag {
        self.flag
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.held.store(false, Ordering::SeqCst);
    }
}
