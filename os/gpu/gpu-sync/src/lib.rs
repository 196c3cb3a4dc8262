//! # GPU MMU synchronization primitives
//!
//! Small, allocation-free building blocks used by the GPU memory manager:
//!
//! - [`SpinLock`]: a test-and-test-and-set lock with RAII guards and a
//!   contention counter, surfaced in the MMU statistics.
//! - [`ExclusiveFlag`]: a device-wide "something is in progress" flag with
//!   compare-and-swap acquisition and an RAII [`FlagGuard`]. Two flags can be
//!   used as a Dekker-style interlock (set own flag, then inspect the other).
//!
//! Everything here is `no_std` and safe to use from interrupt-like contexts as
//! long as the protected sections stay short.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod exclusive_flag;
mod spin_lock;

pub use exclusive_flag::{ExclusiveFlag, FlagGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
