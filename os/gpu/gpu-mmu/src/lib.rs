//! # GPU Memory Management Unit
//!
//! Software side of a GPU MMU: per-context four-level translation tables,
//! the physical page pool behind them, on-demand growth of regions from GPU
//! page faults and live migration of mapped pages.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Device                            │
//! │    • contexts, firmware table, fault entry point         │
//! │    • migration / power-transition interlock              │
//! └───────────────┬───────────────────────────┬──────────────┘
//!                 │                           │
//! ┌───────────────▼──────────────┐ ┌──────────▼───────────────┐
//! │  Context                     │ │  Migration engine        │
//! │    • regions + backing       │ │    • page isolation      │
//! │    • fault resolution        │ │    • range-locked copy   │
//! └───────────────┬──────────────┘ └──────────┬───────────────┘
//!                 │                           │
//! ┌───────────────▼───────────────────────────▼──────────────┐
//! │  MmuTable: walker & mutator                              │
//! │    • PGD arena, sub-page PGD allocator, deferred frees   │
//! │    • flush coordinator → MmuHardware                     │
//! └───────────────┬──────────────────────────────────────────┘
//!                 │
//! ┌───────────────▼──────────────────────────────────────────┐
//! │  PagePool + MetadataTable  → FrameAlloc / PhysMemory     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Translation tree
//!
//! A VPFN (GPU virtual address >> 12) is split into four 9-bit indices:
//!
//! ```text
//! | 35‒27 | 26‒18 | 17‒9 | 8‒0 |
//! |  L0   |  L1   |  L2  | L3  |
//! ```
//!
//! | Level | Entry covers | Entry kinds |
//! |:------|:-------------|:------------|
//! | 0 (root) | 512 GiB | invalid, PTE |
//! | 1 | 1 GiB | invalid, PTE |
//! | 2 | 2 MiB | invalid, PTE, huge ATE |
//! | 3 (leaf) | 4 KiB | invalid, ATE |
//!
//! ## Features
//!
//! - `std` (default): threaded [`FaultWorkers`] and the [`sim`] doubles.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_lossless,
    clippy::module_name_repetitions
)]

extern crate alloc;

mod config;
mod context;
mod coordinator;
mod device;
mod entry;
mod error;
mod fault;
mod flush;
mod hardware;
mod level;
mod memory;
mod metadata;
mod migrate;
mod pgd_alloc;
mod pool;
mod region;
mod stats;
mod table;

#[cfg(any(test, feature = "std"))]
pub mod sim;
#[cfg(feature = "std")]
mod workers;

/// Levels of the translation tree.
pub const LEVELS: usize = 4;
/// Index bits consumed per level.
pub const BITS_PER_LEVEL: u32 = 9;
pub const ENTRIES_PER_PGD: usize = 1 << BITS_PER_LEVEL;
/// Size of one GPU page.
pub const GPU_PAGE_SIZE: u64 = 4096;
/// Capacity of the per-call batch of unlinked PGDs.
pub const MAX_FREE_PGDS: usize = 32;

pub use crate::config::MmuConfig;
pub use crate::context::{Context, ContextId};
pub use crate::coordinator::{MigrationCoordinator, PowerTransition};
pub use crate::device::Device;
pub use crate::entry::{EntryBits, EntryKind, MapFlags};
pub use crate::error::{HwError, KillReason, MigrationError, MmuError, PoolError, RegionError};
pub use crate::fault::{Access, Fault, FaultKind, FaultOutcome};
pub use crate::flush::{DirtyLines, FlushCoordinator, FlushOp, FlushRequest, FlushStrategy};
pub use crate::hardware::{AsNr, MmuHardware};
pub use crate::level::{DirtyLevels, Level};
pub use crate::memory::{FrameAlloc, PhysMemory, entry_address};
pub use crate::metadata::{BackRef, MetadataTable, PageMetadata, PageState};
pub use crate::migrate::Migration;
pub use crate::pgd_alloc::{PgdAllocator, PgdFree};
pub use crate::pool::{PageAccount, PageClass, PagePool};
pub use crate::region::{RegionDesc, RegionFlags, RegionId};
pub use crate::stats::{MmuStats, StatsSnapshot};
pub use crate::table::{MmuTable, TableId, TableUsage, Translation, VPFN_LIMIT};
#[cfg(feature = "std")]
pub use crate::workers::FaultWorkers;

pub use gpu_memory_addresses::{PhysicalAddress, Vpfn, VpfnRange};
