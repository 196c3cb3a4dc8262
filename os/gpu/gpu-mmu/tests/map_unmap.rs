mod common;

use common::{rig, rig_with, run, scattered};
use gpu_mmu::sim::{HwCall, HwOp, SimulatedHardware};
use gpu_mmu::{
    HwError, Level, MapFlags, MmuConfig, MmuError, PageClass, PageState, RegionDesc, RegionError,
    RegionFlags, Vpfn,
};

const RW: MapFlags = MapFlags::READ.union(MapFlags::WRITE);

#[test]
fn aligned_run_installs_one_huge_entry_and_collapses_on_unmap() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    let table = ctx.table();
    r.device.grow_pool(PageClass::Small, 8).unwrap();
    let free_before = r.device.pool().free_count(PageClass::Small);

    let pages = run(0x8000_0000, 512);
    table.map(Vpfn::new(0), &pages, RW, 0).unwrap();

    let t = table.translate(Vpfn::new(0)).unwrap();
    assert_eq!(t.level, Level::HUGE);
    assert_eq!(t.pa, pages[0]);
    assert_eq!(table.translate(Vpfn::new(300)).unwrap().pa, pages[300]);
    let usage = table.usage();
    assert_eq!(usage.pgds, 3);
    assert_eq!(usage.valid_entries, [1, 1, 1, 0]);
    assert_eq!(r.device.pool().free_count(PageClass::Small), free_before - 2);
    table.check_invariants().unwrap();

    table.unmap(Vpfn::new(0), 512).unwrap();
    assert!(table.translate(Vpfn::new(0)).is_none());
    let usage = table.usage();
    assert_eq!(usage.pgds, 1);
    assert_eq!(usage.valid_entries, [0; 4]);
    assert_eq!(r.device.pool().free_count(PageClass::Small), free_before);
    table.check_invariants().unwrap();
}

#[test]
fn unaligned_runs_use_leaf_entries() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    r.device.grow_pool(PageClass::Small, 8).unwrap();

    // Virtually aligned but physically offset by one page.
    let pages = run(0x8000_1000, 512);
    ctx.table().map(Vpfn::new(512), &pages, RW, 0).unwrap();
    assert_eq!(ctx.table().translate(Vpfn::new(512)).unwrap().level, Level::LEAF);
    assert_eq!(ctx.table().usage().valid_entries, [1, 1, 1, 512]);
}

#[test]
fn map_then_unmap_restores_the_table() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    let table = ctx.table();
    r.device.grow_pool(PageClass::Small, 16).unwrap();

    let pages = scattered(0x9000_0000, 700);
    table
        .map(Vpfn::new(1000), &pages, MapFlags::READ, 3)
        .unwrap();
    table.check_invariants().unwrap();
    for i in [0_usize, 23, 511, 699] {
        let t = table.translate(Vpfn::new(1000 + i as u64)).unwrap();
        assert_eq!(t.pa, pages[i]);
        assert_eq!(t.group, 3);
        assert!(t.flags.contains(MapFlags::READ));
        assert!(!t.flags.contains(MapFlags::WRITE));
    }
    assert!(table.translate(Vpfn::new(1700)).is_none());

    table.unmap(Vpfn::new(1000), 700).unwrap();
    let usage = table.usage();
    assert_eq!(usage.pgds, 1);
    assert_eq!(usage.valid_entries, [0; 4]);
    table.check_invariants().unwrap();
}

#[test]
fn empty_pool_fails_without_leaking() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    let pool = r.device.pool();
    assert_eq!(pool.free_count(PageClass::Small), 0);
    let in_use = pool.in_use(PageClass::Small);
    let outstanding = r.frames.outstanding();

    let err = ctx
        .table()
        .map(Vpfn::new(0), &scattered(0x9000_0000, 4), RW, 0)
        .unwrap_err();
    assert_eq!(err, MmuError::OutOfMemory);
    assert!(err.is_retryable());
    assert_eq!(pool.free_count(PageClass::Small), 0);
    assert_eq!(pool.in_use(PageClass::Small), in_use);
    assert_eq!(r.frames.outstanding(), outstanding);
    assert_eq!(ctx.table().usage().pgds, 1);
}

#[test]
fn failure_in_a_later_chunk_rolls_back_earlier_chunks() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    let table = ctx.table();
    // Enough for the first leaf chain (L1, L2, L3) but not the second leaf.
    r.device.grow_pool(PageClass::Small, 3).unwrap();

    let err = table
        .map(Vpfn::new(0), &scattered(0x9000_0000, 1024), RW, 0)
        .unwrap_err();
    assert_eq!(err, MmuError::OutOfMemory);

    assert!(table.translate(Vpfn::new(0)).is_none());
    assert!(table.translate(Vpfn::new(511)).is_none());
    assert_eq!(table.usage().pgds, 1);
    assert_eq!(r.device.pool().free_count(PageClass::Small), 3);
    table.check_invariants().unwrap();
}

#[test]
fn partial_unmap_of_a_huge_entry_is_rejected() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    r.device.grow_pool(PageClass::Small, 4).unwrap();
    let table = ctx.table();
    table.map(Vpfn::new(1024), &run(0x8000_0000, 512), RW, 0).unwrap();

    assert_eq!(
        table.unmap(Vpfn::new(1030), 4),
        Err(MmuError::HugeSplit(Vpfn::new(1024)))
    );
    assert_eq!(
        table.unmap(Vpfn::new(600), 500),
        Err(MmuError::HugeSplit(Vpfn::new(1024)))
    );
    assert!(table.translate(Vpfn::new(1030)).is_some());

    // Covering it fully, holes around it included, works.
    table.unmap(Vpfn::new(512), 2048).unwrap();
    assert_eq!(table.usage().pgds, 1);
}

#[test]
fn mapping_over_a_valid_entry_is_corruption() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    r.device.grow_pool(PageClass::Small, 4).unwrap();
    let table = ctx.table();
    table.map(Vpfn::new(10), &scattered(0x9000_0000, 4), RW, 0).unwrap();

    let err = table
        .map(Vpfn::new(11), &scattered(0xA000_0000, 2), RW, 0)
        .unwrap_err();
    assert_eq!(err, MmuError::Corruption { level: 3, index: 11 });
    assert!(!err.is_retryable());
    assert_eq!(
        table.translate(Vpfn::new(11)).unwrap().pa.as_u64(),
        0x9000_0000 + 2 * 4096
    );
    table.check_invariants().unwrap();
}

#[test]
fn update_flags_rewrites_in_place() {
    let r = rig_with(
        MmuConfig::new(),
        8192,
        SimulatedHardware::new().with_range_flush(true),
    );
    let ctx = r.device.create_context().unwrap();
    ctx.schedule(2);
    r.device.grow_pool(PageClass::Small, 4).unwrap();
    let table = ctx.table();
    table.map(Vpfn::new(64), &scattered(0x9000_0000, 8), RW, 5).unwrap();
    let usage = table.usage();

    r.hw.clear();
    let moved = scattered(0xB000_0000, 2);
    let dirty = table
        .update_flags(Vpfn::new(66), &moved, MapFlags::READ)
        .unwrap();
    assert!(dirty.contains(gpu_mmu::DirtyLevels::L3));

    let t = table.translate(Vpfn::new(67)).unwrap();
    assert_eq!(t.pa, moved[1]);
    assert_eq!(t.group, 5);
    assert!(!t.flags.contains(MapFlags::WRITE));
    assert_eq!(table.usage(), usage);

    // Two adjacent entries: one range flush, then the TLB.
    assert_eq!(r.hw.count(|op| matches!(op, HwOp::FlushCacheRange { .. })), 1);
    assert_eq!(r.hw.count(|op| matches!(op, HwOp::FlushCacheAll)), 0);
    assert_eq!(r.hw.count(|op| matches!(op, HwOp::InvalidateTlb { as_nr: 2, .. })), 1);

    assert_eq!(
        table.update_flags(Vpfn::new(80), &moved, MapFlags::READ),
        Err(MmuError::NoMapping(Vpfn::new(80)))
    );
}

#[test]
fn insert_flushes_tlb_only_and_freeing_teardown_flushes_everything() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    ctx.schedule(0);
    r.device.grow_pool(PageClass::Small, 4).unwrap();
    let table = ctx.table();

    r.hw.clear();
    table.map(Vpfn::new(0), &scattered(0x9000_0000, 4), RW, 0).unwrap();
    assert_eq!(
        r.hw.count(|op| matches!(op, HwOp::FlushCacheAll | HwOp::FlushCacheRange { .. })),
        0
    );
    assert_eq!(r.hw.count(|op| matches!(op, HwOp::InvalidateTlb { .. })), 1);

    r.hw.clear();
    table.unmap(Vpfn::new(0), 4).unwrap();
    assert_eq!(r.hw.count(|op| matches!(op, HwOp::FlushCacheAll)), 1);
    assert_eq!(r.device.stats().flush_cache_all, 1);
}

#[test]
fn unscheduled_tables_skip_tlb_maintenance() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    r.device.grow_pool(PageClass::Small, 4).unwrap();
    r.hw.clear();
    ctx.table()
        .map(Vpfn::new(0), &scattered(0x9000_0000, 4), RW, 0)
        .unwrap();
    assert_eq!(r.hw.count(|op| matches!(op, HwOp::InvalidateTlb { .. })), 0);
}

#[test]
fn failed_flush_resets_the_device() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    ctx.schedule(1);
    r.device.grow_pool(PageClass::Small, 4).unwrap();
    let table = ctx.table();
    table.map(Vpfn::new(0), &scattered(0x9000_0000, 4), RW, 0).unwrap();

    r.hw.fail_flushes(true);
    let err = table.unmap(Vpfn::new(0), 4).unwrap_err();
    assert!(matches!(err, MmuError::Hardware(_)));
    assert_eq!(r.hw.count(|op| matches!(op, HwOp::Reset)), 1);
    assert_eq!(r.device.stats().device_resets, 1);

    // The entries are gone and the PGDs went back to the pool regardless.
    assert!(table.translate(Vpfn::new(0)).is_none());
    assert_eq!(table.usage().pgds, 1);
}

#[test]
fn failed_map_flush_removes_the_new_entries() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    ctx.schedule(1);
    r.device.grow_pool(PageClass::Small, 4).unwrap();
    let free_before = r.device.pool().free_count(PageClass::Small);
    let table = ctx.table();
    let pages = scattered(0x9000_0000, 6);

    r.hw.fail_call(HwCall::InvalidateTlb, 0);
    assert_eq!(
        table.map(Vpfn::new(0x400), &pages, RW, 0),
        Err(MmuError::Hardware(HwError::Fault))
    );
    assert_eq!(r.hw.count(|op| matches!(op, HwOp::Reset)), 1);
    for i in 0..6 {
        assert!(table.translate(Vpfn::new(0x400 + i)).is_none());
    }
    assert_eq!(table.usage().pgds, 1);
    assert_eq!(r.device.pool().free_count(PageClass::Small), free_before);
    assert_eq!(r.device.metadata().count(PageState::PageTableMapped), 0);
    table.check_invariants().unwrap();

    r.hw.clear_failures();
    table.map(Vpfn::new(0x400), &pages, RW, 0).unwrap();
    assert_eq!(table.translate(Vpfn::new(0x405)).unwrap().pa, pages[5]);
}

#[test]
fn failed_region_flush_returns_the_backing_to_the_pool() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    ctx.schedule(1);
    r.device.grow_pool(PageClass::Small, 16).unwrap();
    let free_before = r.device.pool().free_count(PageClass::Small);
    let desc = RegionDesc::new(Vpfn::new(0x2000), 8, RegionFlags::READ | RegionFlags::WRITE);

    r.hw.fail_call(HwCall::InvalidateTlb, 0);
    assert_eq!(
        ctx.create_region(desc),
        Err(RegionError::Mmu(MmuError::Hardware(HwError::Fault)))
    );
    assert_eq!(ctx.region_count(), 0);
    assert!(ctx.table().translate(Vpfn::new(0x2000)).is_none());
    assert_eq!(ctx.table().usage().pgds, 1);
    assert_eq!(r.device.pool().free_count(PageClass::Small), free_before);
    let meta = r.device.metadata();
    assert_eq!(meta.count(PageState::DataMapped), 0);
    assert_eq!(meta.count(PageState::AllocateInProgress), 0);
    ctx.table().check_invariants().unwrap();

    // Returned pages are safe to hand out again.
    r.hw.clear_failures();
    let region = ctx.create_region(desc).unwrap();
    assert_eq!(ctx.region_backed_pages(region), Some(8));
}

#[test]
fn failed_update_flush_restores_the_old_entries() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    ctx.schedule(1);
    r.device.grow_pool(PageClass::Small, 4).unwrap();
    let table = ctx.table();
    let pages = scattered(0x9000_0000, 4);
    table.map(Vpfn::new(0x40), &pages, RW, 3).unwrap();

    r.hw.fail_call(HwCall::InvalidateTlb, 0);
    assert_eq!(
        table.update_flags(Vpfn::new(0x41), &scattered(0xB000_0000, 2), MapFlags::READ),
        Err(MmuError::Hardware(HwError::Fault))
    );
    for (i, &pa) in pages.iter().enumerate() {
        let t = table.translate(Vpfn::new(0x40 + i as u64)).unwrap();
        assert_eq!(t.pa, pa);
        assert!(t.flags.contains(MapFlags::WRITE));
        assert_eq!(t.group, 3);
    }
    table.check_invariants().unwrap();
}

#[test]
fn packed_pool_pages_hold_several_pgds() {
    let r = rig(MmuConfig::new().with_pool_page_shift(14), 8192);
    let ctx = r.device.create_context().unwrap();
    r.device.grow_pool(PageClass::Small, 4).unwrap();
    let table = ctx.table();
    assert_eq!(ctx.account().pgd_pages(), 1);

    // L1, L2 and L3 fit next to the root.
    table.map(Vpfn::new(0), &scattered(0x9000_0000, 1), RW, 0).unwrap();
    let usage = table.usage();
    assert_eq!(usage.pgds, 4);
    assert_eq!(usage.pgd_pages, 1);
    assert_eq!(ctx.account().pgd_pages(), 1);

    table.map(Vpfn::new(512), &scattered(0xA000_0000, 1), RW, 0).unwrap();
    assert_eq!(table.usage().pgd_pages, 2);
    table.check_invariants().unwrap();

    table.unmap(Vpfn::new(0), 1024).unwrap();
    let usage = table.usage();
    assert_eq!((usage.pgds, usage.pgd_pages), (1, 1));
    assert_eq!(ctx.account().pgd_pages(), 1);
}

#[test]
fn stale_mid_level_entries_are_skipped_and_counted() {
    use gpu_mmu::{EntryBits, PhysMemory, PhysicalAddress};

    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    r.device.grow_pool(PageClass::Small, 4).unwrap();
    let table = ctx.table();

    // A PTE the software tree never linked.
    let bogus = EntryBits::table(PhysicalAddress::new(0xDEAD_0000));
    r.ram.write_entry(table.root(), 5, bogus.into_bits());

    table.unmap(Vpfn::new(5 << 27), 1).unwrap();
    assert_eq!(r.device.stats().stale_entries, 1);
    assert_eq!(r.ram.read_entry(table.root(), 5), bogus.into_bits());
}

#[test]
fn out_of_range_requests_are_rejected() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    let table = ctx.table();
    let limit = gpu_mmu::VPFN_LIMIT;
    assert_eq!(
        table.map(Vpfn::new(limit - 1), &scattered(0, 2), RW, 0),
        Err(MmuError::InvalidRange)
    );
    assert_eq!(table.unmap(Vpfn::new(limit), 1), Err(MmuError::InvalidRange));
    assert_eq!(
        table.map(Vpfn::new(0), &[gpu_mmu::PhysicalAddress::new(0x1234)], RW, 0),
        Err(MmuError::InvalidRange)
    );
}
