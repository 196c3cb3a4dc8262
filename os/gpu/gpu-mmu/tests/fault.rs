mod common;

use common::rig;
use gpu_mmu::sim::HwOp;
use gpu_mmu::{
    Access, Fault, FaultOutcome, FaultWorkers, KillReason, MmuConfig, PageClass, PageState,
    RegionDesc, RegionError, RegionFlags, Vpfn,
};
use std::sync::Arc;

const RW: RegionFlags = RegionFlags::READ.union(RegionFlags::WRITE);

fn growable(start: u64, pages: u64, extension: u64) -> RegionDesc {
    RegionDesc::new(Vpfn::new(start), pages, RW | RegionFlags::GROWABLE)
        .with_initial_commit(0)
        .with_extension(extension)
}

#[test]
fn fault_grows_by_the_extension_step() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    ctx.schedule(3);
    let region = ctx.create_region(growable(0x1000, 256, 16)).unwrap();
    assert_eq!(ctx.region_backed_pages(region), Some(0));

    let outcome = r
        .device
        .handle_fault(Fault::translation(ctx.id(), Vpfn::new(0x1005), Access::Write));
    assert_eq!(outcome, FaultOutcome::Resumed { grown: 16 });
    assert_eq!(ctx.region_backed_pages(region), Some(16));
    assert!(ctx.table().translate(Vpfn::new(0x1000)).is_some());
    assert!(ctx.table().translate(Vpfn::new(0x100F)).is_some());
    assert!(ctx.table().translate(Vpfn::new(0x1010)).is_none());
    assert_eq!(r.hw.count(|op| *op == HwOp::Resume { as_nr: 3 }), 1);
    assert_eq!(ctx.account().data_pages(), 16);

    // Past the backing again: the next step, still aligned to 16.
    let outcome = r
        .device
        .handle_fault(Fault::translation(ctx.id(), Vpfn::new(0x1014), Access::Read));
    assert_eq!(outcome, FaultOutcome::Resumed { grown: 16 });
    assert_eq!(ctx.region_backed_pages(region), Some(32));

    let stats = r.device.stats();
    assert_eq!(stats.faults_resolved, 2);
    assert!(stats.fault_pool_grows >= 1);
    ctx.table().check_invariants().unwrap();
}

#[test]
fn stuck_hardware_during_growth_kills_and_returns_the_pages() {
    let r = rig(MmuConfig::new().with_hw_busy_retries(4), 8192);
    let ctx = r.device.create_context().unwrap();
    ctx.schedule(2);
    let region = ctx.create_region(growable(0x1000, 64, 16)).unwrap();
    r.device.grow_pool(PageClass::Small, 32).unwrap();
    let free_before = r.device.pool().free_count(PageClass::Small);

    r.hw.inject_busy(10_000);
    let outcome = r
        .device
        .handle_fault(Fault::translation(ctx.id(), Vpfn::new(0x1003), Access::Read));
    assert_eq!(outcome, FaultOutcome::Killed(KillReason::Hardware));
    assert_eq!(r.hw.count(|op| *op == HwOp::Reset), 1);

    assert_eq!(ctx.region_backed_pages(region), Some(0));
    assert!(ctx.table().translate(Vpfn::new(0x1000)).is_none());
    assert_eq!(ctx.table().usage().pgds, 1);
    assert_eq!(ctx.account().data_pages(), 0);
    assert_eq!(r.device.pool().free_count(PageClass::Small), free_before);
    assert_eq!(r.device.metadata().count(PageState::DataMapped), 0);
    ctx.table().check_invariants().unwrap();
}

#[test]
fn growth_stops_at_the_end_of_the_region() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    let region = ctx.create_region(growable(0x1000, 24, 16)).unwrap();
    let fault = |vpfn| Fault::translation(ctx.id(), Vpfn::new(vpfn), Access::Read);

    assert_eq!(r.device.handle_fault(fault(0x1000)), FaultOutcome::Resumed { grown: 16 });
    assert_eq!(r.device.handle_fault(fault(0x1017)), FaultOutcome::Resumed { grown: 8 });
    assert_eq!(ctx.region_backed_pages(region), Some(24));
}

#[test]
fn duplicate_fault_only_resumes() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    ctx.schedule(1);
    let region = ctx.create_region(growable(0x1000, 64, 16)).unwrap();
    let fault = Fault::translation(ctx.id(), Vpfn::new(0x1003), Access::Read);
    r.device.handle_fault(fault);
    let backed = ctx.region_backed_pages(region);

    r.hw.clear();
    assert_eq!(r.device.handle_fault(fault), FaultOutcome::Duplicate);
    assert_eq!(ctx.region_backed_pages(region), backed);
    assert_eq!(r.hw.ops(), vec![HwOp::Resume { as_nr: 1 }]);

    // A permission fault the region allows is a duplicate as well.
    let permission = Fault::permission(ctx.id(), Vpfn::new(0x1003), Access::Write);
    assert_eq!(r.device.handle_fault(permission), FaultOutcome::Duplicate);
    assert_eq!(r.device.stats().faults_duplicate, 2);
}

#[test]
fn faults_outside_any_region_kill_the_context() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    ctx.schedule(4);
    ctx.create_region(growable(0x1000, 64, 16)).unwrap();

    let outcome = r
        .device
        .handle_fault(Fault::translation(ctx.id(), Vpfn::new(0x2000), Access::Read));
    assert_eq!(outcome, FaultOutcome::Killed(KillReason::Unmapped));
    assert_eq!(ctx.kill_reason(), Some(KillReason::Unmapped));
    assert_eq!(ctx.table().address_space(), None);

    // Later faults report the first reason; new regions are refused.
    let outcome = r
        .device
        .handle_fault(Fault::translation(ctx.id(), Vpfn::new(0x1000), Access::Read));
    assert_eq!(outcome, FaultOutcome::Killed(KillReason::Unmapped));
    assert_eq!(
        ctx.create_region(growable(0x4000, 16, 0)),
        Err(RegionError::ContextKilled)
    );
    assert_eq!(r.device.stats().faults_killed, 1);
}

#[test]
fn access_violations_kill_the_context() {
    let cases = [
        (RegionFlags::READ, Access::Write, KillReason::WriteDenied),
        (RegionFlags::WRITE, Access::Read, KillReason::ReadDenied),
        (RW, Access::Execute, KillReason::ExecuteDenied),
    ];
    for (flags, access, reason) in cases {
        let r = rig(MmuConfig::new(), 8192);
        let ctx = r.device.create_context().unwrap();
        let desc = RegionDesc::new(Vpfn::new(0x1000), 16, flags | RegionFlags::GROWABLE)
            .with_initial_commit(0);
        ctx.create_region(desc).unwrap();
        let outcome = r
            .device
            .handle_fault(Fault::permission(ctx.id(), Vpfn::new(0x1000), access));
        assert_eq!(outcome, FaultOutcome::Killed(reason));
    }
}

#[test]
fn fixed_regions_do_not_grow() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    let region = ctx
        .create_region(RegionDesc::new(Vpfn::new(0x1000), 32, RW).with_initial_commit(8))
        .unwrap();
    assert_eq!(ctx.region_backed_pages(region), Some(8));

    let outcome = r
        .device
        .handle_fault(Fault::translation(ctx.id(), Vpfn::new(0x1008), Access::Read));
    assert_eq!(outcome, FaultOutcome::Killed(KillReason::NotGrowable));
}

#[test]
fn exhausted_system_memory_kills_with_out_of_memory() {
    // Two roots, nothing else.
    let r = rig(MmuConfig::new(), 2);
    let ctx = r.device.create_context().unwrap();
    ctx.create_region(growable(0x1000, 64, 16)).unwrap();

    let outcome = r
        .device
        .handle_fault(Fault::translation(ctx.id(), Vpfn::new(0x1000), Access::Read));
    assert_eq!(outcome, FaultOutcome::Killed(KillReason::OutOfMemory));
    assert_eq!(r.frames.outstanding(), 2);
}

#[test]
fn missing_page_tables_grow_the_pool_and_retry() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    let region = ctx.create_region(growable(0x1000, 64, 16)).unwrap();
    // Data pages are there, PGDs are not.
    r.device.grow_pool(PageClass::Small, 16).unwrap();

    let outcome = r
        .device
        .handle_fault(Fault::translation(ctx.id(), Vpfn::new(0x1000), Access::Read));
    assert_eq!(outcome, FaultOutcome::Resumed { grown: 16 });
    assert_eq!(ctx.region_backed_pages(region), Some(16));
    assert_eq!(r.device.stats().fault_pool_grows, 1);
    assert_eq!(r.device.pool().free_count(PageClass::Small), 0);
    assert_eq!(ctx.account().pgd_pages(), 4);
}

#[test]
fn faults_for_destroyed_contexts_are_ignored() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    ctx.create_region(growable(0x1000, 64, 16)).unwrap();
    let id = ctx.id();
    r.device.destroy_context(id).unwrap();

    let outcome = r
        .device
        .handle_fault(Fault::translation(id, Vpfn::new(0x1000), Access::Read));
    assert_eq!(outcome, FaultOutcome::ContextGone);
    assert!(ctx.is_destroyed());
    drop(ctx);
    assert_eq!(r.device.context_count(), 0);
}

#[test]
fn large_page_regions_are_backed_by_huge_entries() {
    let r = rig(MmuConfig::new(), 8192);
    let ctx = r.device.create_context().unwrap();
    let desc = RegionDesc::new(Vpfn::new(1024), 2048, RW | RegionFlags::LARGE_PAGES | RegionFlags::GROWABLE)
        .with_initial_commit(512);
    let region = ctx.create_region(desc).unwrap();
    assert_eq!(ctx.region_backed_pages(region), Some(512));
    assert_eq!(ctx.table().translate(Vpfn::new(1024)).unwrap().level, gpu_mmu::Level::HUGE);

    let outcome = r
        .device
        .handle_fault(Fault::translation(ctx.id(), Vpfn::new(1600), Access::Write));
    assert_eq!(outcome, FaultOutcome::Resumed { grown: 512 });
    assert_eq!(ctx.region_backing(region).unwrap().len(), 2);
    assert_eq!(r.device.pool().in_use(PageClass::Large), 2);

    ctx.free_region(region).unwrap();
    assert_eq!(r.device.pool().in_use(PageClass::Large), 0);
    assert_eq!(ctx.table().usage().pgds, 1);
}

#[test]
fn worker_pool_resolves_concurrent_faults() {
    // Concurrent faults may consume each other's pool growth.
    let r = rig(MmuConfig::new().with_max_fault_retries(64), 16384);
    let ctx = r.device.create_context().unwrap();
    ctx.schedule(0);
    let region = ctx.create_region(growable(0x10000, 1024, 16)).unwrap();

    let workers = FaultWorkers::spawn(Arc::clone(&r.device), 4);
    let vpfns: Vec<u64> = (0..64).map(|i| 0x10000 + (i * 37) % 1024).collect();
    for &v in &vpfns {
        workers.submit(Fault::translation(ctx.id(), Vpfn::new(v), Access::Write));
    }
    let outcomes = workers.wait_idle();
    assert_eq!(outcomes.len(), vpfns.len());
    assert!(outcomes.iter().all(|(_, o)| matches!(
        o,
        FaultOutcome::Resumed { .. } | FaultOutcome::Duplicate
    )));

    for &v in &vpfns {
        assert!(ctx.table().translate(Vpfn::new(v)).is_some(), "{v:#x}");
    }
    let backed = ctx.region_backed_pages(region).unwrap();
    assert_eq!(backed % 16, 0);
    ctx.table().check_invariants().unwrap();
    assert!(workers.shutdown().is_empty());
}
