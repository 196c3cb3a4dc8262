#![allow(dead_code)]

use gpu_mmu::sim::{SimulatedFrames, SimulatedHardware, SimulatedRam};
use gpu_mmu::{Device, MmuConfig, PhysicalAddress};
use std::sync::Arc;

pub struct Rig {
    pub device: Arc<Device>,
    pub ram: Arc<SimulatedRam>,
    pub frames: SimulatedFrames,
    pub hw: Arc<SimulatedHardware>,
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn rig(config: MmuConfig, frame_limit: usize) -> Rig {
    rig_with(config, frame_limit, SimulatedHardware::new())
}

pub fn rig_with(config: MmuConfig, frame_limit: usize, hw: SimulatedHardware) -> Rig {
    init_logging();
    let ram = Arc::new(SimulatedRam::new());
    let frames = SimulatedFrames::new(frame_limit);
    let hw = Arc::new(hw);
    let device = Device::new(config, ram.clone(), Box::new(frames.clone()), hw.clone())
        .expect("device bring-up");
    Rig {
        device: Arc::new(device),
        ram,
        frames,
        hw,
    }
}

/// `count` physically contiguous 4 KiB pages starting at `base`.
pub fn run(base: u64, count: usize) -> Vec<PhysicalAddress> {
    (0..count as u64)
        .map(|i| PhysicalAddress::new(base + i * 4096))
        .collect()
}

/// `count` pages that are never contiguous, so no huge entry is possible.
pub fn scattered(base: u64, count: usize) -> Vec<PhysicalAddress> {
    (0..count as u64)
        .map(|i| PhysicalAddress::new(base + i * 2 * 4096))
        .collect()
}
