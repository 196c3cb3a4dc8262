//! Threaded fault queue.

use crate::device::Device;
use crate::fault::{Fault, FaultOutcome};
use log::{debug, error};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

#[derive(Default)]
struct Queue {
    pending: VecDeque<Fault>,
    in_flight: usize,
    done: Vec<(Fault, FaultOutcome)>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    work: Condvar,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A pool of threads resolving faults of one device.
pub struct FaultWorkers {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl FaultWorkers {
    pub fn spawn(device: Arc<Device>, threads: usize) -> Self {
        let shared = Arc::new(Shared::default());
        let handles = (0..threads.max(1))
            .filter_map(|i| {
                let shared = shared.clone();
                let device = device.clone();
                thread::Builder::new()
                    .name(format!("gpu-fault-{i}"))
                    .spawn(move || worker(&device, &shared))
                    .inspect_err(|e| error!("failed to spawn fault worker {i}: {e}"))
                    .ok()
            })
            .collect();
        Self {
            shared,
            threads: handles,
        }
    }

    pub fn submit(&self, fault: Fault) {
        self.shared.lock().pending.push_back(fault);
        self.shared.work.notify_one();
    }

    /// Block until the queue is drained; returns the outcomes collected so
    /// far.
    pub fn wait_idle(&self) -> Vec<(Fault, FaultOutcome)> {
        let mut q = self.shared.lock();
        while !q.pending.is_empty() || q.in_flight != 0 {
            q = self
                .shared
                .idle
                .wait(q)
                .unwrap_or_else(PoisonError::into_inner);
        }
        core::mem::take(&mut q.done)
    }

    /// Drain the queue, stop every worker and return the remaining
    /// outcomes.
    pub fn shutdown(mut self) -> Vec<(Fault, FaultOutcome)> {
        self.stop();
        core::mem::take(&mut self.shared.lock().done)
    }

    fn stop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.work.notify_all();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("fault worker panicked");
            }
        }
    }
}

impl Drop for FaultWorkers {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker(device: &Device, shared: &Shared) {
    loop {
        let fault = {
            let mut q = shared.lock();
            loop {
                if let Some(fault) = q.pending.pop_front() {
                    q.in_flight += 1;
                    break fault;
                }
                if q.shutdown {
                    debug!("fault worker exiting");
                    return;
                }
                q = shared.work.wait(q).unwrap_or_else(PoisonError::into_inner);
            }
        };

        let outcome = device.handle_fault(fault);

        let mut q = shared.lock();
        q.in_flight -= 1;
        q.done.push((fault, outcome));
        if q.pending.is_empty() && q.in_flight == 0 {
            shared.idle.notify_all();
        }
    }
}
