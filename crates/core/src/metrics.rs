use crate::SimulationObserver;
use chipcheck_selftest::{Corruption, Phase};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct RunMetrics {
    pass_count: AtomicU64,
    cells_verified: AtomicU64,
    heartbeat_count: AtomicU64,
    latched: AtomicBool,
    start_time: Instant,
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RunMetrics {
    pub fn new() -> Self {
        Self {
            pass_count: AtomicU64::new(0),
            cells_verified: AtomicU64::new(0),
            heartbeat_count: AtomicU64::new(0),
            latched: AtomicBool::new(false),
            start_time: Instant::now(),
        }
    }

    pub fn get_passes(&self) -> u64 {
        self.pass_count.load(Ordering::SeqCst)
    }

    /// Cells written and read back in completed passes.
    pub fn get_cells_verified(&self) -> u64 {
        self.cells_verified.load(Ordering::SeqCst)
    }

    pub fn get_heartbeats(&self) -> u64 {
        self.heartbeat_count.load(Ordering::SeqCst)
    }

    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::SeqCst)
    }

    /// Memory throughput in cells per host second.
    pub fn get_cells_per_sec(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.get_cells_verified() as f64 / elapsed
        } else {
            0.0
        }
    }
}

impl SimulationObserver for RunMetrics {
    fn on_pass_complete(&self, _pass: u64, cells: usize) {
        self.pass_count.fetch_add(1, Ordering::SeqCst);
        self.cells_verified.fetch_add(cells as u64, Ordering::SeqCst);
    }

    fn on_heartbeat(&self, _firing: u64, _phase: Phase) {
        self.heartbeat_count.fetch_add(1, Ordering::SeqCst);
    }

    fn on_latch(&self, _corruption: &Corruption) {
        self.latched.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = RunMetrics::new();
        metrics.on_pass_complete(1, 4864);
        metrics.on_pass_complete(2, 4864);
        metrics.on_heartbeat(1, Phase::On);
        assert_eq!(metrics.get_passes(), 2);
        assert_eq!(metrics.get_cells_verified(), 2 * 4864);
        assert_eq!(metrics.get_heartbeats(), 1);
        assert!(!metrics.is_latched());

        metrics.on_latch(&Corruption {
            address: 0x2000_0400,
            cell: 0,
            expected: 1,
            actual: 0,
        });
        assert!(metrics.is_latched());
        assert_eq!(metrics.get_passes(), 2);
    }
}
