//! Cumulative sweep statistics.

use core::sync::atomic::{AtomicU64, Ordering};

/// Counters accumulated across sweeps.
#[derive(Debug)]
pub struct SweepStats {
    /// Completed sweeps.
    sweeps: AtomicU64,
    /// Kernel-mode samples inspected.
    kernel_samples: AtomicU64,
    /// User-mode samples skipped.
    user_samples: AtomicU64,
    /// Samples whose Rip resolved to no module.
    anomalies: AtomicU64,
    /// Processors that never acknowledged an NMI.
    unresponsive: AtomicU64,
    /// Timestamp of the last completed sweep.
    last_sweep_ns: AtomicU64,
}

impl SweepStats {
    pub const fn new() -> Self {
        Self {
            sweeps: AtomicU64::new(0),
            kernel_samples: AtomicU64::new(0),
            user_samples: AtomicU64::new(0),
            anomalies: AtomicU64::new(0),
            unresponsive: AtomicU64::new(0),
            last_sweep_ns: AtomicU64::new(0),
        }
    }

    /// Record one completed sweep. Returns the sweep's sequence number.
    pub fn record_sweep(
        &self,
        timestamp: u64,
        kernel_samples: usize,
        user_samples: usize,
        anomalies: usize,
        unresponsive: usize,
    ) -> u64 {
        self.kernel_samples
            .fetch_add(kernel_samples as u64, Ordering::Relaxed);
        self.user_samples
            .fetch_add(user_samples as u64, Ordering::Relaxed);
        self.anomalies.fetch_add(anomalies as u64, Ordering::Relaxed);
        self.unresponsive
            .fetch_add(unresponsive as u64, Ordering::Relaxed);
        self.last_sweep_ns.store(timestamp, Ordering::Relaxed);
        self.sweeps.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            kernel_samples: self.kernel_samples.load(Ordering::Relaxed),
            user_samples: self.user_samples.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
            unresponsive: self.unresponsive.load(Ordering::Relaxed),
            last_sweep_ns: self.last_sweep_ns.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.sweeps.store(0, Ordering::Relaxed);
        self.kernel_samples.store(0, Ordering::Relaxed);
        self.user_samples.store(0, Ordering::Relaxed);
        self.anomalies.store(0, Ordering::Relaxed);
        self.unresponsive.store(0, Ordering::Relaxed);
        self.last_sweep_ns.store(0, Ordering::Relaxed);
    }
}

impl Default for SweepStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable snapshot of sweep statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sweeps: u64,
    pub kernel_samples: u64,
    pub user_samples: u64,
    pub anomalies: u64,
    pub unresponsive: u64,
    pub last_sweep_ns: u64,
}
