//! Sweep coordinator.
//!
//! One sweep:
//! 1. Arm a slot per processor and set the pending counter to the
//!    processor count.
//! 2. Register the trap handler with the host's NMI dispatch.
//! 3. Fire an NMI at each processor in index order, sleeping briefly
//!    between them. Some hardware drops or coalesces NMIs sent to many
//!    processors at once.
//! 4. Poll until every processor has acknowledged.
//! 5. Deregister the trap, then analyze and clear every filled slot.
//!
//! With the default configuration step 4 has no timeout: a processor that
//! never takes the NMI stalls the sweep forever. Set
//! `SweepConfig::max_poll_iterations` to bound the wait; processors that
//! still have not answered after the re-sends are reported as unresponsive.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, Ordering};

use spin::Mutex;

use crate::affinity::{AffinityMask, MAX_PROCESSORS};
use crate::analysis::{self, Anomaly};
use crate::capture::CaptureStore;
use crate::host::Host;
use crate::modules::ModuleDirectory;
use crate::platform;
use crate::stats::{StatsSnapshot, SweepStats};
use crate::trap::TrapHandler;

/// Error types for sweep operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The host refused the NMI callback registration. No data was collected.
    NmiRegistration,
    /// Another sweep is running on the same capture store.
    SweepInProgress,
    /// The host reports more processors than the store or a mask can hold.
    TooManyProcessors { count: usize, capacity: usize },
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NmiRegistration => write!(f, "NMI callback registration failed"),
            Self::SweepInProgress => write!(f, "Sweep already in progress"),
            Self::TooManyProcessors { count, capacity } => write!(
                f,
                "Too many processors: {} reported, capacity {}",
                count, capacity
            ),
        }
    }
}

impl core::error::Error for Error {}

/// Sweep tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepConfig {
    /// Sleep between NMIs to consecutive processors.
    pub stagger_delay_us: u64,
    /// Sleep between barrier polls.
    pub poll_interval_us: u64,
    /// Polls before re-sending to pending processors. `None` waits forever.
    pub max_poll_iterations: Option<u32>,
    /// Re-send rounds before giving up on pending processors.
    pub max_resends: u32,
    /// Scan anomalous stacks for module pointers.
    pub scan_stack: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            stagger_delay_us: 50,
            poll_interval_us: 50,
            max_poll_iterations: None,
            max_resends: 1,
            scan_stack: true,
        }
    }
}

impl SweepConfig {
    pub fn with_stagger_delay_us(mut self, us: u64) -> Self {
        self.stagger_delay_us = us;
        self
    }

    pub fn with_poll_interval_us(mut self, us: u64) -> Self {
        self.poll_interval_us = us;
        self
    }

    /// Bound the barrier wait to `polls` iterations per round.
    pub fn with_timeout(mut self, polls: u32, resends: u32) -> Self {
        self.max_poll_iterations = Some(polls);
        self.max_resends = resends;
        self
    }

    pub fn with_stack_scan(mut self, enabled: bool) -> Self {
        self.scan_stack = enabled;
        self
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Sequence number of this sweep, starting at 1.
    pub sequence: u64,
    /// Processors the NMI was sent to.
    pub processors: usize,
    pub kernel_samples: usize,
    pub user_samples: usize,
    pub anomalies: Vec<Anomaly>,
    /// Processors that never acknowledged the NMI.
    pub unresponsive: Vec<usize>,
    pub elapsed_ns: u64,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty() && self.unresponsive.is_empty()
    }
}

/// Drives sweeps over a capture store owned for the sweeper's lifetime.
pub struct Sweeper<H: Host> {
    host: H,
    store: Mutex<CaptureStore>,
    config: SweepConfig,
    stats: SweepStats,
}

impl<H: Host> Sweeper<H> {
    /// Create a sweeper with a slot for every processor the host can report.
    pub fn new(host: H, config: SweepConfig) -> Self {
        let capacity = host.max_processor_count().min(MAX_PROCESSORS);
        log::debug!("nmi_sweep: allocated {} capture slots", capacity);
        Self {
            host,
            store: Mutex::new(CaptureStore::new(capacity)),
            config,
            stats: SweepStats::new(),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Run one sweep and analyze it against `modules`.
    ///
    /// Returns `Error::SweepInProgress` if another sweep holds the store.
    pub fn run<D: ModuleDirectory + ?Sized>(&self, modules: &D) -> Result<SweepReport, Error> {
        let mut store = self.store.try_lock().ok_or(Error::SweepInProgress)?;

        let cpu_count = self.host.max_processor_count();
        if cpu_count > store.capacity() {
            log::error!(
                "nmi_sweep: host reports {} processors, only {} slots",
                cpu_count,
                store.capacity()
            );
            return Err(Error::TooManyProcessors {
                count: cpu_count,
                capacity: store.capacity(),
            });
        }

        let started = platform::time_ns();
        log::debug!(
            "nmi_sweep: sweeping {} processors from cpu{}",
            cpu_count,
            self.host.current_processor()
        );

        store.arm(cpu_count);
        self.interrupt_all(&store, cpu_count)?;

        let unresponsive = store.disarm_pending(cpu_count);
        for cpu in &unresponsive {
            log::warn!("nmi_sweep: cpu{} never acknowledged the NMI", cpu);
        }

        let result = analysis::analyze(&mut store, modules, &self.host, self.config.scan_stack);

        let finished = platform::time_ns();
        let sequence = self.stats.record_sweep(
            finished,
            result.kernel_samples,
            result.user_samples,
            result.anomalies.len(),
            unresponsive.len(),
        );

        log::info!(
            "nmi_sweep: sweep #{} done: {} kernel, {} user, {} anomalies, {} unresponsive",
            sequence,
            result.kernel_samples,
            result.user_samples,
            result.anomalies.len(),
            unresponsive.len()
        );

        Ok(SweepReport {
            sequence,
            processors: cpu_count,
            kernel_samples: result.kernel_samples,
            user_samples: result.user_samples,
            anomalies: result.anomalies,
            unresponsive,
            elapsed_ns: finished.saturating_sub(started),
        })
    }

    /// Register the trap, interrupt every processor, wait, deregister.
    fn interrupt_all(&self, store: &CaptureStore, cpu_count: usize) -> Result<(), Error> {
        let pending = AtomicI32::new(cpu_count as i32);
        let trap = TrapHandler::new(store, &pending, &self.host);

        let Some(registration) = self.host.register(&trap) else {
            log::error!("nmi_sweep: NMI callback registration failed");
            store.disarm_pending(cpu_count);
            return Err(Error::NmiRegistration);
        };

        for cpu in 0..cpu_count {
            log::trace!("nmi_sweep: NMI -> cpu{}", cpu);
            self.host.send_nmi(&AffinityMask::single(cpu));
            self.host.delay_us(self.config.stagger_delay_us);
        }

        let completed = self.wait_for_barrier(store, &pending, cpu_count);
        self.host.deregister(registration);

        if !completed {
            log::warn!(
                "nmi_sweep: barrier timed out with {} processors pending",
                pending.load(Ordering::Acquire)
            );
        }
        Ok(())
    }

    /// Poll the pending counter until it reaches zero.
    ///
    /// Returns false if the configured poll budget ran out.
    fn wait_for_barrier(&self, store: &CaptureStore, pending: &AtomicI32, cpu_count: usize) -> bool {
        let mut interval = self.config.poll_interval_us;
        let mut polls: u32 = 0;
        let mut resends: u32 = 0;

        loop {
            if pending.load(Ordering::Acquire) <= 0 {
                return true;
            }

            if let Some(max) = self.config.max_poll_iterations {
                if polls >= max {
                    if resends >= self.config.max_resends {
                        return false;
                    }
                    resends += 1;
                    polls = 0;
                    interval = interval.saturating_mul(2);
                    for cpu in store.armed(cpu_count) {
                        log::warn!("nmi_sweep: re-sending NMI to cpu{} (attempt {})", cpu, resends);
                        self.host.send_nmi(&AffinityMask::single(cpu));
                    }
                }
            }

            self.host.delay_us(interval);
            polls += 1;
        }
    }
}
