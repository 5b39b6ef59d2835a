//! NMI processor sweep
//!
//! Interrupts every logical processor with a non-maskable interrupt at
//! (nearly) the same instant, captures what each one was executing, and
//! flags kernel-mode execution from memory that no loaded module covers.
//!
//! # Features
//!
//! - `ldr` - Walker for the kernel loader's module list (default)
//! - `axhal` - Monotonic sweep clock through axhal
//!
//! # Quick Start
//!
//! ```ignore
//! use nmi_sweep::{SweepConfig, Sweeper};
//! use nmi_sweep::modules::ldr::LdrModuleList;
//!
//! nmi_sweep::init();
//!
//! let sweeper = Sweeper::new(KernelHost::new(), SweepConfig::default());
//! let modules = unsafe { LdrModuleList::from_anchor(self_entry, Some(list_head)) }?;
//!
//! let report = sweeper.run(&modules)?;
//! for anomaly in &report.anomalies {
//!     println!("cpu{}: unbacked rip {:#x}", anomaly.cpu, anomaly.rip);
//! }
//! ```

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

// =============================================================================
// Platform Abstraction (for testing support)
// =============================================================================

pub mod platform;

pub mod host;

// =============================================================================
// Capture
// =============================================================================

pub mod address;

pub mod affinity;

pub mod capture;

pub mod trap;

// =============================================================================
// Analysis
// =============================================================================

pub mod modules;

pub mod analysis;

pub mod stats;

pub mod sweep;

// Re-export key types for convenience
pub use analysis::{Analysis, Anomaly, StackHit};
pub use capture::{CaptureBlock, CaptureStore, STACK_CAPACITY};
pub use host::{Host, MachineFrame, MemoryProbe, NmiDispatch, NmiTrap, ProcessorControl};
pub use modules::{ModuleDescriptor, ModuleDirectory, ModuleHit, ModuleRing, find_module};
pub use sweep::{Error as SweepError, SweepConfig, SweepReport, Sweeper};

// =============================================================================
// Initialization
// =============================================================================

/// Log the enabled parts of the subsystem.
///
/// Call once during driver initialization, after the logger is installed.
pub fn init() {
    info!("Initializing nmi_sweep...");
    info!(
        "  - capture slots: {} bytes of stack per processor, up to {} processors",
        STACK_CAPACITY,
        affinity::MAX_PROCESSORS
    );

    #[cfg(feature = "ldr")]
    info!("  - loader module list walker enabled");

    #[cfg(feature = "axhal")]
    info!("  - platform: axhal");

    info!("nmi_sweep initialization complete");
}
