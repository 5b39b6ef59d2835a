//! Post-sweep analysis.
//!
//! Runs after the completion barrier, in normal thread context. Every
//! filled slot is consumed exactly once: kernel-mode samples have their
//! Rip resolved against the loaded modules, and an unresolved Rip is
//! reported as an anomaly together with a scan of the captured stack.
//! Each slot is zeroed after it is consumed.

use alloc::vec::Vec;

use crate::address;
use crate::capture::{CaptureBlock, CaptureStore};
use crate::host::MemoryProbe;
use crate::modules::{self, ModuleDirectory, ModuleHit};

/// A value found on a captured stack that points at mapped memory.
///
/// This is a possible return address, not an unwound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackHit {
    /// Where on the interrupted stack the value was found (`rsp + offset`).
    pub location: u64,
    pub value: u64,
    /// Module containing `value`, if any.
    pub module: Option<ModuleHit>,
}

/// Kernel-mode execution from an address no loaded module covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anomaly {
    pub cpu: usize,
    pub rip: u64,
    pub rsp: u64,
    pub cs: u16,
    pub ss: u16,
    pub flags: u64,
    pub dtb: u64,
    pub thread_start_address: u64,
    pub thread_start_module: Option<ModuleHit>,
    pub stack_copied_len: usize,
    pub stack_hits: Vec<StackHit>,
}

/// Result of one analysis pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Analysis {
    /// Kernel-mode samples inspected.
    pub kernel_samples: usize,
    /// User-mode samples skipped.
    pub user_samples: usize,
    pub anomalies: Vec<Anomaly>,
}

impl Analysis {
    pub fn samples(&self) -> usize {
        self.kernel_samples + self.user_samples
    }
}

/// Consume every filled slot in `store`.
///
/// # Arguments
/// * `store` - Capture store, after the sweep barrier
/// * `dir` - Loaded-module directory to resolve against
/// * `probe` - Page-presence probe used to filter stack values
/// * `scan_stack` - Whether to scan anomalous stacks for module pointers
pub fn analyze<D, P>(store: &mut CaptureStore, dir: &D, probe: &P, scan_stack: bool) -> Analysis
where
    D: ModuleDirectory + ?Sized,
    P: MemoryProbe + ?Sized,
{
    let mut analysis = Analysis::default();

    store.drain_captured(|cpu, block| {
        if block.usermode {
            analysis.user_samples += 1;
            return;
        }
        analysis.kernel_samples += 1;

        if let Some(module) = modules::find_module(block.rip, dir) {
            log::debug!(
                "analysis: cpu{} rip={:#x} in {}+{:#x}",
                cpu,
                block.rip,
                module.name,
                module.offset_of(block.rip)
            );
            return;
        }

        analysis
            .anomalies
            .push(inspect_anomaly(cpu, block, dir, probe, scan_stack));
    });

    analysis
}

fn inspect_anomaly<D, P>(
    cpu: usize,
    block: &CaptureBlock,
    dir: &D,
    probe: &P,
    scan_stack: bool,
) -> Anomaly
where
    D: ModuleDirectory + ?Sized,
    P: MemoryProbe + ?Sized,
{
    let thread_start_module = modules::resolve(block.thread_start_address, dir);

    log::warn!(
        "analysis: cpu{} executing unbacked code at rip={:#x} (cr3={:#x})",
        cpu,
        block.rip,
        block.dtb
    );
    match &thread_start_module {
        Some(hit) => log::warn!(
            "analysis: thread start address: {:#x} ({}) @ {:#x} ({:#x})",
            block.thread_start_address,
            hit,
            block.rsp,
            block.stack_copied_len
        ),
        None => log::warn!(
            "analysis: thread start address: {:#x} @ {:#x} ({:#x})",
            block.thread_start_address,
            block.rsp,
            block.stack_copied_len
        ),
    }

    let stack_hits = if scan_stack {
        scan_stack_words(block, dir, probe)
    } else {
        Vec::new()
    };

    Anomaly {
        cpu,
        rip: block.rip,
        rsp: block.rsp,
        cs: block.cs,
        ss: block.ss,
        flags: block.flags,
        dtb: block.dtb,
        thread_start_address: block.thread_start_address,
        thread_start_module,
        stack_copied_len: block.stack_copied_len,
        stack_hits,
    }
}

/// Report every pointer-sized stack value that looks like a live address.
///
/// Kernel-half values are reported whether or not a module covers them.
/// Lower-half values are reported only when they resolve: a kernel stack
/// routinely holds the interrupted thread's saved user Rip and Rsp, which
/// are mapped in the current process but say nothing about kernel code.
fn scan_stack_words<D, P>(block: &CaptureBlock, dir: &D, probe: &P) -> Vec<StackHit>
where
    D: ModuleDirectory + ?Sized,
    P: MemoryProbe + ?Sized,
{
    let mut hits = Vec::new();

    for (offset, value) in block.stack_words() {
        if !address::is_inspectable(value, probe) {
            continue;
        }

        let module = modules::resolve(value, dir);
        if module.is_none() && !address::is_kernel_address(value) {
            continue;
        }

        let location = block.rsp.wrapping_add(offset as u64);
        match &module {
            Some(hit) => log::info!("analysis: address in stack @ {:#x}: {:#x} ({})", location, value, hit),
            None => log::info!("analysis: address in stack @ {:#x}: {:#x}", location, value),
        }

        hits.push(StackHit {
            location,
            value,
            module,
        });
    }

    hits
}
