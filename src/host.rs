//! Interfaces to the host kernel.
//!
//! The sweep needs three facilities it does not own: per-processor control
//! (processor index, control registers, the interrupted frame), a memory
//! probe, and the NMI dispatch machinery. A kernel embedding this crate
//! implements the traits below; the tests implement them with threads.

use crate::affinity::AffinityMask;

/// Machine frame pushed by the processor when the NMI arrived.
///
/// On x86_64 this sits at the top of the NMI interrupt stack
/// (`TSS.IST[n] - size_of::<MachineFrame>()`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MachineFrame {
    pub rip: u64,
    pub seg_cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub seg_ss: u64,
}

const _: () = assert!(core::mem::size_of::<MachineFrame>() == 40);

/// Per-processor facilities.
///
/// Every method except `max_processor_count` and `delay_us` is called from
/// NMI context and must not block, allocate, or take locks.
pub trait ProcessorControl: Sync {
    /// Index of the processor running the caller.
    fn current_processor(&self) -> usize;

    /// Maximum number of logical processors the host can report.
    fn max_processor_count(&self) -> usize;

    /// Current page-table base (CR3 on x86_64).
    fn read_page_table_base(&self) -> u64;

    /// Machine state of the code the NMI interrupted on this processor.
    fn interrupted_frame(&self) -> MachineFrame;

    /// Start address of the thread currently scheduled on this processor.
    fn current_thread_start_address(&self) -> u64;

    /// Sleep the calling thread for roughly `us` microseconds.
    fn delay_us(&self, us: u64);
}

/// Memory presence checks and raw reads.
pub trait MemoryProbe: Sync {
    /// Whether `addr` is mapped and resident right now.
    fn is_address_valid(&self, addr: u64) -> bool;

    /// Copy `dst.len()` bytes starting at `addr`.
    ///
    /// # Safety
    /// The whole range `addr..addr + dst.len()` must be mapped and resident.
    unsafe fn copy_from(&self, addr: u64, dst: &mut [u8]) {
        unsafe {
            core::ptr::copy_nonoverlapping(addr as *const u8, dst.as_mut_ptr(), dst.len());
        }
    }
}

/// Callback the host runs on every processor that takes an NMI.
pub trait NmiTrap: Sync {
    /// Returns `true` if the NMI was consumed by this trap.
    fn on_nmi(&self) -> bool;
}

/// The host's NMI callback registry and inter-processor NMI primitive.
pub trait NmiDispatch {
    /// Opaque handle returned by a successful registration.
    type Registration;

    /// Install `trap` in the NMI callback chain.
    ///
    /// The host may invoke `trap` on any processor from the moment this
    /// returns until `deregister` returns. Returns `None` if the host
    /// refused the registration.
    fn register(&self, trap: &dyn NmiTrap) -> Option<Self::Registration>;

    /// Remove a previously installed trap.
    ///
    /// Must not return while any invocation of the trap is still running.
    fn deregister(&self, registration: Self::Registration);

    /// Fire an NMI at every processor in `target`. No acknowledgement.
    fn send_nmi(&self, target: &AffinityMask);
}

/// Everything a sweep needs from the host.
pub trait Host: ProcessorControl + MemoryProbe + NmiDispatch {}

impl<T: ProcessorControl + MemoryProbe + NmiDispatch> Host for T {}
