//! NMI trap handler.
//!
//! Runs on every processor that takes the sweep NMI, at the highest
//! interrupt priority, possibly on top of code that was itself running
//! with interrupts disabled. Nothing in here may block, allocate, or log.
//! The only writes are to the processor's own capture slot and a single
//! decrement of the shared pending counter.

use core::sync::atomic::{AtomicI32, Ordering};

use crate::address::{self, AddressClass};
use crate::capture::{CaptureStore, STACK_CAPACITY};
use crate::host::{MemoryProbe, NmiTrap, ProcessorControl};

/// Trap registered with the host for the duration of one sweep.
pub struct TrapHandler<'a, H> {
    store: &'a CaptureStore,
    pending: &'a AtomicI32,
    host: &'a H,
}

impl<'a, H: ProcessorControl + MemoryProbe> TrapHandler<'a, H> {
    pub fn new(store: &'a CaptureStore, pending: &'a AtomicI32, host: &'a H) -> Self {
        Self {
            store,
            pending,
            host,
        }
    }

    /// Fill the current processor's slot from the interrupted context.
    ///
    /// A repeat NMI on a processor already captured this sweep (a timeout
    /// re-send racing a late capture) is claimed without touching the slot
    /// or the counter. Returns false only when the NMI is not ours: the
    /// processor has no slot or its slot was never armed.
    pub fn capture(&self) -> bool {
        let cpu = self.host.current_processor();
        let Some(slot) = self.store.slot(cpu) else {
            return false;
        };
        let Some(block) = slot.begin_capture() else {
            return slot.is_claimed();
        };

        let frame = self.host.interrupted_frame();

        block.rsp = frame.rsp;
        block.ss = frame.seg_ss as u16;
        block.rip = frame.rip;
        block.cs = frame.seg_cs as u16;
        block.flags = frame.rflags;
        block.dtb = self.host.read_page_table_base();
        block.usermode = address::classify(frame.rip) != AddressClass::Kernel;
        block.stack_copied_len = 0;

        // Besides interrupting CPL 3 outright, there is a short window on
        // syscall entry, right around `swapgs` and the switch to the kernel
        // stack, where Rip is kernel but Rsp is still the user stack. Only
        // copy when both point into kernel space.
        if !block.usermode && address::is_kernel_address(frame.rsp) {
            let len = address::stack_window(frame.rsp, STACK_CAPACITY);
            if len > 0 {
                // SAFETY: `stack_window` keeps the range on the page that
                // holds Rsp, which the interrupted code was using.
                unsafe { self.host.copy_from(frame.rsp, &mut block.stack[..len]) };
            }
            block.stack_copied_len = len;
        }

        block.thread_start_address = self.host.current_thread_start_address();

        slot.finish_capture();
        self.pending.fetch_sub(1, Ordering::Release);
        true
    }
}

impl<H: ProcessorControl + MemoryProbe> NmiTrap for TrapHandler<'_, H> {
    fn on_nmi(&self) -> bool {
        self.capture()
    }
}
