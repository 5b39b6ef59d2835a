//! Per-processor capture store.
//!
//! One `CaptureSlot` per logical processor, indexed by processor number and
//! allocated once for the lifetime of the sweeper. During a sweep each slot
//! is written only by the processor it belongs to; the coordinator reads it
//! only after the completion barrier.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::address::PAGE_SIZE;

/// Capacity of the per-processor stack snapshot (one kernel stack page).
pub const STACK_CAPACITY: usize = PAGE_SIZE as usize;

/// Execution state captured on one processor.
#[repr(C)]
#[derive(Clone)]
pub struct CaptureBlock {
    pub rsp: u64,
    pub rip: u64,
    pub cs: u16,
    pub ss: u16,
    pub flags: u64,
    /// Page-table base active at interrupt time.
    pub dtb: u64,
    /// Rip sits in the lower canonical half. Address-shape heuristic only.
    pub usermode: bool,
    pub thread_start_address: u64,
    /// Valid bytes at the front of `stack`.
    pub stack_copied_len: usize,
    pub stack: [u8; STACK_CAPACITY],
}

impl CaptureBlock {
    pub const ZEROED: Self = Self {
        rsp: 0,
        rip: 0,
        cs: 0,
        ss: 0,
        flags: 0,
        dtb: 0,
        usermode: false,
        thread_start_address: 0,
        stack_copied_len: 0,
        stack: [0; STACK_CAPACITY],
    };

    pub const fn new() -> Self {
        Self::ZEROED
    }

    /// The captured part of the stack snapshot.
    pub fn stack_bytes(&self) -> &[u8] {
        &self.stack[..self.stack_copied_len.min(STACK_CAPACITY)]
    }

    /// Pointer-sized values in the captured stack with their byte offset from Rsp.
    pub fn stack_words(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.stack_bytes()
            .chunks_exact(core::mem::size_of::<u64>())
            .enumerate()
            .map(|(i, chunk)| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                (i * 8, u64::from_ne_bytes(word))
            })
    }

    /// Set the stack snapshot from `bytes`, truncated to capacity.
    pub fn set_stack(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(STACK_CAPACITY);
        self.stack[..len].copy_from_slice(&bytes[..len]);
        self.stack[len..].fill(0);
        self.stack_copied_len = len;
    }

    pub fn clear(&mut self) {
        *self = Self::ZEROED;
    }
}

impl Default for CaptureBlock {
    fn default() -> Self {
        Self::ZEROED
    }
}

impl core::fmt::Debug for CaptureBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CaptureBlock")
            .field("rsp", &format_args!("{:#x}", self.rsp))
            .field("rip", &format_args!("{:#x}", self.rip))
            .field("cs", &self.cs)
            .field("ss", &self.ss)
            .field("flags", &format_args!("{:#x}", self.flags))
            .field("dtb", &format_args!("{:#x}", self.dtb))
            .field("usermode", &self.usermode)
            .field("thread_start_address", &format_args!("{:#x}", self.thread_start_address))
            .field("stack_copied_len", &self.stack_copied_len)
            .finish()
    }
}

/// Slot lifecycle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Not part of the current sweep, or already consumed.
    Idle = 0,
    /// Waiting for its processor to take the NMI.
    Armed = 1,
    /// Owning processor is writing the block.
    Capturing = 2,
    /// Block is complete and may be read after the barrier.
    Captured = 3,
}

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Armed,
            2 => Self::Capturing,
            3 => Self::Captured,
            _ => Self::Idle,
        }
    }
}

/// One processor's slot.
pub struct CaptureSlot {
    state: AtomicU8,
    block: UnsafeCell<CaptureBlock>,
}

// The block is written only by the processor that moved the slot from
// Armed to Capturing, and read only through `&mut CaptureStore`.
unsafe impl Sync for CaptureSlot {}

impl CaptureSlot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SlotState::Idle as u8),
            block: UnsafeCell::new(CaptureBlock::ZEROED),
        }
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Claim the slot for writing. Succeeds once per arming.
    ///
    /// On success the caller has exclusive access to the block until it
    /// calls `finish_capture`.
    pub(crate) fn begin_capture(&self) -> Option<&mut CaptureBlock> {
        self.state
            .compare_exchange(
                SlotState::Armed as u8,
                SlotState::Capturing as u8,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .ok()?;
        // SAFETY: the Armed -> Capturing transition succeeds for exactly one
        // caller, and the coordinator does not touch the block until it sees
        // Captured.
        Some(unsafe { &mut *self.block.get() })
    }

    /// Taken by its processor during the current sweep.
    pub(crate) fn is_claimed(&self) -> bool {
        matches!(self.state(), SlotState::Capturing | SlotState::Captured)
    }

    pub(crate) fn finish_capture(&self) {
        self.state.store(SlotState::Captured as u8, Ordering::Release);
    }

    /// Move Armed back to Idle. Returns false if the processor got there first.
    fn disarm(&self) -> bool {
        self.state
            .compare_exchange(
                SlotState::Armed as u8,
                SlotState::Idle as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }
}

/// Fixed array of capture slots, one per logical processor.
pub struct CaptureStore {
    slots: Box<[CaptureSlot]>,
}

impl CaptureStore {
    /// Allocate `capacity` zeroed slots.
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<CaptureSlot> = (0..capacity).map(|_| CaptureSlot::new()).collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, cpu: usize) -> Option<&CaptureSlot> {
        self.slots.get(cpu)
    }

    /// Arm slots `0..count` for a new sweep. Stale blocks are cleared.
    pub fn arm(&mut self, count: usize) {
        for slot in self.slots.iter_mut().take(count) {
            slot.block.get_mut().clear();
            *slot.state.get_mut() = SlotState::Armed as u8;
        }
    }

    /// Disarm every slot in `0..count` still waiting for its processor.
    ///
    /// Returns the indices of those processors.
    pub fn disarm_pending(&self, count: usize) -> Vec<usize> {
        self.slots
            .iter()
            .take(count)
            .enumerate()
            .filter(|(_, slot)| slot.disarm())
            .map(|(cpu, _)| cpu)
            .collect()
    }

    /// Processors in `0..count` whose slot is still armed.
    pub fn armed(&self, count: usize) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .take(count)
            .enumerate()
            .filter(|(_, slot)| slot.state() == SlotState::Armed)
            .map(|(cpu, _)| cpu)
    }

    /// Record a capture produced outside the NMI path, e.g. a replayed or
    /// imported sample. Returns false if `cpu` is out of range.
    pub fn load(&mut self, cpu: usize, block: CaptureBlock) -> bool {
        let Some(slot) = self.slots.get_mut(cpu) else {
            return false;
        };
        *slot.block.get_mut() = block;
        *slot.state.get_mut() = SlotState::Captured as u8;
        true
    }

    /// The captured block for `cpu`, if that slot is filled.
    pub fn captured(&mut self, cpu: usize) -> Option<&CaptureBlock> {
        let slot = self.slots.get_mut(cpu)?;
        if *slot.state.get_mut() != SlotState::Captured as u8 {
            return None;
        }
        Some(slot.block.get_mut())
    }

    /// Indices of filled slots.
    pub fn filled(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state() == SlotState::Captured)
            .map(|(cpu, _)| cpu)
            .collect()
    }

    /// Take each filled block in index order, then zero it and mark it idle.
    pub(crate) fn drain_captured(&mut self, mut f: impl FnMut(usize, &CaptureBlock)) {
        for (cpu, slot) in self.slots.iter_mut().enumerate() {
            if *slot.state.get_mut() != SlotState::Captured as u8 {
                continue;
            }
            let block = slot.block.get_mut();
            f(cpu, block);
            block.clear();
            *slot.state.get_mut() = SlotState::Idle as u8;
        }
    }
}
