//! Address-shape predicates shared by the trap handler and the analysis pass.
//!
//! Everything here is a heuristic. Privilege level is inferred from the
//! shape of an address (which half of the 48-bit canonical space it sits in),
//! never from a page-table walk. Plausibility of a stack value is the shape
//! test plus the host's page-presence probe.

use crate::host::MemoryProbe;

/// Page size (4KB)
pub const PAGE_SIZE: u64 = 0x1000;
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// Bytes kept clear below the end of the stack page when copying.
pub const STACK_GUARD: u64 = 8;

/// Implemented virtual address width (4-level paging).
const VA_BITS: u32 = 48;

/// Where an address falls in the canonical address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    /// Lower canonical half (bit 47 clear, all bits above it clear).
    User,
    /// Upper canonical half (bit 47 set, all bits above it set).
    Kernel,
    /// Bits above the implemented width are not a sign extension of bit 47.
    NonCanonical,
}

/// Classify `addr` by shape alone.
#[inline]
pub const fn classify(addr: u64) -> AddressClass {
    let upper = addr >> (VA_BITS - 1);
    if upper == 0 {
        AddressClass::User
    } else if upper == (u64::MAX >> (VA_BITS - 1)) {
        AddressClass::Kernel
    } else {
        AddressClass::NonCanonical
    }
}

#[inline]
pub const fn is_canonical(addr: u64) -> bool {
    !matches!(classify(addr), AddressClass::NonCanonical)
}

#[inline]
pub const fn is_kernel_address(addr: u64) -> bool {
    matches!(classify(addr), AddressClass::Kernel)
}

/// Shape test for a pointer-sized stack value: canonical and above the
/// null page. Counters, flags and small offsets fail here regardless of
/// what the host has mapped.
#[inline]
pub const fn is_plausible_pointer(value: u64) -> bool {
    value >= PAGE_SIZE && is_canonical(value)
}

/// Whether a value pulled off a stack is worth resolving: it must pass the
/// shape test and the host must report it as mapped right now.
pub fn is_inspectable<P: MemoryProbe + ?Sized>(value: u64, probe: &P) -> bool {
    is_plausible_pointer(value) && probe.is_address_valid(value)
}

/// Number of bytes that may be copied starting at `rsp` without leaving
/// the page `rsp` lives on, capped at `capacity`.
///
/// Kernel stacks are pageable, so the page above the one holding `rsp`
/// may not be resident. The copy stops `STACK_GUARD` bytes short of the
/// page end.
#[inline]
pub fn stack_window(rsp: u64, capacity: usize) -> usize {
    let to_page_end = PAGE_SIZE - (rsp & !PAGE_MASK);
    let readable = to_page_end.saturating_sub(STACK_GUARD);
    core::cmp::min(readable, capacity as u64) as usize
}

#[inline]
pub const fn page_base(addr: u64) -> u64 {
    addr & PAGE_MASK
}
