//! Sweep clock.
//!
//! The coordinator timestamps each sweep for `SweepReport::elapsed_ns` and
//! `SweepStats::last_sweep_ns`. In a kernel build with `axhal` the clock is
//! the monotonic hardware timer; otherwise it is a counter that only moves
//! when something advances it, which lets user-space tests control the
//! elapsed time of a sweep.

use core::sync::atomic::{AtomicU64, Ordering};

/// Source of the sweep timestamps.
pub trait PlatformOps {
    /// Current monotonic time in nanoseconds.
    fn time_ns() -> u64;
}

// =============================================================================
// Kernel Clock (axhal)
// =============================================================================

#[cfg(all(not(test), feature = "axhal"))]
pub struct RealPlatform;

#[cfg(all(not(test), feature = "axhal"))]
impl PlatformOps for RealPlatform {
    fn time_ns() -> u64 {
        axhal::time::monotonic_time().as_nanos() as u64
    }
}

// =============================================================================
// Manual Clock (tests, or no axhal)
// =============================================================================

static MANUAL_TIME_NS: AtomicU64 = AtomicU64::new(1_000_000_000);

#[cfg(any(test, not(feature = "axhal")))]
pub struct MockPlatform;

#[cfg(any(test, not(feature = "axhal")))]
impl PlatformOps for MockPlatform {
    fn time_ns() -> u64 {
        MANUAL_TIME_NS.load(Ordering::Acquire)
    }
}

/// Move the manual clock forward. Has no effect on the `axhal` clock.
///
/// A host without a hardware timer calls this from its delay routine so
/// sweep durations reflect the time spent staggering and polling.
pub fn advance_mock_time(ns: u64) {
    MANUAL_TIME_NS.fetch_add(ns, Ordering::AcqRel);
}

#[cfg(all(not(test), feature = "axhal"))]
pub type Platform = RealPlatform;

#[cfg(any(test, not(feature = "axhal")))]
pub type Platform = MockPlatform;

#[inline]
pub fn time_ns() -> u64 {
    Platform::time_ns()
}
