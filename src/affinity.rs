//! Processor affinity masks used to target NMIs.
//!
//! Layout follows the kernel's extended affinity bitmap: one 64-bit word per
//! processor group.

/// Number of 64-processor groups a mask can describe.
pub const MAX_GROUPS: usize = 32;

/// Highest processor count a mask (and therefore a sweep) can cover.
pub const MAX_PROCESSORS: usize = MAX_GROUPS * 64;

/// Set of logical processors an NMI is delivered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityMask {
    bitmap: [u64; MAX_GROUPS],
}

impl AffinityMask {
    /// Create an empty mask.
    pub const fn new() -> Self {
        Self {
            bitmap: [0; MAX_GROUPS],
        }
    }

    /// Create a mask targeting exactly one processor.
    pub fn single(cpu: usize) -> Self {
        let mut mask = Self::new();
        mask.add(cpu);
        mask
    }

    /// Add a processor to the mask.
    ///
    /// Returns `false` if `cpu` is beyond `MAX_PROCESSORS`.
    pub fn add(&mut self, cpu: usize) -> bool {
        if cpu >= MAX_PROCESSORS {
            log::warn!("affinity: processor {} exceeds mask capacity", cpu);
            return false;
        }
        self.bitmap[cpu / 64] |= 1u64 << (cpu % 64);
        true
    }

    pub fn contains(&self, cpu: usize) -> bool {
        cpu < MAX_PROCESSORS && self.bitmap[cpu / 64] & (1u64 << (cpu % 64)) != 0
    }

    pub fn count(&self) -> usize {
        self.bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap.iter().all(|&w| w == 0)
    }

    /// Iterate processors in increasing index order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bitmap.iter().enumerate().flat_map(|(group, &word)| {
            (0..64usize)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| group * 64 + bit)
        })
    }
}

impl Default for AffinityMask {
    fn default() -> Self {
        Self::new()
    }
}
