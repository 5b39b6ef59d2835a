//! Loaded-module directory and address resolution.
//!
//! The host loader owns the module list; this crate only walks it. A
//! directory is a circular list visited once, starting at its anchor.

#[cfg(feature = "ldr")]
pub mod ldr;

use alloc::string::{String, ToString};
use alloc::vec::Vec;

/// Display name of a module, as stored by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleName<'a> {
    Utf8(&'a str),
    /// UTF-16 code units, as in the kernel loader's `UNICODE_STRING`.
    Utf16(&'a [u16]),
}

impl core::fmt::Display for ModuleName<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        use core::fmt::Write;

        match self {
            Self::Utf8(s) => f.write_str(s),
            Self::Utf16(units) => {
                for c in char::decode_utf16(units.iter().copied()) {
                    f.write_char(c.unwrap_or(char::REPLACEMENT_CHARACTER))?;
                }
                Ok(())
            }
        }
    }
}

/// Read-only view of one loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleDescriptor<'a> {
    pub base: u64,
    pub size: u64,
    pub name: ModuleName<'a>,
}

impl ModuleDescriptor<'_> {
    /// Inclusive range test: `base <= addr <= base + size`.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr <= self.base.saturating_add(self.size)
    }

    pub fn offset_of(&self, addr: u64) -> u64 {
        addr.wrapping_sub(self.base)
    }
}

/// A loaded-module list.
pub trait ModuleDirectory {
    type Iter<'a>: Iterator<Item = ModuleDescriptor<'a>>
    where
        Self: 'a;

    /// Visit every module once, starting at the anchor.
    fn modules(&self) -> Self::Iter<'_>;
}

/// Find the first module whose range contains `addr`.
pub fn find_module<D: ModuleDirectory + ?Sized>(addr: u64, dir: &D) -> Option<ModuleDescriptor<'_>> {
    dir.modules().find(|m| m.contains(addr))
}

/// Owned copy of a module resolution, for reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleHit {
    pub name: String,
    pub base: u64,
    pub offset: u64,
}

impl ModuleHit {
    pub fn new(module: &ModuleDescriptor<'_>, addr: u64) -> Self {
        Self {
            name: module.name.to_string(),
            base: module.base,
            offset: module.offset_of(addr),
        }
    }
}

impl core::fmt::Display for ModuleHit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}+{:#x}", self.name, self.offset)
    }
}

/// Resolve `addr` to a module name and offset.
pub fn resolve<D: ModuleDirectory + ?Sized>(addr: u64, dir: &D) -> Option<ModuleHit> {
    find_module(addr, dir).map(|m| ModuleHit::new(&m, addr))
}

// =============================================================================
// Owned Module Ring
// =============================================================================

/// One entry of a `ModuleRing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleEntry {
    pub base: u64,
    pub size: u64,
    pub name: String,
}

/// Circular module list held in memory, walked from an anchor entry.
///
/// Used for offline analysis of imported captures and in tests.
#[derive(Debug, Clone, Default)]
pub struct ModuleRing {
    entries: Vec<ModuleEntry>,
    anchor: usize,
}

impl ModuleRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a module. The ring order is insertion order.
    pub fn push(&mut self, base: u64, size: u64, name: &str) {
        self.entries.push(ModuleEntry {
            base,
            size,
            name: name.to_string(),
        });
    }

    /// Builder form of `push`.
    pub fn with(mut self, base: u64, size: u64, name: &str) -> Self {
        self.push(base, size, name);
        self
    }

    /// Start walks at entry `index` (wrapped to the ring length).
    pub fn set_anchor(&mut self, index: usize) {
        self.anchor = if self.entries.is_empty() {
            0
        } else {
            index % self.entries.len()
        };
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Walks a `ModuleRing` once from its anchor.
pub struct RingIter<'a> {
    entries: &'a [ModuleEntry],
    anchor: usize,
    visited: usize,
}

impl<'a> Iterator for RingIter<'a> {
    type Item = ModuleDescriptor<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.visited >= self.entries.len() {
            return None;
        }
        let entry = &self.entries[(self.anchor + self.visited) % self.entries.len()];
        self.visited += 1;
        Some(ModuleDescriptor {
            base: entry.base,
            size: entry.size,
            name: ModuleName::Utf8(&entry.name),
        })
    }
}

impl ModuleDirectory for ModuleRing {
    type Iter<'a> = RingIter<'a>;

    fn modules(&self) -> RingIter<'_> {
        RingIter {
            entries: &self.entries,
            anchor: self.anchor,
            visited: 0,
        }
    }
}
