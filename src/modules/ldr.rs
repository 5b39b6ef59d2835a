//! Walker for the kernel loader's in-load-order module list.
//!
//! Each loaded driver has a `KLDR_DATA_TABLE_ENTRY` whose first field links
//! it into a circular doubly-linked list. The list head itself
//! (`PsLoadedModuleList`) is a bare `LIST_ENTRY`, not a loader entry, so a
//! walk that starts from some driver's own entry must skip it.

use core::marker::PhantomData;
use core::ptr::NonNull;

use axerrno::AxResult;

use super::{ModuleDescriptor, ModuleDirectory, ModuleName};

#[repr(C)]
#[derive(Debug)]
pub struct ListEntry {
    pub flink: *mut ListEntry,
    pub blink: *mut ListEntry,
}

#[repr(C)]
#[derive(Debug)]
pub struct UnicodeString {
    /// Length in bytes, not including any terminator.
    pub length: u16,
    pub maximum_length: u16,
    pub buffer: *mut u16,
}

/// Leading fields of the x64 `KLDR_DATA_TABLE_ENTRY`.
#[repr(C)]
#[derive(Debug)]
pub struct KldrDataTableEntry {
    pub in_load_order_links: ListEntry,
    pub exception_table: *mut u8,
    pub exception_table_size: u32,
    pub gp_value: *mut u8,
    pub non_paged_debug_info: *mut u8,
    pub dll_base: *mut u8,
    pub entry_point: *mut u8,
    pub size_of_image: u32,
    pub full_dll_name: UnicodeString,
    pub base_dll_name: UnicodeString,
}

#[cfg(target_pointer_width = "64")]
const _: () = assert!(core::mem::offset_of!(KldrDataTableEntry, dll_base) == 0x30);
#[cfg(target_pointer_width = "64")]
const _: () = assert!(core::mem::offset_of!(KldrDataTableEntry, size_of_image) == 0x40);
#[cfg(target_pointer_width = "64")]
const _: () = assert!(core::mem::offset_of!(KldrDataTableEntry, base_dll_name) == 0x58);

/// Read-only view of the loader's module list.
pub struct LdrModuleList {
    anchor: NonNull<ListEntry>,
    sentinel: Option<NonNull<ListEntry>>,
}

impl LdrModuleList {
    /// Create a view that walks from `anchor` around the ring.
    ///
    /// `sentinel` is the list head, if the ring contains one; it is skipped.
    ///
    /// # Safety
    /// `anchor` must be the `in_load_order_links` of a live loader entry and
    /// the ring it belongs to must stay intact and unmodified while the
    /// returned view is in use.
    pub unsafe fn from_anchor(
        anchor: *const ListEntry,
        sentinel: Option<*const ListEntry>,
    ) -> AxResult<Self> {
        let Some(anchor) = NonNull::new(anchor as *mut ListEntry) else {
            return axerrno::ax_err!(InvalidInput, "null module list anchor");
        };
        Ok(Self {
            anchor,
            sentinel: sentinel.and_then(|p| NonNull::new(p as *mut ListEntry)),
        })
    }
}

/// One pass around the loader ring.
pub struct LdrIter<'a> {
    anchor: NonNull<ListEntry>,
    sentinel: Option<NonNull<ListEntry>>,
    current: Option<NonNull<ListEntry>>,
    _list: PhantomData<&'a LdrModuleList>,
}

impl<'a> Iterator for LdrIter<'a> {
    type Item = ModuleDescriptor<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let current = self.current?;
            // SAFETY: guaranteed live by `LdrModuleList::from_anchor`.
            let next = unsafe { (*current.as_ptr()).flink };
            let anchor = self.anchor;
            self.current = NonNull::new(next).filter(|n| *n != anchor);

            if Some(current) == self.sentinel {
                continue;
            }

            // SAFETY: every non-sentinel ring member is a loader entry whose
            // first field is `in_load_order_links`.
            let entry = unsafe { &*(current.as_ptr() as *const KldrDataTableEntry) };
            return Some(ModuleDescriptor {
                base: entry.dll_base as u64,
                size: entry.size_of_image as u64,
                name: ModuleName::Utf16(unicode_units(&entry.base_dll_name)),
            });
        }
    }
}

fn unicode_units(s: &UnicodeString) -> &[u16] {
    if s.buffer.is_null() {
        return &[];
    }
    // SAFETY: the loader keeps `length` bytes of `buffer` valid.
    unsafe { core::slice::from_raw_parts(s.buffer, s.length as usize / 2) }
}

impl ModuleDirectory for LdrModuleList {
    type Iter<'a> = LdrIter<'a>;

    fn modules(&self) -> LdrIter<'_> {
        LdrIter {
            anchor: self.anchor,
            sentinel: self.sentinel,
            current: Some(self.anchor),
            _list: PhantomData,
        }
    }
}
