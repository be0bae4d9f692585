//! Per-Process Page Tables
//!
//! A page table is a vector of entries indexed by virtual page number.
//! Entries start invalid; the fault handler maps them to frames on demand.

use bitflags::bitflags;

bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u8 {
        /// Page is resident in a physical frame.
        const VALID = 1 << 0;
        /// Page was written since it was loaded.
        const DIRTY = 1 << 1;
    }
}

/// One page table entry.
///
/// Invariant: `VALID` implies `frame` is `Some`, and the named frame's
/// table slot points back at this `(process, page)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageTableEntry {
    frame: Option<usize>,
    flags: PageFlags,
}

impl PageTableEntry {
    pub const fn new() -> Self {
        PageTableEntry {
            frame: None,
            flags: PageFlags::empty(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.flags.contains(PageFlags::VALID)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PageFlags::DIRTY)
    }

    /// Physical frame index, while resident.
    pub fn frame(&self) -> Option<usize> {
        self.frame
    }

    /// Map the page into `frame`, valid and clean.
    pub fn map(&mut self, frame: usize) {
        self.frame = Some(frame);
        self.flags = PageFlags::VALID;
    }

    /// Drop the mapping, e.g. on eviction.
    pub fn unmap(&mut self) {
        self.frame = None;
        self.flags = PageFlags::empty();
    }

    pub fn mark_dirty(&mut self) {
        self.flags.insert(PageFlags::DIRTY);
    }
}

/// All-invalid table covering `num_pages` pages.
pub fn new_table(num_pages: usize) -> Vec<PageTableEntry> {
    vec![PageTableEntry::new(); num_pages]
}
