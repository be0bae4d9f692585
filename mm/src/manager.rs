//! Memory Manager
//!
//! Demand paging over the frame pool: lazy allocation, bounds-checked
//! word access, fault service with FIFO eviction, and write-back to the
//! backing store. One manager is shared by every worker core; all state
//! sits behind a single mutex that is also held across store I/O, so
//! fault service is fully serialized. Counters are atomics and can be
//! read without the lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::backing_store::{BackingStore, DEFAULT_STORE_FILE};
use crate::fault::{MemResult, MemoryError};
use crate::frame::FrameTable;
use crate::page_table::{new_table, PageTableEntry};

/// Paging statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_frames: usize,
    pub used_frames: usize,
    pub free_frames: usize,
    pub used_bytes: usize,
    pub page_faults: u64,
    pub pages_swapped_in: u64,
    pub pages_swapped_out: u64,
}

struct ManagerInner {
    frames: FrameTable,
    page_tables: HashMap<String, Vec<PageTableEntry>>,
    allocated_bytes: HashMap<String, usize>,
    store: BackingStore,
}

/// Demand-paged memory manager.
pub struct MemoryManager {
    frame_size: usize,
    inner: Mutex<ManagerInner>,
    page_faults: AtomicU64,
    pages_swapped_in: AtomicU64,
    pages_swapped_out: AtomicU64,
}

impl MemoryManager {
    /// `total_memory` and `frame_size` are in bytes. `frame_size` must be
    /// an even divisor of `total_memory` leaving at least one frame.
    pub fn new(total_memory: usize, frame_size: usize) -> Self {
        Self::with_store(total_memory, frame_size, DEFAULT_STORE_FILE)
    }

    /// Same as [`MemoryManager::new`] with an explicit backing-store path.
    pub fn with_store(
        total_memory: usize,
        frame_size: usize,
        store_path: impl Into<PathBuf>,
    ) -> Self {
        let total_frames = total_memory / frame_size;
        MemoryManager {
            frame_size,
            inner: Mutex::new(ManagerInner {
                frames: FrameTable::new(total_frames, frame_size),
                page_tables: HashMap::new(),
                allocated_bytes: HashMap::new(),
                store: BackingStore::new(store_path, frame_size / 2),
            }),
            page_faults: AtomicU64::new(0),
            pages_swapped_in: AtomicU64::new(0),
            pages_swapped_out: AtomicU64::new(0),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Create an all-invalid page table covering `size` bytes for
    /// `process` and seed a zero store record for each page, so reads
    /// after a first-touch fault are deterministic. No frame is claimed
    /// until a page is actually touched. Returns the page count.
    pub fn allocate(&self, process: &str, size: usize) -> usize {
        let num_pages = (size + self.frame_size - 1) / self.frame_size;
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        inner
            .page_tables
            .insert(process.to_string(), new_table(num_pages));
        inner.allocated_bytes.insert(process.to_string(), size);
        for page in 0..num_pages {
            inner.store.seed_zero(process, page);
        }
        log::debug!("allocated {} bytes / {} pages for {}", size, num_pages, process);
        num_pages
    }

    /// Release every frame owned by `process` and drop its page table.
    pub fn free(&self, process: &str) {
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        if inner.page_tables.remove(process).is_none() {
            return;
        }
        inner.allocated_bytes.remove(process);
        let freed = inner.frames.release_owned(process);
        log::debug!("freed {} frames of {}", freed, process);
    }

    /// Read the 16-bit word at `addr`. Raises `AccessViolation` when the
    /// address is out of range and `PageFault` when the page is not
    /// resident; the caller services the fault and retries.
    pub fn read(&self, process: &str, addr: u32) -> MemResult<u16> {
        let guard = self.lock_inner();
        let (_, frame, offset) = self.locate(&guard, process, addr)?;
        Ok(guard.frames.words(frame)[offset])
    }

    /// Write the 16-bit word at `addr`, marking the page dirty. Fault
    /// semantics match [`MemoryManager::read`].
    pub fn write(&self, process: &str, addr: u32, value: u16) -> MemResult<()> {
        let mut guard = self.lock_inner();
        let (page, frame, offset) = self.locate(&guard, process, addr)?;
        let inner = &mut *guard;
        inner.frames.words_mut(frame)[offset] = value;
        if let Some(table) = inner.page_tables.get_mut(process) {
            table[page].mark_dirty();
        }
        Ok(())
    }

    /// Load the page covering `addr` into a frame: first free frame, else
    /// the lowest-indexed occupied frame is evicted (dirty contents are
    /// written back first). Already-resident pages are a no-op, so two
    /// workers racing on the same fault stay consistent.
    pub fn service_page_fault(&self, process: &str, addr: u32) -> MemResult<()> {
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        let size = *inner.allocated_bytes.get(process).ok_or_else(|| {
            MemoryError::AccessViolation {
                process: process.to_string(),
                addr,
            }
        })?;
        if addr as usize >= size {
            return Err(MemoryError::AccessViolation {
                process: process.to_string(),
                addr,
            });
        }

        let page = addr as usize / self.frame_size;
        if inner.page_tables[process][page].is_valid() {
            return Ok(());
        }

        let frame = match inner.frames.find_free() {
            Some(free) => free,
            None => self.evict(inner),
        };

        if inner.store.read(process, page, inner.frames.words_mut(frame)) {
            self.pages_swapped_in.fetch_add(1, Ordering::Relaxed);
        } else {
            inner.frames.words_mut(frame).fill(0);
        }
        inner.frames.assign(frame, process, page);
        if let Some(table) = inner.page_tables.get_mut(process) {
            table[page].map(frame);
        }
        self.page_faults.fetch_add(1, Ordering::Relaxed);
        log::debug!("fault: {} page {} -> frame {}", process, page, frame);
        Ok(())
    }

    /// Report the first address in `addrs` whose page is not resident as a
    /// `PageFault`, without servicing it. Addresses beyond the process's
    /// table (or an unknown process) are passed over; the eventual
    /// `read`/`write` surfaces the violation.
    pub fn ensure_pages_present(&self, process: &str, addrs: &[u32]) -> MemResult<()> {
        let guard = self.lock_inner();
        let Some(table) = guard.page_tables.get(process) else {
            return Ok(());
        };
        for &addr in addrs {
            let page = addr as usize / self.frame_size;
            if page < table.len() && !table[page].is_valid() {
                return Err(MemoryError::PageFault {
                    process: process.to_string(),
                    addr,
                });
            }
        }
        Ok(())
    }

    /// Physical bytes currently in use (`used_frames * frame_size`).
    pub fn used_bytes(&self) -> usize {
        self.lock_inner().frames.used_frames() * self.frame_size
    }

    pub fn stats(&self) -> MemoryStats {
        let guard = self.lock_inner();
        let total_frames = guard.frames.total_frames();
        let used_frames = guard.frames.used_frames();
        MemoryStats {
            total_frames,
            used_frames,
            free_frames: total_frames - used_frames,
            used_bytes: used_frames * self.frame_size,
            page_faults: self.page_faults.load(Ordering::Relaxed),
            pages_swapped_in: self.pages_swapped_in.load(Ordering::Relaxed),
            pages_swapped_out: self.pages_swapped_out.load(Ordering::Relaxed),
        }
    }

    /// Verify the frame / page-table bijection: every occupied frame is
    /// named by exactly the valid entry it points back to, and every valid
    /// entry names a frame that owns it. Debug and test aid.
    pub fn check_consistency(&self) -> bool {
        let guard = self.lock_inner();
        for index in 0..guard.frames.total_frames() {
            let frame = guard.frames.get(index);
            if !frame.occupied {
                continue;
            }
            let Some(table) = guard.page_tables.get(&frame.owner) else {
                return false;
            };
            let Some(entry) = table.get(frame.page) else {
                return false;
            };
            if !entry.is_valid() || entry.frame() != Some(index) {
                return false;
            }
        }
        for (process, table) in &guard.page_tables {
            for (page, entry) in table.iter().enumerate() {
                if !entry.is_valid() {
                    continue;
                }
                let Some(frame) = entry.frame() else {
                    return false;
                };
                if frame >= guard.frames.total_frames() {
                    return false;
                }
                let slot = guard.frames.get(frame);
                if !slot.occupied || slot.owner != *process || slot.page != page {
                    return false;
                }
            }
        }
        true
    }

    /// Bounds-check `addr` and resolve it to `(page, frame, word offset)`.
    fn locate(
        &self,
        inner: &ManagerInner,
        process: &str,
        addr: u32,
    ) -> MemResult<(usize, usize, usize)> {
        match inner.allocated_bytes.get(process) {
            Some(&size) if (addr as usize) < size => {}
            _ => {
                return Err(MemoryError::AccessViolation {
                    process: process.to_string(),
                    addr,
                })
            }
        }
        let page = addr as usize / self.frame_size;
        let entry = &inner.page_tables[process][page];
        match entry.frame() {
            Some(frame) if entry.is_valid() => {
                Ok((page, frame, (addr as usize % self.frame_size) / 2))
            }
            _ => Err(MemoryError::PageFault {
                process: process.to_string(),
                addr,
            }),
        }
    }

    /// Evict the FIFO victim and return its frame index. Dirty contents
    /// go to the backing store under the old owner's key first.
    fn evict(&self, inner: &mut ManagerInner) -> usize {
        let victim = match inner.frames.find_victim() {
            Some(victim) => victim,
            // find_free failed, so every frame of the never-empty table
            // is occupied.
            None => unreachable!("frame table has no free and no occupied frames"),
        };
        let owner = inner.frames.get(victim).owner.clone();
        let page = inner.frames.get(victim).page;

        let dirty = inner
            .page_tables
            .get(&owner)
            .and_then(|table| table.get(page))
            .map(|entry| entry.is_dirty())
            .unwrap_or(false);
        if dirty {
            inner.store.write(&owner, page, inner.frames.words(victim));
            self.pages_swapped_out.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(table) = inner.page_tables.get_mut(&owner) {
            if let Some(entry) = table.get_mut(page) {
                entry.unmap();
            }
        }
        inner.frames.release(victim);
        log::debug!("evicted {}.{} from frame {}", owner, page, victim);
        victim
    }

    // A poisoned lock only means a worker panicked mid-operation; the
    // tables are still structurally sound, so recover the guard.
    fn lock_inner(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(tag: &str, total: usize, frame: usize) -> MemoryManager {
        let path = std::env::temp_dir().join(format!(
            "osim-mm-{}-{}.txt",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        MemoryManager::with_store(total, frame, path)
    }

    fn fault_addr(err: MemoryError) -> u32 {
        assert!(err.is_page_fault(), "expected a page fault, got {}", err);
        err.addr()
    }

    #[test]
    fn test_allocation_is_lazy() {
        let mm = manager("lazy", 256, 64);
        assert_eq!(mm.allocate("p00", 130), 3);

        let stats = mm.stats();
        assert_eq!(stats.total_frames, 4);
        assert_eq!(stats.used_frames, 0);
        assert_eq!(stats.page_faults, 0);
        assert_eq!(mm.used_bytes(), 0);
    }

    #[test]
    fn test_first_touch_faults_then_resolves() {
        let mm = manager("touch", 256, 64);
        mm.allocate("p00", 128);

        let err = mm.write("p00", 0x10, 42).unwrap_err();
        assert_eq!(fault_addr(err), 0x10);

        mm.service_page_fault("p00", 0x10).unwrap();
        mm.write("p00", 0x10, 42).unwrap();
        assert_eq!(mm.read("p00", 0x10).unwrap(), 42);

        let stats = mm.stats();
        assert_eq!(stats.used_frames, 1);
        assert_eq!(stats.page_faults, 1);
        // The zero seed from allocate counts as a swap-in on load.
        assert_eq!(stats.pages_swapped_in, 1);
        assert!(mm.check_consistency());
    }

    #[test]
    fn test_service_is_idempotent_when_resident() {
        let mm = manager("idem", 256, 64);
        mm.allocate("p00", 64);
        mm.service_page_fault("p00", 0).unwrap();
        mm.service_page_fault("p00", 0).unwrap();
        assert_eq!(mm.stats().page_faults, 1);
    }

    #[test]
    fn test_eviction_prefers_lowest_occupied_frame() {
        let mm = manager("fifo", 128, 64);
        mm.allocate("a", 64);
        mm.allocate("b", 64);
        mm.allocate("c", 64);
        mm.service_page_fault("a", 0).unwrap();
        mm.service_page_fault("b", 0).unwrap();
        assert_eq!(mm.stats().free_frames, 0);

        // Frame 0 (a's page) is the victim.
        mm.service_page_fault("c", 0).unwrap();
        assert!(mm.ensure_pages_present("a", &[0]).is_err());
        assert!(mm.ensure_pages_present("b", &[0]).is_ok());
        assert!(mm.ensure_pages_present("c", &[0]).is_ok());
        assert!(mm.check_consistency());
    }

    #[test]
    fn test_dirty_page_round_trips_through_store() {
        let mm = manager("roundtrip", 64, 64);
        mm.allocate("p00", 128);

        mm.service_page_fault("p00", 0x00).unwrap();
        mm.write("p00", 0x00, 7).unwrap();
        mm.write("p00", 0x02, 8).unwrap();

        // Page 1 evicts dirty page 0 to the store.
        mm.service_page_fault("p00", 0x40).unwrap();
        assert_eq!(mm.stats().pages_swapped_out, 1);

        // Page 0 comes back with its contents; clean page 1 is dropped
        // without another swap-out.
        mm.service_page_fault("p00", 0x00).unwrap();
        assert_eq!(mm.read("p00", 0x00).unwrap(), 7);
        assert_eq!(mm.read("p00", 0x02).unwrap(), 8);
        assert_eq!(mm.stats().pages_swapped_out, 1);
        assert_eq!(mm.stats().page_faults, 3);
    }

    #[test]
    fn test_out_of_range_is_a_violation() {
        let mm = manager("violation", 128, 64);
        mm.allocate("p00", 64);

        let err = mm.write("p00", 0x80, 1).unwrap_err();
        assert_eq!(
            err,
            MemoryError::AccessViolation {
                process: "p00".to_string(),
                addr: 0x80
            }
        );
        assert!(!mm.read("p00", 0x40).unwrap_err().is_page_fault());
        // The last in-range word faults instead of violating.
        assert!(mm.read("p00", 0x3F).unwrap_err().is_page_fault());
    }

    #[test]
    fn test_unknown_process_is_a_violation() {
        let mm = manager("unknown", 128, 64);
        let err = mm.read("ghost", 0).unwrap_err();
        assert!(!err.is_page_fault());
        assert!(mm.service_page_fault("ghost", 0).is_err());
    }

    #[test]
    fn test_free_releases_frames() {
        let mm = manager("free", 256, 64);
        mm.allocate("p00", 128);
        mm.service_page_fault("p00", 0).unwrap();
        mm.service_page_fault("p00", 64).unwrap();
        assert_eq!(mm.used_bytes(), 128);

        mm.free("p00");
        assert_eq!(mm.used_bytes(), 0);
        assert!(mm.check_consistency());
        // Freeing twice is harmless.
        mm.free("p00");
    }

    #[test]
    fn test_ensure_pages_present_reports_first_missing() {
        let mm = manager("ensure", 256, 64);
        mm.allocate("p00", 128);

        let err = mm.ensure_pages_present("p00", &[0x40, 0x00]).unwrap_err();
        assert_eq!(fault_addr(err), 0x40);

        mm.service_page_fault("p00", 0x40).unwrap();
        let err = mm.ensure_pages_present("p00", &[0x40, 0x00]).unwrap_err();
        assert_eq!(fault_addr(err), 0x00);

        mm.service_page_fault("p00", 0x00).unwrap();
        assert!(mm.ensure_pages_present("p00", &[0x40, 0x00]).is_ok());

        // Beyond the table and unknown processes defer to read/write.
        assert!(mm.ensure_pages_present("p00", &[0x1000]).is_ok());
        assert!(mm.ensure_pages_present("ghost", &[0]).is_ok());
    }
}
