//! Backing Store
//!
//! Append-only on-disk page store keyed by `(process, page)`. One record
//! per line: `<proc>.<page>: <w0> <w1> ...` with decimal 16-bit words.
//! Records are never rewritten; a read scans the file and the last record
//! for a key wins. The memory manager serializes access, so no locking
//! happens at this layer.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Default per-run store file name.
pub const DEFAULT_STORE_FILE: &str = "osim-backing-store.txt";

/// Append-only page store.
pub struct BackingStore {
    path: PathBuf,
    words_per_frame: usize,
}

impl BackingStore {
    pub fn new(path: impl Into<PathBuf>, words_per_frame: usize) -> Self {
        BackingStore {
            path: path.into(),
            words_per_frame,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record for `(process, page)`. A failed append is retried
    /// once, then logged and dropped; store writes are best-effort and
    /// never fatal to the caller.
    pub fn write(&self, process: &str, page: usize, words: &[u16]) {
        debug_assert_eq!(words.len(), self.words_per_frame);
        if let Err(first) = self.append_record(process, page, words) {
            log::warn!("backing store append for {}.{} failed ({}), retrying", process, page, first);
            if let Err(second) = self.append_record(process, page, words) {
                log::warn!("backing store append for {}.{} dropped: {}", process, page, second);
            }
        }
    }

    /// Append an all-zero record so later reads of `(process, page)` hit
    /// deterministically.
    pub fn seed_zero(&self, process: &str, page: usize) {
        let zeros = vec![0u16; self.words_per_frame];
        self.write(process, page, &zeros);
    }

    /// Fill `buffer` from the last record for `(process, page)`. Returns
    /// false when no record exists (or the file is unreadable); the caller
    /// zero-fills in that case.
    pub fn read(&self, process: &str, page: usize, buffer: &mut [u16]) -> bool {
        debug_assert_eq!(buffer.len(), self.words_per_frame);
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(_) => return false,
        };

        let key = format!("{}.{}:", process, page);
        let mut found = false;
        for line in BufReader::new(file).lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    log::warn!("backing store read error: {}", err);
                    break;
                }
            };
            if let Some(rest) = line.strip_prefix(&key) {
                let mut words = rest.split_whitespace();
                for slot in buffer.iter_mut() {
                    *slot = words.next().and_then(|w| w.parse().ok()).unwrap_or(0);
                }
                found = true;
            }
        }
        found
    }

    fn append_record(&self, process: &str, page: usize, words: &[u16]) -> io::Result<()> {
        let mut line = format!("{}.{}:", process, page);
        for word in words {
            let _ = write!(line, " {}", word);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(tag: &str, words_per_frame: usize) -> BackingStore {
        let path = std::env::temp_dir().join(format!(
            "osim-store-{}-{}.txt",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        BackingStore::new(path, words_per_frame)
    }

    #[test]
    fn test_missing_key_misses() {
        let store = temp_store("miss", 4);
        let mut buffer = [1u16; 4];
        assert!(!store.read("p00", 0, &mut buffer));
    }

    #[test]
    fn test_write_then_read() {
        let store = temp_store("roundtrip", 4);
        store.write("p00", 2, &[1, 2, 3, 4]);

        let mut buffer = [0u16; 4];
        assert!(store.read("p00", 2, &mut buffer));
        assert_eq!(buffer, [1, 2, 3, 4]);

        // Sibling pages stay independent.
        assert!(!store.read("p00", 0, &mut buffer));
    }

    #[test]
    fn test_last_record_wins() {
        let store = temp_store("lastwins", 2);
        store.write("p00", 0, &[1, 1]);
        store.write("p00", 0, &[2, 2]);
        store.write("p00", 0, &[3, 3]);

        let mut buffer = [0u16; 2];
        assert!(store.read("p00", 0, &mut buffer));
        assert_eq!(buffer, [3, 3]);
    }

    #[test]
    fn test_key_prefix_is_not_ambiguous() {
        // "p0.1:" must not match a read for "p0.11".
        let store = temp_store("prefix", 2);
        store.write("p0", 1, &[7, 7]);

        let mut buffer = [0u16; 2];
        assert!(!store.read("p0", 11, &mut buffer));
        assert!(store.read("p0", 1, &mut buffer));
        assert_eq!(buffer, [7, 7]);
    }

    #[test]
    fn test_seed_zero() {
        let store = temp_store("seed", 3);
        store.seed_zero("p00", 0);

        let mut buffer = [9u16; 3];
        assert!(store.read("p00", 0, &mut buffer));
        assert_eq!(buffer, [0, 0, 0]);
    }
}
