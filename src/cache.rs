//! Read-side caching: whole-file entries for small files and a sliding
//! read-ahead window for large ones.
//!
//! Both structures are TTL-bounded and path-keyed by the engine. A cache
//! entry is only trusted while its size still matches the authoritative
//! file length; a window only serves reads fully contained in its range.
//! Writes and explicit invalidations drop both.

use std::fmt;
use std::time::{Duration, Instant};

/// Files at or below this size are cached whole on first read.
pub const SMALL_FILE_MAX: u64 = 3 * 1024 * 1024;

/// Lifetime of a cache entry or read-ahead window.
pub const CACHE_TTL: Duration = Duration::from_secs(5);

/// Capacity of the read-ahead window used for large files.
pub const READ_AHEAD_WINDOW_SIZE: usize = 16 * 1024 * 1024;

/// Whole-file cache entry for a small file.
pub(crate) struct ReadCache {
    data: Vec<u8>,
    created: Instant,
}

impl ReadCache {
    pub(crate) fn new(data: Vec<u8>) -> ReadCache {
        ReadCache {
            data,
            created: Instant::now(),
        }
    }

    /// An entry serves reads only while it is fresh and still describes a
    /// file of the authoritative length.
    pub(crate) fn is_valid(&self, file_len: u64, ttl: Duration) -> bool {
        self.data.len() as u64 == file_len && self.created.elapsed() <= ttl
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for ReadCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadCache")
            .field("len", &self.data.len())
            .field("age", &self.created.elapsed())
            .finish()
    }
}

/// Sliding read-ahead window over a large file.
pub(crate) struct ReadAheadWindow {
    start: u64,
    data: Vec<u8>,
    created: Instant,
}

impl ReadAheadWindow {
    pub(crate) fn new(start: u64, data: Vec<u8>) -> ReadAheadWindow {
        ReadAheadWindow {
            start,
            data,
            created: Instant::now(),
        }
    }

    pub(crate) fn is_fresh(&self, ttl: Duration) -> bool {
        self.created.elapsed() <= ttl
    }

    /// Whether the byte range `[offset, offset + len)` lies inside the
    /// window.
    pub(crate) fn contains(&self, offset: u64, len: usize) -> bool {
        offset >= self.start && offset + len as u64 <= self.start + self.data.len() as u64
    }

    /// The window bytes for a contained range.
    pub(crate) fn slice(&self, offset: u64, len: usize) -> &[u8] {
        debug_assert!(self.contains(offset, len));
        let rel = (offset - self.start) as usize;
        &self.data[rel..rel + len]
    }
}

impl fmt::Debug for ReadAheadWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadAheadWindow")
            .field("start", &self.start)
            .field("len", &self.data.len())
            .field("age", &self.created.elapsed())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cache_entry_validity() {
        let entry = ReadCache::new(vec![1, 2, 3]);
        assert!(entry.is_valid(3, CACHE_TTL));
        // Authoritative length moved on: stale.
        assert!(!entry.is_valid(4, CACHE_TTL));
        // Zero TTL: expired immediately.
        assert!(!entry.is_valid(3, Duration::ZERO));
    }

    #[test]
    fn window_containment() {
        let window = ReadAheadWindow::new(100, vec![0; 50]);
        assert!(window.contains(100, 50));
        assert!(window.contains(120, 10));
        assert!(!window.contains(99, 1));
        assert!(!window.contains(140, 11));
        assert_eq!(window.slice(110, 5).len(), 5);
    }

    #[test]
    fn window_expiry() {
        let window = ReadAheadWindow::new(0, vec![0; 8]);
        assert!(window.is_fresh(CACHE_TTL));
        assert!(!window.is_fresh(Duration::ZERO));
    }
}
