//! Striping engine: the client-side orchestrator.
//!
//! Ties the write buffer, the read cache and read-ahead window, the
//! striping codec and the connection pool together behind the small
//! surface the host filesystem adapter consumes: `write`, `read`,
//! `flush`, `invalidate`, `remove`, `shutdown`.
//!
//! Per-path state (write buffers, cache entries, windows) lives in maps
//! owned by the engine. The engine does not serialize concurrent calls
//! for the *same* path; the adapter must, as host filesystem layers do by
//! holding the file open. Calls for different paths proceed independently.

use std::collections::HashMap;
use std::io;

use log::{debug, warn};
use parking_lot::Mutex;
use smallvec::{SmallVec, smallvec};

use crate::buffer::{WRITE_BUFFER_CAPACITY, WriteBuffer};
use crate::cache::{CACHE_TTL, READ_AHEAD_WINDOW_SIZE, ReadAheadWindow, ReadCache, SMALL_FILE_MAX};
use crate::config::MAX_NODES;
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;
use crate::proto;
use crate::shadow::MetadataStore;
use crate::stripe;

type FragmentSet = SmallVec<[Option<Vec<u8>>; MAX_NODES]>;

/// The striping engine. Owns the node connections and all per-path
/// staging and caching state; the metadata store is the adapter's shadow
/// tree, consulted for authoritative file lengths.
pub struct StripeEngine<M: MetadataStore> {
    meta: M,
    pool: ConnectionPool,
    buffers: Mutex<HashMap<String, WriteBuffer>>,
    caches: Mutex<HashMap<String, ReadCache>>,
    windows: Mutex<HashMap<String, ReadAheadWindow>>,
}

impl<M: MetadataStore> StripeEngine<M> {
    /// Build an engine over a connected pool. Striping needs at least two
    /// data fragments plus parity; the endpoint ceiling is [`MAX_NODES`].
    pub fn new(meta: M, pool: ConnectionPool) -> Result<StripeEngine<M>> {
        if pool.len() < 3 || pool.len() > MAX_NODES {
            return Err(Error::Config(format!(
                "striping requires between 3 and {MAX_NODES} nodes, got {}",
                pool.len()
            )));
        }
        Ok(StripeEngine {
            meta,
            pool,
            buffers: Mutex::new(HashMap::new()),
            caches: Mutex::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
        })
    }

    /// The metadata store this engine consults.
    pub fn metadata(&self) -> &M {
        &self.meta
    }

    /// The connection pool, exposed for inspection.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Fragment count N (= node count).
    pub fn nodes(&self) -> usize {
        self.pool.len()
    }

    fn stripe_width(&self) -> usize {
        self.nodes() - 1
    }

    /// Stage `data` at absolute file offset `offset`, flushing staged
    /// bytes first if the write falls outside the current buffer window.
    /// Returns the number of bytes accepted, which is all of them.
    pub fn write(&self, path: &str, data: &[u8], offset: u64) -> Result<usize> {
        self.drop_read_state(path);
        if data.is_empty() {
            return Ok(0);
        }
        let mut buffer = self.take_buffer(path);
        let result = self.stage_write(path, &mut buffer, data, offset);
        self.buffers.lock().insert(path.to_string(), buffer);
        result
    }

    fn stage_write(
        &self,
        path: &str,
        buffer: &mut WriteBuffer,
        data: &[u8],
        offset: u64,
    ) -> Result<usize> {
        if data.len() > buffer.capacity() {
            return Err(Error::TooLarge {
                len: data.len(),
                capacity: buffer.capacity(),
            });
        }
        for round in 0..2 {
            if buffer.fits(offset, data.len()) {
                buffer.place(data, offset);
                debug!(
                    "staged {} bytes of {path} at {offset} ({} staged past prefix {})",
                    data.len(),
                    buffer.staged(),
                    buffer.flushed()
                );
                return Ok(data.len());
            }
            if buffer.staged() == 0 || round == 1 {
                break;
            }
            self.transmit(path, buffer, false)?;
        }
        Err(Error::OutOfWindow {
            offset,
            flushed: buffer.flushed(),
        })
    }

    /// Read up to `buf.len()` bytes at `offset`, clamped to the
    /// authoritative file length. Returns 0 at or past end of file.
    pub fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file_len = self.meta.len(path)?;
        if offset >= file_len {
            return Ok(0);
        }
        // Fragment sizing always derives from the authoritative length,
        // never the request: host layers ask for page-aligned ranges that
        // overshoot EOF.
        let want = (buf.len() as u64).min(file_len - offset) as usize;
        let out = &mut buf[..want];

        if file_len <= SMALL_FILE_MAX {
            if self.read_from_cache(path, file_len, offset, out) {
                return Ok(want);
            }
            let fragments = self.fetch_fragments(path, file_len)?;
            let mut content = proto::alloc_payload(file_len as usize)?;
            stripe::decode_range(&fragments, 0, &mut content);
            out.copy_from_slice(&content[offset as usize..offset as usize + want]);
            debug!("cached {path} whole ({file_len} bytes)");
            self.caches.lock().insert(path.to_string(), ReadCache::new(content));
        } else {
            if self.read_from_window(path, offset, out) {
                return Ok(want);
            }
            let window_len = (READ_AHEAD_WINDOW_SIZE as u64).min(file_len - offset) as usize;
            let fragments = self.fetch_fragments(path, file_len)?;
            if want >= window_len {
                // The request covers the whole window; decode straight
                // into the caller's buffer and keep the window as a copy.
                stripe::decode_range(&fragments, offset, out);
                let window = out[..window_len].to_vec();
                self.windows
                    .lock()
                    .insert(path.to_string(), ReadAheadWindow::new(offset, window));
            } else {
                let mut window = proto::alloc_payload(window_len)?;
                stripe::decode_range(&fragments, offset, &mut window);
                out.copy_from_slice(&window[..want]);
                debug!("loaded window [{offset}, {}) of {path}", offset + window_len as u64);
                self.windows
                    .lock()
                    .insert(path.to_string(), ReadAheadWindow::new(offset, window));
            }
        }
        Ok(want)
    }

    /// Transmit all staged bytes for `path` to every node and grow the
    /// shadow length over them. A no-op when nothing is staged. Any node
    /// failure fails the flush as a whole; staged bytes stay put so the
    /// caller may retry.
    pub fn flush(&self, path: &str) -> Result<()> {
        let Some(mut buffer) = self.buffers.lock().remove(path) else {
            return Ok(());
        };
        let result = if buffer.staged() == 0 {
            Ok(())
        } else {
            self.transmit(path, &mut buffer, true)
        };
        self.buffers.lock().insert(path.to_string(), buffer);
        result
    }

    /// Drop cache, window and write buffer for `path`. Called by the
    /// adapter on truncate, rename and unlink.
    pub fn invalidate(&self, path: &str) {
        self.drop_read_state(path);
        self.buffers.lock().remove(path);
    }

    /// Propagate an unlink: drop local state and delete every fragment.
    /// Nodes that never held a fragment of this file answer `ENOENT`,
    /// which is not an error here.
    pub fn remove(&self, path: &str) -> Result<()> {
        self.invalidate(path);
        for node in 0..self.nodes() {
            match self.pool.delete_fragment(node, path) {
                Ok(()) => {}
                Err(Error::Node { errno, .. }) if errno == libc::ENOENT => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Close all node connections and drop all per-path state.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        self.buffers.lock().clear();
        self.caches.lock().clear();
        self.windows.lock().clear();
    }

    fn take_buffer(&self, path: &str) -> WriteBuffer {
        self.buffers
            .lock()
            .remove(path)
            .unwrap_or_else(|| WriteBuffer::new(WRITE_BUFFER_CAPACITY))
    }

    fn drop_read_state(&self, path: &str) {
        self.caches.lock().remove(path);
        self.windows.lock().remove(path);
    }

    fn read_from_cache(&self, path: &str, file_len: u64, offset: u64, out: &mut [u8]) -> bool {
        let mut caches = self.caches.lock();
        if let Some(entry) = caches.get(path) {
            if entry.is_valid(file_len, CACHE_TTL) {
                let start = offset as usize;
                out.copy_from_slice(&entry.data()[start..start + out.len()]);
                debug!("cache hit for {path} at {offset}");
                return true;
            }
            caches.remove(path);
        }
        false
    }

    fn read_from_window(&self, path: &str, offset: u64, out: &mut [u8]) -> bool {
        let mut windows = self.windows.lock();
        if let Some(window) = windows.get(path) {
            if window.is_fresh(CACHE_TTL) && window.contains(offset, out.len()) {
                out.copy_from_slice(window.slice(offset, out.len()));
                debug!("window hit for {path} at {offset}");
                return true;
            }
            // Expired, or a non-sequential read escaped the window.
            windows.remove(path);
        }
        false
    }

    /// Fetch all N fragments of `path`, sized for a file of `file_len`
    /// bytes. Fragments that fail to arrive are tolerated up to the
    /// single-fault limit and rebuilt from the survivors; short fragments
    /// are zero-extended to the nominal length so parity holds.
    fn fetch_fragments(&self, path: &str, file_len: u64) -> Result<Vec<Vec<u8>>> {
        let nodes = self.nodes();
        let frag_len = stripe::fragment_len(file_len, nodes);
        let mut fragments: FragmentSet = smallvec![None; nodes];
        let mut missing = None;
        let mut failures = 0;

        for node in 0..nodes {
            match self.pool.read_fragment(node, path, frag_len, 0) {
                Ok(data) => {
                    let mut fragment = proto::alloc_payload(frag_len as usize)?;
                    let got = data.len().min(fragment.len());
                    fragment[..got].copy_from_slice(&data[..got]);
                    fragments[node] = Some(fragment);
                }
                Err(err) => {
                    warn!("fragment {node} of {path} unavailable: {err}");
                    missing = Some(node);
                    failures += 1;
                }
            }
        }

        let need = nodes - 1;
        if nodes - failures < need {
            return Err(Error::Degraded {
                got: nodes - failures,
                need,
            });
        }
        if let Some(node) = missing {
            warn!("rebuilding fragment {node} of {path} from parity");
            let rebuilt = stripe::rebuild(
                fragments.iter().flatten().map(|f| f.as_slice()),
                frag_len as usize,
            );
            fragments[node] = Some(rebuilt);
        }
        Ok(fragments.into_iter().flatten().collect())
    }

    /// Stripe staged bytes out to every node. Capacity-driven calls
    /// (`all == false`) send only whole stripe columns; an explicit flush
    /// sends everything, zero-padding a partial final column on the wire.
    /// The bytes of a partial column stay staged and the flushed prefix
    /// advances only to the column boundary, so a later flush overwrites
    /// that fragment row once more bytes arrive and appends keep working
    /// across flushes of any length.
    fn transmit(&self, path: &str, buffer: &mut WriteBuffer, all: bool) -> Result<()> {
        let width = self.stripe_width();
        let take = if all {
            buffer.staged()
        } else {
            buffer.aligned_prefix(width)
        };
        if take == 0 {
            return Ok(());
        }
        debug_assert_eq!(buffer.flushed() % width as u64, 0);

        let fragments = stripe::encode(&buffer.staged_bytes()[..take], self.nodes());
        let fragment_offset = (buffer.flushed() / width as u64) as i64;
        for (node, fragment) in fragments.iter().enumerate() {
            let written = self.pool.write_fragment(node, path, fragment, fragment_offset)?;
            if written != fragment.len() as u64 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("node {node} accepted {written} of {} bytes", fragment.len()),
                )));
            }
        }
        let transmitted_end = buffer.flushed() + take as u64;
        buffer.consume(take - take % width);
        self.meta.extend_to(path, transmitted_end)?;
        debug!(
            "flushed {take} bytes of {path}; prefix now {} ({} residual staged)",
            buffer.flushed(),
            buffer.staged()
        );
        Ok(())
    }
}

impl<M: MetadataStore> std::fmt::Debug for StripeEngine<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeEngine")
            .field("nodes", &self.nodes())
            .field("buffers", &self.buffers.lock().len())
            .field("caches", &self.caches.lock().len())
            .field("windows", &self.windows.lock().len())
            .finish()
    }
}
