//! Single-parity striped distributed file store.
//!
//! `stripefs` stripes each file byte-round-robin across N−1 data fragments
//! plus one XOR parity fragment, one fragment per storage node, so any
//! single node can be lost without losing data. The node side is a small
//! TCP protocol server keeping fragments as plain files in a directory;
//! the client side is a striping engine with buffered write aggregation, a
//! size-keyed read cache, a sliding read-ahead window for large files, and
//! per-node reconnect.
//!
//! The crate provides both halves as building blocks: a host filesystem
//! frontend (FUSE or similar) owns the POSIX surface and the metadata
//! shadow tree, serializes operations per path, and drives
//! [`StripeEngine`] for file content. Only read, write, flush and release
//! ever reach the engine; every other file operation is metadata and stays
//! in the shadow tree.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::buffer::WRITE_BUFFER_CAPACITY;
pub use crate::cache::CACHE_TTL;
pub use crate::cache::READ_AHEAD_WINDOW_SIZE;
pub use crate::cache::SMALL_FILE_MAX;
pub use crate::config::MAX_NODES;
pub use crate::config::MountConfig;
pub use crate::config::NodeAddr;
pub use crate::config::refuse_root;
pub use crate::engine::StripeEngine;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::pool::ConnectionPool;
pub use crate::server::NodeServer;
pub use crate::server::ServerHandle;
pub use crate::shadow::MetadataStore;
pub use crate::shadow::ShadowTree;

mod buffer;
mod cache;
mod config;
mod engine;
mod error;
mod pool;
mod proto;
mod server;
mod shadow;
pub mod stripe;
