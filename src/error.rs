//! Error taxonomy for the striping engine and its collaborators.
//!
//! Adapters sitting between a host filesystem layer and the engine usually
//! need a POSIX error number rather than a Rust error value; [`Error::errno`]
//! provides that mapping so callers can negate it for the host layer.

use std::fmt;
use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the client-side engine, pool and shadow tree.
#[derive(Debug)]
pub enum Error {
    /// Invalid startup or mount configuration. Surfaced before any I/O.
    Config(String),
    /// Local I/O failure: shadow tree access or a node connection that
    /// stayed broken after the reconnect attempt.
    Io(io::Error),
    /// A storage node answered a request with a failure status.
    Node {
        /// Index of the responding node.
        node: usize,
        /// The errno the node reported.
        errno: i32,
    },
    /// Fewer than N−1 fragments could be fetched; reconstruction is
    /// impossible and the read fails as a whole.
    Degraded {
        /// Fragments successfully fetched.
        got: usize,
        /// Minimum fragments required.
        need: usize,
    },
    /// A single write larger than the staging buffer capacity.
    TooLarge {
        /// Length of the rejected write.
        len: usize,
        /// The buffer capacity it exceeded.
        capacity: usize,
    },
    /// A write that the staging buffer cannot represent: it falls before
    /// the flushed prefix, or past the buffer window with nothing staged
    /// to flush.
    OutOfWindow {
        /// Absolute file offset of the rejected write.
        offset: u64,
        /// Bytes already transmitted to the nodes.
        flushed: u64,
    },
}

impl Error {
    /// POSIX error number equivalent, for adapters that report `-errno`.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Config(_) => libc::EINVAL,
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Error::Node { errno, .. } => *errno,
            Error::Degraded { .. } => libc::EIO,
            Error::TooLarge { .. } => libc::EFBIG,
            Error::OutOfWindow { .. } => libc::EINVAL,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "configuration error: {msg}"),
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::Node { node, errno } => {
                write!(f, "node {node} reported errno {errno}")
            }
            Error::Degraded { got, need } => write!(
                f,
                "insufficient redundancy: {got} of the {need} required fragments"
            ),
            Error::TooLarge { len, capacity } => write!(
                f,
                "write of {len} bytes exceeds the {capacity} byte staging buffer"
            ),
            Error::OutOfWindow { offset, flushed } => write!(
                f,
                "write at offset {offset} is outside the staging window (flushed prefix {flushed})"
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::Degraded { got: 1, need: 2 }.errno(), libc::EIO);
        assert_eq!(
            Error::TooLarge {
                len: 1,
                capacity: 0
            }
            .errno(),
            libc::EFBIG
        );
        assert_eq!(
            Error::Node {
                node: 0,
                errno: libc::ENOENT
            }
            .errno(),
            libc::ENOENT
        );
        let io = Error::Io(io::Error::from_raw_os_error(libc::ECONNRESET));
        assert_eq!(io.errno(), libc::ECONNRESET);
    }
}
