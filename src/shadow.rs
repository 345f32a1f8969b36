//! Metadata shadow tree.
//!
//! The host filesystem adapter keeps one local file per user-visible file
//! under a root directory. Those files carry no content; their length,
//! mode, timestamps and xattrs are the authoritative POSIX metadata for
//! the store, while the content bytes live striped across the nodes. The
//! striping engine touches the shadow tree through the narrow
//! [`MetadataStore`] boundary: it asks for the authoritative length before
//! a read, and grows the recorded length after a flush. Everything else
//! (directory structure, permissions, rename) is the adapter's business
//! and never reaches the engine.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// The engine-facing slice of the metadata shadow tree.
pub trait MetadataStore {
    /// Authoritative length of the logical file at `path`.
    fn len(&self, path: &str) -> Result<u64>;

    /// Record that the flushed prefix of `path` now reaches `len`,
    /// growing the stored length if it was shorter. Never shrinks.
    fn extend_to(&self, path: &str, len: u64) -> Result<()>;
}

/// Shadow tree rooted at a local directory.
#[derive(Debug, Clone)]
pub struct ShadowTree {
    root: PathBuf,
}

impl ShadowTree {
    /// Open an existing root directory. A missing root is a configuration
    /// error surfaced before any file operation.
    pub fn open(root: impl Into<PathBuf>) -> Result<ShadowTree> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::Config(format!(
                "rootDir {} is not an existing directory",
                root.display()
            )));
        }
        Ok(ShadowTree { root })
    }

    /// The shadow tree's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a logical path onto the underlying shadow file.
    pub fn shadow_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Create an empty shadow file for a new logical file.
    pub fn create(&self, path: &str) -> Result<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.shadow_path(path))?;
        Ok(())
    }

    /// Set the recorded length, growing or shrinking. Fragment files on
    /// the nodes keep their old tail after a shrink; readers never see it
    /// because every read is clamped to this length.
    pub fn truncate(&self, path: &str, len: u64) -> Result<()> {
        let file = OpenOptions::new().write(true).open(self.shadow_path(path))?;
        file.set_len(len)?;
        Ok(())
    }

    /// Remove the shadow file for an unlinked logical file.
    pub fn remove(&self, path: &str) -> Result<()> {
        fs::remove_file(self.shadow_path(path))?;
        Ok(())
    }
}

impl MetadataStore for ShadowTree {
    fn len(&self, path: &str) -> Result<u64> {
        Ok(fs::metadata(self.shadow_path(path))?.len())
    }

    fn extend_to(&self, path: &str, len: u64) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.shadow_path(path))?;
        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_root_is_a_config_error() {
        let err = ShadowTree::open("/definitely/not/a/real/rootdir").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn extend_grows_but_never_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let tree = ShadowTree::open(dir.path()).unwrap();

        tree.extend_to("/a.txt", 100).unwrap();
        assert_eq!(tree.len("/a.txt").unwrap(), 100);

        tree.extend_to("/a.txt", 50).unwrap();
        assert_eq!(tree.len("/a.txt").unwrap(), 100);

        tree.truncate("/a.txt", 10).unwrap();
        assert_eq!(tree.len("/a.txt").unwrap(), 10);
    }

    #[test]
    fn missing_shadow_file_maps_to_enoent() {
        let dir = tempfile::tempdir().unwrap();
        let tree = ShadowTree::open(dir.path()).unwrap();
        let err = tree.len("/nope").unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn create_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let tree = ShadowTree::open(dir.path()).unwrap();
        tree.create("/f").unwrap();
        assert_eq!(tree.len("/f").unwrap(), 0);
        // Second create of the same path must not clobber.
        assert!(tree.create("/f").is_err());
        tree.remove("/f").unwrap();
        assert!(tree.len("/f").is_err());
    }
}
