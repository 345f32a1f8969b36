//! Client mount configuration.
//!
//! The client is invoked as
//! `stripefs [host-fs options] <rootDir> <mountPoint> [host1:port1 …]`.
//! Arguments are classified the same way the store always has: anything
//! starting with `-` belongs to the host filesystem layer and is passed
//! through untouched, anything containing a colon is a storage node
//! endpoint, and the first two remaining arguments are the shadow-tree
//! root and the mount point. Zero endpoints selects pass-through mode, in
//! which the host layer serves everything from the shadow tree and no
//! distributed I/O happens.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Maximum number of storage node endpoints per mount.
pub const MAX_NODES: usize = 10;

/// One storage node as addressed by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddr {
    /// IP literal or resolvable hostname.
    pub host: String,
    /// TCP port the node listens on.
    pub port: u16,
}

impl FromStr for NodeAddr {
    type Err = Error;

    fn from_str(spec: &str) -> Result<NodeAddr> {
        let (host, port) = spec
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("node spec {spec:?} is not host:port")))?;
        if host.is_empty() {
            return Err(Error::Config(format!("node spec {spec:?} has an empty host")));
        }
        let port = port
            .parse()
            .map_err(|_| Error::Config(format!("node spec {spec:?} has an invalid port")))?;
        Ok(NodeAddr {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parsed client invocation.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Location of the metadata shadow tree. Must already exist.
    pub root_dir: PathBuf,
    /// Where the host filesystem layer mounts the store.
    pub mount_point: PathBuf,
    /// Storage node endpoints, in fragment-index order.
    pub nodes: Vec<NodeAddr>,
    /// Options that belong to the host filesystem layer, in original order.
    pub host_options: Vec<String>,
}

impl MountConfig {
    /// Classify the command line (without the program name).
    pub fn parse<I>(args: I) -> Result<MountConfig>
    where
        I: IntoIterator<Item = String>,
    {
        let mut root_dir = None;
        let mut mount_point = None;
        let mut nodes = Vec::new();
        let mut host_options = Vec::new();

        for arg in args {
            if arg.starts_with('-') {
                host_options.push(arg);
            } else if arg.contains(':') {
                if nodes.len() == MAX_NODES {
                    return Err(Error::Config(format!(
                        "more than {MAX_NODES} node endpoints"
                    )));
                }
                nodes.push(arg.parse()?);
            } else if root_dir.is_none() {
                root_dir = Some(PathBuf::from(arg));
            } else if mount_point.is_none() {
                mount_point = Some(PathBuf::from(arg));
            } else {
                return Err(Error::Config(format!("unexpected argument {arg:?}")));
            }
        }

        Ok(MountConfig {
            root_dir: root_dir.ok_or_else(|| Error::Config("missing rootDir".to_string()))?,
            mount_point: mount_point
                .ok_or_else(|| Error::Config("missing mountPoint".to_string()))?,
            nodes,
            host_options,
        })
    }

    /// No endpoints configured: serve everything from the shadow tree.
    pub fn is_pass_through(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Refuse to run as the super-user. The store relies on the host layer's
/// ordinary access checks, which root bypasses wholesale.
pub fn refuse_root() -> Result<()> {
    use nix::unistd::Uid;
    if Uid::current().is_root() || Uid::effective().is_root() {
        return Err(Error::Config(
            "running as root would bypass all access checking; refusing".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn classifies_options_dirs_and_nodes() {
        let config = MountConfig::parse(args(&[
            "-f",
            "rootdir",
            "-o",
            "mountdir",
            "10.0.1.5:8001",
            "10.0.1.6:8002",
            "10.0.1.7:8003",
        ]))
        .unwrap();
        assert_eq!(config.root_dir, PathBuf::from("rootdir"));
        assert_eq!(config.mount_point, PathBuf::from("mountdir"));
        assert_eq!(config.host_options, args(&["-f", "-o"]));
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.nodes[0], "10.0.1.5:8001".parse().unwrap());
        assert!(!config.is_pass_through());
    }

    #[test]
    fn zero_nodes_is_pass_through() {
        let config = MountConfig::parse(args(&["rootdir", "mountdir"])).unwrap();
        assert!(config.is_pass_through());
    }

    #[test]
    fn missing_directories_are_rejected() {
        assert!(MountConfig::parse(args(&["rootdir"])).is_err());
        assert!(MountConfig::parse(args(&[])).is_err());
    }

    #[test]
    fn endpoint_limit_enforced() {
        let mut list = vec!["rootdir".to_string(), "mountdir".to_string()];
        for port in 0..=MAX_NODES {
            list.push(format!("node{port}:{}", 8000 + port));
        }
        assert!(MountConfig::parse(list).is_err());
    }

    #[test]
    fn node_spec_parsing() {
        let addr: NodeAddr = "storage-3.internal:9100".parse().unwrap();
        assert_eq!(addr.host, "storage-3.internal");
        assert_eq!(addr.port, 9100);
        assert_eq!(addr.to_string(), "storage-3.internal:9100");

        assert!("no-port".parse::<NodeAddr>().is_err());
        assert!(":8000".parse::<NodeAddr>().is_err());
        assert!("host:notaport".parse::<NodeAddr>().is_err());
    }
}
