//! Client-side connection pool.
//!
//! One persistent stream per storage node, indexed by node (= fragment)
//! index. Every request/response exchange runs under that node's
//! exclusive-use lock, covering the whole header → payload → response
//! sequence, so pairs are linearizable per endpoint. On an I/O failure the
//! endpoint is reconnected once and the exchange retried exactly once; a
//! mid-exchange failure leaves the stream with half a request on it, so
//! the reconnect is what makes the retry sound.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{info, warn};
use parking_lot::Mutex;

use crate::config::NodeAddr;
use crate::error::{Error, Result};
use crate::proto::{self, OpCode, RequestHeader, ResponseHeader};

enum Connection {
    Connected(TcpStream),
    Disconnected,
}

struct NodeEndpoint {
    addr: NodeAddr,
    conn: Mutex<Connection>,
}

/// Pool of persistent node connections.
pub struct ConnectionPool {
    endpoints: Vec<NodeEndpoint>,
    requests: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Resolve and connect every endpoint. Failing to reach any node at
    /// startup is a configuration error and aborts the mount.
    pub fn connect(addrs: &[NodeAddr]) -> Result<ConnectionPool> {
        let mut endpoints = Vec::with_capacity(addrs.len());
        for (node, addr) in addrs.iter().enumerate() {
            let stream = open_stream(addr)
                .map_err(|err| Error::Config(format!("cannot reach node {node} at {addr}: {err}")))?;
            info!("connected to node {node} at {addr}");
            endpoints.push(NodeEndpoint {
                addr: addr.clone(),
                conn: Mutex::new(Connection::Connected(stream)),
            });
        }
        Ok(ConnectionPool {
            endpoints,
            requests: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of endpoints (equals the fragment count N).
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether the pool has no endpoints.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Total requests issued since the pool was created. Retries of a
    /// failed exchange do not count twice.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Store `payload` into fragment `node` of `path` at `offset` fragment
    /// bytes. Offset 0 truncates the fragment file on the node.
    pub fn write_fragment(
        &self,
        node: usize,
        path: &str,
        payload: &[u8],
        offset: i64,
    ) -> Result<u64> {
        let header = RequestHeader::new(
            OpCode::Write,
            proto::pack_name(path)?,
            node as u32,
            payload.len() as u64,
            offset,
        );
        let (response, _) = self.exchange(node, &header, Some(payload), false)?;
        Ok(response.size)
    }

    /// Fetch up to `len` bytes of fragment `node` of `path` starting at
    /// `offset`. A shorter result is not an error: it reports the stored
    /// fragment length.
    pub fn read_fragment(&self, node: usize, path: &str, len: u64, offset: i64) -> Result<Vec<u8>> {
        let header = RequestHeader::new(OpCode::Read, proto::pack_name(path)?, node as u32, len, offset);
        let (_, payload) = self.exchange(node, &header, None, true)?;
        Ok(payload)
    }

    /// Unlink fragment `node` of `path`.
    pub fn delete_fragment(&self, node: usize, path: &str) -> Result<()> {
        let header = RequestHeader::new(OpCode::Delete, proto::pack_name(path)?, node as u32, 0, 0);
        self.exchange(node, &header, None, false)?;
        Ok(())
    }

    /// Close every connection and refuse further requests.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for endpoint in &self.endpoints {
            let mut conn = endpoint.conn.lock();
            if let Connection::Connected(stream) = &*conn {
                let _ = stream.shutdown(Shutdown::Both);
            }
            *conn = Connection::Disconnected;
        }
    }

    fn exchange(
        &self,
        node: usize,
        header: &RequestHeader,
        payload: Option<&[u8]>,
        want_payload: bool,
    ) -> Result<(ResponseHeader, Vec<u8>)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection pool is shut down",
            )));
        }
        self.requests.fetch_add(1, Ordering::Relaxed);
        let endpoint = &self.endpoints[node];
        let mut conn = endpoint.conn.lock();

        if let Connection::Connected(stream) = &mut *conn {
            match attempt(stream, header, payload, want_payload) {
                Ok(result) => return node_status(node, result),
                Err(err) => {
                    warn!("node {node} exchange failed ({err}), reconnecting to {}", endpoint.addr);
                    *conn = Connection::Disconnected;
                }
            }
        }

        let mut stream = open_stream(&endpoint.addr).map_err(|err| {
            warn!("reconnect to node {node} at {} failed: {err}", endpoint.addr);
            Error::Io(err)
        })?;
        info!("reconnected to node {node} at {}", endpoint.addr);
        match attempt(&mut stream, header, payload, want_payload) {
            Ok(result) => {
                *conn = Connection::Connected(stream);
                node_status(node, result)
            }
            Err(err) => Err(Error::Io(err)),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoints", &self.endpoints.len())
            .field("requests", &self.request_count())
            .finish()
    }
}

/// Run one full exchange on an established stream.
fn attempt(
    stream: &mut TcpStream,
    header: &RequestHeader,
    payload: Option<&[u8]>,
    want_payload: bool,
) -> io::Result<(ResponseHeader, Vec<u8>)> {
    header.send(stream)?;
    if let Some(bytes) = payload {
        stream.write_all(bytes)?;
    }
    let response = ResponseHeader::receive(stream)?;
    let mut data = Vec::new();
    if want_payload && response.status == 0 && response.size > 0 {
        if response.size > header.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("node returned {} bytes for a {} byte read", response.size, header.size),
            ));
        }
        data = proto::alloc_payload(response.size as usize)?;
        stream.read_exact(&mut data)?;
    }
    Ok((response, data))
}

fn node_status(
    node: usize,
    (response, data): (ResponseHeader, Vec<u8>),
) -> Result<(ResponseHeader, Vec<u8>)> {
    if response.status != 0 {
        return Err(Error::Node {
            node,
            errno: response.error_code,
        });
    }
    Ok((response, data))
}

/// Dial an endpoint, trying the host as an IP literal before falling back
/// to name resolution.
fn open_stream(addr: &NodeAddr) -> io::Result<TcpStream> {
    let stream = match addr.host.parse::<IpAddr>() {
        Ok(ip) => TcpStream::connect(SocketAddr::new(ip, addr.port))?,
        Err(_) => {
            let resolved = (addr.host.as_str(), addr.port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("host {:?} resolved to no addresses", addr.host),
                    )
                })?;
            TcpStream::connect(resolved)?
        }
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}
