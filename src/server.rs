//! Storage node protocol server.
//!
//! Binds a TCP port, accepts connections, and runs one worker thread per
//! connection. Each worker loops over request headers and dispatches:
//! WRITE stores payload bytes into a fragment file (truncating it when the
//! offset is 0), READ returns up to the requested byte count from a
//! fragment file (a short result signals fragment EOF and is not an
//! error), DELETE unlinks a fragment file. System errors are reported in
//! the response with their errno and the connection stays open; only a
//! receive failure or peer disconnect ends a worker.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::FileExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::proto::{self, OpCode, RequestHeader, ResponseHeader};

/// A bound but not yet serving node server.
#[derive(Debug)]
pub struct NodeServer {
    listener: TcpListener,
    storage_dir: PathBuf,
}

#[derive(Default)]
struct ServerState {
    stopped: AtomicBool,
    workers: Mutex<Vec<TcpStream>>,
}

/// Handle to a server running on a background thread.
pub struct ServerHandle {
    addr: SocketAddr,
    state: Arc<ServerState>,
    thread: JoinHandle<io::Result<()>>,
}

impl NodeServer {
    /// Bind `port` on all interfaces and create the storage directory if
    /// it is missing. Port 0 picks an ephemeral port.
    pub fn bind(port: u16, storage_dir: impl Into<PathBuf>) -> io::Result<NodeServer> {
        let storage_dir = storage_dir.into();
        fs::create_dir_all(&storage_dir)?;
        let listener = bind_all_interfaces(port)?;
        Ok(NodeServer {
            listener,
            storage_dir,
        })
    }

    /// The bound address; useful with an ephemeral port.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve forever on the calling thread.
    pub fn run(self) -> io::Result<()> {
        self.serve(Arc::new(ServerState::default()))
    }

    /// Serve on a background thread, returning a handle that can stop the
    /// server and tear down its worker connections.
    pub fn spawn(self) -> io::Result<ServerHandle> {
        let addr = self.local_addr()?;
        let state = Arc::new(ServerState::default());
        let thread_state = Arc::clone(&state);
        let thread = thread::spawn(move || self.serve(thread_state));
        Ok(ServerHandle {
            addr,
            state,
            thread,
        })
    }

    fn serve(self, state: Arc<ServerState>) -> io::Result<()> {
        info!(
            "listening on {} with storage {}",
            self.local_addr()?,
            self.storage_dir.display()
        );
        for connection in self.listener.incoming() {
            if state.stopped.load(Ordering::SeqCst) {
                break;
            }
            let stream = match connection {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("accept failed: {err}");
                    continue;
                }
            };
            match stream.peer_addr() {
                Ok(peer) => info!("client connected from {peer}"),
                Err(_) => info!("client connected"),
            }
            if let Ok(clone) = stream.try_clone() {
                state.workers.lock().push(clone);
            }
            let storage_dir = self.storage_dir.clone();
            thread::spawn(move || {
                if let Err(err) = serve_connection(stream, &storage_dir) {
                    warn!("worker terminated: {err}");
                }
            });
        }
        info!("server on {} stopped", self.local_addr()?);
        Ok(())
    }
}

impl ServerHandle {
    /// The address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting, shut every worker connection down, and join the
    /// accept thread.
    pub fn stop(self) -> io::Result<()> {
        self.state.stopped.store(true, Ordering::SeqCst);
        for stream in self.state.workers.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
        // Wake the accept loop so it observes the stop flag.
        let poke = SocketAddr::from(([127, 0, 0, 1], self.addr.port()));
        let _ = TcpStream::connect(poke);
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => Err(io::Error::other("server thread panicked")),
        }
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle").field("addr", &self.addr).finish()
    }
}

/// Bind a listener with `SO_REUSEADDR`, so a node restarted on the same
/// port does not trip over connections lingering in TIME_WAIT.
fn bind_all_interfaces(port: u16) -> io::Result<TcpListener> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&raw const one).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            (&raw const addr).cast(),
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { libc::listen(fd.as_raw_fd(), 10) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(TcpListener::from(fd))
}

fn serve_connection(mut stream: TcpStream, storage_dir: &Path) -> io::Result<()> {
    loop {
        let header = match RequestHeader::receive(&mut stream) {
            Ok(header) => header,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                info!("client disconnected");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        match header.opcode()? {
            OpCode::Write => handle_write(&mut stream, storage_dir, &header)?,
            OpCode::Read => handle_read(&mut stream, storage_dir, &header)?,
            OpCode::Delete => handle_delete(&mut stream, storage_dir, &header)?,
        }
    }
}

fn handle_write(stream: &mut TcpStream, storage_dir: &Path, header: &RequestHeader) -> io::Result<()> {
    // The payload always follows the header; it must be consumed before any
    // reply or the stream framing desynchronizes.
    let mut payload = match proto::alloc_payload(header.size as usize) {
        Ok(payload) => payload,
        Err(err) => {
            discard_exact(stream, header.size)?;
            return ResponseHeader::error(errno_of(&err)).send(stream);
        }
    };
    stream.read_exact(&mut payload)?;

    let response = match write_fragment(storage_dir, header, &payload) {
        Ok(written) => {
            debug!(
                "wrote {written} bytes at offset {} of fragment {}",
                header.offset, header.fragment_id
            );
            ResponseHeader::ok(written)
        }
        Err(err) => {
            warn!("write failed: {err}");
            ResponseHeader::error(errno_of(&err))
        }
    };
    response.send(stream)
}

fn handle_read(stream: &mut TcpStream, storage_dir: &Path, header: &RequestHeader) -> io::Result<()> {
    match read_fragment(storage_dir, header) {
        Ok(payload) => {
            debug!(
                "read {} of {} requested bytes from fragment {}",
                payload.len(),
                header.size,
                header.fragment_id
            );
            ResponseHeader::ok(payload.len() as u64).send(stream)?;
            stream.write_all(&payload)
        }
        Err(err) => {
            warn!("read failed: {err}");
            ResponseHeader::error(errno_of(&err)).send(stream)
        }
    }
}

fn handle_delete(stream: &mut TcpStream, storage_dir: &Path, header: &RequestHeader) -> io::Result<()> {
    let response = match fragment_path(storage_dir, header).and_then(|path| fs::remove_file(path)) {
        Ok(()) => {
            debug!("deleted fragment {}", header.fragment_id);
            ResponseHeader::ok(0)
        }
        Err(err) => {
            warn!("delete failed: {err}");
            ResponseHeader::error(errno_of(&err))
        }
    };
    response.send(stream)
}

fn write_fragment(storage_dir: &Path, header: &RequestHeader, payload: &[u8]) -> io::Result<u64> {
    let path = fragment_path(storage_dir, header)?;
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(header.offset == 0)
        .open(&path)?;
    file.write_all_at(payload, header.offset as u64)?;
    Ok(payload.len() as u64)
}

/// Read and throw away exactly `len` payload bytes, keeping the stream
/// framed when a request cannot be buffered.
fn discard_exact(stream: &mut TcpStream, mut len: u64) -> io::Result<()> {
    let mut scratch = [0u8; 8192];
    while len > 0 {
        let chunk = len.min(scratch.len() as u64) as usize;
        stream.read_exact(&mut scratch[..chunk])?;
        len -= chunk as u64;
    }
    Ok(())
}

fn read_fragment(storage_dir: &Path, header: &RequestHeader) -> io::Result<Vec<u8>> {
    let path = fragment_path(storage_dir, header)?;
    let file = File::open(&path)?;
    let mut payload = proto::alloc_payload(header.size as usize)?;
    let mut filled = 0;
    while filled < payload.len() {
        let n = file.read_at(&mut payload[filled..], header.offset as u64 + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    payload.truncate(filled);
    Ok(payload)
}

/// Map the wire filename onto `<storage_dir>/<name>.frag<id>`. Interior
/// slashes mirror sub-paths; absolute names and `..` components are
/// rejected before any filesystem access.
fn fragment_path(storage_dir: &Path, header: &RequestHeader) -> io::Result<PathBuf> {
    let name = proto::unpack_name(&header.filename)?;
    if Path::new(name)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unacceptable fragment name {name:?}"),
        ));
    }
    Ok(storage_dir.join(format!("{name}.frag{}", header.fragment_id)))
}

fn errno_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(match err.kind() {
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => libc::EINVAL,
        _ => libc::EIO,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proto::FILENAME_LEN;

    fn header_for(name: &str, fragment_id: u32) -> RequestHeader {
        RequestHeader::new(OpCode::Read, proto::pack_name(name).unwrap(), fragment_id, 0, 0)
    }

    #[test]
    fn fragment_paths_mirror_sub_paths() {
        let dir = Path::new("/store");
        let path = fragment_path(dir, &header_for("/a/b/c.dat", 2)).unwrap();
        assert_eq!(path, Path::new("/store/a/b/c.dat.frag2"));
    }

    #[test]
    fn traversal_names_are_rejected() {
        let dir = Path::new("/store");
        assert!(fragment_path(dir, &header_for("../escape", 0)).is_err());
        assert!(fragment_path(dir, &header_for("a/../../b", 0)).is_err());

        let mut raw = [0u8; FILENAME_LEN];
        raw[..7].copy_from_slice(b"/abs/xx");
        let header = RequestHeader::new(OpCode::Read, raw, 0, 0, 0);
        assert!(fragment_path(dir, &header).is_err());
    }
}
