//! On-wire request and response records.
//!
//! Both records are fixed-layout `#[repr(C)]` structs transmitted verbatim
//! on a stream socket. The deployment is single-architecture, so fields are
//! carried in host byte order. Field order differs from arrival order of
//! the logical description: fields are sorted so the structs contain no
//! padding, which the `zerocopy` derives verify at compile time.
//!
//! Framing: a WRITE is header ‖ payload ‖ response; a READ is header ‖
//! response ‖ payload (payload only on success); a DELETE is header ‖
//! response. All records and payloads are read with exact-length semantics;
//! a short read is fatal for the connection it happened on.

use std::io::{self, Read, Write};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Size of the zero-padded filename field. Names must leave room for at
/// least one terminating zero byte.
pub(crate) const FILENAME_LEN: usize = 256;

/// Request discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub(crate) enum OpCode {
    /// Store payload bytes into a fragment file at an offset.
    Write = 1,
    /// Fetch up to `size` bytes of a fragment file from an offset.
    Read = 2,
    /// Unlink a fragment file.
    Delete = 3,
}

/// Fixed-layout request record.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub(crate) struct RequestHeader {
    pub(crate) op: u32,
    pub(crate) fragment_id: u32,
    pub(crate) size: u64,
    pub(crate) offset: i64,
    pub(crate) filename: [u8; FILENAME_LEN],
}

impl RequestHeader {
    pub(crate) fn new(
        op: OpCode,
        filename: [u8; FILENAME_LEN],
        fragment_id: u32,
        size: u64,
        offset: i64,
    ) -> RequestHeader {
        RequestHeader {
            op: op.into(),
            fragment_id,
            size,
            offset,
            filename,
        }
    }

    /// Receive one header with exact-length semantics.
    pub(crate) fn receive(stream: &mut impl Read) -> io::Result<RequestHeader> {
        let mut buf = [0u8; size_of::<RequestHeader>()];
        stream.read_exact(&mut buf)?;
        RequestHeader::read_from_bytes(&buf)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed request header"))
    }

    pub(crate) fn send(&self, stream: &mut impl Write) -> io::Result<()> {
        stream.write_all(self.as_bytes())
    }

    pub(crate) fn opcode(&self) -> io::Result<OpCode> {
        OpCode::try_from(self.op).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown request type {}", self.op),
            )
        })
    }
}

/// Fixed-layout response record. `size` is the payload length for READ and
/// the echo of bytes written for WRITE; zero otherwise.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub(crate) struct ResponseHeader {
    pub(crate) status: i32,
    pub(crate) error_code: i32,
    pub(crate) size: u64,
}

impl ResponseHeader {
    pub(crate) fn ok(size: u64) -> ResponseHeader {
        ResponseHeader {
            status: 0,
            error_code: 0,
            size,
        }
    }

    pub(crate) fn error(errno: i32) -> ResponseHeader {
        ResponseHeader {
            status: -1,
            error_code: errno,
            size: 0,
        }
    }

    pub(crate) fn receive(stream: &mut impl Read) -> io::Result<ResponseHeader> {
        let mut buf = [0u8; size_of::<ResponseHeader>()];
        stream.read_exact(&mut buf)?;
        ResponseHeader::read_from_bytes(&buf)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed response header"))
    }

    pub(crate) fn send(&self, stream: &mut impl Write) -> io::Result<()> {
        stream.write_all(self.as_bytes())
    }
}

/// Pack a logical path into the wire filename field, stripping the leading
/// slash. Interior slashes travel verbatim; the node mirrors them as
/// sub-paths of its storage directory.
pub(crate) fn pack_name(path: &str) -> io::Result<[u8; FILENAME_LEN]> {
    let name = path.strip_prefix('/').unwrap_or(path);
    if name.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty logical path",
        ));
    }
    if name.len() >= FILENAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("logical path longer than {} bytes: {name:?}", FILENAME_LEN - 1),
        ));
    }
    let mut field = [0u8; FILENAME_LEN];
    field[..name.len()].copy_from_slice(name.as_bytes());
    Ok(field)
}

/// Allocate a zeroed payload buffer, surfacing allocation failure as
/// `ENOMEM` instead of aborting. Fragment and window buffers are sized by
/// peer-supplied or file-length-derived values, so allocation is a
/// recoverable error here, not a programming bug.
pub(crate) fn alloc_payload(len: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| io::Error::from_raw_os_error(libc::ENOMEM))?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Recover the logical name from a wire filename field.
pub(crate) fn unpack_name(field: &[u8; FILENAME_LEN]) -> io::Result<&str> {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    if end == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "empty wire filename",
        ));
    }
    std::str::from_utf8(&field[..end])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 wire filename"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_round_trip() {
        let name = pack_name("/dir/file.bin").unwrap();
        let req = RequestHeader::new(OpCode::Write, name, 2, 4096, 1024);
        let mut wire = Vec::new();
        req.send(&mut wire).unwrap();
        assert_eq!(wire.len(), size_of::<RequestHeader>());

        let decoded = RequestHeader::receive(&mut wire.as_slice()).unwrap();
        assert_eq!(decoded.opcode().unwrap(), OpCode::Write);
        assert_eq!(decoded.fragment_id, 2);
        assert_eq!(decoded.size, 4096);
        assert_eq!(decoded.offset, 1024);
        assert_eq!(unpack_name(&decoded.filename).unwrap(), "dir/file.bin");
    }

    #[test]
    fn response_round_trip() {
        let mut wire = Vec::new();
        ResponseHeader::ok(77).send(&mut wire).unwrap();
        ResponseHeader::error(libc::ENOENT).send(&mut wire).unwrap();

        let mut cursor = wire.as_slice();
        let ok = ResponseHeader::receive(&mut cursor).unwrap();
        assert_eq!(ok.status, 0);
        assert_eq!(ok.size, 77);
        let err = ResponseHeader::receive(&mut cursor).unwrap();
        assert_eq!(err.status, -1);
        assert_eq!(err.error_code, libc::ENOENT);
    }

    #[test]
    fn unknown_opcode_rejected() {
        let req = RequestHeader {
            op: 9,
            fragment_id: 0,
            size: 0,
            offset: 0,
            filename: [0; FILENAME_LEN],
        };
        assert!(req.opcode().is_err());
    }

    #[test]
    fn name_length_limits() {
        assert!(pack_name("/").is_err());
        assert!(pack_name(&"x".repeat(FILENAME_LEN)).is_err());
        let max = "y".repeat(FILENAME_LEN - 1);
        let field = pack_name(&max).unwrap();
        assert_eq!(unpack_name(&field).unwrap(), max);
    }

    #[test]
    fn short_header_is_an_error() {
        let short = [0u8; 10];
        assert!(RequestHeader::receive(&mut short.as_ref()).is_err());
        assert!(ResponseHeader::receive(&mut short.as_ref()).is_err());
    }
}
