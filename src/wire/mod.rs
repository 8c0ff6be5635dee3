//! the wire protocol
//!
//! framed over any bidirectional byte stream. each command is a
//! length-prefixed ASCII name followed by command-specific bytes; each
//! response is a one-byte status (0 OK / 1 ERROR), then the payload or an
//! error string. integers are little-endian everywhere.
//!
//! | command        | request              | response                        |
//! |----------------|----------------------|---------------------------------|
//! | `hello`        | --                   | protocol-version pstr           |
//! | `get fsid`     | --                   | uuid pstr                       |
//! | `get head`     | --                   | 32-byte hash                    |
//! | `list commits` | --                   | u32 count, count x commit blob  |
//! | `list objs`    | --                   | u64 count, count x ObjectInfo   |
//! | `getobjinfo`   | 32-byte hash         | ObjectInfo                      |
//! | `readobjs`     | u32 count, hashes    | object stream, u32 0 terminated |

pub mod client;
pub mod server;

pub use client::WireClient;
pub use server::serve;

use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::object::{unpack_payload, Object, ObjectInfo};
use crate::stream::{ReadExt, WriteExt};

/// version string exchanged by `hello`; peers must match exactly
pub const PROTOCOL_VERSION: &str = "silo-1.0";

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

/// parse a zero-terminated object stream into fully unpacked objects
pub fn read_object_stream<R: Read>(r: &mut R) -> Result<Vec<Object>> {
    let mut objects = Vec::new();
    loop {
        let count = r
            .read_u32_le()
            .map_err(|e| Error::Protocol(format!("short object stream: {}", e)))? as usize;
        if count == 0 {
            return Ok(objects);
        }

        let mut infos = Vec::with_capacity(count);
        let mut sizes = Vec::with_capacity(count);
        for _ in 0..count {
            let info = ObjectInfo::read_from(r)?;
            let size = r
                .read_u32_le()
                .map_err(|e| Error::Protocol(format!("short object stream: {}", e)))?;
            infos.push(info);
            sizes.push(size as usize);
        }

        for (info, size) in infos.into_iter().zip(sizes) {
            let mut packed = vec![0u8; size];
            r.read_exact(&mut packed)
                .map_err(|e| Error::Protocol(format!("short object stream: {}", e)))?;
            let payload = unpack_payload(&info, &packed)?;
            objects.push(Object { info, payload });
        }
    }
}

/// copy a zero-terminated object stream verbatim, terminator included
///
/// the stream is self-describing, so this parses group headers to find the
/// end without interpreting payloads.
pub fn copy_object_stream<R: Read, W: Write>(r: &mut R, w: &mut W) -> Result<()> {
    loop {
        let count = r
            .read_u32_le()
            .map_err(|e| Error::Protocol(format!("short object stream: {}", e)))? as usize;
        w.write_u32_le(count as u32)
            .map_err(|e| Error::Protocol(format!("stream copy failed: {}", e)))?;
        if count == 0 {
            return Ok(());
        }

        let mut total = 0usize;
        for _ in 0..count {
            let mut descriptor = [0u8; ObjectInfo::SIZE + 4];
            r.read_exact(&mut descriptor)
                .map_err(|e| Error::Protocol(format!("short object stream: {}", e)))?;
            let size = u32::from_le_bytes(
                descriptor[ObjectInfo::SIZE..]
                    .try_into()
                    .expect("four size bytes"),
            );
            total += size as usize;
            w.write_all(&descriptor)
                .map_err(|e| Error::Protocol(format!("stream copy failed: {}", e)))?;
        }

        let mut remaining = total;
        let mut buf = [0u8; 64 * 1024];
        while remaining > 0 {
            let want = remaining.min(buf.len());
            r.read_exact(&mut buf[..want])
                .map_err(|e| Error::Protocol(format!("short object stream: {}", e)))?;
            w.write_all(&buf[..want])
                .map_err(|e| Error::Protocol(format!("stream copy failed: {}", e)))?;
            remaining -= want;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use crate::object::{pack_payload, ObjectType};

    fn stream_of(payloads: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32_le(payloads.len() as u32).unwrap();
        let mut packed_all = Vec::new();
        for p in payloads {
            let (flags, packed) = pack_payload(p, true).unwrap();
            let mut info = ObjectInfo::new(ObjectType::Blob, hash_bytes(p), p.len() as u32);
            info.flags = flags;
            info.write_to(&mut out).unwrap();
            out.write_u32_le(packed.len() as u32).unwrap();
            packed_all.push(packed);
        }
        for packed in packed_all {
            out.extend_from_slice(&packed);
        }
        out.write_u32_le(0).unwrap();
        out
    }

    #[test]
    fn test_read_object_stream() {
        let stream = stream_of(&[b"alpha", b"beta"]);
        let objects = read_object_stream(&mut stream.as_slice()).unwrap();

        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].payload, b"alpha");
        assert_eq!(objects[1].payload, b"beta");
        assert_eq!(objects[0].info.hash, hash_bytes(b"alpha"));
    }

    #[test]
    fn test_read_empty_stream() {
        let stream = stream_of(&[]);
        assert!(read_object_stream(&mut stream.as_slice())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_copy_stream_verbatim() {
        let stream = stream_of(&[b"one", b"two", b"three"]);
        let mut copied = Vec::new();
        copy_object_stream(&mut stream.as_slice(), &mut copied).unwrap();
        assert_eq!(copied, stream);
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let stream = stream_of(&[b"payload"]);
        let cut = &stream[..stream.len() - 6];
        assert!(matches!(
            read_object_stream(&mut &cut[..]),
            Err(Error::Protocol(_))
        ));
    }
}
