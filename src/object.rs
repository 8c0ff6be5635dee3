//! object headers and the payload codec
//!
//! every stored unit carries a fixed-size [`ObjectInfo`] header: type tag,
//! content hash, flags, and uncompressed payload size. the low nibble of the
//! flags selects the payload compression.

use std::io::{self, Read, Write};

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::stream::{ReadExt, WriteExt};

/// payloads below this size are never compressed
pub const ZIP_MINIMUM_SIZE: usize = 512;
/// how much of a payload the compressibility probe consumes
pub const COMPCHECK_BYTES: usize = 1024;
/// keep compression only when probe output is at most this fraction of input
pub const COMPCHECK_RATIO: f64 = 0.95;

const ZSTD_LEVEL: i32 = 3;

/// low nibble of the flags word selects the payload compression
const COMPRESSION_MASK: u32 = 0xF;
const COMPRESSION_NONE: u32 = 0;
const COMPRESSION_FAST: u32 = 1;

/// kind of stored object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectType {
    Commit,
    Tree,
    Blob,
    LargeBlob,
    /// tombstone recording that an object once existed
    Purged,
}

impl ObjectType {
    fn to_tag(self) -> u32 {
        match self {
            ObjectType::Commit => 1,
            ObjectType::Tree => 2,
            ObjectType::Blob => 3,
            ObjectType::LargeBlob => 4,
            ObjectType::Purged => 5,
        }
    }

    fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            1 => Ok(ObjectType::Commit),
            2 => Ok(ObjectType::Tree),
            3 => Ok(ObjectType::Blob),
            4 => Ok(ObjectType::LargeBlob),
            5 => Ok(ObjectType::Purged),
            other => Err(Error::Corrupt(format!("unknown object type tag {}", other))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ObjectType::Commit => "commit",
            ObjectType::Tree => "tree",
            ObjectType::Blob => "blob",
            ObjectType::LargeBlob => "largeblob",
            ObjectType::Purged => "purged",
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// fixed-size object header: type, hash, flags, uncompressed size
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectInfo {
    pub kind: ObjectType,
    pub hash: Hash,
    pub flags: u32,
    /// logical (uncompressed) payload size
    pub payload_size: u32,
}

impl ObjectInfo {
    /// serialized size: u32 tag + hash + u32 flags + u32 size
    pub const SIZE: usize = 4 + Hash::SIZE + 4 + 4;

    pub fn new(kind: ObjectType, hash: Hash, payload_size: u32) -> Self {
        Self {
            kind,
            hash,
            flags: COMPRESSION_NONE,
            payload_size,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & COMPRESSION_MASK != COMPRESSION_NONE
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32_le(self.kind.to_tag())?;
        w.write_hash(&self.hash)?;
        w.write_u32_le(self.flags)?;
        w.write_u32_le(self.payload_size)
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let tag = r.read_u32_le().map_err(corrupt_io)?;
        let hash = r.read_hash().map_err(corrupt_io)?;
        let flags = r.read_u32_le().map_err(corrupt_io)?;
        let payload_size = r.read_u32_le().map_err(corrupt_io)?;
        Ok(Self {
            kind: ObjectType::from_tag(tag)?,
            hash,
            flags,
            payload_size,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.write_to(&mut buf).expect("vec write");
        buf
    }
}

fn corrupt_io(e: io::Error) -> Error {
    Error::Corrupt(format!("short object header: {}", e))
}

/// an object as handed to callers: header plus uncompressed payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Object {
    pub info: ObjectInfo,
    pub payload: Vec<u8>,
}

impl Object {
    pub fn kind(&self) -> ObjectType {
        self.info.kind
    }
}

/// pack a payload for storage, running the compressibility probe
///
/// probes the first [`COMPCHECK_BYTES`] of input once; the payload is stored
/// compressed only when the probe ratio clears [`COMPCHECK_RATIO`]. returns
/// the flags word and the bytes to store.
pub fn pack_payload(payload: &[u8], compression: bool) -> Result<(u32, Vec<u8>)> {
    if !compression || payload.len() < ZIP_MINIMUM_SIZE {
        return Ok((COMPRESSION_NONE, payload.to_vec()));
    }

    let window = &payload[..payload.len().min(COMPCHECK_BYTES)];
    let probe = zstd::encode_all(window, ZSTD_LEVEL)
        .map_err(|e| Error::Corrupt(format!("compressor failed: {}", e)))?;
    let ratio = probe.len() as f64 / window.len() as f64;
    if ratio > COMPCHECK_RATIO {
        return Ok((COMPRESSION_NONE, payload.to_vec()));
    }

    let packed = zstd::encode_all(payload, ZSTD_LEVEL)
        .map_err(|e| Error::Corrupt(format!("compressor failed: {}", e)))?;
    Ok((COMPRESSION_FAST, packed))
}

/// unpack stored bytes back into the logical payload
///
/// the decompressed length must equal the header's payload size exactly.
pub fn unpack_payload(info: &ObjectInfo, stored: &[u8]) -> Result<Vec<u8>> {
    let payload = match info.flags & COMPRESSION_MASK {
        COMPRESSION_NONE => stored.to_vec(),
        COMPRESSION_FAST => zstd::decode_all(stored)
            .map_err(|e| Error::Corrupt(format!("decompression failed for {}: {}", info.hash, e)))?,
        other => {
            return Err(Error::Corrupt(format!(
                "unknown compression algorithm {} for {}",
                other, info.hash
            )))
        }
    };

    if payload.len() != info.payload_size as usize {
        return Err(Error::Corrupt(format!(
            "payload for {} is {} bytes, header says {}",
            info.hash,
            payload.len(),
            info.payload_size
        )));
    }

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    #[test]
    fn test_info_roundtrip() {
        let info = ObjectInfo {
            kind: ObjectType::Tree,
            hash: hash_bytes(b"tree bytes"),
            flags: COMPRESSION_FAST,
            payload_size: 1234,
        };

        let bytes = info.to_bytes();
        assert_eq!(bytes.len(), ObjectInfo::SIZE);

        let parsed = ObjectInfo::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_info_rejects_unknown_tag() {
        let mut bytes = ObjectInfo::new(ObjectType::Blob, Hash::ZERO, 0).to_bytes();
        bytes[0] = 99;
        assert!(matches!(
            ObjectInfo::read_from(&mut bytes.as_slice()),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_info_rejects_truncation() {
        let bytes = ObjectInfo::new(ObjectType::Blob, Hash::ZERO, 0).to_bytes();
        assert!(ObjectInfo::read_from(&mut &bytes[..20]).is_err());
    }

    #[test]
    fn test_small_payloads_never_compressed() {
        let payload = vec![0u8; ZIP_MINIMUM_SIZE - 1];
        let (flags, stored) = pack_payload(&payload, true).unwrap();
        assert_eq!(flags, COMPRESSION_NONE);
        assert_eq!(stored, payload);
    }

    #[test]
    fn test_compressible_payload_shrinks() {
        let payload = vec![b'a'; 100_000];
        let (flags, stored) = pack_payload(&payload, true).unwrap();
        assert_eq!(flags, COMPRESSION_FAST);
        assert!(stored.len() < payload.len());

        let mut info = ObjectInfo::new(ObjectType::Blob, hash_bytes(&payload), payload.len() as u32);
        info.flags = flags;
        assert!(info.is_compressed());
        assert_eq!(unpack_payload(&info, &stored).unwrap(), payload);
    }

    #[test]
    fn test_incompressible_payload_stored_verbatim() {
        // random bytes do not clear the probe ratio
        use rand::{RngCore, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut payload = vec![0u8; 64 * 1024];
        rng.fill_bytes(&mut payload);

        let (flags, stored) = pack_payload(&payload, true).unwrap();
        assert_eq!(flags, COMPRESSION_NONE);
        assert_eq!(stored, payload);
    }

    #[test]
    fn test_compression_disabled() {
        let payload = vec![b'a'; 100_000];
        let (flags, stored) = pack_payload(&payload, false).unwrap();
        assert_eq!(flags, COMPRESSION_NONE);
        assert_eq!(stored, payload);
    }

    #[test]
    fn test_unpack_size_mismatch_is_corruption() {
        let payload = b"0123456789".to_vec();
        let mut info = ObjectInfo::new(ObjectType::Blob, hash_bytes(&payload), 99);
        info.flags = COMPRESSION_NONE;

        assert!(matches!(
            unpack_payload(&info, &payload),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_unpack_unknown_algorithm_is_corruption() {
        let payload = b"0123456789".to_vec();
        let mut info = ObjectInfo::new(ObjectType::Blob, hash_bytes(&payload), 10);
        info.flags = 2; // reserved nibble value

        assert!(matches!(
            unpack_payload(&info, &payload),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_type_tags_stable() {
        // on-disk tags must never change
        for (kind, tag) in [
            (ObjectType::Commit, 1u32),
            (ObjectType::Tree, 2),
            (ObjectType::Blob, 3),
            (ObjectType::LargeBlob, 4),
            (ObjectType::Purged, 5),
        ] {
            assert_eq!(kind.to_tag(), tag);
            assert_eq!(ObjectType::from_tag(tag).unwrap(), kind);
        }
    }
}
