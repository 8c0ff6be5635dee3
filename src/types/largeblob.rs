//! large-blob manifests
//!
//! a file above the large-file threshold is stored as chunk blobs plus a
//! manifest listing the chunk hashes in file order. offsets are implicit:
//! the prefix sum of part lengths. the manifest also records the hash of the
//! whole file so extraction can be verified end to end.

use crate::config::MAX_PART_LEN;
use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::stream::{ReadExt, WriteExt};

/// one chunk reference: hash and length
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LBlobEntry {
    pub hash: Hash,
    pub length: u16,
}

/// manifest for a chunked file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LargeBlob {
    /// hash of the full reconstructed file
    pub total_hash: Hash,
    parts: Vec<LBlobEntry>,
}

impl LargeBlob {
    pub fn new(total_hash: Hash) -> Self {
        Self {
            total_hash,
            parts: Vec::new(),
        }
    }

    /// append a part; parts arrive in ascending file-offset order
    pub fn push(&mut self, hash: Hash, length: u32) -> Result<()> {
        if length == 0 || length > MAX_PART_LEN {
            return Err(Error::Unsupported(format!(
                "large-blob part of {} bytes (limit {})",
                length, MAX_PART_LEN
            )));
        }
        self.parts.push(LBlobEntry {
            hash,
            length: length as u16,
        });
        Ok(())
    }

    pub fn parts(&self) -> &[LBlobEntry] {
        &self.parts
    }

    pub fn num_parts(&self) -> usize {
        self.parts.len()
    }

    /// total reconstructed file size
    pub fn total_size(&self) -> u64 {
        self.parts.iter().map(|p| p.length as u64).sum()
    }

    /// locate the part containing a file offset
    ///
    /// returns the part index and the offset within that part.
    pub fn part_at(&self, offset: u64) -> Option<(usize, u64)> {
        // binary search over implicit prefix sums
        let mut prefix = vec![0u64; self.parts.len() + 1];
        for (i, p) in self.parts.iter().enumerate() {
            prefix[i + 1] = prefix[i] + p.length as u64;
        }
        if offset >= prefix[self.parts.len()] {
            return None;
        }
        let mut lo = 0usize;
        let mut hi = self.parts.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if prefix[mid + 1] <= offset {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Some((lo, offset - prefix[lo]))
    }

    /// serialization: total hash, u64 count, count x (hash, u16 length)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(Hash::SIZE + 8 + self.parts.len() * (Hash::SIZE + 2));
        buf.write_hash(&self.total_hash).expect("vec write");
        buf.write_u64_le(self.parts.len() as u64).expect("vec write");
        for part in &self.parts {
            buf.write_hash(&part.hash).expect("vec write");
            buf.write_u16_le(part.length).expect("vec write");
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = bytes;
        let parse = |e: std::io::Error| Error::Corrupt(format!("short large-blob manifest: {}", e));

        let total_hash = r.read_hash().map_err(parse)?;
        let count = r.read_u64_le().map_err(parse)?;
        let mut parts = Vec::with_capacity(count.min(1 << 20) as usize);
        for _ in 0..count {
            let hash = r.read_hash().map_err(parse)?;
            let length = r.read_u16_le().map_err(parse)?;
            parts.push(LBlobEntry { hash, length });
        }

        Ok(Self { total_hash, parts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    fn sample() -> LargeBlob {
        let mut lb = LargeBlob::new(hash_bytes(b"whole file"));
        lb.push(hash_bytes(b"part0"), 4096).unwrap();
        lb.push(hash_bytes(b"part1"), 2048).unwrap();
        lb.push(hash_bytes(b"part2"), 100).unwrap();
        lb
    }

    #[test]
    fn test_roundtrip() {
        let lb = sample();
        let parsed = LargeBlob::from_bytes(&lb.to_bytes()).unwrap();
        assert_eq!(lb, parsed);
    }

    #[test]
    fn test_total_size() {
        assert_eq!(sample().total_size(), 4096 + 2048 + 100);
    }

    #[test]
    fn test_part_at_boundaries() {
        let lb = sample();

        assert_eq!(lb.part_at(0), Some((0, 0)));
        assert_eq!(lb.part_at(4095), Some((0, 4095)));
        assert_eq!(lb.part_at(4096), Some((1, 0)));
        assert_eq!(lb.part_at(4096 + 2048), Some((2, 0)));
        assert_eq!(lb.part_at(4096 + 2048 + 99), Some((2, 99)));
        assert_eq!(lb.part_at(4096 + 2048 + 100), None);
    }

    #[test]
    fn test_part_at_empty() {
        let lb = LargeBlob::new(Hash::ZERO);
        assert_eq!(lb.part_at(0), None);
    }

    #[test]
    fn test_oversized_part_rejected() {
        let mut lb = LargeBlob::new(Hash::ZERO);
        assert!(lb.push(hash_bytes(b"too big"), 70_000).is_err());
        assert!(lb.push(hash_bytes(b"empty"), 0).is_err());
        lb.push(hash_bytes(b"max"), MAX_PART_LEN).unwrap();
    }

    #[test]
    fn test_truncated_manifest_rejected() {
        let bytes = sample().to_bytes();
        assert!(LargeBlob::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
