//! little-endian binary codec helpers
//!
//! every on-disk log record and wire message in silo is built from the
//! primitives here: fixed-width integers, hashes, and length-prefixed
//! strings. integers are always little-endian, so streams are readable
//! across architectures.

use std::io::{self, Read, Write};

use crate::hash::Hash;

/// read-side codec primitives
pub trait ReadExt: Read {
    fn read_u8(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_le(&mut self) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i32_le(&mut self) -> io::Result<i32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_u64_le(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_hash(&mut self) -> io::Result<Hash> {
        let mut buf = [0u8; Hash::SIZE];
        self.read_exact(&mut buf)?;
        Ok(Hash::from_bytes(buf))
    }

    /// pascal string: u8 length then bytes
    fn read_pstr(&mut self) -> io::Result<String> {
        let len = self.read_u8()? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "pstr is not utf-8"))
    }

    /// long string: u32 length then bytes
    fn read_lstr(&mut self) -> io::Result<String> {
        let len = self.read_u32_le()? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lstr is not utf-8"))
    }

    /// length-prefixed byte buffer: u32 length then bytes
    fn read_lbuf(&mut self) -> io::Result<Vec<u8>> {
        let len = self.read_u32_le()? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<R: Read + ?Sized> ReadExt for R {}

/// write-side codec primitives
pub trait WriteExt: Write {
    fn write_u8_val(&mut self, v: u8) -> io::Result<()> {
        self.write_all(&[v])
    }

    fn write_u16_le(&mut self, v: u16) -> io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    fn write_u32_le(&mut self, v: u32) -> io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    fn write_i32_le(&mut self, v: i32) -> io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    fn write_u64_le(&mut self, v: u64) -> io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    fn write_hash(&mut self, h: &Hash) -> io::Result<()> {
        self.write_all(h.as_bytes())
    }

    /// pascal string: u8 length then bytes; strings over 255 bytes are an error
    fn write_pstr(&mut self, s: &str) -> io::Result<()> {
        if s.len() > u8::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "pstr longer than 255 bytes",
            ));
        }
        self.write_all(&[s.len() as u8])?;
        self.write_all(s.as_bytes())
    }

    /// long string: u32 length then bytes
    fn write_lstr(&mut self, s: &str) -> io::Result<()> {
        self.write_u32_le(s.len() as u32)?;
        self.write_all(s.as_bytes())
    }

    /// length-prefixed byte buffer: u32 length then bytes
    fn write_lbuf(&mut self, b: &[u8]) -> io::Result<()> {
        self.write_u32_le(b.len() as u32)?;
        self.write_all(b)
    }
}

impl<W: Write + ?Sized> WriteExt for W {}

/// true if the error indicates the stream ended mid-record
pub fn is_truncation(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::UnexpectedEof
}
