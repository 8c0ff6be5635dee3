//! splits byte streams into chunks for large-file storage
//!
//! two strategies: fixed-size windows, and content-defined cuts driven by a
//! polynomial rolling hash. cut positions depend only on the bytes, never on
//! how the source splits its reads, so identical files always chunk
//! identically.

use std::io::{self, Read};

use crate::config::ChunkerMode;

/// rolling hash window in bytes
const WINDOW: usize = 32;
/// polynomial base
const BASE: u64 = 31;

/// one emitted chunk: its offset in the stream and its bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// chunker selected from a [`ChunkerMode`]
pub enum Chunker<R: Read> {
    Fixed(FixedChunker<R>),
    Rolling(RollingChunker<R>),
}

impl<R: Read> Chunker<R> {
    pub fn new(mode: &ChunkerMode, source: R) -> Self {
        match *mode {
            ChunkerMode::Fixed { size } => Chunker::Fixed(FixedChunker::new(source, size as usize)),
            ChunkerMode::Rolling { target, min, max } => Chunker::Rolling(RollingChunker::new(
                source,
                target as u64,
                min as usize,
                max as usize,
            )),
        }
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Chunker::Fixed(c) => c.next(),
            Chunker::Rolling(c) => c.next(),
        }
    }
}

/// emits non-overlapping fixed-size windows with a shorter final tail
pub struct FixedChunker<R: Read> {
    source: R,
    size: usize,
    offset: u64,
    done: bool,
}

impl<R: Read> FixedChunker<R> {
    pub fn new(source: R, size: usize) -> Self {
        assert!(size > 0);
        Self {
            source,
            size,
            offset: 0,
            done: false,
        }
    }
}

impl<R: Read> Iterator for FixedChunker<R> {
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut data = Vec::with_capacity(self.size);
        while data.len() < self.size {
            let mut buf = [0u8; 64 * 1024];
            let want = (self.size - data.len()).min(buf.len());
            match self.source.read(&mut buf[..want]) {
                Ok(0) => {
                    self.done = true;
                    break;
                }
                Ok(n) => data.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(e)),
            }
        }

        if data.is_empty() {
            return None;
        }

        let chunk = Chunk {
            offset: self.offset,
            data,
        };
        self.offset += chunk.len() as u64;
        Some(Ok(chunk))
    }
}

/// content-defined chunker
///
/// maintains `hash = hash * b + in[i] - lut[in[i - W]]` over the last
/// `WINDOW` bytes (wrapping u64 arithmetic) and cuts where
/// `hash % target == 1` once the chunk has reached `min` bytes, or
/// unconditionally at `max`. the hash runs continuously across cut points.
pub struct RollingChunker<R: Read> {
    source: R,
    target: u64,
    min: usize,
    max: usize,

    /// removal table: lut[v] = v * BASE^WINDOW
    lut: [u64; 256],
    hash: u64,
    /// ring of the last WINDOW bytes
    window: [u8; WINDOW],
    seen: u64,

    buf: Vec<u8>,
    buf_pos: usize,
    offset: u64,
    eof: bool,
}

impl<R: Read> RollingChunker<R> {
    pub fn new(source: R, target: u64, min: usize, max: usize) -> Self {
        assert!(target > 0 && min > 0 && min < max);

        let mut pow = 1u64;
        for _ in 0..WINDOW {
            pow = pow.wrapping_mul(BASE);
        }
        let mut lut = [0u64; 256];
        for (v, slot) in lut.iter_mut().enumerate() {
            *slot = (v as u64).wrapping_mul(pow);
        }

        Self {
            source,
            target,
            min,
            max,
            lut,
            hash: 0,
            window: [0u8; WINDOW],
            seen: 0,
            buf: Vec::new(),
            buf_pos: 0,
            offset: 0,
            eof: false,
        }
    }

    fn next_byte(&mut self) -> io::Result<Option<u8>> {
        loop {
            if self.buf_pos < self.buf.len() {
                let b = self.buf[self.buf_pos];
                self.buf_pos += 1;
                return Ok(Some(b));
            }
            if self.eof {
                return Ok(None);
            }
            self.buf.resize(256 * 1024, 0);
            self.buf_pos = 0;
            match self.source.read(&mut self.buf) {
                Ok(0) => {
                    self.buf.clear();
                    self.eof = true;
                }
                Ok(n) => self.buf.truncate(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.buf.clear();
                }
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            }
        }
    }

    fn roll(&mut self, byte: u8) {
        if self.seen >= WINDOW as u64 {
            let evicted = self.window[(self.seen as usize) % WINDOW];
            self.hash = self.hash.wrapping_sub(self.lut[evicted as usize]);
        }
        self.hash = self.hash.wrapping_mul(BASE).wrapping_add(byte as u64);
        self.window[(self.seen as usize) % WINDOW] = byte;
        self.seen += 1;
    }
}

impl<R: Read> Iterator for RollingChunker<R> {
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut data = Vec::with_capacity(self.max);

        loop {
            let byte = match self.next_byte() {
                Ok(Some(b)) => b,
                Ok(None) => break,
                Err(e) => return Some(Err(e)),
            };

            self.roll(byte);
            data.push(byte);

            if (data.len() >= self.min && self.hash % self.target == 1) || data.len() >= self.max {
                let chunk = Chunk {
                    offset: self.offset,
                    data,
                };
                self.offset += chunk.len() as u64;
                return Some(Ok(chunk));
            }
        }

        if data.is_empty() {
            return None;
        }

        let chunk = Chunk {
            offset: self.offset,
            data,
        };
        self.offset += chunk.len() as u64;
        Some(Ok(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkerMode;
    use rand::{Rng, RngCore, SeedableRng};
    use std::io::Cursor;

    /// reader that hands out randomly sized slices of its input
    struct SplitReader {
        data: Vec<u8>,
        pos: usize,
        rng: rand::rngs::StdRng,
    }

    impl Read for SplitReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.data.len() {
                return Ok(0);
            }
            let max = buf.len().min(self.data.len() - self.pos);
            let n = self.rng.gen_range(1..=max);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn random_data(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);
        data
    }

    fn boundaries(chunks: &[Chunk]) -> Vec<(u64, usize)> {
        chunks.iter().map(|c| (c.offset, c.len())).collect()
    }

    #[test]
    fn test_fixed_chunker_exact_windows() {
        let data = vec![7u8; 10_000];
        let chunks: Vec<Chunk> = FixedChunker::new(Cursor::new(&data), 4096)
            .map(|c| c.unwrap())
            .collect();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 4096);
        assert_eq!(chunks[2].len(), 10_000 - 2 * 4096);
        assert_eq!(chunks[1].offset, 4096);
        assert_eq!(chunks[2].offset, 8192);
    }

    #[test]
    fn test_fixed_chunker_empty_input() {
        let chunks: Vec<_> = FixedChunker::new(Cursor::new(Vec::new()), 4096).collect();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_fixed_chunker_reassembles() {
        let data = random_data(50_000, 1);
        let mut rebuilt = Vec::new();
        for chunk in FixedChunker::new(Cursor::new(&data), 8192) {
            rebuilt.extend_from_slice(&chunk.unwrap().data);
        }
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn test_rolling_bounds_respected() {
        let data = random_data(1 << 20, 2);
        let chunks: Vec<Chunk> = RollingChunker::new(Cursor::new(&data), 4096, 2048, 8192)
            .map(|c| c.unwrap())
            .collect();

        assert!(chunks.len() > 1);
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.len() >= 2048, "chunk below min: {}", chunk.len());
            assert!(chunk.len() <= 8192, "chunk above max: {}", chunk.len());
        }
        // tail may be short but never oversized
        assert!(chunks.last().unwrap().len() <= 8192);
    }

    #[test]
    fn test_rolling_reassembles() {
        let data = random_data(300_000, 3);
        let mut rebuilt = Vec::new();
        for chunk in RollingChunker::new(Cursor::new(&data), 4096, 2048, 8192) {
            rebuilt.extend_from_slice(&chunk.unwrap().data);
        }
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn test_rolling_deterministic_across_read_splits() {
        // same bytes, one pass as a single buffer and one as random slices,
        // must produce identical cuts
        let data = random_data(2 << 20, 4);

        let whole: Vec<Chunk> = RollingChunker::new(Cursor::new(&data), 4096, 2048, 8192)
            .map(|c| c.unwrap())
            .collect();

        let split = SplitReader {
            data: data.clone(),
            pos: 0,
            rng: rand::rngs::StdRng::seed_from_u64(99),
        };
        let sliced: Vec<Chunk> = RollingChunker::new(split, 4096, 2048, 8192)
            .map(|c| c.unwrap())
            .collect();

        assert_eq!(boundaries(&whole), boundaries(&sliced));
    }

    #[test]
    fn test_rolling_identical_inputs_identical_cuts() {
        let data = random_data(500_000, 5);
        let a: Vec<Chunk> = RollingChunker::new(Cursor::new(&data), 4096, 2048, 8192)
            .map(|c| c.unwrap())
            .collect();
        let b: Vec<Chunk> = RollingChunker::new(Cursor::new(&data), 4096, 2048, 8192)
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(boundaries(&a), boundaries(&b));
    }

    #[test]
    fn test_rolling_short_input_single_chunk() {
        let data = vec![1u8; 100];
        let chunks: Vec<Chunk> = RollingChunker::new(Cursor::new(&data), 4096, 2048, 8192)
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data, data);
    }

    #[test]
    fn test_mode_dispatch() {
        let data = random_data(100_000, 6);

        let fixed = Chunker::new(&ChunkerMode::Fixed { size: 16384 }, Cursor::new(&data));
        let n_fixed = fixed.count();
        assert_eq!(n_fixed, 100_000 / 16384 + 1);

        let rolling = Chunker::new(&ChunkerMode::default(), Cursor::new(&data));
        assert!(rolling.count() > 1);
    }
}
