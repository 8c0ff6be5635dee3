//! durable map from object hash to packfile locator
//!
//! log-structured: every insertion appends one fixed-size record; open
//! replays the log into a hash map. a torn tail record is trimmed on open,
//! and a missing or unreadable index is rebuilt by scanning the packfiles
//! (see `Repo::rebuild_index`).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::object::ObjectInfo;
use crate::stream::{ReadExt, WriteExt};

pub type PackfileId = u32;

/// locator for one stored object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub info: ObjectInfo,
    /// byte offset of the packed payload within its packfile
    pub offset: u32,
    pub packed_size: u32,
    pub packfile: PackfileId,
}

impl IndexEntry {
    /// on-disk record: hash + info + offset + packed_size + packfile
    pub const RECORD_SIZE: usize = Hash::SIZE + ObjectInfo::SIZE + 4 + 4 + 4;

    fn write_record<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_hash(&self.info.hash)?;
        self.info.write_to(w)?;
        w.write_u32_le(self.offset)?;
        w.write_u32_le(self.packed_size)?;
        w.write_u32_le(self.packfile)
    }

    fn read_record<R: Read>(r: &mut R) -> Result<Self> {
        let hash = r
            .read_hash()
            .map_err(|e| Error::Corrupt(format!("short index record: {}", e)))?;
        let info = ObjectInfo::read_from(r)?;
        if info.hash != hash {
            return Err(Error::Corrupt(format!(
                "index record hash {} does not match header {}",
                hash, info.hash
            )));
        }
        let offset = r
            .read_u32_le()
            .map_err(|e| Error::Corrupt(format!("short index record: {}", e)))?;
        let packed_size = r
            .read_u32_le()
            .map_err(|e| Error::Corrupt(format!("short index record: {}", e)))?;
        let packfile = r
            .read_u32_le()
            .map_err(|e| Error::Corrupt(format!("short index record: {}", e)))?;
        Ok(Self {
            info,
            offset,
            packed_size,
            packfile,
        })
    }
}

/// the primary object index
pub struct Index {
    path: PathBuf,
    file: File,
    entries: HashMap<Hash, IndexEntry>,
}

impl Index {
    /// open the index, replaying the log; trims a torn tail record
    ///
    /// returns `Err(Corrupt)` only when a full-length record is malformed;
    /// the caller is expected to rebuild from the packfiles in that case.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_path(path)?;

        let len = file.metadata().with_path(path)?.len();
        let record = IndexEntry::RECORD_SIZE as u64;
        let whole = len - len % record;
        if whole != len {
            warn!(path = %path.display(), "trimming torn index tail record");
            file.set_len(whole).with_path(path)?;
        }

        let mut entries = HashMap::new();
        file.seek(SeekFrom::Start(0)).with_path(path)?;
        {
            let mut reader = BufReader::new(&mut file);
            let count = whole / record;
            for _ in 0..count {
                let entry = IndexEntry::read_record(&mut reader)?;
                entries.insert(entry.info.hash, entry);
            }
        }
        file.seek(SeekFrom::End(0)).with_path(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            entries,
        })
    }

    pub fn has(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<&IndexEntry> {
        self.entries.get(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// append one entry to the log and the in-memory map
    pub fn update_entry(&mut self, entry: IndexEntry) -> Result<()> {
        entry
            .write_record(&mut self.file)
            .with_path(&self.path)?;
        self.entries.insert(entry.info.hash, entry);
        Ok(())
    }

    /// append a batch of entries; all land in the map only after every
    /// record was written
    pub fn update_entries(&mut self, batch: &[IndexEntry]) -> Result<()> {
        let mut buf = Vec::with_capacity(batch.len() * IndexEntry::RECORD_SIZE);
        for entry in batch {
            entry.write_record(&mut buf).expect("vec write");
        }
        self.file.write_all(&buf).with_path(&self.path)?;
        for entry in batch {
            self.entries.insert(entry.info.hash, *entry);
        }
        Ok(())
    }

    /// drop an entry from the map; space is reclaimed on the next rewrite
    pub fn remove(&mut self, hash: &Hash) {
        self.entries.remove(hash);
    }

    /// all object headers known to the index
    pub fn list(&self) -> Vec<ObjectInfo> {
        self.entries.values().map(|e| e.info).collect()
    }

    /// all entries, in unspecified order
    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    /// compact the log: truncate and re-append the live map
    pub fn rewrite(&mut self) -> Result<()> {
        self.file.set_len(0).with_path(&self.path)?;
        self.file.seek(SeekFrom::Start(0)).with_path(&self.path)?;

        let mut buf = Vec::with_capacity(self.entries.len() * IndexEntry::RECORD_SIZE);
        for entry in self.entries.values() {
            entry.write_record(&mut buf).expect("vec write");
        }
        self.file.write_all(&buf).with_path(&self.path)?;
        self.file.sync_all().with_path(&self.path)?;
        Ok(())
    }

    /// forget everything; used before a rebuild from packfiles
    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.file.set_len(0).with_path(&self.path)?;
        self.file.seek(SeekFrom::Start(0)).with_path(&self.path)?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().with_path(&self.path)
    }
}
