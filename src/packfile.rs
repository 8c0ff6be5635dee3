//! append-only packfiles
//!
//! a packfile is a sequence of groups. each group is a count-prefixed array
//! of object descriptors followed by the packed payloads:
//!
//! ```text
//! u32 count
//! count x { ObjectInfo, u32 packed_size, u32 offset }
//! payload bytes...
//! ```
//!
//! `offset` is absolute within the packfile and points at the first byte of
//! that payload. payloads are written in descriptor order. appends are
//! transactional: a group torn by a crash is detected and truncated away on
//! the next open.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use tracing::warn;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::index::{Index, IndexEntry, PackfileId};
use crate::object::ObjectInfo;
use crate::stream::ReadExt;

/// soft limit: a packfile with this many objects is full
pub const PACKFILE_MAXOBJS: usize = 2048;
/// soft limit: a packfile of this size is full
pub const PACKFILE_MAXSIZE: u64 = 64 * 1024 * 1024;

/// per-object descriptor size within a group header
const ENTRY_SIZE: usize = ObjectInfo::SIZE + 4 + 4;

fn group_header_size(count: usize) -> u64 {
    4 + (count * ENTRY_SIZE) as u64
}

/// one open packfile
pub struct Packfile {
    file: File,
    path: PathBuf,
    id: PackfileId,
    num_objects: usize,
    file_size: u64,
}

impl Packfile {
    /// open or create a packfile, discarding a torn trailing group
    pub fn open(path: &Path, id: PackfileId) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_path(path)?;

        let disk_len = file.metadata().with_path(path)?.len();
        let (valid_len, num_objects) = scan_groups(&mut file, disk_len)?;
        if valid_len < disk_len {
            warn!(
                path = %path.display(),
                dropped = disk_len - valid_len,
                "discarding torn trailing group"
            );
            file.set_len(valid_len).with_path(path)?;
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            id,
            num_objects,
            file_size: valid_len,
        })
    }

    pub fn id(&self) -> PackfileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.file_size
    }

    pub fn num_objects(&self) -> usize {
        self.num_objects
    }

    pub fn is_full(&self) -> bool {
        self.num_objects >= PACKFILE_MAXOBJS || self.file_size >= PACKFILE_MAXSIZE
    }

    /// append one group; returns the index entries for the new objects
    ///
    /// payloads are the packed (possibly compressed) bytes. the write is a
    /// single contiguous region at the end of the file, so a crash leaves
    /// either a whole group or a torn tail the next open discards.
    fn append_group(
        &mut self,
        infos: &[ObjectInfo],
        payloads: &[Vec<u8>],
    ) -> Result<Vec<IndexEntry>> {
        assert_eq!(infos.len(), payloads.len());
        if infos.is_empty() {
            return Ok(Vec::new());
        }

        let mut off = self.file_size + group_header_size(infos.len());
        let mut entries = Vec::with_capacity(infos.len());

        let mut header = BytesMut::with_capacity(group_header_size(infos.len()) as usize);
        header.put_u32_le(infos.len() as u32);
        for (info, payload) in infos.iter().zip(payloads) {
            let mut info_buf = Vec::with_capacity(ObjectInfo::SIZE);
            info.write_to(&mut info_buf).expect("vec write");
            header.put_slice(&info_buf);
            header.put_u32_le(payload.len() as u32);
            header.put_u32_le(off as u32);

            entries.push(IndexEntry {
                info: *info,
                offset: off as u32,
                packed_size: payload.len() as u32,
                packfile: self.id,
            });
            off += payload.len() as u64;
        }

        self.file
            .seek(SeekFrom::Start(self.file_size))
            .with_path(&self.path)?;
        self.file.write_all(&header).with_path(&self.path)?;
        self.file_size += header.len() as u64;
        for payload in payloads {
            self.file.write_all(payload).with_path(&self.path)?;
            self.file_size += payload.len() as u64;
            self.num_objects += 1;
        }
        self.file.sync_data().with_path(&self.path)?;

        Ok(entries)
    }

    /// read the packed bytes for one entry
    pub fn read_payload(&mut self, entry: &IndexEntry) -> Result<Vec<u8>> {
        assert_eq!(entry.packfile, self.id);
        self.file
            .seek(SeekFrom::Start(entry.offset as u64))
            .with_path(&self.path)?;
        let mut buf = vec![0u8; entry.packed_size as usize];
        self.file.read_exact(&mut buf).with_path(&self.path)?;
        Ok(buf)
    }

    /// iterate every object descriptor in the file
    ///
    /// used for index rebuilds; payload bytes are not touched.
    pub fn read_entries(&mut self) -> Result<Vec<IndexEntry>> {
        let mut entries = Vec::with_capacity(self.num_objects);
        let mut group_off = 0u64;

        while group_off < self.file_size {
            self.file
                .seek(SeekFrom::Start(group_off))
                .with_path(&self.path)?;
            let count = self.file.read_u32_le().with_path(&self.path)? as usize;
            if count == 0 {
                break;
            }

            let mut header = vec![0u8; count * ENTRY_SIZE];
            self.file.read_exact(&mut header).with_path(&self.path)?;
            let mut cursor = header.as_slice();

            let mut group_end = group_off + group_header_size(count);
            for _ in 0..count {
                let info = ObjectInfo::read_from(&mut cursor)?;
                let packed_size = cursor
                    .read_u32_le()
                    .map_err(|e| Error::Corrupt(format!("short group header: {}", e)))?;
                let offset = cursor
                    .read_u32_le()
                    .map_err(|e| Error::Corrupt(format!("short group header: {}", e)))?;
                entries.push(IndexEntry {
                    info,
                    offset,
                    packed_size,
                    packfile: self.id,
                });
                group_end = offset as u64 + packed_size as u64;
            }
            group_off = group_end;
        }

        Ok(entries)
    }

    /// drop the given hashes by streaming survivors into a sibling file and
    /// renaming it over this one
    ///
    /// returns the surviving entries (with fresh offsets) and whether the
    /// rewritten file is empty.
    pub fn purge(&mut self, hashes: &HashSet<Hash>) -> Result<(Vec<IndexEntry>, bool)> {
        let old_entries = self.read_entries()?;
        let mut infos = Vec::new();
        let mut payloads = Vec::new();
        for entry in &old_entries {
            if hashes.contains(&entry.info.hash) {
                continue;
            }
            infos.push(entry.info);
            payloads.push(self.read_payload(entry)?);
        }

        let tmp_path = self.path.with_extension("pak.tmp");
        if tmp_path.exists() {
            std::fs::remove_file(&tmp_path).with_path(&tmp_path)?;
        }
        let mut tmp = Packfile::open(&tmp_path, self.id)?;
        let entries = tmp.append_group(&infos, &payloads)?;
        tmp.file.sync_all().with_path(&tmp_path)?;

        std::fs::rename(&tmp_path, &self.path).with_path(&self.path)?;
        self.file = tmp.file;
        self.file_size = tmp.file_size;
        self.num_objects = tmp.num_objects;

        let empty = entries.is_empty();
        Ok((entries, empty))
    }

    /// serialize the given objects onto a byte stream
    ///
    /// emits a u32 object count, each descriptor (info + packed size), then
    /// the payload bytes as coalesced ranges in offset order. duplicate
    /// hashes in the input are skipped with a warning.
    pub fn transmit<W: Write>(&mut self, w: &mut W, entries: &[IndexEntry]) -> Result<()> {
        let mut sorted: Vec<IndexEntry> = entries.to_vec();
        sorted.sort_by_key(|e| e.offset);

        let mut included = HashSet::new();
        let mut unique = Vec::with_capacity(sorted.len());
        for entry in sorted {
            if !included.insert(entry.info.hash) {
                warn!(hash = %entry.info.hash, "duplicate object in transmit");
                continue;
            }
            unique.push(entry);
        }

        let mut header = BytesMut::with_capacity(4 + unique.len() * (ObjectInfo::SIZE + 4));
        header.put_u32_le(unique.len() as u32);
        for entry in &unique {
            let mut info_buf = Vec::with_capacity(ObjectInfo::SIZE);
            entry.info.write_to(&mut info_buf).expect("vec write");
            header.put_slice(&info_buf);
            header.put_u32_le(entry.packed_size);
        }
        w.write_all(&header)
            .map_err(|e| Error::Protocol(format!("transmit write failed: {}", e)))?;

        // coalesce adjacent byte ranges
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for entry in &unique {
            if entry.packed_size == 0 {
                continue;
            }
            let start = entry.offset as u64;
            let end = start + entry.packed_size as u64;
            match ranges.last_mut() {
                Some((_, last_end)) if *last_end == start => *last_end = end,
                _ => ranges.push((start, end)),
            }
        }

        for (start, end) in ranges {
            self.file
                .seek(SeekFrom::Start(start))
                .with_path(&self.path)?;
            let mut buf = vec![0u8; (end - start) as usize];
            self.file.read_exact(&mut buf).with_path(&self.path)?;
            w.write_all(&buf)
                .map_err(|e| Error::Protocol(format!("transmit write failed: {}", e)))?;
        }

        Ok(())
    }

    /// parse one transmitted group from a byte stream into this packfile
    ///
    /// returns `None` when the stream's zero-count terminator is reached.
    /// index entries are recorded only after the payload bytes are durable.
    pub fn receive<R: Read>(&mut self, r: &mut R, index: &mut Index) -> Result<Option<usize>> {
        let count = r
            .read_u32_le()
            .map_err(|e| Error::Protocol(format!("short object stream: {}", e)))? as usize;
        if count == 0 {
            return Ok(None);
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

        let mut payloads = Vec::with_capacity(count);
        for size in &sizes {
            let mut buf = vec![0u8; *size];
            r.read_exact(&mut buf)
                .map_err(|e| Error::Protocol(format!("short object stream: {}", e)))?;
            payloads.push(buf);
        }

        let entries = self.append_group(&infos, &payloads)?;
        index.update_entries(&entries)?;

        Ok(Some(count))
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().with_path(&self.path)
    }
}

/// walk groups from the start, returning the length of the intact prefix and
/// the number of objects within it
fn scan_groups(file: &mut File, disk_len: u64) -> Result<(u64, usize)> {
    let mut group_off = 0u64;
    let mut num_objects = 0usize;

    while group_off < disk_len {
        if disk_len - group_off < 4 {
            break;
        }
        file.seek(SeekFrom::Start(group_off))
            .map_err(io_corrupt)?;
        let count = match file.read_u32_le() {
            Ok(c) => c as usize,
            Err(_) => break,
        };
        if count == 0 {
            break;
        }

        let header_end = group_off + group_header_size(count);
        if header_end > disk_len {
            break;
        }

        let mut header = vec![0u8; count * ENTRY_SIZE];
        if file.read_exact(&mut header).is_err() {
            break;
        }
        let mut cursor = header.as_slice();
        let mut group_end = header_end;
        let mut ok = true;
        for _ in 0..count {
            if ObjectInfo::read_from(&mut cursor).is_err() {
                ok = false;
                break;
            }
            let packed_size = cursor.read_u32_le().map_err(io_corrupt)?;
            let offset = cursor.read_u32_le().map_err(io_corrupt)?;
            if (offset as u64) < header_end {
                ok = false;
                break;
            }
            group_end = offset as u64 + packed_size as u64;
        }

        if !ok || group_end > disk_len {
            break;
        }

        num_objects += count;
        group_off = group_end;
    }

    Ok((group_off, num_objects))
}

fn io_corrupt(e: std::io::Error) -> Error {
    Error::Corrupt(format!("packfile scan failed: {}", e))
}

/// in-memory append transaction
///
/// accumulates packed objects until committed; queryable so that
/// intra-transaction deduplication works.
pub struct PfTransaction {
    pack_id: PackfileId,
    infos: Vec<ObjectInfo>,
    payloads: Vec<Vec<u8>>,
    hash_to_ix: HashMap<Hash, usize>,
    total_size: u64,
    committed: bool,
}

impl PfTransaction {
    pub fn new(pack_id: PackfileId) -> Self {
        Self {
            pack_id,
            infos: Vec::new(),
            payloads: Vec::new(),
            hash_to_ix: HashMap::new(),
            total_size: 0,
            committed: false,
        }
    }

    pub fn pack_id(&self) -> PackfileId {
        self.pack_id
    }

    pub fn has(&self, hash: &Hash) -> bool {
        self.hash_to_ix.contains_key(hash)
    }

    /// look up a pending object: header plus packed bytes
    pub fn get(&self, hash: &Hash) -> Option<(&ObjectInfo, &[u8])> {
        self.hash_to_ix
            .get(hash)
            .map(|&ix| (&self.infos[ix], self.payloads[ix].as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn full(&self) -> bool {
        self.infos.len() >= PACKFILE_MAXOBJS || self.total_size >= PACKFILE_MAXSIZE
    }

    /// stage one packed payload
    pub fn add(&mut self, info: ObjectInfo, packed: Vec<u8>) -> Result<()> {
        if self.committed {
            return Err(Error::Unsupported(
                "adding payload to a committed transaction".into(),
            ));
        }
        if self.has(&info.hash) {
            warn!(hash = %info.hash, "duplicate payload staged in transaction");
            return Ok(());
        }
        self.total_size += packed.len() as u64;
        self.hash_to_ix.insert(info.hash, self.infos.len());
        self.infos.push(info);
        self.payloads.push(packed);
        Ok(())
    }

    /// write the staged group and publish its index entries
    ///
    /// either every object lands in the index or none does.
    pub fn commit(&mut self, pf: &mut Packfile, index: &mut Index) -> Result<Vec<IndexEntry>> {
        if self.committed {
            return Err(Error::Unsupported("transaction already committed".into()));
        }
        let entries = pf.append_group(&self.infos, &self.payloads)?;
        index.update_entries(&entries)?;
        self.committed = true;
        Ok(entries)
    }
}
