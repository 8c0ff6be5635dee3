//! named snapshot index
//!
//! an append-only log of `(pstr name, commit hash)` records replayed into a
//! map on open. writing the zero hash for a name deletes it. `rewrite`
//! compacts the log to the live map.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::stream::{ReadExt, WriteExt};

pub struct SnapshotIndex {
    path: PathBuf,
    file: File,
    snapshots: BTreeMap<String, Hash>,
}

impl SnapshotIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_path(path)?;

        let disk_len = file.metadata().with_path(path)?.len();
        let mut snapshots = BTreeMap::new();

        file.seek(SeekFrom::Start(0)).with_path(path)?;
        let mut pos = 0u64;
        {
            let mut reader = BufReader::new(&mut file);
            loop {
                let name = match reader.read_pstr() {
                    Ok(n) => n,
                    Err(_) => break,
                };
                let hash = match reader.read_hash() {
                    Ok(h) => h,
                    Err(_) => break,
                };
                pos += 1 + name.len() as u64 + Hash::SIZE as u64;
                if hash.is_zero() {
                    snapshots.remove(&name);
                } else {
                    snapshots.insert(name, hash);
                }
            }
        }

        if pos < disk_len {
            warn!(path = %path.display(), "trimming torn snapshot record");
            file.set_len(pos).with_path(path)?;
        }
        file.seek(SeekFrom::End(0)).with_path(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            snapshots,
        })
    }

    pub fn add(&mut self, name: &str, commit: &Hash) -> Result<()> {
        if commit.is_zero() {
            return Err(Error::Unsupported(
                "cannot record a snapshot of the empty commit".into(),
            ));
        }
        self.append_record(name, commit)?;
        self.snapshots.insert(name.to_string(), *commit);
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> Result<()> {
        if !self.snapshots.contains_key(name) {
            return Err(Error::SnapshotNotFound(name.to_string()));
        }
        self.append_record(name, &Hash::ZERO)?;
        self.snapshots.remove(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Hash> {
        self.snapshots.get(name)
    }

    /// all snapshots, sorted by name
    pub fn list(&self) -> &BTreeMap<String, Hash> {
        &self.snapshots
    }

    /// compact the log to one record per live snapshot
    pub fn rewrite(&mut self) -> Result<()> {
        self.file.set_len(0).with_path(&self.path)?;
        self.file.seek(SeekFrom::Start(0)).with_path(&self.path)?;

        let mut buf = Vec::new();
        for (name, hash) in &self.snapshots {
            buf.write_pstr(name).with_path(&self.path)?;
            buf.write_hash(hash).expect("vec write");
        }
        self.file.write_all(&buf).with_path(&self.path)?;
        self.file.sync_all().with_path(&self.path)?;
        Ok(())
    }

    fn append_record(&mut self, name: &str, hash: &Hash) -> Result<()> {
        let mut buf = Vec::with_capacity(1 + name.len() + Hash::SIZE);
        buf.write_pstr(name).with_path(&self.path)?;
        buf.write_hash(hash).expect("vec write");
        self.file.write_all(&buf).with_path(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use tempfile::tempdir;

    #[test]
    fn test_add_get_list() {
        let dir = tempdir().unwrap();
        let mut idx = SnapshotIndex::open(&dir.path().join("snapshots")).unwrap();

        let h = hash_bytes(b"commit1");
        idx.add("nightly", &h).unwrap();

        assert_eq!(idx.get("nightly"), Some(&h));
        assert_eq!(idx.list().len(), 1);
    }

    #[test]
    fn test_replay_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshots");
        let (h1, h2) = (hash_bytes(b"c1"), hash_bytes(b"c2"));

        {
            let mut idx = SnapshotIndex::open(&path).unwrap();
            idx.add("v1", &h1).unwrap();
            idx.add("v2", &h2).unwrap();
            idx.delete("v1").unwrap();
        }

        let idx = SnapshotIndex::open(&path).unwrap();
        assert_eq!(idx.get("v1"), None);
        assert_eq!(idx.get("v2"), Some(&h2));
    }

    #[test]
    fn test_overwrite_name() {
        let dir = tempdir().unwrap();
        let mut idx = SnapshotIndex::open(&dir.path().join("snapshots")).unwrap();

        let (h1, h2) = (hash_bytes(b"c1"), hash_bytes(b"c2"));
        idx.add("head", &h1).unwrap();
        idx.add("head", &h2).unwrap();

        assert_eq!(idx.get("head"), Some(&h2));
        assert_eq!(idx.list().len(), 1);
    }

    #[test]
    fn test_delete_missing() {
        let dir = tempdir().unwrap();
        let mut idx = SnapshotIndex::open(&dir.path().join("snapshots")).unwrap();
        assert!(matches!(
            idx.delete("ghost"),
            Err(Error::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn test_rejects_zero_hash() {
        let dir = tempdir().unwrap();
        let mut idx = SnapshotIndex::open(&dir.path().join("snapshots")).unwrap();
        assert!(idx.add("bad", &Hash::ZERO).is_err());
    }

    #[test]
    fn test_rewrite_compacts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshots");
        let mut idx = SnapshotIndex::open(&path).unwrap();

        let h = hash_bytes(b"c");
        for _ in 0..20 {
            idx.add("same", &h).unwrap();
        }
        let before = std::fs::metadata(&path).unwrap().len();

        idx.rewrite().unwrap();
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before);

        let reopened = SnapshotIndex::open(&path).unwrap();
        assert_eq!(reopened.get("same"), Some(&h));
    }

    #[test]
    fn test_torn_tail_trimmed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshots");

        let h = hash_bytes(b"c");
        {
            let mut idx = SnapshotIndex::open(&path).unwrap();
            idx.add("good", &h).unwrap();
        }

        // half a record
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[4u8]).unwrap();
            file.write_all(b"to").unwrap();
        }

        let idx = SnapshotIndex::open(&path).unwrap();
        assert_eq!(idx.get("good"), Some(&h));
        assert_eq!(idx.list().len(), 1);
    }
}
