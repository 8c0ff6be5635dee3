//! reference-count and metadata log
//!
//! an append-only log of transactions. each record stores post-transaction
//! *absolute* refcounts, which makes replay idempotent against a truncated
//! tail: on open we replay until a short record and drop it. two in-memory
//! maps are the authoritative runtime state; the log is their durable
//! shadow.
//!
//! record layout:
//!
//! ```text
//! u32 nbytes
//! payload {
//!   u32 num_refcount_updates
//!   u32 num_metadata_updates
//!   num_refcount_updates x { hash, i32 new_refcount }
//!   num_metadata_updates x { hash, u32 k, k x { pstr key, pstr value } }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::stream::{ReadExt, WriteExt};

pub type RefcountMap = HashMap<Hash, i32>;
pub type MetadataMap = HashMap<Hash, BTreeMap<String, String>>;

/// buffered refcount deltas and metadata writes, applied atomically
///
/// commit is explicit; a transaction dropped without commit has no effect.
#[derive(Default)]
pub struct MdTransaction {
    counts: HashMap<Hash, i32>,
    metadata: HashMap<Hash, BTreeMap<String, String>>,
}

impl MdTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ref(&mut self, hash: Hash) {
        *self.counts.entry(hash).or_insert(0) += 1;
    }

    pub fn dec_ref(&mut self, hash: Hash) {
        *self.counts.entry(hash).or_insert(0) -= 1;
    }

    /// pending delta for a hash, for callers that need to reason about
    /// counts mid-transaction
    pub fn delta(&self, hash: &Hash) -> i32 {
        self.counts.get(hash).copied().unwrap_or(0)
    }

    pub fn set_meta(&mut self, hash: Hash, key: impl Into<String>, value: impl Into<String>) {
        self.metadata
            .entry(hash)
            .or_default()
            .insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty() && self.metadata.is_empty()
    }
}

/// the metadata log
pub struct MetadataLog {
    path: PathBuf,
    file: File,
    refcounts: RefcountMap,
    metadata: MetadataMap,
}

impl MetadataLog {
    /// open the log, replaying every intact record; a truncated tail is
    /// trimmed with a warning
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_path(path)?;

        let disk_len = file.metadata().with_path(path)?.len();
        let mut refcounts = RefcountMap::new();
        let mut metadata = MetadataMap::new();

        let mut pos = 0u64;
        file.seek(SeekFrom::Start(0)).with_path(path)?;
        while pos < disk_len {
            if disk_len - pos < 4 {
                break;
            }
            let nbytes = match file.read_u32_le() {
                Ok(n) => n as u64,
                Err(_) => break,
            };
            if pos + 4 + nbytes > disk_len {
                break;
            }

            let mut payload = vec![0u8; nbytes as usize];
            if file.read_exact(&mut payload).is_err() {
                break;
            }
            if apply_record(&payload, &mut refcounts, &mut metadata).is_err() {
                break;
            }
            pos += 4 + nbytes;
        }

        if pos < disk_len {
            warn!(
                path = %path.display(),
                dropped = disk_len - pos,
                "trimming torn metadata log record"
            );
            file.set_len(pos).with_path(path)?;
        }
        file.seek(SeekFrom::End(0)).with_path(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            refcounts,
            metadata,
        })
    }

    pub fn get_ref_count(&self, hash: &Hash) -> i32 {
        self.refcounts.get(hash).copied().unwrap_or(0)
    }

    pub fn get_meta(&self, hash: &Hash, key: &str) -> Option<&str> {
        self.metadata
            .get(hash)?
            .get(key)
            .map(|s| s.as_str())
    }

    pub fn refcounts(&self) -> &RefcountMap {
        &self.refcounts
    }

    pub fn metadata_map(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn begin(&self) -> MdTransaction {
        MdTransaction::new()
    }

    /// apply a transaction: one durable record, then the in-memory maps
    ///
    /// a delta that would push any refcount negative fails the whole
    /// transaction before anything is written.
    pub fn commit(&mut self, tx: MdTransaction) -> Result<()> {
        if tx.is_empty() {
            return Ok(());
        }
        debug!(
            refcounts = tx.counts.len(),
            metadata = tx.metadata.len(),
            "committing metadata transaction"
        );

        // resolve deltas to absolute values first so the record is replayable
        let mut finals: BTreeMap<Hash, i32> = BTreeMap::new();
        for (hash, delta) in &tx.counts {
            debug_assert!(!hash.is_zero());
            let count = self.get_ref_count(hash) + delta;
            if count < 0 {
                return Err(Error::NegativeRefcount { hash: *hash, count });
            }
            finals.insert(*hash, count);
        }

        let mut payload = Vec::new();
        payload.write_u32_le(finals.len() as u32).expect("vec write");
        payload.write_u32_le(tx.metadata.len() as u32).expect("vec write");
        for (hash, count) in &finals {
            payload.write_hash(hash).expect("vec write");
            payload.write_i32_le(*count).expect("vec write");
        }
        let meta_sorted: BTreeMap<&Hash, &BTreeMap<String, String>> = tx.metadata.iter().collect();
        for (hash, entries) in &meta_sorted {
            payload.write_hash(hash).expect("vec write");
            payload.write_u32_le(entries.len() as u32).expect("vec write");
            for (key, value) in entries.iter() {
                payload
                    .write_pstr(key)
                    .with_path(&self.path)?;
                payload
                    .write_pstr(value)
                    .with_path(&self.path)?;
            }
        }

        let mut record = Vec::with_capacity(4 + payload.len());
        record.write_u32_le(payload.len() as u32).expect("vec write");
        record.extend_from_slice(&payload);
        self.file.write_all(&record).with_path(&self.path)?;

        for (hash, count) in finals {
            self.refcounts.insert(hash, count);
        }
        for (hash, entries) in tx.metadata {
            let slot = self.metadata.entry(hash).or_default();
            for (key, value) in entries {
                slot.insert(key, value);
            }
        }

        Ok(())
    }

    /// run a closure inside a transaction; commits on success, discards on
    /// failure
    pub fn with_transaction<T>(
        &mut self,
        f: impl FnOnce(&mut MdTransaction) -> Result<T>,
    ) -> Result<T> {
        let mut tx = MdTransaction::new();
        let val = f(&mut tx)?;
        self.commit(tx)?;
        Ok(val)
    }

    /// drop all history: write one record holding every nonzero refcount and
    /// nonempty metadata entry under a temp name, then atomically rename
    pub fn rewrite(&mut self) -> Result<()> {
        let refs: RefcountMap = self
            .refcounts
            .iter()
            .filter(|(_, &c)| c != 0)
            .map(|(h, &c)| (*h, c))
            .collect();
        let meta: MetadataMap = self
            .metadata
            .iter()
            .filter(|(_, m)| !m.is_empty())
            .map(|(h, m)| (*h, m.clone()))
            .collect();
        self.rewrite_with(refs, meta)
    }

    /// like [`rewrite`](Self::rewrite) but with replacement state, used when
    /// recomputed refcounts must overwrite the log wholesale
    pub fn rewrite_with(&mut self, refs: RefcountMap, meta: MetadataMap) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        let tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .with_path(&tmp_path)?;

        self.file = tmp;
        self.refcounts.clear();
        self.metadata.clear();

        let mut tx = MdTransaction::new();
        for (hash, count) in &refs {
            if *count != 0 {
                *tx.counts.entry(*hash).or_insert(0) = *count;
            }
        }
        for (hash, entries) in &meta {
            for (key, value) in entries {
                tx.set_meta(*hash, key.clone(), value.clone());
            }
        }
        self.commit(tx)?;
        self.file.sync_all().with_path(&tmp_path)?;

        std::fs::rename(&tmp_path, &self.path).with_path(&self.path)?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().with_path(&self.path)
    }
}

fn apply_record(
    payload: &[u8],
    refcounts: &mut RefcountMap,
    metadata: &mut MetadataMap,
) -> std::io::Result<()> {
    let mut r = payload;
    let num_rc = r.read_u32_le()?;
    let num_md = r.read_u32_le()?;

    for _ in 0..num_rc {
        let hash = r.read_hash()?;
        let count = r.read_i32_le()?;
        refcounts.insert(hash, count);
    }

    for _ in 0..num_md {
        let hash = r.read_hash()?;
        let k = r.read_u32_le()?;
        let slot = metadata.entry(hash).or_default();
        for _ in 0..k {
            let key = r.read_pstr()?;
            let value = r.read_pstr()?;
            slot.insert(key, value);
        }
    }

    Ok(())
}
