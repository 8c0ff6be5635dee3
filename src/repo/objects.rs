//! object operations: add, get, verify, purge
//!
//! writes flow through the current packfile transaction; reads consult the
//! transaction first, then the index, then the remote fallback when one is
//! attached.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use tracing::{debug, warn};

use crate::chunker::Chunker;
use crate::config::LARGE_FILE_THRESHOLD;
use crate::error::{Error, IoResultExt, Result};
use crate::hash::{hash_bytes, hash_file, Hash};
use crate::index::{IndexEntry, PackfileId};
use crate::object::{pack_payload, unpack_payload, Object, ObjectInfo, ObjectType};
use crate::packfile::PfTransaction;
use crate::types::{LargeBlob, Tree};

use super::Repo;

impl Repo {
    /// true when the object is present locally (transaction or index)
    pub fn is_object_stored(&self, hash: &Hash) -> bool {
        if let Some(txn) = &self.cur_txn {
            if txn.has(hash) {
                return true;
            }
        }
        matches!(self.index.get(hash), Some(e) if e.info.kind != ObjectType::Purged)
    }

    /// local presence, or remote presence when a fallback is attached
    pub fn has_object(&mut self, hash: &Hash) -> Result<bool> {
        if self.is_object_stored(hash) {
            return Ok(true);
        }
        if let Some(remote) = self.remote.as_mut() {
            return remote.has_object(hash);
        }
        Ok(false)
    }

    /// store one object; a no-op when the hash is already present
    pub fn add_object(&mut self, kind: ObjectType, hash: Hash, payload: &[u8]) -> Result<()> {
        debug_assert!(!hash.is_zero());
        self.purged.remove(&hash);

        if self.is_object_stored(&hash) {
            return Ok(());
        }

        self.ensure_transaction()?;

        let (flags, packed) = pack_payload(payload, self.config().compression)?;
        let mut info = ObjectInfo::new(kind, hash, payload.len() as u32);
        info.flags = flags;
        self.cur_txn
            .as_mut()
            .expect("transaction just ensured")
            .add(info, packed)
    }

    /// hash a payload and store it
    pub fn add_blob(&mut self, kind: ObjectType, payload: &[u8]) -> Result<Hash> {
        let hash = hash_bytes(payload);
        self.add_object(kind, hash, payload)?;
        Ok(hash)
    }

    /// store a file, chunking it when it crosses the large-file threshold
    ///
    /// returns `(primary_hash, large_hash)`: for small files the blob hash
    /// and the zero hash; for chunked files the manifest hash and the
    /// whole-file hash.
    pub fn add_file(&mut self, path: &Path) -> Result<(Hash, Hash)> {
        let len = std::fs::metadata(path).with_path(path)?.len();

        if len < LARGE_FILE_THRESHOLD {
            let payload = std::fs::read(path).with_path(path)?;
            let hash = self.add_blob(ObjectType::Blob, &payload)?;
            return Ok((hash, Hash::ZERO));
        }

        let total_hash = hash_file(path)?;
        let mut manifest = LargeBlob::new(total_hash);

        let mode = self.config().chunker.clone();
        let file = File::open(path).with_path(path)?;
        for chunk in Chunker::new(&mode, BufReader::new(file)) {
            let chunk = chunk.with_path(path)?;
            let hash = self.add_blob(ObjectType::Blob, &chunk.data)?;
            manifest.push(hash, chunk.len() as u32)?;
        }

        let manifest_hash = self.add_blob(ObjectType::LargeBlob, &manifest.to_bytes())?;
        Ok((manifest_hash, total_hash))
    }

    /// fetch an object: transaction, then index, then remote fallback
    pub fn get_object(&mut self, hash: &Hash) -> Result<Option<Object>> {
        if let Some(obj) = self.get_local_object(hash)? {
            return Ok(Some(obj));
        }

        if self.remote.is_some() {
            debug!(hash = %hash, "object missing locally, trying remote");
            let fetched = self
                .remote
                .as_mut()
                .expect("checked above")
                .get_object(hash)?;
            if let Some(obj) = fetched {
                if self.cache_remote_objects {
                    self.add_object(obj.info.kind, *hash, &obj.payload)?;
                }
                return Ok(Some(obj));
            }
        }

        Ok(None)
    }

    pub(crate) fn get_local_object(&mut self, hash: &Hash) -> Result<Option<Object>> {
        if let Some(txn) = &self.cur_txn {
            if let Some((info, packed)) = txn.get(hash) {
                let payload = unpack_payload(info, packed)?;
                return Ok(Some(Object {
                    info: *info,
                    payload,
                }));
            }
        }

        let entry = match self.index.get(hash) {
            Some(e) if e.info.kind != ObjectType::Purged => *e,
            _ => return Ok(None),
        };
        let pack = self.packfiles.get_packfile(entry.packfile)?;
        let stored = pack
            .lock()
            .expect("packfile lock poisoned")
            .read_payload(&entry)?;
        let payload = unpack_payload(&entry.info, &stored)?;
        Ok(Some(Object {
            info: entry.info,
            payload,
        }))
    }

    /// payload of an object that must exist
    pub fn get_payload(&mut self, hash: &Hash) -> Result<Vec<u8>> {
        self.get_object(hash)?
            .map(|o| o.payload)
            .ok_or(Error::ObjectNotFound(*hash))
    }

    pub fn get_object_info(&mut self, hash: &Hash) -> Option<ObjectInfo> {
        if let Some(txn) = &self.cur_txn {
            if let Some((info, _)) = txn.get(hash) {
                return Some(*info);
            }
        }
        self.index.get(hash).map(|e| e.info)
    }

    /// headers of every indexed object, purged tombstones included
    pub fn list_objects(&self) -> Vec<ObjectInfo> {
        self.index.list()
    }

    /// copy an object's content to a filesystem path
    ///
    /// blobs are written directly; large blobs are reassembled from their
    /// parts and verified against the whole-file hash.
    pub fn copy_object_to(&mut self, hash: &Hash, dest: &Path) -> Result<()> {
        use std::io::Write;

        let obj = self
            .get_object(hash)?
            .ok_or(Error::ObjectNotFound(*hash))?;

        match obj.info.kind {
            ObjectType::Blob => {
                std::fs::write(dest, &obj.payload).with_path(dest)?;
            }
            ObjectType::LargeBlob => {
                let manifest = LargeBlob::from_bytes(&obj.payload)?;
                let mut file = File::create(dest).with_path(dest)?;
                for part in manifest.parts() {
                    let payload = self.get_payload(&part.hash)?;
                    if payload.len() != part.length as usize {
                        return Err(Error::Corrupt(format!(
                            "part {} is {} bytes, manifest says {}",
                            part.hash,
                            payload.len(),
                            part.length
                        )));
                    }
                    file.write_all(&payload).with_path(dest)?;
                }
                file.sync_all().with_path(dest)?;

                let extracted = hash_file(dest)?;
                if extracted != manifest.total_hash {
                    return Err(Error::CorruptObject(*hash));
                }
            }
            other => {
                return Err(Error::Unsupported(format!(
                    "cannot extract {} object {}",
                    other, hash
                )))
            }
        }
        Ok(())
    }

    /// check one object; `None` means it verifies
    pub fn verify_object(&mut self, hash: &Hash) -> Option<String> {
        if let Some(entry) = self.index.get(hash) {
            if entry.info.kind == ObjectType::Purged {
                return None;
            }
        }

        let obj = match self.get_local_object(hash) {
            Ok(Some(obj)) => obj,
            Ok(None) => return Some("object not found".to_string()),
            Err(e) => return Some(format!("cannot open object: {}", e)),
        };

        let computed = hash_bytes(&obj.payload);
        if computed != *hash {
            return Some(format!("object hash mismatch (computed {})", computed));
        }

        match obj.info.kind {
            ObjectType::Blob => {}
            ObjectType::Tree => {
                let tree = match Tree::from_bytes(&obj.payload) {
                    Ok(t) => t,
                    Err(e) => return Some(format!("unparsable tree: {}", e)),
                };
                for (name, entry) in tree.entries() {
                    if !entry.has_basic_attrs() {
                        return Some(format!("tree entry {} missing basic attrs", name));
                    }
                }
            }
            ObjectType::LargeBlob => {
                if let Err(e) = LargeBlob::from_bytes(&obj.payload) {
                    return Some(format!("unparsable large-blob manifest: {}", e));
                }
            }
            ObjectType::Commit => {
                let commit = match crate::types::Commit::from_bytes(&obj.payload) {
                    Ok(c) => c,
                    Err(e) => return Some(format!("unparsable commit: {}", e)),
                };
                if !self.is_object_stored(&commit.tree) {
                    return Some(format!("commit tree {} missing", commit.tree));
                }
                for parent in [commit.parent1, commit.parent2] {
                    if !parent.is_zero() && !self.is_object_stored(&parent) {
                        return Some(format!("commit parent {} missing", parent));
                    }
                }
            }
            ObjectType::Purged => {}
        }

        None
    }

    /// verify everything; returns the failures
    pub fn verify(&mut self) -> Vec<(Hash, String)> {
        let hashes: Vec<Hash> = self.index.entries().map(|e| e.info.hash).collect();
        let mut failures = Vec::new();
        for hash in hashes {
            if let Some(reason) = self.verify_object(&hash) {
                warn!(hash = %hash, %reason, "object failed verification");
                failures.push((hash, reason));
            }
        }
        failures
    }

    /// schedule an unreferenced object for removal at the next gc
    pub fn purge_object(&mut self, hash: &Hash) -> Result<()> {
        let count = self.metadata.get_ref_count(hash);
        if count != 0 {
            return Err(Error::Unsupported(format!(
                "cannot purge {}: refcount is {}",
                hash, count
            )));
        }
        self.commit_transaction()?;
        if !self.is_object_stored(hash) {
            return Err(Error::ObjectNotFound(*hash));
        }
        self.purged.insert(*hash);
        Ok(())
    }

    /// garbage collect: flush state, compact the logs, and physically drop
    /// purged objects by rewriting their packfiles
    pub fn gc(&mut self) -> Result<()> {
        self.commit_transaction()?;
        self.cur_pack = None;

        // group doomed hashes by the packfile that holds them
        let mut by_pack: HashMap<PackfileId, HashSet<Hash>> = HashMap::new();
        for hash in &self.purged {
            if let Some(entry) = self.index.get(hash) {
                if entry.info.kind != ObjectType::Purged {
                    by_pack.entry(entry.packfile).or_default().insert(*hash);
                }
            }
        }

        for (id, doomed) in by_pack {
            let pack = self.packfiles.get_packfile(id)?;
            let (survivors, empty) =
                pack.lock().expect("packfile lock poisoned").purge(&doomed)?;
            drop(pack);

            // survivors moved to fresh offsets; doomed hashes become tombstones
            self.index.update_entries(&survivors)?;
            for hash in doomed {
                let info = ObjectInfo::new(ObjectType::Purged, hash, 0);
                self.index.update_entry(IndexEntry {
                    info,
                    offset: 0,
                    packed_size: 0,
                    packfile: id,
                })?;
            }

            if empty {
                debug!(id, "packfile emptied by purge, reclaiming");
                self.packfiles.reclaim(id)?;
            }
        }
        self.purged.clear();

        self.index.rewrite()?;
        self.metadata.rewrite()?;
        self.snapshots.rewrite()?;
        self.packfiles.save()?;
        Ok(())
    }

    pub(crate) fn ensure_transaction(&mut self) -> Result<()> {
        if let Some(txn) = &self.cur_txn {
            if !txn.full() {
                return Ok(());
            }
            self.commit_transaction()?;
        }

        let pack_full = match &self.cur_pack {
            Some(pack) => pack.lock().expect("packfile lock poisoned").is_full(),
            None => true,
        };
        if pack_full {
            self.cur_pack = Some(self.packfiles.new_packfile()?);
        }

        let id = self
            .cur_pack
            .as_ref()
            .expect("packfile just ensured")
            .lock()
            .expect("packfile lock poisoned")
            .id();
        self.cur_txn = Some(PfTransaction::new(id));
        Ok(())
    }
}
