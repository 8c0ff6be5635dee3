//! the wire path: transmit, receive, pull
//!
//! transmit serializes requested objects from one or more packfiles as a
//! single zero-terminated stream; receive parses such a stream into the
//! current packfile and publishes index entries batch-atomically. pull
//! drives breadth-first discovery over that pair against any [`Remote`].

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io::{Read, Write};
use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::index::{IndexEntry, PackfileId};
use crate::object::{Object, ObjectInfo, ObjectType};
use crate::remote::Remote;
use crate::stream::WriteExt;
use crate::types::{Commit, EntryType, LargeBlob, Tree};

use super::Repo;

/// counters reported by a pull
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PullStats {
    pub received_objects: usize,
    pub batches: usize,
}

impl Repo {
    /// serialize the given objects onto a byte stream, zero-terminated
    pub fn transmit<W: Write>(&mut self, w: &mut W, hashes: &[Hash]) -> Result<()> {
        self.commit_transaction()?;

        let mut included = HashSet::new();
        let mut by_pack: BTreeMap<PackfileId, Vec<IndexEntry>> = BTreeMap::new();
        for hash in hashes {
            if !included.insert(*hash) {
                debug!(hash = %hash, "duplicate object in transmit request");
                continue;
            }
            let entry = match self.index.get(hash) {
                Some(e) if e.info.kind != ObjectType::Purged => *e,
                _ => return Err(Error::ObjectNotFound(*hash)),
            };
            by_pack.entry(entry.packfile).or_default().push(entry);
        }

        for (id, entries) in by_pack {
            let pack = self.packfiles.get_packfile(id)?;
            let mut pack = pack.lock().expect("packfile lock poisoned");
            pack.transmit(w, &entries)?;
        }

        w.write_u32_le(0)
            .map_err(|e| Error::Protocol(format!("transmit write failed: {}", e)))?;
        Ok(())
    }

    /// parse an object stream into local packfiles; returns objects received
    pub fn receive<R: Read>(&mut self, r: &mut R) -> Result<usize> {
        let mut total = 0;
        loop {
            let need_new = match &self.cur_pack {
                None => true,
                Some(pack) => pack.lock().expect("packfile lock poisoned").is_full(),
            };
            if need_new {
                self.cur_pack = Some(self.packfiles.new_packfile()?);
            }

            let pack = self.cur_pack.clone().expect("packfile just ensured");
            let mut pack = pack.lock().expect("packfile lock poisoned");
            match pack.receive(r, &mut self.index)? {
                Some(count) => total += count,
                None => break,
            }
        }
        Ok(total)
    }

    /// transmit into a buffer; the [`Remote`] bulk-fetch entry point
    pub fn serialize_objects(&mut self, hashes: &[Hash]) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.transmit(&mut buf, hashes)?;
        Ok(buf)
    }

    /// fetch everything the peer has that we lack
    ///
    /// walks outward from unknown commits, fetching referenced trees,
    /// manifests, and blobs in batches. fast-forwards HEAD when our head is
    /// an ancestor of the peer's; diverged histories keep the local head and
    /// are reconciled by a later merge. interruption between batches leaves
    /// received objects in place; the next pull skips them.
    pub fn pull(&mut self, other: &mut dyn Remote) -> Result<PullStats> {
        let _lock = self.lock()?;
        let mut stats = PullStats::default();

        let remote_commits = other.list_commits()?;
        let mut queue: VecDeque<Hash> = VecDeque::new();
        for commit in &remote_commits {
            let hash = commit.hash();
            if !self.is_object_stored(&hash) {
                queue.push_back(hash);
            }
        }

        let first_batch: Vec<Hash> = queue.iter().copied().collect();
        self.fetch_batch(other, &first_batch, &mut stats)?;

        while let Some(hash) = queue.pop_front() {
            if self.interrupt.load(Ordering::Relaxed) {
                warn!("pull interrupted, keeping partial progress");
                break;
            }

            let obj = match self.get_local_object(&hash)? {
                Some(obj) => obj,
                None => {
                    debug!(hash = %hash, "object not delivered by peer");
                    continue;
                }
            };

            let mut wanted = Vec::new();
            match obj.info.kind {
                ObjectType::Commit => {
                    let commit = Commit::from_bytes(&obj.payload)?;
                    if !self.is_object_stored(&commit.tree) {
                        queue.push_back(commit.tree);
                        wanted.push(commit.tree);
                    }
                }
                ObjectType::Tree => {
                    let tree = Tree::from_bytes(&obj.payload)?;
                    for (_, entry) in tree.entries() {
                        if self.is_object_stored(&entry.hash) {
                            continue;
                        }
                        if matches!(entry.kind, EntryType::Tree | EntryType::LargeBlob) {
                            queue.push_back(entry.hash);
                        }
                        wanted.push(entry.hash);
                    }
                }
                ObjectType::LargeBlob => {
                    let manifest = LargeBlob::from_bytes(&obj.payload)?;
                    for part in manifest.parts() {
                        if !self.is_object_stored(&part.hash) {
                            wanted.push(part.hash);
                        }
                    }
                }
                ObjectType::Blob | ObjectType::Purged => {}
            }

            self.fetch_batch(other, &wanted, &mut stats)?;
        }

        self.maybe_fast_forward(other)?;
        Ok(stats)
    }

    /// peer-aware pull: route each object to the closest peer that has it
    ///
    /// peers are ranked by their distance metric; requests are partitioned
    /// into per-peer batches each round.
    pub fn multi_pull(&mut self, remotes: &mut [Box<dyn Remote>]) -> Result<PullStats> {
        if remotes.is_empty() {
            return Err(Error::Unsupported("multi-pull with no peers".into()));
        }
        let _lock = self.lock()?;
        let mut stats = PullStats::default();

        let mut order: Vec<usize> = (0..remotes.len()).collect();
        order.sort_by_key(|&i| remotes[i].distance());

        let mut queue: VecDeque<Hash> = VecDeque::new();
        let mut seen: HashSet<Hash> = HashSet::new();
        for commit in remotes[order[0]].list_commits()? {
            let hash = commit.hash();
            if !self.is_object_stored(&hash) && seen.insert(hash) {
                queue.push_back(hash);
            }
        }

        while !queue.is_empty() {
            if self.interrupt.load(Ordering::Relaxed) {
                warn!("multi-pull interrupted, keeping partial progress");
                break;
            }

            // partition this round's hashes to the closest peer holding each
            let round: Vec<Hash> = queue.drain(..).collect();
            let mut batches: Vec<Vec<Hash>> = vec![Vec::new(); remotes.len()];
            for hash in round {
                let mut routed = false;
                for &i in &order {
                    if remotes[i].has_object(&hash)? {
                        batches[i].push(hash);
                        routed = true;
                        break;
                    }
                }
                if !routed {
                    warn!(hash = %hash, "no peer has requested object");
                }
            }

            let mut received: Vec<Hash> = Vec::new();
            for (i, batch) in batches.iter().enumerate() {
                if batch.is_empty() {
                    continue;
                }
                self.fetch_batch(remotes[i].as_mut(), batch, &mut stats)?;
                received.extend_from_slice(batch);
            }

            // enqueue whatever the received objects reference
            for hash in received {
                let obj = match self.get_local_object(&hash)? {
                    Some(obj) => obj,
                    None => continue,
                };
                for child in object_children(&obj)? {
                    if !self.is_object_stored(&child) && seen.insert(child) {
                        queue.push_back(child);
                    }
                }
            }
        }

        self.maybe_fast_forward(remotes[order[0]].as_mut())?;
        Ok(stats)
    }

    fn fetch_batch(
        &mut self,
        other: &mut dyn Remote,
        batch: &[Hash],
        stats: &mut PullStats,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let stream = other.get_objects(batch)?;
        stats.received_objects += self.receive(&mut stream.as_slice())?;
        stats.batches += 1;
        Ok(())
    }

    /// move HEAD to the peer's head when ours is an ancestor of it
    fn maybe_fast_forward(&mut self, other: &mut dyn Remote) -> Result<()> {
        let remote_head = other.get_head()?;
        if remote_head.is_zero() || !self.is_object_stored(&remote_head) {
            return Ok(());
        }
        let local_head = self.head()?;
        if local_head == remote_head {
            return Ok(());
        }
        if local_head.is_zero() {
            return self.update_head(&remote_head);
        }

        let base = {
            let mut reader = |h: &Hash| self.get_commit(h);
            crate::merge::find_lca(&local_head, &remote_head, &mut reader)?
        };
        if base == local_head {
            debug!(head = %remote_head, "fast-forwarding head");
            self.update_head(&remote_head)?;
        }
        Ok(())
    }
}

/// hashes an object directly references
fn object_children(obj: &Object) -> Result<Vec<Hash>> {
    let mut children = Vec::new();
    match obj.info.kind {
        ObjectType::Commit => {
            let commit = Commit::from_bytes(&obj.payload)?;
            children.push(commit.tree);
        }
        ObjectType::Tree => {
            let tree = Tree::from_bytes(&obj.payload)?;
            for (_, entry) in tree.entries() {
                children.push(entry.hash);
            }
        }
        ObjectType::LargeBlob => {
            let manifest = LargeBlob::from_bytes(&obj.payload)?;
            for part in manifest.parts() {
                children.push(part.hash);
            }
        }
        ObjectType::Blob | ObjectType::Purged => {}
    }
    Ok(children)
}

impl Remote for Repo {
    fn get_uuid(&mut self) -> Result<String> {
        Ok(self.uuid().to_string())
    }

    fn get_head(&mut self) -> Result<Hash> {
        self.head()
    }

    fn list_commits(&mut self) -> Result<Vec<Commit>> {
        Repo::list_commits(self)
    }

    fn list_objects(&mut self) -> Result<Vec<ObjectInfo>> {
        Ok(Repo::list_objects(self))
    }

    fn get_object_info(&mut self, hash: &Hash) -> Result<Option<ObjectInfo>> {
        Ok(Repo::get_object_info(self, hash))
    }

    fn has_object(&mut self, hash: &Hash) -> Result<bool> {
        Repo::has_object(self, hash)
    }

    fn get_object(&mut self, hash: &Hash) -> Result<Option<Object>> {
        Repo::get_object(self, hash)
    }

    fn add_object(&mut self, kind: ObjectType, hash: &Hash, payload: &[u8]) -> Result<()> {
        Repo::add_object(self, kind, *hash, payload)
    }

    fn get_objects(&mut self, hashes: &[Hash]) -> Result<Vec<u8>> {
        self.serialize_objects(hashes)
    }

    fn distance(&self) -> u32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use crate::repo::tests::test_repo;
    use crate::types::tree::{
        ATTR_CTIME, ATTR_FILESIZE, ATTR_GROUPNAME, ATTR_MTIME, ATTR_PERMS, ATTR_USERNAME,
    };
    use crate::types::TreeEntry;

    fn commit_file(repo: &mut Repo, name: &str, content: &[u8]) -> Hash {
        let blob = repo.add_blob(ObjectType::Blob, content).unwrap();
        let entry = TreeEntry::new(EntryType::Blob, blob)
            .with_attr(ATTR_PERMS, "644")
            .with_attr(ATTR_USERNAME, "tester")
            .with_attr(ATTR_GROUPNAME, "testers")
            .with_attr(ATTR_FILESIZE, content.len().to_string())
            .with_attr(ATTR_MTIME, "1700000000")
            .with_attr(ATTR_CTIME, "1700000000");

        let head = repo.head().unwrap();
        let mut flat = repo.flatten_commit_tree(&head).unwrap();
        flat.insert(name.to_string(), entry);
        let tree = repo.materialize_flat_tree(&flat).unwrap();
        repo.commit_from_tree(&tree, Commit::new(tree, "test commit"), "normal")
            .unwrap()
    }

    #[test]
    fn test_transmit_receive_between_repos() {
        let (_da, mut a) = test_repo();
        let (_db, mut b) = test_repo();

        let payloads: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 300]).collect();
        let hashes: Vec<Hash> = payloads
            .iter()
            .map(|p| a.add_blob(ObjectType::Blob, p).unwrap())
            .collect();
        a.sync().unwrap();

        let stream = a.serialize_objects(&hashes).unwrap();
        let received = b.receive(&mut stream.as_slice()).unwrap();
        assert_eq!(received, 5);

        // receiver's objects match byte for byte
        for (payload, hash) in payloads.iter().zip(&hashes) {
            let obj = b.get_object(hash).unwrap().unwrap();
            assert_eq!(obj.payload, *payload);
        }
    }

    #[test]
    fn test_transmit_spans_packfiles() {
        let (_da, mut a) = test_repo();
        let (_db, mut b) = test_repo();

        // force two packfiles by exceeding the object limit
        let mut hashes = Vec::new();
        for i in 0..(crate::packfile::PACKFILE_MAXOBJS + 5) {
            let payload = (i as u64).to_le_bytes();
            hashes.push(a.add_blob(ObjectType::Blob, &payload).unwrap());
        }
        a.sync().unwrap();
        assert!(a.packfiles.list().unwrap().len() >= 2);

        let stream = a.serialize_objects(&hashes).unwrap();
        let received = b.receive(&mut stream.as_slice()).unwrap();
        assert_eq!(received, hashes.len());
    }

    #[test]
    fn test_transmit_unknown_hash_fails() {
        let (_da, mut a) = test_repo();
        let ghost = hash_bytes(b"not here");
        assert!(matches!(
            a.serialize_objects(&[ghost]),
            Err(Error::ObjectNotFound(_))
        ));
    }

    #[test]
    fn test_pull_fetches_full_history() {
        let (_da, mut a) = test_repo();
        let (_db, mut b) = test_repo();

        commit_file(&mut a, "one.txt", b"first file");
        let a_head = commit_file(&mut a, "two.txt", b"second file");
        a.sync().unwrap();

        let stats = b.pull(&mut a).unwrap();
        assert!(stats.received_objects > 0);

        // every object a holds is now in b
        for info in a.list_objects() {
            assert!(b.is_object_stored(&info.hash), "missing {}", info.hash);
        }
        // empty local history fast-forwards to the peer's head
        assert_eq!(b.head().unwrap(), a_head);

        let a_commits = a.list_commits().unwrap();
        let b_commits = b.list_commits().unwrap();
        assert_eq!(a_commits, b_commits);
    }

    #[test]
    fn test_pull_incremental_skips_known() {
        let (_da, mut a) = test_repo();
        let (_db, mut b) = test_repo();

        commit_file(&mut a, "f", b"v1");
        a.sync().unwrap();
        b.pull(&mut a).unwrap();
        let after_first = b.list_objects().len();

        commit_file(&mut a, "f", b"v2");
        a.sync().unwrap();
        let stats = b.pull(&mut a).unwrap();

        // the v1 blob is not re-fetched; only new commit/tree/blob arrive
        assert!(stats.received_objects <= 3);
        assert!(b.list_objects().len() > after_first);
    }

    #[test]
    fn test_pull_then_merge_converges() {
        let (_da, mut a) = test_repo();
        let (_db, mut b) = test_repo();

        // a commits f="A"; b clones
        commit_file(&mut a, "f", b"A");
        a.sync().unwrap();
        b.pull(&mut a).unwrap();

        // the histories diverge: one commit on each side
        commit_file(&mut a, "f2", b"A2");
        a.sync().unwrap();
        commit_file(&mut b, "g", b"B");
        b.sync().unwrap();

        // a pulls b: diverged, so no fast-forward
        let a_head_before = a.head().unwrap();
        a.pull(&mut b).unwrap();
        assert_eq!(a.head().unwrap(), a_head_before);

        // a merges b's head and commits
        let b_head = b.head().unwrap();
        let result = a.merge(&b_head).unwrap();
        assert!(result.conflicts.is_empty());
        a.commit_from_tree(&result.tree, Commit::new(result.tree, "merge"), "normal")
            .unwrap();
        a.sync().unwrap();

        // b pulls a and fast-forwards onto the merge commit
        b.pull(&mut a).unwrap();
        assert_eq!(a.head().unwrap(), b.head().unwrap());
        assert_eq!(a.list_commits().unwrap(), b.list_commits().unwrap());

        // merged tree carries both sides
        let head = a.head().unwrap();
        let flat = a.flatten_commit_tree(&head).unwrap();
        assert!(flat.contains_key("f"));
        assert!(flat.contains_key("f2"));
        assert!(flat.contains_key("g"));
    }

    #[test]
    fn test_pull_large_file() {
        use rand::{RngCore, SeedableRng};

        let (da, mut a) = test_repo();
        let (_db, mut b) = test_repo();

        let mut rng = rand::rngs::StdRng::seed_from_u64(21);
        let mut data = vec![0u8; 2 * 1024 * 1024];
        rng.fill_bytes(&mut data);
        let src = da.path().join("big.bin");
        std::fs::write(&src, &data).unwrap();

        let (primary, large) = a.add_file(&src).unwrap();
        let entry = TreeEntry::new(EntryType::LargeBlob, primary)
            .with_large_hash(large)
            .with_attr(ATTR_PERMS, "644")
            .with_attr(ATTR_USERNAME, "tester")
            .with_attr(ATTR_GROUPNAME, "testers")
            .with_attr(ATTR_FILESIZE, data.len().to_string())
            .with_attr(ATTR_MTIME, "1700000000")
            .with_attr(ATTR_CTIME, "1700000000");
        let mut flat = crate::treediff::FlatTree::new();
        flat.insert("big.bin".to_string(), entry);
        let tree = a.materialize_flat_tree(&flat).unwrap();
        a.commit_from_tree(&tree, Commit::new(tree, "big"), "normal")
            .unwrap();
        a.sync().unwrap();

        b.pull(&mut a).unwrap();

        // reassemble on the receiving side
        let dest = da.path().join("rebuilt.bin");
        b.copy_object_to(&primary, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[test]
    fn test_multi_pull_prefers_closer_peer() {
        struct Ranked {
            repo: Repo,
            distance: u32,
        }
        impl Remote for Ranked {
            fn get_uuid(&mut self) -> Result<String> {
                self.repo.get_uuid()
            }
            fn get_head(&mut self) -> Result<Hash> {
                self.repo.get_head()
            }
            fn list_commits(&mut self) -> Result<Vec<Commit>> {
                self.repo.list_commits()
            }
            fn list_objects(&mut self) -> Result<Vec<ObjectInfo>> {
                Remote::list_objects(&mut self.repo)
            }
            fn get_object_info(&mut self, hash: &Hash) -> Result<Option<ObjectInfo>> {
                Remote::get_object_info(&mut self.repo, hash)
            }
            fn get_object(&mut self, hash: &Hash) -> Result<Option<Object>> {
                Remote::get_object(&mut self.repo, hash)
            }
            fn add_object(&mut self, kind: ObjectType, hash: &Hash, payload: &[u8]) -> Result<()> {
                Remote::add_object(&mut self.repo, kind, hash, payload)
            }
            fn get_objects(&mut self, hashes: &[Hash]) -> Result<Vec<u8>> {
                self.repo.serialize_objects(hashes)
            }
            fn distance(&self) -> u32 {
                self.distance
            }
        }

        let (_da, mut a) = test_repo();
        let (_dc, mut far) = test_repo();

        commit_file(&mut far, "f", b"shared history");
        far.sync().unwrap();

        // near peer has the same objects (cloned from far)
        let (_dn, mut near) = test_repo();
        near.pull(&mut far).unwrap();
        near.sync().unwrap();

        let mut peers: Vec<Box<dyn Remote>> = vec![
            Box::new(Ranked {
                repo: far,
                distance: 50,
            }),
            Box::new(Ranked {
                repo: near,
                distance: 1,
            }),
        ];

        let stats = a.multi_pull(&mut peers).unwrap();
        assert!(stats.received_objects > 0);
        assert!(a
            .has_object(&hash_bytes(b"shared history"))
            .unwrap());
    }
}
