//! commit construction, reference counting, and purge
//!
//! backref accounting is symmetric: commit time increments a subtree's
//! counts only when its refcount transitions 0 -> 1, purge time decrements
//! into a subtree only when its count falls back to 0. this keeps shared
//! subtrees counted once per incoming reference, merges included.

use std::collections::{BTreeMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::merge::{self, MergeState};
use crate::metalog::{MdTransaction, RefcountMap};
use crate::object::ObjectType;
use crate::treediff::{self, Conflict, FlatTree};
use crate::types::{Commit, EntryType, LargeBlob, Tree, TreeEntry};

use super::{now, Repo};

/// result of a two-head merge: the merged root tree, pending commit
#[derive(Debug)]
pub struct MergeResult {
    pub tree: Hash,
    pub conflicts: Vec<Conflict>,
}

impl Repo {
    // ------------------------------------------------------------------
    // typed object accessors

    pub fn get_tree(&mut self, hash: &Hash) -> Result<Tree> {
        let obj = self
            .get_object(hash)?
            .ok_or(Error::ObjectNotFound(*hash))?;
        if obj.info.kind != ObjectType::Tree {
            return Err(Error::Corrupt(format!("{} is not a tree", hash)));
        }
        Tree::from_bytes(&obj.payload)
    }

    pub fn get_commit(&mut self, hash: &Hash) -> Result<Commit> {
        let obj = self
            .get_object(hash)?
            .ok_or(Error::ObjectNotFound(*hash))?;
        if obj.info.kind != ObjectType::Commit {
            return Err(Error::Corrupt(format!("{} is not a commit", hash)));
        }
        Commit::from_bytes(&obj.payload)
    }

    pub fn get_largeblob(&mut self, hash: &Hash) -> Result<LargeBlob> {
        let obj = self
            .get_object(hash)?
            .ok_or(Error::ObjectNotFound(*hash))?;
        if obj.info.kind != ObjectType::LargeBlob {
            return Err(Error::Corrupt(format!("{} is not a large blob", hash)));
        }
        LargeBlob::from_bytes(&obj.payload)
    }

    pub fn add_tree(&mut self, tree: &Tree) -> Result<Hash> {
        self.add_blob(ObjectType::Tree, &tree.to_bytes())
    }

    pub fn add_commit(&mut self, commit: &Commit) -> Result<Hash> {
        self.add_blob(ObjectType::Commit, &commit.to_bytes())
    }

    /// every commit in the store, newest first
    pub fn list_commits(&mut self) -> Result<Vec<Commit>> {
        let hashes: Vec<Hash> = self
            .index
            .entries()
            .filter(|e| e.info.kind == ObjectType::Commit)
            .map(|e| e.info.hash)
            .collect();

        let mut commits = Vec::with_capacity(hashes.len());
        for hash in hashes {
            commits.push((hash, self.get_commit(&hash)?));
        }
        // newest first; ties broken by hash so the order is reproducible
        commits.sort_by(|(ha, a), (hb, b)| b.time.cmp(&a.time).then_with(|| ha.cmp(hb)));
        Ok(commits.into_iter().map(|(_, c)| c).collect())
    }

    /// resolve a slash-joined path inside a commit's tree
    pub fn lookup(&mut self, commit: &Commit, path: &str) -> Result<TreeEntry> {
        let mut tree = self.get_tree(&commit.tree)?;
        let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();

        loop {
            let segment = match segments.next() {
                Some(s) => s,
                None => return Err(Error::PathNotFound(path.to_string())),
            };
            let entry = tree
                .get(segment)
                .ok_or_else(|| Error::PathNotFound(path.to_string()))?
                .clone();
            if segments.peek().is_none() {
                return Ok(entry);
            }
            if entry.kind != EntryType::Tree {
                return Err(Error::PathNotFound(path.to_string()));
            }
            tree = self.get_tree(&entry.hash)?;
        }
    }

    // ------------------------------------------------------------------
    // commit

    /// build and store a commit for an existing tree
    ///
    /// fills defaults (user, time, message), takes parents from the pending
    /// merge state or HEAD, records backrefs and status in one metadata
    /// transaction, and moves HEAD when the status is "normal".
    pub fn commit_from_tree(
        &mut self,
        tree_hash: &Hash,
        mut commit: Commit,
        status: &str,
    ) -> Result<Hash> {
        let tree_obj = self
            .get_object(tree_hash)?
            .ok_or(Error::ObjectNotFound(*tree_hash))?;
        if tree_obj.info.kind != ObjectType::Tree {
            return Err(Error::Corrupt(format!("{} is not a tree", tree_hash)));
        }

        if commit.message.is_empty() {
            commit.message = "No message.".to_string();
        }
        if commit.time == 0 {
            commit.time = now();
        }
        if commit.user.is_empty() {
            commit.user = current_username();
        }
        commit.tree = *tree_hash;

        let merge_state = self.merge_state()?;
        match &merge_state {
            Some(state) => commit.set_parents(state.parent1, state.parent2),
            None => commit.set_parents(self.head()?, Hash::ZERO),
        }

        let commit_hash = self.add_commit(&commit)?;

        let mut tx = MdTransaction::new();
        self.add_commit_backrefs(&commit, &mut tx)?;
        tx.set_meta(commit_hash, "status", status);
        self.metadata.commit(tx)?;

        if !commit.snapshot.is_empty() {
            self.snapshots.add(&commit.snapshot, &commit_hash)?;
        }

        if status == "normal" {
            self.update_head(&commit_hash)?;
            if merge_state.is_some() {
                self.clear_merge_state()?;
            }
        }

        debug!(commit = %commit_hash, tree = %tree_hash, status, "created commit");
        Ok(commit_hash)
    }

    /// current commit status ("normal", "fuse", "graft", "purging", "purged")
    pub fn commit_status(&self, hash: &Hash) -> Option<String> {
        self.metadata.get_meta(hash, "status").map(|s| s.to_string())
    }

    pub fn set_commit_status(&mut self, hash: &Hash, status: &str) -> Result<()> {
        let hash = *hash;
        self.metadata.with_transaction(|tx| {
            tx.set_meta(hash, "status", status);
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // reference counting

    /// durable reference count of one object
    pub fn ref_count(&self, hash: &Hash) -> i32 {
        self.metadata.get_ref_count(hash)
    }

    /// the full refcount map as recorded in the metadata log
    pub fn ref_counts(&self) -> &RefcountMap {
        self.metadata.refcounts()
    }

    fn add_commit_backrefs(&mut self, commit: &Commit, tx: &mut MdTransaction) -> Result<()> {
        if commit.tree.is_zero() {
            return Err(Error::Corrupt("commit tree is empty".to_string()));
        }
        for parent in [commit.parent1, commit.parent2] {
            if !parent.is_zero() {
                tx.add_ref(parent);
            }
        }
        self.addref_tree(&commit.tree, tx)
    }

    /// increment a tree's count, recursing only on the 0 -> 1 transition
    fn addref_tree(&mut self, hash: &Hash, tx: &mut MdTransaction) -> Result<()> {
        tx.add_ref(*hash);
        if self.metadata.get_ref_count(hash) + tx.delta(hash) != 1 {
            return Ok(());
        }

        let tree = self.get_tree(hash)?;
        for (_, entry) in tree.entries() {
            match entry.kind {
                EntryType::Tree => self.addref_tree(&entry.hash, tx)?,
                EntryType::LargeBlob => self.addref_largeblob(&entry.hash, tx)?,
                EntryType::Blob | EntryType::Symlink => tx.add_ref(entry.hash),
            }
        }
        Ok(())
    }

    fn addref_largeblob(&mut self, hash: &Hash, tx: &mut MdTransaction) -> Result<()> {
        tx.add_ref(*hash);
        if self.metadata.get_ref_count(hash) + tx.delta(hash) != 1 {
            return Ok(());
        }
        let manifest = self.get_largeblob(hash)?;
        for part in manifest.parts() {
            tx.add_ref(part.hash);
        }
        Ok(())
    }

    /// decrement a tree's count, recursing only when it falls to 0
    fn decref_tree(&mut self, hash: &Hash, tx: &mut MdTransaction) -> Result<()> {
        tx.dec_ref(*hash);
        if self.metadata.get_ref_count(hash) + tx.delta(hash) != 0 {
            return Ok(());
        }

        let tree = self.get_tree(hash)?;
        for (_, entry) in tree.entries() {
            match entry.kind {
                EntryType::Tree => self.decref_tree(&entry.hash, tx)?,
                EntryType::LargeBlob => self.decref_largeblob(&entry.hash, tx)?,
                EntryType::Blob | EntryType::Symlink => tx.dec_ref(entry.hash),
            }
        }
        Ok(())
    }

    fn decref_largeblob(&mut self, hash: &Hash, tx: &mut MdTransaction) -> Result<()> {
        tx.dec_ref(*hash);
        if self.metadata.get_ref_count(hash) + tx.delta(hash) != 0 {
            return Ok(());
        }
        let manifest = self.get_largeblob(hash)?;
        for part in manifest.parts() {
            tx.dec_ref(part.hash);
        }
        Ok(())
    }

    /// recount every reference from scratch by walking all stored objects
    ///
    /// the slow path, used for recovery and by integrity checks.
    pub fn recompute_ref_counts(&mut self) -> Result<RefcountMap> {
        let infos = self.list_objects();
        let mut counts = RefcountMap::new();

        for info in infos {
            match info.kind {
                ObjectType::Commit => {
                    let c = self.get_commit(&info.hash)?;
                    *counts.entry(c.tree).or_insert(0) += 1;
                    for parent in [c.parent1, c.parent2] {
                        if !parent.is_zero() {
                            *counts.entry(parent).or_insert(0) += 1;
                        }
                    }
                }
                ObjectType::Tree => {
                    let t = self.get_tree(&info.hash)?;
                    for (_, entry) in t.entries() {
                        *counts.entry(entry.hash).or_insert(0) += 1;
                    }
                }
                ObjectType::LargeBlob => {
                    let lb = self.get_largeblob(&info.hash)?;
                    for part in lb.parts() {
                        *counts.entry(part.hash).or_insert(0) += 1;
                    }
                }
                ObjectType::Blob | ObjectType::Purged => {}
            }
        }

        Ok(counts)
    }

    /// replace the durable refcounts with a recomputed map
    pub fn rewrite_ref_counts(&mut self, refs: RefcountMap) -> Result<()> {
        let meta = self.metadata.metadata_map().clone();
        self.metadata.rewrite_with(refs, meta)
    }

    /// every object reachable from a tree, the tree itself included
    pub fn get_subtree_objects(&mut self, tree_hash: &Hash) -> Result<HashSet<Hash>> {
        let mut objects = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(*tree_hash);

        while let Some(hash) = queue.pop_front() {
            if !objects.insert(hash) {
                continue;
            }
            let tree = self.get_tree(&hash)?;
            for (_, entry) in tree.entries() {
                match entry.kind {
                    EntryType::Tree => queue.push_back(entry.hash),
                    EntryType::LargeBlob => {
                        if objects.insert(entry.hash) {
                            let lb = self.get_largeblob(&entry.hash)?;
                            for part in lb.parts() {
                                objects.insert(part.hash);
                            }
                        }
                    }
                    EntryType::Blob | EntryType::Symlink => {
                        objects.insert(entry.hash);
                    }
                }
            }
        }

        Ok(objects)
    }

    // ------------------------------------------------------------------
    // purge

    /// drop a commit's tree from the reference graph and purge whatever
    /// becomes unreferenced; the commit object remains as a tombstone
    pub fn purge_commit(&mut self, commit_hash: &Hash) -> Result<()> {
        for branch in self.list_branches()? {
            let path = self.root().join("refs/heads").join(&branch);
            let head = Hash::from_hex(
                std::fs::read_to_string(&path)
                    .map_err(|e| Error::Io {
                        path: path.clone(),
                        source: e,
                    })?
                    .trim(),
            )?;
            if head == *commit_hash {
                return Err(Error::Unsupported(format!(
                    "cannot purge {}: head of branch {}",
                    commit_hash, branch
                )));
            }
        }

        let commit = self.get_commit(commit_hash)?;

        let mut tx = MdTransaction::new();
        self.decref_tree(&commit.tree, &mut tx)?;
        tx.set_meta(*commit_hash, "status", "purging");
        self.metadata.commit(tx)?;

        let objects = self.get_subtree_objects(&commit.tree)?;
        for hash in objects {
            if self.metadata.get_ref_count(&hash) == 0 && self.is_object_stored(&hash) {
                self.purge_object(&hash)?;
            }
        }

        self.set_commit_status(commit_hash, "purged")?;
        Ok(())
    }

    /// purge every commit left behind by mount autosnapshots
    pub fn purge_fuse_commits(&mut self) -> Result<()> {
        let fuse: Vec<Hash> = self
            .list_commits()?
            .iter()
            .map(|c| c.hash())
            .filter(|h| self.commit_status(h).as_deref() == Some("fuse"))
            .collect();
        for hash in fuse {
            if let Err(e) = self.purge_commit(&hash) {
                warn!(commit = %hash, error = %e, "skipping unpurgeable fuse commit");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // merge

    /// flatten the tree of a commit (the zero hash yields an empty tree)
    pub fn flatten_commit_tree(&mut self, commit_hash: &Hash) -> Result<FlatTree> {
        if commit_hash.is_zero() {
            return Ok(FlatTree::new());
        }
        let tree_hash = self.get_commit(commit_hash)?.tree;
        let mut flat = FlatTree::new();
        let mut pending = vec![(String::new(), tree_hash)];
        while let Some((prefix, hash)) = pending.pop() {
            let tree = self.get_tree(&hash)?;
            for (name, entry) in tree.entries() {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", prefix, name)
                };
                if entry.kind == EntryType::Tree {
                    pending.push((path.clone(), entry.hash));
                }
                flat.insert(path, entry.clone());
            }
        }
        Ok(flat)
    }

    /// store every tree a flattened tree implies and return the root hash
    pub fn materialize_flat_tree(&mut self, flat: &FlatTree) -> Result<Hash> {
        let attrs = self.default_dir_attrs();
        let mut trees = Vec::new();
        let root = treediff::materialize(flat, &attrs, &mut |tree: &Tree| {
            trees.push(tree.clone());
            Ok(crate::hash::hash_bytes(&tree.to_bytes()))
        })?;
        for tree in trees {
            self.add_tree(&tree)?;
        }
        Ok(root)
    }

    /// merge another head into ours
    ///
    /// finds the common ancestor, merges the flattened trees, stores the
    /// merged trees, and records the pending merge state. the caller (or
    /// mount overlay) reviews conflicts and produces the commit.
    pub fn merge(&mut self, theirs: &Hash) -> Result<MergeResult> {
        let ours = self.head()?;

        let mut commits = std::collections::HashMap::new();
        let base = {
            let mut reader = |h: &Hash| -> Result<Commit> {
                // tiny memo so the ancestor walk does not re-parse commits
                if let Some(c) = commits.get(h) {
                    return Ok(Commit::clone(c));
                }
                let c = self.get_commit(h)?;
                commits.insert(*h, c.clone());
                Ok(c)
            };
            merge::find_lca(&ours, theirs, &mut reader)?
        };
        debug!(ours = %ours, theirs = %theirs, base = %base, "merging");

        let base_flat = self.flatten_commit_tree(&base)?;
        let ours_flat = self.flatten_commit_tree(&ours)?;
        let theirs_flat = self.flatten_commit_tree(theirs)?;

        let outcome = merge::merge_trees(&base_flat, &ours_flat, &theirs_flat);
        let tree = self.materialize_flat_tree(&outcome.merged)?;

        self.set_merge_state(&MergeState::new(ours, *theirs))?;

        Ok(MergeResult {
            tree,
            conflicts: outcome.conflicts,
        })
    }

    /// import a subtree from another repository as a graft commit
    pub fn graft(
        &mut self,
        other: &mut Repo,
        src_path: &str,
        dst_path: &str,
    ) -> Result<Hash> {
        let src_head = other.head()?;
        let src_commit = other.get_commit(&src_head)?;
        let entry = other.lookup(&src_commit, src_path)?;
        if entry.kind != EntryType::Tree {
            return Err(Error::Unsupported(format!(
                "graft source {} is not a directory",
                src_path
            )));
        }

        // copy the subtree's objects across
        let mut objects = other.get_subtree_objects(&entry.hash)?;
        objects.insert(entry.hash);
        for hash in objects {
            if self.is_object_stored(&hash) {
                continue;
            }
            let obj = other
                .get_object(&hash)?
                .ok_or(Error::ObjectNotFound(hash))?;
            self.add_object(obj.info.kind, hash, &obj.payload)?;
        }

        // splice the subtree into our head tree at dst_path
        let head = self.head()?;
        let mut flat = self.flatten_commit_tree(&head)?;
        let sub_flat = {
            let mut read = |h: &Hash| other.get_tree(h);
            treediff::flatten(&entry.hash, &mut read)?
        };
        flat.insert(dst_path.to_string(), entry.clone());
        for (path, sub_entry) in sub_flat {
            flat.insert(format!("{}/{}", dst_path, path), sub_entry);
        }
        let tree = self.materialize_flat_tree(&flat)?;

        let mut commit = Commit::new(tree, format!("Graft of {}", src_path));
        commit.graft = Some(crate::types::GraftInfo {
            repo: other.uuid().to_string(),
            path: src_path.to_string(),
            commit: src_head,
        });
        self.commit_from_tree(&tree, commit, "graft")
    }

    pub(crate) fn default_dir_attrs(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        let stamp = now().to_string();
        attrs.insert("perms".to_string(), "755".to_string());
        attrs.insert("username".to_string(), current_username());
        attrs.insert("groupname".to_string(), current_groupname());
        attrs.insert("filesize".to_string(), "0".to_string());
        attrs.insert("mtime".to_string(), stamp.clone());
        attrs.insert("ctime".to_string(), stamp);
        attrs
    }
}

pub(crate) fn current_username() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| "unknown".to_string())
}

pub(crate) fn current_groupname() -> String {
    nix::unistd::Group::from_gid(nix::unistd::getgid())
        .ok()
        .flatten()
        .map(|g| g.name)
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::tests::test_repo;
    use crate::types::tree::{
        ATTR_CTIME, ATTR_FILESIZE, ATTR_GROUPNAME, ATTR_MTIME, ATTR_PERMS, ATTR_USERNAME,
    };

    fn file_entry(repo: &mut Repo, content: &[u8]) -> TreeEntry {
        let hash = repo.add_blob(ObjectType::Blob, content).unwrap();
        TreeEntry::new(EntryType::Blob, hash)
            .with_attr(ATTR_PERMS, "644")
            .with_attr(ATTR_USERNAME, "tester")
            .with_attr(ATTR_GROUPNAME, "testers")
            .with_attr(ATTR_FILESIZE, content.len().to_string())
            .with_attr(ATTR_MTIME, "1700000000")
            .with_attr(ATTR_CTIME, "1700000000")
    }

    /// store a single-directory tree with one file and commit it
    fn commit_file(repo: &mut Repo, name: &str, content: &[u8], message: &str) -> (Hash, Hash) {
        let entry = file_entry(repo, content);
        let mut tree = Tree::new();
        tree.insert(name, entry).unwrap();
        let tree_hash = repo.add_tree(&tree).unwrap();
        let commit = Commit::new(tree_hash, message);
        let commit_hash = repo
            .commit_from_tree(&tree_hash, commit, "normal")
            .unwrap();
        (commit_hash, tree_hash)
    }

    #[test]
    fn test_fresh_init_single_commit() {
        let (_dir, mut repo) = test_repo();

        let (commit_hash, tree_hash) = commit_file(&mut repo, "a.txt", b"hello\n", "first");

        // head moved to the new commit
        assert_eq!(repo.head().unwrap(), commit_hash);

        let commits = repo.list_commits().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].tree, tree_hash);
        assert!(commits[0].is_root());

        // the tree holds exactly one entry pointing at the blob of "hello\n"
        let tree = repo.get_tree(&tree_hash).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(
            tree.get("a.txt").unwrap().hash,
            crate::hash::hash_bytes(b"hello\n")
        );
    }

    #[test]
    fn test_commit_defaults_filled() {
        let (_dir, mut repo) = test_repo();

        let entry = file_entry(&mut repo, b"x");
        let mut tree = Tree::new();
        tree.insert("f", entry).unwrap();
        let tree_hash = repo.add_tree(&tree).unwrap();

        let commit = Commit::new(tree_hash, "");
        let hash = repo.commit_from_tree(&tree_hash, commit, "normal").unwrap();

        let stored = repo.get_commit(&hash).unwrap();
        assert_eq!(stored.message, "No message.");
        assert!(stored.time > 0);
        assert!(!stored.user.is_empty());
        assert_eq!(repo.commit_status(&hash).as_deref(), Some("normal"));
    }

    #[test]
    fn test_second_commit_links_parent() {
        let (_dir, mut repo) = test_repo();

        let (c1, _) = commit_file(&mut repo, "a", b"1", "first");
        let (c2, _) = commit_file(&mut repo, "a", b"2", "second");

        let commit = repo.get_commit(&c2).unwrap();
        assert_eq!(commit.parent1, c1);
        assert!(commit.parent2.is_zero());
        assert_eq!(repo.head().unwrap(), c2);
    }

    #[test]
    fn test_refcounts_after_commit() {
        let (_dir, mut repo) = test_repo();

        let (_, tree_hash) = commit_file(&mut repo, "a.txt", b"hello\n", "first");

        assert_eq!(repo.metadata.get_ref_count(&tree_hash), 1);
        assert_eq!(
            repo.metadata
                .get_ref_count(&crate::hash::hash_bytes(b"hello\n")),
            1
        );
    }

    #[test]
    fn test_refcounts_match_recompute() {
        let (_dir, mut repo) = test_repo();

        commit_file(&mut repo, "a", b"one", "c1");
        commit_file(&mut repo, "a", b"two", "c2");
        commit_file(&mut repo, "b", b"one", "c3"); // shares the "one" blob
        repo.sync().unwrap();

        let recomputed = repo.recompute_ref_counts().unwrap();
        for (hash, count) in &recomputed {
            assert_eq!(
                repo.metadata.get_ref_count(hash),
                *count,
                "count mismatch for {}",
                hash
            );
        }
        // and nothing counted that recompute does not know about
        for (hash, count) in repo.metadata.refcounts() {
            if *count != 0 {
                assert_eq!(recomputed.get(hash), Some(count), "stale count for {}", hash);
            }
        }
    }

    #[test]
    fn test_gc_then_recompute_is_stable() {
        let (_dir, mut repo) = test_repo();

        commit_file(&mut repo, "a", b"data", "c1");
        repo.gc().unwrap();

        let recomputed = repo.recompute_ref_counts().unwrap();
        repo.rewrite_ref_counts(recomputed.clone()).unwrap();
        let again = repo.recompute_ref_counts().unwrap();
        assert_eq!(recomputed, again);
    }

    #[test]
    fn test_shared_subtree_counted_per_reference() {
        let (_dir, mut repo) = test_repo();

        // two commits whose root trees both point at the same subtree
        let entry = file_entry(&mut repo, b"shared content");
        let mut sub = Tree::new();
        sub.insert("f", entry).unwrap();
        let sub_hash = repo.add_tree(&sub).unwrap();

        let dir_attrs = repo.default_dir_attrs();
        let mut sub_entry = TreeEntry::new(EntryType::Tree, sub_hash);
        sub_entry.attrs = dir_attrs.clone();

        let mut root1 = Tree::new();
        root1.insert("sub", sub_entry.clone()).unwrap();
        let root1_hash = repo.add_tree(&root1).unwrap();
        repo.commit_from_tree(&root1_hash, Commit::new(root1_hash, "c1"), "normal")
            .unwrap();

        let mut root2 = Tree::new();
        root2.insert("sub", sub_entry).unwrap();
        root2
            .insert("extra", file_entry(&mut repo, b"extra"))
            .unwrap();
        let root2_hash = repo.add_tree(&root2).unwrap();
        repo.commit_from_tree(&root2_hash, Commit::new(root2_hash, "c2"), "normal")
            .unwrap();

        // subtree referenced twice, its blob still once
        assert_eq!(repo.metadata.get_ref_count(&sub_hash), 2);
        assert_eq!(
            repo.metadata
                .get_ref_count(&crate::hash::hash_bytes(b"shared content")),
            1
        );
    }

    #[test]
    fn test_purge_commit_lifecycle() {
        let (_dir, mut repo) = test_repo();

        let (c1, _) = commit_file(&mut repo, "doomed.txt", b"doomed content", "c1");
        // second commit with different content so c1 is no longer head
        let (_c2, _) = commit_file(&mut repo, "kept.txt", b"kept content", "c2");

        repo.purge_commit(&c1).unwrap();
        assert_eq!(repo.commit_status(&c1).as_deref(), Some("purged"));

        repo.gc().unwrap();
        let doomed_blob = crate::hash::hash_bytes(b"doomed content");
        assert!(!repo.has_object(&doomed_blob).unwrap());
        // the kept commit's content survives
        assert!(repo
            .has_object(&crate::hash::hash_bytes(b"kept content"))
            .unwrap());
    }

    #[test]
    fn test_purge_branch_head_rejected() {
        let (_dir, mut repo) = test_repo();

        let (c1, _) = commit_file(&mut repo, "a", b"1", "c1");
        assert!(matches!(
            repo.purge_commit(&c1),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_lookup_path() {
        let (_dir, mut repo) = test_repo();

        let entry = file_entry(&mut repo, b"deep");
        let mut inner = Tree::new();
        inner.insert("file.txt", entry).unwrap();
        let inner_hash = repo.add_tree(&inner).unwrap();

        let mut dir_entry = TreeEntry::new(EntryType::Tree, inner_hash);
        dir_entry.attrs = repo.default_dir_attrs();
        let mut root = Tree::new();
        root.insert("dir", dir_entry).unwrap();
        let root_hash = repo.add_tree(&root).unwrap();

        let commit_hash = repo
            .commit_from_tree(&root_hash, Commit::new(root_hash, "c"), "normal")
            .unwrap();
        let commit = repo.get_commit(&commit_hash).unwrap();

        let found = repo.lookup(&commit, "dir/file.txt").unwrap();
        assert_eq!(found.hash, crate::hash::hash_bytes(b"deep"));

        assert!(matches!(
            repo.lookup(&commit, "dir/ghost"),
            Err(Error::PathNotFound(_))
        ));
    }

    #[test]
    fn test_merge_no_conflicts() {
        let (_dir, mut repo) = test_repo();

        let (base, _) = commit_file(&mut repo, "shared", b"base", "base");

        // branch a: add a file on top of base, head moves forward
        let a_entry = file_entry(&mut repo, b"a");
        let mut a_flat = repo.flatten_commit_tree(&base).unwrap();
        a_flat.insert("from_a".to_string(), a_entry);
        let a_tree = repo.materialize_flat_tree(&a_flat).unwrap();
        let a_head = repo
            .commit_from_tree(&a_tree, Commit::new(a_tree, "a"), "normal")
            .unwrap();

        // branch b: build directly on base without moving head
        let entry = file_entry(&mut repo, b"b");
        let mut flat = repo.flatten_commit_tree(&base).unwrap();
        flat.insert("from_b".to_string(), entry);
        let b_tree = repo.materialize_flat_tree(&flat).unwrap();
        let mut b_commit = Commit::new(b_tree, "b");
        b_commit.set_parents(base, Hash::ZERO);
        let b_head = repo.add_commit(&b_commit).unwrap();
        repo.metadata
            .with_transaction(|tx| {
                tx.set_meta(b_head, "status", "normal");
                Ok(())
            })
            .unwrap();

        let result = repo.merge(&b_head).unwrap();
        assert!(result.conflicts.is_empty());
        assert!(repo.has_merge_state());

        // committing the merged tree consumes the merge state
        let merge_commit = repo
            .commit_from_tree(&result.tree, Commit::new(result.tree, "merge"), "normal")
            .unwrap();
        let stored = repo.get_commit(&merge_commit).unwrap();
        assert_eq!(stored.parent1, a_head);
        assert_eq!(stored.parent2, b_head);
        assert!(!repo.has_merge_state());

        // merged tree carries both sides
        let flat = repo.flatten_commit_tree(&merge_commit).unwrap();
        assert!(flat.contains_key("from_a"));
        assert!(flat.contains_key("from_b"));
        assert!(flat.contains_key("shared"));
    }

    #[test]
    fn test_merge_conflict_staged() {
        let (_dir, mut repo) = test_repo();

        let (base, _) = commit_file(&mut repo, "f", b"base", "base");
        let (_a_head, _) = commit_file(&mut repo, "f", b"ours", "a");

        // a competing commit from the same base
        let entry = file_entry(&mut repo, b"theirs");
        let mut flat = repo.flatten_commit_tree(&base).unwrap();
        flat.insert("f".to_string(), entry);
        let b_tree = repo.materialize_flat_tree(&flat).unwrap();
        let mut b_commit = Commit::new(b_tree, "b");
        b_commit.set_parents(base, Hash::ZERO);
        let b_head = repo.add_commit(&b_commit).unwrap();

        let result = repo.merge(&b_head).unwrap();
        assert_eq!(result.conflicts.len(), 1);

        let flat = {
            let tree = result.tree;
            let mut out = FlatTree::new();
            let t = repo.get_tree(&tree).unwrap();
            for (name, entry) in t.entries() {
                out.insert(name.clone(), entry.clone());
            }
            out
        };
        assert!(flat.contains_key("f"));
        assert!(flat.contains_key("f:conflict"));
        assert!(flat.contains_key("f:base"));
    }

    #[test]
    fn test_graft_imports_subtree() {
        let (_dir_a, mut src) = test_repo();
        let (_dir_b, mut dst) = test_repo();

        // source: dir/inner.txt
        let entry = file_entry(&mut src, b"grafted content");
        let mut inner = Tree::new();
        inner.insert("inner.txt", entry).unwrap();
        let inner_hash = src.add_tree(&inner).unwrap();
        let mut dir_entry = TreeEntry::new(EntryType::Tree, inner_hash);
        dir_entry.attrs = src.default_dir_attrs();
        let mut root = Tree::new();
        root.insert("dir", dir_entry).unwrap();
        let root_hash = src.add_tree(&root).unwrap();
        src.commit_from_tree(&root_hash, Commit::new(root_hash, "src"), "normal")
            .unwrap();

        // destination has its own history
        commit_file(&mut dst, "own.txt", b"own", "dst");

        let graft_commit = dst.graft(&mut src, "dir", "imported").unwrap();

        let stored = dst.get_commit(&graft_commit).unwrap();
        let graft = stored.graft.as_ref().unwrap();
        assert_eq!(graft.repo, src.uuid());
        assert_eq!(graft.path, "dir");
        assert_eq!(dst.commit_status(&graft_commit).as_deref(), Some("graft"));

        let flat = dst.flatten_commit_tree(&graft_commit).unwrap();
        assert!(flat.contains_key("imported/inner.txt"));
        assert!(dst
            .has_object(&crate::hash::hash_bytes(b"grafted content"))
            .unwrap());

        // graft status does not move head
        assert_ne!(dst.head().unwrap(), graft_commit);
    }
}
