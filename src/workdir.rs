//! in-memory working-directory overlay
//!
//! the mount layer's view of the tree: an inode table over the committed
//! tree, copy-on-write temp files for writes, and a change accumulator that
//! is folded into a new commit on snapshot. reads of committed data go
//! straight to the object store; `.snapshot/<name>/...` paths resolve
//! against a named snapshot without touching the overlay.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::repo::Repo;
use crate::treediff::{split_path, FlatTree};
use crate::types::tree::{
    ATTR_CTIME, ATTR_FILESIZE, ATTR_GROUPNAME, ATTR_MTIME, ATTR_PERMS, ATTR_SYMLINK,
    ATTR_USERNAME,
};
use crate::types::{Commit, EntryType, TreeEntry};

/// where a file's current content lives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    /// placeholder with no backing yet
    Null,
    /// content is a committed object
    Committed,
    /// content is a copy-on-write temp file
    Dirty,
    /// content is only available through the remote fallback
    Remote,
}

/// one overlay inode
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub kind: FileKind,
    pub inode: u64,
    pub is_dir: bool,
    pub is_symlink: bool,
    /// object hash when committed (blob or large-blob manifest)
    pub hash: Hash,
    /// whole-file hash for large blobs
    pub large_hash: Hash,
    pub size: u64,
    pub perms: u32,
    pub username: String,
    pub groupname: String,
    pub mtime: u64,
    pub ctime: u64,
    /// backing temp file while dirty
    pub temp_path: Option<PathBuf>,
    pub open_count: u32,
}

impl FileInfo {
    fn to_tree_entry(&self) -> TreeEntry {
        let kind = if self.is_dir {
            EntryType::Tree
        } else if self.is_symlink {
            EntryType::Symlink
        } else if !self.large_hash.is_zero() {
            EntryType::LargeBlob
        } else {
            EntryType::Blob
        };
        let mut entry = TreeEntry::new(kind, self.hash)
            .with_attr(ATTR_PERMS, format!("{:o}", self.perms))
            .with_attr(ATTR_USERNAME, self.username.clone())
            .with_attr(ATTR_GROUPNAME, self.groupname.clone())
            .with_attr(ATTR_FILESIZE, self.size.to_string())
            .with_attr(ATTR_MTIME, self.mtime.to_string())
            .with_attr(ATTR_CTIME, self.ctime.to_string());
        if self.is_symlink {
            entry = entry.with_attr(ATTR_SYMLINK, "true");
        }
        if !self.large_hash.is_zero() {
            entry = entry.with_large_hash(self.large_hash);
        }
        entry
    }

    fn from_tree_entry(entry: &TreeEntry, inode: u64) -> Self {
        let attr_num = |key: &str| -> u64 {
            entry
                .attr(key)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };
        Self {
            kind: FileKind::Committed,
            inode,
            is_dir: entry.kind == EntryType::Tree,
            is_symlink: entry.kind == EntryType::Symlink,
            hash: entry.hash,
            large_hash: entry.large_hash,
            size: attr_num(ATTR_FILESIZE),
            perms: entry
                .attr(ATTR_PERMS)
                .and_then(|v| u32::from_str_radix(v, 8).ok())
                .unwrap_or(0o644),
            username: entry.attr(ATTR_USERNAME).unwrap_or("unknown").to_string(),
            groupname: entry.attr(ATTR_GROUPNAME).unwrap_or("unknown").to_string(),
            mtime: attr_num(ATTR_MTIME),
            ctime: attr_num(ATTR_CTIME),
            temp_path: None,
            open_count: 0,
        }
    }
}

/// a materialized directory: child name -> inode
#[derive(Debug, Default)]
struct Dir {
    entries: BTreeMap<String, u64>,
}

/// accumulated overlay edits, merged per path
#[derive(Clone, Debug, PartialEq, Eq)]
enum OverlayChange {
    Created,
    Modified,
    Deleted,
}

/// the overlay
pub struct Workdir {
    repo: Repo,
    paths: HashMap<String, FileInfo>,
    dirs: HashMap<u64, Dir>,
    handles: HashMap<u64, String>,
    changes: BTreeMap<String, OverlayChange>,
    next_inode: u64,
    next_handle: u64,
    root_loaded: bool,
}

impl Workdir {
    pub fn new(repo: Repo) -> Self {
        Self {
            repo,
            paths: HashMap::new(),
            dirs: HashMap::new(),
            handles: HashMap::new(),
            changes: BTreeMap::new(),
            next_inode: 1,
            next_handle: 1,
            root_loaded: false,
        }
    }

    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    pub fn repo_mut(&mut self) -> &mut Repo {
        &mut self.repo
    }

    pub fn into_repo(self) -> Repo {
        self.repo
    }

    /// true when uncommitted edits exist
    pub fn is_dirty(&self) -> bool {
        !self.changes.is_empty()
    }

    fn alloc_inode(&mut self) -> u64 {
        let inode = self.next_inode;
        self.next_inode += 1;
        inode
    }

    /// populate the whole overlay from HEAD on first access
    fn ensure_loaded(&mut self) -> Result<()> {
        if self.root_loaded {
            return Ok(());
        }
        self.root_loaded = true;

        let root_inode = self.alloc_inode();
        self.dirs.insert(root_inode, Dir::default());

        let head = self.repo.head()?;
        if head.is_zero() {
            return Ok(());
        }

        let flat = self.repo.flatten_commit_tree(&head)?;
        for (path, entry) in &flat {
            let inode = self.alloc_inode();
            let info = FileInfo::from_tree_entry(entry, inode);
            if info.is_dir {
                self.dirs.insert(inode, Dir::default());
            }
            let (dir_path, name) = split_path(path);
            let parent = self.dir_inode(dir_path)?;
            self.dirs
                .get_mut(&parent)
                .expect("parent dir materialized")
                .entries
                .insert(name.to_string(), inode);
            self.paths.insert(path.clone(), info);
        }
        Ok(())
    }

    fn dir_inode(&self, path: &str) -> Result<u64> {
        if path.is_empty() {
            return Ok(1);
        }
        self.paths
            .get(path)
            .filter(|i| i.is_dir)
            .map(|i| i.inode)
            .ok_or_else(|| Error::PathNotFound(path.to_string()))
    }

    /// stat one path
    pub fn getattr(&mut self, path: &str) -> Result<FileInfo> {
        self.ensure_loaded()?;
        self.paths
            .get(path)
            .cloned()
            .ok_or_else(|| Error::PathNotFound(path.to_string()))
    }

    /// list a directory's names
    pub fn list_dir(&mut self, path: &str) -> Result<Vec<String>> {
        self.ensure_loaded()?;
        let inode = self.dir_inode(path)?;
        Ok(self
            .dirs
            .get(&inode)
            .map(|d| d.entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// read file content at an offset
    pub fn read(&mut self, path: &str, offset: u64, size: usize) -> Result<Vec<u8>> {
        self.ensure_loaded()?;
        let info = self
            .paths
            .get(path)
            .ok_or_else(|| Error::PathNotFound(path.to_string()))?
            .clone();
        if info.is_dir {
            return Err(Error::Unsupported(format!("{} is a directory", path)));
        }

        match info.kind {
            FileKind::Dirty => {
                let temp = info
                    .temp_path
                    .as_ref()
                    .expect("dirty file has a temp path");
                let mut file = File::open(temp).with_path(temp)?;
                file.seek(SeekFrom::Start(offset)).with_path(temp)?;
                let mut buf = vec![0u8; size];
                let mut filled = 0;
                while filled < size {
                    let n = file.read(&mut buf[filled..]).with_path(temp)?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                Ok(buf)
            }
            FileKind::Committed | FileKind::Remote => {
                if info.large_hash.is_zero() {
                    let payload = self.repo.get_payload(&info.hash)?;
                    Ok(slice_at(&payload, offset, size))
                } else {
                    self.read_largeblob(&info.hash, offset, size)
                }
            }
            FileKind::Null => Ok(Vec::new()),
        }
    }

    /// read from a chunked file by locating the parts covering the range
    fn read_largeblob(&mut self, manifest_hash: &Hash, offset: u64, size: usize) -> Result<Vec<u8>> {
        let manifest = self.repo.get_largeblob(manifest_hash)?;
        let mut out = Vec::with_capacity(size);
        let mut pos = offset;

        while out.len() < size {
            let (ix, part_off) = match manifest.part_at(pos) {
                Some(found) => found,
                None => break,
            };
            let part = manifest.parts()[ix];
            let payload = self.repo.get_payload(&part.hash)?;
            let want = size - out.len();
            out.extend_from_slice(&slice_at(&payload, part_off, want));
            pos = offset + out.len() as u64;
        }
        Ok(out)
    }

    /// create an empty regular file
    pub fn create(&mut self, path: &str, perms: u32) -> Result<u64> {
        self.ensure_loaded()?;
        if self.paths.contains_key(path) {
            return Err(Error::Unsupported(format!("{} already exists", path)));
        }
        let (dir_path, name) = split_path(path);
        let parent = self.dir_inode(dir_path)?;

        let temp = self.repo.tmp_path().join(uuid::Uuid::new_v4().to_string());
        File::create(&temp).with_path(&temp)?;

        let inode = self.alloc_inode();
        let stamp = now();
        let info = FileInfo {
            kind: FileKind::Dirty,
            inode,
            is_dir: false,
            is_symlink: false,
            hash: Hash::ZERO,
            large_hash: Hash::ZERO,
            size: 0,
            perms,
            username: crate::repo::commit::current_username(),
            groupname: crate::repo::commit::current_groupname(),
            mtime: stamp,
            ctime: stamp,
            temp_path: Some(temp),
            open_count: 0,
        };

        let dir = self.dirs.get_mut(&parent).expect("parent dir materialized");
        dir.entries.insert(name.to_string(), inode);
        self.paths.insert(path.to_string(), info);
        self.record_change(path, OverlayChange::Created);
        Ok(inode)
    }

    pub fn mkdir(&mut self, path: &str, perms: u32) -> Result<u64> {
        self.ensure_loaded()?;
        if self.paths.contains_key(path) {
            return Err(Error::Unsupported(format!("{} already exists", path)));
        }
        let (dir_path, name) = split_path(path);
        let parent = self.dir_inode(dir_path)?;

        let inode = self.alloc_inode();
        let stamp = now();
        let info = FileInfo {
            kind: FileKind::Dirty,
            inode,
            is_dir: true,
            is_symlink: false,
            hash: Hash::ZERO,
            large_hash: Hash::ZERO,
            size: 0,
            perms,
            username: crate::repo::commit::current_username(),
            groupname: crate::repo::commit::current_groupname(),
            mtime: stamp,
            ctime: stamp,
            temp_path: None,
            open_count: 0,
        };

        self.dirs.insert(inode, Dir::default());
        let dir = self.dirs.get_mut(&parent).expect("parent dir materialized");
        dir.entries.insert(name.to_string(), inode);
        self.paths.insert(path.to_string(), info);
        self.record_change(path, OverlayChange::Created);
        Ok(inode)
    }

    /// open a file for writing, materializing a copy-on-write temp file
    pub fn open_write(&mut self, path: &str) -> Result<u64> {
        self.ensure_loaded()?;
        let info = self
            .paths
            .get(path)
            .ok_or_else(|| Error::PathNotFound(path.to_string()))?
            .clone();
        if info.is_dir {
            return Err(Error::Unsupported(format!("{} is a directory", path)));
        }

        if info.kind != FileKind::Dirty {
            // first write: copy the committed content out
            let temp = self.repo.tmp_path().join(uuid::Uuid::new_v4().to_string());
            if info.hash.is_zero() {
                File::create(&temp).with_path(&temp)?;
            } else {
                self.repo.copy_object_to(&info.hash, &temp)?;
            }
            let entry = self.paths.get_mut(path).expect("checked above");
            entry.kind = FileKind::Dirty;
            entry.temp_path = Some(temp);
            entry.large_hash = Hash::ZERO;
            self.record_change(path, OverlayChange::Modified);
        }

        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, path.to_string());
        self.paths
            .get_mut(path)
            .expect("checked above")
            .open_count += 1;
        Ok(handle)
    }

    /// write through an open handle
    pub fn write(&mut self, handle: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let path = self
            .handles
            .get(&handle)
            .ok_or_else(|| Error::Unsupported(format!("unknown handle {}", handle)))?
            .clone();
        let info = self.paths.get_mut(&path).expect("handle path exists");
        let temp = info
            .temp_path
            .clone()
            .expect("open handle implies a temp file");

        let mut file = OpenOptions::new().write(true).open(&temp).with_path(&temp)?;
        file.seek(SeekFrom::Start(offset)).with_path(&temp)?;
        file.write_all(data).with_path(&temp)?;
        file.sync_data().with_path(&temp)?;

        let end = offset + data.len() as u64;
        if end > info.size {
            info.size = end;
        }
        info.mtime = now();
        Ok(data.len())
    }

    /// release an open handle
    pub fn close(&mut self, handle: u64) -> Result<()> {
        let path = self
            .handles
            .remove(&handle)
            .ok_or_else(|| Error::Unsupported(format!("unknown handle {}", handle)))?;
        if let Some(info) = self.paths.get_mut(&path) {
            info.open_count = info.open_count.saturating_sub(1);
        }
        Ok(())
    }

    pub fn unlink(&mut self, path: &str) -> Result<()> {
        self.ensure_loaded()?;
        let info = self
            .paths
            .get(path)
            .ok_or_else(|| Error::PathNotFound(path.to_string()))?;
        if info.is_dir {
            let inode = info.inode;
            if self.dirs.get(&inode).map(|d| !d.entries.is_empty()) == Some(true) {
                return Err(Error::Unsupported(format!("{} is not empty", path)));
            }
            self.dirs.remove(&inode);
        }
        if let Some(temp) = self.paths.get(path).and_then(|i| i.temp_path.clone()) {
            let _ = std::fs::remove_file(temp);
        }

        let (dir_path, name) = split_path(path);
        let parent = self.dir_inode(dir_path)?;
        self.dirs
            .get_mut(&parent)
            .expect("parent dir materialized")
            .entries
            .remove(name);
        self.paths.remove(path);
        self.record_change(path, OverlayChange::Deleted);
        Ok(())
    }

    /// rename a file (directory renames move the whole subtree map)
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.ensure_loaded()?;
        let info = self
            .paths
            .remove(from)
            .ok_or_else(|| Error::PathNotFound(from.to_string()))?;
        if info.is_dir {
            // move children under the new prefix
            let prefix = format!("{}/", from);
            let moved: Vec<String> = self
                .paths
                .keys()
                .filter(|p| p.starts_with(&prefix))
                .cloned()
                .collect();
            for old in moved {
                let new = format!("{}{}", to, &old[from.len()..]);
                let child = self.paths.remove(&old).expect("listed above");
                self.record_change(&old, OverlayChange::Deleted);
                self.record_change(&new, OverlayChange::Created);
                self.paths.insert(new, child);
            }
        }

        let (from_dir, from_name) = split_path(from);
        let from_parent = self.dir_inode(from_dir)?;
        let inode = info.inode;
        self.dirs
            .get_mut(&from_parent)
            .expect("parent dir materialized")
            .entries
            .remove(from_name);

        self.paths.insert(to.to_string(), info);
        let (to_dir, to_name) = split_path(to);
        let to_parent = self.dir_inode(to_dir)?;
        self.dirs
            .get_mut(&to_parent)
            .expect("parent dir materialized")
            .entries
            .insert(to_name.to_string(), inode);

        self.record_change(from, OverlayChange::Deleted);
        self.record_change(to, OverlayChange::Created);
        Ok(())
    }

    /// fold overlapping edits into one change per path
    fn record_change(&mut self, path: &str, change: OverlayChange) {
        use OverlayChange::*;
        let merged = match (self.changes.get(path), &change) {
            (Some(Created), Deleted) => None,
            (Some(Created), Modified) => Some(Created),
            (Some(Modified), Deleted) => Some(Deleted),
            (Some(Deleted), Created) => Some(Modified),
            _ => Some(change),
        };
        match merged {
            Some(c) => {
                self.changes.insert(path.to_string(), c);
            }
            None => {
                self.changes.remove(path);
            }
        }
    }

    /// materialize every dirty file, synthesize the changed trees, and
    /// commit the result
    ///
    /// unchanged subtrees deduplicate to their existing objects, so only the
    /// changed spine of the tree costs new storage.
    pub fn snapshot(&mut self, message: &str, status: &str) -> Result<Hash> {
        self.ensure_loaded()?;

        let head = self.repo.head()?;
        let mut flat: FlatTree = self.repo.flatten_commit_tree(&head)?;

        let changes: Vec<(String, OverlayChange)> = self
            .changes
            .iter()
            .map(|(p, c)| (p.clone(), c.clone()))
            .collect();
        for (path, change) in &changes {
            match change {
                OverlayChange::Deleted => {
                    flat.remove(path);
                    // drop anything beneath a deleted directory
                    let prefix = format!("{}/", path);
                    flat.retain(|p, _| !p.starts_with(&prefix));
                }
                OverlayChange::Created | OverlayChange::Modified => {
                    let mut info = self
                        .paths
                        .get(path)
                        .cloned()
                        .ok_or_else(|| Error::PathNotFound(path.clone()))?;
                    if !info.is_dir {
                        if let Some(temp) = &info.temp_path {
                            let (primary, large) = self.repo.add_file(temp)?;
                            info.hash = primary;
                            info.large_hash = large;
                            info.size = std::fs::metadata(temp).with_path(temp)?.len();
                        }
                    }
                    flat.insert(path.clone(), info.to_tree_entry());
                    // keep the in-memory entry in sync for post-snapshot reads
                    if let Some(live) = self.paths.get_mut(path) {
                        live.hash = info.hash;
                        live.large_hash = info.large_hash;
                        live.size = info.size;
                    }
                }
            }
        }

        let tree = self.repo.materialize_flat_tree(&flat)?;
        let commit_hash = self
            .repo
            .commit_from_tree(&tree, Commit::new(tree, message), status)?;
        debug!(commit = %commit_hash, "snapshot committed");

        // flip dirty files to committed and drop closed temp files
        for (path, change) in changes {
            if matches!(change, OverlayChange::Deleted) {
                continue;
            }
            if let Some(info) = self.paths.get_mut(&path) {
                info.kind = FileKind::Committed;
                if info.open_count == 0 {
                    if let Some(temp) = info.temp_path.take() {
                        let _ = std::fs::remove_file(temp);
                    }
                }
            }
        }
        self.changes.clear();

        Ok(commit_hash)
    }

    /// read inside the virtual `.snapshot/` namespace
    ///
    /// `path` is `<snapshot-name>/rest/of/path`; resolution goes against the
    /// named commit's tree and never touches the overlay.
    pub fn read_snapshot_path(&mut self, path: &str) -> Result<Vec<u8>> {
        let (name, rest) = match path.split_once('/') {
            Some(parts) => parts,
            None => return Err(Error::PathNotFound(path.to_string())),
        };
        let commit_hash = self.repo.lookup_snapshot(name)?;
        let commit = self.repo.get_commit(&commit_hash)?;
        let entry = self.repo.lookup(&commit, rest)?;

        match entry.kind {
            EntryType::Blob | EntryType::Symlink => self.repo.get_payload(&entry.hash),
            EntryType::LargeBlob => {
                let manifest = self.repo.get_largeblob(&entry.hash)?;
                let size = manifest.total_size() as usize;
                self.read_largeblob(&entry.hash, 0, size)
            }
            EntryType::Tree => Err(Error::Unsupported(format!("{} is a directory", path))),
        }
    }

    /// names visible under `.snapshot/`
    pub fn list_snapshots(&self) -> Vec<String> {
        self.repo.list_snapshots().keys().cloned().collect()
    }
}

fn slice_at(payload: &[u8], offset: u64, size: usize) -> Vec<u8> {
    let start = (offset as usize).min(payload.len());
    let end = (start + size).min(payload.len());
    payload[start..end].to_vec()
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_workdir() -> (tempfile::TempDir, Workdir) {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo"), false).unwrap();
        (dir, Workdir::new(repo))
    }

    fn write_file(wd: &mut Workdir, path: &str, content: &[u8]) {
        wd.create(path, 0o644).unwrap();
        let fh = wd.open_write(path).unwrap();
        wd.write(fh, 0, content).unwrap();
        wd.close(fh).unwrap();
    }

    #[test]
    fn test_create_write_read() {
        let (_dir, mut wd) = test_workdir();

        write_file(&mut wd, "a.txt", b"hello overlay");
        assert_eq!(wd.read("a.txt", 0, 64).unwrap(), b"hello overlay");
        assert_eq!(wd.read("a.txt", 6, 7).unwrap(), b"overlay");

        let info = wd.getattr("a.txt").unwrap();
        assert_eq!(info.kind, FileKind::Dirty);
        assert_eq!(info.size, 13);
    }

    #[test]
    fn test_snapshot_single_file() {
        let (_dir, mut wd) = test_workdir();

        write_file(&mut wd, "a.txt", b"hello\n");
        let commit_hash = wd.snapshot("first snapshot", "normal").unwrap();

        // head moved, content committed, file no longer dirty
        assert_eq!(wd.repo().head().unwrap(), commit_hash);
        let info = wd.getattr("a.txt").unwrap();
        assert_eq!(info.kind, FileKind::Committed);
        assert_eq!(info.hash, crate::hash::hash_bytes(b"hello\n"));
        assert!(!wd.is_dirty());

        // reads now come from the object store
        assert_eq!(wd.read("a.txt", 0, 64).unwrap(), b"hello\n");
    }

    #[test]
    fn test_overlay_loads_committed_tree() {
        let dir = tempdir().unwrap();
        let repo_root = dir.path().join("repo");

        let commit_hash;
        {
            let repo = Repo::init(&repo_root, false).unwrap();
            let mut wd = Workdir::new(repo);
            wd.mkdir("docs", 0o755).unwrap();
            write_file(&mut wd, "docs/readme.md", b"# readme");
            commit_hash = wd.snapshot("docs", "normal").unwrap();
        }

        // a fresh overlay over the same repo sees the committed tree
        let repo = Repo::open(&repo_root).unwrap();
        let mut wd = Workdir::new(repo);
        assert_eq!(wd.repo().head().unwrap(), commit_hash);
        assert_eq!(wd.list_dir("").unwrap(), vec!["docs".to_string()]);
        assert_eq!(wd.list_dir("docs").unwrap(), vec!["readme.md".to_string()]);
        assert_eq!(wd.read("docs/readme.md", 0, 64).unwrap(), b"# readme");
    }

    #[test]
    fn test_copy_on_write() {
        let (_dir, mut wd) = test_workdir();

        write_file(&mut wd, "f", b"version one");
        wd.snapshot("v1", "normal").unwrap();
        let v1_head = wd.repo().head().unwrap();

        // modify through a fresh handle: committed content copied out first
        let fh = wd.open_write("f").unwrap();
        wd.write(fh, 8, b"two").unwrap();
        wd.close(fh).unwrap();

        assert_eq!(wd.read("f", 0, 64).unwrap(), b"version two");
        let v2 = wd.snapshot("v2", "normal").unwrap();
        assert_ne!(v2, v1_head);

        // v1 content still reachable through its commit
        let v1_commit = wd.repo_mut().get_commit(&v1_head).unwrap();
        let entry = wd.repo_mut().lookup(&v1_commit, "f").unwrap();
        assert_eq!(entry.hash, crate::hash::hash_bytes(b"version one"));
    }

    #[test]
    fn test_unlink_and_snapshot() {
        let (_dir, mut wd) = test_workdir();

        write_file(&mut wd, "keep", b"keep");
        write_file(&mut wd, "drop", b"drop");
        wd.snapshot("both", "normal").unwrap();

        wd.unlink("drop").unwrap();
        assert!(matches!(
            wd.read("drop", 0, 4),
            Err(Error::PathNotFound(_))
        ));

        let head = wd.snapshot("dropped", "normal").unwrap();
        let flat = wd.repo_mut().flatten_commit_tree(&head).unwrap();
        assert!(flat.contains_key("keep"));
        assert!(!flat.contains_key("drop"));
    }

    #[test]
    fn test_create_then_delete_cancels() {
        let (_dir, mut wd) = test_workdir();

        write_file(&mut wd, "fleeting", b"gone soon");
        wd.unlink("fleeting").unwrap();
        assert!(!wd.is_dirty());
    }

    #[test]
    fn test_rename_moves_entry() {
        let (_dir, mut wd) = test_workdir();

        write_file(&mut wd, "old_name", b"payload");
        wd.rename("old_name", "new_name").unwrap();

        assert!(wd.getattr("old_name").is_err());
        assert_eq!(wd.read("new_name", 0, 64).unwrap(), b"payload");

        let head = wd.snapshot("renamed", "normal").unwrap();
        let flat = wd.repo_mut().flatten_commit_tree(&head).unwrap();
        assert!(flat.contains_key("new_name"));
        assert!(!flat.contains_key("old_name"));
    }

    #[test]
    fn test_unchanged_subtrees_reuse_objects() {
        let (_dir, mut wd) = test_workdir();

        wd.mkdir("stable", 0o755).unwrap();
        write_file(&mut wd, "stable/data", b"unchanging");
        write_file(&mut wd, "volatile", b"v1");
        let c1 = wd.snapshot("c1", "normal").unwrap();

        let fh = wd.open_write("volatile").unwrap();
        wd.write(fh, 0, b"v2").unwrap();
        wd.close(fh).unwrap();
        let c2 = wd.snapshot("c2", "normal").unwrap();

        // the stable subtree hash is identical across both commits
        let f1 = wd.repo_mut().flatten_commit_tree(&c1).unwrap();
        let f2 = wd.repo_mut().flatten_commit_tree(&c2).unwrap();
        assert_eq!(f1.get("stable").unwrap().hash, f2.get("stable").unwrap().hash);
        assert_ne!(f1.get("volatile").unwrap().hash, f2.get("volatile").unwrap().hash);
    }

    #[test]
    fn test_snapshot_namespace() {
        let (_dir, mut wd) = test_workdir();

        write_file(&mut wd, "report.txt", b"quarterly numbers");
        let commit_hash = wd.snapshot("q1", "normal").unwrap();
        wd.repo_mut().add_snapshot("q1", &commit_hash).unwrap();

        // overwrite after the snapshot
        let fh = wd.open_write("report.txt").unwrap();
        wd.write(fh, 0, b"DIFFERENT CONTENT").unwrap();
        wd.close(fh).unwrap();
        wd.snapshot("q2", "normal").unwrap();

        assert_eq!(wd.list_snapshots(), vec!["q1".to_string()]);
        // the snapshot view still serves the old bytes
        assert_eq!(
            wd.read_snapshot_path("q1/report.txt").unwrap(),
            b"quarterly numbers"
        );
    }

    #[test]
    fn test_fuse_status_snapshot() {
        let (_dir, mut wd) = test_workdir();

        write_file(&mut wd, "auto", b"autosaved");
        let head_before = wd.repo().head().unwrap();
        let commit_hash = wd.snapshot("autosnapshot", "fuse").unwrap();

        // fuse snapshots do not move head until promoted
        assert_eq!(wd.repo().head().unwrap(), head_before);
        assert_eq!(
            wd.repo().commit_status(&commit_hash).as_deref(),
            Some("fuse")
        );
    }

    #[test]
    fn test_large_file_reads() {
        use rand::{RngCore, SeedableRng};
        let (_dir, mut wd) = test_workdir();

        let mut rng = rand::rngs::StdRng::seed_from_u64(31);
        let mut data = vec![0u8; 2 * 1024 * 1024];
        rng.fill_bytes(&mut data);

        wd.create("big.bin", 0o644).unwrap();
        let fh = wd.open_write("big.bin").unwrap();
        wd.write(fh, 0, &data).unwrap();
        wd.close(fh).unwrap();
        wd.snapshot("big", "normal").unwrap();

        let info = wd.getattr("big.bin").unwrap();
        assert!(!info.large_hash.is_zero());

        // ranged reads across part boundaries match the source
        for (offset, size) in [(0u64, 1000usize), (8000, 10_000), (1_500_000, 4096)] {
            let got = wd.read("big.bin", offset, size).unwrap();
            assert_eq!(got, &data[offset as usize..offset as usize + size]);
        }
        // read past the end is clamped
        let tail = wd.read("big.bin", data.len() as u64 - 10, 100).unwrap();
        assert_eq!(tail.len(), 10);
    }
}
