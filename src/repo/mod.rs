//! the local repository engine
//!
//! owns the on-disk layout and orchestrates the index, metadata log,
//! snapshot index, and packfile manager. layout under `<root>/.silo/`
//! (or the root itself for a bare repository):
//!
//! ```text
//! version           ASCII "SILO1.0"
//! id                uuid, one line
//! config            tuneables (toml)
//! index             log of index records
//! snapshots         log of (name, commit) records
//! metadata          refcount/metadata log
//! HEAD              "@<branch>" or "#<hex-commit>"
//! refs/heads/<b>    hex commit id per branch
//! refs/remotes/<n>  peer record (toml)
//! objs/             packfiles + .freelist
//! tmp/              scratch, wiped on open
//! trusted/          public keys of accepted signers
//! mergestate        pending two-parent commit, when present
//! lock              symlink to the owning pid
//! ```

pub(crate) mod commit;
mod objects;
mod pull;

pub use commit::MergeResult;
pub use pull::PullStats;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::index::Index;
use crate::merge::MergeState;
use crate::metalog::MetadataLog;
use crate::packfile::PfTransaction;
use crate::packman::{PackfileHandle, PackfileManager};
use crate::remote::Remote;
use crate::snapshots::SnapshotIndex;

/// repository directory name inside a working tree
pub const SILO_DIR: &str = ".silo";
/// on-disk format version; other values are rejected
pub const VERSION_STR: &str = "SILO1.0";
/// branch created by init
pub const DEFAULT_BRANCH: &str = "default";

/// a configured peer, stored under `refs/remotes/<name>`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub url: String,
    /// uuid of the remote repository, learned on first contact
    #[serde(default)]
    pub repo_id: String,
    /// when set, the peer backs this repository's missing objects
    #[serde(default)]
    pub insta_clone: bool,
}

/// the local repository
pub struct Repo {
    silo_dir: PathBuf,
    id: String,
    config: StoreConfig,
    pub(crate) index: Index,
    pub(crate) snapshots: SnapshotIndex,
    pub(crate) metadata: MetadataLog,
    pub(crate) packfiles: PackfileManager,
    pub(crate) cur_pack: Option<PackfileHandle>,
    pub(crate) cur_txn: Option<PfTransaction>,
    pub(crate) purged: HashSet<Hash>,
    peers: BTreeMap<String, Peer>,
    pub(crate) remote: Option<Box<dyn Remote>>,
    pub(crate) cache_remote_objects: bool,
    pub(crate) interrupt: Arc<AtomicBool>,
}

impl Repo {
    /// create the directory layout for a new repository
    pub fn init(root: &Path, bare: bool) -> Result<Self> {
        let silo_dir = if bare {
            root.to_path_buf()
        } else {
            root.join(SILO_DIR)
        };
        if silo_dir.join("version").exists() {
            return Err(Error::RepoExists(root.to_path_buf()));
        }

        for sub in ["", "objs", "tmp", "trusted", "refs/heads", "refs/remotes"] {
            let dir = silo_dir.join(sub);
            std::fs::create_dir_all(&dir).with_path(&dir)?;
        }

        let id = uuid::Uuid::new_v4().to_string();
        write_file(&silo_dir.join("id"), id.as_bytes())?;
        write_file(&silo_dir.join("version"), VERSION_STR.as_bytes())?;
        write_file(&silo_dir.join("HEAD"), format!("@{}", DEFAULT_BRANCH).as_bytes())?;
        write_file(
            &silo_dir.join("refs/heads").join(DEFAULT_BRANCH),
            Hash::ZERO.to_hex().as_bytes(),
        )?;

        let config = StoreConfig::default();
        config.save(&silo_dir.join("config"))?;

        Self::open(root)
    }

    /// open an existing repository at `root` (or `root/.silo`)
    pub fn open(root: &Path) -> Result<Self> {
        let nested = root.join(SILO_DIR);
        let silo_dir = if nested.join("version").exists() {
            nested
        } else if root.join("version").exists() {
            root.to_path_buf()
        } else {
            return Err(Error::NoRepo(root.to_path_buf()));
        };

        let version = read_trimmed(&silo_dir.join("version"))?;
        if version != VERSION_STR {
            return Err(Error::VersionMismatch {
                found: version,
                expected: VERSION_STR.to_string(),
            });
        }
        let id = read_trimmed(&silo_dir.join("id"))?;

        let config = StoreConfig::load(&silo_dir.join("config"))?;
        config.validate()?;

        // leftover scratch files mean a previous process died uncleanly
        let tmp_dir = silo_dir.join("tmp");
        if let Ok(entries) = std::fs::read_dir(&tmp_dir) {
            let stale: Vec<_> = entries.flatten().collect();
            if !stale.is_empty() {
                warn!(
                    count = stale.len(),
                    "removing stale temp files; uncommitted data may have been lost"
                );
                for entry in stale {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }

        let index_path = silo_dir.join("index");
        let index_missing = !index_path.exists();
        let (index, needs_rebuild) = match Index::open(&index_path) {
            Ok(index) => (index, index_missing),
            Err(Error::Corrupt(reason)) => {
                warn!(%reason, "index unreadable, rebuilding from packfiles");
                std::fs::remove_file(&index_path).with_path(&index_path)?;
                (Index::open(&index_path)?, true)
            }
            Err(e) => return Err(e),
        };

        let snapshots = SnapshotIndex::open(&silo_dir.join("snapshots"))?;
        let metadata = MetadataLog::open(&silo_dir.join("metadata"))?;
        let packfiles = PackfileManager::open(&silo_dir.join("objs"))?;

        let mut repo = Self {
            silo_dir,
            id,
            config,
            index,
            snapshots,
            metadata,
            packfiles,
            cur_pack: None,
            cur_txn: None,
            purged: HashSet::new(),
            peers: BTreeMap::new(),
            remote: None,
            cache_remote_objects: false,
            interrupt: Arc::new(AtomicBool::new(false)),
        };

        if needs_rebuild {
            repo.rebuild_index()?;
        }
        repo.load_peers()?;

        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        &self.silo_dir
    }

    pub fn uuid(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &str {
        VERSION_STR
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// flag checked between pull batches; setting it makes a running pull
    /// stop at the next batch boundary
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub fn tmp_path(&self) -> PathBuf {
        self.silo_dir.join("tmp")
    }

    pub(crate) fn scratch_file(&self) -> PathBuf {
        self.tmp_path().join(uuid::Uuid::new_v4().to_string())
    }

    fn mergestate_path(&self) -> PathBuf {
        self.silo_dir.join("mergestate")
    }

    /// acquire the process lock: a symlink whose target is our pid
    pub fn lock(&self) -> Result<RepoLock> {
        let lock_path = self.silo_dir.join("lock");
        let pid = std::process::id().to_string();

        match std::os::unix::fs::symlink(&pid, &lock_path) {
            Ok(()) => Ok(RepoLock { path: lock_path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let owner = std::fs::read_link(&lock_path)
                    .map(|t| t.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| "unknown".to_string());
                warn!(%owner, "repository already locked");
                Err(Error::Locked(owner))
            }
            Err(e) => Err(Error::Io {
                path: lock_path,
                source: e,
            }),
        }
    }

    /// flush pending state: open transaction, index, metadata, freelist
    pub fn sync(&mut self) -> Result<()> {
        self.commit_transaction()?;
        self.index.sync()?;
        self.metadata.sync()?;
        self.packfiles.save()?;
        Ok(())
    }

    pub(crate) fn commit_transaction(&mut self) -> Result<()> {
        if let Some(mut txn) = self.cur_txn.take() {
            if !txn.is_empty() {
                let pack = self
                    .packfiles
                    .get_packfile(txn.pack_id())?;
                let mut pack = pack.lock().expect("packfile lock poisoned");
                txn.commit(&mut pack, &mut self.index)?;
            }
        }
        Ok(())
    }

    /// rebuild the index by scanning every packfile
    ///
    /// guarantees index/packfile consistency after a corrupted index.
    pub fn rebuild_index(&mut self) -> Result<()> {
        debug!("rebuilding index from packfiles");
        self.index.clear()?;
        for id in self.packfiles.list()? {
            let pack = self.packfiles.get_packfile(id)?;
            let entries = pack.lock().expect("packfile lock poisoned").read_entries()?;
            self.index.update_entries(&entries)?;
        }
        self.index.sync()
    }

    // ------------------------------------------------------------------
    // head and branches

    /// name of the active branch, or `None` when HEAD is detached
    pub fn branch(&self) -> Result<Option<String>> {
        let head = read_trimmed(&self.silo_dir.join("HEAD"))?;
        Ok(head.strip_prefix('@').map(|b| b.to_string()))
    }

    /// switch HEAD to an existing branch
    pub fn set_branch(&mut self, name: &str) -> Result<()> {
        if !self.branch_path(name).exists() {
            return Err(Error::BranchNotFound(name.to_string()));
        }
        self.write_atomic(&self.silo_dir.join("HEAD"), format!("@{}", name).as_bytes())
    }

    /// create a branch pointing at a commit
    pub fn create_branch(&mut self, name: &str, commit: &Hash) -> Result<()> {
        self.write_atomic(&self.branch_path(name), commit.to_hex().as_bytes())
    }

    pub fn list_branches(&self) -> Result<Vec<String>> {
        let dir = self.silo_dir.join("refs/heads");
        let mut branches = Vec::new();
        for entry in std::fs::read_dir(&dir).with_path(&dir)? {
            let entry = entry.with_path(&dir)?;
            if entry.file_type().with_path(&dir)?.is_file() {
                branches.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        branches.sort();
        Ok(branches)
    }

    /// current head commit; the zero hash means an uninitialized branch
    pub fn head(&self) -> Result<Hash> {
        let head = read_trimmed(&self.silo_dir.join("HEAD"))?;
        if let Some(hex) = head.strip_prefix('#') {
            return Hash::from_hex(hex);
        }
        let branch = head.strip_prefix('@').unwrap_or(&head);
        let path = self.branch_path(branch);
        if !path.exists() {
            return Err(Error::BranchNotFound(branch.to_string()));
        }
        Hash::from_hex(read_trimmed(&path)?.as_str())
    }

    /// move the current head to a new commit
    ///
    /// this write is the linearization point for a commit: readers see the
    /// old tree or the new one, never a mix.
    pub fn update_head(&mut self, commit: &Hash) -> Result<()> {
        let head = read_trimmed(&self.silo_dir.join("HEAD"))?;
        if head.starts_with('#') {
            return self.write_atomic(
                &self.silo_dir.join("HEAD"),
                format!("#{}", commit.to_hex()).as_bytes(),
            );
        }
        let branch = head.strip_prefix('@').unwrap_or(&head).to_string();
        self.write_atomic(&self.branch_path(&branch), commit.to_hex().as_bytes())
    }

    fn branch_path(&self, name: &str) -> PathBuf {
        self.silo_dir.join("refs/heads").join(name)
    }

    // ------------------------------------------------------------------
    // merge state

    pub fn has_merge_state(&self) -> bool {
        self.mergestate_path().exists()
    }

    pub fn merge_state(&self) -> Result<Option<MergeState>> {
        MergeState::load(&self.mergestate_path())
    }

    pub fn set_merge_state(&mut self, state: &MergeState) -> Result<()> {
        state.save(&self.mergestate_path())
    }

    pub fn clear_merge_state(&mut self) -> Result<()> {
        MergeState::clear(&self.mergestate_path())
    }

    // ------------------------------------------------------------------
    // snapshots

    pub fn add_snapshot(&mut self, name: &str, commit: &Hash) -> Result<()> {
        self.snapshots.add(name, commit)
    }

    pub fn lookup_snapshot(&self, name: &str) -> Result<Hash> {
        self.snapshots
            .get(name)
            .copied()
            .ok_or_else(|| Error::SnapshotNotFound(name.to_string()))
    }

    pub fn list_snapshots(&self) -> BTreeMap<String, Hash> {
        self.snapshots.list().clone()
    }

    // ------------------------------------------------------------------
    // peers

    pub fn add_peer(&mut self, name: &str, peer: Peer) -> Result<()> {
        let path = self.silo_dir.join("refs/remotes").join(name);
        let content = toml::to_string_pretty(&peer)?;
        self.write_atomic(&path, content.as_bytes())?;
        self.peers.insert(name.to_string(), peer);
        Ok(())
    }

    pub fn remove_peer(&mut self, name: &str) -> Result<()> {
        let path = self.silo_dir.join("refs/remotes").join(name);
        if path.exists() {
            std::fs::remove_file(&path).with_path(&path)?;
        }
        self.peers.remove(name);
        Ok(())
    }

    pub fn peers(&self) -> &BTreeMap<String, Peer> {
        &self.peers
    }

    fn load_peers(&mut self) -> Result<()> {
        let dir = self.silo_dir.join("refs/remotes");
        for entry in std::fs::read_dir(&dir).with_path(&dir)? {
            let entry = entry.with_path(&dir)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let content = std::fs::read_to_string(entry.path()).with_path(entry.path())?;
            match toml::from_str::<Peer>(&content) {
                Ok(peer) => {
                    self.peers.insert(name, peer);
                }
                Err(e) => warn!(%name, error = %e, "skipping unreadable peer record"),
            }
        }
        Ok(())
    }

    /// attach a remote as the fallback object source (insta-clone)
    pub fn set_remote(&mut self, remote: Box<dyn Remote>, cache_locally: bool) {
        self.remote = Some(remote);
        self.cache_remote_objects = cache_locally;
    }

    pub fn clear_remote(&mut self) {
        self.remote = None;
        self.cache_remote_objects = false;
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    // ------------------------------------------------------------------

    pub(crate) fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        let tmp = self.scratch_file();
        write_file(&tmp, content)?;
        std::fs::rename(&tmp, path).with_path(path)?;
        Ok(())
    }
}

/// guard holding the repository symlink lock; unlinks on drop
pub struct RepoLock {
    path: PathBuf,
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn write_file(path: &Path, content: &[u8]) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::File::create(path).with_path(path)?;
    file.write_all(content).with_path(path)?;
    file.sync_all().with_path(path)?;
    Ok(())
}

fn read_trimmed(path: &Path) -> Result<String> {
    Ok(std::fs::read_to_string(path)
        .with_path(path)?
        .trim()
        .to_string())
}

/// seconds since the epoch
pub(crate) fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
