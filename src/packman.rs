//! packfile manager
//!
//! owns the `objs/` directory: hands out packfile ids from a persistent
//! free-list, caches open packfile handles, and reclaims ids when a purge
//! empties a file. the last free-list entry is an open-ended tail; popping
//! it advances it.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::{IoResultExt, Result};
use crate::index::PackfileId;
use crate::lru::LruCache;
use crate::packfile::Packfile;
use crate::stream::{ReadExt, WriteExt};

const FREELIST_FILE: &str = ".freelist";
const HANDLE_CACHE_SIZE: usize = 96;

/// shared handle to an open packfile
pub type PackfileHandle = Arc<Mutex<Packfile>>;

pub struct PackfileManager {
    root: PathBuf,
    free_list: VecDeque<PackfileId>,
    cache: LruCache<PackfileId, PackfileHandle>,
}

impl PackfileManager {
    /// open the manager over a packfile directory
    pub fn open(root: &Path) -> Result<Self> {
        let mut mgr = Self {
            root: root.to_path_buf(),
            free_list: VecDeque::new(),
            cache: LruCache::new(HANDLE_CACHE_SIZE),
        };

        if !mgr.load_free_list()? {
            warn!(root = %root.display(), "free-list missing or corrupt, rebuilding");
            mgr.recompute_free_list()?;
            mgr.write_free_list()?;
        }

        Ok(mgr)
    }

    fn packfile_path(&self, id: PackfileId) -> PathBuf {
        self.root.join(format!("pack{}.pak", id))
    }

    pub fn has_packfile(&self, id: PackfileId) -> bool {
        self.packfile_path(id).exists()
    }

    /// every packfile id present on disk
    pub fn list(&self) -> Result<Vec<PackfileId>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root).with_path(&self.root)? {
            let entry = entry.with_path(&self.root)?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name
                .strip_prefix("pack")
                .and_then(|s| s.strip_suffix(".pak"))
                .and_then(|s| s.parse::<PackfileId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// fetch an open handle, going through the LRU cache
    pub fn get_packfile(&mut self, id: PackfileId) -> Result<PackfileHandle> {
        if let Some(handle) = self.cache.get(&id) {
            return Ok(handle.clone());
        }

        let pf = Packfile::open(&self.packfile_path(id), id)?;
        let handle = Arc::new(Mutex::new(pf));
        self.cache.put(id, handle.clone());
        Ok(handle)
    }

    /// allocate the lowest free id and open a fresh packfile for it
    pub fn new_packfile(&mut self) -> Result<PackfileHandle> {
        debug_assert!(!self.free_list.is_empty());
        let id = if self.free_list.len() == 1 {
            let id = self.free_list[0];
            self.free_list[0] += 1;
            id
        } else {
            self.free_list.pop_front().expect("free list is never empty")
        };
        self.write_free_list()?;

        debug!(id, "allocating packfile");
        let pf = Packfile::open(&self.packfile_path(id), id)?;
        let handle = Arc::new(Mutex::new(pf));
        self.cache.put(id, handle.clone());
        Ok(handle)
    }

    /// delete an emptied packfile and return its id to the free-list
    pub fn reclaim(&mut self, id: PackfileId) -> Result<()> {
        self.cache.invalidate(&id);
        let path = self.packfile_path(id);
        if path.exists() {
            std::fs::remove_file(&path).with_path(&path)?;
        }

        let pos = self
            .free_list
            .iter()
            .position(|&f| f > id)
            .unwrap_or(self.free_list.len());
        self.free_list.insert(pos, id);
        self.write_free_list()
    }

    /// persist the free-list now
    pub fn save(&self) -> Result<()> {
        self.write_free_list()
    }

    fn load_free_list(&mut self) -> Result<bool> {
        let path = self.root.join(FREELIST_FILE);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(_) => return Ok(false),
        };
        let mut reader = BufReader::new(file);

        let count = match reader.read_u32_le() {
            Ok(c) => c,
            Err(_) => return Ok(false),
        };

        let mut list = VecDeque::with_capacity(count as usize);
        for _ in 0..count {
            match reader.read_u32_le() {
                Ok(id) => list.push_back(id),
                Err(_) => return Ok(false),
            }
        }
        if list.is_empty() {
            return Ok(false);
        }

        self.free_list = list;
        Ok(true)
    }

    fn recompute_free_list(&mut self) -> Result<()> {
        let existing = self.list()?;
        self.free_list.clear();

        if let Some(&last) = existing.last() {
            let mut curr = 0;
            for &used in &existing {
                while curr < used {
                    self.free_list.push_back(curr);
                    curr += 1;
                }
                curr = used + 1;
            }
            self.free_list.push_back(last + 1);
        } else {
            self.free_list.push_back(0);
        }

        Ok(())
    }

    fn write_free_list(&self) -> Result<()> {
        let path = self.root.join(FREELIST_FILE);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_path(&path)?;

        let mut buf = Vec::with_capacity(4 + self.free_list.len() * 4);
        buf.write_u32_le(self.free_list.len() as u32).expect("vec write");
        for &id in &self.free_list {
            buf.write_u32_le(id).expect("vec write");
        }
        file.write_all(&buf).with_path(&path)?;
        Ok(())
    }
}
