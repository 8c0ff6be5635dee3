//! directory trees
//!
//! a tree maps entry names to [`TreeEntry`] records. serialization iterates
//! in name order so identical logical trees always produce identical bytes,
//! and therefore identical hashes.

use std::collections::BTreeMap;
use std::io::Read;

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::stream::{ReadExt, WriteExt};

/// required attribute keys every entry carries
pub const ATTR_PERMS: &str = "perms";
pub const ATTR_USERNAME: &str = "username";
pub const ATTR_GROUPNAME: &str = "groupname";
pub const ATTR_FILESIZE: &str = "filesize";
pub const ATTR_MTIME: &str = "mtime";
pub const ATTR_CTIME: &str = "ctime";
/// optional marker attribute
pub const ATTR_SYMLINK: &str = "symlink";

const BASIC_ATTRS: [&str; 6] = [
    ATTR_PERMS,
    ATTR_USERNAME,
    ATTR_GROUPNAME,
    ATTR_FILESIZE,
    ATTR_MTIME,
    ATTR_CTIME,
];

/// what a tree entry points at
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryType {
    Tree,
    Blob,
    LargeBlob,
    Symlink,
}

impl EntryType {
    fn to_tag(self) -> u8 {
        match self {
            EntryType::Tree => 1,
            EntryType::Blob => 2,
            EntryType::LargeBlob => 3,
            EntryType::Symlink => 4,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(EntryType::Tree),
            2 => Ok(EntryType::Blob),
            3 => Ok(EntryType::LargeBlob),
            4 => Ok(EntryType::Symlink),
            other => Err(Error::Corrupt(format!("unknown tree entry tag {}", other))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EntryType::Tree => "tree",
            EntryType::Blob => "blob",
            EntryType::LargeBlob => "largeblob",
            EntryType::Symlink => "symlink",
        }
    }
}

/// one directory entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub kind: EntryType,
    pub hash: Hash,
    /// whole-file hash, set only for large blobs
    pub large_hash: Hash,
    pub attrs: BTreeMap<String, String>,
}

impl TreeEntry {
    pub fn new(kind: EntryType, hash: Hash) -> Self {
        Self {
            kind,
            hash,
            large_hash: Hash::ZERO,
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_large_hash(mut self, large_hash: Hash) -> Self {
        self.large_hash = large_hash;
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// true when every required attribute key is present
    pub fn has_basic_attrs(&self) -> bool {
        BASIC_ATTRS.iter().all(|k| self.attrs.contains_key(*k))
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(|s| s.as_str())
    }
}

/// a directory: name -> entry, iterated in name order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tree {
    entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// insert an entry, validating its name
    pub fn insert(&mut self, name: impl Into<String>, entry: TreeEntry) -> Result<()> {
        let name = name.into();
        validate_entry_name(&name)?;
        if self.entries.contains_key(&name) {
            return Err(Error::DuplicateEntryName(name));
        }
        self.entries.insert(name, entry);
        Ok(())
    }

    /// replace or insert without the duplicate check
    pub fn set(&mut self, name: impl Into<String>, entry: TreeEntry) -> Result<()> {
        let name = name.into();
        validate_entry_name(&name)?;
        self.entries.insert(name, entry);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<TreeEntry> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &TreeEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// canonical serialization: u32 count, then name-ordered entries
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32_le(self.entries.len() as u32).expect("vec write");
        for (name, entry) in &self.entries {
            buf.write_pstr(name).expect("entry names fit a pstr");
            buf.write_u8_val(entry.kind.to_tag()).expect("vec write");
            buf.write_hash(&entry.hash).expect("vec write");
            buf.write_hash(&entry.large_hash).expect("vec write");
            buf.write_u32_le(entry.attrs.len() as u32).expect("vec write");
            for (key, value) in &entry.attrs {
                buf.write_pstr(key).expect("attr keys fit a pstr");
                buf.write_pstr(value).expect("attr values fit a pstr");
            }
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = bytes;
        let count = r
            .read_u32_le()
            .map_err(|e| Error::Corrupt(format!("short tree blob: {}", e)))?;

        let mut tree = Tree::new();
        for _ in 0..count {
            let (name, entry) = read_entry(&mut r)
                .map_err(|e| Error::Corrupt(format!("short tree blob: {}", e)))?;
            let kind = EntryType::from_tag(entry.0)?;
            tree.insert(
                name,
                TreeEntry {
                    kind,
                    hash: entry.1,
                    large_hash: entry.2,
                    attrs: entry.3,
                },
            )?;
        }
        Ok(tree)
    }
}

type RawEntry = (u8, Hash, Hash, BTreeMap<String, String>);

fn read_entry<R: Read>(r: &mut R) -> std::io::Result<(String, RawEntry)> {
    let name = r.read_pstr()?;
    let tag = r.read_u8()?;
    let hash = r.read_hash()?;
    let large_hash = r.read_hash()?;
    let nattrs = r.read_u32_le()?;
    let mut attrs = BTreeMap::new();
    for _ in 0..nattrs {
        let key = r.read_pstr()?;
        let value = r.read_pstr()?;
        attrs.insert(key, value);
    }
    Ok((name, (tag, hash, large_hash, attrs)))
}

fn validate_entry_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidEntryName("empty name".to_string()));
    }
    if name.len() > u8::MAX as usize {
        return Err(Error::InvalidEntryName(format!(
            "name longer than 255 bytes: {}",
            name
        )));
    }
    if name.contains('/') {
        return Err(Error::InvalidEntryName(format!(
            "name contains '/': {}",
            name
        )));
    }
    if name.contains('\0') {
        return Err(Error::InvalidEntryName(format!(
            "name contains null byte: {}",
            name
        )));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidEntryName(format!("reserved name: {}", name)));
    }
    Ok(())
}
