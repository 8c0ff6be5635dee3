//! commit objects
//!
//! a commit snapshots a root tree with up to two parents. the zero hash
//! stands for "no parent": history terminates at the empty-commit sentinel.
//! serialization is canonical, so the commit hash is the hash of
//! [`Commit::to_bytes`].

use crate::error::{Error, Result};
use crate::hash::{hash_bytes, Hash};
use crate::stream::{ReadExt, WriteExt};

/// current commit format version
pub const COMMIT_VERSION: u32 = 1;

const FLAG_SIGNATURE: u32 = 0x1;
const FLAG_GRAFT: u32 = 0x2;

/// where a grafted commit came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GraftInfo {
    pub repo: String,
    pub path: String,
    pub commit: Hash,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub version: u32,
    /// first parent; zero for the initial commit
    pub parent1: Hash,
    /// second parent; zero unless this is a merge
    pub parent2: Hash,
    pub tree: Hash,
    pub user: String,
    pub message: String,
    pub snapshot: String,
    /// seconds since the epoch
    pub time: u64,
    /// opaque detached signature over the unsigned serialization
    pub signature: Option<Vec<u8>>,
    pub graft: Option<GraftInfo>,
}

impl Commit {
    pub fn new(tree: Hash, message: impl Into<String>) -> Self {
        Self {
            version: COMMIT_VERSION,
            parent1: Hash::ZERO,
            parent2: Hash::ZERO,
            tree,
            user: String::new(),
            message: message.into(),
            snapshot: String::new(),
            time: 0,
            signature: None,
            graft: None,
        }
    }

    pub fn set_parents(&mut self, p1: Hash, p2: Hash) {
        self.parent1 = p1;
        self.parent2 = p2;
    }

    pub fn is_merge(&self) -> bool {
        !self.parent2.is_zero()
    }

    pub fn is_root(&self) -> bool {
        self.parent1.is_zero() && self.parent2.is_zero()
    }

    /// bytes a signature covers: the serialization minus the signature field
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        unsigned.to_bytes()
    }

    pub fn sign_with(&mut self, signature: Vec<u8>) {
        self.signature = Some(signature);
    }

    /// content hash of this commit
    pub fn hash(&self) -> Hash {
        hash_bytes(&self.to_bytes())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut flags = 0u32;
        if self.signature.is_some() {
            flags |= FLAG_SIGNATURE;
        }
        if self.graft.is_some() {
            flags |= FLAG_GRAFT;
        }

        let mut buf = Vec::new();
        buf.write_u32_le(self.version).expect("vec write");
        buf.write_u32_le(flags).expect("vec write");
        buf.write_hash(&self.parent1).expect("vec write");
        buf.write_hash(&self.parent2).expect("vec write");
        buf.write_hash(&self.tree).expect("vec write");
        buf.write_lstr(&self.user).expect("vec write");
        buf.write_lstr(&self.message).expect("vec write");
        buf.write_lstr(&self.snapshot).expect("vec write");
        buf.write_u64_le(self.time).expect("vec write");
        if let Some(sig) = &self.signature {
            buf.write_lbuf(sig).expect("vec write");
        }
        if let Some(graft) = &self.graft {
            buf.write_lstr(&graft.repo).expect("vec write");
            buf.write_lstr(&graft.path).expect("vec write");
            buf.write_hash(&graft.commit).expect("vec write");
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = bytes;
        let parse = |e: std::io::Error| Error::Corrupt(format!("short commit blob: {}", e));

        let version = r.read_u32_le().map_err(parse)?;
        if version != COMMIT_VERSION {
            return Err(Error::Corrupt(format!(
                "unknown commit version {}",
                version
            )));
        }
        let flags = r.read_u32_le().map_err(parse)?;
        let parent1 = r.read_hash().map_err(parse)?;
        let parent2 = r.read_hash().map_err(parse)?;
        let tree = r.read_hash().map_err(parse)?;
        let user = r.read_lstr().map_err(parse)?;
        let message = r.read_lstr().map_err(parse)?;
        let snapshot = r.read_lstr().map_err(parse)?;
        let time = r.read_u64_le().map_err(parse)?;

        let signature = if flags & FLAG_SIGNATURE != 0 {
            Some(r.read_lbuf().map_err(parse)?)
        } else {
            None
        };
        let graft = if flags & FLAG_GRAFT != 0 {
            Some(GraftInfo {
                repo: r.read_lstr().map_err(parse)?,
                path: r.read_lstr().map_err(parse)?,
                commit: r.read_hash().map_err(parse)?,
            })
        } else {
            None
        };

        Ok(Self {
            version,
            parent1,
            parent2,
            tree,
            user,
            message,
            snapshot,
            time,
            signature,
            graft,
        })
    }
}
