//! the repository capability set
//!
//! everything pull needs from a peer, abstracted over the carrier. the local
//! engine implements this too, so replication code works peer-to-peer or
//! over a byte-stream transport without special cases.

use crate::error::Result;
use crate::hash::Hash;
use crate::object::{Object, ObjectInfo, ObjectType};
use crate::types::Commit;

/// uniform repository interface usable over any transport
pub trait Remote: Send {
    /// repository uuid
    fn get_uuid(&mut self) -> Result<String>;

    /// current head commit, or the zero hash for an empty repository
    fn get_head(&mut self) -> Result<Hash>;

    /// every commit the repository knows about
    fn list_commits(&mut self) -> Result<Vec<Commit>>;

    /// headers of every stored object
    fn list_objects(&mut self) -> Result<Vec<ObjectInfo>>;

    fn get_object_info(&mut self, hash: &Hash) -> Result<Option<ObjectInfo>>;

    fn has_object(&mut self, hash: &Hash) -> Result<bool> {
        Ok(self.get_object_info(hash)?.is_some())
    }

    fn get_object(&mut self, hash: &Hash) -> Result<Option<Object>>;

    /// store one object; transports without a write path reject this
    fn add_object(&mut self, kind: ObjectType, hash: &Hash, payload: &[u8]) -> Result<()>;

    /// serialize the requested objects as a zero-terminated object stream
    /// (the packfile transmit format)
    fn get_objects(&mut self, hashes: &[Hash]) -> Result<Vec<u8>>;

    /// proximity metric used to choose between peers; lower is closer
    fn distance(&self) -> u32;
}
