//! silo - a content-addressed versioned filesystem core
//!
//! every file, directory, and commit is an immutable object named by the
//! SHA-256 of its serialized bytes. objects are packed into append-only
//! packfiles with an external index, reference-counted through a metadata
//! log, and replicated between peers over a small framed wire protocol.
//!
//! # Core pieces
//!
//! - **Chunker**: splits large files into content-defined chunks
//! - **Packfile**: append-only object container with transactional groups
//! - **Index**: durable map from hash to (packfile, offset, size)
//! - **Metadata log**: refcounts and per-object key/value metadata
//! - **Repo**: the engine tying storage, commits, and replication together
//! - **Workdir**: the in-memory overlay a mount layer drives
//!
//! # Example
//!
//! ```no_run
//! use silo::{Repo, Workdir};
//! use std::path::Path;
//!
//! let repo = Repo::init(Path::new("/data/project"), false).unwrap();
//! let mut wd = Workdir::new(repo);
//! wd.create("hello.txt", 0o644).unwrap();
//! let fh = wd.open_write("hello.txt").unwrap();
//! wd.write(fh, 0, b"hello\n").unwrap();
//! wd.close(fh).unwrap();
//! let commit = wd.snapshot("first commit", "normal").unwrap();
//! println!("committed {}", commit);
//! ```

mod config;
mod error;
mod hash;
mod lru;
mod stream;

pub mod chunker;
pub mod index;
pub mod merge;
pub mod metalog;
pub mod object;
pub mod packfile;
pub mod packman;
pub mod remote;
pub mod repo;
pub mod snapshots;
pub mod treediff;
pub mod types;
pub mod wire;
pub mod workdir;

pub use config::{ChunkerMode, StoreConfig};
pub use error::{Error, Result};
pub use hash::{hash_bytes, hash_file, Hash};
pub use object::{Object, ObjectInfo, ObjectType};
pub use remote::Remote;
pub use repo::{MergeResult, Peer, PullStats, Repo, RepoLock};
pub use workdir::{FileInfo, FileKind, Workdir};
