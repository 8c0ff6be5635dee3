pub mod commit;
pub mod largeblob;
pub mod tree;

pub use commit::{Commit, GraftInfo, COMMIT_VERSION};
pub use largeblob::{LBlobEntry, LargeBlob};
pub use tree::{EntryType, Tree, TreeEntry};
