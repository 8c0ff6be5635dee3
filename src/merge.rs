//! merge support: ancestor walk, merge state, merge driver
//!
//! merging finds the lowest common ancestor of the two heads, diffs each
//! side against it over flattened trees, and combines the diffs. the result
//! is a merged flat tree plus staged conflicts; a pending merge is recorded
//! on disk until the user commits it.

use std::collections::{HashSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, Result};
use crate::hash::Hash;
use crate::treediff::{self, Conflict, FlatTree};
use crate::types::Commit;

/// persistent record of an in-progress two-parent commit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeState {
    pub parent1: Hash,
    pub parent2: Hash,
}

#[derive(Serialize, Deserialize)]
struct MergeStateFile {
    parent1: String,
    parent2: String,
}

impl MergeState {
    pub fn new(parent1: Hash, parent2: Hash) -> Self {
        Self { parent1, parent2 }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = MergeStateFile {
            parent1: self.parent1.to_hex(),
            parent2: self.parent2.to_hex(),
        };
        let content = toml::to_string_pretty(&file)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).with_path(path)?;
        let file: MergeStateFile = toml::from_str(&content)?;
        Ok(Some(Self {
            parent1: Hash::from_hex(&file.parent1)?,
            parent2: Hash::from_hex(&file.parent2)?,
        }))
    }

    pub fn clear(path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_file(path).with_path(path)?;
        }
        Ok(())
    }
}

/// find the lowest common ancestor of two commits
///
/// walks all ancestors of `a`, then searches breadth-first from `b` for the
/// first commit in that set. returns the zero hash when the histories share
/// no commit.
pub fn find_lca(
    a: &Hash,
    b: &Hash,
    read_commit: &mut impl FnMut(&Hash) -> Result<Commit>,
) -> Result<Hash> {
    if a == b {
        return Ok(*a);
    }

    let mut ancestors = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(*a);
    while let Some(hash) = queue.pop_front() {
        if hash.is_zero() || !ancestors.insert(hash) {
            continue;
        }
        let commit = read_commit(&hash)?;
        queue.push_back(commit.parent1);
        queue.push_back(commit.parent2);
    }

    let mut seen = HashSet::new();
    queue.push_back(*b);
    while let Some(hash) = queue.pop_front() {
        if hash.is_zero() || !seen.insert(hash) {
            continue;
        }
        if ancestors.contains(&hash) {
            return Ok(hash);
        }
        let commit = read_commit(&hash)?;
        queue.push_back(commit.parent1);
        queue.push_back(commit.parent2);
    }

    Ok(Hash::ZERO)
}

/// outcome of a tree merge
#[derive(Debug)]
pub struct MergeOutcome {
    /// the merged flat tree, conflicts staged under renamed paths
    pub merged: FlatTree,
    pub conflicts: Vec<Conflict>,
}

/// merge two flattened trees against their common base
pub fn merge_trees(base: &FlatTree, ours: &FlatTree, theirs: &FlatTree) -> MergeOutcome {
    let d1 = treediff::diff(base, ours);
    let d2 = treediff::diff(base, theirs);
    let (merged_diff, conflicts) = treediff::merge_changes(&d1, &d2, base);
    MergeOutcome {
        merged: treediff::apply(base, &merged_diff),
        conflicts,
    }
}
