//! flattened trees and tree diffs
//!
//! merging and diffing work over *flattened* trees: a map from slash-joined
//! path to entry, covering files and directories alike. a diff is a map from
//! path to change; two diffs against a common base merge entry-by-entry.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::hash::Hash;
use crate::types::{EntryType, Tree, TreeEntry};

/// path -> entry over a whole subtree
pub type FlatTree = BTreeMap<String, TreeEntry>;

/// one change relative to a base tree
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    Added(TreeEntry),
    Deleted,
    Modified(TreeEntry),
}

/// path -> change
pub type TreeDiff = BTreeMap<String, Change>;

/// a merge conflict staged for the user
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conflict {
    pub path: String,
    /// the side that won and stayed at `path`
    pub ours: Option<TreeEntry>,
    /// the losing side, staged at `<path>:conflict`
    pub theirs: Option<TreeEntry>,
    /// the common ancestor, staged at `<path>:base`
    pub base: Option<TreeEntry>,
}

/// flatten a tree rooted at `root` into path -> entry
///
/// `read_tree` resolves a tree hash to its parsed object.
pub fn flatten(
    root: &Hash,
    read_tree: &mut impl FnMut(&Hash) -> Result<Tree>,
) -> Result<FlatTree> {
    let mut flat = FlatTree::new();
    flatten_into(root, "", read_tree, &mut flat)?;
    Ok(flat)
}

fn flatten_into(
    tree_hash: &Hash,
    prefix: &str,
    read_tree: &mut impl FnMut(&Hash) -> Result<Tree>,
    flat: &mut FlatTree,
) -> Result<()> {
    let tree = read_tree(tree_hash)?;
    for (name, entry) in tree.entries() {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };
        if entry.kind == EntryType::Tree {
            flatten_into(&entry.hash, &path, read_tree, flat)?;
        }
        flat.insert(path, entry.clone());
    }
    Ok(())
}

/// diff two flattened trees: what changed going from `base` to `side`
pub fn diff(base: &FlatTree, side: &FlatTree) -> TreeDiff {
    let mut changes = TreeDiff::new();

    for (path, entry) in side {
        match base.get(path) {
            None => {
                changes.insert(path.clone(), Change::Added(entry.clone()));
            }
            Some(old) if old != entry => {
                changes.insert(path.clone(), Change::Modified(entry.clone()));
            }
            Some(_) => {}
        }
    }

    for path in base.keys() {
        if !side.contains_key(path) {
            changes.insert(path.clone(), Change::Deleted);
        }
    }

    changes
}

/// merge two diffs taken against the same base
///
/// non-overlapping changes pass through; identical changes collapse; true
/// conflicts keep the first diff's side at the original path and stage the
/// other side as `<path>:conflict` (plus `<path>:base` when the base had the
/// file).
pub fn merge_changes(d1: &TreeDiff, d2: &TreeDiff, base: &FlatTree) -> (TreeDiff, Vec<Conflict>) {
    let mut merged = TreeDiff::new();
    let mut conflicts = Vec::new();

    for (path, change) in d1 {
        match d2.get(path) {
            None => {
                merged.insert(path.clone(), change.clone());
            }
            Some(other) if other == change => {
                merged.insert(path.clone(), change.clone());
            }
            Some(other) => {
                let (winner, loser) = resolve_conflict(change, other);
                merged.insert(path.clone(), winner.clone());

                let base_entry = base.get(path).cloned();
                if let Some(staged) = entry_of(loser) {
                    merged.insert(format!("{}:conflict", path), Change::Added(staged.clone()));
                }
                if let Some(base_entry) = &base_entry {
                    merged.insert(
                        format!("{}:base", path),
                        Change::Added(base_entry.clone()),
                    );
                }
                conflicts.push(Conflict {
                    path: path.clone(),
                    ours: entry_of(winner).cloned(),
                    theirs: entry_of(loser).cloned(),
                    base: base_entry,
                });
            }
        }
    }

    for (path, change) in d2 {
        if !d1.contains_key(path) {
            merged.insert(path.clone(), change.clone());
        }
    }

    (merged, conflicts)
}

/// pick the surviving side of a conflicting pair
///
/// modify beats delete; otherwise the first side wins.
fn resolve_conflict<'a>(ours: &'a Change, theirs: &'a Change) -> (&'a Change, &'a Change) {
    match (ours, theirs) {
        (Change::Deleted, Change::Modified(_)) | (Change::Deleted, Change::Added(_)) => {
            (theirs, ours)
        }
        _ => (ours, theirs),
    }
}

fn entry_of(change: &Change) -> Option<&TreeEntry> {
    match change {
        Change::Added(e) | Change::Modified(e) => Some(e),
        Change::Deleted => None,
    }
}

/// apply a diff to a flattened tree
pub fn apply(base: &FlatTree, diff: &TreeDiff) -> FlatTree {
    let mut result = base.clone();
    for (path, change) in diff {
        match change {
            Change::Added(e) | Change::Modified(e) => {
                result.insert(path.clone(), e.clone());
            }
            Change::Deleted => {
                result.remove(path);
            }
        }
    }
    result
}

/// rebuild nested trees from a flattened tree, bottom-up
///
/// `add_tree` stores one synthesized tree and returns its hash. returns the
/// root tree hash. directory entries present in the flat map keep their
/// attrs; implicit intermediate directories get the provided defaults.
pub fn materialize(
    flat: &FlatTree,
    default_dir_attrs: &BTreeMap<String, String>,
    add_tree: &mut impl FnMut(&Tree) -> Result<Hash>,
) -> Result<Hash> {
    // group children by parent directory
    let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
    children.insert(String::new(), Vec::new());
    for path in flat.keys() {
        let (dir, _) = split_path(path);
        // ensure every ancestor directory exists in the map
        let mut ancestor = dir.to_string();
        loop {
            if children.contains_key(&ancestor) {
                break;
            }
            children.insert(ancestor.clone(), Vec::new());
            let (parent, _) = split_path(&ancestor);
            ancestor = parent.to_string();
        }
        children
            .get_mut(dir)
            .expect("parent dir registered")
            .push(path.clone());
    }
    // directories implied by other directories' paths
    let dirs: Vec<String> = children.keys().cloned().collect();
    for dir in dirs {
        if dir.is_empty() {
            continue;
        }
        let (parent, _) = split_path(&dir);
        let parent = parent.to_string();
        children.entry(parent.clone()).or_default();
        if !children[&parent].contains(&dir) && !flat.contains_key(&dir) {
            children.get_mut(&parent).expect("just inserted").push(dir);
        }
    }

    build_dir("", flat, &children, default_dir_attrs, add_tree)
}

fn build_dir(
    dir: &str,
    flat: &FlatTree,
    children: &BTreeMap<String, Vec<String>>,
    default_dir_attrs: &BTreeMap<String, String>,
    add_tree: &mut impl FnMut(&Tree) -> Result<Hash>,
) -> Result<Hash> {
    let mut tree = Tree::new();
    let empty = Vec::new();
    for path in children.get(dir).unwrap_or(&empty) {
        let (_, name) = split_path(path);
        match flat.get(path) {
            Some(entry) if entry.kind == EntryType::Tree => {
                let hash = build_dir(path, flat, children, default_dir_attrs, add_tree)?;
                let mut dir_entry = entry.clone();
                dir_entry.hash = hash;
                tree.set(name, dir_entry)?;
            }
            Some(entry) => {
                tree.set(name, entry.clone())?;
            }
            None => {
                // implicit directory
                let hash = build_dir(path, flat, children, default_dir_attrs, add_tree)?;
                let mut dir_entry = TreeEntry::new(EntryType::Tree, hash);
                dir_entry.attrs = default_dir_attrs.clone();
                tree.set(name, dir_entry)?;
            }
        }
    }
    add_tree(&tree)
}

/// split a slash-joined path into (parent dir, last segment)
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(ix) => (&path[..ix], &path[ix + 1..]),
        None => ("", path),
    }
}
