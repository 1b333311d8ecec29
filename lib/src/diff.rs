// Copyright 2024 The Zeta Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! File-level diff between trees, the index and the worktree.
//!
//! Every source flattens to records sorted by full path (flattening in
//! subtree order yields exactly lexicographic full-path order), and the diff
//! is a single merge-join. Fragmented entries compare by origin hash and
//! origin size, never by the manifest's own hash, so re-chunking identical
//! content is not a change.

use itertools::EitherOrBoth;
use itertools::Itertools as _;

use crate::hash::ObjectId;
use crate::index::Index;
use crate::index::Stage;
use crate::odb::EntryRecord;
use crate::odb::ObjectDb;
use crate::odb::OdbResult;
use crate::op_context::OpContext;
use crate::sparse::SparseMatcher;
use crate::sparse::Visit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffAction {
    Insert,
    Delete,
    Modify,
}

/// One file-level change between two noder sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub action: DiffAction,
    pub from: Option<EntryRecord>,
    pub to: Option<EntryRecord>,
}

impl Change {
    pub fn path(&self) -> &str {
        self.from
            .as_ref()
            .or(self.to.as_ref())
            .map(|record| record.path.as_str())
            .expect("change has at least one side")
    }
}

/// A source of file records: a tree, the index, or the filesystem.
pub trait Noder {
    fn records(&self, ctx: &OpContext) -> OdbResult<Vec<EntryRecord>>;
}

/// Flattens the tree at `tree_id` under the sparse filter.
pub fn flatten_tree(
    odb: &ObjectDb,
    ctx: &OpContext,
    tree_id: &ObjectId,
    sparse: &SparseMatcher,
) -> OdbResult<Vec<EntryRecord>> {
    let mut records = Vec::new();
    flatten_into(odb, ctx, tree_id, "", sparse, &mut records)?;
    Ok(records)
}

fn flatten_into(
    odb: &ObjectDb,
    ctx: &OpContext,
    tree_id: &ObjectId,
    prefix: &str,
    sparse: &SparseMatcher,
    out: &mut Vec<EntryRecord>,
) -> OdbResult<()> {
    ctx.check()?;
    let tree = odb.tree(tree_id)?;
    for entry in tree.entries() {
        let path = if prefix.is_empty() {
            entry.name.clone()
        } else {
            format!("{prefix}/{}", entry.name)
        };
        if entry.mode.is_dir() {
            if sparse.visit_dir(&path) != Visit::Nothing {
                flatten_into(odb, ctx, &entry.hash, &path, sparse, out)?;
            }
        } else if sparse.matches_file(&path) {
            out.push(EntryRecord {
                path,
                mode: entry.mode,
                hash: entry.hash,
                size: entry.size,
            });
        }
    }
    Ok(())
}

/// A tree as a noder source.
pub struct TreeNoder<'a> {
    pub odb: &'a ObjectDb,
    pub tree: ObjectId,
    pub sparse: &'a SparseMatcher,
}

impl Noder for TreeNoder<'_> {
    fn records(&self, ctx: &OpContext) -> OdbResult<Vec<EntryRecord>> {
        flatten_tree(self.odb, ctx, &self.tree, self.sparse)
    }
}

/// The stage-0 index entries as a noder source. Conflict slots are not file
/// state and are reported separately by status.
pub struct IndexNoder<'a> {
    pub index: &'a Index,
    pub sparse: &'a SparseMatcher,
}

impl Noder for IndexNoder<'_> {
    fn records(&self, _ctx: &OpContext) -> OdbResult<Vec<EntryRecord>> {
        Ok(self
            .index
            .entries()
            .filter(|entry| entry.stage == Stage::Merged)
            .filter(|entry| self.sparse.matches_file(&entry.path))
            .map(|entry| EntryRecord {
                path: entry.path.clone(),
                mode: entry.mode,
                hash: entry.hash,
                size: entry.size,
            })
            .collect())
    }
}

/// The identity a record's content compares under: the origin hash and
/// logical size for fragmented entries, the blob hash and size otherwise.
pub fn content_key(odb: &ObjectDb, record: &EntryRecord) -> OdbResult<(ObjectId, u64)> {
    if record.mode.is_fragments() {
        let manifest = odb.fragments(&record.hash)?;
        Ok((manifest.origin, manifest.size))
    } else {
        Ok((record.hash, record.size))
    }
}

fn records_equal(odb: &ObjectDb, a: &EntryRecord, b: &EntryRecord) -> OdbResult<bool> {
    if a.mode.without_fragments() != b.mode.without_fragments() {
        return Ok(false);
    }
    if a.hash == b.hash {
        return Ok(true);
    }
    Ok(content_key(odb, a)? == content_key(odb, b)?)
}

/// Diffs two path-sorted record lists. Reversing the inputs yields the same
/// changes with Insert and Delete swapped.
pub fn diff_records(
    odb: &ObjectDb,
    ctx: &OpContext,
    from: Vec<EntryRecord>,
    to: Vec<EntryRecord>,
) -> OdbResult<Vec<Change>> {
    let mut changes = Vec::new();
    for pair in from
        .into_iter()
        .merge_join_by(to, |a, b| a.path.cmp(&b.path))
    {
        ctx.check()?;
        match pair {
            EitherOrBoth::Left(from) => changes.push(Change {
                action: DiffAction::Delete,
                from: Some(from),
                to: None,
            }),
            EitherOrBoth::Right(to) => changes.push(Change {
                action: DiffAction::Insert,
                from: None,
                to: Some(to),
            }),
            EitherOrBoth::Both(from, to) => {
                if !records_equal(odb, &from, &to)? {
                    changes.push(Change {
                        action: DiffAction::Modify,
                        from: Some(from),
                        to: Some(to),
                    });
                }
            }
        }
    }
    Ok(changes)
}

/// Diffs two trees under the sparse filter.
pub fn diff_trees(
    odb: &ObjectDb,
    ctx: &OpContext,
    from_tree: &ObjectId,
    to_tree: &ObjectId,
    sparse: &SparseMatcher,
) -> OdbResult<Vec<Change>> {
    if from_tree == to_tree {
        return Ok(Vec::new());
    }
    let from = flatten_tree(odb, ctx, from_tree, sparse)?;
    let to = flatten_tree(odb, ctx, to_tree, sparse)?;
    diff_records(odb, ctx, from, to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkConfig;
    use crate::object::FileMode;
    use crate::object::Object;
    use crate::object::Tree;
    use crate::object::TreeEntry;

    fn new_odb() -> (tempfile::TempDir, ObjectDb) {
        let dir = tempfile::tempdir().unwrap();
        let odb = ObjectDb::init(&dir.path().join("objects"), ChunkConfig::default()).unwrap();
        (dir, odb)
    }

    fn put_tree(odb: &ObjectDb, entries: Vec<TreeEntry>) -> ObjectId {
        odb.put_encoded(&Object::Tree(Tree::from_entries(entries))).unwrap()
    }

    #[test]
    fn test_diff_trees_actions() {
        let (_dir, odb) = new_odb();
        let ctx = OpContext::background();
        let blob_a = odb.put_bytes(b"a\n").unwrap();
        let blob_b = odb.put_bytes(b"b\n").unwrap();

        let sub_from = put_tree(&odb, vec![
            TreeEntry::new("keep.txt", FileMode::REGULAR, blob_a, 2),
            TreeEntry::new("gone.txt", FileMode::REGULAR, blob_a, 2),
        ]);
        let from = put_tree(&odb, vec![
            TreeEntry::new("sub", FileMode::DIR, sub_from, 0),
            TreeEntry::new("mod.txt", FileMode::REGULAR, blob_a, 2),
        ]);
        let sub_to = put_tree(&odb, vec![
            TreeEntry::new("keep.txt", FileMode::REGULAR, blob_a, 2),
            TreeEntry::new("new.txt", FileMode::REGULAR, blob_b, 2),
        ]);
        let to = put_tree(&odb, vec![
            TreeEntry::new("sub", FileMode::DIR, sub_to, 0),
            TreeEntry::new("mod.txt", FileMode::REGULAR, blob_b, 2),
        ]);

        let changes =
            diff_trees(&odb, &ctx, &from, &to, &SparseMatcher::match_all()).unwrap();
        let summary: Vec<(&str, DiffAction)> = changes
            .iter()
            .map(|change| (change.path(), change.action))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("mod.txt", DiffAction::Modify),
                ("sub/gone.txt", DiffAction::Delete),
                ("sub/new.txt", DiffAction::Insert),
            ]
        );
    }

    #[test]
    fn test_diff_symmetry() {
        let (_dir, odb) = new_odb();
        let ctx = OpContext::background();
        let blob_a = odb.put_bytes(b"a\n").unwrap();
        let blob_b = odb.put_bytes(b"b\n").unwrap();
        let from = put_tree(&odb, vec![
            TreeEntry::new("x.txt", FileMode::REGULAR, blob_a, 2),
            TreeEntry::new("y.txt", FileMode::REGULAR, blob_a, 2),
        ]);
        let to = put_tree(&odb, vec![
            TreeEntry::new("y.txt", FileMode::REGULAR, blob_b, 2),
            TreeEntry::new("z.txt", FileMode::REGULAR, blob_b, 2),
        ]);

        let all = SparseMatcher::match_all();
        let forward = diff_trees(&odb, &ctx, &from, &to, &all).unwrap();
        let backward = diff_trees(&odb, &ctx, &to, &from, &all).unwrap();
        assert_eq!(forward.len(), backward.len());
        for (f, b) in forward.iter().zip(&backward) {
            assert_eq!(f.path(), b.path());
            let swapped = match b.action {
                DiffAction::Insert => DiffAction::Delete,
                DiffAction::Delete => DiffAction::Insert,
                DiffAction::Modify => DiffAction::Modify,
            };
            assert_eq!(f.action, swapped);
            assert_eq!(f.from, b.to);
            assert_eq!(f.to, b.from);
        }
    }

    #[test]
    fn test_mode_only_change_is_modify() {
        let (_dir, odb) = new_odb();
        let ctx = OpContext::background();
        let blob = odb.put_bytes(b"#!/bin/sh\n").unwrap();
        let from = put_tree(&odb, vec![TreeEntry::new("run", FileMode::REGULAR, blob, 10)]);
        let to = put_tree(&odb, vec![TreeEntry::new("run", FileMode::EXECUTABLE, blob, 10)]);
        let changes =
            diff_trees(&odb, &ctx, &from, &to, &SparseMatcher::match_all()).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].action, DiffAction::Modify);
    }

    #[test]
    fn test_fragmented_entry_compares_by_origin() {
        let (_dir, odb) = new_odb();
        let ctx = OpContext::background();

        // Same logical content stored fragmented on one side and whole on
        // the other: not a change.
        let content: Vec<u8> = (0..(5 << 20)).map(|i: u32| (i % 251) as u8).collect();
        let (manifest_id, is_fragments) =
            odb.hash_to(&mut content.as_slice(), content.len() as u64).unwrap();
        assert!(is_fragments);
        let whole_id = odb.put_bytes(&content).unwrap();

        let from = put_tree(&odb, vec![TreeEntry::new(
            "big.bin",
            FileMode::REGULAR.with_fragments(),
            manifest_id,
            content.len() as u64,
        )]);
        let to = put_tree(&odb, vec![TreeEntry::new(
            "big.bin",
            FileMode::REGULAR,
            whole_id,
            content.len() as u64,
        )]);
        let changes =
            diff_trees(&odb, &ctx, &from, &to, &SparseMatcher::match_all()).unwrap();
        assert_eq!(changes, vec![]);
    }

    #[test]
    fn test_sparse_filter_hides_paths() {
        let (_dir, odb) = new_odb();
        let ctx = OpContext::background();
        let blob_a = odb.put_bytes(b"a\n").unwrap();
        let blob_b = odb.put_bytes(b"b\n").unwrap();
        let assets_from = put_tree(&odb, vec![TreeEntry::new(
            "huge.bin",
            FileMode::REGULAR,
            blob_a,
            2,
        )]);
        let assets_to = put_tree(&odb, vec![TreeEntry::new(
            "huge.bin",
            FileMode::REGULAR,
            blob_b,
            2,
        )]);
        let from = put_tree(&odb, vec![
            TreeEntry::new("assets", FileMode::DIR, assets_from, 0),
            TreeEntry::new("src", FileMode::DIR, put_tree(&odb, vec![TreeEntry::new(
                "main.rs",
                FileMode::REGULAR,
                blob_a,
                2,
            )]), 0),
        ]);
        let to = put_tree(&odb, vec![
            TreeEntry::new("assets", FileMode::DIR, assets_to, 0),
            TreeEntry::new("src", FileMode::DIR, put_tree(&odb, vec![TreeEntry::new(
                "main.rs",
                FileMode::REGULAR,
                blob_b,
                2,
            )]), 0),
        ]);

        let sparse = SparseMatcher::new(["src".to_owned()]);
        let changes = diff_trees(&odb, &ctx, &from, &to, &sparse).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path(), "src/main.rs");
    }
}
