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

//! Three-way tree merging.
//!
//! `merge_tree` works on the flattened file records of the three trees.
//! Each path resolves independently: one-sided changes apply, identical
//! changes collapse, and real collisions either go through the text merge
//! driver or become conflict records with ancestor/ours/theirs slots. The
//! result tree always exists; conflicts are values, not errors.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use bstr::ByteSlice as _;
use thiserror::Error;
use tracing::instrument;

use crate::diff::DiffAction;
use crate::diff::diff_records;
use crate::diff::flatten_tree;
use crate::filemerge::BuiltinMergeDriver;
use crate::filemerge::MergeDriver;
use crate::filemerge::MergeDriverError;
use crate::filemerge::MergeLabels;
use crate::filemerge::looks_binary;
use crate::hash::ObjectId;
use crate::odb::EntryRecord;
use crate::odb::ObjectDb;
use crate::odb::OdbError;
use crate::op_context::OpContext;
use crate::sparse::SparseMatcher;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Odb(#[from] OdbError),
    #[error(transparent)]
    Driver(#[from] MergeDriverError),
}

pub type MergeResult<T> = Result<T, MergeError>;

/// Default content similarity for pairing a delete with an insert as a
/// rename.
pub const DEFAULT_RENAME_THRESHOLD: f64 = 0.5;

pub struct MergeOptions<'a> {
    pub driver: &'a dyn MergeDriver,
    pub labels: MergeLabels,
    pub rename_detection: bool,
    pub rename_threshold: f64,
}

impl MergeOptions<'static> {
    pub fn new(labels: MergeLabels) -> Self {
        static BUILTIN: BuiltinMergeDriver = BuiltinMergeDriver;
        MergeOptions {
            driver: &BUILTIN,
            labels,
            rename_detection: true,
            rename_threshold: DEFAULT_RENAME_THRESHOLD,
        }
    }
}

/// Why a path could not be merged automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Overlapping text edits; marker content is available.
    Content,
    /// Binary, fragmented or symlink content changed on both sides.
    NoAutomerge,
    /// Deleted on one side, modified on the other.
    DeleteModify,
    /// Added on both sides with different content.
    AddAdd,
    /// Same content, incompatible modes.
    Mode,
    /// Renamed to different targets on each side.
    RenameRename,
}

/// An unresolved path, with the stage slots that should land in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub path: String,
    pub kind: ConflictKind,
    /// Stage-1 slot.
    pub ancestor: Option<EntryRecord>,
    /// Stage-2 slot.
    pub ours: Option<EntryRecord>,
    /// Stage-3 slot.
    pub theirs: Option<EntryRecord>,
    /// Blob with conflict markers to materialize in the worktree, when the
    /// conflict is textual.
    pub marked: Option<EntryRecord>,
}

/// Result of a tree merge. `tree` is always a valid tree: conflicted paths
/// carry the worktree-favored side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub tree: ObjectId,
    pub conflicts: Vec<ConflictRecord>,
    pub messages: Vec<String>,
}

impl MergeOutcome {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// A rename detected on one side: the base path disappeared and its content
/// (or near content) reappeared at another path.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Rename {
    from: String,
    to: String,
}

/// Merges trees `ours` and `theirs` against their common `base`.
#[instrument(skip_all)]
pub fn merge_tree(
    odb: &ObjectDb,
    ctx: &OpContext,
    base_tree: &ObjectId,
    our_tree: &ObjectId,
    their_tree: &ObjectId,
    options: &MergeOptions<'_>,
) -> MergeResult<MergeOutcome> {
    let all = SparseMatcher::match_all();
    let base = flatten_tree(odb, ctx, base_tree, &all)?;
    let ours = flatten_tree(odb, ctx, our_tree, &all)?;
    let theirs = flatten_tree(odb, ctx, their_tree, &all)?;

    let our_changes = diff_records(odb, ctx, base.clone(), ours.clone())?;
    let their_changes = diff_records(odb, ctx, base.clone(), theirs.clone())?;

    let our_renames = if options.rename_detection {
        detect_renames(odb, &our_changes, options.rename_threshold)?
    } else {
        vec![]
    };
    let their_renames = if options.rename_detection {
        detect_renames(odb, &their_changes, options.rename_threshold)?
    } else {
        vec![]
    };

    let base_map: BTreeMap<&str, &EntryRecord> =
        base.iter().map(|r| (r.path.as_str(), r)).collect();
    let our_map: BTreeMap<&str, &EntryRecord> =
        ours.iter().map(|r| (r.path.as_str(), r)).collect();
    let their_map: BTreeMap<&str, &EntryRecord> =
        theirs.iter().map(|r| (r.path.as_str(), r)).collect();

    let mut merger = Merger {
        odb,
        options,
        result: BTreeMap::new(),
        conflicts: Vec::new(),
        messages: Vec::new(),
    };

    // Rename/rename collisions and content-following for one-sided renames
    // are resolved before the per-path loop; paths handled here are
    // excluded from it.
    let mut handled: BTreeSet<String> = BTreeSet::new();
    merger.apply_renames(
        &our_renames,
        &their_renames,
        &base_map,
        &our_map,
        &their_map,
        &mut handled,
    )?;

    let paths: BTreeSet<&str> = base_map
        .keys()
        .chain(our_map.keys())
        .chain(their_map.keys())
        .copied()
        .collect();
    for path in paths {
        ctx.check().map_err(OdbError::from)?;
        if handled.contains(path) {
            continue;
        }
        merger.merge_path(
            path,
            base_map.get(path).copied(),
            our_map.get(path).copied(),
            their_map.get(path).copied(),
        )?;
    }

    let records: Vec<EntryRecord> = merger.result.into_values().collect();
    let tree = odb.write_records_as_tree(&records)?;
    Ok(MergeOutcome {
        tree,
        conflicts: merger.conflicts,
        messages: merger.messages,
    })
}

struct Merger<'a> {
    odb: &'a ObjectDb,
    options: &'a MergeOptions<'a>,
    result: BTreeMap<String, EntryRecord>,
    conflicts: Vec<ConflictRecord>,
    messages: Vec<String>,
}

impl Merger<'_> {
    fn keep(&mut self, record: &EntryRecord) {
        self.result.insert(record.path.clone(), record.clone());
    }

    fn apply_renames(
        &mut self,
        our_renames: &[Rename],
        their_renames: &[Rename],
        base_map: &BTreeMap<&str, &EntryRecord>,
        our_map: &BTreeMap<&str, &EntryRecord>,
        their_map: &BTreeMap<&str, &EntryRecord>,
        handled: &mut BTreeSet<String>,
    ) -> MergeResult<()> {
        for ours in our_renames {
            if let Some(theirs) = their_renames.iter().find(|r| r.from == ours.from) {
                if ours.to != theirs.to {
                    // Renamed to different places; keep both targets and
                    // leave the decision to the user.
                    let base = base_map.get(ours.from.as_str()).copied();
                    let our_record = our_map.get(ours.to.as_str()).copied();
                    let their_record = their_map.get(theirs.to.as_str()).copied();
                    if let Some(record) = our_record {
                        self.keep(record);
                    }
                    if let Some(record) = their_record {
                        self.keep(record);
                    }
                    self.messages.push(format!(
                        "CONFLICT (rename/rename): {} renamed to {} ({}) and to {} ({})",
                        ours.from,
                        ours.to,
                        self.options.labels.ours,
                        theirs.to,
                        self.options.labels.theirs,
                    ));
                    self.conflicts.push(ConflictRecord {
                        path: ours.from.clone(),
                        kind: ConflictKind::RenameRename,
                        ancestor: base.cloned(),
                        ours: our_record.cloned(),
                        theirs: their_record.cloned(),
                        marked: None,
                    });
                    handled.insert(ours.from.clone());
                    handled.insert(ours.to.clone());
                    handled.insert(theirs.to.clone());
                }
                continue;
            }
            // One-sided rename: if the other side modified the source in
            // place, follow the content to the new path.
            if let Some(their_record) = their_map.get(ours.from.as_str()).copied() {
                let base = base_map.get(ours.from.as_str()).copied();
                let our_record = our_map.get(ours.to.as_str()).copied();
                if let (Some(base), Some(our_record)) = (base, our_record) {
                    let mut followed = their_record.clone();
                    followed.path = ours.to.clone();
                    handled.insert(ours.from.clone());
                    handled.insert(ours.to.clone());
                    let mut shifted_base = base.clone();
                    shifted_base.path = ours.to.clone();
                    let our_record = our_record.clone();
                    self.merge_path(
                        &ours.to.clone(),
                        Some(&shifted_base),
                        Some(&our_record),
                        Some(&followed),
                    )?;
                }
            }
        }
        for theirs in their_renames {
            if our_renames.iter().any(|r| r.from == theirs.from) {
                continue;
            }
            if let Some(our_record) = our_map.get(theirs.from.as_str()).copied() {
                let base = base_map.get(theirs.from.as_str()).copied();
                let their_record = their_map.get(theirs.to.as_str()).copied();
                if let (Some(base), Some(their_record)) = (base, their_record) {
                    let mut followed = our_record.clone();
                    followed.path = theirs.to.clone();
                    handled.insert(theirs.from.clone());
                    handled.insert(theirs.to.clone());
                    let mut shifted_base = base.clone();
                    shifted_base.path = theirs.to.clone();
                    let their_record = their_record.clone();
                    self.merge_path(
                        &theirs.to.clone(),
                        Some(&shifted_base),
                        Some(&followed),
                        Some(&their_record),
                    )?;
                }
            }
        }
        Ok(())
    }

    fn merge_path(
        &mut self,
        path: &str,
        base: Option<&EntryRecord>,
        ours: Option<&EntryRecord>,
        theirs: Option<&EntryRecord>,
    ) -> MergeResult<()> {
        let ours_changed = !same(self.odb, base, ours)?;
        let theirs_changed = !same(self.odb, base, theirs)?;

        match (ours_changed, theirs_changed) {
            (false, false) => {
                if let Some(record) = ours.or(base) {
                    self.keep(record);
                }
            }
            (true, false) => {
                if let Some(record) = ours {
                    self.keep(record);
                }
            }
            (false, true) => {
                if let Some(record) = theirs {
                    self.keep(record);
                }
            }
            (true, true) => {
                if same(self.odb, ours, theirs)? {
                    // Identical change on both sides; same hash+mode takes
                    // either.
                    if let Some(record) = ours {
                        self.keep(record);
                    }
                    return Ok(());
                }
                self.merge_both_changed(path, base, ours, theirs)?;
            }
        }
        Ok(())
    }

    fn merge_both_changed(
        &mut self,
        path: &str,
        base: Option<&EntryRecord>,
        ours: Option<&EntryRecord>,
        theirs: Option<&EntryRecord>,
    ) -> MergeResult<()> {
        let labels = &self.options.labels;
        match (ours, theirs) {
            (None, None) => unreachable!("both deleted is not a both-changed state"),
            (Some(our_record), None) => {
                // Delete/modify: the modified side stays in the worktree.
                self.keep(our_record);
                self.messages.push(format!(
                    "CONFLICT (modify/delete): {path} modified in {} and deleted in {}",
                    labels.ours, labels.theirs,
                ));
                self.conflicts.push(ConflictRecord {
                    path: path.to_owned(),
                    kind: ConflictKind::DeleteModify,
                    ancestor: base.cloned(),
                    ours: Some(our_record.clone()),
                    theirs: None,
                    marked: None,
                });
            }
            (None, Some(their_record)) => {
                self.keep(their_record);
                self.messages.push(format!(
                    "CONFLICT (modify/delete): {path} deleted in {} and modified in {}",
                    labels.ours, labels.theirs,
                ));
                self.conflicts.push(ConflictRecord {
                    path: path.to_owned(),
                    kind: ConflictKind::DeleteModify,
                    ancestor: base.cloned(),
                    ours: None,
                    theirs: Some(their_record.clone()),
                    marked: None,
                });
            }
            (Some(our_record), Some(their_record)) => {
                self.merge_both_present(path, base, our_record, their_record)?;
            }
        }
        Ok(())
    }

    fn merge_both_present(
        &mut self,
        path: &str,
        base: Option<&EntryRecord>,
        ours: &EntryRecord,
        theirs: &EntryRecord,
    ) -> MergeResult<()> {
        let labels = &self.options.labels;
        let file_types_match = ours.mode.is_file() && theirs.mode.is_file();
        let same_content =
            crate::diff::content_key(self.odb, ours)? == crate::diff::content_key(self.odb, theirs)?;

        if same_content {
            // Same content, different permissions: take the changed
            // permission if only one side moved, else flag it.
            let base_mode = base.map(|record| record.mode.without_fragments());
            let our_mode = ours.mode.without_fragments();
            let their_mode = theirs.mode.without_fragments();
            if Some(our_mode) == base_mode {
                self.keep(theirs);
            } else if Some(their_mode) == base_mode {
                self.keep(ours);
            } else {
                self.keep(ours);
                self.messages.push(format!(
                    "CONFLICT (mode): {path} has mode {our_mode} in {} and {their_mode} in {}",
                    labels.ours, labels.theirs,
                ));
                self.conflicts.push(ConflictRecord {
                    path: path.to_owned(),
                    kind: ConflictKind::Mode,
                    ancestor: base.cloned(),
                    ours: Some(ours.clone()),
                    theirs: Some(theirs.clone()),
                    marked: None,
                });
            }
            return Ok(());
        }

        let mergeable = file_types_match
            && !ours.mode.is_fragments()
            && !theirs.mode.is_fragments()
            && base.is_none_or(|record| !record.mode.is_fragments() && record.mode.is_file());
        if mergeable {
            let base_text = match base {
                Some(record) => self.odb.blob_bytes(&record.hash)?,
                None => Vec::new(),
            };
            let our_text = self.odb.blob_bytes(&ours.hash)?;
            let their_text = self.odb.blob_bytes(&theirs.hash)?;
            if !looks_binary(&base_text) && !looks_binary(&our_text) && !looks_binary(&their_text)
            {
                let merged = self
                    .options
                    .driver
                    .merge(&base_text, &our_text, &their_text, labels)?;
                let mode = if ours.mode == base.map_or(ours.mode, |record| record.mode) {
                    theirs.mode
                } else {
                    ours.mode
                };
                if !merged.had_conflict {
                    let hash = self.odb.put_bytes(&merged.content)?;
                    self.keep(&EntryRecord {
                        path: path.to_owned(),
                        mode,
                        hash,
                        size: merged.content.len() as u64,
                    });
                    return Ok(());
                }
                // Textual conflict: ours stays in the result tree; the
                // marker rendering is stored as a blob for the worktree.
                let marked_hash = self.odb.put_bytes(&merged.content)?;
                let marked = EntryRecord {
                    path: path.to_owned(),
                    mode,
                    hash: marked_hash,
                    size: merged.content.len() as u64,
                };
                self.keep(ours);
                let kind = if base.is_none() {
                    ConflictKind::AddAdd
                } else {
                    ConflictKind::Content
                };
                self.messages.push(format!(
                    "CONFLICT (content): merge conflict in {path}"
                ));
                self.conflicts.push(ConflictRecord {
                    path: path.to_owned(),
                    kind,
                    ancestor: base.cloned(),
                    ours: Some(ours.clone()),
                    theirs: Some(theirs.clone()),
                    marked: Some(marked),
                });
                return Ok(());
            }
        }

        // Binary, fragments or symlink on at least one side: no automerge.
        self.keep(ours);
        let kind = if base.is_none() {
            ConflictKind::AddAdd
        } else {
            ConflictKind::NoAutomerge
        };
        self.messages.push(format!(
            "CONFLICT ({}): cannot merge {path} automatically",
            if base.is_none() { "add/add" } else { "binary" },
        ));
        self.conflicts.push(ConflictRecord {
            path: path.to_owned(),
            kind,
            ancestor: base.cloned(),
            ours: Some(ours.clone()),
            theirs: Some(theirs.clone()),
            marked: None,
        });
        Ok(())
    }
}

fn same(
    odb: &ObjectDb,
    a: Option<&EntryRecord>,
    b: Option<&EntryRecord>,
) -> MergeResult<bool> {
    match (a, b) {
        (None, None) => Ok(true),
        (Some(_), None) | (None, Some(_)) => Ok(false),
        (Some(a), Some(b)) => {
            if a.mode.without_fragments() != b.mode.without_fragments() {
                return Ok(false);
            }
            if a.hash == b.hash {
                return Ok(true);
            }
            Ok(crate::diff::content_key(odb, a)? == crate::diff::content_key(odb, b)?)
        }
    }
}

/// Pairs deletes with inserts on one side's change list. Exact content
/// matches pair first; the rest pair greedily above the similarity
/// threshold.
fn detect_renames(
    odb: &ObjectDb,
    changes: &[crate::diff::Change],
    threshold: f64,
) -> MergeResult<Vec<Rename>> {
    let deletes: Vec<&EntryRecord> = changes
        .iter()
        .filter(|change| change.action == DiffAction::Delete)
        .filter_map(|change| change.from.as_ref())
        .collect();
    let inserts: Vec<&EntryRecord> = changes
        .iter()
        .filter(|change| change.action == DiffAction::Insert)
        .filter_map(|change| change.to.as_ref())
        .collect();
    if deletes.is_empty() || inserts.is_empty() {
        return Ok(vec![]);
    }

    let mut renames = Vec::new();
    let mut used_inserts: BTreeSet<&str> = BTreeSet::new();
    let mut unpaired_deletes = Vec::new();

    for delete in &deletes {
        let delete_key = crate::diff::content_key(odb, delete)?;
        let exact = inserts.iter().find(|insert| {
            !used_inserts.contains(insert.path.as_str())
                && crate::diff::content_key(odb, insert).is_ok_and(|key| key == delete_key)
        });
        if let Some(insert) = exact {
            used_inserts.insert(insert.path.as_str());
            renames.push(Rename {
                from: delete.path.clone(),
                to: insert.path.clone(),
            });
        } else {
            unpaired_deletes.push(*delete);
        }
    }

    // Similarity pass over whole blobs; fragmented entries only pair
    // exactly, their content is too large to scan here.
    for delete in unpaired_deletes {
        if delete.mode.is_fragments() {
            continue;
        }
        let delete_content = odb.blob_bytes(&delete.hash)?;
        let mut best: Option<(f64, &EntryRecord)> = None;
        for insert in &inserts {
            if used_inserts.contains(insert.path.as_str()) || insert.mode.is_fragments() {
                continue;
            }
            let insert_content = odb.blob_bytes(&insert.hash)?;
            let score = similarity(&delete_content, &insert_content);
            if score >= threshold && best.is_none_or(|(top, _)| score > top) {
                best = Some((score, insert));
            }
        }
        if let Some((_, insert)) = best {
            used_inserts.insert(insert.path.as_str());
            renames.push(Rename {
                from: delete.path.clone(),
                to: insert.path.clone(),
            });
        }
    }
    Ok(renames)
}

/// Shared-line ratio of two byte contents, in [0, 1].
fn similarity(a: &[u8], b: &[u8]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let count = |content: &[u8]| {
        let mut lines: BTreeMap<Vec<u8>, usize> = BTreeMap::new();
        for line in content.lines_with_terminator() {
            *lines.entry(line.to_vec()).or_default() += 1;
        }
        lines
    };
    let lines_a = count(a);
    let lines_b = count(b);
    let common: usize = lines_a
        .iter()
        .filter_map(|(line, n)| lines_b.get(line).map(|m| n.min(m)))
        .sum();
    let total: usize = lines_a.values().sum::<usize>() + lines_b.values().sum::<usize>();
    (2 * common) as f64 / total as f64
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

    fn tree_of(odb: &ObjectDb, files: &[(&str, &[u8])]) -> ObjectId {
        let records: Vec<EntryRecord> = files
            .iter()
            .map(|(path, content)| EntryRecord {
                path: (*path).to_owned(),
                mode: FileMode::REGULAR,
                hash: odb.put_bytes(content).unwrap(),
                size: content.len() as u64,
            })
            .collect();
        let mut sorted = records;
        sorted.sort_by(|a, b| a.path.cmp(&b.path));
        odb.write_records_as_tree(&sorted).unwrap()
    }

    fn options() -> MergeOptions<'static> {
        MergeOptions::new(MergeLabels {
            base: "base".to_owned(),
            ours: "HEAD".to_owned(),
            theirs: "b".to_owned(),
        })
    }

    fn run(
        odb: &ObjectDb,
        base: &ObjectId,
        ours: &ObjectId,
        theirs: &ObjectId,
    ) -> MergeOutcome {
        merge_tree(odb, &OpContext::background(), base, ours, theirs, &options()).unwrap()
    }

    #[test]
    fn test_merge_identity_laws() {
        let (_dir, odb) = new_odb();
        let o = tree_of(&odb, &[("a.txt", b"a\n"), ("dir/b.txt", b"b\n")]);
        let a = tree_of(&odb, &[("a.txt", b"a2\n"), ("dir/b.txt", b"b\n")]);
        let b = tree_of(&odb, &[("a.txt", b"a\n"), ("dir/b.txt", b"b2\n")]);

        assert_eq!(run(&odb, &o, &o, &o).tree, o);
        assert_eq!(run(&odb, &o, &a, &o).tree, a);
        assert_eq!(run(&odb, &o, &o, &b).tree, b);
    }

    #[test]
    fn test_disjoint_edits_merge_clean() {
        let (_dir, odb) = new_odb();
        let base = tree_of(&odb, &[("a.txt", b"a\n"), ("b.txt", b"b\n")]);
        let ours = tree_of(&odb, &[("a.txt", b"A\n"), ("b.txt", b"b\n")]);
        let theirs = tree_of(&odb, &[("a.txt", b"a\n"), ("b.txt", b"B\n")]);

        let outcome = run(&odb, &base, &ours, &theirs);
        assert!(outcome.is_clean());
        let expected = tree_of(&odb, &[("a.txt", b"A\n"), ("b.txt", b"B\n")]);
        assert_eq!(outcome.tree, expected);
    }

    #[test]
    fn test_text_conflict_records_stages_and_markers() {
        let (_dir, odb) = new_odb();
        let base = tree_of(&odb, &[("a.txt", b"A\n")]);
        let ours = tree_of(&odb, &[("a.txt", b"C\n")]);
        let theirs = tree_of(&odb, &[("a.txt", b"B\n")]);

        let outcome = run(&odb, &base, &ours, &theirs);
        assert_eq!(outcome.conflicts.len(), 1);
        let conflict = &outcome.conflicts[0];
        assert_eq!(conflict.path, "a.txt");
        assert_eq!(conflict.kind, ConflictKind::Content);
        assert!(conflict.ancestor.is_some());
        assert!(conflict.ours.is_some());
        assert!(conflict.theirs.is_some());

        let marked = conflict.marked.as_ref().unwrap();
        let content = odb.blob_bytes(&marked.hash).unwrap();
        let text = String::from_utf8(content).unwrap();
        assert!(text.starts_with("<<<<<<< HEAD\n"));
        assert!(text.contains("=======\n"));
        assert!(text.ends_with(">>>>>>> b\n"));
    }

    #[test]
    fn test_identical_insert_takes_either() {
        let (_dir, odb) = new_odb();
        let base = tree_of(&odb, &[]);
        let ours = tree_of(&odb, &[("new.txt", b"same\n")]);
        let theirs = tree_of(&odb, &[("new.txt", b"same\n")]);
        let outcome = run(&odb, &base, &ours, &theirs);
        assert!(outcome.is_clean());
        assert_eq!(outcome.tree, ours);
    }

    #[test]
    fn test_add_add_different_content_merges_or_conflicts() {
        let (_dir, odb) = new_odb();
        let base = tree_of(&odb, &[]);
        let ours = tree_of(&odb, &[("new.txt", b"mine\n")]);
        let theirs = tree_of(&odb, &[("new.txt", b"yours\n")]);
        let outcome = run(&odb, &base, &ours, &theirs);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].kind, ConflictKind::AddAdd);
        assert!(outcome.conflicts[0].ancestor.is_none());
    }

    #[test]
    fn test_delete_modify_keeps_modified_side() {
        let (_dir, odb) = new_odb();
        let base = tree_of(&odb, &[("a.txt", b"a\n"), ("keep.txt", b"k\n")]);
        let ours = tree_of(&odb, &[("keep.txt", b"k\n")]);
        let theirs = tree_of(&odb, &[("a.txt", b"modified\n"), ("keep.txt", b"k\n")]);

        let outcome = run(&odb, &base, &ours, &theirs);
        assert_eq!(outcome.conflicts.len(), 1);
        let conflict = &outcome.conflicts[0];
        assert_eq!(conflict.kind, ConflictKind::DeleteModify);
        assert!(conflict.ours.is_none());
        assert!(conflict.theirs.is_some());
        // The modified side's content is kept in the result tree.
        let tree = odb.tree(&outcome.tree).unwrap();
        assert!(tree.entry("a.txt").is_some());
    }

    #[test]
    fn test_binary_conflict_no_automerge() {
        let (_dir, odb) = new_odb();
        let base = tree_of(&odb, &[("blob.bin", b"\x00base")]);
        let ours = tree_of(&odb, &[("blob.bin", b"\x00ours")]);
        let theirs = tree_of(&odb, &[("blob.bin", b"\x00theirs")]);

        let outcome = run(&odb, &base, &ours, &theirs);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].kind, ConflictKind::NoAutomerge);
        assert!(outcome.conflicts[0].marked.is_none());
    }

    #[test]
    fn test_clean_rename_plus_edit_follows_content() {
        let (_dir, odb) = new_odb();
        let content = b"line one\nline two\nline three\n";
        let base = tree_of(&odb, &[("old.txt", content)]);
        // Ours renames without content change; theirs edits in place.
        let ours = tree_of(&odb, &[("new.txt", content)]);
        let theirs = tree_of(&odb, &[("old.txt", b"line one\nline 2\nline three\n")]);

        let outcome = run(&odb, &base, &ours, &theirs);
        assert!(outcome.is_clean(), "messages: {:?}", outcome.messages);
        let tree = odb.tree(&outcome.tree).unwrap();
        assert!(tree.entry("old.txt").is_none());
        let entry = tree.entry("new.txt").unwrap();
        assert_eq!(
            odb.blob_bytes(&entry.hash).unwrap(),
            b"line one\nline 2\nline three\n"
        );
    }

    #[test]
    fn test_rename_rename_conflict() {
        let (_dir, odb) = new_odb();
        let content = b"shared content\n";
        let base = tree_of(&odb, &[("orig.txt", content)]);
        let ours = tree_of(&odb, &[("ours.txt", content)]);
        let theirs = tree_of(&odb, &[("theirs.txt", content)]);

        let outcome = run(&odb, &base, &ours, &theirs);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].kind, ConflictKind::RenameRename);
        let tree = odb.tree(&outcome.tree).unwrap();
        assert!(tree.entry("ours.txt").is_some());
        assert!(tree.entry("theirs.txt").is_some());
        assert!(tree.entry("orig.txt").is_none());
    }

    #[test]
    fn test_replay_determinism() {
        let (_dir, odb) = new_odb();
        let base = tree_of(&odb, &[("a.txt", b"one\ntwo\n"), ("b.txt", b"x\n")]);
        let ours = tree_of(&odb, &[("a.txt", b"ONE\ntwo\n"), ("b.txt", b"x\n")]);
        let theirs = tree_of(&odb, &[("a.txt", b"one\nTWO\n"), ("c.txt", b"x\n")]);

        let first = run(&odb, &base, &ours, &theirs);
        let second = run(&odb, &base, &ours, &theirs);
        assert_eq!(first.tree, second.tree);
        assert_eq!(first.conflicts, second.conflicts);
    }

    #[test]
    fn test_similarity() {
        assert_eq!(similarity(b"a\nb\nc\n", b"a\nb\nc\n"), 1.0);
        assert!(similarity(b"a\nb\nc\nd\n", b"a\nb\nc\nx\n") >= 0.5);
        assert!(similarity(b"a\n", b"z\n") < 0.5);
    }

    #[test]
    fn test_write_records_as_tree_matches_encoded_tree() {
        let (_dir, odb) = new_odb();
        let blob = odb.put_bytes(b"x\n").unwrap();
        let sub = odb
            .put_encoded(&Object::Tree(Tree::from_entries(vec![TreeEntry::new(
                "inner.txt",
                FileMode::REGULAR,
                blob,
                2,
            )])))
            .unwrap();
        let expected = odb
            .put_encoded(&Object::Tree(Tree::from_entries(vec![
                TreeEntry::new("top.txt", FileMode::REGULAR, blob, 2),
                TreeEntry::new("dir", FileMode::DIR, sub, 0),
            ])))
            .unwrap();
        let records = vec![
            EntryRecord {
                path: "dir/inner.txt".to_owned(),
                mode: FileMode::REGULAR,
                hash: blob,
                size: 2,
            },
            EntryRecord {
                path: "top.txt".to_owned(),
                mode: FileMode::REGULAR,
                hash: blob,
                size: 2,
            },
        ];
        assert_eq!(odb.write_records_as_tree(&records).unwrap(), expected);
    }
}
