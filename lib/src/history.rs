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

//! Multi-commit history operations: merge, rebase, cherry-pick, revert and
//! stash.
//!
//! A conflict never unwinds silently: the operation persists its replay
//! metadata (`MERGE_HEAD`, `REBASE_MD` or `REPLAY_MD`), leaves the worktree
//! in the documented partially-applied state and reports `HasConflicts`.
//! The metadata files form a single-slot state machine: starting a new
//! operation while a slot is occupied fails `ReplayInProgress`, and
//! continue/abort with an empty slot fails `NoReplayInProgress`.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

use crate::diff::DiffAction;
use crate::file_util::PathError;
use crate::file_util::write_atomically;
use crate::filemerge::MergeLabels;
use crate::hash::ObjectId;
use crate::index::IndexBuilder;
use crate::index::IndexEntry;
use crate::index::Stage;
use crate::merge::ConflictRecord;
use crate::merge::MergeError;
use crate::merge::MergeOptions;
use crate::merge::MergeOutcome;
use crate::merge::merge_tree;
use crate::object::Commit;
use crate::object::Object;
use crate::object::Signature;
use crate::odb::EntryRecord;
use crate::odb::ObjectDb;
use crate::odb::OdbError;
use crate::op_context::CancelledError;
use crate::op_context::OpContext;
use crate::refs::RefDb;
use crate::refs::RefError;
use crate::refs::Reference;
use crate::refs::STASH_REF;
use crate::revwalk;
use crate::worktree::CheckoutOptions;
use crate::worktree::ResetMode;
use crate::worktree::Worktree;
use crate::worktree::WorktreeError;

pub const REBASE_MD: &str = "REBASE_MD";
pub const REPLAY_MD: &str = "REPLAY_MD";
pub const MERGE_MSG: &str = "MERGE_MSG";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Another operation is in progress; finish or abort it first")]
    ReplayInProgress,
    #[error("No operation in progress")]
    NoReplayInProgress,
    #[error("Merge produced {} conflicted path(s)", conflicts.len())]
    HasConflicts { conflicts: Vec<ConflictRecord> },
    #[error("Cannot continue with unresolved conflicts in the index")]
    UnresolvedConflicts,
    #[error("Refusing to merge unrelated histories")]
    UnrelatedHistories,
    #[error("Cannot fast-forward")]
    FastForwardImpossible,
    #[error("No local changes to stash")]
    NothingToStash,
    #[error("Cannot operate on an unborn branch")]
    UnbornHead,
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Odb(#[from] OdbError),
    #[error(transparent)]
    Ref(#[from] RefError),
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
    #[error("Replay metadata I/O error")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("Malformed replay metadata: {0}")]
    CorruptMetadata(String),
}

pub type HistoryResult<T> = Result<T, HistoryError>;

/// Fast-forward policy for merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FfMode {
    /// Fast-forward when possible, merge otherwise.
    #[default]
    Auto,
    /// Only fast-forward; fail if a real merge would be needed.
    Only,
    /// Always create a merge commit.
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStatus {
    AlreadyUpToDate,
    FastForward(ObjectId),
    Created(ObjectId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseStatus {
    AlreadyUpToDate,
    FastForward(ObjectId),
    Done(ObjectId),
}

/// On-disk rebase state, serialized as TOML while a rebase is stopped on a
/// conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RebaseMetadata {
    /// The original tip being rebased.
    pub rebase_head: ObjectId,
    /// The commit the series is being replayed onto.
    pub onto: ObjectId,
    /// The commit whose replay produced the conflict.
    pub stopped: ObjectId,
    /// The last commit already written on the new line.
    pub last: ObjectId,
    /// The partial merged tree checked out at the stop.
    pub merge_tree: ObjectId,
    /// Branch to move when the rebase finishes.
    pub head_branch: Option<String>,
}

/// Which single-commit replay is stopped on a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplayKind {
    Pick,
    Revert,
}

/// On-disk cherry-pick/revert state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReplayMetadata {
    pub kind: ReplayKind,
    /// HEAD when the replay started.
    pub base: ObjectId,
    /// The commit being picked or reverted.
    pub last: ObjectId,
    pub merge_tree: ObjectId,
    pub head_branch: Option<String>,
}

/// History operations over one repository's components.
pub struct History<'a> {
    pub odb: &'a ObjectDb,
    pub refdb: &'a RefDb,
    pub worktree: &'a Worktree,
    pub dot_dir: PathBuf,
    pub shallow: Option<ObjectId>,
}

impl History<'_> {
    fn slot_path(&self, name: &str) -> PathBuf {
        self.dot_dir.join(name)
    }

    fn merge_head_path(&self) -> PathBuf {
        self.slot_path(crate::refs::MERGE_HEAD_NAME)
    }

    /// Fails unless every replay slot is empty.
    fn check_slot_empty(&self) -> HistoryResult<()> {
        for name in [crate::refs::MERGE_HEAD_NAME, REBASE_MD, REPLAY_MD] {
            if self.slot_path(name).exists() {
                return Err(HistoryError::ReplayInProgress);
            }
        }
        Ok(())
    }

    fn head_id(&self) -> HistoryResult<ObjectId> {
        self.worktree
            .head_commit()?
            .map(|(id, _)| id)
            .ok_or(HistoryError::UnbornHead)
    }

    fn read_metadata<T: for<'de> Deserialize<'de>>(&self, name: &str) -> HistoryResult<T> {
        let text = match fs::read_to_string(self.slot_path(name)) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(HistoryError::NoReplayInProgress);
            }
            Err(err) => return Err(err.into()),
        };
        toml::from_str(&text).map_err(|err| HistoryError::CorruptMetadata(err.to_string()))
    }

    fn write_metadata<T: Serialize>(&self, name: &str, metadata: &T) -> HistoryResult<()> {
        let text = toml::to_string_pretty(metadata)
            .map_err(|err| HistoryError::CorruptMetadata(err.to_string()))?;
        write_atomically(&self.slot_path(name), text.as_bytes())?;
        Ok(())
    }

    fn clear_slot(&self, name: &str) -> HistoryResult<()> {
        match fs::remove_file(self.slot_path(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Checks out a merge result: stage-0 state from the result tree,
    /// conflict stages 1/2/3, and marker content in the worktree where the
    /// merge driver produced it.
    fn materialize_outcome(&self, ctx: &OpContext, outcome: &MergeOutcome) -> HistoryResult<()> {
        self.worktree
            .checkout(ctx, &outcome.tree, CheckoutOptions::default())?;
        if outcome.conflicts.is_empty() {
            return Ok(());
        }
        let index = self.worktree.index()?;
        let mut builder = IndexBuilder::new();
        for conflict in &outcome.conflicts {
            let mut stage_entry = |record: &Option<EntryRecord>, stage: Stage| {
                if let Some(record) = record {
                    let mut entry = IndexEntry::from_tree(
                        conflict.path.clone(),
                        record.mode,
                        record.hash,
                        record.size,
                    );
                    entry.stage = stage;
                    builder.set(entry);
                }
            };
            stage_entry(&conflict.ancestor, Stage::Ancestor);
            stage_entry(&conflict.ours, Stage::Ours);
            stage_entry(&conflict.theirs, Stage::Theirs);
            if let Some(marked) = &conflict.marked {
                self.write_conflict_file(ctx, marked)?;
            }
        }
        self.worktree.store_index(&builder.write(&index))?;
        Ok(())
    }

    fn write_conflict_file(&self, _ctx: &OpContext, marked: &EntryRecord) -> HistoryResult<()> {
        let content = self.odb.blob_bytes(&marked.hash)?;
        let disk_path = self.worktree.root().join(&marked.path);
        if let Some(parent) = disk_path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomically(&disk_path, &content)?;
        Ok(())
    }

    fn merge_labels(&self, theirs: &str) -> MergeLabels {
        MergeLabels {
            base: "merged common ancestors".to_owned(),
            ours: "HEAD".to_owned(),
            theirs: theirs.to_owned(),
        }
    }

    /// Merges `target` (labelled `target_label` on conflict markers) into
    /// HEAD.
    #[instrument(skip(self, ctx, signature))]
    pub fn merge(
        &self,
        ctx: &OpContext,
        target: ObjectId,
        target_label: &str,
        ff: FfMode,
        message: Option<String>,
        signature: &Signature,
    ) -> HistoryResult<MergeStatus> {
        self.check_slot_empty()?;
        let head = self.head_id()?;

        if revwalk::is_ancestor(self.odb, ctx, &target, &head, self.shallow)? {
            return Ok(MergeStatus::AlreadyUpToDate);
        }
        if revwalk::is_fast_forward(self.odb, ctx, &head, &target, self.shallow)? {
            if ff == FfMode::Never {
                // Fall through to a real merge commit below.
            } else {
                let tree = self.odb.commit(&target)?.tree;
                self.worktree.checkout(ctx, &tree, CheckoutOptions::default())?;
                self.move_branch(&head, &target, signature, &format!("merge: fast-forward to {target_label}"))?;
                return Ok(MergeStatus::FastForward(target));
            }
        } else if ff == FfMode::Only {
            return Err(HistoryError::FastForwardImpossible);
        }

        let base = revwalk::merge_base(self.odb, ctx, &head, &target, self.shallow)?
            .ok_or(HistoryError::UnrelatedHistories)?;
        let base_tree = self.odb.commit(&base)?.tree;
        let head_tree = self.odb.commit(&head)?.tree;
        let target_tree = self.odb.commit(&target)?.tree;

        let options = MergeOptions::new(self.merge_labels(target_label));
        let outcome = merge_tree(self.odb, ctx, &base_tree, &head_tree, &target_tree, &options)?;

        let message = message.unwrap_or_else(|| format!("Merge {target_label} into HEAD"));
        if outcome.is_clean() {
            let id = self.write_merge_commit(&outcome.tree, &[head, target], &message, signature)?;
            self.move_branch(&head, &id, signature, &format!("merge: {target_label}"))?;
            self.worktree
                .checkout(ctx, &outcome.tree, CheckoutOptions::default())?;
            return Ok(MergeStatus::Created(id));
        }

        // Conflicted: persist the slot, stage the conflicts and report.
        self.refdb.force_update(&Reference::Hash {
            name: crate::refs::MERGE_HEAD_NAME.to_owned(),
            target,
        })?;
        fs::write(self.slot_path(MERGE_MSG), &message)?;
        self.materialize_outcome(ctx, &outcome)?;
        Err(HistoryError::HasConflicts {
            conflicts: outcome.conflicts,
        })
    }

    /// Concludes a conflicted merge from the resolved index.
    pub fn merge_continue(
        &self,
        ctx: &OpContext,
        message: Option<String>,
        signature: &Signature,
    ) -> HistoryResult<ObjectId> {
        let merge_head = match self.refdb.reference(crate::refs::MERGE_HEAD_NAME) {
            Ok(reference) => reference.hash_target().expect("MERGE_HEAD is a hash ref"),
            Err(RefError::NotFound(_)) => return Err(HistoryError::NoReplayInProgress),
            Err(err) => return Err(err.into()),
        };
        if self.worktree.index()?.has_conflicts() {
            return Err(HistoryError::UnresolvedConflicts);
        }
        let head = self.head_id()?;
        let message = match message {
            Some(message) => message,
            None => fs::read_to_string(self.slot_path(MERGE_MSG))
                .unwrap_or_else(|_| "Merge".to_owned()),
        };

        let tree = self.worktree.write_index_as_tree(ctx, Some(self.odb.commit(&head)?.tree))?;
        let id = self.write_merge_commit(&tree, &[head, merge_head], &message, signature)?;
        self.move_branch(&head, &id, signature, "merge: continued")?;
        self.refdb.remove(crate::refs::MERGE_HEAD_NAME, None)?;
        self.clear_slot(MERGE_MSG)?;
        Ok(id)
    }

    /// Abandons a conflicted merge and restores the pre-merge state.
    pub fn merge_abort(&self, ctx: &OpContext, signature: &Signature) -> HistoryResult<()> {
        if !self.merge_head_path().exists() {
            return Err(HistoryError::NoReplayInProgress);
        }
        let head = self.head_id()?;
        self.worktree.reset(ctx, ResetMode::Hard, &head, signature)?;
        self.refdb.remove(crate::refs::MERGE_HEAD_NAME, None)?;
        self.clear_slot(MERGE_MSG)?;
        Ok(())
    }

    fn write_merge_commit(
        &self,
        tree: &ObjectId,
        parents: &[ObjectId],
        message: &str,
        signature: &Signature,
    ) -> HistoryResult<ObjectId> {
        let commit = Commit {
            tree: *tree,
            parents: parents.iter().copied().collect(),
            author: signature.clone(),
            committer: signature.clone(),
            message: message.to_owned(),
            extra_headers: vec![],
        };
        Ok(self.odb.put_encoded(&Object::Commit(commit))?)
    }

    fn move_branch(
        &self,
        old: &ObjectId,
        new: &ObjectId,
        signature: &Signature,
        log_message: &str,
    ) -> HistoryResult<()> {
        match self.refdb.head()? {
            Reference::Symbolic { target: branch, .. } => {
                let expected = Reference::Hash {
                    name: branch.clone(),
                    target: *old,
                };
                let new_ref = Reference::Hash {
                    name: branch.clone(),
                    target: *new,
                };
                self.refdb.update(&new_ref, Some(&expected))?;
                self.refdb
                    .append_log(&branch, *old, *new, signature, log_message)?;
            }
            Reference::Hash { .. } => {
                self.refdb.force_update(&Reference::Hash {
                    name: crate::refs::HEAD_NAME.to_owned(),
                    target: *new,
                })?;
                self.refdb
                    .append_log(crate::refs::HEAD_NAME, *old, *new, signature, log_message)?;
            }
        }
        Ok(())
    }

    /// Replays `base..HEAD` onto `onto`, stopping on the first conflict.
    #[instrument(skip(self, ctx, signature))]
    pub fn rebase(
        &self,
        ctx: &OpContext,
        onto: ObjectId,
        signature: &Signature,
    ) -> HistoryResult<RebaseStatus> {
        self.check_slot_empty()?;
        let ours = self.head_id()?;

        if revwalk::is_ancestor(self.odb, ctx, &onto, &ours, self.shallow)? {
            return Ok(RebaseStatus::AlreadyUpToDate);
        }
        if revwalk::is_ancestor(self.odb, ctx, &ours, &onto, self.shallow)? {
            let tree = self.odb.commit(&onto)?.tree;
            self.worktree.checkout(ctx, &tree, CheckoutOptions::default())?;
            self.move_branch(&ours, &onto, signature, "rebase: fast-forward")?;
            return Ok(RebaseStatus::FastForward(onto));
        }

        let base = revwalk::merge_base(self.odb, ctx, &ours, &onto, self.shallow)?
            .ok_or(HistoryError::UnrelatedHistories)?;
        let mut todo: Vec<(ObjectId, std::sync::Arc<Commit>)> =
            revwalk::walk_range(self.odb, ctx, &[base], &[ours], self.shallow)?;
        todo.retain(|(_, commit)| !commit.is_merge());
        todo.reverse();

        self.replay_commits(ctx, ours, onto, base, todo, onto, signature)
    }

    #[expect(clippy::too_many_arguments)]
    fn replay_commits(
        &self,
        ctx: &OpContext,
        rebase_head: ObjectId,
        onto: ObjectId,
        base: ObjectId,
        todo: Vec<(ObjectId, std::sync::Arc<Commit>)>,
        mut last: ObjectId,
        signature: &Signature,
    ) -> HistoryResult<RebaseStatus> {
        let base_tree = self.odb.commit(&base)?.tree;
        for (commit_id, commit) in todo {
            ctx.check()?;
            let current_tree = self.odb.commit(&last)?.tree;
            let options = MergeOptions::new(self.merge_labels(commit.subject()));
            let outcome = merge_tree(
                self.odb,
                ctx,
                &base_tree,
                &current_tree,
                &commit.tree,
                &options,
            )?;
            if !outcome.is_clean() {
                let branch = self.refdb.current_branch()?;
                self.write_metadata(
                    REBASE_MD,
                    &RebaseMetadata {
                        rebase_head,
                        onto,
                        stopped: commit_id,
                        last,
                        merge_tree: outcome.tree,
                        head_branch: branch,
                    },
                )?;
                self.materialize_outcome(ctx, &outcome)?;
                return Err(HistoryError::HasConflicts {
                    conflicts: outcome.conflicts,
                });
            }
            last = self.replay_one(&outcome.tree, &commit, last, signature)?;
        }

        self.worktree
            .checkout(ctx, &self.odb.commit(&last)?.tree, CheckoutOptions::default())?;
        self.move_branch(&rebase_head, &last, signature, "rebase: finished")?;
        Ok(RebaseStatus::Done(last))
    }

    fn replay_one(
        &self,
        tree: &ObjectId,
        original: &Commit,
        parent: ObjectId,
        signature: &Signature,
    ) -> HistoryResult<ObjectId> {
        let commit = Commit {
            tree: *tree,
            parents: [parent].into_iter().collect(),
            author: original.author.clone(),
            committer: signature.clone(),
            message: original.message.clone(),
            extra_headers: vec![],
        };
        Ok(self.odb.put_encoded(&Object::Commit(commit))?)
    }

    /// Continues a stopped rebase: the resolved index becomes the stopped
    /// commit's new tree, then the remaining commits replay.
    pub fn rebase_continue(
        &self,
        ctx: &OpContext,
        signature: &Signature,
    ) -> HistoryResult<RebaseStatus> {
        let metadata: RebaseMetadata = self.read_metadata(REBASE_MD)?;
        if self.worktree.index()?.has_conflicts() {
            return Err(HistoryError::UnresolvedConflicts);
        }
        let stopped = self.odb.commit(&metadata.stopped)?;
        let tree = self
            .worktree
            .write_index_as_tree(ctx, Some(metadata.merge_tree))?;
        let new_last = self.replay_one(&tree, &stopped, metadata.last, signature)?;

        let mut todo =
            revwalk::walk_range(self.odb, ctx, &[metadata.stopped], &[metadata.rebase_head], self.shallow)?;
        todo.retain(|(_, commit)| !commit.is_merge());
        todo.reverse();

        self.clear_slot(REBASE_MD)?;
        let base = revwalk::merge_base(self.odb, ctx, &metadata.rebase_head, &metadata.onto, self.shallow)?
            .ok_or(HistoryError::UnrelatedHistories)?;
        self.replay_commits(
            ctx,
            metadata.rebase_head,
            metadata.onto,
            base,
            todo,
            new_last,
            signature,
        )
    }

    /// Abandons a stopped rebase and hard-resets to the original tip.
    pub fn rebase_abort(&self, ctx: &OpContext, signature: &Signature) -> HistoryResult<()> {
        let metadata: RebaseMetadata = self.read_metadata(REBASE_MD)?;
        self.worktree
            .reset(ctx, ResetMode::Hard, &metadata.rebase_head, signature)?;
        self.clear_slot(REBASE_MD)
    }

    /// Applies one commit's change on top of HEAD.
    #[instrument(skip(self, ctx, signature))]
    pub fn cherry_pick(
        &self,
        ctx: &OpContext,
        target: ObjectId,
        signature: &Signature,
    ) -> HistoryResult<ObjectId> {
        self.replay_single(ctx, target, ReplayKind::Pick, signature)
    }

    /// Applies the inverse of one commit's change on top of HEAD.
    #[instrument(skip(self, ctx, signature))]
    pub fn revert(
        &self,
        ctx: &OpContext,
        target: ObjectId,
        signature: &Signature,
    ) -> HistoryResult<ObjectId> {
        self.replay_single(ctx, target, ReplayKind::Revert, signature)
    }

    fn replay_single(
        &self,
        ctx: &OpContext,
        target: ObjectId,
        kind: ReplayKind,
        signature: &Signature,
    ) -> HistoryResult<ObjectId> {
        self.check_slot_empty()?;
        let head = self.head_id()?;
        let head_tree = self.odb.commit(&head)?.tree;
        let picked = self.odb.commit(&target)?;
        let parent_tree = match picked.parents.first() {
            Some(parent) => self.odb.commit(parent)?.tree,
            None => self.odb.write_records_as_tree(&[])?,
        };

        // Pick merges the commit's diff in; revert swaps the pair to take
        // the diff out.
        let (base_tree, their_tree) = match kind {
            ReplayKind::Pick => (parent_tree, picked.tree),
            ReplayKind::Revert => (picked.tree, parent_tree),
        };
        let label = match kind {
            ReplayKind::Pick => picked.subject().to_owned(),
            ReplayKind::Revert => format!("revert of {}", picked.subject()),
        };
        let options = MergeOptions::new(self.merge_labels(&label));
        let outcome = merge_tree(self.odb, ctx, &base_tree, &head_tree, &their_tree, &options)?;

        if !outcome.is_clean() {
            let branch = self.refdb.current_branch()?;
            self.write_metadata(
                REPLAY_MD,
                &ReplayMetadata {
                    kind,
                    base: head,
                    last: target,
                    merge_tree: outcome.tree,
                    head_branch: branch,
                },
            )?;
            self.materialize_outcome(ctx, &outcome)?;
            return Err(HistoryError::HasConflicts {
                conflicts: outcome.conflicts,
            });
        }

        self.worktree
            .checkout(ctx, &outcome.tree, CheckoutOptions::default())?;
        let id = self.finish_replay_commit(&outcome.tree, &picked, kind, head, signature)?;
        Ok(id)
    }

    fn finish_replay_commit(
        &self,
        tree: &ObjectId,
        picked: &Commit,
        kind: ReplayKind,
        head: ObjectId,
        signature: &Signature,
    ) -> HistoryResult<ObjectId> {
        let (author, message) = match kind {
            ReplayKind::Pick => (picked.author.clone(), picked.message.clone()),
            ReplayKind::Revert => (
                signature.clone(),
                format!("Revert \"{}\"\n", picked.subject()),
            ),
        };
        let commit = Commit {
            tree: *tree,
            parents: [head].into_iter().collect(),
            author,
            committer: signature.clone(),
            message,
            extra_headers: vec![],
        };
        let id = self.odb.put_encoded(&Object::Commit(commit))?;
        let log = match kind {
            ReplayKind::Pick => "cherry-pick",
            ReplayKind::Revert => "revert",
        };
        self.move_branch(&head, &id, signature, log)?;
        Ok(id)
    }

    /// Concludes a conflicted cherry-pick or revert.
    pub fn replay_continue(
        &self,
        ctx: &OpContext,
        signature: &Signature,
    ) -> HistoryResult<ObjectId> {
        let metadata: ReplayMetadata = self.read_metadata(REPLAY_MD)?;
        if self.worktree.index()?.has_conflicts() {
            return Err(HistoryError::UnresolvedConflicts);
        }
        let picked = self.odb.commit(&metadata.last)?;
        let tree = self
            .worktree
            .write_index_as_tree(ctx, Some(metadata.merge_tree))?;
        let head = self.head_id()?;
        let id = self.finish_replay_commit(&tree, &picked, metadata.kind, head, signature)?;
        self.worktree
            .checkout(ctx, &self.odb.commit(&id)?.tree, CheckoutOptions::default())?;
        self.clear_slot(REPLAY_MD)?;
        Ok(id)
    }

    /// Abandons a conflicted cherry-pick or revert.
    pub fn replay_abort(&self, ctx: &OpContext, signature: &Signature) -> HistoryResult<()> {
        let metadata: ReplayMetadata = self.read_metadata(REPLAY_MD)?;
        self.worktree
            .reset(ctx, ResetMode::Hard, &metadata.base, signature)?;
        self.clear_slot(REPLAY_MD)
    }

    /// Saves the index and worktree state as two stash commits and resets
    /// the worktree clean.
    #[instrument(skip(self, ctx, signature))]
    pub fn stash_push(
        &self,
        ctx: &OpContext,
        include_untracked: bool,
        signature: &Signature,
    ) -> HistoryResult<ObjectId> {
        let head = self.head_id()?;
        let head_tree = self.odb.commit(&head)?.tree;
        let status = self.worktree.status(ctx)?;
        if status.staging.is_empty() && status.worktree.is_empty() {
            return Err(HistoryError::NothingToStash);
        }
        let branch = self
            .refdb
            .current_branch()?
            .unwrap_or_else(|| "(detached)".to_owned());

        // First commit: the index as staged.
        let index_tree = self.worktree.write_index_as_tree(ctx, Some(head_tree))?;
        let index_commit = self.odb.put_encoded(&Object::Commit(Commit {
            tree: index_tree,
            parents: [head].into_iter().collect(),
            author: signature.clone(),
            committer: signature.clone(),
            message: format!("index on {branch}"),
            extra_headers: vec![],
        }))?;

        // Second commit: the worktree, auto-staging modified and deleted
        // paths (plus untracked when asked).
        self.worktree.add(ctx, &[])?;
        let mut pruned_untracked = Vec::new();
        if !include_untracked {
            for change in &status.worktree {
                if change.action == DiffAction::Insert {
                    pruned_untracked.push(change.path().to_owned());
                }
            }
        }
        let mut worktree_index = self.worktree.index()?;
        if !pruned_untracked.is_empty() {
            let mut builder = IndexBuilder::new();
            for path in &pruned_untracked {
                builder.remove(path.clone());
            }
            worktree_index = builder.write(&worktree_index);
            self.worktree.store_index(&worktree_index)?;
        }
        let worktree_tree = self.worktree.write_index_as_tree(ctx, Some(head_tree))?;
        let stash_commit = self.odb.put_encoded(&Object::Commit(Commit {
            tree: worktree_tree,
            parents: [head, index_commit].into_iter().collect(),
            author: signature.clone(),
            committer: signature.clone(),
            message: format!("WIP on {branch}"),
            extra_headers: vec![],
        }))?;

        let old = match self.refdb.reference(STASH_REF) {
            Ok(reference) => reference.hash_target().unwrap_or(ObjectId::ZERO),
            Err(RefError::NotFound(_)) => ObjectId::ZERO,
            Err(err) => return Err(err.into()),
        };
        self.refdb.force_update(&Reference::Hash {
            name: STASH_REF.to_owned(),
            target: stash_commit,
        })?;
        self.refdb
            .append_log(STASH_REF, old, stash_commit, signature, &format!("WIP on {branch}"))?;

        // Leave a clean worktree behind.
        self.worktree.reset(ctx, ResetMode::Hard, &head, signature)?;
        Ok(stash_commit)
    }

    /// Applies the top stash onto the current worktree.
    pub fn stash_apply(&self, ctx: &OpContext) -> HistoryResult<()> {
        let stash_commit = match self.refdb.reference(STASH_REF) {
            Ok(reference) => reference.hash_target().expect("stash ref is a hash ref"),
            Err(RefError::NotFound(_)) => return Err(HistoryError::NoReplayInProgress),
            Err(err) => return Err(err.into()),
        };
        let stash = self.odb.commit(&stash_commit)?;
        let stash_base = stash
            .parents
            .first()
            .copied()
            .ok_or_else(|| HistoryError::CorruptMetadata("stash commit has no parents".into()))?;
        let head = self.head_id()?;
        let head_tree = self.odb.commit(&head)?.tree;
        let base_tree = self.odb.commit(&stash_base)?.tree;

        let options = MergeOptions::new(self.merge_labels("stashed changes"));
        let outcome = merge_tree(self.odb, ctx, &base_tree, &head_tree, &stash.tree, &options)?;
        self.materialize_outcome(ctx, &outcome)?;
        if outcome.is_clean() {
            Ok(())
        } else {
            Err(HistoryError::HasConflicts {
                conflicts: outcome.conflicts,
            })
        }
    }

    /// Applies the top stash and drops it from the stack on success.
    pub fn stash_pop(&self, ctx: &OpContext) -> HistoryResult<()> {
        self.stash_apply(ctx)?;
        self.stash_drop()
    }

    /// Removes the top stash entry and its reflog record.
    pub fn stash_drop(&self) -> HistoryResult<()> {
        let mut log = self.refdb.read_log(STASH_REF)?;
        if log.entries.is_empty() {
            return Err(HistoryError::NoReplayInProgress);
        }
        log.entries.pop();
        match log.entries.last() {
            Some(previous) => {
                self.refdb.force_update(&Reference::Hash {
                    name: STASH_REF.to_owned(),
                    target: previous.new,
                })?;
                self.refdb.write_log(&log)?;
            }
            None => {
                self.refdb.remove(STASH_REF, None)?;
                self.refdb.delete_log(STASH_REF)?;
            }
        }
        Ok(())
    }
}

/// Whether any replay slot is occupied under `dot_dir`.
pub fn replay_in_progress(dot_dir: &Path) -> bool {
    [crate::refs::MERGE_HEAD_NAME, REBASE_MD, REPLAY_MD]
        .iter()
        .any(|name| dot_dir.join(name).exists())
}
