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

//! The worktree engine: status, checkout, reset, add and commit.
//!
//! Files are materialized through a temp sibling and an atomic rename, so a
//! crash mid-checkout never leaves a half-written tracked file. Content that
//! cannot be fetched is either an error or, under `missing_not_failure`, a
//! pseudo-index entry (tree state recorded, nothing on disk, marked
//! skip-worktree).

use std::fs;
use std::io;
use std::io::Read as _;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use globset::Glob;
use globset::GlobSet;
use globset::GlobSetBuilder;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;
use tracing::instrument;

use crate::diff::Change;
use crate::diff::DiffAction;
use crate::diff::content_key;
use crate::diff::diff_records;
use crate::diff::flatten_tree;
use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;
use crate::file_util::remove_empty_dirs_upward;
use crate::file_util::set_executable;
use crate::file_util::try_symlink;
use crate::hash::ObjectId;
use crate::index::Index;
use crate::index::IndexBuilder;
use crate::index::IndexEntry;
use crate::index::IndexError;
use crate::index::Stage;
use crate::object::Commit;
use crate::object::FileMode;
use crate::object::Object;
use crate::object::Signature;
use crate::odb::EntryRecord;
use crate::odb::ObjectDb;
use crate::odb::OdbError;
use crate::op_context::CancelledError;
use crate::op_context::OpContext;
use crate::refs::BRANCH_PREFIX;
use crate::refs::HEAD_NAME;
use crate::refs::RefDb;
use crate::refs::RefError;
use crate::refs::Reference;
use crate::sparse::SparseMatcher;

pub const COMMIT_EDITMSG: &str = "COMMIT_EDITMSG";

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Odb(#[from] OdbError),
    #[error(transparent)]
    Ref(#[from] RefError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
    #[error("Nothing changed, refusing to create an empty commit")]
    EmptyCommit,
    #[error("Cannot commit with unresolved conflicts")]
    UnresolvedConflicts,
    #[error("{path} has unstaged changes")]
    UnstagedChanges { path: String },
    #[error("Content for {path} is not available locally")]
    MissingContent { path: String },
    #[error("Worktree I/O error")]
    Io(#[from] io::Error),
}

pub type WorktreeResult<T> = Result<T, WorktreeError>;

/// A structured status report: what `commit↔index` and `index↔worktree`
/// each changed, plus the paths sitting in conflict stages.
#[derive(Debug, Clone, Default)]
pub struct Status {
    pub staging: Vec<Change>,
    pub worktree: Vec<Change>,
    pub conflicted: Vec<String>,
}

impl Status {
    pub fn is_clean(&self) -> bool {
        self.staging.is_empty() && self.worktree.is_empty() && self.conflicted.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CheckoutOptions {
    /// Materialize files but leave the index untouched.
    pub worktree_only: bool,
    /// Record pseudo-index entries for content that cannot be fetched
    /// instead of failing the checkout.
    pub missing_not_failure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Move HEAD only.
    Soft,
    /// Move HEAD and rewrite the index; leave the worktree.
    Mixed,
    /// Move HEAD, index and worktree.
    Hard,
    /// Like `Hard`, but refuse to clobber unstaged changes in files that
    /// differ between the target and the index.
    Merge,
}

pub struct Worktree {
    root: PathBuf,
    dot_dir: PathBuf,
    odb: Arc<ObjectDb>,
    refdb: Arc<RefDb>,
    sparse: SparseMatcher,
}

impl Worktree {
    pub fn new(
        root: PathBuf,
        dot_dir: PathBuf,
        odb: Arc<ObjectDb>,
        refdb: Arc<RefDb>,
        sparse: SparseMatcher,
    ) -> Self {
        Self {
            root,
            dot_dir,
            odb,
            refdb,
            sparse,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sparse(&self) -> &SparseMatcher {
        &self.sparse
    }

    fn index_path(&self) -> PathBuf {
        self.dot_dir.join("index")
    }

    pub fn index(&self) -> WorktreeResult<Index> {
        Ok(Index::load(&self.index_path())?)
    }

    pub fn store_index(&self, index: &Index) -> WorktreeResult<()> {
        Ok(index.store(&self.index_path())?)
    }

    /// The tree of the commit `HEAD` resolves to, or `None` on an unborn
    /// branch.
    pub fn head_tree(&self) -> WorktreeResult<Option<ObjectId>> {
        match self.head_commit()? {
            Some((_, commit)) => Ok(Some(commit.tree)),
            None => Ok(None),
        }
    }

    pub fn head_commit(&self) -> WorktreeResult<Option<(ObjectId, Arc<Commit>)>> {
        match self.refdb.resolve(HEAD_NAME) {
            Ok(reference) => {
                let id = reference.hash_target().expect("resolve returns hash refs");
                Ok(Some((id, self.odb.commit(&id)?)))
            }
            Err(RefError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn index_records(&self, index: &Index) -> Vec<EntryRecord> {
        index
            .entries()
            .filter(|entry| entry.stage == Stage::Merged)
            .filter(|entry| self.sparse.matches_file(&entry.path))
            .map(|entry| EntryRecord {
                path: entry.path.clone(),
                mode: entry.mode,
                hash: entry.hash,
                size: entry.size,
            })
            .collect()
    }

    fn tree_records(&self, ctx: &OpContext, tree: Option<ObjectId>) -> WorktreeResult<Vec<EntryRecord>> {
        match tree {
            Some(tree) => Ok(flatten_tree(&self.odb, ctx, &tree, &self.sparse)?),
            None => Ok(Vec::new()),
        }
    }

    /// Flattens the worktree into records. Files whose cached stat matches
    /// the index reuse the staged hash; everything else is hashed from
    /// disk (the lazy half of the filesystem noder).
    fn worktree_records(&self, ctx: &OpContext, index: &Index) -> WorktreeResult<Vec<EntryRecord>> {
        let mut paths = Vec::new();
        self.walk_dir(&self.root, "", &mut paths)?;
        paths.sort();

        // A file modified in the same millisecond the index was written is
        // racily clean; it must be re-hashed, not trusted.
        let index_mtime = fs::metadata(self.index_path())
            .ok()
            .map(|metadata| crate::index::metadata_mtime_millis(&metadata))
            .unwrap_or(0);

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            ctx.check()?;
            if !self.sparse.matches_file(&path) {
                continue;
            }
            let disk_path = self.root.join(&path);
            let metadata = fs::symlink_metadata(&disk_path).context(&disk_path)?;
            let index_entry = index.get(&path).ok();
            if let Some(entry) = index_entry {
                if entry.skip_worktree {
                    continue;
                }
                let racy = crate::index::metadata_mtime_millis(&metadata) >= index_mtime;
                if entry.stat_matches(&metadata) && !racy && !entry.mode.is_symlink() {
                    records.push(EntryRecord {
                        path,
                        mode: disk_mode(&metadata),
                        hash: content_key(&self.odb, &EntryRecord {
                            path: entry.path.clone(),
                            mode: entry.mode,
                            hash: entry.hash,
                            size: entry.size,
                        })?
                        .0,
                        size: metadata.len(),
                    });
                    continue;
                }
            }
            records.push(self.hash_disk_file(&path, &disk_path, &metadata)?);
        }
        Ok(records)
    }

    fn hash_disk_file(
        &self,
        path: &str,
        disk_path: &Path,
        metadata: &fs::Metadata,
    ) -> WorktreeResult<EntryRecord> {
        if metadata.file_type().is_symlink() {
            let target = fs::read_link(disk_path).context(disk_path)?;
            let bytes = target.to_string_lossy().into_owned().into_bytes();
            let hash = ObjectDb::hash_only(&mut bytes.as_slice(), bytes.len() as u64)?;
            return Ok(EntryRecord {
                path: path.to_owned(),
                mode: FileMode::SYMLINK,
                hash,
                size: bytes.len() as u64,
            });
        }
        let mut file = fs::File::open(disk_path).context(disk_path)?;
        let hash = ObjectDb::hash_only(&mut file, metadata.len())?;
        Ok(EntryRecord {
            path: path.to_owned(),
            mode: disk_mode(metadata),
            hash,
            size: metadata.len(),
        })
    }

    fn walk_dir(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> WorktreeResult<()> {
        for entry in fs::read_dir(dir).context(dir)? {
            let entry = entry.context(dir)?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            if prefix.is_empty() && entry.path() == self.dot_dir {
                continue;
            }
            let file_type = entry.file_type().context(entry.path())?;
            if file_type.is_dir() && !file_type.is_symlink() {
                self.walk_dir(&entry.path(), &path, out)?;
            } else {
                out.push(path);
            }
        }
        Ok(())
    }

    /// Status as two diffs: `commit↔index` (staging column) and
    /// `index↔worktree` (worktree column). The sparse matcher applies
    /// identically to all three sources.
    #[instrument(skip_all)]
    pub fn status(&self, ctx: &OpContext) -> WorktreeResult<Status> {
        let index = self.index()?;
        let head = self.tree_records(ctx, self.head_tree()?)?;
        let staged = self.index_records(&index);
        let working = self.worktree_records(ctx, &index)?;

        Ok(Status {
            staging: diff_records(&self.odb, ctx, head, staged.clone())?,
            worktree: diff_records(&self.odb, ctx, staged, working)?,
            conflicted: index.conflicted_paths(),
        })
    }

    /// Materializes `target_tree` onto the worktree.
    #[instrument(skip(self, ctx))]
    pub fn checkout(
        &self,
        ctx: &OpContext,
        target_tree: &ObjectId,
        options: CheckoutOptions,
    ) -> WorktreeResult<()> {
        let index = self.index()?;
        let current = self.index_records(&index);
        let target = self.tree_records(ctx, Some(*target_tree))?;
        let changes = diff_records(&self.odb, ctx, current, target)?;

        // Fetch everything the materialization pass will need, batched
        // through the promisor.
        let wanted: Vec<EntryRecord> = changes
            .iter()
            .filter_map(|change| change.to.clone())
            .collect();
        let mut pseudo: Vec<String> = Vec::new();
        if options.missing_not_failure {
            for record in &wanted {
                if self
                    .odb
                    .ensure_local(ctx, std::slice::from_ref(record))
                    .is_err()
                {
                    pseudo.push(record.path.clone());
                }
            }
        } else if !wanted.is_empty() {
            self.odb.ensure_local(ctx, &wanted)?;
        }

        let mut builder = IndexBuilder::new();
        for change in &changes {
            ctx.check()?;
            match change.action {
                DiffAction::Delete => {
                    let record = change.from.as_ref().unwrap();
                    self.remove_worktree_file(&record.path)?;
                    builder.remove(record.path.clone());
                }
                DiffAction::Insert | DiffAction::Modify => {
                    let record = change.to.as_ref().unwrap();
                    if !pseudo.contains(&record.path) {
                        match self.materialize_file(ctx, record) {
                            Ok(metadata) => {
                                builder.set(
                                    IndexEntry::from_tree(
                                        record.path.clone(),
                                        record.mode,
                                        record.hash,
                                        record.size,
                                    )
                                    .with_file_metadata(&metadata),
                                );
                                continue;
                            }
                            Err(WorktreeError::Odb(
                                OdbError::Fetch { .. } | OdbError::NotFound(_),
                            )) if options.missing_not_failure => {}
                            Err(err) => return Err(err),
                        }
                    }
                    // Content is unavailable: record the tree state without
                    // materializing anything.
                    let mut entry = IndexEntry::from_tree(
                        record.path.clone(),
                        record.mode,
                        record.hash,
                        record.size,
                    );
                    entry.skip_worktree = true;
                    builder.set(entry);
                }
            }
        }

        if !options.worktree_only {
            let new_index = builder.write(&index);
            self.store_index(&new_index)?;
        }
        Ok(())
    }

    /// Writes one file atomically: temp sibling, mode bits, rename.
    fn materialize_file(&self, ctx: &OpContext, record: &EntryRecord) -> WorktreeResult<fs::Metadata> {
        let disk_path = self.root.join(&record.path);
        let parent = disk_path.parent().expect("worktree paths have parents");
        fs::create_dir_all(parent).context(parent)?;

        if record.mode.is_symlink() {
            let target_bytes = self.odb.blob_bytes(&record.hash)?;
            let target = PathBuf::from(String::from_utf8_lossy(&target_bytes).into_owned());
            match fs::remove_file(&disk_path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(PathError { path: disk_path, source: err }.into()),
            }
            try_symlink(&target, &disk_path).context(&disk_path)?;
            return Ok(fs::symlink_metadata(&disk_path).context(&disk_path)?);
        }

        let mut reader = self.odb.open_content(ctx, record)?;
        let temp_file = NamedTempFile::with_prefix_in(".zeta-checkout-", parent).context(parent)?;
        {
            let mut out = temp_file.as_file();
            let mut buf = vec![0u8; 1 << 16];
            loop {
                ctx.check()?;
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).context(&disk_path)?;
            }
            out.flush().context(&disk_path)?;
        }
        let (file, temp_path) = temp_file.keep().map_err(|err| PathError {
            path: disk_path.clone(),
            source: err.error,
        })?;
        drop(file);
        set_executable(&temp_path, record.mode.is_executable()).context(&temp_path)?;
        fs::rename(&temp_path, &disk_path).context(&disk_path)?;
        debug!(path = %record.path, "materialized");
        Ok(fs::symlink_metadata(&disk_path).context(&disk_path)?)
    }

    fn remove_worktree_file(&self, path: &str) -> WorktreeResult<()> {
        let disk_path = self.root.join(path);
        match fs::remove_file(&disk_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(PathError {
                    path: disk_path,
                    source: err,
                }
                .into());
            }
        }
        if let Some(parent) = disk_path.parent() {
            remove_empty_dirs_upward(parent, &self.root);
        }
        Ok(())
    }

    /// Moves HEAD (and per `mode`, the index and worktree) to
    /// `target_commit`.
    #[instrument(skip(self, ctx))]
    pub fn reset(
        &self,
        ctx: &OpContext,
        mode: ResetMode,
        target_commit: &ObjectId,
        committer: &Signature,
    ) -> WorktreeResult<()> {
        let target_tree = self.odb.commit(target_commit)?.tree;

        if mode == ResetMode::Merge {
            let index = self.index()?;
            let staged = self.index_records(&index);
            let target = self.tree_records(ctx, Some(target_tree))?;
            let diff_to_target = diff_records(&self.odb, ctx, staged.clone(), target)?;
            let working = self.worktree_records(ctx, &index)?;
            let unstaged = diff_records(&self.odb, ctx, staged, working)?;
            for change in &diff_to_target {
                if unstaged.iter().any(|u| u.path() == change.path()) {
                    return Err(WorktreeError::UnstagedChanges {
                        path: change.path().to_owned(),
                    });
                }
            }
        }

        self.move_head_to(target_commit, committer, "reset: moving")?;

        match mode {
            ResetMode::Soft => {}
            ResetMode::Mixed => {
                let records = self.tree_records(ctx, Some(target_tree))?;
                let mut builder = IndexBuilder::new();
                for entry in self.index()?.entries() {
                    builder.remove(entry.path.clone());
                }
                for record in records {
                    builder.set(IndexEntry::from_tree(
                        record.path,
                        record.mode,
                        record.hash,
                        record.size,
                    ));
                }
                self.store_index(&builder.write(&Index::default()))?;
            }
            ResetMode::Hard | ResetMode::Merge => {
                self.checkout(ctx, &target_tree, CheckoutOptions::default())?;
                // Paths with unstaged edits not covered by the target diff
                // are reverted too under Hard.
                if mode == ResetMode::Hard {
                    self.revert_unstaged(ctx)?;
                }
            }
        }
        Ok(())
    }

    /// Rewrites worktree files that differ from the index.
    fn revert_unstaged(&self, ctx: &OpContext) -> WorktreeResult<()> {
        let index = self.index()?;
        let staged = self.index_records(&index);
        let working = self.worktree_records(ctx, &index)?;
        for change in diff_records(&self.odb, ctx, staged, working)? {
            match change.action {
                DiffAction::Insert => {
                    // Untracked files survive a reset.
                }
                DiffAction::Delete | DiffAction::Modify => {
                    let record = change.from.as_ref().unwrap();
                    self.materialize_file(ctx, record)?;
                }
            }
        }
        Ok(())
    }

    fn move_head_to(
        &self,
        target: &ObjectId,
        committer: &Signature,
        message: &str,
    ) -> WorktreeResult<()> {
        let head = self.refdb.head()?;
        match head {
            Reference::Symbolic { target: branch, .. } => {
                let old = match self.refdb.resolve(HEAD_NAME) {
                    Ok(reference) => reference.hash_target(),
                    Err(RefError::NotFound(_)) => None,
                    Err(err) => return Err(err.into()),
                };
                let new_ref = Reference::Hash {
                    name: branch.clone(),
                    target: *target,
                };
                let expected = old.map(|target| Reference::Hash {
                    name: branch.clone(),
                    target,
                });
                self.refdb.update(&new_ref, expected.as_ref())?;
                self.refdb.append_log(
                    &branch,
                    old.unwrap_or(ObjectId::ZERO),
                    *target,
                    committer,
                    message,
                )?;
            }
            Reference::Hash { target: old, .. } => {
                self.refdb.force_update(&Reference::Hash {
                    name: HEAD_NAME.to_owned(),
                    target: *target,
                })?;
                self.refdb
                    .append_log(HEAD_NAME, old, *target, committer, message)?;
            }
        }
        Ok(())
    }

    /// Stages worktree changes for paths matching `patterns` (empty =
    /// everything).
    #[instrument(skip(self, ctx))]
    pub fn add(&self, ctx: &OpContext, patterns: &[String]) -> WorktreeResult<()> {
        let matcher = build_globset(patterns)?;
        let index = self.index()?;
        let staged = self.index_records(&index);
        let working = self.worktree_records(ctx, &index)?;
        let changes = diff_records(&self.odb, ctx, staged, working)?;

        let mut builder = IndexBuilder::new();
        for change in changes {
            ctx.check()?;
            let path = change.path().to_owned();
            if let Some(matcher) = &matcher {
                if !matcher.is_match(&path) {
                    continue;
                }
            }
            match change.action {
                DiffAction::Delete => builder.remove(path),
                DiffAction::Insert | DiffAction::Modify => {
                    let disk_path = self.root.join(&path);
                    let metadata = fs::symlink_metadata(&disk_path).context(&disk_path)?;
                    let entry = self.stage_file(&path, &disk_path, &metadata)?;
                    builder.set(entry);
                }
            }
        }
        self.store_index(&builder.write(&index))?;
        Ok(())
    }

    /// Hashes one disk file into the store and builds its index entry. The
    /// fragments flag is ORed into the mode when the content was split.
    fn stage_file(
        &self,
        path: &str,
        disk_path: &Path,
        metadata: &fs::Metadata,
    ) -> WorktreeResult<IndexEntry> {
        if metadata.file_type().is_symlink() {
            let target = fs::read_link(disk_path).context(disk_path)?;
            let bytes = target.to_string_lossy().into_owned().into_bytes();
            let hash = self.odb.put_bytes(&bytes)?;
            return Ok(IndexEntry::from_tree(
                path,
                FileMode::SYMLINK,
                hash,
                bytes.len() as u64,
            )
            .with_file_metadata(metadata));
        }
        let mut file = fs::File::open(disk_path).context(disk_path)?;
        let (hash, is_fragments) = self.odb.hash_to(&mut file, metadata.len())?;
        let mut mode = disk_mode(metadata);
        if is_fragments {
            mode = mode.with_fragments();
        }
        Ok(IndexEntry::from_tree(path, mode, hash, metadata.len()).with_file_metadata(metadata))
    }

    /// Builds a root tree from the index, reusing `base_tree` entries for
    /// sparse-excluded paths so they survive the commit.
    pub fn write_index_as_tree(
        &self,
        ctx: &OpContext,
        base_tree: Option<ObjectId>,
    ) -> WorktreeResult<ObjectId> {
        let index = self.index()?;
        let mut records: Vec<EntryRecord> = Vec::new();
        if let Some(base_tree) = base_tree {
            let all = SparseMatcher::match_all();
            for record in flatten_tree(&self.odb, ctx, &base_tree, &all)? {
                if !self.sparse.matches_file(&record.path) {
                    records.push(record);
                }
            }
        }
        for entry in index.entries() {
            if entry.stage != Stage::Merged || entry.intent_to_add {
                continue;
            }
            if !self.sparse.matches_file(&entry.path) {
                continue;
            }
            records.push(EntryRecord {
                path: entry.path.clone(),
                mode: entry.mode,
                hash: entry.hash,
                size: entry.size,
            });
        }
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(self.odb.write_records_as_tree(&records)?)
    }

    /// Creates a commit from the index on the current branch.
    #[instrument(skip_all)]
    pub fn commit(
        &self,
        ctx: &OpContext,
        message: &str,
        author: &Signature,
        committer: &Signature,
        allow_empty: bool,
    ) -> WorktreeResult<ObjectId> {
        let index = self.index()?;
        if index.has_conflicts() {
            return Err(WorktreeError::UnresolvedConflicts);
        }
        let head = self.head_commit()?;
        let parents: Vec<ObjectId> = head.iter().map(|(id, _)| *id).collect();
        self.commit_with_parents(ctx, message, author, committer, parents, allow_empty)
    }

    /// Creates a commit with explicit parents (merge commits, replay
    /// continuations) and advances the current branch.
    pub fn commit_with_parents(
        &self,
        ctx: &OpContext,
        message: &str,
        author: &Signature,
        committer: &Signature,
        parents: Vec<ObjectId>,
        allow_empty: bool,
    ) -> WorktreeResult<ObjectId> {
        let head = self.head_commit()?;
        let base_tree = head.as_ref().map(|(_, commit)| commit.tree);
        let tree = self.write_index_as_tree(ctx, base_tree)?;
        if !allow_empty && Some(tree) == base_tree {
            return Err(WorktreeError::EmptyCommit);
        }

        fs::write(self.dot_dir.join(COMMIT_EDITMSG), message).context(self.dot_dir.join(COMMIT_EDITMSG))?;

        let commit = Commit {
            tree,
            parents: parents.into_iter().collect(),
            author: author.clone(),
            committer: committer.clone(),
            message: message.to_owned(),
            extra_headers: vec![],
        };
        let subject = commit.subject().to_owned();
        let id = self.odb.put_encoded(&Object::Commit(commit))?;
        self.advance_head(&id, committer, &format!("commit: {subject}"))?;
        Ok(id)
    }

    fn advance_head(
        &self,
        new_commit: &ObjectId,
        committer: &Signature,
        log_message: &str,
    ) -> WorktreeResult<()> {
        match self.refdb.head()? {
            Reference::Symbolic { target: branch, .. } => {
                let old = match self.refdb.reference(&branch) {
                    Ok(reference) => reference.hash_target(),
                    Err(RefError::NotFound(_)) => None,
                    Err(err) => return Err(err.into()),
                };
                let new_ref = Reference::Hash {
                    name: branch.clone(),
                    target: *new_commit,
                };
                let expected = old.map(|target| Reference::Hash {
                    name: branch.clone(),
                    target,
                });
                self.refdb.update(&new_ref, expected.as_ref())?;
                self.refdb.append_log(
                    &branch,
                    old.unwrap_or(ObjectId::ZERO),
                    *new_commit,
                    committer,
                    log_message,
                )?;
            }
            Reference::Hash { target: old, .. } => {
                self.refdb.force_update(&Reference::Hash {
                    name: HEAD_NAME.to_owned(),
                    target: *new_commit,
                })?;
                self.refdb
                    .append_log(HEAD_NAME, old, *new_commit, committer, log_message)?;
            }
        }
        Ok(())
    }

    /// Switches HEAD to `branch` and checks out its tree.
    pub fn switch_branch(&self, ctx: &OpContext, branch: &str) -> WorktreeResult<()> {
        let full = format!("{BRANCH_PREFIX}{branch}");
        let target = self.refdb.resolve(&full)?;
        let commit_id = target.hash_target().expect("resolve returns hash refs");
        let tree = self.odb.commit(&commit_id)?.tree;
        self.checkout(ctx, &tree, CheckoutOptions::default())?;
        self.refdb.force_update(&Reference::Symbolic {
            name: HEAD_NAME.to_owned(),
            target: full,
        })?;
        Ok(())
    }
}

fn disk_mode(metadata: &fs::Metadata) -> FileMode {
    if metadata.file_type().is_symlink() {
        return FileMode::SYMLINK;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        if metadata.permissions().mode() & 0o111 != 0 {
            return FileMode::EXECUTABLE;
        }
    }
    FileMode::REGULAR
}

fn build_globset(patterns: &[String]) -> WorktreeResult<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).map_err(|err| {
            WorktreeError::Index(IndexError::BadPattern {
                pattern: pattern.clone(),
                source: err,
            })
        })?);
    }
    Ok(Some(builder.build().map_err(|err| {
        WorktreeError::Index(IndexError::BadPattern {
            pattern: patterns.join(" "),
            source: err,
        })
    })?))
}
