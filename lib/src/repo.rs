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

//! The repository handle.
//!
//! Owns the long-lived components (object store, reference database,
//! worktree) and wires the promisor in when a transport is attached. All
//! on-disk state lives under `<worktree>/.zeta/`.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;

use crate::config::ConfigError;
use crate::config::RepoConfig;
use crate::hash::ObjectId;
use crate::history::History;
use crate::object::Signature;
use crate::object::Timestamp;
use crate::odb::ObjectDb;
use crate::odb::OdbError;
use crate::op_context::OpContext;
use crate::promisor::Accelerator;
use crate::promisor::Promisor;
use crate::protocol::Protocol;
use crate::protocol::ProtocolError;
use crate::protocol::read_shallow_marker;
use crate::refs::BRANCH_PREFIX;
use crate::refs::HEAD_NAME;
use crate::refs::RefDb;
use crate::refs::RefError;
use crate::refs::Reference;
use crate::refs::TAG_PREFIX;
use crate::refs::validate_branch_name;
use crate::revision::Revision;
use crate::revision::RevisionError;
use crate::revision::RevisionParser;
use crate::revwalk::RevWalk;
use crate::sparse::SparseMatcher;
use crate::transport::Transport;
use crate::worktree::Worktree;
use crate::worktree::WorktreeError;

pub const DOT_DIR: &str = ".zeta";
pub const DEFAULT_BRANCH: &str = "main";

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("Not a zeta repository: {0}")]
    NotARepository(PathBuf),
    #[error("Repository already exists at {0}")]
    AlreadyExists(PathBuf),
    #[error("No transport attached")]
    NoTransport,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Odb(#[from] OdbError),
    #[error(transparent)]
    Ref(#[from] RefError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Revision(#[from] RevisionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Repository I/O error")]
    Io(#[from] std::io::Error),
}

pub type RepoResult<T> = Result<T, RepoError>;

pub struct Repository {
    root: PathBuf,
    dot_dir: PathBuf,
    config: RepoConfig,
    odb: Arc<ObjectDb>,
    refdb: Arc<RefDb>,
    worktree: Worktree,
    promisor: Option<Arc<Promisor>>,
}

impl Repository {
    /// Creates a fresh repository at `root` with an unborn default branch.
    #[instrument(skip(config))]
    pub fn init(root: &Path, config: RepoConfig) -> RepoResult<Self> {
        let dot_dir = root.join(DOT_DIR);
        if dot_dir.exists() {
            return Err(RepoError::AlreadyExists(dot_dir));
        }
        fs::create_dir_all(&dot_dir)?;
        config.save(&dot_dir.join("config"))?;
        ObjectDb::init(&dot_dir.join("objects"), config.chunk)?;
        let refdb = RefDb::init(&dot_dir)?;
        refdb.force_update(&Reference::Symbolic {
            name: HEAD_NAME.to_owned(),
            target: format!("{BRANCH_PREFIX}{DEFAULT_BRANCH}"),
        })?;
        Self::open(root)
    }

    /// Opens an existing repository rooted at `root`.
    pub fn open(root: &Path) -> RepoResult<Self> {
        let dot_dir = root.join(DOT_DIR);
        if !dot_dir.is_dir() {
            return Err(RepoError::NotARepository(root.to_path_buf()));
        }
        let config = RepoConfig::load(&dot_dir.join("config"))?;
        let odb = Arc::new(ObjectDb::load(&dot_dir.join("objects"), config.chunk));
        let refdb = Arc::new(RefDb::load(&dot_dir));
        let sparse = SparseMatcher::new(config.core.sparse_dirs.iter().cloned());
        let worktree = Worktree::new(
            root.to_path_buf(),
            dot_dir.clone(),
            odb.clone(),
            refdb.clone(),
            sparse,
        );
        Ok(Self {
            root: root.to_path_buf(),
            dot_dir,
            config,
            odb,
            refdb,
            worktree,
            promisor: None,
        })
    }

    /// Wires a transport in: the promisor starts serving missing-object
    /// fetches for the store, and push/fetch become available.
    pub fn attach_transport(
        &mut self,
        transport: Arc<dyn Transport>,
        accelerator: Option<Arc<dyn Accelerator>>,
    ) {
        let promisor = Promisor::new(
            transport,
            self.odb.clone(),
            self.config.transfer.clone(),
            accelerator,
        );
        // The weak hook shares the promisor's refcount, so it stays
        // upgradable for as long as this handle holds the promisor.
        let hook: Arc<dyn crate::odb::MissingObjectFetcher> = promisor.clone();
        self.odb.set_missing_fetcher(Arc::downgrade(&hook));
        self.promisor = Some(promisor);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dot_dir(&self) -> &Path {
        &self.dot_dir
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn odb(&self) -> &Arc<ObjectDb> {
        &self.odb
    }

    pub fn refdb(&self) -> &RefDb {
        &self.refdb
    }

    pub fn worktree(&self) -> &Worktree {
        &self.worktree
    }

    /// The configured committer identity stamped with the current time.
    pub fn signature(&self) -> Signature {
        Signature {
            name: self.config.user.name.clone(),
            email: self.config.user.email.clone(),
            when: Timestamp::now(),
        }
    }

    /// The shallow boundary, if this is a shallow clone.
    pub fn shallow(&self) -> RepoResult<Option<ObjectId>> {
        Ok(read_shallow_marker(&self.dot_dir)?)
    }

    /// History operations (merge/rebase/cherry-pick/revert/stash) bound to
    /// this repository's current shallow state.
    pub fn history(&self) -> RepoResult<History<'_>> {
        Ok(History {
            odb: &self.odb,
            refdb: &self.refdb,
            worktree: &self.worktree,
            dot_dir: self.dot_dir.clone(),
            shallow: self.shallow()?,
        })
    }

    /// The push/fetch protocol engine. Requires an attached transport.
    pub fn protocol(&self) -> RepoResult<Protocol<'_>> {
        let promisor = self.promisor.as_ref().ok_or(RepoError::NoTransport)?;
        Ok(Protocol {
            odb: &self.odb,
            refdb: &self.refdb,
            promisor,
            sparse: self.worktree.sparse(),
            dot_dir: self.dot_dir.clone(),
            large_threshold: self.config.transfer.large_threshold,
            batch_limit: self.config.transfer.batch_limit,
        })
    }

    /// Resolves a textual revision.
    pub fn revparse(&self, ctx: &OpContext, input: &str) -> RepoResult<Revision> {
        let parser = RevisionParser {
            odb: &self.odb,
            refdb: &self.refdb,
        };
        Ok(parser.resolve(ctx, input)?)
    }

    /// A lazy walk over the ancestors of `from`, respecting the shallow
    /// boundary.
    pub fn log(&self, ctx: &OpContext, from: ObjectId) -> RepoResult<RevWalk<'_>> {
        Ok(RevWalk::ancestors(&self.odb, ctx, &[from], self.shallow()?)?)
    }

    /// Creates a branch at `target` after name validation and hierarchy
    /// collision checks.
    pub fn create_branch(&self, name: &str, target: ObjectId) -> RepoResult<()> {
        validate_branch_name(name)?;
        let full = format!("{BRANCH_PREFIX}{name}");
        let collisions = self.refdb.prefix_match(&full)?;
        if let Some(existing) = collisions.into_iter().next() {
            return Err(RefError::Collision {
                name: full,
                existing,
            }
            .into());
        }
        self.refdb.update(
            &Reference::Hash {
                name: full.clone(),
                target,
            },
            None,
        )?;
        self.refdb.append_log(
            &full,
            ObjectId::ZERO,
            target,
            &self.signature(),
            "branch: created",
        )?;
        Ok(())
    }

    pub fn delete_branch(&self, name: &str) -> RepoResult<()> {
        let full = format!("{BRANCH_PREFIX}{name}");
        self.refdb.remove(&full, None)?;
        self.refdb.delete_log(&full)?;
        Ok(())
    }

    pub fn list_branches(&self) -> RepoResult<Vec<Reference>> {
        Ok(self.refdb.list(BRANCH_PREFIX)?)
    }

    /// Switches HEAD to `branch`, checking out its tree.
    pub fn switch(&self, ctx: &OpContext, branch: &str) -> RepoResult<()> {
        validate_branch_name(branch)?;
        Ok(self.worktree.switch_branch(ctx, branch)?)
    }

    /// Detaches HEAD at `target`.
    pub fn detach_head(&self, ctx: &OpContext, target: ObjectId) -> RepoResult<()> {
        let tree = self.odb.commit(&target)?.tree;
        self.worktree
            .checkout(ctx, &tree, crate::worktree::CheckoutOptions::default())?;
        self.refdb.force_update(&Reference::Hash {
            name: HEAD_NAME.to_owned(),
            target,
        })?;
        Ok(())
    }

    /// Creates a lightweight tag.
    pub fn create_tag(&self, name: &str, target: ObjectId, force: bool) -> RepoResult<()> {
        let full = format!("{TAG_PREFIX}{name}");
        if force {
            self.refdb.force_update(&Reference::Hash {
                name: full,
                target,
            })?;
        } else {
            self.refdb.update(
                &Reference::Hash {
                    name: full,
                    target,
                },
                None,
            )?;
        }
        Ok(())
    }

    /// Creates an annotated tag object plus its reference.
    pub fn create_annotated_tag(
        &self,
        name: &str,
        target: ObjectId,
        message: &str,
        force: bool,
    ) -> RepoResult<ObjectId> {
        let (kind, _) = self.odb.get_bytes(&target)?;
        let tag = crate::object::Tag {
            object: target,
            object_kind: kind,
            name: name.to_owned(),
            tagger: self.signature(),
            content: message.to_owned(),
        };
        let tag_id = self.odb.put_encoded(&crate::object::Object::Tag(tag))?;
        fs::write(self.dot_dir.join("TAG_EDITMSG"), message)?;
        let full = format!("{TAG_PREFIX}{name}");
        let reference = Reference::Hash {
            name: full,
            target: tag_id,
        };
        if force {
            self.refdb.force_update(&reference)?;
        } else {
            self.refdb.update(&reference, None)?;
        }
        Ok(tag_id)
    }
}
