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

//! Fetch and push negotiation with the remote.
//!
//! Fetch pulls the metadata closure of a target commit (bounded by the
//! shallow marker or a depth budget), unpacks it into the store and then
//! runs the promisor object loop under the sparse filter. Push checks
//! ancestry against the remote tip, pre-uploads large blobs and streams the
//! metadata delta in one framed body. Neither side ever assumes history
//! below the shallow boundary exists anywhere.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use futures::TryStreamExt as _;
use pollster::FutureExt as _;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::instrument;

use crate::file_util::PathError;
use crate::file_util::write_atomically;
use crate::hash::ObjectId;
use crate::object::ObjectKind;
use crate::odb::EntryRecord;
use crate::odb::ObjectDb;
use crate::odb::OdbError;
use crate::op_context::CancelledError;
use crate::op_context::OpContext;
use crate::promisor::Promisor;
use crate::promisor::TransferError;
use crate::refs::BRANCH_PREFIX;
use crate::refs::FETCH_HEAD_NAME;
use crate::refs::REMOTE_PREFIX;
use crate::refs::RefDb;
use crate::refs::RefError;
use crate::refs::Reference;
use crate::refs::TAG_PREFIX;
use crate::revwalk;
use crate::sparse::SparseMatcher;
use crate::transport::BatchCheckAction;
use crate::transport::HaveObject;
use crate::transport::MetadataRequest;
use crate::transport::PackedObject;
use crate::transport::PushCommand;
use crate::transport::Transport;
use crate::transport::TransportError;

pub const SHALLOW_FILE: &str = "shallow";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Remote rejected the update: {0}")]
    RemoteRejected(String),
    #[error("Push of {reference} is not a fast-forward; use force to overwrite")]
    NonFastForward { reference: String },
    #[error("Tag {0} already exists; use force to overwrite")]
    TagExists(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Odb(#[from] OdbError),
    #[error(transparent)]
    Ref(#[from] RefError),
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("Protocol I/O error")]
    Io(#[from] io::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Reads the shallow boundary marker, if the repository is shallow.
pub fn read_shallow_marker(dot_dir: &Path) -> ProtocolResult<Option<ObjectId>> {
    match fs::read_to_string(dot_dir.join(SHALLOW_FILE)) {
        Ok(content) => Ok(ObjectId::try_from_hex(content.trim())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_shallow_marker(dot_dir: &Path, marker: Option<ObjectId>) -> ProtocolResult<()> {
    let path = dot_dir.join(SHALLOW_FILE);
    match marker {
        Some(marker) => write_atomically(&path, format!("{}\n", marker.hex()).as_bytes())?,
        None => match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        },
    }
    Ok(())
}

/// What a fetch should bring up to date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchTarget {
    Branch(String),
    Tag(String),
    Commit(ObjectId),
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Limit the commit depth of the metadata request.
    pub depth: Option<u32>,
    /// Fetch the full history and clear the shallow marker.
    pub unshallow: bool,
    /// Allow a tag fetch to move an existing tag.
    pub force: bool,
    /// Pull reachable blobs eagerly after the metadata lands. Lazy
    /// (snapshot) repositories skip this and rely on checkout-time
    /// fetching.
    pub prefetch_objects: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSummary {
    pub target: ObjectId,
    pub shallow: Option<ObjectId>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PushOptions {
    pub force: bool,
}

pub struct Protocol<'a> {
    pub odb: &'a Arc<ObjectDb>,
    pub refdb: &'a RefDb,
    pub promisor: &'a Promisor,
    pub sparse: &'a SparseMatcher,
    pub dot_dir: PathBuf,
    /// Large-object threshold for pre-upload, from the transfer config.
    pub large_threshold: u64,
    /// Batch size for the object loop.
    pub batch_limit: usize,
}

impl Protocol<'_> {
    fn transport(&self) -> &Arc<dyn Transport> {
        self.promisor.transport()
    }

    /// Fetches `target` and its metadata closure from the remote.
    #[instrument(skip(self, ctx))]
    pub fn fetch(
        &self,
        ctx: &OpContext,
        target: &FetchTarget,
        options: &FetchOptions,
    ) -> ProtocolResult<FetchSummary> {
        self.fetch_async(ctx, target, options).block_on()
    }

    async fn fetch_async(
        &self,
        ctx: &OpContext,
        target: &FetchTarget,
        options: &FetchOptions,
    ) -> ProtocolResult<FetchSummary> {
        let shallow = read_shallow_marker(&self.dot_dir)?;
        let (target_id, remote_shallow) = match target {
            FetchTarget::Commit(id) => (*id, None),
            FetchTarget::Branch(name) => {
                let reference = self
                    .transport()
                    .fetch_reference(&format!("{BRANCH_PREFIX}{name}"))
                    .await?;
                (reference.target, reference.shallow)
            }
            FetchTarget::Tag(name) => {
                let reference = self
                    .transport()
                    .fetch_reference(&format!("{TAG_PREFIX}{name}"))
                    .await?;
                (reference.target, reference.shallow)
            }
        };

        // Tag overwrite protection happens before any data moves.
        if let FetchTarget::Tag(name) = target {
            let full = format!("{TAG_PREFIX}{name}");
            match self.refdb.reference(&full) {
                Ok(existing) if existing.hash_target() != Some(target_id) && !options.force => {
                    return Err(ProtocolError::TagExists(name.clone()));
                }
                Ok(_) | Err(RefError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let have = match self.refdb.reference(FETCH_HEAD_NAME) {
            Ok(reference) => reference.hash_target(),
            Err(RefError::NotFound(_)) => None,
            Err(err) => return Err(err.into()),
        };

        let request = MetadataRequest {
            target: target_id,
            have,
            deepen_from: if options.unshallow { None } else { shallow },
            deepen: if options.unshallow {
                Some(-1)
            } else {
                options.depth.map(|depth| depth as i32)
            },
            sparse_dirs: sparse_dirs_of(self.sparse),
        };

        info!(target = %target_id, "fetching metadata");
        let mut stream = self.transport().fetch_metadata(request).await?;
        let mut unpacked = 0usize;
        while let Some(packed) = stream.try_next().await? {
            ctx.check()?;
            self.odb.unpack(packed.kind, &packed.body)?;
            unpacked += 1;
        }
        debug!(unpacked, "metadata unpacked");

        // The object loop: reachable blobs under the sparse filter, in
        // promisor batches.
        if options.prefetch_objects {
            let mut batches: Vec<Vec<EntryRecord>> = Vec::new();
            self.odb.iterate_entries(
                ctx,
                &target_id,
                self.sparse,
                self.batch_limit,
                &mut |batch| {
                    batches.push(batch.to_vec());
                    Ok(())
                },
            )?;
            for batch in batches {
                self.promisor.fetch_entries(ctx, &batch).await?;
            }
        }

        let new_shallow = if options.unshallow {
            None
        } else {
            // Prefer the boundary the remote reported; otherwise derive it
            // from where the local commit graph stops.
            match remote_shallow {
                Some(marker) => Some(marker),
                None => compute_shallow_boundary(self.odb, ctx, &target_id)?,
            }
        };
        write_shallow_marker(&self.dot_dir, new_shallow)?;

        self.refdb.force_update(&Reference::Hash {
            name: FETCH_HEAD_NAME.to_owned(),
            target: target_id,
        })?;
        match target {
            FetchTarget::Branch(name) => {
                self.refdb.force_update(&Reference::Hash {
                    name: format!("{REMOTE_PREFIX}origin/{name}"),
                    target: target_id,
                })?;
            }
            FetchTarget::Tag(name) => {
                self.refdb.force_update(&Reference::Hash {
                    name: format!("{TAG_PREFIX}{name}"),
                    target: target_id,
                })?;
            }
            FetchTarget::Commit(_) => {}
        }

        Ok(FetchSummary {
            target: target_id,
            shallow: new_shallow,
        })
    }

    /// Pushes the local branch tip to the remote.
    #[instrument(skip(self, ctx))]
    pub fn push(
        &self,
        ctx: &OpContext,
        branch: &str,
        options: PushOptions,
    ) -> ProtocolResult<()> {
        self.push_async(ctx, branch, options).block_on()
    }

    async fn push_async(
        &self,
        ctx: &OpContext,
        branch: &str,
        options: PushOptions,
    ) -> ProtocolResult<()> {
        let full_name = format!("{BRANCH_PREFIX}{branch}");
        let local_tip = self
            .refdb
            .resolve(&full_name)?
            .hash_target()
            .expect("resolve returns hash refs");
        let shallow = read_shallow_marker(&self.dot_dir)?;

        let remote_tip = match self.transport().fetch_reference(&full_name).await {
            Ok(reference) => Some(reference.target),
            Err(TransportError::NotFound(_)) => None,
            Err(err) => return Err(err.into()),
        };

        // Fast-forward requirement: the remote tip must be an ancestor of
        // what we are pushing. A tip we do not even have locally cannot be
        // an ancestor we can prove, so it needs force too. Ancestry walks
        // ignore parents of the shallow boundary; the remote cannot be
        // assumed to hold anything below it either.
        if let Some(remote_tip) = remote_tip {
            if remote_tip != local_tip && !options.force {
                let known_locally = self.odb.exists(&remote_tip, true);
                let fast_forward = known_locally
                    && revwalk::is_fast_forward(self.odb, ctx, &remote_tip, &local_tip, shallow)?;
                if !fast_forward {
                    return Err(ProtocolError::NonFastForward {
                        reference: full_name,
                    });
                }
            }
            if remote_tip == local_tip {
                return Ok(());
            }
        }

        // Enumerate the delta: commits the remote does not have, bounded by
        // its tip and the shallow boundary.
        let exclude: Vec<ObjectId> = remote_tip
            .filter(|tip| self.odb.exists(tip, true))
            .into_iter()
            .collect();
        let commits = revwalk::walk_range(self.odb, ctx, &exclude, &[local_tip], shallow)?;

        let known_blobs: HashSet<ObjectId> = match exclude.first() {
            Some(tip) => {
                let tree = self.odb.commit(tip)?.tree;
                crate::diff::flatten_tree(self.odb, ctx, &tree, &SparseMatcher::match_all())?
                    .into_iter()
                    .map(|record| record.hash)
                    .collect()
            }
            None => HashSet::new(),
        };

        let mut metadata: Vec<PackedObject> = Vec::new();
        let mut seen_trees: HashSet<ObjectId> = HashSet::new();
        let mut blobs: Vec<EntryRecord> = Vec::new();
        for (commit_id, commit) in &commits {
            ctx.check()?;
            let (kind, body) = self.odb.get_bytes(commit_id)?;
            debug_assert_eq!(kind, ObjectKind::Commit);
            metadata.push(PackedObject { kind, body });
            self.collect_tree(ctx, &commit.tree, &mut seen_trees, &known_blobs, &mut metadata, &mut blobs)?;
        }

        // Large blobs go up front through the batch-check/put protocol;
        // small ones travel inside the framed metadata body.
        let large: Vec<&EntryRecord> = blobs
            .iter()
            .filter(|record| record.size >= self.large_threshold)
            .collect();
        if !large.is_empty() {
            let haves: Vec<HaveObject> = large
                .iter()
                .map(|record| HaveObject {
                    id: record.hash,
                    size: record.size,
                })
                .collect();
            let actions = self.transport().batch_check(&full_name, &haves).await?;
            for action in actions {
                ctx.check()?;
                if let BatchCheckAction::Upload(id) = action {
                    let reader = self.odb.get(&id)?;
                    let size = reader.size;
                    self.transport()
                        .put_object(&full_name, &id, Box::pin(BlockingReader(reader)), size)
                        .await?;
                }
            }
        }
        for record in blobs.iter().filter(|record| record.size < self.large_threshold) {
            let (kind, body) = self.odb.get_bytes(&record.hash)?;
            metadata.push(PackedObject { kind, body });
        }

        let report = self
            .transport()
            .push(
                metadata,
                PushCommand {
                    reference: full_name.clone(),
                    old_target: remote_tip.unwrap_or(ObjectId::ZERO),
                    new_target: local_tip,
                },
            )
            .await?;
        if let Some(reason) = report.rejected {
            return Err(ProtocolError::RemoteRejected(reason));
        }

        self.refdb.force_update(&Reference::Hash {
            name: format!("{REMOTE_PREFIX}origin/{branch}"),
            target: local_tip,
        })?;
        info!(branch, tip = %local_tip, "push accepted");
        Ok(())
    }

    fn collect_tree(
        &self,
        ctx: &OpContext,
        tree_id: &ObjectId,
        seen: &mut HashSet<ObjectId>,
        known_blobs: &HashSet<ObjectId>,
        metadata: &mut Vec<PackedObject>,
        blobs: &mut Vec<EntryRecord>,
    ) -> ProtocolResult<()> {
        if !seen.insert(*tree_id) {
            return Ok(());
        }
        ctx.check()?;
        let (kind, body) = self.odb.get_bytes(tree_id)?;
        debug_assert_eq!(kind, ObjectKind::Tree);
        metadata.push(PackedObject { kind, body });

        let tree = self.odb.tree(tree_id)?;
        for entry in tree.entries() {
            if entry.mode.is_dir() {
                self.collect_tree(ctx, &entry.hash, seen, known_blobs, metadata, blobs)?;
            } else if entry.mode.is_fragments() {
                if !known_blobs.contains(&entry.hash) && seen.insert(entry.hash) {
                    let (kind, body) = self.odb.get_bytes(&entry.hash)?;
                    metadata.push(PackedObject { kind, body });
                    let manifest = self.odb.fragments(&entry.hash)?;
                    for chunk in &manifest.entries {
                        if !known_blobs.contains(&chunk.hash) && seen.insert(chunk.hash) {
                            blobs.push(EntryRecord {
                                path: entry.name.clone(),
                                mode: entry.mode.without_fragments(),
                                hash: chunk.hash,
                                size: chunk.size,
                            });
                        }
                    }
                }
            } else if !known_blobs.contains(&entry.hash) && seen.insert(entry.hash) {
                blobs.push(EntryRecord {
                    path: entry.name.clone(),
                    mode: entry.mode,
                    hash: entry.hash,
                    size: entry.size,
                });
            }
        }
        Ok(())
    }
}

/// Finds the earliest locally-present commit reachable from `target` that
/// has a parent we do not have. That commit is the shallow boundary; `None`
/// means the local graph is complete.
fn compute_shallow_boundary(
    odb: &ObjectDb,
    ctx: &OpContext,
    target: &ObjectId,
) -> ProtocolResult<Option<ObjectId>> {
    let mut queue = vec![*target];
    let mut visited: HashSet<ObjectId> = HashSet::new();
    let mut boundary: Option<(i64, ObjectId)> = None;
    while let Some(id) = queue.pop() {
        ctx.check()?;
        if !visited.insert(id) {
            continue;
        }
        let commit = match odb.commit(&id) {
            Ok(commit) => commit,
            Err(OdbError::NotFound(_)) => continue,
            Err(err) => return Err(err.into()),
        };
        let mut missing_parent = false;
        for parent in &commit.parents {
            if odb.exists(parent, true) {
                queue.push(*parent);
            } else {
                missing_parent = true;
            }
        }
        if missing_parent {
            let when = commit.committer.when.millis_since_epoch;
            if boundary.is_none_or(|(top, _)| when < top) {
                boundary = Some((when, id));
            }
        }
    }
    Ok(boundary.map(|(_, id)| id))
}

fn sparse_dirs_of(sparse: &SparseMatcher) -> Vec<String> {
    if sparse.is_everything() {
        Vec::new()
    } else {
        sparse.roots().to_vec()
    }
}

/// Adapts a synchronous reader to the transport's `AsyncRead` seam. Reads
/// block the polling task, which is acceptable for local store files.
struct BlockingReader<R>(R);

impl<R: io::Read + Unpin> tokio::io::AsyncRead for BlockingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let slice = buf.initialize_unfilled();
        let n = this.0.read(slice)?;
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}
