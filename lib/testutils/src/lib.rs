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

//! Test fixtures for zeta-lib: temp repositories with deterministic
//! signatures, file helpers, and an in-memory transport that plays the
//! remote in fetch/push/promisor tests.

use std::cell::Cell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use futures::stream;
use futures::stream::BoxStream;
use tokio::io::AsyncReadExt as _;
use zeta_lib::config::RepoConfig;
use zeta_lib::hash::ObjectId;
use zeta_lib::object::Commit;
use zeta_lib::object::Object;
use zeta_lib::object::ObjectKind;
use zeta_lib::object::Signature;
use zeta_lib::object::Timestamp;
use zeta_lib::object::decode_body;
use zeta_lib::object::object_id_of;
use zeta_lib::odb::ObjectDb;
use zeta_lib::op_context::OpContext;
use zeta_lib::repo::Repository;
use zeta_lib::transport::BatchCheckAction;
use zeta_lib::transport::ByteStream;
use zeta_lib::transport::HaveObject;
use zeta_lib::transport::MetadataRequest;
use zeta_lib::transport::PackedObject;
use zeta_lib::transport::PushCommand;
use zeta_lib::transport::ReceiveReport;
use zeta_lib::transport::RemoteReference;
use zeta_lib::transport::SharedRepresentation;
use zeta_lib::transport::Transport;
use zeta_lib::transport::TransportError;
use zeta_lib::transport::TransportResult;

pub fn new_temp_dir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("zeta-test-")
        .tempdir()
        .unwrap()
}

/// Repository config used by tests: the default layout with a fixed
/// identity.
pub fn test_config() -> RepoConfig {
    let mut config = RepoConfig::default();
    config.user.name = "Test User".to_owned();
    config.user.email = "test.user@example.com".to_owned();
    config
}

/// A repository in a temp dir with a deterministic, monotonic commit
/// clock.
pub struct TestRepo {
    pub temp_dir: tempfile::TempDir,
    pub repo: Repository,
    clock_millis: Cell<i64>,
}

impl TestRepo {
    pub fn init() -> Self {
        Self::init_with_config(test_config())
    }

    pub fn init_with_config(config: RepoConfig) -> Self {
        let temp_dir = new_temp_dir();
        let repo = Repository::init(temp_dir.path(), config).unwrap();
        Self {
            temp_dir,
            repo,
            clock_millis: Cell::new(1_700_000_000_000),
        }
    }

    /// Reloads the repository handle, picking up config changes written to
    /// disk.
    pub fn reopen(&mut self) {
        self.repo = Repository::open(self.temp_dir.path()).unwrap();
    }

    /// A signature whose timestamp advances one second per call, keeping
    /// commit dates strictly ordered.
    pub fn next_signature(&self) -> Signature {
        let when = self.clock_millis.get() + 1000;
        self.clock_millis.set(when);
        Signature {
            name: "Test User".to_owned(),
            email: "test.user@example.com".to_owned(),
            when: Timestamp {
                millis_since_epoch: when,
                tz_offset: 0,
            },
        }
    }

    pub fn write_file(&self, path: &str, content: &[u8]) {
        let disk_path = self.repo.root().join(path);
        fs::create_dir_all(disk_path.parent().unwrap()).unwrap();
        fs::write(disk_path, content).unwrap();
    }

    pub fn read_file(&self, path: &str) -> Vec<u8> {
        fs::read(self.repo.root().join(path)).unwrap()
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.repo.root().join(path).exists()
    }

    pub fn delete_file(&self, path: &str) {
        fs::remove_file(self.repo.root().join(path)).unwrap();
    }

    /// Stages everything and commits with the monotonic clock.
    pub fn commit_all(&self, message: &str) -> ObjectId {
        let ctx = OpContext::background();
        self.repo.worktree().add(&ctx, &[]).unwrap();
        let signature = self.next_signature();
        self.repo
            .worktree()
            .commit(&ctx, message, &signature, &signature, false)
            .unwrap()
    }
}

/// What the in-memory remote recorded about one session.
#[derive(Debug, Default, Clone)]
pub struct TransportStats {
    pub metadata_requests: Vec<MetadataRequest>,
    pub batched_ids: Vec<Vec<ObjectId>>,
    pub streamed_ids: Vec<ObjectId>,
    pub uploads: Vec<ObjectId>,
}

#[derive(Debug, Default)]
struct RemoteState {
    refs: HashMap<String, ObjectId>,
    objects: HashMap<ObjectId, (ObjectKind, Vec<u8>)>,
}

/// An in-memory remote good enough for protocol and promisor tests:
/// scripted refs and objects, call statistics, and optional injected
/// network flakiness.
#[derive(Default)]
pub struct InMemoryTransport {
    state: Mutex<RemoteState>,
    stats: Mutex<TransportStats>,
    flaky_get_failures: AtomicU32,
}

impl InMemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.lock().unwrap().clone()
    }

    /// Makes the next `n` `get_object` calls fail with a retryable network
    /// error.
    pub fn inject_get_failures(&self, n: u32) {
        self.flaky_get_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_ref(&self, name: &str, target: ObjectId) {
        self.state.lock().unwrap().refs.insert(name.to_owned(), target);
    }

    pub fn ref_of(&self, name: &str) -> Option<ObjectId> {
        self.state.lock().unwrap().refs.get(name).copied()
    }

    pub fn has_object(&self, id: &ObjectId) -> bool {
        self.state.lock().unwrap().objects.contains_key(id)
    }

    /// Inserts one object directly, for scripting remote-side history that
    /// no local repository holds.
    pub fn insert_object(&self, kind: ObjectKind, body: Vec<u8>) -> ObjectId {
        let id = object_id_of(kind, &body);
        self.state.lock().unwrap().objects.insert(id, (kind, body));
        id
    }

    /// Copies the full closure of `tips` (commits, trees, manifests,
    /// blobs) out of a local store into the remote.
    pub fn populate_from(&self, odb: &ObjectDb, tips: &[ObjectId]) {
        let ctx = OpContext::background();
        let mut state = self.state.lock().unwrap();
        for item in zeta_lib::revwalk::RevWalk::ancestors(odb, &ctx, tips, None).unwrap() {
            let (commit_id, commit) = item.unwrap();
            let (kind, body) = odb.get_bytes(&commit_id).unwrap();
            state.objects.insert(commit_id, (kind, body));
            insert_tree_closure(odb, &commit.tree, &mut state.objects);
        }
    }

    fn decode_commit(&self, id: &ObjectId) -> Option<Commit> {
        let state = self.state.lock().unwrap();
        let (kind, body) = state.objects.get(id)?;
        if *kind != ObjectKind::Commit {
            return None;
        }
        match decode_body(*kind, body) {
            Ok(Object::Commit(commit)) => Some(commit),
            _ => None,
        }
    }

    /// The metadata closure for a fetch: commits (bounded by depth and the
    /// deepen-from boundary) plus their trees and fragment manifests.
    fn metadata_closure(&self, request: &MetadataRequest) -> Vec<PackedObject> {
        let mut commits: Vec<(ObjectId, Commit, u32)> = Vec::new();
        let mut queue = vec![(request.target, 1u32)];
        let mut visited = HashSet::new();
        while let Some((id, depth)) = queue.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(commit) = self.decode_commit(&id) else {
                continue;
            };
            let at_boundary = request.deepen_from == Some(id)
                || request.deepen.is_some_and(|limit| limit > 0 && depth >= limit as u32);
            if !at_boundary {
                for parent in &commit.parents {
                    queue.push((*parent, depth + 1));
                }
            }
            commits.push((id, commit, depth));
        }
        commits.sort_by_key(|(id, commit, _)| {
            (std::cmp::Reverse(commit.committer.when.millis_since_epoch), *id)
        });

        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for (id, commit, _) in &commits {
            let (kind, body) = state.objects.get(id).unwrap();
            out.push(PackedObject {
                kind: *kind,
                body: body.clone(),
            });
            collect_metadata_trees(&state.objects, &commit.tree, &mut seen, &mut out);
        }
        out
    }
}

fn insert_tree_closure(
    odb: &ObjectDb,
    tree_id: &ObjectId,
    objects: &mut HashMap<ObjectId, (ObjectKind, Vec<u8>)>,
) {
    if objects.contains_key(tree_id) {
        return;
    }
    let (kind, body) = odb.get_bytes(tree_id).unwrap();
    objects.insert(*tree_id, (kind, body));
    let tree = odb.tree(tree_id).unwrap();
    for entry in tree.entries() {
        if entry.mode.is_dir() {
            insert_tree_closure(odb, &entry.hash, objects);
        } else if entry.mode.is_fragments() {
            let (kind, body) = odb.get_bytes(&entry.hash).unwrap();
            objects.insert(entry.hash, (kind, body));
            let manifest = odb.fragments(&entry.hash).unwrap();
            for chunk in &manifest.entries {
                if !objects.contains_key(&chunk.hash) {
                    let (kind, body) = odb.get_bytes(&chunk.hash).unwrap();
                    objects.insert(chunk.hash, (kind, body));
                }
            }
        } else if !objects.contains_key(&entry.hash) {
            let (kind, body) = odb.get_bytes(&entry.hash).unwrap();
            objects.insert(entry.hash, (kind, body));
        }
    }
}

fn collect_metadata_trees(
    objects: &HashMap<ObjectId, (ObjectKind, Vec<u8>)>,
    tree_id: &ObjectId,
    seen: &mut HashSet<ObjectId>,
    out: &mut Vec<PackedObject>,
) {
    if !seen.insert(*tree_id) {
        return;
    }
    let Some((kind, body)) = objects.get(tree_id) else {
        return;
    };
    out.push(PackedObject {
        kind: *kind,
        body: body.clone(),
    });
    let Ok(Object::Tree(tree)) = decode_body(*kind, body) else {
        return;
    };
    for entry in tree.entries() {
        if entry.mode.is_dir() {
            collect_metadata_trees(objects, &entry.hash, seen, out);
        } else if entry.mode.is_fragments() && seen.insert(entry.hash) {
            if let Some((kind, body)) = objects.get(&entry.hash) {
                out.push(PackedObject {
                    kind: *kind,
                    body: body.clone(),
                });
            }
        }
    }
}

fn ok_stream(
    items: Vec<PackedObject>,
) -> BoxStream<'static, TransportResult<PackedObject>> {
    Box::pin(stream::iter(items.into_iter().map(Ok)))
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn fetch_reference(&self, name: &str) -> TransportResult<RemoteReference> {
        match self.ref_of(name) {
            Some(target) => Ok(RemoteReference {
                name: name.to_owned(),
                target,
                shallow: None,
            }),
            None => Err(TransportError::NotFound(name.to_owned())),
        }
    }

    async fn fetch_metadata(
        &self,
        request: MetadataRequest,
    ) -> TransportResult<BoxStream<'static, TransportResult<PackedObject>>> {
        let closure = self.metadata_closure(&request);
        self.stats.lock().unwrap().metadata_requests.push(request);
        Ok(ok_stream(closure))
    }

    async fn batch_objects(
        &self,
        ids: &[ObjectId],
    ) -> TransportResult<BoxStream<'static, TransportResult<PackedObject>>> {
        self.stats.lock().unwrap().batched_ids.push(ids.to_vec());
        let state = self.state.lock().unwrap();
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            let (kind, body) = state
                .objects
                .get(id)
                .ok_or_else(|| TransportError::NotFound(id.hex()))?;
            items.push(PackedObject {
                kind: *kind,
                body: body.clone(),
            });
        }
        Ok(ok_stream(items))
    }

    async fn get_object(&self, id: &ObjectId, offset: u64) -> TransportResult<(ByteStream, u64)> {
        self.stats.lock().unwrap().streamed_ids.push(*id);
        if self.flaky_get_failures.load(Ordering::SeqCst) > 0 {
            self.flaky_get_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(TransportError::Network {
                reason: "injected failure".to_owned(),
                retryable: true,
            });
        }
        let state = self.state.lock().unwrap();
        let (kind, body) = state
            .objects
            .get(id)
            .ok_or_else(|| TransportError::NotFound(id.hex()))?;
        if *kind != ObjectKind::Blob {
            return Err(TransportError::Rejected(format!(
                "{id} is not streamable content"
            )));
        }
        let rest = body[offset as usize..].to_vec();
        let len = rest.len() as u64;
        Ok((Box::pin(Cursor::new(rest)), len))
    }

    async fn shared(&self, _wants: &[ObjectId]) -> TransportResult<Vec<SharedRepresentation>> {
        Ok(Vec::new())
    }

    async fn batch_check(
        &self,
        _reference: &str,
        haves: &[HaveObject],
    ) -> TransportResult<Vec<BatchCheckAction>> {
        let state = self.state.lock().unwrap();
        Ok(haves
            .iter()
            .map(|have| {
                if state.objects.contains_key(&have.id) {
                    BatchCheckAction::Present(have.id)
                } else {
                    BatchCheckAction::Upload(have.id)
                }
            })
            .collect())
    }

    async fn put_object(
        &self,
        _reference: &str,
        id: &ObjectId,
        mut content: ByteStream,
        size: u64,
    ) -> TransportResult<()> {
        let mut body = Vec::with_capacity(size as usize);
        content
            .read_to_end(&mut body)
            .await
            .map_err(|err| TransportError::Network {
                reason: err.to_string(),
                retryable: false,
            })?;
        let actual = object_id_of(ObjectKind::Blob, &body);
        if actual != *id {
            return Err(TransportError::Rejected(format!(
                "uploaded content hashes to {actual}, expected {id}"
            )));
        }
        self.stats.lock().unwrap().uploads.push(*id);
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(*id, (ObjectKind::Blob, body));
        Ok(())
    }

    async fn push(
        &self,
        metadata: Vec<PackedObject>,
        command: PushCommand,
    ) -> TransportResult<ReceiveReport> {
        let mut state = self.state.lock().unwrap();
        let current = state
            .refs
            .get(&command.reference)
            .copied()
            .unwrap_or(ObjectId::ZERO);
        if current != command.old_target {
            return Ok(ReceiveReport {
                rejected: Some(format!(
                    "stale expected value for {} (now {current})",
                    command.reference
                )),
            });
        }
        for packed in metadata {
            let id = object_id_of(packed.kind, &packed.body);
            state.objects.insert(id, (packed.kind, packed.body));
        }
        state.refs.insert(command.reference, command.new_target);
        Ok(ReceiveReport::ok())
    }
}
