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

//! The object database: a loose content-addressed store with decoded-object
//! caching and a hook for fetching missing objects from the promisor.
//!
//! Writes go through a temp file in the store directory and an atomic
//! rename, so a torn write never produces a resolvable id. Loose files are
//! zstd-compressed canonical forms (`"<kind> <len>\0"` + body).

use std::collections::HashSet;
use std::fs;
use std::fs::File;
use std::io;
use std::io::Read;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::Weak;

use clru::CLruCache;
use digest::Digest as _;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncReadExt as _;
use tracing::debug;
use tracing::instrument;

use crate::config::ChunkConfig;
use crate::file_util::persist_content_addressed_temp_file;
use crate::fragments;
use crate::hash::HexPrefix;
use crate::hash::ObjectHasher;
use crate::hash::ObjectId;
use crate::hash::PrefixResolution;
use crate::object::Commit;
use crate::object::FileMode;
use crate::object::Fragments;
use crate::object::Object;
use crate::object::ObjectCodecError;
use crate::object::ObjectKind;
use crate::object::Tag;
use crate::object::Tree;
use crate::object::decode_body;
use crate::object::encode_body;
use crate::object::object_header;
use crate::object::object_id_of;
use crate::op_context::CancelledError;
use crate::op_context::OpContext;
use crate::sparse::SparseMatcher;
use crate::sparse::Visit;
use crate::transport::TransportError;

// There are more tree objects than commits, and trees are often shared
// across commits.
const COMMIT_CACHE_CAPACITY: usize = 100;
const TREE_CACHE_CAPACITY: usize = 1000;
const FRAGMENTS_CACHE_CAPACITY: usize = 100;

/// Attempts per large-object transfer before the error is fatal.
const MAX_TRANSFER_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum OdbError {
    #[error("Object {0} not found")]
    NotFound(ObjectId),
    #[error("Object {id} is corrupt: {reason}")]
    Corrupt { id: ObjectId, reason: String },
    #[error("Object {id} is a {actual}, expected {expected}")]
    WrongKind {
        id: ObjectId,
        actual: ObjectKind,
        expected: ObjectKind,
    },
    #[error(transparent)]
    Codec(#[from] ObjectCodecError),
    #[error("Fetching object {id} from remote failed")]
    Fetch {
        id: ObjectId,
        source: TransportError,
    },
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
    #[error("Object store I/O error")]
    Io(#[from] io::Error),
}

pub type OdbResult<T> = Result<T, OdbError>;

/// Fetches objects that are known to the remote but absent locally. The
/// promisor implements this; the store holds it weakly to avoid a cycle
/// through the repository handle.
pub trait MissingObjectFetcher: Send + Sync {
    fn fetch(&self, ctx: &OpContext, wants: &[EntryRecord]) -> Result<(), TransportError>;
}

/// A blob or fragments entry discovered while walking a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub path: String,
    pub mode: FileMode,
    pub hash: ObjectId,
    pub size: u64,
}

/// How [`ObjectDb::do_transfer`] treats an existing partial temp file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Continue from the bytes already on disk.
    Resume,
    /// Discard any partial state and start over.
    Restart,
}

/// A streamed object body with its kind and logical size.
pub struct ObjectReader<'a> {
    pub kind: ObjectKind,
    pub size: u64,
    inner: Box<dyn Read + Send + 'a>,
}

impl Read for ObjectReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

pub struct ObjectDb {
    root: PathBuf,
    chunk: ChunkConfig,
    commit_cache: Mutex<CLruCache<ObjectId, Arc<Commit>>>,
    tree_cache: Mutex<CLruCache<ObjectId, Arc<Tree>>>,
    fragments_cache: Mutex<CLruCache<ObjectId, Arc<Fragments>>>,
    /// Objects the remote is known to have but that are not present
    /// locally. Populated while unpacking metadata.
    promised: Mutex<HashSet<ObjectId>>,
    fetcher: RwLock<Option<Weak<dyn MissingObjectFetcher>>>,
}

impl std::fmt::Debug for ObjectDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectDb")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ObjectDb {
    pub fn init(root: &Path, chunk: ChunkConfig) -> OdbResult<Self> {
        fs::create_dir_all(root.join("tmp"))?;
        Ok(Self::load(root, chunk))
    }

    pub fn load(root: &Path, chunk: ChunkConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            chunk,
            commit_cache: Mutex::new(CLruCache::new(COMMIT_CACHE_CAPACITY.try_into().unwrap())),
            tree_cache: Mutex::new(CLruCache::new(TREE_CACHE_CAPACITY.try_into().unwrap())),
            fragments_cache: Mutex::new(CLruCache::new(
                FRAGMENTS_CACHE_CAPACITY.try_into().unwrap(),
            )),
            promised: Mutex::new(HashSet::new()),
            fetcher: RwLock::new(None),
        }
    }

    pub fn chunk_config(&self) -> ChunkConfig {
        self.chunk
    }

    /// Installs the promisor hook. Weak so the store does not keep the
    /// promisor (and through it the transport) alive.
    pub fn set_missing_fetcher(&self, fetcher: Weak<dyn MissingObjectFetcher>) {
        *self.fetcher.write().unwrap() = Some(fetcher);
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    /// Scratch directory for in-flight transfers, inside the store so the
    /// final rename stays on one filesystem.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn partial_path(&self, id: &ObjectId) -> PathBuf {
        self.root.join("tmp").join(format!("{}.part", id.hex()))
    }

    /// Whether the object is available. With `strict` only locally present
    /// objects count; otherwise placeholders known to exist remotely are
    /// accepted too.
    pub fn exists(&self, id: &ObjectId, strict: bool) -> bool {
        if self.object_path(id).is_file() {
            return true;
        }
        !strict && self.promised.lock().unwrap().contains(id)
    }

    pub fn mark_promised(&self, id: ObjectId) {
        self.promised.lock().unwrap().insert(id);
    }

    /// Removes a locally cached object that can be re-fetched later. The
    /// id stays resolvable in non-strict mode.
    pub fn prune_object(&self, id: &ObjectId) -> OdbResult<()> {
        match fs::remove_file(self.object_path(id)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.commit_cache.lock().unwrap().pop(id);
        self.tree_cache.lock().unwrap().pop(id);
        self.fragments_cache.lock().unwrap().pop(id);
        self.mark_promised(*id);
        Ok(())
    }

    /// Stores `body` under kind `kind` and returns its id. Writing is
    /// atomic; concurrent writers of the same content race benignly.
    pub fn put_raw(&self, kind: ObjectKind, body: &[u8]) -> OdbResult<ObjectId> {
        let id = object_id_of(kind, body);
        let path = self.object_path(&id);
        if path.is_file() {
            return Ok(id);
        }
        let temp_file = NamedTempFile::new_in(&self.root)?;
        let mut encoder = zstd::stream::write::Encoder::new(temp_file.as_file(), 0)?;
        encoder.write_all(&object_header(kind, body.len()))?;
        encoder.write_all(body)?;
        encoder.finish()?;
        fs::create_dir_all(path.parent().unwrap())?;
        persist_content_addressed_temp_file(temp_file, path)?;
        self.promised.lock().unwrap().remove(&id);
        Ok(id)
    }

    /// Stores raw bytes as a blob.
    pub fn put_bytes(&self, bytes: &[u8]) -> OdbResult<ObjectId> {
        self.put_raw(ObjectKind::Blob, bytes)
    }

    /// Streams `size` bytes of blob content into the store without holding
    /// the content in memory. Used for large downloaded objects.
    pub fn put_blob_stream(&self, input: &mut dyn Read, size: u64) -> OdbResult<ObjectId> {
        let temp_file = NamedTempFile::new_in(&self.root)?;
        let mut encoder = zstd::stream::write::Encoder::new(temp_file.as_file(), 0)?;
        let header = object_header(ObjectKind::Blob, size as usize);
        encoder.write_all(&header)?;
        let mut hasher = ObjectHasher::new();
        hasher.update(&header);
        let mut buf = vec![0u8; 1 << 16];
        let mut remaining = size;
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = input.read(&mut buf[..want])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "input shorter than declared size",
                )
                .into());
            }
            encoder.write_all(&buf[..n])?;
            hasher.update(&buf[..n]);
            remaining -= n as u64;
        }
        encoder.finish()?;
        let id = ObjectId::from_digest(hasher);
        let path = self.object_path(&id);
        fs::create_dir_all(path.parent().unwrap())?;
        persist_content_addressed_temp_file(temp_file, path)?;
        self.promised.lock().unwrap().remove(&id);
        Ok(id)
    }

    /// Canonical-encodes a typed object and stores it.
    pub fn put_encoded(&self, object: &Object) -> OdbResult<ObjectId> {
        self.put_raw(object.kind(), &encode_body(object))
    }

    /// Verifies and stores one packed metadata object from the wire.
    /// Blob/fragment ids referenced by unpacked trees are recorded as
    /// promised.
    pub fn unpack(&self, kind: ObjectKind, body: &[u8]) -> OdbResult<ObjectId> {
        let id = object_id_of(kind, body);
        if kind != ObjectKind::Blob {
            let object = decode_body(kind, body).map_err(|err| OdbError::Corrupt {
                id,
                reason: err.to_string(),
            })?;
            match &object {
                Object::Tree(tree) => {
                    let mut promised = self.promised.lock().unwrap();
                    for entry in tree.entries() {
                        if !entry.mode.is_dir() && !self.object_path(&entry.hash).is_file() {
                            promised.insert(entry.hash);
                        }
                    }
                }
                Object::Fragments(fragments) => {
                    let mut promised = self.promised.lock().unwrap();
                    for entry in &fragments.entries {
                        if !self.object_path(&entry.hash).is_file() {
                            promised.insert(entry.hash);
                        }
                    }
                }
                _ => {}
            }
        }
        self.put_raw(kind, body)
    }

    fn read_loose(&self, id: &ObjectId) -> OdbResult<(ObjectKind, u64, impl Read + Send + use<>)> {
        let file = File::open(self.object_path(id)).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                OdbError::NotFound(*id)
            } else {
                OdbError::Io(err)
            }
        })?;
        let mut decoder = zstd::stream::read::Decoder::new(file).map_err(|err| OdbError::Corrupt {
            id: *id,
            reason: err.to_string(),
        })?;
        let (kind, size) = read_object_header(&mut decoder).map_err(|err| OdbError::Corrupt {
            id: *id,
            reason: err.to_string(),
        })?;
        Ok((kind, size, decoder))
    }

    /// Opens a local object for streaming. Fails with `NotFound` if the
    /// object is absent locally; use [`Self::ensure_local`] first when the
    /// object may still be remote.
    pub fn get(&self, id: &ObjectId) -> OdbResult<ObjectReader<'static>> {
        let (kind, size, reader) = self.read_loose(id)?;
        Ok(ObjectReader {
            kind,
            size,
            inner: Box::new(reader),
        })
    }

    /// Reads a whole object into memory. Intended for metadata and small
    /// blobs.
    pub fn get_bytes(&self, id: &ObjectId) -> OdbResult<(ObjectKind, Vec<u8>)> {
        let (kind, size, mut reader) = self.read_loose(id)?;
        let mut body = Vec::with_capacity(size as usize);
        reader.read_to_end(&mut body)?;
        if body.len() as u64 != size {
            return Err(OdbError::Corrupt {
                id: *id,
                reason: format!("header says {size} bytes, got {}", body.len()),
            });
        }
        Ok((kind, body))
    }

    /// Makes sure `records` are present locally, asking the promisor for
    /// the ones that are not.
    #[instrument(skip_all)]
    pub fn ensure_local(&self, ctx: &OpContext, records: &[EntryRecord]) -> OdbResult<()> {
        let missing: Vec<EntryRecord> = records
            .iter()
            .filter(|record| !self.object_path(&record.hash).is_file())
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        ctx.check()?;
        let fetcher = self
            .fetcher
            .read()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade);
        let Some(fetcher) = fetcher else {
            return Err(OdbError::NotFound(missing[0].hash));
        };
        debug!(count = missing.len(), "fetching missing objects on demand");
        fetcher
            .fetch(ctx, &missing)
            .map_err(|source| OdbError::Fetch {
                id: missing[0].hash,
                source,
            })?;
        for record in &missing {
            if !self.object_path(&record.hash).is_file() {
                return Err(OdbError::NotFound(record.hash));
            }
        }
        Ok(())
    }

    fn cached<T: Clone>(
        cache: &Mutex<CLruCache<ObjectId, Arc<T>>>,
        id: &ObjectId,
    ) -> Option<Arc<T>> {
        cache.lock().unwrap().get(id).cloned()
    }

    pub fn commit(&self, id: &ObjectId) -> OdbResult<Arc<Commit>> {
        if let Some(commit) = Self::cached(&self.commit_cache, id) {
            return Ok(commit);
        }
        let (kind, body) = self.get_bytes(id)?;
        let Object::Commit(commit) = self.decode_checked(id, kind, ObjectKind::Commit, &body)?
        else {
            unreachable!()
        };
        let commit = Arc::new(commit);
        self.commit_cache.lock().unwrap().put(*id, commit.clone());
        Ok(commit)
    }

    pub fn tree(&self, id: &ObjectId) -> OdbResult<Arc<Tree>> {
        if let Some(tree) = Self::cached(&self.tree_cache, id) {
            return Ok(tree);
        }
        let (kind, body) = self.get_bytes(id)?;
        let Object::Tree(tree) = self.decode_checked(id, kind, ObjectKind::Tree, &body)? else {
            unreachable!()
        };
        let tree = Arc::new(tree);
        self.tree_cache.lock().unwrap().put(*id, tree.clone());
        Ok(tree)
    }

    pub fn fragments(&self, id: &ObjectId) -> OdbResult<Arc<Fragments>> {
        if let Some(fragments) = Self::cached(&self.fragments_cache, id) {
            return Ok(fragments);
        }
        let (kind, body) = self.get_bytes(id)?;
        let Object::Fragments(fragments) =
            self.decode_checked(id, kind, ObjectKind::Fragments, &body)?
        else {
            unreachable!()
        };
        let fragments = Arc::new(fragments);
        self.fragments_cache
            .lock()
            .unwrap()
            .put(*id, fragments.clone());
        Ok(fragments)
    }

    pub fn tag(&self, id: &ObjectId) -> OdbResult<Tag> {
        let (kind, body) = self.get_bytes(id)?;
        let Object::Tag(tag) = self.decode_checked(id, kind, ObjectKind::Tag, &body)? else {
            unreachable!()
        };
        Ok(tag)
    }

    fn decode_checked(
        &self,
        id: &ObjectId,
        actual: ObjectKind,
        expected: ObjectKind,
        body: &[u8],
    ) -> OdbResult<Object> {
        if actual != expected {
            return Err(OdbError::WrongKind {
                id: *id,
                actual,
                expected,
            });
        }
        decode_body(actual, body).map_err(|err| OdbError::Corrupt {
            id: *id,
            reason: err.to_string(),
        })
    }

    /// Reads a blob's raw content into memory.
    pub fn blob_bytes(&self, id: &ObjectId) -> OdbResult<Vec<u8>> {
        let (kind, body) = self.get_bytes(id)?;
        if kind != ObjectKind::Blob {
            return Err(OdbError::WrongKind {
                id: *id,
                actual: kind,
                expected: ObjectKind::Blob,
            });
        }
        Ok(body)
    }

    /// Hashes and stores streamed content of known size. Content at or
    /// above the fragment threshold is split into chunk blobs plus a
    /// manifest; the returned flag tells which representation was written.
    pub fn hash_to(&self, input: &mut dyn Read, size: u64) -> OdbResult<(ObjectId, bool)> {
        if size >= self.chunk.threshold {
            let manifest =
                fragments::write_fragments(input, size, self.chunk.size, |chunk| {
                    self.put_bytes(chunk)
                })?;
            let id = self.put_encoded(&Object::Fragments(manifest))?;
            Ok((id, true))
        } else {
            let mut body = Vec::with_capacity(size as usize);
            input.take(size).read_to_end(&mut body)?;
            if body.len() as u64 != size {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "input shorter than declared size",
                )
                .into());
            }
            let id = self.put_bytes(&body)?;
            Ok((id, false))
        }
    }

    /// Computes the blob hash of streamed content without storing it.
    pub fn hash_only(input: &mut dyn Read, size: u64) -> OdbResult<ObjectId> {
        let mut hasher = ObjectHasher::new();
        hasher.update(object_header(ObjectKind::Blob, size as usize));
        let mut buf = vec![0u8; 1 << 14];
        let mut remaining = size;
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = input.read(&mut buf[..want])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "input shorter than declared size",
                )
                .into());
            }
            hasher.update(&buf[..n]);
            remaining -= n as u64;
        }
        Ok(ObjectId::from_digest(hasher))
    }

    /// Opens the logical content of a file entry: the blob itself, or the
    /// chunk chain of a fragmented file with origin verification at EOF.
    pub fn open_content<'a>(
        &'a self,
        ctx: &OpContext,
        record: &EntryRecord,
    ) -> OdbResult<ObjectReader<'a>> {
        if record.mode.is_fragments() {
            let manifest = self.fragments(&record.hash)?;
            let chunk_records: Vec<EntryRecord> = manifest
                .entries
                .iter()
                .map(|entry| EntryRecord {
                    path: record.path.clone(),
                    mode: record.mode.without_fragments(),
                    hash: entry.hash,
                    size: entry.size,
                })
                .collect();
            self.ensure_local(ctx, &chunk_records)?;
            Ok(ObjectReader {
                kind: ObjectKind::Blob,
                size: manifest.size,
                inner: Box::new(FragmentsContentReader::new(self, manifest)),
            })
        } else {
            self.ensure_local(ctx, std::slice::from_ref(record))?;
            let reader = self.get(&record.hash)?;
            if reader.kind != ObjectKind::Blob {
                return Err(OdbError::WrongKind {
                    id: record.hash,
                    actual: reader.kind,
                    expected: ObjectKind::Blob,
                });
            }
            Ok(reader)
        }
    }

    /// Resolves a hex prefix against the locally present objects.
    pub fn resolve_prefix(&self, prefix: &HexPrefix) -> PrefixResolution<ObjectId> {
        let hex = prefix.hex();
        let mut resolution = PrefixResolution::NoMatch;
        let fan_out: Vec<String> = if hex.len() >= 2 {
            vec![hex[..2].to_owned()]
        } else {
            let Ok(dirs) = fs::read_dir(&self.root) else {
                return resolution;
            };
            dirs.filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().into_string().ok())
                .filter(|name| name.len() == 2 && name.starts_with(&hex))
                .collect()
        };
        for dir in fan_out {
            let Ok(entries) = fs::read_dir(self.root.join(&dir)) else {
                continue;
            };
            for entry in entries.filter_map(|entry| entry.ok()) {
                let Some(name) = entry.file_name().into_string().ok() else {
                    continue;
                };
                let full = format!("{dir}{name}");
                let Some(id) = ObjectId::try_from_hex(&full) else {
                    continue;
                };
                if prefix.matches(&id) {
                    resolution = resolution.plus(&PrefixResolution::SingleMatch(id));
                    if resolution == PrefixResolution::AmbiguousMatch {
                        return resolution;
                    }
                }
            }
        }
        resolution
    }

    /// Walks the tree of `commit_id`, skipping directories excluded by the
    /// sparse set, and hands blob/fragments entries to `callback` in
    /// batches of at most `max_batch`.
    pub fn iterate_entries(
        &self,
        ctx: &OpContext,
        commit_id: &ObjectId,
        sparse: &SparseMatcher,
        max_batch: usize,
        callback: &mut dyn FnMut(&[EntryRecord]) -> OdbResult<()>,
    ) -> OdbResult<()> {
        let commit = self.commit(commit_id)?;
        let mut batch = Vec::new();
        self.walk_tree(ctx, &commit.tree, "", sparse, max_batch, &mut batch, callback)?;
        if !batch.is_empty() {
            callback(&batch)?;
        }
        Ok(())
    }

    #[expect(clippy::too_many_arguments)]
    fn walk_tree(
        &self,
        ctx: &OpContext,
        tree_id: &ObjectId,
        prefix: &str,
        sparse: &SparseMatcher,
        max_batch: usize,
        batch: &mut Vec<EntryRecord>,
        callback: &mut dyn FnMut(&[EntryRecord]) -> OdbResult<()>,
    ) -> OdbResult<()> {
        ctx.check()?;
        let tree = self.tree(tree_id)?;
        for entry in tree.entries() {
            let path = if prefix.is_empty() {
                entry.name.clone()
            } else {
                format!("{prefix}/{}", entry.name)
            };
            if entry.mode.is_dir() {
                if sparse.visit_dir(&path) != Visit::Nothing {
                    self.walk_tree(ctx, &entry.hash, &path, sparse, max_batch, batch, callback)?;
                }
            } else if sparse.matches_file(&path) {
                batch.push(EntryRecord {
                    path,
                    mode: entry.mode,
                    hash: entry.hash,
                    size: entry.size,
                });
                if batch.len() >= max_batch {
                    callback(batch)?;
                    batch.clear();
                }
            }
        }
        Ok(())
    }

    /// Streams one large object's raw content into the store, retrying
    /// retryable transport errors and resuming from the byte offset already
    /// on disk. The content must hash to `id` as a blob.
    #[instrument(skip(self, ctx, fetch, progress))]
    pub async fn do_transfer<F, Fut>(
        &self,
        ctx: &OpContext,
        id: &ObjectId,
        fetch: F,
        progress: &mut dyn FnMut(u64),
        mode: TransferMode,
    ) -> OdbResult<()>
    where
        F: Fn(u64) -> Fut,
        Fut: Future<Output = Result<(crate::transport::ByteStream, u64), TransportError>>,
    {
        if self.object_path(id).is_file() {
            return Ok(());
        }
        let partial = self.partial_path(id);
        if mode == TransferMode::Restart {
            let _ = fs::remove_file(&partial);
        }
        let result = self.transfer_attempts(ctx, id, &fetch, progress, &partial).await;
        if result.is_err() {
            // Leave no partial state behind on unwind.
            let _ = fs::remove_file(&partial);
        }
        result
    }

    async fn transfer_attempts<F, Fut>(
        &self,
        ctx: &OpContext,
        id: &ObjectId,
        fetch: &F,
        progress: &mut dyn FnMut(u64),
        partial: &Path,
    ) -> OdbResult<()>
    where
        F: Fn(u64) -> Fut,
        Fut: Future<Output = Result<(crate::transport::ByteStream, u64), TransportError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            ctx.check()?;
            let offset = fs::metadata(partial).map(|m| m.len()).unwrap_or(0);
            match self.transfer_once(ctx, id, fetch, progress, partial, offset).await {
                Ok(()) => return Ok(()),
                Err(OdbError::Fetch { source, .. })
                    if source.is_retryable() && attempt < MAX_TRANSFER_ATTEMPTS =>
                {
                    debug!(%id, attempt, "retrying object transfer");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn transfer_once<F, Fut>(
        &self,
        ctx: &OpContext,
        id: &ObjectId,
        fetch: &F,
        progress: &mut dyn FnMut(u64),
        partial: &Path,
        offset: u64,
    ) -> OdbResult<()>
    where
        F: Fn(u64) -> Fut,
        Fut: Future<Output = Result<(crate::transport::ByteStream, u64), TransportError>>,
    {
        let (mut stream, _remaining) = fetch(offset)
            .await
            .map_err(|source| OdbError::Fetch { id: *id, source })?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(partial)?;
        let mut transferred = offset;
        let mut buf = vec![0u8; 1 << 16];
        loop {
            ctx.check()?;
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|err| OdbError::Fetch {
                    id: *id,
                    source: TransportError::Network {
                        reason: err.to_string(),
                        retryable: true,
                    },
                })?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            transferred += n as u64;
            progress(transferred);
        }
        drop(file);

        // Verify the assembled content before it becomes resolvable.
        let size = fs::metadata(partial)?.len();
        let mut content = File::open(partial)?;
        let actual = Self::hash_only(&mut content, size)?;
        if actual != *id {
            let _ = fs::remove_file(partial);
            return Err(OdbError::Corrupt {
                id: *id,
                reason: format!("transferred content hashes to {actual}"),
            });
        }
        let mut content = File::open(partial)?;
        let stored = self.put_blob_stream(&mut content, size)?;
        debug_assert_eq!(stored, *id);
        let _ = fs::remove_file(partial);
        Ok(())
    }

    /// Builds and stores the tree hierarchy described by path-sorted
    /// `records`, returning the root tree id. Empty input produces the
    /// empty tree.
    pub fn write_records_as_tree(&self, records: &[EntryRecord]) -> OdbResult<ObjectId> {
        self.write_tree_level(records, "")
    }

    fn write_tree_level(&self, records: &[EntryRecord], prefix: &str) -> OdbResult<ObjectId> {
        use crate::object::TreeEntry;
        let mut entries = Vec::new();
        let mut i = 0;
        while i < records.len() {
            let rest = &records[i].path[prefix.len()..];
            match rest.split_once('/') {
                None => {
                    let record = &records[i];
                    entries.push(TreeEntry::new(rest, record.mode, record.hash, record.size));
                    i += 1;
                }
                Some((dir, _)) => {
                    let child_prefix = format!("{prefix}{dir}/");
                    let end = i + records[i..]
                        .iter()
                        .take_while(|record| record.path.starts_with(&child_prefix))
                        .count();
                    let subtree = self.write_tree_level(&records[i..end], &child_prefix)?;
                    entries.push(TreeEntry::new(dir, FileMode::DIR, subtree, 0));
                    i = end;
                }
            }
        }
        self.put_encoded(&Object::Tree(Tree::from_entries(entries)))
    }
}

/// Chains a fragmented file's chunk blobs in index order and verifies the
/// assembled content against the manifest origin at EOF.
struct FragmentsContentReader<'a> {
    odb: &'a ObjectDb,
    manifest: Arc<Fragments>,
    next_chunk: usize,
    current: Option<ObjectReader<'static>>,
    hasher: Option<ObjectHasher>,
    finished: bool,
}

impl<'a> FragmentsContentReader<'a> {
    fn new(odb: &'a ObjectDb, manifest: Arc<Fragments>) -> Self {
        let mut hasher = ObjectHasher::new();
        hasher.update(object_header(ObjectKind::Blob, manifest.size as usize));
        Self {
            odb,
            manifest,
            next_chunk: 0,
            current: None,
            hasher: Some(hasher),
            finished: false,
        }
    }
}

impl Read for FragmentsContentReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.finished {
                return Ok(0);
            }
            if self.current.is_none() {
                if self.next_chunk == self.manifest.entries.len() {
                    let hasher = self.hasher.take().expect("hasher consumed once");
                    let origin = ObjectId::from_digest(hasher);
                    self.finished = true;
                    if origin != self.manifest.origin {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!(
                                "fragment assembly hashes to {origin}, manifest origin is {}",
                                self.manifest.origin
                            ),
                        ));
                    }
                    return Ok(0);
                }
                let entry = &self.manifest.entries[self.next_chunk];
                self.next_chunk += 1;
                let reader = self
                    .odb
                    .get(&entry.hash)
                    .map_err(|err| io::Error::new(io::ErrorKind::NotFound, err.to_string()))?;
                self.current = Some(reader);
            }
            let reader = self.current.as_mut().unwrap();
            let n = reader.read(buf)?;
            if n == 0 {
                self.current = None;
                continue;
            }
            self.hasher.as_mut().unwrap().update(&buf[..n]);
            return Ok(n);
        }
    }
}

fn read_object_header(reader: &mut dyn Read) -> io::Result<(ObjectKind, u64)> {
    let mut header = Vec::with_capacity(32);
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte)?;
        if byte[0] == 0 {
            break;
        }
        if header.len() > 64 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "oversized object header"));
        }
        header.push(byte[0]);
    }
    let header = std::str::from_utf8(&header)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 object header"))?;
    let (kind, size) = header
        .split_once(' ')
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed object header"))?;
    let kind: ObjectKind = kind
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "unknown object kind"))?;
    let size: u64 = size
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad object size"))?;
    Ok((kind, size))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::object::TreeEntry;

    fn new_odb() -> (tempfile::TempDir, ObjectDb) {
        let dir = tempfile::tempdir().unwrap();
        let odb = ObjectDb::init(&dir.path().join("objects"), ChunkConfig::default()).unwrap();
        (dir, odb)
    }

    #[test]
    fn test_put_get_round_trip() {
        let (_dir, odb) = new_odb();
        let id = odb.put_bytes(b"hello, zeta").unwrap();
        let (kind, body) = odb.get_bytes(&id).unwrap();
        assert_eq!(kind, ObjectKind::Blob);
        assert_eq!(body, b"hello, zeta");
        assert!(odb.exists(&id, true));
    }

    #[test]
    fn test_get_missing() {
        let (_dir, odb) = new_odb();
        let id = ObjectId::hash_of(b"nope");
        assert_matches!(odb.get_bytes(&id), Err(OdbError::NotFound(_)));
        assert!(!odb.exists(&id, true));
    }

    #[test]
    fn test_promised_exists_lenient_only() {
        let (_dir, odb) = new_odb();
        let id = ObjectId::hash_of(b"remote-only");
        odb.mark_promised(id);
        assert!(!odb.exists(&id, true));
        assert!(odb.exists(&id, false));
    }

    #[test]
    fn test_torn_temp_file_is_ignored() {
        let (dir, odb) = new_odb();
        // A crashed writer leaves a temp file behind; it must never resolve
        // as an object.
        fs::write(dir.path().join("objects/.tmpZZZZ"), b"garbage").unwrap();
        let id = ObjectId::hash_of(b"something");
        assert_matches!(odb.get_bytes(&id), Err(OdbError::NotFound(_)));
        let reloaded = ObjectDb::load(&dir.path().join("objects"), ChunkConfig::default());
        assert_matches!(reloaded.get_bytes(&id), Err(OdbError::NotFound(_)));
    }

    #[test]
    fn test_typed_round_trip_via_cache() {
        let (_dir, odb) = new_odb();
        let tree = Tree::from_entries(vec![TreeEntry::new(
            "a.txt",
            FileMode::REGULAR,
            odb.put_bytes(b"a\n").unwrap(),
            2,
        )]);
        let id = odb.put_encoded(&Object::Tree(tree.clone())).unwrap();
        assert_eq!(*odb.tree(&id).unwrap(), tree);
        // Second read hits the cache and still agrees.
        assert_eq!(*odb.tree(&id).unwrap(), tree);
    }

    #[test]
    fn test_wrong_kind() {
        let (_dir, odb) = new_odb();
        let id = odb.put_bytes(b"not a tree").unwrap();
        assert_matches!(odb.tree(&id), Err(OdbError::WrongKind { .. }));
    }

    #[test]
    fn test_hash_to_small_and_fragmented() {
        let (_dir, odb) = new_odb();

        let small = b"small content".to_vec();
        let (id, is_fragments) = odb.hash_to(&mut small.as_slice(), small.len() as u64).unwrap();
        assert!(!is_fragments);
        assert_eq!(id, object_id_of(ObjectKind::Blob, &small));

        let big: Vec<u8> = (0..(5 << 20)).map(|i: u32| (i % 251) as u8).collect();
        let (id, is_fragments) = odb.hash_to(&mut big.as_slice(), big.len() as u64).unwrap();
        assert!(is_fragments);
        let manifest = odb.fragments(&id).unwrap();
        assert_eq!(manifest.size, big.len() as u64);
        assert_eq!(manifest.origin, object_id_of(ObjectKind::Blob, &big));
        assert_eq!(manifest.entries.len(), 2);

        // Reading the logical content back reproduces the original bytes.
        let record = EntryRecord {
            path: "big.bin".to_owned(),
            mode: FileMode::REGULAR.with_fragments(),
            hash: id,
            size: manifest.size,
        };
        let mut reader = odb.open_content(&OpContext::background(), &record).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, big);
    }

    #[test]
    fn test_fragment_assembly_detects_corruption() {
        let (_dir, odb) = new_odb();
        let big: Vec<u8> = vec![42; 5 << 20];
        let (id, _) = odb.hash_to(&mut big.as_slice(), big.len() as u64).unwrap();
        let manifest = odb.fragments(&id).unwrap();

        // Overwrite one chunk with different content under a forged loose
        // file to simulate on-disk corruption.
        let victim = manifest.entries[0].hash;
        let path = odb.object_path(&victim);
        let forged = {
            let mut data = object_header(ObjectKind::Blob, (4 << 20) as usize);
            data.extend_from_slice(&vec![7u8; 4 << 20]);
            zstd::encode_all(&data[..], 0).unwrap()
        };
        fs::write(&path, forged).unwrap();

        let record = EntryRecord {
            path: "big.bin".to_owned(),
            mode: FileMode::REGULAR.with_fragments(),
            hash: id,
            size: manifest.size,
        };
        let mut reader = odb.open_content(&OpContext::background(), &record).unwrap();
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }

    #[test]
    fn test_prune_object_keeps_promise() {
        let (_dir, odb) = new_odb();
        let id = odb.put_bytes(b"large thing").unwrap();
        odb.prune_object(&id).unwrap();
        assert!(!odb.exists(&id, true));
        assert!(odb.exists(&id, false));
    }

    #[test]
    fn test_resolve_prefix() {
        let (_dir, odb) = new_odb();
        let id = odb.put_bytes(b"only object").unwrap();
        let prefix = HexPrefix::try_from_hex(&id.hex()[..8]).unwrap();
        assert_eq!(odb.resolve_prefix(&prefix), PrefixResolution::SingleMatch(id));
        let none = HexPrefix::try_from_hex("ffffff").unwrap();
        // Either no match or, with astronomically small odds, a match.
        assert_ne!(odb.resolve_prefix(&none), PrefixResolution::AmbiguousMatch);
    }

    #[test]
    fn test_iterate_entries_sparse() {
        let (_dir, odb) = new_odb();
        let blob = odb.put_bytes(b"x").unwrap();
        let sub = odb
            .put_encoded(&Object::Tree(Tree::from_entries(vec![TreeEntry::new(
                "hidden.bin",
                FileMode::REGULAR,
                blob,
                1,
            )])))
            .unwrap();
        let root_tree = odb
            .put_encoded(&Object::Tree(Tree::from_entries(vec![
                TreeEntry::new("kept.txt", FileMode::REGULAR, blob, 1),
                TreeEntry::new("assets", FileMode::DIR, sub, 0),
            ])))
            .unwrap();
        let commit = Commit {
            tree: root_tree,
            parents: Default::default(),
            author: crate::object::Signature {
                name: "t".into(),
                email: "t@example.com".into(),
                when: crate::object::Timestamp {
                    millis_since_epoch: 0,
                    tz_offset: 0,
                },
            },
            committer: crate::object::Signature {
                name: "t".into(),
                email: "t@example.com".into(),
                when: crate::object::Timestamp {
                    millis_since_epoch: 0,
                    tz_offset: 0,
                },
            },
            message: "m".into(),
            extra_headers: vec![],
        };
        let commit_id = odb.put_encoded(&Object::Commit(commit)).unwrap();

        let sparse = SparseMatcher::new(["kept.txt".to_owned()]);
        let mut seen = Vec::new();
        odb.iterate_entries(
            &OpContext::background(),
            &commit_id,
            &sparse,
            16,
            &mut |batch| {
                seen.extend(batch.iter().map(|record| record.path.clone()));
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(seen, vec!["kept.txt"]);

        let mut all = Vec::new();
        odb.iterate_entries(
            &OpContext::background(),
            &commit_id,
            &SparseMatcher::match_all(),
            16,
            &mut |batch| {
                all.extend(batch.iter().map(|record| record.path.clone()));
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(all, vec!["assets/hidden.bin", "kept.txt"]);
    }
}
