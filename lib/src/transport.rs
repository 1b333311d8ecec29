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

//! The wire seam between the repository core and a remote.
//!
//! The concrete HTTP/SSH plumbing lives outside this crate; the core talks
//! to a [`Transport`] implementation and never sees sockets. All methods
//! return structured errors so callers can distinguish retryable network
//! failures from remote rejections.

use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::hash::ObjectId;
use crate::object::ObjectKind;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Remote does not know {0}")]
    NotFound(String),
    #[error("Remote rejected the request: {0}")]
    Rejected(String),
    #[error("Signed URL for {0} expired")]
    ExpiredRepresentation(ObjectId),
    #[error("Network error: {reason}")]
    Network {
        reason: String,
        /// Whether retrying the same request may succeed.
        retryable: bool,
    },
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { retryable: true, .. })
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A reference as the remote reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteReference {
    pub name: String,
    pub target: ObjectId,
    /// The remote's shallow boundary for this ref, if any.
    pub shallow: Option<ObjectId>,
}

/// Request for the metadata (commits/trees/tags/fragments) closure of a
/// target commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataRequest {
    pub target: ObjectId,
    /// Known local tip; the remote may stop enumerating below it.
    pub have: Option<ObjectId>,
    /// Deepen from this boundary commit (inclusive).
    pub deepen_from: Option<ObjectId>,
    /// Depth budget: `Some(-1)` requests full history (unshallow),
    /// `Some(n > 0)` limits commit depth, `None` uses the remote default.
    pub deepen: Option<i32>,
    /// Sparse roots; the remote may prune tree entries outside them.
    pub sparse_dirs: Vec<String>,
}

/// One compressed metadata object on the wire. The id is implied: it must
/// equal the hash of the canonical form, which the unpacker verifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedObject {
    pub kind: ObjectKind,
    pub body: Vec<u8>,
}

/// A direct-download representation of a large object, optionally handed to
/// an external accelerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedRepresentation {
    pub id: ObjectId,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Seconds until the signed URL expires.
    pub expires_in: u64,
}

/// An object the pusher offers to the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaveObject {
    pub id: ObjectId,
    pub size: u64,
}

/// Per-object verdict from `batch_check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchCheckAction {
    /// The remote already has the object.
    Present(ObjectId),
    /// The object must be uploaded via `put_object`.
    Upload(ObjectId),
}

/// Reference update command sent with a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushCommand {
    pub reference: String,
    pub old_target: ObjectId,
    pub new_target: ObjectId,
}

/// The remote's verdict on a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveReport {
    /// `Some(reason)` when the update was rejected.
    pub rejected: Option<String>,
}

impl ReceiveReport {
    pub fn ok() -> Self {
        Self { rejected: None }
    }
}

pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Operations the core consumes from a remote. Implementations must be safe
/// to call concurrently up to the configured transfer parallelism.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolves a reference name on the remote.
    async fn fetch_reference(&self, name: &str) -> TransportResult<RemoteReference>;

    /// Streams the metadata closure for `request.target`, newest first.
    async fn fetch_metadata(
        &self,
        request: MetadataRequest,
    ) -> TransportResult<BoxStream<'static, TransportResult<PackedObject>>>;

    /// Streams the packed forms of the requested small objects.
    async fn batch_objects(
        &self,
        ids: &[ObjectId],
    ) -> TransportResult<BoxStream<'static, TransportResult<PackedObject>>>;

    /// Opens a raw content stream for one object, starting at `offset`.
    /// Returns the reader and the total remaining size.
    async fn get_object(&self, id: &ObjectId, offset: u64) -> TransportResult<(ByteStream, u64)>;

    /// Obtains direct-download representations for large objects, if the
    /// remote offers them.
    async fn shared(&self, wants: &[ObjectId]) -> TransportResult<Vec<SharedRepresentation>>;

    /// Asks the remote which of `haves` need uploading before a push to
    /// `reference`.
    async fn batch_check(
        &self,
        reference: &str,
        haves: &[HaveObject],
    ) -> TransportResult<Vec<BatchCheckAction>>;

    /// Uploads one large object's raw content.
    async fn put_object(
        &self,
        reference: &str,
        id: &ObjectId,
        content: ByteStream,
        size: u64,
    ) -> TransportResult<()>;

    /// Sends the framed metadata body and the ref update command; returns
    /// the remote's report.
    async fn push(
        &self,
        metadata: Vec<PackedObject>,
        command: PushCommand,
    ) -> TransportResult<ReceiveReport>;
}
