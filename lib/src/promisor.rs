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

//! The promisor: lazy fetching of objects the remote has promised.
//!
//! Objects split into two classes by size. Small objects are requested in
//! bounded batches and unpacked from the packed response; large objects are
//! streamed individually with bounded concurrency, resuming from the byte
//! offset already on disk. A fatal error on one stream cancels the
//! siblings through the shared transfer context.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt as _;
use futures::TryStreamExt as _;
use futures::stream;
use pollster::FutureExt as _;
use thiserror::Error;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::config::TransferConfig;
use crate::hash::ObjectId;
use crate::odb::EntryRecord;
use crate::odb::MissingObjectFetcher;
use crate::odb::ObjectDb;
use crate::odb::OdbError;
use crate::odb::TransferMode;
use crate::op_context::CancelledError;
use crate::op_context::OpContext;
use crate::transport::SharedRepresentation;
use crate::transport::Transport;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Odb(#[from] OdbError),
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
}

pub type TransferResult<T> = Result<T, TransferError>;

/// An external download accelerator. The core hands it a signed
/// representation and a destination path; everything else is the
/// accelerator's business.
pub trait Accelerator: Send + Sync {
    fn download(
        &self,
        representation: &SharedRepresentation,
        destination: &Path,
    ) -> Result<(), TransportError>;
}

pub struct Promisor {
    transport: Arc<dyn Transport>,
    odb: Arc<ObjectDb>,
    config: TransferConfig,
    accelerator: Option<Arc<dyn Accelerator>>,
}

impl Promisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        odb: Arc<ObjectDb>,
        config: TransferConfig,
        accelerator: Option<Arc<dyn Accelerator>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            odb,
            config,
            accelerator,
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Fetches the given entries (and, for fragmented entries, their chunk
    /// blobs) into the object store.
    #[instrument(skip_all, fields(count = records.len()))]
    pub async fn fetch_entries(
        &self,
        ctx: &OpContext,
        records: &[EntryRecord],
    ) -> TransferResult<()> {
        // Missing fragment manifests must arrive before their chunk lists
        // can be expanded.
        let manifest_ids: Vec<ObjectId> = records
            .iter()
            .filter(|record| record.mode.is_fragments())
            .map(|record| record.hash)
            .filter(|id| !self.odb.exists(id, true))
            .collect();
        if !manifest_ids.is_empty() {
            self.fetch_small_batched(ctx, &manifest_ids).await?;
        }

        let mut small: Vec<ObjectId> = Vec::new();
        let mut large: Vec<(ObjectId, u64)> = Vec::new();
        let mut seen: HashSet<ObjectId> = HashSet::new();
        for record in records {
            ctx.check()?;
            if record.mode.is_fragments() {
                let manifest = self.odb.fragments(&record.hash)?;
                for entry in &manifest.entries {
                    if seen.insert(entry.hash) && !self.odb.exists(&entry.hash, true) {
                        if entry.size >= self.config.large_threshold {
                            large.push((entry.hash, entry.size));
                        } else {
                            small.push(entry.hash);
                        }
                    }
                }
            } else if seen.insert(record.hash) && !self.odb.exists(&record.hash, true) {
                if record.size >= self.config.large_threshold {
                    large.push((record.hash, record.size));
                } else {
                    small.push(record.hash);
                }
            }
        }

        if !small.is_empty() {
            self.fetch_small_batched(ctx, &small).await?;
        }
        if !large.is_empty() {
            self.fetch_large(ctx, &large).await?;
        }
        Ok(())
    }

    /// Synchronous entry point for callers outside the async transfer
    /// machinery.
    pub fn fetch_entries_blocking(
        &self,
        ctx: &OpContext,
        records: &[EntryRecord],
    ) -> TransferResult<()> {
        self.fetch_entries(ctx, records).block_on()
    }

    /// Requests small objects in batches of at most `batch_limit` and
    /// unpacks the streamed response.
    async fn fetch_small_batched(&self, ctx: &OpContext, ids: &[ObjectId]) -> TransferResult<()> {
        for batch in ids.chunks(self.config.batch_limit.max(1)) {
            ctx.check()?;
            debug!(count = batch.len(), "requesting small-object batch");
            let mut stream = self.transport.batch_objects(batch).await?;
            while let Some(packed) = stream.try_next().await? {
                ctx.check()?;
                self.odb.unpack(packed.kind, &packed.body)?;
            }
        }
        Ok(())
    }

    /// Streams large objects concurrently, bounded by the configured
    /// parallelism. The first fatal error cancels the remaining streams.
    async fn fetch_large(&self, ctx: &OpContext, wants: &[(ObjectId, u64)]) -> TransferResult<()> {
        let transfer_ctx = ctx.child();
        let representations = self.shared_representations(wants).await;

        let results: Vec<TransferResult<()>> = stream::iter(wants.iter().copied())
            .map(|(id, size)| {
                let representation = representations.get(&id).cloned();
                let ctx = transfer_ctx.clone();
                async move {
                    let result = self.fetch_one_large(&ctx, id, size, representation).await;
                    if result.is_err() {
                        // Abort the in-flight siblings.
                        ctx.cancel();
                    }
                    result
                }
            })
            .buffer_unordered(self.config.concurrency())
            .collect()
            .await;
        results.into_iter().collect()
    }

    async fn shared_representations(
        &self,
        wants: &[(ObjectId, u64)],
    ) -> std::collections::HashMap<ObjectId, SharedRepresentation> {
        if self.accelerator.is_none() {
            return Default::default();
        }
        let ids: Vec<ObjectId> = wants.iter().map(|(id, _)| *id).collect();
        match self.transport.shared(&ids).await {
            Ok(representations) => representations
                .into_iter()
                .map(|representation| (representation.id, representation))
                .collect(),
            Err(err) => {
                warn!(error = %err, "shared representations unavailable, streaming directly");
                Default::default()
            }
        }
    }

    async fn fetch_one_large(
        &self,
        ctx: &OpContext,
        id: ObjectId,
        size: u64,
        representation: Option<SharedRepresentation>,
    ) -> TransferResult<()> {
        if let (Some(accelerator), Some(representation)) =
            (self.accelerator.as_ref(), representation)
        {
            match self.accelerate(ctx, accelerator, &id, &representation) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(%id, error = %err, "accelerator failed, falling back to direct stream");
                }
            }
        }

        let transport = &self.transport;
        let mut progress = |transferred| {
            tracing::trace!(%id, transferred, size, "transfer progress");
        };
        self.odb
            .do_transfer(
                ctx,
                &id,
                |offset| async move { transport.get_object(&id, offset).await },
                &mut progress,
                TransferMode::Resume,
            )
            .await?;
        Ok(())
    }

    /// Hands one signed representation to the external accelerator and
    /// ingests the file it produced.
    fn accelerate(
        &self,
        ctx: &OpContext,
        accelerator: &Arc<dyn Accelerator>,
        id: &ObjectId,
        representation: &SharedRepresentation,
    ) -> TransferResult<()> {
        ctx.check()?;
        let destination = accelerator_destination(&self.odb, id);
        let result = accelerator.download(representation, &destination);
        match result {
            Ok(()) => {
                let size = fs::metadata(&destination).map_err(OdbError::from)?.len();
                let mut file = fs::File::open(&destination).map_err(OdbError::from)?;
                let stored = self.odb.put_blob_stream(&mut file, size)?;
                let _ = fs::remove_file(&destination);
                if stored != *id {
                    return Err(TransferError::Odb(OdbError::Corrupt {
                        id: *id,
                        reason: format!("accelerated download hashes to {stored}"),
                    }));
                }
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&destination);
                Err(err.into())
            }
        }
    }
}

fn accelerator_destination(odb: &ObjectDb, id: &ObjectId) -> PathBuf {
    odb.tmp_dir().join(format!("{}.accel", id.hex()))
}

impl MissingObjectFetcher for Promisor {
    fn fetch(&self, ctx: &OpContext, wants: &[EntryRecord]) -> Result<(), TransportError> {
        self.fetch_entries_blocking(ctx, wants).map_err(|err| match err {
            TransferError::Transport(err) => err,
            TransferError::Odb(err) => TransportError::Other(Box::new(err)),
            TransferError::Cancelled(err) => TransportError::Other(Box::new(err)),
        })
    }
}
