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

//! Splitting large files into fragment chunks.
//!
//! A fragmented file is stored as N chunk blobs plus a [`Fragments`]
//! manifest. The manifest's `origin` is the blob hash of the unsplit
//! content, computed by a tee hasher while the chunks are written, so the
//! logical identity of the file never depends on the chunk layout.

use std::io;
use std::io::Read;

use digest::Digest as _;

use crate::hash::ObjectHasher;
use crate::hash::ObjectId;
use crate::object::FragmentEntry;
use crate::object::Fragments;
use crate::object::ObjectKind;
use crate::object::object_header;

/// One chunk of the split layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub offset: u64,
    pub len: u64,
}

/// Computes the chunk layout for a file of `size` bytes: full chunks of
/// `chunk_size`, then the remainder as the final chunk.
pub fn calculate_chunks(size: u64, chunk_size: u64) -> Vec<ChunkSpan> {
    assert!(chunk_size > 0, "chunk size must be positive");
    let mut spans = Vec::with_capacity(size.div_ceil(chunk_size) as usize);
    let mut offset = 0;
    let mut remaining = size;
    while remaining > chunk_size {
        spans.push(ChunkSpan {
            offset,
            len: chunk_size,
        });
        offset += chunk_size;
        remaining -= chunk_size;
    }
    if remaining > 0 {
        spans.push(ChunkSpan {
            offset,
            len: remaining,
        });
    }
    spans
}

/// Streams `input` of known `size`, writing each chunk through `put_chunk`
/// and returning the manifest. The origin hash is computed over the full
/// content as a blob while chunks are cut, so the input is read only once.
pub fn write_fragments<E, F>(
    input: &mut dyn Read,
    size: u64,
    chunk_size: u64,
    mut put_chunk: F,
) -> Result<Fragments, E>
where
    F: FnMut(&[u8]) -> Result<ObjectId, E>,
    E: From<io::Error>,
{
    let mut origin_hasher = ObjectHasher::new();
    origin_hasher.update(object_header(ObjectKind::Blob, size as usize));

    let spans = calculate_chunks(size, chunk_size);
    let mut entries = Vec::with_capacity(spans.len());
    let mut buf = Vec::new();
    for (index, span) in spans.iter().enumerate() {
        buf.resize(span.len as usize, 0);
        input.read_exact(&mut buf).map_err(E::from)?;
        origin_hasher.update(&buf);
        let hash = put_chunk(&buf)?;
        entries.push(FragmentEntry {
            index: index as u32,
            hash,
            size: span.len,
        });
    }
    // A longer-than-declared input would silently change the origin hash;
    // reject it.
    let mut probe = [0u8; 1];
    if input.read(&mut probe).map_err(E::from)? != 0 {
        return Err(E::from(io::Error::new(
            io::ErrorKind::InvalidData,
            "input longer than declared size",
        )));
    }

    Ok(Fragments {
        size,
        origin: ObjectId::from_digest(origin_hasher),
        entries,
    })
}

/// Verifies that `chunks`, concatenated in index order, hash to the
/// manifest's origin. Returns the assembled bytes.
///
/// This is the in-memory counterpart of the streaming assembly performed by
/// the object store when a fragmented file is checked out.
pub fn assemble_verified(
    fragments: &Fragments,
    chunks: &[Vec<u8>],
) -> Result<Vec<u8>, io::Error> {
    let mut content = Vec::with_capacity(fragments.size as usize);
    for chunk in chunks {
        content.extend_from_slice(chunk);
    }
    let mut hasher = ObjectHasher::new();
    hasher.update(object_header(ObjectKind::Blob, content.len()));
    hasher.update(&content);
    let origin = ObjectId::from_digest(hasher);
    if origin != fragments.origin {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "assembled content hashes to {origin}, manifest origin is {}",
                fragments.origin
            ),
        ));
    }
    Ok(content)
}
