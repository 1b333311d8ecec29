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

//! The staging area.
//!
//! Entries are keyed by `(path, stage)` and kept path-sorted. Stage 0 holds
//! regular staged state; stages 1..3 hold the ancestor/ours/theirs slots of
//! an unresolved merge conflict. The file is replaced atomically on every
//! update and carries a content checksum, so a torn write is detected on
//! load rather than silently read.

use std::fs;
use std::io;
use std::path::Path;

use digest::Digest as _;
use globset::Glob;
use thiserror::Error;

use crate::file_util::PathError;
use crate::file_util::write_atomically;
use crate::hash::HASH_LEN;
use crate::hash::ObjectHasher;
use crate::hash::ObjectId;
use crate::object::FileMode;
use crate::object::ObjectCodecError;

const INDEX_MAGIC: &[u8; 4] = b"ZIDX";
const INDEX_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("No index entry for {0}")]
    NotFound(String),
    #[error("Malformed index file: {0}")]
    Corrupt(String),
    #[error("Bad glob pattern {pattern:?}")]
    BadPattern {
        pattern: String,
        source: globset::Error,
    },
    #[error(transparent)]
    Mode(#[from] ObjectCodecError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("Index I/O error")]
    Io(#[from] io::Error),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Merge conflict slot of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Merged = 0,
    Ancestor = 1,
    Ours = 2,
    Theirs = 3,
}

impl Stage {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Merged),
            1 => Some(Self::Ancestor),
            2 => Some(Self::Ours),
            3 => Some(Self::Theirs),
            _ => None,
        }
    }
}

/// One staging-area entry.
///
/// For fragmented files `hash` points at the manifest and `size` is the
/// origin (logical) size, mirroring the owning tree entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub path: String,
    pub hash: ObjectId,
    pub mode: FileMode,
    pub size: u64,
    pub created_at: i64,
    pub modified_at: i64,
    pub dev: u32,
    pub inode: u32,
    pub uid: u32,
    pub gid: u32,
    pub stage: Stage,
    pub skip_worktree: bool,
    pub intent_to_add: bool,
}

/// Modification time of `metadata` in milliseconds since the epoch.
pub fn metadata_mtime_millis(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis() as i64)
}

impl IndexEntry {
    /// A minimal entry carrying only tree-derived state.
    pub fn from_tree(path: impl Into<String>, mode: FileMode, hash: ObjectId, size: u64) -> Self {
        Self {
            path: path.into(),
            hash,
            mode,
            size,
            created_at: 0,
            modified_at: 0,
            dev: 0,
            inode: 0,
            uid: 0,
            gid: 0,
            stage: Stage::Merged,
            skip_worktree: false,
            intent_to_add: false,
        }
    }

    /// Fills the stat cache fields from filesystem metadata.
    pub fn with_file_metadata(mut self, metadata: &fs::Metadata) -> Self {
        self.modified_at = metadata_mtime_millis(metadata);
        self.created_at = metadata
            .created()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(self.modified_at, |d| d.as_millis() as i64);
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt as _;
            self.dev = metadata.dev() as u32;
            self.inode = metadata.ino() as u32;
            self.uid = metadata.uid();
            self.gid = metadata.gid();
        }
        self
    }

    /// Whether cheap stat data says the file is unchanged since this entry
    /// was written. A mismatch only means the content must be re-hashed.
    pub fn stat_matches(&self, metadata: &fs::Metadata) -> bool {
        if self.intent_to_add {
            return false;
        }
        self.modified_at == metadata_mtime_millis(metadata) && self.size == metadata.len()
    }
}

/// The staging area: an ordered set of entries keyed by `(path, stage)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    entries: Vec<IndexEntry>,
}

impl Index {
    pub fn entries(&self) -> impl ExactSizeIterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn position(&self, path: &str, stage: Stage) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|entry| (entry.path.as_str(), entry.stage).cmp(&(path, stage)))
    }

    /// The stage-0 entry at `path`.
    pub fn get(&self, path: &str) -> IndexResult<&IndexEntry> {
        self.position(path, Stage::Merged)
            .map(|i| &self.entries[i])
            .map_err(|_| IndexError::NotFound(path.to_owned()))
    }

    /// All entries at `path`, including conflict stages.
    pub fn stages(&self, path: &str) -> impl Iterator<Item = &IndexEntry> {
        let start = self.position(path, Stage::Merged).unwrap_or_else(|i| i);
        self.entries[start..]
            .iter()
            .take_while(move |entry| entry.path == path)
    }

    /// Paths that carry at least one non-zero stage entry.
    pub fn conflicted_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.stage != Stage::Merged)
            .map(|entry| entry.path.clone())
            .collect();
        paths.dedup();
        paths
    }

    pub fn has_conflicts(&self) -> bool {
        self.entries.iter().any(|entry| entry.stage != Stage::Merged)
    }

    /// Entries whose path matches the glob `pattern`.
    pub fn glob(&self, pattern: &str) -> IndexResult<Vec<&IndexEntry>> {
        let matcher = Glob::new(pattern)
            .map_err(|source| IndexError::BadPattern {
                pattern: pattern.to_owned(),
                source,
            })?
            .compile_matcher();
        Ok(self
            .entries
            .iter()
            .filter(|entry| matcher.is_match(&entry.path))
            .collect())
    }

    /// Loads the index file; a missing file is the empty index.
    pub fn load(path: &Path) -> IndexResult<Self> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err.into()),
        };
        Self::decode(&data)
    }

    /// Atomically replaces the index file.
    pub fn store(&self, path: &Path) -> IndexResult<()> {
        write_atomically(path, &self.encode())?;
        Ok(())
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(INDEX_MAGIC);
        out.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            let path = entry.path.as_bytes();
            out.extend_from_slice(&(path.len() as u16).to_le_bytes());
            out.extend_from_slice(path);
            out.extend_from_slice(entry.hash.as_bytes());
            out.extend_from_slice(&entry.mode.raw().to_le_bytes());
            out.extend_from_slice(&entry.size.to_le_bytes());
            out.extend_from_slice(&entry.created_at.to_le_bytes());
            out.extend_from_slice(&entry.modified_at.to_le_bytes());
            out.extend_from_slice(&entry.dev.to_le_bytes());
            out.extend_from_slice(&entry.inode.to_le_bytes());
            out.extend_from_slice(&entry.uid.to_le_bytes());
            out.extend_from_slice(&entry.gid.to_le_bytes());
            let flags = entry.stage as u16
                | u16::from(entry.skip_worktree) << 2
                | u16::from(entry.intent_to_add) << 3;
            out.extend_from_slice(&flags.to_le_bytes());
        }
        let mut hasher = ObjectHasher::new();
        hasher.update(&out);
        out.extend_from_slice(&hasher.finalize());
        out
    }

    fn decode(data: &[u8]) -> IndexResult<Self> {
        let corrupt = |reason: &str| IndexError::Corrupt(reason.to_owned());
        if data.len() < 12 + HASH_LEN {
            return Err(corrupt("truncated index"));
        }
        let (content, checksum) = data.split_at(data.len() - HASH_LEN);
        let mut hasher = ObjectHasher::new();
        hasher.update(content);
        if checksum != hasher.finalize().as_slice() {
            return Err(corrupt("index checksum mismatch"));
        }
        if &content[..4] != INDEX_MAGIC {
            return Err(corrupt("bad index magic"));
        }
        let version = u32::from_le_bytes(content[4..8].try_into().unwrap());
        if version != INDEX_VERSION {
            return Err(IndexError::Corrupt(format!("unsupported index version {version}")));
        }
        let count = u32::from_le_bytes(content[8..12].try_into().unwrap());
        let mut cursor = &content[12..];
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let path_len = u16::from_le_bytes(take(&mut cursor, 2)?.try_into().unwrap()) as usize;
            let path = std::str::from_utf8(take(&mut cursor, path_len)?)
                .map_err(|_| corrupt("entry path not valid UTF-8"))?
                .to_owned();
            let hash = ObjectId::try_from_bytes(take(&mut cursor, HASH_LEN)?).unwrap();
            let mode =
                FileMode::from_raw(u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap()))?;
            let size = u64::from_le_bytes(take(&mut cursor, 8)?.try_into().unwrap());
            let created_at = i64::from_le_bytes(take(&mut cursor, 8)?.try_into().unwrap());
            let modified_at = i64::from_le_bytes(take(&mut cursor, 8)?.try_into().unwrap());
            let dev = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap());
            let inode = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap());
            let uid = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap());
            let gid = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap());
            let flags = u16::from_le_bytes(take(&mut cursor, 2)?.try_into().unwrap());
            let stage = Stage::from_raw((flags & 0x3) as u8).unwrap();
            entries.push(IndexEntry {
                path,
                hash,
                mode,
                size,
                created_at,
                modified_at,
                dev,
                inode,
                uid,
                gid,
                stage,
                skip_worktree: flags & (1 << 2) != 0,
                intent_to_add: flags & (1 << 3) != 0,
            });
        }
        if !cursor.is_empty() {
            return Err(corrupt("trailing data after entries"));
        }
        if !entries.is_sorted_by(|a, b| (a.path.as_str(), a.stage) <= (b.path.as_str(), b.stage)) {
            return Err(corrupt("entries out of order"));
        }
        Ok(Self { entries })
    }
}

fn take<'a>(cursor: &mut &'a [u8], n: usize) -> IndexResult<&'a [u8]> {
    if cursor.len() < n {
        return Err(IndexError::Corrupt("truncated index entry".to_owned()));
    }
    let (head, tail) = cursor.split_at(n);
    *cursor = tail;
    Ok(head)
}

/// Collects changes to apply on top of a base index.
#[derive(Debug, Default)]
pub struct IndexBuilder {
    sets: Vec<IndexEntry>,
    removes: Vec<String>,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the entry at `(entry.path, entry.stage)`.
    pub fn set(&mut self, entry: IndexEntry) {
        self.sets
            .retain(|set| set.path != entry.path || set.stage != entry.stage);
        self.sets.push(entry);
    }

    /// Records an intent-to-add placeholder for `path`.
    pub fn add_empty(&mut self, path: impl Into<String>) {
        let mut entry = IndexEntry::from_tree(path, FileMode::REGULAR, ObjectId::ZERO, 0);
        entry.intent_to_add = true;
        self.sets.push(entry);
    }

    /// Removes every stage of `path`.
    pub fn remove(&mut self, path: impl Into<String>) {
        self.removes.push(path.into());
    }

    /// Produces a new index: builder entries replace or extend `base`, and
    /// removed paths are dropped. Ordering is re-established here.
    pub fn write(self, base: &Index) -> Index {
        let mut entries: Vec<IndexEntry> = base
            .entries()
            .filter(|entry| {
                !self.removes.iter().any(|path| *path == entry.path)
                    && !self
                        .sets
                        .iter()
                        .any(|set| set.path == entry.path && set.stage == entry.stage)
            })
            .cloned()
            .collect();
        // A stage-0 write resolves any previous conflict slots for the path,
        // and conflict-slot writes supersede the stage-0 entry.
        for set in &self.sets {
            match set.stage {
                Stage::Merged => {
                    entries.retain(|entry| entry.path != set.path || entry.stage == Stage::Merged);
                }
                _ => entries
                    .retain(|entry| entry.path != set.path || entry.stage != Stage::Merged),
            }
        }
        entries.extend(self.sets);
        entries.sort_by(|a, b| (a.path.as_str(), a.stage).cmp(&(b.path.as_str(), b.stage)));
        entries.dedup_by(|a, b| a.path == b.path && a.stage == b.stage);
        Index { entries }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn entry(path: &str, stage: Stage) -> IndexEntry {
        let mut entry = IndexEntry::from_tree(
            path,
            FileMode::REGULAR,
            ObjectId::hash_of(path.as_bytes()),
            7,
        );
        entry.stage = stage;
        entry
    }

    fn build(entries: Vec<IndexEntry>) -> Index {
        let mut builder = IndexBuilder::new();
        for e in entries {
            builder.set(e);
        }
        builder.write(&Index::default())
    }

    #[test]
    fn test_get_and_stages() {
        let index = build(vec![
            entry("a.txt", Stage::Merged),
            entry("conflict.txt", Stage::Ancestor),
            entry("conflict.txt", Stage::Ours),
            entry("conflict.txt", Stage::Theirs),
        ]);
        assert_eq!(index.get("a.txt").unwrap().path, "a.txt");
        assert_matches!(index.get("missing"), Err(IndexError::NotFound(_)));
        assert_matches!(index.get("conflict.txt"), Err(IndexError::NotFound(_)));
        assert_eq!(index.stages("conflict.txt").count(), 3);
        assert!(index.has_conflicts());
        assert_eq!(index.conflicted_paths(), vec!["conflict.txt"]);
    }

    #[test]
    fn test_builder_replaces_and_removes() {
        let base = build(vec![entry("a.txt", Stage::Merged), entry("b.txt", Stage::Merged)]);

        let mut builder = IndexBuilder::new();
        let mut replacement = entry("a.txt", Stage::Merged);
        replacement.size = 99;
        builder.set(replacement);
        builder.remove("b.txt");
        builder.add_empty("new.txt");
        let index = builder.write(&base);

        assert_eq!(index.get("a.txt").unwrap().size, 99);
        assert_matches!(index.get("b.txt"), Err(IndexError::NotFound(_)));
        assert!(index.get("new.txt").unwrap().intent_to_add);
    }

    #[test]
    fn test_stage0_write_resolves_conflict() {
        let base = build(vec![
            entry("c.txt", Stage::Ancestor),
            entry("c.txt", Stage::Ours),
            entry("c.txt", Stage::Theirs),
        ]);
        let mut builder = IndexBuilder::new();
        builder.set(entry("c.txt", Stage::Merged));
        let index = builder.write(&base);
        assert!(!index.has_conflicts());
        assert!(index.get("c.txt").is_ok());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        let index = build(vec![
            entry("a.txt", Stage::Merged),
            entry("dir/b.txt", Stage::Merged),
            entry("dir/c.txt", Stage::Ours),
        ]);
        index.store(&path).unwrap();
        assert_eq!(Index::load(&path).unwrap(), index);
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Index::load(&dir.path().join("index")).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        let index = build(vec![entry("a.txt", Stage::Merged)]);
        index.store(&path).unwrap();
        let mut data = fs::read(&path).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0xff;
        fs::write(&path, data).unwrap();
        assert_matches!(Index::load(&path), Err(IndexError::Corrupt(_)));
    }

    #[test]
    fn test_glob() {
        let index = build(vec![
            entry("src/main.rs", Stage::Merged),
            entry("src/lib.rs", Stage::Merged),
            entry("docs/readme.md", Stage::Merged),
        ]);
        let matched = index.glob("src/*.rs").unwrap();
        assert_eq!(matched.len(), 2);
        assert!(index.glob("[bad").is_err());
    }
}
