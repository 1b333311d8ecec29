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

//! Textual revision resolution.
//!
//! Accepted forms: `HEAD`, ref names (with the usual `refs/heads/`,
//! `refs/tags/`, `refs/remotes/` fallbacks), 6-64 hex digit ids resolved by
//! prefix search, `<rev>^`/`<rev>~N` ancestry suffixes (first-parent only),
//! `<ref>@{N}` reflog lookups, `a..b` and `a...b` ranges, and `rev:path`
//! tree-entry addressing.

use thiserror::Error;

use crate::hash::HexPrefix;
use crate::hash::ObjectId;
use crate::hash::PrefixResolution;
use crate::hash::HASH_HEX_LEN;
use crate::odb::EntryRecord;
use crate::odb::ObjectDb;
use crate::odb::OdbError;
use crate::op_context::OpContext;
use crate::refs::HEAD_NAME;
use crate::refs::RefDb;
use crate::refs::RefError;

/// Minimum hex digits for a short id.
pub const MIN_SHORT_ID_LEN: usize = 6;

#[derive(Debug, Error)]
pub enum RevisionError {
    #[error("Unknown revision {0:?}")]
    Unknown(String),
    #[error("Short id {0:?} matches more than one object")]
    Ambiguous(String),
    #[error("Malformed revision {0:?}")]
    Invalid(String),
    #[error("Path {path:?} not found in revision {rev}")]
    PathNotFound { rev: ObjectId, path: String },
    #[error("No reflog entry {index} for {name}")]
    NoReflogEntry { name: String, index: usize },
    #[error(transparent)]
    Odb(#[from] OdbError),
    #[error(transparent)]
    Ref(#[from] RefError),
}

pub type RevisionResult<T> = Result<T, RevisionError>;

/// A resolved revision expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revision {
    /// A single commit (or tag, peeled on demand).
    Single(ObjectId),
    /// `a..b`: reachable from `b` but not from `a`.
    Range { from: ObjectId, to: ObjectId },
    /// `a...b`: reachable from exactly one of the two.
    SymmetricDifference { a: ObjectId, b: ObjectId },
    /// `rev:path`: the tree entry at `path` in `rev`'s tree.
    Path { rev: ObjectId, entry: EntryRecord },
}

pub struct RevisionParser<'a> {
    pub odb: &'a ObjectDb,
    pub refdb: &'a RefDb,
}

impl RevisionParser<'_> {
    /// Resolves a full revision expression.
    pub fn resolve(&self, ctx: &OpContext, input: &str) -> RevisionResult<Revision> {
        if input.is_empty() {
            return Err(RevisionError::Invalid(input.to_owned()));
        }
        if let Some((a, b)) = input.split_once("...") {
            return Ok(Revision::SymmetricDifference {
                a: self.resolve_commit(ctx, a)?,
                b: self.resolve_commit(ctx, b)?,
            });
        }
        if let Some((a, b)) = input.split_once("..") {
            return Ok(Revision::Range {
                from: self.resolve_commit(ctx, a)?,
                to: self.resolve_commit(ctx, b)?,
            });
        }
        // `rev:path`. Ref names cannot contain ':'.
        if let Some((rev, path)) = input.split_once(':') {
            let rev = self.resolve_commit(ctx, rev)?;
            let entry = self.resolve_tree_path(ctx, rev, path)?;
            return Ok(Revision::Path { rev, entry });
        }
        Ok(Revision::Single(self.resolve_single(ctx, input)?))
    }

    /// Resolves to a commit id, peeling annotated tags.
    pub fn resolve_commit(&self, ctx: &OpContext, input: &str) -> RevisionResult<ObjectId> {
        let id = self.resolve_single(ctx, input)?;
        self.peel_to_commit(id)
    }

    fn peel_to_commit(&self, mut id: ObjectId) -> RevisionResult<ObjectId> {
        // Tag chains are short; the bound guards against cycles in
        // corrupt data.
        for _ in 0..10 {
            match self.odb.get_bytes(&id) {
                Ok((crate::object::ObjectKind::Tag, body)) => {
                    let crate::object::Object::Tag(tag) =
                        crate::object::decode_body(crate::object::ObjectKind::Tag, &body)
                            .map_err(OdbError::from)?
                    else {
                        unreachable!()
                    };
                    id = tag.object;
                }
                _ => return Ok(id),
            }
        }
        Ok(id)
    }

    fn resolve_single(&self, ctx: &OpContext, input: &str) -> RevisionResult<ObjectId> {
        // Strip ancestry suffixes from the right: `^`, `~N`, `@{N}`.
        let mut rest = input;
        let mut ops: Vec<usize> = Vec::new(); // parent-generation steps, applied in order
        loop {
            if let Some(head) = rest.strip_suffix('^') {
                ops.push(1);
                rest = head;
            } else if let Some((head, digits)) = split_tilde(rest) {
                ops.push(digits);
                rest = head;
            } else {
                break;
            }
        }
        ops.reverse();

        let base = self.resolve_base(ctx, rest)?;
        let mut id = base;
        for generations in ops {
            id = self.nth_first_parent(id, generations)?;
        }
        Ok(id)
    }

    fn nth_first_parent(&self, mut id: ObjectId, generations: usize) -> RevisionResult<ObjectId> {
        id = self.peel_to_commit(id)?;
        for _ in 0..generations {
            let commit = self.odb.commit(&id)?;
            id = *commit
                .parents
                .first()
                .ok_or_else(|| RevisionError::Unknown(format!("{id}^")))?;
        }
        Ok(id)
    }

    fn resolve_base(&self, _ctx: &OpContext, input: &str) -> RevisionResult<ObjectId> {
        // `<ref>@{N}` reflog addressing.
        if let Some((name, index)) = split_reflog_at(input) {
            let name = if name.is_empty() { HEAD_NAME } else { name };
            return self.resolve_reflog(name, index);
        }

        // References take priority over hex-looking branch names.
        if let Some(id) = self.try_ref(input)? {
            return Ok(id);
        }

        if is_hex(input) {
            if input.len() == HASH_HEX_LEN {
                let id = ObjectId::try_from_hex(input)
                    .ok_or_else(|| RevisionError::Invalid(input.to_owned()))?;
                return Ok(id);
            }
            if input.len() >= MIN_SHORT_ID_LEN {
                let prefix = HexPrefix::try_from_hex(input)
                    .ok_or_else(|| RevisionError::Invalid(input.to_owned()))?;
                return match self.odb.resolve_prefix(&prefix) {
                    PrefixResolution::SingleMatch(id) => Ok(id),
                    PrefixResolution::AmbiguousMatch => {
                        Err(RevisionError::Ambiguous(input.to_owned()))
                    }
                    PrefixResolution::NoMatch => Err(RevisionError::Unknown(input.to_owned())),
                };
            }
        }
        Err(RevisionError::Unknown(input.to_owned()))
    }

    fn try_ref(&self, name: &str) -> RevisionResult<Option<ObjectId>> {
        let candidates = [
            name.to_owned(),
            format!("refs/{name}"),
            format!("refs/heads/{name}"),
            format!("refs/tags/{name}"),
            format!("refs/remotes/{name}"),
        ];
        for candidate in candidates {
            match self.refdb.resolve(&candidate) {
                Ok(reference) => return Ok(reference.hash_target()),
                Err(RefError::NotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }

    fn resolve_reflog(&self, name: &str, index: usize) -> RevisionResult<ObjectId> {
        // Resolve the symbolic name to the branch whose log we read.
        let log_name = match self.refdb.reference(name) {
            Ok(crate::refs::Reference::Symbolic { target, .. }) => target,
            Ok(crate::refs::Reference::Hash { name, .. }) => name,
            Err(RefError::NotFound(_)) => {
                // Try the branch shorthand.
                format!("refs/heads/{name}")
            }
            Err(err) => return Err(err.into()),
        };
        if index == 0 {
            return self
                .refdb
                .resolve(&log_name)?
                .hash_target()
                .ok_or_else(|| RevisionError::Unknown(log_name));
        }
        let log = self.refdb.read_log(&log_name)?;
        if index > log.entries.len() {
            return Err(RevisionError::NoReflogEntry {
                name: log_name,
                index,
            });
        }
        Ok(log.entries[log.entries.len() - index].old)
    }

    /// Finds the tree entry at `path` inside `rev`'s root tree.
    pub fn resolve_tree_path(
        &self,
        _ctx: &OpContext,
        rev: ObjectId,
        path: &str,
    ) -> RevisionResult<EntryRecord> {
        let not_found = || RevisionError::PathNotFound {
            rev,
            path: path.to_owned(),
        };
        let commit_id = self.peel_to_commit(rev)?;
        let commit = self.odb.commit(&commit_id)?;
        let mut tree = self.odb.tree(&commit.tree)?;
        let mut components = path.split('/').peekable();
        while let Some(component) = components.next() {
            let entry = tree.entry(component).ok_or_else(not_found)?;
            if components.peek().is_none() {
                return Ok(EntryRecord {
                    path: path.to_owned(),
                    mode: entry.mode,
                    hash: entry.hash,
                    size: entry.size,
                });
            }
            if !entry.mode.is_dir() {
                return Err(not_found());
            }
            tree = self.odb.tree(&entry.hash)?;
        }
        Err(not_found())
    }
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Splits a trailing `~N` (default N=1) off `input`.
fn split_tilde(input: &str) -> Option<(&str, usize)> {
    let tilde = input.rfind('~')?;
    let digits = &input[tilde + 1..];
    if digits.is_empty() {
        return Some((&input[..tilde], 1));
    }
    let n: usize = digits.parse().ok()?;
    Some((&input[..tilde], n))
}

/// Splits a trailing `@{N}` off `input`.
fn split_reflog_at(input: &str) -> Option<(&str, usize)> {
    let rest = input.strip_suffix('}')?;
    let at = rest.rfind("@{")?;
    let index: usize = rest[at + 2..].parse().ok()?;
    Some((&input[..at], index))
}
