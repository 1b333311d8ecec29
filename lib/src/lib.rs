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

//! Repository core for zeta, a version control system built for
//! repositories with very large binary assets.
//!
//! The crate covers the content-addressed object model, large-file
//! fragmentation, references with reflog, the worktree engine, three-way
//! merge and replay machinery, the promisor (lazy fetch) layer and the
//! push/fetch protocol. Wire transports, the CLI, signing and rendering
//! live outside and talk to this crate through the seams in [`transport`]
//! and [`filemerge`].

#![deny(unsafe_code)]

pub mod config;
pub mod diff;
pub mod file_util;
pub mod filemerge;
pub mod fragments;
pub mod hash;
pub mod hex_util;
pub mod history;
pub mod index;
pub mod merge;
pub mod object;
pub mod odb;
pub mod op_context;
pub mod promisor;
pub mod protocol;
pub mod refs;
pub mod repo;
pub mod revision;
pub mod revwalk;
pub mod sparse;
pub mod transport;
pub mod worktree;

use thiserror::Error;

/// The coarse classification every error in this crate maps onto. The CLI
/// collaborator renders these; the core only produces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Invalid,
    Ambiguous,
    Precondition,
    Conflict,
    Aborted,
    Transport,
    Integrity,
    Cancelled,
    Io,
}

impl ErrorKind {
    /// Exit code convention for a CLI front-end: conflicts and misses are
    /// 1, everything else fatal is 128.
    pub fn suggested_exit_code(self) -> i32 {
        match self {
            Self::Conflict | Self::NotFound => 1,
            _ => 128,
        }
    }
}

/// Top-level error aggregating every subsystem's error type.
#[derive(Debug, Error)]
pub enum ZetaError {
    #[error(transparent)]
    Odb(#[from] odb::OdbError),
    #[error(transparent)]
    Index(#[from] index::IndexError),
    #[error(transparent)]
    Ref(#[from] refs::RefError),
    #[error(transparent)]
    Revision(#[from] revision::RevisionError),
    #[error(transparent)]
    Worktree(#[from] worktree::WorktreeError),
    #[error(transparent)]
    Merge(#[from] merge::MergeError),
    #[error(transparent)]
    History(#[from] history::HistoryError),
    #[error(transparent)]
    Transfer(#[from] promisor::TransferError),
    #[error(transparent)]
    Transport(#[from] transport::TransportError),
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),
    #[error(transparent)]
    Repo(#[from] repo::RepoError),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Cancelled(#[from] op_context::CancelledError),
    #[error(transparent)]
    Path(#[from] file_util::PathError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ZetaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Odb(err) => odb_kind(err),
            Self::Index(err) => index_kind(err),
            Self::Ref(err) => ref_kind(err),
            Self::Revision(err) => revision_kind(err),
            Self::Worktree(err) => worktree_kind(err),
            Self::Merge(err) => merge_kind(err),
            Self::History(err) => history_kind(err),
            Self::Transfer(err) => transfer_kind(err),
            Self::Transport(_) => ErrorKind::Transport,
            Self::Protocol(err) => protocol_kind(err),
            Self::Repo(err) => repo_kind(err),
            Self::Config(err) => match err {
                config::ConfigError::Read(_) => ErrorKind::Io,
                config::ConfigError::Parse(_) => ErrorKind::Invalid,
            },
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Path(_) | Self::Io(_) => ErrorKind::Io,
        }
    }
}

fn odb_kind(err: &odb::OdbError) -> ErrorKind {
    use odb::OdbError;
    match err {
        OdbError::NotFound(_) => ErrorKind::NotFound,
        OdbError::Corrupt { .. } => ErrorKind::Integrity,
        OdbError::WrongKind { .. } | OdbError::Codec(_) => ErrorKind::Invalid,
        OdbError::Fetch { .. } => ErrorKind::Transport,
        OdbError::Cancelled(_) => ErrorKind::Cancelled,
        OdbError::Io(_) => ErrorKind::Io,
    }
}

fn index_kind(err: &index::IndexError) -> ErrorKind {
    use index::IndexError;
    match err {
        IndexError::NotFound(_) => ErrorKind::NotFound,
        IndexError::Corrupt(_) => ErrorKind::Integrity,
        IndexError::BadPattern { .. } | IndexError::Mode(_) => ErrorKind::Invalid,
        IndexError::Path(_) | IndexError::Io(_) => ErrorKind::Io,
    }
}

fn ref_kind(err: &refs::RefError) -> ErrorKind {
    use refs::RefError;
    match err {
        RefError::NotFound(_) => ErrorKind::NotFound,
        RefError::InvalidName(_) | RefError::Collision { .. } => ErrorKind::Invalid,
        RefError::Precondition { .. } => ErrorKind::Precondition,
        RefError::Corrupt(_) | RefError::CorruptLog { .. } => ErrorKind::Integrity,
        RefError::Path(_) | RefError::Io(_) => ErrorKind::Io,
    }
}

fn revision_kind(err: &revision::RevisionError) -> ErrorKind {
    use revision::RevisionError;
    match err {
        RevisionError::Unknown(_)
        | RevisionError::PathNotFound { .. }
        | RevisionError::NoReflogEntry { .. } => ErrorKind::NotFound,
        RevisionError::Ambiguous(_) => ErrorKind::Ambiguous,
        RevisionError::Invalid(_) => ErrorKind::Invalid,
        RevisionError::Odb(err) => odb_kind(err),
        RevisionError::Ref(err) => ref_kind(err),
    }
}

fn worktree_kind(err: &worktree::WorktreeError) -> ErrorKind {
    use worktree::WorktreeError;
    match err {
        WorktreeError::EmptyCommit | WorktreeError::UnresolvedConflicts => ErrorKind::Aborted,
        WorktreeError::UnstagedChanges { .. } => ErrorKind::Precondition,
        WorktreeError::MissingContent { .. } => ErrorKind::NotFound,
        WorktreeError::Odb(err) => odb_kind(err),
        WorktreeError::Ref(err) => ref_kind(err),
        WorktreeError::Index(err) => index_kind(err),
        WorktreeError::Cancelled(_) => ErrorKind::Cancelled,
        WorktreeError::Path(_) | WorktreeError::Io(_) => ErrorKind::Io,
    }
}

fn merge_kind(err: &merge::MergeError) -> ErrorKind {
    use merge::MergeError;
    match err {
        MergeError::Odb(err) => odb_kind(err),
        MergeError::Driver(_) => ErrorKind::Aborted,
    }
}

fn history_kind(err: &history::HistoryError) -> ErrorKind {
    use history::HistoryError;
    match err {
        HistoryError::HasConflicts { .. } => ErrorKind::Conflict,
        HistoryError::ReplayInProgress
        | HistoryError::NoReplayInProgress
        | HistoryError::UnresolvedConflicts
        | HistoryError::FastForwardImpossible => ErrorKind::Precondition,
        HistoryError::UnrelatedHistories
        | HistoryError::NothingToStash
        | HistoryError::UnbornHead => ErrorKind::Aborted,
        HistoryError::CorruptMetadata(_) => ErrorKind::Integrity,
        HistoryError::Merge(err) => merge_kind(err),
        HistoryError::Worktree(err) => worktree_kind(err),
        HistoryError::Odb(err) => odb_kind(err),
        HistoryError::Ref(err) => ref_kind(err),
        HistoryError::Cancelled(_) => ErrorKind::Cancelled,
        HistoryError::Io(_) | HistoryError::Path(_) => ErrorKind::Io,
    }
}

fn transfer_kind(err: &promisor::TransferError) -> ErrorKind {
    use promisor::TransferError;
    match err {
        TransferError::Transport(_) => ErrorKind::Transport,
        TransferError::Odb(err) => odb_kind(err),
        TransferError::Cancelled(_) => ErrorKind::Cancelled,
    }
}

fn protocol_kind(err: &protocol::ProtocolError) -> ErrorKind {
    use protocol::ProtocolError;
    match err {
        ProtocolError::RemoteRejected(_) | ProtocolError::Transport(_) => ErrorKind::Transport,
        ProtocolError::NonFastForward { .. } | ProtocolError::TagExists(_) => {
            ErrorKind::Precondition
        }
        ProtocolError::Transfer(err) => transfer_kind(err),
        ProtocolError::Odb(err) => odb_kind(err),
        ProtocolError::Ref(err) => ref_kind(err),
        ProtocolError::Cancelled(_) => ErrorKind::Cancelled,
        ProtocolError::Path(_) | ProtocolError::Io(_) => ErrorKind::Io,
    }
}

fn repo_kind(err: &repo::RepoError) -> ErrorKind {
    use repo::RepoError;
    match err {
        RepoError::NotARepository(_) => ErrorKind::NotFound,
        RepoError::AlreadyExists(_) => ErrorKind::Precondition,
        RepoError::NoTransport => ErrorKind::Invalid,
        RepoError::Config(config::ConfigError::Parse(_)) => ErrorKind::Invalid,
        RepoError::Config(config::ConfigError::Read(_)) => ErrorKind::Io,
        RepoError::Odb(err) => odb_kind(err),
        RepoError::Ref(err) => ref_kind(err),
        RepoError::Worktree(err) => worktree_kind(err),
        RepoError::Revision(err) => revision_kind(err),
        RepoError::Protocol(err) => protocol_kind(err),
        RepoError::Io(_) => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        let err = ZetaError::from(odb::OdbError::NotFound(hash::ObjectId::ZERO));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.kind().suggested_exit_code(), 1);

        let err = ZetaError::from(history::HistoryError::HasConflicts { conflicts: vec![] });
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.kind().suggested_exit_code(), 1);

        let err = ZetaError::from(refs::RefError::Precondition {
            name: "refs/heads/main".to_owned(),
            expected: None,
            actual: None,
        });
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert_eq!(err.kind().suggested_exit_code(), 128);

        // Nested errors classify by their leaves.
        let err = ZetaError::from(history::HistoryError::Worktree(
            worktree::WorktreeError::EmptyCommit,
        ));
        assert_eq!(err.kind(), ErrorKind::Aborted);
    }
}
