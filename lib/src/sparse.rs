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

//! Sparse-dir matching.
//!
//! Sparse dirs are configured subtree roots; paths outside every root are
//! hidden from diff, status, checkout and commit tree rebuilding. The same
//! matcher instance is applied to all three diff sources so hidden paths
//! are never reported from one side only.

/// How much of a directory the matcher wants visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Everything under the directory is visible.
    All,
    /// Some descendants may be visible; recurse and test each.
    Some,
    /// Nothing under the directory is visible.
    Nothing,
}

/// Matches paths against a set of subtree roots.
///
/// An empty root set means matching everything (sparse checkout disabled).
#[derive(Debug, Clone)]
pub struct SparseMatcher {
    /// Normalized roots without trailing slashes. Empty = match all.
    roots: Vec<String>,
}

impl SparseMatcher {
    pub fn new(dirs: impl IntoIterator<Item = String>) -> Self {
        let roots = dirs
            .into_iter()
            .map(|dir| dir.trim_matches('/').to_owned())
            .filter(|dir| !dir.is_empty())
            .collect();
        Self { roots }
    }

    pub fn match_all() -> Self {
        Self { roots: vec![] }
    }

    pub fn is_everything(&self) -> bool {
        self.roots.is_empty()
    }

    /// The normalized subtree roots. Empty when matching everything.
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Whether the file at `path` is visible.
    pub fn matches_file(&self, path: &str) -> bool {
        self.is_everything() || self.roots.iter().any(|root| is_under(path, root))
    }

    /// How to visit the directory at `dir` (`""` is the tree root).
    pub fn visit_dir(&self, dir: &str) -> Visit {
        if self.is_everything() {
            return Visit::All;
        }
        if self.roots.iter().any(|root| is_under(dir, root)) {
            return Visit::All;
        }
        if self
            .roots
            .iter()
            .any(|root| dir.is_empty() || is_under(root, dir))
        {
            return Visit::Some;
        }
        Visit::Nothing
    }
}

/// Whether `path` equals `root` or lives underneath it.
fn is_under(path: &str, root: &str) -> bool {
    path == root
        || (path.len() > root.len()
            && path.starts_with(root)
            && path.as_bytes()[root.len()] == b'/')
}
