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

//! Repository configuration, stored as TOML in `.zeta/config`.

use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Bound on [`TransferConfig::concurrent`].
pub const MAX_CONCURRENT_TRANSFERS: usize = 50;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file")]
    Read(#[from] io::Error),
    #[error("Malformed config file")]
    Parse(#[from] toml::de::Error),
}

/// Large-file chunking policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ChunkConfig {
    /// Files of at least this size are stored as fragment manifests.
    pub threshold: u64,
    /// Target chunk size in bytes.
    pub size: u64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            threshold: 4 << 20,
            size: 4 << 20,
        }
    }
}

/// Promisor transfer tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TransferConfig {
    /// Parallel object streams, clamped to 1..=50.
    pub concurrent: usize,
    /// Maximum number of ids per small-object batch request.
    pub batch_limit: usize,
    /// Objects of at least this size are streamed individually.
    pub large_threshold: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrent: 8,
            batch_limit: 256,
            large_threshold: 1 << 20,
        }
    }
}

impl TransferConfig {
    pub fn concurrency(&self) -> usize {
        self.concurrent.clamp(1, MAX_CONCURRENT_TRANSFERS)
    }
}

/// External download accelerator. The binary path and environment are the
/// only process-wide state; they travel on the repository handle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AcceleratorConfig {
    pub program: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CoreConfig {
    /// Lazy-fetch mode: objects may be absent locally and fetched on demand.
    pub snapshot: bool,
    /// Sparse checkout roots. Empty means the whole tree is visible.
    pub sparse_dirs: Vec<String>,
    /// Record pseudo-index entries instead of failing when content cannot
    /// be fetched during checkout.
    pub missing_not_failure: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RemoteConfig {
    pub url: Option<String>,
}

/// Committer identity recorded in commits, tags and the reflog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct UserConfig {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RepoConfig {
    pub core: CoreConfig,
    pub user: UserConfig,
    pub chunk: ChunkConfig,
    pub transfer: TransferConfig,
    pub accelerator: AcceleratorConfig,
    pub remote: RemoteConfig,
}

impl RepoConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err.into()),
        };
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), io::Error> {
        let text = toml::to_string_pretty(self).expect("config serializes");
        fs::write(path, text)
    }
}
