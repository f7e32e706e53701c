// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::format::FormatVersion;
use crate::symbols::DEFAULT_SYMBOLS_BLOCK_SIZE;
use crate::SymdbError;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

pub const DEFAULT_MAX_NODES_PER_CHUNK: u32 = 4 << 20;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A chunk must have room for the root and at least one frame.
    #[error("max_nodes_per_chunk must be 0 (unbounded) or at least 2, got {0}")]
    InvalidMaxNodesPerChunk(u32),
    #[error("symbols block size must be greater than 0")]
    InvalidBlockSize,
    #[error("format version {0:?} can be read but not written")]
    UnsupportedVersion(FormatVersion),
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ConfigError> for SymdbError {
    #[cold]
    fn from(err: ConfigError) -> Self {
        SymdbError::InvalidInput(Cow::Owned(err.to_string()))
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StacktracesConfig {
    /// Maximum number of nodes of a stack trace chunk; 0 means a single,
    /// unbounded chunk per partition.
    pub max_nodes_per_chunk: u32,
}

impl Default for StacktracesConfig {
    fn default() -> Self {
        Self {
            max_nodes_per_chunk: DEFAULT_MAX_NODES_PER_CHUNK,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolsConfig {
    /// Number of symbols per encoded block.
    pub block_size: u32,
}

impl Default for SymbolsConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_SYMBOLS_BLOCK_SIZE as u32,
        }
    }
}

/// Writer configuration.
///
/// ```
/// use libdd_symdb::Config;
/// let config = Config::from_json(r#"{"dir": "blocks", "stacktraces": {"max_nodes_per_chunk": 1024}}"#).unwrap();
/// assert_eq!(config.stacktraces.max_nodes_per_chunk, 1024);
/// assert_eq!(config.symbols.block_size, 1024);
/// ```
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Object-store prefix the writer uploads blocks under.
    pub dir: String,
    pub stacktraces: StacktracesConfig,
    pub symbols: SymbolsConfig,
    pub version: FormatVersion,
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stacktraces.max_nodes_per_chunk == 1 {
            return Err(ConfigError::InvalidMaxNodesPerChunk(1));
        }
        if self.symbols.block_size == 0 {
            return Err(ConfigError::InvalidBlockSize);
        }
        if self.version != FormatVersion::V3 {
            return Err(ConfigError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

fn default_max_concurrent() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// Options of a [`crate::resolver::Resolver`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverOptions {
    /// Node budget of the resolved profile or tree; 0 disables truncation.
    pub max_nodes: u64,
    /// Maximum number of partitions fetched at the same time.
    pub max_concurrent: usize,
    /// Root-first function names selecting the call site whose subtree is
    /// kept. Samples outside of it are dropped.
    pub call_site: Option<Vec<String>>,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            max_nodes: 0,
            max_concurrent: default_max_concurrent(),
            call_site: None,
        }
    }
}
