// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The write side: partitions accumulate in memory and are serialized to a
//! single V3 file on flush.

mod partition;
mod profile;

pub use partition::PartitionWriter;

use crate::bucket::{BucketWriter, FileMeta, Meta};
use crate::collections::FxHashMap;
use crate::format::{
    FormatVersion, Footer, IndexFile, PartitionHeader, PartitionSymbols, DEFAULT_FILE_NAME,
};
use crate::pprof;
use crate::reader::{PartitionReader, PartitionStats, SymbolsReader};
use crate::samples::Samples;
use crate::stacktraces::StacktraceInserter;
use crate::symbols::Symbols;
use crate::{Config, ConfigError, SymdbError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Writer {
    config: Config,
    bucket: Arc<dyn BucketWriter>,
    partitions: RwLock<FxHashMap<u64, Arc<PartitionWriter>>>,
}

impl Writer {
    pub fn new(config: Config, bucket: Arc<dyn BucketWriter>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            bucket,
            partitions: RwLock::new(FxHashMap::default()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the writer of the partition, creating it on first use.
    pub fn partition_writer(&self, key: u64) -> Arc<PartitionWriter> {
        if let Some(p) = self.partitions.read().get(&key) {
            return p.clone();
        }
        let mut partitions = self.partitions.write();
        partitions
            .entry(key)
            .or_insert_with(|| {
                tracing::debug!(partition = key, "Created partition");
                Arc::new(PartitionWriter::new(
                    key,
                    self.config.stacktraces.max_nodes_per_chunk,
                ))
            })
            .clone()
    }

    pub fn lookup_partition(&self, key: u64) -> Option<Arc<PartitionWriter>> {
        self.partitions.read().get(&key).cloned()
    }

    /// Ingests a profile into the partition. See
    /// [`PartitionWriter::write_profile_symbols`].
    pub fn write_profile_symbols(
        &self,
        partition: u64,
        profile: &pprof::Profile,
    ) -> Result<Vec<Samples>, SymdbError> {
        self.partition_writer(partition)
            .write_profile_symbols(profile)
    }

    /// Serializes every partition, in ascending key order, followed by the
    /// index and the footer.
    pub fn encode(&self) -> Result<Vec<u8>, SymdbError> {
        let mut partitions: Vec<Arc<PartitionWriter>> =
            self.partitions.read().values().cloned().collect();
        partitions.sort_unstable_by_key(|p| p.key());

        let block_size = self.config.symbols.block_size as usize;
        let mut buf = Vec::new();
        let mut headers = Vec::with_capacity(partitions.len());
        for p in &partitions {
            let stacktraces = p.write_stacktraces(&mut buf)?;
            let symbols = p.write_symbols(&mut buf, block_size)?;
            headers.push(PartitionHeader {
                partition: p.key(),
                stacktraces,
                symbols: PartitionSymbols::V3(symbols),
            });
        }
        let index_offset = buf.len() as u64;
        buf.extend_from_slice(&IndexFile::new(FormatVersion::V3, headers).encode());
        buf.extend_from_slice(
            &Footer {
                version: FormatVersion::V3,
                index_offset,
            }
            .encode(),
        );
        Ok(buf)
    }

    /// Writes the symbol database of the block `block_id` to the bucket, at
    /// `{dir}/{block_id}/symbols.symdb`. The writer keeps its contents.
    pub async fn flush(&self, block_id: &str) -> Result<Meta, SymdbError> {
        let data = self.encode()?;
        let meta = Meta {
            ulid: block_id.to_string(),
            files: vec![FileMeta {
                rel_path: DEFAULT_FILE_NAME.to_string(),
                size_bytes: data.len() as u64,
                parquet: None,
            }],
        };
        let path = self.object_path(&meta.path(DEFAULT_FILE_NAME));
        let size = data.len();
        self.bucket.upload(&path, Bytes::from(data)).await?;
        tracing::debug!(
            block = block_id,
            path = %path,
            size,
            partitions = self.partitions.read().len(),
            "Flushed symbol database"
        );
        Ok(meta)
    }

    fn object_path(&self, path: &str) -> String {
        let dir = self.config.dir.trim_end_matches('/');
        if dir.is_empty() {
            path.to_string()
        } else {
            format!("{dir}/{path}")
        }
    }
}

/// Reads from the writer directly, before anything is flushed. The symbol
/// tables are copied when the partition is requested.
#[async_trait]
impl SymbolsReader for Writer {
    async fn fetch_partition(
        &self,
        key: u64,
        token: &CancellationToken,
    ) -> Result<Box<dyn PartitionReader>, SymdbError> {
        if token.is_cancelled() {
            return Err(SymdbError::Cancelled);
        }
        let partition = self
            .lookup_partition(key)
            .ok_or(SymdbError::PartitionNotFound)?;
        Ok(Box::new(MemoryPartition {
            symbols: partition.symbols(),
            partition,
        }))
    }
}

struct MemoryPartition {
    partition: Arc<PartitionWriter>,
    symbols: Symbols,
}

#[async_trait]
impl PartitionReader for MemoryPartition {
    fn key(&self) -> u64 {
        self.partition.key()
    }

    fn symbols(&self) -> &Symbols {
        &self.symbols
    }

    fn max_nodes_per_chunk(&self) -> u32 {
        self.partition.max_nodes_per_chunk()
    }

    fn stats(&self) -> PartitionStats {
        PartitionStats::new(
            self.partition.chunk_stats(),
            self.partition.max_nodes_per_chunk(),
            &self.symbols,
        )
    }

    fn resolve_stacktrace_locations(
        &self,
        inserter: &mut dyn StacktraceInserter,
        ids: &mut [u32],
    ) -> Result<(), SymdbError> {
        self.partition.resolve_stacktrace_locations(inserter, ids)
    }

    async fn release(&self) {}
}
