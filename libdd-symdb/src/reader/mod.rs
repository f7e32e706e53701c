// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The read side: a block's index is read once, and partitions are fetched
//! on demand and shared by everyone who holds them.

mod partition;

use crate::bucket::{BucketReader, Meta};
use crate::collections::FxHashMap;
use crate::format::{
    FormatVersion, Footer, IndexFile, DEFAULT_FILE_NAME, INDEX_FILE_NAME, STACKTRACES_FILE_NAME,
};
use crate::stacktraces::StacktraceInserter;
use crate::symbols::Symbols;
use crate::{FormatError, SymdbError};
use async_trait::async_trait;
use partition::PartitionState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Gives access to the partitions of a symbol database.
#[async_trait]
pub trait SymbolsReader: Send + Sync {
    /// Fetches the partition. The returned reader holds the partition's data
    /// until [`PartitionReader::release`] is called.
    ///
    /// Once `token` is cancelled the fetch gives up with
    /// [`SymdbError::Cancelled`], holding nothing.
    async fn fetch_partition(
        &self,
        key: u64,
        token: &CancellationToken,
    ) -> Result<Box<dyn PartitionReader>, SymdbError>;

    /// Fetches the partition; see [`SymbolsReader::fetch_partition`].
    async fn partition(&self, key: u64) -> Result<Box<dyn PartitionReader>, SymdbError> {
        self.fetch_partition(key, &CancellationToken::new()).await
    }
}

/// The sizes of a partition, used to preallocate when copying it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PartitionStats {
    pub stacktraces_total: usize,
    /// An upper bound of the stack trace ids of the partition.
    pub max_stacktrace_id: usize,
    pub locations_total: usize,
    pub mappings_total: usize,
    pub functions_total: usize,
    pub strings_total: usize,
}

impl PartitionStats {
    /// `chunks` yields the number of stack traces and nodes of each chunk,
    /// in chunk order.
    pub(crate) fn new(
        chunks: impl IntoIterator<Item = (u32, u32)>,
        max_nodes_per_chunk: u32,
        symbols: &Symbols,
    ) -> Self {
        let mut stats = Self {
            locations_total: symbols.locations.len(),
            mappings_total: symbols.mappings.len(),
            functions_total: symbols.functions.len(),
            strings_total: symbols.strings.len(),
            ..Default::default()
        };
        for (i, (stacktraces, nodes)) in chunks.into_iter().enumerate() {
            stats.stacktraces_total += stacktraces as usize;
            let end = i * max_nodes_per_chunk as usize + nodes as usize;
            stats.max_stacktrace_id = stats.max_stacktrace_id.max(end);
        }
        stats
    }
}

/// A fetched partition.
#[async_trait]
pub trait PartitionReader: Send + Sync {
    fn key(&self) -> u64;

    fn symbols(&self) -> &Symbols;

    /// Stack trace ids are split into chunks of this many nodes; 0 if the
    /// stack traces form a single chunk.
    fn max_nodes_per_chunk(&self) -> u32;

    fn stats(&self) -> PartitionStats;

    /// Calls `inserter` with the leaf-first locations of every stack trace
    /// in `ids`. `ids` should be sorted; they are rewritten in place to
    /// chunk-local values.
    fn resolve_stacktrace_locations(
        &self,
        inserter: &mut dyn StacktraceInserter,
        ids: &mut [u32],
    ) -> Result<(), SymdbError>;

    /// Writes the leaf-first locations of one stack trace to `dst`, which
    /// is left empty if the stack trace cannot be resolved.
    fn lookup_locations(&self, dst: &mut Vec<u32>, stacktrace_id: u32) {
        dst.clear();
        let mut copy = |_: u32, locations: &[u32]| dst.extend_from_slice(locations);
        if self
            .resolve_stacktrace_locations(&mut copy, &mut [stacktrace_id])
            .is_err()
        {
            dst.clear();
        }
    }

    /// Gives the partition's data back. Calls after the first one have no
    /// effect.
    async fn release(&self);
}

/// Reads the symbol database of a block.
pub struct Reader {
    bucket: Arc<dyn BucketReader>,
    meta: Meta,
    version: FormatVersion,
    /// The file the stack trace chunks (and V3 symbols) live in.
    data_path: String,
    partitions: FxHashMap<u64, Arc<PartitionState>>,
}

impl Reader {
    /// Reads the index of the block described by `meta`: from the footer of
    /// `symbols.symdb` for V3 blocks, from `index.symdb` otherwise.
    pub async fn open(bucket: Arc<dyn BucketReader>, meta: Meta) -> Result<Self, SymdbError> {
        let (index, data_path) = if let Some(file) = meta.file(DEFAULT_FILE_NAME) {
            let path = meta.path(DEFAULT_FILE_NAME);
            let footer_offset = file
                .size_bytes
                .checked_sub(Footer::SIZE as u64)
                .ok_or(FormatError::InvalidSize)?;
            let footer = Footer::decode(
                &bucket
                    .get_range(&path, footer_offset, Footer::SIZE as u64)
                    .await?,
            )?;
            let index_size = footer_offset
                .checked_sub(footer.index_offset)
                .ok_or(FormatError::InvalidSize)?;
            let index = IndexFile::decode(
                &bucket
                    .get_range(&path, footer.index_offset, index_size)
                    .await?,
            )?;
            if index.header.version != footer.version {
                return Err(FormatError::Malformed("index and footer versions differ").into());
            }
            (index, path)
        } else if meta.file(INDEX_FILE_NAME).is_some() {
            let index = IndexFile::decode(&bucket.get(&meta.path(INDEX_FILE_NAME)).await?)?;
            (index, meta.path(STACKTRACES_FILE_NAME))
        } else {
            return Err(SymdbError::invalid_input(
                "the block has no symbol database",
            ));
        };

        let version = index.header.version;
        let mut partitions = FxHashMap::default();
        partitions.try_reserve(index.partitions.len())?;
        for header in index.partitions {
            partitions.insert(header.partition, Arc::new(PartitionState::new(header)));
        }
        tracing::debug!(
            block = %meta.ulid,
            version = u32::from(version),
            partitions = partitions.len(),
            "Opened symbol database"
        );
        Ok(Self {
            bucket,
            meta,
            version,
            data_path,
            partitions,
        })
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn version(&self) -> FormatVersion {
        self.version
    }

    /// The keys of the partitions of the block, in ascending order.
    pub fn partition_keys(&self) -> Vec<u64> {
        let mut keys: Vec<u64> = self.partitions.keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

#[async_trait]
impl SymbolsReader for Reader {
    async fn fetch_partition(
        &self,
        key: u64,
        token: &CancellationToken,
    ) -> Result<Box<dyn PartitionReader>, SymdbError> {
        let state = self
            .partitions
            .get(&key)
            .cloned()
            .ok_or(SymdbError::PartitionNotFound)?;
        let partition = state
            .fetch(self.bucket.as_ref(), &self.data_path, token)
            .await?;
        Ok(Box::new(partition))
    }
}
