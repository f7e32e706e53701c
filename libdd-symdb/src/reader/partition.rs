// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{PartitionReader, PartitionStats};
use crate::bucket::BucketReader;
use crate::codec::crc32c;
use crate::format::{PartitionHeader, PartitionSymbols, StacktraceBlockHeader, SymbolsBlockHeader};
use crate::refcount::RefCounted;
use crate::stacktraces::{resolve_chunked, ParentPointerTree, StacktraceInserter};
use crate::symbols::{Function, Location, Mapping, Symbol, Symbols, SymbolsDecoder};
use crate::{FormatError, SymdbError};
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A unit of partition data that is loaded and freed on its own.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Unit {
    Chunk(usize),
    Strings,
    Functions,
    Mappings,
    Locations,
}

enum Acquired {
    Chunk(usize, Arc<ParentPointerTree>),
    Strings(Arc<Vec<String>>),
    Functions(Arc<Vec<Function>>),
    Mappings(Arc<Vec<Mapping>>),
    Locations(Arc<Vec<Location>>),
}

impl Acquired {
    fn unit(&self) -> Unit {
        match self {
            Acquired::Chunk(i, _) => Unit::Chunk(*i),
            Acquired::Strings(_) => Unit::Strings,
            Acquired::Functions(_) => Unit::Functions,
            Acquired::Mappings(_) => Unit::Mappings,
            Acquired::Locations(_) => Unit::Locations,
        }
    }
}

/// The shared state of a partition: its header and one reference counted
/// slot per chunk and per symbol table.
pub(crate) struct PartitionState {
    header: PartitionHeader,
    chunks: Vec<RefCounted<ParentPointerTree>>,
    strings: RefCounted<Vec<String>>,
    functions: RefCounted<Vec<Function>>,
    mappings: RefCounted<Vec<Mapping>>,
    locations: RefCounted<Vec<Location>>,
}

impl PartitionState {
    pub(crate) fn new(header: PartitionHeader) -> Self {
        Self {
            chunks: header
                .stacktraces
                .iter()
                .map(|_| RefCounted::default())
                .collect(),
            header,
            strings: RefCounted::default(),
            functions: RefCounted::default(),
            mappings: RefCounted::default(),
            locations: RefCounted::default(),
        }
    }

    /// Acquires every chunk and symbol table of the partition, concurrently.
    /// Either everything is acquired or nothing is: on the first failure, or
    /// once `cancel` is cancelled, the remaining fetches are cancelled and
    /// whatever was acquired is released.
    pub(crate) async fn fetch(
        self: &Arc<Self>,
        bucket: &dyn BucketReader,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<BlockPartition, SymdbError> {
        if let PartitionSymbols::V2(_) = self.header.symbols {
            return Err(SymdbError::Unsupported(
                "Parquet-backed symbol tables".into(),
            ));
        }

        let token = cancel.child_token();
        let futures: Vec<_> = self
            .fetches(bucket, path)
            .into_iter()
            .map(|fetch| {
                let token = token.clone();
                async move {
                    let result = tokio::select! {
                        biased;
                        _ = token.cancelled() => Err(SymdbError::Cancelled),
                        r = fetch => r,
                    };
                    if result.is_err() {
                        token.cancel();
                    }
                    result
                }
            })
            .collect();

        let mut acquired = Vec::with_capacity(futures.len());
        let mut error: Option<SymdbError> = None;
        for result in join_all(futures).await {
            match result {
                Ok(a) => acquired.push(a),
                // Cancellations are caused by the error that cancelled the
                // token; report that one.
                Err(e) => {
                    if error
                        .as_ref()
                        .map_or(true, |first| matches!(first, SymdbError::Cancelled))
                    {
                        error = Some(e);
                    }
                }
            }
        }
        let units: Vec<Unit> = acquired.iter().map(Acquired::unit).collect();
        if error.is_none() && cancel.is_cancelled() {
            error = Some(SymdbError::Cancelled);
        }
        if let Some(error) = error {
            self.release(&units).await;
            tracing::warn!(
                partition = self.header.partition,
                %error,
                "Failed to fetch partition"
            );
            return Err(error);
        }

        let mut chunks = vec![None; self.chunks.len()];
        let mut symbols = Symbols::default();
        for a in acquired {
            match a {
                Acquired::Chunk(i, tree) => chunks[i] = Some(tree),
                Acquired::Strings(t) => symbols.strings = t,
                Acquired::Functions(t) => symbols.functions = t,
                Acquired::Mappings(t) => symbols.mappings = t,
                Acquired::Locations(t) => symbols.locations = t,
            }
        }
        let chunks: Option<Vec<_>> = chunks.into_iter().collect();
        let Some(chunks) = chunks else {
            self.release(&units).await;
            return Err(SymdbError::other("partition chunk was not fetched"));
        };
        if let Err(error) = symbols.validate() {
            self.release(&units).await;
            return Err(error.into());
        }

        Ok(BlockPartition {
            max_nodes_per_chunk: self
                .header
                .stacktraces
                .first()
                .map_or(0, |h| h.max_nodes),
            state: self.clone(),
            units,
            chunks,
            symbols,
            released: AtomicBool::new(false),
        })
    }

    fn fetches<'a>(
        &'a self,
        bucket: &'a dyn BucketReader,
        path: &'a str,
    ) -> Vec<BoxFuture<'a, Result<Acquired, SymdbError>>> {
        let mut fetches = Vec::with_capacity(self.chunks.len() + 4);
        for (i, (slot, header)) in self.chunks.iter().zip(&self.header.stacktraces).enumerate() {
            fetches.push(
                async move {
                    let tree = slot.acquire(|| load_chunk(bucket, path, header)).await?;
                    Ok(Acquired::Chunk(i, tree))
                }
                .boxed(),
            );
        }
        if let PartitionSymbols::V3(h) = &self.header.symbols {
            fetches.push(
                async move {
                    let t = self
                        .strings
                        .acquire(|| load_table(bucket, path, &h.strings))
                        .await?;
                    Ok(Acquired::Strings(t))
                }
                .boxed(),
            );
            fetches.push(
                async move {
                    let t = self
                        .functions
                        .acquire(|| load_table(bucket, path, &h.functions))
                        .await?;
                    Ok(Acquired::Functions(t))
                }
                .boxed(),
            );
            fetches.push(
                async move {
                    let t = self
                        .mappings
                        .acquire(|| load_table(bucket, path, &h.mappings))
                        .await?;
                    Ok(Acquired::Mappings(t))
                }
                .boxed(),
            );
            fetches.push(
                async move {
                    let t = self
                        .locations
                        .acquire(|| load_table(bucket, path, &h.locations))
                        .await?;
                    Ok(Acquired::Locations(t))
                }
                .boxed(),
            );
        }
        fetches
    }

    async fn release(&self, units: &[Unit]) {
        for unit in units {
            match *unit {
                Unit::Chunk(i) => {
                    if let Some(chunk) = self.chunks.get(i) {
                        chunk.release().await
                    }
                }
                Unit::Strings => self.strings.release().await,
                Unit::Functions => self.functions.release().await,
                Unit::Mappings => self.mappings.release().await,
                Unit::Locations => self.locations.release().await,
            }
        }
    }
}

async fn load_chunk(
    bucket: &dyn BucketReader,
    path: &str,
    header: &StacktraceBlockHeader,
) -> Result<ParentPointerTree, SymdbError> {
    let data = bucket.get_range(path, header.offset, header.size).await?;
    if crc32c(&data) != header.crc {
        return Err(FormatError::InvalidCrc.into());
    }
    Ok(ParentPointerTree::decode(&data, header.nodes)?)
}

async fn load_table<T: Symbol>(
    bucket: &dyn BucketReader,
    path: &str,
    header: &SymbolsBlockHeader,
) -> Result<Vec<T>, SymdbError> {
    if header.length == 0 || header.block_size == 0 {
        return Ok(Vec::new());
    }
    let data = bucket
        .get_range(path, header.offset, u64::from(header.size))
        .await?;
    Ok(SymbolsDecoder::<T>::default().decode(header, &data)?)
}

/// A fetched partition of a block. Holds one reference to every unit of
/// the partition until released.
pub(crate) struct BlockPartition {
    state: Arc<PartitionState>,
    units: Vec<Unit>,
    chunks: Vec<Arc<ParentPointerTree>>,
    max_nodes_per_chunk: u32,
    symbols: Symbols,
    released: AtomicBool,
}

#[async_trait]
impl PartitionReader for BlockPartition {
    fn key(&self) -> u64 {
        self.state.header.partition
    }

    fn symbols(&self) -> &Symbols {
        &self.symbols
    }

    fn max_nodes_per_chunk(&self) -> u32 {
        self.max_nodes_per_chunk
    }

    fn stats(&self) -> PartitionStats {
        PartitionStats::new(
            self.state
                .header
                .stacktraces
                .iter()
                .map(|h| (h.stacktraces, h.nodes)),
            self.max_nodes_per_chunk,
            &self.symbols,
        )
    }

    fn resolve_stacktrace_locations(
        &self,
        inserter: &mut dyn StacktraceInserter,
        ids: &mut [u32],
    ) -> Result<(), SymdbError> {
        resolve_chunked(&self.chunks, self.max_nodes_per_chunk, inserter, ids)
    }

    async fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.state.release(&self.units).await;
        }
    }
}
