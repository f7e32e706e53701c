// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns stack trace samples back into profiles.
//!
//! Partitions are fetched in the background as soon as samples reference
//! them, with at most `max_concurrent` fetches in flight. [`Resolver::tree`]
//! and [`Resolver::pprof`] wait for the fetches and build their output out
//! of every partition; the partitions are released once they are resolved.

mod call_tree;
mod pprof;
mod selector;
mod tree;

pub use selector::{CallSiteSelector, Relation};
pub use tree::{Tree, TRUNCATED_NODE_NAME};

use crate::collections::FxHashMap;
use crate::reader::{PartitionReader, SymbolsReader};
use crate::samples::Samples;
use crate::stacktraces::split_stacktraces;
use crate::symbols::Symbols;
use crate::{ResolverOptions, SymdbError};
use futures::future::{join_all, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use selector::SampleFilter;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type FetchHandle = JoinHandle<Result<Box<dyn PartitionReader>, SymdbError>>;

/// A fetched partition and its compacted samples.
type Fetched = (Arc<dyn PartitionReader>, Samples);

struct LazyPartition {
    samples: FxHashMap<u32, i64>,
    fetch: FetchHandle,
}

/// The samples of one stack trace chunk of a fetched partition: the unit
/// of work of the blocking pool.
struct Batch {
    /// Index of the partition in the fetched list.
    partition: usize,
    reader: Arc<dyn PartitionReader>,
    samples: Samples,
}

type ResolveFn<T> = fn(
    &dyn PartitionReader,
    &Samples,
    Option<&CallSiteSelector>,
    &CancellationToken,
) -> Result<T, SymdbError>;

/// Resolves the samples of one profile. Samples may be added from several
/// threads; the result is built once, by [`Resolver::tree`] or
/// [`Resolver::pprof`].
///
/// [`Resolver::release`] must be called once the resolver is no longer
/// needed, so that the partitions fetched but not resolved are released.
pub struct Resolver {
    reader: Arc<dyn SymbolsReader>,
    options: ResolverOptions,
    selector: Option<CallSiteSelector>,
    token: CancellationToken,
    semaphore: Arc<Semaphore>,
    partitions: Mutex<BTreeMap<u64, LazyPartition>>,
}

impl Resolver {
    pub fn new(reader: Arc<dyn SymbolsReader>, options: ResolverOptions) -> Self {
        let selector = options
            .call_site
            .as_deref()
            .filter(|call_site| !call_site.is_empty())
            .map(CallSiteSelector::new);
        Self {
            reader,
            semaphore: Arc::new(Semaphore::new(options.max_concurrent.max(1))),
            options,
            selector,
            token: CancellationToken::new(),
            partitions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    /// Adds samples of the partition. The first samples of a partition
    /// start its fetch; it must be called within a tokio runtime.
    ///
    /// Values of the same stack trace are summed, and stack trace 0 is
    /// skipped.
    pub fn add_samples(&self, partition: u64, samples: &Samples) -> Result<(), SymdbError> {
        let mut partitions = self.partitions.lock();
        let p = match partitions.entry(partition) {
            std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::btree_map::Entry::Vacant(e) => {
                let fetch = self.spawn_fetch(partition)?;
                e.insert(LazyPartition {
                    samples: FxHashMap::default(),
                    fetch,
                })
            }
        };
        for (id, value) in samples.iter() {
            if id > 0 {
                *p.samples.entry(id).or_default() += value;
            }
        }
        Ok(())
    }

    fn spawn_fetch(&self, partition: u64) -> Result<FetchHandle, SymdbError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SymdbError::other("the resolver requires a tokio runtime"))?;
        let reader = self.reader.clone();
        let token = self.token.clone();
        let semaphore = self.semaphore.clone();
        Ok(runtime.spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SymdbError::Cancelled),
                permit = semaphore.acquire_owned() => {
                    permit.map_err(|_| SymdbError::Cancelled)?
                }
            };
            let p = reader.fetch_partition(partition, &token).await?;
            // Cancelled after the fetch completed: nobody owns the result.
            if token.is_cancelled() {
                p.release().await;
                return Err(SymdbError::Cancelled);
            }
            tracing::debug!(partition, "Fetched partition");
            Ok(p)
        }))
    }

    fn take_partitions(&self) -> BTreeMap<u64, LazyPartition> {
        std::mem::take(&mut *self.partitions.lock())
    }

    /// Waits for the fetch of every partition; the result is ordered by
    /// partition key. On error, the other fetches are cancelled and
    /// whatever was fetched is released.
    async fn fetch_all(&self) -> Result<Vec<Fetched>, SymdbError> {
        let mut pending: FuturesUnordered<_> = self
            .take_partitions()
            .into_iter()
            .map(|(key, LazyPartition { samples, fetch })| {
                fetch.map(move |result| (key, samples, result))
            })
            .collect();

        let mut fetched = Vec::with_capacity(pending.len());
        let mut error: Option<SymdbError> = None;
        while let Some((key, samples, result)) = pending.next().await {
            match result.map_err(SymdbError::from).and_then(|r| r) {
                Ok(reader) => {
                    let reader: Arc<dyn PartitionReader> = reader.into();
                    let mut samples: Samples = samples.into_iter().collect();
                    samples.compact();
                    fetched.push((key, reader, samples));
                }
                Err(e) => {
                    if error.is_none() {
                        tracing::debug!(partition = key, error = %e, "Partition fetch failed");
                        self.token.cancel();
                    }
                    if is_first_cause(&error) {
                        error = Some(e);
                    }
                }
            }
        }
        if let Some(error) = error {
            for (_, reader, _) in fetched {
                reader.release().await;
            }
            return Err(error);
        }
        fetched.sort_unstable_by_key(|(key, _, _)| *key);
        Ok(fetched
            .into_iter()
            .map(|(_, reader, samples)| (reader, samples))
            .collect())
    }

    /// Runs `resolve` on the blocking pool for every batch, concurrently.
    /// The first error cancels the batches still running. Results are in
    /// batch order.
    async fn resolve_batches<T: Send + 'static>(
        &self,
        batches: Vec<Batch>,
        resolve: ResolveFn<T>,
    ) -> Result<Vec<(usize, T)>, SymdbError> {
        let token = self.token.child_token();
        let handles: Vec<_> = batches
            .into_iter()
            .map(|batch| {
                let selector = self.selector.clone();
                let token = token.clone();
                tokio::task::spawn_blocking(move || {
                    let result = resolve(
                        batch.reader.as_ref(),
                        &batch.samples,
                        selector.as_ref(),
                        &token,
                    );
                    if result.is_err() {
                        token.cancel();
                    }
                    result.map(|resolved| (batch.partition, resolved))
                })
            })
            .collect();

        let mut resolved = Vec::with_capacity(handles.len());
        let mut error: Option<SymdbError> = None;
        for joined in join_all(handles).await {
            match joined.map_err(SymdbError::from).and_then(|r| r) {
                Ok(r) => resolved.push(r),
                Err(e) => {
                    token.cancel();
                    if is_first_cause(&error) {
                        error = Some(e);
                    }
                }
            }
        }
        match error {
            Some(error) => Err(error),
            None => Ok(resolved),
        }
    }

    /// Builds the flame graph tree of the samples, truncated to
    /// `max_nodes` nodes if set. The stack trace chunks of every partition
    /// are resolved concurrently on the blocking pool.
    pub async fn tree(&self) -> Result<Tree, SymdbError> {
        let fetched = self.fetch_all().await?;
        let resolved = self
            .resolve_batches(batches(&fetched), resolve_tree)
            .await;
        for (reader, _) in &fetched {
            reader.release().await;
        }

        let mut tree = Tree::new();
        for (_, resolved) in resolved? {
            tree.merge(&resolved);
        }
        if self.options.max_nodes > 0 {
            tree.truncate(self.options.max_nodes);
        }
        tracing::debug!(
            partitions = fetched.len(),
            nodes = tree.len(),
            total = tree.total(),
            "Resolved tree"
        );
        Ok(tree)
    }

    /// Builds a pprof profile of the samples, with a single sample type.
    /// With `max_nodes` set, the frames of the least significant functions
    /// are replaced with a single `other` frame.
    pub async fn pprof(&self) -> Result<crate::pprof::Profile, SymdbError> {
        let fetched = self.fetch_all().await?;
        let resolved = self
            .resolve_batches(batches(&fetched), resolve_samples)
            .await;
        let symbols: Vec<Symbols> = fetched
            .iter()
            .map(|(reader, _)| reader.symbols().clone())
            .collect();
        for (reader, _) in &fetched {
            reader.release().await;
        }

        let mut stacks = vec![Vec::new(); symbols.len()];
        for (partition, resolved) in resolved? {
            if let Some(stacks) = stacks.get_mut(partition) {
                stacks.extend(resolved);
            }
        }
        let max_nodes = self.options.max_nodes;
        let profile = tokio::task::spawn_blocking(move || {
            let mut builder = pprof::ProfileBuilder::default();
            for (symbols, stacks) in symbols.iter().zip(&stacks) {
                builder.add_partition(symbols, stacks);
            }
            builder.build(max_nodes)
        })
        .await?;
        tracing::debug!(
            partitions = fetched.len(),
            samples = profile.sample.len(),
            locations = profile.location.len(),
            "Resolved profile"
        );
        Ok(profile)
    }

    /// Cancels the fetches in flight, waits for every fetch to settle, and
    /// releases the partitions that were fetched.
    pub async fn release(&self) {
        self.token.cancel();
        let fetches = self.take_partitions().into_values().map(|p| p.fetch);
        for result in join_all(fetches).await {
            if let Ok(Ok(reader)) = result {
                reader.release().await;
            }
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        // Fetches still in flight release their partition on their own.
        self.token.cancel();
    }
}

/// Cancellations follow the error that caused them: an error replaces the
/// one kept so far only if that one is a cancellation.
fn is_first_cause(kept: &Option<SymdbError>) -> bool {
    kept.as_ref()
        .map_or(true, |e| matches!(e, SymdbError::Cancelled))
}

/// Splits the samples of every partition into one batch per stack trace
/// chunk.
fn batches(fetched: &[Fetched]) -> Vec<Batch> {
    let mut batches = Vec::new();
    for (partition, (reader, samples)) in fetched.iter().enumerate() {
        let mut ids = samples.stacktrace_ids.clone();
        for range in split_stacktraces(&mut ids, reader.max_nodes_per_chunk()) {
            batches.push(Batch {
                partition,
                reader: reader.clone(),
                samples: Samples {
                    stacktrace_ids: samples.stacktrace_ids[range.ids.clone()].to_vec(),
                    values: samples.values[range.ids].to_vec(),
                },
            });
        }
    }
    batches
}

/// Root-first function names of a stack trace: locations are leaf-first,
/// and the lines of a location are leaf-most first.
fn function_names<'a>(symbols: &'a Symbols, locations: &[u32]) -> Vec<&'a str> {
    let mut names = Vec::with_capacity(locations.len());
    for &loc in locations.iter().rev() {
        if let Some(loc) = symbols.locations.get(loc as usize) {
            for line in loc.lines.iter().rev() {
                names.push(symbols.function_name(line.function_id));
            }
        }
    }
    names
}

/// Calls `f` with the value and the leaf-first locations of every sample
/// the selector keeps. `samples` must be compacted: the value of a stack
/// trace is looked up by id.
fn for_each_sample(
    reader: &dyn PartitionReader,
    samples: &Samples,
    selector: Option<&CallSiteSelector>,
    token: &CancellationToken,
    mut f: impl FnMut(i64, &[u32]),
) -> Result<(), SymdbError> {
    let symbols = reader.symbols();
    let mut filter = selector.map(SampleFilter::new);
    let mut ids = samples.stacktrace_ids.clone();
    reader.resolve_stacktrace_locations(
        &mut |id: u32, locations: &[u32]| {
            if token.is_cancelled() {
                return;
            }
            let value = samples
                .stacktrace_ids
                .binary_search(&id)
                .ok()
                .and_then(|i| samples.values.get(i));
            let Some(&value) = value else {
                return;
            };
            if let Some(filter) = filter.as_mut() {
                if !filter.keep(id, || function_names(symbols, locations)) {
                    return;
                }
            }
            f(value, locations);
        },
        &mut ids,
    )?;
    if token.is_cancelled() {
        return Err(SymdbError::Cancelled);
    }
    Ok(())
}

fn resolve_tree(
    reader: &dyn PartitionReader,
    samples: &Samples,
    selector: Option<&CallSiteSelector>,
    token: &CancellationToken,
) -> Result<Tree, SymdbError> {
    let symbols = reader.symbols();
    let mut tree = Tree::new();
    for_each_sample(reader, samples, selector, token, |value, locations| {
        tree.insert_stack(value, &function_names(symbols, locations));
    })?;
    Ok(tree)
}

fn resolve_samples(
    reader: &dyn PartitionReader,
    samples: &Samples,
    selector: Option<&CallSiteSelector>,
    token: &CancellationToken,
) -> Result<Vec<(Vec<u32>, i64)>, SymdbError> {
    let mut resolved = Vec::with_capacity(samples.len());
    for_each_sample(reader, samples, selector, token, |value, locations| {
        resolved.push((locations.to_vec(), value));
    })?;
    Ok(resolved)
}
