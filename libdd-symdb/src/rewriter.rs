// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Copies stack traces, and only the symbols they reference, from the
//! partitions of a source database to a [`Writer`]. Used to compact and
//! merge blocks.

use crate::collections::FxHashMap;
use crate::reader::{PartitionReader, SymbolsReader};
use crate::symbols::{Function, Location, Mapping};
use crate::writer::{PartitionWriter, Writer};
use crate::SymdbError;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Slot {
    /// The id in the destination partition.
    Resolved(u32),
    /// Waiting to be written; the index of the value in `values`.
    Pending(u32),
}

/// Maps the ids of one kind of the source partition to the destination.
struct LookupTable<T> {
    slots: FxHashMap<u32, Slot>,
    /// Source ids of the pending entries.
    pending: Vec<u32>,
    /// Values of the pending entries, in the same order.
    values: Vec<T>,
}

impl<T> LookupTable<T> {
    /// `capacity` is the number of entries of the source table; at most
    /// that many ids are ever looked up.
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            pending: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Returns the slot of a source id, marking unseen ids as pending.
    fn lookup(&mut self, id: u32) -> Slot {
        let pending = &mut self.pending;
        *self.slots.entry(id).or_insert_with(|| {
            pending.push(id);
            Slot::Pending(pending.len() as u32 - 1)
        })
    }

    /// Returns the destination id of a source id once it is written.
    fn resolved(&self, id: u32) -> Result<u32, SymdbError> {
        match self.slots.get(&id) {
            Some(Slot::Resolved(id)) => Ok(*id),
            _ => Err(SymdbError::other("symbol reference was not rewritten")),
        }
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Records the destination ids of the pending entries, in pending
    /// order.
    fn store(&mut self, ids: &[u32]) {
        for (&src, &dst) in self.pending.iter().zip(ids) {
            self.slots.insert(src, Slot::Resolved(dst));
        }
        self.pending.clear();
        self.values.clear();
    }

    /// Forgets the pending entries; only ids already written persist.
    fn rollback(&mut self) {
        self.slots
            .retain(|_, slot| matches!(slot, Slot::Resolved(_)));
        self.pending.clear();
        self.values.clear();
    }
}

struct PartitionRewriter {
    source: Box<dyn PartitionReader>,
    dst: Arc<PartitionWriter>,
    /// Leaf-first location ids.
    stacktraces: LookupTable<Vec<u32>>,
    locations: LookupTable<Location>,
    mappings: LookupTable<Mapping>,
    functions: LookupTable<Function>,
    strings: LookupTable<String>,
}

impl PartitionRewriter {
    fn rewrite(&mut self, stacktraces: &mut [u32]) -> Result<(), SymdbError> {
        for id in stacktraces.iter() {
            self.stacktraces.lookup(*id);
        }
        if self.stacktraces.has_pending() {
            if let Err(err) = self.collect().and_then(|()| self.append()) {
                self.rollback();
                return Err(err);
            }
        }
        for id in stacktraces.iter_mut() {
            *id = self.stacktraces.resolved(*id)?;
        }
        Ok(())
    }

    fn rollback(&mut self) {
        self.stacktraces.rollback();
        self.locations.rollback();
        self.mappings.rollback();
        self.functions.rollback();
        self.strings.rollback();
    }

    /// Marks everything the pending stack traces reference as pending and
    /// copies the source values.
    fn collect(&mut self) -> Result<(), SymdbError> {
        let mut ids = self.stacktraces.pending.clone();
        ids.sort_unstable();
        let mut resolved = vec![Vec::new(); ids.len()];
        let slots = &self.stacktraces.slots;
        let locations = &mut self.locations;
        self.source.resolve_stacktrace_locations(
            &mut |id: u32, stack: &[u32]| {
                for &loc in stack {
                    locations.lookup(loc);
                }
                if let Some(Slot::Pending(slot)) = slots.get(&id) {
                    resolved[*slot as usize] = stack.to_vec();
                }
            },
            &mut ids,
        )?;
        self.stacktraces.values = resolved;

        let symbols = self.source.symbols();
        for &id in &self.locations.pending {
            let loc = symbols
                .locations
                .get(id as usize)
                .cloned()
                .ok_or_else(|| SymdbError::fmt(format_args!("unknown location id: {id}")))?;
            self.mappings.lookup(loc.mapping_id);
            for line in &loc.lines {
                self.functions.lookup(line.function_id);
            }
            self.locations.values.push(loc);
        }
        for &id in &self.mappings.pending {
            let m = symbols
                .mappings
                .get(id as usize)
                .copied()
                .ok_or_else(|| SymdbError::fmt(format_args!("unknown mapping id: {id}")))?;
            self.strings.lookup(m.filename);
            self.strings.lookup(m.build_id);
            self.mappings.values.push(m);
        }
        for &id in &self.functions.pending {
            let f = symbols
                .functions
                .get(id as usize)
                .copied()
                .ok_or_else(|| SymdbError::fmt(format_args!("unknown function id: {id}")))?;
            self.strings.lookup(f.name);
            self.strings.lookup(f.system_name);
            self.strings.lookup(f.filename);
            self.functions.values.push(f);
        }
        for &id in &self.strings.pending {
            let s = symbols
                .strings
                .get(id as usize)
                .cloned()
                .ok_or_else(|| SymdbError::fmt(format_args!("unknown string id: {id}")))?;
            self.strings.values.push(s);
        }
        Ok(())
    }

    /// Writes the pending values to the destination, in dependency order.
    fn append(&mut self) -> Result<(), SymdbError> {
        let mut ids = Vec::new();
        if self.strings.has_pending() {
            self.dst.append_strings(&mut ids, &self.strings.values)?;
            self.strings.store(&ids);
        }

        if self.functions.has_pending() {
            for f in self.functions.values.iter_mut() {
                f.name = self.strings.resolved(f.name)?;
                f.system_name = self.strings.resolved(f.system_name)?;
                f.filename = self.strings.resolved(f.filename)?;
            }
            ids.clear();
            self.dst.append_functions(&mut ids, &self.functions.values)?;
            self.functions.store(&ids);
        }

        if self.mappings.has_pending() {
            for m in self.mappings.values.iter_mut() {
                m.filename = self.strings.resolved(m.filename)?;
                m.build_id = self.strings.resolved(m.build_id)?;
            }
            ids.clear();
            self.dst.append_mappings(&mut ids, &self.mappings.values)?;
            self.mappings.store(&ids);
        }

        if self.locations.has_pending() {
            for loc in self.locations.values.iter_mut() {
                loc.mapping_id = self.mappings.resolved(loc.mapping_id)?;
                for line in loc.lines.iter_mut() {
                    line.function_id = self.functions.resolved(line.function_id)?;
                }
            }
            ids.clear();
            self.dst.append_locations(&mut ids, &self.locations.values)?;
            self.locations.store(&ids);
        }

        for stack in self.stacktraces.values.iter_mut() {
            for loc in stack.iter_mut() {
                *loc = self.locations.resolved(*loc)?;
            }
        }
        let mut ids = vec![0u32; self.stacktraces.values.len()];
        self.dst
            .append_stacktraces(&mut ids, &self.stacktraces.values)?;
        self.stacktraces.store(&ids);
        Ok(())
    }
}

/// Rewrites stack trace ids of a source database into a [`Writer`],
/// copying the stack traces and their symbols on first use. Source
/// partitions are held until [`Rewriter::release`].
pub struct Rewriter {
    writer: Arc<Writer>,
    source: Arc<dyn SymbolsReader>,
    partitions: FxHashMap<u64, PartitionRewriter>,
}

impl Rewriter {
    pub fn new(writer: Arc<Writer>, source: Arc<dyn SymbolsReader>) -> Self {
        Self {
            writer,
            source,
            partitions: FxHashMap::default(),
        }
    }

    /// Rewrites `stacktraces`, ids of the source partition, in place to
    /// ids of the same partition of the writer.
    pub async fn rewrite(
        &mut self,
        partition: u64,
        stacktraces: &mut [u32],
    ) -> Result<(), SymdbError> {
        if !self.partitions.contains_key(&partition) {
            let source = self.source.partition(partition).await?;
            let stats = source.stats();
            tracing::debug!(
                partition,
                stacktraces = stats.stacktraces_total,
                locations = stats.locations_total,
                "Rewriting partition"
            );
            self.partitions.insert(
                partition,
                PartitionRewriter {
                    source,
                    dst: self.writer.partition_writer(partition),
                    stacktraces: LookupTable::with_capacity(stats.stacktraces_total),
                    locations: LookupTable::with_capacity(stats.locations_total),
                    mappings: LookupTable::with_capacity(stats.mappings_total),
                    functions: LookupTable::with_capacity(stats.functions_total),
                    strings: LookupTable::with_capacity(stats.strings_total),
                },
            );
        }
        match self.partitions.get_mut(&partition) {
            Some(p) => p.rewrite(stacktraces),
            None => Err(SymdbError::PartitionNotFound),
        }
    }

    /// Releases the source partitions.
    pub async fn release(&mut self) {
        for (_, p) in self.partitions.drain() {
            p.source.release().await;
        }
    }
}
