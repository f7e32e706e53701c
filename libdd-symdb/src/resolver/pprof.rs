// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::call_tree::CallTree;
use super::tree::TRUNCATED_NODE_NAME;
use crate::collections::{FxHashMap, FxIndexMap, FxIndexSet};
use crate::pprof;
use crate::symbols::{Function, Mapping, Symbols};

/// A location of the profile being built. Ids are indexes into the
/// builder's tables.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct LocationKey {
    /// `None` for the synthetic location of truncated frames.
    mapping: Option<u32>,
    address: u64,
    /// `(function, line)`, leaf-most first.
    lines: Vec<(u32, i32)>,
    is_folded: bool,
}

/// Builds one pprof profile out of the resolved samples of any number of
/// partitions. Symbols are deduplicated by value across partitions and
/// only the ones referenced by samples are written.
pub(crate) struct ProfileBuilder {
    strings: FxIndexSet<String>,
    mappings: FxIndexSet<Mapping>,
    functions: FxIndexSet<Function>,
    locations: FxIndexSet<LocationKey>,
    /// Leaf-first location indexes to value.
    samples: FxIndexMap<Vec<u32>, i64>,
}

impl Default for ProfileBuilder {
    fn default() -> Self {
        let mut strings = FxIndexSet::default();
        strings.insert(String::new());
        Self {
            strings,
            mappings: FxIndexSet::default(),
            functions: FxIndexSet::default(),
            locations: FxIndexSet::default(),
            samples: FxIndexMap::default(),
        }
    }
}

impl ProfileBuilder {
    /// Adds the samples of a partition. Stack traces are leaf-first
    /// location ids of `symbols`; ids past the end of the tables are
    /// skipped.
    ///
    /// Symbols are added in the order of their ids in the partition, so
    /// that the output keeps the order of the input tables.
    pub(crate) fn add_partition(&mut self, symbols: &Symbols, samples: &[(Vec<u32>, i64)]) {
        let mut locations: Vec<u32> = samples
            .iter()
            .flat_map(|(stack, _)| stack.iter().copied())
            .filter(|&id| (id as usize) < symbols.locations.len())
            .collect();
        locations.sort_unstable();
        locations.dedup();

        let mut mappings = Vec::new();
        let mut functions = Vec::new();
        for &id in &locations {
            let loc = &symbols.locations[id as usize];
            if (loc.mapping_id as usize) < symbols.mappings.len() {
                mappings.push(loc.mapping_id);
            }
            functions.extend(
                loc.lines
                    .iter()
                    .map(|l| l.function_id)
                    .filter(|&f| (f as usize) < symbols.functions.len()),
            );
        }
        mappings.sort_unstable();
        mappings.dedup();
        functions.sort_unstable();
        functions.dedup();

        let mut strings = Vec::new();
        for &id in &mappings {
            let m = &symbols.mappings[id as usize];
            strings.extend([m.filename, m.build_id]);
        }
        for &id in &functions {
            let f = &symbols.functions[id as usize];
            strings.extend([f.name, f.system_name, f.filename]);
        }
        strings.sort_unstable();
        strings.dedup();

        let string_ids: FxHashMap<u32, u32> = strings
            .iter()
            .map(|&id| {
                let s = symbols.string(id);
                let (i, _) = self.strings.insert_full(s.to_string());
                (id, i as u32)
            })
            .collect();
        let string = |id: u32| string_ids.get(&id).copied().unwrap_or(0);

        let mapping_ids: FxHashMap<u32, u32> = mappings
            .iter()
            .map(|&id| {
                let m = symbols.mappings[id as usize];
                let (i, _) = self.mappings.insert_full(Mapping {
                    filename: string(m.filename),
                    build_id: string(m.build_id),
                    ..m
                });
                (id, i as u32)
            })
            .collect();

        let function_ids: FxHashMap<u32, u32> = functions
            .iter()
            .map(|&id| {
                let f = symbols.functions[id as usize];
                let (i, _) = self.functions.insert_full(Function {
                    name: string(f.name),
                    system_name: string(f.system_name),
                    filename: string(f.filename),
                    start_line: f.start_line,
                });
                (id, i as u32)
            })
            .collect();

        let location_ids: FxHashMap<u32, u32> = locations
            .iter()
            .map(|&id| {
                let loc = &symbols.locations[id as usize];
                let key = LocationKey {
                    mapping: mapping_ids.get(&loc.mapping_id).copied(),
                    address: loc.address,
                    lines: loc
                        .lines
                        .iter()
                        .filter_map(|l| Some((*function_ids.get(&l.function_id)?, l.line)))
                        .collect(),
                    is_folded: loc.is_folded,
                };
                let (i, _) = self.locations.insert_full(key);
                (id, i as u32)
            })
            .collect();

        for (stack, value) in samples {
            let stack: Vec<u32> = stack
                .iter()
                .filter_map(|id| location_ids.get(id).copied())
                .collect();
            *self.samples.entry(stack).or_default() += value;
        }
    }

    /// Replaces the frames of every sample that fall out of the
    /// `max_nodes` largest function nodes with a single `other` frame.
    /// Samples left with identical stacks are merged.
    fn truncate(&mut self, max_nodes: u64) {
        let mut tree = CallTree::default();
        // For every sample, the node of each location, root-first.
        let mut paths = Vec::with_capacity(self.samples.len());
        for (stack, &value) in &self.samples {
            let mut node = CallTree::ROOT;
            tree.add(node, value);
            let mut path = Vec::with_capacity(stack.len());
            for &loc in stack.iter().rev() {
                if let Some(key) = self.locations.get_index(loc as usize) {
                    for &(function, _) in key.lines.iter().rev() {
                        node = tree.child(node, function);
                        tree.add(node, value);
                    }
                }
                path.push(node);
            }
            paths.push(path);
        }
        let min = tree.min_value(max_nodes);
        if min == 0 {
            return;
        }

        let name = self.strings.insert_full(TRUNCATED_NODE_NAME.to_string()).0 as u32;
        let (function, _) = self.functions.insert_full(Function {
            name,
            ..Default::default()
        });
        let (stub, _) = self.locations.insert_full(LocationKey {
            mapping: None,
            address: 0,
            lines: vec![(function as u32, 0)],
            is_folded: false,
        });

        let samples = std::mem::take(&mut self.samples);
        let mut truncated_samples = 0;
        for ((stack, value), path) in samples.into_iter().zip(paths) {
            let kept = path
                .iter()
                .take_while(|&&node| tree.total(node) >= min)
                .count();
            if kept == stack.len() {
                *self.samples.entry(stack).or_default() += value;
                continue;
            }
            truncated_samples += 1;
            // `stack` is leaf-first: keep its root-most `kept` frames.
            let mut truncated = Vec::with_capacity(kept + 1);
            truncated.push(stub as u32);
            truncated.extend_from_slice(&stack[stack.len() - kept..]);
            *self.samples.entry(truncated).or_default() += value;
        }
        tracing::debug!(
            max_nodes,
            min_value = min,
            nodes = tree.len(),
            truncated_samples,
            "Truncated profile"
        );
    }

    /// Builds the profile: one sample type, ids numbered from 1 in table
    /// order, and only the symbols that samples reference.
    pub(crate) fn build(mut self, max_nodes: u64) -> pprof::Profile {
        if max_nodes > 0 {
            self.truncate(max_nodes);
        }

        // Table index to output id; 0 when unreferenced.
        let mut location_ids = vec![0u64; self.locations.len()];
        let mut function_ids = vec![0u64; self.functions.len()];
        let mut mapping_ids = vec![0u64; self.mappings.len()];
        let mut string_ids = vec![0i64; self.strings.len()];
        for stack in self.samples.keys() {
            for &loc in stack {
                location_ids[loc as usize] = 1;
            }
        }
        for (loc, key) in self.locations.iter().enumerate() {
            if location_ids[loc] == 0 {
                continue;
            }
            if let Some(m) = key.mapping {
                mapping_ids[m as usize] = 1;
            }
            for &(f, _) in &key.lines {
                function_ids[f as usize] = 1;
            }
        }
        for (m, mapping) in self.mappings.iter().enumerate() {
            if mapping_ids[m] != 0 {
                string_ids[mapping.filename as usize] = 1;
                string_ids[mapping.build_id as usize] = 1;
            }
        }
        for (f, function) in self.functions.iter().enumerate() {
            if function_ids[f] != 0 {
                string_ids[function.name as usize] = 1;
                string_ids[function.system_name as usize] = 1;
                string_ids[function.filename as usize] = 1;
            }
        }

        let mut profile = pprof::Profile {
            sample_type: vec![pprof::ValueType::default()],
            period_type: Some(pprof::ValueType::default()),
            ..Default::default()
        };
        string_ids[0] = 1;
        for (i, s) in self.strings.into_iter().enumerate() {
            if string_ids[i] != 0 {
                string_ids[i] = profile.string_table.len() as i64;
                profile.string_table.push(s);
            }
        }
        for (i, m) in self.mappings.iter().enumerate() {
            if mapping_ids[i] != 0 {
                mapping_ids[i] = profile.mapping.len() as u64 + 1;
                profile.mapping.push(pprof::Mapping {
                    id: mapping_ids[i],
                    memory_start: m.memory_start,
                    memory_limit: m.memory_limit,
                    file_offset: m.file_offset,
                    filename: string_ids[m.filename as usize],
                    build_id: string_ids[m.build_id as usize],
                    has_functions: m.has_functions,
                    has_filenames: m.has_filenames,
                    has_line_numbers: m.has_line_numbers,
                    has_inline_frames: m.has_inline_frames,
                });
            }
        }
        for (i, f) in self.functions.iter().enumerate() {
            if function_ids[i] != 0 {
                function_ids[i] = profile.function.len() as u64 + 1;
                profile.function.push(pprof::Function {
                    id: function_ids[i],
                    name: string_ids[f.name as usize],
                    system_name: string_ids[f.system_name as usize],
                    filename: string_ids[f.filename as usize],
                    start_line: i64::from(f.start_line),
                });
            }
        }
        for (i, loc) in self.locations.iter().enumerate() {
            if location_ids[i] != 0 {
                location_ids[i] = profile.location.len() as u64 + 1;
                profile.location.push(pprof::Location {
                    id: location_ids[i],
                    mapping_id: loc.mapping.map_or(0, |m| mapping_ids[m as usize]),
                    address: loc.address,
                    line: loc
                        .lines
                        .iter()
                        .map(|&(f, line)| pprof::Line {
                            function_id: function_ids[f as usize],
                            line: i64::from(line),
                        })
                        .collect(),
                    is_folded: loc.is_folded,
                });
            }
        }
        profile.sample = self
            .samples
            .into_iter()
            .filter(|(_, value)| *value != 0)
            .map(|(stack, value)| pprof::Sample {
                location_id: stack.iter().map(|&l| location_ids[l as usize]).collect(),
                value: vec![value],
                label: vec![],
            })
            .collect();
        profile
    }
}
