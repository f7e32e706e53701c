// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Merges the symbols of several resolved results, possibly coming from
//! different partitions or blocks, into one set of tables. Symbols are
//! identified by value: two functions with the same name, file and start
//! line are one function, whatever their ids in the sources.

use super::{Function, Line, Location, Mapping, Symbols};
use crate::collections::{FxHashMap, FxIndexSet};
use crate::SymdbError;
use parking_lot::Mutex;
use std::sync::Arc;

/// A location reference of a merged result. Negative references are
/// sentinels, such as truncated frames, and are never remapped.
pub type LocationRef = i64;

/// Read access to symbol tables by id.
trait SymbolTables {
    fn string(&self, id: u32) -> Option<&str>;
    fn mapping(&self, id: u32) -> Option<&Mapping>;
    fn function(&self, id: u32) -> Option<&Function>;
}

impl SymbolTables for Symbols {
    fn string(&self, id: u32) -> Option<&str> {
        self.strings.get(id as usize).map(String::as_str)
    }

    fn mapping(&self, id: u32) -> Option<&Mapping> {
        self.mappings.get(id as usize)
    }

    fn function(&self, id: u32) -> Option<&Function> {
        self.functions.get(id as usize)
    }
}

/// Source id to merged id, per kind, for one import.
#[derive(Default)]
struct IdCache {
    strings: FxHashMap<u32, u32>,
    mappings: FxHashMap<u32, u32>,
    functions: FxHashMap<u32, u32>,
}

/// Append-only tables deduplicated by value. Id 0 of every table holds
/// the default value, and id 0 of a source always maps to it.
struct MergedTables {
    strings: FxIndexSet<String>,
    mappings: FxIndexSet<Mapping>,
    functions: FxIndexSet<Function>,
    locations: FxIndexSet<Location>,
}

impl Default for MergedTables {
    fn default() -> Self {
        let mut tables = Self {
            strings: FxIndexSet::default(),
            mappings: FxIndexSet::default(),
            functions: FxIndexSet::default(),
            locations: FxIndexSet::default(),
        };
        tables.strings.insert(String::new());
        tables.mappings.insert(Mapping::default());
        tables.functions.insert(Function::default());
        tables.locations.insert(Location::default());
        tables
    }
}

impl SymbolTables for MergedTables {
    fn string(&self, id: u32) -> Option<&str> {
        self.strings.get_index(id as usize).map(String::as_str)
    }

    fn mapping(&self, id: u32) -> Option<&Mapping> {
        self.mappings.get_index(id as usize)
    }

    fn function(&self, id: u32) -> Option<&Function> {
        self.functions.get_index(id as usize)
    }
}

impl MergedTables {
    fn import_string(&mut self, src: &impl SymbolTables, id: u32, cache: &mut IdCache) -> u32 {
        if id == 0 {
            return 0;
        }
        if let Some(&merged) = cache.strings.get(&id) {
            return merged;
        }
        let merged = match src.string(id) {
            Some(s) => match self.strings.get_index_of(s) {
                Some(i) => i as u32,
                None => self.strings.insert_full(s.to_string()).0 as u32,
            },
            None => 0,
        };
        cache.strings.insert(id, merged);
        merged
    }

    fn import_mapping(&mut self, src: &impl SymbolTables, id: u32, cache: &mut IdCache) -> u32 {
        if id == 0 {
            return 0;
        }
        if let Some(&merged) = cache.mappings.get(&id) {
            return merged;
        }
        let merged = match src.mapping(id).copied() {
            Some(m) => {
                let m = Mapping {
                    filename: self.import_string(src, m.filename, cache),
                    build_id: self.import_string(src, m.build_id, cache),
                    ..m
                };
                self.mappings.insert_full(m).0 as u32
            }
            None => 0,
        };
        cache.mappings.insert(id, merged);
        merged
    }

    fn import_function(&mut self, src: &impl SymbolTables, id: u32, cache: &mut IdCache) -> u32 {
        if id == 0 {
            return 0;
        }
        if let Some(&merged) = cache.functions.get(&id) {
            return merged;
        }
        let merged = match src.function(id).copied() {
            Some(f) => {
                let f = Function {
                    name: self.import_string(src, f.name, cache),
                    system_name: self.import_string(src, f.system_name, cache),
                    filename: self.import_string(src, f.filename, cache),
                    start_line: f.start_line,
                };
                self.functions.insert_full(f).0 as u32
            }
            None => 0,
        };
        cache.functions.insert(id, merged);
        merged
    }

    /// Returns `loc` with its references rewritten to ids of these tables,
    /// importing what it references.
    fn import_location(
        &mut self,
        src: &impl SymbolTables,
        loc: &Location,
        cache: &mut IdCache,
    ) -> Location {
        let mapping_id = self.import_mapping(src, loc.mapping_id, cache);
        let lines = loc
            .lines
            .iter()
            .map(|line| Line {
                function_id: self.import_function(src, line.function_id, cache),
                line: line.line,
            })
            .collect();
        Location {
            address: loc.address,
            mapping_id,
            lines,
            is_folded: loc.is_folded,
        }
    }
}

/// Rewrites the location references of one added symbol set to references
/// of the merger.
#[derive(Debug, Default)]
pub struct LocationRemap {
    locations: FxHashMap<u32, u32>,
}

impl LocationRemap {
    /// Sentinels are returned as is; references that were not added map to
    /// location 0.
    pub fn remap(&self, location: LocationRef) -> LocationRef {
        if location < 0 {
            return location;
        }
        u32::try_from(location)
            .ok()
            .and_then(|id| self.locations.get(&id))
            .map_or(0, |&id| LocationRef::from(id))
    }
}

/// Merges the symbols referenced by several results. Results may be added
/// concurrently.
#[derive(Default)]
pub struct SymbolMerger {
    tables: Mutex<MergedTables>,
}

impl SymbolMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the given locations of `symbols`, and only the symbols they
    /// reference. Fails without adding anything if a location id is out of
    /// range.
    pub fn add_symbols(
        &self,
        symbols: &Symbols,
        locations: &[u32],
    ) -> Result<LocationRemap, SymdbError> {
        if let Some(id) = locations
            .iter()
            .find(|&&id| id as usize >= symbols.locations.len() && id != 0)
        {
            return Err(SymdbError::fmt(format_args!("unknown location id: {id}")));
        }
        Ok(self.import(symbols, locations.iter().copied()))
    }

    /// Adds every location of a symbol set, such as the symbols of a result
    /// that was already reduced to the locations it references.
    pub fn add(&self, symbols: &Symbols) -> LocationRemap {
        self.import(symbols, 1..symbols.locations.len() as u32)
    }

    fn import(&self, symbols: &Symbols, locations: impl Iterator<Item = u32>) -> LocationRemap {
        let mut tables = self.tables.lock();
        let mut cache = IdCache::default();
        let mut remap = FxHashMap::default();
        remap.insert(0, 0);
        for id in locations {
            if remap.contains_key(&id) {
                continue;
            }
            let Some(loc) = symbols.locations.get(id as usize) else {
                continue;
            };
            let loc = tables.import_location(symbols, loc, &mut cache);
            let (merged, _) = tables.locations.insert_full(loc);
            remap.insert(id, merged as u32);
        }
        LocationRemap { locations: remap }
    }

    /// Number of distinct locations merged so far, location 0 included.
    pub fn locations_len(&self) -> usize {
        self.tables.lock().locations.len()
    }

    /// Starts a result holding only the locations kept with
    /// [`ResultBuilder::keep_symbol`].
    pub fn result_builder(&self) -> ResultBuilder<'_> {
        let mut lookup = FxHashMap::default();
        lookup.insert(0, 0);
        ResultBuilder {
            merger: self,
            lookup,
            locations: vec![0],
        }
    }
}

/// Collects the merged locations a result references and renumbers them
/// in the order they are kept.
pub struct ResultBuilder<'a> {
    merger: &'a SymbolMerger,
    /// Merged location id to result location id.
    lookup: FxHashMap<u32, u32>,
    /// Merged location ids, by result location id.
    locations: Vec<u32>,
}

impl ResultBuilder<'_> {
    /// Keeps a merged location and returns its reference in the result.
    pub fn keep_symbol(&mut self, location: LocationRef) -> LocationRef {
        let Ok(id) = u32::try_from(location) else {
            return location;
        };
        let next = self.locations.len() as u32;
        let kept = *self.lookup.entry(id).or_insert_with(|| {
            self.locations.push(id);
            next
        });
        LocationRef::from(kept)
    }

    /// Builds the tables of the result: location `i` is the `i`-th kept
    /// location, and only the symbols kept locations reference are
    /// included.
    pub fn build(&self) -> Symbols {
        let merged = self.merger.tables.lock();
        let mut result = MergedTables::default();
        let mut cache = IdCache::default();
        let mut locations = Vec::with_capacity(self.locations.len());
        locations.push(Location::default());
        for &id in self.locations.iter().skip(1) {
            let loc = match merged.locations.get_index(id as usize) {
                Some(loc) => result.import_location(&*merged, loc, &mut cache),
                None => Location::default(),
            };
            locations.push(loc);
        }
        Symbols {
            strings: Arc::new(result.strings.into_iter().collect()),
            functions: Arc::new(result.functions.into_iter().collect()),
            mappings: Arc::new(result.mappings.into_iter().collect()),
            locations: Arc::new(locations),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One location per function name, all in mapping 1 (`app`).
    fn symbols(names: &[&str]) -> Symbols {
        let mut strings = vec![String::new(), "app".to_string(), "main.go".to_string()];
        let mut functions = vec![Function::default()];
        let mut locations = vec![Location::default()];
        for name in names {
            strings.push(name.to_string());
            functions.push(Function {
                name: strings.len() as u32 - 1,
                filename: 2,
                ..Default::default()
            });
            locations.push(Location {
                address: 0x10 * locations.len() as u64,
                mapping_id: 1,
                lines: vec![Line {
                    function_id: functions.len() as u32 - 1,
                    line: 3,
                }],
                is_folded: false,
            });
        }
        Symbols {
            strings: Arc::new(strings),
            functions: Arc::new(functions),
            mappings: Arc::new(vec![
                Mapping::default(),
                Mapping {
                    filename: 1,
                    memory_limit: 0x1000,
                    ..Default::default()
                },
            ]),
            locations: Arc::new(locations),
        }
    }

    fn function_names(symbols: &Symbols) -> Vec<&str> {
        symbols
            .locations
            .iter()
            .skip(1)
            .map(|loc| symbols.function_name(loc.lines[0].function_id))
            .collect()
    }

    #[test]
    fn identical_symbols_are_merged() {
        let merger = SymbolMerger::new();
        let a = merger.add_symbols(&symbols(&["foo", "bar"]), &[1, 2]).unwrap();
        // Same values as `a`'s locations, but at other ids.
        let b = merger.add(&symbols(&["foo", "bar", "baz"]));
        assert_eq!(a.remap(1), b.remap(1));
        assert_eq!(a.remap(2), b.remap(2));
        assert_ne!(b.remap(3), b.remap(2));
        assert_eq!(merger.locations_len(), 4);

        assert_eq!(a.remap(-1), -1);
        assert_eq!(a.remap(0), 0);
        assert_eq!(a.remap(3), 0);

        let merged = merger.tables.lock();
        assert_eq!(merged.mappings.len(), 2);
        assert_eq!(merged.functions.len(), 4);
        // "", app, main.go, foo, bar, baz
        assert_eq!(merged.strings.len(), 6);
    }

    #[test]
    fn different_addresses_are_different_locations() {
        let merger = SymbolMerger::new();
        let a = merger.add(&symbols(&["foo"]));
        let mut moved = symbols(&["foo"]);
        Arc::make_mut(&mut moved.locations)[1].address = 0x42;
        let b = merger.add(&moved);
        assert_ne!(a.remap(1), b.remap(1));
        assert_eq!(merger.tables.lock().functions.len(), 2);
    }

    #[test]
    fn unknown_location_is_rejected() {
        let merger = SymbolMerger::new();
        let err = merger
            .add_symbols(&symbols(&["foo"]), &[1, 7])
            .unwrap_err();
        assert_eq!(err.to_string(), "unknown location id: 7");
        assert_eq!(merger.locations_len(), 1);
    }

    #[test]
    fn result_keeps_referenced_symbols_only() {
        let merger = SymbolMerger::new();
        let a = merger.add(&symbols(&["foo", "bar"]));
        let b = merger.add(&symbols(&["baz", "qux"]));

        let mut builder = merger.result_builder();
        let qux = builder.keep_symbol(b.remap(2));
        let foo = builder.keep_symbol(a.remap(1));
        assert_eq!((qux, foo), (1, 2));
        assert_eq!(builder.keep_symbol(a.remap(1)), foo);
        assert_eq!(builder.keep_symbol(-1), -1);

        let result = builder.build();
        assert_eq!(function_names(&result), vec!["qux", "foo"]);
        assert_eq!(result.locations[0], Location::default());
        assert!(result.validate().is_ok());
        let mut strings = result.strings.to_vec();
        strings.sort();
        assert_eq!(strings, vec!["", "app", "foo", "main.go", "qux"]);
        assert_eq!(result.mappings.len(), 2);
        assert_eq!(result.string(result.mappings[1].filename), "app");
        for f in &result.functions[1..] {
            assert_eq!(result.string(f.filename), "main.go");
        }
    }

    #[test]
    fn concurrent_adds() {
        let merger = SymbolMerger::new();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| merger.add(&symbols(&["foo", "bar", "baz"])));
            }
        });
        assert_eq!(merger.locations_len(), 4);
    }
}
