// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::FxHashMap;
use crate::symbols::{Function, Location, Mapping};
use crate::SymdbError;

/// Maps the ids of a foreign id space, e.g. the ids of a pprof profile, to
/// the ids of a table.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IdMap {
    map: FxHashMap<u64, u32>,
}

impl IdMap {
    /// Builds the map of a foreign table whose ids are positions, such as a
    /// pprof string table: foreign id `i` maps to `ids[i]`.
    pub fn from_dense(ids: &[u32]) -> Self {
        let map = ids.iter().enumerate().map(|(i, &id)| (i as u64, id)).collect();
        Self { map }
    }

    pub fn insert(&mut self, foreign: u64, id: u32) {
        self.map.insert(foreign, id);
    }

    pub fn get(&self, foreign: u64) -> Option<u32> {
        self.map.get(&foreign).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Maps `foreign` to a table id. A foreign 0 that was never mapped is
    /// "none" and maps to 0.
    fn resolve(&self, foreign: u32, kind: &'static str) -> Result<u32, SymdbError> {
        match self.get(foreign as u64) {
            Some(id) => Ok(id),
            None if foreign == 0 => Ok(0),
            None => Err(SymdbError::fmt(format_args!("unknown {kind} id: {foreign}"))),
        }
    }
}

/// The id maps produced while ingesting a profile. Tables must be ingested
/// in dependency order: strings, mappings, functions, then locations, as
/// each kind refers to ids of the kinds before it.
#[derive(Clone, Debug, Default)]
pub struct Rewrites {
    pub strings: IdMap,
    pub mappings: IdMap,
    pub functions: IdMap,
    pub locations: IdMap,
}

/// Rewrites the foreign references a value holds to table ids.
pub trait Rewrite {
    fn rewrite(&mut self, rewrites: &Rewrites) -> Result<(), SymdbError>;
}

impl Rewrite for String {
    fn rewrite(&mut self, _: &Rewrites) -> Result<(), SymdbError> {
        Ok(())
    }
}

impl Rewrite for Function {
    fn rewrite(&mut self, rewrites: &Rewrites) -> Result<(), SymdbError> {
        let strings = &rewrites.strings;
        self.name = strings.resolve(self.name, "string")?;
        self.system_name = strings.resolve(self.system_name, "string")?;
        self.filename = strings.resolve(self.filename, "string")?;
        Ok(())
    }
}

impl Rewrite for Mapping {
    fn rewrite(&mut self, rewrites: &Rewrites) -> Result<(), SymdbError> {
        self.filename = rewrites.strings.resolve(self.filename, "string")?;
        self.build_id = rewrites.strings.resolve(self.build_id, "string")?;
        Ok(())
    }
}

impl Rewrite for Location {
    fn rewrite(&mut self, rewrites: &Rewrites) -> Result<(), SymdbError> {
        self.mapping_id = rewrites.mappings.resolve(self.mapping_id, "mapping")?;
        for line in self.lines.iter_mut() {
            line.function_id = rewrites.functions.resolve(line.function_id, "function")?;
        }
        Ok(())
    }
}
