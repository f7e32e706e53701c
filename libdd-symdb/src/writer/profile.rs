// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::PartitionWriter;
use crate::collections::{IdMap, Rewrites};
use crate::pprof;
use crate::samples::Samples;
use crate::symbols::{Function, Line, Location, Mapping};
use crate::SymdbError;

fn string_ref(index: i64) -> Result<u32, SymdbError> {
    u32::try_from(index)
        .map_err(|_| SymdbError::fmt(format_args!("invalid string table index: {index}")))
}

fn id_ref(id: u64, kind: &str) -> Result<u32, SymdbError> {
    u32::try_from(id).map_err(|_| SymdbError::fmt(format_args!("{kind} id out of range: {id}")))
}

impl PartitionWriter {
    /// Ingests the symbols and stack traces of a parsed profile. Returns the
    /// compacted samples of every sample type, in the order of
    /// `profile.sample_type`.
    ///
    /// Symbols are ingested in dependency order: strings, mappings,
    /// functions, locations and finally the stack traces. Every reference to
    /// an id the profile does not define is an error.
    pub fn write_profile_symbols(
        &self,
        profile: &pprof::Profile,
    ) -> Result<Vec<Samples>, SymdbError> {
        let mut rewrites = Rewrites::default();

        let ids = self
            .strings
            .ingest(profile.string_table.clone(), &rewrites)?;
        rewrites.strings = IdMap::from_dense(&ids);

        let mappings = profile
            .mapping
            .iter()
            .map(|m| {
                Ok(Mapping {
                    memory_start: m.memory_start,
                    memory_limit: m.memory_limit,
                    file_offset: m.file_offset,
                    filename: string_ref(m.filename)?,
                    build_id: string_ref(m.build_id)?,
                    has_functions: m.has_functions,
                    has_filenames: m.has_filenames,
                    has_line_numbers: m.has_line_numbers,
                    has_inline_frames: m.has_inline_frames,
                })
            })
            .collect::<Result<Vec<_>, SymdbError>>()?;
        let ids = self.mappings.ingest(mappings, &rewrites)?;
        for (m, id) in profile.mapping.iter().zip(ids) {
            rewrites.mappings.insert(m.id, id);
        }

        let functions = profile
            .function
            .iter()
            .map(|f| {
                Ok(Function {
                    name: string_ref(f.name)?,
                    system_name: string_ref(f.system_name)?,
                    filename: string_ref(f.filename)?,
                    start_line: u32::try_from(f.start_line).unwrap_or(0),
                })
            })
            .collect::<Result<Vec<_>, SymdbError>>()?;
        let ids = self.functions.ingest(functions, &rewrites)?;
        for (f, id) in profile.function.iter().zip(ids) {
            rewrites.functions.insert(f.id, id);
        }

        let locations = profile
            .location
            .iter()
            .map(|loc| {
                let lines = loc
                    .line
                    .iter()
                    .map(|line| {
                        Ok(Line {
                            function_id: id_ref(line.function_id, "function")?,
                            line: i32::try_from(line.line).unwrap_or(i32::MAX),
                        })
                    })
                    .collect::<Result<Vec<_>, SymdbError>>()?;
                Ok(Location {
                    address: loc.address,
                    mapping_id: id_ref(loc.mapping_id, "mapping")?,
                    lines,
                    is_folded: loc.is_folded,
                })
            })
            .collect::<Result<Vec<_>, SymdbError>>()?;
        let ids = self.locations.ingest(locations, &rewrites)?;
        for (loc, id) in profile.location.iter().zip(ids) {
            rewrites.locations.insert(loc.id, id);
        }

        let stacktraces = profile
            .sample
            .iter()
            .map(|s| {
                s.location_id
                    .iter()
                    .map(|&id| {
                        rewrites.locations.get(id).ok_or_else(|| {
                            SymdbError::fmt(format_args!("unknown location id: {id}"))
                        })
                    })
                    .collect::<Result<Vec<u32>, SymdbError>>()
            })
            .collect::<Result<Vec<_>, SymdbError>>()?;
        let mut sids = vec![0u32; stacktraces.len()];
        self.append_stacktraces(&mut sids, &stacktraces)?;

        let types = profile.sample_type.len().max(1);
        let mut result = Vec::with_capacity(types);
        for t in 0..types {
            let mut samples = Samples::with_capacity(sids.len());
            for (sample, &sid) in profile.sample.iter().zip(&sids) {
                samples.push(sid, sample.value.get(t).copied().unwrap_or(0));
            }
            samples.compact();
            result.push(samples);
        }
        Ok(result)
    }
}
