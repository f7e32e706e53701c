// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! An already parsed pprof profile. Field names follow `profile.proto`:
//! string fields are indexes into `string_table`, whose first entry is
//! always the empty string, and ids are non-zero.

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Profile {
    pub sample_type: Vec<ValueType>,
    pub sample: Vec<Sample>,
    pub mapping: Vec<Mapping>,
    pub location: Vec<Location>,
    pub function: Vec<Function>,
    pub string_table: Vec<String>,
    pub drop_frames: i64,
    pub keep_frames: i64,
    pub time_nanos: i64,
    pub duration_nanos: i64,
    pub period_type: Option<ValueType>,
    pub period: i64,
    pub comment: Vec<i64>,
    pub default_sample_type: i64,
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct ValueType {
    pub r#type: i64,
    pub unit: i64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Sample {
    /// Leaf-first location ids.
    pub location_id: Vec<u64>,
    pub value: Vec<i64>,
    pub label: Vec<Label>,
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Label {
    pub key: i64,
    pub str: i64,
    pub num: i64,
    pub num_unit: i64,
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Mapping {
    pub id: u64,
    pub memory_start: u64,
    pub memory_limit: u64,
    pub file_offset: u64,
    pub filename: i64,
    pub build_id: i64,
    pub has_functions: bool,
    pub has_filenames: bool,
    pub has_line_numbers: bool,
    pub has_inline_frames: bool,
}

#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Location {
    pub id: u64,
    pub mapping_id: u64,
    pub address: u64,
    pub line: Vec<Line>,
    pub is_folded: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Line {
    pub function_id: u64,
    pub line: i64,
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Function {
    pub id: u64,
    pub name: i64,
    pub system_name: i64,
    pub filename: i64,
    pub start_line: i64,
}

impl Profile {
    /// Returns the string at `index`, or the empty string if the index is
    /// out of range.
    pub fn string(&self, index: i64) -> &str {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.string_table.get(i))
            .map_or("", String::as_str)
    }

    /// Returns the leaf-first function names of a sample, one per line.
    /// Unknown ids are skipped.
    pub fn sample_function_names(&self, sample: &Sample) -> Vec<&str> {
        let mut names = Vec::new();
        for id in &sample.location_id {
            let Some(loc) = self.location.iter().find(|l| l.id == *id) else {
                continue;
            };
            for line in &loc.line {
                if let Some(f) = self.function.iter().find(|f| f.id == line.function_id) {
                    names.push(self.string(f.name));
                }
            }
        }
        names
    }
}
