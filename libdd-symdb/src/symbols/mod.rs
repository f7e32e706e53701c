// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Symbol tables and their block codecs.
//!
//! Tables are stored as sequences of blocks. Every block transposes its items
//! into columns, and each integer column is delta binary packed.

mod block;
mod functions;
mod locations;
mod mappings;
mod merger;
mod strings;

pub use block::*;
pub use functions::*;
pub use locations::*;
pub use mappings::*;
pub use merger::*;
pub use strings::*;

use crate::format::SymbolsFormat;
use crate::FormatError;
use std::hash::Hash;
use std::mem::size_of;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Function {
    /// String table index of the human-readable name.
    pub name: u32,
    pub system_name: u32,
    pub filename: u32,
    pub start_line: u32,
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Mapping {
    pub memory_start: u64,
    pub memory_limit: u64,
    pub file_offset: u64,
    /// String table index of the binary's file name.
    pub filename: u32,
    pub build_id: u32,
    pub has_functions: bool,
    pub has_filenames: bool,
    pub has_line_numbers: bool,
    pub has_inline_frames: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Line {
    pub function_id: u32,
    pub line: i32,
}

#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Location {
    pub address: u64,
    pub mapping_id: u32,
    /// Inlined frames come first: the last line is the caller.
    pub lines: Vec<Line>,
    pub is_folded: bool,
}

/// A symbol kind: something stored in a table and encoded in blocks.
pub trait Symbol: Clone + Default + Eq + Hash + Send + Sync + 'static {
    type Codec: BlockCodec<Self> + Default + Send;

    /// Approximate number of bytes the value takes in memory.
    fn size(&self) -> usize;
}

impl Symbol for String {
    type Codec = StringsCodec;

    fn size(&self) -> usize {
        size_of::<String>() + self.len()
    }
}

impl Symbol for Function {
    type Codec = FunctionsCodec;

    fn size(&self) -> usize {
        size_of::<Function>()
    }
}

impl Symbol for Mapping {
    type Codec = MappingsCodec;

    fn size(&self) -> usize {
        size_of::<Mapping>()
    }
}

impl Symbol for Location {
    type Codec = LocationsCodec;

    fn size(&self) -> usize {
        size_of::<Location>() + self.lines.len() * size_of::<Line>()
    }
}

/// The four symbol tables of a partition. Tables are shared: cloning the
/// struct does not copy them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Symbols {
    pub strings: Arc<Vec<String>>,
    pub functions: Arc<Vec<Function>>,
    pub mappings: Arc<Vec<Mapping>>,
    pub locations: Arc<Vec<Location>>,
}

impl Symbols {
    /// Returns the string at `id`, or the empty string for unknown ids.
    pub fn string(&self, id: u32) -> &str {
        self.strings.get(id as usize).map_or("", String::as_str)
    }

    /// Returns the name of the function at `id`.
    pub fn function_name(&self, id: u32) -> &str {
        self.functions
            .get(id as usize)
            .map_or("", |f| self.string(f.name))
    }

    /// Approximate number of bytes the tables take in memory.
    pub fn size(&self) -> usize {
        self.strings.iter().map(Symbol::size).sum::<usize>()
            + self.functions.len() * size_of::<Function>()
            + self.mappings.len() * size_of::<Mapping>()
            + self.locations.iter().map(Symbol::size).sum::<usize>()
    }

    /// Checks that every reference between the tables is in bounds. Id 0 is
    /// always accepted: it means "none".
    pub fn validate(&self) -> Result<(), FormatError> {
        let check = |id: u32, len: usize, what: &'static str| {
            if id == 0 || (id as usize) < len {
                Ok(())
            } else {
                Err(FormatError::Malformed(what))
            }
        };
        let strings = self.strings.len();
        for f in self.functions.iter() {
            check(f.name, strings, "function name out of range")?;
            check(f.system_name, strings, "function system name out of range")?;
            check(f.filename, strings, "function filename out of range")?;
        }
        for m in self.mappings.iter() {
            check(m.filename, strings, "mapping filename out of range")?;
            check(m.build_id, strings, "mapping build id out of range")?;
        }
        for loc in self.locations.iter() {
            check(loc.mapping_id, self.mappings.len(), "mapping id out of range")?;
            for line in &loc.lines {
                check(line.function_id, self.functions.len(), "function id out of range")?;
            }
        }
        Ok(())
    }
}

/// Returns the block format tag of a symbol kind.
pub fn format_of<T: Symbol>() -> SymbolsFormat {
    <T::Codec as BlockCodec<T>>::FORMAT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_lookup() {
        let symbols = Symbols {
            strings: Arc::new(vec!["".into(), "main".into()]),
            functions: Arc::new(vec![
                Function::default(),
                Function { name: 1, ..Default::default() },
            ]),
            mappings: Arc::new(vec![Mapping::default()]),
            locations: Arc::new(vec![Location::default()]),
        };
        assert_eq!(symbols.function_name(1), "main");
        assert_eq!(symbols.function_name(0), "");
        assert_eq!(symbols.function_name(9), "");
        assert_eq!(symbols.string(9), "");
        assert!(symbols.validate().is_ok());
        assert!(symbols.size() > 0);
    }

    #[test]
    fn validate_rejects_dangling_references() {
        let mut symbols = Symbols {
            strings: Arc::new(vec!["".into()]),
            functions: Arc::new(vec![Function::default()]),
            mappings: Arc::new(vec![Mapping::default()]),
            locations: Arc::new(vec![Location {
                lines: vec![Line { function_id: 3, line: 1 }],
                ..Default::default()
            }]),
        };
        assert_eq!(
            symbols.validate(),
            Err(FormatError::Malformed("function id out of range"))
        );
        Arc::make_mut(&mut symbols.locations)[0].lines.clear();
        Arc::make_mut(&mut symbols.functions).push(Function { name: 1, ..Default::default() });
        assert!(symbols.validate().is_err());
    }

    #[test]
    fn format_tags() {
        assert_eq!(format_of::<Location>(), SymbolsFormat::Locations);
        assert_eq!(format_of::<Function>(), SymbolsFormat::Functions);
        assert_eq!(format_of::<Mapping>(), SymbolsFormat::Mappings);
        assert_eq!(format_of::<String>(), SymbolsFormat::Strings);
    }
}
