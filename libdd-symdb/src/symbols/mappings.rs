// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::block::{
    checked_len, decode_column, encode_column, read_header, reserve_header, write_header,
};
use super::{BlockCodec, Mapping};
use crate::codec::ByteReader;
use crate::format::SymbolsFormat;
use crate::FormatError;

const HAS_FUNCTIONS: u8 = 1 << 0;
const HAS_FILENAMES: u8 = 1 << 1;
const HAS_LINE_NUMBERS: u8 = 1 << 2;
const HAS_INLINE_FRAMES: u8 = 1 << 3;

/// Block layout: `{mappings_len, filename_size, build_id_size,
/// memory_start_size, memory_limit_size, file_offset_size, flags_size}`
/// header; string references are delta packed `i32` columns, addresses are
/// delta packed `i64` columns and the flags take one byte per mapping.
#[derive(Debug, Default)]
pub struct MappingsCodec {
    ints: Vec<i32>,
    longs: Vec<i64>,
    filename: Vec<i32>,
    build_id: Vec<i32>,
    memory_start: Vec<i64>,
    memory_limit: Vec<i64>,
    file_offset: Vec<i64>,
}

impl BlockCodec<Mapping> for MappingsCodec {
    const FORMAT: SymbolsFormat = SymbolsFormat::Mappings;
    const HEADER_SIZE: usize = 28;

    fn encode(&mut self, block: &[Mapping], dst: &mut Vec<u8>) {
        let at = reserve_header::<7>(dst);

        let mut ints = |field: fn(&Mapping) -> u32, dst: &mut Vec<u8>| {
            self.ints.clear();
            self.ints.extend(block.iter().map(|m| field(m) as i32));
            encode_column(&self.ints, dst)
        };
        let filename = ints(|m| m.filename, dst);
        let build_id = ints(|m| m.build_id, dst);

        let mut longs = |field: fn(&Mapping) -> u64, dst: &mut Vec<u8>| {
            self.longs.clear();
            self.longs.extend(block.iter().map(|m| field(m) as i64));
            encode_column(&self.longs, dst)
        };
        let memory_start = longs(|m| m.memory_start, dst);
        let memory_limit = longs(|m| m.memory_limit, dst);
        let file_offset = longs(|m| m.file_offset, dst);

        dst.extend(block.iter().map(|m| {
            let mut flags = 0;
            if m.has_functions {
                flags |= HAS_FUNCTIONS;
            }
            if m.has_filenames {
                flags |= HAS_FILENAMES;
            }
            if m.has_line_numbers {
                flags |= HAS_LINE_NUMBERS;
            }
            if m.has_inline_frames {
                flags |= HAS_INLINE_FRAMES;
            }
            flags
        }));

        write_header(
            &mut dst[at..],
            [
                block.len() as u32,
                filename,
                build_id,
                memory_start,
                memory_limit,
                file_offset,
                block.len() as u32,
            ],
        );
    }

    fn decode(
        &mut self,
        src: &[u8],
        header_size: usize,
        dst: &mut Vec<Mapping>,
    ) -> Result<usize, FormatError> {
        let mut r = ByteReader::new(src);
        let [len, filename, build_id, memory_start, memory_limit, file_offset, flags] =
            read_header::<7>(&mut r, header_size)?;
        let len = checked_len(len)?;
        if len == 0 || checked_len(flags)? != len {
            return Err(FormatError::InvalidSize);
        }
        decode_column(&mut r, checked_len(filename)?, len, &mut self.filename)?;
        decode_column(&mut r, checked_len(build_id)?, len, &mut self.build_id)?;
        decode_column(&mut r, checked_len(memory_start)?, len, &mut self.memory_start)?;
        decode_column(&mut r, checked_len(memory_limit)?, len, &mut self.memory_limit)?;
        decode_column(&mut r, checked_len(file_offset)?, len, &mut self.file_offset)?;
        let flags = r.take(len)?;

        dst.extend((0..len).map(|i| Mapping {
            memory_start: self.memory_start[i] as u64,
            memory_limit: self.memory_limit[i] as u64,
            file_offset: self.file_offset[i] as u64,
            filename: self.filename[i] as u32,
            build_id: self.build_id[i] as u32,
            has_functions: flags[i] & HAS_FUNCTIONS != 0,
            has_filenames: flags[i] & HAS_FILENAMES != 0,
            has_line_numbers: flags[i] & HAS_LINE_NUMBERS != 0,
            has_inline_frames: flags[i] & HAS_INLINE_FRAMES != 0,
        }));
        Ok(r.position())
    }
}
