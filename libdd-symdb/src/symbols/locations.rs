// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::block::{
    checked_len, decode_column, encode_column, read_header, reserve_header, write_header,
};
use super::{BlockCodec, Line, Location};
use crate::codec::ByteReader;
use crate::format::SymbolsFormat;
use crate::FormatError;

/// Lines beyond this count are dropped when a location is encoded.
pub const MAX_LOCATION_LINES: usize = u8::MAX as usize;

/// Block layout: `{locations_len, mapping_size, lines_len, lines_size,
/// addr_size, is_folded_size}` header (`u32` LE each), then
///
/// - mapping ids, delta packed;
/// - one byte per location with its number of lines;
/// - `(function_id, line)` pairs of all the locations, delta packed;
/// - addresses, delta packed, only if any is non-zero;
/// - the folded bitmap, only if any location is folded: location `i` is
///   bit `i & 7` of byte `i >> 3`.
#[derive(Debug, Default)]
pub struct LocationsCodec {
    mappings: Vec<i32>,
    line_counts: Vec<u8>,
    lines: Vec<i32>,
    addresses: Vec<i64>,
}

impl BlockCodec<Location> for LocationsCodec {
    const FORMAT: SymbolsFormat = SymbolsFormat::Locations;
    const HEADER_SIZE: usize = 24;

    fn encode(&mut self, block: &[Location], dst: &mut Vec<u8>) {
        self.mappings.clear();
        self.line_counts.clear();
        self.lines.clear();
        self.addresses.clear();
        let mut has_address = false;
        let mut has_folded = false;
        for loc in block {
            self.mappings.push(loc.mapping_id as i32);
            let n = loc.lines.len().min(MAX_LOCATION_LINES);
            if n < loc.lines.len() {
                tracing::warn!(lines = loc.lines.len(), "location lines truncated");
            }
            self.line_counts.push(n as u8);
            for line in &loc.lines[..n] {
                self.lines.push(line.function_id as i32);
                self.lines.push(line.line);
            }
            self.addresses.push(loc.address as i64);
            has_address |= loc.address != 0;
            has_folded |= loc.is_folded;
        }

        let at = reserve_header::<6>(dst);
        let mapping_size = encode_column(&self.mappings, dst);
        dst.extend_from_slice(&self.line_counts);
        let lines_size = encode_column(&self.lines, dst);
        let addr_size = if has_address {
            encode_column(&self.addresses, dst)
        } else {
            0
        };
        let is_folded_size = if has_folded {
            let start = dst.len();
            dst.resize(start + block.len().div_ceil(8), 0);
            for (i, loc) in block.iter().enumerate() {
                if loc.is_folded {
                    dst[start + (i >> 3)] |= 1 << (i & 7);
                }
            }
            (dst.len() - start) as u32
        } else {
            0
        };
        write_header(
            &mut dst[at..],
            [
                block.len() as u32,
                mapping_size,
                (self.lines.len() / 2) as u32,
                lines_size,
                addr_size,
                is_folded_size,
            ],
        );
    }

    fn decode(
        &mut self,
        src: &[u8],
        header_size: usize,
        dst: &mut Vec<Location>,
    ) -> Result<usize, FormatError> {
        let mut r = ByteReader::new(src);
        let [len, mapping_size, lines_len, lines_size, addr_size, is_folded_size] =
            read_header::<6>(&mut r, header_size)?;
        let len = checked_len(len)?;
        let lines_len = checked_len(lines_len)?;
        let (addr_size, is_folded_size) = (checked_len(addr_size)?, checked_len(is_folded_size)?);
        if len == 0 {
            return Err(FormatError::InvalidSize);
        }
        if is_folded_size != 0 && is_folded_size != len.div_ceil(8) {
            return Err(FormatError::InvalidSize);
        }

        decode_column(&mut r, checked_len(mapping_size)?, len, &mut self.mappings)?;
        let line_counts = r.take(len)?;
        if line_counts.iter().map(|&n| n as usize).sum::<usize>() != lines_len {
            return Err(FormatError::Malformed("line counts do not match lines length"));
        }
        decode_column(&mut r, checked_len(lines_size)?, 2 * lines_len, &mut self.lines)?;
        if addr_size > 0 {
            decode_column(&mut r, addr_size, len, &mut self.addresses)?;
        } else {
            self.addresses.clear();
        }
        let folded = r.take(is_folded_size)?;

        let mut lines = self.lines.chunks_exact(2).map(|pair| Line {
            function_id: pair[0] as u32,
            line: pair[1],
        });
        for (i, &n) in line_counts.iter().enumerate() {
            dst.push(Location {
                address: self.addresses.get(i).map_or(0, |&a| a as u64),
                mapping_id: self.mappings[i] as u32,
                lines: lines.by_ref().take(n as usize).collect(),
                is_folded: folded.get(i >> 3).is_some_and(|b| b & (1 << (i & 7)) != 0),
            });
        }
        Ok(r.position())
    }
}
