// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::block::{
    checked_len, decode_column, encode_column, read_header, reserve_header, write_header,
};
use super::{BlockCodec, Function};
use crate::codec::ByteReader;
use crate::format::SymbolsFormat;
use crate::FormatError;

/// Block layout: `{functions_len, name_size, system_name_size,
/// filename_size, start_line_size}` header, then one delta packed column per
/// field.
#[derive(Debug, Default)]
pub struct FunctionsCodec {
    ints: Vec<i32>,
    columns: [Vec<i32>; 4],
}

impl BlockCodec<Function> for FunctionsCodec {
    const FORMAT: SymbolsFormat = SymbolsFormat::Functions;
    const HEADER_SIZE: usize = 20;

    fn encode(&mut self, block: &[Function], dst: &mut Vec<u8>) {
        let at = reserve_header::<5>(dst);
        let mut sizes = [0u32; 4];
        let fields: [fn(&Function) -> u32; 4] = [
            |f| f.name,
            |f| f.system_name,
            |f| f.filename,
            |f| f.start_line,
        ];
        for (size, field) in sizes.iter_mut().zip(fields) {
            self.ints.clear();
            self.ints.extend(block.iter().map(|f| field(f) as i32));
            *size = encode_column(&self.ints, dst);
        }
        let [name, system_name, filename, start_line] = sizes;
        write_header(
            &mut dst[at..],
            [block.len() as u32, name, system_name, filename, start_line],
        );
    }

    fn decode(
        &mut self,
        src: &[u8],
        header_size: usize,
        dst: &mut Vec<Function>,
    ) -> Result<usize, FormatError> {
        let mut r = ByteReader::new(src);
        let header = read_header::<5>(&mut r, header_size)?;
        let len = checked_len(header[0])?;
        if len == 0 {
            return Err(FormatError::InvalidSize);
        }
        for (column, &size) in self.columns.iter_mut().zip(&header[1..]) {
            let size = checked_len(size)?;
            decode_column(&mut r, size, len, column)?;
        }
        let [name, system_name, filename, start_line] = &self.columns;
        dst.extend((0..len).map(|i| Function {
            name: name[i] as u32,
            system_name: system_name[i] as u32,
            filename: filename[i] as u32,
            start_line: start_line[i] as u32,
        }));
        Ok(r.position())
    }
}
