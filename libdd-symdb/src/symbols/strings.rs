// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::block::{checked_len, read_header, reserve_header, write_header};
use super::BlockCodec;
use crate::codec::ByteReader;
use crate::format::SymbolsFormat;
use crate::FormatError;

/// Strings longer than this are truncated when encoded.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

const LENGTH_U8: u32 = 8;
const LENGTH_U16: u32 = 16;

/// Block layout: `{strings_len, length_encoding}` header (`u32` LE each),
/// one length per string (`u8` when every string of the block is shorter
/// than 256 bytes, `u16` LE otherwise), then the concatenated bytes.
#[derive(Debug, Default)]
pub struct StringsCodec {
    lengths: Vec<usize>,
}

/// Returns the longest prefix of `s` that fits in [`MAX_STRING_LEN`] bytes
/// and ends at a character boundary.
fn truncated(s: &str) -> &str {
    if s.len() <= MAX_STRING_LEN {
        return s;
    }
    let mut n = MAX_STRING_LEN;
    while !s.is_char_boundary(n) {
        n -= 1;
    }
    &s[..n]
}

impl BlockCodec<String> for StringsCodec {
    const FORMAT: SymbolsFormat = SymbolsFormat::Strings;
    const HEADER_SIZE: usize = 8;

    fn encode(&mut self, block: &[String], dst: &mut Vec<u8>) {
        self.lengths.clear();
        for s in block {
            let t = truncated(s);
            if t.len() < s.len() {
                tracing::warn!(len = s.len(), max = MAX_STRING_LEN, "string truncated");
            }
            self.lengths.push(t.len());
        }
        let encoding = if self.lengths.iter().all(|&n| n <= u8::MAX as usize) {
            LENGTH_U8
        } else {
            LENGTH_U16
        };

        let at = reserve_header::<2>(dst);
        write_header(&mut dst[at..], [block.len() as u32, encoding]);
        for &n in &self.lengths {
            if encoding == LENGTH_U8 {
                dst.push(n as u8);
            } else {
                dst.extend_from_slice(&(n as u16).to_le_bytes());
            }
        }
        for (s, &n) in block.iter().zip(&self.lengths) {
            dst.extend_from_slice(&s.as_bytes()[..n]);
        }
    }

    fn decode(
        &mut self,
        src: &[u8],
        header_size: usize,
        dst: &mut Vec<String>,
    ) -> Result<usize, FormatError> {
        let mut r = ByteReader::new(src);
        let [len, encoding] = read_header::<2>(&mut r, header_size)?;
        let len = checked_len(len)?;
        if len == 0 {
            return Err(FormatError::InvalidSize);
        }

        self.lengths.clear();
        match encoding {
            LENGTH_U8 => {
                let lengths = r.take(len)?;
                self.lengths.extend(lengths.iter().map(|&n| n as usize));
            }
            LENGTH_U16 => {
                for _ in 0..len {
                    self.lengths.push(r.u16_le()? as usize);
                }
            }
            _ => return Err(FormatError::Malformed("unknown string length encoding")),
        }

        for &n in &self.lengths {
            let bytes = r.take(n)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| FormatError::Malformed("invalid UTF-8 string"))?;
            dst.push(s.to_owned());
        }
        Ok(r.position())
    }
}
