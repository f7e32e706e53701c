// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::Symbol;
use crate::codec::{crc32c, delta_decode, delta_encode, ByteReader, DeltaInt};
use crate::format::{SymbolsBlockHeader, SymbolsFormat};
use crate::{FormatError, SymdbError};
use byteorder::{ByteOrder, LittleEndian};
use std::marker::PhantomData;

pub const DEFAULT_SYMBOLS_BLOCK_SIZE: usize = 1 << 10;

/// Counts and column sizes read from a block header are validated against
/// this limit before the block is decoded, as blocks are parsed before
/// anything else about them can be trusted.
pub(crate) const MAX_COLUMN_SIZE: u32 = 1 << 20;

/// Encodes and decodes blocks of one symbol kind. Implementations own the
/// scratch buffers they need, so a codec should be reused across blocks.
pub trait BlockCodec<T> {
    const FORMAT: SymbolsFormat;
    /// Size of the block header written by this codec.
    const HEADER_SIZE: usize;

    /// Appends one encoded block to `dst`.
    fn encode(&mut self, block: &[T], dst: &mut Vec<u8>);

    /// Decodes one block from the front of `src` and appends its items to
    /// `dst`. `header_size` is the block header size recorded in the file,
    /// which may be larger than [`Self::HEADER_SIZE`] if the block was
    /// written by a newer encoder. Returns the number of bytes consumed.
    fn decode(
        &mut self,
        src: &[u8],
        header_size: usize,
        dst: &mut Vec<T>,
    ) -> Result<usize, FormatError>;
}

/// Splits a table into blocks and encodes them back to back.
pub struct SymbolsEncoder<T: Symbol> {
    codec: T::Codec,
    block_size: usize,
}

impl<T: Symbol> Default for SymbolsEncoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_SYMBOLS_BLOCK_SIZE)
    }
}

impl<T: Symbol> SymbolsEncoder<T> {
    pub fn new(block_size: usize) -> Self {
        Self {
            codec: T::Codec::default(),
            block_size: block_size.max(1),
        }
    }

    /// Appends the encoded table to `dst`. The header records the position
    /// of the section within `dst`.
    pub fn encode(
        &mut self,
        items: &[T],
        dst: &mut Vec<u8>,
    ) -> Result<SymbolsBlockHeader, SymdbError> {
        let offset = dst.len();
        for block in items.chunks(self.block_size) {
            self.codec.encode(block, dst);
        }
        let size = u32::try_from(dst.len() - offset)
            .map_err(|_| SymdbError::invalid_input("symbols section exceeds 4 GiB"))?;
        let length = u32::try_from(items.len())
            .map_err(|_| SymdbError::invalid_input("too many symbols"))?;
        Ok(SymbolsBlockHeader {
            offset: offset as u64,
            size,
            crc: crc32c(&dst[offset..]),
            length,
            block_size: self.block_size as u32,
            block_header_size: <T::Codec as BlockCodec<T>>::HEADER_SIZE as u16,
            format: <T::Codec as BlockCodec<T>>::FORMAT,
        })
    }
}

pub struct SymbolsDecoder<T: Symbol> {
    codec: T::Codec,
    _marker: PhantomData<T>,
}

impl<T: Symbol> Default for SymbolsDecoder<T> {
    fn default() -> Self {
        Self {
            codec: T::Codec::default(),
            _marker: PhantomData,
        }
    }
}

impl<T: Symbol> SymbolsDecoder<T> {
    /// Decodes the table described by `header`. `data` is the section
    /// itself, `[header.offset, header.offset + header.size)` of the file.
    pub fn decode(
        &mut self,
        header: &SymbolsBlockHeader,
        data: &[u8],
    ) -> Result<Vec<T>, FormatError> {
        if header.block_size == 0 || header.length == 0 {
            return Ok(Vec::new());
        }
        if header.format != <T::Codec as BlockCodec<T>>::FORMAT {
            return Err(FormatError::Malformed("unexpected symbols block format"));
        }
        if data.len() != header.size as usize {
            return Err(FormatError::InvalidSize);
        }
        if crc32c(data) != header.crc {
            return Err(FormatError::InvalidCrc);
        }

        let length = header.length as usize;
        let block_size = header.block_size as usize;
        let mut items = Vec::new();
        items
            .try_reserve(length.min(MAX_COLUMN_SIZE as usize))
            .map_err(|_| FormatError::InvalidSize)?;
        let mut pos = 0;
        while items.len() < length {
            let expected = items.len() + block_size.min(length - items.len());
            let src = data.get(pos..).ok_or(FormatError::InvalidSize)?;
            pos += self
                .codec
                .decode(src, header.block_header_size as usize, &mut items)?;
            if items.len() != expected {
                return Err(FormatError::Malformed("unexpected number of items in block"));
            }
        }
        if pos != data.len() {
            return Err(FormatError::Malformed("trailing bytes after symbols blocks"));
        }
        Ok(items)
    }
}

/// Reserves room for a little-endian `u32` block header of `N` fields.
pub(crate) fn reserve_header<const N: usize>(dst: &mut Vec<u8>) -> usize {
    let at = dst.len();
    dst.resize(at + N * 4, 0);
    at
}

pub(crate) fn write_header<const N: usize>(dst: &mut [u8], fields: [u32; N]) {
    for (i, v) in fields.into_iter().enumerate() {
        LittleEndian::write_u32(&mut dst[i * 4..i * 4 + 4], v);
    }
}

/// Reads the `N` header fields this codec knows about and skips the rest of
/// a (possibly larger) header.
pub(crate) fn read_header<const N: usize>(
    r: &mut ByteReader,
    header_size: usize,
) -> Result<[u32; N], FormatError> {
    if header_size < N * 4 {
        return Err(FormatError::Malformed("block header too short"));
    }
    let mut fields = [0u32; N];
    for f in fields.iter_mut() {
        *f = r.u32_le()?;
    }
    r.skip(header_size - N * 4)?;
    Ok(fields)
}

/// Validates a count or size read from a block header.
#[inline]
pub(crate) fn checked_len(v: u32) -> Result<usize, FormatError> {
    if v < MAX_COLUMN_SIZE {
        Ok(v as usize)
    } else {
        Err(FormatError::InvalidSize)
    }
}

/// Appends a delta binary packed column and returns its size.
pub(crate) fn encode_column<T: DeltaInt>(values: &[T], dst: &mut Vec<u8>) -> u32 {
    let start = dst.len();
    delta_encode(values, dst);
    (dst.len() - start) as u32
}

/// Decodes a column of exactly `len` values taking exactly `size` bytes.
pub(crate) fn decode_column<T: DeltaInt>(
    r: &mut ByteReader,
    size: usize,
    len: usize,
    dst: &mut Vec<T>,
) -> Result<(), FormatError> {
    dst.clear();
    let bytes = r.take(size)?;
    let n = delta_decode(bytes, len, dst)?;
    if n != bytes.len() || dst.len() != len {
        return Err(FormatError::InvalidSize);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Encodes `items` in blocks of `block_size`, checks that every single
    /// flipped byte is reported as a checksum mismatch, and returns the
    /// decoded table.
    #[track_caller]
    pub(crate) fn round_trip<T: Symbol + std::fmt::Debug>(items: &[T], block_size: usize) -> Vec<T> {
        let mut buf = b"prefix".to_vec();
        let header = SymbolsEncoder::<T>::new(block_size)
            .encode(items, &mut buf)
            .unwrap();
        assert_eq!(header.offset, 6);
        assert_eq!(header.length as usize, items.len());
        let data = &buf[6..];
        assert_eq!(data.len(), header.size as usize);

        let mut decoder = SymbolsDecoder::<T>::default();
        let decoded = decoder.decode(&header, data).unwrap();
        assert_eq!(decoded, items);

        for i in 0..data.len() {
            let mut corrupted = data.to_vec();
            corrupted[i] ^= 0x01;
            assert_eq!(
                decoder.decode(&header, &corrupted),
                Err(FormatError::InvalidCrc)
            );
        }
        decoded
    }

    #[test]
    fn empty_table_decodes_to_nothing() {
        let mut buf = Vec::new();
        let header = SymbolsEncoder::<String>::default()
            .encode(&[], &mut buf)
            .unwrap();
        assert_eq!(header.length, 0);
        assert!(buf.is_empty());
        let decoded = SymbolsDecoder::<String>::default()
            .decode(&header, &buf)
            .unwrap();
        assert!(decoded.is_empty());

        let header = SymbolsBlockHeader {
            length: 10,
            block_size: 0,
            ..header
        };
        assert!(SymbolsDecoder::<String>::default()
            .decode(&header, b"garbage")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn header_mismatch() {
        let items = vec![String::new(), "a".to_string()];
        let mut buf = Vec::new();
        let header = SymbolsEncoder::<String>::default()
            .encode(&items, &mut buf)
            .unwrap();
        let mut decoder = SymbolsDecoder::<String>::default();
        assert_eq!(
            decoder.decode(&header, &buf[1..]),
            Err(FormatError::InvalidSize)
        );
        let wrong_format = SymbolsBlockHeader {
            format: SymbolsFormat::Functions,
            ..header
        };
        assert!(decoder.decode(&wrong_format, &buf).is_err());
        let wrong_length = SymbolsBlockHeader {
            length: 3,
            ..header
        };
        assert!(decoder.decode(&wrong_length, &buf).is_err());
    }

    #[test]
    fn larger_block_header_is_skipped() {
        // A block written by a newer encoder with one extra header field.
        let mut block = Vec::new();
        let at = reserve_header::<3>(&mut block);
        write_header(&mut block[at..], [2, 8, 0xffff]);
        block.extend_from_slice(&[1, 1, b'a', b'b']);
        let header = SymbolsBlockHeader {
            offset: 0,
            size: block.len() as u32,
            crc: crc32c(&block),
            length: 2,
            block_size: 16,
            block_header_size: 12,
            format: SymbolsFormat::Strings,
        };
        let decoded = SymbolsDecoder::<String>::default()
            .decode(&header, &block)
            .unwrap();
        assert_eq!(decoded, vec!["a".to_string(), "b".to_string()]);
    }
}
