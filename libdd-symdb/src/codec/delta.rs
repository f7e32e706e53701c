// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delta binary packed integer encoding, bit-compatible with the Parquet
//! `DELTA_BINARY_PACKED` encoding.
//!
//! The stream starts with a header of four varints: the block size in
//! values, the number of miniblocks per block, the total number of values and
//! the first value (zig-zag). Each block then stores the minimum delta
//! (zig-zag varint), one bit-width byte per miniblock, and the miniblocks:
//! `delta - min_delta` bit-packed LSB-first at the miniblock's width.

use super::{read_uvarint, write_uvarint, write_varint, zigzag_decode64};
use crate::FormatError;

pub const DELTA_BLOCK_SIZE: usize = 128;
pub const DELTA_MINIBLOCKS: usize = 4;
const MINIBLOCK_SIZE: usize = DELTA_BLOCK_SIZE / DELTA_MINIBLOCKS;

/// Upper bound for the block size accepted by the decoder.
const MAX_BLOCK_SIZE: u64 = 1 << 16;

/// An integer type that can be delta binary packed.
pub trait DeltaInt: Copy + Ord + Default {
    const BITS: u32;
    fn wrapping_sub(self, rhs: Self) -> Self;
    fn wrapping_add(self, rhs: Self) -> Self;
    fn to_i64(self) -> i64;
    fn try_from_i64(v: i64) -> Option<Self>;
    /// The two's complement bit pattern, zero-extended.
    fn to_bits(self) -> u64;
    fn from_bits(v: u64) -> Self;
}

impl DeltaInt for i32 {
    const BITS: u32 = 32;

    #[inline]
    fn wrapping_sub(self, rhs: Self) -> Self {
        i32::wrapping_sub(self, rhs)
    }

    #[inline]
    fn wrapping_add(self, rhs: Self) -> Self {
        i32::wrapping_add(self, rhs)
    }

    #[inline]
    fn to_i64(self) -> i64 {
        self as i64
    }

    #[inline]
    fn try_from_i64(v: i64) -> Option<Self> {
        i32::try_from(v).ok()
    }

    #[inline]
    fn to_bits(self) -> u64 {
        self as u32 as u64
    }

    #[inline]
    fn from_bits(v: u64) -> Self {
        v as u32 as i32
    }
}

impl DeltaInt for i64 {
    const BITS: u32 = 64;

    #[inline]
    fn wrapping_sub(self, rhs: Self) -> Self {
        i64::wrapping_sub(self, rhs)
    }

    #[inline]
    fn wrapping_add(self, rhs: Self) -> Self {
        i64::wrapping_add(self, rhs)
    }

    #[inline]
    fn to_i64(self) -> i64 {
        self
    }

    #[inline]
    fn try_from_i64(v: i64) -> Option<Self> {
        Some(v)
    }

    #[inline]
    fn to_bits(self) -> u64 {
        self as u64
    }

    #[inline]
    fn from_bits(v: u64) -> Self {
        v as i64
    }
}

/// Appends the encoded `values` to `dst`.
pub fn delta_encode<T: DeltaInt>(values: &[T], dst: &mut Vec<u8>) {
    write_uvarint(dst, DELTA_BLOCK_SIZE as u64);
    write_uvarint(dst, DELTA_MINIBLOCKS as u64);
    write_uvarint(dst, values.len() as u64);
    write_varint(dst, values.first().copied().unwrap_or_default().to_i64());
    if values.len() < 2 {
        return;
    }

    let mut deltas = [T::default(); DELTA_BLOCK_SIZE];
    let mut prev = values[0];
    for block in values[1..].chunks(DELTA_BLOCK_SIZE) {
        for (d, &v) in deltas.iter_mut().zip(block) {
            *d = v.wrapping_sub(prev);
            prev = v;
        }
        let deltas = &deltas[..block.len()];
        let min = deltas.iter().copied().min().unwrap_or_default();
        write_varint(dst, min.to_i64());

        let widths_at = dst.len();
        dst.extend_from_slice(&[0u8; DELTA_MINIBLOCKS]);
        for (m, miniblock) in deltas.chunks(MINIBLOCK_SIZE).enumerate() {
            let max = miniblock
                .iter()
                .map(|d| d.wrapping_sub(min).to_bits())
                .fold(0, |acc, v| acc | v);
            let width = u64::BITS - max.leading_zeros();
            dst[widths_at + m] = width as u8;
            pack_miniblock(
                miniblock.iter().map(|d| d.wrapping_sub(min).to_bits()),
                width,
                dst,
            );
        }
    }
}

fn pack_miniblock(values: impl Iterator<Item = u64>, width: u32, dst: &mut Vec<u8>) {
    if width == 0 {
        return;
    }
    let mut acc = 0u128;
    let mut bits = 0u32;
    let mut n = 0;
    for v in values.chain(std::iter::repeat(0)).take(MINIBLOCK_SIZE) {
        acc |= (v as u128) << bits;
        bits += width;
        while bits >= 8 {
            dst.push(acc as u8);
            acc >>= 8;
            bits -= 8;
        }
        n += 1;
    }
    debug_assert_eq!(n, MINIBLOCK_SIZE);
    debug_assert_eq!(bits, 0);
}

fn unpack_miniblock(src: &[u8], width: u32, dst: &mut [u64]) {
    if width == 0 {
        dst.fill(0);
        return;
    }
    let mask = if width == 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    };
    let mut acc = 0u128;
    let mut bits = 0u32;
    let mut bytes = src.iter();
    for v in dst.iter_mut() {
        while bits < width {
            let b = bytes.next().copied().unwrap_or(0);
            acc |= (b as u128) << bits;
            bits += 8;
        }
        *v = (acc as u64) & mask;
        acc >>= width;
        bits -= width;
    }
}

/// Decodes one delta binary packed stream from the front of `src` into
/// `dst`, returning the number of bytes consumed. The stream is rejected
/// before any allocation if it claims more than `max_values` values.
pub fn delta_decode<T: DeltaInt>(
    src: &[u8],
    max_values: usize,
    dst: &mut Vec<T>,
) -> Result<usize, FormatError> {
    let mut pos = 0;
    let next_uvarint = |pos: &mut usize| -> Result<u64, FormatError> {
        let (v, n) = read_uvarint(src.get(*pos..).ok_or(FormatError::InvalidSize)?)?;
        *pos += n;
        Ok(v)
    };

    let block_size = next_uvarint(&mut pos)?;
    let miniblocks = next_uvarint(&mut pos)?;
    let total = next_uvarint(&mut pos)?;
    let first = zigzag_decode64(next_uvarint(&mut pos)?);

    if block_size == 0
        || block_size > MAX_BLOCK_SIZE
        || block_size % 128 != 0
        || miniblocks == 0
        || block_size % miniblocks != 0
        || (block_size / miniblocks) % 32 != 0
    {
        return Err(FormatError::Malformed("invalid delta block layout"));
    }
    if total > max_values as u64 {
        return Err(FormatError::InvalidSize);
    }
    let total = total as usize;
    let miniblocks = miniblocks as usize;
    let miniblock_size = (block_size as usize) / miniblocks;
    if total == 0 {
        return Ok(pos);
    }

    dst.try_reserve(total)
        .map_err(|_| FormatError::InvalidSize)?;
    let mut prev = T::try_from_i64(first).ok_or(FormatError::Malformed("value out of range"))?;
    dst.push(prev);

    let mut remaining = total - 1;
    let mut unpacked = vec![0u64; miniblock_size];
    while remaining > 0 {
        let min = zigzag_decode64(next_uvarint(&mut pos)?);
        let min = T::try_from_i64(min).ok_or(FormatError::Malformed("delta out of range"))?;
        let widths_end = pos.checked_add(miniblocks).ok_or(FormatError::InvalidSize)?;
        let widths = src.get(pos..widths_end).ok_or(FormatError::InvalidSize)?;
        pos = widths_end;
        for &width in widths {
            if remaining == 0 {
                break;
            }
            let width = width as u32;
            if width > T::BITS {
                return Err(FormatError::Malformed("invalid bit width"));
            }
            let size = miniblock_size * width as usize / 8;
            let end = pos.checked_add(size).ok_or(FormatError::InvalidSize)?;
            let packed = src.get(pos..end).ok_or(FormatError::InvalidSize)?;
            pos = end;
            unpack_miniblock(packed, width, &mut unpacked);
            let n = remaining.min(miniblock_size);
            for &adjusted in &unpacked[..n] {
                prev = prev.wrapping_add(min.wrapping_add(T::from_bits(adjusted)));
                dst.push(prev);
            }
            remaining -= n;
        }
    }
    Ok(pos)
}
