// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::FormatError;

/// Maximum length of a LEB128-encoded u64.
pub const MAX_VARINT_LEN64: usize = 10;

#[inline]
pub fn zigzag_encode32(v: i32) -> u32 {
    ((v << 1) ^ (v >> 31)) as u32
}

#[inline]
pub fn zigzag_decode32(v: u32) -> i32 {
    ((v >> 1) as i32) ^ -((v & 1) as i32)
}

#[inline]
pub fn zigzag_encode64(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
pub fn zigzag_decode64(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

pub fn write_uvarint(dst: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        dst.push((v as u8) | 0x80);
        v >>= 7;
    }
    dst.push(v as u8);
}

pub fn write_varint(dst: &mut Vec<u8>, v: i64) {
    write_uvarint(dst, zigzag_encode64(v))
}

/// Reads a LEB128 varint and returns the value with the number of bytes
/// consumed.
pub fn read_uvarint(buf: &[u8]) -> Result<(u64, usize), FormatError> {
    let mut x = 0u64;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate() {
        if i == MAX_VARINT_LEN64 {
            return Err(FormatError::Malformed("varint overflows a 64-bit integer"));
        }
        if b < 0x80 {
            if i == MAX_VARINT_LEN64 - 1 && b > 1 {
                return Err(FormatError::Malformed("varint overflows a 64-bit integer"));
            }
            return Ok((x | (b as u64) << shift, i + 1));
        }
        x |= ((b & 0x7f) as u64) << shift;
        shift += 7;
    }
    Err(FormatError::InvalidSize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zigzag_small_values() {
        assert_eq!(zigzag_encode32(0), 0);
        assert_eq!(zigzag_encode32(-1), 1);
        assert_eq!(zigzag_encode32(1), 2);
        assert_eq!(zigzag_encode32(-2), 3);
        assert_eq!(zigzag_encode32(i32::MIN), u32::MAX);
        assert_eq!(zigzag_encode64(i64::MIN), u64::MAX);
    }

    #[test]
    fn uvarint_errors() {
        assert_eq!(read_uvarint(&[]), Err(FormatError::InvalidSize));
        assert_eq!(read_uvarint(&[0x80, 0x80]), Err(FormatError::InvalidSize));
        assert!(read_uvarint(&[0xff; 11]).is_err());
        assert_eq!(read_uvarint(&[0xac, 0x02]), Ok((300, 2)));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: if cfg!(miri) { 4 } else { 64 },
            .. ProptestConfig::default()
        })]

        #[test]
        fn proptest_varints(v in any::<i64>(), w in any::<i32>()) {
            prop_assert_eq!(zigzag_decode32(zigzag_encode32(w)), w);
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            prop_assert!(buf.len() <= MAX_VARINT_LEN64);
            let (u, n) = read_uvarint(&buf).unwrap();
            prop_assert_eq!(n, buf.len());
            prop_assert_eq!(zigzag_decode64(u), v);
        }
    }
}
