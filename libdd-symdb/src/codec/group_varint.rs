// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::FormatError;
use arrayvec::ArrayVec;

/// One control byte and four values of up to four bytes each.
pub const MAX_GROUP_SIZE: usize = 17;

/// An encoded group of four u32 values.
pub type Group = ArrayVec<u8, MAX_GROUP_SIZE>;

/// Returns the number of bytes taken by the group starting with `control`,
/// the control byte included.
#[inline]
pub const fn group_len(control: u8) -> usize {
    let mut n = 1;
    let mut i = 0;
    while i < 4 {
        n += ((control >> (2 * i)) & 0b11) as usize + 1;
        i += 1;
    }
    n
}

#[inline]
fn value_len(v: u32) -> usize {
    match v {
        0..=0xff => 1,
        0x100..=0xffff => 2,
        0x1_0000..=0xff_ffff => 3,
        _ => 4,
    }
}

/// Encodes four values. The control byte holds the byte length minus one of
/// each value, two bits per value with the first value in the lowest bits;
/// the values follow in little-endian order.
pub fn encode4(values: [u32; 4]) -> Group {
    let mut group = Group::new();
    group.push(0);
    let mut control = 0u8;
    for (i, v) in values.into_iter().enumerate() {
        let n = value_len(v);
        control |= ((n - 1) as u8) << (2 * i);
        // An encoded group never exceeds MAX_GROUP_SIZE.
        let _ = group.try_extend_from_slice(&v.to_le_bytes()[..n]);
    }
    group[0] = control;
    group
}

/// Decodes one group from the front of `src`, returning the values and the
/// number of bytes consumed.
pub fn decode4(src: &[u8]) -> Result<([u32; 4], usize), FormatError> {
    let control = *src.first().ok_or(FormatError::InvalidSize)?;
    let len = group_len(control);
    if src.len() < len {
        return Err(FormatError::InvalidSize);
    }
    let mut values = [0u32; 4];
    let mut pos = 1;
    for (i, value) in values.iter_mut().enumerate() {
        let n = ((control >> (2 * i)) & 0b11) as usize + 1;
        let mut b = [0u8; 4];
        b[..n].copy_from_slice(&src[pos..pos + n]);
        *value = u32::from_le_bytes(b);
        pos += n;
    }
    Ok((values, len))
}
