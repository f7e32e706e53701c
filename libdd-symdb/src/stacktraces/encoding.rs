// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stack trace trees are serialized as their parent-pointer representation.
//! Nodes are taken in pairs, and each pair is one group-varint group of four
//! values: the zig-zag encoded delta of the parent index relative to the
//! previous node's parent, and the raw location reference, twice. An odd
//! node count is completed with a `(0, 0)` stub, which the decoder ignores
//! because it knows the node count from the chunk header.

use crate::codec::{
    decode4, encode4, group_len, zigzag_decode32, zigzag_encode32, MAX_GROUP_SIZE,
};
use crate::FormatError;
use std::io;

pub const DEFAULT_WRITE_SIZE: usize = 4 << 10;
pub const DEFAULT_READ_SIZE: usize = 4 << 10;

/// Writes nodes through a staging buffer of `write_size` bytes.
#[derive(Clone, Copy, Debug)]
pub struct TreeEncoder {
    write_size: usize,
}

impl Default for TreeEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_SIZE)
    }
}

impl TreeEncoder {
    pub fn new(write_size: usize) -> Self {
        Self {
            write_size: write_size.max(MAX_GROUP_SIZE),
        }
    }

    /// Encodes `(parent, location)` pairs and returns the number of bytes
    /// written.
    pub fn encode<W: io::Write>(
        &self,
        mut nodes: impl Iterator<Item = (i32, i32)>,
        w: &mut W,
    ) -> io::Result<u64> {
        let mut buf = Vec::with_capacity(self.write_size);
        let mut written = 0u64;
        let mut prev = 0i32;
        while let Some((p, r)) = nodes.next() {
            let first = zigzag_encode32(p.wrapping_sub(prev));
            prev = p;
            let (second, second_ref) = match nodes.next() {
                Some((p, r)) => {
                    let delta = zigzag_encode32(p.wrapping_sub(prev));
                    prev = p;
                    (delta, r as u32)
                }
                None => (0, 0),
            };
            let group = encode4([first, r as u32, second, second_ref]);
            if buf.len() + group.len() > self.write_size {
                w.write_all(&buf)?;
                written += buf.len() as u64;
                buf.clear();
            }
            buf.extend_from_slice(&group);
        }
        if !buf.is_empty() {
            w.write_all(&buf)?;
            written += buf.len() as u64;
        }
        Ok(written)
    }
}

/// Reads nodes through a buffer of `read_size` bytes. A group may straddle
/// two reads: its head is carried over to the front of the buffer and
/// completed by the next read.
#[derive(Clone, Copy, Debug)]
pub struct TreeDecoder {
    read_size: usize,
}

impl Default for TreeDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_READ_SIZE)
    }
}

impl TreeDecoder {
    pub fn new(read_size: usize) -> Self {
        Self {
            read_size: read_size.max(MAX_GROUP_SIZE),
        }
    }

    /// Decodes exactly `dst.len()` nodes from `r` and returns the number of
    /// bytes the nodes took. The reader may be consumed past that point.
    pub fn decode<R: io::Read>(&self, dst: &mut [(i32, i32)], r: &mut R) -> io::Result<u64> {
        let mut buf = vec![0u8; self.read_size];
        let (mut start, mut end) = (0usize, 0usize);
        let mut consumed = 0u64;
        let mut eof = false;
        let mut prev = 0i32;
        let mut np = 0;

        while np < dst.len() {
            let available = end - start;
            let need = if available == 0 {
                1
            } else {
                group_len(buf[start])
            };
            if available < need {
                if eof {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                // Carry the partial group over to the front of the buffer.
                buf.copy_within(start..end, 0);
                end -= start;
                start = 0;
                match r.read(&mut buf[end..]) {
                    Ok(0) => eof = true,
                    Ok(n) => end += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
                continue;
            }

            let (group, n) = decode4(&buf[start..end])?;
            start += n;
            consumed += n as u64;
            for (delta, r) in [(group[0], group[1]), (group[2], group[3])] {
                if np == dst.len() {
                    break;
                }
                let p = zigzag_decode32(delta).wrapping_add(prev);
                prev = p;
                dst[np] = (p, r as i32);
                np += 1;
            }
        }
        Ok(consumed)
    }

    /// Decodes `nodes` nodes from a byte slice, which must contain exactly
    /// the encoded tree.
    pub fn decode_slice(&self, dst: &mut [(i32, i32)], mut src: &[u8]) -> Result<(), FormatError> {
        let len = src.len() as u64;
        match self.decode(dst, &mut src) {
            Ok(consumed) if consumed == len => Ok(()),
            Ok(_) => Err(FormatError::Malformed("trailing bytes after stack trace tree")),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FormatError::InvalidSize),
            Err(e) => Err(e
                .get_ref()
                .and_then(|e| e.downcast_ref::<FormatError>())
                .copied()
                .unwrap_or(FormatError::Malformed("stack trace tree"))),
        }
    }
}
