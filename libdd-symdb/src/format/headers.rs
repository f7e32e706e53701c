// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::FormatError;
use byteorder::{BigEndian, ByteOrder};

/// Encoding of a stack trace chunk.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ChunkEncoding {
    #[default]
    GroupVarint = 1,
}

impl TryFrom<u8> for ChunkEncoding {
    type Error = FormatError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::GroupVarint),
            _ => Err(FormatError::Malformed("unknown stack trace chunk encoding")),
        }
    }
}

/// Describes one stack trace chunk: a tree of at most `max_nodes` nodes
/// stored at `[offset, offset + size)` of the data file.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StacktraceBlockHeader {
    pub offset: u64,
    pub size: u64,
    /// Only meaningful in V1, where it groups chunks by partition.
    pub partition: u64,
    pub block_index: u16,
    pub encoding: ChunkEncoding,
    /// Number of distinct stack traces in the chunk.
    pub stacktraces: u32,
    /// Number of nodes in the tree, the root included.
    pub nodes: u32,
    pub max_depth: u32,
    /// The chunk size limit at the time the chunk was written.
    pub max_nodes: u32,
    /// CRC32C of the chunk data.
    pub crc: u32,
}

impl StacktraceBlockHeader {
    pub const SIZE: usize = 64;

    pub fn encode(&self, dst: &mut Vec<u8>) {
        let mut b = [0u8; Self::SIZE];
        BigEndian::write_u64(&mut b[0..8], self.offset);
        BigEndian::write_u64(&mut b[8..16], self.size);
        BigEndian::write_u64(&mut b[16..24], self.partition);
        BigEndian::write_u16(&mut b[24..26], self.block_index);
        b[27] = self.encoding as u8;
        BigEndian::write_u32(&mut b[32..36], self.stacktraces);
        BigEndian::write_u32(&mut b[36..40], self.nodes);
        BigEndian::write_u32(&mut b[40..44], self.max_depth);
        BigEndian::write_u32(&mut b[44..48], self.max_nodes);
        BigEndian::write_u32(&mut b[60..64], self.crc);
        dst.extend_from_slice(&b);
    }

    pub fn decode(b: &[u8]) -> Result<Self, FormatError> {
        if b.len() < Self::SIZE {
            return Err(FormatError::InvalidSize);
        }
        let offset = BigEndian::read_i64(&b[0..8]);
        let size = BigEndian::read_i64(&b[8..16]);
        if offset < 0 || size < 0 {
            return Err(FormatError::InvalidSize);
        }
        Ok(Self {
            offset: offset as u64,
            size: size as u64,
            partition: BigEndian::read_u64(&b[16..24]),
            block_index: BigEndian::read_u16(&b[24..26]),
            encoding: ChunkEncoding::try_from(b[27])?,
            stacktraces: BigEndian::read_u32(&b[32..36]),
            nodes: BigEndian::read_u32(&b[36..40]),
            max_depth: BigEndian::read_u32(&b[40..44]),
            max_nodes: BigEndian::read_u32(&b[44..48]),
            crc: BigEndian::read_u32(&b[60..64]),
        })
    }
}

#[repr(u16)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum SymbolsFormat {
    #[default]
    Locations = 1,
    Functions = 2,
    Mappings = 3,
    Strings = 4,
}

impl TryFrom<u16> for SymbolsFormat {
    type Error = FormatError;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Locations),
            2 => Ok(Self::Functions),
            3 => Ok(Self::Mappings),
            4 => Ok(Self::Strings),
            _ => Err(FormatError::Malformed("unknown symbols block format")),
        }
    }
}

/// Describes a symbol table encoded as a sequence of blocks of
/// `block_size` items each.
///
/// Tables are arrays of structures in memory and are written as structures
/// of arrays. `block_header_size` lets a decoder skip header fields it does
/// not know about.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SymbolsBlockHeader {
    /// Offset of the section in the data file.
    pub offset: u64,
    pub size: u32,
    /// CRC32C of the whole section.
    pub crc: u32,
    /// Total number of items.
    pub length: u32,
    pub block_size: u32,
    pub block_header_size: u16,
    pub format: SymbolsFormat,
}

impl SymbolsBlockHeader {
    pub const SIZE: usize = 28;

    pub fn encode(&self, dst: &mut Vec<u8>) {
        let mut b = [0u8; Self::SIZE];
        BigEndian::write_u64(&mut b[0..8], self.offset);
        BigEndian::write_u32(&mut b[8..12], self.size);
        BigEndian::write_u32(&mut b[12..16], self.crc);
        BigEndian::write_u32(&mut b[16..20], self.length);
        BigEndian::write_u32(&mut b[20..24], self.block_size);
        BigEndian::write_u16(&mut b[24..26], self.block_header_size);
        BigEndian::write_u16(&mut b[26..28], self.format as u16);
        dst.extend_from_slice(&b);
    }

    pub fn decode(b: &[u8]) -> Result<Self, FormatError> {
        if b.len() < Self::SIZE {
            return Err(FormatError::InvalidSize);
        }
        Ok(Self {
            offset: BigEndian::read_u64(&b[0..8]),
            size: BigEndian::read_u32(&b[8..12]),
            crc: BigEndian::read_u32(&b[12..16]),
            length: BigEndian::read_u32(&b[16..20]),
            block_size: BigEndian::read_u32(&b[20..24]),
            block_header_size: BigEndian::read_u16(&b[24..26]),
            format: SymbolsFormat::try_from(BigEndian::read_u16(&b[26..28]))?,
        })
    }
}

/// A range of rows of a Parquet symbol table (V2).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RowRangeReference {
    pub row_group: u32,
    pub index: u32,
    pub rows: u32,
}

impl RowRangeReference {
    pub const SIZE: usize = 12;

    pub fn encode(&self, dst: &mut Vec<u8>) {
        let mut b = [0u8; Self::SIZE];
        BigEndian::write_u32(&mut b[0..4], self.row_group);
        BigEndian::write_u32(&mut b[4..8], self.index);
        BigEndian::write_u32(&mut b[8..12], self.rows);
        dst.extend_from_slice(&b);
    }

    pub fn decode(b: &[u8]) -> Result<Self, FormatError> {
        if b.len() < Self::SIZE {
            return Err(FormatError::InvalidSize);
        }
        Ok(Self {
            row_group: BigEndian::read_u32(&b[0..4]),
            index: BigEndian::read_u32(&b[4..8]),
            rows: BigEndian::read_u32(&b[8..12]),
        })
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PartitionHeaderV2 {
    pub locations: Vec<RowRangeReference>,
    pub mappings: Vec<RowRangeReference>,
    pub functions: Vec<RowRangeReference>,
    pub strings: Vec<RowRangeReference>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PartitionHeaderV3 {
    pub locations: SymbolsBlockHeader,
    pub mappings: SymbolsBlockHeader,
    pub functions: SymbolsBlockHeader,
    pub strings: SymbolsBlockHeader,
}

/// Where the symbol tables of a partition live.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum PartitionSymbols {
    /// V1 blocks keep symbols outside the symbol database.
    #[default]
    None,
    V2(PartitionHeaderV2),
    V3(PartitionHeaderV3),
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PartitionHeader {
    pub partition: u64,
    pub stacktraces: Vec<StacktraceBlockHeader>,
    pub symbols: PartitionSymbols,
}

impl PartitionHeader {
    /// Encoded size of the header in the V2 or V3 layout.
    pub fn size(&self) -> usize {
        let fixed = 12 + self.stacktraces.len() * StacktraceBlockHeader::SIZE;
        match &self.symbols {
            PartitionSymbols::None => fixed,
            PartitionSymbols::V2(h) => {
                let refs =
                    h.locations.len() + h.mappings.len() + h.functions.len() + h.strings.len();
                fixed + 16 + refs * RowRangeReference::SIZE
            }
            PartitionSymbols::V3(_) => fixed + 4 * SymbolsBlockHeader::SIZE,
        }
    }

    pub fn encode_v2(&self, h: &PartitionHeaderV2, dst: &mut Vec<u8>) {
        let mut b = [0u8; 28];
        BigEndian::write_u64(&mut b[0..8], self.partition);
        BigEndian::write_u32(&mut b[8..12], self.stacktraces.len() as u32);
        BigEndian::write_u32(&mut b[12..16], h.locations.len() as u32);
        BigEndian::write_u32(&mut b[16..20], h.mappings.len() as u32);
        BigEndian::write_u32(&mut b[20..24], h.functions.len() as u32);
        BigEndian::write_u32(&mut b[24..28], h.strings.len() as u32);
        dst.extend_from_slice(&b);
        for chunk in &self.stacktraces {
            chunk.encode(dst);
        }
        for refs in [&h.locations, &h.mappings, &h.functions, &h.strings] {
            for r in refs {
                r.encode(dst);
            }
        }
    }

    pub fn encode_v3(&self, h: &PartitionHeaderV3, dst: &mut Vec<u8>) {
        let mut b = [0u8; 12];
        BigEndian::write_u64(&mut b[0..8], self.partition);
        BigEndian::write_u32(&mut b[8..12], self.stacktraces.len() as u32);
        dst.extend_from_slice(&b);
        for chunk in &self.stacktraces {
            chunk.encode(dst);
        }
        for symbols in [&h.locations, &h.mappings, &h.functions, &h.strings] {
            symbols.encode(dst);
        }
    }

    /// Decodes a V2 header from the front of `b`, returning it along with
    /// the number of bytes consumed.
    pub fn decode_v2(b: &[u8]) -> Result<(Self, usize), FormatError> {
        if b.len() < 28 {
            return Err(FormatError::InvalidSize);
        }
        let partition = BigEndian::read_u64(&b[0..8]);
        let counts = [
            BigEndian::read_u32(&b[8..12]) as usize,
            BigEndian::read_u32(&b[12..16]) as usize,
            BigEndian::read_u32(&b[16..20]) as usize,
            BigEndian::read_u32(&b[20..24]) as usize,
            BigEndian::read_u32(&b[24..28]) as usize,
        ];
        let mut pos = 28;
        let stacktraces = decode_array(
            b,
            &mut pos,
            counts[0],
            StacktraceBlockHeader::SIZE,
            StacktraceBlockHeader::decode,
        )?;
        let mut refs = |n| {
            decode_array(
                b,
                &mut pos,
                n,
                RowRangeReference::SIZE,
                RowRangeReference::decode,
            )
        };
        let v2 = PartitionHeaderV2 {
            locations: refs(counts[1])?,
            mappings: refs(counts[2])?,
            functions: refs(counts[3])?,
            strings: refs(counts[4])?,
        };
        let header = Self {
            partition,
            stacktraces,
            symbols: PartitionSymbols::V2(v2),
        };
        Ok((header, pos))
    }

    /// Decodes a V3 header from the front of `b`, returning it along with
    /// the number of bytes consumed.
    pub fn decode_v3(b: &[u8]) -> Result<(Self, usize), FormatError> {
        if b.len() < 12 {
            return Err(FormatError::InvalidSize);
        }
        let partition = BigEndian::read_u64(&b[0..8]);
        let chunks = BigEndian::read_u32(&b[8..12]) as usize;
        let mut pos = 12;
        let stacktraces = decode_array(
            b,
            &mut pos,
            chunks,
            StacktraceBlockHeader::SIZE,
            StacktraceBlockHeader::decode,
        )?;
        let mut symbols = [SymbolsBlockHeader::default(); 4];
        for h in symbols.iter_mut() {
            let end = pos + SymbolsBlockHeader::SIZE;
            *h = SymbolsBlockHeader::decode(b.get(pos..end).ok_or(FormatError::InvalidSize)?)?;
            pos = end;
        }
        let [locations, mappings, functions, strings] = symbols;
        let header = Self {
            partition,
            stacktraces,
            symbols: PartitionSymbols::V3(PartitionHeaderV3 {
                locations,
                mappings,
                functions,
                strings,
            }),
        };
        Ok((header, pos))
    }
}

/// Decodes `n` fixed-size items starting at `*pos`. The size is checked
/// against the input before anything is allocated.
fn decode_array<T>(
    b: &[u8],
    pos: &mut usize,
    n: usize,
    item_size: usize,
    decode: impl Fn(&[u8]) -> Result<T, FormatError>,
) -> Result<Vec<T>, FormatError> {
    let size = n.checked_mul(item_size).ok_or(FormatError::InvalidSize)?;
    let end = pos.checked_add(size).ok_or(FormatError::InvalidSize)?;
    let bytes = b.get(*pos..end).ok_or(FormatError::InvalidSize)?;
    let items = bytes
        .chunks_exact(item_size)
        .map(decode)
        .collect::<Result<Vec<_>, _>>()?;
    *pos = end;
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(partition: u64, block_index: u16) -> StacktraceBlockHeader {
        StacktraceBlockHeader {
            offset: 100 * block_index as u64,
            size: 100,
            partition,
            block_index,
            encoding: ChunkEncoding::GroupVarint,
            stacktraces: 3,
            nodes: 7,
            max_depth: 4,
            max_nodes: 7,
            crc: 0xabcd_ef01,
        }
    }

    #[test]
    fn stacktrace_block_header_layout() {
        let mut b = Vec::new();
        chunk(9, 2).encode(&mut b);
        assert_eq!(b.len(), StacktraceBlockHeader::SIZE);
        assert_eq!(b[27], 1);
        assert_eq!(&b[60..64], &[0xab, 0xcd, 0xef, 0x01]);
        assert_eq!(StacktraceBlockHeader::decode(&b), Ok(chunk(9, 2)));

        b[27] = 7;
        assert!(StacktraceBlockHeader::decode(&b).is_err());
        b[27] = 1;
        b[0] = 0x80;
        assert_eq!(
            StacktraceBlockHeader::decode(&b),
            Err(FormatError::InvalidSize)
        );
    }

    #[test]
    fn v3_partition_header() {
        let symbols = |format, offset| SymbolsBlockHeader {
            offset,
            size: 10,
            crc: 1,
            length: 5,
            block_size: 1024,
            block_header_size: 24,
            format,
        };
        let v3 = PartitionHeaderV3 {
            locations: symbols(SymbolsFormat::Locations, 1),
            mappings: symbols(SymbolsFormat::Mappings, 2),
            functions: symbols(SymbolsFormat::Functions, 3),
            strings: symbols(SymbolsFormat::Strings, 4),
        };
        let header = PartitionHeader {
            partition: 42,
            stacktraces: vec![chunk(0, 0), chunk(0, 1)],
            symbols: PartitionSymbols::V3(v3),
        };
        let mut b = Vec::new();
        header.encode_v3(&v3, &mut b);
        assert_eq!(b.len(), header.size());
        b.extend_from_slice(b"trailing");
        let (decoded, n) = PartitionHeader::decode_v3(&b).unwrap();
        assert_eq!(n, header.size());
        assert_eq!(decoded, header);

        assert_eq!(
            PartitionHeader::decode_v3(&b[..header.size() - 1]),
            Err(FormatError::InvalidSize)
        );
    }

    #[test]
    fn v2_partition_header() {
        let v2 = PartitionHeaderV2 {
            locations: vec![RowRangeReference { row_group: 0, index: 1, rows: 2 }],
            mappings: vec![],
            functions: vec![
                RowRangeReference { row_group: 1, index: 0, rows: 10 },
                RowRangeReference { row_group: 2, index: 0, rows: 3 },
            ],
            strings: vec![RowRangeReference { row_group: 0, index: 0, rows: 7 }],
        };
        let header = PartitionHeader {
            partition: 7,
            stacktraces: vec![chunk(0, 0)],
            symbols: PartitionSymbols::V2(v2.clone()),
        };
        let mut b = Vec::new();
        header.encode_v2(&v2, &mut b);
        assert_eq!(b.len(), header.size());
        let (decoded, n) = PartitionHeader::decode_v2(&b).unwrap();
        assert_eq!(n, b.len());
        assert_eq!(decoded, header);
    }

    #[test]
    fn huge_counts_are_rejected() {
        let mut b = vec![0u8; 12];
        BigEndian::write_u32(&mut b[8..12], u32::MAX);
        assert_eq!(
            PartitionHeader::decode_v3(&b),
            Err(FormatError::InvalidSize)
        );
    }

    #[test]
    fn fuzz_partition_headers() {
        bolero::check!().with_type::<Vec<u8>>().for_each(|bytes| {
            if let Ok((h, n)) = PartitionHeader::decode_v3(bytes) {
                assert_eq!(n, h.size());
            }
            if let Ok((h, n)) = PartitionHeader::decode_v2(bytes) {
                assert_eq!(n, h.size());
            }
        });
    }
}
