// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{
    FormatVersion, IndexHeader, PartitionHeader, PartitionHeaderV2, PartitionHeaderV3,
    PartitionSymbols, StacktraceBlockHeader, TocEntry, CHECKSUM_SIZE,
};
use crate::codec::crc32c;
use crate::FormatError;
use byteorder::{BigEndian, ByteOrder};

/// The TOC has a single entry in every version: the partition headers.
const TOC_ENTRIES: usize = 1;
const DATA_OFFSET: usize = IndexHeader::SIZE + TOC_ENTRIES * TocEntry::SIZE;

/// The decoded index of a symbol database.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexFile {
    pub header: IndexHeader,
    pub partitions: Vec<PartitionHeader>,
}

impl IndexFile {
    pub fn new(version: FormatVersion, partitions: Vec<PartitionHeader>) -> Self {
        Self {
            header: IndexHeader { version },
            partitions,
        }
    }

    /// Decodes an index. `b` must hold exactly the index, checksum included.
    pub fn decode(b: &[u8]) -> Result<Self, FormatError> {
        if b.len() < DATA_OFFSET + CHECKSUM_SIZE {
            return Err(FormatError::InvalidSize);
        }
        let (body, crc) = b.split_at(b.len() - CHECKSUM_SIZE);
        if crc32c(body) != BigEndian::read_u32(crc) {
            return Err(FormatError::InvalidCrc);
        }
        let header = IndexHeader::decode(&body[..IndexHeader::SIZE])?;
        let toc = TocEntry::decode(&body[IndexHeader::SIZE..DATA_OFFSET])?;
        let start = usize::try_from(toc.offset).map_err(|_| FormatError::InvalidSize)?;
        let size = usize::try_from(toc.size).map_err(|_| FormatError::InvalidSize)?;
        let end = start.checked_add(size).ok_or(FormatError::InvalidSize)?;
        if start < DATA_OFFSET {
            return Err(FormatError::InvalidSize);
        }
        let data = body.get(start..end).ok_or(FormatError::InvalidSize)?;

        let partitions = match header.version {
            FormatVersion::V1 => decode_v1(data)?,
            FormatVersion::V2 => decode_partitions(data, PartitionHeader::decode_v2)?,
            FormatVersion::V3 => decode_partitions(data, PartitionHeader::decode_v3)?,
        };
        Ok(Self { header, partitions })
    }

    /// Encodes the index, checksum included.
    pub fn encode(&self) -> Vec<u8> {
        let mut section = Vec::new();
        match self.header.version {
            FormatVersion::V1 => {
                for p in &self.partitions {
                    for (i, chunk) in p.stacktraces.iter().enumerate() {
                        StacktraceBlockHeader {
                            partition: p.partition,
                            block_index: i as u16,
                            ..*chunk
                        }
                        .encode(&mut section);
                    }
                }
            }
            FormatVersion::V2 => {
                section.extend_from_slice(&(self.partitions.len() as u32).to_be_bytes());
                let empty = PartitionHeaderV2::default();
                for p in &self.partitions {
                    match &p.symbols {
                        PartitionSymbols::V2(h) => p.encode_v2(h, &mut section),
                        _ => p.encode_v2(&empty, &mut section),
                    }
                }
            }
            FormatVersion::V3 => {
                section.extend_from_slice(&(self.partitions.len() as u32).to_be_bytes());
                for p in &self.partitions {
                    match &p.symbols {
                        PartitionSymbols::V3(h) => p.encode_v3(h, &mut section),
                        _ => p.encode_v3(&PartitionHeaderV3::default(), &mut section),
                    }
                }
            }
        }

        let mut b = Vec::with_capacity(DATA_OFFSET + section.len() + CHECKSUM_SIZE);
        self.header.encode(&mut b);
        TocEntry {
            size: section.len() as u64,
            offset: DATA_OFFSET as u64,
        }
        .encode(&mut b);
        b.extend_from_slice(&section);
        let crc = crc32c(&b);
        b.extend_from_slice(&crc.to_be_bytes());
        b
    }
}

/// V1 indexes are a flat array of chunk headers; consecutive chunks of the
/// same partition make up one partition.
fn decode_v1(data: &[u8]) -> Result<Vec<PartitionHeader>, FormatError> {
    if data.len() % StacktraceBlockHeader::SIZE != 0 {
        return Err(FormatError::InvalidSize);
    }
    let mut partitions: Vec<PartitionHeader> = Vec::new();
    for b in data.chunks_exact(StacktraceBlockHeader::SIZE) {
        let chunk = StacktraceBlockHeader::decode(b)?;
        match partitions.last_mut() {
            Some(p) if p.partition == chunk.partition => p.stacktraces.push(chunk),
            _ => partitions.push(PartitionHeader {
                partition: chunk.partition,
                stacktraces: vec![chunk],
                symbols: PartitionSymbols::None,
            }),
        }
    }
    Ok(partitions)
}

fn decode_partitions(
    data: &[u8],
    decode: impl Fn(&[u8]) -> Result<(PartitionHeader, usize), FormatError>,
) -> Result<Vec<PartitionHeader>, FormatError> {
    if data.len() < 4 {
        return Err(FormatError::InvalidSize);
    }
    let n = BigEndian::read_u32(&data[0..4]) as usize;
    // Every partition header takes at least 12 bytes.
    let mut partitions = Vec::with_capacity(n.min(data.len() / 12));
    let mut pos = 4;
    for _ in 0..n {
        let (p, size) = decode(&data[pos..])?;
        partitions.push(p);
        pos += size;
    }
    if pos != data.len() {
        return Err(FormatError::Malformed("trailing bytes after partition headers"));
    }
    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ChunkEncoding, RowRangeReference, SymbolsBlockHeader, SymbolsFormat};

    fn chunk(offset: u64, size: u64) -> StacktraceBlockHeader {
        StacktraceBlockHeader {
            offset,
            size,
            encoding: ChunkEncoding::GroupVarint,
            stacktraces: 2,
            nodes: 4,
            max_depth: 3,
            crc: 7,
            ..Default::default()
        }
    }

    fn v3_partition(partition: u64) -> PartitionHeader {
        let symbols = |format| SymbolsBlockHeader {
            format,
            ..Default::default()
        };
        PartitionHeader {
            partition,
            stacktraces: vec![chunk(0, 10), chunk(10, 20)],
            symbols: PartitionSymbols::V3(PartitionHeaderV3 {
                locations: symbols(SymbolsFormat::Locations),
                mappings: symbols(SymbolsFormat::Mappings),
                functions: symbols(SymbolsFormat::Functions),
                strings: symbols(SymbolsFormat::Strings),
            }),
        }
    }

    #[test]
    fn v3_round_trip() {
        let index = IndexFile::new(FormatVersion::V3, vec![v3_partition(1), v3_partition(2)]);
        let b = index.encode();
        assert_eq!(&b[0..4], b"sym1");
        // TOC: size, then offset 32.
        assert_eq!(BigEndian::read_u64(&b[24..32]), 32);
        assert_eq!(IndexFile::decode(&b), Ok(index));
    }

    #[test]
    fn v2_round_trip() {
        let partition = PartitionHeader {
            partition: 3,
            stacktraces: vec![chunk(0, 100)],
            symbols: PartitionSymbols::V2(PartitionHeaderV2 {
                locations: vec![RowRangeReference {
                    row_group: 0,
                    index: 0,
                    rows: 10,
                }],
                ..Default::default()
            }),
        };
        let index = IndexFile::new(FormatVersion::V2, vec![partition]);
        assert_eq!(IndexFile::decode(&index.encode()), Ok(index));
    }

    #[test]
    fn v1_groups_chunks_by_partition() {
        let partitions = vec![
            PartitionHeader {
                partition: 5,
                stacktraces: vec![chunk(0, 10), chunk(10, 10)],
                symbols: PartitionSymbols::None,
            },
            PartitionHeader {
                partition: 6,
                stacktraces: vec![chunk(20, 10)],
                symbols: PartitionSymbols::None,
            },
        ];
        let b = IndexFile::new(FormatVersion::V1, partitions).encode();
        assert_eq!(b.len(), DATA_OFFSET + 3 * StacktraceBlockHeader::SIZE + CHECKSUM_SIZE);
        let index = IndexFile::decode(&b).unwrap();
        assert_eq!(index.partitions.len(), 2);
        assert_eq!(index.partitions[0].partition, 5);
        assert_eq!(index.partitions[0].stacktraces.len(), 2);
        assert_eq!(index.partitions[0].stacktraces[1].block_index, 1);
        assert_eq!(index.partitions[0].stacktraces[1].partition, 5);
        assert_eq!(index.partitions[1].stacktraces[0].offset, 20);
    }

    #[test]
    fn any_flipped_byte_is_detected() {
        let b = IndexFile::new(FormatVersion::V3, vec![v3_partition(1)]).encode();
        for i in 0..b.len() {
            let mut corrupted = b.clone();
            corrupted[i] ^= 0x10;
            assert_eq!(IndexFile::decode(&corrupted), Err(FormatError::InvalidCrc));
        }
        assert_eq!(IndexFile::decode(&b[..20]), Err(FormatError::InvalidSize));
    }

    #[test]
    fn fuzz_decode_never_panics() {
        bolero::check!().with_type::<Vec<u8>>().for_each(|bytes| {
            let _ = IndexFile::decode(bytes);
        });
    }
}
