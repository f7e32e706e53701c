// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The on-disk layout of a symbol database.
//!
//! Since V3 the database is a single file made of three sections:
//!
//! ```text
//! [Data  ] partitions: stack trace chunks and symbol tables
//! [Index ] IndexHeader, TOC, partition headers, CRC32C
//! [Footer] locates the index within the file
//! ```
//!
//! V1 and V2 databases keep the index in a file of its own, `index.symdb`,
//! and the stack trace chunks in `stacktraces.symdb`. They can be read but
//! are never written.
//!
//! Integers are big-endian unless noted otherwise.

mod headers;
mod index;

pub use headers::*;
pub use index::*;

use crate::FormatError;
use byteorder::{BigEndian, ByteOrder};

/// File name of a V3 database.
pub const DEFAULT_FILE_NAME: &str = "symbols.symdb";
/// Directory of the pre-V3 files within a block.
pub const DEFAULT_DIR_NAME: &str = "symbols";
pub const INDEX_FILE_NAME: &str = "index.symdb";
pub const STACKTRACES_FILE_NAME: &str = "stacktraces.symdb";

pub const MAGIC: [u8; 4] = *b"sym1";
pub const CHECKSUM_SIZE: usize = 4;

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum FormatVersion {
    V1 = 1,
    V2 = 2,
    #[default]
    V3 = 3,
}

impl TryFrom<u32> for FormatVersion {
    type Error = FormatError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            3 => Ok(Self::V3),
            v => Err(FormatError::UnknownVersion(v)),
        }
    }
}

impl From<FormatVersion> for u32 {
    fn from(v: FormatVersion) -> Self {
        v as u32
    }
}

/// The 16-byte header opening the index: magic, version and 8 reserved
/// bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IndexHeader {
    pub version: FormatVersion,
}

impl IndexHeader {
    pub const SIZE: usize = 16;

    pub fn encode(&self, dst: &mut Vec<u8>) {
        let mut b = [0u8; Self::SIZE];
        b[0..4].copy_from_slice(&MAGIC);
        BigEndian::write_u32(&mut b[4..8], self.version.into());
        dst.extend_from_slice(&b);
    }

    pub fn decode(b: &[u8]) -> Result<Self, FormatError> {
        if b.len() != Self::SIZE {
            return Err(FormatError::InvalidSize);
        }
        if b[0..4] != MAGIC {
            return Err(FormatError::InvalidMagic);
        }
        let version = FormatVersion::try_from(BigEndian::read_u32(&b[4..8]))?;
        Ok(Self { version })
    }
}

/// The 24-byte trailer of a V3 file: magic, version, index offset, 4
/// reserved bytes and the CRC32C of the first 20 bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Footer {
    pub version: FormatVersion,
    pub index_offset: u64,
}

impl Footer {
    pub const SIZE: usize = 24;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..4].copy_from_slice(&MAGIC);
        BigEndian::write_u32(&mut b[4..8], self.version.into());
        BigEndian::write_u64(&mut b[8..16], self.index_offset);
        let crc = crate::codec::crc32c(&b[0..20]);
        BigEndian::write_u32(&mut b[20..24], crc);
        b
    }

    pub fn decode(b: &[u8]) -> Result<Self, FormatError> {
        if b.len() != Self::SIZE {
            return Err(FormatError::InvalidSize);
        }
        if b[0..4] != MAGIC {
            return Err(FormatError::InvalidMagic);
        }
        let version = FormatVersion::try_from(BigEndian::read_u32(&b[4..8]))?;
        let index_offset = BigEndian::read_u64(&b[8..16]);
        if crate::codec::crc32c(&b[0..20]) != BigEndian::read_u32(&b[20..24]) {
            return Err(FormatError::InvalidCrc);
        }
        Ok(Self {
            version,
            index_offset,
        })
    }
}

/// A table of contents entry. The offset is relative to the start of the
/// index.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TocEntry {
    pub size: u64,
    pub offset: u64,
}

impl TocEntry {
    pub const SIZE: usize = 16;

    pub fn encode(&self, dst: &mut Vec<u8>) {
        let mut b = [0u8; Self::SIZE];
        BigEndian::write_u64(&mut b[0..8], self.size);
        BigEndian::write_u64(&mut b[8..16], self.offset);
        dst.extend_from_slice(&b);
    }

    pub fn decode(b: &[u8]) -> Result<Self, FormatError> {
        if b.len() < Self::SIZE {
            return Err(FormatError::InvalidSize);
        }
        Ok(Self {
            size: BigEndian::read_u64(&b[0..8]),
            offset: BigEndian::read_u64(&b[8..16]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_round_trip() {
        let footer = Footer {
            version: FormatVersion::V3,
            index_offset: 0xdead_beef,
        };
        let b = footer.encode();
        assert_eq!(&b[0..4], b"sym1");
        assert_eq!(&b[16..20], &[0, 0, 0, 0]);
        assert_eq!(Footer::decode(&b), Ok(footer));
    }

    #[test]
    fn footer_errors() {
        let b = Footer {
            version: FormatVersion::V3,
            index_offset: 42,
        }
        .encode();
        assert_eq!(Footer::decode(&b[1..]), Err(FormatError::InvalidSize));

        let mut bad = b;
        bad[0] = b'x';
        assert_eq!(Footer::decode(&bad), Err(FormatError::InvalidMagic));

        let mut bad = b;
        bad[7] = 9;
        assert_eq!(Footer::decode(&bad), Err(FormatError::UnknownVersion(9)));

        let mut bad = b;
        bad[10] ^= 1;
        assert_eq!(Footer::decode(&bad), Err(FormatError::InvalidCrc));
    }

    #[test]
    fn index_header_rejects_unknown_version() {
        let mut b = Vec::new();
        IndexHeader {
            version: FormatVersion::V2,
        }
        .encode(&mut b);
        assert_eq!(b.len(), IndexHeader::SIZE);
        assert_eq!(
            IndexHeader::decode(&b).map(|h| h.version),
            Ok(FormatVersion::V2)
        );
        BigEndian::write_u32(&mut b[4..8], 0);
        assert_eq!(IndexHeader::decode(&b), Err(FormatError::UnknownVersion(0)));
    }

    #[test]
    fn version_serde() {
        let v: FormatVersion = serde_json::from_str("3").unwrap();
        assert_eq!(v, FormatVersion::V3);
        assert_eq!(serde_json::to_string(&FormatVersion::V1).unwrap(), "1");
        assert!(serde_json::from_str::<FormatVersion>("4").is_err());
    }
}
