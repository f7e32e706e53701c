// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;

/// CRC32 with the Castagnoli polynomial, as used by every checksum of the
/// block format.
#[inline]
pub fn crc32c(buf: &[u8]) -> u32 {
    crc32c::crc32c(buf)
}

/// Incrementally computed CRC32-Castagnoli.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Crc32c(u32);

impl Crc32c {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn update(&mut self, buf: &[u8]) {
        self.0 = crc32c::crc32c_append(self.0, buf);
    }

    #[inline]
    pub fn finish(&self) -> u32 {
        self.0
    }
}

/// A writer that forwards everything to `inner` while counting the bytes
/// written and their checksum.
pub struct ChecksumWriter<W> {
    inner: W,
    crc: Crc32c,
    written: u64,
}

impl<W: io::Write> ChecksumWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            crc: Crc32c::new(),
            written: 0,
        }
    }

    pub fn crc(&self) -> u32 {
        self.crc.finish()
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Starts a new checksum and byte count without touching the inner
    /// writer.
    pub fn reset(&mut self) {
        self.crc = Crc32c::new();
        self.written = 0;
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: io::Write> io::Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn known_vector() {
        // RFC 3720, B.4: 32 bytes of zeroes.
        assert_eq!(crc32c(&[0u8; 32]), 0x8a9136aa);
        assert_eq!(crc32c(b"123456789"), 0xe3069283);
    }

    #[test]
    fn incremental_matches_oneshot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut crc = Crc32c::new();
        for chunk in data.chunks(7) {
            crc.update(chunk);
        }
        assert_eq!(crc.finish(), crc32c(data));
    }

    #[test]
    fn checksum_writer_tracks_bytes() {
        let mut w = ChecksumWriter::new(Vec::new());
        w.write_all(b"123").unwrap();
        w.write_all(b"456789").unwrap();
        assert_eq!(w.written(), 9);
        assert_eq!(w.crc(), 0xe3069283);
        w.reset();
        assert_eq!(w.written(), 0);
        assert_eq!(w.into_inner(), b"123456789");
    }
}
