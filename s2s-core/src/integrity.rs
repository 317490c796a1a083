//! Integrity: running CRC-32 over the uncompressed frame stream, and the
//! comparison against the checksum the server reports on confirm.

use std::io::{self, Write};

use crc32fast::Hasher;

use crate::error::{Error, Result};

/// CRC-32 of a complete byte sequence.
pub fn checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Writer that accumulates a CRC-32 of every byte accepted by the inner writer.
///
/// Sits above any compression layer so the checksum always covers the
/// uncompressed bytes.
pub struct ChecksumWriter<W> {
    inner: W,
    hasher: Hasher,
    bytes_written: u64,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
            bytes_written: 0,
        }
    }

    /// CRC of everything written so far.
    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Parse the confirm response body: one decimal integer, surrounding
/// whitespace allowed.
pub fn parse_server_checksum(body: &str) -> Result<u64> {
    let trimmed = body.trim();
    trimmed
        .parse::<u64>()
        .map_err(|_| Error::Protocol(format!("unparseable checksum {trimmed:?}")))
}

/// Compare the local CRC with the server's report.
pub fn verify_checksum(local: u32, server: u64) -> Result<()> {
    if u64::from(local) == server {
        Ok(())
    } else {
        Err(Error::Integrity { local, server })
    }
}
