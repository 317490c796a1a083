//! Framing of data packets on the flow-file stream (all integers big-endian):
//!
//! `[attr count:4] ([key len:4][key][value len:4][value])* [payload len:8][payload]`
//!
//! Packets of one transaction are written back to back on the same stream.

use std::io::{self, Read, Write};

use crate::error::{Error, Result};
use crate::packet::DataPacket;

/// Write one framed packet. Returns the payload bytes written.
pub fn write_packet<W: Write + ?Sized>(w: &mut W, packet: &dyn DataPacket) -> Result<u64> {
    let attributes = packet.attributes();
    write_len(w, attributes.len())?;
    for (key, value) in attributes {
        write_string(w, key)?;
        write_string(w, value)?;
    }

    let size = packet.size();
    w.write_all(&size.to_be_bytes()).map_err(Error::from_io)?;

    let stream = packet.open_stream().map_err(Error::from_io)?;
    let copied = io::copy(&mut stream.take(size), w).map_err(Error::from_io)?;
    if copied != size {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("packet stream ended after {copied} of {size} bytes"),
        )));
    }
    Ok(size)
}

/// Frame a packet into a fresh buffer.
pub fn encode_packet(packet: &dyn DataPacket) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_packet(&mut out, packet)?;
    Ok(out)
}

fn write_len<W: Write + ?Sized>(w: &mut W, len: usize) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| Error::Protocol(format!("field length {len} exceeds 32 bits")))?;
    w.write_all(&len.to_be_bytes()).map_err(Error::from_io)
}

fn write_string<W: Write + ?Sized>(w: &mut W, s: &str) -> Result<()> {
    write_len(w, s.len())?;
    w.write_all(s.as_bytes()).map_err(Error::from_io)
}
