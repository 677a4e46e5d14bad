//! Streaming-frame parser.
//!
//! While measuring, the device pushes data frames asynchronously over the
//! serial line. A frame starts with the sync byte `0x7E`, followed by an
//! 8-byte header and a body; any header or body byte equal to `0x7D` marks
//! an escape: the next byte is OR-ed with `0x20` to recover the original
//! value. The third header byte distinguishes a device-initiated stop
//! notification (two extra raw bytes: opcode echo + 1-based channel id)
//! from a normal data frame. In a data frame the body holds
//! `header[3] - 4` bytes of big-endian signed 16-bit samples, all destined
//! for the channel `header[4] - 1`.
//!
//! One call to [`read_event`] consumes at most one frame. The byte source is
//! expected to use a bounded read timeout: no byte at frame start yields
//! [`StreamEvent::Empty`] so the caller can observe state changes, while a
//! source that stalls in the middle of a frame is a timeout error and the
//! caller resynchronizes at the next sync byte.

use std::io::{ErrorKind, Read};

use crate::codec::{self, CMD_STOP};
use crate::errors::{DaqError, Result};

/// Frame sync byte.
pub const SYNC: u8 = 0x7E;
/// Escape prefix; the byte that follows is OR-ed with 0x20.
pub const ESCAPE: u8 = 0x7D;

/// Outcome of one parser invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// No data available this call; the caller should yield.
    Empty,
    /// One data frame fully parsed.
    Frame {
        /// Destination channel, 0-based.
        channel: u8,
        /// Decoded samples, in arrival order.
        samples: Vec<i16>,
        /// Whether the frame checksum matched. Samples are delivered either
        /// way; a mismatch is the caller's retry/accounting decision.
        crc_ok: bool,
    },
    /// A single byte that was not a frame start.
    Stray(u8),
    /// Device-initiated stop for a channel (0-based).
    Stop { channel: u8 },
}

/// Read a byte, treating a timeout or empty read as "no data".
fn read_optional(src: &mut impl Read) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    match src.read(&mut byte) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(byte[0])),
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Read a byte that must arrive: inside a frame, bytes follow back-to-back
/// at line rate, so an empty read here means the stream stalled.
fn read_required(src: &mut impl Read) -> Result<u8> {
    match read_optional(src)? {
        Some(b) => Ok(b),
        None => Err(DaqError::Timeout("stream stalled mid-frame")),
    }
}

/// Read the next frame byte, resolving the escape prefix.
fn read_unescaped(src: &mut impl Read) -> Result<u8> {
    let byte = read_required(src)?;
    if byte == ESCAPE {
        Ok(read_required(src)? | 0x20)
    } else {
        Ok(byte)
    }
}

/// Pull the next unit of streaming data out of `src`.
pub fn read_event(src: &mut impl Read) -> Result<StreamEvent> {
    let first = match read_optional(src)? {
        None => return Ok(StreamEvent::Empty),
        Some(b) => b,
    };
    if first != SYNC {
        return Ok(StreamEvent::Stray(first));
    }

    let mut header = [0u8; 8];
    for i in 0..8 {
        header[i] = read_unescaped(src)?;
        if i == 2 && header[2] == CMD_STOP {
            // Stop sub-frame: opcode echo plus the 1-based channel id,
            // transmitted unescaped.
            let _opcode = read_required(src)?;
            let channel = read_required(src)?;
            return Ok(StreamEvent::Stop {
                channel: channel.wrapping_sub(1),
            });
        }
    }

    let body_len = (header[3] as usize).saturating_sub(4);
    let mut body = Vec::with_capacity(body_len);
    while body.len() < body_len {
        body.push(read_unescaped(src)?);
    }

    let mut samples = Vec::with_capacity(body_len / 2);
    for pair in body.chunks_exact(2) {
        samples.push(i16::from_be_bytes([pair[0], pair[1]]));
    }

    Ok(StreamEvent::Frame {
        channel: header[4].wrapping_sub(1),
        samples,
        crc_ok: codec::check_stream_crc(&header, &body),
    })
}
