//! Command/response packet codec for the openDAQ wire protocol.
//!
//! Every command and response shares the same shape:
//!
//! ```text
//! [checksum:2][opcode:1][body_len:1][args: body_len bytes]
//! ```
//!
//! The checksum is `sum(opcode..args) mod 65536`, big-endian. Responses are
//! validated against the architecture-fixed length expected for the request
//! before any field is interpreted; a corrupt packet is always rejected,
//! never partially decoded. The firmware answers an invalid command with a
//! fixed NAK packet (opcode 160, empty body).

use crate::errors::{DaqError, Result};

// ============================================================================
// Command opcodes
// ============================================================================

// Opcode values are fixed by the firmware and must not be changed.
pub const CMD_READ_ADC: u8 = 1;
pub const CMD_CONF_ADC: u8 = 2;
pub const CMD_SET_PIO: u8 = 3;
pub const CMD_READ_ALL: u8 = 4;
pub const CMD_SET_PIO_DIR: u8 = 5;
pub const CMD_SET_PORT: u8 = 7;
pub const CMD_SET_PORT_DIR: u8 = 9;
pub const CMD_PWM_INIT: u8 = 10;
pub const CMD_PWM_STOP: u8 = 11;
pub const CMD_SET_DAC: u8 = 13;
pub const CMD_CAPTURE_INIT: u8 = 14;
pub const CMD_CAPTURE_STOP: u8 = 15;
pub const CMD_CAPTURE_GET: u8 = 16;
pub const CMD_SET_LED: u8 = 18;
pub const CMD_STREAM_CREATE: u8 = 19;
pub const CMD_EXTERNAL_CREATE: u8 = 20;
pub const CMD_BURST_CREATE: u8 = 21;
pub const CMD_CHANNEL_CFG: u8 = 22;
pub const CMD_SIGNAL_LOAD: u8 = 23;
pub const CMD_SPI_CONFIG: u8 = 26;
pub const CMD_SPI_SETUP: u8 = 28;
pub const CMD_SPI_TRANSFER: u8 = 29;
pub const CMD_EEPROM_WRITE: u8 = 30;
pub const CMD_EEPROM_READ: u8 = 31;
pub const CMD_POINTS_CFG: u8 = 32;
pub const CMD_TRIGGER_SETUP: u8 = 33;
pub const CMD_TRIGGER_MODE: u8 = 34;
pub const CMD_CHANNEL_STATE: u8 = 35;
pub const CMD_CALIB_READ: u8 = 36;
pub const CMD_CALIB_WRITE: u8 = 37;
pub const CMD_ID_CONFIG: u8 = 39;
pub const CMD_COUNTER_INIT: u8 = 41;
pub const CMD_COUNTER_GET: u8 = 42;
pub const CMD_CHANNEL_FLUSH: u8 = 45;
pub const CMD_ENCODER_INIT: u8 = 50;
pub const CMD_ENCODER_STOP: u8 = 51;
pub const CMD_ENCODER_GET: u8 = 52;
pub const CMD_ENABLE_CRC: u8 = 55;
pub const CMD_CHANNEL_DESTROY: u8 = 57;
pub const CMD_RUN: u8 = 64;
pub const CMD_STOP: u8 = 80;
pub const CMD_NAK: u8 = 160;

/// The fixed NAK packet: checksum 0x00A0, opcode 160, empty body.
pub const NAK_PACKET: [u8; 4] = [0x00, 0xA0, 0xA0, 0x00];

// ============================================================================
// Checksums
// ============================================================================

/// Checksum of a packet payload: the byte sum modulo 65536.
pub fn checksum(data: &[u8]) -> u16 {
    data.iter().map(|&b| u32::from(b)).sum::<u32>() as u16
}

/// Validate the checksum of a complete packet and return its payload
/// (opcode + length byte + args).
pub fn check_crc(packet: &[u8]) -> Result<&[u8]> {
    if packet.len() < 4 {
        return Err(DaqError::Length {
            expected: 4,
            actual: packet.len(),
        });
    }
    let declared = u16::from_be_bytes([packet[0], packet[1]]);
    let payload = &packet[2..];
    if declared != checksum(payload) {
        return Err(DaqError::Checksum);
    }
    Ok(payload)
}

/// Checksum check for a streaming frame: `header[0..2]` (big-endian) against
/// the sum of the remaining header bytes plus the body.
pub fn check_stream_crc(header: &[u8; 8], body: &[u8]) -> bool {
    let declared = u16::from_be_bytes([header[0], header[1]]);
    let sum = header[2..]
        .iter()
        .chain(body.iter())
        .map(|&b| u32::from(b))
        .sum::<u32>();
    declared == sum as u16
}

// ============================================================================
// Command building
// ============================================================================

/// Builder for an outgoing command packet.
///
/// Arguments are appended in the fixed big-endian layout of the opcode; the
/// body length and checksum are filled in by [`Command::finish`]. Packets are
/// immutable once built and sent verbatim.
pub struct Command {
    body: Vec<u8>,
}

impl Command {
    pub fn new(opcode: u8) -> Self {
        // opcode + length placeholder; args follow
        Command {
            body: vec![opcode, 0],
        }
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.body.push(v);
        self
    }

    pub fn u16(mut self, v: u16) -> Self {
        self.body.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn i16(mut self, v: i16) -> Self {
        self.body.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.body.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Finalize the packet: fill in the body length and prepend the checksum.
    pub fn finish(mut self) -> Vec<u8> {
        self.body[1] = (self.body.len() - 2) as u8;
        let mut packet = Vec::with_capacity(self.body.len() + 2);
        packet.extend_from_slice(&checksum(&self.body).to_be_bytes());
        packet.extend_from_slice(&self.body);
        packet
    }
}

// ============================================================================
// Response decoding
// ============================================================================

/// Validate a complete response packet and return its argument bytes.
///
/// `body_len` is the architecture-fixed argument length expected for the
/// request. Checks performed, in order: NAK sentinel, total packet length,
/// checksum, declared body length field.
pub fn decode_response(packet: &[u8], body_len: usize) -> Result<&[u8]> {
    if packet == NAK_PACKET {
        return Err(DaqError::Rejected);
    }
    let expected = body_len + 4;
    if packet.len() != expected {
        return Err(DaqError::Length {
            expected,
            actual: packet.len(),
        });
    }
    let payload = check_crc(packet)?;
    if payload[1] as usize != body_len {
        return Err(DaqError::Length {
            expected: body_len,
            actual: payload[1] as usize,
        });
    }
    Ok(&payload[2..])
}

/// Sequential big-endian reader over the argument bytes of a validated
/// response.
pub struct Payload<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Payload<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Payload { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(DaqError::Length {
                expected: self.pos + n,
                actual: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn i16(&mut self) -> Result<i16> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Hexdump helper for protocol debug logging.
pub fn to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_layout() {
        // create-stream for channel 2 at 500 ms: opcode, len=3, u8, u16
        let packet = Command::new(CMD_STREAM_CREATE).u8(2).u16(500).finish();
        assert_eq!(packet.len(), 7);
        assert_eq!(&packet[2..], &[19, 3, 2, 0x01, 0xF4]);
        let declared = u16::from_be_bytes([packet[0], packet[1]]);
        assert_eq!(declared, checksum(&packet[2..]));
    }

    #[test]
    fn empty_body_command() {
        let packet = Command::new(CMD_RUN).finish();
        assert_eq!(packet, vec![0x00, 0x40, 64, 0]);
    }

    #[test]
    fn nak_packet_matches_builder() {
        let packet = Command::new(CMD_NAK).finish();
        assert_eq!(packet, NAK_PACKET);
    }

    #[test]
    fn roundtrip_recovers_arguments() {
        let packet = Command::new(CMD_TRIGGER_SETUP).u8(3).u8(1).u16(0xABCD).finish();
        let mut payload = Payload::new(decode_response(&packet, 4).unwrap());
        assert_eq!(payload.u8().unwrap(), 3);
        assert_eq!(payload.u8().unwrap(), 1);
        assert_eq!(payload.u16().unwrap(), 0xABCD);
    }

    #[test]
    fn signed_and_wide_fields() {
        let packet = Command::new(CMD_SET_DAC).i16(-1234).u8(1).finish();
        let mut payload = Payload::new(decode_response(&packet, 3).unwrap());
        assert_eq!(payload.i16().unwrap(), -1234);
        assert_eq!(payload.u8().unwrap(), 1);

        let packet = Command::new(CMD_ID_CONFIG).u32(999).finish();
        let mut payload = Payload::new(decode_response(&packet, 4).unwrap());
        assert_eq!(payload.u32().unwrap(), 999);
    }

    #[test]
    fn any_single_bit_flip_fails_checksum() {
        let packet = Command::new(CMD_CONF_ADC).u8(8).u8(0).u8(1).u8(20).finish();
        for byte in 0..packet.len() {
            for bit in 0..8 {
                let mut corrupt = packet.clone();
                corrupt[byte] ^= 1 << bit;
                let res = decode_response(&corrupt, 4);
                assert!(res.is_err(), "bit {bit} of byte {byte} accepted");
            }
        }
    }

    #[test]
    fn nak_is_rejected_before_decoding() {
        assert!(matches!(
            decode_response(&NAK_PACKET, 0),
            Err(DaqError::Rejected)
        ));
    }

    #[test]
    fn body_length_field_mismatch() {
        let mut packet = Command::new(CMD_SET_PIO).u8(1).u8(1).finish();
        // Forge a wrong length byte and fix the checksum so only the length
        // check can fail.
        packet[3] = 3;
        let crc = checksum(&packet[2..]).to_be_bytes();
        packet[0] = crc[0];
        packet[1] = crc[1];
        assert!(matches!(
            decode_response(&packet, 2),
            Err(DaqError::Length { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn truncated_packet_fails_length() {
        let packet = Command::new(CMD_READ_ADC).finish();
        assert!(matches!(
            decode_response(&packet, 2),
            Err(DaqError::Length { .. })
        ));
    }

    #[test]
    fn stream_crc_over_header_and_body() {
        let mut header = [0u8; 8];
        header[2] = 25;
        header[3] = 6;
        header[4] = 1;
        let body = [0x01, 0x02, 0x03];
        let sum: u32 = header[2..].iter().chain(body.iter()).map(|&b| u32::from(b)).sum();
        header[0] = (sum >> 8) as u8;
        header[1] = (sum & 0xFF) as u8;
        assert!(check_stream_crc(&header, &body));
        header[1] ^= 1;
        assert!(!check_stream_crc(&header, &body));
    }
}
