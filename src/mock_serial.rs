//! Scripted mock transport emulating an openDAQ device, used in unit tests.
//!
//! The mock parses every command packet the driver writes and queues the
//! matching response, so the full driver stack (codec, calibration load,
//! registry, run-state machine, background reader) can be exercised without
//! hardware. Streaming data and device-initiated stops are injected by the
//! test through a cloned handle.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::codec::{self, Command};
use crate::frame::{ESCAPE, SYNC};

/// Build the on-wire bytes of one streaming data frame, escaping where
/// needed. `delta` shifts the declared checksum to forge corrupt frames.
pub(crate) fn encode_frame_with(channel: u8, samples: &[i16], delta: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        body.extend_from_slice(&s.to_be_bytes());
    }

    let mut header = [0u8; 8];
    header[2] = 25; // stream data opcode; anything but the stop opcode
    header[3] = (body.len() + 4) as u8;
    header[4] = channel;
    let sum: u32 = header[2..]
        .iter()
        .chain(body.iter())
        .map(|&b| u32::from(b))
        .sum();
    let declared = (sum as u16).wrapping_add(delta);
    header[..2].copy_from_slice(&declared.to_be_bytes());

    let mut out = vec![SYNC];
    for &b in header.iter().chain(body.iter()) {
        if b == SYNC || b == ESCAPE {
            out.push(ESCAPE);
            out.push(b ^ 0x20);
        } else {
            out.push(b);
        }
    }
    out
}

/// Well-formed streaming frame for a 1-based channel.
pub(crate) fn encode_frame(channel: u8, samples: &[i16]) -> Vec<u8> {
    encode_frame_with(channel, samples, 0)
}

struct Inner {
    /// Bytes the driver will read next.
    rx: VecDeque<u8>,
    /// Partially received command bytes.
    pending: Vec<u8>,
    /// Opcode of every complete command received, in order.
    ops: Vec<u8>,
    model_id: u8,
    fw_ver: u8,
    device_id: u32,
    /// Raw value answered to ADC reads.
    adc_raw: i16,
    /// Raw calibration pair answered for every slot.
    cal: (i16, i16),
    last_dac_raw: Option<i16>,
    eeprom: [u8; 254],
    /// Corrupt the response of this many upcoming stop commands.
    fail_stops: usize,
}

impl Inner {
    fn ingest(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        loop {
            if self.pending.len() < 4 {
                return;
            }
            let total = 4 + self.pending[3] as usize;
            if self.pending.len() < total {
                return;
            }
            let packet: Vec<u8> = self.pending.drain(..total).collect();
            self.respond(&packet);
        }
    }

    fn respond(&mut self, packet: &[u8]) {
        let op = packet[2];
        let args = &packet[4..];
        self.ops.push(op);

        let response = match op {
            codec::CMD_ID_CONFIG => Command::new(op)
                .u8(self.model_id)
                .u8(self.fw_ver)
                .u32(self.device_id)
                .finish(),
            codec::CMD_CALIB_READ => Command::new(op)
                .u8(args[0])
                .i16(self.cal.0)
                .i16(self.cal.1)
                .finish(),
            codec::CMD_READ_ADC => Command::new(op).i16(self.adc_raw).finish(),
            codec::CMD_CONF_ADC => Command::new(op)
                .i16(self.adc_raw)
                .u8(args[0])
                .u8(args[1])
                .u8(args[2])
                .u8(args[3])
                .finish(),
            codec::CMD_READ_ALL => {
                let mut cmd = Command::new(op);
                for _ in 0..8 {
                    cmd = cmd.i16(self.adc_raw);
                }
                cmd.finish()
            }
            codec::CMD_SET_DAC => {
                self.last_dac_raw = Some(i16::from_be_bytes([args[0], args[1]]));
                packet.to_vec()
            }
            codec::CMD_EEPROM_READ => {
                let pos = usize::from(args[0]);
                Command::new(op).u8(args[0]).u8(1).u8(self.eeprom[pos]).finish()
            }
            codec::CMD_EEPROM_WRITE => {
                let pos = usize::from(args[0]);
                self.eeprom[pos] = args[2];
                packet.to_vec()
            }
            codec::CMD_SIGNAL_LOAD => Command::new(op).u8(0).i16(0).finish(),
            codec::CMD_CAPTURE_GET => Command::new(op).u8(args[0]).u16(0).finish(),
            codec::CMD_COUNTER_GET
            | codec::CMD_ENCODER_GET
            | codec::CMD_TRIGGER_MODE
            | codec::CMD_CHANNEL_STATE => Command::new(op).u16(0).finish(),
            codec::CMD_STOP => {
                if self.fail_stops > 0 {
                    self.fail_stops -= 1;
                    // a response whose checksum never matches
                    vec![0xFF, 0xFF, codec::CMD_STOP, 0x00]
                } else {
                    packet.to_vec()
                }
            }
            // Commands whose response echoes the request byte-for-byte.
            _ => packet.to_vec(),
        };
        self.rx.extend(response);
    }
}

/// Cloneable handle over the shared mock state; one clone goes into the
/// driver as its transport, the test keeps another to inject data and
/// inspect traffic.
#[derive(Clone)]
pub(crate) struct MockSerial {
    inner: Arc<Mutex<Inner>>,
}

impl MockSerial {
    pub fn new(model_id: u8, fw_ver: u8, device_id: u32) -> Self {
        MockSerial {
            inner: Arc::new(Mutex::new(Inner {
                rx: VecDeque::new(),
                pending: Vec::new(),
                ops: Vec::new(),
                model_id,
                fw_ver,
                device_id,
                adc_raw: 0,
                cal: (0, 0),
                last_dac_raw: None,
                eeprom: [0xFF; 254],
                fail_stops: 0,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Queue a streaming data frame for a 1-based channel.
    pub fn push_frame(&self, channel: u8, samples: &[i16]) {
        self.lock().rx.extend(encode_frame(channel, samples));
    }

    /// Queue a streaming frame whose checksum does not match.
    pub fn push_corrupted_frame(&self, channel: u8, samples: &[i16]) {
        self.lock().rx.extend(encode_frame_with(channel, samples, 1));
    }

    /// Queue a device-initiated stop notification for a 1-based channel.
    pub fn push_stop(&self, channel: u8) {
        self.lock()
            .rx
            .extend([SYNC, 0, 0, codec::CMD_STOP, codec::CMD_STOP, channel]);
    }

    pub fn rx_empty(&self) -> bool {
        self.lock().rx.is_empty()
    }

    pub fn op_log(&self) -> Vec<u8> {
        self.lock().ops.clone()
    }

    pub fn set_adc_raw(&self, raw: i16) {
        self.lock().adc_raw = raw;
    }

    pub fn last_dac_raw(&self) -> Option<i16> {
        self.lock().last_dac_raw
    }

    pub fn fail_next_stops(&self, n: usize) {
        self.lock().fail_stops = n;
    }
}

impl Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.lock();
        if inner.rx.is_empty() {
            drop(inner);
            // emulate the serial read timeout without spinning the reader
            thread::sleep(Duration::from_millis(1));
            return Err(io::Error::new(ErrorKind::TimedOut, "mock read timeout"));
        }
        let n = buf.len().min(inner.rx.len());
        for slot in buf[..n].iter_mut() {
            *slot = inner.rx.pop_front().unwrap_or_default();
        }
        Ok(n)
    }
}

impl Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().ingest(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
