//! openDAQ device driver.
//!
//! This module owns the serial transport, the typed device commands, the
//! experiment registry and the acquisition run-state machine.
//!
//! # Acquisition model
//!
//! After `start()`, the device pushes data frames on its own schedule; a
//! background reader thread demultiplexes them into the per-experiment
//! sample buffers, converting raw ADC codes to volts with the unit's
//! calibration registers. The caller drains buffers at its leisure through
//! [`Experiment::read`]. Run state moves `Idle → Configured → Running →
//! Halted → Stopped`; `Halted` keeps the configuration and the reader alive
//! for another `start()`, `Stopped` is terminal for the session.
//!
//! # Control-plane retries
//!
//! While streaming, the response to a `stop` command can collide with data
//! frames still in flight, so its checksum check may fail. The stop command
//! is idempotent: on a checksum failure the driver flushes the input buffer
//! and retries until the device acknowledges, bounded by a generous
//! wall-clock deadline. Every other command failure propagates to the
//! caller, since resending a command with side effects is not safe.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;
use serialport::SerialPort;

use crate::codec::{self, Command, Payload};
use crate::errors::{DaqError, Result};
use crate::experiment::{
    lock, AnalogSetup, ExpMode, Experiment, ExperimentKind, SignalChunk, TriggerMode,
    TriggerSetup, MAX_SIGNAL_LEN,
};
use crate::frame::{self, StreamEvent};
use crate::model::{CalTarget, CalibReg, DaqModel};

// ============================================================================
// Constants
// ============================================================================

/// Serial baud rate of every openDAQ model.
const BAUD_RATE: u32 = 115_200;

/// Transport read timeout; bounds one reader-loop iteration so state
/// changes are observed promptly.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Overall deadline for a command response.
const RESPONSE_DEADLINE: Duration = Duration::from_secs(1);

/// Settle time after opening the port (the board resets on RTS toggling).
const OPEN_SETTLE: Duration = Duration::from_secs(2);

/// Delay before a calibration transfer.
const CALIBRATION_DELAY: Duration = Duration::from_millis(50);

/// Reader sleep while no experiment is running.
const IDLE_POLL: Duration = Duration::from_millis(200);

/// Reader backoff after a stream read error.
const READ_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Delay between attempts at an unacknowledged stop command.
const STOP_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Wall-clock bound on stop retries.
const STOP_DEADLINE: Duration = Duration::from_secs(30);

/// Settle time after halting, before the device takes new commands.
const HALT_SETTLE: Duration = Duration::from_secs(1);

/// Upper bound on one input-buffer flush.
const MAX_FLUSH: Duration = Duration::from_millis(200);

// ============================================================================
// Data Types
// ============================================================================

/// Acquisition run state. Transitions happen only through [`Daq`] methods;
/// the background reader observes it once per loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No experiments configured.
    Idle,
    /// Experiments registered, device not yet told to run.
    Configured,
    /// Device streaming, background reader collecting.
    Running,
    /// Reader idle, experiments retained; `start()` again to resume.
    Halted,
    /// Terminal for this session; experiments cleared.
    Stopped,
}

/// Identity block reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub hardware_id: u8,
    pub fw_ver: u8,
    pub device_id: u32,
}

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Trait for Read + Write + Send, allowing different transport backends.
pub trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

/// Fill `buf` completely, tolerating short timeout reads up to `deadline`.
fn read_exact_deadline(
    port: &mut dyn Transport,
    buf: &mut [u8],
    deadline: Duration,
) -> Result<()> {
    let start = Instant::now();
    let mut filled = 0;
    while filled < buf.len() {
        match port.read(&mut buf[filled..]) {
            Ok(0) => {}
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }
        if filled < buf.len() && start.elapsed() > deadline {
            return Err(DaqError::Timeout("no response from device"));
        }
    }
    Ok(())
}

/// Drain any pending input data.
fn flush_input(port: &mut dyn Transport) -> Result<()> {
    let mut buf = [0u8; 256];
    let start = Instant::now();
    let mut iterations = 0usize;
    loop {
        iterations += 1;
        match port.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::TimedOut => break,
            Err(e) => return Err(e.into()),
        }
        if iterations > 64 || start.elapsed() > MAX_FLUSH {
            break;
        }
    }
    Ok(())
}

// ============================================================================
// Shared driver state
// ============================================================================

/// State shared between the caller thread and the background reader.
struct Shared {
    port: Mutex<Box<dyn Transport>>,
    state: Mutex<RunState>,
    experiments: Mutex<Vec<Arc<Experiment>>>,
    model: Mutex<DaqModel>,
    /// Last `conf_adc` settings, used by `read_analog`.
    adc_setup: Mutex<AnalogSetup>,
    /// Streaming frames whose checksum did not match (samples are still
    /// delivered; this is the retry/accounting signal).
    stream_crc_errors: AtomicUsize,
}

/// Send one command packet and read back its fixed-size response.
/// The port lock is held across write and read, so command/response pairs
/// never interleave between threads.
fn transact(port: &Mutex<Box<dyn Transport>>, command: &[u8], body_len: usize) -> Result<Vec<u8>> {
    let mut port = lock(port);
    port.write_all(command)?;
    port.flush()?;

    let mut response = vec![0u8; body_len + 4];
    read_exact_deadline(port.as_mut(), &mut response, RESPONSE_DEADLINE)?;
    debug!("command:  {}", codec::to_hex(command));
    debug!("response: {}", codec::to_hex(&response));

    Ok(codec::decode_response(&response, body_len)?.to_vec())
}

/// Send the global stop command until the device acknowledges it.
///
/// Data frames still in flight can corrupt the response, so checksum
/// failures are retried after a flush. Bounded by [`STOP_DEADLINE`]; the
/// source of this driver retried forever, which can hang the caller when
/// the device is gone.
fn confirm_stop(shared: &Shared) -> Result<()> {
    let deadline = Instant::now() + STOP_DEADLINE;
    loop {
        match transact(&shared.port, &Command::new(codec::CMD_STOP).finish(), 0) {
            Ok(_) => return Ok(()),
            Err(DaqError::Checksum) | Err(DaqError::Timeout(_)) => {
                if Instant::now() > deadline {
                    return Err(DaqError::Timeout("stop command was never acknowledged"));
                }
                warn!("stop not acknowledged cleanly, retrying");
                thread::sleep(STOP_RETRY_DELAY);
                let mut port = lock(&shared.port);
                let _ = flush_input(port.as_mut());
            }
            Err(e) => return Err(e),
        }
    }
}

/// Destroy the firmware channel of every registered experiment, then drop
/// the records.
fn clear_experiments(shared: &Shared) -> Result<()> {
    let snapshot: Vec<Arc<Experiment>> = lock(&shared.experiments).clone();
    for exp in snapshot.iter().rev() {
        let cmd = Command::new(codec::CMD_CHANNEL_DESTROY)
            .u8(exp.number())
            .finish();
        transact(&shared.port, &cmd, 1)?;
    }
    lock(&shared.experiments).clear();
    Ok(())
}

// ============================================================================
// Background reader
// ============================================================================

/// Route the samples of one data frame into the owning experiment's buffer,
/// converted to volts with that channel's analog setup.
fn route_samples(shared: &Shared, channel: u8, samples: &[i16]) {
    let number = channel.wrapping_add(1);
    let exp = lock(&shared.experiments)
        .iter()
        .find(|e| e.number() == number)
        .cloned();
    let Some(exp) = exp else {
        warn!("dropping {} samples for unknown channel {number}", samples.len());
        return;
    };

    let setup = exp.analog_setup();
    let model = lock(&shared.model);
    for &raw in samples {
        match model.raw_to_volts(i32::from(raw), setup.gain, setup.pinput, setup.ninput) {
            Ok(volts) => exp.push_sample(volts),
            Err(e) => {
                warn!("sample conversion failed on channel {number}: {e}");
                break;
            }
        }
    }
}

/// Reader thread body: demultiplex streaming data while `Running`, idle
/// otherwise, exit on `Stopped`. Cancellation is cooperative, checked once
/// per iteration.
fn reader_loop(shared: Arc<Shared>) {
    debug!("background reader started");
    loop {
        let state = *lock(&shared.state);
        match state {
            RunState::Running => {
                let event = {
                    let mut port = lock(&shared.port);
                    frame::read_event(&mut *port)
                };
                match event {
                    Ok(StreamEvent::Empty) => {}
                    Ok(StreamEvent::Stray(byte)) => {
                        debug!("stray byte {byte:#04x} outside frame");
                    }
                    Ok(StreamEvent::Frame {
                        channel,
                        samples,
                        crc_ok,
                    }) => {
                        if !crc_ok {
                            shared.stream_crc_errors.fetch_add(1, Ordering::Relaxed);
                            warn!("stream frame checksum mismatch on channel {}", channel + 1);
                        }
                        route_samples(&shared, channel, &samples);
                    }
                    Ok(StreamEvent::Stop { channel }) => {
                        info!("device finished channel {}", channel + 1);
                        if let Err(e) = confirm_stop(&shared) {
                            warn!("failed to acknowledge device stop: {e}");
                        }
                        let mut st = lock(&shared.state);
                        if *st == RunState::Running {
                            *st = RunState::Halted;
                        }
                    }
                    Err(e) => {
                        warn!("stream read error: {e}");
                        thread::sleep(READ_RETRY_DELAY);
                    }
                }
            }
            RunState::Stopped => break,
            _ => thread::sleep(IDLE_POLL),
        }
    }
    debug!("background reader exiting");
}

// ============================================================================
// Daq driver
// ============================================================================

/// Driver for one openDAQ device.
///
/// # Example
/// ```ignore
/// let mut daq = Daq::open("/dev/ttyUSB0")?;
/// println!("connected to {} {}", daq.hw_ver(), daq.serial_str());
///
/// let stream = daq.create_stream(ExpMode::AnalogIn, 100, 0, true, 1000)?;
/// daq.analog_setup(&stream, AnalogSetup { pinput: 8, ..Default::default() })?;
///
/// daq.start()?;
/// thread::sleep(Duration::from_secs(1));
/// println!("collected: {:?}", stream.read());
/// daq.stop()?;
/// ```
pub struct Daq {
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
}

impl Daq {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Open a device on a serial port (e.g. `/dev/ttyUSB0`, `COM3`).
    pub fn open(path: &str) -> Result<Self> {
        let mut port = serialport::new(path, BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .open()?;
        port.write_request_to_send(false)?;
        // The board resets when the port toggles RTS; give it time to boot.
        thread::sleep(OPEN_SETTLE);
        Self::from_transport(Box::new(port))
    }

    /// Build a driver over an already-open byte transport.
    ///
    /// Reads the device identity, resolves the hardware model and loads the
    /// unit's calibration registers.
    pub fn from_transport(transport: Box<dyn Transport>) -> Result<Self> {
        let port = Mutex::new(transport);

        let info = Self::query_info(&port)?;
        let mut model = DaqModel::new(info.hardware_id, info.fw_ver, info.device_id)?;

        thread::sleep(CALIBRATION_DELAY);
        model.load_calibration(|slot| Self::read_calib_slot(&port, slot))?;
        info!(
            "connected to openDAQ {} fw {} ({})",
            model.model_str(),
            model.fw_ver(),
            model.serial_str()
        );

        Ok(Daq {
            shared: Arc::new(Shared {
                port,
                state: Mutex::new(RunState::Idle),
                experiments: Mutex::new(Vec::new()),
                model: Mutex::new(model),
                adc_setup: Mutex::new(AnalogSetup::default()),
                stream_crc_errors: AtomicUsize::new(0),
            }),
            reader: None,
        })
    }

    fn query_info(port: &Mutex<Box<dyn Transport>>) -> Result<DeviceInfo> {
        let args = transact(port, &Command::new(codec::CMD_ID_CONFIG).finish(), 6)?;
        let mut p = Payload::new(&args);
        Ok(DeviceInfo {
            hardware_id: p.u8()?,
            fw_ver: p.u8()?,
            device_id: p.u32()?,
        })
    }

    fn read_calib_slot(port: &Mutex<Box<dyn Transport>>, slot: usize) -> Result<(i16, i16)> {
        let cmd = Command::new(codec::CMD_CALIB_READ).u8(slot as u8).finish();
        let args = transact(port, &cmd, 5)?;
        let mut p = Payload::new(&args);
        let _slot = p.u8()?;
        Ok((p.i16()?, p.i16()?))
    }

    fn command(&self, command: &[u8], body_len: usize) -> Result<Vec<u8>> {
        transact(&self.shared.port, command, body_len)
    }

    // ------------------------------------------------------------------------
    // Identity and bookkeeping
    // ------------------------------------------------------------------------

    /// Current run state.
    pub fn state(&self) -> RunState {
        *lock(&self.shared.state)
    }

    /// Whether any experiment is going on.
    pub fn is_measuring(&self) -> bool {
        self.state() == RunState::Running
    }

    /// Number of streaming frames received with a bad checksum. Their
    /// samples were delivered anyway; a growing count means a degraded
    /// line.
    pub fn stream_crc_errors(&self) -> usize {
        self.shared.stream_crc_errors.load(Ordering::Relaxed)
    }

    /// Hardware model string, e.g. `"[M]"`.
    pub fn hw_ver(&self) -> &'static str {
        lock(&self.shared.model).model_str()
    }

    /// Firmware version reported at open.
    pub fn fw_ver(&self) -> u8 {
        lock(&self.shared.model).fw_ver()
    }

    /// Unit serial number string, e.g. `"ODM081237"`.
    pub fn serial_str(&self) -> String {
        lock(&self.shared.model).serial_str()
    }

    /// Re-read the identity block from the device.
    pub fn get_info(&self) -> Result<DeviceInfo> {
        Self::query_info(&self.shared.port)
    }

    /// Program a new device id number [0:999].
    pub fn set_id(&self, id: u32) -> Result<()> {
        if id >= 1000 {
            return Err(DaqError::validation("id", "out of range"));
        }
        self.command(&Command::new(codec::CMD_ID_CONFIG).u32(id).finish(), 6)?;
        Ok(())
    }

    /// Enable or disable response checksums on the device side.
    pub fn enable_crc(&self, on: bool) -> Result<()> {
        self.command(
            &Command::new(codec::CMD_ENABLE_CRC).u8(u8::from(on)).finish(),
            1,
        )?;
        Ok(())
    }

    /// Discard any pending input data.
    pub fn flush(&self) -> Result<()> {
        let mut port = lock(&self.shared.port);
        flush_input(port.as_mut())
    }

    // ------------------------------------------------------------------------
    // EEPROM
    // ------------------------------------------------------------------------

    /// Read one byte of device EEPROM [0:253].
    pub fn read_eeprom(&self, pos: u8) -> Result<u8> {
        if pos >= 254 {
            return Err(DaqError::validation("pos", "out of range"));
        }
        let args = self.command(
            &Command::new(codec::CMD_EEPROM_READ).u8(pos).u8(1).finish(),
            3,
        )?;
        let mut p = Payload::new(&args);
        let _pos = p.u8()?;
        let _len = p.u8()?;
        p.u8()
    }

    /// Write one byte of device EEPROM [0:253].
    pub fn write_eeprom(&self, pos: u8, value: u8) -> Result<()> {
        if pos >= 254 {
            return Err(DaqError::validation("pos", "out of range"));
        }
        self.command(
            &Command::new(codec::CMD_EEPROM_WRITE)
                .u8(pos)
                .u8(1)
                .u8(value)
                .finish(),
            3,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Immediate analog I/O
    // ------------------------------------------------------------------------

    /// Configure the analog-to-digital converter for immediate reads.
    pub fn conf_adc(&self, pinput: u8, ninput: u8, gain: u8, nsamples: u8) -> Result<()> {
        lock(&self.shared.model).check_adc_settings(pinput, ninput, gain)?;
        if nsamples == u8::MAX {
            return Err(DaqError::validation("nsamples", "out of range"));
        }
        self.command(
            &Command::new(codec::CMD_CONF_ADC)
                .u8(pinput)
                .u8(ninput)
                .u8(gain)
                .u8(nsamples)
                .finish(),
            6,
        )?;
        *lock(&self.shared.adc_setup) = AnalogSetup {
            pinput,
            ninput,
            gain,
            nsamples,
        };
        Ok(())
    }

    /// Read the ADC and return the raw value.
    pub fn read_adc(&self) -> Result<i16> {
        let args = self.command(&Command::new(codec::CMD_READ_ADC).finish(), 2)?;
        Payload::new(&args).i16()
    }

    /// Read the ADC in volts, using the last [`Daq::conf_adc`] settings.
    pub fn read_analog(&self) -> Result<f64> {
        let raw = self.read_adc()?;
        let setup = *lock(&self.shared.adc_setup);
        lock(&self.shared.model).raw_to_volts(i32::from(raw), setup.gain, setup.pinput, setup.ninput)
    }

    /// Read every analog input at the given gain, in volts. Returns one
    /// value per valid positive input of the model.
    pub fn read_all(&self, nsamples: u8, gain: u8) -> Result<Vec<f64>> {
        let args = self.command(
            &Command::new(codec::CMD_READ_ALL).u8(nsamples).u8(gain).finish(),
            16,
        )?;
        let mut p = Payload::new(&args);
        let mut raw = [0i16; 8];
        for value in raw.iter_mut() {
            *value = p.i16()?;
        }

        let model = lock(&self.shared.model);
        model
            .adc()
            .pinputs
            .iter()
            .map(|&pinput| {
                model.raw_to_volts(i32::from(raw[usize::from(pinput) - 1]), gain, pinput, 0)
            })
            .collect()
    }

    /// Set the DAC output from a raw value.
    pub fn set_dac(&self, raw: i16, number: u8) -> Result<()> {
        self.command(
            &Command::new(codec::CMD_SET_DAC).i16(raw).u8(number).finish(),
            3,
        )?;
        Ok(())
    }

    /// Set the DAC output in volts, applying the unit's calibration.
    pub fn set_analog(&self, volts: f64, number: u8) -> Result<()> {
        if number == 0 {
            return Err(DaqError::validation("number", "out of range"));
        }
        let raw = lock(&self.shared.model).volts_to_raw(volts, usize::from(number) - 1)?;
        self.set_dac(raw, number)
    }

    // ------------------------------------------------------------------------
    // LED and digital I/O
    // ------------------------------------------------------------------------

    /// Set a LED color (0 off, 1 green, 2 red, 3 orange).
    pub fn set_led(&self, color: u8, number: u8) -> Result<()> {
        if color > 3 {
            return Err(DaqError::validation("color", "out of range"));
        }
        let nleds = lock(&self.shared.model).nleds();
        if !(1..=nleds).contains(&number) {
            return Err(DaqError::validation("number", "LED number out of range"));
        }
        self.command(
            &Command::new(codec::CMD_SET_LED).u8(color).u8(number).finish(),
            2,
        )?;
        Ok(())
    }

    /// Configure the direction of every PIO terminal at once (bit set =
    /// output).
    pub fn set_port_dir(&self, output: u8) -> Result<()> {
        lock(&self.shared.model).check_port(output)?;
        self.command(&Command::new(codec::CMD_SET_PORT_DIR).u8(output).finish(), 1)?;
        Ok(())
    }

    /// Write all PIO values at once; returns the port state read back.
    pub fn set_port(&self, value: u8) -> Result<u8> {
        lock(&self.shared.model).check_port(value)?;
        let args = self.command(&Command::new(codec::CMD_SET_PORT).u8(value).finish(), 1)?;
        Payload::new(&args).u8()
    }

    /// Configure the direction of one PIO terminal.
    pub fn set_pio_dir(&self, number: u8, output: bool) -> Result<()> {
        lock(&self.shared.model).check_pio(number)?;
        self.command(
            &Command::new(codec::CMD_SET_PIO_DIR)
                .u8(number)
                .u8(u8::from(output))
                .finish(),
            2,
        )?;
        Ok(())
    }

    /// Write one PIO output value.
    pub fn set_pio(&self, number: u8, value: bool) -> Result<()> {
        lock(&self.shared.model).check_pio(number)?;
        self.command(
            &Command::new(codec::CMD_SET_PIO)
                .u8(number)
                .u8(u8::from(value))
                .finish(),
            2,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Bit-bang SPI
    // ------------------------------------------------------------------------

    /// Configure SPI clock polarity and phase.
    pub fn spi_config(&self, cpol: u8, cpha: u8) -> Result<()> {
        if cpol > 1 || cpha > 1 {
            return Err(DaqError::validation("spi config", "cpol/cpha must be 0 or 1"));
        }
        self.command(
            &Command::new(codec::CMD_SPI_CONFIG).u8(cpol).u8(cpha).finish(),
            2,
        )?;
        Ok(())
    }

    /// Choose the PIO terminals used for bit-bang SPI.
    pub fn spi_setup(&self, nbytes: u8, sck: u8, mosi: u8, miso: u8) -> Result<()> {
        if nbytes > 3 {
            return Err(DaqError::validation("nbytes", "out of range"));
        }
        let model = lock(&self.shared.model);
        model.check_pio(sck)?;
        model.check_pio(mosi)?;
        model.check_pio(miso)?;
        drop(model);
        self.command(
            &Command::new(codec::CMD_SPI_SETUP)
                .u8(sck)
                .u8(mosi)
                .u8(miso)
                .finish(),
            3,
        )?;
        Ok(())
    }

    /// Transfer (send and receive) one byte over bit-bang SPI.
    pub fn spi_write(&self, value: u8) -> Result<u8> {
        let args = self.command(&Command::new(codec::CMD_SPI_TRANSFER).u8(value).finish(), 1)?;
        Payload::new(&args).u8()
    }

    /// Transfer (send and receive) one 16-bit word over bit-bang SPI.
    pub fn spi_write_word(&self, value: u16) -> Result<u16> {
        let args = self.command(&Command::new(codec::CMD_SPI_TRANSFER).u16(value).finish(), 2)?;
        Payload::new(&args).u16()
    }

    // ------------------------------------------------------------------------
    // Counter, capture, encoder, PWM
    // ------------------------------------------------------------------------

    /// Initialize the edge counter (true: low-to-high edges).
    pub fn init_counter(&self, rising: bool) -> Result<()> {
        self.command(
            &Command::new(codec::CMD_COUNTER_INIT)
                .u8(u8::from(rising))
                .finish(),
            1,
        )?;
        Ok(())
    }

    /// Read the edge counter, optionally resetting it.
    pub fn get_counter(&self, reset: bool) -> Result<u16> {
        let args = self.command(
            &Command::new(codec::CMD_COUNTER_GET).u8(u8::from(reset)).finish(),
            2,
        )?;
        Payload::new(&args).u16()
    }

    /// Start capture mode around an estimated period (µs).
    pub fn init_capture(&self, period_us: u16) -> Result<()> {
        self.command(&Command::new(codec::CMD_CAPTURE_INIT).u16(period_us).finish(), 2)?;
        Ok(())
    }

    /// Stop capture mode.
    pub fn stop_capture(&self) -> Result<()> {
        self.command(&Command::new(codec::CMD_CAPTURE_STOP).finish(), 0)?;
        Ok(())
    }

    /// Read the captured period length in µs (mode 0: low cycle, 1: high
    /// cycle, 2: full period).
    pub fn get_capture(&self, mode: u8) -> Result<(u8, u16)> {
        if mode > 2 {
            return Err(DaqError::validation("mode", "out of range"));
        }
        let args = self.command(&Command::new(codec::CMD_CAPTURE_GET).u8(mode).finish(), 3)?;
        let mut p = Payload::new(&args);
        Ok((p.u8()?, p.u16()?))
    }

    /// Start the encoder function with a given resolution.
    pub fn init_encoder(&self, resolution: u8) -> Result<()> {
        self.command(
            &Command::new(codec::CMD_ENCODER_INIT).u8(resolution).finish(),
            1,
        )?;
        Ok(())
    }

    /// Read the current relative encoder position.
    pub fn get_encoder(&self) -> Result<u16> {
        let args = self.command(&Command::new(codec::CMD_ENCODER_GET).finish(), 2)?;
        Payload::new(&args).u16()
    }

    /// Stop the encoder function.
    pub fn stop_encoder(&self) -> Result<()> {
        self.command(&Command::new(codec::CMD_ENCODER_STOP).finish(), 0)?;
        Ok(())
    }

    /// Start PWM output (duty [0:1023], period in µs).
    pub fn init_pwm(&self, duty: u16, period_us: u16) -> Result<()> {
        if duty >= 1024 {
            return Err(DaqError::validation("duty", "out of range"));
        }
        self.command(
            &Command::new(codec::CMD_PWM_INIT).u16(duty).u16(period_us).finish(),
            4,
        )?;
        Ok(())
    }

    /// Stop PWM output.
    pub fn stop_pwm(&self) -> Result<()> {
        self.command(&Command::new(codec::CMD_PWM_STOP).finish(), 0)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Calibration transfer
    // ------------------------------------------------------------------------

    /// Reload every calibration register from device memory.
    pub fn load_calibration(&self) -> Result<()> {
        let mut model = lock(&self.shared.model);
        thread::sleep(CALIBRATION_DELAY);
        let port = &self.shared.port;
        model.load_calibration(|slot| Self::read_calib_slot(port, slot))
    }

    /// Persist the in-memory calibration registers to device memory.
    pub fn save_calibration(&self, target: CalTarget) -> Result<()> {
        let model = lock(&self.shared.model);
        thread::sleep(CALIBRATION_DELAY);
        let port = &self.shared.port;
        model.save_calibration(
            |slot, gain, offset| Self::write_calib_slot(port, slot, gain, offset),
            target,
        )
    }

    fn write_calib_slot(
        port: &Mutex<Box<dyn Transport>>,
        slot: usize,
        gain: i16,
        offset: i16,
    ) -> Result<()> {
        let cmd = Command::new(codec::CMD_CALIB_WRITE)
            .u8(slot as u8)
            .i16(gain)
            .i16(offset)
            .finish();
        transact(port, &cmd, 5)?;
        Ok(())
    }

    /// Copy of the ADC calibration registers.
    pub fn adc_calib(&self) -> Vec<CalibReg> {
        lock(&self.shared.model).adc_calib().to_vec()
    }

    /// Copy of the DAC calibration registers.
    pub fn dac_calib(&self) -> Vec<CalibReg> {
        lock(&self.shared.model).dac_calib().to_vec()
    }

    /// Replace the ADC calibration registers and write them to the device.
    pub fn set_adc_calib(&self, regs: &[CalibReg]) -> Result<()> {
        let mut model = lock(&self.shared.model);
        model.set_adc_calib(regs)?;
        let port = &self.shared.port;
        model.save_calibration(
            |slot, gain, offset| Self::write_calib_slot(port, slot, gain, offset),
            CalTarget::AdcOnly,
        )
    }

    /// Replace the DAC calibration registers and write them to the device.
    pub fn set_dac_calib(&self, regs: &[CalibReg]) -> Result<()> {
        let mut model = lock(&self.shared.model);
        model.set_dac_calib(regs)?;
        let port = &self.shared.port;
        model.save_calibration(
            |slot, gain, offset| Self::write_calib_slot(port, slot, gain, offset),
            CalTarget::DacOnly,
        )
    }

    // ------------------------------------------------------------------------
    // Experiment registry
    // ------------------------------------------------------------------------

    fn check_configurable(&self) -> Result<()> {
        match self.state() {
            RunState::Running => Err(DaqError::InvalidState("device is measuring")),
            RunState::Stopped => Err(DaqError::InvalidState("device is stopped")),
            _ => Ok(()),
        }
    }

    fn mark_configured(&self) {
        let mut st = lock(&self.shared.state);
        if *st == RunState::Idle {
            *st = RunState::Configured;
        }
    }

    fn free_numbers(experiments: &[Arc<Experiment>]) -> Vec<u8> {
        (1..=4)
            .filter(|n| !experiments.iter().any(|e| e.number() == *n))
            .collect()
    }

    fn check_no_burst(experiments: &[Arc<Experiment>]) -> Result<()> {
        if experiments
            .iter()
            .any(|e| matches!(e.kind(), ExperimentKind::Burst { .. }))
        {
            return Err(DaqError::InvalidState(
                "device is configured for a burst experiment",
            ));
        }
        Ok(())
    }

    /// Renumber a displaceable occupant of `number` to `fallback`, or fail
    /// when the occupant is not a plain input stream.
    fn displace_occupant(
        experiments: &[Arc<Experiment>],
        number: u8,
        fallback: u8,
        conflict: &'static str,
    ) -> Result<()> {
        if let Some(occupant) = experiments.iter().find(|e| e.number() == number) {
            let displaceable = matches!(occupant.kind(), ExperimentKind::Stream { .. })
                && occupant.mode() != ExpMode::AnalogOut;
            if !displaceable {
                return Err(DaqError::InvalidState(conflict));
            }
            *lock(&occupant.number) = fallback;
            debug!("moved stream experiment from channel {number} to {fallback}");
        }
        Ok(())
    }

    /// Register a stream experiment.
    ///
    /// Allocates the lowest free data channel; an analog-output stream is
    /// pinned to channel 4 and displaces a plain stream occupying it.
    pub fn create_stream(
        &self,
        mode: ExpMode,
        period_ms: u16,
        npoints: u16,
        continuous: bool,
        buffer_size: usize,
    ) -> Result<Arc<Experiment>> {
        self.check_configurable()?;
        let mut exps = lock(&self.shared.experiments);
        Self::check_no_burst(&exps)?;
        let available = Self::free_numbers(&exps);
        let Some(&lowest) = available.first() else {
            return Err(DaqError::ChannelExhausted);
        };

        let number = if mode == ExpMode::AnalogOut {
            Self::displace_occupant(&exps, 4, lowest, "data channel 4 is in use")?;
            4
        } else {
            lowest
        };

        let exp = Arc::new(Experiment::stream(
            mode,
            number,
            period_ms,
            npoints,
            continuous,
            buffer_size,
        )?);
        exps.push(Arc::clone(&exp));
        drop(exps);
        self.mark_configured();
        Ok(exp)
    }

    /// Register an externally clocked experiment; its clock input doubles
    /// as the data channel number.
    pub fn create_external(
        &self,
        mode: ExpMode,
        clock_input: u8,
        edge: u8,
        npoints: u16,
        continuous: bool,
        buffer_size: usize,
    ) -> Result<Arc<Experiment>> {
        self.check_configurable()?;
        let mut exps = lock(&self.shared.experiments);
        Self::check_no_burst(&exps)?;
        let available = Self::free_numbers(&exps);
        let Some(&lowest) = available.first() else {
            return Err(DaqError::ChannelExhausted);
        };

        Self::displace_occupant(
            &exps,
            clock_input,
            lowest,
            "clock input is used by another experiment",
        )?;

        let exp = Arc::new(Experiment::external(
            mode,
            clock_input,
            edge,
            npoints,
            continuous,
            buffer_size,
        )?);
        exps.push(Arc::clone(&exp));
        drop(exps);
        self.mark_configured();
        Ok(exp)
    }

    /// Register a burst experiment. Burst is exclusive: the registry must
    /// be empty, and no other experiment can be added afterwards.
    pub fn create_burst(
        &self,
        mode: ExpMode,
        period_us: u16,
        npoints: u16,
        continuous: bool,
        buffer_size: usize,
    ) -> Result<Arc<Experiment>> {
        self.check_configurable()?;
        let mut exps = lock(&self.shared.experiments);
        if !exps.is_empty() {
            return Err(DaqError::InvalidState(
                "only one experiment available at a time when using burst",
            ));
        }
        let exp = Arc::new(Experiment::burst(
            mode,
            period_us,
            npoints,
            continuous,
            buffer_size,
        )?);
        exps.push(Arc::clone(&exp));
        drop(exps);
        self.mark_configured();
        Ok(exp)
    }

    /// Snapshot of the registered experiments.
    pub fn experiments(&self) -> Vec<Arc<Experiment>> {
        lock(&self.shared.experiments).clone()
    }

    /// Remove one experiment, destroying its firmware channel.
    pub fn remove_experiment(&self, exp: &Arc<Experiment>) -> Result<()> {
        self.check_configurable()?;
        let number = exp.number();
        self.command(
            &Command::new(codec::CMD_CHANNEL_DESTROY).u8(number).finish(),
            1,
        )?;
        let mut exps = lock(&self.shared.experiments);
        exps.retain(|e| !Arc::ptr_eq(e, exp));
        let empty = exps.is_empty();
        drop(exps);
        if empty {
            let mut st = lock(&self.shared.state);
            if *st == RunState::Configured {
                *st = RunState::Idle;
            }
        }
        Ok(())
    }

    /// Remove every experiment, destroying their firmware channels.
    pub fn clear_experiments(&self) -> Result<()> {
        self.check_configurable()?;
        clear_experiments(&self.shared)?;
        let mut st = lock(&self.shared.state);
        if *st == RunState::Configured {
            *st = RunState::Idle;
        }
        Ok(())
    }

    /// Update a channel's analog front-end configuration, validated against
    /// the hardware model.
    pub fn analog_setup(&self, exp: &Experiment, setup: AnalogSetup) -> Result<()> {
        lock(&self.shared.model).check_adc_settings(setup.pinput, setup.ninput, setup.gain)?;
        if setup.nsamples == u8::MAX {
            return Err(DaqError::validation("nsamples", "out of range"));
        }
        *lock(&exp.analog) = setup;
        Ok(())
    }

    /// Update a channel's trigger configuration.
    pub fn trigger_setup(&self, exp: &Experiment, mode: TriggerMode, value: u16) -> Result<()> {
        if mode.is_digital() && value > 1 {
            return Err(DaqError::validation(
                "trigger value",
                "digital triggers take 0 or 1",
            ));
        }
        *lock(&exp.trigger) = TriggerSetup { mode, value };
        Ok(())
    }

    /// Query the trigger mode currently active on a data channel.
    pub fn trigger_mode(&self, number: u8) -> Result<u16> {
        if !(1..=4).contains(&number) {
            return Err(DaqError::validation("number", "data channel out of range"));
        }
        let args = self.command(&Command::new(codec::CMD_TRIGGER_MODE).u8(number).finish(), 2)?;
        Payload::new(&args).u16()
    }

    /// Query the state of a data channel.
    pub fn get_state_ch(&self, number: u8) -> Result<u16> {
        if !(1..=4).contains(&number) {
            return Err(DaqError::validation("number", "data channel out of range"));
        }
        let args = self.command(&Command::new(codec::CMD_CHANNEL_STATE).u8(number).finish(), 2)?;
        Payload::new(&args).u16()
    }

    /// Flush the device-side buffer of a data channel.
    pub fn flush_channel(&self, number: u8) -> Result<()> {
        if !(1..=4).contains(&number) {
            return Err(DaqError::validation("number", "data channel out of range"));
        }
        self.command(&Command::new(codec::CMD_CHANNEL_FLUSH).u8(number).finish(), 1)?;
        Ok(())
    }

    /// Stage a voltage sequence to be pushed to the analog output at
    /// `start()`. Voltages are converted through the unit's DAC calibration
    /// immediately, so span violations fail here.
    pub fn preload_signal(
        &self,
        exp: &Experiment,
        volts: &[f64],
        offset: i16,
        clear: bool,
    ) -> Result<()> {
        if exp.mode() != ExpMode::AnalogOut {
            return Err(DaqError::InvalidState(
                "preload requires an analog output experiment",
            ));
        }
        if volts.is_empty() || volts.len() > MAX_SIGNAL_LEN {
            return Err(DaqError::validation("signal", "length out of range"));
        }
        let raw = {
            let model = lock(&self.shared.model);
            volts
                .iter()
                .map(|&v| model.volts_to_raw(v, 0))
                .collect::<Result<Vec<i16>>>()?
        };
        let mut chunks = lock(&exp.preload);
        if clear {
            chunks.clear();
        }
        chunks.push(SignalChunk {
            offset,
            first_volts: volts[0],
            raw,
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Run-state machine
    // ------------------------------------------------------------------------

    /// Arm every registered experiment on the device and start measuring.
    ///
    /// Issues the kind-specific create command, the point-count setup, the
    /// analog and trigger configuration for each channel, pushes the staged
    /// analog-output signal once, then the global run command. The
    /// background reader is spawned on the first start.
    pub fn start(&mut self) -> Result<()> {
        match self.state() {
            RunState::Running => return Err(DaqError::InvalidState("already measuring")),
            RunState::Stopped => return Err(DaqError::InvalidState("device is stopped")),
            RunState::Idle => return Err(DaqError::InvalidState("no experiments configured")),
            RunState::Configured | RunState::Halted => {}
        }

        let exps = self.experiments();
        let mut preloaded = false;
        for exp in &exps {
            let number = exp.number();
            match exp.kind() {
                ExperimentKind::Stream { period_ms } => {
                    self.command(
                        &Command::new(codec::CMD_STREAM_CREATE)
                            .u8(number)
                            .u16(period_ms)
                            .finish(),
                        3,
                    )?;
                }
                ExperimentKind::Burst { period_us } => {
                    self.command(
                        &Command::new(codec::CMD_BURST_CREATE).u16(period_us).finish(),
                        2,
                    )?;
                }
                ExperimentKind::External { edge } => {
                    self.command(
                        &Command::new(codec::CMD_EXTERNAL_CREATE)
                            .u8(number)
                            .u8(edge)
                            .finish(),
                        2,
                    )?;
                }
            }

            self.command(
                &Command::new(codec::CMD_POINTS_CFG)
                    .u8(number)
                    .u16(exp.npoints())
                    .u8(u8::from(!exp.continuous()))
                    .finish(),
                4,
            )?;

            let setup = exp.analog_setup();
            lock(&self.shared.model).check_adc_settings(setup.pinput, setup.ninput, setup.gain)?;
            self.command(
                &Command::new(codec::CMD_CHANNEL_CFG)
                    .u8(number)
                    .u8(exp.mode().code())
                    .u8(setup.pinput)
                    .u8(setup.ninput)
                    .u8(setup.gain)
                    .u8(setup.nsamples)
                    .finish(),
                6,
            )?;

            let trigger = exp.trigger_setup();
            self.command(
                &Command::new(codec::CMD_TRIGGER_SETUP)
                    .u8(number)
                    .u8(trigger.mode.code())
                    .u16(trigger.value)
                    .finish(),
                4,
            )?;

            if exp.mode() == ExpMode::AnalogOut && !preloaded {
                preloaded = true;
                self.push_preload(exp)?;
            }
        }

        self.command(&Command::new(codec::CMD_RUN).finish(), 0)?;

        if self.reader.is_none() {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name("opendaq-reader".into())
                .spawn(move || reader_loop(shared))
                .map_err(DaqError::Io)?;
            self.reader = Some(handle);
        }

        *lock(&self.shared.state) = RunState::Running;
        info!("measurement started ({} experiments)", exps.len());
        Ok(())
    }

    /// Push the staged analog-output signal chunks to the device.
    fn push_preload(&self, exp: &Experiment) -> Result<()> {
        let chunks = lock(&exp.preload);
        if let Some(first) = chunks.first() {
            // Seed the DAC with the opening voltage before loading.
            self.set_analog(first.first_volts, 1)?;
        }
        for chunk in chunks.iter() {
            let mut cmd = Command::new(codec::CMD_SIGNAL_LOAD).i16(chunk.offset);
            for &raw in &chunk.raw {
                cmd = cmd.u16(raw as u16);
            }
            self.command(&cmd.finish(), 3)?;
        }
        Ok(())
    }

    /// Stop measuring but keep the experiment configuration and the reader
    /// thread, ready for another `start()`. With `clear`, the experiment
    /// list is removed while the session stays open.
    pub fn halt(&self, clear: bool) -> Result<()> {
        {
            let mut st = lock(&self.shared.state);
            if *st == RunState::Stopped {
                return Err(DaqError::InvalidState("device is stopped"));
            }
            *st = RunState::Halted;
        }
        confirm_stop(&self.shared)?;
        thread::sleep(HALT_SETTLE);
        if clear {
            clear_experiments(&self.shared)?;
            *lock(&self.shared.state) = RunState::Idle;
        }
        info!("measurement halted");
        Ok(())
    }

    /// Stop measuring, clear every experiment and end the session. The
    /// driver refuses further configuration afterwards; open a new [`Daq`]
    /// to measure again.
    pub fn stop(&mut self) -> Result<()> {
        {
            let mut st = lock(&self.shared.state);
            if *st == RunState::Stopped {
                return Ok(());
            }
            *st = RunState::Stopped;
        }

        let result = confirm_stop(&self.shared).and_then(|_| clear_experiments(&self.shared));

        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        info!("measurement stopped");
        result
    }
}

impl Drop for Daq {
    fn drop(&mut self) {
        *lock(&self.shared.state) = RunState::Stopped;
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_serial::MockSerial;

    fn open_mock() -> (MockSerial, Daq) {
        let mock = MockSerial::new(1, 140, 123);
        let daq = Daq::from_transport(Box::new(mock.clone())).unwrap();
        (mock, daq)
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn open_identifies_device_and_loads_calibration() {
        let (mock, daq) = open_mock();
        assert_eq!(daq.hw_ver(), "[M]");
        assert_eq!(daq.fw_ver(), 140);
        assert_eq!(daq.serial_str(), "ODM081237");
        assert_eq!(daq.state(), RunState::Idle);
        // one info request plus one calibration read per slot
        let ops = mock.op_log();
        assert_eq!(ops.iter().filter(|&&op| op == codec::CMD_ID_CONFIG).count(), 1);
        assert_eq!(ops.iter().filter(|&&op| op == codec::CMD_CALIB_READ).count(), 14);
    }

    #[test]
    fn immediate_reads_and_writes() {
        let (mock, daq) = open_mock();
        mock.set_adc_raw(8000);
        assert_eq!(daq.read_adc().unwrap(), 8000);
        daq.conf_adc(1, 0, 1, 20).unwrap();
        let volts = daq.read_analog().unwrap();
        assert!((volts - 1.0).abs() < 1e-9);

        daq.set_analog(1.0, 1).unwrap();
        assert_eq!(mock.last_dac_raw(), Some(8000));

        assert!(daq.conf_adc(9, 0, 1, 20).is_err());
        assert!(daq.set_analog(9.0, 1).is_err());
    }

    #[test]
    fn misc_device_commands() {
        let (_mock, daq) = open_mock();
        daq.write_eeprom(10, 0xAB).unwrap();
        assert_eq!(daq.read_eeprom(10).unwrap(), 0xAB);
        assert!(daq.read_eeprom(254).is_err());

        daq.set_led(1, 1).unwrap();
        assert!(daq.set_led(4, 1).is_err());
        // model [M] has a single LED
        assert!(daq.set_led(1, 2).is_err());

        daq.set_pio(3, true).unwrap();
        assert!(daq.set_pio(7, true).is_err());
        assert_eq!(daq.set_port(0x2A).unwrap(), 0x2A);
        assert!(daq.set_port(64).is_err());

        daq.spi_config(0, 1).unwrap();
        daq.spi_setup(2, 1, 2, 3).unwrap();
        assert_eq!(daq.spi_write(0x55).unwrap(), 0x55);
        assert_eq!(daq.spi_write_word(0xBEEF).unwrap(), 0xBEEF);

        assert!(daq.init_pwm(1024, 100).is_err());
        daq.init_pwm(512, 1000).unwrap();
        daq.stop_pwm().unwrap();

        daq.init_counter(true).unwrap();
        assert_eq!(daq.get_counter(false).unwrap(), 0);
        assert_eq!(daq.get_capture(2).unwrap(), (2, 0));
        assert!(daq.get_capture(3).is_err());
        assert!(daq.set_id(1000).is_err());
        daq.set_id(153).unwrap();

        assert_eq!(daq.trigger_mode(1).unwrap(), 0);
        assert_eq!(daq.get_state_ch(2).unwrap(), 0);
        daq.flush_channel(1).unwrap();
        assert!(daq.flush_channel(5).is_err());
    }

    #[test]
    fn calibration_write_back() {
        let (mock, daq) = open_mock();
        let mut regs = daq.dac_calib();
        regs[0] = CalibReg {
            gain: 1.01,
            offset: 0.001,
        };
        daq.set_dac_calib(&regs).unwrap();
        assert_eq!(
            mock.op_log().iter().filter(|&&op| op == codec::CMD_CALIB_WRITE).count(),
            1
        );
        assert!(daq.set_dac_calib(&[]).is_err());
        assert!(daq.set_adc_calib(&[]).is_err());

        daq.save_calibration(CalTarget::All).unwrap();
        daq.load_calibration().unwrap();
    }

    #[test]
    fn channel_allocation_uses_lowest_free_numbers() {
        let (_mock, daq) = open_mock();
        let e1 = daq.create_stream(ExpMode::AnalogIn, 10, 0, true, 100).unwrap();
        let e2 = daq.create_stream(ExpMode::AnalogIn, 10, 0, true, 100).unwrap();
        let e3 = daq.create_stream(ExpMode::AnalogIn, 10, 0, true, 100).unwrap();
        let e4 = daq.create_stream(ExpMode::AnalogIn, 10, 0, true, 100).unwrap();
        assert_eq!(
            [e1.number(), e2.number(), e3.number(), e4.number()],
            [1, 2, 3, 4]
        );
        assert!(matches!(
            daq.create_stream(ExpMode::AnalogIn, 10, 0, true, 100),
            Err(DaqError::ChannelExhausted)
        ));
        assert_eq!(daq.state(), RunState::Configured);
    }

    #[test]
    fn analog_output_displaces_stream_on_channel_4() {
        let (_mock, daq) = open_mock();
        let streams: Vec<_> = (0..4)
            .map(|_| daq.create_stream(ExpMode::AnalogIn, 10, 0, true, 100).unwrap())
            .collect();
        daq.remove_experiment(&streams[0]).unwrap();

        let out = daq.create_stream(ExpMode::AnalogOut, 10, 0, true, 100).unwrap();
        assert_eq!(out.number(), 4);
        // the displaced stream moved to the lowest free number
        assert_eq!(streams[3].number(), 1);
    }

    #[test]
    fn analog_output_never_displaces_external() {
        let (_mock, daq) = open_mock();
        let _ext = daq
            .create_external(ExpMode::DigitalIn, 4, 1, 0, true, 100)
            .unwrap();
        assert!(matches!(
            daq.create_stream(ExpMode::AnalogOut, 10, 0, true, 100),
            Err(DaqError::InvalidState(_))
        ));
    }

    #[test]
    fn burst_is_exclusive() {
        let (_mock, daq) = open_mock();
        let _b = daq
            .create_burst(ExpMode::AnalogIn, 200, 100, false, 100)
            .unwrap();
        assert!(matches!(
            daq.create_stream(ExpMode::AnalogIn, 10, 0, true, 100),
            Err(DaqError::InvalidState(_))
        ));
        assert!(matches!(
            daq.create_external(ExpMode::DigitalIn, 2, 1, 0, true, 100),
            Err(DaqError::InvalidState(_))
        ));
    }

    #[test]
    fn burst_requires_empty_registry() {
        let (_mock, daq) = open_mock();
        let _s = daq.create_stream(ExpMode::AnalogIn, 10, 0, true, 100).unwrap();
        assert!(matches!(
            daq.create_burst(ExpMode::AnalogIn, 200, 100, false, 100),
            Err(DaqError::InvalidState(_))
        ));
    }

    #[test]
    fn preload_signal_rules() {
        let (_mock, daq) = open_mock();
        let input = daq.create_stream(ExpMode::AnalogIn, 10, 0, true, 100).unwrap();
        assert!(daq.preload_signal(&input, &[0.5], 0, false).is_err());

        let output = daq.create_stream(ExpMode::AnalogOut, 10, 0, true, 100).unwrap();
        daq.preload_signal(&output, &[0.0, 0.5, 1.0], 0, false).unwrap();
        assert!(daq.preload_signal(&output, &[], 0, false).is_err());
        let too_long = vec![0.0; MAX_SIGNAL_LEN + 1];
        assert!(daq.preload_signal(&output, &too_long, 0, false).is_err());
        // span violations surface at staging time
        assert!(matches!(
            daq.preload_signal(&output, &[9.0], 0, false),
            Err(DaqError::Range(_))
        ));
    }

    #[test]
    fn lifecycle_state_machine() {
        let (mock, mut daq) = open_mock();
        assert_eq!(daq.state(), RunState::Idle);
        assert!(daq.start().is_err());

        let _s = daq.create_stream(ExpMode::AnalogIn, 10, 0, true, 100).unwrap();
        assert_eq!(daq.state(), RunState::Configured);

        daq.start().unwrap();
        assert_eq!(daq.state(), RunState::Running);
        assert!(daq.start().is_err());

        daq.halt(false).unwrap();
        assert_eq!(daq.state(), RunState::Halted);
        assert_eq!(daq.experiments().len(), 1);

        daq.start().unwrap();
        assert_eq!(daq.state(), RunState::Running);

        daq.stop().unwrap();
        assert_eq!(daq.state(), RunState::Stopped);
        assert!(daq.experiments().is_empty());
        assert!(mock.op_log().contains(&codec::CMD_CHANNEL_DESTROY));

        // terminal: no more configuration or starts
        assert!(daq.create_stream(ExpMode::AnalogIn, 10, 0, true, 100).is_err());
        assert!(daq.start().is_err());
        assert!(daq.stop().is_ok());
    }

    #[test]
    fn start_issues_setup_commands_per_experiment() {
        let (mock, mut daq) = open_mock();
        let _s = daq.create_stream(ExpMode::AnalogIn, 50, 10, false, 100).unwrap();
        let _x = daq
            .create_external(ExpMode::DigitalIn, 2, 1, 0, true, 100)
            .unwrap();
        daq.start().unwrap();

        let ops = mock.op_log();
        assert!(ops.contains(&codec::CMD_STREAM_CREATE));
        assert!(ops.contains(&codec::CMD_EXTERNAL_CREATE));
        assert_eq!(ops.iter().filter(|&&op| op == codec::CMD_POINTS_CFG).count(), 2);
        assert_eq!(ops.iter().filter(|&&op| op == codec::CMD_CHANNEL_CFG).count(), 2);
        assert_eq!(ops.iter().filter(|&&op| op == codec::CMD_TRIGGER_SETUP).count(), 2);
        assert_eq!(*ops.last().unwrap(), codec::CMD_RUN);
        daq.stop().unwrap();
    }

    #[test]
    fn streaming_routes_samples_to_channels() {
        let (mock, mut daq) = open_mock();
        let s1 = daq.create_stream(ExpMode::AnalogIn, 10, 0, true, 100).unwrap();
        let s2 = daq.create_stream(ExpMode::AnalogIn, 10, 0, true, 100).unwrap();
        daq.start().unwrap();

        // identity calibration, gain id 1 (x1): volts = raw / 8000
        mock.push_frame(1, &[8000, -8000, 4000]);
        mock.push_frame(2, &[1000, 2000, 3000]);

        assert!(wait_until(Duration::from_secs(2), || {
            s1.buffered() == 3 && s2.buffered() == 3
        }));

        let data1 = s1.read();
        assert!((data1[0] - 1.0).abs() < 1e-9);
        assert!((data1[1] + 1.0).abs() < 1e-9);
        assert!((data1[2] - 0.5).abs() < 1e-9);
        assert_eq!(s2.read().len(), 3);
        assert_eq!(daq.stream_crc_errors(), 0);

        daq.stop().unwrap();
    }

    #[test]
    fn corrupted_stream_frame_counts_but_delivers() {
        let (mock, mut daq) = open_mock();
        let s1 = daq.create_stream(ExpMode::AnalogIn, 10, 0, true, 100).unwrap();
        daq.start().unwrap();

        mock.push_corrupted_frame(1, &[100, 200]);
        assert!(wait_until(Duration::from_secs(2), || s1.buffered() == 2));
        assert_eq!(daq.stream_crc_errors(), 1);

        daq.stop().unwrap();
    }

    #[test]
    fn device_initiated_stop_halts_engine() {
        let (mock, mut daq) = open_mock();
        let _s = daq.create_stream(ExpMode::AnalogIn, 10, 5, false, 100).unwrap();
        daq.start().unwrap();

        mock.push_stop(1);
        assert!(wait_until(Duration::from_secs(2), || {
            daq.state() == RunState::Halted
        }));
        // the reader acknowledged with a stop command
        assert!(mock.op_log().contains(&codec::CMD_STOP));
        assert_eq!(daq.experiments().len(), 1);
    }

    #[test]
    fn stop_retries_on_checksum_failure() {
        let (mock, mut daq) = open_mock();
        let _s = daq.create_stream(ExpMode::AnalogIn, 10, 0, true, 100).unwrap();
        daq.start().unwrap();

        mock.fail_next_stops(2);
        daq.stop().unwrap();
        assert_eq!(daq.state(), RunState::Stopped);
        assert!(mock.op_log().iter().filter(|&&op| op == codec::CMD_STOP).count() >= 3);
    }

    #[test]
    fn ring_buffer_eviction_under_streaming() {
        let (mock, mut daq) = open_mock();
        let s1 = daq.create_stream(ExpMode::AnalogIn, 10, 0, true, 4).unwrap();
        daq.start().unwrap();

        mock.push_frame(1, &[1, 2, 3]);
        assert!(wait_until(Duration::from_secs(2), || s1.buffered() == 3));
        mock.push_frame(1, &[4, 5, 6]);
        assert!(wait_until(Duration::from_secs(2), || {
            s1.buffered() == 4 && mock.rx_empty()
        }));
        // let the reader finish routing the tail of the second frame
        thread::sleep(Duration::from_millis(50));

        let data = s1.read();
        assert_eq!(data.len(), 4);
        // oldest samples were evicted
        assert!((data[0] - 3.0 / 8000.0).abs() < 1e-12);

        daq.stop().unwrap();
    }
}
