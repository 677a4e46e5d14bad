//! openDAQ serial driver.
//!
//! This crate talks to openDAQ data-acquisition boards over a serial port:
//! it encodes commands, validates checksummed responses, demultiplexes the
//! streaming wire protocol into per-channel sample buffers, and converts
//! raw converter codes to and from volts using each unit's calibration
//! registers.
//!
//! # Acquisition in a nutshell
//!
//! 1. [`Daq::open`] identifies the board, resolves its hardware model and
//!    loads the calibration registers.
//! 2. `create_stream` / `create_external` / `create_burst` register
//!    experiments on the four firmware data channels.
//! 3. [`Daq::start`] arms every experiment and starts the device; a
//!    background reader routes incoming samples, converted to volts, into
//!    each experiment's bounded ring buffer.
//! 4. [`Experiment::read`] drains collected samples;
//!    [`Daq::halt`] pauses for another start, [`Daq::stop`] ends the
//!    session.
//!
//! Immediate (non-streamed) commands are plain methods on [`Daq`]: single
//! ADC/DAC conversions, PIO and port access, bit-bang SPI,
//! counter/capture/encoder/PWM control, EEPROM and calibration transfer.
//!
//! # Timing
//!
//! The device samples on its own crystal; the host only drains buffers.
//! Serial latency means samples arrive in bursts, so reconstruct timestamps
//! from the experiment's period, not from arrival times.

mod codec;
mod daq;
mod errors;
mod experiment;
mod frame;
mod logging;
#[cfg(test)]
mod mock_serial;
mod model;

pub use daq::{Daq, DeviceInfo, RunState, Transport};
pub use errors::{DaqError, Result};
pub use experiment::{
    AnalogSetup, ExpMode, Experiment, ExperimentKind, TriggerMode, TriggerSetup, MAX_BUFFER_SIZE,
    MAX_SIGNAL_LEN,
};
pub use frame::StreamEvent;
pub use logging::init_logging;
pub use model::{Adc, CalTarget, CalibReg, Dac, DaqModel, ModelDescriptor, MIN_FW_VERSION};
