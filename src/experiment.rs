//! Acquisition experiments (data channels).
//!
//! An experiment binds one of the four firmware data channels to a data
//! source or destination, a sampling trigger and a host-side sample buffer.
//! Three kinds exist: `Stream` (periodic, millisecond timebase), `Burst`
//! (microsecond timebase, exclusive: no other channel may coexist) and
//! `External` (clocked by edges on a digital input, whose number doubles as
//! the channel number).
//!
//! The sample buffer is a bounded ring: the background reader is its only
//! producer and the caller its only consumer, so a plain mutex per channel
//! is enough. When the ring is full the oldest sample is dropped; that is a
//! documented policy, not an error.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::errors::{DaqError, Result};

/// Largest host-side sample buffer accepted for one channel.
pub const MAX_BUFFER_SIZE: usize = 20000;
/// Largest number of voltages in one preloaded signal chunk.
pub const MAX_SIGNAL_LEN: usize = 400;

/// Lock a mutex, recovering the guard if a producer/consumer panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Configuration types
// ============================================================================

/// Data source or destination of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpMode {
    AnalogIn = 0,
    AnalogOut = 1,
    DigitalIn = 2,
    DigitalOut = 3,
    CounterIn = 4,
    CaptureIn = 5,
}

impl ExpMode {
    pub(crate) fn code(self) -> u8 {
        self as u8
    }
}

/// Trigger starting an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerMode {
    /// Start immediately on `run`.
    Software = 0,
    Din1 = 1,
    Din2 = 2,
    Din3 = 3,
    Din4 = 4,
    Din5 = 5,
    Din6 = 6,
    /// Start when the analog reading rises above the trigger value.
    AnalogGreater = 10,
    /// Start when the analog reading falls below the trigger value.
    AnalogLesser = 20,
}

impl TriggerMode {
    pub(crate) fn code(self) -> u8 {
        self as u8
    }

    pub(crate) fn is_digital(self) -> bool {
        (1..=6).contains(&(self as u8))
    }
}

/// Analog front-end configuration of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalogSetup {
    /// Positive/single-ended input.
    pub pinput: u8,
    /// Negative input (0 = single-ended).
    pub ninput: u8,
    /// PGA gain id (index into the model's gain ladder).
    pub gain: u8,
    /// Number of device-side samples averaged per point.
    pub nsamples: u8,
}

impl Default for AnalogSetup {
    fn default() -> Self {
        AnalogSetup {
            pinput: 1,
            ninput: 0,
            gain: 1,
            nsamples: 20,
        }
    }
}

/// Trigger configuration of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSetup {
    pub mode: TriggerMode,
    pub value: u16,
}

impl Default for TriggerSetup {
    fn default() -> Self {
        TriggerSetup {
            mode: TriggerMode::Software,
            value: 0,
        }
    }
}

/// Kind-specific experiment parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentKind {
    Stream {
        /// Sampling period in milliseconds [1:65535].
        period_ms: u16,
    },
    Burst {
        /// Sampling period in microseconds [100:65535].
        period_us: u16,
    },
    External {
        /// New data on rising (1) or falling (0) edges.
        edge: u8,
    },
}

/// One voltage sequence staged for the analog output, already converted to
/// raw DAC codes.
pub(crate) struct SignalChunk {
    pub offset: i16,
    pub first_volts: f64,
    pub raw: Vec<i16>,
}

// ============================================================================
// Sample ring buffer
// ============================================================================

struct RingBuffer {
    data: VecDeque<f64>,
    capacity: usize,
}

impl RingBuffer {
    fn push(&mut self, sample: f64) {
        if self.data.len() == self.capacity {
            self.data.pop_front();
        }
        self.data.push_back(sample);
    }
}

// ============================================================================
// Experiment
// ============================================================================

/// One configured data channel.
///
/// Handed out as `Arc<Experiment>`: the registry and the background reader
/// keep their own references, the caller drains collected samples through
/// [`Experiment::read`].
pub struct Experiment {
    /// Assigned data channel number [1:4]. May be reassigned while idle when
    /// the analog output claims channel 4.
    pub(crate) number: Mutex<u8>,
    mode: ExpMode,
    kind: ExperimentKind,
    npoints: u16,
    continuous: bool,
    pub(crate) analog: Mutex<AnalogSetup>,
    pub(crate) trigger: Mutex<TriggerSetup>,
    buffer: Mutex<RingBuffer>,
    pub(crate) preload: Mutex<Vec<SignalChunk>>,
}

fn check_buffer_size(buffer_size: usize) -> Result<()> {
    if !(1..=MAX_BUFFER_SIZE).contains(&buffer_size) {
        return Err(DaqError::validation("buffer_size", "out of range"));
    }
    Ok(())
}

impl Experiment {
    fn new(
        mode: ExpMode,
        number: u8,
        kind: ExperimentKind,
        npoints: u16,
        continuous: bool,
        buffer_size: usize,
    ) -> Result<Self> {
        if !(1..=4).contains(&number) {
            return Err(DaqError::validation("number", "data channel out of range"));
        }
        if mode == ExpMode::AnalogOut && number != 4 {
            return Err(DaqError::validation(
                "number",
                "analog output must use data channel 4",
            ));
        }
        check_buffer_size(buffer_size)?;
        Ok(Experiment {
            number: Mutex::new(number),
            mode,
            kind,
            npoints,
            continuous,
            analog: Mutex::new(AnalogSetup::default()),
            trigger: Mutex::new(TriggerSetup::default()),
            buffer: Mutex::new(RingBuffer {
                data: VecDeque::with_capacity(buffer_size),
                capacity: buffer_size,
            }),
            preload: Mutex::new(Vec::new()),
        })
    }

    /// Periodic stream experiment.
    pub(crate) fn stream(
        mode: ExpMode,
        number: u8,
        period_ms: u16,
        npoints: u16,
        continuous: bool,
        buffer_size: usize,
    ) -> Result<Self> {
        if period_ms == 0 {
            return Err(DaqError::validation("period", "out of range"));
        }
        Self::new(
            mode,
            number,
            ExperimentKind::Stream { period_ms },
            npoints,
            continuous,
            buffer_size,
        )
    }

    /// Burst experiment; always data channel 1 and exclusive.
    pub(crate) fn burst(
        mode: ExpMode,
        period_us: u16,
        npoints: u16,
        continuous: bool,
        buffer_size: usize,
    ) -> Result<Self> {
        if period_us < 100 {
            return Err(DaqError::validation("period", "out of range"));
        }
        Self::new(
            mode,
            1,
            ExperimentKind::Burst { period_us },
            npoints,
            continuous,
            buffer_size,
        )
    }

    /// Externally clocked experiment; the clock input doubles as the data
    /// channel number.
    pub(crate) fn external(
        mode: ExpMode,
        clock_input: u8,
        edge: u8,
        npoints: u16,
        continuous: bool,
        buffer_size: usize,
    ) -> Result<Self> {
        if !(1..=4).contains(&clock_input) {
            return Err(DaqError::validation("clock_input", "out of range"));
        }
        if edge > 1 {
            return Err(DaqError::validation("edge", "must be 0 or 1"));
        }
        Self::new(
            mode,
            clock_input,
            ExperimentKind::External { edge },
            npoints,
            continuous,
            buffer_size,
        )
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Currently assigned data channel number [1:4].
    pub fn number(&self) -> u8 {
        *lock(&self.number)
    }

    pub fn mode(&self) -> ExpMode {
        self.mode
    }

    pub fn kind(&self) -> ExperimentKind {
        self.kind
    }

    pub fn npoints(&self) -> u16 {
        self.npoints
    }

    pub fn continuous(&self) -> bool {
        self.continuous
    }

    pub fn analog_setup(&self) -> AnalogSetup {
        *lock(&self.analog)
    }

    pub fn trigger_setup(&self) -> TriggerSetup {
        *lock(&self.trigger)
    }

    // ------------------------------------------------------------------------
    // Sample buffer
    // ------------------------------------------------------------------------

    /// Append a collected sample, dropping the oldest one when full.
    pub(crate) fn push_sample(&self, volts: f64) {
        lock(&self.buffer).push(volts);
    }

    /// Number of samples currently buffered.
    pub fn buffered(&self) -> usize {
        lock(&self.buffer).data.len()
    }

    /// Drain every collected sample, in arrival order.
    pub fn read(&self) -> Vec<f64> {
        lock(&self.buffer).data.drain(..).collect()
    }
}
