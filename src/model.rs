//! Hardware model table and calibration transforms.
//!
//! Every openDAQ variant is described by an immutable [`ModelDescriptor`]:
//! converter bit widths and voltage spans, the ordered PGA gain ladder, the
//! valid input selections, and the rule mapping an analog configuration to
//! the calibration slots that apply to it. New hardware only adds a table
//! entry and a slot-selection rule; the raw/volt transforms themselves are
//! model-independent.
//!
//! Calibration registers live in device memory as fixed-point pairs and are
//! decoded at load time: gains are stored as a correction around 1.0 in
//! 1/2^16 steps; DAC offsets in 1/2^16 V steps and ADC offsets in 1/2^5 raw
//! steps. `volts_to_raw` rounds half-to-even for reproducibility.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::errors::{DaqError, Result};

/// Oldest firmware revision the driver speaks to.
pub const MIN_FW_VERSION: u8 = 130;

// ============================================================================
// Data Types
// ============================================================================

/// One calibration register: a gain correction factor (≈1.0) and an offset.
///
/// ADC offsets are expressed in raw units; DAC offsets in volts. Gains are
/// always applied as `base physical gain × stored correction`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibReg {
    pub gain: f64,
    pub offset: f64,
}

impl CalibReg {
    /// The neutral register: no correction, no offset.
    pub const IDENTITY: CalibReg = CalibReg {
        gain: 1.0,
        offset: 0.0,
    };
}

/// Analog-to-digital converter characteristics of one hardware variant.
#[derive(Debug, Clone)]
pub struct Adc {
    pub bits: u32,
    pub vmin: f64,
    pub vmax: f64,
    /// PGA multipliers, indexed by gain id.
    pub pga_gains: &'static [f64],
    /// Valid positive/single-ended input selections.
    pub pinputs: &'static [u8],
    /// Valid negative input selections (0 = single-ended).
    pub ninputs: &'static [u8],
}

/// Digital-to-analog converter characteristics of one hardware variant.
#[derive(Debug, Clone, Copy)]
pub struct Dac {
    pub bits: u32,
    pub vmin: f64,
    pub vmax: f64,
}

/// Which calibration registers to transfer to/from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalTarget {
    All,
    AdcOnly,
    DacOnly,
}

/// Rule selecting up to two ADC calibration slots for an analog
/// configuration. The second slot, when present, is the one affected by the
/// PGA stage.
type AdcSlotsFn = fn(&ModelDescriptor, usize, u8, u8) -> (Option<usize>, Option<usize>);

/// Immutable description of one device variant.
pub struct ModelDescriptor {
    pub id: u8,
    pub model_str: &'static str,
    serial_fmt: fn(u32) -> String,
    pub adc: Adc,
    pub dac: Dac,
    pub adc_slots: usize,
    pub dac_slots: usize,
    pub npios: u8,
    pub nleds: u8,
    adc_slot_fn: AdcSlotsFn,
}

// ============================================================================
// Model registration table
// ============================================================================

fn m_slots(d: &ModelDescriptor, gain_id: usize, pinput: u8, _ninput: u8) -> (Option<usize>, Option<usize>) {
    (
        Some(pinput as usize - 1),
        Some(d.adc.pinputs.len() + gain_id),
    )
}

fn s_slots(_d: &ModelDescriptor, _gain_id: usize, pinput: u8, ninput: u8) -> (Option<usize>, Option<usize>) {
    let offs = if ninput == 0 { 0 } else { 8 };
    (Some(pinput as usize - 1 + offs), None)
}

fn per_input_slots(d: &ModelDescriptor, _gain_id: usize, pinput: u8, _ninput: u8) -> (Option<usize>, Option<usize>) {
    (
        Some(pinput as usize - 1),
        Some(d.adc.pinputs.len() + pinput as usize - 1),
    )
}

/// Registered hardware variants, keyed by the numeric model id reported in
/// the device info response.
static MODELS: Lazy<Vec<ModelDescriptor>> = Lazy::new(|| {
    vec![
        ModelDescriptor {
            id: 1,
            model_str: "[M]",
            serial_fmt: |s| format!("ODM08{s:03}7"),
            adc: Adc {
                bits: 16,
                vmin: -4.096,
                vmax: 4.096,
                pga_gains: &[1.0 / 3.0, 1.0, 2.0, 10.0, 100.0],
                pinputs: &[1, 2, 3, 4, 5, 6, 7, 8],
                ninputs: &[0, 5, 6, 7, 8, 25],
            },
            dac: Dac {
                bits: 16,
                vmin: -4.096,
                vmax: 4.096,
            },
            adc_slots: 13,
            dac_slots: 1,
            npios: 6,
            nleds: 1,
            adc_slot_fn: m_slots,
        },
        ModelDescriptor {
            id: 2,
            model_str: "[S]",
            serial_fmt: |s| format!("ODS08{s:03}7"),
            adc: Adc {
                bits: 16,
                vmin: -12.0,
                vmax: 12.0,
                pga_gains: &[1.0, 2.0, 4.0, 5.0, 8.0, 10.0, 16.0, 20.0],
                pinputs: &[1, 2, 3, 4, 5, 6, 7, 8],
                ninputs: &[0],
            },
            dac: Dac {
                bits: 16,
                vmin: 0.0,
                vmax: 4.096,
            },
            adc_slots: 16,
            dac_slots: 1,
            npios: 6,
            nleds: 1,
            adc_slot_fn: s_slots,
        },
        ModelDescriptor {
            id: 3,
            model_str: "[N]",
            serial_fmt: |s| format!("ODN08{s:03}7"),
            adc: Adc {
                bits: 16,
                vmin: -12.288,
                vmax: 12.288,
                pga_gains: &[1.0, 2.0, 4.0, 5.0, 8.0, 10.0, 16.0, 20.0],
                pinputs: &[1, 2, 3, 4, 5, 6, 7, 8],
                ninputs: &[0, 1, 2, 3, 4, 5, 6, 7, 8],
            },
            dac: Dac {
                bits: 16,
                vmin: -4.096,
                vmax: 4.096,
            },
            adc_slots: 16,
            dac_slots: 1,
            npios: 6,
            nleds: 1,
            adc_slot_fn: per_input_slots,
        },
        ModelDescriptor {
            id: 10,
            model_str: "TP08",
            serial_fmt: |s| format!("TP08x10{s:04}"),
            adc: Adc {
                bits: 16,
                vmin: -23.75,
                vmax: 23.75,
                pga_gains: &[1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0],
                pinputs: &[1, 2, 3, 4],
                ninputs: &[0],
            },
            dac: Dac {
                bits: 16,
                vmin: -1.25,
                vmax: 1.25,
            },
            adc_slots: 8,
            dac_slots: 4,
            npios: 4,
            nleds: 8,
            adc_slot_fn: per_input_slots,
        },
        ModelDescriptor {
            id: 11,
            model_str: "TP04",
            serial_fmt: |s| format!("TP04x10{s:04}"),
            adc: Adc {
                bits: 16,
                vmin: -24.0,
                vmax: 24.0,
                pga_gains: &[1.0, 2.0, 4.0, 5.0, 8.0, 10.0, 16.0, 20.0],
                pinputs: &[1, 2],
                ninputs: &[0],
            },
            dac: Dac {
                bits: 16,
                vmin: -1.25,
                vmax: 1.25,
            },
            adc_slots: 4,
            dac_slots: 2,
            npios: 2,
            nleds: 4,
            adc_slot_fn: per_input_slots,
        },
    ]
});

// ============================================================================
// DaqModel
// ============================================================================

/// One opened device: its variant descriptor plus the unit-specific firmware
/// version, serial number and calibration registers.
pub struct DaqModel {
    desc: &'static ModelDescriptor,
    fw_ver: u8,
    serial: u32,
    adc_calib: Vec<CalibReg>,
    dac_calib: Vec<CalibReg>,
}

impl DaqModel {
    /// Look up a variant by its numeric model id.
    pub fn new(model_id: u8, fw_ver: u8, serial: u32) -> Result<Self> {
        let desc = MODELS
            .iter()
            .find(|m| m.id == model_id)
            .ok_or(DaqError::validation("model id", "unknown model"))?;
        if fw_ver < MIN_FW_VERSION {
            return Err(DaqError::validation(
                "firmware version",
                "too old, please update the device",
            ));
        }
        Ok(DaqModel {
            desc,
            fw_ver,
            serial,
            adc_calib: vec![CalibReg::IDENTITY; desc.adc_slots],
            dac_calib: vec![CalibReg::IDENTITY; desc.dac_slots],
        })
    }

    pub fn model_str(&self) -> &'static str {
        self.desc.model_str
    }

    pub fn serial_str(&self) -> String {
        (self.desc.serial_fmt)(self.serial)
    }

    pub fn fw_ver(&self) -> u8 {
        self.fw_ver
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn adc(&self) -> &Adc {
        &self.desc.adc
    }

    pub fn dac(&self) -> &Dac {
        &self.desc.dac
    }

    pub fn npios(&self) -> u8 {
        self.desc.npios
    }

    pub fn nleds(&self) -> u8 {
        self.desc.nleds
    }

    /// Number of calibration slots in device memory (DAC slots first).
    pub fn total_slots(&self) -> usize {
        self.desc.dac_slots + self.desc.adc_slots
    }

    pub fn adc_calib(&self) -> &[CalibReg] {
        &self.adc_calib
    }

    pub fn dac_calib(&self) -> &[CalibReg] {
        &self.dac_calib
    }

    pub fn set_adc_calib(&mut self, regs: &[CalibReg]) -> Result<()> {
        if regs.len() != self.adc_calib.len() {
            return Err(DaqError::validation("adc calibration", "wrong register count"));
        }
        self.adc_calib.copy_from_slice(regs);
        Ok(())
    }

    pub fn set_dac_calib(&mut self, regs: &[CalibReg]) -> Result<()> {
        if regs.len() != self.dac_calib.len() {
            return Err(DaqError::validation("dac calibration", "wrong register count"));
        }
        self.dac_calib.copy_from_slice(regs);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    pub fn check_adc_settings(&self, pinput: u8, ninput: u8, gain_id: u8) -> Result<()> {
        if !self.desc.adc.pinputs.contains(&pinput) {
            return Err(DaqError::validation("pinput", "positive input out of range"));
        }
        if !self.desc.adc.ninputs.contains(&ninput) {
            return Err(DaqError::validation("ninput", "negative input out of range"));
        }
        if gain_id as usize >= self.desc.adc.pga_gains.len() {
            return Err(DaqError::validation("gain", "gain selection out of range"));
        }
        Ok(())
    }

    pub fn check_pio(&self, number: u8) -> Result<()> {
        if !(1..=self.desc.npios).contains(&number) {
            return Err(DaqError::validation("pio", "PIO number out of range"));
        }
        Ok(())
    }

    pub fn check_port(&self, value: u8) -> Result<()> {
        if u32::from(value) >= 1 << self.desc.npios {
            return Err(DaqError::validation("port", "port value out of range"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Transforms
    // ------------------------------------------------------------------------

    /// Calibration slots applying to an analog configuration. The second
    /// slot, when present, sits behind the PGA stage.
    pub(crate) fn adc_slot_indexes(
        &self,
        gain_id: usize,
        pinput: u8,
        ninput: u8,
    ) -> (Option<usize>, Option<usize>) {
        (self.desc.adc_slot_fn)(self.desc, gain_id, pinput, ninput)
    }

    fn adc_reg(&self, slot: Option<usize>) -> Result<CalibReg> {
        match slot {
            None => Ok(CalibReg::IDENTITY),
            Some(i) => self
                .adc_calib
                .get(i)
                .copied()
                .ok_or(DaqError::validation("pinput", "no calibration slot for input")),
        }
    }

    /// Convert a raw ADC reading to volts using the calibration registers of
    /// the given analog configuration.
    pub fn raw_to_volts(&self, raw: i32, gain_id: u8, pinput: u8, ninput: u8) -> Result<f64> {
        self.check_adc_settings(pinput, ninput, gain_id)?;
        let pga_gain = *self
            .desc
            .adc
            .pga_gains
            .get(gain_id as usize)
            .ok_or(DaqError::validation("gain", "gain selection out of range"))?;

        let (slot1, slot2) = self.adc_slot_indexes(gain_id as usize, pinput, ninput);
        let reg1 = self.adc_reg(slot1)?;
        let reg2 = self.adc_reg(slot2)?;

        let adc_gain = f64::from(1u32 << (self.desc.adc.bits - 1)) / self.desc.adc.vmax;
        let gain = adc_gain * pga_gain * reg1.gain * reg2.gain;
        let offset = reg1.offset * pga_gain + reg2.offset;
        Ok((f64::from(raw) - offset) / gain)
    }

    /// Convert a voltage to the raw DAC code for a calibration slot.
    ///
    /// Fails when `volts` lies outside the model's DAC span; rounding is
    /// half-to-even and the result saturates at the DAC's signed width.
    pub fn volts_to_raw(&self, volts: f64, number: usize) -> Result<i16> {
        if !(self.desc.dac.vmin <= volts && volts <= self.desc.dac.vmax) {
            return Err(DaqError::Range("DAC voltage out of range"));
        }
        let reg = self
            .dac_calib
            .get(number)
            .copied()
            .ok_or(DaqError::validation("number", "DAC calibration slot out of range"))?;

        let base_gain = self.desc.dac.vmax / f64::from(1u32 << (self.desc.dac.bits - 1));
        let raw = ((volts - reg.offset) / (reg.gain * base_gain)).round_ties_even();

        let lo = -(1i32 << (self.desc.dac.bits - 1));
        let hi = (1i32 << (self.desc.dac.bits - 1)) - 1;
        Ok((raw as i32).clamp(lo, hi) as i16)
    }

    // ------------------------------------------------------------------------
    // Calibration transfer
    // ------------------------------------------------------------------------

    /// Load every calibration register through `read_slot`, which performs
    /// one read-calibration round trip and returns the raw (gain, offset)
    /// pair of a slot. DAC slots come first in device memory.
    pub fn load_calibration<F>(&mut self, mut read_slot: F) -> Result<()>
    where
        F: FnMut(usize) -> Result<(i16, i16)>,
    {
        for i in 0..self.dac_calib.len() {
            let (gain, offset) = read_slot(i)?;
            self.dac_calib[i] = CalibReg {
                gain: 1.0 + f64::from(gain) / 65536.0,
                offset: f64::from(offset) / 65536.0,
            };
        }
        for i in 0..self.adc_calib.len() {
            let (gain, offset) = read_slot(i + self.dac_calib.len())?;
            self.adc_calib[i] = CalibReg {
                gain: 1.0 + f64::from(gain) / 65536.0,
                offset: f64::from(offset) / 32.0,
            };
        }
        Ok(())
    }

    /// Store calibration registers through `write_slot`, which performs one
    /// write-calibration round trip for a slot.
    pub fn save_calibration<F>(&self, mut write_slot: F, target: CalTarget) -> Result<()>
    where
        F: FnMut(usize, i16, i16) -> Result<()>,
    {
        if target != CalTarget::AdcOnly {
            for (i, reg) in self.dac_calib.iter().enumerate() {
                let gain = ((reg.gain - 1.0) * 65536.0).round_ties_even() as i16;
                let offset = (reg.offset * 65536.0).round_ties_even() as i16;
                write_slot(i, gain, offset)?;
            }
        }
        if target != CalTarget::DacOnly {
            for (i, reg) in self.adc_calib.iter().enumerate() {
                let gain = ((reg.gain - 1.0) * 65536.0).round_ties_even() as i16;
                let offset = (reg.offset * 32.0).round_ties_even() as i16;
                write_slot(i + self.dac_calib.len(), gain, offset)?;
            }
        }
        Ok(())
    }
}
