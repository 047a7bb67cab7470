//! Calibrated single-sideband IQ modulation.
//!
//! An IQ mixer multiplies a complex baseband `I(t) + jQ(t)` onto a carrier. Real mixers
//! are imperfect: the two arms have different gains, are not exactly in quadrature and
//! their cables have different lengths. An [`IqCalibration`] record captures these
//! imperfections and [`CalibratedIq`] pre-distorts the baseband so the mixer output is
//! the intended sideband.
//!
//! The record is consumed as-is; reading it from calibration files is left to the caller.

use std::f64::consts::{FRAC_PI_2, PI};
use std::sync::Arc;

use num_complex::Complex64;

use crate::error::{Error, Result};
use crate::waveform::{Oscillation, Waveform};

/// Parsed IQ mixer calibration.
///
/// - `i_offset`, `q_offset`: DC offsets (V) to apply on the I / Q channels for the whole
///   cycle to cancel local oscillator leakage. They are not baked into waveforms, see
///   [`BaseSequence::apply_iq_offsets`](crate::sequence::BaseSequence::apply_iq_offsets).
/// - `i_amp_factor`, `q_amp_factor`: amplitude imbalance correction.
/// - `i_phase_shift`, `q_phase_shift`: phase corrections (rad) at the carrier frequency.
/// - `i_time_offset`, `q_time_offset`: skew corrections (s).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IqCalibration {
    pub i_offset: f64,
    pub q_offset: f64,
    pub i_amp_factor: f64,
    pub q_amp_factor: f64,
    pub i_phase_shift: f64,
    pub q_phase_shift: f64,
    pub i_time_offset: f64,
    pub q_time_offset: f64,
}

impl Default for IqCalibration {
    fn default() -> Self {
        Self {
            i_offset: 0.,
            q_offset: 0.,
            i_amp_factor: 1.,
            q_amp_factor: 1.,
            i_phase_shift: 0.,
            q_phase_shift: 0.,
            i_time_offset: 0.,
            q_time_offset: 0.,
        }
    }
}

/// Direction of the frequency conversion performed by the mixer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Conversion {
    /// Baseband is multiplied by `e^{-jωt}`.
    #[default]
    Up,
    /// Baseband is multiplied by `e^{+jωt}`.
    Down,
}

/// A complex waveform `(I + jQ) · e^{∓jωt}` with the calibration baked in.
///
/// The real part drives the I channel and the imaginary part the Q channel; split them
/// with [`Waveform::real`] and [`Waveform::imag`].
///
/// `CalibratedIq` deliberately has no `scale` method: once the calibration is applied,
/// rescaling the result would also rescale the imbalance correction. Scale the baseband
/// inputs instead.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibratedIq {
    carry_freq: f64,
    carry_iq: Waveform,
    width: f64,
    amplitude: f64,
    shift_i: f64,
    shift_q: f64,
    scale_i: f64,
    scale_q: f64,
}

impl CalibratedIq {
    /// Builds the calibrated waveform.
    ///
    /// At least one of `i_waveform` and `q_waveform` must be given. The calibration is only
    /// applied for a non-zero `carry_freq`, since phase corrections are converted to time
    /// shifts through `ω = 2π · carry_freq`.
    ///
    /// ```
    /// # use seqcompiler_backend::*;
    /// let envelope = Waveform::dc(1e-6, 0.5);
    /// let iq = CalibratedIq::new(50e6, Some(envelope), None, None, Conversion::Up).unwrap();
    /// let iq = Waveform::from(iq);
    /// assert_eq!(iq.width(), 1e-6);
    /// ```
    pub fn new(
        carry_freq: f64,
        i_waveform: Option<Waveform>,
        q_waveform: Option<Waveform>,
        calibration: Option<&IqCalibration>,
        conversion: Conversion,
    ) -> Result<Self> {
        let iq_waveform = match (i_waveform, q_waveform) {
            (None, None) => return Err(Error::MissingIqInput),
            (Some(i), None) => i,
            (None, Some(q)) => quadrature(q),
            (Some(i), Some(q)) => i.sum(quadrature(q)),
        };
        let width = iq_waveform.width();
        let amplitude = iq_waveform.amplitude();
        let omega = 2. * PI * carry_freq;
        let carrier = Waveform::ComplexExp(Oscillation {
            width,
            amplitude: 1.,
            omega: match conversion {
                Conversion::Up => -omega,
                Conversion::Down => omega,
            },
            phi: 0.,
        });

        let mut cali = Self {
            carry_freq,
            carry_iq: iq_waveform.carry(carrier),
            width,
            amplitude,
            shift_i: 0.,
            shift_q: 0.,
            scale_i: 1.,
            scale_q: 1.,
        };
        if let Some(record) = calibration {
            if carry_freq != 0. {
                cali.scale_i = record.i_amp_factor;
                cali.scale_q = record.q_amp_factor;
                // A phase shift at the carrier frequency is equivalent to a time shift
                cali.shift_i = record.i_phase_shift / omega + record.i_time_offset;
                cali.shift_q = record.q_phase_shift / omega + record.q_time_offset;
            }
        }
        Ok(cali)
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }

    pub fn carry_freq(&self) -> f64 {
        self.carry_freq
    }

    /// The uncalibrated modulated waveform `(I + jQ) · carrier`.
    pub fn carry_iq(&self) -> &Waveform {
        &self.carry_iq
    }

    pub fn at(&self, t: f64) -> Complex64 {
        if !(0. ..self.width).contains(&t) {
            return Complex64::new(0., 0.);
        }
        let i_value = self.carry_iq.at(t + self.shift_i).re * self.scale_i;
        let q_value = self.carry_iq.at(t + self.shift_q).im * self.scale_q;
        Complex64::new(i_value, q_value)
    }
}

impl From<CalibratedIq> for Waveform {
    fn from(iq: CalibratedIq) -> Self {
        Waveform::CalibratedIq(Arc::new(iq))
    }
}

// Multiplies a waveform by j
fn quadrature(q: Waveform) -> Waveform {
    let j = Waveform::dc_with_phase(q.width(), 1., FRAC_PI_2);
    q.carry(j)
}
