//! The waveform algebra.
//!
//! A [`Waveform`] is an immutable function of time `t ∈ [0, width)` returning a complex
//! value. Outside that interval every waveform evaluates to zero. Hardware channels only
//! play the real part; the imaginary part is carried around so that IQ modulation can be
//! expressed as ordinary algebra and split at the end with [`Waveform::real`] /
//! [`Waveform::imag`].
//!
//! Waveforms are built from primitives ([`Waveform::dc`], [`Waveform::blank`],
//! [`Waveform::sin`], [`Waveform::cos`], [`Waveform::complex_exp`],
//! [`Waveform::gaussian`]) and combined with
//! - [`Waveform::concat`]: time concatenation, nested sequences are spliced flat;
//! - [`Waveform::sum`]: pointwise sum, width is the larger of the two;
//! - [`Waveform::carry`]: pointwise product, used to modulate an envelope with a carrier.
//!
//! Combinators take their operands by value and share sub-trees through [`Arc`], so a
//! waveform can be cheaply cloned into several slices.
//!
//! ## Example
//! ```
//! # use seqcompiler_backend::*;
//! let envelope = Waveform::gaussian(100e-9, 0.8);
//! let carrier = Waveform::cos(100e-9, 1., 2. * std::f64::consts::PI * 50e6, 0.);
//! let pulse = Waveform::blank(20e-9).concat(envelope.carry(carrier));
//! assert!((pulse.width() - 120e-9).abs() < 1e-15);
//! // Gaussian envelope peaks at its center, where the carrier is cos(2π·50MHz·50ns) = -1
//! assert!((pulse.at_real(70e-9) + 0.8).abs() < 1e-9);
//! ```

use std::f64::consts::LN_2;
use std::fmt;
use std::sync::Arc;

use ndarray::{s, Array1, ArrayView1, ArrayViewMut1};
use num_complex::Complex64;

use crate::calibration::CalibratedIq;
use crate::error::{Error, Result};
use crate::utils::{align_up, sample_count};

const ZERO: Complex64 = Complex64::new(0., 0.);

/// Parameters shared by the periodic primitives.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Oscillation {
    pub width: f64,
    pub amplitude: f64,
    /// Angular frequency (rad/s).
    pub omega: f64,
    /// Initial phase (rad).
    pub phi: f64,
}

impl Oscillation {
    fn scaled(self, factor: f64) -> Self {
        Self {
            amplitude: self.amplitude * factor,
            ..self
        }
    }

    fn angle(&self, t: f64) -> f64 {
        self.omega * t + self.phi
    }
}

/// Two operands of a pointwise operation, with the resulting width cached.
#[derive(Clone, Debug, PartialEq)]
pub struct Pair {
    lhs: Arc<Waveform>,
    rhs: Arc<Waveform>,
    width: f64,
}

impl Pair {
    fn new(lhs: Waveform, rhs: Waveform) -> Self {
        let width = lhs.width().max(rhs.width());
        Self {
            lhs: Arc::new(lhs),
            rhs: Arc::new(rhs),
            width,
        }
    }

    pub fn lhs(&self) -> &Waveform {
        &self.lhs
    }

    pub fn rhs(&self) -> &Waveform {
        &self.rhs
    }
}

/// A flat list of waveforms played back to back.
///
/// `starts[k]` is the offset of `parts[k]`; `starts` has one more entry than `parts`, the
/// last one being the total width. Nested concatenations are spliced on construction so
/// lookup is a single binary search.
#[derive(Clone, Debug, PartialEq)]
pub struct Concatenation {
    parts: Vec<Waveform>,
    starts: Vec<f64>,
}

impl Concatenation {
    fn new(waveforms: impl IntoIterator<Item = Waveform>) -> Self {
        let mut parts = Vec::new();
        for waveform in waveforms {
            match waveform {
                Waveform::Sequence(nested) => parts.extend(nested.parts),
                other => parts.push(other),
            }
        }
        let mut starts = Vec::with_capacity(parts.len() + 1);
        let mut offset = 0.;
        starts.push(offset);
        for part in &parts {
            offset += part.width();
            starts.push(offset);
        }
        Self { parts, starts }
    }

    pub fn parts(&self) -> &[Waveform] {
        &self.parts
    }

    pub fn width(&self) -> f64 {
        self.starts.last().copied().unwrap_or(0.)
    }

    fn at(&self, t: f64) -> Complex64 {
        // Last part starting at or before t; zero-width parts are skipped naturally
        let idx = self.starts.partition_point(|&start| start <= t);
        if idx == 0 || idx > self.parts.len() {
            return ZERO;
        }
        let k = idx - 1;
        self.parts[k].at(t - self.starts[k])
    }
}

/// Immutable complex-valued function of time, zero outside `[0, width)`.
#[derive(Clone, Debug, PartialEq)]
pub enum Waveform {
    /// Constant `amplitude · e^{j·phase}`. A zero-amplitude DC is a blank.
    Dc {
        width: f64,
        amplitude: f64,
        phase: f64,
    },
    /// `amplitude · sin(ωt + φ)`
    Sin(Oscillation),
    /// `amplitude · cos(ωt + φ)`
    Cos(Oscillation),
    /// `amplitude · e^{j(ωt + φ)}`
    ComplexExp(Oscillation),
    /// Gaussian centered at `width / 2` whose full width at half maximum is `width / 2`.
    Gaussian { width: f64, amplitude: f64 },
    Sum(Pair),
    Carry(Pair),
    Sequence(Concatenation),
    CalibratedIq(Arc<CalibratedIq>),
    /// Real part of the inner waveform.
    Real(Arc<Waveform>),
    /// Imaginary part of the inner waveform, returned as a real value.
    Imag(Arc<Waveform>),
}

impl Waveform {
    /// Zero-amplitude filler.
    pub fn blank(width: f64) -> Self {
        Self::dc(width, 0.)
    }

    pub fn dc(width: f64, amplitude: f64) -> Self {
        Self::dc_with_phase(width, amplitude, 0.)
    }

    /// Complex constant `amplitude · e^{j·phase}`.
    pub fn dc_with_phase(width: f64, amplitude: f64, phase: f64) -> Self {
        Waveform::Dc {
            width,
            amplitude,
            phase,
        }
    }

    pub fn sin(width: f64, amplitude: f64, omega: f64, phi: f64) -> Self {
        Waveform::Sin(Oscillation {
            width,
            amplitude,
            omega,
            phi,
        })
    }

    pub fn cos(width: f64, amplitude: f64, omega: f64, phi: f64) -> Self {
        Waveform::Cos(Oscillation {
            width,
            amplitude,
            omega,
            phi,
        })
    }

    pub fn complex_exp(width: f64, amplitude: f64, omega: f64, phi: f64) -> Self {
        Waveform::ComplexExp(Oscillation {
            width,
            amplitude,
            omega,
            phi,
        })
    }

    pub fn gaussian(width: f64, amplitude: f64) -> Self {
        Waveform::Gaussian { width, amplitude }
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, Waveform::Dc { amplitude, .. } if *amplitude == 0.)
    }

    pub fn width(&self) -> f64 {
        match self {
            Waveform::Dc { width, .. } | Waveform::Gaussian { width, .. } => *width,
            Waveform::Sin(o) | Waveform::Cos(o) | Waveform::ComplexExp(o) => o.width,
            Waveform::Sum(pair) | Waveform::Carry(pair) => pair.width,
            Waveform::Sequence(seq) => seq.width(),
            Waveform::CalibratedIq(iq) => iq.width(),
            Waveform::Real(inner) | Waveform::Imag(inner) => inner.width(),
        }
    }

    /// Nominal amplitude. Composites report `1`, except the real / imaginary views which
    /// report their inner waveform's amplitude.
    pub fn amplitude(&self) -> f64 {
        match self {
            Waveform::Dc { amplitude, .. } | Waveform::Gaussian { amplitude, .. } => *amplitude,
            Waveform::Sin(o) | Waveform::Cos(o) | Waveform::ComplexExp(o) => o.amplitude,
            Waveform::Sum(_) | Waveform::Carry(_) | Waveform::Sequence(_) => 1.,
            Waveform::CalibratedIq(iq) => iq.amplitude(),
            Waveform::Real(inner) | Waveform::Imag(inner) => inner.amplitude(),
        }
    }

    /// Complex value at `t`; zero outside `[0, width)`.
    pub fn at(&self, t: f64) -> Complex64 {
        if !(0. ..self.width()).contains(&t) {
            return ZERO;
        }
        match self {
            Waveform::Dc {
                amplitude, phase, ..
            } => {
                if *phase == 0. {
                    Complex64::new(*amplitude, 0.)
                } else {
                    Complex64::from_polar(*amplitude, *phase)
                }
            }
            Waveform::Sin(o) => Complex64::new(o.amplitude * o.angle(t).sin(), 0.),
            Waveform::Cos(o) => Complex64::new(o.amplitude * o.angle(t).cos(), 0.),
            Waveform::ComplexExp(o) => Complex64::from_polar(o.amplitude, o.angle(t)),
            Waveform::Gaussian { width, amplitude } => {
                let sigma = width / (4. * (2. * LN_2).sqrt());
                let x = (t - width / 2.) / sigma;
                Complex64::new(amplitude * (-0.5 * x * x).exp(), 0.)
            }
            Waveform::Sum(pair) => pair.lhs.at(t) + pair.rhs.at(t),
            Waveform::Carry(pair) => pair.lhs.at(t) * pair.rhs.at(t),
            Waveform::Sequence(seq) => seq.at(t),
            Waveform::CalibratedIq(iq) => iq.at(t),
            Waveform::Real(inner) => Complex64::new(inner.at(t).re, 0.),
            Waveform::Imag(inner) => Complex64::new(inner.at(t).im, 0.),
        }
    }

    /// Real part of [`Waveform::at`], which is what a channel plays.
    pub fn at_real(&self, t: f64) -> f64 {
        self.at(t).re
    }

    /// `self` followed by `other`.
    pub fn concat(self, other: Waveform) -> Waveform {
        Waveform::Sequence(Concatenation::new([self, other]))
    }

    /// `other` followed by `self`.
    pub fn append_to(self, other: Waveform) -> Waveform {
        other.concat(self)
    }

    pub fn sum(self, other: Waveform) -> Waveform {
        Waveform::Sum(Pair::new(self, other))
    }

    /// Pointwise product. The result lasts as long as the longer operand but vanishes
    /// wherever either operand does.
    pub fn carry(self, other: Waveform) -> Waveform {
        Waveform::Carry(Pair::new(self, other))
    }

    pub fn real(self) -> Waveform {
        Waveform::Real(Arc::new(self))
    }

    pub fn imag(self) -> Waveform {
        Waveform::Imag(Arc::new(self))
    }

    /// Multiplies the waveform by `factor`.
    ///
    /// Primitives scale their amplitude. A sum scales both operands, a carry only its
    /// first one (scaling both would scale the product twice), a sequence every element.
    /// Fails with [`Error::ScaleCalibrated`] if a calibrated IQ waveform is reached.
    ///
    /// ```
    /// # use seqcompiler_backend::*;
    /// let w = Waveform::dc(1e-6, 0.5).sum(Waveform::dc(2e-6, 0.25));
    /// let w = w.scale(2.).unwrap();
    /// assert_eq!(w.at_real(0.), 1.5);
    /// assert_eq!(w.at_real(1.5e-6), 0.5);
    ///
    /// let i = Some(Waveform::dc(1e-6, 1.));
    /// let iq = CalibratedIq::new(10e6, i, None, None, Conversion::Up).unwrap();
    /// assert!(Waveform::from(iq).real().scale(2.).is_err());
    /// ```
    pub fn scale(self, factor: f64) -> Result<Waveform> {
        let scaled = match self {
            Waveform::Dc {
                width,
                amplitude,
                phase,
            } => Waveform::Dc {
                width,
                amplitude: amplitude * factor,
                phase,
            },
            Waveform::Sin(o) => Waveform::Sin(o.scaled(factor)),
            Waveform::Cos(o) => Waveform::Cos(o.scaled(factor)),
            Waveform::ComplexExp(o) => Waveform::ComplexExp(o.scaled(factor)),
            Waveform::Gaussian { width, amplitude } => Waveform::Gaussian {
                width,
                amplitude: amplitude * factor,
            },
            Waveform::Sum(pair) => {
                let lhs = take(pair.lhs).scale(factor)?;
                let rhs = take(pair.rhs).scale(factor)?;
                lhs.sum(rhs)
            }
            Waveform::Carry(pair) => take(pair.lhs).scale(factor)?.carry(take(pair.rhs)),
            Waveform::Sequence(seq) => {
                let parts = seq
                    .parts
                    .into_iter()
                    .map(|part| part.scale(factor))
                    .collect::<Result<Vec<_>>>()?;
                Waveform::Sequence(Concatenation::new(parts))
            }
            Waveform::CalibratedIq(_) => return Err(Error::ScaleCalibrated),
            Waveform::Real(inner) => take(inner).scale(factor)?.real(),
            Waveform::Imag(inner) => take(inner).scale(factor)?.imag(),
        };
        Ok(scaled)
    }

    pub fn negate(self) -> Result<Waveform> {
        self.scale(-1.)
    }

    /// Evaluates the real part in place: every entry of `t_arr` is a time and gets replaced
    /// by the waveform value at that time.
    pub fn eval_inplace(&self, t_arr: &mut ArrayViewMut1<f64>) {
        t_arr.map_inplace(|t| *t = self.at(*t).re);
    }

    /// Samples the real part on the grid `i / samp_rate` for `i` such that the point lies
    /// in `[0, width)`. The buffer is zero-padded to a multiple of `min_unit`.
    ///
    /// ```
    /// # use seqcompiler_backend::*;
    /// let samples = Waveform::dc(100e-9, 0.3).sample(1e9, 16);
    /// assert_eq!(samples.len(), 112);
    /// assert_eq!(samples[99], 0.3);
    /// assert_eq!(samples[100], 0.);
    /// ```
    pub fn sample(&self, samp_rate: f64, min_unit: usize) -> Array1<f64> {
        let len = sample_count(self.width(), samp_rate);
        let mut buffer = Array1::zeros(align_up(len, min_unit));
        let mut head = buffer.slice_mut(s![..len]);
        head.indexed_iter_mut()
            .for_each(|(i, t)| *t = i as f64 / samp_rate);
        self.eval_inplace(&mut head);
        buffer
    }

    /// Complex counterpart of [`Waveform::sample`].
    pub fn sample_complex(&self, samp_rate: f64, min_unit: usize) -> Array1<Complex64> {
        let len = sample_count(self.width(), samp_rate);
        let mut buffer = Array1::from_elem(align_up(len, min_unit), ZERO);
        buffer
            .slice_mut(s![..len])
            .indexed_iter_mut()
            .for_each(|(i, v)| *v = self.at(i as f64 / samp_rate));
        buffer
    }

    /// Samples and normalizes to a peak of 1. Returns the samples and the factor to restore
    /// them (the peak absolute value). An all-zero waveform returns factor `0`.
    pub fn normalized_sample(&self, samp_rate: f64, min_unit: usize) -> (Array1<f64>, f64) {
        let mut samples = self.sample(samp_rate, min_unit);
        let peak = samples.iter().fold(0_f64, |acc, v| acc.max(v.abs()));
        if peak > 0. {
            samples.mapv_inplace(|v| v / peak);
        }
        (samples, peak)
    }

    /// Evaluates the real part at arbitrary `times`, for previews.
    pub fn thumbnail_sample(&self, times: ArrayView1<f64>) -> Array1<f64> {
        times.mapv(|t| self.at(t).re)
    }
}

impl From<f64> for Waveform {
    /// A zero-width constant, handy as a neutral element of [`Waveform::concat`].
    fn from(amplitude: f64) -> Self {
        Waveform::dc(0., amplitude)
    }
}

fn take(shared: Arc<Waveform>) -> Waveform {
    Arc::try_unwrap(shared).unwrap_or_else(|shared| (*shared).clone())
}

fn indented(waveform: &Waveform) -> String {
    waveform
        .to_string()
        .lines()
        .map(|line| format!("  {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl fmt::Display for Waveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.width();
        match self {
            Waveform::Dc { amplitude, .. } if *amplitude == 0. => {
                write!(f, "<Blank, width: {width:e} s>")
            }
            Waveform::Dc {
                amplitude, phase, ..
            } => write!(
                f,
                "<DC, amplitude: {amplitude} V, phase: {phase} rad, width: {width:e} s>"
            ),
            Waveform::Sin(o) | Waveform::Cos(o) | Waveform::ComplexExp(o) => {
                let kind = match self {
                    Waveform::Sin(_) => "Sin",
                    Waveform::Cos(_) => "Cos",
                    _ => "ComplexExp",
                };
                write!(
                    f,
                    "<{kind}, amplitude: {} V, omega: {:e} rad/s, phi: {} rad, width: {width:e} s>",
                    o.amplitude, o.omega, o.phi
                )
            }
            Waveform::Gaussian { amplitude, .. } => {
                write!(f, "<Gaussian, amplitude: {amplitude} V, width: {width:e} s>")
            }
            Waveform::Sum(pair) | Waveform::Carry(pair) => {
                let kind = if matches!(self, Waveform::Sum(_)) {
                    "Sum"
                } else {
                    "Carry"
                };
                write!(
                    f,
                    "<{kind}, width: {width:e} s>\n{}\n{}",
                    indented(&pair.lhs),
                    indented(&pair.rhs)
                )
            }
            Waveform::Sequence(seq) => {
                write!(f, "<Sequence, {} parts, width: {width:e} s>", seq.parts.len())?;
                for part in &seq.parts {
                    write!(f, "\n{}", indented(part))?;
                }
                Ok(())
            }
            Waveform::CalibratedIq(iq) => write!(
                f,
                "<CalibratedIQ, carrier: {:e} Hz, width: {width:e} s>\n{}",
                iq.carry_freq(),
                indented(iq.carry_iq())
            ),
            Waveform::Real(inner) => write!(f, "<Real, width: {width:e} s>\n{}", indented(inner)),
            Waveform::Imag(inner) => write!(f, "<Imag, width: {width:e} s>\n{}", indented(inner)),
        }
    }
}
