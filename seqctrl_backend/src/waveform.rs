//! Python classes wrapping [`Waveform`] and [`IqCalibration`].
//!
//! Waveforms are immutable on both sides: every combinator returns a new `Waveform`
//! object and leaves its operands untouched, so a pulse can be reused across slices.
//!
//! ## Example (python)
//! ```python
//! from seqctrl_backend import Waveform, IqCalibration
//!
//! pulse = Waveform.gaussian(40e-9, 0.5).concat(Waveform.blank(10e-9))
//! cal = IqCalibration(q_amp_factor=0.97, q_phase_shift=0.03)
//! iq = Waveform.calibrated_iq(50e6, i=pulse, calibration=cal)
//! i, q = iq.real(), iq.imag()
//! ```

use num_complex::Complex64;
use numpy::{IntoPyArray, PyArray1, PyReadonlyArray1};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use seqcompiler_backend::{CalibratedIq, Conversion, IqCalibration, Waveform, DEFAULT_MIN_UNIT};

use crate::utils::to_py_err;

#[pyclass(name = "IqCalibration")]
#[derive(Clone)]
pub struct PyIqCalibration {
    pub inner: IqCalibration,
}

#[pymethods]
impl PyIqCalibration {
    #[new]
    #[pyo3(signature = (
        i_offset = 0., q_offset = 0.,
        i_amp_factor = 1., q_amp_factor = 1.,
        i_phase_shift = 0., q_phase_shift = 0.,
        i_time_offset = 0., q_time_offset = 0.
    ))]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        i_offset: f64,
        q_offset: f64,
        i_amp_factor: f64,
        q_amp_factor: f64,
        i_phase_shift: f64,
        q_phase_shift: f64,
        i_time_offset: f64,
        q_time_offset: f64,
    ) -> Self {
        Self {
            inner: IqCalibration {
                i_offset,
                q_offset,
                i_amp_factor,
                q_amp_factor,
                i_phase_shift,
                q_phase_shift,
                i_time_offset,
                q_time_offset,
            },
        }
    }

    #[getter]
    fn i_offset(&self) -> f64 {
        self.inner.i_offset
    }
    #[setter]
    fn set_i_offset(&mut self, value: f64) {
        self.inner.i_offset = value;
    }
    #[getter]
    fn q_offset(&self) -> f64 {
        self.inner.q_offset
    }
    #[setter]
    fn set_q_offset(&mut self, value: f64) {
        self.inner.q_offset = value;
    }
    #[getter]
    fn i_amp_factor(&self) -> f64 {
        self.inner.i_amp_factor
    }
    #[setter]
    fn set_i_amp_factor(&mut self, value: f64) {
        self.inner.i_amp_factor = value;
    }
    #[getter]
    fn q_amp_factor(&self) -> f64 {
        self.inner.q_amp_factor
    }
    #[setter]
    fn set_q_amp_factor(&mut self, value: f64) {
        self.inner.q_amp_factor = value;
    }
    #[getter]
    fn i_phase_shift(&self) -> f64 {
        self.inner.i_phase_shift
    }
    #[setter]
    fn set_i_phase_shift(&mut self, value: f64) {
        self.inner.i_phase_shift = value;
    }
    #[getter]
    fn q_phase_shift(&self) -> f64 {
        self.inner.q_phase_shift
    }
    #[setter]
    fn set_q_phase_shift(&mut self, value: f64) {
        self.inner.q_phase_shift = value;
    }
    #[getter]
    fn i_time_offset(&self) -> f64 {
        self.inner.i_time_offset
    }
    #[setter]
    fn set_i_time_offset(&mut self, value: f64) {
        self.inner.i_time_offset = value;
    }
    #[getter]
    fn q_time_offset(&self) -> f64 {
        self.inner.q_time_offset
    }
    #[setter]
    fn set_q_time_offset(&mut self, value: f64) {
        self.inner.q_time_offset = value;
    }

    fn __repr__(&self) -> String {
        format!("{:?}", self.inner)
    }
}

#[pyclass(name = "Waveform")]
#[derive(Clone, Debug)]
pub struct PyWaveform {
    pub inner: Waveform,
}

impl From<Waveform> for PyWaveform {
    fn from(inner: Waveform) -> Self {
        Self { inner }
    }
}

fn parse_conversion(conversion: &str) -> PyResult<Conversion> {
    match conversion {
        "up" => Ok(Conversion::Up),
        "down" => Ok(Conversion::Down),
        other => Err(PyValueError::new_err(format!(
            "conversion must be 'up' or 'down', got '{other}'"
        ))),
    }
}

#[pymethods]
impl PyWaveform {
    /// Zero-amplitude waveform of `width` seconds.
    #[staticmethod]
    pub fn blank(width: f64) -> Self {
        Waveform::blank(width).into()
    }

    #[staticmethod]
    #[pyo3(signature = (width, amplitude, phase = 0.))]
    pub fn dc(width: f64, amplitude: f64, phase: f64) -> Self {
        Waveform::dc_with_phase(width, amplitude, phase).into()
    }

    /// `amplitude * sin(omega * t + phi)` on `[0, width)`.
    #[staticmethod]
    #[pyo3(signature = (width, amplitude, omega, phi = 0.))]
    pub fn sin(width: f64, amplitude: f64, omega: f64, phi: f64) -> Self {
        Waveform::sin(width, amplitude, omega, phi).into()
    }

    #[staticmethod]
    #[pyo3(signature = (width, amplitude, omega, phi = 0.))]
    pub fn cos(width: f64, amplitude: f64, omega: f64, phi: f64) -> Self {
        Waveform::cos(width, amplitude, omega, phi).into()
    }

    #[staticmethod]
    #[pyo3(signature = (width, amplitude, omega, phi = 0.))]
    pub fn complex_exp(width: f64, amplitude: f64, omega: f64, phi: f64) -> Self {
        Waveform::complex_exp(width, amplitude, omega, phi).into()
    }

    /// Gaussian centered in its window, with a full width at half maximum of `width / 2`.
    #[staticmethod]
    pub fn gaussian(width: f64, amplitude: f64) -> Self {
        Waveform::gaussian(width, amplitude).into()
    }

    /// Single-sideband modulation of `i + j*q` on a carrier of `carry_freq` Hz.
    ///
    /// `conversion` is `"up"` (carrier `e^{-jωt}`) or `"down"` (`e^{+jωt}`). The
    /// calibration is ignored when `carry_freq` is zero.
    #[staticmethod]
    #[pyo3(signature = (carry_freq, i = None, q = None, calibration = None, conversion = "up"))]
    pub fn calibrated_iq(
        carry_freq: f64,
        i: Option<PyWaveform>,
        q: Option<PyWaveform>,
        calibration: Option<PyIqCalibration>,
        conversion: &str,
    ) -> PyResult<Self> {
        let calibrated = CalibratedIq::new(
            carry_freq,
            i.map(|w| w.inner),
            q.map(|w| w.inner),
            calibration.as_ref().map(|c| &c.inner),
            parse_conversion(conversion)?,
        )
        .map_err(to_py_err)?;
        Ok(Waveform::from(calibrated).into())
    }

    #[getter]
    pub fn width(&self) -> f64 {
        self.inner.width()
    }

    #[getter]
    pub fn amplitude(&self) -> f64 {
        self.inner.amplitude()
    }

    pub fn is_blank(&self) -> bool {
        self.inner.is_blank()
    }

    /// `self` followed by `other`.
    pub fn concat(&self, other: PyWaveform) -> Self {
        self.inner.clone().concat(other.inner).into()
    }

    /// `other` followed by `self`.
    pub fn append_to(&self, other: PyWaveform) -> Self {
        self.inner.clone().append_to(other.inner).into()
    }

    pub fn sum(&self, other: PyWaveform) -> Self {
        self.inner.clone().sum(other.inner).into()
    }

    /// Pointwise product; `self` is the envelope, `other` the carrier.
    pub fn carry(&self, other: PyWaveform) -> Self {
        self.inner.clone().carry(other.inner).into()
    }

    pub fn real(&self) -> Self {
        self.inner.clone().real().into()
    }

    pub fn imag(&self) -> Self {
        self.inner.clone().imag().into()
    }

    /// Raises `ValueError` on a calibrated IQ waveform.
    pub fn scale(&self, factor: f64) -> PyResult<Self> {
        self.inner
            .clone()
            .scale(factor)
            .map(Self::from)
            .map_err(to_py_err)
    }

    pub fn negate(&self) -> PyResult<Self> {
        self.inner.clone().negate().map(Self::from).map_err(to_py_err)
    }

    pub fn at(&self, t: f64) -> Complex64 {
        self.inner.at(t)
    }

    /// Real part sampled at `samp_rate`, padded to a multiple of `min_unit` samples.
    #[pyo3(signature = (samp_rate, min_unit = DEFAULT_MIN_UNIT))]
    pub fn sample<'py>(
        &self,
        py: Python<'py>,
        samp_rate: f64,
        min_unit: usize,
    ) -> &'py PyArray1<f64> {
        self.inner.sample(samp_rate, min_unit).into_pyarray(py)
    }

    #[pyo3(signature = (samp_rate, min_unit = DEFAULT_MIN_UNIT))]
    pub fn sample_complex<'py>(
        &self,
        py: Python<'py>,
        samp_rate: f64,
        min_unit: usize,
    ) -> &'py PyArray1<Complex64> {
        self.inner.sample_complex(samp_rate, min_unit).into_pyarray(py)
    }

    /// Returns `(samples, peak)` with `samples` scaled to a peak of one.
    #[pyo3(signature = (samp_rate, min_unit = DEFAULT_MIN_UNIT))]
    pub fn normalized_sample<'py>(
        &self,
        py: Python<'py>,
        samp_rate: f64,
        min_unit: usize,
    ) -> (&'py PyArray1<f64>, f64) {
        let (samples, peak) = self.inner.normalized_sample(samp_rate, min_unit);
        (samples.into_pyarray(py), peak)
    }

    /// Real part evaluated at arbitrary times, for previews.
    pub fn thumbnail_sample<'py>(
        &self,
        py: Python<'py>,
        times: PyReadonlyArray1<f64>,
    ) -> &'py PyArray1<f64> {
        self.inner.thumbnail_sample(times.as_array()).into_pyarray(py)
    }

    fn __repr__(&self) -> String {
        self.inner.to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn combinators_leave_operands_untouched() {
        let pulse = PyWaveform::dc(1e-6, 0.5, 0.);
        let train = pulse.concat(PyWaveform::blank(1e-6)).concat(pulse.clone());
        assert_eq!(pulse.width(), 1e-6);
        assert!((train.width() - 3e-6).abs() < 1e-18);
        assert_eq!(train.at(2.5e-6).re, 0.5);
        assert_eq!(train.at(1.5e-6).re, 0.);
    }

    #[test]
    fn gaussian_half_maximum() {
        let g = PyWaveform::gaussian(1e-6, 0.8);
        assert!((g.at(0.5e-6).re - 0.8).abs() < 1e-12);
        assert!((g.at(0.25e-6).re - 0.4).abs() < 1e-12);
        assert!((g.at(0.75e-6).re - 0.4).abs() < 1e-12);
    }

    #[test]
    fn calibrated_iq_rejects_bad_input() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let iq = PyWaveform::calibrated_iq(50e6, None, None, None, "up");
            assert!(iq.unwrap_err().is_instance_of::<PyValueError>(py));

            let iq = PyWaveform::calibrated_iq(
                50e6,
                Some(PyWaveform::gaussian(40e-9, 0.5)),
                None,
                Some(PyIqCalibration::new(0., 0., 1., 1., 0., 0., 0., 0.)),
                "sideways",
            );
            assert!(iq.unwrap_err().is_instance_of::<PyValueError>(py));

            let iq = PyWaveform::calibrated_iq(
                50e6,
                Some(PyWaveform::gaussian(40e-9, 0.5)),
                None,
                None,
                "down",
            )
            .unwrap();
            assert!(iq.scale(2.).unwrap_err().is_instance_of::<PyValueError>(py));
        });
    }
}
