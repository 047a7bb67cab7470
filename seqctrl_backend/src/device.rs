//! Adapters exposing Python driver objects as [`WaveformChannel`] and [`TriggerDevice`].
//!
//! Drivers are duck-typed. An AWG channel object provides `get_sample_rate()`, `stop()`,
//! `run()`, `get_offset()`, `set_offset(v)` and `write_raw_waveform(samples, amplitude)`,
//! with `samples` a 1-D `numpy.float64` array normalized to a peak of one. A `min_unit`
//! attribute, when present, sets the waveform memory granularity.
//!
//! A trigger device provides `set_cycle_frequency(f)` and
//! `set_channel_delay(trigger_channel, raise_at, drop_after)`.
//!
//! Any Python exception raised by a driver becomes a [`DeviceError`] carrying the
//! exception text.

use ndarray::ArrayView1;
use numpy::PyArray1;
use pyo3::prelude::*;

use seqcompiler_backend::{DeviceError, DeviceResult, TriggerDevice, WaveformChannel};

fn device_err(py: Python, err: PyErr) -> DeviceError {
    let message = err.value(py).to_string();
    log::debug!("Python driver raised: {}", message);
    DeviceError::new(message)
}

pub struct PyWaveformChannel {
    driver: PyObject,
    min_unit: usize,
}

impl PyWaveformChannel {
    /// Wraps `driver`, reading its optional `min_unit` once.
    pub fn new(py: Python, driver: PyObject) -> PyResult<Self> {
        let min_unit: usize = if driver.as_ref(py).hasattr("min_unit")? {
            driver.getattr(py, "min_unit")?.extract(py)?
        } else {
            1
        };
        log::debug!("Wrapped Python AWG channel, min_unit = {}", min_unit);
        Ok(Self {
            driver,
            min_unit: min_unit.max(1),
        })
    }

    fn call0(&self, method: &str) -> DeviceResult<PyObject> {
        Python::with_gil(|py| {
            self.driver
                .call_method0(py, method)
                .map_err(|e| device_err(py, e))
        })
    }
}

impl WaveformChannel for PyWaveformChannel {
    fn sample_rate(&self) -> DeviceResult<f64> {
        Python::with_gil(|py| {
            self.driver
                .call_method0(py, "get_sample_rate")
                .and_then(|rate| rate.extract(py))
                .map_err(|e| device_err(py, e))
        })
    }

    fn min_unit(&self) -> usize {
        self.min_unit
    }

    fn stop(&mut self) -> DeviceResult<()> {
        self.call0("stop").map(|_| ())
    }

    fn run(&mut self) -> DeviceResult<()> {
        self.call0("run").map(|_| ())
    }

    fn get_offset(&self) -> DeviceResult<f64> {
        Python::with_gil(|py| {
            self.driver
                .call_method0(py, "get_offset")
                .and_then(|offset| offset.extract(py))
                .map_err(|e| device_err(py, e))
        })
    }

    fn set_offset(&mut self, offset: f64) -> DeviceResult<()> {
        Python::with_gil(|py| {
            self.driver
                .call_method1(py, "set_offset", (offset,))
                .map(|_| ())
                .map_err(|e| device_err(py, e))
        })
    }

    fn write_raw_waveform(
        &mut self,
        samples: ArrayView1<f64>,
        amplitude: f64,
    ) -> DeviceResult<()> {
        log::debug!("Writing {} samples, amplitude {} V", samples.len(), amplitude);
        Python::with_gil(|py| {
            let samples = PyArray1::from_array(py, &samples);
            self.driver
                .call_method1(py, "write_raw_waveform", (samples, amplitude))
                .map(|_| ())
                .map_err(|e| device_err(py, e))
        })
    }
}

pub struct PyTriggerDevice {
    driver: PyObject,
}

impl PyTriggerDevice {
    pub fn new(driver: PyObject) -> Self {
        Self { driver }
    }
}

impl TriggerDevice for PyTriggerDevice {
    fn set_cycle_frequency(&mut self, frequency: f64) -> DeviceResult<()> {
        Python::with_gil(|py| {
            self.driver
                .call_method1(py, "set_cycle_frequency", (frequency,))
                .map(|_| ())
                .map_err(|e| device_err(py, e))
        })
    }

    fn set_channel_delay(
        &mut self,
        trigger_channel: usize,
        raise_at: f64,
        drop_after: f64,
    ) -> DeviceResult<()> {
        Python::with_gil(|py| {
            self.driver
                .call_method1(
                    py,
                    "set_channel_delay",
                    (trigger_channel, raise_at, drop_after),
                )
                .map(|_| ())
                .map_err(|e| device_err(py, e))
        })
    }
}
