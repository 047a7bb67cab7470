//! The Python `Sequence` class.
//!
//! Behaves like [`seqcompiler_backend::Sequence`]: the fields are the standard sequence
//! fields, [`impl_sequence_boilerplate`] provides the [`BaseSequence`] accessors and the
//! `#[pymethods]` below forward to its default methods. Slices and channels are addressed
//! by name; sub-slices with `"parent/child"` paths.
//!
//! ## Example (python)
//! ```python
//! from seqctrl_backend import Sequence, Waveform
//!
//! seq = Sequence(delay_generator, 10e3)
//! seq.add_trigger("drive_trig", 1, 1e-6)
//! seq.link_waveform_channel("drive_trig", "awg_0", awg_driver)
//! seq.add_fixed_slice("drive", 2e-6, 1e-6)
//! seq.add_waveform("drive", "awg_0", Waveform.dc(0.5e-6, 0.3))
//! seq.setup()
//! seq.run_channels()
//! ```

use std::collections::BTreeSet;

use indexmap::IndexMap;
use numpy::IntoPyArray;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use seqcompiler_backend::channel::{ChannelId, ChannelRegistry};
use seqcompiler_backend::snapshot::TraceKind;
use seqcompiler_backend::*;

use crate::device::{PyTriggerDevice, PyWaveformChannel};
use crate::utils::to_py_err;
use crate::waveform::{PyIqCalibration, PyWaveform};

#[pyclass(unsendable)]
pub struct Sequence {
    cycle_frequency: f64,
    trigger_device: Box<dyn TriggerDevice>,
    registry: ChannelRegistry,
    devices: IndexMap<ChannelId, Box<dyn WaveformChannel>>,
    slices: IndexMap<String, Slice>,
    compiled: IndexMap<ChannelId, Waveform>,
    slice_durations: IndexMap<String, f64>,
    pending_compile: BTreeSet<ChannelId>,
    pending_program: BTreeSet<ChannelId>,
    programmed: bool,
    snapshot: SnapshotHandle,
}

impl_sequence_boilerplate!(Sequence);

fn parse_padding(position: &str) -> PyResult<PaddingPosition> {
    match position {
        "before" => Ok(PaddingPosition::Before),
        "behind" => Ok(PaddingPosition::Behind),
        other => Err(PyValueError::new_err(format!(
            "padding must be 'before' or 'behind', got '{other}'"
        ))),
    }
}

impl Sequence {
    fn channel_names(&self, channels: BTreeSet<ChannelId>) -> Vec<String> {
        channels
            .into_iter()
            .map(|c| self.registry.channel_name(c).to_string())
            .collect()
    }
}

#[pymethods]
impl Sequence {
    /// `trigger_device` is any object with `set_cycle_frequency(f)` and
    /// `set_channel_delay(trigger_channel, raise_at, drop_after)`.
    #[new]
    pub fn new(trigger_device: PyObject, cycle_frequency: f64) -> Self {
        Self {
            cycle_frequency,
            trigger_device: Box::new(PyTriggerDevice::new(trigger_device)),
            registry: ChannelRegistry::new(),
            devices: IndexMap::new(),
            slices: IndexMap::new(),
            compiled: IndexMap::new(),
            slice_durations: IndexMap::new(),
            pending_compile: BTreeSet::new(),
            pending_program: BTreeSet::new(),
            programmed: false,
            snapshot: SnapshotHandle::default(),
        }
    }

    #[getter]
    pub fn cycle_length(&self) -> f64 {
        BaseSequence::cycle_length(self)
    }

    // REGISTRATION
    #[pyo3(signature = (name, trigger_channel, raise_at, drop_after = DEFAULT_DROP_AFTER))]
    pub fn add_trigger(
        &mut self,
        name: &str,
        trigger_channel: usize,
        raise_at: f64,
        drop_after: f64,
    ) -> PyResult<()> {
        BaseSequence::add_trigger(self, name, trigger_channel, raise_at, drop_after)
            .map(|_| ())
            .map_err(to_py_err)
    }

    /// Registers the AWG channel `driver` under `name`, played on the strobes of `trigger`.
    pub fn link_waveform_channel(
        &mut self,
        py: Python,
        trigger: &str,
        name: &str,
        driver: PyObject,
    ) -> PyResult<()> {
        let trigger = self.registry.trigger_id(trigger).map_err(to_py_err)?;
        let device = PyWaveformChannel::new(py, driver)?;
        BaseSequence::link_channel(self, trigger, name, device)
            .map(|_| ())
            .map_err(to_py_err)
    }

    pub fn add_fixed_slice(&mut self, name: &str, start_from: f64, duration: f64) -> PyResult<()> {
        BaseSequence::add_slice(self, Slice::fixed(name, start_from, duration)).map_err(to_py_err)
    }

    pub fn add_fixed_length_slice(&mut self, name: &str, duration: f64) -> PyResult<()> {
        BaseSequence::add_slice(self, Slice::fixed_length(name, duration)).map_err(to_py_err)
    }

    pub fn add_flex_slice(&mut self, name: &str) -> PyResult<()> {
        BaseSequence::add_slice(self, Slice::flex(name)).map_err(to_py_err)
    }

    /// Nests a fixed-length (`duration` given) or flexible slice under `parent_path`.
    #[pyo3(signature = (parent_path, name, duration = None))]
    pub fn add_sub_slice(
        &mut self,
        parent_path: &str,
        name: &str,
        duration: Option<f64>,
    ) -> PyResult<()> {
        let child = match duration {
            Some(duration) => Slice::fixed_length(name, duration),
            None => Slice::flex(name),
        };
        self.slice_path_(parent_path)
            .and_then(|parent| parent.add_sub_slice(child))
            .map_err(to_py_err)
    }

    pub fn slice_duration(&mut self, path: &str) -> PyResult<f64> {
        self.slice_path_(path)
            .map(|slice| slice.duration())
            .map_err(to_py_err)
    }

    // EDITING
    pub fn add_waveform(
        &mut self,
        slice_path: &str,
        channel: &str,
        waveform: PyWaveform,
    ) -> PyResult<()> {
        BaseSequence::add_waveform(self, slice_path, channel, waveform.inner).map_err(to_py_err)
    }

    pub fn clear_waveform(&mut self, slice_path: &str, channel: &str) -> PyResult<()> {
        BaseSequence::clear_waveform(self, slice_path, channel).map_err(to_py_err)
    }

    /// `position` is `"before"` (waveform ends with the slice) or `"behind"`.
    pub fn set_waveform_padding(
        &mut self,
        slice_path: &str,
        channel: &str,
        position: &str,
    ) -> PyResult<()> {
        let position = parse_padding(position)?;
        BaseSequence::set_waveform_padding(self, slice_path, channel, position).map_err(to_py_err)
    }

    // COMPILATION
    /// Returns the names of the recompiled channels.
    pub fn compile(&mut self) -> PyResult<Vec<String>> {
        let channels = BaseSequence::compile(self).map_err(to_py_err)?;
        Ok(self.channel_names(channels))
    }

    pub fn compiled_waveform(&self, channel: &str) -> PyResult<Option<PyWaveform>> {
        let channel = self.channel_id(channel).map_err(to_py_err)?;
        Ok(BaseSequence::compiled_waveform(self, channel).map(|w| PyWaveform::from(w.clone())))
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    /// Samples the last compiled cycle for a preview plot.
    ///
    /// Returns `(times, traces)` where each trace is `(name, kind, values)`, `kind` being
    /// `"channel"` or `"trigger"`. Channel traces are placed at their trigger's rise.
    pub fn render(&self, py: Python, sample_rate: f64) -> PyObject {
        let snapshot = self.snapshot();
        let traces: Vec<PyObject> = snapshot
            .render(sample_rate)
            .into_iter()
            .map(|trace| {
                let kind = match trace.kind {
                    TraceKind::Channel => "channel",
                    TraceKind::Trigger => "trigger",
                };
                (trace.name, kind, trace.values.into_pyarray(py)).into_py(py)
            })
            .collect();
        (snapshot.times(sample_rate).into_pyarray(py), traces).into_py(py)
    }

    // HARDWARE
    pub fn setup_trigger(&mut self) -> PyResult<()> {
        BaseSequence::setup_trigger(self).map_err(to_py_err)
    }

    pub fn program(&mut self) -> PyResult<usize> {
        BaseSequence::program(self).map_err(to_py_err)
    }

    pub fn setup_channels(&mut self) -> PyResult<usize> {
        BaseSequence::setup_channels(self).map_err(to_py_err)
    }

    pub fn setup(&mut self) -> PyResult<usize> {
        BaseSequence::setup(self).map_err(to_py_err)
    }

    pub fn run_channels(&mut self) -> PyResult<()> {
        BaseSequence::run_channels(self).map_err(to_py_err)
    }

    pub fn stop_channels(&mut self) -> PyResult<()> {
        BaseSequence::stop_channels(self).map_err(to_py_err)
    }

    pub fn apply_iq_offsets(
        &mut self,
        i_channel: &str,
        q_channel: &str,
        calibration: PyIqCalibration,
    ) -> PyResult<()> {
        BaseSequence::apply_iq_offsets(self, i_channel, q_channel, &calibration.inner)
            .map_err(to_py_err)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pyo3::exceptions::PyRuntimeError;
    use pyo3::types::PyDict;

    const DRIVERS: &str = r#"
class Awg:
    def __init__(self):
        self.written = None
        self.running = False
    def get_sample_rate(self):
        return 1e9
    def stop(self):
        self.running = False
    def run(self):
        self.running = True
    def get_offset(self):
        return 0.0
    def set_offset(self, v):
        pass
    def write_raw_waveform(self, samples, amplitude):
        self.written = [s * amplitude for s in samples]

class Delay:
    def set_cycle_frequency(self, f):
        self.f = f
    def set_channel_delay(self, ch, raise_at, drop_after):
        pass
"#;

    #[test]
    fn program_through_python_drivers() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let globals = PyDict::new(py);
            py.run(DRIVERS, Some(globals), None).unwrap();
            let delay = globals.get_item("Delay").unwrap().call0().unwrap();
            let awg = globals.get_item("Awg").unwrap().call0().unwrap();

            let mut seq = Sequence::new(delay.into(), 10e3);
            seq.add_trigger("trig", 1, 1e-6, DEFAULT_DROP_AFTER).unwrap();
            seq.link_waveform_channel(py, "trig", "awg_0", awg.into()).unwrap();
            seq.add_fixed_slice("drive", 2e-6, 1e-6).unwrap();
            seq.add_sub_slice("drive", "pulse", None).unwrap();
            seq.add_waveform("drive/pulse", "awg_0", PyWaveform::dc(0.5e-6, 0.3, 0.))
                .unwrap();
            seq.set_waveform_padding("drive", "awg_0", "behind").unwrap();
            assert!(seq
                .set_waveform_padding("drive", "awg_0", "after")
                .unwrap_err()
                .is_instance_of::<PyValueError>(py));

            let err = seq.run_channels().unwrap_err();
            assert!(err.is_instance_of::<PyRuntimeError>(py));

            assert_eq!(seq.setup().unwrap(), 1);
            seq.run_channels().unwrap();
            assert_eq!(seq.generation(), 1);
            assert!(awg.getattr("running").unwrap().is_true().unwrap());
            let written: Vec<f64> = awg.getattr("written").unwrap().extract().unwrap();
            assert_eq!(written.len(), 2000);
            assert!((written[1001] - 0.3).abs() < 1e-12);
            assert_eq!(written[1600], 0.);

            let compiled = seq.compiled_waveform("awg_0").unwrap().unwrap();
            assert!((compiled.width() - 2e-6).abs() < 1e-15);
            assert!(seq.compile().unwrap().is_empty());
        });
    }

    #[test]
    fn description_errors_are_value_errors() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let mut seq = Sequence::new(py.None(), 10e3);
            seq.add_flex_slice("a").unwrap();
            let err = seq.add_flex_slice("a").unwrap_err();
            assert!(err.is_instance_of::<PyValueError>(py));
            let err = seq.add_fixed_length_slice("b", 1e-3).unwrap_err();
            assert!(err.is_instance_of::<PyValueError>(py));
        });
    }
}
