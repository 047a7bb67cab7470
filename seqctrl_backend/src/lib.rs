//! # seqctrl_backend
//!
//! Python bindings of [`seqcompiler_backend`]. Experiment scripts build waveforms and
//! slices in Python and hand in their own driver objects for the AWG channels and the
//! trigger device; see [`device`] for the methods those objects provide.
//!
//! Log records of the compiler are forwarded to Python's `logging` module.

use pyo3::prelude::*;

pub mod device;
pub mod sequence;
pub mod utils;
pub mod waveform;

pub use crate::sequence::Sequence;
pub use crate::waveform::{PyIqCalibration, PyWaveform};

#[pymodule]
fn seqctrl_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    pyo3_log::init();
    m.add_class::<Sequence>()?;
    m.add_class::<PyWaveform>()?;
    m.add_class::<PyIqCalibration>()?;
    Ok(())
}
