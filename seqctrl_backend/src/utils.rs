use std::error::Error as _;

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::PyErr;

use seqcompiler_backend::Error;

/// Maps a compiler error to a Python exception: `ValueError` for a bad experiment
/// description, `RuntimeError` for misuse or device failures. The message includes the
/// whole source chain, so a failing Python driver call shows up verbatim.
pub fn to_py_err(err: Error) -> PyErr {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    if err.is_description_error() {
        PyValueError::new_err(message)
    } else {
        PyRuntimeError::new_err(message)
    }
}
