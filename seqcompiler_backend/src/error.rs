//! Error types shared by every stage of the compiler.
//!
//! Errors fall into four groups:
//! - **configuration**: the slice tree or waveform description is inconsistent
//!   (a channel defined both directly and through a sub-slice, a
//!   [`SliceKind::Fixed`](crate::slice::SliceKind::Fixed) nested inside another
//!   slice, a calibrated IQ waveform scaled after the fact, bad names);
//! - **timing**: the described cycle is not physically realizable (content
//!   placed before its trigger rises, overlapping content on one channel,
//!   content longer than its slice, slices running past the cycle end);
//! - **usage**: operations called in the wrong order or on unknown handles;
//! - **device**: a hardware capability reported a failure.
//!
//! Every variant carries the slice and/or channel name needed to locate the
//! problem in the experiment description.

use crate::device::DeviceError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    // Configuration
    #[error(
        "Waveform for channel {channel} defined in both slice {slice} and one of its sub slices"
    )]
    ConflictingWaveform { slice: String, channel: String },

    #[error("Fixed slice {child} can not be added into slice {parent}: fixed slices are top-level only")]
    FixedSliceNested { parent: String, child: String },

    #[error("Calibrated IQ waveforms can not be scaled once the calibration is applied")]
    ScaleCalibrated,

    #[error("Calibrated IQ waveform needs at least one of the I and Q waveforms")]
    MissingIqInput,

    #[error("{kind} {name} already registered. Registered names are {registered:?}")]
    DuplicateName {
        kind: &'static str,
        name: String,
        registered: Vec<String>,
    },

    #[error("Invalid {kind} name {name:?}: expecting letters, digits and `_.:-`, not starting with a digit")]
    InvalidName { kind: &'static str, name: String },

    // Timing
    #[error(
        "Waveform assigned to channel before it is triggered \
        (slice {slice} starts at {start:e} s, channel {channel} is triggered at {raise_at:e} s)"
    )]
    PreTrigger {
        slice: String,
        channel: String,
        start: f64,
        raise_at: f64,
    },

    #[error(
        "Waveform overlap detected on channel {channel} in slice {slice}: \
        compiled waveform already lasts {compiled_width:e} s but the slice starts {available:e} s after the trigger"
    )]
    Overlap {
        slice: String,
        channel: String,
        compiled_width: f64,
        available: f64,
    },

    #[error("Waveform of slice {slice} on channel {channel} lasts {width:e} s, longer than the slice duration {duration:e} s")]
    SliceOverflow {
        slice: String,
        channel: String,
        width: f64,
        duration: f64,
    },

    #[error("Out of range. Slice {slice} ends at {end:e} s, while each trigger cycle ends at {cycle_end:e} s")]
    CycleOverflow {
        slice: String,
        end: f64,
        cycle_end: f64,
    },

    // Usage
    #[error("Channel {channel} is not linked to any trigger")]
    UnlinkedChannel { channel: String },

    #[error("Sequence has not been compiled and programmed yet, run setup_channels() first")]
    NotCompiled,

    #[error("There is no {kind} {name} registered")]
    Unknown { kind: &'static str, name: String },

    // Hardware
    #[error("Device operation `{operation}` failed on channel {channel}")]
    Device {
        channel: String,
        operation: &'static str,
        #[source]
        source: DeviceError,
    },
}

impl Error {
    pub(crate) fn unknown(kind: &'static str, name: impl Into<String>) -> Self {
        Error::Unknown {
            kind,
            name: name.into(),
        }
    }

    /// Configuration and timing errors describe a bad experiment; the rest describe
    /// misuse of the API or hardware trouble.
    pub fn is_description_error(&self) -> bool {
        matches!(
            self,
            Error::ConflictingWaveform { .. }
                | Error::FixedSliceNested { .. }
                | Error::ScaleCalibrated
                | Error::MissingIqInput
                | Error::DuplicateName { .. }
                | Error::InvalidName { .. }
                | Error::PreTrigger { .. }
                | Error::Overlap { .. }
                | Error::SliceOverflow { .. }
                | Error::CycleOverflow { .. }
        )
    }
}
