//! # seqcompiler_backend
//!
//! Waveform algebra and hierarchical time-slice compiler for trigger-aligned arbitrary
//! waveform generators.
//!
//! - [`waveform`]: immutable, composable waveform descriptions and their sampling.
//! - [`calibration`]: IQ mixer calibration and calibrated single-sideband modulation.
//! - [`slice`]: nested time windows flattened into one waveform per channel.
//! - [`channel`]: triggers and the channels they gate.
//! - [`sequence`]: places slices on the cycle timeline and programs the hardware.
//! - [`device`]: the hardware capabilities the sequence drives, plus in-memory versions.
//! - [`snapshot`]: read-only views of the compiled cycle for plotting.
//!
//! The Python bindings live in the `seqctrl_backend` crate.

pub mod calibration;
pub mod channel;
pub mod device;
pub mod error;
pub mod sequence;
pub mod slice;
pub mod snapshot;
pub mod utils;
pub mod waveform;

pub use calibration::*;
pub use channel::{ChannelId, ChannelRegistry, TriggerId};
pub use device::{DeviceError, DeviceResult, TriggerDevice, WaveformChannel};
pub use error::{Error, Result};
pub use sequence::*;
pub use slice::*;
pub use snapshot::{CompiledSnapshot, SnapshotHandle};
pub use utils::{DEFAULT_DROP_AFTER, DEFAULT_MIN_UNIT, EPSILON};
pub use waveform::Waveform;

// Used by `impl_sequence_boilerplate!` in downstream crates
#[doc(hidden)]
pub use indexmap;
