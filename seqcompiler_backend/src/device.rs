//! Hardware capabilities driven by the sequence compiler.
//!
//! The compiler never talks to a driver directly. Every physical output channel is
//! wrapped in a [`WaveformChannel`] and the instrument generating the trigger strobes in
//! a [`TriggerDevice`]. Drivers report failures as a [`DeviceError`], which the sequence
//! wraps together with the offending channel name.
//!
//! The [`memory`] module implements both capabilities in memory. It records everything
//! pushed to it and is what the demo binary and the test-suite program against.

use ndarray::ArrayView1;

/// Failure reported by a hardware capability.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct DeviceError {
    message: String,
}

impl DeviceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// One output channel of an arbitrary waveform generator.
///
/// The sequence samples the compiled waveform at [`WaveformChannel::sample_rate`], pads
/// the buffer to a multiple of [`WaveformChannel::min_unit`], normalizes it to a peak of
/// one and hands the buffer with the peak to [`WaveformChannel::write_raw_waveform`].
/// Channels are always stopped before being written.
pub trait WaveformChannel {
    fn sample_rate(&self) -> DeviceResult<f64>;

    /// Waveform memory granularity, in samples.
    fn min_unit(&self) -> usize {
        1
    }

    fn stop(&mut self) -> DeviceResult<()>;
    fn run(&mut self) -> DeviceResult<()>;
    fn get_offset(&self) -> DeviceResult<f64>;
    fn set_offset(&mut self, offset: f64) -> DeviceResult<()>;

    /// Loads a normalized buffer; `amplitude` restores the physical scale.
    fn write_raw_waveform(&mut self, samples: ArrayView1<f64>, amplitude: f64)
        -> DeviceResult<()>;
}

/// Delay generator emitting the trigger strobes, one per trigger channel and cycle.
pub trait TriggerDevice {
    fn set_cycle_frequency(&mut self, frequency: f64) -> DeviceResult<()>;
    fn set_channel_delay(
        &mut self,
        trigger_channel: usize,
        raise_at: f64,
        drop_after: f64,
    ) -> DeviceResult<()>;
}

/// In-memory capabilities.
///
/// Each device shares its state through an `Arc<Mutex<_>>` so the caller keeps a handle
/// after boxing the device into a sequence:
/// ```
/// # use seqcompiler_backend::device::{memory::MemoryChannel, WaveformChannel};
/// let mut chan = MemoryChannel::new(1e9);
/// let state = chan.state();
/// chan.set_offset(0.1).unwrap();
/// assert_eq!(state.lock().offset, 0.1);
/// ```
pub mod memory {
    use std::sync::Arc;

    use indexmap::IndexMap;
    use ndarray::ArrayView1;
    use parking_lot::Mutex;

    use super::{DeviceError, DeviceResult, TriggerDevice, WaveformChannel};

    #[derive(Debug, Default, Clone)]
    pub struct ChannelState {
        /// Last normalized buffer written.
        pub samples: Vec<f64>,
        pub amplitude: f64,
        pub offset: f64,
        pub running: bool,
        pub writes: usize,
        pub stops: usize,
        pub runs: usize,
        /// While set, `write_raw_waveform` fails.
        pub fail_writes: bool,
    }

    impl ChannelState {
        /// The buffer scaled back to volts.
        pub fn waveform(&self) -> Vec<f64> {
            self.samples.iter().map(|v| v * self.amplitude).collect()
        }
    }

    pub struct MemoryChannel {
        sample_rate: f64,
        min_unit: usize,
        state: Arc<Mutex<ChannelState>>,
    }

    impl MemoryChannel {
        pub fn new(sample_rate: f64) -> Self {
            Self {
                sample_rate,
                min_unit: 1,
                state: Arc::default(),
            }
        }

        pub fn with_min_unit(mut self, min_unit: usize) -> Self {
            self.min_unit = min_unit;
            self
        }

        pub fn state(&self) -> Arc<Mutex<ChannelState>> {
            self.state.clone()
        }
    }

    impl WaveformChannel for MemoryChannel {
        fn sample_rate(&self) -> DeviceResult<f64> {
            Ok(self.sample_rate)
        }

        fn min_unit(&self) -> usize {
            self.min_unit
        }

        fn stop(&mut self) -> DeviceResult<()> {
            let mut state = self.state.lock();
            state.running = false;
            state.stops += 1;
            Ok(())
        }

        fn run(&mut self) -> DeviceResult<()> {
            let mut state = self.state.lock();
            state.running = true;
            state.runs += 1;
            Ok(())
        }

        fn get_offset(&self) -> DeviceResult<f64> {
            Ok(self.state.lock().offset)
        }

        fn set_offset(&mut self, offset: f64) -> DeviceResult<()> {
            self.state.lock().offset = offset;
            Ok(())
        }

        fn write_raw_waveform(
            &mut self,
            samples: ArrayView1<f64>,
            amplitude: f64,
        ) -> DeviceResult<()> {
            let mut state = self.state.lock();
            if state.fail_writes {
                return Err(DeviceError::new("waveform memory write rejected"));
            }
            state.samples = samples.to_vec();
            state.amplitude = amplitude;
            state.writes += 1;
            Ok(())
        }
    }

    #[derive(Debug, Default, Clone)]
    pub struct TriggerState {
        pub cycle_frequency: Option<f64>,
        /// `trigger channel -> (raise_at, drop_after)`
        pub delays: IndexMap<usize, (f64, f64)>,
    }

    #[derive(Default)]
    pub struct MemoryTrigger {
        state: Arc<Mutex<TriggerState>>,
    }

    impl MemoryTrigger {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn state(&self) -> Arc<Mutex<TriggerState>> {
            self.state.clone()
        }
    }

    impl TriggerDevice for MemoryTrigger {
        fn set_cycle_frequency(&mut self, frequency: f64) -> DeviceResult<()> {
            self.state.lock().cycle_frequency = Some(frequency);
            Ok(())
        }

        fn set_channel_delay(
            &mut self,
            trigger_channel: usize,
            raise_at: f64,
            drop_after: f64,
        ) -> DeviceResult<()> {
            self.state
                .lock()
                .delays
                .insert(trigger_channel, (raise_at, drop_after));
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::memory::*;
    use super::*;

    #[test]
    fn memory_channel_records_writes() {
        let mut chan = MemoryChannel::new(1e9).with_min_unit(16);
        let state = chan.state();
        assert_eq!(chan.min_unit(), 16);

        let buffer = ndarray::arr1(&[0.5, -1., 0.]);
        chan.stop().unwrap();
        chan.write_raw_waveform(buffer.view(), 2.).unwrap();
        chan.run().unwrap();

        let state = state.lock();
        assert_eq!(state.waveform(), vec![1., -2., 0.]);
        assert_eq!((state.stops, state.writes, state.runs), (1, 1, 1));
        assert!(state.running);
    }

    #[test]
    fn memory_channel_failure_injection() {
        let mut chan = MemoryChannel::new(1e9);
        chan.state().lock().fail_writes = true;
        let err = chan
            .write_raw_waveform(ndarray::arr1(&[1.]).view(), 1.)
            .unwrap_err();
        assert_eq!(err.message(), "waveform memory write rejected");
        assert_eq!(chan.state().lock().writes, 0);
    }

    #[test]
    fn memory_trigger_records_delays() {
        let mut trigger = MemoryTrigger::new();
        let state = trigger.state();
        trigger.set_cycle_frequency(10e3).unwrap();
        trigger.set_channel_delay(2, 1e-6, 4e-6).unwrap();
        trigger.set_channel_delay(2, 2e-6, 4e-6).unwrap();
        let state = state.lock();
        assert_eq!(state.cycle_frequency, Some(10e3));
        assert_eq!(state.delays.len(), 1);
        assert_eq!(state.delays[&2], (2e-6, 4e-6));
    }
}
