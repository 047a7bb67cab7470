//! The sequence compiler: places slices on the cycle timeline and programs the channels.
//!
//! ## Overview
//!
//! A [`Sequence`] describes one repetition cycle of `1 / cycle_frequency` seconds. The
//! trigger device emits one strobe per [`Trigger`](crate::channel::Trigger) and cycle; AWG
//! channels are linked to a trigger and start playing their waveform memory when the
//! strobe rises. The cycle content is described by an ordered list of top-level
//! [`Slice`]s:
//! - [`SliceKind::Fixed`] slices start at their own `start_from`;
//! - every other slice starts where the previous non-fixed slice ended.
//!
//! The behavior of [`Sequence`] is defined by the default methods of [`BaseSequence`],
//! following the accessor pattern (`x()` borrows, `x_()` borrows mutably) used throughout
//! the crate.
//!
//! ## Compile / program cycle
//!
//! 1. Edit slices ([`BaseSequence::slice_`], [`BaseSequence::add_waveform`], ...).
//! 2. [`BaseSequence::compile`] rebuilds the compiled waveform of every channel whose
//!    content changed, validates trigger ordering, overlaps and the cycle bound, and only
//!    then replaces the cache. A failed compile changes nothing and is retried in full
//!    next time.
//! 3. [`BaseSequence::program`] samples the recompiled channels at each channel's rate,
//!    then stops and rewrites them. Channels whose content did not change keep playing.
//! 4. [`BaseSequence::run_channels`] arms every channel with content.
//!
//! ```
//! # use seqcompiler_backend::*;
//! # use seqcompiler_backend::device::memory::{MemoryChannel, MemoryTrigger};
//! let mut seq = Sequence::new(MemoryTrigger::new(), 10e3);
//! let trig = seq.add_trigger("drive_trig", 1, 1e-6, DEFAULT_DROP_AFTER).unwrap();
//! let awg = MemoryChannel::new(1e9);
//! let state = awg.state();
//! let ch = seq.link_channel(trig, "awg_0", awg).unwrap();
//!
//! let mut drive = Slice::fixed("drive", 2e-6, 1e-6);
//! drive.add_waveform(ch, Waveform::dc(0.5e-6, 0.3));
//! seq.add_slice(drive).unwrap();
//!
//! assert_eq!(seq.setup().unwrap(), 1);
//! seq.run_channels().unwrap();
//! // 1us lead after the trigger, 0.5us padding before the 0.5us pulse
//! let played = state.lock().waveform();
//! assert_eq!(played.len(), 2000);
//! assert_eq!(played[1498], 0.);
//! assert!((played[1501] - 0.3).abs() < 1e-12);
//! ```

use std::collections::BTreeSet;
use std::mem;
use std::sync::Arc;

use indexmap::IndexMap;
use ndarray::Array1;

use crate::calibration::IqCalibration;
use crate::channel::{ChannelId, ChannelRegistry, TriggerId};
use crate::device::{DeviceError, TriggerDevice, WaveformChannel};
use crate::error::{Error, Result};
use crate::slice::{PaddingPosition, Slice, SliceKind};
use crate::snapshot::{ChannelTrace, CompiledSnapshot, SliceSpan, SnapshotHandle, TriggerInfo};
use crate::utils::{validate_name, TickTimer, EPSILON};
use crate::waveform::Waveform;

/// Behavior of a [`Sequence`], implemented as default methods on top of field accessors.
///
/// Methods fall into the following groups:
/// 1. Registration: [`add_trigger`], [`link_channel`], [`add_slice`].
/// 2. Editing helpers resolving names: [`slice_path_`], [`add_waveform`],
///    [`clear_waveform`], [`set_waveform_padding`].
/// 3. Compilation: [`compile`], [`compiled_waveform`], [`snapshot`].
/// 4. Hardware: [`setup_trigger`], [`program`], [`setup_channels`], [`setup`],
///    [`run_channels`], [`stop_channels`], [`apply_iq_offsets`].
///
/// [`add_trigger`]: BaseSequence::add_trigger
/// [`link_channel`]: BaseSequence::link_channel
/// [`add_slice`]: BaseSequence::add_slice
/// [`slice_path_`]: BaseSequence::slice_path_
/// [`add_waveform`]: BaseSequence::add_waveform
/// [`clear_waveform`]: BaseSequence::clear_waveform
/// [`set_waveform_padding`]: BaseSequence::set_waveform_padding
/// [`compile`]: BaseSequence::compile
/// [`compiled_waveform`]: BaseSequence::compiled_waveform
/// [`snapshot`]: BaseSequence::snapshot
/// [`setup_trigger`]: BaseSequence::setup_trigger
/// [`program`]: BaseSequence::program
/// [`setup_channels`]: BaseSequence::setup_channels
/// [`setup`]: BaseSequence::setup
/// [`run_channels`]: BaseSequence::run_channels
/// [`stop_channels`]: BaseSequence::stop_channels
/// [`apply_iq_offsets`]: BaseSequence::apply_iq_offsets
pub trait BaseSequence {
    // Immutable accessors
    fn cycle_frequency(&self) -> f64;
    fn registry(&self) -> &ChannelRegistry;
    fn devices(&self) -> &IndexMap<ChannelId, Box<dyn WaveformChannel>>;
    fn slices(&self) -> &IndexMap<String, Slice>;
    fn compiled(&self) -> &IndexMap<ChannelId, Waveform>;
    fn slice_durations(&self) -> &IndexMap<String, f64>;
    fn pending_compile(&self) -> &BTreeSet<ChannelId>;
    fn pending_program(&self) -> &BTreeSet<ChannelId>;
    fn is_programmed(&self) -> bool;
    fn snapshot_handle(&self) -> &SnapshotHandle;

    // Mutable accessors
    fn trigger_device_(&mut self) -> &mut dyn TriggerDevice;
    fn registry_(&mut self) -> &mut ChannelRegistry;
    fn devices_(&mut self) -> &mut IndexMap<ChannelId, Box<dyn WaveformChannel>>;
    fn slices_(&mut self) -> &mut IndexMap<String, Slice>;
    fn compiled_(&mut self) -> &mut IndexMap<ChannelId, Waveform>;
    fn slice_durations_(&mut self) -> &mut IndexMap<String, f64>;
    fn pending_compile_(&mut self) -> &mut BTreeSet<ChannelId>;
    fn pending_program_(&mut self) -> &mut BTreeSet<ChannelId>;
    fn programmed_(&mut self) -> &mut bool;

    /// Length of one cycle, in seconds.
    fn cycle_length(&self) -> f64 {
        1. / self.cycle_frequency()
    }

    fn add_trigger(
        &mut self,
        name: &str,
        trigger_channel: usize,
        raise_at: f64,
        drop_after: f64,
    ) -> Result<TriggerId> {
        self.registry_()
            .add_trigger(name, trigger_channel, raise_at, drop_after)
    }

    /// Registers a hardware channel under `name` and binds it to `trigger`.
    fn link_channel<C>(&mut self, trigger: TriggerId, name: &str, device: C) -> Result<ChannelId>
    where
        C: WaveformChannel + 'static,
    {
        self.registry().trigger(trigger)?;
        let channel = self.registry_().add_channel(name)?;
        self.registry_().link(channel, trigger)?;
        self.devices_().insert(channel, Box::new(device));
        Ok(channel)
    }

    fn channel_id(&self, name: &str) -> Result<ChannelId> {
        self.registry().channel_id(name)
    }

    /// Appends a top-level slice. Fixed-duration slices that can not fit in one cycle are
    /// rejected right away.
    fn add_slice(&mut self, slice: Slice) -> Result<()> {
        validate_name("slice", slice.name())?;
        if self.slices().contains_key(slice.name()) {
            return Err(Error::DuplicateName {
                kind: "slice",
                name: slice.name().to_string(),
                registered: self.slices().keys().cloned().collect(),
            });
        }
        let end = match slice.kind() {
            SliceKind::Fixed {
                start_from,
                duration,
            } => Some(start_from + duration),
            SliceKind::FixedLength { duration } => Some(duration),
            SliceKind::Flex => None,
        };
        if let Some(end) = end {
            let cycle_end = self.cycle_length();
            if end > cycle_end + EPSILON {
                return Err(Error::CycleOverflow {
                    slice: slice.name().to_string(),
                    end,
                    cycle_end,
                });
            }
        }
        self.slices_().insert(slice.name().to_string(), slice);
        Ok(())
    }

    fn slice(&self, name: &str) -> Result<&Slice> {
        self.slices()
            .get(name)
            .ok_or_else(|| Error::unknown("slice", name))
    }

    fn slice_(&mut self, name: &str) -> Result<&mut Slice> {
        self.slices_()
            .get_mut(name)
            .ok_or_else(|| Error::unknown("slice", name))
    }

    /// Resolves a slash separated path such as `"drive/pi_pulse"`.
    fn slice_path_(&mut self, path: &str) -> Result<&mut Slice> {
        let mut names = path.split('/');
        let top = names.next().unwrap_or_default();
        let mut slice = self.slice_(top)?;
        for name in names {
            slice = slice.sub_slice_(name)?;
        }
        Ok(slice)
    }

    fn add_waveform(&mut self, slice_path: &str, channel: &str, waveform: Waveform) -> Result<()> {
        let channel = self.channel_id(channel)?;
        self.slice_path_(slice_path)?.add_waveform(channel, waveform);
        Ok(())
    }

    fn clear_waveform(&mut self, slice_path: &str, channel: &str) -> Result<()> {
        let channel = self.channel_id(channel)?;
        self.slice_path_(slice_path)?.clear_waveform(channel);
        Ok(())
    }

    fn set_waveform_padding(
        &mut self,
        slice_path: &str,
        channel: &str,
        position: PaddingPosition,
    ) -> Result<()> {
        let channel = self.channel_id(channel)?;
        self.slice_path_(slice_path)?
            .set_waveform_padding(channel, position);
        Ok(())
    }

    /// Recompiles every channel whose content changed since the last successful compile
    /// and returns them.
    ///
    /// The recompilation set gathers the channels left over by a failed compile, the
    /// updated channels of every top-level slice and, once a non-fixed slice changes
    /// duration, every channel of that slice and of the slices after it. New waveforms
    /// are built from scratch for this set; the cache is only touched once the whole
    /// timeline validated.
    fn compile(&mut self) -> Result<BTreeSet<ChannelId>> {
        let mut timer = TickTimer::new();
        let mut slices = mem::take(self.slices_());
        let result = self.compile_slices(&mut slices);
        *self.slices_() = slices;
        timer.tick_log("compile");
        result
    }

    #[doc(hidden)]
    fn compile_slices(
        &mut self,
        slices: &mut IndexMap<String, Slice>,
    ) -> Result<BTreeSet<ChannelId>> {
        let mut to_compile = self.pending_compile().clone();
        // Tracks built for a trigger that has moved since
        for trace in &self.snapshot().channels {
            let Ok(channel) = self.registry().channel_id(&trace.name) else {
                continue;
            };
            let moved = self
                .registry()
                .trigger_of(channel)
                .map_or(true, |t| (t.raise_at() - trace.raise_at).abs() > EPSILON);
            if moved {
                to_compile.insert(channel);
            }
        }
        let mut shifted = false;
        for (name, slice) in slices.iter() {
            to_compile.extend(slice.changed_channels());
            let recorded = self.slice_durations().get(name).copied();
            let resized = recorded.map_or(true, |d| (d - slice.duration()).abs() > EPSILON);
            if slice.start_from().is_none() && resized {
                shifted = true;
            }
            if resized || (shifted && slice.start_from().is_none()) {
                to_compile.extend(slice.channels());
            }
        }

        match self.build_tracks(slices, &to_compile) {
            Ok((mut tracks, spans)) => {
                for &channel in &to_compile {
                    match tracks.shift_remove(&channel) {
                        Some(track) => {
                            self.compiled_().insert(channel, track);
                        }
                        None => {
                            self.compiled_().shift_remove(&channel);
                        }
                    }
                }
                *self.slice_durations_() = slices
                    .iter()
                    .map(|(name, slice)| (name.clone(), slice.duration()))
                    .collect();
                for slice in slices.values_mut() {
                    slice.acknowledge_changes();
                }
                self.pending_compile_().clear();
                self.pending_program_().extend(to_compile.iter().copied());
                self.publish_snapshot(spans);
                log::debug!("Compiled {} channel(s)", to_compile.len());
                Ok(to_compile)
            }
            Err(err) => {
                log::warn!(
                    "Compile failed, {} channel(s) queued for the next attempt: {}",
                    to_compile.len(),
                    err
                );
                *self.pending_compile_() = to_compile;
                Err(err)
            }
        }
    }

    #[doc(hidden)]
    fn build_tracks(
        &self,
        slices: &mut IndexMap<String, Slice>,
        to_compile: &BTreeSet<ChannelId>,
    ) -> Result<(IndexMap<ChannelId, Waveform>, Vec<SliceSpan>)> {
        let registry = self.registry();
        let cycle_end = self.cycle_length();
        let mut tracks: IndexMap<ChannelId, Waveform> = IndexMap::new();
        let mut spans = Vec::with_capacity(slices.len());
        let mut cursor = 0.;

        for slice in slices.values_mut() {
            slice.flatten(registry)?;
            let duration = slice.duration();
            let start = match slice.start_from() {
                Some(start_from) => start_from,
                None => {
                    let end = cursor + duration;
                    if end > cycle_end + EPSILON {
                        return Err(Error::CycleOverflow {
                            slice: slice.name().to_string(),
                            end,
                            cycle_end,
                        });
                    }
                    mem::replace(&mut cursor, end)
                }
            };
            spans.push(SliceSpan {
                name: slice.name().to_string(),
                start,
                duration,
            });

            for (&channel, segment) in slice.flattened() {
                if !to_compile.contains(&channel) {
                    continue;
                }
                let raise_at = registry.trigger_of(channel)?.raise_at();
                let channel_name = || registry.channel_name(channel).to_string();
                if raise_at > start + EPSILON {
                    return Err(Error::PreTrigger {
                        slice: slice.name().to_string(),
                        channel: channel_name(),
                        start,
                        raise_at,
                    });
                }
                let available = start - raise_at;
                let track = match tracks.shift_remove(&channel) {
                    Some(track) => {
                        let gap = available - track.width();
                        if gap < -EPSILON {
                            return Err(Error::Overlap {
                                slice: slice.name().to_string(),
                                channel: channel_name(),
                                compiled_width: track.width(),
                                available,
                            });
                        }
                        let track = if gap > EPSILON {
                            track.concat(Waveform::blank(gap))
                        } else {
                            track
                        };
                        track.concat(segment.clone())
                    }
                    None if available > EPSILON => {
                        Waveform::blank(available).concat(segment.clone())
                    }
                    None => segment.clone(),
                };
                log::debug!(
                    "Placed slice {} on channel {} at {:e} s",
                    slice.name(),
                    registry.channel_name(channel),
                    start
                );
                tracks.insert(channel, track);
            }
        }
        Ok((tracks, spans))
    }

    #[doc(hidden)]
    fn publish_snapshot(&self, slices: Vec<SliceSpan>) {
        let registry = self.registry();
        let triggers = registry
            .triggers()
            .map(|(_, trigger)| TriggerInfo {
                name: trigger.name().to_string(),
                trigger_channel: trigger.trigger_channel(),
                raise_at: trigger.raise_at(),
                drop_after: trigger.drop_after(),
            })
            .collect();
        let channels = registry
            .channels()
            .filter_map(|(id, chan)| {
                let waveform = self.compiled().get(&id)?;
                let trigger = registry.trigger_of(id).ok()?;
                Some(ChannelTrace {
                    name: chan.name().to_string(),
                    trigger: trigger.name().to_string(),
                    raise_at: trigger.raise_at(),
                    waveform: waveform.clone(),
                })
            })
            .collect();
        let generation = self.snapshot_handle().load().generation + 1;
        self.snapshot_handle().publish(CompiledSnapshot {
            generation,
            cycle_frequency: self.cycle_frequency(),
            triggers,
            channels,
            slices,
        });
    }

    /// Last compiled waveform of `channel`, relative to the rise of its trigger.
    fn compiled_waveform(&self, channel: ChannelId) -> Option<&Waveform> {
        self.compiled().get(&channel)
    }

    fn snapshot(&self) -> Arc<CompiledSnapshot> {
        self.snapshot_handle().load()
    }

    /// Pushes the cycle frequency and every trigger delay to the trigger device.
    fn setup_trigger(&mut self) -> Result<()> {
        let frequency = self.cycle_frequency();
        let delays: Vec<(String, usize, f64, f64)> = self
            .registry()
            .triggers()
            .map(|(_, t)| {
                (
                    t.name().to_string(),
                    t.trigger_channel(),
                    t.raise_at(),
                    t.drop_after(),
                )
            })
            .collect();
        let device = self.trigger_device_();
        device
            .set_cycle_frequency(frequency)
            .map_err(device_error("trigger device", "set_cycle_frequency"))?;
        for (name, trigger_channel, raise_at, drop_after) in delays {
            device
                .set_channel_delay(trigger_channel, raise_at, drop_after)
                .map_err(device_error(&name, "set_channel_delay"))?;
        }
        log::info!("Trigger device set up at {} Hz", frequency);
        Ok(())
    }

    /// Writes every recompiled channel to its device and returns how many were written.
    ///
    /// All buffers are sampled before the first device is touched. Each channel is
    /// stopped, then loaded, and leaves the reprogram set only once both succeeded, so a
    /// failing device is retried on the next call. Channels whose content vanished are
    /// only stopped.
    fn program(&mut self) -> Result<usize> {
        let mut timer = TickTimer::new();
        let mut buffers: Vec<(ChannelId, String, Option<(Array1<f64>, f64)>)> = Vec::new();
        for &channel in self.pending_program() {
            let name = self.registry().channel_name(channel).to_string();
            let device = self
                .devices()
                .get(&channel)
                .ok_or_else(|| Error::unknown("channel", name.as_str()))?;
            let buffer = match self.compiled().get(&channel) {
                Some(waveform) => {
                    let rate = device
                        .sample_rate()
                        .map_err(device_error(&name, "sample_rate"))?;
                    Some(waveform.normalized_sample(rate, device.min_unit()))
                }
                None => None,
            };
            buffers.push((channel, name, buffer));
        }
        timer.tick_log("sampling");

        let count = buffers.len();
        for (channel, name, buffer) in buffers {
            let Some(device) = self.devices_().get_mut(&channel) else {
                return Err(Error::unknown("channel", name));
            };
            device.stop().map_err(device_error(&name, "stop"))?;
            if let Some((samples, amplitude)) = buffer {
                device
                    .write_raw_waveform(samples.view(), amplitude)
                    .map_err(device_error(&name, "write_raw_waveform"))?;
            }
            self.pending_program_().remove(&channel);
        }
        *self.programmed_() = true;
        timer.tick_log("programming");
        log::info!("Programmed {} channel(s)", count);
        Ok(count)
    }

    /// [`compile`](BaseSequence::compile) then [`program`](BaseSequence::program).
    fn setup_channels(&mut self) -> Result<usize> {
        self.compile()?;
        self.program()
    }

    fn setup(&mut self) -> Result<usize> {
        self.setup_trigger()?;
        self.setup_channels()
    }

    /// Starts every channel whose compiled waveform has been written. Channels still
    /// waiting for [`program`](BaseSequence::program) are left alone.
    fn run_channels(&mut self) -> Result<()> {
        if !self.is_programmed() {
            return Err(Error::NotCompiled);
        }
        let channels: Vec<ChannelId> = self
            .compiled()
            .keys()
            .filter(|channel| !self.pending_program().contains(channel))
            .copied()
            .collect();
        for channel in channels {
            let name = self.registry().channel_name(channel).to_string();
            if let Some(device) = self.devices_().get_mut(&channel) {
                device.run().map_err(device_error(&name, "run"))?;
            }
        }
        Ok(())
    }

    /// Stops every linked channel.
    fn stop_channels(&mut self) -> Result<()> {
        let channels: Vec<ChannelId> = self.devices().keys().copied().collect();
        for channel in channels {
            let name = self.registry().channel_name(channel).to_string();
            if let Some(device) = self.devices_().get_mut(&channel) {
                device.stop().map_err(device_error(&name, "stop"))?;
            }
        }
        Ok(())
    }

    /// Sets the DC offsets of an IQ channel pair from a mixer calibration.
    fn apply_iq_offsets(
        &mut self,
        i_channel: &str,
        q_channel: &str,
        calibration: &IqCalibration,
    ) -> Result<()> {
        for (name, offset) in [
            (i_channel, calibration.i_offset),
            (q_channel, calibration.q_offset),
        ] {
            let channel = self.channel_id(name)?;
            let device = self
                .devices_()
                .get_mut(&channel)
                .ok_or_else(|| Error::unknown("channel", name))?;
            device
                .set_offset(offset)
                .map_err(device_error(name, "set_offset"))?;
        }
        Ok(())
    }
}

fn device_error(channel: &str, operation: &'static str) -> impl FnOnce(DeviceError) -> Error {
    let channel = channel.to_string();
    move |source| Error::Device {
        channel,
        operation,
        source,
    }
}

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

/// Implements the [`BaseSequence`] accessors for a struct holding the standard sequence
/// fields, so front-ends (e.g. the Python bindings) can define their own sequence type:
///
/// ```ignore
/// pub struct MySequence {
///     cycle_frequency: f64,
///     trigger_device: Box<dyn TriggerDevice>,
///     registry: ChannelRegistry,
///     devices: IndexMap<ChannelId, Box<dyn WaveformChannel>>,
///     slices: IndexMap<String, Slice>,
///     compiled: IndexMap<ChannelId, Waveform>,
///     slice_durations: IndexMap<String, f64>,
///     pending_compile: BTreeSet<ChannelId>,
///     pending_program: BTreeSet<ChannelId>,
///     programmed: bool,
///     snapshot: SnapshotHandle,
/// }
/// impl_sequence_boilerplate!(MySequence);
/// ```
#[macro_export]
macro_rules! impl_sequence_boilerplate {
    ($seq_type: ty) => {
        impl $crate::sequence::BaseSequence for $seq_type {
            fn cycle_frequency(&self) -> f64 {
                self.cycle_frequency
            }
            fn registry(&self) -> &$crate::channel::ChannelRegistry {
                &self.registry
            }
            fn devices(
                &self,
            ) -> &$crate::indexmap::IndexMap<
                $crate::channel::ChannelId,
                Box<dyn $crate::device::WaveformChannel>,
            > {
                &self.devices
            }
            fn slices(&self) -> &$crate::indexmap::IndexMap<String, $crate::slice::Slice> {
                &self.slices
            }
            fn compiled(
                &self,
            ) -> &$crate::indexmap::IndexMap<$crate::channel::ChannelId, $crate::waveform::Waveform>
            {
                &self.compiled
            }
            fn slice_durations(&self) -> &$crate::indexmap::IndexMap<String, f64> {
                &self.slice_durations
            }
            fn pending_compile(&self) -> &std::collections::BTreeSet<$crate::channel::ChannelId> {
                &self.pending_compile
            }
            fn pending_program(&self) -> &std::collections::BTreeSet<$crate::channel::ChannelId> {
                &self.pending_program
            }
            fn is_programmed(&self) -> bool {
                self.programmed
            }
            fn snapshot_handle(&self) -> &$crate::snapshot::SnapshotHandle {
                &self.snapshot
            }

            fn trigger_device_(&mut self) -> &mut dyn $crate::device::TriggerDevice {
                self.trigger_device.as_mut()
            }
            fn registry_(&mut self) -> &mut $crate::channel::ChannelRegistry {
                &mut self.registry
            }
            fn devices_(
                &mut self,
            ) -> &mut $crate::indexmap::IndexMap<
                $crate::channel::ChannelId,
                Box<dyn $crate::device::WaveformChannel>,
            > {
                &mut self.devices
            }
            fn slices_(&mut self) -> &mut $crate::indexmap::IndexMap<String, $crate::slice::Slice> {
                &mut self.slices
            }
            fn compiled_(
                &mut self,
            ) -> &mut $crate::indexmap::IndexMap<
                $crate::channel::ChannelId,
                $crate::waveform::Waveform,
            > {
                &mut self.compiled
            }
            fn slice_durations_(&mut self) -> &mut $crate::indexmap::IndexMap<String, f64> {
                &mut self.slice_durations
            }
            fn pending_compile_(
                &mut self,
            ) -> &mut std::collections::BTreeSet<$crate::channel::ChannelId> {
                &mut self.pending_compile
            }
            fn pending_program_(
                &mut self,
            ) -> &mut std::collections::BTreeSet<$crate::channel::ChannelId> {
                &mut self.pending_program
            }
            fn programmed_(&mut self) -> &mut bool {
                &mut self.programmed
            }
        }
    };
}

impl_sequence_boilerplate!(Sequence);

impl Sequence {
    /// Creates an empty sequence repeating at `cycle_frequency` Hz.
    pub fn new<T: TriggerDevice + 'static>(trigger_device: T, cycle_frequency: f64) -> Self {
        Self::with_boxed_trigger(Box::new(trigger_device), cycle_frequency)
    }

    pub fn with_boxed_trigger(
        trigger_device: Box<dyn TriggerDevice>,
        cycle_frequency: f64,
    ) -> Self {
        Self {
            cycle_frequency,
            trigger_device,
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

    /// Clone of the snapshot handle, for readers on other threads.
    pub fn snapshot_reader(&self) -> SnapshotHandle {
        self.snapshot.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::memory::{MemoryChannel, MemoryTrigger};
    use maplit::btreeset;

    fn sequence() -> (Sequence, ChannelId, ChannelId) {
        let mut seq = Sequence::new(MemoryTrigger::new(), 10e3);
        let trig = seq.add_trigger("trig", 0, 1e-6, 4e-6).unwrap();
        let a = seq.link_channel(trig, "a", MemoryChannel::new(1e9)).unwrap();
        let b = seq.link_channel(trig, "b", MemoryChannel::new(1e9)).unwrap();
        (seq, a, b)
    }

    #[test]
    fn add_slice_checks_cycle() {
        let (mut seq, _, _) = sequence();
        assert!(matches!(
            seq.add_slice(Slice::fixed_length("long", 200e-6)),
            Err(Error::CycleOverflow { .. })
        ));
        assert!(matches!(
            seq.add_slice(Slice::fixed("late", 90e-6, 20e-6)),
            Err(Error::CycleOverflow { .. })
        ));
        seq.add_slice(Slice::fixed("edge", 90e-6, 10e-6)).unwrap();
        assert!(matches!(
            seq.add_slice(Slice::flex("edge")),
            Err(Error::DuplicateName { .. })
        ));
    }

    #[test]
    fn stacked_slices_overflowing_cycle() {
        let (mut seq, a, _) = sequence();
        seq.add_slice(Slice::fixed_length("first", 60e-6)).unwrap();
        let mut second = Slice::flex("second");
        second.add_waveform(a, Waveform::dc(50e-6, 1.));
        seq.add_slice(second).unwrap();
        assert!(matches!(
            seq.compile(),
            Err(Error::CycleOverflow { slice, .. }) if slice == "second"
        ));
        assert_eq!(seq.pending_compile(), &btreeset! {a});
        assert!(seq.compiled_waveform(a).is_none());
    }

    #[test]
    fn slice_paths() {
        let (mut seq, a, _) = sequence();
        let mut outer = Slice::flex("outer");
        outer.add_sub_slice(Slice::flex("inner")).unwrap();
        seq.add_slice(outer).unwrap();
        seq.add_waveform("outer/inner", "a", Waveform::dc(1e-6, 1.))
            .unwrap();
        assert!(seq.slice_path_("outer/inner").unwrap().waveform(a).is_some());
        assert!(matches!(
            seq.slice_path_("outer/missing"),
            Err(Error::Unknown { kind: "slice", .. })
        ));
        assert!(matches!(
            seq.add_waveform("outer", "nope", Waveform::dc(1e-6, 1.)),
            Err(Error::Unknown { kind: "channel", .. })
        ));
    }

    #[test]
    fn unlinked_channel_only_matters_with_content() {
        let mut seq = Sequence::new(MemoryTrigger::new(), 10e3);
        let loose = seq.registry_().add_channel("loose").unwrap();
        seq.add_slice(Slice::flex("s")).unwrap();
        assert!(seq.compile().unwrap().is_empty());
        seq.slice_("s").unwrap().add_waveform(loose, Waveform::dc(1e-6, 1.));
        assert!(matches!(
            seq.compile(),
            Err(Error::UnlinkedChannel { channel }) if channel == "loose"
        ));
    }

    #[test]
    fn run_before_program() {
        let (mut seq, _, _) = sequence();
        assert!(matches!(seq.run_channels(), Err(Error::NotCompiled)));
        seq.setup_channels().unwrap();
        assert!(seq.run_channels().is_ok());
    }

    #[test]
    fn moved_trigger_rebuilds_lead() {
        let (mut seq, a, b) = sequence();
        let mut s = Slice::fixed("s", 5e-6, 1e-6);
        s.add_waveform(a, Waveform::dc(1e-6, 1.));
        s.add_waveform(b, Waveform::dc(1e-6, 1.));
        seq.add_slice(s).unwrap();
        seq.compile().unwrap();
        assert!((seq.compiled_waveform(a).unwrap().width() - 5e-6).abs() < 1e-15);

        let late = seq.add_trigger("late", 1, 3e-6, 4e-6).unwrap();
        seq.registry_().link(a, late).unwrap();
        assert_eq!(seq.compile().unwrap(), btreeset! {a});
        assert!((seq.compiled_waveform(a).unwrap().width() - 3e-6).abs() < 1e-15);
        assert!(seq.compile().unwrap().is_empty());
    }

    #[test]
    fn run_skips_unwritten_channels() {
        let mut seq = Sequence::new(MemoryTrigger::new(), 10e3);
        let trig = seq.add_trigger("trig", 0, 0., 4e-6).unwrap();
        let (awg_a, awg_b) = (MemoryChannel::new(1e9), MemoryChannel::new(1e9));
        let (state_a, state_b) = (awg_a.state(), awg_b.state());
        let a = seq.link_channel(trig, "a", awg_a).unwrap();
        let b = seq.link_channel(trig, "b", awg_b).unwrap();
        let mut s = Slice::flex("s");
        s.add_waveform(a, Waveform::dc(1e-6, 1.));
        seq.add_slice(s).unwrap();
        seq.setup_channels().unwrap();

        seq.slice_("s").unwrap().add_waveform(b, Waveform::dc(1e-6, 1.));
        assert_eq!(seq.compile().unwrap(), btreeset! {b});
        seq.run_channels().unwrap();
        assert_eq!(state_a.lock().runs, 1);
        assert_eq!(state_b.lock().runs, 0);

        seq.program().unwrap();
        seq.run_channels().unwrap();
        assert_eq!(state_b.lock().runs, 1);
    }

    #[test]
    fn cleared_channel_is_only_stopped() {
        let mut seq = Sequence::new(MemoryTrigger::new(), 10e3);
        let trig = seq.add_trigger("trig", 0, 0., 4e-6).unwrap();
        let awg = MemoryChannel::new(1e9);
        let state = awg.state();
        let a = seq.link_channel(trig, "a", awg).unwrap();
        let mut s = Slice::flex("s");
        s.add_waveform(a, Waveform::dc(1e-6, 1.));
        seq.add_slice(s).unwrap();
        seq.setup_channels().unwrap();
        assert_eq!(state.lock().writes, 1);

        seq.clear_waveform("s", "a").unwrap();
        assert_eq!(seq.compile().unwrap(), btreeset! {a});
        assert!(seq.compiled_waveform(a).is_none());
        assert_eq!(seq.program().unwrap(), 1);
        let state = state.lock();
        assert_eq!((state.writes, state.stops), (1, 2));
    }
}
