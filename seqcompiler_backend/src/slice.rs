//! Hierarchical time slices.
//!
//! A [`Slice`] is a named window of the cycle holding, per channel, the waveform to play
//! while the window is open. Slices nest: a slice may either carry a channel directly or
//! inherit it from its sub slices, which are laid out back to back in insertion order.
//! Flattening a slice produces one waveform per channel spanning the whole slice, blank
//! filled wherever a sub slice does not use the channel.
//!
//! ## Kinds
//! - [`SliceKind::Fixed`]: anchored at `start_from` on the cycle timeline, top level only.
//! - [`SliceKind::FixedLength`]: stacked after the previous slice, fixed duration.
//! - [`SliceKind::Flex`]: stacked, as long as its longest direct waveform or the sum of
//!   its sub slice durations, whichever is larger.
//!
//! Fixed-duration slices pad every channel up to their duration, with the blank placed
//! before the content by default (so the content ends with the slice) or behind it, see
//! [`Slice::set_waveform_padding`].
//!
//! ## Incremental flattening
//! Every mutation marks the channels it touches as dirty. Flattening only rebuilds the
//! updated channels (see [`Slice::updated_channels`]) and keeps the memoized result for
//! the others, so editing one pulse in a large experiment does not resample everything.
//!
//! Flattening a sub slice on its own does not hide its changes from the parent: a slice
//! keeps reporting every channel it rebuilt until its owner (the parent slice or the
//! sequence) consumed them, see [`Slice::changed_channels`].

use std::collections::BTreeSet;

use indexmap::IndexMap;

use crate::channel::{ChannelId, ChannelRegistry};
use crate::error::{Error, Result};
use crate::utils::{validate_name, EPSILON};
use crate::waveform::Waveform;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SliceKind {
    Fixed { start_from: f64, duration: f64 },
    FixedLength { duration: f64 },
    Flex,
}

/// Where the blank filler goes when content is shorter than a fixed-duration slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PaddingPosition {
    #[default]
    Before,
    Behind,
}

#[derive(Clone, Debug)]
pub struct Slice {
    name: String,
    kind: SliceKind,
    waveforms: IndexMap<ChannelId, Waveform>,
    padding: IndexMap<ChannelId, PaddingPosition>,
    sub_slices: IndexMap<String, Slice>,
    dirty: BTreeSet<ChannelId>,
    // Rebuilt channels the owner has not consumed yet
    unconsumed: BTreeSet<ChannelId>,
    // Sub slice durations seen by the last successful flattening
    duration_history: IndexMap<String, f64>,
    flattened: IndexMap<ChannelId, Waveform>,
    valid: bool,
}

impl Slice {
    fn new(name: &str, kind: SliceKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            waveforms: IndexMap::new(),
            padding: IndexMap::new(),
            sub_slices: IndexMap::new(),
            dirty: BTreeSet::new(),
            unconsumed: BTreeSet::new(),
            duration_history: IndexMap::new(),
            flattened: IndexMap::new(),
            valid: false,
        }
    }

    /// A slice anchored at `start_from` seconds after the cycle start.
    pub fn fixed(name: &str, start_from: f64, duration: f64) -> Self {
        Self::new(
            name,
            SliceKind::Fixed {
                start_from,
                duration,
            },
        )
    }

    pub fn fixed_length(name: &str, duration: f64) -> Self {
        Self::new(name, SliceKind::FixedLength { duration })
    }

    pub fn flex(name: &str) -> Self {
        Self::new(name, SliceKind::Flex)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SliceKind {
        self.kind
    }

    /// `Some(start_from)` for a [`SliceKind::Fixed`] slice.
    pub fn start_from(&self) -> Option<f64> {
        match self.kind {
            SliceKind::Fixed { start_from, .. } => Some(start_from),
            _ => None,
        }
    }

    fn fixed_duration(&self) -> Option<f64> {
        match self.kind {
            SliceKind::Fixed { duration, .. } | SliceKind::FixedLength { duration } => {
                Some(duration)
            }
            SliceKind::Flex => None,
        }
    }

    /// Duration of the slice. An empty flex slice lasts 0 s.
    ///
    /// ```
    /// # use seqcompiler_backend::*;
    /// # let mut registry = ChannelRegistry::new();
    /// # let ch = registry.add_channel("awg0").unwrap();
    /// let mut slice = Slice::flex("drive");
    /// assert_eq!(slice.duration(), 0.);
    /// slice.add_waveform(ch, Waveform::dc(1e-6, 0.5));
    /// slice.add_waveform(ch, Waveform::dc(1e-6, 0.2));
    /// assert_eq!(slice.duration(), 2e-6);
    /// ```
    pub fn duration(&self) -> f64 {
        match self.fixed_duration() {
            Some(duration) => duration,
            None => {
                let direct = self
                    .waveforms
                    .values()
                    .map(Waveform::width)
                    .fold(0_f64, f64::max);
                let stacked: f64 = self.sub_slices.values().map(Slice::duration).sum();
                direct.max(stacked)
            }
        }
    }

    /// Appends `waveform` to whatever this slice already plays on `channel`.
    pub fn add_waveform(&mut self, channel: ChannelId, waveform: Waveform) {
        self.mark(channel);
        let waveform = match self.waveforms.shift_remove(&channel) {
            Some(existing) => existing.concat(waveform),
            None => waveform,
        };
        self.waveforms.insert(channel, waveform);
    }

    pub fn clear_waveform(&mut self, channel: ChannelId) {
        self.mark(channel);
        self.waveforms.shift_remove(&channel);
    }

    pub fn set_waveform_padding(&mut self, channel: ChannelId, position: PaddingPosition) {
        self.mark(channel);
        self.padding.insert(channel, position);
    }

    fn mark(&mut self, channel: ChannelId) {
        self.dirty.insert(channel);
        self.valid = false;
    }

    /// The waveform this slice carries directly on `channel`, if any.
    pub fn waveform(&self, channel: ChannelId) -> Option<&Waveform> {
        self.waveforms.get(&channel)
    }

    /// Nests `sub_slice` after the existing sub slices. Fixed slices can not be nested and
    /// sibling names must be unique.
    pub fn add_sub_slice(&mut self, sub_slice: Slice) -> Result<()> {
        validate_name("slice", &sub_slice.name)?;
        if let SliceKind::Fixed { .. } = sub_slice.kind {
            return Err(Error::FixedSliceNested {
                parent: self.name.clone(),
                child: sub_slice.name,
            });
        }
        if self.sub_slices.contains_key(&sub_slice.name) {
            return Err(Error::DuplicateName {
                kind: "slice",
                name: sub_slice.name,
                registered: self.sub_slices.keys().cloned().collect(),
            });
        }
        self.dirty.extend(sub_slice.changed_channels());
        self.dirty.extend(sub_slice.channels());
        self.duration_history.insert(sub_slice.name.clone(), 0.);
        self.sub_slices.insert(sub_slice.name.clone(), sub_slice);
        self.valid = false;
        Ok(())
    }

    pub fn sub_slice(&self, name: &str) -> Result<&Slice> {
        self.sub_slices
            .get(name)
            .ok_or_else(|| Error::unknown("slice", format!("{}/{}", self.name, name)))
    }

    pub fn sub_slice_(&mut self, name: &str) -> Result<&mut Slice> {
        let parent = &self.name;
        self.sub_slices
            .get_mut(name)
            .ok_or_else(|| Error::unknown("slice", format!("{parent}/{name}")))
    }

    pub fn sub_slices(&self) -> impl Iterator<Item = &Slice> {
        self.sub_slices.values()
    }

    /// Every channel this slice or any of its descendants carries.
    pub fn channels(&self) -> BTreeSet<ChannelId> {
        let mut channels: BTreeSet<ChannelId> = self.waveforms.keys().copied().collect();
        for sub_slice in self.sub_slices.values() {
            channels.extend(sub_slice.channels());
        }
        channels
    }

    fn sub_duration_changed(&self, name: &str, sub_slice: &Slice) -> bool {
        let recorded = self.duration_history.get(name).copied().unwrap_or(0.);
        (sub_slice.duration() - recorded).abs() > EPSILON
    }

    /// Channels whose flattened waveform must be rebuilt: channels edited directly,
    /// channels reported by sub slices, and every channel of this slice as soon as one
    /// sub slice changed duration (the placement of everything after it moves).
    pub fn updated_channels(&self) -> BTreeSet<ChannelId> {
        let mut updated = self.dirty.clone();
        let mut all_added = false;
        for (name, sub_slice) in &self.sub_slices {
            if !all_added && self.sub_duration_changed(name, sub_slice) {
                updated.extend(self.channels());
                all_added = true;
            }
            // Cleared channels are only known to the sub slice itself
            updated.extend(sub_slice.changed_channels());
        }
        updated
    }

    /// Channels the owner of this slice must rebuild: the pending
    /// [`updated_channels`](Slice::updated_channels) plus those already rebuilt by a
    /// flattening the owner has not consumed yet.
    pub fn changed_channels(&self) -> BTreeSet<ChannelId> {
        let mut changed = self.updated_channels();
        changed.extend(self.unconsumed.iter().copied());
        changed
    }

    /// Marks every channel reported by [`Slice::changed_channels`] as consumed.
    pub fn acknowledge_changes(&mut self) {
        self.unconsumed.clear();
    }

    /// Whether the slice or one of its descendants changed since the last flattening.
    pub fn is_stale(&self) -> bool {
        !self.valid
            || !self.dirty.is_empty()
            || self
                .sub_slices
                .iter()
                .any(|(name, sub)| {
                    self.sub_duration_changed(name, sub)
                        || !sub.unconsumed.is_empty()
                        || sub.is_stale()
                })
    }

    /// Rebuilds the flattened waveform of every updated channel.
    ///
    /// Nothing is committed on error, and the updated channels stay marked so the next
    /// attempt rebuilds them again.
    pub fn flatten(&mut self, registry: &ChannelRegistry) -> Result<()> {
        if !self.is_stale() {
            return Ok(());
        }
        let updated = self.updated_channels();
        match self.rebuild(&updated, registry) {
            Ok(fresh) => {
                for (channel, waveform) in fresh {
                    match waveform {
                        Some(waveform) => {
                            self.flattened.insert(channel, waveform);
                        }
                        None => {
                            self.flattened.shift_remove(&channel);
                        }
                    }
                }
                self.duration_history = self
                    .sub_slices
                    .iter()
                    .map(|(name, sub)| (name.clone(), sub.duration()))
                    .collect();
                for sub_slice in self.sub_slices.values_mut() {
                    sub_slice.acknowledge_changes();
                }
                self.dirty.clear();
                self.unconsumed.extend(updated.iter().copied());
                self.valid = true;
                log::debug!(
                    "Flattened slice {}: {} channel(s) rebuilt",
                    self.name,
                    updated.len()
                );
                Ok(())
            }
            Err(err) => {
                self.dirty.extend(updated);
                self.valid = false;
                Err(err)
            }
        }
    }

    fn rebuild(
        &mut self,
        updated: &BTreeSet<ChannelId>,
        registry: &ChannelRegistry,
    ) -> Result<Vec<(ChannelId, Option<Waveform>)>> {
        for sub_slice in self.sub_slices.values_mut() {
            sub_slice.flatten(registry)?;
        }
        let mut fresh = Vec::with_capacity(updated.len());
        for &channel in updated {
            let inherited = self.assemble(channel);
            let waveform = match (self.waveforms.get(&channel), inherited) {
                (Some(_), Some(_)) => {
                    return Err(Error::ConflictingWaveform {
                        slice: self.name.clone(),
                        channel: registry.channel_name(channel).to_string(),
                    })
                }
                (Some(direct), None) => Some(self.pad(channel, direct.clone(), registry)?),
                (None, Some(inherited)) => Some(self.pad(channel, inherited, registry)?),
                (None, None) => None,
            };
            fresh.push((channel, waveform));
        }
        Ok(fresh)
    }

    // Lays the sub slices carrying `channel` on the slice timeline
    fn assemble(&self, channel: ChannelId) -> Option<Waveform> {
        let mut pointer = 0.;
        let mut track: Option<Waveform> = None;
        for sub_slice in self.sub_slices.values() {
            if let Some(segment) = sub_slice.flattened.get(&channel) {
                let head = match track.take() {
                    None if pointer <= EPSILON => None,
                    None => Some(Waveform::blank(pointer)),
                    Some(track) => Some(fill_to(track, pointer)),
                };
                track = Some(match head {
                    Some(head) => head.concat(segment.clone()),
                    None => segment.clone(),
                });
            }
            pointer += sub_slice.duration();
        }
        track.map(|track| fill_to(track, pointer))
    }

    fn pad(
        &self,
        channel: ChannelId,
        waveform: Waveform,
        registry: &ChannelRegistry,
    ) -> Result<Waveform> {
        let Some(duration) = self.fixed_duration() else {
            return Ok(waveform);
        };
        let gap = duration - waveform.width();
        if gap < -EPSILON {
            return Err(Error::SliceOverflow {
                slice: self.name.clone(),
                channel: registry.channel_name(channel).to_string(),
                width: waveform.width(),
                duration,
            });
        }
        if gap <= EPSILON {
            return Ok(waveform);
        }
        let padding = self.padding.get(&channel).copied().unwrap_or_default();
        Ok(match padding {
            PaddingPosition::Before => Waveform::blank(gap).concat(waveform),
            PaddingPosition::Behind => waveform.concat(Waveform::blank(gap)),
        })
    }

    /// Flattened waveform of `channel`, re-flattening first if anything changed.
    /// `None` when neither this slice nor its descendants use the channel.
    pub fn get_waveform(
        &mut self,
        channel: ChannelId,
        registry: &ChannelRegistry,
    ) -> Result<Option<&Waveform>> {
        self.flatten(registry)?;
        Ok(self.flattened.get(&channel))
    }

    /// Memoized flattened waveforms, as of the last successful [`Slice::flatten`].
    pub fn flattened(&self) -> &IndexMap<ChannelId, Waveform> {
        &self.flattened
    }
}

// Pads `track` with a blank up to `width`
fn fill_to(track: Waveform, width: f64) -> Waveform {
    let gap = width - track.width();
    if gap > EPSILON {
        track.concat(Waveform::blank(gap))
    } else {
        track
    }
}
