//! Read-only views of the compiled cycle.
//!
//! Every successful compile publishes a fresh [`CompiledSnapshot`]. Readers (plotting,
//! status pages, another thread) call [`SnapshotHandle::load`] and get an
//! `Arc<CompiledSnapshot>` that stays consistent no matter what the sequence does next.

use std::sync::Arc;

use ndarray::Array1;
use parking_lot::RwLock;

use crate::utils::sample_count;
use crate::waveform::Waveform;

#[derive(Clone, Debug, PartialEq)]
pub struct TriggerInfo {
    pub name: String,
    pub trigger_channel: usize,
    pub raise_at: f64,
    pub drop_after: f64,
}

/// Compiled waveform of one channel, as played after its trigger rises.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelTrace {
    pub name: String,
    pub trigger: String,
    pub raise_at: f64,
    pub waveform: Waveform,
}

/// Placement of a top-level slice on the cycle timeline.
#[derive(Clone, Debug, PartialEq)]
pub struct SliceSpan {
    pub name: String,
    pub start: f64,
    pub duration: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompiledSnapshot {
    /// Number of successful compiles so far; 0 before the first one.
    pub generation: u64,
    pub cycle_frequency: f64,
    pub triggers: Vec<TriggerInfo>,
    pub channels: Vec<ChannelTrace>,
    pub slices: Vec<SliceSpan>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceKind {
    Channel,
    Trigger,
}

/// One line of a preview plot, sampled on [`CompiledSnapshot::render`]'s time grid.
#[derive(Clone, Debug)]
pub struct Trace {
    pub name: String,
    pub kind: TraceKind,
    pub values: Array1<f64>,
}

impl CompiledSnapshot {
    pub fn channel(&self, name: &str) -> Option<&ChannelTrace> {
        self.channels.iter().find(|c| c.name == name)
    }

    /// Time grid of one cycle at `sample_rate`.
    pub fn times(&self, sample_rate: f64) -> Array1<f64> {
        if self.cycle_frequency <= 0. {
            return Array1::zeros(0);
        }
        let len = sample_count(1. / self.cycle_frequency, sample_rate);
        Array1::from_shape_fn(len, |i| i as f64 / sample_rate)
    }

    /// Samples every trigger strobe (0/1) and every compiled channel on the cycle
    /// timeline, triggers sorted by rise time.
    pub fn render(&self, sample_rate: f64) -> Vec<Trace> {
        let times = self.times(sample_rate);
        let mut triggers: Vec<&TriggerInfo> = self.triggers.iter().collect();
        triggers.sort_by(|a, b| a.raise_at.total_cmp(&b.raise_at));

        let mut traces = Vec::new();
        for trigger in triggers {
            let (raise, drop) = (trigger.raise_at, trigger.raise_at + trigger.drop_after);
            traces.push(Trace {
                name: trigger.name.clone(),
                kind: TraceKind::Trigger,
                values: times.mapv(|t| if raise < t && t < drop { 1. } else { 0. }),
            });
            for chan in self.channels.iter().filter(|c| c.trigger == trigger.name) {
                let shifted = times.mapv(|t| t - chan.raise_at);
                traces.push(Trace {
                    name: chan.name.clone(),
                    kind: TraceKind::Channel,
                    values: chan.waveform.thumbnail_sample(shifted.view()),
                });
            }
        }
        traces
    }
}

/// Shared, swappable pointer to the latest snapshot.
#[derive(Clone, Debug, Default)]
pub struct SnapshotHandle(Arc<RwLock<Arc<CompiledSnapshot>>>);

impl SnapshotHandle {
    pub fn load(&self) -> Arc<CompiledSnapshot> {
        self.0.read().clone()
    }

    pub(crate) fn publish(&self, snapshot: CompiledSnapshot) {
        *self.0.write() = Arc::new(snapshot);
    }
}
