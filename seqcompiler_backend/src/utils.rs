// Shared constants, timeline arithmetic helpers and a small timer used for logging.
use std::sync::OnceLock;
use std::time::Instant;

use regex::Regex;

use crate::error::{Error, Result};

/// Tolerance (in seconds) for every width / duration comparison on the cycle timeline.
pub const EPSILON: f64 = 1e-15;

/// Default width of a trigger pulse, in seconds.
pub const DEFAULT_DROP_AFTER: f64 = 4e-6;

/// Default memory alignment unit used by [`Waveform::sample`](crate::waveform::Waveform::sample).
pub const DEFAULT_MIN_UNIT: usize = 16;

/// Number of grid points `i / samp_rate` lying in `[0, width)`.
///
/// `width * samp_rate` is snapped to the nearest integer when it lies within floating-point
/// jitter of it, so a 100 ns waveform at 1 GSa/s gives exactly 100 samples.
///
/// ```
/// # use seqcompiler_backend::utils::sample_count;
/// assert_eq!(sample_count(100e-9, 1e9), 100);
/// assert_eq!(sample_count(1.05e-6, 1e6), 2);
/// assert_eq!(sample_count(0., 1e9), 0);
/// ```
pub fn sample_count(width: f64, samp_rate: f64) -> usize {
    if width <= 0. || samp_rate <= 0. {
        return 0;
    }
    let exact = width * samp_rate;
    let nearest = exact.round();
    if (exact - nearest).abs() < 1e-6 {
        nearest as usize
    } else {
        exact.ceil() as usize
    }
}

/// Rounds `len` up to the next multiple of `min_unit` (`min_unit == 0` is treated as 1).
pub fn align_up(len: usize, min_unit: usize) -> usize {
    let unit = min_unit.max(1);
    len.div_ceil(unit) * unit
}

/// Checks that `name` can be used for a channel, trigger or slice.
///
/// Slashes are reserved as slice path separators, see
/// [`BaseSequence::slice_path_`](crate::sequence::BaseSequence::slice_path_).
pub fn validate_name(kind: &'static str, name: &str) -> Result<()> {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_.:\-]*$").expect("name pattern is a valid regex")
    });
    if re.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

// Utility class for time-tracking of compile / program passes
pub struct TickTimer {
    last: Instant,
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Milliseconds since construction or the previous tick.
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        log::debug!("{}: {:.3} ms", msg, diff);
        diff
    }
}
