//! Signal debouncing for raw sensor readings
//!
//! Turns a noisy raw metric stream into a stable boolean logical state. Two
//! policies are available and selected per channel through [`DebounceConfig`]:
//!
//! ```text
//! Hysteresis band (continuous metric, e.g. distance in cm)
//!
//!   metric ≤ on_threshold    ──► true
//!   on < metric < off         ──► unchanged (dead zone)
//!   metric ≥ off_threshold   ──► false
//!
//! Dwell time (binary metric, e.g. PIR or flow switch)
//!
//!   raw ─┬─ differs from raw_last ──► raw_last = raw, restart timer
//!        └─ unchanged for ≥ stable_duration ──► logical = raw
//! ```
//!
//! Both policies take the sample time as an argument. Decisions depend on
//! elapsed wall-clock time, never on how many samples were taken.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Upper bound of a plausible ultrasonic reading; HC-SR04 class rangers
/// report garbage beyond roughly four metres.
const DEFAULT_MAX_VALID: f32 = 400.0;

/// A single sample from a raw metric source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawReading {
    /// Binary input level, already corrected for active-low wiring
    Level(bool),
    /// Continuous measurement, e.g. distance in centimetres
    Metric(f32),
    /// The source could not produce a usable value this cycle
    Invalid(InvalidReading),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReading {
    /// No echo or edge within the read window
    Timeout,
    /// Echo returned faster than the sensor can resolve
    TooClose,
    /// Value outside the sensor's valid range
    OutOfRange,
    /// The value could not be read or parsed
    Unreadable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebounceKind {
    Hysteresis,
    Dwell,
}

impl Display for DebounceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebounceKind::Hysteresis => write!(f, "Hysteresis"),
            DebounceKind::Dwell => write!(f, "Dwell"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DebounceError {
    #[error("OFF threshold {off} must be greater than ON threshold {on}")]
    InvertedThresholds { on: f32, off: f32 },

    #[error("Threshold is not a finite positive number: {0}")]
    InvalidThreshold(f32),
}

/// Common interface of both debounce policies.
pub trait Debouncer: Send + 'static {
    /// Feeds one sample taken at `now`. Returns the new logical state when
    /// this sample caused a transition.
    fn update(&mut self, reading: RawReading, now: Instant) -> Option<bool>;

    /// Current logical state.
    fn state(&self) -> bool;

    fn kind(&self) -> DebounceKind;

    /// Measurement from the most recent sample, if it was valid.
    fn last_measurement(&self) -> Option<f32> {
        None
    }
}

/// Per-channel debounce policy as it appears in the configuration file.
///
/// ```toml
/// debounce = { mode = "hysteresis", on_threshold = 10.0, off_threshold = 12.0 }
/// debounce = { mode = "dwell", stable_ms = 5000 }
/// ```
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DebounceConfig {
    Hysteresis {
        on_threshold: f32,
        off_threshold: f32,
        #[serde(default = "default_max_valid")]
        max_valid: f32,
    },
    Dwell {
        stable_ms: u64,
    },
}

fn default_max_valid() -> f32 {
    DEFAULT_MAX_VALID
}

impl DebounceConfig {
    pub fn validate(&self) -> Result<(), DebounceError> {
        match *self {
            DebounceConfig::Hysteresis {
                on_threshold,
                off_threshold,
                max_valid,
            } => {
                for value in [on_threshold, off_threshold, max_valid] {
                    if !value.is_finite() || value <= 0.0 {
                        return Err(DebounceError::InvalidThreshold(value));
                    }
                }
                if off_threshold <= on_threshold {
                    return Err(DebounceError::InvertedThresholds {
                        on: on_threshold,
                        off: off_threshold,
                    });
                }
                Ok(())
            }
            DebounceConfig::Dwell { .. } => Ok(()),
        }
    }

    /// Builds the debouncer for this policy, starting in `initial` state.
    pub fn create_debouncer(&self, initial: bool) -> Result<Box<dyn Debouncer>, DebounceError> {
        self.validate()?;
        let debouncer: Box<dyn Debouncer> = match *self {
            DebounceConfig::Hysteresis {
                on_threshold,
                off_threshold,
                max_valid,
            } => Box::new(HysteresisBand::new(on_threshold, off_threshold, initial)?.with_max_valid(max_valid)),
            DebounceConfig::Dwell { stable_ms } => {
                Box::new(DwellTimer::new(Duration::from_millis(stable_ms), initial))
            }
        };
        Ok(debouncer)
    }

    pub fn kind(&self) -> DebounceKind {
        match self {
            DebounceConfig::Hysteresis { .. } => DebounceKind::Hysteresis,
            DebounceConfig::Dwell { .. } => DebounceKind::Dwell,
        }
    }
}

/// Two-threshold dead band for continuous metrics.
#[derive(Debug, Clone)]
pub struct HysteresisBand {
    on_threshold: f32,
    off_threshold: f32,
    max_valid: f32,
    state: bool,
    last_measurement: Option<f32>,
}

impl HysteresisBand {
    pub fn new(on_threshold: f32, off_threshold: f32, initial: bool) -> Result<Self, DebounceError> {
        if off_threshold <= on_threshold {
            return Err(DebounceError::InvertedThresholds {
                on: on_threshold,
                off: off_threshold,
            });
        }
        Ok(Self {
            on_threshold,
            off_threshold,
            max_valid: DEFAULT_MAX_VALID.max(off_threshold),
            state: initial,
            last_measurement: None,
        })
    }

    pub fn with_max_valid(mut self, max_valid: f32) -> Self {
        self.max_valid = max_valid;
        self
    }

    fn is_valid(&self, metric: f32) -> bool {
        metric.is_finite() && metric > 0.0 && metric <= self.max_valid
    }
}

impl Debouncer for HysteresisBand {
    fn update(&mut self, reading: RawReading, _now: Instant) -> Option<bool> {
        let metric = match reading {
            RawReading::Metric(metric) if self.is_valid(metric) => metric,
            other => {
                trace!("Discarding sample {:?}", other);
                self.last_measurement = None;
                return None;
            }
        };
        self.last_measurement = Some(metric);

        if !self.state && metric <= self.on_threshold {
            debug!("{} ≤ {}: switching on", metric, self.on_threshold);
            self.state = true;
            Some(true)
        } else if self.state && metric >= self.off_threshold {
            debug!("{} ≥ {}: switching off", metric, self.off_threshold);
            self.state = false;
            Some(false)
        } else {
            None
        }
    }

    fn state(&self) -> bool {
        self.state
    }

    fn kind(&self) -> DebounceKind {
        DebounceKind::Hysteresis
    }

    fn last_measurement(&self) -> Option<f32> {
        self.last_measurement
    }
}

/// Commits a binary level only after it has held for `stable_duration`.
#[derive(Debug, Clone)]
pub struct DwellTimer {
    stable_duration: Duration,
    raw_last: Option<bool>,
    last_raw_change_at: Option<Instant>,
    state: bool,
}

impl DwellTimer {
    pub fn new(stable_duration: Duration, initial: bool) -> Self {
        Self {
            stable_duration,
            raw_last: None,
            last_raw_change_at: None,
            state: initial,
        }
    }

    pub fn raw_last(&self) -> Option<bool> {
        self.raw_last
    }

    pub fn last_raw_change_at(&self) -> Option<Instant> {
        self.last_raw_change_at
    }
}

impl Debouncer for DwellTimer {
    fn update(&mut self, reading: RawReading, now: Instant) -> Option<bool> {
        let raw = match reading {
            RawReading::Level(raw) => raw,
            other => {
                trace!("Discarding sample {:?}", other);
                return None;
            }
        };

        let changed_at = match (self.raw_last, self.last_raw_change_at) {
            (Some(last), Some(at)) if last == raw => at,
            _ => {
                self.raw_last = Some(raw);
                self.last_raw_change_at = Some(now);
                now
            }
        };

        if raw != self.state && now.saturating_duration_since(changed_at) >= self.stable_duration {
            debug!(
                "Level {} held for {:?}, committing",
                raw,
                now.saturating_duration_since(changed_at)
            );
            self.state = raw;
            return Some(raw);
        }
        None
    }

    fn state(&self) -> bool {
        self.state
    }

    fn kind(&self) -> DebounceKind {
        DebounceKind::Dwell
    }
}
