//! Explicit device state threaded through the agent loop.

use super::debounce::{Debouncer, RawReading};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;
use tracing::info;

/// Connectivity of the edge device as seen by the supervisor.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum LinkState {
    #[default]
    Disconnected,
    /// Network link is up, broker session not (yet) associated
    LinkUp,
    /// Session open, last-will registered, online status announced
    Associated,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "Disconnected"),
            LinkState::LinkUp => write!(f, "LinkUp"),
            LinkState::Associated => write!(f, "Associated"),
        }
    }
}

/// One sensor channel: the payload field it drives and its debouncer.
///
/// The debouncer owns the raw bookkeeping (`raw_last`, `last_raw_change_at`)
/// and the logical state for the channel.
pub struct ChannelContext {
    pub field: String,
    pub debouncer: Box<dyn Debouncer>,
    /// Include this channel's measurement as `distance_cm` when valid
    pub report_measurement: bool,
}

impl ChannelContext {
    pub fn new(field: impl Into<String>, debouncer: Box<dyn Debouncer>) -> Self {
        Self {
            field: field.into(),
            debouncer,
            report_measurement: false,
        }
    }

    pub fn reporting_measurement(mut self) -> Self {
        self.report_measurement = true;
        self
    }

    pub fn logical_state(&self) -> bool {
        self.debouncer.state()
    }
}

impl fmt::Debug for ChannelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelContext")
            .field("field", &self.field)
            .field("kind", &self.debouncer.kind())
            .field("state", &self.debouncer.state())
            .field("report_measurement", &self.report_measurement)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct DeviceContext {
    pub channels: Vec<ChannelContext>,
    /// Logical states of the last successful publish; `None` until the
    /// first one succeeds
    pub last_published_state: Option<BTreeMap<String, bool>>,
    pub link_state: LinkState,
}

impl DeviceContext {
    pub fn new(channels: Vec<ChannelContext>) -> Self {
        Self {
            channels,
            last_published_state: None,
            link_state: LinkState::Disconnected,
        }
    }

    /// Feeds a sample into channel `index`. Returns the new logical state on
    /// a transition.
    pub fn apply(&mut self, index: usize, reading: RawReading, now: Instant) -> Option<bool> {
        let channel = self.channels.get_mut(index)?;
        let transition = channel.debouncer.update(reading, now);
        if let Some(state) = transition {
            info!("{} changed to {}", channel.field, state);
        }
        transition
    }

    pub fn logical_states(&self) -> BTreeMap<String, bool> {
        self.channels
            .iter()
            .map(|c| (c.field.clone(), c.logical_state()))
            .collect()
    }

    /// First valid measurement among channels that report one.
    pub fn measurement(&self) -> Option<f32> {
        self.channels
            .iter()
            .filter(|c| c.report_measurement)
            .find_map(|c| c.debouncer.last_measurement())
    }

    pub fn has_unpublished_change(&self) -> bool {
        self.last_published_state.as_ref() != Some(&self.logical_states())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::debounce::{DwellTimer, HysteresisBand};
    use std::time::Duration;

    fn context() -> DeviceContext {
        DeviceContext::new(vec![
            ChannelContext::new("suction_on", Box::new(DwellTimer::new(Duration::ZERO, false))),
            ChannelContext::new(
                "motion",
                Box::new(HysteresisBand::new(10.0, 12.0, false).unwrap()),
            )
            .reporting_measurement(),
        ])
    }

    #[test]
    fn logical_states_are_keyed_by_field() {
        let t0 = Instant::now();
        let mut ctx = context();
        assert_eq!(ctx.apply(0, RawReading::Level(true), t0), Some(true));
        assert_eq!(ctx.apply(1, RawReading::Metric(20.0), t0), None);
        assert_eq!(ctx.apply(7, RawReading::Level(true), t0), None);

        let states = ctx.logical_states();
        assert_eq!(states.get("suction_on"), Some(&true));
        assert_eq!(states.get("motion"), Some(&false));
        assert_eq!(ctx.measurement(), Some(20.0));
    }

    #[test]
    fn unpublished_change_tracks_last_published_state() {
        let t0 = Instant::now();
        let mut ctx = context();
        assert!(ctx.has_unpublished_change());

        ctx.last_published_state = Some(ctx.logical_states());
        assert!(!ctx.has_unpublished_change());

        ctx.apply(1, RawReading::Metric(4.0), t0);
        assert!(ctx.has_unpublished_change());
    }
}
