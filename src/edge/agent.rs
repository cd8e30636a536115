//! Device agent loop
//!
//! One cooperative loop per device. Each tick:
//!
//! ```text
//! service session I/O (bounded) ──► maintain connectivity ──► sample channels ──► evaluate publisher
//! ```
//!
//! A failed startup is logged and the loop keeps sampling; the supervisor
//! keeps retrying in `maintain` and the pending state is published once the
//! device is associated again.

use super::context::{ChannelContext, DeviceContext, LinkState};
use super::debounce::DebounceError;
use super::publisher::{ChangePublisher, PublishOutcome};
use super::source::{build_source, MetricSource, SourceError};
use super::supervisor::{ConnectivitySupervisor, SupervisorSettings};
use crate::config::{ChannelConfig, EdgeConfig};
use crate::transport::{NetworkLink, PubSubSession};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Unable to open source for channel '{field}': {source}")]
    Source { field: String, source: SourceError },

    #[error("Invalid debounce settings for channel '{field}': {source}")]
    Debounce { field: String, source: DebounceError },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentStats {
    pub ticks: u64,
    pub transitions: u64,
    pub publishes: u64,
    pub deferred: u64,
    pub failed_publishes: u64,
}

pub struct DeviceAgent<L, S> {
    ctx: DeviceContext,
    sources: Vec<Box<dyn MetricSource>>,
    supervisor: ConnectivitySupervisor,
    publisher: ChangePublisher,
    link: L,
    session: S,
    sample_interval: Duration,
    service_window: Duration,
    stats: AgentStats,
}

impl<L, S> DeviceAgent<L, S>
where
    L: NetworkLink,
    S: PubSubSession,
{
    pub fn new(link: L, session: S, supervisor: ConnectivitySupervisor, publisher: ChangePublisher) -> Self {
        Self {
            ctx: DeviceContext::default(),
            sources: Vec::new(),
            supervisor,
            publisher,
            link,
            session,
            sample_interval: Duration::from_millis(100),
            service_window: Duration::from_millis(20),
            stats: AgentStats::default(),
        }
    }

    /// Builds the agent from configuration, opening every channel's source.
    pub fn from_config(config: &EdgeConfig, link: L, session: S) -> Result<Self, AgentError> {
        Self::from_config_with(config, link, session, |channel| build_source(&channel.source))
    }

    /// Like [`from_config`](Self::from_config) with a caller-supplied source
    /// factory.
    pub fn from_config_with<F>(config: &EdgeConfig, link: L, session: S, mut open_source: F) -> Result<Self, AgentError>
    where
        F: FnMut(&ChannelConfig) -> Result<Box<dyn MetricSource>, SourceError>,
    {
        let settings = SupervisorSettings::from_config(&config.supervisor, &config.broker);
        let supervisor = ConnectivitySupervisor::new(settings, config.status_topic());
        let publisher = ChangePublisher::new(config.state_topic());

        let mut agent = Self::new(link, session, supervisor, publisher)
            .with_sample_interval(config.sample_interval())
            .with_service_window(Duration::from_millis(config.supervisor.service_window_ms));

        for channel in &config.channels {
            let debouncer = channel
                .debounce
                .create_debouncer(channel.initial_state)
                .map_err(|source| AgentError::Debounce {
                    field: channel.field.clone(),
                    source,
                })?;
            let source = open_source(channel).map_err(|source| AgentError::Source {
                field: channel.field.clone(),
                source,
            })?;

            let mut context = ChannelContext::new(channel.field.clone(), debouncer);
            if channel.report_distance {
                context = context.reporting_measurement();
            }
            info!(
                "Channel {}: {} debounce on {}",
                channel.field,
                channel.debounce.kind(),
                source.describe()
            );
            agent.add_channel(context, source);
        }
        Ok(agent)
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn with_service_window(mut self, window: Duration) -> Self {
        self.service_window = window;
        self
    }

    pub fn add_channel(&mut self, channel: ChannelContext, source: Box<dyn MetricSource>) {
        self.ctx.channels.push(channel);
        self.sources.push(source);
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn stats(&self) -> AgentStats {
        self.stats
    }

    /// Bounded startup. Failure is not fatal to the caller's loop.
    pub async fn start(&mut self) -> bool {
        match self
            .supervisor
            .start(&mut self.ctx, &mut self.link, &mut self.session)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("{}; sampling continues while reconnecting", e);
                false
            }
        }
    }

    /// One loop iteration.
    pub async fn tick(&mut self, now: Instant) {
        self.session.service(self.service_window).await;

        let link_state = self
            .supervisor
            .maintain(&mut self.ctx, &mut self.link, &mut self.session, now)
            .await;

        let sampled_at = now.into_std();
        for (index, source) in self.sources.iter_mut().enumerate() {
            let reading = source.read();
            if self.ctx.apply(index, reading, sampled_at).is_some() {
                self.stats.transitions += 1;
            }
        }

        match self.publisher.evaluate(&mut self.ctx, &mut self.session).await {
            Ok(PublishOutcome::Published(_)) => self.stats.publishes += 1,
            Ok(PublishOutcome::Deferred) => {
                self.stats.deferred += 1;
                debug!("Publish deferred, link state {}", link_state);
            }
            Ok(PublishOutcome::Unchanged) => {}
            Err(_) => self.stats.failed_publishes += 1,
        }
        self.stats.ticks += 1;
    }

    /// Runs until `cancel` fires, then announces offline and closes the
    /// session.
    pub async fn run(mut self, cancel: CancellationToken) -> AgentStats {
        info!(
            "Device agent starting: {} channels, sampling every {:?}",
            self.sources.len(),
            self.sample_interval
        );

        let started = tokio::select! {
            started = self.start() => Some(started),
            _ = cancel.cancelled() => None,
        };

        if started.is_some() {
            let mut interval = tokio::time::interval(self.sample_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Stop requested");
                        break;
                    }
                    now = interval.tick() => self.tick(now).await,
                }
            }
        }

        if self.ctx.link_state == LinkState::Associated && self.ctx.has_unpublished_change() {
            warn!("Stopping with an unpublished state change");
        }
        self.supervisor.shutdown(&mut self.ctx, &mut self.session).await;
        info!("Device agent stopped: {:?}", self.stats);
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::debounce::{DwellTimer, RawReading};
    use crate::edge::source::FnSource;
    use crate::transport::loopback::{Loopback, LoopbackLink, LoopbackSession};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    const STATE: &str = "suction/OR-7/state";
    const STATUS: &str = "suction/esp32_dev1/status";

    fn agent(broker: &Loopback, level: Arc<AtomicBool>, attempts: u32) -> DeviceAgent<LoopbackLink, LoopbackSession> {
        let settings = SupervisorSettings {
            startup_attempts: attempts,
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(1),
            connect_timeout: Duration::from_millis(100),
            flush_window: Duration::from_millis(1),
        };
        let mut agent = DeviceAgent::new(
            broker.link(),
            broker.session(),
            ConnectivitySupervisor::new(settings, STATUS),
            ChangePublisher::new(STATE),
        )
        .with_sample_interval(Duration::from_millis(5));
        agent.add_channel(
            ChannelContext::new("suction_on", Box::new(DwellTimer::new(Duration::ZERO, false))),
            Box::new(FnSource(move || RawReading::Level(level.load(Ordering::SeqCst)))),
        );
        agent
    }

    fn state_payloads(broker: &Loopback) -> Vec<String> {
        broker
            .published_to(STATE)
            .iter()
            .map(|m| m.payload_str().to_string())
            .collect()
    }

    #[tokio::test]
    async fn changes_during_outage_collapse_to_latest_value() {
        let broker = Loopback::new();
        let level = Arc::new(AtomicBool::new(false));
        let mut agent = agent(&broker, level.clone(), 1);
        let t0 = Instant::now();
        let at = |ms: u64| t0 + Duration::from_millis(ms);

        assert!(agent.start().await);
        agent.tick(at(0)).await;
        assert_eq!(state_payloads(&broker), vec![r#"{"suction_on":false}"#]);

        broker.set_broker_up(false);
        for (i, raw) in [true, false, true].into_iter().enumerate() {
            level.store(raw, Ordering::SeqCst);
            agent.tick(at(100 * (i as u64 + 1))).await;
        }
        assert_eq!(agent.context().link_state, LinkState::LinkUp);
        assert_eq!(agent.stats().transitions, 3);
        assert_eq!(state_payloads(&broker).len(), 1);

        broker.set_broker_up(true);
        agent.tick(at(1000)).await;
        agent.tick(at(1100)).await;

        assert_eq!(agent.context().link_state, LinkState::Associated);
        assert_eq!(
            state_payloads(&broker),
            vec![r#"{"suction_on":false}"#, r#"{"suction_on":true}"#]
        );
        assert_eq!(broker.retained(STATUS), Some(br#"{"status":"online"}"#.to_vec()));
    }

    #[tokio::test]
    async fn publish_lost_with_the_session_is_repeated_after_reconnect() {
        let broker = Loopback::new();
        broker.set_queue_publishes(true);
        let level = Arc::new(AtomicBool::new(false));
        let mut agent = agent(&broker, level.clone(), 1);
        let t0 = Instant::now();
        let at = |ms: u64| t0 + Duration::from_millis(ms);

        assert!(agent.start().await);
        agent.tick(at(0)).await;
        level.store(true, Ordering::SeqCst);
        agent.tick(at(100)).await;
        assert_eq!(agent.stats().publishes, 2);
        assert_eq!(broker.queued(), 1);

        // The link dies before the queued state ever leaves the device
        broker.set_broker_up(false);
        agent.tick(at(200)).await;
        assert_eq!(state_payloads(&broker), vec![r#"{"suction_on":false}"#]);

        broker.set_broker_up(true);
        agent.tick(at(300)).await;
        agent.tick(at(400)).await;

        assert_eq!(agent.context().link_state, LinkState::Associated);
        assert_eq!(
            state_payloads(&broker),
            vec![r#"{"suction_on":false}"#, r#"{"suction_on":true}"#]
        );
        assert_eq!(broker.retained(STATE), Some(br#"{"suction_on":true}"#.to_vec()));
        assert_eq!(broker.retained(STATUS), Some(br#"{"status":"online"}"#.to_vec()));
    }

    #[tokio::test]
    async fn run_publishes_then_goes_offline_on_cancel() {
        let broker = Loopback::new();
        let level = Arc::new(AtomicBool::new(true));
        let agent = agent(&broker, level, 3);
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.cancel();
        });
        let stats = agent.run(cancel).await;

        assert!(stats.ticks > 0);
        assert_eq!(stats.publishes, 1);
        assert_eq!(broker.retained(STATE), Some(br#"{"suction_on":true}"#.to_vec()));
        assert_eq!(broker.retained(STATUS), Some(br#"{"status":"offline"}"#.to_vec()));
    }

    #[tokio::test]
    async fn failed_startup_keeps_sampling_and_publishes_once_reachable() {
        let broker = Loopback::new();
        broker.set_broker_up(false);
        let level = Arc::new(AtomicBool::new(true));
        let mut agent = agent(&broker, level, 2);
        let t0 = Instant::now();

        assert!(!agent.start().await);
        agent.tick(t0 + Duration::from_millis(100)).await;
        assert_eq!(agent.context().logical_states().get("suction_on"), Some(&true));
        assert_eq!(agent.stats().deferred, 1);

        broker.set_broker_up(true);
        agent.tick(t0 + Duration::from_millis(200)).await;
        assert_eq!(agent.stats().publishes, 1);
        assert_eq!(broker.retained(STATE), Some(br#"{"suction_on":true}"#.to_vec()));
    }
}
