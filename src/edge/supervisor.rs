//! Connectivity supervisor
//!
//! Owns the `Disconnected → LinkUp → Associated` progression. Startup makes a
//! bounded number of attempts; at runtime every loop iteration re-checks the
//! link and the session and, once the backoff deadline has passed, makes one
//! bounded re-establishment attempt. Nothing here blocks the sampling loop for
//! longer than a couple of `connect_timeout`s.

use super::context::{DeviceContext, LinkState};
use crate::config::{BrokerConfig, SupervisorConfig};
use crate::messages::StatusMessage;
use crate::transport::{NetworkLink, PubSubSession, TransportError, WillMessage};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Connectivity not established after {attempts} attempts: {last_error}")]
    StartupExhausted { attempts: u32, last_error: String },
}

/// Exponential backoff between establishment attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    next_attempt_at: Option<Instant>,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            next_attempt_at: None,
            failures: 0,
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.next_attempt_at.map_or(true, |at| now >= at)
    }

    /// Schedules the next attempt and returns the delay until it.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        let delay = self.current;
        self.next_attempt_at = Some(now + delay);
        self.current = (self.current * 2).min(self.max);
        self.failures += 1;
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.next_attempt_at = None;
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    pub startup_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Bound on each establishment step
    pub connect_timeout: Duration,
    /// I/O window used to flush the offline status on shutdown
    pub flush_window: Duration,
}

impl SupervisorSettings {
    pub fn from_config(supervisor: &SupervisorConfig, broker: &BrokerConfig) -> Self {
        Self {
            startup_attempts: supervisor.startup_attempts.max(1),
            backoff_initial: Duration::from_millis(supervisor.backoff_initial_ms),
            backoff_max: Duration::from_millis(supervisor.backoff_max_ms),
            connect_timeout: broker.connect_timeout(),
            flush_window: Duration::from_millis(supervisor.service_window_ms.max(50)),
        }
    }
}

pub struct ConnectivitySupervisor {
    settings: SupervisorSettings,
    status_topic: String,
    backoff: Backoff,
}

impl ConnectivitySupervisor {
    pub fn new(settings: SupervisorSettings, status_topic: impl Into<String>) -> Self {
        let backoff = Backoff::new(settings.backoff_initial, settings.backoff_max);
        Self {
            settings,
            status_topic: status_topic.into(),
            backoff,
        }
    }

    pub fn status_topic(&self) -> &str {
        &self.status_topic
    }

    /// Retained offline status, registered with every session.
    pub fn will(&self) -> Result<WillMessage, TransportError> {
        Ok(WillMessage {
            topic: self.status_topic.clone(),
            payload: StatusMessage::offline().to_bytes()?,
            retain: true,
        })
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Bounded startup: up to `startup_attempts` establishment attempts with
    /// backoff sleeps in between.
    pub async fn start<L, S>(
        &mut self,
        ctx: &mut DeviceContext,
        link: &mut L,
        session: &mut S,
    ) -> Result<(), SupervisorError>
    where
        L: NetworkLink,
        S: PubSubSession,
    {
        let attempts = self.settings.startup_attempts;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            info!("Establishing connectivity (attempt {}/{})", attempt, attempts);
            match self.establish(ctx, link, session).await {
                Ok(()) => {
                    self.backoff.reset();
                    return Ok(());
                }
                Err(e) => {
                    warn!("Attempt {} failed: {}", attempt, e);
                    last_error = e.to_string();
                    let delay = self.backoff.record_failure(Instant::now());
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        error!("Giving up on startup connectivity after {} attempts", attempts);
        Err(SupervisorError::StartupExhausted {
            attempts,
            last_error,
        })
    }

    /// Re-checks liveness and re-establishes when allowed. Returns the link
    /// state after this iteration.
    pub async fn maintain<L, S>(
        &mut self,
        ctx: &mut DeviceContext,
        link: &mut L,
        session: &mut S,
        now: Instant,
    ) -> LinkState
    where
        L: NetworkLink,
        S: PubSubSession,
    {
        let link_up = link.check().await;
        if link_up && session.is_open() && ctx.link_state == LinkState::Associated {
            return ctx.link_state;
        }

        let observed = if link_up {
            LinkState::LinkUp
        } else {
            LinkState::Disconnected
        };
        if ctx.link_state != observed {
            warn!("Connectivity degraded: {} -> {}", ctx.link_state, observed);
            ctx.link_state = observed;
        }

        if !self.backoff.ready(now) {
            return ctx.link_state;
        }

        match self.establish(ctx, link, session).await {
            Ok(()) => {
                info!("Connectivity restored after {} failed attempts", self.backoff.failures());
                self.backoff.reset();
            }
            Err(e) => {
                let delay = self.backoff.record_failure(now);
                warn!("Re-establishment failed: {}; next attempt in {:?}", e, delay);
            }
        }
        ctx.link_state
    }

    /// Announces offline explicitly and closes the session. The broker only
    /// sends the will on an unclean drop.
    pub async fn shutdown<S: PubSubSession>(&mut self, ctx: &mut DeviceContext, session: &mut S) {
        if session.is_open() {
            let announced = match StatusMessage::offline().to_bytes() {
                Ok(offline) => session.publish(&self.status_topic, offline, true).await,
                Err(e) => Err(e.into()),
            };
            match announced {
                Ok(()) => session.service(self.settings.flush_window).await,
                Err(e) => warn!("Unable to announce offline status: {}", e),
            }
        }
        session.close().await;
        ctx.link_state = LinkState::Disconnected;
        info!("Connectivity shut down");
    }

    async fn establish<L, S>(
        &mut self,
        ctx: &mut DeviceContext,
        link: &mut L,
        session: &mut S,
    ) -> Result<(), TransportError>
    where
        L: NetworkLink,
        S: PubSubSession,
    {
        let step = self.settings.connect_timeout;

        if !link.check().await {
            ctx.link_state = LinkState::Disconnected;
            timeout(step, link.establish())
                .await
                .map_err(|_| TransportError::Timeout(step))??;
        }
        ctx.link_state = LinkState::LinkUp;
        debug!("Link up, opening broker session");

        let will = self.will()?;
        timeout(step, session.open(&will))
            .await
            .map_err(|_| TransportError::Timeout(step))??;

        let online = StatusMessage::online().to_bytes()?;
        if let Err(e) = session.publish(&self.status_topic, online, true).await {
            session.close().await;
            return Err(e);
        }

        // A publish accepted by the previous session may never have reached
        // the broker, so every new session republishes the current state.
        ctx.last_published_state = None;
        ctx.link_state = LinkState::Associated;
        info!("Associated, online status announced on {}", self.status_topic);
        Ok(())
    }
}
