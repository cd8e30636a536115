//! State ingestor with statum lifecycle
//!
//! Subscribes to every room's state topic and feeds each message through the
//! [`TopicRouter`], one at a time, on a single tokio task.
//!
//! # State Machine
//!
//! ```text
//! Configured ──► Running ──► Stopped
//! ```
//!
//! The subscription is (re)issued on every CONNACK, so a broker restart or a
//! network outage does not leave the ingestor connected but deaf. rumqttc
//! reconnects on the next poll after an error; the ingestor only paces it.

use super::router::{RouteError, RouteOutcome, TopicRouter};
use crate::config::{BackendConfig, BrokerConfig};
use crate::transport::mqtt::{broker_options, disconnect_gracefully, qos_from_level};
use rumqttc::{AsyncClient, ConnectionError, Event, Packet};
use serde::Serialize;
use statum::{machine, state};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the request queue between client and event loop.
const REQUEST_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Ingestor task failed: {0}")]
    Join(String),

    #[error("Ingestor was already stopped")]
    AlreadyStopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub received: u64,
    pub applied: u64,
    pub dropped: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestorSettings {
    pub broker: BrokerConfig,
    pub client_id: String,
    pub topic_filter: String,
    pub reconnect_delay: Duration,
}

impl IngestorSettings {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            broker: config.broker.clone(),
            client_id: config.client_id.clone(),
            topic_filter: config.topic_filter(),
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum IngestorState {
    Configured, // Settings and router in place, not connected
    Running,    // Subscribed and delivering messages
    Stopped,    // Disconnected, stats final
}

#[machine]
pub struct Ingestor<S: IngestorState> {
    settings: IngestorSettings,
    router: TopicRouter,
    stats: IngestStats,
}

impl<S: IngestorState> Ingestor<S> {
    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    pub fn topic_filter(&self) -> &str {
        &self.settings.topic_filter
    }
}

impl Ingestor<Configured> {
    pub fn create(settings: IngestorSettings, router: TopicRouter) -> Self {
        info!(
            "Configuring ingestor {} for {}",
            settings.client_id, settings.topic_filter
        );
        Self::new(settings, router, IngestStats::default())
    }

    pub fn start(self) -> Ingestor<Running> {
        info!("Starting ingestor: {}", self.settings.client_id);
        self.transition()
    }
}

enum Step {
    Stop,
    Event(Result<Event, ConnectionError>),
}

impl Ingestor<Running> {
    /// Routes one delivery and accounts for it. Store failures are logged and
    /// the message is dropped; ingestion continues.
    pub async fn handle_message(&mut self, topic: &str, payload: &[u8]) -> Result<RouteOutcome, RouteError> {
        self.stats.received += 1;
        match self.router.route(topic, payload).await {
            Ok(outcome) => {
                match &outcome {
                    RouteOutcome::Applied { room, suction, .. } => {
                        self.stats.applied += 1;
                        debug!("Applied {} -> {:?}", room, suction);
                    }
                    RouteOutcome::Dropped(reason) => {
                        self.stats.dropped += 1;
                        debug!("Dropped message on {}: {}", topic, reason);
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                self.stats.failed += 1;
                error!("Failed to store message from {}: {}", topic, e);
                Err(e)
            }
        }
    }

    /// Delivery loop. Runs until the shutdown signal fires or its sender is
    /// dropped, then disconnects.
    pub async fn run_until_shutdown(
        mut self,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> Ingestor<Stopped> {
        let options = broker_options(&self.settings.broker, &self.settings.client_id);
        let qos = qos_from_level(self.settings.broker.qos);
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        info!(
            "Ingestor connecting to {}:{}",
            self.settings.broker.host, self.settings.broker.port
        );

        loop {
            let step = tokio::select! {
                _ = &mut shutdown_rx => Step::Stop,
                event = eventloop.poll() => Step::Event(event),
            };

            match step {
                Step::Stop => {
                    info!("Shutdown signal received for ingestor");
                    break;
                }
                Step::Event(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    info!(
                        "Connected ({:?}), subscribing to {}",
                        ack.code, self.settings.topic_filter
                    );
                    if let Err(e) = client.try_subscribe(self.settings.topic_filter.clone(), qos) {
                        error!("Failed to queue subscription: {}", e);
                    }
                }
                Step::Event(Ok(Event::Incoming(Packet::SubAck(ack)))) => {
                    debug!("Subscription acknowledged: {:?}", ack.return_codes);
                }
                Step::Event(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    let _ = self.handle_message(&publish.topic, &publish.payload).await;
                }
                Step::Event(Ok(_)) => {}
                Step::Event(Err(e)) => {
                    warn!(
                        "Broker connection error: {}; retrying in {:?}",
                        e, self.settings.reconnect_delay
                    );
                    let stop = tokio::select! {
                        _ = &mut shutdown_rx => true,
                        _ = tokio::time::sleep(self.settings.reconnect_delay) => false,
                    };
                    if stop {
                        info!("Shutdown signal received for ingestor");
                        break;
                    }
                }
            }
        }

        disconnect_gracefully(&client, &mut eventloop).await;
        info!("Ingestor stopped: {:?}", self.stats);
        self.transition()
    }
}

impl Ingestor<Stopped> {
    pub fn into_router(self) -> TopicRouter {
        self.router
    }
}

/// Handle for an ingestor running in a tokio task.
#[derive(Debug)]
pub struct IngestorHandle {
    pub topic_filter: String,

    task_handle: Option<JoinHandle<IngestStats>>,

    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl IngestorHandle {
    pub fn spawn(settings: IngestorSettings, router: TopicRouter) -> Self {
        let topic_filter = settings.topic_filter.clone();
        let running = Ingestor::create(settings, router).start();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task_handle = tokio::spawn(async move {
            let stopped = running.run_until_shutdown(shutdown_rx).await;
            stopped.stats()
        });

        Self {
            topic_filter,
            task_handle: Some(task_handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Signals the task, waits for it to disconnect and returns its stats.
    pub async fn shutdown(&mut self) -> Result<IngestStats, IngestError> {
        let task_handle = self.task_handle.take().ok_or(IngestError::AlreadyStopped)?;
        if let Some(tx) = self.shutdown_tx.take() {
            debug!("Sending shutdown signal to ingestor");
            let _ = tx.send(());
        }
        task_handle
            .await
            .map_err(|e| IngestError::Join(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::router::AbsentFieldPolicy;
    use crate::store::StateStore;
    use std::sync::Arc;

    fn settings() -> IngestorSettings {
        IngestorSettings {
            broker: BrokerConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
                ..BrokerConfig::default()
            },
            client_id: "suction-ingestor-test".to_string(),
            topic_filter: "suction/+/state".to_string(),
            reconnect_delay: Duration::from_millis(100),
        }
    }

    fn router() -> TopicRouter {
        TopicRouter::new(Arc::new(StateStore::in_memory()), AbsentFieldPolicy::DefaultFalse)
    }

    #[tokio::test]
    async fn messages_are_counted_by_outcome() {
        let mut ingestor = Ingestor::create(settings(), router()).start();

        ingestor
            .handle_message("suction/OR-7/state", br#"{"suction_on":true,"motion":false}"#)
            .await
            .unwrap();
        ingestor.handle_message("suction/bad", b"{}").await.unwrap();
        ingestor
            .handle_message("suction/OR-1/state", br#"{"suction_on":false}"#)
            .await
            .unwrap();

        assert_eq!(
            ingestor.stats(),
            IngestStats {
                received: 3,
                applied: 2,
                dropped: 1,
                failed: 0,
            }
        );
    }

    #[tokio::test]
    async fn handle_shuts_down_while_broker_is_unreachable() {
        let mut handle = IngestorHandle::spawn(settings(), router());
        assert_eq!(handle.topic_filter, "suction/+/state");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_running());

        let stats = handle.shutdown().await.unwrap();
        assert_eq!(stats, IngestStats::default());
        assert!(matches!(handle.shutdown().await, Err(IngestError::AlreadyStopped)));
    }
}
