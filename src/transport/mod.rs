//! # Transport Seams
//!
//! The edge agent talks to the network through two small traits so the
//! connect/publish discipline can be exercised without a broker or radio:
//!
//! ```text
//! transport/
//! ├── link.rs      - NetworkLink for a Linux host (sysfs operstate)
//! ├── mqtt.rs      - PubSubSession over rumqttc, plus broker options shared with the ingestor
//! └── loopback.rs  - In-process session and link, used for dry runs and tests
//! ```
//!
//! A session is opened with a [`WillMessage`] that the broker publishes on the
//! device's behalf if the session dies uncleanly. Publishing never blocks on
//! the network: messages are queued and flushed by [`PubSubSession::service`],
//! which the agent calls once per loop iteration with a bounded window.

pub mod link;
pub mod loopback;
pub mod mqtt;

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Network link down: {0}")]
    LinkDown(String),

    #[error("Broker refused or dropped the connection: {0}")]
    ConnectFailed(String),

    #[error("Session is not open")]
    NotConnected,

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
}

/// Message the broker delivers for a client whose session ends uncleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Physical or OS-level network link (Wi-Fi association, interface state).
#[allow(async_fn_in_trait)]
pub trait NetworkLink {
    /// Current liveness of the link.
    async fn check(&mut self) -> bool;

    /// Attempts to bring the link up. Callers bound this with a timeout.
    async fn establish(&mut self) -> Result<(), TransportError>;
}

/// Broker session with last-will registration and retained publishing.
#[allow(async_fn_in_trait)]
pub trait PubSubSession {
    /// Opens a fresh session, registering `will`. Any previous session is
    /// discarded first.
    async fn open(&mut self, will: &WillMessage) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Queues a message. Fails without side effects when the session is
    /// closed or the outgoing queue is full.
    async fn publish(&mut self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), TransportError>;

    /// Drives network I/O for at most `window`, updating liveness.
    async fn service(&mut self, window: Duration);

    /// Ends the session cleanly; the broker discards the will.
    async fn close(&mut self);
}
