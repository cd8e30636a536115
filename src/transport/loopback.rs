//! In-process broker stand-in.
//!
//! A [`Loopback`] owns the shared state; [`LoopbackLink`] and
//! [`LoopbackSession`] are the halves handed to the agent. The owner can take
//! the link or the broker down at any time to simulate outages, and inspect
//! everything that was published, including the last-will when a session is
//! dropped uncleanly.
//!
//! By default a publish reaches the broker immediately. With
//! [`Loopback::set_queue_publishes`] it waits in the session's outgoing
//! queue until the next `service` call, and an unclean drop loses it, the
//! way a real client's request queue behaves.

use super::{NetworkLink, PubSubSession, TransportError, WillMessage};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("<binary>")
    }
}

#[derive(Debug)]
struct LoopbackState {
    link_up: bool,
    broker_up: bool,
    fail_publishes: bool,
    queue_publishes: bool,
    outgoing: Vec<PublishedMessage>,
    open: bool,
    will: Option<WillMessage>,
    published: Vec<PublishedMessage>,
    retained: BTreeMap<String, Vec<u8>>,
    sessions_opened: u32,
}

impl LoopbackState {
    fn deliver(&mut self, message: PublishedMessage) {
        if message.retain {
            self.retained.insert(message.topic.clone(), message.payload.clone());
        }
        self.published.push(message);
    }

    fn drop_uncleanly(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if !self.outgoing.is_empty() {
            warn!("Session dropped with {} queued publishes", self.outgoing.len());
            self.outgoing.clear();
        }
        if let Some(will) = self.will.take() {
            info!("Session dropped, delivering last-will on {}", will.topic);
            self.deliver(PublishedMessage {
                topic: will.topic,
                payload: will.payload,
                retain: will.retain,
            });
        }
    }
}

#[derive(Debug, Clone)]
pub struct Loopback {
    inner: Arc<Mutex<LoopbackState>>,
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new()
    }
}

impl Loopback {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LoopbackState {
                link_up: true,
                broker_up: true,
                fail_publishes: false,
                queue_publishes: false,
                outgoing: Vec::new(),
                open: false,
                will: None,
                published: Vec::new(),
                retained: BTreeMap::new(),
                sessions_opened: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        // A poisoned lock only means a test panicked mid-update; the data is
        // still the best record available.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn link(&self) -> LoopbackLink {
        LoopbackLink {
            shared: self.clone(),
        }
    }

    pub fn session(&self) -> LoopbackSession {
        LoopbackSession {
            shared: self.clone(),
        }
    }

    /// Taking the link down also kills an open session uncleanly.
    pub fn set_link_up(&self, up: bool) {
        let mut state = self.state();
        state.link_up = up;
        if !up {
            state.drop_uncleanly();
        }
    }

    pub fn set_broker_up(&self, up: bool) {
        let mut state = self.state();
        state.broker_up = up;
        if !up {
            state.drop_uncleanly();
        }
    }

    pub fn set_fail_publishes(&self, fail: bool) {
        self.state().fail_publishes = fail;
    }

    pub fn set_queue_publishes(&self, queue: bool) {
        self.state().queue_publishes = queue;
    }

    pub fn queued(&self) -> usize {
        self.state().outgoing.len()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.state()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state().retained.get(topic).cloned()
    }

    pub fn sessions_opened(&self) -> u32 {
        self.state().sessions_opened
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackLink {
    shared: Loopback,
}

impl NetworkLink for LoopbackLink {
    async fn check(&mut self) -> bool {
        self.shared.state().link_up
    }

    async fn establish(&mut self) -> Result<(), TransportError> {
        if self.shared.state().link_up {
            Ok(())
        } else {
            Err(TransportError::LinkDown("loopback".to_string()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackSession {
    shared: Loopback,
}

impl PubSubSession for LoopbackSession {
    async fn open(&mut self, will: &WillMessage) -> Result<(), TransportError> {
        let mut state = self.shared.state();
        if !state.link_up || !state.broker_up {
            return Err(TransportError::ConnectFailed("loopback broker unreachable".to_string()));
        }
        state.open = true;
        state.will = Some(will.clone());
        state.sessions_opened += 1;
        debug!("Loopback session opened (#{})", state.sessions_opened);
        Ok(())
    }

    fn is_open(&self) -> bool {
        let state = self.shared.state();
        state.open && state.link_up && state.broker_up
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), TransportError> {
        let mut state = self.shared.state();
        if !state.open {
            return Err(TransportError::NotConnected);
        }
        if state.fail_publishes {
            warn!("Loopback rejecting publish to {}", topic);
            return Err(TransportError::PublishFailed("loopback configured to fail".to_string()));
        }
        let message = PublishedMessage {
            topic: topic.to_string(),
            payload,
            retain,
        };
        if state.queue_publishes {
            debug!("[loopback] queued {} {}", message.topic, message.payload_str());
            state.outgoing.push(message);
        } else {
            info!("[loopback] {} {}", message.topic, message.payload_str());
            state.deliver(message);
        }
        Ok(())
    }

    async fn service(&mut self, _window: Duration) {
        let mut state = self.shared.state();
        if !state.open {
            return;
        }
        for message in std::mem::take(&mut state.outgoing) {
            info!("[loopback] {} {}", message.topic, message.payload_str());
            state.deliver(message);
        }
    }

    async fn close(&mut self) {
        let mut state = self.shared.state();
        if state.open {
            debug!("Loopback session closed cleanly");
        }
        state.outgoing.clear();
        state.open = false;
        state.will = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn will() -> WillMessage {
        WillMessage {
            topic: "suction/dev1/status".to_string(),
            payload: br#"{"status":"offline"}"#.to_vec(),
            retain: true,
        }
    }

    #[tokio::test]
    async fn unclean_drop_delivers_will_but_clean_close_does_not() {
        let broker = Loopback::new();
        let mut session = broker.session();

        session.open(&will()).await.unwrap();
        broker.set_broker_up(false);
        assert!(!session.is_open());
        assert_eq!(
            broker.retained("suction/dev1/status"),
            Some(br#"{"status":"offline"}"#.to_vec())
        );

        broker.set_broker_up(true);
        session.open(&will()).await.unwrap();
        session.close().await;
        assert_eq!(broker.published().len(), 1);
        assert_eq!(broker.sessions_opened(), 2);
    }

    #[tokio::test]
    async fn queued_publishes_are_lost_on_unclean_drop() {
        let broker = Loopback::new();
        broker.set_queue_publishes(true);
        let mut session = broker.session();

        session.open(&will()).await.unwrap();
        session.publish("suction/OR-1/state", b"{}".to_vec(), true).await.unwrap();
        assert_eq!(broker.queued(), 1);
        session.service(Duration::ZERO).await;
        assert_eq!(broker.published_to("suction/OR-1/state").len(), 1);

        session.publish("suction/OR-1/state", b"{}".to_vec(), true).await.unwrap();
        broker.set_link_up(false);
        session.service(Duration::ZERO).await;
        assert_eq!(broker.queued(), 0);
        assert_eq!(broker.published_to("suction/OR-1/state").len(), 1);
    }

    #[tokio::test]
    async fn publish_requires_open_session() {
        let broker = Loopback::new();
        let mut session = broker.session();
        assert!(matches!(
            session.publish("a/b/state", b"{}".to_vec(), true).await,
            Err(TransportError::NotConnected)
        ));
    }
}
