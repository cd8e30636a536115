use super::context::{DeviceContext, LinkState};
use crate::messages::StatePayload;
use crate::transport::{PubSubSession, TransportError};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to encode state payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to publish state: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// Logical states match the last successful publish
    Unchanged,
    /// A change is pending but the device is not associated
    Deferred,
    Published(StatePayload),
}

/// Publishes the device's logical state whenever it differs from the last
/// state that was successfully published.
#[derive(Debug, Clone)]
pub struct ChangePublisher {
    topic: String,
}

impl ChangePublisher {
    pub fn new(topic: impl Into<String>) -> Self {
        Self { topic: topic.into() }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// `last_published_state` only moves forward on a successful publish, so
    /// a failed attempt is retried on the next call with whatever the state
    /// is by then. The supervisor clears it on every new association.
    pub async fn evaluate<S: PubSubSession>(
        &self,
        ctx: &mut DeviceContext,
        session: &mut S,
    ) -> Result<PublishOutcome, PublishError> {
        if !ctx.has_unpublished_change() {
            return Ok(PublishOutcome::Unchanged);
        }
        if ctx.link_state != LinkState::Associated {
            debug!("State change pending while {}", ctx.link_state);
            return Ok(PublishOutcome::Deferred);
        }

        let states = ctx.logical_states();
        let payload = StatePayload::new(states.clone(), ctx.measurement());
        let bytes = payload.to_bytes()?;

        if let Err(e) = session.publish(&self.topic, bytes, true).await {
            warn!("Publish to {} failed, will retry: {}", self.topic, e);
            return Err(e.into());
        }

        info!("Published {:?} to {}", states, self.topic);
        ctx.last_published_state = Some(states);
        Ok(PublishOutcome::Published(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::context::ChannelContext;
    use crate::edge::debounce::{DwellTimer, HysteresisBand, RawReading};
    use crate::transport::loopback::Loopback;
    use crate::transport::WillMessage;
    use std::time::{Duration, Instant};

    const TOPIC: &str = "suction/OR-7/state";

    fn associated_context() -> DeviceContext {
        let mut ctx = DeviceContext::new(vec![ChannelContext::new(
            "suction_on",
            Box::new(DwellTimer::new(Duration::ZERO, false)),
        )]);
        ctx.link_state = LinkState::Associated;
        ctx
    }

    async fn open_session(broker: &Loopback) -> crate::transport::loopback::LoopbackSession {
        let mut session = broker.session();
        let will = WillMessage {
            topic: "suction/esp32_dev1/status".to_string(),
            payload: br#"{"status":"offline"}"#.to_vec(),
            retain: true,
        };
        session.open(&will).await.unwrap();
        session
    }

    #[tokio::test]
    async fn first_evaluation_always_publishes() {
        let broker = Loopback::new();
        let mut session = open_session(&broker).await;
        let mut ctx = associated_context();
        let publisher = ChangePublisher::new(TOPIC);

        let outcome = publisher.evaluate(&mut ctx, &mut session).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Published(_)));
        assert_eq!(broker.retained(TOPIC), Some(br#"{"suction_on":false}"#.to_vec()));
    }

    #[tokio::test]
    async fn identical_states_publish_once() {
        let broker = Loopback::new();
        let mut session = open_session(&broker).await;
        let mut ctx = associated_context();
        let publisher = ChangePublisher::new(TOPIC);
        let t0 = Instant::now();

        for i in 0..10 {
            ctx.apply(0, RawReading::Level(true), t0 + Duration::from_millis(i));
            publisher.evaluate(&mut ctx, &mut session).await.unwrap();
        }
        assert_eq!(broker.published_to(TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn each_alternation_publishes_once() {
        let broker = Loopback::new();
        let mut session = open_session(&broker).await;
        let mut ctx = associated_context();
        ctx.last_published_state = Some(ctx.logical_states());
        let publisher = ChangePublisher::new(TOPIC);
        let t0 = Instant::now();

        for i in 0..6u64 {
            let level = i % 2 == 0;
            ctx.apply(0, RawReading::Level(level), t0 + Duration::from_millis(i));
            publisher.evaluate(&mut ctx, &mut session).await.unwrap();
            // Re-evaluating without a change is a no-op
            assert_eq!(
                publisher.evaluate(&mut ctx, &mut session).await.unwrap(),
                PublishOutcome::Unchanged
            );
        }

        let payloads: Vec<_> = broker
            .published_to(TOPIC)
            .iter()
            .map(|m| m.payload_str().to_string())
            .collect();
        assert_eq!(payloads.len(), 6);
        assert_eq!(payloads[0], r#"{"suction_on":true}"#);
        assert_eq!(payloads[1], r#"{"suction_on":false}"#);
    }

    #[tokio::test]
    async fn failed_publish_is_retried_next_cycle() {
        let broker = Loopback::new();
        let mut session = open_session(&broker).await;
        let mut ctx = associated_context();
        let publisher = ChangePublisher::new(TOPIC);

        broker.set_fail_publishes(true);
        assert!(publisher.evaluate(&mut ctx, &mut session).await.is_err());
        assert_eq!(ctx.last_published_state, None);

        broker.set_fail_publishes(false);
        let outcome = publisher.evaluate(&mut ctx, &mut session).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Published(_)));
        assert!(ctx.last_published_state.is_some());
    }

    #[tokio::test]
    async fn changes_are_deferred_until_associated() {
        let broker = Loopback::new();
        let mut session = open_session(&broker).await;
        let mut ctx = associated_context();
        ctx.link_state = LinkState::LinkUp;
        let publisher = ChangePublisher::new(TOPIC);

        assert_eq!(
            publisher.evaluate(&mut ctx, &mut session).await.unwrap(),
            PublishOutcome::Deferred
        );
        assert!(broker.published_to(TOPIC).is_empty());
    }

    #[tokio::test]
    async fn distance_is_reported_only_when_valid() {
        let broker = Loopback::new();
        let mut session = open_session(&broker).await;
        let mut ctx = DeviceContext::new(vec![ChannelContext::new(
            "motion",
            Box::new(HysteresisBand::new(10.0, 12.0, false).unwrap()),
        )
        .reporting_measurement()]);
        ctx.link_state = LinkState::Associated;
        let publisher = ChangePublisher::new(TOPIC);
        let t0 = Instant::now();

        ctx.apply(0, RawReading::Metric(8.44), t0);
        publisher.evaluate(&mut ctx, &mut session).await.unwrap();
        assert_eq!(
            broker.retained(TOPIC),
            Some(br#"{"motion":true,"distance_cm":8.4}"#.to_vec())
        );
    }
}
