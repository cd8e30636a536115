use super::{PubSubSession, TransportError, WillMessage};
use crate::config::BrokerConfig;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Capacity of the request queue between client and event loop.
const REQUEST_CAPACITY: usize = 32;

/// How long a clean close waits for the DISCONNECT to leave the socket.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Broker options shared by the edge session and the backend ingestor.
pub fn broker_options(broker: &BrokerConfig, client_id: &str) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, broker.host.clone(), broker.port);
    options.set_keep_alive(broker.keep_alive()).set_clean_session(true);
    if let (Some(user), Some(password)) = (&broker.username, &broker.password) {
        options.set_credentials(user.clone(), password.clone());
    }
    options
}

/// Polls until the broker acknowledges the connection.
pub async fn await_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::ConnAck(ack)) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(TransportError::ConnectFailed(format!("{:?}", ack.code)))
                };
            }
            other => debug!("Ignoring {:?} while connecting", other),
        }
    }
}

/// Sends DISCONNECT and drives the event loop until it is on the wire.
pub async fn disconnect_gracefully(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.try_disconnect() {
        debug!("Disconnect request not queued: {}", e);
        return;
    }
    let drained = timeout(CLOSE_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if drained.is_err() {
        debug!("Disconnect did not flush within {:?}", CLOSE_GRACE);
    }
}

/// MQTT session for the edge device.
///
/// Every [`open`](PubSubSession::open) builds a fresh client so the last-will
/// is registered on each new connection. The event loop is only polled while
/// the session is open; after a connection error the supervisor decides when
/// to reconnect instead of rumqttc retrying on its own.
pub struct MqttSession {
    broker: BrokerConfig,
    client_id: String,
    qos: QoS,
    client: Option<AsyncClient>,
    eventloop: Option<EventLoop>,
    open: bool,
}

impl MqttSession {
    pub fn new(broker: BrokerConfig, client_id: impl Into<String>) -> Self {
        let qos = qos_from_level(broker.qos);
        Self {
            broker,
            client_id: client_id.into(),
            qos,
            client: None,
            eventloop: None,
            open: false,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl PubSubSession for MqttSession {
    async fn open(&mut self, will: &WillMessage) -> Result<(), TransportError> {
        self.close().await;

        let mut options = broker_options(&self.broker, &self.client_id);
        options.set_last_will(LastWill::new(
            will.topic.clone(),
            will.payload.clone(),
            self.qos,
            will.retain,
        ));

        info!(
            "Connecting to {}:{} as {}",
            self.broker.host, self.broker.port, self.client_id
        );
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let connect_timeout = self.broker.connect_timeout();
        match timeout(connect_timeout, await_connack(&mut eventloop)).await {
            Ok(Ok(())) => {
                info!("Broker session established");
                self.client = Some(client);
                self.eventloop = Some(eventloop);
                self.open = true;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Timeout(connect_timeout)),
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), TransportError> {
        let client = match (&self.client, self.open) {
            (Some(client), true) => client,
            _ => return Err(TransportError::NotConnected),
        };
        client.try_publish(topic, self.qos, retain, payload)?;
        Ok(())
    }

    async fn service(&mut self, window: Duration) {
        if !self.open {
            return;
        }
        let Some(eventloop) = self.eventloop.as_mut() else {
            return;
        };

        let deadline = Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, eventloop.poll()).await {
                Err(_) => break,
                Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                    warn!("Broker closed the session");
                    self.open = false;
                    break;
                }
                Ok(Ok(event)) => debug!("MQTT event: {:?}", event),
                Ok(Err(e)) => {
                    warn!("Broker session lost: {}", e);
                    self.open = false;
                    break;
                }
            }
        }
    }

    async fn close(&mut self) {
        self.open = false;
        let client = self.client.take();
        let eventloop = self.eventloop.take();
        if let (Some(client), Some(mut eventloop)) = (client, eventloop) {
            disconnect_gracefully(&client, &mut eventloop).await;
            debug!("Broker session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_levels_map_to_rumqttc() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
    }

    #[test]
    fn broker_options_carry_keep_alive_and_credentials() {
        let broker = BrokerConfig {
            username: Some("edge".to_string()),
            password: Some("secret".to_string()),
            keep_alive_secs: 15,
            ..BrokerConfig::default()
        };
        let options = broker_options(&broker, "esp32_dev1");
        assert_eq!(options.client_id(), "esp32_dev1");
        assert_eq!(options.keep_alive(), Duration::from_secs(15));
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert!(options.clean_session());
    }

    #[tokio::test]
    async fn publish_before_open_is_rejected() {
        let mut session = MqttSession::new(BrokerConfig::default(), "esp32_dev1");
        assert!(!session.is_open());
        assert!(matches!(
            session.publish("suction/OR-1/state", b"{}".to_vec(), true).await,
            Err(TransportError::NotConnected)
        ));
        // servicing a closed session returns immediately
        session.service(Duration::from_secs(5)).await;
    }
}
