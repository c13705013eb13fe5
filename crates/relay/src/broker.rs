//! Broker transport behind three narrow traits, plus the MQTT implementation.
//!
//! The supervisor only ever talks to a [`Connector`]; a connected
//! [`Session`] is owned by the supervisor alone, and the cloneable
//! [`Publisher`] it hands out is the only thing outbound senders may touch.

use rumqttc::{
    AsyncClient, ClientError, ConnectionError, Event, EventLoop, MqttOptions, NetworkOptions,
    Outgoing, Packet, QoS, SubscribeReasonCode,
};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::BrokerConfig;

/// How long a graceful disconnect may take to flush before giving up.
const DISCONNECT_FLUSH: Duration = Duration::from_secs(2);

/// Capacity of the rumqttc request channel per session.
const REQUEST_CAPACITY: usize = 20;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("client error: {0}")]
    Client(#[from] ClientError),
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("subscription to {0} rejected by broker")]
    SubscribeRejected(String),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed by broker")]
    Closed,
}

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    /// Open a new session. Resolves once the broker has accepted it.
    fn connect(&self) -> impl Future<Output = Result<Self::Session, BrokerError>> + Send;
}

pub trait Session: Send + 'static {
    type Publisher: Publisher;

    fn publisher(&self) -> Self::Publisher;

    /// Subscribe and wait for the broker to confirm.
    fn subscribe(&mut self, channel: &str) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Payload of the next message on a subscribed channel. Also drives
    /// keep-alive, so it must be polled continuously while connected.
    fn next_message(&mut self) -> impl Future<Output = Result<Vec<u8>, BrokerError>> + Send;

    fn disconnect(self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

pub trait Publisher: Clone + Send + Sync + 'static {
    fn publish(
        &self,
        channel: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

// ---------------------------------------------------------------------------
// MQTT (rumqttc)
// ---------------------------------------------------------------------------

pub struct MqttConnector {
    options: MqttOptions,
    transport_timeout: Duration,
}

impl MqttConnector {
    pub fn new(broker: &BrokerConfig, transport_timeout: Duration) -> Self {
        let mut options = MqttOptions::new(&broker.client_id, &broker.host, broker.port);
        options.set_keep_alive(Duration::from_secs(broker.keep_alive_sec));
        if !broker.username.is_empty() {
            options.set_credentials(&broker.username, &broker.password);
        }
        Self {
            options,
            transport_timeout,
        }
    }
}

impl Connector for MqttConnector {
    type Session = MqttSession;

    async fn connect(&self) -> Result<MqttSession, BrokerError> {
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);

        let mut network = NetworkOptions::new();
        network.set_connection_timeout(self.transport_timeout.as_secs().max(1));
        eventloop.set_network_options(network);

        // Refused CONNACKs surface as ConnectionError from poll().
        loop {
            if let Event::Incoming(Packet::ConnAck(ack)) = eventloop.poll().await? {
                debug!(session_present = ack.session_present, "connack received");
                break;
            }
        }

        Ok(MqttSession {
            client,
            eventloop,
            channel: None,
            pending: VecDeque::new(),
        })
    }
}

pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    channel: Option<String>,
    /// Messages that arrived while waiting for a SUBACK.
    pending: VecDeque<Vec<u8>>,
}

impl MqttSession {
    /// Queue the payload of `packet` if it belongs to our channel.
    fn accept(&self, packet: Packet) -> Option<Vec<u8>> {
        match packet {
            Packet::Publish(p) if self.channel.as_deref() == Some(p.topic.as_str()) => {
                Some(p.payload.to_vec())
            }
            _ => None,
        }
    }
}

impl Session for MqttSession {
    type Publisher = MqttPublisher;

    fn publisher(&self) -> MqttPublisher {
        MqttPublisher(self.client.clone())
    }

    async fn subscribe(&mut self, channel: &str) -> Result<(), BrokerError> {
        self.client.subscribe(channel, QoS::AtLeastOnce).await?;
        self.channel = Some(channel.to_string());

        loop {
            match self.eventloop.poll().await? {
                Event::Incoming(Packet::SubAck(ack)) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|c| matches!(c, SubscribeReasonCode::Failure))
                    {
                        return Err(BrokerError::SubscribeRejected(channel.to_string()));
                    }
                    return Ok(());
                }
                Event::Incoming(Packet::Disconnect) => return Err(BrokerError::Closed),
                Event::Incoming(packet) => {
                    if let Some(payload) = self.accept(packet) {
                        self.pending.push_back(payload);
                    }
                }
                Event::Outgoing(_) => {}
            }
        }
    }

    async fn next_message(&mut self) -> Result<Vec<u8>, BrokerError> {
        if let Some(payload) = self.pending.pop_front() {
            return Ok(payload);
        }
        loop {
            match self.eventloop.poll().await? {
                Event::Incoming(Packet::Disconnect) => return Err(BrokerError::Closed),
                Event::Incoming(packet) => {
                    if let Some(payload) = self.accept(packet) {
                        return Ok(payload);
                    }
                }
                Event::Outgoing(_) => {}
            }
        }
    }

    async fn disconnect(mut self) -> Result<(), BrokerError> {
        self.client.disconnect().await?;

        let flush = async {
            loop {
                if let Event::Outgoing(Outgoing::Disconnect) = self.eventloop.poll().await? {
                    return Ok::<(), BrokerError>(());
                }
            }
        };
        tokio::time::timeout(DISCONNECT_FLUSH, flush)
            .await
            .map_err(|_| BrokerError::Timeout(DISCONNECT_FLUSH))?
    }
}

#[derive(Clone)]
pub struct MqttPublisher(AsyncClient);

impl Publisher for MqttPublisher {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.0
            .publish(channel, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn broker_config() -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".into(),
            port: 4222,
            username: "user".into(),
            password: "secret".into(),
            client_id: "test-relay".into(),
            keep_alive_sec: 30,
        }
    }

    #[test]
    fn connector_applies_broker_settings() {
        let connector = MqttConnector::new(&broker_config(), Duration::from_secs(5));
        assert_eq!(
            connector.options.broker_address(),
            ("127.0.0.1".to_string(), 4222)
        );
        assert_eq!(connector.options.client_id(), "test-relay");
        assert_eq!(connector.options.keep_alive(), Duration::from_secs(30));
        assert_eq!(
            connector.options.credentials(),
            Some(("user".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn connector_without_username_is_anonymous() {
        let cfg = BrokerConfig {
            username: String::new(),
            ..broker_config()
        };
        let connector = MqttConnector::new(&cfg, Duration::from_secs(5));
        assert_eq!(connector.options.credentials(), None);
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        // Port 1 on loopback refuses immediately on every sane host.
        let cfg = BrokerConfig {
            port: 1,
            ..broker_config()
        };
        let connector = MqttConnector::new(&cfg, Duration::from_secs(1));
        let result = tokio::time::timeout(Duration::from_secs(5), connector.connect()).await;
        assert!(matches!(result, Ok(Err(BrokerError::Connection(_)))));
    }

    #[tokio::test]
    async fn publisher_enqueues_without_a_running_eventloop() {
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("t", "127.0.0.1", 4222), 10);
        let publisher = MqttPublisher(client);
        publisher
            .publish("nats_dialog", b"{}".to_vec())
            .await
            .unwrap();
    }
}
