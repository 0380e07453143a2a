//! MQTT intake: one connection, one topic, events forwarded to the relay.

use std::time::Duration;

use rumqttc::{
    AsyncClient, ClientError, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    SubscribeReasonCode,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::relay::SensorPayload;

/// Depth of the broker → relay event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 10;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connect(#[from] ConnectionError),

    #[error("subscribe request failed: {0}")]
    Subscribe(#[from] ClientError),

    #[error("relay stopped accepting broker events")]
    RelayGone,
}

/// What the subscription reports to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    Subscribed { topic: String },
    SubscribeRejected { topic: String },
    Message(SensorPayload),
    Disconnected { reason: String },
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial: Duration,
    pub max: Duration,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt` (0-based), or `None` if reconnecting is off.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        Some(self.initial.saturating_mul(factor).min(self.max))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub reconnect: ReconnectPolicy,
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>, port: u16, topic: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            topic: topic.into(),
            client_id: format!("sensor-relay-{}", uuid::Uuid::new_v4()),
            reconnect: ReconnectPolicy::disabled(),
        }
    }

    pub fn url(&self) -> String {
        format!("mqtt://{}:{}", self.host, self.port)
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(KEEP_ALIVE);
        options
    }
}

/// Map one event-loop event to what the relay should hear about.
///
/// Publishes are forwarded when their topic matches the configured filter,
/// wildcards included. A SubAck carrying any failure code counts as a
/// rejected subscription.
pub fn translate(event: &Event, topic: &str) -> Option<BrokerEvent> {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => Some(BrokerEvent::Connected),
        Event::Incoming(Packet::SubAck(ack)) => {
            let rejected = ack
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure));
            let topic = topic.to_string();
            Some(if rejected {
                BrokerEvent::SubscribeRejected { topic }
            } else {
                BrokerEvent::Subscribed { topic }
            })
        }
        Event::Incoming(Packet::Publish(publish)) if rumqttc::matches(&publish.topic, topic) => Some(
            BrokerEvent::Message(SensorPayload::new(publish.payload.clone())),
        ),
        _ => None,
    }
}

/// A live subscription to one broker topic.
pub struct BrokerSubscription {
    config: BrokerConfig,
    client: AsyncClient,
    eventloop: EventLoop,
    events: mpsc::Sender<BrokerEvent>,
}

impl BrokerSubscription {
    pub fn new(config: BrokerConfig, events: mpsc::Sender<BrokerEvent>) -> Self {
        let (client, eventloop) = AsyncClient::new(config.options(), REQUEST_CAPACITY);
        Self {
            config,
            client,
            eventloop,
            events,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<(), BrokerError>> {
        tokio::spawn(async move {
            let result = self.run().await;
            if let Err(e) = &result {
                tracing::error!("broker subscription ended: {}", e);
            }
            result
        })
    }

    /// Drive the connection. Each message is handed to the relay before the
    /// next one is read.
    pub async fn run(mut self) -> Result<(), BrokerError> {
        tracing::info!(url = %self.config.url(), topic = %self.config.topic, "connecting to broker");
        let mut attempt = 0u32;

        loop {
            match self.eventloop.poll().await {
                Ok(event) => {
                    if let Event::Incoming(Packet::ConnAck(_)) = &event {
                        attempt = 0;
                        // Subscribed on every ConnAck so a reconnect restores the topic.
                        self.client
                            .subscribe(self.config.topic.as_str(), QoS::AtMostOnce)
                            .await?;
                    }
                    if let Some(out) = translate(&event, &self.config.topic) {
                        self.events
                            .send(out)
                            .await
                            .map_err(|_| BrokerError::RelayGone)?;
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    let _ = self.events.send(BrokerEvent::Disconnected { reason }).await;

                    let Some(delay) = self.config.reconnect.delay(attempt) else {
                        return Err(BrokerError::Connect(e));
                    };
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(?delay, attempt, "reconnecting to broker");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::{ConnAck, ConnectReturnCode, Publish, SubAck};

    const TOPIC: &str = "sensor/temperature";

    #[test]
    fn connack_maps_to_connected() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )));
        assert_eq!(translate(&event, TOPIC), Some(BrokerEvent::Connected));
    }

    #[test]
    fn publish_on_topic_is_forwarded_verbatim() {
        let publish = Publish::from_bytes(TOPIC, QoS::AtMostOnce, Bytes::from_static(b"23.5"));
        let event = Event::Incoming(Packet::Publish(publish));
        assert_eq!(
            translate(&event, TOPIC),
            Some(BrokerEvent::Message(SensorPayload::from("23.5")))
        );
    }

    #[test]
    fn publish_on_other_topic_is_ignored() {
        let publish = Publish::new("other/topic", QoS::AtMostOnce, "1");
        let event = Event::Incoming(Packet::Publish(publish));
        assert_eq!(translate(&event, TOPIC), None);
    }

    #[test]
    fn publish_matching_wildcard_filter_is_forwarded() {
        let single = Publish::new("sensors/greenhouse/temperature", QoS::AtMostOnce, "23.5");
        assert_eq!(
            translate(&Event::Incoming(Packet::Publish(single)), "sensors/+/temperature"),
            Some(BrokerEvent::Message(SensorPayload::from("23.5")))
        );

        let multi = Publish::new("sensor/attic/humidity", QoS::AtMostOnce, "41");
        assert_eq!(
            translate(&Event::Incoming(Packet::Publish(multi)), "sensor/#"),
            Some(BrokerEvent::Message(SensorPayload::from("41")))
        );

        let miss = Publish::new("sensors/greenhouse/humidity", QoS::AtMostOnce, "40");
        assert_eq!(
            translate(&Event::Incoming(Packet::Publish(miss)), "sensors/+/temperature"),
            None
        );
    }

    #[test]
    fn suback_failure_is_rejection() {
        let ok = Event::Incoming(Packet::SubAck(SubAck::new(
            1,
            vec![SubscribeReasonCode::Success(QoS::AtMostOnce)],
        )));
        let failed = Event::Incoming(Packet::SubAck(SubAck::new(
            1,
            vec![SubscribeReasonCode::Failure],
        )));
        assert_eq!(
            translate(&ok, TOPIC),
            Some(BrokerEvent::Subscribed { topic: TOPIC.into() })
        );
        assert_eq!(
            translate(&failed, TOPIC),
            Some(BrokerEvent::SubscribeRejected { topic: TOPIC.into() })
        );
    }

    #[test]
    fn outgoing_events_are_ignored() {
        let event = Event::Outgoing(rumqttc::Outgoing::PingReq);
        assert_eq!(translate(&event, TOPIC), None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay(5), Some(Duration::from_secs(32)));
        assert_eq!(policy.delay(6), Some(Duration::from_secs(60)));
        assert_eq!(policy.delay(40), Some(Duration::from_secs(60)));
    }

    #[test]
    fn disabled_policy_never_retries() {
        assert_eq!(ReconnectPolicy::disabled().delay(0), None);
    }

    #[test]
    fn config_url_and_client_id() {
        let config = BrokerConfig::new("broker.local", 1883, TOPIC);
        assert_eq!(config.url(), "mqtt://broker.local:1883");
        assert!(config.client_id.starts_with("sensor-relay-"));
        assert!(!config.reconnect.enabled);
    }

    #[tokio::test]
    async fn unreachable_broker_reports_disconnect_and_stops() {
        // Port 1 on loopback refuses connections.
        let config = BrokerConfig::new("127.0.0.1", 1, TOPIC);
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let result = BrokerSubscription::new(config, tx).run().await;

        assert!(matches!(result, Err(BrokerError::Connect(_))));
        assert!(matches!(
            rx.recv().await,
            Some(BrokerEvent::Disconnected { .. })
        ));
    }
}
