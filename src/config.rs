use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::api::SocketConfig;
use crate::mqtt::{BrokerConfig, ReconnectPolicy};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("MQTT topic must not be empty")]
    EmptyTopic,

    #[error("JWT secret must not be empty")]
    EmptySecret,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("invalid listen address {0}")]
    Address(String),
}

/// Sensor relay: MQTT topic → WebSocket clients, plus a small auth API.
#[derive(Parser, Debug, Clone)]
#[command(name = "sensor-relay", version)]
pub struct Config {
    /// MQTT broker host
    #[arg(long, env = "MQTT_BROKER_ADDRESS", default_value = "localhost")]
    pub mqtt_host: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    /// Topic carrying sensor readings
    #[arg(long, env = "MQTT_TOPIC", default_value = "sensor/temperature")]
    pub mqtt_topic: String,

    /// Reconnect to the broker with exponential backoff after a connection loss
    #[arg(long, env = "MQTT_RECONNECT", default_value_t = false)]
    pub mqtt_reconnect: bool,

    /// Address to bind both listeners to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// HTTP API port
    #[arg(long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    /// WebSocket port
    #[arg(long, env = "WS_PORT", default_value_t = 8080)]
    pub ws_port: u16,

    /// Secret used to sign access tokens
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// Token lifetime in seconds
    #[arg(long, env = "TOKEN_TTL_SECS", default_value_t = 3600)]
    pub token_ttl_secs: u64,

    /// SQLite database holding registered users
    #[arg(long, env = "DATABASE_PATH", default_value = "users.db")]
    pub database_path: String,

    /// Outbound queue depth per WebSocket client
    #[arg(long, env = "SUBSCRIBER_QUEUE", default_value_t = 32)]
    pub subscriber_queue: usize,

    /// Seconds between WebSocket pings
    #[arg(long, env = "WS_PING_SECS", default_value_t = 30)]
    pub ws_ping_secs: u64,

    /// Milliseconds a single WebSocket send may take before the client is dropped
    #[arg(long, env = "WS_SEND_TIMEOUT_MS", default_value_t = 5000)]
    pub ws_send_timeout_ms: u64,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt_topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::EmptySecret);
        }
        if self.subscriber_queue == 0 {
            return Err(ConfigError::Zero("subscriber queue"));
        }
        if self.ws_ping_secs == 0 {
            return Err(ConfigError::Zero("ping interval"));
        }
        if self.ws_send_timeout_ms == 0 {
            return Err(ConfigError::Zero("send timeout"));
        }
        if self.token_ttl_secs == 0 {
            return Err(ConfigError::Zero("token lifetime"));
        }
        Ok(())
    }

    pub fn broker(&self) -> BrokerConfig {
        let mut broker = BrokerConfig::new(&self.mqtt_host, self.mqtt_port, &self.mqtt_topic);
        if self.mqtt_reconnect {
            broker.reconnect = ReconnectPolicy::default();
        }
        broker
    }

    pub fn socket(&self) -> SocketConfig {
        SocketConfig {
            ping_interval: Duration::from_secs(self.ws_ping_secs),
            send_timeout: Duration::from_millis(self.ws_send_timeout_ms),
        }
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn http_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.addr(self.port)
    }

    pub fn ws_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.addr(self.ws_port)
    }

    fn addr(&self, port: u16) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.host, port);
        raw.parse().map_err(|_| ConfigError::Address(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["sensor-relay", "--jwt-secret", "s3cret"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.mqtt_port, 1883);
        assert_eq!(config.port, 5000);
        assert_eq!(config.ws_port, 8080);
        assert_eq!(config.subscriber_queue, 32);
        assert!(!config.mqtt_reconnect);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn broker_config_follows_flags() {
        let config = parse(&[
            "--mqtt-host",
            "10.0.0.5",
            "--mqtt-port",
            "1884",
            "--mqtt-topic",
            "greenhouse/temp",
            "--mqtt-reconnect",
        ]);
        let broker = config.broker();
        assert_eq!(broker.url(), "mqtt://10.0.0.5:1884");
        assert_eq!(broker.topic, "greenhouse/temp");
        assert!(broker.reconnect.enabled);
    }

    #[test]
    fn rejects_empty_topic() {
        let config = parse(&["--mqtt-topic", " "]);
        assert_eq!(config.validate(), Err(ConfigError::EmptyTopic));
    }

    #[test]
    fn rejects_zero_queue() {
        let config = parse(&["--subscriber-queue", "0"]);
        assert_eq!(config.validate(), Err(ConfigError::Zero("subscriber queue")));
    }

    #[test]
    fn listen_addresses() {
        let config = parse(&["--host", "127.0.0.1", "--ws-port", "9001"]);
        assert_eq!(config.ws_addr().unwrap().port(), 9001);
        assert!(parse(&["--host", "not a host"]).http_addr().is_err());
    }
}
