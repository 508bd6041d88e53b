use std::fmt;
use std::time::Duration;

use rumqttc::{MqttOptions, NetworkOptions, QoS, Transport};

use crate::config::ConfigError;

const PLAINTEXT_PORT: u16 = 1883;
const TLS_PORT: u16 = 8883;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerScheme {
    Tcp,
    Tls,
}

/// Broker location in `scheme://host[:port]` form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerAddress {
    pub scheme: BrokerScheme,
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    pub fn parse(address: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidBrokerAddress(address.to_string());

        let (scheme, rest) = address.split_once("://").ok_or_else(invalid)?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "tcp" | "mqtt" => BrokerScheme::Tcp,
            "ssl" | "tls" | "mqtts" => BrokerScheme::Tls,
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };

        let rest = rest.trim_end_matches('/');
        let default_port = match scheme {
            BrokerScheme::Tcp => PLAINTEXT_PORT,
            BrokerScheme::Tls => TLS_PORT,
        };

        // IPv6 literals are bracketed: [::1]:1883
        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(invalid)?;
            let port = match tail {
                "" => default_port,
                tail => tail
                    .strip_prefix(':')
                    .and_then(|port| port.parse::<u16>().ok())
                    .ok_or_else(invalid)?,
            };
            (host, port)
        } else {
            match rest.rsplit_once(':') {
                Some((host, _)) if host.contains(':') => return Err(invalid()),
                Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
                None => (rest, default_port),
            }
        };

        if host.is_empty() || host.contains('/') || host.contains(['[', ']']) || port == 0 {
            return Err(invalid());
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let scheme = match self.scheme {
            BrokerScheme::Tcp => "tcp",
            BrokerScheme::Tls => "ssl",
        };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

/// Validated connection settings for one broker session.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub broker: BrokerAddress,
    pub client_id: String,
    pub topic: String,
    pub qos: QoS,
    pub clean_session: bool,
    pub automatic_reconnect: bool,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub channel_capacity: usize,
}

impl MqttConfig {
    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options =
            MqttOptions::new(self.client_id.clone(), self.broker.host.clone(), self.broker.port);
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(self.clean_session);

        if self.broker.scheme == BrokerScheme::Tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }

    /// Bounds the whole handshake (TCP, TLS and CONNACK) by `connect_timeout`.
    pub fn network_options(&self) -> NetworkOptions {
        let mut options = NetworkOptions::new();
        options.set_connection_timeout(self.connect_timeout.as_secs().max(1));
        options
    }
}

/// Subscription QoS; exactly-once delivery is not offered.
pub fn qos_from_level(level: u8) -> Result<QoS, ConfigError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        other => Err(ConfigError::InvalidQos(other)),
    }
}

/// Client identifier used when none is configured.
pub fn generate_client_id() -> String {
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();
    format!("headlight-{nanos}")
}
