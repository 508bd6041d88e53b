//! # Configuration
//!
//! The monitor reads a single TOML file with three sections:
//!
//! ```toml
//! [broker]
//! address = "tcp://broker.hivemq.com:1883"
//! topic = "sensors/light/cc3200"
//! qos = 1
//!
//! [alert]
//! threshold = 1500
//!
//! [announcer]
//! command = ["espeak", "-v", "en-us"]
//! ```
//!
//! Every field has a default, so a missing file or a partial file still
//! yields a working setup. The raw file is validated into
//! [`MonitorSettings`] before anything connects.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::alert::{Announcement, DEFAULT_DEDUPE_TOKEN, DEFAULT_UTTERANCE};
use crate::announcer::{CommandAnnouncer, LogAnnouncer, VoiceAnnouncer};
use crate::monitor::MonitorSettings;
use crate::mqtt::config::{generate_client_id, qos_from_level, BrokerAddress, MqttConfig};

const CONFIG_DIR: &str = "headlight-monitor";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid broker address: {0}")]
    InvalidBrokerAddress(String),

    #[error("unsupported broker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid QoS level {0}, expected 0 or 1")]
    InvalidQos(u8),

    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}

/// Broker connection section.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerSection {
    /// `scheme://host:port`, plaintext (`tcp`, `mqtt`) or TLS (`ssl`, `mqtts`)
    pub address: String,
    /// Generated once when the settings are built if absent or blank; every
    /// restart of the same monitor reuses it
    pub client_id: Option<String>,
    pub topic: String,
    pub qos: u8,
    pub clean_session: bool,
    pub automatic_reconnect: bool,
    pub connect_timeout_secs: u64,
    /// Idle ping interval; 0 disables pings
    pub keep_alive_secs: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_secs: u64,
    pub channel_capacity: usize,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            address: "tcp://broker.hivemq.com:1883".to_string(),
            client_id: None,
            topic: "sensors/light/cc3200".to_string(),
            qos: 1,
            clean_session: true,
            automatic_reconnect: true,
            connect_timeout_secs: 60,
            keep_alive_secs: 60,
            reconnect_initial_delay_ms: 1000,
            reconnect_max_delay_secs: 60,
            channel_capacity: 100,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AlertSection {
    pub threshold: i32,
    pub utterance: String,
    pub dedupe_token: String,
}

impl Default for AlertSection {
    fn default() -> Self {
        Self {
            threshold: 1500,
            utterance: DEFAULT_UTTERANCE.to_string(),
            dedupe_token: DEFAULT_DEDUPE_TOKEN.to_string(),
        }
    }
}

/// Text-to-speech program; empty means announcements only go to the log.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AnnouncerSection {
    pub command: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerSection,
    pub alert: AlertSection,
    pub announcer: AnnouncerSection,
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Loads the config file.
    ///
    /// An explicitly given path must exist. Without one, the default location
    /// is tried and defaults are used if nothing is there.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => {
                    warn!("No config directory available, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;

        if !exists && !required {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
        debug!("Loaded config from {}", path.display());
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn monitor_settings(&self) -> Result<MonitorSettings, ConfigError> {
        let broker = &self.broker;

        let topic = broker.topic.trim();
        if topic.is_empty() {
            return Err(invalid("broker.topic", "must not be empty"));
        }
        if broker.connect_timeout_secs == 0 {
            return Err(invalid("broker.connect_timeout_secs", "must be at least 1"));
        }
        if broker.reconnect_initial_delay_ms == 0 {
            return Err(invalid("broker.reconnect_initial_delay_ms", "must be at least 1"));
        }
        if broker.reconnect_max_delay_secs == 0 {
            return Err(invalid("broker.reconnect_max_delay_secs", "must be at least 1"));
        }
        if broker.channel_capacity == 0 {
            return Err(invalid("broker.channel_capacity", "must be at least 1"));
        }

        let client_id = match broker.client_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => generate_client_id(),
        };

        let mqtt = MqttConfig {
            broker: BrokerAddress::parse(&broker.address)?,
            client_id,
            topic: topic.to_string(),
            qos: qos_from_level(broker.qos)?,
            clean_session: broker.clean_session,
            automatic_reconnect: broker.automatic_reconnect,
            connect_timeout: Duration::from_secs(broker.connect_timeout_secs),
            keep_alive: Duration::from_secs(broker.keep_alive_secs),
            reconnect_initial_delay: Duration::from_millis(broker.reconnect_initial_delay_ms),
            reconnect_max_delay: Duration::from_secs(broker.reconnect_max_delay_secs),
            channel_capacity: broker.channel_capacity,
        };

        Ok(MonitorSettings {
            mqtt,
            threshold: self.alert.threshold,
            announcement: Announcement {
                utterance: self.alert.utterance.clone(),
                dedupe_token: self.alert.dedupe_token.clone(),
            },
        })
    }

    pub fn build_announcer(&self) -> Arc<dyn VoiceAnnouncer> {
        match CommandAnnouncer::from_command_line(&self.announcer.command) {
            Some(announcer) => {
                info!("Announcing through {:?}", self.announcer.command);
                Arc::new(announcer)
            }
            None => {
                info!("No announcer command configured, announcing to the log");
                Arc::new(LogAnnouncer)
            }
        }
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidSetting {
        name,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::QoS;

    #[test]
    fn defaults_match_the_field_setup() {
        let settings = AppConfig::default().monitor_settings().unwrap();
        assert_eq!(settings.mqtt.broker.to_string(), "tcp://broker.hivemq.com:1883");
        assert_eq!(settings.mqtt.topic, "sensors/light/cc3200");
        assert_eq!(settings.mqtt.qos, QoS::AtLeastOnce);
        assert!(settings.mqtt.clean_session);
        assert!(settings.mqtt.automatic_reconnect);
        assert_eq!(settings.mqtt.connect_timeout, Duration::from_secs(60));
        assert_eq!(settings.mqtt.keep_alive, Duration::from_secs(60));
        assert_eq!(settings.threshold, 1500);
        assert_eq!(settings.announcement, Announcement::default());
        assert!(settings.mqtt.client_id.starts_with("headlight-"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [broker]
            address = "mqtts://example.org:8883"
            client_id = "dashboard-1"

            [alert]
            threshold = 800
            "#,
        )
        .unwrap();
        let settings = config.monitor_settings().unwrap();
        assert_eq!(settings.mqtt.client_id, "dashboard-1");
        assert_eq!(settings.mqtt.broker.port, 8883);
        assert_eq!(settings.threshold, 800);
        assert_eq!(settings.mqtt.topic, "sensors/light/cc3200");
        assert!(config.announcer.command.is_empty());
    }

    #[test]
    fn rejects_invalid_values() {
        let mut config = AppConfig::default();
        config.broker.qos = 5;
        assert!(matches!(config.monitor_settings(), Err(ConfigError::InvalidQos(5))));

        let mut config = AppConfig::default();
        config.broker.topic = "  ".into();
        assert!(matches!(
            config.monitor_settings(),
            Err(ConfigError::InvalidSetting { name: "broker.topic", .. })
        ));

        let mut config = AppConfig::default();
        config.broker.connect_timeout_secs = 0;
        assert!(matches!(
            config.monitor_settings(),
            Err(ConfigError::InvalidSetting { name: "broker.connect_timeout_secs", .. })
        ));

        let mut config = AppConfig::default();
        config.broker.address = "broker:1883".into();
        assert!(matches!(
            config.monitor_settings(),
            Err(ConfigError::InvalidBrokerAddress(_))
        ));
    }

    #[test]
    fn any_whole_second_keep_alive_is_accepted() {
        for secs in [0, 1, 5, 3600] {
            let mut config = AppConfig::default();
            config.broker.keep_alive_secs = secs;
            let settings = config.monitor_settings().unwrap();
            assert_eq!(settings.mqtt.keep_alive, Duration::from_secs(secs));
            // Must not trip rumqttc's keep-alive assertion
            let _ = settings.mqtt.mqtt_options();
        }
    }

    #[test]
    fn blank_client_id_is_generated_once() {
        let mut config = AppConfig::default();
        config.broker.client_id = Some("   ".into());
        let settings = config.monitor_settings().unwrap();
        assert!(settings.mqtt.client_id.starts_with("headlight-"));

        let restarted = settings.clone();
        assert_eq!(restarted.mqtt.client_id, settings.mqtt.client_id);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            AppConfig::from_toml("[broker\naddress = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn loads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(
            &path,
            "[announcer]\ncommand = [\"espeak\", \"-v\", \"en-us\"]\n",
        )
        .await
        .unwrap();

        let config = AppConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config.announcer.command, vec!["espeak", "-v", "en-us"]);
        assert_eq!(config.broker, BrokerSection::default());
    }

    #[tokio::test]
    async fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(matches!(
            AppConfig::load(Some(&path)).await,
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = AppConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(AppConfig::from_toml(&text).unwrap(), config);
    }
}
