//! Topic subscription on every (re)connect.
//!
//! The broker session is started clean, so a `Connected` event always means
//! the previous subscription is gone. The manager re-issues the subscribe on
//! each connect and folds the broker's SUBACK into an outcome the engine can
//! publish as a connection status refinement.

use rumqttc::{AsyncClient, QoS, SubscribeReasonCode};
use tracing::{debug, info, warn};

/// Non-blocking subscribe request towards the broker.
pub trait SubscribeClient: Send + Sync {
    fn request_subscribe(&self, topic: &str, qos: QoS) -> Result<(), SubscriptionError>;
}

impl SubscribeClient for AsyncClient {
    fn request_subscribe(&self, topic: &str, qos: QoS) -> Result<(), SubscriptionError> {
        self.try_subscribe(topic, qos)
            .map_err(|e| SubscriptionError::Request(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("subscribe request could not be queued: {0}")]
    Request(String),

    #[error("broker rejected subscription to {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionOutcome {
    Succeeded,
    AlreadySubscribed,
    Failed(SubscriptionError),
}

#[derive(Debug)]
pub struct SubscriptionManager {
    topic: String,
    qos: QoS,
    subscribed: bool,
    attempts: u64,
}

impl SubscriptionManager {
    pub fn new(topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            qos,
            subscribed: false,
            attempts: 0,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// Number of subscribe requests issued since construction.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn on_connected<C>(&mut self, client: &C, is_reconnect: bool) -> Result<(), SubscriptionError>
    where
        C: SubscribeClient + ?Sized,
    {
        self.subscribed = false;
        self.attempts += 1;
        info!(
            "Subscribing to {} (attempt {}, reconnect: {})",
            self.topic, self.attempts, is_reconnect
        );

        client.request_subscribe(&self.topic, self.qos).map_err(|e| {
            warn!("Subscribe request for {} failed: {}", self.topic, e);
            e
        })
    }

    pub fn on_connection_lost(&mut self) {
        if self.subscribed {
            debug!("Subscription to {} dropped with the connection", self.topic);
        }
        self.subscribed = false;
    }

    pub fn on_subscribe_ack(&mut self, return_codes: &[SubscribeReasonCode]) -> SubscriptionOutcome {
        let granted = !return_codes.is_empty()
            && return_codes
                .iter()
                .all(|code| matches!(code, SubscribeReasonCode::Success(_)));

        if !granted {
            warn!("Broker rejected subscription to {}: {:?}", self.topic, return_codes);
            self.subscribed = false;
            return SubscriptionOutcome::Failed(SubscriptionError::Rejected(self.topic.clone()));
        }

        if self.subscribed {
            debug!("Duplicate SUBACK for {}, already subscribed", self.topic);
            return SubscriptionOutcome::AlreadySubscribed;
        }

        info!("Subscribed to {}", self.topic);
        self.subscribed = true;
        SubscriptionOutcome::Succeeded
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingClient {
        pub requests: Mutex<Vec<(String, QoS)>>,
        pub fail_next: Mutex<bool>,
    }

    impl SubscribeClient for RecordingClient {
        fn request_subscribe(&self, topic: &str, qos: QoS) -> Result<(), SubscriptionError> {
            self.requests.lock().unwrap().push((topic.to_string(), qos));
            let mut fail = self.fail_next.lock().unwrap();
            if std::mem::take(&mut *fail) {
                return Err(SubscriptionError::Request("request channel full".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn subscribes_on_every_connect() {
        let client = RecordingClient::default();
        let mut manager = SubscriptionManager::new("sensors/light/cc3200", QoS::AtLeastOnce);

        manager.on_connected(&client, false).unwrap();
        manager.on_subscribe_ack(&[SubscribeReasonCode::Success(QoS::AtLeastOnce)]);
        manager.on_connection_lost();
        manager.on_connected(&client, true).unwrap();

        let requests = client.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests
            .iter()
            .all(|(topic, qos)| topic == "sensors/light/cc3200" && *qos == QoS::AtLeastOnce));
        assert_eq!(manager.attempts(), 2);
        assert!(!manager.is_subscribed());
    }

    #[test]
    fn duplicate_ack_is_not_an_error() {
        let mut manager = SubscriptionManager::new("t", QoS::AtLeastOnce);
        let ack = [SubscribeReasonCode::Success(QoS::AtLeastOnce)];
        assert_eq!(manager.on_subscribe_ack(&ack), SubscriptionOutcome::Succeeded);
        assert_eq!(manager.on_subscribe_ack(&ack), SubscriptionOutcome::AlreadySubscribed);
        assert!(manager.is_subscribed());
    }

    #[test]
    fn rejected_ack_reports_failure() {
        let mut manager = SubscriptionManager::new("t", QoS::AtLeastOnce);
        assert_eq!(
            manager.on_subscribe_ack(&[SubscribeReasonCode::Failure]),
            SubscriptionOutcome::Failed(SubscriptionError::Rejected("t".into()))
        );
        assert!(!manager.is_subscribed());
    }

    #[test]
    fn request_failure_propagates() {
        let client = RecordingClient::default();
        *client.fail_next.lock().unwrap() = true;
        let mut manager = SubscriptionManager::new("t", QoS::AtLeastOnce);
        assert!(matches!(
            manager.on_connected(&client, false),
            Err(SubscriptionError::Request(_))
        ));
        assert_eq!(manager.attempts(), 1);
    }
}
