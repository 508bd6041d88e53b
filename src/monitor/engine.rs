//! Single consumer of transport events.
//!
//! The engine is the only writer of connection state, the alert episode and
//! the published snapshot. Each event is applied completely and then one new
//! [`PublishedState`] replaces the previous one.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alert::AlertMachine;
use crate::announcer::VoiceAnnouncer;
use crate::mqtt::decoder::{self, DecodeError};
use crate::mqtt::mqtt_handler::{ConnectionState, FailureReason, TransportEvent};
use crate::mqtt::subscription::{SubscribeClient, SubscriptionManager, SubscriptionOutcome};
use crate::publisher::{PublishedState, ReadingStatus, StatePublisher};

pub struct MonitorEngine<C: SubscribeClient> {
    /// Subscribe requests go out through this seam
    client: C,
    subscriptions: SubscriptionManager,
    alert: AlertMachine,
    /// Handed to the alert machine for the single announcement per episode
    announcer: Arc<dyn VoiceAnnouncer>,
    publisher: StatePublisher,
    /// Last connection status, refined by SUBACK outcomes
    connection: ConnectionState,
    /// Latest decoded value or the reason there is none
    reading: ReadingStatus,
    /// Arrival counter stamped on every message, decodable or not
    next_sequence: u64,
}

impl<C: SubscribeClient> MonitorEngine<C> {
    pub fn new(
        client: C,
        subscriptions: SubscriptionManager,
        alert: AlertMachine,
        announcer: Arc<dyn VoiceAnnouncer>,
        publisher: StatePublisher,
    ) -> Self {
        Self {
            client,
            subscriptions,
            alert,
            announcer,
            publisher,
            connection: ConnectionState::Disconnected,
            reading: ReadingStatus::Pending,
            next_sequence: 0,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn alert(&self) -> &AlertMachine {
        &self.alert
    }

    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    pub fn handle(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connecting => {
                self.connection = ConnectionState::Connecting;
            }
            TransportEvent::Connected { is_reconnect } => {
                self.alert.on_connection_event();
                self.connection = match self.subscriptions.on_connected(&self.client, is_reconnect) {
                    Ok(()) => ConnectionState::Connected,
                    Err(e) => ConnectionState::Failed(FailureReason::Subscription(e.to_string())),
                };
            }
            TransportEvent::ConnectFailed { reason, will_retry } => {
                debug!("Handshake failed (retry: {}): {}", will_retry, reason);
                self.alert.on_connection_event();
                self.subscriptions.on_connection_lost();
                self.connection = ConnectionState::Failed(FailureReason::Connect(reason));
            }
            TransportEvent::ConnectionLost { cause, will_retry } => {
                debug!("Connection lost (retry: {}): {}", will_retry, cause);
                self.alert.on_connection_event();
                self.subscriptions.on_connection_lost();
                self.connection = ConnectionState::ConnectionLost;
            }
            TransportEvent::MessageArrived { topic, payload } => {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                debug!("Message #{} on {} ({} bytes)", sequence, topic, payload.len());
                self.apply_payload(&payload, sequence);
            }
            TransportEvent::SubscribeAcknowledged { return_codes } => {
                self.connection = match self.subscriptions.on_subscribe_ack(&return_codes) {
                    SubscriptionOutcome::Succeeded | SubscriptionOutcome::AlreadySubscribed => {
                        ConnectionState::Subscribed
                    }
                    SubscriptionOutcome::Failed(e) => {
                        ConnectionState::Failed(FailureReason::Subscription(e.to_string()))
                    }
                };
            }
            TransportEvent::DeliveryAcknowledged { message_id } => {
                debug!("Delivery acknowledged for message {}", message_id);
                return;
            }
        }
        self.publish();
    }

    fn apply_payload(&mut self, payload: &[u8], sequence: u64) {
        match decoder::decode(payload, sequence) {
            Ok(reading) => {
                self.alert.on_reading(&reading, self.announcer.as_ref());
                self.reading = ReadingStatus::Value(reading);
            }
            Err(DecodeError::InvalidFormat) => {
                warn!(
                    "Undecodable payload #{}: {:?}",
                    sequence,
                    String::from_utf8_lossy(payload)
                );
                self.alert.on_decode_error();
                self.reading = ReadingStatus::Unavailable(DecodeError::InvalidFormat);
            }
        }
    }

    /// The transport gave up on its own. A failure stays visible until the
    /// next start; anything else degrades to `Disconnected`.
    pub fn transport_closed(mut self) {
        debug!("Transport event channel closed");
        if !matches!(self.connection, ConnectionState::Failed(_)) {
            self.connection = ConnectionState::Disconnected;
            self.publish();
        }
        self.subscriptions.on_connection_lost();
        info!("Monitor engine stopped, transport halted");
    }

    /// Final snapshot after teardown; no further events are applied.
    pub fn shut_down(mut self) {
        self.connection = ConnectionState::Disconnected;
        self.publish();
        info!("Monitor engine stopped");
    }

    fn publish(&self) {
        self.publisher.publish(PublishedState::new(
            self.connection.clone(),
            self.reading,
            self.alert.episode(),
        ));
    }
}

/// Applies transport events until shutdown or until the transport is gone.
pub async fn run_engine_loop<C: SubscribeClient>(
    mut engine: MonitorEngine<C>,
    mut events: mpsc::Receiver<TransportEvent>,
    shutdown: CancellationToken,
) {
    info!("Entering monitor engine loop");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => engine.handle(event),
                None if shutdown.is_cancelled() => break,
                None => {
                    engine.transport_closed();
                    return;
                }
            },
        }
    }
    engine.shut_down();
}
