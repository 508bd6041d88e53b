//! Transport connection to the broker.
//!
//! One tokio task owns the rumqttc event loop and walks a typestate machine:
//!
//! ```text
//! Connecting ──CONNACK──► Online ──error──► Retrying(delay) ──sleep──► Connecting
//!     │                     │                   │
//!     └─────────────── shutdown / terminal failure ──────────► Halted
//! ```
//!
//! Every broker callback is turned into a [`TransportEvent`] and pushed into a
//! bounded channel, preserving delivery order for the single consumer.

use std::fmt;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, Outgoing, Packet, SubscribeReasonCode,
};
use statum::{machine, state};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::config::MqttConfig;

const DISCONNECT_FLUSH: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureReason {
    Connect(String),
    Subscription(String),
}

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    ConnectionLost,
    Failed(FailureReason),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting to MQTT...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Subscribed => "Connected & Subscribed",
            ConnectionState::ConnectionLost => "Connection Lost. Reconnecting...",
            ConnectionState::Failed(FailureReason::Connect(_)) => "Connection Failed!",
            ConnectionState::Failed(FailureReason::Subscription(_)) => "Subscription Failed!",
        };
        f.write_str(text)
    }
}

/// Broker callbacks, in delivery order.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// First handshake of a session is in progress.
    Connecting,
    Connected {
        is_reconnect: bool,
    },
    /// The first handshake failed. Retry failures inside a reconnect cycle
    /// are not reported.
    ConnectFailed {
        reason: String,
        will_retry: bool,
    },
    ConnectionLost {
        cause: String,
        will_retry: bool,
    },
    MessageArrived {
        topic: String,
        payload: Vec<u8>,
    },
    SubscribeAcknowledged {
        return_codes: Vec<SubscribeReasonCode>,
    },
    DeliveryAcknowledged {
        message_id: u16,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryDelay(pub Duration);

#[state]
#[derive(Debug, Clone)]
pub enum LinkState {
    Connecting,
    Online,
    Retrying(RetryDelay),
}

#[machine]
pub struct ConnectionDriver<S: LinkState> {
    /// Request side of the session, used here only for DISCONNECT
    client: AsyncClient,
    /// Network side; polled exclusively by this driver
    eventloop: EventLoop,
    config: MqttConfig,
    /// Bounded channel towards the single event consumer
    events: mpsc::Sender<TransportEvent>,
    /// Shared with the engine task; cancelled by `MonitorHandle::stop`
    shutdown: CancellationToken,
    /// Delay before the next reconnect attempt
    backoff: Backoff,
    /// Set on the first CONNACK of the session, never cleared
    has_connected: bool,
}

pub enum DriverStep {
    Connecting(ConnectionDriver<Connecting>),
    Online(ConnectionDriver<Online>),
    Retrying(ConnectionDriver<Retrying>),
    Halted,
}

// Available in every state
impl<S: LinkState> ConnectionDriver<S> {
    // False once shutdown started or the consumer went away
    async fn emit(&self, event: TransportEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            sent = self.events.send(event) => match sent {
                Ok(()) => true,
                Err(_) => {
                    warn!("Transport event consumer is gone, stopping connection");
                    false
                }
            },
        }
    }

    // Maps a raw rumqttc event onto the transport event stream
    async fn forward(&self, event: Event) -> bool {
        let event = match event {
            Event::Incoming(Packet::Publish(publish)) => TransportEvent::MessageArrived {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            },
            Event::Incoming(Packet::SubAck(ack)) => TransportEvent::SubscribeAcknowledged {
                return_codes: ack.return_codes,
            },
            Event::Incoming(Packet::PubAck(ack)) => TransportEvent::DeliveryAcknowledged {
                message_id: ack.pkid,
            },
            Event::Incoming(Packet::PubComp(ack)) => TransportEvent::DeliveryAcknowledged {
                message_id: ack.pkid,
            },
            other => {
                debug!("Ignoring MQTT event: {:?}", other);
                return true;
            }
        };
        self.emit(event).await
    }

    fn schedule_retry(mut self) -> DriverStep {
        let delay = self.backoff.next_delay();
        info!("Reconnecting to {} in {:?}", self.config.broker, delay);
        DriverStep::Retrying(self.transition_with(RetryDelay(delay)))
    }

    // Drops the network session without talking to the broker
    fn halt(self) -> DriverStep {
        info!("MQTT connection to {} halted", self.config.broker);
        DriverStep::Halted
    }
}

impl ConnectionDriver<Connecting> {
    pub fn create(
        client: AsyncClient,
        eventloop: EventLoop,
        config: MqttConfig,
        events: mpsc::Sender<TransportEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let backoff = Backoff::new(config.reconnect_initial_delay, config.reconnect_max_delay);
        Self::new(client, eventloop, config, events, shutdown, backoff, false)
    }

    pub async fn establish(mut self) -> DriverStep {
        if !self.has_connected && !self.emit(TransportEvent::Connecting).await {
            return self.halt();
        }
        info!(
            "Connecting to {} as {}",
            self.config.broker, self.config.client_id
        );

        // The handshake timeout lives in the event loop's network options
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return self.halt(),
                polled = self.eventloop.poll() => match polled {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        let is_reconnect = self.has_connected;
                        info!(
                            "Connected to {} (session present: {}, reconnect: {})",
                            self.config.broker, ack.session_present, is_reconnect
                        );
                        self.has_connected = true;
                        self.backoff.reset();
                        if !self.emit(TransportEvent::Connected { is_reconnect }).await {
                            return self.halt();
                        }
                        return DriverStep::Online(self.transition());
                    }
                    Ok(event) => {
                        if !self.forward(event).await {
                            return self.halt();
                        }
                    }
                    Err(ConnectionError::NetworkTimeout) => {
                        let reason = format!(
                            "no CONNACK within {}s",
                            self.config.connect_timeout.as_secs()
                        );
                        return self.handshake_failed(reason).await;
                    }
                    Err(e) => return self.handshake_failed(e.to_string()).await,
                }
            }
        }
    }

    async fn handshake_failed(self, reason: String) -> DriverStep {
        let will_retry = self.config.automatic_reconnect;
        if self.has_connected {
            warn!("Reconnect to {} failed: {}", self.config.broker, reason);
        } else {
            error!("Connection to {} failed: {}", self.config.broker, reason);
            let event = TransportEvent::ConnectFailed { reason, will_retry };
            if !self.emit(event).await {
                return self.halt();
            }
        }

        if will_retry {
            self.schedule_retry()
        } else {
            self.halt()
        }
    }
}

impl ConnectionDriver<Online> {
    pub async fn pump(mut self) -> DriverStep {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return self.disconnect().await,
                polled = self.eventloop.poll() => match polled {
                    Ok(event) => {
                        if !self.forward(event).await {
                            return self.disconnect().await;
                        }
                    }
                    Err(e) => {
                        let will_retry = self.config.automatic_reconnect;
                        warn!("Connection to {} lost: {}", self.config.broker, e);
                        let event = TransportEvent::ConnectionLost {
                            cause: e.to_string(),
                            will_retry,
                        };
                        if !self.emit(event).await {
                            return self.halt();
                        }
                        return if will_retry {
                            self.schedule_retry()
                        } else {
                            self.halt()
                        };
                    }
                }
            }
        }
    }

    // Sends DISCONNECT and gives the event loop a bounded window to flush it
    async fn disconnect(mut self) -> DriverStep {
        match self.client.try_disconnect() {
            Ok(()) => {
                let eventloop = &mut self.eventloop;
                let flush = async {
                    loop {
                        match eventloop.poll().await {
                            Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                            Ok(_) => continue,
                        }
                    }
                };
                if tokio::time::timeout(DISCONNECT_FLUSH, flush).await.is_err() {
                    warn!("DISCONNECT to {} not flushed in time", self.config.broker);
                }
            }
            Err(e) => warn!("Could not queue DISCONNECT: {}", e),
        }
        self.halt()
    }
}

impl ConnectionDriver<Retrying> {
    pub async fn wait_retry(self) -> DriverStep {
        let delay = self
            .get_state_data()
            .map(|retry| retry.0)
            .unwrap_or_default();

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => self.halt(),
            _ = tokio::time::sleep(delay) => DriverStep::Connecting(self.transition()),
        }
    }
}

/// Owns one broker session from first connect to teardown.
pub struct MqttHandler {
    client: AsyncClient,
    driver: ConnectionDriver<Connecting>,
}

impl MqttHandler {
    pub fn new(
        config: &MqttConfig,
        events: mpsc::Sender<TransportEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let (client, mut eventloop) =
            AsyncClient::new(config.mqtt_options(), config.channel_capacity);
        eventloop.set_network_options(config.network_options());
        let driver =
            ConnectionDriver::create(client.clone(), eventloop, config.clone(), events, shutdown);
        Self { client, driver }
    }

    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(run_driver_loop(self.driver))
    }
}

async fn run_driver_loop(driver: ConnectionDriver<Connecting>) {
    info!("Entering MQTT connection loop");
    let mut step = DriverStep::Connecting(driver);
    loop {
        step = match step {
            DriverStep::Connecting(driver) => driver.establish().await,
            DriverStep::Online(driver) => driver.pump().await,
            DriverStep::Retrying(driver) => driver.wait_retry().await,
            DriverStep::Halted => break,
        };
    }
    info!("MQTT connection loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::{BrokerAddress, BrokerScheme};
    use rumqttc::QoS;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    fn unreachable_config(automatic_reconnect: bool) -> MqttConfig {
        local_config(1, automatic_reconnect)
    }

    fn local_config(port: u16, automatic_reconnect: bool) -> MqttConfig {
        MqttConfig {
            broker: BrokerAddress {
                scheme: BrokerScheme::Tcp,
                host: "127.0.0.1".into(),
                port,
            },
            client_id: "headlight-test".into(),
            topic: "sensors/light/cc3200".into(),
            qos: QoS::AtLeastOnce,
            clean_session: true,
            automatic_reconnect,
            connect_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(60),
            reconnect_initial_delay: Duration::from_millis(50),
            reconnect_max_delay: Duration::from_millis(200),
            channel_capacity: 16,
        }
    }

    #[test]
    fn status_text_matches_dashboard() {
        assert_eq!(ConnectionState::Subscribed.to_string(), "Connected & Subscribed");
        assert_eq!(
            ConnectionState::ConnectionLost.to_string(),
            "Connection Lost. Reconnecting..."
        );
        assert_eq!(
            ConnectionState::Failed(FailureReason::Connect("refused".into())).to_string(),
            "Connection Failed!"
        );
        assert_eq!(
            ConnectionState::Failed(FailureReason::Subscription("rejected".into())).to_string(),
            "Subscription Failed!"
        );
    }

    #[tokio::test]
    async fn refused_connect_without_reconnect_is_terminal() {
        let (tx, mut rx) = mpsc::channel(16);
        let handler = MqttHandler::new(&unreachable_config(false), tx, CancellationToken::new());
        let task = handler.spawn();

        assert_eq!(rx.recv().await, Some(TransportEvent::Connecting));
        match rx.recv().await {
            Some(TransportEvent::ConnectFailed { will_retry, .. }) => assert!(!will_retry),
            other => panic!("unexpected event: {:?}", other),
        }
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("driver should stop")
            .unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_reconnects() {
        let (tx, mut rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let handler = MqttHandler::new(&unreachable_config(true), tx, shutdown.clone());
        let task = handler.spawn();

        assert_eq!(rx.recv().await, Some(TransportEvent::Connecting));
        match rx.recv().await {
            Some(TransportEvent::ConnectFailed { will_retry, .. }) => assert!(will_retry),
            other => panic!("unexpected event: {:?}", other),
        }

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("driver should stop after shutdown")
            .unwrap();
    }

    // Reads one MQTT packet and returns its fixed header byte
    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<u8> {
        let header = stream.read_u8().await?;
        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            remaining |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; remaining];
        stream.read_exact(&mut body).await?;
        Ok(header)
    }

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("transport event in time")
            .expect("transport still running")
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_waits_for_configured_timeout() {
        // Accepts at the TCP level but never answers CONNECT
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut config = local_config(port, false);
        config.connect_timeout = Duration::from_secs(7);

        let (tx, mut rx) = mpsc::channel(16);
        let handler = MqttHandler::new(&config, tx, CancellationToken::new());
        let started = tokio::time::Instant::now();
        let task = handler.spawn();

        assert_eq!(rx.recv().await, Some(TransportEvent::Connecting));
        assert!(
            tokio::time::timeout(Duration::from_millis(6900), rx.recv())
                .await
                .is_err(),
            "handshake must not fail before the connect timeout"
        );

        match rx.recv().await {
            Some(TransportEvent::ConnectFailed { reason, will_retry }) => {
                assert_eq!(reason, "no CONNACK within 7s");
                assert!(!will_retry);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_secs(7));
        task.await.unwrap();
        drop(listener);
    }

    #[tokio::test]
    async fn reconnects_after_loss_and_disconnects_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // First session is dropped right after CONNACK, second one stays up
        let broker = tokio::spawn(async move {
            let (mut first, _) = listener.accept().await.unwrap();
            assert_eq!(read_packet(&mut first).await.unwrap() >> 4, 1);
            first.write_all(&CONNACK_ACCEPTED).await.unwrap();
            drop(first);

            let (mut second, _) = listener.accept().await.unwrap();
            assert_eq!(read_packet(&mut second).await.unwrap() >> 4, 1);
            second.write_all(&CONNACK_ACCEPTED).await.unwrap();
            read_packet(&mut second).await.unwrap()
        });

        let (tx, mut rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let handler = MqttHandler::new(&local_config(port, true), tx, shutdown.clone());
        let task = handler.spawn();

        assert_eq!(next_event(&mut rx).await, TransportEvent::Connecting);
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Connected {
                is_reconnect: false
            }
        );
        match next_event(&mut rx).await {
            TransportEvent::ConnectionLost { will_retry, .. } => assert!(will_retry),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Connected { is_reconnect: true }
        );

        shutdown.cancel();
        let last_packet = tokio::time::timeout(Duration::from_secs(5), broker)
            .await
            .expect("broker should see the DISCONNECT")
            .unwrap();
        assert_eq!(last_packet, 0xE0);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("driver should stop after shutdown")
            .unwrap();
    }
}
