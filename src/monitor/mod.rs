//! # Monitor Lifecycle
//!
//! Wires the transport, the engine and the publisher together and exposes
//! the two lifecycle hooks of the core: [`MonitorHandle::start`] and
//! [`MonitorHandle::stop`].
//!
//! ## Task layout
//!
//! ```text
//! MqttHandler task ─[TransportEvent]→ engine task ─[PublishedState]→ surfaces / watch readers
//!                    (mpsc::channel)                (send_replace)
//! ```
//!
//! Both tasks share one `CancellationToken`. Cancelling it makes the
//! transport send DISCONNECT (when online) and stop retrying, and makes the
//! engine publish a final `Disconnected` snapshot and stop applying events.
//!
//! ## Teardown guarantees
//!
//! `stop()` is idempotent and can be called from any task. The session slot
//! is guarded by an async mutex held for the whole teardown, so concurrent
//! callers wait for the one teardown that actually runs. Dropping the last
//! handle without calling `stop()` still cancels the session.

pub mod engine;

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::alert::{AlertMachine, Announcement};
use crate::announcer::VoiceAnnouncer;
use crate::mqtt::config::MqttConfig;
use crate::mqtt::mqtt_handler::MqttHandler;
use crate::mqtt::subscription::SubscriptionManager;
use crate::publisher::{PresentationSurface, PublishedState, StatePublisher};
use engine::{run_engine_loop, MonitorEngine};

/// Everything the core needs, fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub mqtt: MqttConfig,
    /// Readings strictly below this value raise the alert.
    pub threshold: i32,
    pub announcement: Announcement,
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("monitor is already running")]
    AlreadyRunning,
}

struct Session {
    shutdown: CancellationToken,
    transport: JoinHandle<()>,
    engine: JoinHandle<()>,
}

impl Session {
    fn is_finished(&self) -> bool {
        self.transport.is_finished() && self.engine.is_finished()
    }
}

struct Inner {
    settings: MonitorSettings,
    announcer: Arc<dyn VoiceAnnouncer>,
    publisher: StatePublisher,
    session: Mutex<Option<Session>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().as_ref() {
            session.shutdown.cancel();
        }
    }
}

/// Cloneable handle to the messaging core.
#[derive(Clone)]
pub struct MonitorHandle {
    inner: Arc<Inner>,
}

impl MonitorHandle {
    pub fn new(
        settings: MonitorSettings,
        announcer: Arc<dyn VoiceAnnouncer>,
        surfaces: Vec<Arc<dyn PresentationSurface>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                announcer,
                publisher: StatePublisher::new(surfaces),
                session: Mutex::new(None),
            }),
        }
    }

    /// Connects to the broker in the background.
    ///
    /// Fails only if a session is still active. A session that ended on its
    /// own (terminal connect failure with reconnect disabled) is reaped and
    /// replaced.
    pub async fn start(&self) -> Result<(), MonitorError> {
        let mut slot = self.inner.session.lock().await;

        if let Some(previous) = slot.take() {
            if !previous.is_finished() {
                *slot = Some(previous);
                return Err(MonitorError::AlreadyRunning);
            }
            debug!("Reaping finished monitor session");
            reap(previous).await;
        }

        let settings = &self.inner.settings;
        info!(
            "Starting monitor for {} on {} (threshold {})",
            settings.mqtt.topic, settings.mqtt.broker, settings.threshold
        );

        let shutdown = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(settings.mqtt.channel_capacity);

        let handler = MqttHandler::new(&settings.mqtt, event_tx, shutdown.clone());
        let engine = MonitorEngine::new(
            handler.client(),
            SubscriptionManager::new(settings.mqtt.topic.clone(), settings.mqtt.qos),
            AlertMachine::new(settings.threshold, settings.announcement.clone()),
            self.inner.announcer.clone(),
            self.inner.publisher.clone(),
        );

        let engine = tokio::spawn(run_engine_loop(engine, event_rx, shutdown.clone()));
        let transport = handler.spawn();

        *slot = Some(Session {
            shutdown,
            transport,
            engine,
        });
        Ok(())
    }

    /// Disconnects and waits for both tasks. Safe to call repeatedly.
    pub async fn stop(&self) {
        let mut slot = self.inner.session.lock().await;
        match slot.take() {
            Some(session) => {
                info!("Stopping monitor");
                reap(session).await;
                info!("Monitor stopped");
            }
            None => debug!("Monitor not running, nothing to stop"),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .is_some_and(|session| !session.is_finished())
    }

    pub fn current(&self) -> Arc<PublishedState> {
        self.inner.publisher.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<PublishedState>> {
        self.inner.publisher.subscribe()
    }

    pub fn topic(&self) -> &str {
        &self.inner.settings.mqtt.topic
    }
}

async fn reap(session: Session) {
    session.shutdown.cancel();
    if let Err(e) = session.transport.await {
        error!("Transport task ended abnormally: {}", e);
    }
    if let Err(e) = session.engine.await {
        error!("Engine task ended abnormally: {}", e);
    }
}
