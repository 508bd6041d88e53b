//! State Publisher - the single swap point between the engine and the UI
//!
//! The engine builds a complete [`PublishedState`] after every event and hands
//! it over here. Readers never see a half-updated value: the whole snapshot is
//! replaced behind a `watch` channel and surfaces are notified with the same
//! `Arc` that readers will observe.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::alert::AlertEpisode;
use crate::mqtt::decoder::{DecodeError, SensorReading};
use crate::mqtt::mqtt_handler::ConnectionState;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadingStatus {
    #[default]
    Pending,
    Value(SensorReading),
    Unavailable(DecodeError),
}

impl fmt::Display for ReadingStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReadingStatus::Value(reading) => write!(f, "{}", reading),
            ReadingStatus::Pending | ReadingStatus::Unavailable(_) => write!(f, "N/A"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PublishedState {
    pub connection: ConnectionState,
    pub reading: ReadingStatus,
    pub alert: AlertEpisode,
    pub updated_at: DateTime<Local>,
}

impl PublishedState {
    pub fn new(connection: ConnectionState, reading: ReadingStatus, alert: AlertEpisode) -> Self {
        Self {
            connection,
            reading,
            alert,
            updated_at: Local::now(),
        }
    }
}

impl Default for PublishedState {
    fn default() -> Self {
        Self::new(
            ConnectionState::Disconnected,
            ReadingStatus::Pending,
            AlertEpisode::Inactive,
        )
    }
}

/// Receives every replaced snapshot. Must return quickly.
pub trait PresentationSurface: Send + Sync {
    fn on_state_changed(&self, state: &PublishedState);
}

/// Renders the dashboard as log lines.
#[derive(Debug, Default)]
pub struct LogSurface;

impl PresentationSurface for LogSurface {
    fn on_state_changed(&self, state: &PublishedState) {
        info!(
            "{} | Light Level: {} | {}",
            state.connection, state.reading, state.alert
        );
    }
}

#[derive(Clone)]
pub struct StatePublisher {
    sender: Arc<watch::Sender<Arc<PublishedState>>>,
    surfaces: Arc<[Arc<dyn PresentationSurface>]>,
}

impl StatePublisher {
    pub fn new(surfaces: Vec<Arc<dyn PresentationSurface>>) -> Self {
        let (sender, _) = watch::channel(Arc::new(PublishedState::default()));
        Self {
            sender: Arc::new(sender),
            surfaces: surfaces.into(),
        }
    }

    pub fn publish(&self, state: PublishedState) {
        let state = Arc::new(state);
        debug!(
            "Publishing state: {:?} / {} / {:?}",
            state.connection, state.reading, state.alert
        );
        self.sender.send_replace(state.clone());
        for surface in self.surfaces.iter() {
            surface.on_state_changed(&state);
        }
    }

    pub fn current(&self) -> Arc<PublishedState> {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<PublishedState>> {
        self.sender.subscribe()
    }
}

impl fmt::Debug for StatePublisher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StatePublisher")
            .field("current", &self.current())
            .field("surfaces", &self.surfaces.len())
            .finish()
    }
}
