//! # Alert State Machine
//!
//! Derives the "headlights needed" condition from the light level stream.
//! The comparison is a plain threshold without hysteresis: any reading below
//! the threshold is an alert, anything at or above it is not.
//!
//! ## Notification policy
//!
//! The announcer is asked to speak once per continuous alert episode. The
//! `notified` flag lives inside [`AlertEpisode::Active`], so it cannot be set
//! while the alert is inactive. It is cleared by:
//! - a reading at or above the threshold (episode ends)
//! - a payload that fails to decode
//! - any connection event (`Connected`, `ConnectionLost`, failed handshake)
//!
//! If the announcer is mid-utterance the request is dropped. There is no
//! queue and no retry; the episode still counts as notified.

use std::fmt;

use tracing::{debug, info};

use crate::announcer::VoiceAnnouncer;
use crate::mqtt::decoder::SensorReading;

pub const DEFAULT_UTTERANCE: &str = "Turn on headlight";
pub const DEFAULT_DEDUPE_TOKEN: &str = "headlight_on_utterance";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AlertEpisode {
    #[default]
    Inactive,
    Active {
        notified: bool,
    },
}

impl AlertEpisode {
    pub fn is_active(&self) -> bool {
        matches!(self, AlertEpisode::Active { .. })
    }

    pub fn is_notified(&self) -> bool {
        matches!(self, AlertEpisode::Active { notified: true })
    }

    fn without_notification(self) -> Self {
        match self {
            AlertEpisode::Inactive => AlertEpisode::Inactive,
            AlertEpisode::Active { .. } => AlertEpisode::Active { notified: false },
        }
    }
}

impl fmt::Display for AlertEpisode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AlertEpisode::Inactive => write!(f, "Headlights: OFF"),
            AlertEpisode::Active { .. } => write!(f, "Headlights: ON"),
        }
    }
}

/// What the announcer is told when an episode starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Announcement {
    pub utterance: String,
    pub dedupe_token: String,
}

impl Default for Announcement {
    fn default() -> Self {
        Self {
            utterance: DEFAULT_UTTERANCE.to_string(),
            dedupe_token: DEFAULT_DEDUPE_TOKEN.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnounceOutcome {
    Spoken,
    DroppedBusy,
}

#[derive(Debug)]
pub struct AlertMachine {
    threshold: i32,
    announcement: Announcement,
    episode: AlertEpisode,
}

impl AlertMachine {
    pub fn new(threshold: i32, announcement: Announcement) -> Self {
        Self {
            threshold,
            announcement,
            episode: AlertEpisode::Inactive,
        }
    }

    pub fn threshold(&self) -> i32 {
        self.threshold
    }

    pub fn episode(&self) -> AlertEpisode {
        self.episode
    }

    /// Applies one reading and returns the resulting episode.
    pub fn on_reading<A>(&mut self, reading: &SensorReading, announcer: &A) -> AlertEpisode
    where
        A: VoiceAnnouncer + ?Sized,
    {
        self.episode = if reading.value() < self.threshold {
            if !self.episode.is_notified() {
                let outcome = self.announce(announcer);
                debug!("Alert episode started at reading {}: {:?}", reading, outcome);
            }
            AlertEpisode::Active { notified: true }
        } else {
            if self.episode.is_active() {
                info!("Light level {} back above threshold {}", reading, self.threshold);
            }
            AlertEpisode::Inactive
        };
        self.episode
    }

    /// A payload could not be decoded: keep the alert, forget the announcement.
    pub fn on_decode_error(&mut self) -> AlertEpisode {
        self.episode = self.episode.without_notification();
        self.episode
    }

    /// Any connect, reconnect or connection loss starts a fresh notification window.
    pub fn on_connection_event(&mut self) -> AlertEpisode {
        self.episode = self.episode.without_notification();
        self.episode
    }

    fn announce<A>(&self, announcer: &A) -> AnnounceOutcome
    where
        A: VoiceAnnouncer + ?Sized,
    {
        if announcer.is_speaking() {
            debug!(
                "Announcer busy, dropping {}",
                self.announcement.dedupe_token
            );
            return AnnounceOutcome::DroppedBusy;
        }
        info!("Announcing: {}", self.announcement.utterance);
        announcer.speak(&self.announcement.utterance, &self.announcement.dedupe_token);
        AnnounceOutcome::Spoken
    }
}
