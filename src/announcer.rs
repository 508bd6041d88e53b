//! Voice announcer collaborators.
//!
//! The alert machine only needs two things from a speech engine: whether it
//! is busy right now, and a fire-and-forget way to say something. Engine
//! failures stay inside the announcer and are only logged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, error, info, warn};

pub trait VoiceAnnouncer: Send + Sync {
    fn is_speaking(&self) -> bool;

    /// Starts speaking `utterance` and returns immediately.
    fn speak(&self, utterance: &str, dedupe_token: &str);
}

/// Writes announcements to the log instead of a speaker.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAnnouncer;

impl VoiceAnnouncer for LogAnnouncer {
    fn is_speaking(&self) -> bool {
        false
    }

    fn speak(&self, utterance: &str, dedupe_token: &str) {
        info!("Announcement [{}]: {}", dedupe_token, utterance);
    }
}

/// Speaks through an external text-to-speech program such as `espeak`.
///
/// The utterance is passed as the last argument. The announcer reports
/// itself as speaking until the child process exits.
#[derive(Debug, Clone)]
pub struct CommandAnnouncer {
    program: String,
    args: Vec<String>,
    speaking: Arc<AtomicBool>,
}

impl CommandAnnouncer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            speaking: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Builds an announcer from a `[program, args...]` command line.
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }
}

impl VoiceAnnouncer for CommandAnnouncer {
    fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::Acquire)
    }

    fn speak(&self, utterance: &str, dedupe_token: &str) {
        if self.speaking.swap(true, Ordering::AcqRel) {
            debug!("Announcer busy, dropping {}", dedupe_token);
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!("Cannot announce {} outside a runtime: {}", dedupe_token, e);
                self.speaking.store(false, Ordering::Release);
                return;
            }
        };

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(utterance)
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to start {}: {}", self.program, e);
                self.speaking.store(false, Ordering::Release);
                return;
            }
        };

        debug!("Speaking {} via {}", dedupe_token, self.program);
        let speaking = self.speaking.clone();
        let program = self.program.clone();
        runtime.spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => warn!("{} exited with {}", program, status),
                Err(e) => error!("Failed to wait for {}: {}", program, e),
            }
            speaking.store(false, Ordering::Release);
        });
    }
}
