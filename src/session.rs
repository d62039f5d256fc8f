use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

use crate::{classifier::FailureKind, launcher::ClientProcess, profile::SessionConfig};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Connected,
    Failed,
    Closed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionSignal {
    Connect,
    Error { kind: FailureKind, message: String },
    Close,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Connected,
    Failed { kind: FailureKind, message: String },
}

impl Resolution {
    pub fn failed(kind: FailureKind, detail: impl AsRef<str>) -> Self {
        let detail = detail.as_ref().trim();
        let message = if detail.is_empty() {
            kind.summary().to_string()
        } else {
            format!("{}: {detail}", kind.summary())
        };
        Self::Failed { kind, message }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionArtifacts {
    pub profile_path: Option<PathBuf>,
    pub credential_target: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub id: String,
    pub state: SessionState,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub pid: Option<u32>,
    pub failure: Option<FailureKind>,
    pub live_timers: usize,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

pub struct Session {
    id: String,
    instance: Uuid,
    config: SessionConfig,
    state: SessionState,
    failure: Option<FailureKind>,
    pub(crate) process: Option<Box<dyn ClientProcess>>,
    artifacts: SessionArtifacts,
    timers: Vec<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(
        id: String,
        config: SessionConfig,
        process: Option<Box<dyn ClientProcess>>,
        artifacts: SessionArtifacts,
        signals: mpsc::UnboundedSender<SessionSignal>,
    ) -> Self {
        Self {
            id,
            instance: Uuid::new_v4(),
            config,
            state: SessionState::Pending,
            failure: None,
            process,
            artifacts,
            timers: Vec::new(),
            listener: None,
            signals,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &SessionArtifacts {
        &self.artifacts
    }

    pub fn live_timers(&self) -> usize {
        self.timers.iter().filter(|t| !t.is_finished()).count()
    }

    pub(crate) fn signals(&self) -> mpsc::UnboundedSender<SessionSignal> {
        self.signals.clone()
    }

    pub(crate) fn emit(&self, signal: SessionSignal) {
        // The caller may have stopped listening; that is not our failure.
        let _ = self.signals.send(signal);
    }

    /// Single-assignment transition out of `Pending`. Returns `false` (and
    /// does nothing) when the session already resolved or is closing.
    pub fn resolve(&mut self, resolution: Resolution) -> bool {
        if self.state != SessionState::Pending {
            return false;
        }
        self.cancel_timers();
        self.resolved_at = Some(Utc::now());
        match resolution {
            Resolution::Connected => {
                self.state = SessionState::Connected;
                self.emit(SessionSignal::Connect);
            }
            Resolution::Failed { kind, message } => {
                self.state = SessionState::Failed;
                self.failure = Some(kind);
                self.emit(SessionSignal::Error { kind, message });
            }
        }
        true
    }

    /// Moves to `Closed` and stops every timer. Returns `false` when some
    /// other path already owns the teardown.
    pub(crate) fn begin_close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.cancel_timers();
        self.state = SessionState::Closed;
        true
    }

    pub(crate) fn cancel_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }

    pub(crate) fn attach_timers(&mut self, timers: Vec<JoinHandle<()>>) {
        if self.state == SessionState::Pending {
            self.timers.extend(timers);
        } else {
            timers.into_iter().for_each(|t| t.abort());
        }
    }

    pub(crate) fn attach_listener(&mut self, listener: JoinHandle<()>) {
        if self.state == SessionState::Closed {
            listener.abort();
            return;
        }
        if let Some(previous) = self.listener.replace(listener) {
            previous.abort();
        }
    }

    pub(crate) fn abort_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            id: self.id.clone(),
            state: self.state,
            host: self.config.host.clone(),
            port: self.config.port,
            username: self.config.username.clone(),
            pid: self.process.as_ref().and_then(|p| p.pid()),
            failure: self.failure,
            live_timers: self.live_timers(),
            created_at: self.created_at,
            resolved_at: self.resolved_at,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}
