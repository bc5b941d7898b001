use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use signal_core::{Identity, Presence, PresenceUpdate};
use std::{net::SocketAddr, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch, RwLock},
    time::Instant,
};
use tracing::debug;

pub const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("outbound queue full")]
    QueueFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessState {
    Unauthenticated,
    Authenticated,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub expiry: Duration,
}

#[derive(Debug, Clone, Default)]
struct SessionState {
    access_granted: bool,
    identity: Identity,
    presence: Presence,
}

pub struct Session {
    conn_id: String,
    remote: Option<SocketAddr>,
    sender: mpsc::Sender<Outbound>,
    connected_at: Instant,
    connected_at_utc: DateTime<Utc>,
    closed: watch::Sender<bool>,
    state: RwLock<SessionState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub conn_id: String,
    pub remote: Option<String>,
    pub access: AccessState,
    #[serde(flatten)]
    pub identity: Identity,
    #[serde(flatten)]
    pub presence: Presence,
    pub connected_at: String,
}

impl Session {
    pub fn new(
        conn_id: impl Into<String>,
        remote: Option<SocketAddr>,
        sender: mpsc::Sender<Outbound>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            conn_id: conn_id.into(),
            remote,
            sender,
            connected_at: Instant::now(),
            connected_at_utc: Utc::now(),
            closed,
            state: RwLock::new(SessionState::default()),
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub async fn access_state(&self) -> AccessState {
        if self.is_closed() {
            return AccessState::Closed;
        }
        if self.state.read().await.access_granted {
            AccessState::Authenticated
        } else {
            AccessState::Unauthenticated
        }
    }

    pub async fn is_authenticated(&self) -> bool {
        self.access_state().await == AccessState::Authenticated
    }

    pub async fn grant_access(&self) {
        if self.is_closed() {
            return;
        }
        self.state.write().await.access_granted = true;
    }

    pub async fn identity(&self) -> Identity {
        self.state.read().await.identity.clone()
    }

    pub async fn presence(&self) -> Presence {
        self.state.read().await.presence
    }

    pub async fn set_identity(&self, identity: Identity) {
        if self.is_closed() {
            return;
        }
        self.state.write().await.identity = identity;
    }

    pub async fn update_presence(&self, update: PresenceUpdate) {
        if self.is_closed() || update.is_empty() {
            return;
        }
        self.state.write().await.presence.apply(update);
    }

    pub async fn answers_to(&self, identity: &Identity) -> bool {
        if self.is_closed() {
            return false;
        }
        let state = self.state.read().await;
        state.access_granted && state.identity == *identity
    }

    /// Which timeout, if any, this session has outlived at `now`. The clock
    /// starts at connection acceptance and is never refreshed.
    pub async fn overdue(&self, now: Instant, timeouts: Timeouts) -> Option<&'static str> {
        if self.is_closed() {
            return None;
        }
        let age = now.saturating_duration_since(self.connected_at);
        if self.state.read().await.access_granted {
            (age > timeouts.expiry).then_some("session_expired")
        } else {
            (age > timeouts.connect).then_some("connect_timeout")
        }
    }

    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.enqueue(Outbound::Text(text))
    }

    pub fn send_json(&self, value: &Value) -> Result<(), TransportError> {
        self.send_text(value.to_string())
    }

    /// Marks the session closed and queues a close frame. Returns false when it
    /// was already closed, in which case nothing is sent.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        let first = self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if !first {
            return false;
        }
        if let Err(err) = self.enqueue(Outbound::Close {
            code,
            reason: reason.to_string(),
        }) {
            debug!(event = "close_frame_dropped", conn_id = %self.conn_id, error = %err);
        }
        true
    }

    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let access = self.access_state().await;
        let state = self.state.read().await;
        SessionSnapshot {
            conn_id: self.conn_id.clone(),
            remote: self.remote.map(|addr| addr.to_string()),
            access,
            identity: state.identity.clone(),
            presence: state.presence,
            connected_at: self.connected_at_utc.to_rfc3339(),
        }
    }

    fn enqueue(&self, frame: Outbound) -> Result<(), TransportError> {
        self.sender.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

#[cfg(test)]
pub(crate) fn test_session(conn_id: &str) -> (std::sync::Arc<Session>, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(16);
    (std::sync::Arc::new(Session::new(conn_id, None, tx)), rx)
}
