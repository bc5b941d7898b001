use crate::{
    session::Session,
    sweeper::{self, SweepConfig, SweeperHandle},
};
use signal_core::Identity;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct Registry {
    sweep: SweepConfig,
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: Vec<Arc<Session>>,
    sweeper: Option<SweeperHandle>,
}

impl Registry {
    pub fn new(sweep: SweepConfig) -> Self {
        Self {
            sweep,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub async fn add(self: &Arc<Self>, session: Arc<Session>) {
        let mut inner = self.inner.lock().await;
        if inner
            .sessions
            .iter()
            .any(|existing| existing.conn_id() == session.conn_id())
        {
            warn!(event = "duplicate_conn", conn_id = %session.conn_id());
            return;
        }
        inner.sessions.push(session.clone());
        if inner.sweeper.is_none() {
            inner.sweeper = Some(sweeper::spawn(Arc::downgrade(self), self.sweep));
            info!(
                event = "sweeper_start",
                interval_ms = self.sweep.interval.as_millis() as u64
            );
        }
        info!(
            event = "client_connected",
            conn_id = %session.conn_id(),
            active = inner.sessions.len()
        );
    }

    pub async fn remove(&self, conn_id: &str) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock().await;
        let index = inner
            .sessions
            .iter()
            .position(|session| session.conn_id() == conn_id)?;
        let session = inner.sessions.remove(index);
        if inner.sessions.is_empty() {
            if let Some(sweeper) = inner.sweeper.take() {
                sweeper.stop();
                info!(event = "sweeper_stop");
            }
        }
        Some(session)
    }

    pub async fn find_by_connection(&self, conn_id: &str) -> Option<Arc<Session>> {
        self.inner
            .lock()
            .await
            .sessions
            .iter()
            .find(|session| session.conn_id() == conn_id)
            .cloned()
    }

    pub async fn find_by_identity(
        &self,
        unique_id: &str,
        application_id: &str,
    ) -> Vec<Arc<Session>> {
        let identity = Identity::new(unique_id, application_id);
        let inner = self.inner.lock().await;
        let mut matches = Vec::new();
        for session in &inner.sessions {
            if session.answers_to(&identity).await {
                matches.push(session.clone());
            }
        }
        matches
    }

    pub async fn has_peers(&self, excluding: &str) -> bool {
        let inner = self.inner.lock().await;
        for session in &inner.sessions {
            if session.conn_id() != excluding && session.is_authenticated().await {
                return true;
            }
        }
        false
    }

    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner.lock().await.sessions.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    pub async fn sweeper_running(&self) -> bool {
        self.inner.lock().await.sweeper.is_some()
    }

    /// Closes the session and drops it from the registry. Safe to call from
    /// both the sweeper and the connection's own teardown.
    pub async fn close_session(&self, session: &Session, code: u16, reason: &str) -> bool {
        let closed_now = session.close(code, reason);
        if self.remove(session.conn_id()).await.is_some() {
            info!(
                event = "client_disconnected",
                conn_id = %session.conn_id(),
                reason = reason
            );
        }
        closed_now
    }
}
