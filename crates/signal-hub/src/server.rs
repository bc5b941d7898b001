use crate::{
    config::Config,
    origin::OriginPolicy,
    registry::Registry,
    router::MessageRouter,
    session::{Outbound, Session, SessionSnapshot, CLOSE_NORMAL},
};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use signal_core::DEFAULT_MAX_FRAME_BYTES;
use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

// Upper bound on flushing queued frames once the reader has finished.
const WRITER_GRACE: Duration = Duration::from_secs(2);

pub struct HubState {
    config: Config,
    registry: Arc<Registry>,
    router: MessageRouter,
    origin: Arc<dyn OriginPolicy>,
    conn_counter: AtomicU64,
}

#[derive(Debug, Serialize)]
struct SessionsView {
    active: usize,
    sweeper_running: bool,
    sessions: Vec<SessionSnapshot>,
}

impl HubState {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(Registry::new(config.sweep()));
        let router = MessageRouter::new(config.access_token.clone(), DEFAULT_MAX_FRAME_BYTES);
        let origin = config.origin_policy();
        Self {
            config,
            registry,
            router,
            origin,
            conn_counter: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Outbound>(self.config.queue_capacity);
        let conn_id = self.next_conn_id();
        let session = Arc::new(Session::new(conn_id.clone(), Some(remote), tx));
        let writer_session = Arc::downgrade(&session);
        let write_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let (msg, last) = match frame {
                    Outbound::Text(text) => (Message::Text(text), false),
                    Outbound::Close { code, reason } => (
                        Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })),
                        true,
                    ),
                };
                if let Err(err) = ws_sender.send(msg).await {
                    // wakes the reader so teardown drops the session
                    if let Some(session) = writer_session.upgrade() {
                        warn!(event = "write_error", conn_id = %session.conn_id(), error = %err);
                        session.close(CLOSE_NORMAL, "send_error");
                    }
                    return;
                }
                if last {
                    return;
                }
            }
        });

        self.registry.add(session.clone()).await;
        debug!(event = "connection_accepted", conn_id = %conn_id, remote = %remote);

        loop {
            let next = tokio::select! {
                _ = session.closed() => break,
                next = ws_receiver.next() => next,
            };
            let msg = match next {
                Some(Ok(value)) => value,
                Some(Err(err)) => {
                    warn!(event = "read_error", conn_id = %conn_id, error = %err);
                    break;
                }
                None => break,
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if self.config.debug {
                debug!(event = "message_received", conn_id = %conn_id, raw = %String::from_utf8_lossy(&data));
            }
            if let Some(reply) = self.router.handle_frame(&self.registry, &session, &data).await {
                if let Err(err) = session.send_json(&reply) {
                    warn!(event = "send_error", conn_id = %conn_id, error = %err);
                }
            }
        }

        drop(session);
        match self.registry.find_by_connection(&conn_id).await {
            Some(session) => {
                self.registry
                    .close_session(&session, CLOSE_NORMAL, "disconnect")
                    .await;
            }
            None => debug!(event = "already_removed", conn_id = %conn_id),
        }
        if !drain_writer(write_task, WRITER_GRACE).await {
            warn!(event = "writer_stalled", conn_id = %conn_id);
        }
    }
}

/// Waits up to `grace` for the writer to flush, then aborts it. Returns false
/// when the writer had to be aborted.
async fn drain_writer(mut task: JoinHandle<()>, grace: Duration) -> bool {
    if tokio::time::timeout(grace, &mut task).await.is_ok() {
        return true;
    }
    task.abort();
    let _ = task.await;
    false
}

pub fn build_app(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/sessions", get(sessions_handler))
        .with_state(hub)
}

pub async fn serve<F>(listener: TcpListener, hub: Arc<HubState>, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        build_app(hub).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !hub.origin.allows(origin) {
        warn!(event = "origin_rejected", remote = %addr, origin = origin.unwrap_or(""));
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, addr).await;
    })
}

async fn sessions_handler(State(hub): State<Arc<HubState>>) -> Json<SessionsView> {
    let registered = hub.registry.snapshot().await;
    let mut sessions = Vec::with_capacity(registered.len());
    for session in &registered {
        sessions.push(session.snapshot().await);
    }
    Json(SessionsView {
        active: sessions.len(),
        sweeper_running: hub.registry.sweeper_running().await,
        sessions,
    })
}
