use crate::{
    registry::Registry,
    session::{Timeouts, CLOSE_NORMAL},
};
use futures_util::FutureExt;
use std::{any::Any, panic::AssertUnwindSafe, sync::Weak, time::Duration};
use tokio::{sync::watch, time::Instant};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    pub interval: Duration,
    pub timeouts: Timeouts,
}

pub struct SweeperHandle {
    stop: watch::Sender<bool>,
}

impl SweeperHandle {
    pub fn stop(self) {
        let _ = self.stop.send(true);
    }
}

// Holds only a weak reference; a dropped registry ends the task.
pub fn spawn(registry: Weak<Registry>, config: SweepConfig) -> SweeperHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        let start = Instant::now() + config.interval;
        let mut ticker = tokio::time::interval_at(start, config.interval);
        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
            }
            if *stop_rx.borrow() {
                break;
            }
            let Some(registry) = registry.upgrade() else {
                break;
            };
            let tick = AssertUnwindSafe(sweep_once(&registry, Instant::now(), config.timeouts))
                .catch_unwind()
                .await;
            match tick {
                Ok(closed) if closed > 0 => debug!(event = "sweep_done", closed = closed),
                Ok(_) => {}
                Err(panic) => error!(event = "sweep_panic", error = %panic_message(&*panic)),
            }
        }
        debug!(event = "sweeper_exit");
    });
    SweeperHandle { stop: stop_tx }
}

/// Returns how many sessions this pass closed.
pub async fn sweep_once(registry: &Registry, now: Instant, timeouts: Timeouts) -> usize {
    let mut closed = 0;
    for session in registry.snapshot().await {
        let Some(reason) = session.overdue(now, timeouts).await else {
            continue;
        };
        warn!(
            event = "sweep_close",
            conn_id = %session.conn_id(),
            reason = reason,
            age_ms = now.saturating_duration_since(session.connected_at()).as_millis() as u64
        );
        if registry.close_session(&session, CLOSE_NORMAL, reason).await {
            closed += 1;
        }
    }
    closed
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
