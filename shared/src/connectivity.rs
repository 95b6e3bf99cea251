//! Background health checking behind the connection banner.
//!
//! One task per monitor: it probes on start, then on every tick of the
//! configured interval, and whenever [`ConnectionMonitor::check_now`] asks.
//! The task is aborted when the monitor is dropped.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::ApiClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Unknown,
    Checking,
    Online,
    Offline,
}

impl ConnectionStatus {
    #[must_use]
    pub fn is_online(self) -> bool {
        self == ConnectionStatus::Online
    }
}

pub struct ConnectionMonitor {
    status: watch::Receiver<ConnectionStatus>,
    trigger: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl ConnectionMonitor {
    /// Must be called from within a tokio runtime.
    pub fn spawn(api: Arc<ApiClient>, interval: Duration) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Unknown);
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let interval = interval.max(Duration::from_millis(1));

        let task = tokio::spawn(run_monitor(api, interval, status_tx, trigger_rx));
        debug!(interval = ?interval, "connection monitor started");

        Self {
            status: status_rx,
            trigger: trigger_tx,
            task,
        }
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Queues an immediate probe. Requests made while one is already queued
    /// collapse into it.
    pub fn check_now(&self) {
        if self.trigger.try_send(()).is_err() {
            debug!("health check already queued");
        }
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

async fn run_monitor(
    api: Arc<ApiClient>,
    interval: Duration,
    status: watch::Sender<ConnectionStatus>,
    mut trigger: mpsc::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            Some(()) = trigger.recv() => {
                ticker.reset();
            }
        }

        let previous = *status.borrow();
        status.send_replace(ConnectionStatus::Checking);

        let next = if api.check_health().await {
            ConnectionStatus::Online
        } else {
            ConnectionStatus::Offline
        };

        if next != previous {
            match next {
                ConnectionStatus::Online => info!("backend reachable"),
                _ => warn!("backend unreachable"),
            }
        }
        status.send_replace(next);
    }
}
