//! Online/offline state.
//!
//! The flag is a `watch` channel so the scheduler can react to the
//! offline-to-online transition without polling.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::RemoteOrderApi;

/// Used when the configured probe interval is zero.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns `true` when the flag actually changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            if online {
                info!("Connectivity restored, terminal is online");
            } else {
                warn!("Connectivity lost, terminal is offline");
            }
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Poll `check_health` every `interval` and feed the result into
/// `connectivity` until `cancel` fires. A zero interval falls back to
/// [`DEFAULT_HEALTH_INTERVAL`].
pub fn spawn_health_probe(
    connectivity: Connectivity,
    api: Arc<dyn RemoteOrderApi>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = if interval.is_zero() {
        DEFAULT_HEALTH_INTERVAL
    } else {
        interval
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let healthy = api.check_health().await;
                    debug!(healthy, "Health probe");
                    connectivity.set_online(healthy);
                }
            }
        }
        debug!("Health probe stopped");
    })
}
