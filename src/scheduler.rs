//! Decides when the reconciler runs.
//!
//! One pass at start, one per interval tick, and one out-of-band pass on
//! every offline-to-online transition. Passes never overlap: the loop awaits
//! each pass, and the reconciler skips a pass that finds another running.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connectivity::Connectivity;
use crate::sync::Reconciler;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

pub struct SyncScheduler;

/// Teardown handle returned by [`SyncScheduler::start`].
pub struct SchedulerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SyncScheduler {
    /// Spawn the scheduling loop on the current tokio runtime.
    pub fn start(
        reconciler: Arc<Reconciler>,
        connectivity: Connectivity,
        interval: Duration,
    ) -> SchedulerHandle {
        let interval = if interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            interval
        };
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            info!("Sync scheduler started (interval: {}s)", interval.as_secs_f64());
            let mut online_rx = connectivity.subscribe();
            let mut was_online = *online_rx.borrow_and_update();

            // The first tick completes immediately and gives the start pass.
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut listening = true;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        run(&reconciler, "timer").await;
                    }
                    changed = online_rx.changed(), if listening => {
                        if changed.is_err() {
                            warn!("Connectivity source dropped, timer-only scheduling");
                            listening = false;
                            continue;
                        }
                        let online = *online_rx.borrow_and_update();
                        if online && !was_online {
                            run(&reconciler, "online").await;
                        }
                        was_online = online;
                    }
                }
            }
            info!("Sync scheduler stopped");
        });

        SchedulerHandle { cancel, task }
    }
}

async fn run(reconciler: &Reconciler, trigger: &'static str) {
    let report = reconciler.run_pass().await;
    debug!(
        trigger,
        success = report.success,
        failed = report.failed,
        skipped = report.skipped,
        "Scheduled sync pass finished"
    );
}

impl SchedulerHandle {
    /// Cancel future timer fires and the connectivity listener, then wait
    /// for the loop to exit. A pass already in flight runs to completion.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Sync scheduler task ended abnormally: {e}");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
