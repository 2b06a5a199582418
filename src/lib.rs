//! The Small POS - offline order store and sync engine
//!
//! Orders taken at the terminal are written to an on-device SQLite store and
//! recorded in a durable mutation queue. The reconciler replays that queue
//! against the admin dashboard whenever the terminal is online; the
//! scheduler decides when. [`SyncServices`] wires the pieces together around
//! a single shared store.

pub mod api;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod orders;
pub mod queue;
pub mod scheduler;
pub mod sync;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use api::{HttpOrderApi, RemoteOrderApi};
pub use config::SyncConfig;
pub use connectivity::{spawn_health_probe, Connectivity};
pub use db::{LocalStore, StorePath};
pub use error::{RemoteError, StoreError};
pub use models::{
    AbandonedMutation, MutationKind, Order, OrderFilter, OrderItem, OrderStatus, OrderType,
    PendingMutation,
};
pub use orders::{NewOrder, NewOrderItem, OrderBook, OrderDeletion};
pub use queue::{Enqueued, MutationQueue};
pub use scheduler::{SchedulerHandle, SyncScheduler};
pub use sync::{AttemptResult, MutationOutcome, Reconciler, SyncReport, SyncStatus};

/// Composition root: one store shared by the queue, the order book and the
/// reconciler.
pub struct SyncServices {
    pub store: Arc<LocalStore>,
    pub queue: MutationQueue,
    pub orders: OrderBook,
    pub connectivity: Connectivity,
    pub reconciler: Arc<Reconciler>,
    api: Arc<dyn RemoteOrderApi>,
    config: SyncConfig,
}

impl SyncServices {
    /// Open (and migrate) the store and build the services on top of it.
    /// The terminal starts offline until something reports otherwise.
    pub async fn open(
        store_path: StorePath,
        config: SyncConfig,
        api: Arc<dyn RemoteOrderApi>,
    ) -> Result<Self, StoreError> {
        let store = Arc::new(LocalStore::new(store_path));
        let applied = store.open().await?;
        if applied > 0 {
            info!("Applied {applied} schema migration(s)");
        }

        let connectivity = Connectivity::new(false);
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            api.clone(),
            connectivity.clone(),
            config.max_attempts,
        ));
        let status = reconciler.refresh_status().await?;
        info!(pending = status.pending, "Sync services ready");

        Ok(Self {
            queue: MutationQueue::new(store.clone()),
            orders: OrderBook::new(store.clone()),
            store,
            connectivity,
            reconciler,
            api,
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Start scheduled reconciliation at the configured interval.
    pub fn start_scheduler(&self) -> SchedulerHandle {
        SyncScheduler::start(
            self.reconciler.clone(),
            self.connectivity.clone(),
            self.config.interval(),
        )
    }

    /// Feed connectivity from the remote health endpoint until `cancel`.
    pub fn start_health_probe(&self, cancel: CancellationToken) -> JoinHandle<()> {
        spawn_health_probe(
            self.connectivity.clone(),
            self.api.clone(),
            self.config.health_check_interval(),
            cancel,
        )
    }

    /// Run one pass right away (e.g. a "sync now" button).
    pub async fn sync_now(&self) -> SyncReport {
        self.reconciler.run_pass().await
    }

    pub fn status(&self) -> SyncStatus {
        self.reconciler.status()
    }

    /// Release the store handle. Any later operation reopens it.
    pub async fn close(&self) {
        self.store.close().await;
    }
}
