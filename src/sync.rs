//! Reconciler: replays the mutation queue against the admin dashboard.
//!
//! One pass drains a snapshot of the queue and attempts each mutation in
//! FIFO order, one at a time. Remote failures never escape a pass; they turn
//! into per-mutation [`AttemptResult`]s. Storage failures end the pass early
//! and are logged.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{extract_remote_id, RemoteOrderApi};
use crate::connectivity::Connectivity;
use crate::db::{delete_order_cascade_in, get_in, mark_synced_in, LocalStore};
use crate::error::{RemoteError, StoreError};
use crate::models::{MutationKind, PendingMutation};
use crate::queue::{enqueue_in, remove_if_revision_in, MutationQueue};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Result of one attempt at one mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptResult {
    /// The remote system acknowledged the write.
    Confirmed,
    /// Failed; stays queued with the updated failure count.
    #[serde(rename_all = "camelCase")]
    RetryScheduled { retry_count: u32, error: String },
    /// Failed for the last time and moved to the dead-letter table. The
    /// local order keeps `synced = 0`.
    Abandoned { reason: String },
    /// Failed, but a local write cancelled the mutation during the call.
    /// Nothing is left to retry.
    Withdrawn { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationOutcome {
    pub mutation_id: String,
    pub order_id: String,
    pub kind: MutationKind,
    pub result: AttemptResult,
}

/// Aggregate counts of one pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub success: usize,
    /// Retried plus abandoned attempts. Withdrawn mutations count as neither.
    pub failed: usize,
    pub outcomes: Vec<MutationOutcome>,
    /// Another pass was already running; nothing was attempted.
    pub skipped: bool,
}

impl SyncReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    fn record(&mut self, mutation: &PendingMutation, result: AttemptResult) {
        match result {
            AttemptResult::Confirmed => self.success += 1,
            AttemptResult::RetryScheduled { .. } | AttemptResult::Abandoned { .. } => {
                self.failed += 1
            }
            AttemptResult::Withdrawn { .. } => {}
        }
        self.outcomes.push(MutationOutcome {
            mutation_id: mutation.id.clone(),
            order_id: mutation.order_id.clone(),
            kind: mutation.kind,
            result,
        });
    }

    pub fn abandoned(&self) -> impl Iterator<Item = &MutationOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, AttemptResult::Abandoned { .. }))
    }
}

/// Snapshot published to the UI shell after every completed pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_report: Option<SyncReport>,
    pub pending: usize,
}

/// How a confirmed mutation was settled locally.
#[derive(Debug, PartialEq)]
enum Settled {
    /// Queue entry removed and the local order updated.
    Removed,
    /// A newer write was coalesced in during the call; it stays queued.
    Superseded,
    /// The entry was withdrawn locally during the call.
    Withdrawn,
}

pub struct Reconciler {
    store: Arc<LocalStore>,
    queue: MutationQueue,
    api: Arc<dyn RemoteOrderApi>,
    connectivity: Connectivity,
    max_attempts: u32,
    pass_lock: Mutex<()>,
    status: watch::Sender<SyncStatus>,
}

impl Reconciler {
    pub fn new(
        store: Arc<LocalStore>,
        api: Arc<dyn RemoteOrderApi>,
        connectivity: Connectivity,
        max_attempts: u32,
    ) -> Self {
        let (status, _rx) = watch::channel(SyncStatus::default());
        Self {
            queue: MutationQueue::new(store.clone()),
            store,
            api,
            connectivity,
            max_attempts: max_attempts.max(1),
            pass_lock: Mutex::new(()),
            status,
        }
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Recount the pending queue into the published status.
    pub async fn refresh_status(&self) -> Result<SyncStatus, StoreError> {
        let pending = self.queue.len().await?;
        self.status.send_modify(|s| s.pending = pending);
        Ok(self.status())
    }

    /// Run one reconciliation pass.
    ///
    /// Offline: returns an empty report without touching the queue. A pass
    /// that finds another one in progress returns at once with `skipped`.
    pub async fn run_pass(&self) -> SyncReport {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            debug!("Sync pass already running, skipping");
            return SyncReport::skipped();
        };

        if !self.connectivity.is_online() {
            debug!("Offline, deferring sync and keeping queue pending");
            return SyncReport::default();
        }

        let mut report = SyncReport::default();
        let snapshot = match self.queue.drain_ordered().await {
            Ok(s) => s,
            Err(e) => {
                warn!(code = e.code(), "Sync pass could not read the queue: {e}");
                return report;
            }
        };

        for mutation in &snapshot {
            match self.attempt(mutation).await {
                Ok(result) => report.record(mutation, result),
                Err(e) => {
                    warn!(
                        mutation_id = %mutation.id,
                        code = e.code(),
                        "Sync pass aborted on storage error: {e}"
                    );
                    break;
                }
            }
        }

        if report.success > 0 || report.failed > 0 {
            info!(
                success = report.success,
                failed = report.failed,
                "Sync pass complete"
            );
        }
        self.publish(&report).await;
        report
    }

    async fn publish(&self, report: &SyncReport) {
        let pending = match self.queue.len().await {
            Ok(n) => n,
            Err(e) => {
                warn!("Could not count pending mutations: {e}");
                self.status.borrow().pending
            }
        };
        self.status.send_replace(SyncStatus {
            last_sync_at: Some(Utc::now()),
            last_report: Some(report.clone()),
            pending,
        });
    }

    /// Attempt one mutation and settle the local state.
    async fn attempt(&self, mutation: &PendingMutation) -> Result<AttemptResult, StoreError> {
        let remote = match mutation.kind {
            MutationKind::CreateOrder => {
                self.api
                    .create_order(&mutation.payload, &mutation.id)
                    .await
            }
            MutationKind::UpdateOrder => {
                self.api
                    .update_order(&mutation.order_id, &mutation.payload, &mutation.id)
                    .await
            }
            MutationKind::DeleteOrder => self
                .api
                .delete_order(&mutation.order_id, &mutation.id)
                .await
                .map(|()| Value::Null),
        };

        match remote {
            Ok(response) => {
                let remote_id = extract_remote_id(&response);
                let settled = self
                    .store
                    .transaction(|tx| settle_confirmed_in(tx, mutation, remote_id.as_deref()))
                    .await?;
                info!(
                    mutation_id = %mutation.id,
                    order_id = %mutation.order_id,
                    kind = mutation.kind.as_str(),
                    settled = ?settled,
                    "Mutation confirmed"
                );
                Ok(AttemptResult::Confirmed)
            }
            Err(err) => self.record_failure(mutation, &err).await,
        }
    }

    /// The failing attempt counts: a mutation is abandoned on the attempt
    /// that brings its failures to `max_attempts`.
    async fn record_failure(
        &self,
        mutation: &PendingMutation,
        err: &RemoteError,
    ) -> Result<AttemptResult, StoreError> {
        let error = err.to_string();
        let Some(failures) = self.queue.bump_retry(&mutation.id, Some(error.as_str())).await? else {
            debug!(mutation_id = %mutation.id, "Mutation withdrawn during failed attempt");
            return Ok(AttemptResult::Withdrawn { error });
        };

        if failures >= self.max_attempts {
            let reason = format!("{error} (after {failures} attempts)");
            self.queue.abandon(&mutation.id, &reason).await?;
            return Ok(AttemptResult::Abandoned { reason });
        }

        warn!(
            mutation_id = %mutation.id,
            order_id = %mutation.order_id,
            kind = mutation.kind.as_str(),
            retry_count = failures,
            "Sync attempt failed, will retry: {error}"
        );
        Ok(AttemptResult::RetryScheduled {
            retry_count: failures,
            error,
        })
    }
}

/// Apply a remote acknowledgment to the local store, in one transaction.
///
/// When a newer write was coalesced into the entry during the call, the
/// entry stays queued under a fresh id (so its idempotency key differs from
/// the one the server already saw) and its kind is corrected for the new
/// remote state: a confirmed create turns a pending create into an update,
/// a confirmed delete turns a pending update into a create. The re-keyed
/// entry starts over with no failures. A repeated delete is already done
/// and settles like the first one. A create whose entry was cancelled by a
/// local delete meanwhile queues a remote delete.
fn settle_confirmed_in(
    conn: &Connection,
    mutation: &PendingMutation,
    remote_id: Option<&str>,
) -> Result<Settled, StoreError> {
    if remove_if_revision_in(conn, &mutation.id, mutation.revision)? {
        match mutation.kind {
            MutationKind::CreateOrder | MutationKind::UpdateOrder => {
                mark_synced_in(conn, &mutation.order_id, remote_id)?;
            }
            MutationKind::DeleteOrder => {
                delete_order_cascade_in(conn, &mutation.order_id)?;
            }
        }
        return Ok(Settled::Removed);
    }

    let live: Option<PendingMutation> = get_in(conn, &mutation.id)?;
    let Some(live) = live else {
        if mutation.kind == MutationKind::CreateOrder {
            let payload = json!({ "id": mutation.order_id, "remoteId": remote_id });
            enqueue_in(
                conn,
                MutationKind::DeleteOrder,
                &mutation.order_id,
                payload,
                Utc::now(),
            )?;
            info!(order_id = %mutation.order_id, "Created order was deleted locally, queued remote delete");
        }
        return Ok(Settled::Withdrawn);
    };

    let kind = match (mutation.kind, live.kind) {
        (MutationKind::DeleteOrder, MutationKind::DeleteOrder) => {
            conn.execute("DELETE FROM pending_mutations WHERE id = ?1", params![live.id])?;
            delete_order_cascade_in(conn, &mutation.order_id)?;
            return Ok(Settled::Removed);
        }
        (MutationKind::CreateOrder, MutationKind::CreateOrder) => MutationKind::UpdateOrder,
        (MutationKind::DeleteOrder, MutationKind::UpdateOrder) => MutationKind::CreateOrder,
        (_, live_kind) => live_kind,
    };
    conn.execute(
        "UPDATE pending_mutations
         SET id = ?2, kind = ?3, retry_count = 0, last_error = NULL
         WHERE id = ?1",
        params![live.id, Uuid::new_v4().to_string(), kind.as_str()],
    )?;
    if let Some(remote_id) = remote_id {
        conn.execute(
            "UPDATE orders SET remote_id = ?2 WHERE id = ?1",
            params![mutation.order_id, remote_id],
        )?;
    }
    debug!(
        order_id = %mutation.order_id,
        kind = kind.as_str(),
        "Newer write arrived during sync, keeping it queued"
    );
    Ok(Settled::Superseded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Order, OrderFilter, OrderItem};
    use crate::orders::{NewOrder, NewOrderItem, OrderBook, OrderDeletion};
    use crate::queue::Enqueued;
    use crate::test_support::{at_ms, item, order, ScriptedApi};
    use async_trait::async_trait;

    fn transport(msg: &str) -> RemoteError {
        RemoteError::Transport(msg.to_string())
    }

    fn setup(api: Arc<ScriptedApi>, online: bool) -> (Reconciler, Arc<LocalStore>) {
        let store = Arc::new(LocalStore::in_memory());
        let reconciler = Reconciler::new(
            store.clone(),
            api,
            Connectivity::new(online),
            DEFAULT_MAX_ATTEMPTS,
        );
        (reconciler, store)
    }

    fn new_order(table: &str) -> NewOrder {
        NewOrder {
            order_type: crate::models::OrderType::DineIn,
            status: crate::models::OrderStatus::Pending,
            customer_name: None,
            customer_phone: None,
            table_number: Some(table.into()),
            delivery_address: None,
            tax_amount: 0.5,
            details: Value::Null,
            items: vec![NewOrderItem {
                menu_item_id: Some("menu-tea".into()),
                name: "Tea".into(),
                quantity: 1,
                unit_price: 2.0,
                notes: None,
            }],
        }
    }

    async fn put_order_with_items(store: &LocalStore, id: &str) {
        store.put(&order(id)).await.unwrap();
        store.put(&item(&format!("{id}-i1"), id)).await.unwrap();
        store.put(&item(&format!("{id}-i2"), id)).await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_pass_is_noop() {
        let api = Arc::new(ScriptedApi::ok());
        let (reconciler, store) = setup(api.clone(), false);
        put_order_with_items(&store, "O1").await;
        reconciler
            .queue()
            .enqueue(MutationKind::CreateOrder, "O1", json!({"id": "O1"}))
            .await
            .unwrap();
        let before = reconciler.queue().drain_ordered().await.unwrap();

        let report = reconciler.run_pass().await;

        assert_eq!(report, SyncReport::default());
        assert!(api.calls().is_empty());
        assert_eq!(reconciler.queue().drain_ordered().await.unwrap(), before);
        assert_eq!(reconciler.status().last_sync_at, None);
    }

    #[tokio::test]
    async fn test_orders_created_offline_sync_once_online() {
        let api = Arc::new(ScriptedApi::ok());
        let (reconciler, store) = setup(api.clone(), false);
        let book = OrderBook::new(store.clone());
        let o1 = book.create_order(new_order("1")).await.unwrap();
        let o2 = book.create_order(new_order("2")).await.unwrap();

        assert_eq!(reconciler.run_pass().await.success, 0);
        assert_eq!(reconciler.queue().len().await.unwrap(), 2);

        reconciler.connectivity().set_online(true);
        let report = reconciler.run_pass().await;

        assert_eq!(report.success, 2);
        assert_eq!(report.failed, 0);
        assert!(reconciler.queue().is_empty().await.unwrap());
        let unsynced = store.get_all_orders(&OrderFilter::unsynced()).await.unwrap();
        assert!(unsynced.is_empty());
        for id in [&o1.id, &o2.id] {
            let stored: Order = store.get(id).await.unwrap().unwrap();
            assert!(stored.synced);
            assert!(stored.last_synced_at.is_some());
            assert_eq!(stored.remote_id, Some(format!("remote-{id}")));
        }
    }

    #[tokio::test]
    async fn test_idempotency_key_is_mutation_id() {
        let api = Arc::new(ScriptedApi::ok());
        let (reconciler, store) = setup(api.clone(), true);
        put_order_with_items(&store, "O1").await;
        let queued = reconciler
            .queue()
            .enqueue(MutationKind::UpdateOrder, "O1", json!({"status": "ready"}))
            .await
            .unwrap();

        reconciler.run_pass().await;

        let calls = api.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, MutationKind::UpdateOrder);
        assert_eq!(calls[0].order_id, "O1");
        assert_eq!(
            calls[0].idempotency_key,
            queued.mutation().unwrap().id
        );
    }

    #[tokio::test]
    async fn test_retry_bound_is_exactly_three_failures() {
        let api = Arc::new(ScriptedApi::failing());
        let (reconciler, store) = setup(api.clone(), true);
        put_order_with_items(&store, "O1").await;
        let queued = reconciler
            .queue()
            .enqueue(MutationKind::CreateOrder, "O1", json!({"id": "O1"}))
            .await
            .unwrap();
        let id = queued.mutation().unwrap().id.clone();

        let first = reconciler.run_pass().await;
        assert_eq!(first.failed, 1);
        assert!(matches!(
            first.outcomes[0].result,
            AttemptResult::RetryScheduled { retry_count: 1, .. }
        ));

        let second = reconciler.run_pass().await;
        assert!(matches!(
            second.outcomes[0].result,
            AttemptResult::RetryScheduled { retry_count: 2, .. }
        ));
        let still = reconciler.queue().get(&id).await.unwrap().unwrap();
        assert_eq!(still.retry_count, 2);
        assert!(still.last_error.is_some());

        let third = reconciler.run_pass().await;
        assert_eq!(third.failed, 1);
        assert!(matches!(
            third.outcomes[0].result,
            AttemptResult::Abandoned { .. }
        ));
        assert_eq!(third.abandoned().count(), 1);

        // Gone from the queue, local order untouched and unsynced.
        assert!(reconciler.queue().is_empty().await.unwrap());
        let o1: Order = store.get("O1").await.unwrap().unwrap();
        assert!(!o1.synced);
        assert_eq!(store.get_items_for_order("O1").await.unwrap().len(), 2);
        assert_eq!(api.calls_for("O1"), 3);

        let dead = reconciler.queue().abandoned().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
        assert_eq!(dead[0].retry_count, 3);
        assert!(dead[0].reason.contains("after 3 attempts"));

        // A fourth pass has nothing left to try.
        let fourth = reconciler.run_pass().await;
        assert_eq!((fourth.success, fourth.failed), (0, 0));
        assert_eq!(api.calls_for("O1"), 3);
    }

    #[tokio::test]
    async fn test_failed_update_does_not_block_later_delete() {
        let api = Arc::new(ScriptedApi::ok());
        let (reconciler, store) = setup(api.clone(), true);
        put_order_with_items(&store, "O1").await;
        put_order_with_items(&store, "O2").await;
        let queue = reconciler.queue();
        queue
            .enqueue_at(MutationKind::UpdateOrder, "O1", json!({"status": "ready"}), at_ms(100))
            .await
            .unwrap();
        queue
            .enqueue_at(MutationKind::DeleteOrder, "O2", json!({"id": "O2"}), at_ms(200))
            .await
            .unwrap();
        api.script("O1", vec![Err(transport("connection reset"))]);

        let report = reconciler.run_pass().await;

        assert_eq!((report.success, report.failed), (1, 1));
        assert_eq!(store.get::<Order>("O2").await.unwrap(), None);
        assert!(store.get_items_for_order("O2").await.unwrap().is_empty());
        assert!(store.get::<Order>("O1").await.unwrap().is_some());

        let remaining = queue.drain_ordered().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].order_id, "O1");
        assert_eq!(remaining[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_fifo_position_survives_retry() {
        let api = Arc::new(ScriptedApi::ok());
        let (reconciler, store) = setup(api.clone(), true);
        for id in ["A", "B", "C"] {
            store.put(&order(id)).await.unwrap();
        }
        let queue = reconciler.queue();
        queue
            .enqueue_at(MutationKind::UpdateOrder, "A", json!({}), at_ms(100))
            .await
            .unwrap();
        queue
            .enqueue_at(MutationKind::UpdateOrder, "B", json!({}), at_ms(200))
            .await
            .unwrap();
        api.script("A", vec![Err(transport("timeout"))]);

        reconciler.run_pass().await;
        queue
            .enqueue_at(MutationKind::UpdateOrder, "C", json!({}), at_ms(300))
            .await
            .unwrap();

        let order: Vec<String> = queue
            .drain_ordered()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.order_id)
            .collect();
        assert_eq!(order, vec!["A", "C"]);

        let report = reconciler.run_pass().await;
        let attempted: Vec<&str> = report.outcomes.iter().map(|o| o.order_id.as_str()).collect();
        assert_eq!(attempted, vec!["A", "C"]);
        assert_eq!(report.success, 2);
    }

    #[tokio::test]
    async fn test_overlapping_pass_is_skipped() {
        let api = Arc::new(ScriptedApi::ok());
        let (reconciler, store) = setup(api.clone(), true);
        store.put(&order("O1")).await.unwrap();
        reconciler
            .queue()
            .enqueue(MutationKind::UpdateOrder, "O1", json!({}))
            .await
            .unwrap();

        let guard = reconciler.pass_lock.try_lock().unwrap();
        let report = reconciler.run_pass().await;
        assert!(report.skipped);
        assert!(api.calls().is_empty());
        drop(guard);

        let report = reconciler.run_pass().await;
        assert!(!report.skipped);
        assert_eq!(report.success, 1);
    }

    #[tokio::test]
    async fn test_status_published_after_pass() {
        let api = Arc::new(ScriptedApi::ok());
        let (reconciler, store) = setup(api.clone(), true);
        put_order_with_items(&store, "O1").await;
        reconciler
            .queue()
            .enqueue(MutationKind::UpdateOrder, "O1", json!({}))
            .await
            .unwrap();
        assert_eq!(reconciler.refresh_status().await.unwrap().pending, 1);

        let mut rx = reconciler.subscribe_status();
        reconciler.run_pass().await;
        assert!(rx.has_changed().unwrap());
        let status = rx.borrow_and_update().clone();
        assert!(status.last_sync_at.is_some());
        assert_eq!(status.pending, 0);
        assert_eq!(status.last_report.unwrap().success, 1);
    }

    #[tokio::test]
    async fn test_requeued_abandoned_mutation_syncs() {
        let api = Arc::new(ScriptedApi::failing());
        let (reconciler, store) = setup(api.clone(), true);
        put_order_with_items(&store, "O1").await;
        reconciler
            .queue()
            .enqueue(MutationKind::CreateOrder, "O1", json!({"id": "O1"}))
            .await
            .unwrap();
        for _ in 0..3 {
            reconciler.run_pass().await;
        }
        let dead = reconciler.queue().abandoned().await.unwrap();
        assert_eq!(dead.len(), 1);

        api.set_default_ok(true);
        reconciler.queue().requeue_abandoned(&dead[0].id).await.unwrap();
        let report = reconciler.run_pass().await;

        assert_eq!(report.success, 1);
        assert!(reconciler.queue().abandoned().await.unwrap().is_empty());
        let o1: Order = store.get("O1").await.unwrap().unwrap();
        assert!(o1.synced);
    }

    /// Local write made while a remote call is in flight.
    #[derive(Debug, Clone, Copy, PartialEq)]
    enum LocalWrite {
        EditDuringCreate,
        DeleteDuringCreate,
        DeleteDuringDelete,
    }

    struct InterleavingApi {
        book: OrderBook,
        inner: ScriptedApi,
        write: LocalWrite,
    }

    #[async_trait]
    impl RemoteOrderApi for InterleavingApi {
        async fn create_order(&self, payload: &Value, key: &str) -> Result<Value, RemoteError> {
            let id = payload["id"].as_str().unwrap_or_default().to_string();
            match self.write {
                LocalWrite::EditDuringCreate => {
                    let mut order = self.book.get_order(&id).await.unwrap().unwrap();
                    order.customer_name = Some("Late edit".into());
                    self.book.update_order(order).await.unwrap();
                }
                LocalWrite::DeleteDuringCreate => {
                    let outcome = self.book.delete_order(&id).await.unwrap();
                    assert_eq!(outcome, OrderDeletion::Removed);
                }
                LocalWrite::DeleteDuringDelete => {}
            }
            self.inner.create_order(payload, key).await
        }

        async fn update_order(
            &self,
            order_id: &str,
            payload: &Value,
            key: &str,
        ) -> Result<Value, RemoteError> {
            self.inner.update_order(order_id, payload, key).await
        }

        async fn delete_order(&self, order_id: &str, key: &str) -> Result<(), RemoteError> {
            if self.write == LocalWrite::DeleteDuringDelete {
                let outcome = self.book.delete_order(order_id).await.unwrap();
                assert_eq!(outcome, OrderDeletion::Pending);
            }
            self.inner.delete_order(order_id, key).await
        }
    }

    fn interleaving_setup(write: LocalWrite) -> (Reconciler, OrderBook, Arc<InterleavingApi>) {
        let store = Arc::new(LocalStore::in_memory());
        let book = OrderBook::new(store.clone());
        let api = Arc::new(InterleavingApi {
            book: book.clone(),
            inner: ScriptedApi::ok(),
            write,
        });
        let reconciler = Reconciler::new(store, api.clone(), Connectivity::new(true), 3);
        (reconciler, book, api)
    }

    #[tokio::test]
    async fn test_write_during_create_stays_queued_as_update() {
        let (reconciler, book, api) = interleaving_setup(LocalWrite::EditDuringCreate);
        let created = book.create_order(new_order("4")).await.unwrap();
        let original = reconciler.queue().drain_ordered().await.unwrap()[0].clone();

        let report = reconciler.run_pass().await;
        assert_eq!(report.success, 1);

        let live = reconciler.queue().drain_ordered().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].kind, MutationKind::UpdateOrder);
        assert_ne!(live[0].id, original.id);
        assert_eq!(live[0].enqueued_at, original.enqueued_at);
        assert_eq!(live[0].payload["customerName"], "Late edit");

        let stored = book.get_order(&created.id).await.unwrap().unwrap();
        assert!(!stored.synced);
        assert_eq!(stored.remote_id, Some(format!("remote-{}", created.id)));

        // The follow-up goes out as a PATCH under a new key.
        let report = reconciler.run_pass().await;
        assert_eq!(report.success, 1);
        let calls = api.inner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].kind, MutationKind::UpdateOrder);
        assert_ne!(calls[0].idempotency_key, calls[1].idempotency_key);
        assert!(book.get_order(&created.id).await.unwrap().unwrap().synced);
    }

    #[tokio::test]
    async fn test_delete_during_create_queues_remote_delete() {
        let (reconciler, book, _api) = interleaving_setup(LocalWrite::DeleteDuringCreate);
        let created = book.create_order(new_order("5")).await.unwrap();

        let report = reconciler.run_pass().await;
        assert_eq!(report.success, 1);
        assert_eq!(book.get_order(&created.id).await.unwrap(), None);

        let live = reconciler.queue().drain_ordered().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].kind, MutationKind::DeleteOrder);
        assert_eq!(live[0].order_id, created.id);
        assert_eq!(live[0].payload["remoteId"], format!("remote-{}", created.id));
    }

    #[tokio::test]
    async fn test_superseded_entry_starts_with_fresh_retry_budget() {
        let (reconciler, book, api) = interleaving_setup(LocalWrite::EditDuringCreate);
        let created = book.create_order(new_order("6")).await.unwrap();
        api.inner.script(
            &created.id,
            vec![
                Err(transport("timeout")),
                Err(transport("timeout")),
                Ok(()),
                Err(transport("connection reset")),
            ],
        );

        for expected in [1, 2] {
            let report = reconciler.run_pass().await;
            assert_eq!(
                report.outcomes[0].result,
                AttemptResult::RetryScheduled {
                    retry_count: expected,
                    error: transport("timeout").to_string(),
                }
            );
        }

        // Third create lands while an edit is coalesced in.
        let report = reconciler.run_pass().await;
        assert_eq!(report.success, 1);
        let live = reconciler.queue().drain_ordered().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].kind, MutationKind::UpdateOrder);
        assert_eq!(live[0].retry_count, 0);
        assert_eq!(live[0].last_error, None);

        // One failed update is a first failure, not the third.
        let report = reconciler.run_pass().await;
        assert!(matches!(
            report.outcomes[0].result,
            AttemptResult::RetryScheduled { retry_count: 1, .. }
        ));
        assert_eq!(report.abandoned().count(), 0);
        assert!(reconciler.queue().abandoned().await.unwrap().is_empty());
        assert_eq!(reconciler.queue().len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_repeated_delete_during_delete_settles_locally() {
        let (reconciler, book, api) = interleaving_setup(LocalWrite::DeleteDuringDelete);
        let created = book.create_order(new_order("7")).await.unwrap();
        assert_eq!(reconciler.run_pass().await.success, 1);
        assert_eq!(
            book.delete_order(&created.id).await.unwrap(),
            OrderDeletion::Pending
        );

        let report = reconciler.run_pass().await;
        assert_eq!(report.success, 1);
        assert_eq!(book.get_order(&created.id).await.unwrap(), None);
        let items: Vec<OrderItem> = reconciler
            .queue()
            .store()
            .get_items_for_order(&created.id)
            .await
            .unwrap();
        assert!(items.is_empty());
        assert!(reconciler.queue().is_empty().await.unwrap());

        // No second DELETE goes out.
        let report = reconciler.run_pass().await;
        assert_eq!((report.success, report.failed), (0, 0));
        assert_eq!(api.inner.calls_for(&created.id), 2);
    }

    #[tokio::test]
    async fn test_delete_during_failed_create_is_withdrawn() {
        let (reconciler, book, api) = interleaving_setup(LocalWrite::DeleteDuringCreate);
        api.inner.set_default_ok(false);
        let created = book.create_order(new_order("8")).await.unwrap();

        let report = reconciler.run_pass().await;

        assert_eq!(report.outcomes.len(), 1);
        assert!(matches!(
            report.outcomes[0].result,
            AttemptResult::Withdrawn { .. }
        ));
        assert_eq!((report.success, report.failed), (0, 0));
        assert_eq!(report.abandoned().count(), 0);
        assert!(reconciler.queue().is_empty().await.unwrap());
        assert!(reconciler.queue().abandoned().await.unwrap().is_empty());
        assert_eq!(book.get_order(&created.id).await.unwrap(), None);
    }

    #[test]
    fn test_settle_keeps_superseded_delete_as_create() {
        let conn = crate::db::migrated_test_conn();
        let o1 = order("O1");
        crate::models::Record::upsert(&o1, &conn).unwrap();
        let first = match enqueue_in(&conn, MutationKind::DeleteOrder, "O1", json!({}), at_ms(1)).unwrap() {
            Enqueued::Appended(m) => m,
            other => panic!("unexpected {other:?}"),
        };
        enqueue_in(&conn, MutationKind::CreateOrder, "O1", json!({"id": "O1"}), at_ms(2)).unwrap();

        let settled = settle_confirmed_in(&conn, &first, None).unwrap();
        assert_eq!(settled, Settled::Superseded);
        let live: Vec<(String, String)> = conn
            .prepare("SELECT id, kind FROM pending_mutations")
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(live.len(), 1);
        assert_ne!(live[0].0, first.id);
        assert_eq!(live[0].1, "create_order");
        // Local order is kept until the create lands.
        let items: Vec<OrderItem> = crate::db::items_for_order_in(&conn, "O1").unwrap();
        assert!(items.is_empty());
        assert!(get_in::<Order>(&conn, "O1").unwrap().is_some());
    }
}
