//! Durable FIFO of writes not yet confirmed by the admin dashboard.
//!
//! The queue lives in the `pending_mutations` table of the local store so it
//! survives restarts. Writes for the same order are coalesced into a single
//! live entry, which keeps its original position in the FIFO.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{delete_order_cascade_in, get_in, LocalStore};
use crate::error::StoreError;
use crate::models::{
    from_millis, to_millis, AbandonedMutation, Collection, MutationKind, PendingMutation, Record,
};

/// What happened to a write handed to the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    /// No live mutation existed for the order; a new entry was appended.
    Appended(PendingMutation),
    /// Folded into the order's live mutation, which keeps its position.
    Coalesced(PendingMutation),
    /// A delete cancelled a create that never reached the remote system.
    Cancelled { mutation_id: String },
}

impl Enqueued {
    pub fn mutation(&self) -> Option<&PendingMutation> {
        match self {
            Self::Appended(m) | Self::Coalesced(m) => Some(m),
            Self::Cancelled { .. } => None,
        }
    }
}

/// Kind of the merged mutation, or `None` when the pair cancels out.
fn coalesce(live: MutationKind, incoming: MutationKind) -> Option<MutationKind> {
    use MutationKind::*;
    match (live, incoming) {
        (CreateOrder, DeleteOrder) => None,
        (CreateOrder, _) => Some(CreateOrder),
        (UpdateOrder, DeleteOrder) => Some(DeleteOrder),
        (UpdateOrder, _) => Some(UpdateOrder),
        (DeleteOrder, DeleteOrder) => Some(DeleteOrder),
        (DeleteOrder, _) => Some(UpdateOrder),
    }
}

// ---------------------------------------------------------------------------
// Connection-level operations (composable inside a caller's transaction)
// ---------------------------------------------------------------------------

fn live_for_order_in(conn: &Connection, order_id: &str) -> rusqlite::Result<Option<PendingMutation>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM pending_mutations
             WHERE order_id = ?1
             ORDER BY enqueued_at ASC, rowid ASC
             LIMIT 1",
            PendingMutation::COLUMNS
        ),
        params![order_id],
        |row| PendingMutation::from_row(row),
    )
    .optional()
}

pub(crate) fn enqueue_in(
    conn: &Connection,
    kind: MutationKind,
    order_id: &str,
    payload: Value,
    at: DateTime<Utc>,
) -> Result<Enqueued, StoreError> {
    // Stored with millisecond precision
    let at = from_millis(to_millis(&at));
    let Some(mut live) = live_for_order_in(conn, order_id)? else {
        let mutation = PendingMutation {
            id: Uuid::new_v4().to_string(),
            kind,
            order_id: order_id.to_string(),
            payload,
            enqueued_at: at,
            retry_count: 0,
            last_error: None,
            revision: 0,
        };
        mutation.upsert(conn)?;
        debug!(
            mutation_id = %mutation.id,
            order_id = %order_id,
            kind = kind.as_str(),
            "Mutation enqueued"
        );
        return Ok(Enqueued::Appended(mutation));
    };

    match coalesce(live.kind, kind) {
        Some(merged) => {
            live.kind = merged;
            live.payload = payload;
            live.revision += 1;
            live.upsert(conn)?;
            debug!(
                mutation_id = %live.id,
                order_id = %order_id,
                kind = merged.as_str(),
                revision = live.revision,
                "Mutation coalesced into live entry"
            );
            Ok(Enqueued::Coalesced(live))
        }
        None => {
            conn.execute(
                "DELETE FROM pending_mutations WHERE id = ?1",
                params![live.id],
            )?;
            info!(
                mutation_id = %live.id,
                order_id = %order_id,
                "Unsynced create cancelled by delete"
            );
            Ok(Enqueued::Cancelled {
                mutation_id: live.id,
            })
        }
    }
}

/// Put a dead-letter entry back. It is older than any live entry for the
/// same order, so it merges underneath it: the live entry keeps its id,
/// position and payload and only takes the merged kind. A requeued create
/// under a live delete cancels both and drops the local order.
fn requeue_in(conn: &Connection, dead: AbandonedMutation) -> Result<Enqueued, StoreError> {
    let Some(mut live) = live_for_order_in(conn, &dead.order_id)? else {
        return enqueue_in(conn, dead.kind, &dead.order_id, dead.payload, Utc::now());
    };

    match coalesce(dead.kind, live.kind) {
        Some(merged) => {
            live.kind = merged;
            live.revision += 1;
            live.upsert(conn)?;
            debug!(
                mutation_id = %live.id,
                order_id = %live.order_id,
                kind = merged.as_str(),
                "Requeued mutation merged under live entry"
            );
            Ok(Enqueued::Coalesced(live))
        }
        None => {
            conn.execute(
                "DELETE FROM pending_mutations WHERE id = ?1",
                params![live.id],
            )?;
            delete_order_cascade_in(conn, &dead.order_id)?;
            info!(
                mutation_id = %live.id,
                order_id = %dead.order_id,
                "Requeued create cancelled by pending delete"
            );
            Ok(Enqueued::Cancelled {
                mutation_id: live.id,
            })
        }
    }
}

/// Remove only if no newer write was coalesced in since `revision` was read.
pub(crate) fn remove_if_revision_in(
    conn: &Connection,
    id: &str,
    revision: i64,
) -> rusqlite::Result<bool> {
    let removed = conn.execute(
        "DELETE FROM pending_mutations WHERE id = ?1 AND revision = ?2",
        params![id, revision],
    )?;
    Ok(removed > 0)
}

fn abandon_in(conn: &Connection, id: &str, reason: &str) -> rusqlite::Result<bool> {
    let moved = conn.execute(
        "INSERT OR REPLACE INTO abandoned_mutations (
             id, kind, order_id, payload, enqueued_at, retry_count, reason, abandoned_at
         )
         SELECT id, kind, order_id, payload, enqueued_at, retry_count, ?2, ?3
         FROM pending_mutations WHERE id = ?1",
        params![id, reason, to_millis(&Utc::now())],
    )?;
    conn.execute("DELETE FROM pending_mutations WHERE id = ?1", params![id])?;
    Ok(moved > 0)
}

// ---------------------------------------------------------------------------
// Queue handle
// ---------------------------------------------------------------------------

/// The pending-mutation collection of a [`LocalStore`].
#[derive(Clone)]
pub struct MutationQueue {
    store: Arc<LocalStore>,
}

impl MutationQueue {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Record a write with a fresh id, the current time and `retry_count = 0`
    /// (or fold it into the order's live mutation).
    pub async fn enqueue(
        &self,
        kind: MutationKind,
        order_id: &str,
        payload: Value,
    ) -> Result<Enqueued, StoreError> {
        self.enqueue_at(kind, order_id, payload, Utc::now()).await
    }

    pub async fn enqueue_at(
        &self,
        kind: MutationKind,
        order_id: &str,
        payload: Value,
        at: DateTime<Utc>,
    ) -> Result<Enqueued, StoreError> {
        self.store
            .transaction(|tx| enqueue_in(tx, kind, order_id, payload, at))
            .await
    }

    /// Snapshot of every live mutation, oldest `enqueued_at` first. Writes
    /// that land after the snapshot wait for the next drain.
    pub async fn drain_ordered(&self) -> Result<Vec<PendingMutation>, StoreError> {
        self.store
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM pending_mutations ORDER BY enqueued_at ASC, rowid ASC",
                    PendingMutation::COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], |row| PendingMutation::from_row(row))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<PendingMutation>, StoreError> {
        self.store.call(|conn| get_in(conn, id)).await
    }

    pub async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        self.store.delete::<PendingMutation>(id).await
    }

    pub async fn remove_if_revision(&self, id: &str, revision: i64) -> Result<bool, StoreError> {
        self.store
            .call(|conn| Ok(remove_if_revision_in(conn, id, revision)?))
            .await
    }

    /// Increment `retry_count` in place. `enqueued_at` is untouched, so the
    /// mutation keeps its FIFO position. Returns the new count, or `None` if
    /// the mutation no longer exists.
    pub async fn bump_retry(&self, id: &str, error: Option<&str>) -> Result<Option<u32>, StoreError> {
        self.store
            .call(|conn| {
                let count = conn
                    .query_row(
                        "UPDATE pending_mutations
                         SET retry_count = retry_count + 1,
                             last_error = COALESCE(?2, last_error)
                         WHERE id = ?1
                         RETURNING retry_count",
                        params![id, error],
                        |row| row.get::<_, u32>(0),
                    )
                    .optional()?;
                Ok(count)
            })
            .await
    }

    /// Move a mutation to the dead-letter table.
    pub async fn abandon(&self, id: &str, reason: &str) -> Result<bool, StoreError> {
        let moved = self
            .store
            .transaction(|tx| Ok(abandon_in(tx, id, reason)?))
            .await?;
        if moved {
            warn!(mutation_id = %id, reason = %reason, "Mutation abandoned after retries");
        }
        Ok(moved)
    }

    pub async fn abandoned(&self) -> Result<Vec<AbandonedMutation>, StoreError> {
        self.store
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM abandoned_mutations ORDER BY abandoned_at ASC, id ASC",
                    AbandonedMutation::COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], |row| AbandonedMutation::from_row(row))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    /// Put an abandoned mutation back on the queue with a fresh timestamp
    /// and a zero retry count, or merge it under the order's live entry.
    pub async fn requeue_abandoned(&self, id: &str) -> Result<Enqueued, StoreError> {
        let id = id.to_string();
        let requeued = self
            .store
            .transaction(|tx| {
                let dead = tx
                    .query_row(
                        &format!(
                            "SELECT {} FROM abandoned_mutations WHERE id = ?1",
                            AbandonedMutation::COLUMNS
                        ),
                        params![id],
                        |row| AbandonedMutation::from_row(row),
                    )
                    .optional()?
                    .ok_or_else(|| StoreError::NotFound(format!("abandoned mutation {id}")))?;
                tx.execute("DELETE FROM abandoned_mutations WHERE id = ?1", params![id])?;
                requeue_in(tx, dead)
            })
            .await?;
        info!(mutation_id = %id, "Abandoned mutation requeued");
        Ok(requeued)
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        self.store.count(Collection::PendingMutations).await
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Oldest live timestamp, for status reporting.
    pub async fn oldest_enqueued_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.store
            .call(|conn| {
                let ms: Option<i64> = conn.query_row(
                    "SELECT MIN(enqueued_at) FROM pending_mutations",
                    [],
                    |row| row.get(0),
                )?;
                Ok(ms.map(from_millis))
            })
            .await
    }
}
