//! Order writes coming from the POS UI.
//!
//! Every write persists the local change with `synced = 0` and enqueues the
//! matching mutation inside the same SQLite transaction, so an order can never
//! be saved without its queue entry (or the other way round).

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::db::{self, delete_order_cascade_in, get_in, items_for_order_in, LocalStore};
use crate::error::StoreError;
use crate::models::{from_millis, MutationKind, Order, OrderItem, OrderStatus, OrderType, Record};
use crate::queue::{enqueue_in, Enqueued};

/// Line item supplied by the UI when creating or editing an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderItem {
    pub menu_item_id: Option<String>,
    pub name: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub notes: Option<String>,
}

/// Order as captured at checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub order_type: OrderType,
    #[serde(default = "default_status")]
    pub status: OrderStatus,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub table_number: Option<String>,
    pub delivery_address: Option<String>,
    #[serde(default)]
    pub tax_amount: f64,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub items: Vec<NewOrderItem>,
}

fn default_status() -> OrderStatus {
    OrderStatus::Pending
}

/// Result of [`OrderBook::delete_order`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderDeletion {
    /// The order never reached the remote system; removed locally at once.
    Removed,
    /// A remote delete is queued; the local copy goes once it is confirmed.
    Pending,
}

/// Remote payload: the order plus its current items.
pub fn order_payload(order: &Order, items: &[OrderItem]) -> Result<Value, serde_json::Error> {
    let mut payload = order.to_payload();
    if let Value::Object(ref mut map) = payload {
        map.insert("items".to_string(), serde_json::to_value(items)?);
    }
    Ok(payload)
}

fn build_items(order_id: &str, items: &[NewOrderItem]) -> Vec<OrderItem> {
    items
        .iter()
        .map(|i| OrderItem {
            id: Uuid::new_v4().to_string(),
            order_id: order_id.to_string(),
            menu_item_id: i.menu_item_id.clone(),
            name: i.name.clone(),
            quantity: i.quantity,
            unit_price: i.unit_price,
            total_price: i.unit_price * i.quantity as f64,
            notes: i.notes.clone(),
        })
        .collect()
}

/// Generate a sequential order number in format ORD-DDMMYYYY-NNNNN.
///
/// Uses `local_settings` (category='orders', key='order_counter') as a
/// persistent counter.
fn next_order_number(conn: &Connection) -> Result<String, StoreError> {
    let date_display = chrono::Local::now().format("%d%m%Y").to_string();

    let current = db::get_setting(conn, "orders", "order_counter")?
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);
    let next = current + 1;
    db::set_setting(conn, "orders", "order_counter", &next.to_string())?;

    Ok(format!("ORD-{}-{:05}", date_display, next))
}

fn require_order(conn: &Connection, order_id: &str) -> Result<Order, StoreError> {
    get_in::<Order>(conn, order_id)?.ok_or_else(|| StoreError::NotFound(format!("order {order_id}")))
}

/// UI-facing write path over the local store and its mutation queue.
#[derive(Clone)]
pub struct OrderBook {
    store: Arc<LocalStore>,
}

impl OrderBook {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// Create an order locally and enqueue `create_order` for it.
    pub async fn create_order(&self, new_order: NewOrder) -> Result<Order, StoreError> {
        let order = self
            .store
            .transaction(|tx| {
                let now = from_millis(Utc::now().timestamp_millis());
                let id = Uuid::new_v4().to_string();
                let items = build_items(&id, &new_order.items);
                let subtotal: f64 = items.iter().map(|i| i.total_price).sum();

                let order = Order {
                    order_number: Some(next_order_number(tx)?),
                    order_type: new_order.order_type,
                    status: new_order.status,
                    customer_name: new_order.customer_name,
                    customer_phone: new_order.customer_phone,
                    table_number: new_order.table_number,
                    delivery_address: new_order.delivery_address,
                    subtotal,
                    tax_amount: new_order.tax_amount,
                    total_amount: subtotal + new_order.tax_amount,
                    details: new_order.details,
                    created_at: now,
                    updated_at: now,
                    synced: false,
                    last_synced_at: None,
                    remote_id: None,
                    id,
                };

                order.upsert(tx)?;
                for item in &items {
                    item.upsert(tx)?;
                }
                enqueue_in(
                    tx,
                    MutationKind::CreateOrder,
                    &order.id,
                    order_payload(&order, &items)?,
                    now,
                )?;
                Ok(order)
            })
            .await?;

        info!(
            order_id = %order.id,
            order_number = order.order_number.as_deref().unwrap_or(""),
            order_type = order.order_type.as_str(),
            "Order created locally"
        );
        Ok(order)
    }

    /// Persist an edited order (status, customer, totals) and enqueue
    /// `update_order`. The order must already exist locally.
    pub async fn update_order(&self, mut order: Order) -> Result<Enqueued, StoreError> {
        let order_id = order.id.clone();
        let enqueued = self
            .store
            .transaction(|tx| {
                let existing = require_order(tx, &order.id)?;
                let now = from_millis(Utc::now().timestamp_millis());
                order.created_at = existing.created_at;
                order.remote_id = existing.remote_id;
                order.last_synced_at = existing.last_synced_at;
                order.updated_at = now;
                order.synced = false;
                order.upsert(tx)?;

                let items = items_for_order_in(tx, &order.id)?;
                enqueue_in(
                    tx,
                    MutationKind::UpdateOrder,
                    &order.id,
                    order_payload(&order, &items)?,
                    now,
                )
            })
            .await?;
        info!(order_id = %order_id, "Order updated locally");
        Ok(enqueued)
    }

    /// Replace an order's line items, recompute its totals and enqueue
    /// `update_order`.
    pub async fn replace_items(
        &self,
        order_id: &str,
        items: Vec<NewOrderItem>,
    ) -> Result<Vec<OrderItem>, StoreError> {
        let stored = self
            .store
            .transaction(|tx| {
                let mut order = require_order(tx, order_id)?;
                let now = from_millis(Utc::now().timestamp_millis());
                let rows = build_items(order_id, &items);

                tx.execute(
                    "DELETE FROM order_items WHERE order_id = ?1",
                    params![order_id],
                )?;
                for row in &rows {
                    row.upsert(tx)?;
                }

                order.subtotal = rows.iter().map(|i| i.total_price).sum();
                order.total_amount = order.subtotal + order.tax_amount;
                order.updated_at = now;
                order.synced = false;
                order.upsert(tx)?;

                enqueue_in(
                    tx,
                    MutationKind::UpdateOrder,
                    order_id,
                    order_payload(&order, &rows)?,
                    now,
                )?;
                Ok(rows)
            })
            .await?;
        info!(order_id = %order_id, items = stored.len(), "Order items replaced");
        Ok(stored)
    }

    /// Delete an order. If its create never reached the remote system the
    /// order and its items go immediately; otherwise `delete_order` is queued
    /// and the reconciler removes the local copy once confirmed.
    pub async fn delete_order(&self, order_id: &str) -> Result<OrderDeletion, StoreError> {
        let outcome = self
            .store
            .transaction(|tx| {
                let order = require_order(tx, order_id)?;
                let payload = serde_json::json!({
                    "id": order.id,
                    "remoteId": order.remote_id,
                });
                match enqueue_in(tx, MutationKind::DeleteOrder, order_id, payload, Utc::now())? {
                    Enqueued::Cancelled { .. } => {
                        delete_order_cascade_in(tx, order_id)?;
                        Ok(OrderDeletion::Removed)
                    }
                    Enqueued::Appended(_) | Enqueued::Coalesced(_) => {
                        tx.execute(
                            "UPDATE orders SET synced = 0 WHERE id = ?1",
                            params![order_id],
                        )?;
                        Ok(OrderDeletion::Pending)
                    }
                }
            })
            .await?;
        info!(order_id = %order_id, outcome = ?outcome, "Order delete requested");
        Ok(outcome)
    }

    pub async fn get_order(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        self.store.get::<Order>(order_id).await
    }
}
