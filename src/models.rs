//! Record types held by the local store.
//!
//! Each collection maps to one SQLite table. The [`Record`] trait ties a Rust
//! type to its table so the store can offer generic `put` / `get`.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

/// The independent record collections of the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Orders,
    OrderItems,
    PendingMutations,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::Orders,
        Collection::OrderItems,
        Collection::PendingMutations,
    ];

    pub fn table(self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::OrderItems => "order_items",
            Self::PendingMutations => "pending_mutations",
        }
    }
}

/// A type persisted in one collection, addressed by a text primary key.
pub trait Record: Sized + Send + Sync + 'static {
    const COLLECTION: Collection;
    /// Column list in the order [`Record::from_row`] reads them.
    const COLUMNS: &'static str;

    /// Insert or overwrite the row with this record's key.
    fn upsert(&self, conn: &Connection) -> rusqlite::Result<()>;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

pub(crate) fn to_millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn text_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        msg.into(),
    )
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| text_err(idx, e.to_string()))
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderType {
    DineIn,
    Delivery,
    Takeout,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DineIn => "dine-in",
            Self::Delivery => "delivery",
            Self::Takeout => "takeout",
        }
    }

    /// Parse a stored or UI-supplied order type. `pickup` and `takeaway` are
    /// accepted as takeout aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "dine-in" | "dinein" => Some(Self::DineIn),
            "delivery" => Some(Self::Delivery),
            "takeout" | "takeaway" | "pickup" => Some(Self::Takeout),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    Ready,
    OutForDelivery,
    Delivered,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Preparing => "preparing",
            Self::Ready => "ready",
            Self::OutForDelivery => "out_for_delivery",
            Self::Delivered => "delivered",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "preparing" => Some(Self::Preparing),
            "ready" => Some(Self::Ready),
            "out_for_delivery" => Some(Self::OutForDelivery),
            "delivered" => Some(Self::Delivered),
            "completed" => Some(Self::Completed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A locally held order. Business fields beyond the typed ones travel in
/// `details` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub order_number: Option<String>,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub table_number: Option<String>,
    pub delivery_address: Option<String>,
    pub subtotal: f64,
    pub tax_amount: f64,
    pub total_amount: f64,
    #[serde(default)]
    pub details: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Stored as 0/1. True once the remote system acknowledged the current
    /// local state.
    pub synced: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Id assigned by the admin dashboard on create, when it returns one.
    pub remote_id: Option<String>,
}

impl Order {
    /// Wire payload sent to the remote API.
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "orderNumber": self.order_number,
            "orderType": self.order_type,
            "status": self.status,
            "customerName": self.customer_name,
            "customerPhone": self.customer_phone,
            "tableNumber": self.table_number,
            "deliveryAddress": self.delivery_address,
            "subtotal": self.subtotal,
            "taxAmount": self.tax_amount,
            "totalAmount": self.total_amount,
            "details": self.details,
            "createdAt": self.created_at.to_rfc3339(),
            "updatedAt": self.updated_at.to_rfc3339(),
        })
    }
}

impl Record for Order {
    const COLLECTION: Collection = Collection::Orders;
    const COLUMNS: &'static str = "id, order_number, order_type, status, customer_name, \
         customer_phone, table_number, delivery_address, subtotal, tax_amount, total_amount, \
         details, created_at, updated_at, synced, last_synced_at, remote_id";

    fn upsert(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO orders (
                 id, order_number, order_type, status, customer_name, customer_phone,
                 table_number, delivery_address, subtotal, tax_amount, total_amount,
                 details, created_at, updated_at, synced, last_synced_at, remote_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             ON CONFLICT(id) DO UPDATE SET
                 order_number = excluded.order_number,
                 order_type = excluded.order_type,
                 status = excluded.status,
                 customer_name = excluded.customer_name,
                 customer_phone = excluded.customer_phone,
                 table_number = excluded.table_number,
                 delivery_address = excluded.delivery_address,
                 subtotal = excluded.subtotal,
                 tax_amount = excluded.tax_amount,
                 total_amount = excluded.total_amount,
                 details = excluded.details,
                 created_at = excluded.created_at,
                 updated_at = excluded.updated_at,
                 synced = excluded.synced,
                 last_synced_at = excluded.last_synced_at,
                 remote_id = excluded.remote_id",
            params![
                self.id,
                self.order_number,
                self.order_type.as_str(),
                self.status.as_str(),
                self.customer_name,
                self.customer_phone,
                self.table_number,
                self.delivery_address,
                self.subtotal,
                self.tax_amount,
                self.total_amount,
                self.details.to_string(),
                to_millis(&self.created_at),
                to_millis(&self.updated_at),
                i64::from(self.synced),
                self.last_synced_at.as_ref().map(to_millis),
                self.remote_id,
            ],
        )?;
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let order_type: String = row.get(2)?;
        let status: String = row.get(3)?;
        let synced: i64 = row.get(14)?;
        Ok(Self {
            id: row.get(0)?,
            order_number: row.get(1)?,
            order_type: OrderType::parse(&order_type)
                .ok_or_else(|| text_err(2, format!("unknown order type: {order_type}")))?,
            status: OrderStatus::parse(&status)
                .ok_or_else(|| text_err(3, format!("unknown order status: {status}")))?,
            customer_name: row.get(4)?,
            customer_phone: row.get(5)?,
            table_number: row.get(6)?,
            delivery_address: row.get(7)?,
            subtotal: row.get(8)?,
            tax_amount: row.get(9)?,
            total_amount: row.get(10)?,
            details: json_column(row, 11)?,
            created_at: from_millis(row.get(12)?),
            updated_at: from_millis(row.get(13)?),
            synced: synced != 0,
            last_synced_at: row.get::<_, Option<i64>>(15)?.map(from_millis),
            remote_id: row.get(16)?,
        })
    }
}

/// Optional in-memory predicate for `get_all_orders`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderFilter {
    pub order_type: Option<OrderType>,
    pub status: Option<OrderStatus>,
    pub synced: Option<bool>,
}

impl OrderFilter {
    pub fn unsynced() -> Self {
        Self {
            synced: Some(false),
            ..Self::default()
        }
    }

    pub fn matches(&self, order: &Order) -> bool {
        self.order_type.map_or(true, |t| order.order_type == t)
            && self.status.map_or(true, |s| order.status == s)
            && self.synced.map_or(true, |s| order.synced == s)
    }
}

// ---------------------------------------------------------------------------
// Order items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub id: String,
    /// Advisory reference to [`Order::id`]; not enforced by SQLite.
    pub order_id: String,
    pub menu_item_id: Option<String>,
    pub name: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub total_price: f64,
    pub notes: Option<String>,
}

impl Record for OrderItem {
    const COLLECTION: Collection = Collection::OrderItems;
    const COLUMNS: &'static str =
        "id, order_id, menu_item_id, name, quantity, unit_price, total_price, notes";

    fn upsert(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO order_items (
                 id, order_id, menu_item_id, name, quantity, unit_price, total_price, notes
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 order_id = excluded.order_id,
                 menu_item_id = excluded.menu_item_id,
                 name = excluded.name,
                 quantity = excluded.quantity,
                 unit_price = excluded.unit_price,
                 total_price = excluded.total_price,
                 notes = excluded.notes",
            params![
                self.id,
                self.order_id,
                self.menu_item_id,
                self.name,
                self.quantity,
                self.unit_price,
                self.total_price,
                self.notes,
            ],
        )?;
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            order_id: row.get(1)?,
            menu_item_id: row.get(2)?,
            name: row.get(3)?,
            quantity: row.get(4)?,
            unit_price: row.get(5)?,
            total_price: row.get(6)?,
            notes: row.get(7)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Pending mutations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    CreateOrder,
    UpdateOrder,
    DeleteOrder,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateOrder => "create_order",
            Self::UpdateOrder => "update_order",
            Self::DeleteOrder => "delete_order",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create_order" => Some(Self::CreateOrder),
            "update_order" => Some(Self::UpdateOrder),
            "delete_order" => Some(Self::DeleteOrder),
            _ => None,
        }
    }
}

/// A write not yet confirmed by the remote system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub id: String,
    pub kind: MutationKind,
    pub order_id: String,
    /// Everything needed to replay the write remotely.
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Bumped every time a newer local write is folded into this entry.
    pub revision: i64,
}

impl Record for PendingMutation {
    const COLLECTION: Collection = Collection::PendingMutations;
    const COLUMNS: &'static str =
        "id, kind, order_id, payload, enqueued_at, retry_count, last_error, revision";

    fn upsert(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO pending_mutations (
                 id, kind, order_id, payload, enqueued_at, retry_count, last_error, revision
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 kind = excluded.kind,
                 order_id = excluded.order_id,
                 payload = excluded.payload,
                 enqueued_at = excluded.enqueued_at,
                 retry_count = excluded.retry_count,
                 last_error = excluded.last_error,
                 revision = excluded.revision",
            params![
                self.id,
                self.kind.as_str(),
                self.order_id,
                self.payload.to_string(),
                to_millis(&self.enqueued_at),
                self.retry_count,
                self.last_error,
                self.revision,
            ],
        )?;
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let kind: String = row.get(1)?;
        Ok(Self {
            id: row.get(0)?,
            kind: MutationKind::parse(&kind)
                .ok_or_else(|| text_err(1, format!("unknown mutation kind: {kind}")))?,
            order_id: row.get(2)?,
            payload: json_column(row, 3)?,
            enqueued_at: from_millis(row.get(4)?),
            retry_count: row.get(5)?,
            last_error: row.get(6)?,
            revision: row.get(7)?,
        })
    }
}

/// A mutation that exhausted its retries, kept for the calling layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbandonedMutation {
    pub id: String,
    pub kind: MutationKind,
    pub order_id: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub reason: String,
    pub abandoned_at: DateTime<Utc>,
}

impl AbandonedMutation {
    pub(crate) const COLUMNS: &'static str =
        "id, kind, order_id, payload, enqueued_at, retry_count, reason, abandoned_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let kind: String = row.get(1)?;
        Ok(Self {
            id: row.get(0)?,
            kind: MutationKind::parse(&kind)
                .ok_or_else(|| text_err(1, format!("unknown mutation kind: {kind}")))?,
            order_id: row.get(2)?,
            payload: json_column(row, 3)?,
            enqueued_at: from_millis(row.get(4)?),
            retry_count: row.get(5)?,
            reason: row.get(6)?,
            abandoned_at: from_millis(row.get(7)?),
        })
    }
}
