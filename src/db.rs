//! Local SQLite store for orders, order items and pending mutations.
//!
//! Uses rusqlite with WAL mode. The store is an explicitly constructed value
//! owned by the composition root and shared by `Arc`; the connection is
//! opened lazily, so `close()` followed by any operation reopens it.

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::StoreError;
use crate::models::{to_millis, Collection, Order, OrderFilter, OrderItem, Record};

/// Current schema version. Bump when adding new migrations.
pub(crate) const CURRENT_SCHEMA_VERSION: i32 = 2;

const DB_FILE_NAME: &str = "pos-sync.db";

/// Where the store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorePath {
    File(PathBuf),
    /// Non-durable; contents are lost on `close()`. Tests only.
    InMemory,
}

impl StorePath {
    /// `{app_data_dir}/pos-sync.db`
    pub fn in_dir(app_data_dir: &Path) -> Self {
        Self::File(app_data_dir.join(DB_FILE_NAME))
    }
}

/// Durable on-device store holding the three record collections.
pub struct LocalStore {
    path: StorePath,
    conn: Mutex<Option<Connection>>,
}

impl LocalStore {
    /// Build a store handle. Nothing touches disk until the first operation.
    pub fn new(path: StorePath) -> Self {
        Self {
            path,
            conn: Mutex::new(None),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StorePath::InMemory)
    }

    pub fn path(&self) -> &StorePath {
        &self.path
    }

    /// Establish the store, creating collections and indexes on first use.
    ///
    /// Idempotent: concurrent callers serialize on the connection lock and
    /// only the first one does any work. Returns the number of migrations
    /// this call applied.
    pub async fn open(&self) -> Result<usize, StoreError> {
        let mut guard = self.conn.lock().await;
        if guard.is_some() {
            return Ok(0);
        }
        let (conn, applied) = self.connect()?;
        *guard = Some(conn);
        Ok(applied)
    }

    pub async fn is_open(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Release the connection. The next operation triggers a fresh `open()`.
    pub async fn close(&self) {
        if self.conn.lock().await.take().is_some() {
            info!("Local store closed");
        }
    }

    fn connect(&self) -> Result<(Connection, usize), StoreError> {
        let conn = match &self.path {
            StorePath::InMemory => {
                let conn = Connection::open_in_memory()
                    .map_err(|e| StoreError::Unavailable(format!("sqlite open: {e}")))?;
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA busy_timeout = 5000;
                     PRAGMA synchronous = NORMAL;",
                )?;
                conn
            }
            StorePath::File(path) => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    fs::create_dir_all(dir).map_err(|e| {
                        StoreError::Unavailable(format!("Failed to create data dir: {e}"))
                    })?;
                }
                info!("Opening local store at {}", path.display());
                open_and_configure(path)?
            }
        };

        let applied = run_migrations(&conn)?;
        info!("Local store ready (schema v{CURRENT_SCHEMA_VERSION})");
        Ok((conn, applied))
    }

    /// Run `f` against the open connection, opening it first if needed.
    pub(crate) async fn call<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let (conn, _) = self.connect()?;
            *guard = Some(conn);
        }
        let conn = guard
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("store handle released".into()))?;
        f(conn)
    }

    /// Run `f` inside one SQLite transaction; commits only if `f` succeeds.
    pub(crate) async fn transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.call(|conn| {
            let tx = conn.transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Generic record access
    // -----------------------------------------------------------------------

    /// Upsert by primary key. The row is written atomically.
    pub async fn put<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        self.call(|conn| {
            record.upsert(conn)?;
            Ok(())
        })
        .await
    }

    /// Fetch by primary key; a missing row is `Ok(None)`.
    pub async fn get<R: Record>(&self, key: &str) -> Result<Option<R>, StoreError> {
        self.call(|conn| get_in(conn, key)).await
    }

    /// Delete by primary key. Returns whether a row was removed.
    pub async fn delete<R: Record>(&self, key: &str) -> Result<bool, StoreError> {
        self.call(|conn| {
            let removed = conn.execute(
                &format!("DELETE FROM {} WHERE id = ?1", R::COLLECTION.table()),
                params![key],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    pub async fn count(&self, collection: Collection) -> Result<usize, StoreError> {
        self.call(|conn| {
            let n: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", collection.table()),
                [],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as usize)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Orders and items
    // -----------------------------------------------------------------------

    /// All orders, newest first, filtered in memory after a full read.
    pub async fn get_all_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
        let orders: Vec<Order> = self
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM orders ORDER BY created_at DESC, id ASC",
                    Order::COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], |row| Order::from_row(row))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(orders.into_iter().filter(|o| filter.matches(o)).collect())
    }

    /// Items of one order via the `order_items(order_id)` index.
    pub async fn get_items_for_order(&self, order_id: &str) -> Result<Vec<OrderItem>, StoreError> {
        self.call(|conn| items_for_order_in(conn, order_id)).await
    }

    /// Delete an order and all of its items in one transaction. Returns the
    /// number of items removed.
    pub async fn delete_order_cascade(&self, order_id: &str) -> Result<usize, StoreError> {
        let removed = self
            .transaction(|tx| Ok(delete_order_cascade_in(tx, order_id)?))
            .await?;
        debug!(order_id = %order_id, items = removed, "Order deleted with items");
        Ok(removed)
    }

    /// Flag an order as acknowledged by the remote system.
    pub async fn mark_synced(
        &self,
        order_id: &str,
        remote_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.call(|conn| Ok(mark_synced_in(conn, order_id, remote_id)?))
            .await
    }

    /// Wipe all three collections and the dead-letter table. Used on
    /// reset/logout only.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        self.transaction(|tx| {
            tx.execute_batch(
                "DELETE FROM pending_mutations;
                 DELETE FROM abandoned_mutations;
                 DELETE FROM order_items;
                 DELETE FROM orders;",
            )?;
            Ok(())
        })
        .await?;
        info!("Local store cleared");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub async fn get_setting(&self, category: &str, key: &str) -> Result<Option<String>, StoreError> {
        self.call(|conn| Ok(get_setting(conn, category, key)?))
            .await
    }

    pub async fn set_setting(&self, category: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.call(|conn| Ok(set_setting(conn, category, key, value)?))
            .await
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers shared with the queue and reconciler
// ---------------------------------------------------------------------------

pub(crate) fn get_in<R: Record>(conn: &Connection, key: &str) -> Result<Option<R>, StoreError> {
    let record = conn
        .query_row(
            &format!(
                "SELECT {} FROM {} WHERE id = ?1",
                R::COLUMNS,
                R::COLLECTION.table()
            ),
            params![key],
            |row| R::from_row(row),
        )
        .optional()?;
    Ok(record)
}

pub(crate) fn items_for_order_in(
    conn: &Connection,
    order_id: &str,
) -> Result<Vec<OrderItem>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM order_items WHERE order_id = ?1 ORDER BY rowid ASC",
        OrderItem::COLUMNS
    ))?;
    let items = stmt
        .query_map(params![order_id], |row| OrderItem::from_row(row))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(items)
}

/// Items go first so no item can outlive its parent.
pub(crate) fn delete_order_cascade_in(conn: &Connection, order_id: &str) -> rusqlite::Result<usize> {
    let items = conn.execute(
        "DELETE FROM order_items WHERE order_id = ?1",
        params![order_id],
    )?;
    conn.execute("DELETE FROM orders WHERE id = ?1", params![order_id])?;
    Ok(items)
}

pub(crate) fn mark_synced_in(
    conn: &Connection,
    order_id: &str,
    remote_id: Option<&str>,
) -> rusqlite::Result<bool> {
    let now = to_millis(&chrono::Utc::now());
    let updated = conn.execute(
        "UPDATE orders
         SET synced = 1,
             last_synced_at = ?2,
             remote_id = COALESCE(?3, remote_id)
         WHERE id = ?1",
        params![order_id, now, remote_id],
    )?;
    Ok(updated > 0)
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)
        .map_err(|e| StoreError::Unavailable(format!("sqlite open: {e}")))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`. Returns how
/// many were applied.
fn run_migrations(conn: &Connection) -> Result<usize, StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        debug!("Local store schema up to date (v{current})");
        return Ok(0);
    }

    info!("Migrating local store from v{current} to v{CURRENT_SCHEMA_VERSION}");

    let mut applied = 0;
    if current < 1 {
        migrate_v1(conn)?;
        applied += 1;
    }
    if current < 2 {
        migrate_v2(conn)?;
        applied += 1;
    }

    Ok(applied)
}

/// Migration v1: orders, items, mutation queue and settings.
pub(crate) fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        BEGIN;

        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- orders (timestamps are unix millis)
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            order_number TEXT,
            order_type TEXT NOT NULL DEFAULT 'dine-in',
            status TEXT NOT NULL DEFAULT 'pending',
            customer_name TEXT,
            customer_phone TEXT,
            table_number TEXT,
            delivery_address TEXT,
            subtotal REAL NOT NULL DEFAULT 0,
            tax_amount REAL NOT NULL DEFAULT 0,
            total_amount REAL NOT NULL DEFAULT 0,
            details TEXT NOT NULL DEFAULT 'null',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0 CHECK (synced IN (0, 1)),
            last_synced_at INTEGER
        );

        -- order_items (order_id is advisory, no FK)
        CREATE TABLE IF NOT EXISTS order_items (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL,
            menu_item_id TEXT,
            name TEXT NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 1,
            unit_price REAL NOT NULL DEFAULT 0,
            total_price REAL NOT NULL DEFAULT 0,
            notes TEXT
        );

        -- pending_mutations (durable FIFO of unconfirmed writes)
        CREATE TABLE IF NOT EXISTS pending_mutations (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL CHECK (kind IN ('create_order', 'update_order', 'delete_order')),
            order_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            revision INTEGER NOT NULL DEFAULT 0
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_orders_order_type ON orders(order_type);
        CREATE INDEX IF NOT EXISTS idx_orders_synced ON orders(synced);
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_order_items_order_id ON order_items(order_id);
        CREATE INDEX IF NOT EXISTS idx_pending_mutations_enqueued_at ON pending_mutations(enqueued_at);
        CREATE INDEX IF NOT EXISTS idx_pending_mutations_order_id ON pending_mutations(order_id);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        let _ = conn.execute_batch("ROLLBACK;");
        StoreError::Io(e)
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: dead-letter table and remote order ids.
fn migrate_v2(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        BEGIN;

        ALTER TABLE orders ADD COLUMN remote_id TEXT;

        -- abandoned_mutations (mutations that exhausted their retries)
        CREATE TABLE IF NOT EXISTS abandoned_mutations (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            order_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL,
            retry_count INTEGER NOT NULL,
            reason TEXT NOT NULL,
            abandoned_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_abandoned_mutations_order_id ON abandoned_mutations(order_id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (2);

        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        let _ = conn.execute_batch("ROLLBACK;");
        StoreError::Io(e)
    })?;

    info!("Applied migration v2 (abandoned_mutations, orders.remote_id)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .optional()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Open an in-memory database with every migration applied.
#[cfg(test)]
pub(crate) fn migrated_test_conn() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    run_migrations(&conn).expect("run_migrations should succeed in test");
    conn
}

// ===========================================================================
// Tests
// ===========================================================================
