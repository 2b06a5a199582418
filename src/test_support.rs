//! Fixtures and a scripted remote API shared by unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::api::RemoteOrderApi;
use crate::error::RemoteError;
use crate::models::{
    from_millis, MutationKind, Order, OrderItem, OrderStatus, OrderType,
};

pub(crate) fn at_ms(ms: i64) -> DateTime<Utc> {
    from_millis(ms)
}

pub(crate) fn order(id: &str) -> Order {
    let now = from_millis(Utc::now().timestamp_millis());
    Order {
        id: id.to_string(),
        order_number: None,
        order_type: OrderType::DineIn,
        status: OrderStatus::Pending,
        customer_name: None,
        customer_phone: None,
        table_number: Some("7".into()),
        delivery_address: None,
        subtotal: 10.0,
        tax_amount: 2.4,
        total_amount: 12.4,
        details: Value::Null,
        created_at: now,
        updated_at: now,
        synced: false,
        last_synced_at: None,
        remote_id: None,
    }
}

pub(crate) fn item(id: &str, order_id: &str) -> OrderItem {
    OrderItem {
        id: id.to_string(),
        order_id: order_id.to_string(),
        menu_item_id: Some("menu-coffee".into()),
        name: "Coffee".into(),
        quantity: 2,
        unit_price: 2.5,
        total_price: 5.0,
        notes: None,
    }
}

/// One recorded call against [`ScriptedApi`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordedCall {
    pub kind: MutationKind,
    pub order_id: String,
    pub idempotency_key: String,
}

/// Remote API double. Each call pops the next scripted result for its order
/// (falling back to the default result) and records the call.
pub(crate) struct ScriptedApi {
    scripts: Mutex<Vec<(String, VecDeque<Result<(), RemoteError>>)>>,
    default_ok: Mutex<bool>,
    healthy: Mutex<bool>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedApi {
    pub fn ok() -> Self {
        Self {
            scripts: Mutex::new(Vec::new()),
            default_ok: Mutex::new(true),
            healthy: Mutex::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        let api = Self::ok();
        api.set_default_ok(false);
        api
    }

    pub fn set_default_ok(&self, ok: bool) {
        *self.default_ok.lock().unwrap() = ok;
    }

    pub fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock().unwrap() = healthy;
    }

    /// Queue results for the next calls touching `order_id`.
    pub fn script(&self, order_id: &str, results: Vec<Result<(), RemoteError>>) {
        self.scripts
            .lock()
            .unwrap()
            .push((order_id.to_string(), results.into_iter().collect()));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, order_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.order_id == order_id)
            .count()
    }

    fn respond(
        &self,
        kind: MutationKind,
        order_id: &str,
        idempotency_key: &str,
    ) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(RecordedCall {
            kind,
            order_id: order_id.to_string(),
            idempotency_key: idempotency_key.to_string(),
        });
        let mut scripts = self.scripts.lock().unwrap();
        if let Some((_, queue)) = scripts.iter_mut().find(|(id, _)| id == order_id) {
            if let Some(result) = queue.pop_front() {
                return result;
            }
        }
        if *self.default_ok.lock().unwrap() {
            Ok(())
        } else {
            Err(RemoteError::Transport(format!(
                "Cannot reach admin dashboard for {order_id}"
            )))
        }
    }
}

#[async_trait]
impl RemoteOrderApi for ScriptedApi {
    async fn create_order(&self, payload: &Value, idempotency_key: &str) -> Result<Value, RemoteError> {
        let order_id = payload["id"].as_str().unwrap_or_default().to_string();
        self.respond(MutationKind::CreateOrder, &order_id, idempotency_key)?;
        Ok(json!({ "success": true, "order": { "id": format!("remote-{order_id}") } }))
    }

    async fn update_order(
        &self,
        order_id: &str,
        _payload: &Value,
        idempotency_key: &str,
    ) -> Result<Value, RemoteError> {
        self.respond(MutationKind::UpdateOrder, order_id, idempotency_key)?;
        Ok(json!({ "success": true }))
    }

    async fn delete_order(&self, order_id: &str, idempotency_key: &str) -> Result<(), RemoteError> {
        self.respond(MutationKind::DeleteOrder, order_id, idempotency_key)
    }

    async fn check_health(&self) -> bool {
        *self.healthy.lock().unwrap()
    }
}
