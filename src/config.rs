//! Sync configuration.
//!
//! Values live in the `local_settings` table under category `sync`, next to
//! the rest of the terminal settings. Anything missing or unparsable falls
//! back to the defaults below.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::warn;
use zeroize::Zeroizing;

use crate::db::LocalStore;
use crate::error::StoreError;
use crate::sync::DEFAULT_MAX_ATTEMPTS;

pub const SETTINGS_CATEGORY: &str = "sync";

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 5;
const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 15;

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub admin_url: String,
    /// Never serialized back out; wiped from memory on drop.
    #[serde(skip_serializing, deserialize_with = "deserialize_secret")]
    pub api_key: Zeroizing<String>,
    pub terminal_id: String,
    pub sync_interval_secs: u64,
    /// Failed attempts after which a mutation is abandoned.
    pub max_attempts: u32,
    pub request_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub health_check_interval_secs: u64,
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Zeroizing<String>, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(Zeroizing::new)
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            admin_url: String::new(),
            api_key: Zeroizing::new(String::new()),
            terminal_id: String::new(),
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            health_timeout_secs: DEFAULT_HEALTH_TIMEOUT_SECS,
            health_check_interval_secs: DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
        }
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("admin_url", &self.admin_url)
            .field("api_key", &"<redacted>")
            .field("terminal_id", &self.terminal_id)
            .field("sync_interval_secs", &self.sync_interval_secs)
            .field("max_attempts", &self.max_attempts)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("health_timeout_secs", &self.health_timeout_secs)
            .field("health_check_interval_secs", &self.health_check_interval_secs)
            .finish()
    }
}

impl SyncConfig {
    /// Load from the `local_settings` table.
    pub async fn from_local_settings(store: &LocalStore) -> Result<Self, StoreError> {
        let defaults = Self::default();
        let text = move |key: &'static str| async move {
            store
                .get_setting(SETTINGS_CATEGORY, key)
                .await
                .map(|v| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
        };

        let admin_url = text("admin_url").await?.unwrap_or_default();
        let api_key = Zeroizing::new(text("api_key").await?.unwrap_or_default());
        let terminal_id = text("terminal_id").await?.unwrap_or_default();

        Ok(Self {
            admin_url,
            api_key,
            terminal_id,
            sync_interval_secs: positive(
                "sync_interval_secs",
                text("sync_interval_secs").await?,
                defaults.sync_interval_secs,
            ),
            max_attempts: positive(
                "max_attempts",
                text("max_attempts").await?,
                defaults.max_attempts,
            ),
            request_timeout_secs: positive(
                "request_timeout_secs",
                text("request_timeout_secs").await?,
                defaults.request_timeout_secs,
            ),
            health_timeout_secs: positive(
                "health_timeout_secs",
                text("health_timeout_secs").await?,
                defaults.health_timeout_secs,
            ),
            health_check_interval_secs: positive(
                "health_check_interval_secs",
                text("health_check_interval_secs").await?,
                defaults.health_check_interval_secs,
            ),
        })
    }

    /// Both an admin URL and an API key are present.
    pub fn is_configured(&self) -> bool {
        !self.admin_url.trim().is_empty() && !self.api_key.trim().is_empty()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Parse a strictly positive number; zero or garbage keeps the default.
fn positive<T>(key: &str, raw: Option<String>, default: T) -> T
where
    T: std::str::FromStr + PartialOrd + Default + Copy + fmt::Display,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(v) if v > T::default() => v,
        _ => {
            warn!(key, value = %raw, fallback = %default, "Ignoring invalid sync setting");
            default
        }
    }
}
