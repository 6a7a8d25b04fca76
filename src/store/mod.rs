//! Monitoring window store.
//!
//! A window records that a user's wallet is expected to receive a deposit
//! until `expires_at`. At most one window per user is active at a time:
//! `start` supersedes whatever was there, `stop` marks it inactive, and
//! expiry is evaluated lazily against the caller's clock.
//!
//! Two backends:
//!   - `ValkeyWindowStore`: production, shared across processes
//!   - `MemoryWindowStore`: tests and the no-Valkey fallback mode

pub mod valkey;

pub use valkey::ValkeyWindowStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("valkey error: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Why the front end asked us to watch this wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorContext {
    Onboarding,
    BalanceCheck,
    PendingInvestment,
}

impl std::fmt::Display for MonitorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorContext::Onboarding => write!(f, "onboarding"),
            MonitorContext::BalanceCheck => write!(f, "balance_check"),
            MonitorContext::PendingInvestment => write!(f, "pending_investment"),
        }
    }
}

/// A time-boxed expectation that `user_id` will receive a deposit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringWindow {
    pub user_id: String,
    pub context: MonitorContext,
    /// Identity of this window. A re-triggered window gets a new one.
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Settlement balance seen at the last check or poll.
    #[serde(default)]
    pub last_seen_balance: Option<Decimal>,
}

impl MonitoringWindow {
    pub fn new(
        user_id: &str,
        context: MonitorContext,
        ttl_minutes: u32,
        metadata: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            context,
            started_at: now,
            expires_at: now + Duration::minutes(i64::from(ttl_minutes)),
            stopped_at: None,
            metadata,
            last_seen_balance: None,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.stopped_at.is_none() && self.expires_at > now
    }

    /// Raw wallet address the front end attached when it started the window.
    pub fn metadata_address(&self) -> Option<&str> {
        self.metadata.get("wallet_address").and_then(|v| v.as_str())
    }
}

/// An investment the user asked for before their balance could cover it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub user_id: String,
    pub amount: Decimal,
    #[serde(default)]
    pub protocol_hint: Option<String>,
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub apy: Option<f64>,
    pub shortage: Decimal,
    pub expires_at: DateTime<Utc>,
}

impl PendingTransaction {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Durable record of monitoring windows and pending investments.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Create or replace the user's window. Re-calling refreshes the deadline.
    async fn start(
        &self,
        user_id: &str,
        context: MonitorContext,
        ttl_minutes: u32,
        metadata: Map<String, Value>,
    ) -> Result<(), StoreError>;

    /// Mark the user's window inactive. Returns true only for the call that
    /// actually stopped an active window; repeated calls are no-ops.
    async fn stop(&self, user_id: &str) -> Result<bool, StoreError>;

    /// All windows with `expires_at > now` that have not been stopped.
    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<MonitoringWindow>, StoreError>;

    async fn get(&self, user_id: &str) -> Result<Option<MonitoringWindow>, StoreError>;

    /// Remember the last observed settlement balance on the current window.
    async fn record_balance(&self, user_id: &str, balance: Decimal) -> Result<(), StoreError>;

    async fn put_pending(&self, pending: &PendingTransaction) -> Result<(), StoreError>;

    /// Live pending transaction for the user, if any. Expired ones read as `None`.
    async fn get_pending(&self, user_id: &str) -> Result<Option<PendingTransaction>, StoreError>;

    async fn clear_pending(&self, user_id: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryState {
    windows: HashMap<String, MonitoringWindow>,
    pending: HashMap<String, PendingTransaction>,
}

/// Process-local store. Used in tests and when Valkey is unreachable at startup.
#[derive(Default)]
pub struct MemoryWindowStore {
    state: Mutex<MemoryState>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn start(
        &self,
        user_id: &str,
        context: MonitorContext,
        ttl_minutes: u32,
        metadata: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let window = MonitoringWindow::new(user_id, context, ttl_minutes, metadata, Utc::now());
        debug!(user_id = user_id, context = %context, expires_at = %window.expires_at, "window started");
        self.state.lock().await.windows.insert(user_id.to_string(), window);
        Ok(())
    }

    async fn stop(&self, user_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        match state.windows.get_mut(user_id) {
            Some(w) if w.stopped_at.is_none() => {
                w.stopped_at = Some(now);
                // An already expired window counts as inactive: nothing to claim.
                Ok(w.expires_at > now)
            }
            _ => Ok(false),
        }
    }

    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<MonitoringWindow>, StoreError> {
        let state = self.state.lock().await;
        let mut active: Vec<MonitoringWindow> = state
            .windows
            .values()
            .filter(|w| w.is_active(now))
            .cloned()
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(active)
    }

    async fn get(&self, user_id: &str) -> Result<Option<MonitoringWindow>, StoreError> {
        Ok(self.state.lock().await.windows.get(user_id).cloned())
    }

    async fn record_balance(&self, user_id: &str, balance: Decimal) -> Result<(), StoreError> {
        if let Some(w) = self.state.lock().await.windows.get_mut(user_id) {
            w.last_seen_balance = Some(balance);
        }
        Ok(())
    }

    async fn put_pending(&self, pending: &PendingTransaction) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .pending
            .insert(pending.user_id.clone(), pending.clone());
        Ok(())
    }

    async fn get_pending(&self, user_id: &str) -> Result<Option<PendingTransaction>, StoreError> {
        let now = Utc::now();
        Ok(self
            .state
            .lock()
            .await
            .pending
            .get(user_id)
            .filter(|p| p.is_live(now))
            .cloned())
    }

    async fn clear_pending(&self, user_id: &str) -> Result<(), StoreError> {
        self.state.lock().await.pending.remove(user_id);
        Ok(())
    }
}
