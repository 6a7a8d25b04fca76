//! Watch set: the concrete settlement addresses we are waiting on.
//!
//! Rebuilt from scratch on every refresh cycle from the active monitoring
//! windows. The result is an immutable snapshot; the controller publishes it
//! and the listener matches against whichever snapshot is current. Nothing
//! mutates a snapshot after it is built.

pub mod directory;

pub use directory::HttpAccountDirectory;

use crate::store::MonitoringWindow;
use alloy::primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A user's account as known to the account directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    /// Key-derived address shown to the user.
    pub wallet_address: Address,
    /// Deployed smart account, when the directory already knows it.
    #[serde(default)]
    pub smart_account_address: Option<Address>,
}

/// Source of user account records and settlement address resolution.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn lookup(&self, user_id: &str) -> anyhow::Result<Option<AccountRecord>>;

    /// Address where funds actually land and the deployer can reach them.
    async fn settlement_address(&self, record: &AccountRecord) -> anyhow::Result<Address>;
}

/// A wallet actively checked against incoming transfers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WatchedWallet {
    pub address: Address,
    pub user_id: String,
    pub display_name: String,
}

impl WatchedWallet {
    pub fn new(address: Address, user_id: &str, display_name: &str) -> Self {
        Self {
            address,
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
        }
    }

    /// Lowercase 0x-prefixed hex, the canonical form used in logs and messages.
    pub fn canonical_address(&self) -> String {
        format!("0x{}", alloy::hex::encode(self.address.as_slice()))
    }
}

/// Immutable snapshot of watched wallets keyed by address.
#[derive(Debug, Clone, Default)]
pub struct WatchSet {
    by_address: HashMap<Address, WatchedWallet>,
    generated_at: Option<DateTime<Utc>>,
}

impl WatchSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_wallets(wallets: Vec<WatchedWallet>) -> Self {
        let mut by_address = HashMap::with_capacity(wallets.len());
        for w in wallets {
            if let Some(prev) = by_address.insert(w.address, w) {
                warn!(
                    user_id = %prev.user_id,
                    "two windows resolved to the same settlement address, keeping the later one"
                );
            }
        }
        Self {
            by_address,
            generated_at: Some(Utc::now()),
        }
    }

    /// Address equality on raw bytes, so checksum casing never matters.
    pub fn lookup(&self, address: &Address) -> Option<&WatchedWallet> {
        self.by_address.get(address)
    }

    pub fn contains_user(&self, user_id: &str) -> bool {
        self.by_address.values().any(|w| w.user_id == user_id)
    }

    pub fn wallets(&self) -> impl Iterator<Item = &WatchedWallet> {
        self.by_address.values()
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    pub fn generated_at(&self) -> Option<DateTime<Utc>> {
        self.generated_at
    }
}

/// Resolves monitoring windows into watched wallets.
#[derive(Clone)]
pub struct WatchSetLoader {
    directory: Arc<dyn AccountDirectory>,
}

impl WatchSetLoader {
    pub fn new(directory: Arc<dyn AccountDirectory>) -> Self {
        Self { directory }
    }

    /// Build a fresh snapshot. Resolutions run concurrently; one user failing
    /// never keeps the others out of the set.
    pub async fn resolve(&self, windows: &[MonitoringWindow]) -> WatchSet {
        let resolved = join_all(windows.iter().map(|w| self.resolve_window(w))).await;
        let wallets: Vec<WatchedWallet> = resolved.into_iter().flatten().collect();
        debug!(windows = windows.len(), wallets = wallets.len(), "watch set resolved");
        WatchSet::from_wallets(wallets)
    }

    /// Resolve a single window, falling back to the raw address on failure.
    pub async fn resolve_window(&self, window: &MonitoringWindow) -> Option<WatchedWallet> {
        self.resolve_user(&window.user_id, window.metadata_address()).await
    }

    /// Resolve a user outside any window (manual check path).
    ///
    /// Fallback order: settlement address → directory raw wallet address →
    /// `fallback_address` (typically window metadata). `None` only when no
    /// address is known at all.
    pub async fn resolve_user(
        &self,
        user_id: &str,
        fallback_address: Option<&str>,
    ) -> Option<WatchedWallet> {
        let record = match self.directory.lookup(user_id).await {
            Ok(Some(r)) => Some(r),
            Ok(None) => {
                warn!(user_id = user_id, "no account record for user");
                None
            }
            Err(e) => {
                warn!(user_id = user_id, error = %e, "account lookup failed");
                None
            }
        };

        if let Some(record) = record {
            let address = match self.directory.settlement_address(&record).await {
                Ok(addr) => addr,
                Err(e) => {
                    warn!(
                        user_id = user_id,
                        error = %e,
                        fallback = %record.wallet_address,
                        "settlement address resolution failed, using raw wallet address"
                    );
                    record.wallet_address
                }
            };
            return Some(WatchedWallet::new(address, user_id, &record.display_name));
        }

        match fallback_address.map(str::parse::<Address>) {
            Some(Ok(addr)) => {
                warn!(user_id = user_id, address = %addr, "using window metadata address");
                Some(WatchedWallet::new(addr, user_id, user_id))
            }
            Some(Err(e)) => {
                warn!(user_id = user_id, error = %e, "window metadata address is invalid, skipping");
                None
            }
            None => {
                warn!(user_id = user_id, "no address known for user, skipping");
                None
            }
        }
    }
}
