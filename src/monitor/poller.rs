//! Balance polling fallback.
//!
//! For RPC endpoints whose log subscriptions silently stall. Every
//! `interval`, reads the settlement balance of each wallet in the current
//! snapshot. The first reading on a window is only a baseline; any later
//! increase is reported as a deposit of the difference. Dispatch goes through
//! the same sink as the subscription path, so the window stop claim keeps a
//! deposit seen by both from being deployed twice.

use crate::dispatch::DepositSink;
use crate::onchain::{BalanceReader, DepositMatch, DepositSource};
use crate::store::WindowStore;
use crate::watch::{WatchSet, WatchedWallet};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct BalancePoller {
    store: Arc<dyn WindowStore>,
    balances: Arc<dyn BalanceReader>,
    sink: Arc<dyn DepositSink>,
    snapshot: watch::Receiver<Arc<WatchSet>>,
    interval: Duration,
}

impl BalancePoller {
    pub fn new(
        store: Arc<dyn WindowStore>,
        balances: Arc<dyn BalanceReader>,
        sink: Arc<dyn DepositSink>,
        snapshot: watch::Receiver<Arc<WatchSet>>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            balances,
            sink,
            snapshot,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "balance poller started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let found = self.poll_once().await;
                    if found > 0 {
                        debug!(deposits = found, "poll cycle found deposits");
                    }
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("balance poller stopped");
    }

    /// One pass over the current snapshot. Returns the number of deposits
    /// handed to the sink.
    pub async fn poll_once(&self) -> usize {
        let snapshot = self.snapshot.borrow().clone();
        let mut found = 0;
        for wallet in snapshot.wallets() {
            if let Some(deposit) = self.check_wallet(wallet).await {
                self.sink.on_deposit(deposit).await;
                found += 1;
            }
        }
        found
    }

    async fn check_wallet(&self, wallet: &WatchedWallet) -> Option<DepositMatch> {
        let window = match self.store.get(&wallet.user_id).await {
            Ok(Some(w)) if w.is_active(Utc::now()) => w,
            Ok(_) => return None,
            Err(e) => {
                warn!(user_id = %wallet.user_id, error = %e, "poller could not read window");
                return None;
            }
        };

        let balance = match self.balances.balance_of(wallet.address).await {
            Ok(b) => b,
            Err(e) => {
                warn!(
                    user_id = %wallet.user_id,
                    address = %wallet.canonical_address(),
                    error = %e,
                    "balance read failed"
                );
                return None;
            }
        };

        if window.last_seen_balance == Some(balance) {
            return None;
        }
        if let Err(e) = self.store.record_balance(&wallet.user_id, balance).await {
            warn!(user_id = %wallet.user_id, error = %e, "failed to record polled balance");
        }

        match window.last_seen_balance {
            None => {
                debug!(user_id = %wallet.user_id, balance = %balance, "baseline balance recorded");
                None
            }
            Some(prev) if balance > prev => {
                let amount = balance - prev;
                info!(
                    user_id = %wallet.user_id,
                    amount = %amount,
                    "balance increase detected by poller"
                );
                Some(DepositMatch {
                    wallet: wallet.clone(),
                    amount,
                    tx_hash: String::new(),
                    block_number: None,
                    source: DepositSource::BalancePoll,
                })
            }
            // Balance went down (withdrawal or deployment): new baseline.
            Some(_) => None,
        }
    }
}
