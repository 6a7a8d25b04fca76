//! Manual check path.
//!
//! The user asks "did my deposit arrive?". We read the settlement balance
//! directly and compare it with their queued investment, if any:
//!
//!   balance >= target             → ready to complete
//!   0 < balance < target, and up  → shortfall, offer a partial investment
//!   otherwise                     → no new funds yet
//!
//! Without a queued investment the answer is simply found / not found.
//! Nothing here stops a window except completing (or partially completing)
//! the queued investment, or an explicit cancel. A deployment claims the
//! window with `stop` before any funds move, exactly like the dispatcher.

pub mod schedule;

pub use schedule::RecheckScheduler;

use crate::deploy::{capability_for, DeployOutcome, DeploymentPipeline, DeploymentTarget};
use crate::monitor::RefreshTrigger;
use crate::notify::{self, messages};
use crate::onchain::BalanceReader;
use crate::store::{MonitorContext, MonitoringWindow, PendingTransaction, StoreError, WindowStore};
use crate::watch::{WatchSetLoader, WatchedWallet};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ManualCheckError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no wallet address known for user {0}")]
    UnknownUser(String),
    #[error("balance read failed: {0}")]
    Balance(#[source] anyhow::Error),
    #[error("no pending investment for user {0}")]
    NoPending(String),
    #[error("no active window for user {0}, a deployment may already be running")]
    NotActive(String),
    #[error("balance {balance} is below the required {required}")]
    InsufficientBalance { balance: Decimal, required: Decimal },
    #[error("amount must be positive")]
    InvalidAmount,
    #[error("nothing to invest")]
    NothingToInvest,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    ReadyToComplete { balance: Decimal, target: Decimal },
    Shortfall {
        balance: Decimal,
        target: Decimal,
        shortage: Decimal,
    },
    NoNewFunds { balance: Decimal },
    Found { balance: Decimal },
    NotFound,
}

impl CheckOutcome {
    pub fn message(&self) -> String {
        match self {
            CheckOutcome::ReadyToComplete { balance, target } => {
                messages::ready_to_complete(*balance, *target)
            }
            CheckOutcome::Shortfall {
                balance,
                target,
                shortage,
            } => messages::shortfall(*balance, *target, *shortage),
            CheckOutcome::NoNewFunds { balance } => messages::no_new_funds(*balance),
            CheckOutcome::Found { balance } => messages::found(*balance),
            CheckOutcome::NotFound => messages::not_found(),
        }
    }

    /// Whether another look later could change the answer.
    pub fn worth_rechecking(&self) -> bool {
        !matches!(
            self,
            CheckOutcome::ReadyToComplete { .. } | CheckOutcome::Found { .. }
        )
    }
}

/// Request to queue an investment the current balance cannot cover yet.
#[derive(Debug, Clone)]
pub struct QueueRequest {
    pub amount: Decimal,
    pub protocol_hint: Option<String>,
    pub pool_id: Option<String>,
    pub apy: Option<f64>,
    pub ttl_minutes: Option<u32>,
}

pub struct ManualChecker {
    store: Arc<dyn WindowStore>,
    loader: WatchSetLoader,
    balances: Arc<dyn BalanceReader>,
    pipeline: Arc<DeploymentPipeline>,
    scheduler: RecheckScheduler,
    refresh: RefreshTrigger,
    default_ttl_minutes: u32,
}

impl ManualChecker {
    pub fn new(
        store: Arc<dyn WindowStore>,
        loader: WatchSetLoader,
        balances: Arc<dyn BalanceReader>,
        pipeline: Arc<DeploymentPipeline>,
        scheduler: RecheckScheduler,
        refresh: RefreshTrigger,
        default_ttl_minutes: u32,
    ) -> Self {
        Self {
            store,
            loader,
            balances,
            pipeline,
            scheduler,
            refresh,
            default_ttl_minutes,
        }
    }

    async fn wallet_and_balance(
        &self,
        user_id: &str,
        fallback_address: Option<&str>,
    ) -> Result<(WatchedWallet, Decimal), ManualCheckError> {
        let wallet = self
            .loader
            .resolve_user(user_id, fallback_address)
            .await
            .ok_or_else(|| ManualCheckError::UnknownUser(user_id.to_string()))?;
        let balance = self
            .balances
            .balance_of(wallet.address)
            .await
            .map_err(ManualCheckError::Balance)?;
        Ok((wallet, balance))
    }

    /// Compare the current balance with whatever the user is waiting for.
    pub async fn check(&self, user_id: &str) -> Result<CheckOutcome, ManualCheckError> {
        let now = Utc::now();
        let window = self.store.get(user_id).await?;
        let fallback = window.as_ref().and_then(|w| w.metadata_address());
        let (wallet, balance) = self.wallet_and_balance(user_id, fallback).await?;

        let previous = window
            .as_ref()
            .filter(|w| w.is_active(now))
            .and_then(|w| w.last_seen_balance);
        self.store.record_balance(user_id, balance).await?;

        let outcome = match self.store.get_pending(user_id).await? {
            Some(mut pending) => {
                if balance >= pending.amount {
                    pending.shortage = Decimal::ZERO;
                    self.store.put_pending(&pending).await?;
                    CheckOutcome::ReadyToComplete {
                        balance,
                        target: pending.amount,
                    }
                } else if balance > Decimal::ZERO && previous.map_or(true, |p| balance > p) {
                    pending.shortage = pending.amount - balance;
                    self.store.put_pending(&pending).await?;
                    CheckOutcome::Shortfall {
                        balance,
                        target: pending.amount,
                        shortage: pending.shortage,
                    }
                } else {
                    CheckOutcome::NoNewFunds { balance }
                }
            }
            None if balance > Decimal::ZERO => CheckOutcome::Found { balance },
            None => CheckOutcome::NotFound,
        };

        info!(
            user_id = user_id,
            address = %wallet.canonical_address(),
            balance = %balance,
            outcome = ?outcome,
            "manual balance check"
        );
        Ok(outcome)
    }

    /// Check now and, if the answer may still change, look again once after
    /// the recheck delay and message the user with the result.
    pub async fn check_and_schedule(
        self: &Arc<Self>,
        user_id: &str,
    ) -> Result<CheckOutcome, ManualCheckError> {
        let outcome = self.check(user_id).await?;
        if !outcome.worth_rechecking() {
            return Ok(outcome);
        }

        let Some(window) = self.store.get(user_id).await? else {
            return Ok(outcome);
        };
        if !window.is_active(Utc::now()) {
            return Ok(outcome);
        }

        let checker = self.clone();
        let user = user_id.to_string();
        let started_at = window.started_at;
        self.scheduler.schedule(user_id, async move {
            checker.recheck(&user, started_at).await;
        });
        Ok(outcome)
    }

    async fn recheck(&self, user_id: &str, window_started_at: DateTime<Utc>) {
        match self.store.get(user_id).await {
            Ok(Some(w)) if w.started_at == window_started_at && w.is_active(Utc::now()) => {}
            Ok(_) => {
                debug!(user_id = user_id, "window stopped or replaced, skipping recheck");
                return;
            }
            Err(e) => {
                warn!(user_id = user_id, error = %e, "recheck could not read window");
                return;
            }
        }

        match self.check(user_id).await {
            Ok(outcome) => {
                notify::deliver(self.pipeline.notifier().as_ref(), user_id, &outcome.message())
                    .await;
            }
            Err(e) => warn!(user_id = user_id, error = %e, "scheduled recheck failed"),
        }
    }

    /// Funds landed on a wallet with a queued investment. The window stays
    /// open; the user hears how far along they are and decides what to do.
    pub async fn report_arrival(&self, user_id: &str) {
        match self.check(user_id).await {
            Ok(
                outcome @ (CheckOutcome::Shortfall { .. } | CheckOutcome::ReadyToComplete { .. }),
            ) => {
                notify::deliver(self.pipeline.notifier().as_ref(), user_id, &outcome.message())
                    .await;
            }
            Ok(outcome) => {
                debug!(user_id = user_id, outcome = ?outcome, "arrival did not change the picture");
            }
            Err(e) => warn!(user_id = user_id, error = %e, "arrival check failed"),
        }
    }

    /// Record an investment the user wants once enough funds arrive, and
    /// start watching their wallet for it.
    pub async fn queue_investment(
        &self,
        user_id: &str,
        request: QueueRequest,
    ) -> Result<PendingTransaction, ManualCheckError> {
        if request.amount <= Decimal::ZERO {
            return Err(ManualCheckError::InvalidAmount);
        }
        let ttl_minutes = request.ttl_minutes.unwrap_or(self.default_ttl_minutes);
        let (wallet, balance) = self.wallet_and_balance(user_id, None).await?;

        let shortage = (request.amount - balance).max(Decimal::ZERO);
        let pending = PendingTransaction {
            user_id: user_id.to_string(),
            amount: request.amount,
            protocol_hint: request.protocol_hint,
            pool_id: request.pool_id,
            apy: request.apy,
            shortage,
            expires_at: Utc::now() + Duration::minutes(i64::from(ttl_minutes)),
        };
        self.store.put_pending(&pending).await?;

        let mut metadata = Map::new();
        metadata.insert(
            "wallet_address".to_string(),
            Value::String(wallet.canonical_address()),
        );
        metadata.insert(
            "amount".to_string(),
            Value::String(request.amount.to_string()),
        );
        self.store
            .start(user_id, MonitorContext::PendingInvestment, ttl_minutes, metadata)
            .await?;
        self.store.record_balance(user_id, balance).await?;
        self.refresh.force_refresh();

        info!(
            user_id = user_id,
            amount = %pending.amount,
            shortage = %pending.shortage,
            "investment queued"
        );
        Ok(pending)
    }

    fn target_for(&self, pending: &PendingTransaction) -> Option<DeploymentTarget> {
        let hint = pending.protocol_hint.as_deref()?;
        let capability = capability_for(hint)?;
        Some(DeploymentTarget {
            protocol_name: hint.to_string(),
            apy: pending.apy,
            capability,
        })
    }

    /// Deploy the queued amount. Requires the balance to cover it.
    pub async fn complete(&self, user_id: &str) -> Result<DeployOutcome, ManualCheckError> {
        let pending = self
            .store
            .get_pending(user_id)
            .await?
            .ok_or_else(|| ManualCheckError::NoPending(user_id.to_string()))?;
        let window = self.store.get(user_id).await?;
        let fallback = window.as_ref().and_then(|w| w.metadata_address());
        let (_, balance) = self.wallet_and_balance(user_id, fallback).await?;

        if balance < pending.amount {
            return Err(ManualCheckError::InsufficientBalance {
                balance,
                required: pending.amount,
            });
        }
        self.deploy_pending(&pending, window, pending.amount).await
    }

    /// Deploy whatever the balance holds now instead of waiting for the rest.
    pub async fn invest_partial(&self, user_id: &str) -> Result<DeployOutcome, ManualCheckError> {
        let pending = self
            .store
            .get_pending(user_id)
            .await?
            .ok_or_else(|| ManualCheckError::NoPending(user_id.to_string()))?;
        let window = self.store.get(user_id).await?;
        let fallback = window.as_ref().and_then(|w| w.metadata_address());
        let (_, balance) = self.wallet_and_balance(user_id, fallback).await?;

        if balance <= Decimal::ZERO {
            return Err(ManualCheckError::NothingToInvest);
        }
        self.deploy_pending(&pending, window, balance.min(pending.amount))
            .await
    }

    async fn deploy_pending(
        &self,
        pending: &PendingTransaction,
        window: Option<MonitoringWindow>,
        amount: Decimal,
    ) -> Result<DeployOutcome, ManualCheckError> {
        let user_id = pending.user_id.as_str();
        if !self.store.stop(user_id).await? {
            return Err(ManualCheckError::NotActive(user_id.to_string()));
        }
        self.scheduler.cancel(user_id);

        let target = match self.target_for(pending) {
            Some(t) => t,
            None => self.pipeline.resolve_target().await,
        };
        let outcome = self.pipeline.execute(user_id, amount, &target, None).await;

        if outcome.success {
            self.store.clear_pending(user_id).await?;
        } else {
            // Funds stayed put: reopen the window so the user can try again.
            let remaining = (pending.expires_at - Utc::now()).num_minutes().max(1);
            let ttl_minutes = u32::try_from(remaining).unwrap_or(u32::MAX);
            let metadata = window.map(|w| w.metadata).unwrap_or_default();
            self.store
                .start(user_id, MonitorContext::PendingInvestment, ttl_minutes, metadata)
                .await?;
            info!(user_id = user_id, "deployment failed, pending investment kept");
        }
        self.refresh.force_refresh();
        Ok(outcome)
    }

    /// Drop the queued investment and stop watching. Returns true if an
    /// active window was stopped.
    pub async fn cancel(&self, user_id: &str) -> Result<bool, ManualCheckError> {
        let stopped = self.store.stop(user_id).await?;
        self.store.clear_pending(user_id).await?;
        self.scheduler.cancel(user_id);
        self.refresh.force_refresh();

        let notifier = self.pipeline.notifier();
        notify::deliver(notifier.as_ref(), user_id, &messages::cancelled()).await;
        info!(user_id = user_id, stopped = stopped, "pending investment cancelled");
        Ok(stopped)
    }
}
