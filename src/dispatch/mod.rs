//! Deposit dispatcher.
//!
//! Turns a matched deposit into exactly one deployment. The window stop is
//! the claim: only the caller whose `stop` actually flipped the window goes
//! on to deploy, so a repeated push, a reconnect replay or the balance
//! poller seeing the same funds are all dropped here.
//!
//! Funds arriving toward a queued investment are not deployed: the user
//! gets a progress report and the window stays open until they complete.

use crate::deploy::DeploymentPipeline;
use crate::manual::{ManualChecker, RecheckScheduler};
use crate::monitor::RefreshTrigger;
use crate::onchain::DepositMatch;
use crate::store::{MonitorContext, WindowStore};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Receives matched deposits from the listener and the poller.
#[async_trait]
pub trait DepositSink: Send + Sync {
    /// Must return quickly; deployment work belongs in a spawned task.
    async fn on_deposit(&self, deposit: DepositMatch);
}

pub struct DepositDispatcher {
    store: Arc<dyn WindowStore>,
    refresh: RefreshTrigger,
    pipeline: Arc<DeploymentPipeline>,
    scheduler: RecheckScheduler,
    checker: Arc<ManualChecker>,
}

impl DepositDispatcher {
    pub fn new(
        store: Arc<dyn WindowStore>,
        refresh: RefreshTrigger,
        pipeline: Arc<DeploymentPipeline>,
        scheduler: RecheckScheduler,
        checker: Arc<ManualChecker>,
    ) -> Self {
        Self {
            store,
            refresh,
            pipeline,
            scheduler,
            checker,
        }
    }

    /// Claim the user's window and hand the deposit to the pipeline, or
    /// report progress on a queued investment.
    ///
    /// Returns the spawned task, or `None` when the match was dropped.
    pub async fn dispatch(&self, deposit: DepositMatch) -> Option<JoinHandle<()>> {
        let user_id = deposit.wallet.user_id.clone();

        match self.store.get(&user_id).await {
            Ok(Some(w))
                if w.context == MonitorContext::PendingInvestment && w.is_active(Utc::now()) =>
            {
                return Some(self.report_progress(deposit));
            }
            Ok(_) => {}
            Err(e) => {
                error!(user_id = %user_id, error = %e, "could not read window, skipping dispatch");
                return None;
            }
        }

        match self.store.stop(&user_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    user_id = %user_id,
                    tx = %deposit.tx_hash,
                    source = %deposit.source,
                    "window already stopped, dropping duplicate match"
                );
                return None;
            }
            Err(e) => {
                // Without the claim we cannot rule out a second deployment.
                error!(
                    user_id = %user_id,
                    error = %e,
                    "could not stop window, skipping dispatch"
                );
                return None;
            }
        }

        info!(
            user_id = %user_id,
            amount = %deposit.amount,
            tx = %deposit.tx_hash,
            source = %deposit.source,
            "dispatching deposit"
        );

        self.scheduler.cancel(&user_id);
        self.refresh.force_refresh();

        let pipeline = self.pipeline.clone();
        Some(tokio::spawn(async move {
            pipeline.run(&deposit).await;
        }))
    }

    fn report_progress(&self, deposit: DepositMatch) -> JoinHandle<()> {
        info!(
            user_id = %deposit.wallet.user_id,
            amount = %deposit.amount,
            tx = %deposit.tx_hash,
            source = %deposit.source,
            "funds arrived toward a queued investment"
        );
        self.scheduler.cancel(&deposit.wallet.user_id);

        let checker = self.checker.clone();
        tokio::spawn(async move {
            checker.report_arrival(&deposit.wallet.user_id).await;
        })
    }
}

#[async_trait]
impl DepositSink for DepositDispatcher {
    async fn on_deposit(&self, deposit: DepositMatch) {
        self.dispatch(deposit).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::tests::{FakeAdapter, FixedYields};
    use crate::deploy::Venue;
    use crate::manual::tests::ScriptedBalances;
    use crate::manual::QueueRequest;
    use crate::monitor::{
        ConnectionController, ConnectionState, ControllerConfig, SessionLauncher,
    };
    use crate::notify::tests::RecordingNotifier;
    use crate::onchain::abi;
    use crate::onchain::types::match_deposit;
    use crate::onchain::{ChainLogEvent, DepositSource};
    use crate::store::{MemoryWindowStore, MonitorContext};
    use crate::watch::tests::FakeDirectory;
    use crate::watch::{WatchSet, WatchSetLoader, WatchedWallet};
    use alloy::primitives::{Address, Bytes, B256, U256};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::Map;
    use std::time::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch;

    fn token() -> Address {
        Address::repeat_byte(0xcc)
    }

    struct Parts {
        store: Arc<MemoryWindowStore>,
        adapter: Arc<FakeAdapter>,
        notifier: Arc<RecordingNotifier>,
        balances: Arc<ScriptedBalances>,
        checker: Arc<ManualChecker>,
        dispatcher: Arc<DepositDispatcher>,
        trigger: RefreshTrigger,
    }

    fn parts() -> Parts {
        let store = Arc::new(MemoryWindowStore::new());
        let adapter = Arc::new(FakeAdapter::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let pipeline = Arc::new(DeploymentPipeline::new(
            Arc::new(FixedYields(Ok(vec![Venue {
                name: "Aave V3".to_string(),
                apy: 4.75,
            }]))),
            adapter.clone(),
            notifier.clone(),
        ));
        let trigger = RefreshTrigger::new();
        let scheduler = RecheckScheduler::new(Duration::from_secs(30));
        let balances = Arc::new(ScriptedBalances::default());
        let loader = WatchSetLoader::new(Arc::new(FakeDirectory::default().with_user(
            "u1",
            Address::repeat_byte(0x01),
            None,
        )));
        let checker = Arc::new(ManualChecker::new(
            store.clone(),
            loader,
            balances.clone(),
            pipeline.clone(),
            scheduler.clone(),
            trigger.clone(),
            30,
        ));
        let dispatcher = Arc::new(DepositDispatcher::new(
            store.clone(),
            trigger.clone(),
            pipeline,
            scheduler,
            checker.clone(),
        ));
        Parts {
            store,
            adapter,
            notifier,
            balances,
            checker,
            dispatcher,
            trigger,
        }
    }

    fn deposit(user_id: &str, source: DepositSource) -> DepositMatch {
        DepositMatch {
            wallet: WatchedWallet::new(Address::repeat_byte(0x01), user_id, "Alice"),
            amount: Decimal::new(1250, 2),
            tx_hash: "0xabc".to_string(),
            block_number: Some(7),
            source,
        }
    }

    #[tokio::test]
    async fn test_no_duplicate_dispatch() {
        let p = parts();
        p.store
            .start("u1", MonitorContext::Onboarding, 5, Map::new())
            .await
            .unwrap();

        let first = p.dispatcher.dispatch(deposit("u1", DepositSource::Subscription)).await;
        let replay = p.dispatcher.dispatch(deposit("u1", DepositSource::Subscription)).await;
        let polled = p.dispatcher.dispatch(deposit("u1", DepositSource::BalancePoll)).await;

        assert!(first.is_some());
        assert!(replay.is_none());
        assert!(polled.is_none());
        first.unwrap().await.unwrap();
        assert_eq!(p.adapter.calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_match_without_window_is_dropped() {
        let p = parts();
        assert!(p
            .dispatcher
            .dispatch(deposit("ghost", DepositSource::Subscription))
            .await
            .is_none());
        assert!(p.adapter.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_partial_deposit_toward_queued_investment_is_not_deployed() {
        let p = parts();
        p.checker
            .queue_investment(
                "u1",
                QueueRequest {
                    amount: Decimal::from(100),
                    protocol_hint: None,
                    pool_id: None,
                    apy: None,
                    ttl_minutes: None,
                },
            )
            .await
            .unwrap();

        p.balances
            .set(Address::repeat_byte(0x01), Decimal::from(40))
            .await;
        let mut arrival = deposit("u1", DepositSource::Subscription);
        arrival.amount = Decimal::from(40);
        let task = p.dispatcher.dispatch(arrival).await;
        task.unwrap().await.unwrap();

        assert!(p.adapter.calls.lock().await.is_empty());
        let active = p.store.list_active(Utc::now()).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].context, MonitorContext::PendingInvestment);
        let pending = p.store.get_pending("u1").await.unwrap().unwrap();
        assert_eq!(pending.amount, Decimal::from(100));
        assert_eq!(pending.shortage, Decimal::from(60));

        let sent = p.notifier.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("still need 60.00 USDC"));
    }

    #[tokio::test]
    async fn test_queued_investment_completes_after_remaining_funds() {
        let p = parts();
        p.checker
            .queue_investment(
                "u1",
                QueueRequest {
                    amount: Decimal::from(100),
                    protocol_hint: None,
                    pool_id: None,
                    apy: None,
                    ttl_minutes: None,
                },
            )
            .await
            .unwrap();

        p.balances
            .set(Address::repeat_byte(0x01), Decimal::from(100))
            .await;
        let task = p
            .dispatcher
            .dispatch(deposit("u1", DepositSource::BalancePoll))
            .await;
        task.unwrap().await.unwrap();
        assert!(p.notifier.sent.lock().await[0].1.contains("enough"));

        let outcome = p.checker.complete("u1").await.unwrap();
        assert!(outcome.success);
        assert_eq!(p.adapter.calls.lock().await.len(), 1);
        assert!(p.store.list_active(Utc::now()).await.unwrap().is_empty());
    }

    /// Session that "receives" one Transfer to the first watched wallet
    /// after `delay`, then idles until closed.
    struct OneDepositLauncher {
        sink: Arc<dyn DepositSink>,
        delay: Duration,
        sessions: AtomicUsize,
    }

    impl SessionLauncher for OneDepositLauncher {
        fn launch(
            &self,
            snapshot: watch::Receiver<Arc<WatchSet>>,
            mut shutdown: watch::Receiver<bool>,
        ) -> JoinHandle<anyhow::Result<()>> {
            let sink = self.sink.clone();
            let delay = self.delay;
            self.sessions.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return Ok(()),
                }
                let set = snapshot.borrow().clone();
                if let Some(wallet) = set.wallets().next() {
                    let mut to = [0u8; 32];
                    to[12..].copy_from_slice(wallet.address.as_slice());
                    let event = ChainLogEvent {
                        contract_address: token(),
                        topics: vec![abi::TRANSFER_TOPIC, B256::ZERO, B256::from(to)],
                        data: Bytes::from(U256::from(10_000_000u64).to_be_bytes::<32>().to_vec()),
                        transaction_hash: Some(B256::repeat_byte(0x11)),
                        block_number: Some(100),
                        removed: false,
                    };
                    if let Ok(Some(deposit)) = match_deposit(&event, &set, token(), 6) {
                        sink.on_deposit(deposit).await;
                    }
                }
                let _ = shutdown.changed().await;
                Ok(())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_onboarding_deposit_end_to_end() {
        let p = parts();
        let launcher = Arc::new(OneDepositLauncher {
            sink: p.dispatcher.clone(),
            delay: Duration::from_secs(10),
            sessions: AtomicUsize::new(0),
        });
        let loader = WatchSetLoader::new(Arc::new(FakeDirectory::default().with_user(
            "U",
            Address::repeat_byte(0x0a),
            Some(Address::repeat_byte(0x0b)),
        )));
        let controller = ConnectionController::new(
            ControllerConfig {
                fast_period: Duration::from_secs(5),
                slow_period: Duration::from_secs(30),
                reconnect_backoff: Duration::from_secs(10),
            },
            p.store.clone(),
            loader,
            launcher.clone(),
            p.trigger.clone(),
        );
        let (handle, _task) = controller.spawn();

        p.store
            .start("U", MonitorContext::Onboarding, 5, Map::new())
            .await
            .unwrap();
        handle.force_refresh();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.state(), ConnectionState::Active);

        tokio::time::sleep(Duration::from_secs(15)).await;

        let sent = p.notifier.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "U");
        assert!(sent[0].1.contains("10.00 USDC"));
        assert!(sent[0].1.contains("deployed"));
        assert!(p.store.list_active(Utc::now()).await.unwrap().is_empty());
        assert_eq!(handle.state(), ConnectionState::Idle);
        assert_eq!(launcher.sessions.load(Ordering::SeqCst), 1);
    }
}
