//! Connection lifecycle controller.
//!
//! Two states:
//!   IDLE   → no live subscription, re-evaluated every `slow_period`
//!   ACTIVE → subscription open, re-evaluated every `fast_period`
//!
//! Each evaluation lists the active windows, resolves a fresh watch set,
//! publishes it as the new snapshot and opens or closes the subscription
//! depending on whether the set is empty. `force_refresh` wakes the loop
//! immediately; redundant calls coalesce into one evaluation.
//!
//! A session that ends without being asked to drops us back to IDLE and
//! arms a fixed back-off before the next open attempt.

pub mod poller;

pub use poller::BalancePoller;

use crate::config::MonitorConfig;
use crate::onchain::ChainListener;
use crate::store::WindowStore;
use crate::watch::{WatchSet, WatchSetLoader};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long a closing session gets to stop its read loop and drop its connection.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Active,
}

/// Coalescing wake-up for the controller loop. Cheap to clone and safe to
/// fire from any task, any number of times.
#[derive(Clone, Default)]
pub struct RefreshTrigger {
    notify: Arc<Notify>,
}

impl RefreshTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force_refresh(&self) {
        // At most one stored permit: a burst of calls wakes the loop once.
        self.notify.notify_one();
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Opens one subscription session. The session must end once `shutdown`
/// flips to true, and should return `Err` for any ending it was not asked for.
pub trait SessionLauncher: Send + Sync {
    fn launch(
        &self,
        snapshot: watch::Receiver<Arc<WatchSet>>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<anyhow::Result<()>>;
}

/// Launches `ChainListener` sessions on the runtime.
pub struct ListenerLauncher {
    listener: Arc<ChainListener>,
}

impl ListenerLauncher {
    pub fn new(listener: Arc<ChainListener>) -> Self {
        Self { listener }
    }
}

impl SessionLauncher for ListenerLauncher {
    fn launch(
        &self,
        snapshot: watch::Receiver<Arc<WatchSet>>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<anyhow::Result<()>> {
        let listener = self.listener.clone();
        tokio::spawn(async move {
            listener
                .run_session(snapshot, shutdown)
                .await
                .map_err(anyhow::Error::from)
        })
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub fast_period: Duration,
    pub slow_period: Duration,
    pub reconnect_backoff: Duration,
}

impl From<&MonitorConfig> for ControllerConfig {
    fn from(c: &MonitorConfig) -> Self {
        Self {
            fast_period: c.fast_period(),
            slow_period: c.slow_period(),
            reconnect_backoff: c.reconnect_backoff(),
        }
    }
}

/// Cloneable view of a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    trigger: RefreshTrigger,
    state: watch::Receiver<ConnectionState>,
    snapshot: watch::Receiver<Arc<WatchSet>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ControllerHandle {
    /// Re-evaluate the watch set now instead of at the next scheduled check.
    pub fn force_refresh(&self) {
        self.trigger.force_refresh();
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// The snapshot the listener is currently matching against.
    pub fn snapshot(&self) -> Arc<WatchSet> {
        self.snapshot.borrow().clone()
    }

    pub fn snapshot_receiver(&self) -> watch::Receiver<Arc<WatchSet>> {
        self.snapshot.clone()
    }

    /// Receiver that flips to true when the controller is shut down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop the controller loop and close any open session.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

struct Session {
    handle: JoinHandle<anyhow::Result<()>>,
    stop_tx: watch::Sender<bool>,
    opened_at: Instant,
}

enum Wake {
    Timer,
    Forced,
    SessionEnded(Result<anyhow::Result<()>, JoinError>),
    Shutdown,
}

pub struct ConnectionController {
    config: ControllerConfig,
    store: Arc<dyn WindowStore>,
    loader: WatchSetLoader,
    launcher: Arc<dyn SessionLauncher>,
    trigger: RefreshTrigger,
    snapshot_tx: watch::Sender<Arc<WatchSet>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    session: Option<Session>,
    reopen_after: Option<Instant>,
}

impl ConnectionController {
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn WindowStore>,
        loader: WatchSetLoader,
        launcher: Arc<dyn SessionLauncher>,
        trigger: RefreshTrigger,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(WatchSet::empty()));
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            store,
            loader,
            launcher,
            trigger,
            snapshot_tx,
            state_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            session: None,
            reopen_after: None,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            trigger: self.trigger.clone(),
            state: self.state_tx.subscribe(),
            snapshot: self.snapshot_tx.subscribe(),
            shutdown: self.shutdown_tx.clone(),
        }
    }

    /// Start the controller loop in a background task.
    pub fn spawn(self) -> (ControllerHandle, JoinHandle<()>) {
        let handle = self.handle();
        let task = tokio::spawn(self.run());
        (handle, task)
    }

    pub async fn run(mut self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let trigger = self.trigger.clone();
        info!(
            fast_secs = self.config.fast_period.as_secs(),
            slow_secs = self.config.slow_period.as_secs(),
            "connection controller started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            self.evaluate().await;
            let period = self.next_period();

            let wake = tokio::select! {
                _ = tokio::time::sleep(period) => Wake::Timer,
                _ = trigger.notified() => Wake::Forced,
                result = wait_session(&mut self.session) => Wake::SessionEnded(result),
                _ = shutdown_rx.changed() => Wake::Shutdown,
            };

            match wake {
                Wake::Timer => {}
                Wake::Forced => debug!("forced refresh"),
                Wake::SessionEnded(result) => self.on_session_ended(result),
                Wake::Shutdown => break,
            }
        }

        self.close_session().await;
        self.set_state(ConnectionState::Idle);
        info!("connection controller stopped");
    }

    async fn evaluate(&mut self) {
        // Reap a session that died between wake-ups.
        if self.session.as_ref().is_some_and(|s| s.handle.is_finished()) {
            if let Some(session) = self.session.take() {
                let result = session.handle.await;
                self.on_session_ended(result);
            }
        }

        let windows = match self.store.list_active(Utc::now()).await {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "failed to list active windows, deferring to next cycle");
                return;
            }
        };

        let watch_set = Arc::new(self.loader.resolve(&windows).await);
        let watched = watch_set.len();
        self.snapshot_tx.send_replace(watch_set);

        if watched == 0 {
            if self.session.is_some() {
                info!("watch set empty, closing subscription");
                self.close_session().await;
            }
        } else if self.session.is_none() {
            match self.reopen_after {
                Some(t) if Instant::now() < t => {
                    debug!(
                        watched = watched,
                        wait_ms = (t - Instant::now()).as_millis() as u64,
                        "reconnect back-off still running"
                    );
                }
                _ => self.open_session(watched),
            }
        }

        let state = if self.session.is_some() {
            ConnectionState::Active
        } else {
            ConnectionState::Idle
        };
        self.set_state(state);
    }

    fn next_period(&self) -> Duration {
        match *self.state_tx.borrow() {
            ConnectionState::Active => self.config.fast_period,
            ConnectionState::Idle => {
                let slow = self.config.slow_period;
                match self.reopen_after {
                    Some(t) if t > Instant::now() => slow.min(t - Instant::now()),
                    _ => slow,
                }
            }
        }
    }

    fn open_session(&mut self, watched: usize) {
        info!(watched = watched, "opening chain subscription");
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = self.launcher.launch(self.snapshot_tx.subscribe(), stop_rx);
        self.reopen_after = None;
        self.session = Some(Session {
            handle,
            stop_tx,
            opened_at: Instant::now(),
        });
    }

    async fn close_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let _ = session.stop_tx.send(true);
        let mut handle = session.handle;
        match tokio::time::timeout(CLOSE_TIMEOUT, &mut handle).await {
            Ok(Ok(Ok(()))) => {
                info!(
                    uptime_secs = session.opened_at.elapsed().as_secs(),
                    "chain subscription closed"
                );
            }
            Ok(Ok(Err(e))) => {
                debug!(error = %e, "session reported an error while closing");
            }
            Ok(Err(e)) => {
                error!(error = %e, "session task failed while closing");
            }
            Err(_) => {
                warn!("session did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    fn on_session_ended(&mut self, result: Result<anyhow::Result<()>, JoinError>) {
        let uptime = self
            .session
            .take()
            .map(|s| s.opened_at.elapsed().as_secs())
            .unwrap_or(0);

        match result {
            Ok(Ok(())) => info!(uptime_secs = uptime, "chain subscription ended"),
            Ok(Err(e)) => warn!(error = %e, uptime_secs = uptime, "chain subscription dropped"),
            Err(e) => error!(error = %e, "chain subscription task panicked"),
        }

        self.reopen_after = Some(Instant::now() + self.config.reconnect_backoff);
        info!(
            backoff_secs = self.config.reconnect_backoff.as_secs(),
            "will retry subscription after back-off"
        );
        self.set_state(ConnectionState::Idle);
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            info!(from = ?prev, to = ?next, "connection state changed");
        }
    }
}

async fn wait_session(session: &mut Option<Session>) -> Result<anyhow::Result<()>, JoinError> {
    match session {
        Some(s) => (&mut s.handle).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::{MemoryWindowStore, MonitorContext};
    use crate::watch::tests::FakeDirectory;
    use alloy::primitives::Address;
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Sessions that idle until told to stop, or drop after a second when
    /// `drop_sessions` is set.
    #[derive(Default)]
    pub struct FakeLauncher {
        pub launches: AtomicUsize,
        pub closed: Arc<AtomicUsize>,
        pub drop_sessions: AtomicBool,
    }

    impl SessionLauncher for FakeLauncher {
        fn launch(
            &self,
            _snapshot: watch::Receiver<Arc<WatchSet>>,
            mut shutdown: watch::Receiver<bool>,
        ) -> JoinHandle<anyhow::Result<()>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let drop_it = self.drop_sessions.load(Ordering::SeqCst);
            let closed = self.closed.clone();
            tokio::spawn(async move {
                if drop_it {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    anyhow::bail!("upstream went away");
                }
                let _ = shutdown.changed().await;
                closed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    fn config() -> ControllerConfig {
        ControllerConfig {
            fast_period: Duration::from_secs(5),
            slow_period: Duration::from_secs(30),
            reconnect_backoff: Duration::from_secs(10),
        }
    }

    fn meta(addr: Address) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("wallet_address".to_string(), Value::String(addr.to_string()));
        m
    }

    fn setup(
        launcher: Arc<FakeLauncher>,
    ) -> (Arc<MemoryWindowStore>, ControllerHandle, JoinHandle<()>) {
        let store = Arc::new(MemoryWindowStore::new());
        let loader = WatchSetLoader::new(Arc::new(FakeDirectory::default()));
        let controller = ConnectionController::new(
            config(),
            store.clone(),
            loader,
            launcher,
            RefreshTrigger::new(),
        );
        let (handle, task) = controller.spawn();
        (store, handle, task)
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_without_windows() {
        let launcher = Arc::new(FakeLauncher::default());
        let (_store, handle, _task) = setup(launcher.clone());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(handle.state(), ConnectionState::Idle);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
        assert!(handle.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_activates_within_fast_period() {
        let launcher = Arc::new(FakeLauncher::default());
        let (store, handle, _task) = setup(launcher.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        store
            .start("u1", MonitorContext::Onboarding, 5, meta(Address::repeat_byte(0x01)))
            .await
            .unwrap();
        handle.force_refresh();

        tokio::time::sleep(config().fast_period).await;
        assert_eq!(handle.state(), ConnectionState::Active);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert!(handle.snapshot().contains_user("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_goes_idle_within_slow_period_after_stop() {
        let launcher = Arc::new(FakeLauncher::default());
        let (store, handle, _task) = setup(launcher.clone());

        store
            .start("u1", MonitorContext::Onboarding, 5, meta(Address::repeat_byte(0x01)))
            .await
            .unwrap();
        handle.force_refresh();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.state(), ConnectionState::Active);

        store.stop("u1").await.unwrap();
        tokio::time::sleep(config().slow_period).await;

        assert_eq!(handle.state(), ConnectionState::Idle);
        assert_eq!(launcher.closed.load(Ordering::SeqCst), 1);
        assert!(handle.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_redundant_refreshes_open_one_session() {
        let launcher = Arc::new(FakeLauncher::default());
        let (store, handle, _task) = setup(launcher.clone());

        store
            .start("u1", MonitorContext::Onboarding, 5, meta(Address::repeat_byte(0x01)))
            .await
            .unwrap();
        for _ in 0..10 {
            handle.force_refresh();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        store
            .start("u2", MonitorContext::Onboarding, 5, meta(Address::repeat_byte(0x02)))
            .await
            .unwrap();
        handle.force_refresh();
        handle.force_refresh();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(handle.snapshot().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_session_backs_off_before_reopening() {
        let launcher = Arc::new(FakeLauncher::default());
        launcher.drop_sessions.store(true, Ordering::SeqCst);
        let (store, handle, _task) = setup(launcher.clone());

        store
            .start("u1", MonitorContext::Onboarding, 5, meta(Address::repeat_byte(0x01)))
            .await
            .unwrap();
        handle.force_refresh();

        // Session drops at t≈1s; back-off runs until t≈11s.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle.state(), ConnectionState::Idle);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

        // A forced refresh does not cut the back-off short.
        handle.force_refresh();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

        launcher.drop_sessions.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        assert_eq!(handle.state(), ConnectionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_session() {
        let launcher = Arc::new(FakeLauncher::default());
        let (store, handle, task) = setup(launcher.clone());

        store
            .start("u1", MonitorContext::Onboarding, 5, meta(Address::repeat_byte(0x01)))
            .await
            .unwrap();
        handle.force_refresh();
        tokio::time::sleep(Duration::from_millis(10)).await;

        handle.shutdown();
        task.await.unwrap();

        assert_eq!(launcher.closed.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), ConnectionState::Idle);
    }
}
