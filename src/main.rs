use deposit_monitor::api::{self, ApiState};
use deposit_monitor::config::Config;
use deposit_monitor::deploy::{DeploymentPipeline, HttpDeploymentAdapter, HttpYieldSource};
use deposit_monitor::dispatch::DepositDispatcher;
use deposit_monitor::manual::{ManualChecker, RecheckScheduler};
use deposit_monitor::monitor::{
    BalancePoller, ConnectionController, ControllerConfig, ListenerLauncher, RefreshTrigger,
};
use deposit_monitor::notify::{LogNotifier, Notifier, TelegramNotifier};
use deposit_monitor::onchain::listener::probe;
use deposit_monitor::onchain::{BalanceReader, ChainListener, ListenerConfig, RpcBalanceReader};
use deposit_monitor::store::{MemoryWindowStore, ValkeyWindowStore, WindowStore};
use deposit_monitor::watch::{HttpAccountDirectory, WatchSetLoader};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

const CONFIG_FILE: &str = "deposit-monitor.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = if Path::new(CONFIG_FILE).exists() {
        Config::load(Path::new(CONFIG_FILE))?
    } else {
        Config::from_env()?
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("deposit-monitor v{} starting", env!("CARGO_PKG_VERSION"));
    if !Path::new(CONFIG_FILE).exists() {
        info!("no {} found, using env-only config", CONFIG_FILE);
    }

    let token = config.chain.token()?;
    let decimals = config.chain.token_decimals;

    // --- Startup probe: an unreachable subscription endpoint is fatal ---
    let head = probe(&config.chain.ws_url).await.map_err(|e| {
        error!(url = %config.chain.ws_url, error = %e, "subscription endpoint unreachable");
        anyhow::anyhow!("subscription endpoint unreachable: {e}")
    })?;
    info!(block = head, "subscription endpoint reachable");

    // --- Window store ---
    let store: Arc<dyn WindowStore> =
        match ValkeyWindowStore::connect(&config.valkey.url, &config.valkey.prefix).await {
            Ok(s) => match s.ping().await {
                Ok(()) => Arc::new(s),
                Err(e) => {
                    warn!(error = %e, "Valkey ping failed, windows will not survive a restart");
                    Arc::new(MemoryWindowStore::new())
                }
            },
            Err(e) => {
                warn!(
                    error = %e,
                    url = %config.valkey.url,
                    "failed to connect to Valkey, running with in-memory windows"
                );
                Arc::new(MemoryWindowStore::new())
            }
        };

    // --- Collaborators ---
    if config.services.accounts_url.is_empty() {
        warn!("services.accounts_url not set, settlement addresses come from window metadata only");
    }
    if config.services.deployer_url.is_empty() {
        warn!("services.deployer_url not set, deployments will fail and users will be told");
    }
    let directory = Arc::new(HttpAccountDirectory::new(config.services.accounts_url.clone())?);
    let loader = WatchSetLoader::new(directory);

    let balances: Arc<dyn BalanceReader> = Arc::new(RpcBalanceReader::new(
        &config.chain.http_rpc_url(),
        token,
        decimals,
    )?);

    let notifier: Arc<dyn Notifier> = if config.has_telegram() {
        Arc::new(TelegramNotifier::new(
            config.services.telegram_bot_token.clone(),
        )?)
    } else {
        warn!("no TELEGRAM_BOT_TOKEN configured, notifications go to the log only");
        Arc::new(LogNotifier)
    };

    let pipeline = Arc::new(DeploymentPipeline::new(
        Arc::new(HttpYieldSource::new(config.services.yield_url.clone())?),
        Arc::new(HttpDeploymentAdapter::new(
            config.services.deployer_url.clone(),
        )?),
        notifier,
    ));

    let scheduler = RecheckScheduler::new(config.monitor.recheck_delay());
    let trigger = RefreshTrigger::new();
    let checker = Arc::new(ManualChecker::new(
        store.clone(),
        loader.clone(),
        balances.clone(),
        pipeline.clone(),
        scheduler.clone(),
        trigger.clone(),
        config.monitor.default_window_minutes,
    ));
    let dispatcher = Arc::new(DepositDispatcher::new(
        store.clone(),
        trigger.clone(),
        pipeline,
        scheduler,
        checker.clone(),
    ));

    // --- Connection lifecycle ---
    let listener = Arc::new(ChainListener::new(
        ListenerConfig {
            ws_url: config.chain.ws_url.clone(),
            token,
            decimals,
        },
        dispatcher.clone(),
    ));
    let controller = ConnectionController::new(
        ControllerConfig::from(&config.monitor),
        store.clone(),
        loader,
        Arc::new(ListenerLauncher::new(listener)),
        trigger,
    );
    let (handle, controller_task) = controller.spawn();

    // --- Balance polling fallback ---
    let poller_task = config.monitor.poll_interval().map(|interval| {
        let poller = BalancePoller::new(
            store.clone(),
            balances,
            dispatcher.clone(),
            handle.snapshot_receiver(),
            interval,
        );
        tokio::spawn(poller.run(handle.shutdown_signal()))
    });

    // --- Control API ---
    if config.api.enabled {
        let state = ApiState {
            store: store.clone(),
            controller: handle.clone(),
            checker,
            default_ttl_minutes: config.monitor.default_window_minutes,
        };
        let bind = config.api.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, &bind).await {
                error!(error = %e, "control API error");
            }
        });
    } else {
        info!("control API disabled");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    handle.shutdown();
    if let Err(e) = controller_task.await {
        error!(error = %e, "controller task failed");
    }
    if let Some(task) = poller_task {
        let _ = task.await;
    }

    info!("deposit-monitor stopped");
    Ok(())
}
