//! Live log subscription for stablecoin Transfer events.
//!
//! One session = one WebSocket provider with one `subscribe_logs`:
//! - subscribe to Transfer events on the token contract
//! - decode each pushed log, match the recipient against the current watch
//!   set snapshot, hand matches to the deposit sink
//!
//! The provider's pubsub service routes pushes by subscription id and sends
//! keepalive pings; both stop when the session drops the provider. Sessions
//! do not reopen themselves: when the stream ends the connection controller
//! decides whether and when to open another.

use crate::dispatch::DepositSink;
use crate::onchain::abi;
use crate::onchain::types::{match_deposit, ChainLogEvent};
use crate::watch::WatchSet;
use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use alloy::transports::TransportError;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("rpc transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
    #[error("log stream ended")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub ws_url: String,
    pub token: Address,
    pub decimals: u32,
}

/// Transfer logs emitted by `token`.
pub fn transfer_filter(token: Address) -> Filter {
    Filter::new()
        .address(token)
        .event_signature(abi::TRANSFER_TOPIC)
}

/// Connect once and read the head block. Used once at startup.
pub async fn probe(ws_url: &str) -> Result<u64, ListenerError> {
    let provider = tokio::time::timeout(
        CONNECT_TIMEOUT,
        ProviderBuilder::new().connect_ws(WsConnect::new(ws_url)),
    )
    .await
    .map_err(|_| ListenerError::Timeout("connect", CONNECT_TIMEOUT))??;
    Ok(provider.get_block_number().await?)
}

pub struct ChainListener {
    config: ListenerConfig,
    sink: Arc<dyn DepositSink>,
}

impl ChainListener {
    pub fn new(config: ListenerConfig, sink: Arc<dyn DepositSink>) -> Self {
        Self { config, sink }
    }

    /// Run one session until `shutdown` flips or the log stream ends.
    ///
    /// Returns `Ok(())` only for a requested shutdown; any other ending is an
    /// error so the controller applies its reconnect back-off.
    pub async fn run_session(
        &self,
        snapshot: watch::Receiver<Arc<WatchSet>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ListenerError> {
        let provider = tokio::time::timeout(
            CONNECT_TIMEOUT,
            ProviderBuilder::new().connect_ws(WsConnect::new(self.config.ws_url.as_str())),
        )
        .await
        .map_err(|_| ListenerError::Timeout("connect", CONNECT_TIMEOUT))??;
        info!(url = %self.config.ws_url, "chain WebSocket connected");

        let filter = transfer_filter(self.config.token);
        let sub = tokio::time::timeout(SUBSCRIBE_TIMEOUT, provider.subscribe_logs(&filter))
            .await
            .map_err(|_| ListenerError::Timeout("eth_subscribe", SUBSCRIBE_TIMEOUT))??;
        let mut stream = sub.into_stream();

        info!(
            token = %self.config.token,
            watched = snapshot.borrow().len(),
            "subscribed to Transfer logs"
        );

        let outcome = loop {
            tokio::select! {
                log = stream.next() => match log {
                    Some(log) => self.handle_log(log, &snapshot).await,
                    None => {
                        warn!("chain log stream ended");
                        break Err(ListenerError::Closed);
                    }
                },
                _ = shutdown.changed() => {
                    info!("listener session shutting down");
                    break Ok(());
                }
            }
        };

        // Dropping the last handle closes the socket and its keepalive.
        drop(stream);
        drop(provider);
        outcome
    }

    async fn handle_log(&self, log: Log, snapshot: &watch::Receiver<Arc<WatchSet>>) {
        let event = ChainLogEvent::from(log);
        if event.removed {
            debug!(tx = ?event.transaction_hash, "ignoring log removed by reorg");
            return;
        }

        // Clone the Arc so the borrow is released before any await.
        let watch_set = snapshot.borrow().clone();

        match match_deposit(&event, &watch_set, self.config.token, self.config.decimals) {
            Ok(Some(deposit)) => {
                info!(
                    user_id = %deposit.wallet.user_id,
                    address = %deposit.wallet.canonical_address(),
                    amount = %deposit.amount,
                    tx = %deposit.tx_hash,
                    block = ?deposit.block_number,
                    "DEPOSIT DETECTED"
                );
                self.sink.on_deposit(deposit).await;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    error = %e,
                    tx = ?event.transaction_hash,
                    "dropping malformed Transfer log"
                );
            }
        }
    }
}
