//! Token balance reads (`eth_call` → `balanceOf`).

use crate::onchain::abi::IERC20;
use crate::onchain::types::scale_amount;
use alloy::primitives::Address;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{TransactionInput, TransactionRequest};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Current token balance of an address, exactly scaled to token units.
#[async_trait]
pub trait BalanceReader: Send + Sync {
    async fn balance_of(&self, owner: Address) -> anyhow::Result<Decimal>;
}

pub struct RpcBalanceReader {
    provider: DynProvider,
    token: Address,
    decimals: u32,
}

impl RpcBalanceReader {
    pub fn new(rpc_url: &str, token: Address, decimals: u32) -> anyhow::Result<Self> {
        let provider = ProviderBuilder::new()
            .connect_http(rpc_url.parse()?)
            .erased();
        Ok(Self {
            provider,
            token,
            decimals,
        })
    }
}

/// `eth_call` request for `token.balanceOf(owner)`.
pub fn balance_request(token: Address, owner: Address) -> TransactionRequest {
    let data = IERC20::balanceOfCall { owner }.abi_encode();
    TransactionRequest::default()
        .to(token)
        .input(TransactionInput::new(data.into()))
}

/// Decode a `balanceOf` return into token units.
pub fn decode_balance(raw: &[u8], decimals: u32) -> anyhow::Result<Decimal> {
    let units = IERC20::balanceOfCall::abi_decode_returns(raw)?;
    Ok(scale_amount(units, decimals)?)
}

#[async_trait]
impl BalanceReader for RpcBalanceReader {
    async fn balance_of(&self, owner: Address) -> anyhow::Result<Decimal> {
        let raw = tokio::time::timeout(
            CALL_TIMEOUT,
            self.provider.call(balance_request(self.token, owner)),
        )
        .await
        .map_err(|_| anyhow::anyhow!("eth_call timed out after {CALL_TIMEOUT:?}"))??;
        decode_balance(&raw, self.decimals)
    }
}
