//! HTTP account directory client.
//!
//! The user/account records live with the front end. We only read:
//!   GET {base}/users/{user_id}                      → AccountRecord
//!   GET {base}/accounts/{wallet}/smart-account      → {"address": "0x..."}

use super::{AccountDirectory, AccountRecord};
use alloy::primitives::Address;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct SmartAccountResponse {
    address: Option<Address>,
    #[serde(default)]
    deployed: bool,
}

pub struct HttpAccountDirectory {
    base_url: String,
    http: Client,
}

impl HttpAccountDirectory {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl AccountDirectory for HttpAccountDirectory {
    async fn lookup(&self, user_id: &str) -> anyhow::Result<Option<AccountRecord>> {
        let url = format!("{}/users/{}", self.base_url, user_id);
        let resp = self.http.get(&url).send().await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            anyhow::bail!("account directory returned status {}", resp.status());
        }

        let record: AccountRecord = resp.json().await?;
        Ok(Some(record))
    }

    async fn settlement_address(&self, record: &AccountRecord) -> anyhow::Result<Address> {
        if let Some(addr) = record.smart_account_address {
            return Ok(addr);
        }

        let url = format!(
            "{}/accounts/{}/smart-account",
            self.base_url, record.wallet_address
        );
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("smart account lookup returned status {}", resp.status());
        }

        let body: SmartAccountResponse = resp.json().await?;
        match body.address {
            Some(addr) => {
                debug!(
                    user_id = %record.user_id,
                    smart_account = %addr,
                    deployed = body.deployed,
                    "resolved smart account"
                );
                Ok(addr)
            }
            // No smart account: the key-derived wallet is the settlement address.
            None => Ok(record.wallet_address),
        }
    }
}
