//! HTTP clients for the yield source and the deployer service.
//!
//! Yield source:  GET  {base}/venues  → [{"name": "...", "apy": 5.2}, ...]
//! Deployer:      POST {base}/deploy  ← {"user_id", "venue", "amount"}
//!                                    → {"success", "tx_hash"?, "error"?}

use super::{DeployCapability, DeployOutcome, DeploymentAdapter, Venue, YieldSource};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::debug;

const YIELD_TIMEOUT: Duration = Duration::from_secs(10);
/// Sponsored transactions wait for inclusion on the deployer side.
const DEPLOY_TIMEOUT: Duration = Duration::from_secs(120);

pub struct HttpYieldSource {
    base_url: String,
    http: Client,
}

impl HttpYieldSource {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(YIELD_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl YieldSource for HttpYieldSource {
    async fn list_venues(&self) -> anyhow::Result<Vec<Venue>> {
        let url = format!("{}/venues", self.base_url);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("yield source returned status {}", resp.status());
        }
        let venues: Vec<Venue> = resp.json().await?;
        debug!(count = venues.len(), "fetched venues");
        Ok(venues)
    }
}

pub struct HttpDeploymentAdapter {
    base_url: String,
    http: Client,
}

impl HttpDeploymentAdapter {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(DEPLOY_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl DeploymentAdapter for HttpDeploymentAdapter {
    async fn deploy(
        &self,
        user_id: &str,
        capability: DeployCapability,
        amount: Decimal,
    ) -> anyhow::Result<DeployOutcome> {
        let url = format!("{}/deploy", self.base_url);
        let body = serde_json::json!({
            "user_id": user_id,
            "venue": capability.as_str(),
            "amount": amount.to_string(),
        });

        let resp = self.http.post(&url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            // The deployer's error text goes to the user as-is.
            let text = resp.text().await.unwrap_or_default();
            let error = if text.is_empty() {
                format!("deployer returned status {status}")
            } else {
                text
            };
            return Ok(DeployOutcome::failed(error));
        }

        Ok(resp.json().await?)
    }
}
