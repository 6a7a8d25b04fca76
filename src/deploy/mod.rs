//! Deployment pipeline: pick the best lending venue and supply the deposit.
//!
//! Flow per deposit:
//!   1. Ask the yield source for venues, take the top APY (first wins on ties)
//!   2. Map the venue name onto a `DeployCapability` (unmapped → Aave v3)
//!   3. Call the deployment adapter with the deposited amount
//!   4. Notify the user with the result
//!
//! A failed deployment leaves the funds in the wallet and tells the user
//! why. There is no automatic retry.

pub mod clients;

pub use clients::{HttpDeploymentAdapter, HttpYieldSource};

use crate::notify::{self, messages, Notifier};
use crate::onchain::DepositMatch;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// A lending venue as ranked by the yield source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub name: String,
    /// Annualized percentage, e.g. 5.2 for 5.2%.
    pub apy: f64,
}

#[async_trait]
pub trait YieldSource: Send + Sync {
    async fn list_venues(&self) -> anyhow::Result<Vec<Venue>>;
}

/// Venues the deployment adapter knows how to supply into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployCapability {
    AaveV3,
    MorphoBlue,
    Moonwell,
    Fluid,
    CompoundV3,
    Euler,
}

impl DeployCapability {
    pub const DEFAULT: DeployCapability = DeployCapability::AaveV3;

    /// Identifier sent to the deployment adapter.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployCapability::AaveV3 => "aave_v3",
            DeployCapability::MorphoBlue => "morpho_blue",
            DeployCapability::Moonwell => "moonwell",
            DeployCapability::Fluid => "fluid",
            DeployCapability::CompoundV3 => "compound_v3",
            DeployCapability::Euler => "euler",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            DeployCapability::AaveV3 => "Aave v3",
            DeployCapability::MorphoBlue => "Morpho Blue",
            DeployCapability::Moonwell => "Moonwell",
            DeployCapability::Fluid => "Fluid",
            DeployCapability::CompoundV3 => "Compound v3",
            DeployCapability::Euler => "Euler",
        }
    }
}

impl std::fmt::Display for DeployCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized venue name → capability.
static VENUE_TABLE: &[(&str, DeployCapability)] = &[
    ("aave", DeployCapability::AaveV3),
    ("aavev3", DeployCapability::AaveV3),
    ("morpho", DeployCapability::MorphoBlue),
    ("morphoblue", DeployCapability::MorphoBlue),
    ("moonwell", DeployCapability::Moonwell),
    ("fluid", DeployCapability::Fluid),
    ("compound", DeployCapability::CompoundV3),
    ("compoundv3", DeployCapability::CompoundV3),
    ("euler", DeployCapability::Euler),
    ("eulerv2", DeployCapability::Euler),
];

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Look up a venue name, ignoring case, spaces and punctuation.
pub fn capability_for(name: &str) -> Option<DeployCapability> {
    let key = normalize(name);
    VENUE_TABLE
        .iter()
        .find(|(n, _)| *n == key)
        .map(|(_, cap)| *cap)
}

/// Highest APY venue. Ties go to the one listed first.
pub fn top_venue(venues: &[Venue]) -> Option<&Venue> {
    venues
        .iter()
        .filter(|v| v.apy.is_finite())
        .fold(None, |best: Option<&Venue>, v| match best {
            Some(b) if b.apy >= v.apy => Some(b),
            _ => Some(v),
        })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentTarget {
    pub protocol_name: String,
    /// `None` when the yield source could not be consulted.
    pub apy: Option<f64>,
    pub capability: DeployCapability,
}

impl DeploymentTarget {
    pub fn fallback() -> Self {
        Self {
            protocol_name: DeployCapability::DEFAULT.display_name().to_string(),
            apy: None,
            capability: DeployCapability::DEFAULT,
        }
    }
}

/// Pick the deployment target from a ranked venue list.
pub fn select_target(venues: &[Venue]) -> DeploymentTarget {
    let Some(best) = top_venue(venues) else {
        return DeploymentTarget::fallback();
    };

    match capability_for(&best.name) {
        Some(capability) => DeploymentTarget {
            protocol_name: best.name.clone(),
            apy: Some(best.apy),
            capability,
        },
        None => {
            warn!(venue = %best.name, "top venue has no deploy mapping, using default venue");
            let default_apy = venues
                .iter()
                .find(|v| capability_for(&v.name) == Some(DeployCapability::DEFAULT))
                .map(|v| v.apy);
            DeploymentTarget {
                apy: default_apy,
                ..DeploymentTarget::fallback()
            }
        }
    }
}

/// Result of one deployment attempt, as reported by the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployOutcome {
    pub success: bool,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl DeployOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            tx_hash: None,
            error: Some(error.into()),
        }
    }
}

/// Executes the sponsored supply transaction for a user.
#[async_trait]
pub trait DeploymentAdapter: Send + Sync {
    async fn deploy(
        &self,
        user_id: &str,
        capability: DeployCapability,
        amount: Decimal,
    ) -> anyhow::Result<DeployOutcome>;
}

pub struct DeploymentPipeline {
    yields: Arc<dyn YieldSource>,
    adapter: Arc<dyn DeploymentAdapter>,
    notifier: Arc<dyn Notifier>,
}

impl DeploymentPipeline {
    pub fn new(
        yields: Arc<dyn YieldSource>,
        adapter: Arc<dyn DeploymentAdapter>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            yields,
            adapter,
            notifier,
        }
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Current best target, or the default venue when the yield source is
    /// down or has nothing listed.
    pub async fn resolve_target(&self) -> DeploymentTarget {
        match self.yields.list_venues().await {
            Ok(venues) if !venues.is_empty() => select_target(&venues),
            Ok(_) => {
                warn!("yield source returned no venues, using default venue");
                DeploymentTarget::fallback()
            }
            Err(e) => {
                warn!(error = %e, "yield source unavailable, using default venue");
                DeploymentTarget::fallback()
            }
        }
    }

    /// Deploy a detected deposit.
    pub async fn run(&self, deposit: &DepositMatch) -> DeployOutcome {
        let target = self.resolve_target().await;
        let deposit_tx = Some(deposit.tx_hash.as_str()).filter(|h| !h.is_empty());
        self.execute(&deposit.wallet.user_id, deposit.amount, &target, deposit_tx)
            .await
    }

    /// Deploy `amount` into `target` and tell the user how it went.
    pub async fn execute(
        &self,
        user_id: &str,
        amount: Decimal,
        target: &DeploymentTarget,
        deposit_tx: Option<&str>,
    ) -> DeployOutcome {
        info!(
            user_id = user_id,
            amount = %amount,
            venue = %target.capability,
            apy = ?target.apy,
            "deploying funds"
        );

        let outcome = match self.adapter.deploy(user_id, target.capability, amount).await {
            Ok(o) => o,
            Err(e) => DeployOutcome::failed(e.to_string()),
        };

        let message = if outcome.success {
            info!(
                user_id = user_id,
                venue = %target.capability,
                tx_hash = ?outcome.tx_hash,
                "deployment succeeded"
            );
            messages::deployed(amount, target, deposit_tx, outcome.tx_hash.as_deref())
        } else {
            let reason = outcome.error.as_deref().unwrap_or("unknown error");
            error!(
                user_id = user_id,
                venue = %target.capability,
                error = reason,
                "deployment failed, funds left in wallet"
            );
            messages::undeployed(amount, target, reason)
        };

        notify::deliver(self.notifier.as_ref(), user_id, &message).await;
        outcome
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::notify::tests::RecordingNotifier;
    use crate::onchain::DepositSource;
    use crate::watch::WatchedWallet;
    use alloy::primitives::Address;
    use tokio::sync::Mutex;

    fn venue(name: &str, apy: f64) -> Venue {
        Venue {
            name: name.to_string(),
            apy,
        }
    }

    pub struct FixedYields(pub anyhow::Result<Vec<Venue>>);

    #[async_trait]
    impl YieldSource for FixedYields {
        async fn list_venues(&self) -> anyhow::Result<Vec<Venue>> {
            match &self.0 {
                Ok(v) => Ok(v.clone()),
                Err(e) => Err(anyhow::anyhow!("{e}")),
            }
        }
    }

    /// Records every call; fails with `error` when set, takes `delay` when set.
    #[derive(Default)]
    pub struct FakeAdapter {
        pub calls: Mutex<Vec<(String, DeployCapability, Decimal)>>,
        pub error: Option<String>,
        pub delay: Option<std::time::Duration>,
    }

    #[async_trait]
    impl DeploymentAdapter for FakeAdapter {
        async fn deploy(
            &self,
            user_id: &str,
            capability: DeployCapability,
            amount: Decimal,
        ) -> anyhow::Result<DeployOutcome> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls
                .lock()
                .await
                .push((user_id.to_string(), capability, amount));
            Ok(match &self.error {
                Some(e) => DeployOutcome::failed(e.clone()),
                None => DeployOutcome {
                    success: true,
                    tx_hash: Some("0xdeployed".to_string()),
                    error: None,
                },
            })
        }
    }

    fn deposit() -> DepositMatch {
        DepositMatch {
            wallet: WatchedWallet::new(Address::repeat_byte(0x01), "u1", "Alice"),
            amount: Decimal::new(1250, 2),
            tx_hash: "0xdeposit".to_string(),
            block_number: Some(1),
            source: DepositSource::Subscription,
        }
    }

    #[test]
    fn test_top_venue_first_max_wins() {
        let venues = vec![venue("A", 5.0), venue("B", 9.0), venue("C", 9.0)];
        assert_eq!(top_venue(&venues).unwrap().name, "B");
    }

    #[test]
    fn test_top_venue_empty() {
        assert!(top_venue(&[]).is_none());
    }

    #[test]
    fn test_capability_lookup_normalizes() {
        assert_eq!(capability_for("Aave V3"), Some(DeployCapability::AaveV3));
        assert_eq!(capability_for("morpho-blue"), Some(DeployCapability::MorphoBlue));
        assert_eq!(capability_for("Compound_V3"), Some(DeployCapability::CompoundV3));
        assert_eq!(capability_for("Obscure Vault"), None);
    }

    #[test]
    fn test_select_target_mapped() {
        let venues = vec![venue("Aave V3", 4.1), venue("Morpho Blue", 6.3)];
        let t = select_target(&venues);
        assert_eq!(t.capability, DeployCapability::MorphoBlue);
        assert_eq!(t.apy, Some(6.3));
        assert_eq!(t.protocol_name, "Morpho Blue");
    }

    #[test]
    fn test_select_target_unmapped_falls_back() {
        let venues = vec![venue("Aave V3", 4.1), venue("Obscure Vault", 12.0)];
        let t = select_target(&venues);
        assert_eq!(t.capability, DeployCapability::AaveV3);
        assert_eq!(t.apy, Some(4.1));
    }

    #[tokio::test]
    async fn test_yield_source_down_uses_default() {
        let notifier = Arc::new(RecordingNotifier::default());
        let adapter = Arc::new(FakeAdapter::default());
        let pipeline = DeploymentPipeline::new(
            Arc::new(FixedYields(Err(anyhow::anyhow!("timeout")))),
            adapter.clone(),
            notifier.clone(),
        );

        let outcome = pipeline.run(&deposit()).await;
        assert!(outcome.success);
        let calls = adapter.calls.lock().await;
        assert_eq!(calls[0].1, DeployCapability::AaveV3);
        let sent = notifier.sent.lock().await;
        assert!(sent[0].1.contains("APY unavailable"));
    }

    #[tokio::test]
    async fn test_success_notifies_both_hashes() {
        let notifier = Arc::new(RecordingNotifier::default());
        let pipeline = DeploymentPipeline::new(
            Arc::new(FixedYields(Ok(vec![venue("Moonwell", 7.25)]))),
            Arc::new(FakeAdapter::default()),
            notifier.clone(),
        );

        pipeline.run(&deposit()).await;
        let sent = notifier.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "u1");
        assert!(sent[0].1.contains("0xdeposit"));
        assert!(sent[0].1.contains("0xdeployed"));
        assert!(sent[0].1.contains("7.25%"));
    }

    #[tokio::test]
    async fn test_failure_is_reported_verbatim_without_retry() {
        let notifier = Arc::new(RecordingNotifier::default());
        let adapter = Arc::new(FakeAdapter {
            error: Some("supply cap reached".to_string()),
            ..FakeAdapter::default()
        });
        let pipeline = DeploymentPipeline::new(
            Arc::new(FixedYields(Ok(vec![venue("Fluid", 5.0)]))),
            adapter.clone(),
            notifier.clone(),
        );

        let outcome = pipeline.run(&deposit()).await;
        assert!(!outcome.success);
        assert_eq!(adapter.calls.lock().await.len(), 1);
        let sent = notifier.sent.lock().await;
        assert!(sent[0].1.contains("supply cap reached"));
        assert!(sent[0].1.contains("safe"));
    }
}
