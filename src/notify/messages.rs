//! User-facing message text.

use crate::deploy::DeploymentTarget;
use crate::onchain::types::format_amount;
use rust_decimal::{Decimal, RoundingStrategy};

fn apy_text(apy: Option<f64>) -> String {
    match apy {
        Some(a) => format!("{a:.2}% APY"),
        None => "APY unavailable".to_string(),
    }
}

/// Rounded up, so sending exactly this much always closes the gap.
fn shortage_text(shortage: Decimal) -> String {
    let mut shown = shortage.round_dp_with_strategy(2, RoundingStrategy::AwayFromZero);
    shown.rescale(2);
    shown.to_string()
}

pub fn deployed(
    amount: Decimal,
    target: &DeploymentTarget,
    deposit_tx: Option<&str>,
    deploy_tx: Option<&str>,
) -> String {
    let mut msg = format!(
        "Deposit of {} USDC received and deployed to {} ({}).",
        format_amount(amount),
        target.protocol_name,
        apy_text(target.apy)
    );
    if let Some(tx) = deposit_tx {
        msg.push_str(&format!("\nDeposit tx: {tx}"));
    }
    if let Some(tx) = deploy_tx {
        msg.push_str(&format!("\nDeployment tx: {tx}"));
    }
    msg
}

pub fn undeployed(amount: Decimal, target: &DeploymentTarget, error: &str) -> String {
    format!(
        "Deposit of {} USDC received. Your funds are safe in your wallet, but deploying to {} failed: {}\n\
         Nothing was retried. Ask to invest again when you are ready.",
        format_amount(amount),
        target.protocol_name,
        error
    )
}

pub fn ready_to_complete(balance: Decimal, target: Decimal) -> String {
    let (balance, target) = (format_amount(balance), format_amount(target));
    format!(
        "Your balance is {balance} USDC, enough for the {target} USDC investment you queued. \
         Confirm to complete it."
    )
}

pub fn shortfall(balance: Decimal, target: Decimal, shortage: Decimal) -> String {
    let (balance, target) = (format_amount(balance), format_amount(target));
    let shortage = shortage_text(shortage);
    format!(
        "Funds arrived: your balance is now {balance} USDC. You still need {shortage} USDC \
         for the {target} USDC investment. Invest {balance} USDC now, or wait for the rest."
    )
}

pub fn no_new_funds(balance: Decimal) -> String {
    let balance = format_amount(balance);
    format!(
        "No new funds yet. Your balance is {balance} USDC. Transfers can take a few minutes; \
         we will keep watching your wallet."
    )
}

pub fn found(balance: Decimal) -> String {
    format!("Deposit found: your wallet holds {} USDC.", format_amount(balance))
}

pub fn not_found() -> String {
    "No deposit found yet. Send USDC to your wallet address and we will pick it up automatically."
        .to_string()
}

pub fn queued(amount: Decimal, shortage: Decimal) -> String {
    let (amount, shortage) = (format_amount(amount), shortage_text(shortage));
    format!(
        "Investment of {amount} USDC queued. Add {shortage} USDC to your wallet and we will \
         let you know when it is ready."
    )
}

pub fn cancelled() -> String {
    "Pending investment cancelled. We stopped watching your wallet.".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::DeployCapability;

    #[test]
    fn test_deployed_includes_apy_and_hashes() {
        let target = DeploymentTarget {
            protocol_name: "Moonwell".to_string(),
            apy: Some(7.256),
            capability: DeployCapability::Moonwell,
        };
        let msg = deployed(Decimal::new(1250, 2), &target, Some("0xaa"), Some("0xbb"));
        assert!(msg.contains("12.50 USDC"));
        assert!(msg.contains("7.26% APY"));
        assert!(msg.contains("Deposit tx: 0xaa"));
        assert!(msg.contains("Deployment tx: 0xbb"));
    }

    #[test]
    fn test_deployed_without_apy() {
        let msg = deployed(Decimal::ONE, &DeploymentTarget::fallback(), None, None);
        assert!(msg.contains("APY unavailable"));
        assert!(!msg.contains("Deposit tx"));
    }

    #[test]
    fn test_amounts_render_two_places_without_rounding_up() {
        let msg = shortfall(
            Decimal::new(40_005_000, 6),
            Decimal::from(100),
            Decimal::new(59_995_000, 6),
        );
        assert!(msg.contains("balance is now 40.00 USDC"));
        assert!(msg.contains("need 60.00 USDC"));
        assert!(msg.contains("the 100.00 USDC investment"));

        let msg = ready_to_complete(Decimal::new(100_009_999, 6), Decimal::from(100));
        assert!(msg.contains("balance is 100.00 USDC"));
    }
}
