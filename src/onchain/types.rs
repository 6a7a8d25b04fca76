//! Log events delivered by the subscription and the deposits decoded from them.

use crate::onchain::abi;
use crate::watch::{WatchSet, WatchedWallet};
use alloy::primitives::{Address, Bytes, B256, U256};
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("log has no topic0")]
    MissingTopic,
    #[error("not a Transfer event (topic0 = {0})")]
    NotTransfer(B256),
    #[error("expected 3 topics, got {0}")]
    MissingRecipient(usize),
    #[error("recipient topic is not a left-padded address")]
    BadRecipient,
    #[error("payload too short for uint256: {0} bytes")]
    ShortPayload(usize),
    #[error("amount {0} exceeds decimal range")]
    AmountOverflow(U256),
}

/// A raw log as pushed by the node. Consumed once per delivery, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainLogEvent {
    pub contract_address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub transaction_hash: Option<B256>,
    pub block_number: Option<u64>,
    /// Set by the node when a reorg drops a previously delivered log.
    pub removed: bool,
}

impl From<alloy::rpc::types::Log> for ChainLogEvent {
    fn from(log: alloy::rpc::types::Log) -> Self {
        Self {
            contract_address: log.address(),
            topics: log.topics().to_vec(),
            data: log.data().data.clone(),
            transaction_hash: log.transaction_hash,
            block_number: log.block_number,
            removed: log.removed,
        }
    }
}

/// Decoded ERC-20 `Transfer(address indexed from, address indexed to, uint256 value)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

/// How a deposit was noticed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositSource {
    Subscription,
    BalancePoll,
}

impl std::fmt::Display for DepositSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DepositSource::Subscription => write!(f, "subscription"),
            DepositSource::BalancePoll => write!(f, "balance_poll"),
        }
    }
}

/// A transfer whose recipient is in the current watch set.
#[derive(Debug, Clone, PartialEq)]
pub struct DepositMatch {
    pub wallet: WatchedWallet,
    pub amount: Decimal,
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub source: DepositSource,
}

/// Extract an address from a 32-byte topic word. The upper 12 bytes must be zero.
fn topic_address(topic: &B256) -> Result<Address, DecodeError> {
    if topic.0[..12].iter().any(|b| *b != 0) {
        return Err(DecodeError::BadRecipient);
    }
    Ok(Address::from_slice(&topic.0[12..]))
}

pub fn decode_transfer(event: &ChainLogEvent) -> Result<Transfer, DecodeError> {
    let topic0 = event.topics.first().ok_or(DecodeError::MissingTopic)?;
    if *topic0 != abi::TRANSFER_TOPIC {
        return Err(DecodeError::NotTransfer(*topic0));
    }
    if event.topics.len() < 3 {
        return Err(DecodeError::MissingRecipient(event.topics.len()));
    }

    let from = topic_address(&event.topics[1])?;
    let to = topic_address(&event.topics[2])?;

    // value is the only non-indexed param: data[0..32]
    if event.data.len() < 32 {
        return Err(DecodeError::ShortPayload(event.data.len()));
    }
    let value = U256::from_be_slice(&event.data[0..32]);

    Ok(Transfer { from, to, value })
}

/// Scale a raw token amount by `decimals`. Exact: this is the amount that
/// gets deployed, so no rounding happens here.
pub fn scale_amount(raw: U256, decimals: u32) -> Result<Decimal, DecodeError> {
    let mantissa: u128 = raw.try_into().map_err(|_| DecodeError::AmountOverflow(raw))?;
    let mantissa = i128::try_from(mantissa).map_err(|_| DecodeError::AmountOverflow(raw))?;
    Decimal::try_from_i128_with_scale(mantissa, decimals)
        .map_err(|_| DecodeError::AmountOverflow(raw))
}

/// Render a token amount with 2 decimal places for messages and logs.
///
/// Truncates toward zero so the text never claims more than the wallet holds.
pub fn format_amount(amount: Decimal) -> String {
    let mut shown = amount.round_dp_with_strategy(2, RoundingStrategy::ToZero);
    shown.rescale(2);
    shown.to_string()
}

/// Decode `event` and look its recipient up in `watch`.
///
/// `Ok(None)` means a well-formed transfer to an address nobody is waiting on.
pub fn match_deposit(
    event: &ChainLogEvent,
    watch: &WatchSet,
    token: Address,
    decimals: u32,
) -> Result<Option<DepositMatch>, DecodeError> {
    if event.contract_address != token {
        return Ok(None);
    }
    let transfer = decode_transfer(event)?;
    let wallet = match watch.lookup(&transfer.to) {
        Some(w) => w.clone(),
        None => return Ok(None),
    };
    let amount = scale_amount(transfer.value, decimals)?;

    Ok(Some(DepositMatch {
        wallet,
        amount,
        tx_hash: event
            .transaction_hash
            .map(|h| format!("{h}"))
            .unwrap_or_default(),
        block_number: event.block_number,
        source: DepositSource::Subscription,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::b256;

    const TOKEN: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";

    fn padded(addr: Address) -> B256 {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(addr.as_slice());
        B256::from(word)
    }

    fn transfer_event(to: Address, value: u64) -> ChainLogEvent {
        ChainLogEvent {
            contract_address: TOKEN.parse().unwrap(),
            topics: vec![abi::TRANSFER_TOPIC, padded(Address::ZERO), padded(to)],
            data: Bytes::from(U256::from(value).to_be_bytes::<32>().to_vec()),
            transaction_hash: Some(b256!(
                "1111111111111111111111111111111111111111111111111111111111111111"
            )),
            block_number: Some(42),
            removed: false,
        }
    }

    fn watched(addr: Address) -> WatchSet {
        WatchSet::from_wallets(vec![WatchedWallet::new(addr, "u1", "Alice")])
    }

    #[test]
    fn test_amount_decoding_two_places() {
        let amount = scale_amount(U256::from(12_500_000u64), 6).unwrap();
        assert_eq!(format_amount(amount), "12.50");

        let whole = scale_amount(U256::from(7_000_000u64), 6).unwrap();
        assert_eq!(format_amount(whole), "7.00");

        let dust = scale_amount(U256::from(4_999u64), 6).unwrap();
        assert_eq!(format_amount(dust), "0.00");
    }

    #[test]
    fn test_scaled_amount_is_exact() {
        let amount = scale_amount(U256::from(12_505_000u64), 6).unwrap();
        assert_eq!(amount, Decimal::new(12_505_000, 6));
        assert_eq!(format_amount(amount), "12.50");

        let almost = scale_amount(U256::from(99_995_000u64), 6).unwrap();
        assert!(almost < Decimal::from(100));
        assert_eq!(format_amount(almost), "99.99");
    }

    #[test]
    fn test_amount_overflow_is_an_error() {
        assert!(matches!(
            scale_amount(U256::MAX, 6),
            Err(DecodeError::AmountOverflow(_))
        ));
    }

    #[test]
    fn test_match_is_case_insensitive() {
        let recipient: Address = "0xAbCdEf0123456789abcdef0123456789ABCDEF01".parse().unwrap();
        let lower: Address = "0xabcdef0123456789abcdef0123456789abcdef01".parse().unwrap();
        let event = transfer_event(recipient, 12_500_000);

        let m = match_deposit(&event, &watched(lower), TOKEN.parse().unwrap(), 6)
            .unwrap()
            .expect("should match");
        assert_eq!(m.wallet.user_id, "u1");
        assert_eq!(m.amount, Decimal::new(12_500_000, 6));
        assert_eq!(format_amount(m.amount), "12.50");
        assert_eq!(m.block_number, Some(42));
        assert!(m.tx_hash.starts_with("0x1111"));
    }

    #[test]
    fn test_unwatched_recipient_is_discarded() {
        let event = transfer_event(Address::repeat_byte(0x22), 1_000_000);
        let result = match_deposit(&event, &watched(Address::repeat_byte(0x33)), TOKEN.parse().unwrap(), 6);
        assert_eq!(result, Ok(None));
    }

    #[test]
    fn test_other_contract_is_discarded() {
        let mut event = transfer_event(Address::repeat_byte(0x22), 1_000_000);
        event.contract_address = Address::repeat_byte(0x99);
        let result = match_deposit(&event, &watched(Address::repeat_byte(0x22)), TOKEN.parse().unwrap(), 6);
        assert_eq!(result, Ok(None));
    }

    #[test]
    fn test_malformed_events() {
        let mut short = transfer_event(Address::repeat_byte(0x22), 1);
        short.data = Bytes::from(vec![0u8; 8]);
        assert_eq!(decode_transfer(&short), Err(DecodeError::ShortPayload(8)));

        let mut no_recipient = transfer_event(Address::repeat_byte(0x22), 1);
        no_recipient.topics.truncate(2);
        assert_eq!(decode_transfer(&no_recipient), Err(DecodeError::MissingRecipient(2)));

        let mut dirty = transfer_event(Address::repeat_byte(0x22), 1);
        dirty.topics[2] = B256::repeat_byte(0xff);
        assert_eq!(decode_transfer(&dirty), Err(DecodeError::BadRecipient));

        let mut approval = transfer_event(Address::repeat_byte(0x22), 1);
        approval.topics[0] = B256::repeat_byte(0x01);
        assert!(matches!(decode_transfer(&approval), Err(DecodeError::NotTransfer(_))));
    }
}
