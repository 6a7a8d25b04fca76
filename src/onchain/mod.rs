//! On-chain deposit detection for the stablecoin contract.
//!
//! Subscribes to ERC-20 Transfer logs via WebSocket RPC and turns the ones
//! landing on a watched settlement address into `DepositMatch`es.
//!
//! Architecture:
//! - `abi`: `IERC20` bindings and the Transfer topic
//! - `types`: `ChainLogEvent`, Transfer decoding, amount scaling, matching
//! - `listener`: one live `subscribe_logs` session on a WebSocket provider
//! - `balance`: `balanceOf` reads for the manual check path and the poller

pub mod abi;
pub mod balance;
pub mod listener;
pub mod types;

pub use balance::{BalanceReader, RpcBalanceReader};
pub use listener::{ChainListener, ListenerConfig, ListenerError};
pub use types::{ChainLogEvent, DepositMatch, DepositSource};
