//! Deposit monitor: watches user wallets for incoming USDC, deploys each
//! deposit into the best-yielding lending venue and tells the user.
//!
//! Data flow:
//!   store (windows) → watch (snapshot) → monitor (controller) → onchain (listener)
//!     → dispatch (claim) → deploy (venue + adapter) → notify
//!
//! The manual check path (`manual`) and the control API (`api`) sit beside
//! the automatic path and share its store and pipeline.

pub mod api;
pub mod config;
pub mod deploy;
pub mod dispatch;
pub mod manual;
pub mod monitor;
pub mod notify;
pub mod onchain;
pub mod store;
pub mod watch;
