//! ERC-20 bindings.
//!
//! Only what the monitor needs: the Transfer topic for the log subscription
//! and `balanceOf` for balance reads.

use alloy::primitives::{b256, B256};

alloy::sol! {
    interface IERC20 {
        event Transfer(address indexed from, address indexed to, uint256 value);
        function balanceOf(address owner) external view returns (uint256 balance);
    }
}

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");
