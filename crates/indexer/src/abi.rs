//! Contract interfaces consumed by the indexer.
//!
//! The AMM has emitted its purchase event under two layouts over its
//! lifetime; both are declared here and tried in order by
//! [`crate::decode::Decoder`].

use alloy::sol;

sol! {
    /// Current AMM purchase event.
    #[derive(Debug, PartialEq, Eq)]
    event SharesPurchased(
        uint256 indexed marketId,
        address indexed buyer,
        uint256 outcomeIndex,
        uint256 shares,
        uint256 totalCost
    );
}

sol! {
    /// Purchase event of the first AMM deployment: the buyer is not indexed
    /// and `cost` precedes `shares`.
    #[derive(Debug, PartialEq, Eq)]
    event TradeExecuted(
        uint256 indexed marketId,
        address buyer,
        uint8 outcome,
        uint256 cost,
        uint256 shares
    );
}

sol! {
    /// Read-only view of the collateral token.
    #[sol(rpc)]
    interface IERC20Metadata {
        function decimals() external view returns (uint8);
    }
}
