mod chunk;
mod trade;

use std::fmt::Display;

pub use chunk::*;
pub use trade::*;

/// ID of a prediction market in the AMM contract.
pub type MarketId = u64;

/// Index of a market outcome (`0` = YES, `1` = NO for binary markets).
pub type OutcomeIndex = u64;

/// Order in which chunks of a scan are handed to workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScanOrder {
    /// Oldest blocks first.
    #[default]
    Ascending,
    /// Newest blocks first, to surface fresh trades early while resuming a
    /// long backfill.
    MostRecentFirst,
}

impl Display for ScanOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanOrder::Ascending => write!(f, "ascending"),
            ScanOrder::MostRecentFirst => write!(f, "most-recent-first"),
        }
    }
}

/// Display label of an outcome.
///
/// Only binary markets have labels; the ledger itself always stores the
/// numeric index.
pub fn outcome_label(outcome_index: OutcomeIndex, outcome_count: usize) -> Option<&'static str> {
    match (outcome_count, outcome_index) {
        (2, 0) => Some("YES"),
        (2, 1) => Some("NO"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_labels() {
        assert_eq!(outcome_label(0, 2), Some("YES"));
        assert_eq!(outcome_label(1, 2), Some("NO"));
        assert_eq!(outcome_label(2, 2), None);
        assert_eq!(outcome_label(0, 3), None);
    }
}
