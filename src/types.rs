// =============================================================================
// Shared types used across the auction monitoring and bidding engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Lifecycle status of a tracked auction (§3, state machine in §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionStatus {
    Monitoring,
    Ended,
    Error,
}

impl Default for AuctionStatus {
    fn default() -> Self {
        Self::Monitoring
    }
}

impl std::fmt::Display for AuctionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monitoring => write!(f, "monitoring"),
            Self::Ended => write!(f, "ended"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Which channel produced the last merged update for an auction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Stream,
    Poll,
}

impl std::fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::Poll => write!(f, "poll"),
        }
    }
}

/// Per-auction bidding strategy (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiddingStrategy {
    Manual,
    Increment,
    Sniping,
}

impl Default for BiddingStrategy {
    fn default() -> Self {
        Self::Manual
    }
}

impl std::fmt::Display for BiddingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Increment => write!(f, "increment"),
            Self::Sniping => write!(f, "sniping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auction_status_defaults_to_monitoring() {
        assert_eq!(AuctionStatus::default(), AuctionStatus::Monitoring);
    }

    #[test]
    fn bidding_strategy_defaults_to_manual() {
        assert_eq!(BiddingStrategy::default(), BiddingStrategy::Manual);
    }

    #[test]
    fn display_matches_lowercase_names() {
        assert_eq!(AuctionStatus::Ended.to_string(), "ended");
        assert_eq!(UpdateSource::Stream.to_string(), "stream");
        assert_eq!(BiddingStrategy::Sniping.to_string(), "sniping");
    }
}
