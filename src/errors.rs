// =============================================================================
// Error Taxonomy — programmatic, transport-independent classification (§7)
// =============================================================================
//
// This is the single fixed vocabulary the rest of the engine speaks in.
// `upstream::client` is the only place that MAPS an upstream HTTP response or
// network failure onto one of these variants (§4.2); everywhere else just
// matches on them.
// =============================================================================

use serde::{Deserialize, Serialize};

/// The fixed error taxonomy from §4.2 / §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ErrorType {
    #[error("a bid at this exact amount was already placed")]
    DuplicateBidAmount,
    #[error("bid amount is below the required minimum")]
    BidTooLow,
    #[error("auction has ended")]
    AuctionEnded,
    #[error("upstream authentication failed")]
    AuthenticationError,
    #[error("outbid by a higher standing bid")]
    Outbid,
    #[error("network connection to upstream failed")]
    ConnectionError,
    #[error("upstream server error")]
    ServerError,
    #[error("unclassified upstream error")]
    UnknownError,
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("validation failed")]
    ValidationError,
    #[error("rate limited")]
    RateLimited,
    #[error("auction is not monitored")]
    NotMonitored,
    #[error("auction is already monitored")]
    AlreadyMonitored,
}

impl ErrorType {
    /// Business outcomes are results of the upstream's own rules, not faults
    /// of our infrastructure: they never trip the circuit breaker (§4.3) and
    /// are never retried automatically (§7).
    pub fn is_business_outcome(self) -> bool {
        matches!(
            self,
            Self::DuplicateBidAmount | Self::BidTooLow | Self::AuctionEnded | Self::Outbid
        )
    }

    /// Transport/infra failures are the only errors that count against the
    /// circuit breaker's failure threshold (§4.3).
    pub fn counts_as_breaker_failure(self) -> bool {
        !matches!(
            self,
            Self::DuplicateBidAmount | Self::BidTooLow | Self::AuctionEnded
        )
    }

    /// Whether the Monitor's bounded retry loop (§4.6) may retry this error.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Outbid | Self::ConnectionError | Self::ServerError | Self::UnknownError
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_outcomes_are_not_breaker_failures_except_outbid() {
        assert!(!ErrorType::DuplicateBidAmount.counts_as_breaker_failure());
        assert!(!ErrorType::BidTooLow.counts_as_breaker_failure());
        assert!(!ErrorType::AuctionEnded.counts_as_breaker_failure());
        // Outbid is a business outcome but still propagates as a fault for
        // breaker accounting per §4.3's "EXCEPT" list, which does not name it.
        assert!(ErrorType::Outbid.counts_as_breaker_failure());
    }

    #[test]
    fn authentication_error_is_never_retried() {
        assert!(!ErrorType::AuthenticationError.is_retryable());
    }

    #[test]
    fn duplicate_and_too_low_are_never_retried() {
        assert!(!ErrorType::DuplicateBidAmount.is_retryable());
        assert!(!ErrorType::BidTooLow.is_retryable());
    }

    #[test]
    fn infra_failures_are_retryable() {
        assert!(ErrorType::ConnectionError.is_retryable());
        assert!(ErrorType::ServerError.is_retryable());
        assert!(ErrorType::UnknownError.is_retryable());
    }

    #[test]
    fn business_outcome_classification_matches_table() {
        assert!(ErrorType::DuplicateBidAmount.is_business_outcome());
        assert!(ErrorType::BidTooLow.is_business_outcome());
        assert!(ErrorType::AuctionEnded.is_business_outcome());
        assert!(ErrorType::Outbid.is_business_outcome());
        assert!(!ErrorType::ConnectionError.is_business_outcome());
    }
}
