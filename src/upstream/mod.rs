// =============================================================================
// Upstream Client (C2)
// =============================================================================

mod client;

pub use client::{classify_bid_response, BidOutcome, CheckAuthResult, UpstreamClient};
