// =============================================================================
// Bidding Decision Logic (C6, decision half) — §4.6 `executeAutoBid`
// =============================================================================
//
// Split out from the orchestrator the way the teacher splits `strategy.rs`
// (decision) from `execution.rs` (order placement). Single-flight (I4) falls
// out of the caller already holding the per-auction `tokio::sync::Mutex`
// across this whole call — no second lock is needed.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::GlobalSettings;
use crate::errors::ErrorType;
use crate::event_bus::{EngineEvent, EventBus};
use crate::record::{now_ms, AuctionRecord, BidHistoryEntry};
use crate::store::Store;
use crate::types::BiddingStrategy;
use crate::upstream::UpstreamClient;

const RETRY_BACKOFF_START_SECS: u64 = 1;
const RETRY_BACKOFF_CAP_SECS: u64 = 10;

pub struct BiddingContext {
    pub settings: GlobalSettings,
    pub upstream: Arc<UpstreamClient>,
    pub breaker: Arc<CircuitBreaker>,
    pub store: Arc<dyn Store>,
    pub bus: Arc<EventBus>,
}

/// Run the auto-bid decision for a record whose lock the caller already
/// holds. Mutates `record` in place (max-bid latch, auth-error flag, merged
/// outbid data) and persists/emits as a side effect.
pub async fn execute_auto_bid(record: &mut AuctionRecord, cookies: &[u8], ctx: &BiddingContext) {
    if !record.config.enabled
        || record.config.strategy == BiddingStrategy::Manual
        || record.max_bid_reached
    {
        return;
    }
    let Some(data) = record.data.clone() else {
        return;
    };
    if data.is_winning || data.is_closed {
        return;
    }

    let Some(max_bid) = record.config.max_bid else {
        return;
    };

    let candidate = std::cmp::max(data.next_bid, data.current_bid + record.config.increment)
        + ctx.settings.bid_buffer;

    if candidate > max_bid {
        record.max_bid_reached = true;
        ctx.store.save_auction(&record.id, record).await;
        ctx.bus
            .emit(EngineEvent::MaxBidReached {
                auction_id: record.id.clone(),
                max_bid,
            })
            .await;
        return;
    }

    if record.config.strategy == BiddingStrategy::Sniping
        && data.time_remaining > ctx.settings.snipe_timing
    {
        return;
    }

    let mut backoff_secs = RETRY_BACKOFF_START_SECS;
    let max_attempts = ctx.settings.retry_attempts.max(1);

    for attempt in 0..max_attempts {
        let outcome = ctx
            .breaker
            .call(
                || ctx.upstream.place_bid(record.product_id, candidate, cookies),
                |outcome| outcome.error_type,
            )
            .await;

        let (success, error_type, response_data) = match &outcome {
            Ok(bid_outcome) => (bid_outcome.success, bid_outcome.error_type, bid_outcome.data.clone()),
            Err(breaker_err) => (false, Some(*breaker_err), None),
        };

        let history_entry = BidHistoryEntry {
            timestamp: now_ms(),
            amount: candidate,
            success,
            error: error_type.map(|e| e.to_string()),
            error_type,
            strategy: record.config.strategy,
        };
        ctx.store.append_bid_history(&record.id, &history_entry).await;

        if success {
            info!(auction_id = %record.id, amount = candidate, "bid placed");
            ctx.bus
                .emit(EngineEvent::BidPlaced {
                    auction_id: record.id.clone(),
                    amount: candidate,
                    strategy: record.config.strategy,
                })
                .await;
            return;
        }

        match error_type {
            Some(ErrorType::Outbid) => {
                if let Some(data) = response_data.as_ref() {
                    if let (Some(current), Some(next)) = (
                        data.get("currentAmount").and_then(|v| v.as_u64()),
                        data.get("minimumNextBid").and_then(|v| v.as_u64()),
                    ) {
                        if let Some(snapshot) = record.data.as_mut() {
                            snapshot.current_bid = current;
                            snapshot.next_bid = next;
                        }
                    }
                }
                ctx.bus
                    .emit(EngineEvent::Outbid {
                        auction_id: record.id.clone(),
                        current_bid: record.data.as_ref().map(|d| d.current_bid).unwrap_or(candidate),
                    })
                    .await;
                return;
            }
            Some(ErrorType::AuthenticationError) => {
                record.auth_error = true;
                ctx.store.save_auction(&record.id, record).await;
                ctx.bus.broadcast_global(EngineEvent::AuthRequired).await;
                ctx.bus
                    .emit(EngineEvent::BidFailed {
                        auction_id: record.id.clone(),
                        error_type: ErrorType::AuthenticationError,
                    })
                    .await;
                return;
            }
            Some(e) if e.is_retryable() => {
                if attempt + 1 >= max_attempts {
                    warn!(auction_id = %record.id, attempts = attempt + 1, "bid retries exhausted");
                    ctx.bus
                        .emit(EngineEvent::BidFailed {
                            auction_id: record.id.clone(),
                            error_type: e,
                        })
                        .await;
                    return;
                }
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(RETRY_BACKOFF_CAP_SECS);
                continue;
            }
            Some(e) => {
                ctx.bus
                    .emit(EngineEvent::BidFailed {
                        auction_id: record.id.clone(),
                        error_type: e,
                    })
                    .await;
                return;
            }
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::record::{AuctionMetadata, AuctionSnapshot, BiddingConfig};
    use crate::store::MemoryStore;

    fn losing_record() -> AuctionRecord {
        let mut record = AuctionRecord::new(
            "1",
            1,
            BiddingConfig {
                strategy: BiddingStrategy::Increment,
                max_bid: Some(200),
                increment: 5,
                enabled: true,
                daily_limit: None,
                total_limit: None,
            },
            AuctionMetadata::default(),
            false,
        );
        record.data = Some(AuctionSnapshot {
            current_bid: 100,
            next_bid: 105,
            bid_count: 3,
            is_winning: false,
            is_closed: false,
            time_remaining: 600,
            close_time: 0,
            extension_interval: 0,
        });
        record
    }

    fn test_ctx() -> BiddingContext {
        BiddingContext {
            settings: GlobalSettings::default(),
            upstream: Arc::new(UpstreamClient::new("http://127.0.0.1:1", "http://127.0.0.1:1")),
            breaker: Arc::new(CircuitBreaker::new("test", CircuitBreakerConfig::default())),
            store: Arc::new(MemoryStore::new()),
            bus: Arc::new(EventBus::new()),
        }
    }

    #[tokio::test]
    async fn skips_when_strategy_is_manual() {
        let mut record = losing_record();
        record.config.strategy = BiddingStrategy::Manual;
        let ctx = test_ctx();
        let mut sub = ctx.bus.subscribe_global("s".into());
        execute_auto_bid(&mut record, b"", &ctx).await;
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn skips_when_already_winning() {
        let mut record = losing_record();
        record.data.as_mut().unwrap().is_winning = true;
        let ctx = test_ctx();
        let mut sub = ctx.bus.subscribe_global("s".into());
        execute_auto_bid(&mut record, b"", &ctx).await;
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn sniping_does_not_bid_outside_snipe_window() {
        let mut record = losing_record();
        record.config.strategy = BiddingStrategy::Sniping;
        record.data.as_mut().unwrap().time_remaining = 600;
        let ctx = test_ctx();
        let mut sub = ctx.bus.subscribe_global("s".into());
        execute_auto_bid(&mut record, b"", &ctx).await;
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn candidate_over_max_bid_sets_latch_and_emits_event() {
        let mut record = losing_record();
        record.config.max_bid = Some(102); // candidate will be 105+0 > 102
        let ctx = test_ctx();
        let mut sub = ctx.bus.subscribe_global("s".into());
        execute_auto_bid(&mut record, b"", &ctx).await;
        assert!(record.max_bid_reached);
        let event = sub.recv().await;
        assert!(matches!(event, EngineEvent::MaxBidReached { .. }));
    }

    #[tokio::test]
    async fn connection_error_retries_exhaust_and_emit_bid_failed() {
        let mut record = losing_record();
        let mut ctx = test_ctx();
        ctx.settings.retry_attempts = 1;
        let mut sub = ctx.bus.subscribe_global("s".into());
        execute_auto_bid(&mut record, b"", &ctx).await;
        let event = sub.recv().await;
        assert!(matches!(
            event,
            EngineEvent::BidFailed {
                error_type: ErrorType::ConnectionError,
                ..
            }
        ));
    }
}
