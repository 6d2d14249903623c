// =============================================================================
// Auction Record — the core data model (§3) and its per-entity lock table
// =============================================================================
//
// Mirrors the teacher's `position_engine.rs` shape (a manager owning a
// collection of entity structs behind `parking_lot` locks) but generalised to
// keyed, per-entity locking: §3 (I1) requires each `auctionId` to have at most
// one live record, and §5 requires a single writer per record. A flat
// `RwLock<Vec<Position>>` (as the teacher uses for fungible positions) cannot
// give per-key write isolation, so each record gets its own lock, and the
// outer `parking_lot::RwLock<HashMap<..>>` only guards insertion/removal of
// whole entries. The per-record lock is `tokio::sync::Mutex`, not
// `parking_lot::Mutex`: the update pipeline (§4.6) holds it across the
// upstream HTTP call that places a bid, to make the single-flight-per-auction
// requirement (I4) fall out of the lock itself rather than a second
// data structure.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::errors::ErrorType;
use crate::types::{AuctionStatus, BiddingStrategy, UpdateSource};

// ---------------------------------------------------------------------------
// Validation bounds (§3)
// ---------------------------------------------------------------------------

pub const MAX_BID_MIN: u64 = 1;
pub const MAX_BID_MAX: u64 = 10_000;
pub const INCREMENT_MIN: u64 = 1;
pub const INCREMENT_MAX: u64 = 1_000;
pub const INCREMENT_DEFAULT: u64 = 5;
pub const SNIPE_TIMING_MIN: u64 = 1;
pub const SNIPE_TIMING_MAX: u64 = 30;
pub const SNIPE_TIMING_DEFAULT: u64 = 30;
pub const BID_BUFFER_MIN: u64 = 0;
pub const BID_BUFFER_MAX: u64 = 100;
pub const RETRY_ATTEMPTS_MIN: u32 = 1;
pub const RETRY_ATTEMPTS_MAX: u32 = 10;
/// (I6) monetary values beyond this are refused as overflow.
pub const MONETARY_OVERFLOW: u64 = 1_000_000;

// ---------------------------------------------------------------------------
// Bidding configuration
// ---------------------------------------------------------------------------

/// Per-auction bidding configuration (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiddingConfig {
    pub strategy: BiddingStrategy,
    #[serde(default)]
    pub max_bid: Option<u64>,
    #[serde(default = "default_increment")]
    pub increment: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub daily_limit: Option<u64>,
    #[serde(default)]
    pub total_limit: Option<u64>,
}

fn default_increment() -> u64 {
    INCREMENT_DEFAULT
}

fn default_true() -> bool {
    true
}

impl Default for BiddingConfig {
    fn default() -> Self {
        Self {
            strategy: BiddingStrategy::Manual,
            max_bid: None,
            increment: INCREMENT_DEFAULT,
            enabled: true,
            daily_limit: None,
            total_limit: None,
        }
    }
}

impl BiddingConfig {
    /// Validate this configuration against the bounds in §3. Returns the
    /// specific field that failed so callers can surface a precise message.
    pub fn validate(&self) -> Result<(), ErrorType> {
        if self.strategy != BiddingStrategy::Manual {
            let max_bid = self.max_bid.ok_or(ErrorType::ValidationError)?;
            if max_bid < MAX_BID_MIN || max_bid > MAX_BID_MAX {
                return Err(ErrorType::ValidationError);
            }
        }
        if self.increment < INCREMENT_MIN || self.increment > INCREMENT_MAX {
            return Err(ErrorType::ValidationError);
        }
        if let Some(max_bid) = self.max_bid {
            if max_bid > MONETARY_OVERFLOW {
                return Err(ErrorType::ValidationError);
            }
        }
        Ok(())
    }

    /// Merge a partial update into this config, re-validating the result
    /// (§4.6 `updateAuctionConfig`). Leaves `self` untouched on failure.
    pub fn merged_with(&self, partial: &BiddingConfigPatch) -> Result<Self, ErrorType> {
        let mut next = self.clone();
        if let Some(strategy) = partial.strategy {
            next.strategy = strategy;
        }
        if let Some(max_bid) = partial.max_bid {
            next.max_bid = Some(max_bid);
        }
        if let Some(increment) = partial.increment {
            next.increment = increment;
        }
        if let Some(enabled) = partial.enabled {
            next.enabled = enabled;
        }
        if let Some(daily_limit) = partial.daily_limit {
            next.daily_limit = Some(daily_limit);
        }
        if let Some(total_limit) = partial.total_limit {
            next.total_limit = Some(total_limit);
        }
        next.validate()?;
        Ok(next)
    }
}

/// Partial update to a [`BiddingConfig`] (§4.6 `updateAuctionConfig`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BiddingConfigPatch {
    #[serde(default)]
    pub strategy: Option<BiddingStrategy>,
    #[serde(default)]
    pub max_bid: Option<u64>,
    #[serde(default)]
    pub increment: Option<u64>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub daily_limit: Option<u64>,
    #[serde(default)]
    pub total_limit: Option<u64>,
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Display metadata carried alongside an auction, opaque to the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuctionMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

// ---------------------------------------------------------------------------
// Snapshot — normalized, transport-independent auction state (§3, §4.2)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionSnapshot {
    pub current_bid: u64,
    pub next_bid: u64,
    pub bid_count: u32,
    pub is_winning: bool,
    pub is_closed: bool,
    /// Seconds remaining, derived as `max(0, floor((closeTime - now)/1000))`.
    pub time_remaining: u64,
    /// Absolute close time, epoch milliseconds.
    pub close_time: i64,
    pub extension_interval: u64,
}

// ---------------------------------------------------------------------------
// Bid history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidHistoryEntry {
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub amount: u64,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_type: Option<ErrorType>,
    pub strategy: BiddingStrategy,
}

/// Retention window for bid history entries (§3): seven days.
pub const BID_HISTORY_TTL_SECS: i64 = 7 * 24 * 3600;
/// Maximum retained entries per auction (§4.1).
pub const BID_HISTORY_MAX_ENTRIES: usize = 100;

// ---------------------------------------------------------------------------
// Auction record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionRecord {
    pub id: String,
    pub product_id: u64,
    pub config: BiddingConfig,
    pub metadata: AuctionMetadata,
    pub status: AuctionStatus,
    #[serde(default)]
    pub data: Option<AuctionSnapshot>,
    /// Monotonic epoch-millisecond timestamp of the last merged update.
    #[serde(default)]
    pub last_update: i64,
    #[serde(default)]
    pub update_source: Option<UpdateSource>,
    #[serde(default = "default_true")]
    pub use_stream: bool,
    #[serde(default)]
    pub fallback_polling: bool,
    #[serde(default)]
    pub max_bid_reached: bool,
    #[serde(default)]
    pub auth_error: bool,
    #[serde(default)]
    pub consecutive_poll_errors: u32,
}

impl AuctionRecord {
    pub fn new(
        id: impl Into<String>,
        product_id: u64,
        config: BiddingConfig,
        metadata: AuctionMetadata,
        use_stream: bool,
    ) -> Self {
        Self {
            id: id.into(),
            product_id,
            config,
            metadata,
            status: AuctionStatus::Monitoring,
            data: None,
            last_update: 0,
            update_source: None,
            use_stream,
            fallback_polling: !use_stream,
            max_bid_reached: false,
            auth_error: false,
            consecutive_poll_errors: 0,
        }
    }

    /// (I5) reject snapshots whose `currentBid` regresses or whose implied
    /// update is not newer than what we already have.
    pub fn accepts(&self, candidate: &AuctionSnapshot, candidate_last_update: i64) -> bool {
        if candidate_last_update < self.last_update {
            return false;
        }
        match &self.data {
            Some(current) => candidate.current_bid >= current.current_bid,
            None => true,
        }
    }

    /// Merge an accepted snapshot into this record (§4.6 step 4). Also
    /// applies (I7): a closed/expired snapshot transitions status to ended.
    pub fn merge(&mut self, snapshot: AuctionSnapshot, source: UpdateSource, now_ms: i64) {
        let was_winning = self.data.as_ref().map(|d| d.is_winning).unwrap_or(true);
        let closing = snapshot.is_closed || snapshot.time_remaining == 0;

        self.data = Some(snapshot);
        self.update_source = Some(source);
        self.last_update = now_ms;

        if closing {
            self.status = AuctionStatus::Ended;
        }

        let _ = was_winning; // transition detection lives in monitor::update pipeline
    }
}

// ---------------------------------------------------------------------------
// Auction table — the per-auction lock map the Monitor owns
// ---------------------------------------------------------------------------

/// Retention window after which an `ended` record is eligible for removal
/// from memory (I2): at least 60 seconds, to allow final fan-out.
pub const RETENTION_WINDOW_SECS: i64 = 60;

#[derive(Default)]
pub struct AuctionTable {
    inner: RwLock<HashMap<String, Arc<Mutex<AuctionRecord>>>>,
}

impl AuctionTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a brand-new record. Returns `false` without mutating anything
    /// if an active record with this id already exists (I1).
    pub fn insert_new(&self, record: AuctionRecord) -> bool {
        let mut map = self.inner.write();
        if map.contains_key(&record.id) {
            return false;
        }
        map.insert(record.id.clone(), Arc::new(Mutex::new(record)));
        true
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mutex<AuctionRecord>>> {
        self.inner.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Mutex<AuctionRecord>>> {
        self.inner.write().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot every tracked record (for `getAllAuctions`/diagnostics).
    pub async fn snapshot_all(&self) -> Vec<AuctionRecord> {
        let locks: Vec<_> = self.inner.read().values().cloned().collect();
        let mut records = Vec::with_capacity(locks.len());
        for lock in locks {
            records.push(lock.lock().await.clone());
        }
        records
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot(current_bid: u64) -> AuctionSnapshot {
        AuctionSnapshot {
            current_bid,
            next_bid: current_bid + 5,
            bid_count: 1,
            is_winning: false,
            is_closed: false,
            time_remaining: 7200,
            close_time: 0,
            extension_interval: 0,
        }
    }

    #[test]
    fn bidding_config_rejects_out_of_range_max_bid() {
        let cfg = BiddingConfig {
            strategy: BiddingStrategy::Increment,
            max_bid: Some(20_000),
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ErrorType::ValidationError));
    }

    #[test]
    fn bidding_config_rejects_monetary_overflow() {
        let cfg = BiddingConfig {
            strategy: BiddingStrategy::Increment,
            max_bid: Some(2_000_000),
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ErrorType::ValidationError));
    }

    #[test]
    fn manual_strategy_does_not_require_max_bid() {
        let cfg = BiddingConfig {
            strategy: BiddingStrategy::Manual,
            max_bid: None,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn merged_patch_revalidates() {
        let cfg = BiddingConfig {
            strategy: BiddingStrategy::Increment,
            max_bid: Some(100),
            ..Default::default()
        };
        let patch = BiddingConfigPatch {
            max_bid: Some(50_000),
            ..Default::default()
        };
        assert!(cfg.merged_with(&patch).is_err());
        assert_eq!(cfg.max_bid, Some(100)); // untouched on failure
    }

    #[test]
    fn auction_table_rejects_duplicate_insert() {
        let table = AuctionTable::new();
        let record = AuctionRecord::new(
            "57947099",
            57947099,
            BiddingConfig::default(),
            AuctionMetadata::default(),
            true,
        );
        assert!(table.insert_new(record.clone()));
        assert!(!table.insert_new(record));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn record_rejects_regressing_bid() {
        let mut record = AuctionRecord::new(
            "1",
            1,
            BiddingConfig::default(),
            AuctionMetadata::default(),
            true,
        );
        record.merge(sample_snapshot(125), UpdateSource::Poll, 100);
        assert!(!record.accepts(&sample_snapshot(120), 200));
        assert!(record.accepts(&sample_snapshot(130), 200));
    }

    #[test]
    fn record_rejects_stale_update() {
        let mut record = AuctionRecord::new(
            "1",
            1,
            BiddingConfig::default(),
            AuctionMetadata::default(),
            true,
        );
        record.merge(sample_snapshot(125), UpdateSource::Poll, 1_000);
        assert!(!record.accepts(&sample_snapshot(130), 500));
    }

    #[test]
    fn closing_snapshot_transitions_to_ended() {
        let mut record = AuctionRecord::new(
            "1",
            1,
            BiddingConfig::default(),
            AuctionMetadata::default(),
            true,
        );
        let mut snap = sample_snapshot(125);
        snap.is_closed = true;
        record.merge(snap, UpdateSource::Poll, 100);
        assert_eq!(record.status, AuctionStatus::Ended);
    }
}
