// =============================================================================
// State Store (C1) — persistence trait, Redis backend, in-memory fallback
// =============================================================================
//
// `Store` is the single persistence seam the rest of the engine talks to.
// `RedisStore` is the primary backend; `MemoryStore` is the required
// fallback (§4.1); `FallbackStore` composes the two so callers never see a
// persistence failure as anything other than "this write went to memory
// instead" — matching the teacher's posture in `reconcile.rs` of degrading
// rather than propagating exchange hiccups up through the whole engine.
// =============================================================================

mod memory;
mod redis_backend;

pub use memory::MemoryStore;
pub use redis_backend::RedisStore;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::config::GlobalSettings;
use crate::record::{AuctionRecord, BidHistoryEntry};

/// TTLs from §6's persisted-state layout table.
pub const AUCTION_TTL_SECS: usize = 3_600;
pub const COOKIE_TTL_SECS: usize = 86_400;
pub const BID_HISTORY_TTL_SECS: usize = 604_800;

#[async_trait]
pub trait Store: Send + Sync {
    async fn save_auction(&self, id: &str, record: &AuctionRecord);
    async fn get_auction(&self, id: &str) -> Option<AuctionRecord>;
    async fn get_all_auctions(&self) -> Vec<AuctionRecord>;
    async fn remove_auction(&self, id: &str);

    async fn save_cookies(&self, blob: &[u8]);
    async fn get_cookies(&self) -> Option<Vec<u8>>;

    async fn append_bid_history(&self, id: &str, entry: &BidHistoryEntry);
    async fn get_bid_history(&self, id: &str, limit: usize) -> Vec<BidHistoryEntry>;

    async fn save_settings(&self, settings: &GlobalSettings);
    async fn get_settings(&self) -> Option<GlobalSettings>;

    async fn get_flag(&self, name: &str) -> Option<bool>;
    async fn set_flag(&self, name: &str, value: bool);

    async fn is_healthy(&self) -> bool;
}

/// Composes a primary backend with a `MemoryStore` fallback (§4.1): every
/// write goes to the primary first, and on error falls through to memory
/// silently. Reconnection does not replay memory-only writes — a documented
/// limitation, see `DESIGN.md`.
pub struct FallbackStore {
    primary: Arc<dyn Store>,
    fallback: Arc<MemoryStore>,
}

impl FallbackStore {
    pub fn new(primary: Arc<dyn Store>) -> Self {
        Self {
            primary,
            fallback: Arc::new(MemoryStore::new()),
        }
    }
}

#[async_trait]
impl Store for FallbackStore {
    async fn save_auction(&self, id: &str, record: &AuctionRecord) {
        if self.primary.is_healthy().await {
            self.primary.save_auction(id, record).await;
        } else {
            warn!(auction_id = id, "primary store unhealthy, writing to memory fallback");
            self.fallback.save_auction(id, record).await;
        }
    }

    async fn get_auction(&self, id: &str) -> Option<AuctionRecord> {
        if let Some(record) = self.primary.get_auction(id).await {
            return Some(record);
        }
        self.fallback.get_auction(id).await
    }

    async fn get_all_auctions(&self) -> Vec<AuctionRecord> {
        let mut primary = self.primary.get_all_auctions().await;
        let fallback = self.fallback.get_all_auctions().await;
        let known: std::collections::HashSet<_> = primary.iter().map(|r| r.id.clone()).collect();
        primary.extend(fallback.into_iter().filter(|r| !known.contains(&r.id)));
        primary
    }

    async fn remove_auction(&self, id: &str) {
        self.primary.remove_auction(id).await;
        self.fallback.remove_auction(id).await;
    }

    async fn save_cookies(&self, blob: &[u8]) {
        if self.primary.is_healthy().await {
            self.primary.save_cookies(blob).await;
        } else {
            self.fallback.save_cookies(blob).await;
        }
    }

    async fn get_cookies(&self) -> Option<Vec<u8>> {
        if let Some(blob) = self.primary.get_cookies().await {
            return Some(blob);
        }
        self.fallback.get_cookies().await
    }

    async fn append_bid_history(&self, id: &str, entry: &BidHistoryEntry) {
        if self.primary.is_healthy().await {
            self.primary.append_bid_history(id, entry).await;
        } else {
            self.fallback.append_bid_history(id, entry).await;
        }
    }

    async fn get_bid_history(&self, id: &str, limit: usize) -> Vec<BidHistoryEntry> {
        let primary = self.primary.get_bid_history(id, limit).await;
        if !primary.is_empty() {
            return primary;
        }
        self.fallback.get_bid_history(id, limit).await
    }

    async fn save_settings(&self, settings: &GlobalSettings) {
        if self.primary.is_healthy().await {
            self.primary.save_settings(settings).await;
        } else {
            self.fallback.save_settings(settings).await;
        }
    }

    async fn get_settings(&self) -> Option<GlobalSettings> {
        if let Some(settings) = self.primary.get_settings().await {
            return Some(settings);
        }
        self.fallback.get_settings().await
    }

    async fn get_flag(&self, name: &str) -> Option<bool> {
        if let Some(value) = self.primary.get_flag(name).await {
            return Some(value);
        }
        self.fallback.get_flag(name).await
    }

    async fn set_flag(&self, name: &str, value: bool) {
        if self.primary.is_healthy().await {
            self.primary.set_flag(name, value).await;
        } else {
            self.fallback.set_flag(name, value).await;
        }
    }

    async fn is_healthy(&self) -> bool {
        self.primary.is_healthy().await || self.fallback.is_healthy().await
    }
}
