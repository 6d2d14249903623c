// =============================================================================
// MemoryStore — in-process fallback backend (§4.1)
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::config::GlobalSettings;
use crate::record::{AuctionRecord, BidHistoryEntry, BID_HISTORY_MAX_ENTRIES};

use super::Store;

#[derive(Default)]
pub struct MemoryStore {
    auctions: RwLock<HashMap<String, AuctionRecord>>,
    cookies: RwLock<Option<Vec<u8>>>,
    bid_history: RwLock<HashMap<String, Vec<BidHistoryEntry>>>,
    settings: RwLock<Option<GlobalSettings>>,
    flags: RwLock<HashMap<String, bool>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_auction(&self, id: &str, record: &AuctionRecord) {
        self.auctions.write().insert(id.to_string(), record.clone());
    }

    async fn get_auction(&self, id: &str) -> Option<AuctionRecord> {
        self.auctions.read().get(id).cloned()
    }

    async fn get_all_auctions(&self) -> Vec<AuctionRecord> {
        self.auctions.read().values().cloned().collect()
    }

    async fn remove_auction(&self, id: &str) {
        self.auctions.write().remove(id);
        self.bid_history.write().remove(id);
    }

    async fn save_cookies(&self, blob: &[u8]) {
        *self.cookies.write() = Some(blob.to_vec());
    }

    async fn get_cookies(&self) -> Option<Vec<u8>> {
        self.cookies.read().clone()
    }

    async fn append_bid_history(&self, id: &str, entry: &BidHistoryEntry) {
        let mut history = self.bid_history.write();
        let entries = history.entry(id.to_string()).or_default();
        entries.push(entry.clone());
        if entries.len() > BID_HISTORY_MAX_ENTRIES {
            let overflow = entries.len() - BID_HISTORY_MAX_ENTRIES;
            entries.drain(0..overflow);
        }
    }

    async fn get_bid_history(&self, id: &str, limit: usize) -> Vec<BidHistoryEntry> {
        self.bid_history
            .read()
            .get(id)
            .map(|entries| {
                entries
                    .iter()
                    .rev()
                    .take(limit)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    }

    async fn save_settings(&self, settings: &GlobalSettings) {
        *self.settings.write() = Some(settings.clone());
    }

    async fn get_settings(&self) -> Option<GlobalSettings> {
        self.settings.read().clone()
    }

    async fn get_flag(&self, name: &str) -> Option<bool> {
        self.flags.read().get(name).copied()
    }

    async fn set_flag(&self, name: &str, value: bool) {
        self.flags.write().insert(name.to_string(), value);
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AuctionMetadata, BiddingConfig};
    use crate::types::BiddingStrategy;

    fn sample_record(id: &str) -> AuctionRecord {
        AuctionRecord::new(id, 1, BiddingConfig::default(), AuctionMetadata::default(), true)
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let store = MemoryStore::new();
        store.save_auction("1", &sample_record("1")).await;
        let got = store.get_auction("1").await.unwrap();
        assert_eq!(got.id, "1");
    }

    #[tokio::test]
    async fn remove_clears_auction_and_history() {
        let store = MemoryStore::new();
        store.save_auction("1", &sample_record("1")).await;
        store
            .append_bid_history(
                "1",
                &BidHistoryEntry {
                    timestamp: 0,
                    amount: 10,
                    success: true,
                    error: None,
                    error_type: None,
                    strategy: BiddingStrategy::Manual,
                },
            )
            .await;
        store.remove_auction("1").await;
        assert!(store.get_auction("1").await.is_none());
        assert!(store.get_bid_history("1", 10).await.is_empty());
    }

    #[tokio::test]
    async fn bid_history_is_capped_and_newest_first() {
        let store = MemoryStore::new();
        for amount in 0..(BID_HISTORY_MAX_ENTRIES as u64 + 10) {
            store
                .append_bid_history(
                    "1",
                    &BidHistoryEntry {
                        timestamp: amount as i64,
                        amount,
                        success: true,
                        error: None,
                        error_type: None,
                        strategy: BiddingStrategy::Manual,
                    },
                )
                .await;
        }
        let history = store.get_bid_history("1", BID_HISTORY_MAX_ENTRIES).await;
        assert_eq!(history.len(), BID_HISTORY_MAX_ENTRIES);
        assert_eq!(history[0].amount, BID_HISTORY_MAX_ENTRIES as u64 + 9);
    }

    #[tokio::test]
    async fn always_reports_healthy() {
        let store = MemoryStore::new();
        assert!(store.is_healthy().await);
    }
}
