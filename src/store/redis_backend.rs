// =============================================================================
// RedisStore — primary persistence backend (§4.1, §6)
// =============================================================================
//
// Uses a multiplexed async connection so every call can be issued
// concurrently without a connection pool, the way the teacher's
// `BinanceClient` shares one `reqwest::Client` across tasks. `get_all_auctions`
// uses a pipeline so listing every tracked auction costs one round trip
// (§6), and bid history is kept in a Redis sorted set keyed by timestamp so
// retrieval is a single `ZREVRANGE`.
// =============================================================================

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::AsyncCommands;
use tracing::{error, instrument, warn};

use crate::config::GlobalSettings;
use crate::record::{AuctionRecord, BidHistoryEntry};

use super::{Store, AUCTION_TTL_SECS, BID_HISTORY_TTL_SECS, COOKIE_TTL_SECS};

pub struct RedisStore {
    client: redis::Client,
    /// Cached multiplexed connection; re-established lazily on failure.
    conn: RwLock<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            conn: RwLock::new(None),
        })
    }

    async fn connection(&self) -> Option<redis::aio::MultiplexedConnection> {
        if let Some(conn) = self.conn.read().clone() {
            return Some(conn);
        }
        match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => {
                *self.conn.write() = Some(conn.clone());
                Some(conn)
            }
            Err(e) => {
                warn!(error = %e, "redis connection failed");
                None
            }
        }
    }

    fn invalidate(&self) {
        *self.conn.write() = None;
    }
}

#[async_trait]
impl Store for RedisStore {
    #[instrument(skip(self, record), name = "redis_save_auction")]
    async fn save_auction(&self, id: &str, record: &AuctionRecord) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let Ok(payload) = serde_json::to_string(record) else {
            return;
        };
        let res: redis::RedisResult<()> = conn
            .set_ex(format!("auction:{id}"), payload, AUCTION_TTL_SECS as u64)
            .await;
        if let Err(e) = res {
            error!(auction_id = id, error = %e, "redis save_auction failed");
            self.invalidate();
        }
    }

    #[instrument(skip(self), name = "redis_get_auction")]
    async fn get_auction(&self, id: &str) -> Option<AuctionRecord> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn.get(format!("auction:{id}")).await.ok()?;
        payload.and_then(|p| serde_json::from_str(&p).ok())
    }

    #[instrument(skip(self), name = "redis_get_all_auctions")]
    async fn get_all_auctions(&self) -> Vec<AuctionRecord> {
        let Some(mut conn) = self.connection().await else {
            return Vec::new();
        };
        let keys: Vec<String> = match conn.keys("auction:*").await {
            Ok(keys) => keys,
            Err(e) => {
                error!(error = %e, "redis keys scan failed");
                self.invalidate();
                return Vec::new();
            }
        };
        if keys.is_empty() {
            return Vec::new();
        }

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.get(key);
        }
        let payloads: Vec<Option<String>> = match pipe.query_async(&mut conn).await {
            Ok(payloads) => payloads,
            Err(e) => {
                error!(error = %e, "redis pipelined get_all_auctions failed");
                self.invalidate();
                return Vec::new();
            }
        };

        payloads
            .into_iter()
            .flatten()
            .filter_map(|p| serde_json::from_str(&p).ok())
            .collect()
    }

    async fn remove_auction(&self, id: &str) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let res: redis::RedisResult<()> = conn
            .del(vec![format!("auction:{id}"), format!("bid_history:{id}")])
            .await;
        if let Err(e) = res {
            error!(auction_id = id, error = %e, "redis remove_auction failed");
            self.invalidate();
        }
    }

    async fn save_cookies(&self, blob: &[u8]) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, blob);
        let res: redis::RedisResult<()> = conn
            .set_ex("auth:cookies", encoded, COOKIE_TTL_SECS as u64)
            .await;
        if let Err(e) = res {
            error!(error = %e, "redis save_cookies failed");
            self.invalidate();
        }
    }

    async fn get_cookies(&self) -> Option<Vec<u8>> {
        let mut conn = self.connection().await?;
        let encoded: Option<String> = conn.get("auth:cookies").await.ok()?;
        encoded.and_then(|e| {
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, e).ok()
        })
    }

    #[instrument(skip(self, entry), name = "redis_append_bid_history")]
    async fn append_bid_history(&self, id: &str, entry: &BidHistoryEntry) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let Ok(payload) = serde_json::to_string(entry) else {
            return;
        };
        let key = format!("bid_history:{id}");
        let mut pipe = redis::pipe();
        pipe.zadd(&key, payload, entry.timestamp)
            .zremrangebyrank(&key, 0, -101)
            .expire(&key, BID_HISTORY_TTL_SECS as i64);
        let res: redis::RedisResult<()> = pipe.query_async(&mut conn).await;
        if let Err(e) = res {
            error!(auction_id = id, error = %e, "redis append_bid_history failed");
            self.invalidate();
        }
    }

    async fn get_bid_history(&self, id: &str, limit: usize) -> Vec<BidHistoryEntry> {
        let Some(mut conn) = self.connection().await else {
            return Vec::new();
        };
        let key = format!("bid_history:{id}");
        let payloads: Vec<String> = match conn
            .zrevrange(&key, 0, limit.saturating_sub(1) as isize)
            .await
        {
            Ok(payloads) => payloads,
            Err(e) => {
                error!(auction_id = id, error = %e, "redis get_bid_history failed");
                self.invalidate();
                return Vec::new();
            }
        };
        payloads
            .into_iter()
            .filter_map(|p| serde_json::from_str(&p).ok())
            .collect()
    }

    async fn save_settings(&self, settings: &GlobalSettings) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let Ok(payload) = serde_json::to_string(settings) else {
            return;
        };
        let res: redis::RedisResult<()> = conn.set("system:settings", payload).await;
        if let Err(e) = res {
            error!(error = %e, "redis save_settings failed");
            self.invalidate();
        }
    }

    async fn get_settings(&self) -> Option<GlobalSettings> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn.get("system:settings").await.ok()?;
        payload.and_then(|p| serde_json::from_str(&p).ok())
    }

    async fn get_flag(&self, name: &str) -> Option<bool> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(format!("feature:{name}")).await.ok()?;
        value.map(|v| v == "true")
    }

    async fn set_flag(&self, name: &str, value: bool) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let res: redis::RedisResult<()> = conn
            .set(format!("feature:{name}"), if value { "true" } else { "false" })
            .await;
        if let Err(e) = res {
            error!(flag = name, error = %e, "redis set_flag failed");
            self.invalidate();
        }
    }

    async fn is_healthy(&self) -> bool {
        let Some(mut conn) = self.connection().await else {
            return false;
        };
        let res: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        match res {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "redis health check failed");
                self.invalidate();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_malformed_url() {
        assert!(RedisStore::new("not-a-url").is_err());
    }
}
