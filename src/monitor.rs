// =============================================================================
// Auction Monitor (C6) — the orchestrator, single writer of each record
// =============================================================================
//
// Owns the `AuctionTable` and wires C1–C5, C7, and the bidding decision
// together, the way the teacher's `app_state.rs` ties `PositionManager`,
// `RiskEngine`, and the market-data processors into one owning struct. The
// external interfaces of §6 ("Consumed"/"Produced") are exposed here as
// plain async methods — the seam an HTTP layer in a sibling crate would call
// into, which this crate does not implement (see SPEC_FULL.md §0).
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::auth::AuthState;
use crate::bidding::{execute_auto_bid, BiddingContext};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::GlobalSettings;
use crate::errors::ErrorType;
use crate::event_bus::{EngineEvent, EventBus};
use crate::feature_flags::{FeatureFlags, USE_CIRCUIT_BREAKER, USE_POLLING_QUEUE, USE_STREAM};
use crate::record::{
    now_ms, AuctionMetadata, AuctionRecord, AuctionTable, BiddingConfig, BiddingConfigPatch,
    RETENTION_WINDOW_SECS,
};
use crate::scheduler::{PollFeedback, PollTarget, Scheduler};
use crate::store::Store;
use crate::stream_client::{StreamClient, StreamEvent, StreamSink};
use crate::types::{AuctionStatus, UpdateSource};
use crate::upstream::UpstreamClient;

pub struct MemoryStats {
    pub tracked_auctions: usize,
    pub open_stream_connections: usize,
    pub queue_depth: Option<usize>,
}

pub struct AuthStatus {
    pub authenticated: bool,
}

pub struct AuctionMonitor {
    table: AuctionTable,
    store: Arc<dyn Store>,
    auth: Arc<AuthState>,
    bus: Arc<EventBus>,
    settings: RwLock<GlobalSettings>,
    upstream: Arc<UpstreamClient>,
    breaker: Arc<CircuitBreaker>,
    flags: Arc<FeatureFlags>,
    scheduler: RwLock<Option<Scheduler>>,
    stream_client: RwLock<Option<Arc<StreamClient>>>,
}

impl AuctionMonitor {
    /// Construct the Monitor and wire in its self-referential collaborators
    /// (Scheduler, StreamClient) after the `Arc` exists, the same two-step
    /// construction the teacher avoids needing because it builds `AppState`
    /// field-by-field rather than handing itself to sub-engines.
    pub fn new(
        store: Arc<dyn Store>,
        auth: Arc<AuthState>,
        bus: Arc<EventBus>,
        settings: GlobalSettings,
        upstream: Arc<UpstreamClient>,
        flags: Arc<FeatureFlags>,
        stream_url_template: impl Into<String>,
    ) -> Arc<Self> {
        let breaker = Arc::new(CircuitBreaker::new(
            "upstream",
            CircuitBreakerConfig::default(),
        ));
        breaker.set_enabled(flags.is_enabled(USE_CIRCUIT_BREAKER));

        let monitor = Arc::new(Self {
            table: AuctionTable::new(),
            store,
            auth,
            bus,
            settings: RwLock::new(settings),
            upstream,
            breaker,
            flags,
            scheduler: RwLock::new(None),
            stream_client: RwLock::new(None),
        });

        let scheduler_target: Arc<dyn PollTarget> = monitor.clone();
        let use_queue_mode = monitor.flags.is_enabled(USE_POLLING_QUEUE);
        *monitor.scheduler.write() = Some(Scheduler::new(use_queue_mode, scheduler_target));

        let stream_sink: Arc<dyn StreamSink> = monitor.clone();
        *monitor.stream_client.write() = Some(StreamClient::new(stream_url_template, stream_sink));

        monitor
    }

    fn bidding_ctx(&self) -> BiddingContext {
        BiddingContext {
            settings: self.settings.read().clone(),
            upstream: self.upstream.clone(),
            breaker: self.breaker.clone(),
            store: self.store.clone(),
            bus: self.bus.clone(),
        }
    }

    /// Load persisted auctions, drop those already `ended`, and re-arm
    /// scheduling/streaming for the rest (§4.6 `initialize`).
    pub async fn initialize(&self) {
        self.auth.recover(&self.bus).await;

        let persisted = self.store.get_all_auctions().await;
        for record in persisted {
            if record.status == AuctionStatus::Ended {
                self.store.remove_auction(&record.id).await;
                continue;
            }
            let id = record.id.clone();
            let use_stream = record.use_stream;
            let product_id = record.product_id;
            let (is_winning, time_remaining) = record
                .data
                .as_ref()
                .map(|d| (d.is_winning, d.time_remaining))
                .unwrap_or((true, u64::MAX));

            if self.table.insert_new(record) {
                self.arm(&id, product_id, use_stream, is_winning, time_remaining);
            }
        }
        info!(count = self.table.len(), "monitor initialized from store");
    }

    fn arm(&self, id: &str, product_id: u64, use_stream: bool, is_winning: bool, time_remaining: u64) {
        if let Some(scheduler) = self.scheduler.read().as_ref() {
            scheduler.schedule(id, is_winning, time_remaining);
        }
        if use_stream && self.flags.is_enabled(USE_STREAM) {
            if let Some(stream) = self.stream_client.read().as_ref() {
                stream.connect(id, product_id);
            }
        }
    }

    fn disarm(&self, id: &str) {
        if let Some(scheduler) = self.scheduler.read().as_ref() {
            scheduler.unschedule(id);
        }
        if let Some(stream) = self.stream_client.read().as_ref() {
            stream.disconnect(id);
        }
        self.bus.drop_auction(id);
    }

    /// (I1) duplicate ids are idempotent no-ops.
    pub async fn add_auction(
        &self,
        id: &str,
        product_id: u64,
        config: BiddingConfig,
        metadata: AuctionMetadata,
        use_stream: bool,
    ) -> Result<bool, ErrorType> {
        config.validate()?;

        let record = AuctionRecord::new(id, product_id, config, metadata, use_stream);
        if !self.table.insert_new(record.clone()) {
            return Ok(false);
        }

        self.store.save_auction(id, &record).await;
        self.arm(id, product_id, use_stream, true, u64::MAX);
        Ok(true)
    }

    /// Stops schedule and stream; removes from C1. The record stays in
    /// memory until the retention window expires (I2), for final fan-out.
    pub async fn remove_auction(self: &Arc<Self>, id: &str) -> bool {
        self.disarm(id);
        self.store.remove_auction(id).await;

        if let Some(lock) = self.table.get(id) {
            let mut record = lock.lock().await;
            record.status = AuctionStatus::Ended;
        } else {
            return false;
        }

        // Retention window (I2): keep the record around for final broadcasts
        // before it disappears from memory.
        let this = self.clone();
        let id_owned = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(tokio::time::Duration::from_secs(RETENTION_WINDOW_SECS as u64))
                .await;
            this.table.remove(&id_owned);
        });

        true
    }

    pub async fn update_auction_config(
        &self,
        id: &str,
        patch: &BiddingConfigPatch,
    ) -> Result<BiddingConfig, ErrorType> {
        let lock = self.table.get(id).ok_or(ErrorType::NotMonitored)?;
        let mut record = lock.lock().await;
        let merged = record.config.merged_with(patch)?;
        // Raising max_bid (or any change to it) must let a previously-latched
        // auction resume bidding (scenario 2).
        if merged.max_bid != record.config.max_bid {
            record.max_bid_reached = false;
        }
        record.config = merged.clone();
        self.store.save_auction(id, &record).await;
        Ok(merged)
    }

    /// Fetch a single auction's current record (§6 `getAuction`), preferring
    /// the live in-memory copy over the persisted one.
    pub async fn get_auction(&self, id: &str) -> Option<AuctionRecord> {
        if let Some(lock) = self.table.get(id) {
            return Some(lock.lock().await.clone());
        }
        self.store.get_auction(id).await
    }

    pub fn get_monitored_auctions(&self) -> Vec<String> {
        self.table.ids()
    }

    pub fn get_monitored_count(&self) -> usize {
        self.table.len()
    }

    pub fn get_memory_stats(&self) -> MemoryStats {
        let queue_depth = match self.scheduler.read().as_ref() {
            Some(Scheduler::Queue(q)) => Some(q.queue_depth()),
            _ => None,
        };
        let open_stream_connections = self
            .stream_client
            .read()
            .as_ref()
            .map(|s| s.status().open_connections)
            .unwrap_or(0);
        MemoryStats {
            tracked_auctions: self.table.len(),
            open_stream_connections,
            queue_depth,
        }
    }

    pub async fn get_bid_history(&self, id: &str, limit: usize) -> Vec<crate::record::BidHistoryEntry> {
        self.store.get_bid_history(id, limit).await
    }

    /// Manual bid bypass (§6): still honors I3/I4 by routing through the
    /// same single-flight per-record lock and bidding context, but ignores
    /// the auto-bid decision gates (enabled/strategy/winning/max-bid-reached)
    /// other than the hard bounds.
    pub async fn place_bid_now(&self, id: &str, amount: u64) -> Result<(), ErrorType> {
        let lock = self.table.get(id).ok_or(ErrorType::NotMonitored)?;
        let mut record = lock.lock().await;
        let Some(data) = record.data.clone() else {
            return Err(ErrorType::ValidationError);
        };
        if amount < data.next_bid || record.config.max_bid.map(|m| amount > m).unwrap_or(false) {
            return Err(ErrorType::ValidationError);
        }

        let cookies = self.auth.cookies().unwrap_or_default();
        let ctx = self.bidding_ctx();
        let outcome = ctx
            .breaker
            .call(
                || ctx.upstream.place_bid(record.product_id, amount, &cookies),
                |outcome| outcome.error_type,
            )
            .await;

        match outcome {
            Ok(bid_outcome) if bid_outcome.success => {
                self.bus
                    .emit(EngineEvent::BidPlaced {
                        auction_id: id.to_string(),
                        amount,
                        strategy: record.config.strategy,
                    })
                    .await;
                Ok(())
            }
            Ok(bid_outcome) => Err(bid_outcome.error_type.unwrap_or(ErrorType::UnknownError)),
            Err(e) => Err(e),
        }
    }

    pub async fn set_cookies(&self, blob: Vec<u8>) -> anyhow::Result<()> {
        self.auth.set_cookies(blob).await
    }

    pub fn get_auth_status(&self) -> AuthStatus {
        AuthStatus {
            authenticated: self.auth.is_authenticated(),
        }
    }

    pub fn get_settings(&self) -> GlobalSettings {
        self.settings.read().clone()
    }

    pub async fn save_settings(&self, settings: GlobalSettings) -> anyhow::Result<()> {
        settings.validate()?;
        *self.settings.write() = settings.clone();
        self.store.save_settings(&settings).await;
        Ok(())
    }

    /// Stop all schedules and streams; flush (§4.6 `shutdown`).
    pub async fn shutdown(&self) {
        if let Some(scheduler) = self.scheduler.read().as_ref() {
            scheduler.shutdown().await;
        }
        if let Some(stream) = self.stream_client.read().as_ref() {
            stream.shutdown().await;
        }
        for record in self.table.snapshot_all().await {
            self.store.save_auction(&record.id, &record).await;
        }
        info!("monitor shut down");
    }

    /// Update pipeline shared by both the Scheduler's poll path and the
    /// Stream Client's push path (§4.6 steps 1–8).
    async fn merge_snapshot(
        &self,
        id: &str,
        snapshot: crate::record::AuctionSnapshot,
        source: UpdateSource,
    ) -> bool {
        let Some(lock) = self.table.get(id) else {
            return false;
        };
        let mut record = lock.lock().await;
        let now = now_ms();

        if !record.accepts(&snapshot, now) {
            return false;
        }

        let was_winning = record.data.as_ref().map(|d| d.is_winning).unwrap_or(true);
        record.merge(snapshot.clone(), source, now);

        if was_winning && !snapshot.is_winning {
            self.bus
                .emit(EngineEvent::Outbid {
                    auction_id: id.to_string(),
                    current_bid: snapshot.current_bid,
                })
                .await;
        }
        if record.status == AuctionStatus::Ended {
            self.disarm(id);
            self.bus
                .emit(EngineEvent::AuctionEnded {
                    auction_id: id.to_string(),
                    final_price: snapshot.current_bid,
                    won: snapshot.is_winning,
                })
                .await;
        }

        self.store.save_auction(id, &record).await;
        self.bus
            .emit(EngineEvent::AuctionState {
                auction_id: id.to_string(),
                data: snapshot,
            })
            .await;

        if record.status == AuctionStatus::Monitoring {
            let cookies = self.auth.cookies().unwrap_or_default();
            let ctx = self.bidding_ctx();
            execute_auto_bid(&mut record, &cookies, &ctx).await;
            self.store.save_auction(id, &record).await;
        }

        true
    }
}

#[async_trait]
impl PollTarget for AuctionMonitor {
    async fn poll(&self, auction_id: &str) -> Option<PollFeedback> {
        let lock = self.table.get(auction_id)?;
        let product_id = { lock.lock().await.product_id };
        let cookies = self.auth.cookies().unwrap_or_default();

        let outcome: Result<Result<crate::record::AuctionSnapshot, ErrorType>, ErrorType> = self
            .breaker
            .call(
                || async {
                    self.upstream
                        .get_auction_data(product_id, &cookies)
                        .await
                        .map_err(|_| ErrorType::ConnectionError)
                },
                |r| r.as_ref().err().copied(),
            )
            .await;

        match outcome {
            Ok(Ok(snapshot)) => {
                let is_winning = snapshot.is_winning;
                let time_remaining = snapshot.time_remaining;
                let ended = snapshot.is_closed || time_remaining == 0;
                self.merge_snapshot(auction_id, snapshot, UpdateSource::Poll)
                    .await;
                let mut record = lock.lock().await;
                record.consecutive_poll_errors = 0;
                Some(PollFeedback {
                    success: true,
                    is_winning,
                    time_remaining,
                    ended,
                })
            }
            Ok(Err(e)) | Err(e) => {
                let mut record = lock.lock().await;
                record.consecutive_poll_errors += 1;
                let (is_winning, time_remaining) = record
                    .data
                    .as_ref()
                    .map(|d| (d.is_winning, d.time_remaining))
                    .unwrap_or((true, 600));
                warn!(auction_id, error = %e, "poll failed");
                Some(PollFeedback {
                    success: false,
                    is_winning,
                    time_remaining,
                    ended: false,
                })
            }
        }
    }
}

#[async_trait]
impl StreamSink for AuctionMonitor {
    async fn on_stream_event(&self, auction_id: &str, event: StreamEvent) {
        match event {
            StreamEvent::BidUpdate(snapshot) => {
                self.merge_snapshot(auction_id, snapshot, UpdateSource::Stream)
                    .await;
            }
            StreamEvent::AuctionClosed => {
                let mut final_price = 0;
                let mut won = false;
                if let Some(lock) = self.table.get(auction_id) {
                    let mut record = lock.lock().await;
                    record.status = AuctionStatus::Ended;
                    if let Some(data) = record.data.as_ref() {
                        final_price = data.current_bid;
                        won = data.is_winning;
                    }
                    self.store.save_auction(auction_id, &record).await;
                }
                self.disarm(auction_id);
                self.bus
                    .emit(EngineEvent::AuctionEnded {
                        auction_id: auction_id.to_string(),
                        final_price,
                        won,
                    })
                    .await;
            }
        }
    }

    async fn on_stream_fallback(&self, auction_id: &str) {
        if let Some(lock) = self.table.get(auction_id) {
            let mut record = lock.lock().await;
            record.use_stream = false;
            record.fallback_polling = true;
            self.store.save_auction(auction_id, &record).await;
        }
        warn!(auction_id, "stream exhausted reconnect attempts, falling back to polling");
    }
}
