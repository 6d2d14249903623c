// =============================================================================
// Stream Client (C5) — SSE connections, one per tracked auction (§4.5)
// =============================================================================
//
// No SSE crate is precedented anywhere in the retrieval pack, so this is a
// small hand-rolled `text/event-stream` line parser over `reqwest`'s
// `bytes_stream()`, the same building blocks (`reqwest` + `futures-util`)
// the teacher already depends on for its WebSocket market-data streams. Each
// auction gets its own spawned reconnect-loop task, mirroring how `main.rs`
// spawns and reconnects the kline/trade/depth streams per symbol.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::record::AuctionSnapshot;

/// Backoff table for reconnects (§4.5): 1, 2, 4, 8, 16, capped at 30s.
const BACKOFF_TABLE_SECS: &[u64] = &[1, 2, 4, 8, 16, 30];
/// Consecutive failures before signalling fallback to polling (§4.5).
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub enum StreamEvent {
    BidUpdate(AuctionSnapshot),
    AuctionClosed,
}

#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn on_stream_event(&self, auction_id: &str, event: StreamEvent);
    /// Invoked after `maxReconnectAttempts` consecutive failures; the
    /// Monitor is expected to set `useStream=false` and rely on C4 alone.
    async fn on_stream_fallback(&self, auction_id: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub product_id: u64,
    pub ready_state: ReadyState,
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamClientStatus {
    pub enabled: bool,
    pub open_connections: usize,
    pub connections: Vec<ConnectionStatus>,
}

struct RawEvent {
    name: String,
    data: String,
}

/// Accumulates bytes and splits them into `\n\n`-delimited SSE event blocks.
struct SseFramer {
    buffer: String,
}

impl SseFramer {
    fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    fn push(&mut self, chunk: &str) -> Vec<RawEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = Self::parse_block(&block) {
                events.push(event);
            }
        }
        events
    }

    fn parse_block(block: &str) -> Option<RawEvent> {
        let mut name = String::from("message");
        let mut data_lines = Vec::new();

        for line in block.lines() {
            if let Some(value) = line.strip_prefix("event:") {
                name = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("data:") {
                data_lines.push(value.trim().to_string());
            }
        }

        if data_lines.is_empty() {
            return None;
        }
        Some(RawEvent {
            name,
            data: data_lines.join("\n"),
        })
    }
}

pub struct StreamClient {
    http: reqwest::Client,
    stream_url_template: String,
    sink: Arc<dyn StreamSink>,
    max_reconnect_attempts: u32,
    connections: RwLock<HashMap<String, (ConnectionStatus, JoinHandle<()>)>>,
}

impl StreamClient {
    pub fn new(stream_url_template: impl Into<String>, sink: Arc<dyn StreamSink>) -> Arc<Self> {
        Arc::new(Self {
            http: reqwest::Client::new(),
            stream_url_template: stream_url_template.into(),
            sink,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            connections: RwLock::new(HashMap::new()),
        })
    }

    fn url_for(&self, product_id: u64) -> String {
        self.stream_url_template
            .replace("{productId}", &product_id.to_string())
    }

    /// Open (or replace) the stream connection for an auction (I2 corollary:
    /// at most one stream per auction).
    pub fn connect(self: &Arc<Self>, auction_id: &str, product_id: u64) {
        self.disconnect(auction_id);

        let this = self.clone();
        let id = auction_id.to_string();
        let handle = tokio::spawn(async move { this.run_connection(id, product_id).await });

        self.connections.write().insert(
            auction_id.to_string(),
            (
                ConnectionStatus {
                    product_id,
                    ready_state: ReadyState::Connecting,
                    reconnect_attempts: 0,
                },
                handle,
            ),
        );
    }

    pub fn disconnect(&self, auction_id: &str) {
        if let Some((_, handle)) = self.connections.write().remove(auction_id) {
            handle.abort();
        }
    }

    fn set_status(&self, auction_id: &str, ready_state: ReadyState, attempts: u32) {
        if let Some((status, _)) = self.connections.write().get_mut(auction_id) {
            status.ready_state = ready_state;
            status.reconnect_attempts = attempts;
        }
    }

    async fn run_connection(self: Arc<Self>, auction_id: String, product_id: u64) {
        let attempts = AtomicU32::new(0);

        loop {
            let current = attempts.load(Ordering::Relaxed);
            self.set_status(&auction_id, ReadyState::Connecting, current);

            match self.stream_once(&auction_id, product_id, &attempts).await {
                Ok(()) => {
                    // Graceful server-side close; treat as a reconnect, not
                    // a failure, per §4.5.
                    attempts.store(0, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(auction_id = %auction_id, error = %e, "stream connection failed");
                    attempts.fetch_add(1, Ordering::Relaxed);
                }
            }

            let current = attempts.load(Ordering::Relaxed);
            if current >= self.max_reconnect_attempts {
                warn!(auction_id = %auction_id, attempts = current, "max reconnect attempts reached, falling back to polling");
                self.set_status(&auction_id, ReadyState::Closed, current);
                self.sink.on_stream_fallback(&auction_id).await;
                return;
            }

            let delay = BACKOFF_TABLE_SECS
                .get(current as usize)
                .copied()
                .unwrap_or(*BACKOFF_TABLE_SECS.last().unwrap());
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
    }

    async fn stream_once(
        &self,
        auction_id: &str,
        product_id: u64,
        attempts: &AtomicU32,
    ) -> anyhow::Result<()> {
        let url = self.url_for(product_id);
        let response = self.http.get(&url).send().await?;
        let response = response.error_for_status()?;

        self.set_status(auction_id, ReadyState::Open, 0);
        debug!(auction_id = %auction_id, %url, "stream connected");

        let mut framer = SseFramer::new();
        let mut bytes_stream = response.bytes_stream();

        while let Some(chunk) = bytes_stream.next().await {
            let chunk = chunk?;
            let text = String::from_utf8_lossy(&chunk);
            for event in framer.push(&text) {
                // Any successfully received event resets the reconnect
                // counter (§4.5), not only a full graceful close.
                attempts.store(0, Ordering::Relaxed);
                self.handle_event(auction_id, event).await;
            }
        }

        Ok(())
    }

    async fn handle_event(&self, auction_id: &str, event: RawEvent) {
        match event.name.as_str() {
            "bidUpdate" => {
                if let Ok(snapshot) = serde_json::from_str::<AuctionSnapshot>(&event.data) {
                    self.sink
                        .on_stream_event(auction_id, StreamEvent::BidUpdate(snapshot))
                        .await;
                }
            }
            "auctionClosed" => {
                self.sink
                    .on_stream_event(auction_id, StreamEvent::AuctionClosed)
                    .await;
            }
            _ => {
                // Heartbeat/keep-alive or an unrecognized event name: ignored.
            }
        }
    }

    pub fn status(&self) -> StreamClientStatus {
        let connections = self.connections.read();
        StreamClientStatus {
            enabled: true,
            open_connections: connections.len(),
            connections: connections.values().map(|(status, _)| status.clone()).collect(),
        }
    }

    pub async fn shutdown(&self) {
        let handles: Vec<_> = self
            .connections
            .write()
            .drain()
            .map(|(_, (_, handle))| handle)
            .collect();
        for handle in handles {
            handle.abort();
        }
        info!("stream client shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_splits_on_blank_line_and_parses_fields() {
        let mut framer = SseFramer::new();
        let events = framer.push("event: bidUpdate\ndata: {\"currentBid\":10}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "bidUpdate");
        assert_eq!(events[0].data, "{\"currentBid\":10}");
    }

    #[test]
    fn framer_buffers_partial_chunks_across_pushes() {
        let mut framer = SseFramer::new();
        assert!(framer.push("event: auctionClosed\ndata").is_empty());
        let events = framer.push(": {}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "auctionClosed");
    }

    #[test]
    fn heartbeat_without_data_yields_no_event() {
        let mut framer = SseFramer::new();
        let events = framer.push(": keep-alive\n\n");
        assert!(events.is_empty());
    }

    #[test]
    fn default_event_name_is_message_when_unspecified() {
        let mut framer = SseFramer::new();
        let events = framer.push("data: hello\n\n");
        assert_eq!(events[0].name, "message");
    }

    #[test]
    fn backoff_table_matches_spec() {
        assert_eq!(BACKOFF_TABLE_SECS, &[1, 2, 4, 8, 16, 30]);
    }
}
