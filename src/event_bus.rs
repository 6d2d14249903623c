// =============================================================================
// Event Bus / Fan-out (C7)
// =============================================================================
//
// Generalizes the teacher's WebSocket push loop (`api/ws.rs`, "broadcast a
// full snapshot to every connection every 500ms") into per-event fan-out with
// a per-subscriber bounded queue: broadcast MUST NOT block the Monitor (§4.7),
// so delivery never awaits a slow subscriber — it pushes into that
// subscriber's own queue and moves on. On overflow the oldest queued event is
// dropped, never the newest, and a `lag` counter records how much was lost
// (§5).
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;

use crate::errors::ErrorType;
use crate::record::AuctionSnapshot;
use crate::types::BiddingStrategy;

/// Per-subscriber high-water mark (§5): beyond this, the oldest event is
/// dropped to make room for the newest.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum EngineEvent {
    AuctionState {
        auction_id: String,
        data: AuctionSnapshot,
    },
    BidPlaced {
        auction_id: String,
        amount: u64,
        strategy: BiddingStrategy,
    },
    BidFailed {
        auction_id: String,
        error_type: ErrorType,
    },
    Outbid {
        auction_id: String,
        current_bid: u64,
    },
    AuctionEnded {
        auction_id: String,
        final_price: u64,
        won: bool,
    },
    MaxBidReached {
        auction_id: String,
        max_bid: u64,
    },
    AuthRequired,
}

impl EngineEvent {
    fn auction_id(&self) -> Option<&str> {
        match self {
            Self::AuctionState { auction_id, .. }
            | Self::BidPlaced { auction_id, .. }
            | Self::BidFailed { auction_id, .. }
            | Self::Outbid { auction_id, .. }
            | Self::AuctionEnded { auction_id, .. }
            | Self::MaxBidReached { auction_id, .. } => Some(auction_id),
            Self::AuthRequired => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
}

struct SubscriberQueue {
    inner: Mutex<VecDeque<EngineEvent>>,
    notify: Notify,
    lag: AtomicU64,
}

impl SubscriberQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            lag: AtomicU64::new(0),
        })
    }

    fn push(&self, event: EngineEvent) {
        let mut queue = self.inner.lock();
        if queue.len() >= SUBSCRIBER_QUEUE_CAPACITY {
            queue.pop_front();
            self.lag.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }
}

/// A subscriber's receiving half. Events for a given auction arrive in the
/// order the Monitor emitted them (§5).
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    pub async fn recv(&mut self) -> EngineEvent {
        loop {
            if let Some(event) = self.queue.inner.lock().pop_front() {
                return event;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Result<EngineEvent, TryRecvError> {
        self.queue
            .inner
            .lock()
            .pop_front()
            .ok_or(TryRecvError::Empty)
    }

    /// Count of events dropped due to overflow since this subscription began.
    pub fn lag(&self) -> u64 {
        self.queue.lag.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Arc<SubscriberQueue>>>,
    auction_index: RwLock<HashMap<String, HashSet<String>>>,
    global: RwLock<HashSet<String>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events not scoped to a single auction (e.g. `authRequired`)
    /// as well as every per-auction event (the "all clients" set, §4.7).
    pub fn subscribe_global(&self, subscriber_id: String) -> Subscription {
        let queue = SubscriberQueue::new();
        self.subscribers
            .write()
            .insert(subscriber_id.clone(), queue.clone());
        self.global.write().insert(subscriber_id);
        Subscription { queue }
    }

    /// Scope an already-subscribed client to a specific auction's events too.
    pub fn follow_auction(&self, subscriber_id: &str, auction_id: &str) {
        self.auction_index
            .write()
            .entry(auction_id.to_string())
            .or_default()
            .insert(subscriber_id.to_string());
    }

    pub fn unfollow_auction(&self, subscriber_id: &str, auction_id: &str) {
        if let Some(set) = self.auction_index.write().get_mut(auction_id) {
            set.remove(subscriber_id);
        }
    }

    pub fn unsubscribe(&self, subscriber_id: &str) {
        self.subscribers.write().remove(subscriber_id);
        self.global.write().remove(subscriber_id);
        for set in self.auction_index.write().values_mut() {
            set.remove(subscriber_id);
        }
    }

    /// Drop every subscriber record associated with an auction once it is
    /// removed from the Monitor.
    pub fn drop_auction(&self, auction_id: &str) {
        self.auction_index.write().remove(auction_id);
    }

    async fn broadcast_to(&self, targets: HashSet<String>, event: &EngineEvent) {
        let subscribers = self.subscribers.read();
        for id in targets {
            if let Some(queue) = subscribers.get(&id) {
                queue.push(event.clone());
            }
        }
    }

    /// Emit an event to every global subscriber plus anyone specifically
    /// following the event's auction, if it has one (§4.7).
    pub async fn emit(&self, event: EngineEvent) {
        let mut targets: HashSet<String> = self.global.read().clone();
        if let Some(auction_id) = event.auction_id() {
            if let Some(followers) = self.auction_index.read().get(auction_id) {
                targets.extend(followers.iter().cloned());
            }
        }
        self.broadcast_to(targets, &event).await;
    }

    /// Emit an event with no per-auction targeting (e.g. `authRequired`).
    pub async fn broadcast_global(&self, event: EngineEvent) {
        let targets = self.global.read().clone();
        self.broadcast_to(targets, &event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn global_subscriber_receives_auction_event() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_global("a".into());
        bus.emit(EngineEvent::AuctionEnded {
            auction_id: "1".into(),
            final_price: 100,
            won: true,
        })
        .await;
        let event = sub.recv().await;
        assert!(matches!(event, EngineEvent::AuctionEnded { .. }));
    }

    #[tokio::test]
    async fn unsubscribed_client_receives_nothing() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_global("a".into());
        bus.unsubscribe("a");
        bus.emit(EngineEvent::AuthRequired).await;
        assert_eq!(sub.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_increments_lag() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_global("a".into());
        for i in 0..(SUBSCRIBER_QUEUE_CAPACITY + 5) {
            bus.emit(EngineEvent::MaxBidReached {
                auction_id: i.to_string(),
                max_bid: i as u64,
            })
            .await;
        }
        assert_eq!(sub.lag(), 5);
        let first = sub.recv().await;
        match first {
            EngineEvent::MaxBidReached { auction_id, .. } => assert_eq!(auction_id, "5"),
            _ => panic!("unexpected event"),
        }
    }

    #[tokio::test]
    async fn events_are_delivered_in_emission_order_per_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_global("a".into());
        bus.emit(EngineEvent::BidPlaced {
            auction_id: "1".into(),
            amount: 10,
            strategy: BiddingStrategy::Manual,
        })
        .await;
        bus.emit(EngineEvent::BidPlaced {
            auction_id: "1".into(),
            amount: 15,
            strategy: BiddingStrategy::Manual,
        })
        .await;
        let first = sub.recv().await;
        let second = sub.recv().await;
        match (first, second) {
            (
                EngineEvent::BidPlaced { amount: a, .. },
                EngineEvent::BidPlaced { amount: b, .. },
            ) => {
                assert_eq!(a, 10);
                assert_eq!(b, 15);
            }
            _ => panic!("unexpected events"),
        }
    }

    #[tokio::test]
    async fn one_slow_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe_global("slow".into());
        let mut fast = bus.subscribe_global("fast".into());
        bus.emit(EngineEvent::AuthRequired).await;
        // "slow" never calls recv — delivery must have completed anyway.
        assert!(matches!(fast.recv().await, EngineEvent::AuthRequired));
        assert!(matches!(slow.try_recv(), Ok(EngineEvent::AuthRequired)));
    }
}
