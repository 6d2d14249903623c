// =============================================================================
// Auction Sentinel — Main Entry Point
// =============================================================================
//
// Composition root: loads config and env, builds the collaborator graph, and
// hands it all to the Monitor (C6). No HTTP/CLI surface is started here — see
// SPEC_FULL.md §0 for why that's out of scope for this crate.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod auth;
mod bidding;
mod circuit_breaker;
mod config;
mod errors;
mod event_bus;
mod feature_flags;
mod monitor;
mod record;
mod scheduler;
mod store;
mod stream_client;
mod types;
mod upstream;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::auth::AuthState;
use crate::config::GlobalSettings;
use crate::event_bus::EventBus;
use crate::feature_flags::FeatureFlags;
use crate::monitor::AuctionMonitor;
use crate::store::{FallbackStore, MemoryStore, RedisStore, Store};
use crate::upstream::UpstreamClient;

const SETTINGS_PATH: &str = "auction_sentinel_settings.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Auction Sentinel — Starting Up                   ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let settings = GlobalSettings::load(SETTINGS_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load settings, using defaults");
        GlobalSettings::default()
    });

    info!(
        snipe_timing = settings.snipe_timing,
        bid_buffer = settings.bid_buffer,
        retry_attempts = settings.retry_attempts,
        "loaded global settings"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let store: Arc<dyn Store> = match std::env::var("REDIS_URL") {
        Ok(url) => match RedisStore::new(&url) {
            Ok(redis) => {
                info!("redis store configured, with in-memory fallback");
                Arc::new(FallbackStore::new(Arc::new(redis)))
            }
            Err(e) => {
                warn!(error = %e, "failed to configure redis store, using memory store only");
                Arc::new(MemoryStore::new())
            }
        },
        Err(_) => {
            info!("REDIS_URL not set, using in-memory store only");
            Arc::new(MemoryStore::new())
        }
    };

    let secret = std::env::var("AUCTION_SENTINEL_SECRET").unwrap_or_else(|_| {
        warn!("AUCTION_SENTINEL_SECRET not set, using an ephemeral key for this run");
        uuid::Uuid::new_v4().to_string()
    });
    let auth = Arc::new(AuthState::new(secret, store.clone()));

    let bus = Arc::new(EventBus::new());
    let flags = Arc::new(FeatureFlags::init(store.clone()).await);

    let base_url = std::env::var("AUCTION_SENTINEL_BASE_URL")
        .unwrap_or_else(|_| "https://api.example-auctions.test".to_string());
    let product_page_base_url = std::env::var("AUCTION_SENTINEL_PRODUCT_PAGE_BASE_URL")
        .unwrap_or_else(|_| "https://www.example-auctions.test".to_string());
    let stream_url_template = std::env::var("AUCTION_SENTINEL_STREAM_URL_TEMPLATE")
        .unwrap_or_else(|_| "https://stream.example-auctions.test/products/{productId}".to_string());

    let upstream = Arc::new(UpstreamClient::new(base_url, product_page_base_url));

    let monitor = AuctionMonitor::new(
        store,
        auth,
        bus,
        settings,
        upstream,
        flags,
        stream_url_template,
    );

    // ── 3. Bring the engine online ───────────────────────────────────────
    monitor.initialize().await;
    info!(
        tracked = monitor.get_monitored_count(),
        "auctions re-armed from persisted state"
    );

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 4. Graceful shutdown ──────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    monitor.shutdown().await;

    info!("Auction Sentinel shut down complete.");
    Ok(())
}
