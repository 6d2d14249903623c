// =============================================================================
// Feature Flags (C8) — lock-free runtime toggles
// =============================================================================
//
// Resolution order env -> store -> default (§4.8). Reads never take a lock:
// each flag is an `AtomicBool` behind a `RwLock<HashMap>` only for the rare
// path of registering a brand-new flag name; normal reads hit the atomic
// directly, the same lock-free-read posture the teacher gives
// `state_version`/`ws_sequence_number` in `app_state.rs`.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::store::Store;

pub const USE_STREAM: &str = "USE_STREAM";
pub const USE_POLLING_QUEUE: &str = "USE_POLLING_QUEUE";
pub const USE_CIRCUIT_BREAKER: &str = "USE_CIRCUIT_BREAKER";

pub struct FeatureFlags {
    store: Arc<dyn Store>,
    flags: parking_lot::RwLock<HashMap<String, Arc<AtomicBool>>>,
}

impl FeatureFlags {
    /// Resolve the three required flags (§4.8) at construction, env -> store
    /// -> default, then return a registry ready for lock-free reads.
    pub async fn init(store: Arc<dyn Store>) -> Self {
        let flags = Self {
            store: store.clone(),
            flags: parking_lot::RwLock::new(HashMap::new()),
        };
        flags.register(USE_STREAM, true).await;
        flags.register(USE_POLLING_QUEUE, true).await;
        flags.register(USE_CIRCUIT_BREAKER, true).await;
        flags
    }

    async fn register(&self, name: &str, default: bool) {
        let resolved = Self::from_env(name)
            .or(self.store.get_flag(name).await)
            .unwrap_or(default);
        info!(flag = name, value = resolved, "feature flag resolved");
        self.flags
            .write()
            .insert(name.to_string(), Arc::new(AtomicBool::new(resolved)));
    }

    fn from_env(name: &str) -> Option<bool> {
        std::env::var(name).ok().map(|v| {
            matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
        })
    }

    fn handle(&self, name: &str) -> Option<Arc<AtomicBool>> {
        self.flags.read().get(name).cloned()
    }

    /// Lock-free read. Unregistered flags default to `false`.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.handle(name)
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Hot-toggle at runtime; persists through to the store.
    pub async fn set(&self, name: &str, value: bool) {
        if let Some(flag) = self.handle(name) {
            flag.store(value, Ordering::Relaxed);
        } else {
            self.flags
                .write()
                .insert(name.to_string(), Arc::new(AtomicBool::new(value)));
        }
        self.store.set_flag(name, value).await;
        info!(flag = name, value, "feature flag toggled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn required_flags_default_to_enabled() {
        let store = Arc::new(MemoryStore::new());
        let flags = FeatureFlags::init(store).await;
        assert!(flags.is_enabled(USE_STREAM));
        assert!(flags.is_enabled(USE_POLLING_QUEUE));
        assert!(flags.is_enabled(USE_CIRCUIT_BREAKER));
    }

    #[tokio::test]
    async fn store_value_overrides_default() {
        let store = Arc::new(MemoryStore::new());
        store.set_flag(USE_CIRCUIT_BREAKER, false).await;
        let flags = FeatureFlags::init(store).await;
        assert!(!flags.is_enabled(USE_CIRCUIT_BREAKER));
    }

    #[tokio::test]
    async fn set_persists_through_to_store() {
        let store = Arc::new(MemoryStore::new());
        let flags = FeatureFlags::init(store.clone()).await;
        flags.set(USE_STREAM, false).await;
        assert!(!flags.is_enabled(USE_STREAM));
        assert_eq!(store.get_flag(USE_STREAM).await, Some(false));
    }

    #[tokio::test]
    async fn unknown_flag_defaults_false() {
        let store = Arc::new(MemoryStore::new());
        let flags = FeatureFlags::init(store).await;
        assert!(!flags.is_enabled("SOME_UNKNOWN_FLAG"));
    }
}
