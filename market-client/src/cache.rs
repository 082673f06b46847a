//! Keyed query cache with request de-duplication.
//!
//! Values are stored type-erased and read back with the type they were
//! fetched as. Invalidation bumps a per-key generation so a fetch that was
//! already in flight cannot write a result that predates the change.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use market_core::error::MarketResult;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    pub resource: String,
    pub params: BTreeMap<String, String>,
}

impl QueryKey {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Same resource, and every param of `pattern` is present with the same value.
    pub fn matches(&self, pattern: &QueryKey) -> bool {
        self.resource == pattern.resource
            && pattern
                .params
                .iter()
                .all(|(name, value)| self.params.get(name) == Some(value))
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.resource)?;
        if !self.params.is_empty() {
            let params: Vec<String> = self.params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            write!(f, "({})", params.join(","))?;
        }
        Ok(())
    }
}

/// Query keys used across the client.
pub mod keys {
    use super::QueryKey;
    use market_core::types::LeadStatus;

    pub const PROFILE: &str = "profile";
    pub const MATCHES: &str = "matches";
    pub const BROKER_STATS: &str = "broker-stats";
    pub const BROKER_LEADS: &str = "broker-leads";
    pub const BUYER_LEADS: &str = "buyer-leads";
    pub const CHATS: &str = "chats";
    pub const CHAT: &str = "chat";
    pub const CHAT_MESSAGES: &str = "chat-messages";
    pub const WALLET_TRANSACTIONS: &str = "wallet-transactions";
    pub const REQUIREMENTS: &str = "requirements";
    pub const PROPERTY_APPROVALS: &str = "property-approvals";
    pub const PROPERTIES: &str = "properties";

    pub fn profile(user_id: &str) -> QueryKey {
        QueryKey::new(PROFILE).with("user", user_id)
    }

    /// Pattern over every listing of this broker.
    pub fn matches(broker_id: &str) -> QueryKey {
        QueryKey::new(MATCHES).with("broker", broker_id)
    }

    pub fn match_listing(broker_id: &str, listing: &str) -> QueryKey {
        matches(broker_id).with("listing", listing)
    }

    pub fn broker_stats(broker_id: &str) -> QueryKey {
        QueryKey::new(BROKER_STATS).with("broker", broker_id)
    }

    pub fn broker_leads(broker_id: &str) -> QueryKey {
        QueryKey::new(BROKER_LEADS).with("broker", broker_id)
    }

    pub fn buyer_leads(buyer_id: &str) -> QueryKey {
        QueryKey::new(BUYER_LEADS).with("buyer", buyer_id)
    }

    pub fn leads_with_status(base: QueryKey, status: Option<LeadStatus>) -> QueryKey {
        base.with("status", status.map(|s| s.as_str()).unwrap_or("all"))
    }

    pub fn chats(user_id: &str) -> QueryKey {
        QueryKey::new(CHATS).with("user", user_id)
    }

    pub fn chat(chat_id: &str) -> QueryKey {
        QueryKey::new(CHAT).with("chat", chat_id)
    }

    pub fn chat_messages(chat_id: &str) -> QueryKey {
        QueryKey::new(CHAT_MESSAGES).with("chat", chat_id)
    }

    pub fn wallet_transactions(user_id: &str) -> QueryKey {
        QueryKey::new(WALLET_TRANSACTIONS).with("user", user_id)
    }

    pub fn requirements(buyer_id: &str) -> QueryKey {
        QueryKey::new(REQUIREMENTS).with("buyer", buyer_id)
    }

    pub fn property_approvals(broker_id: &str) -> QueryKey {
        QueryKey::new(PROPERTY_APPROVALS).with("broker", broker_id)
    }

    pub fn properties(broker_id: &str) -> QueryKey {
        QueryKey::new(PROPERTIES).with("broker", broker_id)
    }
}

type Value = Arc<dyn Any + Send + Sync>;

struct Stored {
    value: Value,
    generation: u64,
    fetched_at: Instant,
}

struct Slot {
    generation: AtomicU64,
    /// Held for the duration of a fetch; concurrent readers wait here.
    state: tokio::sync::Mutex<Option<Stored>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// Unused: no fetch in flight, nobody else holds it, nothing fresh stored.
    fn is_idle(self: &Arc<Self>, stale_after: Duration) -> bool {
        if Arc::strong_count(self) > 1 {
            return false;
        }
        let Ok(state) = self.state.try_lock() else {
            return false;
        };
        match state.as_ref() {
            Some(stored) => {
                stored.generation != self.generation.load(Ordering::Acquire)
                    || stored.fetched_at.elapsed() >= stale_after
            }
            None => true,
        }
    }

    fn fresh<T: Clone + 'static>(&self, stored: &Stored, stale_after: Duration) -> Option<T> {
        if stored.generation != self.generation.load(Ordering::Acquire) {
            return None;
        }
        if stored.fetched_at.elapsed() >= stale_after {
            return None;
        }
        stored.value.downcast_ref::<T>().cloned()
    }
}

/// Slot count above which idle slots are pruned on insert.
const PRUNE_THRESHOLD: usize = 256;

pub struct QueryCache {
    slots: Mutex<HashMap<QueryKey, Arc<Slot>>>,
    stale_after: Duration,
}

impl QueryCache {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            stale_after,
        }
    }

    fn slot(&self, key: &QueryKey) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        if slots.len() >= PRUNE_THRESHOLD && !slots.contains_key(key) {
            Self::prune_locked(&mut slots, self.stale_after);
        }
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    fn existing_slots(&self) -> Vec<(QueryKey, Arc<Slot>)> {
        let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.iter().map(|(k, s)| (k.clone(), s.clone())).collect()
    }

    /// Returns the cached value when fresh, otherwise runs `fetcher`.
    ///
    /// Only one fetcher runs per key at a time. Errors are returned to the
    /// caller and never cached.
    pub async fn fetch<T, F, Fut>(&self, key: QueryKey, fetcher: F) -> MarketResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = MarketResult<T>>,
    {
        let slot = self.slot(&key);
        let mut state = slot.state.lock().await;
        if let Some(value) = state.as_ref().and_then(|s| slot.fresh::<T>(s, self.stale_after)) {
            return Ok(value);
        }

        let generation = slot.generation.load(Ordering::Acquire);
        tracing::debug!("Fetching query {}", key);
        let value = fetcher().await?;

        if slot.generation.load(Ordering::Acquire) == generation {
            *state = Some(Stored {
                value: Arc::new(value.clone()),
                generation,
                fetched_at: Instant::now(),
            });
        } else {
            tracing::debug!("Discarding result for {} invalidated mid-fetch", key);
        }
        Ok(value)
    }

    /// Cached value regardless of freshness. Does not wait for an in-flight fetch.
    pub fn peek<T: Clone + 'static>(&self, key: &QueryKey) -> Option<T> {
        let slot = {
            let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots.get(key)?.clone()
        };
        let state = slot.state.try_lock().ok()?;
        state.as_ref()?.value.downcast_ref::<T>().cloned()
    }

    pub fn is_fresh(&self, key: &QueryKey) -> bool {
        let slot = {
            let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            match slots.get(key) {
                Some(slot) => slot.clone(),
                None => return false,
            }
        };
        let Ok(state) = slot.state.try_lock() else {
            return false;
        };
        match state.as_ref() {
            Some(stored) => {
                stored.generation == slot.generation.load(Ordering::Acquire)
                    && stored.fetched_at.elapsed() < self.stale_after
            }
            None => false,
        }
    }

    /// Marks every key matching `pattern` stale. Returns how many were hit.
    pub fn invalidate(&self, pattern: &QueryKey) -> usize {
        let mut hit = 0;
        for (key, slot) in self.existing_slots() {
            if key.matches(pattern) {
                slot.generation.fetch_add(1, Ordering::AcqRel);
                hit += 1;
            }
        }
        if hit > 0 {
            tracing::debug!("Invalidated {} queries matching {}", hit, pattern);
        }
        hit
    }

    /// Drops every slot. Fetches still in flight finish but store nothing
    /// visible.
    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        for slot in slots.values() {
            slot.generation.fetch_add(1, Ordering::AcqRel);
        }
        let dropped = slots.len();
        slots.clear();
        tracing::debug!("Cleared {} cached queries", dropped);
    }

    /// Removes slots holding nothing fresh. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        Self::prune_locked(&mut slots, self.stale_after)
    }

    fn prune_locked(slots: &mut HashMap<QueryKey, Arc<Slot>>, stale_after: Duration) -> usize {
        let before = slots.len();
        slots.retain(|_, slot| !slot.is_idle(stale_after));
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_core::MarketError;
    use std::sync::atomic::AtomicUsize;

    fn cache() -> QueryCache {
        QueryCache::new(Duration::from_secs(300))
    }

    #[test]
    fn test_pattern_matches_param_superset() {
        let listing = keys::match_listing("b1", "dashboard");
        assert!(listing.matches(&keys::matches("b1")));
        assert!(listing.matches(&QueryKey::new(keys::MATCHES)));
        assert!(!listing.matches(&keys::matches("b2")));
        assert!(!keys::matches("b1").matches(&listing));
        assert_eq!(listing.to_string(), "matches(broker=b1,listing=dashboard)");
    }

    #[tokio::test]
    async fn test_fresh_value_is_served_from_cache() {
        let cache = cache();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let value: i64 = cache
                .fetch(keys::broker_stats("b1"), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_fresh(&keys::broker_stats("b1")));
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let cache = cache();
        let key = keys::match_listing("b1", "full");
        let _: Vec<i32> = cache.fetch(key.clone(), || async { Ok(vec![1, 2]) }).await.unwrap();

        assert_eq!(cache.invalidate(&keys::matches("b1")), 1);
        assert!(!cache.is_fresh(&key));
        assert_eq!(cache.peek::<Vec<i32>>(&key), Some(vec![1, 2]));

        let refetched: Vec<i32> = cache.fetch(key, || async { Ok(vec![2]) }).await.unwrap();
        assert_eq!(refetched, vec![2]);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_request() {
        let cache = Arc::new(cache());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .fetch(keys::chats("u1"), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, MarketError>("loaded".to_string())
                    })
                    .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "loaded");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_invalidated_mid_flight_is_not_stored() {
        let cache = Arc::new(cache());
        let key = keys::wallet_transactions("u1");

        let result: i32 = cache
            .fetch(key.clone(), || {
                let cache = cache.clone();
                async move {
                    cache.invalidate(&keys::wallet_transactions("u1"));
                    Ok(1)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 1);
        assert!(!cache.is_fresh(&key));
        assert_eq!(cache.peek::<i32>(&key), None);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = cache();
        let key = keys::profile("u1");
        let err = cache
            .fetch::<i32, _, _>(key.clone(), || async { Err(MarketError::Unauthenticated) })
            .await;
        assert!(err.is_err());
        let ok: i32 = cache.fetch(key, || async { Ok(7) }).await.unwrap();
        assert_eq!(ok, 7);
    }

    #[tokio::test]
    async fn test_stale_entries_are_refetched() {
        let cache = QueryCache::new(Duration::ZERO);
        let key = keys::requirements("u1");
        let _: i32 = cache.fetch(key.clone(), || async { Ok(1) }).await.unwrap();
        let second: i32 = cache.fetch(key, || async { Ok(2) }).await.unwrap();
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn test_clear_drops_slots_and_in_flight_results() {
        let cache = Arc::new(cache());
        let _: i32 = cache.fetch(keys::profile("u1"), || async { Ok(1) }).await.unwrap();
        let _: i32 = cache.fetch(keys::chat_messages("c1"), || async { Ok(2) }).await.unwrap();
        assert_eq!(cache.len(), 2);

        let key = keys::chat_messages("c2");
        let _: i32 = cache
            .fetch(key.clone(), || {
                let cache = cache.clone();
                async move {
                    cache.clear();
                    Ok(3)
                }
            })
            .await
            .unwrap();

        assert!(cache.is_empty());
        assert_eq!(cache.peek::<i32>(&key), None);
        assert_eq!(cache.peek::<i32>(&keys::profile("u1")), None);
    }

    #[tokio::test]
    async fn test_prune_keeps_only_fresh_slots() {
        let cache = cache();
        let _: i32 = cache.fetch(keys::chat_messages("c1"), || async { Ok(1) }).await.unwrap();
        let _: i32 = cache.fetch(keys::chat_messages("c2"), || async { Ok(2) }).await.unwrap();
        let _ = cache
            .fetch::<i32, _, _>(keys::chat_messages("c3"), || async { Err(MarketError::Unauthenticated) })
            .await;
        cache.invalidate(&keys::chat_messages("c1"));

        assert_eq!(cache.prune(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.is_fresh(&keys::chat_messages("c2")));
    }

    #[tokio::test]
    async fn test_slot_count_stays_bounded() {
        let cache = QueryCache::new(Duration::ZERO);
        for i in 0..(PRUNE_THRESHOLD * 2) {
            let chat = format!("c{}", i);
            let _: usize = cache.fetch(keys::chat_messages(&chat), || async move { Ok(i) }).await.unwrap();
        }
        assert!(cache.len() <= PRUNE_THRESHOLD);
    }
}
