use std::sync::Arc;

use market_core::changes::ChangeEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::cache::QueryCache;
use crate::invalidation::InvalidationTable;

/// Applies pushed row changes to the query cache.
pub struct RealtimeListener;

impl RealtimeListener {
    pub fn spawn(
        mut changes: broadcast::Receiver<ChangeEvent>,
        table: InvalidationTable,
        cache: Arc<QueryCache>,
    ) -> ListenerHandle {
        let task = tokio::spawn(async move {
            tracing::debug!("Realtime listener started for {:?}", table.tables());
            loop {
                match changes.recv().await {
                    Ok(event) => {
                        for key in table.keys_for(&event) {
                            cache.invalidate(&key);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "Realtime listener skipped {} change events, invalidating all subscribed queries",
                            skipped
                        );
                        for key in table.all_keys() {
                            cache.invalidate(&key);
                        }
                    }
                    Err(RecvError::Closed) => {
                        tracing::debug!("Change feed closed, stopping realtime listener");
                        break;
                    }
                }
            }
        });
        ListenerHandle { task }
    }
}

/// Owns a listener task. Dropping the handle stops the subscription.
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys;
    use market_core::changes::Table;
    use market_core::types::UserType;
    use serde_json::json;
    use std::time::Duration;

    async fn wait_until(cond: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cond()
    }

    async fn warm(cache: &QueryCache, key: crate::cache::QueryKey) {
        let _: i32 = cache.fetch(key, || async { Ok(1) }).await.unwrap();
    }

    #[tokio::test]
    async fn test_change_invalidates_subscribed_query() {
        let cache = Arc::new(QueryCache::new(Duration::from_secs(300)));
        let listing = keys::match_listing("b1", "dashboard");
        warm(&cache, listing.clone()).await;

        let (tx, rx) = broadcast::channel(16);
        let _handle = RealtimeListener::spawn(rx, InvalidationTable::for_user("b1", UserType::Broker), cache.clone());

        tx.send(ChangeEvent::insert(Table::PropertyMatches, &json!({"broker_id": "b1"})))
            .unwrap();
        assert!(wait_until(|| !cache.is_fresh(&listing)).await);
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_listening() {
        let cache = Arc::new(QueryCache::new(Duration::from_secs(300)));
        let stats = keys::broker_stats("b1");
        warm(&cache, stats.clone()).await;

        let (tx, rx) = broadcast::channel(16);
        let handle = RealtimeListener::spawn(rx, InvalidationTable::for_user("b1", UserType::Broker), cache.clone());
        drop(handle);
        assert!(wait_until(|| tx.receiver_count() == 0).await);

        assert!(tx
            .send(ChangeEvent::insert(Table::PropertyMatches, &json!({"broker_id": "b1"})))
            .is_err());
        assert!(cache.is_fresh(&stats));
    }

    #[tokio::test]
    async fn test_lag_invalidates_everything_subscribed() {
        let cache = Arc::new(QueryCache::new(Duration::from_secs(300)));
        let requirements = keys::requirements("u1");
        warm(&cache, requirements.clone()).await;

        let (tx, rx) = broadcast::channel(1);
        // Overflow the channel before the listener reads anything.
        for _ in 0..3 {
            tx.send(ChangeEvent::insert(Table::Profiles, &json!({"id": "someone"})))
                .unwrap();
        }
        let _handle = RealtimeListener::spawn(rx, InvalidationTable::for_user("u1", UserType::Buyer), cache.clone());
        assert!(wait_until(|| !cache.is_fresh(&requirements)).await);
    }
}
