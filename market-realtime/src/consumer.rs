use anyhow::{anyhow, Result};
use rdkafka::consumer::Consumer;
use rdkafka::Message;
use market_core::redis::{get_connection, RedisConnection};
use market_core::{ChangeEvent, MarketContext, Table};
use redis::streams::StreamMaxlen;
use redis::AsyncCommands;
use std::time::{Duration, Instant};

const CONSUMER_GROUP: &str = "market-realtime";
const STREAM_MAXLEN: usize = 1000;

pub async fn run(ctx: MarketContext) -> Result<()> {
    let redis_pool = ctx
        .redis_pool
        .clone()
        .ok_or_else(|| anyhow!("realtime consumer needs Redis"))?;

    tracing::info!("Starting realtime consumer");

    let consumer = ctx.create_consumer(Some(CONSUMER_GROUP))?;
    let topics: Vec<String> = Table::ALL.iter().map(Table::topic).collect();
    let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
    consumer.subscribe(&topic_refs)?;

    tracing::info!("Subscribed to topics: {}", topics.join(", "));

    let mut conn = get_connection(&redis_pool).await?;
    let mut error_count = 0u32;
    let mut last_error_log = Instant::now();

    loop {
        match consumer.recv().await {
            Ok(message) => {
                error_count = 0;
                let Some(payload) = message.payload() else {
                    continue;
                };
                if let Err(e) = append_change(&mut conn, payload).await {
                    tracing::error!("Error forwarding change from {}: {}", message.topic(), e);
                    // The connection may be gone; the next message retries with a fresh one.
                    match get_connection(&redis_pool).await {
                        Ok(fresh) => conn = fresh,
                        Err(e) => tracing::error!("Redis reconnect failed: {}", e),
                    }
                }
            }
            Err(e) => {
                error_count += 1;
                if last_error_log.elapsed().as_secs() >= 30 {
                    tracing::warn!(
                        "Error receiving change from Redpanda (error count: {}): {}",
                        error_count,
                        e
                    );
                    last_error_log = Instant::now();
                }
                // 1s, 2s, 4s ... capped at 30s
                let backoff = Duration::from_secs(1 << error_count.min(5)).min(Duration::from_secs(30));
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

async fn append_change(conn: &mut RedisConnection, payload: &[u8]) -> Result<()> {
    let event = decode_change(payload)?;
    let stream_key = event.table.stream_key();
    let data = std::str::from_utf8(payload)?;

    let entry_id: String = conn
        .xadd_maxlen(
            &stream_key,
            StreamMaxlen::Approx(STREAM_MAXLEN),
            "*",
            &[("data", data)],
        )
        .await?;

    tracing::debug!("Appended {} change to {} as {}", event.kind, stream_key, entry_id);
    Ok(())
}

fn decode_change(payload: &[u8]) -> Result<ChangeEvent> {
    serde_json::from_slice(payload).map_err(|e| anyhow!("malformed change payload: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_core::ChangeKind;
    use serde_json::json;

    #[test]
    fn test_decode_change_routes_by_table() {
        let event = ChangeEvent::insert(Table::Messages, &json!({"id": "m1", "chat_id": "c1"}));
        let payload = serde_json::to_vec(&event).unwrap();
        let decoded = decode_change(&payload).unwrap();
        assert_eq!(decoded.kind, ChangeKind::Insert);
        assert_eq!(decoded.table.stream_key(), "STREAM:CHANGES:messages");
    }

    #[test]
    fn test_decode_change_rejects_garbage() {
        let err = decode_change(b"{\"event_type\":\"like.created\"}").unwrap_err();
        assert!(err.to_string().starts_with("malformed change payload"));
    }
}
