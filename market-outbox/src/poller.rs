use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use market_core::redpanda::{produce_message, RedpandaProducer};
use market_core::schema::market_outbox;
use market_core::{ChangeEvent, ChangeKind, DbPool, MarketContext, Table};
use std::time::Duration;

#[derive(Queryable, Selectable)]
#[diesel(table_name = market_core::schema::market_outbox)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct OutboxRow {
    id: i64,
    table_name: String,
    change_kind: String,
    record: serde_json::Value,
    old_record: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

const POLL_INTERVAL_MS: u64 = 150;
const BATCH_SIZE: i64 = 100;
const MAX_RETRIES: i32 = 3;

pub async fn run(ctx: MarketContext) -> Result<()> {
    let pool = ctx
        .db_pool
        .clone()
        .ok_or_else(|| anyhow!("outbox poller needs the Postgres backend"))?;
    let producer = ctx
        .redpanda_producer
        .clone()
        .ok_or_else(|| anyhow!("outbox poller needs a Redpanda producer"))?;

    tracing::info!("Starting outbox poller");

    loop {
        match poll_and_publish(&pool, &producer).await {
            Ok(_) => {
                tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
            Err(e) => {
                tracing::error!("Error in outbox poller: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn poll_and_publish(pool: &DbPool, producer: &RedpandaProducer) -> Result<()> {
    let mut conn = pool.get().await?;

    let rows: Vec<OutboxRow> = market_outbox::table
        .filter(market_outbox::processed_at.is_null())
        .filter(market_outbox::retry_count.lt(MAX_RETRIES))
        .order(market_outbox::id.asc())
        .limit(BATCH_SIZE)
        .select(OutboxRow::as_select())
        .load(&mut conn)
        .await?;

    if rows.is_empty() {
        return Ok(());
    }

    tracing::debug!("Found {} unpublished changes", rows.len());

    for row in rows {
        let id = row.id;
        match publish_change(producer, row).await {
            Ok(topic) => {
                let now = Utc::now();
                diesel::update(market_outbox::table.find(id))
                    .set((
                        market_outbox::processed_at.eq(now),
                        market_outbox::published_at.eq(now),
                    ))
                    .execute(&mut conn)
                    .await?;

                tracing::debug!("Published change {} to {}", id, topic);
            }
            Err(e) => {
                diesel::update(market_outbox::table.find(id))
                    .set((
                        market_outbox::retry_count.eq(market_outbox::retry_count + 1),
                        market_outbox::error_message.eq(Some(e.to_string())),
                    ))
                    .execute(&mut conn)
                    .await?;

                tracing::warn!("Failed to publish change {}: {}", id, e);
            }
        }
    }

    Ok(())
}

/// Returns the topic the change went to.
async fn publish_change(producer: &RedpandaProducer, row: OutboxRow) -> Result<String> {
    let event = to_change_event(row)?;
    let topic = event.table.topic();
    let payload = serde_json::to_vec(&event)?;

    produce_message(producer, &topic, message_key(&event).as_deref(), &payload).await?;
    Ok(topic)
}

fn to_change_event(row: OutboxRow) -> Result<ChangeEvent> {
    let table: Table = row
        .table_name
        .parse()
        .map_err(|e| anyhow!("outbox row {}: {}", row.id, e))?;
    let kind: ChangeKind = row
        .change_kind
        .parse()
        .map_err(|e| anyhow!("outbox row {}: {}", row.id, e))?;

    Ok(ChangeEvent {
        table,
        kind,
        record: row.record,
        old_record: row.old_record,
        occurred_at: row.created_at,
    })
}

/// Keyed by row id so changes to one row stay on one partition.
fn message_key(event: &ChangeEvent) -> Option<String> {
    event
        .column("id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(table_name: &str, change_kind: &str) -> OutboxRow {
        OutboxRow {
            id: 7,
            table_name: table_name.to_string(),
            change_kind: change_kind.to_string(),
            record: json!({"id": "lead-1", "buyer_id": "u1"}),
            old_record: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_row_becomes_change_event() {
        let event = to_change_event(row("leads", "insert")).unwrap();
        assert_eq!(event.table, Table::Leads);
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.table.topic(), "changes.leads");
        assert_eq!(message_key(&event).as_deref(), Some("lead-1"));
    }

    #[test]
    fn test_unknown_table_is_an_error() {
        let err = to_change_event(row("notifications", "insert")).unwrap_err();
        assert!(err.to_string().contains("outbox row 7"));
        assert!(to_change_event(row("leads", "truncate")).is_err());
    }

    #[test]
    fn test_key_falls_back_to_old_record() {
        let mut deleted = row("chats", "delete");
        deleted.record = json!({});
        deleted.old_record = Some(json!({"id": "chat-9"}));
        let event = to_change_event(deleted).unwrap();
        assert_eq!(message_key(&event).as_deref(), Some("chat-9"));
    }
}
