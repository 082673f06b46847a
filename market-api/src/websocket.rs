use anyhow::Result;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Extension, Query,
    },
    response::Response,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use market_core::redis::{get_connection, RedisPool};
use market_core::{ChangeEvent, ChangeFilter, MarketContext, MarketError, MarketResult, Table};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::handlers::ApiError;

const READ_BLOCK_MS: usize = 1000;
const READ_COUNT: usize = 100;

/// Columns that identify the row's owner.
const OWNER_COLUMNS: [&str; 4] = ["user_id", "broker_id", "buyer_id", "sender_id"];

#[derive(Deserialize)]
pub struct WsQuery {
    pub table: String,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

enum ChangeSource {
    Redis(RedisPool),
    Feed(broadcast::Receiver<ChangeEvent>),
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Extension(ctx): Extension<MarketContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(params): Query<WsQuery>,
) -> Result<Response, ApiError> {
    let (table, filter) = parse_subscription(&params)?;
    authorize_subscription(&ctx, &user.user_id, table, filter.as_ref()).await?;

    let source = match (&ctx.redis_pool, ctx.backend.change_feed()) {
        (Some(pool), _) => ChangeSource::Redis(pool.clone()),
        (None, Some(feed)) => ChangeSource::Feed(feed),
        (None, None) => {
            return Err(MarketError::InvalidState("no change stream is configured".to_string()).into())
        }
    };

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, user.user_id, table, filter, source)))
}

fn parse_subscription(params: &WsQuery) -> MarketResult<(Table, Option<ChangeFilter>)> {
    let table: Table = params
        .table
        .parse()
        .map_err(|_| MarketError::validation("table", format!("unknown table: {}", params.table)))?;
    let filter = match (&params.column, &params.value) {
        (Some(column), Some(value)) => Some(ChangeFilter::eq(column.as_str(), value.as_str())),
        (None, None) => None,
        _ => {
            return Err(MarketError::validation(
                "column",
                "column and value must be given together",
            ))
        }
    };
    Ok((table, filter))
}

/// A subscription must be narrowed to rows the user owns, or to a chat they
/// take part in.
pub async fn authorize_subscription(
    ctx: &MarketContext,
    user_id: &str,
    table: Table,
    filter: Option<&ChangeFilter>,
) -> MarketResult<()> {
    let filter = filter.ok_or_else(|| {
        MarketError::Forbidden(format!("subscriptions to {} must be filtered", table))
    })?;
    let column = filter.column.as_str();

    if OWNER_COLUMNS.contains(&column) || (table == Table::Profiles && column == "id") {
        if filter.value == user_id {
            return Ok(());
        }
        return Err(MarketError::Forbidden(format!(
            "cannot subscribe to another user's {}",
            table
        )));
    }

    if column == "chat_id" || (table == Table::Chats && column == "id") {
        // Fails for non-participants.
        ctx.backend.get_chat_by_id(user_id, &filter.value).await?;
        return Ok(());
    }

    Err(MarketError::Forbidden(format!(
        "cannot filter {} by {}",
        table, column
    )))
}

fn wants(table: Table, filter: Option<&ChangeFilter>, event: &ChangeEvent) -> bool {
    event.table == table && filter.map_or(true, |f| f.matches(event))
}

async fn handle_socket(
    socket: WebSocket,
    user_id: String,
    table: Table,
    filter: Option<ChangeFilter>,
    source: ChangeSource,
) {
    let connection_id = Uuid::new_v4().to_string();
    tracing::info!(
        "WebSocket {} opened by {} for {} changes",
        connection_id,
        user_id,
        table
    );

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        let result = match source {
            ChangeSource::Redis(pool) => {
                forward_from_stream(&pool, table, filter.as_ref(), &mut sender).await
            }
            ChangeSource::Feed(feed) => forward_from_feed(feed, table, filter.as_ref(), &mut sender).await,
        };
        if let Err(e) = result {
            tracing::debug!("Change forwarding stopped: {}", e);
        }
    });

    // Pings are answered by axum; only a close ends the session here.
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(WsMessage::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    tracing::info!("WebSocket {} closed for {}", connection_id, user_id);
}

/// Tails `STREAM:CHANGES:<table>` from the moment the socket opened.
async fn forward_from_stream(
    pool: &RedisPool,
    table: Table,
    filter: Option<&ChangeFilter>,
    sender: &mut SplitSink<WebSocket, WsMessage>,
) -> Result<()> {
    let stream_key = table.stream_key();
    let mut last_id = format!("{}-0", chrono::Utc::now().timestamp_millis());
    let opts = StreamReadOptions::default()
        .block(READ_BLOCK_MS)
        .count(READ_COUNT);

    let mut conn = get_connection(pool).await?;
    loop {
        let reply: Option<StreamReadReply> = match conn
            .xread_options(&[&stream_key], &[&last_id], &opts)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("Redis stream read error on {}: {}", stream_key, e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                conn = get_connection(pool).await?;
                continue;
            }
        };

        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                last_id = entry.id.clone();
                let Some(data) = entry.get::<String>("data") else {
                    continue;
                };
                let event: ChangeEvent = match serde_json::from_str(&data) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!("Skipping malformed stream entry {}: {}", entry.id, e);
                        continue;
                    }
                };
                if wants(table, filter, &event) {
                    sender.send(WsMessage::Text(data)).await?;
                }
            }
        }
    }
}

async fn forward_from_feed(
    mut feed: broadcast::Receiver<ChangeEvent>,
    table: Table,
    filter: Option<&ChangeFilter>,
    sender: &mut SplitSink<WebSocket, WsMessage>,
) -> Result<()> {
    loop {
        match feed.recv().await {
            Ok(event) => {
                if wants(table, filter, &event) {
                    sender.send(WsMessage::Text(serde_json::to_string(&event)?)).await?;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("WebSocket subscriber lagged, {} changes skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}
