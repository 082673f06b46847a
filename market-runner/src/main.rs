use anyhow::Result;
use market_api::run as run_api;
use market_core::{Config, MarketContext};
use market_outbox::run as run_outbox;
use market_realtime::run as run_realtime;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting lead marketplace server");

    let config = Config::from_env();
    let ctx = MarketContext::new(config).await?;

    if ctx.is_in_memory() {
        tracing::warn!("In-memory backend: data is lost on exit and the outbox pipeline is off");
    } else {
        let ctx_clone = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_outbox(ctx_clone).await {
                tracing::error!("Outbox poller error: {}", e);
            }
        });

        let ctx_clone = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_realtime(ctx_clone).await {
                tracing::error!("Realtime consumer error: {}", e);
            }
        });
    }

    tokio::select! {
        result = run_api(ctx) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }

    Ok(())
}
