use std::sync::Arc;

use crate::backend::MarketBackend;
use crate::config::{BackendKind, Config};
use crate::db::{create_pool as create_db_pool, run_migrations, DbPool};
use crate::memory::MemoryBackend;
use crate::pg::PgBackend;
use crate::redis::{create_pool as create_redis_pool, RedisPool};
use crate::redpanda::{create_consumer, create_producer, RedpandaConsumer, RedpandaProducer};

/// Shared handles for every service in the process.
///
/// The Postgres backend brings Redis and Redpanda with it. The in-memory
/// backend runs without any external service and publishes changes through
/// [`MarketBackend::change_feed`] instead.
#[derive(Clone)]
pub struct MarketContext {
    pub config: Arc<Config>,
    pub backend: Arc<dyn MarketBackend>,
    pub db_pool: Option<Arc<DbPool>>,
    pub redis_pool: Option<RedisPool>,
    pub redpanda_producer: Option<RedpandaProducer>,
}

impl MarketContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        match config.database.backend {
            BackendKind::Memory => {
                tracing::info!("Using in-memory market backend");
                Ok(Self::with_backend(config, Arc::new(MemoryBackend::new())))
            }
            BackendKind::Postgres => {
                let db_pool = create_db_pool(&config.database).await?;
                if config.database.run_migrations {
                    run_migrations(&config.database.url).await?;
                }
                let redis_pool = create_redis_pool(&config.redis).await?;
                let redpanda_producer = create_producer(&config.redpanda)?;
                let backend = PgBackend::new(db_pool.clone(), config.server.encryption_key.clone());

                Ok(MarketContext {
                    config: Arc::new(config),
                    backend: Arc::new(backend),
                    db_pool: Some(db_pool),
                    redis_pool: Some(redis_pool),
                    redpanda_producer: Some(redpanda_producer),
                })
            }
        }
    }

    pub fn with_backend(config: Config, backend: Arc<dyn MarketBackend>) -> Self {
        MarketContext {
            config: Arc::new(config),
            backend,
            db_pool: None,
            redis_pool: None,
            redpanda_producer: None,
        }
    }

    pub fn create_consumer(&self, group_id: Option<&str>) -> anyhow::Result<RedpandaConsumer> {
        create_consumer(&self.config.redpanda, group_id)
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_pool.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_context_has_no_external_services() {
        let ctx = MarketContext::new(Config::in_memory()).await.unwrap();
        assert!(ctx.is_in_memory());
        assert!(ctx.redis_pool.is_none());
        assert!(ctx.redpanda_producer.is_none());
        assert!(ctx.backend.change_feed().is_some());
    }
}
