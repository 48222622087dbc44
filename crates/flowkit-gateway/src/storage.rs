//! Builds the three storage adapters from [`EngineConfig`], matching
//! whichever backend each interface was independently configured for.

use std::sync::Arc;

use anyhow::{Context, Result};
use flowkit_core::config::{EngineConfig, StorageAdapter, StreamAdapter};
use flowkit_storage::{
    FileQueue, FileStore, InMemoryQueue, InMemoryStore, InMemoryTopicBus, PostgresQueue, PostgresStore, PostgresTopicBus, Queue, Store, TopicBus,
};
use sqlx::postgres::PgPoolOptions;

pub struct Storage {
    pub queue: Arc<dyn Queue>,
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn TopicBus>,
}

pub async fn build(config: &EngineConfig) -> Result<Storage> {
    let pool = if needs_postgres(config) {
        let url = config.connections.postgres_url.as_deref().context("DATABASE_URL required for a relational adapter")?;
        Some(PgPoolOptions::new().max_connections(10).connect(url).await.context("failed to connect to Postgres")?)
    } else {
        None
    };

    let queue: Arc<dyn Queue> = match config.queue_adapter {
        StorageAdapter::Memory => Arc::new(InMemoryQueue::new()),
        StorageAdapter::File => {
            let dir = config.connections.file_dir.as_deref().unwrap_or("./data");
            tokio::fs::create_dir_all(dir).await.ok();
            Arc::new(FileQueue::open(format!("{dir}/{}.queue.json", config.queue_prefix)).await)
        }
        StorageAdapter::Relational => Arc::new(PostgresQueue::new(pool.clone().expect("validated above"), config.queue_prefix.clone())),
    };

    let store: Arc<dyn Store> = match config.store_adapter {
        StorageAdapter::Memory => Arc::new(InMemoryStore::new()),
        StorageAdapter::File => {
            let dir = config.connections.file_dir.as_deref().unwrap_or("./data");
            tokio::fs::create_dir_all(dir).await.ok();
            Arc::new(FileStore::open(format!("{dir}/{}.store.json", config.store_prefix)).await)
        }
        StorageAdapter::Relational => Arc::new(PostgresStore::new(pool.clone().expect("validated above"), config.store_prefix.clone())),
    };

    let bus: Arc<dyn TopicBus> = match config.stream_adapter {
        StreamAdapter::Memory => Arc::new(InMemoryTopicBus::new()),
        StreamAdapter::Relational => Arc::new(PostgresTopicBus::new(pool.expect("validated above"))),
    };

    Ok(Storage { queue, store, bus })
}

fn needs_postgres(config: &EngineConfig) -> bool {
    matches!(config.queue_adapter, StorageAdapter::Relational)
        || matches!(config.store_adapter, StorageAdapter::Relational)
        || matches!(config.stream_adapter, StreamAdapter::Relational)
}
