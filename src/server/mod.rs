use std::sync::Arc;

use crate::config::{AppConfig, DeliveryConfig};
use crate::service::{AckAggregator, DeliveryBroker, Notifier, TopicSet};
use crate::storage::{DeliveryStore, MemoryStore};

/// 投递服务全局状态 / Delivery server global state
///
/// 每个进程构建一次，按引用传给生产者与连接处理器。
/// Built once per process and handed by reference to producers and connection handlers.
#[derive(Clone)]
pub struct DeliveryServer {
    pub store: Arc<dyn DeliveryStore>,          // 持久化协作方 / Durable collaborator
    pub topics: Arc<TopicSet>,                  // 三个作用域主题 / Per-scope topics
    pub broker: DeliveryBroker,                 // 投递代理 / Delivery broker
    pub aggregator: Arc<AckAggregator>,         // 回执聚合 / Ack aggregator
    pub notifier: Notifier,                     // 生产者通知 / Producer notifications
    pub config: Arc<AppConfig>,                 // 配置快照 / Config snapshot
}

impl DeliveryServer {
    pub fn new(store: Arc<dyn DeliveryStore>, config: AppConfig) -> Self {
        let DeliveryConfig { mailbox_capacity, max_inflight_publishes, .. } = config.delivery;
        let topics = Arc::new(TopicSet::new(store.clone(), mailbox_capacity));
        let broker = DeliveryBroker::new(topics.clone(), max_inflight_publishes);
        let aggregator = Arc::new(AckAggregator::new(store.clone(), broker.clone()));
        let notifier = Notifier::new(broker.clone());
        Self { store, topics, broker, aggregator, notifier, config: Arc::new(config) }
    }

    /// 使用内存存储构建 / Build with the in-memory store
    pub fn in_memory(config: AppConfig) -> (Arc<MemoryStore>, Self) {
        let store = Arc::new(match config.delivery.max_pending_per_key {
            Some(cap) => MemoryStore::with_pending_quota(cap),
            None => MemoryStore::new(),
        });
        let server = Self::new(store.clone(), config);
        (store, server)
    }

    /// 根据配置选择存储后端 / Pick the storage backend from config
    pub async fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        use crate::config::StorageBackend;
        match config.storage.backend {
            StorageBackend::Memory => Ok(Self::in_memory(config).1),
            #[cfg(feature = "postgres")]
            StorageBackend::Postgres => {
                let url = config
                    .storage
                    .database_url
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("storage.database_url is not set"))?;
                let store = crate::storage::PgStore::connect(&url, config.delivery.max_pending_per_key).await?;
                store.migrate().await?;
                Ok(Self::new(Arc::new(store), config))
            }
            #[cfg(not(feature = "postgres"))]
            StorageBackend::Postgres => Err(anyhow::anyhow!(
                "postgres backend requested but the `postgres` feature is not enabled"
            )),
        }
    }
}
