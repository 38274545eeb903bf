use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, warn};

use super::topic::{SendOutcome, TopicSet};
use crate::domain::{Event, RoutingKey};
use crate::error::{describe_error, Result};

/// 待持久化的事件及其完成通知 / An event awaiting persistence plus its completion signal
type PersistJob = (Event, oneshot::Sender<()>);

/// 发布句柄；await 时等待事件推送或落盘完成（失败只记录日志）
/// Publish handle; awaiting it waits until the event was pushed or persisted
/// (failures are logged only). Dropping it never cancels the publish.
pub struct PublishHandle {
    persisted: Option<oneshot::Receiver<()>>,
}

impl PublishHandle {
    fn settled() -> Self {
        Self { persisted: None }
    }

    /// 是否已同步完成（在线推送或被拒绝）/ Whether the publish already finished inline
    pub fn is_settled(&self) -> bool {
        self.persisted.is_none()
    }
}

impl IntoFuture for PublishHandle {
    type Output = ();
    type IntoFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            if let Some(persisted) = self.persisted {
                let _ = persisted.await;
            }
        })
    }
}

/// 投递代理：生产者的唯一入口 / Delivery broker: the single entry point for producers
///
/// `publish` 在调用方同步完成在线推送，保证同一路由键按发布顺序到达；离线兜底按路由键
/// 串行写入后台队列，失败只记录日志，不回传给原请求。
/// `publish` pushes to a live mailbox inline, so events for one key arrive in publish
/// order. The offline fallback runs in a per-key background lane that persists in
/// publish order; failures are logged, never surfaced to the originating request.
#[derive(Clone)]
pub struct DeliveryBroker {
    topics: Arc<TopicSet>,
    inflight: Arc<Semaphore>,
    lanes: Arc<DashMap<RoutingKey, mpsc::UnboundedSender<PersistJob>>>,
}

impl DeliveryBroker {
    pub fn new(topics: Arc<TopicSet>, max_inflight: usize) -> Self {
        Self {
            topics,
            inflight: Arc::new(Semaphore::new(max_inflight.max(1))),
            lanes: Arc::new(DashMap::new()),
        }
    }

    pub fn topics(&self) -> &Arc<TopicSet> {
        &self.topics
    }

    /// 发布事件（fire-and-forget）/ Publish an event, fire-and-forget
    pub fn publish(&self, key: RoutingKey, event: Event) -> PublishHandle {
        let event = match self.topics.for_key(&key).deliver_live(&key, event) {
            Ok(None) => return PublishHandle::settled(),
            Ok(Some(event)) => event,
            Err(e) => {
                error!("❌ 投递失败 / Delivery to {} failed: {}", key, describe_error(&e));
                return PublishHandle::settled();
            }
        };
        let (done, persisted) = oneshot::channel();
        self.persist_in_order(key, (event, done));
        PublishHandle { persisted: Some(persisted) }
    }

    /// 解析原始路由键后发布 / Parse a raw routing key, then publish
    pub fn publish_str(&self, raw_key: &str, event: Event) -> Result<PublishHandle> {
        let key: RoutingKey = raw_key.parse()?;
        Ok(self.publish(key, event))
    }

    /// 同步发送并返回结果 / Send inline and return the outcome
    pub async fn dispatch(&self, key: &RoutingKey, event: Event) -> Result<SendOutcome> {
        self.topics.for_key(key).send(key, event).await
    }

    /// 扇出到多个路由键 / Fan out one event to several keys
    pub fn fan_out<I>(&self, keys: I, event: &Event) -> Vec<PublishHandle>
    where
        I: IntoIterator<Item = RoutingKey>,
    {
        keys.into_iter().map(|key| self.publish(key, event.clone())).collect()
    }

    /// 当前活跃的离线写入队列数 / Number of active persist lanes
    pub fn pending_lanes(&self) -> usize {
        self.lanes.len()
    }

    fn persist_in_order(&self, key: RoutingKey, job: PersistJob) {
        let lane = self
            .lanes
            .entry(key.clone())
            .or_insert_with(|| self.spawn_lane(key.clone()));
        if let Err(e) = lane.send(job) {
            warn!("⚠️  离线写入队列已关闭 / Persist lane for {} closed, dropping {}", key, e.0 .0.event);
        }
    }

    /// 每个路由键一个后台写入任务，空闲后自行退出
    /// One background writer per routing key; it exits once idle.
    fn spawn_lane(&self, key: RoutingKey) -> mpsc::UnboundedSender<PersistJob> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistJob>();
        let broker = self.clone();
        tokio::spawn(async move {
            loop {
                while let Ok((event, done)) = rx.try_recv() {
                    broker.persist(&key, event).await;
                    let _ = done.send(());
                }
                // 检查与移除在同一分片锁内，发布方不会再向已移除的队列写入
                // check-and-remove runs under the shard lock, so no publisher can
                // send to a lane after it was removed
                if broker.lanes.remove_if(&key, |_, _| rx.is_empty()).is_some() {
                    break;
                }
            }
        });
        tx
    }

    async fn persist(&self, key: &RoutingKey, event: Event) {
        let _permit = match self.inflight.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("⚠️  投递代理已关闭 / Broker closed, dropping {} for {}", event.event, key);
                return;
            }
        };
        match self.topics.for_key(key).persist(key, &event).await {
            Ok(()) => debug!("📨 {} -> {} (queued)", event.event, key),
            Err(e) => error!("❌ 投递失败 / Delivery of {} to {} failed: {}", event.event, key, describe_error(&e)),
        }
    }
}
