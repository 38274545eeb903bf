//! 内存存储实现 / In-memory store implementation
//!
//! 单进程部署和测试使用；所有操作在同一把锁内完成，`advance_*` 即为比较并设置。
//! Used for single-process deployments and tests; every operation runs under one
//! lock, so the `advance_*` calls are compare-and-set.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{DeliveryStore, StoreError, StoreResult};
use crate::domain::{DeliveryStatus, DmMessageMeta, Event, GroupMessageMeta, PendingEntry, RoutingKey, Scope};

struct DmRecord {
    meta: DmMessageMeta,
    status: DeliveryStatus,
    delivered_at: Option<i64>,
    read_at: Option<i64>,
}

struct GroupRecord {
    meta: GroupMessageMeta,
    status: DeliveryStatus,
    /// 成员 -> (最高回执阶段, 时间) / member -> (highest acknowledged stage, at)
    acks: HashMap<String, (DeliveryStatus, i64)>,
}

#[derive(Default)]
struct Inner {
    next_pending_id: u64,
    pending: HashMap<Scope, HashMap<RoutingKey, VecDeque<PendingEntry>>>,
    dm_messages: HashMap<String, DmRecord>,
    group_messages: HashMap<String, GroupRecord>,
    group_members: HashMap<String, BTreeSet<String>>,
}

/// 内存存储 / In-memory store
pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// `None` 表示不限 / `None` means unbounded
    max_pending_per_key: Option<usize>,
    failures: Mutex<HashSet<&'static str>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// 离线队列不限长度，只有被取出才会删除 / Pending entries are removed only by draining
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_pending_per_key: None,
            failures: Mutex::new(HashSet::new()),
        }
    }

    /// 带离线配额：超出时丢弃最旧事件 / With a pending cap; the oldest entries beyond it are dropped
    pub fn with_pending_quota(max_pending_per_key: usize) -> Self {
        Self { max_pending_per_key: Some(max_pending_per_key.max(1)), ..Self::new() }
    }

    pub fn insert_dm_message(&self, meta: DmMessageMeta) {
        let mut inner = self.inner.lock();
        inner.dm_messages.insert(
            meta.message_id.clone(),
            DmRecord { meta, status: DeliveryStatus::Sent, delivered_at: None, read_at: None },
        );
    }

    pub fn insert_group_message(&self, meta: GroupMessageMeta) {
        let mut inner = self.inner.lock();
        inner.group_messages.insert(
            meta.message_id.clone(),
            GroupRecord { meta, status: DeliveryStatus::Sent, acks: HashMap::new() },
        );
    }

    pub fn set_group_members<I, S>(&self, group_id: &str, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set = members.into_iter().map(Into::into).collect();
        self.inner.lock().group_members.insert(group_id.to_string(), set);
    }

    pub fn add_group_member(&self, group_id: &str, user_id: &str) {
        self.inner
            .lock()
            .group_members
            .entry(group_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    pub fn remove_group_member(&self, group_id: &str, user_id: &str) {
        if let Some(members) = self.inner.lock().group_members.get_mut(group_id) {
            members.remove(user_id);
        }
    }

    /// 离线队列长度 / Pending queue length
    pub fn pending_len(&self, key: &RoutingKey) -> usize {
        self.inner
            .lock()
            .pending
            .get(&key.scope())
            .and_then(|table| table.get(key))
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// 单聊送达/已读时间 / DM delivered and read timestamps
    pub fn dm_receipt_times(&self, message_id: &str) -> Option<(Option<i64>, Option<i64>)> {
        self.inner
            .lock()
            .dm_messages
            .get(message_id)
            .map(|r| (r.delivered_at, r.read_at))
    }

    /// 让下一次指定操作返回不可用 / Make the next call of `op` fail as unavailable
    pub fn fail_next(&self, op: &'static str) {
        self.failures.lock().insert(op);
    }

    fn check(&self, op: &'static str) -> StoreResult<()> {
        if self.failures.lock().remove(op) {
            return Err(StoreError::Unavailable(format!("injected failure on {}", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn enqueue_pending(&self, key: &RoutingKey, event: &Event) -> StoreResult<()> {
        self.check("enqueue_pending")?;
        let mut inner = self.inner.lock();
        inner.next_pending_id += 1;
        let entry = PendingEntry {
            id: inner.next_pending_id,
            key: key.clone(),
            event: event.clone(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        let queue = inner
            .pending
            .entry(key.scope())
            .or_default()
            .entry(key.clone())
            .or_default();
        queue.push_back(entry);
        if let Some(cap) = self.max_pending_per_key.filter(|cap| queue.len() > *cap) {
            let overflow = queue.len() - cap;
            queue.drain(..overflow);
            warn!("⚠️  离线队列超限，丢弃最旧 {} 条 / Pending quota exceeded for {}, trimmed {}", overflow, key, overflow);
        }
        Ok(())
    }

    async fn drain_pending(&self, key: &RoutingKey) -> StoreResult<Vec<Event>> {
        self.check("drain_pending")?;
        let mut inner = self.inner.lock();
        let drained: Vec<Event> = inner
            .pending
            .get_mut(&key.scope())
            .and_then(|table| table.remove(key))
            .map(|q| q.into_iter().map(|entry| entry.event).collect())
            .unwrap_or_default();
        Ok(drained)
    }

    async fn advance_dm_status(&self, message_id: &str, status: DeliveryStatus, at: i64) -> StoreResult<bool> {
        self.check("advance_dm_status")?;
        let mut inner = self.inner.lock();
        let record = inner
            .dm_messages
            .get_mut(message_id)
            .ok_or_else(|| StoreError::NotFound(format!("dm message {}", message_id)))?;
        if record.status >= status {
            return Ok(false);
        }
        record.status = status;
        if status >= DeliveryStatus::Delivered && record.delivered_at.is_none() {
            record.delivered_at = Some(at);
        }
        if status == DeliveryStatus::Read {
            record.read_at = Some(at);
        }
        debug!("dm message {} advanced to {}", message_id, status);
        Ok(true)
    }

    async fn record_group_ack(
        &self,
        message_id: &str,
        recipient_id: &str,
        status: DeliveryStatus,
        at: i64,
        advance_to: Option<DeliveryStatus>,
    ) -> StoreResult<bool> {
        self.check("record_group_ack")?;
        let mut inner = self.inner.lock();
        let record = inner
            .group_messages
            .get_mut(message_id)
            .ok_or_else(|| StoreError::NotFound(format!("group message {}", message_id)))?;
        let slot = record
            .acks
            .entry(recipient_id.to_string())
            .or_insert((status, at));
        if status > slot.0 {
            *slot = (status, at);
        }
        match advance_to {
            Some(stage) if record.status < stage => {
                record.status = stage;
                debug!("group message {} advanced to {}", message_id, stage);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current_group_recipients(&self, group_id: &str, excluding_user_id: &str) -> StoreResult<HashSet<String>> {
        self.check("current_group_recipients")?;
        let inner = self.inner.lock();
        Ok(inner
            .group_members
            .get(group_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| m.as_str() != excluding_user_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn advance_group_status(&self, message_id: &str, status: DeliveryStatus) -> StoreResult<bool> {
        self.check("advance_group_status")?;
        let mut inner = self.inner.lock();
        let record = inner
            .group_messages
            .get_mut(message_id)
            .ok_or_else(|| StoreError::NotFound(format!("group message {}", message_id)))?;
        if record.status >= status {
            return Ok(false);
        }
        record.status = status;
        Ok(true)
    }

    async fn group_acks(&self, message_id: &str, status: DeliveryStatus) -> StoreResult<HashSet<String>> {
        self.check("group_acks")?;
        let inner = self.inner.lock();
        let record = inner
            .group_messages
            .get(message_id)
            .ok_or_else(|| StoreError::NotFound(format!("group message {}", message_id)))?;
        Ok(record
            .acks
            .iter()
            .filter(|(_, (acked, _))| *acked >= status)
            .map(|(user, _)| user.clone())
            .collect())
    }

    async fn dm_message(&self, message_id: &str) -> StoreResult<DmMessageMeta> {
        self.check("dm_message")?;
        self.inner
            .lock()
            .dm_messages
            .get(message_id)
            .map(|r| r.meta.clone())
            .ok_or_else(|| StoreError::NotFound(format!("dm message {}", message_id)))
    }

    async fn group_message(&self, message_id: &str) -> StoreResult<GroupMessageMeta> {
        self.check("group_message")?;
        self.inner
            .lock()
            .group_messages
            .get(message_id)
            .map(|r| r.meta.clone())
            .ok_or_else(|| StoreError::NotFound(format!("group message {}", message_id)))
    }

    async fn dm_status(&self, message_id: &str) -> StoreResult<DeliveryStatus> {
        self.inner
            .lock()
            .dm_messages
            .get(message_id)
            .map(|r| r.status)
            .ok_or_else(|| StoreError::NotFound(format!("dm message {}", message_id)))
    }

    async fn group_status(&self, message_id: &str) -> StoreResult<DeliveryStatus> {
        self.inner
            .lock()
            .group_messages
            .get(message_id)
            .map(|r| r.status)
            .ok_or_else(|| StoreError::NotFound(format!("group message {}", message_id)))
    }
}
