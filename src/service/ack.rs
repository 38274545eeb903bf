//! 回执聚合 / Acknowledgement aggregation
//!
//! 单聊：接收者的回执直接推进消息状态，只有状态真正改变时才通知发送者。
//! 群聊：每个成员独立回执，只有当前全部接收者（当前成员去掉发送者）都回执到某阶段或之后，
//! 聚合状态才推进到该阶段并通知发送者。成员集合按回执时刻计算，已退群成员不会阻塞收敛。
//!
//! DM: the recipient's acknowledgement advances the stored status directly and the sender
//! is notified only when the status really changed.
//! Group: members acknowledge independently; the aggregate advances to a stage only
//! once every current recipient (current members minus the sender) acknowledged that
//! stage or later, and only then is the sender notified. Membership is evaluated at
//! acknowledgement time, so members who left never block convergence.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use super::broker::DeliveryBroker;
use super::keyed_lock::KeyedLock;
use crate::domain::{AckOutcome, AckRequest, DeliveryStatus, Event, GroupMessageMeta, RoutingKey};
use crate::error::{DeliveryError, Result};
use crate::storage::DeliveryStore;

/// 可聚合的阶段，从高到低 / Aggregatable stages, highest first
const STAGES_DESC: [DeliveryStatus; 2] = [DeliveryStatus::Read, DeliveryStatus::Delivered];

pub struct AckAggregator {
    store: Arc<dyn DeliveryStore>,
    broker: DeliveryBroker,
    locks: KeyedLock,
}

impl AckAggregator {
    pub fn new(store: Arc<dyn DeliveryStore>, broker: DeliveryBroker) -> Self {
        Self { store, broker, locks: KeyedLock::new() }
    }

    /// 单聊回执 / Direct message acknowledgement
    pub async fn ack_dm(&self, req: &AckRequest) -> Result<AckOutcome> {
        let meta = self.store.dm_message(&req.message_id).await?;
        if meta.recipient_id != req.actor_user_id {
            return Err(DeliveryError::NotRecipient {
                message_id: req.message_id.clone(),
                actor: req.actor_user_id.clone(),
            });
        }

        let changed = self.store.advance_dm_status(&req.message_id, req.status, req.at).await?;
        if !changed {
            let status = self.store.dm_status(&req.message_id).await?;
            debug!("dm ack {} {} from {} is a no-op (stored {})", req.message_id, req.status, req.actor_user_id, status);
            return Ok(AckOutcome { status, changed: false, should_broadcast: false });
        }

        info!("✅ 单聊状态推进 / DM {} -> {}", req.message_id, req.status);
        self.broker.publish(
            RoutingKey::presence(&meta.sender_id),
            Event::dm_status_changed(&meta.message_id, &meta.dm_chat_id, req.status),
        );
        Ok(AckOutcome { status: req.status, changed: true, should_broadcast: true })
    }

    /// 群聊回执 / Group message acknowledgement
    ///
    /// 先读取成员与回执并在内存中加入本次回执计算收敛阶段，最后一次原子写入回执与推进；
    /// 任何存储错误都不会留下部分状态。
    /// Reads membership and acks first, computes convergence with this ack folded in,
    /// then writes the ack and the advance in one atomic store call, so a store error
    /// leaves nothing behind.
    pub async fn ack_group(&self, req: &AckRequest) -> Result<AckOutcome> {
        let meta = self.store.group_message(&req.message_id).await?;
        let guard = self.locks.lock(&req.message_id).await;

        let convergence = self
            .converge_target(&meta, req.status, Some((req.actor_user_id.as_str(), req.status)))
            .await?;
        let changed = self
            .store
            .record_group_ack(&req.message_id, &req.actor_user_id, req.status, req.at, convergence.target)
            .await?;
        drop(guard);

        if let Some(stage) = convergence.target.filter(|_| changed) {
            self.broadcast_group(&meta, stage);
        }
        Ok(AckOutcome { status: convergence.visible(), changed, should_broadcast: changed })
    }

    /// 成员变更后重新计算聚合状态 / Recompute the aggregate after a membership change
    ///
    /// 供群成员管理方在成员退群后调用，覆盖最后一个未回执的成员退群、且之后再无回执到达的情况。
    /// Meant for the membership owner to call after a member leaves; covers the last
    /// unacknowledged member leaving with no later acknowledgement arriving.
    pub async fn reconcile_group(&self, message_id: &str) -> Result<AckOutcome> {
        let meta = self.store.group_message(message_id).await?;
        let guard = self.locks.lock(message_id).await;
        let convergence = self.converge_target(&meta, DeliveryStatus::Read, None).await?;
        let changed = match convergence.target {
            Some(stage) => self.store.advance_group_status(message_id, stage).await?,
            None => false,
        };
        drop(guard);

        if let Some(stage) = convergence.target.filter(|_| changed) {
            self.broadcast_group(&meta, stage);
        }
        Ok(AckOutcome { status: convergence.visible(), changed, should_broadcast: changed })
    }

    /// 在不高于 `ceiling` 且高于当前聚合状态的阶段中，找到全体当前接收者都已回执的最高阶段
    /// Find the highest stage not above `ceiling`, and above the stored aggregate, that
    /// every current recipient acknowledged. `pending_ack` is an ack not yet written.
    /// No current recipients means nothing to converge on.
    async fn converge_target(
        &self,
        meta: &GroupMessageMeta,
        ceiling: DeliveryStatus,
        pending_ack: Option<(&str, DeliveryStatus)>,
    ) -> Result<Convergence> {
        let recipients = self
            .store
            .current_group_recipients(&meta.group_id, &meta.sender_id)
            .await?;
        let current = self.store.group_status(&meta.message_id).await?;
        if recipients.is_empty() {
            debug!("group {} message {}: no current recipients", meta.group_id, meta.message_id);
            return Ok(Convergence { current, target: None });
        }

        for stage in STAGES_DESC.into_iter().filter(|s| *s <= ceiling && *s > current) {
            let mut acked = self.store.group_acks(&meta.message_id, stage).await?;
            if let Some((actor, status)) = pending_ack {
                if status >= stage {
                    acked.insert(actor.to_string());
                }
            }
            if all_acknowledged(&recipients, &acked) {
                debug!(
                    "group {} message {}: all {} recipients at {}",
                    meta.group_id,
                    meta.message_id,
                    recipients.len(),
                    stage
                );
                return Ok(Convergence { current, target: Some(stage) });
            }
        }
        Ok(Convergence { current, target: None })
    }

    fn broadcast_group(&self, meta: &GroupMessageMeta, stage: DeliveryStatus) {
        info!("✅ 群聊聚合状态推进 / Group {} message {} -> {}", meta.group_id, meta.message_id, stage);
        self.broker.publish(
            RoutingKey::presence(&meta.sender_id),
            Event::group_status_changed(&meta.message_id, &meta.group_id, stage),
        );
    }
}

/// 收敛计算结果 / Convergence result
struct Convergence {
    /// 读取时的聚合状态 / Aggregate status when read
    current: DeliveryStatus,
    /// 可推进到的阶段 / Stage to advance to
    target: Option<DeliveryStatus>,
}

impl Convergence {
    /// 写入后对外可见的状态；条件写入失败时存储已不低于目标
    /// Externally visible status after the write; a lost compare-and-set means the
    /// store already holds at least the target.
    fn visible(&self) -> DeliveryStatus {
        self.target.map_or(self.current, |stage| stage.max(self.current))
    }
}

/// 当前接收者是否都已回执 / Whether every current recipient acknowledged
fn all_acknowledged(recipients: &HashSet<String>, acked: &HashSet<String>) -> bool {
    recipients.is_subset(acked)
}
