//! PostgreSQL 存储实现 / PostgreSQL store implementation
//!
//! 每个作用域一张离线表；状态以 SMALLINT 序号保存，推进使用条件 UPDATE 作为按消息的串行化点。
//! One pending table per scope; statuses are stored as SMALLINT ranks and advanced with
//! conditional UPDATEs, which act as the per-message serialization point.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{info, warn};

use super::{DeliveryStore, StoreError, StoreResult};
use crate::domain::{DeliveryStatus, DmMessageMeta, Event, GroupMessageMeta, RoutingKey, Scope};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS dm_messages (
        message_id TEXT PRIMARY KEY,
        dm_chat_id TEXT NOT NULL,
        sender_id TEXT NOT NULL,
        recipient_id TEXT NOT NULL,
        status SMALLINT NOT NULL DEFAULT 0,
        delivered_at BIGINT,
        read_at BIGINT
    )",
    "CREATE TABLE IF NOT EXISTS group_messages (
        message_id TEXT PRIMARY KEY,
        group_id TEXT NOT NULL,
        sender_id TEXT NOT NULL,
        status SMALLINT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS group_message_acks (
        message_id TEXT NOT NULL REFERENCES group_messages(message_id),
        user_id TEXT NOT NULL,
        status SMALLINT NOT NULL,
        acked_at BIGINT NOT NULL,
        PRIMARY KEY (message_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS group_members (
        group_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        PRIMARY KEY (group_id, user_id)
    )",
];

/// PostgreSQL 存储 / PostgreSQL store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    /// `None` 表示不限 / `None` means unbounded
    max_pending_per_key: Option<i64>,
}

impl PgStore {
    /// 连接数据库 / Connect to the database
    pub async fn connect(database_url: &str, max_pending_per_key: Option<usize>) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        info!("🗄️  PostgreSQL 存储已连接 / PostgreSQL store connected");
        Ok(Self::from_pool(pool, max_pending_per_key))
    }

    pub fn from_pool(pool: PgPool, max_pending_per_key: Option<usize>) -> Self {
        Self {
            pool,
            max_pending_per_key: max_pending_per_key.map(|cap| i64::try_from(cap.max(1)).unwrap_or(i64::MAX)),
        }
    }

    /// 写入单聊消息记录 / Insert a DM message record
    pub async fn insert_dm_message(&self, meta: &DmMessageMeta) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO dm_messages (message_id, dm_chat_id, sender_id, recipient_id)
             VALUES ($1, $2, $3, $4) ON CONFLICT (message_id) DO NOTHING",
        )
        .bind(&meta.message_id)
        .bind(&meta.dm_chat_id)
        .bind(&meta.sender_id)
        .bind(&meta.recipient_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 写入群聊消息记录 / Insert a group message record
    pub async fn insert_group_message(&self, meta: &GroupMessageMeta) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO group_messages (message_id, group_id, sender_id)
             VALUES ($1, $2, $3) ON CONFLICT (message_id) DO NOTHING",
        )
        .bind(&meta.message_id)
        .bind(&meta.group_id)
        .bind(&meta.sender_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_group_member(&self, group_id: &str, user_id: &str) -> StoreResult<()> {
        sqlx::query("INSERT INTO group_members (group_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(group_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_group_member(&self, group_id: &str, user_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM group_members WHERE group_id = $1 AND user_id = $2")
            .bind(group_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// 建表（幂等）/ Create tables (idempotent)
    pub async fn migrate(&self) -> StoreResult<()> {
        for ddl in SCHEMA {
            sqlx::query(*ddl).execute(&self.pool).await?;
        }
        for scope in Scope::ALL {
            let table = scope.pending_table();
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id BIGSERIAL PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    chat_id TEXT,
                    payload TEXT NOT NULL,
                    created_at BIGINT NOT NULL
                )"
            ))
            .execute(&self.pool)
            .await?;
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {table}_target_idx ON {table} (user_id, chat_id, id)"
            ))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn status_of(&self, table: &str, message_id: &str) -> StoreResult<DeliveryStatus> {
        let row = sqlx::query(&format!("SELECT status FROM {table} WHERE message_id = $1"))
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", table, message_id)))?;
        let rank: i16 = row.try_get("status")?;
        DeliveryStatus::from_rank(rank)
            .ok_or_else(|| StoreError::Backend(format!("unknown status rank {}", rank)))
    }
}

#[async_trait]
impl DeliveryStore for PgStore {
    async fn enqueue_pending(&self, key: &RoutingKey, event: &Event) -> StoreResult<()> {
        let table = key.scope().pending_table();
        let payload = serde_json::to_string(event)?;
        sqlx::query(&format!(
            "INSERT INTO {table} (user_id, chat_id, payload, created_at) VALUES ($1, $2, $3, $4)"
        ))
        .bind(key.user_id())
        .bind(key.chat_id())
        .bind(payload)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        let Some(cap) = self.max_pending_per_key else {
            return Ok(());
        };
        let trimmed = sqlx::query(&format!(
            "DELETE FROM {table} WHERE id IN (
                SELECT id FROM {table}
                WHERE user_id = $1 AND chat_id IS NOT DISTINCT FROM $2
                ORDER BY id DESC OFFSET $3
            )"
        ))
        .bind(key.user_id())
        .bind(key.chat_id())
        .bind(cap)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if trimmed > 0 {
            warn!("⚠️  离线队列超限 / Pending quota exceeded for {}, trimmed {}", key, trimmed);
        }
        Ok(())
    }

    async fn drain_pending(&self, key: &RoutingKey) -> StoreResult<Vec<Event>> {
        let table = key.scope().pending_table();
        let rows = sqlx::query(&format!(
            "DELETE FROM {table} WHERE user_id = $1 AND chat_id IS NOT DISTINCT FROM $2 RETURNING id, payload"
        ))
        .bind(key.user_id())
        .bind(key.chat_id())
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let payload: String = row.try_get("payload")?;
            entries.push((id, serde_json::from_str::<Event>(&payload)?));
        }
        entries.sort_by_key(|(id, _)| *id);
        Ok(entries.into_iter().map(|(_, event)| event).collect())
    }

    async fn advance_dm_status(&self, message_id: &str, status: DeliveryStatus, at: i64) -> StoreResult<bool> {
        let affected = sqlx::query(
            "UPDATE dm_messages SET
                status = $2,
                delivered_at = COALESCE(delivered_at, CASE WHEN $2 >= 1 THEN $3 END),
                read_at = CASE WHEN $2 = 2 THEN $3 ELSE read_at END
             WHERE message_id = $1 AND status < $2",
        )
        .bind(message_id)
        .bind(status.rank())
        .bind(at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            // 区分“已在该状态”和“消息不存在” / distinguish "already there" from "missing"
            self.status_of("dm_messages", message_id).await?;
        }
        Ok(affected > 0)
    }

    async fn record_group_ack(
        &self,
        message_id: &str,
        recipient_id: &str,
        status: DeliveryStatus,
        at: i64,
        advance_to: Option<DeliveryStatus>,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT status FROM group_messages WHERE message_id = $1 FOR UPDATE")
            .bind(message_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("group message {}", message_id)))?;
        sqlx::query(
            "INSERT INTO group_message_acks (message_id, user_id, status, acked_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (message_id, user_id) DO UPDATE
             SET status = EXCLUDED.status, acked_at = EXCLUDED.acked_at
             WHERE group_message_acks.status < EXCLUDED.status",
        )
        .bind(message_id)
        .bind(recipient_id)
        .bind(status.rank())
        .bind(at)
        .execute(&mut *tx)
        .await?;

        let changed = match advance_to {
            Some(stage) => {
                sqlx::query("UPDATE group_messages SET status = $2 WHERE message_id = $1 AND status < $2")
                    .bind(message_id)
                    .bind(stage.rank())
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
                    > 0
            }
            None => false,
        };
        tx.commit().await?;
        Ok(changed)
    }

    async fn current_group_recipients(&self, group_id: &str, excluding_user_id: &str) -> StoreResult<HashSet<String>> {
        let rows = sqlx::query("SELECT user_id FROM group_members WHERE group_id = $1 AND user_id <> $2")
            .bind(group_id)
            .bind(excluding_user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("user_id").map_err(StoreError::from))
            .collect()
    }

    async fn advance_group_status(&self, message_id: &str, status: DeliveryStatus) -> StoreResult<bool> {
        let affected = sqlx::query("UPDATE group_messages SET status = $2 WHERE message_id = $1 AND status < $2")
            .bind(message_id)
            .bind(status.rank())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            self.status_of("group_messages", message_id).await?;
        }
        Ok(affected > 0)
    }

    async fn group_acks(&self, message_id: &str, status: DeliveryStatus) -> StoreResult<HashSet<String>> {
        let rows = sqlx::query("SELECT user_id FROM group_message_acks WHERE message_id = $1 AND status >= $2")
            .bind(message_id)
            .bind(status.rank())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("user_id").map_err(StoreError::from))
            .collect()
    }

    async fn dm_message(&self, message_id: &str) -> StoreResult<DmMessageMeta> {
        let row = sqlx::query(
            "SELECT message_id, dm_chat_id, sender_id, recipient_id FROM dm_messages WHERE message_id = $1",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("dm message {}", message_id)))?;
        Ok(DmMessageMeta {
            message_id: row.try_get("message_id")?,
            dm_chat_id: row.try_get("dm_chat_id")?,
            sender_id: row.try_get("sender_id")?,
            recipient_id: row.try_get("recipient_id")?,
        })
    }

    async fn group_message(&self, message_id: &str) -> StoreResult<GroupMessageMeta> {
        let row = sqlx::query("SELECT message_id, group_id, sender_id FROM group_messages WHERE message_id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("group message {}", message_id)))?;
        Ok(GroupMessageMeta {
            message_id: row.try_get("message_id")?,
            group_id: row.try_get("group_id")?,
            sender_id: row.try_get("sender_id")?,
        })
    }

    async fn dm_status(&self, message_id: &str) -> StoreResult<DeliveryStatus> {
        self.status_of("dm_messages", message_id).await
    }

    async fn group_status(&self, message_id: &str) -> StoreResult<DeliveryStatus> {
        self.status_of("group_messages", message_id).await
    }
}
