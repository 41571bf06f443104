//! PostgreSQL store.
//!
//! Steps are denormalized into the resolution row as a sealed JSON document;
//! the per-resolution single-writer lock is a claim pair
//! (`lock_uuid`, `lock_expires_at`) on the same row, so a dead owner's claim
//! simply expires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use super::crypto::Keyring;
use super::{RunnableResolution, StateCount, Store, StoreError, StoreResult};
use crate::resolution::{Resolution, ResolutionState};
use crate::step::Step;
use crate::task::{Batch, Task};

pub struct PgStore {
    pool: PgPool,
    keyring: Arc<Keyring>,
}

fn parse_state<T: serde::de::DeserializeOwned>(raw: &str) -> StoreResult<T> {
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|_| StoreError::Message(format!("unknown state {raw:?}")))
}

fn string_list(value: Value) -> Vec<String> {
    serde_json::from_value(value).unwrap_or_default()
}

impl PgStore {
    pub fn new(pool: PgPool, keyring: Keyring) -> Self {
        Self {
            pool,
            keyring: Arc::new(keyring),
        }
    }

    pub async fn connect(database_url: &str, keyring: Keyring) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, keyring))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the schema when it does not exist. Production deployments run
    /// managed migrations instead; this keeps tests and local runs hermetic.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS batch (
                id UUID PRIMARY KEY,
                created_at TIMESTAMPTZ NOT NULL
            );
            CREATE TABLE IF NOT EXISTS task (
                id UUID PRIMARY KEY,
                template_name TEXT NOT NULL,
                title TEXT NOT NULL,
                requester_username TEXT NOT NULL,
                watcher_usernames JSONB NOT NULL DEFAULT '[]',
                watcher_groups JSONB NOT NULL DEFAULT '[]',
                resolver_usernames JSONB NOT NULL DEFAULT '[]',
                resolver_groups JSONB NOT NULL DEFAULT '[]',
                input_sealed TEXT NOT NULL,
                tags JSONB NOT NULL DEFAULT '{}',
                batch_id UUID,
                resolution_id UUID,
                state TEXT NOT NULL,
                result JSONB,
                key_version INT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS task_state_idx ON task (state);
            CREATE INDEX IF NOT EXISTS task_template_idx ON task (template_name);
            CREATE INDEX IF NOT EXISTS task_tags_idx ON task USING gin (tags);
            CREATE TABLE IF NOT EXISTS resolution (
                id UUID PRIMARY KEY,
                task_id UUID NOT NULL REFERENCES task (id) ON DELETE CASCADE,
                state TEXT NOT NULL,
                steps_sealed TEXT NOT NULL,
                resolver_username TEXT,
                resolver_input_sealed TEXT NOT NULL,
                key_version INT NOT NULL DEFAULT 0,
                last_start TIMESTAMPTZ,
                next_retry TIMESTAMPTZ,
                run_count INT NOT NULL DEFAULT 0,
                steps_pass INT NOT NULL DEFAULT 0,
                lock_uuid UUID,
                lock_expires_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS resolution_state_idx ON resolution (state);
            CREATE INDEX IF NOT EXISTS resolution_next_retry_idx ON resolution (next_retry);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn task_from_row(&self, row: &sqlx::postgres::PgRow) -> StoreResult<Task> {
        let state: String = row.try_get("state")?;
        let input_sealed: String = row.try_get("input_sealed")?;
        let tags: Value = row.try_get("tags")?;
        Ok(Task {
            id: row.try_get("id")?,
            template_name: row.try_get("template_name")?,
            title: row.try_get("title")?,
            requester_username: row.try_get("requester_username")?,
            watcher_usernames: string_list(row.try_get("watcher_usernames")?),
            watcher_groups: string_list(row.try_get("watcher_groups")?),
            resolver_usernames: string_list(row.try_get("resolver_usernames")?),
            resolver_groups: string_list(row.try_get("resolver_groups")?),
            input: self.keyring.open_value(&input_sealed)?,
            tags: serde_json::from_value(tags).unwrap_or_default(),
            batch_id: row.try_get("batch_id")?,
            resolution_id: row.try_get("resolution_id")?,
            state: parse_state(&state)?,
            result: row.try_get("result")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn resolution_from_row(&self, row: &sqlx::postgres::PgRow) -> StoreResult<Resolution> {
        let state: String = row.try_get("state")?;
        let steps_sealed: String = row.try_get("steps_sealed")?;
        let resolver_input_sealed: String = row.try_get("resolver_input_sealed")?;
        let steps: std::collections::BTreeMap<String, Step> =
            serde_json::from_value(self.keyring.open_value(&steps_sealed)?)?;
        let key_version: i32 = row.try_get("key_version")?;
        let run_count: i32 = row.try_get("run_count")?;
        let steps_pass: i32 = row.try_get("steps_pass")?;
        Ok(Resolution {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            state: parse_state(&state)?,
            steps,
            crypto_key_version: key_version as u32,
            last_start: row.try_get("last_start")?,
            next_retry: row.try_get("next_retry")?,
            run_count: run_count as u32,
            steps_pass: steps_pass as u32,
            resolver_username: row.try_get("resolver_username")?,
            resolver_input: self.keyring.open_value(&resolver_input_sealed)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn seal_steps(&self, resolution: &Resolution) -> StoreResult<String> {
        let doc = serde_json::to_value(&resolution.steps)?;
        Ok(self.keyring.seal_value(&doc)?)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_batch(&self, batch: &Batch) -> StoreResult<()> {
        sqlx::query("INSERT INTO batch (id, created_at) VALUES ($1, $2)")
            .bind(batch.id)
            .bind(batch.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_task(&self, task: &Task) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO task (
                id, template_name, title, requester_username,
                watcher_usernames, watcher_groups, resolver_usernames, resolver_groups,
                input_sealed, tags, batch_id, resolution_id, state, result,
                key_version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(task.id)
        .bind(&task.template_name)
        .bind(&task.title)
        .bind(&task.requester_username)
        .bind(serde_json::to_value(&task.watcher_usernames)?)
        .bind(serde_json::to_value(&task.watcher_groups)?)
        .bind(serde_json::to_value(&task.resolver_usernames)?)
        .bind(serde_json::to_value(&task.resolver_groups)?)
        .bind(self.keyring.seal_value(&task.input)?)
        .bind(serde_json::to_value(&task.tags)?)
        .bind(task.batch_id)
        .bind(task.resolution_id)
        .bind(task.state.as_str())
        .bind(&task.result)
        .bind(self.keyring.latest_version() as i32)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> StoreResult<Task> {
        let row = sqlx::query("SELECT * FROM task WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("task {id}")))?;
        self.task_from_row(&row)
    }

    async fn update_task(&self, task: &Task) -> StoreResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE task
            SET title = $2,
                watcher_usernames = $3,
                watcher_groups = $4,
                resolver_usernames = $5,
                resolver_groups = $6,
                input_sealed = $7,
                tags = $8,
                batch_id = $9,
                resolution_id = $10,
                state = $11,
                result = $12,
                key_version = $13,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(&task.title)
        .bind(serde_json::to_value(&task.watcher_usernames)?)
        .bind(serde_json::to_value(&task.watcher_groups)?)
        .bind(serde_json::to_value(&task.resolver_usernames)?)
        .bind(serde_json::to_value(&task.resolver_groups)?)
        .bind(self.keyring.seal_value(&task.input)?)
        .bind(serde_json::to_value(&task.tags)?)
        .bind(task.batch_id)
        .bind(task.resolution_id)
        .bind(task.state.as_str())
        .bind(&task.result)
        .bind(self.keyring.latest_version() as i32)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("task {}", task.id)));
        }
        Ok(())
    }

    async fn delete_task(&self, id: Uuid) -> StoreResult<()> {
        let deleted = sqlx::query("DELETE FROM task WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    async fn create_resolution(&self, resolution: &Resolution) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO resolution (
                id, task_id, state, steps_sealed, resolver_username,
                resolver_input_sealed, key_version, last_start, next_retry,
                run_count, steps_pass, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(resolution.id)
        .bind(resolution.task_id)
        .bind(resolution.state.as_str())
        .bind(self.seal_steps(resolution)?)
        .bind(&resolution.resolver_username)
        .bind(self.keyring.seal_value(&resolution.resolver_input)?)
        .bind(self.keyring.latest_version() as i32)
        .bind(resolution.last_start)
        .bind(resolution.next_retry)
        .bind(resolution.run_count as i32)
        .bind(resolution.steps_pass as i32)
        .bind(resolution.created_at)
        .bind(resolution.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_resolution(&self, id: Uuid) -> StoreResult<Resolution> {
        let row = sqlx::query("SELECT * FROM resolution WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("resolution {id}")))?;
        self.resolution_from_row(&row)
    }

    async fn update_resolution(&self, resolution: &Resolution) -> StoreResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE resolution
            SET state = $2,
                steps_sealed = $3,
                resolver_username = $4,
                resolver_input_sealed = $5,
                key_version = $6,
                last_start = $7,
                next_retry = $8,
                run_count = $9,
                steps_pass = $10,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(resolution.id)
        .bind(resolution.state.as_str())
        .bind(self.seal_steps(resolution)?)
        .bind(&resolution.resolver_username)
        .bind(self.keyring.seal_value(&resolution.resolver_input)?)
        .bind(self.keyring.latest_version() as i32)
        .bind(resolution.last_start)
        .bind(resolution.next_retry)
        .bind(resolution.run_count as i32)
        .bind(resolution.steps_pass as i32)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("resolution {}", resolution.id)));
        }
        Ok(())
    }

    async fn resolution_state(&self, id: Uuid) -> StoreResult<ResolutionState> {
        let state: Option<String> =
            sqlx::query_scalar("SELECT state FROM resolution WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        let state = state.ok_or_else(|| StoreError::NotFound(format!("resolution {id}")))?;
        parse_state(&state)
    }

    async fn set_resolution_state(
        &self,
        id: Uuid,
        state: ResolutionState,
        next_retry: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE resolution
            SET state = $2,
                next_retry = COALESCE($3, next_retry),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(state.as_str())
        .bind(next_retry)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("resolution {id}")));
        }
        Ok(())
    }

    async fn try_lock_resolution(
        &self,
        id: Uuid,
        owner: Uuid,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(300));
        let claimed = sqlx::query(
            r#"
            UPDATE resolution
            SET lock_uuid = $2, lock_expires_at = $3
            WHERE id = $1
              AND (lock_uuid IS NULL OR lock_uuid = $2 OR lock_expires_at < NOW())
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(claimed.rows_affected() == 1)
    }

    async fn unlock_resolution(&self, id: Uuid, owner: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE resolution
            SET lock_uuid = NULL, lock_expires_at = NULL
            WHERE id = $1 AND lock_uuid = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_runnable(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<RunnableResolution>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.state, t.template_name
            FROM resolution r
            JOIN task t ON t.id = r.task_id
            WHERE r.state IN ('TO_AUTORUN', 'RETRY_NOW', 'CRASHED')
              AND (r.next_retry IS NULL OR r.next_retry <= $1)
            ORDER BY r.next_retry NULLS FIRST
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;

        let mut runnable = Vec::with_capacity(rows.len());
        for row in rows {
            let state: String = row.try_get("state")?;
            runnable.push(RunnableResolution {
                id: row.try_get("id")?,
                template_name: row.try_get("template_name")?,
                state: parse_state(&state)?,
            });
        }
        Ok(runnable)
    }

    async fn sweep_crashed(&self, stale_before: DateTime<Utc>) -> StoreResult<u64> {
        let swept = sqlx::query(
            r#"
            UPDATE resolution
            SET state = 'CRASHED', next_retry = NOW(), updated_at = NOW()
            WHERE state = 'RUNNING'
              AND last_start < $1
              AND (lock_expires_at IS NULL OR lock_expires_at < NOW())
            "#,
        )
        .bind(stale_before)
        .execute(&self.pool)
        .await?;
        Ok(swept.rows_affected())
    }

    async fn running_batch_siblings(
        &self,
        batch_id: Uuid,
        exclude_task: Uuid,
    ) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM task
            WHERE batch_id = $1
              AND id <> $2
              AND state NOT IN ('DONE', 'CANCELLED', 'WONTFIX')
            "#,
        )
        .bind(batch_id)
        .bind(exclude_task)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_task_states(&self) -> StoreResult<Vec<StateCount>> {
        let rows = sqlx::query_as::<_, (String, String, String, i64)>(
            r#"
            SELECT template_name, state, COALESCE(resolver_groups ->> 0, ''), COUNT(*)
            FROM task
            GROUP BY 1, 2, 3
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(template, state, group, count)| StateCount {
                template,
                state,
                group,
                count,
            })
            .collect())
    }

    async fn rotate_encryption(&self) -> StoreResult<u64> {
        let latest = self.keyring.latest_version() as i32;
        let mut rewritten = 0;

        let tasks = sqlx::query_as::<_, (Uuid, String)>(
            "SELECT id, input_sealed FROM task WHERE key_version < $1",
        )
        .bind(latest)
        .fetch_all(&self.pool)
        .await?;
        for (id, sealed) in tasks {
            let resealed = self.keyring.seal_value(&self.keyring.open_value(&sealed)?)?;
            sqlx::query("UPDATE task SET input_sealed = $2, key_version = $3 WHERE id = $1")
                .bind(id)
                .bind(resealed)
                .bind(latest)
                .execute(&self.pool)
                .await?;
            rewritten += 1;
        }

        let resolutions = sqlx::query_as::<_, (Uuid, String, String)>(
            "SELECT id, steps_sealed, resolver_input_sealed FROM resolution WHERE key_version < $1",
        )
        .bind(latest)
        .fetch_all(&self.pool)
        .await?;
        for (id, steps_sealed, input_sealed) in resolutions {
            let steps = self
                .keyring
                .seal_value(&self.keyring.open_value(&steps_sealed)?)?;
            let input = self
                .keyring
                .seal_value(&self.keyring.open_value(&input_sealed)?)?;
            sqlx::query(
                r#"
                UPDATE resolution
                SET steps_sealed = $2, resolver_input_sealed = $3, key_version = $4
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(steps)
            .bind(input)
            .bind(latest)
            .execute(&self.pool)
            .await?;
            rewritten += 1;
        }

        Ok(rewritten)
    }
}
