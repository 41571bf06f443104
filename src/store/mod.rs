//! Persistence gateway interfaces.

pub mod crypto;
pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::resolution::{Resolution, ResolutionState};
use crate::task::{Batch, Task};

pub use crypto::{CryptoError, Keyring};
pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Message(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A resolution eligible for collection, with the template name used for
/// round-robin fairness.
#[derive(Debug, Clone)]
pub struct RunnableResolution {
    pub id: Uuid,
    pub template_name: String,
    pub state: ResolutionState,
}

/// One cell of the task-state aggregation backing the state gauge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateCount {
    pub template: String,
    pub state: String,
    pub group: String,
    pub count: i64,
}

/// Transactional load/update of tasks, resolutions and the per-resolution
/// lock. Implementations must guarantee that at most one owner holds a given
/// resolution's lock at any wall-clock moment.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_batch(&self, batch: &Batch) -> StoreResult<()>;

    async fn create_task(&self, task: &Task) -> StoreResult<()>;
    async fn get_task(&self, id: Uuid) -> StoreResult<Task>;
    async fn update_task(&self, task: &Task) -> StoreResult<()>;
    /// Delete a task and its resolutions.
    async fn delete_task(&self, id: Uuid) -> StoreResult<()>;

    async fn create_resolution(&self, resolution: &Resolution) -> StoreResult<()>;
    async fn get_resolution(&self, id: Uuid) -> StoreResult<Resolution>;
    async fn update_resolution(&self, resolution: &Resolution) -> StoreResult<()>;

    /// Cheap state probe used by the scheduler to observe external pause and
    /// cancel requests between dispatches.
    async fn resolution_state(&self, id: Uuid) -> StoreResult<ResolutionState>;

    /// Flip a resolution's state without touching the step document. Used by
    /// the control surface (pause, cancel, resume) and the collector.
    async fn set_resolution_state(
        &self,
        id: Uuid,
        state: ResolutionState,
        next_retry: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Claim the single-writer lock for a resolution. Returns false when
    /// another live owner holds it.
    async fn try_lock_resolution(&self, id: Uuid, owner: Uuid, ttl: Duration)
    -> StoreResult<bool>;

    /// Release a lock claim; a claim held by a different owner is left alone.
    async fn unlock_resolution(&self, id: Uuid, owner: Uuid) -> StoreResult<()>;

    /// Resolutions in {TO_AUTORUN, RETRY_NOW, CRASHED} whose retry time has
    /// come, for the collector.
    async fn find_runnable(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<RunnableResolution>>;

    /// Mark stale RUNNING resolutions with a free lock as CRASHED. Returns how
    /// many rows moved.
    async fn sweep_crashed(&self, stale_before: DateTime<Utc>) -> StoreResult<u64>;

    /// Count of batch siblings still holding an unsettled task, excluding the
    /// given one.
    async fn running_batch_siblings(
        &self,
        batch_id: Uuid,
        exclude_task: Uuid,
    ) -> StoreResult<i64>;

    /// Aggregation backing the `cairn_task_state` gauge.
    async fn count_task_states(&self) -> StoreResult<Vec<StateCount>>;

    /// Re-seal rows encrypted with outdated key versions. Returns how many
    /// rows were rewritten.
    async fn rotate_encryption(&self) -> StoreResult<u64>;
}
