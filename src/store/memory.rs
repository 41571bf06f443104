//! In-memory store for tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{RunnableResolution, StateCount, Store, StoreError, StoreResult};
use crate::resolution::{Resolution, ResolutionState};
use crate::task::{Batch, Task};

#[derive(Clone, Copy, Debug)]
struct LockClaim {
    owner: Uuid,
    expires_at: DateTime<Utc>,
}

/// Store keeping everything behind mutexes, mirroring the relational layout
/// closely enough that scheduler behavior is identical.
#[derive(Clone, Default)]
pub struct MemoryStore {
    batches: Arc<Mutex<HashMap<Uuid, Batch>>>,
    tasks: Arc<Mutex<HashMap<Uuid, Task>>>,
    resolutions: Arc<Mutex<HashMap<Uuid, Resolution>>>,
    locks: Arc<Mutex<HashMap<Uuid, LockClaim>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolution ids currently holding a live lock claim; test helper.
    pub fn locked_resolutions(&self) -> Vec<Uuid> {
        let now = Utc::now();
        self.locks
            .lock()
            .expect("locks poisoned")
            .iter()
            .filter(|(_, claim)| claim.expires_at > now)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_batch(&self, batch: &Batch) -> StoreResult<()> {
        self.batches
            .lock()
            .expect("batches poisoned")
            .insert(batch.id, batch.clone());
        Ok(())
    }

    async fn create_task(&self, task: &Task) -> StoreResult<()> {
        self.tasks
            .lock()
            .expect("tasks poisoned")
            .insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> StoreResult<Task> {
        self.tasks
            .lock()
            .expect("tasks poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("task {id}")))
    }

    async fn update_task(&self, task: &Task) -> StoreResult<()> {
        let mut tasks = self.tasks.lock().expect("tasks poisoned");
        if !tasks.contains_key(&task.id) {
            return Err(StoreError::NotFound(format!("task {}", task.id)));
        }
        let mut task = task.clone();
        task.updated_at = Utc::now();
        tasks.insert(task.id, task);
        Ok(())
    }

    async fn delete_task(&self, id: Uuid) -> StoreResult<()> {
        let removed = self.tasks.lock().expect("tasks poisoned").remove(&id);
        let Some(task) = removed else {
            return Err(StoreError::NotFound(format!("task {id}")));
        };
        let mut resolutions = self.resolutions.lock().expect("resolutions poisoned");
        resolutions.retain(|_, resolution| resolution.task_id != task.id);
        Ok(())
    }

    async fn create_resolution(&self, resolution: &Resolution) -> StoreResult<()> {
        self.resolutions
            .lock()
            .expect("resolutions poisoned")
            .insert(resolution.id, resolution.clone());
        Ok(())
    }

    async fn get_resolution(&self, id: Uuid) -> StoreResult<Resolution> {
        self.resolutions
            .lock()
            .expect("resolutions poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("resolution {id}")))
    }

    async fn update_resolution(&self, resolution: &Resolution) -> StoreResult<()> {
        let mut resolutions = self.resolutions.lock().expect("resolutions poisoned");
        if !resolutions.contains_key(&resolution.id) {
            return Err(StoreError::NotFound(format!("resolution {}", resolution.id)));
        }
        let mut resolution = resolution.clone();
        resolution.updated_at = Utc::now();
        resolutions.insert(resolution.id, resolution);
        Ok(())
    }

    async fn resolution_state(&self, id: Uuid) -> StoreResult<ResolutionState> {
        Ok(self.get_resolution(id).await?.state)
    }

    async fn set_resolution_state(
        &self,
        id: Uuid,
        state: ResolutionState,
        next_retry: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut resolutions = self.resolutions.lock().expect("resolutions poisoned");
        let resolution = resolutions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("resolution {id}")))?;
        resolution.state = state;
        if next_retry.is_some() {
            resolution.next_retry = next_retry;
        }
        resolution.updated_at = Utc::now();
        Ok(())
    }

    async fn try_lock_resolution(
        &self,
        id: Uuid,
        owner: Uuid,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(300));
        let mut locks = self.locks.lock().expect("locks poisoned");
        match locks.get(&id) {
            Some(claim) if claim.owner != owner && claim.expires_at > now => Ok(false),
            _ => {
                locks.insert(id, LockClaim { owner, expires_at });
                Ok(true)
            }
        }
    }

    async fn unlock_resolution(&self, id: Uuid, owner: Uuid) -> StoreResult<()> {
        let mut locks = self.locks.lock().expect("locks poisoned");
        if locks.get(&id).is_some_and(|claim| claim.owner == owner) {
            locks.remove(&id);
        }
        Ok(())
    }

    async fn find_runnable(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<RunnableResolution>> {
        let resolutions = self.resolutions.lock().expect("resolutions poisoned");
        let tasks = self.tasks.lock().expect("tasks poisoned");
        let mut runnable: Vec<_> = resolutions
            .values()
            .filter(|resolution| {
                matches!(
                    resolution.state,
                    ResolutionState::ToAutorun
                        | ResolutionState::RetryNow
                        | ResolutionState::Crashed
                )
            })
            .filter(|resolution| resolution.next_retry.is_none_or(|due| due <= now))
            .map(|resolution| RunnableResolution {
                id: resolution.id,
                template_name: tasks
                    .get(&resolution.task_id)
                    .map(|task| task.template_name.clone())
                    .unwrap_or_default(),
                state: resolution.state,
            })
            .collect();
        runnable.sort_by_key(|entry| entry.id);
        runnable.truncate(limit.max(0) as usize);
        Ok(runnable)
    }

    async fn sweep_crashed(&self, stale_before: DateTime<Utc>) -> StoreResult<u64> {
        let now = Utc::now();
        let locks = self.locks.lock().expect("locks poisoned");
        let mut resolutions = self.resolutions.lock().expect("resolutions poisoned");
        let mut swept = 0;
        for resolution in resolutions.values_mut() {
            if resolution.state != ResolutionState::Running {
                continue;
            }
            if resolution.last_start.is_none_or(|start| start > stale_before) {
                continue;
            }
            let lock_held = locks
                .get(&resolution.id)
                .is_some_and(|claim| claim.expires_at > now);
            if lock_held {
                continue;
            }
            resolution.state = ResolutionState::Crashed;
            resolution.next_retry = Some(now);
            resolution.updated_at = now;
            swept += 1;
        }
        Ok(swept)
    }

    async fn running_batch_siblings(
        &self,
        batch_id: Uuid,
        exclude_task: Uuid,
    ) -> StoreResult<i64> {
        let tasks = self.tasks.lock().expect("tasks poisoned");
        Ok(tasks
            .values()
            .filter(|task| task.batch_id == Some(batch_id))
            .filter(|task| task.id != exclude_task)
            .filter(|task| !task.state.is_settled())
            .count() as i64)
    }

    async fn count_task_states(&self) -> StoreResult<Vec<StateCount>> {
        let tasks = self.tasks.lock().expect("tasks poisoned");
        let mut counts: HashMap<(String, String, String), i64> = HashMap::new();
        for task in tasks.values() {
            let group = task
                .resolver_groups
                .first()
                .cloned()
                .unwrap_or_default();
            *counts
                .entry((
                    task.template_name.clone(),
                    task.state.as_str().to_string(),
                    group,
                ))
                .or_default() += 1;
        }
        let mut rows: Vec<StateCount> = counts
            .into_iter()
            .map(|((template, state, group), count)| StateCount {
                template,
                state,
                group,
                count,
            })
            .collect();
        rows.sort_by(|a, b| (&a.template, &a.state).cmp(&(&b.template, &b.state)));
        Ok(rows)
    }

    async fn rotate_encryption(&self) -> StoreResult<u64> {
        // Nothing is sealed in memory.
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_claims_are_exclusive_until_expiry() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(
            store
                .try_lock_resolution(id, first, Duration::from_secs(60))
                .await
                .expect("lock")
        );
        assert!(
            !store
                .try_lock_resolution(id, second, Duration::from_secs(60))
                .await
                .expect("lock")
        );
        // Re-entrant for the same owner.
        assert!(
            store
                .try_lock_resolution(id, first, Duration::from_secs(60))
                .await
                .expect("lock")
        );

        store.unlock_resolution(id, second).await.expect("unlock");
        assert_eq!(store.locked_resolutions(), vec![id]);

        store.unlock_resolution(id, first).await.expect("unlock");
        assert!(
            store
                .try_lock_resolution(id, second, Duration::from_secs(60))
                .await
                .expect("lock")
        );
    }

    #[tokio::test]
    async fn expired_claims_can_be_stolen() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        assert!(
            store
                .try_lock_resolution(id, Uuid::new_v4(), Duration::from_secs(0))
                .await
                .expect("lock")
        );
        assert!(
            store
                .try_lock_resolution(id, Uuid::new_v4(), Duration::from_secs(60))
                .await
                .expect("lock")
        );
    }
}
