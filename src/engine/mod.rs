//! Engine wiring: registries, submission channel and lifecycle loops.

mod collector;
mod scheduler;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::metrics::spawn_state_gauge;
use crate::notify::{Message, NotificationBus, NotifyAction};
use crate::resolution::{Resolution, ResolutionState};
use crate::resources::ResourceRegistry;
use crate::runner::RunnerRegistry;
use crate::store::Store;
use crate::task::{Task, TaskState};
use crate::template::{TaskTemplate, TemplateRegistry};

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) runners: Arc<RunnerRegistry>,
    pub(crate) templates: Arc<TemplateRegistry>,
    pub(crate) resources: Arc<ResourceRegistry>,
    pub(crate) notify: Arc<NotificationBus>,
    /// Process-wide bound on concurrent step executions.
    pub(crate) global_permits: Arc<Semaphore>,
    pub(crate) submit_tx: mpsc::Sender<Uuid>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
}

impl EngineInner {
    pub(crate) fn template_variables(
        &self,
        template_name: &str,
    ) -> HashMap<String, serde_json::Value> {
        self.templates
            .get(template_name)
            .map(|template| template.variables.clone())
            .unwrap_or_default()
    }

    pub(crate) fn publish_task_state(&self, task: &Task, resolver_username: Option<&str>) {
        self.notify.publish(Message {
            action: NotifyAction::TaskStateUpdate,
            task_id: task.id,
            template_name: task.template_name.clone(),
            title: task.title.clone(),
            state: task.state.as_str().to_string(),
            step_name: None,
            step_state: None,
            resolver_username: resolver_username.map(str::to_string),
            tags: task.tags.clone(),
        });
    }
}

/// The resolution engine. Owns the worker pool consuming submitted resolution
/// ids, the retry collector and the state gauge refresher.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    submit_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Uuid>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        runners: RunnerRegistry,
        templates: TemplateRegistry,
        notify: NotificationBus,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (submit_tx, submit_rx) = mpsc::channel(config.submission_queue_size.max(1));
        let resources = Arc::new(ResourceRegistry::new(&config.resource_limits));
        let global_permits = Arc::new(Semaphore::new(config.global_max_executions.max(1)));
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                runners: Arc::new(runners),
                templates: Arc::new(templates),
                resources,
                notify: Arc::new(notify),
                global_permits,
                submit_tx,
                shutdown_rx,
            }),
            shutdown_tx: Arc::new(shutdown_tx),
            submit_rx: Arc::new(tokio::sync::Mutex::new(submit_rx)),
        }
    }

    /// Spawn the engine loops: crash sweep, resolution workers, retry
    /// collector and gauge refresher.
    pub async fn start(&self) -> EngineResult<Vec<JoinHandle<()>>> {
        self.recover_crashed().await?;

        let mut handles = Vec::new();
        for worker_id in 0..self.inner.config.engine_workers.max(1) {
            let inner = self.inner.clone();
            let submit_rx = self.submit_rx.clone();
            let mut shutdown_rx = self.inner.shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let resolution_id = {
                        let mut rx = submit_rx.lock().await;
                        tokio::select! {
                            received = rx.recv() => received,
                            _ = shutdown_rx.changed() => None,
                        }
                    };
                    let Some(resolution_id) = resolution_id else {
                        info!(worker_id, "engine worker stopping");
                        break;
                    };
                    if let Err(err) = scheduler::run_resolution(&inner, resolution_id).await {
                        error!(
                            worker_id,
                            resolution_id = %resolution_id,
                            error = %err,
                            "resolution pass aborted"
                        );
                    }
                }
            }));
        }

        handles.push(collector::spawn_retry_collector(
            self.inner.clone(),
            self.inner.shutdown_rx.clone(),
        ));
        handles.push(spawn_state_gauge(
            self.inner.store.clone(),
            self.inner.config.metrics_refresh_interval,
            self.inner.shutdown_rx.clone(),
        ));
        Ok(handles)
    }

    /// Signal every loop to stop. In-flight runners get the configured grace
    /// period from their own pass before the lock is released.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Mark stale RUNNING resolutions with a free lock as CRASHED. Invoked at
    /// startup; the retry collector re-arms whatever this sweeps.
    pub async fn recover_crashed(&self) -> EngineResult<u64> {
        let stale_before = Utc::now()
            - chrono::Duration::from_std(self.inner.config.liveness_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let swept = self.inner.store.sweep_crashed(stale_before).await?;
        if swept > 0 {
            warn!(count = swept, "marked stale running resolutions as crashed");
        }
        Ok(swept)
    }

    /// Queue a resolution for a scheduler pass.
    pub async fn submit(&self, resolution_id: Uuid) -> EngineResult<()> {
        self.inner
            .submit_tx
            .send(resolution_id)
            .await
            .map_err(|_| EngineError::Conflict("engine is shut down".to_string()))
    }

    /// Run one scheduler pass synchronously. The control surface's `run`
    /// operation and the tests use this instead of going through the channel.
    pub async fn run_now(&self, resolution_id: Uuid) -> EngineResult<()> {
        scheduler::run_resolution(&self.inner, resolution_id).await
    }

    /// One collector tick, synchronously.
    pub async fn collect_now(&self) -> EngineResult<usize> {
        collector::collect(&self.inner).await
    }

    /// Create a task from a template; when the template is auto-runnable and
    /// the requester may resolve it, the resolution is created and submitted
    /// in the same call.
    pub async fn create_task(
        &self,
        template: &TaskTemplate,
        input: &serde_json::Value,
        requester_username: &str,
        tags: HashMap<String, String>,
        batch_id: Option<Uuid>,
    ) -> EngineResult<Task> {
        let mut task = Task::from_template(template, input, requester_username, tags, batch_id)?;
        self.inner.store.create_task(&task).await?;

        if !template.auto_runnable {
            self.inner.notify.publish(Message {
                action: NotifyAction::TaskValidation,
                task_id: task.id,
                template_name: task.template_name.clone(),
                title: task.title.clone(),
                state: task.state.as_str().to_string(),
                step_name: None,
                step_state: None,
                resolver_username: None,
                tags: task.tags.clone(),
            });
            return Ok(task);
        }

        let resolution = self
            .create_resolution(template, &mut task, None, &serde_json::Value::Null, None)
            .await?;
        self.submit(resolution.id).await?;
        Ok(task)
    }

    /// Create the resolution for an existing task.
    pub async fn create_resolution(
        &self,
        template: &TaskTemplate,
        task: &mut Task,
        resolver_username: Option<&str>,
        resolver_input: &serde_json::Value,
        run_after: Option<DateTime<Utc>>,
    ) -> EngineResult<Resolution> {
        if task.resolution_id.is_some() {
            return Err(EngineError::Conflict(format!(
                "task {} already has a resolution",
                task.id
            )));
        }
        if let Some(resolver) = resolver_username
            && !template.allow_all_resolver_usernames
            && !template
                .allowed_resolver_usernames
                .iter()
                .any(|allowed| allowed == resolver)
        {
            return Err(EngineError::Forbidden(format!(
                "{resolver} may not resolve template {}",
                template.name
            )));
        }

        let resolution = Resolution::create(
            template,
            task,
            resolver_username,
            resolver_input,
            template.auto_runnable,
            run_after,
        )?;
        self.inner.store.create_resolution(&resolution).await?;
        task.resolution_id = Some(resolution.id);
        self.inner.store.update_task(task).await?;
        Ok(resolution)
    }

    /// Pause a resolution: running passes stop dispatching once they observe
    /// the flag; nothing is scheduled until resume.
    pub async fn pause(&self, resolution_id: Uuid) -> EngineResult<()> {
        let state = self.inner.store.resolution_state(resolution_id).await?;
        if state.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "resolution {resolution_id} is {state}"
            )));
        }
        self.inner
            .store
            .set_resolution_state(resolution_id, ResolutionState::Paused, None)
            .await?;
        Ok(())
    }

    /// Resume a paused resolution and queue it.
    pub async fn resume(&self, resolution_id: Uuid) -> EngineResult<()> {
        let state = self.inner.store.resolution_state(resolution_id).await?;
        if state != ResolutionState::Paused {
            return Err(EngineError::Conflict(format!(
                "resolution {resolution_id} is {state}, not PAUSED"
            )));
        }
        self.inner
            .store
            .set_resolution_state(resolution_id, ResolutionState::RetryNow, Some(Utc::now()))
            .await?;
        self.submit(resolution_id).await
    }

    /// Cancel a resolution. Running passes stop dispatching; the task is
    /// marked cancelled.
    pub async fn cancel(&self, resolution_id: Uuid) -> EngineResult<()> {
        let resolution = self.inner.store.get_resolution(resolution_id).await?;
        if resolution.state.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "resolution {resolution_id} is {}",
                resolution.state
            )));
        }
        self.inner
            .store
            .set_resolution_state(resolution_id, ResolutionState::Cancelled, None)
            .await?;
        let mut task = self.inner.store.get_task(resolution.task_id).await?;
        if task.state != TaskState::Cancelled {
            task.state = TaskState::Cancelled;
            self.inner.store.update_task(&task).await?;
            self.inner.publish_task_state(&task, None);
        }
        Ok(())
    }

    /// Raise every step's retry budget by the configured delta, up to the cap,
    /// and re-queue a blocked-on-retries resolution.
    pub async fn extend(&self, resolution_id: Uuid) -> EngineResult<()> {
        let owner = Uuid::new_v4();
        let locked = self
            .inner
            .store
            .try_lock_resolution(resolution_id, owner, self.inner.config.lock_ttl)
            .await?;
        if !locked {
            return Err(EngineError::Conflict(format!(
                "resolution {resolution_id} is locked"
            )));
        }
        let result = async {
            let mut resolution = self.inner.store.get_resolution(resolution_id).await?;
            resolution.extend_retries(
                self.inner.config.retry_extension_delta,
                self.inner.config.retry_extension_cap,
            );
            if resolution.state == ResolutionState::BlockedMaxretries {
                resolution.state = ResolutionState::RetryNow;
                resolution.next_retry = Some(Utc::now());
                for step in resolution.steps.values_mut() {
                    if matches!(
                        step.state,
                        crate::step::StepState::ServerError | crate::step::StepState::AfterrunError
                    ) {
                        step.arm_retry();
                    }
                }
            }
            self.inner.store.update_resolution(&resolution).await?;
            Ok::<_, EngineError>(resolution.state)
        }
        .await;
        if let Err(err) = self
            .inner
            .store
            .unlock_resolution(resolution_id, owner)
            .await
        {
            warn!(resolution_id = %resolution_id, error = %err, "failed to release lock");
        }
        if result? == ResolutionState::RetryNow {
            self.submit(resolution_id).await?;
        }
        Ok(())
    }

    /// Force a step into a state, the admin edit operation. Refused while a
    /// pass holds the resolution.
    pub async fn set_step_state(
        &self,
        resolution_id: Uuid,
        step_name: &str,
        state: &str,
    ) -> EngineResult<()> {
        let owner = Uuid::new_v4();
        let locked = self
            .inner
            .store
            .try_lock_resolution(resolution_id, owner, self.inner.config.lock_ttl)
            .await?;
        if !locked {
            return Err(EngineError::Conflict(format!(
                "resolution {resolution_id} is locked"
            )));
        }
        let result = async {
            let mut resolution = self.inner.store.get_resolution(resolution_id).await?;
            let step = resolution.steps.get_mut(step_name).ok_or_else(|| {
                EngineError::NotFound(format!("step {step_name} in resolution {resolution_id}"))
            })?;
            let new_state = crate::step::StepState::parse(state);
            if let crate::step::StepState::Custom(custom) = &new_state
                && !step.custom_states.contains(custom)
            {
                return Err(EngineError::BadRequest(format!(
                    "state {custom} is not declared on step {step_name}"
                )));
            }
            step.state = new_state;
            self.inner.store.update_resolution(&resolution).await?;
            Ok::<_, EngineError>(())
        }
        .await;
        if let Err(err) = self
            .inner
            .store
            .unlock_resolution(resolution_id, owner)
            .await
        {
            warn!(resolution_id = %resolution_id, error = %err, "failed to release lock");
        }
        result
    }
}
