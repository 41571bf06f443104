//! The resolution scheduler.
//!
//! One pass claims the resolution's lock, then alternates between planning
//! (promote retries, expand foreach parents, prune mismatched dependencies,
//! evaluate pre-conditions) and dispatching ready steps onto spawned
//! executions, persisting every transition under the lock until the
//! resolution is terminal or must suspend.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::EngineInner;
use crate::condition::{ConditionOutcome, ConditionWhen, StepCondition};
use crate::errors::EngineResult;
use crate::notify::{Message, NotifyAction};
use crate::resolution::{Resolution, ResolutionState};
use crate::runner::{ExecContext, RunnerError, RunnerOutput, StepRunner};
use crate::step::{DependencyStatus, Step, StepState};
use crate::task::{Task, TaskState};
use crate::template::{ActionSpec, ForeachStrategy};
use crate::value::ValueContext;

struct StepOutcome {
    step: String,
    result: Result<RunnerOutput, RunnerError>,
}

struct RoundPlan {
    ready: Vec<String>,
    expanded: bool,
}

enum SequenceGate {
    Go,
    Wait,
    Abort,
}

/// Run one pass over a resolution. Silently drops the id when another worker
/// holds the lock.
pub(crate) async fn run_resolution(
    inner: &Arc<EngineInner>,
    resolution_id: Uuid,
) -> EngineResult<()> {
    let owner = Uuid::new_v4();
    let locked = inner
        .store
        .try_lock_resolution(resolution_id, owner, inner.config.lock_ttl)
        .await?;
    if !locked {
        debug!(resolution_id = %resolution_id, "resolution lock held elsewhere, dropping");
        return Ok(());
    }
    let outcome = drive(inner, resolution_id, owner).await;
    if let Err(err) = inner.store.unlock_resolution(resolution_id, owner).await {
        warn!(resolution_id = %resolution_id, error = %err, "failed to release resolution lock");
    }
    outcome
}

/// Observe external pause/cancel requests, refresh the lock claim, then
/// persist the resolution. Once an external state is seen it sticks for the
/// rest of the pass.
async fn persist(
    inner: &Arc<EngineInner>,
    resolution: &mut Resolution,
    owner: Uuid,
    external: &mut Option<ResolutionState>,
) -> EngineResult<()> {
    // Long passes must not let the claim expire mid-flight; re-claiming under
    // the same owner extends it.
    inner
        .store
        .try_lock_resolution(resolution.id, owner, inner.config.lock_ttl)
        .await?;
    if external.is_none() {
        match inner.store.resolution_state(resolution.id).await? {
            ResolutionState::Paused => *external = Some(ResolutionState::Paused),
            ResolutionState::Cancelled => *external = Some(ResolutionState::Cancelled),
            _ => {}
        }
    }
    if let Some(state) = *external {
        resolution.state = state;
    }
    inner.store.update_resolution(resolution).await?;
    Ok(())
}

fn flush_messages(inner: &Arc<EngineInner>, messages: &mut Vec<Message>) {
    for message in messages.drain(..) {
        inner.notify.publish(message);
    }
}

fn step_message(task: &Task, step: &Step) -> Message {
    Message {
        action: NotifyAction::TaskStepUpdate,
        task_id: task.id,
        template_name: task.template_name.clone(),
        title: task.title.clone(),
        state: task.state.as_str().to_string(),
        step_name: Some(step.name.clone()),
        step_state: Some(step.state.as_str().to_string()),
        resolver_username: None,
        tags: task.tags.clone(),
    }
}

async fn drive(
    inner: &Arc<EngineInner>,
    resolution_id: Uuid,
    owner: Uuid,
) -> EngineResult<()> {
    if *inner.shutdown_rx.borrow() {
        return Ok(());
    }
    let mut resolution = inner.store.get_resolution(resolution_id).await?;
    if !resolution.state.is_runnable() {
        debug!(
            resolution_id = %resolution_id,
            state = %resolution.state,
            "resolution is not runnable, dropping"
        );
        return Ok(());
    }
    let mut task = inner.store.get_task(resolution.task_id).await?;
    let variables = inner.template_variables(&task.template_name);

    // Steps left RUNNING belong to an owner that died mid-step; they get
    // re-attempted, charged against their retry budget at dispatch.
    for step in resolution.steps.values_mut() {
        if step.state == StepState::Running {
            if step.try_count > step.max_retries {
                step.state = StepState::ServerError;
                step.error = Some("step interrupted with no retry budget left".to_string());
            } else {
                step.state = StepState::ToRetry;
                step.run_after = None;
            }
        }
    }

    resolution.state = ResolutionState::Running;
    resolution.last_start = Some(Utc::now());
    resolution.run_count += 1;
    resolution.next_retry = None;
    let mut external: Option<ResolutionState> = None;
    persist(inner, &mut resolution, owner, &mut external).await?;

    if external.is_none() && task.state != TaskState::Running {
        task.state = TaskState::Running;
        inner.store.update_task(&task).await?;
        inner.publish_task_state(&task, resolution.resolver_username.as_deref());
    }

    let limiter = Arc::new(Semaphore::new(
        inner.config.max_concurrent_executions.max(1),
    ));
    let (done_tx, mut done_rx) =
        mpsc::channel::<StepOutcome>(inner.config.max_concurrent_executions.max(1));
    let mut inflight: usize = 0;
    // A FATAL step stops dispatch but still finalizes; shutdown stops
    // dispatch and leaves the resolution RUNNING for crash recovery.
    let mut fatal = false;
    let mut shutting_down = false;
    let mut messages: Vec<Message> = Vec::new();

    loop {
        if *inner.shutdown_rx.borrow() {
            shutting_down = true;
        }

        if !fatal && !shutting_down && external.is_none() {
            let mut plan = plan_round(&mut resolution, &task, &variables, &mut messages);
            while plan.expanded {
                plan = plan_round(&mut resolution, &task, &variables, &mut messages);
            }

            let mut dispatched = false;
            for name in plan.ready {
                let Ok(permit) = limiter.clone().try_acquire_owned() else {
                    break;
                };
                if dispatch_step(
                    inner,
                    &mut resolution,
                    &task,
                    &variables,
                    &name,
                    permit,
                    done_tx.clone(),
                    &mut messages,
                ) {
                    inflight += 1;
                    dispatched = true;
                }
            }
            if dispatched {
                resolution.steps_pass += 1;
            }
            persist(inner, &mut resolution, owner, &mut external).await?;
            flush_messages(inner, &mut messages);
        }

        if inflight == 0 {
            break;
        }

        // Block until at least one execution finishes, then drain whatever
        // else is ready. On shutdown, grant the grace period only.
        let received = if shutting_down {
            match tokio::time::timeout(inner.config.shutdown_grace, done_rx.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(
                        resolution_id = %resolution_id,
                        inflight,
                        "shutdown grace elapsed with steps in flight"
                    );
                    return Ok(());
                }
            }
        } else {
            done_rx.recv().await
        };
        let Some(outcome) = received else { break };
        inflight -= 1;
        apply_outcome(
            &mut resolution,
            &task,
            &variables,
            outcome,
            &mut fatal,
            &mut messages,
        );
        while let Ok(extra) = done_rx.try_recv() {
            inflight -= 1;
            apply_outcome(
                &mut resolution,
                &task,
                &variables,
                extra,
                &mut fatal,
                &mut messages,
            );
        }
        persist(inner, &mut resolution, owner, &mut external).await?;
        flush_messages(inner, &mut messages);

        if (fatal || shutting_down || external.is_some()) && inflight == 0 {
            break;
        }
    }

    if let Some(state) = external {
        debug!(resolution_id = %resolution_id, state = %state, "pass suspended by external request");
        if state == ResolutionState::Cancelled && task.state != TaskState::Cancelled {
            task.state = TaskState::Cancelled;
            inner.store.update_task(&task).await?;
            inner.publish_task_state(&task, resolution.resolver_username.as_deref());
        }
        return Ok(());
    }
    if shutting_down {
        // Left RUNNING on purpose: the next startup's crash sweep reclassifies.
        debug!(resolution_id = %resolution_id, "pass interrupted by shutdown");
        return Ok(());
    }

    finalize(inner, resolution, task, &variables).await
}

/// One planning round over the step map. Returns the dispatchable step names;
/// `expanded` asks the caller to re-plan so fresh foreach children are
/// considered in the same dispatch round.
fn plan_round(
    resolution: &mut Resolution,
    task: &Task,
    variables: &HashMap<String, Value>,
    messages: &mut Vec<Message>,
) -> RoundPlan {
    settle_foreach_parents(resolution, task, messages);

    let now = Utc::now();
    for step in resolution.steps.values_mut() {
        step.promote_retry(now);
    }

    let names: Vec<String> = resolution.steps.keys().cloned().collect();
    let mut ready = Vec::new();
    let mut expanded = false;

    for name in names {
        let Some(step) = resolution.steps.get(&name) else {
            continue;
        };
        if step.state != StepState::Todo {
            continue;
        }

        if let Some(parent_name) = step.parent.clone() {
            match sequence_gate(resolution, &parent_name, &name) {
                SequenceGate::Go => {}
                SequenceGate::Wait => continue,
                SequenceGate::Abort => {
                    prune_step(resolution, task, &name, "prior sibling settled non-DONE", messages);
                    continue;
                }
            }
        }

        match resolution.steps[&name].dependency_status(&resolution.steps) {
            DependencyStatus::Pending => continue,
            DependencyStatus::Mismatch { dependency } => {
                prune_step(
                    resolution,
                    task,
                    &name,
                    &format!("dependency {dependency} settled outside the required states"),
                    messages,
                );
                continue;
            }
            DependencyStatus::Ready => {}
        }

        if !apply_conditions(resolution, task, variables, &name, ConditionWhen::Pre, messages) {
            continue;
        }
        let Some(step) = resolution.steps.get(&name) else {
            continue;
        };
        if step.state != StepState::Todo {
            // A condition pruned or retargeted this very step.
            continue;
        }

        if step.is_foreach_parent() {
            expand_foreach(resolution, task, variables, &name, messages);
            expanded = true;
            continue;
        }
        ready.push(name);
    }

    RoundPlan { ready, expanded }
}

/// Children of a `sequence` parent run strictly in order: child i+1 goes only
/// once child i is DONE; a non-DONE settled sibling aborts the remainder.
fn sequence_gate(resolution: &Resolution, parent_name: &str, child: &str) -> SequenceGate {
    let Some(parent) = resolution.steps.get(parent_name) else {
        return SequenceGate::Go;
    };
    if parent.foreach_strategy != ForeachStrategy::Sequence {
        return SequenceGate::Go;
    }
    let Some(children) = &parent.children else {
        return SequenceGate::Go;
    };
    for earlier in children {
        if earlier == child {
            return SequenceGate::Go;
        }
        let Some(sibling) = resolution.steps.get(earlier) else {
            continue;
        };
        match &sibling.state {
            StepState::Done => continue,
            state if state.is_final() => return SequenceGate::Abort,
            _ => return SequenceGate::Wait,
        }
    }
    SequenceGate::Go
}

fn prune_step(
    resolution: &mut Resolution,
    task: &Task,
    name: &str,
    reason: &str,
    messages: &mut Vec<Message>,
) {
    if let Some(step) = resolution.steps.get_mut(name)
        && !step.state.is_final()
    {
        step.state = StepState::Prune;
        step.error = Some(reason.to_string());
        messages.push(step_message(task, step));
    }
}

/// Evaluate one step's conditions for the given phase, applying their
/// outcomes. Returns false when evaluation failed the step itself.
fn apply_conditions(
    resolution: &mut Resolution,
    task: &Task,
    variables: &HashMap<String, Value>,
    name: &str,
    when: ConditionWhen,
    messages: &mut Vec<Message>,
) -> bool {
    let conditions: Vec<StepCondition> = match resolution.steps.get(name) {
        Some(step) => step
            .conditions
            .iter()
            .filter(|condition| condition.effective_when() == when)
            .cloned()
            .collect(),
        None => return false,
    };
    if conditions.is_empty() {
        return true;
    }

    let mut ctx = resolution.build_context(task, variables);
    if let Some(item) = resolution.steps[name].iterator.clone() {
        ctx.push_iterator(item);
    }

    for condition in conditions {
        match condition.evaluate(&ctx) {
            Err(err) => {
                if let Some(step) = resolution.steps.get_mut(name) {
                    match when {
                        ConditionWhen::Pre => step.mark_client_error(err.to_string()),
                        ConditionWhen::Post => {
                            step.state = StepState::AfterrunError;
                            step.error = Some(err.to_string());
                            step.arm_retry();
                        }
                    }
                    messages.push(step_message(task, step));
                }
                return false;
            }
            Ok(ConditionOutcome::Pass) => {}
            Ok(ConditionOutcome::CheckFailed(message)) => {
                if let Some(step) = resolution.steps.get_mut(name) {
                    step.mark_client_error(message);
                    messages.push(step_message(task, step));
                }
                return false;
            }
            Ok(ConditionOutcome::Skip(targets)) => {
                for target in targets {
                    prune_step(resolution, task, &target, "skipped by condition", messages);
                }
            }
            Ok(ConditionOutcome::SetState(targets)) => {
                for (target, state) in targets {
                    let new_state = StepState::parse(&state);
                    if let Some(step) = resolution.steps.get_mut(&target)
                        && step.state != new_state
                    {
                        step.state = new_state;
                        messages.push(step_message(task, step));
                    }
                }
            }
        }
    }
    true
}

/// Render a foreach parent's list and fan it out into child steps. The parent
/// stops being schedulable; its published state becomes the child aggregate.
fn expand_foreach(
    resolution: &mut Resolution,
    task: &Task,
    variables: &HashMap<String, Value>,
    name: &str,
    messages: &mut Vec<Message>,
) {
    let raw = match resolution.steps.get(name).and_then(|step| step.foreach.clone()) {
        Some(raw) => raw,
        None => return,
    };
    let ctx = resolution.build_context(task, variables);
    let items = match ctx.expand_list(&raw, name) {
        Ok(items) => items,
        Err(err) => {
            if let Some(step) = resolution.steps.get_mut(name) {
                step.mark_client_error(err.to_string());
                messages.push(step_message(task, step));
            }
            return;
        }
    };

    let children: Vec<Step> = {
        let parent = &resolution.steps[name];
        items
            .iter()
            .enumerate()
            .map(|(index, item)| parent.spawn_child(index, item.clone()))
            .collect()
    };
    let child_names: Vec<String> = children.iter().map(|child| child.name.clone()).collect();
    for child in children {
        resolution.steps.insert(child.name.clone(), child);
    }
    if let Some(parent) = resolution.steps.get_mut(name) {
        parent.children = Some(child_names);
        parent.foreach_result = Some(Value::Array(items));
        parent.state = StepState::Expanded;
    }
}

/// Adopt the aggregate child state on foreach parents whose children have all
/// settled.
fn settle_foreach_parents(resolution: &mut Resolution, task: &Task, messages: &mut Vec<Message>) {
    let parents: Vec<String> = resolution
        .steps
        .iter()
        .filter(|(_, step)| step.state == StepState::Expanded)
        .map(|(name, _)| name.clone())
        .collect();
    for name in parents {
        let aggregate = resolution.steps[&name].published_state(&resolution.steps);
        if !aggregate.is_final() {
            continue;
        }
        let error = resolution.steps[&name].children.as_ref().and_then(|children| {
            children
                .iter()
                .filter_map(|child| resolution.steps.get(child))
                .find(|child| child.state.is_error())
                .and_then(|child| child.error.clone())
        });
        if let Some(parent) = resolution.steps.get_mut(&name) {
            parent.state = aggregate;
            if error.is_some() {
                parent.error = error;
            }
            messages.push(step_message(task, parent));
        }
    }
}

/// Mark a step dispatched and spawn its execution. Returns false when the
/// step could not be dispatched (and its state says why).
#[allow(clippy::too_many_arguments)]
fn dispatch_step(
    inner: &Arc<EngineInner>,
    resolution: &mut Resolution,
    task: &Task,
    variables: &HashMap<String, Value>,
    name: &str,
    permit: OwnedSemaphorePermit,
    done_tx: mpsc::Sender<StepOutcome>,
    messages: &mut Vec<Message>,
) -> bool {
    let Some(step) = resolution.steps.get(name) else {
        return false;
    };
    if step.state != StepState::Todo {
        return false;
    }

    let runner_type = step.action.runner_type.clone();
    let Some(runner) = inner.runners.get(&runner_type) else {
        if let Some(step) = resolution.steps.get_mut(name) {
            step.mark_client_error(format!("no runner registered for action type {runner_type}"));
            messages.push(step_message(task, step));
        }
        return false;
    };
    let pre_hook: Option<(Arc<dyn StepRunner>, ActionSpec)> = match &step.pre_hook {
        Some(hook) => match inner.runners.get(&hook.runner_type) {
            Some(hook_runner) => Some((hook_runner, hook.clone())),
            None => {
                let hook_type = hook.runner_type.clone();
                if let Some(step) = resolution.steps.get_mut(name) {
                    step.mark_client_error(format!(
                        "no runner registered for pre-hook type {hook_type}"
                    ));
                    messages.push(step_message(task, step));
                }
                return false;
            }
        },
        None => None,
    };

    if let Some(step) = resolution.steps.get_mut(name) {
        step.mark_dispatched(Utc::now());
    }

    let mut ctx = resolution.build_context(task, variables);
    let step = &resolution.steps[name];
    if let Some(item) = step.iterator.clone() {
        ctx.push_iterator(item);
    }
    let exec_ctx = ExecContext {
        task_id: task.id,
        resolution_id: resolution.id,
        step_name: name.to_string(),
        try_count: step.try_count,
        resolver_username: resolution.resolver_username.clone(),
    };
    let action_config = step.action.configuration.clone();
    let declared_resources = step.resources.clone();
    let step_name = name.to_string();
    let inner = inner.clone();

    tokio::spawn(async move {
        let _limiter_permit = permit;
        let result = execute_step(
            &inner,
            ctx,
            exec_ctx,
            runner,
            pre_hook,
            action_config,
            declared_resources,
        )
        .await;
        if done_tx
            .send(StepOutcome {
                step: step_name,
                result,
            })
            .await
            .is_err()
        {
            // The pass ended without us; the step will be re-attempted after
            // crash recovery.
        }
    });
    true
}

async fn execute_step(
    inner: &Arc<EngineInner>,
    mut ctx: ValueContext,
    exec_ctx: ExecContext,
    runner: Arc<dyn StepRunner>,
    pre_hook: Option<(Arc<dyn StepRunner>, ActionSpec)>,
    action_config: Value,
    declared_resources: Vec<String>,
) -> Result<RunnerOutput, RunnerError> {
    let Ok(_global) = inner.global_permits.clone().acquire_owned().await else {
        return Err(RunnerError::Transient(
            "engine execution pool closed".to_string(),
        ));
    };
    let timeout = inner.config.step_execution_timeout;

    // The pre-hook runs first so its output is available to the main
    // configuration's expansion.
    if let Some((hook_runner, hook_spec)) = pre_hook {
        let hook_config = ctx
            .expand_value(&hook_spec.configuration)
            .map_err(|err| RunnerError::Permanent(err.to_string()))?;
        hook_runner.validate(&hook_config)?;
        let hook_result = tokio::time::timeout(timeout, hook_runner.exec(&exec_ctx, &hook_config))
            .await
            .map_err(|_| RunnerError::Transient("pre-hook timed out".to_string()))??;
        ctx.set_pre_hook(hook_result.output);
    }

    let config = ctx
        .expand_value(&action_config)
        .map_err(|err| RunnerError::Permanent(err.to_string()))?;
    runner.validate(&config)?;

    let mut tags = declared_resources;
    tags.extend(runner.resources(&config));
    let _resources = inner.resources.acquire(&tags).await;

    metrics::counter!("cairn_steps_dispatched_total").increment(1);
    match tokio::time::timeout(timeout, runner.exec(&exec_ctx, &config)).await {
        Ok(result) => result,
        Err(_) => Err(RunnerError::Transient(
            "step execution timed out".to_string(),
        )),
    }
}

/// Apply a finished execution: the step transition, its post-conditions and
/// the halt flag on FATAL.
fn apply_outcome(
    resolution: &mut Resolution,
    task: &Task,
    variables: &HashMap<String, Value>,
    outcome: StepOutcome,
    fatal: &mut bool,
    messages: &mut Vec<Message>,
) {
    {
        let Some(step) = resolution.steps.get_mut(&outcome.step) else {
            return;
        };
        if step.state != StepState::Running {
            // The step was edited while the execution was in flight.
            return;
        }
        step.apply_exec(outcome.result);
    }

    let state = resolution.steps[&outcome.step].state.clone();
    if state == StepState::Done {
        if apply_conditions(
            resolution,
            task,
            variables,
            &outcome.step,
            ConditionWhen::Post,
            messages,
        ) && resolution.steps[&outcome.step].state == StepState::Done
        {
            messages.push(step_message(task, &resolution.steps[&outcome.step]));
        }
    } else {
        messages.push(step_message(task, &resolution.steps[&outcome.step]));
    }

    if resolution.steps[&outcome.step].state == StepState::Fatal {
        *fatal = true;
    }
}

/// Compute and persist the resolution's next persistent state once nothing is
/// ready and nothing is in flight.
async fn finalize(
    inner: &Arc<EngineInner>,
    mut resolution: Resolution,
    mut task: Task,
    variables: &HashMap<String, Value>,
) -> EngineResult<()> {
    let mut messages = Vec::new();
    settle_foreach_parents(&mut resolution, &task, &mut messages);

    let mut has_fatal = false;
    let mut has_client = false;
    let mut has_exhausted = false;
    let mut has_waiting = false;
    let mut has_pending = false;
    for step in resolution.steps.values() {
        match step.published_state(&resolution.steps) {
            StepState::Fatal => has_fatal = true,
            StepState::ClientError => has_client = true,
            StepState::ServerError | StepState::AfterrunError => has_exhausted = true,
            StepState::Waiting => has_waiting = true,
            StepState::ToRetry | StepState::Todo | StepState::Running | StepState::Expanded => {
                has_pending = true
            }
            StepState::Done | StepState::Prune | StepState::Custom(_) => {}
        }
    }

    let new_state = if has_fatal {
        ResolutionState::BlockedFatal
    } else if has_client {
        ResolutionState::BlockedBadrequest
    } else if has_exhausted {
        ResolutionState::BlockedMaxretries
    } else if has_waiting {
        ResolutionState::Waiting
    } else if has_pending {
        ResolutionState::ToAutorun
    } else {
        ResolutionState::Done
    };

    resolution.state = new_state;
    if new_state == ResolutionState::ToAutorun {
        resolution.next_retry = Some(resolution.earliest_retry().unwrap_or_else(Utc::now));
    }
    let mut result_rendered = false;
    if new_state == ResolutionState::Done
        && task.result.is_none()
        && let Some(template) = inner.templates.get(&task.template_name)
        && let Some(format) = &template.result_format
    {
        let ctx = resolution.build_context(&task, variables);
        match ctx.expand_value(format) {
            Ok(result) => {
                task.result = Some(result);
                result_rendered = true;
            }
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "result format rendering failed");
            }
        }
    }
    inner.store.update_resolution(&resolution).await?;
    flush_messages(inner, &mut messages);

    let new_task_state = match new_state {
        ResolutionState::Done => TaskState::Done,
        ResolutionState::BlockedFatal
        | ResolutionState::BlockedBadrequest
        | ResolutionState::BlockedMaxretries => TaskState::Blocked,
        ResolutionState::Waiting | ResolutionState::ToAutorun => TaskState::Waiting,
        _ => task.state,
    };
    if task.state != new_task_state || result_rendered {
        task.state = new_task_state;
        inner.store.update_task(&task).await?;
        inner.publish_task_state(&task, resolution.resolver_username.as_deref());
    }
    metrics::counter!("cairn_resolutions_finalized_total", "state" => new_state.as_str())
        .increment(1);

    if task.state.is_settled() {
        resume_parent(inner, &task).await;
    }
    Ok(())
}

/// A settled subtask wakes the task that spawned it, unless batch siblings
/// are still running.
async fn resume_parent(inner: &Arc<EngineInner>, task: &Task) {
    let Some(parent_id) = task.parent_task_id() else {
        return;
    };
    if let Some(batch_id) = task.batch_id {
        match inner.store.running_batch_siblings(batch_id, task.id).await {
            Ok(0) => {}
            Ok(_) => return,
            Err(err) => {
                warn!(batch_id = %batch_id, error = %err, "sibling check failed");
                return;
            }
        }
    }
    let parent = match inner.store.get_task(parent_id).await {
        Ok(parent) => parent,
        Err(err) => {
            warn!(parent_id = %parent_id, error = %err, "parent task lookup failed");
            return;
        }
    };
    if !matches!(
        parent.state,
        TaskState::Blocked | TaskState::Running | TaskState::Waiting
    ) {
        return;
    }
    let Some(resolution_id) = parent.resolution_id else {
        return;
    };
    match inner.store.resolution_state(resolution_id).await {
        Ok(ResolutionState::Crashed | ResolutionState::Paused) => {}
        Ok(_) => {
            if inner.submit_tx.try_send(resolution_id).is_err() {
                debug!(resolution_id = %resolution_id, "submission queue full, collector will retry");
            }
        }
        Err(err) => {
            warn!(resolution_id = %resolution_id, error = %err, "parent resolution lookup failed");
        }
    }
}
