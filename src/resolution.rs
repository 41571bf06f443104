//! Resolutions: the mutable execution state of one task.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::step::{Step, StepState};
use crate::task::Task;
use crate::template::TaskTemplate;
use crate::value::ValueContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionState {
    Todo,
    Running,
    Waiting,
    Paused,
    Cancelled,
    Crashed,
    Done,
    Error,
    BlockedBadrequest,
    BlockedFatal,
    BlockedMaxretries,
    ToAutorun,
    RetryNow,
}

impl ResolutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionState::Todo => "TODO",
            ResolutionState::Running => "RUNNING",
            ResolutionState::Waiting => "WAITING",
            ResolutionState::Paused => "PAUSED",
            ResolutionState::Cancelled => "CANCELLED",
            ResolutionState::Crashed => "CRASHED",
            ResolutionState::Done => "DONE",
            ResolutionState::Error => "ERROR",
            ResolutionState::BlockedBadrequest => "BLOCKED_BADREQUEST",
            ResolutionState::BlockedFatal => "BLOCKED_FATAL",
            ResolutionState::BlockedMaxretries => "BLOCKED_MAXRETRIES",
            ResolutionState::ToAutorun => "TO_AUTORUN",
            ResolutionState::RetryNow => "RETRY_NOW",
        }
    }

    /// States a scheduler pass refuses to pick up.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResolutionState::Done
                | ResolutionState::Cancelled
                | ResolutionState::BlockedBadrequest
                | ResolutionState::BlockedFatal
                | ResolutionState::BlockedMaxretries
        )
    }

    /// Whether a scheduler pass may drive this resolution forward. CRASHED is
    /// excluded: the retry collector re-arms it first.
    pub fn is_runnable(&self) -> bool {
        matches!(
            self,
            ResolutionState::Todo
                | ResolutionState::Running
                | ResolutionState::Waiting
                | ResolutionState::Error
                | ResolutionState::ToAutorun
                | ResolutionState::RetryNow
        )
    }
}

impl fmt::Display for ResolutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The live execution state of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub state: ResolutionState,
    /// Step map, including generated foreach children. Ordered so scheduling
    /// and persistence are deterministic.
    pub steps: BTreeMap<String, Step>,
    pub crypto_key_version: u32,
    #[serde(default)]
    pub last_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_retry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u32,
    #[serde(default)]
    pub steps_pass: u32,
    #[serde(default)]
    pub resolver_username: Option<String>,
    #[serde(default)]
    pub resolver_input: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resolution {
    /// Build the resolution for a task from its template.
    pub fn create(
        template: &TaskTemplate,
        task: &Task,
        resolver_username: Option<&str>,
        resolver_input: &Value,
        auto: bool,
        run_after: Option<DateTime<Utc>>,
    ) -> EngineResult<Self> {
        if task.template_name != template.name {
            return Err(EngineError::BadRequest(format!(
                "task {} was created from template {}, not {}",
                task.id, task.template_name, template.name
            )));
        }
        let resolver_input = template
            .validate_resolver_inputs(resolver_input)
            .map_err(|err| EngineError::BadRequest(err.to_string()))?;

        let mut steps = BTreeMap::new();
        for (name, spec) in &template.steps {
            steps.insert(
                name.clone(),
                Step::from_spec(name, spec, crate::config::DEFAULT_MAX_RETRIES),
            );
        }

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            task_id: task.id,
            state: if auto {
                ResolutionState::ToAutorun
            } else {
                ResolutionState::Todo
            },
            steps,
            crypto_key_version: 0,
            last_start: None,
            next_retry: run_after,
            run_count: 0,
            steps_pass: 0,
            resolver_username: resolver_username.map(str::to_string),
            resolver_input,
            created_at: now,
            updated_at: now,
        })
    }

    /// Snapshot the value tree for template expansion, with every step's
    /// published result recorded.
    pub fn build_context(
        &self,
        task: &Task,
        variables: &std::collections::HashMap<String, Value>,
    ) -> ValueContext {
        let mut ctx = ValueContext::new(task.input.clone(), self.resolver_input.clone());
        if !variables.is_empty() {
            ctx.set_variables(variables.clone());
        }
        ctx.set_task_attr("id", json!(task.id));
        ctx.set_task_attr("title", json!(task.title));
        ctx.set_task_attr("state", json!(task.state.as_str()));
        ctx.set_task_attr("template_name", json!(task.template_name));
        ctx.set_task_attr("requester_username", json!(task.requester_username));
        if let Some(resolver) = &self.resolver_username {
            ctx.set_task_attr("resolver_username", json!(resolver));
        }
        ctx.set_task_attr("created_at", json!(task.created_at));
        ctx.set_task_attr("tags", json!(task.tags));

        for (name, step) in &self.steps {
            let children = step.children.as_ref().map(|names| {
                Value::Array(
                    names
                        .iter()
                        .filter_map(|child| self.steps.get(child))
                        .map(|child| child.output.clone())
                        .collect(),
                )
            });
            ctx.record_step(
                name,
                step.published_state(&self.steps).as_str(),
                &step.output,
                &step.metadata,
                step.error.as_deref(),
                children.as_ref(),
                &step.tags,
            );
        }
        ctx
    }

    /// The smallest `run_after` among retry-armed steps.
    pub fn earliest_retry(&self) -> Option<DateTime<Utc>> {
        self.steps
            .values()
            .filter(|step| step.state == StepState::ToRetry)
            .filter_map(|step| step.run_after)
            .min()
    }

    /// Raise every step's retry budget by `delta`, capped.
    pub fn extend_retries(&mut self, delta: u32, cap: u32) {
        for step in self.steps.values_mut() {
            step.max_retries = step.max_retries.saturating_add(delta).min(cap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    const TEMPLATE: &str = r#"
name: fanout
auto_runnable: true
inputs:
  - name: items
    type: array
steps:
  fan:
    foreach: "{{ input.items }}"
    action:
      type: echo
      configuration: {output: "{{ iterator }}"}
  wrap:
    dependencies: [fan]
    action:
      type: echo
      configuration: {output: done}
"#;

    fn fixture() -> (TaskTemplate, Task, Resolution) {
        let template = TaskTemplate::from_yaml(TEMPLATE).expect("template");
        let task = Task::from_template(
            &template,
            &json!({"items": [1, 2]}),
            "jdoe",
            HashMap::new(),
            None,
        )
        .expect("task");
        let resolution =
            Resolution::create(&template, &task, None, &Value::Null, true, None).expect("resolution");
        (template, task, resolution)
    }

    #[test]
    fn create_builds_steps_and_auto_state() {
        let (_, _, resolution) = fixture();
        assert_eq!(resolution.state, ResolutionState::ToAutorun);
        assert_eq!(resolution.steps.len(), 2);
        assert_eq!(resolution.steps["fan"].state, StepState::Todo);
    }

    #[test]
    fn context_exposes_children_outputs() {
        let (_, task, mut resolution) = fixture();
        let items = vec![json!(1), json!(2)];
        let children: Vec<Step> = items
            .iter()
            .enumerate()
            .map(|(index, item)| resolution.steps["fan"].spawn_child(index, item.clone()))
            .collect();
        let names: Vec<String> = children.iter().map(|child| child.name.clone()).collect();
        for mut child in children {
            child.state = StepState::Done;
            child.output = child.iterator.clone().unwrap_or(Value::Null);
            resolution.steps.insert(child.name.clone(), child);
        }
        let fan = resolution.steps.get_mut("fan").expect("fan");
        fan.state = StepState::Expanded;
        fan.children = Some(names);

        let ctx = resolution.build_context(&task, &HashMap::new());
        assert_eq!(
            ctx.expand_str("{{ step.fan.children }}").expect("expand"),
            json!([1, 2])
        );
        assert_eq!(
            ctx.expand_str("{{ step.fan.state }}").expect("expand"),
            json!("DONE")
        );
    }

    #[test]
    fn earliest_retry_is_min_over_armed_steps() {
        let (_, _, mut resolution) = fixture();
        let now = Utc::now();
        {
            let fan = resolution.steps.get_mut("fan").expect("fan");
            fan.state = StepState::ToRetry;
            fan.run_after = Some(now + chrono::Duration::seconds(30));
        }
        {
            let wrap = resolution.steps.get_mut("wrap").expect("wrap");
            wrap.state = StepState::ToRetry;
            wrap.run_after = Some(now + chrono::Duration::seconds(10));
        }
        assert_eq!(
            resolution.earliest_retry(),
            Some(now + chrono::Duration::seconds(10))
        );
    }

    #[test]
    fn extend_retries_is_capped() {
        let (_, _, mut resolution) = fixture();
        resolution.extend_retries(100, 120);
        assert!(
            resolution
                .steps
                .values()
                .all(|step| step.max_retries == 120)
        );
    }
}
