//! Per-step execution state and transitions.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::condition::StepCondition;
use crate::retry::RetryPattern;
use crate::runner::{RunnerError, RunnerOutput};
use crate::template::{ActionSpec, ForeachStrategy, StepSpec};

/// Lifecycle state of one step.
///
/// `Expanded` is the marker a foreach parent carries while its children run;
/// the state reported outward for such a parent is the derived aggregate of
/// its children. `Custom` covers states a template declares through
/// `custom_states` and assigns via `set_state` conditions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StepState {
    Todo,
    Running,
    Done,
    ClientError,
    ServerError,
    Fatal,
    AfterrunError,
    ToRetry,
    Waiting,
    Prune,
    Expanded,
    Custom(String),
}

impl StepState {
    pub fn as_str(&self) -> &str {
        match self {
            StepState::Todo => "TODO",
            StepState::Running => "RUNNING",
            StepState::Done => "DONE",
            StepState::ClientError => "CLIENT_ERROR",
            StepState::ServerError => "SERVER_ERROR",
            StepState::Fatal => "FATAL",
            StepState::AfterrunError => "AFTERRUN_ERROR",
            StepState::ToRetry => "TO_RETRY",
            StepState::Waiting => "WAITING",
            StepState::Prune => "PRUNE",
            StepState::Expanded => "EXPANDED",
            StepState::Custom(name) => name,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "TODO" => StepState::Todo,
            "RUNNING" => StepState::Running,
            "DONE" => StepState::Done,
            "CLIENT_ERROR" => StepState::ClientError,
            "SERVER_ERROR" => StepState::ServerError,
            "FATAL" => StepState::Fatal,
            "AFTERRUN_ERROR" => StepState::AfterrunError,
            "TO_RETRY" => StepState::ToRetry,
            "WAITING" => StepState::Waiting,
            "PRUNE" => StepState::Prune,
            "EXPANDED" => StepState::Expanded,
            other => StepState::Custom(other.to_string()),
        }
    }

    /// Whether the step will not move again without external intervention.
    ///
    /// `SERVER_ERROR` and `AFTERRUN_ERROR` are final because a step with
    /// retry budget left is re-armed to `TO_RETRY` within the same
    /// transition; if one of these states persists, the budget is exhausted.
    pub fn is_final(&self) -> bool {
        !matches!(
            self,
            StepState::Todo
                | StepState::Running
                | StepState::ToRetry
                | StepState::Waiting
                | StepState::Expanded
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            StepState::ClientError
                | StepState::ServerError
                | StepState::Fatal
                | StepState::AfterrunError
        )
    }

    /// Severity ranking used to derive a foreach parent's state from its
    /// children: the worst child wins.
    pub fn severity(&self) -> u8 {
        match self {
            StepState::Fatal => 10,
            StepState::ClientError => 9,
            StepState::ServerError => 8,
            StepState::AfterrunError => 7,
            StepState::Waiting => 6,
            StepState::Running | StepState::Expanded => 5,
            StepState::ToRetry => 4,
            StepState::Todo => 3,
            StepState::Prune => 1,
            StepState::Done | StepState::Custom(_) => 0,
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StepState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StepState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(StepState::parse(&raw))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid dependency clause {0:?}")]
pub struct DependencyParseError(pub String);

/// A dependency on another step, with the predecessor states that satisfy it.
///
/// Written `name`, `name:STATE` or `name:STATE1,STATE2`; the default required
/// set is `{DONE}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyClause {
    pub step: String,
    pub states: Vec<StepState>,
}

impl DependencyClause {
    pub fn parse(raw: &str) -> Result<Self, DependencyParseError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(DependencyParseError(raw.to_string()));
        }
        match raw.split_once(':') {
            None => Ok(Self {
                step: raw.to_string(),
                states: vec![StepState::Done],
            }),
            Some((step, states)) => {
                let step = step.trim();
                let states: Vec<StepState> = states
                    .split(',')
                    .map(str::trim)
                    .filter(|state| !state.is_empty())
                    .map(StepState::parse)
                    .collect();
                if step.is_empty() || states.is_empty() {
                    return Err(DependencyParseError(raw.to_string()));
                }
                Ok(Self {
                    step: step.to_string(),
                    states,
                })
            }
        }
    }

    pub fn satisfied_by(&self, state: &StepState) -> bool {
        self.states.contains(state)
    }
}

impl fmt::Display for DependencyClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.states == [StepState::Done] {
            return f.write_str(&self.step);
        }
        let states: Vec<&str> = self.states.iter().map(StepState::as_str).collect();
        write!(f, "{}:{}", self.step, states.join(","))
    }
}

impl Serialize for DependencyClause {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DependencyClause {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DependencyClause::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Readiness of a step's dependency set against the current step map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyStatus {
    /// Every dependency is final and inside its required state set.
    Ready,
    /// Some dependency has not reached a final state yet.
    Pending,
    /// A dependency settled outside its required state set.
    Mismatch { dependency: String },
}

/// One unit of work inside a resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub action: ActionSpec,
    #[serde(default)]
    pub dependencies: Vec<DependencyClause>,
    pub state: StepState,
    #[serde(default)]
    pub try_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub retry_pattern: RetryPattern,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<StepCondition>,
    #[serde(default)]
    pub custom_states: Vec<String>,
    #[serde(default)]
    pub foreach: Option<String>,
    #[serde(default)]
    pub foreach_strategy: ForeachStrategy,
    /// Rendered foreach list, kept once the parent expanded.
    #[serde(default)]
    pub foreach_result: Option<Value>,
    /// Child step names, in fan-out order.
    #[serde(default)]
    pub children: Option<Vec<String>>,
    /// The foreach item assigned to this child.
    #[serde(default)]
    pub iterator: Option<Value>,
    /// Name of the foreach parent, for children.
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub pre_hook: Option<ActionSpec>,
}

impl Step {
    pub fn from_spec(name: &str, spec: &StepSpec, default_max_retries: u32) -> Self {
        Self {
            name: name.to_string(),
            description: spec.description.clone(),
            action: spec.action.clone(),
            dependencies: spec.dependencies.clone(),
            state: StepState::Todo,
            try_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            retry_pattern: spec.retry_pattern,
            last_run: None,
            run_after: None,
            output: Value::Null,
            metadata: Value::Null,
            error: None,
            tags: spec.tags.clone(),
            resources: spec.resources.clone(),
            conditions: spec.conditions.clone(),
            custom_states: spec.custom_states.clone(),
            foreach: spec.foreach.clone(),
            foreach_strategy: spec.foreach_strategy,
            foreach_result: None,
            children: None,
            iterator: None,
            parent: None,
            pre_hook: spec.pre_hook.clone(),
        }
    }

    /// Build the child record for one foreach item.
    pub fn spawn_child(&self, index: usize, item: Value) -> Step {
        let mut child = self.clone();
        child.name = child_name(&self.name, index);
        child.dependencies = Vec::new();
        child.foreach = None;
        child.foreach_result = None;
        child.children = None;
        child.iterator = Some(item);
        child.parent = Some(self.name.clone());
        child.state = StepState::Todo;
        child.try_count = 0;
        child.last_run = None;
        child.run_after = None;
        child.output = Value::Null;
        child.metadata = Value::Null;
        child.error = None;
        child
    }

    pub fn is_foreach_parent(&self) -> bool {
        self.foreach.is_some()
    }

    /// Check this step's dependency clauses against the resolution's steps.
    pub fn dependency_status(&self, steps: &BTreeMap<String, Step>) -> DependencyStatus {
        for clause in &self.dependencies {
            let Some(dependency) = steps.get(&clause.step) else {
                return DependencyStatus::Mismatch {
                    dependency: clause.step.clone(),
                };
            };
            let state = dependency.published_state(steps);
            if !state.is_final() {
                return DependencyStatus::Pending;
            }
            if !clause.satisfied_by(&state) {
                return DependencyStatus::Mismatch {
                    dependency: clause.step.clone(),
                };
            }
        }
        DependencyStatus::Ready
    }

    /// State this step exposes to dependents and to the value context. For a
    /// foreach parent that has expanded, this is the aggregate of its
    /// children.
    pub fn published_state(&self, steps: &BTreeMap<String, Step>) -> StepState {
        if self.state != StepState::Expanded {
            return self.state.clone();
        }
        let Some(children) = &self.children else {
            return StepState::Expanded;
        };
        aggregate_children(children.iter().filter_map(|name| steps.get(name)))
    }

    /// Mark the step dispatched; one runner invocation is now charged.
    pub fn mark_dispatched(&mut self, now: DateTime<Utc>) {
        self.state = StepState::Running;
        self.try_count += 1;
        self.last_run = Some(now);
        self.run_after = None;
    }

    pub fn mark_client_error(&mut self, message: impl Into<String>) {
        self.state = StepState::ClientError;
        self.error = Some(message.into());
    }

    /// Apply a finished runner invocation, including the retry decision for
    /// retryable failures.
    pub fn apply_exec(&mut self, result: Result<RunnerOutput, RunnerError>) {
        match result {
            Ok(done) => {
                self.state = StepState::Done;
                self.output = done.output;
                self.metadata = done.metadata;
                self.error = None;
            }
            Err(err) => {
                self.error = Some(err.to_string());
                self.state = match err {
                    RunnerError::Transient(_) => StepState::ServerError,
                    RunnerError::Permanent(_) => StepState::ClientError,
                    RunnerError::Fatal(_) => StepState::Fatal,
                    RunnerError::AsyncWait(_) => StepState::Waiting,
                };
                if self.state == StepState::ServerError {
                    self.arm_retry();
                }
            }
        }
    }

    /// Re-arm a retryable failure while budget remains.
    pub fn arm_retry(&mut self) -> bool {
        if self.try_count > self.max_retries {
            return false;
        }
        let base = self.last_run.unwrap_or_else(Utc::now);
        self.run_after = Some(base + self.retry_pattern.delay(self.try_count));
        self.state = StepState::ToRetry;
        true
    }

    /// Promote a due retry back to TODO.
    pub fn promote_retry(&mut self, now: DateTime<Utc>) -> bool {
        if self.state != StepState::ToRetry {
            return false;
        }
        if self.run_after.is_some_and(|due| due > now) {
            return false;
        }
        self.state = StepState::Todo;
        true
    }
}

pub fn child_name(parent: &str, index: usize) -> String {
    format!("{parent}-{index}")
}

/// Derive a foreach parent's state from its children.
pub fn aggregate_children<'a>(children: impl Iterator<Item = &'a Step>) -> StepState {
    let mut worst: Option<StepState> = None;
    for child in children {
        let state = child.state.clone();
        worst = Some(match worst {
            None => state,
            Some(current) if state.severity() > current.severity() => state,
            Some(current) => current,
        });
    }
    match worst {
        None => StepState::Done,
        Some(state) if state.severity() == 0 || state == StepState::Prune => StepState::Done,
        Some(state) => state,
    }
}
