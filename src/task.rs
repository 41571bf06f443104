//! Tasks and batches.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::template::TaskTemplate;
use crate::value::ValueContext;

/// Tag linking a subtask back to the task that spawned it. A parent is
/// resumed once the subtask (and its batch siblings, if any) settle.
pub const PARENT_TASK_TAG: &str = "parent_task_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Todo,
    Blocked,
    Running,
    Waiting,
    Done,
    Cancelled,
    Wontfix,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Todo => "TODO",
            TaskState::Blocked => "BLOCKED",
            TaskState::Running => "RUNNING",
            TaskState::Waiting => "WAITING",
            TaskState::Done => "DONE",
            TaskState::Cancelled => "CANCELLED",
            TaskState::Wontfix => "WONTFIX",
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Cancelled | TaskState::Wontfix
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sibling-task grouping. A parent task waiting on a batch resumes only once
/// no sibling is still running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

/// A submitted work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub template_name: String,
    pub title: String,
    pub requester_username: String,
    #[serde(default)]
    pub watcher_usernames: Vec<String>,
    #[serde(default)]
    pub watcher_groups: Vec<String>,
    #[serde(default)]
    pub resolver_usernames: Vec<String>,
    #[serde(default)]
    pub resolver_groups: Vec<String>,
    pub input: Value,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub batch_id: Option<Uuid>,
    /// The current resolution, if one exists.
    #[serde(default)]
    pub resolution_id: Option<Uuid>,
    pub state: TaskState,
    #[serde(default)]
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Instantiate a task from a template, validating the input map and
    /// rendering the title.
    pub fn from_template(
        template: &TaskTemplate,
        input: &Value,
        requester_username: &str,
        tags: HashMap<String, String>,
        batch_id: Option<Uuid>,
    ) -> EngineResult<Self> {
        if template.blocked {
            return Err(EngineError::BadRequest(format!(
                "template {} is not available (blocked)",
                template.name
            )));
        }
        let input = template
            .validate_inputs(input)
            .map_err(|err| EngineError::BadRequest(err.to_string()))?;

        let mut ctx = ValueContext::new(input.clone(), Value::Null);
        ctx.set_variables(template.variables.clone());
        let title = match &template.title_format {
            Some(format) => ctx
                .expand_text(format)
                .map_err(|err| EngineError::BadRequest(err.to_string()))?,
            None => template.name.clone(),
        };

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            template_name: template.name.clone(),
            title,
            requester_username: requester_username.to_string(),
            watcher_usernames: Vec::new(),
            watcher_groups: Vec::new(),
            resolver_usernames: template.allowed_resolver_usernames.clone(),
            resolver_groups: template.allowed_resolver_groups.clone(),
            input,
            tags,
            batch_id,
            resolution_id: None,
            state: TaskState::Todo,
            result: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn parent_task_id(&self) -> Option<Uuid> {
        self.tags
            .get(PARENT_TASK_TAG)
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TEMPLATE: &str = r#"
name: restart
title_format: "restart {{ input.service }}"
auto_runnable: true
inputs:
  - name: service
    type: string
steps:
  restart:
    action:
      type: echo
      configuration: {output: ok}
"#;

    #[test]
    fn from_template_renders_title_and_validates_input() {
        let template = TaskTemplate::from_yaml(TEMPLATE).expect("template");
        let task = Task::from_template(
            &template,
            &json!({"service": "billing"}),
            "jdoe",
            HashMap::new(),
            None,
        )
        .expect("task");
        assert_eq!(task.title, "restart billing");
        assert_eq!(task.state, TaskState::Todo);

        let err = Task::from_template(&template, &json!({}), "jdoe", HashMap::new(), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::BadRequest(_)));
    }

    #[test]
    fn blocked_template_is_rejected() {
        let mut template = TaskTemplate::from_yaml(TEMPLATE).expect("template");
        template.blocked = true;
        let err = Task::from_template(
            &template,
            &json!({"service": "billing"}),
            "jdoe",
            HashMap::new(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::BadRequest(_)));
    }

    #[test]
    fn parent_task_tag_round_trips() {
        let template = TaskTemplate::from_yaml(TEMPLATE).expect("template");
        let parent = Uuid::new_v4();
        let task = Task::from_template(
            &template,
            &json!({"service": "billing"}),
            "jdoe",
            HashMap::from([(PARENT_TASK_TAG.to_string(), parent.to_string())]),
            None,
        )
        .expect("task");
        assert_eq!(task.parent_task_id(), Some(parent));
    }
}
