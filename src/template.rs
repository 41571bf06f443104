//! Declarative task templates.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::{StepCondition, ThenAction};
use crate::retry::RetryPattern;
use crate::step::{DependencyClause, StepState};

#[derive(Debug, thiserror::Error)]
pub enum TemplateDefError {
    #[error("invalid template document: {0}")]
    Parse(String),
    #[error("invalid template {template}: {detail}")]
    Invalid { template: String, detail: String },
}

/// Runner invocation declared on a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(rename = "type")]
    pub runner_type: String,
    #[serde(default)]
    pub configuration: Value,
    /// Name of a shared configuration block merged under `configuration`.
    #[serde(default)]
    pub base_configuration: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForeachStrategy {
    #[default]
    Parallel,
    Sequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    String,
    Number,
    Bool,
    Object,
    Array,
}

/// Typed input declaration on a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: InputType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub legal_values: Vec<Value>,
}

impl InputSpec {
    fn accepts(&self, value: &Value) -> bool {
        match self.kind {
            InputType::String => value.is_string(),
            InputType::Number => value.is_number(),
            InputType::Bool => value.is_boolean(),
            InputType::Object => value.is_object(),
            InputType::Array => value.is_array(),
        }
    }
}

/// Declarative step definition inside a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(default)]
    pub description: Option<String>,
    pub action: ActionSpec,
    #[serde(default)]
    pub dependencies: Vec<DependencyClause>,
    #[serde(default)]
    pub retry_pattern: RetryPattern,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<StepCondition>,
    #[serde(default)]
    pub custom_states: Vec<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub foreach: Option<String>,
    #[serde(default)]
    pub foreach_strategy: ForeachStrategy,
    #[serde(default)]
    pub pre_hook: Option<ActionSpec>,
    /// Advisory schema for the step output.
    #[serde(default)]
    pub json_schema: Option<Value>,
}

/// Declarative recipe for producing a resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub long_description: Option<String>,
    #[serde(default)]
    pub doc_link: Option<String>,
    #[serde(default)]
    pub title_format: Option<String>,
    #[serde(default)]
    pub result_format: Option<Value>,
    #[serde(default)]
    pub allowed_resolver_usernames: Vec<String>,
    #[serde(default)]
    pub allowed_resolver_groups: Vec<String>,
    #[serde(default)]
    pub allow_all_resolver_usernames: bool,
    #[serde(default)]
    pub auto_runnable: bool,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub resolver_inputs: Vec<InputSpec>,
    /// Reusable expressions exposed as `var.<name>`.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub steps: HashMap<String, StepSpec>,
}

impl TaskTemplate {
    pub fn from_yaml(document: &str) -> Result<Self, TemplateDefError> {
        let template: TaskTemplate = serde_yaml::from_str(document)
            .map_err(|err| TemplateDefError::Parse(err.to_string()))?;
        template.validate()?;
        Ok(template)
    }

    pub fn from_json(document: &str) -> Result<Self, TemplateDefError> {
        let template: TaskTemplate = serde_json::from_str(document)
            .map_err(|err| TemplateDefError::Parse(err.to_string()))?;
        template.validate()?;
        Ok(template)
    }

    fn invalid(&self, detail: impl Into<String>) -> TemplateDefError {
        TemplateDefError::Invalid {
            template: self.name.clone(),
            detail: detail.into(),
        }
    }

    /// Structural validation: dependency targets and states, acyclicity,
    /// condition targets.
    pub fn validate(&self) -> Result<(), TemplateDefError> {
        if self.name.is_empty() {
            return Err(self.invalid("template name must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(self.invalid("template declares no steps"));
        }

        for (name, spec) in &self.steps {
            for clause in &spec.dependencies {
                let Some(target) = self.steps.get(&clause.step) else {
                    return Err(self.invalid(format!(
                        "step {name} depends on unknown step {}",
                        clause.step
                    )));
                };
                for state in &clause.states {
                    if !dependency_state_allowed(state, target) {
                        return Err(self.invalid(format!(
                            "step {name} requires undeclared state {state} of step {}",
                            clause.step
                        )));
                    }
                }
            }
            for condition in &spec.conditions {
                match &condition.then {
                    ThenAction::Skip(targets) => {
                        for target in targets {
                            if !self.steps.contains_key(target) {
                                return Err(self.invalid(format!(
                                    "step {name} condition skips unknown step {target}"
                                )));
                            }
                        }
                    }
                    ThenAction::SetState(targets) => {
                        for (target, state) in targets {
                            let Some(target_spec) = self.steps.get(target) else {
                                return Err(self.invalid(format!(
                                    "step {name} condition sets state of unknown step {target}"
                                )));
                            };
                            let state = StepState::parse(state);
                            if let StepState::Custom(custom) = &state
                                && !target_spec.custom_states.contains(custom)
                            {
                                return Err(self.invalid(format!(
                                    "step {name} condition sets undeclared state {custom} on {target}"
                                )));
                            }
                        }
                    }
                    ThenAction::Check => {}
                }
            }
        }

        self.reject_cycles()
    }

    fn reject_cycles(&self) -> Result<(), TemplateDefError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Visited,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        for start in self.steps.keys() {
            if marks.contains_key(start.as_str()) {
                continue;
            }
            // Iterative DFS; a back edge to a Visiting node is a cycle.
            let mut stack: Vec<(&str, bool)> = vec![(start.as_str(), false)];
            while let Some((name, expanded)) = stack.pop() {
                if expanded {
                    marks.insert(name, Mark::Visited);
                    continue;
                }
                match marks.get(name) {
                    Some(Mark::Visited) => continue,
                    Some(Mark::Visiting) => {
                        return Err(self.invalid(format!("dependency cycle through step {name}")));
                    }
                    None => {}
                }
                marks.insert(name, Mark::Visiting);
                stack.push((name, true));
                if let Some(spec) = self.steps.get(name) {
                    for clause in &spec.dependencies {
                        match marks.get(clause.step.as_str()) {
                            Some(Mark::Visiting) => {
                                return Err(self.invalid(format!(
                                    "dependency cycle through step {}",
                                    clause.step
                                )));
                            }
                            Some(Mark::Visited) => {}
                            None => stack.push((clause.step.as_str(), false)),
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Validate a submitted input map against the declared inputs and fill in
    /// defaults. Unknown keys are rejected.
    pub fn validate_inputs(&self, submitted: &Value) -> Result<Value, TemplateDefError> {
        validate_input_specs(self, &self.inputs, submitted, "input")
    }

    pub fn validate_resolver_inputs(&self, submitted: &Value) -> Result<Value, TemplateDefError> {
        validate_input_specs(self, &self.resolver_inputs, submitted, "resolver input")
    }
}

/// Process-wide template lookup, populated at boot and read-only afterwards.
#[derive(Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, std::sync::Arc<TaskTemplate>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, template: TaskTemplate) -> Result<(), TemplateDefError> {
        template.validate()?;
        let name = template.name.clone();
        if self
            .templates
            .insert(name.clone(), std::sync::Arc::new(template))
            .is_some()
        {
            return Err(TemplateDefError::Invalid {
                template: name,
                detail: "template already registered".to_string(),
            });
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<std::sync::Arc<TaskTemplate>> {
        self.templates.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }
}

fn dependency_state_allowed(state: &StepState, target: &StepSpec) -> bool {
    match state {
        StepState::Custom(custom) => target.custom_states.contains(custom),
        other => other.is_final(),
    }
}

fn validate_input_specs(
    template: &TaskTemplate,
    specs: &[InputSpec],
    submitted: &Value,
    label: &str,
) -> Result<Value, TemplateDefError> {
    let empty = serde_json::Map::new();
    let submitted = match submitted {
        Value::Null => &empty,
        Value::Object(map) => map,
        _ => {
            return Err(TemplateDefError::Invalid {
                template: template.name.clone(),
                detail: format!("{label} must be an object"),
            });
        }
    };

    let declared: HashSet<&str> = specs.iter().map(|spec| spec.name.as_str()).collect();
    for key in submitted.keys() {
        if !declared.contains(key.as_str()) {
            return Err(TemplateDefError::Invalid {
                template: template.name.clone(),
                detail: format!("unexpected {label} field {key}"),
            });
        }
    }

    let mut normalized = serde_json::Map::new();
    for spec in specs {
        let value = match submitted.get(&spec.name) {
            Some(value) => value.clone(),
            None => match &spec.default {
                Some(default) => default.clone(),
                None if spec.optional => continue,
                None => {
                    return Err(TemplateDefError::Invalid {
                        template: template.name.clone(),
                        detail: format!("missing required {label} field {}", spec.name),
                    });
                }
            },
        };
        if !spec.accepts(&value) {
            return Err(TemplateDefError::Invalid {
                template: template.name.clone(),
                detail: format!("{label} field {} has the wrong type", spec.name),
            });
        }
        if !spec.legal_values.is_empty() && !spec.legal_values.contains(&value) {
            return Err(TemplateDefError::Invalid {
                template: template.name.clone(),
                detail: format!("{label} field {} not in legal values", spec.name),
            });
        }
        normalized.insert(spec.name.clone(), value);
    }
    Ok(Value::Object(normalized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LINEAR: &str = r#"
name: deploy
description: roll a service
auto_runnable: true
allow_all_resolver_usernames: true
inputs:
  - name: service
    type: string
  - name: replicas
    type: number
    optional: true
    default: 2
steps:
  build:
    action:
      type: echo
      configuration:
        output: {built: true}
  release:
    dependencies: [build]
    action:
      type: echo
      configuration:
        output: {released: "{{ input.service }}"}
"#;

    #[test]
    fn parses_and_validates_yaml() {
        let template = TaskTemplate::from_yaml(LINEAR).expect("parse");
        assert_eq!(template.name, "deploy");
        assert_eq!(template.steps.len(), 2);
        assert_eq!(
            template.steps["release"].dependencies[0].step,
            "build".to_string()
        );
    }

    #[test]
    fn rejects_unknown_dependency() {
        let mut template = TaskTemplate::from_yaml(LINEAR).expect("parse");
        template
            .steps
            .get_mut("build")
            .expect("build")
            .dependencies
            .push(DependencyClause::parse("ghost").expect("clause"));
        let err = template.validate().unwrap_err();
        assert!(err.to_string().contains("unknown step ghost"));
    }

    #[test]
    fn rejects_dependency_cycles() {
        let mut template = TaskTemplate::from_yaml(LINEAR).expect("parse");
        template
            .steps
            .get_mut("build")
            .expect("build")
            .dependencies
            .push(DependencyClause::parse("release").expect("clause"));
        let err = template.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn rejects_undeclared_dependency_state() {
        let mut template = TaskTemplate::from_yaml(LINEAR).expect("parse");
        template
            .steps
            .get_mut("release")
            .expect("release")
            .dependencies[0] = DependencyClause::parse("build:SIGNED_OFF").expect("clause");
        assert!(template.validate().is_err());

        template
            .steps
            .get_mut("build")
            .expect("build")
            .custom_states
            .push("SIGNED_OFF".to_string());
        template.validate().expect("declared custom state is fine");
    }

    #[test]
    fn input_validation_fills_defaults_and_rejects_unknown() {
        let template = TaskTemplate::from_yaml(LINEAR).expect("parse");

        let normalized = template
            .validate_inputs(&json!({"service": "billing"}))
            .expect("validate");
        assert_eq!(normalized, json!({"service": "billing", "replicas": 2}));

        assert!(template.validate_inputs(&json!({})).is_err());
        assert!(
            template
                .validate_inputs(&json!({"service": "billing", "bogus": 1}))
                .is_err()
        );
        assert!(
            template
                .validate_inputs(&json!({"service": 42}))
                .is_err()
        );
    }

    #[test]
    fn legal_values_are_enforced() {
        let mut template = TaskTemplate::from_yaml(LINEAR).expect("parse");
        template.inputs[0].legal_values = vec![json!("billing"), json!("catalog")];
        assert!(template.validate_inputs(&json!({"service": "billing"})).is_ok());
        assert!(template.validate_inputs(&json!({"service": "other"})).is_err());
    }
}
