//! Conditional branches evaluated around step execution.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::value::{TemplateError, ValueContext};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConditionError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("invalid regex {pattern:?}: {detail}")]
    BadRegex { pattern: String, detail: String },
}

/// When a condition is evaluated relative to the step's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionWhen {
    Pre,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Eq,
    Ne,
    In,
    Notin,
    Regex,
}

/// A single comparison leaf. Both sides are template strings expanded against
/// the resolution's value context before comparing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assert {
    pub value: String,
    pub operator: Comparison,
    pub expected: String,
}

impl Assert {
    fn evaluate(&self, ctx: &ValueContext) -> Result<bool, ConditionError> {
        let value = canonical(ctx.expand_str(&self.value)?);
        let expected = canonical(ctx.expand_str(&self.expected)?);
        Ok(match self.operator {
            Comparison::Eq => value == expected,
            Comparison::Ne => value != expected,
            Comparison::In => expected.split(',').map(str::trim).any(|item| item == value),
            Comparison::Notin => expected.split(',').map(str::trim).all(|item| item != value),
            Comparison::Regex => Regex::new(&expected)
                .map_err(|err| ConditionError::BadRegex {
                    pattern: expected.clone(),
                    detail: err.to_string(),
                })?
                .is_match(&value),
        })
    }
}

fn canonical(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// AND/OR tree of comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    #[serde(untagged)]
    Leaf(Assert),
}

impl Expr {
    pub fn evaluate(&self, ctx: &ValueContext) -> Result<bool, ConditionError> {
        match self {
            Expr::And(children) => {
                for child in children {
                    if !child.evaluate(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expr::Or(children) => {
                for child in children {
                    if child.evaluate(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Expr::Leaf(assert) => assert.evaluate(ctx),
        }
    }
}

/// What to do when the `if` expression holds (or, for `check`, fails).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThenAction {
    /// Mark the listed steps PRUNE.
    Skip(Vec<String>),
    /// Force steps into declared states.
    SetState(HashMap<String, String>),
    /// Assert the expression; a false result becomes a CLIENT_ERROR.
    Check,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCondition {
    /// Explicit evaluation point; defaults to pre for skip/set_state and to
    /// post for check.
    #[serde(default)]
    pub when: Option<ConditionWhen>,
    #[serde(rename = "if")]
    pub condition: Expr,
    pub then: ThenAction,
    #[serde(default)]
    pub message: Option<String>,
}

impl StepCondition {
    pub fn effective_when(&self) -> ConditionWhen {
        self.when.unwrap_or(match self.then {
            ThenAction::Check => ConditionWhen::Post,
            _ => ConditionWhen::Pre,
        })
    }
}

/// Result of evaluating one condition against the context.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionOutcome {
    /// Condition did not fire.
    Pass,
    /// Prune the listed steps.
    Skip(Vec<String>),
    /// Force steps into the given states.
    SetState(HashMap<String, String>),
    /// A `check` failed; carries the message to record on the step.
    CheckFailed(String),
}

impl StepCondition {
    pub fn evaluate(&self, ctx: &ValueContext) -> Result<ConditionOutcome, ConditionError> {
        let holds = self.condition.evaluate(ctx)?;
        Ok(match (&self.then, holds) {
            (ThenAction::Check, false) => ConditionOutcome::CheckFailed(
                self.message
                    .clone()
                    .unwrap_or_else(|| "condition check failed".to_string()),
            ),
            (ThenAction::Check, true) => ConditionOutcome::Pass,
            (_, false) => ConditionOutcome::Pass,
            (ThenAction::Skip(targets), true) => ConditionOutcome::Skip(targets.clone()),
            (ThenAction::SetState(targets), true) => ConditionOutcome::SetState(targets.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ValueContext {
        let mut ctx = ValueContext::new(json!({"env": "prod", "region": "eu"}), Value::Null);
        ctx.record_step(
            "probe",
            "DONE",
            &json!({"status": "degraded"}),
            &Value::Null,
            None,
            None,
            &HashMap::new(),
        );
        ctx
    }

    fn leaf(value: &str, operator: Comparison, expected: &str) -> Expr {
        Expr::Leaf(Assert {
            value: value.to_string(),
            operator,
            expected: expected.to_string(),
        })
    }

    #[test]
    fn comparisons() {
        let ctx = ctx();
        assert!(
            leaf("{{ input.env }}", Comparison::Eq, "prod")
                .evaluate(&ctx)
                .expect("eval")
        );
        assert!(
            leaf("{{ input.env }}", Comparison::Ne, "dev")
                .evaluate(&ctx)
                .expect("eval")
        );
        assert!(
            leaf("{{ input.region }}", Comparison::In, "us, eu, apac")
                .evaluate(&ctx)
                .expect("eval")
        );
        assert!(
            leaf("{{ input.region }}", Comparison::Notin, "us, apac")
                .evaluate(&ctx)
                .expect("eval")
        );
        assert!(
            leaf(
                "{{ step.probe.output.status }}",
                Comparison::Regex,
                "^(degraded|down)$"
            )
            .evaluate(&ctx)
            .expect("eval")
        );
    }

    #[test]
    fn and_or_trees() {
        let ctx = ctx();
        let expr = Expr::And(vec![
            leaf("{{ input.env }}", Comparison::Eq, "prod"),
            Expr::Or(vec![
                leaf("{{ input.region }}", Comparison::Eq, "us"),
                leaf("{{ input.region }}", Comparison::Eq, "eu"),
            ]),
        ]);
        assert!(expr.evaluate(&ctx).expect("eval"));

        let expr = Expr::And(vec![
            leaf("{{ input.env }}", Comparison::Eq, "prod"),
            leaf("{{ input.region }}", Comparison::Eq, "us"),
        ]);
        assert!(!expr.evaluate(&ctx).expect("eval"));
    }

    #[test]
    fn check_fires_on_false() {
        let ctx = ctx();
        let condition = StepCondition {
            when: None,
            condition: leaf("{{ step.probe.output.status }}", Comparison::Eq, "ok"),
            then: ThenAction::Check,
            message: Some("probe must be ok".to_string()),
        };
        assert_eq!(condition.effective_when(), ConditionWhen::Post);
        assert_eq!(
            condition.evaluate(&ctx).expect("eval"),
            ConditionOutcome::CheckFailed("probe must be ok".to_string())
        );
    }

    #[test]
    fn skip_fires_on_true() {
        let ctx = ctx();
        let condition = StepCondition {
            when: None,
            condition: leaf("{{ input.env }}", Comparison::Eq, "prod"),
            then: ThenAction::Skip(vec!["debug-dump".to_string()]),
            message: None,
        };
        assert_eq!(condition.effective_when(), ConditionWhen::Pre);
        assert_eq!(
            condition.evaluate(&ctx).expect("eval"),
            ConditionOutcome::Skip(vec!["debug-dump".to_string()])
        );
    }

    #[test]
    fn condition_deserializes_from_yaml() {
        let condition: StepCondition = serde_yaml::from_str(
            r#"
when: pre
if:
  and:
    - value: "{{ input.env }}"
      operator: eq
      expected: prod
then:
  skip: [notify-dev]
"#,
        )
        .expect("parse");
        assert_eq!(condition.effective_when(), ConditionWhen::Pre);
        assert!(matches!(condition.then, ThenAction::Skip(_)));
    }

    #[test]
    fn bad_regex_is_reported() {
        let ctx = ctx();
        let err = leaf("{{ input.env }}", Comparison::Regex, "([")
            .evaluate(&ctx)
            .unwrap_err();
        assert!(matches!(err, ConditionError::BadRegex { .. }));
    }
}
