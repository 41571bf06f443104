//! Step runner contract and process-wide registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};

/// Classified failure returned by a runner invocation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunnerError {
    /// Retryable failure; the step is re-armed while budget remains.
    #[error("{0}")]
    Transient(String),
    /// Non-retryable failure caused by the request or configuration.
    #[error("{0}")]
    Permanent(String),
    /// Blocks the whole resolution irrespective of retries.
    #[error("{0}")]
    Fatal(String),
    /// The runner is awaiting an external event (subtask, callback).
    #[error("{0}")]
    AsyncWait(String),
}

/// Successful runner result.
#[derive(Debug, Clone, Default)]
pub struct RunnerOutput {
    pub output: Value,
    pub metadata: Value,
}

/// Everything a runner may need about the step it executes.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub task_id: Uuid,
    pub resolution_id: Uuid,
    pub step_name: String,
    pub try_count: u32,
    pub resolver_username: Option<String>,
}

/// A named executor for a step's action.
///
/// `exec` receives the configuration after template expansion; implementations
/// decode it into their typed form and must be safe to invoke more than once
/// for the same step (at-least-once semantics).
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Reject malformed configuration before any execution is attempted.
    fn validate(&self, config: &Value) -> Result<(), RunnerError>;

    /// Resource tags this invocation must hold.
    fn resources(&self, _config: &Value) -> Vec<String> {
        Vec::new()
    }

    /// Advisory schema describing the metadata this runner emits.
    fn metadata_schema(&self) -> Option<Value> {
        None
    }

    async fn exec(&self, ctx: &ExecContext, config: &Value) -> Result<RunnerOutput, RunnerError>;
}

/// Maps `action.type` to a runner. Populated before any resolution runs and
/// treated as immutable afterwards.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn StepRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in runners already present.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register("echo", Arc::new(EchoRunner))
            .expect("builtin registration cannot collide");
        registry
    }

    pub fn register(&mut self, name: &str, runner: Arc<dyn StepRunner>) -> EngineResult<()> {
        if self.runners.contains_key(name) {
            return Err(EngineError::Configuration(format!(
                "runner {name} is already registered"
            )));
        }
        self.runners.insert(name.to_string(), runner);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepRunner>> {
        self.runners.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.runners.keys().cloned().collect()
    }
}

#[derive(Debug, Deserialize, Default)]
struct EchoConfig {
    #[serde(default)]
    output: Value,
    #[serde(default)]
    metadata: Value,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
}

/// Built-in runner returning its own configuration; the canonical template
/// smoke-test action, also able to fail with a chosen error class.
pub struct EchoRunner;

impl EchoRunner {
    fn decode(config: &Value) -> Result<EchoConfig, RunnerError> {
        serde_json::from_value(config.clone())
            .map_err(|err| RunnerError::Permanent(format!("invalid echo configuration: {err}")))
    }
}

#[async_trait]
impl StepRunner for EchoRunner {
    fn validate(&self, config: &Value) -> Result<(), RunnerError> {
        let decoded = Self::decode(config)?;
        match decoded.error_type.as_deref() {
            None | Some("transient") | Some("client") | Some("fatal") | Some("waiting") => Ok(()),
            Some(other) => Err(RunnerError::Permanent(format!(
                "unknown echo error_type {other:?}"
            ))),
        }
    }

    async fn exec(&self, _ctx: &ExecContext, config: &Value) -> Result<RunnerOutput, RunnerError> {
        let decoded = Self::decode(config)?;
        let message = decoded
            .error_message
            .unwrap_or_else(|| "echo error".to_string());
        match decoded.error_type.as_deref() {
            Some("transient") => Err(RunnerError::Transient(message)),
            Some("client") => Err(RunnerError::Permanent(message)),
            Some("fatal") => Err(RunnerError::Fatal(message)),
            Some("waiting") => Err(RunnerError::AsyncWait(message)),
            Some(other) => Err(RunnerError::Permanent(format!(
                "unknown echo error_type {other:?}"
            ))),
            None => Ok(RunnerOutput {
                output: decoded.output,
                metadata: decoded.metadata,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecContext {
        ExecContext {
            task_id: Uuid::new_v4(),
            resolution_id: Uuid::new_v4(),
            step_name: "echo".to_string(),
            try_count: 1,
            resolver_username: None,
        }
    }

    #[tokio::test]
    async fn echo_returns_configured_output() {
        let runner = EchoRunner;
        let config = json!({"output": {"ok": true}, "metadata": {"ms": 3}});
        runner.validate(&config).expect("valid");
        let result = runner.exec(&ctx(), &config).await.expect("exec");
        assert_eq!(result.output, json!({"ok": true}));
        assert_eq!(result.metadata, json!({"ms": 3}));
    }

    #[tokio::test]
    async fn echo_maps_error_types() {
        let runner = EchoRunner;
        let err = runner
            .exec(
                &ctx(),
                &json!({"error_type": "transient", "error_message": "oops"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Transient(_)));

        let err = runner
            .exec(&ctx(), &json!({"error_type": "fatal"}))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Fatal(_)));
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = RunnerRegistry::with_builtins();
        let err = registry.register("echo", Arc::new(EchoRunner)).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(registry.get("echo").is_some());
    }

    #[test]
    fn echo_validate_rejects_unknown_error_type() {
        let runner = EchoRunner;
        assert!(runner.validate(&json!({"error_type": "meltdown"})).is_err());
    }
}
