//! Lifecycle event notification bus.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};

/// Event classes the bus can publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyAction {
    TaskValidation,
    TaskStateUpdate,
    TaskStepUpdate,
}

impl NotifyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyAction::TaskValidation => "task_validation",
            NotifyAction::TaskStateUpdate => "task_state_update",
            NotifyAction::TaskStepUpdate => "task_step_update",
        }
    }
}

impl fmt::Display for NotifyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStrategy {
    Always,
    Silent,
    FailureOnly,
    FailureOrDone,
}

impl NotificationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStrategy::Always => "always",
            NotificationStrategy::Silent => "silent",
            NotificationStrategy::FailureOnly => "failure_only",
            NotificationStrategy::FailureOrDone => "failure_or_done",
        }
    }
}

/// Per-template strategy override; the first pattern matching the template
/// name wins over the backend default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateStrategy {
    pub template_pattern: String,
    pub strategy: NotificationStrategy,
}

/// Notification payload delivered to senders.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub action: NotifyAction,
    pub task_id: Uuid,
    pub template_name: String,
    pub title: String,
    /// Task or resolution state the event reports.
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver_username: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

const FAILURE_STATES: &[&str] = &[
    "BLOCKED_BADREQUEST",
    "BLOCKED_FATAL",
    "BLOCKED_MAXRETRIES",
    "BLOCKED",
    "ERROR",
    "CRASHED",
    "CANCELLED",
    "CLIENT_ERROR",
    "SERVER_ERROR",
    "FATAL",
    "AFTERRUN_ERROR",
];

impl Message {
    fn reported_state(&self) -> &str {
        self.step_state.as_deref().unwrap_or(&self.state)
    }

    pub fn is_failure(&self) -> bool {
        FAILURE_STATES.contains(&self.reported_state())
    }

    pub fn is_done(&self) -> bool {
        self.reported_state() == "DONE"
    }
}

/// Transport capable of delivering a [`Message`].
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, message: &Message, backend_name: &str) -> anyhow::Result<()>;
}

struct Backend {
    name: String,
    sender: Arc<dyn NotificationSender>,
    default_strategies: HashMap<NotifyAction, NotificationStrategy>,
    template_strategies: HashMap<NotifyAction, Vec<(Regex, NotificationStrategy)>>,
}

impl Backend {
    fn strategy_for(&self, action: NotifyAction, template_name: &str) -> NotificationStrategy {
        if let Some(overrides) = self.template_strategies.get(&action) {
            for (pattern, strategy) in overrides {
                if pattern.is_match(template_name) {
                    return *strategy;
                }
            }
        }
        self.default_strategies
            .get(&action)
            .copied()
            .unwrap_or(NotificationStrategy::Always)
    }
}

/// Routes lifecycle events to registered senders, applying per-backend and
/// per-template strategies. Senders run concurrently; failures are logged,
/// never retried.
#[derive(Default)]
pub struct NotificationBus {
    backends: Vec<Backend>,
}

fn validate_strategy(
    action: NotifyAction,
    strategy: NotificationStrategy,
    backend: &str,
) -> EngineResult<()> {
    if action == NotifyAction::TaskValidation
        && matches!(
            strategy,
            NotificationStrategy::FailureOnly | NotificationStrategy::FailureOrDone
        )
    {
        return Err(EngineError::Configuration(format!(
            "backend {backend}: strategy {} is invalid for action {}",
            strategy.as_str(),
            action
        )));
    }
    Ok(())
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        sender: Arc<dyn NotificationSender>,
        default_strategies: HashMap<NotifyAction, NotificationStrategy>,
        template_strategies: HashMap<NotifyAction, Vec<TemplateStrategy>>,
    ) -> EngineResult<()> {
        if self.backends.iter().any(|backend| backend.name == name) {
            return Err(EngineError::Configuration(format!(
                "notification backend {name} is already registered"
            )));
        }
        for (action, strategy) in &default_strategies {
            validate_strategy(*action, *strategy, name)?;
        }

        let mut compiled: HashMap<NotifyAction, Vec<(Regex, NotificationStrategy)>> =
            HashMap::new();
        for (action, overrides) in template_strategies {
            let mut entries = Vec::with_capacity(overrides.len());
            for entry in overrides {
                validate_strategy(action, entry.strategy, name)?;
                let pattern = Regex::new(&entry.template_pattern).map_err(|err| {
                    EngineError::Configuration(format!(
                        "backend {name}: invalid template pattern {:?}: {err}",
                        entry.template_pattern
                    ))
                })?;
                entries.push((pattern, entry.strategy));
            }
            compiled.insert(action, entries);
        }

        self.backends.push(Backend {
            name: name.to_string(),
            sender,
            default_strategies,
            template_strategies: compiled,
        });
        Ok(())
    }

    pub fn sender_names(&self) -> Vec<String> {
        self.backends
            .iter()
            .map(|backend| backend.name.clone())
            .collect()
    }

    /// Deliver one event to every backend whose effective strategy accepts it.
    pub fn publish(&self, message: Message) {
        for backend in &self.backends {
            let strategy = backend.strategy_for(message.action, &message.template_name);
            let deliver = match strategy {
                NotificationStrategy::Always => true,
                NotificationStrategy::Silent => false,
                NotificationStrategy::FailureOnly => message.is_failure(),
                NotificationStrategy::FailureOrDone => message.is_failure() || message.is_done(),
            };
            if !deliver {
                continue;
            }
            let sender = backend.sender.clone();
            let backend_name = backend.name.clone();
            let message = message.clone();
            tokio::spawn(async move {
                if let Err(err) = sender.send(&message, &backend_name).await {
                    tracing::warn!(
                        backend = %backend_name,
                        action = %message.action,
                        error = %err,
                        "notification delivery failed"
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSender {
        delivered: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl NotificationSender for RecordingSender {
        async fn send(&self, message: &Message, _backend_name: &str) -> anyhow::Result<()> {
            self.delivered
                .lock()
                .expect("delivered poisoned")
                .push(message.clone());
            Ok(())
        }
    }

    fn message(action: NotifyAction, state: &str) -> Message {
        Message {
            action,
            task_id: Uuid::new_v4(),
            template_name: "deploy".to_string(),
            title: "deploy billing".to_string(),
            state: state.to_string(),
            step_name: None,
            step_state: None,
            resolver_username: None,
            tags: HashMap::new(),
        }
    }

    async fn drain() {
        // Let the spawned delivery tasks run.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn strategy_filters_events() {
        let mut bus = NotificationBus::new();
        let sender = Arc::new(RecordingSender::default());
        bus.register(
            "slack",
            sender.clone(),
            HashMap::from([(
                NotifyAction::TaskStateUpdate,
                NotificationStrategy::FailureOnly,
            )]),
            HashMap::new(),
        )
        .expect("register");

        bus.publish(message(NotifyAction::TaskStateUpdate, "DONE"));
        bus.publish(message(NotifyAction::TaskStateUpdate, "BLOCKED_FATAL"));
        drain().await;

        let delivered = sender.delivered.lock().expect("delivered poisoned");
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].state, "BLOCKED_FATAL");
    }

    #[tokio::test]
    async fn template_override_beats_default() {
        let mut bus = NotificationBus::new();
        let sender = Arc::new(RecordingSender::default());
        bus.register(
            "slack",
            sender.clone(),
            HashMap::from([(NotifyAction::TaskStateUpdate, NotificationStrategy::Silent)]),
            HashMap::from([(
                NotifyAction::TaskStateUpdate,
                vec![TemplateStrategy {
                    template_pattern: "^deploy$".to_string(),
                    strategy: NotificationStrategy::Always,
                }],
            )]),
        )
        .expect("register");

        bus.publish(message(NotifyAction::TaskStateUpdate, "RUNNING"));
        drain().await;
        assert_eq!(sender.delivered.lock().expect("poisoned").len(), 1);
    }

    #[tokio::test]
    async fn first_matching_template_pattern_wins() {
        let mut bus = NotificationBus::new();
        let sender = Arc::new(RecordingSender::default());
        bus.register(
            "slack",
            sender.clone(),
            HashMap::new(),
            HashMap::from([(
                NotifyAction::TaskStateUpdate,
                vec![
                    TemplateStrategy {
                        template_pattern: "^dep".to_string(),
                        strategy: NotificationStrategy::Silent,
                    },
                    TemplateStrategy {
                        template_pattern: ".*".to_string(),
                        strategy: NotificationStrategy::Always,
                    },
                ],
            )]),
        )
        .expect("register");

        bus.publish(message(NotifyAction::TaskStateUpdate, "RUNNING"));
        drain().await;
        assert!(sender.delivered.lock().expect("poisoned").is_empty());
    }

    #[test]
    fn validation_strategies_are_restricted() {
        let mut bus = NotificationBus::new();
        let err = bus
            .register(
                "slack",
                Arc::new(RecordingSender::default()),
                HashMap::from([(
                    NotifyAction::TaskValidation,
                    NotificationStrategy::FailureOnly,
                )]),
                HashMap::new(),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));

        let err = bus
            .register(
                "slack",
                Arc::new(RecordingSender::default()),
                HashMap::new(),
                HashMap::from([(
                    NotifyAction::TaskValidation,
                    vec![TemplateStrategy {
                        template_pattern: ".*".to_string(),
                        strategy: NotificationStrategy::FailureOrDone,
                    }],
                )]),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn duplicate_backend_is_rejected() {
        let mut bus = NotificationBus::new();
        bus.register(
            "slack",
            Arc::new(RecordingSender::default()),
            HashMap::new(),
            HashMap::new(),
        )
        .expect("register");
        assert!(
            bus.register(
                "slack",
                Arc::new(RecordingSender::default()),
                HashMap::new(),
                HashMap::new(),
            )
            .is_err()
        );
    }

    #[tokio::test]
    async fn step_updates_report_the_step_state() {
        let mut bus = NotificationBus::new();
        let sender = Arc::new(RecordingSender::default());
        bus.register(
            "slack",
            sender.clone(),
            HashMap::from([(
                NotifyAction::TaskStepUpdate,
                NotificationStrategy::FailureOrDone,
            )]),
            HashMap::new(),
        )
        .expect("register");

        let mut running = message(NotifyAction::TaskStepUpdate, "RUNNING");
        running.step_name = Some("build".to_string());
        running.step_state = Some("RUNNING".to_string());
        bus.publish(running);

        let mut failed = message(NotifyAction::TaskStepUpdate, "RUNNING");
        failed.step_name = Some("build".to_string());
        failed.step_state = Some("SERVER_ERROR".to_string());
        bus.publish(failed);
        drain().await;

        let delivered = sender.delivered.lock().expect("poisoned");
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].step_state.as_deref(), Some("SERVER_ERROR"));
    }
}
