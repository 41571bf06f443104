//! Cairn - a multi-tenant task orchestration engine
//!
//! Users submit tasks instantiated from declarative templates describing a
//! directed graph of steps. The engine owns each task's *resolution* (its
//! mutable execution state) and drives it to a terminal state: dependency
//! ordering, bounded-parallel step execution, retries with backoff,
//! conditional branches, foreach fan-out, pauses and crash recovery. The key
//! components are:
//!
//! ## Execution
//!
//! - [`Engine`]: wiring, submission channel, control operations
//! - [`RunnerRegistry`] / [`StepRunner`]: pluggable step executors
//! - [`ResourceRegistry`]: named weighted semaphores bounding concurrency
//!
//! ## State
//!
//! - [`TaskTemplate`]: the declarative recipe
//! - [`Task`] / [`Resolution`] / [`Step`]: the persistent execution model
//! - [`ValueContext`]: scoped value tree with `{{ … }}` expansion
//!
//! ## Persistence
//!
//! - [`Store`]: transactional gateway with per-resolution single-writer locks
//! - [`PgStore`] / [`MemoryStore`]: PostgreSQL and in-memory implementations
//! - [`Keyring`]: envelope encryption for sensitive fields

pub mod condition;
pub mod config;
pub mod engine;
pub mod errors;
mod metrics;
pub mod notify;
pub mod resolution;
pub mod resources;
pub mod retry;
pub mod runner;
pub mod step;
pub mod store;
pub mod task;
pub mod template;
pub mod value;

// Configuration
pub use config::{DEFAULT_MAX_RETRIES, EngineConfig, parse_resource_limits};

// Errors
pub use errors::{EngineError, EngineResult};

// Engine
pub use engine::Engine;

// Data model
pub use resolution::{Resolution, ResolutionState};
pub use step::{DependencyClause, DependencyStatus, Step, StepState};
pub use task::{Batch, PARENT_TASK_TAG, Task, TaskState};
pub use template::{
    ActionSpec, ForeachStrategy, InputSpec, StepSpec, TaskTemplate, TemplateRegistry,
};

// Value context and conditions
pub use condition::{Assert, Comparison, ConditionWhen, Expr, StepCondition, ThenAction};
pub use value::{TemplateError, ValueContext};

// Runners and resources
pub use resources::{ResourceGuard, ResourceRegistry};
pub use retry::RetryPattern;
pub use runner::{EchoRunner, ExecContext, RunnerError, RunnerOutput, RunnerRegistry, StepRunner};

// Notifications
pub use notify::{
    Message, NotificationBus, NotificationSender, NotificationStrategy, NotifyAction,
    TemplateStrategy,
};

// Persistence
pub use store::{
    Keyring, MemoryStore, PgStore, RunnableResolution, StateCount, Store, StoreError, StoreResult,
};
