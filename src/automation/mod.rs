// Automation engine core: trigger management, rule program execution,
// actions, and conditions.

pub mod actions;
pub mod conditions;
pub mod context;
pub mod executor;
pub mod rule;
pub mod triggers;

pub use actions::{ActionRunner, MAX_CHAIN_DEPTH};
pub use conditions::ConditionEvaluator;
pub use context::{
    ComponentResult, ComponentStatus, Execution, ExecutionContext, ExecutionStatus, TriggerEvent,
};
pub use executor::{RuleExecutor, TestOutcome};
pub use rule::{Component, ComponentKind, Rule, Trigger};
pub use triggers::{fingerprint, TriggerManager};
