//! Persistence for rules, executions, trigger bookmarks, and webhook
//! subscriptions. Thin repository structs over the shared `PgPool`; JSON
//! columns carry the trigger and component trees.

pub mod executions;
pub mod rules;
pub mod trigger_state;
pub mod webhooks;

pub use executions::{ExecutionStats, ExecutionStore};
pub use rules::RuleStore;
pub use trigger_state::{TriggerState, TriggerStateStore};
pub use webhooks::{WebhookStore, WebhookSubscription};
