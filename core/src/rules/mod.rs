// Rule engine: matching, context-threaded execution, template expansion

pub mod context;
pub mod executor;
pub mod matcher;
pub mod store;
pub mod template;

pub use context::{ActionResult, Artifact, RuleContext};
pub use executor::RuleExecutor;
pub use matcher::{Condition, CondOp, Trigger, TriggerAlt};
pub use store::{ActionSpec, Guardrails, Rule, RuleStore, SharedRules};
