// Core library for the clipd media automation daemon
// Contains the asset store, event log, job queue, workers, rule engine,
// file-stability watcher and admin ports

pub mod asset;
pub mod cancel;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod db;
pub mod error;
pub mod events;
pub mod guardrails;
pub mod job;
pub mod media;
pub mod ports;
pub mod queue;
pub mod roles;
pub mod rules;
pub mod utils;
pub mod watcher;
pub mod workers;

// Re-export commonly used types
pub use asset::{Asset, AssetStatus, AssetStore, IndexAction, IndexOutcome};
pub use cancel::CancelFlag;
pub use config::ConfigStore;
pub use crypto::SecretCipher;
pub use db::{init_schema, open_memory_pool, open_pool};
pub use error::{CoreError, Result};
pub use events::{event_types, AssetEvent, EventLog};
pub use guardrails::{GuardrailMonitor, GuardSnapshot};
pub use job::{Job, JobKind, JobPriority, JobState, NewJob};
pub use media::{GpuProbe, MediaRunner};
pub use ports::AdminPorts;
pub use queue::{CancelOutcome, JobQueue};
pub use roles::{Role, RoleStore};
pub use rules::{Rule, RuleExecutor, RuleStore, SharedRules};
pub use watcher::StabilityWatcher;
pub use workers::{Dispatcher, WorkerContext, WorkerRegistry};
