// Job model for deferred work
// Tracks each unit of work through its state machine

use crate::error::CoreError;
use crate::utils::short_hash;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Kind of work a job represents; each kind has a typed worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Index,
    Remux,
    Move,
    Copy,
    Proxy,
    Thumbnail,
    Transcode,
}

impl JobKind {
    pub const ALL: &'static [JobKind] = &[
        JobKind::Index,
        JobKind::Remux,
        JobKind::Move,
        JobKind::Copy,
        JobKind::Proxy,
        JobKind::Thumbnail,
        JobKind::Transcode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Index => "index",
            JobKind::Remux => "remux",
            JobKind::Move => "move",
            JobKind::Copy => "copy",
            JobKind::Proxy => "proxy",
            JobKind::Thumbnail => "thumbnail",
            JobKind::Transcode => "transcode",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "index" => Ok(JobKind::Index),
            "remux" => Ok(JobKind::Remux),
            "move" => Ok(JobKind::Move),
            "copy" => Ok(JobKind::Copy),
            "proxy" => Ok(JobKind::Proxy),
            "thumbnail" => Ok(JobKind::Thumbnail),
            "transcode" => Ok(JobKind::Transcode),
            other => Err(CoreError::Validation(format!("unknown job type: {}", other))),
        }
    }
}

/// Job lifecycle state
///
/// `queued → running → {completed | failed | cancelled}`, with
/// `running → retrying → queued` while retries remain. The three terminal
/// states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Retrying => "retrying",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            "retrying" => Ok(JobState::Retrying),
            other => Err(CoreError::Validation(format!("unknown job state: {}", other))),
        }
    }
}

/// Scheduling priority; higher dispatches first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl JobPriority {
    pub fn as_i64(&self) -> i64 {
        match self {
            JobPriority::Low => 0,
            JobPriority::Normal => 1,
            JobPriority::High => 2,
            JobPriority::Critical => 3,
        }
    }

    pub fn from_i64(value: i64) -> JobPriority {
        match value {
            i64::MIN..=0 => JobPriority::Low,
            1 => JobPriority::Normal,
            2 => JobPriority::High,
            _ => JobPriority::Critical,
        }
    }
}

/// One durable job row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub asset_id: Option<String>,
    pub payload_json: String,
    pub state: String,
    pub priority: i64,
    pub retry_count: i64,
    pub max_retries: i64,
    pub timeout_sec: Option<i64>,
    pub result_json: Option<String>,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub next_retry_at: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

impl Job {
    pub fn kind(&self) -> Option<JobKind> {
        self.kind.parse().ok()
    }

    pub fn state(&self) -> JobState {
        self.state.parse().unwrap_or(JobState::Failed)
    }

    pub fn payload(&self) -> Value {
        serde_json::from_str(&self.payload_json).unwrap_or_else(|_| Value::Object(Default::default()))
    }

    pub fn result(&self) -> Option<Value> {
        self.result_json.as_deref().and_then(|r| serde_json::from_str(r).ok())
    }
}

/// Parameters for enqueueing a job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Option<String>,
    pub kind: JobKind,
    pub asset_id: Option<String>,
    pub payload: Value,
    pub priority: JobPriority,
    pub max_retries: i64,
    pub timeout_sec: Option<i64>,
}

impl NewJob {
    pub fn new(kind: JobKind, payload: Value) -> Self {
        Self {
            id: None,
            kind,
            asset_id: None,
            payload,
            priority: JobPriority::Normal,
            max_retries: crate::constants::jobs::MAX_RETRIES,
            timeout_sec: None,
        }
    }

    pub fn asset(mut self, asset_id: impl Into<String>) -> Self {
        self.asset_id = Some(asset_id.into());
        self
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, seconds: i64) -> Self {
        self.timeout_sec = Some(seconds);
        self
    }
}

/// Deterministic job id from the work it describes
///
/// `sha256(type:asset_id:payload)` truncated to 16 hex chars, so retrying
/// the same action does not pile up duplicate rows.
pub fn deterministic_job_id(kind: JobKind, asset_id: Option<&str>, payload: &Value) -> String {
    let material = format!(
        "{}:{}:{}",
        kind,
        asset_id.unwrap_or(""),
        serde_json::to_string(payload).unwrap_or_default()
    );
    short_hash(&material)
}
