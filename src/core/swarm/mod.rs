//! Swarm task queue: persisted DAGs of subtasks claimed and executed by
//! cooperating workers.
//!
//! A swarm is a set of tasks created together; each task carries its
//! dependencies (by sequence index) in metadata. Ownership is decided by an
//! atomic conditional claim, so any number of workers can share the store.

mod decomposer;
mod events;
mod executor;
mod queue;

pub use decomposer::{DecomposeOptions, Subtask, parse_subtasks};
pub use events::{TaskEvent, TaskHooks};
pub use executor::{ExecuteOptions, ExecutionReport};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "claimed" => Some(TaskStatus::Claimed),
            "running" => Some(TaskStatus::Running),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    #[default]
    Inline,
    Agent,
}

impl TaskMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskMode::Inline => "inline",
            TaskMode::Agent => "agent",
        }
    }

    pub fn from_mode(value: &str) -> Self {
        match value {
            "agent" => TaskMode::Agent,
            _ => TaskMode::Inline,
        }
    }
}

/// One unit of work in a swarm. Ids follow `<swarm_id>-task-<seq>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmTask {
    pub id: String,
    pub swarm_id: String,
    pub seq: i64,
    pub description: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub agent_id: Option<String>,
    pub model: Option<String>,
    pub strategy: Option<String>,
    pub mode: TaskMode,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub claimed_at: Option<String>,
    pub completed_at: Option<String>,
    /// Opaque blob; the executor stores `depends_on`, `capability`, and
    /// `subtask_index` here.
    pub metadata: Value,
}

impl SwarmTask {
    /// Dependency sequence indices recorded in metadata.
    pub fn depends_on(&self) -> Vec<i64> {
        depends_on_of(&self.metadata)
    }
}

pub(crate) fn depends_on_of(metadata: &Value) -> Vec<i64> {
    metadata
        .get("depends_on")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_i64()).collect())
        .unwrap_or_default()
}

/// Input row for [`crate::core::Core::create_swarm`].
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub description: String,
    /// Defaults to the description when omitted.
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub strategy: Option<String>,
    pub mode: TaskMode,
    pub metadata: Option<Value>,
}

impl TaskSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }
}

/// Per-status task counts for one swarm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmStatus {
    pub total: u32,
    pub pending: u32,
    pub claimed: u32,
    pub running: u32,
    pub done: u32,
    pub failed: u32,
}
