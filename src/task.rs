//! Core data model for agent tasks.
//!
//! A [`Task`] is one end-to-end unit of agent work: a goal, the editor
//! context captured at submission time, and a retry budget. Everything else
//! here is what flows between the loop's roles: sandbox results, review
//! verdicts, and usage telemetry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for a task, assigned at submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn new() -> Self {
        TaskId(format!("task_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the task was initiated; forwarded to the oracle as a hint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    #[default]
    Agent,
    Chat,
    Edit,
}

/// The file the editor had open when the task was submitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileContext {
    pub filename: String,
    pub language_id: String,
    pub cursor_line: usize,
    pub selection: Option<String>,
    pub content: String,
}

/// Snapshot of editor state supplied by the caller alongside the goal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub file: Option<FileContext>,
    /// Diagnostics (compiler errors, lints) the editor had collected.
    pub diagnostics: Vec<String>,
    /// Short digest of the project layout, if the caller produced one.
    pub structure_digest: Option<String>,
}

/// Caller-facing description of one unit of agent work.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub goal: String,
    pub workspace_root: PathBuf,
    pub context: ContextSnapshot,
    /// Maximum number of reflect-and-retry cycles. `None` takes the
    /// configured default.
    pub retry_budget: Option<u32>,
    pub mode: TaskMode,
    /// Sandbox session key. Tasks sharing a key share one live session,
    /// so installed packages and running servers persist across tasks.
    pub session_key: Option<String>,
}

impl TaskSpec {
    pub fn new(goal: impl Into<String>, workspace_root: impl Into<PathBuf>) -> Self {
        TaskSpec {
            goal: goal.into(),
            workspace_root: workspace_root.into(),
            context: ContextSnapshot::default(),
            retry_budget: None,
            mode: TaskMode::default(),
            session_key: None,
        }
    }
}

/// A submitted task. Immutable except for the running retry counter.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub spec: TaskSpec,
    /// Remaining reflect cycles. Decremented by the loop; the task aborts
    /// when it reaches zero.
    pub retries_left: u32,
    /// Session key actually in use (defaults to the task id).
    pub session_key: String,
}

impl Task {
    pub fn new(spec: TaskSpec, default_budget: u32) -> Self {
        let id = TaskId::new();
        let retries_left = spec.retry_budget.unwrap_or(default_budget);
        let session_key = spec.session_key.clone().unwrap_or_else(|| id.as_str().to_string());
        Task {
            id,
            spec,
            retries_left,
            session_key,
        }
    }
}

/// A binary artifact produced inside the sandbox (e.g. a rendered image),
/// base64-encoded for transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub filename: String,
    /// Base64-encoded payload.
    pub data: String,
}

/// Observed outcome of one executor step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// The command hit its wall-clock timeout and was terminated.
    #[serde(default)]
    pub timed_out: bool,
    /// Nothing ran: no sandbox backend was available.
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl SandboxResult {
    /// A result that reports success without having run anything real,
    /// used for pure file effects (write, patch).
    pub fn synthetic(stdout: impl Into<String>) -> Self {
        SandboxResult {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// A structured failure surfaced as execution data (patch errors,
    /// safety refusals). These feed the review/reflect cycle.
    pub fn failure(stderr: impl Into<String>) -> Self {
        SandboxResult {
            stderr: stderr.into(),
            exit_code: 1,
            ..Default::default()
        }
    }

    pub fn passed(&self) -> bool {
        !self.skipped && !self.timed_out && self.exit_code == 0
    }
}

/// The reviewer's judgement of an executor step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub accept: bool,
    pub feedback: String,
    #[serde(default)]
    pub defects: Vec<String>,
}

/// Cross-cutting telemetry accumulated per task, reset at task start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub requests: u32,
}

impl UsageStats {
    pub fn record(&mut self, tokens: u64, cost_usd: Option<f64>) {
        self.total_tokens += tokens;
        if let Some(cost) = cost_usd {
            self.cost_usd += cost;
        }
        self.requests += 1;
    }
}
