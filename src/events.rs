//! Per-task event stream.
//!
//! Every loop transition, proposal, execution result and terminal status is
//! reported on an ordered channel, one per task. Consumers can reconstruct
//! the full transcript by replaying events in delivery order.

use crate::gateway::ToolProposal;
use crate::task::{Artifact, ReviewVerdict, SandboxResult, TaskId, UsageStats};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

/// Why a task stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The loop terminated successfully.
    Done,
    /// The loop gave up; distinct from a crash so callers can tell
    /// "exhausted its budget" apart from "something broke".
    Aborted { reason: String },
    /// The caller cancelled the task at a suspension point.
    Cancelled,
}

/// One entry in a task's transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Free-form progress note.
    Status { message: String },
    /// The coder produced code this iteration.
    CodeGenerated { content: String, iteration: u32 },
    /// The coder proposed a side effect; `ordinal` identifies it for the
    /// out-of-band approval exchange.
    ToolProposal { proposal: ToolProposal, ordinal: u32 },
    /// The approval gateway resolved a pending proposal.
    ApprovalDecision {
        ordinal: u32,
        approved: bool,
        reason: Option<String>,
    },
    /// What the executor observed.
    ExecutionResult { result: SandboxResult },
    /// Binary artifacts (e.g. rendered images) the sandbox produced.
    ImageGenerated { images: Vec<Artifact> },
    /// The reviewer's verdict.
    Review { verdict: ReviewVerdict },
    /// The reflector's fix strategy for the next iteration.
    Reflection { strategy: String },
    /// An accepted change was committed under this message.
    CommitProposal { message: String },
    /// Telemetry after an oracle call.
    UsageUpdate { usage: UsageStats },
    /// Final human-readable report.
    Summary { content: String },
    /// Something went wrong; not necessarily terminal.
    Error { message: String },
    /// Terminal event. Always the last one delivered.
    Finished { outcome: TaskOutcome },
}

/// Sender half of a task's event stream.
///
/// Cheap to clone. Events are dropped (with a warning) once the receiver
/// is gone; a disconnected consumer must not stall the loop.
#[derive(Clone)]
pub struct EventChannel {
    task_id: TaskId,
    sender: mpsc::UnboundedSender<TaskEvent>,
}

impl EventChannel {
    pub fn new(task_id: TaskId) -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (EventChannel { task_id, sender }, receiver)
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn send(&self, event: TaskEvent) {
        if self.sender.send(event).is_err() {
            warn!(task = %self.task_id, "event receiver dropped; event discarded");
        }
    }

    pub fn status(&self, message: impl Into<String>) {
        self.send(TaskEvent::Status {
            message: message.into(),
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.send(TaskEvent::Error {
            message: message.into(),
        });
    }
}
