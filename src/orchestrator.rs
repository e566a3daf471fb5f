//! The agent loop: Coder -> Executor -> Reviewer -> Reflector.
//!
//! The loop is an explicit state machine with a typed transition function,
//! so each step can be reasoned about (and tested) in isolation. The loop
//! context lives in the orchestrator struct and is threaded through every
//! state; nothing is shared between roles except through it.
//!
//! Suspension points (oracle calls, approval waits, sandbox commands) are
//! cooperative and individually cancellable. Execution failures are data,
//! not errors: they flow into review and drive the retry cycle. Only
//! oracle failures and budget exhaustion are terminal.

use crate::checkpoint::CheckpointManager;
use crate::events::{EventChannel, TaskEvent, TaskOutcome};
use crate::gateway::{ApprovalDecision, ToolGateway, ToolProposal};
use crate::oracle::{self, Oracle};
use crate::patch;
use crate::prompts;
use crate::sandbox::SandboxManager;
use crate::task::{ReviewVerdict, SandboxResult, Task, UsageStats};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Loop states. `Done` and `Aborted` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LoopState {
    Code,
    AwaitApproval,
    Execute,
    Review,
    Reflect,
    Done,
    Aborted(String),
}

/// What one step produced: the next state, or a cancellation observed at a
/// suspension point.
enum StepOutcome {
    Next(LoopState),
    Cancelled,
}

enum AskResult {
    Reply(String),
    Failed(String),
    Cancelled,
}

/// Spend one retry unit. Returns true when the budget is now exhausted.
fn spend_retry(retries_left: &mut u32) -> bool {
    if *retries_left > 0 {
        *retries_left -= 1;
    }
    *retries_left == 0
}

/// Commit message for an accepted change: first line of the goal, capped.
fn commit_message(goal: &str) -> String {
    let first_line = goal.lines().next().unwrap_or("agent change").trim();
    let capped: String = first_line.chars().take(72).collect();
    format!("crucible: {capped}")
}

const BUDGET_EXHAUSTED: &str = "retry budget exhausted";

pub struct Orchestrator {
    task: Task,
    oracle: Arc<dyn Oracle>,
    gateway: ToolGateway,
    checkpoints: Arc<CheckpointManager>,
    sandbox: Arc<SandboxManager>,
    events: EventChannel,
    cancel: CancellationToken,

    // Loop context, threaded through every state.
    iteration: u32,
    next_ordinal: u32,
    proposal: Option<ToolProposal>,
    executed_proposal: Option<ToolProposal>,
    result: Option<SandboxResult>,
    verdict: Option<ReviewVerdict>,
    strategy: Option<String>,
    decline_note: Option<String>,
    executed_any: bool,
    usage: UsageStats,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task: Task,
        oracle: Arc<dyn Oracle>,
        gateway: ToolGateway,
        checkpoints: Arc<CheckpointManager>,
        sandbox: Arc<SandboxManager>,
        events: EventChannel,
        cancel: CancellationToken,
    ) -> Self {
        Orchestrator {
            task,
            oracle,
            gateway,
            checkpoints,
            sandbox,
            events,
            cancel,
            iteration: 0,
            next_ordinal: 0,
            proposal: None,
            executed_proposal: None,
            result: None,
            verdict: None,
            strategy: None,
            decline_note: None,
            executed_any: false,
            usage: UsageStats::default(),
        }
    }

    /// Drive the loop to a terminal state. Always emits `Finished` last.
    pub async fn run(mut self) -> TaskOutcome {
        info!(task = %self.task.id, "task started");
        self.events.status(format!("task started: {}", self.task.spec.goal));

        let mut state = LoopState::Code;
        let outcome = loop {
            debug!(task = %self.task.id, ?state, "loop transition");
            let step = match state {
                LoopState::Code => self.step_code().await,
                LoopState::AwaitApproval => self.step_approval().await,
                LoopState::Execute => self.step_execute().await,
                LoopState::Review => self.step_review().await,
                LoopState::Reflect => self.step_reflect().await,
                LoopState::Done => break self.finish_done().await,
                LoopState::Aborted(reason) => break TaskOutcome::Aborted { reason },
            };
            match step {
                StepOutcome::Next(next) => state = next,
                StepOutcome::Cancelled => break TaskOutcome::Cancelled,
            }
        };

        // Private sessions are torn down on normal completion; shared keys
        // and cancelled tasks leave the session for reuse or the reaper.
        if outcome != TaskOutcome::Cancelled && self.task.spec.session_key.is_none() {
            if let Err(err) = self.sandbox.close(&self.task.session_key).await {
                warn!(task = %self.task.id, "session teardown failed: {err:#}");
            }
        }

        info!(task = %self.task.id, ?outcome, "task finished");
        self.events.send(TaskEvent::Finished {
            outcome: outcome.clone(),
        });
        outcome
    }

    /// Invoke the oracle, recording usage. Cancellable.
    async fn ask(&mut self, system: &str, user: String) -> AskResult {
        let cancel = self.cancel.clone();
        let response = tokio::select! {
            _ = cancel.cancelled() => return AskResult::Cancelled,
            response = self.oracle.complete(system, &user) => response,
        };
        match response {
            Ok(reply) => {
                let (tokens, cost) = reply
                    .usage
                    .map(|usage| (u64::from(usage.total_tokens), usage.cost))
                    .unwrap_or((0, None));
                self.usage.record(tokens, cost);
                self.events.send(TaskEvent::UsageUpdate { usage: self.usage });
                AskResult::Reply(reply.content)
            }
            Err(err) => AskResult::Failed(format!("{err:#}")),
        }
    }

    /// Spend a retry unit with a note for the next coder invocation, or
    /// abort if the budget is exhausted.
    fn retry_with_note(&mut self, note: String) -> LoopState {
        if spend_retry(&mut self.task.retries_left) {
            return LoopState::Aborted(BUDGET_EXHAUSTED.to_string());
        }
        self.decline_note = Some(note);
        LoopState::Code
    }

    async fn step_code(&mut self) -> StepOutcome {
        self.iteration += 1;
        let prompt = prompts::coder(
            &self.task,
            self.strategy.as_deref(),
            self.decline_note.take().as_deref(),
        );
        let reply = match self.ask(prompts::CODER_SYSTEM, prompt).await {
            AskResult::Reply(text) => text,
            AskResult::Failed(message) => {
                self.events.error(message.clone());
                return StepOutcome::Next(LoopState::Aborted(format!("oracle failure: {message}")));
            }
            AskResult::Cancelled => return StepOutcome::Cancelled,
        };

        // A fenced code block is the generated code; without one the reply
        // itself is the content, minus any tool block, which is surfaced
        // separately as a proposal.
        let content =
            oracle::extract_code(&reply).unwrap_or_else(|| oracle::strip_tool_blocks(&reply));
        self.events.send(TaskEvent::CodeGenerated {
            content,
            iteration: self.iteration,
        });

        match oracle::extract_tool_proposal(&reply) {
            Ok(Some(proposal)) => {
                let ordinal = self.next_ordinal;
                self.next_ordinal += 1;
                self.events.send(TaskEvent::ToolProposal {
                    proposal: proposal.clone(),
                    ordinal,
                });
                self.proposal = Some(proposal);
                StepOutcome::Next(LoopState::AwaitApproval)
            }
            // No proposal: the reply is a final answer with nothing to
            // execute or review.
            Ok(None) => StepOutcome::Next(LoopState::Done),
            Err(err) => {
                self.events.error(format!("malformed proposal: {err}"));
                StepOutcome::Next(
                    self.retry_with_note(format!("Your previous tool call was malformed: {err}")),
                )
            }
        }
    }

    async fn step_approval(&mut self) -> StepOutcome {
        let Some(proposal) = self.proposal.clone() else {
            return StepOutcome::Next(LoopState::Aborted(
                "internal error: entered approval without a proposal".to_string(),
            ));
        };
        let ordinal = self.next_ordinal - 1;

        let cancel = self.cancel.clone();
        let cleared = tokio::select! {
            _ = cancel.cancelled() => return StepOutcome::Cancelled,
            cleared = self.gateway.clear(&self.task.id, ordinal, &proposal) => cleared,
        };

        match cleared {
            Ok(ApprovalDecision::Approved) => {
                self.events.send(TaskEvent::ApprovalDecision {
                    ordinal,
                    approved: true,
                    reason: None,
                });
                StepOutcome::Next(LoopState::Execute)
            }
            Ok(ApprovalDecision::Denied { reason }) => {
                self.events.send(TaskEvent::ApprovalDecision {
                    ordinal,
                    approved: false,
                    reason: Some(reason.clone()),
                });
                self.proposal = None;
                StepOutcome::Next(self.retry_with_note(format!(
                    "The user declined your proposed {}: {reason}. Propose a different approach.",
                    proposal.tool_name()
                )))
            }
            Err(err) => {
                self.events.error(err.to_string());
                self.proposal = None;
                StepOutcome::Next(
                    self.retry_with_note(format!("Your proposal was rejected: {err}")),
                )
            }
        }
    }

    async fn step_execute(&mut self) -> StepOutcome {
        // The proposal is consumed here, exactly once.
        let Some(proposal) = self.proposal.take() else {
            return StepOutcome::Next(LoopState::Aborted(
                "internal error: entered execute without a proposal".to_string(),
            ));
        };

        let result = match &proposal {
            ToolProposal::WriteFile { path, content } => self.effect_write(path, content).await,
            ToolProposal::ApplyPatch {
                path,
                search,
                replace,
            } => self.effect_patch(path, search, replace).await,
            ToolProposal::ExecuteCommand { command } => {
                match self.effect_command(command).await {
                    Some(result) => result,
                    None => return StepOutcome::Cancelled,
                }
            }
        };

        self.executed_any = true;
        self.executed_proposal = Some(proposal);
        self.events.send(TaskEvent::ExecutionResult {
            result: result.clone(),
        });
        self.result = Some(result);
        StepOutcome::Next(LoopState::Review)
    }

    /// Full-content file replacement, checkpointed and fail-closed.
    async fn effect_write(&self, path: &str, content: &str) -> SandboxResult {
        let resolved = match self.gateway.resolve(path) {
            Ok(resolved) => resolved,
            Err(err) => return SandboxResult::failure(err.to_string()),
        };

        let _guard = self.checkpoints.lock().await;
        if let Err(err) = self
            .checkpoints
            .checkpoint_before(Some(&resolved), &format!("before writing {path}"))
        {
            return SandboxResult::failure(format!("mutation aborted: {err:#}"));
        }
        if let Some(parent) = resolved.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                return SandboxResult::failure(format!("could not create {}: {err}", parent.display()));
            }
        }
        match tokio::fs::write(&resolved, content).await {
            Ok(()) => SandboxResult::synthetic(format!("wrote {} bytes to {path}", content.len())),
            Err(err) => SandboxResult::failure(format!("write failed: {err}")),
        }
    }

    /// Search/replace edit through the patch engine. Patch failures
    /// (not-found, ambiguous) are structured data for the reviewer, never
    /// guesses.
    async fn effect_patch(&self, path: &str, search: &str, replace: &str) -> SandboxResult {
        let resolved = match self.gateway.resolve(path) {
            Ok(resolved) => resolved,
            Err(err) => return SandboxResult::failure(err.to_string()),
        };
        let current = match tokio::fs::read_to_string(&resolved).await {
            Ok(current) => current,
            Err(err) => return SandboxResult::failure(format!("cannot read {path}: {err}")),
        };
        let patched = match patch::apply_patch(&current, search, replace) {
            Ok(patched) => patched,
            Err(err) => return SandboxResult::failure(format!("patch failed: {err}")),
        };

        let _guard = self.checkpoints.lock().await;
        if let Err(err) = self
            .checkpoints
            .checkpoint_before(Some(&resolved), &format!("before patching {path}"))
        {
            return SandboxResult::failure(format!("mutation aborted: {err:#}"));
        }
        match tokio::fs::write(&resolved, patched).await {
            Ok(()) => SandboxResult::synthetic(format!("patched {path}")),
            Err(err) => SandboxResult::failure(format!("write failed: {err}")),
        }
    }

    /// Run a command in the sandbox session. Returns `None` on
    /// cancellation; the session itself survives.
    async fn effect_command(&self, command: &str) -> Option<SandboxResult> {
        let root = self.gateway.root().to_path_buf();
        if let Err(err) = self.sandbox.open(&self.task.session_key, &root).await {
            return Some(SandboxResult::failure(format!("sandbox open failed: {err:#}")));
        }

        // Commands mutate the mounted workspace too, so they take the same
        // lock and checkpoint as file effects.
        let _guard = self.checkpoints.lock().await;
        if let Err(err) = self
            .checkpoints
            .checkpoint_before(None, "before running command")
        {
            return Some(SandboxResult::failure(format!("mutation aborted: {err:#}")));
        }

        let cancel = self.cancel.clone();
        let executed = tokio::select! {
            _ = cancel.cancelled() => {
                // The command outlives its dropped exec client; stop it
                // before handing the workspace back.
                self.sandbox.interrupt(&self.task.session_key).await;
                return None;
            }
            executed = self.sandbox.exec(
                &self.task.session_key,
                command,
                self.sandbox.exec_timeout(),
            ) => executed,
        };
        let mut result = match executed {
            Ok(result) => result,
            Err(err) => return Some(SandboxResult::failure(format!("exec failed: {err:#}"))),
        };

        match self.sandbox.collect_artifacts(&self.task.session_key).await {
            Ok(artifacts) if !artifacts.is_empty() => {
                self.events.send(TaskEvent::ImageGenerated {
                    images: artifacts.clone(),
                });
                result.artifacts = artifacts;
            }
            Ok(_) => {}
            Err(err) => warn!("artifact collection failed: {err:#}"),
        }
        Some(result)
    }

    async fn step_review(&mut self) -> StepOutcome {
        let result = self.result.clone().unwrap_or_default();
        let prompt = prompts::reviewer(&self.task, self.executed_proposal.as_ref(), &result);
        let reply = match self.ask(prompts::REVIEWER_SYSTEM, prompt).await {
            AskResult::Reply(text) => text,
            AskResult::Failed(message) => {
                self.events.error(message.clone());
                return StepOutcome::Next(LoopState::Aborted(format!("oracle failure: {message}")));
            }
            AskResult::Cancelled => return StepOutcome::Cancelled,
        };

        let verdict = oracle::parse_review(&reply);
        self.events.send(TaskEvent::Review {
            verdict: verdict.clone(),
        });

        if verdict.accept {
            self.commit_accepted().await;
            StepOutcome::Next(LoopState::Done)
        } else {
            self.verdict = Some(verdict);
            StepOutcome::Next(LoopState::Reflect)
        }
    }

    /// Commit the accepted change under a readable message, separate from
    /// the defensive pre-flight checkpoint.
    async fn commit_accepted(&self) {
        if !self.checkpoints.is_version_controlled() {
            return;
        }
        let message = commit_message(&self.task.spec.goal);
        let _guard = self.checkpoints.lock().await;
        match self.checkpoints.commit_semantic(&message) {
            Ok(Some(_)) => self.events.send(TaskEvent::CommitProposal { message }),
            Ok(None) => {}
            Err(err) => self.events.error(format!("semantic commit failed: {err:#}")),
        }
    }

    async fn step_reflect(&mut self) -> StepOutcome {
        if self.task.retries_left == 0 {
            return StepOutcome::Next(LoopState::Aborted(BUDGET_EXHAUSTED.to_string()));
        }

        let verdict = self.verdict.clone().unwrap_or(ReviewVerdict {
            accept: false,
            feedback: String::new(),
            defects: Vec::new(),
        });
        let result = self.result.clone().unwrap_or_default();
        let prompt = prompts::reflector(&self.task, &verdict, &result);

        match self.ask(prompts::REFLECTOR_SYSTEM, prompt).await {
            AskResult::Reply(strategy) => {
                self.events.send(TaskEvent::Reflection {
                    strategy: strategy.clone(),
                });
                self.strategy = Some(strategy);
                if spend_retry(&mut self.task.retries_left) {
                    StepOutcome::Next(LoopState::Aborted(BUDGET_EXHAUSTED.to_string()))
                } else {
                    StepOutcome::Next(LoopState::Code)
                }
            }
            AskResult::Failed(message) => {
                self.events.error(message.clone());
                StepOutcome::Next(LoopState::Aborted(format!("oracle failure: {message}")))
            }
            AskResult::Cancelled => StepOutcome::Cancelled,
        }
    }

    /// Best-effort summary before the terminal event. Only runs when an
    /// effect was executed; a direct answer already is the summary.
    async fn finish_done(&mut self) -> TaskOutcome {
        if self.executed_any {
            let stdout = self
                .result
                .as_ref()
                .map(|result| result.stdout.clone())
                .unwrap_or_default();
            let prompt = prompts::summarizer(&self.task, &stdout);
            if let AskResult::Reply(content) = self.ask(prompts::SUMMARIZER_SYSTEM, prompt).await {
                self.events.send(TaskEvent::Summary { content });
            }
        }
        TaskOutcome::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spend_retry_counts_down_to_exhaustion() {
        let mut retries = 2;
        assert!(!spend_retry(&mut retries));
        assert!(spend_retry(&mut retries));
        // Already exhausted stays exhausted, no underflow.
        assert!(spend_retry(&mut retries));
        assert_eq!(retries, 0);
    }

    #[test]
    fn test_commit_message_caps_first_line() {
        let goal = "add a function add(a,b)\nwith docs";
        assert_eq!(commit_message(goal), "crucible: add a function add(a,b)");
        let long = "x".repeat(200);
        assert!(commit_message(&long).chars().count() <= 82);
    }
}
