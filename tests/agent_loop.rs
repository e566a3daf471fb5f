//! End-to-end loop tests with a scripted oracle: no network, no Docker.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use crucible::config::Config;
use crucible::engine::Engine;
use crucible::events::{TaskEvent, TaskOutcome};
use crucible::gateway::AutoApprove;
use crucible::oracle::{Oracle, OracleResponse};
use crucible::sandbox::{SandboxConfig, SandboxManager};
use crucible::task::TaskSpec;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Replays a fixed sequence of oracle replies. Running past the end of
/// the script is a test failure surfaced as an oracle error.
struct ScriptedOracle {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedOracle {
    fn new(replies: &[&str]) -> Self {
        ScriptedOracle {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
        }
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn complete(&self, _system: &str, _user: &str) -> Result<OracleResponse> {
        let reply = self
            .replies
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| anyhow!("scripted oracle ran out of replies"))?;
        Ok(OracleResponse {
            content: reply,
            usage: None,
        })
    }
}

fn scripted_engine(replies: &[&str]) -> Arc<Engine> {
    Engine::with_sandbox(
        Config::default(),
        Arc::new(ScriptedOracle::new(replies)),
        Arc::new(AutoApprove),
        Arc::new(SandboxManager::disabled(SandboxConfig::default())),
    )
}

async fn run_to_completion(engine: &Engine, spec: TaskSpec) -> Vec<TaskEvent> {
    let mut handle = engine.submit(spec).await;
    let mut events = Vec::new();
    while let Some(event) = handle.events.recv().await {
        events.push(event);
    }
    events
}

fn outcome_of(events: &[TaskEvent]) -> TaskOutcome {
    match events.last() {
        Some(TaskEvent::Finished { outcome }) => outcome.clone(),
        other => panic!("stream did not end with Finished: {other:?}"),
    }
}

const APPROVE_REVIEW: &str = r#"{"status": "approve", "feedback": "looks correct", "defects": []}"#;
const REJECT_REVIEW: &str =
    r#"{"status": "reject", "feedback": "the change did not apply", "defects": ["patch failed"]}"#;

#[tokio::test]
async fn test_write_file_accepted_first_pass() {
    let dir = tempfile::tempdir().unwrap();
    let coder = "Creating the module.\n\
```python\ndef add(a, b):\n    return a + b\n```\n\
```tool\n{\"tool\": \"write_file\", \"params\": {\"path\": \"calc.py\", \"content\": \"def add(a, b):\\n    return a + b\\n\"}}\n```";
    let engine = scripted_engine(&[coder, APPROVE_REVIEW, "Created calc.py with an add function."]);

    let events = run_to_completion(&engine, TaskSpec::new("add an add function", dir.path())).await;
    assert_eq!(outcome_of(&events), TaskOutcome::Done);

    let written = std::fs::read_to_string(dir.path().join("calc.py")).unwrap();
    assert!(written.contains("def add"));

    let approvals: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, TaskEvent::ApprovalDecision { approved: true, .. }))
        .collect();
    assert_eq!(approvals.len(), 1);
    assert!(events
        .iter()
        .any(|e| matches!(e, TaskEvent::ExecutionResult { result } if result.passed())));
    assert!(events
        .iter()
        .any(|e| matches!(e, TaskEvent::Summary { .. })));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_ambiguous_patch_recovers_through_reflection() {
    let dir = tempfile::tempdir().unwrap();
    // Two identical regions: the patch engine must refuse to guess.
    std::fs::write(dir.path().join("config.py"), "timeout = 10\nretries = 3\ntimeout = 10\n").unwrap();

    let coder_patch = "Bumping the timeout.\n\
```tool\n{\"tool\": \"apply_patch\", \"params\": {\"path\": \"config.py\", \"search\": \"timeout = 10\", \"replace\": \"timeout = 30\"}}\n```";
    let reflection = "The search text matched more than one region. Include surrounding lines to disambiguate, or answer directly.";
    let final_answer = "The file has two identical timeout lines; please tell me which one to change.";
    let engine = scripted_engine(&[
        coder_patch,
        REJECT_REVIEW,
        reflection,
        final_answer,
        "Asked the user to disambiguate.",
    ]);

    let events = run_to_completion(&engine, TaskSpec::new("raise the timeout", dir.path())).await;
    assert_eq!(outcome_of(&events), TaskOutcome::Done);

    // The ambiguity surfaced as execution data, not a crash.
    assert!(events.iter().any(|e| matches!(
        e,
        TaskEvent::ExecutionResult { result } if result.stderr.contains("patch failed")
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, TaskEvent::Reflection { .. })));
    // The file is untouched.
    let content = std::fs::read_to_string(dir.path().join("config.py")).unwrap();
    assert_eq!(content.matches("timeout = 10").count(), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_retry_budget_bounds_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let coder = "Trying again.\n\
```tool\n{\"tool\": \"write_file\", \"params\": {\"path\": \"out.txt\", \"content\": \"attempt\\n\"}}\n```";
    let reflection = "Take a different approach next attempt.";
    // Budget 2: two full reflect cycles, then the loop gives up.
    let engine = scripted_engine(&[
        coder, REJECT_REVIEW, reflection, coder, REJECT_REVIEW, reflection,
    ]);

    let mut spec = TaskSpec::new("an impossible task", dir.path());
    spec.retry_budget = Some(2);
    let events = run_to_completion(&engine, spec).await;

    match outcome_of(&events) {
        TaskOutcome::Aborted { reason } => assert!(reason.contains("budget exhausted")),
        other => panic!("expected abort, got {other:?}"),
    }

    let reflections = events
        .iter()
        .filter(|e| matches!(e, TaskEvent::Reflection { .. }))
        .count();
    assert_eq!(reflections, 2);
    let generations = events
        .iter()
        .filter(|e| matches!(e, TaskEvent::CodeGenerated { .. }))
        .count();
    assert!(generations <= 3);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_denied_proposal_consumes_retry() {
    use crucible::gateway::{ApprovalDecision, ApprovalRequest, ApprovalSink};

    struct DenyAll;
    #[async_trait]
    impl ApprovalSink for DenyAll {
        async fn request(&self, _req: ApprovalRequest) -> ApprovalDecision {
            ApprovalDecision::Denied {
                reason: "not today".to_string(),
            }
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let coder = "Proposing a write.\n\
```tool\n{\"tool\": \"write_file\", \"params\": {\"path\": \"x.txt\", \"content\": \"x\"}}\n```";
    let engine = Engine::with_sandbox(
        Config::default(),
        Arc::new(ScriptedOracle::new(&[coder, coder])),
        Arc::new(DenyAll),
        Arc::new(SandboxManager::disabled(SandboxConfig::default())),
    );

    let mut spec = TaskSpec::new("write a file", dir.path());
    spec.retry_budget = Some(2);
    let events = run_to_completion(&engine, spec).await;

    match outcome_of(&events) {
        TaskOutcome::Aborted { reason } => assert!(reason.contains("budget exhausted")),
        other => panic!("expected abort, got {other:?}"),
    }
    // Nothing was ever written.
    assert!(!dir.path().join("x.txt").exists());
    assert!(events.iter().any(|e| matches!(
        e,
        TaskEvent::ApprovalDecision { approved: false, .. }
    )));
    // With no code fence, the published content is the prose around the
    // proposal, never the raw tool JSON.
    for event in &events {
        if let TaskEvent::CodeGenerated { content, .. } = event {
            assert_eq!(content, "Proposing a write.");
        }
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn test_blocked_command_never_reaches_execution() {
    let dir = tempfile::tempdir().unwrap();
    let coder = "Cleaning up.\n\
```tool\n{\"tool\": \"execute_command\", \"params\": {\"command\": \"sudo rm -rf /\"}}\n```";
    let engine = scripted_engine(&[coder, "I cannot run that command safely."]);

    let mut spec = TaskSpec::new("clean the disk", dir.path());
    spec.retry_budget = Some(3);
    let events = run_to_completion(&engine, spec).await;
    assert_eq!(outcome_of(&events), TaskOutcome::Done);

    // The gateway refused before execution; no ExecutionResult was emitted.
    assert!(!events
        .iter()
        .any(|e| matches!(e, TaskEvent::ExecutionResult { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, TaskEvent::Error { .. })));
    engine.shutdown().await;
}
