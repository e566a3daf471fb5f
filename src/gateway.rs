//! Tool gateway: the single trust boundary between agent intent and effect.
//!
//! Every proposed side effect passes through here before anything touches
//! the file system or a shell. The gateway checks workspace-boundary and
//! capability rules, then brokers an explicit allow/deny decision from the
//! controlling party. No other component mutates files or spawns commands
//! directly.

use crate::task::TaskId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// A structured, machine-parseable request for a side effect, emitted by
/// the coder. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "params", rename_all = "snake_case")]
pub enum ToolProposal {
    /// Full-content file replacement.
    WriteFile { path: String, content: String },
    /// Localized search/replace edit (see the patch engine).
    ApplyPatch {
        path: String,
        search: String,
        replace: String,
    },
    /// Shell command to run inside the sandbox session.
    ExecuteCommand { command: String },
}

impl ToolProposal {
    pub fn tool_name(&self) -> &'static str {
        match self {
            ToolProposal::WriteFile { .. } => "write_file",
            ToolProposal::ApplyPatch { .. } => "apply_patch",
            ToolProposal::ExecuteCommand { .. } => "execute_command",
        }
    }

    /// What the approver sees: a file summary or the literal command text.
    pub fn preview(&self) -> String {
        match self {
            ToolProposal::WriteFile { path, content } => {
                format!("write {} ({} bytes)", path, content.len())
            }
            ToolProposal::ApplyPatch { path, search, replace } => format!(
                "patch {} (-{} +{} lines)",
                path,
                search.lines().count(),
                replace.lines().count()
            ),
            ToolProposal::ExecuteCommand { command } => format!("$ {}", command),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("path escapes the workspace root: {0}")]
    PathEscapes(String),
    #[error("absolute paths are not allowed: {0}")]
    AbsolutePath(String),
    #[error("command blocked for safety: contains '{0}'")]
    BlockedCommand(String),
    #[error("malformed proposal: {0}")]
    Malformed(String),
}

/// Commands that are refused outright: system-level destruction that no
/// workspace task legitimately needs.
const BLOCKED_PATTERNS: &[&str] = &[
    "sudo ",
    "rm -rf /",
    "rm -rf /*",
    "rm -rf ~",
    "mkfs",
    "dd if=",
    ":(){", // fork bomb
    "chmod -R 777 /",
    "chown -R",
    "> /dev/",
    "curl | sh",
    "curl | bash",
    "wget | sh",
    "wget | bash",
];

/// Resolve a proposal path against the workspace root, rejecting absolute
/// paths and any traversal that escapes the root after normalization.
pub fn validate_path(root: &Path, relative: &str) -> Result<PathBuf, GatewayError> {
    if relative.trim().is_empty() {
        return Err(GatewayError::Malformed("empty path".to_string()));
    }
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(GatewayError::AbsolutePath(relative.to_string()));
    }

    let mut depth: usize = 0;
    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => {
                normalized.push(part);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return Err(GatewayError::PathEscapes(relative.to_string()));
                }
                normalized.pop();
                depth -= 1;
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(GatewayError::AbsolutePath(relative.to_string()));
            }
        }
    }
    if depth == 0 {
        return Err(GatewayError::Malformed(format!(
            "path resolves to the workspace root itself: {relative}"
        )));
    }
    Ok(root.join(normalized))
}

/// Screen a shell command against the blocked-pattern list.
pub fn screen_command(command: &str) -> Result<(), GatewayError> {
    let lowered = command.to_lowercase();
    for pattern in BLOCKED_PATTERNS {
        if lowered.contains(&pattern.to_lowercase()) {
            return Err(GatewayError::BlockedCommand((*pattern).to_string()));
        }
    }
    Ok(())
}

/// Allow/deny decision from the controlling party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Denied { reason: String },
}

/// A proposal surfaced for approval, identified by task id and ordinal.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub task_id: TaskId,
    pub ordinal: u32,
    pub proposal: ToolProposal,
    pub preview: String,
}

/// The suspension-point abstraction for approvals: the loop blocks on this
/// uniformly whether decisions come from a human or are auto-granted.
#[async_trait]
pub trait ApprovalSink: Send + Sync {
    async fn request(&self, req: ApprovalRequest) -> ApprovalDecision;
}

/// Grants every request. For headless runs and tests.
pub struct AutoApprove;

#[async_trait]
impl ApprovalSink for AutoApprove {
    async fn request(&self, _req: ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::Approved
    }
}

/// A pending approval forwarded to the host, answered over a oneshot.
pub struct PendingApproval {
    pub request: ApprovalRequest,
    pub respond: oneshot::Sender<ApprovalDecision>,
}

/// Forwards requests to an out-of-band consumer and waits for its answer,
/// denying by default when the timeout elapses.
pub struct ChannelApprovals {
    outbound: mpsc::UnboundedSender<PendingApproval>,
    timeout: Duration,
}

impl ChannelApprovals {
    pub fn new(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<PendingApproval>) {
        let (outbound, inbound) = mpsc::unbounded_channel();
        (ChannelApprovals { outbound, timeout }, inbound)
    }
}

#[async_trait]
impl ApprovalSink for ChannelApprovals {
    async fn request(&self, req: ApprovalRequest) -> ApprovalDecision {
        let (tx, rx) = oneshot::channel();
        let pending = PendingApproval {
            request: req,
            respond: tx,
        };
        if self.outbound.send(pending).is_err() {
            return ApprovalDecision::Denied {
                reason: "approval channel closed".to_string(),
            };
        }
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => ApprovalDecision::Denied {
                reason: "approver went away without deciding".to_string(),
            },
            Err(_) => ApprovalDecision::Denied {
                reason: "approval timed out".to_string(),
            },
        }
    }
}

/// Validates proposals and brokers approval for one task's workspace.
pub struct ToolGateway {
    root: PathBuf,
    approvals: std::sync::Arc<dyn ApprovalSink>,
}

impl ToolGateway {
    pub fn new(root: impl Into<PathBuf>, approvals: std::sync::Arc<dyn ApprovalSink>) -> Self {
        ToolGateway {
            root: root.into(),
            approvals,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Capability and boundary checks. Runs before any approval is asked
    /// for; a malformed proposal never reaches the approver.
    pub fn validate(&self, proposal: &ToolProposal) -> Result<(), GatewayError> {
        match proposal {
            ToolProposal::WriteFile { path, .. } => {
                validate_path(&self.root, path)?;
            }
            ToolProposal::ApplyPatch { path, search, .. } => {
                validate_path(&self.root, path)?;
                if search.trim().is_empty() {
                    return Err(GatewayError::Malformed(
                        "apply_patch requires a non-empty search block".to_string(),
                    ));
                }
            }
            ToolProposal::ExecuteCommand { command } => {
                if command.trim().is_empty() {
                    return Err(GatewayError::Malformed(
                        "execute_command requires a command".to_string(),
                    ));
                }
                screen_command(command)?;
            }
        }
        Ok(())
    }

    /// Validate, then suspend until the controlling party decides.
    pub async fn clear(
        &self,
        task_id: &TaskId,
        ordinal: u32,
        proposal: &ToolProposal,
    ) -> Result<ApprovalDecision, GatewayError> {
        self.validate(proposal)?;
        let req = ApprovalRequest {
            task_id: task_id.clone(),
            ordinal,
            proposal: proposal.clone(),
            preview: proposal.preview(),
        };
        Ok(self.approvals.request(req).await)
    }

    /// Resolve an already-validated proposal path against the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, GatewayError> {
        validate_path(&self.root, relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_validate_path_rejects_traversal() {
        let root = Path::new("/workspace");
        assert!(matches!(
            validate_path(root, "../../etc/passwd"),
            Err(GatewayError::PathEscapes(_))
        ));
        assert!(matches!(
            validate_path(root, "src/../../escape.txt"),
            Err(GatewayError::PathEscapes(_))
        ));
    }

    #[test]
    fn test_validate_path_rejects_absolute() {
        let root = Path::new("/workspace");
        assert!(matches!(
            validate_path(root, "/etc/passwd"),
            Err(GatewayError::AbsolutePath(_))
        ));
    }

    #[test]
    fn test_validate_path_normalizes_internal_dotdot() {
        let root = Path::new("/workspace");
        let resolved = validate_path(root, "src/sub/../main.rs").unwrap();
        assert_eq!(resolved, PathBuf::from("/workspace/src/main.rs"));
    }

    #[test]
    fn test_validate_path_rejects_root_itself() {
        let root = Path::new("/workspace");
        assert!(validate_path(root, ".").is_err());
        assert!(validate_path(root, "src/..").is_err());
    }

    #[test]
    fn test_screen_command_blocks_danger() {
        assert!(matches!(
            screen_command("sudo rm -rf /"),
            Err(GatewayError::BlockedCommand(_))
        ));
        assert!(screen_command("cargo test -q").is_ok());
    }

    #[test]
    fn test_proposal_wire_format() {
        let json = r#"{"tool": "write_file", "params": {"path": "src/calc.rs", "content": "pub fn add(a: i32, b: i32) -> i32 { a + b }"}}"#;
        let proposal: ToolProposal = serde_json::from_str(json).unwrap();
        assert_eq!(proposal.tool_name(), "write_file");
        match proposal {
            ToolProposal::WriteFile { path, .. } => assert_eq!(path, "src/calc.rs"),
            other => panic!("unexpected proposal: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tool_fails_to_parse() {
        let json = r#"{"tool": "format_disk", "params": {}}"#;
        assert!(serde_json::from_str::<ToolProposal>(json).is_err());
    }

    #[test]
    fn test_gateway_validate_patch_needs_search() {
        let gateway = ToolGateway::new("/workspace", Arc::new(AutoApprove));
        let bad = ToolProposal::ApplyPatch {
            path: "src/lib.rs".to_string(),
            search: "   ".to_string(),
            replace: "x".to_string(),
        };
        assert!(matches!(
            gateway.validate(&bad),
            Err(GatewayError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_auto_approve_clears_valid_proposal() {
        let gateway = ToolGateway::new("/workspace", Arc::new(AutoApprove));
        let proposal = ToolProposal::ExecuteCommand {
            command: "echo hi".to_string(),
        };
        let decision = gateway
            .clear(&TaskId::new(), 0, &proposal)
            .await
            .unwrap();
        assert_eq!(decision, ApprovalDecision::Approved);
    }

    #[tokio::test]
    async fn test_channel_approvals_denies_on_timeout() {
        let (sink, _inbound) = ChannelApprovals::new(Duration::from_millis(20));
        let decision = sink
            .request(ApprovalRequest {
                task_id: TaskId::new(),
                ordinal: 0,
                proposal: ToolProposal::ExecuteCommand {
                    command: "echo hi".to_string(),
                },
                preview: "$ echo hi".to_string(),
            })
            .await;
        assert!(matches!(decision, ApprovalDecision::Denied { .. }));
    }

    #[tokio::test]
    async fn test_channel_approvals_round_trip() {
        let (sink, mut inbound) = ChannelApprovals::new(Duration::from_secs(5));
        let fut = sink.request(ApprovalRequest {
            task_id: TaskId::new(),
            ordinal: 3,
            proposal: ToolProposal::ExecuteCommand {
                command: "ls".to_string(),
            },
            preview: "$ ls".to_string(),
        });

        let approver = tokio::spawn(async move {
            let pending = inbound.recv().await.expect("pending approval");
            assert_eq!(pending.request.ordinal, 3);
            pending.respond.send(ApprovalDecision::Approved).ok();
        });

        assert_eq!(fut.await, ApprovalDecision::Approved);
        approver.await.unwrap();
    }
}
