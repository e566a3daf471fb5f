//! Prompt assembly for the four loop roles.
//!
//! Content here is deliberately plain: the engine's contract is the
//! structure of each exchange (what context goes in, what shape comes
//! back), not the wording.

use crate::gateway::ToolProposal;
use crate::task::{ReviewVerdict, SandboxResult, Task, TaskMode};

pub const CODER_SYSTEM: &str = "You are a coding agent embedded in an editor. Respond with a \
short explanation, the code in a fenced block, and at most ONE fenced ```tool block containing \
JSON {\"tool\": \"write_file\"|\"apply_patch\"|\"execute_command\", \"params\": {...}}. If no \
action is needed, answer directly with no tool block.";

pub const REVIEWER_SYSTEM: &str = "You are a strict code reviewer. Respond with JSON only: \
{\"status\": \"approve\"|\"reject\", \"feedback\": \"...\", \"defects\": [\"...\"]}.";

pub const REFLECTOR_SYSTEM: &str = "You are a tech lead producing a concrete fix strategy for \
the next coding attempt. Respond with a short, actionable plan in plain text.";

pub const SUMMARIZER_SYSTEM: &str = "Summarize what was done and the final result for the user. \
Plain text, a few sentences.";

/// Coder input: goal, editor context, and any feedback from the previous
/// iteration (fix strategy or a declined action).
pub fn coder(task: &Task, strategy: Option<&str>, decline_note: Option<&str>) -> String {
    let mut prompt = format!("## Goal\n{}\n", task.spec.goal);

    match task.spec.mode {
        TaskMode::Agent => {}
        TaskMode::Chat => {
            prompt.push_str("\nAnswer conversationally; only propose an action if one is clearly needed.\n");
        }
        TaskMode::Edit => {
            prompt.push_str("\nPrefer a minimal apply_patch edit to the current file.\n");
        }
    }

    if let Some(file) = &task.spec.context.file {
        prompt.push_str(&format!(
            "\n## Current file context\n- Filename: `{}`\n- Language: `{}`\n- Cursor line: {}\n- Selection:\n```\n{}\n```\n- Full content:\n```\n{}\n```\n",
            file.filename,
            file.language_id,
            file.cursor_line,
            file.selection.as_deref().unwrap_or("(no selection)"),
            file.content,
        ));
    }
    if !task.spec.context.diagnostics.is_empty() {
        prompt.push_str("\n## Diagnostics\n");
        for diagnostic in &task.spec.context.diagnostics {
            prompt.push_str(&format!("- {diagnostic}\n"));
        }
    }
    if let Some(digest) = &task.spec.context.structure_digest {
        prompt.push_str(&format!("\n## Project structure\n{digest}\n"));
    }
    if let Some(strategy) = strategy {
        prompt.push_str(&format!("\n## Fix strategy from the previous attempt\n{strategy}\n"));
    }
    if let Some(note) = decline_note {
        prompt.push_str(&format!("\n## Note\n{note}\n"));
    }
    prompt
}

/// Reviewer input: goal, the proposed action, and what actually happened.
pub fn reviewer(task: &Task, proposal: Option<&ToolProposal>, result: &SandboxResult) -> String {
    let action = proposal
        .map(ToolProposal::preview)
        .unwrap_or_else(|| "(no action)".to_string());
    format!(
        "## Goal\n{}\n\n## Action taken\n{}\n\n## Execution\nexit code: {}\ntimed out: {}\nskipped (no sandbox): {}\n\n### stdout\n{}\n\n### stderr\n{}\n",
        task.spec.goal, action, result.exit_code, result.timed_out, result.skipped,
        result.stdout, result.stderr,
    )
}

/// Reflector input: the rejection and its defects.
pub fn reflector(task: &Task, verdict: &ReviewVerdict, result: &SandboxResult) -> String {
    format!(
        "## Goal\n{}\n\n## Review feedback\n{}\n\n## Defects\n{}\n\n## stderr from execution\n{}\n",
        task.spec.goal,
        verdict.feedback,
        verdict
            .defects
            .iter()
            .map(|d| format!("- {d}"))
            .collect::<Vec<_>>()
            .join("\n"),
        result.stderr,
    )
}

/// Summarizer input: goal and final output.
pub fn summarizer(task: &Task, stdout: &str) -> String {
    format!(
        "## Goal\n{}\n\n## Final execution output\n{}\n",
        task.spec.goal, stdout
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{FileContext, TaskSpec};

    fn task_with_context() -> Task {
        let mut spec = TaskSpec::new("add a function", "/tmp/ws");
        spec.context.file = Some(FileContext {
            filename: "calc.py".to_string(),
            language_id: "python".to_string(),
            cursor_line: 3,
            selection: None,
            content: "x = 1\n".to_string(),
        });
        spec.context.diagnostics = vec!["E999 syntax error".to_string()];
        Task::new(spec, 5)
    }

    #[test]
    fn test_coder_prompt_embeds_context() {
        let task = task_with_context();
        let prompt = coder(&task, Some("try smaller steps"), None);
        assert!(prompt.contains("add a function"));
        assert!(prompt.contains("calc.py"));
        assert!(prompt.contains("E999"));
        assert!(prompt.contains("try smaller steps"));
    }

    #[test]
    fn test_reviewer_prompt_includes_execution() {
        let task = task_with_context();
        let result = SandboxResult::failure("Traceback: boom");
        let prompt = reviewer(&task, None, &result);
        assert!(prompt.contains("exit code: 1"));
        assert!(prompt.contains("Traceback: boom"));
    }
}
