//! The code-generation oracle and its response protocol.
//!
//! The oracle is a black box: given a prompt it returns text that may
//! contain free-form explanation, a fenced code block, and at most one
//! structured tool call. This module defines the [`Oracle`] trait the loop
//! depends on, an OpenRouter-backed implementation, and the parsing of
//! oracle output into typed pieces.

use crate::gateway::ToolProposal;
use crate::task::ReviewVerdict;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const REQUEST_TIMEOUT_SECS: u64 = 90;

/// Rate limit retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u64 = 2;

/// Token/cost accounting as reported by the provider.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    /// Cost in USD; OpenRouter reports this as `total_cost`.
    #[serde(default, alias = "total_cost")]
    pub cost: Option<f64>,
}

/// One oracle completion.
#[derive(Debug, Clone)]
pub struct OracleResponse {
    pub content: String,
    pub usage: Option<Usage>,
}

/// The external code-generation model, treated as a black box.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<OracleResponse>;
}

// ═══════════════════════════════════════════════════════════════════════════
//  OPENROUTER CLIENT
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

pub struct OpenRouterOracle {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl OpenRouterOracle {
    pub fn new(api_key: String, model: String, max_tokens: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(OpenRouterOracle {
            client,
            api_key,
            model,
            max_tokens,
        })
    }
}

#[async_trait]
impl Oracle for OpenRouterOracle {
    async fn complete(&self, system: &str, user: &str) -> Result<OracleResponse> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system",
                    content: system.to_string(),
                },
                Message {
                    role: "user",
                    content: user.to_string(),
                },
            ],
            max_tokens: self.max_tokens,
            stream: false,
        };

        let mut backoff_ms = INITIAL_BACKOFF_MS;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = self
                .client
                .post(OPENROUTER_URL)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&request)
                .send()
                .await?;

            let status = response.status();
            let text = response.text().await?;

            if status.as_u16() == 429 && attempt <= MAX_RETRIES {
                tracing::warn!(attempt, "rate limited; backing off {}ms", backoff_ms);
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= BACKOFF_MULTIPLIER;
                continue;
            }
            if !status.is_success() {
                if let Ok(err) = serde_json::from_str::<ErrorResponse>(&text) {
                    return Err(anyhow!("API error: {}", err.error.message));
                }
                return Err(anyhow!("API error {}: {}", status, text));
            }

            let parsed: ChatResponse = serde_json::from_str(&text)
                .map_err(|e| anyhow!("failed to parse oracle response: {e}\n{text}"))?;
            let content = parsed
                .choices
                .first()
                .and_then(|c| c.message.content.clone())
                .ok_or_else(|| anyhow!("empty response from oracle"))?;

            return Ok(OracleResponse {
                content,
                usage: parsed.usage,
            });
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  RESPONSE PARSING
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProposalParseError {
    #[error("response contains {0} tool blocks; at most one is allowed")]
    MultipleToolBlocks(usize),
    #[error("tool block is not valid JSON: {0}")]
    InvalidJson(String),
}

/// A fenced block: language tag plus body.
fn fenced_blocks(text: &str) -> Vec<(String, String)> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        let Some(close) = after_open.find("```") else {
            break;
        };
        let inner = &after_open[..close];
        let (tag, body) = match inner.find('\n') {
            Some(nl) => (inner[..nl].trim().to_string(), inner[nl + 1..].to_string()),
            None => (String::new(), inner.to_string()),
        };
        blocks.push((tag, body));
        rest = &after_open[close + 3..];
    }
    blocks
}

/// Extract the single structured tool call from oracle output, if any.
///
/// The protocol: a fenced ```tool block whose body is JSON of the form
/// `{"tool": ..., "params": {...}}`. More than one block, or a block that
/// fails to parse, is a malformed proposal.
pub fn extract_tool_proposal(response: &str) -> Result<Option<ToolProposal>, ProposalParseError> {
    let blocks = fenced_blocks(response);
    let tool_bodies: Vec<&String> = blocks
        .iter()
        .filter(|(tag, _)| tag == "tool")
        .map(|(_, body)| body)
        .collect();

    match tool_bodies.len() {
        0 => Ok(None),
        1 => serde_json::from_str::<ToolProposal>(tool_bodies[0].trim())
            .map(Some)
            .map_err(|e| ProposalParseError::InvalidJson(e.to_string())),
        n => Err(ProposalParseError::MultipleToolBlocks(n)),
    }
}

/// Extract generated code from oracle output: the first fenced block that
/// is not the tool call or a JSON payload.
pub fn extract_code(response: &str) -> Option<String> {
    fenced_blocks(response)
        .into_iter()
        .find(|(tag, _)| tag != "tool" && tag != "json")
        .map(|(_, body)| body.trim_end().to_string())
}

/// The response with any fenced ```tool blocks removed. Used when a reply
/// has no code fence: the surrounding prose is worth surfacing, the raw
/// proposal JSON is not.
pub fn strip_tool_blocks(response: &str) -> String {
    let mut out = String::with_capacity(response.len());
    let mut rest = response;
    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        let Some(close) = after_open.find("```") else {
            break;
        };
        let inner = &after_open[..close];
        let tag = match inner.find('\n') {
            Some(nl) => inner[..nl].trim(),
            None => "",
        };
        let block_end = open + 3 + close + 3;
        if tag == "tool" {
            out.push_str(&rest[..open]);
        } else {
            out.push_str(&rest[..block_end]);
        }
        rest = &rest[block_end..];
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Strip markdown code fences from a response
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    clean.strip_suffix("```").unwrap_or(clean).trim()
}

/// Extract a JSON fragment between matching delimiters
fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

#[derive(Deserialize)]
struct ReviewJson {
    status: String,
    #[serde(default)]
    feedback: String,
    #[serde(default)]
    defects: Vec<String>,
}

/// Parse the reviewer's JSON verdict, tolerantly.
///
/// An unparseable review rejects rather than crashes: the loop treats it
/// like any other defect and retries.
pub fn parse_review(response: &str) -> ReviewVerdict {
    let clean = strip_markdown_fences(response);
    let json_str = extract_json_fragment(clean, '{', '}').unwrap_or(clean);
    match serde_json::from_str::<ReviewJson>(json_str) {
        Ok(parsed) => ReviewVerdict {
            accept: parsed.status.eq_ignore_ascii_case("approve"),
            feedback: parsed.feedback,
            defects: parsed.defects,
        },
        Err(err) => ReviewVerdict {
            accept: false,
            feedback: format!("review response was not valid JSON: {err}"),
            defects: vec!["unparseable review response".to_string()],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_code_block() {
        let response = "Here you go:\n```python\nprint('hi')\n```\nDone.";
        assert_eq!(extract_code(response).unwrap(), "print('hi')");
    }

    #[test]
    fn test_extract_code_skips_tool_block() {
        let response = "```tool\n{\"tool\": \"execute_command\", \"params\": {\"command\": \"ls\"}}\n```\n```rust\nfn f() {}\n```";
        assert_eq!(extract_code(response).unwrap(), "fn f() {}");
    }

    #[test]
    fn test_strip_tool_blocks_removes_only_tool_fences() {
        let response =
            "Running the check.\n```tool\n{\"tool\": \"execute_command\", \"params\": {\"command\": \"pytest\"}}\n```\nWill report back.";
        let stripped = strip_tool_blocks(response);
        assert!(!stripped.contains("```"));
        assert!(!stripped.contains("execute_command"));
        assert!(stripped.starts_with("Running the check."));
        assert!(stripped.ends_with("Will report back."));
    }

    #[test]
    fn test_strip_tool_blocks_keeps_code_fences() {
        let response = "```rust\nfn f() {}\n```\n```tool\n{\"tool\": \"execute_command\", \"params\": {\"command\": \"ls\"}}\n```";
        let stripped = strip_tool_blocks(response);
        assert!(stripped.contains("fn f() {}"));
        assert!(!stripped.contains("execute_command"));
    }

    #[test]
    fn test_extract_tool_proposal() {
        let response = "I'll create the file.\n```tool\n{\"tool\": \"write_file\", \"params\": {\"path\": \"src/calc.rs\", \"content\": \"pub fn add(a: i32, b: i32) -> i32 { a + b }\"}}\n```";
        let proposal = extract_tool_proposal(response).unwrap().unwrap();
        assert_eq!(proposal.tool_name(), "write_file");
    }

    #[test]
    fn test_no_tool_proposal_is_final_answer() {
        let response = "The bug is on line 12; change `<=` to `<`.";
        assert!(extract_tool_proposal(response).unwrap().is_none());
    }

    #[test]
    fn test_multiple_tool_blocks_rejected() {
        let response = "```tool\n{\"tool\": \"execute_command\", \"params\": {\"command\": \"ls\"}}\n```\n```tool\n{\"tool\": \"execute_command\", \"params\": {\"command\": \"pwd\"}}\n```";
        assert_eq!(
            extract_tool_proposal(response),
            Err(ProposalParseError::MultipleToolBlocks(2))
        );
    }

    #[test]
    fn test_malformed_tool_json_rejected() {
        let response = "```tool\nnot json at all\n```";
        assert!(matches!(
            extract_tool_proposal(response),
            Err(ProposalParseError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_parse_review_accept() {
        let response = "```json\n{\"status\": \"approve\", \"feedback\": \"looks right\"}\n```";
        let verdict = parse_review(response);
        assert!(verdict.accept);
        assert_eq!(verdict.feedback, "looks right");
    }

    #[test]
    fn test_parse_review_reject_with_defects() {
        let response = r#"{"status": "reject", "feedback": "off by one", "defects": ["loop bound"]}"#;
        let verdict = parse_review(response);
        assert!(!verdict.accept);
        assert_eq!(verdict.defects, vec!["loop bound"]);
    }

    #[test]
    fn test_parse_review_garbage_rejects() {
        let verdict = parse_review("I think it's fine?");
        assert!(!verdict.accept);
        assert!(!verdict.defects.is_empty());
    }

    #[test]
    fn test_parse_review_with_surrounding_prose() {
        let response = "Here's my verdict:\n{\"status\": \"approve\", \"feedback\": \"ok\"}\nthanks";
        assert!(parse_review(response).accept);
    }
}
