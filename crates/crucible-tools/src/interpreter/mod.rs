//! Literal-only reader for agent-authored tool calls.
//!
//! Source text is tokenized and parsed into an AST, every call expression is
//! checked, and only `callTool("<name>", <literal>)` forms survive. Nothing is
//! ever evaluated: the only effect a program can have is dispatching a
//! registered tool with JSON-shaped arguments.

mod ast;
mod lexer;
mod parser;
mod validate;

use thiserror::Error;

use crucible_observability::redact_text;
use crucible_types::{ToolCall, ToolCallOutcome};

use crate::{ToolContext, ToolRegistry};

pub use validate::CALL_TOOL;

const FENCE: &str = "```";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InterpreterError {
    #[error("unsupported literal at offset {offset}: {reason}")]
    UnsupportedLiteral { offset: usize, reason: String },

    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },
}

/// Returns the bodies of all fenced code blocks, or the whole text when it
/// contains none. An unterminated fence ends the scan.
pub fn extract_source_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find(FENCE) {
        let after_open = &rest[open + FENCE.len()..];
        let Some(info_end) = after_open.find('\n') else {
            break;
        };
        let body = &after_open[info_end + 1..];
        let Some(close) = body.find(FENCE) else {
            break;
        };
        blocks.push(&body[..close]);
        rest = &body[close + FENCE.len()..];
    }
    if blocks.is_empty() {
        vec![text]
    } else {
        blocks
    }
}

/// Cheap pre-check used by the agent loop to decide whether a completion
/// should go through the interpreter at all.
pub fn mentions_tool_call(text: &str) -> bool {
    text.contains(CALL_TOOL)
}

/// Parses and validates every block, returning the calls in source order.
/// All blocks must validate before any call is returned.
pub fn extract_tool_calls(text: &str) -> Result<Vec<ToolCall>, InterpreterError> {
    let mut calls = Vec::new();
    for block in extract_source_blocks(text) {
        let program = parser::parse_program(block)?;
        calls.extend(validate::collect_tool_calls(&program)?);
    }
    Ok(calls)
}

#[derive(Clone)]
pub struct SafeCodeInterpreter {
    registry: ToolRegistry,
}

impl SafeCodeInterpreter {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Extracts, validates and dispatches. Safety violations abort before any
    /// tool runs; dispatch failures are reported per call.
    pub async fn extract_and_run(
        &self,
        text: &str,
        ctx: &ToolContext,
    ) -> Result<Vec<ToolCallOutcome>, InterpreterError> {
        let calls = match extract_tool_calls(text) {
            Ok(calls) => calls,
            Err(err) => {
                tracing::warn!(error = %err, "rejected tool-call source");
                return Err(err);
            }
        };
        let mut outcomes = Vec::with_capacity(calls.len());
        for call in calls {
            let dispatched = self
                .registry
                .execute(&call.tool_name, ctx, call.args.clone())
                .await;
            let outcome = match dispatched {
                Ok(result) => ToolCallOutcome {
                    tool: call.tool_name,
                    args: call.args,
                    result: Some(result),
                    error: None,
                },
                Err(err) => {
                    tracing::debug!(
                        tool = %call.tool_name,
                        error = %redact_text(&err.to_string()),
                        "tool call failed"
                    );
                    ToolCallOutcome {
                        tool: call.tool_name,
                        args: call.args,
                        result: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}
