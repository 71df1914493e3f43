use async_trait::async_trait;
use serde_json::json;

use crucible_core::EventBus;
use crucible_observability::redact_text;
use crucible_providers::CompletionClient;
use crucible_runtime::{AgentContext, AgentOutput, AgentRunner};
use crucible_tools::mentions_tool_call;
use crucible_types::{ChatMessage, CompletionRequest, TraceKind};

const CAPABILITY_OPEN: &str = "[[capability:";
const CAPABILITY_CLOSE: &str = "]]";

/// Where the loop is between model turns. A capability token in a completion
/// is the only way into `AwaitingCapability`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    Generating,
    AwaitingCapability(String),
    Resuming,
}

/// Finds the first `[[capability:<tool>]]` request in a completion.
pub fn scan_capability_request(text: &str) -> Option<String> {
    let start = text.find(CAPABILITY_OPEN)? + CAPABILITY_OPEN.len();
    let rest = &text[start..];
    let end = rest.find(CAPABILITY_CLOSE)?;
    let name = rest[..end].trim();
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    valid.then(|| name.to_string())
}

/// Model-driven agent loop: generate, run any literal tool calls through the
/// interpreter, feed results back, and stop once a completion asks for
/// nothing more.
pub struct AgentLoop {
    client: CompletionClient,
    model_id: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    max_turns: usize,
    events: Option<EventBus>,
}

impl AgentLoop {
    pub fn new(client: CompletionClient, model_id: impl Into<String>) -> Self {
        Self {
            client,
            model_id: model_id.into(),
            temperature: None,
            max_tokens: None,
            max_turns: 4,
            events: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    async fn preamble(&self, ctx: &AgentContext) -> String {
        let tools = ctx
            .interpreter
            .registry()
            .list()
            .await
            .into_iter()
            .map(|schema| format!("- {}: {}", schema.name, schema.description))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "{}\n\nYou work inside an isolated workspace. To use a tool, reply with a fenced \
             code block containing calls of the form `callTool(\"<tool>\", {{...}})` with literal \
             arguments only. To see a tool's argument schema first, write \
             `[[capability:<tool>]]`. Reply without either once the task is done.\n\nTools:\n{}",
            ctx.system_prompt.trim(),
            tools
        )
    }

    fn emit(&self, kind: TraceKind, ctx: &AgentContext, payload: serde_json::Value) {
        let Some(events) = &self.events else {
            return;
        };
        let mut payload = payload;
        if let Some(map) = payload.as_object_mut() {
            map.insert("taskID".to_string(), json!(ctx.task_id));
            map.insert("variantID".to_string(), json!(ctx.variant_id));
        }
        events.emit(kind, payload);
    }
}

#[async_trait]
impl AgentRunner for AgentLoop {
    async fn run(&self, ctx: AgentContext) -> anyhow::Result<AgentOutput> {
        let mut messages = vec![
            ChatMessage::system(self.preamble(&ctx).await),
            ChatMessage::user(ctx.task_prompt.clone()),
        ];
        let mut logs = Vec::new();
        let mut last = String::new();
        let mut turns = 0usize;
        let mut state = LoopState::Generating;

        loop {
            state = match state {
                LoopState::Generating => {
                    if turns >= self.max_turns {
                        logs.push(format!("stopped after {turns} turn(s)"));
                        break;
                    }
                    turns += 1;
                    let request = CompletionRequest {
                        model_id: self.model_id.clone(),
                        messages: messages.clone(),
                        temperature: self.temperature,
                        max_tokens: self.max_tokens,
                    };
                    let completion = self.client.complete(&request).await?;
                    messages.push(ChatMessage::assistant(completion.clone()));
                    last = completion;

                    if let Some(tool) = scan_capability_request(&last) {
                        LoopState::AwaitingCapability(tool)
                    } else if mentions_tool_call(&last) {
                        let outcomes = ctx.interpreter.extract_and_run(&last, &ctx.tools).await?;
                        // Tool errors can echo file contents; the model sees them in
                        // full, logs and traces only see a digest.
                        for outcome in &outcomes {
                            let error = outcome.error.as_deref().map(redact_text);
                            self.emit(
                                TraceKind::ToolExecuted,
                                &ctx,
                                json!({"tool": outcome.tool, "error": error}),
                            );
                            logs.push(match &error {
                                None => format!("tool {} ok", outcome.tool),
                                Some(err) => format!("tool {} failed: {err}", outcome.tool),
                            });
                        }
                        messages.push(ChatMessage::user(format!(
                            "Tool results:\n{}",
                            serde_json::to_string_pretty(&outcomes)?
                        )));
                        LoopState::Generating
                    } else {
                        break;
                    }
                }
                LoopState::AwaitingCapability(tool) => {
                    let schema = ctx.interpreter.registry().schema(&tool).await;
                    let granted = schema.is_some();
                    self.emit(
                        TraceKind::CapabilityRequested,
                        &ctx,
                        json!({"capability": tool, "granted": granted}),
                    );
                    let reply = match schema {
                        Some(schema) => format!(
                            "Capability `{}` granted. Arguments schema:\n{}",
                            schema.name,
                            serde_json::to_string_pretty(&schema.input_schema)?
                        ),
                        None => format!("Capability `{tool}` is not available."),
                    };
                    logs.push(format!(
                        "capability {tool} {}",
                        if granted { "granted" } else { "denied" }
                    ));
                    messages.push(ChatMessage::user(reply));
                    LoopState::Resuming
                }
                LoopState::Resuming => LoopState::Generating,
            };
        }

        Ok(AgentOutput { output: last, logs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_providers::{Provider, RetryPolicy};
    use crucible_tools::{SafeCodeInterpreter, ToolContext, ToolRegistry};
    use crucible_types::{ModelDescriptor, ProviderInfo};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    struct Script {
        replies: Mutex<VecDeque<String>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    #[async_trait]
    impl Provider for Script {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                id: "script".into(),
                name: "Script".into(),
            }
        }

        fn models(&self) -> Vec<ModelDescriptor> {
            Vec::new()
        }

        async fn generate_completion(&self, request: &CompletionRequest) -> anyhow::Result<String> {
            self.seen.lock().push(request.messages.clone());
            self.replies
                .lock()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no more replies"))
        }
    }

    fn scripted(replies: &[&str]) -> (Arc<Script>, CompletionClient) {
        let script = Arc::new(Script {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            seen: Mutex::new(Vec::new()),
        });
        let policy = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        (script.clone(), CompletionClient::new(script, policy))
    }

    fn context(root: &std::path::Path) -> AgentContext {
        AgentContext {
            task_id: "t-1".into(),
            variant_id: "v".into(),
            workspace_root: root.to_path_buf(),
            task_prompt: "write hello".into(),
            system_prompt: "You are careful.".into(),
            tools: ToolContext::new(root),
            interpreter: SafeCodeInterpreter::new(ToolRegistry::with_builtin_tools()),
        }
    }

    #[test]
    fn capability_token_scan() {
        assert_eq!(
            scan_capability_request("I need [[capability: write_file ]] first"),
            Some("write_file".to_string())
        );
        assert_eq!(scan_capability_request("no token"), None);
        assert_eq!(scan_capability_request("[[capability:]]"), None);
        assert_eq!(scan_capability_request("[[capability:rm -rf]]"), None);
    }

    #[tokio::test]
    async fn walks_capability_then_tool_then_final_answer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (script, client) = scripted(&[
            "[[capability:write_file]]",
            "```js\nawait callTool('write_file', {path: 'hello.txt', content: 'hi'})\n```",
            "Wrote hello.txt",
        ]);
        let bus = EventBus::new();
        let agent = AgentLoop::new(client, "m").with_events(bus.clone());

        let out = agent.run(context(dir.path())).await.expect("run");
        assert_eq!(out.output, "Wrote hello.txt");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("hello.txt")).expect("file"),
            "hi"
        );
        assert_eq!(
            out.logs,
            vec!["capability write_file granted", "tool write_file ok"]
        );

        let seen = script.seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen[1]
            .last()
            .is_some_and(|m| m.content.contains("Capability `write_file` granted")));
        assert!(seen[2]
            .last()
            .is_some_and(|m| m.content.starts_with("Tool results:")));
        assert_eq!(bus.events_of(TraceKind::CapabilityRequested).len(), 1);
        assert_eq!(bus.events_of(TraceKind::ToolExecuted).len(), 1);
    }

    #[tokio::test]
    async fn tool_errors_reach_the_model_but_logs_only_see_a_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("notes.txt"), "nothing here").expect("write");
        let secret = "sk-live-1234";
        let (script, client) = scripted(&[
            "callTool('edit_file', {path: 'notes.txt', old: 'sk-live-1234', new: 'x'})",
            "done",
        ]);
        let bus = EventBus::new();
        let out = AgentLoop::new(client, "m")
            .with_events(bus.clone())
            .run(context(dir.path()))
            .await
            .expect("run");

        assert_eq!(out.logs.len(), 1);
        assert!(out.logs[0].starts_with("tool edit_file failed: [redacted len="), "{}", out.logs[0]);
        assert!(!out.logs[0].contains(secret));

        let executed = bus.events_of(TraceKind::ToolExecuted);
        let error = executed[0].payload["error"].as_str().expect("error");
        assert!(error.starts_with("[redacted len="));
        assert!(!error.contains(secret));

        let seen = script.seen.lock();
        assert!(seen[1]
            .last()
            .is_some_and(|m| m.content.contains(secret)));
    }

    #[tokio::test]
    async fn unknown_capability_is_denied_and_loop_continues() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_, client) = scripted(&["[[capability:shell]]", "fine, done"]);
        let out = AgentLoop::new(client, "m")
            .run(context(dir.path()))
            .await
            .expect("run");
        assert_eq!(out.output, "fine, done");
        assert_eq!(out.logs, vec!["capability shell denied"]);
    }

    #[tokio::test]
    async fn unsafe_tool_source_ends_the_loop_with_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_, client) = scripted(&["callTool('write_file', process.env)"]);
        let err = AgentLoop::new(client, "m")
            .run(context(dir.path()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported literal"), "{err}");
    }

    #[tokio::test]
    async fn turn_budget_bounds_the_loop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (script, client) = scripted(&[
            "callTool('list_files')",
            "callTool('list_files')",
            "callTool('list_files')",
        ]);
        let out = AgentLoop::new(client, "m")
            .with_max_turns(2)
            .run(context(dir.path()))
            .await
            .expect("run");
        assert_eq!(script.seen.lock().len(), 2);
        assert_eq!(out.logs.last().map(String::as_str), Some("stopped after 2 turn(s)"));
    }

    #[tokio::test]
    async fn provider_exhaustion_surfaces_as_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_, client) = scripted(&[]);
        let err = AgentLoop::new(client, "m")
            .run(context(dir.path()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exhausted"), "{err}");
    }
}
