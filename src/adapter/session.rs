//! Downstream session over a child process speaking MCP on stdio.
//!
//! The child exposes two tools: `start` opens a conversation thread and
//! returns a continuation handle plus content; `reply` continues an existing
//! thread. Content is tolerated either as a structured field or as text
//! fragments joined with newlines.

use crate::adapter::{DownstreamBackend, TurnOutput, TurnRequest};
use crate::error::AdapterError;

use anyhow::Context as _;
use rmcp::ClientHandler;
use rmcp::service::{RoleClient, RunningService, ServiceError};
use serde_json::{Value, json};
use std::borrow::Cow;
use std::collections::HashMap;
use tokio::sync::Mutex;

type DownstreamSession = RunningService<RoleClient, CodexClientHandler>;

/// How to spawn the downstream agent binary.
#[derive(Debug, Clone)]
pub struct DownstreamConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl DownstreamConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
        }
    }
}

#[derive(Clone)]
struct CodexClientHandler {
    client_info: rmcp::model::ClientInfo,
}

impl CodexClientHandler {
    fn new() -> Self {
        let mut client_info = rmcp::model::ClientInfo::default();
        client_info.client_info = rmcp::model::Implementation::new(
            "crewbot".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        )
        .with_description("Crewbot downstream session".to_string());
        Self { client_info }
    }
}

impl ClientHandler for CodexClientHandler {
    fn get_info(&self) -> rmcp::model::ClientInfo {
        self.client_info.clone()
    }
}

/// The production downstream backend: one child process, one MCP session.
pub struct CodexBackend {
    config: DownstreamConfig,
    client: Mutex<Option<DownstreamSession>>,
}

impl CodexBackend {
    pub fn new(config: DownstreamConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
        }
    }

    /// Spawn the child and establish the initial session.
    pub async fn connect(&self) -> std::result::Result<(), AdapterError> {
        let session = self.connect_session().await?;
        let mut guard = self.client.lock().await;
        *guard = Some(session);
        Ok(())
    }

    async fn connect_session(&self) -> std::result::Result<DownstreamSession, AdapterError> {
        let mut command = tokio::process::Command::new(&self.config.command);
        command.args(&self.config.args);
        command.envs(&self.config.env);

        let transport = rmcp::transport::TokioChildProcess::new(command)
            .with_context(|| format!("failed to spawn downstream agent '{}'", self.config.command))
            .map_err(|error| AdapterError::Transport(error.to_string()))?;

        rmcp::serve_client(CodexClientHandler::new(), transport)
            .await
            .with_context(|| {
                format!("failed to initialize downstream agent '{}'", self.config.command)
            })
            .map_err(|error| AdapterError::Transport(error.to_string()))
    }
}

#[async_trait::async_trait]
impl DownstreamBackend for CodexBackend {
    async fn call(&self, request: TurnRequest) -> std::result::Result<TurnOutput, AdapterError> {
        let (tool, arguments) = match &request {
            TurnRequest::Start(turn) => ("start", start_arguments(turn)),
            TurnRequest::Reply(turn) => ("reply", reply_arguments(turn)),
        };

        // Clone the peer so concurrent calls for different agents don't
        // serialize on the session slot.
        let peer = {
            let guard = self.client.lock().await;
            guard.as_ref().map(|session| session.peer().clone())
        };
        let Some(peer) = peer else {
            return Err(AdapterError::Transport(
                "downstream session is not connected".to_string(),
            ));
        };

        let mut params = rmcp::model::CallToolRequestParams::new(Cow::Owned(tool.to_string()));
        params.arguments = arguments.as_object().cloned();

        let result = peer.call_tool(params).await.map_err(map_service_error)?;
        interpret_result(result)
    }

    async fn reconnect(&self) -> std::result::Result<(), AdapterError> {
        let mut guard = self.client.lock().await;
        let mut stale = guard.take();
        if let Some(session) = stale.as_mut() {
            if let Err(error) = session.close().await {
                tracing::warn!(%error, "failed to close stale downstream session");
            }
        }
        drop(stale);
        *guard = Some(self.connect_session().await?);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.client.lock().await.is_some()
    }

    async fn close(&self) {
        let mut guard = self.client.lock().await;
        let mut session = guard.take();
        if let Some(session) = session.as_mut() {
            if let Err(error) = session.close().await {
                tracing::warn!(%error, "failed to close downstream session");
            }
        }
    }
}

fn start_arguments(turn: &crate::adapter::StartTurn) -> Value {
    let mut config = json!({
        "reasoning_effort": turn.reasoning_effort.as_str(),
        "search": true,
    });
    if let Some(url) = &turn.comms_url {
        config["mcp_servers"] = json!({ "crewbot": { "url": url } });
    }

    json!({
        "prompt": turn.prompt,
        "model": turn.model,
        "approval_policy": turn.approval.as_str(),
        "sandbox": turn.sandbox.as_str(),
        "cwd": turn.cwd,
        "base_instructions": turn.instructions,
        "config": config,
    })
}

fn reply_arguments(turn: &crate::adapter::ReplyTurn) -> Value {
    json!({
        "prompt": turn.prompt,
        "continuation": turn.continuation,
    })
}

fn map_service_error(error: ServiceError) -> AdapterError {
    match error {
        ServiceError::McpError(data) => AdapterError::Remote(data.to_string()),
        other => AdapterError::Transport(other.to_string()),
    }
}

fn interpret_result(
    result: rmcp::model::CallToolResult,
) -> std::result::Result<TurnOutput, AdapterError> {
    let text = collect_text(&result);
    interpret_turn(text, result.structured_content, result.is_error.unwrap_or(false))
}

/// Join the text fragments of a tool result with newlines.
fn collect_text(result: &rmcp::model::CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|content| match &content.raw {
            rmcp::model::RawContent::Text(text) => Some(text.text.clone()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Pull the continuation handle and content string out of a turn result.
///
/// Preference order: the structured field, then a JSON object smuggled as
/// text, then the raw joined fragments as content with no continuation.
fn interpret_turn(
    text: String,
    structured: Option<Value>,
    is_error: bool,
) -> std::result::Result<TurnOutput, AdapterError> {
    if is_error {
        let message = if text.trim().is_empty() {
            "downstream returned an error".to_string()
        } else {
            text
        };
        return Err(AdapterError::Remote(message));
    }

    if let Some(output) = structured.as_ref().and_then(extract_turn_fields) {
        return Ok(TurnOutput {
            continuation: output.0,
            text: output.1.unwrap_or(text),
        });
    }

    if let Ok(value) = serde_json::from_str::<Value>(text.trim())
        && let Some((continuation, content)) = extract_turn_fields(&value)
        && (continuation.is_some() || content.is_some())
    {
        return Ok(TurnOutput {
            continuation,
            text: content.unwrap_or(text),
        });
    }

    Ok(TurnOutput {
        continuation: None,
        text,
    })
}

#[allow(clippy::type_complexity)]
fn extract_turn_fields(value: &Value) -> Option<(Option<String>, Option<String>)> {
    let object = value.as_object()?;
    let continuation = object
        .get("continuation")
        .and_then(Value::as_str)
        .map(str::to_string);
    let content = object
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string);
    if continuation.is_none() && content.is_none() {
        return None;
    }
    Some((continuation, content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_result_wins() {
        let output = interpret_turn(
            "fragment".to_string(),
            Some(json!({ "continuation": "thread-7", "content": "done" })),
            false,
        )
        .expect("turn should parse");
        assert_eq!(output.continuation.as_deref(), Some("thread-7"));
        assert_eq!(output.text, "done");
    }

    #[test]
    fn json_smuggled_as_text_is_tolerated() {
        let output = interpret_turn(
            r#"{"continuation": "thread-9", "content": "from text"}"#.to_string(),
            None,
            false,
        )
        .expect("turn should parse");
        assert_eq!(output.continuation.as_deref(), Some("thread-9"));
        assert_eq!(output.text, "from text");
    }

    #[test]
    fn plain_fragments_become_content() {
        let output = interpret_turn("line one\nline two".to_string(), None, false)
            .expect("turn should parse");
        assert!(output.continuation.is_none());
        assert_eq!(output.text, "line one\nline two");
    }

    #[test]
    fn error_envelope_maps_to_remote_error() {
        let error = interpret_turn("boom".to_string(), None, true)
            .expect_err("error envelope must fail");
        assert!(matches!(error, AdapterError::Remote(message) if message == "boom"));

        let error = interpret_turn(String::new(), None, true)
            .expect_err("empty error envelope must fail");
        assert!(matches!(error, AdapterError::Remote(_)));
    }

    #[test]
    fn start_arguments_carry_the_comms_server() {
        let turn = crate::adapter::StartTurn {
            prompt: "go".to_string(),
            instructions: "be useful".to_string(),
            model: "gpt-5.3-codex".to_string(),
            sandbox: crate::SandboxMode::WorkspaceWrite,
            approval: crate::ApprovalPolicy::Never,
            reasoning_effort: crate::ReasoningEffort::High,
            cwd: "/tmp".into(),
            comms_url: Some("http://127.0.0.1:4000/mcp?agent=dev-1&token=t".to_string()),
        };
        let arguments = start_arguments(&turn);
        assert_eq!(arguments["model"], "gpt-5.3-codex");
        assert_eq!(arguments["approval_policy"], "never");
        assert_eq!(arguments["sandbox"], "workspace-write");
        assert_eq!(arguments["config"]["search"], true);
        assert_eq!(
            arguments["config"]["mcp_servers"]["crewbot"]["url"],
            "http://127.0.0.1:4000/mcp?agent=dev-1&token=t"
        );
    }
}
