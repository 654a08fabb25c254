use super::GenerationManager;
use super::parser::{AgentEvent, StreamEventParser};
use super::types::{
    ApprovalDecision, ApprovalRequest, AuthOutcome, AuthRequest, Generation, GenerationEvent,
    GenerationStatus, now_unix_ms,
};
use crate::core::permissions::{check_permissions, parse_command};
use crate::core::sandbox::ExecutionBackend;
use serde_json::{Value, json};
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, info};

const PROMPT_PATH: &str = "/tmp/steward/prompt.md";
const DECISION_DIR: &str = "/tmp/steward/decisions";
const CREDENTIALS_DIR: &str = "~/.steward/credentials";

/// Run one generation to completion: provision a sandbox, stream the agent
/// process, gate its tool calls, and land the record in a terminal state
/// exactly once.
pub async fn drive(manager: Arc<GenerationManager>, generation_id: String, prompt: String) {
    let Some(generation) = manager.generation(&generation_id).await else {
        return;
    };
    let Some(token) = manager.cancel_token(&generation_id).await else {
        return;
    };

    let backend = match manager.factory().acquire(&generation.user_id).await {
        Ok(backend) => backend,
        Err(e) => {
            manager
                .fail(&generation_id, &format!("failed to acquire a sandbox: {}", e))
                .await;
            return;
        }
    };
    manager.attach_backend(&generation_id, backend.clone()).await;

    if let Err(e) = backend.write_file(PROMPT_PATH, prompt.as_bytes()).await {
        manager
            .fail(&generation_id, &format!("failed to stage the prompt: {}", e))
            .await;
        return;
    }

    let command = format!(
        "steward-agent --prompt-file {} --output stream-json",
        PROMPT_PATH
    );
    let mut chunks = match backend.execute_streaming(&command, Vec::new()).await {
        Ok(chunks) => chunks,
        Err(e) => {
            manager
                .fail(&generation_id, &format!("failed to start the agent: {}", e))
                .await;
            return;
        }
    };

    let mut parser = StreamEventParser::new();
    let mut finished = false;
    'stream: loop {
        tokio::select! {
            // Cancellation already emitted the terminal event; just stop
            // feeding the parser.
            _ = token.cancelled() => return,
            chunk = chunks.recv() => match chunk {
                Some(bytes) => {
                    for event in parser.feed(&bytes) {
                        if handle_event(&manager, &generation, backend.as_ref(), event)
                            .await
                            .is_break()
                        {
                            finished = true;
                            break 'stream;
                        }
                    }
                }
                None => break 'stream,
            }
        }
    }

    if !finished {
        if let Some(event) = parser.finish() {
            finished = handle_event(&manager, &generation, backend.as_ref(), event)
                .await
                .is_break();
        }
    }

    if !finished && !token.is_cancelled() {
        manager
            .fail(&generation_id, "agent stream ended without a terminal event")
            .await;
    }
}

/// Fan one agent event out to subscribers, gating tool calls on the way.
/// Break means the generation reached a terminal state.
async fn handle_event(
    manager: &Arc<GenerationManager>,
    generation: &Generation,
    backend: &dyn ExecutionBackend,
    event: AgentEvent,
) -> ControlFlow<()> {
    let id = &generation.id;
    match event {
        AgentEvent::Text { text } => {
            manager.emit(id, GenerationEvent::Text { text }).await;
        }
        AgentEvent::ToolCallDelta { id: tool_id, delta } => {
            manager
                .emit(id, GenerationEvent::ToolCallDelta { id: tool_id, delta })
                .await;
        }
        AgentEvent::ToolCallEnd { id: tool_id, output, is_error } => {
            manager
                .emit(
                    id,
                    GenerationEvent::ToolCallEnd { id: tool_id, output, is_error },
                )
                .await;
        }
        AgentEvent::Usage { input_tokens, output_tokens } => {
            manager
                .emit(id, GenerationEvent::Usage { input_tokens, output_tokens })
                .await;
        }
        AgentEvent::Done => {
            manager
                .finish(id, GenerationStatus::Done, GenerationEvent::Done)
                .await;
            return ControlFlow::Break(());
        }
        AgentEvent::Error { message } => {
            manager.fail(id, &message).await;
            return ControlFlow::Break(());
        }
        AgentEvent::ToolCallStart { id: tool_id, name, input } => {
            manager
                .emit(
                    id,
                    GenerationEvent::ToolCallStart {
                        id: tool_id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    },
                )
                .await;

            let allow = match gate_tool_call(manager, generation, backend, &name, &input).await {
                Some(allow) => allow,
                // The gate already landed the generation in a terminal state.
                None => return ControlFlow::Break(()),
            };

            // The agent blocks on this file before running the tool.
            let path = format!("{}/{}.json", DECISION_DIR, tool_id);
            let decision = json!({ "allow": allow });
            if let Err(e) = backend.write_file(&path, decision.to_string().as_bytes()).await {
                debug!("Generation [{}] decision delivery failed: {}", id, e);
            }
        }
    }
    ControlFlow::Continue(())
}

/// Decide whether a tool call may run. `None` means the generation failed
/// terminally while gating (auth failure or credential injection failure).
/// Runs at most two passes: the second re-checks after a successful auth
/// flow connected the missing integration.
async fn gate_tool_call(
    manager: &Arc<GenerationManager>,
    generation: &Generation,
    backend: &dyn ExecutionBackend,
    tool_name: &str,
    tool_input: &Value,
) -> Option<bool> {
    let id = &generation.id;
    for _ in 0..2 {
        let connected = manager
            .credentials()
            .connected_integrations(&generation.user_id)
            .await;
        let result = check_permissions(tool_name, tool_input, &connected, manager.settings().policy);

        // The conversation allow-list is absolute: an integration outside it
        // is denied without offering approval or auth.
        if let (Some(integration), Some(allowed)) =
            (&result.integration, &generation.allowed_integrations)
        {
            if !allowed.contains(integration) {
                info!(
                    "Generation [{}] denied {}: outside the conversation allow-list",
                    id, integration
                );
                return Some(false);
            }
        }

        if result.allowed {
            return Some(true);
        }

        let command = tool_input
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        if result.needs_auth {
            let integration = result.integration.clone().unwrap_or_default();
            let request = AuthRequest {
                generation_id: id.clone(),
                integration: integration.clone(),
                reason: result.reason.clone().unwrap_or_default(),
                created_at_ms: now_unix_ms(),
            };
            match manager.wait_for_auth(id, request).await {
                AuthOutcome::Success { tokens } => {
                    let path = format!("{}/{}.json", CREDENTIALS_DIR, integration);
                    if let Err(e) = backend.write_file(&path, tokens.to_string().as_bytes()).await {
                        manager
                            .fail(id, &format!("failed to inject {} credentials: {}", integration, e))
                            .await;
                        return None;
                    }
                    // Re-check: the operation may still need approval.
                    continue;
                }
                AuthOutcome::Failed => {
                    manager
                        .fail(id, &format!("authentication for {} failed", integration))
                        .await;
                    return None;
                }
            }
        }

        if result.needs_approval {
            if generation.auto_approve {
                debug!("Generation [{}] pre-approved: {}", id, command);
                return Some(true);
            }
            let request = ApprovalRequest {
                generation_id: id.clone(),
                tool_input: tool_input.clone(),
                integration: result.integration.clone().unwrap_or_default(),
                operation: parse_command(&command)
                    .map(|p| p.operation)
                    .unwrap_or_default(),
                command,
                created_at_ms: now_unix_ms(),
            };
            let decision = manager.wait_for_approval(id, request).await;
            return Some(decision == ApprovalDecision::Allow);
        }

        return Some(false);
    }

    // Two auth passes without a verdict; refuse rather than loop.
    Some(false)
}
