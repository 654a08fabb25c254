use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Running,
    AwaitingApproval,
    AwaitingAuth,
    Done,
    Error,
    Cancelled,
}

impl GenerationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationStatus::Running => "running",
            GenerationStatus::AwaitingApproval => "awaiting_approval",
            GenerationStatus::AwaitingAuth => "awaiting_auth",
            GenerationStatus::Done => "done",
            GenerationStatus::Error => "error",
            GenerationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GenerationStatus::Done | GenerationStatus::Error | GenerationStatus::Cancelled
        )
    }
}

/// Valid status moves. `running` is the only state that advances the agent;
/// the two awaiting states are stable suspension points; terminal states are
/// immutable.
pub fn can_transition(from: GenerationStatus, to: GenerationStatus) -> bool {
    use GenerationStatus::*;
    if from == to {
        return true;
    }
    match from {
        Running => matches!(to, AwaitingApproval | AwaitingAuth | Done | Error | Cancelled),
        AwaitingApproval | AwaitingAuth => matches!(to, Running | Error | Cancelled),
        Done | Error | Cancelled => false,
    }
}

/// One AI turn bound to a conversation.
#[derive(Debug, Clone)]
pub struct Generation {
    pub id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub status: GenerationStatus,
    pub sandbox_id: Option<String>,
    pub allowed_integrations: Option<HashSet<String>>,
    pub auto_approve: bool,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct StartOptions {
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub allowed_integrations: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Allow,
    Deny,
}

/// Outcome of a step-up auth wait.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    Success { tokens: Value },
    Failed,
}

/// A single outstanding tool-execution approval.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApprovalRequest {
    pub generation_id: String,
    pub tool_input: Value,
    pub integration: String,
    pub operation: String,
    pub command: String,
    pub created_at_ms: u64,
}

/// A single outstanding missing-credential request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuthRequest {
    pub generation_id: String,
    pub integration: String,
    pub reason: String,
    pub created_at_ms: u64,
}

/// Event fanned out to generation subscribers, in emission order.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    Text {
        text: String,
    },
    ToolCallStart {
        id: String,
        name: String,
        input: Value,
    },
    ToolCallDelta {
        id: String,
        delta: String,
    },
    ToolCallEnd {
        id: String,
        output: String,
        is_error: bool,
    },
    ApprovalNeeded {
        integration: String,
        operation: String,
        command: String,
    },
    AuthNeeded {
        integration: String,
        reason: String,
    },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
    Done,
    Error {
        message: String,
    },
    Cancelled,
}

impl GenerationEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationEvent::Done | GenerationEvent::Error { .. } | GenerationEvent::Cancelled
        )
    }
}

pub fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
