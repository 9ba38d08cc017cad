use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Speaker of a turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pinning level used by the keep-important compaction strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Importance {
    #[default]
    Normal,
    /// System prompts and pinned turns. Never dropped by keep-important.
    High,
}

/// Whether a turn came from the conversation or was synthesized by compaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TurnKind {
    #[default]
    Message,
    /// Placeholder standing in for a span dropped by sliding-window compaction.
    Summary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub is_error: bool,
}

/// Text and/or structured tool payload carried by a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnContent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
}

impl TurnContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.tool_calls.is_empty() && self.tool_result.is_none()
    }
}

impl From<&str> for TurnContent {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<String> for TurnContent {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

/// One message in a session history.
///
/// Fields are read-only after construction; compaction works on the sequence,
/// never on individual turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    id: Ulid,
    role: Role,
    content: TurnContent,
    token_cost: u64,
    #[serde(default)]
    importance: Importance,
    #[serde(default)]
    kind: TurnKind,
    created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<TurnContent>, token_cost: u64) -> Self {
        Self {
            id: Ulid::new(),
            role,
            content: content.into(),
            token_cost,
            importance: Importance::Normal,
            kind: TurnKind::Message,
            created_at: Utc::now(),
        }
    }

    pub fn system(content: impl Into<TurnContent>, token_cost: u64) -> Self {
        Self::new(Role::System, content, token_cost).with_importance(Importance::High)
    }

    pub fn user(content: impl Into<TurnContent>, token_cost: u64) -> Self {
        Self::new(Role::User, content, token_cost)
    }

    pub fn assistant(content: impl Into<TurnContent>, token_cost: u64) -> Self {
        Self::new(Role::Assistant, content, token_cost)
    }

    /// Synthetic turn inserted by sliding-window compaction.
    pub fn summary(text: impl Into<String>, token_cost: u64) -> Self {
        Self {
            kind: TurnKind::Summary,
            ..Self::new(Role::System, TurnContent::text(text), token_cost)
        }
    }

    pub fn with_importance(mut self, importance: Importance) -> Self {
        self.importance = importance;
        self
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &TurnContent {
        &self.content
    }

    pub fn token_cost(&self) -> u64 {
        self.token_cost
    }

    pub fn importance(&self) -> Importance {
        self.importance
    }

    pub fn kind(&self) -> TurnKind {
        self.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_pinned(&self) -> bool {
        self.importance == Importance::High
    }
}

/// Closed classification of a backend failure.
///
/// Backend invokers map provider-specific errors (HTTP status codes, error
/// codes) into exactly one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureClass {
    Auth,
    RateLimit,
    ServerError,
    ModelUnavailable,
    ContextOverflow,
    OtherFatal,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate-limit",
            Self::ServerError => "server-error",
            Self::ModelUnavailable => "model-unavailable",
            Self::ContextOverflow => "context-overflow",
            Self::OtherFatal => "other-fatal",
        }
    }

    /// Failures that put the credential itself into cooldown.
    pub fn is_credential_fault(&self) -> bool {
        matches!(self, Self::Auth | Self::RateLimit)
    }

    /// Failures the fallback chain may recover from by switching credential
    /// or model.
    pub fn is_chain_retryable(&self) -> bool {
        matches!(
            self,
            Self::Auth | Self::RateLimit | Self::ServerError | Self::ModelUnavailable
        )
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Success,
    RetryableFailure,
    FatalFailure,
}

/// One backend invocation made while walking a fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Zero-based position of this attempt within the dispatch.
    pub attempt: u32,
    pub model: String,
    pub credential: String,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl AttemptRecord {
    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}
