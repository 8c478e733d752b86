//! Boundary contract between the chat state core and the backend transport.
//!
//! This crate defines only wire-facing shapes (sessions, message info, raw
//! parts, token accounting), the inbound event vocabulary and the async
//! transport trait. It contains no state management and no network code.

use std::sync::{atomic::AtomicBool, Arc};

use async_trait::async_trait;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Shared cancellation flag for one in-flight send.
pub type CancelSignal = Arc<AtomicBool>;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareInfo {
    pub url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
}

/// Backend session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share: Option<ShareInfo>,
    #[serde(default)]
    pub time: SessionTime,
}

impl Session {
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            directory: None,
            parent_id: None,
            share: None,
            time: SessionTime::default(),
        }
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.share.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTokens {
    pub read: u64,
    pub write: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBreakdown {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cache: CacheTokens,
}

/// Token accounting attached to a message or a step-finish part.
///
/// Providers report either a flat total or a structured breakdown. Counts are
/// read leniently: fractional values are floored and negative or non-numeric
/// values count as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TokenUsage {
    Total(u64),
    Breakdown(TokenBreakdown),
}

impl TokenUsage {
    /// Parses a usage payload, returning `None` for shapes that carry no counts.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(_) => Some(Self::Total(count_from_value(value))),
            Value::Object(fields) => {
                let field = |name: &str| fields.get(name).map(count_from_value).unwrap_or(0);
                let cache = fields.get("cache").and_then(Value::as_object);
                let cache_field = |name: &str| {
                    cache
                        .and_then(|cache| cache.get(name))
                        .map(count_from_value)
                        .unwrap_or(0)
                };

                Some(Self::Breakdown(TokenBreakdown {
                    input: field("input"),
                    output: field("output"),
                    reasoning: field("reasoning"),
                    cache: CacheTokens {
                        read: cache_field("read"),
                        write: cache_field("write"),
                    },
                }))
            }
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for TokenUsage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value)
            .ok_or_else(|| de::Error::custom("token usage must be a number or an object"))
    }
}

/// Reads a non-negative integer count from a JSON number.
#[must_use]
pub fn count_from_value(value: &Value) -> u64 {
    let Value::Number(number) = value else {
        return 0;
    };

    number.as_u64().unwrap_or_else(|| {
        number
            .as_f64()
            .filter(|count| count.is_finite() && *count > 0.0)
            .map(|count| count.floor() as u64)
            .unwrap_or(0)
    })
}

/// Serde helper for optional usage fields that must never fail a whole record.
pub fn lenient_usage<'de, D>(deserializer: D) -> Result<Option<TokenUsage>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(TokenUsage::from_value))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

/// Message metadata as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub role: Role,
    #[serde(default)]
    pub time: MessageTime,
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(rename = "modelID", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_usage",
        skip_serializing_if = "Option::is_none"
    )]
    pub tokens: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl MessageInfo {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        role: Role,
        created: i64,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            role,
            time: MessageTime {
                created,
                completed: None,
            },
            provider_id: None,
            model_id: None,
            mode: None,
            tokens: None,
            status: None,
            error: None,
        }
    }

    #[must_use]
    pub fn with_model(mut self, provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self.model_id = Some(model_id.into());
        self
    }

    #[must_use]
    pub fn with_tokens(mut self, tokens: TokenUsage) -> Self {
        self.tokens = Some(tokens);
        self
    }
}

/// A raw, possibly partial, message part exactly as it arrived.
///
/// `text` holds a full replacement string when the sender supplied one and
/// `delta` holds an incremental payload. Every other field is kept verbatim in
/// `fields` for typed decoding downstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncomingPart {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub part_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Value>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl IncomingPart {
    #[must_use]
    pub fn new(id: impl Into<String>, part_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            part_type: Some(part_type.into()),
            ..Self::default()
        }
    }

    /// A text part carrying a full replacement string.
    #[must_use]
    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::new(id, "text")
        }
    }

    /// A text part carrying only an incremental delta.
    #[must_use]
    pub fn text_delta(id: impl Into<String>, delta: impl Into<Value>) -> Self {
        Self {
            delta: Some(delta.into()),
            ..Self::new(id, "text")
        }
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Returns the declared part type, defaulting to `text`.
    #[must_use]
    pub fn kind(&self) -> &str {
        self.part_type.as_deref().unwrap_or("text")
    }

    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.string_field("messageID")
            .or_else(|| self.string_field("message_id"))
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.string_field("sessionID")
            .or_else(|| self.string_field("session_id"))
    }

    fn string_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

/// A full message as listed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub info: MessageInfo,
    #[serde(default)]
    pub parts: Vec<IncomingPart>,
}

/// Prompt content sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PromptPart {
    Text {
        id: String,
        text: String,
    },
    File {
        id: String,
        mime: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub session_id: String,
    pub message_id: String,
    pub provider_id: String,
    pub model_id: String,
    pub agent: Option<String>,
    pub parts: Vec<PromptPart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub session_id: String,
    pub command: String,
    pub arguments: String,
    pub provider_id: String,
    pub model_id: String,
    pub agent: Option<String>,
}

/// Result of a named command; some commands expand to a prompt template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub expanded_template: Option<String>,
}

/// Asynchronous notification delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    PartUpdated {
        session_id: String,
        message_id: String,
        part: IncomingPart,
        role: Option<Role>,
    },
    MessageUpdated {
        info: MessageInfo,
    },
    MessageCompleted {
        session_id: String,
        message_id: String,
    },
    MessageRemoved {
        session_id: String,
        message_id: String,
    },
    PartRemoved {
        session_id: String,
        message_id: String,
        part_id: String,
    },
    SessionSynced {
        session_id: String,
        messages: Vec<WireMessage>,
    },
    SessionUpdated {
        session: Session,
    },
    SessionDeleted {
        session_id: String,
    },
    SessionIdle {
        session_id: String,
    },
}

impl ChatEvent {
    /// Returns the session this event concerns.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::PartUpdated { session_id, .. }
            | Self::MessageCompleted { session_id, .. }
            | Self::MessageRemoved { session_id, .. }
            | Self::PartRemoved { session_id, .. }
            | Self::SessionSynced { session_id, .. }
            | Self::SessionDeleted { session_id }
            | Self::SessionIdle { session_id } => session_id,
            Self::MessageUpdated { info } => &info.session_id,
            Self::SessionUpdated { session } => &session.id,
        }
    }
}

/// Failure reported by a transport call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("gateway timed out while the backend was still processing")]
    GatewayTimeout,
    #[error("request was cancelled")]
    Cancelled,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),
}

impl TransportError {
    /// Gateway timeouts mean the backend may still deliver output over the stream.
    #[must_use]
    pub fn is_gateway_timeout(&self) -> bool {
        matches!(self, Self::GatewayTimeout) || matches!(self, Self::Status { code: 504, .. })
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout) || matches!(self, Self::Status { code: 408, .. })
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Backend operations the chat core relies on.
///
/// Implementations perform network I/O; part-arrival notifications are
/// delivered separately as [`ChatEvent`]s.
#[async_trait]
pub trait ChatTransport: Send + Sync + 'static {
    async fn list_sessions(&self) -> Result<Vec<Session>, TransportError>;

    async fn create_session(&self, title: Option<String>) -> Result<Session, TransportError>;

    async fn delete_session(&self, session_id: &str) -> Result<(), TransportError>;

    async fn update_session(&self, session_id: &str, title: &str)
        -> Result<Session, TransportError>;

    async fn share_session(&self, session_id: &str) -> Result<Session, TransportError>;

    async fn unshare_session(&self, session_id: &str) -> Result<Session, TransportError>;

    /// Returns the newest `limit` messages (all when `None`) in chronological order.
    async fn get_session_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<WireMessage>, TransportError>;

    /// Submits a prompt; the reply arrives asynchronously as events.
    async fn send_message(
        &self,
        request: PromptRequest,
        cancel: CancelSignal,
    ) -> Result<(), TransportError>;

    async fn run_command(&self, _request: CommandRequest) -> Result<CommandOutcome, TransportError> {
        Err(TransportError::Unsupported("running commands"))
    }

    async fn init_session(
        &self,
        _session_id: &str,
        _message_id: &str,
        _provider_id: &str,
        _model_id: &str,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("session init"))
    }

    async fn summarize_session(
        &self,
        _session_id: &str,
        _provider_id: &str,
        _model_id: &str,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("session summarize"))
    }

    /// Asks the backend to stop generation; returns whether it acknowledged.
    async fn abort_session(&self, session_id: &str) -> Result<bool, TransportError>;
}
