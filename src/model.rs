//! Canonical stored shapes for messages and their parts.

use chat_protocol::{MessageInfo, Role, TokenUsage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ToolStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
}

impl ToolStatus {
    /// Unrecognised statuses read as `Pending`.
    pub fn parse(value: &str) -> Self {
        match value {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "error" => Self::Error,
            _ => Self::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolState {
    pub status: ToolStatus,
    pub input: Value,
    pub output: Option<String>,
    pub error: Option<String>,
    pub title: Option<String>,
}

/// Typed part payload. `Unknown` keeps parts of types this store does not model.
#[derive(Debug, Clone, PartialEq)]
pub enum PartBody {
    Text {
        text: String,
        synthetic: bool,
    },
    Reasoning {
        text: String,
    },
    Tool {
        call_id: Option<String>,
        tool: String,
        state: ToolState,
    },
    File {
        mime: String,
        filename: Option<String>,
        url: String,
    },
    StepStart,
    StepFinish {
        reason: Option<String>,
        tokens: Option<TokenUsage>,
        cost: Option<f64>,
    },
    Patch {
        hash: Option<String>,
        files: Vec<String>,
    },
    Agent {
        name: String,
    },
    Snapshot {
        snapshot: String,
    },
    Unknown {
        part_type: String,
        payload: Value,
    },
}

impl PartBody {
    pub fn kind(&self) -> &str {
        match self {
            Self::Text { .. } => "text",
            Self::Reasoning { .. } => "reasoning",
            Self::Tool { .. } => "tool",
            Self::File { .. } => "file",
            Self::StepStart => "step-start",
            Self::StepFinish { .. } => "step-finish",
            Self::Patch { .. } => "patch",
            Self::Agent { .. } => "agent",
            Self::Snapshot { .. } => "snapshot",
            Self::Unknown { part_type, .. } => part_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub id: String,
    pub message_id: String,
    pub session_id: String,
    pub body: PartBody,
}

impl Part {
    pub fn text(
        id: impl Into<String>,
        message_id: impl Into<String>,
        session_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            message_id: message_id.into(),
            session_id: session_id.into(),
            body: PartBody::Text {
                text: text.into(),
                synthetic: false,
            },
        }
    }

    pub fn kind(&self) -> &str {
        self.body.kind()
    }

    /// Materialised text of a text or reasoning part.
    pub fn text_content(&self) -> Option<&str> {
        match &self.body {
            PartBody::Text { text, .. } | PartBody::Reasoning { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_step_finish(&self) -> bool {
        matches!(self.body, PartBody::StepFinish { .. })
    }

    /// Usage attached directly to this part, if any.
    pub fn tokens(&self) -> Option<TokenUsage> {
        match &self.body {
            PartBody::StepFinish { tokens, .. } => *tokens,
            PartBody::Unknown { payload, .. } => {
                payload.get("tokens").and_then(TokenUsage::from_value)
            }
            _ => None,
        }
    }
}

/// A message and its parts.
///
/// The user marker is one-way: once a message is known to be `user` it
/// reports `Role::User` for the rest of its life, whatever later info says.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub info: MessageInfo,
    pub parts: Vec<Part>,
    user_marker: bool,
}

impl Message {
    pub fn new(info: MessageInfo) -> Self {
        Self {
            user_marker: info.role == Role::User,
            info,
            parts: Vec::new(),
        }
    }

    pub fn with_parts(mut self, parts: Vec<Part>) -> Self {
        self.parts = parts;
        self
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn session_id(&self) -> &str {
        &self.info.session_id
    }

    pub fn role(&self) -> Role {
        if self.user_marker {
            Role::User
        } else {
            self.info.role
        }
    }

    pub fn is_user(&self) -> bool {
        self.role() == Role::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role() == Role::Assistant
    }

    pub fn created_at(&self) -> i64 {
        self.info.time.created
    }

    pub fn part(&self, part_id: &str) -> Option<&Part> {
        self.parts.iter().find(|part| part.id == part_id)
    }

    /// Replaces the part with the same id in place, or appends it.
    pub fn upsert_part(&mut self, part: Part) {
        match self.parts.iter_mut().find(|existing| existing.id == part.id) {
            Some(existing) => *existing = part,
            None => self.parts.push(part),
        }
    }

    pub fn remove_part(&mut self, part_id: &str) -> bool {
        let before = self.parts.len();
        self.parts.retain(|part| part.id != part_id);
        self.parts.len() != before
    }

    /// Concatenated text of the message's text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match &part.body {
                PartBody::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Merges newer metadata without ever demoting a user message.
    ///
    /// An update that says `user` sets the marker for good. Optional fields
    /// only overwrite when the update carries a value, and a zero creation
    /// time never replaces a known one.
    pub fn merge_info(&mut self, update: MessageInfo) {
        if update.role == Role::User {
            self.user_marker = true;
        }
        let current = &mut self.info;

        current.role = if self.user_marker {
            Role::User
        } else {
            update.role
        };
        if update.time.created != 0 || current.time.created == 0 {
            current.time.created = update.time.created;
        }
        if update.time.completed.is_some() {
            current.time.completed = update.time.completed;
        }
        if update.provider_id.is_some() {
            current.provider_id = update.provider_id;
        }
        if update.model_id.is_some() {
            current.model_id = update.model_id;
        }
        if update.mode.is_some() {
            current.mode = update.mode;
        }
        if update.tokens.is_some() {
            current.tokens = update.tokens;
        }
        if update.status.is_some() {
            current.status = update.status;
        }
        if update.error.is_some() {
            current.error = update.error;
        }
    }
}

/// Model and agent chosen for a session, remembered across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub provider_id: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl ModelSelection {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            agent: None,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }
}

/// Inserts `message` after every message created at or before it.
///
/// Returns the insertion index.
pub fn insert_chronological(messages: &mut Vec<Message>, message: Message) -> usize {
    let created = message.created_at();
    let index = messages.partition_point(|existing| existing.created_at() <= created);
    messages.insert(index, message);
    index
}

pub(crate) fn string_field(payload: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn cost_field(payload: &serde_json::Map<String, Value>) -> Option<f64> {
    payload.get("cost").and_then(Value::as_f64)
}
