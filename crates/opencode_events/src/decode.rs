use chat_protocol::{
    ChatEvent, IncomingPart, MessageInfo, Role, Session, TokenBreakdown, TokenUsage,
};
use serde_json::{Map, Value};
use tracing::trace;

use crate::error::EventDecodeError;

const PART_UPDATED: &str = "message.part.updated";
const PART_REMOVED: &str = "message.part.removed";
const MESSAGE_UPDATED: &str = "message.updated";
const MESSAGE_REMOVED: &str = "message.removed";
const SESSION_CREATED: &str = "session.created";
const SESSION_UPDATED: &str = "session.updated";
const SESSION_DELETED: &str = "session.deleted";
const SESSION_IDLE: &str = "session.idle";

/// Maps backend event payloads onto [`ChatEvent`]s.
///
/// Completion is signalled at most once per message id: a `step-finish` part
/// with reason `stop`, a `completed` status, or a `time.completed` stamp each
/// produce a [`ChatEvent::MessageCompleted`] unless that id already completed.
#[derive(Debug, Default)]
pub struct EventDecoder {
    last_completed_id: Option<String>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes one SSE `data:` payload.
    pub fn decode_frame(&mut self, data: &str) -> Result<Vec<ChatEvent>, EventDecodeError> {
        let value = serde_json::from_str::<Value>(data).map_err(EventDecodeError::Json)?;
        self.decode_value(value)
    }

    /// Decodes an already parsed payload, unwrapping the `{ directory, payload }` envelope.
    pub fn decode_value(&mut self, mut value: Value) -> Result<Vec<ChatEvent>, EventDecodeError> {
        if let Some(payload) = value.get_mut("payload").filter(|payload| payload.is_object()) {
            value = payload.take();
        }

        let event_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut properties = match value.get_mut("properties").map(Value::take) {
            Some(Value::Object(properties)) => properties,
            _ => Map::new(),
        };

        match event_type.as_str() {
            PART_UPDATED => self.part_updated(&mut properties),
            MESSAGE_UPDATED => self.message_updated(&mut properties),
            MESSAGE_REMOVED => Ok(vec![ChatEvent::MessageRemoved {
                session_id: required_str(&properties, MESSAGE_REMOVED, "sessionID")?,
                message_id: required_str(&properties, MESSAGE_REMOVED, "messageID")?,
            }]),
            PART_REMOVED => Ok(vec![ChatEvent::PartRemoved {
                session_id: required_str(&properties, PART_REMOVED, "sessionID")?,
                message_id: required_str(&properties, PART_REMOVED, "messageID")?,
                part_id: required_str(&properties, PART_REMOVED, "partID")?,
            }]),
            SESSION_CREATED | SESSION_UPDATED => {
                let info = properties
                    .get_mut("info")
                    .map(Value::take)
                    .ok_or_else(|| EventDecodeError::missing(&event_type, "info"))?;
                let session = serde_json::from_value::<Session>(info)
                    .map_err(|error| EventDecodeError::invalid(&event_type, error))?;
                Ok(vec![ChatEvent::SessionUpdated { session }])
            }
            SESSION_DELETED => {
                let session_id = properties
                    .get("info")
                    .and_then(|info| info.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| EventDecodeError::missing(SESSION_DELETED, "info.id"))?;
                Ok(vec![ChatEvent::SessionDeleted { session_id }])
            }
            SESSION_IDLE => Ok(vec![ChatEvent::SessionIdle {
                session_id: required_str(&properties, SESSION_IDLE, "sessionID")?,
            }]),
            other => {
                trace!(event_type = other, "ignoring unhandled stream event");
                Ok(Vec::new())
            }
        }
    }

    fn part_updated(
        &mut self,
        properties: &mut Map<String, Value>,
    ) -> Result<Vec<ChatEvent>, EventDecodeError> {
        let delta = properties
            .remove("delta")
            .filter(|delta| !delta.is_null());
        let part_value = properties
            .remove("part")
            .ok_or_else(|| EventDecodeError::missing(PART_UPDATED, "part"))?;
        let mut part = serde_json::from_value::<IncomingPart>(part_value)
            .map_err(|error| EventDecodeError::invalid(PART_UPDATED, error))?;
        if part.delta.is_none() {
            part.delta = delta;
        }

        let message_id = part
            .message_id()
            .map(str::to_string)
            .ok_or_else(|| EventDecodeError::missing(PART_UPDATED, "part.messageID"))?;
        let session_id = match part.session_id() {
            Some(session_id) => session_id.to_string(),
            None => required_str(properties, PART_UPDATED, "sessionID")?,
        };
        let finished = part.kind() == "step-finish"
            && part.fields.get("reason").and_then(Value::as_str) == Some("stop");

        let mut events = vec![ChatEvent::PartUpdated {
            session_id: session_id.clone(),
            message_id: message_id.clone(),
            part,
            role: None,
        }];
        if finished {
            events.extend(self.completion(session_id, message_id));
        }
        Ok(events)
    }

    fn message_updated(
        &mut self,
        properties: &mut Map<String, Value>,
    ) -> Result<Vec<ChatEvent>, EventDecodeError> {
        let mut info_value = match properties.remove("info") {
            Some(Value::Object(info)) => info,
            Some(_) => return Err(EventDecodeError::missing(MESSAGE_UPDATED, "info")),
            None => std::mem::take(properties),
        };
        let parts_value = info_value
            .remove("parts")
            .or_else(|| properties.remove("parts"));
        let status = info_value
            .get("status")
            .or_else(|| properties.get("status"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut info = serde_json::from_value::<MessageInfo>(Value::Object(info_value))
            .map_err(|error| EventDecodeError::invalid(MESSAGE_UPDATED, error))?;
        if info.status.is_none() {
            info.status = status;
        }

        let parts = match parts_value {
            Some(Value::Array(parts)) => parts
                .into_iter()
                .filter_map(|part| serde_json::from_value::<IncomingPart>(part).ok())
                .collect::<Vec<_>>(),
            _ => Vec::new(),
        };

        let completed =
            info.status.as_deref() == Some("completed") || info.time.completed.is_some();

        // Assistant shells announced before any content carry nothing to render.
        if info.role == Role::Assistant
            && parts.is_empty()
            && !completed
            && usage_is_empty(info.tokens.as_ref())
        {
            trace!(message_id = %info.id, "dropping empty assistant placeholder");
            return Ok(Vec::new());
        }

        let session_id = info.session_id.clone();
        let message_id = info.id.clone();
        let role = info.role;

        let mut events = vec![ChatEvent::MessageUpdated { info }];
        events.extend(parts.into_iter().map(|part| ChatEvent::PartUpdated {
            session_id: session_id.clone(),
            message_id: message_id.clone(),
            part,
            role: Some(role),
        }));
        if role == Role::Assistant && completed {
            events.extend(self.completion(session_id, message_id));
        }
        Ok(events)
    }

    fn completion(&mut self, session_id: String, message_id: String) -> Option<ChatEvent> {
        if self.last_completed_id.as_deref() == Some(message_id.as_str()) {
            return None;
        }
        self.last_completed_id = Some(message_id.clone());
        Some(ChatEvent::MessageCompleted {
            session_id,
            message_id,
        })
    }
}

fn required_str(
    properties: &Map<String, Value>,
    event_type: &str,
    field: &'static str,
) -> Result<String, EventDecodeError> {
    properties
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EventDecodeError::missing(event_type, field))
}

fn usage_is_empty(usage: Option<&TokenUsage>) -> bool {
    match usage {
        None | Some(TokenUsage::Total(0)) => true,
        Some(TokenUsage::Total(_)) => false,
        Some(TokenUsage::Breakdown(breakdown)) => *breakdown == TokenBreakdown::default(),
    }
}

#[cfg(test)]
mod tests {
    use chat_protocol::{TokenBreakdown, TokenUsage};

    use super::usage_is_empty;

    #[test]
    fn zeroed_usage_counts_as_empty() {
        assert!(usage_is_empty(None));
        assert!(usage_is_empty(Some(&TokenUsage::Total(0))));
        assert!(usage_is_empty(Some(&TokenUsage::Breakdown(
            TokenBreakdown::default()
        ))));
        assert!(!usage_is_empty(Some(&TokenUsage::Total(3))));
    }
}
