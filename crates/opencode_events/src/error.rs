use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("failed to parse event JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("{event_type} event is missing field '{field}'")]
    MissingField {
        event_type: String,
        field: &'static str,
    },

    #[error("{event_type} event has an invalid payload: {source}")]
    InvalidPayload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

impl EventDecodeError {
    #[must_use]
    pub fn missing(event_type: &str, field: &'static str) -> Self {
        Self::MissingField {
            event_type: event_type.to_string(),
            field,
        }
    }

    #[must_use]
    pub fn invalid(event_type: &str, source: serde_json::Error) -> Self {
        Self::InvalidPayload {
            event_type: event_type.to_string(),
            source,
        }
    }
}
