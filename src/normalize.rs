//! Reconciles raw incoming parts with what is already stored.
//!
//! Text arrives either as a full replacement string or as a delta, and the
//! delta encoding has varied (plain string, array of chunks, nested
//! `{text}`/`{delta}` objects). The stored part always holds materialised text.

use chat_protocol::{IncomingPart, TokenUsage};
use serde_json::{Map, Value};

use crate::model::{cost_field, string_field, Part, PartBody, ToolState, ToolStatus};

/// Builds the stored form of `incoming`, merging with `existing` when present.
pub fn normalize_part(
    incoming: &IncomingPart,
    existing: Option<&Part>,
    message_id: &str,
    session_id: &str,
) -> Part {
    let body = match incoming.kind() {
        "text" => PartBody::Text {
            text: merged_text(incoming, existing),
            synthetic: incoming
                .fields
                .get("synthetic")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        "reasoning" => PartBody::Reasoning {
            text: merged_text(incoming, existing),
        },
        "tool" => PartBody::Tool {
            call_id: string_field(&incoming.fields, "callID"),
            tool: string_field(&incoming.fields, "tool").unwrap_or_default(),
            state: tool_state(incoming.fields.get("state")),
        },
        "file" => PartBody::File {
            mime: string_field(&incoming.fields, "mime").unwrap_or_default(),
            filename: string_field(&incoming.fields, "filename"),
            url: string_field(&incoming.fields, "url").unwrap_or_default(),
        },
        "step-start" => PartBody::StepStart,
        "step-finish" => PartBody::StepFinish {
            reason: string_field(&incoming.fields, "reason"),
            tokens: incoming
                .fields
                .get("tokens")
                .and_then(TokenUsage::from_value),
            cost: cost_field(&incoming.fields),
        },
        "patch" => PartBody::Patch {
            hash: string_field(&incoming.fields, "hash"),
            files: incoming
                .fields
                .get("files")
                .and_then(Value::as_array)
                .map(|files| {
                    files
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        },
        "agent" => PartBody::Agent {
            name: string_field(&incoming.fields, "name").unwrap_or_default(),
        },
        "snapshot" => PartBody::Snapshot {
            snapshot: string_field(&incoming.fields, "snapshot").unwrap_or_default(),
        },
        other => PartBody::Unknown {
            part_type: other.to_string(),
            payload: unknown_payload(incoming),
        },
    };

    Part {
        id: incoming.id.clone(),
        message_id: message_id.to_string(),
        session_id: session_id.to_string(),
        body,
    }
}

/// Flattens any supported delta encoding into plain text.
pub fn delta_text(delta: &Value) -> Option<String> {
    match delta {
        Value::String(text) => Some(text.clone()),
        Value::Array(chunks) => {
            let pieces: Vec<String> = chunks.iter().filter_map(delta_text).collect();
            if pieces.is_empty() {
                None
            } else {
                Some(pieces.concat())
            }
        }
        Value::Object(fields) => fields
            .get("text")
            .and_then(delta_text)
            .or_else(|| fields.get("delta").and_then(delta_text)),
        _ => None,
    }
}

// Full text wins, then previous + delta, then previous, then empty.
fn merged_text(incoming: &IncomingPart, existing: Option<&Part>) -> String {
    if let Some(text) = &incoming.text {
        return text.clone();
    }

    let previous = existing.and_then(Part::text_content);
    match (incoming.delta.as_ref().and_then(delta_text), previous) {
        (Some(delta), Some(previous)) => format!("{previous}{delta}"),
        (Some(delta), None) => delta,
        (None, Some(previous)) => previous.to_string(),
        (None, None) => String::new(),
    }
}

fn tool_state(state: Option<&Value>) -> ToolState {
    let Some(Value::Object(state)) = state else {
        return ToolState::default();
    };

    ToolState {
        status: state
            .get("status")
            .and_then(Value::as_str)
            .map(ToolStatus::parse)
            .unwrap_or_default(),
        input: state.get("input").cloned().unwrap_or(Value::Null),
        output: string_field(state, "output"),
        error: string_field(state, "error"),
        title: string_field(state, "title"),
    }
}

// Delta-only fields never reach storage.
fn unknown_payload(incoming: &IncomingPart) -> Value {
    let mut payload: Map<String, Value> = incoming.fields.clone();
    if let Some(text) = &incoming.text {
        payload.insert("text".to_string(), Value::String(text.clone()));
    }
    Value::Object(payload)
}

#[cfg(test)]
mod tests {
    use chat_protocol::{IncomingPart, TokenUsage};
    use serde_json::json;

    use super::{delta_text, normalize_part};
    use crate::model::{Part, PartBody, ToolStatus};

    fn apply(incoming: &IncomingPart, existing: Option<&Part>) -> Part {
        normalize_part(incoming, existing, "msg_1", "ses_1")
    }

    #[test]
    fn deltas_accumulate_onto_previous_text() {
        let first = apply(&IncomingPart::text_delta("prt_1", "Hel"), None);
        let second = apply(&IncomingPart::text_delta("prt_1", "lo"), Some(&first));

        assert_eq!(second.text_content(), Some("Hello"));
    }

    #[test]
    fn sequential_deltas_match_a_single_concatenated_delta() {
        let stepwise = ["a", "bc", "", "def"].iter().fold(None, |existing: Option<Part>, delta| {
            Some(apply(&IncomingPart::text_delta("prt_1", *delta), existing.as_ref()))
        });
        let at_once = apply(&IncomingPart::text_delta("prt_1", "abcdef"), None);

        assert_eq!(
            stepwise.as_ref().and_then(Part::text_content),
            at_once.text_content()
        );
    }

    #[test]
    fn full_text_replaces_accumulated_text() {
        let first = apply(&IncomingPart::text_delta("prt_1", "draft"), None);
        let mut replacement = IncomingPart::text("prt_1", "final");
        replacement.delta = Some(json!("ignored"));

        assert_eq!(apply(&replacement, Some(&first)).text_content(), Some("final"));
    }

    #[test]
    fn missing_text_keeps_previous_or_defaults_to_empty() {
        let bare = IncomingPart {
            id: "prt_1".to_string(),
            ..IncomingPart::default()
        };
        assert_eq!(apply(&bare, None).text_content(), Some(""));

        let previous = apply(&IncomingPart::text("prt_1", "kept"), None);
        assert_eq!(apply(&bare, Some(&previous)).text_content(), Some("kept"));
    }

    #[test]
    fn nested_delta_shapes_are_flattened() {
        assert_eq!(delta_text(&json!("x")), Some("x".to_string()));
        assert_eq!(
            delta_text(&json!(["a", { "text": "b" }, { "delta": { "text": "c" } }, 4])),
            Some("abc".to_string())
        );
        assert_eq!(delta_text(&json!({ "delta": ["d", "e"] })), Some("de".to_string()));
        assert_eq!(delta_text(&json!(null)), None);
        assert_eq!(delta_text(&json!([])), None);
    }

    #[test]
    fn tool_parts_replace_wholesale() {
        let running = IncomingPart::new("prt_2", "tool")
            .with_field("callID", "call_1")
            .with_field("tool", "bash")
            .with_field("state", json!({ "status": "running", "input": { "command": "ls" } }));
        let completed = IncomingPart::new("prt_2", "tool")
            .with_field("tool", "bash")
            .with_field("state", json!({ "status": "completed", "output": "src\n" }));

        let first = apply(&running, None);
        let second = apply(&completed, Some(&first));

        let PartBody::Tool {
            call_id,
            tool,
            state,
        } = second.body
        else {
            panic!("expected a tool part");
        };
        assert_eq!(call_id, None);
        assert_eq!(tool, "bash");
        assert_eq!(state.status, ToolStatus::Completed);
        assert_eq!(state.output.as_deref(), Some("src\n"));
    }

    #[test]
    fn step_finish_reads_usage_and_unknown_types_are_kept() {
        let finish = IncomingPart::new("prt_3", "step-finish")
            .with_field("reason", "stop")
            .with_field("tokens", json!({ "input": 5, "output": 7 }))
            .with_field("cost", 0.25);
        let part = apply(&finish, None);
        assert!(part.is_step_finish());
        assert!(matches!(
            part.tokens(),
            Some(TokenUsage::Breakdown(breakdown)) if breakdown.input == 5 && breakdown.output == 7
        ));

        let mut odd = IncomingPart::new("prt_4", "retry").with_field("attempt", 2);
        odd.delta = Some(json!("dropped"));
        let part = apply(&odd, None);
        assert_eq!(part.kind(), "retry");
        let PartBody::Unknown { payload, .. } = part.body else {
            panic!("expected an unknown part");
        };
        assert_eq!(payload, json!({ "attempt": 2 }));
    }
}
