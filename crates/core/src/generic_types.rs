//! Transport-agnostic types shared by the call bridge and its adapters.
//!
//! Both external transports (the telephony media stream and the voice-agent
//! connection) are normalized into these types before the bridge sees them.

use crate::dispatcher::DispatchError;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Which way an audio frame travels through the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Caller speech, flowing from the phone line to the agent.
    CallerToAgent,
    /// Synthesized agent speech, flowing back to the phone line.
    AgentToCaller,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::CallerToAgent => write!(f, "caller_to_agent"),
            Direction::AgentToCaller => write!(f, "agent_to_caller"),
        }
    }
}

/// A timestamped chunk of raw audio (8 kHz mu-law on both legs of a call).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub direction: Direction,
    /// Sequence number assigned by the producing adapter.
    pub sequence: u64,
    /// Milliseconds since the start of the stream.
    pub timestamp_ms: u64,
    pub payload: Bytes,
}

impl AudioFrame {
    pub fn new(direction: Direction, sequence: u64, timestamp_ms: u64, payload: Bytes) -> Self {
        Self {
            direction,
            sequence,
            timestamp_ms,
            payload,
        }
    }
}

/// Control-plane events exchanged between the transports and the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    SessionStarted,
    SessionEnded,
    AgentSpeechStarted,
    AgentSpeechStopped,
    CallerSpeechStarted,
    CallerSpeechStopped,
    /// The agent asks the bridge to run a named backend function.
    FunctionCallRequested {
        call_id: String,
        name: String,
        arguments: Value,
    },
    /// The answer to an earlier `FunctionCallRequested` with the same `call_id`.
    FunctionCallResult {
        call_id: String,
        name: String,
        result: Result<Value, DispatchError>,
    },
    /// The caller interrupted the agent; agent playback must stop.
    BargeInCancel,
}

impl ControlEvent {
    /// A short, stable label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlEvent::SessionStarted => "session_started",
            ControlEvent::SessionEnded => "session_ended",
            ControlEvent::AgentSpeechStarted => "agent_speech_started",
            ControlEvent::AgentSpeechStopped => "agent_speech_stopped",
            ControlEvent::CallerSpeechStarted => "caller_speech_started",
            ControlEvent::CallerSpeechStopped => "caller_speech_stopped",
            ControlEvent::FunctionCallRequested { .. } => "function_call_requested",
            ControlEvent::FunctionCallResult { .. } => "function_call_result",
            ControlEvent::BargeInCancel => "barge_in_cancel",
        }
    }

    /// Builds the JSON document returned to the agent for a function result.
    ///
    /// Successful results are passed through unchanged; errors are wrapped as
    /// `{"error": {"kind": ..., "message": ...}}` so the agent can recover verbally.
    pub fn result_payload(result: &Result<Value, DispatchError>) -> Value {
        match result {
            Ok(payload) => payload.clone(),
            Err(e) => e.to_payload(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::CallerToAgent.to_string(), "caller_to_agent");
        assert_eq!(Direction::AgentToCaller.to_string(), "agent_to_caller");
    }

    #[test]
    fn test_result_payload_passes_success_through() {
        let ok = Ok(json!({"found": true}));
        assert_eq!(ControlEvent::result_payload(&ok), json!({"found": true}));
    }

    #[test]
    fn test_result_payload_wraps_errors() {
        let err = Err(DispatchError::NotFound("Order 7 not found".to_string()));
        let payload = ControlEvent::result_payload(&err);
        assert_eq!(payload["error"]["kind"], "not_found");
        assert_eq!(payload["error"]["message"], "Order 7 not found");
    }

    #[test]
    fn test_event_kind_labels() {
        let request = ControlEvent::FunctionCallRequested {
            call_id: "c1".into(),
            name: "lookup_menu_item".into(),
            arguments: json!({}),
        };
        assert_eq!(request.kind(), "function_call_requested");
        assert_eq!(ControlEvent::BargeInCancel.kind(), "barge_in_cancel");
    }
}
