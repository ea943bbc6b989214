// ABOUTME: Wire types shared between agents and the conductor
// ABOUTME: Turn submission, control-surface payloads, and health reporting

use serde::{Deserialize, Serialize};

/// A conversation turn handed to the conductor. Immutable once sent.
///
/// This is fire-and-acknowledge, not request/response: acceptance means the
/// conductor owns the turn, and the actual reply arrives later through the
/// control surface. `event_id` is the idempotency key — a retried submission
/// carries the same id, as does a broadcast mention picked up by two
/// personas, so the conductor can collapse duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub user_query: String,
    pub channel_id: String,
    pub initiator_persona: String,
    pub initiator_mention: Option<String>,
    pub human_display_name: String,
    pub is_new_conversation: bool,
    pub session_id: String,
    pub event_id: String,
}

/// The conductor's acknowledgment of a submitted turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnAck {
    pub accepted: bool,
}

/// The only payload the conductor may push back into an agent: deliver this
/// text into this channel. No session metadata round-trips — the agent is a
/// dumb transport here, and the call is deliberately not idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverRequest {
    pub channel_id: String,
    pub message_text: String,
}

/// Ask an agent to open a conversation as if it had spoken first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateRequest {
    pub starter_text: String,
    pub channel_id: String,
    pub is_new: bool,
    pub session_id: String,
}

/// Control-surface response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
}

impl ControlResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Liveness/readiness report. `platform_connected` reflects the real
/// connection state — a process can be alive with its platform session gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub platform_connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_request_round_trips() {
        let req = TurnRequest {
            user_query: "hello".into(),
            channel_id: "C1".into(),
            initiator_persona: "peter".into(),
            initiator_mention: Some("<@111>".into()),
            human_display_name: "Lois".into(),
            is_new_conversation: true,
            session_id: "s-1".into(),
            event_id: "evt-1".into(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: TurnRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_id, "evt-1");
        assert!(back.is_new_conversation);
        assert_eq!(back.initiator_mention.as_deref(), Some("<@111>"));
    }

    #[test]
    fn test_control_response_helpers() {
        assert!(ControlResponse::ok("fine").success);
        assert!(!ControlResponse::error("nope").success);
    }
}
