use mediasoup::data_structures::DtlsParameters;
use mediasoup::rtp_parameters::{RtpCapabilities, RtpParameters};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::streams::StreamKind;

// ── Wire frame ─────────────────────────────────────────
//
// Both socket namespaces speak the same envelope: an event name, a JSON
// payload, and an optional ack id the client expects echoed back on the
// `ack` event.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl Frame {
    pub fn event(name: &str, data: impl Serialize) -> Self {
        Self {
            event: name.into(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
            ack: None,
        }
    }

    pub fn ack(ack_id: u64, data: impl Serialize) -> Self {
        Self {
            event: "ack".into(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
            ack: Some(ack_id),
        }
    }
}

// ── Chat namespace ─────────────────────────────────────

pub const AUTH_TIMEOUT: &str = "AUTH_TIMEOUT";
pub const AUTH_FAILED: &str = "AUTH_FAILED";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthErrorPayload {
    pub error: String,
    pub code: &'static str,
}

/// Minimal extractor for events that only need the conversation key; the
/// original payload is fanned out untouched.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobScoped {
    pub job_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoinPayload {
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthPayload {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusUpdated {
    pub event_id: String,
    pub timestamp: i64,
    pub source: String,
    pub job_id: String,
    pub previous_status: String,
    pub new_status: String,
    #[serde(default)]
    pub transactions: Option<Value>,
}

// ── Media namespace: client → server ───────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportRole {
    Producer,
    Consumer,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    pub room_id: String,
    pub user_name: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTransportPayload {
    pub role: TransportRole,
    /// Consumer requests identify the stream they want by the producing
    /// peer's audio producer id.
    #[serde(default)]
    pub audio_pid: Option<String>,
    #[serde(default)]
    pub stream_kind: Option<StreamKind>,
    #[serde(default)]
    pub associated_producer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportPayload {
    pub role: TransportRole,
    pub dtls_parameters: DtlsParameters,
    #[serde(default)]
    pub audio_pid: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProducingPayload {
    pub stream_kind: StreamKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeMediaPayload {
    pub rtp_capabilities: RtpCapabilities,
    pub pid: String,
    /// What the client believes it is consuming; the server re-detects the
    /// actual kind from the producer registry.
    #[serde(default)]
    pub kind: Option<StreamKind>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnpauseConsumerPayload {
    pub pid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioOp {
    Mute,
    Unmute,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChangePayload {
    pub op: AudioOp,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseProducersPayload {
    pub producer_ids: Vec<String>,
}

// ── Media namespace: server → client ───────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewParticipant {
    pub participant_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantLeft {
    pub participant_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducer {
    pub participant_id: String,
    pub display_name: String,
    pub kind: StreamKind,
    pub producer_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosed {
    pub producer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<StreamKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociatedUser {
    pub id: String,
    pub display_name: String,
}

/// Subscription delta delivered to one socket: which audio streams it should
/// start consuming, their associated video streams (index-parallel, null when
/// the owner publishes no video), and who owns each of them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducersToConsume {
    pub router_rtp_capabilities: Value,
    pub audio_pids_to_create: Vec<String>,
    pub video_pids_to_create: Vec<Option<String>>,
    pub associated_users: Vec<AssociatedUser>,
    pub active_speaker_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionEvent {
    pub room_id: String,
    pub participant_id: String,
    pub segment_index: u32,
    pub text: String,
    pub language: String,
    pub confidence: f64,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_ack_round_trip() {
        let frame = Frame::ack(7, json!({"success": true}));
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["event"], "ack");
        assert_eq!(wire["ack"], 7);
        assert_eq!(wire["data"]["success"], true);

        let parsed: Frame = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed.ack, Some(7));
    }

    #[test]
    fn frame_without_ack_omits_field() {
        let frame = Frame::event("updateActiveSpeakers", json!(["p1"]));
        let wire = serde_json::to_string(&frame).unwrap();
        assert!(!wire.contains("ack"));
    }

    #[test]
    fn job_status_notification_round_trips() {
        let event: JobStatusUpdated = serde_json::from_value(json!({
            "eventId": "e1",
            "timestamp": 1700000000000_i64,
            "source": "jobs-service",
            "jobId": "j1",
            "previousStatus": "open",
            "newStatus": "closed",
            "transactions": [],
        }))
        .unwrap();
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["jobId"], "j1");
        assert_eq!(wire["newStatus"], "closed");
    }

    #[test]
    fn new_producers_payload_shape() {
        let payload = NewProducersToConsume {
            router_rtp_capabilities: json!({}),
            audio_pids_to_create: vec!["a1".into()],
            video_pids_to_create: vec![None],
            associated_users: vec![AssociatedUser {
                id: "u1".into(),
                display_name: "Ada".into(),
            }],
            active_speaker_list: vec!["a1".into()],
        };
        let wire = serde_json::to_value(&payload).unwrap();
        assert_eq!(wire["audioPidsToCreate"][0], "a1");
        assert_eq!(wire["videoPidsToCreate"][0], Value::Null);
        assert_eq!(wire["associatedUsers"][0]["displayName"], "Ada");
    }
}
