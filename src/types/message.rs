use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Chat message envelope as it travels over the socket. `encrypted_content`,
/// `merkle_leaf` and `previous_counter` are opaque to the server; it never
/// decrypts or validates them, only routes and stores them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub job_id: String,
    #[serde(default)]
    pub sender_id: Option<String>,
    /// Client-supplied ordering timestamp in milliseconds.
    pub timestamp: i64,
    #[serde(rename = "type", default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub encrypted_content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merkle_leaf: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_counter: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ChatMessage {
    /// Structural validation at the gateway boundary: a message must target a
    /// conversation and carry a ciphertext body.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("message id is required".into());
        }
        if self.job_id.is_empty() {
            return Err("jobId is required".into());
        }
        match self.encrypted_content.get("body") {
            Some(body) if !body.is_null() => Ok(()),
            _ => Err("encryptedContent.body is required".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ChatMessage {
        serde_json::from_value(json!({
            "id": "m1",
            "jobId": "j1",
            "timestamp": 10,
            "encryptedContent": {"body": "x"},
        }))
        .unwrap()
    }

    #[test]
    fn accepts_minimal_envelope() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn rejects_missing_job_id() {
        let mut msg = sample();
        msg.job_id.clear();
        assert!(msg.validate().is_err());
    }

    #[test]
    fn rejects_missing_ciphertext_body() {
        let mut msg = sample();
        msg.encrypted_content = json!({"nonce": "abc"});
        assert!(msg.validate().is_err());
    }

    #[test]
    fn opaque_fields_pass_through_unchanged() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "id": "m2",
            "jobId": "j1",
            "timestamp": 11,
            "encryptedContent": {"body": "y"},
            "merkleLeaf": {"hash": "00ff"},
            "previousCounter": 41,
        }))
        .unwrap();
        let out = serde_json::to_value(&msg).unwrap();
        assert_eq!(out["merkleLeaf"]["hash"], "00ff");
        assert_eq!(out["previousCounter"], 41);
    }
}
