use std::sync::Arc;

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

use super::GatewayState;
use crate::types::events::Frame;

const ROOM_CHANNEL_PREFIX: &str = "gateway:room:";
const CONTROL_CHANNEL: &str = "gateway:ctl";

#[derive(Debug, Serialize, Deserialize)]
struct RoomEnvelope {
    origin: String,
    room: String,
    #[serde(default)]
    exclude: Option<String>,
    frame: Frame,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum ControlMessage {
    DisconnectSockets { origin: String, socket_ids: Vec<String> },
}

/// Mirrors room broadcasts and socket disconnects across nodes through the
/// shared store's pub/sub. Local delivery never waits on the store.
pub struct ClusterAdapter {
    node_id: String,
    publisher: ConnectionManager,
}

impl ClusterAdapter {
    pub fn new(node_id: String, publisher: ConnectionManager) -> Self {
        Self { node_id, publisher }
    }

    pub fn publish_room(&self, room: &str, frame: Frame, exclude: Option<String>) {
        let envelope = RoomEnvelope {
            origin: self.node_id.clone(),
            room: room.to_string(),
            exclude,
            frame,
        };
        let channel = format!("{ROOM_CHANNEL_PREFIX}{room}");
        let mut conn = self.publisher.clone();
        tokio::spawn(async move {
            let payload = match serde_json::to_string(&envelope) {
                Ok(p) => p,
                Err(_) => return,
            };
            if let Err(e) = redis::cmd("PUBLISH")
                .arg(&channel)
                .arg(&payload)
                .query_async::<()>(&mut conn)
                .await
            {
                tracing::warn!(channel = %channel, error = %e, "Cluster publish failed");
            }
        });
    }

    pub fn publish_disconnect(&self, socket_ids: Vec<String>) {
        let message = ControlMessage::DisconnectSockets {
            origin: self.node_id.clone(),
            socket_ids,
        };
        let mut conn = self.publisher.clone();
        tokio::spawn(async move {
            let payload = match serde_json::to_string(&message) {
                Ok(p) => p,
                Err(_) => return,
            };
            if let Err(e) = redis::cmd("PUBLISH")
                .arg(CONTROL_CHANNEL)
                .arg(&payload)
                .query_async::<()>(&mut conn)
                .await
            {
                tracing::warn!(error = %e, "Cluster control publish failed");
            }
        });
    }

    /// Subscriber loop applying remote broadcasts and disconnects locally.
    /// Runs until the pub/sub connection drops.
    pub fn spawn_subscriber(
        gateway: Arc<GatewayState>,
        client: redis::Client,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(ps) => ps,
                Err(e) => {
                    tracing::error!(error = %e, "Cluster subscriber could not connect");
                    return;
                }
            };
            if let Err(e) = pubsub.psubscribe(format!("{ROOM_CHANNEL_PREFIX}*")).await {
                tracing::error!(error = %e, "Cluster room subscription failed");
                return;
            }
            if let Err(e) = pubsub.subscribe(CONTROL_CHANNEL).await {
                tracing::error!(error = %e, "Cluster control subscription failed");
                return;
            }

            let node_id = gateway.node_id().to_string();
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                if channel == CONTROL_CHANNEL {
                    if let Ok(ControlMessage::DisconnectSockets { origin, socket_ids }) =
                        serde_json::from_str(&payload)
                    {
                        if origin != node_id {
                            gateway.disconnect_local(&socket_ids);
                        }
                    }
                    continue;
                }

                if let Ok(envelope) = serde_json::from_str::<RoomEnvelope>(&payload) {
                    if envelope.origin == node_id {
                        continue;
                    }
                    gateway.deliver_local(
                        &envelope.room,
                        &envelope.frame,
                        envelope.exclude.as_ref(),
                    );
                }
            }
            tracing::warn!("Cluster subscriber stream ended");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn room_envelope_round_trips() {
        let envelope = RoomEnvelope {
            origin: "n1".into(),
            room: "r1".into(),
            exclude: Some("s1".into()),
            frame: Frame::event("contract:message.new", json!({"id": "m1"})),
        };
        let wire = serde_json::to_string(&envelope).unwrap();
        let back: RoomEnvelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.room, "r1");
        assert_eq!(back.exclude.as_deref(), Some("s1"));
        assert_eq!(back.frame.event, "contract:message.new");
    }

    #[test]
    fn control_message_is_tagged() {
        let msg = ControlMessage::DisconnectSockets {
            origin: "n1".into(),
            socket_ids: vec!["s1".into()],
        };
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["op"], "disconnectSockets");
    }
}
