use serde_json::{Value, json};

use super::SocketId;
use crate::config::LockStrategy;
use crate::error::GatewayError;
use crate::services::locks::LockError;
use crate::services::msgqueue::Enqueued;
use crate::state::AppState;
use crate::types::events::{Frame, JobScoped, RoomJoinPayload};
use crate::types::message::ChatMessage;

/// Dispatch one authenticated chat event. Returns the ack payload when the
/// client asked for one.
pub async fn handle_event(
    state: &AppState,
    socket_id: &SocketId,
    user_id: &str,
    frame: Frame,
) -> Option<Value> {
    match frame.event.as_str() {
        "contract:message.send" => Some(handle_message_send(state, user_id, frame.data).await),
        "contract:message.pin" => {
            Some(fan_out_scoped(state, frame.data, "contract:message.pinned").await)
        }
        "contract:message.unpin" => {
            Some(fan_out_scoped(state, frame.data, "contract:message.unpinned").await)
        }
        "contract:message.read" => {
            Some(fan_out_scoped(state, frame.data, "contract:message.read").await)
        }
        "contract:message.typing" => {
            handle_typing(state, socket_id, frame.data);
            Some(json!({"success": true}))
        }
        "contract:room.join" | "chat.room.join" => Some(handle_room_join(state, socket_id, frame.data)),
        "chat.room.leave" => Some(handle_room_leave(state, socket_id, frame.data)),
        other => {
            tracing::debug!(event = other, "Unknown chat event");
            Some(json!({"success": false, "error": format!("unknown event: {other}")}))
        }
    }
}

/// `contract:message.send`: validate, then under the conversation lock run
/// the ordered enqueue → broadcast step. Duplicates (by message id) are
/// acked as delivered without a second broadcast.
async fn handle_message_send(state: &AppState, user_id: &str, data: Value) -> Value {
    let mut message: ChatMessage = match serde_json::from_value(data) {
        Ok(message) => message,
        Err(e) => {
            return GatewayError::InvalidPayload(format!("malformed message: {e}")).ack_payload();
        }
    };
    if let Err(reason) = message.validate() {
        return GatewayError::InvalidPayload(reason).ack_payload();
    }
    if message.sender_id.is_none() {
        message.sender_id = Some(user_id.to_string());
    }

    let job_id = message.job_id.clone();
    let task = ingest_task(state.clone(), message.clone());
    let enqueue = || async {
        state
            .queues
            .enqueue(&job_id, &message.id, message.timestamp, task)
            .await
    };

    let locked = match state.config.chat.lock_strategy {
        LockStrategy::Blocking => state.locks.with_lock(&message.job_id, enqueue).await,
        LockStrategy::Try => state.locks.try_with_lock(&message.job_id, enqueue).await,
    };

    match locked {
        Ok(Enqueued::Duplicate) => {
            json!({"delivered": true, "duplicate": true, "messageId": message.id})
        }
        Ok(Enqueued::Executed(Ok(result))) => result,
        Ok(Enqueued::Executed(Err(e))) => {
            tracing::error!(message_id = %message.id, error = %e, "Message ingestion failed");
            json!({"success": false, "error": "message ingestion failed"})
        }
        Err(LockError::Busy) => GatewayError::LockBusy.ack_payload(),
        Err(LockError::Aborted) => {
            tracing::error!(job_id = %message.job_id, "Conversation lock aborted mid-task");
            GatewayError::LockAborted.ack_payload()
        }
        Err(e) => {
            tracing::error!(job_id = %message.job_id, error = %e, "Conversation lock failed");
            json!({"success": false, "error": "could not serialize message"})
        }
    }
}

/// The work run inside the conversation's FIFO slot: durable enqueue with
/// idempotent de-duplication, then the room broadcast.
fn ingest_task(
    state: AppState,
    message: ChatMessage,
) -> crate::services::msgqueue::QueueTask {
    Box::pin(async move {
        let outcome = state.outbox.enqueue(&message).await?;
        if outcome.is_duplicate {
            return Ok(json!({
                "delivered": true,
                "duplicate": true,
                "messageId": message.id,
            }));
        }

        state.gateway.broadcast_to_room(
            &message.job_id,
            Frame::event("contract:message.new", &message),
            None,
        );

        Ok(json!({
            "success": true,
            "messageId": message.id,
            "timestamp": message.timestamp,
        }))
    })
}

/// Pin/unpin/read share one shape: fan the original payload out to the
/// conversation under its lock.
async fn fan_out_scoped(state: &AppState, data: Value, outbound_event: &str) -> Value {
    let scoped: JobScoped = match serde_json::from_value(data.clone()) {
        Ok(scoped) => scoped,
        Err(_) => return GatewayError::InvalidPayload("jobId is required".into()).ack_payload(),
    };

    let result = state
        .locks
        .with_lock(&scoped.job_id, || async {
            state
                .gateway
                .broadcast_to_room(&scoped.job_id, Frame::event(outbound_event, &data), None);
        })
        .await;

    match result {
        Ok(()) => json!({"ok": true}),
        Err(LockError::Busy) => GatewayError::LockBusy.ack_payload(),
        Err(e) => {
            tracing::error!(job_id = %scoped.job_id, error = %e, "Scoped fan-out failed");
            json!({"ok": false, "error": "broadcast failed"})
        }
    }
}

/// Typing is unlocked and excludes the sender.
fn handle_typing(state: &AppState, socket_id: &SocketId, data: Value) {
    let Ok(scoped) = serde_json::from_value::<JobScoped>(data.clone()) else {
        return;
    };
    state.gateway.broadcast_to_room(
        &scoped.job_id,
        Frame::event("contract:message.typing", &data),
        Some(socket_id),
    );
}

fn handle_room_join(state: &AppState, socket_id: &SocketId, data: Value) -> Value {
    let room: RoomJoinPayload = match serde_json::from_value(data) {
        Ok(room) => room,
        Err(_) => return GatewayError::InvalidPayload("roomId is required".into()).ack_payload(),
    };
    state.gateway.join_room(&room.room_id, socket_id);
    json!({"roomId": room.room_id})
}

fn handle_room_leave(state: &AppState, socket_id: &SocketId, data: Value) -> Value {
    let room: RoomJoinPayload = match serde_json::from_value(data) {
        Ok(room) => room,
        Err(_) => return GatewayError::InvalidPayload("roomId is required".into()).ack_payload(),
    };
    state.gateway.leave_room(&room.room_id, socket_id);
    json!({"left": true})
}
