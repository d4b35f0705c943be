use serde_json::{Value, json};

use super::SocketId;
use crate::error::GatewayError;
use crate::media::peer::Peer;
use crate::media::room::Room;
use crate::media::{rtc, speakers};
use crate::state::AppState;
use crate::types::events::{
    AudioChangePayload, CloseProducersPayload, ConnectTransportPayload, ConsumeMediaPayload,
    Frame, JoinRoomPayload, NewParticipant, NewProducer, ParticipantLeft, ProducerClosed,
    RequestTransportPayload, StartProducingPayload, UnpauseConsumerPayload,
};
use crate::types::streams::StreamKind;

/// Dispatch one media event. Returns the ack payload when the client asked
/// for one.
pub async fn handle_event(
    state: &AppState,
    socket_id: &SocketId,
    user_id: &str,
    display_name: &str,
    frame: Frame,
) -> Option<Value> {
    let result = match frame.event.as_str() {
        "joinRoom" => handle_join_room(state, socket_id, user_id, display_name, frame.data).await,
        "leaveRoom" => {
            handle_disconnect(state, socket_id).await;
            Ok(json!({"left": true}))
        }
        "requestTransport" => {
            with_peer(state, socket_id, frame.data, |peer, payload: RequestTransportPayload| async move {
                rtc::handle_transport_request(state, &peer, payload).await
            })
            .await
        }
        "connectTransport" => {
            with_peer(state, socket_id, frame.data, |peer, payload: ConnectTransportPayload| async move {
                rtc::connect_transport(state, &peer, payload).await
            })
            .await
        }
        "startProducing" => handle_start_producing(state, socket_id, frame.data).await,
        "consumeMedia" => {
            with_peer(state, socket_id, frame.data, |peer, payload: ConsumeMediaPayload| async move {
                rtc::consume_media(state, &peer, payload).await
            })
            .await
        }
        "unpauseConsumer" => {
            with_peer(state, socket_id, frame.data, |peer, payload: UnpauseConsumerPayload| async move {
                rtc::unpause_consumer(state, &peer, payload).await
            })
            .await
        }
        "audioChange" => handle_audio_change(state, socket_id, frame.data).await,
        "closeProducers" => handle_close_producers(state, socket_id, frame.data).await,
        other => {
            tracing::debug!(event = other, "Unknown media event");
            Err(GatewayError::InvalidPayload(format!("unknown event: {other}")))
        }
    };

    Some(match result {
        Ok(value) => value,
        Err(e) => e.ack_payload(),
    })
}

fn current_peer(state: &AppState, socket_id: &SocketId) -> Result<(Room, Peer), GatewayError> {
    let room_id = state
        .rooms
        .room_for_socket(socket_id)
        .ok_or(GatewayError::NotInRoom)?;
    let room = state.rooms.get(&room_id).ok_or(GatewayError::NotInRoom)?;
    let peer = room
        .peer_by_socket(socket_id)
        .ok_or(GatewayError::NotInRoom)?;
    Ok((room, peer))
}

async fn with_peer<P, F, Fut>(
    state: &AppState,
    socket_id: &SocketId,
    data: Value,
    op: F,
) -> Result<Value, GatewayError>
where
    P: serde::de::DeserializeOwned,
    F: FnOnce(Peer, P) -> Fut,
    Fut: std::future::Future<Output = Result<Value, GatewayError>>,
{
    let payload: P = serde_json::from_value(data)
        .map_err(|e| GatewayError::InvalidPayload(format!("malformed payload: {e}")))?;
    let (_room, peer) = current_peer(state, socket_id)?;
    op(peer, payload).await
}

async fn handle_join_room(
    state: &AppState,
    socket_id: &SocketId,
    user_id: &str,
    display_name: &str,
    data: Value,
) -> Result<Value, GatewayError> {
    let payload: JoinRoomPayload = serde_json::from_value(data)
        .map_err(|e| GatewayError::InvalidPayload(format!("malformed joinRoom: {e}")))?;
    let name = if payload.user_name.is_empty() {
        display_name.to_string()
    } else {
        payload.user_name.clone()
    };

    let (room, created) = state
        .rooms
        .get_or_create(state, &payload.room_id, user_id, payload.password.clone())
        .await?;

    if !created {
        if !room.check_password(payload.password.as_deref()) {
            return Err(GatewayError::InvalidRoomPassword);
        }
        if room.is_blocked(user_id) {
            return Err(GatewayError::Banned);
        }
    }

    // The same user rejoining from a new socket evicts their old peer.
    if let Some(existing) = room.peer_by_user(user_id) {
        if existing.socket_id() != socket_id {
            let old_socket = existing.socket_id().clone();
            tracing::info!(room_id = %room.id(), user_id, old_socket = %old_socket,
                "Evicting stale peer for rejoining user");
            state.gateway.disconnect_sockets(&[old_socket.clone()]);
            // The room survives even if the stale peer was its last member;
            // this user is joining it right now.
            remove_peer_from_room(state, &room, &old_socket, false).await;
        }
    }

    let peer = Peer::new(user_id, &name, socket_id, room.id());
    room.add_peer(peer);
    state.rooms.bind_socket(socket_id, room.id());
    state.gateway.join_room(room.id(), socket_id);

    if !(created && room.owner_id() == user_id) {
        state.gateway.broadcast_to_room(
            room.id(),
            Frame::event(
                "newParticipant",
                NewParticipant {
                    participant_id: user_id.to_string(),
                    display_name: name.clone(),
                },
            ),
            Some(socket_id),
        );
    }

    let view = speakers::initial_view(state, &room);
    Ok(serde_json::to_value(view).unwrap_or_default())
}

async fn handle_start_producing(
    state: &AppState,
    socket_id: &SocketId,
    data: Value,
) -> Result<Value, GatewayError> {
    let payload: StartProducingPayload = serde_json::from_value(data)
        .map_err(|e| GatewayError::InvalidPayload(format!("malformed startProducing: {e}")))?;
    let stream_kind = payload.stream_kind;
    let (room, peer) = current_peer(state, socket_id)?;

    let producer = rtc::start_producing(state, &peer, payload).await?;
    let producer_id = producer.id().to_string();

    // Microphone audio (not screen audio) also feeds the capture pipeline;
    // a tap failure never disturbs the live media path.
    if stream_kind == StreamKind::Audio {
        if let Err(e) = state.sidetap.start_tap(&room, &peer, &producer).await {
            tracing::warn!(
                room_id = %room.id(),
                participant_id = %peer.user_id(),
                producer_id = %producer_id,
                error = %e,
                "Audio side-tap unavailable for this producer"
            );
        }
    }

    // Re-plan subscriptions and announce the producer, serialized with every
    // other emission for this room.
    let resource = format!("room:{}", room.id());
    let announce = state
        .locks
        .with_lock(&resource, || async {
            speakers::reconcile_and_emit(state, &room).await;
            state.gateway.broadcast_to_room(
                room.id(),
                Frame::event(
                    "newProducer",
                    NewProducer {
                        participant_id: peer.user_id().to_string(),
                        display_name: peer.display_name().to_string(),
                        kind: stream_kind,
                        producer_id: producer_id.clone(),
                    },
                ),
                Some(socket_id),
            );
        })
        .await;
    if let Err(e) = announce {
        tracing::warn!(room_id = %room.id(), error = %e, "Producer announcement failed");
    }

    Ok(json!({"id": producer_id}))
}

async fn handle_audio_change(
    state: &AppState,
    socket_id: &SocketId,
    data: Value,
) -> Result<Value, GatewayError> {
    let payload: AudioChangePayload = serde_json::from_value(data.clone())
        .map_err(|e| GatewayError::InvalidPayload(format!("malformed audioChange: {e}")))?;
    let (room, peer) = current_peer(state, socket_id)?;

    let ack = rtc::handle_audio_change(state, &peer, payload).await?;
    state.gateway.broadcast_to_room(
        room.id(),
        Frame::event(
            "audioChange",
            json!({"participantId": peer.user_id(), "op": data["op"]}),
        ),
        Some(socket_id),
    );
    Ok(ack)
}

async fn handle_close_producers(
    state: &AppState,
    socket_id: &SocketId,
    data: Value,
) -> Result<Value, GatewayError> {
    let payload: CloseProducersPayload = serde_json::from_value(data)
        .map_err(|e| GatewayError::InvalidPayload(format!("malformed closeProducers: {e}")))?;
    let (room, peer) = current_peer(state, socket_id)?;

    for producer_id in &payload.producer_ids {
        let Some((kind, producer)) = peer.remove_producer_by_id(producer_id) else {
            continue;
        };
        room.remove_speaker(producer_id);
        if kind == StreamKind::Audio {
            if state.sidetap.stop_tap(producer_id).await.is_some() {
                if let Err(e) = state
                    .transcripts
                    .flush_session(room.id(), peer.user_id())
                    .await
                {
                    tracing::warn!(error = %e, "Transcript flush failed");
                }
            }
        }
        drop(producer);

        state.gateway.broadcast_to_room(
            room.id(),
            Frame::event(
                "producerClosed",
                ProducerClosed {
                    producer_id: producer_id.clone(),
                    kind: Some(kind),
                    user_id: None,
                },
            ),
            None,
        );
    }

    Ok(json!({"success": true}))
}

/// Socket gone or explicit leave: tear the peer down and, when the room
/// empties, the room itself.
pub async fn handle_disconnect(state: &AppState, socket_id: &SocketId) {
    let Some(room_id) = state.rooms.room_for_socket(socket_id) else {
        return;
    };
    let Some(room) = state.rooms.get(&room_id) else {
        state.rooms.unbind_socket(socket_id);
        return;
    };
    remove_peer_from_room(state, &room, socket_id, true).await;
}

async fn remove_peer_from_room(
    state: &AppState,
    room: &Room,
    socket_id: &SocketId,
    destroy_if_empty: bool,
) {
    let Some(peer) = room.peer_by_socket(socket_id) else {
        state.rooms.unbind_socket(socket_id);
        return;
    };
    let user_id = peer.user_id().to_string();

    // Stop capture first so the segmenter is not reading a dying transport.
    let stopped = state
        .sidetap
        .stop_for_participant(room.id(), &user_id)
        .await;
    for (tap_room, participant) in stopped {
        if let Err(e) = state.transcripts.flush_session(&tap_room, &participant).await {
            tracing::warn!(error = %e, "Transcript flush failed");
        }
    }

    let producers = peer.producers();
    let producer_ids: Vec<String> = producers
        .iter()
        .map(|(_, p)| p.id().to_string())
        .collect();

    for pid in &producer_ids {
        room.remove_speaker(pid);
    }
    for other in room.peers() {
        if other.socket_id() != socket_id {
            other.clear_downstream_refs(&producer_ids);
        }
    }

    state.gateway.broadcast_to_room(
        room.id(),
        Frame::event(
            "participantLeft",
            ParticipantLeft {
                participant_id: user_id.clone(),
            },
        ),
        Some(socket_id),
    );

    let resource = format!("room:{}", room.id());
    let announced = state
        .locks
        .with_lock(&resource, || async {
            for (kind, producer) in &producers {
                state.gateway.broadcast_to_room(
                    room.id(),
                    Frame::event(
                        "producerClosed",
                        ProducerClosed {
                            producer_id: producer.id().to_string(),
                            kind: Some(*kind),
                            user_id: Some(user_id.clone()),
                        },
                    ),
                    Some(socket_id),
                );
            }
        })
        .await;
    if let Err(e) = announced {
        tracing::warn!(room_id = %room.id(), error = %e, "Producer-closed fan-out failed");
    }

    state
        .workers
        .inc_transports(room.worker_pid(), -(peer.transport_count() as i32));

    room.remove_peer(socket_id);
    peer.cleanup();
    state.rooms.unbind_socket(socket_id);
    state.gateway.leave_room(room.id(), socket_id);
    tracing::info!(room_id = %room.id(), participant_id = %user_id, "Participant left room");

    if destroy_if_empty && room.peer_count() == 0 {
        state.transcripts.clear_room(room.id()).await;
        state.workers.inc_routers(room.worker_pid(), -1);
        state.rooms.remove(room.id());
        tracing::info!(room_id = %room.id(), "Room destroyed, last participant left");
    }
}
