use mediasoup::consumer::ConsumerOptions;
use mediasoup::data_structures::{DtlsState, ListenInfo, Protocol};
use mediasoup::prelude::*;
use mediasoup::producer::ProducerOptions;
use mediasoup::webrtc_transport::{
    WebRtcTransport, WebRtcTransportListenInfos, WebRtcTransportOptions,
    WebRtcTransportRemoteParameters,
};
use serde_json::{Value, json};

use crate::error::{GatewayError, MediaError};
use crate::media::peer::{DownstreamTransport, Peer};
use crate::media::room::Room;
use crate::state::AppState;
use crate::types::events::{
    AudioChangePayload, AudioOp, ConnectTransportPayload, ConsumeMediaPayload,
    RequestTransportPayload, StartProducingPayload, TransportRole, UnpauseConsumerPayload,
};
use crate::types::streams::StreamKind;

/// Connection details a client needs to bring a transport up.
fn transport_params(transport: &WebRtcTransport) -> Value {
    json!({
        "id": transport.id().to_string(),
        "iceParameters": serde_json::to_value(transport.ice_parameters()).unwrap_or_default(),
        "iceCandidates": serde_json::to_value(transport.ice_candidates()).unwrap_or_default(),
        "dtlsParameters": serde_json::to_value(transport.dtls_parameters()).unwrap_or_default(),
    })
}

fn room_of(state: &AppState, peer: &Peer) -> Result<Room, GatewayError> {
    state
        .rooms
        .get(peer.room_id())
        .ok_or(GatewayError::NotInRoom)
}

async fn create_webrtc_transport(
    state: &AppState,
    room: &Room,
) -> Result<WebRtcTransport, GatewayError> {
    let media = &state.config.media;
    let listen_ip = media
        .public_ip
        .parse()
        .unwrap_or_else(|_| "0.0.0.0".parse().unwrap());
    let announced = media.announced_ip.clone().or_else(|| {
        (media.public_ip != "0.0.0.0").then(|| media.public_ip.clone())
    });

    let udp_info = ListenInfo {
        protocol: Protocol::Udp,
        ip: listen_ip,
        announced_address: announced.clone(),
        port: None,
        port_range: Some(media.rtc_min_port..=media.rtc_max_port),
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
    };
    let tcp_info = ListenInfo {
        protocol: Protocol::Tcp,
        ip: listen_ip,
        announced_address: announced,
        port: None,
        port_range: Some(media.rtc_min_port..=media.rtc_max_port),
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
    };

    let listen_infos = WebRtcTransportListenInfos::new(udp_info).insert(tcp_info);
    let mut options = WebRtcTransportOptions::new(listen_infos);
    options.enable_udp = true;
    options.enable_tcp = true;
    options.prefer_udp = true;
    options.initial_available_outgoing_bitrate = media.initial_available_outgoing_bitrate;

    let transport = room
        .router()
        .create_webrtc_transport(options)
        .await
        .map_err(|e| MediaError::Sfu(format!("create_webrtc_transport: {e}")))?;

    if let Err(e) = transport
        .set_max_incoming_bitrate(media.max_incoming_bitrate)
        .await
    {
        tracing::warn!(transport_id = %transport.id(), error = %e,
            "Could not set max incoming bitrate");
    }

    state.workers.inc_transports(room.worker_pid(), 1);
    Ok(transport)
}

/// Create (or return the existing) transport for the requested role.
/// Producer requests reuse a live upstream; consumer requests reuse the
/// downstream already bound to the requested audio pid.
pub async fn handle_transport_request(
    state: &AppState,
    peer: &Peer,
    req: RequestTransportPayload,
) -> Result<Value, GatewayError> {
    let room = room_of(state, peer)?;

    match req.role {
        TransportRole::Producer => {
            if let Some(upstream) = peer.upstream() {
                if !upstream.closed() {
                    return Ok(transport_params(&upstream));
                }
            }
            let transport = create_webrtc_transport(state, &room).await?;
            peer.set_upstream(transport.clone());
            Ok(transport_params(&transport))
        }
        TransportRole::Consumer => {
            let audio_pid = req.audio_pid.clone().ok_or_else(|| {
                GatewayError::InvalidPayload("audioPid is required for consumer transports".into())
            })?;

            if let Some(existing) = peer.downstream_for_audio(&audio_pid) {
                return Ok(transport_params(&existing));
            }

            let video_pid = resolve_associated_video(&room, &audio_pid);
            let transport = create_webrtc_transport(state, &room).await?;
            let mut downstream =
                DownstreamTransport::new(transport.clone(), Some(audio_pid), video_pid);
            if let (Some(kind), Some(pid)) = (req.stream_kind, req.associated_producer_id) {
                downstream.labels.insert(kind, pid);
            }
            peer.add_downstream(downstream);
            Ok(transport_params(&transport))
        }
    }
}

/// The video producer paired with an audio producer: screen-video for
/// screen-audio, camera video otherwise.
pub fn resolve_associated_video(room: &Room, audio_pid: &str) -> Option<String> {
    for peer in room.peers() {
        let audio = peer.producer(StreamKind::Audio);
        let screen_audio = peer.producer(StreamKind::ScreenAudio);

        if audio.as_ref().map(|p| p.id().to_string()).as_deref() == Some(audio_pid) {
            return peer.producer(StreamKind::Video).map(|p| p.id().to_string());
        }
        if screen_audio.as_ref().map(|p| p.id().to_string()).as_deref() == Some(audio_pid) {
            return peer
                .producer(StreamKind::ScreenVideo)
                .map(|p| p.id().to_string());
        }
    }
    None
}

/// DTLS connect, idempotent: a transport already `connected` or `connecting`
/// acks success without re-issuing.
pub async fn connect_transport(
    state: &AppState,
    peer: &Peer,
    req: ConnectTransportPayload,
) -> Result<Value, GatewayError> {
    let _room = room_of(state, peer)?;

    let transport = match req.role {
        TransportRole::Producer => peer.upstream().ok_or(GatewayError::NoUpstream)?,
        TransportRole::Consumer => {
            let audio_pid = req.audio_pid.clone().ok_or_else(|| {
                GatewayError::InvalidPayload("audioPid is required for consumer connect".into())
            })?;
            peer.downstream_for_audio(&audio_pid)
                .ok_or(GatewayError::DownstreamNotFound)?
        }
    };

    match transport.dtls_state() {
        DtlsState::Connected | DtlsState::Connecting => Ok(json!({"success": true})),
        _ => {
            transport
                .connect(WebRtcTransportRemoteParameters {
                    dtls_parameters: req.dtls_parameters,
                })
                .await
                .map_err(|e| MediaError::Sfu(format!("transport connect: {e}")))?;
            Ok(json!({"success": true}))
        }
    }
}

/// Produce on the upstream transport. Audio-kind producers join the room's
/// active-speaker list and its dominant-speaker observer.
pub async fn start_producing(
    state: &AppState,
    peer: &Peer,
    req: StartProducingPayload,
) -> Result<Producer, GatewayError> {
    let room = room_of(state, peer)?;
    let upstream = peer.upstream().ok_or(GatewayError::NoUpstream)?;

    let options = ProducerOptions::new(req.stream_kind.media_kind(), req.rtp_parameters);
    let producer = upstream
        .produce(options)
        .await
        .map_err(|e| MediaError::Sfu(format!("produce: {e}")))?;

    peer.add_producer(req.stream_kind, producer.clone());

    if req.stream_kind.is_audio() {
        room.append_speaker(&producer.id().to_string());
        room.observe_producer(producer.id()).await;
    }

    tracing::debug!(
        room_id = %room.id(),
        participant_id = %peer.user_id(),
        producer_id = %producer.id(),
        kind = %req.stream_kind,
        "Producer created"
    );
    Ok(producer)
}

/// Consume a producer on the downstream transport bound to it. The actual
/// stream kind comes from the producer registry, not the client's claim, and
/// the consumer starts unpaused for lowest latency.
pub async fn consume_media(
    state: &AppState,
    peer: &Peer,
    req: ConsumeMediaPayload,
) -> Result<Value, GatewayError> {
    let room = room_of(state, peer)?;

    let Some((_owner, actual_kind, producer)) = room.find_producer(&req.pid) else {
        return Err(GatewayError::CannotConsume);
    };

    if !room.router().can_consume(&producer.id(), &req.rtp_capabilities) {
        return Err(GatewayError::CannotConsume);
    }

    let transport = peer
        .downstream_for_pid(&req.pid, actual_kind.is_audio())
        .ok_or(GatewayError::DownstreamNotFound)?;

    let options = ConsumerOptions::new(producer.id(), req.rtp_capabilities);
    let consumer = transport
        .consume(options)
        .await
        .map_err(|e| MediaError::Sfu(format!("consume: {e}")))?;

    let rtp_parameters = serde_json::to_value(consumer.rtp_parameters()).unwrap_or_default();
    peer.attach_consumer(&transport.id().to_string(), actual_kind, consumer.clone());

    Ok(json!({
        "id": consumer.id().to_string(),
        "producerId": req.pid,
        "kind": actual_kind,
        "rtpParameters": rtp_parameters,
    }))
}

pub async fn unpause_consumer(
    state: &AppState,
    peer: &Peer,
    req: UnpauseConsumerPayload,
) -> Result<Value, GatewayError> {
    let _room = room_of(state, peer)?;
    let consumer = peer
        .consumer_for_producer(&req.pid)
        .ok_or(GatewayError::ConsumerNotFound)?;
    if !consumer.closed() {
        consumer
            .resume()
            .await
            .map_err(|e| MediaError::Sfu(format!("consumer resume: {e}")))?;
    }
    Ok(json!({"success": true}))
}

/// Mute or unmute the peer's own microphone producer.
pub async fn handle_audio_change(
    state: &AppState,
    peer: &Peer,
    req: AudioChangePayload,
) -> Result<Value, GatewayError> {
    let _room = room_of(state, peer)?;
    let Some(producer) = peer.producer(StreamKind::Audio) else {
        return Ok(json!({"success": true}));
    };
    if producer.closed() {
        return Ok(json!({"success": true}));
    }
    let result = match req.op {
        AudioOp::Mute => producer.pause().await,
        AudioOp::Unmute => producer.resume().await,
    };
    result.map_err(|e| MediaError::Sfu(format!("audio change: {e}")))?;
    Ok(json!({"success": true}))
}
