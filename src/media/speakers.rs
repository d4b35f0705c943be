use std::collections::HashMap;

use futures_util::future::join_all;

use crate::gateway::SocketId;
use crate::media::peer::{Peer, PeerAudioView, VideoHandle};
use crate::media::room::Room;
use crate::services::locks::LockError;
use crate::state::AppState;
use crate::types::events::{AssociatedUser, Frame, NewProducersToConsume};
use crate::types::streams::StreamKind;

/// What one peer must do to converge on the current speaker ranking.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AudioPlan {
    pub pause_owned: Vec<String>,
    pub resume_owned: Vec<String>,
    pub pause_consumed: Vec<String>,
    pub resume_consumed: Vec<String>,
    /// Audio pids whose paired video is paused and should resume. Video is
    /// never paused by this engine, only resumed.
    pub resume_video: Vec<String>,
    /// Active pids this peer neither owns nor consumes yet.
    pub need_transport: Vec<String>,
}

/// Decide pause/resume work for one peer from a snapshot. Pure: the applier
/// touches the SFU handles afterwards.
pub fn plan_for_peer(view: &PeerAudioView, speakers: &[String], max: usize) -> AudioPlan {
    let mut plan = AudioPlan::default();
    let (active, muted) = speakers.split_at(max.min(speakers.len()));

    for pid in muted {
        if let Some(owned) = view.owned_audio.get(pid) {
            if owned.open && !owned.paused {
                plan.pause_owned.push(pid.clone());
            }
        } else if let Some(consumed) = view.consumed_audio.get(pid) {
            if consumed.open && !consumed.paused {
                plan.pause_consumed.push(pid.clone());
            }
        }
    }

    for pid in active {
        if let Some(owned) = view.owned_audio.get(pid) {
            if owned.open && owned.paused {
                plan.resume_owned.push(pid.clone());
            }
        } else if let Some(consumed) = view.consumed_audio.get(pid) {
            if consumed.open && consumed.paused {
                plan.resume_consumed.push(pid.clone());
            }
        } else {
            plan.need_transport.push(pid.clone());
        }

        if let Some(video) = view.video_for_audio.get(pid) {
            if video.open && video.paused {
                plan.resume_video.push(pid.clone());
            }
        }
    }

    plan
}

async fn apply_plan(peer: &Peer, plan: &AudioPlan) {
    for pid in &plan.pause_owned {
        if let Some((_, producer)) = peer.producer_by_id(pid) {
            if !producer.closed() {
                if let Err(e) = producer.pause().await {
                    tracing::warn!(%pid, error = %e, "Could not pause owned producer");
                }
            }
        }
    }
    for pid in &plan.resume_owned {
        if let Some((_, producer)) = peer.producer_by_id(pid) {
            if !producer.closed() {
                if let Err(e) = producer.resume().await {
                    tracing::warn!(%pid, error = %e, "Could not resume owned producer");
                }
            }
        }
    }
    for pid in &plan.pause_consumed {
        if let Some(consumer) = peer.consumer_for_producer(pid) {
            if !consumer.closed() {
                if let Err(e) = consumer.pause().await {
                    tracing::warn!(%pid, error = %e, "Could not pause audio consumer");
                }
            }
        }
    }
    for pid in &plan.resume_consumed {
        if let Some(consumer) = peer.consumer_for_producer(pid) {
            if !consumer.closed() {
                if let Err(e) = consumer.resume().await {
                    tracing::warn!(%pid, error = %e, "Could not resume audio consumer");
                }
            }
        }
    }

    // Video resumes are fire-and-forget; a failure here must not hold up the
    // audio reconciliation.
    for pid in &plan.resume_video {
        if let Some(handle) = peer.video_handle_for_audio(pid) {
            let pid = pid.clone();
            tokio::spawn(async move {
                let result = match &handle {
                    VideoHandle::Producer(p) if !p.closed() => p.resume().await.err(),
                    VideoHandle::Consumer(c) if !c.closed() => c.resume().await.err(),
                    _ => None,
                };
                if let Some(e) = result {
                    tracing::warn!(audio_pid = %pid, error = %e, "Video resume failed");
                }
            });
        }
    }
}

/// Run the engine over every peer in parallel. Returns, per socket, the
/// active pids that peer still needs a transport for. Callers must hold the
/// room lock.
pub async fn run_engine(state: &AppState, room: &Room) -> HashMap<SocketId, Vec<String>> {
    let speakers = room.active_speakers();
    let max = state.config.media.max_active_speakers;

    let work = room.peers().into_iter().map(|peer| {
        let speakers = speakers.clone();
        async move {
            let view = peer.audio_view();
            let plan = plan_for_peer(&view, &speakers, max);
            apply_plan(&peer, &plan).await;
            (peer.socket_id().clone(), plan.need_transport)
        }
    });

    join_all(work)
        .await
        .into_iter()
        .filter(|(_, need)| !need.is_empty())
        .collect()
}

struct OwnerInfo {
    user: AssociatedUser,
    video_pid: Option<String>,
}

fn owner_info(room: &Room, pid: &str) -> Option<OwnerInfo> {
    let (peer, kind, _) = room.find_producer(pid)?;
    let screen = kind == StreamKind::ScreenAudio;
    let video_kind = if screen { StreamKind::ScreenVideo } else { StreamKind::Video };
    let video_pid = peer.producer(video_kind).map(|p| p.id().to_string());
    let user = if screen {
        AssociatedUser {
            id: format!("{}-screen", peer.user_id()),
            display_name: format!("{} (Sharing)", peer.display_name()),
        }
    } else {
        AssociatedUser {
            id: peer.user_id().to_string(),
            display_name: peer.display_name().to_string(),
        }
    };
    Some(OwnerInfo { user, video_pid })
}

/// Assemble the per-socket subscription payload. The three arrays stay
/// index-parallel; pids whose owner vanished mid-flight are dropped.
pub fn build_new_producers_payload(
    state: &AppState,
    room: &Room,
    pids: &[String],
) -> NewProducersToConsume {
    let max = state.config.media.max_active_speakers;
    let mut payload = NewProducersToConsume {
        router_rtp_capabilities: room.router_rtp_capabilities(),
        audio_pids_to_create: Vec::with_capacity(pids.len()),
        video_pids_to_create: Vec::with_capacity(pids.len()),
        associated_users: Vec::with_capacity(pids.len()),
        active_speaker_list: room.truncated_speakers(max),
    };
    for pid in pids {
        if let Some(info) = owner_info(room, pid) {
            payload.audio_pids_to_create.push(pid.clone());
            payload.video_pids_to_create.push(info.video_pid);
            payload.associated_users.push(info.user);
        }
    }
    payload
}

/// The view a freshly joined peer starts from: every currently ranked
/// speaker is a stream it needs.
pub fn initial_view(state: &AppState, room: &Room) -> NewProducersToConsume {
    let max = state.config.media.max_active_speakers;
    let truncated = room.truncated_speakers(max);
    build_new_producers_payload(state, room, &truncated)
}

fn broadcast_speaker_list(state: &AppState, room: &Room) {
    let truncated = room.truncated_speakers(state.config.media.max_active_speakers);
    state
        .gateway
        .broadcast_to_room(room.id(), Frame::event("updateActiveSpeakers", truncated), None);
}

/// Reconcile subscriptions and emit the resulting deltas. Assumes the room
/// lock is held.
pub async fn reconcile_and_emit(state: &AppState, room: &Room) {
    let deltas = run_engine(state, room).await;
    for (socket_id, pids) in &deltas {
        let payload = build_new_producers_payload(state, room, pids);
        if !payload.audio_pids_to_create.is_empty() {
            state
                .gateway
                .send_to_socket(socket_id, Frame::event("newProducersToConsume", payload));
        }
    }
    broadcast_speaker_list(state, room);
}

/// Periodic re-run for one room, serialized under its lock.
pub async fn refresh_room(state: &AppState, room: &Room) {
    let resource = format!("room:{}", room.id());
    let result = state
        .locks
        .with_lock(&resource, || reconcile_and_emit(state, room))
        .await;
    match result {
        Ok(()) => {}
        Err(LockError::Busy | LockError::Timeout) => {
            tracing::debug!(room_id = %room.id(), "Skipped refresh, room lock contended");
        }
        Err(e) => {
            tracing::warn!(room_id = %room.id(), error = %e, "Speaker refresh failed");
        }
    }
}

/// Dominant-speaker event: promote to the head of the ranking and
/// re-reconcile. An already-dominant speaker is a no-op; when no peer needs
/// a new transport only the cheap list broadcast goes out.
pub async fn on_dominant_speaker(state: &AppState, room: &Room, producer_id: &str) {
    let resource = format!("room:{}", room.id());
    let result = state
        .locks
        .with_lock(&resource, || async {
            if !room.promote_speaker(producer_id) {
                return;
            }
            tracing::debug!(room_id = %room.id(), %producer_id, "Dominant speaker changed");

            let deltas = run_engine(state, room).await;
            if deltas.is_empty() {
                broadcast_speaker_list(state, room);
                return;
            }
            for (socket_id, pids) in &deltas {
                let payload = build_new_producers_payload(state, room, pids);
                if !payload.audio_pids_to_create.is_empty() {
                    state
                        .gateway
                        .send_to_socket(socket_id, Frame::event("newProducersToConsume", payload));
                }
            }
            broadcast_speaker_list(state, room);
        })
        .await;

    if let Err(e) = result {
        tracing::warn!(room_id = %room.id(), error = %e, "Dominant-speaker handling failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::peer::HandleState;

    fn open_unpaused() -> HandleState {
        HandleState { open: true, paused: false }
    }

    fn open_paused() -> HandleState {
        HandleState { open: true, paused: true }
    }

    fn closed() -> HandleState {
        HandleState { open: false, paused: false }
    }

    fn speakers(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pauses_consumers_outside_the_active_window() {
        let mut view = PeerAudioView::default();
        view.consumed_audio.insert("p1".into(), open_unpaused());
        view.consumed_audio.insert("p2".into(), open_unpaused());

        let plan = plan_for_peer(&view, &speakers(&["p2", "p1"]), 1);
        assert_eq!(plan.pause_consumed, vec!["p1".to_string()]);
        assert!(plan.resume_consumed.is_empty());
        assert!(plan.need_transport.is_empty());
    }

    #[test]
    fn resumes_paused_consumers_inside_the_window() {
        let mut view = PeerAudioView::default();
        view.consumed_audio.insert("p1".into(), open_paused());

        let plan = plan_for_peer(&view, &speakers(&["p1"]), 10);
        assert_eq!(plan.resume_consumed, vec!["p1".to_string()]);
        assert!(plan.pause_consumed.is_empty());
    }

    #[test]
    fn records_missing_transports_for_unknown_active_pids() {
        let view = PeerAudioView {
            socket_id: "s1".into(),
            ..PeerAudioView::default()
        };
        let plan = plan_for_peer(&view, &speakers(&["p1", "p2"]), 10);
        assert_eq!(plan.need_transport, speakers(&["p1", "p2"]));
    }

    #[test]
    fn owned_producers_are_never_reported_as_missing() {
        let mut view = PeerAudioView::default();
        view.owned_audio.insert("mine".into(), open_unpaused());

        let plan = plan_for_peer(&view, &speakers(&["mine", "other"]), 10);
        assert_eq!(plan.need_transport, vec!["other".to_string()]);
        assert!(plan.resume_owned.is_empty());
    }

    #[test]
    fn video_is_only_resumed_never_paused() {
        let mut view = PeerAudioView::default();
        view.consumed_audio.insert("p1".into(), open_unpaused());
        view.consumed_audio.insert("p2".into(), open_unpaused());
        view.video_for_audio.insert("p1".into(), open_paused());
        view.video_for_audio.insert("p2".into(), open_paused());

        // p2 falls outside the window: its audio pauses, its video is left
        // alone. p1 is active: its paused video resumes.
        let plan = plan_for_peer(&view, &speakers(&["p1", "p2"]), 1);
        assert_eq!(plan.resume_video, vec!["p1".to_string()]);
        assert_eq!(plan.pause_consumed, vec!["p2".to_string()]);
    }

    #[test]
    fn closed_handles_are_left_alone() {
        let mut view = PeerAudioView::default();
        view.owned_audio.insert("dead".into(), closed());
        view.consumed_audio.insert("gone".into(), closed());

        let plan = plan_for_peer(&view, &speakers(&["dead", "gone", "extra"]), 1);
        assert!(plan.pause_owned.is_empty());
        assert!(plan.pause_consumed.is_empty());
        // "dead" is owned (even though closed) and "gone" is consumed, so
        // neither is reported missing; only truly unknown pids would be, and
        // "extra" is outside the window here.
        assert!(plan.need_transport.is_empty());
    }

    #[test]
    fn exactly_max_speakers_stay_active() {
        let mut view = PeerAudioView::default();
        for i in 0..15 {
            view.consumed_audio.insert(format!("p{i}"), open_unpaused());
        }
        let list: Vec<String> = (0..15).map(|i| format!("p{i}")).collect();

        let plan = plan_for_peer(&view, &list, 10);
        assert_eq!(plan.pause_consumed.len(), 5);
        for pid in &plan.pause_consumed {
            let index: usize = pid[1..].parse().unwrap();
            assert!(index >= 10, "{pid} is inside the active window");
        }
    }
}
