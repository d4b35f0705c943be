use std::collections::HashMap;
use std::num::NonZero;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mediasoup::active_speaker_observer::{ActiveSpeakerObserver, ActiveSpeakerObserverOptions};
use mediasoup::prelude::*;
use mediasoup::router::{Router, RouterOptions};
use mediasoup::rtp_observer::{RtpObserver, RtpObserverAddProducerOptions};
use mediasoup::worker::Worker;
use tokio::time::interval;

use crate::error::{GatewayError, MediaError};
use crate::gateway::SocketId;
use crate::media::peer::Peer;
use crate::media::speakers;
use crate::state::AppState;
use crate::types::streams::StreamKind;

#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PendingJoin {
    pub user_id: String,
    pub requested_at: DateTime<Utc>,
}

const PENDING_JOIN_TTL_SECS: i64 = 60;

#[derive(Default)]
struct RoomState {
    peers: Vec<Peer>,
    /// Ranked audio/screen-audio producer ids, most-recently-dominant first.
    active_speakers: Vec<String>,
    blocklist: Vec<BlockEntry>,
    pending_joins: HashMap<String, PendingJoin>,
}

struct Shared {
    id: String,
    owner_id: String,
    password: Option<String>,
    worker_pid: u32,
    // Observer before router so teardown closes it first.
    observer: ActiveSpeakerObserver,
    router: Router,
    state: Mutex<RoomState>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        tracing::debug!(room_id = %self.id, "Room dropped");
    }
}

/// Per-room media state: one router on one worker, the peers using it, and
/// the ranked active-speaker list the subscription engine consumes.
#[derive(Clone)]
pub struct Room {
    shared: Arc<Shared>,
}

#[derive(Clone)]
pub struct WeakRoom {
    shared: Weak<Shared>,
}

impl WeakRoom {
    pub fn upgrade(&self) -> Option<Room> {
        self.shared.upgrade().map(|shared| Room { shared })
    }
}

impl Room {
    async fn create(
        room_id: &str,
        owner_id: &str,
        password: Option<String>,
        worker: Worker,
        observer_interval_ms: u16,
    ) -> Result<Self, MediaError> {
        let router = worker
            .create_router(RouterOptions::new(media_codecs()))
            .await
            .map_err(|e| MediaError::Sfu(format!("create_router: {e}")))?;

        let mut observer_options = ActiveSpeakerObserverOptions::default();
        observer_options.interval = observer_interval_ms;
        let observer = router
            .create_active_speaker_observer(observer_options)
            .await
            .map_err(|e| MediaError::Sfu(format!("create_active_speaker_observer: {e}")))?;

        Ok(Self {
            shared: Arc::new(Shared {
                id: room_id.to_string(),
                owner_id: owner_id.to_string(),
                password,
                worker_pid: worker.pid(),
                observer,
                router,
                state: Mutex::new(RoomState::default()),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn owner_id(&self) -> &str {
        &self.shared.owner_id
    }

    pub fn worker_pid(&self) -> u32 {
        self.shared.worker_pid
    }

    pub fn router(&self) -> &Router {
        &self.shared.router
    }

    pub fn router_rtp_capabilities(&self) -> serde_json::Value {
        serde_json::to_value(self.shared.router.rtp_capabilities()).unwrap_or_default()
    }

    pub fn downgrade(&self) -> WeakRoom {
        WeakRoom {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn check_password(&self, supplied: Option<&str>) -> bool {
        match &self.shared.password {
            None => true,
            Some(expected) => supplied == Some(expected.as_str()),
        }
    }

    /// Register an audio producer with the dominant-speaker observer.
    pub async fn observe_producer(&self, producer_id: ProducerId) {
        if let Err(e) = self
            .shared
            .observer
            .add_producer(RtpObserverAddProducerOptions::new(producer_id))
            .await
        {
            tracing::warn!(room_id = %self.shared.id, %producer_id, error = %e,
                "Could not register producer with active-speaker observer");
        }
    }

    // ── Peers ─────────────────────────────────────────────

    pub fn add_peer(&self, peer: Peer) {
        self.shared.state.lock().unwrap().peers.push(peer);
    }

    pub fn remove_peer(&self, socket_id: &SocketId) -> Option<Peer> {
        let mut state = self.shared.state.lock().unwrap();
        let at = state.peers.iter().position(|p| p.socket_id() == socket_id)?;
        Some(state.peers.remove(at))
    }

    pub fn peer_by_socket(&self, socket_id: &SocketId) -> Option<Peer> {
        self.shared
            .state
            .lock()
            .unwrap()
            .peers
            .iter()
            .find(|p| p.socket_id() == socket_id)
            .cloned()
    }

    pub fn peer_by_user(&self, user_id: &str) -> Option<Peer> {
        self.shared
            .state
            .lock()
            .unwrap()
            .peers
            .iter()
            .find(|p| p.user_id() == user_id)
            .cloned()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.shared.state.lock().unwrap().peers.clone()
    }

    pub fn peer_count(&self) -> usize {
        self.shared.state.lock().unwrap().peers.len()
    }

    /// Locate the peer owning a producer, with its kind and handle.
    pub fn find_producer(&self, pid: &str) -> Option<(Peer, StreamKind, Producer)> {
        let peers = self.peers();
        for peer in peers {
            if let Some((kind, producer)) = peer.producer_by_id(pid) {
                return Some((peer, kind, producer));
            }
        }
        None
    }

    // ── Active-speaker list ───────────────────────────────

    pub fn active_speakers(&self) -> Vec<String> {
        self.shared.state.lock().unwrap().active_speakers.clone()
    }

    pub fn truncated_speakers(&self, max: usize) -> Vec<String> {
        let state = self.shared.state.lock().unwrap();
        state.active_speakers.iter().take(max).cloned().collect()
    }

    /// Append a newly created audio producer; the observer re-ranks it later.
    pub fn append_speaker(&self, pid: &str) {
        let mut state = self.shared.state.lock().unwrap();
        ranking_append(&mut state.active_speakers, pid);
    }

    /// Move (or insert) a speaker to the head. Returns false when it was
    /// already dominant, so callers can skip the churn.
    pub fn promote_speaker(&self, pid: &str) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        ranking_promote(&mut state.active_speakers, pid)
    }

    pub fn remove_speaker(&self, pid: &str) {
        let mut state = self.shared.state.lock().unwrap();
        state.active_speakers.retain(|p| p != pid);
    }

    // ── Blocklist / pending joins ─────────────────────────

    pub fn is_blocked(&self, user_id: &str) -> bool {
        let state = self.shared.state.lock().unwrap();
        blocked_at(&state.blocklist, user_id, Utc::now())
    }

    pub fn block(&self, user_id: &str, until: DateTime<Utc>) {
        let mut state = self.shared.state.lock().unwrap();
        state.blocklist.retain(|entry| entry.user_id != user_id);
        state.blocklist.push(BlockEntry {
            user_id: user_id.to_string(),
            expires_at: until,
        });
    }

    pub fn add_pending_join(&self, user_id: &str) {
        let mut state = self.shared.state.lock().unwrap();
        state.pending_joins.insert(
            user_id.to_string(),
            PendingJoin {
                user_id: user_id.to_string(),
                requested_at: Utc::now(),
            },
        );
    }

    /// Drop join requests older than their 60 s window.
    pub fn sweep_pending_joins(&self) {
        let cutoff = Utc::now() - chrono::Duration::seconds(PENDING_JOIN_TTL_SECS);
        let mut state = self.shared.state.lock().unwrap();
        state.pending_joins.retain(|_, p| p.requested_at > cutoff);
    }

    pub fn pending_join(&self, user_id: &str) -> Option<PendingJoin> {
        self.shared.state.lock().unwrap().pending_joins.get(user_id).cloned()
    }
}

/// All live rooms plus their periodic refresh tasks and the socket→room
/// binding the streaming gateway dispatches through.
pub struct RoomRegistry {
    rooms: DashMap<String, Room>,
    refresh_tasks: DashMap<String, tokio::task::JoinHandle<()>>,
    socket_rooms: DashMap<SocketId, String>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            refresh_tasks: DashMap::new(),
            socket_rooms: DashMap::new(),
        }
    }

    pub fn bind_socket(&self, socket_id: &SocketId, room_id: &str) {
        self.socket_rooms.insert(socket_id.clone(), room_id.to_string());
    }

    pub fn unbind_socket(&self, socket_id: &SocketId) {
        self.socket_rooms.remove(socket_id);
    }

    pub fn room_for_socket(&self, socket_id: &SocketId) -> Option<String> {
        self.socket_rooms.get(socket_id).map(|r| r.clone())
    }

    pub fn get(&self, room_id: &str) -> Option<Room> {
        self.rooms.get(room_id).map(|r| r.clone())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Room by id, creating it (router, observer, refresh timer) on first
    /// use. Returns whether this call created it.
    pub async fn get_or_create(
        &self,
        state: &AppState,
        room_id: &str,
        owner_id: &str,
        password: Option<String>,
    ) -> Result<(Room, bool), GatewayError> {
        if let Some(room) = self.get(room_id) {
            return Ok((room, false));
        }

        let worker = state.workers.pick_for_room(room_id).await?;
        let worker_pid = worker.pid();
        let room = Room::create(
            room_id,
            owner_id,
            password,
            worker,
            state.config.media.observer_interval_ms,
        )
        .await
        .map_err(GatewayError::Media)?;
        state.workers.inc_routers(worker_pid, 1);

        // A concurrent join may have won the race; prefer the existing room
        // and let ours drop.
        match self.rooms.entry(room_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                state.workers.inc_routers(worker_pid, -1);
                return Ok((existing.get().clone(), false));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(room.clone());
            }
        }

        self.install_dominant_speaker_handler(state, &room);
        self.spawn_refresh_task(state, &room);
        tracing::info!(room_id, owner_id, worker_pid, "Room created");

        Ok((room, true))
    }

    fn install_dominant_speaker_handler(&self, state: &AppState, room: &Room) {
        let app = state.clone();
        let weak = room.downgrade();
        room.shared
            .observer
            .on_dominant_speaker(move |dominant| {
                let producer_id = dominant.producer.id().to_string();
                let app = app.clone();
                let weak = weak.clone();
                tokio::spawn(async move {
                    if let Some(room) = weak.upgrade() {
                        speakers::on_dominant_speaker(&app, &room, &producer_id).await;
                    }
                });
            })
            .detach();
    }

    fn spawn_refresh_task(&self, state: &AppState, room: &Room) {
        let app = state.clone();
        let weak = room.downgrade();
        let period = Duration::from_secs(state.config.media.refresh_interval_secs);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(room) = weak.upgrade() else { return };
                room.sweep_pending_joins();
                if room.peer_count() > 0 && !room.active_speakers().is_empty() {
                    speakers::refresh_room(&app, &room).await;
                }
            }
        });
        self.refresh_tasks.insert(room.id().to_string(), handle);
    }

    /// Remove a room; dropping the last handle closes the observer, then the
    /// router, cascading into its transports, producers and consumers.
    pub fn remove(&self, room_id: &str) -> Option<Room> {
        if let Some((_, task)) = self.refresh_tasks.remove(room_id) {
            task.abort();
        }
        self.rooms.remove(room_id).map(|(_, room)| room)
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn ranking_append(list: &mut Vec<String>, pid: &str) {
    if !list.iter().any(|p| p == pid) {
        list.push(pid.to_string());
    }
}

fn ranking_promote(list: &mut Vec<String>, pid: &str) -> bool {
    if list.first().map(String::as_str) == Some(pid) {
        return false;
    }
    list.retain(|p| p != pid);
    list.insert(0, pid.to_string());
    true
}

fn blocked_at(blocklist: &[BlockEntry], user_id: &str, now: DateTime<Utc>) -> bool {
    blocklist
        .iter()
        .any(|entry| entry.user_id == user_id && entry.expires_at > now)
}

/// Opus plus VP8/H264, the capability set every room router announces.
fn media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: Some(111),
            clock_rate: NonZero::new(48000).unwrap(),
            channels: NonZero::new(2).unwrap(),
            parameters: RtpCodecParametersParameters::from([("useinbandfec", 1_u32.into())]),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp8,
            preferred_payload_type: Some(96),
            clock_rate: NonZero::new(90000).unwrap(),
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::CcmFir,
                RtcpFeedback::GoogRemb,
                RtcpFeedback::TransportCc,
            ],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::H264,
            preferred_payload_type: Some(125),
            clock_rate: NonZero::new(90000).unwrap(),
            parameters: RtpCodecParametersParameters::from([
                ("level-asymmetry-allowed", 1_u32.into()),
                ("packetization-mode", 1_u32.into()),
                ("profile-level-id", "42e01f".into()),
            ]),
            rtcp_feedback: vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::CcmFir,
                RtcpFeedback::GoogRemb,
                RtcpFeedback::TransportCc,
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn promote_moves_speaker_to_head() {
        let mut speakers = list(&["PA", "PB"]);
        assert!(ranking_promote(&mut speakers, "PB"));
        assert_eq!(speakers, list(&["PB", "PA"]));
    }

    #[test]
    fn promote_of_current_dominant_is_a_no_op() {
        let mut speakers = list(&["PA", "PB"]);
        assert!(!ranking_promote(&mut speakers, "PA"));
        assert_eq!(speakers, list(&["PA", "PB"]));
    }

    #[test]
    fn promote_inserts_unknown_speaker_at_head() {
        let mut speakers = list(&["PA"]);
        assert!(ranking_promote(&mut speakers, "PC"));
        assert_eq!(speakers, list(&["PC", "PA"]));
    }

    #[test]
    fn append_is_idempotent_and_keeps_rank() {
        let mut speakers = list(&["PA"]);
        ranking_append(&mut speakers, "PB");
        ranking_append(&mut speakers, "PB");
        ranking_append(&mut speakers, "PA");
        assert_eq!(speakers, list(&["PA", "PB"]));
    }

    #[test]
    fn block_entries_expire() {
        let now = Utc::now();
        let blocklist = vec![
            BlockEntry {
                user_id: "banned".into(),
                expires_at: now + chrono::Duration::seconds(30),
            },
            BlockEntry {
                user_id: "served".into(),
                expires_at: now - chrono::Duration::seconds(1),
            },
        ];
        assert!(blocked_at(&blocklist, "banned", now));
        assert!(!blocked_at(&blocklist, "served", now));
        assert!(!blocked_at(&blocklist, "stranger", now));
    }
}
