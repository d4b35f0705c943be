use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mediasoup::consumer::Consumer;
use mediasoup::producer::Producer;
use mediasoup::transport::Transport;
use mediasoup::webrtc_transport::WebRtcTransport;

use crate::gateway::SocketId;
use crate::types::streams::StreamKind;

/// One consumed remote audio stream plus its associated video, delivered to
/// this peer over a dedicated transport. Consumers are keyed by the closed
/// set of stream kinds.
pub struct DownstreamTransport {
    pub transport: WebRtcTransport,
    pub associated_audio_pid: Option<String>,
    pub associated_video_pid: Option<String>,
    /// Producer ids promised per stream kind at request time, ahead of the
    /// consumers being created.
    pub labels: HashMap<StreamKind, String>,
    pub consumers: HashMap<StreamKind, Consumer>,
}

impl DownstreamTransport {
    pub fn new(
        transport: WebRtcTransport,
        associated_audio_pid: Option<String>,
        associated_video_pid: Option<String>,
    ) -> Self {
        Self {
            transport,
            associated_audio_pid,
            associated_video_pid,
            labels: HashMap::new(),
            consumers: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct PeerState {
    upstream: Option<WebRtcTransport>,
    downstreams: Vec<DownstreamTransport>,
    producers: HashMap<StreamKind, Producer>,
}

struct Shared {
    user_id: String,
    display_name: String,
    socket_id: SocketId,
    room_id: String,
    state: Mutex<PeerState>,
}

/// A connected user's media state within one room. Handles are cloned out
/// under the lock and awaited outside it.
#[derive(Clone)]
pub struct Peer {
    shared: Arc<Shared>,
}

/// Open/paused snapshot of one producer or consumer, fed to the
/// active-speaker planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleState {
    pub open: bool,
    pub paused: bool,
}

/// Everything the active-speaker planner needs to know about one peer.
#[derive(Debug, Clone, Default)]
pub struct PeerAudioView {
    pub socket_id: SocketId,
    /// Audio-kind producers this peer owns, by producer id.
    pub owned_audio: HashMap<String, HandleState>,
    /// Downstream audio-kind consumers, by consumed producer id.
    pub consumed_audio: HashMap<String, HandleState>,
    /// Video producers/consumers reachable for a given audio pid.
    pub video_for_audio: HashMap<String, HandleState>,
}

impl Peer {
    pub fn new(user_id: &str, display_name: &str, socket_id: &SocketId, room_id: &str) -> Self {
        Self {
            shared: Arc::new(Shared {
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
                socket_id: socket_id.clone(),
                room_id: room_id.to_string(),
                state: Mutex::new(PeerState::default()),
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    pub fn display_name(&self) -> &str {
        &self.shared.display_name
    }

    pub fn socket_id(&self) -> &SocketId {
        &self.shared.socket_id
    }

    pub fn room_id(&self) -> &str {
        &self.shared.room_id
    }

    // ── Transports ────────────────────────────────────────

    pub fn upstream(&self) -> Option<WebRtcTransport> {
        self.shared.state.lock().unwrap().upstream.clone()
    }

    pub fn set_upstream(&self, transport: WebRtcTransport) {
        self.shared.state.lock().unwrap().upstream = Some(transport);
    }

    pub fn add_downstream(&self, downstream: DownstreamTransport) {
        self.shared.state.lock().unwrap().downstreams.push(downstream);
    }

    /// Live downstream transport for a consumed audio pid, if any.
    pub fn downstream_for_audio(&self, audio_pid: &str) -> Option<WebRtcTransport> {
        let state = self.shared.state.lock().unwrap();
        state
            .downstreams
            .iter()
            .find(|d| {
                d.associated_audio_pid.as_deref() == Some(audio_pid) && !d.transport.closed()
            })
            .map(|d| d.transport.clone())
    }

    /// Downstream transport whose associated pid (audio or video, depending
    /// on the consumed kind) matches.
    pub fn downstream_for_pid(&self, pid: &str, audio_like: bool) -> Option<WebRtcTransport> {
        let state = self.shared.state.lock().unwrap();
        state
            .downstreams
            .iter()
            .find(|d| {
                let assoc = if audio_like {
                    d.associated_audio_pid.as_deref()
                } else {
                    d.associated_video_pid.as_deref()
                };
                assoc == Some(pid) && !d.transport.closed()
            })
            .map(|d| d.transport.clone())
    }

    /// Attach a consumer to the downstream transport it was created on.
    pub fn attach_consumer(&self, transport_id: &str, kind: StreamKind, consumer: Consumer) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(downstream) = state
            .downstreams
            .iter_mut()
            .find(|d| d.transport.id().to_string() == transport_id)
        {
            downstream.consumers.insert(kind, consumer);
        }
    }

    /// Find a downstream consumer by the producer id it consumes.
    pub fn consumer_for_producer(&self, pid: &str) -> Option<Consumer> {
        let state = self.shared.state.lock().unwrap();
        state
            .downstreams
            .iter()
            .flat_map(|d| d.consumers.values())
            .find(|c| c.producer_id().to_string() == pid)
            .cloned()
    }

    /// Null out stale downstream references to a departed peer's producers.
    pub fn clear_downstream_refs(&self, pids: &[String]) {
        let mut state = self.shared.state.lock().unwrap();
        for downstream in state.downstreams.iter_mut() {
            if let Some(audio) = downstream.associated_audio_pid.clone() {
                if pids.contains(&audio) {
                    downstream.associated_audio_pid = None;
                }
            }
            if let Some(video) = downstream.associated_video_pid.clone() {
                if pids.contains(&video) {
                    downstream.associated_video_pid = None;
                }
            }
        }
    }

    pub fn transport_count(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.downstreams.len() + usize::from(state.upstream.is_some())
    }

    // ── Producers ─────────────────────────────────────────

    pub fn add_producer(&self, kind: StreamKind, producer: Producer) {
        self.shared.state.lock().unwrap().producers.insert(kind, producer);
    }

    pub fn producer(&self, kind: StreamKind) -> Option<Producer> {
        self.shared.state.lock().unwrap().producers.get(&kind).cloned()
    }

    pub fn producers(&self) -> Vec<(StreamKind, Producer)> {
        self.shared
            .state
            .lock()
            .unwrap()
            .producers
            .iter()
            .map(|(k, p)| (*k, p.clone()))
            .collect()
    }

    /// Owned producer with the given id, if any.
    pub fn producer_by_id(&self, pid: &str) -> Option<(StreamKind, Producer)> {
        self.shared
            .state
            .lock()
            .unwrap()
            .producers
            .iter()
            .find(|(_, p)| p.id().to_string() == pid)
            .map(|(k, p)| (*k, p.clone()))
    }

    pub fn remove_producer_by_id(&self, pid: &str) -> Option<(StreamKind, Producer)> {
        let mut state = self.shared.state.lock().unwrap();
        let kind = state
            .producers
            .iter()
            .find(|(_, p)| p.id().to_string() == pid)
            .map(|(k, _)| *k)?;
        state.producers.remove(&kind).map(|p| (kind, p))
    }

    // ── Planner snapshot ──────────────────────────────────

    pub fn audio_view(&self) -> PeerAudioView {
        let state = self.shared.state.lock().unwrap();
        let mut view = PeerAudioView {
            socket_id: self.shared.socket_id.clone(),
            ..PeerAudioView::default()
        };

        for (kind, producer) in &state.producers {
            if kind.is_audio() {
                view.owned_audio.insert(
                    producer.id().to_string(),
                    HandleState {
                        open: !producer.closed(),
                        paused: producer.paused(),
                    },
                );
                // Video owned by the same peer, reachable from this audio pid.
                let video_kind = match kind {
                    StreamKind::ScreenAudio => StreamKind::ScreenVideo,
                    _ => StreamKind::Video,
                };
                if let Some(video) = state.producers.get(&video_kind) {
                    view.video_for_audio.insert(
                        producer.id().to_string(),
                        HandleState {
                            open: !video.closed(),
                            paused: video.paused(),
                        },
                    );
                }
            }
        }

        for downstream in &state.downstreams {
            for (kind, consumer) in &downstream.consumers {
                let entry = HandleState {
                    open: !consumer.closed(),
                    paused: consumer.paused(),
                };
                if kind.is_audio() {
                    view.consumed_audio
                        .insert(consumer.producer_id().to_string(), entry);
                } else if let Some(audio_pid) = &downstream.associated_audio_pid {
                    view.video_for_audio.insert(audio_pid.clone(), entry);
                }
            }
        }

        view
    }

    /// Video producer or consumer associated with an audio pid, used by the
    /// engine's never-pause-video resume path.
    pub fn video_handle_for_audio(&self, audio_pid: &str) -> Option<VideoHandle> {
        let state = self.shared.state.lock().unwrap();

        for (kind, producer) in &state.producers {
            if kind.is_audio() && producer.id().to_string() == audio_pid {
                let video_kind = match kind {
                    StreamKind::ScreenAudio => StreamKind::ScreenVideo,
                    _ => StreamKind::Video,
                };
                return state
                    .producers
                    .get(&video_kind)
                    .cloned()
                    .map(VideoHandle::Producer);
            }
        }

        state
            .downstreams
            .iter()
            .find(|d| d.associated_audio_pid.as_deref() == Some(audio_pid))
            .and_then(|d| {
                d.consumers
                    .iter()
                    .find(|(kind, _)| !kind.is_audio())
                    .map(|(_, c)| VideoHandle::Consumer(c.clone()))
            })
    }

    /// Close everything this peer holds. Dropping the handles closes them on
    /// the SFU; calling this twice is a no-op.
    pub fn cleanup(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.upstream = None;
        state.downstreams.clear();
        state.producers.clear();
    }
}

pub enum VideoHandle {
    Producer(Producer),
    Consumer(Consumer),
}
