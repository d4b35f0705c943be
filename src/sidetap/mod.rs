pub mod ports;
pub mod segmenter;
pub mod store;
pub mod transcribe;
pub mod watcher;

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mediasoup::consumer::{Consumer, ConsumerOptions};
use mediasoup::data_structures::{ListenInfo, Protocol};
use mediasoup::plain_transport::{
    PlainTransport, PlainTransportOptions, PlainTransportRemoteParameters,
};
use mediasoup::producer::Producer;
use mediasoup::rtp_parameters::RtpCapabilities;
use mediasoup::transport::Transport;

use crate::config::SideTapConfig;
use crate::error::{MediaError, SideTapError};
use crate::media::peer::Peer;
use crate::media::room::Room;
use self::ports::{PortPair, PortPool};
use self::segmenter::Segmenter;

const TAP_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct TapHandles {
    _plain_transport: PlainTransport,
    _consumer: Consumer,
    segmenter: Option<Segmenter>,
}

#[derive(Default)]
struct Progress {
    last_processed: Option<u32>,
    in_flight: HashSet<u32>,
    attempted: HashSet<u32>,
}

/// One per-producer capture session: a plain transport copying the audio
/// into a local segmenter, plus the bookkeeping the watcher drives.
pub struct AudioSession {
    pub participant_id: String,
    pub room_id: String,
    pub producer_id: String,
    pub ports: PortPair,
    pub sdp_path: PathBuf,
    pub segment_list_path: PathBuf,
    pub audio_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    handles: Mutex<Option<TapHandles>>,
    progress: Mutex<Progress>,
}

impl AudioSession {
    /// Claim a segment index for processing. Each index is handed out at
    /// most once per session; indices at or below the high-water mark are
    /// already done.
    pub fn claim_segment(&self, index: u32) -> bool {
        let mut progress = self.progress.lock().unwrap();
        if let Some(last) = progress.last_processed {
            if index <= last {
                return false;
            }
        }
        if !progress.attempted.insert(index) {
            return false;
        }
        progress.in_flight.insert(index);
        true
    }

    /// Successful transcription: the high-water mark never decreases.
    pub fn mark_processed(&self, index: u32) {
        let mut progress = self.progress.lock().unwrap();
        progress.last_processed = Some(progress.last_processed.map_or(index, |l| l.max(index)));
    }

    pub fn release_in_flight(&self, index: u32) {
        self.progress.lock().unwrap().in_flight.remove(&index);
    }

    pub fn last_processed(&self) -> Option<u32> {
        self.progress.lock().unwrap().last_processed
    }

    pub fn in_flight_count(&self) -> usize {
        self.progress.lock().unwrap().in_flight.len()
    }
}

/// Owns the port pool and all live capture sessions, keyed by producer id.
pub struct SideTapManager {
    cfg: SideTapConfig,
    ports: PortPool,
    sessions: DashMap<String, Arc<AudioSession>>,
}

impl SideTapManager {
    pub fn new(cfg: SideTapConfig) -> Self {
        let ports = PortPool::new(cfg.port_min, cfg.port_max);
        Self {
            cfg,
            ports,
            sessions: DashMap::new(),
        }
    }

    pub fn session(&self, producer_id: &str) -> Option<Arc<AudioSession>> {
        self.sessions.get(producer_id).map(|s| Arc::clone(&s))
    }

    pub fn sessions_snapshot(&self) -> Vec<Arc<AudioSession>> {
        self.sessions.iter().map(|s| Arc::clone(&s)).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn ports_available(&self) -> usize {
        self.ports.available()
    }

    /// Provision the capture pipeline for a microphone producer: port pair,
    /// plain transport + consumer, SDP file, segmenter subprocess.
    pub async fn start_tap(
        &self,
        room: &Room,
        peer: &Peer,
        producer: &Producer,
    ) -> Result<(), SideTapError> {
        let producer_id = producer.id().to_string();
        if self.sessions.contains_key(&producer_id) {
            return Ok(());
        }

        let audio_dir = Path::new(&self.cfg.audio_dir).join(sanitize(room.id()));
        tokio::fs::create_dir_all(&audio_dir).await?;

        let pair = self.ports.allocate()?;
        match self
            .provision(room, peer, producer, &audio_dir, pair)
            .await
        {
            Ok(session) => {
                tracing::info!(
                    room_id = %room.id(),
                    participant_id = %peer.user_id(),
                    producer_id = %producer_id,
                    rtp_port = pair.rtp,
                    "Audio side-tap started"
                );
                self.sessions.insert(producer_id, Arc::new(session));
                Ok(())
            }
            Err(e) => {
                self.ports.release(pair);
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        room: &Room,
        peer: &Peer,
        producer: &Producer,
        audio_dir: &Path,
        pair: PortPair,
    ) -> Result<AudioSession, SideTapError> {
        let listen_info = ListenInfo {
            protocol: Protocol::Udp,
            ip: TAP_IP,
            announced_address: None,
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        };
        let mut options = PlainTransportOptions::new(listen_info);
        options.rtcp_mux = false;
        options.comedia = false;

        let transport = room
            .router()
            .create_plain_transport(options)
            .await
            .map_err(|e| MediaError::Sfu(format!("create_plain_transport: {e}")))?;

        transport
            .connect(PlainTransportRemoteParameters {
                ip: Some(TAP_IP),
                port: Some(pair.rtp),
                rtcp_port: Some(pair.rtcp),
                srtp_parameters: None,
            })
            .await
            .map_err(|e| MediaError::Sfu(format!("plain transport connect: {e}")))?;

        // The router's finalized capabilities share the RtpCapabilities JSON
        // schema; round-trip through serde to consume with them.
        let caps: RtpCapabilities =
            serde_json::from_value(serde_json::to_value(room.router().rtp_capabilities()).map_err(
                |e| MediaError::Sfu(format!("capabilities serialize: {e}")),
            )?)
            .map_err(|e| MediaError::Sfu(format!("capabilities deserialize: {e}")))?;

        let consumer = transport
            .consume(ConsumerOptions::new(producer.id(), caps))
            .await
            .map_err(|e| MediaError::Sfu(format!("plain consume: {e}")))?;

        let base = format!("{}_{}", sanitize(peer.display_name()), sanitize(peer.user_id()));
        let sdp_path = audio_dir.join(format!("{base}.sdp"));
        let list_path = audio_dir.join(format!("{base}_segments.txt"));
        let wav_pattern = audio_dir.join(format!("{base}_segment_%03d.wav"));

        segmenter::write_sdp(&sdp_path, pair.rtp).await?;
        let segmenter = Segmenter::spawn(
            &self.cfg.ffmpeg_path,
            &sdp_path,
            &wav_pattern,
            &list_path,
            self.cfg.segment_secs,
        )?;

        Ok(AudioSession {
            participant_id: peer.user_id().to_string(),
            room_id: room.id().to_string(),
            producer_id: producer.id().to_string(),
            ports: pair,
            sdp_path,
            segment_list_path: list_path,
            audio_dir: audio_dir.to_path_buf(),
            started_at: Utc::now(),
            handles: Mutex::new(Some(TapHandles {
                _plain_transport: transport,
                _consumer: consumer,
                segmenter: Some(segmenter),
            })),
            progress: Mutex::new(Progress::default()),
        })
    }

    /// Tear one session down: kill the segmenter, close the transport and
    /// consumer, remove the tap files, return the ports.
    pub async fn stop_tap(&self, producer_id: &str) -> Option<(String, String)> {
        let (_, session) = self.sessions.remove(producer_id)?;

        let handles = session.handles.lock().unwrap().take();
        if let Some(mut handles) = handles {
            if let Some(segmenter) = handles.segmenter.take() {
                segmenter.kill().await;
            }
            // Dropping the handles closes the plain transport and consumer.
        }

        let _ = tokio::fs::remove_file(&session.sdp_path).await;
        let _ = tokio::fs::remove_file(&session.segment_list_path).await;
        self.ports.release(session.ports);

        tracing::info!(
            room_id = %session.room_id,
            participant_id = %session.participant_id,
            producer_id,
            "Audio side-tap stopped"
        );
        Some((session.room_id.clone(), session.participant_id.clone()))
    }

    /// Stop every tap a participant owns in a room. Returns the sessions
    /// that were stopped.
    pub async fn stop_for_participant(
        &self,
        room_id: &str,
        participant_id: &str,
    ) -> Vec<(String, String)> {
        let producer_ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.room_id == room_id && s.participant_id == participant_id)
            .map(|s| s.key().clone())
            .collect();

        let mut stopped = Vec::new();
        for producer_id in producer_ids {
            if let Some(info) = self.stop_tap(&producer_id).await {
                stopped.push(info);
            }
        }
        stopped
    }

    pub async fn stop_all(&self) {
        let producer_ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for producer_id in producer_ids {
            self.stop_tap(&producer_id).await;
        }
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_session() -> AudioSession {
        AudioSession {
            participant_id: "u1".into(),
            room_id: "r1".into(),
            producer_id: "p1".into(),
            ports: PortPair { rtp: 60000, rtcp: 60001 },
            sdp_path: PathBuf::from("/tmp/x.sdp"),
            segment_list_path: PathBuf::from("/tmp/x_segments.txt"),
            audio_dir: PathBuf::from("/tmp"),
            started_at: Utc::now(),
            handles: Mutex::new(None),
            progress: Mutex::new(Progress::default()),
        }
    }

    #[test]
    fn segments_are_claimed_at_most_once() {
        let session = bare_session();
        assert!(session.claim_segment(0));
        assert!(!session.claim_segment(0));
        assert_eq!(session.in_flight_count(), 1);
    }

    #[test]
    fn high_water_mark_never_decreases() {
        let session = bare_session();
        assert!(session.claim_segment(3));
        session.mark_processed(3);
        session.release_in_flight(3);

        session.mark_processed(1);
        assert_eq!(session.last_processed(), Some(3));
        // Indices at or below the mark are never claimed again.
        assert!(!session.claim_segment(2));
        assert!(session.claim_segment(4));
    }

    #[test]
    fn failed_segment_releases_in_flight_but_is_not_retried() {
        let session = bare_session();
        assert!(session.claim_segment(5));
        session.release_in_flight(5);
        assert_eq!(session.in_flight_count(), 0);
        assert!(!session.claim_segment(5));
    }
}
