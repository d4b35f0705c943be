use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::interval;

use super::AudioSession;
use super::store::StoredSegment;
use super::transcribe;
use crate::state::AppState;
use crate::types::events::{Frame, TranscriptionEvent};

/// Single watcher over every session's segment list. The list file is the
/// authoritative completion signal, so polling it is exact; new entries are
/// claimed and handed to the transcription worker.
pub fn spawn_watcher(state: AppState) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_millis(state.config.sidetap.watcher_poll_ms.max(100));
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            poll_once(&state).await;
        }
    })
}

async fn poll_once(state: &AppState) {
    for session in state.sidetap.sessions_snapshot() {
        let content = match tokio::fs::read_to_string(&session.segment_list_path).await {
            Ok(content) => content,
            // The segmenter has not closed its first segment yet.
            Err(_) => continue,
        };

        for line in content.lines() {
            let name = line.trim();
            let Some(index) = parse_segment_index(name) else {
                continue;
            };
            if !session.claim_segment(index) {
                continue;
            }
            // Segment-list entries mirror the output pattern; they are
            // relative to the audio directory unless the pattern was absolute.
            let wav_path = if std::path::Path::new(name).is_absolute() {
                PathBuf::from(name)
            } else {
                session.audio_dir.join(name)
            };
            let state = state.clone();
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                process_segment(state, session, wav_path, index).await;
            });
        }
    }
}

async fn process_segment(
    state: AppState,
    session: Arc<AudioSession>,
    wav_path: PathBuf,
    index: u32,
) {
    match transcribe::transcribe_wav(&state.config.transcription, &wav_path).await {
        Ok(result) => {
            let timestamp = Utc::now().timestamp_millis();
            state.transcripts.record_segment(
                &session.room_id,
                &session.participant_id,
                StoredSegment {
                    segment_index: index,
                    text: result.text.clone(),
                    language: result.language.clone(),
                    confidence: result.confidence,
                    timestamp,
                },
            );
            state.gateway.broadcast_to_room(
                &session.room_id,
                Frame::event(
                    "transcription",
                    TranscriptionEvent {
                        room_id: session.room_id.clone(),
                        participant_id: session.participant_id.clone(),
                        segment_index: index,
                        text: result.text,
                        language: result.language,
                        confidence: result.confidence,
                        timestamp,
                    },
                ),
                None,
            );
            session.mark_processed(index);
        }
        Err(e) => {
            tracing::warn!(
                room_id = %session.room_id,
                participant_id = %session.participant_id,
                segment = index,
                error = %e,
                "Segment dropped"
            );
        }
    }
    session.release_in_flight(index);
}

/// Segment files are named `{base}_segment_NNN.wav`; the index is NNN.
pub fn parse_segment_index(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(".wav")?;
    let at = stem.rfind("_segment_")?;
    stem[at + "_segment_".len()..].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_segment_indices() {
        assert_eq!(parse_segment_index("ada_u1_segment_000.wav"), Some(0));
        assert_eq!(parse_segment_index("ada_u1_segment_042.wav"), Some(42));
        assert_eq!(parse_segment_index("weird_segment_name_segment_007.wav"), Some(7));
    }

    #[test]
    fn rejects_non_segment_files() {
        assert_eq!(parse_segment_index("ada_u1.sdp"), None);
        assert_eq!(parse_segment_index("ada_u1_segments.txt"), None);
        assert_eq!(parse_segment_index("ada_u1_segment_xyz.wav"), None);
        assert_eq!(parse_segment_index(""), None);
    }
}
