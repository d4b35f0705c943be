use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// One transcribed segment held for a participant's session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSegment {
    pub segment_index: u32,
    pub text: String,
    pub language: String,
    pub confidence: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
struct SessionTranscript {
    started_at: DateTime<Utc>,
    segments: Vec<StoredSegment>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TranscriptFile<'a> {
    room_id: &'a str,
    participant_id: &'a str,
    session_start_time: String,
    session_end_time: String,
    total_segments: usize,
    segments: &'a [StoredSegment],
}

/// In-memory transcript segments per room and participant, spooled to disk
/// as JSON when a session (or the whole room) ends.
pub struct TranscriptStore {
    dir: PathBuf,
    rooms: DashMap<String, HashMap<String, SessionTranscript>>,
}

impl TranscriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            rooms: DashMap::new(),
        }
    }

    pub fn record_segment(&self, room_id: &str, participant_id: &str, segment: StoredSegment) {
        let mut room = self.rooms.entry(room_id.to_string()).or_default();
        let session = room
            .entry(participant_id.to_string())
            .or_insert_with(|| SessionTranscript {
                started_at: Utc::now(),
                segments: Vec::new(),
            });
        session.segments.push(segment);
        session.segments.sort_by_key(|s| s.segment_index);
    }

    pub fn segment_count(&self, room_id: &str, participant_id: &str) -> usize {
        self.rooms
            .get(room_id)
            .and_then(|room| room.get(participant_id).map(|s| s.segments.len()))
            .unwrap_or(0)
    }

    /// Write one participant's session to the spool and drop it from memory.
    pub async fn flush_session(&self, room_id: &str, participant_id: &str) -> std::io::Result<()> {
        let session = {
            let mut room = match self.rooms.get_mut(room_id) {
                Some(room) => room,
                None => return Ok(()),
            };
            room.remove(participant_id)
        };
        let Some(session) = session else {
            return Ok(());
        };
        if session.segments.is_empty() {
            return Ok(());
        }
        self.write_session(room_id, participant_id, &session).await
    }

    /// Flush every session in a dying room, then forget the room.
    pub async fn clear_room(&self, room_id: &str) {
        let sessions = self
            .rooms
            .remove(room_id)
            .map(|(_, sessions)| sessions)
            .unwrap_or_default();
        for (participant_id, session) in sessions {
            if session.segments.is_empty() {
                continue;
            }
            if let Err(e) = self.write_session(room_id, &participant_id, &session).await {
                tracing::warn!(
                    room_id,
                    participant_id = %participant_id,
                    error = %e,
                    "Could not spool transcript session"
                );
            }
        }
    }

    async fn write_session(
        &self,
        room_id: &str,
        participant_id: &str,
        session: &SessionTranscript,
    ) -> std::io::Result<()> {
        let now = Utc::now();
        let file = TranscriptFile {
            room_id,
            participant_id,
            session_start_time: session.started_at.to_rfc3339(),
            session_end_time: now.to_rfc3339(),
            total_segments: session.segments.len(),
            segments: &session.segments,
        };

        let dir = self.dir.join(sanitize(room_id));
        tokio::fs::create_dir_all(&dir).await?;
        let path = transcript_path(&dir, participant_id, now);
        let body = serde_json::to_vec_pretty(&file)?;
        tokio::fs::write(&path, body).await?;
        tracing::info!(
            room_id,
            participant_id,
            segments = session.segments.len(),
            path = %path.display(),
            "Transcript session spooled"
        );
        Ok(())
    }
}

fn transcript_path(dir: &Path, participant_id: &str, at: DateTime<Utc>) -> PathBuf {
    let stamp = at.format("%Y-%m-%dT%H-%M-%S%.3fZ");
    dir.join(format!("{}_{stamp}.json", sanitize(participant_id)))
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(index: u32, text: &str) -> StoredSegment {
        StoredSegment {
            segment_index: index,
            text: text.into(),
            language: "en".into(),
            confidence: 0.9,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn flush_writes_session_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path());

        store.record_segment("r1", "u1", segment(1, "second"));
        store.record_segment("r1", "u1", segment(0, "first"));
        assert_eq!(store.segment_count("r1", "u1"), 2);

        store.flush_session("r1", "u1").await.unwrap();
        assert_eq!(store.segment_count("r1", "u1"), 0);

        let room_dir = dir.path().join("r1");
        let entries: Vec<_> = std::fs::read_dir(&room_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);

        let body = std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["roomId"], "r1");
        assert_eq!(json["participantId"], "u1");
        assert_eq!(json["totalSegments"], 2);
        // Segments are ordered by index regardless of arrival.
        assert_eq!(json["segments"][0]["text"], "first");
    }

    #[tokio::test]
    async fn empty_sessions_are_not_spooled() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path());
        store.flush_session("r1", "ghost").await.unwrap();
        assert!(!dir.path().join("r1").exists());
    }

    #[tokio::test]
    async fn clear_room_flushes_every_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path());
        store.record_segment("r2", "u1", segment(0, "a"));
        store.record_segment("r2", "u2", segment(0, "b"));

        store.clear_room("r2").await;
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("r2")).unwrap().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(store.segment_count("r2", "u1"), 0);
    }
}
