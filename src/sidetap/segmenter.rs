use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::SideTapError;

/// SDP handed to the segmenter: a single Opus stream arriving on the tap's
/// RTP port.
pub fn sdp_body(rtp_port: u16) -> String {
    format!(
        "v=0\r\n\
         o=- 0 0 IN IP4 127.0.0.1\r\n\
         s=AudioTap\r\n\
         c=IN IP4 127.0.0.1\r\n\
         t=0 0\r\n\
         m=audio {rtp_port} RTP/AVP 100\r\n\
         a=rtpmap:100 opus/48000/2\r\n\
         a=recvonly\r\n"
    )
}

pub async fn write_sdp(path: &Path, rtp_port: u16) -> std::io::Result<()> {
    tokio::fs::write(path, sdp_body(rtp_port)).await
}

/// Arguments for the ffmpeg segmenter: read the SDP over RTP, downmix to
/// 16 kHz mono PCM, cut fixed-length WAV segments and append each finished
/// name to the segment list.
pub fn segmenter_args(
    sdp_path: &Path,
    wav_pattern: &Path,
    list_path: &Path,
    segment_secs: u32,
) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-protocol_whitelist".into(),
        "file,udp,rtp".into(),
        "-i".into(),
        sdp_path.to_string_lossy().into_owned(),
        "-ar".into(),
        "16000".into(),
        "-ac".into(),
        "1".into(),
        "-acodec".into(),
        "pcm_s16le".into(),
        "-f".into(),
        "segment".into(),
        "-segment_time".into(),
        segment_secs.to_string(),
        "-segment_list".into(),
        list_path.to_string_lossy().into_owned(),
        "-y".into(),
        wav_pattern.to_string_lossy().into_owned(),
    ]
}

/// A running segmenter subprocess. Killed explicitly on tap stop and, as a
/// backstop, when the handle drops.
pub struct Segmenter {
    child: Child,
}

impl Segmenter {
    pub fn spawn(
        ffmpeg_path: &str,
        sdp_path: &Path,
        wav_pattern: &Path,
        list_path: &Path,
        segment_secs: u32,
    ) -> Result<Self, SideTapError> {
        let child = Command::new(ffmpeg_path)
            .args(segmenter_args(sdp_path, wav_pattern, list_path, segment_secs))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SideTapError::Segmenter(format!("{}: {e}", ffmpeg_path)))?;
        Ok(Self { child })
    }

    pub async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "Segmenter already exited");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn sdp_describes_opus_on_the_rtp_port() {
        let body = sdp_body(61900);
        assert!(body.contains("m=audio 61900 RTP/AVP 100"));
        assert!(body.contains("a=rtpmap:100 opus/48000/2"));
        assert!(body.contains("c=IN IP4 127.0.0.1"));
    }

    #[test]
    fn segmenter_args_produce_16khz_mono_wav_segments() {
        let args = segmenter_args(
            &PathBuf::from("/tmp/a.sdp"),
            &PathBuf::from("/tmp/a_segment_%03d.wav"),
            &PathBuf::from("/tmp/a_segments.txt"),
            30,
        );
        let joined = args.join(" ");
        assert!(joined.contains("-ar 16000"));
        assert!(joined.contains("-ac 1"));
        assert!(joined.contains("pcm_s16le"));
        assert!(joined.contains("-segment_time 30"));
        assert!(joined.contains("-segment_list /tmp/a_segments.txt"));
        assert!(joined.ends_with("/tmp/a_segment_%03d.wav"));
    }
}
