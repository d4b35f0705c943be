use std::fmt;
use std::str::FromStr;

use mediasoup::rtp_parameters::MediaKind;
use serde::{Deserialize, Serialize};

/// Semantic category of a media track. The wire uses camelCase names
/// (`screenAudio`, `screenVideo`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamKind {
    Audio,
    Video,
    Screen,
    ScreenAudio,
    ScreenVideo,
    Ar,
    Drawing,
    Detection,
}

impl StreamKind {
    pub const ALL: [StreamKind; 8] = [
        StreamKind::Audio,
        StreamKind::Video,
        StreamKind::Screen,
        StreamKind::ScreenAudio,
        StreamKind::ScreenVideo,
        StreamKind::Ar,
        StreamKind::Drawing,
        StreamKind::Detection,
    ];

    /// Underlying RTP media kind: audio-like kinds carry audio, everything
    /// else (screens, AR, drawing, detection overlays) rides a video track.
    pub fn media_kind(self) -> MediaKind {
        match self {
            StreamKind::Audio | StreamKind::ScreenAudio => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }

    pub fn is_audio(self) -> bool {
        self.media_kind() == MediaKind::Audio
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
            StreamKind::Screen => "screen",
            StreamKind::ScreenAudio => "screenAudio",
            StreamKind::ScreenVideo => "screenVideo",
            StreamKind::Ar => "ar",
            StreamKind::Drawing => "drawing",
            StreamKind::Detection => "detection",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(StreamKind::Audio),
            "video" => Ok(StreamKind::Video),
            "screen" => Ok(StreamKind::Screen),
            "screenAudio" => Ok(StreamKind::ScreenAudio),
            "screenVideo" => Ok(StreamKind::ScreenVideo),
            "ar" => Ok(StreamKind::Ar),
            "drawing" => Ok(StreamKind::Drawing),
            "detection" => Ok(StreamKind::Detection),
            other => Err(format!("unknown stream kind: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_like_kinds_map_to_audio() {
        assert_eq!(StreamKind::Audio.media_kind(), MediaKind::Audio);
        assert_eq!(StreamKind::ScreenAudio.media_kind(), MediaKind::Audio);
        for kind in [
            StreamKind::Video,
            StreamKind::Screen,
            StreamKind::ScreenVideo,
            StreamKind::Ar,
            StreamKind::Drawing,
            StreamKind::Detection,
        ] {
            assert_eq!(kind.media_kind(), MediaKind::Video);
        }
    }

    #[test]
    fn wire_names_round_trip() {
        for kind in StreamKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            let back: StreamKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
            assert_eq!(kind.as_str().parse::<StreamKind>().unwrap(), kind);
        }
    }
}
