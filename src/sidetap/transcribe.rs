use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::TranscriptionConfig;
use crate::error::SideTapError;

/// Stdout contract of the transcription worker: a single JSON object,
/// exit code 0.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionResult {
    pub success: bool,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub language_probability: f64,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub segments: Vec<TranscriptionSegment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub avg_logprob: f64,
    #[serde(default)]
    pub no_speech_prob: f64,
}

pub fn worker_args(cfg: &TranscriptionConfig, wav_path: &Path) -> Vec<String> {
    let mut args = vec![
        wav_path.to_string_lossy().into_owned(),
        "--model".into(),
        cfg.model.clone(),
        "--device".into(),
        cfg.device.clone(),
        "--compute-type".into(),
        cfg.compute_type.clone(),
    ];
    if let Some(language) = &cfg.language {
        args.push("--language".into());
        args.push(language.clone());
    }
    args
}

/// Run the transcription worker over one WAV segment with the configured
/// hard cap. On timeout the subprocess is killed and the segment dropped.
pub async fn transcribe_wav(
    cfg: &TranscriptionConfig,
    wav_path: &Path,
) -> Result<TranscriptionResult, SideTapError> {
    let wav_path = wav_path
        .canonicalize()
        .unwrap_or_else(|_| wav_path.to_path_buf());

    let child = Command::new(&cfg.script)
        .args(worker_args(cfg, &wav_path))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SideTapError::Transcription(format!("spawn {}: {e}", cfg.script)))?;

    let output = timeout(Duration::from_secs(cfg.timeout_secs), child.wait_with_output())
        .await
        .map_err(|_| SideTapError::TranscriptionTimeout)?
        .map_err(|e| SideTapError::Transcription(format!("wait: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SideTapError::Transcription(format!(
            "exit {:?}: {}",
            output.status.code(),
            stderr.trim()
        )));
    }

    let result: TranscriptionResult = serde_json::from_slice(&output.stdout)
        .map_err(|e| SideTapError::Transcription(format!("bad worker output: {e}")))?;

    if !result.success {
        return Err(SideTapError::Transcription("worker reported failure".into()));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn worker_args_follow_the_subprocess_contract() {
        let cfg = TranscriptionConfig {
            script: "transcribe.py".into(),
            model: "small".into(),
            device: "cuda".into(),
            compute_type: "float16".into(),
            language: Some("en".into()),
            timeout_secs: 60,
        };
        let args = worker_args(&cfg, &PathBuf::from("/tmp/seg_000.wav"));
        assert_eq!(
            args,
            vec![
                "/tmp/seg_000.wav",
                "--model",
                "small",
                "--device",
                "cuda",
                "--compute-type",
                "float16",
                "--language",
                "en",
            ]
        );
    }

    #[test]
    fn language_flag_is_optional() {
        let cfg = TranscriptionConfig::default();
        let args = worker_args(&cfg, &PathBuf::from("x.wav"));
        assert!(!args.iter().any(|a| a == "--language"));
    }

    #[test]
    fn worker_output_parses() {
        let raw = r#"{
            "success": true,
            "text": "hello there",
            "language": "en",
            "language_probability": 0.98,
            "duration": 30.0,
            "confidence": 0.91,
            "segments": [
                {"start": 0.0, "end": 2.5, "text": "hello there",
                 "avg_logprob": -0.2, "no_speech_prob": 0.01}
            ]
        }"#;
        let result: TranscriptionResult = serde_json::from_str(raw).unwrap();
        assert!(result.success);
        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.text, "hello there");
    }
}
