use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub jobs: JobsConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub sidetap: SideTapConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8090,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 6379,
            password: None,
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) if !pw.is_empty() => format!("redis://:{}@{}:{}", pw, self.host, self.port),
            _ => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    pub base_url: String,
    #[serde(default = "default_jobs_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_jobs_retries")]
    pub max_retries: u32,
}

fn default_jobs_timeout_secs() -> u64 {
    5
}

fn default_jobs_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStrategy {
    Blocking,
    Try,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_lock_strategy")]
    pub lock_strategy: LockStrategy,
    /// Queues idle longer than this are swept.
    #[serde(default = "default_queue_idle_secs")]
    pub queue_idle_secs: u64,
}

fn default_lock_strategy() -> LockStrategy {
    LockStrategy::Blocking
}

fn default_queue_idle_secs() -> u64 {
    300
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            lock_strategy: default_lock_strategy(),
            queue_idle_secs: default_queue_idle_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    pub lease_ms: u64,
    pub extend_threshold_ms: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub retry_jitter_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ms: 10_000,
            extend_threshold_ms: 500,
            retry_count: 10,
            retry_delay_ms: 200,
            retry_jitter_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerDiedPolicy {
    Respawn,
    Exit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Worker count; defaults to the logical CPU count at startup.
    #[serde(default)]
    pub num_workers: Option<usize>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub public_ip: String,
    #[serde(default)]
    pub announced_ip: Option<String>,
    pub worker_log_level: String,
    pub max_active_speakers: usize,
    pub initial_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: u32,
    pub refresh_interval_secs: u64,
    pub observer_interval_ms: u16,
    pub sampler_interval_ms: u64,
    pub overload_threshold: f64,
    pub weight_cpu: f64,
    pub weight_routers: f64,
    pub weight_transports: f64,
    pub worker_died_policy: WorkerDiedPolicy,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            num_workers: None,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            public_ip: "127.0.0.1".into(),
            announced_ip: None,
            worker_log_level: "warn".into(),
            max_active_speakers: 10,
            initial_available_outgoing_bitrate: 600_000,
            max_incoming_bitrate: 1_500_000,
            refresh_interval_secs: 25,
            observer_interval_ms: 100,
            sampler_interval_ms: 1000,
            overload_threshold: 16.0,
            weight_cpu: 10.0,
            weight_routers: 0.5,
            weight_transports: 0.1,
            worker_died_policy: WorkerDiedPolicy::Respawn,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SideTapConfig {
    pub audio_dir: String,
    pub transcript_dir: String,
    pub port_min: u16,
    pub port_max: u16,
    pub segment_secs: u32,
    pub watcher_poll_ms: u64,
    pub ffmpeg_path: String,
}

impl Default for SideTapConfig {
    fn default() -> Self {
        Self {
            audio_dir: "temp/audio-segments".into(),
            transcript_dir: "temp/transcripts".into(),
            port_min: 60000,
            port_max: 65000,
            segment_secs: 30,
            watcher_poll_ms: 1000,
            ffmpeg_path: "ffmpeg".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionConfig {
    pub script: String,
    pub model: String,
    pub device: String,
    pub compute_type: String,
    #[serde(default)]
    pub language: Option<String>,
    pub timeout_secs: u64,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            script: "transcribe.py".into(),
            model: "base".into(),
            device: "cpu".into(),
            compute_type: "int8".into(),
            language: None,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    pub attempts: u32,
    pub backoff_ms: u64,
    pub remove_complete_secs: u64,
    pub remove_fail_secs: u64,
    pub idempotency_ttl_secs: u64,
    pub spool_dir: String,
    pub drain_interval_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff_ms: 2000,
            remove_complete_secs: 3600,
            remove_fail_secs: 86400,
            idempotency_ttl_secs: 3600,
            spool_dir: "temp/message-spool".into(),
            drain_interval_ms: 500,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::Environment::with_prefix("HUDDLE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: AppConfig = config.try_deserialize()?;
        cfg.apply_env_aliases();
        Ok(cfg)
    }

    /// Flat legacy variable names supported for deployment parity:
    /// `REDIS_HOST/PORT/PASSWORD`, `JWT_SECRET`, `JOBS_SERVICE_URL`,
    /// `PUBLIC_IP`, `RTC_MIN_PORT`, `RTC_MAX_PORT`.
    fn apply_env_aliases(&mut self) {
        if let Ok(host) = env::var("REDIS_HOST") {
            self.redis.host = host;
        }
        if let Ok(port) = env::var("REDIS_PORT") {
            if let Ok(port) = port.parse() {
                self.redis.port = port;
            }
        }
        if let Ok(pw) = env::var("REDIS_PASSWORD") {
            self.redis.password = Some(pw);
        }
        if let Ok(secret) = env::var("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Ok(url) = env::var("JOBS_SERVICE_URL") {
            self.jobs.base_url = url;
        }
        if let Ok(ip) = env::var("PUBLIC_IP") {
            self.media.public_ip = ip;
        }
        if let Ok(port) = env::var("RTC_MIN_PORT") {
            if let Ok(port) = port.parse() {
                self.media.rtc_min_port = port;
            }
        }
        if let Ok(port) = env::var("RTC_MAX_PORT") {
            if let Ok(port) = port.parse() {
                self.media.rtc_max_port = port;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_url_with_and_without_password() {
        let mut redis = RedisConfig::default();
        assert_eq!(redis.url(), "redis://127.0.0.1:6379");
        redis.password = Some("hunter2".into());
        assert_eq!(redis.url(), "redis://:hunter2@127.0.0.1:6379");
    }

    #[test]
    fn defaults_match_contract() {
        let locks = LockConfig::default();
        assert_eq!(locks.lease_ms, 10_000);
        assert_eq!(locks.retry_count, 10);

        let media = MediaConfig::default();
        assert_eq!(media.max_active_speakers, 10);
        assert_eq!(media.refresh_interval_secs, 25);
        assert_eq!(media.observer_interval_ms, 100);

        let tap = SideTapConfig::default();
        assert_eq!((tap.port_min, tap.port_max), (60000, 65000));
        assert_eq!(tap.segment_secs, 30);

        let outbox = OutboxConfig::default();
        assert_eq!(outbox.attempts, 5);
        assert_eq!(outbox.backoff_ms, 2000);
    }
}
