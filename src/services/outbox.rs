use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use redis::aio::ConnectionManager;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::time::{Duration, interval};

use crate::config::OutboxConfig;
use crate::types::message::ChatMessage;

const QUEUE_KEY: &str = "queue:message.created";
const FAILED_KEY: &str = "queue:message.created:failed";

fn idempotency_key(message_id: &str) -> String {
    format!("msg:idem:{message_id}")
}

fn job_key(message_id: &str) -> String {
    format!("{QUEUE_KEY}:job:{message_id}")
}

/// Exponential backoff: `backoff_ms * 2^(attempts_made - 1)`.
fn backoff_delay_ms(backoff_ms: u64, attempts_made: u32) -> u64 {
    backoff_ms.saturating_mul(1u64 << attempts_made.saturating_sub(1).min(20))
}

#[derive(Debug, Clone, Copy)]
pub struct EnqueueOutcome {
    pub is_duplicate: bool,
}

/// Durable ingestion queue for accepted chat messages. Enqueue is guarded by
/// the `msg:idem:{id}` key, so at most one entry per message id ever lands in
/// the queue; the drainer retries delivery with exponential backoff and
/// spools accepted messages to disk.
pub struct Outbox {
    redis: ConnectionManager,
    cfg: OutboxConfig,
    shutdown: Notify,
}

impl Outbox {
    pub fn new(redis: ConnectionManager, cfg: OutboxConfig) -> Self {
        Self {
            redis,
            cfg,
            shutdown: Notify::new(),
        }
    }

    /// Idempotent enqueue keyed by message id. The entry becomes visible to
    /// the drainer immediately.
    pub async fn enqueue(&self, msg: &ChatMessage) -> Result<EnqueueOutcome, redis::RedisError> {
        let mut conn = self.redis.clone();

        let marker = serde_json::json!({"jobId": msg.job_id}).to_string();
        let claimed: Option<String> = redis::cmd("SET")
            .arg(idempotency_key(&msg.id))
            .arg(&marker)
            .arg("NX")
            .arg("EX")
            .arg(self.cfg.idempotency_ttl_secs)
            .query_async(&mut conn)
            .await?;

        if claimed.is_none() {
            return Ok(EnqueueOutcome { is_duplicate: true });
        }

        let payload = serde_json::to_string(msg).unwrap_or_default();
        let now_ms = Utc::now().timestamp_millis();
        redis::pipe()
            .cmd("HSET")
            .arg(job_key(&msg.id))
            .arg("name")
            .arg("message.created")
            .arg("payload")
            .arg(&payload)
            .arg("attempts_made")
            .arg(0)
            .arg("enqueued_at")
            .arg(now_ms)
            .ignore()
            .cmd("ZADD")
            .arg(QUEUE_KEY)
            .arg(now_ms)
            .arg(&msg.id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(EnqueueOutcome { is_duplicate: false })
    }

    /// Background drainer; stops when `shutdown` is signalled.
    pub fn spawn_drainer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let outbox = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(outbox.cfg.drain_interval_ms));
            loop {
                tokio::select! {
                    _ = outbox.shutdown.notified() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = outbox.drain_once().await {
                            tracing::error!(error = %e, "Outbox drain failed");
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    async fn drain_once(&self) -> anyhow::Result<usize> {
        let mut conn = self.redis.clone();
        let now_ms = Utc::now().timestamp_millis();

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(QUEUE_KEY)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(16)
            .query_async(&mut conn)
            .await?;

        let mut processed = 0usize;
        for message_id in due {
            let (payload, attempts_made): (Option<String>, Option<u32>) = redis::pipe()
                .cmd("HGET")
                .arg(job_key(&message_id))
                .arg("payload")
                .cmd("HGET")
                .arg(job_key(&message_id))
                .arg("attempts_made")
                .query_async(&mut conn)
                .await?;

            let Some(payload) = payload else {
                // Entry hash expired out from under the index.
                redis::cmd("ZREM")
                    .arg(QUEUE_KEY)
                    .arg(&message_id)
                    .query_async::<()>(&mut conn)
                    .await?;
                continue;
            };

            let attempts_made = attempts_made.unwrap_or(0) + 1;
            let delivered = match serde_json::from_str::<ChatMessage>(&payload) {
                Ok(msg) => self.deliver(&msg).await,
                Err(e) => Err(anyhow::anyhow!("undecodable outbox payload: {e}")),
            };

            match delivered {
                Ok(()) => {
                    redis::pipe()
                        .cmd("ZREM")
                        .arg(QUEUE_KEY)
                        .arg(&message_id)
                        .ignore()
                        .cmd("HSET")
                        .arg(job_key(&message_id))
                        .arg("attempts_made")
                        .arg(attempts_made)
                        .ignore()
                        .cmd("EXPIRE")
                        .arg(job_key(&message_id))
                        .arg(self.cfg.remove_complete_secs)
                        .ignore()
                        .query_async::<()>(&mut conn)
                        .await?;
                    processed += 1;
                }
                Err(e) if attempts_made >= self.cfg.attempts => {
                    tracing::error!(
                        message_id = %message_id,
                        attempts = attempts_made,
                        error = %e,
                        "Outbox entry exhausted its attempts"
                    );
                    redis::pipe()
                        .cmd("ZREM")
                        .arg(QUEUE_KEY)
                        .arg(&message_id)
                        .ignore()
                        .cmd("ZADD")
                        .arg(FAILED_KEY)
                        .arg(now_ms)
                        .arg(&message_id)
                        .ignore()
                        .cmd("HSET")
                        .arg(job_key(&message_id))
                        .arg("attempts_made")
                        .arg(attempts_made)
                        .ignore()
                        .cmd("EXPIRE")
                        .arg(job_key(&message_id))
                        .arg(self.cfg.remove_fail_secs)
                        .ignore()
                        .query_async::<()>(&mut conn)
                        .await?;
                }
                Err(e) => {
                    let retry_at =
                        now_ms + backoff_delay_ms(self.cfg.backoff_ms, attempts_made) as i64;
                    tracing::warn!(
                        message_id = %message_id,
                        attempts = attempts_made,
                        retry_at,
                        error = %e,
                        "Outbox delivery failed, scheduling retry"
                    );
                    redis::pipe()
                        .cmd("HSET")
                        .arg(job_key(&message_id))
                        .arg("attempts_made")
                        .arg(attempts_made)
                        .ignore()
                        .cmd("ZADD")
                        .arg(QUEUE_KEY)
                        .arg(retry_at)
                        .arg(&message_id)
                        .ignore()
                        .query_async::<()>(&mut conn)
                        .await?;
                }
            }
        }

        Ok(processed)
    }

    /// Accepted messages land in a per-conversation JSON-lines spool.
    async fn deliver(&self, msg: &ChatMessage) -> anyhow::Result<()> {
        let path = spool_path(Path::new(&self.cfg.spool_dir), &msg.job_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');
        file.write_all(&line).await?;
        Ok(())
    }
}

fn spool_path(spool_dir: &Path, job_id: &str) -> PathBuf {
    // Conversation ids are opaque; keep the filename filesystem-safe.
    let safe: String = job_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    spool_dir.join(format!("{safe}.jsonl"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_match_store_layout() {
        assert_eq!(idempotency_key("m1"), "msg:idem:m1");
        assert_eq!(job_key("m1"), "queue:message.created:job:m1");
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay_ms(2000, 1), 2000);
        assert_eq!(backoff_delay_ms(2000, 2), 4000);
        assert_eq!(backoff_delay_ms(2000, 3), 8000);
        assert_eq!(backoff_delay_ms(2000, 5), 32000);
    }

    #[test]
    fn spool_path_sanitizes_job_ids() {
        let path = spool_path(Path::new("temp/spool"), "job/..:1");
        assert_eq!(path, PathBuf::from("temp/spool/job____1.jsonl"));
    }
}
