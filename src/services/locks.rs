use std::future::Future;
use std::time::Duration;

use rand::Rng;
use redis::aio::ConnectionManager;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::LockConfig;

/// Release only succeeds for the holder that acquired the lease.
const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// Extension re-arms the lease only while we still hold it.
const EXTEND_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Non-blocking acquisition found the lease held elsewhere.
    #[error("resource is busy")]
    Busy,

    /// Blocking acquisition exhausted its retries.
    #[error("lock acquisition timed out")]
    Timeout,

    /// The lease was lost while the guarded task was still running.
    #[error("lock aborted")]
    Aborted,

    #[error(transparent)]
    Store(#[from] redis::RedisError),
}

/// Resource-scoped mutual exclusion backed by the shared store. Leases live
/// under `lock:<resource>` and are auto-extended while the guarded task runs.
pub struct LockService {
    redis: ConnectionManager,
    cfg: LockConfig,
    release: std::sync::Arc<redis::Script>,
    extend: std::sync::Arc<redis::Script>,
}

struct Lease {
    key: String,
    token: String,
}

impl LockService {
    pub fn new(redis: ConnectionManager, cfg: LockConfig) -> Self {
        Self {
            redis,
            cfg,
            release: std::sync::Arc::new(redis::Script::new(RELEASE_SCRIPT)),
            extend: std::sync::Arc::new(redis::Script::new(EXTEND_SCRIPT)),
        }
    }

    /// Run `task` while holding the lease for `resource`, retrying
    /// acquisition with jittered delays until the retry budget is spent.
    pub async fn with_lock<T, Fut>(
        &self,
        resource: &str,
        task: impl FnOnce() -> Fut,
    ) -> Result<T, LockError>
    where
        Fut: Future<Output = T>,
    {
        let mut attempts = 0u32;
        let lease = loop {
            match self.acquire(resource).await? {
                Some(lease) => break lease,
                None => {
                    attempts += 1;
                    if attempts > self.cfg.retry_count {
                        return Err(LockError::Timeout);
                    }
                    tokio::time::sleep(self.retry_delay()).await;
                }
            }
        };
        self.run_guarded(lease, task).await
    }

    /// Single-shot acquisition; `Busy` when the lease is held elsewhere.
    pub async fn try_with_lock<T, Fut>(
        &self,
        resource: &str,
        task: impl FnOnce() -> Fut,
    ) -> Result<T, LockError>
    where
        Fut: Future<Output = T>,
    {
        let lease = self.acquire(resource).await?.ok_or(LockError::Busy)?;
        self.run_guarded(lease, task).await
    }

    async fn acquire(&self, resource: &str) -> Result<Option<Lease>, redis::RedisError> {
        let key = lock_key(resource);
        let token = Uuid::new_v4().to_string();
        let mut conn = self.redis.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(self.cfg.lease_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.map(|_| Lease { key, token }))
    }

    async fn run_guarded<T, Fut>(&self, lease: Lease, task: impl FnOnce() -> Fut) -> Result<T, LockError>
    where
        Fut: Future<Output = T>,
    {
        let (abort_tx, mut abort_rx) = watch::channel(false);

        // Extender wakes shortly before the lease lapses and re-arms it; a
        // failed extension flips the abort flag the select below observes.
        let extender = {
            let extend = self.extend.clone();
            let mut conn = self.redis.clone();
            let key = lease.key.clone();
            let token = lease.token.clone();
            let lease_ms = self.cfg.lease_ms;
            let threshold_ms = self.cfg.extend_threshold_ms;
            tokio::spawn(async move {
                let period = Duration::from_millis(lease_ms.saturating_sub(threshold_ms).max(1));
                loop {
                    tokio::time::sleep(period).await;
                    let extended: Result<i64, _> = extend
                        .key(&key)
                        .arg(&token)
                        .arg(lease_ms)
                        .invoke_async(&mut conn)
                        .await;
                    match extended {
                        Ok(1) => continue,
                        Ok(_) | Err(_) => {
                            let _ = abort_tx.send(true);
                            return;
                        }
                    }
                }
            })
        };

        let outcome = tokio::select! {
            value = task() => Ok(value),
            _ = abort_rx.wait_for(|aborted| *aborted) => Err(LockError::Aborted),
        };

        // Detach the extender before releasing so its final failed extension
        // does not log teardown noise against a deliberately deleted key.
        extender.abort();

        let mut conn = self.redis.clone();
        let released: Result<i64, _> = self
            .release
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await;
        if let Err(e) = released {
            tracing::warn!(key = %lease.key, error = %e, "Lock release failed");
        }

        outcome
    }

    fn retry_delay(&self) -> Duration {
        jittered_delay(&self.cfg, &mut rand::rng())
    }
}

fn lock_key(resource: &str) -> String {
    format!("lock:{resource}")
}

fn jittered_delay(cfg: &LockConfig, rng: &mut impl Rng) -> Duration {
    let jitter = cfg.retry_jitter_ms as i64;
    let offset = rng.random_range(-jitter..=jitter);
    let ms = (cfg.retry_delay_ms as i64 + offset).max(0) as u64;
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_namespaced() {
        assert_eq!(lock_key("room:r1"), "lock:room:r1");
    }

    #[test]
    fn retry_delay_stays_within_jitter_band() {
        let cfg = LockConfig::default();
        let mut rng = rand::rng();
        for _ in 0..1000 {
            let delay = jittered_delay(&cfg, &mut rng).as_millis() as u64;
            assert!(delay >= cfg.retry_delay_ms - cfg.retry_jitter_ms);
            assert!(delay <= cfg.retry_delay_ms + cfg.retry_jitter_ms);
        }
    }

    #[test]
    fn retry_delay_never_goes_negative() {
        let cfg = LockConfig {
            retry_delay_ms: 10,
            retry_jitter_ms: 100,
            ..LockConfig::default()
        };
        let mut rng = rand::rng();
        for _ in 0..1000 {
            // i64 math clamps at zero rather than wrapping
            let _ = jittered_delay(&cfg, &mut rng);
        }
    }
}
