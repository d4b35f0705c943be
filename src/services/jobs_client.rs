use std::time::Duration;

use serde::Deserialize;

use crate::config::JobsConfig;

/// Statuses worth retrying, applied to every verb the client issues.
const RETRYABLE_STATUSES: [u16; 7] = [408, 413, 429, 500, 502, 503, 504];

fn is_retryable(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobIdsResponse {
    data: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    message: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    status_code: Option<u16>,
    #[serde(default)]
    #[allow(dead_code)]
    timestamp: Option<String>,
}

/// Client for the external jobs service. A user's room list comes from
/// `GET {base_url}/jobs/ids` with their bearer token.
pub struct JobsClient {
    http: reqwest::Client,
    base_url: String,
    max_retries: u32,
}

impl JobsClient {
    pub fn new(cfg: &JobsConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            max_retries: cfg.max_retries,
        })
    }

    /// Room ids the user should auto-join. Non-2xx after retries is fatal
    /// for the requesting connection.
    pub async fn fetch_job_ids(&self, token: &str) -> anyhow::Result<Vec<String>> {
        let url = format!("{}/jobs/ids", self.base_url);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self
                .http
                .get(&url)
                .bearer_auth(token)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    let body: JobIdsResponse = resp.json().await?;
                    return Ok(body.data);
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if is_retryable(status) && attempt <= self.max_retries {
                        tracing::warn!(status, attempt, "Jobs service returned retryable status");
                        tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                        continue;
                    }
                    anyhow::bail!("jobs service responded with status {status}");
                }
                Err(e) => {
                    if attempt <= self.max_retries {
                        tracing::warn!(error = %e, attempt, "Jobs service request failed");
                        tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_match_policy() {
        for status in [408, 413, 429, 500, 502, 503, 504] {
            assert!(is_retryable(status), "{status} must be retryable");
        }
        for status in [400, 401, 403, 404, 422] {
            assert!(!is_retryable(status), "{status} must not be retried");
        }
    }

    #[test]
    fn response_parses_service_envelope() {
        let body: JobIdsResponse = serde_json::from_str(
            r#"{"data":["r1","r2"],"message":"ok","statusCode":200,"timestamp":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(body.data, vec!["r1", "r2"]);
    }
}
