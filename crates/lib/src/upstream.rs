//! Upstream prediction client (Flowise-style API).
//!
//! Forwards one user utterance per call and returns the reply text. The
//! upstream is treated as untrusted and possibly slow: every attempt has a
//! request timeout, failures retry with a fixed delay, and exhaustion is a
//! typed error the gateway turns into a fallback reply rather than a
//! disconnect.

use anyhow::Context;
use serde::Serialize;
use std::time::Duration;

use crate::config::UpstreamConfig;

/// Health probe timeout; independent of the prediction request timeout.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounds on configured attempts.
const MIN_RETRIES: u32 = 3;
const MAX_RETRIES: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Every attempt ran into the request timeout.
    #[error("upstream request timed out")]
    Timeout,
    /// Attempts exhausted; `reason` carries the last failure.
    #[error("upstream unavailable after {attempts} attempts: {reason}")]
    UpstreamUnavailable { attempts: u32, reason: String },
}

/// Why one attempt failed; timeouts are tracked separately so exhaustion
/// can report them as such.
enum AttemptError {
    Timeout,
    Failed(String),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => f.write_str("request timed out"),
            Self::Failed(reason) => f.write_str(reason),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictionRequest<'a> {
    question: &'a str,
    session_id: &'a str,
}

/// Bounded-retry client for the upstream prediction endpoint.
#[derive(Clone)]
pub struct UpstreamClient {
    base_url: String,
    flow_id: String,
    max_retries: u32,
    retry_delay: Duration,
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building upstream HTTP client")?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            flow_id: config.flow_id.clone(),
            max_retries: config.max_retries.clamp(MIN_RETRIES, MAX_RETRIES),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            client,
        })
    }

    fn prediction_url(&self) -> String {
        format!("{}/api/v1/prediction/{}", self.base_url, self.flow_id)
    }

    /// Forward `content` to the upstream and return its reply text. Retries
    /// timeouts, transport errors, non-2xx responses, and unparseable bodies
    /// up to the configured attempt count, sleeping the fixed delay between
    /// attempts.
    pub async fn forward(&self, content: &str, session_id: &str) -> Result<String, ProxyError> {
        let mut timeouts = 0;
        let mut last_reason = String::new();
        for attempt in 1..=self.max_retries {
            match self.attempt(content, session_id).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    log::warn!(
                        "upstream attempt {}/{} failed: {}",
                        attempt,
                        self.max_retries,
                        e
                    );
                    if matches!(e, AttemptError::Timeout) {
                        timeouts += 1;
                    }
                    last_reason = e.to_string();
                }
            }
            if attempt < self.max_retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        if timeouts == self.max_retries {
            return Err(ProxyError::Timeout);
        }
        Err(ProxyError::UpstreamUnavailable {
            attempts: self.max_retries,
            reason: last_reason,
        })
    }

    /// One POST. The error is the retry loop's failure reason.
    async fn attempt(&self, content: &str, session_id: &str) -> Result<String, AttemptError> {
        let body = PredictionRequest {
            question: content,
            session_id,
        };
        let res = self
            .client
            .post(self.prediction_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AttemptError::Timeout
                } else {
                    AttemptError::Failed(format!("upstream request failed: {e}"))
                }
            })?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(AttemptError::Failed(format!(
                "upstream returned {status}: {body}"
            )));
        }
        let value: serde_json::Value = res
            .json()
            .await
            .map_err(|e| AttemptError::Failed(format!("upstream body is not JSON: {e}")))?;
        Ok(reply_text(value))
    }

    /// Out-of-band liveness probe. Never affects `forward`'s retry state.
    pub async fn health(&self) -> bool {
        let url = format!("{}/api/v1/health", self.base_url);
        match self.client.get(url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(res) => res.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Reply text from a decoded 2xx body: the `text` field when present,
/// otherwise the whole value's string form (schema drift tolerance).
fn reply_text(value: serde_json::Value) -> String {
    if let Some(text) = value.get("text").and_then(|t| t.as_str()) {
        return text.to_string();
    }
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_text_prefers_text_field() {
        assert_eq!(reply_text(json!({"text": "hi", "extra": 1})), "hi");
    }

    #[test]
    fn reply_text_falls_back_to_body_string_form() {
        assert_eq!(reply_text(json!({"answer": "hi"})), r#"{"answer":"hi"}"#);
        assert_eq!(reply_text(json!("bare string")), "bare string");
    }

    #[test]
    fn retries_are_clamped_to_contract_range() {
        let mut config = UpstreamConfig::default();
        config.max_retries = 1;
        assert_eq!(UpstreamClient::new(&config).unwrap().max_retries, 3);
        config.max_retries = 50;
        assert_eq!(UpstreamClient::new(&config).unwrap().max_retries, 10);
    }

    #[test]
    fn prediction_url_shape() {
        let mut config = UpstreamConfig::default();
        config.base_url = "http://flowise:3000/".to_string();
        config.flow_id = "flow-1".to_string();
        let client = UpstreamClient::new(&config).unwrap();
        assert_eq!(
            client.prediction_url(),
            "http://flowise:3000/api/v1/prediction/flow-1"
        );
    }
}
