use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::{GatewayError, Result, truncate_detail};
use crate::metrics::{UPSTREAM_ATTEMPTS, UPSTREAM_RETRIES};

// One chat-completion service: where it lives, which model to ask for, how to authenticate.
#[derive(Debug, Clone)]
pub struct ModelEndpoint {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

impl ModelEndpoint {
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

// HTTP client that retries rate limits, 5xx responses and transport failures.
//
// All transient causes share a single budget of `max_attempts` calls. Attempt `n`
// (zero-based) that fails transiently is followed by a sleep of `backoff_base * 2^n`.
// The underlying `reqwest::Client` keeps a per-host connection pool and is cheap to clone.
#[derive(Debug, Clone)]
pub struct RetryingClient {
    http: reqwest::Client,
    max_attempts: u32,
    backoff_base: Duration,
}

impl RetryingClient {
    pub fn new(timeout: Duration, max_attempts: u32, backoff_base: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(20)
            .build()
            .map_err(|e| GatewayError::Configuration(format!("http client: {e}")))?;

        Ok(Self {
            http,
            max_attempts: max_attempts.max(1),
            backoff_base,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn backoff(&self, attempt: u32) -> Duration {
        backoff_delay(self.backoff_base, attempt)
    }

    pub async fn request<P, T>(&self, endpoint: &ModelEndpoint, payload: &P) -> Result<T>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = endpoint.completions_url();
        let mut last_error = String::from("no attempt made");

        for attempt in 0..self.max_attempts {
            UPSTREAM_ATTEMPTS.inc();

            let mut builder = self.http.post(&url).json(payload);
            if let Some(key) = &endpoint.api_key {
                builder = builder.bearer_auth(key);
            }

            match builder.send().await {
                Ok(res) if res.status() == StatusCode::OK => match res.bytes().await {
                    Ok(body) => {
                        return serde_json::from_slice(&body).map_err(|e| {
                            GatewayError::MalformedResponse(format!(
                                "{e}; body: {}",
                                truncate_detail(&String::from_utf8_lossy(&body))
                            ))
                        });
                    }
                    // timeout or reset mid-body: retried like a failed send
                    Err(e) => {
                        last_error = format!("reading body: {e}");
                        tracing::warn!(
                            url = %url,
                            error = %last_error,
                            "upstream body read failed (attempt {}/{})",
                            attempt + 1,
                            self.max_attempts
                        );
                    }
                },
                Ok(res) if is_transient(res.status()) => {
                    last_error = format!("status {}", res.status().as_u16());
                    tracing::warn!(
                        url = %url,
                        status = res.status().as_u16(),
                        "upstream transient failure (attempt {}/{})",
                        attempt + 1,
                        self.max_attempts
                    );
                }
                Ok(res) => {
                    let status = res.status().as_u16();
                    let body = res.text().await.unwrap_or_default();
                    let body = truncate_detail(&body);
                    tracing::error!(url = %url, status, body = %body, "upstream rejected request");
                    return Err(GatewayError::Upstream { status, body });
                }
                Err(e) => {
                    last_error = if e.is_timeout() {
                        format!("timed out: {e}")
                    } else {
                        e.to_string()
                    };
                    tracing::warn!(
                        url = %url,
                        error = %last_error,
                        "upstream request error (attempt {}/{})",
                        attempt + 1,
                        self.max_attempts
                    );
                }
            }

            if attempt + 1 < self.max_attempts {
                let wait = self.backoff(attempt);
                UPSTREAM_RETRIES.inc();
                tracing::info!("retrying {} in {:?}", url, wait);
                tokio::time::sleep(wait).await;
            }
        }

        Err(GatewayError::ExhaustedRetries {
            attempts: self.max_attempts,
            last_error,
        })
    }
}

// Sleep after zero-based attempt `attempt`: base * 2^attempt
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
