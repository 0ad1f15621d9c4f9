// src/providers/remote.rs
//! Bounded-retry remote invocation shared by every generation provider.
//!
//! Transient failures (connection errors, timeouts, 429, 5xx) retry with
//! exponential backoff: 1s, 2s, 4s, ... up to the attempt cap, then the last
//! error surfaces. Anything else is raised immediately.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::error::PipelineError;

/// Standard envelope every provider must answer with. A `success: false`
/// body is a fatal provider-logic error regardless of HTTP status.
#[derive(Debug, Deserialize)]
pub struct ProviderEnvelope {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub cost: Decimal,
    #[serde(default)]
    pub error: Option<String>,
}

/// One raw wire exchange, before retry classification.
#[derive(Debug, Clone)]
pub struct WireResponse {
    pub status: u16,
    pub body: String,
}

/// Failure to complete the exchange at all. Always retryable.
#[derive(Debug, Clone)]
pub struct WireError(pub String);

#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn send(&self, method: &str, endpoint: &str, payload: &Value) -> Result<WireResponse, WireError>;
}

/// Production transport over reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

#[async_trait]
impl ProviderTransport for HttpTransport {
    async fn send(&self, method: &str, endpoint: &str, payload: &Value) -> Result<WireResponse, WireError> {
        let mut request = match method {
            "GET" => self.client.get(endpoint),
            _ => self.client.post(endpoint).json(payload),
        };
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .timeout(Duration::from_secs(120))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WireError(format!("request timed out: {}", e))
                } else {
                    WireError(format!("connection error: {}", e))
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| WireError(format!("failed to read response body: {}", e)))?;

        Ok(WireResponse { status, body })
    }
}

pub struct RemoteClient {
    service: String,
    transport: Arc<dyn ProviderTransport>,
    max_attempts: u32,
}

impl RemoteClient {
    pub fn new(service: impl Into<String>, transport: Arc<dyn ProviderTransport>) -> Self {
        Self {
            service: service.into(),
            transport,
            max_attempts: 3,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Invoke a provider endpoint and return `(result, cost)` from its
    /// response envelope.
    pub async fn invoke(
        &self,
        method: &str,
        endpoint: &str,
        payload: &Value,
    ) -> Result<(Value, Decimal), PipelineError> {
        let mut attempt: u32 = 0;
        loop {
            match self.attempt(method, endpoint, payload).await {
                Ok(output) => return Ok(output),
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        tracing::error!(
                            "{} call failed after {} attempts: {}",
                            self.service,
                            attempt,
                            err
                        );
                        return Err(err);
                    }
                    let delay = Duration::from_secs(1u64 << (attempt - 1));
                    tracing::warn!(
                        "{} attempt {}/{} failed ({}), retrying in {:?}",
                        self.service,
                        attempt,
                        self.max_attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(
        &self,
        method: &str,
        endpoint: &str,
        payload: &Value,
    ) -> Result<(Value, Decimal), PipelineError> {
        let response = self
            .transport
            .send(method, endpoint, payload)
            .await
            .map_err(|WireError(message)| PipelineError::TransientRemote {
                service: self.service.clone(),
                message,
            })?;

        // An explicit failure envelope is fatal no matter the status code.
        if let Ok(envelope) = serde_json::from_str::<ProviderEnvelope>(&response.body) {
            if !envelope.success {
                return Err(PipelineError::ProviderLogic {
                    service: self.service.clone(),
                    message: envelope
                        .error
                        .unwrap_or_else(|| "provider reported failure".to_string()),
                });
            }
            if (200..300).contains(&response.status) {
                return Ok((envelope.result, envelope.cost));
            }
        }

        let snippet: String = response.body.chars().take(200).collect();
        if response.status == 429 || response.status >= 500 {
            return Err(PipelineError::TransientRemote {
                service: self.service.clone(),
                message: format!("status {}: {}", response.status, snippet),
            });
        }
        if !(200..300).contains(&response.status) {
            return Err(PipelineError::PermanentRemote {
                service: self.service.clone(),
                message: format!("status {}: {}", response.status, snippet),
            });
        }

        Err(PipelineError::PermanentRemote {
            service: self.service.clone(),
            message: format!("malformed response envelope: {}", snippet),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Transport that replays a scripted sequence of responses.
    struct ScriptedTransport {
        responses: Mutex<Vec<Result<WireResponse, WireError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<WireResponse, WireError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderTransport for ScriptedTransport {
        async fn send(&self, _method: &str, _endpoint: &str, _payload: &Value) -> Result<WireResponse, WireError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(WireError("script exhausted".to_string()));
            }
            responses.remove(0)
        }
    }

    fn ok_envelope() -> WireResponse {
        WireResponse {
            status: 200,
            body: r#"{"success":true,"result":{"data":"abc"},"cost":"0.25"}"#.to_string(),
        }
    }

    fn status(code: u16, body: &str) -> WireResponse {
        WireResponse {
            status: code,
            body: body.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_503s_then_success_backs_off_one_then_two_seconds() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(status(503, "unavailable")),
            Ok(status(503, "unavailable")),
            Ok(ok_envelope()),
        ]));
        let client = RemoteClient::new("image", transport.clone()).with_max_attempts(3);

        let start = tokio::time::Instant::now();
        let (result, cost) = client.invoke("POST", "/generate", &serde_json::json!({})).await.unwrap();

        assert_eq!(transport.calls(), 3);
        assert_eq!(result["data"], "abc");
        assert_eq!(cost, Decimal::new(25, 2));
        // Exactly two backoff delays: 1s then 2s.
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_404_makes_exactly_one_attempt() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(status(404, "no such model"))]));
        let client = RemoteClient::new("image", transport.clone()).with_max_attempts(3);

        let err = client.invoke("POST", "/generate", &serde_json::json!({})).await.unwrap_err();

        assert_eq!(transport.calls(), 1);
        assert_eq!(err.class(), "permanent_remote");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausting_the_cap_reraises_the_last_transient_error() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(status(500, "a")),
            Err(WireError("connection reset".to_string())),
            Ok(status(429, "slow down")),
        ]));
        let client = RemoteClient::new("voice", transport.clone()).with_max_attempts(3);

        let err = client.invoke("POST", "/speak", &serde_json::json!({})).await.unwrap_err();

        assert_eq!(transport.calls(), 3);
        assert_eq!(err.class(), "transient_remote");
        assert!(err.to_string().contains("429"), "last error surfaces: {}", err);
    }

    #[tokio::test]
    async fn test_failure_envelope_is_fatal_even_with_http_200() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(status(
            200,
            r#"{"success":false,"error":"prompt rejected"}"#,
        ))]));
        let client = RemoteClient::new("script", transport.clone()).with_max_attempts(3);

        let err = client.invoke("POST", "/write", &serde_json::json!({})).await.unwrap_err();

        assert_eq!(transport.calls(), 1);
        assert_eq!(err.class(), "provider_logic");
        assert!(err.to_string().contains("prompt rejected"));
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_permanent() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(status(200, "<html>oops</html>"))]));
        let client = RemoteClient::new("clip", transport.clone()).with_max_attempts(3);

        let err = client.invoke("POST", "/render", &serde_json::json!({})).await.unwrap_err();

        assert_eq!(transport.calls(), 1);
        assert_eq!(err.class(), "permanent_remote");
    }
}
