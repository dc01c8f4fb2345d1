//! Shared HTTP plumbing for provider adapters

use crate::error::{KycError, Result};
use crate::types::ProviderKind;
use std::time::Duration;

/// Longest upstream error body kept in an error message
const MAX_ERROR_BODY: usize = 256;

/// Time-bounded JSON client for one provider
///
/// Non-2xx responses become `KycError::Provider` with the upstream status
/// and message; exceeding the bound becomes `KycError::Timeout`.
#[derive(Clone)]
pub struct ProviderHttp {
    client: reqwest::Client,
    provider: ProviderKind,
    timeout: Duration,
}

impl ProviderHttp {
    pub fn new(provider: ProviderKind, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KycError::Config(format!("Failed to build {} HTTP client: {}", provider, e)))?;
        Ok(Self {
            client,
            provider,
            timeout,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a request and decode the JSON response body
    pub async fn send(&self, request: reqwest::RequestBuilder) -> Result<serde_json::Value> {
        let call = async {
            let response = request.send().await.map_err(|e| self.transport_error(e))?;
            let status = response.status();
            let body = response.text().await.map_err(|e| self.transport_error(e))?;

            if !status.is_success() {
                let message = error_message(&body);
                tracing::error!(
                    provider = %self.provider,
                    status = status.as_u16(),
                    message = %message,
                    "Provider request failed"
                );
                return Err(KycError::Provider {
                    provider: self.provider,
                    status: status.as_u16(),
                    message,
                });
            }

            if body.trim().is_empty() {
                return Ok(serde_json::Value::Null);
            }
            Ok(serde_json::from_str(&body)?)
        };

        tokio::time::timeout(self.timeout, call).await.map_err(|_| {
            tracing::error!(
                provider = %self.provider,
                timeout_secs = self.timeout.as_secs(),
                "Provider request timed out"
            );
            KycError::Timeout(format!(
                "{} request exceeded {}s",
                self.provider,
                self.timeout.as_secs()
            ))
        })?
    }

    fn transport_error(&self, e: reqwest::Error) -> KycError {
        if e.is_timeout() {
            return KycError::Timeout(format!("{} request timed out: {}", self.provider, e));
        }
        tracing::error!(provider = %self.provider, error = %e, "Provider transport failure");
        KycError::Provider {
            provider: self.provider,
            status: e.status().map(|s| s.as_u16()).unwrap_or(0),
            message: e.to_string(),
        }
    }
}

/// Pull a human-readable message out of an upstream error body
///
/// Understands Persona (`errors[].title/details`) and Onfido
/// (`error.message`) shapes; falls back to the truncated raw body.
pub(crate) fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(errors) = value.get("errors").and_then(|e| e.as_array()) {
            let messages: Vec<String> = errors
                .iter()
                .filter_map(|e| {
                    e.get("details")
                        .or_else(|| e.get("title"))
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                })
                .collect();
            if !messages.is_empty() {
                return messages.join("; ");
            }
        }
        if let Some(message) = value.pointer("/error/message").and_then(|m| m.as_str()) {
            return message.to_string();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    trimmed.chars().take(MAX_ERROR_BODY).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persona_error_shape() {
        let body = r#"{"errors":[{"title":"Bad request","details":"template not found"}]}"#;
        assert_eq!(error_message(body), "template not found");
    }

    #[test]
    fn test_onfido_error_shape() {
        let body = r#"{"error":{"type":"validation_error","message":"There was a validation error"}}"#;
        assert_eq!(error_message(body), "There was a validation error");
    }

    #[test]
    fn test_raw_body_fallback() {
        assert_eq!(error_message("Bad Gateway"), "Bad Gateway");
        assert_eq!(error_message("  "), "empty response body");
        assert_eq!(error_message(&"x".repeat(1000)).len(), MAX_ERROR_BODY);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_provider_error() {
        let http = ProviderHttp::new(ProviderKind::Persona, Duration::from_secs(2)).unwrap();
        // Port 9 (discard) on loopback is closed in test environments
        let request = http.client().get("http://127.0.0.1:9/inquiries");
        let err = http.send(request).await.unwrap_err();
        assert!(err.is_provider());
    }
}
