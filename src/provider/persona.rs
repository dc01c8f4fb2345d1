//! Persona inquiry adapter
//!
//! Sessions are Persona inquiries created from a template and resumed for a
//! fresh session token. Webhooks arrive as an event envelope whose
//! `data.attributes.payload.data` is the inquiry object.
//!
//! Signature header: `Persona-Signature: t=<unix>,v1=<hex>`, where the MAC
//! covers `"<t>.<raw body>"`. Several `v1` entries may be present while a
//! secret is being rotated; any match is accepted.

use super::{require_str, str_at, ProviderAdapter, ProviderHttp, SignatureTimestamp};
use crate::config::PersonaConfig;
use crate::crypto;
use crate::error::{KycError, Result};
use crate::types::{CanonicalStatus, ProviderKind, ProviderResult, SessionInfo, VerificationLevel};
use async_trait::async_trait;
use std::time::Duration;

/// Header carrying the webhook signature
pub const SIGNATURE_HEADER: &str = "Persona-Signature";

/// Persona inquiry status → canonical outcome
pub const STATUS_TABLE: &[(&str, CanonicalStatus)] = &[
    ("created", CanonicalStatus::Pending),
    ("pending", CanonicalStatus::Pending),
    ("completed", CanonicalStatus::NeedsReview),
    ("needs_review", CanonicalStatus::NeedsReview),
    ("approved", CanonicalStatus::Approved),
    ("declined", CanonicalStatus::Declined),
    ("failed", CanonicalStatus::Declined),
    ("expired", CanonicalStatus::RequiresAction),
];

/// Map a Persona inquiry status onto the canonical outcome
pub fn map_status(status: &str) -> Option<CanonicalStatus> {
    let normalized = status.trim().to_ascii_lowercase().replace('-', "_");
    STATUS_TABLE
        .iter()
        .find(|(name, _)| *name == normalized)
        .map(|(_, canonical)| *canonical)
}

/// Parsed `Persona-Signature` header
#[derive(Debug, Clone, PartialEq, Eq)]
struct SignatureHeader {
    timestamp: Option<i64>,
    signatures: Vec<String>,
}

fn parse_signature_header(header: &str) -> SignatureHeader {
    let mut parsed = SignatureHeader {
        timestamp: None,
        signatures: Vec::new(),
    };
    for part in header.split(|c: char| c == ',' || c.is_whitespace()) {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => parsed.timestamp = value.parse().ok(),
            "v1" if !value.is_empty() => parsed.signatures.push(value.to_string()),
            _ => {}
        }
    }
    parsed
}

/// Persona adapter
pub struct PersonaAdapter {
    config: PersonaConfig,
    http: ProviderHttp,
}

impl PersonaAdapter {
    pub fn new(config: PersonaConfig, timeout: Duration) -> Result<Self> {
        let http = ProviderHttp::new(ProviderKind::Persona, timeout)?;
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .client()
            .post(self.url(path))
            .bearer_auth(&self.config.api_key)
            .header("Persona-Version", &self.config.api_version)
            .header("Key-Inflection", "kebab")
    }

    /// Request body for a new inquiry
    pub fn inquiry_body(&self, user_id: &str, level: VerificationLevel, redirect_url: Option<&str>) -> serde_json::Value {
        let mut attributes = serde_json::json!({
            "inquiry-template-id": self.config.template_id,
            "reference-id": user_id,
            "tags": [format!("kyc-level-{}", level.as_str().to_ascii_lowercase())],
        });
        if let Some(redirect_url) = redirect_url {
            attributes["redirect-uri"] = serde_json::Value::String(redirect_url.to_string());
        }
        serde_json::json!({ "data": { "attributes": attributes } })
    }

    /// Hosted flow URL for an inquiry
    pub fn widget_url(&self, inquiry_id: &str) -> String {
        format!("https://withpersona.com/verify?inquiry-id={}", inquiry_id)
    }

    fn signed_message(timestamp: i64, raw_body: &[u8]) -> Vec<u8> {
        let prefix = format!("{}.", timestamp);
        let mut message = Vec::with_capacity(prefix.len() + raw_body.len());
        message.extend_from_slice(prefix.as_bytes());
        message.extend_from_slice(raw_body);
        message
    }
}

#[async_trait]
impl ProviderAdapter for PersonaAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Persona
    }

    async fn create_session(
        &self,
        user_id: &str,
        level: VerificationLevel,
        redirect_url: Option<&str>,
    ) -> Result<SessionInfo> {
        let body = self.inquiry_body(user_id, level, redirect_url);
        let created = self.http.send(self.post("/inquiries").json(&body)).await?;
        let inquiry_id = require_str(&created, "/data/id", ProviderKind::Persona)?.to_string();

        tracing::info!(
            user_id = %user_id,
            level = %level,
            inquiry_id = %inquiry_id,
            "Persona inquiry created"
        );

        let session_token = self.resume_session(&inquiry_id).await?;
        Ok(SessionInfo {
            widget_url: Some(self.widget_url(&inquiry_id)),
            external_inquiry_id: inquiry_id,
            session_token,
            external_verification_id: None,
        })
    }

    async fn resume_session(&self, external_inquiry_id: &str) -> Result<String> {
        let path = format!("/inquiries/{}/resume", external_inquiry_id);
        let resumed = self.http.send(self.post(&path)).await?;
        let token = require_str(&resumed, "/meta/session-token", ProviderKind::Persona)?;

        tracing::debug!(inquiry_id = %external_inquiry_id, "Persona inquiry resumed");
        Ok(token.to_string())
    }

    fn verify_signature(&self, raw_body: &[u8], signature_header: &str) -> bool {
        let header = parse_signature_header(signature_header);
        let Some(timestamp) = header.timestamp else {
            return false;
        };
        let message = Self::signed_message(timestamp, raw_body);
        header
            .signatures
            .iter()
            .any(|sig| crypto::verify_hex(self.config.webhook_secret.as_bytes(), &message, sig))
    }

    fn signature_timestamp(&self, signature_header: &str) -> SignatureTimestamp {
        match parse_signature_header(signature_header).timestamp {
            Some(timestamp) => SignatureTimestamp::Present(timestamp),
            None => SignatureTimestamp::Missing,
        }
    }

    fn parse_webhook(&self, payload: &serde_json::Value) -> Result<ProviderResult> {
        let event_name = str_at(payload, "/data/attributes/name").unwrap_or_default();
        let inquiry = payload
            .pointer("/data/attributes/payload/data")
            .ok_or_else(|| {
                KycError::Validation("Persona payload missing inquiry object".to_string())
            })?;

        let object_type = str_at(inquiry, "/type").unwrap_or_default();
        if object_type != "inquiry" {
            return Err(KycError::Validation(format!(
                "Unsupported Persona webhook object '{}'",
                object_type
            )));
        }

        let inquiry_id = require_str(inquiry, "/id", ProviderKind::Persona)?;
        let raw_status = require_str(inquiry, "/attributes/status", ProviderKind::Persona)?;
        let status = map_status(raw_status).ok_or_else(|| {
            KycError::Validation(format!("Unsupported Persona inquiry status '{}'", raw_status))
        })?;

        let included = payload
            .pointer("/data/attributes/payload/included")
            .and_then(|v| v.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default();

        let verification_id = included
            .iter()
            .find(|item| str_at(item, "/type").is_some_and(|t| t.starts_with("verification")))
            .and_then(|item| str_at(item, "/id"))
            .map(str::to_string);

        let mut result = ProviderResult::new(status, inquiry_id)
            .with_metadata("providerStatus", raw_status.into())
            .with_metadata("event", event_name.into());
        result.verification_id = verification_id;

        if status == CanonicalStatus::Declined {
            for item in included {
                let checks = item
                    .pointer("/attributes/checks")
                    .and_then(|c| c.as_array())
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                for check in checks {
                    if str_at(check, "/status") == Some("failed") {
                        if let Some(name) = str_at(check, "/name") {
                            result = result.with_declined_reason(name);
                        }
                    }
                }
            }
        }

        Ok(result)
    }
}
