//! Onfido Studio workflow adapter
//!
//! A session is an applicant plus a workflow run; the run id is the
//! inquiry handle and its `sdk_token` the session token. Webhooks carry
//! `payload.resource_type`, which must be `workflow_run`.
//!
//! Signature header: `X-SHA2-Signature: <hex>`, a bare HMAC-SHA256 of the
//! raw body. Onfido does not stamp deliveries, so no replay window can be
//! enforced for this provider.

use super::{require_str, str_at, ProviderAdapter, ProviderHttp, SignatureTimestamp};
use crate::config::OnfidoConfig;
use crate::crypto;
use crate::error::{KycError, Result};
use crate::types::{CanonicalStatus, ProviderKind, ProviderResult, SessionInfo, VerificationLevel};
use async_trait::async_trait;
use std::time::Duration;

/// Header carrying the webhook signature
pub const SIGNATURE_HEADER: &str = "X-SHA2-Signature";

/// The only webhook resource this adapter accepts
pub const WORKFLOW_RUN_RESOURCE: &str = "workflow_run";

/// Onfido workflow run status → canonical outcome
pub const STATUS_TABLE: &[(&str, CanonicalStatus)] = &[
    ("awaiting_input", CanonicalStatus::Pending),
    ("processing", CanonicalStatus::Pending),
    ("review", CanonicalStatus::NeedsReview),
    ("approved", CanonicalStatus::Approved),
    ("declined", CanonicalStatus::Declined),
    ("error", CanonicalStatus::Declined),
    ("abandoned", CanonicalStatus::RequiresAction),
];

/// Map an Onfido workflow run status onto the canonical outcome
pub fn map_status(status: &str) -> Option<CanonicalStatus> {
    let normalized = status.trim().to_ascii_lowercase();
    STATUS_TABLE
        .iter()
        .find(|(name, _)| *name == normalized)
        .map(|(_, canonical)| *canonical)
}

/// Onfido adapter
pub struct OnfidoAdapter {
    config: OnfidoConfig,
    http: ProviderHttp,
}

impl OnfidoAdapter {
    pub fn new(config: OnfidoConfig, timeout: Duration) -> Result<Self> {
        let http = ProviderHttp::new(ProviderKind::Onfido, timeout)?;
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header(
            reqwest::header::AUTHORIZATION,
            format!("Token token={}", self.config.api_token),
        )
    }

    /// Request body for a new workflow run
    pub fn workflow_run_body(
        &self,
        applicant_id: &str,
        user_id: &str,
        level: VerificationLevel,
        redirect_url: Option<&str>,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "workflow_id": self.config.workflow_id,
            "applicant_id": applicant_id,
            "custom_data": { "user_id": user_id, "kyc_level": level.as_str() },
        });
        if let Some(redirect_url) = redirect_url {
            body["link"] = serde_json::json!({ "completed_redirect_url": redirect_url });
        }
        body
    }
}

#[async_trait]
impl ProviderAdapter for OnfidoAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Onfido
    }

    async fn create_session(
        &self,
        user_id: &str,
        level: VerificationLevel,
        redirect_url: Option<&str>,
    ) -> Result<SessionInfo> {
        let applicant = self
            .http
            .send(
                self.authorize(self.http.client().post(self.url("/applicants")))
                    .json(&serde_json::json!({})),
            )
            .await?;
        let applicant_id = require_str(&applicant, "/id", ProviderKind::Onfido)?.to_string();

        let body = self.workflow_run_body(&applicant_id, user_id, level, redirect_url);
        let run = self
            .http
            .send(
                self.authorize(self.http.client().post(self.url("/workflow_runs")))
                    .json(&body),
            )
            .await?;
        let run_id = require_str(&run, "/id", ProviderKind::Onfido)?.to_string();
        let sdk_token = require_str(&run, "/sdk_token", ProviderKind::Onfido)?.to_string();

        tracing::info!(
            user_id = %user_id,
            level = %level,
            workflow_run_id = %run_id,
            "Onfido workflow run created"
        );

        Ok(SessionInfo {
            external_inquiry_id: run_id,
            session_token: sdk_token,
            widget_url: str_at(&run, "/link/url").map(str::to_string),
            external_verification_id: Some(applicant_id),
        })
    }

    async fn resume_session(&self, external_inquiry_id: &str) -> Result<String> {
        let path = format!("/workflow_runs/{}", external_inquiry_id);
        let run = self
            .http
            .send(self.authorize(self.http.client().get(self.url(&path))))
            .await?;
        let applicant_id = require_str(&run, "/applicant_id", ProviderKind::Onfido)?;

        let token = self
            .http
            .send(
                self.authorize(self.http.client().post(self.url("/sdk_token")))
                    .json(&serde_json::json!({ "applicant_id": applicant_id })),
            )
            .await?;

        tracing::debug!(workflow_run_id = %external_inquiry_id, "Onfido SDK token reissued");
        Ok(require_str(&token, "/token", ProviderKind::Onfido)?.to_string())
    }

    fn verify_signature(&self, raw_body: &[u8], signature_header: &str) -> bool {
        crypto::verify_hex(self.config.webhook_secret.as_bytes(), raw_body, signature_header)
    }

    fn signature_timestamp(&self, _signature_header: &str) -> SignatureTimestamp {
        SignatureTimestamp::NotApplicable
    }

    fn parse_webhook(&self, payload: &serde_json::Value) -> Result<ProviderResult> {
        let resource_type = str_at(payload, "/payload/resource_type").unwrap_or_default();
        if resource_type != WORKFLOW_RUN_RESOURCE {
            return Err(KycError::Validation(format!(
                "Unsupported Onfido webhook resource '{}'",
                resource_type
            )));
        }

        let object = payload.pointer("/payload/object").ok_or_else(|| {
            KycError::Validation("Onfido payload missing object".to_string())
        })?;
        let run_id = require_str(object, "/id", ProviderKind::Onfido)?;
        let raw_status = require_str(object, "/status", ProviderKind::Onfido)?;
        let status = map_status(raw_status).ok_or_else(|| {
            KycError::Validation(format!("Unsupported Onfido workflow status '{}'", raw_status))
        })?;

        let mut result = ProviderResult::new(status, run_id)
            .with_metadata("providerStatus", raw_status.into())
            .with_metadata(
                "action",
                str_at(payload, "/payload/action").unwrap_or_default().into(),
            );
        if let Some(completed_at) = str_at(object, "/completed_at_iso8601") {
            result = result.with_metadata("completedAt", completed_at.into());
        }

        if status == CanonicalStatus::Declined {
            let reasons = object
                .get("reasons")
                .and_then(|r| r.as_array())
                .map(Vec::as_slice)
                .unwrap_or_default();
            for reason in reasons.iter().filter_map(|r| r.as_str()) {
                result = result.with_declined_reason(reason);
            }
            if raw_status == "error" && result.declined_reasons.is_empty() {
                result = result.with_declined_reason("workflow_error");
            }
        }

        Ok(result)
    }
}
