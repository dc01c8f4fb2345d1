//! Inbound webhook verification
//!
//! Checks the replay window first, then the HMAC, both through the
//! provider's adapter. Every failure surfaces as the same
//! `KycError::Signature`; only the internal log says which check tripped.

use crate::clock::Clock;
use crate::error::{KycError, Result};
use crate::provider::{ProviderAdapter, SignatureTimestamp};
use crate::types::ProviderResult;
use std::sync::Arc;

/// Signature and replay-window validation for provider webhooks
#[derive(Clone)]
pub struct WebhookVerifier {
    clock: Arc<dyn Clock>,
    replay_window_secs: i64,
}

impl WebhookVerifier {
    pub fn new(clock: Arc<dyn Clock>, replay_window_secs: i64) -> Self {
        Self {
            clock,
            replay_window_secs,
        }
    }

    pub fn replay_window_secs(&self) -> i64 {
        self.replay_window_secs
    }

    /// Verify freshness and signature of a raw delivery
    pub fn verify(
        &self,
        adapter: &dyn ProviderAdapter,
        raw_body: &[u8],
        signature_header: &str,
    ) -> Result<()> {
        if let Some(reason) = self.replay_rejection(adapter.signature_timestamp(signature_header)) {
            tracing::warn!(provider = adapter.name(), reason, "Webhook rejected");
            return Err(KycError::Signature);
        }

        if !adapter.verify_signature(raw_body, signature_header) {
            tracing::warn!(
                provider = adapter.name(),
                reason = "signature mismatch",
                "Webhook rejected"
            );
            return Err(KycError::Signature);
        }

        Ok(())
    }

    /// Verify, decode, and map a delivery onto the canonical result
    pub fn verify_and_parse(
        &self,
        adapter: &dyn ProviderAdapter,
        raw_body: &[u8],
        signature_header: &str,
    ) -> Result<ProviderResult> {
        self.verify(adapter, raw_body, signature_header)?;
        let payload: serde_json::Value = serde_json::from_slice(raw_body).map_err(|e| {
            KycError::Validation(format!("Webhook body is not valid JSON: {}", e))
        })?;
        adapter.parse_webhook(&payload)
    }

    fn replay_rejection(&self, timestamp: SignatureTimestamp) -> Option<&'static str> {
        match timestamp {
            SignatureTimestamp::NotApplicable => None,
            SignatureTimestamp::Missing => Some("missing timestamp"),
            SignatureTimestamp::Present(stamped) => {
                let age = self.clock.now().timestamp() - stamped;
                if age > self.replay_window_secs {
                    Some("stale timestamp")
                } else if age < -self.replay_window_secs {
                    Some("timestamp in the future")
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{OnfidoConfig, PersonaConfig};
    use crate::crypto;
    use crate::provider::{OnfidoAdapter, PersonaAdapter};
    use crate::types::CanonicalStatus;
    use chrono::{Duration, TimeZone, Utc};

    const SECRET: &str = "shared_secret";

    fn persona() -> PersonaAdapter {
        PersonaAdapter::new(
            PersonaConfig {
                api_key: "k".into(),
                webhook_secret: SECRET.into(),
                template_id: "itmpl".into(),
                base_url: "http://127.0.0.1:9".into(),
                api_version: "2023-01-05".into(),
            },
            std::time::Duration::from_secs(1),
        )
        .unwrap()
    }

    fn onfido() -> OnfidoAdapter {
        OnfidoAdapter::new(
            OnfidoConfig {
                api_token: "t".into(),
                webhook_secret: SECRET.into(),
                workflow_id: "wf".into(),
                base_url: "http://127.0.0.1:9".into(),
            },
            std::time::Duration::from_secs(1),
        )
        .unwrap()
    }

    fn persona_body() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "data": {"attributes": {"name": "inquiry.approved", "payload": {"data": {
                "type": "inquiry", "id": "inq_1", "attributes": {"status": "approved"}
            }}}}
        }))
        .unwrap()
    }

    fn persona_header(body: &[u8], t: i64) -> String {
        let mut message = format!("{}.", t).into_bytes();
        message.extend_from_slice(body);
        format!("t={},v1={}", t, crypto::sign_hex(SECRET.as_bytes(), &message))
    }

    fn setup() -> (WebhookVerifier, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        (WebhookVerifier::new(clock.clone(), 300), clock)
    }

    #[test]
    fn test_fresh_persona_delivery_is_accepted() {
        let (verifier, clock) = setup();
        let body = persona_body();
        let header = persona_header(&body, clock.now().timestamp() - 10);

        let result = verifier.verify_and_parse(&persona(), &body, &header).unwrap();
        assert_eq!(result.status, CanonicalStatus::Approved);
        assert_eq!(result.external_id, "inq_1");
    }

    #[test]
    fn test_stale_persona_delivery_is_rejected_despite_valid_mac() {
        let (verifier, clock) = setup();
        let body = persona_body();
        let header = persona_header(&body, clock.now().timestamp());
        assert!(verifier.verify(&persona(), &body, &header).is_ok());

        clock.advance(Duration::seconds(301));
        let err = verifier.verify(&persona(), &body, &header).unwrap_err();
        assert!(matches!(err, KycError::Signature));
    }

    #[test]
    fn test_future_timestamp_is_rejected() {
        let (verifier, clock) = setup();
        let body = persona_body();
        let header = persona_header(&body, clock.now().timestamp() + 3600);
        assert!(matches!(
            verifier.verify(&persona(), &body, &header),
            Err(KycError::Signature)
        ));
    }

    #[test]
    fn test_failures_are_indistinguishable() {
        let (verifier, clock) = setup();
        let body = persona_body();
        let now = clock.now().timestamp();

        let stale = verifier
            .verify(&persona(), &body, &persona_header(&body, now - 1000))
            .unwrap_err();
        let mut tampered = body.clone();
        tampered[5] ^= 0x01;
        let forged = verifier
            .verify(&persona(), &tampered, &persona_header(&body, now))
            .unwrap_err();
        let missing = verifier.verify(&persona(), &body, "v1=00").unwrap_err();

        assert_eq!(stale.to_string(), forged.to_string());
        assert_eq!(forged.to_string(), missing.to_string());
    }

    #[test]
    fn test_onfido_has_no_replay_window() {
        let (verifier, clock) = setup();
        let body = serde_json::to_vec(&serde_json::json!({"payload": {
            "resource_type": "workflow_run",
            "object": {"id": "wfr_1", "status": "approved"}
        }}))
        .unwrap();
        let header = crypto::sign_hex(SECRET.as_bytes(), &body);

        clock.advance(Duration::days(30));
        let result = verifier.verify_and_parse(&onfido(), &body, &header).unwrap();
        assert_eq!(result.external_id, "wfr_1");

        let mut tampered = body.clone();
        tampered[3] ^= 0x01;
        assert!(matches!(
            verifier.verify(&onfido(), &tampered, &header),
            Err(KycError::Signature)
        ));
    }

    #[test]
    fn test_signed_garbage_body_is_validation_error() {
        let (verifier, _) = setup();
        let body = b"not json";
        let header = crypto::sign_hex(SECRET.as_bytes(), body);
        let err = verifier.verify_and_parse(&onfido(), body, &header).unwrap_err();
        assert!(matches!(err, KycError::Validation(_)));
    }
}
