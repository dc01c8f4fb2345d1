//! Identity provider adapters: the core abstraction for verification backends
//!
//! Every provider (Persona, Onfido, ...) implements `ProviderAdapter` to
//! translate session creation, webhook parsing and signature checks into
//! the canonical shapes the lifecycle engine works with.

use crate::error::{KycError, Result};
use crate::types::{ProviderKind, ProviderResult, SessionInfo, VerificationLevel};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

mod http;
pub mod onfido;
pub mod persona;

pub use http::ProviderHttp;
pub use onfido::OnfidoAdapter;
pub use persona::PersonaAdapter;

/// Replay information carried by a signature header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureTimestamp {
    /// Unix seconds the provider stamped on the delivery
    Present(i64),
    /// The scheme requires a timestamp but the header had none
    Missing,
    /// The scheme has no timestamp; no replay window can be applied
    NotApplicable,
}

/// Core trait for identity provider backends
///
/// Network calls are bounded by the adapter's timeout and surface non-2xx
/// responses as `KycError::Provider`. Adapters never retry; retry policy
/// belongs to the caller.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which provider this adapter speaks to
    fn kind(&self) -> ProviderKind;

    /// Open a provider-side session for a new verification attempt
    async fn create_session(
        &self,
        user_id: &str,
        level: VerificationLevel,
        redirect_url: Option<&str>,
    ) -> Result<SessionInfo>;

    /// Issue a fresh session token for an existing inquiry
    async fn resume_session(&self, external_inquiry_id: &str) -> Result<String>;

    /// Check the HMAC over the raw body against the signature header
    fn verify_signature(&self, raw_body: &[u8], signature_header: &str) -> bool;

    /// Extract the replay timestamp from the signature header
    fn signature_timestamp(&self, signature_header: &str) -> SignatureTimestamp;

    /// Map a webhook payload onto the canonical result
    fn parse_webhook(&self, payload: &serde_json::Value) -> Result<ProviderResult>;

    /// Provider name for logging
    fn name(&self) -> &str {
        self.kind().as_str()
    }
}

/// Registered adapters keyed by provider
#[derive(Clone, Default)]
pub struct ProviderSet {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same provider
    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| KycError::Config(format!("Provider '{}' is not configured", kind)))
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.adapters.keys().copied().collect()
    }
}

/// Read a string at a JSON pointer, if present
pub(crate) fn str_at<'a>(value: &'a serde_json::Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(|v| v.as_str())
}

/// Read a required string at a JSON pointer
pub(crate) fn require_str<'a>(
    value: &'a serde_json::Value,
    pointer: &str,
    provider: ProviderKind,
) -> Result<&'a str> {
    str_at(value, pointer).ok_or_else(|| {
        KycError::Validation(format!(
            "{} payload missing '{}'",
            provider, pointer
        ))
    })
}
