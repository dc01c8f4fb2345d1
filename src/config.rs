//! Engine configuration
//!
//! Loaded from TOML. Every field has a default so a partial file is valid.

use crate::error::{KycError, Result};
use crate::limits::LimitTable;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Top-level settings for the verification engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KycConfig {
    /// Validity window of an approval in days (default: 365)
    #[serde(default = "default_approval_ttl_days")]
    pub approval_ttl_days: i64,

    /// Maximum age of a timestamped webhook signature (default: 300)
    #[serde(default = "default_replay_window_secs")]
    pub replay_window_secs: i64,

    /// Bound on every outbound provider call (default: 15)
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    /// Interval between expiry sweeps (default: one day)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// How long a losing concurrent start waits for the winner's session (default: 15000)
    #[serde(default = "default_pending_wait_ms")]
    pub pending_wait_ms: u64,

    /// Monthly USD limit per level
    #[serde(default)]
    pub limits: LimitTable,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<PersonaConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onfido: Option<OnfidoConfig>,
}

fn default_approval_ttl_days() -> i64 {
    365
}

fn default_replay_window_secs() -> i64 {
    300
}

fn default_provider_timeout_secs() -> u64 {
    15
}

fn default_sweep_interval_secs() -> u64 {
    86_400
}

fn default_pending_wait_ms() -> u64 {
    15_000
}

impl Default for KycConfig {
    fn default() -> Self {
        Self {
            approval_ttl_days: default_approval_ttl_days(),
            replay_window_secs: default_replay_window_secs(),
            provider_timeout_secs: default_provider_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            pending_wait_ms: default_pending_wait_ms(),
            limits: LimitTable::default(),
            persona: None,
            onfido: None,
        }
    }
}

impl KycConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: KycConfig = toml::from_str(content)
            .map_err(|e| KycError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            KycError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject values that would disable a safety bound
    pub fn validate(&self) -> Result<()> {
        if self.approval_ttl_days <= 0 {
            return Err(KycError::Config("approval_ttl_days must be > 0".to_string()));
        }
        if self.replay_window_secs <= 0 {
            return Err(KycError::Config("replay_window_secs must be > 0".to_string()));
        }
        if self.provider_timeout_secs == 0 {
            return Err(KycError::Config("provider_timeout_secs must be > 0".to_string()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(KycError::Config("sweep_interval_secs must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn approval_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.approval_ttl_days)
    }

    pub fn provider_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Persona credentials and endpoints
#[derive(Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    /// Bearer API key
    pub api_key: String,

    /// Shared secret for `Persona-Signature`
    pub webhook_secret: String,

    /// Inquiry template used for new sessions
    pub template_id: String,

    #[serde(default = "default_persona_base_url")]
    pub base_url: String,

    #[serde(default = "default_persona_api_version")]
    pub api_version: String,
}

fn default_persona_base_url() -> String {
    "https://withpersona.com/api/v1".to_string()
}

fn default_persona_api_version() -> String {
    "2023-01-05".to_string()
}

impl fmt::Debug for PersonaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersonaConfig")
            .field("api_key", &"<redacted>")
            .field("webhook_secret", &"<redacted>")
            .field("template_id", &self.template_id)
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .finish()
    }
}

/// Onfido credentials and endpoints
#[derive(Clone, Serialize, Deserialize)]
pub struct OnfidoConfig {
    /// `Token token=...` API credential
    pub api_token: String,

    /// Shared secret for `X-SHA2-Signature`
    pub webhook_secret: String,

    /// Studio workflow started for each session
    pub workflow_id: String,

    #[serde(default = "default_onfido_base_url")]
    pub base_url: String,
}

fn default_onfido_base_url() -> String {
    "https://api.eu.onfido.com/v3.6".to_string()
}

impl fmt::Debug for OnfidoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnfidoConfig")
            .field("api_token", &"<redacted>")
            .field("webhook_secret", &"<redacted>")
            .field("workflow_id", &self.workflow_id)
            .field("base_url", &self.base_url)
            .finish()
    }
}
