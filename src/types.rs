//! Core verification types for the a3s-kyc system
//!
//! All structs use camelCase JSON serialization for wire compatibility.
//! Enum variants use the SCREAMING_SNAKE_CASE names persisted by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Ordinal verification tier
///
/// `None` means "no verification exists"; no record is ever created at it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationLevel {
    #[default]
    None = 0,
    Basic = 1,
    Enhanced = 2,
}

impl VerificationLevel {
    /// All levels, lowest first
    pub const ALL: [VerificationLevel; 3] = [
        VerificationLevel::None,
        VerificationLevel::Basic,
        VerificationLevel::Enhanced,
    ];

    /// Ordinal value (0, 1, 2)
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// The level that must be approved before this one can be started
    pub fn prerequisite(self) -> Option<VerificationLevel> {
        match self {
            VerificationLevel::Enhanced => Some(VerificationLevel::Basic),
            _ => None,
        }
    }

    /// The next tier up, if any
    pub fn next(self) -> Option<VerificationLevel> {
        match self {
            VerificationLevel::None => Some(VerificationLevel::Basic),
            VerificationLevel::Basic => Some(VerificationLevel::Enhanced),
            VerificationLevel::Enhanced => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VerificationLevel::None => "NONE",
            VerificationLevel::Basic => "BASIC",
            VerificationLevel::Enhanced => "ENHANCED",
        }
    }
}

impl fmt::Display for VerificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a verification record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Pending,
    UnderReview,
    Approved,
    Rejected,
    Expired,
    RequiresAction,
}

impl VerificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationStatus::Pending => "PENDING",
            VerificationStatus::UnderReview => "UNDER_REVIEW",
            VerificationStatus::Approved => "APPROVED",
            VerificationStatus::Rejected => "REJECTED",
            VerificationStatus::Expired => "EXPIRED",
            VerificationStatus::RequiresAction => "REQUIRES_ACTION",
        }
    }

    /// Terminal for the record; the user may still open a new attempt
    pub fn is_closed(self) -> bool {
        matches!(self, VerificationStatus::Rejected | VerificationStatus::Expired)
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity provider backing a verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Persona,
    Onfido,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Persona => "persona",
            ProviderKind::Onfido => "onfido",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One verification attempt for a (user, level) pair
///
/// Holds provider correlation handles only, never documents or raw PII.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRecord {
    /// Unique record identifier (kyc-<uuid>)
    pub id: String,

    pub user_id: String,

    pub level: VerificationLevel,

    pub status: VerificationStatus,

    pub provider: ProviderKind,

    /// Provider-side verification/applicant handle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_verification_id: Option<String>,

    /// Provider-side inquiry / workflow run handle used to correlate webhooks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_inquiry_id: Option<String>,

    /// Client session token for the provider widget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,

    /// Set together with `approved_at`; kept after expiry for audit reconstruction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,

    /// Opaque provider data for audit only
    #[serde(default)]
    pub provider_metadata: HashMap<String, serde_json::Value>,

    /// Prior attempts at this (user, level) + 1, fixed at creation
    pub attempt_count: u32,

    /// Optimistic concurrency version, bumped by the store on every update
    #[serde(default)]
    pub version: u64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl VerificationRecord {
    /// Create a new PENDING record with an auto-generated id
    pub fn new(
        user_id: impl Into<String>,
        level: VerificationLevel,
        provider: ProviderKind,
        attempt_count: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("kyc-{}", uuid::Uuid::new_v4()),
            user_id: user_id.into(),
            level,
            status: VerificationStatus::Pending,
            provider,
            external_verification_id: None,
            external_inquiry_id: None,
            session_token: None,
            approved_at: None,
            expires_at: None,
            rejection_reason: None,
            provider_metadata: HashMap::new(),
            attempt_count,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Approved and not past its expiry at `now`
    ///
    /// Computed inline so callers see expiry before the sweep flips `status`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == VerificationStatus::Approved
            && self.expires_at.map_or(true, |expires_at| expires_at > now)
    }

    /// Approved but due for the expiry sweep at `now`
    pub fn is_due_for_expiry(&self, now: DateTime<Utc>) -> bool {
        self.status == VerificationStatus::Approved
            && self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Provider-agnostic verification outcome
///
/// Every adapter maps its own status vocabulary onto these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalStatus {
    Approved,
    Declined,
    NeedsReview,
    Pending,
    /// Session abandoned or expired on the provider side; the user must resume
    RequiresAction,
}

impl CanonicalStatus {
    /// Record status this outcome drives the record towards
    pub fn target_status(self) -> VerificationStatus {
        match self {
            CanonicalStatus::Approved => VerificationStatus::Approved,
            CanonicalStatus::Declined => VerificationStatus::Rejected,
            CanonicalStatus::NeedsReview => VerificationStatus::UnderReview,
            CanonicalStatus::Pending => VerificationStatus::Pending,
            CanonicalStatus::RequiresAction => VerificationStatus::RequiresAction,
        }
    }
}

/// Canonical webhook result produced by a `ProviderAdapter`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResult {
    pub status: CanonicalStatus,

    /// Inquiry / workflow run id; matches `VerificationRecord::external_inquiry_id`
    pub external_id: String,

    /// Provider verification object id, when the payload carries one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_id: Option<String>,

    #[serde(default)]
    pub declined_reasons: Vec<String>,

    /// Provider status and event details kept for audit
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ProviderResult {
    pub fn new(status: CanonicalStatus, external_id: impl Into<String>) -> Self {
        Self {
            status,
            external_id: external_id.into(),
            verification_id: None,
            declined_reasons: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_declined_reason(mut self, reason: impl Into<String>) -> Self {
        self.declined_reasons.push(reason.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Handles returned by a provider when a session is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub external_inquiry_id: String,

    pub session_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget_url: Option<String>,

    /// Applicant / verification handle, when the provider issues one up front
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_verification_id: Option<String>,
}

/// Kind of entry in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Initiated,
    DocumentSubmitted,
    StatusChanged,
    LevelUpgraded,
    LevelDowngraded,
    Expired,
    RenewalStarted,
    WebhookReceived,
    LimitChecked,
    LimitExceeded,
}

/// Immutable, append-only audit record
///
/// `verification_id` is a weak reference; nothing enforces that it resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    /// Unique entry identifier (aud-<uuid>)
    pub id: String,

    pub user_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_id: Option<String>,

    pub action: AuditAction,

    /// Free-form details
    #[serde(default)]
    pub details: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(user_id: impl Into<String>, action: AuditAction, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("aud-{}", uuid::Uuid::new_v4()),
            user_id: user_id.into(),
            verification_id: None,
            action,
            details: serde_json::Value::Object(serde_json::Map::new()),
            ip_address: None,
            created_at: now,
        }
    }

    pub fn with_verification(mut self, verification_id: impl Into<String>) -> Self {
        self.verification_id = Some(verification_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_ip(mut self, ip_address: Option<String>) -> Self {
        self.ip_address = ip_address;
        self
    }
}
