//! Verification lifecycle engine
//!
//! `LifecycleEngine` drives records through the state machine in
//! [`crate::state`]. It holds no mutable state of its own: records live in
//! the `VerificationStore`, and every write is a version-checked
//! read-modify-write that is re-evaluated on conflict.
//!
//! Mutating operations run on a spawned task, so a caller that stops
//! awaiting does not interrupt a transition halfway.
//!
//! Dedup rule for repeated provider results: when the record already has
//! the target status, provider fields are refreshed but no STATUS_CHANGED
//! entry is written and no event is published. Each approval therefore
//! produces exactly one APPROVED event.

use crate::audit::{AuditLogger, AuditSink};
use crate::clock::Clock;
use crate::config::KycConfig;
use crate::error::{KycError, Result};
use crate::events::{LifecycleEvent, LifecycleEventKind, LifecyclePublisher};
use crate::guard::{GuardDecision, KycGuard, KycRequirement};
use crate::limits::{LimitCheck, LimitEnforcer, LimitPolicy, UsageSource};
use crate::provider::ProviderSet;
use crate::state::{self, Step, TransitionSource};
use crate::store::VerificationStore;
use crate::types::{
    AuditAction, AuditLogEntry, ProviderKind, ProviderResult, VerificationLevel,
    VerificationRecord, VerificationStatus,
};
use crate::webhook::WebhookVerifier;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Attempts at a version-checked update before giving up
const MAX_CONFLICT_RETRIES: usize = 5;

/// Poll interval while waiting for a concurrent start to finish
const PENDING_POLL_INTERVAL: Duration = Duration::from_millis(25);

const DEFAULT_DECLINE_REASON: &str = "Verification declined by provider";
const DEFAULT_MANUAL_REJECT_REASON: &str = "Rejected by manual review";

/// Result of `start_verification`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub record: VerificationRecord,

    /// Hosted flow URL, only known when a new session was created
    pub widget_url: Option<String>,

    /// True when an existing PENDING inquiry was resumed
    pub resumed: bool,
}

/// Result of `handle_webhook`
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    /// The result was applied (or refreshed an already-final record)
    Applied(VerificationRecord),
    /// No record carries this correlation id
    Unmatched { external_id: String },
    /// The record's current status does not accept this result
    Ignored {
        verification_id: String,
        reason: String,
    },
}

/// Snapshot of a user's verification standing
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KycStatus {
    pub user_id: String,

    pub active_level: VerificationLevel,

    /// Latest record per level, lowest level first
    pub latest: Vec<VerificationRecord>,

    /// Level the user may start next, if any
    pub next_level: Option<VerificationLevel>,
}

/// Orchestrates verification start, resume, provider results and reviews
#[derive(Clone)]
pub struct LifecycleEngine {
    store: Arc<dyn VerificationStore>,
    providers: ProviderSet,
    verifier: WebhookVerifier,
    audit: AuditLogger,
    publisher: Arc<dyn LifecyclePublisher>,
    limits: LimitEnforcer,
    clock: Arc<dyn Clock>,
    config: Arc<KycConfig>,
}

impl LifecycleEngine {
    /// Wire an engine from its collaborators
    pub fn new(
        config: KycConfig,
        store: Arc<dyn VerificationStore>,
        providers: ProviderSet,
        audit_sink: Arc<dyn AuditSink>,
        publisher: Arc<dyn LifecyclePublisher>,
        usage: Arc<dyn UsageSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let audit = AuditLogger::new(audit_sink);
        let verifier = WebhookVerifier::new(clock.clone(), config.replay_window_secs);
        let limits = LimitEnforcer::new(
            store.clone(),
            usage,
            LimitPolicy::new(config.limits.clone()),
            audit.clone(),
            clock.clone(),
        );

        Self {
            store,
            providers,
            verifier,
            audit,
            publisher,
            limits,
            clock,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &Arc<dyn VerificationStore> {
        &self.store
    }

    pub fn limits(&self) -> &LimitEnforcer {
        &self.limits
    }

    pub fn verifier(&self) -> &WebhookVerifier {
        &self.verifier
    }

    /// Route guard backed by this engine's limit enforcer
    pub fn guard(&self) -> KycGuard {
        KycGuard::new(self.limits.clone())
    }

    pub fn config(&self) -> &KycConfig {
        &self.config
    }

    /// Current time as seen by the engine's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ─── Start & Resume ──────────────────────────────────────────

    /// Open (or resume) a verification for `user_id` at `level`
    pub async fn start_verification(
        &self,
        user_id: &str,
        level: VerificationLevel,
        provider: ProviderKind,
        redirect_url: Option<&str>,
    ) -> Result<StartOutcome> {
        let engine = self.clone();
        let user_id = user_id.to_string();
        let redirect_url = redirect_url.map(str::to_string);
        self.run_to_completion(async move {
            engine
                .start_inner(&user_id, level, provider, redirect_url.as_deref())
                .await
        })
        .await
    }

    async fn start_inner(
        &self,
        user_id: &str,
        level: VerificationLevel,
        provider: ProviderKind,
        redirect_url: Option<&str>,
    ) -> Result<StartOutcome> {
        if level == VerificationLevel::None {
            return Err(KycError::Validation(
                "Cannot start a verification at level NONE".to_string(),
            ));
        }
        let adapter = self.providers.get(provider)?;
        self.check_prerequisite(user_id, level).await?;

        if let Some(pending) = self
            .store
            .find_by_user_level_status(user_id, level, VerificationStatus::Pending)
            .await?
        {
            if pending.external_inquiry_id.is_some() {
                tracing::info!(
                    user_id = %user_id,
                    level = %level,
                    verification_id = %pending.id,
                    "Pending verification exists, resuming"
                );
                return self.resumed(&pending).await;
            }
            return self.await_concurrent_start(user_id, level).await;
        }

        // A record waiting on the user can go back to PENDING; keep it the only open one
        if let Some(open) = self
            .store
            .find_by_user_level_status(user_id, level, VerificationStatus::RequiresAction)
            .await?
            .filter(|r| r.external_inquiry_id.is_some())
        {
            tracing::info!(
                user_id = %user_id,
                level = %level,
                verification_id = %open.id,
                "Verification awaiting user action, resuming"
            );
            return self.resumed(&open).await;
        }

        let attempts = self.store.count_for_user_level(user_id, level).await?;
        let history = self.store.list_for_user(user_id).await?;
        let is_renewal = history.iter().any(|r| {
            r.level == level
                && matches!(r.status, VerificationStatus::Approved | VerificationStatus::Expired)
        });

        let now = self.clock.now();
        let record = VerificationRecord::new(user_id, level, provider, attempts + 1, now);
        let record = match self.store.create(record).await {
            Ok(record) => record,
            Err(KycError::DuplicatePending { .. }) => {
                tracing::info!(
                    user_id = %user_id,
                    level = %level,
                    "Lost concurrent start, falling back to resume"
                );
                return self.await_concurrent_start(user_id, level).await;
            }
            Err(e) => return Err(e),
        };

        let session = match adapter.create_session(user_id, level, redirect_url).await {
            Ok(session) => session,
            Err(e) => {
                self.roll_back(&record).await;
                return Err(e);
            }
        };

        let mut with_session = record.clone();
        with_session.external_inquiry_id = Some(session.external_inquiry_id.clone());
        with_session.external_verification_id = session.external_verification_id.clone();
        with_session.session_token = Some(session.session_token.clone());
        with_session.updated_at = self.clock.now();
        let record = match self.store.update(with_session).await {
            Ok(record) => record,
            Err(e) => {
                self.roll_back(&record).await;
                return Err(e);
            }
        };

        tracing::info!(
            user_id = %user_id,
            level = %level,
            provider = %provider,
            verification_id = %record.id,
            attempt = record.attempt_count,
            "Verification started"
        );

        self.audit
            .record(
                AuditLogEntry::new(user_id, AuditAction::Initiated, now)
                    .with_verification(&record.id)
                    .with_details(serde_json::json!({
                        "level": level,
                        "provider": provider,
                        "attemptCount": record.attempt_count,
                        "externalInquiryId": session.external_inquiry_id,
                    })),
            )
            .await;
        if is_renewal {
            self.audit
                .record(
                    AuditLogEntry::new(user_id, AuditAction::RenewalStarted, now)
                        .with_verification(&record.id)
                        .with_details(serde_json::json!({ "level": level })),
                )
                .await;
        }

        self.publisher.publish(
            LifecycleEvent::new(LifecycleEventKind::Initiated, user_id, level, &record.id, now)
                .with("provider", provider.as_str())
                .with("attemptCount", record.attempt_count),
        );

        Ok(StartOutcome {
            record,
            widget_url: session.widget_url,
            resumed: false,
        })
    }

    /// Issue a fresh session token for a record's existing inquiry
    ///
    /// Status and attempt count are left untouched.
    pub async fn resume(&self, record: &VerificationRecord) -> Result<VerificationRecord> {
        let engine = self.clone();
        let record = record.clone();
        self.run_to_completion(async move { engine.resume_inner(&record).await })
            .await
    }

    async fn resume_inner(&self, record: &VerificationRecord) -> Result<VerificationRecord> {
        let inquiry_id = record.external_inquiry_id.clone().ok_or_else(|| {
            KycError::Validation(format!(
                "Verification '{}' has no provider inquiry to resume",
                record.id
            ))
        })?;
        let adapter = self.providers.get(record.provider)?;
        let token = adapter.resume_session(&inquiry_id).await?;
        let now = self.clock.now();

        let (stored, _) = self
            .mutate(&record.id, |r| {
                r.session_token = Some(token.clone());
                r.updated_at = now;
                Ok(Some(()))
            })
            .await?;

        tracing::info!(
            user_id = %stored.user_id,
            verification_id = %stored.id,
            inquiry_id = %inquiry_id,
            "Verification session resumed"
        );
        Ok(stored)
    }

    async fn resumed(&self, record: &VerificationRecord) -> Result<StartOutcome> {
        let record = self.resume_inner(record).await?;
        Ok(StartOutcome {
            record,
            widget_url: None,
            resumed: true,
        })
    }

    /// Wait for the winner of a create race to attach its inquiry, then resume it
    async fn await_concurrent_start(
        &self,
        user_id: &str,
        level: VerificationLevel,
    ) -> Result<StartOutcome> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.pending_wait_ms);

        loop {
            match self
                .store
                .find_by_user_level_status(user_id, level, VerificationStatus::Pending)
                .await?
            {
                Some(pending) if pending.external_inquiry_id.is_some() => {
                    return self.resumed(&pending).await;
                }
                Some(_) => {}
                None => {
                    return Err(KycError::NotFound(format!(
                        "Concurrent {} verification for user '{}' did not complete",
                        level, user_id
                    )));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(KycError::Timeout(format!(
                    "Timed out waiting for concurrent {} verification of user '{}'",
                    level, user_id
                )));
            }
            tokio::time::sleep(PENDING_POLL_INTERVAL).await;
        }
    }

    async fn roll_back(&self, record: &VerificationRecord) {
        match self.store.delete(&record.id).await {
            Ok(()) => tracing::warn!(
                user_id = %record.user_id,
                verification_id = %record.id,
                "Verification start rolled back"
            ),
            Err(e) => tracing::error!(
                user_id = %record.user_id,
                verification_id = %record.id,
                error = %e,
                "Failed to roll back verification start"
            ),
        }
    }

    async fn check_prerequisite(&self, user_id: &str, level: VerificationLevel) -> Result<()> {
        let Some(required) = level.prerequisite() else {
            return Ok(());
        };
        let now = self.clock.now();
        let satisfied = self
            .store
            .list_for_user(user_id)
            .await?
            .iter()
            .any(|record| record.level == required && record.is_active_at(now));

        if !satisfied {
            return Err(KycError::Policy(format!(
                "{} verification requires an active {} approval",
                level, required
            )));
        }
        Ok(())
    }

    // ─── Provider Results ────────────────────────────────────────

    /// Verify, parse and apply a raw provider webhook
    ///
    /// Unknown correlation ids and results the record can no longer accept
    /// are logged and reported as outcomes, not errors, so the provider does
    /// not keep redelivering.
    pub async fn handle_webhook(
        &self,
        provider: ProviderKind,
        raw_body: &[u8],
        signature_header: &str,
        ip_address: Option<&str>,
    ) -> Result<WebhookOutcome> {
        let adapter = self.providers.get(provider)?;
        let result = self
            .verifier
            .verify_and_parse(adapter.as_ref(), raw_body, signature_header)?;

        let record = match self.store.find_by_external_inquiry(&result.external_id).await? {
            Some(record) if record.provider == provider => record,
            _ => {
                tracing::warn!(
                    provider = %provider,
                    external_id = %result.external_id,
                    "Webhook for unknown verification, ignoring"
                );
                return Ok(WebhookOutcome::Unmatched {
                    external_id: result.external_id,
                });
            }
        };

        self.audit
            .record(
                AuditLogEntry::new(&record.user_id, AuditAction::WebhookReceived, self.clock.now())
                    .with_verification(&record.id)
                    .with_ip(ip_address.map(str::to_string))
                    .with_details(serde_json::json!({
                        "provider": provider,
                        "externalId": result.external_id,
                        "result": result.status,
                        "providerStatus": result.metadata.get("providerStatus"),
                    })),
            )
            .await;

        match self.apply_provider_result(&record, &result).await {
            Ok(updated) => Ok(WebhookOutcome::Applied(updated)),
            Err(KycError::Validation(reason)) => {
                tracing::warn!(
                    verification_id = %record.id,
                    reason = %reason,
                    "Webhook result not applicable, ignoring"
                );
                Ok(WebhookOutcome::Ignored {
                    verification_id: record.id,
                    reason,
                })
            }
            Err(e @ KycError::DuplicatePending { .. }) => {
                tracing::warn!(
                    verification_id = %record.id,
                    error = %e,
                    "Another verification is already pending, ignoring webhook"
                );
                Ok(WebhookOutcome::Ignored {
                    verification_id: record.id,
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Apply a canonical provider result to a record
    pub async fn apply_provider_result(
        &self,
        record: &VerificationRecord,
        result: &ProviderResult,
    ) -> Result<VerificationRecord> {
        let engine = self.clone();
        let id = record.id.clone();
        let user_id = record.user_id.clone();
        let result = result.clone();
        self.run_to_completion(async move { engine.apply_inner(&id, &user_id, &result).await })
            .await
    }

    async fn apply_inner(
        &self,
        id: &str,
        user_id: &str,
        result: &ProviderResult,
    ) -> Result<VerificationRecord> {
        let target = result.status.target_status();
        let now = self.clock.now();
        let ttl = self.config.approval_ttl();
        let previous_level = self.limits.active_level(user_id).await?;
        let reason = decline_reason(result);

        let (stored, change) = self
            .mutate(id, |r| {
                let step = state::step(r.status, target, TransitionSource::Provider)?;
                let from = r.status;

                if let Some(verification_id) = &result.verification_id {
                    r.external_verification_id = Some(verification_id.clone());
                }
                merge_metadata(r, result);
                if target == VerificationStatus::Rejected {
                    r.rejection_reason = Some(reason.clone());
                }

                if step == Step::Transition {
                    r.status = target;
                    if target == VerificationStatus::Approved {
                        r.approved_at = Some(now);
                        r.expires_at = Some(now + ttl);
                        r.rejection_reason = None;
                    }
                }
                r.updated_at = now;
                Ok(Some((from, step)))
            })
            .await?;

        let Some((from, Step::Transition)) = change else {
            tracing::debug!(
                verification_id = %stored.id,
                status = %stored.status,
                "Provider result already applied, fields refreshed"
            );
            return Ok(stored);
        };

        tracing::info!(
            user_id = %stored.user_id,
            verification_id = %stored.id,
            from = %from,
            to = %stored.status,
            "Verification status changed"
        );

        self.audit
            .record(
                AuditLogEntry::new(&stored.user_id, AuditAction::StatusChanged, now)
                    .with_verification(&stored.id)
                    .with_details(serde_json::json!({
                        "from": from,
                        "to": stored.status,
                        "provider": stored.provider,
                        "externalId": result.external_id,
                        "manual": false,
                    })),
            )
            .await;

        match stored.status {
            VerificationStatus::UnderReview => {
                self.audit
                    .record(
                        AuditLogEntry::new(&stored.user_id, AuditAction::DocumentSubmitted, now)
                            .with_verification(&stored.id)
                            .with_details(serde_json::json!({ "provider": stored.provider })),
                    )
                    .await;
            }
            VerificationStatus::Approved => {
                self.announce_approval(&stored, previous_level, now).await?;
            }
            VerificationStatus::Rejected => self.announce_rejection(&stored, now),
            _ => {}
        }

        Ok(stored)
    }

    // ─── Manual Review ───────────────────────────────────────────

    /// Admin override: set APPROVED or REJECTED directly
    pub async fn manual_review(
        &self,
        verification_id: &str,
        status: VerificationStatus,
        reviewed_by: &str,
        notes: Option<&str>,
    ) -> Result<VerificationRecord> {
        let engine = self.clone();
        let id = verification_id.to_string();
        let reviewed_by = reviewed_by.to_string();
        let notes = notes.map(str::to_string);
        self.run_to_completion(async move {
            engine
                .manual_review_inner(&id, status, &reviewed_by, notes.as_deref())
                .await
        })
        .await
    }

    async fn manual_review_inner(
        &self,
        id: &str,
        status: VerificationStatus,
        reviewed_by: &str,
        notes: Option<&str>,
    ) -> Result<VerificationRecord> {
        if !matches!(status, VerificationStatus::Approved | VerificationStatus::Rejected) {
            return Err(KycError::Validation(format!(
                "Manual review can only approve or reject, got {}",
                status
            )));
        }

        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| KycError::NotFound(format!("Verification not found: {}", id)))?;
        let previous_level = self.limits.active_level(&record.user_id).await?;
        let now = self.clock.now();
        let ttl = self.config.approval_ttl();

        let (stored, change) = self
            .mutate(id, |r| {
                let step = state::step(r.status, status, TransitionSource::Manual)?;
                let from = r.status;
                if step == Step::Transition {
                    r.status = status;
                    match status {
                        VerificationStatus::Approved => {
                            r.approved_at = Some(now);
                            r.expires_at = Some(now + ttl);
                            r.rejection_reason = None;
                        }
                        _ => {
                            r.rejection_reason = Some(
                                notes.unwrap_or(DEFAULT_MANUAL_REJECT_REASON).to_string(),
                            );
                        }
                    }
                } else if let (VerificationStatus::Rejected, Some(notes)) = (status, notes) {
                    r.rejection_reason = Some(notes.to_string());
                }
                r.updated_at = now;
                Ok(Some((from, step)))
            })
            .await?;

        let Some((from, Step::Transition)) = change else {
            tracing::debug!(
                verification_id = %stored.id,
                status = %stored.status,
                "Manual review matches current status"
            );
            return Ok(stored);
        };

        tracing::info!(
            user_id = %stored.user_id,
            verification_id = %stored.id,
            from = %from,
            to = %stored.status,
            reviewed_by = %reviewed_by,
            "Verification manually reviewed"
        );

        self.audit
            .record(
                AuditLogEntry::new(&stored.user_id, AuditAction::StatusChanged, now)
                    .with_verification(&stored.id)
                    .with_details(serde_json::json!({
                        "from": from,
                        "to": stored.status,
                        "manual": true,
                        "reviewedBy": reviewed_by,
                        "notes": notes,
                    })),
            )
            .await;

        if stored.status == VerificationStatus::Approved {
            self.announce_approval(&stored, previous_level, now).await?;
        } else {
            self.announce_rejection(&stored, now);
        }

        Ok(stored)
    }

    // ─── Expiry ──────────────────────────────────────────────────

    /// Move an APPROVED record past its `expires_at` to EXPIRED
    ///
    /// Returns `None` when the record is no longer due (already expired,
    /// overridden, or renewed), which makes repeated sweeps no-ops.
    pub async fn expire(&self, verification_id: &str) -> Result<Option<VerificationRecord>> {
        let engine = self.clone();
        let id = verification_id.to_string();
        self.run_to_completion(async move { engine.expire_inner(&id).await })
            .await
    }

    async fn expire_inner(&self, id: &str) -> Result<Option<VerificationRecord>> {
        let now = self.clock.now();
        let (stored, change) = self
            .mutate(id, |r| {
                if !r.is_due_for_expiry(now) {
                    return Ok(None);
                }
                state::step(r.status, VerificationStatus::Expired, TransitionSource::Scheduler)?;
                r.status = VerificationStatus::Expired;
                r.updated_at = now;
                Ok(Some(()))
            })
            .await?;

        if change.is_none() {
            return Ok(None);
        }

        tracing::info!(
            user_id = %stored.user_id,
            verification_id = %stored.id,
            level = %stored.level,
            "Verification expired"
        );

        self.audit
            .record(
                AuditLogEntry::new(&stored.user_id, AuditAction::Expired, now)
                    .with_verification(&stored.id)
                    .with_details(serde_json::json!({
                        "level": stored.level,
                        "expiresAt": stored.expires_at,
                    })),
            )
            .await;

        let active = self.limits.active_level(&stored.user_id).await?;
        if active < stored.level {
            self.audit
                .record(
                    AuditLogEntry::new(&stored.user_id, AuditAction::LevelDowngraded, now)
                        .with_verification(&stored.id)
                        .with_details(serde_json::json!({
                            "from": stored.level,
                            "to": active,
                        })),
                )
                .await;
        }

        self.publisher.publish(
            LifecycleEvent::new(
                LifecycleEventKind::Expired,
                &stored.user_id,
                stored.level,
                &stored.id,
                now,
            )
            .with("activeLevel", active.as_str()),
        );

        Ok(Some(stored))
    }

    // ─── Queries ─────────────────────────────────────────────────

    /// Highest level with a currently valid approval
    pub async fn active_level(&self, user_id: &str) -> Result<VerificationLevel> {
        self.limits.active_level(user_id).await
    }

    /// Check a requested amount against the user's monthly limit
    pub async fn check_monthly_limit(&self, user_id: &str, requested_usd: f64) -> Result<LimitCheck> {
        self.limits.check_monthly_limit(user_id, requested_usd).await
    }

    /// Check a route requirement for `user_id`; see [`KycGuard::authorize`]
    pub async fn authorize(
        &self,
        user_id: &str,
        requirement: &KycRequirement,
        amount_usd: Option<f64>,
    ) -> Result<GuardDecision> {
        self.guard().authorize(user_id, requirement, amount_usd).await
    }

    pub async fn get(&self, verification_id: &str) -> Result<VerificationRecord> {
        self.store
            .get(verification_id)
            .await?
            .ok_or_else(|| KycError::NotFound(format!("Verification not found: {}", verification_id)))
    }

    /// Active level, latest record per level, and the next startable level
    pub async fn status(&self, user_id: &str) -> Result<KycStatus> {
        let records = self.store.list_for_user(user_id).await?;
        let now = self.clock.now();
        let active_level = crate::limits::active_level(&records, now);

        let latest: Vec<VerificationRecord> = VerificationLevel::ALL
            .iter()
            .filter_map(|level| records.iter().find(|r| r.level == *level).cloned())
            .collect();

        Ok(KycStatus {
            user_id: user_id.to_string(),
            active_level,
            latest,
            next_level: active_level.next(),
        })
    }

    /// A user's audit trail, newest first
    pub async fn history(&self, user_id: &str, limit: usize) -> Result<Vec<AuditLogEntry>> {
        self.audit.history(user_id, limit).await
    }

    // ─── Internals ───────────────────────────────────────────────

    async fn announce_approval(
        &self,
        record: &VerificationRecord,
        previous_level: VerificationLevel,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let active = self.limits.active_level(&record.user_id).await?;

        if active > previous_level {
            self.audit
                .record(
                    AuditLogEntry::new(&record.user_id, AuditAction::LevelUpgraded, now)
                        .with_verification(&record.id)
                        .with_details(serde_json::json!({
                            "from": previous_level,
                            "to": active,
                        })),
                )
                .await;
        }

        self.publisher.publish(
            LifecycleEvent::new(
                LifecycleEventKind::Approved,
                &record.user_id,
                record.level,
                &record.id,
                now,
            )
            .with("provider", record.provider.as_str())
            .with("expiresAt", record.expires_at.map(|e| e.to_rfc3339())),
        );
        self.publisher.publish(
            LifecycleEvent::new(
                LifecycleEventKind::LevelChanged,
                &record.user_id,
                active,
                &record.id,
                now,
            )
            .with("previousLevel", previous_level.as_str()),
        );
        Ok(())
    }

    fn announce_rejection(&self, record: &VerificationRecord, now: DateTime<Utc>) {
        self.publisher.publish(
            LifecycleEvent::new(
                LifecycleEventKind::Rejected,
                &record.user_id,
                record.level,
                &record.id,
                now,
            )
            .with("reason", record.rejection_reason.clone()),
        );
    }

    /// Version-checked read-modify-write
    ///
    /// `apply` runs against the freshest copy on every attempt; returning
    /// `Ok(None)` skips the write.
    async fn mutate<T, F>(&self, id: &str, mut apply: F) -> Result<(VerificationRecord, Option<T>)>
    where
        F: FnMut(&mut VerificationRecord) -> Result<Option<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut record = self
                .store
                .get(id)
                .await?
                .ok_or_else(|| KycError::NotFound(format!("Verification not found: {}", id)))?;

            let Some(outcome) = apply(&mut record)? else {
                return Ok((record, None));
            };

            match self.store.update(record).await {
                Ok(stored) => return Ok((stored, Some(outcome))),
                Err(KycError::Conflict { expected, actual, .. }) if attempt < MAX_CONFLICT_RETRIES => {
                    tracing::debug!(
                        verification_id = %id,
                        expected,
                        actual,
                        attempt,
                        "Version conflict, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run a mutation on its own task so it finishes even if the caller goes away
    async fn run_to_completion<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(operation).await.map_err(|e| {
            tracing::error!(error = %e, "Lifecycle task aborted");
            KycError::Persistence(format!("Lifecycle task aborted: {}", e))
        })?
    }
}

fn decline_reason(result: &ProviderResult) -> String {
    if result.declined_reasons.is_empty() {
        DEFAULT_DECLINE_REASON.to_string()
    } else {
        result.declined_reasons.join(", ")
    }
}

/// Copy provider metadata onto the record, never keeping session credentials
fn merge_metadata(record: &mut VerificationRecord, result: &ProviderResult) {
    for (key, value) in &result.metadata {
        let lowered = key.to_ascii_lowercase();
        if lowered.contains("token") || lowered.contains("session") {
            continue;
        }
        record.provider_metadata.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CanonicalStatus;

    #[test]
    fn test_decline_reason() {
        let result = ProviderResult::new(CanonicalStatus::Declined, "inq_1");
        assert_eq!(decline_reason(&result), DEFAULT_DECLINE_REASON);

        let result = result
            .with_declined_reason("id_expired")
            .with_declined_reason("selfie_mismatch");
        assert_eq!(decline_reason(&result), "id_expired, selfie_mismatch");
    }

    #[test]
    fn test_metadata_never_keeps_tokens() {
        let mut record = VerificationRecord::new(
            "u1",
            VerificationLevel::Basic,
            ProviderKind::Persona,
            1,
            Utc::now(),
        );
        let result = ProviderResult::new(CanonicalStatus::Approved, "inq_1")
            .with_metadata("providerStatus", "approved".into())
            .with_metadata("session-token", "secret".into())
            .with_metadata("sdkToken", "secret".into());

        merge_metadata(&mut record, &result);
        assert_eq!(record.provider_metadata.len(), 1);
        assert_eq!(record.provider_metadata["providerStatus"], "approved");
    }
}
