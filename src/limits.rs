//! Tier limits and monthly usage enforcement
//!
//! The limit table maps each verification level to a monthly USD cap
//! (`None` = unlimited). Usage comes from an external `UsageSource`; the
//! active level is resolved live from the store so an expired approval
//! stops counting the moment `expires_at` passes, before any sweep runs.

use crate::audit::AuditLogger;
use crate::clock::Clock;
use crate::error::{KycError, Result};
use crate::store::VerificationStore;
use crate::types::{AuditAction, AuditLogEntry, VerificationLevel, VerificationRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Monthly USD limit per verification level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitTable {
    #[serde(default = "default_none_limit")]
    pub none: Option<f64>,

    #[serde(default = "default_basic_limit")]
    pub basic: Option<f64>,

    /// Unlimited unless configured
    #[serde(default)]
    pub enhanced: Option<f64>,
}

fn default_none_limit() -> Option<f64> {
    Some(1_000.0)
}

fn default_basic_limit() -> Option<f64> {
    Some(10_000.0)
}

impl Default for LimitTable {
    fn default() -> Self {
        Self {
            none: default_none_limit(),
            basic: default_basic_limit(),
            enhanced: None,
        }
    }
}

impl LimitTable {
    pub fn limit_for(&self, level: VerificationLevel) -> Option<f64> {
        match level {
            VerificationLevel::None => self.none,
            VerificationLevel::Basic => self.basic,
            VerificationLevel::Enhanced => self.enhanced,
        }
    }
}

/// Shared, externally reloadable limit table
#[derive(Debug, Clone, Default)]
pub struct LimitPolicy {
    table: Arc<RwLock<LimitTable>>,
}

impl LimitPolicy {
    pub fn new(table: LimitTable) -> Self {
        Self {
            table: Arc::new(RwLock::new(table)),
        }
    }

    /// Swap in a new table; takes effect on the next check
    pub fn reload(&self, table: LimitTable) {
        let mut current = self.table.write().unwrap_or_else(|e| e.into_inner());
        *current = table;
        tracing::info!("Limit table reloaded");
    }

    pub fn snapshot(&self) -> LimitTable {
        self.table.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn limit_for(&self, level: VerificationLevel) -> Option<f64> {
        self.table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .limit_for(level)
    }
}

/// Current-calendar-month USD volume, owned by the trading ledger
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn monthly_usage_usd(&self, user_id: &str) -> Result<f64>;
}

/// Outcome of a successful limit check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitCheck {
    pub level: VerificationLevel,

    /// `None` = unlimited
    pub limit: Option<f64>,

    pub usage: f64,

    pub requested: f64,

    /// `None` = unlimited
    pub remaining: Option<f64>,
}

/// Highest level with an approval that is still valid at `now`
///
/// Looks at APPROVED records by level descending and returns the first one
/// whose `expires_at` is absent or in the future.
pub fn active_level(records: &[VerificationRecord], now: DateTime<Utc>) -> VerificationLevel {
    let mut approved: Vec<&VerificationRecord> =
        records.iter().filter(|r| r.is_active_at(now)).collect();
    approved.sort_by(|a, b| b.level.cmp(&a.level));
    approved
        .first()
        .map(|r| r.level)
        .unwrap_or(VerificationLevel::None)
}

/// Evaluates requested amounts against the user's tier limit
#[derive(Clone)]
pub struct LimitEnforcer {
    store: Arc<dyn VerificationStore>,
    usage: Arc<dyn UsageSource>,
    policy: LimitPolicy,
    audit: AuditLogger,
    clock: Arc<dyn Clock>,
}

impl LimitEnforcer {
    pub fn new(
        store: Arc<dyn VerificationStore>,
        usage: Arc<dyn UsageSource>,
        policy: LimitPolicy,
        audit: AuditLogger,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            usage,
            policy,
            audit,
            clock,
        }
    }

    pub fn policy(&self) -> &LimitPolicy {
        &self.policy
    }

    /// Resolve the user's active level from the store at the current time
    pub async fn active_level(&self, user_id: &str) -> Result<VerificationLevel> {
        let records = self.store.list_for_user(user_id).await?;
        Ok(active_level(&records, self.clock.now()))
    }

    /// Check `requested_usd` against the user's monthly limit
    ///
    /// Writes LIMIT_CHECKED or LIMIT_EXCEEDED regardless of outcome.
    pub async fn check_monthly_limit(&self, user_id: &str, requested_usd: f64) -> Result<LimitCheck> {
        if !requested_usd.is_finite() || requested_usd < 0.0 {
            return Err(KycError::Validation(format!(
                "Requested amount must be a non-negative number, got {}",
                requested_usd
            )));
        }

        let level = self.active_level(user_id).await?;
        let limit = self.policy.limit_for(level);
        let usage = self.usage.monthly_usage_usd(user_id).await?;
        let now = self.clock.now();

        let exceeded = limit.is_some_and(|limit| usage + requested_usd > limit);
        let action = if exceeded {
            AuditAction::LimitExceeded
        } else {
            AuditAction::LimitChecked
        };

        self.audit
            .record(
                AuditLogEntry::new(user_id, action, now).with_details(serde_json::json!({
                    "level": level,
                    "limit": limit,
                    "usage": usage,
                    "requested": requested_usd,
                })),
            )
            .await;

        if exceeded {
            let limit = limit.unwrap_or_default();
            tracing::info!(
                user_id = %user_id,
                level = %level,
                limit,
                usage,
                requested = requested_usd,
                "Monthly limit exceeded"
            );
            return Err(KycError::LimitExceeded {
                level,
                limit,
                usage,
                requested: requested_usd,
            });
        }

        Ok(LimitCheck {
            level,
            limit,
            usage,
            requested: requested_usd,
            remaining: limit.map(|limit| (limit - usage - requested_usd).max(0.0)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clock::ManualClock;
    use crate::store::MemoryVerificationStore;
    use crate::types::{ProviderKind, VerificationStatus};
    use chrono::{Duration, TimeZone};

    struct FixedUsage(f64);

    #[async_trait]
    impl UsageSource for FixedUsage {
        async fn monthly_usage_usd(&self, _user_id: &str) -> Result<f64> {
            Ok(self.0)
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn approved(level: VerificationLevel, expires_at: Option<DateTime<Utc>>) -> VerificationRecord {
        let mut record = VerificationRecord::new("u1", level, ProviderKind::Persona, 1, t0());
        record.status = VerificationStatus::Approved;
        record.approved_at = Some(t0());
        record.expires_at = expires_at;
        record
    }

    fn enforcer(
        store: MemoryVerificationStore,
        usage: f64,
    ) -> (LimitEnforcer, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::default());
        let enforcer = LimitEnforcer::new(
            Arc::new(store),
            Arc::new(FixedUsage(usage)),
            LimitPolicy::default(),
            AuditLogger::new(sink.clone()),
            Arc::new(ManualClock::new(t0())),
        );
        (enforcer, sink)
    }

    #[test]
    fn test_active_level_prefers_highest_valid() {
        let records = vec![
            approved(VerificationLevel::Basic, Some(t0() + Duration::days(10))),
            approved(VerificationLevel::Enhanced, Some(t0() + Duration::days(5))),
        ];
        assert_eq!(active_level(&records, t0()), VerificationLevel::Enhanced);
        // Enhanced lapsed, basic still valid
        assert_eq!(
            active_level(&records, t0() + Duration::days(6)),
            VerificationLevel::Basic
        );
        assert_eq!(
            active_level(&records, t0() + Duration::days(11)),
            VerificationLevel::None
        );
    }

    #[test]
    fn test_active_level_ignores_non_approved() {
        let mut rejected = approved(VerificationLevel::Enhanced, None);
        rejected.status = VerificationStatus::Rejected;
        let records = vec![rejected, approved(VerificationLevel::Basic, None)];
        assert_eq!(active_level(&records, t0()), VerificationLevel::Basic);
        assert_eq!(active_level(&[], t0()), VerificationLevel::None);
    }

    #[test]
    fn test_policy_reload() {
        let policy = LimitPolicy::default();
        assert_eq!(policy.limit_for(VerificationLevel::Basic), Some(10_000.0));

        policy.reload(LimitTable {
            basic: Some(5_000.0),
            ..LimitTable::default()
        });
        assert_eq!(policy.limit_for(VerificationLevel::Basic), Some(5_000.0));
        assert_eq!(policy.snapshot().none, Some(1_000.0));
    }

    #[tokio::test]
    async fn test_unverified_user_over_limit() {
        let (enforcer, sink) = enforcer(MemoryVerificationStore::new(), 600.0);

        let err = enforcer.check_monthly_limit("u1", 500.0).await.unwrap_err();
        assert!(err.is_policy());
        assert!(matches!(
            err,
            KycError::LimitExceeded { level: VerificationLevel::None, limit, .. } if limit == 1_000.0
        ));

        let exceeded = sink.with_action(AuditAction::LimitExceeded).await;
        assert_eq!(exceeded.len(), 1);
        assert_eq!(exceeded[0].details["requested"], 500.0);
    }

    #[tokio::test]
    async fn test_within_limit_reports_remaining() {
        let (enforcer, sink) = enforcer(MemoryVerificationStore::new(), 600.0);

        let check = enforcer.check_monthly_limit("u1", 400.0).await.unwrap();
        assert_eq!(check.level, VerificationLevel::None);
        assert_eq!(check.limit, Some(1_000.0));
        assert_eq!(check.remaining, Some(0.0));
        assert_eq!(sink.with_action(AuditAction::LimitChecked).await.len(), 1);
    }

    #[tokio::test]
    async fn test_enhanced_is_unlimited() {
        let store = MemoryVerificationStore::new();
        store
            .create(approved(VerificationLevel::Enhanced, Some(t0() + Duration::days(30))))
            .await
            .unwrap();
        let (enforcer, _) = enforcer(store, 5_000_000.0);

        let check = enforcer.check_monthly_limit("u1", 1e9).await.unwrap();
        assert_eq!(check.level, VerificationLevel::Enhanced);
        assert!(check.limit.is_none());
        assert!(check.remaining.is_none());
    }

    #[tokio::test]
    async fn test_rejects_negative_amount() {
        let (enforcer, _) = enforcer(MemoryVerificationStore::new(), 0.0);
        let err = enforcer.check_monthly_limit("u1", -1.0).await.unwrap_err();
        assert!(matches!(err, KycError::Validation(_)));
    }
}
