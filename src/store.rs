//! Verification record persistence
//!
//! `VerificationStore` is the persistence port the engine talks to. It
//! exposes exactly the queries the lifecycle needs plus a version-checked
//! update. Implementations must enforce two constraints:
//!
//! - at most one PENDING record per (user, level); both `create` and an
//!   `update` that moves a record into PENDING return
//!   `KycError::DuplicatePending` when another PENDING record already exists
//! - `update` succeeds only when the caller's `version` matches the stored
//!   one, and bumps it; otherwise `KycError::Conflict`

use crate::error::{KycError, Result};
use crate::types::{VerificationLevel, VerificationRecord, VerificationStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Keyset position for paging through due records
///
/// Pages are ordered by `(expires_at, id)`; a page starts strictly after the
/// cursor, so records that keep failing do not hide later ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryCursor {
    pub expires_at: DateTime<Utc>,
    pub id: String,
}

impl ExpiryCursor {
    /// Cursor positioned at `record`, if it carries an expiry
    pub fn after(record: &VerificationRecord) -> Option<Self> {
        record.expires_at.map(|expires_at| Self {
            expires_at,
            id: record.id.clone(),
        })
    }

    fn precedes(&self, record: &VerificationRecord) -> bool {
        match record.expires_at {
            Some(expires_at) => (expires_at, record.id.as_str()) > (self.expires_at, self.id.as_str()),
            None => false,
        }
    }
}

/// Persistence port for verification records
#[async_trait]
pub trait VerificationStore: Send + Sync {
    /// Fetch a record by id
    async fn get(&self, id: &str) -> Result<Option<VerificationRecord>>;

    /// Latest record for (user, level) in the given status
    async fn find_by_user_level_status(
        &self,
        user_id: &str,
        level: VerificationLevel,
        status: VerificationStatus,
    ) -> Result<Option<VerificationRecord>>;

    /// Record correlated with a provider inquiry / workflow run id
    async fn find_by_external_inquiry(
        &self,
        external_inquiry_id: &str,
    ) -> Result<Option<VerificationRecord>>;

    /// Every record of a user, newest first
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<VerificationRecord>>;

    /// Number of records ever created for (user, level)
    async fn count_for_user_level(&self, user_id: &str, level: VerificationLevel) -> Result<u32>;

    /// APPROVED records whose `expires_at <= now`, ordered by
    /// `(expires_at, id)` and starting after `after` when given
    async fn find_approved_expired(
        &self,
        now: DateTime<Utc>,
        after: Option<&ExpiryCursor>,
        limit: usize,
    ) -> Result<Vec<VerificationRecord>>;

    /// Insert a new record, enforcing the PENDING uniqueness constraint
    async fn create(&self, record: VerificationRecord) -> Result<VerificationRecord>;

    /// Replace a record if its version still matches; returns the stored copy
    ///
    /// Moving a record into PENDING while another PENDING record exists for
    /// the same (user, level) fails with `DuplicatePending`.
    async fn update(&self, record: VerificationRecord) -> Result<VerificationRecord>;

    /// Remove a record (only used to roll back a failed start)
    async fn delete(&self, id: &str) -> Result<()>;
}

/// In-memory verification store for development and testing
///
/// Records live in a `HashMap` behind an async `RwLock`; the uniqueness and
/// version checks run under the write lock so they are atomic.
#[derive(Default, Clone)]
pub struct MemoryVerificationStore {
    records: Arc<RwLock<HashMap<String, VerificationRecord>>>,
}

impl MemoryVerificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn newest_first(records: &mut [VerificationRecord]) {
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then(b.attempt_count.cmp(&a.attempt_count))
    });
}

#[async_trait]
impl VerificationStore for MemoryVerificationStore {
    async fn get(&self, id: &str) -> Result<Option<VerificationRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn find_by_user_level_status(
        &self,
        user_id: &str,
        level: VerificationLevel,
        status: VerificationStatus,
    ) -> Result<Option<VerificationRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<VerificationRecord> = records
            .values()
            .filter(|r| r.user_id == user_id && r.level == level && r.status == status)
            .cloned()
            .collect();
        newest_first(&mut matching);
        Ok(matching.into_iter().next())
    }

    async fn find_by_external_inquiry(
        &self,
        external_inquiry_id: &str,
    ) -> Result<Option<VerificationRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .find(|r| r.external_inquiry_id.as_deref() == Some(external_inquiry_id))
            .cloned())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<VerificationRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<VerificationRecord> = records
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        newest_first(&mut matching);
        Ok(matching)
    }

    async fn count_for_user_level(&self, user_id: &str, level: VerificationLevel) -> Result<u32> {
        let records = self.records.read().await;
        let count = records
            .values()
            .filter(|r| r.user_id == user_id && r.level == level)
            .count();
        Ok(count as u32)
    }

    async fn find_approved_expired(
        &self,
        now: DateTime<Utc>,
        after: Option<&ExpiryCursor>,
        limit: usize,
    ) -> Result<Vec<VerificationRecord>> {
        let records = self.records.read().await;
        let mut due: Vec<VerificationRecord> = records
            .values()
            .filter(|r| r.is_due_for_expiry(now))
            .filter(|r| after.map_or(true, |cursor| cursor.precedes(r)))
            .cloned()
            .collect();
        due.sort_by(|a, b| (a.expires_at, &a.id).cmp(&(b.expires_at, &b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn create(&self, record: VerificationRecord) -> Result<VerificationRecord> {
        let mut records = self.records.write().await;

        if records.contains_key(&record.id) {
            return Err(KycError::Persistence(format!(
                "Record '{}' already exists",
                record.id
            )));
        }

        if record.status == VerificationStatus::Pending
            && records.values().any(|r| {
                r.user_id == record.user_id
                    && r.level == record.level
                    && r.status == VerificationStatus::Pending
            })
        {
            return Err(KycError::DuplicatePending {
                user_id: record.user_id.clone(),
                level: record.level,
            });
        }

        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update(&self, record: VerificationRecord) -> Result<VerificationRecord> {
        let mut records = self.records.write().await;

        let stored = records
            .get(&record.id)
            .ok_or_else(|| KycError::NotFound(format!("Verification not found: {}", record.id)))?;

        if stored.version != record.version {
            return Err(KycError::Conflict {
                id: record.id.clone(),
                expected: record.version,
                actual: stored.version,
            });
        }

        if record.status == VerificationStatus::Pending
            && records.values().any(|r| {
                r.id != record.id
                    && r.user_id == record.user_id
                    && r.level == record.level
                    && r.status == VerificationStatus::Pending
            })
        {
            return Err(KycError::DuplicatePending {
                user_id: record.user_id.clone(),
                level: record.level,
            });
        }

        let mut updated = record;
        updated.version += 1;
        records.insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        records.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProviderKind;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn pending(user_id: &str, level: VerificationLevel) -> VerificationRecord {
        VerificationRecord::new(user_id, level, ProviderKind::Persona, 1, t0())
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryVerificationStore::new();
        let record = store.create(pending("u1", VerificationLevel::Basic)).await.unwrap();

        let loaded = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.get("kyc-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_uniqueness() {
        let store = MemoryVerificationStore::new();
        store.create(pending("u1", VerificationLevel::Basic)).await.unwrap();

        let err = store
            .create(pending("u1", VerificationLevel::Basic))
            .await
            .unwrap_err();
        assert!(matches!(err, KycError::DuplicatePending { .. }));

        // Other level and other user are unaffected
        store.create(pending("u1", VerificationLevel::Enhanced)).await.unwrap();
        store.create(pending("u2", VerificationLevel::Basic)).await.unwrap();
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_update_version_check() {
        let store = MemoryVerificationStore::new();
        let record = store.create(pending("u1", VerificationLevel::Basic)).await.unwrap();

        let mut first = record.clone();
        first.status = VerificationStatus::UnderReview;
        let stored = store.update(first).await.unwrap();
        assert_eq!(stored.version, 1);

        // Stale copy loses
        let mut stale = record;
        stale.status = VerificationStatus::Rejected;
        let err = store.update(stale).await.unwrap_err();
        assert!(matches!(
            err,
            KycError::Conflict { expected: 0, actual: 1, .. }
        ));

        let current = store.get(&stored.id).await.unwrap().unwrap();
        assert_eq!(current.status, VerificationStatus::UnderReview);
    }

    #[tokio::test]
    async fn test_update_unknown_record() {
        let store = MemoryVerificationStore::new();
        let err = store.update(pending("u1", VerificationLevel::Basic)).await.unwrap_err();
        assert!(matches!(err, KycError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_find_approved_expired() {
        let store = MemoryVerificationStore::new();
        let mut approved = pending("u1", VerificationLevel::Basic);
        approved.status = VerificationStatus::Approved;
        approved.approved_at = Some(t0());
        approved.expires_at = Some(t0() + Duration::days(365));
        let approved = store.create(approved).await.unwrap();

        let mut expired = pending("u2", VerificationLevel::Basic);
        expired.status = VerificationStatus::Expired;
        expired.expires_at = Some(t0());
        store.create(expired).await.unwrap();

        assert!(store
            .find_approved_expired(t0() + Duration::days(364), None, 100)
            .await
            .unwrap()
            .is_empty());

        let due = store
            .find_approved_expired(t0() + Duration::days(365), None, 100)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, approved.id);
    }

    #[tokio::test]
    async fn test_update_into_pending_respects_uniqueness() {
        let store = MemoryVerificationStore::new();
        let mut parked = pending("u1", VerificationLevel::Basic);
        parked.status = VerificationStatus::RequiresAction;
        let parked = store.create(parked).await.unwrap();
        let open = store.create(pending("u1", VerificationLevel::Basic)).await.unwrap();

        let mut reopened = parked.clone();
        reopened.status = VerificationStatus::Pending;
        let err = store.update(reopened).await.unwrap_err();
        assert!(matches!(err, KycError::DuplicatePending { .. }));
        assert_eq!(
            store.get(&parked.id).await.unwrap().unwrap().status,
            VerificationStatus::RequiresAction
        );

        // The existing PENDING record can still be updated in place
        let mut touched = open.clone();
        touched.session_token = Some("tok".to_string());
        assert_eq!(store.update(touched).await.unwrap().version, 1);

        // Once it leaves PENDING the parked record may reopen
        let mut approved = store.get(&open.id).await.unwrap().unwrap();
        approved.status = VerificationStatus::Approved;
        store.update(approved).await.unwrap();
        let mut reopened = parked;
        reopened.status = VerificationStatus::Pending;
        assert!(store.update(reopened).await.is_ok());
    }

    #[tokio::test]
    async fn test_find_approved_expired_pages_by_cursor() {
        let store = MemoryVerificationStore::new();
        for (user, day) in [("u1", 1), ("u2", 2), ("u3", 3)] {
            let mut record = pending(user, VerificationLevel::Basic);
            record.status = VerificationStatus::Approved;
            record.expires_at = Some(t0() + Duration::days(day));
            store.create(record).await.unwrap();
        }
        let now = t0() + Duration::days(10);

        let first = store.find_approved_expired(now, None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].user_id, "u1");

        let cursor = ExpiryCursor::after(&first[1]).unwrap();
        let rest = store.find_approved_expired(now, Some(&cursor), 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].user_id, "u3");
    }

    #[tokio::test]
    async fn test_lookup_queries() {
        let store = MemoryVerificationStore::new();
        let mut record = pending("u1", VerificationLevel::Basic);
        record.external_inquiry_id = Some("inq_123".to_string());
        let record = store.create(record).await.unwrap();

        let by_inquiry = store.find_by_external_inquiry("inq_123").await.unwrap().unwrap();
        assert_eq!(by_inquiry.id, record.id);
        assert!(store.find_by_external_inquiry("inq_999").await.unwrap().is_none());

        let found = store
            .find_by_user_level_status("u1", VerificationLevel::Basic, VerificationStatus::Pending)
            .await
            .unwrap();
        assert!(found.is_some());
        assert_eq!(
            store.count_for_user_level("u1", VerificationLevel::Basic).await.unwrap(),
            1
        );
        assert_eq!(store.list_for_user("u1").await.unwrap().len(), 1);

        store.delete(&record.id).await.unwrap();
        assert!(store.is_empty().await);
    }
}
