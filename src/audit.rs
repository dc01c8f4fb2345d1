//! Audit trail: best-effort, append-only side channel
//!
//! Provides an `AuditSink` trait for persisting entries and an
//! `AuditLogger` that callers use. A failed write is logged and dropped;
//! it never fails or rolls back the lifecycle operation that produced it.

use crate::error::{KycError, Result};
use crate::types::{AuditAction, AuditLogEntry};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Trait for audit storage backends
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append one entry; entries are never updated or deleted
    async fn append(&self, entry: AuditLogEntry) -> Result<()>;

    /// Most recent entries for a user, newest first
    async fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<AuditLogEntry>>;
}

/// Best-effort recorder in front of an `AuditSink`
#[derive(Clone)]
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Append an entry, swallowing and logging any failure
    pub async fn record(&self, entry: AuditLogEntry) {
        let user_id = entry.user_id.clone();
        let action = entry.action;
        if let Err(e) = self.sink.append(entry).await {
            tracing::warn!(
                user_id = %user_id,
                action = ?action,
                error = %e,
                "Audit write failed, entry dropped"
            );
        }
    }

    /// Read back a user's trail
    pub async fn history(&self, user_id: &str, limit: usize) -> Result<Vec<AuditLogEntry>> {
        self.sink.list_for_user(user_id, limit).await
    }
}

/// In-memory audit sink for development and testing
///
/// Stores entries in a `Vec` with configurable max capacity.
pub struct MemoryAuditSink {
    entries: Arc<RwLock<Vec<AuditLogEntry>>>,
    max_entries: usize,
}

impl MemoryAuditSink {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            max_entries,
        }
    }

    /// Snapshot of every stored entry, oldest first
    pub async fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.read().await.clone()
    }

    /// Entries with the given action, oldest first
    pub async fn with_action(&self, action: AuditAction) -> Vec<AuditLogEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|entry| entry.action == action)
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, entry: AuditLogEntry) -> Result<()> {
        if entry.user_id.is_empty() {
            return Err(KycError::Validation(
                "Audit entry requires a user id".to_string(),
            ));
        }

        tracing::debug!(
            audit_id = %entry.id,
            user_id = %entry.user_id,
            action = ?entry.action,
            "Audit entry appended"
        );

        let mut entries = self.entries.write().await;
        entries.push(entry);

        // Enforce max capacity
        if self.max_entries > 0 && entries.len() > self.max_entries {
            let drain_count = entries.len() - self.max_entries;
            entries.drain(..drain_count);
        }

        Ok(())
    }

    async fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<AuditLogEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .rev()
            .filter(|entry| entry.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
