//! Lifecycle event publication
//!
//! Transitions are announced to external subscribers (notifications,
//! profile projections) through a `LifecyclePublisher`. Publication is
//! fire-and-forget: the engine never waits on or learns about subscribers.

use crate::types::VerificationLevel;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Kind of lifecycle transition being announced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleEventKind {
    Initiated,
    Approved,
    Rejected,
    Expired,
    LevelChanged,
}

impl LifecycleEventKind {
    /// Topic segment used in the event subject
    pub fn topic(self) -> &'static str {
        match self {
            LifecycleEventKind::Initiated => "initiated",
            LifecycleEventKind::Approved => "approved",
            LifecycleEventKind::Rejected => "rejected",
            LifecycleEventKind::Expired => "expired",
            LifecycleEventKind::LevelChanged => "level_changed",
        }
    }
}

/// A lifecycle notification
///
/// Published to subjects following `events.kyc.<topic>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    /// Unique event identifier (evt-<uuid>)
    pub id: String,

    pub kind: LifecycleEventKind,

    pub user_id: String,

    pub level: VerificationLevel,

    pub verification_id: String,

    pub timestamp: DateTime<Utc>,

    /// Additional flat fields (provider, previous level, ...)
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl LifecycleEvent {
    pub fn new(
        kind: LifecycleEventKind,
        user_id: impl Into<String>,
        level: VerificationLevel,
        verification_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            kind,
            user_id: user_id.into(),
            level,
            verification_id: verification_id.into(),
            timestamp,
            data: HashMap::new(),
        }
    }

    /// Add a flat payload field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn subject(&self) -> String {
        format!("events.kyc.{}", self.kind.topic())
    }

    /// Flat `{userId, level, verificationId, ...}` payload for subscribers
    pub fn payload(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.data {
            map.insert(key.clone(), value.clone());
        }
        map.insert("userId".to_string(), self.user_id.clone().into());
        map.insert("level".to_string(), self.level.as_str().into());
        map.insert(
            "verificationId".to_string(),
            self.verification_id.clone().into(),
        );
        serde_json::Value::Object(map)
    }
}

/// Fire-and-forget sink for lifecycle events
pub trait LifecyclePublisher: Send + Sync {
    /// Publish an event; must not block and never reports failure
    fn publish(&self, event: LifecycleEvent);
}

/// In-process publisher backed by a `tokio::sync::broadcast` channel
///
/// Every live subscriber receives every event published after it
/// subscribed. Slow subscribers that fall behind the channel capacity
/// skip the overflowed events.
#[derive(Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`, dropping lag notifications
    pub fn stream(&self) -> impl Stream<Item = LifecycleEvent> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Lifecycle subscriber lagged, events skipped");
                None
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl LifecyclePublisher for BroadcastPublisher {
    fn publish(&self, event: LifecycleEvent) {
        let subject = event.subject();
        let event_id = event.id.clone();
        match self.tx.send(event) {
            Ok(receivers) => tracing::debug!(
                event_id = %event_id,
                subject = %subject,
                receivers,
                "Lifecycle event published"
            ),
            Err(_) => tracing::debug!(
                event_id = %event_id,
                subject = %subject,
                "Lifecycle event published with no subscribers"
            ),
        }
    }
}
