//! # a3s-kyc
//!
//! KYC verification lifecycle for the A3S ecosystem: tiered identity
//! verification through external providers, signed webhooks, monthly
//! limits, and expiry.
//!
//! ## Overview
//!
//! Users progress through `NONE → BASIC → ENHANCED`. Each attempt is a
//! `VerificationRecord` that moves through a small state machine, driven by
//! provider webhooks, an admin review, or the expiry sweep. Every mutation is
//! audited and every approval, rejection, and expiry is published as a
//! lifecycle event.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_kyc::{
//!     BroadcastPublisher, KycConfig, LifecycleEngine, MemoryAuditSink,
//!     MemoryVerificationStore, PersonaAdapter, ProviderKind, ProviderSet,
//!     SystemClock, UsageSource, VerificationLevel,
//! };
//! use std::sync::Arc;
//!
//! struct Ledger;
//!
//! #[async_trait::async_trait]
//! impl UsageSource for Ledger {
//!     async fn monthly_usage_usd(&self, _user_id: &str) -> a3s_kyc::Result<f64> {
//!         Ok(0.0)
//!     }
//! }
//!
//! # async fn example() -> a3s_kyc::Result<()> {
//! let config = KycConfig::load("kyc.toml")?;
//! let Some(persona) = config.persona.clone() else {
//!     return Ok(());
//! };
//! let providers = ProviderSet::new()
//!     .with(Arc::new(PersonaAdapter::new(persona, config.provider_timeout())?));
//!
//! let engine = LifecycleEngine::new(
//!     config,
//!     Arc::new(MemoryVerificationStore::new()),
//!     providers,
//!     Arc::new(MemoryAuditSink::default()),
//!     Arc::new(BroadcastPublisher::default()),
//!     Arc::new(Ledger),
//!     Arc::new(SystemClock),
//! );
//!
//! let started = engine
//!     .start_verification("user-1", VerificationLevel::Basic, ProviderKind::Persona, None)
//!     .await?;
//! println!("Session token: {:?}", started.record.session_token);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **LifecycleEngine**: start, resume, provider results, manual review
//! - **ProviderAdapter** trait: Persona and Onfido behind one interface
//! - **WebhookVerifier**: replay window plus constant-time HMAC check
//! - **LimitEnforcer** / **KycGuard**: tier limits and route requirements
//! - **ExpiryScheduler**: periodic APPROVED → EXPIRED sweep
//! - **VerificationStore** / **AuditSink** / **LifecyclePublisher**: ports

pub mod audit;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod events;
pub mod guard;
pub mod limits;
pub mod provider;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod types;
pub mod webhook;

// Re-export core types
pub use audit::{AuditLogger, AuditSink, MemoryAuditSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{KycConfig, OnfidoConfig, PersonaConfig};
pub use engine::{KycStatus, LifecycleEngine, StartOutcome, WebhookOutcome};
pub use error::{KycError, Result};
pub use events::{BroadcastPublisher, LifecycleEvent, LifecycleEventKind, LifecyclePublisher};
pub use guard::{GuardDecision, KycGuard, KycRequirement, RouteRequirements};
pub use limits::{LimitCheck, LimitEnforcer, LimitPolicy, LimitTable, UsageSource};
pub use scheduler::{ExpiryScheduler, SchedulerEvent, SweepReport};
pub use state::{can_transition, TransitionSource};
pub use store::{ExpiryCursor, MemoryVerificationStore, VerificationStore};
pub use types::{
    AuditAction, AuditLogEntry, CanonicalStatus, ProviderKind, ProviderResult, SessionInfo,
    VerificationLevel, VerificationRecord, VerificationStatus,
};
pub use webhook::WebhookVerifier;

// Re-export providers for convenience
pub use provider::{OnfidoAdapter, PersonaAdapter, ProviderAdapter, ProviderSet};
