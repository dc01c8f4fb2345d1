//! Route-level KYC requirements
//!
//! Routes declare a `KycRequirement` when they are composed; at request time
//! the requirement is looked up and checked by `KycGuard`.

use crate::error::{KycError, Result};
use crate::limits::{LimitCheck, LimitEnforcer};
use crate::types::VerificationLevel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a route demands of the caller's verification standing
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KycRequirement {
    /// Lowest active level allowed through
    #[serde(default)]
    pub min_level: VerificationLevel,

    /// Check the request amount against the monthly limit
    #[serde(default)]
    pub enforce_limit: bool,
}

impl KycRequirement {
    pub const fn level(min_level: VerificationLevel) -> Self {
        Self {
            min_level,
            enforce_limit: false,
        }
    }

    pub const fn with_limit(mut self) -> Self {
        self.enforce_limit = true;
        self
    }
}

/// Route name → requirement
#[derive(Debug, Clone, Default)]
pub struct RouteRequirements {
    routes: HashMap<String, KycRequirement>,
}

impl RouteRequirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, route: impl Into<String>, requirement: KycRequirement) -> Self {
        self.routes.insert(route.into(), requirement);
        self
    }

    /// Requirement for a route; unlisted routes have none
    pub fn get(&self, route: &str) -> KycRequirement {
        self.routes.get(route).copied().unwrap_or_default()
    }
}

/// Outcome of a passed guard check
#[derive(Debug, Clone, PartialEq)]
pub struct GuardDecision {
    pub active_level: VerificationLevel,

    /// Present when the route enforces a limit and an amount was supplied
    pub limit: Option<LimitCheck>,
}

/// Enforces `KycRequirement`s against live verification state
#[derive(Clone)]
pub struct KycGuard {
    limits: LimitEnforcer,
}

impl KycGuard {
    pub fn new(limits: LimitEnforcer) -> Self {
        Self { limits }
    }

    /// Admit or refuse `user_id` for a route
    ///
    /// Below the minimum level is a `Policy` error; an amount over the
    /// monthly limit is `LimitExceeded`.
    pub async fn authorize(
        &self,
        user_id: &str,
        requirement: &KycRequirement,
        amount_usd: Option<f64>,
    ) -> Result<GuardDecision> {
        let active_level = self.limits.active_level(user_id).await?;
        if active_level < requirement.min_level {
            tracing::info!(
                user_id = %user_id,
                active_level = %active_level,
                required = %requirement.min_level,
                "KYC level requirement not met"
            );
            return Err(KycError::Policy(format!(
                "{} verification required, current level is {}",
                requirement.min_level, active_level
            )));
        }

        let limit = match (requirement.enforce_limit, amount_usd) {
            (true, Some(amount)) => Some(self.limits.check_monthly_limit(user_id, amount).await?),
            _ => None,
        };

        Ok(GuardDecision {
            active_level,
            limit,
        })
    }
}
