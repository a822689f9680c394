//! ForgeKernel - core infrastructure with all shared dependencies.
//!
//! The kernel holds the database pool, the injected clock, the feature-flag
//! registry, the policy-token secret, and the validation limits. Every
//! component receives an `Arc<ForgeKernel>`.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::common::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::kernel::error::{ForgeError, ForgeResult};
use crate::kernel::flags::FeatureFlags;
use std::sync::Arc;

/// Payload and queue-depth limits enforced at the admission boundary when
/// `security_validation_enabled` is on.
#[derive(Debug, Clone)]
pub struct SecurityLimits {
    /// Maximum serialized payload size accepted at enqueue/ingest.
    pub max_payload_bytes: usize,
    /// Optional cap on `queued` rows per tenant, enforced at enqueue.
    pub max_queued_per_tenant: Option<i64>,
}

impl Default for SecurityLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 65_536,
            max_queued_per_tenant: None,
        }
    }
}

/// ForgeKernel holds all core dependencies.
pub struct ForgeKernel {
    pub db_pool: PgPool,
    pub clock: SharedClock,
    pub flags: FeatureFlags,
    /// Injected signing secret for policy tokens; never persisted.
    pub policy_secret: Option<Vec<u8>>,
    pub policy_token_expiry_hours: i64,
    pub limits: SecurityLimits,
}

impl ForgeKernel {
    /// Creates a kernel, failing fast when action jobs are enabled with
    /// token enforcement but no signing secret is configured.
    pub fn new(
        db_pool: PgPool,
        clock: SharedClock,
        flags: FeatureFlags,
        policy_secret: Option<Vec<u8>>,
        policy_token_expiry_hours: i64,
        limits: SecurityLimits,
    ) -> ForgeResult<Self> {
        if flags.action_jobs_enabled && flags.require_policy_tokens && policy_secret.is_none() {
            return Err(ForgeError::BadInput(
                "action_jobs_enabled with require_policy_tokens needs a policy token secret".into(),
            ));
        }

        Ok(Self {
            db_pool,
            clock,
            flags,
            policy_secret,
            policy_token_expiry_hours,
            limits,
        })
    }

    /// Builds the kernel from environment configuration with the system clock.
    pub fn from_config(config: &Config, db_pool: PgPool) -> ForgeResult<Self> {
        Self::new(
            db_pool,
            Arc::new(SystemClock),
            config.flags,
            config.policy_token_secret.clone(),
            config.policy_token_expiry_hours,
            config.limits.clone(),
        )
    }

    /// Current time according to the injected clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
