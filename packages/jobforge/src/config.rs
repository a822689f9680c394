use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

use crate::kernel::flags::FeatureFlags;
use crate::kernel::forge_kernel::SecurityLimits;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub flags: FeatureFlags,
    pub policy_token_secret: Option<Vec<u8>>,
    pub policy_token_expiry_hours: i64,
    pub limits: SecurityLimits,
    pub worker_batch_size: i64,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reap_threshold_ms: i64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            flags: FeatureFlags::from_env(),
            policy_token_secret: env::var("JOBFORGE_POLICY_TOKEN_SECRET")
                .ok()
                .map(|s| s.into_bytes()),
            policy_token_expiry_hours: env::var("JOBFORGE_POLICY_TOKEN_EXPIRY_HOURS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("JOBFORGE_POLICY_TOKEN_EXPIRY_HOURS must be a valid number")?,
            limits: SecurityLimits {
                max_payload_bytes: env::var("JOBFORGE_MAX_PAYLOAD_BYTES")
                    .unwrap_or_else(|_| "65536".to_string())
                    .parse()
                    .context("JOBFORGE_MAX_PAYLOAD_BYTES must be a valid number")?,
                max_queued_per_tenant: env::var("JOBFORGE_MAX_QUEUED_PER_TENANT")
                    .ok()
                    .map(|s| s.parse())
                    .transpose()
                    .context("JOBFORGE_MAX_QUEUED_PER_TENANT must be a valid number")?,
            },
            worker_batch_size: env::var("JOBFORGE_WORKER_BATCH_SIZE")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("JOBFORGE_WORKER_BATCH_SIZE must be a valid number")?,
            poll_interval_ms: env::var("JOBFORGE_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()
                .context("JOBFORGE_POLL_INTERVAL_MS must be a valid number")?,
            heartbeat_interval_ms: env::var("JOBFORGE_HEARTBEAT_INTERVAL_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()
                .context("JOBFORGE_HEARTBEAT_INTERVAL_MS must be a valid number")?,
            reap_threshold_ms: env::var("JOBFORGE_REAP_THRESHOLD_MS")
                .unwrap_or_else(|_| "300000".to_string())
                .parse()
                .context("JOBFORGE_REAP_THRESHOLD_MS must be a valid number")?,
        })
    }
}
