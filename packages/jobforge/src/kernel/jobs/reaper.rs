//! Stale-lock reaper.
//!
//! The only actor allowed to clear another worker's `running` lock, and only
//! once the heartbeat threshold has elapsed. Runs as a periodic sweep next
//! to the workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::queue::PostgresJobQueue;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// A running job with no heartbeat for this long is considered abandoned.
    pub threshold: Duration,
    /// How often the sweep runs.
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(300),
            interval: Duration::from_secs(60),
        }
    }
}

pub struct StaleJobReaper {
    queue: Arc<PostgresJobQueue>,
    config: ReaperConfig,
}

impl StaleJobReaper {
    pub fn new(queue: Arc<PostgresJobQueue>) -> Self {
        Self::with_config(queue, ReaperConfig::default())
    }

    pub fn with_config(queue: Arc<PostgresJobQueue>, config: ReaperConfig) -> Self {
        Self { queue, config }
    }

    /// One sweep; returns how many jobs were reclaimed.
    pub async fn run_once(&self) -> Result<usize> {
        let threshold = chrono::Duration::from_std(self.config.threshold)?;
        let reaped = self.queue.reap_stale(threshold).await?;
        if !reaped.is_empty() {
            info!(count = reaped.len(), "reaped stale jobs");
        }
        Ok(reaped.len())
    }

    /// Sweep on the configured interval until shutdown.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            threshold_secs = self.config.threshold.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            "stale job reaper starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "reaper sweep failed");
                    }
                }
            }
        }

        info!("stale job reaper stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_threshold_is_five_minutes() {
        let config = ReaperConfig::default();
        assert_eq!(config.threshold, Duration::from_secs(300));
    }
}
