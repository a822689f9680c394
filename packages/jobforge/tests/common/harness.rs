//! Test harness with testcontainers for integration testing.
//!
//! A single Postgres container is started on first use and shared across all
//! tests; migrations run once. Each test builds its own kernel over the
//! shared database and isolates itself by tenant.

use std::sync::Arc;

use anyhow::{Context, Result};
use jobforge_core::common::clock::VirtualClock;
use jobforge_core::common::TenantId;
use jobforge_core::kernel::jobs::PostgresJobQueue;
use jobforge_core::kernel::{FeatureFlags, ForgeKernel, SecurityLimits};
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    db_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Respect RUST_LOG when debugging tests; try_init avoids double-init
        // panics across test binaries.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&db_url)
            .await
            .context("Failed to connect for migrations")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;
        pool.close().await;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("shared test infrastructure failed to start")
            })
            .await
    }
}

/// One test's view of the system: a kernel on the shared database, a queue,
/// a virtual clock, and a fresh tenant for isolation.
pub struct TestForge {
    pub kernel: Arc<ForgeKernel>,
    pub queue: Arc<PostgresJobQueue>,
    pub clock: Arc<VirtualClock>,
    pub tenant: TenantId,
}

impl TestForge {
    pub fn pool(&self) -> &PgPool {
        &self.kernel.db_pool
    }
}

/// Flags most tests want: auditing on so admission entries are observable,
/// everything else at its shipped default.
pub fn test_flags() -> FeatureFlags {
    let mut flags = FeatureFlags::default();
    flags.audit_logging_enabled = true;
    flags
}

/// Builds a kernel over the shared database with the given flags.
pub async fn forge_with_flags(flags: FeatureFlags) -> TestForge {
    let infra = SharedTestInfra::get().await;
    let pool = PgPool::connect(&infra.db_url)
        .await
        .expect("connect to shared database");

    let clock = Arc::new(VirtualClock::from_now());
    let kernel = Arc::new(
        ForgeKernel::new(
            pool,
            clock.clone(),
            flags,
            Some(b"integration-test-secret".to_vec()),
            1,
            SecurityLimits::default(),
        )
        .expect("kernel initializes"),
    );

    TestForge {
        queue: Arc::new(PostgresJobQueue::new(kernel.clone())),
        clock,
        tenant: TenantId::new(),
        kernel,
    }
}

pub async fn forge() -> TestForge {
    forge_with_flags(test_flags()).await
}
