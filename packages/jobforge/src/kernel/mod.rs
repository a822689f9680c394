//! Core infrastructure: the kernel, feature flags, error taxonomy, audit
//! log, job queue machinery, and the determinism envelope.

pub mod audit;
pub mod error;
pub mod flags;
pub mod forge_kernel;
pub mod jobs;
pub mod runs;

pub use audit::{AuditAction, AuditEntry};
pub use error::{ForgeError, ForgeResult};
pub use flags::{FeatureFlags, FLAG_NAMES};
pub use forge_kernel::{ForgeKernel, SecurityLimits};
