//! JobForge core: a multi-tenant job execution plane on a relational store.
//!
//! The crate provides the durable queue and worker protocol (claim,
//! heartbeat, complete, with exponential backoff, idempotent enqueue, and
//! dead-lettering), the event -> trigger -> bundle executor pipeline under
//! scope and safety gates, and the determinism envelope (canonical-JSON
//! snapshots, decision traces, manifests, replay bundles) that makes every
//! run auditable and replayable.
//!
//! HTTP facades, dashboards, CLIs, and concrete connector implementations
//! are thin adapters living outside this crate.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;

pub use config::Config;
pub use kernel::{ForgeError, ForgeKernel, ForgeResult};
