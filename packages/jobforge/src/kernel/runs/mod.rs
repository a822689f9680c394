//! Determinism envelope: input snapshots, decision traces, manifests, and
//! replay bundles. Every run is auditable and replayable through these four
//! records.

mod envelope;
mod manifest;
mod replay;
mod snapshot;
mod trace;

pub use envelope::RunEnvelope;
pub use manifest::{
    default_env_fingerprint, default_tool_versions, Manifest, ManifestDocument, ManifestOutput,
    ManifestStatus, MANIFEST_VERSION,
};
pub use replay::{compare, ReplayBundle, ReplayDiff, REPLAY_BUNDLE_VERSION};
pub use snapshot::InputSnapshot;
pub use trace::{Decision, DecisionKind, DecisionTrace, TraceRecorder};
