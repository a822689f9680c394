//! Replay bundles: portable packages for re-executing a run and comparing
//! the result against the original.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::manifest::ManifestDocument;
use super::snapshot::InputSnapshot;
use super::trace::DecisionTrace;
use crate::common::canonical::{canonical_hash, canonical_json};
use crate::common::RunId;

pub const REPLAY_BUNDLE_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayBundle {
    pub version: String,
    pub run_id: RunId,
    pub snapshot: InputSnapshot,
    pub trace: DecisionTrace,
    pub manifest: ManifestDocument,
    pub env_fingerprint: BTreeMap<String, String>,
}

/// One field that differed between the original and the replayed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayDiff {
    pub field: String,
    pub original: String,
    pub replayed: String,
}

impl ReplayBundle {
    pub fn assemble(
        run_id: RunId,
        snapshot: InputSnapshot,
        trace: DecisionTrace,
        manifest: ManifestDocument,
    ) -> Self {
        Self {
            version: REPLAY_BUNDLE_VERSION.to_string(),
            env_fingerprint: manifest.env_fingerprint.clone(),
            run_id,
            snapshot,
            trace,
            manifest,
        }
    }

    /// Exports the bundle from a finalized manifest document. Requires the
    /// snapshot and decision trace the document carries when replay packs
    /// are enabled.
    pub fn from_document(document: &ManifestDocument) -> Option<Self> {
        let snapshot = document.input_snapshot.clone()?;
        let trace = document.decision_trace.clone()?;
        Some(Self::assemble(
            document.run_id,
            snapshot,
            trace,
            document.clone(),
        ))
    }

    /// Hash of the manifest's output list, used for replay comparison.
    pub fn output_hash(&self) -> String {
        let value = serde_json::to_value(&self.manifest.outputs)
            .expect("manifest outputs serialize");
        canonical_hash(&canonical_json(&value))
    }
}

/// A replayed run is identical iff the recomputed input hash, output hash,
/// and decision sequence all match. Everything else is informational.
pub fn compare(original: &ReplayBundle, replayed: &ReplayBundle) -> Vec<ReplayDiff> {
    let mut diffs = Vec::new();

    if original.snapshot.hash != replayed.snapshot.hash {
        diffs.push(ReplayDiff {
            field: "input_hash".into(),
            original: original.snapshot.hash.clone(),
            replayed: replayed.snapshot.hash.clone(),
        });
    }

    let original_outputs = original.output_hash();
    let replayed_outputs = replayed.output_hash();
    if original_outputs != replayed_outputs {
        diffs.push(ReplayDiff {
            field: "output_hash".into(),
            original: original_outputs,
            replayed: replayed_outputs,
        });
    }

    let original_sequence = original.trace.sequence();
    let replayed_sequence = replayed.trace.sequence();
    if original_sequence != replayed_sequence {
        diffs.push(ReplayDiff {
            field: "decision_sequence".into(),
            original: format!("{original_sequence:?}"),
            replayed: format!("{replayed_sequence:?}"),
        });
    }

    diffs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::VirtualClock;
    use crate::common::TenantId;
    use crate::kernel::runs::manifest::{ManifestOutput, ManifestStatus};
    use crate::kernel::runs::trace::{DecisionKind, TraceRecorder};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn bundle_for(payload: serde_json::Value, steps: &[&str]) -> ReplayBundle {
        let run_id = RunId::new();
        let tenant = TenantId::new();
        let snapshot = InputSnapshot::capture(&payload, None);

        let recorder = TraceRecorder::new(Arc::new(VirtualClock::from_now()));
        for step in steps {
            recorder.allow(*step, "ok");
        }
        recorder.close(DecisionKind::Allow);

        let mut manifest = ManifestDocument::pending(
            run_id,
            tenant,
            None,
            "echo",
            Some(snapshot.clone()),
            Utc::now(),
        );
        manifest.status = ManifestStatus::Complete;
        manifest.final_decision = Some(DecisionKind::Allow);
        manifest.outputs.push(ManifestOutput {
            name: "result".into(),
            kind: "json".into(),
            reference: "inline:abc".into(),
            size: None,
            checksum: None,
            mime_type: None,
        });

        ReplayBundle::assemble(run_id, snapshot, recorder.snapshot(), manifest)
    }

    #[test]
    fn identical_runs_have_no_diffs() {
        let a = bundle_for(json!({"x": 1}), &["load", "emit"]);
        let mut b = a.clone();
        b.run_id = RunId::new();
        assert!(compare(&a, &b).is_empty());
    }

    #[test]
    fn different_inputs_report_input_hash() {
        let a = bundle_for(json!({"x": 1}), &["load"]);
        let b = bundle_for(json!({"x": 2}), &["load"]);
        let diffs = compare(&a, &b);
        assert!(diffs.iter().any(|d| d.field == "input_hash"));
    }

    #[test]
    fn different_decisions_report_sequence() {
        let a = bundle_for(json!({"x": 1}), &["load", "emit"]);
        let b = bundle_for(json!({"x": 1}), &["load"]);
        let diffs = compare(&a, &b);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].field, "decision_sequence");
    }
}
