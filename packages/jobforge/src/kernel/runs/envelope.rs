//! Run envelope: wires the determinism pieces around one job execution.
//!
//! The worker opens an envelope before the handler runs (input snapshot plus
//! a pending manifest) and finalizes it afterwards. When manifests are
//! disabled the envelope degrades to a no-op recorder so handlers can still
//! log decisions.

use serde_json::json;

use super::manifest::{Manifest, ManifestDocument, ManifestOutput, ManifestStatus};
use super::snapshot::InputSnapshot;
use super::trace::{DecisionKind, TraceRecorder};
use crate::common::canonical::{canonical_hash, canonical_json};
use crate::common::RunId;
use crate::kernel::error::ForgeResult;
use crate::kernel::forge_kernel::ForgeKernel;
use crate::kernel::jobs::{Job, JobError, JobOutput};

pub struct RunEnvelope {
    pub run_id: RunId,
    pub snapshot: InputSnapshot,
    pub recorder: TraceRecorder,
    document: Option<ManifestDocument>,
}

impl RunEnvelope {
    /// Captures the input snapshot and, when manifests are enabled, persists
    /// a pending manifest for this run.
    pub async fn open(kernel: &ForgeKernel, job: &Job) -> ForgeResult<Self> {
        let run_id = RunId::new();
        let snapshot = InputSnapshot::capture(&job.payload, None);
        let recorder = TraceRecorder::new(kernel.clock.clone());

        let document = if kernel.flags.manifests_enabled {
            let document = ManifestDocument::pending(
                run_id,
                job.tenant,
                None,
                job.job_type.clone(),
                Some(snapshot.clone()),
                kernel.now(),
            );
            let mut conn = kernel.db_pool.acquire().await?;
            Manifest::create_pending(&mut conn, &document).await?;
            Some(document)
        } else {
            None
        };

        Ok(Self {
            run_id,
            snapshot,
            recorder,
            document,
        })
    }

    /// Finalizes the run as complete, recording outputs and metrics.
    pub async fn finalize_success(
        mut self,
        kernel: &ForgeKernel,
        output: &JobOutput,
        duration_ms: i64,
    ) -> ForgeResult<()> {
        self.recorder.close(DecisionKind::Allow);

        let Some(mut document) = self.document.take() else {
            return Ok(());
        };

        document.status = ManifestStatus::Complete;
        document.final_decision = self.recorder.snapshot().final_decision;
        document.outputs = outputs_for(output);
        document
            .metrics
            .insert("duration_ms".to_string(), json!(duration_ms));
        if kernel.flags.replay_pack_enabled {
            document.decision_trace = Some(self.recorder.snapshot());
        }

        let mut conn = kernel.db_pool.acquire().await?;
        Manifest::finalize(
            &mut conn,
            document.tenant,
            self.run_id,
            &document,
            kernel.now(),
        )
        .await
    }

    /// Finalizes the run as failed.
    pub async fn finalize_failure(
        mut self,
        kernel: &ForgeKernel,
        error: &JobError,
        duration_ms: i64,
    ) -> ForgeResult<()> {
        self.recorder
            .close_with_error(format!("{}: {}", error.code, error.message));

        let Some(mut document) = self.document.take() else {
            return Ok(());
        };

        document.status = ManifestStatus::Failed;
        document.error = Some(format!("{}: {}", error.code, error.message));
        document
            .metrics
            .insert("duration_ms".to_string(), json!(duration_ms));
        if kernel.flags.replay_pack_enabled {
            document.decision_trace = Some(self.recorder.snapshot());
        }

        let mut conn = kernel.db_pool.acquire().await?;
        Manifest::finalize(
            &mut conn,
            document.tenant,
            self.run_id,
            &document,
            kernel.now(),
        )
        .await
    }
}

fn outputs_for(output: &JobOutput) -> Vec<ManifestOutput> {
    let mut outputs = Vec::new();

    let checksum = canonical_hash(&canonical_json(&output.result));
    outputs.push(ManifestOutput {
        name: "result".to_string(),
        kind: "json".to_string(),
        reference: format!("inline:{checksum}"),
        size: serde_json::to_vec(&output.result).ok().map(|b| b.len() as u64),
        checksum: Some(checksum),
        mime_type: Some("application/json".to_string()),
    });

    if let Some(artifact_ref) = &output.artifact_ref {
        outputs.push(ManifestOutput {
            name: "artifact".to_string(),
            kind: "artifact".to_string(),
            reference: artifact_ref.clone(),
            size: None,
            checksum: None,
            mime_type: None,
        });
    }

    outputs
}
