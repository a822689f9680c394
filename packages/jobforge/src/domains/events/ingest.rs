//! Event ingestion: validate the envelope, persist, audit, evaluate triggers.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use super::event::{Event, EventEnvelope, EVENT_VERSION};
use crate::domains::bundles::ChildStatus;
use crate::domains::triggers::{TriggerDecision, TriggerEvaluationResult, TriggerEvaluator};
use crate::kernel::audit::{AuditAction, AuditEntry};
use crate::kernel::error::{ForgeError, ForgeResult};
use crate::kernel::forge_kernel::ForgeKernel;

pub struct IngestOutcome {
    pub event: Event,
    pub trigger_results: Vec<TriggerEvaluationResult>,
}

pub struct EventIngestor {
    kernel: Arc<ForgeKernel>,
    evaluator: Option<Arc<TriggerEvaluator>>,
}

impl EventIngestor {
    pub fn new(kernel: Arc<ForgeKernel>) -> Self {
        Self {
            kernel,
            evaluator: None,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<TriggerEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Admit one event. The insert and its audit entry share a transaction;
    /// trigger evaluation follows, and the first enqueued child job becomes
    /// the event's `processing_job_id`.
    pub async fn ingest(&self, envelope: &EventEnvelope) -> ForgeResult<IngestOutcome> {
        if !self.kernel.flags.events_enabled {
            return Err(ForgeError::Disabled("events_enabled"));
        }
        if self.kernel.flags.security_validation_enabled {
            self.validate(envelope)?;
        }

        let now = self.kernel.now();
        let mut tx = self.kernel.db_pool.begin().await?;

        let event = Event::from_envelope(envelope, now).insert(&mut tx).await?;

        if self.kernel.flags.audit_logging_enabled {
            AuditEntry::builder()
                .tenant(event.tenant)
                .action(AuditAction::EventIngest)
                .event_id(event.id)
                .template_key(event.event_type.clone())
                .response_summary(json!({"trace_id": event.trace_id}))
                .created_at(now)
                .build()
                .insert(&mut tx)
                .await?;
        }

        tx.commit().await?;

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "event ingested"
        );

        let trigger_results = match (&self.evaluator, self.kernel.flags.triggers_enabled) {
            (Some(evaluator), true) => {
                let results = evaluator.evaluate_event(&event).await?;
                let processing_job_id = first_enqueued_job(&results);
                Event::mark_processed(
                    &self.kernel.db_pool,
                    event.id,
                    processing_job_id,
                    self.kernel.now(),
                )
                .await?;
                results
            }
            _ => Vec::new(),
        };

        Ok(IngestOutcome {
            event,
            trigger_results,
        })
    }

    fn validate(&self, envelope: &EventEnvelope) -> ForgeResult<()> {
        if envelope.event_version != EVENT_VERSION {
            return Err(ForgeError::BadInput(format!(
                "unsupported event version {}",
                envelope.event_version
            )));
        }
        if envelope.event_type.is_empty() || envelope.event_type.len() > 200 {
            return Err(ForgeError::BadInput(
                "event_type must be between 1 and 200 characters".into(),
            ));
        }
        if envelope.trace_id.is_empty() {
            return Err(ForgeError::BadInput("trace_id must not be empty".into()));
        }
        let size = serde_json::to_vec(&envelope.payload)
            .map_err(|e| ForgeError::BadInput(e.to_string()))?
            .len();
        if size > self.kernel.limits.max_payload_bytes {
            return Err(ForgeError::BadInput(format!(
                "payload of {size} bytes exceeds the {} byte limit",
                self.kernel.limits.max_payload_bytes
            )));
        }
        Ok(())
    }
}

/// First accepted child job across fires, in evaluation order.
fn first_enqueued_job(
    results: &[TriggerEvaluationResult],
) -> Option<crate::common::JobId> {
    results
        .iter()
        .filter(|r| r.decision == TriggerDecision::Fire)
        .filter_map(|r| r.bundle_summary.as_ref())
        .flat_map(|s| s.children.iter())
        .find(|c| c.status == ChildStatus::Accepted)
        .and_then(|c| c.job_id)
}
