//! Handler registry: maps job-type tags to typed handlers.
//!
//! A handler's input schema is its payload type: a claimed payload that fails
//! typed deserialization is terminal `BadInput` no matter how many attempts
//! remain. The registry owns per-handler execution policy (timeout, default
//! attempt budget); business logic lives with the handlers themselves.

use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::job::{Job, JobError};
use crate::kernel::error::{ForgeError, ForgeResult};
use crate::kernel::jobs::context::JobContext;

/// Default handler deadline (5 minutes).
pub const DEFAULT_TIMEOUT_MS: i64 = 300_000;

/// Execution policy attached to a handler at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Deadline for one run; a run past it fails with `Timeout`.
    pub timeout_ms: i64,
    /// Default attempt budget for jobs of this type when the caller does not
    /// choose one (the bundle executor consults this for child jobs).
    pub max_attempts: Option<i32>,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_attempts: None,
        }
    }
}

/// Successful handler output.
#[derive(Debug, Clone, Default)]
pub struct JobOutput {
    pub result: serde_json::Value,
    pub artifact_ref: Option<String>,
}

impl JobOutput {
    pub fn from_value(result: serde_json::Value) -> Self {
        Self {
            result,
            artifact_ref: None,
        }
    }

    pub fn with_artifact(mut self, artifact_ref: impl Into<String>) -> Self {
        self.artifact_ref = Some(artifact_ref.into());
        self
    }
}

type BoxedHandler = Box<
    dyn Fn(
            serde_json::Value,
            JobContext,
        ) -> Pin<Box<dyn Future<Output = Result<JobOutput, JobError>> + Send>>
        + Send
        + Sync,
>;

struct HandlerRegistration {
    /// Input-schema identity, used to detect incompatible re-registration.
    schema: TypeId,
    options: HandlerOptions,
    handler: BoxedHandler,
}

/// Registry that maps job-type tags to handlers.
#[derive(Default)]
pub struct JobRegistry {
    registrations: HashMap<&'static str, HandlerRegistration>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            registrations: HashMap::new(),
        }
    }

    /// Register a handler for a job type.
    ///
    /// `P` is the input schema. Registration is idempotent by tag:
    /// re-registering with the same schema and options is a no-op, while a
    /// different schema or policy for an existing tag is a `Conflict`.
    pub fn register<P, F, Fut>(
        &mut self,
        job_type: &'static str,
        options: HandlerOptions,
        handler: F,
    ) -> ForgeResult<()>
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, JobContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<JobOutput, JobError>> + Send + 'static,
    {
        let schema = TypeId::of::<P>();
        if let Some(existing) = self.registrations.get(job_type) {
            if existing.schema == schema && existing.options == options {
                return Ok(());
            }
            return Err(ForgeError::Conflict(format!(
                "handler for {job_type} already registered with a different schema"
            )));
        }

        let boxed: BoxedHandler = Box::new(move |value, ctx| {
            let handler = handler.clone();
            Box::pin(async move {
                let payload: P = serde_json::from_value(value).map_err(|e| {
                    JobError::new("BadInput", format!("payload rejected by {job_type} schema: {e}"))
                })?;
                handler(payload, ctx).await
            })
        });

        self.registrations.insert(
            job_type,
            HandlerRegistration {
                schema,
                options,
                handler: boxed,
            },
        );
        Ok(())
    }

    /// Execute a claimed job through its registered handler.
    pub async fn execute(&self, job: &Job, ctx: JobContext) -> Result<JobOutput, JobError> {
        let Some(registration) = self.registrations.get(job.job_type.as_str()) else {
            return Err(JobError::new(
                "BadInput",
                format!("unknown job type: {}", job.job_type),
            ));
        };

        (registration.handler)(job.payload.clone(), ctx).await
    }

    /// Execution policy for a job type; defaults when the tag is unknown.
    pub fn options(&self, job_type: &str) -> HandlerOptions {
        self.registrations
            .get(job_type)
            .map(|r| r.options.clone())
            .unwrap_or_default()
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.registrations.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        self.registrations.keys().copied().collect()
    }
}

/// Thread-safe registry handle as shared with workers.
pub type SharedJobRegistry = Arc<JobRegistry>;
