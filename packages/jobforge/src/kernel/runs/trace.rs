//! Decision trace: the ordered log of policy and handler decisions in a run.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::clock::SharedClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Allow,
    Deny,
    Conditional,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub step_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: DecisionKind,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// The full trace, closed exactly once with a final decision or an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub decisions: Vec<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_decision: Option<DecisionKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DecisionTrace {
    pub fn is_closed(&self) -> bool {
        self.final_decision.is_some() || self.error.is_some()
    }

    /// The ordered (step, kind) sequence used for replay comparison.
    pub fn sequence(&self) -> Vec<(String, DecisionKind)> {
        self.decisions
            .iter()
            .map(|d| (d.step_id.clone(), d.kind))
            .collect()
    }
}

/// Shared handle handlers log through; the worker snapshots it at run end.
#[derive(Clone)]
pub struct TraceRecorder {
    trace: Arc<Mutex<DecisionTrace>>,
    clock: SharedClock,
}

impl TraceRecorder {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            trace: Arc::new(Mutex::new(DecisionTrace::default())),
            clock,
        }
    }

    pub fn record(
        &self,
        step_id: impl Into<String>,
        kind: DecisionKind,
        reason: impl Into<String>,
        input_context: Option<Value>,
        output_context: Option<Value>,
        duration_ms: Option<i64>,
    ) {
        let decision = Decision {
            step_id: step_id.into(),
            timestamp: self.clock.now(),
            kind,
            reason: reason.into(),
            input_context,
            output_context,
            duration_ms,
        };
        self.trace.lock().expect("trace lock").decisions.push(decision);
    }

    pub fn allow(&self, step_id: impl Into<String>, reason: impl Into<String>) {
        self.record(step_id, DecisionKind::Allow, reason, None, None, None);
    }

    pub fn deny(&self, step_id: impl Into<String>, reason: impl Into<String>) {
        self.record(step_id, DecisionKind::Deny, reason, None, None, None);
    }

    pub fn conditional(&self, step_id: impl Into<String>, reason: impl Into<String>) {
        self.record(step_id, DecisionKind::Conditional, reason, None, None, None);
    }

    /// Closes the trace with a final decision. First close wins.
    pub fn close(&self, final_decision: DecisionKind) {
        let mut trace = self.trace.lock().expect("trace lock");
        if !trace.is_closed() {
            trace.final_decision = Some(final_decision);
        }
    }

    /// Closes the trace with an error. First close wins.
    pub fn close_with_error(&self, error: impl Into<String>) {
        let mut trace = self.trace.lock().expect("trace lock");
        if !trace.is_closed() {
            trace.error = Some(error.into());
        }
    }

    pub fn snapshot(&self) -> DecisionTrace {
        self.trace.lock().expect("trace lock").clone()
    }
}
