//! Input snapshot: the canonical, redacted record of what a run saw.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::canonical::{canonical_hash, canonical_json, extract_keys, redact_paths};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSnapshot {
    pub canonical_json: String,
    pub hash: String,
    pub original_size_bytes: u64,
    pub canonical_size_bytes: u64,
    pub input_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redacted_keys: Option<Vec<String>>,
}

impl InputSnapshot {
    /// Captures a payload, applying redaction hints before canonicalization.
    pub fn capture(payload: &Value, redaction_hints: Option<&[String]>) -> Self {
        let original_size_bytes = serde_json::to_vec(payload)
            .map(|b| b.len() as u64)
            .unwrap_or(0);

        let mut working = payload.clone();
        let redacted_keys = redaction_hints
            .map(|hints| redact_paths(&mut working, hints))
            .filter(|applied| !applied.is_empty());

        let canonical = canonical_json(&working);
        let hash = canonical_hash(&canonical);
        let input_keys = extract_keys(&working);

        Self {
            canonical_size_bytes: canonical.len() as u64,
            canonical_json: canonical,
            hash,
            original_size_bytes,
            input_keys,
            redacted_keys,
        }
    }

    /// True when the stored hash is recomputable from the canonical JSON.
    pub fn verify(&self) -> bool {
        canonical_hash(&self.canonical_json) == self.hash
    }
}
