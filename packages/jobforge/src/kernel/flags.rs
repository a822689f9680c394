//! Feature-flag registry.
//!
//! A fixed, enumerated set of runtime switches. Everything defaults OFF
//! except `require_policy_tokens` and `security_validation_enabled`, which
//! default ON. The registry rejects unknown names; flags are process-wide
//! state initialized once at startup, and changes after init require a
//! restart.

use crate::kernel::error::{ForgeError, ForgeResult};

/// The legal flag names, in declaration order.
pub const FLAG_NAMES: [&str; 11] = [
    "events_enabled",
    "triggers_enabled",
    "autopilot_jobs_enabled",
    "action_jobs_enabled",
    "manifests_enabled",
    "replay_pack_enabled",
    "bundle_triggers_enabled",
    "audit_logging_enabled",
    "rate_limiting_enabled",
    "security_validation_enabled",
    "require_policy_tokens",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Event ingestion and trigger evaluation permitted.
    pub events_enabled: bool,
    /// Trigger rules are evaluated; off short-circuits every rule to `skip`.
    pub triggers_enabled: bool,
    /// Bundle executor accepts requests; off rejects with `Disabled`.
    pub autopilot_jobs_enabled: bool,
    /// Write-class jobs admissible (still subject to policy tokens).
    pub action_jobs_enabled: bool,
    /// Manifests produced for each run.
    pub manifests_enabled: bool,
    /// Replay bundles exported.
    pub replay_pack_enabled: bool,
    /// Trigger rules may fire bundles.
    pub bundle_triggers_enabled: bool,
    /// Admission points write audit entries.
    pub audit_logging_enabled: bool,
    /// Trigger sliding-window rate limit enforced.
    pub rate_limiting_enabled: bool,
    /// Payload-size and field-shape limits enforced.
    pub security_validation_enabled: bool,
    /// Action jobs refused without a valid policy token.
    pub require_policy_tokens: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            events_enabled: false,
            triggers_enabled: false,
            autopilot_jobs_enabled: false,
            action_jobs_enabled: false,
            manifests_enabled: false,
            replay_pack_enabled: false,
            bundle_triggers_enabled: false,
            audit_logging_enabled: false,
            rate_limiting_enabled: false,
            security_validation_enabled: true,
            require_policy_tokens: true,
        }
    }
}

impl FeatureFlags {
    /// Sets a flag by name, rejecting names outside the registry.
    pub fn set(&mut self, name: &str, on: bool) -> ForgeResult<()> {
        match name {
            "events_enabled" => self.events_enabled = on,
            "triggers_enabled" => self.triggers_enabled = on,
            "autopilot_jobs_enabled" => self.autopilot_jobs_enabled = on,
            "action_jobs_enabled" => self.action_jobs_enabled = on,
            "manifests_enabled" => self.manifests_enabled = on,
            "replay_pack_enabled" => self.replay_pack_enabled = on,
            "bundle_triggers_enabled" => self.bundle_triggers_enabled = on,
            "audit_logging_enabled" => self.audit_logging_enabled = on,
            "rate_limiting_enabled" => self.rate_limiting_enabled = on,
            "security_validation_enabled" => self.security_validation_enabled = on,
            "require_policy_tokens" => self.require_policy_tokens = on,
            other => return Err(ForgeError::BadInput(format!("unknown feature flag: {other}"))),
        }
        Ok(())
    }

    /// Reads a flag by name, rejecting names outside the registry.
    pub fn get(&self, name: &str) -> ForgeResult<bool> {
        Ok(match name {
            "events_enabled" => self.events_enabled,
            "triggers_enabled" => self.triggers_enabled,
            "autopilot_jobs_enabled" => self.autopilot_jobs_enabled,
            "action_jobs_enabled" => self.action_jobs_enabled,
            "manifests_enabled" => self.manifests_enabled,
            "replay_pack_enabled" => self.replay_pack_enabled,
            "bundle_triggers_enabled" => self.bundle_triggers_enabled,
            "audit_logging_enabled" => self.audit_logging_enabled,
            "rate_limiting_enabled" => self.rate_limiting_enabled,
            "security_validation_enabled" => self.security_validation_enabled,
            "require_policy_tokens" => self.require_policy_tokens,
            other => return Err(ForgeError::BadInput(format!("unknown feature flag: {other}"))),
        })
    }

    /// Loads flags from `JOBFORGE_<NAME>` environment variables.
    ///
    /// Accepted truthy values: `1`, `true`, `on` (case-insensitive).
    pub fn from_env() -> Self {
        let mut flags = Self::default();
        for name in FLAG_NAMES {
            let var = format!("JOBFORGE_{}", name.to_uppercase());
            if let Ok(raw) = std::env::var(&var) {
                let on = matches!(raw.to_lowercase().as_str(), "1" | "true" | "on");
                // Names come from the registry itself.
                flags.set(name, on).expect("registry name");
            }
        }
        flags
    }
}
