//! HMAC-signed capability grants for write-class jobs.
//!
//! A token's signature covers the canonical encoding (sorted keys, no
//! whitespace) of every field except `signature` itself. Verification
//! re-canonicalizes and compares MACs with `Mac::verify_slice`, which runs
//! in constant time. The signing secret is injected, never persisted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use typed_builder::TypedBuilder;

use crate::common::canonical::{canonical_json, to_canonical_value};
use crate::common::clock::SharedClock;
use crate::common::{PolicyTokenId, ProjectId, TenantId};
use crate::kernel::forge_kernel::ForgeKernel;

pub const POLICY_TOKEN_VERSION: &str = "1.0";

type HmacSha256 = Hmac<Sha256>;

/// Typed rejection causes surfaced at the policy boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("policy token expired")]
    Expired,
    #[error("policy token tenant does not match")]
    TenantMismatch,
    #[error("policy token scopes do not cover {0}")]
    ScopeInsufficient(String),
    #[error("policy token action does not match {0}")]
    ActionMismatch(String),
    #[error("policy token signature is invalid")]
    BadSignature,
    #[error("no policy token signing secret is configured")]
    SecretMissing,
}

impl PolicyError {
    /// Stable code string for audit summaries.
    pub fn code(&self) -> &'static str {
        match self {
            PolicyError::Expired => "Expired",
            PolicyError::TenantMismatch => "TenantMismatch",
            PolicyError::ScopeInsufficient(_) => "ScopeInsufficient",
            PolicyError::ActionMismatch(_) => "ActionMismatch",
            PolicyError::BadSignature => "BadSignature",
            PolicyError::SecretMissing => "SecretMissing",
        }
    }
}

/// Wire form of a capability grant. `signature` is base64url, no padding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyToken {
    pub id: PolicyTokenId,
    pub version: String,
    pub issued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub tenant: TenantId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectId>,
    pub actor: String,
    pub scopes: Vec<String>,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub signature: String,
}

impl PolicyToken {
    /// Canonical bytes the signature covers: every field except `signature`.
    fn signing_payload(&self) -> Result<String, PolicyError> {
        let mut value = to_canonical_value(self).map_err(|_| PolicyError::BadSignature)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("signature");
        }
        Ok(canonical_json(&value))
    }
}

/// Parameters for issuing a grant.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct GrantRequest {
    pub tenant: TenantId,
    #[builder(default, setter(strip_option))]
    pub project: Option<ProjectId>,
    pub actor: String,
    pub scopes: Vec<String>,
    pub action: String,
    #[builder(default, setter(strip_option))]
    pub resource: Option<String>,
    #[builder(default, setter(strip_option))]
    pub context: Option<Value>,
    /// Overrides the signer's default expiry.
    #[builder(default, setter(strip_option))]
    pub expires_at: Option<DateTime<Utc>>,
}

/// What the admission point demands of a token.
#[derive(Debug, Clone)]
pub struct TokenExpectation {
    pub tenant: TenantId,
    pub action: String,
    pub required_scopes: Vec<String>,
}

/// Issues and verifies policy tokens with the injected secret.
pub struct PolicySigner {
    secret: Vec<u8>,
    clock: SharedClock,
    default_expiry: Duration,
}

impl PolicySigner {
    pub fn new(secret: Vec<u8>, clock: SharedClock, default_expiry: Duration) -> Self {
        Self {
            secret,
            clock,
            default_expiry,
        }
    }

    /// Builds a signer from the kernel; `SecretMissing` when none configured.
    pub fn from_kernel(kernel: &ForgeKernel) -> Result<Self, PolicyError> {
        let secret = kernel
            .policy_secret
            .clone()
            .ok_or(PolicyError::SecretMissing)?;
        Ok(Self::new(
            secret,
            kernel.clock.clone(),
            Duration::hours(kernel.policy_token_expiry_hours),
        ))
    }

    /// Issues a signed grant; default expiry one hour from issuance.
    pub fn issue(&self, request: GrantRequest) -> Result<PolicyToken, PolicyError> {
        let issued_at = self.clock.now();
        let mut token = PolicyToken {
            id: PolicyTokenId::new(),
            version: POLICY_TOKEN_VERSION.to_string(),
            issued_at,
            expires_at: Some(
                request
                    .expires_at
                    .unwrap_or(issued_at + self.default_expiry),
            ),
            tenant: request.tenant,
            project: request.project,
            actor: request.actor,
            scopes: request.scopes,
            action: request.action,
            resource: request.resource,
            context: request.context,
            signature: String::new(),
        };

        let payload = token.signing_payload()?;
        token.signature = URL_SAFE_NO_PAD.encode(self.mac_bytes(payload.as_bytes()));
        Ok(token)
    }

    /// Verifies signature, expiry, tenant, action, and scope coverage.
    pub fn verify(
        &self,
        token: &PolicyToken,
        expectation: &TokenExpectation,
    ) -> Result<(), PolicyError> {
        // Nothing else is trustworthy until the MAC checks out.
        let payload = token.signing_payload()?;
        let signature = URL_SAFE_NO_PAD
            .decode(token.signature.as_bytes())
            .map_err(|_| PolicyError::BadSignature)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| PolicyError::SecretMissing)?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| PolicyError::BadSignature)?;

        if let Some(expires_at) = token.expires_at {
            if expires_at <= self.clock.now() {
                return Err(PolicyError::Expired);
            }
        }
        if token.tenant != expectation.tenant {
            return Err(PolicyError::TenantMismatch);
        }
        if token.action != expectation.action {
            return Err(PolicyError::ActionMismatch(expectation.action.clone()));
        }
        for required in &expectation.required_scopes {
            if !token.scopes.contains(required) {
                return Err(PolicyError::ScopeInsufficient(required.clone()));
            }
        }

        Ok(())
    }

    fn mac_bytes(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts any key length");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}
