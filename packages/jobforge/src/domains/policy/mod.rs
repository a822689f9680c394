//! Policy tokens: capability grants gating write-class jobs.

mod token;

pub use token::{
    GrantRequest, PolicyError, PolicySigner, PolicyToken, TokenExpectation, POLICY_TOKEN_VERSION,
};
