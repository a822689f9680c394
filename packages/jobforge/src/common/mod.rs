//! Shared leaf utilities: canonical encoding, backoff, clocks, typed IDs.

pub mod backoff;
pub mod canonical;
pub mod clock;
pub mod entity_ids;
pub mod id;

pub use backoff::{backoff_ms, MAX_BACKOFF_MS, MIN_BACKOFF_MS};
pub use clock::{Clock, SharedClock, SystemClock, VirtualClock};
pub use entity_ids::*;
pub use id::Id;
