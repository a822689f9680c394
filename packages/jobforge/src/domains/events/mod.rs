//! Event ingestion: the pinned envelope, the stored row, and the gated
//! ingestor that feeds trigger evaluation.

mod event;
mod ingest;

pub use event::{
    Event, EventEnvelope, EventSubject, SourceApp, SourceModule, EVENT_VERSION,
};
pub use ingest::{EventIngestor, IngestOutcome};
