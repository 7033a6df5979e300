// Object storage entry: opendal-backed store and provider configuration
pub mod cloud;
pub use cloud::{BackendConfig, CloudBackend, LocalBackend, ObjectStore, DEFAULT_BACKEND_RETRIES};

// Segment object format and its event frames
mod frames;
pub mod segment;
pub use segment::{CodecError, Segment, SegmentHeader, HEADER_SIZE};

pub mod retry;
pub use retry::RetryPolicy;

// Ordering model over the segment objects of one stream
pub mod manifest;
pub use manifest::{
    select_chain_in, ChainSelection, ConsistencyIssue, ManifestEntry, ResumeCursor,
    SegmentManifest,
};

pub mod collector;
pub use collector::{Collector, CollectorConfig, CycleOutcome, CycleReport};

pub mod apply_engine;
pub use apply_engine::{ApplyEngine, ApplyReport, ApplyState};

pub mod recoverer;
pub use recoverer::{Recoverer, RecovererConfig, RecoveryPlan, RecoveryReport, RecoveryTarget};

pub mod pitr_metrics;
