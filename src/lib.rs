//! Alert Ingestion & Correlation Engine.
//!
//! Ingests alert events from heterogeneous sources, deduplicates them by
//! fingerprint + content hash, enriches them with stored overrides,
//! correlates every batch against live saved queries ("presets") and fans
//! results out in real time as size-bounded batches on a tenant-scoped
//! channel, while handing surviving events to a workflow-automation queue.
//!
//! Persistence, the fanout transport, the workflow queue, the predicate
//! language and providers are collaborator traits; `memory` carries simple
//! in-memory implementations for the CLI driver and tests.

pub mod config;
pub mod dedup;
pub mod enrichment;
pub mod error;
pub mod fanout;
pub mod memory;
pub mod pipeline;
pub mod poller;
pub mod presets;
pub mod store;
pub mod tasks;
pub mod types;

pub use config::Config;
pub use error::PipelineError;
pub use pipeline::Pipeline;
pub use poller::{PollMode, Poller};
pub use types::{AlertEvent, AlertStatus, EnrichmentRecord, IngestRequest, Preset, PresetUpdate};
