//! Persistence collaborator boundary.
//!
//! The pipeline owns only the in-flight transformation; durable storage of
//! alerts, enrichment records and presets lives behind [`AlertStore`].

use serde_json::Value;

use crate::error::PipelineError;
use crate::types::{AlertEvent, EnrichmentRecord, Overrides, Preset};

/// One persisted alert occurrence.
#[derive(Debug, Clone)]
pub struct StoredAlert {
  /// Durable id assigned by the store.
  pub id: String,
  pub tenant: String,
  pub fingerprint: String,
  pub alert_hash: Option<String>,
  pub provider_type: Option<String>,
  pub provider_id: Option<String>,
  /// The typed event payload as persisted.
  pub event: AlertEvent,
}

/// Durable storage collaborator. Each call is assumed transactional on its
/// own; atomicity across a whole pipeline run is *not* guaranteed, and no
/// per-fingerprint locking is provided.
pub trait AlertStore: Send + Sync {
  /// Persist one occurrence and return its durable id.
  fn store(&self, tenant: &str, event: &AlertEvent) -> Result<String, PipelineError>;

  /// Archive one raw provider payload.
  fn store_raw(&self, tenant: &str, raw: &Value) -> Result<(), PipelineError>;

  /// Most recent occurrence per fingerprint, newest first, up to `limit`.
  fn fetch_recent(&self, tenant: &str, limit: usize) -> Result<Vec<StoredAlert>, PipelineError>;

  /// Every stored occurrence for the tenant, newest first, up to `limit`.
  fn fetch_all(&self, tenant: &str, limit: usize) -> Result<Vec<StoredAlert>, PipelineError>;

  /// All occurrences for one fingerprint, newest first, up to `limit`.
  fn fetch_by_fingerprint(
    &self,
    tenant: &str,
    fingerprint: &str,
    limit: usize,
  ) -> Result<Vec<StoredAlert>, PipelineError>;

  fn fetch_enrichment(
    &self,
    tenant: &str,
    fingerprint: &str,
  ) -> Result<Option<EnrichmentRecord>, PipelineError>;

  /// Merge `overrides` into the fingerprint's enrichment record, creating it
  /// if absent. Last write wins per key; records are never hard-deleted.
  fn upsert_enrichment(
    &self,
    tenant: &str,
    fingerprint: &str,
    overrides: &Overrides,
  ) -> Result<(), PipelineError>;

  /// Live saved queries, read fresh per evaluation pass.
  fn fetch_presets(&self, tenant: &str) -> Result<Vec<Preset>, PipelineError>;

  /// Flush pending writes for the current ingestion stage.
  fn commit(&self) -> Result<(), PipelineError>;
}
