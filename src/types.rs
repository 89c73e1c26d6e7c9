//! Core types for the alert pipeline (JSON contracts + internal models).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Open key/value attribute map carried on events and enrichment records.
///
/// BTreeMap so serialized output (and therefore content hashes and fanout
/// batch sizes) is deterministic.
pub type Overrides = BTreeMap<String, Value>;

/// Reserved enrichment key: list of `lastReceived` timestamps whose
/// occurrences are soft-deleted.
pub const ENRICHMENT_DELETED_AT: &str = "deletedAt";
/// Reserved enrichment key: map from `lastReceived` timestamp to assignee.
pub const ENRICHMENT_ASSIGNEES: &str = "assignees";

/// Source name applied to events that arrive without one.
pub const DEFAULT_SOURCE: &str = "internal";

// ---------------------------------------------------------------------------
// Alert status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
  Firing,
  Resolved,
  Acknowledged,
  Suppressed,
  Pending,
}

impl AlertStatus {
  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s.to_ascii_lowercase().as_str() {
      "firing" | "alerting" | "active" => Some(Self::Firing),
      "resolved" | "ok" | "closed" => Some(Self::Resolved),
      "acknowledged" | "ack" => Some(Self::Acknowledged),
      "suppressed" | "silenced" => Some(Self::Suppressed),
      "pending" => Some(Self::Pending),
      _ => None,
    }
  }
}

impl Default for AlertStatus {
  fn default() -> Self {
    Self::Firing
  }
}

// ---------------------------------------------------------------------------
// Alert event
// ---------------------------------------------------------------------------

/// One alert occurrence flowing through the pipeline.
///
/// `fingerprint` + `lastReceived` identify a unique occurrence; `alertHash`
/// identifies duplicate *content* among occurrences sharing a fingerprint.
/// Unknown inbound attributes land in `overrides` via the flatten map and are
/// preserved on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
  pub fingerprint: String,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub source: Vec<String>,
  #[serde(default)]
  pub status: AlertStatus,
  /// RFC3339 receive time. Kept as a string on the wire; the pipeline
  /// normalizes invalid or missing values to "now" before persistence.
  #[serde(default)]
  pub last_received: String,
  #[serde(default)]
  pub is_duplicate: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub alert_hash: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub provider_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub provider_type: Option<String>,
  /// Durable id assigned by the persistence collaborator.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub event_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub is_noisy: Option<bool>,
  /// Set once the event has been handed to fanout.
  #[serde(default)]
  pub pushed: bool,
  /// Derived from the `assignees` enrichment key for this occurrence.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub assignee: Option<String>,
  /// Derived from the `deletedAt` enrichment key for this occurrence.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub deleted: Option<bool>,
  #[serde(flatten)]
  pub overrides: Overrides,
}

impl AlertEvent {
  /// Minimal event constructor; everything else starts at its default.
  pub fn new(fingerprint: impl Into<String>, status: AlertStatus) -> Self {
    Self {
      fingerprint: fingerprint.into(),
      name: String::new(),
      source: Vec::new(),
      status,
      last_received: String::new(),
      is_duplicate: false,
      alert_hash: None,
      provider_id: None,
      provider_type: None,
      event_id: None,
      is_noisy: None,
      pushed: false,
      assignee: None,
      deleted: None,
      overrides: Overrides::new(),
    }
  }
}

// ---------------------------------------------------------------------------
// Enrichment record
// ---------------------------------------------------------------------------

/// Stored key/value overrides for one fingerprint. Upserted, never
/// hard-deleted; last write wins per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
  pub fingerprint: String,
  pub enrichments: Overrides,
}

impl EnrichmentRecord {
  pub fn new(fingerprint: impl Into<String>) -> Self {
    Self {
      fingerprint: fingerprint.into(),
      enrichments: Overrides::new(),
    }
  }
}

// ---------------------------------------------------------------------------
// Presets
// ---------------------------------------------------------------------------

/// A saved boolean query over alert attributes, re-evaluated against every
/// incoming batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
  pub id: String,
  pub name: String,
  /// Predicate source in the external expression language.
  pub query: String,
  /// Static config flag: this preset should alert a live client whenever it
  /// matches firing events.
  #[serde(default)]
  pub is_noisy: bool,
}

/// Per-evaluation output for one preset. Transient: recomputed on every
/// pass, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct PresetUpdate {
  #[serde(flatten)]
  pub preset: Preset,
  pub alerts_count: usize,
  pub should_do_noise_now: bool,
}

// ---------------------------------------------------------------------------
// Ingress contract
// ---------------------------------------------------------------------------

/// One inbound ingestion batch. Unknown event fields are preserved in each
/// event's override map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
  pub tenant: String,
  #[serde(default)]
  pub provider_type: Option<String>,
  #[serde(default)]
  pub provider_id: Option<String>,
  /// If present, replaces every event's own fingerprint before dedup.
  #[serde(default)]
  pub fingerprint: Option<String>,
  pub events: Vec<AlertEvent>,
  /// Raw provider payloads, archived only when the config flag is set.
  #[serde(default)]
  pub raw_events: Vec<Value>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_parses_loosely() {
    assert_eq!(AlertStatus::from_str_loose("FIRING"), Some(AlertStatus::Firing));
    assert_eq!(AlertStatus::from_str_loose("ok"), Some(AlertStatus::Resolved));
    assert_eq!(AlertStatus::from_str_loose("ack"), Some(AlertStatus::Acknowledged));
    assert_eq!(AlertStatus::from_str_loose("???"), None);
  }

  #[test]
  fn unknown_fields_land_in_overrides() {
    let json = r#"{
      "fingerprint": "f1",
      "status": "firing",
      "lastReceived": "2025-01-15T10:30:00Z",
      "service": "api",
      "severity": "critical"
    }"#;
    let event: AlertEvent = serde_json::from_str(json).unwrap();
    assert_eq!(event.fingerprint, "f1");
    assert_eq!(event.overrides.get("service").unwrap(), "api");
    assert_eq!(event.overrides.get("severity").unwrap(), "critical");
  }

  #[test]
  fn overrides_round_trip_on_the_wire() {
    let mut event = AlertEvent::new("f1", AlertStatus::Firing);
    event.overrides.insert("team".into(), "payments".into());
    let json = serde_json::to_string(&event).unwrap();
    let back: AlertEvent = serde_json::from_str(&json).unwrap();
    assert_eq!(back.overrides.get("team").unwrap(), "payments");
  }

  #[test]
  fn none_fields_are_omitted_from_wire() {
    let event = AlertEvent::new("f1", AlertStatus::Firing);
    let json = serde_json::to_string(&event).unwrap();
    assert!(!json.contains("alertHash"));
    assert!(!json.contains("eventId"));
    assert!(!json.contains("assignee"));
  }
}
