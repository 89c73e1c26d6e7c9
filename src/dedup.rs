//! Fingerprint-scoped content deduplication.
//!
//! An occurrence is a duplicate when the most recently stored occurrence for
//! the same fingerprint carries the same content hash. The hash covers the
//! event's identity-relevant fields only; volatile per-occurrence fields are
//! stripped before hashing. Retention of "already observed" is whatever the
//! store keeps; this module only computes the hash and asks.

use serde_json::Value;
use tracing::warn;

use crate::error::PipelineError;
use crate::store::AlertStore;
use crate::types::AlertEvent;

/// Fields excluded from the content hash: per-occurrence or derived values
/// that change on every retry without the underlying condition changing.
const VOLATILE_FIELDS: &[&str] = &[
  "lastReceived",
  "isDuplicate",
  "alertHash",
  "pushed",
  "eventId",
  "assignee",
  "deleted",
];

/// Compute the content hash for an event.
///
/// Serializes the event, strips volatile fields, and hashes the remainder.
/// serde_json objects serialize with sorted keys, so the digest is stable
/// across field insertion order.
pub fn content_hash(event: &AlertEvent) -> Result<String, PipelineError> {
  let mut value = serde_json::to_value(event)?;
  if let Value::Object(map) = &mut value {
    for field in VOLATILE_FIELDS {
      map.remove(*field);
    }
  }
  let canonical = serde_json::to_string(&value)?;
  let hash = blake3::hash(canonical.as_bytes());
  // First 16 bytes (32 hex chars) is plenty for equality checks.
  Ok(hash.to_hex()[..32].to_string())
}

/// `(content_hash, is_duplicate)` for one event.
///
/// Never fails: a hashing or store error is logged and treated as
/// not-duplicate so a broken lookup cannot drop live alerts.
pub fn is_duplicate(store: &dyn AlertStore, tenant: &str, event: &AlertEvent) -> (String, bool) {
  let hash = match content_hash(event) {
    Ok(h) => h,
    Err(e) => {
      warn!(fingerprint = %event.fingerprint, error = %e, "failed to hash event, treating as not duplicate");
      return (String::new(), false);
    }
  };

  let previous = match store.fetch_by_fingerprint(tenant, &event.fingerprint, 1) {
    Ok(rows) => rows,
    Err(e) => {
      warn!(fingerprint = %event.fingerprint, error = %e, "dedup lookup failed, treating as not duplicate");
      return (hash, false);
    }
  };

  let duplicate = previous
    .first()
    .and_then(|row| row.alert_hash.as_deref())
    .map(|prev| prev == hash)
    .unwrap_or(false);

  (hash, duplicate)
}
