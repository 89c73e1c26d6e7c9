//! Enrichment: externally sourced key/value overrides merged onto events.
//!
//! Three read-side steps, in fixed pipeline order:
//!
//! 1. extraction rules: pre-format, regex named groups over raw payloads
//! 2. mapping rules: post-format, lookup-table rows matched on attributes
//! 3. stored-enrichment merge: the fingerprint's [`EnrichmentRecord`]
//!    overlaid last, record wins, immediately before the event is exposed
//!
//! Plus the write side: manual enrich, soft delete/restore and assignment,
//! all of which upsert the fingerprint's enrichment record.

use regex::Regex;
use serde_json::{Map, Value};
use tracing::info;

use crate::error::PipelineError;
use crate::store::AlertStore;
use crate::types::{
  AlertEvent, AlertStatus, EnrichmentRecord, Overrides, ENRICHMENT_ASSIGNEES,
  ENRICHMENT_DELETED_AT,
};

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Pulls new attributes out of an existing one with a regex. Every named
/// capture group becomes an attribute on the event.
#[derive(Debug, Clone)]
pub struct ExtractionRule {
  pub attribute: String,
  pub pattern: Regex,
}

impl ExtractionRule {
  pub fn new(attribute: &str, pattern: &str) -> Result<Self, PipelineError> {
    let pattern = Regex::new(pattern)
      .map_err(|e| PipelineError::validation("pattern", e.to_string()))?;
    Ok(Self {
      attribute: attribute.to_string(),
      pattern,
    })
  }
}

/// Enriches events from a lookup table: the first row whose matcher
/// attributes all equal the event's wins, and its remaining columns are
/// applied as overrides.
#[derive(Debug, Clone)]
pub struct MappingRule {
  pub matchers: Vec<String>,
  pub rows: Vec<Overrides>,
}

/// Rule set applied by the pipeline. Both passes are best-effort: a failing
/// rule leaves the event unmodified.
#[derive(Debug, Clone, Default)]
pub struct Enricher {
  pub extraction: Vec<ExtractionRule>,
  pub mapping: Vec<MappingRule>,
}

impl Enricher {
  pub fn new(extraction: Vec<ExtractionRule>, mapping: Vec<MappingRule>) -> Self {
    Self { extraction, mapping }
  }

  /// Pre-format extraction over a raw JSON payload, in place.
  pub fn apply_extraction_raw(&self, raw: &mut Value) -> Result<(), PipelineError> {
    let map = match raw.as_object_mut() {
      Some(m) => m,
      None => return Ok(()), // nothing to extract from a non-object payload
    };
    for rule in &self.extraction {
      extract_into(map, rule);
    }
    Ok(())
  }

  /// Pre-format extraction over a typed event. The event round-trips through
  /// JSON so rules see the same attribute names the wire does.
  pub fn apply_extraction(&self, event: &mut AlertEvent) -> Result<(), PipelineError> {
    if self.extraction.is_empty() {
      return Ok(());
    }
    let mut value = serde_json::to_value(&*event)?;
    self.apply_extraction_raw(&mut value)?;
    *event = serde_json::from_value(value)?;
    Ok(())
  }

  /// Post-format mapping: apply the first matching row of each rule.
  pub fn apply_mapping(&self, event: &mut AlertEvent) -> Result<(), PipelineError> {
    if self.mapping.is_empty() {
      return Ok(());
    }
    let value = serde_json::to_value(&*event)?;
    let attrs = value
      .as_object()
      .ok_or_else(|| PipelineError::validation("event", "expected a JSON object"))?;

    for rule in &self.mapping {
      let row = rule.rows.iter().find(|row| {
        rule.matchers.iter().all(|m| {
          match (attrs.get(m), row.get(m)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
          }
        })
      });
      if let Some(row) = row {
        for (key, val) in row {
          if rule.matchers.contains(key) {
            continue;
          }
          event.overrides.insert(key.clone(), val.clone());
        }
      }
    }
    Ok(())
  }
}

fn extract_into(map: &mut Map<String, Value>, rule: &ExtractionRule) {
  let text = match map.get(&rule.attribute).and_then(Value::as_str) {
    Some(s) => s.to_string(),
    None => return, // attribute absent or not a string; rule does not apply
  };
  let captures = match rule.pattern.captures(&text) {
    Some(c) => c,
    None => return,
  };
  for name in rule.pattern.capture_names().flatten() {
    if let Some(m) = captures.name(name) {
      map.insert(name.to_string(), Value::String(m.as_str().to_string()));
    }
  }
}

// ---------------------------------------------------------------------------
// Stored-enrichment merge
// ---------------------------------------------------------------------------

/// Overlay a stored enrichment record onto an event; the record wins over
/// any in-flight value. Reserved keys are interpreted per occurrence:
/// `deletedAt` drives `deleted`, `assignees` drives `assignee`.
pub fn merge_stored_enrichment(event: &mut AlertEvent, record: &EnrichmentRecord) {
  for (key, value) in &record.enrichments {
    match key.as_str() {
      ENRICHMENT_DELETED_AT => {
        let deleted = value
          .as_array()
          .map(|list| list.iter().any(|v| v.as_str() == Some(event.last_received.as_str())))
          .unwrap_or(false);
        event.deleted = Some(deleted);
      }
      ENRICHMENT_ASSIGNEES => {
        event.assignee = value
          .as_object()
          .and_then(|m| m.get(&event.last_received))
          .and_then(Value::as_str)
          .map(str::to_string);
      }
      "status" => {
        if let Some(status) = value.as_str().and_then(AlertStatus::from_str_loose) {
          event.status = status;
        }
      }
      "isNoisy" => {
        if let Some(noisy) = value.as_bool() {
          event.is_noisy = Some(noisy);
        }
      }
      "name" => {
        if let Some(name) = value.as_str() {
          event.name = name.to_string();
        }
      }
      _ => {
        event.overrides.insert(key.clone(), value.clone());
      }
    }
  }
}

// ---------------------------------------------------------------------------
// Write operations
// ---------------------------------------------------------------------------

/// Manual enrichment: merge caller-supplied overrides into the record.
pub fn enrich_alert(
  store: &dyn AlertStore,
  tenant: &str,
  fingerprint: &str,
  overrides: &Overrides,
) -> Result<(), PipelineError> {
  info!(tenant, fingerprint, keys = overrides.len(), "enriching alert");
  store.upsert_enrichment(tenant, fingerprint, overrides)
}

/// Soft-delete or restore one occurrence via the `deletedAt` list. Deleting
/// an unassigned occurrence also assigns the acting user to it.
pub fn delete_alert(
  store: &dyn AlertStore,
  tenant: &str,
  fingerprint: &str,
  last_received: &str,
  actor: &str,
  restore: bool,
) -> Result<(), PipelineError> {
  let record = store.fetch_enrichment(tenant, fingerprint)?;
  let mut deleted = deleted_at_list(record.as_ref());
  let mut assignees = assignees_map(record.as_ref());

  if restore {
    deleted.retain(|ts| ts != last_received);
  } else if !deleted.iter().any(|ts| ts == last_received) {
    deleted.push(last_received.to_string());
  }

  if !assignees.contains_key(last_received) {
    assignees.insert(last_received.to_string(), Value::String(actor.to_string()));
  }

  let mut overrides = Overrides::new();
  overrides.insert(
    ENRICHMENT_DELETED_AT.into(),
    Value::Array(deleted.into_iter().map(Value::String).collect()),
  );
  overrides.insert(ENRICHMENT_ASSIGNEES.into(), Value::Object(assignees));

  info!(tenant, fingerprint, last_received, restore, "updated deletion state");
  store.upsert_enrichment(tenant, fingerprint, &overrides)
}

/// Assign or unassign one occurrence via the `assignees` map.
pub fn assign_alert(
  store: &dyn AlertStore,
  tenant: &str,
  fingerprint: &str,
  last_received: &str,
  actor: &str,
  unassign: bool,
) -> Result<(), PipelineError> {
  let record = store.fetch_enrichment(tenant, fingerprint)?;
  let mut assignees = assignees_map(record.as_ref());

  if unassign {
    assignees.remove(last_received);
  } else {
    assignees.insert(last_received.to_string(), Value::String(actor.to_string()));
  }

  let mut overrides = Overrides::new();
  overrides.insert(ENRICHMENT_ASSIGNEES.into(), Value::Object(assignees));

  info!(tenant, fingerprint, last_received, unassign, "updated assignment");
  store.upsert_enrichment(tenant, fingerprint, &overrides)
}

fn deleted_at_list(record: Option<&EnrichmentRecord>) -> Vec<String> {
  record
    .and_then(|r| r.enrichments.get(ENRICHMENT_DELETED_AT))
    .and_then(Value::as_array)
    .map(|list| {
      list
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
    })
    .unwrap_or_default()
}

fn assignees_map(record: Option<&EnrichmentRecord>) -> Map<String, Value> {
  record
    .and_then(|r| r.enrichments.get(ENRICHMENT_ASSIGNEES))
    .and_then(Value::as_object)
    .cloned()
    .unwrap_or_default()
}
