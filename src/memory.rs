//! In-memory collaborator implementations.
//!
//! These back the CLI driver and the test suite. They are deliberately
//! simple: a `Vec`-backed store with uuid ids, a recording fanout channel
//! and workflow queue, a scripted provider, and a small equality/
//! inequality conjunction evaluator standing in for the external predicate
//! language.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::fanout::FanoutChannel;
use crate::pipeline::{GroupingRules, WorkflowDispatch};
use crate::poller::AlertProvider;
use crate::presets::PredicateEvaluator;
use crate::store::{AlertStore, StoredAlert};
use crate::types::{AlertEvent, EnrichmentRecord, Overrides, Preset};

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreInner {
  alerts: Vec<StoredAlert>,
  raw: Vec<Value>,
  enrichments: HashMap<(String, String), EnrichmentRecord>,
  presets: HashMap<String, Vec<Preset>>,
  commits: usize,
}

/// Vec-backed [`AlertStore`]. Insertion order doubles as receive order, so
/// "newest" means "pushed last".
#[derive(Default)]
pub struct InMemoryStore {
  inner: Mutex<StoreInner>,
}

impl InMemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_presets(&self, tenant: &str, presets: Vec<Preset>) {
    self.inner.lock().presets.insert(tenant.to_string(), presets);
  }

  pub fn alert_count(&self) -> usize {
    self.inner.lock().alerts.len()
  }

  pub fn raw_count(&self) -> usize {
    self.inner.lock().raw.len()
  }

  pub fn commit_count(&self) -> usize {
    self.inner.lock().commits
  }
}

impl AlertStore for InMemoryStore {
  fn store(&self, tenant: &str, event: &AlertEvent) -> Result<String, PipelineError> {
    let id = Uuid::new_v4().to_string();
    self.inner.lock().alerts.push(StoredAlert {
      id: id.clone(),
      tenant: tenant.to_string(),
      fingerprint: event.fingerprint.clone(),
      alert_hash: event.alert_hash.clone(),
      provider_type: event.provider_type.clone(),
      provider_id: event.provider_id.clone(),
      event: event.clone(),
    });
    Ok(id)
  }

  fn store_raw(&self, _tenant: &str, raw: &Value) -> Result<(), PipelineError> {
    self.inner.lock().raw.push(raw.clone());
    Ok(())
  }

  fn fetch_recent(&self, tenant: &str, limit: usize) -> Result<Vec<StoredAlert>, PipelineError> {
    let inner = self.inner.lock();
    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    for row in inner.alerts.iter().rev() {
      if row.tenant != tenant || !seen.insert(row.fingerprint.clone()) {
        continue;
      }
      rows.push(row.clone());
      if rows.len() == limit {
        break;
      }
    }
    Ok(rows)
  }

  fn fetch_all(&self, tenant: &str, limit: usize) -> Result<Vec<StoredAlert>, PipelineError> {
    let inner = self.inner.lock();
    Ok(
      inner
        .alerts
        .iter()
        .rev()
        .filter(|row| row.tenant == tenant)
        .take(limit)
        .cloned()
        .collect(),
    )
  }

  fn fetch_by_fingerprint(
    &self,
    tenant: &str,
    fingerprint: &str,
    limit: usize,
  ) -> Result<Vec<StoredAlert>, PipelineError> {
    let inner = self.inner.lock();
    Ok(
      inner
        .alerts
        .iter()
        .rev()
        .filter(|row| row.tenant == tenant && row.fingerprint == fingerprint)
        .take(limit)
        .cloned()
        .collect(),
    )
  }

  fn fetch_enrichment(
    &self,
    tenant: &str,
    fingerprint: &str,
  ) -> Result<Option<EnrichmentRecord>, PipelineError> {
    let inner = self.inner.lock();
    Ok(inner.enrichments.get(&(tenant.to_string(), fingerprint.to_string())).cloned())
  }

  fn upsert_enrichment(
    &self,
    tenant: &str,
    fingerprint: &str,
    overrides: &Overrides,
  ) -> Result<(), PipelineError> {
    let mut inner = self.inner.lock();
    let record = inner
      .enrichments
      .entry((tenant.to_string(), fingerprint.to_string()))
      .or_insert_with(|| EnrichmentRecord::new(fingerprint));
    for (key, value) in overrides {
      record.enrichments.insert(key.clone(), value.clone());
    }
    Ok(())
  }

  fn fetch_presets(&self, tenant: &str) -> Result<Vec<Preset>, PipelineError> {
    Ok(self.inner.lock().presets.get(tenant).cloned().unwrap_or_default())
  }

  fn commit(&self) -> Result<(), PipelineError> {
    self.inner.lock().commits += 1;
    Ok(())
  }
}

// ---------------------------------------------------------------------------
// Fanout channel
// ---------------------------------------------------------------------------

/// One captured fanout publish.
#[derive(Debug, Clone)]
pub struct FanoutMessage {
  pub topic: String,
  pub kind: String,
  pub payload: String,
}

/// Recording [`FanoutChannel`], optionally failing the first N publishes.
#[derive(Default)]
pub struct InMemoryChannel {
  messages: Mutex<Vec<FanoutMessage>>,
  failures_left: AtomicUsize,
}

impl InMemoryChannel {
  pub fn new() -> Self {
    Self::default()
  }

  /// Channel whose first `n` publishes fail.
  pub fn failing_first(n: usize) -> Self {
    Self {
      messages: Mutex::new(Vec::new()),
      failures_left: AtomicUsize::new(n),
    }
  }

  pub fn messages(&self) -> Vec<FanoutMessage> {
    self.messages.lock().clone()
  }

  pub fn messages_of_kind(&self, kind: &str) -> Vec<FanoutMessage> {
    self.messages.lock().iter().filter(|m| m.kind == kind).cloned().collect()
  }
}

impl FanoutChannel for InMemoryChannel {
  fn trigger(&self, topic: &str, kind: &str, payload: &str) -> Result<(), PipelineError> {
    if self
      .failures_left
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok()
    {
      return Err(PipelineError::channel("injected publish failure"));
    }
    self.messages.lock().push(FanoutMessage {
      topic: topic.to_string(),
      kind: kind.to_string(),
      payload: payload.to_string(),
    });
    Ok(())
  }
}

// ---------------------------------------------------------------------------
// Workflow queue + grouping
// ---------------------------------------------------------------------------

/// Records every enqueued batch.
#[derive(Default)]
pub struct RecordingWorkflow {
  batches: Mutex<Vec<Vec<AlertEvent>>>,
}

impl RecordingWorkflow {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn batches(&self) -> Vec<Vec<AlertEvent>> {
    self.batches.lock().clone()
  }
}

impl WorkflowDispatch for RecordingWorkflow {
  fn enqueue(&self, _tenant: &str, events: &[AlertEvent]) -> Result<(), PipelineError> {
    self.batches.lock().push(events.to_vec());
    Ok(())
  }
}

/// Grouping rules that never derive anything.
pub struct NoopGrouping;

impl GroupingRules for NoopGrouping {
  fn run(&self, _tenant: &str, _events: &[AlertEvent]) -> Result<Vec<AlertEvent>, PipelineError> {
    Ok(Vec::new())
  }
}

// ---------------------------------------------------------------------------
// Predicate evaluator
// ---------------------------------------------------------------------------

/// Minimal stand-in for the external predicate language: conjunctions of
/// `attr == literal` / `attr != literal` clauses joined by `&&`, literals in
/// JSON syntax. Not a full expression language.
pub struct FieldMatchEvaluator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClauseOp {
  Eq,
  Ne,
}

#[derive(Debug, Clone)]
struct Clause {
  attribute: String,
  op: ClauseOp,
  value: Value,
}

impl FieldMatchEvaluator {
  fn parse_clauses(query: &str) -> Result<Vec<Clause>, PipelineError> {
    let mut clauses = Vec::new();
    let mut column = 1u32;
    for part in query.split("&&") {
      let clause = part.trim();
      let parsed = clause
        .split_once("==")
        .map(|(lhs, rhs)| (lhs, ClauseOp::Eq, rhs))
        .or_else(|| clause.split_once("!=").map(|(lhs, rhs)| (lhs, ClauseOp::Ne, rhs)));
      let Some((lhs, op, rhs)) = parsed else {
        return Err(parse_error(query, column, "expected `attr == value` or `attr != value`"));
      };
      let attribute = lhs.trim();
      if attribute.is_empty() {
        return Err(parse_error(query, column, "missing attribute name"));
      }
      let value: Value = serde_json::from_str(rhs.trim())
        .map_err(|_| parse_error(query, column, "literal must be valid JSON"))?;
      clauses.push(Clause {
        attribute: attribute.to_string(),
        op,
        value,
      });
      column += part.len() as u32 + 2;
    }
    Ok(clauses)
  }
}

fn parse_error(query: &str, column: u32, message: &str) -> PipelineError {
  PipelineError::QueryParse {
    query: query.to_string(),
    line: 1,
    column,
    message: message.to_string(),
  }
}

impl PredicateEvaluator for FieldMatchEvaluator {
  fn parse(&self, query: &str) -> Result<(), PipelineError> {
    Self::parse_clauses(query).map(|_| ())
  }

  fn evaluate(&self, query: &str, event: &AlertEvent) -> Result<bool, PipelineError> {
    let clauses = Self::parse_clauses(query)?;
    let value = serde_json::to_value(event)?;
    let attrs = value.as_object().cloned().unwrap_or_default();
    Ok(clauses.iter().all(|clause| {
      let actual = attrs.get(&clause.attribute).unwrap_or(&Value::Null);
      match clause.op {
        ClauseOp::Eq => *actual == clause.value,
        ClauseOp::Ne => *actual != clause.value,
      }
    }))
  }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Provider returning a fixed fingerprint → occurrences map.
pub struct ScriptedProvider {
  id: String,
  provider_type: String,
  alerts: BTreeMap<String, Vec<AlertEvent>>,
}

impl ScriptedProvider {
  pub fn new(id: &str, provider_type: &str) -> Self {
    Self {
      id: id.to_string(),
      provider_type: provider_type.to_string(),
      alerts: BTreeMap::new(),
    }
  }

  /// Occurrences must be ordered most recent first, as providers return them.
  pub fn with_alerts(mut self, fingerprint: &str, occurrences: Vec<AlertEvent>) -> Self {
    self.alerts.insert(fingerprint.to_string(), occurrences);
    self
  }
}

impl AlertProvider for ScriptedProvider {
  fn id(&self) -> &str {
    &self.id
  }

  fn provider_type(&self) -> &str {
    &self.provider_type
  }

  fn alerts_by_fingerprint(
    &self,
    _tenant: &str,
  ) -> Result<BTreeMap<String, Vec<AlertEvent>>, PipelineError> {
    Ok(self.alerts.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::AlertStatus;

  #[test]
  fn recent_returns_last_occurrence_per_fingerprint_newest_first() {
    let store = InMemoryStore::new();
    let mut first = AlertEvent::new("f1", AlertStatus::Firing);
    first.name = "old".into();
    store.store("t1", &first).unwrap();
    let mut second = AlertEvent::new("f1", AlertStatus::Resolved);
    second.name = "new".into();
    store.store("t1", &second).unwrap();
    store.store("t1", &AlertEvent::new("f2", AlertStatus::Firing)).unwrap();
    store.store("other", &AlertEvent::new("f3", AlertStatus::Firing)).unwrap();

    let rows = store.fetch_recent("t1", 10).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].fingerprint, "f2");
    assert_eq!(rows[1].fingerprint, "f1");
    assert_eq!(rows[1].event.name, "new");
  }

  #[test]
  fn upsert_enrichment_is_last_write_wins_per_key() {
    let store = InMemoryStore::new();
    let mut overrides = Overrides::new();
    overrides.insert("team".into(), "billing".into());
    overrides.insert("tier".into(), "gold".into());
    store.upsert_enrichment("t1", "f1", &overrides).unwrap();

    let mut update = Overrides::new();
    update.insert("team".into(), "payments".into());
    store.upsert_enrichment("t1", "f1", &update).unwrap();

    let record = store.fetch_enrichment("t1", "f1").unwrap().unwrap();
    assert_eq!(record.enrichments.get("team").unwrap(), "payments");
    assert_eq!(record.enrichments.get("tier").unwrap(), "gold");
  }

  #[test]
  fn evaluator_matches_typed_and_override_attributes() {
    let evaluator = FieldMatchEvaluator;
    let mut event = AlertEvent::new("f1", AlertStatus::Firing);
    event.overrides.insert("service".into(), "api".into());

    assert!(evaluator.evaluate(r#"service == "api""#, &event).unwrap());
    assert!(evaluator.evaluate(r#"status == "firing""#, &event).unwrap());
    assert!(evaluator
      .evaluate(r#"service == "api" && status != "resolved""#, &event)
      .unwrap());
    assert!(!evaluator.evaluate(r#"service == "worker""#, &event).unwrap());
  }

  #[test]
  fn evaluator_reports_parse_position() {
    let evaluator = FieldMatchEvaluator;
    let err = evaluator.parse(r#"service == "api" && nonsense"#).unwrap_err();
    match err {
      PipelineError::QueryParse { line, column, .. } => {
        assert_eq!(line, 1);
        assert!(column > 1);
      }
      other => panic!("expected parse error, got {other}"),
    }
  }

  #[test]
  fn failing_channel_recovers_after_injected_failures() {
    let channel = InMemoryChannel::failing_first(1);
    assert!(channel.trigger("private-t1", "async-alerts", "[]").is_err());
    assert!(channel.trigger("private-t1", "async-alerts", "[]").is_ok());
    assert_eq!(channel.messages().len(), 1);
  }
}
