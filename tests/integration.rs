//! End-to-end tests for the alert pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;

use alert_engine::enrichment::Enricher;
use alert_engine::fanout::{ASYNC_ALERTS, ASYNC_DONE, ASYNC_PRESETS};
use alert_engine::memory::{
  FieldMatchEvaluator, InMemoryChannel, InMemoryStore, NoopGrouping, RecordingWorkflow,
  ScriptedProvider,
};
use alert_engine::poller::{AlertProvider, PollMode, Poller};
use alert_engine::types::Overrides;
use alert_engine::{AlertEvent, AlertStatus, Config, IngestRequest, Pipeline, PipelineError, Preset};

struct Harness {
  store: Arc<InMemoryStore>,
  channel: Arc<InMemoryChannel>,
  workflow: Arc<RecordingWorkflow>,
  pipeline: Pipeline,
}

fn harness() -> Harness {
  let store = Arc::new(InMemoryStore::new());
  let channel = Arc::new(InMemoryChannel::new());
  let workflow = Arc::new(RecordingWorkflow::new());
  let pipeline = Pipeline::new(
    store.clone(),
    Some(channel.clone()),
    workflow.clone(),
    Arc::new(NoopGrouping),
    Arc::new(FieldMatchEvaluator),
    Enricher::default(),
    Config::default(),
  );
  Harness {
    store,
    channel,
    workflow,
    pipeline,
  }
}

fn fixture_event() -> AlertEvent {
  let json = r#"{
    "fingerprint": "f1",
    "name": "High CPU usage",
    "source": ["prometheus"],
    "status": "firing",
    "lastReceived": "2025-01-15T10:30:00Z",
    "service": "api",
    "severity": "critical"
  }"#;
  serde_json::from_str(json).unwrap()
}

fn request(tenant: &str, events: Vec<AlertEvent>) -> IngestRequest {
  IngestRequest {
    tenant: tenant.into(),
    provider_type: Some("prometheus".into()),
    provider_id: None,
    fingerprint: None,
    events,
    raw_events: vec![],
  }
}

// ---------------------------------------------------------------------------
// Scenario A: repeated identical content under one fingerprint
// ---------------------------------------------------------------------------

#[test]
fn repeated_identical_content_persists_once() {
  let h = harness();

  let first = h.pipeline.ingest(request("t1", vec![fixture_event()]));
  let second = h.pipeline.ingest(request("t1", vec![fixture_event()]));
  let third = h.pipeline.ingest(request("t1", vec![fixture_event()]));

  assert_eq!(first.len(), 1);
  assert!(second.is_empty(), "second occurrence is a duplicate");
  assert!(third.is_empty(), "third occurrence is a duplicate");
  assert_eq!(h.store.alert_count(), 1, "duplicates never reach persistence");

  // Duplicates never reach dispatch or fanout either: one non-empty
  // workflow batch and one alert message total.
  let non_empty: Vec<_> = h.workflow.batches().into_iter().filter(|b| !b.is_empty()).collect();
  assert_eq!(non_empty.len(), 1);
  assert_eq!(h.channel.messages_of_kind(ASYNC_ALERTS).len(), 1);
}

#[test]
fn changed_content_under_same_fingerprint_is_not_duplicate() {
  let h = harness();
  h.pipeline.ingest(request("t1", vec![fixture_event()]));

  let mut changed = fixture_event();
  changed.overrides.insert("severity".into(), "warning".into());
  let accepted = h.pipeline.ingest(request("t1", vec![changed]));

  assert_eq!(accepted.len(), 1);
  assert_eq!(h.store.alert_count(), 2);
}

// ---------------------------------------------------------------------------
// Scenario B: provider failure isolation
// ---------------------------------------------------------------------------

struct BrokenProvider;

impl AlertProvider for BrokenProvider {
  fn id(&self) -> &str {
    "broken-1"
  }

  fn provider_type(&self) -> &str {
    "pagerduty"
  }

  fn alerts_by_fingerprint(
    &self,
    _tenant: &str,
  ) -> Result<BTreeMap<String, Vec<AlertEvent>>, PipelineError> {
    Err(PipelineError::provider("broken-1", "connection refused"))
  }
}

fn provider_with(fingerprint: &str, id: &str) -> ScriptedProvider {
  let mut newest = fixture_event();
  newest.fingerprint = fingerprint.into();
  let mut older = newest.clone();
  older.last_received = "2025-01-15T09:00:00Z".into();
  older.status = AlertStatus::Resolved;
  ScriptedProvider::new(id, "prometheus").with_alerts(fingerprint, vec![newest, older])
}

#[test]
fn failing_provider_contributes_nothing_but_does_not_poison_the_poll() {
  let providers: Vec<Box<dyn AlertProvider>> = vec![
    Box::new(provider_with("p1-alert", "prom-1")),
    Box::new(BrokenProvider),
    Box::new(provider_with("p3-alert", "prom-3")),
  ];
  let poller = Poller::new(
    providers,
    Arc::new(InMemoryStore::new()),
    Arc::new(FieldMatchEvaluator),
    None,
    Config::default(),
  );

  let alerts = poller.poll_all("t1", PollMode::Sync).unwrap();
  let fingerprints: Vec<_> = alerts.iter().map(|a| a.fingerprint.as_str()).collect();
  assert_eq!(fingerprints, vec!["p1-alert", "p3-alert"]);
  // Newest occurrence per fingerprint was taken, and it is the firing one.
  assert!(alerts.iter().all(|a| a.status == AlertStatus::Firing));
}

#[test]
fn async_poll_publishes_survivors_and_one_done_marker() {
  let channel = Arc::new(InMemoryChannel::new());
  let providers: Vec<Box<dyn AlertProvider>> = vec![
    Box::new(provider_with("p1-alert", "prom-1")),
    Box::new(BrokenProvider),
    Box::new(provider_with("p3-alert", "prom-3")),
  ];
  let poller = Poller::new(
    providers,
    Arc::new(InMemoryStore::new()),
    Arc::new(FieldMatchEvaluator),
    Some(channel.clone()),
    Config::default(),
  );

  poller.poll_all("t1", PollMode::Async).unwrap();

  let alert_messages = channel.messages_of_kind(ASYNC_ALERTS);
  assert_eq!(alert_messages.len(), 2, "one batch per surviving provider");
  assert_eq!(channel.messages_of_kind(ASYNC_DONE).len(), 1);
  assert_eq!(
    channel.messages().last().unwrap().kind,
    ASYNC_DONE,
    "done marker comes after everything else"
  );
}

// ---------------------------------------------------------------------------
// Scenario C: high-volume batching
// ---------------------------------------------------------------------------

#[test]
fn fifteen_hundred_events_batch_under_the_ceiling() {
  let channel = InMemoryChannel::new();
  let events: Vec<AlertEvent> = (0..1500)
    .map(|i| AlertEvent::new(format!("f{i}"), AlertStatus::Firing))
    .collect();

  alert_engine::fanout::publish_alert_batches(&channel, "t1", &events, 10_240);

  let messages = channel.messages_of_kind(ASYNC_ALERTS);
  assert!(messages.len() > 1, "must split into multiple batches");

  let mut total = 0usize;
  let mut order: Vec<String> = Vec::new();
  for message in &messages {
    assert!(message.payload.len() <= 10_240);
    let batch: Vec<AlertEvent> = serde_json::from_str(&message.payload).unwrap();
    assert!(!batch.is_empty());
    total += batch.len();
    order.extend(batch.into_iter().map(|e| e.fingerprint));
  }
  assert_eq!(total, 1500, "last batch flushed, nothing lost");
  let expected: Vec<String> = (0..1500).map(|i| format!("f{i}")).collect();
  assert_eq!(order, expected, "arrival order preserved across batches");
}

// ---------------------------------------------------------------------------
// Preset correlation through the full pipeline
// ---------------------------------------------------------------------------

fn preset(id: &str, query: &str, is_noisy: bool) -> Preset {
  Preset {
    id: id.into(),
    name: id.into(),
    query: query.into(),
    is_noisy,
  }
}

fn preset_updates(channel: &InMemoryChannel) -> Vec<serde_json::Value> {
  let messages = channel.messages_of_kind(ASYNC_PRESETS);
  serde_json::from_str(&messages.last().unwrap().payload).unwrap()
}

#[test]
fn noisy_preset_sounds_for_matching_firing_alert() {
  let h = harness();
  h.store.set_presets(
    "t1",
    vec![
      preset("cpu", r#"service == "api""#, true),
      preset("unrelated", r#"service == "worker""#, true),
    ],
  );

  h.pipeline.ingest(request("t1", vec![fixture_event()]));

  let updates = preset_updates(&h.channel);
  assert_eq!(updates.len(), 1, "zero-match preset is absent from the update set");
  assert_eq!(updates[0]["id"], "cpu");
  assert_eq!(updates[0]["alerts_count"], 1);
  assert_eq!(updates[0]["should_do_noise_now"], true);
}

#[test]
fn plain_preset_stays_silent_for_explicitly_quiet_alert() {
  let h = harness();
  h.store.set_presets("t1", vec![preset("cpu", r#"service == "api""#, false)]);

  let mut event = fixture_event();
  event.is_noisy = Some(false);
  h.pipeline.ingest(request("t1", vec![event]));

  let updates = preset_updates(&h.channel);
  assert_eq!(updates[0]["should_do_noise_now"], false);
}

// ---------------------------------------------------------------------------
// Enrichment writes + reads through the pipeline
// ---------------------------------------------------------------------------

#[test]
fn delete_and_assign_surface_on_the_read_path() {
  let h = harness();
  h.pipeline.ingest(request("t1", vec![fixture_event()]));

  let recent = h.pipeline.recent_alerts("t1", false).unwrap();
  let occurrence = recent[0].last_received.clone();

  h.pipeline
    .delete_alert("t1", "f1", &occurrence, "alice@example.com", false)
    .unwrap();

  let recent = h.pipeline.recent_alerts("t1", false).unwrap();
  assert_eq!(recent[0].deleted, Some(true));
  assert_eq!(recent[0].assignee.as_deref(), Some("alice@example.com"));

  h.pipeline
    .delete_alert("t1", "f1", &occurrence, "alice@example.com", true)
    .unwrap();
  let recent = h.pipeline.recent_alerts("t1", false).unwrap();
  assert_eq!(recent[0].deleted, Some(false));
}

#[test]
fn manual_enrichment_wins_over_ingested_attributes() {
  let h = harness();
  h.pipeline.ingest(request("t1", vec![fixture_event()]));

  let mut overrides = Overrides::new();
  overrides.insert("severity".into(), "low".into());
  h.pipeline.enrich_alert("t1", "f1", &overrides).unwrap();

  let recent = h.pipeline.recent_alerts("t1", false).unwrap();
  assert_eq!(recent[0].overrides.get("severity").unwrap(), "low");

  // The re-published alert carried the enrichment too.
  let last_alert = h.channel.messages_of_kind(ASYNC_ALERTS);
  assert!(last_alert.last().unwrap().payload.contains(r#""severity":"low""#));
}

#[test]
fn search_rejects_oversized_window_and_reports_parse_position() {
  let h = harness();

  let err = h
    .pipeline
    .search_alerts("t1", r#"service == "api""#, Some(30 * 86_400))
    .unwrap_err();
  assert!(matches!(err, PipelineError::Validation { .. }));

  let err = h.pipeline.search_alerts("t1", "definitely not a query", None).unwrap_err();
  match err {
    PipelineError::QueryParse { line, column, query, .. } => {
      assert_eq!(line, 1);
      assert_eq!(column, 1);
      assert_eq!(query, "definitely not a query");
    }
    other => panic!("expected a parse error, got {other}"),
  }
}
