//! Ingestion orchestrator: threads one batch through
//! dedup → enrichment → persistence → workflow dispatch → correlation → fanout.
//!
//! Once a batch is accepted the orchestrator never raises: each stage failure
//! is caught, logged and the pipeline proceeds with whatever survived. Only
//! client-input problems (bad query, bad timeframe) come back as errors, and
//! only from the read/search operations.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dedup;
use crate::enrichment::{self, Enricher};
use crate::error::PipelineError;
use crate::fanout::{publish_presets, publish_single, FanoutChannel};
use crate::poller::{PollMode, Poller};
use crate::presets::{evaluate_presets, filter_alerts, PredicateEvaluator};
use crate::store::{AlertStore, StoredAlert};
use crate::types::{AlertEvent, IngestRequest, Overrides, DEFAULT_SOURCE};

/// Workflow-automation ingress. Fire-and-forget: the queue gets one attempt
/// per batch and the pipeline never consults the outcome beyond logging it.
pub trait WorkflowDispatch: Send + Sync {
  fn enqueue(&self, tenant: &str, events: &[AlertEvent]) -> Result<(), PipelineError>;
}

/// Grouping/automation rule collaborator. May synthesize new derived events
/// (e.g. grouped incidents) from a batch.
pub trait GroupingRules: Send + Sync {
  fn run(&self, tenant: &str, events: &[AlertEvent]) -> Result<Vec<AlertEvent>, PipelineError>;
}

/// The per-request ingestion pipeline. Collaborators are injected once at
/// construction; their lifecycle belongs to the process bootstrap.
pub struct Pipeline {
  store: Arc<dyn AlertStore>,
  channel: Option<Arc<dyn FanoutChannel>>,
  workflow: Arc<dyn WorkflowDispatch>,
  grouping: Arc<dyn GroupingRules>,
  evaluator: Arc<dyn PredicateEvaluator>,
  enricher: Enricher,
  config: Config,
  poller: Option<Arc<Poller>>,
}

impl Pipeline {
  pub fn new(
    store: Arc<dyn AlertStore>,
    channel: Option<Arc<dyn FanoutChannel>>,
    workflow: Arc<dyn WorkflowDispatch>,
    grouping: Arc<dyn GroupingRules>,
    evaluator: Arc<dyn PredicateEvaluator>,
    enricher: Enricher,
    config: Config,
  ) -> Self {
    Self {
      store,
      channel,
      workflow,
      grouping,
      evaluator,
      enricher,
      config,
      poller: None,
    }
  }

  /// Attach a provider poller so read operations can chain live provider
  /// state onto stored alerts.
  pub fn with_poller(mut self, poller: Arc<Poller>) -> Self {
    self.poller = Some(poller);
    self
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Accept one inbound batch and run it to completion.
  ///
  /// Returns the enriched events that survived dedup and persistence. Two
  /// invocations for the same tenant may run concurrently; there is no
  /// per-fingerprint locking, so concurrent writes to one fingerprint's
  /// enrichment or persisted state can race.
  pub fn ingest(&self, mut request: IngestRequest) -> Vec<AlertEvent> {
    self.prepare(&mut request);
    self.process(&request)
  }

  /// Pre-format pass: extraction rules, default source, fingerprint
  /// override. Mirrors what the transport layer sees before events are
  /// considered typed.
  fn prepare(&self, request: &mut IngestRequest) {
    for raw in &mut request.raw_events {
      if let Err(e) = self.enricher.apply_extraction_raw(raw) {
        warn!(tenant = %request.tenant, error = %e, "failed to run pre-formatting extraction rules");
      }
    }
    for event in &mut request.events {
      if let Err(e) = self.enricher.apply_extraction(event) {
        warn!(tenant = %request.tenant, error = %e, "failed to run pre-formatting extraction rules");
      }
      if event.source.is_empty() {
        event.source = vec![DEFAULT_SOURCE.to_string()];
      }
      if let Some(fingerprint) = &request.fingerprint {
        event.fingerprint = fingerprint.clone();
      }
      if event.provider_id.is_none() {
        event.provider_id = request.provider_id.clone();
      }
      if event.provider_type.is_none() {
        event.provider_type = request.provider_type.clone();
      }
    }
  }

  /// The stage machine: Received → Deduplicated → Persisted → Dispatched →
  /// Correlated → Published.
  fn process(&self, request: &IngestRequest) -> Vec<AlertEvent> {
    let tenant = request.tenant.as_str();
    info!(
      tenant,
      provider_type = request.provider_type.as_deref().unwrap_or(""),
      events = request.events.len(),
      "adding new alerts to the pipeline"
    );

    // Received → Deduplicated: repeats of already-seen content drop out of
    // every later stage.
    let mut survivors: Vec<AlertEvent> = Vec::new();
    for event in &request.events {
      let mut event = event.clone();
      let (hash, duplicate) = dedup::is_duplicate(self.store.as_ref(), tenant, &event);
      event.alert_hash = Some(hash);
      event.is_duplicate = duplicate;
      if duplicate {
        info!(tenant, fingerprint = %event.fingerprint, "dropping duplicate event");
      } else {
        survivors.push(event);
      }
    }

    // Deduplicated → Persisted.
    let enriched = self.persist_stage(tenant, request, survivors);

    // Persisted → Dispatched: one attempt, outcome only logged.
    if let Err(e) = self.workflow.enqueue(tenant, &enriched) {
      error!(tenant, error = %e, "failed to enqueue events for workflows");
    }

    // Dispatched → Correlated: grouping rules may synthesize derived events.
    match self.grouping.run(tenant, &enriched) {
      Ok(derived) if !derived.is_empty() => {
        if let Err(e) = self.workflow.enqueue(tenant, &derived) {
          error!(tenant, error = %e, "failed to enqueue derived events for workflows");
        }
        if let Some(channel) = self.channel.as_deref() {
          for event in &derived {
            if let Err(e) = publish_single(channel, tenant, event) {
              warn!(tenant, fingerprint = %event.fingerprint, error = %e, "failed to push derived event");
            }
          }
        }
      }
      Ok(_) => {}
      Err(e) => error!(tenant, error = %e, "failed to run grouping rules"),
    }

    // Correlated → Published: refresh presets over the enriched batch.
    self.preset_stage(tenant, &enriched);

    info!(tenant, accepted = enriched.len(), "finished processing alert batch");
    enriched
  }

  /// Persist survivors one by one: mapping enrichment, receive-time
  /// normalization, durable id, stored-enrichment merge, immediate
  /// single-event publish. One bad event is logged and skipped; a commit
  /// failure marks the stage failed without raising.
  fn persist_stage(
    &self,
    tenant: &str,
    request: &IngestRequest,
    survivors: Vec<AlertEvent>,
  ) -> Vec<AlertEvent> {
    if self.config.store_raw_events {
      for raw in &request.raw_events {
        if let Err(e) = self.store.store_raw(tenant, raw) {
          warn!(tenant, error = %e, "failed to archive raw event");
        }
      }
    }

    let mut enriched = Vec::with_capacity(survivors.len());
    for mut event in survivors {
      event.pushed = true;

      if let Err(e) = self.enricher.apply_mapping(&mut event) {
        warn!(tenant, fingerprint = %event.fingerprint, error = %e, "failed to run mapping rules");
      }
      event.last_received = normalize_last_received(&event.last_received);

      let id = match self.store.store(tenant, &event) {
        Ok(id) => id,
        Err(e) => {
          error!(tenant, fingerprint = %event.fingerprint, error = %e, "failed to persist event, skipping");
          continue;
        }
      };
      event.event_id = Some(id);

      match self.store.fetch_enrichment(tenant, &event.fingerprint) {
        Ok(Some(record)) => enrichment::merge_stored_enrichment(&mut event, &record),
        Ok(None) => {}
        Err(e) => {
          warn!(tenant, fingerprint = %event.fingerprint, error = %e, "failed to fetch stored enrichment")
        }
      }

      // Per-event publish for lowest latency; the batched path is for polls.
      if let Some(channel) = self.channel.as_deref() {
        if let Err(e) = publish_single(channel, tenant, &event) {
          warn!(tenant, fingerprint = %event.fingerprint, error = %e, "failed to push event to the client");
        }
      }
      enriched.push(event);
    }

    if let Err(e) = self.store.commit() {
      error!(tenant, events = enriched.len(), error = %e, "failed to commit alert batch");
    }
    enriched
  }

  fn preset_stage(&self, tenant: &str, events: &[AlertEvent]) {
    let presets = match self.store.fetch_presets(tenant) {
      Ok(presets) => presets,
      Err(e) => {
        error!(tenant, error = %e, "failed to load presets for correlation");
        return;
      }
    };
    let updates = evaluate_presets(self.evaluator.as_ref(), &presets, events);
    if let Some(channel) = self.channel.as_deref() {
      if let Err(e) = publish_presets(channel, tenant, &updates) {
        warn!(tenant, error = %e, "failed to send preset updates");
      }
    }
  }

  // -------------------------------------------------------------------------
  // Read / search operations
  // -------------------------------------------------------------------------

  /// Last occurrence per fingerprint, enrichment-merged.
  ///
  /// With `sync_poll` set and a poller attached, the current provider state
  /// is pulled synchronously and appended; a failing poll is logged and the
  /// stored alerts are returned on their own.
  pub fn recent_alerts(
    &self,
    tenant: &str,
    sync_poll: bool,
  ) -> Result<Vec<AlertEvent>, PipelineError> {
    let rows = self.store.fetch_recent(tenant, self.config.recent_alerts_limit)?;
    let mut alerts = self.convert_stored(tenant, rows);
    if sync_poll {
      if let Some(poller) = &self.poller {
        match poller.poll_all(tenant, PollMode::Sync) {
          Ok(pulled) => alerts.extend(pulled),
          Err(e) => {
            warn!(tenant, error = %e, "provider poll during read failed, returning stored alerts only")
          }
        }
      }
    }
    Ok(alerts)
  }

  /// Every stored occurrence for one fingerprint, enrichment-merged. With a
  /// provider id and an attached poller, that provider's own occurrence
  /// history for the fingerprint is appended; provider failures are logged
  /// and contribute nothing.
  pub fn alert_history(
    &self,
    tenant: &str,
    fingerprint: &str,
    provider_id: Option<&str>,
  ) -> Result<Vec<AlertEvent>, PipelineError> {
    let rows = self
      .store
      .fetch_by_fingerprint(tenant, fingerprint, self.config.history_limit)?;
    let mut alerts = self.convert_stored(tenant, rows);
    if let (Some(provider_id), Some(poller)) = (provider_id, &self.poller) {
      alerts.extend(poller.provider_history(tenant, provider_id, fingerprint));
    }
    Ok(alerts)
  }

  /// Filter every stored occurrence in the timeframe through a
  /// caller-supplied predicate.
  ///
  /// `timeframe_secs` defaults to one day and is capped; violations and
  /// predicate parse failures come back as client-input errors.
  pub fn search_alerts(
    &self,
    tenant: &str,
    query: &str,
    timeframe_secs: Option<i64>,
  ) -> Result<Vec<AlertEvent>, PipelineError> {
    let timeframe = timeframe_secs.unwrap_or(self.config.default_timeframe_secs);
    if timeframe < 0 {
      return Err(PipelineError::validation("timeframe", "cannot be negative"));
    }
    if timeframe > self.config.max_timeframe_secs {
      return Err(PipelineError::validation(
        "timeframe",
        format!("cannot exceed {} seconds", self.config.max_timeframe_secs),
      ));
    }

    let cutoff = Utc::now() - chrono::Duration::seconds(timeframe);
    let rows = self.store.fetch_all(tenant, self.config.recent_alerts_limit)?;
    let alerts: Vec<AlertEvent> = self
      .convert_stored(tenant, rows)
      .into_iter()
      .filter(|event| match DateTime::parse_from_rfc3339(&event.last_received) {
        Ok(ts) => ts.with_timezone(&Utc) >= cutoff,
        Err(_) => true, // unparsable receive time: keep rather than hide
      })
      .collect();

    let matched = filter_alerts(self.evaluator.as_ref(), &alerts, query)?;
    Ok(matched.into_iter().cloned().collect())
  }

  /// Merge each stored row's enrichment onto its event. A row that fails
  /// conversion is logged and skipped, never fatal for its siblings.
  fn convert_stored(&self, tenant: &str, rows: Vec<StoredAlert>) -> Vec<AlertEvent> {
    let mut alerts = Vec::with_capacity(rows.len());
    for row in rows {
      let mut event = row.event;
      match self.store.fetch_enrichment(tenant, &row.fingerprint) {
        Ok(Some(record)) => enrichment::merge_stored_enrichment(&mut event, &record),
        Ok(None) => {}
        Err(e) => {
          warn!(tenant, fingerprint = %row.fingerprint, error = %e, "failed to fetch enrichment, returning event as-is");
        }
      }
      if event.event_id.is_none() {
        event.event_id = Some(row.id);
      }
      if event.provider_id.is_none() {
        event.provider_id = row.provider_id;
      }
      alerts.push(event);
    }
    alerts
  }

  // -------------------------------------------------------------------------
  // Enrichment write operations
  // -------------------------------------------------------------------------

  /// Manual enrichment, then re-publish the freshest merged occurrence so
  /// live clients see the change.
  pub fn enrich_alert(
    &self,
    tenant: &str,
    fingerprint: &str,
    overrides: &Overrides,
  ) -> Result<(), PipelineError> {
    enrichment::enrich_alert(self.store.as_ref(), tenant, fingerprint, overrides)?;

    let rows = self.store.fetch_by_fingerprint(tenant, fingerprint, 1)?;
    let Some(latest) = self.convert_stored(tenant, rows).into_iter().next() else {
      warn!(tenant, fingerprint, "no stored occurrence to re-publish after enrichment");
      return Ok(());
    };
    if let Some(channel) = self.channel.as_deref() {
      if let Err(e) = publish_single(channel, tenant, &latest) {
        warn!(tenant, fingerprint, error = %e, "failed to push enriched alert");
      }
    }
    Ok(())
  }

  /// Soft-delete or restore one occurrence.
  pub fn delete_alert(
    &self,
    tenant: &str,
    fingerprint: &str,
    last_received: &str,
    actor: &str,
    restore: bool,
  ) -> Result<(), PipelineError> {
    enrichment::delete_alert(self.store.as_ref(), tenant, fingerprint, last_received, actor, restore)
  }

  /// Assign or unassign one occurrence.
  pub fn assign_alert(
    &self,
    tenant: &str,
    fingerprint: &str,
    last_received: &str,
    actor: &str,
    unassign: bool,
  ) -> Result<(), PipelineError> {
    enrichment::assign_alert(self.store.as_ref(), tenant, fingerprint, last_received, actor, unassign)
  }
}

/// Normalize a receive timestamp: missing or unparsable becomes "now" (UTC).
fn normalize_last_received(raw: &str) -> String {
  if !raw.is_empty() && DateTime::parse_from_rfc3339(raw).is_ok() {
    return raw.to_string();
  }
  if !raw.is_empty() {
    warn!(last_received = raw, "invalid lastReceived date, setting to now");
  }
  Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
