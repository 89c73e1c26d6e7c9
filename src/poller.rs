//! Provider polling: build the "last known state per fingerprint" view.
//!
//! Providers are polled strictly sequentially to stay inside provider-side
//! rate limits. There is no cancellation: a hung provider call blocks the
//! whole pass. One provider's failure is logged with its identity and never
//! poisons the others.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::PipelineError;
use crate::fanout::{publish_alert_batches, publish_done, publish_presets, FanoutChannel};
use crate::presets::{evaluate_presets, PredicateEvaluator};
use crate::store::AlertStore;
use crate::types::AlertEvent;

/// One installed alerting provider.
pub trait AlertProvider: Send + Sync {
  fn id(&self) -> &str;
  fn provider_type(&self) -> &str;

  /// Current alert state: fingerprint mapped to its historical occurrences,
  /// most recent first.
  fn alerts_by_fingerprint(
    &self,
    tenant: &str,
  ) -> Result<BTreeMap<String, Vec<AlertEvent>>, PipelineError>;
}

/// How a poll pass delivers its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
  /// Accumulate all current-state events and return them to the caller.
  Sync,
  /// Publish batches and preset updates per provider as a side effect, then
  /// emit a terminal done marker. Requires a live fanout channel.
  Async,
}

/// Pulls current alert state from every installed provider.
pub struct Poller {
  providers: Vec<Box<dyn AlertProvider>>,
  store: Arc<dyn AlertStore>,
  evaluator: Arc<dyn PredicateEvaluator>,
  channel: Option<Arc<dyn FanoutChannel>>,
  config: Config,
}

impl Poller {
  pub fn new(
    providers: Vec<Box<dyn AlertProvider>>,
    store: Arc<dyn AlertStore>,
    evaluator: Arc<dyn PredicateEvaluator>,
    channel: Option<Arc<dyn FanoutChannel>>,
    config: Config,
  ) -> Self {
    Self {
      providers,
      store,
      evaluator,
      channel,
      config,
    }
  }

  /// Occurrence history for one fingerprint straight from one installed
  /// provider, most recent first. An unknown provider id or a failing
  /// provider call is logged and yields nothing.
  pub fn provider_history(
    &self,
    tenant: &str,
    provider_id: &str,
    fingerprint: &str,
  ) -> Vec<AlertEvent> {
    let Some(provider) = self.providers.iter().find(|p| p.id() == provider_id) else {
      warn!(provider_id, tenant, "no installed provider with this id");
      return Vec::new();
    };
    match provider.alerts_by_fingerprint(tenant) {
      Ok(mut by_fingerprint) => by_fingerprint.remove(fingerprint).unwrap_or_default(),
      Err(e) => {
        warn!(
          provider_id,
          provider_type = provider.provider_type(),
          tenant,
          error = %e,
          "could not fetch history from provider"
        );
        Vec::new()
      }
    }
  }

  /// Poll every provider for `tenant`.
  ///
  /// In [`PollMode::Sync`] the accumulated current-state events are
  /// returned. In [`PollMode::Async`] the return value is empty; results
  /// travel on the fanout channel instead, followed by one done marker.
  /// Failures within one provider are logged and skipped; the only error
  /// this returns is the async-without-channel precondition.
  pub fn poll_all(&self, tenant: &str, mode: PollMode) -> Result<Vec<AlertEvent>, PipelineError> {
    let channel = match (mode, self.channel.as_deref()) {
      (PollMode::Async, None) => return Err(PipelineError::ChannelRequired),
      (_, channel) => channel,
    };

    info!(tenant, ?mode, providers = self.providers.len(), "pulling alerts from installed providers");
    let mut accumulated = Vec::new();

    for provider in &self.providers {
      let by_fingerprint = match provider.alerts_by_fingerprint(tenant) {
        Ok(map) => map,
        Err(e) => {
          warn!(
            provider_id = provider.id(),
            provider_type = provider.provider_type(),
            tenant,
            error = %e,
            "could not fetch alerts from provider"
          );
          continue;
        }
      };

      // Current state per fingerprint is the newest occurrence.
      let last_alerts: Vec<AlertEvent> = by_fingerprint
        .values()
        .filter_map(|occurrences| occurrences.first().cloned())
        .collect();

      info!(
        provider_id = provider.id(),
        provider_type = provider.provider_type(),
        tenant,
        fingerprints = by_fingerprint.len(),
        "pulled alerts from provider"
      );
      if last_alerts.is_empty() {
        continue;
      }

      if mode == PollMode::Sync {
        accumulated.extend(last_alerts);
        continue;
      }

      // Async: this provider's snapshot goes straight to subscribers,
      // followed by a preset refresh over the same events.
      let Some(channel) = channel else { continue };
      publish_alert_batches(channel, tenant, &last_alerts, self.config.max_batch_bytes);
      match self.store.fetch_presets(tenant) {
        Ok(presets) => {
          let updates = evaluate_presets(self.evaluator.as_ref(), &presets, &last_alerts);
          if let Err(e) = publish_presets(channel, tenant, &updates) {
            warn!(tenant, error = %e, "failed to publish preset updates");
          }
        }
        Err(e) => {
          warn!(
            provider_id = provider.id(),
            tenant,
            error = %e,
            "failed to load presets after provider poll"
          );
        }
      }
    }

    if mode == PollMode::Async {
      if let Some(channel) = channel {
        if let Err(e) = publish_done(channel, tenant) {
          warn!(tenant, error = %e, "failed to publish poll completion marker");
        }
      }
    }

    info!(tenant, alerts = accumulated.len(), "fetched alerts from installed providers");
    Ok(accumulated)
  }
}
