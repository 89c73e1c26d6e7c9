//! Preset correlation: evaluate every live saved query against a batch.

use tracing::{info, warn};

use crate::error::PipelineError;
use crate::types::{AlertEvent, AlertStatus, Preset, PresetUpdate};

/// Predicate-expression collaborator. The expression language, its parser
/// and its evaluator live outside the pipeline; parse failures come back as
/// [`PipelineError::QueryParse`] with the offending position.
pub trait PredicateEvaluator: Send + Sync {
  /// Validate a predicate without evaluating it. Real engines compile here.
  fn parse(&self, query: &str) -> Result<(), PipelineError>;

  fn evaluate(&self, query: &str, event: &AlertEvent) -> Result<bool, PipelineError>;
}

/// Events matching `query`. Parse/evaluation errors propagate so callers can
/// surface them as client-input failures; the parse check runs even when the
/// batch is empty.
pub fn filter_alerts<'a>(
  evaluator: &dyn PredicateEvaluator,
  events: &'a [AlertEvent],
  query: &str,
) -> Result<Vec<&'a AlertEvent>, PipelineError> {
  evaluator.parse(query)?;
  let mut matched = Vec::new();
  for event in events {
    if evaluator.evaluate(query, event)? {
      matched.push(event);
    }
  }
  Ok(matched)
}

/// Evaluate all presets against a batch and return the update set.
///
/// Presets with zero matches are excluded entirely; receivers must not
/// assume every preset appears. A failing preset is logged and skipped
/// without aborting the others.
///
/// Noise: a noisy preset sounds when any match is FIRING; a non-noisy preset
/// sounds only when a match explicitly carries `isNoisy = true` and is
/// FIRING.
pub fn evaluate_presets(
  evaluator: &dyn PredicateEvaluator,
  presets: &[Preset],
  events: &[AlertEvent],
) -> Vec<PresetUpdate> {
  let mut updates = Vec::new();
  for preset in presets {
    let matched = match filter_alerts(evaluator, events, &preset.query) {
      Ok(matched) => matched,
      Err(e) => {
        warn!(preset_id = %preset.id, error = %e, "preset evaluation failed, skipping");
        continue;
      }
    };
    if matched.is_empty() {
      continue;
    }

    let should_do_noise_now = if preset.is_noisy {
      matched.iter().any(|a| a.status == AlertStatus::Firing)
    } else {
      matched
        .iter()
        .any(|a| a.is_noisy == Some(true) && a.status == AlertStatus::Firing)
    };
    if should_do_noise_now {
      info!(preset_id = %preset.id, "preset requests noise");
    }

    updates.push(PresetUpdate {
      preset: preset.clone(),
      alerts_count: matched.len(),
      should_do_noise_now,
    });
  }
  updates
}
