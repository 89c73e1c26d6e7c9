//! Real-time fanout: size-bounded batching onto a tenant-scoped channel.
//!
//! Three message kinds flow on a tenant topic: [`ASYNC_ALERTS`] (one JSON
//! array per message, bounded by the configured byte ceiling),
//! [`ASYNC_PRESETS`] (one unbounded JSON array of preset updates) and
//! [`ASYNC_DONE`] (empty completion marker after an asynchronous poll).
//! Delivery is best-effort, at most one attempt per message.

use serde_json::json;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::types::{AlertEvent, PresetUpdate};

pub const ASYNC_ALERTS: &str = "async-alerts";
pub const ASYNC_PRESETS: &str = "async-presets";
pub const ASYNC_DONE: &str = "async-done";

/// Tenant-scoped topic all pipeline messages are published on.
pub fn tenant_topic(tenant: &str) -> String {
  format!("private-{tenant}")
}

/// Broadcast channel collaborator. Publishing is independent per call and
/// safe to duplicate; a failed publish is never retried.
pub trait FanoutChannel: Send + Sync {
  fn trigger(&self, topic: &str, kind: &str, payload: &str) -> Result<(), PipelineError>;
}

/// Publish an ordered sequence of events as size-bounded JSON-array batches.
///
/// Items accumulate while the serialized batch stays within `max_bytes`; the
/// item that would push it over flushes the previous batch and starts a new
/// one. A single item larger than the ceiling still travels alone in its own
/// oversized batch mid-stream; a trailing batch at or over the ceiling is
/// dropped rather than sent. A failed flush is logged and later flushes
/// still happen. Returns the number of batches published.
pub fn publish_alert_batches(
  channel: &dyn FanoutChannel,
  tenant: &str,
  events: &[AlertEvent],
  max_bytes: usize,
) -> usize {
  let topic = tenant_topic(tenant);
  let mut published = 0usize;
  let mut batch: Vec<&AlertEvent> = Vec::new();
  let mut batch_json = String::new();

  for event in events {
    batch.push(event);
    let candidate = match serde_json::to_string(&batch) {
      Ok(s) => s,
      Err(e) => {
        warn!(fingerprint = %event.fingerprint, error = %e, "failed to serialize event for fanout, skipping");
        batch.pop();
        continue;
      }
    };

    if candidate.len() <= max_bytes || batch.len() == 1 {
      // Still within the ceiling, or a lone oversized item that must not
      // block the stream.
      batch_json = candidate;
      continue;
    }

    // Adding this item would exceed the ceiling: flush everything before it.
    if trigger_logged(channel, &topic, ASYNC_ALERTS, &batch_json) {
      published += 1;
    }
    batch = vec![event];
    batch_json = match serde_json::to_string(&batch) {
      Ok(s) => s,
      Err(e) => {
        warn!(fingerprint = %event.fingerprint, error = %e, "failed to serialize event for fanout, skipping");
        batch.clear();
        String::new()
      }
    };
  }

  // Trailing batch: sent only while strictly below the ceiling.
  if !batch.is_empty() {
    if batch_json.len() < max_bytes {
      if trigger_logged(channel, &topic, ASYNC_ALERTS, &batch_json) {
        published += 1;
      }
    } else {
      warn!(
        tenant,
        dropped = batch.len(),
        bytes = batch_json.len(),
        "dropping trailing fanout batch at or over the size ceiling"
      );
    }
  }

  info!(tenant, batches = published, events = events.len(), "published alert batches");
  published
}

/// Publish one event immediately as a single-element batch. Used during the
/// persisted stage for lowest latency.
pub fn publish_single(
  channel: &dyn FanoutChannel,
  tenant: &str,
  event: &AlertEvent,
) -> Result<(), PipelineError> {
  let payload = serde_json::to_string(&[event])?;
  channel.trigger(&tenant_topic(tenant), ASYNC_ALERTS, &payload)
}

/// Publish a whole preset-update set as one message. Presets are few, so no
/// batching applies here.
pub fn publish_presets(
  channel: &dyn FanoutChannel,
  tenant: &str,
  updates: &[PresetUpdate],
) -> Result<(), PipelineError> {
  let payload = serde_json::to_string(updates)?;
  channel.trigger(&tenant_topic(tenant), ASYNC_PRESETS, &payload)
}

/// Terminal marker after an asynchronous provider poll.
pub fn publish_done(channel: &dyn FanoutChannel, tenant: &str) -> Result<(), PipelineError> {
  channel.trigger(&tenant_topic(tenant), ASYNC_DONE, &json!({}).to_string())
}

fn trigger_logged(channel: &dyn FanoutChannel, topic: &str, kind: &str, payload: &str) -> bool {
  match channel.trigger(topic, kind, payload) {
    Ok(()) => true,
    Err(e) => {
      warn!(topic, kind, error = %e, "fanout publish failed");
      false
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::memory::InMemoryChannel;
  use crate::types::{AlertEvent, AlertStatus};

  fn small_event(i: usize) -> AlertEvent {
    AlertEvent::new(format!("f{i}"), AlertStatus::Firing)
  }

  fn batch_events(payload: &str) -> Vec<AlertEvent> {
    serde_json::from_str(payload).unwrap()
  }

  #[test]
  fn everything_fits_in_one_batch() {
    let channel = InMemoryChannel::new();
    let events: Vec<_> = (0..3).map(small_event).collect();
    let published = publish_alert_batches(&channel, "t1", &events, 10_240);
    assert_eq!(published, 1);
    let messages = channel.messages();
    assert_eq!(messages[0].kind, ASYNC_ALERTS);
    assert_eq!(messages[0].topic, "private-t1");
    assert_eq!(batch_events(&messages[0].payload).len(), 3);
  }

  #[test]
  fn batches_stay_under_ceiling_and_preserve_order() {
    let channel = InMemoryChannel::new();
    let events: Vec<_> = (0..100).map(small_event).collect();
    let ceiling = 512;
    publish_alert_batches(&channel, "t1", &events, ceiling);

    let mut seen = Vec::new();
    for message in channel.messages() {
      assert!(message.payload.len() <= ceiling);
      let batch = batch_events(&message.payload);
      assert!(!batch.is_empty());
      seen.extend(batch.into_iter().map(|e| e.fingerprint));
    }
    let expected: Vec<_> = (0..100).map(|i| format!("f{i}")).collect();
    assert_eq!(seen, expected);
  }

  #[test]
  fn oversized_item_travels_alone_mid_stream() {
    let channel = InMemoryChannel::new();
    let mut big = small_event(0);
    big.name = "x".repeat(2_000);
    let events = vec![small_event(1), big, small_event(2)];
    publish_alert_batches(&channel, "t1", &events, 512);

    let messages = channel.messages();
    assert_eq!(messages.len(), 3);
    assert!(messages[1].payload.len() > 512, "middle batch is the oversized loner");
    assert_eq!(batch_events(&messages[1].payload).len(), 1);
  }

  #[test]
  fn trailing_batch_at_or_over_ceiling_is_dropped() {
    let channel = InMemoryChannel::new();
    let mut big = small_event(0);
    big.name = "x".repeat(2_000);
    let events = vec![small_event(1), big];
    publish_alert_batches(&channel, "t1", &events, 512);

    let messages = channel.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(batch_events(&messages[0].payload)[0].fingerprint, "f1");
  }

  #[test]
  fn failed_publish_does_not_stop_later_batches() {
    let channel = InMemoryChannel::failing_first(1);
    let events: Vec<_> = (0..100).map(small_event).collect();
    let published = publish_alert_batches(&channel, "t1", &events, 512);
    assert!(published >= 1, "later flushes still happen");
    assert!(!channel.messages().is_empty());
  }

  #[test]
  fn empty_input_publishes_nothing() {
    let channel = InMemoryChannel::new();
    assert_eq!(publish_alert_batches(&channel, "t1", &[], 10_240), 0);
    assert!(channel.messages().is_empty());
  }

  #[test]
  fn done_marker_is_empty_object() {
    let channel = InMemoryChannel::new();
    publish_done(&channel, "t1").unwrap();
    let messages = channel.messages();
    assert_eq!(messages[0].kind, ASYNC_DONE);
    assert_eq!(messages[0].payload, "{}");
  }
}
