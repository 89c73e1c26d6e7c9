//! Pipeline configuration with sane defaults.

/// Tunable limits for ingestion, fanout and search.
#[derive(Debug, Clone)]
pub struct Config {
  /// Max serialized size of one fanout batch, in bytes.
  pub max_batch_bytes: usize,
  /// Archive raw provider payloads alongside formatted events.
  pub store_raw_events: bool,
  /// Max last-occurrence rows fetched for the "recent alerts" view.
  pub recent_alerts_limit: usize,
  /// Max occurrences fetched for a single fingerprint's history.
  pub history_limit: usize,
  /// Search timeframe applied when the caller does not pass one, in seconds.
  pub default_timeframe_secs: i64,
  /// Upper bound on the search timeframe, in seconds.
  pub max_timeframe_secs: i64,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      max_batch_bytes: 10_240,
      store_raw_events: false,
      recent_alerts_limit: 10_000,
      history_limit: 1_000,
      default_timeframe_secs: 86_400,
      max_timeframe_secs: 14 * 86_400,
    }
  }
}
