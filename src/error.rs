//! Structured error types for the alert pipeline.
//!
//! Only the client-input variants (`Validation`, `QueryParse`,
//! `ChannelRequired`) cross the pipeline boundary; stage and item failures
//! are logged at the catch site and the pipeline proceeds with what survived.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
  #[error("validation: {field}: {reason}")]
  Validation { field: String, reason: String },

  /// Predicate parse failure, surfaced verbatim with its position.
  #[error("query parse at {line}:{column}: {message}")]
  QueryParse {
    query: String,
    line: u32,
    column: u32,
    message: String,
  },

  #[error("fanout channel required for an asynchronous provider poll")]
  ChannelRequired,

  #[error("store: {0}")]
  Store(String),

  #[error("channel: {0}")]
  Channel(String),

  #[error("provider {id}: {reason}")]
  Provider { id: String, reason: String },

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),
}

impl PipelineError {
  pub fn validation(field: &str, reason: impl Into<String>) -> Self {
    Self::Validation {
      field: field.to_string(),
      reason: reason.into(),
    }
  }

  pub fn store(msg: impl Into<String>) -> Self {
    Self::Store(msg.into())
  }

  pub fn channel(msg: impl Into<String>) -> Self {
    Self::Channel(msg.into())
  }

  pub fn provider(id: &str, reason: impl Into<String>) -> Self {
    Self::Provider {
      id: id.to_string(),
      reason: reason.into(),
    }
  }

  /// True for errors a caller should treat as a 4xx-equivalent rejection.
  pub fn is_client_input(&self) -> bool {
    matches!(
      self,
      Self::Validation { .. } | Self::QueryParse { .. } | Self::ChannelRequired
    )
  }
}
