//! JSON-lines driver for the alert pipeline.
//!
//! Each stdin line is one command object tagged by `op`:
//!
//! - `{"op": "ingest", "tenant": ..., "events": [...]}`: accepted
//!   immediately, processed in the background (at most one attempt)
//! - `{"op": "set-presets", "tenant": ..., "presets": [...]}`
//! - `{"op": "add-provider", "tenant": ..., "id": ..., "providerType": ...,
//!    "alerts": {fingerprint: [occurrences, newest first]}}`
//! - `{"op": "poll", "tenant": ..., "sync": bool}`
//! - `{"op": "search", "tenant": ..., "query": ..., "timeframe": secs}`
//!
//! Fanout messages and command results come out as JSON lines on stdout;
//! logs go to stderr. Invalid input produces a structured error line.

use std::collections::BTreeMap;
use std::io::{self, BufRead};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use alert_engine::enrichment::Enricher;
use alert_engine::fanout::FanoutChannel;
use alert_engine::memory::{FieldMatchEvaluator, InMemoryStore, NoopGrouping, RecordingWorkflow};
use alert_engine::poller::{AlertProvider, PollMode, Poller};
use alert_engine::tasks::TaskRunner;
use alert_engine::{AlertEvent, Config, IngestRequest, Pipeline, PipelineError, Preset};

#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
enum Command {
  Ingest(IngestRequest),
  SetPresets {
    tenant: String,
    presets: Vec<Preset>,
  },
  AddProvider {
    tenant: String,
    id: String,
    #[serde(rename = "providerType")]
    provider_type: String,
    alerts: BTreeMap<String, Vec<AlertEvent>>,
  },
  Poll {
    tenant: String,
    #[serde(default)]
    sync: bool,
  },
  Search {
    tenant: String,
    query: String,
    #[serde(default)]
    timeframe: Option<i64>,
  },
}

/// Structured error line for invalid input.
#[derive(Serialize)]
struct ErrorLine {
  error: bool,
  message: String,
}

impl ErrorLine {
  fn print(message: impl Into<String>) {
    let line = Self {
      error: true,
      message: message.into(),
    };
    if let Ok(json) = serde_json::to_string(&line) {
      println!("{json}");
    }
  }
}

/// Fanout channel that writes each publish to stdout as one JSON line.
struct StdoutChannel;

impl FanoutChannel for StdoutChannel {
  fn trigger(&self, topic: &str, kind: &str, payload: &str) -> Result<(), PipelineError> {
    let payload: Value = serde_json::from_str(payload)?;
    let line = serde_json::json!({ "topic": topic, "kind": kind, "payload": payload });
    println!("{line}");
    Ok(())
  }
}

/// Registered provider scripts, rebuilt into a poller per poll command.
#[derive(Clone)]
struct ProviderScript {
  id: String,
  provider_type: String,
  alerts: BTreeMap<String, Vec<AlertEvent>>,
}

/// Provider scripts keyed by tenant; a poll only sees its own tenant's
/// providers.
#[derive(Default)]
struct ProviderRegistry {
  by_tenant: BTreeMap<String, Vec<ProviderScript>>,
}

impl ProviderRegistry {
  fn add(&mut self, tenant: String, script: ProviderScript) {
    self.by_tenant.entry(tenant).or_default().push(script);
  }

  fn build(&self, tenant: &str) -> Vec<Box<dyn AlertProvider>> {
    self
      .by_tenant
      .get(tenant)
      .into_iter()
      .flatten()
      .cloned()
      .map(|script| Box::new(ScriptedFromLine { script }) as Box<dyn AlertProvider>)
      .collect()
  }
}

struct ScriptedFromLine {
  script: ProviderScript,
}

impl AlertProvider for ScriptedFromLine {
  fn id(&self) -> &str {
    &self.script.id
  }

  fn provider_type(&self) -> &str {
    &self.script.provider_type
  }

  fn alerts_by_fingerprint(
    &self,
    _tenant: &str,
  ) -> Result<BTreeMap<String, Vec<AlertEvent>>, PipelineError> {
    Ok(self.script.alerts.clone())
  }
}

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_writer(io::stderr)
    .init();

  let store = Arc::new(InMemoryStore::new());
  let channel: Arc<dyn FanoutChannel> = Arc::new(StdoutChannel);
  let evaluator = Arc::new(FieldMatchEvaluator);
  let pipeline = Arc::new(Pipeline::new(
    store.clone(),
    Some(channel.clone()),
    Arc::new(RecordingWorkflow::new()),
    Arc::new(NoopGrouping),
    evaluator.clone(),
    Enricher::default(),
    Config::default(),
  ));
  let runner = TaskRunner::new();
  let mut providers = ProviderRegistry::default();

  let stdin = io::stdin();
  for line in stdin.lock().lines() {
    let line = match line {
      Ok(l) => l,
      Err(e) => {
        eprintln!("alert-engine: read error: {e}");
        std::process::exit(1);
      }
    };
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    let command: Command = match serde_json::from_str(trimmed) {
      Ok(c) => c,
      Err(e) => {
        ErrorLine::print(format!("json parse: {e}"));
        continue;
      }
    };

    match command {
      Command::Ingest(request) => {
        let pipeline = pipeline.clone();
        let tenant = request.tenant.clone();
        let count = request.events.len();
        runner.spawn("ingest", move || {
          pipeline.ingest(request);
        });
        println!(
          "{}",
          serde_json::json!({ "status": "accepted", "tenant": tenant, "events": count })
        );
      }
      Command::SetPresets { tenant, presets } => {
        store.set_presets(&tenant, presets);
        println!("{}", serde_json::json!({ "status": "ok" }));
      }
      Command::AddProvider {
        tenant,
        id,
        provider_type,
        alerts,
      } => {
        providers.add(
          tenant,
          ProviderScript {
            id,
            provider_type,
            alerts,
          },
        );
        println!("{}", serde_json::json!({ "status": "ok" }));
      }
      Command::Poll { tenant, sync } => {
        let poller = Poller::new(
          providers.build(&tenant),
          store.clone(),
          evaluator.clone(),
          Some(channel.clone()),
          Config::default(),
        );
        let mode = if sync { PollMode::Sync } else { PollMode::Async };
        match poller.poll_all(&tenant, mode) {
          Ok(alerts) if mode == PollMode::Sync => {
            println!("{}", serde_json::to_string(&alerts).unwrap_or_else(|_| "[]".into()));
          }
          Ok(_) => {}
          Err(e) => ErrorLine::print(e.to_string()),
        }
      }
      Command::Search {
        tenant,
        query,
        timeframe,
      } => match pipeline.search_alerts(&tenant, &query, timeframe) {
        Ok(alerts) => {
          println!("{}", serde_json::to_string(&alerts).unwrap_or_else(|_| "[]".into()));
        }
        Err(e) => ErrorLine::print(e.to_string()),
      },
    }
  }

  // Give queued ingest work its single attempt before exiting.
  runner.join_all();
}
