//! Best-effort background execution.
//!
//! Contract: at most one attempt per task, no retry. A task that panics is
//! logged and discarded; nothing is re-queued. Callers that need the result
//! run the work inline instead.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{error, info};

/// Spawns fire-and-forget tasks on plain threads and can drain them on
/// shutdown so in-flight work gets its single attempt.
#[derive(Default)]
pub struct TaskRunner {
  handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRunner {
  pub fn new() -> Self {
    Self::default()
  }

  /// Hand off one unit of work. Returns immediately.
  pub fn spawn<F>(&self, name: &str, task: F)
  where
    F: FnOnce() + Send + 'static,
  {
    let task_name = name.to_string();
    let handle = std::thread::spawn(move || {
      if catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!(task = %task_name, "background task panicked, not retrying");
      }
    });
    let mut handles = self.handles.lock();
    // Reap finished handles so a long-lived runner does not accumulate them.
    handles.retain(|h| !h.is_finished());
    handles.push(handle);
  }

  /// Number of tasks not yet reaped.
  pub fn pending(&self) -> usize {
    self.handles.lock().len()
  }

  /// Wait for every spawned task to finish its one attempt.
  pub fn join_all(&self) {
    let handles: Vec<_> = self.handles.lock().drain(..).collect();
    let count = handles.len();
    for handle in handles {
      let _ = handle.join();
    }
    if count > 0 {
      info!(tasks = count, "drained background tasks");
    }
  }
}

impl Drop for TaskRunner {
  fn drop(&mut self) {
    self.join_all();
  }
}
