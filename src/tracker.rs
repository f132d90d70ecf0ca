//! Supervised background task tracker.
//!
//! Fire-and-forget work (audit fan-out, summary regeneration, preference
//! learning) must not be detached: handles are retained here until
//! completion, failures are logged, and shutdown drains everything.
//! Spawning Brain work with a bare `tokio::spawn` is forbidden.

use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Retains join handles for supervised background work.
#[derive(Debug, Default)]
pub struct TaskTracker {
    handles: Mutex<Vec<(String, JoinHandle<anyhow::Result<()>>)>>,
}

impl TaskTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a supervised background task.
    ///
    /// The future's error is logged under `name` when it resolves; the
    /// handle is retained until [`Self::drain`] or the next reap.
    pub fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let task_name = name.to_owned();
        let log_name = task_name.clone();
        let handle = tokio::spawn(async move {
            let result = future.await;
            if let Err(ref err) = result {
                error!(task = %log_name, error = %err, "background task failed");
            }
            result
        });

        if let Ok(mut handles) = self.handles.lock() {
            // Reap finished handles opportunistically so the vec stays small.
            handles.retain(|(_, h)| !h.is_finished());
            handles.push((task_name, handle));
        }
    }

    /// Number of tasks still running.
    pub fn active_count(&self) -> usize {
        self.handles
            .lock()
            .map(|handles| handles.iter().filter(|(_, h)| !h.is_finished()).count())
            .unwrap_or(0)
    }

    /// Await every tracked task. Called on shutdown and by tests that need
    /// background effects to be visible.
    pub async fn drain(&self) {
        let drained: Vec<(String, JoinHandle<anyhow::Result<()>>)> = match self.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(_) => return,
        };
        for (name, handle) in drained {
            match handle.await {
                Ok(_) => {}
                Err(join_err) if join_err.is_panic() => {
                    error!(task = %name, "background task panicked");
                }
                Err(_) => {
                    warn!(task = %name, "background task cancelled");
                }
            }
        }
    }
}
