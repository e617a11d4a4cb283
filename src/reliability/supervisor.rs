//! Named supervision for long-lived concurrent units.
//!
//! Every background loop in the gateway is spawned through the supervisor
//! so an escaped error or panic becomes a named log line and a metric
//! instead of a silent task death. Shutdown flips a watch flag that
//! workers select on; units that return after the flag is set report a
//! distinct cancelled outcome.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Cancelled,
    Failed(String),
    Panicked(String),
}

type ExitCallback = Arc<dyn Fn(&str, &TaskOutcome) + Send + Sync>;

pub struct Supervisor {
    cancel_tx: watch::Sender<bool>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            cancel_tx,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Receiver workers select on to observe shutdown.
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn spawn<F>(&self, name: &str, fut: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn_with_callback(name, fut, None);
    }

    /// Spawn a named unit. `on_exit` (restart policy, alerting) runs after
    /// the outcome is logged; a sibling failure never affects other units.
    pub fn spawn_with_callback<F>(&self, name: &str, fut: F, on_exit: Option<ExitCallback>)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let unit = name.to_string();
        let cancelled = self.cancel_tx.subscribe();
        let inner = tokio::spawn(fut);

        let watcher_name = unit.clone();
        let watcher = tokio::spawn(async move {
            let outcome = match inner.await {
                Ok(Ok(())) => {
                    if *cancelled.borrow() {
                        TaskOutcome::Cancelled
                    } else {
                        TaskOutcome::Completed
                    }
                }
                Ok(Err(e)) => TaskOutcome::Failed(format!("{e:#}")),
                Err(join_err) if join_err.is_panic() => {
                    let panic = join_err.into_panic();
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    TaskOutcome::Panicked(msg)
                }
                Err(_) => TaskOutcome::Cancelled,
            };

            match &outcome {
                TaskOutcome::Completed => info!(unit = %watcher_name, "task completed"),
                TaskOutcome::Cancelled => info!(unit = %watcher_name, "task cancelled"),
                TaskOutcome::Failed(e) => {
                    metrics::increment_counter!("supervisor_task_failures", "unit" => watcher_name.clone());
                    error!(unit = %watcher_name, error = %e, "task failed");
                }
                TaskOutcome::Panicked(p) => {
                    metrics::increment_counter!("supervisor_task_panics", "unit" => watcher_name.clone());
                    error!(unit = %watcher_name, panic = %p, "task panicked");
                }
            }

            if let Some(cb) = on_exit {
                cb(&watcher_name, &outcome);
            }
        });

        self.handles.lock().push((unit, watcher));
    }

    /// Signal cancellation and wait up to `drain` for every unit to exit.
    pub async fn shutdown(&self, drain: Duration) {
        let _ = self.cancel_tx.send(true);
        let handles: Vec<(String, JoinHandle<()>)> = std::mem::take(&mut *self.handles.lock());
        let deadline = tokio::time::Instant::now() + drain;
        for (name, handle) in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(_) => {}
                Err(_) => warn!(unit = %name, "did not drain before shutdown deadline"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_panic_is_captured_and_reported() {
        let supervisor = Supervisor::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_cb = seen.clone();
        supervisor.spawn_with_callback(
            "panicky",
            async { panic!("kaboom") },
            Some(Arc::new(move |name, outcome| {
                *seen_cb.lock() = Some((name.to_string(), outcome.clone()));
            })),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        let captured = seen.lock().clone().expect("callback fired");
        assert_eq!(captured.0, "panicky");
        assert!(matches!(captured.1, TaskOutcome::Panicked(ref m) if m.contains("kaboom")));
    }

    #[tokio::test]
    async fn test_error_outcome_does_not_affect_siblings() {
        let supervisor = Supervisor::new();
        let sibling_alive = Arc::new(AtomicBool::new(false));
        let flag = sibling_alive.clone();

        supervisor.spawn("failing", async { anyhow::bail!("db gone") });
        supervisor.spawn("sibling", async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(sibling_alive.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_outcome_on_shutdown() {
        let supervisor = Supervisor::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_cb = seen.clone();
        let mut cancel = supervisor.cancel_signal();
        supervisor.spawn_with_callback(
            "loop",
            async move {
                let _ = cancel.changed().await;
                Ok(())
            },
            Some(Arc::new(move |_, outcome| {
                *seen_cb.lock() = Some(outcome.clone());
            })),
        );
        supervisor.shutdown(Duration::from_millis(200)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().clone(), Some(TaskOutcome::Cancelled));
    }
}
