//! Debounced single-flight reloader.
//!
//! Bursts of `trigger()` calls collapse into one execution of the reload
//! closure: the worker sleeps `debounce` after the first trigger, tops up
//! to `min_interval` since the previous run, then runs under a one-permit
//! semaphore. Triggers arriving while a run is in progress schedule
//! exactly one follow-up run.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct DebounceConfig {
    pub debounce: Duration,
    pub min_interval: Duration,
}

pub struct DebouncedReloader {
    name: String,
    notify: Arc<Notify>,
    pending: Arc<AtomicBool>,
    runs: Arc<AtomicU64>,
}

impl DebouncedReloader {
    /// Spawn the worker loop and return the trigger handle. `reload`
    /// failures are logged and do not stop the loop.
    pub fn spawn<F, Fut>(name: &str, config: DebounceConfig, reload: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let reloader = Arc::new(Self {
            name: name.to_string(),
            notify: Arc::new(Notify::new()),
            pending: Arc::new(AtomicBool::new(false)),
            runs: Arc::new(AtomicU64::new(0)),
        });

        let worker = reloader.clone();
        tokio::spawn(async move {
            worker.run(config, reload).await;
        });

        reloader
    }

    /// Request a reload. Non-blocking; callers during any wait phase
    /// coalesce into the in-flight cycle.
    pub fn trigger(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Number of completed reload executions.
    pub fn run_count(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    async fn run<F, Fut>(self: Arc<Self>, config: DebounceConfig, reload: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let semaphore = Semaphore::new(1);
        let mut last_run: Option<Instant> = None;

        loop {
            self.notify.notified().await;
            if !self.pending.swap(false, Ordering::SeqCst) {
                // Stale wakeup from a trigger already absorbed by the
                // previous cycle.
                continue;
            }

            tokio::time::sleep(config.debounce).await;

            if let Some(last) = last_run {
                let since = last.elapsed();
                if since < config.min_interval {
                    tokio::time::sleep(config.min_interval - since).await;
                }
            }

            // Everything that arrived during the waits rides this run.
            self.pending.store(false, Ordering::SeqCst);

            let _permit = match semaphore.acquire().await {
                Ok(p) => p,
                Err(_) => return,
            };
            if let Err(e) = reload().await {
                warn!(reloader = %self.name, error = %e, "reload failed");
            }
            last_run = Some(Instant::now());
            self.runs.fetch_add(1, Ordering::SeqCst);
            debug!(reloader = %self.name, runs = self.run_count(), "reload cycle complete");
        }
    }
}
