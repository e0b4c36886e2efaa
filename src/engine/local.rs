//! In-process task engine.
//!
//! Runs submitted tasks through a [`TaskHandler`] with bounded concurrency
//! and reports its lifecycle as [`EngineSignal`]s:
//!
//! - `Active`: tasks pending or running. Each finished task fires
//!   `TaskCompleted`.
//! - `Idle`: nothing pending or running. Fires `Idle` and waits for the
//!   listener. New work resumes `Active`; a `request_no_terminate` during
//!   the cycle re-enters `Idle`; otherwise the engine closes.
//! - [`LocalEngine::shutdown`] closes the engine regardless of keep-alive.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{Instrument, debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Completion, Outcome, Task};
use crate::telemetry::feed::start_task_span;
use crate::telemetry::metrics;

use super::{Engine, EngineSignal, TaskHandler};

/// Configuration for the local engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum tasks running at once.
    pub max_concurrent: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

/// Why [`LocalEngine::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    /// Went idle and nobody asked it to stay open.
    Finished,
    /// Closed by [`LocalEngine::shutdown`].
    Shutdown,
}

pub struct LocalEngine {
    handler: Arc<dyn TaskHandler>,
    config: EngineConfig,
    pending: Mutex<VecDeque<Task>>,
    in_flight: AtomicUsize,
    keep_alive: AtomicBool,
    closed: AtomicBool,
    wake: Notify,
    finished: Notify,
    shutdown: Notify,
    signals: mpsc::UnboundedSender<EngineSignal>,
}

impl LocalEngine {
    /// Create an engine and the signal stream a listener should consume.
    pub fn new(
        handler: Arc<dyn TaskHandler>,
        config: EngineConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineSignal>) {
        let (signals, receiver) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            handler,
            config,
            pending: Mutex::new(VecDeque::new()),
            in_flight: AtomicUsize::new(0),
            keep_alive: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
            finished: Notify::new(),
            shutdown: Notify::new(),
            signals,
        });
        (engine, receiver)
    }

    /// Force the engine to close. Running tasks finish on their own; pending
    /// tasks are not started.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait for running tasks to finish, typically after [`run`](Self::run)
    /// returned. Returns `false` if some are still running after `timeout`.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.finished.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(in_flight = self.in_flight(), "tasks still running after drain timeout");
        }
        drained
    }

    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_idle(&self) -> bool {
        self.in_flight() == 0 && self.lock_pending().is_empty()
    }

    /// Drive the engine until it finishes or is shut down.
    pub async fn run(self: &Arc<Self>) -> EngineExit {
        info!(max_concurrent = self.config.max_concurrent, "engine started");

        let exit = loop {
            if self.is_closed() {
                break EngineExit::Shutdown;
            }

            self.dispatch();

            if self.is_idle() {
                self.keep_alive.store(false, Ordering::SeqCst);
                let (signal, done) = EngineSignal::idle();
                if self.signals.send(signal).is_err() {
                    debug!("no signal listener");
                    break EngineExit::Finished;
                }

                tokio::select! {
                    _ = self.shutdown.notified() => break EngineExit::Shutdown,
                    _ = done => {}
                }

                if !self.lock_pending().is_empty() {
                    continue;
                }
                if self.keep_alive.swap(false, Ordering::SeqCst) {
                    continue;
                }
                info!("idle with no keep-alive request");
                break EngineExit::Finished;
            }

            tokio::select! {
                _ = self.shutdown.notified() => break EngineExit::Shutdown,
                _ = self.wake.notified() => {}
            }
        };

        self.closed.store(true, Ordering::SeqCst);
        info!(
            ?exit,
            in_flight = self.in_flight(),
            pending = self.pending_len(),
            "engine stopped"
        );
        exit
    }

    /// Start pending tasks up to the concurrency limit.
    fn dispatch(self: &Arc<Self>) {
        let limit = self.config.max_concurrent.max(1);
        while self.in_flight() < limit {
            let Some(task) = self.lock_pending().pop_front() else {
                break;
            };
            self.in_flight.fetch_add(1, Ordering::SeqCst);

            let engine = Arc::clone(self);
            let span = start_task_span(&task);
            tokio::spawn(async move { engine.execute(task).await }.instrument(span));
        }
    }

    async fn execute(&self, task: Task) {
        let waited_ms = (Utc::now() - task.fetched_at()).num_milliseconds().max(0);
        debug!(task_id = %task.id(), waited_ms, "task started");

        let start = Instant::now();
        let result = self.handler.handle(&task).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(()) => {
                debug!(task_id = %task.id(), duration_ms, "task completed");
                Outcome::succeeded(duration_ms)
            }
            Err(e) => {
                warn!(task_id = %task.id(), duration_ms, error = %e, "task failed");
                Outcome::failed(e.to_string(), duration_ms)
            }
        };

        metrics::engine_tasks().add(
            1,
            &[KeyValue::new(
                "result",
                if outcome.success { "success" } else { "failure" },
            )],
        );

        // Listener gone means nobody settles messages any more; the broker
        // will redeliver on its own.
        let _ = self
            .signals
            .send(EngineSignal::TaskCompleted(Completion { task, outcome }));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.wake.notify_one();
        self.finished.notify_waiters();
    }
}

impl Engine for LocalEngine {
    fn submit(&self, task: Task) -> Result<()> {
        if self.is_closed() {
            return Err(Error::EngineClosed);
        }
        debug!(task_id = %task.id(), target = task.target(), "task scheduled");
        self.lock_pending().push_back(task);
        self.wake.notify_one();
        Ok(())
    }

    fn request_no_terminate(&self) {
        self.keep_alive.store(true, Ordering::SeqCst);
    }
}
