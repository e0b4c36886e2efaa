//! Queue feed: keeps an engine supplied from a work source.
//!
//! Two triggers refill the engine with at most one task each:
//!
//! - **idle**: the engine has nothing to do. Refill, then always veto
//!   termination, since new messages may arrive at any time.
//! - **task completed**: a task finished (success or failure). Settle its
//!   message per [`AckPolicy`], then refill right away instead of waiting
//!   for the engine to go idle.
//!
//! An empty queue therefore turns into a polling loop paced by the engine's
//! idle cadence. `min_idle_poll` puts a floor under that cadence.
//!
//! Messages of running tasks are held as leases. On brokers that hand a
//! message out again after a visibility timeout, `lease_renewal` keeps them
//! hidden until the task completes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{Instrument, debug, error, info, warn};

use crate::error::{Error, Result};
use crate::model::{AckContext, Completion, DeliveryTag};
use crate::source::WorkSource;
use crate::telemetry::feed::{record_refill, start_refill_span};
use crate::telemetry::metrics;

use super::{Engine, EngineSignal};

/// When a fetched message is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Ack when the task succeeds, reject when it fails.
    #[default]
    OnCompletion,
    /// Ack as soon as the engine accepts the task (at-most-once).
    OnSubmit,
    /// Never settle; the caller owns the delivery tag.
    Manual,
}

impl std::str::FromStr for AckPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "on_completion" | "completion" => Ok(Self::OnCompletion),
            "on_submit" | "submit" => Ok(Self::OnSubmit),
            "manual" | "none" => Ok(Self::Manual),
            other => Err(Error::Config(format!("unknown ack policy: {other}"))),
        }
    }
}

/// What caused a refill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    Idle,
    Completion,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Idle => "idle",
            Self::Completion => "completion",
        }
    }
}

/// Configuration for the queue feed.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub ack_policy: AckPolicy,
    /// Requeue the message of a failed task instead of dropping it.
    pub requeue_failed: bool,
    /// Minimum time between an empty idle refill and the next idle refill.
    pub min_idle_poll: Duration,
    /// How often to extend the visibility of messages whose tasks are still
    /// running. `None` uses half the client's visibility timeout, or no
    /// renewal for brokers that never redeliver unsettled messages.
    pub lease_renewal: Option<Duration>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ack_policy: AckPolicy::OnCompletion,
            requeue_failed: false,
            min_idle_poll: Duration::from_millis(500),
            lease_renewal: None,
        }
    }
}

/// Listens to engine signals and refills the engine from a [`WorkSource`].
pub struct QueueFeed {
    source: Arc<WorkSource>,
    engine: Arc<dyn Engine>,
    config: FeedConfig,
    last_empty_idle: Mutex<Option<Instant>>,
    leases: Mutex<HashMap<DeliveryTag, AckContext>>,
    shutdown: Arc<Notify>,
}

impl QueueFeed {
    pub fn new(source: Arc<WorkSource>, engine: Arc<dyn Engine>, config: FeedConfig) -> Self {
        Self {
            source,
            engine,
            config,
            last_empty_idle: Mutex::new(None),
            leases: Mutex::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn source(&self) -> &WorkSource {
        &self.source
    }

    /// Signal [`run`](Self::run) to return.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Seed the engine before it starts: one refill.
    pub async fn start(&self) -> Result<usize> {
        self.refill(Trigger::Start).await
    }

    /// Handle the engine's idle signal.
    ///
    /// Termination is vetoed whether or not a task was found, and also when
    /// the fetch failed; the error is still returned to the caller.
    pub async fn on_idle(&self) -> Result<usize> {
        self.throttle_idle().await;

        let result = self.refill(Trigger::Idle).await;
        self.engine.request_no_terminate();

        let found = matches!(result, Ok(n) if n > 0);
        *self.lock_last_empty() = if found { None } else { Some(Instant::now()) };
        result
    }

    /// Handle the engine's task-completed signal.
    pub async fn on_task_completed(&self, completion: &Completion) -> Result<usize> {
        // Logged inside since a refill error takes precedence in the result.
        let settled = self.settle_logged(completion).await;
        let submitted = self.refill(Trigger::Completion).await?;
        settled?;
        Ok(submitted)
    }

    /// Messages fetched, handed to the engine and not yet settled.
    pub fn held_leases(&self) -> usize {
        self.lock_leases().len()
    }

    /// Extend the visibility of every message whose task is still running.
    /// Returns how many were extended; failures are logged and skipped.
    pub async fn renew_leases(&self) -> usize {
        let held: Vec<AckContext> = self.lock_leases().values().cloned().collect();
        let client = self.source.client();

        let mut renewed = 0;
        for ack in &held {
            match client.extend_visibility(&ack.queue, &ack.delivery_tag).await {
                Ok(()) => renewed += 1,
                Err(e) => warn!(
                    queue = %ack.queue,
                    delivery_tag = %ack.delivery_tag,
                    error = %e,
                    "lease renewal failed"
                ),
            }
        }
        if renewed > 0 {
            debug!(renewed, "leases renewed");
        }
        renewed
    }

    /// Consume engine signals until shutdown or until the engine drops its
    /// sender. Per-signal errors are logged and do not stop the loop.
    pub async fn run(&self, mut signals: mpsc::UnboundedReceiver<EngineSignal>) -> Result<()> {
        info!(queue = %self.source.queue(), ack_policy = ?self.config.ack_policy, "queue feed started");

        let period = self.config.lease_renewal.or_else(|| {
            self.source
                .client()
                .visibility_timeout()
                .map(|timeout| timeout / 2)
        });
        let mut renewal = period.filter(|p| !p.is_zero()).map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let signal = tokio::select! {
                _ = self.shutdown.notified() => {
                    let settled = self.settle_reported(&mut signals).await;
                    info!(settled, "queue feed shutting down");
                    return Ok(());
                }
                _ = next_tick(&mut renewal) => {
                    self.renew_leases().await;
                    continue;
                }
                signal = signals.recv() => signal,
            };

            let Some(signal) = signal else {
                info!("engine signal stream closed");
                return Ok(());
            };

            match signal {
                EngineSignal::Idle { done } => {
                    if let Err(e) = self.on_idle().await {
                        error!(queue = %self.source.queue(), "idle refill failed: {e}");
                    }
                    let _ = done.send(());
                }
                EngineSignal::TaskCompleted(completion) => {
                    if let Err(e) = self.on_task_completed(&completion).await {
                        error!(queue = %self.source.queue(), "completion refill failed: {e}");
                    }
                }
            }
        }
    }

    /// Settle completions the engine already reported, without refilling.
    /// Pending idle cycles are released.
    async fn settle_reported(&self, signals: &mut mpsc::UnboundedReceiver<EngineSignal>) -> usize {
        let mut settled = 0;
        while let Ok(signal) = signals.try_recv() {
            match signal {
                EngineSignal::Idle { done } => {
                    let _ = done.send(());
                }
                EngineSignal::TaskCompleted(completion) => {
                    if self.settle_logged(&completion).await.is_ok() {
                        settled += 1;
                    }
                }
            }
        }
        settled
    }

    async fn settle_logged(&self, completion: &Completion) -> Result<()> {
        let ack = completion.task.ack_context();
        self.release_lease(ack);

        let settled = self.settle(completion).await;
        if let Err(e) = &settled {
            error!(
                queue = %ack.queue,
                delivery_tag = %ack.delivery_tag,
                error = %e,
                "settlement failed, message left unacknowledged"
            );
        }
        settled
    }

    fn lock_leases(&self) -> std::sync::MutexGuard<'_, HashMap<DeliveryTag, AckContext>> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn hold_lease(&self, ack: &AckContext) {
        if self.config.ack_policy == AckPolicy::OnCompletion {
            self.lock_leases().insert(ack.delivery_tag.clone(), ack.clone());
        }
    }

    fn release_lease(&self, ack: &AckContext) {
        self.lock_leases().remove(&ack.delivery_tag);
    }

    fn lock_last_empty(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.last_empty_idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn throttle_idle(&self) {
        if self.config.min_idle_poll.is_zero() {
            return;
        }
        let last = *self.lock_last_empty();
        if let Some(at) = last {
            let ready = at + self.config.min_idle_poll;
            if Instant::now() < ready {
                debug!(wait_ms = (ready - Instant::now()).as_millis() as u64, "throttling idle poll");
                tokio::time::sleep_until(ready).await;
            }
        }
    }

    async fn refill(&self, trigger: Trigger) -> Result<usize> {
        let span = start_refill_span(trigger.as_str(), self.source.queue());

        async {
            let mut accepted: Option<AckContext> = None;
            let result = self
                .source
                .refill(|task| {
                    let ack = task.ack_context().clone();
                    debug!(
                        trigger = trigger.as_str(),
                        task_id = %task.id(),
                        delivery_tag = %ack.delivery_tag,
                        target = task.target(),
                        "submitting task"
                    );
                    self.engine.submit(task)?;
                    self.hold_lease(&ack);
                    accepted = Some(ack);
                    Ok(())
                })
                .await;

            let outcome = match &result {
                Ok(0) => "empty",
                Ok(_) => "task",
                Err(_) => "error",
            };
            metrics::feed_refills().add(
                1,
                &[
                    KeyValue::new("trigger", trigger.as_str()),
                    KeyValue::new("result", outcome),
                ],
            );

            let submitted = result?;
            record_refill(&span, submitted);

            if let (AckPolicy::OnSubmit, Some(ack)) = (self.config.ack_policy, accepted) {
                self.source
                    .client()
                    .ack(&ack.queue, &ack.delivery_tag)
                    .await?;
                record_settlement(&ack, "ack");
            }
            Ok(submitted)
        }
        .instrument(span.clone())
        .await
    }

    async fn settle(&self, completion: &Completion) -> Result<()> {
        if self.config.ack_policy != AckPolicy::OnCompletion {
            return Ok(());
        }

        let ack = completion.task.ack_context();
        let client = self.source.client();
        if completion.outcome.success {
            client.ack(&ack.queue, &ack.delivery_tag).await?;
            record_settlement(ack, "ack");
        } else {
            client
                .reject(&ack.queue, &ack.delivery_tag, self.config.requeue_failed)
                .await?;
            record_settlement(
                ack,
                if self.config.requeue_failed {
                    "requeue"
                } else {
                    "reject"
                },
            );
        }
        Ok(())
    }
}

fn record_settlement(ack: &AckContext, action: &'static str) {
    debug!(queue = %ack.queue, delivery_tag = %ack.delivery_tag, action, "message settled");
    metrics::feed_settlements().add(
        1,
        &[
            KeyValue::new("queue", ack.queue.clone()),
            KeyValue::new("action", action),
        ],
    );
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
