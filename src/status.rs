//! Decoupled status event pipeline.
//!
//! The worker reports progress by pushing immutable [`StatusEvent`]s onto a
//! bounded queue; a single consumer task dequeues and hands them to the
//! registered [`Reporter`]. The worker is never gated on a slow consumer: a
//! full queue drops the new event with a warning instead of blocking, and a
//! bus with no reporter degrades to a no-op.
//!
//! # Data Flow
//!
//! ```text
//! worker -- send(kind, payload) --> [bounded queue] --> consumer task --> Reporter
//! ```
//!
//! Context (experiment name, strategy, counters) is merged into each event at
//! send time; events are never mutated after enqueue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Kinds of status events emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusKind {
    /// A run has been prepared and is about to execute.
    ExperimentStart,
    /// Terminal event; exactly one per run, carrying a `reason` payload.
    ExperimentEnd,
    /// Strategy-level progress (iteration boundary).
    StrategyProgress,
    /// An iteration began executing.
    IterationStart,
    /// Mid-iteration checkpoint progress.
    IterationProgress,
    /// An iteration finished, with status and statistics.
    IterationComplete,
    /// The worker halted on a pause command.
    ExecutionHalted,
    /// The worker resumed after a pause.
    ExecutionResumed,
    /// Step mode toggled on.
    StepModeEnabled,
    /// Step mode toggled off.
    StepModeDisabled,
    /// The worker is parked waiting for `StepContinue`.
    WaitingForStep,
    /// The watchdog confirmed the worker died.
    WorkerDied,
}

/// Context fields merged into every event at send time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusContext {
    /// Experiment name for the current run.
    pub experiment_name: String,
    /// Strategy descriptor (`loop`, `sweep:frequency`, `shmoo`).
    pub strategy: String,
    /// 1-based iteration currently in flight.
    pub current_iteration: usize,
    /// Total iterations for the run.
    pub total_iterations: usize,
}

/// Immutable status event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Event kind.
    pub kind: StatusKind,
    /// Enqueue timestamp.
    pub timestamp: DateTime<Utc>,
    /// Context snapshot taken at send time.
    pub context: StatusContext,
    /// Kind-specific payload.
    pub payload: serde_json::Value,
}

impl StatusEvent {
    /// Progress percentage carried in the payload, if any.
    pub fn progress_percent(&self) -> Option<f64> {
        self.payload.get("progress_percent").and_then(|v| v.as_f64())
    }
}

/// Sink for dispatched events. Errors are logged by the consumer, never
/// propagated back toward the worker.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Handles one event.
    async fn report(&self, event: StatusEvent) -> anyhow::Result<()>;
}

/// Bounded event queue with a single consumer task.
pub struct StatusBus {
    context: Mutex<StatusContext>,
    tx: Option<mpsc::Sender<StatusEvent>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl StatusBus {
    /// Creates a disabled bus; every `send` is a no-op until a reporter is
    /// attached via [`StatusBus::with_reporter`].
    pub fn disabled() -> Self {
        Self {
            context: Mutex::new(StatusContext::default()),
            tx: None,
            consumer: Mutex::new(None),
        }
    }

    /// Creates a bus dispatching to `reporter` from a dedicated consumer task.
    ///
    /// # Panics
    ///
    /// The consumer task is spawned immediately, so this must be called from
    /// within a Tokio runtime and panics otherwise.
    pub fn with_reporter(reporter: Arc<dyn Reporter>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<StatusEvent>(capacity.max(1));
        let consumer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(err) = reporter.report(event).await {
                    log::error!("status reporter failed: {err:#}");
                }
            }
        });
        Self {
            context: Mutex::new(StatusContext::default()),
            tx: Some(tx),
            consumer: Mutex::new(Some(consumer)),
        }
    }

    fn context_guard(&self) -> std::sync::MutexGuard<'_, StatusContext> {
        match self.context.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Merges non-empty fields into the held context. Atomic relative to
    /// `send`: no event observes a half-updated context.
    pub fn update_context(&self, update: ContextUpdate) {
        let mut ctx = self.context_guard();
        if let Some(name) = update.experiment_name {
            ctx.experiment_name = name;
        }
        if let Some(strategy) = update.strategy {
            ctx.strategy = strategy;
        }
        if let Some(current) = update.current_iteration {
            ctx.current_iteration = current;
        }
        if let Some(total) = update.total_iterations {
            ctx.total_iterations = total;
        }
    }

    /// Builds an immutable event from the current context and enqueues it.
    /// Never blocks: a full queue drops the event with a warning.
    pub fn send(&self, kind: StatusKind, payload: serde_json::Value) {
        let Some(tx) = &self.tx else {
            return;
        };
        let event = StatusEvent {
            kind,
            timestamp: Utc::now(),
            context: self.context_guard().clone(),
            payload,
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ev)) => {
                log::warn!("status queue full, dropping {:?} event", ev.kind);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("status consumer gone, discarding event");
            }
        }
    }

    /// Convenience for progress events expressed as a 0.0..=1.0 weight.
    pub fn send_progress(&self, kind: StatusKind, weight: f64) {
        self.send(
            kind,
            serde_json::json!({ "progress_percent": (weight * 100.0).clamp(0.0, 100.0) }),
        );
    }

    /// Lets the queue drain (bounded wait), then stops the consumer task.
    pub async fn shutdown(&self) {
        if let Some(tx) = &self.tx {
            let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
            while tx.capacity() < tx.max_capacity() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            // Grace period for the event currently inside the reporter.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let handle = {
            let mut guard = match self.consumer.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(handle) = handle {
            handle.abort();
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    log::error!("status consumer panicked: {err}");
                }
            }
        }
    }
}

impl Drop for StatusBus {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.consumer.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

/// Partial context update; `None` fields are left untouched.
#[derive(Debug, Default, Clone)]
pub struct ContextUpdate {
    /// New experiment name.
    pub experiment_name: Option<String>,
    /// New strategy descriptor.
    pub strategy: Option<String>,
    /// New current iteration.
    pub current_iteration: Option<usize>,
    /// New total iteration count.
    pub total_iterations: Option<usize>,
}
