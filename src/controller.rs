//! External step-by-step API with worker lifecycle and liveness watchdog.
//!
//! [`StepController`] wraps one [`Orchestrator`] run for asynchronous remote
//! control: it spawns the single worker task, intercepts the status stream to
//! funnel iteration completions into a pull queue, exposes the command
//! surface with separate post and acknowledgment-wait steps, and runs a
//! watchdog that detects a dead worker through debounced liveness checks.
//!
//! # Thread Safety
//!
//! Command posts and queries never hold a lock across an await. The event
//! queue receiver sits behind its own async mutex so a blocked
//! [`StepController::wait_for_next_event`] cannot stall command posting, and
//! every wait re-checks the cleanup flag so shutdown is observed promptly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use async_trait::async_trait;

use crate::config::{EngineSettings, TestConfig};
use crate::error::{AppResult, FrameworkError};
use crate::executor::{ContentRunner, DeviceController, IterationResult};
use crate::orchestrator::{Orchestrator, RunReason};
use crate::state::{AckRecord, Command, ExecutionState, RunStateSnapshot};
use crate::status::{Reporter, StatusBus, StatusEvent, StatusKind};
use crate::strategy::Strategy;

/// Event delivered to step-by-step callers.
#[derive(Debug, Clone)]
pub enum StepEvent {
    /// An iteration completed; carries the full status event.
    Iteration(StatusEvent),
    /// The run reached its terminal state; carries the terminal event.
    Terminal(StatusEvent),
    /// The watchdog confirmed the worker died.
    WorkerDied,
}

/// Outcome of one [`StepController::wait_for_next_event`] call.
#[derive(Debug)]
pub enum WaitOutcome {
    /// An event arrived within the timeout.
    Event(StepEvent),
    /// The timeout expired with no event.
    Timeout,
    /// Cleanup was requested; no further events will arrive.
    CleanupRequested,
}

/// Outcome of an acknowledgment wait.
///
/// `Timeout` is ambiguous: the command may still complete, or its ack may
/// already have been consumed. Callers re-query the run snapshot instead of
/// treating it as success or failure.
#[derive(Debug)]
pub enum AckWait {
    /// The command was acknowledged.
    Acknowledged(AckRecord),
    /// No acknowledgment within the wait; state unknown.
    Timeout,
    /// No run is active.
    NoActiveRun,
}

/// Status interceptor: forwards everything downstream and funnels iteration
/// completions and the terminal event into the step-event queue.
struct StepInterceptor {
    downstream: Option<Arc<dyn Reporter>>,
    events: mpsc::Sender<StepEvent>,
}

#[async_trait]
impl Reporter for StepInterceptor {
    async fn report(&self, event: StatusEvent) -> anyhow::Result<()> {
        match event.kind {
            StatusKind::IterationComplete => {
                if self
                    .events
                    .try_send(StepEvent::Iteration(event.clone()))
                    .is_err()
                {
                    log::warn!("step event queue full, dropping iteration event");
                }
            }
            StatusKind::ExperimentEnd => {
                let _ = self.events.try_send(StepEvent::Terminal(event.clone()));
            }
            _ => {}
        }
        if let Some(downstream) = &self.downstream {
            downstream.report(event).await?;
        }
        Ok(())
    }
}

/// Debounced death detection: a single dead observation is never enough, and
/// a boot-retry window resets the count entirely.
#[derive(Debug)]
pub struct WatchdogDebounce {
    consecutive: u32,
    threshold_idle: u32,
    threshold_active: u32,
}

impl WatchdogDebounce {
    /// `threshold_idle` applies once the run state reads inactive;
    /// `threshold_active` while the state still claims an active run.
    pub fn new(threshold_idle: u32, threshold_active: u32) -> Self {
        Self {
            consecutive: 0,
            threshold_idle,
            threshold_active,
        }
    }

    /// Feeds one observation; returns `true` when death is confirmed.
    pub fn observe(&mut self, worker_finished: bool, state_active: bool, in_retry: bool) -> bool {
        if in_retry || !worker_finished {
            self.consecutive = 0;
            return false;
        }
        self.consecutive += 1;
        let threshold = if state_active {
            self.threshold_active
        } else {
            self.threshold_idle
        };
        self.consecutive >= threshold
    }

    /// Current consecutive dead-observation count.
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

struct ActiveRun {
    orchestrator: Arc<Orchestrator>,
    state: Arc<ExecutionState>,
    status: Arc<StatusBus>,
    worker: Option<JoinHandle<Vec<IterationResult>>>,
    watchdog: Option<JoinHandle<()>>,
    events_tx: mpsc::Sender<StepEvent>,
}

/// Asynchronous step-by-step control surface over one run at a time.
pub struct StepController {
    settings: Arc<EngineSettings>,
    active: Mutex<Option<ActiveRun>>,
    events: tokio::sync::Mutex<Option<mpsc::Receiver<StepEvent>>>,
    cleanup_requested: Arc<AtomicBool>,
    cleanup_notify: Arc<Notify>,
}

impl StepController {
    /// Creates a controller with no active run.
    pub fn new(settings: Arc<EngineSettings>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            active: Mutex::new(None),
            events: tokio::sync::Mutex::new(None),
            cleanup_requested: Arc::new(AtomicBool::new(false)),
            cleanup_notify: Arc::new(Notify::new()),
        })
    }

    fn active_guard(&self) -> std::sync::MutexGuard<'_, Option<ActiveRun>> {
        match self.active.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Starts a step-mode run. Rejects while another run is still active.
    ///
    /// Spawns exactly one worker task driving `Orchestrator::run` and one
    /// watchdog task, and installs the status interceptor feeding
    /// [`StepController::wait_for_next_event`].
    pub async fn start_step_experiment(
        self: &Arc<Self>,
        cfg: TestConfig,
        strategy: Strategy,
        device: Arc<dyn DeviceController>,
        content: Arc<dyn ContentRunner>,
        reporter: Option<Arc<dyn Reporter>>,
    ) -> AppResult<uuid::Uuid> {
        {
            let mut guard = self.active_guard();
            if let Some(run) = guard.as_ref() {
                let finished = run
                    .worker
                    .as_ref()
                    .map(|w| w.is_finished())
                    .unwrap_or(true);
                if !finished {
                    return Err(FrameworkError::RunAlreadyActive(
                        run.state.snapshot().experiment_name,
                    ));
                }
                // Previous run finished but was never cleaned up; discard it.
                log::warn!("discarding stale finished run before start");
                *guard = None;
            }
        }
        self.cleanup_requested.store(false, Ordering::SeqCst);

        let (events_tx, events_rx) = mpsc::channel::<StepEvent>(64);
        let interceptor: Arc<dyn Reporter> = Arc::new(StepInterceptor {
            downstream: reporter,
            events: events_tx.clone(),
        });
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&self.settings),
            Some(interceptor),
        ));
        let state = orchestrator.state();
        let status = orchestrator.status();
        let run_id = orchestrator.run_id();
        let executor = Arc::new(orchestrator.executor(device, content));

        let worker = {
            let orchestrator = Arc::clone(&orchestrator);
            let strategy = strategy.clone();
            tokio::spawn(async move {
                orchestrator
                    .run(&strategy, &executor, cfg, true)
                    .await
            })
        };
        let watchdog = {
            let controller = Arc::clone(self);
            let state = Arc::clone(&state);
            let worker_alive = worker.abort_handle();
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                controller
                    .watchdog_loop(state, worker_alive, events_tx)
                    .await;
            })
        };

        {
            let mut guard = self.active_guard();
            *guard = Some(ActiveRun {
                orchestrator,
                state,
                status,
                worker: Some(worker),
                watchdog: Some(watchdog),
                events_tx,
            });
        }
        *self.events.lock().await = Some(events_rx);
        log::info!("step experiment {run_id} started");
        Ok(run_id)
    }

    /// Blocking pull on the step-event queue with periodic re-checks of the
    /// cleanup flag, so a shutdown is observed even mid-wait.
    pub async fn wait_for_next_event(&self, timeout: Duration) -> WaitOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.cleanup_requested.load(Ordering::SeqCst) {
                return WaitOutcome::CleanupRequested;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return WaitOutcome::Timeout;
            }
            let slice = remaining.min(Duration::from_secs(1));
            let mut guard = self.events.lock().await;
            let Some(rx) = guard.as_mut() else {
                return WaitOutcome::CleanupRequested;
            };
            match tokio::time::timeout(slice, rx.recv()).await {
                Ok(Some(event)) => return WaitOutcome::Event(event),
                Ok(None) => return WaitOutcome::CleanupRequested,
                Err(_) => {
                    // Slice expired; drop the lock and re-check the flag.
                    drop(guard);
                }
            }
        }
    }

    /// Posts `Pause`. Returns whether the bus accepted it.
    pub fn pause(&self) -> bool {
        self.post(Command::Pause)
    }

    /// Posts `Resume`.
    pub fn resume(&self) -> bool {
        self.post(Command::Resume)
    }

    /// Posts `Cancel`.
    pub fn cancel(&self) -> bool {
        self.post(Command::Cancel)
    }

    /// Posts `EndExperiment`.
    pub fn end_experiment(&self) -> bool {
        self.post(Command::EndExperiment)
    }

    /// Posts `StepContinue`.
    pub fn step_continue(&self) -> bool {
        self.post(Command::StepContinue)
    }

    /// Posts `EnableStepMode`.
    pub fn enable_step_mode(&self) -> bool {
        self.post(Command::EnableStepMode)
    }

    /// Posts `DisableStepMode`.
    pub fn disable_step_mode(&self) -> bool {
        self.post(Command::DisableStepMode)
    }

    /// Clears any stale ack for `cmd`, then posts it. Acceptance means the
    /// command entered the bus, not that it was applied; pair with
    /// [`StepController::wait_for_acknowledgment`] for a synchronous round
    /// trip.
    fn post(&self, cmd: Command) -> bool {
        let Some(state) = self.current_state() else {
            return false;
        };
        state.clear_ack(cmd);
        state.post(cmd, None)
    }

    /// Waits up to `max_wait` (engine default when `None`) for the
    /// acknowledgment of `cmd`.
    pub async fn wait_for_acknowledgment(
        &self,
        cmd: Command,
        max_wait: Option<Duration>,
    ) -> AckWait {
        let Some(state) = self.current_state() else {
            return AckWait::NoActiveRun;
        };
        let max_wait = max_wait.unwrap_or(self.settings.ack_wait);
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if let Some(ack) = state.take_ack(cmd) {
                return AckWait::Acknowledged(ack);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                log::warn!("no acknowledgment for {cmd} within {max_wait:?}");
                return AckWait::Timeout;
            }
            state
                .wait_until(
                    remaining.min(Duration::from_millis(500)),
                    self.settings.pause_poll,
                    |s| s.has_ack(cmd),
                )
                .await;
        }
    }

    /// Read-only run snapshot, `None` when no run is active.
    pub fn execution_state(&self) -> Option<RunStateSnapshot> {
        self.current_state().map(|s| s.snapshot())
    }

    /// Context-sensitive command list for the active run.
    pub fn available_commands(&self) -> Vec<Command> {
        self.current_state()
            .map(|s| s.available_commands())
            .unwrap_or_default()
    }

    fn current_state(&self) -> Option<Arc<ExecutionState>> {
        self.active_guard().as_ref().map(|r| Arc::clone(&r.state))
    }

    /// Watchdog: checks worker liveness every period. A dead observation
    /// requires several consecutive confirmations before declaring death,
    /// with a higher bar while the run state still claims active, and is
    /// suppressed entirely during a boot-retry settle window.
    ///
    /// A finished worker whose run state already reads inactive is a clean
    /// completion the caller never reclaimed: the slot is cleaned up without
    /// announcing a death.
    async fn watchdog_loop(
        self: Arc<Self>,
        state: Arc<ExecutionState>,
        worker: tokio::task::AbortHandle,
        events_tx: mpsc::Sender<StepEvent>,
    ) {
        let mut interval = tokio::time::interval(self.settings.watchdog_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // first tick is immediate
        let mut debounce = WatchdogDebounce::new(
            self.settings.watchdog_dead_checks,
            self.settings.watchdog_dead_checks_active,
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.cleanup_notify.notified() => return,
            }
            if self.cleanup_requested.load(Ordering::SeqCst) {
                return;
            }
            let run_active = state.snapshot().active;
            let confirmed =
                debounce.observe(worker.is_finished(), run_active, state.in_boot_retry());
            if confirmed {
                let reason = if run_active {
                    log::error!(
                        "watchdog confirmed worker death after {} checks",
                        debounce.consecutive()
                    );
                    let _ = events_tx.try_send(StepEvent::WorkerDied);
                    RunReason::WorkerDied
                } else {
                    log::info!("worker finished without cleanup, reclaiming run slot");
                    RunReason::Completed
                };
                let controller = Arc::clone(&self);
                // Cleanup runs detached so aborting the watchdog cannot
                // interrupt it midway.
                tokio::spawn(async move {
                    if let Err(err) = controller.force_cleanup(reason).await {
                        log::error!("watchdog-triggered cleanup failed: {err}");
                    }
                });
                return;
            }
        }
    }

    /// Idempotent forced teardown: flag waiters, stop the watchdog, drain the
    /// event queue, attempt a graceful cancel with a bounded join, then drop
    /// all run references. Safe from normal completion, cancellation, or
    /// watchdog-triggered death.
    pub async fn force_cleanup(&self, reason: RunReason) -> AppResult<()> {
        // Flag first so blocked readers unblock before anything is torn down.
        self.cleanup_requested.store(true, Ordering::SeqCst);
        self.cleanup_notify.notify_waiters();

        let Some(mut run) = self.active_guard().take() else {
            return Ok(());
        };
        if let Some(watchdog) = run.watchdog.take() {
            watchdog.abort();
        }
        {
            let mut guard = self.events.lock().await;
            if let Some(rx) = guard.as_mut() {
                while rx.try_recv().is_ok() {}
            }
            *guard = None;
        }

        let mut join_error = None;
        if let Some(worker) = run.worker.take() {
            if !worker.is_finished() {
                run.state.post(Command::Cancel, None);
            }
            match tokio::time::timeout(self.settings.cleanup_join, worker).await {
                Ok(Ok(results)) => {
                    log::info!("worker joined with {} results during cleanup", results.len());
                }
                Ok(Err(err)) if err.is_panic() => {
                    log::error!("worker panicked: {err}");
                    join_error = Some(FrameworkError::WorkerFailed(err.to_string()));
                }
                Ok(Err(err)) => {
                    log::warn!("worker join error: {err}");
                }
                Err(_) => {
                    log::error!(
                        "worker did not stop within {:?}, aborting",
                        self.settings.cleanup_join
                    );
                    join_error = Some(FrameworkError::WorkerJoinTimeout(
                        self.settings.cleanup_join,
                    ));
                }
            }
        }

        if reason == RunReason::WorkerDied {
            run.status.send(StatusKind::WorkerDied, serde_json::json!({}));
        }
        // A worker that died before finalizing still gets its terminal event.
        run.orchestrator.finalize(reason, &[]);
        run.status.shutdown().await;
        drop(run.events_tx);
        log::info!("cleanup complete ({})", reason.as_str());
        join_error.map_or(Ok(()), Err)
    }

    /// Whether a cleanup has been requested (and the run is gone or going).
    pub fn cleanup_requested(&self) -> bool {
        self.cleanup_requested.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ContentOutcome;

    struct InstantDevice;

    #[async_trait]
    impl DeviceController for InstantDevice {
        async fn boot(&self, _cfg: &TestConfig) -> anyhow::Result<bool> {
            Ok(true)
        }
        async fn power_cycle(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn reboot(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct InstantContent;

    #[async_trait]
    impl ContentRunner for InstantContent {
        async fn run_content(&self, _cfg: &TestConfig) -> anyhow::Result<ContentOutcome> {
            Ok(ContentOutcome {
                pass_string: "PASS".into(),
                ..ContentOutcome::default()
            })
        }
        async fn run_script(&self, _s: &str, _cfg: &TestConfig) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_settings() -> Arc<EngineSettings> {
        Arc::new(EngineSettings {
            pause_poll: Duration::from_millis(10),
            step_wait_max: Duration::from_secs(5),
            step_wait_relog: Duration::from_secs(2),
            watchdog_period: Duration::from_millis(30),
            cleanup_join: Duration::from_secs(2),
            ack_wait: Duration::from_secs(2),
            ..EngineSettings::default()
        })
    }

    fn test_cfg() -> TestConfig {
        let dir = tempfile::tempdir().unwrap();
        TestConfig {
            test_name: "step".into(),
            artifact_root: dir.into_path(),
            ..TestConfig::default()
        }
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let controller = StepController::new(test_settings());
        let strategy = Strategy::fixed_loop(3).unwrap();
        controller
            .start_step_experiment(
                test_cfg(),
                strategy.clone(),
                Arc::new(InstantDevice),
                Arc::new(InstantContent),
                None,
            )
            .await
            .unwrap();
        let second = controller
            .start_step_experiment(
                test_cfg(),
                strategy,
                Arc::new(InstantDevice),
                Arc::new(InstantContent),
                None,
            )
            .await;
        assert!(matches!(second, Err(FrameworkError::RunAlreadyActive(_))));
        controller.force_cleanup(RunReason::Cancelled).await.ok();
    }

    #[tokio::test]
    async fn test_step_flow_delivers_iteration_events() {
        let controller = StepController::new(test_settings());
        controller
            .start_step_experiment(
                test_cfg(),
                Strategy::fixed_loop(2).unwrap(),
                Arc::new(InstantDevice),
                Arc::new(InstantContent),
                None,
            )
            .await
            .unwrap();

        let first = controller.wait_for_next_event(Duration::from_secs(5)).await;
        let WaitOutcome::Event(StepEvent::Iteration(event)) = first else {
            panic!("expected iteration event, got {first:?}");
        };
        assert_eq!(event.context.current_iteration, 1);

        // The iteration event can arrive before the worker parks; wait for
        // the step-wait flag before releasing it.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !controller
            .execution_state()
            .map(|s| s.waiting_for_step)
            .unwrap_or(false)
        {
            assert!(tokio::time::Instant::now() < deadline, "never parked");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(controller.step_continue());
        let ack = controller
            .wait_for_acknowledgment(Command::StepContinue, None)
            .await;
        assert!(matches!(ack, AckWait::Acknowledged(_)));

        let second = controller.wait_for_next_event(Duration::from_secs(5)).await;
        assert!(matches!(
            second,
            WaitOutcome::Event(StepEvent::Iteration(_))
        ));
        let terminal = controller.wait_for_next_event(Duration::from_secs(5)).await;
        let WaitOutcome::Event(StepEvent::Terminal(event)) = terminal else {
            panic!("expected terminal event, got {terminal:?}");
        };
        assert_eq!(event.payload["reason"], "completed");
        controller.force_cleanup(RunReason::Completed).await.ok();
    }

    #[tokio::test]
    async fn test_cleanup_unblocks_waiters() {
        let controller = StepController::new(test_settings());
        controller
            .start_step_experiment(
                test_cfg(),
                Strategy::fixed_loop(5).unwrap(),
                Arc::new(InstantDevice),
                Arc::new(InstantContent),
                None,
            )
            .await
            .unwrap();
        // Consume the first iteration event so the worker parks.
        let _ = controller.wait_for_next_event(Duration::from_secs(5)).await;

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller.wait_for_next_event(Duration::from_secs(30)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        controller
            .force_cleanup(RunReason::Cancelled)
            .await
            .unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(3), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::CleanupRequested));
        // Idempotent second call.
        controller
            .force_cleanup(RunReason::Cancelled)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_clean_completion_reclaims_slot_without_death_event() {
        let controller = StepController::new(test_settings());
        controller
            .start_step_experiment(
                test_cfg(),
                Strategy::fixed_loop(1).unwrap(),
                Arc::new(InstantDevice),
                Arc::new(InstantContent),
                None,
            )
            .await
            .unwrap();

        // Single iteration, no step wait: the worker finishes on its own and
        // the watchdog reclaims the slot without reporting a death.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            assert!(
                tokio::time::Instant::now() < deadline,
                "watchdog never reclaimed the finished run"
            );
            match controller
                .wait_for_next_event(Duration::from_millis(100))
                .await
            {
                WaitOutcome::Event(StepEvent::WorkerDied) => {
                    panic!("clean completion reported as worker death")
                }
                WaitOutcome::CleanupRequested => break,
                _ => {}
            }
        }
        assert!(controller.execution_state().is_none());
    }

    #[test]
    fn test_debounce_requires_five_consecutive_dead_checks() {
        let mut debounce = WatchdogDebounce::new(5, 20);
        for _ in 0..4 {
            assert!(!debounce.observe(true, false, false));
        }
        assert!(debounce.observe(true, false, false));
    }

    #[test]
    fn test_debounce_resets_on_live_observation() {
        let mut debounce = WatchdogDebounce::new(5, 20);
        for _ in 0..4 {
            assert!(!debounce.observe(true, false, false));
        }
        assert!(!debounce.observe(false, false, false));
        for _ in 0..4 {
            assert!(!debounce.observe(true, false, false));
        }
        assert!(debounce.observe(true, false, false));
    }

    #[test]
    fn test_debounce_suppressed_during_boot_retry() {
        let mut debounce = WatchdogDebounce::new(5, 20);
        for _ in 0..100 {
            assert!(!debounce.observe(true, false, true));
        }
        assert_eq!(debounce.consecutive(), 0);
    }

    #[test]
    fn test_debounce_escalates_while_state_claims_active() {
        let mut debounce = WatchdogDebounce::new(5, 20);
        for _ in 0..19 {
            assert!(!debounce.observe(true, true, false));
        }
        assert!(debounce.observe(true, true, false));
    }

    #[tokio::test]
    async fn test_commands_without_run_are_rejected() {
        let controller = StepController::new(test_settings());
        assert!(!controller.pause());
        assert!(!controller.cancel());
        assert!(controller.execution_state().is_none());
        assert!(controller.available_commands().is_empty());
        assert!(matches!(
            controller
                .wait_for_acknowledgment(Command::Pause, Some(Duration::from_millis(50)))
                .await,
            AckWait::NoActiveRun
        ));
    }
}
