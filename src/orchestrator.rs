//! Run orchestration: strategy loop, step mode, statistics, finalization.
//!
//! One [`Orchestrator`] owns exactly one [`ExecutionState`] and one
//! [`StatusBus`] instance for the duration of one run. It prepares the state,
//! drives the strategy against a [`TestExecutor`], applies the reset policy
//! between iterations, parks in step mode when enabled, and always emits
//! exactly one terminal event distinguishing how the run ended.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{EngineSettings, TestConfig};
use crate::error::{AppResult, FrameworkError};
use crate::executor::{IterationResult, IterationStatus, TestExecutor};
use crate::state::{CheckResult, Command, ExecutionState};
use crate::status::{ContextUpdate, Reporter, StatusBus, StatusKind};
use crate::strategy::{apply_reset_policy, Strategy};

/// Why a run reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunReason {
    /// All iterations executed.
    Completed,
    /// Aborted by `Cancel`/`EmergencyStop`.
    Cancelled,
    /// Stopped after the current iteration by `EndExperiment`.
    EndedByCommand,
    /// Boot bring-up failed; remaining iterations abandoned.
    ExecutionFailure,
    /// The worker loop itself failed.
    Error,
    /// The watchdog confirmed the worker died.
    WorkerDied,
}

impl RunReason {
    /// Stable name carried in the terminal event payload.
    pub fn as_str(self) -> &'static str {
        match self {
            RunReason::Completed => "completed",
            RunReason::Cancelled => "cancelled",
            RunReason::EndedByCommand => "ended_by_command",
            RunReason::ExecutionFailure => "execution_failure",
            RunReason::Error => "error",
            RunReason::WorkerDied => "worker_died",
        }
    }
}

/// Aggregate counters over the results recorded so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunStatistics {
    /// Planned iterations for the run.
    pub total_iterations: usize,
    /// Iterations with a recorded result.
    pub completed: usize,
    /// `Pass` results.
    pub passed: usize,
    /// `Fail` results.
    pub failed: usize,
    /// `Cancelled` results.
    pub cancelled: usize,
    /// `Failed` results.
    pub errors: usize,
    /// `ExecutionFailure` results.
    pub execution_failures: usize,
    /// Pass percentage over completed iterations.
    pub pass_rate_percent: f64,
}

impl RunStatistics {
    /// Computes statistics from the ordered result list.
    pub fn from_results(results: &[IterationResult], total_iterations: usize) -> Self {
        let mut stats = RunStatistics {
            total_iterations,
            completed: results.len(),
            ..RunStatistics::default()
        };
        for result in results {
            match result.status {
                IterationStatus::Pass => stats.passed += 1,
                IterationStatus::Fail => stats.failed += 1,
                IterationStatus::Cancelled => stats.cancelled += 1,
                IterationStatus::Failed => stats.errors += 1,
                IterationStatus::ExecutionFailure => stats.execution_failures += 1,
            }
        }
        if stats.completed > 0 {
            stats.pass_rate_percent = stats.passed as f64 * 100.0 / stats.completed as f64;
        }
        stats
    }
}

/// Outcome of one step-mode wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepWaitOutcome {
    /// `StepContinue` arrived (or step mode was disabled mid-wait).
    Continue,
    /// Graceful end requested during the wait.
    EndRequested,
    /// Cancel-class command during the wait.
    Cancelled,
    /// No release within the configured maximum wait; the run proceeds to
    /// the next iteration.
    Timeout,
}

/// Persistence-skip policy over a finished run's results.
///
/// Skip when all results are critical, when the last result is critical and
/// more than half of all results are, or when at least 80% are critical.
/// Critical means `Cancelled`, `ExecutionFailure`, or `Failed`.
pub fn should_persist_results(results: &[IterationResult]) -> bool {
    if results.is_empty() {
        return false;
    }
    let total = results.len();
    let critical = results.iter().filter(|r| r.status.is_critical()).count();
    if critical == total {
        return false;
    }
    let last_critical = results
        .last()
        .map(|r| r.status.is_critical())
        .unwrap_or(false);
    if last_critical && critical * 2 > total {
        return false;
    }
    if critical * 5 >= total * 4 {
        return false;
    }
    true
}

/// Drives one run of a strategy against an executor.
pub struct Orchestrator {
    state: Arc<ExecutionState>,
    status: Arc<StatusBus>,
    settings: Arc<EngineSettings>,
    run_id: Uuid,
    finalized: AtomicBool,
}

impl Orchestrator {
    /// Creates an orchestrator with its own fresh state and status bus.
    /// `reporter` of `None` leaves the bus as a no-op.
    ///
    /// # Panics
    ///
    /// With a reporter, the status consumer task is spawned immediately, so
    /// this must be called from within a Tokio runtime.
    pub fn new(settings: Arc<EngineSettings>, reporter: Option<Arc<dyn Reporter>>) -> Self {
        let status = match reporter {
            Some(reporter) => StatusBus::with_reporter(reporter, settings.event_queue_capacity),
            None => StatusBus::disabled(),
        };
        let status = Arc::new(status);
        let state = Arc::new(ExecutionState::new(settings.pause_poll));
        state.attach_status(Arc::clone(&status));
        Self {
            state,
            status,
            settings,
            run_id: Uuid::new_v4(),
            finalized: AtomicBool::new(false),
        }
    }

    /// Shared command bus for this run.
    pub fn state(&self) -> Arc<ExecutionState> {
        Arc::clone(&self.state)
    }

    /// Shared status bus for this run.
    pub fn status(&self) -> Arc<StatusBus> {
        Arc::clone(&self.status)
    }

    /// Unique identifier of this run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Builds the executor bound to this run's buses.
    pub fn executor(
        &self,
        device: Arc<dyn crate::executor::DeviceController>,
        content: Arc<dyn crate::executor::ContentRunner>,
    ) -> TestExecutor {
        TestExecutor::new(
            self.state(),
            self.status(),
            device,
            content,
            Arc::clone(&self.settings),
        )
    }

    /// Resets run state for a fresh run. Fails loudly when a command from a
    /// previous run is still mid-processing after a short grace wait.
    pub async fn prepare_for_run(
        &self,
        experiment_name: &str,
        total_iterations: usize,
        step_mode: bool,
    ) -> AppResult<()> {
        let clean = self
            .state
            .wait_until(Duration::from_secs(2), self.settings.pause_poll, |s| {
                s.processing_commands().is_empty()
            })
            .await;
        if !clean {
            let stuck: Vec<String> = self
                .state
                .processing_commands()
                .iter()
                .map(|c| c.name().to_string())
                .collect();
            return Err(FrameworkError::StaleCommand(stuck.join(", ")));
        }
        self.state.clear_commands();
        self.state
            .prepare_for_run(experiment_name, total_iterations, step_mode);
        self.finalized.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Runs the strategy to completion, cancellation, or failure. Never
    /// panics or errors out of the loop: a preparation failure is surfaced as
    /// a terminal `error` event and an empty result list.
    pub async fn run(
        &self,
        strategy: &Strategy,
        executor: &TestExecutor,
        mut cfg: TestConfig,
        step_mode: bool,
    ) -> Vec<IterationResult> {
        let total = strategy.total_count();
        let mut results: Vec<IterationResult> = Vec::with_capacity(total);

        if let Err(err) = self
            .prepare_for_run(&cfg.test_name, total, step_mode)
            .await
        {
            log::error!("run preparation failed: {err}");
            self.finalize(RunReason::Error, &results);
            return results;
        }

        self.status.update_context(ContextUpdate {
            experiment_name: Some(cfg.test_name.clone()),
            strategy: Some(strategy.descriptor()),
            current_iteration: Some(0),
            total_iterations: Some(total),
        });
        self.status.send(
            StatusKind::ExperimentStart,
            serde_json::json!({
                "run_id": self.run_id.to_string(),
                "total_iterations": total,
            }),
        );
        log::info!(
            "run {} started: {} over {total} iterations",
            self.run_id,
            strategy.descriptor()
        );

        let mut reason = RunReason::Completed;
        for index in 0..total {
            let iteration = index + 1;
            self.state.set_iteration(iteration);
            self.status.update_context(ContextUpdate {
                current_iteration: Some(iteration),
                ..ContextUpdate::default()
            });

            match self.state.poll().await {
                CheckResult::Cancelled => {
                    self.ack_cancel_class("run aborted before iteration");
                    reason = RunReason::Cancelled;
                    break;
                }
                CheckResult::EndRequested => {
                    self.state
                        .acknowledge(Command::EndExperiment, "ended before next iteration");
                    reason = RunReason::EndedByCommand;
                    break;
                }
                _ => {}
            }

            strategy.apply(&mut cfg, index);
            let result = executor.run_one(&cfg, index).await;
            let status = result.status;
            apply_reset_policy(&mut cfg, status);
            results.push(result);

            let stats = RunStatistics::from_results(&results, total);
            // Safe to index: pushed just above.
            let last = &results[results.len() - 1];
            self.status.send(
                StatusKind::IterationComplete,
                serde_json::json!({
                    "iteration": iteration,
                    "status": status,
                    "scratchpad": last.scratchpad,
                    "seed": last.seed,
                    "progress_percent": 100.0,
                    "statistics": stats,
                }),
            );
            self.status.send(
                StatusKind::StrategyProgress,
                serde_json::json!({
                    "completed": stats.completed,
                    "total": total,
                    "statistics": stats,
                }),
            );

            if status.aborts_run() {
                if status == IterationStatus::Cancelled {
                    self.ack_cancel_class("run cancelled during iteration");
                    reason = RunReason::Cancelled;
                } else {
                    reason = RunReason::ExecutionFailure;
                }
                break;
            }

            if self.state.end_requested() {
                self.state
                    .acknowledge(Command::EndExperiment, "ended after iteration");
                reason = RunReason::EndedByCommand;
                break;
            }

            let step_active = self.state.snapshot().step_mode_enabled;
            if step_active && iteration < total {
                match self.wait_for_step(iteration).await {
                    StepWaitOutcome::Continue => {}
                    StepWaitOutcome::EndRequested => {
                        self.state.check_now();
                        self.state
                            .acknowledge(Command::EndExperiment, "ended during step wait");
                        reason = RunReason::EndedByCommand;
                        break;
                    }
                    StepWaitOutcome::Cancelled => {
                        self.state.check_now();
                        self.ack_cancel_class("cancelled during step wait");
                        reason = RunReason::Cancelled;
                        break;
                    }
                    StepWaitOutcome::Timeout => {
                        // An expired step wait never ends the run; the next
                        // iteration runs as if StepContinue had arrived.
                        log::warn!(
                            "step wait expired after {:?}, continuing",
                            self.settings.step_wait_max
                        );
                    }
                }
            }

            if !self.settings.iteration_delay.is_zero() && iteration < total {
                // Spacing between iterations stays cancellable.
                let interrupted = self
                    .state
                    .wait_until(self.settings.iteration_delay, self.settings.pause_poll, |s| {
                        s.should_stop()
                    })
                    .await;
                if interrupted {
                    continue; // next poll observes and acknowledges the cancel
                }
            }
        }

        self.finalize(reason, &results);
        results
    }

    /// Parks the worker until `StepContinue`, cancellation, graceful end,
    /// step-mode disable, or timeout. Re-logs periodically while waiting.
    pub async fn wait_for_step(&self, iteration: usize) -> StepWaitOutcome {
        self.state.set_waiting_for_step(true);
        self.status.send(
            StatusKind::WaitingForStep,
            serde_json::json!({ "iteration": iteration }),
        );
        log::info!("iteration {iteration} complete, waiting for StepContinue");

        let started = tokio::time::Instant::now();
        let mut last_log = started;
        let outcome = loop {
            if self.state.should_stop() {
                break StepWaitOutcome::Cancelled;
            }
            if self.state.end_pending() {
                break StepWaitOutcome::EndRequested;
            }
            if self.state.take_step_continue() {
                break StepWaitOutcome::Continue;
            }
            if !self.state.snapshot().step_mode_enabled {
                log::info!("step mode disabled mid-wait, continuing");
                break StepWaitOutcome::Continue;
            }
            let elapsed = started.elapsed();
            if elapsed >= self.settings.step_wait_max {
                break StepWaitOutcome::Timeout;
            }
            if last_log.elapsed() >= self.settings.step_wait_relog {
                log::info!(
                    "still waiting for StepContinue ({}s elapsed)",
                    elapsed.as_secs()
                );
                last_log = tokio::time::Instant::now();
            }
            let chunk = (self.settings.step_wait_max - elapsed)
                .min(self.settings.step_wait_relog)
                .min(Duration::from_millis(500));
            self.state
                .wait_until(chunk, self.settings.pause_poll, |s| {
                    s.step_continue_pending()
                        || s.should_stop()
                        || s.end_pending()
                        || !s.snapshot().step_mode_enabled
                })
                .await;
        };
        self.state.set_waiting_for_step(false);
        outcome
    }

    /// Marks the run inactive and emits the single terminal event. Idempotent:
    /// a second call is a no-op.
    pub fn finalize(&self, reason: RunReason, results: &[IterationResult]) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.finalize_run();
        let total = self.state.snapshot().total_iterations;
        let stats = RunStatistics::from_results(results, total);
        let persist = should_persist_results(results);
        self.status.send(
            StatusKind::ExperimentEnd,
            serde_json::json!({
                "run_id": self.run_id.to_string(),
                "reason": reason.as_str(),
                "statistics": stats,
                "persist_results": persist,
            }),
        );
        log::info!(
            "run {} finalized: {} ({} of {} iterations, {:.1}% pass, persist={persist})",
            self.run_id,
            reason.as_str(),
            stats.completed,
            stats.total_iterations,
            stats.pass_rate_percent
        );
    }

    fn ack_cancel_class(&self, detail: &str) {
        if !self.state.acknowledge(Command::Cancel, detail) {
            self.state.acknowledge(Command::EmergencyStop, detail);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(index: usize, status: IterationStatus) -> IterationResult {
        IterationResult {
            status,
            iteration_index: index,
            scratchpad: String::new(),
            seed: String::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            artifact_dir: None,
            error: None,
        }
    }

    fn results_of(statuses: &[IterationStatus]) -> Vec<IterationResult> {
        statuses
            .iter()
            .enumerate()
            .map(|(i, s)| result(i + 1, *s))
            .collect()
    }

    #[test]
    fn test_skip_when_all_critical() {
        let results = results_of(&[IterationStatus::Cancelled; 4]);
        assert!(!should_persist_results(&results));
    }

    #[test]
    fn test_skip_at_ninety_percent_critical() {
        let mut statuses = vec![IterationStatus::ExecutionFailure; 9];
        statuses.insert(0, IterationStatus::Pass);
        assert!(!should_persist_results(&results_of(&statuses)));
    }

    #[test]
    fn test_persist_with_minority_critical_and_pass_last() {
        let statuses = [
            IterationStatus::Failed,
            IterationStatus::Failed,
            IterationStatus::Pass,
            IterationStatus::Failed,
            IterationStatus::Pass,
            IterationStatus::Fail,
            IterationStatus::Failed,
            IterationStatus::Pass,
            IterationStatus::Fail,
            IterationStatus::Pass,
        ];
        // Exactly 4 of 10 critical, last is Pass.
        assert!(should_persist_results(&results_of(&statuses)));
    }

    #[test]
    fn test_skip_when_last_critical_and_majority_critical() {
        let statuses = [
            IterationStatus::Pass,
            IterationStatus::Failed,
            IterationStatus::Failed,
            IterationStatus::Pass,
            IterationStatus::Failed,
            IterationStatus::Cancelled,
        ];
        // 4 of 6 critical (> 50%), last critical, but below the 80% bar.
        assert!(!should_persist_results(&results_of(&statuses)));
    }

    #[test]
    fn test_plain_fails_are_not_critical() {
        let statuses = [IterationStatus::Fail; 10];
        assert!(should_persist_results(&results_of(&statuses)));
    }

    #[test]
    fn test_statistics_counts() {
        let stats = RunStatistics::from_results(
            &results_of(&[
                IterationStatus::Pass,
                IterationStatus::Fail,
                IterationStatus::Pass,
                IterationStatus::Cancelled,
            ]),
            10,
        );
        assert_eq!(stats.total_iterations, 10);
        assert_eq!(stats.completed, 4);
        assert_eq!(stats.passed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.pass_rate_percent, 50.0);
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent() {
        let settings = Arc::new(EngineSettings::default());
        let orchestrator = Orchestrator::new(settings, None);
        orchestrator.prepare_for_run("t", 1, false).await.unwrap();
        orchestrator.finalize(RunReason::Completed, &[]);
        let snap_after_first = orchestrator.state().snapshot();
        orchestrator.finalize(RunReason::Cancelled, &[]);
        assert_eq!(orchestrator.state().snapshot(), snap_after_first);
        assert!(!snap_after_first.active);
    }
}
