//! Single-iteration execution lifecycle.
//!
//! [`TestExecutor`] runs exactly one iteration at a time against the external
//! [`DeviceController`] and [`ContentRunner`] collaborators, consulting the
//! command bus at fixed checkpoints. `Cancelled` aborts the iteration at the
//! checkpoint; `EndRequested` lets the iteration finish and leaves the stop
//! decision to the orchestrator.
//!
//! Failures never propagate out of [`TestExecutor::run_one`]; every attempt
//! produces exactly one [`IterationResult`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{EngineSettings, TestConfig};
use crate::state::{CheckResult, ExecutionState};
use crate::status::{StatusBus, StatusKind};

/// Terminal status of one iteration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IterationStatus {
    /// Content ran and matched its pass criterion.
    Pass,
    /// Content ran and reported a functional failure.
    Fail,
    /// Aborted by a cancel-class command.
    Cancelled,
    /// An unexpected error occurred after boot; recorded, run continues.
    Failed,
    /// The device could not be brought up; the strategy loop stops.
    ExecutionFailure,
}

impl IterationStatus {
    /// Critical statuses drive the persistence-skip policy and abort the
    /// strategy loop for `Cancelled`/`ExecutionFailure`.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            IterationStatus::Cancelled | IterationStatus::ExecutionFailure | IterationStatus::Failed
        )
    }

    /// Statuses after which no further iteration may run.
    pub fn aborts_run(self) -> bool {
        matches!(
            self,
            IterationStatus::Cancelled | IterationStatus::ExecutionFailure
        )
    }
}

impl std::fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IterationStatus::Pass => "Pass",
            IterationStatus::Fail => "Fail",
            IterationStatus::Cancelled => "Cancelled",
            IterationStatus::Failed => "Failed",
            IterationStatus::ExecutionFailure => "ExecutionFailure",
        };
        f.write_str(name)
    }
}

/// Immutable record of one iteration attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationResult {
    /// Terminal status.
    pub status: IterationStatus,
    /// 1-based iteration index.
    pub iteration_index: usize,
    /// Scratchpad code reported by the content, if any.
    pub scratchpad: String,
    /// Seed reported by the content, if any.
    pub seed: String,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished.
    pub finished_at: DateTime<Utc>,
    /// Per-iteration artifact directory, when preparation got that far.
    pub artifact_dir: Option<PathBuf>,
    /// Error detail for non-Pass statuses.
    pub error: Option<String>,
}

/// Output of one content execution.
#[derive(Debug, Clone, Default)]
pub struct ContentOutcome {
    /// Matched pass string, empty when absent.
    pub pass_string: String,
    /// Matched fail string, empty when absent.
    pub fail_string: String,
    /// Scratchpad code extracted from the run.
    pub scratchpad: String,
    /// Seed extracted from the run.
    pub seed: String,
}

/// External collaborator that physically boots the device under test.
#[async_trait]
pub trait DeviceController: Send + Sync {
    /// Boots with the given config. `Ok(false)` means the boot sequence ran
    /// but the device never reported ready.
    async fn boot(&self, cfg: &TestConfig) -> anyhow::Result<bool>;

    /// Full power-cycle recovery used for transient-class boot failures.
    async fn power_cycle(&self) -> anyhow::Result<()>;

    /// Standard reboot used for all other recoverable boot failures.
    async fn reboot(&self) -> anyhow::Result<()>;
}

/// External collaborator that executes the test content and scripts.
#[async_trait]
pub trait ContentRunner: Send + Sync {
    /// Runs the content for this iteration.
    async fn run_content(&self, cfg: &TestConfig) -> anyhow::Result<ContentOutcome>;

    /// Runs a pre/post script by name.
    async fn run_script(&self, script: &str, cfg: &TestConfig) -> anyhow::Result<()>;
}

/// Recovery path chosen for a failed boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootRecovery {
    PowerCycle,
    Reboot,
    Fatal,
}

/// Runs single iterations with checkpointed cancellation and one boot retry.
pub struct TestExecutor {
    state: Arc<ExecutionState>,
    status: Arc<StatusBus>,
    device: Arc<dyn DeviceController>,
    content: Arc<dyn ContentRunner>,
    settings: Arc<EngineSettings>,
    transient_patterns: RegexSet,
    malformed_patterns: RegexSet,
}

enum Gate {
    Proceed,
    Abort(IterationStatus, String),
}

impl TestExecutor {
    /// Builds an executor over the shared bus and collaborators.
    pub fn new(
        state: Arc<ExecutionState>,
        status: Arc<StatusBus>,
        device: Arc<dyn DeviceController>,
        content: Arc<dyn ContentRunner>,
        settings: Arc<EngineSettings>,
    ) -> Self {
        let transient_patterns = case_insensitive_set(&settings.transient_boot_signatures);
        let malformed_patterns = case_insensitive_set(&settings.malformed_boot_signatures);
        Self {
            state,
            status,
            device,
            content,
            settings,
            transient_patterns,
            malformed_patterns,
        }
    }

    /// Executes one iteration to a result. `index` is 0-based; results carry
    /// the 1-based index.
    pub async fn run_one(&self, cfg: &TestConfig, index: usize) -> IterationResult {
        let started_at = Utc::now();
        let iteration = index + 1;
        let result = self.run_inner(cfg, iteration, started_at).await;
        // The retry window never survives an iteration, whatever the outcome.
        self.state.set_in_boot_retry(false);
        result
    }

    async fn run_inner(
        &self,
        cfg: &TestConfig,
        iteration: usize,
        started_at: DateTime<Utc>,
    ) -> IterationResult {
        let mut artifact_dir = None;

        self.status.send_progress(StatusKind::IterationStart, 0.0);
        if let Gate::Abort(status, detail) = self.gate().await {
            return self.result(status, iteration, started_at, artifact_dir, Some(detail));
        }

        // Environment preparation: per-iteration artifact directory.
        match self.prepare_artifacts(cfg, iteration).await {
            Ok(dir) => artifact_dir = Some(dir),
            Err(err) => {
                log::error!("iteration {iteration}: artifact preparation failed: {err:#}");
                return self.result(
                    IterationStatus::Failed,
                    iteration,
                    started_at,
                    None,
                    Some(format!("artifact preparation failed: {err:#}")),
                );
            }
        }
        self.status
            .send_progress(StatusKind::IterationProgress, 0.05);

        if let Gate::Abort(status, detail) = self.gate().await {
            return self.result(status, iteration, started_at, artifact_dir, Some(detail));
        }
        self.status
            .send_progress(StatusKind::IterationProgress, 0.10);

        if let Err(detail) = self.boot_with_retry(cfg, iteration).await {
            let status = if detail.cancelled {
                IterationStatus::Cancelled
            } else if detail.fatal_no_retry {
                IterationStatus::Failed
            } else {
                IterationStatus::ExecutionFailure
            };
            return self.result(status, iteration, started_at, artifact_dir, Some(detail.message));
        }
        self.status
            .send_progress(StatusKind::IterationProgress, 0.35);

        if let Gate::Abort(status, detail) = self.gate().await {
            return self.result(status, iteration, started_at, artifact_dir, Some(detail));
        }

        // Everything past a successful boot degrades to Failed, never aborts
        // the whole run.
        if let Some(script) = &cfg.pre_script {
            if let Err(err) = self.content.run_script(script, cfg).await {
                return self.result(
                    IterationStatus::Failed,
                    iteration,
                    started_at,
                    artifact_dir,
                    Some(format!("pre-script failed: {err:#}")),
                );
            }
        }
        self.status
            .send_progress(StatusKind::IterationProgress, 0.50);

        let outcome = match self.content.run_content(cfg).await {
            Ok(outcome) => outcome,
            Err(err) => {
                return self.result(
                    IterationStatus::Failed,
                    iteration,
                    started_at,
                    artifact_dir,
                    Some(format!("content execution failed: {err:#}")),
                );
            }
        };
        self.status
            .send_progress(StatusKind::IterationProgress, 0.75);

        if let Some(script) = &cfg.post_script {
            if let Err(err) = self.content.run_script(script, cfg).await {
                return self.result(
                    IterationStatus::Failed,
                    iteration,
                    started_at,
                    artifact_dir,
                    Some(format!("post-script failed: {err:#}")),
                );
            }
        }
        self.status
            .send_progress(StatusKind::IterationProgress, 0.90);

        if let Gate::Abort(status, detail) = self.gate().await {
            return self.result(status, iteration, started_at, artifact_dir, Some(detail));
        }

        let status = classify_outcome(&outcome);
        IterationResult {
            status,
            iteration_index: iteration,
            scratchpad: outcome.scratchpad,
            seed: outcome.seed,
            started_at,
            finished_at: Utc::now(),
            artifact_dir,
            error: if status == IterationStatus::Pass {
                None
            } else {
                Some(format!("content reported '{}'", outcome.fail_string))
            },
        }
    }

    /// Checkpoint consultation. `EndRequested` lets the current iteration run
    /// to completion; the orchestrator stops the loop afterwards.
    async fn gate(&self) -> Gate {
        match self.state.poll().await {
            CheckResult::Continue | CheckResult::EndRequested | CheckResult::Paused => Gate::Proceed,
            CheckResult::Cancelled => Gate::Abort(
                IterationStatus::Cancelled,
                "cancelled at checkpoint".to_string(),
            ),
            CheckResult::Error(err) => Gate::Abort(IterationStatus::Failed, err),
        }
    }

    async fn prepare_artifacts(&self, cfg: &TestConfig, iteration: usize) -> anyhow::Result<PathBuf> {
        let dir = cfg
            .artifact_root
            .join(&cfg.test_name)
            .join(format!("iteration_{iteration}"));
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Boots the device, retrying exactly once after a recoverable failure.
    /// The retry waits the configured settle time with the boot-retry flag
    /// set, so the watchdog never mistakes the settle window for a dead
    /// worker.
    async fn boot_with_retry(&self, cfg: &TestConfig, iteration: usize) -> Result<(), BootError> {
        match self.try_boot(cfg).await {
            Ok(()) => return Ok(()),
            Err(first) => {
                let recovery = self.classify_boot_error(&first);
                log::warn!("iteration {iteration}: boot failed ({first:#}), recovery {recovery:?}");
                match recovery {
                    BootRecovery::Fatal => {
                        return Err(BootError {
                            message: format!("malformed boot command: {first:#}"),
                            fatal_no_retry: true,
                            cancelled: false,
                        });
                    }
                    BootRecovery::PowerCycle | BootRecovery::Reboot => {
                        self.state.set_in_boot_retry(true);
                        tokio::time::sleep(self.settings.boot_settle).await;
                        if self.state.should_stop() {
                            self.state.set_in_boot_retry(false);
                            return Err(BootError {
                                message: "cancelled during boot recovery".to_string(),
                                fatal_no_retry: false,
                                cancelled: true,
                            });
                        }
                        let recovery_result = match recovery {
                            BootRecovery::PowerCycle => self.device.power_cycle().await,
                            _ => self.device.reboot().await,
                        };
                        if let Err(err) = recovery_result {
                            log::error!("iteration {iteration}: recovery path failed: {err:#}");
                        }
                        let second = self.try_boot(cfg).await;
                        self.state.set_in_boot_retry(false);
                        if let Err(err) = second {
                            return Err(BootError {
                                message: format!("boot failed after retry: {err:#}"),
                                fatal_no_retry: false,
                                cancelled: false,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn try_boot(&self, cfg: &TestConfig) -> anyhow::Result<()> {
        let ready = self.device.boot(cfg).await?;
        if ready {
            Ok(())
        } else {
            Err(anyhow::anyhow!("device did not report ready"))
        }
    }

    fn classify_boot_error(&self, err: &anyhow::Error) -> BootRecovery {
        let text = format!("{err:#}").to_lowercase();
        if self.malformed_patterns.is_match(&text) {
            BootRecovery::Fatal
        } else if self.transient_patterns.is_match(&text) {
            BootRecovery::PowerCycle
        } else {
            BootRecovery::Reboot
        }
    }

    fn result(
        &self,
        status: IterationStatus,
        iteration: usize,
        started_at: DateTime<Utc>,
        artifact_dir: Option<PathBuf>,
        error: Option<String>,
    ) -> IterationResult {
        if status != IterationStatus::Pass {
            log::info!("iteration {iteration} ended {status}: {:?}", error);
        }
        IterationResult {
            status,
            iteration_index: iteration,
            scratchpad: String::new(),
            seed: String::new(),
            started_at,
            finished_at: Utc::now(),
            artifact_dir,
            error,
        }
    }
}

struct BootError {
    message: String,
    fatal_no_retry: bool,
    cancelled: bool,
}

/// Pass iff a pass string matched and no fail string did.
fn classify_outcome(outcome: &ContentOutcome) -> IterationStatus {
    if !outcome.pass_string.is_empty() && outcome.fail_string.is_empty() {
        IterationStatus::Pass
    } else {
        IterationStatus::Fail
    }
}

fn case_insensitive_set(signatures: &[String]) -> RegexSet {
    let escaped: Vec<String> = signatures
        .iter()
        .map(|s| regex::escape(&s.to_lowercase()))
        .collect();
    // Escaped literals cannot fail to compile; an empty set matches nothing.
    RegexSet::new(&escaped).unwrap_or_else(|_| RegexSet::empty())
}
