//! End-to-end control-flow tests for the orchestrated run loop: cancellation,
//! graceful end, pause/resume, and bring-up failure abort.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bringup_runner::config::{EngineSettings, TestConfig};
use bringup_runner::executor::{
    ContentOutcome, ContentRunner, DeviceController, IterationStatus,
};
use bringup_runner::orchestrator::Orchestrator;
use bringup_runner::state::Command;
use bringup_runner::status::{Reporter, StatusEvent, StatusKind};
use bringup_runner::strategy::{Strategy, SweepAxis};

struct CollectingReporter {
    events: Mutex<Vec<StatusEvent>>,
}

impl CollectingReporter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(vec![]),
        })
    }

    fn terminal_reason(&self) -> Option<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.kind == StatusKind::ExperimentEnd)
            .and_then(|e| e.payload["reason"].as_str().map(str::to_string))
    }

    fn count(&self, kind: StatusKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

#[async_trait]
impl Reporter for CollectingReporter {
    async fn report(&self, event: StatusEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

struct ReliableDevice;

#[async_trait]
impl DeviceController for ReliableDevice {
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

struct FailingDevice;

#[async_trait]
impl DeviceController for FailingDevice {
    async fn boot(&self, _cfg: &TestConfig) -> anyhow::Result<bool> {
        Err(anyhow::anyhow!("pcode handshake lost"))
    }
    async fn power_cycle(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn reboot(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Content that takes a configurable time per iteration and records the
/// iterations it actually executed.
struct SlowContent {
    delay: Duration,
    executed: AtomicUsize,
}

#[async_trait]
impl ContentRunner for SlowContent {
    async fn run_content(&self, _cfg: &TestConfig) -> anyhow::Result<ContentOutcome> {
        tokio::time::sleep(self.delay).await;
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(ContentOutcome {
            pass_string: "PASS".into(),
            scratchpad: "0x0".into(),
            seed: "1".into(),
            ..ContentOutcome::default()
        })
    }
    async fn run_script(&self, _s: &str, _cfg: &TestConfig) -> anyhow::Result<()> {
        Ok(())
    }
}

fn fast_settings() -> Arc<EngineSettings> {
    Arc::new(EngineSettings {
        pause_poll: Duration::from_millis(10),
        boot_settle: Duration::from_millis(20),
        iteration_delay: Duration::ZERO,
        ..EngineSettings::default()
    })
}

fn test_cfg(name: &str) -> TestConfig {
    let dir = tempfile::tempdir().unwrap();
    TestConfig {
        test_name: name.into(),
        artifact_root: dir.into_path(),
        ..TestConfig::default()
    }
}

#[tokio::test]
async fn loop_produces_exactly_n_results_in_order() {
    let reporter = CollectingReporter::new();
    let orchestrator = Orchestrator::new(fast_settings(), Some(reporter.clone()));
    let executor = orchestrator.executor(
        Arc::new(ReliableDevice),
        Arc::new(SlowContent {
            delay: Duration::from_millis(1),
            executed: AtomicUsize::new(0),
        }),
    );
    let strategy = Strategy::fixed_loop(4).unwrap();
    let results = orchestrator
        .run(&strategy, &executor, test_cfg("loop4"), false)
        .await;

    assert_eq!(results.len(), 4);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.iteration_index, i + 1);
        assert_eq!(result.status, IterationStatus::Pass);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(reporter.terminal_reason().as_deref(), Some("completed"));
    assert_eq!(reporter.count(StatusKind::ExperimentEnd), 1);
    assert_eq!(reporter.count(StatusKind::IterationComplete), 4);
}

#[tokio::test]
async fn cancel_stops_before_next_iteration() {
    let reporter = CollectingReporter::new();
    let orchestrator = Arc::new(Orchestrator::new(fast_settings(), Some(reporter.clone())));
    let state = orchestrator.state();
    let executor = orchestrator.executor(
        Arc::new(ReliableDevice),
        Arc::new(SlowContent {
            delay: Duration::from_millis(80),
            executed: AtomicUsize::new(0),
        }),
    );
    let strategy = Strategy::fixed_loop(10).unwrap();
    let worker = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            orchestrator
                .run(&strategy, &executor, test_cfg("cancel"), false)
                .await
        })
    };

    // Land the cancel inside iteration 1's content execution.
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(state.post(Command::Cancel, None));

    let results = tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap();
    // The cancelled iteration is recorded; nothing after it ever runs.
    assert!(results.len() <= 1);
    assert!(results
        .iter()
        .all(|r| r.status == IterationStatus::Cancelled));
    assert!(results.iter().all(|r| r.iteration_index == 1));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(reporter.terminal_reason().as_deref(), Some("cancelled"));
    assert!(state.snapshot().cancelled);
}

#[tokio::test]
async fn end_experiment_completes_current_iteration_then_stops() {
    let reporter = CollectingReporter::new();
    let orchestrator = Arc::new(Orchestrator::new(fast_settings(), Some(reporter.clone())));
    let state = orchestrator.state();
    let executor = orchestrator.executor(
        Arc::new(ReliableDevice),
        Arc::new(SlowContent {
            delay: Duration::from_millis(80),
            executed: AtomicUsize::new(0),
        }),
    );
    let strategy = Strategy::fixed_loop(10).unwrap();
    let worker = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            orchestrator
                .run(&strategy, &executor, test_cfg("end"), false)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(state.post(Command::EndExperiment, None));

    let results = tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap();
    // The in-flight iteration finished normally before the run stopped.
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, IterationStatus::Pass);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        reporter.terminal_reason().as_deref(),
        Some("ended_by_command")
    );
}

#[tokio::test]
async fn pause_then_resume_keeps_indices_contiguous_and_adds_wall_time() {
    let orchestrator = Arc::new(Orchestrator::new(fast_settings(), None));
    let state = orchestrator.state();
    let executor = orchestrator.executor(
        Arc::new(ReliableDevice),
        Arc::new(SlowContent {
            delay: Duration::from_millis(20),
            executed: AtomicUsize::new(0),
        }),
    );
    let strategy = Strategy::fixed_loop(3).unwrap();
    let started = std::time::Instant::now();
    let worker = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            orchestrator
                .run(&strategy, &executor, test_cfg("pause"), false)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(state.post(Command::Pause, None));
    let pause_span = Duration::from_millis(300);
    tokio::time::sleep(pause_span).await;
    assert!(state.post(Command::Resume, None));

    let results = tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap();
    let elapsed = started.elapsed();
    assert_eq!(results.len(), 3);
    let indices: Vec<usize> = results.iter().map(|r| r.iteration_index).collect();
    assert_eq!(indices, vec![1, 2, 3]);
    assert!(
        elapsed >= pause_span,
        "run finished in {elapsed:?}, expected at least {pause_span:?}"
    );
}

#[tokio::test]
async fn step_wait_timeout_advances_to_next_iteration() {
    let reporter = CollectingReporter::new();
    let settings = Arc::new(EngineSettings {
        pause_poll: Duration::from_millis(10),
        boot_settle: Duration::from_millis(20),
        step_wait_max: Duration::from_millis(150),
        step_wait_relog: Duration::from_millis(75),
        ..EngineSettings::default()
    });
    let orchestrator = Orchestrator::new(settings, Some(reporter.clone()));
    let executor = orchestrator.executor(
        Arc::new(ReliableDevice),
        Arc::new(SlowContent {
            delay: Duration::from_millis(1),
            executed: AtomicUsize::new(0),
        }),
    );
    let strategy = Strategy::fixed_loop(3).unwrap();

    // Step mode with no StepContinue ever posted: each wait expires and the
    // run still executes every iteration.
    let results = orchestrator
        .run(&strategy, &executor, test_cfg("steptimeout"), true)
        .await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.status == IterationStatus::Pass));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(reporter.terminal_reason().as_deref(), Some("completed"));
}

#[tokio::test]
async fn boot_failure_aborts_remaining_sweep_iterations() {
    let reporter = CollectingReporter::new();
    let orchestrator = Orchestrator::new(fast_settings(), Some(reporter.clone()));
    let executor = orchestrator.executor(
        Arc::new(FailingDevice),
        Arc::new(SlowContent {
            delay: Duration::from_millis(1),
            executed: AtomicUsize::new(0),
        }),
    );
    let strategy = Strategy::sweep(SweepAxis::Frequency {
        start: 16,
        end: 40,
        step: 4,
    })
    .unwrap();
    assert_eq!(strategy.total_count(), 7);

    let results = orchestrator
        .run(&strategy, &executor, test_cfg("bootfail"), false)
        .await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, IterationStatus::ExecutionFailure);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        reporter.terminal_reason().as_deref(),
        Some("execution_failure")
    );
}
