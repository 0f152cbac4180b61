//! End-to-end tests for the step-by-step API: event pulls, step releases,
//! mid-run cancellation, and watchdog-detected worker death.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use bringup_runner::config::{EngineSettings, TestConfig};
use bringup_runner::controller::{StepController, StepEvent, WaitOutcome};
use bringup_runner::executor::{ContentOutcome, ContentRunner, DeviceController};
use bringup_runner::orchestrator::RunReason;
use bringup_runner::strategy::Strategy;

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

struct CrashingDevice;

#[async_trait]
impl DeviceController for CrashingDevice {
    async fn boot(&self, _cfg: &TestConfig) -> anyhow::Result<bool> {
        panic!("simulated driver crash");
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
            scratchpad: "0xA5".into(),
            seed: "3".into(),
            ..ContentOutcome::default()
        })
    }
    async fn run_script(&self, _s: &str, _cfg: &TestConfig) -> anyhow::Result<()> {
        Ok(())
    }
}

fn step_settings() -> Arc<EngineSettings> {
    Arc::new(EngineSettings {
        pause_poll: Duration::from_millis(10),
        step_wait_max: Duration::from_secs(10),
        step_wait_relog: Duration::from_secs(5),
        watchdog_period: Duration::from_millis(20),
        watchdog_dead_checks: 3,
        watchdog_dead_checks_active: 5,
        cleanup_join: Duration::from_secs(2),
        ack_wait: Duration::from_secs(2),
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
async fn full_step_run_delivers_every_iteration_and_terminal() {
    let controller = StepController::new(step_settings());
    controller
        .start_step_experiment(
            test_cfg("step3"),
            Strategy::fixed_loop(3).unwrap(),
            Arc::new(InstantDevice),
            Arc::new(InstantContent),
            None,
        )
        .await
        .unwrap();

    let mut iterations = vec![];
    loop {
        match controller.wait_for_next_event(Duration::from_secs(5)).await {
            WaitOutcome::Event(StepEvent::Iteration(event)) => {
                iterations.push(event.context.current_iteration);
                // Release the worker once it parks.
                let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
                while controller
                    .execution_state()
                    .map(|s| s.active && !s.waiting_for_step)
                    .unwrap_or(false)
                {
                    assert!(tokio::time::Instant::now() < deadline);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                controller.step_continue();
            }
            WaitOutcome::Event(StepEvent::Terminal(event)) => {
                assert_eq!(event.payload["reason"], "completed");
                break;
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(iterations, vec![1, 2, 3]);
    controller.force_cleanup(RunReason::Completed).await.unwrap();
}

#[tokio::test]
async fn cancel_during_step_wait_ends_run_with_cancelled_reason() {
    let controller = StepController::new(step_settings());
    controller
        .start_step_experiment(
            test_cfg("stepcancel"),
            Strategy::fixed_loop(5).unwrap(),
            Arc::new(InstantDevice),
            Arc::new(InstantContent),
            None,
        )
        .await
        .unwrap();

    let first = controller.wait_for_next_event(Duration::from_secs(5)).await;
    assert!(matches!(
        first,
        WaitOutcome::Event(StepEvent::Iteration(_))
    ));

    // Wait until the worker parks, then cancel instead of continuing.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !controller
        .execution_state()
        .map(|s| s.waiting_for_step)
        .unwrap_or(false)
    {
        assert!(tokio::time::Instant::now() < deadline, "worker never parked");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(controller.cancel());

    let terminal = controller.wait_for_next_event(Duration::from_secs(5)).await;
    let WaitOutcome::Event(StepEvent::Terminal(event)) = terminal else {
        panic!("expected terminal event, got {terminal:?}");
    };
    assert_eq!(event.payload["reason"], "cancelled");
    controller.force_cleanup(RunReason::Cancelled).await.unwrap();
}

#[tokio::test]
async fn watchdog_detects_dead_worker_and_cleans_up() {
    let controller = StepController::new(step_settings());
    controller
        .start_step_experiment(
            test_cfg("crash"),
            Strategy::fixed_loop(2).unwrap(),
            Arc::new(CrashingDevice),
            Arc::new(InstantContent),
            None,
        )
        .await
        .unwrap();

    // Worker panics inside the first boot; the state still claims active, so
    // the watchdog needs 5 consecutive dead checks at 20ms each.
    let mut saw_death = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match controller
            .wait_for_next_event(Duration::from_millis(200))
            .await
        {
            WaitOutcome::Event(StepEvent::WorkerDied) => {
                saw_death = true;
                break;
            }
            WaitOutcome::CleanupRequested => {
                // Cleanup already drained the queue; the flag is the signal.
                saw_death = true;
                break;
            }
            WaitOutcome::Timeout => continue,
            WaitOutcome::Event(other) => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(saw_death, "worker death never surfaced");

    // Cleanup completes on its own and the controller frees the run slot.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while controller.execution_state().is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "cleanup never released the run"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(controller.cleanup_requested());
}
