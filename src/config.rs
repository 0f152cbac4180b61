//! Run parameters and engine settings.
//!
//! Two configuration layers live here:
//!
//! - [`TestConfig`]: the per-run parameter block (voltage, frequency, mask,
//!   content selection, reset policy). Owned by the orchestrator for the
//!   duration of one run; strategies mutate only the axis fields they own
//!   between iterations, and the executor treats it as read-only within one
//!   iteration.
//! - [`EngineSettings`]: timing and sizing knobs for the engine itself, with
//!   hard defaults. Loadable from an optional TOML file layered with
//!   `BRINGUP_`-prefixed environment variables via Figment.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AppResult;

/// Per-run test parameter block.
///
/// Axis fields (`voltage_v`, `frequency_mhz`) are the only fields a sweep or
/// shmoo strategy writes between iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    /// Human-readable experiment name, used in event context and artifacts.
    pub test_name: String,
    /// Content (test payload) identifier handed to the content runner.
    pub content: String,
    /// Core voltage in volts.
    pub voltage_v: f64,
    /// Core frequency in MHz.
    pub frequency_mhz: i64,
    /// Optional lane/core mask string, opaque to the engine.
    pub mask: Option<String>,
    /// Whether the device is rebooted before the next iteration.
    pub reset: bool,
    /// Reset policy applied after a passing iteration.
    pub reset_on_pass: bool,
    /// Optional script run before the content.
    pub pre_script: Option<String>,
    /// Optional script run after the content.
    pub post_script: Option<String>,
    /// Root directory for per-iteration artifacts (logs, content copies).
    pub artifact_root: PathBuf,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            test_name: "unnamed".to_string(),
            content: "default".to_string(),
            voltage_v: 0.75,
            frequency_mhz: 1600,
            mask: None,
            reset: true,
            reset_on_pass: false,
            pre_script: None,
            post_script: None,
            artifact_root: PathBuf::from("bringup_artifacts"),
        }
    }
}

/// Engine timing and sizing knobs.
///
/// Defaults reproduce the production timings; every wait in the engine is
/// bounded by one of these values. Durations deserialize from humantime
/// strings (`"100ms"`, `"2m"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Poll period while blocked inside an active pause.
    #[serde(with = "humantime_serde")]
    pub pause_poll: Duration,
    /// Maximum time the worker waits for `StepContinue` after an iteration.
    #[serde(with = "humantime_serde")]
    pub step_wait_max: Duration,
    /// Interval at which the step wait re-logs that it is still waiting.
    #[serde(with = "humantime_serde")]
    pub step_wait_relog: Duration,
    /// Settle time before the single boot retry.
    #[serde(with = "humantime_serde")]
    pub boot_settle: Duration,
    /// Watchdog liveness check period.
    #[serde(with = "humantime_serde")]
    pub watchdog_period: Duration,
    /// Consecutive dead observations required when the run state reads inactive.
    pub watchdog_dead_checks: u32,
    /// Consecutive dead observations required while the state still claims active.
    pub watchdog_dead_checks_active: u32,
    /// Default maximum wait for a command acknowledgment.
    #[serde(with = "humantime_serde")]
    pub ack_wait: Duration,
    /// Bounded join on the worker during force cleanup.
    #[serde(with = "humantime_serde")]
    pub cleanup_join: Duration,
    /// Status event queue capacity; sends beyond this are dropped, never blocked on.
    pub event_queue_capacity: usize,
    /// Optional spacing between iterations.
    #[serde(with = "humantime_serde")]
    pub iteration_delay: Duration,
    /// Boot-error signatures selecting the power-cycle recovery path.
    pub transient_boot_signatures: Vec<String>,
    /// Boot-error signatures that are fatal with no retry.
    pub malformed_boot_signatures: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pause_poll: Duration::from_millis(100),
            step_wait_max: Duration::from_secs(60),
            step_wait_relog: Duration::from_secs(30),
            boot_settle: Duration::from_secs(120),
            watchdog_period: Duration::from_secs(15),
            watchdog_dead_checks: 5,
            watchdog_dead_checks_active: 20,
            ack_wait: Duration::from_secs(15),
            cleanup_join: Duration::from_secs(10),
            event_queue_capacity: 256,
            iteration_delay: Duration::ZERO,
            transient_boot_signatures: vec!["rsp 10".to_string(), "regaccfail".to_string()],
            malformed_boot_signatures: vec!["malformed boot command".to_string()],
        }
    }
}

impl EngineSettings {
    /// Loads settings from defaults, an optional TOML file, and `BRINGUP_` env vars.
    ///
    /// Later layers win, so `BRINGUP_STEP_WAIT_MAX=90s` overrides both the
    /// default and any file value.
    pub fn load(file: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Self = figment.merge(Env::prefixed("BRINGUP_")).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects values that pass parsing but are logically unusable.
    pub fn validate(&self) -> AppResult<()> {
        if self.event_queue_capacity == 0 {
            return Err(crate::error::FrameworkError::Configuration(
                "event_queue_capacity must be at least 1".into(),
            ));
        }
        if self.watchdog_dead_checks == 0 || self.watchdog_dead_checks_active == 0 {
            return Err(crate::error::FrameworkError::Configuration(
                "watchdog debounce counts must be at least 1".into(),
            ));
        }
        if self.watchdog_dead_checks_active < self.watchdog_dead_checks {
            return Err(crate::error::FrameworkError::Configuration(
                "watchdog_dead_checks_active must not be below watchdog_dead_checks".into(),
            ));
        }
        Ok(())
    }
}
