//! Command-line demo driver: runs a strategy against a simulated device and
//! streams status events to stdout as JSON lines.

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;

use bringup_runner::config::{EngineSettings, TestConfig};
use bringup_runner::executor::{ContentOutcome, ContentRunner, DeviceController};
use bringup_runner::orchestrator::Orchestrator;
use bringup_runner::status::{Reporter, StatusEvent};
use bringup_runner::strategy::{Strategy, SweepAxis};

#[derive(Parser)]
#[command(name = "bringup-runner", about = "Bring-up test iteration engine demo")]
struct Cli {
    /// Optional engine settings TOML file.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Experiment name used in events and artifact paths.
    #[arg(long, default_value = "demo")]
    test_name: String,

    /// Simulated content pass probability.
    #[arg(long, default_value_t = 0.8)]
    pass_rate: f64,

    #[command(subcommand)]
    command: StrategyCommand,
}

#[derive(Copy, Clone, ValueEnum)]
enum AxisKind {
    Frequency,
    Voltage,
}

#[derive(Subcommand)]
enum StrategyCommand {
    /// Repeat the same configuration a fixed number of times.
    Loop {
        /// Iteration count.
        #[arg(long, default_value_t = 5)]
        iterations: usize,
    },
    /// Sweep one axis linearly.
    Sweep {
        /// Axis to sweep.
        #[arg(long, value_enum)]
        axis: AxisKind,
        /// First value.
        #[arg(long)]
        start: f64,
        /// Last value (inclusive, clamped).
        #[arg(long)]
        end: f64,
        /// Increment.
        #[arg(long)]
        step: f64,
    },
    /// Two-axis shmoo: frequency fast, voltage slow.
    Shmoo {
        /// Frequency start in MHz.
        #[arg(long)]
        freq_start: i64,
        /// Frequency end in MHz.
        #[arg(long)]
        freq_end: i64,
        /// Frequency step in MHz.
        #[arg(long)]
        freq_step: i64,
        /// Voltage start in volts.
        #[arg(long)]
        volt_start: f64,
        /// Voltage end in volts.
        #[arg(long)]
        volt_end: f64,
        /// Voltage step in volts.
        #[arg(long)]
        volt_step: f64,
    },
}

fn axis(kind: AxisKind, start: f64, end: f64, step: f64) -> SweepAxis {
    match kind {
        AxisKind::Frequency => SweepAxis::Frequency {
            start: start as i64,
            end: end as i64,
            step: step as i64,
        },
        AxisKind::Voltage => SweepAxis::Voltage { start, end, step },
    }
}

struct JsonLineReporter;

#[async_trait]
impl Reporter for JsonLineReporter {
    async fn report(&self, event: StatusEvent) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string(&event)?);
        Ok(())
    }
}

struct SimulatedDevice;

#[async_trait]
impl DeviceController for SimulatedDevice {
    async fn boot(&self, cfg: &TestConfig) -> anyhow::Result<bool> {
        log::debug!(
            "simulated boot at {} MHz / {} V",
            cfg.frequency_mhz,
            cfg.voltage_v
        );
        Ok(true)
    }

    async fn power_cycle(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn reboot(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct SimulatedContent {
    pass_rate: f64,
}

#[async_trait]
impl ContentRunner for SimulatedContent {
    async fn run_content(&self, _cfg: &TestConfig) -> anyhow::Result<ContentOutcome> {
        let (passed, scratchpad, seed) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_bool(self.pass_rate.clamp(0.0, 1.0)),
                format!("0x{:04X}", rng.gen_range(0u16..=u16::MAX)),
                format!("{}", rng.gen_range(1u32..=99999)),
            )
        };
        Ok(if passed {
            ContentOutcome {
                pass_string: "TEST PASSED".into(),
                scratchpad,
                seed,
                ..ContentOutcome::default()
            }
        } else {
            ContentOutcome {
                fail_string: "TEST FAILED".into(),
                scratchpad,
                seed,
                ..ContentOutcome::default()
            }
        })
    }

    async fn run_script(&self, _script: &str, _cfg: &TestConfig) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let settings = Arc::new(EngineSettings::load(cli.settings.as_deref())?);
    let strategy = match cli.command {
        StrategyCommand::Loop { iterations } => Strategy::fixed_loop(iterations)?,
        StrategyCommand::Sweep {
            axis: kind,
            start,
            end,
            step,
        } => Strategy::sweep(axis(kind, start, end, step))?,
        StrategyCommand::Shmoo {
            freq_start,
            freq_end,
            freq_step,
            volt_start,
            volt_end,
            volt_step,
        } => Strategy::shmoo(
            SweepAxis::Frequency {
                start: freq_start,
                end: freq_end,
                step: freq_step,
            },
            SweepAxis::Voltage {
                start: volt_start,
                end: volt_end,
                step: volt_step,
            },
        )?,
    };

    let cfg = TestConfig {
        test_name: cli.test_name,
        ..TestConfig::default()
    };

    let orchestrator = Orchestrator::new(Arc::clone(&settings), Some(Arc::new(JsonLineReporter)));
    let executor = orchestrator.executor(
        Arc::new(SimulatedDevice),
        Arc::new(SimulatedContent {
            pass_rate: cli.pass_rate,
        }),
    );
    let results = orchestrator.run(&strategy, &executor, cfg, false).await;
    orchestrator.status().shutdown().await;

    let passed = results
        .iter()
        .filter(|r| r.status == bringup_runner::executor::IterationStatus::Pass)
        .count();
    log::info!("{} of {} iterations passed", passed, results.len());
    Ok(())
}
