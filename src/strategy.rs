//! Iteration strategies: fixed-count loop, linear sweep, 2-D shmoo.
//!
//! Strategies are pure value generators. Axis value lists are generated
//! eagerly at construction, so `total_count` is exact before the run starts
//! and `apply` is an infallible table lookup during the run.
//!
//! Shmoo ordering is y-outer / x-inner (x varies fastest) and is relied on
//! downstream for result-matrix reconstruction; do not change it.

use serde::{Deserialize, Serialize};

use crate::config::TestConfig;
use crate::error::{AppResult, FrameworkError};
use crate::executor::IterationStatus;

/// One sweepable axis with its bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SweepAxis {
    /// Integer frequency range in MHz, inclusive of `end`.
    Frequency {
        /// First value.
        start: i64,
        /// Last value; the generated sequence never exceeds it.
        end: i64,
        /// Positive increment.
        step: i64,
    },
    /// Float voltage walk in volts.
    Voltage {
        /// First value.
        start: f64,
        /// Last value; the generated sequence is clamped to it.
        end: f64,
        /// Positive increment.
        step: f64,
    },
}

/// A single generated axis value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AxisValue {
    /// Frequency in MHz.
    Frequency(i64),
    /// Voltage in volts, rounded to 5 decimals.
    Voltage(f64),
}

impl AxisValue {
    /// Writes this value into the one config field it governs.
    pub fn apply_to(self, cfg: &mut TestConfig) {
        match self {
            AxisValue::Frequency(mhz) => cfg.frequency_mhz = mhz,
            AxisValue::Voltage(v) => cfg.voltage_v = v,
        }
    }
}

fn round5(v: f64) -> f64 {
    (v * 1e5).round() / 1e5
}

impl SweepAxis {
    /// Short axis name for event context.
    pub fn name(&self) -> &'static str {
        match self {
            SweepAxis::Frequency { .. } => "frequency",
            SweepAxis::Voltage { .. } => "voltage",
        }
    }

    /// Generates the full ordered value list for this axis.
    ///
    /// Frequency: integer range `[start, end]` stepping by `step`; the final
    /// value is clamped to `end` so the requested bound is never overshot.
    /// Voltage: floats from `start` with a `step / 2` tolerance on the end
    /// condition to survive binary float drift, each value rounded to 5
    /// decimals, last value clamped to `end`.
    pub fn generate(&self) -> AppResult<Vec<AxisValue>> {
        match *self {
            SweepAxis::Frequency { start, end, step } => {
                if step <= 0 {
                    return Err(FrameworkError::Strategy(format!(
                        "frequency step must be positive, got {step}"
                    )));
                }
                if end < start {
                    return Err(FrameworkError::Strategy(format!(
                        "frequency end {end} below start {start}"
                    )));
                }
                let mut values = Vec::new();
                let mut v = start;
                while v < end {
                    values.push(AxisValue::Frequency(v));
                    v += step;
                }
                // The overshooting value collapses onto the bound itself.
                values.push(AxisValue::Frequency(end));
                Ok(values)
            }
            SweepAxis::Voltage { start, end, step } => {
                if step <= 0.0 {
                    return Err(FrameworkError::Strategy(format!(
                        "voltage step must be positive, got {step}"
                    )));
                }
                if end < start {
                    return Err(FrameworkError::Strategy(format!(
                        "voltage end {end} below start {start}"
                    )));
                }
                let mut values = Vec::new();
                let mut v = start;
                while v <= end + step / 2.0 {
                    values.push(round5(v));
                    v += step;
                }
                if let Some(last) = values.last_mut() {
                    if *last > end {
                        *last = round5(end);
                    }
                }
                Ok(values.into_iter().map(AxisValue::Voltage).collect())
            }
        }
    }
}

/// Parameter-space generator for one run.
#[derive(Debug, Clone)]
pub enum Strategy {
    /// Fixed-count repetition of an unchanged config.
    Loop {
        /// Number of iterations.
        iterations: usize,
    },
    /// One-axis linear sweep.
    Sweep {
        /// Axis being swept, kept for the descriptor.
        axis: SweepAxis,
        /// Eagerly generated value table.
        values: Vec<AxisValue>,
    },
    /// Two-axis shmoo, y outer, x inner.
    Shmoo {
        /// Fast axis values.
        x: Vec<AxisValue>,
        /// Slow axis values.
        y: Vec<AxisValue>,
    },
}

impl Strategy {
    /// Fixed-count loop over the unchanged config.
    pub fn fixed_loop(iterations: usize) -> AppResult<Self> {
        if iterations == 0 {
            return Err(FrameworkError::Strategy(
                "loop count must be at least 1".into(),
            ));
        }
        Ok(Strategy::Loop { iterations })
    }

    /// Linear sweep along one axis.
    pub fn sweep(axis: SweepAxis) -> AppResult<Self> {
        let values = axis.generate()?;
        Ok(Strategy::Sweep { axis, values })
    }

    /// Two-axis shmoo; `x` is the fast axis.
    pub fn shmoo(x_axis: SweepAxis, y_axis: SweepAxis) -> AppResult<Self> {
        Ok(Strategy::Shmoo {
            x: x_axis.generate()?,
            y: y_axis.generate()?,
        })
    }

    /// Exact number of iterations this strategy will produce.
    pub fn total_count(&self) -> usize {
        match self {
            Strategy::Loop { iterations } => *iterations,
            Strategy::Sweep { values, .. } => values.len(),
            Strategy::Shmoo { x, y } => x.len() * y.len(),
        }
    }

    /// Descriptor used in event context (`loop`, `sweep:voltage`, `shmoo`).
    pub fn descriptor(&self) -> String {
        match self {
            Strategy::Loop { .. } => "loop".to_string(),
            Strategy::Sweep { axis, .. } => format!("sweep:{}", axis.name()),
            Strategy::Shmoo { .. } => "shmoo".to_string(),
        }
    }

    /// Writes the parameter values for 0-based iteration `index` into `cfg`.
    ///
    /// For a shmoo, `index` maps to `(x[index % m], y[index / m])`.
    pub fn apply(&self, cfg: &mut TestConfig, index: usize) {
        match self {
            Strategy::Loop { .. } => {}
            Strategy::Sweep { values, .. } => {
                if let Some(value) = values.get(index) {
                    value.apply_to(cfg);
                }
            }
            Strategy::Shmoo { x, y } => {
                let m = x.len();
                if m == 0 {
                    return;
                }
                if let (Some(xv), Some(yv)) = (x.get(index % m), y.get(index / m)) {
                    xv.apply_to(cfg);
                    yv.apply_to(cfg);
                }
            }
        }
    }
}

/// Reset policy applied between iterations, shared by all strategies: a pass
/// defers to `reset_on_pass`, anything else forces a reset.
pub fn apply_reset_policy(cfg: &mut TestConfig, status: IterationStatus) {
    if status == IterationStatus::Pass {
        cfg.reset = cfg.reset_on_pass;
    } else {
        cfg.reset = true;
    }
}
