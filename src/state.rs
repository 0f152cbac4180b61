//! Thread-safe command bus and shared run state.
//!
//! One [`ExecutionState`] instance exists per run and is shared by the worker,
//! the watchdog, the status consumer, and any number of external callers.
//!
//! # Architecture Overview
//!
//! Commands are posted by external callers, observed by the worker at defined
//! checkpoints via [`ExecutionState::poll`], and acknowledged once the worker
//! has actually acted on them. A command therefore moves through
//! `Pending -> Processing -> Acknowledged(detail)`, and the acknowledgment is
//! consumed at most once per post via [`ExecutionState::take_ack`].
//!
//! # Thread Safety
//!
//! All mutable state lives behind one `Mutex`; every mutation notifies a
//! shared [`Notify`] so pause loops, step waits, and acknowledgment waits wake
//! promptly instead of relying on their timeout tick alone. The priority order
//! inside `poll` is fixed and load-bearing: `Cancel`/`EmergencyStop` first,
//! then `EndExperiment`, then `Pause`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::status::{StatusBus, StatusKind};

/// Control commands accepted by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Abort the run as soon as the next checkpoint is reached.
    Cancel,
    /// Finish the current iteration, then stop the run.
    EndExperiment,
    /// Halt the worker at the next checkpoint until `Resume` or `Cancel`.
    Pause,
    /// Release an active or pending pause.
    Resume,
    /// Pause after every iteration until `StepContinue` arrives.
    EnableStepMode,
    /// Leave step mode; a worker stuck in a step wait proceeds on its next tick.
    DisableStepMode,
    /// Release the worker from the current step wait.
    StepContinue,
    /// Operator panic button; treated with `Cancel` priority.
    EmergencyStop,
}

impl Command {
    /// Commands that abort the run and are deduplicated while pending.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            Command::Cancel | Command::EndExperiment | Command::EmergencyStop
        )
    }

    /// Stable name used in logs and acknowledgment details.
    pub fn name(self) -> &'static str {
        match self {
            Command::Cancel => "Cancel",
            Command::EndExperiment => "EndExperiment",
            Command::Pause => "Pause",
            Command::Resume => "Resume",
            Command::EnableStepMode => "EnableStepMode",
            Command::DisableStepMode => "DisableStepMode",
            Command::StepContinue => "StepContinue",
            Command::EmergencyStop => "EmergencyStop",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle phase of a posted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPhase {
    /// Posted, not yet observed by the worker.
    Pending,
    /// Observed at a checkpoint; the worker is acting on it.
    Processing,
}

#[derive(Debug, Clone)]
struct CommandRecord {
    phase: CommandPhase,
    posted_at: DateTime<Utc>,
    data: Option<serde_json::Value>,
}

/// Acknowledgment record, readable exactly once per posted command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRecord {
    /// The acknowledged command.
    pub command: Command,
    /// Worker-supplied completion detail.
    pub detail: String,
    /// When the worker acknowledged.
    pub acked_at: DateTime<Utc>,
    /// Thread that performed the acknowledgment.
    pub thread: String,
}

/// Outcome of a checkpoint consultation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckResult {
    /// No command requires action.
    Continue,
    /// A pause is pending; only returned by the non-blocking check.
    /// [`ExecutionState::poll`] resolves the pause internally instead.
    Paused,
    /// The run must abort now.
    Cancelled,
    /// The run must stop after the current iteration completes.
    EndRequested,
    /// The bus itself is unusable (lock poisoned).
    Error(String),
}

/// Mutable run state, single writer per field, many readers.
#[derive(Debug, Clone, Default)]
struct RunState {
    active: bool,
    experiment_name: String,
    current_iteration: usize,
    total_iterations: usize,
    step_mode_enabled: bool,
    waiting_for_step: bool,
    paused: bool,
    end_requested: bool,
    cancelled: bool,
}

/// Read-only copy of the run state, safe to hand to any thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunStateSnapshot {
    /// Whether a run is currently executing.
    pub active: bool,
    /// Name of the current (or last) experiment.
    pub experiment_name: String,
    /// 1-based index of the iteration in flight.
    pub current_iteration: usize,
    /// Total iterations the active strategy will produce.
    pub total_iterations: usize,
    /// Whether step mode is enabled.
    pub step_mode_enabled: bool,
    /// Whether the worker is parked in a step wait right now.
    pub waiting_for_step: bool,
    /// Whether the worker is parked in an active pause right now.
    pub paused: bool,
    /// Whether a graceful end has been requested.
    pub end_requested: bool,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

struct Inner {
    run: RunState,
    pending: HashMap<Command, CommandRecord>,
    acks: HashMap<Command, AckRecord>,
}

/// Command bus plus shared run state for exactly one run.
pub struct ExecutionState {
    inner: Mutex<Inner>,
    signal: Notify,
    pause_poll: Duration,
    in_boot_retry: AtomicBool,
    status: Mutex<Option<Arc<StatusBus>>>,
}

impl ExecutionState {
    /// Creates an empty bus. `pause_poll` bounds the wake-up tick used while
    /// blocked inside an active pause.
    pub fn new(pause_poll: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                run: RunState::default(),
                pending: HashMap::new(),
                acks: HashMap::new(),
            }),
            signal: Notify::new(),
            pause_poll,
            in_boot_retry: AtomicBool::new(false),
            status: Mutex::new(None),
        }
    }

    /// Attaches the status bus used for halt/resume and step-mode events.
    pub fn attach_status(&self, bus: Arc<StatusBus>) {
        match self.status.lock() {
            Ok(mut guard) => *guard = Some(bus),
            Err(poisoned) => *poisoned.into_inner() = Some(bus),
        }
    }

    fn emit(&self, kind: StatusKind) {
        let bus = match self.status.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(bus) = bus {
            bus.send(kind, serde_json::json!({}));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic mid-update; the stored state is still
        // the best information available, so recover the guard.
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers `cmd` as pending. Returns `false` when the command is
    /// incompatible with the current state (duplicate critical command,
    /// `Resume` without a pause, `Pause` while already paused or pausing,
    /// `StepContinue` outside a step wait).
    pub fn post(&self, cmd: Command, data: Option<serde_json::Value>) -> bool {
        let accepted = {
            let mut inner = self.lock();
            match cmd {
                Command::Cancel | Command::EmergencyStop | Command::EndExperiment => {
                    if inner.pending.contains_key(&cmd) {
                        log::warn!("duplicate {cmd} ignored while one is pending");
                        false
                    } else {
                        insert_pending(&mut inner, cmd, data);
                        true
                    }
                }
                Command::Pause => {
                    if inner.run.paused || inner.pending.contains_key(&Command::Pause) {
                        false
                    } else {
                        insert_pending(&mut inner, cmd, data);
                        true
                    }
                }
                Command::Resume => {
                    if inner.run.paused {
                        insert_pending(&mut inner, cmd, data);
                        true
                    } else {
                        match inner.pending.get(&Command::Pause).map(|r| r.phase) {
                            None => false,
                            Some(CommandPhase::Pending) => {
                                // Pause never observed by the worker; the pair
                                // cancels out without parking anything.
                                inner.pending.remove(&Command::Pause);
                                ack_locked(&mut inner, Command::Pause, "superseded by Resume");
                                ack_locked(&mut inner, Command::Resume, "pause discarded");
                                true
                            }
                            Some(CommandPhase::Processing) => {
                                insert_pending(&mut inner, cmd, data);
                                true
                            }
                        }
                    }
                }
                Command::EnableStepMode => {
                    inner.run.step_mode_enabled = true;
                    ack_locked(&mut inner, cmd, "step mode enabled");
                    true
                }
                Command::DisableStepMode => {
                    inner.run.step_mode_enabled = false;
                    ack_locked(&mut inner, cmd, "step mode disabled");
                    true
                }
                Command::StepContinue => {
                    if inner.run.waiting_for_step {
                        insert_pending(&mut inner, cmd, data);
                        true
                    } else {
                        false
                    }
                }
            }
        };
        if accepted {
            match cmd {
                Command::EnableStepMode => self.emit(StatusKind::StepModeEnabled),
                Command::DisableStepMode => self.emit(StatusKind::StepModeDisabled),
                _ => {}
            }
            self.signal.notify_waiters();
        }
        accepted
    }

    /// Worker checkpoint consultation. Resolves an active pause internally:
    /// the call does not return until `Resume` or a cancel-class command
    /// arrives, waking on every bus mutation and at least every `pause_poll`.
    ///
    /// Priority is fixed: cancel-class, then end, then pause.
    pub async fn poll(&self) -> CheckResult {
        loop {
            match self.check_now() {
                CheckResult::Paused => {
                    if let Some(result) = self.wait_out_pause().await {
                        return result;
                    }
                    // Pause resolved by Resume; re-run the priority chain.
                }
                other => return other,
            }
        }
    }

    /// Non-blocking variant of [`Self::poll`]; transitions the winning
    /// command to `Processing` but never parks the caller.
    pub fn check_now(&self) -> CheckResult {
        let mut inner = self.lock();
        if let Some(cmd) = [Command::EmergencyStop, Command::Cancel]
            .into_iter()
            .find(|c| inner.pending.contains_key(c))
        {
            mark_processing(&mut inner, cmd);
            inner.run.cancelled = true;
            return CheckResult::Cancelled;
        }
        if inner.pending.contains_key(&Command::EndExperiment) {
            mark_processing(&mut inner, Command::EndExperiment);
            inner.run.end_requested = true;
            return CheckResult::EndRequested;
        }
        if inner.pending.contains_key(&Command::Pause) {
            mark_processing(&mut inner, Command::Pause);
            return CheckResult::Paused;
        }
        CheckResult::Continue
    }

    /// Parks the worker until the pause resolves. The `Pause` command is
    /// acknowledged on entry, so a caller's post + ack round trip completes
    /// while the run stays paused; `paused` in the snapshot tracks the park.
    /// Returns `Some` when a cancel-class command interrupts the pause,
    /// `None` after a `Resume`.
    async fn wait_out_pause(&self) -> Option<CheckResult> {
        {
            let mut inner = self.lock();
            ack_locked(&mut inner, Command::Pause, "execution paused");
            inner.run.paused = true;
        }
        self.signal.notify_waiters();
        log::info!("execution halted, waiting for Resume");
        self.emit(StatusKind::ExecutionHalted);
        loop {
            {
                let mut inner = self.lock();
                if inner.pending.contains_key(&Command::Cancel)
                    || inner.pending.contains_key(&Command::EmergencyStop)
                {
                    inner.run.paused = false;
                    // Leave the cancel command pending so the next check_now
                    // observes it through the normal priority chain.
                    drop(inner);
                    return Some(self.check_now());
                }
                if inner.pending.remove(&Command::Resume).is_some() {
                    store_ack(&mut inner, Command::Resume, "execution resumed");
                    inner.run.paused = false;
                    drop(inner);
                    self.signal.notify_waiters();
                    log::info!("execution resumed");
                    self.emit(StatusKind::ExecutionResumed);
                    return None;
                }
            }
            let _ = tokio::time::timeout(self.pause_poll, self.signal.notified()).await;
        }
    }

    /// Moves `cmd` to `Acknowledged(detail)`, stamping thread and timestamp.
    /// Returns `false` if the command was not pending or processing.
    pub fn acknowledge(&self, cmd: Command, detail: &str) -> bool {
        let acked = {
            let mut inner = self.lock();
            if inner.pending.remove(&cmd).is_none() {
                false
            } else {
                store_ack(&mut inner, cmd, detail);
                true
            }
        };
        if acked {
            self.signal.notify_waiters();
        }
        acked
    }

    /// Read-once acknowledgment lookup. `None` after a long wait is
    /// ambiguous: the command may still complete, or the ack may already have
    /// been consumed. Callers re-query [`Self::snapshot`] rather than assume
    /// either outcome.
    pub fn take_ack(&self, cmd: Command) -> Option<AckRecord> {
        self.lock().acks.remove(&cmd)
    }

    /// Discards any stale acknowledgment for `cmd` before a fresh post.
    pub fn clear_ack(&self, cmd: Command) {
        self.lock().acks.remove(&cmd);
    }

    /// True while an unread acknowledgment exists for `cmd`.
    pub fn has_ack(&self, cmd: Command) -> bool {
        self.lock().acks.contains_key(&cmd)
    }

    /// True while a cancel-class command is pending or processing.
    pub fn should_stop(&self) -> bool {
        let inner = self.lock();
        inner.pending.contains_key(&Command::Cancel)
            || inner.pending.contains_key(&Command::EmergencyStop)
    }

    /// True once a graceful end has been observed for this run.
    pub fn end_requested(&self) -> bool {
        self.lock().run.end_requested
    }

    /// True when a graceful end is pending or already observed.
    pub fn end_pending(&self) -> bool {
        let inner = self.lock();
        inner.run.end_requested || inner.pending.contains_key(&Command::EndExperiment)
    }

    /// True while a `StepContinue` waits to be consumed.
    pub fn step_continue_pending(&self) -> bool {
        self.lock().pending.contains_key(&Command::StepContinue)
    }

    /// Marks the boot-retry window; the watchdog suppresses death detection
    /// while this is set.
    pub fn set_in_boot_retry(&self, value: bool) {
        self.in_boot_retry.store(value, Ordering::SeqCst);
    }

    /// Whether the executor is currently inside the boot-retry settle window.
    pub fn in_boot_retry(&self) -> bool {
        self.in_boot_retry.load(Ordering::SeqCst)
    }

    /// Resets the run state for a fresh run. Stale counters or flags from a
    /// previous run never survive this call.
    pub fn prepare_for_run(&self, experiment_name: &str, total_iterations: usize, step_mode: bool) {
        let mut inner = self.lock();
        inner.run = RunState {
            active: true,
            experiment_name: experiment_name.to_string(),
            current_iteration: 0,
            total_iterations,
            step_mode_enabled: step_mode,
            waiting_for_step: false,
            paused: false,
            end_requested: false,
            cancelled: false,
        };
        self.in_boot_retry.store(false, Ordering::SeqCst);
    }

    /// Marks the run inactive; command records are left for late ack readers.
    pub fn finalize_run(&self) {
        let mut inner = self.lock();
        inner.run.active = false;
        inner.run.waiting_for_step = false;
        inner.run.paused = false;
        self.signal.notify_waiters();
    }

    /// Drops every pending command and unread acknowledgment.
    pub fn clear_commands(&self) {
        let mut inner = self.lock();
        inner.pending.clear();
        inner.acks.clear();
    }

    /// Posted timestamp and payload for a pending command, if any.
    pub fn pending_details(
        &self,
        cmd: Command,
    ) -> Option<(DateTime<Utc>, Option<serde_json::Value>)> {
        self.lock()
            .pending
            .get(&cmd)
            .map(|rec| (rec.posted_at, rec.data.clone()))
    }

    /// Names of commands currently stuck in `Processing`.
    pub fn processing_commands(&self) -> Vec<Command> {
        let inner = self.lock();
        inner
            .pending
            .iter()
            .filter(|(_, rec)| rec.phase == CommandPhase::Processing)
            .map(|(cmd, _)| *cmd)
            .collect()
    }

    /// Worker-only mutation of the iteration counters.
    pub fn set_iteration(&self, current: usize) {
        self.lock().run.current_iteration = current;
    }

    /// Worker-only mutation of the step-wait flag.
    pub fn set_waiting_for_step(&self, waiting: bool) {
        self.lock().run.waiting_for_step = waiting;
        self.signal.notify_waiters();
    }

    /// Consumes a pending `StepContinue`, acknowledging it. Returns `true`
    /// when one was present.
    pub fn take_step_continue(&self) -> bool {
        let taken = {
            let mut inner = self.lock();
            if inner.pending.remove(&Command::StepContinue).is_some() {
                store_ack(&mut inner, Command::StepContinue, "step released");
                true
            } else {
                false
            }
        };
        if taken {
            self.signal.notify_waiters();
        }
        taken
    }

    /// Read-only copy of the run state, safe from any thread.
    pub fn snapshot(&self) -> RunStateSnapshot {
        let inner = self.lock();
        RunStateSnapshot {
            active: inner.run.active,
            experiment_name: inner.run.experiment_name.clone(),
            current_iteration: inner.run.current_iteration,
            total_iterations: inner.run.total_iterations,
            step_mode_enabled: inner.run.step_mode_enabled,
            waiting_for_step: inner.run.waiting_for_step,
            paused: inner.run.paused,
            end_requested: inner.run.end_requested,
            cancelled: inner.run.cancelled,
        }
    }

    /// Commands valid in the current state. `StepContinue` appears only while
    /// the worker is parked in a step wait; `Resume` only while paused.
    pub fn available_commands(&self) -> Vec<Command> {
        let inner = self.lock();
        if !inner.run.active {
            return vec![];
        }
        let mut cmds = vec![Command::Cancel, Command::EmergencyStop];
        if !inner.run.end_requested {
            cmds.push(Command::EndExperiment);
        }
        let pausing = inner.run.paused || inner.pending.contains_key(&Command::Pause);
        if pausing {
            cmds.push(Command::Resume);
        } else if !inner.run.waiting_for_step {
            cmds.push(Command::Pause);
        }
        if inner.run.step_mode_enabled {
            cmds.push(Command::DisableStepMode);
            if inner.run.waiting_for_step {
                cmds.push(Command::StepContinue);
            }
        } else {
            cmds.push(Command::EnableStepMode);
        }
        cmds
    }

    /// Waits until `predicate` holds, waking on bus mutations and at least
    /// every `tick`. Returns `false` on deadline expiry.
    pub async fn wait_until(
        &self,
        deadline: Duration,
        tick: Duration,
        mut predicate: impl FnMut(&ExecutionState) -> bool,
    ) -> bool {
        let start = tokio::time::Instant::now();
        loop {
            if predicate(self) {
                return true;
            }
            let remaining = match deadline.checked_sub(start.elapsed()) {
                Some(r) if !r.is_zero() => r,
                _ => return false,
            };
            let _ = tokio::time::timeout(remaining.min(tick), self.signal.notified()).await;
        }
    }
}

fn insert_pending(inner: &mut Inner, cmd: Command, data: Option<serde_json::Value>) {
    inner.pending.insert(
        cmd,
        CommandRecord {
            phase: CommandPhase::Pending,
            posted_at: Utc::now(),
            data,
        },
    );
    log::debug!("command {cmd} posted");
}

fn mark_processing(inner: &mut Inner, cmd: Command) {
    if let Some(rec) = inner.pending.get_mut(&cmd) {
        rec.phase = CommandPhase::Processing;
    }
}

fn ack_locked(inner: &mut Inner, cmd: Command, detail: &str) {
    inner.pending.remove(&cmd);
    store_ack(inner, cmd, detail);
}

fn store_ack(inner: &mut Inner, cmd: Command, detail: &str) {
    let thread = std::thread::current()
        .name()
        .unwrap_or("unnamed")
        .to_string();
    inner.acks.insert(
        cmd,
        AckRecord {
            command: cmd,
            detail: detail.to_string(),
            acked_at: Utc::now(),
            thread,
        },
    );
    log::debug!("command {cmd} acknowledged: {detail}");
}
