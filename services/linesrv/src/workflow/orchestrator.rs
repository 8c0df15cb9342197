//! Workflow orchestrator
//!
//! Owns the single `WorkflowState` behind one coarse lock. PLC events, scans
//! and batch results from different tasks all funnel into `dispatch`, which
//! runs the transition and its non-blocking effects (sends, report
//! submission, buffer appends and clears) while holding the lock. Follow-up events such
//! as a failed dispatch are processed in the same critical section. Durable
//! writes are collected and awaited after the lock is released.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ports::{PlcLink, ProgrammerLink, ResultReporter};
use super::state::{transition, Effect, Outcome, Stage, Transition, WorkflowEvent, WorkflowState};
use crate::barcode::{ScanBuffer, ScanSink};
use crate::channels::{PlcEvent, ResultSink};
use crate::model::{self, ProgramResult, ScanRecord, ValidationOutcome};
use crate::persistence::Persistence;

/// Stall limits checked by the watchdog; `None` disables a limit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StallLimits {
    pub waiting_command: Option<Duration>,
    pub programming: Option<Duration>,
}

impl StallLimits {
    fn for_stage(&self, stage: Stage) -> Option<Duration> {
        match stage {
            Stage::WaitingCommand => self.waiting_command,
            Stage::Programming => self.programming,
            _ => None,
        }
    }
}

/// Point-in-time view for operators and the status API
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatus {
    pub stage: Stage,
    pub device_id: Option<String>,
    pub batch_id: Option<String>,
    pub expected_count: Option<u32>,
    pub scanned_count: usize,
    pub barcodes: Vec<String>,
    pub error: Option<String>,
    pub last_validation: Option<ValidationOutcome>,
    pub stage_elapsed_ms: u64,
    pub stats: WorkflowStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkflowStats {
    pub scans: u64,
    pub validations_passed: u64,
    pub validations_failed: u64,
    pub batches_dispatched: u64,
    pub batches_completed: u64,
    pub ignored_events: u64,
    pub persistence_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    scans: AtomicU64,
    validations_passed: AtomicU64,
    validations_failed: AtomicU64,
    batches_dispatched: AtomicU64,
    batches_completed: AtomicU64,
    ignored_events: AtomicU64,
    persistence_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkflowStats {
        WorkflowStats {
            scans: self.scans.load(Ordering::Relaxed),
            validations_passed: self.validations_passed.load(Ordering::Relaxed),
            validations_failed: self.validations_failed.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            ignored_events: self.ignored_events.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
        }
    }
}

struct Core {
    state: WorkflowState,
    entered_at: Instant,
    last_validation: Option<ValidationOutcome>,
}

/// Collaborators the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub buffer: Arc<ScanBuffer>,
    pub plc: Arc<dyn PlcLink>,
    pub programmer: Arc<dyn ProgrammerLink>,
    pub reporter: Arc<dyn ResultReporter>,
    pub persistence: Arc<dyn Persistence>,
}

pub struct Orchestrator {
    core: Mutex<Core>,
    buffer: Arc<ScanBuffer>,
    plc: Arc<dyn PlcLink>,
    programmer: Arc<dyn ProgrammerLink>,
    reporter: Arc<dyn ResultReporter>,
    persistence: Arc<dyn Persistence>,
    default_device_id: String,
    counters: Counters,
}

impl Orchestrator {
    pub fn new(collaborators: Collaborators, default_device_id: impl Into<String>) -> Self {
        Self {
            core: Mutex::new(Core {
                state: WorkflowState::Idle,
                entered_at: Instant::now(),
                last_validation: None,
            }),
            buffer: collaborators.buffer,
            plc: collaborators.plc,
            programmer: collaborators.programmer,
            reporter: collaborators.reporter,
            persistence: collaborators.persistence,
            default_device_id: default_device_id.into(),
            counters: Counters::default(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.core.lock().state.stage()
    }

    pub fn state(&self) -> WorkflowState {
        self.core.lock().state.clone()
    }

    pub fn status(&self) -> WorkflowStatus {
        let core = self.core.lock();
        let state = &core.state;
        let device_id = state.device_id().map(str::to_string);
        let error = match state {
            WorkflowState::Error { reason, .. } => Some(reason.clone()),
            _ => None,
        };

        let barcodes = device_id
            .as_deref()
            .map(|d| self.buffer.barcodes(d))
            .unwrap_or_default();

        WorkflowStatus {
            stage: state.stage(),
            scanned_count: barcodes.len(),
            barcodes,
            device_id,
            batch_id: state.batch_id().map(str::to_string),
            expected_count: state.expected().map(|e| e.value),
            error,
            last_validation: core.last_validation.clone(),
            stage_elapsed_ms: core.entered_at.elapsed().as_millis() as u64,
            stats: self.counters.snapshot(),
        }
    }

    /// Open a cycle for `device_id` (or the default device)
    ///
    /// Accepted from IDLE and ERROR.
    pub async fn start(&self, device_id: Option<String>) -> bool {
        let device_id = device_id
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| self.default_device_id.clone());
        self.dispatch(|_| Some(WorkflowEvent::Start { device_id })).await
    }

    /// Return to IDLE, dropping volatile state; a no-op when already idle
    pub async fn reset(&self) -> bool {
        self.dispatch(|_| Some(WorkflowEvent::Reset)).await
    }

    /// Move to ERROR, dropping volatile state
    pub async fn fail(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.dispatch(|_| Some(WorkflowEvent::Fault { reason })).await
    }

    pub async fn handle_plc_event(&self, event: PlcEvent) -> bool {
        match event {
            PlcEvent::ProductCount { count, batch_id } => {
                self.dispatch(|core| {
                    let scanned = core
                        .state
                        .device_id()
                        .map(|d| self.buffer.snapshot(d))
                        .unwrap_or_default();
                    Some(WorkflowEvent::ProductCount {
                        count,
                        batch_id: batch_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                        received_at: model::now(),
                        scanned,
                    })
                })
                .await
            },
            PlcEvent::StartCommand => {
                self.dispatch(|core| {
                    let scanned = core
                        .state
                        .device_id()
                        .map(|d| self.buffer.snapshot(d))
                        .unwrap_or_default();
                    Some(WorkflowEvent::StartCommand { scanned })
                })
                .await
            },
            PlcEvent::Unknown { kind, .. } => {
                debug!("Workflow ignores PLC message '{}'", kind);
                false
            },
        }
    }

    /// Consume PLC events until the bus closes or `cancel` fires
    pub async fn run_plc_events(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<PlcEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.recv() => match next {
                    Some(event) => {
                        self.handle_plc_event(event).await;
                    },
                    None => break,
                },
            }
        }
        debug!("PLC event loop stopped");
    }

    /// Move a stage that outlived its limit to ERROR
    pub async fn check_stall(&self, limits: &StallLimits) -> bool {
        self.dispatch(|core| {
            let stage = core.state.stage();
            let limit = limits.for_stage(stage)?;
            let elapsed = core.entered_at.elapsed();
            (elapsed >= limit).then_some(WorkflowEvent::Stalled { stage, elapsed })
        })
        .await
    }

    /// Run one event (and its follow-ups) through the state machine
    ///
    /// `build` sees the locked state so buffer snapshots match the stage the
    /// event is applied to. Returns whether the initial event was applied.
    async fn dispatch<F>(&self, build: F) -> bool
    where
        F: FnOnce(&Core) -> Option<WorkflowEvent>,
    {
        let (applied, deferred) = {
            let mut core = self.core.lock();
            let Some(first) = build(&core) else {
                return false;
            };

            let mut pending = VecDeque::from([first]);
            let mut deferred = Vec::new();
            let mut applied = None;

            while let Some(event) = pending.pop_front() {
                let name = event.name();
                let from = core.state.stage();
                let Transition {
                    state,
                    effects,
                    outcome,
                } = transition(&core.state, event);

                match &outcome {
                    Outcome::Applied => {
                        if state.stage() != from {
                            info!("Workflow {} -> {} on {}", from, state.stage(), name);
                            core.entered_at = Instant::now();
                        }
                    },
                    Outcome::Ignored(reason) => {
                        Counters::bump(&self.counters.ignored_events);
                        warn!("Ignored {} in {}: {}", name, from, reason);
                    },
                }
                applied.get_or_insert(outcome == Outcome::Applied);
                core.state = state;

                for effect in effects {
                    if let Some(effect) = self.apply(&mut core, effect, &mut pending) {
                        deferred.push(effect);
                    }
                }
            }

            (applied.unwrap_or(false), deferred)
        };

        for effect in deferred {
            self.persist(effect).await;
        }
        applied
    }

    /// Execute a non-blocking effect, returning durable writes for later
    fn apply(
        &self,
        core: &mut Core,
        effect: Effect,
        pending: &mut VecDeque<WorkflowEvent>,
    ) -> Option<Effect> {
        match effect {
            Effect::SendValidation(outcome) => {
                if outcome.is_valid {
                    Counters::bump(&self.counters.validations_passed);
                    info!(
                        "Count verified: {} scanned of {} expected",
                        outcome.actual_count, outcome.expected_count
                    );
                } else {
                    Counters::bump(&self.counters.validations_failed);
                    warn!(
                        "Count mismatch: {} scanned, {} expected",
                        outcome.actual_count, outcome.expected_count
                    );
                }
                if let Err(e) = self.plc.send_validation(&outcome) {
                    warn!("Validation result not delivered to PLC: {}", e);
                }
                core.last_validation = Some(outcome);
                None
            },
            Effect::SendAck { kind, data } => {
                if let Err(e) = self.plc.send_ack(&kind, data) {
                    warn!("PLC ack '{}' not delivered: {}", kind, e);
                }
                None
            },
            Effect::SendProgram(command) => {
                match self.programmer.send_program(&command) {
                    Ok(()) => Counters::bump(&self.counters.batches_dispatched),
                    Err(e) => {
                        warn!("Program command for batch {} not sent: {}", command.batch_id, e);
                        pending.push_back(WorkflowEvent::DispatchFailed {
                            reason: e.to_string(),
                        });
                    },
                }
                None
            },
            Effect::SubmitReport(result) => {
                let batch_id = result.batch_id.clone();
                if result.all_succeeded() {
                    info!("Batch {} programmed: {} units", batch_id, result.results.len());
                } else {
                    warn!(
                        "Batch {} programmed with {} of {} units failed",
                        batch_id,
                        result.failed_count(),
                        result.results.len()
                    );
                }
                match self.reporter.submit(result) {
                    Ok(()) => {
                        Counters::bump(&self.counters.batches_completed);
                        pending.push_back(WorkflowEvent::ReportEnqueued);
                    },
                    Err(e) => {
                        error!("Batch {} could not be queued for EMS: {}", batch_id, e);
                        pending.push_back(WorkflowEvent::Fault {
                            reason: format!("EMS submission failed: {}", e),
                        });
                    },
                }
                None
            },
            Effect::BufferScan(record) => {
                let count = self.buffer.append(record);
                debug!("{} scans buffered", count);
                None
            },
            Effect::ClearAll => {
                let dropped = self.buffer.clear_all();
                debug!("Cleared {} buffered scans", dropped);
                None
            },
            Effect::ClearDevice(device_id) => {
                let dropped = self.buffer.clear(&device_id);
                self.buffer.release_device(&device_id);
                debug!("Cleared {} buffered scans for {}", dropped, device_id);
                None
            },
            Effect::SelectDevice(device_id) => {
                self.buffer.set_active_device(device_id);
                None
            },
            Effect::PersistScan(_)
            | Effect::PersistValidation(_)
            | Effect::PersistDeviceResult { .. } => Some(effect),
        }
    }

    async fn persist(&self, effect: Effect) {
        let result = match &effect {
            Effect::PersistScan(record) => self.persistence.save_scan(record).await,
            Effect::PersistValidation(outcome) => self.persistence.save_validation(outcome).await,
            Effect::PersistDeviceResult {
                batch_id,
                result,
                time,
            } => {
                self.persistence
                    .save_program_result(batch_id, result, *time)
                    .await
            },
            _ => Ok(()),
        };

        if let Err(e) = result {
            Counters::bump(&self.counters.persistence_failures);
            warn!("Persistence failed, continuing: {}", e);
        }
    }
}

#[async_trait]
impl ScanSink for Orchestrator {
    /// Assign the scan to the selected device, the open cycle's device or
    /// the default device, in that order
    async fn on_scan(&self, port: &str, barcode: &str) -> Option<ScanRecord> {
        Counters::bump(&self.counters.scans);
        let mut observed = None;
        self.dispatch(|core| {
            let device_id = self
                .buffer
                .active_device()
                .or_else(|| core.state.device_id().map(str::to_string))
                .unwrap_or_else(|| self.default_device_id.clone());
            let record = ScanRecord::new(device_id, barcode, port);
            observed = Some(record.clone());
            Some(WorkflowEvent::ScanObserved { record })
        })
        .await;
        observed
    }
}

#[async_trait]
impl ResultSink for Orchestrator {
    async fn on_result(&self, result: ProgramResult) {
        self.dispatch(|_| Some(WorkflowEvent::ResultReceived { result }))
            .await;
    }
}
