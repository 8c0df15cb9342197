//! Workflow state machine
//!
//! `transition` is a pure function from `(state, event)` to the next state
//! plus the side effects the orchestrator must execute. Events that do not
//! fit the current stage leave the state untouched and are reported as
//! ignored; they are never buffered.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

use crate::model::{
    DeviceResult, ExpectedCount, ProgramCommand, ProgramResult, ScanRecord, Timestamp,
    ValidationOutcome,
};

/// Acknowledgment type sent to the PLC after a count verification
pub const BARCODE_VERIFIED: &str = "barcode_verified";

/// Stage tag of a `WorkflowState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Idle,
    Scanning,
    WaitingCommand,
    Programming,
    Reporting,
    Error,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "IDLE",
            Stage::Scanning => "SCANNING",
            Stage::WaitingCommand => "WAITING_COMMAND",
            Stage::Programming => "PROGRAMMING",
            Stage::Reporting => "REPORTING",
            Stage::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowState {
    Idle,
    Scanning {
        device_id: String,
    },
    WaitingCommand {
        device_id: String,
        expected: ExpectedCount,
    },
    Programming {
        device_id: String,
        expected: ExpectedCount,
        command: ProgramCommand,
    },
    Reporting {
        device_id: String,
        batch_id: String,
    },
    Error {
        reason: String,
        device_id: Option<String>,
    },
}

impl WorkflowState {
    pub fn stage(&self) -> Stage {
        match self {
            WorkflowState::Idle => Stage::Idle,
            WorkflowState::Scanning { .. } => Stage::Scanning,
            WorkflowState::WaitingCommand { .. } => Stage::WaitingCommand,
            WorkflowState::Programming { .. } => Stage::Programming,
            WorkflowState::Reporting { .. } => Stage::Reporting,
            WorkflowState::Error { .. } => Stage::Error,
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            WorkflowState::Idle => None,
            WorkflowState::Scanning { device_id }
            | WorkflowState::WaitingCommand { device_id, .. }
            | WorkflowState::Programming { device_id, .. }
            | WorkflowState::Reporting { device_id, .. } => Some(device_id),
            WorkflowState::Error { device_id, .. } => device_id.as_deref(),
        }
    }

    pub fn expected(&self) -> Option<&ExpectedCount> {
        match self {
            WorkflowState::WaitingCommand { expected, .. }
            | WorkflowState::Programming { expected, .. } => Some(expected),
            _ => None,
        }
    }

    /// Batch currently in flight, if any
    pub fn batch_id(&self) -> Option<&str> {
        match self {
            WorkflowState::WaitingCommand { expected, .. } => Some(&expected.batch_id),
            WorkflowState::Programming { command, .. } => Some(&command.batch_id),
            WorkflowState::Reporting { batch_id, .. } => Some(batch_id),
            _ => None,
        }
    }
}

/// Input to the state machine
///
/// Events that depend on the scan buffer carry a snapshot taken under the
/// orchestrator lock.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    /// Operator start for a device
    Start { device_id: String },
    ScanObserved { record: ScanRecord },
    ProductCount {
        count: u32,
        batch_id: String,
        received_at: Timestamp,
        scanned: Vec<ScanRecord>,
    },
    StartCommand { scanned: Vec<ScanRecord> },
    ResultReceived { result: ProgramResult },
    /// The EMS reporter accepted the batch for delivery
    ReportEnqueued,
    /// The program command could not be handed to the upper computer
    DispatchFailed { reason: String },
    Reset,
    Fault { reason: String },
    Stalled { stage: Stage, elapsed: Duration },
}

impl WorkflowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::Start { .. } => "start",
            WorkflowEvent::ScanObserved { .. } => "scan",
            WorkflowEvent::ProductCount { .. } => "product_count",
            WorkflowEvent::StartCommand { .. } => "start_command",
            WorkflowEvent::ResultReceived { .. } => "program_result",
            WorkflowEvent::ReportEnqueued => "report_enqueued",
            WorkflowEvent::DispatchFailed { .. } => "dispatch_failed",
            WorkflowEvent::Reset => "reset",
            WorkflowEvent::Fault { .. } => "fault",
            WorkflowEvent::Stalled { .. } => "stalled",
        }
    }
}

/// Side effect requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    SendValidation(ValidationOutcome),
    SendAck { kind: String, data: Value },
    /// Append to the device's scan buffer
    BufferScan(ScanRecord),
    PersistScan(ScanRecord),
    PersistValidation(ValidationOutcome),
    SendProgram(ProgramCommand),
    PersistDeviceResult {
        batch_id: String,
        result: DeviceResult,
        time: Timestamp,
    },
    SubmitReport(ProgramResult),
    /// Drop the device's scans and active selection
    ClearDevice(String),
    /// Drop every buffered scan and the active selection
    ClearAll,
    /// Make the device the target of subsequent scans
    SelectDevice(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Ignored(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: WorkflowState,
    pub effects: Vec<Effect>,
    pub outcome: Outcome,
}

impl Transition {
    fn to(state: WorkflowState, effects: Vec<Effect>) -> Self {
        Self {
            state,
            effects,
            outcome: Outcome::Applied,
        }
    }

    fn ignore(state: &WorkflowState, reason: impl Into<String>) -> Self {
        Self {
            state: state.clone(),
            effects: Vec::new(),
            outcome: Outcome::Ignored(reason.into()),
        }
    }

    fn with_effects(mut self, effects: Vec<Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

fn verification_ack(outcome: &ValidationOutcome) -> Effect {
    let data = if outcome.is_valid {
        json!({"status": "ok"})
    } else {
        json!({"status": "error", "message": outcome.message})
    };
    Effect::SendAck {
        kind: BARCODE_VERIFIED.to_string(),
        data,
    }
}

fn clear(device_id: Option<&str>) -> Vec<Effect> {
    device_id
        .map(|d| vec![Effect::ClearDevice(d.to_string())])
        .unwrap_or_default()
}

/// Effects opening a fresh cycle for `device_id`
fn open_cycle(device_id: &str) -> Vec<Effect> {
    vec![Effect::ClearAll, Effect::SelectDevice(device_id.to_string())]
}

fn keep_scan(record: ScanRecord) -> Vec<Effect> {
    vec![Effect::BufferScan(record.clone()), Effect::PersistScan(record)]
}

/// Compute the next state and effects for `event`
pub fn transition(state: &WorkflowState, event: WorkflowEvent) -> Transition {
    use WorkflowEvent as E;
    use WorkflowState as S;

    match (state, event) {
        // Operator start
        (S::Idle | S::Error { .. }, E::Start { device_id }) => {
            let effects = open_cycle(&device_id);
            Transition::to(S::Scanning { device_id }, effects)
        },
        (_, E::Start { .. }) => Transition::ignore(state, "a cycle is already running"),

        // Scans are always persisted; only those for the open cycle's device
        // are buffered, and only IDLE changes stage
        (S::Idle, E::ScanObserved { record }) => {
            let device_id = record.device_id.clone();
            let mut effects = vec![Effect::SelectDevice(device_id.clone())];
            effects.extend(keep_scan(record));
            Transition::to(S::Scanning { device_id }, effects)
        },
        (S::Scanning { device_id }, E::ScanObserved { record }) if &record.device_id == device_id => {
            Transition::to(state.clone(), keep_scan(record))
        },
        (S::Error { .. }, E::ScanObserved { record }) => {
            Transition::ignore(state, "workflow is in error").with_effects(vec![Effect::PersistScan(record)])
        },
        (_, E::ScanObserved { record }) => {
            let reason = match state.device_id() {
                Some(open) if open != record.device_id => {
                    format!("scan for device {} while {} is open", record.device_id, open)
                },
                _ => format!("late scan in {}", state.stage()),
            };
            let effects = if state.device_id() == Some(record.device_id.as_str()) {
                keep_scan(record)
            } else {
                vec![Effect::PersistScan(record)]
            };
            Transition::ignore(state, reason).with_effects(effects)
        },

        // Count verification
        (
            S::Scanning { device_id },
            E::ProductCount {
                count,
                batch_id,
                received_at,
                scanned,
            },
        ) => {
            let outcome = ValidationOutcome::evaluate(count, scanned.len() as u32);
            let mut effects = vec![
                Effect::SendValidation(outcome.clone()),
                verification_ack(&outcome),
                Effect::PersistValidation(outcome.clone()),
            ];
            if outcome.is_valid {
                let expected = ExpectedCount {
                    value: count,
                    batch_id,
                    received_at,
                };
                Transition::to(
                    S::WaitingCommand {
                        device_id: device_id.clone(),
                        expected,
                    },
                    effects,
                )
            } else {
                effects.push(Effect::ClearDevice(device_id.clone()));
                Transition::to(S::Idle, effects)
            }
        },
        (_, E::ProductCount { .. }) => Transition::ignore(state, "no open scanning stage"),

        // Authorization
        (S::WaitingCommand { device_id, expected }, E::StartCommand { scanned }) => {
            let command = ProgramCommand::from_scans(expected.batch_id.clone(), &scanned);
            Transition::to(
                S::Programming {
                    device_id: device_id.clone(),
                    expected: expected.clone(),
                    command: command.clone(),
                },
                vec![Effect::SendProgram(command)],
            )
        },
        (_, E::StartCommand { .. }) => Transition::ignore(state, "counts not verified"),

        (S::Programming { device_id, expected, .. }, E::DispatchFailed { .. }) => Transition::to(
            S::WaitingCommand {
                device_id: device_id.clone(),
                expected: expected.clone(),
            },
            Vec::new(),
        ),
        (_, E::DispatchFailed { .. }) => Transition::ignore(state, "no dispatch in progress"),

        // Batch results
        (S::Programming { device_id, command, .. }, E::ResultReceived { result }) => {
            if result.batch_id != command.batch_id {
                return Transition::ignore(
                    state,
                    format!(
                        "batch {} does not match open batch {}",
                        result.batch_id, command.batch_id
                    ),
                );
            }

            let mut effects: Vec<Effect> = result
                .results
                .iter()
                .map(|r| Effect::PersistDeviceResult {
                    batch_id: result.batch_id.clone(),
                    result: r.clone(),
                    time: result.complete_time,
                })
                .collect();
            let batch_id = result.batch_id.clone();
            effects.push(Effect::SubmitReport(result));

            Transition::to(
                S::Reporting {
                    device_id: device_id.clone(),
                    batch_id,
                },
                effects,
            )
        },
        (_, E::ResultReceived { result }) => Transition::ignore(
            state,
            format!("batch {} is not awaiting results", result.batch_id),
        ),

        (S::Reporting { device_id, .. }, E::ReportEnqueued) => {
            Transition::to(S::Idle, vec![Effect::ClearDevice(device_id.clone())])
        },
        (_, E::ReportEnqueued) => Transition::ignore(state, "nothing to report"),

        // Operator and watchdog overrides
        (S::Idle, E::Reset) => Transition::ignore(state, "already idle"),
        (_, E::Reset) => Transition::to(S::Idle, vec![Effect::ClearAll]),

        (S::Error { .. }, E::Fault { .. }) => Transition::ignore(state, "already in error"),
        (_, E::Fault { reason }) => Transition::to(
            S::Error {
                reason,
                device_id: state.device_id().map(str::to_string),
            },
            clear(state.device_id()),
        ),

        (_, E::Stalled { stage, elapsed }) => {
            if state.stage() != stage || !matches!(stage, Stage::WaitingCommand | Stage::Programming) {
                return Transition::ignore(state, "stage already left");
            }
            Transition::to(
                S::Error {
                    reason: format!("{} timed out after {}s", stage, elapsed.as_secs()),
                    device_id: state.device_id().map(str::to_string),
                },
                clear(state.device_id()),
            )
        },
    }
}
