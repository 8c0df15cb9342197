//! Production cycle workflow
//!
//! `state` holds the pure transition function, `orchestrator` executes it
//! against the live channels, `ports` names the outbound seams and
//! `watchdog` fails stalled stages.

pub mod orchestrator;
pub mod ports;
pub mod state;
pub mod watchdog;

pub use orchestrator::{Collaborators, Orchestrator, StallLimits, WorkflowStats, WorkflowStatus};
pub use ports::{PlcLink, ProgrammerLink, ResultReporter};
pub use state::{transition, Effect, Outcome, Stage, Transition, WorkflowEvent, WorkflowState};
pub use watchdog::spawn_watchdog;
