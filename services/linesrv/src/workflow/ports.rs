//! Outbound seams of the orchestrator
//!
//! All sends are fire-and-forget: an `Err` means the message could not be
//! handed to the transport, never that the peer rejected it.

use serde_json::Value;

use crate::error::Result;
use crate::model::{ProgramCommand, ProgramResult, ValidationOutcome};

pub trait PlcLink: Send + Sync {
    fn send_validation(&self, outcome: &ValidationOutcome) -> Result<()>;

    /// Free-form `{"type": kind, "data": data}` acknowledgment
    fn send_ack(&self, kind: &str, data: Value) -> Result<()>;
}

pub trait ProgrammerLink: Send + Sync {
    fn send_program(&self, command: &ProgramCommand) -> Result<()>;
}

pub trait ResultReporter: Send + Sync {
    /// Hand a finished batch over for delivery; must not block
    fn submit(&self, result: ProgramResult) -> Result<()>;
}
