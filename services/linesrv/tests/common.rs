//! Shared test fixtures: recording fakes for the orchestrator's outbound links

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use linesrv::barcode::{BarcodeIngest, ScanBuffer};
use linesrv::error::{LineSrvError, Result};
use linesrv::model::{ProgramCommand, ProgramResult, ValidationOutcome};
use linesrv::persistence::MemoryPersistence;
use linesrv::workflow::{Collaborators, Orchestrator, PlcLink, ProgrammerLink, ResultReporter};

pub const DEVICE: &str = "D1";

#[derive(Default)]
pub struct FakePlc {
    pub validations: Mutex<Vec<ValidationOutcome>>,
    pub acks: Mutex<Vec<(String, Value)>>,
    pub offline: AtomicBool,
}

impl PlcLink for FakePlc {
    fn send_validation(&self, outcome: &ValidationOutcome) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LineSrvError::not_connected("plc"));
        }
        self.validations.lock().push(outcome.clone());
        Ok(())
    }

    fn send_ack(&self, kind: &str, data: Value) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LineSrvError::not_connected("plc"));
        }
        self.acks.lock().push((kind.to_string(), data));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeProgrammer {
    pub commands: Mutex<Vec<ProgramCommand>>,
    pub offline: AtomicBool,
}

impl ProgrammerLink for FakeProgrammer {
    fn send_program(&self, command: &ProgramCommand) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LineSrvError::not_connected("upper_computer"));
        }
        self.commands.lock().push(command.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeReporter {
    pub submitted: Mutex<Vec<ProgramResult>>,
    pub rejecting: AtomicBool,
}

impl ResultReporter for FakeReporter {
    fn submit(&self, result: ProgramResult) -> Result<()> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(LineSrvError::reporting("reporter is shut down"));
        }
        self.submitted.lock().push(result);
        Ok(())
    }
}

/// An orchestrator wired to recording fakes
pub struct Line {
    pub orchestrator: Arc<Orchestrator>,
    pub ingest: Arc<BarcodeIngest>,
    pub buffer: Arc<ScanBuffer>,
    pub plc: Arc<FakePlc>,
    pub programmer: Arc<FakeProgrammer>,
    pub reporter: Arc<FakeReporter>,
    pub persistence: Arc<MemoryPersistence>,
}

impl Line {
    pub fn new() -> Self {
        let buffer = Arc::new(ScanBuffer::new());
        let plc = Arc::new(FakePlc::default());
        let programmer = Arc::new(FakeProgrammer::default());
        let reporter = Arc::new(FakeReporter::default());
        let persistence = Arc::new(MemoryPersistence::new());

        let orchestrator = Arc::new(Orchestrator::new(
            Collaborators {
                buffer: buffer.clone(),
                plc: plc.clone(),
                programmer: programmer.clone(),
                reporter: reporter.clone(),
                persistence: persistence.clone(),
            },
            DEVICE,
        ));
        let ingest = Arc::new(BarcodeIngest::new(orchestrator.clone()));

        Self {
            orchestrator,
            ingest,
            buffer,
            plc,
            programmer,
            reporter,
            persistence,
        }
    }

    pub async fn scan(&self, codes: &[&str]) {
        for code in codes {
            self.ingest.ingest("COM3", code).await;
        }
    }
}

/// Poll `check` until it holds or `within` elapses
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
