//! Service assembly and lifecycle
//!
//! `LineService::build` wires every component exactly once. `start` brings
//! the long-running tasks up, `shutdown` tears them down again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::barcode::{BarcodeIngest, ScanBuffer};
use crate::channels::{PlcChannel, UpperChannel};
use crate::config::AppConfig;
use crate::ems::EmsReporter;
use crate::error::Result;
use crate::persistence::Persistence;
use crate::runtime::retry::RetryPolicy;
use crate::workflow::{spawn_watchdog, Collaborators, Orchestrator};

/// Time given to in-flight EMS requests at shutdown
pub const EMS_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct LineService {
    config: AppConfig,
    buffer: Arc<ScanBuffer>,
    plc: PlcChannel,
    upper: UpperChannel,
    ems: EmsReporter,
    orchestrator: Arc<Orchestrator>,
    ingest: Arc<BarcodeIngest>,
    shutdown_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl LineService {
    pub fn build(config: AppConfig, persistence: Arc<dyn Persistence>) -> Result<Self> {
        let buffer = Arc::new(ScanBuffer::new());
        let plc = PlcChannel::new(config.plc.connection_config("plc"));
        let upper = UpperChannel::new(config.upper_computer.connection_config("upper_computer"));
        let ems = EmsReporter::new(config.ems.ems_config())?;

        let orchestrator = Arc::new(Orchestrator::new(
            Collaborators {
                buffer: buffer.clone(),
                plc: Arc::new(plc.clone()),
                programmer: Arc::new(upper.clone()),
                reporter: Arc::new(ems.clone()),
                persistence,
            },
            config.barcode.default_device_id.clone(),
        ));

        let ingest = Arc::new(BarcodeIngest::new(orchestrator.clone()));

        Ok(Self {
            config,
            buffer,
            plc,
            upper,
            ems,
            orchestrator,
            ingest,
            shutdown_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Connect both peers and spawn the background tasks
    ///
    /// Connection failures are logged; the channels keep reconnecting.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("linesrv already started");
            return Ok(());
        }

        let cancel = self.shutdown_token.clone();
        let mut tasks = Vec::new();

        // Subscribe before connecting so no early PLC message is lost
        let plc_events = self.plc.subscribe();
        tasks.push(tokio::spawn(
            self.orchestrator.clone().run_plc_events(plc_events, cancel.clone()),
        ));
        tasks.push(
            self.upper
                .start_drain(self.orchestrator.clone(), cancel.clone())?,
        );

        if let Err(e) = self.plc.connect().await {
            warn!("PLC not reachable yet: {}", e);
        }
        if let Err(e) = self.upper.connect().await {
            warn!("Upper computer not reachable yet: {}", e);
        }

        let reopen = RetryPolicy::fixed(Duration::from_millis(
            self.config.barcode.reopen_delay_ms.max(1),
        ));
        for port in &self.config.barcode.ports {
            info!("Starting scanner on {} ({} baud)", port.name, port.baud_rate);
            tasks.push(
                self.ingest
                    .spawn_serial(port.clone(), reopen.clone(), cancel.clone()),
            );
        }

        if let Some(watchdog) = spawn_watchdog(
            self.orchestrator.clone(),
            self.config.workflow.stall_limits(),
            self.config.workflow.watchdog_interval(),
            cancel.clone(),
        ) {
            tasks.push(watchdog);
        }

        info!(
            "linesrv started: PLC {}, upper computer {}, EMS {}, {} scanner port(s)",
            self.plc.connection().address(),
            self.upper.connection().address(),
            self.ems.url(),
            self.config.barcode.ports.len()
        );
        self.tasks.lock().extend(tasks);
        Ok(())
    }

    /// Cancel every task and close both connections; safe to call twice
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("linesrv shutting down");

        self.shutdown_token.cancel();
        self.plc.shutdown();
        self.upper.shutdown();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Task ended abnormally during shutdown: {}", e);
                }
            }
        }

        self.ems.shutdown(EMS_SHUTDOWN_GRACE).await;
        info!("linesrv stopped");
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn buffer(&self) -> &Arc<ScanBuffer> {
        &self.buffer
    }

    pub fn plc(&self) -> &PlcChannel {
        &self.plc
    }

    pub fn upper(&self) -> &UpperChannel {
        &self.upper
    }

    pub fn ems(&self) -> &EmsReporter {
        &self.ems
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn ingest(&self) -> &Arc<BarcodeIngest> {
        &self.ingest
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
