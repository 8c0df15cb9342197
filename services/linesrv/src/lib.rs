//! Production Line Orchestration Service (linesrv)
//!
//! Coordinates one automated programming line:
//!
//! - **Scanners**: barcodes arrive on serial ports and are buffered per device
//! - **PLC**: reports the product count and issues the start command over a
//!   JSON/TCP link; receives the validation verdict
//! - **Upper computer**: receives the program command and answers with
//!   per-unit results
//! - **EMS**: receives every finished batch over HTTP, retried until accepted
//!
//! ```text
//! ┌──────────┐   scans    ┌──────────────┐  program   ┌────────────────┐
//! │ Scanners │──────────►│              │──────────►│ Upper computer │
//! └──────────┘           │ Orchestrator │◄──────────│                │
//! ┌──────────┐  count /  │  (workflow)  │  results   └────────────────┘
//! │   PLC    │◄────────►│              │──────────► EMS (HTTP)
//! └──────────┘  verdict  └──────────────┘
//! ```
//!
//! `service::LineService` assembles the components; `api` exposes status
//! and operator control.

pub mod api;
pub mod barcode;
pub mod bootstrap;
pub mod channels;
pub mod config;
pub mod ems;
pub mod error;
pub mod model;
pub mod persistence;
pub mod runtime;
pub mod service;
pub mod transport;
pub mod workflow;

pub use config::AppConfig;
pub use error::{LineSrvError, Result};
pub use service::LineService;
