//! PLC channel
//!
//! Inbound envelopes are `{"type": ..., "data": {...}}`. `product_count`
//! carries `{"count": int, "batch_id": string}`, `start_command` carries no
//! payload. Anything else is published as `PlcEvent::Unknown`.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Envelope, EventBus};
use crate::error::{LineSrvError, Result};
use crate::model::ValidationOutcome;
use crate::transport::{ConnectionConfig, ConnectionManager, ConnectionState, FrameHandler};
use crate::workflow::ports::PlcLink;

pub const PRODUCT_COUNT: &str = "product_count";
pub const START_COMMAND: &str = "start_command";
pub const VALIDATION_RESULT: &str = "validation_result";
pub const UNKNOWN: &str = "unknown";

/// Typed PLC signal
#[derive(Debug, Clone, PartialEq)]
pub enum PlcEvent {
    ProductCount {
        count: u32,
        batch_id: Option<String>,
    },
    StartCommand,
    Unknown {
        kind: String,
        raw: Value,
    },
}

impl PlcEvent {
    pub fn kind(&self) -> &str {
        match self {
            PlcEvent::ProductCount { .. } => PRODUCT_COUNT,
            PlcEvent::StartCommand => START_COMMAND,
            PlcEvent::Unknown { kind, .. } => kind,
        }
    }

    /// Decode one inbound envelope
    pub fn decode(frame: &[u8]) -> Result<Self> {
        #[derive(Deserialize)]
        struct RawEnvelope {
            #[serde(rename = "type")]
            kind: Option<String>,
            #[serde(default)]
            data: Value,
        }

        let raw: Value = serde_json::from_slice(frame)
            .map_err(|e| LineSrvError::protocol(format!("invalid PLC JSON: {}", e)))?;
        let envelope = RawEnvelope::deserialize(&raw)
            .map_err(|e| LineSrvError::protocol(format!("invalid PLC envelope: {}", e)))?;

        match envelope.kind.as_deref() {
            Some(PRODUCT_COUNT) => {
                let count = envelope
                    .data
                    .get("count")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        LineSrvError::protocol("product_count without a non-negative integer count")
                    })?;
                let count = u32::try_from(count)
                    .map_err(|_| LineSrvError::protocol(format!("product count {} out of range", count)))?;
                let batch_id = match envelope.data.get("batch_id") {
                    Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
                    Some(Value::Number(n)) => Some(n.to_string()),
                    _ => None,
                };
                Ok(PlcEvent::ProductCount { count, batch_id })
            },
            Some(START_COMMAND) => Ok(PlcEvent::StartCommand),
            other => Ok(PlcEvent::Unknown {
                kind: other.unwrap_or(UNKNOWN).to_string(),
                raw,
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct ValidationPayload {
    is_valid: bool,
    message: String,
    expected: u32,
    actual: u32,
}

struct PlcFrameHandler {
    bus: Arc<EventBus<PlcEvent>>,
}

impl FrameHandler for PlcFrameHandler {
    fn on_frame(&self, frame: Bytes) {
        match PlcEvent::decode(&frame) {
            Ok(event) => {
                if let PlcEvent::Unknown { kind, .. } = &event {
                    warn!("PLC: unrecognized message type '{}'", kind);
                } else {
                    debug!("PLC: received {}", event.kind());
                }
                let delivered = self.bus.publish(event);
                if delivered == 0 {
                    debug!("PLC: no subscribers for event");
                }
            },
            Err(e) => warn!(
                "PLC: dropping message: {} ({})",
                e,
                String::from_utf8_lossy(&frame)
            ),
        }
    }

    fn on_connected(&self) {
        info!("PLC link up");
    }

    fn on_disconnected(&self) {
        warn!("PLC link down");
    }
}

/// PLC link: decoded events out, validation results and acks in
#[derive(Clone)]
pub struct PlcChannel {
    connection: ConnectionManager,
    bus: Arc<EventBus<PlcEvent>>,
}

impl PlcChannel {
    pub fn new(config: ConnectionConfig) -> Self {
        let bus = Arc::new(EventBus::new());
        let handler = Arc::new(PlcFrameHandler { bus: bus.clone() });
        Self {
            connection: ConnectionManager::new(config, handler),
            bus,
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PlcEvent> {
        self.bus.subscribe()
    }

    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn shutdown(&self) {
        self.connection.shutdown();
    }
}

impl PlcLink for PlcChannel {
    fn send_validation(&self, outcome: &ValidationOutcome) -> Result<()> {
        self.connection.send_json(&Envelope {
            kind: VALIDATION_RESULT,
            data: ValidationPayload {
                is_valid: outcome.is_valid,
                message: outcome.message.clone(),
                expected: outcome.expected_count,
                actual: outcome.actual_count,
            },
        })
    }

    fn send_ack(&self, kind: &str, data: Value) -> Result<()> {
        self.connection.send_json(&Envelope { kind, data })
    }
}
