//! Upper-computer (programming station) channel
//!
//! Program commands go out as single JSON frames. Batch results come back
//! on the connection's reader task, are decoded there and pushed onto a
//! queue that exactly one drain task consumes, so results reach the
//! `ResultSink` strictly one at a time and in arrival order.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{LineSrvError, Result};
use crate::model::{ProgramCommand, ProgramResult};
use crate::transport::{ConnectionConfig, ConnectionManager, ConnectionState, FrameHandler};
use crate::workflow::ports::ProgrammerLink;

/// Consumer of decoded batch results
#[async_trait]
pub trait ResultSink: Send + Sync + 'static {
    async fn on_result(&self, result: ProgramResult);
}

/// Decode one inbound batch result
pub fn decode_result(frame: &[u8]) -> Result<ProgramResult> {
    let result: ProgramResult = serde_json::from_slice(frame)
        .map_err(|e| LineSrvError::protocol(format!("invalid program result: {}", e)))?;
    if result.batch_id.trim().is_empty() {
        return Err(LineSrvError::protocol("program result without batchId"));
    }
    Ok(result)
}

struct UpperFrameHandler {
    queue: mpsc::UnboundedSender<ProgramResult>,
}

impl FrameHandler for UpperFrameHandler {
    fn on_frame(&self, frame: Bytes) {
        match decode_result(&frame) {
            Ok(result) => {
                debug!(
                    "Upper computer: result for batch {} ({} units)",
                    result.batch_id,
                    result.results.len()
                );
                if self.queue.send(result).is_err() {
                    warn!("Upper computer: result queue closed, dropping result");
                }
            },
            Err(e) => warn!(
                "Upper computer: dropping message: {} ({})",
                e,
                String::from_utf8_lossy(&frame)
            ),
        }
    }

    fn on_connected(&self) {
        info!("Upper computer link up");
    }

    fn on_disconnected(&self) {
        warn!("Upper computer link down");
    }
}

/// Upper-computer link with a serialized result queue
#[derive(Clone)]
pub struct UpperChannel {
    connection: ConnectionManager,
    queue: Arc<Mutex<Option<mpsc::UnboundedReceiver<ProgramResult>>>>,
}

impl UpperChannel {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_queue(config).0
    }

    fn with_queue(config: ConnectionConfig) -> (Self, mpsc::UnboundedSender<ProgramResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(UpperFrameHandler { queue: tx.clone() });
        let channel = Self {
            connection: ConnectionManager::new(config, handler),
            queue: Arc::new(Mutex::new(Some(rx))),
        };
        (channel, tx)
    }

    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Spawn the single drain task feeding `sink`
    ///
    /// May be called once; later calls fail because the queue is already
    /// owned by the running drain.
    pub fn start_drain(
        &self,
        sink: Arc<dyn ResultSink>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let mut rx = self
            .queue
            .lock()
            .take()
            .ok_or_else(|| LineSrvError::internal("result drain already running"))?;

        Ok(tokio::spawn(async move {
            debug!("Upper computer result drain started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(result) => sink.on_result(result).await,
                        None => break,
                    },
                }
            }
            debug!("Upper computer result drain stopped");
        }))
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

impl ProgrammerLink for UpperChannel {
    fn send_program(&self, command: &ProgramCommand) -> Result<()> {
        self.connection.send_json(command)?;
        info!(
            "Program command sent: batch {} with {} barcodes",
            command.batch_id,
            command.barcodes.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ResultSink for RecordingSink {
        async fn on_result(&self, result: ProgramResult) {
            // Slow consumer: a second result must still wait its turn
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.seen.lock().push(result.batch_id);
        }
    }

    #[test]
    fn test_result_without_batch_is_rejected() {
        assert!(decode_result(br#"{"batchId":"  ","results":[]}"#).is_err());
        assert!(decode_result(br#"{"status":"done"}"#).is_err());
        assert!(decode_result(br#"{"batchId":"B1"}"#).is_ok());
    }

    #[tokio::test]
    async fn test_handler_queues_valid_results_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = UpperFrameHandler { queue: tx };

        handler.on_frame(Bytes::from_static(br#"{"batchId":"first"}"#));
        handler.on_frame(Bytes::from_static(b"garbage"));
        handler.on_frame(Bytes::from_static(br#"{"batchId":"second"}"#));

        assert_eq!(rx.recv().await.map(|r| r.batch_id).as_deref(), Some("first"));
        assert_eq!(rx.recv().await.map(|r| r.batch_id).as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_drain_delivers_in_order() {
        let (channel, queue) =
            UpperChannel::with_queue(ConnectionConfig::new("upper_computer", "127.0.0.1", 1));
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        let drain = channel.start_drain(sink.clone(), cancel.clone()).unwrap();

        for id in ["b1", "b2", "b3"] {
            let result = decode_result(format!(r#"{{"batchId":"{}"}}"#, id).as_bytes()).unwrap();
            queue.send(result).unwrap();
        }
        drop(queue);
        channel.connection().shutdown();
        drop(channel);

        drain.await.unwrap();
        assert_eq!(*sink.seen.lock(), vec!["b1", "b2", "b3"]);
    }

    #[tokio::test]
    async fn test_drain_can_only_start_once() {
        let channel = UpperChannel::new(ConnectionConfig::new("upper_computer", "127.0.0.1", 1));
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();

        assert!(channel.start_drain(sink.clone(), cancel.clone()).is_ok());
        assert!(channel.start_drain(sink, cancel.clone()).is_err());
        cancel.cancel();
    }
}
