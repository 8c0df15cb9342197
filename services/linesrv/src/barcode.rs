//! Barcode ingest
//!
//! Scanner input arrives as CR/LF-terminated lines on one or more serial
//! ports. Each non-empty line is handed to the `ScanSink`, which assigns it
//! to a device and buffers it in arrival order. No validation happens here.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{LineSrvError, Result};
use crate::model::ScanRecord;
use crate::runtime::retry::{retry, RetryError, RetryPolicy};
use crate::transport::ScanLineCodec;

/// Per-device scan buffers plus the active device selection
///
/// Safe for concurrent appends and size queries from several ports.
#[derive(Debug, Default)]
pub struct ScanBuffer {
    devices: DashMap<String, Vec<ScanRecord>>,
    active: RwLock<Option<String>>,
}

impl ScanBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append in scan order, returning the device's new count
    pub fn append(&self, record: ScanRecord) -> usize {
        let mut scans = self.devices.entry(record.device_id.clone()).or_default();
        scans.push(record);
        scans.len()
    }

    pub fn len(&self, device_id: &str) -> usize {
        self.devices.get(device_id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, device_id: &str) -> bool {
        self.len(device_id) == 0
    }

    pub fn snapshot(&self, device_id: &str) -> Vec<ScanRecord> {
        self.devices
            .get(device_id)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    pub fn barcodes(&self, device_id: &str) -> Vec<String> {
        self.devices
            .get(device_id)
            .map(|s| s.iter().map(|r| r.barcode.clone()).collect())
            .unwrap_or_default()
    }

    /// Drop a device's scans, returning how many were removed
    pub fn clear(&self, device_id: &str) -> usize {
        self.devices
            .remove(device_id)
            .map(|(_, scans)| scans.len())
            .unwrap_or(0)
    }

    /// Drop every device's scans and the active selection
    pub fn clear_all(&self) -> usize {
        let dropped = self.devices.iter().map(|s| s.len()).sum();
        self.devices.clear();
        self.clear_active_device();
        dropped
    }

    pub fn active_device(&self) -> Option<String> {
        self.active.read().clone()
    }

    pub fn set_active_device(&self, device_id: impl Into<String>) {
        *self.active.write() = Some(device_id.into());
    }

    pub fn clear_active_device(&self) {
        self.active.write().take();
    }

    /// Deselect `device_id` if it is the active device
    pub fn release_device(&self, device_id: &str) {
        let mut active = self.active.write();
        if active.as_deref() == Some(device_id) {
            *active = None;
        }
    }
}

/// Receives every non-blank scan
///
/// The sink decides which device the scan belongs to and whether it is
/// buffered, so assignment and buffering happen together with the workflow
/// step that observes the scan.
#[async_trait]
pub trait ScanSink: Send + Sync + 'static {
    async fn on_scan(&self, port: &str, barcode: &str) -> Option<ScanRecord>;
}

/// Serial port definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialPortConfig {
    pub name: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    9600
}

/// Turns raw scanner lines into `ScanRecord`s
pub struct BarcodeIngest {
    sink: Arc<dyn ScanSink>,
}

impl BarcodeIngest {
    pub fn new(sink: Arc<dyn ScanSink>) -> Self {
        Self { sink }
    }

    /// Record one scan from `port`; blank input is ignored
    pub async fn ingest(&self, port: &str, raw: &str) -> Option<ScanRecord> {
        let barcode = raw.trim();
        if barcode.is_empty() {
            return None;
        }

        let record = self.sink.on_scan(port, barcode).await?;
        info!("Scan on {}: {} (device {})", port, record.barcode, record.device_id);
        Some(record)
    }

    /// Feed every line of `reader` into `ingest` until EOF, error or cancel
    pub async fn run_source<R>(&self, port: &str, reader: R, cancel: CancellationToken) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = FramedRead::new(reader, ScanLineCodec::new());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = lines.next() => match next {
                    Some(Ok(line)) => {
                        self.ingest(port, &line).await;
                    },
                    Some(Err(e)) => return Err(e),
                    None => {
                        debug!("Scanner source {} reached EOF", port);
                        return Ok(());
                    },
                },
            }
        }
    }

    /// Open a serial scanner and ingest from it, reopening after failures
    pub fn spawn_serial(
        self: &Arc<Self>,
        port: SerialPortConfig,
        reopen: RetryPolicy,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let ingest = self.clone();
        tokio::spawn(async move {
            let label = format!("serial scanner {}", port.name);
            let outcome: std::result::Result<(), RetryError> =
                retry(&reopen, &cancel, &label, |_| {
                    let ingest = ingest.clone();
                    let port = port.clone();
                    let cancel = cancel.clone();
                    async move {
                        let stream = tokio_serial::new(&port.name, port.baud_rate)
                            .open_native_async()
                            .map_err(LineSrvError::from)?;
                        info!("Serial scanner {} opened at {} baud", port.name, port.baud_rate);

                        ingest.run_source(&port.name, stream, cancel.clone()).await?;
                        if cancel.is_cancelled() {
                            Ok(())
                        } else {
                            Err(LineSrvError::transport(format!("{} closed", port.name)))
                        }
                    }
                })
                .await;

            match outcome {
                Ok(()) | Err(RetryError::Cancelled) => debug!("{} stopped", label),
                Err(e) => error!("{}", e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        seen: Mutex<Vec<ScanRecord>>,
    }

    #[async_trait]
    impl ScanSink for CollectingSink {
        async fn on_scan(&self, port: &str, barcode: &str) -> Option<ScanRecord> {
            if barcode.starts_with("NOREAD") {
                return None;
            }
            let record = ScanRecord::new("D1", barcode, port);
            self.seen.lock().push(record.clone());
            Some(record)
        }
    }

    #[test]
    fn test_buffer_keeps_scan_order_per_device() {
        let buffer = ScanBuffer::new();
        buffer.append(ScanRecord::new("D1", "A1", "COM3"));
        buffer.append(ScanRecord::new("D2", "B1", "COM4"));
        buffer.append(ScanRecord::new("D1", "A2", "COM4"));

        assert_eq!(buffer.barcodes("D1"), vec!["A1", "A2"]);
        assert_eq!(buffer.len("D2"), 1);
        assert_eq!(buffer.clear("D1"), 2);
        assert!(buffer.is_empty("D1"));
        assert_eq!(buffer.len("D2"), 1);
    }

    #[test]
    fn test_clear_all_drops_every_device_and_selection() {
        let buffer = ScanBuffer::new();
        buffer.set_active_device("D2");
        buffer.append(ScanRecord::new("D1", "A1", "COM3"));
        buffer.append(ScanRecord::new("D2", "B1", "COM3"));
        buffer.append(ScanRecord::new("D2", "B2", "COM3"));

        assert_eq!(buffer.clear_all(), 3);
        assert!(buffer.is_empty("D1"));
        assert!(buffer.is_empty("D2"));
        assert!(buffer.active_device().is_none());
        assert_eq!(buffer.clear_all(), 0);
    }

    #[test]
    fn test_active_device_selection() {
        let buffer = ScanBuffer::new();
        assert!(buffer.active_device().is_none());

        buffer.set_active_device("D9");
        buffer.release_device("OTHER");
        assert_eq!(buffer.active_device().as_deref(), Some("D9"));
        buffer.release_device("D9");
        assert!(buffer.active_device().is_none());

        buffer.set_active_device("D3");
        buffer.clear_active_device();
        assert!(buffer.active_device().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_appends_from_multiple_ports() {
        let buffer = Arc::new(ScanBuffer::new());
        let mut handles = Vec::new();
        for port in 0..4 {
            let buffer = buffer.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    buffer.append(ScanRecord::new("D1", format!("P{}-{}", port, i), format!("COM{}", port)));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(buffer.len("D1"), 100);
    }

    #[tokio::test]
    async fn test_source_lines_become_scans() {
        let sink = Arc::new(CollectingSink::default());
        let ingest = BarcodeIngest::new(sink.clone());

        let input: &[u8] = b"A1\r\n  \r\nA2\rA3";
        ingest
            .run_source("COM3", input, CancellationToken::new())
            .await
            .unwrap();

        let seen = sink.seen.lock();
        let barcodes: Vec<&str> = seen.iter().map(|r| r.barcode.as_str()).collect();
        assert_eq!(barcodes, vec!["A1", "A2", "A3"]);
        assert!(seen.iter().all(|r| r.port == "COM3"));
    }

    #[tokio::test]
    async fn test_blank_scan_is_ignored() {
        let sink = Arc::new(CollectingSink::default());
        let ingest = BarcodeIngest::new(sink.clone());

        assert!(ingest.ingest("COM3", "   ").await.is_none());
        assert!(sink.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_declined_scan_returns_none() {
        let sink = Arc::new(CollectingSink::default());
        let ingest = BarcodeIngest::new(sink.clone());

        assert!(ingest.ingest("COM3", " NOREAD ").await.is_none());
        let record = ingest.ingest("COM4", " A1 ").await.unwrap();
        assert_eq!(record.barcode, "A1");
        assert_eq!(record.port, "COM4");
    }
}
