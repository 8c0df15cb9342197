//! Data model shared by the channels and the workflow
//!
//! Wire-facing types use the camelCase field names the programming station
//! and EMS expect. Timestamps are local wall-clock times rendered as
//! `yyyy-MM-dd HH:mm:ss`.

use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// Local wall-clock timestamp
pub type Timestamp = NaiveDateTime;

/// Current local time, truncated to the resolution used on the wire
pub fn now() -> Timestamp {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Serde adapter for `yyyy-MM-dd HH:mm:ss` timestamps
///
/// Deserialization also accepts RFC 3339 strings, `yyyy-MM-ddTHH:mm:ss`
/// and epoch milliseconds, since peers are not consistent about it.
pub mod wire_time {
    use super::Timestamp;
    use chrono::{DateTime, Local, NaiveDateTime};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S>(ts: &Timestamp, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Timestamp, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Millis(i64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => parse(&s).ok_or_else(|| de::Error::custom(format!("invalid timestamp '{}'", s))),
            Raw::Millis(ms) => DateTime::from_timestamp_millis(ms)
                .map(|dt| dt.with_timezone(&Local).naive_local())
                .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {}", ms))),
        }
    }

    pub fn parse(s: &str) -> Option<Timestamp> {
        let s = s.trim();
        NaiveDateTime::parse_from_str(s, FORMAT)
            .ok()
            .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok())
            .or_else(|| {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Local).naive_local())
            })
    }
}

fn default_complete_time() -> Timestamp {
    now()
}

/// One barcode observation tied to a device and capture port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub device_id: String,
    pub barcode: String,
    pub port: String,
    #[serde(with = "wire_time")]
    pub timestamp: Timestamp,
}

impl ScanRecord {
    pub fn new(device_id: impl Into<String>, barcode: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            barcode: barcode.into(),
            port: port.into(),
            timestamp: now(),
        }
    }
}

/// Product count announced by the PLC for the open cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedCount {
    pub value: u32,
    pub batch_id: String,
    #[serde(with = "wire_time")]
    pub received_at: Timestamp,
}

/// Result of comparing the scanned count with the PLC count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub message: String,
    pub expected_count: u32,
    pub actual_count: u32,
    #[serde(with = "wire_time")]
    pub timestamp: Timestamp,
}

impl ValidationOutcome {
    pub const OK: &'static str = "OK";
    pub const MISMATCH: &'static str = "Barcode count mismatch";

    pub fn evaluate(expected: u32, actual: u32) -> Self {
        let is_valid = expected == actual;
        Self {
            is_valid,
            message: if is_valid { Self::OK } else { Self::MISMATCH }.to_string(),
            expected_count: expected,
            actual_count: actual,
            timestamp: now(),
        }
    }
}

/// One barcode entry of a programming batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarcodeEntry {
    pub device_id: String,
    pub barcode: String,
}

/// Batch programming command sent to the upper computer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramCommand {
    pub command: String,
    pub barcodes: Vec<BarcodeEntry>,
    pub batch_id: String,
    #[serde(with = "wire_time")]
    pub send_time: Timestamp,
}

impl ProgramCommand {
    pub const PROGRAM: &'static str = "PROGRAM";

    /// Build a command from scans, preserving scan order
    pub fn from_scans(batch_id: impl Into<String>, scans: &[ScanRecord]) -> Self {
        Self {
            command: Self::PROGRAM.to_string(),
            barcodes: scans
                .iter()
                .map(|s| BarcodeEntry {
                    device_id: s.device_id.clone(),
                    barcode: s.barcode.clone(),
                })
                .collect(),
            batch_id: batch_id.into(),
            send_time: now(),
        }
    }

    pub fn barcode_list(&self) -> Vec<&str> {
        self.barcodes.iter().map(|b| b.barcode.as_str()).collect()
    }
}

/// Programming outcome for a single unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResult {
    #[serde(default)]
    pub device_id: String,
    pub barcode: String,
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Batch result returned by the upper computer, correlated by `batch_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramResult {
    pub batch_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub results: Vec<DeviceResult>,
    #[serde(with = "wire_time", default = "default_complete_time")]
    pub complete_time: Timestamp,
}

impl ProgramResult {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_command_wire_shape() {
        let scans = vec![
            ScanRecord::new("D1", "A1", "COM3"),
            ScanRecord::new("D1", "A2", "COM4"),
        ];
        let cmd = ProgramCommand::from_scans("B-1", &scans);
        let json = serde_json::to_value(&cmd).unwrap();

        assert_eq!(json["command"], "PROGRAM");
        assert_eq!(json["batchId"], "B-1");
        assert_eq!(json["barcodes"][0]["deviceId"], "D1");
        assert_eq!(json["barcodes"][1]["barcode"], "A2");
        assert!(json["sendTime"].as_str().unwrap().len() == 19);
        assert_eq!(cmd.barcode_list(), vec!["A1", "A2"]);
    }

    #[test]
    fn test_program_result_decodes_peer_payload() {
        let raw = r#"{
            "batchId": "X",
            "status": "partial",
            "results": [
                {"deviceId": "D1", "barcode": "A1", "success": true, "errorMessage": null},
                {"deviceId": "D1", "barcode": "A2", "success": false, "errorMessage": "timeout"}
            ],
            "completeTime": "2024-05-01 10:20:30"
        }"#;
        let result: ProgramResult = serde_json::from_str(raw).unwrap();

        assert_eq!(result.batch_id, "X");
        assert_eq!(result.results.len(), 2);
        assert_eq!(result.failed_count(), 1);
        assert!(!result.all_succeeded());
        assert_eq!(result.results[1].error_message.as_deref(), Some("timeout"));
        assert_eq!(
            result.complete_time.format(wire_time::FORMAT).to_string(),
            "2024-05-01 10:20:30"
        );
    }

    #[test]
    fn test_program_result_accepts_other_time_encodings() {
        let iso: ProgramResult =
            serde_json::from_str(r#"{"batchId":"X","completeTime":"2024-05-01T10:20:30"}"#).unwrap();
        assert_eq!(
            iso.complete_time.format(wire_time::FORMAT).to_string(),
            "2024-05-01 10:20:30"
        );

        let millis: ProgramResult =
            serde_json::from_str(r#"{"batchId":"X","completeTime":1714558830000}"#).unwrap();
        assert!(millis.results.is_empty());

        let bad = serde_json::from_str::<ProgramResult>(r#"{"batchId":"X","completeTime":"soon"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_validation_outcome() {
        let ok = ValidationOutcome::evaluate(3, 3);
        assert!(ok.is_valid);
        assert_eq!(ok.message, "OK");

        let bad = ValidationOutcome::evaluate(3, 2);
        assert!(!bad.is_valid);
        assert_eq!(bad.expected_count, 3);
        assert_eq!(bad.actual_count, 2);
    }
}
