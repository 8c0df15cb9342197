//! PLC and upper-computer channels against loopback peers

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use common::eventually;
use linesrv::channels::{PlcChannel, PlcEvent, ResultSink, UpperChannel};
use linesrv::model::{ProgramCommand, ProgramResult, ScanRecord, ValidationOutcome};
use linesrv::runtime::RetryPolicy;
use linesrv::transport::{ConnectionConfig, ConnectionState};
use linesrv::workflow::{PlcLink, ProgrammerLink};

const WAIT: Duration = Duration::from_secs(5);

async fn listener() -> (TcpListener, ConnectionConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut config = ConnectionConfig::new("test", "127.0.0.1", port);
    config.connect_timeout = Duration::from_secs(1);
    config.reconnect = RetryPolicy::fixed(Duration::from_millis(50));
    (listener, config)
}

async fn accept(listener: &TcpListener) -> TcpStream {
    timeout(WAIT, listener.accept()).await.unwrap().unwrap().0
}

async fn next_event(rx: &mut tokio::sync::mpsc::UnboundedReceiver<PlcEvent>) -> PlcEvent {
    timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_plc_events_survive_split_and_malformed_frames() {
    let (listener, config) = listener().await;
    let plc = PlcChannel::new(config);
    let mut events = plc.subscribe();

    plc.connect().await.unwrap();
    let mut peer = accept(&listener).await;
    assert!(plc.is_connected());

    peer.write_all(br#"{"type":"product_count","data":{"count":3,"batch_id":"B7"}}{"type":"sta"#)
        .await
        .unwrap();
    peer.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    peer.write_all(b"rt_command\"}\n{\"type\": oops}\n{\"type\":\"heartbeat\",\"data\":{}}\n")
        .await
        .unwrap();

    assert_eq!(
        next_event(&mut events).await,
        PlcEvent::ProductCount {
            count: 3,
            batch_id: Some("B7".to_string())
        }
    );
    assert_eq!(next_event(&mut events).await, PlcEvent::StartCommand);
    match next_event(&mut events).await {
        PlcEvent::Unknown { kind, .. } => assert_eq!(kind, "heartbeat"),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(plc.is_connected());
    plc.shutdown();
}

#[tokio::test]
async fn test_plc_receives_validation_result_frame() {
    let (listener, config) = listener().await;
    let plc = PlcChannel::new(config);
    plc.connect().await.unwrap();
    let peer = accept(&listener).await;

    plc.send_validation(&ValidationOutcome::evaluate(3, 2)).unwrap();
    plc.send_ack("barcode_verified", serde_json::json!({"status": "error"}))
        .unwrap();

    let mut lines = BufReader::new(peer).lines();
    let first: Value =
        serde_json::from_str(&timeout(WAIT, lines.next_line()).await.unwrap().unwrap().unwrap())
            .unwrap();
    assert_eq!(first["type"], "validation_result");
    assert_eq!(first["data"]["is_valid"], false);
    assert_eq!(first["data"]["message"], "Barcode count mismatch");
    assert_eq!(first["data"]["expected"], 3);
    assert_eq!(first["data"]["actual"], 2);

    let second: Value =
        serde_json::from_str(&timeout(WAIT, lines.next_line()).await.unwrap().unwrap().unwrap())
            .unwrap();
    assert_eq!(second["type"], "barcode_verified");
    assert_eq!(second["data"]["status"], "error");

    assert_eq!(plc.connection().stats().frames_sent, 2);
    plc.shutdown();
}

#[tokio::test]
async fn test_reconnects_after_peer_closes() {
    let (listener, config) = listener().await;
    let plc = PlcChannel::new(config);
    let mut events = plc.subscribe();
    plc.connect().await.unwrap();

    let first = accept(&listener).await;
    drop(first);

    // The manager notices the close and dials again on its own
    let mut second = accept(&listener).await;
    let connection = plc.connection().clone();
    assert!(eventually(WAIT, || connection.is_connected()).await);
    assert_eq!(connection.stats().successful_connects, 2);
    assert!(connection.stats().disconnects >= 1);

    second
        .write_all(b"{\"type\":\"start_command\"}\n")
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, PlcEvent::StartCommand);
    plc.shutdown();
}

#[tokio::test]
async fn test_failed_connect_keeps_retrying_until_peer_appears() {
    // Reserve a port, then free it so the first dial is refused
    let (listener, config) = listener().await;
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let plc = PlcChannel::new(config);
    assert!(plc.connect().await.is_err());
    assert!(plc.send_ack("ping", Value::Null).is_err());

    let listener = TcpListener::bind(addr).await.unwrap();
    let _peer = accept(&listener).await;
    let connection = plc.connection().clone();
    assert!(eventually(WAIT, || connection.is_connected()).await);
    assert!(connection.stats().connect_attempts >= 2);

    plc.shutdown();
    plc.shutdown();
    assert_eq!(plc.state(), ConnectionState::Disconnected);
    assert!(plc.connect().await.is_err());
}

#[tokio::test]
async fn test_oversized_frame_is_dropped_and_session_survives() {
    let (listener, mut config) = listener().await;
    config.max_frame_length = 64;
    let plc = PlcChannel::new(config);
    let mut events = plc.subscribe();
    plc.connect().await.unwrap();
    let mut peer = accept(&listener).await;

    let mut oversized = b"{\"type\":\"product_count\",\"data\":\"".to_vec();
    oversized.extend_from_slice(&[b'x'; 200]);
    peer.write_all(&oversized).await.unwrap();
    peer.write_all(b"{\"type\":\"start_command\"}\n").await.unwrap();

    assert_eq!(next_event(&mut events).await, PlcEvent::StartCommand);
    assert!(plc.is_connected());
    assert_eq!(plc.connection().stats().disconnects, 0);
    plc.shutdown();
}

#[tokio::test]
async fn test_connect_during_pending_reconnect_opens_one_session() {
    let (listener, mut config) = listener().await;
    config.reconnect = RetryPolicy::fixed(Duration::from_millis(300));
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let plc = PlcChannel::new(config);
    assert!(plc.connect().await.is_err());

    // The re-dial loop is now sleeping; an explicit connect wins the race
    let listener = TcpListener::bind(addr).await.unwrap();
    plc.connect().await.unwrap();
    let _first = accept(&listener).await;

    let second = timeout(Duration::from_millis(900), listener.accept()).await;
    assert!(second.is_err(), "a second session was opened");
    assert!(plc.is_connected());
    assert_eq!(plc.connection().stats().successful_connects, 1);
    plc.shutdown();
}

#[derive(Default)]
struct RecordingSink {
    results: Mutex<Vec<ProgramResult>>,
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn on_result(&self, result: ProgramResult) {
        self.results.lock().push(result);
    }
}

#[tokio::test]
async fn test_upper_computer_round_trip() {
    let (listener, config) = listener().await;
    let upper = UpperChannel::new(config);
    let sink = Arc::new(RecordingSink::default());
    let cancel = CancellationToken::new();
    let drain = upper.start_drain(sink.clone(), cancel.clone()).unwrap();

    upper.connect().await.unwrap();
    let peer = accept(&listener).await;
    let (read_half, mut write_half) = peer.into_split();

    let scans = vec![
        ScanRecord::new("D1", "A1", "COM3"),
        ScanRecord::new("D1", "A2", "COM4"),
    ];
    upper
        .send_program(&ProgramCommand::from_scans("B1", &scans))
        .unwrap();

    let mut lines = BufReader::new(read_half).lines();
    let line = timeout(WAIT, lines.next_line()).await.unwrap().unwrap().unwrap();
    let command: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(command["command"], "PROGRAM");
    assert_eq!(command["batchId"], "B1");
    assert_eq!(command["barcodes"][0]["deviceId"], "D1");
    assert_eq!(command["barcodes"][1]["barcode"], "A2");
    assert!(command["sendTime"].as_str().unwrap().len() == 19);

    // Two results in one write, plus one without a batch id
    write_half
        .write_all(
            concat!(
                r#"{"batchId":"B1","status":"completed","results":[{"deviceId":"D1","barcode":"A1","success":true,"errorMessage":null},{"deviceId":"D1","barcode":"A2","success":false,"errorMessage":"timeout"}],"completeTime":"2024-05-01 10:00:00"}"#,
                r#"{"batchId":"","results":[]}"#,
                r#"{"batchId":"B2","status":"completed","results":[],"completeTime":"2024-05-01 10:00:05"}"#,
                "\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let recorded = sink.clone();
    assert!(eventually(WAIT, || recorded.results.lock().len() == 2).await);
    let results = sink.results.lock().clone();
    assert_eq!(results[0].batch_id, "B1");
    assert_eq!(results[0].failed_count(), 1);
    assert_eq!(results[1].batch_id, "B2");

    cancel.cancel();
    drain.await.unwrap();
    upper.shutdown();
}
