mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use common::{events_until_end, MockProber};
use futures::{SinkExt, StreamExt};
use port_scan_rs::events::ServerEvent;
use port_scan_rs::registry::SessionRegistry;
use port_scan_rs::server::{dispatch, router, AppState};
use port_scan_rs::types::SessionState;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

fn state(prober: &MockProber) -> AppState {
    AppState::new(Arc::new(SessionRegistry::new(prober.shared(), Duration::from_secs(600))))
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, String) {
    let resp = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, headers, String::from_utf8(body.to_vec()).unwrap())
}

const START_1_100: &str = r#"{"event":"start_scan","data":{"ip":"127.0.0.1","start_port":1,"end_port":100,"threads":10,"timeout":1,"resume":false}}"#;

#[tokio::test]
async fn health_is_ok() {
    let app = router(state(&MockProber::default()), Path::new("ui"));
    let (status, _, body) = get(app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, r#"{"status":"ok"}"#);
}

#[tokio::test]
async fn export_of_unknown_session_is_404() {
    let app = router(state(&MockProber::default()), Path::new("ui"));
    let (status, _, body) = get(app.clone(), "/export/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.starts_with("UnknownSession"));

    let (status, _, body) = get(app, "/api/status/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("UnknownSession"));
}

#[tokio::test]
async fn scan_over_events_then_export_csv() {
    let prober = MockProber::new(&[80], Duration::ZERO);
    let app_state = state(&prober);
    let (tx, mut rx) = mpsc::unbounded_channel();

    dispatch(&app_state, "0123456789abcdef", &tx, START_1_100).await.unwrap();
    let events = events_until_end(&mut rx).await;
    assert_eq!(common::found_ports(&events), vec![80]);

    let app = router(app_state, Path::new("ui"));
    let (status, headers, body) = get(app.clone(), "/export/0123456789abcdef").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "port,service,status\n80,http,open\n");
    assert_eq!(headers[header::CONTENT_TYPE], "text/csv; charset=utf-8");
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        "attachment; filename=scan_result_01234567.csv"
    );
    assert_eq!(headers[header::CACHE_CONTROL], "no-store");

    let (status, _, body) = get(app, "/api/status/0123456789abcdef").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["state"], "completed");
    assert_eq!(json["scanned"], 100);
    assert_eq!(json["open_count"], 1);
    assert_eq!(json["progress"], 100);
}

#[tokio::test]
async fn second_start_reports_already_scanning() {
    let prober = MockProber::new(&[], Duration::from_millis(5));
    let app_state = state(&prober);
    let (tx, mut rx) = mpsc::unbounded_channel();

    dispatch(&app_state, "c1", &tx, START_1_100).await.unwrap();
    let err = dispatch(&app_state, "c1", &tx, START_1_100).await.unwrap_err();
    assert_eq!(err.kind(), "AlreadyScanning");
    match ServerEvent::error(&err) {
        ServerEvent::ScanError { kind, message } => {
            assert_eq!(kind, "AlreadyScanning");
            assert!(message.starts_with("AlreadyScanning"));
        }
        other => panic!("unexpected event {other:?}"),
    }

    let events = events_until_end(&mut rx).await;
    assert!(matches!(events.last(), Some(ServerEvent::ScanComplete(_))));
    assert_eq!(prober.probed().len(), 100);
}

#[tokio::test]
async fn stop_and_resume_over_events() {
    let prober = MockProber::new(&[42], Duration::from_millis(5));
    let app_state = state(&prober);
    let (tx, mut rx) = mpsc::unbounded_channel();

    dispatch(&app_state, "c1", &tx, START_1_100).await.unwrap();
    tokio::time::sleep(Duration::from_millis(12)).await;
    dispatch(&app_state, "c1", &tx, r#"{"event":"stop_scan","data":{}}"#).await.unwrap();
    let events = events_until_end(&mut rx).await;
    assert!(matches!(events.last(), Some(ServerEvent::ScanStopped { can_resume: true, .. })));

    dispatch(&app_state, "c1", &tx, r#"{"event":"resume_scan","data":{"threads":"25","timeout":"0.5"}}"#)
        .await
        .unwrap();
    let events = events_until_end(&mut rx).await;
    let Some(ServerEvent::ScanComplete(summary)) = events.last() else {
        panic!("expected scan_complete");
    };
    assert_eq!(summary.open_count, 1);
    assert_eq!(prober.probed().len(), 100);

    let err = dispatch(&app_state, "c1", &tx, r#"{"event":"resume_scan"}"#).await.unwrap_err();
    assert_eq!(err.kind(), "NoResumableState");
}

#[tokio::test]
async fn malformed_frames_are_rejected_without_side_effects() {
    let prober = MockProber::new(&[], Duration::ZERO);
    let app_state = state(&prober);
    let (tx, _rx) = mpsc::unbounded_channel();

    let err = dispatch(&app_state, "c1", &tx, "{oops").await.unwrap_err();
    assert_eq!(err.kind(), "Protocol");
    let err = dispatch(
        &app_state,
        "c1",
        &tx,
        r#"{"event":"start_scan","data":{"ip":"999.1.1.1","start_port":1,"end_port":10}}"#,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "InvalidTarget");
    assert!(prober.probed().is_empty());
    assert!(app_state.registry().is_empty().await);
}

type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_frame(ws: &mut Client) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no frame within 5s")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn websocket_connection_lifecycle() {
    let prober = MockProber::new(&[], Duration::from_millis(5));
    let app_state = state(&prober);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(app_state.clone(), Path::new("ui"));
    tokio::spawn(async move { axum::serve(listener, app).await });

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();

    let first = next_frame(&mut ws).await;
    assert_eq!(first["event"], "connected");
    let sid = first["data"]["sid"].as_str().unwrap().to_string();
    assert!(!sid.is_empty());

    ws.send(Message::text("{oops")).await.unwrap();
    let rejected = next_frame(&mut ws).await;
    assert_eq!(rejected["event"], "scan_error");
    assert_eq!(rejected["data"]["kind"], "Protocol");

    // The connection survives the rejected frame.
    ws.send(Message::text(
        r#"{"event":"start_scan","data":{"ip":"127.0.0.1","start_port":1,"end_port":500,"threads":5,"timeout":1}}"#,
    ))
    .await
    .unwrap();
    let started = loop {
        let frame = next_frame(&mut ws).await;
        assert_ne!(frame["event"], "connected");
        if frame["event"] == "scan_started" {
            break frame;
        }
    };
    assert_eq!(started["data"]["resume"], false);
    assert_eq!(app_state.registry().lookup(&sid).await.unwrap().state(), SessionState::Running);

    ws.close(None).await.unwrap();
    drop(ws);

    let session = app_state.registry().lookup(&sid).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.state() != SessionState::Stopped {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("disconnect did not stop the scan");
    assert!(prober.probed().len() < 500);

    let (status, _, body) = get(router(app_state, Path::new("ui")), &format!("/export/{sid}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "port,service,status\n");
}
