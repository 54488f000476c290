//! Wire messages exchanged with the UI over the event connection.
//!
//! Every frame is a JSON object `{"event": <name>, "data": {...}}`.

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::types::PortResult;

/// Core-to-client notifications.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        sid: String,
    },
    ScanStarted {
        message: String,
        resume: bool,
    },
    ScanProgress {
        progress: u8,
        scanned: usize,
        total: usize,
        open_count: usize,
    },
    PortFound {
        port: u16,
        service: String,
        status: String,
    },
    ScanComplete(ScanSummary),
    ScanStopped {
        message: String,
        can_resume: bool,
    },
    ScanError {
        kind: String,
        message: String,
    },
}

impl ServerEvent {
    pub fn error(err: &ScanError) -> Self {
        ServerEvent::ScanError {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::ScanStarted { .. } => "scan_started",
            ServerEvent::ScanProgress { .. } => "scan_progress",
            ServerEvent::PortFound { .. } => "port_found",
            ServerEvent::ScanComplete(_) => "scan_complete",
            ServerEvent::ScanStopped { .. } => "scan_stopped",
            ServerEvent::ScanError { .. } => "scan_error",
        }
    }
}

/// Payload of `scan_complete`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanSummary {
    pub message: String,
    pub total_ports: usize,
    pub open_count: usize,
    pub open_ports: Vec<PortResult>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// Client-to-core requests.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StartScan(StartScanRequest),
    ResumeScan(ResumeScanRequest),
    StopScan,
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl ClientEvent {
    /// Decode one text frame. Unknown events and malformed payloads are
    /// protocol errors.
    pub fn parse(text: &str) -> Result<Self, ScanError> {
        let env: Envelope = serde_json::from_str(text)
            .map_err(|e| ScanError::Protocol(format!("malformed frame: {e}")))?;
        match env.event.as_str() {
            "start_scan" => Ok(ClientEvent::StartScan(payload(&env.event, env.data)?)),
            "resume_scan" => Ok(ClientEvent::ResumeScan(payload(&env.event, env.data)?)),
            "stop_scan" => Ok(ClientEvent::StopScan),
            other => Err(ScanError::Protocol(format!("unknown event: {other}"))),
        }
    }
}

fn payload<T: DeserializeOwned + Default>(event: &str, data: serde_json::Value) -> Result<T, ScanError> {
    if data.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(data)
        .map_err(|e| ScanError::Protocol(format!("invalid {event} payload: {e}")))
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StartScanRequest {
    pub ip: String,
    #[serde(deserialize_with = "lenient_int")]
    pub start_port: i64,
    #[serde(deserialize_with = "lenient_int")]
    pub end_port: i64,
    #[serde(deserialize_with = "lenient_int")]
    pub threads: i64,
    #[serde(deserialize_with = "lenient_float")]
    pub timeout: f64,
    pub resume: bool,
}

impl Default for StartScanRequest {
    fn default() -> Self {
        Self {
            ip: String::new(),
            start_port: 1,
            end_port: 65535,
            threads: 20,
            timeout: 1.0,
            resume: false,
        }
    }
}

/// Missing fields keep the values of the interrupted run.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ResumeScanRequest {
    #[serde(deserialize_with = "lenient_opt_int")]
    pub threads: Option<i64>,
    #[serde(deserialize_with = "lenient_opt_float")]
    pub timeout: Option<f64>,
}

// Form fields may arrive as JSON numbers or as numeric strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum Numeric {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Numeric {
    fn as_f64<E: de::Error>(&self) -> Result<f64, E> {
        match self {
            Numeric::Int(i) => Ok(*i as f64),
            Numeric::Float(f) => Ok(*f),
            Numeric::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("not a number: {s:?}"))),
        }
    }

    fn as_i64<E: de::Error>(&self) -> Result<i64, E> {
        match self {
            Numeric::Int(i) => Ok(*i),
            Numeric::Float(f) if f.fract() == 0.0 && f.is_finite() => Ok(*f as i64),
            Numeric::Float(f) => Err(E::custom(format!("not an integer: {f}"))),
            Numeric::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("not an integer: {s:?}"))),
        }
    }
}

fn lenient_int<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    Numeric::deserialize(d)?.as_i64()
}

fn lenient_float<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    Numeric::deserialize(d)?.as_f64()
}

fn lenient_opt_int<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    Option::<Numeric>::deserialize(d)?.map(|n| n.as_i64()).transpose()
}

fn lenient_opt_float<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Option::<Numeric>::deserialize(d)?.map(|n| n.as_f64()).transpose()
}
