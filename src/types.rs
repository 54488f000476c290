use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

/// Upper bound on concurrent probes per scan, whatever the client asks for.
pub const MAX_CONCURRENCY: usize = 500;
/// Longest accepted per-probe timeout; larger values are clamped.
pub const MAX_TIMEOUT_SECS: f64 = 60.0;

/// Host and inclusive port range of one scan.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub host: Ipv4Addr,
    pub start_port: u16,
    pub end_port: u16,
}

impl Target {
    /// Validate raw client input into a target.
    ///
    /// The host must be a dotted-quad IPv4 address and both ports must lie in
    /// 1..=65535 with `start <= end`.
    pub fn parse(host: &str, start_port: i64, end_port: i64) -> Result<Self> {
        let host: Ipv4Addr = host
            .trim()
            .parse()
            .map_err(|_| ScanError::InvalidTarget(format!("invalid IPv4 address: {host:?}")))?;
        let start_port = checked_port(start_port)?;
        let end_port = checked_port(end_port)?;
        if start_port > end_port {
            return Err(ScanError::InvalidTarget(format!(
                "start port {start_port} is greater than end port {end_port}"
            )));
        }
        Ok(Self { host, start_port, end_port })
    }

    pub fn ports(&self) -> RangeInclusive<u16> {
        self.start_port..=self.end_port
    }

    pub fn total_ports(&self) -> usize {
        usize::from(self.end_port - self.start_port) + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ports().contains(&port)
    }
}

fn checked_port(value: i64) -> Result<u16> {
    if (1..=65535).contains(&value) {
        Ok(value as u16)
    } else {
        Err(ScanError::InvalidTarget(format!(
            "port {value} is outside 1-65535"
        )))
    }
}

/// Per-run probing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanConfig {
    pub concurrency: usize,
    pub timeout: Duration,
}

impl ScanConfig {
    /// Build a config from client values.
    ///
    /// Concurrency is clamped into `1..=MAX_CONCURRENCY`. The timeout must be
    /// a finite number of seconds no shorter than one nanosecond, and is
    /// clamped to `MAX_TIMEOUT_SECS`.
    pub fn from_request(threads: i64, timeout_secs: f64) -> Result<Self> {
        if !timeout_secs.is_finite() || timeout_secs <= 0.0 {
            return Err(ScanError::InvalidConfig(format!(
                "timeout must be a positive number of seconds, got {timeout_secs}"
            )));
        }
        let concurrency = threads.clamp(1, MAX_CONCURRENCY as i64) as usize;
        let timeout = Duration::from_secs_f64(timeout_secs.min(MAX_TIMEOUT_SECS));
        if timeout.is_zero() {
            return Err(ScanError::InvalidConfig(format!(
                "timeout {timeout_secs}s is too short"
            )));
        }
        Ok(Self { concurrency, timeout })
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrency: 50,
            timeout: Duration::from_secs(1),
        }
    }
}

/// Outcome of one probed port, as reported to the client and exported.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortResult {
    pub port: u16,
    pub is_open: bool,
    pub service: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    Completed,
    Stopped,
}
