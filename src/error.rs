//! Error taxonomy for scan requests.
//!
//! Every variant surfaces to the client as a `scan_error` event and leaves the
//! session exactly as it was before the failing request. Network failures of
//! individual probes are not errors here: the prober folds them into a closed
//! outcome.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("InvalidTarget: {0}")]
    InvalidTarget(String),

    #[error("InvalidConfig: {0}")]
    InvalidConfig(String),

    #[error("AlreadyScanning: a scan is already running for this session")]
    AlreadyScanning,

    #[error("NoResumableState: {0}")]
    NoResumableState(String),

    #[error("UnknownSession: {0}")]
    UnknownSession(String),

    #[error("NotRunning: no scan is running for this session")]
    NotRunning,

    #[error("Protocol: {0}")]
    Protocol(String),
}

impl ScanError {
    /// Stable name of the error kind, sent as `kind` in `scan_error`.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::InvalidTarget(_) => "InvalidTarget",
            ScanError::InvalidConfig(_) => "InvalidConfig",
            ScanError::AlreadyScanning => "AlreadyScanning",
            ScanError::NoResumableState(_) => "NoResumableState",
            ScanError::UnknownSession(_) => "UnknownSession",
            ScanError::NotRunning => "NotRunning",
            ScanError::Protocol(_) => "Protocol",
        }
    }
}
