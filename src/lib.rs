//! Library crate for port-scan-rs: a resumable TCP port scanning engine with a
//! live event stream and CSV export.
pub mod config;
pub mod error;
pub mod events;
pub mod export;
pub mod ports;
pub mod prober;
pub mod registry;
pub mod scanner;
pub mod server;
pub mod session;
pub mod types;
