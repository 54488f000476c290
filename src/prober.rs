use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time;

/// Classified result of a single connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub open: bool,
    /// Why the port was classified as closed (refused, timed out, unreachable).
    pub diagnostic: Option<String>,
}

impl ProbeOutcome {
    pub fn open() -> Self {
        Self { open: true, diagnostic: None }
    }

    pub fn closed(diagnostic: impl Into<String>) -> Self {
        Self {
            open: false,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

pub type ProbeFuture = Pin<Box<dyn Future<Output = ProbeOutcome> + Send + 'static>>;

/// One connect attempt against a single address.
///
/// Implementations never fail: every network condition maps to a closed
/// outcome.
pub trait Prober: Send + Sync + 'static {
    fn probe(&self, addr: SocketAddr, timeout: Duration) -> ProbeFuture;
}

/// Plain TCP connect prober.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

impl Prober for TcpProber {
    fn probe(&self, addr: SocketAddr, timeout: Duration) -> ProbeFuture {
        Box::pin(async move {
            match time::timeout(timeout, TcpStream::connect(addr)).await {
                // The stream is dropped right away, closing the connection.
                Ok(Ok(_stream)) => ProbeOutcome::open(),
                Ok(Err(e)) => {
                    tracing::trace!(%addr, error = %e, "connect failed");
                    ProbeOutcome::closed(e.to_string())
                }
                Err(_) => ProbeOutcome::closed("timed out"),
            }
        })
    }
}
