#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use port_scan_rs::events::{ServerEvent, StartScanRequest};
use port_scan_rs::prober::{ProbeFuture, ProbeOutcome, Prober};
use tokio::sync::mpsc::UnboundedReceiver;

/// In-memory prober: a fixed set of open ports, an optional per-probe delay,
/// and a record of every probe attempt.
#[derive(Clone, Default)]
pub struct MockProber {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    open: HashSet<u16>,
    panic_on: HashSet<u16>,
    delay: Duration,
    probed: Mutex<Vec<u16>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockProber {
    pub fn new(open: &[u16], delay: Duration) -> Self {
        Self::panicking_on(open, delay, &[])
    }

    pub fn panicking_on(open: &[u16], delay: Duration, panic_on: &[u16]) -> Self {
        Self {
            inner: Arc::new(Inner {
                open: open.iter().copied().collect(),
                panic_on: panic_on.iter().copied().collect(),
                delay,
                ..Inner::default()
            }),
        }
    }

    pub fn shared(&self) -> Arc<dyn Prober> {
        Arc::new(self.clone())
    }

    /// Every port probed so far, in dispatch order.
    pub fn probed(&self) -> Vec<u16> {
        self.inner.probed.lock().unwrap().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }
}

impl Prober for MockProber {
    fn probe(&self, addr: SocketAddr, _timeout: Duration) -> ProbeFuture {
        let inner = self.inner.clone();
        Box::pin(async move {
            let port = addr.port();
            inner.probed.lock().unwrap().push(port);
            let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            inner.peak.fetch_max(now, Ordering::SeqCst);
            if inner.delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(inner.delay).await;
            }
            inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            if inner.panic_on.contains(&port) {
                panic!("probe exploded on port {port}");
            }
            if inner.open.contains(&port) {
                ProbeOutcome::open()
            } else {
                ProbeOutcome::closed("connection refused")
            }
        })
    }
}

pub fn start_request(ip: &str, start: i64, end: i64, threads: i64) -> StartScanRequest {
    StartScanRequest {
        ip: ip.to_string(),
        start_port: start,
        end_port: end,
        threads,
        timeout: 1.0,
        resume: false,
    }
}

pub fn is_terminal(event: &ServerEvent) -> bool {
    matches!(
        event,
        ServerEvent::ScanComplete(_) | ServerEvent::ScanStopped { .. }
    )
}

/// Receive events until the run ends with `scan_complete` or `scan_stopped`.
pub async fn events_until_end(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut out = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("scan did not finish in time")
            .expect("event channel closed");
        let done = is_terminal(&event);
        out.push(event);
        if done {
            return out;
        }
    }
}

pub fn progress_events(events: &[ServerEvent]) -> Vec<(u8, usize, usize)> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::ScanProgress { progress, scanned, total, .. } => {
                Some((*progress, *scanned, *total))
            }
            _ => None,
        })
        .collect()
}

pub fn found_ports(events: &[ServerEvent]) -> Vec<u16> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::PortFound { port, .. } => Some(*port),
            _ => None,
        })
        .collect()
}
