use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::ports;
use crate::prober::{ProbeOutcome, Prober};
use crate::types::{PortResult, ScanConfig, MAX_CONCURRENCY};

/// How a scheduler run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every port handed to the run was probed.
    Completed,
    /// Cancellation stopped dispatch; `unreached` lists the ports never probed,
    /// ascending.
    Cancelled { unreached: Vec<u16> },
}

/// Progress of a single run, reported once per probed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunProgress {
    pub port: u16,
    pub done: usize,
    pub total: usize,
}

/// Receives completions from the driving task of a run.
///
/// Calls are made sequentially, never concurrently. For an open port
/// `on_result` is called before `on_progress`.
pub trait ScanObserver: Send {
    fn on_result(&mut self, result: PortResult);
    fn on_progress(&mut self, progress: RunProgress);
}

/// Progress as a whole percentage, truncated. Only `scanned == total` gives 100.
pub fn progress_percent(scanned: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (scanned.min(total) * 100 / total) as u8
}

/// Bounded pool of concurrent probes over a set of ports.
#[derive(Clone)]
pub struct Scheduler {
    prober: Arc<dyn Prober>,
}

impl Scheduler {
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self { prober }
    }

    /// Probe `ports` on `host` with at most `config.concurrency` probes in flight.
    ///
    /// - Ports are dispatched in ascending order; duplicates are probed once.
    /// - `cancel` is checked between dispatches. Once it fires, no new probe
    ///   starts, in-flight probes run to completion, and the undispatched
    ///   ports are returned.
    /// - A probe task that panics counts as a closed port.
    pub async fn run(
        &self,
        host: Ipv4Addr,
        mut ports: Vec<u16>,
        config: ScanConfig,
        observer: &mut dyn ScanObserver,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        ports.sort_unstable();
        ports.dedup();
        let total = ports.len();

        let sem = Arc::new(Semaphore::new(config.concurrency.clamp(1, MAX_CONCURRENCY)));
        let mut set: JoinSet<(u16, ProbeOutcome)> = JoinSet::new();
        let mut in_flight: HashMap<task::Id, u16> = HashMap::new();
        let mut done = 0usize;
        let mut next = 0usize;

        tracing::debug!(%host, total, concurrency = config.concurrency, "scheduler run started");

        while next < ports.len() && !cancel.is_cancelled() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = set.join_next_with_id(), if !set.is_empty() => {
                    done += 1;
                    report(joined, &mut in_flight, done, total, observer);
                }
                permit = sem.clone().acquire_owned() => {
                    // The semaphore is local and never closed.
                    let Ok(permit) = permit else { break };
                    let port = ports[next];
                    next += 1;
                    let prober = self.prober.clone();
                    let addr = SocketAddr::new(IpAddr::V4(host), port);
                    let timeout = config.timeout;
                    let handle = set.spawn(async move {
                        let _permit = permit; // keep permit until the probe resolves
                        (port, prober.probe(addr, timeout).await)
                    });
                    in_flight.insert(handle.id(), port);
                }
            }
        }

        while let Some(joined) = set.join_next_with_id().await {
            done += 1;
            report(joined, &mut in_flight, done, total, observer);
        }

        let unreached = ports.split_off(next);
        if unreached.is_empty() {
            tracing::debug!(%host, done, "scheduler run completed");
            RunOutcome::Completed
        } else {
            tracing::debug!(%host, done, remaining = unreached.len(), "scheduler run cancelled");
            RunOutcome::Cancelled { unreached }
        }
    }
}

fn report(
    joined: Result<(task::Id, (u16, ProbeOutcome)), JoinError>,
    in_flight: &mut HashMap<task::Id, u16>,
    done: usize,
    total: usize,
    observer: &mut dyn ScanObserver,
) {
    let (port, open) = match joined {
        Ok((id, (port, outcome))) => {
            in_flight.remove(&id);
            (port, outcome.open)
        }
        Err(err) => {
            let Some(port) = in_flight.remove(&err.id()) else {
                tracing::warn!(error = %err, "probe task failed for an untracked port");
                return;
            };
            tracing::warn!(port, error = %err, "probe task failed; counting port as closed");
            (port, false)
        }
    };

    if open {
        observer.on_result(PortResult {
            port,
            is_open: true,
            service: ports::service_name(port).to_string(),
        });
    }
    observer.on_progress(RunProgress { port, done, total });
}
