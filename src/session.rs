//! Lifecycle of one scan: `Idle -> Running -> Completed`, with
//! `Running -> Stopped -> Running` for stop and resume.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use ::time::{format_description::well_known, OffsetDateTime};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ScanError};
use crate::events::{ScanSummary, ServerEvent};
use crate::scanner::{progress_percent, RunOutcome, RunProgress, ScanObserver, Scheduler};
use crate::types::{PortResult, ScanConfig, SessionState, Target};

/// Outbound event stream of one connection.
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

pub struct ScanSession {
    id: String,
    scheduler: Scheduler,
    events: EventSender,
    inner: Mutex<SessionData>,
}

#[derive(Debug)]
struct SessionData {
    target: Option<Target>,
    config: ScanConfig,
    state: SessionState,
    scanned: BTreeSet<u16>,
    open: BTreeMap<u16, PortResult>,
    total: usize,
    report_every: usize,
    cancel: Option<CancellationToken>,
    cancel_requested: bool,
    can_resume: bool,
    started_at: Option<String>,
    finished_at: Option<String>,
}

/// Point-in-time copy of a session, for status queries and export.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub id: String,
    pub state: SessionState,
    pub target: Option<Target>,
    pub scanned: usize,
    pub total: usize,
    pub open_count: usize,
    pub progress: u8,
    pub can_resume: bool,
    pub open_results: Vec<PortResult>,
}

impl fmt::Debug for ScanSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanSession")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ScanSession {
    pub fn new(id: impl Into<String>, scheduler: Scheduler, events: EventSender) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            scheduler,
            events,
            inner: Mutex::new(SessionData {
                target: None,
                config: ScanConfig::default(),
                state: SessionState::Idle,
                scanned: BTreeSet::new(),
                open: BTreeMap::new(),
                total: 0,
                report_every: 1,
                cancel: None,
                cancel_requested: false,
                can_resume: false,
                started_at: None,
                finished_at: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.data().state
    }

    pub fn config(&self) -> ScanConfig {
        self.data().config
    }

    /// Begin a fresh scan over the whole target range.
    ///
    /// Any results from an earlier, finished scan in this session are dropped.
    pub fn start(self: &Arc<Self>, target: Target, config: ScanConfig) -> Result<()> {
        let (ports, cancel) = {
            let mut d = self.data();
            if d.state == SessionState::Running {
                return Err(ScanError::AlreadyScanning);
            }
            let total = target.total_ports();
            d.target = Some(target);
            d.config = config;
            d.state = SessionState::Running;
            d.scanned.clear();
            d.open.clear();
            d.total = total;
            d.report_every = (total / 100).max(1);
            d.cancel_requested = false;
            d.can_resume = false;
            d.started_at = Some(now_rfc3339());
            d.finished_at = None;
            let cancel = CancellationToken::new();
            d.cancel = Some(cancel.clone());

            tracing::info!(
                session = %self.id,
                host = %target.host,
                start = target.start_port,
                end = target.end_port,
                concurrency = config.concurrency,
                timeout_ms = config.timeout.as_millis() as u64,
                "scan started"
            );
            self.emit(ServerEvent::ScanStarted {
                message: "scan started".into(),
                resume: false,
            });
            (target.ports().collect::<Vec<u16>>(), cancel)
        };

        self.spawn_run(target, ports, config, cancel);
        Ok(())
    }

    /// Request cancellation of the running scan.
    ///
    /// The session stays Running until in-flight probes resolve, then moves to
    /// Stopped and emits `scan_stopped`.
    pub fn stop(&self) -> Result<()> {
        let mut d = self.data();
        if d.state != SessionState::Running {
            return Err(ScanError::NotRunning);
        }
        if !d.cancel_requested {
            d.cancel_requested = true;
            if let Some(cancel) = &d.cancel {
                cancel.cancel();
            }
            tracing::info!(session = %self.id, scanned = d.scanned.len(), total = d.total, "stop requested");
        }
        Ok(())
    }

    /// Continue a stopped scan over the ports it has not probed yet.
    pub fn resume(self: &Arc<Self>, config: ScanConfig) -> Result<()> {
        let (target, remaining, cancel) = {
            let mut d = self.data();
            match d.state {
                SessionState::Running => return Err(ScanError::AlreadyScanning),
                SessionState::Stopped if d.can_resume => {}
                SessionState::Completed => {
                    return Err(ScanError::NoResumableState("the scan already completed".into()))
                }
                _ => return Err(ScanError::NoResumableState("no stopped scan to resume".into())),
            }
            let Some(target) = d.target else {
                return Err(ScanError::NoResumableState("no stopped scan to resume".into()));
            };
            let remaining: Vec<u16> = target.ports().filter(|p| !d.scanned.contains(p)).collect();
            if remaining.is_empty() {
                return Err(ScanError::NoResumableState("no ports left to scan".into()));
            }

            d.config = config;
            d.state = SessionState::Running;
            d.cancel_requested = false;
            d.can_resume = false;
            d.finished_at = None;
            let cancel = CancellationToken::new();
            d.cancel = Some(cancel.clone());

            tracing::info!(
                session = %self.id,
                remaining = remaining.len(),
                concurrency = config.concurrency,
                "scan resumed"
            );
            self.emit(ServerEvent::ScanStarted {
                message: "scan resumed".into(),
                resume: true,
            });
            (target, remaining, cancel)
        };

        self.spawn_run(target, remaining, config, cancel);
        Ok(())
    }

    /// Cancel any run without the `Running` precondition of [`stop`](Self::stop).
    /// Used when the session is replaced or its connection goes away.
    pub fn cancel_run(&self) {
        let mut d = self.data();
        if let Some(cancel) = d.cancel.clone() {
            d.cancel_requested = true;
            cancel.cancel();
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let d = self.data();
        SessionSnapshot {
            id: self.id.clone(),
            state: d.state,
            target: d.target,
            scanned: d.scanned.len(),
            total: d.total,
            open_count: d.open.len(),
            progress: progress_percent(d.scanned.len(), d.total),
            can_resume: d.can_resume,
            open_results: d.open.values().cloned().collect(),
        }
    }

    /// Open ports found so far, ascending by port.
    pub fn open_results(&self) -> Vec<PortResult> {
        self.data().open.values().cloned().collect()
    }

    /// Ports probed so far, ascending.
    pub fn scanned_ports(&self) -> Vec<u16> {
        self.data().scanned.iter().copied().collect()
    }

    fn spawn_run(self: &Arc<Self>, target: Target, ports: Vec<u16>, config: ScanConfig, cancel: CancellationToken) {
        let scheduler = self.scheduler.clone();
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut observer = SessionObserver { session: session.clone() };
            let outcome = scheduler
                .run(target.host, ports, config, &mut observer, &cancel)
                .await;
            if let Some(session) = session.upgrade() {
                session.finish_run(outcome);
            }
        });
    }

    fn finish_run(&self, outcome: RunOutcome) {
        let mut d = self.data();
        d.cancel = None;
        let remaining = d.total.saturating_sub(d.scanned.len());
        let open_count = d.open.len();

        if outcome == RunOutcome::Completed && !d.cancel_requested {
            d.state = SessionState::Completed;
            d.can_resume = false;
            d.finished_at = Some(now_rfc3339());
            tracing::info!(session = %self.id, total = d.total, open_count, "scan completed");
            let summary = ScanSummary {
                message: "scan complete".into(),
                total_ports: d.total,
                open_count,
                open_ports: d.open.values().cloned().collect(),
                started_at: d.started_at.clone(),
                finished_at: d.finished_at.clone(),
            };
            self.emit(ServerEvent::ScanComplete(summary));
            return;
        }

        // Cancelled, or stop arrived after the last dispatch.
        let can_resume = remaining > 0;
        d.can_resume = can_resume;
        if can_resume {
            d.state = SessionState::Stopped;
        } else {
            d.state = SessionState::Completed;
            d.finished_at = Some(now_rfc3339());
        }
        tracing::info!(session = %self.id, scanned = d.scanned.len(), remaining, "scan stopped");
        self.emit(ServerEvent::ScanStopped {
            message: "scan stopped".into(),
            can_resume,
        });
    }

    fn data(&self) -> MutexGuard<'_, SessionData> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(session = %self.id, "event subscriber gone");
        }
    }
}

/// Applies run completions to the session it was started for.
///
/// Holds only a weak reference: once the registry drops the session, results
/// are discarded.
struct SessionObserver {
    session: Weak<ScanSession>,
}

impl ScanObserver for SessionObserver {
    fn on_result(&mut self, result: PortResult) {
        let Some(session) = self.session.upgrade() else { return };
        let mut d = session.data();
        let port = result.port;
        if d.target.is_some_and(|t| t.contains(port)) && !d.open.contains_key(&port) {
            d.scanned.insert(port);
            let service = result.service.clone();
            d.open.insert(port, result);
            tracing::debug!(session = %session.id, port, %service, "open port");
            session.emit(ServerEvent::PortFound {
                port,
                service,
                status: "open".into(),
            });
        }
    }

    fn on_progress(&mut self, progress: RunProgress) {
        let Some(session) = self.session.upgrade() else { return };
        let mut d = session.data();
        if !d.target.is_some_and(|t| t.contains(progress.port)) {
            return;
        }
        d.scanned.insert(progress.port);
        let scanned = d.scanned.len();
        if scanned % d.report_every == 0 || scanned == d.total {
            session.emit(ServerEvent::ScanProgress {
                progress: progress_percent(scanned, d.total),
                scanned,
                total: d.total,
                open_count: d.open.len(),
            });
        }
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
