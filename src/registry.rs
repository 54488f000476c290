use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::{Result, ScanError};
use crate::events::{ResumeScanRequest, StartScanRequest};
use crate::prober::Prober;
use crate::scanner::Scheduler;
use crate::session::{EventSender, ScanSession};
use crate::types::{ScanConfig, SessionState, Target};

/// All live sessions, keyed by connection id. One session per connection.
///
/// When a connection closes its session is detached: any running scan is
/// cancelled and the results stay available for export until the retention
/// window passes and [`evict_expired`](Self::evict_expired) drops them.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    scheduler: Scheduler,
    retention: Duration,
}

struct SessionEntry {
    session: Arc<ScanSession>,
    detached_at: Option<Instant>,
}

impl SessionEntry {
    fn new(session: Arc<ScanSession>) -> Self {
        Self { session, detached_at: None }
    }
}

impl SessionRegistry {
    pub fn new(prober: Arc<dyn Prober>, retention: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            scheduler: Scheduler::new(prober),
            retention,
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<ScanSession>> {
        self.sessions.read().await.get(id).map(|e| e.session.clone())
    }

    /// Like [`get`](Self::get), failing with `UnknownSession`.
    pub async fn lookup(&self, id: &str) -> Result<Arc<ScanSession>> {
        self.get(id)
            .await
            .ok_or_else(|| ScanError::UnknownSession(format!("no session with id {id}")))
    }

    pub async fn get_or_create(&self, id: &str, events: EventSender) -> Arc<ScanSession> {
        let mut map = self.sessions.write().await;
        map.entry(id.to_string())
            .or_insert_with(|| SessionEntry::new(ScanSession::new(id, self.scheduler.clone(), events)))
            .session
            .clone()
    }

    /// Install a new, idle session for `id`, discarding the previous one.
    pub async fn replace(&self, id: &str, events: EventSender) -> Arc<ScanSession> {
        let mut map = self.sessions.write().await;
        self.replace_locked(&mut map, id, events)
    }

    fn replace_locked(
        &self,
        map: &mut HashMap<String, SessionEntry>,
        id: &str,
        events: EventSender,
    ) -> Arc<ScanSession> {
        let session = ScanSession::new(id, self.scheduler.clone(), events);
        if let Some(old) = map.insert(id.to_string(), SessionEntry::new(session.clone())) {
            old.session.cancel_run();
            tracing::debug!(session = %id, "previous session discarded");
        }
        session
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<ScanSession>> {
        let entry = self.sessions.write().await.remove(id)?;
        entry.session.cancel_run();
        Some(entry.session)
    }

    /// The connection behind `id` closed.
    pub async fn detach(&self, id: &str) {
        let mut map = self.sessions.write().await;
        if let Some(entry) = map.get_mut(id) {
            entry.session.cancel_run();
            entry.detached_at = Some(Instant::now());
            tracing::debug!(session = %id, "session detached");
        }
    }

    /// Drop detached sessions older than the retention window. Returns how
    /// many were evicted.
    pub async fn evict_expired(&self) -> usize {
        let mut map = self.sessions.write().await;
        let before = map.len();
        let retention = self.retention;
        map.retain(|_, e| e.detached_at.map_or(true, |at| at.elapsed() < retention));
        let evicted = before - map.len();
        if evicted > 0 {
            tracing::info!(evicted, remaining = map.len(), "evicted detached sessions");
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Handle a `start_scan` request: validate, then replace the connection's
    /// session with a fresh one and start it.
    ///
    /// Invalid input and a scan already running leave the existing session
    /// untouched.
    pub async fn start_scan(
        &self,
        id: &str,
        events: EventSender,
        req: &StartScanRequest,
    ) -> Result<Arc<ScanSession>> {
        let target = Target::parse(&req.ip, req.start_port, req.end_port)?;
        let config = ScanConfig::from_request(req.threads, req.timeout)?;

        let mut map = self.sessions.write().await;
        if let Some(entry) = map.get(id) {
            if entry.session.state() == SessionState::Running {
                return Err(ScanError::AlreadyScanning);
            }
        }
        let session = self.replace_locked(&mut map, id, events);
        session.start(target, config)?;
        Ok(session)
    }

    /// Handle a `resume_scan` request. Missing fields keep the previous run's
    /// settings.
    pub async fn resume_scan(&self, id: &str, req: &ResumeScanRequest) -> Result<()> {
        let session = self
            .get(id)
            .await
            .ok_or_else(|| ScanError::NoResumableState("no scan to resume".into()))?;
        let previous = session.config();
        let threads = req.threads.unwrap_or(previous.concurrency as i64);
        let timeout = req.timeout.unwrap_or(previous.timeout.as_secs_f64());
        let config = ScanConfig::from_request(threads, timeout)?;
        session.resume(config)
    }

    pub async fn stop_scan(&self, id: &str) -> Result<()> {
        let session = self.get(id).await.ok_or(ScanError::NotRunning)?;
        session.stop()
    }
}
