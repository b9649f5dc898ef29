//! Non-blocking scan session: one host, one background worker, one result slot.
//!
//! ```no_run
//! use nmap_session_rs::session::{ScanOutcome, ScanRequest, ScanSession};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let mut session = ScanSession::new("127.0.0.1");
//! session.scan(ScanRequest::new().arguments("-sV -T4"), None)?;
//! while !session.results_available() {
//!     tokio::time::sleep(std::time::Duration::from_secs(3)).await;
//! }
//! if let ScanOutcome::Success(result) = session.results() {
//!     println!("{:?}", result.host("127.0.0.1"));
//! }
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{ScanError, SessionError};
use crate::scanner::{NmapScanner, Scanner};
use crate::types::ScanResult;
use ::time::{format_description::well_known, OffsetDateTime};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, info_span, warn, Instrument};

/// Called with the completed result after the slot has been filled.
///
/// Runs on tokio's blocking pool and the worker waits for it, so the session stays
/// unavailable until the callback returns.
pub type Callback = Box<dyn FnOnce(&ScanResult) + Send + 'static>;

/// Default nmap flags: service/version detection.
pub const DEFAULT_ARGUMENTS: &str = "-sV";

/// Contents of the result slot.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ScanOutcome {
    /// Nothing stored: the scan is still running, was never started, or was already read.
    #[default]
    Empty,
    Success(ScanResult),
    Failure(ScanError),
}

impl ScanOutcome {
    pub fn is_empty(&self) -> bool {
        matches!(self, ScanOutcome::Empty)
    }

    pub fn success(self) -> Option<ScanResult> {
        match self {
            ScanOutcome::Success(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Parameters of one `scan()` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    /// Port specification in nmap syntax (`22,80,8000-8100`); passed through unvalidated.
    pub ports: Option<String>,
    /// Flags passed verbatim to the scanner.
    pub arguments: String,
}

impl Default for ScanRequest {
    fn default() -> Self {
        Self {
            ports: None,
            arguments: DEFAULT_ARGUMENTS.to_string(),
        }
    }
}

impl ScanRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ports(mut self, ports: impl Into<String>) -> Self {
        self.ports = Some(ports.into());
        self
    }

    pub fn arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = arguments.into();
        self
    }
}

#[derive(Debug)]
struct Shared {
    slot: ScanOutcome,
    state: SessionState,
    finished_at: Option<String>,
}

impl Shared {
    fn finish(&mut self, outcome: ScanOutcome, state: SessionState) {
        self.slot = outcome;
        self.state = state;
        self.finished_at = Some(now_rfc3339());
    }
}

/// Scans one host in a background tokio task.
///
/// At most one worker runs per session. The session must be closed with
/// [`ScanSession::close`] (or used through [`ScanSession::scoped`]) to join the worker;
/// dropping it while a scan is in flight detaches the worker.
pub struct ScanSession<S: Scanner + 'static = NmapScanner> {
    host: String,
    scanner: Arc<S>,
    shared: Arc<Mutex<Shared>>,
    worker: Option<JoinHandle<()>>,
    last_request: Option<ScanRequest>,
}

impl ScanSession<NmapScanner> {
    /// Session backed by the `nmap` binary found on `PATH`.
    pub fn new(host: impl Into<String>) -> Self {
        Self::with_scanner(host, NmapScanner::default())
    }
}

impl<S: Scanner + 'static> ScanSession<S> {
    pub fn with_scanner(host: impl Into<String>, scanner: S) -> Self {
        Self {
            host: host.into(),
            scanner: Arc::new(scanner),
            shared: Arc::new(Mutex::new(Shared {
                slot: ScanOutcome::Empty,
                state: SessionState::Idle,
                finished_at: None,
            })),
            worker: None,
            last_request: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn last_request(&self) -> Option<&ScanRequest> {
        self.last_request.as_ref()
    }

    /// Start a scan in the background and return immediately.
    ///
    /// Fails with [`SessionError::AlreadyRunning`] while a previous worker is alive. Starting
    /// a new scan discards an unread outcome of the previous one. Must be called from within
    /// a tokio runtime.
    pub fn scan(
        &mut self,
        request: ScanRequest,
        callback: Option<Callback>,
    ) -> Result<(), SessionError> {
        if !self.results_available() {
            return Err(SessionError::AlreadyRunning {
                host: self.host.clone(),
            });
        }
        let runtime = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;

        {
            let mut shared = lock(&self.shared);
            if !shared.slot.is_empty() {
                debug!(host = %self.host, "discarding unread outcome of previous scan");
            }
            shared.slot = ScanOutcome::Empty;
            shared.state = SessionState::Running;
            shared.finished_at = None;
        }

        let host = self.host.clone();
        let scanner = Arc::clone(&self.scanner);
        let shared = Arc::clone(&self.shared);
        let req = request.clone();
        let span = info_span!("scan", host = %host);

        let worker = runtime.spawn(
            async move {
                info!(ports = ?req.ports, arguments = %req.arguments, "scan started");
                let started = Instant::now();
                match scanner.scan(&host, req.ports.as_deref(), &req.arguments).await {
                    Ok(result) => {
                        info!(
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            hosts = result.hosts.len(),
                            "scan completed"
                        );
                        let for_callback = callback.as_ref().map(|_| result.clone());
                        lock(&shared).finish(ScanOutcome::Success(result), SessionState::Completed);
                        if let (Some(cb), Some(result)) = (callback, for_callback) {
                            // Off the executor: a blocking callback must not stall the caller.
                            if let Err(err) = task::spawn_blocking(move || cb(&result)).await {
                                if err.is_panic() {
                                    warn!("scan callback panicked");
                                    std::panic::resume_unwind(err.into_panic());
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "scan failed");
                        lock(&shared).finish(ScanOutcome::Failure(err), SessionState::Failed);
                    }
                }
            }
            .instrument(span),
        );

        self.worker = Some(worker);
        self.last_request = Some(request);
        Ok(())
    }

    /// Take the stored outcome, leaving the slot empty. Never blocks.
    pub fn results(&mut self) -> ScanOutcome {
        std::mem::take(&mut lock(&self.shared).slot)
    }

    /// True when no worker is running, whether it finished, failed or never started.
    ///
    /// This probes worker liveness, not the slot: it stays true after the outcome has been
    /// read.
    pub fn results_available(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn state(&self) -> SessionState {
        let state = lock(&self.shared).state;
        // A worker that panicked never records its end state.
        if state == SessionState::Running && self.results_available() {
            SessionState::Failed
        } else {
            state
        }
    }

    /// RFC 3339 timestamp at which the last worker stored its outcome.
    pub fn finished_at(&self) -> Option<String> {
        lock(&self.shared).finished_at.clone()
    }

    /// Wait for the worker to terminate and return whatever is left in the slot.
    ///
    /// There is no timeout: this waits as long as the scanner runs. If the worker panicked
    /// (in the scanner or in the callback), the unread outcome travels inside the error.
    pub async fn close(mut self) -> Result<ScanOutcome, SessionError> {
        let joined = match self.worker.take() {
            Some(worker) => worker.await,
            None => Ok(()),
        };
        let outcome = self.results();
        match joined {
            Err(err) if err.is_panic() => Err(SessionError::WorkerPanicked {
                host: self.host.clone(),
                outcome: Box::new(outcome),
            }),
            _ => Ok(outcome),
        }
    }

    /// Run `f` against the session, then close it regardless of what `f` did.
    ///
    /// ```no_run
    /// # use nmap_session_rs::session::{ScanRequest, ScanSession};
    /// # async fn demo() -> Result<(), nmap_session_rs::error::SessionError> {
    /// ScanSession::new("127.0.0.1")
    ///     .scoped(|s| Box::pin(async move { s.scan(ScanRequest::new(), None) }))
    ///     .await??;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn scoped<T, F>(mut self, f: F) -> Result<T, SessionError>
    where
        F: for<'a> FnOnce(&'a mut Self) -> Pin<Box<dyn Future<Output = T> + 'a>>,
    {
        let value = f(&mut self).await;
        let leftover = self.close().await?;
        if !leftover.is_empty() {
            debug!("scoped session closed with an unread outcome");
        }
        Ok(value)
    }
}

impl<S: Scanner + 'static> Drop for ScanSession<S> {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            if !worker.is_finished() {
                warn!(host = %self.host, "scan session dropped while its worker is running; worker detached");
            }
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
