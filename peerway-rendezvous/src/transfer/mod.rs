//! File-transfer controllers.
//!
//! One worker task per active transfer drives the per-file protocol over
//! a duplex byte channel: SEND header, resume negotiation, raw bytes,
//! final checksum acknowledgement.  The channel comes from
//! [`connect::establish`] (direct socket with relay fallback) or is handed
//! in pre-established.
//!
//! # Lifecycle
//!
//! [`SendTransfer::spawn`] / [`ReceiveTransfer::spawn`] return a
//! [`TransferHandle`].  State transitions surface on a `watch` channel and
//! on the [`TransferHandler`]; the terminal outcome fires exactly once.
//! Cancelling closes the channel and releases file handles mid-transfer.

mod checksum;
mod deadline;
mod headers;

pub(crate) mod connect;
pub(crate) mod recv;
pub(crate) mod send;

// ---

pub use checksum::{checksum_bytes, checksum_file, checksum_prefix};
pub use connect::{ConnectPlan, PeerEndpoint, RelayRole, TransferTarget};
pub use deadline::PausableDeadline;
pub use headers::{
    // ---
    expect_header,
    read_transfer_header,
    write_transfer_header,
    HeaderType,
    TransferHeader,
    FIXED_HEADER_LEN,
    TRANSFER_VERSION,
};
pub use recv::ReceiveTransfer;
pub use send::SendTransfer;

// ---

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

// ---

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

// ---

use peerway_domain::{
    //
    FailureKind,
    PeerwayError,
    Result,
    TransferHandler,
    TransferOutcome,
    TransferState,
};

// ---------------------------------------------------------------------------
// TransferConfig
// ---------------------------------------------------------------------------

/// Transfer tunables.  The protocol fixes the message sequence; these fix
/// the timing and granularity around it.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    // ---
    /// Budget for one direct dial before falling back to the relay.
    pub connect_timeout: Duration,

    /// Budget for the relay handshake (including waiting for the peer to
    /// join on the initiate path).
    pub relay_timeout: Duration,

    /// Pausable deadline: the transfer fails if no protocol event lands
    /// within this window.  Checksumming pauses the countdown.
    pub event_timeout: Duration,

    /// Read/write granularity for file bytes.
    pub chunk_size: usize,

    /// Fire `on_progress` once per this many bytes.
    pub progress_interval: u64,

    /// When false, skip the direct dial and go straight to the relay.
    pub allow_direct: bool,
}

// ---

impl Default for TransferConfig {
    fn default() -> Self {
        // ---
        Self {
            connect_timeout: Duration::from_secs(10),
            relay_timeout: Duration::from_secs(30),
            event_timeout: Duration::from_secs(60),
            chunk_size: 16 * 1024,
            progress_interval: 256 * 1024,
            allow_direct: true,
        }
    }
}

// ---------------------------------------------------------------------------
// TransferFile / TransferJob
// ---------------------------------------------------------------------------

/// One file of a job.
///
/// `segments` is the wire name (path components relative to the job
/// root); `path` is where the bytes live locally.
#[derive(Debug, Clone)]
pub struct TransferFile {
    // ---
    pub path: PathBuf,
    pub segments: Vec<String>,
    pub size: u64,
    pub modified: u64,
}

// ---

impl TransferFile {
    // ---

    /// Build an entry from a local file, using its file name as the only
    /// wire segment.
    pub async fn probe(path: impl Into<PathBuf>) -> Result<Self> {
        // ---
        let path = path.into();
        let meta = tokio::fs::metadata(&path).await?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                PeerwayError::Protocol(format!("path has no file name: {}", path.display()))
            })?;

        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Ok(Self {
            path,
            segments: vec![name],
            size: meta.len(),
            modified,
        })
    }
}

// ---

/// Ordered list of files transferred over one channel.
#[derive(Debug, Clone)]
pub struct TransferJob {
    // ---
    pub files: Vec<TransferFile>,
}

// ---

impl TransferJob {
    // ---
    pub fn new(files: Vec<TransferFile>) -> Self {
        Self { files }
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

// ---------------------------------------------------------------------------
// TransferHandle
// ---------------------------------------------------------------------------

/// Caller's grip on a running transfer.
pub struct TransferHandle {
    // ---
    state_rx: watch::Receiver<TransferState>,
    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
    task: JoinHandle<()>,
}

// ---

impl TransferHandle {
    // ---

    /// Current state snapshot.
    pub fn state(&self) -> TransferState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn state_rx(&self) -> watch::Receiver<TransferState> {
        self.state_rx.clone()
    }

    // ---

    /// Stop the transfer.  The worker drops its channel and file handles
    /// and reports a terminal `Cancelled` outcome; already-terminal
    /// transfers ignore this.
    pub fn cancel(&self) {
        // ---
        self.cancelled.store(true, Ordering::Release);
        self.cancel_notify.notify_waiters();
    }

    // ---

    /// Wait for the worker task to exit.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

// ---------------------------------------------------------------------------
// TransferCtx  (worker-internal)
// ---------------------------------------------------------------------------

/// Everything a transfer worker threads through its protocol steps.
pub(crate) struct TransferCtx {
    // ---
    state_tx: watch::Sender<TransferState>,
    handler: Arc<dyn TransferHandler>,
    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
    pub(crate) deadline: PausableDeadline,
    pub(crate) config: TransferConfig,
}

// ---

impl TransferCtx {
    // ---

    /// Build the context/handle pair and spawn `work` as the worker task.
    ///
    /// `work` receives the context and returns the bytes moved; the
    /// terminal state and `on_finished` event are handled here, once.
    pub(crate) fn spawn<F, Fut>(
        handler: Arc<dyn TransferHandler>,
        config: TransferConfig,
        work: F,
    ) -> TransferHandle
    where
        F: FnOnce(Arc<TransferCtx>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<u64>> + Send + 'static,
    {
        // ---
        let (state_tx, state_rx) = watch::channel(TransferState::Resolving);
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancel_notify = Arc::new(Notify::new());

        let ctx = Arc::new(TransferCtx {
            state_tx,
            handler,
            cancelled: Arc::clone(&cancelled),
            cancel_notify: Arc::clone(&cancel_notify),
            deadline: PausableDeadline::new(config.event_timeout),
            config,
        });

        let task = tokio::spawn({
            let ctx = Arc::clone(&ctx);
            async move {
                match work(Arc::clone(&ctx)).await {
                    Ok(bytes) => {
                        ctx.set_state(TransferState::Succeeded).await;
                        ctx.handler
                            .on_finished(TransferOutcome::Succeeded {
                                bytes_transferred: bytes,
                            })
                            .await;
                    }
                    Err(err) => {
                        tracing::info!("transfer failed: {err}");
                        ctx.set_state(TransferState::Failed).await;
                        ctx.handler
                            .on_finished(TransferOutcome::Failed {
                                kind: FailureKind::from(&err),
                                reason: err.to_string(),
                            })
                            .await;
                    }
                }
            }
        });

        TransferHandle {
            state_rx,
            cancelled,
            cancel_notify,
            task,
        }
    }

    // ---

    /// Move to `state`, notifying the watch channel and the handler.
    pub(crate) async fn set_state(&self, state: TransferState) {
        // ---
        let changed = {
            let current = *self.state_tx.borrow();
            current != state
        };
        if changed {
            let _ = self.state_tx.send(state);
            self.handler.on_state(state).await;
        }
    }

    // ---

    pub(crate) fn handler(&self) -> &dyn TransferHandler {
        self.handler.as_ref()
    }

    // ---

    async fn wait_cancelled(&self) {
        // ---
        loop {
            let notified = self.cancel_notify.notified();
            if self.cancelled.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    // ---

    /// Run one protocol step, racing it against cancellation and the
    /// event deadline.  Errors short-circuit without further I/O.
    pub(crate) async fn step<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        // ---
        tokio::select! {
            biased;
            _ = self.wait_cancelled() => Err(PeerwayError::Cancelled),
            _ = self.deadline.expired() => Err(PeerwayError::TimedOut),
            result = fut => result,
        }
    }

    // ---

    /// Checksum work pauses the event deadline: nothing crosses the wire
    /// while the disk is being read, and that must not count against the
    /// peer.
    pub(crate) async fn checksum_step<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        // ---
        self.deadline.pause();
        let result = tokio::select! {
            biased;
            _ = self.wait_cancelled() => Err(PeerwayError::Cancelled),
            result = fut => result,
        };
        self.deadline.resume();
        result
    }
}

// ---------------------------------------------------------------------------
// Name sanitation (shared by the receive path)
// ---------------------------------------------------------------------------

/// Turn wire name segments into a relative path under the receive root.
///
/// Rejects anything that could escape it: empty or dot segments, and
/// separators smuggled inside a segment.
pub(crate) fn sanitized_relative_path(segments: &[String]) -> Result<PathBuf> {
    // ---
    if segments.is_empty() {
        return Err(PeerwayError::Protocol("file name has no segments".into()));
    }

    let mut path = PathBuf::new();
    for segment in segments {
        if segment.is_empty()
            || segment == "."
            || segment == ".."
            || segment.contains(['/', '\\', '\0'])
        {
            return Err(PeerwayError::Protocol(format!(
                "illegal file name segment {segment:?}"
            )));
        }
        path.push(Path::new(segment));
    }
    Ok(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
