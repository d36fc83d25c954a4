//! [`DispatchScheduler`] — owns every [`RateQueue`] of a connection and
//! drives the flush loop.
//!
//! # Loop shape
//!
//! ```text
//! enqueue / pause / stop          flush cycle
//!        │   Notify                  │
//!        └──────────► parked task ───┤ for each queue:
//!                          ▲         │   take_ready → sink → confirm
//!                          │         │ min(optimal waits) ──┐
//!                          └─────────┴── sleep(min) ◄───────┘
//! ```
//!
//! The task parks on a [`Notify`]-interruptible sleep sized to the
//! smallest optimal wait across open queues, or indefinitely when every
//! queue is empty.  A queue going empty→non-empty and every pause
//! transition interrupt the sleep early.
//!
//! # Stop / restart
//!
//! `stop()` is idempotent and never joins (safe to call from callback
//! context).  A stopped loop is dead: new work notifies a task that is no
//! longer listening and nothing respawns it — only an explicit `start()`
//! does.  A generation counter guards the stop→start edge so a stale loop
//! from a previous generation can never run alongside a fresh one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---

use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::Instant;

// ---

use peerway_domain::{
    //
    PeerwayError,
    RateClassId,
    RateClassMonitor,
    RateClassUpdate,
    RateNoticeCode,
    Result,
    WireSink,
};

// ---

use super::queue::{QueuedRequest, RateQueue};

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

/// Connection-level dispatch tunables.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    // ---
    /// Safety margin (ms) added to rate thresholds for classes that carry
    /// no override of their own, absorbing client/server clock drift.
    pub default_error_margin: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_error_margin: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchScheduler
// ---------------------------------------------------------------------------

struct Shared {
    // ---
    queues: Mutex<HashMap<RateClassId, Arc<RateQueue>>>,

    /// Wakes the parked loop on enqueue, pause transitions, and stop.
    wake: Notify,

    /// Connection pause flag, shared into every queue.
    paused: Arc<AtomicBool>,

    running: AtomicBool,

    /// Bumped on every `start()`; a loop exits when it is no longer the
    /// current generation.
    generation: AtomicU64,

    sink: Arc<dyn WireSink>,

    /// Monotonic epoch for the millisecond timestamps fed to the monitors.
    epoch: Instant,

    config: SchedulerConfig,
}

// ---

impl Shared {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

// ---

/// Owns all rate queues for one connection and the background flush task.
pub struct DispatchScheduler {
    // ---
    shared: Arc<Shared>,
}

// ---

impl DispatchScheduler {
    // ---

    pub fn new(sink: Arc<dyn WireSink>, config: SchedulerConfig) -> Self {
        // ---
        Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                paused: Arc::new(AtomicBool::new(false)),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                sink,
                epoch: Instant::now(),
                config,
            }),
        }
    }

    // ---

    /// Install or refresh rate classes from a server table push.
    ///
    /// A descriptor that fails validation is logged and skipped; the other
    /// classes in the same push are unaffected.
    pub async fn install_rate_classes(&self, updates: Vec<RateClassUpdate>) {
        // ---
        for update in updates {
            if let Err(e) = self.upsert_class(RateNoticeCode::ParamChange, update).await {
                tracing::warn!("rate table entry rejected: {e}");
            }
        }
        self.shared.wake.notify_one();
    }

    // ---

    /// Apply one server rate notice (param change / warned / limited /
    /// cleared).  Creates the class if it was never seen, so pushes may
    /// arrive before the first local send.
    pub async fn apply_rate_notice(
        &self,
        code: RateNoticeCode,
        update: RateClassUpdate,
    ) -> Result<()> {
        // ---
        let result = self.upsert_class(code, update).await;
        self.shared.wake.notify_one();
        result
    }

    // ---

    async fn upsert_class(&self, code: RateNoticeCode, update: RateClassUpdate) -> Result<()> {
        // ---
        let id = update.descriptor.id;
        update
            .descriptor
            .validate()
            .map_err(|e| PeerwayError::InvalidRateClass(id, e))?;

        let mut queues = self.shared.queues.lock().await;
        match queues.get(&id).cloned() {
            Some(queue) => {
                drop(queues);
                queue.apply_server_update(code, update).await;
            }
            None => {
                let monitor = RateClassMonitor::new(
                    update.descriptor.clone(),
                    update.current_avg,
                    self.shared.config.default_error_margin,
                );
                let queue = Arc::new(RateQueue::new(monitor, Arc::clone(&self.shared.paused)));
                if !matches!(code, RateNoticeCode::ParamChange) {
                    queue.apply_server_update(code, update).await;
                }
                tracing::debug!(class = %id, "rate class installed");
                queues.insert(id, queue);
            }
        }
        Ok(())
    }

    // ---

    /// Submit a request to its rate class.
    ///
    /// Returns a receiver that resolves once the frame is on the wire; a
    /// closed channel means the send failed.  Unknown class ids are an
    /// error — the rate table must have announced the class first.
    pub async fn enqueue(
        &self,
        class: RateClassId,
        payload: Vec<u8>,
    ) -> Result<oneshot::Receiver<()>> {
        // ---
        let queue = {
            let queues = self.shared.queues.lock().await;
            queues
                .get(&class)
                .cloned()
                .ok_or(PeerwayError::UnknownRateClass(class))?
        };

        let (tx, rx) = oneshot::channel();
        queue
            .push(QueuedRequest {
                payload,
                enqueued_at: Instant::now(),
                on_sent: Some(tx),
            })
            .await;

        // Empty→non-empty (and every other) push interrupts the sleep;
        // a stored permit covers the race with a loop mid-cycle.
        self.shared.wake.notify_one();
        Ok(rx)
    }

    // ---

    /// Pause outbound dispatch; queues keep accepting work.
    pub fn pause(&self) {
        // ---
        self.shared.paused.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }

    /// Resume outbound dispatch.
    pub fn resume(&self) {
        // ---
        self.shared.paused.store(false, Ordering::Release);
        self.shared.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    // ---

    /// Spawn the flush loop.  No-op if it is already running.
    pub fn start(&self) {
        // ---
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let shared = Arc::clone(&self.shared);
        tokio::spawn(run_loop(shared, generation));
    }

    // ---

    /// Stop the flush loop.  Idempotent; safe after the loop has already
    /// exited.  New work does not restart a stopped loop — call
    /// [`Self::start`] explicitly.
    pub fn stop(&self) {
        // ---
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    // ---

    /// Queue depth snapshot for diagnostics: (class, queued, avg, limited).
    pub async fn queue_stats(&self) -> Vec<(RateClassId, usize, u64, bool)> {
        // ---
        let queues: Vec<Arc<RateQueue>> = {
            let guard = self.shared.queues.lock().await;
            guard.values().cloned().collect()
        };

        let mut stats = Vec::with_capacity(queues.len());
        for q in queues {
            let (avg, limited) = q.rate_snapshot().await;
            stats.push((q.class(), q.len().await, avg, limited));
        }
        stats
    }
}

// ---------------------------------------------------------------------------
// Flush loop
// ---------------------------------------------------------------------------

async fn run_loop(shared: Arc<Shared>, generation: u64) {
    // ---
    tracing::debug!(generation, "dispatch loop started");

    loop {
        if !shared.running.load(Ordering::Acquire)
            || shared.generation.load(Ordering::Acquire) != generation
        {
            break;
        }

        let min_wait = flush_cycle(&shared).await;

        match min_wait {
            // Every queue is empty (or paused) — park until something
            // changes.  The stored Notify permit covers pushes that raced
            // with the cycle above.
            None => shared.wake.notified().await,

            // Capacity is available right now (work arrived mid-cycle);
            // loop straight into another flush.
            Some(0) => {}

            Some(ms) => {
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                }
            }
        }
    }

    tracing::debug!(generation, "dispatch loop stopped");
}

// ---

/// Flush every queue once; returns the smallest wait across queues that
/// still hold work, or `None` when all are closed.
async fn flush_cycle(shared: &Arc<Shared>) -> Option<u64> {
    // ---
    let queues: Vec<Arc<RateQueue>> = {
        let guard = shared.queues.lock().await;
        guard.values().cloned().collect()
    };

    let mut min_wait: Option<u64> = None;

    for queue in queues {
        let batch = queue.take_ready(shared.now_ms()).await;
        for admitted in batch {
            match shared.sink.send_frame(admitted.payload).await {
                Ok(()) => {
                    queue.confirm_sent(admitted.id, shared.now_ms()).await;
                    if let Some(tx) = admitted.on_sent {
                        let _ = tx.send(());
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        class = %queue.class(),
                        "frame send failed: {e} — dropping request"
                    );
                    queue.abort_pending(admitted.id).await;
                    // on_sent dropped here — submitter sees a closed channel.
                }
            }
        }

        if let Some(wait) = queue.next_wait(shared.now_ms()).await {
            min_wait = Some(min_wait.map_or(wait, |m| m.min(wait)));
        }
    }

    min_wait
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
