//! [`RateQueue`] — FIFO of outbound requests for one rate class, gated by
//! its [`RateClassMonitor`].
//!
//! The queue owns the monitor outright and exposes only compound
//! operations under one lock, so two concurrent flush callers can never
//! interleave a check with an act.  The pending set is what makes that
//! safe across the send itself:
//!
//! ```text
//! take_ready          send_frame          confirm_sent
//!  ─────────►  [id enters pending]  ───────►  [id leaves pending,
//!   dequeue         (in flight,                update_rate]
//!                 capacity reserved)
//! ```
//!
//! A request occupies the pending set strictly between dequeue and
//! send-confirmation; `take_ready` subtracts `|pending|` from the
//! monitor's admissible count, so in-flight-plus-counted capacity never
//! exceeds the true rate-class capacity, however many callers race.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ---

use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

// ---

use peerway_domain::{
    //
    RateClassId,
    RateClassMonitor,
    RateClassUpdate,
    RateNoticeCode,
};

// ---------------------------------------------------------------------------
// QueuedRequest
// ---------------------------------------------------------------------------

/// One outbound request waiting for admission.
///
/// Ownership moves from the queue to the send path on dequeue; the
/// confirmation sender fires once the frame is on the wire, or is dropped
/// if the send fails (the submitter observes a closed channel).
#[derive(Debug)]
pub struct QueuedRequest {
    // ---
    pub payload: Vec<u8>,

    pub enqueued_at: Instant,

    pub on_sent: Option<oneshot::Sender<()>>,
}

// ---------------------------------------------------------------------------
// Admitted
// ---------------------------------------------------------------------------

/// A request dequeued by [`RateQueue::take_ready`] and reserved in the
/// pending set.  The holder must resolve it with either
/// [`RateQueue::confirm_sent`] or [`RateQueue::abort_pending`].
#[derive(Debug)]
pub struct Admitted {
    // ---
    pub id: u64,
    pub payload: Vec<u8>,
    pub on_sent: Option<oneshot::Sender<()>>,
}

// ---------------------------------------------------------------------------
// RateQueue
// ---------------------------------------------------------------------------

struct QueueInner {
    // ---
    monitor: RateClassMonitor,

    /// Oldest first.  Ids are queue-local and monotonically assigned.
    fifo: VecDeque<(u64, QueuedRequest)>,

    /// Ids dequeued but not yet confirmed sent.
    pending: HashSet<u64>,

    next_id: u64,
}

// ---

/// FIFO of outbound requests for one rate class.
pub struct RateQueue {
    // ---
    class: RateClassId,

    /// Connection-level pause flag, shared with the scheduler.
    paused: Arc<AtomicBool>,

    inner: Mutex<QueueInner>,
}

// ---

impl RateQueue {
    // ---

    pub fn new(monitor: RateClassMonitor, paused: Arc<AtomicBool>) -> Self {
        // ---
        Self {
            class: monitor.descriptor().id,
            paused,
            inner: Mutex::new(QueueInner {
                monitor,
                fifo: VecDeque::new(),
                pending: HashSet::new(),
                next_id: 0,
            }),
        }
    }

    // ---

    pub fn class(&self) -> RateClassId {
        self.class
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.fifo.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.fifo.is_empty()
    }

    // ---

    /// Append a request at the tail.
    pub async fn push(&self, request: QueuedRequest) {
        // ---
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.fifo.push_back((id, request));
    }

    // ---

    /// Atomically dequeue every request admissible right now.
    ///
    /// Returns empty when the queue is closed (empty or paused).  Otherwise
    /// admits up to `possible_cmd_count(now) − |pending|` oldest requests
    /// and moves their ids into the pending set before returning.
    pub async fn take_ready(&self, now_ms: u64) -> Vec<Admitted> {
        // ---
        if self.paused.load(Ordering::Acquire) {
            return Vec::new();
        }

        let mut inner = self.inner.lock().await;
        if inner.fifo.is_empty() {
            return Vec::new();
        }

        inner.monitor.refresh_limited(now_ms);
        let possible = inner.monitor.possible_cmd_count(now_ms);
        let admissible = possible
            .saturating_sub(inner.pending.len())
            .min(inner.fifo.len());

        let mut batch = Vec::with_capacity(admissible);
        for _ in 0..admissible {
            let Some((id, request)) = inner.fifo.pop_front() else {
                break;
            };
            inner.pending.insert(id);
            batch.push(Admitted {
                id,
                payload: request.payload,
                on_sent: request.on_sent,
            });
        }
        batch
    }

    // ---

    /// The frame reached the wire: release the pending reservation and
    /// fold the send into the moving average.
    pub async fn confirm_sent(&self, id: u64, now_ms: u64) {
        // ---
        let mut inner = self.inner.lock().await;
        if inner.pending.remove(&id) {
            inner.monitor.update_rate(now_ms);
        } else {
            tracing::warn!(class = %self.class, id, "confirm for unknown pending id");
        }
    }

    // ---

    /// The send failed: release the reservation without a rate update.
    pub async fn abort_pending(&self, id: u64) {
        // ---
        self.inner.lock().await.pending.remove(&id);
    }

    // ---

    /// How long until the next request could be admitted.
    ///
    /// `None` when there is nothing to wait *for*: the queue is closed
    /// (empty or paused), or no finite wait reaches the threshold — in
    /// every such case a push, unpause, or server notice wakes the
    /// scheduler instead.
    pub async fn next_wait(&self, now_ms: u64) -> Option<u64> {
        // ---
        if self.paused.load(Ordering::Acquire) {
            return None;
        }
        let mut inner = self.inner.lock().await;
        if inner.fifo.is_empty() {
            return None;
        }
        inner.monitor.refresh_limited(now_ms);
        inner.monitor.optimal_wait_time(now_ms)
    }

    // ---

    /// Server rate push for this class.
    pub async fn apply_server_update(&self, code: RateNoticeCode, update: RateClassUpdate) {
        // ---
        self.inner.lock().await.monitor.apply_server_update(code, update);
    }

    // ---

    /// Snapshot of (current average, limited flag) for logging.
    pub async fn rate_snapshot(&self) -> (u64, bool) {
        // ---
        let inner = self.inner.lock().await;
        (inner.monitor.current_avg(), inner.monitor.is_limited())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
