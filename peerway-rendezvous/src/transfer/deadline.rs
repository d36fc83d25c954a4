//! [`PausableDeadline`] — the transfer's event deadline.
//!
//! A transfer worker must keep observing protocol events (headers, data
//! chunks); if nothing arrives before the deadline the transfer fails.
//! Local checksumming can legitimately take a while and exchanges nothing
//! on the wire, so it pauses the countdown and resumes it afterwards.
//! Progress resets the countdown via [`PausableDeadline::touch`].

use std::sync::Mutex;

// ---

use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// PausableDeadline
// ---------------------------------------------------------------------------

struct DeadlineState {
    // ---
    /// Countdown budget left when (re)armed.
    remaining: Duration,

    /// Arm timestamp; `None` while paused.
    armed_at: Option<Instant>,
}

// ---

pub struct PausableDeadline {
    // ---
    timeout: Duration,
    state: Mutex<DeadlineState>,

    /// Signalled on every pause/resume/touch so a parked
    /// [`Self::expired`] re-reads the state.
    changed: Notify,
}

// ---

impl PausableDeadline {
    // ---

    /// Create an armed deadline with `timeout` on the clock.
    pub fn new(timeout: Duration) -> Self {
        // ---
        Self {
            timeout,
            state: Mutex::new(DeadlineState {
                remaining: timeout,
                armed_at: Some(Instant::now()),
            }),
            changed: Notify::new(),
        }
    }

    // ---

    /// Stop the countdown, banking whatever time is left.
    pub fn pause(&self) {
        // ---
        let mut state = self.lock();
        if let Some(armed) = state.armed_at.take() {
            state.remaining = state.remaining.saturating_sub(armed.elapsed());
        }
        self.changed.notify_waiters();
    }

    // ---

    /// Restart the countdown from the banked remainder.
    pub fn resume(&self) {
        // ---
        let mut state = self.lock();
        if state.armed_at.is_none() {
            state.armed_at = Some(Instant::now());
        }
        self.changed.notify_waiters();
    }

    // ---

    /// Protocol progress: reset the countdown to the full timeout.
    /// No-op while paused (the pause owner resumes with a fresh budget).
    pub fn touch(&self) {
        // ---
        let mut state = self.lock();
        state.remaining = self.timeout;
        if state.armed_at.is_some() {
            state.armed_at = Some(Instant::now());
        }
        self.changed.notify_waiters();
    }

    // ---

    /// Resolve when the countdown runs out.  Never resolves while paused.
    pub async fn expired(&self) {
        // ---
        loop {
            let wake_at = {
                let state = self.lock();
                state.armed_at.map(|armed| armed + state.remaining)
            };

            match wake_at {
                Some(at) => {
                    if Instant::now() >= at {
                        return;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => return,
                        _ = self.changed.notified() => {}
                    }
                }
                // Paused — wait for a resume.
                None => self.changed.notified().await,
            }
        }
    }

    // ---

    fn lock(&self) -> std::sync::MutexGuard<'_, DeadlineState> {
        // Mutex is only held for field updates; poisoning cannot happen.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
