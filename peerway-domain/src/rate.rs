//! Rate-class descriptors and the windowed-average monitor.
//!
//! The server buckets every outbound request type into a *rate class* and
//! throttles each class on a moving average of the last `window_size`
//! inter-send intervals (milliseconds).  [`RateClassMonitor`] reproduces
//! that arithmetic on the client so the dispatch layer can predict, before
//! sending, whether a request would push the class into the limited band.
//!
//! The monitor is deliberately pure: it takes `now` as a millisecond
//! timestamp parameter and owns no clock, no lock, and no I/O.  The
//! dispatch layer (`peerway-throttle`) wraps it in a queue-level lock and
//! exposes only compound check-then-act operations, preserving the
//! no-over-admission invariant without relying on caller discipline.
//!
//! ## The window formula
//!
//! ```text
//! avg' = (avg × (window_size − 1) + clamp(elapsed, 0, max_interval)) / window_size
//! ```
//!
//! Integer division, truncating.  A short `elapsed` drags the average
//! down; once it sinks to `limited_avg` the server stops serving the
//! class, and it stays limited until the average climbs back to
//! `clear_avg` (hysteresis) or the server says otherwise.

use std::fmt;

// ---------------------------------------------------------------------------
// RateClassId
// ---------------------------------------------------------------------------

/// Server-assigned identifier of one throttling category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RateClassId(u16);

// ---

impl RateClassId {
    // ---
    pub fn from_u16(value: u16) -> Self {
        Self(value)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for RateClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// RateClassDescriptor
// ---------------------------------------------------------------------------

/// Immutable, server-provided parameters of one rate class.
///
/// All averages and intervals are in milliseconds.  Thresholds are ordered
/// `disconnect_avg < limited_avg < warn_avg < clear_avg` in practice; the
/// engine validates the pieces it depends on in [`Self::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateClassDescriptor {
    // ---
    pub id: RateClassId,

    /// Number of inter-send intervals in the moving window.
    pub window_size: u32,

    /// Average at or above which a limited class becomes clear again.
    pub clear_avg: u64,

    /// Average below which the server warns (informational only here).
    pub warn_avg: u64,

    /// Average at or below which the class becomes limited.
    pub limited_avg: u64,

    /// Average at or below which the server disconnects the client.
    pub disconnect_avg: u64,

    /// Elapsed time is clamped to this before entering the window, so one
    /// long idle period cannot bank unbounded burst capacity.
    pub max_interval: u64,
}

// ---

impl RateClassDescriptor {
    // ---

    /// Check the invariants the monitor arithmetic depends on.
    ///
    /// A descriptor that fails here must be rejected for this class only;
    /// other classes keep running.
    pub fn validate(&self) -> Result<(), String> {
        // ---
        if self.window_size == 0 {
            return Err("window_size must be non-zero".into());
        }
        if self.limited_avg > self.clear_avg {
            return Err(format!(
                "limited_avg {} exceeds clear_avg {}",
                self.limited_avg, self.clear_avg
            ));
        }
        if self.disconnect_avg > self.limited_avg {
            return Err(format!(
                "disconnect_avg {} exceeds limited_avg {}",
                self.disconnect_avg, self.limited_avg
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RateNoticeCode
// ---------------------------------------------------------------------------

/// Discriminant of a server rate notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateNoticeCode {
    /// Parameter change — new descriptor values, no state change implied.
    ParamChange,

    /// The class is approaching its limit.
    Warned,

    /// The server has started dropping requests for this class.
    Limited,

    /// The server is serving the class again.
    Cleared,
}

// ---------------------------------------------------------------------------
// RateClassUpdate
// ---------------------------------------------------------------------------

/// One entry of a server rate-table push: the descriptor snapshot plus the
/// server's view of the current average.
#[derive(Debug, Clone)]
pub struct RateClassUpdate {
    // ---
    pub descriptor: RateClassDescriptor,
    pub current_avg: u64,
}

// ---------------------------------------------------------------------------
// RateClassMonitor
// ---------------------------------------------------------------------------

/// Tracks one rate class's moving average and answers the three questions
/// the dispatch layer asks: is the class limited, how many sends fit right
/// now, and how long until the next send fits.
///
/// Timestamps are caller-supplied milliseconds from an arbitrary monotonic
/// epoch.  Before the first recorded send the monitor reports the
/// server-seeded average as-is — there is no "elapsed since never".
#[derive(Debug, Clone)]
pub struct RateClassMonitor {
    // ---
    descriptor: RateClassDescriptor,

    /// Current windowed average in ms.
    current_avg: u64,

    /// Limited flag with hysteresis; may also be forced by server notices.
    limited: bool,

    /// Per-class margin override; `None` inherits `default_margin`.
    margin_override: Option<u64>,

    /// Connection-wide safety margin (ms) added to thresholds so clock
    /// drift between client and server cannot push us over the line.
    default_margin: u64,

    /// Timestamp of the last admitted send, `None` before the first.
    last_send: Option<u64>,
}

// ---

impl RateClassMonitor {
    // ---

    /// Build a monitor from a server snapshot.
    ///
    /// `default_margin` is the connection-level error margin inherited by
    /// every class that carries no override of its own.
    pub fn new(descriptor: RateClassDescriptor, seed_avg: u64, default_margin: u64) -> Self {
        // ---
        Self {
            descriptor,
            current_avg: seed_avg,
            limited: false,
            margin_override: None,
            default_margin,
            last_send: None,
        }
    }

    // ---

    pub fn descriptor(&self) -> &RateClassDescriptor {
        &self.descriptor
    }

    pub fn current_avg(&self) -> u64 {
        self.current_avg
    }

    pub fn is_limited(&self) -> bool {
        self.limited
    }

    /// Override this class's error margin; `None` reverts to the
    /// connection default.
    pub fn set_margin_override(&mut self, margin: Option<u64>) {
        self.margin_override = margin;
    }

    fn error_margin(&self) -> u64 {
        self.margin_override.unwrap_or(self.default_margin)
    }

    // ---

    /// One application of the window formula.
    fn next_avg(&self, avg: u64, elapsed: u64) -> u64 {
        // ---
        let w = u64::from(self.descriptor.window_size);
        let clamped = elapsed.min(self.descriptor.max_interval);
        (avg * (w - 1) + clamped) / w
    }

    // ---

    /// The average a send admitted at `now` would produce.
    ///
    /// Before the first recorded send this is the seeded average itself.
    pub fn potential_avg(&self, now: u64) -> u64 {
        // ---
        match self.last_send {
            None => self.current_avg,
            Some(t) => self.next_avg(self.current_avg, now.saturating_sub(t)),
        }
    }

    // ---

    /// Number of additional sends admissible at `now` without sinking the
    /// average below `limited_avg + margin`.  Zero while limited.
    ///
    /// The first hypothetical send uses the real elapsed time; every
    /// subsequent one in the same instant contributes a zero interval.
    /// Before any recorded send the count comes from the seeded average,
    /// with a floor of one — there is no send history to throttle yet.
    pub fn possible_cmd_count(&self, now: u64) -> usize {
        // ---
        if self.limited {
            return 0;
        }

        // Floor of at least 1 so a zero threshold+margin class still
        // terminates once the hypothetical average decays to zero.
        let floor = (self.descriptor.limited_avg + self.error_margin()).max(1);
        let mut avg = self.potential_avg(now);
        let mut count = 0usize;

        while avg >= floor {
            count += 1;
            avg = self.next_avg(avg, 0);
        }

        if self.last_send.is_none() {
            count = count.max(1);
        }
        count
    }

    // ---

    /// Smallest wait `D ≥ 0` such that a send at `now + D` lands at or
    /// above `threshold + margin`, where the threshold is `clear_avg`
    /// while limited and `limited_avg` otherwise.  `None` when no finite
    /// wait can get there (the clamp caps what one interval contributes,
    /// and nothing moves the average until a send or server update) — the
    /// caller parks instead of polling.
    ///
    /// Solved by inverting the window formula rather than by search:
    /// `floor((avg·(w−1) + E) / w) ≥ T  ⟺  E ≥ T·w − avg·(w−1)`, so the
    /// required total elapsed time is exactly `T·w − avg·(w−1)` and the
    /// wait is whatever part of it has not already passed.  Negative
    /// intermediates clamp to zero; accounting violations are never
    /// surfaced to callers.
    pub fn optimal_wait_time(&self, now: u64) -> Option<u64> {
        // ---
        let target = self.wait_target();

        let Some(last) = self.last_send else {
            // Nothing sent yet.  The first send is always admissible; a
            // server-forced limit holds until the seeded average clears.
            return if !self.limited || self.current_avg >= self.descriptor.clear_avg {
                Some(0)
            } else {
                None
            };
        };

        let w = u64::from(self.descriptor.window_size);
        let needed_elapsed = (target * w).saturating_sub(self.current_avg * (w - 1));
        if needed_elapsed > self.descriptor.max_interval {
            // The elapsed clamp makes the target unreachable by waiting.
            return None;
        }

        let elapsed = now.saturating_sub(last);
        Some(needed_elapsed.saturating_sub(elapsed))
    }

    // ---

    fn wait_target(&self) -> u64 {
        // ---
        let threshold = if self.limited {
            self.descriptor.clear_avg
        } else {
            self.descriptor.limited_avg
        };
        threshold + self.error_margin()
    }

    // ---

    /// Re-evaluate the limited flag against the average the class would
    /// show right now.  Keeps the hysteresis observable while no sends
    /// flow: a limited class whose window has drained past `clear_avg`
    /// clears without waiting for a server notice.
    pub fn refresh_limited(&mut self, now: u64) {
        // ---
        if self.limited && self.potential_avg(now) >= self.descriptor.clear_avg {
            self.limited = false;
        }
    }

    // ---

    /// Record one admitted send at `now`: fold the elapsed interval into
    /// the average and re-evaluate the limited flag.
    ///
    /// Call exactly once per send, at send-confirmation time.
    pub fn update_rate(&mut self, now: u64) {
        // ---
        self.current_avg = self.potential_avg(now);
        self.last_send = Some(now);
        self.reconcile_limited();
    }

    // ---

    /// Apply an authoritative server push: descriptor snapshot, the
    /// server's current average, and the notice code.  Overwrites local
    /// state, reconciling any drift between the two ends.
    pub fn apply_server_update(&mut self, code: RateNoticeCode, update: RateClassUpdate) {
        // ---
        self.descriptor = update.descriptor;
        self.current_avg = update.current_avg;

        match code {
            RateNoticeCode::Limited => self.limited = true,
            RateNoticeCode::Cleared => self.limited = false,
            RateNoticeCode::ParamChange | RateNoticeCode::Warned => self.reconcile_limited(),
        }
    }

    // ---

    /// Hysteresis: entering the limited band sets the flag; only climbing
    /// back to `clear_avg` (or an explicit server notice) clears it.
    fn reconcile_limited(&mut self) {
        // ---
        if self.current_avg <= self.descriptor.limited_avg {
            self.limited = true;
        } else if self.limited && self.current_avg >= self.descriptor.clear_avg {
            self.limited = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    // ---

    fn descriptor() -> RateClassDescriptor {
        RateClassDescriptor {
            id: RateClassId::from_u16(1),
            window_size: 5,
            clear_avg: 5_100,
            warn_avg: 4_500,
            limited_avg: 3_000,
            disconnect_avg: 2_000,
            max_interval: 60_000,
        }
    }

    fn monitor(seed: u64) -> RateClassMonitor {
        RateClassMonitor::new(descriptor(), seed, 100)
    }

    // ---

    #[test]
    fn seeded_sequence_matches_window_arithmetic() {
        // ---
        // Seed 5000, window 5, elapsed 100 then 0 then 0:
        //   (5000·4 + 100) / 5 = 4020
        //   (4020·4 +   0) / 5 = 3216
        //   (3216·4 +   0) / 5 = 2572   (integer truncation)
        let mut m = monitor(5_000);

        m.update_rate(1_000); // first send — seeded average, no elapsed term
        assert_eq!(m.current_avg(), 5_000);

        m.update_rate(1_100);
        assert_eq!(m.current_avg(), 4_020);

        m.update_rate(1_100);
        assert_eq!(m.current_avg(), 3_216);

        m.update_rate(1_100);
        assert_eq!(m.current_avg(), 2_572);
    }

    // ---

    #[test]
    fn first_send_uses_seeded_average() {
        // ---
        let m = monitor(4_200);
        // No send recorded yet: the potential average is the seed, however
        // far in the future we ask.
        assert_eq!(m.potential_avg(0), 4_200);
        assert_eq!(m.potential_avg(999_999), 4_200);
        assert_eq!(m.optimal_wait_time(123_456), Some(0));
    }

    // ---

    #[test]
    fn elapsed_clamped_to_max_interval() {
        // ---
        let mut m = monitor(5_000);
        m.update_rate(0);

        // A week of idle counts as max_interval, no more.
        let capped = m.potential_avg(7 * 24 * 3_600 * 1_000);
        let at_max = m.potential_avg(60_000);
        assert_eq!(capped, at_max);
        assert_eq!(at_max, (5_000 * 4 + 60_000) / 5);
    }

    // ---

    #[test]
    fn limited_band_admits_nothing() {
        // ---
        let d = descriptor();
        for avg in (d.disconnect_avg..=d.limited_avg).step_by(50) {
            let mut m = monitor(avg);
            m.update_rate(10_000);
            assert_eq!(
                m.possible_cmd_count(10_000),
                0,
                "avg {avg} is inside the limited band"
            );
        }
    }

    // ---

    #[test]
    fn possible_count_drains_capacity() {
        // ---
        let mut m = monitor(6_000);
        m.update_rate(1_000);

        let n = m.possible_cmd_count(1_000);
        assert!(n > 0, "healthy average must admit something");

        // Consuming exactly n sends at the same instant lands us at zero.
        for _ in 0..n {
            m.update_rate(1_000);
        }
        assert_eq!(m.possible_cmd_count(1_000), 0);
        assert!(!m.is_limited(), "margin keeps us shy of the limited band");
    }

    // ---

    #[test]
    fn optimal_wait_is_tight() {
        // ---
        for seed in [3_200u64, 3_500, 4_000, 5_000, 6_000] {
            let mut m = monitor(seed);
            m.update_rate(50_000);

            // Burn capacity until a wait is actually required.
            while m.possible_cmd_count(50_000) > 0 {
                m.update_rate(50_000);
            }

            let wait = m.optimal_wait_time(50_000).expect("threshold reachable");
            assert!(wait > 0, "seed {seed}: exhausted class must impose a wait");

            let threshold = if m.is_limited() { 5_100 } else { 3_000 } + 100;
            assert!(
                m.potential_avg(50_000 + wait) >= threshold,
                "seed {seed}: waiting exactly {wait}ms must reach the threshold"
            );
            if wait > 10 {
                assert!(
                    m.potential_avg(50_000 + wait - 10) < threshold,
                    "seed {seed}: waiting {wait}−10ms must fall short"
                );
            }
        }
    }

    // ---

    #[test]
    fn hysteresis_holds_until_clear() {
        // ---
        let mut m = monitor(3_050);
        m.update_rate(0);

        // One quick send drops the average into the limited band.
        m.update_rate(0);
        assert!(m.is_limited());

        // Climbing back above limited_avg but short of clear_avg does not
        // clear the flag.
        let wait = m.optimal_wait_time(0).expect("threshold reachable");
        m.update_rate(wait);
        assert!(m.current_avg() >= 5_100, "wait targets clear_avg + margin");
        assert!(!m.is_limited(), "reaching clear_avg clears the flag");
    }

    // ---

    #[test]
    fn partial_recovery_stays_limited() {
        // ---
        let mut m = monitor(2_900);
        m.update_rate(0);
        assert!(m.is_limited());

        // 4s of elapsed lifts the average above limited_avg (3000) but
        // below clear_avg (5100): still limited.
        m.update_rate(4_000);
        assert!(m.current_avg() > 3_000 && m.current_avg() < 5_100);
        assert!(m.is_limited());
        assert_eq!(m.possible_cmd_count(4_000), 0);
    }

    // ---

    #[test]
    fn server_limited_notice_overrides_local_average() {
        // ---
        let mut m = monitor(8_000);
        m.update_rate(0);
        assert!(!m.is_limited());

        // Server says limited even though our local math disagrees.
        m.apply_server_update(
            RateNoticeCode::Limited,
            RateClassUpdate {
                descriptor: descriptor(),
                current_avg: 8_000,
            },
        );
        assert!(m.is_limited());
        assert_eq!(m.possible_cmd_count(0), 0);

        // And cleared lifts it regardless of the average.
        m.apply_server_update(
            RateNoticeCode::Cleared,
            RateClassUpdate {
                descriptor: descriptor(),
                current_avg: 3_500,
            },
        );
        assert!(!m.is_limited());
    }

    // ---

    #[test]
    fn margin_inherits_connection_default() {
        // ---
        let mut m = RateClassMonitor::new(descriptor(), 3_900, 100);
        m.update_rate(0);
        // 3900·4/5 = 3120 ≥ 3000 + 100 → one send fits under the default
        // margin, and the next (3120·4/5 = 2496) does not.
        assert_eq!(m.possible_cmd_count(0), 1);

        // A larger per-class override eats that headroom.
        m.set_margin_override(Some(500));
        assert_eq!(m.possible_cmd_count(0), 0);

        // Reverting to the default restores it.
        m.set_margin_override(None);
        assert_eq!(m.possible_cmd_count(0), 1);
    }

    // ---

    #[test]
    fn limited_flag_refreshes_once_window_drains() {
        // ---
        let mut m = monitor(2_900);
        m.update_rate(0);
        assert!(m.is_limited());

        // 13.9s of silence lifts the potential average to clear_avg
        // exactly: (2900·4 + 13900) / 5 = 5100.
        m.refresh_limited(13_000);
        assert!(m.is_limited(), "too early — potential still below clear");
        m.refresh_limited(13_900);
        assert!(!m.is_limited());
    }

    // ---

    #[test]
    fn unreachable_threshold_parks_instead_of_waiting() {
        // ---
        let mut d = descriptor();
        d.max_interval = 1_000; // one interval can contribute 1s at most
        let mut m = RateClassMonitor::new(d, 500, 100);
        m.update_rate(0);
        assert!(m.is_limited());

        // clear target 5200·5 − 500·4 = 24000 ≫ max_interval.
        assert_eq!(m.optimal_wait_time(0), None);
    }

    // ---

    #[test]
    fn descriptor_validation_rejects_nonsense() {
        // ---
        let mut d = descriptor();
        d.window_size = 0;
        assert!(d.validate().is_err());

        let mut d = descriptor();
        d.limited_avg = d.clear_avg + 1;
        assert!(d.validate().is_err());

        assert!(descriptor().validate().is_ok());
    }
}
