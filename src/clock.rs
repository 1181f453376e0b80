use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ClockError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockState {
    NotStarted,
    Ticking,
    Paused,
    Timeout,
}

/// Countdown timer for one side with increment-on-move.
///
/// The clock stores anchors only: the credit granted so far, the time consumed
/// by finished ticking segments, and the instant the current segment began.
/// Remaining time and the `Timeout` state are derived from those anchors on
/// every query, so there is nothing to poll and nothing to drift.
///
/// Every operation has an `*_at` form taking an explicit `now`; the plain form
/// reads the tokio clock.
#[derive(Debug, Clone)]
pub struct Clock {
    base_time: Duration,
    increment: Duration,
    total_credit: Duration,
    consumed: Duration,
    started_at: Option<Instant>,
    started_once: bool,
}

impl Clock {
    pub fn new(base_time: Duration, increment: Duration) -> Self {
        Self {
            base_time,
            increment,
            total_credit: base_time,
            consumed: Duration::ZERO,
            started_at: None,
            started_once: false,
        }
    }

    pub fn base_time(&self) -> Duration {
        self.base_time
    }

    pub fn increment(&self) -> Duration {
        self.increment
    }

    /// Base time plus every increment credited so far.
    pub fn total_credit(&self) -> Duration {
        self.total_credit
    }

    pub fn state(&self) -> ClockState {
        self.state_at(Instant::now())
    }

    pub fn state_at(&self, now: Instant) -> ClockState {
        if !self.started_once {
            return ClockState::NotStarted;
        }
        if self.remaining_at(now).is_zero() {
            return ClockState::Timeout;
        }
        if self.started_at.is_some() {
            ClockState::Ticking
        } else {
            ClockState::Paused
        }
    }

    pub fn remaining(&self) -> Duration {
        self.remaining_at(Instant::now())
    }

    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.total_credit
            .saturating_sub(self.consumed + self.running_for(now))
    }

    pub fn elapsed_at(&self, now: Instant) -> Duration {
        self.total_credit - self.remaining_at(now)
    }

    /// Remaining time rounded to whole seconds, for display.
    pub fn remaining_secs_at(&self, now: Instant) -> u64 {
        (self.remaining_at(now).as_millis() as u64 + 500) / 1000
    }

    /// Share of the total credit still left, rounded to a whole percent.
    pub fn percent_remaining_at(&self, now: Instant) -> u8 {
        let total = self.total_credit.as_nanos();
        if total == 0 {
            return 0;
        }
        let remaining = self.remaining_at(now).as_nanos();
        ((remaining * 100 + total / 2) / total) as u8
    }

    pub fn start(&mut self) -> Result<(), ClockError> {
        self.start_at(Instant::now())
    }

    pub fn start_at(&mut self, now: Instant) -> Result<(), ClockError> {
        if self.started_once {
            return Err(ClockError::AlreadyStarted);
        }
        self.started_once = true;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn pause(&mut self, apply_increment: bool) -> Result<(), ClockError> {
        self.pause_at(Instant::now(), apply_increment)
    }

    pub fn pause_at(&mut self, now: Instant, apply_increment: bool) -> Result<(), ClockError> {
        if self.state_at(now) != ClockState::Ticking {
            return Err(ClockError::NotTicking);
        }
        self.fold_running(now);
        if apply_increment {
            self.total_credit += self.increment;
        }
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), ClockError> {
        self.resume_at(Instant::now())
    }

    pub fn resume_at(&mut self, now: Instant) -> Result<(), ClockError> {
        if self.state_at(now) != ClockState::Paused {
            return Err(ClockError::NotPaused);
        }
        self.started_at = Some(now);
        Ok(())
    }

    pub fn freeze(&mut self) {
        self.freeze_at(Instant::now());
    }

    /// Stop the current segment without crediting an increment. Valid in any
    /// state; a clock that already ran out stays in `Timeout`.
    pub fn freeze_at(&mut self, now: Instant) {
        self.fold_running(now);
    }

    pub fn sync(&mut self, remaining: Duration, ticking: bool) {
        self.sync_at(Instant::now(), remaining, ticking);
    }

    /// Re-anchor to an externally reported remaining time.
    pub fn sync_at(&mut self, now: Instant, remaining: Duration, ticking: bool) {
        if remaining > self.total_credit {
            self.total_credit = remaining;
        }
        self.consumed = self.total_credit - remaining;
        self.started_once = true;
        self.started_at = ticking.then_some(now);
    }

    fn running_for(&self, now: Instant) -> Duration {
        self.started_at
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default()
    }

    fn fold_running(&mut self, now: Instant) {
        let running = self.running_for(now);
        self.consumed = (self.consumed + running).min(self.total_credit);
        self.started_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(value: u64) -> Duration {
        Duration::from_secs(value)
    }

    #[test]
    fn lifecycle_transitions() {
        let t0 = Instant::now();
        let mut clock = Clock::new(secs(60), secs(2));
        assert_eq!(clock.state_at(t0), ClockState::NotStarted);
        assert_eq!(clock.remaining_at(t0 + secs(30)), secs(60));

        clock.start_at(t0).unwrap();
        assert_eq!(clock.state_at(t0 + secs(10)), ClockState::Ticking);
        assert_eq!(clock.remaining_at(t0 + secs(10)), secs(50));

        clock.pause_at(t0 + secs(10), true).unwrap();
        assert_eq!(clock.state_at(t0 + secs(100)), ClockState::Paused);
        assert_eq!(clock.remaining_at(t0 + secs(100)), secs(52));

        clock.resume_at(t0 + secs(100)).unwrap();
        assert_eq!(clock.remaining_at(t0 + secs(110)), secs(42));
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let t0 = Instant::now();
        let mut clock = Clock::new(secs(60), Duration::ZERO);
        assert_eq!(clock.pause_at(t0, true), Err(ClockError::NotTicking));
        assert_eq!(clock.resume_at(t0), Err(ClockError::NotPaused));

        clock.start_at(t0).unwrap();
        assert_eq!(clock.start_at(t0), Err(ClockError::AlreadyStarted));
        assert_eq!(clock.resume_at(t0), Err(ClockError::NotPaused));

        clock.pause_at(t0 + secs(1), false).unwrap();
        assert_eq!(clock.pause_at(t0 + secs(2), false), Err(ClockError::NotTicking));
        assert_eq!(clock.start_at(t0 + secs(2)), Err(ClockError::AlreadyStarted));
    }

    #[test]
    fn zero_base_time_times_out_on_next_query() {
        let t0 = Instant::now();
        let mut clock = Clock::new(Duration::ZERO, Duration::ZERO);
        clock.start_at(t0).unwrap();
        assert_eq!(clock.state_at(t0), ClockState::Timeout);
        assert_eq!(clock.pause_at(t0, true), Err(ClockError::NotTicking));
    }

    #[test]
    fn zero_base_time_times_out_with_real_clock() {
        let mut clock = Clock::new(Duration::ZERO, Duration::ZERO);
        clock.start().unwrap();
        assert_eq!(clock.state(), ClockState::Timeout);
        assert_eq!(clock.remaining(), Duration::ZERO);
    }

    #[test]
    fn long_idle_gap_reports_timeout_and_clamps() {
        let t0 = Instant::now();
        let mut clock = Clock::new(secs(5), secs(3));
        clock.start_at(t0).unwrap();

        let later = t0 + secs(3600);
        assert_eq!(clock.remaining_at(later), Duration::ZERO);
        assert_eq!(clock.state_at(later), ClockState::Timeout);
        assert_eq!(clock.pause_at(later, true), Err(ClockError::NotTicking));
        assert_eq!(clock.total_credit(), secs(5));
    }

    #[test]
    fn credit_is_conserved_across_many_moves() {
        let t0 = Instant::now();
        let mut clock = Clock::new(secs(600), secs(5));
        clock.start_at(t0).unwrap();

        let mut now = t0;
        let moves = 300u32;
        for n in 0..moves {
            now += Duration::from_millis(1_337);
            clock.pause_at(now, true).unwrap();
            now += Duration::from_millis(2_000);
            if n + 1 < moves {
                clock.resume_at(now).unwrap();
            }
        }

        assert_eq!(clock.total_credit(), secs(600) + secs(5) * moves);
        let expected_used = Duration::from_millis(1_337) * moves;
        assert_eq!(clock.remaining_at(now), clock.total_credit() - expected_used);
        assert!(clock.remaining_at(now) <= clock.total_credit());
    }

    #[test]
    fn percent_remaining_never_increases_while_ticking() {
        let t0 = Instant::now();
        let mut clock = Clock::new(secs(200), secs(10));
        clock.start_at(t0).unwrap();

        let mut last = clock.percent_remaining_at(t0);
        assert_eq!(last, 100);
        for step in 1..=250 {
            let now = t0 + Duration::from_millis(step * 997);
            let percent = clock.percent_remaining_at(now);
            assert_eq!(percent, clock.percent_remaining_at(now));
            assert!(percent <= last);
            last = percent;
        }
        assert_eq!(last, 0);
    }

    #[test]
    fn sync_reanchors_remaining_time() {
        let t0 = Instant::now();
        let mut clock = Clock::new(secs(180), secs(2));
        clock.sync_at(t0, secs(95), true);
        assert_eq!(clock.state_at(t0), ClockState::Ticking);
        assert_eq!(clock.remaining_at(t0 + secs(5)), secs(90));

        clock.sync_at(t0 + secs(5), secs(200), false);
        assert_eq!(clock.total_credit(), secs(200));
        assert_eq!(clock.state_at(t0 + secs(50)), ClockState::Paused);
        assert_eq!(clock.remaining_at(t0 + secs(50)), secs(200));
    }

    #[test]
    fn freeze_keeps_remaining_fixed() {
        let t0 = Instant::now();
        let mut clock = Clock::new(secs(30), secs(1));
        clock.start_at(t0).unwrap();
        clock.freeze_at(t0 + secs(12));
        assert_eq!(clock.remaining_at(t0 + secs(500)), secs(18));
        assert_eq!(clock.total_credit(), secs(30));
        assert_eq!(clock.remaining_secs_at(t0 + secs(500)), 18);
    }
}
