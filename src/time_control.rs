use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::clock::{Clock, ClockState};
use crate::domain::{ClockSnapshot, Side};
use crate::error::ClockError;

/// A value for each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PerSide<T> {
    pub white: T,
    pub black: T,
}

impl<T> PerSide<T> {
    pub fn new(white: T, black: T) -> Self {
        Self { white, black }
    }

    pub fn get(&self, side: Side) -> &T {
        match side {
            Side::White => &self.white,
            Side::Black => &self.black,
        }
    }

    pub fn get_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::White => &mut self.white,
            Side::Black => &mut self.black,
        }
    }
}

/// Parsed time-control notation.
///
/// Accepted forms: `5+3` (minutes plus increment seconds), `300;5` or
/// `300;5;180;2` (per-side seconds), and `none` for an unlimited game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimeControlSpec {
    Unlimited,
    Clocked {
        white_base: Duration,
        white_increment: Duration,
        black_base: Duration,
        black_increment: Duration,
    },
}

impl TimeControlSpec {
    pub fn symmetric(base: Duration, increment: Duration) -> Self {
        TimeControlSpec::Clocked {
            white_base: base,
            white_increment: increment,
            black_base: base,
            black_increment: increment,
        }
    }

    /// White's base time and increment, which is what seek and challenge
    /// requests advertise.
    pub fn base_and_increment(&self) -> Option<(Duration, Duration)> {
        match *self {
            TimeControlSpec::Unlimited => None,
            TimeControlSpec::Clocked {
                white_base,
                white_increment,
                ..
            } => Some((white_base, white_increment)),
        }
    }
}

impl FromStr for TimeControlSpec {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        if input.eq_ignore_ascii_case("none") || input == "-" {
            return Ok(TimeControlSpec::Unlimited);
        }

        let parse = |part: &str| {
            part.trim()
                .parse::<u64>()
                .map_err(|_| format!("invalid time control: {input}"))
        };

        if let Some((minutes, increment)) = input.split_once('+') {
            let base = Duration::from_secs(parse(minutes)? * 60);
            return Ok(TimeControlSpec::symmetric(base, Duration::from_secs(parse(increment)?)));
        }

        let parts: Vec<u64> = input.split(';').map(parse).collect::<Result<_, _>>()?;
        match parts.as_slice() {
            [base, increment] => Ok(TimeControlSpec::symmetric(
                Duration::from_secs(*base),
                Duration::from_secs(*increment),
            )),
            [white_base, white_increment, black_base, black_increment] => {
                Ok(TimeControlSpec::Clocked {
                    white_base: Duration::from_secs(*white_base),
                    white_increment: Duration::from_secs(*white_increment),
                    black_base: Duration::from_secs(*black_base),
                    black_increment: Duration::from_secs(*black_increment),
                })
            }
            _ => Err(format!("invalid time control: {input}")),
        }
    }
}

impl TryFrom<String> for TimeControlSpec {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeControlSpec> for String {
    fn from(spec: TimeControlSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for TimeControlSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TimeControlSpec::Unlimited => f.write_str("none"),
            TimeControlSpec::Clocked {
                white_base,
                white_increment,
                black_base,
                black_increment,
            } => {
                if white_base == black_base && white_increment == black_increment {
                    write!(f, "{};{}", white_base.as_secs(), white_increment.as_secs())
                } else {
                    write!(
                        f,
                        "{};{};{};{}",
                        white_base.as_secs(),
                        white_increment.as_secs(),
                        black_base.as_secs(),
                        black_increment.as_secs()
                    )
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Mode {
    Unlimited,
    Clocked {
        clocks: PerSide<Clock>,
        stopped: bool,
    },
}

/// The pair of clocks and the rule deciding which one runs.
///
/// At most one clock ticks at a time: `record_move` always pauses the mover
/// before starting or resuming the opponent. The unlimited configuration
/// accepts every call and never forfeits.
#[derive(Debug, Clone)]
pub struct TimeControl {
    mode: Mode,
}

impl TimeControl {
    pub fn unlimited() -> Self {
        Self {
            mode: Mode::Unlimited,
        }
    }

    pub fn new(base_time: Duration, increment: Duration) -> Self {
        Self::from_spec(TimeControlSpec::symmetric(base_time, increment))
    }

    pub fn from_spec(spec: TimeControlSpec) -> Self {
        match spec {
            TimeControlSpec::Unlimited => Self::unlimited(),
            TimeControlSpec::Clocked {
                white_base,
                white_increment,
                black_base,
                black_increment,
            } => Self {
                mode: Mode::Clocked {
                    clocks: PerSide::new(
                        Clock::new(white_base, white_increment),
                        Clock::new(black_base, black_increment),
                    ),
                    stopped: false,
                },
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.mode, Mode::Clocked { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.mode, Mode::Clocked { stopped: true, .. })
    }

    pub fn clock(&self, side: Side) -> Option<&Clock> {
        match &self.mode {
            Mode::Unlimited => None,
            Mode::Clocked { clocks, .. } => Some(clocks.get(side)),
        }
    }

    /// Start the clock of the side that moves first.
    pub fn start_game(&mut self, first_to_move: Side) -> Result<(), ClockError> {
        match &mut self.mode {
            Mode::Clocked {
                clocks,
                stopped: false,
            } => clocks.get_mut(first_to_move).start(),
            _ => Ok(()),
        }
    }

    pub fn record_move(&mut self, mover: Side) -> Result<(), ClockError> {
        let Mode::Clocked {
            clocks,
            stopped: false,
        } = &mut self.mode
        else {
            return Ok(());
        };

        let now = Instant::now();
        let own = clocks.get_mut(mover);
        if own.state_at(now) == ClockState::Ticking {
            own.pause_at(now, true)?;
        }

        let opponent = clocks.get_mut(mover.opponent());
        match opponent.state_at(now) {
            ClockState::NotStarted => opponent.start_at(now),
            ClockState::Ticking => Ok(()),
            _ => opponent.resume_at(now),
        }
    }

    /// Freeze both clocks for good. Later calls other than queries are no-ops.
    pub fn stop(&mut self) {
        if let Mode::Clocked { clocks, stopped } = &mut self.mode {
            let now = Instant::now();
            clocks.white.freeze_at(now);
            clocks.black.freeze_at(now);
            *stopped = true;
        }
    }

    /// Overwrite both clocks with server-reported values. `running` names the
    /// side whose clock keeps counting down until the next report.
    pub fn sync_remote(&mut self, white: Duration, black: Duration, running: Option<Side>) {
        if let Mode::Clocked {
            clocks,
            stopped: false,
        } = &mut self.mode
        {
            let now = Instant::now();
            clocks.white.sync_at(now, white, running == Some(Side::White));
            clocks.black.sync_at(now, black, running == Some(Side::Black));
        }
    }

    pub fn is_forfeited(&self) -> PerSide<bool> {
        let now = Instant::now();
        match &self.mode {
            Mode::Unlimited => PerSide::default(),
            Mode::Clocked { clocks, .. } => PerSide::new(
                clocks.white.state_at(now) == ClockState::Timeout,
                clocks.black.state_at(now) == ClockState::Timeout,
            ),
        }
    }

    pub fn forfeited_side(&self) -> Option<Side> {
        let forfeits = self.is_forfeited();
        Side::ALL.into_iter().find(|side| *forfeits.get(*side))
    }

    pub fn running_side(&self) -> Option<Side> {
        let now = Instant::now();
        let Mode::Clocked { clocks, .. } = &self.mode else {
            return None;
        };
        Side::ALL
            .into_iter()
            .find(|side| clocks.get(*side).state_at(now) == ClockState::Ticking)
    }

    pub fn remaining(&self) -> Option<PerSide<Duration>> {
        let now = Instant::now();
        match &self.mode {
            Mode::Unlimited => None,
            Mode::Clocked { clocks, .. } => Some(PerSide::new(
                clocks.white.remaining_at(now),
                clocks.black.remaining_at(now),
            )),
        }
    }

    pub fn snapshot(&self) -> Option<ClockSnapshot> {
        self.remaining()
            .map(|remaining| ClockSnapshot::new(remaining.white, remaining.black))
    }

    /// Used by callers to throttle low-time warnings. Always 100 without a
    /// time limit.
    pub fn percent_remaining(&self, side: Side) -> u8 {
        match &self.mode {
            Mode::Unlimited => 100,
            Mode::Clocked { clocks, .. } => clocks.get(side).percent_remaining_at(Instant::now()),
        }
    }
}

impl Default for TimeControl {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn secs(value: u64) -> Duration {
        Duration::from_secs(value)
    }

    #[test]
    fn parses_notations() {
        assert_eq!(
            "5+3".parse::<TimeControlSpec>(),
            Ok(TimeControlSpec::symmetric(secs(300), secs(3)))
        );
        assert_eq!(
            "600;5".parse::<TimeControlSpec>(),
            Ok(TimeControlSpec::symmetric(secs(600), secs(5)))
        );
        assert_eq!(
            "300;2;180;0".parse::<TimeControlSpec>(),
            Ok(TimeControlSpec::Clocked {
                white_base: secs(300),
                white_increment: secs(2),
                black_base: secs(180),
                black_increment: secs(0),
            })
        );
        assert_eq!("none".parse::<TimeControlSpec>(), Ok(TimeControlSpec::Unlimited));
        assert!("5+".parse::<TimeControlSpec>().is_err());
        assert!("1;2;3".parse::<TimeControlSpec>().is_err());
        assert!("fast".parse::<TimeControlSpec>().is_err());
    }

    #[test]
    fn spec_display_parses_back() {
        for text in ["300;2", "300;2;180;0", "none"] {
            let spec: TimeControlSpec = text.parse().unwrap();
            assert_eq!(spec.to_string(), text);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn record_move_hands_the_clock_over() {
        let mut tc = TimeControl::new(secs(600), secs(5));
        tc.start_game(Side::White).unwrap();
        assert_eq!(tc.running_side(), Some(Side::White));

        advance(secs(10)).await;
        tc.record_move(Side::White).unwrap();
        assert_eq!(tc.running_side(), Some(Side::Black));
        assert_eq!(tc.clock(Side::Black).unwrap().state(), ClockState::Ticking);

        advance(secs(20)).await;
        tc.record_move(Side::Black).unwrap();
        assert_eq!(tc.running_side(), Some(Side::White));

        let remaining = tc.remaining().unwrap();
        assert_eq!(remaining.white, secs(595));
        assert_eq!(remaining.black, secs(585));
    }

    #[tokio::test(start_paused = true)]
    async fn total_credit_grows_by_one_increment_per_move() {
        let mut tc = TimeControl::new(secs(600), secs(5));
        tc.start_game(Side::White).unwrap();

        let moves = 40u32;
        for _ in 0..moves {
            advance(Duration::from_millis(700)).await;
            tc.record_move(Side::White).unwrap();
            advance(Duration::from_millis(300)).await;
            tc.record_move(Side::Black).unwrap();
        }

        let white = tc.clock(Side::White).unwrap();
        assert_eq!(white.total_credit(), secs(600) + secs(5) * moves);
        assert!(white.remaining() <= white.total_credit());
        assert_eq!(
            white.remaining(),
            white.total_credit() - Duration::from_millis(700) * moves
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_clock_to_expire_forfeits_and_stays_forfeited() {
        let mut tc = TimeControl::new(secs(3), Duration::ZERO);
        tc.start_game(Side::White).unwrap();

        advance(Duration::from_millis(2_500)).await;
        tc.record_move(Side::White).unwrap();
        advance(Duration::from_millis(2_900)).await;
        tc.record_move(Side::Black).unwrap();
        assert_eq!(tc.is_forfeited(), PerSide::new(false, false));

        advance(secs(1)).await;
        assert_eq!(tc.is_forfeited(), PerSide::new(true, false));
        assert_eq!(tc.forfeited_side(), Some(Side::White));

        for _ in 0..5 {
            advance(secs(10)).await;
            assert_eq!(tc.is_forfeited(), PerSide::new(true, false));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_freezes_both_clocks() {
        let mut tc = TimeControl::new(secs(60), secs(1));
        tc.start_game(Side::White).unwrap();
        advance(secs(4)).await;
        tc.stop();
        assert!(tc.is_stopped());

        advance(secs(100)).await;
        tc.record_move(Side::White).unwrap();
        assert_eq!(tc.running_side(), None);
        assert_eq!(tc.remaining().unwrap(), PerSide::new(secs(56), secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn percent_remaining_tracks_the_running_clock() {
        let mut tc = TimeControl::new(secs(100), Duration::ZERO);
        tc.start_game(Side::White).unwrap();
        assert_eq!(tc.percent_remaining(Side::White), 100);

        advance(secs(25)).await;
        assert_eq!(tc.percent_remaining(Side::White), 75);
        assert_eq!(tc.percent_remaining(Side::Black), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_sync_replaces_local_estimate() {
        let mut tc = TimeControl::new(secs(180), secs(2));
        tc.sync_remote(secs(170), secs(175), Some(Side::Black));
        assert_eq!(tc.running_side(), Some(Side::Black));

        advance(secs(5)).await;
        let remaining = tc.remaining().unwrap();
        assert_eq!(remaining.white, secs(170));
        assert_eq!(remaining.black, secs(170));
    }

    #[test]
    fn unlimited_configuration_is_inert() {
        let mut tc = TimeControl::unlimited();
        tc.start_game(Side::White).unwrap();
        tc.record_move(Side::White).unwrap();
        tc.record_move(Side::Black).unwrap();
        tc.stop();
        assert!(!tc.is_enabled());
        assert_eq!(tc.is_forfeited(), PerSide::new(false, false));
        assert_eq!(tc.remaining(), None);
        assert_eq!(tc.percent_remaining(Side::Black), 100);
    }
}
