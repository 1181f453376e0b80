use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shakmaty::variant::Variant;
use shakmaty::{CastlingMode, Color};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    White,
    Black,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::White, Side::Black];

    pub fn opponent(self) -> Side {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::White => "white",
            Side::Black => "black",
        }
    }
}

impl From<Color> for Side {
    fn from(color: Color) -> Self {
        match color {
            Color::White => Side::White,
            Color::Black => Side::Black,
        }
    }
}

impl From<Side> for Color {
    fn from(side: Side) -> Self {
        match side {
            Side::White => Color::White,
            Side::Black => Color::Black,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chess variants a session can be played in. Keys follow the lichess
/// naming so they can be passed through to the server unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GameVariant {
    #[default]
    Standard,
    Chess960,
    Crazyhouse,
    Atomic,
    Antichess,
    KingOfTheHill,
    ThreeCheck,
    RacingKings,
    Horde,
}

impl GameVariant {
    pub fn key(self) -> &'static str {
        match self {
            GameVariant::Standard => "standard",
            GameVariant::Chess960 => "chess960",
            GameVariant::Crazyhouse => "crazyhouse",
            GameVariant::Atomic => "atomic",
            GameVariant::Antichess => "antichess",
            GameVariant::KingOfTheHill => "kingOfTheHill",
            GameVariant::ThreeCheck => "threeCheck",
            GameVariant::RacingKings => "racingKings",
            GameVariant::Horde => "horde",
        }
    }

    pub(crate) fn rules(self) -> Variant {
        match self {
            GameVariant::Standard | GameVariant::Chess960 => Variant::Chess,
            GameVariant::Crazyhouse => Variant::Crazyhouse,
            GameVariant::Atomic => Variant::Atomic,
            GameVariant::Antichess => Variant::Antichess,
            GameVariant::KingOfTheHill => Variant::KingOfTheHill,
            GameVariant::ThreeCheck => Variant::ThreeCheck,
            GameVariant::RacingKings => Variant::RacingKings,
            GameVariant::Horde => Variant::Horde,
        }
    }

    pub(crate) fn castling_mode(self) -> CastlingMode {
        match self {
            GameVariant::Chess960 => CastlingMode::Chess960,
            _ => CastlingMode::Standard,
        }
    }

    pub fn supports_drops(self) -> bool {
        matches!(self, GameVariant::Crazyhouse)
    }
}

impl FromStr for GameVariant {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized: String = input
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '_'))
            .flat_map(char::to_lowercase)
            .collect();

        match normalized.as_str() {
            "standard" | "chess" | "fromposition" => Ok(GameVariant::Standard),
            "chess960" => Ok(GameVariant::Chess960),
            "crazyhouse" => Ok(GameVariant::Crazyhouse),
            "atomic" => Ok(GameVariant::Atomic),
            "antichess" | "giveaway" | "suicide" => Ok(GameVariant::Antichess),
            "kingofthehill" => Ok(GameVariant::KingOfTheHill),
            "threecheck" => Ok(GameVariant::ThreeCheck),
            "racingkings" => Ok(GameVariant::RacingKings),
            "horde" => Ok(GameVariant::Horde),
            _ => Err(format!("unknown variant: {input}")),
        }
    }
}

/// Colour asked for when seeking or challenging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorPreference {
    White,
    Black,
    #[default]
    Random,
}

impl ColorPreference {
    pub fn as_str(self) -> &'static str {
        match self {
            ColorPreference::White => "white",
            ColorPreference::Black => "black",
            ColorPreference::Random => "random",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Termination {
    Checkmate,
    Stalemate,
    InsufficientMaterial,
    VariantEnd,
    Draw,
    Resignation,
    Timeout,
    Aborted,
    Error,
}

impl Termination {
    pub fn describe(self) -> &'static str {
        match self {
            Termination::Checkmate => "checkmate",
            Termination::Stalemate => "stalemate",
            Termination::InsufficientMaterial => "insufficient material",
            Termination::VariantEnd => "variant end",
            Termination::Draw => "draw",
            Termination::Resignation => "resignation",
            Termination::Timeout => "time forfeit",
            Termination::Aborted => "aborted",
            Termination::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameOutcome {
    pub winner: Option<Side>,
    pub termination: Termination,
}

impl GameOutcome {
    pub fn decisive(winner: Side, termination: Termination) -> Self {
        Self {
            winner: Some(winner),
            termination,
        }
    }

    pub fn drawn(termination: Termination) -> Self {
        Self {
            winner: None,
            termination,
        }
    }

    /// PGN result token.
    pub fn result(&self) -> &'static str {
        match (self.termination, self.winner) {
            (Termination::Aborted | Termination::Error, _) => "*",
            (_, Some(Side::White)) => "1-0",
            (_, Some(Side::Black)) => "0-1",
            (_, None) => "1/2-1/2",
        }
    }
}

impl fmt::Display for GameOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.winner {
            Some(winner) => write!(
                f,
                "{} ({}), {winner} wins",
                self.result(),
                self.termination.describe()
            ),
            None => write!(f, "{} ({})", self.result(), self.termination.describe()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSnapshot {
    pub white_ms: u64,
    pub black_ms: u64,
}

impl ClockSnapshot {
    pub fn new(white: Duration, black: Duration) -> Self {
        Self {
            white_ms: white.as_millis() as u64,
            black_ms: black.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub name: String,
    pub rating: Option<u32>,
}

/// Everything the coordinator learns about a game when it starts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GameInfo {
    pub game_id: Option<String>,
    pub variant: GameVariant,
    pub white: PlayerInfo,
    pub black: PlayerInfo,
    /// Side played by the local user, `None` when both sides are local.
    pub user_side: Option<Side>,
    pub initial_fen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub game_id: Option<String>,
    pub variant: GameVariant,
    pub start_fen: String,
    pub current_fen: String,
    pub moves: Vec<String>,
    pub sequence: u32,
    pub side_to_move: Side,
    pub clocks: Option<ClockSnapshot>,
    pub outcome: Option<GameOutcome>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lichess_variant_keys() {
        assert_eq!("standard".parse::<GameVariant>(), Ok(GameVariant::Standard));
        assert_eq!("kingOfTheHill".parse::<GameVariant>(), Ok(GameVariant::KingOfTheHill));
        assert_eq!("Three-check".parse::<GameVariant>(), Ok(GameVariant::ThreeCheck));
        assert_eq!("fromPosition".parse::<GameVariant>(), Ok(GameVariant::Standard));
        assert!("bughouse".parse::<GameVariant>().is_err());

        for variant in [GameVariant::Crazyhouse, GameVariant::RacingKings, GameVariant::Chess960] {
            assert_eq!(variant.key().parse::<GameVariant>(), Ok(variant));
        }
    }

    #[test]
    fn outcome_result_tokens() {
        assert_eq!(GameOutcome::decisive(Side::White, Termination::Checkmate).result(), "1-0");
        assert_eq!(GameOutcome::decisive(Side::Black, Termination::Timeout).result(), "0-1");
        assert_eq!(GameOutcome::drawn(Termination::Stalemate).result(), "1/2-1/2");
        assert_eq!(GameOutcome::drawn(Termination::Aborted).result(), "*");
    }

    #[test]
    fn side_round_trips_through_color() {
        for side in Side::ALL {
            assert_eq!(Side::from(Color::from(side)), side);
            assert_eq!(side.opponent().opponent(), side);
        }
    }
}
