use std::fmt::Write as _;

use shakmaty::fen::Fen;
use shakmaty::san::{San, SanPlus};
use shakmaty::uci::UciMove;
use shakmaty::variant::VariantPosition;
use shakmaty::{EnPassantMode, Move, Outcome, Position, Role, Square};

use crate::domain::{GameOutcome, GameVariant, Side, Termination};
use crate::error::GameError;

/// How a drag from one square to another would be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    Plain,
    Promotion,
    Illegal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayedMove {
    pub uci: String,
    pub san: String,
    pub mover: Side,
    /// 1-based ply number of the move.
    pub sequence: u32,
    /// Side left in check by the move.
    pub check: Option<Side>,
    pub outcome: Option<GameOutcome>,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    mv: Move,
    uci: String,
    san: String,
}

/// Board, move history and terminal flag of one game.
///
/// All rules questions go to `shakmaty`. The position is only ever changed by
/// playing a legal move from the history, so replaying the history from the
/// initial position always reproduces it.
#[derive(Debug, Clone)]
pub struct GameState {
    variant: GameVariant,
    initial: VariantPosition,
    position: VariantPosition,
    history: Vec<HistoryEntry>,
    terminal: Option<GameOutcome>,
}

impl GameState {
    pub fn new(variant: GameVariant) -> Self {
        let initial = VariantPosition::new(variant.rules());
        Self::from_position(variant, initial)
    }

    pub fn from_fen(variant: GameVariant, fen: &str) -> Result<Self, GameError> {
        let invalid = |reason: String| GameError::InvalidFen {
            fen: fen.to_string(),
            reason,
        };
        let parsed: Fen = fen.trim().parse().map_err(|err| invalid(format!("{err}")))?;
        let initial =
            VariantPosition::from_setup(variant.rules(), parsed.into_setup(), variant.castling_mode())
                .map_err(|err| invalid(format!("{err}")))?;
        Ok(Self::from_position(variant, initial))
    }

    /// Start from `initial_fen` (or the variant's start position) and replay
    /// a list of coordinate-notation moves.
    pub fn from_uci_moves<S: AsRef<str>>(
        variant: GameVariant,
        initial_fen: Option<&str>,
        moves: &[S],
    ) -> Result<Self, GameError> {
        let mut game = match initial_fen {
            Some(fen) => Self::from_fen(variant, fen)?,
            None => Self::new(variant),
        };
        for uci in moves {
            game.play_uci(uci.as_ref())?;
        }
        Ok(game)
    }

    /// Import the first game of a PGN text. `[Variant]` and `[FEN]` headers
    /// are honoured; comments, NAGs, variations and the result are skipped.
    pub fn from_pgn(text: &str) -> Result<Self, GameError> {
        let mut variant = GameVariant::Standard;
        let mut fen = None;
        let mut movetext = String::new();

        for line in text.lines() {
            let line = line.trim();
            if let Some(header) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
                let Some((key, value)) = header.split_once(' ') else {
                    return Err(GameError::InvalidPgn(format!("malformed header: {line}")));
                };
                let value = value.trim().trim_matches('"');
                match key {
                    "Variant" => {
                        variant = value.parse().map_err(GameError::InvalidPgn)?;
                    }
                    "FEN" => fen = Some(value.to_string()),
                    _ => {}
                }
            } else if !line.starts_with('%') {
                movetext.push_str(line);
                movetext.push('\n');
            }
        }

        let mut game = match fen {
            Some(fen) => Self::from_fen(variant, &fen)?,
            None => Self::new(variant),
        };
        for token in movetext_tokens(&movetext) {
            let san: SanPlus = token
                .parse()
                .map_err(|_| GameError::InvalidPgn(format!("cannot parse {token:?}")))?;
            let mv = san
                .san
                .to_move(&game.position)
                .map_err(|_| GameError::InvalidPgn(format!("illegal move {token:?}")))?;
            game.apply_move(&mv)?;
        }
        Ok(game)
    }

    fn from_position(variant: GameVariant, initial: VariantPosition) -> Self {
        Self {
            variant,
            position: initial.clone(),
            initial,
            history: Vec::new(),
            terminal: None,
        }
    }

    pub fn variant(&self) -> GameVariant {
        self.variant
    }

    pub fn position(&self) -> &VariantPosition {
        &self.position
    }

    pub fn side_to_move(&self) -> Side {
        self.position.turn().into()
    }

    pub fn ply(&self) -> u32 {
        self.history.len() as u32
    }

    pub fn is_check(&self) -> bool {
        self.position.is_check()
    }

    pub fn fen(&self) -> String {
        position_fen(&self.position)
    }

    pub fn start_fen(&self) -> String {
        position_fen(&self.initial)
    }

    pub fn move_history(&self) -> impl Iterator<Item = &Move> {
        self.history.iter().map(|entry| &entry.mv)
    }

    pub fn uci_moves(&self) -> Vec<String> {
        self.history.iter().map(|entry| entry.uci.clone()).collect()
    }

    /// Coordinate notation of the move with the given 1-based sequence number.
    pub fn uci_at(&self, sequence: u32) -> Option<&str> {
        let index = (sequence as usize).checked_sub(1)?;
        self.history.get(index).map(|entry| entry.uci.as_str())
    }

    pub fn legal_moves(&self) -> Vec<String> {
        let mode = self.variant.castling_mode();
        self.position
            .legal_moves()
            .iter()
            .map(|mv| UciMove::from_move(mv, mode).to_string())
            .collect()
    }

    /// Outcome when the game is over, either by the rules or by a flagged
    /// termination (resignation, forfeit, agreement, abort).
    pub fn outcome(&self) -> Option<GameOutcome> {
        self.terminal.or_else(|| rules_outcome(&self.position))
    }

    pub fn is_over(&self) -> bool {
        self.outcome().is_some()
    }

    /// Flag the game as over. Returns `false` when it already was.
    pub fn force_terminal(&mut self, outcome: GameOutcome) -> bool {
        if self.is_over() {
            return false;
        }
        self.terminal = Some(outcome);
        true
    }

    pub fn parse_move(&self, text: &str) -> Result<Move, GameError> {
        let uci: UciMove = text
            .trim()
            .parse()
            .map_err(|_| GameError::InvalidMove(text.to_string()))?;
        uci.to_move(&self.position)
            .map_err(|_| GameError::IllegalMove(text.trim().to_string()))
    }

    pub fn apply_move(&mut self, mv: &Move) -> Result<Option<GameOutcome>, GameError> {
        if self.is_over() {
            return Err(GameError::GameOver);
        }
        if !self.position.is_legal(mv) {
            let uci = UciMove::from_move(mv, self.variant.castling_mode());
            return Err(GameError::IllegalMove(uci.to_string()));
        }

        let uci = UciMove::from_move(mv, self.variant.castling_mode()).to_string();
        let san = San::from_move(&self.position, mv).to_string();
        self.position.play_unchecked(mv);
        self.history.push(HistoryEntry {
            mv: mv.clone(),
            uci,
            san,
        });
        Ok(rules_outcome(&self.position))
    }

    /// Parse and apply a coordinate-notation move, describing what happened.
    pub fn play_uci(&mut self, text: &str) -> Result<PlayedMove, GameError> {
        if self.is_over() {
            return Err(GameError::GameOver);
        }
        let mv = self.parse_move(text)?;
        let mover = self.side_to_move();
        let outcome = self.apply_move(&mv)?;
        let entry = self.history.last().ok_or(GameError::GameOver)?;

        Ok(PlayedMove {
            uci: entry.uci.clone(),
            san: entry.san.clone(),
            mover,
            sequence: self.ply(),
            check: self.is_check().then(|| self.side_to_move()),
            outcome,
        })
    }

    /// Copy of the game with `mv` applied; the committed state is untouched.
    pub fn fork_for_preview(&self, mv: &Move) -> Result<GameState, GameError> {
        let mut fork = self.clone();
        fork.apply_move(mv)?;
        Ok(fork)
    }

    /// Decide whether moving `from` → `to` is a plain move, needs a promotion
    /// piece, or is illegal.
    pub fn classify(&self, from: Square, to: Square) -> MoveKind {
        let candidate = |promotion| UciMove::Normal { from, to, promotion }.to_move(&self.position);

        if let Ok(mv) = candidate(None) {
            if self.fork_for_preview(&mv).is_ok() {
                return MoveKind::Plain;
            }
        }
        match candidate(Some(Role::Queen)) {
            Ok(mv) if self.fork_for_preview(&mv).is_ok() => MoveKind::Promotion,
            _ => MoveKind::Illegal,
        }
    }

    /// Piece types `side` holds in its pocket, for drop variants.
    pub fn droppable_roles(&self, side: Side) -> Vec<Role> {
        let Some(pockets) = self.position.pockets() else {
            return Vec::new();
        };
        let pocket = match side {
            Side::White => &pockets.white,
            Side::Black => &pockets.black,
        };
        Role::ALL
            .into_iter()
            .filter(|role| {
                let count = match role {
                    Role::Pawn => pocket.pawn,
                    Role::Knight => pocket.knight,
                    Role::Bishop => pocket.bishop,
                    Role::Rook => pocket.rook,
                    Role::Queen => pocket.queen,
                    Role::King => pocket.king,
                };
                count > 0
            })
            .collect()
    }

    /// Build a drop of `role` onto `to`, checked against the pocket.
    pub fn drop_move(&self, role: Role, to: Square) -> Result<Move, GameError> {
        UciMove::Put { role, to }
            .to_move(&self.position)
            .map_err(|_| GameError::IllegalMove(format!("{}@{to}", role.upper_char())))
    }

    /// Position reached by replaying the history from the initial position.
    pub fn replay(&self) -> Result<VariantPosition, GameError> {
        let mut position = self.initial.clone();
        for entry in &self.history {
            if !position.is_legal(&entry.mv) {
                return Err(GameError::IllegalMove(entry.uci.clone()));
            }
            position.play_unchecked(&entry.mv);
        }
        Ok(position)
    }

    pub fn replay_matches(&self) -> bool {
        self.replay()
            .map(|replayed| position_fen(&replayed) == self.fen())
            .unwrap_or(false)
    }

    pub fn to_pgn(&self, headers: &[(&str, &str)]) -> String {
        let mut pgn = String::new();
        for (key, value) in headers {
            let _ = writeln!(pgn, "[{key} \"{value}\"]");
        }
        if self.variant != GameVariant::Standard {
            let _ = writeln!(pgn, "[Variant \"{}\"]", self.variant.key());
        }
        let start_fen = self.start_fen();
        let default_fen = position_fen(&VariantPosition::new(self.variant.rules()));
        if start_fen != default_fen {
            let _ = writeln!(pgn, "[SetUp \"1\"]");
            let _ = writeln!(pgn, "[FEN \"{start_fen}\"]");
        }
        let result = self.outcome().map(|outcome| outcome.result()).unwrap_or("*");
        let _ = writeln!(pgn, "[Result \"{result}\"]");
        pgn.push('\n');

        let mut move_no = self.initial.fullmoves().get();
        let mut white_to_move = self.initial.turn().is_white();
        for (idx, entry) in self.history.iter().enumerate() {
            if white_to_move {
                if idx > 0 {
                    pgn.push(' ');
                }
                let _ = write!(pgn, "{move_no}. {}", entry.san);
            } else {
                if idx == 0 {
                    let _ = write!(pgn, "{move_no}...");
                }
                pgn.push(' ');
                pgn.push_str(&entry.san);
                move_no += 1;
            }
            white_to_move = !white_to_move;
        }
        if !self.history.is_empty() {
            pgn.push(' ');
        }
        pgn.push_str(result);
        pgn
    }
}

fn position_fen(position: &VariantPosition) -> String {
    Fen::from_position(position.clone(), EnPassantMode::Legal).to_string()
}

fn rules_outcome(position: &VariantPosition) -> Option<GameOutcome> {
    let outcome = position.outcome()?;
    let termination = if position.is_variant_end() {
        Termination::VariantEnd
    } else if position.is_checkmate() {
        Termination::Checkmate
    } else if position.is_stalemate() {
        Termination::Stalemate
    } else if position.is_insufficient_material() {
        Termination::InsufficientMaterial
    } else {
        Termination::Draw
    };
    let winner = match outcome {
        Outcome::Decisive { winner } => Some(winner.into()),
        Outcome::Draw => None,
    };
    Some(GameOutcome {
        winner,
        termination,
    })
}

fn movetext_tokens(movetext: &str) -> Vec<String> {
    let mut cleaned = String::with_capacity(movetext.len());
    let mut comment = false;
    let mut line_comment = false;
    let mut variation_depth = 0u32;
    for ch in movetext.chars() {
        match ch {
            _ if line_comment => line_comment = ch != '\n',
            '}' if comment => comment = false,
            _ if comment => {}
            '{' => comment = true,
            ';' => line_comment = true,
            '(' => variation_depth += 1,
            ')' => variation_depth = variation_depth.saturating_sub(1),
            _ if variation_depth > 0 => {}
            _ => cleaned.push(ch),
        }
        if comment || line_comment || variation_depth > 0 {
            cleaned.push(' ');
        }
    }

    cleaned
        .split_whitespace()
        .filter(|token| !matches!(*token, "1-0" | "0-1" | "1/2-1/2" | "*"))
        .filter(|token| !token.starts_with('$'))
        .map(|token| {
            token
                .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.')
                .trim_end_matches(['!', '?'])
        })
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}
