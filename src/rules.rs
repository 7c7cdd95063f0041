//! Chess rules collaborator.
//!
//! The turn loop only needs a narrow capability from the rules engine:
//! list legal moves, apply a move, and report whether the game has ended.
//! [`RulesEngine`] captures that surface; [`ChessRules`] implements it on
//! top of `shakmaty`.

use derive_getters::Getters;
use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use shakmaty::{
    CastlingMode, Chess, Color, EnPassantMode, File, Position as _, Rank, Square,
    fen::Fen,
    san::SanPlus,
};
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

/// Standard starting position.
pub const STANDARD_START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// Halfmove clock value at which the fifty-move rule ends the game.
const FIFTY_MOVE_HALFMOVES: u32 = 100;

/// Number of occurrences of a position that ends the game.
const REPETITION_LIMIT: u32 = 3;

/// Side to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum Side {
    /// Moves first.
    White,
    /// Moves second.
    Black,
}

impl Side {
    /// The other side.
    pub fn opponent(self) -> Self {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
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

/// Most recent committed move with its squares.
#[derive(Debug, Clone, PartialEq, Eq, Getters, Serialize, Deserialize)]
pub struct LastMove {
    /// Move in SAN, including check suffix.
    san: String,
    /// Origin square, absent for castling written without one.
    from: Option<String>,
    /// Destination square.
    to: String,
    /// Side that played it.
    side: Side,
}

/// Immutable game position token.
///
/// Carries the current FEN plus the SAN history from the starting FEN, so
/// the rules engine can replay it for repetition detection.
#[derive(Debug, Clone, PartialEq, Eq, Getters, Serialize, Deserialize)]
pub struct Position {
    /// Current position in FEN.
    fen: String,
    /// Position the game started from.
    start_fen: String,
    /// SAN moves played since `start_fen`.
    moves: Vec<String>,
    /// Last move played.
    last_move: Option<LastMove>,
}

impl Position {
    /// Side to move, read from the FEN active-color field.
    pub fn side_to_move(&self) -> Side {
        match self.fen.split_whitespace().nth(1) {
            Some("b") => Side::Black,
            _ => Side::White,
        }
    }

    /// Number of plies played.
    pub fn ply_count(&self) -> usize {
        self.moves.len()
    }

    /// PGN movetext for the full history (`1. e4 e5 2. Nf3`).
    pub fn pgn(&self) -> String {
        self.pgn_tail(self.moves.len())
    }

    /// PGN movetext for at most the last `window` plies, numbered correctly.
    pub fn pgn_tail(&self, window: usize) -> String {
        let start_number = self
            .start_fen
            .split_whitespace()
            .nth(5)
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(1);
        let black_first = self.start_fen.split_whitespace().nth(1) == Some("b");
        let skip = self.moves.len().saturating_sub(window);

        let mut text = Vec::new();
        for (ply, san) in self.moves.iter().enumerate().skip(skip) {
            let offset = ply + usize::from(black_first);
            let number = start_number + offset / 2;
            let white_to_move = offset % 2 == 0;

            if white_to_move {
                text.push(format!("{number}. {san}"));
            } else if ply == skip {
                text.push(format!("{number}... {san}"));
            } else {
                text.push(san.clone());
            }
        }
        text.join(" ")
    }
}

/// Why a game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Side to move is mated.
    #[strum(to_string = "checkmate")]
    Checkmate,
    /// Side to move has no legal move and is not in check.
    #[strum(to_string = "stalemate")]
    Stalemate,
    /// Neither side can mate.
    #[strum(to_string = "insufficient material")]
    InsufficientMaterial,
    /// Same position occurred three times.
    #[strum(to_string = "threefold repetition")]
    ThreefoldRepetition,
    /// A hundred plies without capture or pawn move.
    #[strum(to_string = "fifty-move rule")]
    FiftyMoveRule,
    /// Configured ply limit reached.
    #[strum(to_string = "move limit")]
    MoveLimit,
}

/// Terminal classification of a finished game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Getters, Serialize, Deserialize)]
pub struct GameEnd {
    reason: EndReason,
    winner: Option<Side>,
}

impl GameEnd {
    /// Creates a game end classification.
    pub fn new(reason: EndReason, winner: Option<Side>) -> Self {
        Self { reason, winner }
    }

    /// Human-readable result line.
    pub fn summary(&self) -> String {
        match self.winner {
            Some(side) => format!("{side} wins by {}", self.reason),
            None => format!("Draw by {}", self.reason),
        }
    }
}

/// Whether the game continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    /// Moves remain to be played.
    Ongoing,
    /// The game is over.
    Over(GameEnd),
}

/// What a rules operation rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RulesRejectionKind {
    /// Token does not parse or is not legal here.
    #[strum(to_string = "illegal move")]
    IllegalMove,
    /// Position token is malformed.
    #[strum(to_string = "invalid position")]
    InvalidPosition,
}

/// Rejection from the rules engine.
#[derive(Debug, Clone, Display, Error)]
#[display("Rules rejection ({}): {} at {}:{}", kind, message, file, line)]
pub struct RulesRejection {
    /// Rejection category.
    pub kind: RulesRejectionKind,
    /// Offending token.
    pub token: String,
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl RulesRejection {
    /// Creates a new rejection.
    #[track_caller]
    #[instrument(skip(token, message))]
    pub fn new(kind: RulesRejectionKind, token: impl Into<String>, message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            kind,
            token: token.into(),
            message: message.into(),
            line: loc.line(),
            file: loc.file(),
        }
    }
}

/// Capability consumed from the rules engine.
pub trait RulesEngine: Send + Sync {
    /// Position every new game starts from.
    fn initial_position(&self) -> Position;

    /// Legal move tokens for `position`, in generation order.
    fn legal_moves(&self, position: &Position) -> Vec<String>;

    /// Applies `token`, returning the new position or a rejection.
    fn apply_move(&self, position: &Position, token: &str) -> Result<Position, RulesRejection>;

    /// Reports whether the game has ended and why.
    fn status(&self, position: &Position) -> GameStatus;

    /// Human-readable board grid used in prompts.
    fn render(&self, position: &Position) -> String;
}

/// Standard chess rules via `shakmaty`.
#[derive(Debug, Clone)]
pub struct ChessRules {
    start_fen: String,
    max_plies: Option<usize>,
}

impl ChessRules {
    /// Rules starting from the standard position with no move limit.
    #[instrument]
    pub fn new() -> Self {
        Self {
            start_fen: STANDARD_START_FEN.to_string(),
            max_plies: None,
        }
    }

    /// Rules starting from a custom FEN.
    #[instrument]
    pub fn from_fen(fen: &str) -> Result<Self, RulesRejection> {
        let chess = parse_fen(fen)?;
        Ok(Self {
            start_fen: fen_of(&chess),
            max_plies: None,
        })
    }

    /// Ends games as a draw once `max_plies` moves have been played.
    pub fn with_max_plies(mut self, max_plies: Option<usize>) -> Self {
        self.max_plies = max_plies;
        self
    }

    /// Replays the move history, counting position occurrences.
    fn repetition_count(&self, position: &Position) -> Result<u32, RulesRejection> {
        let mut chess = parse_fen(position.start_fen())?;
        let mut seen: HashMap<String, u32> = HashMap::new();
        *seen.entry(repetition_key(&chess)).or_default() += 1;

        for token in position.moves() {
            let m = parse_move(&chess, token)?;
            chess.play_unchecked(&m);
            *seen.entry(repetition_key(&chess)).or_default() += 1;
        }

        Ok(seen.get(&repetition_key(&chess)).copied().unwrap_or(0))
    }
}

impl Default for ChessRules {
    fn default() -> Self {
        Self::new()
    }
}

impl RulesEngine for ChessRules {
    fn initial_position(&self) -> Position {
        Position {
            fen: self.start_fen.clone(),
            start_fen: self.start_fen.clone(),
            moves: Vec::new(),
            last_move: None,
        }
    }

    #[instrument(skip(self, position), fields(fen = %position.fen()))]
    fn legal_moves(&self, position: &Position) -> Vec<String> {
        let chess = match parse_fen(position.fen()) {
            Ok(chess) => chess,
            Err(e) => {
                warn!(error = %e, "Cannot list moves for malformed position");
                return Vec::new();
            }
        };

        let moves: Vec<String> = chess
            .legal_moves()
            .iter()
            .map(|m| {
                let mut scratch = chess.clone();
                SanPlus::from_move_and_play_unchecked(&mut scratch, m).to_string()
            })
            .collect();

        debug!(count = moves.len(), "Generated legal moves");
        moves
    }

    #[instrument(skip(self, position), fields(fen = %position.fen()))]
    fn apply_move(&self, position: &Position, token: &str) -> Result<Position, RulesRejection> {
        let mut chess = parse_fen(position.fen())?;
        let side = Side::from(chess.turn());
        let m = parse_move(&chess, token)?;

        let from = m.from().map(|sq| sq.to_string());
        let to = m.to().to_string();
        let san = SanPlus::from_move_and_play_unchecked(&mut chess, &m).to_string();

        let mut moves = position.moves().clone();
        moves.push(san.clone());

        debug!(%san, "Move applied");
        Ok(Position {
            fen: fen_of(&chess),
            start_fen: position.start_fen().clone(),
            moves,
            last_move: Some(LastMove { san, from, to, side }),
        })
    }

    #[instrument(skip(self, position), fields(fen = %position.fen()))]
    fn status(&self, position: &Position) -> GameStatus {
        let chess = match parse_fen(position.fen()) {
            Ok(chess) => chess,
            Err(e) => {
                warn!(error = %e, "Treating malformed position as ongoing");
                return GameStatus::Ongoing;
            }
        };

        let end = if chess.is_checkmate() {
            Some(GameEnd::new(EndReason::Checkmate, Some(Side::from(chess.turn()).opponent())))
        } else if chess.is_stalemate() {
            Some(GameEnd::new(EndReason::Stalemate, None))
        } else if chess.is_insufficient_material() {
            Some(GameEnd::new(EndReason::InsufficientMaterial, None))
        } else if self.repetition_count(position).unwrap_or(0) >= REPETITION_LIMIT {
            Some(GameEnd::new(EndReason::ThreefoldRepetition, None))
        } else if chess.halfmoves() >= FIFTY_MOVE_HALFMOVES {
            Some(GameEnd::new(EndReason::FiftyMoveRule, None))
        } else if self.max_plies.is_some_and(|max| position.ply_count() >= max) {
            Some(GameEnd::new(EndReason::MoveLimit, None))
        } else {
            None
        };

        match end {
            Some(end) => {
                debug!(result = %end.summary(), "Game over");
                GameStatus::Over(end)
            }
            None => GameStatus::Ongoing,
        }
    }

    fn render(&self, position: &Position) -> String {
        let Ok(chess) = parse_fen(position.fen()) else {
            return position.fen().clone();
        };
        let board = chess.board();

        let mut out = String::new();
        for rank in Rank::ALL.iter().rev() {
            out.push(rank.char());
            out.push_str(" |");
            for file in File::ALL {
                let symbol = board
                    .piece_at(Square::from_coords(file, *rank))
                    .map(|piece| piece.char())
                    .unwrap_or('.');
                out.push(' ');
                out.push(symbol);
            }
            out.push('\n');
        }
        out.push_str("  +----------------\n   ");
        for file in File::ALL {
            out.push(' ');
            out.push(file.char());
        }
        out
    }
}

fn parse_fen(fen: &str) -> Result<Chess, RulesRejection> {
    let parsed: Fen = fen.parse().map_err(|e| {
        RulesRejection::new(RulesRejectionKind::InvalidPosition, fen, format!("Malformed FEN: {e}"))
    })?;
    parsed.into_position(CastlingMode::Standard).map_err(|e| {
        RulesRejection::new(RulesRejectionKind::InvalidPosition, fen, format!("Illegal position: {e}"))
    })
}

fn parse_move(chess: &Chess, token: &str) -> Result<shakmaty::Move, RulesRejection> {
    let san: SanPlus = token.trim().parse().map_err(|e| {
        RulesRejection::new(RulesRejectionKind::IllegalMove, token, format!("Not SAN: {e}"))
    })?;
    san.san.to_move(chess).map_err(|e| {
        RulesRejection::new(RulesRejectionKind::IllegalMove, token, format!("Not legal here: {e}"))
    })
}

fn fen_of(chess: &Chess) -> String {
    Fen::from_setup(chess.clone().into_setup(EnPassantMode::Legal)).to_string()
}

/// FEN without the move counters.
fn repetition_key(chess: &Chess) -> String {
    fen_of(chess)
        .split_whitespace()
        .take(4)
        .collect::<Vec<_>>()
        .join(" ")
}
