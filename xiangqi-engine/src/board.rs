//! Collaborator interfaces for the position and move representation.
//!
//! The driver never implements xiangqi rules itself. A host plugs in its own
//! board library through the [`Board`] and [`EngineMove`] traits; the driver
//! only needs position serialization, move parsing in both wire dialects and
//! a move stack.

use std::fmt::Debug;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Side to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Color {
    Red,
    Black,
}

impl Color {
    pub fn other(self) -> Color {
        match self {
            Color::Red => Color::Black,
            Color::Black => Color::Red,
        }
    }
}

impl std::ops::Not for Color {
    type Output = Color;

    fn not(self) -> Color {
        self.other()
    }
}

/// Why a finished game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Checkmate,
    Stalemate,
    InsufficientMaterial,
    SixtyMoves,
    Repetition,
    PerpetualCheck,
    VariantEnd,
}

impl Termination {
    /// Human readable description, as used in XBoard `result` lines.
    pub fn label(self) -> &'static str {
        match self {
            Termination::Checkmate => "Checkmate",
            Termination::Stalemate => "Stalemate",
            Termination::InsufficientMaterial => "Insufficient material",
            Termination::SixtyMoves => "Sixty moves",
            Termination::Repetition => "Repetition",
            Termination::PerpetualCheck => "Perpetual check",
            Termination::VariantEnd => "Variant end",
        }
    }
}

/// Result of a finished game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub winner: Option<Color>,
    pub termination: Termination,
}

impl Outcome {
    /// The PGN-style result token.
    pub fn result(&self) -> &'static str {
        match self.winner {
            Some(Color::Red) => "1-0",
            Some(Color::Black) => "0-1",
            None => "1/2-1/2",
        }
    }
}

/// A move string could not be parsed, or the move is not legal in the
/// position it was applied to.
#[derive(Debug, Clone, Error)]
#[error("invalid or illegal move: {0}")]
pub struct InvalidMoveError(pub String);

/// Move representation supplied by the board collaborator.
pub trait EngineMove: Clone + PartialEq + Eq + Hash + Debug + Send + Sync + Unpin + 'static {
    /// Formats the move in UCI coordinate notation.
    fn uci(&self) -> String;

    /// Parses a move from UCI coordinate notation, without a position for
    /// context.
    fn from_uci(uci: &str) -> Result<Self, InvalidMoveError>
    where
        Self: Sized;

    /// Whether this is a null move.
    fn is_null(&self) -> bool;
}

/// Position representation supplied by the board collaborator.
///
/// Equality must treat two boards as equal iff they represent the same
/// position reached through the same move history.
pub trait Board: Clone + PartialEq + Debug + Send + Sync + 'static {
    type Move: EngineMove;

    /// Variant name announced to XBoard engines, `"normal"` for standard
    /// xiangqi.
    const XBOARD_VARIANT: &'static str;

    /// FEN of the conventional starting position.
    fn startpos_fen() -> String;

    /// FEN of the current position.
    fn fen(&self) -> String;

    /// Board at the initial position of the current game tree, without a
    /// move stack.
    fn root(&self) -> Self;

    /// Copy of this position without the move stack.
    fn without_stack(&self) -> Self;

    /// Moves played from the root, in order.
    fn move_stack(&self) -> &[Self::Move];

    fn turn(&self) -> Color;

    /// Whether this game uses shuffled (960-style) starting positions.
    fn cchess960(&self) -> bool;

    fn push(&mut self, mv: Self::Move);

    fn pop(&mut self) -> Option<Self::Move>;

    /// Parses a UCI move in the current position and plays it.
    fn push_uci(&mut self, uci: &str) -> Result<Self::Move, InvalidMoveError>;

    /// Parses a UCI move in the current position without playing it.
    fn parse_uci(&self, uci: &str) -> Result<Self::Move, InvalidMoveError>;

    /// Parses an XBoard move in the current position and plays it.
    fn push_xboard(&mut self, mv: &str) -> Result<Self::Move, InvalidMoveError>;

    /// Parses an XBoard move in the current position without playing it.
    fn parse_xboard(&self, mv: &str) -> Result<Self::Move, InvalidMoveError>;

    /// Formats a move for the XBoard dialect in the current position.
    fn xboard(&self, mv: &Self::Move) -> String;

    /// Outcome of the game, if it has ended.
    fn outcome(&self, claim_draw: bool) -> Option<Outcome>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! A coordinate-level board for driver tests. Tracks the move stack and
    //! side to move without implementing any rules.

    use super::*;

    pub(crate) const STARTPOS: &str =
        "rnbakabnr/9/1c5c1/p1p1p1p1p/9/9/P1P1P1P1P/1C5C1/9/RNBAKABNR w - - 0 1";

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub(crate) struct TestMove(pub String);

    impl EngineMove for TestMove {
        fn uci(&self) -> String {
            self.0.clone()
        }

        fn from_uci(uci: &str) -> Result<Self, InvalidMoveError> {
            if crate::uci::parse::is_uci_move(uci) {
                Ok(TestMove(uci.to_string()))
            } else {
                Err(InvalidMoveError(uci.to_string()))
            }
        }

        fn is_null(&self) -> bool {
            self.0 == "0000"
        }
    }

    #[derive(Debug, Clone, PartialEq, Default)]
    pub(crate) struct TestBoard {
        pub moves: Vec<TestMove>,
    }

    impl TestBoard {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_moves(moves: &[&str]) -> Self {
            TestBoard {
                moves: moves.iter().map(|m| TestMove(m.to_string())).collect(),
            }
        }
    }

    impl Board for TestBoard {
        type Move = TestMove;

        const XBOARD_VARIANT: &'static str = "normal";

        fn startpos_fen() -> String {
            STARTPOS.to_string()
        }

        fn fen(&self) -> String {
            if self.moves.is_empty() {
                STARTPOS.to_string()
            } else {
                format!("{} after {}", STARTPOS, self.moves.len())
            }
        }

        fn root(&self) -> Self {
            TestBoard::new()
        }

        fn without_stack(&self) -> Self {
            TestBoard::new()
        }

        fn move_stack(&self) -> &[TestMove] {
            &self.moves
        }

        fn turn(&self) -> Color {
            if self.moves.len() % 2 == 0 {
                Color::Red
            } else {
                Color::Black
            }
        }

        fn cchess960(&self) -> bool {
            false
        }

        fn push(&mut self, mv: TestMove) {
            self.moves.push(mv);
        }

        fn pop(&mut self) -> Option<TestMove> {
            self.moves.pop()
        }

        fn push_uci(&mut self, uci: &str) -> Result<TestMove, InvalidMoveError> {
            let mv = TestMove::from_uci(uci)?;
            self.moves.push(mv.clone());
            Ok(mv)
        }

        fn parse_uci(&self, uci: &str) -> Result<TestMove, InvalidMoveError> {
            TestMove::from_uci(uci)
        }

        fn push_xboard(&mut self, mv: &str) -> Result<TestMove, InvalidMoveError> {
            self.push_uci(mv)
        }

        fn parse_xboard(&self, mv: &str) -> Result<TestMove, InvalidMoveError> {
            self.parse_uci(mv)
        }

        fn xboard(&self, mv: &TestMove) -> String {
            mv.0.clone()
        }

        fn outcome(&self, _claim_draw: bool) -> Option<Outcome> {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_negation() {
        assert_eq!(!Color::Red, Color::Black);
        assert_eq!(Color::Black.other(), Color::Red);
    }

    #[test]
    fn outcome_result_tokens() {
        let red = Outcome {
            winner: Some(Color::Red),
            termination: Termination::Checkmate,
        };
        let draw = Outcome {
            winner: None,
            termination: Termination::Stalemate,
        };
        assert_eq!(red.result(), "1-0");
        assert_eq!(draw.result(), "1/2-1/2");
        assert_eq!(Termination::SixtyMoves.label(), "Sixty moves");
    }
}
