//! Core types for the chess-arena rules engine.
//!
//! This module defines the fundamental data structures used throughout the
//! server: piece and square representation, castling rights, the board state
//! (including the bookkeeping the rules engine needs — en passant target,
//! half-move clock, captured-piece lists), and the record produced when a
//! move is executed.

use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

// ---------------------------------------------------------------------------
// Piece & Color
// ---------------------------------------------------------------------------

/// Represents the color (side) of a chess piece or player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    /// The White side (starts on ranks 1–2).
    White,
    /// The Black side (starts on ranks 7–8).
    Black,
}

impl Color {
    /// The other side.
    pub fn opponent(self) -> Color {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }

    /// Back-rank index for this side: rank 1 for White, rank 8 for Black.
    pub fn back_rank(self) -> u8 {
        match self {
            Color::White => 0,
            Color::Black => 7,
        }
    }

    /// The rank step a pawn of this side advances by.
    pub fn pawn_direction(self) -> i8 {
        match self {
            Color::White => 1,
            Color::Black => -1,
        }
    }

    /// Rank index where this side's pawns stand before their first move:
    /// one step out from the back rank.
    pub fn pawn_start_rank(self) -> u8 {
        (self.back_rank() as i8 + self.pawn_direction()) as u8
    }

    /// Rank index a pawn of this side promotes on: the opposing back rank.
    pub fn promotion_rank(self) -> u8 {
        self.opponent().back_rank()
    }

    /// Capitalized display name, used when building result strings.
    pub fn name(self) -> &'static str {
        match self {
            Color::White => "White",
            Color::Black => "Black",
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Color::White => "white",
            Color::Black => "black",
        })
    }
}

/// Represents a chess piece type (without color information).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PieceKind {
    King,
    Queen,
    Rook,
    Bishop,
    Knight,
    Pawn,
}

impl PieceKind {
    /// Parses a SAN piece letter (`K`, `Q`, `R`, `B`, `N`).
    /// Pawns have no letter in SAN, so `P` is not accepted here.
    pub fn from_san_letter(c: char) -> Option<Self> {
        match c {
            'K' => Some(PieceKind::King),
            'Q' => Some(PieceKind::Queen),
            'R' => Some(PieceKind::Rook),
            'B' => Some(PieceKind::Bishop),
            'N' => Some(PieceKind::Knight),
            _ => None,
        }
    }

    /// Returns the SAN letter for the piece (`P` for pawns, which SAN
    /// itself omits — used in FEN characters and diagnostics).
    pub fn san_letter(self) -> char {
        match self {
            PieceKind::King => 'K',
            PieceKind::Queen => 'Q',
            PieceKind::Rook => 'R',
            PieceKind::Bishop => 'B',
            PieceKind::Knight => 'N',
            PieceKind::Pawn => 'P',
        }
    }
}

/// A chess piece with both kind and color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct Piece {
    /// The piece type. Serialized as `type` in board snapshots.
    #[serde(rename = "type")]
    pub kind: PieceKind,
    pub color: Color,
}

impl Piece {
    /// Creates a new piece.
    pub fn new(kind: PieceKind, color: Color) -> Self {
        Self { kind, color }
    }

    /// Converts the piece to its FEN character representation.
    /// Uppercase for White, lowercase for Black.
    pub fn to_fen_char(self) -> char {
        let c = self.kind.san_letter();
        match self.color {
            Color::White => c,
            Color::Black => c.to_ascii_lowercase(),
        }
    }
}

// ---------------------------------------------------------------------------
// Square
// ---------------------------------------------------------------------------

/// Represents a square on the chessboard using 0-based file and rank indices.
///
/// - `file`: 0 (a) to 7 (h)
/// - `rank`: 0 (rank 1) to 7 (rank 8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct Square {
    pub file: u8,
    pub rank: u8,
}

impl Square {
    /// Builds a square from 0-based indices. Both must be below 8.
    pub fn new(file: u8, rank: u8) -> Self {
        debug_assert!(file < 8, "file index {} out of range", file);
        debug_assert!(rank < 8, "rank index {} out of range", rank);
        Self { file, rank }
    }

    /// Parses algebraic notation like `"e4"`. Anything that is not exactly
    /// a file letter followed by a rank digit yields `None`.
    pub fn from_algebraic(s: &str) -> Option<Self> {
        let mut chars = s.chars();
        let file = match chars.next()? {
            c @ 'a'..='h' => c as u8 - b'a',
            _ => return None,
        };
        let rank = match chars.next()? {
            c @ '1'..='8' => c as u8 - b'1',
            _ => return None,
        };
        chars.next().is_none().then_some(Square { file, rank })
    }

    /// The square's algebraic name, e.g. `"e4"`.
    pub fn to_algebraic(self) -> String {
        let mut name = String::with_capacity(2);
        name.push((b'a' + self.file) as char);
        name.push((b'1' + self.rank) as char);
        name
    }

    /// The square shifted by `(df, dr)`, or `None` if that walks off the
    /// board.
    pub fn offset(self, df: i8, dr: i8) -> Option<Square> {
        let file = self.file.checked_add_signed(df).filter(|f| *f < 8)?;
        let rank = self.rank.checked_add_signed(dr).filter(|r| *r < 8)?;
        Some(Square { file, rank })
    }

    /// Flat 0..64 offset into the board array.
    pub fn index(self) -> usize {
        self.rank as usize * 8 + self.file as usize
    }
}

impl fmt::Display for Square {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_algebraic())
    }
}

// ---------------------------------------------------------------------------
// Castling rights
// ---------------------------------------------------------------------------

/// Castling rights for one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct SideCastlingRights {
    /// Whether kingside castling (short castling) is still available.
    pub kingside: bool,
    /// Whether queenside castling (long castling) is still available.
    pub queenside: bool,
}

impl Default for SideCastlingRights {
    fn default() -> Self {
        Self {
            kingside: true,
            queenside: true,
        }
    }
}

/// Castling rights for both sides.
///
/// Rights are monotonically non-increasing: once a flag is cleared it is
/// never restored for the life of the board.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct CastlingRights {
    pub white: SideCastlingRights,
    pub black: SideCastlingRights,
}

impl CastlingRights {
    /// Returns the castling rights for the given color.
    pub fn for_color(&self, color: Color) -> &SideCastlingRights {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }

    /// Returns a mutable reference to the castling rights for the given color.
    pub fn for_color_mut(&mut self, color: Color) -> &mut SideCastlingRights {
        match color {
            Color::White => &mut self.white,
            Color::Black => &mut self.black,
        }
    }
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

/// The full board state the rules engine operates on.
///
/// Besides the 8×8 grid this carries everything move legality depends on:
/// castling rights, the en passant target square, the half-move clock for
/// the 50-move rule, and the two ordered captured-piece lists.
///
/// The grid is a flat 64-element array indexed `rank * 8 + file` (both
/// 0-based). Cloning a `Board` yields a fully independent copy, which the
/// engine relies on for copy-and-test legality checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    pub squares: [Option<Piece>; 64],

    /// Castling rights for both sides.
    pub castling: CastlingRights,

    /// If a pawn just advanced two squares, the square it skipped.
    pub en_passant: Option<Square>,

    /// Plies since the last pawn move or capture (50-move rule; 100 = draw).
    pub halfmove_clock: u32,

    /// Piece types White has captured, in capture order.
    pub captured_by_white: Vec<PieceKind>,

    /// Piece types Black has captured, in capture order.
    pub captured_by_black: Vec<PieceKind>,
}

impl Default for Board {
    /// Returns an empty board with full castling rights.
    fn default() -> Self {
        Self {
            squares: [None; 64],
            castling: CastlingRights::default(),
            en_passant: None,
            halfmove_clock: 0,
            captured_by_white: Vec::new(),
            captured_by_black: Vec::new(),
        }
    }
}

impl Board {
    /// Returns the piece at the given square, if any.
    pub fn get(&self, sq: Square) -> Option<Piece> {
        self.squares[sq.index()]
    }

    /// Sets (or clears) the piece at the given square.
    pub fn set(&mut self, sq: Square, piece: Option<Piece>) {
        self.squares[sq.index()] = piece;
    }

    /// Creates the standard starting position.
    pub fn starting_position() -> Self {
        let mut board = Board::default();

        let back_rank = [
            PieceKind::Rook,
            PieceKind::Knight,
            PieceKind::Bishop,
            PieceKind::Queen,
            PieceKind::King,
            PieceKind::Bishop,
            PieceKind::Knight,
            PieceKind::Rook,
        ];

        for (file, &kind) in back_rank.iter().enumerate() {
            let file = file as u8;
            board.set(Square::new(file, 0), Some(Piece::new(kind, Color::White)));
            board.set(Square::new(file, 7), Some(Piece::new(kind, Color::Black)));
            board.set(
                Square::new(file, 1),
                Some(Piece::new(PieceKind::Pawn, Color::White)),
            );
            board.set(
                Square::new(file, 6),
                Some(Piece::new(PieceKind::Pawn, Color::Black)),
            );
        }

        board
    }

    /// Locates the king of the given color by scanning the flat grid.
    /// A position reached through legal play always has one.
    pub fn find_king(&self, color: Color) -> Option<Square> {
        let king = Piece::new(PieceKind::King, color);
        self.squares
            .iter()
            .position(|&cell| cell == Some(king))
            .map(|at| Square::new((at % 8) as u8, (at / 8) as u8))
    }

    /// Records a capture on the mover's list.
    pub fn record_capture(&mut self, mover: Color, taken: PieceKind) {
        match mover {
            Color::White => self.captured_by_white.push(taken),
            Color::Black => self.captured_by_black.push(taken),
        }
    }

    /// Converts the board grid to the row-major snapshot format:
    /// 8 rows of 8 cells, row 0 = rank 8 down to row 7 = rank 1,
    /// columns 0..7 = files a..h. Empty cells are `null`.
    pub fn to_rows(&self) -> Vec<Vec<Option<Piece>>> {
        (0..8u8)
            .rev()
            .map(|rank| {
                (0..8u8)
                    .map(|file| self.get(Square::new(file, rank)))
                    .collect()
            })
            .collect()
    }

    /// Counts the pieces currently on the board.
    pub fn piece_count(&self) -> usize {
        self.squares.iter().filter(|sq| sq.is_some()).count()
    }
}

// ---------------------------------------------------------------------------
// Captured-piece summary
// ---------------------------------------------------------------------------

/// The two capture lists in the shape event payloads carry.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CapturedPieces {
    /// Piece types White has taken, in order.
    pub by_white: Vec<PieceKind>,
    /// Piece types Black has taken, in order.
    pub by_black: Vec<PieceKind>,
}

impl CapturedPieces {
    /// Snapshots the capture lists of a board.
    pub fn from_board(board: &Board) -> Self {
        Self {
            by_white: board.captured_by_white.clone(),
            by_black: board.captured_by_black.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Move record
// ---------------------------------------------------------------------------

/// The record produced when a SAN move is resolved and executed.
///
/// Castling records `piece = King` with the king's from/to squares; the rook
/// reposition is implied by the castle flags.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MoveRecord {
    pub from: Square,
    pub to: Square,
    /// The type of the piece that moved.
    pub piece: PieceKind,
    /// The promotion target, if the move promoted a pawn.
    pub promotion: Option<PieceKind>,
    /// Whether the move captured a piece (including en passant).
    pub capture: bool,
    /// Kingside castling.
    pub castle_kingside: bool,
    /// Queenside castling.
    pub castle_queenside: bool,
    /// The move in SAN, as accepted by the engine.
    pub notation: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn square_algebraic_round_trip() {
        for file in 0..8u8 {
            for rank in 0..8u8 {
                let sq = Square::new(file, rank);
                assert_eq!(Square::from_algebraic(&sq.to_algebraic()), Some(sq));
            }
        }
        assert_eq!(Square::from_algebraic("i1"), None);
        assert_eq!(Square::from_algebraic("a9"), None);
        assert_eq!(Square::from_algebraic("e"), None);
    }

    #[test]
    fn starting_position_layout() {
        let board = Board::starting_position();
        assert_eq!(board.piece_count(), 32);
        assert_eq!(
            board.get(Square::from_algebraic("e1").unwrap()),
            Some(Piece::new(PieceKind::King, Color::White))
        );
        assert_eq!(
            board.get(Square::from_algebraic("d8").unwrap()),
            Some(Piece::new(PieceKind::Queen, Color::Black))
        );
        assert_eq!(
            board.get(Square::from_algebraic("a7").unwrap()),
            Some(Piece::new(PieceKind::Pawn, Color::Black))
        );
        assert!(board.get(Square::from_algebraic("e4").unwrap()).is_none());
    }

    #[test]
    fn snapshot_rows_map_rank8_to_row0() {
        let board = Board::starting_position();
        let rows = board.to_rows();
        // Row 0 is rank 8: black back rank, a8 first.
        assert_eq!(rows[0][0], Some(Piece::new(PieceKind::Rook, Color::Black)));
        assert_eq!(rows[0][4], Some(Piece::new(PieceKind::King, Color::Black)));
        // Row 7 is rank 1: white back rank.
        assert_eq!(rows[7][4], Some(Piece::new(PieceKind::King, Color::White)));
        // Middle is empty.
        assert_eq!(rows[3][3], None);
    }

    #[test]
    fn snapshot_cell_serializes_type_and_color() {
        let piece = Piece::new(PieceKind::Knight, Color::Black);
        let json = serde_json::to_value(piece).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "knight", "color": "black"})
        );
    }
}
