//! Move validation and execution for the chess-arena rules engine.
//!
//! The engine is SAN-driven: a move arrives as a SAN string for a stated
//! color, is resolved against the board to a unique source square, checked
//! for king safety on a copy, and only then executed with full bookkeeping
//! (castling rights, en passant target, half-move clock, capture lists,
//! promotion). The module also answers the terminal questions — check,
//! checkmate, stalemate, 50-move draw — and enumerates legal destinations
//! from a square for UI highlighting.
//!
//! Everything here is deterministic and side-effect-free apart from the
//! mutation of the board a successful execution is invoked on.

use crate::san::{self, ParsedSan};
use crate::types::*;

// ---------------------------------------------------------------------------
// Geometry tables
// ---------------------------------------------------------------------------

const ROOK_DIRS: [(i8, i8); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
const BISHOP_DIRS: [(i8, i8); 4] = [(-1, -1), (-1, 1), (1, -1), (1, 1)];
const KNIGHT_JUMPS: [(i8, i8); 8] = [
    (-2, -1), (-2, 1), (-1, -2), (-1, 2),
    (1, -2), (1, 2), (2, -1), (2, 1),
];
const KING_STEPS: [(i8, i8); 8] = [
    (-1, -1), (-1, 0), (-1, 1), (0, -1),
    (0, 1), (1, -1), (1, 0), (1, 1),
];

// ---------------------------------------------------------------------------
// Attack detection
// ---------------------------------------------------------------------------

/// Returns `true` if the given square is attacked by any piece of
/// `attacker_color`.
///
/// Pawns attack diagonally only; every other piece attacks the squares it
/// could move to. Used for check detection and castling validation.
pub fn is_square_attacked(board: &Board, sq: Square, attacker_color: Color) -> bool {
    for &(df, dr) in &KNIGHT_JUMPS {
        if let Some(from) = sq.offset(df, dr)
            && board.get(from) == Some(Piece::new(PieceKind::Knight, attacker_color))
        {
            return true;
        }
    }

    for &(df, dr) in &KING_STEPS {
        if let Some(from) = sq.offset(df, dr)
            && board.get(from) == Some(Piece::new(PieceKind::King, attacker_color))
        {
            return true;
        }
    }

    // A pawn attacks the squares diagonally ahead of it, so the attacker
    // sits one rank behind the target from its own point of view.
    let pawn_dir = attacker_color.pawn_direction();
    for df in [-1i8, 1] {
        if let Some(from) = sq.offset(df, -pawn_dir)
            && board.get(from) == Some(Piece::new(PieceKind::Pawn, attacker_color))
        {
            return true;
        }
    }

    slider_hits(board, sq, &BISHOP_DIRS, attacker_color, PieceKind::Bishop)
        || slider_hits(board, sq, &ROOK_DIRS, attacker_color, PieceKind::Rook)
}

/// Scans outward from `sq` along `dirs` for the first piece; reports whether
/// it is an attacking slider (`kind` or queen) of `attacker_color`.
fn slider_hits(
    board: &Board,
    sq: Square,
    dirs: &[(i8, i8)],
    attacker_color: Color,
    kind: PieceKind,
) -> bool {
    for &(df, dr) in dirs {
        let mut cur = sq;
        while let Some(next) = cur.offset(df, dr) {
            if let Some(piece) = board.get(next) {
                if piece.color == attacker_color
                    && (piece.kind == kind || piece.kind == PieceKind::Queen)
                {
                    return true;
                }
                break;
            }
            cur = next;
        }
    }
    false
}

/// Returns `true` if the king of the given color is currently in check.
pub fn is_in_check(board: &Board, color: Color) -> bool {
    match board.find_king(color) {
        Some(king_sq) => is_square_attacked(board, king_sq, color.opponent()),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Geometric reachability
// ---------------------------------------------------------------------------

/// Returns `true` if the path strictly between `from` and `to` is empty.
/// Only meaningful for squares on a shared rank, file, or diagonal.
fn path_clear(board: &Board, from: Square, to: Square) -> bool {
    let df = (to.file as i8 - from.file as i8).signum();
    let dr = (to.rank as i8 - from.rank as i8).signum();
    let mut cur = from;
    loop {
        cur = match cur.offset(df, dr) {
            Some(sq) if sq != to => sq,
            _ => return true,
        };
        if board.get(cur).is_some() {
            return false;
        }
    }
}

/// Returns `true` if the piece on `from` can geometrically reach `to`.
///
/// Respects blocking pieces and pawn structure (including the en passant
/// target) but knows nothing about check: king safety is filtered later.
/// A destination occupied by a same-color piece is never reachable.
fn can_reach(board: &Board, from: Square, to: Square) -> bool {
    let piece = match board.get(from) {
        Some(p) => p,
        None => return false,
    };
    if from == to {
        return false;
    }
    if let Some(target) = board.get(to)
        && target.color == piece.color
    {
        return false;
    }

    let df = to.file as i8 - from.file as i8;
    let dr = to.rank as i8 - from.rank as i8;

    match piece.kind {
        PieceKind::King => df.abs() <= 1 && dr.abs() <= 1,
        PieceKind::Knight => {
            (df.abs() == 1 && dr.abs() == 2) || (df.abs() == 2 && dr.abs() == 1)
        }
        PieceKind::Bishop => df.abs() == dr.abs() && path_clear(board, from, to),
        PieceKind::Rook => (df == 0 || dr == 0) && path_clear(board, from, to),
        PieceKind::Queen => {
            (df == 0 || dr == 0 || df.abs() == dr.abs()) && path_clear(board, from, to)
        }
        PieceKind::Pawn => {
            let dir = piece.color.pawn_direction();
            if df == 0 {
                // Forward moves require empty squares; captures are diagonal.
                if board.get(to).is_some() {
                    return false;
                }
                dr == dir
                    || (dr == 2 * dir
                        && from.rank == piece.color.pawn_start_rank()
                        && path_clear(board, from, to))
            } else {
                df.abs() == 1
                    && dr == dir
                    && (board.get(to).is_some() || board.en_passant == Some(to))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Candidate resolution & execution
// ---------------------------------------------------------------------------

/// A fully resolved move, ready to execute.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    from: Square,
    to: Square,
    piece: PieceKind,
    promotion: Option<PieceKind>,
    castle_kingside: bool,
    castle_queenside: bool,
}

/// Validates a SAN move for `color` and, if legal, executes it on the board.
///
/// Resolution order: geometric candidates are filtered by the disambiguation
/// hint and must be unique *before* the king-safety test runs — SAN naming a
/// piece two same-typed pieces could geometrically play is rejected as
/// ambiguous even when one of them is pinned. The surviving candidate is then
/// executed on a copy and rejected if it leaves the mover's king in check.
///
/// On any failure the board is untouched and an error message is returned.
pub fn apply_san(board: &mut Board, color: Color, san_text: &str) -> Result<MoveRecord, String> {
    let parsed = san::parse_san(san_text)?;

    let candidate = match parsed {
        ParsedSan::CastleKingside => resolve_castle(board, color, true)?,
        ParsedSan::CastleQueenside => resolve_castle(board, color, false)?,
        ParsedSan::Normal {
            piece,
            file_hint,
            rank_hint,
            dest,
            promotion,
            ..
        } => {
            let mut candidate =
                resolve_normal(board, color, piece, file_hint, rank_hint, dest, san_text)?;

            // A pawn reaching the last rank promotes; unspecified promotions
            // become a queen. Promotion syntax anywhere else is illegal.
            let promoting =
                piece == PieceKind::Pawn && dest.rank == color.promotion_rank();
            match promotion {
                Some(kind) if promoting => {
                    if kind == PieceKind::King {
                        return Err(format!("{} is not a legal move", san_text));
                    }
                    candidate.promotion = Some(kind);
                }
                Some(_) => return Err(format!("{} is not a legal move", san_text)),
                None if promoting => candidate.promotion = Some(PieceKind::Queen),
                None => {}
            }

            // King safety, tested on a copy.
            let mut probe = board.clone();
            execute(&mut probe, color, &candidate);
            if is_in_check(&probe, color) {
                return Err(format!(
                    "{} is not a legal move: it leaves the {} king in check",
                    san_text, color
                ));
            }
            candidate
        }
    };

    let captured_before = board.get(candidate.to).is_some()
        || (candidate.piece == PieceKind::Pawn
            && board.en_passant == Some(candidate.to)
            && candidate.from.file != candidate.to.file);

    execute(board, color, &candidate);

    Ok(MoveRecord {
        from: candidate.from,
        to: candidate.to,
        piece: candidate.piece,
        promotion: candidate.promotion,
        capture: captured_before,
        castle_kingside: candidate.castle_kingside,
        castle_queenside: candidate.castle_queenside,
        notation: normalize_notation(san_text, &candidate),
    })
}

/// The SAN stored in history: annotation suffixes stripped and castling
/// normalized to the letter-O literals.
fn normalize_notation(san_text: &str, candidate: &Candidate) -> String {
    if candidate.castle_kingside {
        "O-O".to_string()
    } else if candidate.castle_queenside {
        "O-O-O".to_string()
    } else {
        san::strip_annotations(san_text.trim()).to_string()
    }
}

/// Resolves a non-castling SAN move to its unique source square.
fn resolve_normal(
    board: &Board,
    color: Color,
    piece: PieceKind,
    file_hint: Option<u8>,
    rank_hint: Option<u8>,
    dest: Square,
    san_text: &str,
) -> Result<Candidate, String> {
    let mut sources = Vec::new();
    for rank in 0..8u8 {
        for file in 0..8u8 {
            let from = Square::new(file, rank);
            if board.get(from) != Some(Piece::new(piece, color)) {
                continue;
            }
            if let Some(f) = file_hint
                && f != file
            {
                continue;
            }
            if let Some(r) = rank_hint
                && r != rank
            {
                continue;
            }
            if can_reach(board, from, dest) {
                sources.push(from);
            }
        }
    }

    match sources.len() {
        0 => Err(format!("{} is not a legal move for {}", san_text, color)),
        1 => Ok(Candidate {
            from: sources[0],
            to: dest,
            piece,
            promotion: None,
            castle_kingside: false,
            castle_queenside: false,
        }),
        _ => Err(format!(
            "{} is ambiguous: {} could move from {}",
            san_text,
            piece.san_letter(),
            sources
                .iter()
                .map(|sq| sq.to_algebraic())
                .collect::<Vec<_>>()
                .join(" or ")
        )),
    }
}

/// Resolves a castling move, validating every condition:
/// right still held, king and rook on their start squares, empty path,
/// king not in check, and neither the transit nor the landing square
/// attacked.
fn resolve_castle(board: &Board, color: Color, kingside: bool) -> Result<Candidate, String> {
    let side = if kingside { "kingside" } else { "queenside" };
    let fail = || format!("{} cannot castle {}", color, side);

    let rights = board.castling.for_color(color);
    let allowed = if kingside {
        rights.kingside
    } else {
        rights.queenside
    };
    if !allowed {
        return Err(fail());
    }

    let rank = color.back_rank();
    let king_sq = Square::new(4, rank);
    let (rook_sq, king_dest, between): (Square, Square, &[u8]) = if kingside {
        (Square::new(7, rank), Square::new(6, rank), &[5, 6])
    } else {
        (Square::new(0, rank), Square::new(2, rank), &[1, 2, 3])
    };

    if board.get(king_sq) != Some(Piece::new(PieceKind::King, color))
        || board.get(rook_sq) != Some(Piece::new(PieceKind::Rook, color))
    {
        return Err(fail());
    }
    for &file in between {
        if board.get(Square::new(file, rank)).is_some() {
            return Err(fail());
        }
    }
    if is_square_attacked(board, king_sq, color.opponent()) {
        return Err(format!("{}: cannot castle out of check", fail()));
    }
    // The square the king passes through and the square it lands on.
    let transit_file = if kingside { 5 } else { 3 };
    for file in [transit_file, king_dest.file] {
        if is_square_attacked(board, Square::new(file, rank), color.opponent()) {
            return Err(format!("{}: the king would pass through check", fail()));
        }
    }

    Ok(Candidate {
        from: king_sq,
        to: king_dest,
        piece: PieceKind::King,
        promotion: None,
        castle_kingside: kingside,
        castle_queenside: !kingside,
    })
}

/// Executes a resolved move with full bookkeeping. Must only be called with
/// a candidate produced by resolution against this same position.
fn execute(board: &mut Board, color: Color, mv: &Candidate) {
    let moving = board.get(mv.from).expect("candidate source is occupied");
    let mut captured = board.get(mv.to).map(|p| p.kind);

    // En passant: the captured pawn is beside the mover, not on the target.
    if mv.piece == PieceKind::Pawn
        && board.en_passant == Some(mv.to)
        && mv.from.file != mv.to.file
        && captured.is_none()
    {
        let victim = Square::new(mv.to.file, mv.from.rank);
        captured = board.get(victim).map(|p| p.kind);
        board.set(victim, None);
    }

    board.set(mv.from, None);
    let placed = match mv.promotion {
        Some(kind) => Piece::new(kind, color),
        None => moving,
    };
    board.set(mv.to, Some(placed));

    // Castling repositions the rook atomically with the king.
    if mv.castle_kingside || mv.castle_queenside {
        let rank = mv.from.rank;
        let (rook_from, rook_to) = if mv.castle_kingside {
            (Square::new(7, rank), Square::new(5, rank))
        } else {
            (Square::new(0, rank), Square::new(3, rank))
        };
        let rook = board.get(rook_from);
        board.set(rook_from, None);
        board.set(rook_to, rook);
    }

    update_castling_rights(board, mv, color);

    // En passant target: set only on a pawn double-step, else cleared.
    board.en_passant = None;
    if mv.piece == PieceKind::Pawn
        && (mv.to.rank as i8 - mv.from.rank as i8).abs() == 2
    {
        let skipped = (mv.from.rank as i8 + color.pawn_direction()) as u8;
        board.en_passant = Some(Square::new(mv.from.file, skipped));
    }

    // Half-move clock: pawn moves and captures reset it.
    if mv.piece == PieceKind::Pawn || captured.is_some() {
        board.halfmove_clock = 0;
    } else {
        board.halfmove_clock += 1;
    }

    if let Some(kind) = captured {
        board.record_capture(color, kind);
    }
}

/// Clears castling rights affected by a move: both rights of the mover on
/// any king move, and the side-specific right whenever a rook leaves its
/// original corner or any piece arrives on one (rook captures included).
fn update_castling_rights(board: &mut Board, mv: &Candidate, color: Color) {
    if mv.piece == PieceKind::King {
        let rights = board.castling.for_color_mut(color);
        rights.kingside = false;
        rights.queenside = false;
    }

    for sq in [mv.from, mv.to] {
        match (sq.file, sq.rank) {
            (0, 0) => board.castling.white.queenside = false,
            (7, 0) => board.castling.white.kingside = false,
            (0, 7) => board.castling.black.queenside = false,
            (7, 7) => board.castling.black.kingside = false,
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Terminal detection
// ---------------------------------------------------------------------------

/// Returns `true` if `color` has at least one legal move: some geometric
/// target that survives the king-safety test, or an available castle.
pub fn has_any_legal_move(board: &Board, color: Color) -> bool {
    for rank in 0..8u8 {
        for file in 0..8u8 {
            let from = Square::new(file, rank);
            match board.get(from) {
                Some(p) if p.color == color => {}
                _ => continue,
            }
            for to_rank in 0..8u8 {
                for to_file in 0..8u8 {
                    let to = Square::new(to_file, to_rank);
                    if !can_reach(board, from, to) {
                        continue;
                    }
                    if move_is_king_safe(board, color, from, to) {
                        return true;
                    }
                }
            }
        }
    }
    resolve_castle(board, color, true).is_ok() || resolve_castle(board, color, false).is_ok()
}

/// Copy-and-test: would moving `from` → `to` leave `color`'s king safe?
fn move_is_king_safe(board: &Board, color: Color, from: Square, to: Square) -> bool {
    let piece = match board.get(from) {
        Some(p) => p,
        None => return false,
    };
    let mut probe = board.clone();
    let promoting =
        piece.kind == PieceKind::Pawn && to.rank == piece.color.promotion_rank();
    execute(
        &mut probe,
        color,
        &Candidate {
            from,
            to,
            piece: piece.kind,
            promotion: promoting.then_some(PieceKind::Queen),
            castle_kingside: false,
            castle_queenside: false,
        },
    );
    !is_in_check(&probe, color)
}

/// Checkmate: in check with no legal move.
pub fn is_checkmate(board: &Board, color: Color) -> bool {
    is_in_check(board, color) && !has_any_legal_move(board, color)
}

/// Stalemate: not in check, but no legal move either.
pub fn is_stalemate(board: &Board, color: Color) -> bool {
    !is_in_check(board, color) && !has_any_legal_move(board, color)
}

/// 50-move rule: 100 plies without a pawn move or capture.
pub fn is_fifty_move_draw(board: &Board) -> bool {
    board.halfmove_clock >= 100
}

// ---------------------------------------------------------------------------
// Legal-destination query
// ---------------------------------------------------------------------------

/// Enumerates the legal destination squares for the piece on `from`,
/// including castling destinations when the piece is the king and castling
/// resolves. Returns an empty list for empty squares.
pub fn legal_destinations(board: &Board, from: Square) -> Vec<Square> {
    let piece = match board.get(from) {
        Some(p) => p,
        None => return Vec::new(),
    };

    let mut dests = Vec::new();
    for rank in 0..8u8 {
        for file in 0..8u8 {
            let to = Square::new(file, rank);
            if can_reach(board, from, to) && move_is_king_safe(board, piece.color, from, to) {
                dests.push(to);
            }
        }
    }

    if piece.kind == PieceKind::King {
        for kingside in [true, false] {
            if let Ok(castle) = resolve_castle(board, piece.color, kingside)
                && castle.from == from
            {
                dests.push(castle.to);
            }
        }
    }

    dests
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alternating(board: &mut Board, moves: &[&str]) {
        let mut color = Color::White;
        for san in moves {
            apply_san(board, color, san).unwrap_or_else(|e| panic!("{}: {}", san, e));
            color = color.opponent();
        }
    }

    fn sq(s: &str) -> Square {
        Square::from_algebraic(s).unwrap()
    }

    #[test]
    fn starting_position_not_in_check_and_has_moves() {
        let board = Board::starting_position();
        assert!(!is_in_check(&board, Color::White));
        assert!(!is_in_check(&board, Color::Black));
        assert!(has_any_legal_move(&board, Color::White));
    }

    #[test]
    fn pawn_double_step_sets_en_passant_target() {
        let mut board = Board::starting_position();
        let record = apply_san(&mut board, Color::White, "e4").unwrap();
        assert_eq!(record.from, sq("e2"));
        assert_eq!(record.to, sq("e4"));
        assert_eq!(board.en_passant, Some(sq("e3")));
        assert_eq!(board.halfmove_clock, 0);

        // Any reply that is not a double step clears it.
        apply_san(&mut board, Color::Black, "Nf6").unwrap();
        assert_eq!(board.en_passant, None);
        assert_eq!(board.halfmove_clock, 1);
    }

    #[test]
    fn en_passant_capture_removes_the_bypassing_pawn() {
        let mut board = Board::starting_position();
        alternating(&mut board, &["e4", "a6", "e5", "d5"]);
        assert_eq!(board.en_passant, Some(sq("d6")));

        let record = apply_san(&mut board, Color::White, "exd6").unwrap();
        assert!(record.capture);
        assert_eq!(board.get(sq("d5")), None);
        assert_eq!(
            board.get(sq("d6")),
            Some(Piece::new(PieceKind::Pawn, Color::White))
        );
        assert_eq!(board.captured_by_white, vec![PieceKind::Pawn]);
    }

    #[test]
    fn en_passant_expires_after_one_ply() {
        let mut board = Board::starting_position();
        alternating(&mut board, &["e4", "a6", "e5", "d5", "h3", "h6"]);
        // The d6 target is gone; the diagonal "capture" has no victim.
        assert!(apply_san(&mut board, Color::White, "exd6").is_err());
    }

    #[test]
    fn capture_marker_is_informational() {
        let mut board = Board::starting_position();
        alternating(&mut board, &["e4", "d5"]);
        // No 'x', but the move is a capture all the same.
        let record = apply_san(&mut board, Color::White, "ed5").unwrap();
        assert!(record.capture);
        assert_eq!(board.captured_by_white, vec![PieceKind::Pawn]);
    }

    #[test]
    fn fools_mate_is_checkmate() {
        let mut board = Board::starting_position();
        alternating(&mut board, &["f3", "e5", "g4", "Qh4"]);
        assert!(is_in_check(&board, Color::White));
        assert!(is_checkmate(&board, Color::White));
        assert!(!is_stalemate(&board, Color::White));
    }

    #[test]
    fn stalemate_king_in_the_corner() {
        let mut board = Board::default();
        board.set(sq("h1"), Some(Piece::new(PieceKind::King, Color::White)));
        board.set(sq("f2"), Some(Piece::new(PieceKind::King, Color::Black)));
        board.set(sq("g3"), Some(Piece::new(PieceKind::Queen, Color::Black)));
        assert!(!is_in_check(&board, Color::White));
        assert!(is_stalemate(&board, Color::White));
        assert!(!is_checkmate(&board, Color::White));
    }

    #[test]
    fn kingside_castle_moves_king_and_rook() {
        let mut board = Board::starting_position();
        alternating(&mut board, &["e4", "e5", "Nf3", "Nc6", "Bc4", "Bc5"]);
        let record = apply_san(&mut board, Color::White, "O-O").unwrap();
        assert!(record.castle_kingside);
        assert_eq!(record.piece, PieceKind::King);
        assert_eq!(
            board.get(sq("g1")),
            Some(Piece::new(PieceKind::King, Color::White))
        );
        assert_eq!(
            board.get(sq("f1")),
            Some(Piece::new(PieceKind::Rook, Color::White))
        );
        assert!(board.get(sq("e1")).is_none() && board.get(sq("h1")).is_none());
        assert!(!board.castling.white.kingside);
        assert!(!board.castling.white.queenside);
    }

    #[test]
    fn castling_through_attack_is_rejected() {
        let mut board = Board::default();
        board.set(sq("e1"), Some(Piece::new(PieceKind::King, Color::White)));
        board.set(sq("h1"), Some(Piece::new(PieceKind::Rook, Color::White)));
        board.set(sq("e8"), Some(Piece::new(PieceKind::King, Color::Black)));
        // Black rook covers f1, the king's transit square.
        board.set(sq("f8"), Some(Piece::new(PieceKind::Rook, Color::Black)));
        assert!(apply_san(&mut board, Color::White, "O-O").is_err());

        // Remove the attacker and the castle resolves.
        board.set(sq("f8"), None);
        assert!(apply_san(&mut board, Color::White, "O-O").is_ok());
    }

    #[test]
    fn rook_capture_clears_the_castling_right() {
        let mut board = Board::starting_position();
        // March a knight to g6 and take the h8 rook.
        alternating(&mut board, &["Nf3", "a6", "Ne5", "a5", "Ng6", "a4"]);
        assert!(board.castling.black.kingside);
        apply_san(&mut board, Color::White, "Nxh8").unwrap();
        assert!(!board.castling.black.kingside);
        assert!(board.castling.black.queenside);
        assert_eq!(board.captured_by_white, vec![PieceKind::Rook]);
    }

    #[test]
    fn king_move_clears_both_rights() {
        let mut board = Board::starting_position();
        alternating(&mut board, &["e4", "e5", "Ke2"]);
        assert!(!board.castling.white.kingside);
        assert!(!board.castling.white.queenside);
        assert!(board.castling.black.kingside);
    }

    #[test]
    fn ambiguous_san_is_rejected_and_hints_resolve_it() {
        let mut board = Board::default();
        board.set(sq("e1"), Some(Piece::new(PieceKind::King, Color::White)));
        board.set(sq("e8"), Some(Piece::new(PieceKind::King, Color::Black)));
        board.set(sq("a1"), Some(Piece::new(PieceKind::Rook, Color::White)));
        board.set(sq("h1"), Some(Piece::new(PieceKind::Rook, Color::White)));
        board.castling = CastlingRights {
            white: SideCastlingRights { kingside: false, queenside: false },
            black: SideCastlingRights { kingside: false, queenside: false },
        };

        assert!(apply_san(&mut board, Color::White, "Rd1").is_err());
        let record = apply_san(&mut board, Color::White, "Rad1").unwrap();
        assert_eq!(record.from, sq("a1"));
        assert_eq!(record.to, sq("d1"));
    }

    #[test]
    fn ambiguity_is_checked_before_king_safety() {
        // Two knights can geometrically reach d5, but the e3 knight is
        // pinned to the king by the e-file rook. The bare SAN is still
        // ambiguous; only the hinted form moves the free knight.
        let mut board = Board::default();
        board.set(sq("e1"), Some(Piece::new(PieceKind::King, Color::White)));
        board.set(sq("e3"), Some(Piece::new(PieceKind::Knight, Color::White)));
        board.set(sq("c3"), Some(Piece::new(PieceKind::Knight, Color::White)));
        board.set(sq("e8"), Some(Piece::new(PieceKind::Rook, Color::Black)));
        board.set(sq("a8"), Some(Piece::new(PieceKind::King, Color::Black)));

        assert!(apply_san(&mut board, Color::White, "Nd5").is_err());
        let record = apply_san(&mut board, Color::White, "Ncd5").unwrap();
        assert_eq!(record.from, sq("c3"));

        // The pinned knight is rejected outright.
        let mut probe = board.clone();
        probe.set(sq("d5"), None);
        probe.set(sq("c3"), None);
        probe.set(sq("e3"), Some(Piece::new(PieceKind::Knight, Color::White)));
        assert!(apply_san(&mut probe, Color::White, "Ned5").is_err());
    }

    #[test]
    fn moving_into_check_is_rejected_without_mutation() {
        let mut board = Board::default();
        board.set(sq("e1"), Some(Piece::new(PieceKind::King, Color::White)));
        board.set(sq("e8"), Some(Piece::new(PieceKind::King, Color::Black)));
        board.set(sq("f8"), Some(Piece::new(PieceKind::Rook, Color::Black)));

        let before = board.clone();
        assert!(apply_san(&mut board, Color::White, "Kf2").is_err());
        assert_eq!(board, before);
    }

    #[test]
    fn unspecified_promotion_becomes_a_queen() {
        let mut board = Board::default();
        board.set(sq("e1"), Some(Piece::new(PieceKind::King, Color::White)));
        board.set(sq("a8"), Some(Piece::new(PieceKind::King, Color::Black)));
        board.set(sq("h7"), Some(Piece::new(PieceKind::Pawn, Color::White)));

        let record = apply_san(&mut board, Color::White, "h8").unwrap();
        assert_eq!(record.promotion, Some(PieceKind::Queen));
        assert_eq!(
            board.get(sq("h8")),
            Some(Piece::new(PieceKind::Queen, Color::White))
        );
    }

    #[test]
    fn explicit_underpromotion_is_honored() {
        let mut board = Board::default();
        board.set(sq("e1"), Some(Piece::new(PieceKind::King, Color::White)));
        board.set(sq("a8"), Some(Piece::new(PieceKind::King, Color::Black)));
        board.set(sq("h7"), Some(Piece::new(PieceKind::Pawn, Color::White)));

        let record = apply_san(&mut board, Color::White, "h8=N").unwrap();
        assert_eq!(record.promotion, Some(PieceKind::Knight));
        assert_eq!(
            board.get(sq("h8")),
            Some(Piece::new(PieceKind::Knight, Color::White))
        );
    }

    #[test]
    fn halfmove_clock_counts_quiet_moves_only() {
        let mut board = Board::starting_position();
        alternating(&mut board, &["Nf3", "Nf6", "Ng1", "Ng8"]);
        assert_eq!(board.halfmove_clock, 4);
        apply_san(&mut board, Color::White, "e4").unwrap();
        assert_eq!(board.halfmove_clock, 0);
        assert!(!is_fifty_move_draw(&board));
        board.halfmove_clock = 100;
        assert!(is_fifty_move_draw(&board));
    }

    #[test]
    fn legal_destinations_from_start() {
        let board = Board::starting_position();
        let knight = legal_destinations(&board, sq("g1"));
        assert_eq!(knight.len(), 2);
        assert!(knight.contains(&sq("f3")) && knight.contains(&sq("h3")));

        let pawn = legal_destinations(&board, sq("e2"));
        assert_eq!(pawn.len(), 2);

        assert!(legal_destinations(&board, sq("e1")).is_empty());
        assert!(legal_destinations(&board, sq("e4")).is_empty());
    }

    #[test]
    fn legal_destinations_include_castling() {
        let mut board = Board::default();
        board.set(sq("e1"), Some(Piece::new(PieceKind::King, Color::White)));
        board.set(sq("h1"), Some(Piece::new(PieceKind::Rook, Color::White)));
        board.set(sq("e8"), Some(Piece::new(PieceKind::King, Color::Black)));
        board.castling.white.queenside = false;

        let dests = legal_destinations(&board, sq("e1"));
        assert!(dests.contains(&sq("g1")));
        assert!(!dests.contains(&sq("c1")));
    }

    // -----------------------------------------------------------------------
    // Random-walk properties
    // -----------------------------------------------------------------------

    /// Builds a fully disambiguated SAN string for every legal move of
    /// `color`, which the parser accepts back verbatim.
    fn all_legal_sans(board: &Board, color: Color) -> Vec<String> {
        let mut sans = Vec::new();
        for rank in 0..8u8 {
            for file in 0..8u8 {
                let from = Square::new(file, rank);
                let piece = match board.get(from) {
                    Some(p) if p.color == color => p,
                    _ => continue,
                };
                for to in legal_destinations(board, from) {
                    if piece.kind == PieceKind::King
                        && from.file == 4
                        && (to.file as i8 - from.file as i8).abs() == 2
                    {
                        sans.push(if to.file == 6 { "O-O" } else { "O-O-O" }.to_string());
                        continue;
                    }
                    let letter = if piece.kind == PieceKind::Pawn {
                        String::new()
                    } else {
                        piece.kind.san_letter().to_string()
                    };
                    let promo = if piece.kind == PieceKind::Pawn
                        && to.rank == color.promotion_rank()
                    {
                        "=Q"
                    } else {
                        ""
                    };
                    sans.push(format!(
                        "{}{}{}{}",
                        letter,
                        from.to_algebraic(),
                        to.to_algebraic(),
                        promo
                    ));
                }
            }
        }
        sans
    }

    #[test]
    fn random_walk_preserves_engine_invariants() {
        use rand::prelude::*;
        let mut rng = StdRng::seed_from_u64(0xC4E55);

        for _ in 0..10 {
            let mut board = Board::starting_position();
            let mut color = Color::White;
            let mut rights_history = vec![board.castling];

            for _ply in 0..200 {
                let sans = all_legal_sans(&board, color);
                if sans.is_empty() {
                    break;
                }
                let san = sans.choose(&mut rng).unwrap();
                let prev_clock = board.halfmove_clock;
                let pre = board.clone();

                let record = apply_san(&mut board, color, san).unwrap();

                // The mover never ends its own turn in check.
                assert!(!is_in_check(&board, color), "after {}", san);

                // Material is conserved between the board and capture lists.
                assert_eq!(
                    board.piece_count()
                        + board.captured_by_white.len()
                        + board.captured_by_black.len(),
                    32
                );

                // Half-move clock resets on pawn moves/captures, else +1.
                if record.piece == PieceKind::Pawn || record.capture {
                    assert_eq!(board.halfmove_clock, 0);
                } else {
                    assert_eq!(board.halfmove_clock, prev_clock + 1);
                }

                // Castling rights never come back.
                let prev = *rights_history.last().unwrap();
                for (now, before) in [
                    (board.castling.white.kingside, prev.white.kingside),
                    (board.castling.white.queenside, prev.white.queenside),
                    (board.castling.black.kingside, prev.black.kingside),
                    (board.castling.black.queenside, prev.black.queenside),
                ] {
                    assert!(!now || before, "castling right restored after {}", san);
                }
                rights_history.push(board.castling);

                // Replaying the recorded notation from the pre-move position
                // reproduces the identical board.
                let mut replay = pre;
                apply_san(&mut replay, color, &record.notation).unwrap();
                assert_eq!(replay, board, "replay diverged on {}", san);

                color = color.opponent();
            }
        }
    }
}
