//! Standard Algebraic Notation parsing.
//!
//! Accepts the grammar
//! `(piece-letter)? (disambig)? ('x')? dest ('=' promo)? ('+'|'#'|'!'|'?')*`
//! plus the castling literals `O-O`, `O-O-O`, `0-0`, `0-0-0`. Parsing is
//! purely syntactic: resolving which piece actually moves (and whether the
//! move is legal at all) happens in [`crate::movegen`].

use crate::types::{PieceKind, Square};

/// A syntactically valid SAN move, before legality resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedSan {
    /// `O-O` / `0-0`.
    CastleKingside,
    /// `O-O-O` / `0-0-0`.
    CastleQueenside,
    /// Any non-castling move.
    Normal {
        /// The declared mover (`Pawn` when no leading piece letter).
        piece: PieceKind,
        /// Source-file hint from the disambiguation characters.
        file_hint: Option<u8>,
        /// Source-rank hint from the disambiguation characters.
        rank_hint: Option<u8>,
        /// Whether an `x` capture marker was present (informational only).
        capture: bool,
        /// Destination square.
        dest: Square,
        /// Explicit promotion target, if `=X` was given.
        promotion: Option<PieceKind>,
    },
}

/// Strips trailing check/checkmate/annotation suffixes (`+`, `#`, `!`, `?`).
pub fn strip_annotations(san: &str) -> &str {
    san.trim_end_matches(['+', '#', '!', '?'])
}

/// Parses a SAN string into its syntactic parts.
///
/// Returns `Err` with a short description for anything that does not match
/// the grammar. The capture marker is accepted but carries no meaning: a
/// move onto an occupied enemy square is a capture with or without it.
pub fn parse_san(san: &str) -> Result<ParsedSan, String> {
    let core = strip_annotations(san.trim());
    if core.is_empty() {
        return Err("empty move".to_string());
    }

    match core {
        "O-O" | "0-0" => return Ok(ParsedSan::CastleKingside),
        "O-O-O" | "0-0-0" => return Ok(ParsedSan::CastleQueenside),
        _ => {}
    }

    if !core.is_ascii() {
        return Err(format!("'{}' is not algebraic notation", san));
    }
    let mut rest = core;

    // Optional promotion suffix.
    let mut promotion = None;
    if let Some(eq) = rest.rfind('=') {
        let promo_str = &rest[eq + 1..];
        if promo_str.len() != 1 {
            return Err(format!("invalid promotion in '{}'", san));
        }
        let c = promo_str.chars().next().unwrap();
        promotion = Some(
            PieceKind::from_san_letter(c)
                .ok_or_else(|| format!("invalid promotion piece '{}'", c))?,
        );
        rest = &rest[..eq];
    }

    // Destination square: the final two characters.
    if rest.len() < 2 {
        return Err(format!("'{}' is not algebraic notation", san));
    }
    let dest = Square::from_algebraic(&rest[rest.len() - 2..])
        .ok_or_else(|| format!("invalid destination square in '{}'", san))?;
    rest = &rest[..rest.len() - 2];

    // Optional leading piece letter; no letter means a pawn move.
    let mut chars = rest.chars().peekable();
    let piece = match chars.peek() {
        Some(&c) if c.is_ascii_uppercase() => {
            let kind = PieceKind::from_san_letter(c)
                .ok_or_else(|| format!("unknown piece letter '{}'", c))?;
            chars.next();
            kind
        }
        _ => PieceKind::Pawn,
    };

    // What remains is the disambiguation hint followed by an optional 'x'.
    let mut file_hint = None;
    let mut rank_hint = None;
    let mut capture = false;
    for c in chars {
        if capture {
            // Nothing may follow the capture marker before the destination.
            return Err(format!("'{}' is not algebraic notation", san));
        }
        match c {
            'x' => capture = true,
            'a'..='h' if file_hint.is_none() => file_hint = Some(c as u8 - b'a'),
            '1'..='8' if rank_hint.is_none() => rank_hint = Some(c as u8 - b'1'),
            _ => return Err(format!("'{}' is not algebraic notation", san)),
        }
    }

    if piece != PieceKind::Pawn && promotion.is_some() {
        return Err(format!("only pawns promote: '{}'", san));
    }

    Ok(ParsedSan::Normal {
        piece,
        file_hint,
        rank_hint,
        capture,
        dest,
        promotion,
    })
}

/// Returns `true` if a whitespace token has the shape of a SAN move.
///
/// Used when scanning a free-form LLM reply for the one token that is a
/// move: a castling literal, or a leading `KQRBN`/file letter followed only
/// by characters SAN can contain.
pub fn looks_like_san(token: &str) -> bool {
    matches!(token, "O-O" | "O-O-O" | "0-0" | "0-0-0") || {
        let mut chars = token.chars();
        match chars.next() {
            Some(c) if matches!(c, 'K' | 'Q' | 'R' | 'B' | 'N' | 'a'..='h') => {
                chars.all(|c| matches!(c, 'a'..='h' | '1'..='8' | 'x' | '=' | '+' | '#'))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normal(san: &str) -> ParsedSan {
        parse_san(san).expect(san)
    }

    #[test]
    fn parses_plain_pawn_push() {
        assert_eq!(
            normal("e4"),
            ParsedSan::Normal {
                piece: PieceKind::Pawn,
                file_hint: None,
                rank_hint: None,
                capture: false,
                dest: Square::from_algebraic("e4").unwrap(),
                promotion: None,
            }
        );
    }

    #[test]
    fn parses_piece_capture_with_suffixes() {
        assert_eq!(
            normal("Nxf7+!"),
            ParsedSan::Normal {
                piece: PieceKind::Knight,
                file_hint: None,
                rank_hint: None,
                capture: true,
                dest: Square::from_algebraic("f7").unwrap(),
                promotion: None,
            }
        );
    }

    #[test]
    fn parses_pawn_capture_with_file_hint() {
        assert_eq!(
            normal("exd5"),
            ParsedSan::Normal {
                piece: PieceKind::Pawn,
                file_hint: Some(4),
                rank_hint: None,
                capture: true,
                dest: Square::from_algebraic("d5").unwrap(),
                promotion: None,
            }
        );
    }

    #[test]
    fn parses_full_disambiguation() {
        assert_eq!(
            normal("Qh4e1"),
            ParsedSan::Normal {
                piece: PieceKind::Queen,
                file_hint: Some(7),
                rank_hint: Some(3),
                capture: false,
                dest: Square::from_algebraic("e1").unwrap(),
                promotion: None,
            }
        );
    }

    #[test]
    fn parses_rank_disambiguation() {
        assert_eq!(
            normal("R1a3"),
            ParsedSan::Normal {
                piece: PieceKind::Rook,
                file_hint: None,
                rank_hint: Some(0),
                capture: false,
                dest: Square::from_algebraic("a3").unwrap(),
                promotion: None,
            }
        );
    }

    #[test]
    fn parses_promotion() {
        assert_eq!(
            normal("e8=Q"),
            ParsedSan::Normal {
                piece: PieceKind::Pawn,
                file_hint: None,
                rank_hint: None,
                capture: false,
                dest: Square::from_algebraic("e8").unwrap(),
                promotion: Some(PieceKind::Queen),
            }
        );
        assert_eq!(
            normal("gxh1=N#"),
            ParsedSan::Normal {
                piece: PieceKind::Pawn,
                file_hint: Some(6),
                rank_hint: None,
                capture: true,
                dest: Square::from_algebraic("h1").unwrap(),
                promotion: Some(PieceKind::Knight),
            }
        );
    }

    #[test]
    fn parses_castling_literals() {
        assert_eq!(normal("O-O"), ParsedSan::CastleKingside);
        assert_eq!(normal("0-0"), ParsedSan::CastleKingside);
        assert_eq!(normal("O-O-O#"), ParsedSan::CastleQueenside);
        assert_eq!(normal("0-0-0"), ParsedSan::CastleQueenside);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_san("Z9").is_err());
        assert!(parse_san("").is_err());
        assert!(parse_san("e9").is_err());
        assert!(parse_san("Pe4").is_err());
        assert!(parse_san("Qe4=Q").is_err());
        assert!(parse_san("exx5").is_err());
        assert!(parse_san("♞f6").is_err());
    }

    #[test]
    fn san_shape_predicate() {
        assert!(looks_like_san("e4"));
        assert!(looks_like_san("Nf3"));
        assert!(looks_like_san("exd5"));
        assert!(looks_like_san("e8=Q"));
        assert!(looks_like_san("O-O-O"));
        assert!(!looks_like_san("hello"));
        assert!(!looks_like_san("I'll"));
        assert!(!looks_like_san("12"));
        assert!(!looks_like_san(""));
    }
}
