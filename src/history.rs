//! Move history and PGN move-text rendering.
//!
//! One SAN string is appended per ply for the life of a game. The PGN
//! output is move text only — headers are synthesized by the client when
//! exporting.

/// Append-only list of SAN moves, one per ply.
#[derive(Debug, Clone, Default)]
pub struct MoveHistory {
    moves: Vec<String>,
}

impl MoveHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one ply.
    pub fn push(&mut self, san: impl Into<String>) {
        self.moves.push(san.into());
    }

    /// Number of plies played.
    pub fn len(&self) -> usize {
        self.moves.len()
    }

    /// `true` before the first ply.
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Renders the PGN move text, e.g. `1. e4 e5 2. Nf3 Nc6`.
    ///
    /// Every White ply is prefixed with its move number; Black plies are
    /// separated by a single space.
    pub fn to_pgn(&self) -> String {
        let mut pgn = String::new();
        for (ply, san) in self.moves.iter().enumerate() {
            if ply % 2 == 0 {
                if ply > 0 {
                    pgn.push(' ');
                }
                pgn.push_str(&format!("{}. ", ply / 2 + 1));
            } else {
                pgn.push(' ');
            }
            pgn.push_str(san);
        }
        pgn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_history_renders_empty_pgn() {
        let history = MoveHistory::new();
        assert!(history.is_empty());
        assert_eq!(history.to_pgn(), "");
    }

    #[test]
    fn renders_numbered_move_pairs() {
        let mut history = MoveHistory::new();
        for san in ["e4", "e5", "Nf3", "Nc6", "Bb5"] {
            history.push(san);
        }
        assert_eq!(history.len(), 5);
        assert_eq!(history.to_pgn(), "1. e4 e5 2. Nf3 Nc6 3. Bb5");
    }

    #[test]
    fn renders_fools_mate_line() {
        let mut history = MoveHistory::new();
        for san in ["f3", "e5", "g4", "Qh4"] {
            history.push(san);
        }
        assert_eq!(history.to_pgn(), "1. f3 e5 2. g4 Qh4");
    }
}
