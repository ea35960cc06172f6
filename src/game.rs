//! Game orchestration: the per-session turn loop.
//!
//! A `Game` owns one board, one move history, and the clock for both sides.
//! Its `run` loop alternates turns until a terminal condition: for an
//! LLM-controlled side it prompts the model, parses the reply, and applies
//! the move with a bounded retry budget; for a human side it parks on a
//! single-slot rendezvous that the HTTP move endpoint resolves. Every step
//! is announced on a typed event stream delivered through an emit closure
//! the session registry provides.
//!
//! All board/history/clock mutation happens on the loop task; the HTTP
//! layer only reads snapshots, resolves the rendezvous, or flips the abort
//! flag.

use crate::history::MoveHistory;
use crate::llm::{ChatBackend, LlmError, StreamKind, ThinkTagParser};
use crate::movegen;
use crate::san;
use crate::types::*;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Clock credit for a turn lost to a network failure rather than the model.
const NETWORK_REFUND_MS: i64 = 120_000;

/// Hard ceiling on game length, in plies.
const MAX_PLIES: usize = 300;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One event on a game's stream: a kind tag and a JSON payload.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: &'static str,
    pub data: serde_json::Value,
}

/// Where a game's events go. The registry binds this to the session token's
/// subscriber fanout; tests bind it to a vector.
pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

/// Which reply format the system prompt requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptStyle {
    /// Ask for `{"move": …, "dialogue": …}`.
    #[default]
    Json,
    /// Ask for a bare SAN move.
    San,
}

const SYSTEM_PROMPT_JSON: &str = "You are a chess grandmaster playing as {{color}}. \
Given the game so far, choose your next move. Respond ONLY with a JSON object of the form \
{\"move\": \"<move in standard algebraic notation>\", \"dialogue\": \"<one short in-character remark>\"} \
and nothing else. The move must be legal for {{color}}.";

const SYSTEM_PROMPT_SAN: &str = "You are a chess grandmaster playing as {{color}}. \
Given the game so far, choose your next move. Respond with exactly one move in standard \
algebraic notation (for example e4, Nf3, O-O, exd5, e8=Q) and nothing else. \
The move must be legal for {{color}}.";

const FIRST_MOVE_PROMPT: &str = "The game starts now. Make the first move.";

// ---------------------------------------------------------------------------
// Configuration & internal state
// ---------------------------------------------------------------------------

/// One side of the game: a display label plus the chat backend driving it.
/// A side with no backend is played by a human.
pub struct PlayerSlot {
    pub model: String,
    pub backend: Option<Arc<dyn ChatBackend>>,
}

/// Everything needed to construct a game.
pub struct GameOptions {
    pub white: PlayerSlot,
    pub black: PlayerSlot,
    /// Which side, if any, is played by a human.
    pub human_side: Option<Color>,
    /// LLM attempts per turn before the side forfeits.
    pub max_retries: u32,
    /// Starting time per side in milliseconds; `None` plays untimed.
    pub base_time_ms: Option<i64>,
    /// Increment added after every completed move, in milliseconds.
    pub increment_ms: i64,
    pub prompt_style: PromptStyle,
}

/// Mutable game state, owned by the loop task and read by snapshots.
struct GameState {
    board: Board,
    history: MoveHistory,
    turn: Color,
    result: Option<String>,
    last_move: Option<MoveRecord>,
    time_white: i64,
    time_black: i64,
    increment: i64,
    unlimited: bool,
    turn_started: Option<Instant>,
    /// The most recent rejected SAN, fed back into the retry prompt.
    last_illegal: Option<String>,
}

/// What the human-move rendezvous can deliver.
enum HumanMove {
    San(String),
    Abort,
}

/// How a turn's move-acquisition phase ended.
enum TurnOutcome {
    Moved(MoveRecord, Option<String>),
    Forfeit,
    Aborted,
}

// ---------------------------------------------------------------------------
// Game
// ---------------------------------------------------------------------------

/// A single chess game bound to one session token.
pub struct Game {
    state: Mutex<GameState>,
    white: PlayerSlot,
    black: PlayerSlot,
    human_side: Option<Color>,
    max_retries: u32,
    prompt_style: PromptStyle,
    aborted: AtomicBool,
    /// Single-slot rendezvous armed while the loop waits on a human move.
    human_slot: Mutex<Option<oneshot::Sender<HumanMove>>>,
    emit: EventSink,
    finished_at: Mutex<Option<Instant>>,
}

impl Game {
    /// Creates a game in the starting position. The loop is not running
    /// yet; spawn [`Game::run`] to start it.
    pub fn new(options: GameOptions, emit: EventSink) -> Arc<Self> {
        let base = options.base_time_ms;
        Arc::new(Self {
            state: Mutex::new(GameState {
                board: Board::starting_position(),
                history: MoveHistory::new(),
                turn: Color::White,
                result: None,
                last_move: None,
                time_white: base.unwrap_or(0),
                time_black: base.unwrap_or(0),
                increment: options.increment_ms,
                unlimited: base.is_none(),
                turn_started: None,
                last_illegal: None,
            }),
            white: options.white,
            black: options.black,
            human_side: options.human_side,
            max_retries: options.max_retries.max(1),
            prompt_style: options.prompt_style,
            aborted: AtomicBool::new(false),
            human_slot: Mutex::new(None),
            emit,
            finished_at: Mutex::new(None),
        })
    }

    fn slot(&self, color: Color) -> &PlayerSlot {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }

    fn model_label(&self, color: Color) -> String {
        self.slot(color).model.clone()
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// `true` once the game can no longer accept moves.
    pub fn is_terminal(&self) -> bool {
        self.is_aborted() || self.state.lock().unwrap().result.is_some()
    }

    /// The terminal result string, once set.
    pub fn result(&self) -> Option<String> {
        self.state.lock().unwrap().result.clone()
    }

    /// How long ago the loop finished, if it has.
    pub fn finished_since(&self) -> Option<Duration> {
        self.finished_at.lock().unwrap().map(|at| at.elapsed())
    }

    fn emit(&self, kind: &'static str, data: serde_json::Value) {
        (self.emit)(Event { kind, data });
    }

    fn emit_status(&self, message: impl Into<String>) {
        self.emit("status", json!({ "message": message.into() }));
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// The full state frame sent on subscribe and from the state endpoint.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.lock().unwrap();
        json!({
            "board": state.board.to_rows(),
            "turn": state.turn,
            "pgn": state.history.to_pgn(),
            "moveCount": state.history.len(),
            "result": state.result,
            "models": { "white": self.white.model, "black": self.black.model },
            "captured": CapturedPieces::from_board(&state.board),
            "clock": clock_json(&state),
            "humanSide": self.human_side,
        })
    }

    /// Legal destinations from a square, for UI highlighting.
    pub fn legal_destinations(&self, from: Square) -> Vec<Square> {
        let state = self.state.lock().unwrap();
        movegen::legal_destinations(&state.board, from)
    }

    /// A copy of the current board and the side to move.
    pub fn board_and_turn(&self) -> (Board, Color) {
        let state = self.state.lock().unwrap();
        (state.board.clone(), state.turn)
    }

    fn board_event(&self) -> serde_json::Value {
        let state = self.state.lock().unwrap();
        json!({
            "squares": state.board.to_rows(),
            "turn": state.turn,
            "lastMove": state.last_move,
            "captured": CapturedPieces::from_board(&state.board),
        })
    }

    /// Current clock payload, `None` for untimed games. The active side's
    /// remainder counts down live while its turn is running.
    fn live_clock(&self) -> Option<(i64, i64)> {
        let state = self.state.lock().unwrap();
        if state.unlimited || state.result.is_some() {
            return None;
        }
        let mut white = state.time_white;
        let mut black = state.time_black;
        if let Some(started) = state.turn_started {
            let elapsed = started.elapsed().as_millis() as i64;
            match state.turn {
                Color::White => white -= elapsed,
                Color::Black => black -= elapsed,
            }
        }
        Some((white.max(0), black.max(0)))
    }

    fn emit_clock(&self) {
        let payload = {
            let state = self.state.lock().unwrap();
            if state.unlimited {
                return;
            }
            json!({ "whiteTime": state.time_white.max(0), "blackTime": state.time_black.max(0) })
        };
        self.emit("clock", payload);
    }

    // -----------------------------------------------------------------------
    // External control
    // -----------------------------------------------------------------------

    /// Submits a human move. Validates that it is the human's turn and that
    /// the SAN is legal (on a board copy), then resolves the rendezvous the
    /// loop is parked on.
    pub fn submit_human_move(&self, san_text: &str) -> Result<(), String> {
        let turn = {
            let state = self.state.lock().unwrap();
            if state.result.is_some() {
                return Err("the game is over".to_string());
            }
            state.turn
        };
        if self.human_side != Some(turn) {
            return Err("not your turn".to_string());
        }

        {
            let state = self.state.lock().unwrap();
            let mut probe = state.board.clone();
            movegen::apply_san(&mut probe, turn, san_text)?;
        }

        let sender = self
            .human_slot
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| "not your turn".to_string())?;
        sender
            .send(HumanMove::San(san_text.to_string()))
            .map_err(|_| "the game is not accepting moves".to_string())
    }

    /// Stops the game: sets the abort flag, fixes the result, and frees a
    /// parked human rendezvous so the loop can exit.
    pub fn stop(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        {
            let mut state = self.state.lock().unwrap();
            if state.result.is_none() {
                state.result = Some("Game stopped by user".to_string());
            }
        }
        if let Some(sender) = self.human_slot.lock().unwrap().take() {
            let _ = sender.send(HumanMove::Abort);
        }
    }

    // -----------------------------------------------------------------------
    // The turn loop
    // -----------------------------------------------------------------------

    /// Runs the game to completion, emitting events along the way. The last
    /// event is always `gameOver`.
    pub async fn run(self: Arc<Self>) {
        self.emit("board", self.board_event());
        self.emit_clock();

        let ticker = tokio::spawn(Self::clock_ticker(self.clone()));

        loop {
            if self.is_aborted() || self.state.lock().unwrap().result.is_some() {
                break;
            }

            let color = self.state.lock().unwrap().turn;
            let opponent = color.opponent();
            self.emit_status(format!(
                "{}'s turn ({})",
                color.name(),
                self.model_label(color)
            ));
            self.state.lock().unwrap().turn_started = Some(Instant::now());

            let outcome = if self.human_side == Some(color) {
                self.human_turn(color).await
            } else {
                self.llm_turn(color).await
            };

            let (record, dialogue) = match outcome {
                TurnOutcome::Moved(record, dialogue) => (record, dialogue),
                TurnOutcome::Forfeit => {
                    let mut state = self.state.lock().unwrap();
                    state.result = Some(format!(
                        "{} wins by forfeit ({} failed to make a legal move)",
                        opponent.name(),
                        color.name()
                    ));
                    break;
                }
                TurnOutcome::Aborted => break,
            };

            // Clock debit: wall time of the whole turn, retries included.
            if !self.debit_clock(color, opponent) {
                break;
            }

            // Commit: history, turn flip, move + board events.
            let move_number = {
                let mut state = self.state.lock().unwrap();
                state.history.push(record.notation.clone());
                state.turn = opponent;
                state.last_illegal = None;
                state.last_move = Some(record.clone());
                state.history.len().div_ceil(2)
            };
            log::info!(
                "move {} by {}: {}",
                move_number,
                color.name(),
                record.notation
            );
            self.emit(
                "move",
                json!({
                    "color": color,
                    "model": self.model_label(color),
                    "notation": record.notation,
                    "from": record.from,
                    "to": record.to,
                    "moveNumber": move_number,
                    "dialogue": dialogue,
                }),
            );
            self.emit("board", self.board_event());

            if self.check_terminal(color, opponent) {
                break;
            }
        }

        self.finish(ticker);
    }

    /// Terminal checks after a committed move, in order: checkmate,
    /// stalemate, 50-move draw, an informational check announcement, and
    /// the overall length cap. Returns `true` if the game ended.
    fn check_terminal(&self, mover: Color, opponent: Color) -> bool {
        let in_check = {
            let mut state = self.state.lock().unwrap();
            if movegen::is_checkmate(&state.board, opponent) {
                state.result = Some(format!("{} wins by checkmate!", mover.name()));
                return true;
            }
            if movegen::is_stalemate(&state.board, opponent) {
                state.result = Some("Draw by stalemate".to_string());
                return true;
            }
            if movegen::is_fifty_move_draw(&state.board) {
                state.result = Some("Draw by 50-move rule".to_string());
                return true;
            }
            movegen::is_in_check(&state.board, opponent)
        };
        if in_check {
            self.emit_status(format!("{} is in check", opponent.name()));
        }

        let mut state = self.state.lock().unwrap();
        if state.history.len() >= MAX_PLIES {
            state.result = Some("Draw by excessive length (150+ moves)".to_string());
            return true;
        }
        false
    }

    /// Deducts the turn's wall time from the mover's clock. Returns `false`
    /// if the flag fell.
    fn debit_clock(&self, color: Color, opponent: Color) -> bool {
        let expired = {
            let mut state = self.state.lock().unwrap();
            if state.unlimited {
                state.turn_started = None;
                return true;
            }
            let elapsed = state
                .turn_started
                .take()
                .map(|started| started.elapsed().as_millis() as i64)
                .unwrap_or(0);
            let increment = state.increment;
            let remaining = match color {
                Color::White => {
                    state.time_white -= elapsed;
                    state.time_white
                }
                Color::Black => {
                    state.time_black -= elapsed;
                    state.time_black
                }
            };
            if remaining <= 0 {
                match color {
                    Color::White => state.time_white = 0,
                    Color::Black => state.time_black = 0,
                }
                state.result = Some(format!("{} wins on time", opponent.name()));
                true
            } else {
                match color {
                    Color::White => state.time_white += increment,
                    Color::Black => state.time_black += increment,
                }
                false
            }
        };
        self.emit_clock();
        !expired
    }

    /// Waits for the human-move rendezvous. Re-arms on a spurious wake; a
    /// dropped or aborted sender ends the game.
    async fn human_turn(&self, color: Color) -> TurnOutcome {
        loop {
            if self.is_aborted() {
                return TurnOutcome::Aborted;
            }
            let (sender, receiver) = oneshot::channel();
            *self.human_slot.lock().unwrap() = Some(sender);
            self.emit_status(format!("Waiting for {}'s move", color.name()));

            match receiver.await {
                Ok(HumanMove::San(san_text)) => {
                    let applied = {
                        let mut state = self.state.lock().unwrap();
                        let turn = state.turn;
                        movegen::apply_san(&mut state.board, turn, &san_text)
                    };
                    match applied {
                        Ok(record) => return TurnOutcome::Moved(record, None),
                        // Validated on a copy before the rendezvous resolved,
                        // so this only races a concurrent stop/reset.
                        Err(e) => log::warn!("human move {} rejected late: {}", san_text, e),
                    }
                }
                Ok(HumanMove::Abort) | Err(_) => return TurnOutcome::Aborted,
            }
        }
    }

    /// Runs up to `max_retries` LLM attempts for one turn.
    async fn llm_turn(&self, color: Color) -> TurnOutcome {
        let backend = match &self.slot(color).backend {
            Some(backend) => backend.clone(),
            None => {
                // A side with neither a human nor a backend cannot move.
                log::error!("{} has no move source; forfeiting", color.name());
                return TurnOutcome::Forfeit;
            }
        };
        let model = self.model_label(color);
        let system = self.system_prompt(color);
        let move_number = self.state.lock().unwrap().history.len() / 2 + 1;

        for attempt in 1..=self.max_retries {
            if self.is_aborted() {
                return TurnOutcome::Aborted;
            }

            let user = self.user_prompt();
            let mut accumulated = String::new();
            let mut on_chunk = |kind: StreamKind, text: &str| {
                if kind == StreamKind::Thinking {
                    accumulated.push_str(text);
                    self.emit(
                        "thinking",
                        json!({
                            "color": color,
                            "model": model,
                            "text": text,
                            "accumulated": accumulated,
                        }),
                    );
                }
            };

            let reply = backend.chat(&system, &user, &mut on_chunk).await;
            let thinking = (!accumulated.is_empty()).then_some(accumulated.clone());

            match reply {
                Ok(raw) => {
                    let (move_text, dialogue) = parse_reply(&raw);
                    self.emit(
                        "chat",
                        json!({
                            "color": color,
                            "model": model,
                            "raw": raw,
                            "move": move_text,
                            "dialogue": dialogue,
                            "thinking": thinking,
                            "attempt": attempt,
                            "moveNumber": move_number,
                        }),
                    );

                    let applied = {
                        let mut state = self.state.lock().unwrap();
                        movegen::apply_san(&mut state.board, color, &move_text)
                    };
                    match applied {
                        Ok(record) => return TurnOutcome::Moved(record, dialogue),
                        Err(reason) => {
                            self.state.lock().unwrap().last_illegal = Some(move_text.clone());
                            log::warn!(
                                "{} attempt {}/{} rejected: {}",
                                color.name(),
                                attempt,
                                self.max_retries,
                                reason
                            );
                            self.emit_turn_error(color, &model, &reason, attempt);
                        }
                    }
                }
                Err(err) => {
                    self.emit_turn_error(color, &model, &err.to_string(), attempt);
                    if err.is_network_error() {
                        self.refund_network_loss(color);
                    }
                }
            }
        }

        TurnOutcome::Forfeit
    }

    fn emit_turn_error(&self, color: Color, model: &str, message: &str, attempt: u32) {
        self.emit(
            "error",
            json!({
                "color": color,
                "model": model,
                "message": message,
                "attempt": attempt,
                "maxRetries": self.max_retries,
            }),
        );
    }

    /// Credits time lost to a network failure back to the mover's clock.
    fn refund_network_loss(&self, color: Color) {
        {
            let mut state = self.state.lock().unwrap();
            if state.unlimited {
                return;
            }
            match color {
                Color::White => state.time_white += NETWORK_REFUND_MS,
                Color::Black => state.time_black += NETWORK_REFUND_MS,
            }
        }
        self.emit_clock();
        self.emit_status(format!(
            "Network error; {} seconds returned to {}'s clock",
            NETWORK_REFUND_MS / 1000,
            color.name()
        ));
    }

    fn system_prompt(&self, color: Color) -> String {
        let template = match self.prompt_style {
            PromptStyle::Json => SYSTEM_PROMPT_JSON,
            PromptStyle::San => SYSTEM_PROMPT_SAN,
        };
        template.replace("{{color}}", color.name())
    }

    fn user_prompt(&self) -> String {
        let state = self.state.lock().unwrap();
        let base = if state.history.is_empty() {
            FIRST_MOVE_PROMPT.to_string()
        } else {
            state.history.to_pgn()
        };
        match &state.last_illegal {
            Some(illegal) => format!(
                "{}\n\nYour reply \"{}\" was not a legal move. You must play a different, legal move.",
                base, illegal
            ),
            None => base,
        }
    }

    /// Emits the terminal event and marks the game for the reaper.
    fn finish(&self, ticker: tokio::task::JoinHandle<()>) {
        ticker.abort();
        let (result, pgn) = {
            let mut state = self.state.lock().unwrap();
            if state.result.is_none() {
                state.result = Some("Game stopped by user".to_string());
            }
            state.turn_started = None;
            (state.result.clone().unwrap(), state.history.to_pgn())
        };
        log::info!("game over: {}", result);
        self.emit("gameOver", json!({ "result": result, "pgn": pgn }));
        *self.finished_at.lock().unwrap() = Some(Instant::now());
    }

    /// Re-emits the live clock once per second so displays count down
    /// between moves. Exits on untimed games and once a result is set.
    async fn clock_ticker(game: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.tick().await;
        loop {
            interval.tick().await;
            match game.live_clock() {
                Some((white, black)) => {
                    game.emit("clock", json!({ "whiteTime": white, "blackTime": black }));
                }
                None => break,
            }
        }
    }

    #[cfg(test)]
    fn set_position(&self, board: Board, turn: Color) {
        let mut state = self.state.lock().unwrap();
        state.board = board;
        state.turn = turn;
    }
}

// ---------------------------------------------------------------------------
// Reply parsing
// ---------------------------------------------------------------------------

/// Extracts `(move, dialogue)` from a raw LLM reply.
///
/// JSON first: the first `{…}` substring with a `move` field wins. The
/// fallback strips residual think blocks and surrounding quotes, then scans
/// whitespace tokens for one shaped like SAN, defaulting to the last token.
pub fn parse_reply(raw: &str) -> (String, Option<String>) {
    if let Some(start) = raw.find('{')
        && let Some(end) = raw.rfind('}')
        && end > start
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw[start..=end])
        && let Some(move_text) = value.get("move").and_then(|m| m.as_str())
    {
        let dialogue = value
            .get("dialogue")
            .and_then(|d| d.as_str())
            .map(str::to_string);
        return (move_text.trim().to_string(), dialogue);
    }

    let cleaned = strip_think_blocks(raw);
    let cleaned = cleaned.trim().trim_matches('"').trim();

    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    let token = match tokens.len() {
        0 => "",
        1 => tokens[0],
        _ => tokens
            .iter()
            .copied()
            .find(|t| san::looks_like_san(trim_trailing_punct(t)))
            .unwrap_or_else(|| tokens[tokens.len() - 1]),
    };
    (trim_trailing_punct(token).to_string(), None)
}

/// Removes `<think>…</think>` spans left over in a non-streamed reply.
fn strip_think_blocks(raw: &str) -> String {
    let mut parser = ThinkTagParser::new();
    let mut out = String::new();
    for (kind, text) in parser.push(raw) {
        if kind == StreamKind::Content {
            out.push_str(&text);
        }
    }
    if let Some((kind, text)) = parser.finish()
        && kind == StreamKind::Content
    {
        out.push_str(&text);
    }
    out
}

fn trim_trailing_punct(token: &str) -> &str {
    token.trim_end_matches(['.', ',', ';', ':'])
}

fn clock_json(state: &GameState) -> serde_json::Value {
    if state.unlimited {
        serde_json::Value::Null
    } else {
        json!({ "whiteTime": state.time_white.max(0), "blackTime": state.time_black.max(0) })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
