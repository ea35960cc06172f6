//! HTTP surface for the chess arena.
//!
//! Every endpoint is keyed by an opaque session token carried as a query
//! parameter: the token *is* the capability — anyone presenting it acts as
//! that session. Handlers never run game logic themselves; they read
//! snapshots, hand moves to the game's rendezvous, or start/stop the loop,
//! and all real-time traffic flows through the per-token SSE stream.
//!
//! The API is documented with OpenAPI/Swagger via `utoipa`; the interactive
//! documentation is served at `/swagger-ui/`.

use actix_web::{HttpResponse, Responder, web};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::game::{Game, GameOptions, PlayerSlot, PromptStyle};
use crate::llm::LlmClient;
use crate::session::SessionRegistry;
use crate::types::*;

/// How long a fetched model list stays fresh.
const MODEL_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Shared application state, wrapped in `web::Data` for all handlers.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub config: ServerConfig,
    /// `(models URL, credential)` → cached model list.
    model_cache: Mutex<HashMap<(String, String), (Vec<ModelInfo>, Instant)>>,
    /// Client for the model-list proxy.
    http: reqwest::Client,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>, config: ServerConfig) -> Self {
        Self {
            registry,
            config,
            model_cache: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// OpenAPI definition
// ---------------------------------------------------------------------------

/// OpenAPI documentation for the arena API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "chess-arena — LLM chess arena server",
        version = "0.1.0",
        description = "A multi-session arena server where LLM players (reached through \
            OpenAI-compatible streaming chat APIs) play chess against each other or a \
            human. Clients observe and participate through a per-session Server-Sent-Events \
            stream.",
        license(name = "MIT")
    ),
    paths(
        issue_token,
        stream_events,
        start_game,
        game_state,
        submit_move,
        legal_moves,
        stop_game,
        reset_game,
        board_ascii,
        list_models,
        list_default_models,
        health,
    ),
    components(schemas(
        TokenResponse,
        StartRequest,
        StartResponse,
        MoveRequest,
        MessageResponse,
        LegalMovesResponse,
        ModelsRequest,
        ModelsResponse,
        ModelInfo,
        CooldownResponse,
        HealthResponse,
        ErrorResponse,
        Color,
        PieceKind,
        Piece,
        Square,
        CapturedPieces,
        MoveRecord,
    )),
    tags(
        (name = "session", description = "Token issuance and the event stream"),
        (name = "game", description = "Game lifecycle and moves"),
        (name = "models", description = "Model-list proxy"),
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Error payload used by every endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message describing what went wrong.
    pub error: String,
}

/// A freshly issued session token.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub token: String,
}

/// Query string carrying the session token.
#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Body of `POST /api/game/start`. Every field is optional; omitted
/// endpoint/credential pairs fall back to the server's own, which makes
/// the start "shared-credential" and subject to the cooldown.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct StartRequest {
    pub white_api_url: Option<String>,
    pub white_api_key: Option<String>,
    pub white_model: Option<String>,
    pub black_api_url: Option<String>,
    pub black_api_key: Option<String>,
    pub black_model: Option<String>,
    /// LLM attempts per turn before forfeiting.
    pub max_retries: Option<u32>,
    /// Starting time per side, in minutes. Omit for an untimed game.
    pub base_time: Option<f64>,
    /// Increment per move, in seconds.
    pub increment: Option<f64>,
    /// `"white"` or `"black"` to play that side yourself.
    pub human_side: Option<String>,
    /// Bypass password for the shared-credential cooldown.
    pub password: Option<String>,
    /// `"json"` (default) or `"san"` reply schema for the LLM prompt.
    pub prompt_style: Option<String>,
}

/// Successful start.
#[derive(Debug, Serialize, ToSchema)]
pub struct StartResponse {
    pub message: String,
    /// Full state snapshot, as also sent on stream subscribe.
    #[schema(value_type = Object)]
    pub state: serde_json::Value,
    /// Whether the cooldown bypass password was used.
    pub bypass: bool,
}

/// Cooldown rejection payload (HTTP 429).
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CooldownResponse {
    pub error: String,
    /// Milliseconds until the next shared-credential start is allowed.
    pub remaining_ms: u64,
    pub bypass: bool,
}

/// Body of `POST /api/game/move`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct MoveRequest {
    /// The move in standard algebraic notation.
    #[serde(rename = "move")]
    pub san: String,
}

/// Generic acknowledgement.
#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

/// Query for `GET /api/game/legal-moves`.
#[derive(Debug, Deserialize)]
pub struct LegalMovesQuery {
    pub token: Option<String>,
    pub file: u8,
    pub rank: u8,
}

/// Legal destinations from the queried square.
#[derive(Debug, Serialize, ToSchema)]
pub struct LegalMovesResponse {
    pub moves: Vec<Square>,
}

/// Body of the model-list proxy endpoints.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelsRequest {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
}

/// One selectable model.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
}

/// Model list, sorted by id.
#[derive(Debug, Serialize, ToSchema)]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
}

/// Server liveness summary.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub active_games: usize,
    pub version: String,
}

fn bad_request(message: impl Into<String>) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorResponse {
        error: message.into(),
    })
}

fn require_token(query: &TokenQuery) -> Result<String, HttpResponse> {
    match query.token.as_deref().map(str::trim) {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        _ => Err(bad_request("missing session token")),
    }
}

// ---------------------------------------------------------------------------
// Session endpoints
// ---------------------------------------------------------------------------

/// Issue a fresh opaque session token.
///
/// Clients may also self-generate and persist a token; the server treats
/// any non-empty string as a valid session key on first use.
#[utoipa::path(
    post,
    path = "/api/token",
    tag = "session",
    responses(
        (status = 200, description = "Fresh token", body = TokenResponse),
    )
)]
pub async fn issue_token() -> impl Responder {
    HttpResponse::Ok().json(TokenResponse {
        token: Uuid::new_v4().to_string(),
    })
}

/// Subscribe to the session's Server-Sent-Events stream.
///
/// Each frame is `event: <kind>\ndata: <json>\n\n`. If a game exists when
/// the stream opens, a single `state` frame with a full snapshot is sent
/// first.
#[utoipa::path(
    get,
    path = "/api/game/stream",
    tag = "session",
    params(("token" = String, Query, description = "Session token")),
    responses(
        (status = 200, description = "SSE stream", content_type = "text/event-stream"),
        (status = 400, description = "Missing token", body = ErrorResponse),
    )
)]
pub async fn stream_events(
    query: web::Query<TokenQuery>,
    data: web::Data<AppState>,
) -> impl Responder {
    let token = match require_token(&query) {
        Ok(token) => token,
        Err(resp) => return resp,
    };

    let (subscriber, receiver) = data.registry.subscribe(&token);
    if let Some(game) = data.registry.game(&token) {
        data.registry
            .send_to(&token, &subscriber, "state", &game.snapshot());
    }

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(receiver)
}

// ---------------------------------------------------------------------------
// Game lifecycle
// ---------------------------------------------------------------------------

/// Start a game for the session and run its loop in the background.
///
/// Responds 409 while a non-terminal game exists, 400 when an LLM side is
/// missing a credential, and 429 when the shared-credential cooldown is
/// still running (unless the bypass password is supplied).
#[utoipa::path(
    post,
    path = "/api/game/start",
    tag = "game",
    params(("token" = String, Query, description = "Session token")),
    request_body = StartRequest,
    responses(
        (status = 200, description = "Game started", body = StartResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 409, description = "Game already in progress", body = ErrorResponse),
        (status = 429, description = "Shared-credential cooldown", body = CooldownResponse),
    )
)]
pub async fn start_game(
    query: web::Query<TokenQuery>,
    body: web::Json<StartRequest>,
    data: web::Data<AppState>,
) -> HttpResponse {
    let token = match require_token(&query) {
        Ok(token) => token,
        Err(resp) => return resp,
    };

    if let Some(existing) = data.registry.game(&token)
        && !existing.is_terminal()
    {
        return HttpResponse::Conflict().json(ErrorResponse {
            error: "a game is already in progress for this session".to_string(),
        });
    }

    let human_side = match body.human_side.as_deref().map(str::to_lowercase).as_deref() {
        None | Some("") | Some("none") => None,
        Some("white") => Some(Color::White),
        Some("black") => Some(Color::Black),
        Some(other) => return bad_request(format!("invalid humanSide: {}", other)),
    };

    let white = match resolve_side(Color::White, &body, human_side, &data.config) {
        Ok(side) => side,
        Err(resp) => return resp,
    };
    let black = match resolve_side(Color::Black, &body, human_side, &data.config) {
        Ok(side) => side,
        Err(resp) => return resp,
    };

    // Shared-credential cooldown: one defaults-funded start per token per
    // window. The bypass password waives it without consuming the window.
    let shared = white.shared || black.shared;
    let bypass = shared
        && data.config.bypass_password.is_some()
        && body.password == data.config.bypass_password;
    if shared && !bypass {
        if let Some(remaining) = data.registry.shared_cooldown_remaining(&token) {
            return HttpResponse::TooManyRequests().json(CooldownResponse {
                error: "shared-credential games are rate limited; bring your own API key or wait"
                    .to_string(),
                remaining_ms: remaining.as_millis() as u64,
                bypass: false,
            });
        }
        data.registry.record_shared_start(&token);
    }

    let base_time_ms = body
        .base_time
        .filter(|minutes| *minutes > 0.0)
        .map(|minutes| (minutes * 60_000.0) as i64);
    let increment_ms = body
        .increment
        .filter(|seconds| *seconds > 0.0)
        .map(|seconds| (seconds * 1000.0) as i64)
        .unwrap_or(0);
    let prompt_style = match body.prompt_style.as_deref() {
        Some("san") => PromptStyle::San,
        _ => PromptStyle::Json,
    };

    let game = Game::new(
        GameOptions {
            white: white.slot,
            black: black.slot,
            human_side,
            max_retries: body.max_retries.unwrap_or(data.config.max_retries),
            base_time_ms,
            increment_ms,
            prompt_style,
        },
        data.registry.event_sink(&token),
    );
    data.registry.insert_game(&token, game.clone());

    log::info!("session {}: game started", token);
    let state = game.snapshot();
    tokio::spawn(game.run());

    HttpResponse::Ok().json(StartResponse {
        message: "Game started".to_string(),
        state,
        bypass,
    })
}

/// One side of a start request, resolved against the server defaults.
struct ResolvedSide {
    slot: PlayerSlot,
    /// `true` when an LLM side runs on the server's own endpoint and key.
    shared: bool,
}

fn resolve_side(
    color: Color,
    body: &StartRequest,
    human_side: Option<Color>,
    config: &ServerConfig,
) -> Result<ResolvedSide, HttpResponse> {
    if human_side == Some(color) {
        return Ok(ResolvedSide {
            slot: PlayerSlot {
                model: "human".to_string(),
                backend: None,
            },
            shared: false,
        });
    }

    let (url_override, key_override, model_override) = match color {
        Color::White => (&body.white_api_url, &body.white_api_key, &body.white_model),
        Color::Black => (&body.black_api_url, &body.black_api_key, &body.black_model),
    };
    let defaults = config.side(color);

    let api_url = url_override
        .clone()
        .or_else(|| defaults.api_url.clone())
        .ok_or_else(|| bad_request(format!("no API endpoint configured for {}", color)))?;
    let api_key = key_override
        .clone()
        .or_else(|| defaults.api_key.clone())
        .ok_or_else(|| bad_request(format!("missing API key for {}", color)))?;
    let model = model_override
        .clone()
        .or_else(|| defaults.model.clone())
        .ok_or_else(|| bad_request(format!("no model configured for {}", color)))?;

    Ok(ResolvedSide {
        shared: url_override.is_none() && key_override.is_none(),
        slot: PlayerSlot {
            model: model.clone(),
            backend: Some(Arc::new(LlmClient::new(
                api_url,
                api_key,
                model,
                config.llm_log_path.clone(),
            ))),
        },
    })
}

/// Full state snapshot, or a default empty board before the first start.
#[utoipa::path(
    get,
    path = "/api/game/state",
    tag = "game",
    params(("token" = String, Query, description = "Session token")),
    responses(
        (status = 200, description = "State snapshot"),
        (status = 400, description = "Missing token", body = ErrorResponse),
    )
)]
pub async fn game_state(
    query: web::Query<TokenQuery>,
    data: web::Data<AppState>,
) -> impl Responder {
    let token = match require_token(&query) {
        Ok(token) => token,
        Err(resp) => return resp,
    };
    let state = match data.registry.game(&token) {
        Some(game) => game.snapshot(),
        None => empty_state(),
    };
    HttpResponse::Ok().json(state)
}

fn empty_state() -> serde_json::Value {
    json!({
        "board": Board::default().to_rows(),
        "turn": Color::White,
        "pgn": "",
        "moveCount": 0,
        "result": null,
        "models": null,
        "captured": CapturedPieces::from_board(&Board::default()),
        "clock": null,
        "humanSide": null,
    })
}

/// Submit the human player's move in SAN.
#[utoipa::path(
    post,
    path = "/api/game/move",
    tag = "game",
    params(("token" = String, Query, description = "Session token")),
    request_body = MoveRequest,
    responses(
        (status = 200, description = "Move accepted", body = MessageResponse),
        (status = 400, description = "No game, not your turn, or illegal move", body = ErrorResponse),
    )
)]
pub async fn submit_move(
    query: web::Query<TokenQuery>,
    body: web::Json<MoveRequest>,
    data: web::Data<AppState>,
) -> impl Responder {
    let token = match require_token(&query) {
        Ok(token) => token,
        Err(resp) => return resp,
    };
    let Some(game) = data.registry.game(&token) else {
        return bad_request("no game in progress");
    };
    match game.submit_human_move(body.san.trim()) {
        Ok(()) => HttpResponse::Ok().json(MessageResponse {
            message: "Move accepted".to_string(),
        }),
        Err(reason) => {
            log::warn!("session {}: move {} rejected: {}", token, body.san, reason);
            bad_request(reason)
        }
    }
}

/// Legal destination squares from a source square, for UI highlighting.
#[utoipa::path(
    get,
    path = "/api/game/legal-moves",
    tag = "game",
    params(
        ("token" = String, Query, description = "Session token"),
        ("file" = u8, Query, description = "Source file, 0 (a) to 7 (h)"),
        ("rank" = u8, Query, description = "Source rank, 0 (rank 1) to 7 (rank 8)"),
    ),
    responses(
        (status = 200, description = "Legal destinations", body = LegalMovesResponse),
        (status = 400, description = "Invalid square", body = ErrorResponse),
    )
)]
pub async fn legal_moves(
    query: web::Query<LegalMovesQuery>,
    data: web::Data<AppState>,
) -> impl Responder {
    let token = match require_token(&TokenQuery {
        token: query.token.clone(),
    }) {
        Ok(token) => token,
        Err(resp) => return resp,
    };
    if query.file >= 8 || query.rank >= 8 {
        return bad_request("file and rank must be 0..7");
    }
    let moves = match data.registry.game(&token) {
        Some(game) => game.legal_destinations(Square::new(query.file, query.rank)),
        None => Vec::new(),
    };
    HttpResponse::Ok().json(LegalMovesResponse { moves })
}

/// Stop the session's game.
#[utoipa::path(
    post,
    path = "/api/game/stop",
    tag = "game",
    params(("token" = String, Query, description = "Session token")),
    responses(
        (status = 200, description = "Game stopped", body = MessageResponse),
        (status = 400, description = "No active game", body = ErrorResponse),
    )
)]
pub async fn stop_game(
    query: web::Query<TokenQuery>,
    data: web::Data<AppState>,
) -> HttpResponse {
    let token = match require_token(&query) {
        Ok(token) => token,
        Err(resp) => return resp,
    };
    let Some(game) = data.registry.game(&token) else {
        return bad_request("no game in progress");
    };
    if game.is_terminal() {
        return bad_request("no active game to stop");
    }
    game.stop();
    log::info!("session {}: game stopped by user", token);
    HttpResponse::Ok().json(MessageResponse {
        message: "Game stopped".to_string(),
    })
}

/// Stop and delete the session's game, announcing the reset to any
/// remaining subscribers.
#[utoipa::path(
    post,
    path = "/api/game/reset",
    tag = "game",
    params(("token" = String, Query, description = "Session token")),
    responses(
        (status = 200, description = "Session reset", body = MessageResponse),
        (status = 400, description = "Missing token", body = ErrorResponse),
    )
)]
pub async fn reset_game(
    query: web::Query<TokenQuery>,
    data: web::Data<AppState>,
) -> impl Responder {
    let token = match require_token(&query) {
        Ok(token) => token,
        Err(resp) => return resp,
    };
    if let Some(game) = data.registry.remove_game(&token) {
        game.stop();
        log::info!("session {}: game reset", token);
    }
    data.registry
        .broadcast(&token, "status", &json!({ "message": "Game reset" }));
    data.registry.broadcast(
        &token,
        "board",
        &json!({
            "squares": Board::default().to_rows(),
            "turn": Color::White,
            "lastMove": null,
            "captured": CapturedPieces::from_board(&Board::default()),
        }),
    );
    HttpResponse::Ok().json(MessageResponse {
        message: "Game reset".to_string(),
    })
}

/// Plain-text board diagram for terminal debugging.
#[utoipa::path(
    get,
    path = "/api/game/board",
    tag = "game",
    params(("token" = String, Query, description = "Session token")),
    responses(
        (status = 200, description = "Board diagram", content_type = "text/plain"),
        (status = 400, description = "No game", body = ErrorResponse),
    )
)]
pub async fn board_ascii(
    query: web::Query<TokenQuery>,
    data: web::Data<AppState>,
) -> impl Responder {
    let token = match require_token(&query) {
        Ok(token) => token,
        Err(resp) => return resp,
    };
    let Some(game) = data.registry.game(&token) else {
        return bad_request("no game in progress");
    };
    let (board, turn) = game.board_and_turn();
    HttpResponse::Ok()
        .content_type("text/plain")
        .body(board_to_ascii(&board, turn))
}

/// Renders the board as a compact text diagram, rank 8 at the top, with
/// FEN piece letters and dots for empty squares.
pub fn board_to_ascii(board: &Board, turn: Color) -> String {
    let legend = "    a b c d e f g h\n";
    let mut out = String::from(legend);
    out.push_str("  +-----------------+\n");
    for rank in (0..8u8).rev() {
        out.push_str(&format!("{} | ", rank + 1));
        for file in 0..8u8 {
            let cell = board
                .get(Square::new(file, rank))
                .map_or('.', Piece::to_fen_char);
            out.push(cell);
            out.push(' ');
        }
        out.push_str(&format!("| {}\n", rank + 1));
    }
    out.push_str("  +-----------------+\n");
    out.push_str(legend);
    out.push_str(&format!("\n{} to move\n", turn));
    out
}

// ---------------------------------------------------------------------------
// Model-list proxy
// ---------------------------------------------------------------------------

/// List the models available at a caller-supplied endpoint.
///
/// The models URL is derived from the chat URL by stripping any trailing
/// `/chat` and `/completions` path segments and appending `/models`.
/// Results are cached per `(URL, credential)` for five minutes.
#[utoipa::path(
    post,
    path = "/api/models",
    tag = "models",
    request_body = ModelsRequest,
    responses(
        (status = 200, description = "Available models", body = ModelsResponse),
        (status = 400, description = "Missing endpoint or key", body = ErrorResponse),
        (status = 502, description = "Upstream failure", body = ErrorResponse),
    )
)]
pub async fn list_models(
    body: web::Json<ModelsRequest>,
    data: web::Data<AppState>,
) -> impl Responder {
    let Some(api_url) = body.api_url.as_deref().filter(|u| !u.trim().is_empty()) else {
        return bad_request("apiUrl is required");
    };
    let Some(api_key) = body.api_key.as_deref().filter(|k| !k.trim().is_empty()) else {
        return bad_request("apiKey is required");
    };
    fetch_models(&data, api_url, api_key).await
}

/// List the models available with the server's default credentials.
#[utoipa::path(
    post,
    path = "/api/models/default",
    tag = "models",
    responses(
        (status = 200, description = "Available models", body = ModelsResponse),
        (status = 400, description = "No defaults configured", body = ErrorResponse),
        (status = 502, description = "Upstream failure", body = ErrorResponse),
    )
)]
pub async fn list_default_models(data: web::Data<AppState>) -> impl Responder {
    let defaults = [&data.config.white, &data.config.black];
    let Some((api_url, api_key)) = defaults.iter().find_map(|side| {
        Some((side.api_url.clone()?, side.api_key.clone()?))
    }) else {
        return bad_request("no default credentials configured");
    };
    fetch_models(&data, &api_url, &api_key).await
}

/// Derives the models URL from a chat-completions URL.
fn derive_models_url(api_url: &str) -> String {
    let mut base = api_url.trim_end_matches('/');
    if let Some(stripped) = base.strip_suffix("/completions") {
        base = stripped.trim_end_matches('/');
    }
    if let Some(stripped) = base.strip_suffix("/chat") {
        base = stripped.trim_end_matches('/');
    }
    format!("{}/models", base)
}

/// The upstream model-list shape: OpenAI uses `data`, a few compatible
/// servers use `models`.
#[derive(Debug, Deserialize)]
struct UpstreamModelList {
    #[serde(default)]
    data: Vec<UpstreamModel>,
    #[serde(default)]
    models: Vec<UpstreamModel>,
}

#[derive(Debug, Deserialize)]
struct UpstreamModel {
    id: String,
}

async fn fetch_models(data: &AppState, api_url: &str, api_key: &str) -> HttpResponse {
    let models_url = derive_models_url(api_url);
    let cache_key = (models_url.clone(), api_key.to_string());

    {
        let cache = data.model_cache.lock().unwrap();
        if let Some((models, fetched_at)) = cache.get(&cache_key)
            && fetched_at.elapsed() < MODEL_CACHE_TTL
        {
            return HttpResponse::Ok().json(ModelsResponse {
                models: models.clone(),
            });
        }
    }

    let response = match data
        .http
        .get(&models_url)
        .header("Authorization", format!("Bearer {}", api_key))
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            return HttpResponse::BadGateway().json(ErrorResponse {
                error: format!("failed to reach {}: {}", models_url, e),
            });
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return HttpResponse::BadGateway().json(ErrorResponse {
            error: format!("upstream returned {}: {}", status.as_u16(), body),
        });
    }

    let list: UpstreamModelList = match response.json().await {
        Ok(list) => list,
        Err(e) => {
            return HttpResponse::BadGateway().json(ErrorResponse {
                error: format!("invalid model list from {}: {}", models_url, e),
            });
        }
    };

    let source = if list.data.is_empty() { list.models } else { list.data };
    let mut models: Vec<ModelInfo> = source
        .into_iter()
        .map(|m| ModelInfo {
            name: m.id.clone(),
            id: m.id,
        })
        .collect();
    models.sort_by(|a, b| a.id.cmp(&b.id));

    data.model_cache
        .lock()
        .unwrap()
        .insert(cache_key, (models.clone(), Instant::now()));

    HttpResponse::Ok().json(ModelsResponse { models })
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Server liveness and a count of live games.
#[utoipa::path(
    get,
    path = "/api/health",
    tag = "session",
    responses(
        (status = 200, description = "Server is up", body = HealthResponse),
    )
)]
pub async fn health(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        active_games: data.registry.game_count(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Configures all API routes.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/token", web::post().to(issue_token))
            .route("/health", web::get().to(health))
            .route("/game/stream", web::get().to(stream_events))
            .route("/game/start", web::post().to(start_game))
            .route("/game/state", web::get().to(game_state))
            .route("/game/move", web::post().to(submit_move))
            .route("/game/legal-moves", web::get().to(legal_moves))
            .route("/game/stop", web::post().to(stop_game))
            .route("/game/reset", web::post().to(reset_game))
            .route("/game/board", web::get().to(board_ascii))
            .route("/models", web::post().to(list_models))
            .route("/models/default", web::post().to(list_default_models)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SideDefaults;
    use actix_web::body::to_bytes;
    use actix_web::http::StatusCode;
    use actix_web::test::TestRequest;

    fn shared_defaults() -> SideDefaults {
        SideDefaults {
            api_url: Some("http://127.0.0.1:9/v1/chat/completions".to_string()),
            api_key: Some("server-key".to_string()),
            model: Some("test-model".to_string()),
        }
    }

    fn test_config(bypass: Option<&str>) -> ServerConfig {
        ServerConfig {
            white: shared_defaults(),
            black: shared_defaults(),
            max_retries: 1,
            bypass_password: bypass.map(str::to_string),
            port: 8080,
            llm_log_path: std::env::temp_dir().join("chess-arena-test-llm.log"),
        }
    }

    /// The human plays White, so the parked game never dials the (fake)
    /// upstream endpoint during these tests.
    fn human_white_start(password: Option<&str>) -> StartRequest {
        StartRequest {
            human_side: Some("white".to_string()),
            password: password.map(str::to_string),
            ..Default::default()
        }
    }

    fn token_query(token: &str) -> web::Query<TokenQuery> {
        web::Query(TokenQuery {
            token: Some(token.to_string()),
        })
    }

    #[tokio::test]
    async fn shared_credential_cooldown_flow() {
        let data = web::Data::new(AppState::new(
            crate::session::SessionRegistry::new(),
            test_config(Some("letmein")),
        ));
        let req = TestRequest::default().to_http_request();

        // First shared-credential start is accepted.
        let resp = start_game(token_query("tok"), web::Json(human_white_start(None)), data.clone())
            .await
            .respond_to(&req);
        assert_eq!(resp.status(), StatusCode::OK);

        // A second start while the game is live conflicts.
        let resp = start_game(token_query("tok"), web::Json(human_white_start(None)), data.clone())
            .await
            .respond_to(&req);
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        // Stop the game; the next start now trips the cooldown instead.
        let resp = stop_game(token_query("tok"), data.clone())
            .await
            .respond_to(&req);
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = start_game(token_query("tok"), web::Json(human_white_start(None)), data.clone())
            .await
            .respond_to(&req);
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let payload: serde_json::Value =
            serde_json::from_slice(&to_bytes(resp.into_body()).await.unwrap()).unwrap();
        assert!(payload["remainingMs"].as_u64().unwrap() > 0);
        assert_eq!(payload["bypass"], false);

        // The bypass password waives the cooldown.
        let resp = start_game(
            token_query("tok"),
            web::Json(human_white_start(Some("letmein"))),
            data.clone(),
        )
        .await
        .respond_to(&req);
        assert_eq!(resp.status(), StatusCode::OK);
        let payload: serde_json::Value =
            serde_json::from_slice(&to_bytes(resp.into_body()).await.unwrap()).unwrap();
        assert_eq!(payload["bypass"], true);

        // Cooldowns are per token: a fresh token starts cleanly.
        let resp = start_game(
            token_query("other"),
            web::Json(human_white_start(None)),
            data.clone(),
        )
        .await
        .respond_to(&req);
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn start_requires_credentials_for_llm_sides() {
        let data = web::Data::new(AppState::new(
            crate::session::SessionRegistry::new(),
            ServerConfig {
                white: SideDefaults::default(),
                black: SideDefaults::default(),
                max_retries: 3,
                bypass_password: None,
                port: 8080,
                llm_log_path: std::env::temp_dir().join("chess-arena-test-llm.log"),
            },
        ));
        let req = TestRequest::default().to_http_request();

        let resp = start_game(
            token_query("tok"),
            web::Json(StartRequest::default()),
            data.clone(),
        )
        .await
        .respond_to(&req);
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn models_url_derivation() {
        assert_eq!(
            derive_models_url("https://api.openai.com/v1/chat/completions"),
            "https://api.openai.com/v1/models"
        );
        assert_eq!(
            derive_models_url("https://host/v1/completions"),
            "https://host/v1/models"
        );
        assert_eq!(
            derive_models_url("https://host/v1/chat/"),
            "https://host/v1/models"
        );
        assert_eq!(derive_models_url("https://host/v1"), "https://host/v1/models");
    }

    #[test]
    fn empty_state_has_an_empty_board() {
        let state = empty_state();
        assert_eq!(state["moveCount"], 0);
        assert_eq!(state["pgn"], "");
        assert!(state["board"].as_array().unwrap().len() == 8);
        assert!(state["board"][0][0].is_null());
        assert!(state["result"].is_null());
    }

    #[test]
    fn ascii_board_shows_the_starting_position() {
        let rendered = board_to_ascii(&Board::starting_position(), Color::White);
        assert!(rendered.contains("8 | r n b q k b n r | 8"));
        assert!(rendered.contains("1 | R N B Q K B N R | 1"));
        assert!(rendered.contains("4 | . . . . . . . . | 4"));
        assert!(rendered.contains("white to move"));
    }
}
