//! # chess-arena — an LLM chess arena server
//!
//! chess-arena hosts chess games in which one or both players are Large
//! Language Models reached through OpenAI-compatible streaming
//! chat-completion APIs. A browser client observes or participates through
//! a per-session Server-Sent-Events stream.
//!
//! ## Features
//!
//! - **Complete rules engine**: SAN-driven move validation with castling,
//!   en passant, promotion, check/checkmate/stalemate detection, and the
//!   50-move rule. Captured pieces and the PGN move list are tracked for
//!   every game.
//!
//! - **LLM turn loop**: each game runs as a background task that prompts
//!   the configured model, streams its reasoning (`<think>` tags included)
//!   to subscribers, retries illegal moves up to a budget, and enforces
//!   chess clocks with increments.
//!
//! - **Multi-session**: opaque tokens map clients to games and event
//!   streams; idle sessions are reaped, and games that burn the server's
//!   own API credentials sit behind a per-token cooldown.
//!
//! - **Swagger/OpenAPI documentation** at `/swagger-ui/`.
//!
//! ## Usage
//!
//! ```bash
//! # Start the server (default: http://0.0.0.0:8080)
//! chess-arena serve
//!
//! # Custom port
//! chess-arena serve --port 3000
//! ```
//!
//! ## API Endpoints
//!
//! | Method | Path                    | Description                        |
//! |--------|-------------------------|------------------------------------|
//! | POST   | `/api/token`            | Issue a fresh session token        |
//! | GET    | `/api/game/stream`      | Per-session SSE event stream       |
//! | POST   | `/api/game/start`       | Start a game                       |
//! | GET    | `/api/game/state`       | Full state snapshot                |
//! | POST   | `/api/game/move`        | Submit the human player's move     |
//! | GET    | `/api/game/legal-moves` | Legal destinations from a square   |
//! | POST   | `/api/game/stop`        | Stop the game                      |
//! | POST   | `/api/game/reset`       | Stop and delete the game           |
//! | GET    | `/api/game/board`       | ASCII board diagram                |
//! | POST   | `/api/models`           | Model list for a custom endpoint   |
//! | POST   | `/api/models/default`   | Model list for the server defaults |
//! | GET    | `/api/health`           | Liveness and live-game count       |

pub mod api;
pub mod config;
pub mod game;
pub mod history;
pub mod llm;
pub mod movegen;
pub mod san;
pub mod session;
pub mod types;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use clap::{Parser, Subcommand};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::{ApiDoc, AppState};
use crate::config::ServerConfig;
use crate::session::SessionRegistry;

/// chess-arena — a server that pits LLMs against each other at chess.
#[derive(Parser, Debug)]
#[command(name = "chess-arena")]
#[command(about = "Arena server for LLM-vs-LLM and human-vs-LLM chess")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the arena server.
    Serve {
        /// Port to listen on (overrides the `PORT` environment variable).
        #[arg(short, long)]
        port: Option<u16>,

        /// Host address to bind to.
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
    },
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, host } => {
            let config = ServerConfig::from_env();
            let port = port.unwrap_or(config.port);
            run_server(&host, port, config).await
        }
    }
}

/// Starts the HTTP server with all API routes and Swagger UI, plus the
/// background reaper for idle sessions.
async fn run_server(host: &str, port: u16, config: ServerConfig) -> std::io::Result<()> {
    let openapi = ApiDoc::openapi();

    let registry = SessionRegistry::new();
    tokio::spawn(registry.clone().run_reaper());

    let app_state = web::Data::new(AppState::new(registry, config));

    log::info!("Starting chess-arena server on {}:{}", host, port);
    log::info!("API base URL: http://{}:{}/api", host, port);
    log::info!("Swagger UI available at http://{}:{}/swagger-ui/", host, port);
    log::info!(
        "Event stream: http://{}:{}/api/game/stream?token=<token>",
        host,
        port
    );

    HttpServer::new(move || {
        // CORS wide open: the browser client may be served from anywhere
        // and sessions are guarded by their tokens, not by origin.
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(app_state.clone())
            .configure(api::configure_routes)
            .service(SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", openapi.clone()))
    })
    .bind((host, port))?
    .run()
    .await
}
