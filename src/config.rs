//! Server configuration, read once from the environment at startup.
//!
//! Per-side defaults let the server host games on its own credentials when
//! a start request does not bring its own; such "shared-credential" starts
//! are what the per-token cooldown guards. Every value can be overridden
//! per side and per request.
//!
//! | Variable          | Meaning                                   | Default              |
//! |-------------------|-------------------------------------------|----------------------|
//! | `WHITE_API_URL`   | default chat endpoint for White           | —                    |
//! | `WHITE_API_KEY`   | default credential for White              | —                    |
//! | `WHITE_MODEL`     | default model for White                   | —                    |
//! | `BLACK_API_URL`   | default chat endpoint for Black           | —                    |
//! | `BLACK_API_KEY`   | default credential for Black              | —                    |
//! | `BLACK_MODEL`     | default model for Black                   | —                    |
//! | `MAX_RETRIES`     | LLM attempts per turn before forfeit      | 3                    |
//! | `BYPASS_PASSWORD` | waives the shared-credential cooldown     | —                    |
//! | `PORT`            | listening port (CLI flag wins)            | 8080                 |
//! | `LLM_LOG_PATH`    | JSONL file for LLM exchange records       | `llm_requests.log`   |

use crate::types::Color;
use std::path::PathBuf;

/// Default endpoint, credential, and model for one side.
#[derive(Debug, Clone, Default)]
pub struct SideDefaults {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

/// All environment-driven server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub white: SideDefaults,
    pub black: SideDefaults,
    /// LLM attempts per turn before the side forfeits.
    pub max_retries: u32,
    /// Waives the shared-credential cooldown when supplied in a start
    /// request.
    pub bypass_password: Option<String>,
    pub port: u16,
    /// Append-only JSONL log of every LLM exchange.
    pub llm_log_path: PathBuf,
}

impl ServerConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            white: SideDefaults {
                api_url: env_opt("WHITE_API_URL"),
                api_key: env_opt("WHITE_API_KEY"),
                model: env_opt("WHITE_MODEL"),
            },
            black: SideDefaults {
                api_url: env_opt("BLACK_API_URL"),
                api_key: env_opt("BLACK_API_KEY"),
                model: env_opt("BLACK_MODEL"),
            },
            max_retries: env_opt("MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            bypass_password: env_opt("BYPASS_PASSWORD"),
            port: env_opt("PORT").and_then(|v| v.parse().ok()).unwrap_or(8080),
            llm_log_path: env_opt("LLM_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("llm_requests.log")),
        }
    }

    /// The defaults for one side.
    pub fn side(&self, color: Color) -> &SideDefaults {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }
}

/// Reads an environment variable, treating empty values as unset.
fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
