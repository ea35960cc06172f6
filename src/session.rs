//! Session registry and event broadcast fabric.
//!
//! Three maps keyed by opaque session token: token → game, token → set of
//! SSE subscribers, and token → last shared-credential game start. A token
//! has at most one live game; subscribers are plain channel senders that
//! are pruned the moment a send fails, so a slow or vanished browser never
//! blocks a game loop.
//!
//! A background reaper sweeps every five minutes and drops games that have
//! been finished for over an hour, along with expired cooldown stamps.

use crate::game::{Event, EventSink, Game};
use actix_web::web::Bytes;
use futures::channel::mpsc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// How often the reaper sweeps.
const REAP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How long a finished game lingers before it is reaped.
const FINISHED_TTL: Duration = Duration::from_secs(60 * 60);

/// Cooldown between game starts that consume the server's own credentials.
pub const SHARED_CREDENTIAL_COOLDOWN: Duration = Duration::from_secs(20 * 60);

/// One SSE subscription: frames are pushed in, the HTTP response streams
/// them out. A closed receiver surfaces as a send error and gets pruned.
pub type SseSender = mpsc::UnboundedSender<Result<Bytes, std::convert::Infallible>>;
pub type SseReceiver = mpsc::UnboundedReceiver<Result<Bytes, std::convert::Infallible>>;

/// Central store mapping session tokens to games and event subscribers.
pub struct SessionRegistry {
    games: Mutex<HashMap<String, Arc<Game>>>,
    subscribers: Mutex<HashMap<String, HashMap<Uuid, SseSender>>>,
    cooldowns: Mutex<HashMap<String, Instant>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            games: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
        })
    }

    // -----------------------------------------------------------------------
    // Games
    // -----------------------------------------------------------------------

    /// The game bound to a token, if any.
    pub fn game(&self, token: &str) -> Option<Arc<Game>> {
        self.games.lock().unwrap().get(token).cloned()
    }

    /// Binds a game to a token, replacing whatever was there.
    pub fn insert_game(&self, token: &str, game: Arc<Game>) {
        self.games.lock().unwrap().insert(token.to_string(), game);
    }

    /// Unbinds and returns a token's game.
    pub fn remove_game(&self, token: &str) -> Option<Arc<Game>> {
        self.games.lock().unwrap().remove(token)
    }

    /// Number of games currently held (finished ones included until reaped).
    pub fn game_count(&self) -> usize {
        self.games.lock().unwrap().len()
    }

    // -----------------------------------------------------------------------
    // Subscribers & fanout
    // -----------------------------------------------------------------------

    /// Registers a new event-stream subscriber under a token and returns
    /// its id together with the receiving end to stream from.
    pub fn subscribe(&self, token: &str) -> (Uuid, SseReceiver) {
        let (sender, receiver) = mpsc::unbounded();
        let id = Uuid::new_v4();
        self.subscribers
            .lock()
            .unwrap()
            .entry(token.to_string())
            .or_default()
            .insert(id, sender);
        log::debug!("subscriber {} joined session {}", id, token);
        (id, receiver)
    }

    /// Sends one frame to a single subscriber (the on-subscribe snapshot).
    pub fn send_to(&self, token: &str, subscriber: &Uuid, kind: &str, data: &serde_json::Value) {
        let frame = sse_frame(kind, data);
        if let Some(subs) = self.subscribers.lock().unwrap().get(token)
            && let Some(sender) = subs.get(subscriber)
        {
            let _ = sender.unbounded_send(Ok(frame));
        }
    }

    /// Writes one SSE frame to every subscriber under the token. Dead
    /// subscribers are pruned; an emptied set drops the token key.
    pub fn broadcast(&self, token: &str, kind: &str, data: &serde_json::Value) {
        let frame = sse_frame(kind, data);
        let mut subscribers = self.subscribers.lock().unwrap();
        let Some(subs) = subscribers.get_mut(token) else {
            return;
        };
        subs.retain(|id, sender| {
            let alive = sender.unbounded_send(Ok(frame.clone())).is_ok();
            if !alive {
                log::debug!("subscriber {} left session {}", id, token);
            }
            alive
        });
        if subs.is_empty() {
            subscribers.remove(token);
        }
    }

    /// Builds the emit closure a game is constructed with: every event the
    /// loop emits fans out to the token's current subscribers.
    pub fn event_sink(self: &Arc<Self>, token: &str) -> EventSink {
        let registry: Weak<SessionRegistry> = Arc::downgrade(self);
        let token = token.to_string();
        Arc::new(move |event: Event| {
            if let Some(registry) = registry.upgrade() {
                registry.broadcast(&token, event.kind, &event.data);
            }
        })
    }

    // -----------------------------------------------------------------------
    // Shared-credential cooldown
    // -----------------------------------------------------------------------

    /// Time left before the token may start another game on the server's
    /// shared credentials, if the cooldown is still running.
    pub fn shared_cooldown_remaining(&self, token: &str) -> Option<Duration> {
        let cooldowns = self.cooldowns.lock().unwrap();
        let started = cooldowns.get(token)?;
        let elapsed = started.elapsed();
        if elapsed < SHARED_CREDENTIAL_COOLDOWN {
            Some(SHARED_CREDENTIAL_COOLDOWN - elapsed)
        } else {
            None
        }
    }

    /// Stamps the token's shared-credential start at now.
    pub fn record_shared_start(&self, token: &str) {
        self.cooldowns
            .lock()
            .unwrap()
            .insert(token.to_string(), Instant::now());
    }

    // -----------------------------------------------------------------------
    // Idle reaper
    // -----------------------------------------------------------------------

    /// Drops games that finished more than [`FINISHED_TTL`] ago and expired
    /// cooldown stamps. Returns how many games were removed.
    pub fn reap(&self) -> usize {
        let mut games = self.games.lock().unwrap();
        let before = games.len();
        games.retain(|token, game| {
            let expired = game
                .finished_since()
                .is_some_and(|idle| idle > FINISHED_TTL);
            if expired {
                log::info!("reaping finished game for session {}", token);
            }
            !expired
        });
        let reaped = before - games.len();
        drop(games);

        self.cooldowns
            .lock()
            .unwrap()
            .retain(|_, at| at.elapsed() < SHARED_CREDENTIAL_COOLDOWN);
        reaped
    }

    /// Runs the periodic sweep for the life of the process.
    pub async fn run_reaper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let reaped = self.reap();
            if reaped > 0 {
                log::info!("reaper removed {} finished game(s)", reaped);
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, token: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(token)
            .map_or(0, |subs| subs.len())
    }
}

/// Frames one event for the wire: `event: <kind>\ndata: <json>\n\n`.
fn sse_frame(kind: &str, data: &serde_json::Value) -> Bytes {
    Bytes::from(format!("event: {}\ndata: {}\n\n", kind, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn broadcast_frames_and_prunes_dead_subscribers() {
        let registry = SessionRegistry::new();
        let (_id_a, mut alive) = registry.subscribe("tok");
        let (_id_b, dead) = registry.subscribe("tok");
        assert_eq!(registry.subscriber_count("tok"), 2);

        drop(dead);
        registry.broadcast("tok", "status", &json!({ "message": "hi" }));

        let frame = alive.try_next().unwrap().unwrap().unwrap();
        assert_eq!(
            std::str::from_utf8(&frame).unwrap(),
            "event: status\ndata: {\"message\":\"hi\"}\n\n"
        );
        assert_eq!(registry.subscriber_count("tok"), 1);

        // Dropping the last subscriber clears the token key entirely.
        drop(alive);
        registry.broadcast("tok", "status", &json!({ "message": "bye" }));
        assert_eq!(registry.subscriber_count("tok"), 0);
        assert!(!registry.subscribers.lock().unwrap().contains_key("tok"));
    }

    #[test]
    fn send_to_reaches_only_the_named_subscriber() {
        let registry = SessionRegistry::new();
        let (id_a, mut a) = registry.subscribe("tok");
        let (_id_b, mut b) = registry.subscribe("tok");

        registry.send_to("tok", &id_a, "state", &json!({ "moveCount": 0 }));

        assert!(a.try_next().is_ok());
        assert!(b.try_next().is_err(), "no frame queued for b");
    }

    #[test]
    fn tokens_are_isolated() {
        let registry = SessionRegistry::new();
        let (_ida, mut a) = registry.subscribe("alpha");
        let (_idb, mut b) = registry.subscribe("beta");

        registry.broadcast("alpha", "status", &json!({ "message": "only a" }));
        assert!(a.try_next().is_ok());
        assert!(b.try_next().is_err());
    }

    #[test]
    fn cooldown_counts_down_and_expires() {
        let registry = SessionRegistry::new();
        assert!(registry.shared_cooldown_remaining("tok").is_none());

        registry.record_shared_start("tok");
        let remaining = registry.shared_cooldown_remaining("tok").unwrap();
        assert!(remaining <= SHARED_CREDENTIAL_COOLDOWN);
        assert!(remaining > SHARED_CREDENTIAL_COOLDOWN - Duration::from_secs(5));

        // Other tokens are unaffected.
        assert!(registry.shared_cooldown_remaining("other").is_none());
    }

    #[test]
    fn reap_keeps_unfinished_games() {
        use crate::game::{GameOptions, PlayerSlot, PromptStyle};

        let registry = SessionRegistry::new();
        let game = crate::game::Game::new(
            GameOptions {
                white: PlayerSlot {
                    model: "human".into(),
                    backend: None,
                },
                black: PlayerSlot {
                    model: "human".into(),
                    backend: None,
                },
                human_side: None,
                max_retries: 1,
                base_time_ms: None,
                increment_ms: 0,
                prompt_style: PromptStyle::Json,
            },
            Arc::new(|_| {}),
        );
        registry.insert_game("tok", game);
        assert_eq!(registry.reap(), 0);
        assert_eq!(registry.game_count(), 1);
    }
}
