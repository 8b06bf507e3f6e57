// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Live match coordination for the dice board game: lobbies, bots, rolls,
//! items and prize settlement. One actor task owns each match; everything
//! else talks to it through a [`coordinator::MatchHandle`].

use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Arc, Mutex, Weak},
};

use rollrush_common::{MatchError, MatchId};
use tokio::sync::mpsc;
use tracing::info;

pub mod board;
pub mod bot;
pub mod collaborators;
pub mod coordinator;
pub mod items;
pub mod scheduler;

use collaborators::Collaborators;
use coordinator::{JoinAck, MatchActor, MatchHandle};

/// Per-match tuning, shared by every match the registry opens.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub max_players: u8,
    pub entry_cost_points: u64,
    pub free_rolls_per_player: u32,
    pub lobby_countdown_seconds: u64,
    pub bot_lead_seconds: u64,
    pub match_duration_seconds: u64,
    pub ready_timeout_seconds: u64,
    pub disconnect_grace_seconds: u64,
    pub effect_duration_seconds: u64,
    pub item_award_probability: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            max_players: rollrush_common::MAX_PLAYERS,
            entry_cost_points: rollrush_common::ENTRY_COST_POINTS,
            free_rolls_per_player: rollrush_common::FREE_ROLLS_PER_PLAYER,
            lobby_countdown_seconds: rollrush_common::LOBBY_COUNTDOWN_SECONDS,
            bot_lead_seconds: rollrush_common::BOT_LEAD_SECONDS,
            match_duration_seconds: rollrush_common::MATCH_DURATION_SECONDS,
            ready_timeout_seconds: rollrush_common::READY_TIMEOUT_SECONDS,
            disconnect_grace_seconds: rollrush_common::DISCONNECT_GRACE_SECONDS,
            effect_duration_seconds: rollrush_common::EFFECT_DURATION_SECONDS,
            item_award_probability: rollrush_common::ITEM_AWARD_PROBABILITY,
        }
    }
}

impl MatchConfig {
    /// Defaults overridable per deployment through `ROLLRUSH_*` variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_players: env_or("ROLLRUSH_MAX_PLAYERS", defaults.max_players),
            entry_cost_points: env_or("ROLLRUSH_ENTRY_COST_POINTS", defaults.entry_cost_points),
            free_rolls_per_player: env_or(
                "ROLLRUSH_FREE_ROLLS_PER_PLAYER",
                defaults.free_rolls_per_player,
            ),
            lobby_countdown_seconds: env_or(
                "ROLLRUSH_LOBBY_COUNTDOWN_SECONDS",
                defaults.lobby_countdown_seconds,
            ),
            bot_lead_seconds: env_or("ROLLRUSH_BOT_LEAD_SECONDS", defaults.bot_lead_seconds),
            match_duration_seconds: env_or(
                "ROLLRUSH_MATCH_DURATION_SECONDS",
                defaults.match_duration_seconds,
            ),
            ready_timeout_seconds: env_or(
                "ROLLRUSH_READY_TIMEOUT_SECONDS",
                defaults.ready_timeout_seconds,
            ),
            disconnect_grace_seconds: env_or(
                "ROLLRUSH_DISCONNECT_GRACE_SECONDS",
                defaults.disconnect_grace_seconds,
            ),
            effect_duration_seconds: env_or(
                "ROLLRUSH_EFFECT_DURATION_SECONDS",
                defaults.effect_duration_seconds,
            ),
            item_award_probability: env_or(
                "ROLLRUSH_ITEM_AWARD_PROBABILITY",
                defaults.item_award_probability,
            ),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Tracks every live match and routes players into one with a free seat.
/// Matches deregister themselves once their actor task winds down.
pub struct MatchRegistry {
    config: MatchConfig,
    collaborators: Collaborators,
    matches: Mutex<HashMap<MatchId, MatchHandle>>,
    closed_tx: mpsc::UnboundedSender<MatchId>,
}

impl MatchRegistry {
    pub fn new(config: MatchConfig, collaborators: Collaborators) -> Arc<Self> {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            config,
            collaborators,
            matches: Mutex::new(HashMap::new()),
            closed_tx,
        });
        tokio::spawn(Self::prune_loop(Arc::downgrade(&registry), closed_rx));
        registry
    }

    async fn prune_loop(registry: Weak<Self>, mut closed_rx: mpsc::UnboundedReceiver<MatchId>) {
        while let Some(match_id) = closed_rx.recv().await {
            let Some(registry) = registry.upgrade() else {
                break;
            };
            registry
                .matches
                .lock()
                .expect("registry lock poisoned")
                .remove(&match_id);
            info!(match_id = %match_id, "match deregistered");
        }
    }

    pub fn open_match(&self) -> MatchHandle {
        let handle = MatchActor::spawn(
            self.config.clone(),
            self.collaborators.clone(),
            self.closed_tx.clone(),
        );
        self.matches
            .lock()
            .expect("registry lock poisoned")
            .insert(handle.match_id().to_string(), handle.clone());
        handle
    }

    pub fn get(&self, match_id: &str) -> Option<MatchHandle> {
        self.matches
            .lock()
            .expect("registry lock poisoned")
            .get(match_id)
            .cloned()
    }

    pub fn live_matches(&self) -> usize {
        self.matches.lock().expect("registry lock poisoned").len()
    }

    /// Join the first match still accepting players, opening a fresh one when
    /// every live match is full, started, or gone.
    pub async fn join_any(&self, token: &str) -> Result<JoinAck, MatchError> {
        let candidates: Vec<MatchHandle> = {
            let matches = self.matches.lock().expect("registry lock poisoned");
            matches.values().cloned().collect()
        };
        for handle in candidates {
            match handle.join(token).await {
                Ok(ack) => return Ok(ack),
                // Full, already started, or shutting down: try the next one.
                Err(MatchError::InvalidState(_)) | Err(MatchError::InsufficientResource(_)) => {}
                Err(error) => return Err(error),
            }
        }
        self.open_match().join(token).await
    }
}
