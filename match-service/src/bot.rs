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

use std::time::Duration;

use rand::Rng;
use rollrush_common::{
    ActiveItem, ClientCommand, EventEnvelope, ItemCode, MatchError, ServerEvent, SessionId,
};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};

use crate::coordinator::MatchHandle;

const ITEM_USE_PROBABILITY: f64 = 0.7;
const MIN_FIRST_ROLL_DELAY_SECONDS: u64 = 3;
const MAX_FIRST_ROLL_DELAY_SECONDS: u64 = 5;

/// Launch an autonomous agent for an already-seated bot session. The agent
/// observes the same event stream and submits the same commands as a human
/// client; the match gives it no shortcuts.
pub fn spawn(handle: MatchHandle, session_id: SessionId, opponents: Vec<SessionId>) -> JoinHandle<()> {
    // Subscribe before the actor emits anything further so no event is lost.
    let events = handle.subscribe();
    let agent = BotAgent {
        handle,
        events,
        brain: BotBrain::new(session_id, opponents),
    };
    tokio::spawn(agent.run())
}

/// Decision state, kept apart from the I/O loop.
struct BotBrain {
    session_id: SessionId,
    opponents: Vec<SessionId>,
    held_item: Option<ActiveItem>,
    last_roll_value: Option<u8>,
}

enum Observation {
    Continue,
    MatchOver,
}

impl BotBrain {
    fn new(session_id: SessionId, opponents: Vec<SessionId>) -> Self {
        Self {
            session_id,
            opponents,
            held_item: None,
            last_roll_value: None,
        }
    }

    fn observe(&mut self, envelope: EventEnvelope) -> Observation {
        if !envelope.target.includes(&self.session_id) {
            return Observation::Continue;
        }
        match envelope.event {
            ServerEvent::PlayerJoined { session_id, .. } if session_id != self.session_id => {
                self.opponents.push(session_id);
            }
            ServerEvent::RollResult {
                session_id,
                roll_value,
                ..
            } if session_id == self.session_id => {
                self.last_roll_value = Some(roll_value);
            }
            ServerEvent::ItemAwarded { session_id, item } if session_id == self.session_id => {
                self.held_item = Some(item);
            }
            ServerEvent::ItemUsed { session_id, .. } if session_id == self.session_id => {
                self.held_item = None;
            }
            ServerEvent::GameEnded { .. } => return Observation::MatchOver,
            _ => {}
        }
        Observation::Continue
    }

    /// Pacing mimics a human watching their token move: roughly one second
    /// per tile just rolled, with a small random delay before the first roll.
    fn next_roll_delay(&self) -> Duration {
        match self.last_roll_value {
            Some(value) => Duration::from_secs(u64::from(value) + 1),
            None => Duration::from_secs(
                rand::rng().random_range(MIN_FIRST_ROLL_DELAY_SECONDS..=MAX_FIRST_ROLL_DELAY_SECONDS),
            ),
        }
    }

    /// Deadline for the roll after one made at `rolled_at`. Anchored at the
    /// roll itself, so the post-roll item window spends part of the delay
    /// instead of stacking on top of it.
    fn next_roll_at(&self, rolled_at: Instant) -> Instant {
        rolled_at + self.next_roll_delay()
    }

    fn choose_item_command(&self, rng: &mut impl Rng) -> Option<ClientCommand> {
        let item = self.held_item.as_ref()?;
        if !rng.random_bool(ITEM_USE_PROBABILITY) {
            return None;
        }
        let target_session = match item.code {
            ItemCode::Slow => {
                if self.opponents.is_empty() {
                    return None;
                }
                Some(self.opponents[rng.random_range(0..self.opponents.len())].clone())
            }
            _ => None,
        };
        Some(ClientCommand::UseItem {
            item_code: item.code,
            target_session,
            // The match picks a legal tile for road blocks.
            target_position: None,
            cheat_range: item.cheat_range,
        })
    }
}

struct BotAgent {
    handle: MatchHandle,
    events: broadcast::Receiver<EventEnvelope>,
    brain: BotBrain,
}

impl BotAgent {
    async fn run(mut self) {
        info!(
            match_id = %self.handle.match_id(),
            session_id = %self.brain.session_id,
            "bot agent online"
        );
        if !self.wait_for_start().await {
            return;
        }
        let mut next_roll_at = Instant::now() + self.brain.next_roll_delay();
        loop {
            if !self.idle_until(next_roll_at).await {
                break;
            }
            let rolled_at = Instant::now();
            match self
                .handle
                .command(&self.brain.session_id, ClientCommand::Roll)
                .await
            {
                Ok(()) => {}
                Err(MatchError::InsufficientResource(_)) => {
                    debug!(session_id = %self.brain.session_id, "bot out of free rolls");
                    break;
                }
                Err(error) => {
                    debug!(
                        session_id = %self.brain.session_id,
                        error = %error,
                        "bot roll rejected; stopping"
                    );
                    break;
                }
            }
            // Let the result land, then sometimes play whatever we hold.
            if !self.idle_until(rolled_at + Duration::from_secs(1)).await {
                break;
            }
            self.maybe_use_item().await;
            next_roll_at = self.brain.next_roll_at(rolled_at);
        }
        info!(
            match_id = %self.handle.match_id(),
            session_id = %self.brain.session_id,
            "bot agent offline"
        );
    }

    async fn wait_for_start(&mut self) -> bool {
        loop {
            match self.events.recv().await {
                Ok(envelope) => {
                    let started = matches!(envelope.event, ServerEvent::GameStarted { .. });
                    if matches!(self.brain.observe(envelope), Observation::MatchOver) {
                        return false;
                    }
                    if started {
                        return true;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "bot event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    }

    /// Keep digesting events until the deadline. Returns false once the match
    /// is over or the event stream is gone.
    async fn idle_until(&mut self, deadline: Instant) -> bool {
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return true,
                received = self.events.recv() => match received {
                    Ok(envelope) => {
                        if matches!(self.brain.observe(envelope), Observation::MatchOver) {
                            return false;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bot event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                },
            }
        }
    }

    async fn maybe_use_item(&mut self) {
        let command = {
            let mut rng = rand::rng();
            self.brain.choose_item_command(&mut rng)
        };
        let Some(command) = command else { return };
        if let Err(error) = self.handle.command(&self.brain.session_id, command).await {
            // Our view of the held item was stale; forget it and move on.
            debug!(
                session_id = %self.brain.session_id,
                error = %error,
                "bot item use rejected"
            );
            self.brain.held_item = None;
        }
    }
}
