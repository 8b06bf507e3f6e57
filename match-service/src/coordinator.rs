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

use std::{cmp::Reverse, collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use rand::Rng;
use rollrush_common::{
    ActiveItem, ClientCommand, EventEnvelope, GameEndReason, MIN_PLAYERS_TO_START, MatchError,
    MatchId, MatchPhase, PlayerResult, PlayerSession, RoadBlock, Seat, ServerEvent, SessionId,
    UserId, WinnerSummary,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    MatchConfig,
    board::{self, DieRoller, RandomDie},
    bot,
    collaborators::Collaborators,
    items::{self, ItemRequest},
    scheduler::Countdown,
};

/// Everything that may land in a match's inbox. Timer callbacks and the bot
/// agent enqueue here exactly like human commands; nothing mutates match
/// state from outside the actor loop.
pub enum MatchMessage {
    Join {
        token: String,
        reply: oneshot::Sender<Result<JoinAck, MatchError>>,
    },
    Command {
        session_id: SessionId,
        command: ClientCommand,
        reply: Option<oneshot::Sender<Result<(), MatchError>>>,
    },
    Disconnect {
        session_id: SessionId,
    },
    LobbyCountdownElapsed,
    BotJoinDue,
    ReadyTimeout,
    DurationElapsed,
    Shutdown,
}

#[derive(Debug)]
pub struct JoinAck {
    pub match_id: MatchId,
    pub session_id: SessionId,
    pub seat: Seat,
    pub events: broadcast::Receiver<EventEnvelope>,
}

/// Cheap cloneable handle onto one match's serialized command path.
#[derive(Clone)]
pub struct MatchHandle {
    match_id: MatchId,
    tx: mpsc::Sender<MatchMessage>,
    events: broadcast::Sender<EventEnvelope>,
}

impl MatchHandle {
    pub fn match_id(&self) -> &str {
        &self.match_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn join(&self, token: &str) -> Result<JoinAck, MatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(MatchMessage::Join {
                token: token.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| closed_error())?;
        reply_rx.await.map_err(|_| closed_error())?
    }

    pub async fn command(
        &self,
        session_id: &str,
        command: ClientCommand,
    ) -> Result<(), MatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(MatchMessage::Command {
                session_id: session_id.to_string(),
                command,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| closed_error())?;
        reply_rx.await.map_err(|_| closed_error())?
    }

    /// Report a dropped client connection. The seat and accumulated score
    /// stay reserved; only the connected flag flips.
    pub async fn disconnect(&self, session_id: &str) -> Result<(), MatchError> {
        self.tx
            .send(MatchMessage::Disconnect {
                session_id: session_id.to_string(),
            })
            .await
            .map_err(|_| closed_error())
    }
}

fn closed_error() -> MatchError {
    MatchError::InvalidState(MatchPhase::Finished)
}

struct MatchState {
    match_id: MatchId,
    phase: MatchPhase,
    max_players: u8,
    entry_cost: u64,
    prize_pool: u64,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    road_blocks: Vec<RoadBlock>,
    sessions: HashMap<SessionId, PlayerSession>,
    next_seat: Seat,
}

pub struct MatchActor {
    config: MatchConfig,
    collaborators: Collaborators,
    die: Arc<dyn DieRoller>,
    inbox: mpsc::Receiver<MatchMessage>,
    self_tx: mpsc::Sender<MatchMessage>,
    events: broadcast::Sender<EventEnvelope>,
    closed_tx: mpsc::UnboundedSender<MatchId>,
    state: MatchState,
    lobby_timer: Option<Countdown>,
    bot_timer: Option<Countdown>,
    ready_timer: Option<Countdown>,
    duration_timer: Option<Countdown>,
    shutdown_timer: Option<Countdown>,
}

impl MatchActor {
    pub fn spawn(
        config: MatchConfig,
        collaborators: Collaborators,
        closed_tx: mpsc::UnboundedSender<MatchId>,
    ) -> MatchHandle {
        Self::spawn_with_die(config, collaborators, Arc::new(RandomDie), closed_tx)
    }

    pub fn spawn_with_die(
        config: MatchConfig,
        collaborators: Collaborators,
        die: Arc<dyn DieRoller>,
        closed_tx: mpsc::UnboundedSender<MatchId>,
    ) -> MatchHandle {
        let (actor, handle) = Self::new(config, collaborators, die, closed_tx);
        tokio::spawn(actor.run());
        handle
    }

    fn new(
        config: MatchConfig,
        collaborators: Collaborators,
        die: Arc<dyn DieRoller>,
        closed_tx: mpsc::UnboundedSender<MatchId>,
    ) -> (Self, MatchHandle) {
        let match_id = Uuid::new_v4().to_string();
        let (tx, inbox) = mpsc::channel(256);
        let (events, _) = broadcast::channel(512);

        let state = MatchState {
            match_id: match_id.clone(),
            phase: MatchPhase::Waiting,
            max_players: config.max_players,
            entry_cost: config.entry_cost_points,
            prize_pool: 0,
            started_at: None,
            finished_at: None,
            road_blocks: Vec::new(),
            sessions: HashMap::new(),
            next_seat: 1,
        };
        let actor = Self {
            config,
            collaborators,
            die,
            inbox,
            self_tx: tx.clone(),
            events: events.clone(),
            closed_tx,
            state,
            lobby_timer: None,
            bot_timer: None,
            ready_timer: None,
            duration_timer: None,
            shutdown_timer: None,
        };
        let handle = MatchHandle {
            match_id,
            tx,
            events,
        };
        (actor, handle)
    }

    async fn run(mut self) {
        info!(match_id = %self.state.match_id, "match opened");
        while let Some(message) = self.inbox.recv().await {
            if matches!(message, MatchMessage::Shutdown) {
                break;
            }
            self.handle(message).await;
        }
        info!(match_id = %self.state.match_id, "match closed");
        let _ = self.closed_tx.send(self.state.match_id.clone());
    }

    async fn handle(&mut self, message: MatchMessage) {
        match message {
            MatchMessage::Join { token, reply } => {
                let result = self.handle_join(&token).await;
                let _ = reply.send(result);
            }
            MatchMessage::Command {
                session_id,
                command,
                reply,
            } => {
                let result = self.handle_command(&session_id, command).await;
                if let Err(error) = &result {
                    self.emit(EventEnvelope::to_session(
                        &session_id,
                        ServerEvent::Error {
                            message: error.to_string(),
                        },
                    ));
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            MatchMessage::Disconnect { session_id } => self.on_disconnect(&session_id).await,
            MatchMessage::LobbyCountdownElapsed => self.on_lobby_elapsed(),
            MatchMessage::BotJoinDue => self.on_bot_join_due(),
            MatchMessage::ReadyTimeout => self.on_ready_timeout(),
            MatchMessage::DurationElapsed => self.on_duration_elapsed().await,
            MatchMessage::Shutdown => {}
        }
    }

    /// State first, notification second, for every transition below: a client
    /// querying right after a notification must observe post-transition state.
    async fn handle_join(&mut self, token: &str) -> Result<JoinAck, MatchError> {
        if self.state.phase != MatchPhase::Waiting {
            return Err(MatchError::InvalidState(self.state.phase));
        }
        if self.state.sessions.len() as u8 >= self.state.max_players {
            return Err(MatchError::InsufficientResource("match is full"));
        }

        let identity = self.collaborators.sessions.validate_session(token).await?;

        // Subscribe before emitting so the joiner sees their own join event.
        let events = self.events.subscribe();
        let seat = self.state.next_seat;
        self.state.next_seat += 1;
        let session = PlayerSession::new_human(
            identity.user_id.clone(),
            seat,
            self.config.free_rolls_per_player,
        );
        let session_id = session.session_id.clone();
        self.state.prize_pool += self.state.entry_cost;
        self.state.sessions.insert(session_id.clone(), session);

        info!(
            match_id = %self.state.match_id,
            user_id = %identity.user_id,
            seat,
            current_players = self.state.sessions.len(),
            "player joined"
        );
        self.emit(EventEnvelope::all(ServerEvent::PlayerJoined {
            session_id: session_id.clone(),
            user_id: identity.user_id,
            seat,
            current_players: self.state.sessions.len() as u8,
            prize_pool: self.state.prize_pool,
        }));

        if self.state.sessions.len() == 1 {
            self.start_lobby_countdown();
        } else if self.human_count() == 2
            && let Some(timer) = self.bot_timer.take()
        {
            // A second human arrived before the bot's lead time.
            timer.cancel();
            info!(match_id = %self.state.match_id, "bot join cancelled");
        }

        if self.state.sessions.len() as u8 == self.state.max_players {
            self.transition_to_ready();
        }

        Ok(JoinAck {
            match_id: self.state.match_id.clone(),
            session_id,
            seat,
            events,
        })
    }

    async fn handle_command(
        &mut self,
        session_id: &str,
        command: ClientCommand,
    ) -> Result<(), MatchError> {
        if self.state.phase == MatchPhase::Finished {
            return Err(MatchError::InvalidState(MatchPhase::Finished));
        }
        if !self.state.sessions.contains_key(session_id) {
            return Err(MatchError::InvalidTarget(format!(
                "unknown session {session_id}"
            )));
        }

        match command {
            ClientCommand::Roll => self.on_roll(session_id).await,
            ClientCommand::UseItem {
                item_code,
                target_session,
                target_position,
                cheat_range,
            } => self.on_use_item(
                session_id,
                ItemRequest {
                    item_code,
                    target_session,
                    target_position,
                    cheat_range,
                },
            ),
            ClientCommand::ChangeAvatar { avatar_code, .. } => {
                self.on_change_avatar(session_id, &avatar_code).await
            }
            ClientCommand::RequestWaitingTimer => self.on_request_waiting_timer(session_id),
            ClientCommand::RequestGameTimer => self.on_request_game_timer(session_id),
            ClientCommand::GameLoadFinished => self.on_load_finished(session_id),
            // Effect expiry is server-computed at roll time; the client's
            // opinion is accepted and discarded.
            ClientCommand::EffectExpired => Ok(()),
        }
    }

    /// A dropped client. The session is never removed: seat, board and points
    /// stay exactly as they were so a reconnect or the final results can pick
    /// them up. Only the connected flag flips, which takes the session out of
    /// the readiness barrier and the rolls-exhausted check.
    async fn on_disconnect(&mut self, session_id: &str) {
        if self.state.phase == MatchPhase::Finished {
            return;
        }
        let Some(session) = self.state.sessions.get_mut(session_id) else {
            return;
        };
        if !session.connected {
            return;
        }
        session.connected = false;
        let seat = session.seat;
        info!(
            match_id = %self.state.match_id,
            session_id,
            seat,
            "player disconnected; seat stays reserved"
        );

        // A straggler dropping out may complete the readiness barrier.
        self.try_start_match();
        if self.state.phase == MatchPhase::InProgress
            && self.connected_count() > 0
            && self.all_connected_rolls_exhausted()
        {
            self.finish(GameEndReason::RollsExhausted).await;
        }
    }

    fn start_lobby_countdown(&mut self) {
        let duration = Duration::from_secs(self.config.lobby_countdown_seconds);
        self.lobby_timer = Some(self.enqueue_later(duration, MatchMessage::LobbyCountdownElapsed));
        self.emit(EventEnvelope::all(ServerEvent::WaitingTimerStarted {
            duration_seconds: self.config.lobby_countdown_seconds,
            current_players: self.state.sessions.len() as u8,
        }));
        self.maybe_schedule_bot_join();
    }

    fn maybe_schedule_bot_join(&mut self) {
        if self.human_count() != 1 || self.has_bot() {
            return;
        }
        let lead = self
            .config
            .lobby_countdown_seconds
            .saturating_sub(self.config.bot_lead_seconds);
        self.bot_timer = Some(self.enqueue_later(
            Duration::from_secs(lead),
            MatchMessage::BotJoinDue,
        ));
    }

    fn on_lobby_elapsed(&mut self) {
        if self.state.phase != MatchPhase::Waiting {
            return;
        }
        self.lobby_timer = None;
        if self.state.sessions.len() as u8 >= MIN_PLAYERS_TO_START {
            self.transition_to_ready();
        } else {
            // Too few players: restart the countdown rather than ending the
            // match, rescheduling the bot if a lone human is still waiting.
            info!(
                match_id = %self.state.match_id,
                current_players = self.state.sessions.len(),
                "lobby countdown expired short of players; restarting"
            );
            self.start_lobby_countdown();
        }
    }

    fn on_bot_join_due(&mut self) {
        if self.state.phase != MatchPhase::Waiting {
            return;
        }
        self.bot_timer = None;
        if self.human_count() != 1 || self.state.sessions.len() as u8 >= self.state.max_players {
            return;
        }

        let seat = self.state.next_seat;
        self.state.next_seat += 1;
        let session = PlayerSession::new_bot(seat, self.config.free_rolls_per_player);
        let session_id = session.session_id.clone();
        let opponents: Vec<SessionId> = self
            .state
            .sessions
            .values()
            .filter(|s| s.connected)
            .map(|s| s.session_id.clone())
            .collect();
        self.state.prize_pool += self.state.entry_cost;
        self.state.sessions.insert(session_id.clone(), session);

        info!(
            match_id = %self.state.match_id,
            bot_seat = seat,
            current_players = self.state.sessions.len(),
            "bot added"
        );
        self.emit(EventEnvelope::all(ServerEvent::BotAdded {
            bot_seat: seat,
            current_players: self.state.sessions.len() as u8,
            prize_pool: self.state.prize_pool,
        }));

        // The agent drives itself through the same handle a client would use.
        bot::spawn(self.self_handle(), session_id, opponents);

        if self.state.sessions.len() as u8 == self.state.max_players {
            self.transition_to_ready();
        }
    }

    fn transition_to_ready(&mut self) {
        if let Some(timer) = self.lobby_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.bot_timer.take() {
            timer.cancel();
        }
        self.state.phase = MatchPhase::Ready;
        info!(
            match_id = %self.state.match_id,
            current_players = self.state.sessions.len(),
            prize_pool = self.state.prize_pool,
            "match ready; waiting for clients to load"
        );
        self.emit(EventEnvelope::all(ServerEvent::GameReady {
            current_players: self.state.sessions.len() as u8,
            prize_pool_points: self.state.prize_pool,
        }));
        self.ready_timer = Some(self.enqueue_later(
            Duration::from_secs(self.config.ready_timeout_seconds),
            MatchMessage::ReadyTimeout,
        ));
        // A bot-only barrier (every session born loaded) completes at once.
        self.try_start_match();
    }

    fn on_load_finished(&mut self, session_id: &str) -> Result<(), MatchError> {
        if self.state.phase != MatchPhase::Ready {
            return Err(MatchError::InvalidState(self.state.phase));
        }
        let session = self
            .state
            .sessions
            .get_mut(session_id)
            .expect("presence checked in handle_command");
        session.loaded = true;

        let total = self.connected_count();
        let loaded = self
            .state
            .sessions
            .values()
            .filter(|s| s.connected && s.loaded)
            .count();
        self.emit(EventEnvelope::all(ServerEvent::PlayerLoaded {
            session_id: session_id.to_string(),
            progress: format!("{loaded}/{total}"),
        }));
        self.try_start_match();
        Ok(())
    }

    fn on_ready_timeout(&mut self) {
        if self.state.phase != MatchPhase::Ready {
            return;
        }
        let stragglers = self
            .state
            .sessions
            .values()
            .filter(|s| s.connected && !s.loaded)
            .count();
        warn!(
            match_id = %self.state.match_id,
            stragglers,
            "readiness barrier timed out; force-starting"
        );
        for session in self.state.sessions.values_mut() {
            if session.connected {
                session.loaded = true;
            }
        }
        self.start_match();
    }

    fn try_start_match(&mut self) {
        if self.state.phase != MatchPhase::Ready {
            return;
        }
        let all_loaded = self
            .state
            .sessions
            .values()
            .filter(|s| s.connected)
            .all(|s| s.loaded);
        if all_loaded {
            self.start_match();
        }
    }

    fn start_match(&mut self) {
        if let Some(timer) = self.ready_timer.take() {
            timer.cancel();
        }
        let now = Utc::now();
        self.state.phase = MatchPhase::InProgress;
        self.state.started_at = Some(now);
        self.duration_timer = Some(self.enqueue_later(
            Duration::from_secs(self.config.match_duration_seconds),
            MatchMessage::DurationElapsed,
        ));
        info!(
            match_id = %self.state.match_id,
            current_players = self.state.sessions.len(),
            prize_pool = self.state.prize_pool,
            "match started"
        );
        self.emit(EventEnvelope::all(ServerEvent::GameStarted {
            started_at: now,
            prize_pool_points: self.state.prize_pool,
            free_rolls_per_player: self.config.free_rolls_per_player,
            max_duration_seconds: self.config.match_duration_seconds,
        }));
        self.emit(EventEnvelope::all(ServerEvent::GameTimerStarted {
            duration_seconds: self.config.match_duration_seconds,
        }));
    }

    async fn on_roll(&mut self, session_id: &str) -> Result<(), MatchError> {
        if self.state.phase != MatchPhase::InProgress {
            return Err(MatchError::InvalidState(self.state.phase));
        }
        let now = Utc::now();
        let (user_id, cheat, effect) = {
            let session = self
                .state
                .sessions
                .get_mut(session_id)
                .expect("presence checked in handle_command");
            if !session.connected {
                return Err(MatchError::InvalidTarget(
                    "session is no longer connected".to_string(),
                ));
            }
            if session.free_rolls_remaining == 0 {
                return Err(MatchError::InsufficientResource("no free rolls remaining"));
            }
            // The override is spent by this roll attempt whatever happens next.
            let cheat = session.pending_cheat.take();
            let effect = items::current_effect(session, now);
            (session.user_id.clone(), cheat, effect)
        };

        let (min, max) = board::die_bounds(cheat);
        let die_value = self.die.roll(min, max);

        // Persist through the ledger before touching match state, so a
        // rejected roll leaves nothing to roll back and nothing broadcast.
        let balance = self.apply_roll_ledger(&user_id, die_value).await?;

        let session = self
            .state
            .sessions
            .get(session_id)
            .expect("presence checked above");
        let mut outcome = board::resolve_roll(&session.board, die_value, &self.state.road_blocks);
        outcome.effect = effect;
        if let Some(position) = outcome.road_block_hit {
            self.state.road_blocks.retain(|block| block.position != position);
        }

        let session = self
            .state
            .sessions
            .get_mut(session_id)
            .expect("presence checked above");
        session.board.previous_position = outcome.previous_position;
        session.board.position = outcome.new_position;
        session.board.last_roll = Some(die_value);
        session.board.last_outcome = Some(outcome.clone());
        session.free_rolls_remaining -= 1;
        session.free_rolls_used += 1;
        session.points_earned_this_match += outcome.points_won;
        let board_snapshot = session.board.clone();
        let free_rolls_remaining = session.free_rolls_remaining;
        let points_earned_this_match = session.points_earned_this_match;

        let awarded = self.maybe_award_item(session_id);
        let rank = self.rank_of(session_id);

        self.emit(EventEnvelope::all(ServerEvent::RollResult {
            session_id: session_id.to_string(),
            roll_value: die_value,
            board: board_snapshot,
            balance,
            free_rolls_remaining,
            points_earned_this_match,
            rank,
        }));
        if let Some(stopped_at) = outcome.road_block_hit {
            self.emit(EventEnvelope::to_session(
                session_id,
                ServerEvent::RoadBlockHit {
                    session_id: session_id.to_string(),
                    stopped_at,
                },
            ));
        }
        if let Some(item) = awarded {
            self.emit(EventEnvelope::to_session(
                session_id,
                ServerEvent::ItemAwarded {
                    session_id: session_id.to_string(),
                    item,
                },
            ));
        }

        if self.all_connected_rolls_exhausted() {
            self.finish(GameEndReason::RollsExhausted).await;
        }
        Ok(())
    }

    fn on_use_item(&mut self, session_id: &str, request: ItemRequest) -> Result<(), MatchError> {
        let events = items::apply_item(
            self.state.phase,
            &mut self.state.sessions,
            &mut self.state.road_blocks,
            session_id,
            request,
            Utc::now(),
            self.config.effect_duration_seconds,
        )?;
        for envelope in events {
            self.emit(envelope);
        }
        Ok(())
    }

    async fn on_change_avatar(
        &mut self,
        session_id: &str,
        avatar_code: &str,
    ) -> Result<(), MatchError> {
        if self.state.phase != MatchPhase::Waiting {
            return Err(MatchError::InvalidState(self.state.phase));
        }
        let user_id = self
            .state
            .sessions
            .get(session_id)
            .expect("presence checked in handle_command")
            .user_id
            .clone();
        let metadata = self
            .collaborators
            .avatars
            .resolve_avatar(&user_id, avatar_code)
            .await?;
        let session = self
            .state
            .sessions
            .get_mut(session_id)
            .expect("presence checked above");
        session.avatar_code = Some(metadata.avatar_code.clone());
        self.emit(EventEnvelope::all(ServerEvent::AvatarChanged {
            session_id: session_id.to_string(),
            avatar_code: metadata.avatar_code,
        }));
        Ok(())
    }

    fn on_request_waiting_timer(&mut self, session_id: &str) -> Result<(), MatchError> {
        if self.state.phase != MatchPhase::Waiting {
            return Err(MatchError::InvalidState(self.state.phase));
        }
        let remaining = self
            .lobby_timer
            .as_ref()
            .map(|timer| timer.remaining().as_secs())
            .unwrap_or(0);
        self.emit(EventEnvelope::to_session(
            session_id,
            ServerEvent::WaitingTimerStarted {
                duration_seconds: remaining,
                current_players: self.state.sessions.len() as u8,
            },
        ));
        Ok(())
    }

    fn on_request_game_timer(&mut self, session_id: &str) -> Result<(), MatchError> {
        if self.state.phase != MatchPhase::InProgress {
            return Err(MatchError::InvalidState(self.state.phase));
        }
        let remaining = self
            .duration_timer
            .as_ref()
            .map(|timer| timer.remaining().as_secs())
            .unwrap_or(0);
        self.emit(EventEnvelope::to_session(
            session_id,
            ServerEvent::GameTimerStarted {
                duration_seconds: remaining,
            },
        ));
        Ok(())
    }

    async fn on_duration_elapsed(&mut self) {
        if self.state.phase != MatchPhase::InProgress {
            return;
        }
        self.duration_timer = None;
        self.finish(GameEndReason::DurationElapsed).await;
    }

    async fn finish(&mut self, reason: GameEndReason) {
        if self.state.phase == MatchPhase::Finished {
            return;
        }
        if let Some(timer) = self.duration_timer.take() {
            timer.cancel();
        }
        let now = Utc::now();
        self.state.phase = MatchPhase::Finished;
        self.state.finished_at = Some(now);
        self.state.road_blocks.clear();

        let winner = self
            .state
            .sessions
            .values()
            .max_by_key(|s| (s.points_earned_this_match, Reverse(s.seat)))
            .expect("a match always holds at least one session");
        let winner_user_id = winner.user_id.clone();
        let winner_seat = winner.seat;
        let winner_points = winner.points_earned_this_match;

        let mut final_reason = reason;
        let mut prize_pool_awarded = self.state.prize_pool;
        if let Err(error) = self.award_prize(&winner_user_id).await {
            warn!(
                match_id = %self.state.match_id,
                winner = %winner_user_id,
                error = %error,
                "prize award failed after retry"
            );
            final_reason = GameEndReason::PrizeAwardFailed;
            prize_pool_awarded = 0;
            self.emit(EventEnvelope::all(ServerEvent::Error {
                message: format!("prize award failed: {error}"),
            }));
        }

        for session in self.state.sessions.values_mut() {
            session.connected = false;
            session.active_item = None;
            session.active_effect = None;
            session.pending_cheat = None;
        }

        let mut results: Vec<PlayerResult> = self
            .state
            .sessions
            .values()
            .map(|s| PlayerResult {
                session_id: s.session_id.clone(),
                user_id: s.user_id.clone(),
                seat: s.seat,
                is_bot: s.is_bot,
                points_earned: s.points_earned_this_match,
                free_rolls_used: s.free_rolls_used,
                winner: s.seat == winner_seat,
            })
            .collect();
        results.sort_by_key(|r| (Reverse(r.points_earned), r.seat));

        let duration_seconds = self
            .state
            .started_at
            .zip(self.state.finished_at)
            .map(|(started, finished)| (finished - started).num_seconds().max(0) as u64)
            .unwrap_or(0);

        info!(
            match_id = %self.state.match_id,
            reason = ?final_reason,
            winner = %winner_user_id,
            winner_points,
            prize_pool_awarded,
            duration_seconds,
            "match finished"
        );
        self.emit(EventEnvelope::all(ServerEvent::GameEnded {
            reason: final_reason,
            results,
            winner: WinnerSummary {
                user_id: winner_user_id,
                seat: winner_seat,
                points_earned: winner_points,
                prize_pool_awarded,
            },
            duration_seconds,
        }));

        self.shutdown_timer = Some(self.enqueue_later(
            Duration::from_secs(self.config.disconnect_grace_seconds),
            MatchMessage::Shutdown,
        ));
    }

    async fn apply_roll_ledger(
        &self,
        user_id: &UserId,
        die_value: u8,
    ) -> Result<u64, MatchError> {
        match self
            .collaborators
            .roll_ledger
            .apply_roll(user_id, die_value)
            .await
        {
            Ok(balance) => Ok(balance.balance),
            Err(MatchError::Collaborator(first)) => {
                warn!(
                    match_id = %self.state.match_id,
                    user_id = %user_id,
                    error = %first,
                    "roll ledger failed; retrying once"
                );
                self.collaborators
                    .roll_ledger
                    .apply_roll(user_id, die_value)
                    .await
                    .map(|b| b.balance)
            }
            Err(error) => Err(error),
        }
    }

    async fn award_prize(&self, winner_user_id: &UserId) -> Result<(), MatchError> {
        let amount = self.state.prize_pool;
        match self
            .collaborators
            .prize_ledger
            .award_prize(&self.state.match_id, winner_user_id, amount)
            .await
        {
            Ok(()) => Ok(()),
            Err(MatchError::Collaborator(first)) => {
                warn!(
                    match_id = %self.state.match_id,
                    error = %first,
                    "prize award failed; retrying once"
                );
                self.collaborators
                    .prize_ledger
                    .award_prize(&self.state.match_id, winner_user_id, amount)
                    .await
            }
            Err(error) => Err(error),
        }
    }

    fn maybe_award_item(&mut self, session_id: &str) -> Option<ActiveItem> {
        let probability = self.config.item_award_probability;
        let session = self
            .state
            .sessions
            .get_mut(session_id)
            .expect("presence checked by caller");
        // At most one held item per session.
        if session.active_item.is_some() {
            return None;
        }
        let mut rng = rand::rng();
        if !rng.random_bool(probability) {
            return None;
        }
        let item = ActiveItem::random(&mut rng);
        session.active_item = Some(item.clone());
        Some(item)
    }

    /// Ordering by points, descending, computed on demand for roll payloads
    /// and never persisted.
    fn rank_of(&self, session_id: &str) -> u8 {
        let points = self.state.sessions[session_id].points_earned_this_match;
        let ahead = self
            .state
            .sessions
            .values()
            .filter(|s| s.points_earned_this_match > points)
            .count();
        ahead as u8 + 1
    }

    fn all_connected_rolls_exhausted(&self) -> bool {
        self.state
            .sessions
            .values()
            .filter(|s| s.connected)
            .all(|s| s.free_rolls_remaining == 0)
    }

    fn human_count(&self) -> u8 {
        self.state.sessions.values().filter(|s| !s.is_bot).count() as u8
    }

    fn has_bot(&self) -> bool {
        self.state.sessions.values().any(|s| s.is_bot)
    }

    fn connected_count(&self) -> usize {
        self.state.sessions.values().filter(|s| s.connected).count()
    }

    fn self_handle(&self) -> MatchHandle {
        MatchHandle {
            match_id: self.state.match_id.clone(),
            tx: self.self_tx.clone(),
            events: self.events.clone(),
        }
    }

    fn emit(&self, envelope: EventEnvelope) {
        // Nobody listening is fine; the lobby may be bots only.
        let _ = self.events.send(envelope);
    }

    fn enqueue_later(&self, delay: Duration, message: MatchMessage) -> Countdown {
        let tx = self.self_tx.clone();
        Countdown::schedule(delay, move || {
            tokio::spawn(async move {
                let _ = tx.send(message).await;
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        LedgerBalance, LocalCollaborator, PrizeLedger, RollLedger, SessionValidator,
    };
    use async_trait::async_trait;
    use rollrush_common::{CheatRange, EventTarget, FREE_ROLLS_PER_PLAYER, ItemCode};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::advance;

    /// Die that replays a scripted sequence and records the requested bounds.
    struct ScriptedDie {
        values: Mutex<Vec<u8>>,
        bounds_seen: Mutex<Vec<(u8, u8)>>,
    }

    impl ScriptedDie {
        fn new(values: &[u8]) -> Arc<Self> {
            let mut reversed = values.to_vec();
            reversed.reverse();
            Arc::new(Self {
                values: Mutex::new(reversed),
                bounds_seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl DieRoller for ScriptedDie {
        fn roll(&self, min: u8, max: u8) -> u8 {
            self.bounds_seen.lock().unwrap().push((min, max));
            self.values.lock().unwrap().pop().unwrap_or(min)
        }
    }

    struct FailingPrizeLedger {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PrizeLedger for FailingPrizeLedger {
        async fn award_prize(
            &self,
            _match_id: &MatchId,
            _winner_id: &UserId,
            _amount: u64,
        ) -> Result<(), MatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(MatchError::Collaborator("ledger unreachable".to_string()))
        }
    }

    struct FailingRollLedger;

    #[async_trait]
    impl RollLedger for FailingRollLedger {
        async fn apply_roll(
            &self,
            _player_id: &UserId,
            _die_value: u8,
        ) -> Result<LedgerBalance, MatchError> {
            Err(MatchError::Collaborator("ledger unreachable".to_string()))
        }
    }

    struct RejectingValidator;

    #[async_trait]
    impl SessionValidator for RejectingValidator {
        async fn validate_session(
            &self,
            _token: &str,
        ) -> Result<crate::collaborators::Identity, MatchError> {
            Err(MatchError::Auth("token expired".to_string()))
        }
    }

    fn test_config() -> MatchConfig {
        MatchConfig {
            // Deterministic tests switch item awards off.
            item_award_probability: 0.0,
            ..MatchConfig::default()
        }
    }

    fn actor_with(
        config: MatchConfig,
        collaborators: Collaborators,
        die: Arc<dyn DieRoller>,
    ) -> (MatchActor, broadcast::Receiver<EventEnvelope>) {
        let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
        let (actor, handle) = MatchActor::new(config, collaborators, die, closed_tx);
        let events = handle.subscribe();
        (actor, events)
    }

    fn actor(config: MatchConfig) -> (MatchActor, broadcast::Receiver<EventEnvelope>) {
        actor_with(config, Collaborators::local(), ScriptedDie::new(&[]))
    }

    fn drain(rx: &mut broadcast::Receiver<EventEnvelope>) -> Vec<EventEnvelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    async fn join(actor: &mut MatchActor, token: &str) -> JoinAck {
        actor.handle_join(token).await.unwrap()
    }

    async fn join_n(actor: &mut MatchActor, count: usize) -> Vec<JoinAck> {
        let mut acks = Vec::new();
        for i in 0..count {
            acks.push(join(actor, &format!("user-{i}")).await);
        }
        acks
    }

    async fn start_two_player_match(
        config: MatchConfig,
        die: Arc<dyn DieRoller>,
    ) -> (MatchActor, broadcast::Receiver<EventEnvelope>, Vec<SessionId>) {
        let (mut actor, mut rx) = actor_with(config, Collaborators::local(), die);
        let acks = join_n(&mut actor, 2).await;
        let ids: Vec<SessionId> = acks.iter().map(|a| a.session_id.clone()).collect();
        actor.transition_to_ready();
        actor.on_load_finished(&ids[0]).unwrap();
        actor.on_load_finished(&ids[1]).unwrap();
        assert_eq!(actor.state.phase, MatchPhase::InProgress);
        drain(&mut rx);
        (actor, rx, ids)
    }

    #[tokio::test(start_paused = true)]
    async fn seats_are_unique_and_sequential() {
        let (mut actor, _rx) = actor(test_config());
        let acks = join_n(&mut actor, 4).await;
        let seats: Vec<Seat> = acks.iter().map(|a| a.seat).collect();
        assert_eq!(seats, vec![1, 2, 3, 4]);
        assert_eq!(actor.state.prize_pool, 4 * actor.state.entry_cost);
    }

    #[tokio::test(start_paused = true)]
    async fn a_disconnected_seat_is_never_reassigned() {
        let (mut actor, _rx) = actor(test_config());
        let acks = join_n(&mut actor, 2).await;
        actor.on_disconnect(&acks[0].session_id).await;

        let parted = &actor.state.sessions[&acks[0].session_id];
        assert!(!parted.connected);
        assert_eq!(parted.seat, 1);

        let late = join(&mut actor, "late").await;
        assert_eq!(late.seat, 3, "seat 1 must stay reserved");
        assert_eq!(actor.state.sessions.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_join_fills_the_match_and_readies_immediately() {
        let (mut actor, mut rx) = actor(test_config());
        join_n(&mut actor, 4).await;

        assert_eq!(actor.state.phase, MatchPhase::Ready);
        let events = drain(&mut rx);
        let ready = events
            .iter()
            .find_map(|e| match &e.event {
                ServerEvent::GameReady {
                    current_players, ..
                } => Some(*current_players),
                _ => None,
            })
            .expect("game_ready must fire on instant fill");
        assert_eq!(ready, 4);
        // Only the very first join starts a waiting timer.
        let waiting_count = events
            .iter()
            .filter(|e| matches!(e.event, ServerEvent::WaitingTimerStarted { .. }))
            .count();
        assert_eq!(waiting_count, 1);
        assert!(actor.lobby_timer.is_none());
        assert!(actor.bot_timer.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn joins_are_rejected_outside_waiting_and_when_full() {
        let (mut actor, _rx) = actor(test_config());
        join_n(&mut actor, 4).await;
        let err = actor.handle_join("late").await.unwrap_err();
        assert!(matches!(err, MatchError::InvalidState(MatchPhase::Ready)));

        let (mut actor, _rx) = self::actor(MatchConfig {
            max_players: 2,
            ..test_config()
        });
        // Two seats, but stop the instant fill by joining only one.
        join(&mut actor, "solo").await;
        actor.state.phase = MatchPhase::Waiting;
        actor.state.max_players = 1;
        let err = actor.handle_join("overflow").await.unwrap_err();
        assert!(matches!(err, MatchError::InsufficientResource(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_rejects_the_join_before_any_session_exists() {
        let mut collaborators = Collaborators::local();
        collaborators.sessions = Arc::new(RejectingValidator);
        let (mut actor, _rx) = actor_with(test_config(), collaborators, ScriptedDie::new(&[]));

        let err = actor.handle_join("whatever").await.unwrap_err();
        assert!(matches!(err, MatchError::Auth(_)));
        assert!(actor.state.sessions.is_empty());
        assert_eq!(actor.state.prize_pool, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lone_human_is_backed_up_by_a_bot_then_lobby_expiry_readies() {
        let (mut actor, mut rx) = actor(test_config());
        join(&mut actor, "solo").await;
        assert!(actor.bot_timer.is_some());
        drain(&mut rx);

        actor.on_bot_join_due();
        assert_eq!(actor.state.sessions.len(), 2);
        assert!(actor.has_bot());
        let events = drain(&mut rx);
        let bot_added = events
            .iter()
            .find_map(|e| match &e.event {
                ServerEvent::BotAdded {
                    bot_seat,
                    current_players,
                    ..
                } => Some((*bot_seat, *current_players)),
                _ => None,
            })
            .expect("bot_added must fire");
        assert_eq!(bot_added, (2, 2));

        actor.on_lobby_elapsed();
        assert_eq!(actor.state.phase, MatchPhase::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn second_human_before_the_lead_time_prevents_the_bot() {
        let (mut actor, mut rx) = actor(test_config());
        join(&mut actor, "first").await;
        assert!(actor.bot_timer.is_some());
        join(&mut actor, "second").await;
        assert!(actor.bot_timer.is_none(), "bot schedule must be cancelled");

        // Even if a stale due message raced the cancel, no bot is added.
        actor.on_bot_join_due();
        assert!(!actor.has_bot());
        assert!(
            !drain(&mut rx)
                .iter()
                .any(|e| matches!(e.event, ServerEvent::BotAdded { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn short_lobby_restarts_the_countdown_instead_of_ending() {
        let (mut actor, mut rx) = actor(test_config());
        join(&mut actor, "solo").await;
        // Simulate the bot having been prevented, leaving one player at expiry.
        if let Some(timer) = actor.bot_timer.take() {
            timer.cancel();
        }
        drain(&mut rx);

        actor.on_lobby_elapsed();
        assert_eq!(actor.state.phase, MatchPhase::Waiting);
        assert!(actor.lobby_timer.is_some(), "countdown must restart");
        assert!(actor.bot_timer.is_some(), "bot must be rescheduled");
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e.event, ServerEvent::WaitingTimerStarted { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_barrier_tracks_progress_and_starts_when_complete() {
        let (mut actor, mut rx) = actor(test_config());
        let acks = join_n(&mut actor, 3).await;
        actor.transition_to_ready();
        drain(&mut rx);

        actor.on_load_finished(&acks[0].session_id).unwrap();
        assert_eq!(actor.state.phase, MatchPhase::Ready);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            &e.event,
            ServerEvent::PlayerLoaded { progress, .. } if progress == "1/3"
        )));

        actor.on_load_finished(&acks[1].session_id).unwrap();
        actor.on_load_finished(&acks[2].session_id).unwrap();
        assert_eq!(actor.state.phase, MatchPhase::InProgress);
        assert!(actor.state.started_at.is_some());
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e.event, ServerEvent::GameStarted { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e.event, ServerEvent::GameTimerStarted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_loader_is_overridden_by_the_ready_timeout() {
        let (mut actor, mut rx) = actor(test_config());
        let acks = join_n(&mut actor, 2).await;
        actor.transition_to_ready();
        actor.on_load_finished(&acks[0].session_id).unwrap();
        assert_eq!(actor.state.phase, MatchPhase::Ready);
        drain(&mut rx);

        actor.on_ready_timeout();
        assert_eq!(actor.state.phase, MatchPhase::InProgress);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e.event, ServerEvent::GameStarted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn a_straggler_disconnect_completes_the_readiness_barrier() {
        let (mut actor, mut rx) = actor(test_config());
        let acks = join_n(&mut actor, 2).await;
        actor.transition_to_ready();
        actor.on_load_finished(&acks[0].session_id).unwrap();
        assert_eq!(actor.state.phase, MatchPhase::Ready);
        drain(&mut rx);

        actor
            .handle(MatchMessage::Disconnect {
                session_id: acks[1].session_id.clone(),
            })
            .await;
        assert_eq!(actor.state.phase, MatchPhase::InProgress);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e.event, ServerEvent::GameStarted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn load_signal_is_invalid_outside_ready() {
        let (mut actor, _rx) = actor(test_config());
        let ack = join(&mut actor, "early").await;
        let err = actor
            .handle_command(&ack.session_id, ClientCommand::GameLoadFinished)
            .await
            .unwrap_err();
        assert!(matches!(err, MatchError::InvalidState(MatchPhase::Waiting)));
    }

    #[tokio::test(start_paused = true)]
    async fn roll_moves_scores_and_decrements_free_rolls() {
        let die = ScriptedDie::new(&[2, 3]);
        let (mut actor, mut rx, ids) = start_two_player_match(test_config(), die).await;

        actor.on_roll(&ids[0]).await.unwrap();
        let session = &actor.state.sessions[&ids[0]];
        assert_eq!(session.board.position, 2);
        assert_eq!(session.points_earned_this_match, 20);
        assert_eq!(session.free_rolls_remaining, FREE_ROLLS_PER_PLAYER - 1);
        assert_eq!(session.free_rolls_used, 1);

        let events = drain(&mut rx);
        let (value, rank) = events
            .iter()
            .find_map(|e| match &e.event {
                ServerEvent::RollResult {
                    roll_value, rank, ..
                } => Some((*roll_value, *rank)),
                _ => None,
            })
            .expect("roll_result must fire");
        assert_eq!(value, 2);
        assert_eq!(rank, 1);

        // Second roll keeps points monotonically non-decreasing.
        let before = actor.state.sessions[&ids[0]].points_earned_this_match;
        actor.on_roll(&ids[0]).await.unwrap();
        assert!(actor.state.sessions[&ids[0]].points_earned_this_match >= before);
    }

    #[tokio::test(start_paused = true)]
    async fn roll_is_rejected_before_the_match_starts() {
        let (mut actor, mut rx) = actor(test_config());
        let ack = join(&mut actor, "eager").await;
        drain(&mut rx);

        let err = actor
            .handle_command(&ack.session_id, ClientCommand::Roll)
            .await
            .unwrap_err();
        assert!(matches!(err, MatchError::InvalidState(MatchPhase::Waiting)));
    }

    #[tokio::test(start_paused = true)]
    async fn roll_without_free_rolls_is_rejected() {
        let die = ScriptedDie::new(&[1]);
        let (mut actor, _rx, ids) = start_two_player_match(test_config(), die).await;
        actor
            .state
            .sessions
            .get_mut(&ids[0])
            .unwrap()
            .free_rolls_remaining = 0;

        let err = actor.on_roll(&ids[0]).await.unwrap_err();
        assert!(matches!(err, MatchError::InsufficientResource(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn crossing_a_road_block_stops_the_roller_and_consumes_the_block() {
        let die = ScriptedDie::new(&[5]);
        let (mut actor, mut rx, ids) = start_two_player_match(test_config(), die.clone()).await;
        actor.state.sessions.get_mut(&ids[0]).unwrap().board.position = 9;
        actor.state.road_blocks.push(RoadBlock {
            position: 12,
            placed_by_seat: 2,
        });

        actor.on_roll(&ids[0]).await.unwrap();

        let session = &actor.state.sessions[&ids[0]];
        assert_eq!(session.board.position, 12);
        assert!(actor.state.road_blocks.is_empty(), "block must be removed");

        let events = drain(&mut rx);
        let hit = events
            .iter()
            .find(|e| matches!(e.event, ServerEvent::RoadBlockHit { stopped_at: 12, .. }))
            .expect("road_block_hit must fire");
        assert_eq!(hit.target, EventTarget::Session(ids[0].clone()));
        // Exactly one hit per roll.
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e.event, ServerEvent::RoadBlockHit { .. }))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn armed_cheat_narrows_exactly_the_next_roll() {
        let die = ScriptedDie::new(&[2, 4]);
        let (mut actor, _rx, ids) = start_two_player_match(test_config(), die.clone()).await;
        actor.state.sessions.get_mut(&ids[0]).unwrap().active_item = Some(ActiveItem {
            code: ItemCode::CheatingRoll,
            cheat_range: Some(CheatRange::Low),
        });

        actor
            .on_use_item(
                &ids[0],
                ItemRequest {
                    item_code: ItemCode::CheatingRoll,
                    target_session: None,
                    target_position: None,
                    cheat_range: None,
                },
            )
            .unwrap();
        assert_eq!(
            actor.state.sessions[&ids[0]].pending_cheat,
            Some(CheatRange::Low)
        );

        actor.on_roll(&ids[0]).await.unwrap();
        assert_eq!(actor.state.sessions[&ids[0]].pending_cheat, None);

        actor.on_roll(&ids[0]).await.unwrap();
        let bounds = die.bounds_seen.lock().unwrap().clone();
        assert_eq!(bounds, vec![(1, 3), (1, 6)]);
    }

    #[tokio::test(start_paused = true)]
    async fn cheat_is_spent_even_when_the_ledger_rejects_the_roll() {
        let mut collaborators = Collaborators::local();
        collaborators.roll_ledger = Arc::new(FailingRollLedger);
        let (mut actor, mut rx) =
            actor_with(test_config(), collaborators, ScriptedDie::new(&[3]));
        let acks = join_n(&mut actor, 2).await;
        let ids: Vec<SessionId> = acks.iter().map(|a| a.session_id.clone()).collect();
        actor.transition_to_ready();
        actor.on_load_finished(&ids[0]).unwrap();
        actor.on_load_finished(&ids[1]).unwrap();
        drain(&mut rx);

        actor.state.sessions.get_mut(&ids[0]).unwrap().pending_cheat = Some(CheatRange::High);
        let before = actor.state.sessions[&ids[0]].clone();

        let err = actor.on_roll(&ids[0]).await.unwrap_err();
        assert!(matches!(err, MatchError::Collaborator(_)));

        let after = &actor.state.sessions[&ids[0]];
        assert_eq!(after.pending_cheat, None, "override cleared regardless");
        // No other mutation leaked, and no roll_result was broadcast.
        assert_eq!(after.free_rolls_remaining, before.free_rolls_remaining);
        assert_eq!(after.board.position, before.board.position);
        assert!(
            !drain(&mut rx)
                .iter()
                .any(|e| matches!(e.event, ServerEvent::RollResult { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_effect_vanishes_at_the_next_roll() {
        let die = ScriptedDie::new(&[1, 1]);
        let (mut actor, _rx, ids) = start_two_player_match(test_config(), die).await;
        let now = Utc::now();
        actor.state.sessions.get_mut(&ids[0]).unwrap().active_effect = Some(
            rollrush_common::ActiveEffect::new(rollrush_common::EffectKind::Slow, now, 30),
        );

        actor.on_roll(&ids[0]).await.unwrap();
        let outcome = actor.state.sessions[&ids[0]]
            .board
            .last_outcome
            .clone()
            .unwrap();
        assert!(outcome.effect.is_some(), "effect still running");

        // Backdate the effect past its deadline; no timer is involved.
        actor
            .state
            .sessions
            .get_mut(&ids[0])
            .unwrap()
            .active_effect
            .as_mut()
            .unwrap()
            .expires_at = now - chrono::Duration::seconds(1);

        actor.on_roll(&ids[0]).await.unwrap();
        let outcome = actor.state.sessions[&ids[0]]
            .board
            .last_outcome
            .clone()
            .unwrap();
        assert!(outcome.effect.is_none(), "expired effect must be gone");
        assert!(actor.state.sessions[&ids[0]].active_effect.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn item_awards_respect_the_single_slot() {
        let die = ScriptedDie::new(&[1, 1, 1]);
        let config = MatchConfig {
            item_award_probability: 1.0,
            ..MatchConfig::default()
        };
        let (mut actor, mut rx, ids) = start_two_player_match(config, die).await;

        actor.on_roll(&ids[0]).await.unwrap();
        assert!(actor.state.sessions[&ids[0]].active_item.is_some());
        let events = drain(&mut rx);
        let awarded = events
            .iter()
            .find(|e| matches!(e.event, ServerEvent::ItemAwarded { .. }))
            .expect("item_awarded must fire at probability 1");
        assert_eq!(awarded.target, EventTarget::Session(ids[0].clone()));

        // Holding an item blocks another award.
        let held = actor.state.sessions[&ids[0]].active_item.clone();
        actor.on_roll(&ids[0]).await.unwrap();
        assert_eq!(actor.state.sessions[&ids[0]].active_item, held);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_every_free_roll_finishes_the_match() {
        let die = ScriptedDie::new(&[1, 1]);
        let (mut actor, mut rx, ids) = start_two_player_match(test_config(), die).await;
        for id in &ids {
            actor.state.sessions.get_mut(id).unwrap().free_rolls_remaining = 1;
        }

        actor.on_roll(&ids[0]).await.unwrap();
        assert_eq!(actor.state.phase, MatchPhase::InProgress);
        actor.on_roll(&ids[1]).await.unwrap();
        assert_eq!(actor.state.phase, MatchPhase::Finished);

        let events = drain(&mut rx);
        let reason = events
            .iter()
            .find_map(|e| match &e.event {
                ServerEvent::GameEnded { reason, .. } => Some(*reason),
                _ => None,
            })
            .expect("game_ended must fire");
        assert_eq!(reason, GameEndReason::RollsExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn a_disconnected_session_cannot_roll() {
        let die = ScriptedDie::new(&[2]);
        let (mut actor, _rx, ids) = start_two_player_match(test_config(), die).await;
        actor.on_disconnect(&ids[0]).await;
        assert_eq!(actor.state.phase, MatchPhase::InProgress);

        let err = actor.on_roll(&ids[0]).await.unwrap_err();
        assert!(matches!(err, MatchError::InvalidTarget(_)));
        assert_eq!(
            actor.state.sessions[&ids[0]].free_rolls_remaining,
            FREE_ROLLS_PER_PLAYER
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_leaves_the_rolls_exhausted_check_to_the_connected() {
        let die = ScriptedDie::new(&[1]);
        let (mut actor, mut rx, ids) = start_two_player_match(test_config(), die).await;
        actor.state.sessions.get_mut(&ids[0]).unwrap().free_rolls_remaining = 1;
        actor
            .state
            .sessions
            .get_mut(&ids[1])
            .unwrap()
            .points_earned_this_match = 2500;

        actor.on_roll(&ids[0]).await.unwrap();
        // The connected opponent still holds rolls, so the match runs on.
        assert_eq!(actor.state.phase, MatchPhase::InProgress);

        actor.on_disconnect(&ids[1]).await;
        // Every session still counted has run dry.
        assert_eq!(actor.state.phase, MatchPhase::Finished);

        let events = drain(&mut rx);
        let (reason, results) = events
            .iter()
            .find_map(|e| match &e.event {
                ServerEvent::GameEnded {
                    reason, results, ..
                } => Some((*reason, results.clone())),
                _ => None,
            })
            .expect("game_ended must fire");
        assert_eq!(reason, GameEndReason::RollsExhausted);
        // The disconnected player keeps their seat, score and result line.
        assert_eq!(results.len(), 2);
        let parted = results.iter().find(|r| r.session_id == ids[1]).unwrap();
        assert_eq!(parted.seat, 2);
        assert_eq!(parted.points_earned, 2500);
        assert!(parted.winner);
    }

    #[tokio::test(start_paused = true)]
    async fn duration_expiry_crowns_the_current_points_leader() {
        let die = ScriptedDie::new(&[]);
        let (mut actor, mut rx, ids) = start_two_player_match(test_config(), die).await;
        actor
            .state
            .sessions
            .get_mut(&ids[0])
            .unwrap()
            .points_earned_this_match = 30;
        actor
            .state
            .sessions
            .get_mut(&ids[1])
            .unwrap()
            .points_earned_this_match = 50;

        actor.on_duration_elapsed().await;
        assert_eq!(actor.state.phase, MatchPhase::Finished);

        let events = drain(&mut rx);
        let (winner, results) = events
            .iter()
            .find_map(|e| match &e.event {
                ServerEvent::GameEnded {
                    winner, results, ..
                } => Some((winner.clone(), results.clone())),
                _ => None,
            })
            .expect("game_ended must fire");
        assert_eq!(winner.points_earned, 50);
        assert_eq!(winner.seat, 2);
        assert_eq!(winner.prize_pool_awarded, actor.state.prize_pool);
        assert_eq!(results.len(), 2);
        assert!(results[0].winner);
        assert_eq!(results[0].points_earned, 50);
        // Every session is inactive and stripped of volatile state.
        assert!(actor.state.sessions.values().all(|s| !s.connected));
        assert!(actor.state.sessions.values().all(|s| s.active_item.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn tied_points_resolve_to_the_lowest_seat() {
        let die = ScriptedDie::new(&[]);
        let (mut actor, mut rx, ids) = start_two_player_match(test_config(), die).await;
        for id in &ids {
            actor
                .state
                .sessions
                .get_mut(id)
                .unwrap()
                .points_earned_this_match = 40;
        }

        actor.on_duration_elapsed().await;
        let winner = drain(&mut rx)
            .iter()
            .find_map(|e| match &e.event {
                ServerEvent::GameEnded { winner, .. } => Some(winner.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(winner.seat, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn prize_award_failure_is_retried_once_and_never_silent() {
        let failing = Arc::new(FailingPrizeLedger {
            calls: AtomicUsize::new(0),
        });
        let mut collaborators = Collaborators::local();
        collaborators.prize_ledger = failing.clone();
        let (mut actor, mut rx) =
            actor_with(test_config(), collaborators, ScriptedDie::new(&[]));
        let acks = join_n(&mut actor, 2).await;
        actor.transition_to_ready();
        actor.on_ready_timeout();
        drain(&mut rx);

        actor.on_duration_elapsed().await;
        assert_eq!(failing.calls.load(Ordering::SeqCst), 2, "one retry only");

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e.event, ServerEvent::Error { .. })));
        let (reason, winner) = events
            .iter()
            .find_map(|e| match &e.event {
                ServerEvent::GameEnded { reason, winner, .. } => {
                    Some((*reason, winner.clone()))
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(reason, GameEndReason::PrizeAwardFailed);
        assert_eq!(winner.prize_pool_awarded, 0);
        drop(acks);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_match_rejects_every_further_command() {
        let die = ScriptedDie::new(&[]);
        let (mut actor, mut rx, ids) = start_two_player_match(test_config(), die).await;
        actor.on_duration_elapsed().await;
        drain(&mut rx);

        for command in [
            ClientCommand::Roll,
            ClientCommand::RequestGameTimer,
            ClientCommand::GameLoadFinished,
        ] {
            let err = actor.handle_command(&ids[0], command).await.unwrap_err();
            assert!(matches!(
                err,
                MatchError::InvalidState(MatchPhase::Finished)
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timer_requests_resend_the_remaining_time() {
        let (mut actor, mut rx) = actor(test_config());
        let ack = join(&mut actor, "watcher").await;
        drain(&mut rx);

        advance(Duration::from_secs(10)).await;
        actor.on_request_waiting_timer(&ack.session_id).unwrap();
        let events = drain(&mut rx);
        let envelope = events
            .iter()
            .find(|e| matches!(e.event, ServerEvent::WaitingTimerStarted { .. }))
            .unwrap();
        assert_eq!(envelope.target, EventTarget::Session(ack.session_id.clone()));
        let ServerEvent::WaitingTimerStarted {
            duration_seconds, ..
        } = envelope.event
        else {
            unreachable!()
        };
        assert_eq!(duration_seconds, LOBBY_REMAINING_AFTER_TEN);

        // Game timer requests are invalid while waiting.
        let err = actor.on_request_game_timer(&ack.session_id).unwrap_err();
        assert!(matches!(err, MatchError::InvalidState(MatchPhase::Waiting)));
    }

    const LOBBY_REMAINING_AFTER_TEN: u64 = rollrush_common::LOBBY_COUNTDOWN_SECONDS - 10;

    #[tokio::test(start_paused = true)]
    async fn avatar_changes_are_waiting_phase_only() {
        let (mut actor, mut rx) = actor(test_config());
        let ack = join(&mut actor, "dresser").await;
        drain(&mut rx);

        actor
            .on_change_avatar(&ack.session_id, "hat-owl")
            .await
            .unwrap();
        assert_eq!(
            actor.state.sessions[&ack.session_id].avatar_code.as_deref(),
            Some("hat-owl")
        );
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e.event, ServerEvent::AvatarChanged { .. })));

        actor.transition_to_ready();
        let err = actor
            .on_change_avatar(&ack.session_id, "hat-fox")
            .await
            .unwrap_err();
        assert!(matches!(err, MatchError::InvalidState(MatchPhase::Ready)));
    }

    #[tokio::test(start_paused = true)]
    async fn effect_expired_reports_are_accepted_and_ignored() {
        let die = ScriptedDie::new(&[]);
        let (mut actor, mut rx, ids) = start_two_player_match(test_config(), die).await;
        let now = Utc::now();
        actor.state.sessions.get_mut(&ids[0]).unwrap().active_effect = Some(
            rollrush_common::ActiveEffect::new(rollrush_common::EffectKind::Fast, now, 30),
        );

        actor
            .handle_command(&ids[0], ClientCommand::EffectExpired)
            .await
            .unwrap();
        // The server-side effect is untouched.
        assert!(actor.state.sessions[&ids[0]].active_effect.is_some());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_commands_surface_as_targeted_error_events() {
        let (mut actor, handle) = {
            let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
            MatchActor::new(
                test_config(),
                Collaborators::local(),
                ScriptedDie::new(&[]),
                closed_tx,
            )
        };
        let ack = join(&mut actor, "human").await;
        let mut rx = handle.subscribe();

        actor
            .handle(MatchMessage::Command {
                session_id: ack.session_id.clone(),
                command: ClientCommand::Roll,
                reply: None,
            })
            .await;

        let events = drain(&mut rx);
        let error = events
            .iter()
            .find(|e| matches!(e.event, ServerEvent::Error { .. }))
            .expect("error event must fire");
        assert_eq!(error.target, EventTarget::Session(ack.session_id));
    }

    /// Full lifecycle through the spawned actor: a lone human joins, the bot
    /// fills in, and the match runs to completion on virtual time.
    #[tokio::test(start_paused = true)]
    async fn end_to_end_solo_human_versus_bot() {
        let local = Arc::new(LocalCollaborator::default());
        let collaborators = Collaborators {
            sessions: local.clone(),
            roll_ledger: local.clone(),
            prize_ledger: local.clone(),
            avatars: local.clone(),
        };
        let config = MatchConfig::default();
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let handle = MatchActor::spawn(config, collaborators, closed_tx);

        let mut ack = handle.join("human-1").await.unwrap();
        let session_id = ack.session_id.clone();

        let mut started = false;
        let mut ended = None;
        while ended.is_none() {
            let envelope = ack.events.recv().await.expect("event stream must stay live");
            match envelope.event {
                ServerEvent::GameReady { current_players, .. } => {
                    assert_eq!(current_players, 2, "bot must have filled in");
                    handle
                        .command(&session_id, ClientCommand::GameLoadFinished)
                        .await
                        .unwrap();
                }
                ServerEvent::GameStarted { .. } => started = true,
                ServerEvent::RollResult {
                    session_id: roller, ..
                } if roller == session_id => {
                    // Keep rolling until the allowance runs out.
                    let _ = handle.command(&session_id, ClientCommand::Roll).await;
                }
                ServerEvent::GameEnded { reason, results, winner, .. } => {
                    ended = Some((reason, results, winner));
                }
                _ => {}
            }
            if started && ended.is_none() {
                // Nudge our own first roll; later ones chain off roll_result.
                let _ = handle.command(&session_id, ClientCommand::Roll).await;
                started = false;
            }
        }

        let (_reason, results, winner) = ended.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().any(|r| r.is_bot));
        let awarded = local.awarded.lock().unwrap();
        assert_eq!(awarded.len(), 1);
        assert_eq!(awarded[0].1, winner.user_id);
        assert_eq!(awarded[0].2, 2 * rollrush_common::ENTRY_COST_POINTS);
        drop(awarded);

        // The match deregisters itself after the disconnect grace delay.
        let closed_id = closed_rx.recv().await.expect("closed notice must arrive");
        assert_eq!(closed_id, handle.match_id());
        tokio::task::yield_now().await;
        assert!(handle.is_closed());
    }
}
