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

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const MAX_PLAYERS: u8 = 4;
pub const MIN_PLAYERS_TO_START: u8 = 2;
pub const ENTRY_COST_POINTS: u64 = 100;
pub const FREE_ROLLS_PER_PLAYER: u32 = 10;
pub const LOBBY_COUNTDOWN_SECONDS: u64 = 30;
pub const BOT_LEAD_SECONDS: u64 = 10;
pub const MATCH_DURATION_SECONDS: u64 = 180;
pub const READY_TIMEOUT_SECONDS: u64 = 20;
pub const DISCONNECT_GRACE_SECONDS: u64 = 10;
pub const EFFECT_DURATION_SECONDS: u64 = 30;
pub const ITEM_AWARD_PROBABILITY: f64 = 0.3;

pub const BOARD_SIZE: u8 = 24;
pub const LOL_TILE: u8 = 0;
pub const JACKPOT_TILE: u8 = 18;
pub const JACKPOT_POINTS: u64 = 500;
pub const SLOW_MULTIPLIER: f64 = 0.5;
pub const FAST_MULTIPLIER: f64 = 2.0;

pub type SessionId = String;
pub type UserId = String;
pub type MatchId = String;
pub type Seat = u8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchPhase {
    Waiting,
    Ready,
    InProgress,
    Finished,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemCode {
    RoadBlock,
    Slow,
    Fast,
    BackToLol,
    CheatingRoll,
}

impl ItemCode {
    /// Slow is the only item aimed at another session. Road blocks fall back
    /// to a server-chosen tile and the rest apply to the issuer itself.
    pub fn requires_target_session(self) -> bool {
        matches!(self, ItemCode::Slow)
    }
}

/// The two preconfigured die ranges a cheating roll may arm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheatRange {
    Low,
    High,
}

impl CheatRange {
    pub fn bounds(self) -> (u8, u8) {
        match self {
            CheatRange::Low => (1, 3),
            CheatRange::High => (4, 6),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    Slow,
    Fast,
}

impl EffectKind {
    pub fn multiplier(self) -> f64 {
        match self {
            EffectKind::Slow => SLOW_MULTIPLIER,
            EffectKind::Fast => FAST_MULTIPLIER,
        }
    }
}

/// A timed fast/slow modifier on one session. Expiry is lazy: the effect is
/// only cleared when the next roll for that session is resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveEffect {
    pub kind: EffectKind,
    pub speed_multiplier: f64,
    pub applied_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ActiveEffect {
    pub fn new(kind: EffectKind, now: DateTime<Utc>, duration_seconds: u64) -> Self {
        Self {
            kind,
            speed_multiplier: kind.multiplier(),
            applied_at: now,
            expires_at: now + chrono::Duration::seconds(duration_seconds as i64),
        }
    }

    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// An item a session holds and may use exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveItem {
    pub code: ItemCode,
    /// Pre-selected die range; only meaningful for `cheating_roll`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cheat_range: Option<CheatRange>,
}

impl ActiveItem {
    pub fn new(code: ItemCode) -> Self {
        Self {
            code,
            cheat_range: None,
        }
    }

    /// Uniformly random item, standing in for the external award policy.
    pub fn random(rng: &mut impl Rng) -> Self {
        let code = match rng.random_range(0..5) {
            0 => ItemCode::RoadBlock,
            1 => ItemCode::Slow,
            2 => ItemCode::Fast,
            3 => ItemCode::BackToLol,
            _ => ItemCode::CheatingRoll,
        };
        let cheat_range = (code == ItemCode::CheatingRoll).then(|| {
            if rng.random_bool(0.5) {
                CheatRange::Low
            } else {
                CheatRange::High
            }
        });
        Self { code, cheat_range }
    }
}

/// A shared board obstacle that halts the next traversal crossing it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoadBlock {
    pub position: u8,
    pub placed_by_seat: Seat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileKind {
    /// The "LOL" start tile.
    Lol,
    Points(u64),
    Jackpot,
    /// Auto-travel to the destination tile and collect its payout.
    Travel(u8),
}

/// The shared 24-tile loop every match plays on.
pub fn board_layout() -> [TileKind; BOARD_SIZE as usize] {
    use TileKind::*;
    [
        Lol,        // 0
        Points(10), // 1
        Points(20), // 2
        Points(5),  // 3
        Travel(9),  // 4
        Points(15), // 5
        Points(10), // 6
        Points(25), // 7
        Points(5),  // 8
        Points(30), // 9
        Points(10), // 10
        Points(50), // 11
        Points(5),  // 12
        Points(15), // 13
        Points(10), // 14
        Travel(21), // 15
        Points(20), // 16
        Points(5),  // 17
        Jackpot,    // 18
        Points(10), // 19
        Points(25), // 20
        Points(40), // 21
        Points(5),  // 22
        Points(15), // 23
    ]
}

pub fn tile_at(position: u8) -> TileKind {
    board_layout()[(position % BOARD_SIZE) as usize]
}

/// A player's place on the board plus the outcome of their last roll.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BoardState {
    pub position: u8,
    pub previous_position: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_roll: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<RollOutcome>,
}

/// Ephemeral result of one roll resolution. Merged into the roller's
/// `BoardState` and emitted, never stored anywhere else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollOutcome {
    pub die_value: u8,
    pub previous_position: u8,
    pub new_position: u8,
    pub points_won: u64,
    pub jackpot: bool,
    /// Position of the road block that stopped this traversal, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub road_block_hit: Option<u8>,
    /// Destination of an auto-travel triggered by the landing tile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_traveled: Option<u8>,
    /// The roller's active effect after lazy expiry, if still running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<ActiveEffect>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSession {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub seat: Seat,
    pub connected: bool,
    pub is_bot: bool,
    pub free_rolls_remaining: u32,
    pub free_rolls_used: u32,
    pub points_earned_this_match: u64,
    pub board: BoardState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_item: Option<ActiveItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_effect: Option<ActiveEffect>,
    /// One-shot die-range override armed by `cheating_roll`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_cheat: Option<CheatRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_code: Option<String>,
    /// Only meaningful during the Ready barrier.
    pub loaded: bool,
}

impl PlayerSession {
    pub fn new_human(user_id: UserId, seat: Seat, free_rolls: u32) -> Self {
        Self::new(user_id, seat, free_rolls, false)
    }

    pub fn new_bot(seat: Seat, free_rolls: u32) -> Self {
        let user_id = format!("bot-{}", &Uuid::new_v4().to_string()[..8]);
        // A bot never loads assets, so it is born loaded.
        let mut session = Self::new(user_id, seat, free_rolls, true);
        session.loaded = true;
        session
    }

    fn new(user_id: UserId, seat: Seat, free_rolls: u32, is_bot: bool) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            user_id,
            seat,
            connected: true,
            is_bot,
            free_rolls_remaining: free_rolls,
            free_rolls_used: 0,
            points_earned_this_match: 0,
            board: BoardState::default(),
            active_item: None,
            active_effect: None,
            pending_cheat: None,
            avatar_code: None,
            loaded: false,
        }
    }
}

/// Inbound session → coordinator commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Roll,
    UseItem {
        item_code: ItemCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_session: Option<SessionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_position: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cheat_range: Option<CheatRange>,
    },
    ChangeAvatar {
        avatar_code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
    },
    RequestWaitingTimer,
    RequestGameTimer,
    GameLoadFinished,
    /// Accepted but ignored; expiry is server-computed.
    EffectExpired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameEndReason {
    DurationElapsed,
    RollsExhausted,
    PrizeAwardFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerResult {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub seat: Seat,
    pub is_bot: bool,
    pub points_earned: u64,
    pub free_rolls_used: u32,
    pub winner: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WinnerSummary {
    pub user_id: UserId,
    pub seat: Seat,
    pub points_earned: u64,
    pub prize_pool_awarded: u64,
}

/// Outbound coordinator → session notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    PlayerJoined {
        session_id: SessionId,
        user_id: UserId,
        seat: Seat,
        current_players: u8,
        prize_pool: u64,
    },
    AvatarChanged {
        session_id: SessionId,
        avatar_code: String,
    },
    WaitingTimerStarted {
        duration_seconds: u64,
        current_players: u8,
    },
    BotAdded {
        bot_seat: Seat,
        current_players: u8,
        prize_pool: u64,
    },
    GameReady {
        current_players: u8,
        prize_pool_points: u64,
    },
    PlayerLoaded {
        session_id: SessionId,
        progress: String,
    },
    GameStarted {
        started_at: DateTime<Utc>,
        prize_pool_points: u64,
        free_rolls_per_player: u32,
        max_duration_seconds: u64,
    },
    GameTimerStarted {
        duration_seconds: u64,
    },
    RollResult {
        session_id: SessionId,
        roll_value: u8,
        board: BoardState,
        balance: u64,
        free_rolls_remaining: u32,
        points_earned_this_match: u64,
        /// On-demand ordering by points, never persisted.
        rank: u8,
    },
    ItemAwarded {
        session_id: SessionId,
        item: ActiveItem,
    },
    ItemUsed {
        session_id: SessionId,
        item_code: ItemCode,
        effect: String,
    },
    RoadBlockDeployed {
        position: u8,
        placed_by_seat: Seat,
    },
    RoadBlockHit {
        session_id: SessionId,
        stopped_at: u8,
    },
    PlayerSlowed {
        session_id: SessionId,
        duration_seconds: u64,
        speed_multiplier: f64,
    },
    PlayerFast {
        session_id: SessionId,
        duration_seconds: u64,
        speed_multiplier: f64,
    },
    BackToLol {
        session_id: SessionId,
    },
    GameEnded {
        reason: GameEndReason,
        results: Vec<PlayerResult>,
        winner: WinnerSummary,
        duration_seconds: u64,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTarget {
    All,
    Session(SessionId),
}

impl EventTarget {
    pub fn includes(&self, session_id: &str) -> bool {
        match self {
            EventTarget::All => true,
            EventTarget::Session(id) => id == session_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub target: EventTarget,
    pub event: ServerEvent,
}

impl EventEnvelope {
    pub fn all(event: ServerEvent) -> Self {
        Self {
            target: EventTarget::All,
            event,
        }
    }

    pub fn to_session(session_id: impl Into<SessionId>, event: ServerEvent) -> Self {
        Self {
            target: EventTarget::Session(session_id.into()),
            event,
        }
    }
}

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("command not valid in phase {0:?}")]
    InvalidState(MatchPhase),
    #[error("{0}")]
    InsufficientResource(&'static str),
    #[error("{0}")]
    InvalidTarget(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("collaborator failure: {0}")]
    Collaborator(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_layout_has_expected_shape() {
        let layout = board_layout();
        assert_eq!(layout.len(), BOARD_SIZE as usize);
        assert_eq!(layout[LOL_TILE as usize], TileKind::Lol);
        assert_eq!(layout[JACKPOT_TILE as usize], TileKind::Jackpot);
        assert_eq!(
            layout.iter().filter(|t| matches!(t, TileKind::Lol)).count(),
            1
        );
        assert_eq!(
            layout
                .iter()
                .filter(|t| matches!(t, TileKind::Jackpot))
                .count(),
            1
        );
    }

    #[test]
    fn travel_tiles_point_at_plain_tiles() {
        for (position, tile) in board_layout().iter().enumerate() {
            if let TileKind::Travel(destination) = tile {
                assert!(*destination < BOARD_SIZE, "travel from {position} escapes board");
                assert!(
                    matches!(tile_at(*destination), TileKind::Points(_)),
                    "travel from {position} must land on a plain payout tile"
                );
            }
        }
    }

    #[test]
    fn tile_at_wraps_around_the_loop() {
        assert_eq!(tile_at(BOARD_SIZE), TileKind::Lol);
        assert_eq!(tile_at(BOARD_SIZE + JACKPOT_TILE), TileKind::Jackpot);
    }

    #[test]
    fn cheat_ranges_cover_the_die_without_overlap() {
        let (low_min, low_max) = CheatRange::Low.bounds();
        let (high_min, high_max) = CheatRange::High.bounds();
        assert_eq!((low_min, low_max), (1, 3));
        assert_eq!((high_min, high_max), (4, 6));
        assert_eq!(low_max + 1, high_min);
    }

    #[test]
    fn effect_expiry_is_inclusive_at_the_deadline() {
        let now = Utc::now();
        let effect = ActiveEffect::new(EffectKind::Slow, now, 30);
        assert_eq!(effect.speed_multiplier, SLOW_MULTIPLIER);
        assert!(!effect.expired_at(now));
        assert!(!effect.expired_at(now + chrono::Duration::seconds(29)));
        assert!(effect.expired_at(now + chrono::Duration::seconds(30)));
        assert!(effect.expired_at(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn random_item_only_arms_a_range_for_cheating_roll() {
        let mut rng = rand::rng();
        for _ in 0..200 {
            let item = ActiveItem::random(&mut rng);
            assert_eq!(
                item.cheat_range.is_some(),
                item.code == ItemCode::CheatingRoll
            );
        }
    }

    #[test]
    fn new_bot_session_is_loaded_from_birth() {
        let bot = PlayerSession::new_bot(2, FREE_ROLLS_PER_PLAYER);
        assert!(bot.is_bot);
        assert!(bot.loaded);
        assert!(bot.connected);
        assert_eq!(bot.free_rolls_remaining, FREE_ROLLS_PER_PLAYER);
        assert!(bot.user_id.starts_with("bot-"));

        let human = PlayerSession::new_human("user-1".to_string(), 1, FREE_ROLLS_PER_PLAYER);
        assert!(!human.is_bot);
        assert!(!human.loaded);
    }

    #[test]
    fn server_events_serialize_with_snake_case_type_tags() {
        let event = ServerEvent::RoadBlockHit {
            session_id: "s-1".to_string(),
            stopped_at: 12,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "road_block_hit");
        assert_eq!(value["stopped_at"], 12);

        let event = ServerEvent::GameReady {
            current_players: 4,
            prize_pool_points: 400,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "game_ready");
    }

    #[test]
    fn client_commands_round_trip_through_wire_json() {
        let raw = r#"{"type":"use_item","item_code":"road_block","target_position":12}"#;
        let command: ClientCommand = serde_json::from_str(raw).unwrap();
        assert_eq!(
            command,
            ClientCommand::UseItem {
                item_code: ItemCode::RoadBlock,
                target_session: None,
                target_position: Some(12),
                cheat_range: None,
            }
        );

        let raw = r#"{"type":"roll"}"#;
        assert_eq!(
            serde_json::from_str::<ClientCommand>(raw).unwrap(),
            ClientCommand::Roll
        );
    }

    #[test]
    fn only_slow_demands_a_target_session() {
        assert!(ItemCode::Slow.requires_target_session());
        assert!(!ItemCode::RoadBlock.requires_target_session());
        assert!(!ItemCode::Fast.requires_target_session());
        assert!(!ItemCode::BackToLol.requires_target_session());
        assert!(!ItemCode::CheatingRoll.requires_target_session());
    }
}
