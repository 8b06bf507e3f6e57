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

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use rollrush_common::{
    ActiveEffect, BOARD_SIZE, CheatRange, EffectKind, EventEnvelope, ItemCode, LOL_TILE,
    MatchError, MatchPhase, PlayerSession, RoadBlock, ServerEvent, SessionId,
};

#[derive(Debug, Clone)]
pub struct ItemRequest {
    pub item_code: ItemCode,
    pub target_session: Option<SessionId>,
    pub target_position: Option<u8>,
    pub cheat_range: Option<CheatRange>,
}

/// Validate and apply one `use_item` request.
///
/// On success the issuer's held item is consumed and the derived broadcast
/// events are returned; the caller emits them after the mutation, in order.
pub fn apply_item(
    phase: MatchPhase,
    sessions: &mut HashMap<SessionId, PlayerSession>,
    road_blocks: &mut Vec<RoadBlock>,
    issuer_id: &str,
    request: ItemRequest,
    now: DateTime<Utc>,
    effect_duration_seconds: u64,
) -> Result<Vec<EventEnvelope>, MatchError> {
    if phase != MatchPhase::InProgress {
        return Err(MatchError::InvalidState(phase));
    }

    let issuer = sessions
        .get(issuer_id)
        .ok_or_else(|| MatchError::InvalidTarget(format!("unknown session {issuer_id}")))?;
    if !issuer.connected {
        return Err(MatchError::InvalidTarget(
            "session is no longer connected".to_string(),
        ));
    }
    let issuer_seat = issuer.seat;
    let held = issuer
        .active_item
        .as_ref()
        .filter(|item| item.code == request.item_code)
        .cloned()
        .ok_or(MatchError::InsufficientResource("no matching active item"))?;

    // Resolve targets before consuming the item, so a rejected request leaves
    // the issuer holding it.
    let slow_target = if request.item_code.requires_target_session() {
        let target_id = request
            .target_session
            .clone()
            .ok_or_else(|| MatchError::InvalidTarget("slow requires a target session".into()))?;
        if target_id == issuer_id {
            return Err(MatchError::InvalidTarget(
                "slow cannot target the issuer".into(),
            ));
        }
        let target = sessions.get(&target_id).ok_or_else(|| {
            MatchError::InvalidTarget(format!("unknown target session {target_id}"))
        })?;
        if !target.connected {
            return Err(MatchError::InvalidTarget(
                "target session is no longer connected".into(),
            ));
        }
        Some(target_id)
    } else {
        None
    };

    let block_position = match request.item_code {
        ItemCode::RoadBlock => Some(resolve_block_position(
            request.target_position,
            road_blocks,
        )?),
        _ => None,
    };

    let issuer = sessions
        .get_mut(issuer_id)
        .expect("issuer presence checked above");
    issuer.active_item = None;

    let mut events = Vec::new();
    match request.item_code {
        ItemCode::RoadBlock => {
            let position = block_position.expect("resolved above");
            road_blocks.push(RoadBlock {
                position,
                placed_by_seat: issuer_seat,
            });
            events.push(EventEnvelope::all(ServerEvent::ItemUsed {
                session_id: issuer_id.to_string(),
                item_code: ItemCode::RoadBlock,
                effect: format!("road block deployed at tile {position}"),
            }));
            events.push(EventEnvelope::all(ServerEvent::RoadBlockDeployed {
                position,
                placed_by_seat: issuer_seat,
            }));
        }
        ItemCode::Slow => {
            let target_id = slow_target.expect("resolved above");
            let effect = ActiveEffect::new(EffectKind::Slow, now, effect_duration_seconds);
            let target = sessions
                .get_mut(&target_id)
                .expect("target presence checked above");
            // Overwrites any effect already running on the target.
            target.active_effect = Some(effect.clone());
            events.push(EventEnvelope::all(ServerEvent::ItemUsed {
                session_id: issuer_id.to_string(),
                item_code: ItemCode::Slow,
                effect: format!("slow applied to seat {}", target.seat),
            }));
            events.push(EventEnvelope::all(ServerEvent::PlayerSlowed {
                session_id: target_id,
                duration_seconds: effect_duration_seconds,
                speed_multiplier: effect.speed_multiplier,
            }));
        }
        ItemCode::Fast => {
            let effect = ActiveEffect::new(EffectKind::Fast, now, effect_duration_seconds);
            issuer.active_effect = Some(effect.clone());
            events.push(EventEnvelope::all(ServerEvent::ItemUsed {
                session_id: issuer_id.to_string(),
                item_code: ItemCode::Fast,
                effect: "fast applied".to_string(),
            }));
            events.push(EventEnvelope::all(ServerEvent::PlayerFast {
                session_id: issuer_id.to_string(),
                duration_seconds: effect_duration_seconds,
                speed_multiplier: effect.speed_multiplier,
            }));
        }
        ItemCode::BackToLol => {
            issuer.board.previous_position = issuer.board.position;
            issuer.board.position = LOL_TILE;
            events.push(EventEnvelope::all(ServerEvent::ItemUsed {
                session_id: issuer_id.to_string(),
                item_code: ItemCode::BackToLol,
                effect: "returned to the LOL tile".to_string(),
            }));
            events.push(EventEnvelope::all(ServerEvent::BackToLol {
                session_id: issuer_id.to_string(),
            }));
        }
        ItemCode::CheatingRoll => {
            let range = request
                .cheat_range
                .or(held.cheat_range)
                .unwrap_or(CheatRange::High);
            issuer.pending_cheat = Some(range);
            // Only the issuer learns a cheat is armed.
            events.push(EventEnvelope::to_session(
                issuer_id,
                ServerEvent::ItemUsed {
                    session_id: issuer_id.to_string(),
                    item_code: ItemCode::CheatingRoll,
                    effect: format!("cheating roll armed ({range:?})"),
                },
            ));
        }
    }

    Ok(events)
}

fn resolve_block_position(
    requested: Option<u8>,
    road_blocks: &[RoadBlock],
) -> Result<u8, MatchError> {
    let blocked = |position: u8| road_blocks.iter().any(|block| block.position == position);

    match requested {
        Some(position) => {
            if position >= BOARD_SIZE {
                return Err(MatchError::InvalidTarget(format!(
                    "tile {position} is outside the board"
                )));
            }
            if position == LOL_TILE {
                return Err(MatchError::InvalidTarget(
                    "the LOL tile cannot be blocked".into(),
                ));
            }
            if blocked(position) {
                return Err(MatchError::InvalidTarget(format!(
                    "tile {position} is already blocked"
                )));
            }
            Ok(position)
        }
        None => {
            // Server-chosen placement when the issuer leaves it open.
            let mut rng = rand::rng();
            for _ in 0..64 {
                let position = rng.random_range(1..BOARD_SIZE);
                if !blocked(position) {
                    return Ok(position);
                }
            }
            Err(MatchError::InvalidTarget(
                "no free tile left for a road block".into(),
            ))
        }
    }
}

/// Lazy expiry: drop the session's effect if it has run out, and return the
/// one still in force. Called before every roll resolution for the session;
/// there is no background expiry timer and no expiry notification.
pub fn current_effect(session: &mut PlayerSession, now: DateTime<Utc>) -> Option<ActiveEffect> {
    if let Some(effect) = &session.active_effect
        && effect.expired_at(now)
    {
        session.active_effect = None;
    }
    session.active_effect.clone()
}
