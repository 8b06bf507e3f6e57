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

use rand::Rng;
use rollrush_common::{
    BOARD_SIZE, BoardState, CheatRange, JACKPOT_POINTS, RoadBlock, RollOutcome, TileKind, tile_at,
};

/// Die source for roll resolution. A seam so tests can script exact values;
/// production uses [`RandomDie`].
pub trait DieRoller: Send + Sync {
    /// Roll a value in `min..=max`.
    fn roll(&self, min: u8, max: u8) -> u8;
}

pub struct RandomDie;

impl DieRoller for RandomDie {
    fn roll(&self, min: u8, max: u8) -> u8 {
        rand::rng().random_range(min..=max)
    }
}

/// Die bounds for a roll, narrowed by an armed cheating-roll override.
pub fn die_bounds(cheat: Option<CheatRange>) -> (u8, u8) {
    match cheat {
        Some(range) => range.bounds(),
        None => (1, 6),
    }
}

/// Resolve one roll against the shared tile loop.
///
/// Pure over its inputs: the caller removes the triggered road block and
/// merges the outcome into the roller's session. A block triggers when its
/// position lies anywhere in the traversal interval `(previous, previous +
/// die]` in loop order; the first block in path order wins, movement stops on
/// its tile and the landing tile's payout and travel semantics are suppressed
/// for that roll.
pub fn resolve_roll(board: &BoardState, die_value: u8, road_blocks: &[RoadBlock]) -> RollOutcome {
    let previous_position = board.position;

    for step in 1..=die_value {
        let position = (previous_position + step) % BOARD_SIZE;
        if road_blocks.iter().any(|block| block.position == position) {
            return RollOutcome {
                die_value,
                previous_position,
                new_position: position,
                points_won: 0,
                jackpot: false,
                road_block_hit: Some(position),
                auto_traveled: None,
                effect: None,
            };
        }
    }

    let mut new_position = (previous_position + die_value) % BOARD_SIZE;
    let mut auto_traveled = None;
    if let TileKind::Travel(destination) = tile_at(new_position) {
        auto_traveled = Some(destination);
        new_position = destination;
    }

    let (points_won, jackpot) = match tile_at(new_position) {
        TileKind::Lol => (0, false),
        TileKind::Points(points) => (points, false),
        TileKind::Jackpot => (JACKPOT_POINTS, true),
        // Travel destinations are plain payout tiles; a second hop never occurs.
        TileKind::Travel(_) => (0, false),
    };

    RollOutcome {
        die_value,
        previous_position,
        new_position,
        points_won,
        jackpot,
        road_block_hit: None,
        auto_traveled,
        effect: None,
    }
}
