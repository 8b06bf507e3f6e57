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

//! Runs one match end to end from the command line: a scripted player joins,
//! a bot fills the second seat, and both play until the match settles. Wire
//! `PLATFORM_BASE_URL` to talk to real platform services instead of the
//! in-process stand-ins.

use std::time::Duration;

use anyhow::Result;
use match_service::{MatchConfig, MatchRegistry, collaborators::Collaborators};
use rollrush_common::{ClientCommand, ServerEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = MatchConfig::from_env();
    let collaborators = if std::env::var("PLATFORM_BASE_URL").is_ok() {
        Collaborators::http_from_env()?
    } else {
        Collaborators::local()
    };
    let registry = MatchRegistry::new(config, collaborators);

    let mut ack = registry.join_any("demo-player").await?;
    info!(
        match_id = %ack.match_id,
        session_id = %ack.session_id,
        seat = ack.seat,
        "joined as demo player"
    );
    let handle = registry.get(&ack.match_id).expect("joined match is registered");

    loop {
        let envelope = match ack.events.recv().await {
            Ok(envelope) => envelope,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };
        if !envelope.target.includes(&ack.session_id) {
            continue;
        }
        info!(event = ?envelope.event, "match event");

        match envelope.event {
            ServerEvent::GameReady { .. } => {
                handle
                    .command(&ack.session_id, ClientCommand::GameLoadFinished)
                    .await?;
            }
            ServerEvent::GameStarted { .. } => {
                let _ = handle.command(&ack.session_id, ClientCommand::Roll).await;
            }
            ServerEvent::RollResult {
                session_id,
                roll_value,
                ..
            } if session_id == ack.session_id => {
                tokio::time::sleep(Duration::from_secs(u64::from(roll_value) + 1)).await;
                // Errors here just mean the allowance ran out.
                let _ = handle.command(&ack.session_id, ClientCommand::Roll).await;
            }
            ServerEvent::GameEnded { winner, reason, .. } => {
                info!(
                    winner = %winner.user_id,
                    points = winner.points_earned,
                    prize = winner.prize_pool_awarded,
                    reason = ?reason,
                    "match settled"
                );
                break;
            }
            _ => {}
        }
    }
    Ok(())
}
