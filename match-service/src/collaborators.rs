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

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rollrush_common::{MatchError, MatchId, UserId};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvatarMetadata {
    pub avatar_code: String,
    #[serde(default)]
    pub asset_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LedgerBalance {
    pub balance: u64,
}

#[async_trait]
pub trait SessionValidator: Send + Sync {
    async fn validate_session(&self, token: &str) -> Result<Identity, MatchError>;
}

#[async_trait]
pub trait RollLedger: Send + Sync {
    /// Persist one die roll for the player and return their wallet balance.
    /// Must be idempotent or safely retryable exactly once.
    async fn apply_roll(&self, player_id: &UserId, die_value: u8)
    -> Result<LedgerBalance, MatchError>;
}

#[async_trait]
pub trait PrizeLedger: Send + Sync {
    async fn award_prize(
        &self,
        match_id: &MatchId,
        winner_id: &UserId,
        amount: u64,
    ) -> Result<(), MatchError>;
}

#[async_trait]
pub trait AvatarCatalog: Send + Sync {
    async fn resolve_avatar(
        &self,
        user_id: &UserId,
        avatar_code: &str,
    ) -> Result<AvatarMetadata, MatchError>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub sessions: Arc<dyn SessionValidator>,
    pub roll_ledger: Arc<dyn RollLedger>,
    pub prize_ledger: Arc<dyn PrizeLedger>,
    pub avatars: Arc<dyn AvatarCatalog>,
}

impl Collaborators {
    /// In-process collaborators for local play and tests: any non-empty token
    /// is accepted, rolls are free, prize awards are recorded and logged.
    pub fn local() -> Self {
        let local = Arc::new(LocalCollaborator::default());
        Self {
            sessions: local.clone(),
            roll_ledger: local.clone(),
            prize_ledger: local.clone(),
            avatars: local,
        }
    }

    pub fn http_from_env() -> anyhow::Result<Self> {
        let http = Arc::new(HttpCollaborator::from_env()?);
        Ok(Self {
            sessions: http.clone(),
            roll_ledger: http.clone(),
            prize_ledger: http.clone(),
            avatars: http,
        })
    }
}

/// HTTP client for the platform services that own identity, the wallet
/// ledger, and the avatar catalog.
pub struct HttpCollaborator {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct ValidateSessionRequest<'a> {
    token: &'a str,
}

#[derive(Debug, Serialize)]
struct ApplyRollRequest<'a> {
    player_id: &'a str,
    die_value: u8,
}

#[derive(Debug, Serialize)]
struct AwardPrizeRequest<'a> {
    match_id: &'a str,
    winner_id: &'a str,
    amount: u64,
}

#[derive(Debug, Serialize)]
struct ResolveAvatarRequest<'a> {
    user_id: &'a str,
    avatar_code: &'a str,
}

impl HttpCollaborator {
    pub fn from_env() -> anyhow::Result<Self> {
        let base_url = std::env::var("PLATFORM_BASE_URL")
            .ok()
            .unwrap_or_else(|| "http://platform-service:8080".to_string());
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        payload: &impl Serialize,
    ) -> Result<T, MatchError> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|error| MatchError::Collaborator(format!("platform unreachable: {error}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(MatchError::Auth("token rejected by platform".to_string()));
        }
        if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::NOT_FOUND {
            return Err(MatchError::InvalidTarget(format!(
                "platform rejected request: {status}"
            )));
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            return Err(MatchError::Collaborator(format!(
                "platform returned {status}: {body}"
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|error| MatchError::Collaborator(format!("invalid platform payload: {error}")))
    }
}

#[async_trait]
impl SessionValidator for HttpCollaborator {
    async fn validate_session(&self, token: &str) -> Result<Identity, MatchError> {
        self.post_json(
            self.endpoint("internal/v1/sessions/validate"),
            &ValidateSessionRequest { token },
        )
        .await
    }
}

#[async_trait]
impl RollLedger for HttpCollaborator {
    async fn apply_roll(
        &self,
        player_id: &UserId,
        die_value: u8,
    ) -> Result<LedgerBalance, MatchError> {
        self.post_json(
            self.endpoint("internal/v1/ledger/rolls"),
            &ApplyRollRequest {
                player_id,
                die_value,
            },
        )
        .await
    }
}

#[async_trait]
impl PrizeLedger for HttpCollaborator {
    async fn award_prize(
        &self,
        match_id: &MatchId,
        winner_id: &UserId,
        amount: u64,
    ) -> Result<(), MatchError> {
        let _: serde_json::Value = self
            .post_json(
                self.endpoint("internal/v1/prizes"),
                &AwardPrizeRequest {
                    match_id,
                    winner_id,
                    amount,
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AvatarCatalog for HttpCollaborator {
    async fn resolve_avatar(
        &self,
        user_id: &UserId,
        avatar_code: &str,
    ) -> Result<AvatarMetadata, MatchError> {
        self.post_json(
            self.endpoint("internal/v1/avatars/resolve"),
            &ResolveAvatarRequest {
                user_id,
                avatar_code,
            },
        )
        .await
    }
}

/// Free-standing collaborator used by the local binary and most tests.
#[derive(Default)]
pub struct LocalCollaborator {
    pub awarded: Mutex<Vec<(MatchId, UserId, u64)>>,
}

#[async_trait]
impl SessionValidator for LocalCollaborator {
    async fn validate_session(&self, token: &str) -> Result<Identity, MatchError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(MatchError::Auth("empty token".to_string()));
        }
        Ok(Identity {
            user_id: token.to_string(),
        })
    }
}

#[async_trait]
impl RollLedger for LocalCollaborator {
    async fn apply_roll(
        &self,
        _player_id: &UserId,
        _die_value: u8,
    ) -> Result<LedgerBalance, MatchError> {
        Ok(LedgerBalance { balance: 1000 })
    }
}

#[async_trait]
impl PrizeLedger for LocalCollaborator {
    async fn award_prize(
        &self,
        match_id: &MatchId,
        winner_id: &UserId,
        amount: u64,
    ) -> Result<(), MatchError> {
        info!(match_id = %match_id, winner_id = %winner_id, amount, "prize awarded locally");
        self.awarded
            .lock()
            .unwrap()
            .push((match_id.clone(), winner_id.clone(), amount));
        Ok(())
    }
}

#[async_trait]
impl AvatarCatalog for LocalCollaborator {
    async fn resolve_avatar(
        &self,
        _user_id: &UserId,
        avatar_code: &str,
    ) -> Result<AvatarMetadata, MatchError> {
        Ok(AvatarMetadata {
            avatar_code: avatar_code.to_string(),
            asset_url: None,
        })
    }
}
