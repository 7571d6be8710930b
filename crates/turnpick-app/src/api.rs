// REST client for the league service: draft metadata, the club cap, and
// draft scheduling. Plain request/response around the realtime session.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info};

use turnpick_core::channel::Credential;
use turnpick_core::eligibility::SquadConstraint;
use turnpick_core::error::EngineError;
use turnpick_core::league::{DraftInfo, DraftSettings};
use turnpick_core::protocol::SessionId;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("credential was refused by the league service")]
    Unauthorized,

    #[error("league service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl From<ApiError> for EngineError {
    fn from(err: ApiError) -> Self {
        let reauthenticate = matches!(err, ApiError::Unauthorized);
        EngineError::ConfigurationFetch {
            reason: err.to_string(),
            reauthenticate,
        }
    }
}

// ---------------------------------------------------------------------------
// LeagueClient
// ---------------------------------------------------------------------------

pub struct LeagueClient {
    http: reqwest::Client,
    base_url: String,
    credential: Credential,
}

impl LeagueClient {
    pub fn new(base_url: impl Into<String>, credential: Credential) -> Self {
        LeagueClient {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential,
        }
    }

    pub async fn draft_info(&self, session: SessionId) -> Result<DraftInfo, ApiError> {
        self.get_json(&format!("league/draft_info/{session}")).await
    }

    pub async fn max_players_same_club(
        &self,
        session: SessionId,
    ) -> Result<SquadConstraint, ApiError> {
        let cap: i64 = self
            .get_json(&format!("league/max_players_same_club/{session}"))
            .await?;
        if cap < 1 {
            return Err(ApiError::Decode(format!("club cap must be positive, got {cap}")));
        }
        Ok(SquadConstraint::new(cap as usize))
    }

    pub async fn submit_draft_settings(
        &self,
        session: SessionId,
        settings: &DraftSettings,
    ) -> Result<(), ApiError> {
        let url = self.url(&format!("league/submit_draft_settings/{session}"));
        let response = self
            .http
            .post(&url)
            .header("Authorization", self.credential.bearer())
            .json(settings)
            .send()
            .await?;
        check_status(response).await?;
        info!(
            "Submitted draft settings for session {session}: start {}, {}s per turn",
            settings.draft_start_time, settings.turn_duration_secs
        );
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.url(path);
        debug!("GET {url}");
        let response = self
            .http
            .get(&url)
            .header("Authorization", self.credential.bearer())
            .send()
            .await?;
        let text = check_status(response).await?.text().await?;
        serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ApiError::Unauthorized);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}
