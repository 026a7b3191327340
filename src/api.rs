//! HTTP client for the game server.
//!
//! Only the calls the game needs: profile, level sheets, progress submission
//! and the leaderboard. Requests are authenticated with the `token` cookie.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::note::{LevelSheet, Note};

/// `GET /games/levels/{level}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelInfo {
    pub level: u32,
    pub notes: u32,
    pub sheet: Vec<String>,
    pub speed: u32,
}

impl LevelInfo {
    pub fn into_sheet(self) -> LevelSheet {
        if self.notes as usize != self.sheet.len() {
            warn!(
                level = self.level,
                notes = self.notes,
                sheet_len = self.sheet.len(),
                "note count disagrees with sheet length"
            );
        }
        let notes = self.sheet.into_iter().map(Note::new).collect();
        LevelSheet::new(self.level, notes, self.speed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponReward {
    #[serde(alias = "token")]
    pub id: String,
    pub price: i64,
    pub discount_id: String,
}

/// `POST /games/submissions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub current_level: u32,
    pub unlock_level: u32,
    #[serde(default)]
    pub coupons: Vec<CouponReward>,
}

/// `GET /users/me`, also returned by login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub nickname: String,
    pub current_level: u32,
    pub unlock_level: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankEntry {
    pub nickname: String,
    pub level: u32,
    pub rank: u32,
}

/// `GET /games/leaderboards?page=`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankResponse {
    pub rank: Vec<RankEntry>,
    #[serde(default)]
    pub around: Vec<RankEntry>,
    pub me: Option<RankEntry>,
    pub page: u32,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// Source of level sheets.
pub trait LevelProvider: Send + Sync {
    fn level_sheet(&self, level: u32) -> Result<LevelSheet, ApiError>;
}

/// Records a level clear and hands out rewards.
pub trait ProgressGateway: Send + Sync {
    fn submit(&self) -> Result<SubmitResponse, ApiError>;
}

/// Fills in a tempo for sheets that arrive without one.
pub struct DefaultTempo<P> {
    inner: P,
    tempo_bpm: u32,
}

impl<P: LevelProvider> DefaultTempo<P> {
    pub fn new(inner: P, tempo_bpm: u32) -> Self {
        Self { inner, tempo_bpm }
    }
}

impl<P: LevelProvider> LevelProvider for DefaultTempo<P> {
    fn level_sheet(&self, level: u32) -> Result<LevelSheet, ApiError> {
        let mut sheet = self.inner.level_sheet(level)?;
        if sheet.tempo_bpm == 0 {
            debug!(level, tempo = self.tempo_bpm, "sheet has no tempo, using default");
            sheet.tempo_bpm = self.tempo_bpm;
        }
        Ok(sheet)
    }
}

impl<P: LevelProvider + ?Sized> LevelProvider for std::sync::Arc<P> {
    fn level_sheet(&self, level: u32) -> Result<LevelSheet, ApiError> {
        (**self).level_sheet(level)
    }
}

pub struct ApiClient {
    agent: ureq::Agent,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            base_url: base_url.into(),
            token,
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        let mut req = self
            .agent
            .request(method, &self.url(path))
            .set("Content-Type", "application/json");
        if let Some(token) = &self.token {
            req = req.set("Cookie", &format!("token={token}"));
        }
        req
    }

    /// Exchange a login token for a server session and remember it.
    pub fn login(&mut self, token: &str) -> Result<User, ApiError> {
        let req = self
            .request("POST", "/users/session")
            .set("Authorization", &format!("Bearer {token}"));
        let user = send(req)?;
        self.token = Some(token.to_string());
        Ok(user)
    }

    pub fn me(&self) -> Result<User, ApiError> {
        send(self.request("GET", "/users/me"))
    }

    pub fn level(&self, level: u32) -> Result<LevelInfo, ApiError> {
        send(self.request("GET", &format!("/games/levels/{level}")))
    }

    pub fn leaderboard(&self, page: u32) -> Result<RankResponse, ApiError> {
        send(self.request("GET", &format!("/games/leaderboards?page={page}")))
    }
}

impl LevelProvider for ApiClient {
    fn level_sheet(&self, level: u32) -> Result<LevelSheet, ApiError> {
        self.level(level).map(LevelInfo::into_sheet)
    }
}

impl ProgressGateway for ApiClient {
    fn submit(&self) -> Result<SubmitResponse, ApiError> {
        send(self.request("POST", "/games/submissions"))
    }
}

fn send<T: DeserializeOwned>(req: ureq::Request) -> Result<T, ApiError> {
    debug!(method = req.method(), url = req.url(), "api request");
    match req.call() {
        Ok(resp) => resp
            .into_json::<T>()
            .map_err(|e| ApiError::Decode(e.to_string())),
        Err(ureq::Error::Status(status, resp)) => Err(status_error(status, resp)),
        Err(ureq::Error::Transport(transport)) => Err(ApiError::Transport(transport.to_string())),
    }
}

fn status_error(status: u16, resp: ureq::Response) -> ApiError {
    let message = resp
        .into_json::<ErrorBody>()
        .ok()
        .and_then(|body| body.message)
        .unwrap_or_else(|| format!("API error {status}"));
    ApiError::Status { status, message }
}
