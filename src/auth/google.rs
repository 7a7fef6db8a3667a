use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};
use url::form_urlencoded;

use crate::{
    auth::repo_types::{GoogleProfile, ProfileValue},
    config::GoogleConfig,
};

const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

/// The provider round trip: consent screen URL, then code exchange into a profile.
#[async_trait]
pub trait GoogleOAuth: Send + Sync {
    fn authorize_url(&self, state: &str) -> String;
    async fn exchange(&self, code: &str) -> anyhow::Result<GoogleProfile>;
}

pub struct GoogleClient {
    http: reqwest::Client,
    cfg: GoogleConfig,
}

impl GoogleClient {
    pub fn new(cfg: GoogleConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            cfg,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
    email: Option<String>,
    name: Option<String>,
    picture: Option<String>,
}

impl From<UserInfo> for GoogleProfile {
    fn from(u: UserInfo) -> Self {
        Self {
            id: u.sub,
            emails: u.email.into_iter().map(|value| ProfileValue { value }).collect(),
            display_name: u.name,
            photos: u.picture.into_iter().map(|value| ProfileValue { value }).collect(),
        }
    }
}

#[async_trait]
impl GoogleOAuth for GoogleClient {
    fn authorize_url(&self, state: &str) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("client_id", &self.cfg.client_id)
            .append_pair("redirect_uri", &self.cfg.callback_url)
            .append_pair("response_type", "code")
            .append_pair("scope", "openid profile email")
            .append_pair("state", state)
            .finish();
        format!("{AUTHORIZE_URL}?{query}")
    }

    #[instrument(skip_all)]
    async fn exchange(&self, code: &str) -> anyhow::Result<GoogleProfile> {
        let token: TokenResponse = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("code", code),
                ("client_id", self.cfg.client_id.as_str()),
                ("client_secret", self.cfg.client_secret.as_str()),
                ("redirect_uri", self.cfg.callback_url.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await
            .context("google token request")?
            .error_for_status()
            .context("google token response")?
            .json()
            .await
            .context("decode google token response")?;

        let info: UserInfo = self
            .http
            .get(USERINFO_URL)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .context("google userinfo request")?
            .error_for_status()
            .context("google userinfo response")?
            .json()
            .await
            .context("decode google userinfo")?;

        debug!(google_id = %info.sub, "google profile fetched");
        Ok(info.into())
    }
}
