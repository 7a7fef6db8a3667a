use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// How a user proves who they are.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Local,
    Google,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Local => "local",
            Provider::Google => "google",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Provider::Local),
            "google" => Ok(Provider::Google),
            other => anyhow::bail!("unknown provider {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => anyhow::bail!("unknown role {other:?}"),
        }
    }
}

/// The one session credential currently honoured for a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub token: String,
    pub expires_at: OffsetDateTime,
}

impl ActiveSession {
    pub fn is_live(&self, now: OffsetDateTime) -> bool {
        now < self.expires_at
    }
}

/// User record as the rest of the crate sees it.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>, // argon2 PHC string
    pub provider: Provider,
    pub google_id: Option<String>,
    pub name: Option<String>,
    pub profile_picture: Option<String>,
    #[serde(skip_serializing)]
    pub session: Option<ActiveSession>,
    pub role: Role,
    pub verified: bool,
    pub last_login: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl User {
    pub fn has_live_session(&self, now: OffsetDateTime) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_live(now))
    }
}

/// Row shape of the `users` table.
#[derive(Debug, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub email: String,
    pub password_hash: Option<String>,
    pub provider: String,
    pub google_id: Option<String>,
    pub name: Option<String>,
    pub profile_picture: Option<String>,
    pub active_session_token: Option<String>,
    pub session_expiry: Option<OffsetDateTime>,
    pub role: String,
    pub verified: bool,
    pub last_login: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl TryFrom<UserRow> for User {
    type Error = anyhow::Error;

    fn try_from(r: UserRow) -> Result<Self, Self::Error> {
        let session = match (r.active_session_token, r.session_expiry) {
            (Some(token), Some(expires_at)) => Some(ActiveSession { token, expires_at }),
            _ => None,
        };
        Ok(Self {
            id: r.id,
            email: r.email,
            password_hash: r.password_hash,
            provider: r.provider.parse()?,
            google_id: r.google_id,
            name: r.name,
            profile_picture: r.profile_picture,
            session,
            role: r.role.parse()?,
            verified: r.verified,
            last_login: r.last_login,
            created_at: r.created_at,
        })
    }
}

/// Input for creating a local (password or passwordless) user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProfileValue {
    pub value: String,
}

/// Google profile in the normalized shape `{id, emails[], displayName, photos[]}`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GoogleProfile {
    pub id: String,
    #[serde(default)]
    pub emails: Vec<ProfileValue>,
    pub display_name: Option<String>,
    #[serde(default)]
    pub photos: Vec<ProfileValue>,
}

impl GoogleProfile {
    /// First email, trimmed and lowercased.
    pub fn primary_email(&self) -> Option<String> {
        self.emails
            .first()
            .map(|e| e.value.trim().to_lowercase())
            .filter(|e| !e.is_empty())
    }

    /// First photo, upsized from Google's default 50px thumbnail.
    pub fn picture(&self) -> Option<String> {
        self.photos
            .first()
            .map(|p| p.value.replace("sz=50", "sz=300"))
    }

    /// Display name, falling back to the local part of the email.
    pub fn display_name_or(&self, email: &str) -> String {
        match self.display_name.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => email.split('@').next().unwrap_or(email).to_string(),
        }
    }
}

/// Public part of the user returned to clients; never carries secrets.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub profile_picture: Option<String>,
    pub provider: Provider,
    pub verified: bool,
    pub role: Role,
}

impl From<&User> for Identity {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            email: u.email.clone(),
            name: u.name.clone(),
            profile_picture: u.profile_picture.clone(),
            provider: u.provider,
            verified: u.verified,
            role: u.role,
        }
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
