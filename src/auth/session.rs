//! Session lifecycle: minting, revoking and verifying the single active session credential.
//!
//! A session token is a signed JWT, so signature and expiry can be checked without touching the
//! store. For local users that is not enough: the token must also be the one currently recorded
//! on the user, which is how a newer login (or a logout) revokes older tokens that have not yet
//! expired. Google users skip that comparison and are trusted on the signature alone.

use std::sync::Arc;

use axum::extract::FromRef;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::{
        claims::SessionKeys,
        repo::UserStore,
        repo_types::{ActiveSession, Identity, Provider, User},
    },
    error::AuthError,
    state::AppState,
};

#[derive(Clone)]
pub struct SessionIssuer {
    store: Arc<dyn UserStore>,
    keys: SessionKeys,
}

impl SessionIssuer {
    pub fn new(store: Arc<dyn UserStore>, keys: SessionKeys) -> Self {
        Self { store, keys }
    }

    /// Mints a token for `user` and records it as the only valid one.
    ///
    /// The token is handed back only after the store confirmed the write, so a client never
    /// holds a credential the verifier would not accept.
    pub async fn create_session(&self, user: &User) -> Result<String, AuthError> {
        let now = OffsetDateTime::now_utc();
        let (token, _claims) = self.keys.sign(user, now).map_err(AuthError::Unavailable)?;
        let session = ActiveSession {
            token: token.clone(),
            expires_at: now + self.keys.ttl,
        };
        if user.session.is_some() {
            debug!(user_id = %user.id, "replacing previous session");
        }
        self.store.set_session(user.id, &session, now).await?;
        info!(user_id = %user.id, provider = %user.provider, "session created");
        Ok(token)
    }

    pub async fn clear_session(&self, user_id: Uuid) -> Result<(), AuthError> {
        self.store.clear_session(user_id).await?;
        info!(%user_id, "session cleared");
        Ok(())
    }
}

impl FromRef<AppState> for SessionIssuer {
    fn from_ref(state: &AppState) -> Self {
        SessionIssuer::new(state.users.clone(), SessionKeys::from_ref(state))
    }
}

#[derive(Clone)]
pub struct SessionVerifier {
    store: Arc<dyn UserStore>,
    keys: SessionKeys,
}

impl SessionVerifier {
    pub fn new(store: Arc<dyn UserStore>, keys: SessionKeys) -> Self {
        Self { store, keys }
    }

    /// Resolves a raw credential to the identity it currently stands for.
    pub async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.verify_user(token).await.map(|u| Identity::from(&u))
    }

    /// Same as [`verify`](Self::verify) but hands back the full record for callers that mutate it.
    pub async fn verify_user(&self, token: &str) -> Result<User, AuthError> {
        let claims = self.keys.verify(token)?;
        let user = self
            .store
            .find_by_id(claims.sub)
            .await?
            .ok_or(AuthError::UnknownSubject)?;

        match user.provider {
            Provider::Google => {}
            Provider::Local => {
                let Some(session) = user.session.as_ref() else {
                    warn!(user_id = %user.id, "no stored session for presented token");
                    return Err(AuthError::SessionRevoked);
                };
                if session.token != token {
                    warn!(user_id = %user.id, "superseded session token presented");
                    return Err(AuthError::SessionRevoked);
                }
                if !session.is_live(OffsetDateTime::now_utc()) {
                    return Err(AuthError::SessionExpired);
                }
            }
        }
        Ok(user)
    }
}

impl FromRef<AppState> for SessionVerifier {
    fn from_ref(state: &AppState) -> Self {
        SessionVerifier::new(state.users.clone(), SessionKeys::from_ref(state))
    }
}
