use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use tracing::debug;

use super::{
    cookies,
    repo_types::{Identity, User},
    resolver::{CredentialResolver, ResolvedCredential},
    session::SessionVerifier,
};
use crate::{error::AuthError, state::AppState};

/// Verified caller identity; rejects with 401 and clears the session cookie.
pub struct AuthUser(pub Identity);

/// Verified caller with the full stored record and the credential that was presented.
pub struct SessionUser {
    pub user: User,
    pub credential: ResolvedCredential,
}

/// 401 response that also drops the session cookie when a credential was presented.
#[derive(Debug)]
pub struct AuthRejection {
    error: AuthError,
    clear_cookie: Option<String>,
}

impl AuthRejection {
    pub fn new(error: AuthError) -> Self {
        Self {
            error,
            clear_cookie: None,
        }
    }

    pub fn clearing(error: AuthError, cookie_name: String) -> Self {
        Self {
            error,
            clear_cookie: Some(cookie_name),
        }
    }

    pub fn error(&self) -> &AuthError {
        &self.error
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        match self.clear_cookie {
            Some(name) => {
                let jar = CookieJar::new().add(cookies::removal(name, "/"));
                (jar, self.error).into_response()
            }
            None => self.error.into_response(),
        }
    }
}

async fn authenticate(parts: &Parts, state: &AppState) -> Result<SessionUser, AuthRejection> {
    let resolver = CredentialResolver::new(&state.config.cookie);
    let Some(credential) = resolver.resolve(&parts.headers, parts.uri.query()) else {
        return Err(AuthRejection::new(AuthError::MissingCredential));
    };

    let verifier = SessionVerifier::from_ref(state);
    match verifier.verify_user(&credential.token).await {
        Ok(user) => Ok(SessionUser { user, credential }),
        Err(error) => {
            debug!(source = ?credential.source, reason = error.reason(), "credential rejected");
            Err(AuthRejection::clearing(
                error,
                resolver.cookie_name().to_string(),
            ))
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for SessionUser {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        authenticate(parts, state).await
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let session = authenticate(parts, state).await?;
        Ok(AuthUser(Identity::from(&session.user)))
    }
}
