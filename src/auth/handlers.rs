use axum::{
    extract::{FromRef, Query, State},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use rand::{distributions::Alphanumeric, Rng};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        authenticators::{
            Authenticator, GoogleOAuthAuthenticator, LocalPasswordAuthenticator,
            PasswordCredentials, PasswordlessAuthenticator,
        },
        claims::SessionKeys,
        cookies::{self, OAUTH_STATE_COOKIE},
        dto::{
            AuthResponse, ChangePasswordRequest, GoogleCallbackQuery, LoginRequest,
            SignupRequest, SuccessResponse, TokenResponse, VerifyResponse, VerifySessionRequest,
        },
        extractors::{AuthRejection, AuthUser, SessionUser},
        repo_types::{normalize_email, Identity, User},
        resolver::CredentialResolver,
        session::{SessionIssuer, SessionVerifier},
    },
    error::AuthError,
    state::AppState,
};

pub const GOOGLE_FAILURE_PATH: &str = "/api/auth/google/failure";
const OAUTH_STATE_LEN: usize = 32;

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        .route("/auth/google", get(google_start))
        .route("/auth/google/callback", get(google_callback))
        .route("/auth/google/failure", get(google_failure))
        .route("/auth/verify", get(verify))
        .route("/auth/verify-session", post(verify_session))
        .route("/auth/get-token", get(get_token))
        .route("/auth/password", post(change_password))
        .route("/auth/logout", post(logout))
}

/// Mints the session for `user` and attaches it as the HTTP-only cookie.
async fn start_session(
    state: &AppState,
    jar: CookieJar,
    user: &User,
) -> Result<(CookieJar, String), AuthError> {
    let token = SessionIssuer::from_ref(state).create_session(user).await?;
    let ttl = SessionKeys::from_ref(state).ttl;
    let jar = jar.add(cookies::session_cookie(&state.config.cookie, token.clone(), ttl));
    Ok((jar, token))
}

fn clear_session_cookie(state: &AppState, jar: CookieJar) -> CookieJar {
    jar.add(cookies::removal(state.config.cookie.name.clone(), "/"))
}

#[instrument(skip(state, jar, payload), fields(email = %payload.email))]
pub async fn signup(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<SignupRequest>,
) -> Result<(StatusCode, CookieJar, Json<AuthResponse>), AuthError> {
    let local = LocalPasswordAuthenticator::new(state.users.clone());
    let user = local
        .register(PasswordCredentials {
            email: payload.email,
            password: payload.password,
        })
        .await?;

    let (jar, token) = start_session(&state, jar, &user).await?;
    Ok((
        StatusCode::CREATED,
        jar,
        Json(AuthResponse {
            token,
            user: Identity::from(&user),
            redirect: None,
        }),
    ))
}

#[instrument(skip(state, jar, payload), fields(email = %payload.email, passwordless = payload.password.is_none()))]
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<LoginRequest>,
) -> Result<(CookieJar, Json<AuthResponse>), AuthError> {
    let user = match payload.password {
        Some(password) => {
            LocalPasswordAuthenticator::new(state.users.clone())
                .authenticate(PasswordCredentials {
                    email: payload.email,
                    password,
                })
                .await?
        }
        None => {
            PasswordlessAuthenticator::new(state.users.clone(), SessionIssuer::from_ref(&state))
                .authenticate(payload.email)
                .await?
        }
    };

    let (jar, token) = start_session(&state, jar, &user).await?;
    info!(user_id = %user.id, "user logged in");
    Ok((
        jar,
        Json(AuthResponse {
            token,
            user: Identity::from(&user),
            redirect: Some(state.config.dashboard_path.clone()),
        }),
    ))
}

fn random_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(OAUTH_STATE_LEN)
        .map(char::from)
        .collect()
}

#[instrument(skip_all)]
pub async fn google_start(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<(CookieJar, Redirect), AuthError> {
    let google = state.google.as_ref().ok_or(AuthError::ProviderUnavailable)?;
    let oauth_state = random_state();
    let url = google.authorize_url(&oauth_state);
    let jar = jar.add(cookies::oauth_state_cookie(&state.config.cookie, oauth_state));
    Ok((jar, Redirect::to(&url)))
}

async fn complete_google_login(
    state: &AppState,
    jar: &CookieJar,
    query: GoogleCallbackQuery,
) -> Result<User, AuthError> {
    let google = state.google.as_ref().ok_or(AuthError::ProviderUnavailable)?;

    if let Some(error) = query.error {
        warn!(%error, "google returned an error");
        return Err(AuthError::InvalidCredential);
    }
    let expected = jar.get(OAUTH_STATE_COOKIE).map(|c| c.value().to_string());
    match (expected.as_deref(), query.state.as_deref()) {
        (Some(expected), Some(got)) if !expected.is_empty() && expected == got => {}
        _ => {
            warn!("oauth state mismatch");
            return Err(AuthError::InvalidCredential);
        }
    }
    let code = query
        .code
        .filter(|c| !c.is_empty())
        .ok_or(AuthError::InvalidCredential)?;

    let profile = google.exchange(&code).await.map_err(|e| {
        warn!(error = %e, "google code exchange failed");
        AuthError::Unavailable(e)
    })?;
    GoogleOAuthAuthenticator::new(state.users.clone())
        .authenticate(profile)
        .await
}

#[instrument(skip_all)]
pub async fn google_callback(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<GoogleCallbackQuery>,
) -> (CookieJar, Redirect) {
    let outcome = match complete_google_login(&state, &jar, query).await {
        Ok(user) => start_session(&state, jar.clone(), &user)
            .await
            .map(|(jar, token)| (jar, token, user)),
        Err(e) => Err(e),
    };
    let jar_without_state = |jar: CookieJar| {
        jar.add(cookies::removal(OAUTH_STATE_COOKIE.to_string(), "/api/auth/google"))
    };

    match outcome {
        Ok((jar, token, user)) => {
            info!(user_id = %user.id, "google login complete");
            let target = format!("{}#token={}", state.config.dashboard_url(), token);
            (jar_without_state(jar), Redirect::to(&target))
        }
        Err(e) => {
            warn!(reason = e.reason(), error = %e, "google login failed");
            (jar_without_state(jar), Redirect::to(GOOGLE_FAILURE_PATH))
        }
    }
}

pub async fn google_failure() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "google_login_failed",
            "message": "Google authentication failed",
        })),
    )
        .into_response()
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn verify(AuthUser(user): AuthUser) -> Json<VerifyResponse> {
    Json(VerifyResponse {
        is_valid: true,
        user,
    })
}

#[instrument(skip(state, payload), fields(email = %payload.email))]
pub async fn verify_session(
    State(state): State<AppState>,
    Json(payload): Json<VerifySessionRequest>,
) -> Result<Json<VerifyResponse>, AuthRejection> {
    // the token came in the body, so a failure says nothing about the browser's cookie
    let user = SessionVerifier::from_ref(&state)
        .verify(payload.token.trim())
        .await
        .map_err(AuthRejection::new)?;

    if user.email != normalize_email(&payload.email) {
        warn!(user_id = %user.id, "session presented with another account's email");
        return Err(AuthRejection::new(AuthError::InvalidCredential));
    }
    Ok(Json(VerifyResponse {
        is_valid: true,
        user,
    }))
}

/// Hands the cookie-held token to the page so it can be cached client-side.
#[instrument(skip_all)]
pub async fn get_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TokenResponse>, AuthRejection> {
    let resolver = CredentialResolver::new(&state.config.cookie);
    let token = resolver
        .resolve_cookie(&headers)
        .ok_or_else(|| AuthRejection::new(AuthError::MissingCredential))?;
    SessionVerifier::from_ref(&state)
        .verify(&token)
        .await
        .map_err(|e| AuthRejection::clearing(e, resolver.cookie_name().to_string()))?;
    Ok(Json(TokenResponse { token }))
}

#[instrument(skip_all, fields(user_id = %session.user.id))]
pub async fn change_password(
    State(state): State<AppState>,
    session: SessionUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<SuccessResponse>, AuthError> {
    LocalPasswordAuthenticator::new(state.users.clone())
        .change_password(
            session.user,
            &payload.current_password,
            &payload.new_password,
        )
        .await?;
    Ok(Json(SuccessResponse::ok()))
}

/// Always succeeds; the server session is cleared only for a credential that still verifies.
#[instrument(skip_all)]
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    uri: Uri,
) -> (CookieJar, Json<SuccessResponse>) {
    let resolver = CredentialResolver::new(&state.config.cookie);
    if let Some(credential) = resolver.resolve(&headers, uri.query()) {
        match SessionVerifier::from_ref(&state)
            .verify_user(&credential.token)
            .await
        {
            Ok(user) => {
                if let Err(e) = SessionIssuer::from_ref(&state).clear_session(user.id).await {
                    warn!(user_id = %user.id, error = %e, "failed to clear session on logout");
                } else {
                    info!(user_id = %user.id, "user logged out");
                }
            }
            Err(e) => info!(reason = e.reason(), "logout with a stale credential"),
        }
    }
    (clear_session_cookie(&state, jar), Json(SuccessResponse::ok()))
}
