use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Failures raised by a `UserStore` implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key on {field}")]
    DuplicateKey { field: &'static str },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            // 23505 = unique_violation
            if db.code().as_deref() == Some("23505") {
                let field = match db.constraint() {
                    Some(c) if c.contains("google") => "google_id",
                    _ => "email",
                };
                return StoreError::DuplicateKey { field };
            }
        }
        StoreError::Backend(anyhow::Error::new(e))
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credential presented")]
    MissingCredential,
    #[error("credential is malformed or has a bad signature")]
    InvalidCredential,
    #[error("credential has expired")]
    CredentialExpired,
    #[error("credential refers to an unknown user")]
    UnknownSubject,
    #[error("session was revoked")]
    SessionRevoked,
    #[error("session has expired")]
    SessionExpired,
    #[error("{0} is already taken")]
    DuplicateKey(&'static str),
    #[error("no email provided by the identity provider")]
    NoEmailFromProvider,
    #[error("an active session already exists for this account")]
    ActiveSessionConflict,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Email already in use")]
    EmailInUse,
    #[error("{0}")]
    Validation(String),
    #[error("sign-in provider is not configured")]
    ProviderUnavailable,
    #[error("service unavailable")]
    Unavailable(#[source] anyhow::Error),
}

impl AuthError {
    /// Machine-readable reason sent to clients in the `error` field.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingCredential => "missing_credential",
            AuthError::InvalidCredential => "invalid_credential",
            AuthError::CredentialExpired => "credential_expired",
            AuthError::UnknownSubject => "unknown_subject",
            AuthError::SessionRevoked => "session_revoked",
            AuthError::SessionExpired => "session_expired",
            AuthError::DuplicateKey(_) => "duplicate_key",
            AuthError::NoEmailFromProvider => "no_email_from_provider",
            AuthError::ActiveSessionConflict => "active_session_conflict",
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::EmailInUse => "email_in_use",
            AuthError::Validation(_) => "validation_failed",
            AuthError::ProviderUnavailable => "provider_unavailable",
            AuthError::Unavailable(_) => "service_unavailable",
        }
    }

    /// True for every failure of the verification path, which callers treat as "not logged in".
    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            AuthError::MissingCredential
                | AuthError::InvalidCredential
                | AuthError::CredentialExpired
                | AuthError::UnknownSubject
                | AuthError::SessionRevoked
                | AuthError::SessionExpired
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            e if e.is_unauthenticated() => StatusCode::UNAUTHORIZED,
            AuthError::DuplicateKey(_) | AuthError::ActiveSessionConflict => StatusCode::CONFLICT,
            AuthError::ProviderUnavailable | AuthError::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateKey { field } => AuthError::DuplicateKey(field),
            StoreError::Backend(inner) => AuthError::Unavailable(inner),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        if let AuthError::Unavailable(inner) = &self {
            error!(error = ?inner, "auth backend failure");
        }
        let body = Json(json!({
            "error": self.reason(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}
