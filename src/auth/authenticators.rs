use std::sync::Arc;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::{
    auth::{
        password::{check_password_policy, hash_password, verify_password},
        repo::UserStore,
        repo_types::{normalize_email, GoogleProfile, NewUser, Provider, User},
        session::SessionIssuer,
    },
    error::{AuthError, StoreError},
};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn checked_email(raw: &str) -> Result<String, AuthError> {
    let email = normalize_email(raw);
    if !is_valid_email(&email) {
        warn!(%email, "invalid email");
        return Err(AuthError::Validation("Invalid email format".into()));
    }
    Ok(email)
}

/// One way of proving identity. Each strategy consumes its own kind of credential material and
/// yields the user it belongs to; minting the session is left to the caller.
#[async_trait]
pub trait Authenticator: Send + Sync {
    type Material: Send + 'static;

    async fn authenticate(&self, material: Self::Material) -> Result<User, AuthError>;
}

#[derive(Debug, Clone)]
pub struct PasswordCredentials {
    pub email: String,
    pub password: String,
}

pub struct LocalPasswordAuthenticator {
    store: Arc<dyn UserStore>,
}

impl LocalPasswordAuthenticator {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }

    /// Creates a local account. An address whose owner is currently signed in is reported as
    /// a conflict instead of being treated like any other taken address.
    pub async fn register(&self, creds: PasswordCredentials) -> Result<User, AuthError> {
        let email = checked_email(&creds.email)?;
        check_password_policy(&creds.password).map_err(AuthError::Validation)?;

        if let Some(existing) = self.store.find_by_email(&email).await? {
            if existing.has_live_session(OffsetDateTime::now_utc()) {
                warn!(user_id = %existing.id, "signup for an account with a live session");
                return Err(AuthError::ActiveSessionConflict);
            }
            warn!(%email, "email already registered");
            return Err(AuthError::EmailInUse);
        }

        let hash = hash_password(&creds.password).map_err(AuthError::Unavailable)?;
        let user = self
            .store
            .insert(NewUser {
                email,
                password_hash: Some(hash),
                name: None,
            })
            .await
            .map_err(|e| match e {
                StoreError::DuplicateKey { .. } => AuthError::EmailInUse,
                other => other.into(),
            })?;
        info!(user_id = %user.id, email = %user.email, "user registered");
        Ok(user)
    }

    pub async fn change_password(
        &self,
        mut user: User,
        current: &str,
        new: &str,
    ) -> Result<(), AuthError> {
        let Some(hash) = user.password_hash.as_deref() else {
            return Err(AuthError::Validation(
                "This account has no password to change".into(),
            ));
        };
        if !self.password_matches(current, hash)? {
            warn!(user_id = %user.id, "password change with wrong current password");
            return Err(AuthError::InvalidCredentials);
        }
        check_password_policy(new).map_err(AuthError::Validation)?;
        user.password_hash = Some(hash_password(new).map_err(AuthError::Unavailable)?);
        self.store.save(&user).await?;
        info!(user_id = %user.id, "password changed");
        Ok(())
    }

    fn password_matches(&self, plain: &str, hash: &str) -> Result<bool, AuthError> {
        verify_password(plain, hash).map_err(|e| {
            error!(error = %e, "stored password hash unreadable");
            AuthError::Unavailable(e)
        })
    }
}

#[async_trait]
impl Authenticator for LocalPasswordAuthenticator {
    type Material = PasswordCredentials;

    async fn authenticate(&self, creds: PasswordCredentials) -> Result<User, AuthError> {
        let email = normalize_email(&creds.email);
        let Some(user) = self.store.find_by_email(&email).await? else {
            warn!(%email, "login unknown email");
            return Err(AuthError::InvalidCredentials);
        };
        let Some(hash) = user.password_hash.as_deref() else {
            warn!(user_id = %user.id, "password login for an account without a password");
            return Err(AuthError::InvalidCredentials);
        };
        if !self.password_matches(&creds.password, hash)? {
            warn!(user_id = %user.id, "login invalid password");
            return Err(AuthError::InvalidCredentials);
        }
        Ok(user)
    }
}

/// Sign-in by email address alone. Accounts that have a password, or that belong to Google,
/// must use their own strategy.
pub struct PasswordlessAuthenticator {
    store: Arc<dyn UserStore>,
    issuer: SessionIssuer,
}

impl PasswordlessAuthenticator {
    pub fn new(store: Arc<dyn UserStore>, issuer: SessionIssuer) -> Self {
        Self { store, issuer }
    }
}

#[async_trait]
impl Authenticator for PasswordlessAuthenticator {
    type Material = String;

    async fn authenticate(&self, raw_email: String) -> Result<User, AuthError> {
        let email = checked_email(&raw_email)?;
        let mut user = match self.store.find_by_email(&email).await? {
            Some(user) => user,
            None => {
                let new = NewUser {
                    email: email.clone(),
                    password_hash: None,
                    name: None,
                };
                match self.store.insert(new).await {
                    Ok(user) => {
                        info!(user_id = %user.id, %email, "user created by passwordless login");
                        user
                    }
                    // lost a race with a concurrent first login for the same address
                    Err(StoreError::DuplicateKey { .. }) => self
                        .store
                        .find_by_email(&email)
                        .await?
                        .ok_or(AuthError::EmailInUse)?,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        if user.provider == Provider::Google {
            return Err(AuthError::Validation(
                "This account signs in with Google".into(),
            ));
        }
        if user.password_hash.is_some() {
            return Err(AuthError::Validation(
                "A password is required for this account".into(),
            ));
        }

        // Existing live session: clear it and let the caller reissue rather than conflict.
        if user.has_live_session(OffsetDateTime::now_utc()) {
            info!(user_id = %user.id, "clearing live session before passwordless reissue");
            self.issuer.clear_session(user.id).await?;
            user.session = None;
        }
        Ok(user)
    }
}

pub struct GoogleOAuthAuthenticator {
    store: Arc<dyn UserStore>,
}

impl GoogleOAuthAuthenticator {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Authenticator for GoogleOAuthAuthenticator {
    type Material = GoogleProfile;

    async fn authenticate(&self, profile: GoogleProfile) -> Result<User, AuthError> {
        if profile.primary_email().is_none() {
            error!(google_id = %profile.id, "no email provided by google");
            return Err(AuthError::NoEmailFromProvider);
        }
        let user = self.store.find_or_create_by_google_profile(&profile).await?;
        info!(user_id = %user.id, email = %user.email, "google auth success");
        Ok(user)
    }
}
