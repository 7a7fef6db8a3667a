use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    auth::{
        repo::UserStore,
        repo_types::{normalize_email, ActiveSession, GoogleProfile, NewUser, Provider, Role, User},
    },
    error::StoreError,
};

/// In-process user store. Every mutation runs under one write lock, which gives the same
/// per-record atomicity the Postgres statements provide.
#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    /// Overwrites a stored session wholesale, bypassing the issuer. Lets tests fabricate
    /// sessions that have lapsed in the store only.
    #[cfg(test)]
    pub async fn force_session(&self, id: Uuid, session: Option<ActiveSession>) {
        if let Some(u) = self.users.write().await.get_mut(&id) {
            u.session = session;
        }
    }
}

fn ensure_unique(
    users: &HashMap<Uuid, User>,
    id: Uuid,
    email: &str,
    google_id: Option<&str>,
) -> Result<(), StoreError> {
    for other in users.values().filter(|u| u.id != id) {
        if other.email == email {
            return Err(StoreError::DuplicateKey { field: "email" });
        }
        if google_id.is_some() && other.google_id.as_deref() == google_id {
            return Err(StoreError::DuplicateKey { field: "google_id" });
        }
    }
    Ok(())
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let email = normalize_email(email);
        let users = self.users.read().await;
        Ok(users.values().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn insert(&self, new: NewUser) -> Result<User, StoreError> {
        let mut users = self.users.write().await;
        let id = Uuid::new_v4();
        let email = normalize_email(&new.email);
        ensure_unique(&users, id, &email, None)?;
        let user = User {
            id,
            email,
            password_hash: new.password_hash,
            provider: Provider::Local,
            google_id: None,
            name: new.name,
            profile_picture: None,
            session: None,
            role: Role::User,
            verified: false,
            last_login: None,
            created_at: OffsetDateTime::now_utc(),
        };
        users.insert(id, user.clone());
        Ok(user)
    }

    async fn find_or_create_by_google_profile(
        &self,
        profile: &GoogleProfile,
    ) -> Result<User, StoreError> {
        let email = profile
            .primary_email()
            .ok_or_else(|| anyhow::anyhow!("google profile carries no email"))?;
        let now = OffsetDateTime::now_utc();
        let mut users = self.users.write().await;

        let existing = users
            .values()
            .find(|u| u.google_id.as_deref() == Some(profile.id.as_str()))
            .or_else(|| users.values().find(|u| u.email == email))
            .map(|u| u.id);

        if let Some(id) = existing {
            let Some(stored_email) = users.get(&id).map(|u| u.email.clone()) else {
                return Err(StoreError::Backend(anyhow::anyhow!("user {id} vanished")));
            };
            // only google_id is written here; the stored email stays as it is
            ensure_unique(&users, id, &stored_email, Some(&profile.id))?;
            let Some(user) = users.get_mut(&id) else {
                return Err(StoreError::Backend(anyhow::anyhow!("user {id} vanished")));
            };
            user.google_id = Some(profile.id.clone());
            user.name = profile
                .display_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .or_else(|| user.name.clone())
                .or_else(|| Some(profile.display_name_or(&email)));
            user.profile_picture = profile.picture().or_else(|| user.profile_picture.clone());
            user.provider = Provider::Google;
            user.verified = true;
            user.last_login = Some(now);
            return Ok(user.clone());
        }

        let user = User {
            id: Uuid::new_v4(),
            email: email.clone(),
            password_hash: None,
            provider: Provider::Google,
            google_id: Some(profile.id.clone()),
            name: Some(profile.display_name_or(&email)),
            profile_picture: profile.picture(),
            session: None,
            role: Role::User,
            verified: true,
            last_login: Some(now),
            created_at: now,
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn save(&self, user: &User) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        let email = normalize_email(&user.email);
        ensure_unique(&users, user.id, &email, user.google_id.as_deref())?;
        let Some(stored) = users.get_mut(&user.id) else {
            return Ok(());
        };
        // the stored session wins; save never touches it
        let session = stored.session.take();
        *stored = User {
            email,
            session,
            ..user.clone()
        };
        Ok(())
    }

    async fn set_session(
        &self,
        id: Uuid,
        session: &ActiveSession,
        last_login: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("user {id} not found"))?;
        user.session = Some(session.clone());
        user.last_login = Some(last_login);
        Ok(())
    }

    async fn clear_session(&self, id: Uuid) -> Result<(), StoreError> {
        if let Some(user) = self.users.write().await.get_mut(&id) {
            user.session = None;
        }
        Ok(())
    }
}
