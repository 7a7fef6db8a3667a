use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::repo_types::{normalize_email, ActiveSession, GoogleProfile, NewUser, User, UserRow},
    error::StoreError,
};

/// Attempts made by the Google upsert before giving up on a contended row.
const UPSERT_ATTEMPTS: usize = 3;

/// Durable lookup and mutation of user records.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn insert(&self, new: NewUser) -> Result<User, StoreError>;
    /// Match on `google_id` or email, refresh the profile, or create a verified Google user.
    async fn find_or_create_by_google_profile(
        &self,
        profile: &GoogleProfile,
    ) -> Result<User, StoreError>;
    /// Persists profile, password, role and verification fields. Session fields are left alone.
    async fn save(&self, user: &User) -> Result<(), StoreError>;
    async fn set_session(
        &self,
        id: Uuid,
        session: &ActiveSession,
        last_login: OffsetDateTime,
    ) -> Result<(), StoreError>;
    async fn clear_session(&self, id: Uuid) -> Result<(), StoreError>;
}

const USER_COLUMNS: &str = "id, email, password_hash, provider, google_id, name, profile_picture, \
     active_session_token, session_expiry, role, verified, last_login, created_at";

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn refresh_google_user(
        &self,
        profile: &GoogleProfile,
        email: &str,
    ) -> Result<Option<User>, StoreError> {
        let sql = format!(
            r#"
            UPDATE users SET
                google_id = $1,
                name = COALESCE($3, name, $4),
                profile_picture = COALESCE($5, profile_picture),
                provider = 'google',
                verified = TRUE,
                last_login = now()
            WHERE id = (
                SELECT id FROM users
                WHERE google_id = $1 OR email = $2
                ORDER BY (google_id = $1) DESC NULLS LAST
                LIMIT 1
            )
            RETURNING {USER_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(&profile.id)
            .bind(email)
            .bind(profile.display_name.as_deref().filter(|n| !n.trim().is_empty()))
            .bind(profile.display_name_or(email))
            .bind(profile.picture())
            .fetch_optional(&self.db)
            .await?;
        row.map(User::try_from).transpose().map_err(StoreError::Backend)
    }

    async fn insert_google_user(
        &self,
        profile: &GoogleProfile,
        email: &str,
    ) -> Result<Option<User>, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO users (email, google_id, name, profile_picture, provider, verified, role, last_login)
            VALUES ($1, $2, $3, $4, 'google', TRUE, 'user', now())
            ON CONFLICT DO NOTHING
            RETURNING {USER_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(email)
            .bind(&profile.id)
            .bind(profile.display_name_or(email))
            .bind(profile.picture())
            .fetch_optional(&self.db)
            .await?;
        row.map(User::try_from).transpose().map_err(StoreError::Backend)
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(normalize_email(email))
            .fetch_optional(&self.db)
            .await?;
        row.map(User::try_from).transpose().map_err(StoreError::Backend)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        row.map(User::try_from).transpose().map_err(StoreError::Backend)
    }

    async fn insert(&self, new: NewUser) -> Result<User, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO users (email, password_hash, name, provider, verified, role)
            VALUES ($1, $2, $3, 'local', FALSE, 'user')
            RETURNING {USER_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(normalize_email(&new.email))
            .bind(new.password_hash)
            .bind(new.name)
            .fetch_one(&self.db)
            .await?;
        User::try_from(row).map_err(StoreError::Backend)
    }

    async fn find_or_create_by_google_profile(
        &self,
        profile: &GoogleProfile,
    ) -> Result<User, StoreError> {
        let email = profile
            .primary_email()
            .context("google profile carries no email")?;

        // A concurrent identical callback can win the insert between our two statements;
        // the loser simply goes round again and lands on the update path.
        for attempt in 1..=UPSERT_ATTEMPTS {
            match self.refresh_google_user(profile, &email).await {
                Ok(Some(user)) => return Ok(user),
                Ok(None) => {}
                Err(StoreError::DuplicateKey { field }) => {
                    tracing::debug!(attempt, field, "google upsert raced on update");
                    continue;
                }
                Err(e) => return Err(e),
            }
            match self.insert_google_user(profile, &email).await {
                Ok(Some(user)) => return Ok(user),
                Ok(None) | Err(StoreError::DuplicateKey { .. }) => {
                    tracing::debug!(attempt, google_id = %profile.id, "google upsert raced on insert");
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Backend(anyhow::anyhow!(
            "google upsert did not converge for {}",
            profile.id
        )))
    }

    async fn save(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE users SET
                email = $2, password_hash = $3, provider = $4, google_id = $5,
                name = $6, profile_picture = $7, role = $8, verified = $9, last_login = $10
            WHERE id = $1
            "#,
        )
        .bind(user.id)
        .bind(normalize_email(&user.email))
        .bind(&user.password_hash)
        .bind(user.provider.as_str())
        .bind(&user.google_id)
        .bind(&user.name)
        .bind(&user.profile_picture)
        .bind(user.role.as_str())
        .bind(user.verified)
        .bind(user.last_login)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn set_session(
        &self,
        id: Uuid,
        session: &ActiveSession,
        last_login: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE users
               SET active_session_token = $2, session_expiry = $3, last_login = $4
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&session.token)
        .bind(session.expires_at)
        .bind(last_login)
        .execute(&self.db)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::Backend(anyhow::anyhow!("user {id} not found")));
        }
        Ok(())
    }

    async fn clear_session(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE users
               SET active_session_token = NULL, session_expiry = NULL
             WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::repo_types::{ProfileValue, Provider};

    fn google_profile(id: &str, email: &str) -> GoogleProfile {
        GoogleProfile {
            id: id.into(),
            emails: vec![ProfileValue {
                value: email.into(),
            }],
            display_name: Some("X".into()),
            photos: vec![],
        }
    }

    async fn count_matching_rows(db: &PgPool, google_id: &str, email: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE google_id = $1 OR email = $2")
            .bind(google_id)
            .bind(email)
            .fetch_one(db)
            .await
            .unwrap()
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn concurrent_google_upserts_leave_one_row(pool: PgPool) {
        let store = Arc::new(PgUserStore::new(pool.clone()));
        let profile = google_profile("g1", "x@y.com");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let profile = profile.clone();
                tokio::spawn(async move { store.find_or_create_by_google_profile(&profile).await })
            })
            .collect();
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().unwrap().id);
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(count_matching_rows(&pool, "g1", "x@y.com").await, 1);

        let user = store.find_by_id(ids[0]).await.unwrap().unwrap();
        assert_eq!(user.provider, Provider::Google);
        assert!(user.verified);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn google_login_links_local_account_by_email(pool: PgPool) {
        let store = PgUserStore::new(pool.clone());
        let local = store
            .insert(NewUser {
                email: "X@y.com".into(),
                password_hash: Some("hash".into()),
                name: None,
            })
            .await
            .unwrap();

        let linked = store
            .find_or_create_by_google_profile(&google_profile("g1", "x@y.com"))
            .await
            .unwrap();
        assert_eq!(linked.id, local.id);
        assert_eq!(linked.google_id.as_deref(), Some("g1"));
        assert_eq!(linked.password_hash.as_deref(), Some("hash"));
        assert_eq!(count_matching_rows(&pool, "g1", "x@y.com").await, 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn returning_google_user_matches_on_google_id_first(pool: PgPool) {
        let store = PgUserStore::new(pool);
        let google = store
            .find_or_create_by_google_profile(&google_profile("g1", "old@x.com"))
            .await
            .unwrap();
        let local = store
            .insert(NewUser {
                email: "new@x.com".into(),
                password_hash: None,
                name: None,
            })
            .await
            .unwrap();

        let again = store
            .find_or_create_by_google_profile(&google_profile("g1", "new@x.com"))
            .await
            .unwrap();
        assert_eq!(again.id, google.id);
        assert_eq!(again.email, "old@x.com");
        let untouched = store.find_by_id(local.id).await.unwrap().unwrap();
        assert_eq!(untouched.google_id, None);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn duplicate_email_maps_to_duplicate_key(pool: PgPool) {
        let store = PgUserStore::new(pool);
        let new = NewUser {
            email: "a@b.com".into(),
            password_hash: None,
            name: None,
        };
        store.insert(new.clone()).await.unwrap();
        let err = store.insert(new).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { field: "email" }));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn session_is_set_and_cleared_together(pool: PgPool) {
        let store = PgUserStore::new(pool);
        let user = store
            .insert(NewUser {
                email: "a@b.com".into(),
                password_hash: None,
                name: None,
            })
            .await
            .unwrap();
        let now = OffsetDateTime::now_utc();
        let session = ActiveSession {
            token: "tok".into(),
            expires_at: now + time::Duration::days(7),
        };
        store.set_session(user.id, &session, now).await.unwrap();
        let stored = store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.session.as_ref().map(|s| s.token.as_str()), Some("tok"));
        assert!(stored.last_login.is_some());

        store.clear_session(user.id).await.unwrap();
        store.clear_session(user.id).await.unwrap();
        let stored = store.find_by_id(user.id).await.unwrap().unwrap();
        assert!(stored.session.is_none());

        assert!(store
            .set_session(Uuid::new_v4(), &session, now)
            .await
            .is_err());
    }
}
