//! User directory collaborator.
//!
//! The core only needs lookups and password verification; account
//! management lives elsewhere.

use anyhow::{Context, Result, anyhow};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use async_trait::async_trait;
use rand::rngs::OsRng;
use sqlx::{PgPool, Row, postgres::PgRow};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub name: String,
    pub is_active: bool,
    pub is_admin: bool,
    pub permissions: Vec<String>,
}

impl User {
    #[must_use]
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            email: email.into(),
            name: String::new(),
            is_active: true,
            is_admin: false,
            permissions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_active(mut self, active: bool) -> Self {
        self.is_active = active;
        self
    }

    #[must_use]
    pub fn with_admin(mut self, admin: bool) -> Self {
        self.is_admin = admin;
        self
    }

    #[must_use]
    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Look up by username or email.
    async fn find_user(&self, identifier: &str) -> Result<Option<User>>;

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>>;

    /// Returns the user only if the password matches. Active state is not
    /// checked here.
    async fn verify_password(&self, identifier: &str, password: &str) -> Result<Option<User>>;
}

/// Hash a password into a PHC string (Argon2id).
///
/// # Errors
/// Returns an error if hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| anyhow!("failed to hash password"))
}

fn password_matches(password: &str, stored_hash: &str) -> Result<bool> {
    let parsed =
        PasswordHash::new(stored_hash).map_err(|_| anyhow!("invalid stored password hash"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

fn matches_identifier(user: &User, identifier: &str) -> bool {
    let identifier = identifier.trim();
    user.username == identifier || user.email.eq_ignore_ascii_case(identifier)
}

/// In-process directory for tests and local runs.
#[derive(Default)]
pub struct MemoryDirectory {
    users: Mutex<HashMap<Uuid, (User, String)>>,
}

impl std::fmt::Debug for MemoryDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDirectory").finish_non_exhaustive()
    }
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns an error if the password cannot be hashed.
    pub async fn insert(&self, user: User, password: &str) -> Result<User> {
        let hash = hash_password(password)?;
        self.users
            .lock()
            .await
            .insert(user.id, (user.clone(), hash));
        Ok(user)
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn find_user(&self, identifier: &str) -> Result<Option<User>> {
        let users = self.users.lock().await;
        Ok(users
            .values()
            .find(|(user, _)| matches_identifier(user, identifier))
            .map(|(user, _)| user.clone()))
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        Ok(self
            .users
            .lock()
            .await
            .get(&user_id)
            .map(|(user, _)| user.clone()))
    }

    async fn verify_password(&self, identifier: &str, password: &str) -> Result<Option<User>> {
        let found = {
            let users = self.users.lock().await;
            users
                .values()
                .find(|(user, _)| matches_identifier(user, identifier))
                .cloned()
        };
        match found {
            Some((user, hash)) if password_matches(password, &hash)? => Ok(Some(user)),
            _ => Ok(None),
        }
    }
}

/// Directory backed by the `users` table.
#[derive(Clone, Debug)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lookup(&self, identifier: &str) -> Result<Option<(User, String)>> {
        let query = r"
            SELECT id, username, email, name, password_hash, is_active, is_admin, permissions
            FROM users
            WHERE username = $1 OR lower(email) = lower($1)
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(identifier.trim())
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user")?;
        row.map(|row| -> Result<(User, String)> {
            Ok((user_from_row(&row)?, row.try_get("password_hash")?))
        })
        .transpose()
    }
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        is_active: row.try_get("is_active")?,
        is_admin: row.try_get("is_admin")?,
        permissions: row.try_get("permissions")?,
    })
}

#[async_trait]
impl UserDirectory for PgDirectory {
    async fn find_user(&self, identifier: &str) -> Result<Option<User>> {
        Ok(self.lookup(identifier).await?.map(|(user, _)| user))
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        let query = r"
            SELECT id, username, email, name, is_active, is_admin, permissions
            FROM users
            WHERE id = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user by id")?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn verify_password(&self, identifier: &str, password: &str) -> Result<Option<User>> {
        match self.lookup(identifier).await? {
            Some((user, hash)) if password_matches(password, &hash)? => Ok(Some(user)),
            _ => Ok(None),
        }
    }
}
