use crate::db::JournalDb;
use crate::models::{InputError, NewUser, User};
use anyhow::{anyhow, Result};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

/// Accounts and bearer sessions.
///
/// Session tokens are random UUIDs handed to the client once; only their
/// SHA-256 digest is stored.
#[derive(Clone)]
pub struct UserStore {
    db: JournalDb,
}

/// A freshly issued session token.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| anyhow!("Password hashing failed: {}", e))
}

pub fn verify_password(password: &str, hashed: &str) -> bool {
    match PasswordHash::new(hashed) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!("Stored password hash is malformed: {}", e);
            false
        }
    }
}

impl UserStore {
    pub fn new(db: JournalDb) -> Self {
        Self { db }
    }

    /// Create an account. Duplicate username or email is an [`InputError`].
    pub async fn register(&self, input: NewUser) -> Result<User> {
        input.validate()?;
        let username = input.username.trim().to_string();
        let email = input.email.trim().to_lowercase();

        let (taken,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM users WHERE username = ? OR email = ?")
                .bind(&username)
                .bind(&email)
                .fetch_one(self.db.pool())
                .await?;
        if taken > 0 {
            return Err(InputError::new("Username or email already registered").into());
        }

        let hashed = hash_password(&input.password)?;
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (username, email, hashed_password, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&username)
        .bind(&email)
        .bind(&hashed)
        .bind(Utc::now())
        .fetch_one(self.db.pool())
        .await?;

        tracing::info!(user_id = user.id, "Registered user {}", user.username);
        Ok(user)
    }

    /// Look up by username or email and check the password.
    pub async fn authenticate(&self, login: &str, password: &str) -> Result<Option<User>> {
        let login = login.trim();
        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE username = ? OR email = ?",
        )
        .bind(login)
        .bind(login.to_lowercase())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(user.filter(|u| verify_password(password, &u.hashed_password)))
    }

    pub async fn get(&self, id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(user)
    }

    pub async fn create_session(&self, user_id: i64, ttl: Duration) -> Result<IssuedSession> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let expires_at = now + ttl;

        sqlx::query(
            "INSERT INTO sessions (token_hash, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(hash_token(&token))
        .bind(user_id)
        .bind(now)
        .bind(expires_at)
        .execute(self.db.pool())
        .await?;

        Ok(IssuedSession { token, expires_at })
    }

    /// Resolve a bearer token to its user. Expired sessions resolve to `None`.
    pub async fn user_for_token(&self, token: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT u.* FROM sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.token_hash = ? AND s.expires_at > ?
            "#,
        )
        .bind(hash_token(token))
        .bind(Utc::now())
        .fetch_optional(self.db.pool())
        .await?;
        Ok(user)
    }

    /// Returns whether a session was removed.
    pub async fn revoke(&self, token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE token_hash = ?")
            .bind(hash_token(token))
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn purge_expired_sessions(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(Utc::now())
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
