//! Accounts, password hashing and bearer tokens.
//!
//! Passwords are stored as `pbkdf2-sha256${iterations}${salt_hex}${hash_hex}`.
//! Tokens are HS256 JWTs whose `sub` claim is the username.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{format_ts_iso, NewUser, User};

const HASH_SCHEME: &str = "pbkdf2-sha256";
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

pub fn hash_password(password: &str, iterations: u32) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut key);

    format!(
        "{}${}${}${}",
        HASH_SCHEME,
        iterations,
        hex::encode(salt),
        hex::encode(key)
    )
}

/// Check a password against a stored hash. Malformed hashes never verify.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let parts: Vec<&str> = stored.split('$').collect();
    let [scheme, iterations, salt, expected] = parts.as_slice() else {
        return false;
    };
    if *scheme != HASH_SCHEME {
        return false;
    }
    let (Ok(iterations), Ok(salt), Ok(expected)) = (
        iterations.parse::<u32>(),
        hex::decode(salt),
        hex::decode(expected),
    ) else {
        return false;
    };
    if iterations == 0 || expected.len() != KEY_LEN {
        return false;
    }

    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut key);
    bool::from(key[..].ct_eq(&expected[..]))
}

// ============ Tokens ============

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
}

/// Issues and verifies access tokens with a shared HS256 secret.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_minutes: i64,
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl_minutes: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl_minutes,
        }
    }

    pub fn issue(&self, username: &str) -> Result<String> {
        let exp = Utc::now().timestamp() + self.ttl_minutes * 60;
        self.issue_with_exp(username, exp)
    }

    fn issue_with_exp(&self, username: &str, exp: i64) -> Result<String> {
        let claims = Claims {
            sub: username.to_string(),
            exp,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Config(format!("failed to sign token: {}", e)))
    }

    /// Returns the username the token was issued to.
    pub fn verify(&self, token: &str) -> Result<String> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            debug!(error = %e, "token rejected");
            Error::InvalidToken
        })?;
        if data.claims.sub.is_empty() {
            return Err(Error::InvalidToken);
        }
        Ok(data.claims.sub)
    }
}

// ============ Users ============

fn validate_new_user(new_user: &NewUser) -> Result<()> {
    if new_user.username.trim().is_empty() {
        return Err(Error::Validation("username must not be empty".into()));
    }
    if new_user.password.is_empty() {
        return Err(Error::Validation("password must not be empty".into()));
    }
    let email = new_user.email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(Error::Validation(format!("invalid email address: {}", email))),
    }
}

/// Create an account. Duplicate usernames are reported before duplicate emails.
pub async fn register_user(pool: &SqlitePool, new_user: &NewUser, iterations: u32) -> Result<User> {
    validate_new_user(new_user)?;
    let username = new_user.username.trim();
    let email = new_user.email.trim();

    let existing = sqlx::query("SELECT username FROM users WHERE username = ? OR email = ? LIMIT 1")
        .bind(username)
        .bind(email)
        .fetch_optional(pool)
        .await?;

    if let Some(row) = existing {
        let taken: String = row.get("username");
        return Err(if taken == username {
            Error::UsernameTaken
        } else {
            Error::EmailTaken
        });
    }

    let hashed = hash_password(&new_user.password, iterations);
    let now = Utc::now().timestamp_millis();

    let result = sqlx::query(
        r#"
        INSERT INTO users (username, email, full_name, hashed_password, created_at, is_active)
        VALUES (?, ?, ?, ?, ?, 1)
        "#,
    )
    .bind(username)
    .bind(email)
    .bind(&new_user.full_name)
    .bind(&hashed)
    .bind(now)
    .execute(pool)
    .await;

    // A concurrent registration can still hit the UNIQUE constraints.
    let result = match result {
        Ok(r) => r,
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            return Err(if db_err.message().contains("users.username") {
                Error::UsernameTaken
            } else {
                Error::EmailTaken
            });
        }
        Err(e) => return Err(e.into()),
    };

    let id = result.last_insert_rowid();
    info!(user_id = id, username, "user registered");

    Ok(User {
        id,
        username: username.to_string(),
        email: email.to_string(),
        full_name: new_user.full_name.clone(),
        hashed_password: hashed,
        created_at: format_ts_iso(now),
        last_login: None,
        is_active: true,
    })
}

/// Check credentials; on success record the login time.
pub async fn authenticate_user(pool: &SqlitePool, username: &str, password: &str) -> Result<User> {
    let user = find_user_by_username(pool, username)
        .await?
        .ok_or(Error::InvalidCredentials)?;

    if !user.is_active || !verify_password(password, &user.hashed_password) {
        return Err(Error::InvalidCredentials);
    }

    let now = Utc::now().timestamp_millis();
    sqlx::query("UPDATE users SET last_login = ? WHERE id = ?")
        .bind(now)
        .bind(user.id)
        .execute(pool)
        .await?;

    Ok(User {
        last_login: Some(format_ts_iso(now)),
        ..user
    })
}

pub async fn find_user_by_username(pool: &SqlitePool, username: &str) -> Result<Option<User>> {
    let row = sqlx::query(
        r#"
        SELECT id, username, email, full_name, hashed_password, created_at, last_login, is_active
        FROM users WHERE username = ?
        "#,
    )
    .bind(username)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| {
        let created_at: i64 = row.get("created_at");
        let last_login: Option<i64> = row.get("last_login");
        User {
            id: row.get("id"),
            username: row.get("username"),
            email: row.get("email"),
            full_name: row.get("full_name"),
            hashed_password: row.get("hashed_password"),
            created_at: format_ts_iso(created_at),
            last_login: last_login.map(format_ts_iso),
            is_active: row.get("is_active"),
        }
    }))
}

/// Resolve a bearer token to an active user.
pub async fn current_user(pool: &SqlitePool, tokens: &TokenIssuer, token: &str) -> Result<User> {
    let username = tokens.verify(token)?;
    match find_user_by_username(pool, &username).await? {
        Some(user) if user.is_active => Ok(user),
        _ => Err(Error::InvalidToken),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_schema;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use tempfile::TempDir;

    // Low iteration count keeps the tests fast.
    const ITER: u32 = 1_000;

    async fn test_pool() -> (TempDir, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let options = SqliteConnectOptions::new()
            .filename(tmp.path().join("auth.sqlite"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();
        (tmp, pool)
    }

    fn new_user(username: &str, email: &str) -> NewUser {
        NewUser {
            username: username.into(),
            email: email.into(),
            full_name: "Test User".into(),
            password: "correct horse".into(),
        }
    }

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("s3cret", ITER);
        assert!(hash.starts_with("pbkdf2-sha256$1000$"));
        assert!(verify_password("s3cret", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn test_hashes_are_salted() {
        assert_ne!(hash_password("same", ITER), hash_password("same", ITER));
    }

    #[test]
    fn test_malformed_hash_never_verifies() {
        assert!(!verify_password("x", ""));
        assert!(!verify_password("x", "bcrypt$12$abc$def"));
        assert!(!verify_password("x", "pbkdf2-sha256$notanumber$00$00"));
    }

    #[test]
    fn test_tampered_hash_never_verifies() {
        let stored = hash_password("secret", ITER);
        let (prefix, key_hex) = stored.rsplit_once('$').unwrap();
        let mut key = hex::decode(key_hex).unwrap();
        key[0] ^= 0x01;
        let tampered = format!("{}${}", prefix, hex::encode(&key));
        assert!(!verify_password("secret", &tampered));

        let truncated = format!("{}${}", prefix, hex::encode(&key[..KEY_LEN - 1]));
        assert!(!verify_password("secret", &truncated));
    }

    #[test]
    fn test_token_roundtrip() {
        let issuer = TokenIssuer::new("test-secret", 60);
        let token = issuer.issue("alice").unwrap();
        assert_eq!(issuer.verify(&token).unwrap(), "alice");
    }

    #[test]
    fn test_token_wrong_secret_rejected() {
        let token = TokenIssuer::new("secret-a", 60).issue("alice").unwrap();
        let err = TokenIssuer::new("secret-b", 60).verify(&token).unwrap_err();
        assert!(matches!(err, Error::InvalidToken));
    }

    #[test]
    fn test_expired_token_rejected() {
        let issuer = TokenIssuer::new("test-secret", 60);
        let token = issuer
            .issue_with_exp("alice", Utc::now().timestamp() - 10)
            .unwrap();
        assert!(matches!(issuer.verify(&token), Err(Error::InvalidToken)));
    }

    #[test]
    fn test_garbage_token_rejected() {
        let issuer = TokenIssuer::new("test-secret", 60);
        assert!(matches!(issuer.verify("not.a.jwt"), Err(Error::InvalidToken)));
    }

    #[tokio::test]
    async fn test_register_and_authenticate() {
        let (_tmp, pool) = test_pool().await;
        let user = register_user(&pool, &new_user("alice", "alice@example.com"), ITER)
            .await
            .unwrap();
        assert!(user.id > 0);

        let authed = authenticate_user(&pool, "alice", "correct horse").await.unwrap();
        assert_eq!(authed.id, user.id);
        assert!(authed.last_login.is_some());
    }

    #[tokio::test]
    async fn test_wrong_password_fails() {
        let (_tmp, pool) = test_pool().await;
        register_user(&pool, &new_user("alice", "alice@example.com"), ITER)
            .await
            .unwrap();
        let err = authenticate_user(&pool, "alice", "battery staple")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_unknown_user_fails() {
        let (_tmp, pool) = test_pool().await;
        let err = authenticate_user(&pool, "nobody", "x").await.unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_duplicate_username_and_email_distinguished() {
        let (_tmp, pool) = test_pool().await;
        register_user(&pool, &new_user("alice", "alice@example.com"), ITER)
            .await
            .unwrap();

        let err = register_user(&pool, &new_user("alice", "other@example.com"), ITER)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UsernameTaken));

        let err = register_user(&pool, &new_user("bob", "alice@example.com"), ITER)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmailTaken));
    }

    #[tokio::test]
    async fn test_invalid_registration_rejected() {
        let (_tmp, pool) = test_pool().await;
        let err = register_user(&pool, &new_user("", "a@example.com"), ITER)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = register_user(&pool, &new_user("carol", "not-an-email"), ITER)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_current_user_from_token() {
        let (_tmp, pool) = test_pool().await;
        register_user(&pool, &new_user("alice", "alice@example.com"), ITER)
            .await
            .unwrap();
        let issuer = TokenIssuer::new("test-secret", 60);

        let token = issuer.issue("alice").unwrap();
        let user = current_user(&pool, &issuer, &token).await.unwrap();
        assert_eq!(user.username, "alice");

        // Valid signature, but the user no longer exists
        let ghost = issuer.issue("ghost").unwrap();
        assert!(matches!(
            current_user(&pool, &issuer, &ghost).await,
            Err(Error::InvalidToken)
        ));
    }
}
