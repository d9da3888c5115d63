//! Authentication: users, argon2 password verifiers, cookie sessions.
//!
//! Tokens handed to clients are opaque; only their SHA-256 digest is
//! persisted. Guest sessions carry a generated guest id instead of a user.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use regex::Regex;
use rusqlite::OptionalExtension;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::db::{utc_now, Database};
use crate::types::{Result, RuntimeError};

fn username_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{2,31}$").expect("valid regex"))
}

pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

pub fn validate_username(username: &str) -> Result<()> {
    if username_regex().is_match(username) {
        Ok(())
    } else {
        Err(RuntimeError::invalid(
            "username",
            "must match ^[A-Za-z0-9][A-Za-z0-9_.-]{2,31}$",
        ))
    }
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.len() < 8 {
        return Err(RuntimeError::invalid("password", "too short (min 8)"));
    }
    if password.len() > 256 {
        return Err(RuntimeError::invalid("password", "too long"));
    }
    Ok(())
}

/// Hash a password into a PHC string (argon2id with per-hash salt).
pub fn hash_password(password: &str) -> Result<String> {
    validate_password(password)?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| RuntimeError::Internal(format!("password hashing failed: {e}")))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, encoded: &str) -> bool {
    match PasswordHash::new(encoded) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// The authenticated caller: a registered user or an anonymous guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    User { user_id: String, username: String },
    Guest { guest_id: String },
}

impl Actor {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Actor::User { user_id, .. } => Some(user_id),
            Actor::Guest { .. } => None,
        }
    }

    pub fn guest_id(&self) -> Option<&str> {
        match self {
            Actor::Guest { guest_id } => Some(guest_id),
            Actor::User { .. } => None,
        }
    }
}

/// A registered user row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub created_at: String,
}

/// Cookie-session service over the state database.
#[derive(Clone)]
pub struct AuthService {
    db: Database,
    user_session_days: i64,
    guest_session_days: i64,
}

impl AuthService {
    pub fn new(db: Database, user_session_days: u32, guest_session_days: u32) -> Self {
        Self {
            db,
            user_session_days: user_session_days.max(1) as i64,
            guest_session_days: guest_session_days.max(1) as i64,
        }
    }

    pub fn register(&self, username: &str, password: &str) -> Result<UserRecord> {
        let normalized = normalize_username(username);
        validate_username(&normalized)?;
        let password_hash = hash_password(password)?;

        let user_id = Uuid::new_v4().simple().to_string();
        let created_at = utc_now();

        let conn = self.db.connect()?;
        conn.execute(
            "INSERT INTO users (id, username, password_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
            (&user_id, &normalized, &password_hash, &created_at),
        )
        .map_err(|_| RuntimeError::invalid("username", "already exists"))?;

        Ok(UserRecord {
            id: user_id,
            username: normalized,
            created_at,
        })
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Result<Option<UserRecord>> {
        let normalized = normalize_username(username);
        let conn = self.db.connect()?;
        let row = conn
            .query_row(
                "SELECT id, username, password_hash, created_at FROM users WHERE username = ?1",
                [&normalized],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.and_then(|(id, username, password_hash, created_at)| {
            verify_password(password, &password_hash).then_some(UserRecord {
                id,
                username,
                created_at,
            })
        }))
    }

    fn insert_session(
        &self,
        user_id: Option<&str>,
        guest_id: Option<&str>,
        days: i64,
    ) -> Result<String> {
        let token = generate_token();
        let token_hash = sha256_hex(&token);
        let now = Utc::now();
        let expires = now + Duration::days(days);
        let session_id = Uuid::new_v4().simple().to_string();

        let conn = self.db.connect()?;
        conn.execute(
            "INSERT INTO auth_sessions (id, token_hash, user_id, guest_id, created_at, expires_at, revoked_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7)",
            (
                &session_id,
                &token_hash,
                user_id,
                guest_id,
                now.to_rfc3339(),
                expires.to_rfc3339(),
                now.to_rfc3339(),
            ),
        )?;
        Ok(token)
    }

    /// Create a session for a registered user; returns the bearer token.
    pub fn create_user_session(&self, user_id: &str) -> Result<String> {
        self.insert_session(Some(user_id), None, self.user_session_days)
    }

    /// Bootstrap a guest: fresh guest id plus its session token.
    pub fn create_guest_session(&self) -> Result<(String, String)> {
        let guest_id = Uuid::new_v4().simple().to_string();
        let token = self.insert_session(None, Some(&guest_id), self.guest_session_days)?;
        Ok((token, guest_id))
    }

    pub fn revoke_session(&self, token: &str) -> Result<()> {
        let conn = self.db.connect()?;
        conn.execute(
            "UPDATE auth_sessions SET revoked_at = ?1 WHERE token_hash = ?2 AND revoked_at IS NULL",
            (&utc_now(), &sha256_hex(token)),
        )?;
        Ok(())
    }

    /// Resolve a token to its actor: live sessions only.
    pub fn actor_from_token(&self, token: &str) -> Result<Option<Actor>> {
        if token.is_empty() {
            return Ok(None);
        }
        let conn = self.db.connect()?;
        let row = conn
            .query_row(
                "SELECT s.user_id, s.guest_id, s.expires_at, s.revoked_at, u.username
                 FROM auth_sessions s LEFT JOIN users u ON u.id = s.user_id
                 WHERE s.token_hash = ?1",
                [&sha256_hex(token)],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((user_id, guest_id, expires_at, revoked_at, username)) = row else {
            return Ok(None);
        };
        if revoked_at.is_some() {
            return Ok(None);
        }
        let Ok(expires) = DateTime::parse_from_rfc3339(&expires_at) else {
            return Ok(None);
        };
        if expires <= Utc::now() {
            return Ok(None);
        }

        Ok(match (user_id, guest_id) {
            (Some(user_id), _) => Some(Actor::User {
                user_id,
                username: username.unwrap_or_default(),
            }),
            (None, Some(guest_id)) => Some(Actor::Guest { guest_id }),
            (None, None) => None,
        })
    }

    pub fn touch_session(&self, token: &str) -> Result<()> {
        let conn = self.db.connect()?;
        conn.execute(
            "UPDATE auth_sessions SET last_seen_at = ?1 WHERE token_hash = ?2",
            (&utc_now(), &sha256_hex(token)),
        )?;
        Ok(())
    }
}
