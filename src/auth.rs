use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::Utc;
use password_hash::SaltString;
use rand_core::OsRng;
use rusqlite::{OptionalExtension, params};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{Backend, BackendError};
use crate::models::{Role, User};

pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid login credentials")]
    InvalidCredentials,
    #[error("A user with this email address has already been registered")]
    AlreadyRegistered,
    #[error("Password should be at least 6 characters")]
    WeakPassword,
    #[error("password hashing failed")]
    Hash,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl AuthError {
    /// Message shown on the login page.
    pub fn user_message(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "E-mail ou senha incorretos",
            AuthError::AlreadyRegistered => "Usuário já cadastrado",
            AuthError::WeakPassword => "A senha deve ter pelo menos 6 caracteres",
            AuthError::Hash => "Erro ao fazer login",
            AuthError::Backend(err) if err.is_missing_table() => "Sistema não configurado",
            AuthError::Backend(_) => "Erro ao fazer login",
        }
    }
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|_| AuthError::Hash)?;
    Ok(hash.to_string())
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    let parsed = match PasswordHash::new(hash) {
        Ok(parsed) => parsed,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[derive(Debug, Clone)]
pub struct Session {
    pub user: User,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub name: String,
    pub role: Role,
}

impl Backend {
    /// Password sign-in. Keeps at most `max_sessions` sessions per user.
    pub fn sign_in(&self, email: &str, password: &str, max_sessions: i64) -> Result<Session, AuthError> {
        let email = email.trim().to_lowercase();
        let conn = self.conn()?;
        let creds = conn
            .query_row(
                "SELECT id, password_hash FROM users WHERE email = ?1",
                params![email],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(BackendError::from)?;
        let Some((user_id, hash)) = creds else {
            return Err(AuthError::InvalidCredentials);
        };
        if !verify_password(&hash, password) {
            warn!(%email, "rejected sign-in");
            return Err(AuthError::InvalidCredentials);
        }

        let token = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO sessions (user_id, token, created_at) VALUES (?1, ?2, ?3)",
            params![user_id, token, Utc::now()],
        )
        .map_err(BackendError::from)?;
        conn.execute(
            "
            DELETE FROM sessions
            WHERE user_id = ?1
              AND id NOT IN (
                SELECT id
                FROM sessions
                WHERE user_id = ?1
                ORDER BY created_at DESC, id DESC
                LIMIT ?2
              )
            ",
            params![user_id, max_sessions],
        )
        .map_err(BackendError::from)?;

        Ok(Session {
            user: User { id: user_id, email },
            token,
        })
    }

    pub fn sign_out(&self, token: &str) -> Result<(), AuthError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])
            .map_err(BackendError::from)?;
        Ok(())
    }

    pub fn current_user(&self, token: &str) -> Result<Option<User>, AuthError> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "
                SELECT u.id, u.email
                FROM sessions s
                JOIN users u ON s.user_id = u.id
                WHERE s.token = ?1
                ",
                params![token],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        email: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(BackendError::from)?;
        Ok(user)
    }

    /// Admin user creation: the auth user plus its profile row.
    pub fn create_user(&self, new_user: &NewUser) -> Result<User, AuthError> {
        self.require_service_role("create_user")?;
        if new_user.password.len() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }
        let email = new_user.email.trim().to_lowercase();
        let password_hash = hash_password(&new_user.password)?;

        let user_id = {
            let conn = self.conn()?;
            match conn.execute(
                "INSERT INTO users (email, password_hash, created_at) VALUES (?1, ?2, ?3)",
                params![email, password_hash, Utc::now()],
            ) {
                Ok(_) => conn.last_insert_rowid(),
                Err(err) => {
                    return Err(match BackendError::from(err) {
                        BackendError::Conflict(_) => AuthError::AlreadyRegistered,
                        other => AuthError::Backend(other),
                    });
                }
            }
        };
        self.upsert_profile(user_id, &email, &new_user.name, new_user.role)?;
        info!(%email, role = new_user.role.as_str(), "created user");
        Ok(User { id: user_id, email })
    }

    pub fn list_users(&self) -> Result<Vec<User>, AuthError> {
        self.require_service_role("list_users")?;
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, email FROM users ORDER BY id")
            .map_err(BackendError::from)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(User {
                    id: row.get(0)?,
                    email: row.get(1)?,
                })
            })
            .map_err(BackendError::from)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(BackendError::from)?);
        }
        Ok(out)
    }

    pub fn session_count(&self, user_id: i64) -> Result<i64, AuthError> {
        let conn = self.conn()?;
        let count = conn
            .query_row(
                "SELECT COUNT(*) FROM sessions WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(BackendError::from)?;
        Ok(count)
    }
}
