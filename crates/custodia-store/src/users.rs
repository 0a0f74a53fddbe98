//! Identity directory: registration, password checks and permission levels.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use custodia_shared::types::{PermissionLevel, UserId};

use crate::database::Database;
use crate::error::{is_constraint_violation, Result, StoreError};
use crate::models::{decode_text, decode_ts, encode_ts, User};

/// Longest accepted username.
pub const MAX_USERNAME_LEN: usize = 64;

impl Database {
    /// Store a new account. `password_hash` comes from [`hash_password`],
    /// which callers run before taking any lock on the database. Usernames
    /// are unique and may not contain whitespace, so they always survive the
    /// command tokenizer.
    pub fn insert_user(
        &self,
        username: &str,
        password_hash: &str,
        level: PermissionLevel,
    ) -> Result<UserId> {
        validate_username(username)?;
        let inserted = self.conn().execute(
            "INSERT INTO users (username, password_hash, permission_level, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![username, password_hash, level.as_str(), encode_ts(&Utc::now())],
        );

        match inserted {
            Ok(_) => {
                let id = UserId(self.conn().last_insert_rowid());
                tracing::info!(user = %username, id = %id, level = %level, "registered user");
                Ok(id)
            }
            Err(e) if is_constraint_violation(&e) => {
                Err(StoreError::AlreadyExists(format!("user '{username}'")))
            }
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    /// The stored user and its password hash, for [`check_password`].
    pub fn credentials(&self, username: &str) -> Result<Option<(User, String)>> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, username, permission_level, created_at, password_hash
                 FROM users WHERE username = ?1",
                params![username],
                |row| Ok((row_to_user(row)?, row.get::<_, String>(4)?)),
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, username, permission_level, created_at FROM users WHERE id = ?1",
                params![id.0],
                row_to_user,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn find_user_by_name(&self, username: &str) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                "SELECT id, username, permission_level, created_at FROM users WHERE username = ?1",
                params![username],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, username, permission_level, created_at FROM users ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], row_to_user)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        return Err(StoreError::InvalidInput("empty username".into()));
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err(StoreError::InvalidInput(format!(
            "username longer than {MAX_USERNAME_LEN} characters"
        )));
    }
    if username.chars().any(|c| c.is_whitespace() || c.is_control() || c == '"') {
        return Err(StoreError::InvalidInput(
            "username contains whitespace or quotes".into(),
        ));
    }
    Ok(())
}

/// Argon2 PHC string for `password` with a fresh salt.
pub fn hash_password(password: &str) -> Result<String> {
    if password.is_empty() {
        return Err(StoreError::InvalidInput("empty password".into()));
    }
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| StoreError::PasswordHash(e.to_string()))
}

/// Check `password` against what [`Database::credentials`] returned. Returns
/// the user on success and `None` on any mismatch, without telling the
/// caller whether the username exists.
pub fn check_password(found: Option<(User, String)>, password: &str) -> Result<Option<User>> {
    let Some((user, stored_hash)) = found else {
        // Equalize timing with the found-user path.
        let _ = hash_password(password);
        return Ok(None);
    };

    let parsed =
        PasswordHash::new(&stored_hash).map_err(|e| StoreError::PasswordHash(e.to_string()))?;
    let matches = Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok();
    Ok(matches.then_some(user))
}

// Legacy three-tier values ('lectura', 'escritura') are normalized here by
// the PermissionLevel parser.
fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: i64 = row.get(0)?;
    let username: String = row.get(1)?;
    let level_str: String = row.get(2)?;
    let created_str: String = row.get(3)?;

    Ok(User {
        id: UserId(id),
        username,
        level: decode_text(2, &level_str)?,
        created_at: decode_ts(3, &created_str)?,
    })
}
