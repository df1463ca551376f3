use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const SESSION_DAYS: i64 = 7;
pub const MIN_PASSWORD_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Lecturer,
    Student,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Lecturer => "lecturer",
            Role::Student => "student",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "lecturer" => Some(Role::Lecturer),
            "student" => Some(Role::Student),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub role: Role,
    pub class_id: Option<String>,
    pub created_at: String,
}

pub const USER_COLUMNS: &str = "id, username, full_name, email, role, class_id, created_at";

pub fn user_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let role_raw: String = r.get(4)?;
    let role = Role::parse(&role_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown role {role_raw:?}").into(),
        )
    })?;
    Ok(User {
        id: r.get(0)?,
        username: r.get(1)?,
        full_name: r.get(2)?,
        email: r.get(3)?,
        role,
        class_id: r.get(5)?,
        created_at: r.get(6)?,
    })
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub struct NewUser<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub full_name: &'a str,
    pub email: &'a str,
    pub role: Role,
}

pub fn find_user(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"),
        [user_id],
        user_from_row,
    )
    .optional()
}

pub fn username_exists(conn: &Connection, username: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM users WHERE username = ?",
        [username],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
}

pub fn email_owner(conn: &Connection, email: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT id FROM users WHERE lower(email) = lower(?)",
        [email],
        |r| r.get(0),
    )
    .optional()
}

pub fn create_user(conn: &Connection, new: &NewUser<'_>) -> rusqlite::Result<String> {
    let id = Uuid::new_v4().to_string();
    let salt = Uuid::new_v4().simple().to_string();
    conn.execute(
        "INSERT INTO users(id, username, password_hash, password_salt, full_name, email, role, class_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, NULL, ?)",
        (
            &id,
            new.username,
            hash_password(&salt, new.password),
            &salt,
            new.full_name,
            new.email,
            new.role.as_str(),
            now_rfc3339(),
        ),
    )?;
    Ok(id)
}

pub fn set_password(conn: &Connection, user_id: &str, password: &str) -> rusqlite::Result<()> {
    let salt = Uuid::new_v4().simple().to_string();
    conn.execute(
        "UPDATE users SET password_hash = ?, password_salt = ? WHERE id = ?",
        (hash_password(&salt, password), &salt, user_id),
    )?;
    Ok(())
}

/// Returns the user when the credentials match.
pub fn verify_credentials(
    conn: &Connection,
    username: &str,
    password: &str,
) -> rusqlite::Result<Option<User>> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT id, password_hash, password_salt FROM users WHERE username = ?",
            [username],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((id, stored, salt)) = row else {
        return Ok(None);
    };
    if hash_password(&salt, password) != stored {
        return Ok(None);
    }
    find_user(conn, &id)
}

pub fn create_session(conn: &Connection, user_id: &str) -> rusqlite::Result<String> {
    create_session_at(conn, user_id, Utc::now())
}

fn create_session_at(
    conn: &Connection,
    user_id: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<String> {
    let id = Uuid::new_v4().to_string();
    let expires = now + Duration::days(SESSION_DAYS);
    conn.execute(
        "INSERT INTO sessions(id, user_id, created_at, expires_at) VALUES(?, ?, ?, ?)",
        (&id, user_id, now.to_rfc3339(), expires.to_rfc3339()),
    )?;
    Ok(id)
}

pub fn delete_session(conn: &Connection, session_id: &str) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM sessions WHERE id = ?", [session_id])
}

/// Resolves a live session to its user. Expired sessions are removed.
pub fn session_user(conn: &Connection, session_id: &str) -> rusqlite::Result<Option<User>> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT user_id, expires_at FROM sessions WHERE id = ?",
            [session_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((user_id, expires_at)) = row else {
        return Ok(None);
    };
    let live = DateTime::parse_from_rfc3339(&expires_at)
        .map(|t| t.with_timezone(&Utc) > Utc::now())
        .unwrap_or(false);
    if !live {
        delete_session(conn, session_id)?;
        return Ok(None);
    }
    find_user(conn, &user_id)
}

pub fn admin_exists(conn: &Connection) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM users WHERE role = 'admin' LIMIT 1",
        [],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
}
