use crate::auth::{self, Role, User};
use crate::ipc::error::{err, ok};
use crate::ipc::types::AppState;
use crate::store::StoreError;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        HandlerErr::new("db_query_failed", e.to_string())
    }
}

impl From<StoreError> for HandlerErr {
    fn from(e: StoreError) -> Self {
        HandlerErr::new(e.code(), e.to_string())
    }
}

/// Maps a rusqlite error to a specific db_* code.
pub fn db_err(code: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| HandlerErr::new(code, e.to_string())
}

pub fn respond(id: &str, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => e.response(id),
    }
}

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn workspace_path(state: &AppState) -> Result<&Path, HandlerErr> {
    state
        .workspace
        .as_deref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Trimmed, non-empty string param.
pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            format!("{} must not be empty", key),
        ));
    }
    Ok(s)
}

/// Absent, null or blank all read as `None`.
pub fn optional_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("{} must be string or null", key),
                ));
            };
            let t = s.trim();
            if t.is_empty() {
                Ok(None)
            } else {
                Ok(Some(t.to_string()))
            }
        }
    }
}

pub fn require_user(conn: &Connection, params: &serde_json::Value) -> Result<User, HandlerErr> {
    let session_id = params
        .get("sessionId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("unauthorized", "missing sessionId"))?;
    auth::session_user(conn, session_id)?
        .ok_or_else(|| HandlerErr::new("unauthorized", "session expired or unknown"))
}

pub fn require_role(user: &User, allowed: &[Role]) -> Result<(), HandlerErr> {
    if allowed.contains(&user.role) {
        return Ok(());
    }
    Err(HandlerErr::new(
        "forbidden",
        format!("{} may not perform this action", user.role.as_str()),
    ))
}

pub fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::from)
}

/// The class a lecturer owns. Errors when the user is not a lecturer or has none.
pub fn lecturer_class(conn: &Connection, user: &User) -> Result<String, HandlerErr> {
    require_role(user, &[Role::Lecturer])?;
    let Some(class_id) = user.class_id.clone() else {
        return Err(HandlerErr::new("no_class", "create a class first"));
    };
    let owner: Option<String> = conn
        .query_row(
            "SELECT lecturer_id FROM classes WHERE id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .optional()?;
    match owner {
        Some(owner) if owner == user.id => Ok(class_id),
        Some(_) => Err(HandlerErr::new("forbidden", "class belongs to another lecturer")),
        None => Err(HandlerErr::new("not_found", "class not found")),
    }
}

/// The class a student belongs to, or the class a lecturer owns.
pub fn member_class(conn: &Connection, user: &User) -> Result<String, HandlerErr> {
    match user.role {
        Role::Lecturer => lecturer_class(conn, user),
        Role::Student => {
            let Some(class_id) = user.class_id.clone() else {
                return Err(HandlerErr::new("no_class", "join a class first"));
            };
            if !class_exists(conn, &class_id)? {
                return Err(HandlerErr::new("not_found", "class not found"));
            }
            Ok(class_id)
        }
        Role::Admin => Err(HandlerErr::new("forbidden", "admins are not class members")),
    }
}

pub fn count(conn: &Connection, sql: &str, key: &str) -> Result<i64, HandlerErr> {
    conn.query_row(sql, [key], |r| r.get(0))
        .map_err(HandlerErr::from)
}
