use crate::auth::{self, NewUser, Role, MIN_PASSWORD_LEN};
use crate::ipc::helpers::{
    db_conn, db_err, optional_str, require_role, require_user, required_str, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn validate_password(password: &str) -> Result<(), HandlerErr> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(HandlerErr::new(
            "bad_params",
            format!("password must be at least {} characters", MIN_PASSWORD_LEN),
        ));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), HandlerErr> {
    let ok = email
        .split_once('@')
        .map(|(local, domain)| !local.is_empty() && domain.contains('.'))
        .unwrap_or(false);
    if !ok {
        return Err(HandlerErr::new("bad_params", "email is not valid"));
    }
    Ok(())
}

fn insert_user(conn: &Connection, params: &serde_json::Value, role: Role) -> Result<String, HandlerErr> {
    let username = required_str(params, "username")?;
    // Passwords are not trimmed.
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing password"))?;
    let full_name = required_str(params, "fullName")?;
    let email = required_str(params, "email")?;
    validate_password(password)?;
    validate_email(&email)?;

    if auth::username_exists(conn, &username)? {
        return Err(HandlerErr::new("username_taken", "Username already exists"));
    }
    if auth::email_owner(conn, &email)?.is_some() {
        return Err(HandlerErr::new("email_taken", "Email already exists"));
    }

    auth::create_user(
        conn,
        &NewUser {
            username: &username,
            password,
            full_name: &full_name,
            email: &email,
            role,
        },
    )
    .map_err(db_err("db_insert_failed"))
}

fn register(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let role_raw = required_str(params, "role")?;
    let role = match Role::parse(&role_raw) {
        Some(r @ (Role::Lecturer | Role::Student)) => r,
        _ => {
            return Err(HandlerErr::new(
                "bad_params",
                "role must be one of: lecturer, student",
            )
            .with_details(json!({ "role": role_raw })))
        }
    };
    let user_id = insert_user(conn, params, role)?;
    tracing::info!(%user_id, role = role.as_str(), "user registered");
    Ok(json!({ "userId": user_id, "role": role }))
}

fn bootstrap_admin(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    if auth::admin_exists(conn)? {
        return Err(HandlerErr::new("admin_exists", "an admin account already exists"));
    }
    let user_id = insert_user(conn, params, Role::Admin)?;
    tracing::info!(%user_id, "admin account bootstrapped");
    Ok(json!({ "userId": user_id, "role": Role::Admin }))
}

fn login(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let username = required_str(params, "username")?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let Some(user) = auth::verify_credentials(conn, &username, password)? else {
        tracing::warn!(%username, "login refused");
        return Err(HandlerErr::new(
            "invalid_credentials",
            "Invalid username or password",
        ));
    };
    let session_id = auth::create_session(conn, &user.id).map_err(db_err("db_insert_failed"))?;
    tracing::info!(user_id = %user.id, "session created");
    Ok(json!({
        "sessionId": session_id,
        "userId": user.id,
        "role": user.role,
    }))
}

fn logout(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let session_id = required_str(params, "sessionId")?;
    let removed = auth::delete_session(conn, &session_id).map_err(db_err("db_delete_failed"))?;
    Ok(json!({ "loggedOut": removed > 0 }))
}

fn me(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    Ok(json!({ "user": user }))
}

fn users_list(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    require_role(&user, &[Role::Admin])?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM users ORDER BY created_at DESC, username",
        auth::USER_COLUMNS
    ))?;
    let users = stmt
        .query_map([], auth::user_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "users": users }))
}

fn users_update(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let actor = require_user(conn, params)?;
    require_role(&actor, &[Role::Admin])?;

    let user_id = required_str(params, "userId")?;
    if auth::find_user(conn, &user_id)?.is_none() {
        return Err(HandlerErr::new("not_found", "user not found"));
    }
    let full_name = optional_str(params, "fullName")?;
    let email = optional_str(params, "email")?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty());

    if let Some(email) = &email {
        validate_email(email)?;
        if let Some(owner) = auth::email_owner(conn, email)? {
            if owner != user_id {
                return Err(HandlerErr::new("email_taken", "Email already exists"));
            }
        }
    }
    if let Some(pw) = password {
        validate_password(pw)?;
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    if let Some(name) = &full_name {
        tx.execute(
            "UPDATE users SET full_name = ? WHERE id = ?",
            (name, &user_id),
        )
        .map_err(db_err("db_update_failed"))?;
    }
    if let Some(email) = &email {
        tx.execute("UPDATE users SET email = ? WHERE id = ?", (email, &user_id))
            .map_err(db_err("db_update_failed"))?;
    }
    if let Some(pw) = password {
        auth::set_password(&tx, &user_id, pw).map_err(db_err("db_update_failed"))?;
    }
    tx.commit().map_err(db_err("db_tx_failed"))?;

    tracing::info!(%user_id, actor = %actor.id, "user updated");
    let user = auth::find_user(conn, &user_id)?;
    Ok(json!({ "user": user }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "auth.register" => register(state, &req.params),
        "auth.bootstrapAdmin" => bootstrap_admin(state, &req.params),
        "auth.login" => login(state, &req.params),
        "auth.logout" => logout(state, &req.params),
        "auth.me" => me(state, &req.params),
        "users.list" => users_list(state, &req.params),
        "users.update" => users_update(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
