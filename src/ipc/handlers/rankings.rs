use crate::auth::Role;
use crate::db;
use crate::ipc::helpers::{
    db_conn, lecturer_class, member_class, require_role, require_user, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::rank::{compute_rankings, standing, RankingResult, RankingWeights};
use crate::store::{load_snapshot, SqliteStore};
use rusqlite::Connection;
use serde_json::json;

const WEIGHTS_KEY: &str = "rankings.weights";

/// Stored override, or defaults when none is set.
fn load_weights(conn: &Connection) -> Result<(RankingWeights, bool), HandlerErr> {
    let stored = db::settings_get_json(conn, WEIGHTS_KEY)
        .map_err(|e| HandlerErr::new("db_query_failed", format!("{e:#}")))?;
    let Some(v) = stored else {
        return Ok((RankingWeights::default(), false));
    };
    let weights: RankingWeights = serde_json::from_value(v).map_err(|e| {
        HandlerErr::new("db_corrupt", format!("stored ranking weights unreadable: {e}"))
    })?;
    Ok((weights, true))
}

fn class_rankings(conn: &Connection, class_id: &str) -> Result<Vec<RankingResult>, HandlerErr> {
    let (weights, _) = load_weights(conn)?;
    let snapshot = load_snapshot(&SqliteStore::new(conn), class_id)?;
    Ok(compute_rankings(&snapshot, &weights))
}

fn class(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    let class_id = lecturer_class(conn, &user)?;
    let rankings = class_rankings(conn, &class_id)?;
    tracing::debug!(%class_id, students = rankings.len(), "class rankings computed");
    Ok(json!({ "classId": class_id, "rankings": rankings }))
}

fn student(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    require_role(&user, &[Role::Student])?;
    let class_id = member_class(conn, &user)?;
    let rankings = class_rankings(conn, &class_id)?;
    let me = standing(&rankings, &user.id);
    Ok(json!({ "classId": class_id, "rankings": rankings, "me": me }))
}

fn config_get(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    require_role(&user, &[Role::Admin])?;
    let (weights, overridden) = load_weights(conn)?;
    Ok(json!({ "weights": weights, "overridden": overridden }))
}

fn read_weight(params: &serde_json::Value, key: &str, current: f64) -> Result<f64, HandlerErr> {
    match params.get(key) {
        None => Ok(current),
        Some(v) if v.is_null() => Ok(current),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| HandlerErr::new("bad_params", format!("{} must be a number", key))),
    }
}

fn config_update(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    require_role(&user, &[Role::Admin])?;

    let (current, _) = load_weights(conn)?;
    let next = RankingWeights {
        assignment_weight: read_weight(params, "assignmentWeight", current.assignment_weight)?,
        attendance_weight: read_weight(params, "attendanceWeight", current.attendance_weight)?,
        late_credit: read_weight(params, "lateCredit", current.late_credit)?,
    };
    if let Err(msg) = next.validate() {
        tracing::warn!(actor = %user.id, "ranking weights refused: {msg}");
        return Err(HandlerErr::new("bad_params", msg).with_details(json!({ "weights": next })));
    }

    let value = serde_json::to_value(next)
        .map_err(|e| HandlerErr::new("bad_params", e.to_string()))?;
    db::settings_set_json(conn, WEIGHTS_KEY, &value)
        .map_err(|e| HandlerErr::new("db_update_failed", format!("{e:#}")))?;
    tracing::info!(
        actor = %user.id,
        assignment = next.assignment_weight,
        attendance = next.attendance_weight,
        late = next.late_credit,
        "ranking weights updated"
    );
    Ok(json!({ "weights": next, "overridden": true }))
}

fn config_clear(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    require_role(&user, &[Role::Admin])?;
    db::settings_delete(conn, WEIGHTS_KEY)
        .map_err(|e| HandlerErr::new("db_delete_failed", format!("{e:#}")))?;
    tracing::info!(actor = %user.id, "ranking weights reset to defaults");
    Ok(json!({ "weights": RankingWeights::default(), "overridden": false }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "rankings.class" => class(state, &req.params),
        "rankings.student" => student(state, &req.params),
        "rankings.config.get" => config_get(state, &req.params),
        "rankings.config.update" => config_update(state, &req.params),
        "rankings.config.clearOverride" => config_clear(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
