use crate::auth::now_rfc3339;
use crate::ipc::helpers::{
    db_conn, db_err, lecturer_class, member_class, require_user, required_str, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveTime;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const WEEKDAYS: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

fn parse_day(raw: &str) -> Result<(&'static str, i64), HandlerErr> {
    WEEKDAYS
        .iter()
        .position(|d| d.eq_ignore_ascii_case(raw.trim()))
        .map(|i| (WEEKDAYS[i], i as i64))
        .ok_or_else(|| {
            HandlerErr::new("bad_params", "day must be a weekday name")
                .with_details(json!({ "day": raw }))
        })
}

fn parse_time(key: &str, raw: &str) -> Result<NaiveTime, HandlerErr> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|_| {
        HandlerErr::new("bad_params", format!("{} must be HH:MM", key))
            .with_details(json!({ key: raw }))
    })
}

fn create(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    let class_id = lecturer_class(conn, &user)?;

    let (day, day_index) = parse_day(&required_str(params, "day")?)?;
    let start = parse_time("startTime", &required_str(params, "startTime")?)?;
    let end = parse_time("endTime", &required_str(params, "endTime")?)?;
    if start >= end {
        return Err(HandlerErr::new(
            "bad_params",
            "startTime must be before endTime",
        ));
    }
    let title = required_str(params, "title")?;

    let schedule_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO schedules(id, class_id, day, day_index, start_time, end_time, title, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &schedule_id,
            &class_id,
            day,
            day_index,
            start.format("%H:%M").to_string(),
            end.format("%H:%M").to_string(),
            &title,
            now_rfc3339(),
        ),
    )
    .map_err(db_err("db_insert_failed"))?;
    tracing::info!(%schedule_id, %class_id, "schedule entry created");
    Ok(json!({ "scheduleId": schedule_id }))
}

fn list(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    let class_id = member_class(conn, &user)?;

    let mut stmt = conn.prepare(
        "SELECT id, day, start_time, end_time, title
         FROM schedules
         WHERE class_id = ?
         ORDER BY day_index, start_time, title",
    )?;
    let entries = stmt
        .query_map([&class_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "day": r.get::<_, String>(1)?,
                "startTime": r.get::<_, String>(2)?,
                "endTime": r.get::<_, String>(3)?,
                "title": r.get::<_, String>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classId": class_id, "schedules": entries }))
}

fn delete(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    let class_id = lecturer_class(conn, &user)?;
    let schedule_id = required_str(params, "scheduleId")?;

    let owner: Option<String> = conn
        .query_row(
            "SELECT class_id FROM schedules WHERE id = ?",
            [&schedule_id],
            |r| r.get(0),
        )
        .optional()?;
    match owner {
        None => return Err(HandlerErr::new("not_found", "schedule entry not found")),
        Some(c) if c != class_id => {
            return Err(HandlerErr::new("forbidden", "schedule entry belongs to another class"))
        }
        Some(_) => {}
    }
    conn.execute("DELETE FROM schedules WHERE id = ?", [&schedule_id])
        .map_err(db_err("db_delete_failed"))?;
    tracing::info!(%schedule_id, "schedule entry deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "schedules.create" => create(state, &req.params),
        "schedules.list" => list(state, &req.params),
        "schedules.delete" => delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_names_are_case_insensitive() {
        let (day, idx) = parse_day("wednesday").ok().expect("weekday");
        assert_eq!(day, "Wednesday");
        assert_eq!(idx, 2);
        assert!(parse_day("Funday").is_err());
    }

    #[test]
    fn times_need_hours_and_minutes() {
        assert!(parse_time("startTime", "09:30").is_ok());
        assert!(parse_time("startTime", "9am").is_err());
        assert!(parse_time("startTime", "25:00").is_err());
    }
}
