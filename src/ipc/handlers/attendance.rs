use crate::auth::{now_rfc3339, Role};
use crate::ipc::helpers::{
    db_conn, db_err, lecturer_class, member_class, require_role, require_user, required_str,
    respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::rank::AttendanceStatus;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn parse_date(raw: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        HandlerErr::new("bad_params", "date must be YYYY-MM-DD").with_details(json!({ "date": raw }))
    })
}

fn parse_status(raw: &str) -> Result<AttendanceStatus, HandlerErr> {
    AttendanceStatus::parse(raw).ok_or_else(|| {
        HandlerErr::new("bad_params", "status must be one of: present, absent, late")
            .with_details(json!({ "status": raw }))
    })
}

/// Owning class of an attendance session.
fn session_class(conn: &Connection, session_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT class_id FROM attendance_sessions WHERE id = ?",
        [session_id],
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| HandlerErr::new("not_found", "attendance session not found"))
}

fn create(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    let class_id = lecturer_class(conn, &user)?;
    let title = required_str(params, "title")?;
    let date = parse_date(&required_str(params, "date")?)?;

    let student_ids: Vec<String> = {
        let mut stmt =
            conn.prepare("SELECT id FROM users WHERE class_id = ? AND role = 'student'")?;
        let rows = stmt
            .query_map([&class_id], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let session_id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    tx.execute(
        "INSERT INTO attendance_sessions(id, class_id, title, date, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            &session_id,
            &class_id,
            &title,
            date.format("%Y-%m-%d").to_string(),
            now_rfc3339(),
        ),
    )
    .map_err(db_err("db_insert_failed"))?;
    {
        let mut ins = tx
            .prepare(
                "INSERT INTO attendance_records(id, session_id, student_id, status)
                 VALUES(?, ?, ?, ?)",
            )
            .map_err(db_err("db_insert_failed"))?;
        for student_id in &student_ids {
            ins.execute((
                Uuid::new_v4().to_string(),
                &session_id,
                student_id,
                AttendanceStatus::Absent.as_str(),
            ))
            .map_err(db_err("db_insert_failed"))?;
        }
    }
    tx.commit().map_err(db_err("db_tx_failed"))?;

    tracing::info!(%session_id, %class_id, records = student_ids.len(), "attendance session created");
    Ok(json!({ "attendanceSessionId": session_id, "recordCount": student_ids.len() }))
}

fn list(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    let class_id = lecturer_class(conn, &user)?;

    let mut stmt = conn.prepare(
        "SELECT s.id, s.title, s.date, s.created_at,
           SUM(CASE WHEN r.status = 'present' THEN 1 ELSE 0 END),
           SUM(CASE WHEN r.status = 'late' THEN 1 ELSE 0 END),
           SUM(CASE WHEN r.status = 'absent' THEN 1 ELSE 0 END)
         FROM attendance_sessions s
         LEFT JOIN attendance_records r ON r.session_id = s.id
         WHERE s.class_id = ?
         GROUP BY s.id
         ORDER BY s.date DESC, s.created_at DESC",
    )?;
    let sessions = stmt
        .query_map([&class_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "date": r.get::<_, String>(2)?,
                "createdAt": r.get::<_, String>(3)?,
                "presentCount": r.get::<_, Option<i64>>(4)?.unwrap_or(0),
                "lateCount": r.get::<_, Option<i64>>(5)?.unwrap_or(0),
                "absentCount": r.get::<_, Option<i64>>(6)?.unwrap_or(0),
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classId": class_id, "sessions": sessions }))
}

fn records(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    let class_id = lecturer_class(conn, &user)?;
    let session_id = required_str(params, "attendanceSessionId")?;
    if session_class(conn, &session_id)? != class_id {
        return Err(HandlerErr::new("forbidden", "session belongs to another class"));
    }

    let mut stmt = conn.prepare(
        "SELECT r.id, r.student_id, COALESCE(u.full_name, ''), r.status
         FROM attendance_records r
         LEFT JOIN users u ON u.id = r.student_id
         WHERE r.session_id = ?
         ORDER BY u.full_name, r.student_id",
    )?;
    let rows = stmt
        .query_map([&session_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": r.get::<_, String>(2)?,
                "status": r.get::<_, String>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "attendanceSessionId": session_id, "records": rows }))
}

fn update(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    let class_id = lecturer_class(conn, &user)?;
    let record_id = required_str(params, "recordId")?;
    let status = parse_status(&required_str(params, "status")?)?;

    let owner: Option<String> = conn
        .query_row(
            "SELECT s.class_id
             FROM attendance_records r
             JOIN attendance_sessions s ON s.id = r.session_id
             WHERE r.id = ?",
            [&record_id],
            |r| r.get(0),
        )
        .optional()?;
    match owner {
        None => return Err(HandlerErr::new("not_found", "attendance record not found")),
        Some(c) if c != class_id => {
            return Err(HandlerErr::new("forbidden", "record belongs to another class"))
        }
        Some(_) => {}
    }

    conn.execute(
        "UPDATE attendance_records SET status = ? WHERE id = ?",
        (status.as_str(), &record_id),
    )
    .map_err(db_err("db_update_failed"))?;
    tracing::info!(%record_id, status = status.as_str(), "attendance updated");
    Ok(json!({ "recordId": record_id, "status": status }))
}

fn mine(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    require_role(&user, &[Role::Student])?;
    let class_id = member_class(conn, &user)?;

    let mut stmt = conn.prepare(
        "SELECT r.id, s.id, s.title, s.date, r.status
         FROM attendance_records r
         JOIN attendance_sessions s ON s.id = r.session_id
         WHERE r.student_id = ? AND s.class_id = ?
         ORDER BY s.date DESC, s.created_at DESC",
    )?;
    let rows = stmt
        .query_map((&user.id, &class_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let (mut present, mut late, mut absent) = (0usize, 0usize, 0usize);
    let mut out = Vec::with_capacity(rows.len());
    for (record_id, session_id, title, date, raw) in rows {
        let status = AttendanceStatus::parse(&raw).ok_or_else(|| {
            HandlerErr::new("db_corrupt", "unknown attendance status")
                .with_details(json!({ "recordId": record_id, "status": raw }))
        })?;
        match status {
            AttendanceStatus::Present => present += 1,
            AttendanceStatus::Late => late += 1,
            AttendanceStatus::Absent => absent += 1,
        }
        out.push(json!({
            "recordId": record_id,
            "attendanceSessionId": session_id,
            "title": title,
            "date": date,
            "status": status,
        }));
    }
    Ok(json!({
        "records": out,
        "presentCount": present,
        "lateCount": late,
        "absentCount": absent,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "attendance.create" => create(state, &req.params),
        "attendance.list" => list(state, &req.params),
        "attendance.records" => records(state, &req.params),
        "attendance.update" => update(state, &req.params),
        "attendance.mine" => mine(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
