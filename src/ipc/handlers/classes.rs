use crate::auth::{Role, User};
use crate::blob;
use crate::ipc::helpers::{
    count, db_conn, db_err, lecturer_class, member_class, require_role, require_user,
    required_str, respond, workspace_path, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const CODE_ATTEMPTS: usize = 32;

fn random_code() -> String {
    let n = Uuid::new_v4().as_u128() % 90_000 + 10_000;
    n.to_string()
}

fn unused_code(conn: &Connection) -> Result<String, HandlerErr> {
    for _ in 0..CODE_ATTEMPTS {
        let code = random_code();
        let taken: Option<i64> = conn
            .query_row("SELECT 1 FROM classes WHERE code = ?", [&code], |r| r.get(0))
            .optional()?;
        if taken.is_none() {
            return Ok(code);
        }
    }
    Err(HandlerErr::new(
        "code_exhausted",
        "could not allocate a free class code",
    ))
}

fn class_json(conn: &Connection, class_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT c.id, c.name, c.code, c.lecturer_id, COALESCE(u.full_name, ''), c.created_at,
               (SELECT COUNT(*) FROM users s WHERE s.class_id = c.id AND s.role = 'student'),
               (SELECT COUNT(*) FROM assignments a WHERE a.class_id = c.id),
               (SELECT COUNT(*) FROM attendance_sessions x WHERE x.class_id = c.id)
             FROM classes c
             LEFT JOIN users u ON u.id = c.lecturer_id
             WHERE c.id = ?",
            [class_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "code": r.get::<_, String>(2)?,
                    "lecturerId": r.get::<_, String>(3)?,
                    "lecturerName": r.get::<_, String>(4)?,
                    "createdAt": r.get::<_, String>(5)?,
                    "studentCount": r.get::<_, i64>(6)?,
                    "assignmentCount": r.get::<_, i64>(7)?,
                    "sessionCount": r.get::<_, i64>(8)?,
                }))
            },
        )
        .optional()?;
    row.ok_or_else(|| HandlerErr::new("not_found", "class not found"))
}

fn create(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    require_role(&user, &[Role::Lecturer])?;
    if user.class_id.is_some() {
        return Err(HandlerErr::new(
            "already_in_class",
            "You already have an active class",
        ));
    }
    let name = required_str(params, "name")?;
    let code = unused_code(conn)?;
    let class_id = Uuid::new_v4().to_string();

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    tx.execute(
        "INSERT INTO classes(id, name, code, lecturer_id, created_at) VALUES(?, ?, ?, ?, ?)",
        (&class_id, &name, &code, &user.id, crate::auth::now_rfc3339()),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "classes" }))
    })?;
    tx.execute(
        "UPDATE users SET class_id = ? WHERE id = ?",
        (&class_id, &user.id),
    )
    .map_err(db_err("db_update_failed"))?;
    tx.commit().map_err(db_err("db_tx_failed"))?;

    tracing::info!(%class_id, lecturer = %user.id, "class created");
    Ok(json!({ "classId": class_id, "classCode": code, "name": name }))
}

fn join(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    require_role(&user, &[Role::Student])?;
    if user.class_id.is_some() {
        return Err(HandlerErr::new(
            "already_in_class",
            "You already joined a class",
        ));
    }
    let code = required_str(params, "code")?;
    let class_id: Option<String> = conn
        .query_row("SELECT id FROM classes WHERE code = ?", [&code], |r| r.get(0))
        .optional()?;
    let Some(class_id) = class_id else {
        return Err(HandlerErr::new("invalid_code", "Invalid class code"));
    };
    conn.execute(
        "UPDATE users SET class_id = ? WHERE id = ?",
        (&class_id, &user.id),
    )
    .map_err(db_err("db_update_failed"))?;
    tracing::info!(%class_id, student = %user.id, "student joined class");
    Ok(json!({ "classId": class_id }))
}

fn exit(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    require_role(&user, &[Role::Student])?;
    let left = user.class_id.is_some();
    conn.execute("UPDATE users SET class_id = NULL WHERE id = ?", [&user.id])
        .map_err(db_err("db_update_failed"))?;
    if left {
        tracing::info!(student = %user.id, "student left class");
    }
    Ok(json!({ "left": left }))
}

/// The class to delete: an admin names it, a lecturer deletes their own.
fn deletable_class(
    conn: &Connection,
    user: &User,
    params: &serde_json::Value,
) -> Result<String, HandlerErr> {
    match user.role {
        Role::Admin => {
            let class_id = required_str(params, "classId")?;
            let exists: Option<i64> = conn
                .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| r.get(0))
                .optional()?;
            if exists.is_none() {
                return Err(HandlerErr::new("not_found", "class not found"));
            }
            Ok(class_id)
        }
        _ => lecturer_class(conn, user),
    }
}

fn delete(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let workspace = workspace_path(state)?;
    let user = require_user(conn, params)?;
    let class_id = deletable_class(conn, &user, params)?;

    let assignment_ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id FROM assignments WHERE class_id = ?")?;
        let rows = stmt
            .query_map([&class_id], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;

    // Dependency order; there is no ON DELETE CASCADE.
    let steps: [(&str, &str); 7] = [
        ("users", "UPDATE users SET class_id = NULL WHERE class_id = ?"),
        ("schedules", "DELETE FROM schedules WHERE class_id = ?"),
        (
            "submissions",
            "DELETE FROM submissions
             WHERE assignment_id IN (SELECT id FROM assignments WHERE class_id = ?)",
        ),
        ("assignments", "DELETE FROM assignments WHERE class_id = ?"),
        (
            "attendance_records",
            "DELETE FROM attendance_records
             WHERE session_id IN (SELECT id FROM attendance_sessions WHERE class_id = ?)",
        ),
        (
            "attendance_sessions",
            "DELETE FROM attendance_sessions WHERE class_id = ?",
        ),
        ("classes", "DELETE FROM classes WHERE id = ?"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&class_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": table })));
        }
    }
    tx.commit().map_err(db_err("db_tx_failed"))?;

    // Files go after the rows are gone; a failure here leaves orphans only.
    let mut blob_errors = 0;
    for prefix in std::iter::once(format!("assignments/{class_id}"))
        .chain(assignment_ids.iter().map(|a| format!("submissions/{a}")))
    {
        if let Err(e) = blob::remove_prefix(conn, workspace, &prefix) {
            blob_errors += 1;
            tracing::warn!(%prefix, error = %e, "failed to remove class files");
        }
    }

    tracing::info!(%class_id, actor = %user.id, "class deleted");
    Ok(json!({ "deleted": true, "classId": class_id, "blobErrors": blob_errors }))
}

fn get(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    let class_id = member_class(conn, &user)?;
    let class = class_json(conn, &class_id)?;
    Ok(json!({ "class": class }))
}

fn list(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    require_role(&user, &[Role::Admin])?;

    let mut stmt = conn.prepare(
        "SELECT c.id, c.name, c.code, COALESCE(u.full_name, ''), c.created_at,
           (SELECT COUNT(*) FROM users s WHERE s.class_id = c.id AND s.role = 'student')
         FROM classes c
         LEFT JOIN users u ON u.id = c.lecturer_id
         ORDER BY c.created_at DESC, c.name",
    )?;
    let classes = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
                "lecturerName": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?,
                "studentCount": r.get::<_, i64>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classes": classes }))
}

fn students(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    let class_id = lecturer_class(conn, &user)?;

    let mut stmt = conn.prepare(
        "SELECT id, username, full_name, email
         FROM users
         WHERE class_id = ? AND role = 'student'
         ORDER BY full_name, id",
    )?;
    let students = stmt
        .query_map([&class_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "username": r.get::<_, String>(1)?,
                "fullName": r.get::<_, String>(2)?,
                "email": r.get::<_, String>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let submission_total = count(
        conn,
        "SELECT COUNT(*) FROM submissions
         WHERE assignment_id IN (SELECT id FROM assignments WHERE class_id = ?)",
        &class_id,
    )?;
    Ok(json!({ "students": students, "submissionTotal": submission_total }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "classes.create" => create(state, &req.params),
        "classes.join" => join(state, &req.params),
        "classes.exit" => exit(state, &req.params),
        "classes.delete" => delete(state, &req.params),
        "classes.get" => get(state, &req.params),
        "classes.list" => list(state, &req.params),
        "classes.students" => students(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
