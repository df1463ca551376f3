use crate::auth::{now_rfc3339, Role};
use crate::blob;
use crate::ipc::helpers::{
    db_conn, db_err, lecturer_class, member_class, optional_str, require_role, require_user,
    required_str, respond, workspace_path, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM[:SS]` (UTC) or a bare date (end of day UTC).
pub fn parse_due_date(raw: &str) -> Result<DateTime<Utc>, HandlerErr> {
    let t = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(t, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Some(end_of_day) = NaiveDate::parse_from_str(t, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(23, 59, 59))
    {
        return Ok(end_of_day.and_utc());
    }
    Err(HandlerErr::new("bad_params", "dueDate is not a recognised date")
        .with_details(json!({ "dueDate": raw })))
}

fn source_file(params: &serde_json::Value, key: &str) -> Result<Option<PathBuf>, HandlerErr> {
    let Some(raw) = optional_str(params, key)? else {
        return Ok(None);
    };
    let p = PathBuf::from(raw);
    if !p.is_file() {
        return Err(HandlerErr::new("bad_params", format!("{} is not a readable file", key))
            .with_details(json!({ key: p.to_string_lossy() })));
    }
    Ok(Some(p))
}

struct AssignmentRow {
    class_id: String,
    instructions_url: Option<String>,
}

fn find_assignment(conn: &Connection, assignment_id: &str) -> Result<AssignmentRow, HandlerErr> {
    conn.query_row(
        "SELECT class_id, instructions_url FROM assignments WHERE id = ?",
        [assignment_id],
        |r| {
            Ok(AssignmentRow {
                class_id: r.get(0)?,
                instructions_url: r.get(1)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| HandlerErr::new("not_found", "assignment not found"))
}

/// Runs the row insert that references a freshly stored blob. If the insert
/// fails the blob is removed again so no file outlives its row.
fn insert_with_blob<F>(
    conn: &Connection,
    workspace: &Path,
    blob_url: Option<&str>,
    insert: F,
) -> Result<(), HandlerErr>
where
    F: FnOnce(&Connection) -> rusqlite::Result<usize>,
{
    let Err(e) = insert(conn) else {
        return Ok(());
    };
    if let Some(url) = blob_url {
        if let Err(cleanup) = blob::remove(conn, workspace, url) {
            tracing::warn!(%url, error = %cleanup, "failed to discard orphaned blob");
        }
    }
    Err(db_err("db_insert_failed")(e))
}

fn create_assignment(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let workspace = workspace_path(state)?;
    let user = require_user(conn, params)?;
    let class_id = lecturer_class(conn, &user)?;

    let title = required_str(params, "title")?;
    let due = parse_due_date(&required_str(params, "dueDate")?)?;
    let instructions = source_file(params, "instructionsPath")?;

    let instructions_url = match instructions {
        Some(src) => {
            let path = format!("assignments/{}/{}", class_id, Uuid::new_v4());
            let content_type = optional_str(params, "contentType")?;
            let meta = blob::put(conn, workspace, &path, &src, content_type.as_deref())
                .map_err(|e| HandlerErr::new("io_failed", format!("{e:#}")))?;
            Some(meta.url)
        }
        None => None,
    };

    let assignment_id = Uuid::new_v4().to_string();
    insert_with_blob(conn, workspace, instructions_url.as_deref(), |c| {
        c.execute(
            "INSERT INTO assignments(id, class_id, title, due_date, instructions_url, created_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                &assignment_id,
                &class_id,
                &title,
                due.to_rfc3339(),
                &instructions_url,
                now_rfc3339(),
            ),
        )
    })?;
    tracing::info!(%assignment_id, %class_id, "assignment created");
    Ok(json!({
        "assignmentId": assignment_id,
        "dueDate": due.to_rfc3339(),
        "instructionsUrl": instructions_url,
    }))
}

fn list_assignments(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    let class_id = member_class(conn, &user)?;
    let now = Utc::now();

    let mut stmt = conn.prepare(
        "SELECT a.id, a.title, a.due_date, a.instructions_url, a.created_at,
           (SELECT COUNT(*) FROM submissions s WHERE s.assignment_id = a.id),
           (SELECT COUNT(*) FROM submissions s WHERE s.assignment_id = a.id AND s.score IS NOT NULL),
           sub.id, sub.submission_url, sub.score, sub.feedback, sub.submitted_at, sub.graded_at
         FROM assignments a
         LEFT JOIN submissions sub ON sub.assignment_id = a.id AND sub.student_id = ?
         WHERE a.class_id = ?
         ORDER BY a.due_date ASC, a.title",
    )?;
    let is_student = user.role == Role::Student;
    let assignments = stmt
        .query_map((&user.id, &class_id), |r| {
            let due_raw: String = r.get(2)?;
            let mut item = json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "dueDate": due_raw,
                "instructionsUrl": r.get::<_, Option<String>>(3)?,
                "createdAt": r.get::<_, String>(4)?,
            });
            if is_student {
                let submission = match r.get::<_, Option<String>>(7)? {
                    Some(id) => json!({
                        "id": id,
                        "submissionUrl": r.get::<_, String>(8)?,
                        "score": r.get::<_, Option<f64>>(9)?,
                        "feedback": r.get::<_, Option<String>>(10)?,
                        "submittedAt": r.get::<_, String>(11)?,
                        "gradedAt": r.get::<_, Option<String>>(12)?,
                    }),
                    None => serde_json::Value::Null,
                };
                let past_due = DateTime::parse_from_rfc3339(&due_raw)
                    .map(|d| d.with_timezone(&Utc) < now)
                    .unwrap_or(false);
                item["overdue"] = json!(past_due && submission.is_null());
                item["submission"] = submission;
            } else {
                item["submissionCount"] = json!(r.get::<_, i64>(5)?);
                item["gradedCount"] = json!(r.get::<_, i64>(6)?);
            }
            Ok(item)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classId": class_id, "assignments": assignments }))
}

fn delete_assignment(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let workspace = workspace_path(state)?;
    let user = require_user(conn, params)?;
    let class_id = lecturer_class(conn, &user)?;
    let assignment_id = required_str(params, "assignmentId")?;
    let assignment = find_assignment(conn, &assignment_id)?;
    if assignment.class_id != class_id {
        return Err(HandlerErr::new("forbidden", "assignment belongs to another class"));
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let removed_submissions = tx
        .execute(
            "DELETE FROM submissions WHERE assignment_id = ?",
            [&assignment_id],
        )
        .map_err(db_err("db_delete_failed"))?;
    tx.execute("DELETE FROM assignments WHERE id = ?", [&assignment_id])
        .map_err(db_err("db_delete_failed"))?;
    tx.commit().map_err(db_err("db_tx_failed"))?;

    if let Err(e) = blob::remove_prefix(conn, workspace, &format!("submissions/{assignment_id}")) {
        tracing::warn!(%assignment_id, error = %e, "failed to remove submission files");
    }
    if let Some(url) = assignment.instructions_url {
        if let Err(e) = blob::remove(conn, workspace, &url) {
            tracing::warn!(%assignment_id, error = %e, "failed to remove instructions");
        }
    }

    tracing::info!(%assignment_id, removed_submissions, "assignment deleted");
    Ok(json!({ "deleted": true, "removedSubmissions": removed_submissions }))
}

fn submit(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let workspace = workspace_path(state)?;
    let user = require_user(conn, params)?;
    require_role(&user, &[Role::Student])?;
    let class_id = member_class(conn, &user)?;

    let assignment_id = required_str(params, "assignmentId")?;
    let assignment = find_assignment(conn, &assignment_id)?;
    if assignment.class_id != class_id {
        return Err(HandlerErr::new("forbidden", "assignment belongs to another class"));
    }
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM submissions WHERE assignment_id = ? AND student_id = ?",
            (&assignment_id, &user.id),
            |r| r.get(0),
        )
        .optional()?;
    if let Some(submission_id) = existing {
        return Err(HandlerErr::new("already_submitted", "assignment already submitted")
            .with_details(json!({ "submissionId": submission_id })));
    }
    let Some(src) = source_file(params, "filePath")? else {
        return Err(HandlerErr::new("bad_params", "missing filePath"));
    };

    let path = format!("submissions/{}/{}/{}", assignment_id, user.id, Uuid::new_v4());
    let content_type = optional_str(params, "contentType")?;
    let meta = blob::put(conn, workspace, &path, &src, content_type.as_deref())
        .map_err(|e| HandlerErr::new("io_failed", format!("{e:#}")))?;

    let submission_id = Uuid::new_v4().to_string();
    let submitted_at = now_rfc3339();
    insert_with_blob(conn, workspace, Some(meta.url.as_str()), |c| {
        c.execute(
            "INSERT INTO submissions(id, assignment_id, student_id, submission_url, score, feedback, submitted_at, graded_at)
             VALUES(?, ?, ?, ?, NULL, NULL, ?, NULL)",
            (&submission_id, &assignment_id, &user.id, &meta.url, &submitted_at),
        )
    })?;
    tracing::info!(%submission_id, %assignment_id, student = %user.id, "submission received");
    Ok(json!({
        "submissionId": submission_id,
        "submissionUrl": meta.url,
        "submittedAt": submitted_at,
    }))
}

fn list_submissions(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    let class_id = lecturer_class(conn, &user)?;
    let assignment_id = required_str(params, "assignmentId")?;
    if find_assignment(conn, &assignment_id)?.class_id != class_id {
        return Err(HandlerErr::new("forbidden", "assignment belongs to another class"));
    }

    let mut stmt = conn.prepare(
        "SELECT s.id, s.student_id, COALESCE(u.full_name, ''), s.submission_url, s.score,
           s.feedback, s.submitted_at, s.graded_at
         FROM submissions s
         LEFT JOIN users u ON u.id = s.student_id
         WHERE s.assignment_id = ?
         ORDER BY u.full_name, s.student_id",
    )?;
    let submissions = stmt
        .query_map([&assignment_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": r.get::<_, String>(2)?,
                "submissionUrl": r.get::<_, String>(3)?,
                "score": r.get::<_, Option<f64>>(4)?,
                "feedback": r.get::<_, Option<String>>(5)?,
                "submittedAt": r.get::<_, String>(6)?,
                "gradedAt": r.get::<_, Option<String>>(7)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "assignmentId": assignment_id, "submissions": submissions }))
}

fn parse_score(params: &serde_json::Value) -> Result<f64, HandlerErr> {
    let Some(score) = params.get("score").and_then(|v| v.as_f64()) else {
        return Err(HandlerErr::new("bad_params", "score must be a number"));
    };
    if !score.is_finite() || !(0.0..=100.0).contains(&score) {
        return Err(HandlerErr::new("bad_params", "score must be between 0 and 100")
            .with_details(json!({ "score": score })));
    }
    Ok(score)
}

fn grade(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    let class_id = lecturer_class(conn, &user)?;
    let submission_id = required_str(params, "submissionId")?;
    let score = parse_score(params)?;
    let feedback = optional_str(params, "feedback")?;

    let owner: Option<String> = conn
        .query_row(
            "SELECT a.class_id
             FROM submissions s
             JOIN assignments a ON a.id = s.assignment_id
             WHERE s.id = ?",
            [&submission_id],
            |r| r.get(0),
        )
        .optional()?;
    match owner {
        None => return Err(HandlerErr::new("not_found", "submission not found")),
        Some(c) if c != class_id => {
            return Err(HandlerErr::new("forbidden", "submission belongs to another class"))
        }
        Some(_) => {}
    }

    let graded_at = now_rfc3339();
    conn.execute(
        "UPDATE submissions SET score = ?, feedback = ?, graded_at = ? WHERE id = ?",
        (score, &feedback, &graded_at, &submission_id),
    )
    .map_err(db_err("db_update_failed"))?;
    tracing::info!(%submission_id, score, "submission graded");
    Ok(json!({
        "submissionId": submission_id,
        "score": score,
        "feedback": feedback,
        "gradedAt": graded_at,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "assignments.create" => create_assignment(state, &req.params),
        "assignments.list" => list_assignments(state, &req.params),
        "assignments.delete" => delete_assignment(state, &req.params),
        "submissions.submit" => submit(state, &req.params),
        "submissions.list" => list_submissions(state, &req.params),
        "submissions.grade" => grade(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_date_formats() {
        let bare = parse_due_date("2026-03-01").ok().expect("bare date");
        assert_eq!(bare.to_rfc3339(), "2026-03-01T23:59:59+00:00");
        let local = parse_due_date("2026-03-01T09:15").ok().expect("datetime-local");
        assert_eq!(local.to_rfc3339(), "2026-03-01T09:15:00+00:00");
        let zoned = parse_due_date("2026-03-01T10:00:00+02:00").ok().expect("rfc3339");
        assert_eq!(zoned.to_rfc3339(), "2026-03-01T08:00:00+00:00");
        assert!(parse_due_date("next tuesday").is_err());
    }

    #[test]
    fn score_bounds() {
        assert!(parse_score(&json!({ "score": 0 })).is_ok());
        assert!(parse_score(&json!({ "score": 100.0 })).is_ok());
        assert!(parse_score(&json!({ "score": 100.5 })).is_err());
        assert!(parse_score(&json!({ "score": -1 })).is_err());
        assert!(parse_score(&json!({ "score": "90" })).is_err());
    }

    #[test]
    fn failed_insert_discards_stored_blob() {
        let ws = std::env::temp_dir().join(format!("classroomd-coursework-{}", Uuid::new_v4()));
        let conn = crate::db::open_db(&ws).expect("open workspace db");
        let src = ws.join("essay.txt");
        std::fs::write(&src, b"draft").expect("write source");
        let meta = blob::put(&conn, &ws, "submissions/missing/s1/x", &src, None).expect("put");

        // No such assignment or student, so the foreign keys reject the row.
        let err = insert_with_blob(&conn, &ws, Some(meta.url.as_str()), |c| {
            c.execute(
                "INSERT INTO submissions(id, assignment_id, student_id, submission_url, submitted_at)
                 VALUES('sub1', 'missing', 's1', ?, '2026-01-01T00:00:00+00:00')",
                [&meta.url],
            )
        })
        .expect_err("insert must fail");
        assert_eq!(err.code, "db_insert_failed");
        assert!(blob::get(&conn, &meta.url).expect("get").is_none());
        assert!(!blob::disk_path(&ws, &meta.path).exists());

        let kept = blob::put(&conn, &ws, "assignments/c1/y", &src, None).expect("put");
        assert!(insert_with_blob(&conn, &ws, Some(kept.url.as_str()), |_| Ok(1)).is_ok());
        assert!(blob::get(&conn, &kept.url).expect("get").is_some());

        drop(conn);
        let _ = std::fs::remove_dir_all(ws);
    }
}
