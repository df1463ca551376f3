//! Read-only access to the rows the ranking calculator needs.
//!
//! Handlers build a [`ClassSnapshot`] through [`load_snapshot`] once per
//! request; the calculator never touches the connection.

use crate::rank::{AttendanceStatus, ClassSnapshot, StudentRef, SubmissionScore};
use rusqlite::Connection;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("unknown attendance status {status:?} on record {record_id}")]
    InvalidStatus { record_id: String, status: String },
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Query(_) => "db_query_failed",
            StoreError::InvalidStatus { .. } => "db_corrupt",
        }
    }
}

pub trait RankingSource {
    fn students_in_class(&self, class_id: &str) -> Result<Vec<StudentRef>, StoreError>;
    fn assignment_count(&self, class_id: &str) -> Result<usize, StoreError>;
    fn session_count(&self, class_id: &str) -> Result<usize, StoreError>;
    /// Submissions the student made to assignments of `class_id` only.
    fn submissions_for_student(
        &self,
        class_id: &str,
        student_id: &str,
    ) -> Result<Vec<SubmissionScore>, StoreError>;
    /// Records the student holds in attendance sessions of `class_id` only.
    fn records_for_student(
        &self,
        class_id: &str,
        student_id: &str,
    ) -> Result<Vec<AttendanceStatus>, StoreError>;
}

pub struct SqliteStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn count(&self, sql: &str, class_id: &str) -> Result<usize, StoreError> {
        let n: i64 = self.conn.query_row(sql, [class_id], |r| r.get(0))?;
        Ok(n.max(0) as usize)
    }
}

impl RankingSource for SqliteStore<'_> {
    fn students_in_class(&self, class_id: &str) -> Result<Vec<StudentRef>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, full_name
             FROM users
             WHERE class_id = ? AND role = 'student'
             ORDER BY full_name, id",
        )?;
        let rows = stmt
            .query_map([class_id], |r| {
                Ok(StudentRef {
                    id: r.get(0)?,
                    full_name: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn assignment_count(&self, class_id: &str) -> Result<usize, StoreError> {
        self.count("SELECT COUNT(*) FROM assignments WHERE class_id = ?", class_id)
    }

    fn session_count(&self, class_id: &str) -> Result<usize, StoreError> {
        self.count(
            "SELECT COUNT(*) FROM attendance_sessions WHERE class_id = ?",
            class_id,
        )
    }

    fn submissions_for_student(
        &self,
        class_id: &str,
        student_id: &str,
    ) -> Result<Vec<SubmissionScore>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT s.score
             FROM submissions s
             JOIN assignments a ON a.id = s.assignment_id
             WHERE a.class_id = ? AND s.student_id = ?",
        )?;
        let rows = stmt
            .query_map([class_id, student_id], |r| {
                Ok(SubmissionScore {
                    score: r.get::<_, Option<f64>>(0)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn records_for_student(
        &self,
        class_id: &str,
        student_id: &str,
    ) -> Result<Vec<AttendanceStatus>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT r.id, r.status
             FROM attendance_records r
             JOIN attendance_sessions x ON x.id = r.session_id
             WHERE x.class_id = ? AND r.student_id = ?",
        )?;
        let raw = stmt
            .query_map([class_id, student_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(record_id, status)| {
                AttendanceStatus::parse(&status)
                    .ok_or(StoreError::InvalidStatus { record_id, status })
            })
            .collect()
    }
}

pub fn load_snapshot<S: RankingSource + ?Sized>(
    source: &S,
    class_id: &str,
) -> Result<ClassSnapshot, StoreError> {
    let students = source.students_in_class(class_id)?;
    let total_assignments = source.assignment_count(class_id)?;
    let total_sessions = source.session_count(class_id)?;

    let mut submissions_by_student = HashMap::with_capacity(students.len());
    let mut records_by_student = HashMap::with_capacity(students.len());
    for s in &students {
        submissions_by_student.insert(
            s.id.clone(),
            source.submissions_for_student(class_id, &s.id)?,
        );
        records_by_student.insert(s.id.clone(), source.records_for_student(class_id, &s.id)?);
    }

    Ok(ClassSnapshot {
        students,
        total_assignments,
        total_sessions,
        submissions_by_student,
        records_by_student,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rank::{compute_rankings, RankingWeights};

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open memory db");
        conn.execute_batch(
            "CREATE TABLE users(id TEXT PRIMARY KEY, full_name TEXT, role TEXT, class_id TEXT);
             CREATE TABLE assignments(id TEXT PRIMARY KEY, class_id TEXT);
             CREATE TABLE attendance_sessions(id TEXT PRIMARY KEY, class_id TEXT);
             CREATE TABLE submissions(id TEXT PRIMARY KEY, assignment_id TEXT, student_id TEXT, score REAL);
             CREATE TABLE attendance_records(id TEXT PRIMARY KEY, session_id TEXT, student_id TEXT, status TEXT);",
        )
        .expect("schema");
        conn
    }

    #[test]
    fn snapshot_reads_only_class_students() {
        let conn = memory_db();
        conn.execute_batch(
            "INSERT INTO users VALUES('s1','Zoe','student','c1');
             INSERT INTO users VALUES('s2','Amy','student','c1');
             INSERT INTO users VALUES('l1','Lecturer','lecturer','c1');
             INSERT INTO users VALUES('s3','Other','student','c2');
             INSERT INTO assignments VALUES('a1','c1');
             INSERT INTO assignments VALUES('a2','c1');
             INSERT INTO attendance_sessions VALUES('x1','c1');
             INSERT INTO submissions VALUES('sub1','a1','s1',90.0);
             INSERT INTO submissions VALUES('sub2','a2','s1',NULL);
             INSERT INTO attendance_records VALUES('r1','x1','s1','present');
             INSERT INTO attendance_records VALUES('r2','x1','s2','late');",
        )
        .expect("seed");

        let snap = load_snapshot(&SqliteStore::new(&conn), "c1").expect("snapshot");
        let names: Vec<&str> = snap.students.iter().map(|s| s.full_name.as_str()).collect();
        assert_eq!(names, vec!["Amy", "Zoe"]);
        assert_eq!(snap.total_assignments, 2);
        assert_eq!(snap.total_sessions, 1);
        assert_eq!(snap.submissions_by_student["s1"].len(), 2);
        assert!(snap.submissions_by_student["s2"].is_empty());
        assert_eq!(snap.records_by_student["s2"], vec![AttendanceStatus::Late]);

        let out = compute_rankings(&snap, &RankingWeights::default());
        // s1: 90*0.7 + 100*0.3 = 93; s2: 0 + 50*0.3 = 15
        assert_eq!(out[0].student.id, "s1");
        assert_eq!(out[0].display.overall_score, 93);
        assert_eq!(out[1].display.overall_score, 15);
    }

    #[test]
    fn unknown_status_is_reported() {
        let conn = memory_db();
        conn.execute_batch(
            "INSERT INTO users VALUES('s1','Zoe','student','c1');
             INSERT INTO attendance_sessions VALUES('x1','c1');
             INSERT INTO attendance_records VALUES('r1','x1','s1','excused');",
        )
        .expect("seed");
        let err = load_snapshot(&SqliteStore::new(&conn), "c1").expect_err("bad status");
        assert_eq!(err.code(), "db_corrupt");
    }

    #[test]
    fn rows_from_a_previous_class_stay_out() {
        let conn = memory_db();
        // s1 was graded and present in c2, then moved to c1.
        conn.execute_batch(
            "INSERT INTO users VALUES('s1','Zoe','student','c1');
             INSERT INTO assignments VALUES('old','c2');
             INSERT INTO attendance_sessions VALUES('y1','c2');
             INSERT INTO attendance_sessions VALUES('y2','c2');
             INSERT INTO attendance_sessions VALUES('y3','c2');
             INSERT INTO attendance_sessions VALUES('x1','c1');
             INSERT INTO submissions VALUES('sub1','old','s1',100.0);
             INSERT INTO attendance_records VALUES('r1','y1','s1','present');
             INSERT INTO attendance_records VALUES('r2','y2','s1','present');
             INSERT INTO attendance_records VALUES('r3','y3','s1','present');
             INSERT INTO attendance_records VALUES('r4','x1','s1','absent');",
        )
        .expect("seed");

        let snap = load_snapshot(&SqliteStore::new(&conn), "c1").expect("snapshot");
        assert!(snap.submissions_by_student["s1"].is_empty());
        assert_eq!(snap.records_by_student["s1"], vec![AttendanceStatus::Absent]);

        let out = compute_rankings(&snap, &RankingWeights::default());
        assert_eq!(out[0].attendance_percentage, 0.0);
        assert_eq!(out[0].average_score, 0.0);
        assert_eq!(out[0].overall_score, 0.0);
    }
}
