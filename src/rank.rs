use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Late => "late",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "present" => Some(AttendanceStatus::Present),
            "absent" => Some(AttendanceStatus::Absent),
            "late" => Some(AttendanceStatus::Late),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRef {
    pub id: String,
    pub full_name: String,
}

/// A submission as the calculator sees it: `None` means not graded yet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubmissionScore {
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingWeights {
    pub assignment_weight: f64,
    pub attendance_weight: f64,
    /// Fraction of a present session credited for a late arrival.
    pub late_credit: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            assignment_weight: 0.7,
            attendance_weight: 0.3,
            late_credit: 0.5,
        }
    }
}

impl RankingWeights {
    /// Each value lies in [0, 1] and the two weights sum to 1.
    pub fn validate(&self) -> Result<(), &'static str> {
        let fields = [
            self.assignment_weight,
            self.attendance_weight,
            self.late_credit,
        ];
        if fields.iter().any(|v| !v.is_finite() || !(0.0..=1.0).contains(v)) {
            return Err("weights must be between 0 and 1");
        }
        if (self.assignment_weight + self.attendance_weight - 1.0).abs() > 1e-9 {
            return Err("assignmentWeight and attendanceWeight must sum to 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassTotals {
    pub assignments: usize,
    pub sessions: usize,
}

/// Immutable per-request input. Students appear in the order the source
/// returned them; the calculator does not depend on that order.
#[derive(Debug, Clone, Default)]
pub struct ClassSnapshot {
    pub students: Vec<StudentRef>,
    pub total_assignments: usize,
    pub total_sessions: usize,
    pub submissions_by_student: HashMap<String, Vec<SubmissionScore>>,
    pub records_by_student: HashMap<String, Vec<AttendanceStatus>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayScores {
    pub average_score: i64,
    pub attendance_percentage: i64,
    pub overall_score: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingResult {
    pub rank: usize,
    pub student: StudentRef,
    pub average_score: f64,
    pub attendance_percentage: f64,
    pub overall_score: f64,
    pub submitted_count: usize,
    pub graded_count: usize,
    pub total_assignments: usize,
    pub present_count: usize,
    pub late_count: usize,
    pub total_sessions: usize,
    pub display: DisplayScores,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Standing {
    pub position: usize,
    pub result: RankingResult,
}

/// Half-away-from-zero rounding used for every displayed percentage.
pub fn round_display(x: f64) -> i64 {
    if x.is_finite() {
        x.round() as i64
    } else {
        0
    }
}

fn finite_or_zero(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

pub fn average_score(submissions: &[SubmissionScore]) -> (f64, usize) {
    let graded: Vec<f64> = submissions.iter().filter_map(|s| s.score).collect();
    if graded.is_empty() {
        return (0.0, 0);
    }
    let sum: f64 = graded.iter().sum();
    (finite_or_zero(sum / graded.len() as f64), graded.len())
}

pub fn attendance_percentage(
    records: &[AttendanceStatus],
    total_sessions: usize,
    late_credit: f64,
) -> (f64, usize, usize) {
    let present = records
        .iter()
        .filter(|r| **r == AttendanceStatus::Present)
        .count();
    let late = records
        .iter()
        .filter(|r| **r == AttendanceStatus::Late)
        .count();
    if total_sessions == 0 {
        return (0.0, present, late);
    }
    let credited = present as f64 + late as f64 * late_credit;
    let pct = credited / total_sessions as f64 * 100.0;
    (finite_or_zero(pct), present, late)
}

pub fn compute_student(
    student: &StudentRef,
    submissions: &[SubmissionScore],
    records: &[AttendanceStatus],
    totals: ClassTotals,
    weights: &RankingWeights,
) -> RankingResult {
    let (average, graded_count) = average_score(submissions);
    let (attendance, present_count, late_count) =
        attendance_percentage(records, totals.sessions, weights.late_credit);
    let overall = finite_or_zero(
        average * weights.assignment_weight + attendance * weights.attendance_weight,
    );

    RankingResult {
        rank: 0,
        student: student.clone(),
        average_score: average,
        attendance_percentage: attendance,
        overall_score: overall,
        submitted_count: submissions.len(),
        graded_count,
        total_assignments: totals.assignments,
        present_count,
        late_count,
        total_sessions: totals.sessions,
        display: DisplayScores {
            average_score: round_display(average),
            attendance_percentage: round_display(attendance),
            overall_score: round_display(overall),
        },
    }
}

/// Higher overall first; ties by case-insensitive name, then id.
fn rank_order(a: &RankingResult, b: &RankingResult) -> Ordering {
    b.overall_score
        .partial_cmp(&a.overall_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            a.student
                .full_name
                .to_lowercase()
                .cmp(&b.student.full_name.to_lowercase())
        })
        .then_with(|| a.student.id.cmp(&b.student.id))
}

pub fn compute_rankings(snapshot: &ClassSnapshot, weights: &RankingWeights) -> Vec<RankingResult> {
    let totals = ClassTotals {
        assignments: snapshot.total_assignments,
        sessions: snapshot.total_sessions,
    };

    let mut out: Vec<RankingResult> = snapshot
        .students
        .iter()
        .map(|student| {
            let submissions = snapshot
                .submissions_by_student
                .get(&student.id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let records = snapshot
                .records_by_student
                .get(&student.id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            compute_student(student, submissions, records, totals, weights)
        })
        .collect();

    out.sort_by(rank_order);
    for (i, r) in out.iter_mut().enumerate() {
        r.rank = i + 1;
    }
    out
}

pub fn standing(rankings: &[RankingResult], student_id: &str) -> Option<Standing> {
    rankings
        .iter()
        .position(|r| r.student.id == student_id)
        .map(|i| Standing {
            position: i + 1,
            result: rankings[i].clone(),
        })
}
