use crate::calc::{self, AcademicStatus, AttendanceOutcome, AttendanceTally, SchoolVariant, VariantRules};
use crate::db;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Query(String),
}

impl ReportError {
    /// Error code carried in the IPC envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Query(_) => "db_query_failed",
        }
    }
}

fn query_err(e: impl std::fmt::Display) -> ReportError {
    ReportError::Query(e.to_string())
}

#[derive(Debug, Clone, Default)]
pub struct ReportFilters {
    pub student_id: Option<String>,
    pub subject_id: Option<String>,
}

pub struct ReportContext<'a> {
    pub conn: &'a Connection,
    pub variant: SchoolVariant,
}

#[derive(Debug, Clone)]
pub struct StudentRef {
    pub id: String,
    pub name: String,
    pub enrollment_no: String,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct SubjectRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    pub student_id: String,
    pub student_name: String,
    pub enrollment_no: String,
    pub active: bool,
    pub subject_id: String,
    pub subject_name: String,
    /// Every term label of the variant; `None` where nothing is recorded.
    pub terms: BTreeMap<String, Option<f64>>,
    pub exam: Option<f64>,
    pub recorded_terms: usize,
    pub partial_mean: f64,
    pub final_grade: f64,
    pub attendance: AttendanceOutcome,
    pub grade_status: AcademicStatus,
    pub overall_status: AcademicStatus,
    pub grade_label: String,
    pub overall_label: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalReport {
    pub variant: SchoolVariant,
    pub term_labels: Vec<&'static str>,
    pub exam_label: Option<&'static str>,
    pub rows: Vec<ReportRow>,
    /// Row count per overall status key.
    pub totals: BTreeMap<&'static str, usize>,
}

/// Adjudicates one (student, subject) pair from what the store holds for it.
pub fn build_row(
    rules: &VariantRules,
    student: &StudentRef,
    subject: &SubjectRef,
    grades: &BTreeMap<String, f64>,
    tally: AttendanceTally,
) -> ReportRow {
    let adjudication = calc::adjudicate_recorded(rules, grades);
    let attendance = calc::evaluate_attendance(tally);
    let overall = calc::combine_status(adjudication.status, attendance.passed);

    let terms = rules
        .term_labels
        .iter()
        .map(|label| (label.to_string(), grades.get(*label).copied()))
        .collect();
    let exam = rules.exam_label().and_then(|label| grades.get(label).copied());

    ReportRow {
        student_id: student.id.clone(),
        student_name: student.name.clone(),
        enrollment_no: student.enrollment_no.clone(),
        active: student.active,
        subject_id: subject.id.clone(),
        subject_name: subject.name.clone(),
        terms,
        exam,
        recorded_terms: adjudication.recorded_terms,
        partial_mean: adjudication.partial_mean,
        final_grade: adjudication.final_grade,
        attendance,
        grade_status: adjudication.status,
        overall_status: overall,
        grade_label: adjudication.status.to_string(),
        overall_label: overall.to_string(),
    }
}

fn load_students(conn: &Connection, only: Option<&str>) -> Result<Vec<StudentRef>, ReportError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, enrollment_no, active FROM students
             WHERE (?1 IS NULL OR id = ?1)
             ORDER BY sort_order",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map([only], |r| {
            Ok(StudentRef {
                id: r.get(0)?,
                name: r.get(1)?,
                enrollment_no: r.get(2)?,
                active: r.get::<_, i64>(3)? != 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(rows)
}

fn load_subjects(conn: &Connection, only: Option<&str>) -> Result<Vec<SubjectRef>, ReportError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name FROM subjects
             WHERE (?1 IS NULL OR id = ?1)
             ORDER BY sort_order",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map([only], |r| {
            Ok(SubjectRef {
                id: r.get(0)?,
                name: r.get(1)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(rows)
}

/// Builds the final report over every student × subject pair, including
/// pairs with no grades or lessons at all.
pub fn compute_final_report(
    ctx: &ReportContext<'_>,
    filters: &ReportFilters,
) -> Result<FinalReport, ReportError> {
    let rules = ctx.variant.rules();
    let students = load_students(ctx.conn, filters.student_id.as_deref())?;
    let subjects = load_subjects(ctx.conn, filters.subject_id.as_deref())?;
    if filters.student_id.is_some() && students.is_empty() {
        return Err(ReportError::NotFound("student"));
    }
    if filters.subject_id.is_some() && subjects.is_empty() {
        return Err(ReportError::NotFound("subject"));
    }

    let grades = db::all_grades(ctx.conn).map_err(query_err)?;
    let lessons = db::lesson_counts_by_subject(ctx.conn).map_err(query_err)?;
    let presence = db::presence_counts(ctx.conn).map_err(query_err)?;
    let no_grades = BTreeMap::new();

    let mut rows = Vec::with_capacity(students.len() * subjects.len());
    let mut totals: BTreeMap<&'static str, usize> = BTreeMap::new();
    for student in &students {
        for subject in &subjects {
            let key = (student.id.clone(), subject.id.clone());
            let pair_grades = grades.get(&key).unwrap_or(&no_grades);
            let tally = AttendanceTally::new(
                presence.get(&key).copied().unwrap_or(0),
                lessons.get(&subject.id).copied().unwrap_or(0),
            );
            let row = build_row(rules, student, subject, pair_grades, tally);
            *totals.entry(row.overall_status.key()).or_insert(0) += 1;
            rows.push(row);
        }
    }

    Ok(FinalReport {
        variant: ctx.variant,
        term_labels: rules.term_labels.to_vec(),
        exam_label: rules.exam_label(),
        rows,
        totals,
    })
}

pub fn compute_student_subject(
    ctx: &ReportContext<'_>,
    student_id: &str,
    subject_id: &str,
) -> Result<ReportRow, ReportError> {
    let student = load_students(ctx.conn, Some(student_id))?
        .into_iter()
        .next()
        .ok_or_else(|| ReportError::NotFound("student"))?;
    let subject = ctx
        .conn
        .query_row(
            "SELECT id, name FROM subjects WHERE id = ?",
            [subject_id],
            |r| {
                Ok(SubjectRef {
                    id: r.get(0)?,
                    name: r.get(1)?,
                })
            },
        )
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| ReportError::NotFound("subject"))?;

    let grades = db::grades_for(ctx.conn, student_id, subject_id).map_err(query_err)?;
    let tally = db::attendance_tally(ctx.conn, student_id, subject_id).map_err(query_err)?;
    Ok(build_row(
        ctx.variant.rules(),
        &student,
        &subject,
        &grades,
        tally,
    ))
}
