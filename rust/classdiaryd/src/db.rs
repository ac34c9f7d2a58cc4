use crate::calc::{AttendanceTally, SchoolVariant};
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub const DB_FILE_NAME: &str = "classdiary.sqlite3";

const SCHOOL_SETTINGS_KEY: &str = "school";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace.to_string_lossy()
        )
    })?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            enrollment_no TEXT NOT NULL UNIQUE,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_sort ON students(sort_order)",
        [],
    )?;
    // Workspaces created before roster edits were tracked lack this column.
    if !table_has_column(&conn, "students", "updated_at")? {
        conn.execute("ALTER TABLE students ADD COLUMN updated_at TEXT", [])?;
    }

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lessons(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            lesson_date TEXT NOT NULL,
            content TEXT,
            created_at TEXT,
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lessons_subject_date ON lessons(subject_id, lesson_date)",
        [],
    )?;

    // One presence flag per (lesson, student). Tallies are always recomputed from these rows.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            lesson_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            present INTEGER NOT NULL,
            updated_at TEXT,
            PRIMARY KEY(lesson_id, student_id),
            FOREIGN KEY(lesson_id) REFERENCES lessons(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            term_label TEXT NOT NULL,
            value REAL NOT NULL,
            updated_at TEXT,
            PRIMARY KEY(student_id, subject_id, term_label),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_subject ON grades(subject_id)",
        [],
    )?;

    Ok(conn)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |r| r.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|n| n == column))
}

pub fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(
            serde_json::from_str(&text)
                .with_context(|| format!("settings.{} is not valid JSON", key))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn school_settings(conn: &Connection) -> anyhow::Result<serde_json::Value> {
    Ok(settings_get_json(conn, SCHOOL_SETTINGS_KEY)?.unwrap_or_else(|| serde_json::json!({})))
}

pub fn set_school_settings(conn: &Connection, value: &serde_json::Value) -> anyhow::Result<()> {
    settings_set_json(conn, SCHOOL_SETTINGS_KEY, value)
}

/// Variant pinned to this workspace, if one has been recorded yet.
pub fn school_variant(conn: &Connection) -> anyhow::Result<Option<SchoolVariant>> {
    let school = school_settings(conn)?;
    Ok(school
        .get("variant")
        .and_then(|v| v.as_str())
        .and_then(SchoolVariant::parse))
}

pub fn grades_for(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
) -> anyhow::Result<BTreeMap<String, f64>> {
    let mut stmt = conn.prepare(
        "SELECT term_label, value FROM grades WHERE student_id = ? AND subject_id = ?",
    )?;
    let rows = stmt
        .query_map((student_id, subject_id), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().collect())
}

pub fn grade_value(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    term_label: &str,
) -> anyhow::Result<Option<f64>> {
    Ok(conn
        .query_row(
            "SELECT value FROM grades WHERE student_id = ? AND subject_id = ? AND term_label = ?",
            (student_id, subject_id, term_label),
            |r| r.get(0),
        )
        .optional()?)
}

/// Last write wins for a (student, subject, term) key.
pub fn upsert_grade(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    term_label: &str,
    value: f64,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO grades(student_id, subject_id, term_label, value, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject_id, term_label) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at",
        (student_id, subject_id, term_label, value, now_stamp()),
    )?;
    Ok(())
}

pub fn grade_count(conn: &Connection) -> anyhow::Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM grades", [], |r| r.get(0))?)
}

/// `total` is every lesson held for the subject; a lesson without a presence
/// row for the student counts as an absence.
pub fn attendance_tally(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
) -> anyhow::Result<AttendanceTally> {
    let (total, present): (i64, i64) = conn.query_row(
        "SELECT COUNT(l.id),
                COALESCE(SUM(CASE WHEN a.present = 1 THEN 1 ELSE 0 END), 0)
         FROM lessons l
         LEFT JOIN attendance a ON a.lesson_id = l.id AND a.student_id = ?
         WHERE l.subject_id = ?",
        (student_id, subject_id),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    Ok(AttendanceTally::new(to_count(present), to_count(total)))
}

fn to_count(n: i64) -> u32 {
    u32::try_from(n.max(0)).unwrap_or(u32::MAX)
}

/// Grades for every (student, subject) pair that has any, keyed by pair.
pub fn all_grades(
    conn: &Connection,
) -> anyhow::Result<HashMap<(String, String), BTreeMap<String, f64>>> {
    let mut stmt =
        conn.prepare("SELECT student_id, subject_id, term_label, value FROM grades")?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, f64>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out: HashMap<(String, String), BTreeMap<String, f64>> = HashMap::new();
    for (student_id, subject_id, label, value) in rows {
        out.entry((student_id, subject_id))
            .or_default()
            .insert(label, value);
    }
    Ok(out)
}

pub fn lesson_counts_by_subject(conn: &Connection) -> anyhow::Result<HashMap<String, u32>> {
    let mut stmt = conn.prepare("SELECT subject_id, COUNT(*) FROM lessons GROUP BY subject_id")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|(subject_id, n)| (subject_id, to_count(n)))
        .collect())
}

pub fn presence_counts(conn: &Connection) -> anyhow::Result<HashMap<(String, String), u32>> {
    let mut stmt = conn.prepare(
        "SELECT a.student_id, l.subject_id, COUNT(*)
         FROM attendance a
         JOIN lessons l ON l.id = a.lesson_id
         WHERE a.present = 1
         GROUP BY a.student_id, l.subject_id",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|(student_id, subject_id, n)| ((student_id, subject_id), to_count(n)))
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovedCounts {
    pub grades: usize,
    pub attendance: usize,
}

/// Removes a student with every grade and attendance row that references them.
/// Returns `None` when the student does not exist.
pub fn delete_student_cascade(
    conn: &Connection,
    student_id: &str,
) -> anyhow::Result<Option<RemovedCounts>> {
    let tx = conn.unchecked_transaction()?;
    let exists = tx
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some();
    if !exists {
        return Ok(None);
    }
    let grades = tx.execute("DELETE FROM grades WHERE student_id = ?", [student_id])?;
    let attendance = tx.execute("DELETE FROM attendance WHERE student_id = ?", [student_id])?;
    tx.execute("DELETE FROM students WHERE id = ?", [student_id])?;
    tx.commit()?;
    Ok(Some(RemovedCounts { grades, attendance }))
}
