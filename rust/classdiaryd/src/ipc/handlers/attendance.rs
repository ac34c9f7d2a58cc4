use crate::calc::{self, SchoolVariant};
use crate::db;
use crate::ipc::error::{db_err, sql_err, HandlerErr};
use crate::ipc::helpers::{
    ensure_lesson, ensure_student, ensure_subject, get_optional_str, get_required_str,
    parse_write_context, require_modify, with_workspace,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

fn parse_lesson_date(raw: &str) -> Result<String, HandlerErr> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| HandlerErr::bad_params(format!("date must be YYYY-MM-DD, got {:?}", raw)))
}

/// Records a lesson and marks every student on the roster present, inactive
/// ones included. Corrections go through `attendance.setPresence` afterwards.
fn lessons_create(conn: &Connection, _: SchoolVariant, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = parse_write_context(params)?;
    let subject_id = get_required_str(params, "subjectId")?;
    let date = parse_lesson_date(&get_required_str(params, "date")?)?;
    let content = get_optional_str(params, "content")?;
    ensure_subject(conn, &subject_id)?;

    let lesson_id = Uuid::new_v4().to_string();
    let now = db::now_stamp();
    let tx = conn
        .unchecked_transaction()
        .map_err(sql_err("db_tx_failed"))?;
    tx.execute(
        "INSERT INTO lessons(id, subject_id, lesson_date, content, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&lesson_id, &subject_id, &date, content.as_deref(), &now),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "lessons" }))
    })?;
    let marked = tx
        .execute(
            "INSERT INTO attendance(lesson_id, student_id, present, updated_at)
             SELECT ?, id, 1, ? FROM students",
            (&lesson_id, &now),
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "attendance" }))
        })?;
    tx.commit().map_err(sql_err("db_commit_failed"))?;

    tracing::info!(
        actor = %ctx.actor_id,
        lesson = %lesson_id,
        subject = %subject_id,
        date = %date,
        marked,
        "lesson recorded"
    );
    Ok(json!({ "lessonId": lesson_id, "date": date, "markedPresent": marked }))
}

fn lessons_list(conn: &Connection, _: SchoolVariant, params: &Value) -> Result<Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    ensure_subject(conn, &subject_id)?;
    let mut stmt = conn
        .prepare(
            "SELECT l.id, l.lesson_date, l.content,
                    COALESCE(SUM(CASE WHEN a.present = 1 THEN 1 ELSE 0 END), 0),
                    COUNT(a.student_id)
             FROM lessons l
             LEFT JOIN attendance a ON a.lesson_id = l.id
             WHERE l.subject_id = ?
             GROUP BY l.id
             ORDER BY l.lesson_date, l.created_at",
        )
        .map_err(sql_err("db_query_failed"))?;
    let lessons = stmt
        .query_map([&subject_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "date": row.get::<_, String>(1)?,
                "content": row.get::<_, Option<String>>(2)?,
                "presentCount": row.get::<_, i64>(3)?,
                "rosterCount": row.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(sql_err("db_query_failed"))?;
    Ok(json!({ "subjectId": subject_id, "lessons": lessons }))
}

fn resolve_lesson(conn: &Connection, params: &Value) -> Result<String, HandlerErr> {
    if let Some(lesson_id) = get_optional_str(params, "lessonId")? {
        ensure_lesson(conn, &lesson_id)?;
        return Ok(lesson_id);
    }
    let subject_id = get_required_str(params, "subjectId")
        .map_err(|_| HandlerErr::bad_params("missing lessonId or subjectId+date"))?;
    let date = parse_lesson_date(&get_required_str(params, "date")?)?;
    ensure_subject(conn, &subject_id)?;
    // Several lessons on one date open in creation order.
    conn.query_row(
        "SELECT id FROM lessons WHERE subject_id = ? AND lesson_date = ?
         ORDER BY created_at LIMIT 1",
        (&subject_id, &date),
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(sql_err("db_query_failed"))?
    .ok_or_else(|| {
        HandlerErr::not_found("no lesson recorded for that date")
            .with_details(json!({ "subjectId": subject_id, "date": date }))
    })
}

fn attendance_lesson_open(
    conn: &Connection,
    _: SchoolVariant,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let lesson_id = resolve_lesson(conn, params)?;
    let (subject_id, date, content): (String, String, Option<String>) = conn
        .query_row(
            "SELECT subject_id, lesson_date, content FROM lessons WHERE id = ?",
            [&lesson_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .map_err(sql_err("db_query_failed"))?;

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, s.enrollment_no, s.active, a.present
             FROM students s
             LEFT JOIN attendance a ON a.student_id = s.id AND a.lesson_id = ?
             ORDER BY s.sort_order",
        )
        .map_err(sql_err("db_query_failed"))?;
    let rows = stmt
        .query_map([&lesson_id], |row| {
            let active: i64 = row.get(3)?;
            let present: Option<i64> = row.get(4)?;
            Ok(json!({
                "studentId": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "enrollmentNo": row.get::<_, String>(2)?,
                "active": active != 0,
                "present": present == Some(1),
                "recorded": present.is_some(),
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(sql_err("db_query_failed"))?;

    Ok(json!({
        "lesson": {
            "id": lesson_id,
            "subjectId": subject_id,
            "date": date,
            "content": content,
        },
        "rows": rows,
    }))
}

fn attendance_set_presence(
    conn: &Connection,
    _: SchoolVariant,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let ctx = parse_write_context(params)?;
    let lesson_id = get_required_str(params, "lessonId")?;
    let student_id = get_required_str(params, "studentId")?;
    let present = params
        .get("present")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::bad_params("present must be boolean"))?;
    ensure_lesson(conn, &lesson_id)?;
    ensure_student(conn, &student_id)?;
    require_modify(&ctx, "attendance")?;

    let previous: Option<i64> = conn
        .query_row(
            "SELECT present FROM attendance WHERE lesson_id = ? AND student_id = ?",
            (&lesson_id, &student_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(sql_err("db_query_failed"))?;
    conn.execute(
        "INSERT INTO attendance(lesson_id, student_id, present, updated_at)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(lesson_id, student_id) DO UPDATE SET
           present = excluded.present,
           updated_at = excluded.updated_at",
        (&lesson_id, &student_id, if present { 1 } else { 0 }, db::now_stamp()),
    )
    .map_err(|e| {
        HandlerErr::new("db_update_failed", e.to_string())
            .with_details(json!({ "table": "attendance" }))
    })?;
    Ok(json!({
        "ok": true,
        "present": present,
        "previous": previous.map(|p| p == 1),
    }))
}

fn attendance_tally(conn: &Connection, _: SchoolVariant, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    ensure_student(conn, &student_id)?;
    ensure_subject(conn, &subject_id)?;
    let tally =
        db::attendance_tally(conn, &student_id, &subject_id).map_err(db_err("db_query_failed"))?;
    let outcome = calc::evaluate_attendance(tally);
    Ok(json!({
        "studentId": student_id,
        "subjectId": subject_id,
        "present": outcome.present,
        "total": outcome.total,
        "percentage": outcome.percentage,
        "passed": outcome.passed,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "lessons.create" => Some(with_workspace(state, req, lessons_create)),
        "lessons.list" => Some(with_workspace(state, req, lessons_list)),
        "attendance.lessonOpen" => Some(with_workspace(state, req, attendance_lesson_open)),
        "attendance.setPresence" => Some(with_workspace(state, req, attendance_set_presence)),
        "attendance.tally" => Some(with_workspace(state, req, attendance_tally)),
        _ => None,
    }
}
