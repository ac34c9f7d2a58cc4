use crate::calc::SchoolVariant;
use crate::db;
use crate::ipc::error::{db_err, sql_err, HandlerErr};
use crate::ipc::helpers::{
    ensure_student, get_required_str, parse_string_max, parse_write_context, require_modify,
    with_workspace,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

const NAME_MAX: usize = 120;
const ENROLLMENT_MAX: usize = 40;

fn students_list(conn: &Connection, _: SchoolVariant, _: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, enrollment_no, active, sort_order
             FROM students
             ORDER BY sort_order",
        )
        .map_err(sql_err("db_query_failed"))?;
    let students = stmt
        .query_map([], |row| {
            let active: i64 = row.get(3)?;
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "enrollmentNo": row.get::<_, String>(2)?,
                "active": active != 0,
                "sortOrder": row.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(sql_err("db_query_failed"))?;
    Ok(json!({ "students": students }))
}

fn enrollment_taken(
    conn: &Connection,
    enrollment_no: &str,
    except_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    let holder: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE enrollment_no = ?",
            [enrollment_no],
            |r| r.get(0),
        )
        .optional()
        .map_err(sql_err("db_query_failed"))?;
    Ok(match holder {
        Some(id) => except_id != Some(id.as_str()),
        None => false,
    })
}

fn students_create(conn: &Connection, _: SchoolVariant, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = parse_write_context(params)?;
    let name = parse_string_max(
        params.get("name").unwrap_or(&Value::Null),
        "name",
        NAME_MAX,
    )?;
    let enrollment_no = parse_string_max(
        params.get("enrollmentNo").unwrap_or(&Value::Null),
        "enrollmentNo",
        ENROLLMENT_MAX,
    )?;
    let active = params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    if enrollment_taken(conn, &enrollment_no, None)? {
        return Err(HandlerErr::new("conflict", "enrollment number already in use")
            .with_details(json!({ "enrollmentNo": enrollment_no })));
    }

    let sort_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students",
            [],
            |r| r.get(0),
        )
        .map_err(sql_err("db_query_failed"))?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, name, enrollment_no, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &name,
            &enrollment_no,
            if active { 1 } else { 0 },
            sort_order,
            db::now_stamp(),
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "students" }))
    })?;
    tracing::info!(actor = %ctx.actor_id, student = %student_id, "student enrolled");
    Ok(json!({ "studentId": student_id, "sortOrder": sort_order }))
}

fn students_update(conn: &Connection, _: SchoolVariant, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = parse_write_context(params)?;
    let student_id = get_required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing patch"));
    };
    ensure_student(conn, &student_id)?;
    require_modify(&ctx, "student")?;

    let name = match patch.get("name") {
        Some(v) => Some(parse_string_max(v, "name", NAME_MAX)?),
        None => None,
    };
    let enrollment_no = match patch.get("enrollmentNo") {
        Some(v) => Some(parse_string_max(v, "enrollmentNo", ENROLLMENT_MAX)?),
        None => None,
    };
    let active = match patch.get("active") {
        Some(v) => Some(
            v.as_bool()
                .ok_or_else(|| HandlerErr::bad_params("active must be boolean"))?,
        ),
        None => None,
    };
    if let Some(no) = enrollment_no.as_deref() {
        if enrollment_taken(conn, no, Some(&student_id))? {
            return Err(HandlerErr::new("conflict", "enrollment number already in use")
                .with_details(json!({ "enrollmentNo": no })));
        }
    }

    conn.execute(
        "UPDATE students SET
           name = COALESCE(?, name),
           enrollment_no = COALESCE(?, enrollment_no),
           active = COALESCE(?, active),
           updated_at = ?
         WHERE id = ?",
        (
            name.as_deref(),
            enrollment_no.as_deref(),
            active.map(|a| if a { 1 } else { 0 }),
            db::now_stamp(),
            &student_id,
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_update_failed", e.to_string())
            .with_details(json!({ "table": "students" }))
    })?;
    Ok(json!({ "ok": true }))
}

fn students_delete(conn: &Connection, _: SchoolVariant, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = parse_write_context(params)?;
    let student_id = get_required_str(params, "studentId")?;
    ensure_student(conn, &student_id)?;
    require_modify(&ctx, "student")?;

    let removed = db::delete_student_cascade(conn, &student_id)
        .map_err(db_err("db_delete_failed"))?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;
    tracing::info!(
        actor = %ctx.actor_id,
        student = %student_id,
        grades = removed.grades,
        attendance = removed.attendance,
        "student removed"
    );
    Ok(json!({
        "ok": true,
        "removed": {
            "grades": removed.grades,
            "attendance": removed.attendance,
        }
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "students.list" => Some(with_workspace(state, req, students_list)),
        "students.create" => Some(with_workspace(state, req, students_create)),
        "students.update" => Some(with_workspace(state, req, students_update)),
        "students.delete" => Some(with_workspace(state, req, students_delete)),
        _ => None,
    }
}
