use crate::calc::{self, SchoolVariant};
use crate::db;
use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::helpers::{
    ensure_student, ensure_subject, get_required_str, parse_write_context, require_modify,
    with_workspace,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

fn grades_get(conn: &Connection, variant: SchoolVariant, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    ensure_student(conn, &student_id)?;
    ensure_subject(conn, &subject_id)?;

    let recorded =
        db::grades_for(conn, &student_id, &subject_id).map_err(db_err("db_query_failed"))?;
    let labels = variant.rules().writable_labels();
    let mut grades = Map::new();
    for label in &labels {
        grades.insert(
            label.to_string(),
            recorded.get(*label).map(|v| json!(v)).unwrap_or(Value::Null),
        );
    }
    Ok(json!({
        "studentId": student_id,
        "subjectId": subject_id,
        "variant": variant.as_str(),
        "labels": labels,
        "grades": grades,
    }))
}

fn grades_set(conn: &Connection, variant: SchoolVariant, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = parse_write_context(params)?;
    let student_id = get_required_str(params, "studentId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let term_label = get_required_str(params, "termLabel")?;
    let value = params
        .get("value")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params("value must be a number"))?;

    // Nothing touches the store until the write is known to be valid.
    let label = calc::validate_grade_write(variant.rules(), &term_label, value).map_err(|e| {
        tracing::warn!(
            actor = %ctx.actor_id,
            student = %student_id,
            subject = %subject_id,
            term = %term_label,
            value,
            "rejected grade write: {e}"
        );
        HandlerErr::new("invalid_grade", e.to_string()).with_details(json!({
            "reason": e.reason(),
            "termLabel": term_label,
            "value": value,
            "variant": variant.as_str(),
        }))
    })?;

    ensure_student(conn, &student_id)?;
    ensure_subject(conn, &subject_id)?;
    let previous = db::grade_value(conn, &student_id, &subject_id, label)
        .map_err(db_err("db_query_failed"))?;
    if previous.is_some() {
        require_modify(&ctx, "grade")?;
    }
    db::upsert_grade(conn, &student_id, &subject_id, label, value)
        .map_err(db_err("db_update_failed"))?;

    Ok(json!({
        "ok": true,
        "termLabel": label,
        "value": value,
        "previous": previous,
        "replaced": previous.is_some(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "grades.get" => Some(with_workspace(state, req, grades_get)),
        "grades.set" => Some(with_workspace(state, req, grades_set)),
        _ => None,
    }
}
