use crate::calc::SchoolVariant;
use crate::ipc::error::{err, ok, sql_err, HandlerErr};
use crate::ipc::types::{AppState, Request, WriteContext};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

/// Runs a handler body against the open workspace, wrapping the result in
/// the response envelope.
pub fn with_workspace<F>(state: &AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&Connection, SchoolVariant, &Value) -> Result<Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, state.variant, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s.to_string())
}

pub fn get_optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr::bad_params(format!(
                    "{} must be string or null",
                    key
                )));
            };
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
    }
}

pub fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, HandlerErr> {
    let s = v
        .as_str()
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be string", key)))?
        .trim();
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    if s.chars().count() > max_len {
        return Err(HandlerErr::bad_params(format!(
            "{} length must be <= {}",
            key, max_len
        )));
    }
    Ok(s.to_string())
}

pub fn parse_write_context(params: &Value) -> Result<WriteContext, HandlerErr> {
    let Some(raw) = params.get("actor") else {
        return Err(HandlerErr::bad_params("missing actor"));
    };
    let ctx: WriteContext = serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid actor: {}", e)))?;
    if ctx.actor_id.trim().is_empty() {
        return Err(HandlerErr::bad_params("actor.actorId must not be empty"));
    }
    Ok(ctx)
}

/// Gate for writes that change or remove a record that already exists.
pub fn require_modify(ctx: &WriteContext, what: &str) -> Result<(), HandlerErr> {
    if ctx.can_modify_existing {
        return Ok(());
    }
    tracing::warn!(actor = %ctx.actor_id, "refused modification of existing {}", what);
    Err(HandlerErr::new(
        "forbidden",
        format!("actor may not modify existing {}", what),
    )
    .with_details(serde_json::json!({ "actorId": ctx.actor_id })))
}

fn row_exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(sql_err("db_query_failed"))
}

pub fn ensure_student(conn: &Connection, student_id: &str) -> Result<(), HandlerErr> {
    if row_exists(conn, "SELECT 1 FROM students WHERE id = ?", student_id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("student not found"))
    }
}

pub fn ensure_subject(conn: &Connection, subject_id: &str) -> Result<(), HandlerErr> {
    if row_exists(conn, "SELECT 1 FROM subjects WHERE id = ?", subject_id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("subject not found"))
    }
}

pub fn ensure_lesson(conn: &Connection, lesson_id: &str) -> Result<(), HandlerErr> {
    if row_exists(conn, "SELECT 1 FROM lessons WHERE id = ?", lesson_id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("lesson not found"))
    }
}
