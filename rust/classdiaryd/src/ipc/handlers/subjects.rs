use crate::calc::SchoolVariant;
use crate::ipc::error::{sql_err, HandlerErr};
use crate::ipc::helpers::{parse_string_max, parse_write_context, with_workspace};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

fn subjects_list(conn: &Connection, _: SchoolVariant, _: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, sort_order FROM subjects ORDER BY sort_order")
        .map_err(sql_err("db_query_failed"))?;
    let subjects = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "sortOrder": row.get::<_, i64>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(sql_err("db_query_failed"))?;
    Ok(json!({ "subjects": subjects }))
}

fn subjects_create(conn: &Connection, _: SchoolVariant, params: &Value) -> Result<Value, HandlerErr> {
    let ctx = parse_write_context(params)?;
    let name = parse_string_max(params.get("name").unwrap_or(&Value::Null), "name", 80)?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM subjects WHERE name = ? COLLATE NOCASE",
            [&name],
            |r| r.get(0),
        )
        .optional()
        .map_err(sql_err("db_query_failed"))?;
    if let Some(subject_id) = existing {
        return Err(HandlerErr::new("conflict", "subject already exists")
            .with_details(json!({ "subjectId": subject_id, "name": name })));
    }

    let sort_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM subjects",
            [],
            |r| r.get(0),
        )
        .map_err(sql_err("db_query_failed"))?;
    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, sort_order) VALUES(?, ?, ?)",
        (&subject_id, &name, sort_order),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "subjects" }))
    })?;
    tracing::info!(actor = %ctx.actor_id, subject = %subject_id, "subject created");
    Ok(json!({ "subjectId": subject_id, "sortOrder": sort_order }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "subjects.list" => Some(with_workspace(state, req, subjects_list)),
        "subjects.create" => Some(with_workspace(state, req, subjects_create)),
        _ => None,
    }
}
