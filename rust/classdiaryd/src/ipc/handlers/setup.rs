use crate::calc::{SchoolVariant, ATTENDANCE_CUTOFF_PERCENT};
use crate::db;
use crate::ipc::error::{db_err, err, ok, HandlerErr};
use crate::ipc::helpers::{get_required_str, parse_string_max, parse_write_context, require_modify};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};

const SCHOOL_SECTION: &str = "school";

fn school_section(conn: &Connection, variant: SchoolVariant) -> Result<Value, HandlerErr> {
    let stored = db::school_settings(conn).map_err(db_err("db_query_failed"))?;
    let name = stored
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let rules = variant.rules();
    Ok(json!({
        "variant": variant.as_str(),
        "name": name,
        "termLabels": rules.term_labels,
        "examLabel": rules.exam_label(),
        "thresholds": {
            "approval": rules.approval_threshold,
            "councilFloor": rules.council_floor,
            "examEligibility": rules.exam.map(|e| e.eligibility_floor),
            "examPass": rules.exam.map(|e| e.pass_threshold),
            "attendancePercent": ATTENDANCE_CUTOFF_PERCENT,
        }
    }))
}

fn check_section(params: &Value) -> Result<(), HandlerErr> {
    let section = get_required_str(params, "section")?;
    if section != SCHOOL_SECTION {
        return Err(HandlerErr::bad_params(format!("unknown setup section: {}", section)));
    }
    Ok(())
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if req.params.get("section").is_some() {
        if let Err(e) = check_section(&req.params) {
            return e.response(&req.id);
        }
    }
    match school_section(conn, state.variant) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn setup_update(
    conn: &Connection,
    current: SchoolVariant,
    params: &Value,
) -> Result<(SchoolVariant, Value), HandlerErr> {
    check_section(params)?;
    let ctx = parse_write_context(params)?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing patch"));
    };
    require_modify(&ctx, "school settings")?;

    let mut school = db::school_settings(conn).map_err(db_err("db_query_failed"))?;
    if !school.is_object() {
        school = json!({});
    }

    if let Some(v) = patch.get("name") {
        school["name"] = json!(parse_string_max(v, "name", 200)?);
    }

    let mut variant = current;
    if let Some(v) = patch.get("variant") {
        let raw = v
            .as_str()
            .ok_or_else(|| HandlerErr::bad_params("variant must be string"))?;
        let requested = SchoolVariant::parse(raw).ok_or_else(|| {
            HandlerErr::bad_params(format!("variant must be 'basic' or 'higher', got {:?}", raw))
        })?;
        if requested != current {
            // Recorded grades were validated against the current term labels.
            let recorded = db::grade_count(conn).map_err(db_err("db_query_failed"))?;
            if recorded > 0 {
                return Err(HandlerErr::new(
                    "conflict",
                    "cannot change school variant once grades are recorded",
                )
                .with_details(json!({ "gradeCount": recorded })));
            }
            variant = requested;
        }
    }
    school["variant"] = json!(variant.as_str());
    db::set_school_settings(conn, &school).map_err(db_err("db_update_failed"))?;
    if variant != current {
        tracing::info!(
            actor = %ctx.actor_id,
            from = %current.as_str(),
            to = %variant.as_str(),
            "school variant changed"
        );
    }
    Ok((variant, school_section(conn, variant)?))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match setup_update(conn, state.variant, &req.params) {
        Ok((variant, result)) => {
            state.variant = variant;
            ok(&req.id, result)
        }
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
