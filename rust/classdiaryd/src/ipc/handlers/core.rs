use crate::calc::SchoolVariant;
use crate::db;
use crate::ipc::error::{db_err, ok, HandlerErr};
use crate::ipc::helpers::{get_optional_str, get_required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::{Path, PathBuf};

/// Opens (or creates) the workspace at `path` and makes it current. A
/// workspace records its school variant the first time it is opened; asking
/// for a different one later is refused. On error the previously selected
/// workspace stays selected.
pub fn open_workspace(
    state: &mut AppState,
    path: &Path,
    requested: Option<SchoolVariant>,
) -> Result<SchoolVariant, HandlerErr> {
    let conn = db::open_db(path).map_err(db_err("db_open_failed"))?;
    let stored = db::school_variant(&conn).map_err(db_err("db_query_failed"))?;

    let variant = match (stored, requested) {
        (Some(stored), Some(requested)) if stored != requested => {
            return Err(HandlerErr::new(
                "variant_mismatch",
                format!(
                    "workspace is pinned to {}, cannot open it as {}",
                    stored.as_str(),
                    requested.as_str()
                ),
            )
            .with_details(json!({
                "stored": stored.as_str(),
                "requested": requested.as_str(),
            })));
        }
        (Some(stored), _) => stored,
        (None, requested) => {
            let variant = requested.unwrap_or(state.default_variant);
            let mut school = db::school_settings(&conn).map_err(db_err("db_query_failed"))?;
            if !school.is_object() {
                school = json!({});
            }
            school["variant"] = json!(variant.as_str());
            db::set_school_settings(&conn, &school).map_err(db_err("db_update_failed"))?;
            tracing::info!(variant = %variant.as_str(), "pinned school variant");
            variant
        }
    };

    tracing::info!(
        workspace = %path.to_string_lossy(),
        variant = %variant.as_str(),
        "workspace opened"
    );
    state.workspace = Some(path.to_path_buf());
    state.db = Some(conn);
    state.variant = variant;
    Ok(variant)
}

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "variant": state.db.as_ref().map(|_| state.variant.as_str()),
        }),
    )
}

fn workspace_select(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let path = PathBuf::from(get_required_str(&req.params, "path")?);
    let requested = match get_optional_str(&req.params, "variant")? {
        None => None,
        Some(raw) => Some(SchoolVariant::parse(&raw).ok_or_else(|| {
            HandlerErr::bad_params(format!("variant must be 'basic' or 'higher', got {:?}", raw))
        })?),
    };
    let variant = open_workspace(state, &path, requested)?;
    Ok(json!({
        "workspacePath": path.to_string_lossy(),
        "variant": variant.as_str(),
    }))
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    match workspace_select(state, req) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
