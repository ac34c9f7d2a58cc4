use crate::backup::{self, RestoreRejected};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::handlers::core::open_workspace;
use crate::ipc::helpers::{get_optional_str, get_required_str, parse_write_context, require_modify};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::{Path, PathBuf};

fn handle_backup_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match get_required_str(&req.params, "outPath") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let export = match backup::export_workspace_bundle(&workspace_path, &PathBuf::from(&out_path)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "backup_failed",
                format!("{e:#}"),
                Some(json!({ "path": out_path })),
            )
        }
    };
    tracing::info!(path = %out_path, sha256 = %export.db_sha256, "workspace bundle exported");

    ok(
        &req.id,
        json!({
            "ok": true,
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "entryCount": export.entry_count,
            "dbSha256": export.db_sha256,
            "diary": export.snapshot,
        }),
    )
}

fn import_err(e: &anyhow::Error, in_path: &Path) -> HandlerErr {
    let path = in_path.to_string_lossy();
    match e.downcast_ref::<RestoreRejected>() {
        Some(RestoreRejected::VariantMismatch { bundle, workspace }) => {
            HandlerErr::new("variant_mismatch", e.to_string()).with_details(json!({
                "path": path,
                "bundle": bundle,
                "stored": workspace,
            }))
        }
        _ => HandlerErr::new("backup_failed", format!("{e:#}"))
            .with_details(json!({ "path": path })),
    }
}

fn backup_import(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let ctx = parse_write_context(&req.params)?;
    let in_path = PathBuf::from(get_required_str(&req.params, "inPath")?);
    let workspace_path = match get_optional_str(&req.params, "workspacePath")? {
        Some(p) => PathBuf::from(p),
        None => state
            .workspace
            .clone()
            .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?,
    };
    if !in_path.is_file() {
        return Err(HandlerErr::not_found("bundle file not found")
            .with_details(json!({ "path": in_path.to_string_lossy() })));
    }
    // Restoring replaces every record in the target workspace.
    require_modify(&ctx, "workspace")?;

    let replacing_current = state.workspace.as_deref() == Some(workspace_path.as_path());
    let previous_variant = state.variant;
    if replacing_current {
        // Drop open handle before replacing file.
        state.db = None;
    }

    let import = match backup::import_workspace_bundle(&in_path, &workspace_path) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(path = %in_path.to_string_lossy(), "bundle import rejected: {e:#}");
            if replacing_current {
                // The database file is only swapped by the final rename; reopen it as it was.
                if let Err(reopen) = open_workspace(state, &workspace_path, Some(previous_variant)) {
                    tracing::error!("cannot reopen workspace after failed import: {reopen}");
                }
            }
            return Err(import_err(&e, &in_path));
        }
    };

    // A restored database that never pinned a variant keeps the one being served.
    let variant = open_workspace(
        state,
        &workspace_path,
        replacing_current.then_some(previous_variant),
    )?;
    tracing::info!(
        actor = %ctx.actor_id,
        workspace = %workspace_path.to_string_lossy(),
        format = %import.bundle_format_detected,
        "workspace bundle imported"
    );
    Ok(json!({
        "ok": true,
        "workspacePath": workspace_path.to_string_lossy(),
        "bundleFormatDetected": import.bundle_format_detected,
        "dbSha256": import.db_sha256,
        "variant": variant.as_str(),
        "diary": import.snapshot,
    }))
}

fn handle_backup_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    match backup_import(state, req) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_backup_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_backup_import_workspace_bundle(state, req)),
        _ => None,
    }
}
