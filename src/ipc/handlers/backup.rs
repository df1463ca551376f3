use crate::auth::Role;
use crate::backup;
use crate::ipc::handlers::core::select_workspace;
use crate::ipc::helpers::{
    db_conn, require_role, require_user, required_str, respond, workspace_path, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn require_admin(state: &AppState, params: &serde_json::Value) -> Result<(), HandlerErr> {
    let conn = db_conn(state)?;
    let user = require_user(conn, params)?;
    require_role(&user, &[Role::Admin])
}

fn export_bundle(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state, params)?;
    let out_path = required_str(params, "outPath")?;
    let workspace = workspace_path(state)?.to_path_buf();

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let out = PathBuf::from(&out_path);
    let export = backup::export_workspace_bundle(&workspace, &out).map_err(|e| {
        HandlerErr::new("io_failed", format!("{e:#}")).with_details(json!({ "path": out_path }))
    })?;
    tracing::info!(path = %out_path, blobs = export.blob_count, "workspace bundle exported");
    Ok(json!({
        "path": out_path,
        "bundleFormat": export.bundle_format,
        "entryCount": export.entry_count,
        "blobCount": export.blob_count,
    }))
}

fn import_bundle(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state, params)?;
    let in_path = required_str(params, "inPath")?;
    let workspace = workspace_path(state)?.to_path_buf();

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return Err(HandlerErr::new("not_found", "bundle file not found")
            .with_details(json!({ "path": in_path })));
    }

    // Drop open handle before replacing file.
    state.db = None;
    let imported = backup::import_workspace_bundle(&src, &workspace);

    // Reopen either way so a failed import leaves the old workspace usable.
    if let Err(e) = select_workspace(state, &workspace) {
        return Err(HandlerErr::new("db_open_failed", format!("{e:#}")));
    }
    let import = imported.map_err(|e| {
        tracing::warn!(path = %in_path, error = %e, "workspace bundle refused");
        HandlerErr::new("io_failed", format!("{e:#}")).with_details(json!({ "path": in_path }))
    })?;

    tracing::info!(path = %in_path, blobs = import.blob_count, "workspace bundle imported");
    Ok(json!({
        "workspacePath": workspace.to_string_lossy(),
        "bundleFormat": import.bundle_format,
        "blobCount": import.blob_count,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "backup.exportWorkspaceBundle" => export_bundle(state, &req.params),
        "backup.importWorkspaceBundle" => import_bundle(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
