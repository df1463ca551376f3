use crate::blob;
use crate::ipc::helpers::{db_conn, require_user, required_str, respond, workspace_path, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn get(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let workspace = workspace_path(state)?;
    require_user(conn, params)?;
    let url = required_str(params, "url")?;

    let meta = blob::get(conn, &url)
        .map_err(|e| HandlerErr::new("bad_params", format!("{e:#}")).with_details(json!({ "url": url })))?
        .ok_or_else(|| HandlerErr::new("not_found", "file not found").with_details(json!({ "url": url })))?;
    let disk = blob::disk_path(workspace, &meta.path);
    if !disk.is_file() {
        tracing::warn!(path = %meta.path, "blob row without file on disk");
        return Err(HandlerErr::new("not_found", "file missing from workspace")
            .with_details(json!({ "url": url })));
    }
    Ok(json!({ "file": meta, "diskPath": disk.to_string_lossy() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "files.get" => get(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
