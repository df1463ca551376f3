use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type Family = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const FAMILIES: [Family; 9] = [
    handlers::core::try_handle,
    handlers::accounts::try_handle,
    handlers::classes::try_handle,
    handlers::schedules::try_handle,
    handlers::coursework::try_handle,
    handlers::attendance::try_handle,
    handlers::rankings::try_handle,
    handlers::files::try_handle,
    handlers::backup::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    tracing::debug!(id = %req.id, method = %req.method, "dispatch");
    for family in FAMILIES {
        if let Some(resp) = family(state, &req) {
            if resp.get("ok").and_then(|v| v.as_bool()) == Some(false) {
                let code = resp
                    .pointer("/error/code")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                tracing::warn!(id = %req.id, method = %req.method, code, "request refused");
            }
            return resp;
        }
    }

    tracing::warn!(method = %req.method, "unknown method");
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
