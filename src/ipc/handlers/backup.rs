use serde_json::{json, Value};
use std::path::PathBuf;

use crate::backup;
use crate::db;
use crate::ipc::error::ok;
use crate::ipc::helpers::{get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn workspace_path(state: &AppState) -> Result<PathBuf, HandlerErr> {
    state
        .workspace
        .clone()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn handle_export(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let workspace = workspace_path(state)?;
    let out_path = PathBuf::from(get_required_str(params, "outPath")?);

    let summary = backup::export_workspace_bundle(&workspace, &out_path)
        .map_err(|e| HandlerErr::new("backup_failed", format!("{e:?}")))?;
    Ok(json!({
        "bundleFormat": summary.bundle_format,
        "dbSha256": summary.db_sha256,
        "outPath": out_path.to_string_lossy(),
    }))
}

fn handle_import(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let workspace = workspace_path(state)?;
    let in_path = PathBuf::from(get_required_str(params, "inPath")?);

    // Release the live connection before the database file is replaced.
    state.db = None;
    let summary = backup::import_workspace_bundle(&in_path, &workspace)
        .map_err(|e| HandlerErr::new("backup_failed", format!("{e:?}")))?;
    let conn = db::open_db(&workspace)
        .map_err(|e| HandlerErr::new("db_open_failed", format!("{e:?}")))?;
    state.db = Some(conn);

    Ok(json!({
        "bundleFormatDetected": summary.bundle_format_detected,
        "digestVerified": summary.digest_verified,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "backup.exportWorkspaceBundle" => handle_export(state, &req.params),
        "backup.importWorkspaceBundle" => handle_import(state, &req.params),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
