use rusqlite::Connection;
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::{self, SnapshotRow};
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    db_err, get_opt_str, get_period, get_required_str, now_ts, require_db, score_err,
    student_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{self, Period};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Compute-once-then-freeze. Idempotent per (student, period, group):
/// an existing row is returned untouched, including its `taken_at`, and
/// a lost insert race resolves to the row that won.
pub fn take_snapshot(
    conn: &Connection,
    student_id: &str,
    period: Period,
    group_id: &str,
) -> Result<SnapshotRow, HandlerErr> {
    if let Some(existing) = db::find_snapshot(conn, student_id, period, group_id).map_err(db_err)? {
        return Ok(existing);
    }

    let period_cfg = db::load_period_config(conn, period).map_err(db_err)?;
    let components = db::load_components_config(conn, period).map_err(db_err)?;
    let inputs = db::fetch_student_inputs(conn, student_id, period).map_err(db_err)?;
    let result =
        scoring::compute_one(student_id, &period_cfg, &components, &inputs).map_err(score_err)?;
    let result_json = serde_json::to_string(&result)
        .map_err(|e| HandlerErr::new("calc_failed", e.to_string()))?;

    let row = SnapshotRow {
        id: Uuid::new_v4().to_string(),
        student_id: student_id.to_string(),
        period: period.key().to_string(),
        group_id: group_id.to_string(),
        taken_at: now_ts(),
        checksum: sha256_hex(result_json.as_bytes()),
        result_json,
    };
    db::insert_snapshot(conn, &row).map_err(db_err)
}

pub fn snapshot_json(row: &SnapshotRow) -> serde_json::Value {
    let result: serde_json::Value =
        serde_json::from_str(&row.result_json).unwrap_or(serde_json::Value::Null);
    json!({
        "id": row.id,
        "studentId": row.student_id,
        "period": row.period,
        "groupId": row.group_id,
        "takenAt": row.taken_at,
        "checksum": row.checksum,
        "result": result,
    })
}

fn resolve_group(
    conn: &Connection,
    params: &serde_json::Value,
    student_id: &str,
) -> Result<String, HandlerErr> {
    if let Some(group_id) = get_opt_str(params, "groupId")? {
        return Ok(group_id);
    }
    db::student_group(conn, student_id)
        .map_err(db_err)?
        .ok_or_else(|| HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: Some(json!({ "studentId": student_id })),
        })
}

fn handle_take(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let period = get_period(params)?;
    student_exists(conn, &student_id)?;
    let group_id = resolve_group(conn, params, &student_id)?;

    let row = take_snapshot(conn, &student_id, period, &group_id)?;
    Ok(json!({ "snapshot": snapshot_json(&row) }))
}

fn handle_find(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let period = get_period(params)?;
    let group_id = get_required_str(params, "groupId")?;

    let row = db::find_snapshot(conn, &student_id, period, &group_id).map_err(db_err)?;
    Ok(json!({ "snapshot": row.as_ref().map(snapshot_json) }))
}

fn handle_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let group_id = get_required_str(params, "groupId")?;
    let period = get_period(params)?;

    let rows = db::list_group_snapshots(conn, &group_id, period).map_err(db_err)?;
    let out: Vec<serde_json::Value> = rows.iter().map(snapshot_json).collect();
    Ok(json!({ "snapshots": out }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "snapshots.take" => handle_take(state, &req.params),
        "snapshots.find" => handle_find(state, &req.params),
        "snapshots.list" => handle_list(state, &req.params),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
