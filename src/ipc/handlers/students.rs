use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use crate::db;
use crate::ipc::error::ok;
use crate::ipc::handlers::snapshots::{snapshot_json, take_snapshot};
use crate::ipc::helpers::{
    db_err, get_opt_bool, get_opt_str, get_period, get_required_str, now_ts, require_db,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};

fn next_sort_order(conn: &Connection, group_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE group_id = ?",
        [group_id],
        |r| r.get(0),
    )
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn handle_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let group_id = get_required_str(params, "groupId")?;
    let last_name = get_required_str(params, "lastName")?;
    let first_name = get_required_str(params, "firstName")?;
    let active = get_opt_bool(params, "active")?.unwrap_or(true);

    if !db::group_exists(conn, &group_id).map_err(db_err)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "group not found".to_string(),
            details: Some(json!({ "groupId": group_id })),
        });
    }

    let student_id = Uuid::new_v4().to_string();
    let sort_order = next_sort_order(conn, &group_id)?;
    conn.execute(
        "INSERT INTO students(id, group_id, last_name, first_name, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &group_id,
            last_name.trim(),
            first_name.trim(),
            active as i64,
            sort_order,
            now_ts(),
        ),
    )
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "studentId": student_id }))
}

fn handle_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let group_id = get_required_str(params, "groupId")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, active, sort_order
             FROM students
             WHERE group_id = ?
             ORDER BY sort_order, id",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map([&group_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "displayName": format!("{}, {}", last, first),
                "lastName": last,
                "firstName": first,
                "active": r.get::<_, i64>(3)? != 0,
                "sortOrder": r.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "students": rows }))
}

fn handle_update(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let patch = params
        .get("patch")
        .ok_or_else(|| HandlerErr::bad_params("missing patch"))?;
    if !patch.is_object() {
        return Err(HandlerErr::bad_params("patch must be an object"));
    }

    if db::student_group(conn, &student_id).map_err(db_err)?.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: Some(json!({ "studentId": student_id })),
        });
    }

    if let Some(last_name) = get_opt_str(patch, "lastName")? {
        conn.execute(
            "UPDATE students SET last_name = ?, updated_at = ? WHERE id = ?",
            (last_name.trim(), now_ts(), &student_id),
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    }
    if let Some(first_name) = get_opt_str(patch, "firstName")? {
        conn.execute(
            "UPDATE students SET first_name = ?, updated_at = ? WHERE id = ?",
            (first_name.trim(), now_ts(), &student_id),
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    }
    if let Some(active) = get_opt_bool(patch, "active")? {
        conn.execute(
            "UPDATE students SET active = ?, updated_at = ? WHERE id = ?",
            (active as i64, now_ts(), &student_id),
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    }

    Ok(json!({ "updated": true }))
}

/// Mid-period move between groups. The student's current result is
/// frozen under the old group first, so the old group's reports keep
/// reading the same numbers after the transfer.
fn handle_transfer(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let to_group_id = get_required_str(params, "toGroupId")?;
    let period = get_period(params)?;

    let from_group_id = db::student_group(conn, &student_id)
        .map_err(db_err)?
        .ok_or_else(|| HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: Some(json!({ "studentId": student_id })),
        })?;
    if !db::group_exists(conn, &to_group_id).map_err(db_err)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "target group not found".to_string(),
            details: Some(json!({ "groupId": to_group_id })),
        });
    }
    if from_group_id == to_group_id {
        return Err(HandlerErr::bad_params(
            "student is already a member of the target group",
        ));
    }

    let snapshot = take_snapshot(conn, &student_id, period, &from_group_id)?;

    let sort_order = next_sort_order(conn, &to_group_id)?;
    conn.execute(
        "UPDATE students SET group_id = ?, sort_order = ?, updated_at = ? WHERE id = ?",
        (&to_group_id, sort_order, now_ts(), &student_id),
    )
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({
        "studentId": student_id,
        "fromGroupId": from_group_id,
        "toGroupId": to_group_id,
        "snapshot": snapshot_json(&snapshot),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "students.create" => handle_create(state, &req.params),
        "students.list" => handle_list(state, &req.params),
        "students.update" => handle_update(state, &req.params),
        "students.transfer" => handle_transfer(state, &req.params),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
