use crate::ipc::error::ok;
use crate::ipc::helpers::{db_err, get_required_str, require_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn handle_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let name = get_required_str(params, "name")?;
    let name = name.trim();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }

    let group_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO groups(id, name) VALUES(?, ?)",
        (&group_id, name),
    )
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "groupId": group_id }))
}

fn handle_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.name,
                    (SELECT COUNT(*) FROM students s WHERE s.group_id = g.id AND s.active = 1)
             FROM groups g
             ORDER BY g.name, g.id",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "studentCount": r.get::<_, i64>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "groups": rows }))
}

fn handle_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let group_id = get_required_str(params, "groupId")?;

    if !crate::db::group_exists(conn, &group_id).map_err(db_err)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "group not found".to_string(),
            details: Some(json!({ "groupId": group_id })),
        });
    }

    let member_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM students WHERE group_id = ?",
            [&group_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if member_count > 0 {
        return Err(HandlerErr {
            code: "group_not_empty",
            message: "group still has students; transfer them first".to_string(),
            details: Some(json!({ "studentCount": member_count })),
        });
    }

    // Frozen history pins the group: deleting it would orphan snapshots.
    let snapshot_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM score_snapshots WHERE group_id = ?",
            [&group_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if snapshot_count > 0 {
        return Err(HandlerErr {
            code: "group_has_snapshots",
            message: "group has frozen score snapshots and cannot be deleted".to_string(),
            details: Some(json!({ "snapshotCount": snapshot_count })),
        });
    }

    conn.execute(
        "DELETE FROM class_sessions WHERE group_id = ?",
        [&group_id],
    )
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    conn.execute("DELETE FROM groups WHERE id = ?", [&group_id])
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "groups.create" => handle_create(state, &req.params),
        "groups.list" => handle_list(state),
        "groups.delete" => handle_delete(state, &req.params),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
