use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::HashSet;

use crate::db;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    db_err, get_opt_f64, get_opt_str, get_period, get_required_str, require_db, score_err,
    student_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{self, AttestationResult, Period, StudentInputs};

fn load_member_inputs(
    conn: &Connection,
    member_ids: &[String],
    period: Period,
) -> Result<Vec<(String, StudentInputs)>, HandlerErr> {
    let mut members = Vec::with_capacity(member_ids.len());
    for student_id in member_ids {
        let inputs = db::fetch_student_inputs(conn, student_id, period).map_err(db_err)?;
        members.push((student_id.clone(), inputs));
    }
    Ok(members)
}

fn handle_compute_one(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let period = get_period(params)?;
    student_exists(conn, &student_id)?;

    let period_cfg = db::load_period_config(conn, period).map_err(db_err)?;
    let components = db::load_components_config(conn, period).map_err(db_err)?;
    let inputs = db::fetch_student_inputs(conn, &student_id, period).map_err(db_err)?;

    let result =
        scoring::compute_one(&student_id, &period_cfg, &components, &inputs).map_err(score_err)?;
    Ok(json!({ "result": result }))
}

/// Group scope: live members are computed fresh; students who left the
/// group mid-period contribute their frozen snapshot results instead.
/// `scope: "all"` covers every active student with no frozen overlay.
fn handle_compute_group(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let period = get_period(params)?;

    let period_cfg = db::load_period_config(conn, period).map_err(db_err)?;
    let components = db::load_components_config(conn, period).map_err(db_err)?;

    let (scope_id, member_ids, frozen) = match get_opt_str(params, "groupId")? {
        Some(group_id) => {
            if !db::group_exists(conn, &group_id).map_err(db_err)? {
                return Err(HandlerErr {
                    code: "not_found",
                    message: "group not found".to_string(),
                    details: Some(json!({ "groupId": group_id })),
                });
            }
            let member_ids = db::list_group_member_ids(conn, &group_id).map_err(db_err)?;
            let member_set: HashSet<&String> = member_ids.iter().collect();

            let mut frozen: Vec<AttestationResult> = Vec::new();
            for row in db::list_group_snapshots(conn, &group_id, period).map_err(db_err)? {
                if member_set.contains(&row.student_id) {
                    continue;
                }
                let result: AttestationResult = serde_json::from_str(&row.result_json)
                    .map_err(|e| HandlerErr::new("snapshot_corrupt", e.to_string()))?;
                frozen.push(result);
            }
            (group_id, member_ids, frozen)
        }
        None => {
            let member_ids = db::list_all_student_ids(conn).map_err(db_err)?;
            ("all".to_string(), member_ids, Vec::new())
        }
    };

    let members = load_member_inputs(conn, &member_ids, period)?;
    let result = scoring::compute_group(&scope_id, &period_cfg, &components, &members, frozen)
        .map_err(score_err)?;
    Ok(json!({ "result": result }))
}

fn handle_classify(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let period = get_period(params)?;
    let total_score = get_opt_f64(params, "totalScore")?
        .ok_or_else(|| HandlerErr::bad_params("missing totalScore"))?;

    let period_cfg = db::load_period_config(conn, period).map_err(db_err)?;
    scoring::validate_period(&period_cfg).map_err(score_err)?;
    let label = scoring::classify(total_score, &period_cfg.grade_bands).map_err(score_err)?;
    Ok(json!({ "gradeLabel": label }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "attestation.computeOne" => handle_compute_one(state, &req.params),
        "attestation.computeGroup" => handle_compute_group(state, &req.params),
        "attestation.classify" => handle_classify(state, &req.params),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
