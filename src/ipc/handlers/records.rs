use serde_json::{json, Value};
use uuid::Uuid;

use crate::db;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    db_err, get_opt_date, get_opt_f64, get_opt_i64, get_period, get_required_date,
    get_required_i64, get_required_str, now_ts, require_db, student_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::scoring::AttendanceStatus;

fn date_param(date: Option<chrono::NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

fn handle_labs_record(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let period = get_period(params)?;
    let lab_no = get_required_i64(params, "labNo")?;
    if lab_no < 1 {
        return Err(HandlerErr::bad_params("labNo must be >= 1"));
    }
    let grade = get_opt_f64(params, "grade")?;
    let submitted_at = get_opt_date(params, "submittedAt")?;
    let deadline = get_opt_date(params, "deadline")?;
    student_exists(conn, &student_id)?;

    conn.execute(
        "INSERT INTO lab_submissions(id, student_id, period, lab_no, grade, submitted_at, deadline, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, period, lab_no) DO UPDATE SET
            grade = excluded.grade,
            submitted_at = excluded.submitted_at,
            deadline = excluded.deadline,
            updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            period.key(),
            lab_no,
            grade,
            date_param(submitted_at),
            date_param(deadline),
            now_ts(),
        ),
    )
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "recorded": true }))
}

fn handle_labs_list(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let period = get_period(params)?;
    student_exists(conn, &student_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT lab_no, grade, submitted_at, deadline
             FROM lab_submissions
             WHERE student_id = ? AND period = ?
             ORDER BY lab_no",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map((&student_id, period.key()), |r| {
            Ok(json!({
                "labNo": r.get::<_, i64>(0)?,
                "grade": r.get::<_, Option<f64>>(1)?,
                "submittedAt": r.get::<_, Option<String>>(2)?,
                "deadline": r.get::<_, Option<String>>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "submissions": rows }))
}

fn handle_attendance_mark(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let period = get_period(params)?;
    let date = get_required_date(params, "date")?;
    let status_raw = get_required_str(params, "status")?;
    let Some(status) = AttendanceStatus::parse(&status_raw) else {
        return Err(HandlerErr::bad_params(
            "status must be one of: present, late, excused, absent",
        ));
    };
    student_exists(conn, &student_id)?;

    conn.execute(
        "INSERT INTO attendance_marks(student_id, period, session_date, status)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(student_id, period, session_date) DO UPDATE SET
            status = excluded.status",
        (
            &student_id,
            period.key(),
            date.format("%Y-%m-%d").to_string(),
            status.key(),
        ),
    )
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "recorded": true }))
}

/// Replaces the session calendar for a group and period. The calendar is
/// the attendance denominator; it comes from the caller's schedule, the
/// daemon never derives it.
fn handle_sessions_set(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let group_id = get_required_str(params, "groupId")?;
    let period = get_period(params)?;
    let dates = params
        .get("dates")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("missing dates array"))?;

    if !db::group_exists(conn, &group_id).map_err(db_err)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "group not found".to_string(),
            details: Some(json!({ "groupId": group_id })),
        });
    }

    let mut parsed: Vec<String> = Vec::with_capacity(dates.len());
    for v in dates {
        let Some(s) = v.as_str() else {
            return Err(HandlerErr::bad_params("dates must be YYYY-MM-DD strings"));
        };
        if chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_err() {
            return Err(HandlerErr::bad_params(format!("invalid date: {}", s)));
        }
        parsed.push(s.to_string());
    }

    conn.execute(
        "DELETE FROM class_sessions WHERE group_id = ? AND period = ?",
        (&group_id, period.key()),
    )
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    for date in &parsed {
        conn.execute(
            "INSERT OR IGNORE INTO class_sessions(group_id, period, session_date) VALUES(?, ?, ?)",
            (&group_id, period.key(), date),
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    }

    Ok(json!({ "sessionCount": parsed.len() }))
}

fn handle_activity_add(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let period = get_period(params)?;
    let points = get_opt_f64(params, "points")?;
    let description = get_required_str(params, "description")?;
    student_exists(conn, &student_id)?;

    let entry_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO activity_entries(id, student_id, period, points, description, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &entry_id,
            &student_id,
            period.key(),
            points,
            description.trim(),
            now_ts(),
        ),
    )
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "entryId": entry_id }))
}

fn handle_activity_list(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let period = get_period(params)?;
    student_exists(conn, &student_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, points, description
             FROM activity_entries
             WHERE student_id = ? AND period = ?
             ORDER BY created_at, id",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map((&student_id, period.key()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "points": r.get::<_, Option<f64>>(1)?,
                "description": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "entries": rows }))
}

fn handle_tests_record(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let period = get_period(params)?;
    let test_no = get_required_i64(params, "testNo")?;
    if test_no < 1 {
        return Err(HandlerErr::bad_params("testNo must be >= 1"));
    }
    let attempt = get_opt_i64(params, "attempt")?.unwrap_or(1);
    if attempt < 1 {
        return Err(HandlerErr::bad_params("attempt must be >= 1"));
    }
    let grade = get_opt_f64(params, "grade")?;
    let taken_at = get_opt_date(params, "takenAt")?;
    let deadline = get_opt_date(params, "deadline")?;
    student_exists(conn, &student_id)?;

    conn.execute(
        "INSERT INTO test_submissions(id, student_id, period, test_no, attempt, grade, taken_at, deadline)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, period, test_no, attempt) DO UPDATE SET
            grade = excluded.grade,
            taken_at = excluded.taken_at,
            deadline = excluded.deadline",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            period.key(),
            test_no,
            attempt,
            grade,
            date_param(taken_at),
            date_param(deadline),
        ),
    )
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "recorded": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "labs.record" => handle_labs_record(state, &req.params),
        "labs.list" => handle_labs_list(state, &req.params),
        "attendance.mark" => handle_attendance_mark(state, &req.params),
        "sessions.set" => handle_sessions_set(state, &req.params),
        "activity.add" => handle_activity_add(state, &req.params),
        "activity.list" => handle_activity_list(state, &req.params),
        "tests.record" => handle_tests_record(state, &req.params),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
