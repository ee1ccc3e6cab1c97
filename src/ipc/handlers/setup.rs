use serde_json::{json, Map, Value};

use crate::db;
use crate::ipc::error::ok;
use crate::ipc::helpers::{db_err, get_period, require_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{ComponentsConfig, PeriodConfig};

/// Shallow key merge: patch keys replace current keys. For the
/// components config one more level is merged so a patch can touch a
/// single field of a single component.
fn merge_objects(current: &mut Map<String, Value>, patch: &Map<String, Value>, deep: bool) {
    for (key, value) in patch {
        if deep {
            if let (Some(Value::Object(existing)), Some(incoming)) =
                (current.get_mut(key), value.as_object())
            {
                merge_objects(existing, incoming, false);
                continue;
            }
        }
        current.insert(key.clone(), value.clone());
    }
}

fn patch_object(params: &Value) -> Result<&Map<String, Value>, HandlerErr> {
    params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("missing patch object"))
}

fn handle_period_get(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let period = get_period(params)?;
    let value = db::settings_get_json(conn, &db::period_config_key(period))
        .map_err(db_err)?
        .unwrap_or_else(|| db::default_period_config(period));
    Ok(json!({ "config": value }))
}

fn handle_period_update(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let period = get_period(params)?;
    let patch = patch_object(params)?;

    let mut current = db::settings_get_json(conn, &db::period_config_key(period))
        .map_err(db_err)?
        .unwrap_or_else(|| db::default_period_config(period));
    let Some(obj) = current.as_object_mut() else {
        return Err(HandlerErr::new("db_query_failed", "stored config is not an object"));
    };
    merge_objects(obj, patch, false);

    // Shape check only. Band/weight semantics are re-validated by the
    // engine on every compute, so a staged misconfig is storable but
    // never scoreable.
    if let Err(e) = serde_json::from_value::<PeriodConfig>(current.clone()) {
        return Err(HandlerErr::bad_params(format!("invalid period config: {}", e)));
    }

    db::settings_set_json(conn, &db::period_config_key(period), &current).map_err(db_err)?;
    Ok(json!({ "config": current }))
}

fn handle_components_get(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let period = get_period(params)?;
    let value = db::settings_get_json(conn, &db::components_config_key(period))
        .map_err(db_err)?
        .unwrap_or_else(db::default_components_config);
    Ok(json!({ "config": value }))
}

fn handle_components_update(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let period = get_period(params)?;
    let patch = patch_object(params)?;

    let mut current = db::settings_get_json(conn, &db::components_config_key(period))
        .map_err(db_err)?
        .unwrap_or_else(db::default_components_config);
    let Some(obj) = current.as_object_mut() else {
        return Err(HandlerErr::new("db_query_failed", "stored config is not an object"));
    };
    merge_objects(obj, patch, true);

    if let Err(e) = serde_json::from_value::<ComponentsConfig>(current.clone()) {
        return Err(HandlerErr::bad_params(format!(
            "invalid components config: {}",
            e
        )));
    }

    db::settings_set_json(conn, &db::components_config_key(period), &current).map_err(db_err)?;
    Ok(json!({ "config": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "setup.periodConfig.get" => handle_period_get(state, &req.params),
        "setup.periodConfig.update" => handle_period_update(state, &req.params),
        "setup.componentsConfig.get" => handle_components_get(state, &req.params),
        "setup.componentsConfig.update" => handle_components_update(state, &req.params),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
