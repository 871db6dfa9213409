use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::store;
use crate::ipc::types::{AppState, Request};
use crate::term;
use serde_json::{json, Value};

fn handle_config_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let config = match store::term_config(conn) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let term_ids = match (&config.earliest_term_id, &config.current_term_id) {
        (Some(earliest), Some(current)) => term::term_ids_range(earliest, current),
        _ => Vec::new(),
    };
    let terms: Vec<Value> = term_ids
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "name": term::term_name_for_sis_id(id),
                "code": term::term_code_for_sis_id(id),
            })
        })
        .collect();
    ok(
        &req.id,
        json!({
            "currentTermId": config.current_term_id,
            "earliestTermId": config.earliest_term_id,
            "exemptDepartmentForms": config.exempt_forms,
            "availableTerms": terms,
        }),
    )
}

fn handle_config_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(params) = req.params.as_object() else {
        return err(&req.id, "bad_params", "params must be an object", None);
    };

    for key in ["currentTermId", "earliestTermId"] {
        if let Some(value) = params.get(key) {
            let Some(term_id) = value.as_str() else {
                return err(&req.id, "bad_params", format!("{} must be a string", key), None);
            };
            if !term::is_valid_term_id(term_id) {
                return err(
                    &req.id,
                    "bad_params",
                    format!("malformed term id: {}", term_id),
                    None,
                );
            }
            if let Err(e) = db::settings_set_json(conn, key, &json!(term_id)) {
                return err(&req.id, "db_write_failed", e.to_string(), None);
            }
        }
    }
    if let Some(value) = params.get("exemptDepartmentForms") {
        let Some(items) = value.as_array() else {
            return err(
                &req.id,
                "bad_params",
                "exemptDepartmentForms must be an array of strings",
                None,
            );
        };
        if !items.iter().all(|v| v.is_string()) {
            return err(
                &req.id,
                "bad_params",
                "exemptDepartmentForms must be an array of strings",
                None,
            );
        }
        if let Err(e) = db::settings_set_json(conn, "exemptDepartmentForms", value) {
            return err(&req.id, "db_write_failed", e.to_string(), None);
        }
    }

    handle_config_get(state, req)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "config.get" => Some(handle_config_get(state, req)),
        "config.set" => Some(handle_config_set(state, req)),
        _ => None,
    }
}
