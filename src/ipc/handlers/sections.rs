use crate::ipc::error::{err, ok};
use crate::ipc::store;
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};

fn is_well_formed_course_number(ccn: &str) -> bool {
    !ccn.is_empty() && ccn.len() <= 6 && ccn.chars().all(|c| c.is_ascii_digit())
}

fn handle_section_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(ccn) = req.params.get("courseNumber").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.courseNumber", None);
    };
    // Malformed course numbers are a caller error, not a missing row.
    if !is_well_formed_course_number(ccn) {
        return err(&req.id, "bad_params", format!("malformed course number: {}", ccn), None);
    }
    let term_id = match store::resolve_term_id(conn, &req.params) {
        Ok(Some(t)) => t,
        Ok(None) => {
            return err(&req.id, "bad_params", "no termId and no currentTermId configured", None)
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let result: anyhow::Result<Option<Value>> = (|| {
        let Some(section) = store::load_section(conn, &term_id, ccn)? else {
            return Ok(None);
        };
        let config = store::term_config(conn)?;
        let view = store::section_view(conn, &term_id, &section, &config.exempt_forms)?;
        let evaluations: Vec<Value> = view
            .evaluations
            .iter()
            .map(|m| store::evaluation_json(m, &view.instructors))
            .collect();
        let mut section = store::section_json(&view.section);
        section["evaluations"] = Value::Array(evaluations);
        Ok(Some(json!({ "termId": term_id, "section": section })))
    })();

    match result {
        Ok(Some(v)) => ok(&req.id, v),
        Ok(None) => err(
            &req.id,
            "not_found",
            format!("no section {} in term {}", ccn, term_id),
            None,
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "section.get" => Some(handle_section_get(state, req)),
        _ => None,
    }
}
