use crate::ipc::error::{err, ok};
use crate::ipc::store;
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};

fn listings_json(conn: &Connection, department_id: i64) -> anyhow::Result<Vec<Value>> {
    let listings = store::load_listings(conn, department_id)?;
    let mut out = Vec::new();
    for listing in listings {
        let default_form = match listing.default_form_id {
            Some(id) => store::form_by_id(conn, id)?,
            None => None,
        };
        out.push(json!({
            "subjectArea": listing.subject_area,
            "catalogId": listing.catalog_id_pattern,
            "defaultForm": default_form,
        }));
    }
    Ok(out)
}

fn department_json(conn: &Connection, dept: &store::DepartmentRecord) -> anyhow::Result<Value> {
    Ok(json!({
        "id": dept.id,
        "name": dept.name,
        "isEnrolled": dept.is_enrolled,
        "note": dept.note,
        "noteUpdatedAt": dept.note_updated_at,
        "catalogListings": listings_json(conn, dept.id)?,
    }))
}

fn handle_departments_list(conn: &Connection, req: &Request) -> serde_json::Value {
    let result: anyhow::Result<Vec<Value>> = (|| {
        let mut out = Vec::new();
        for dept in store::list_departments(conn)? {
            out.push(department_json(conn, &dept)?);
        }
        Ok(out)
    })();
    match result {
        Ok(departments) => ok(&req.id, json!({ "departments": departments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_departments_create(conn: &Connection, req: &Request) -> serde_json::Value {
    let Some(name) = req.params.get("name").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.name", None);
    };
    let name = name.trim();
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }

    let listings = match req.params.get("catalogListings") {
        None => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => {
            return err(&req.id, "bad_params", "catalogListings must be an array", None)
        }
    };

    let result: anyhow::Result<Result<i64, String>> = (|| {
        let tx = conn.unchecked_transaction()?;
        let existing: Option<i64> = tx
            .query_row("SELECT id FROM departments WHERE dept_name = ?1", [name], |r| {
                r.get(0)
            })
            .optional()?;
        if existing.is_some() {
            return Ok(Err(format!("department already exists: {}", name)));
        }
        tx.execute("INSERT INTO departments(dept_name) VALUES (?1)", [name])?;
        let dept_id = tx.last_insert_rowid();
        for (index, listing) in listings.iter().enumerate() {
            let subject_area = listing
                .get("subjectArea")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string();
            let catalog_id = listing
                .get("catalogId")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            let default_form_id = match listing.get("defaultFormName").and_then(|v| v.as_str()) {
                Some(form_name) => match store::form_by_name(&tx, form_name)? {
                    Some(form) => Some(form.id),
                    None => {
                        return Ok(Err(format!("unknown department form: {}", form_name)));
                    }
                },
                None => None,
            };
            tx.execute(
                "INSERT INTO department_catalog_listings(
                    department_id, subject_area, catalog_id, default_form_id, sort_order
                ) VALUES (?1,?2,?3,?4,?5)",
                params![dept_id, subject_area, catalog_id, default_form_id, index as i64],
            )?;
        }
        tx.commit()?;
        Ok(Ok(dept_id))
    })();

    match result {
        Ok(Ok(dept_id)) => match store::get_department(conn, dept_id) {
            Ok(Some(dept)) => match department_json(conn, &dept) {
                Ok(v) => ok(&req.id, json!({ "department": v })),
                Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
            },
            Ok(None) => err(&req.id, "db_query_failed", "department vanished", None),
            Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Ok(Err(message)) => err(&req.id, "bad_params", message, None),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_departments_update_note(conn: &Connection, req: &Request) -> serde_json::Value {
    let Some(dept_id) = req.params.get("departmentId").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing params.departmentId", None);
    };
    let note = match req.params.get("note") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Some(_) => return err(&req.id, "bad_params", "note must be a string or null", None),
    };
    let updated = conn.execute(
        "UPDATE departments SET note = ?1, note_updated_at = ?2 WHERE id = ?3",
        params![note, Utc::now().to_rfc3339(), dept_id],
    );
    match updated {
        Ok(0) => err(&req.id, "not_found", format!("no department {}", dept_id), None),
        Ok(_) => ok(&req.id, json!({ "departmentId": dept_id, "note": note })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_departments_set_contact(conn: &Connection, req: &Request) -> serde_json::Value {
    let Some(dept_id) = req.params.get("departmentId").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing params.departmentId", None);
    };
    let Some(uid) = req.params.get("uid").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.uid", None);
    };
    let form_names: Vec<String> = match req.params.get("forms") {
        None => Vec::new(),
        Some(Value::Array(items)) => {
            let mut names = Vec::new();
            for item in items {
                let Some(s) = item.as_str() else {
                    return err(&req.id, "bad_params", "forms must be an array of strings", None);
                };
                names.push(s.to_string());
            }
            names
        }
        Some(_) => {
            return err(&req.id, "bad_params", "forms must be an array of strings", None)
        }
    };

    let get_str = |key: &str| {
        req.params
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let can_view_response_rates = req
        .params
        .get("canViewResponseRates")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let result: anyhow::Result<Result<i64, String>> = (|| {
        if store::get_department(conn, dept_id)?.is_none() {
            return Ok(Err(format!("no department {}", dept_id)));
        }
        let mut form_ids = Vec::new();
        for name in &form_names {
            match store::form_by_name(conn, name)? {
                Some(form) => form_ids.push(form.id),
                None => return Ok(Err(format!("unknown department form: {}", name))),
            }
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO department_contacts(
                department_id, uid, sis_id, first_name, last_name, email, can_view_response_rates
            ) VALUES (?1,?2,?3,?4,?5,?6,?7)
            ON CONFLICT(department_id, uid) DO UPDATE SET
                sis_id = excluded.sis_id,
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                email = excluded.email,
                can_view_response_rates = excluded.can_view_response_rates",
            params![
                dept_id,
                uid,
                get_str("sisId"),
                get_str("firstName"),
                get_str("lastName"),
                get_str("email"),
                can_view_response_rates as i64,
            ],
        )?;
        let contact_id: i64 = tx.query_row(
            "SELECT id FROM department_contacts WHERE department_id = ?1 AND uid = ?2",
            params![dept_id, uid],
            |r| r.get(0),
        )?;
        tx.execute(
            "DELETE FROM contact_department_forms WHERE contact_id = ?1",
            [contact_id],
        )?;
        for form_id in &form_ids {
            tx.execute(
                "INSERT INTO contact_department_forms(contact_id, form_id) VALUES (?1,?2)",
                params![contact_id, form_id],
            )?;
        }
        tx.commit()?;
        Ok(Ok(contact_id))
    })();

    match result {
        Ok(Ok(contact_id)) => ok(
            &req.id,
            json!({
                "contactId": contact_id,
                "departmentId": dept_id,
                "uid": uid,
                "canViewResponseRates": can_view_response_rates,
                "forms": form_names,
            }),
        ),
        Ok(Err(message)) => {
            if message.starts_with("no department") {
                err(&req.id, "not_found", message, None)
            } else {
                err(&req.id, "bad_params", message, None)
            }
        }
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_department_get(conn: &Connection, req: &Request) -> serde_json::Value {
    let Some(dept_id) = req.params.get("departmentId").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing params.departmentId", None);
    };
    let dept = match store::get_department(conn, dept_id) {
        Ok(Some(d)) => d,
        Ok(None) => return err(&req.id, "not_found", format!("no department {}", dept_id), None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let term_id = match store::resolve_term_id(conn, &req.params) {
        Ok(Some(t)) => t,
        Ok(None) => {
            return err(&req.id, "bad_params", "no termId and no currentTermId configured", None)
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let result: anyhow::Result<Value> = (|| {
        let config = store::term_config(conn)?;
        let feed = store::department_feed(conn, &dept, &term_id, &config.exempt_forms)?;
        let mut sections = Vec::new();
        let mut total = 0usize;
        let mut conflict_count = 0usize;
        for entry in &feed {
            let evaluations: Vec<Value> = entry
                .evaluations
                .iter()
                .map(|m| store::evaluation_json(m, &entry.instructors))
                .collect();
            total += entry.evaluations.len();
            conflict_count += entry
                .evaluations
                .iter()
                .filter(|m| !m.conflicts.is_empty())
                .count();
            let mut section = store::section_json(&entry.section);
            section["evaluations"] = Value::Array(evaluations);
            sections.push(section);
        }
        Ok(json!({
            "department": department_json(conn, &dept)?,
            "termId": term_id,
            "sections": sections,
            "evaluationCount": total,
            "conflictCount": conflict_count,
        }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_forms_list(conn: &Connection, req: &Request) -> serde_json::Value {
    match store::list_forms(conn) {
        Ok(forms) => ok(&req.id, json!({ "forms": forms })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_forms_create(conn: &Connection, req: &Request) -> serde_json::Value {
    let Some(name) = req.params.get("name").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.name", None);
    };
    let name = name.trim();
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }

    let result: anyhow::Result<Result<i64, String>> = (|| {
        if store::form_by_name(conn, name)?.is_some() {
            return Ok(Err(format!("form already exists: {}", name)));
        }
        // Re-creating a soft-deleted form restores the most recent row so
        // old evaluations pick their form back up.
        let restored: Option<i64> = conn
            .query_row(
                "SELECT id FROM department_forms
                    WHERE name = ?1 AND deleted_at IS NOT NULL
                    ORDER BY id DESC LIMIT 1",
                [name],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(id) = restored {
            conn.execute(
                "UPDATE department_forms SET deleted_at = NULL WHERE id = ?1",
                [id],
            )?;
            return Ok(Ok(id));
        }
        conn.execute(
            "INSERT INTO department_forms(name, created_at) VALUES (?1, ?2)",
            params![name, Utc::now().to_rfc3339()],
        )?;
        Ok(Ok(conn.last_insert_rowid()))
    })();

    match result {
        Ok(Ok(id)) => ok(&req.id, json!({ "form": { "id": id, "name": name } })),
        Ok(Err(message)) => err(&req.id, "bad_params", message, None),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_forms_delete(conn: &Connection, req: &Request) -> serde_json::Value {
    let Some(name) = req.params.get("name").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.name", None);
    };
    let updated = conn.execute(
        "UPDATE department_forms SET deleted_at = ?1 WHERE name = ?2 AND deleted_at IS NULL",
        params![Utc::now().to_rfc3339(), name],
    );
    match updated {
        Ok(0) => err(&req.id, "not_found", format!("no live form named {}", name), None),
        Ok(_) => ok(&req.id, json!({ "deleted": name })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_types_list(conn: &Connection, req: &Request) -> serde_json::Value {
    match store::list_types(conn) {
        Ok(types) => ok(&req.id, json!({ "evaluationTypes": types })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: fn(&Connection, &Request) -> serde_json::Value = match req.method.as_str() {
        "departments.list" => handle_departments_list,
        "departments.create" => handle_departments_create,
        "departments.updateNote" => handle_departments_update_note,
        "departments.setContact" => handle_departments_set_contact,
        "department.get" => handle_department_get,
        "departmentForms.list" => handle_forms_list,
        "departmentForms.create" => handle_forms_create,
        "departmentForms.delete" => handle_forms_delete,
        "evaluationTypes.list" => handle_types_list,
        _ => return None,
    };
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    Some(handler(conn, req))
}
