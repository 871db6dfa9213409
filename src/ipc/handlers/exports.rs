use crate::bundle;
use crate::export::{self, DirectoryPerson, ExportData, SupervisorRecord};
use crate::ipc::error::{err, ok};
use crate::ipc::store;
use crate::ipc::types::{AppState, Request};
use crate::merge::{EvaluationStatus, MergedEvaluation};
use crate::term;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

/// Confirmed merged evaluations for the whole term, gathered department by
/// department, plus the set of blockers (confirmed but invalid). Only
/// saved rows count: a cross-listed partner view that merely inherits the
/// confirmed status has no row of its own and is not exported.
fn confirmed_set(
    conn: &Connection,
    term_id: &str,
    exempt_forms: &[String],
) -> anyhow::Result<(Vec<MergedEvaluation>, Vec<String>)> {
    let mut confirmed = Vec::new();
    let mut blockers = Vec::new();
    for department in store::list_departments(conn)? {
        if !department.is_enrolled {
            continue;
        }
        let feed = store::department_feed(conn, &department, term_id, exempt_forms)?;
        for entry in feed {
            for m in entry.evaluations {
                if m.id.is_none() || m.status != Some(EvaluationStatus::Confirmed) {
                    continue;
                }
                if !m.valid {
                    blockers.push(m.feed_id());
                    continue;
                }
                confirmed.push(m);
            }
        }
    }
    Ok((confirmed, blockers))
}

/// Default form names per course number, for cross-listed supervisor
/// propagation. The claiming department's first matching listing decides,
/// cross-listed or not.
fn default_form_names(
    conn: &Connection,
    term_id: &str,
    course_numbers: &BTreeSet<String>,
) -> anyhow::Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    let departments = store::list_departments(conn)?;
    for ccn in course_numbers {
        let Some(section) = store::load_section(conn, term_id, ccn)? else {
            continue;
        };
        'depts: for department in &departments {
            let listings = store::load_listings(conn, department.id)?;
            for listing in &listings {
                if listing.matches(&section.subject_area, &section.catalog_id) {
                    if let Some(form_id) = listing.default_form_id {
                        if let Some(form) = store::form_by_id(conn, form_id)? {
                            out.insert(ccn.clone(), form.name);
                            break 'depts;
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

fn form_supervisors(conn: &Connection) -> anyhow::Result<BTreeMap<String, Vec<String>>> {
    let mut stmt = conn.prepare(
        "SELECT f.name, c.uid
            FROM contact_department_forms cf
            JOIN department_contacts c ON c.id = cf.contact_id
            JOIN department_forms f ON f.id = cf.form_id
            WHERE f.deleted_at IS NULL
            ORDER BY f.name, cf.contact_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in rows {
        let (form, uid) = row?;
        let uids = out.entry(form).or_default();
        if !uids.contains(&uid) {
            uids.push(uid);
        }
    }
    Ok(out)
}

fn supervisors(conn: &Connection) -> anyhow::Result<Vec<SupervisorRecord>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.uid, c.sis_id, c.first_name, c.last_name, c.email,
                c.can_view_response_rates
            FROM department_contacts c
            JOIN departments d ON d.id = c.department_id
            WHERE d.is_enrolled = 1
            ORDER BY c.uid, c.id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                SupervisorRecord {
                    uid: row.get(1)?,
                    sis_id: row.get(2)?,
                    first_name: row.get(3)?,
                    last_name: row.get(4)?,
                    email: row.get(5)?,
                    can_view_response_rates: row.get::<_, i64>(6)? != 0,
                    department_forms: Vec::new(),
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut form_stmt = conn.prepare(
        "SELECT f.name FROM contact_department_forms cf
            JOIN department_forms f ON f.id = cf.form_id
            WHERE cf.contact_id = ?1 AND f.deleted_at IS NULL
            ORDER BY cf.form_id",
    )?;
    let mut out: Vec<SupervisorRecord> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for (contact_id, mut record) in rows {
        if !seen.insert(record.uid.clone()) {
            continue;
        }
        let forms = form_stmt
            .query_map([contact_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        record.department_forms = forms;
        out.push(record);
    }
    Ok(out)
}

fn build_export_data(
    conn: &Connection,
    term_id: &str,
    confirmed: Vec<MergedEvaluation>,
) -> anyhow::Result<ExportData> {
    let mut data = ExportData {
        term_id: term_id.to_string(),
        evaluations: confirmed,
        ..Default::default()
    };

    let course_numbers: BTreeSet<String> = data
        .evaluations
        .iter()
        .map(|m| m.course_number.clone())
        .collect();
    let mut partner_numbers: BTreeSet<String> = BTreeSet::new();
    for ccn in &course_numbers {
        if let Some(section) = store::load_section(conn, term_id, ccn)? {
            partner_numbers.extend(section.partner_course_numbers());
            data.sections.insert(ccn.clone(), section);
        }
    }

    let mut enrollment_stmt = conn.prepare(
        "SELECT uid FROM sis_enrollments
            WHERE term_id = ?1 AND course_number = ?2 ORDER BY uid",
    )?;
    let mut student_stmt = conn.prepare(
        "SELECT uid, sis_id, first_name, last_name, email
            FROM sis_students WHERE uid = ?1",
    )?;
    for ccn in &course_numbers {
        let uids = enrollment_stmt
            .query_map(params![term_id, ccn], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for uid in &uids {
            if data.students.contains_key(uid) {
                continue;
            }
            let student = student_stmt
                .query_row([uid], |row| {
                    Ok(DirectoryPerson {
                        uid: row.get(0)?,
                        sis_id: row.get(1)?,
                        first_name: row.get(2)?,
                        last_name: row.get(3)?,
                        email: row.get(4)?,
                    })
                })
                .optional()?;
            if let Some(student) = student {
                data.students.insert(uid.clone(), student);
            }
        }
        data.enrollments.insert(ccn.clone(), uids);
    }

    let instructor_uids: BTreeSet<String> = data
        .evaluations
        .iter()
        .filter_map(|m| m.instructor_uid.clone())
        .collect();
    data.instructors = store::load_instructors(conn, &instructor_uids)?;

    data.form_supervisors = form_supervisors(conn)?;
    data.default_form_names = default_form_names(conn, term_id, &partner_numbers)?;
    data.supervisors = supervisors(conn)?;
    Ok(data)
}

fn record_run(
    conn: &Connection,
    run_id: &str,
    term_id: &str,
    path: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO export_runs(id, term_id, path, status, started_at)
            VALUES (?1, ?2, ?3, 'started', ?4)",
        params![run_id, term_id, path, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn finish_run(conn: &Connection, run_id: &str, status: &str, error: Option<&str>) {
    let _ = conn.execute(
        "UPDATE export_runs SET status = ?1, error = ?2, finished_at = ?3 WHERE id = ?4",
        params![status, error, Utc::now().to_rfc3339(), run_id],
    );
}

fn handle_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (Some(conn), Some(workspace)) = (state.db.as_ref(), state.workspace.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let term_id = match store::resolve_term_id(conn, &req.params) {
        Ok(Some(t)) => t,
        Ok(None) => {
            return err(&req.id, "bad_params", "no termId and no currentTermId configured", None)
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !term::is_valid_term_id(&term_id) {
        return err(&req.id, "bad_params", format!("malformed term id: {}", term_id), None);
    }
    let config = match store::term_config(conn) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let (confirmed, blockers) = match confirmed_set(conn, &term_id, &config.exempt_forms) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !blockers.is_empty() {
        return err(
            &req.id,
            "export_blocked",
            "confirmed evaluations have validation blockers",
            Some(json!({ "evaluationIds": blockers })),
        );
    }

    let data = match build_export_data(conn, &term_id, confirmed) {
        Ok(d) => d,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let run_id = uuid::Uuid::new_v4().to_string();
    let timestamp = Utc::now().format("%Y-%m-%d-%H%M%S").to_string();
    let exports_root = workspace.join("exports");
    let run_path = Path::new("exports").join(&term_id).join(&timestamp);
    if let Err(e) = record_run(conn, &run_id, &term_id, &run_path.to_string_lossy()) {
        return err(&req.id, "db_write_failed", e.to_string(), None);
    }

    let result = export::generate_export_tables(&data)
        .and_then(|tables| bundle::write_export_bundle(&exports_root, &term_id, &timestamp, &tables));
    match result {
        Ok(summary) => {
            finish_run(conn, &run_id, "success", None);
            let row_counts: Value = summary
                .row_counts
                .iter()
                .map(|(name, count)| (name.clone(), json!(count)))
                .collect::<serde_json::Map<_, _>>()
                .into();
            ok(
                &req.id,
                json!({
                    "runId": run_id,
                    "termId": term_id,
                    "evaluationCount": data.evaluations.len(),
                    "path": summary.run_dir.to_string_lossy(),
                    "bundlePath": summary.bundle_path.to_string_lossy(),
                    "rowCounts": row_counts,
                }),
            )
        }
        Err(e) => {
            finish_run(conn, &run_id, "error", Some(&e.to_string()));
            err(&req.id, "export_failed", e.to_string(), None)
        }
    }
}

fn run_json(row: &rusqlite::Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "runId": row.get::<_, String>(0)?,
        "termId": row.get::<_, String>(1)?,
        "path": row.get::<_, String>(2)?,
        "status": row.get::<_, String>(3)?,
        "error": row.get::<_, Option<String>>(4)?,
        "startedAt": row.get::<_, String>(5)?,
        "finishedAt": row.get::<_, Option<String>>(6)?,
    }))
}

fn handle_exports_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let term_filter = req.params.get("termId").and_then(|v| v.as_str());
    let result: anyhow::Result<Vec<Value>> = (|| {
        let mut stmt = conn.prepare(
            "SELECT id, term_id, path, status, error, started_at, finished_at
                FROM export_runs
                WHERE (?1 IS NULL OR term_id = ?1)
                ORDER BY started_at DESC, id",
        )?;
        let rows = stmt.query_map([term_filter], run_json)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    })();
    match result {
        Ok(runs) => ok(&req.id, json!({ "runs": runs })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_exports_latest(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result: anyhow::Result<Option<Value>> = (|| {
        let mut stmt = conn.prepare(
            "SELECT id, term_id, path, status, error, started_at, finished_at
                FROM export_runs ORDER BY started_at DESC, id LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], run_json)?;
        Ok(rows.next().transpose()?)
    })();
    match result {
        Ok(Some(run)) => ok(&req.id, json!({ "run": run })),
        Ok(None) => ok(&req.id, json!({ "run": null })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "evaluations.export" => Some(handle_export(state, req)),
        "exports.list" => Some(handle_exports_list(state, req)),
        "exports.latest" => Some(handle_exports_latest(state, req)),
        _ => None,
    }
}
