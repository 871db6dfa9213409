use crate::confirm::{can_confirm, ConfirmError, PeerView, ProposedFields};
use crate::fields::{parse_field_edits, FieldEdit};
use crate::ipc::error::{err, ok};
use crate::ipc::store::{self, DepartmentRecord};
use crate::ipc::types::{AppState, Request};
use crate::merge::{
    merge_section, DepartmentForm, EvaluationOverride, EvaluationStatus, EvaluationType,
    MergedEvaluation,
};
use crate::term;
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde_json::{json, Value};

/// One row addressed by a bulk operation: either a saved override or a
/// merged view that exists only as a composite transient id.
#[derive(Debug, Clone)]
enum Target {
    Saved(EvaluationOverride),
    Transient {
        transient_id: String,
        course_number: String,
        instructor_uid: Option<String>,
    },
}

impl Target {
    fn course_number(&self) -> &str {
        match self {
            Target::Saved(ov) => &ov.course_number,
            Target::Transient { course_number, .. } => course_number,
        }
    }

    fn instructor_uid(&self) -> Option<&str> {
        match self {
            Target::Saved(ov) => ov.instructor_uid.as_deref(),
            Target::Transient { instructor_uid, .. } => instructor_uid.as_deref(),
        }
    }
}

fn parse_transient_id(s: &str) -> Option<(String, String, Option<String>)> {
    let rest = s.strip_prefix('_')?;
    let mut parts = rest.splitn(3, '_');
    let term_id = parts.next()?;
    let course_number = parts.next()?;
    let uid = parts.next()?;
    if !term::is_valid_term_id(term_id) || course_number.is_empty() || uid.is_empty() {
        return None;
    }
    let uid = if uid == "None" {
        None
    } else {
        Some(uid.to_string())
    };
    Some((term_id.to_string(), course_number.to_string(), uid))
}

/// Field edits with names resolved against the reference tables. The outer
/// `Option` marks whether the request touched the field at all.
#[derive(Debug, Clone, Default)]
struct ResolvedEdits {
    form: Option<Option<DepartmentForm>>,
    eval_type: Option<Option<EvaluationType>>,
    instructor_uid: Option<Option<String>>,
    start_date: Option<Option<NaiveDate>>,
    status: Option<Option<EvaluationStatus>>,
    midterm: bool,
}

impl ResolvedEdits {
    fn confirming(&self) -> bool {
        self.status == Some(Some(EvaluationStatus::Confirmed))
    }

    fn proposed(&self) -> ProposedFields {
        ProposedFields {
            department_form: self.form.clone().flatten(),
            evaluation_type: self.eval_type.clone().flatten(),
            instructor_uid: self.instructor_uid.clone().flatten(),
            start_date: self.start_date.flatten(),
        }
    }
}

fn resolve_edits(
    conn: &Connection,
    edits: &[FieldEdit],
) -> anyhow::Result<Result<ResolvedEdits, String>> {
    let mut out = ResolvedEdits::default();
    for edit in edits {
        match edit {
            FieldEdit::DepartmentForm(None) => out.form = Some(None),
            FieldEdit::DepartmentForm(Some(name)) => match store::form_by_name(conn, name)? {
                Some(form) => out.form = Some(Some(form)),
                None => return Ok(Err(format!("unknown department form: {}", name))),
            },
            FieldEdit::EvaluationType(None) => out.eval_type = Some(None),
            FieldEdit::EvaluationType(Some(name)) => match store::type_by_name(conn, name)? {
                Some(t) => out.eval_type = Some(Some(t)),
                None => return Ok(Err(format!("unknown evaluation type: {}", name))),
            },
            FieldEdit::InstructorUid(uid) => out.instructor_uid = Some(uid.clone()),
            FieldEdit::StartDate(date) => out.start_date = Some(*date),
            FieldEdit::Status(status) => out.status = Some(*status),
            FieldEdit::Midterm => out.midterm = true,
        }
    }
    Ok(Ok(out))
}

fn parse_targets(
    conn: &Connection,
    req: &Request,
    term_id: &str,
    department: &DepartmentRecord,
) -> Result<Vec<Target>, Value> {
    let Some(ids) = req.params.get("evaluationIds").and_then(|v| v.as_array()) else {
        return Err(err(&req.id, "bad_params", "missing params.evaluationIds", None));
    };
    if ids.is_empty() {
        return Err(err(&req.id, "bad_params", "evaluationIds must not be empty", None));
    }

    let mut targets = Vec::new();
    for raw in ids {
        let numeric = raw
            .as_i64()
            .or_else(|| raw.as_str().and_then(|s| s.parse::<i64>().ok()));
        if let Some(id) = numeric {
            let ov = match store::load_override(conn, id) {
                Ok(Some(ov)) => ov,
                Ok(None) => {
                    return Err(err(&req.id, "not_found", format!("no evaluation {}", id), None))
                }
                Err(e) => return Err(err(&req.id, "db_query_failed", e.to_string(), None)),
            };
            if ov.term_id != term_id || ov.department_id != department.id {
                return Err(err(
                    &req.id,
                    "not_found",
                    format!("evaluation {} is not in this department and term", id),
                    None,
                ));
            }
            targets.push(Target::Saved(ov));
            continue;
        }
        let Some(s) = raw.as_str() else {
            return Err(err(&req.id, "bad_params", "evaluation ids must be numbers or strings", None));
        };
        let Some((id_term, course_number, instructor_uid)) = parse_transient_id(s) else {
            return Err(err(&req.id, "bad_params", format!("malformed evaluation id: {}", s), None));
        };
        if id_term != term_id {
            return Err(err(
                &req.id,
                "bad_params",
                format!("evaluation id {} names a different term", s),
                None,
            ));
        }
        targets.push(Target::Transient {
            transient_id: s.to_string(),
            course_number,
            instructor_uid,
        });
    }
    Ok(targets)
}

/// Merged view and cross-department peer views for one target.
fn merged_view(
    conn: &Connection,
    term_id: &str,
    department: &DepartmentRecord,
    exempt_forms: &[String],
    target: &Target,
) -> anyhow::Result<Option<(MergedEvaluation, Vec<PeerView>)>> {
    let ccn = target.course_number();
    let Some(section) = store::load_section(conn, term_id, ccn)? else {
        return Ok(None);
    };
    let listings = store::load_listings(conn, department.id)?;
    let partners = section.partner_course_numbers();
    let overrides = store::load_overrides_for_courses(conn, term_id, &partners)?;
    let (home, foreign): (Vec<_>, Vec<_>) = overrides
        .into_iter()
        .partition(|o| o.department_id == department.id && o.course_number == *ccn);
    let all: Vec<EvaluationOverride> = home.iter().chain(foreign.iter()).cloned().collect();
    let ctx =
        store::merge_context_for_section(conn, term_id, &section, &listings, exempt_forms, &all)?;
    let merged = merge_section(&section, &home, &foreign, &ctx);

    let entry = merged.into_iter().find(|m| match target {
        Target::Saved(ov) => m.id == Some(ov.id),
        Target::Transient { instructor_uid, .. } => {
            m.id.is_none() && m.instructor_uid.as_deref() == instructor_uid.as_deref()
        }
    });
    let Some(entry) = entry else {
        return Ok(None);
    };

    let uid = entry.instructor_uid.clone();
    let peers = foreign
        .iter()
        .filter(|f| {
            f.is_visible()
                && (f.instructor_uid.is_none() || uid.is_none() || f.instructor_uid == uid)
        })
        .map(|f| PeerView {
            department_name: f.department_name.clone(),
            department_form: f.department_form.clone(),
            evaluation_type: f.evaluation_type.clone(),
            start_date: f.start_date,
        })
        .collect();
    Ok(Some((entry, peers)))
}

/// The `_MID` variant for a target's effective form: an explicit form edit
/// wins, then the saved value, then the merged default.
fn midterm_form(
    conn: &Connection,
    term_id: &str,
    department: &DepartmentRecord,
    exempt_forms: &[String],
    target: &Target,
    edits: &ResolvedEdits,
) -> anyhow::Result<Result<DepartmentForm, String>> {
    let base = if let Some(form) = &edits.form {
        form.clone()
    } else if let Target::Saved(ov) = target {
        ov.department_form.clone()
    } else {
        None
    };
    let base = match base {
        Some(form) => Some(form),
        None => merged_view(conn, term_id, department, exempt_forms, target)?
            .and_then(|(m, _)| m.department_form),
    };
    let Some(base) = base else {
        return Ok(Err("evaluation has no department form to take a midterm variant of".into()));
    };
    let base_name = base.name.strip_suffix("_MID").unwrap_or(&base.name);
    let midterm_name = format!("{}_MID", base_name);
    match store::form_by_name(conn, &midterm_name)? {
        Some(form) => Ok(Ok(form)),
        None => Ok(Err(format!("no midterm variant form named {}", midterm_name))),
    }
}

fn materialize(
    conn: &Connection,
    term_id: &str,
    department_id: i64,
    course_number: &str,
    instructor_uid: Option<&str>,
    actor: Option<&str>,
    now: &str,
) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO evaluations(
            term_id, department_id, course_number, instructor_uid,
            created_by, created_at, updated_by, updated_at
        ) VALUES (?1,?2,?3,?4,?5,?6,?5,?6)",
        params![term_id, department_id, course_number, instructor_uid, actor, now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Marked/confirmed status (and clearing one) syncs onto other departments'
/// saved rows for the same pairing; `ignore` and `deleted` stay local.
fn propagate_status(
    conn: &Connection,
    term_id: &str,
    department_id: i64,
    partners: &[String],
    instructor_uid: Option<&str>,
    status: Option<EvaluationStatus>,
    now: &str,
) -> anyhow::Result<()> {
    if matches!(
        status,
        Some(EvaluationStatus::Ignore) | Some(EvaluationStatus::Deleted)
    ) {
        return Ok(());
    }
    let placeholders: Vec<String> = (0..partners.len()).map(|i| format!("?{}", i + 6)).collect();
    let sql = format!(
        "UPDATE evaluations SET status = ?1, updated_at = ?2
            WHERE term_id = ?3 AND department_id != ?4
              AND instructor_uid IS ?5
              AND course_number IN ({})",
        placeholders.join(", ")
    );
    let status_text = status.map(|s| s.as_str());
    let mut values: Vec<&dyn rusqlite::ToSql> =
        vec![&status_text, &now, &term_id, &department_id, &instructor_uid];
    for ccn in partners {
        values.push(ccn);
    }
    conn.execute(&sql, values.as_slice())?;
    Ok(())
}

fn handle_update_bulk(conn: &Connection, req: &Request) -> serde_json::Value {
    let Some(dept_id) = req.params.get("departmentId").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing params.departmentId", None);
    };
    let department = match store::get_department(conn, dept_id) {
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
    let Some(fields) = req.params.get("fields").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing params.fields", None);
    };
    let edits = match parse_field_edits(fields) {
        Ok(edits) => edits,
        Err(message) => return err(&req.id, "bad_params", message, None),
    };
    if edits.is_empty() {
        return err(&req.id, "bad_params", "fields must name at least one edit", None);
    }
    let resolved = match resolve_edits(conn, &edits) {
        Ok(Ok(r)) => r,
        Ok(Err(message)) => return err(&req.id, "bad_params", message, None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let targets = match parse_targets(conn, req, &term_id, &department) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let config = match store::term_config(conn) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Confirmation is gated before anything is written: the whole batch
    // must be complete and conflict-free with the proposed fields applied.
    if resolved.confirming() {
        let mut batch = Vec::new();
        for target in &targets {
            match merged_view(conn, &term_id, &department, &config.exempt_forms, target) {
                Ok(Some(entry)) => batch.push(entry),
                Ok(None) => {
                    return err(
                        &req.id,
                        "not_found",
                        format!("no section rows behind evaluation on {}", target.course_number()),
                        None,
                    )
                }
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
        if let Err(gate) = can_confirm(&batch, &resolved.proposed()) {
            let (code, message) = match &gate {
                ConfirmError::Incomplete { .. } => {
                    ("incomplete", "evaluations are missing required fields")
                }
                ConfirmError::Conflicting { .. } => {
                    ("conflicting", "evaluations disagree with another department")
                }
            };
            return err(
                &req.id,
                code,
                message,
                Some(json!({ "evaluationIds": gate.evaluation_ids() })),
            );
        }
    }

    let actor = req.params.get("actor").and_then(|v| v.as_str());
    let now = Utc::now().to_rfc3339();

    let result: anyhow::Result<Result<Vec<Value>, String>> = (|| {
        // Per-target midterm forms are resolved before the transaction.
        let mut midterm_forms: Vec<Option<DepartmentForm>> = Vec::new();
        for target in &targets {
            if resolved.midterm {
                match midterm_form(conn, &term_id, &department, &config.exempt_forms, target, &resolved)? {
                    Ok(form) => midterm_forms.push(Some(form)),
                    Err(message) => return Ok(Err(message)),
                }
            } else {
                midterm_forms.push(None);
            }
        }

        let tx = conn.unchecked_transaction()?;
        let mut updated = Vec::new();
        for (target, midterm) in targets.iter().zip(midterm_forms) {
            let (row_id, transient) = match target {
                Target::Saved(ov) => (ov.id, None),
                Target::Transient {
                    transient_id,
                    course_number,
                    instructor_uid,
                } => {
                    let id = materialize(
                        &tx,
                        &term_id,
                        department.id,
                        course_number,
                        instructor_uid.as_deref(),
                        actor,
                        &now,
                    )?;
                    (id, Some(transient_id.clone()))
                }
            };

            if let Some(form) = &resolved.form {
                tx.execute(
                    "UPDATE evaluations SET department_form_id = ?1 WHERE id = ?2",
                    params![form.as_ref().map(|f| f.id), row_id],
                )?;
            }
            if let Some(form) = &midterm {
                tx.execute(
                    "UPDATE evaluations SET department_form_id = ?1 WHERE id = ?2",
                    params![form.id, row_id],
                )?;
            }
            if let Some(eval_type) = &resolved.eval_type {
                tx.execute(
                    "UPDATE evaluations SET evaluation_type_id = ?1 WHERE id = ?2",
                    params![eval_type.as_ref().map(|t| t.id), row_id],
                )?;
            }
            if let Some(uid) = &resolved.instructor_uid {
                tx.execute(
                    "UPDATE evaluations SET instructor_uid = ?1 WHERE id = ?2",
                    params![uid, row_id],
                )?;
            }
            if let Some(start) = &resolved.start_date {
                tx.execute(
                    "UPDATE evaluations SET start_date = ?1 WHERE id = ?2",
                    params![start.map(term::format_date), row_id],
                )?;
            }
            if let Some(status) = &resolved.status {
                tx.execute(
                    "UPDATE evaluations SET status = ?1 WHERE id = ?2",
                    params![status.map(|s| s.as_str()), row_id],
                )?;
                let partners = match store::load_section(&tx, &term_id, target.course_number())? {
                    Some(section) => section.partner_course_numbers(),
                    None => vec![target.course_number().to_string()],
                };
                propagate_status(
                    &tx,
                    &term_id,
                    department.id,
                    &partners,
                    target.instructor_uid(),
                    *status,
                    &now,
                )?;
            }
            tx.execute(
                "UPDATE evaluations SET updated_by = ?1, updated_at = ?2 WHERE id = ?3",
                params![actor, now, row_id],
            )?;

            let mut entry = json!({ "id": row_id });
            if let Some(transient_id) = transient {
                entry["transientId"] = json!(transient_id);
            }
            updated.push(entry);
        }
        tx.commit()?;
        Ok(Ok(updated))
    })();

    match result {
        Ok(Ok(updated)) => ok(&req.id, json!({ "termId": term_id, "updated": updated })),
        Ok(Err(message)) => err(&req.id, "bad_params", message, None),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_duplicate(conn: &Connection, req: &Request) -> serde_json::Value {
    let Some(dept_id) = req.params.get("departmentId").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing params.departmentId", None);
    };
    let department = match store::get_department(conn, dept_id) {
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
    let edits = match req.params.get("fields").and_then(|v| v.as_object()) {
        Some(fields) => match parse_field_edits(fields) {
            Ok(edits) => edits,
            Err(message) => return err(&req.id, "bad_params", message, None),
        },
        None => Vec::new(),
    };
    let resolved = match resolve_edits(conn, &edits) {
        Ok(Ok(r)) => r,
        Ok(Err(message)) => return err(&req.id, "bad_params", message, None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let targets = match parse_targets(conn, req, &term_id, &department) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let config = match store::term_config(conn) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let actor = req.params.get("actor").and_then(|v| v.as_str());
    let now = Utc::now().to_rfc3339();

    let result: anyhow::Result<Result<Vec<Value>, String>> = (|| {
        let mut midterm_forms: Vec<Option<DepartmentForm>> = Vec::new();
        for target in &targets {
            if resolved.midterm {
                match midterm_form(conn, &term_id, &department, &config.exempt_forms, target, &resolved)? {
                    Ok(form) => midterm_forms.push(Some(form)),
                    Err(message) => return Ok(Err(message)),
                }
            } else {
                midterm_forms.push(None);
            }
        }

        let tx = conn.unchecked_transaction()?;
        let mut created = Vec::new();
        for (target, midterm) in targets.iter().zip(midterm_forms) {
            let base = match target {
                Target::Saved(ov) => ov.clone(),
                Target::Transient {
                    course_number,
                    instructor_uid,
                    ..
                } => EvaluationOverride {
                    id: 0,
                    term_id: term_id.clone(),
                    department_id: department.id,
                    department_name: department.name.clone(),
                    course_number: course_number.clone(),
                    instructor_uid: instructor_uid.clone(),
                    status: None,
                    department_form: None,
                    evaluation_type: None,
                    start_date: None,
                    end_date: None,
                    updated_at: None,
                },
            };

            let form = midterm
                .clone()
                .map(Some)
                .or_else(|| resolved.form.clone())
                .unwrap_or(base.department_form);
            let eval_type = resolved.eval_type.clone().unwrap_or(base.evaluation_type);
            let instructor_uid = resolved
                .instructor_uid
                .clone()
                .unwrap_or(base.instructor_uid);
            let start_date = resolved.start_date.unwrap_or(base.start_date);
            let status = resolved.status.unwrap_or(base.status);

            tx.execute(
                "INSERT INTO evaluations(
                    term_id, department_id, course_number, instructor_uid, status,
                    department_form_id, evaluation_type_id, start_date,
                    created_by, created_at, updated_by, updated_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?9,?10)",
                params![
                    term_id,
                    department.id,
                    base.course_number,
                    instructor_uid,
                    status.map(|s| s.as_str()),
                    form.as_ref().map(|f| f.id),
                    eval_type.as_ref().map(|t| t.id),
                    start_date.map(term::format_date),
                    actor,
                    now,
                ],
            )?;
            let mut entry = json!({ "id": tx.last_insert_rowid() });
            if let Target::Transient { transient_id, .. } = target {
                entry["transientId"] = json!(transient_id);
            }
            created.push(entry);
        }
        tx.commit()?;
        Ok(Ok(created))
    })();

    match result {
        Ok(Ok(created)) => ok(&req.id, json!({ "termId": term_id, "created": created })),
        Ok(Err(message)) => err(&req.id, "bad_params", message, None),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn handle_validate(conn: &Connection, req: &Request) -> serde_json::Value {
    let term_id = match store::resolve_term_id(conn, &req.params) {
        Ok(Some(t)) => t,
        Ok(None) => {
            return err(&req.id, "bad_params", "no termId and no currentTermId configured", None)
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let result: anyhow::Result<Value> = (|| {
        let config = store::term_config(conn)?;
        let mut invalid = Vec::new();
        let mut blocker_count = 0usize;
        for department in store::list_departments(conn)? {
            if !department.is_enrolled {
                continue;
            }
            let feed = store::department_feed(conn, &department, &term_id, &config.exempt_forms)?;
            for entry in feed {
                for m in entry.evaluations.iter().filter(|m| !m.valid) {
                    if m.status == Some(EvaluationStatus::Confirmed) {
                        blocker_count += 1;
                    }
                    let mut row = store::evaluation_json(m, &entry.instructors);
                    row["departmentId"] = json!(department.id);
                    row["departmentName"] = json!(department.name);
                    invalid.push(row);
                }
            }
        }
        Ok(json!({
            "termId": term_id,
            "invalid": invalid,
            "blockerCount": blocker_count,
        }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: fn(&Connection, &Request) -> serde_json::Value = match req.method.as_str() {
        "evaluations.updateBulk" => handle_update_bulk,
        "evaluations.duplicate" => handle_duplicate,
        "evaluations.validate" => handle_validate,
        _ => return None,
    };
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    Some(handler(conn, req))
}
