use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::term;
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct SectionCsvRow {
    term_id: String,
    course_number: String,
    subject_area: String,
    catalog_id: String,
    instruction_format: String,
    section_num: String,
    course_title: String,
    is_primary: String,
    #[serde(default)]
    instructor_uid: Option<String>,
    #[serde(default)]
    instructor_role_code: Option<String>,
    #[serde(default)]
    meeting_start_date: Option<String>,
    #[serde(default)]
    meeting_end_date: Option<String>,
    #[serde(default)]
    enrollment_count: Option<i64>,
    #[serde(default)]
    cross_listed_with: Option<String>,
    #[serde(default)]
    room_shared_with: Option<String>,
    #[serde(default)]
    foreign_department_course: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstructorCsvRow {
    uid: String,
    #[serde(default)]
    sis_id: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    affiliations: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StudentCsvRow {
    uid: String,
    #[serde(default)]
    sis_id: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnrollmentCsvRow {
    term_id: String,
    course_number: String,
    uid: String,
}

#[derive(Debug, Deserialize)]
struct TermCsvRow {
    id: String,
    name: String,
    begin_date: String,
    end_date: String,
}

fn blank_to_null(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let s = s.trim().to_string();
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    })
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_uppercase().as_str(),
        "TRUE" | "Y" | "YES" | "1"
    )
}

fn csv_reader(path: &str) -> Result<csv::Reader<std::fs::File>, String> {
    if !Path::new(path).is_file() {
        return Err(format!("file not found: {}", path));
    }
    csv::Reader::from_path(path).map_err(|e| e.to_string())
}

fn required_params<'a>(req: &'a Request) -> Result<&'a str, serde_json::Value> {
    req.params
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| err(&req.id, "bad_params", "missing params.path", None))
}

fn import_sections(conn: &Connection, req: &Request) -> serde_json::Value {
    let path = match required_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let Some(term_id) = req.params.get("termId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.termId", None);
    };
    if !term::is_valid_term_id(term_id) {
        return err(&req.id, "bad_params", format!("malformed term id: {}", term_id), None);
    }
    let mut reader = match csv_reader(path) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "bad_params", e, None),
    };

    let loaded_at = Utc::now().to_rfc3339();
    let result: anyhow::Result<usize> = (|| {
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM sis_sections WHERE term_id = ?1", [term_id])?;
        let mut count = 0usize;
        for record in reader.deserialize::<SectionCsvRow>() {
            let row = record?;
            if row.term_id != term_id {
                continue;
            }
            tx.execute(
                "INSERT INTO sis_sections(
                    term_id, course_number, subject_area, catalog_id,
                    instruction_format, section_num, course_title, is_primary,
                    instructor_uid, instructor_role_code, meeting_start_date,
                    meeting_end_date, enrollment_count, cross_listed_with,
                    room_shared_with, foreign_department_course, loaded_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
                params![
                    row.term_id,
                    row.course_number,
                    row.subject_area,
                    row.catalog_id,
                    row.instruction_format,
                    row.section_num,
                    row.course_title,
                    parse_flag(&row.is_primary) as i64,
                    blank_to_null(row.instructor_uid),
                    blank_to_null(row.instructor_role_code),
                    blank_to_null(row.meeting_start_date),
                    blank_to_null(row.meeting_end_date),
                    row.enrollment_count.unwrap_or(0),
                    blank_to_null(row.cross_listed_with),
                    blank_to_null(row.room_shared_with),
                    row.foreign_department_course
                        .as_deref()
                        .map(parse_flag)
                        .unwrap_or(false) as i64,
                    loaded_at,
                ],
            )?;
            count += 1;
        }
        tx.commit()?;
        Ok(count)
    })();

    match result {
        Ok(count) => ok(&req.id, json!({ "termId": term_id, "imported": count })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn import_instructors(conn: &Connection, req: &Request) -> serde_json::Value {
    let path = match required_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let mut reader = match csv_reader(path) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "bad_params", e, None),
    };
    let loaded_at = Utc::now().to_rfc3339();
    let result: anyhow::Result<usize> = (|| {
        let tx = conn.unchecked_transaction()?;
        let mut count = 0usize;
        for record in reader.deserialize::<InstructorCsvRow>() {
            let row = record?;
            tx.execute(
                "INSERT INTO sis_instructors(uid, sis_id, first_name, last_name, email, affiliations, loaded_at)
                    VALUES (?1,?2,?3,?4,?5,?6,?7)
                    ON CONFLICT(uid) DO UPDATE SET
                        sis_id = excluded.sis_id,
                        first_name = excluded.first_name,
                        last_name = excluded.last_name,
                        email = excluded.email,
                        affiliations = excluded.affiliations,
                        loaded_at = excluded.loaded_at",
                params![
                    row.uid,
                    blank_to_null(row.sis_id),
                    blank_to_null(row.first_name),
                    blank_to_null(row.last_name),
                    blank_to_null(row.email),
                    blank_to_null(row.affiliations),
                    loaded_at,
                ],
            )?;
            count += 1;
        }
        tx.commit()?;
        Ok(count)
    })();
    match result {
        Ok(count) => ok(&req.id, json!({ "imported": count })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn import_students(conn: &Connection, req: &Request) -> serde_json::Value {
    let path = match required_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let mut reader = match csv_reader(path) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "bad_params", e, None),
    };
    let loaded_at = Utc::now().to_rfc3339();
    let result: anyhow::Result<usize> = (|| {
        let tx = conn.unchecked_transaction()?;
        let mut count = 0usize;
        for record in reader.deserialize::<StudentCsvRow>() {
            let row = record?;
            tx.execute(
                "INSERT INTO sis_students(uid, sis_id, first_name, last_name, email, loaded_at)
                    VALUES (?1,?2,?3,?4,?5,?6)
                    ON CONFLICT(uid) DO UPDATE SET
                        sis_id = excluded.sis_id,
                        first_name = excluded.first_name,
                        last_name = excluded.last_name,
                        email = excluded.email,
                        loaded_at = excluded.loaded_at",
                params![
                    row.uid,
                    blank_to_null(row.sis_id),
                    blank_to_null(row.first_name),
                    blank_to_null(row.last_name),
                    blank_to_null(row.email),
                    loaded_at,
                ],
            )?;
            count += 1;
        }
        tx.commit()?;
        Ok(count)
    })();
    match result {
        Ok(count) => ok(&req.id, json!({ "imported": count })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn import_enrollments(conn: &Connection, req: &Request) -> serde_json::Value {
    let path = match required_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let Some(term_id) = req.params.get("termId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.termId", None);
    };
    let mut reader = match csv_reader(path) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "bad_params", e, None),
    };
    let result: anyhow::Result<usize> = (|| {
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM sis_enrollments WHERE term_id = ?1", [term_id])?;
        let mut count = 0usize;
        for record in reader.deserialize::<EnrollmentCsvRow>() {
            let row = record?;
            if row.term_id != term_id {
                continue;
            }
            tx.execute(
                "INSERT OR IGNORE INTO sis_enrollments(term_id, course_number, uid)
                    VALUES (?1,?2,?3)",
                params![row.term_id, row.course_number, row.uid],
            )?;
            count += 1;
        }
        tx.commit()?;
        Ok(count)
    })();
    match result {
        Ok(count) => ok(&req.id, json!({ "termId": term_id, "imported": count })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

fn import_terms(conn: &Connection, req: &Request) -> serde_json::Value {
    let path = match required_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let mut reader = match csv_reader(path) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "bad_params", e, None),
    };
    let result: anyhow::Result<usize> = (|| {
        let tx = conn.unchecked_transaction()?;
        let mut count = 0usize;
        for record in reader.deserialize::<TermCsvRow>() {
            let row = record?;
            tx.execute(
                "INSERT INTO sis_terms(id, name, begin_date, end_date)
                    VALUES (?1,?2,?3,?4)
                    ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        begin_date = excluded.begin_date,
                        end_date = excluded.end_date",
                params![row.id, row.name, row.begin_date, row.end_date],
            )?;
            count += 1;
        }
        tx.commit()?;
        Ok(count)
    })();
    match result {
        Ok(count) => ok(&req.id, json!({ "imported": count })),
        Err(e) => err(&req.id, "db_write_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: fn(&Connection, &Request) -> serde_json::Value = match req.method.as_str() {
        "sis.importSections" => import_sections,
        "sis.importInstructors" => import_instructors,
        "sis.importStudents" => import_students,
        "sis.importEnrollments" => import_enrollments,
        "sis.importTerms" => import_terms,
        _ => return None,
    };
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    Some(handler(conn, req))
}
