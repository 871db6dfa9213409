use crate::merge::{
    merge_section, DepartmentForm, EvaluationOverride, EvaluationStatus, EvaluationType,
    Instructor, MergeContext, MergedEvaluation,
};
use crate::section::{self, CatalogListing, Section, SectionRow};
use crate::term;
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone)]
pub struct DepartmentRecord {
    pub id: i64,
    pub name: String,
    pub is_enrolled: bool,
    pub note: Option<String>,
    pub note_updated_at: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TermConfig {
    pub current_term_id: Option<String>,
    pub earliest_term_id: Option<String>,
    pub exempt_forms: Vec<String>,
}

const DEFAULT_EXEMPT_FORMS: [&str; 1] = ["LAW"];

pub fn term_config(conn: &Connection) -> anyhow::Result<TermConfig> {
    let current_term_id = crate::db::settings_get_json(conn, "currentTermId")?
        .and_then(|v| v.as_str().map(|s| s.to_string()));
    let earliest_term_id = crate::db::settings_get_json(conn, "earliestTermId")?
        .and_then(|v| v.as_str().map(|s| s.to_string()));
    let exempt_forms = match crate::db::settings_get_json(conn, "exemptDepartmentForms")? {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        _ => DEFAULT_EXEMPT_FORMS.iter().map(|s| s.to_string()).collect(),
    };
    Ok(TermConfig {
        current_term_id,
        earliest_term_id,
        exempt_forms,
    })
}

/// Term for a request: explicit `params.termId` wins, else the configured
/// current term.
pub fn resolve_term_id(conn: &Connection, params: &Value) -> anyhow::Result<Option<String>> {
    if let Some(term_id) = params.get("termId").and_then(|v| v.as_str()) {
        return Ok(Some(term_id.to_string()));
    }
    Ok(term_config(conn)?.current_term_id)
}

pub fn list_departments(conn: &Connection) -> anyhow::Result<Vec<DepartmentRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, dept_name, is_enrolled, note, note_updated_at
            FROM departments ORDER BY dept_name",
    )?;
    let rows = stmt.query_map([], department_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn get_department(conn: &Connection, id: i64) -> anyhow::Result<Option<DepartmentRecord>> {
    let dept = conn
        .query_row(
            "SELECT id, dept_name, is_enrolled, note, note_updated_at
                FROM departments WHERE id = ?1",
            [id],
            department_from_row,
        )
        .optional()?;
    Ok(dept)
}

fn department_from_row(row: &rusqlite::Row) -> rusqlite::Result<DepartmentRecord> {
    Ok(DepartmentRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        is_enrolled: row.get::<_, i64>(2)? != 0,
        note: row.get(3)?,
        note_updated_at: row.get(4)?,
    })
}

pub fn load_listings(conn: &Connection, department_id: i64) -> anyhow::Result<Vec<CatalogListing>> {
    let mut stmt = conn.prepare(
        "SELECT department_id, subject_area, catalog_id, default_form_id
            FROM department_catalog_listings
            WHERE department_id = ?1
            ORDER BY sort_order, id",
    )?;
    let rows = stmt.query_map([department_id], |row| {
        Ok(CatalogListing {
            department_id: row.get(0)?,
            subject_area: row.get(1)?,
            catalog_id_pattern: row.get(2)?,
            default_form_id: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Catalog-id patterns other departments hold on subject areas this
/// department also lists. A match there carves the section out of this
/// department's slice.
pub fn exclusion_patterns(conn: &Connection, department_id: i64) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT other.catalog_id
            FROM department_catalog_listings own
            JOIN department_catalog_listings other
              ON other.subject_area = own.subject_area
             AND other.department_id != own.department_id
            WHERE own.department_id = ?1
              AND other.catalog_id IS NOT NULL
              AND other.catalog_id != ''",
    )?;
    let rows = stmt.query_map([department_id], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn list_forms(conn: &Connection) -> anyhow::Result<Vec<DepartmentForm>> {
    let mut stmt = conn.prepare(
        "SELECT id, name FROM department_forms WHERE deleted_at IS NULL ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(DepartmentForm {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn form_by_name(conn: &Connection, name: &str) -> anyhow::Result<Option<DepartmentForm>> {
    let form = conn
        .query_row(
            "SELECT id, name FROM department_forms WHERE name = ?1 AND deleted_at IS NULL",
            [name],
            |row| {
                Ok(DepartmentForm {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(form)
}

pub fn form_by_id(conn: &Connection, id: i64) -> anyhow::Result<Option<DepartmentForm>> {
    let form = conn
        .query_row(
            "SELECT id, name FROM department_forms WHERE id = ?1 AND deleted_at IS NULL",
            [id],
            |row| {
                Ok(DepartmentForm {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(form)
}

pub fn list_types(conn: &Connection) -> anyhow::Result<Vec<EvaluationType>> {
    let mut stmt = conn.prepare("SELECT id, name FROM evaluation_types ORDER BY name")?;
    let rows = stmt.query_map([], |row| {
        Ok(EvaluationType {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn type_by_name(conn: &Connection, name: &str) -> anyhow::Result<Option<EvaluationType>> {
    let t = conn
        .query_row(
            "SELECT id, name FROM evaluation_types WHERE name = ?1",
            [name],
            |row| {
                Ok(EvaluationType {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(t)
}

/// Standard meeting dates for a term, from the calendar snapshot.
pub fn term_dates(
    conn: &Connection,
    term_id: &str,
) -> anyhow::Result<(Option<NaiveDate>, Option<NaiveDate>)> {
    let dates: Option<(String, String)> = conn
        .query_row(
            "SELECT begin_date, end_date FROM sis_terms WHERE id = ?1",
            [term_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match dates {
        Some((begin, end)) => Ok((term::parse_date(&begin), term::parse_date(&end))),
        None => Ok((None, None)),
    }
}

const SECTION_COLUMNS: &str = "term_id, course_number, subject_area, catalog_id, \
     instruction_format, section_num, course_title, is_primary, instructor_uid, \
     instructor_role_code, meeting_start_date, meeting_end_date, enrollment_count, \
     cross_listed_with, room_shared_with, foreign_department_course, loaded_at";

fn section_row_from_sql(row: &rusqlite::Row) -> rusqlite::Result<SectionRow> {
    Ok(SectionRow {
        term_id: row.get(0)?,
        course_number: row.get(1)?,
        subject_area: row.get(2)?,
        catalog_id: row.get(3)?,
        instruction_format: row.get(4)?,
        section_num: row.get(5)?,
        course_title: row.get(6)?,
        is_primary: row.get::<_, i64>(7)? != 0,
        instructor_uid: row.get(8)?,
        instructor_role_code: row.get(9)?,
        meeting_start_date: row.get::<_, Option<String>>(10)?.as_deref().and_then(term::parse_date),
        meeting_end_date: row.get::<_, Option<String>>(11)?.as_deref().and_then(term::parse_date),
        enrollment_count: row.get(12)?,
        cross_listed_with: row.get(13)?,
        room_shared_with: row.get(14)?,
        foreign_department_course: row.get::<_, i64>(15)? != 0,
        loaded_at: row.get(16)?,
    })
}

/// All sections of a term, aggregated per course number, in stable feed
/// order (course number, then instructor UID).
pub fn load_term_sections(
    conn: &Connection,
    term_id: &str,
) -> anyhow::Result<BTreeMap<String, Section>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SECTION_COLUMNS} FROM sis_sections
            WHERE term_id = ?1
            ORDER BY course_number, instructor_uid",
    ))?;
    let rows = stmt
        .query_map([term_id], section_row_from_sql)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut grouped: BTreeMap<String, Vec<SectionRow>> = BTreeMap::new();
    for row in rows {
        grouped.entry(row.course_number.clone()).or_default().push(row);
    }
    let mut sections = BTreeMap::new();
    for (ccn, rows) in grouped {
        if let Some(section) = Section::from_rows(rows) {
            sections.insert(ccn, section);
        }
    }
    Ok(sections)
}

pub fn load_section(
    conn: &Connection,
    term_id: &str,
    course_number: &str,
) -> anyhow::Result<Option<Section>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SECTION_COLUMNS} FROM sis_sections
            WHERE term_id = ?1 AND course_number = ?2
            ORDER BY instructor_uid",
    ))?;
    let rows = stmt
        .query_map(params![term_id, course_number], section_row_from_sql)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Section::from_rows(rows))
}

const OVERRIDE_SELECT: &str = "SELECT e.id, e.term_id, e.department_id, d.dept_name,
        e.course_number, e.instructor_uid, e.status,
        f.id, f.name, t.id, t.name, e.start_date, e.end_date, e.updated_at
     FROM evaluations e
     JOIN departments d ON d.id = e.department_id
     LEFT JOIN department_forms f ON f.id = e.department_form_id
     LEFT JOIN evaluation_types t ON t.id = e.evaluation_type_id";

fn override_from_sql(row: &rusqlite::Row) -> rusqlite::Result<EvaluationOverride> {
    let form = match (row.get::<_, Option<i64>>(7)?, row.get::<_, Option<String>>(8)?) {
        (Some(id), Some(name)) => Some(DepartmentForm { id, name }),
        _ => None,
    };
    let eval_type = match (row.get::<_, Option<i64>>(9)?, row.get::<_, Option<String>>(10)?) {
        (Some(id), Some(name)) => Some(EvaluationType { id, name }),
        _ => None,
    };
    Ok(EvaluationOverride {
        id: row.get(0)?,
        term_id: row.get(1)?,
        department_id: row.get(2)?,
        department_name: row.get(3)?,
        course_number: row.get(4)?,
        instructor_uid: row.get(5)?,
        status: row
            .get::<_, Option<String>>(6)?
            .as_deref()
            .and_then(EvaluationStatus::parse),
        department_form: form,
        evaluation_type: eval_type,
        start_date: row.get::<_, Option<String>>(11)?.as_deref().and_then(term::parse_date),
        end_date: row.get::<_, Option<String>>(12)?.as_deref().and_then(term::parse_date),
        updated_at: row.get(13)?,
    })
}

pub fn load_overrides_for_courses(
    conn: &Connection,
    term_id: &str,
    course_numbers: &[String],
) -> anyhow::Result<Vec<EvaluationOverride>> {
    if course_numbers.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders: Vec<String> = (0..course_numbers.len())
        .map(|i| format!("?{}", i + 2))
        .collect();
    let sql = format!(
        "{OVERRIDE_SELECT} WHERE e.term_id = ?1 AND e.course_number IN ({}) ORDER BY e.id",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut values: Vec<&dyn rusqlite::ToSql> = vec![&term_id];
    for ccn in course_numbers {
        values.push(ccn);
    }
    let rows = stmt.query_map(values.as_slice(), override_from_sql)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn load_override(conn: &Connection, id: i64) -> anyhow::Result<Option<EvaluationOverride>> {
    let sql = format!("{OVERRIDE_SELECT} WHERE e.id = ?1");
    let ov = conn
        .query_row(&sql, [id], override_from_sql)
        .optional()?;
    Ok(ov)
}

pub fn load_instructors(
    conn: &Connection,
    uids: &BTreeSet<String>,
) -> anyhow::Result<HashMap<String, Instructor>> {
    let mut out = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT uid, sis_id, first_name, last_name, email, affiliations
            FROM sis_instructors WHERE uid = ?1",
    )?;
    for uid in uids {
        let instructor = stmt
            .query_row([uid], |row| {
                Ok(Instructor {
                    uid: row.get(0)?,
                    sis_id: row.get(1)?,
                    first_name: row.get(2)?,
                    last_name: row.get(3)?,
                    email: row.get(4)?,
                    affiliations: row
                        .get::<_, Option<String>>(5)?
                        .map(|s| {
                            s.split(',')
                                .map(|a| a.trim().to_string())
                                .filter(|a| !a.is_empty())
                                .collect()
                        })
                        .unwrap_or_default(),
                })
            })
            .optional()?;
        if let Some(instructor) = instructor {
            out.insert(uid.clone(), instructor);
        }
    }
    Ok(out)
}

/// Builds the merge context for one section: term calendar defaults, the
/// home department's default form, default types, exempt forms, and the
/// instructor directory for every UID the merge can touch.
pub fn merge_context_for_section(
    conn: &Connection,
    term_id: &str,
    section: &Section,
    listings: &[CatalogListing],
    exempt_forms: &[String],
    overrides: &[EvaluationOverride],
) -> anyhow::Result<MergeContext> {
    let (default_meeting_start, default_meeting_end) = term_dates(conn, term_id)?;
    let default_form = match section.default_form_id(listings) {
        Some(id) => form_by_id(conn, id)?,
        None => None,
    };
    let mut default_evaluation_types = HashMap::new();
    for name in ["F", "G"] {
        if let Some(t) = type_by_name(conn, name)? {
            default_evaluation_types.insert(name.to_string(), t);
        }
    }
    let mut uids: BTreeSet<String> = section
        .rows
        .iter()
        .filter_map(|r| r.instructor_uid.clone())
        .collect();
    uids.extend(overrides.iter().filter_map(|o| o.instructor_uid.clone()));
    let instructors = load_instructors(conn, &uids)?;
    Ok(MergeContext {
        default_meeting_start,
        default_meeting_end,
        default_form,
        default_evaluation_types,
        exempt_forms: exempt_forms.iter().cloned().collect(),
        instructors,
    })
}

/// One section of a department feed with its merged evaluations.
pub struct FeedSection {
    pub section: Section,
    pub evaluations: Vec<MergedEvaluation>,
    pub instructors: HashMap<String, Instructor>,
}

/// The full evaluation feed for one department and term: every claimed
/// section, merged against home and foreign overrides.
pub fn department_feed(
    conn: &Connection,
    department: &DepartmentRecord,
    term_id: &str,
    exempt_forms: &[String],
) -> anyhow::Result<Vec<FeedSection>> {
    let listings = load_listings(conn, department.id)?;
    let exclusions = exclusion_patterns(conn, department.id)?;
    let sections = load_term_sections(conn, term_id)?;

    let mut feed = Vec::new();
    for (ccn, section) in &sections {
        if !section::department_claims_section(
            &section.subject_area,
            &section.catalog_id,
            &listings,
            &exclusions,
        ) {
            continue;
        }
        let partners = section.partner_course_numbers();
        let overrides = load_overrides_for_courses(conn, term_id, &partners)?;
        let (home, foreign): (Vec<_>, Vec<_>) = overrides
            .into_iter()
            .partition(|o| o.department_id == department.id && o.course_number == *ccn);

        // Hidden-by-default sections stay out of the feed unless the
        // department has saved something for them.
        let visible = section.rows.iter().any(|r| r.is_visible_by_default());
        if !visible && home.is_empty() {
            continue;
        }

        let all: Vec<EvaluationOverride> =
            home.iter().chain(foreign.iter()).cloned().collect();
        let ctx =
            merge_context_for_section(conn, term_id, section, &listings, exempt_forms, &all)?;
        let evaluations = merge_section(section, &home, &foreign, &ctx);
        feed.push(FeedSection {
            section: section.clone(),
            evaluations,
            instructors: ctx.instructors,
        });
    }
    Ok(feed)
}

/// Merged view of a single section, without a department claim: home
/// overrides are the ones saved on the section's own course number, foreign
/// ones live on cross-listing/room-share partners.
pub fn section_view(
    conn: &Connection,
    term_id: &str,
    section: &Section,
    exempt_forms: &[String],
) -> anyhow::Result<FeedSection> {
    let partners = section.partner_course_numbers();
    let overrides = load_overrides_for_courses(conn, term_id, &partners)?;
    let (home, foreign): (Vec<_>, Vec<_>) = overrides
        .into_iter()
        .partition(|o| o.course_number == section.course_number);
    let all: Vec<EvaluationOverride> = home.iter().chain(foreign.iter()).cloned().collect();
    let ctx = merge_context_for_section(conn, term_id, section, &[], exempt_forms, &all)?;
    let evaluations = merge_section(section, &home, &foreign, &ctx);
    Ok(FeedSection {
        section: section.clone(),
        evaluations,
        instructors: ctx.instructors,
    })
}

pub fn section_json(section: &Section) -> Value {
    json!({
        "termId": section.term_id,
        "courseNumber": section.course_number,
        "subjectArea": section.subject_area,
        "catalogId": section.catalog_id,
        "instructionFormat": section.instruction_format,
        "sectionNum": section.section_num,
        "courseTitle": section.course_title,
        "isPrimary": section.is_primary,
        "crossListedWith": section.cross_listed_with,
        "roomSharedWith": section.room_shared_with,
        "foreignDepartmentCourse": section.foreign_department_course,
        "meetingStartDate": section.start_date.map(term::format_date),
        "meetingEndDate": section.end_date.map(term::format_date),
    })
}

pub fn evaluation_json(
    evaluation: &MergedEvaluation,
    instructors: &HashMap<String, Instructor>,
) -> Value {
    let instructor = evaluation
        .instructor_uid
        .as_ref()
        .map(|uid| match instructors.get(uid) {
            Some(i) => serde_json::to_value(i).unwrap_or_else(|_| json!({ "uid": uid })),
            None => json!({ "uid": uid }),
        });
    let id = match evaluation.id {
        Some(id) => json!(id),
        None => json!(evaluation.transient_id()),
    };
    let mut out = json!({
        "id": id,
        "termId": evaluation.term_id,
        "courseNumber": evaluation.course_number,
        "instructor": instructor,
        "status": evaluation.status.map(|s| s.feed_str()),
        "departmentForm": evaluation.department_form,
        "evaluationType": evaluation.evaluation_type,
        "startDate": evaluation.start_date.map(term::format_date),
        "endDate": evaluation.end_date.map(term::format_date),
        "meetingStartDate": evaluation.meeting_start_date.map(term::format_date),
        "meetingEndDate": evaluation.meeting_end_date.map(term::format_date),
        "modular": crate::merge::is_modular(evaluation.start_date, evaluation.end_date),
        "lastUpdated": evaluation.last_updated,
        "conflicts": {
            "departmentForm": evaluation.conflicts.department_form,
            "evaluationType": evaluation.conflicts.evaluation_type,
            "evaluationPeriod": evaluation.conflicts.evaluation_period,
        },
        "valid": evaluation.valid,
    });
    if evaluation.id.is_none() {
        out["transientId"] = json!(evaluation.transient_id());
    }
    out
}
