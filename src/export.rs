use crate::merge::{is_modular, Instructor, MergedEvaluation};
use crate::section::Section;
use crate::term;
use anyhow::anyhow;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Department form, evaluation type, and dates are the attributes that may
/// take several distinct values for one course number. Evaluations are
/// keyed by course number plus those attributes so the vendor sees one
/// course id per distinct configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExportKey {
    pub course_number: String,
    pub department_form: String,
    pub evaluation_type: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl ExportKey {
    pub fn for_evaluation(evaluation: &MergedEvaluation) -> anyhow::Result<ExportKey> {
        Ok(ExportKey {
            course_number: evaluation.course_number.clone(),
            department_form: evaluation
                .department_form
                .as_ref()
                .map(|f| f.name.clone())
                .ok_or_else(|| missing(evaluation, "department form"))?,
            evaluation_type: evaluation
                .evaluation_type
                .as_ref()
                .map(|t| t.name.clone())
                .ok_or_else(|| missing(evaluation, "evaluation type"))?,
            start_date: evaluation
                .start_date
                .ok_or_else(|| missing(evaluation, "start date"))?,
            end_date: evaluation
                .end_date
                .ok_or_else(|| missing(evaluation, "end date"))?,
        })
    }
}

fn missing(evaluation: &MergedEvaluation, what: &str) -> anyhow::Error {
    anyhow!(
        "confirmed evaluation {} has no {}",
        evaluation.feed_id(),
        what
    )
}

/// The evaluation type exported for graduate student instructors.
const GSI_TYPE: &str = "G";
const FACULTY_TYPE: &str = "F";

const HIERARCHY_ROOT: &str = "UC Berkeley";

#[derive(Debug, Clone)]
pub struct DirectoryPerson {
    pub uid: String,
    pub sis_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SupervisorRecord {
    pub uid: String,
    pub sis_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub can_view_response_rates: bool,
    /// Forms this contact administers, in grant order; the vendor schema
    /// has room for ten.
    pub department_forms: Vec<String>,
}

/// Everything the serializer consumes, pre-fetched by the caller.
#[derive(Debug, Clone, Default)]
pub struct ExportData {
    pub term_id: String,
    /// Confirmed merged evaluations for the term, feed order.
    pub evaluations: Vec<MergedEvaluation>,
    /// Sections keyed by course number, current term.
    pub sections: HashMap<String, Section>,
    /// Enrolled student UIDs keyed by course number.
    pub enrollments: HashMap<String, Vec<String>>,
    /// Student directory; enrollments without a record are dropped.
    pub students: HashMap<String, DirectoryPerson>,
    /// Instructor directory, including instructors confirmed in prior
    /// terms (legacy context for the vendor's dedup).
    pub instructors: HashMap<String, Instructor>,
    /// Contact UIDs per department form name, grant order.
    pub form_supervisors: BTreeMap<String, Vec<String>>,
    /// Default form name per course number, used to propagate supervisors
    /// across cross-listing partners.
    pub default_form_names: HashMap<String, String>,
    pub supervisors: Vec<SupervisorRecord>,
}

pub const COURSE_HEADERS: &[&str] = &[
    "COURSE_ID",
    "COURSE_ID_2",
    "COURSE_NAME",
    "CROSS_LISTED_FLAG",
    "CROSS_LISTED_NAME",
    "DEPT_NAME",
    "CATALOG_ID",
    "INSTRUCTION_FORMAT",
    "SECTION_NUM",
    "PRIMARY_SECONDARY_CD",
    "EVALUATE",
    "DEPT_FORM",
    "EVALUATION_TYPE",
    "MODULAR_COURSE",
    "START_DATE",
    "END_DATE",
    "CANVAS_COURSE_ID",
    "QB_MAPPING",
];

pub const COURSE_INSTRUCTOR_HEADERS: &[&str] = &["COURSE_ID", "LDAP_UID", "ROLE"];

pub const COURSE_STUDENT_HEADERS: &[&str] = &["COURSE_ID", "LDAP_UID"];

pub const COURSE_SUPERVISOR_HEADERS: &[&str] = &["COURSE_ID", "LDAP_UID", "DEPT_NAME"];

pub const DEPARTMENT_HIERARCHY_HEADERS: &[&str] = &[
    "NODE_ID",
    "NODE_CAPTION",
    "PARENT_NODE_ID",
    "PARENT_NODE_CAPTION",
    "LEVEL",
];

pub const INSTRUCTOR_HEADERS: &[&str] = &[
    "LDAP_UID",
    "SIS_ID",
    "FIRST_NAME",
    "LAST_NAME",
    "EMAIL_ADDRESS",
    "BLUE_ROLE",
];

pub const REPORT_VIEWER_HIERARCHY_HEADERS: &[&str] = &["SOURCE", "TARGET", "ROLE_ID"];

pub const STUDENT_HEADERS: &[&str] = &[
    "LDAP_UID",
    "SIS_ID",
    "FIRST_NAME",
    "LAST_NAME",
    "EMAIL_ADDRESS",
];

pub const SUPERVISOR_HEADERS: &[&str] = &[
    "LDAP_UID",
    "SIS_ID",
    "FIRST_NAME",
    "LAST_NAME",
    "EMAIL_ADDRESS",
    "SUPERVISOR_GROUP",
    "PRIMARY_ADMIN",
    "SECONDARY_ADMIN",
    "DEPT_NAME_1",
    "DEPT_NAME_2",
    "DEPT_NAME_3",
    "DEPT_NAME_4",
    "DEPT_NAME_5",
    "DEPT_NAME_6",
    "DEPT_NAME_7",
    "DEPT_NAME_8",
    "DEPT_NAME_9",
    "DEPT_NAME_10",
];

#[derive(Debug, Clone, Default)]
pub struct ExportTables {
    pub courses: Vec<Vec<String>>,
    pub course_instructors: Vec<Vec<String>>,
    pub course_students: Vec<Vec<String>>,
    pub course_supervisors: Vec<Vec<String>>,
    pub xlisted_supervisors: Vec<Vec<String>>,
    pub department_hierarchy: Vec<Vec<String>>,
    pub instructors: Vec<Vec<String>>,
    pub report_viewer_hierarchy: Vec<Vec<String>>,
    pub students: Vec<Vec<String>>,
    pub supervisors: Vec<Vec<String>>,
}

impl ExportTables {
    /// Vendor file order; the exporter writes all-or-nothing in this order.
    pub fn files(&self) -> Vec<(&'static str, &'static [&'static str], &Vec<Vec<String>>)> {
        vec![
            ("courses", COURSE_HEADERS, &self.courses),
            (
                "course_instructors",
                COURSE_INSTRUCTOR_HEADERS,
                &self.course_instructors,
            ),
            (
                "course_students",
                COURSE_STUDENT_HEADERS,
                &self.course_students,
            ),
            (
                "course_supervisors",
                COURSE_SUPERVISOR_HEADERS,
                &self.course_supervisors,
            ),
            (
                "xlisted_supervisors",
                COURSE_SUPERVISOR_HEADERS,
                &self.xlisted_supervisors,
            ),
            (
                "department_hierarchy",
                DEPARTMENT_HIERARCHY_HEADERS,
                &self.department_hierarchy,
            ),
            ("instructors", INSTRUCTOR_HEADERS, &self.instructors),
            (
                "report_viewer_hierarchy",
                REPORT_VIEWER_HIERARCHY_HEADERS,
                &self.report_viewer_hierarchy,
            ),
            ("students", STUDENT_HEADERS, &self.students),
            ("supervisors", SUPERVISOR_HEADERS, &self.supervisors),
        ]
    }
}

/// Serializes the confirmed set into the vendor's flat tables. Pure; any
/// missing required field on a confirmed evaluation is a contract
/// violation surfaced as an error before a single row is produced.
pub fn generate_export_tables(data: &ExportData) -> anyhow::Result<ExportTables> {
    // Group instructor UIDs under their export key, preserving insertion
    // order per course number for the suffix fallback.
    let mut keys_in_order: Vec<ExportKey> = Vec::new();
    let mut uids_by_key: HashMap<ExportKey, BTreeSet<String>> = HashMap::new();
    for evaluation in &data.evaluations {
        let key = ExportKey::for_evaluation(evaluation)?;
        if !uids_by_key.contains_key(&key) {
            keys_in_order.push(key.clone());
        }
        let uids = uids_by_key.entry(key).or_default();
        if let Some(uid) = &evaluation.instructor_uid {
            uids.insert(uid.clone());
        }
    }
    keys_in_order.sort_by(|a, b| {
        (&a.course_number, &a.department_form, &a.evaluation_type)
            .cmp(&(&b.course_number, &b.department_form, &b.evaluation_type))
    });

    let mut tables = ExportTables::default();
    let mut exported_instructor_uids: BTreeSet<String> = BTreeSet::new();
    let mut exported_student_uids: BTreeSet<String> = BTreeSet::new();

    let mut idx = 0;
    while idx < keys_in_order.len() {
        let course_number = keys_in_order[idx].course_number.clone();
        let mut group = Vec::new();
        while idx < keys_in_order.len() && keys_in_order[idx].course_number == course_number {
            group.push(keys_in_order[idx].clone());
            idx += 1;
        }
        let section = data
            .sections
            .get(&course_number)
            .ok_or_else(|| anyhow!("no section found for course number {}", course_number))?;
        let course_ids = assign_course_ids(&data.term_id, &group)?;

        for key in &group {
            let course_id = &course_ids[key];
            tables.courses.push(course_row(course_id, key, section));

            for uid in &uids_by_key[key] {
                tables.course_instructors.push(vec![
                    course_id.clone(),
                    uid.clone(),
                    instructor_role_label(&key.evaluation_type),
                ]);
                exported_instructor_uids.insert(uid.clone());
            }

            for uid in data.enrollments.get(&course_number).into_iter().flatten() {
                if data.students.contains_key(uid) {
                    tables.course_students.push(vec![course_id.clone(), uid.clone()]);
                    exported_student_uids.insert(uid.clone());
                }
            }

            for uid in data
                .form_supervisors
                .get(&key.department_form)
                .into_iter()
                .flatten()
            {
                tables.course_supervisors.push(vec![
                    course_id.clone(),
                    uid.clone(),
                    key.department_form.clone(),
                ]);
            }

            // Supervisors authorized on a cross-listing partner's default
            // form also get report access to this course.
            let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
            for partner in section.partner_course_numbers() {
                if partner == course_number {
                    continue;
                }
                let Some(form_name) = data.default_form_names.get(&partner) else {
                    continue;
                };
                for uid in data.form_supervisors.get(form_name).into_iter().flatten() {
                    if seen.insert((uid.clone(), form_name.clone())) {
                        tables.xlisted_supervisors.push(vec![
                            course_id.clone(),
                            uid.clone(),
                            form_name.clone(),
                        ]);
                    }
                }
            }
        }
    }

    for uid in &exported_instructor_uids {
        tables.instructors.push(instructor_row(uid, data.instructors.get(uid)));
    }
    // Directory rows for every instructor confirmed in context terms, even
    // if their current-term rows fell out above.
    for (uid, instructor) in sorted(&data.instructors) {
        if !exported_instructor_uids.contains(uid) {
            tables.instructors.push(instructor_row(uid, Some(instructor)));
        }
    }

    for uid in &exported_student_uids {
        if let Some(student) = data.students.get(uid) {
            tables.students.push(vec![
                student.uid.clone(),
                student.sis_id.clone().unwrap_or_default(),
                student.first_name.clone().unwrap_or_default(),
                student.last_name.clone().unwrap_or_default(),
                student.email.clone().unwrap_or_default(),
            ]);
        }
    }

    for supervisor in &data.supervisors {
        tables.supervisors.push(supervisor_row(supervisor));
    }

    tables.department_hierarchy.push(vec![
        HIERARCHY_ROOT.to_string(),
        HIERARCHY_ROOT.to_string(),
        String::new(),
        String::new(),
        "1".to_string(),
    ]);
    for (form_name, uids) in &data.form_supervisors {
        tables.department_hierarchy.push(vec![
            form_name.clone(),
            form_name.clone(),
            HIERARCHY_ROOT.to_string(),
            HIERARCHY_ROOT.to_string(),
            "2".to_string(),
        ]);
        for uid in uids {
            tables.report_viewer_hierarchy.push(vec![
                form_name.clone(),
                uid.clone(),
                "DEPT_ADMIN".to_string(),
            ]);
        }
    }

    Ok(tables)
}

fn sorted(map: &HashMap<String, Instructor>) -> Vec<(&String, &Instructor)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

/// Synthetic course ids: `{term code}-{course number}`, disambiguated by
/// `_GSI`/`_MID` when that yields unique ids within the course number,
/// otherwise by `_A`, `_B`, ... in insertion order with the first id bare.
fn assign_course_ids(
    term_id: &str,
    group: &[ExportKey],
) -> anyhow::Result<HashMap<ExportKey, String>> {
    let term_code = term::term_code_for_sis_id(term_id)
        .ok_or_else(|| anyhow!("malformed term id {}", term_id))?;
    let prefix = format!("{}-{}", term_code, group[0].course_number);

    let mut ids: HashMap<ExportKey, String> = HashMap::new();
    for key in group {
        let mut id = prefix.clone();
        if key.evaluation_type == GSI_TYPE {
            id.push_str("_GSI");
        }
        if key.department_form.ends_with("_MID") {
            id.push_str("_MID");
        }
        ids.insert(key.clone(), id);
    }
    let distinct: BTreeSet<&String> = ids.values().collect();
    if distinct.len() == group.len() {
        return Ok(ids);
    }

    ids.clear();
    for (index, key) in group.iter().enumerate() {
        let id = if index == 0 {
            prefix.clone()
        } else {
            // _A, _B, ... for the second item onward.
            format!("{}_{}", prefix, alpha_suffix(index - 1))
        };
        ids.insert(key.clone(), id);
    }
    Ok(ids)
}

/// Bijective base-26 letter suffix: 0 is `A`, 25 is `Z`, 26 is `AA`.
fn alpha_suffix(mut n: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(char::from(b'A' + (n % 26) as u8));
        n /= 26;
        if n == 0 {
            break;
        }
        n -= 1;
    }
    letters.iter().rev().collect()
}

fn course_row(course_id: &str, key: &ExportKey, section: &Section) -> Vec<String> {
    let mut course_name = section.course_title.clone();
    if key.evaluation_type == GSI_TYPE {
        course_name.push_str(" (EVAL FOR GSI)");
    }
    vec![
        course_id.to_string(),
        course_id.to_string(),
        course_name,
        cross_listed_flag(section),
        cross_listed_name(section),
        section.subject_area.clone(),
        section.catalog_id.clone(),
        section.instruction_format.clone(),
        section.section_num.clone(),
        if section.is_primary { "P" } else { "S" }.to_string(),
        "Y".to_string(),
        key.department_form.clone(),
        key.evaluation_type.clone(),
        if is_modular(Some(key.start_date), Some(key.end_date)) {
            "Y"
        } else {
            ""
        }
        .to_string(),
        term::format_date_mdy(key.start_date),
        term::format_date_mdy(key.end_date),
        String::new(),
        format!("{}-{}", key.department_form, key.evaluation_type),
    ]
}

fn cross_listed_flag(section: &Section) -> String {
    if !section.cross_listed_with.is_empty() {
        "Y".to_string()
    } else if !section.room_shared_with.is_empty() {
        "RM SHARE".to_string()
    } else {
        String::new()
    }
}

fn cross_listed_name(section: &Section) -> String {
    if section.is_cross_listed_or_shared() {
        section.partner_course_numbers().join("-")
    } else {
        String::new()
    }
}

fn instructor_role_label(evaluation_type: &str) -> String {
    match evaluation_type {
        FACULTY_TYPE => "Faculty".to_string(),
        GSI_TYPE => "GSI".to_string(),
        other => other.to_string(),
    }
}

fn instructor_row(uid: &str, instructor: Option<&Instructor>) -> Vec<String> {
    vec![
        uid.to_string(),
        instructor
            .and_then(|i| i.sis_id.clone())
            .unwrap_or_default(),
        instructor
            .and_then(|i| i.first_name.clone())
            .unwrap_or_default(),
        instructor
            .and_then(|i| i.last_name.clone())
            .unwrap_or_default(),
        instructor.and_then(|i| i.email.clone()).unwrap_or_default(),
        "23".to_string(),
    ]
}

fn supervisor_row(supervisor: &SupervisorRecord) -> Vec<String> {
    let mut row = vec![
        supervisor.uid.clone(),
        supervisor
            .sis_id
            .clone()
            .unwrap_or_else(|| format!("UID:{}", supervisor.uid)),
        supervisor.first_name.clone().unwrap_or_default(),
        supervisor.last_name.clone().unwrap_or_default(),
        supervisor.email.clone().unwrap_or_default(),
        "DEPT_ADMIN".to_string(),
        if supervisor.can_view_response_rates { "Y" } else { "" }.to_string(),
        if supervisor.can_view_response_rates { "" } else { "Y" }.to_string(),
    ];
    for i in 0..10 {
        row.push(
            supervisor
                .department_forms
                .get(i)
                .cloned()
                .unwrap_or_default(),
        );
    }
    row
}
