use crate::section::{Section, SectionRow};
use chrono::{Duration, NaiveDate};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Workflow status of a saved evaluation override. Absence of a status
/// (unmarked) is modeled as `Option<EvaluationStatus>::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationStatus {
    Marked,
    Confirmed,
    Ignore,
    Deleted,
}

impl EvaluationStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "marked" => Some(Self::Marked),
            "confirmed" => Some(Self::Confirmed),
            "ignore" => Some(Self::Ignore),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Marked => "marked",
            Self::Confirmed => "confirmed",
            Self::Ignore => "ignore",
            Self::Deleted => "deleted",
        }
    }

    /// The feed shows `marked` as `review`.
    pub fn feed_str(self) -> &'static str {
        match self {
            Self::Marked => "review",
            other => other.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartmentForm {
    pub id: i64,
    pub name: String,
}

impl DepartmentForm {
    pub fn is_midterm(&self) -> bool {
        self.name.ends_with("_MID")
    }
}

/// Forms that differ only by the `_MID` suffix are the midterm and final
/// variants of the same questionnaire and never conflict with each other.
pub fn forms_are_midterm_pair(a: &str, b: &str) -> bool {
    a == format!("{}_MID", b) || b == format!("{}_MID", a)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationType {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Instructor {
    pub uid: String,
    pub sis_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub affiliations: Vec<String>,
}

/// A persisted evaluation override, fully resolved (form and type joined by
/// the caller). At most one exists per (term, department, course number,
/// instructor UID).
#[derive(Debug, Clone)]
pub struct EvaluationOverride {
    pub id: i64,
    pub term_id: String,
    pub department_id: i64,
    pub department_name: String,
    pub course_number: String,
    pub instructor_uid: Option<String>,
    pub status: Option<EvaluationStatus>,
    pub department_form: Option<DepartmentForm>,
    pub evaluation_type: Option<EvaluationType>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub updated_at: Option<String>,
}

impl EvaluationOverride {
    pub fn is_visible(&self) -> bool {
        self.status != Some(EvaluationStatus::Deleted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEntry {
    pub department: String,
    pub value: String,
}

/// Per-field cross-department disagreements, keyed the way the feed keys
/// them. Empty vectors mean no conflict.
#[derive(Debug, Clone, Default)]
pub struct Conflicts {
    pub department_form: Vec<ConflictEntry>,
    pub evaluation_type: Vec<ConflictEntry>,
    pub evaluation_period: Vec<ConflictEntry>,
}

impl Conflicts {
    pub fn is_empty(&self) -> bool {
        self.department_form.is_empty()
            && self.evaluation_type.is_empty()
            && self.evaluation_period.is_empty()
    }

    fn push(entries: &mut Vec<ConflictEntry>, department: &str, value: String) {
        // One entry per disagreeing department.
        if !entries.iter().any(|e| e.department == department) {
            entries.push(ConflictEntry {
                department: department.to_string(),
                value,
            });
        }
    }
}

/// The resolved per-instructor evaluation view. Derived, never persisted;
/// `id` is present only when a saved override backs it.
#[derive(Debug, Clone)]
pub struct MergedEvaluation {
    pub id: Option<i64>,
    pub term_id: String,
    pub course_number: String,
    pub department_id: Option<i64>,
    pub instructor_uid: Option<String>,
    pub status: Option<EvaluationStatus>,
    pub department_form: Option<DepartmentForm>,
    pub evaluation_type: Option<EvaluationType>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub meeting_start_date: Option<NaiveDate>,
    pub meeting_end_date: Option<NaiveDate>,
    pub last_updated: Option<String>,
    pub conflicts: Conflicts,
    pub valid: bool,
}

impl MergedEvaluation {
    /// Fallback id string for views that are not saved to the database.
    pub fn transient_id(&self) -> String {
        format!(
            "_{}_{}_{}",
            self.term_id,
            self.course_number,
            self.instructor_uid.as_deref().unwrap_or("None")
        )
    }

    pub fn feed_id(&self) -> String {
        match self.id {
            Some(id) => id.to_string(),
            None => self.transient_id(),
        }
    }

    pub fn is_marked_or_confirmed(&self) -> bool {
        matches!(
            self.status,
            Some(EvaluationStatus::Marked) | Some(EvaluationStatus::Confirmed)
        )
    }

    fn update_validity(&mut self) {
        self.valid = !self.is_marked_or_confirmed()
            || (self.conflicts.is_empty()
                && self.department_form.is_some()
                && self.evaluation_type.is_some()
                && self.instructor_uid.is_some());
    }
}

/// A short evaluation window marks the course modular in the export.
pub fn is_modular(start_date: Option<NaiveDate>, end_date: Option<NaiveDate>) -> bool {
    match (start_date, end_date) {
        (Some(s), Some(e)) => e - s < Duration::days(20),
        _ => false,
    }
}

/// Everything the merger needs beyond the section and its overrides. All
/// lookups are pre-fetched by the caller; merging itself never touches I/O.
#[derive(Debug, Clone, Default)]
pub struct MergeContext {
    /// Term-wide standard meeting dates, used when a section has none.
    pub default_meeting_start: Option<NaiveDate>,
    pub default_meeting_end: Option<NaiveDate>,
    /// Section default form from the home department's catalog listings.
    pub default_form: Option<DepartmentForm>,
    /// Default evaluation types keyed by name (`F`, `G`).
    pub default_evaluation_types: HashMap<String, EvaluationType>,
    /// Forms whose sections never receive an affiliation-based default type.
    pub exempt_forms: BTreeSet<String>,
    /// Instructor directory keyed by UID. Misses are non-fatal.
    pub instructors: HashMap<String, Instructor>,
}

/// Merges one section with its home-department overrides. Overrides held
/// by other departments on the same (or partner) course numbers are passed
/// as read-only context: they feed status/field inheritance and conflict
/// detection but are never merged into the home view's identity.
pub fn merge_section(
    section: &Section,
    home_overrides: &[EvaluationOverride],
    foreign_overrides: &[EvaluationOverride],
    ctx: &MergeContext,
) -> Vec<MergedEvaluation> {
    let mut rows_by_uid: BTreeMap<Option<String>, Vec<&SectionRow>> = BTreeMap::new();
    for row in &section.rows {
        rows_by_uid
            .entry(row.instructor_uid.clone())
            .or_default()
            .push(row);
    }

    let mut overrides_by_uid: BTreeMap<Option<String>, Vec<&EvaluationOverride>> = BTreeMap::new();
    for ov in home_overrides {
        overrides_by_uid
            .entry(ov.instructor_uid.clone())
            .or_default()
            .push(ov);
    }

    let mut uids: BTreeSet<Option<String>> = rows_by_uid.keys().cloned().collect();
    uids.extend(overrides_by_uid.keys().cloned());

    let mut merged = Vec::new();
    for uid in &uids {
        // Skip the no-instructor placeholder once any real instructor exists.
        if uid.is_none() && uids.len() > 1 {
            continue;
        }

        // Prefer rows for the exact UID, then instructor-less rows, then
        // anything the section has.
        let rows_for_uid = rows_by_uid
            .get(uid)
            .or_else(|| rows_by_uid.get(&None))
            .cloned()
            .unwrap_or_else(|| section.rows.iter().collect());

        // Saved overrides with no instructor stand in for any UID that
        // lacks its own. Duplicated rows (midterm + final twins) each get
        // their own merged entry.
        let saved_list: Vec<&EvaluationOverride> = overrides_by_uid
            .get(uid)
            .or_else(|| overrides_by_uid.get(&None))
            .cloned()
            .unwrap_or_default();

        let entries: Vec<Option<&EvaluationOverride>> = if saved_list.is_empty() {
            vec![None]
        } else {
            saved_list.iter().copied().map(Some).collect()
        };

        for saved in entries {
            if let Some(saved) = saved {
                if !saved.is_visible() {
                    continue;
                }
            }

            let foreign: Vec<&EvaluationOverride> = foreign_overrides
                .iter()
                .filter(|f| {
                    f.is_visible()
                        && (f.instructor_uid.is_none()
                            || uid.is_none()
                            || f.instructor_uid == *uid)
                        && Some(f.id) != saved.map(|s| s.id)
                })
                .collect();

            merged.push(merge_one(
                section,
                uid.clone(),
                &rows_for_uid,
                saved,
                &foreign,
                ctx,
            ));
        }
    }
    merged
}

fn merge_one(
    section: &Section,
    uid: Option<String>,
    rows: &[&SectionRow],
    saved: Option<&EvaluationOverride>,
    foreign: &[&EvaluationOverride],
    ctx: &MergeContext,
) -> MergedEvaluation {
    let mut out = MergedEvaluation {
        id: saved.map(|s| s.id),
        term_id: section.term_id.clone(),
        course_number: section.course_number.clone(),
        department_id: saved.map(|s| s.department_id),
        instructor_uid: uid,
        status: None,
        department_form: None,
        evaluation_type: None,
        start_date: None,
        end_date: None,
        meeting_start_date: None,
        meeting_end_date: None,
        last_updated: None,
        conflicts: Conflicts::default(),
        valid: true,
    };

    resolve_status(&mut out, saved, foreign);
    let detect = out.is_marked_or_confirmed();

    resolve_department_form(&mut out, saved, foreign, ctx, detect);
    resolve_evaluation_type(&mut out, saved, foreign, ctx, detect);
    resolve_dates(&mut out, rows, saved, foreign, ctx, detect);
    resolve_last_updated(&mut out, rows, saved);
    out.update_validity();
    out
}

fn resolve_status(
    out: &mut MergedEvaluation,
    saved: Option<&EvaluationOverride>,
    foreign: &[&EvaluationOverride],
) {
    if let Some(status) = saved.and_then(|s| s.status) {
        out.status = Some(status);
        return;
    }
    // Marked/confirmed status propagates across departments; ignore and
    // deleted stay local.
    for fde in foreign {
        match fde.status {
            Some(EvaluationStatus::Marked) if out.status.is_none() => {
                out.status = Some(EvaluationStatus::Marked);
            }
            Some(EvaluationStatus::Confirmed)
                if matches!(out.status, None | Some(EvaluationStatus::Confirmed)) =>
            {
                out.status = Some(EvaluationStatus::Confirmed);
            }
            _ => {}
        }
    }
}

fn resolve_department_form(
    out: &mut MergedEvaluation,
    saved: Option<&EvaluationOverride>,
    foreign: &[&EvaluationOverride],
    ctx: &MergeContext,
    detect_conflicts: bool,
) {
    if let Some(form) = saved.and_then(|s| s.department_form.clone()) {
        if detect_conflicts {
            for fde in foreign {
                if let Some(other) = &fde.department_form {
                    if other.id != form.id && !forms_are_midterm_pair(&other.name, &form.name) {
                        Conflicts::push(
                            &mut out.conflicts.department_form,
                            &fde.department_name,
                            other.name.clone(),
                        );
                    }
                }
            }
        }
        out.department_form = Some(form);
        return;
    }
    for fde in foreign {
        // A row the other department marked 'ignore' yields to the local
        // default when one exists.
        if let Some(other) = &fde.department_form {
            if Some(fde.department_id) != out.department_id
                && (fde.status != Some(EvaluationStatus::Ignore) || ctx.default_form.is_none())
            {
                out.department_form = Some(other.clone());
                break;
            }
        }
    }
    if out.department_form.is_none() {
        out.department_form = ctx.default_form.clone();
    }
}

fn resolve_evaluation_type(
    out: &mut MergedEvaluation,
    saved: Option<&EvaluationOverride>,
    foreign: &[&EvaluationOverride],
    ctx: &MergeContext,
    detect_conflicts: bool,
) {
    if let Some(eval_type) = saved.and_then(|s| s.evaluation_type.clone()) {
        if detect_conflicts {
            for fde in foreign {
                if let Some(other) = &fde.evaluation_type {
                    if other.id != eval_type.id {
                        Conflicts::push(
                            &mut out.conflicts.evaluation_type,
                            &fde.department_name,
                            other.name.clone(),
                        );
                    }
                }
            }
        }
        out.evaluation_type = Some(eval_type);
        return;
    }
    let have_defaults = !ctx.default_evaluation_types.is_empty();
    for fde in foreign {
        if let Some(other) = &fde.evaluation_type {
            if Some(fde.department_id) != out.department_id
                && (fde.status != Some(EvaluationStatus::Ignore) || !have_defaults)
            {
                out.evaluation_type = Some(other.clone());
                break;
            }
        }
    }
    if out.evaluation_type.is_some() {
        return;
    }

    // Affiliation-based default, unless the resolved form is exempt.
    let exempt = out
        .department_form
        .as_ref()
        .is_some_and(|f| ctx.exempt_forms.contains(&f.name));
    if exempt || !have_defaults {
        return;
    }
    let Some(instructor) = out
        .instructor_uid
        .as_ref()
        .and_then(|uid| ctx.instructors.get(uid))
    else {
        return;
    };
    if instructor.affiliations.iter().any(|a| a == "STUDENT-TYPE") {
        out.evaluation_type = ctx.default_evaluation_types.get("G").cloned();
    } else if instructor.affiliations.iter().any(|a| a == "ACADEMIC") {
        out.evaluation_type = ctx.default_evaluation_types.get("F").cloned();
    }
}

fn resolve_dates(
    out: &mut MergedEvaluation,
    rows: &[&SectionRow],
    saved: Option<&EvaluationOverride>,
    foreign: &[&EvaluationOverride],
    ctx: &MergeContext,
    detect_conflicts: bool,
) {
    out.meeting_start_date = rows
        .iter()
        .filter_map(|r| r.meeting_start_date)
        .min()
        .or(ctx.default_meeting_start);
    out.meeting_end_date = rows
        .iter()
        .filter_map(|r| r.meeting_end_date)
        .max()
        .or(ctx.default_meeting_end);

    if let Some(start) = saved.and_then(|s| s.start_date) {
        out.start_date = Some(start);
        if detect_conflicts {
            for fde in foreign {
                if let Some(other) = fde.start_date {
                    if other != start {
                        Conflicts::push(
                            &mut out.conflicts.evaluation_period,
                            &fde.department_name,
                            crate::term::format_date(other),
                        );
                    }
                }
            }
        }
    } else {
        for fde in foreign {
            if let Some(other) = fde.start_date {
                if Some(fde.department_id) != out.department_id {
                    out.start_date = Some(other);
                    break;
                }
            }
        }
    }

    if let Some(start) = out.start_date {
        let short_course = out
            .meeting_start_date
            .is_some_and(|ms| start - ms < Duration::days(76));
        out.end_date = Some(start + Duration::days(if short_course { 13 } else { 20 }));
    } else {
        let (start, end) = default_evaluation_dates(
            &out.term_id,
            out.meeting_start_date,
            out.meeting_end_date,
            ctx,
        );
        out.start_date = start;
        out.end_date = end;
    }
}

/// Default evaluation window when no start date has been assigned: count
/// back from the meeting end date (bumped past the pre-finals weekend in
/// Spring and Fall), 13 days for short courses and 20 otherwise.
fn default_evaluation_dates(
    term_id: &str,
    meeting_start: Option<NaiveDate>,
    meeting_end: Option<NaiveDate>,
    ctx: &MergeContext,
) -> (Option<NaiveDate>, Option<NaiveDate>) {
    let Some(mut end) = meeting_end else {
        return (None, None);
    };
    if Some(end) == ctx.default_meeting_end && crate::term::ends_before_finals_week(term_id) {
        end = end + Duration::days(2);
    }
    let start = match meeting_start {
        Some(ms) if end - ms >= Duration::days(90) => end - Duration::days(20),
        Some(_) => end - Duration::days(13),
        None => end - Duration::days(20),
    };
    (Some(start), Some(end))
}

fn resolve_last_updated(
    out: &mut MergedEvaluation,
    rows: &[&SectionRow],
    saved: Option<&EvaluationOverride>,
) {
    // RFC 3339 strings compare correctly lexically.
    let mut updates: Vec<&str> = rows.iter().filter_map(|r| r.loaded_at.as_deref()).collect();
    if let Some(u) = saved.and_then(|s| s.updated_at.as_deref()) {
        updates.push(u);
    }
    out.last_updated = updates.into_iter().max().map(|s| s.to_string());
}
