use chrono::NaiveDate;
use std::collections::BTreeSet;

/// Instruction formats that never receive evaluations.
const EXCLUDED_INSTRUCTION_FORMATS: [&str; 5] = ["CLC", "GRP", "IND", "SUP", "VOL"];

/// Role code for a listed instructor who is not the instructor of record.
const ROLE_NO_INSTRUCTOR_OF_RECORD: &str = "ICNT";

/// One row of the read-only source-of-record section feed. A section may
/// span several rows (co-taught sections, multiple meeting patterns).
#[derive(Debug, Clone)]
pub struct SectionRow {
    pub term_id: String,
    pub course_number: String,
    pub subject_area: String,
    pub catalog_id: String,
    pub instruction_format: String,
    pub section_num: String,
    pub course_title: String,
    pub is_primary: bool,
    pub instructor_uid: Option<String>,
    pub instructor_role_code: Option<String>,
    pub meeting_start_date: Option<NaiveDate>,
    pub meeting_end_date: Option<NaiveDate>,
    pub enrollment_count: i64,
    pub cross_listed_with: Option<String>,
    pub room_shared_with: Option<String>,
    pub foreign_department_course: bool,
    /// When the feed snapshot row was loaded; feeds the merged view's
    /// last-updated timestamp.
    pub loaded_at: Option<String>,
}

impl SectionRow {
    pub fn is_visible_by_default(&self) -> bool {
        self.enrollment_count > 0
            && self.instructor_role_code.as_deref() != Some(ROLE_NO_INSTRUCTOR_OF_RECORD)
            && !EXCLUDED_INSTRUCTION_FORMATS.contains(&self.instruction_format.as_str())
    }
}

/// One logical section: all feed rows sharing a course number, collapsed.
#[derive(Debug, Clone)]
pub struct Section {
    pub term_id: String,
    pub course_number: String,
    pub subject_area: String,
    pub catalog_id: String,
    pub instruction_format: String,
    pub section_num: String,
    pub course_title: String,
    pub is_primary: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub cross_listed_with: Vec<String>,
    pub room_shared_with: Vec<String>,
    pub foreign_department_course: bool,
    pub rows: Vec<SectionRow>,
}

impl Section {
    /// Collapses feed rows into one section record. Rows must be presented
    /// in stable feed order (course number, then instructor UID); the first
    /// non-null partner value wins, which keeps the cross-listing/room-share
    /// scan deterministic.
    pub fn from_rows(rows: Vec<SectionRow>) -> Option<Section> {
        let first = rows.first()?.clone();
        let start_date = rows.iter().filter_map(|r| r.meeting_start_date).min();
        let end_date = rows.iter().filter_map(|r| r.meeting_end_date).max();
        let cross_listed_with = first_partner_list(rows.iter().map(|r| r.cross_listed_with.as_deref()));
        let room_shared_with = first_partner_list(rows.iter().map(|r| r.room_shared_with.as_deref()));
        let foreign_department_course = rows.iter().all(|r| r.foreign_department_course);
        Some(Section {
            term_id: first.term_id,
            course_number: first.course_number,
            subject_area: first.subject_area,
            catalog_id: first.catalog_id,
            instruction_format: first.instruction_format,
            section_num: first.section_num,
            course_title: first.course_title,
            is_primary: first.is_primary,
            start_date,
            end_date,
            cross_listed_with,
            room_shared_with,
            foreign_department_course,
            rows,
        })
    }

    pub fn is_cross_listed_or_shared(&self) -> bool {
        !self.cross_listed_with.is_empty() || !self.room_shared_with.is_empty()
    }

    /// Own course number plus every cross-listing and room-share partner.
    pub fn partner_course_numbers(&self) -> Vec<String> {
        let mut numbers: BTreeSet<String> = BTreeSet::new();
        numbers.insert(self.course_number.clone());
        numbers.extend(self.cross_listed_with.iter().cloned());
        numbers.extend(self.room_shared_with.iter().cloned());
        numbers.into_iter().collect()
    }

    /// Default department form for the section, from the first catalog
    /// listing (caller-supplied priority order) whose subject area and
    /// catalog id match. Cross-listed and room-shared sections get no
    /// default: form assignment there must be explicit or inherited.
    pub fn default_form_id(&self, listings: &[CatalogListing]) -> Option<i64> {
        if self.is_cross_listed_or_shared() {
            return None;
        }
        listings
            .iter()
            .find(|l| l.matches(&self.subject_area, &self.catalog_id))
            .and_then(|l| l.default_form_id)
    }
}

fn first_partner_list<'a, I>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    for v in values.into_iter().flatten() {
        let partners: Vec<String> = v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !partners.is_empty() {
            return partners;
        }
    }
    Vec::new()
}

/// One department catalog-listing predicate: subject area (empty string is
/// a wildcard), optional catalog id pattern (`*` matches any run of
/// characters), and the default form the listing assigns.
#[derive(Debug, Clone)]
pub struct CatalogListing {
    pub department_id: i64,
    pub subject_area: String,
    pub catalog_id_pattern: Option<String>,
    pub default_form_id: Option<i64>,
}

impl CatalogListing {
    pub fn matches(&self, subject_area: &str, catalog_id: &str) -> bool {
        if !self.subject_area.is_empty() && self.subject_area != subject_area {
            return false;
        }
        match self.catalog_id_pattern.as_deref() {
            None | Some("") => true,
            Some(pattern) => wildcard_match(pattern, catalog_id),
        }
    }
}

/// Whether a section belongs to a department's slice of the feed: some
/// listing matches and no exclusion pattern (another department's claim on
/// the same subject area) matches the catalog id.
pub fn department_claims_section(
    subject_area: &str,
    catalog_id: &str,
    listings: &[CatalogListing],
    exclusion_patterns: &[String],
) -> bool {
    listings.iter().any(|l| l.matches(subject_area, catalog_id))
        && !exclusion_patterns
            .iter()
            .any(|p| wildcard_match(p, catalog_id))
}

/// Glob-lite matcher: `*` matches any (possibly empty) run of characters,
/// everything else is literal.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    fn inner(p: &[u8], v: &[u8]) -> bool {
        match p.split_first() {
            None => v.is_empty(),
            Some((b'*', rest)) => {
                (0..=v.len()).any(|i| inner(rest, &v[i..]))
            }
            Some((c, rest)) => v.split_first().is_some_and(|(vc, vrest)| vc == c && inner(rest, vrest)),
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}
