use crate::merge::EvaluationStatus;
use chrono::NaiveDate;
use serde_json::{Map, Value};

/// One recognized bulk-edit field, already parsed and validated. Adding a
/// field means adding a variant; there is no stringly-typed fallback arm.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldEdit {
    /// Department form by name; `None` clears the override value.
    DepartmentForm(Option<String>),
    /// Evaluation type by name; `None` clears the override value.
    EvaluationType(Option<String>),
    InstructorUid(Option<String>),
    StartDate(Option<NaiveDate>),
    Status(Option<EvaluationStatus>),
    /// Swap the current form for its `_MID` midterm variant.
    Midterm,
}

/// Parses the `fields` request object. Unknown field names and malformed
/// values are rejected before anything is written.
pub fn parse_field_edits(fields: &Map<String, Value>) -> Result<Vec<FieldEdit>, String> {
    let mut edits = Vec::new();
    for (name, value) in fields {
        let edit = match name.as_str() {
            "departmentForm" => FieldEdit::DepartmentForm(parse_opt_string(name, value)?),
            "evaluationType" => FieldEdit::EvaluationType(parse_opt_string(name, value)?),
            "instructorUid" => {
                let uid = parse_opt_string(name, value)?;
                if let Some(uid) = &uid {
                    if !uid.chars().all(|c| c.is_ascii_digit()) {
                        return Err(format!("malformed instructorUid: {}", uid));
                    }
                }
                FieldEdit::InstructorUid(uid)
            }
            "startDate" => match parse_opt_string(name, value)? {
                None => FieldEdit::StartDate(None),
                Some(s) => FieldEdit::StartDate(Some(
                    crate::term::parse_date(&s)
                        .ok_or_else(|| format!("malformed startDate: {}", s))?,
                )),
            },
            "status" => match parse_opt_string(name, value)? {
                None => FieldEdit::Status(None),
                Some(s) => FieldEdit::Status(Some(
                    EvaluationStatus::parse(&s)
                        .ok_or_else(|| format!("unrecognized status: {}", s))?,
                )),
            },
            "midterm" => match value.as_bool() {
                Some(true) => FieldEdit::Midterm,
                Some(false) => continue,
                None => return Err("midterm must be a boolean".to_string()),
            },
            other => return Err(format!("unrecognized field: {}", other)),
        };
        edits.push(edit);
    }
    Ok(edits)
}

fn parse_opt_string(name: &str, value: &Value) -> Result<Option<String>, String> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if !s.trim().is_empty() => Ok(Some(s.trim().to_string())),
        Value::String(_) => Err(format!("{} must not be empty", name)),
        _ => Err(format!("{} must be a string or null", name)),
    }
}
