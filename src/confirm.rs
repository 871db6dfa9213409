use crate::merge::{forms_are_midterm_pair, DepartmentForm, EvaluationType, MergedEvaluation};
use chrono::NaiveDate;

/// Replacement values supplied atomically with a confirmation request.
/// A bulk confirm of incomplete rows is allowed only when all four required
/// fields arrive in the same request.
#[derive(Debug, Clone, Default)]
pub struct ProposedFields {
    pub department_form: Option<DepartmentForm>,
    pub evaluation_type: Option<EvaluationType>,
    pub instructor_uid: Option<String>,
    pub start_date: Option<NaiveDate>,
}

impl ProposedFields {
    pub fn supplies_all_required(&self) -> bool {
        self.department_form.is_some()
            && self.evaluation_type.is_some()
            && self.instructor_uid.is_some()
            && self.start_date.is_some()
    }
}

/// Another department's already-resolved view of the same instructor and
/// underlying section.
#[derive(Debug, Clone)]
pub struct PeerView {
    pub department_name: String,
    pub department_form: Option<DepartmentForm>,
    pub evaluation_type: Option<EvaluationType>,
    pub start_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmError {
    /// Some evaluation in the batch lacks a required field and the request
    /// does not repair all of them.
    Incomplete { evaluation_ids: Vec<String> },
    /// Some evaluation, with the proposed fields applied, still disagrees
    /// with another department's view.
    Conflicting { evaluation_ids: Vec<String> },
}

impl ConfirmError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Incomplete { .. } => "incomplete",
            Self::Conflicting { .. } => "conflicting",
        }
    }

    pub fn evaluation_ids(&self) -> &[String] {
        match self {
            Self::Incomplete { evaluation_ids } | Self::Conflicting { evaluation_ids } => {
                evaluation_ids
            }
        }
    }
}

/// Decides whether a candidate batch may transition to `confirmed`. Pure:
/// the caller fetches the merged views and each view's cross-department
/// peers beforehand. Completeness is checked first, then conflict-freedom
/// with the proposed fields applied.
pub fn can_confirm(
    batch: &[(MergedEvaluation, Vec<PeerView>)],
    proposed: &ProposedFields,
) -> Result<(), ConfirmError> {
    let incomplete: Vec<String> = batch
        .iter()
        .map(|(e, _)| e)
        .filter(|e| {
            e.department_form.is_none()
                || e.evaluation_type.is_none()
                || e.instructor_uid.is_none()
                || e.start_date.is_none()
        })
        .map(|e| e.feed_id())
        .collect();
    if !incomplete.is_empty() && !proposed.supplies_all_required() {
        return Err(ConfirmError::Incomplete {
            evaluation_ids: incomplete,
        });
    }

    let mut conflicting = Vec::new();
    for (evaluation, peers) in batch {
        let form = proposed
            .department_form
            .as_ref()
            .or(evaluation.department_form.as_ref());
        let eval_type = proposed
            .evaluation_type
            .as_ref()
            .or(evaluation.evaluation_type.as_ref());
        let start_date = proposed.start_date.or(evaluation.start_date);

        let disagrees = peers.iter().any(|peer| {
            field_conflicts(form, peer.department_form.as_ref(), |a, b| {
                a.id != b.id && !forms_are_midterm_pair(&a.name, &b.name)
            }) || field_conflicts(eval_type, peer.evaluation_type.as_ref(), |a, b| a.id != b.id)
                || field_conflicts(start_date.as_ref(), peer.start_date.as_ref(), |a, b| a != b)
        });
        if disagrees {
            conflicting.push(evaluation.feed_id());
        }
    }
    if !conflicting.is_empty() {
        return Err(ConfirmError::Conflicting {
            evaluation_ids: conflicting,
        });
    }
    Ok(())
}

fn field_conflicts<T>(local: Option<&T>, peer: Option<&T>, differs: impl Fn(&T, &T) -> bool) -> bool {
    match (local, peer) {
        (Some(a), Some(b)) => differs(a, b),
        _ => false,
    }
}
