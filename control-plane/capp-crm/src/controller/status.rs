use chrono::{DateTime, SecondsFormat, Utc};

use super::dependent::DependentKind;
use super::outcome::Outcome;
use crate::crd::capp::{
    CappStatus, Condition, ConditionStatus, ConditionType,
};

pub const REASON_CONVERGED: &str = "Converged";

/// Folds the outcomes of a pass into the Capp status.
///
/// Kinds without an outcome keep their previous condition. A condition's
/// `lastTransitionTime` moves only when its status value flips, so
/// projecting the same outcomes twice yields an identical status.
pub fn project(
    prev: Option<&CappStatus>,
    outcomes: &[(DependentKind, Outcome)],
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> CappStatus {
    let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    let prev_conds = prev.map(|s| s.conditions.as_slice()).unwrap_or(&[]);

    let incoming = outcomes
        .iter()
        .map(|(kind, outcome)| kind_condition(*kind, outcome))
        .collect::<Vec<_>>();
    let mut conditions = upsert_conditions(prev_conds, incoming);
    conditions.retain(|c| c.type_ != ConditionType::Ready);
    conditions.push(ready_condition(&conditions));

    for cond in conditions.iter_mut() {
        cond.last_transition_time = prev_conds
            .iter()
            .find(|p| p.type_ == cond.type_ && p.status == cond.status)
            .and_then(|p| p.last_transition_time.clone())
            .or_else(|| Some(stamp.clone()));
    }
    conditions.sort_by_key(|c| cond_rank(c.type_));

    CappStatus {
        conditions,
        observed_generation: generation,
        domain_mapping: prev.and_then(|s| s.domain_mapping.clone()),
    }
}

fn kind_condition(kind: DependentKind, outcome: &Outcome) -> Condition {
    Condition {
        type_: kind.condition_type(),
        status: ConditionStatus::from(!outcome.is_error()),
        reason: Some(outcome.label().to_string()),
        message: outcome.cause().map(|cause| format!("{kind}: {cause}")),
        last_transition_time: None,
    }
}

fn ready_condition(kind_conds: &[Condition]) -> Condition {
    let failing = kind_conds
        .iter()
        .filter(|c| c.status != ConditionStatus::True)
        .collect::<Vec<_>>();
    match failing.first() {
        None => Condition {
            type_: ConditionType::Ready,
            status: ConditionStatus::True,
            reason: Some(REASON_CONVERGED.into()),
            message: None,
            last_transition_time: None,
        },
        Some(first) => Condition {
            type_: ConditionType::Ready,
            status: ConditionStatus::False,
            reason: first.reason.clone(),
            message: Some(
                failing
                    .iter()
                    .map(|c| {
                        c.message.clone().unwrap_or_else(|| {
                            format!("{:?} is {:?}", c.type_, c.status)
                        })
                    })
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            last_transition_time: None,
        },
    }
}

// Previous entries of unknown type are dropped; the projector owns the set.
fn upsert_conditions(
    existing: &[Condition],
    incoming: Vec<Condition>,
) -> Vec<Condition> {
    let mut out: Vec<Condition> = existing
        .iter()
        .filter(|c| c.type_ != ConditionType::Unknown)
        .cloned()
        .collect();
    for inc in incoming {
        if let Some(idx) = out.iter().position(|c| c.type_ == inc.type_) {
            out[idx] = inc;
        } else {
            out.push(inc);
        }
    }
    out
}

fn cond_rank(t: ConditionType) -> u8 {
    match t {
        ConditionType::Ready => 0,
        ConditionType::WorkloadReady => 1,
        ConditionType::RouteReady => 2,
        ConditionType::DomainMappingReady => 3,
        ConditionType::LoggingReady => 4,
        ConditionType::Unknown => 250,
    }
}
