use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder};
use tracing::debug;

use super::outcome::{Outcome, PassReport};

pub const ACTION_RECONCILE: &str = "Reconcile";

pub async fn emit_event(
    recorder: &Recorder,
    reference: &ObjectReference,
    type_: EventType,
    reason: &str,
    note: Option<String>,
) {
    let res = recorder
        .publish(
            &Event {
                type_,
                reason: reason.into(),
                note,
                action: ACTION_RECONCILE.into(),
                secondary: None,
            },
            reference,
        )
        .await;
    if let Err(e) = res {
        debug!(error = %e, reason, "failed to publish event");
    }
}

/// One event per dependent the pass touched or failed on. Steady-state
/// outcomes stay quiet.
pub async fn publish_outcomes(
    recorder: &Recorder,
    reference: &ObjectReference,
    report: &PassReport,
) {
    for (kind, outcome) in &report.outcomes {
        let type_ = match outcome {
            Outcome::Unchanged | Outcome::Skipped => continue,
            Outcome::Created | Outcome::Updated | Outcome::Deleted => {
                EventType::Normal
            }
            Outcome::Conflict(_) | Outcome::Failed(_) => EventType::Warning,
        };
        let reason = format!("{}{}", kind, outcome.label());
        emit_event(
            recorder,
            reference,
            type_,
            &reason,
            Some(format!("{kind}: {outcome}")),
        )
        .await;
    }
}
