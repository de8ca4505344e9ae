use std::future::Future;

use capp_store::{ObjectId, ObjectStore, StoreError};
use tokio::time::{Instant, error::Elapsed, timeout_at};
use tracing::{debug, error, info, warn};

use super::dependent::{Dependent, DependentKind};
use super::outcome::Outcome;

/// Bounds a store call by the pass deadline.
pub async fn bounded<F: Future>(
    deadline: Instant,
    call: F,
) -> Result<F::Output, Elapsed> {
    timeout_at(deadline, call).await
}

/// Drives one dependent object toward `desired`, or removes it when
/// `desired` is `None`. Makes at most one read and one write.
///
/// Store errors become outcomes; only the deadline escapes as `Err`, so the
/// caller can abandon the rest of the pass.
pub async fn sync<T, S>(
    store: &S,
    id: &ObjectId,
    desired: Option<T>,
    deadline: Instant,
) -> Result<Outcome, Elapsed>
where
    T: Dependent,
    S: ObjectStore<T> + ?Sized,
{
    let kind = T::KIND;
    let live = bounded(deadline, store.get(id)).await?;

    let Some(desired) = desired else {
        return Ok(match live {
            Err(e) if e.is_not_found() => {
                debug!(%kind, %id, "not requested, nothing to remove");
                Outcome::Skipped
            }
            Err(e) => failed(kind, id, "read", e),
            Ok(_) => match bounded(deadline, store.delete(id)).await? {
                Ok(()) => {
                    info!(%kind, %id, "deleted");
                    Outcome::Deleted
                }
                Err(e) if e.is_not_found() => {
                    debug!(%kind, %id, "already gone");
                    Outcome::Deleted
                }
                Err(e) => failed(kind, id, "delete", e),
            },
        });
    };

    let live = match live {
        Ok(live) => live,
        Err(e) if e.is_not_found() => {
            return Ok(match bounded(deadline, store.create(&desired)).await? {
                Ok(_) => {
                    info!(%kind, %id, "created");
                    Outcome::Created
                }
                Err(e @ (StoreError::AlreadyExists(_) | StoreError::Conflict(_))) => {
                    conflict(kind, id, e)
                }
                Err(e) => failed(kind, id, "create", e),
            });
        }
        Err(e) => return Ok(failed(kind, id, "read", e)),
    };

    if T::spec_eq(&live.object, &desired) {
        debug!(%kind, %id, "up to date");
        return Ok(Outcome::Unchanged);
    }

    let merged = T::merge_into(live.object, desired);
    Ok(match bounded(deadline, store.update(&merged, &live.token)).await? {
        Ok(_) => {
            info!(%kind, %id, "updated");
            Outcome::Updated
        }
        Err(e) if e.is_conflict() => conflict(kind, id, e),
        Err(e) => failed(kind, id, "update", e),
    })
}

fn conflict(
    kind: DependentKind,
    id: &ObjectId,
    e: StoreError,
) -> Outcome {
    warn!(%kind, %id, error = %e, "write conflict, leaving it to the next pass");
    Outcome::Conflict(e.to_string())
}

fn failed(
    kind: DependentKind,
    id: &ObjectId,
    op: &str,
    e: StoreError,
) -> Outcome {
    error!(%kind, %id, error = %e, "{op} failed");
    Outcome::Failed(format!("{op} {kind} {id}: {e}"))
}
