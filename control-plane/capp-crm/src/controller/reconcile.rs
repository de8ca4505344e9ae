use capp_store::{ObjectId, ObjectStore, StoreError, Versioned};
use chrono::Utc;
use kube::ResourceExt;
use tokio::time::{Duration, Instant, error::Elapsed};
use tracing::{debug, error, info, instrument, warn};

use super::dependent::{Dependent, DependentKind};
use super::gate::{PassGate, PassResult};
use super::outcome::{Outcome, PassReport, RetryDirective};
use super::status::project;
use super::sync::{bounded, sync};
use crate::builder::{BuildOptions, DesiredState, build, domain_mapping_id};
use crate::crd::FINALIZER;
use crate::crd::capp::{Capp, RouteSpec};
use crate::crd::knative::{DomainMapping, KnativeService};
use crate::crd::logging::LogPipeline;
use crate::crd::route::Route;

/// Everything a pass reads and writes: the Capp itself and every dependent
/// kind.
pub trait CappStore:
    ObjectStore<Capp>
    + ObjectStore<KnativeService>
    + ObjectStore<Route>
    + ObjectStore<DomainMapping>
    + ObjectStore<LogPipeline>
{
}

impl<S> CappStore for S where
    S: ObjectStore<Capp>
        + ObjectStore<KnativeService>
        + ObjectStore<Route>
        + ObjectStore<DomainMapping>
        + ObjectStore<LogPipeline>
{
}

/// Drives one Capp at a time toward its desired state.
pub struct Reconciler<S> {
    store: S,
    opts: BuildOptions,
    pass_timeout: Duration,
    gate: PassGate,
}

impl<S: CappStore> Reconciler<S> {
    pub fn new(store: S, opts: BuildOptions, pass_timeout: Duration) -> Self {
        Self {
            store,
            opts,
            pass_timeout,
            gate: PassGate::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs a pass unless one is already in flight for `id`, in which case
    /// the running worker picks the trigger up when it finishes.
    pub async fn run(&self, id: &ObjectId) -> PassResult {
        self.gate.run(id, move || self.reconcile(id)).await
    }

    /// One pass bounded by the configured timeout.
    pub async fn reconcile(&self, id: &ObjectId) -> PassReport {
        self.reconcile_until(id, Instant::now() + self.pass_timeout)
            .await
    }

    #[instrument(skip_all, fields(ns = %id.namespace, name = %id.name))]
    pub async fn reconcile_until(
        &self,
        id: &ObjectId,
        deadline: Instant,
    ) -> PassReport {
        let mut outcomes = Vec::with_capacity(DependentKind::APPLY_ORDER.len());
        match self.pass(id, deadline, &mut outcomes).await {
            Ok(directive) => PassReport {
                directive,
                outcomes,
            },
            Err(_) => {
                warn!(done = outcomes.len(), "pass deadline exceeded, abandoning");
                PassReport {
                    directive: RetryDirective::RetryWithBackoff,
                    outcomes,
                }
            }
        }
    }

    async fn pass(
        &self,
        id: &ObjectId,
        deadline: Instant,
        outcomes: &mut Vec<(DependentKind, Outcome)>,
    ) -> Result<RetryDirective, Elapsed> {
        let read =
            bounded(deadline, ObjectStore::<Capp>::get(&self.store, id)).await?;
        let capp = match read {
            Ok(capp) => capp,
            Err(e) if e.is_not_found() => {
                debug!("capp is gone, nothing to do");
                return Ok(RetryDirective::NoRetry);
            }
            Err(e) => {
                error!(error = %e, "failed to read capp");
                return Ok(RetryDirective::RetryWithBackoff);
            }
        };

        if capp.object.metadata.deletion_timestamp.is_some() {
            return self.teardown(id, capp, deadline, outcomes).await;
        }

        let Some(capp) = self.ensure_finalizer(capp, deadline).await? else {
            return Ok(RetryDirective::RetryWithBackoff);
        };

        let mut desired = build(&capp.object, &self.opts);
        let previous = recorded_mapping(id, &capp.object)
            .into_iter()
            .collect::<Vec<_>>();
        let mut mapped = None;
        for kind in DependentKind::APPLY_ORDER {
            let outcome = self
                .sync_kind(kind, id, &mut desired, &previous, &mut mapped, deadline)
                .await?;
            outcomes.push((kind, outcome));
        }

        let status_ok = self
            .write_status(id, capp, outcomes, mapped, deadline)
            .await?;
        let directive =
            RetryDirective::from_outcomes(outcomes.iter().map(|(_, o)| o));
        Ok(if status_ok {
            directive
        } else {
            RetryDirective::RetryWithBackoff
        })
    }

    async fn teardown(
        &self,
        id: &ObjectId,
        capp: Versioned<Capp>,
        deadline: Instant,
        outcomes: &mut Vec<(DependentKind, Outcome)>,
    ) -> Result<RetryDirective, Elapsed> {
        info!("capp is being deleted, tearing down dependents");
        let mut nothing = DesiredState::default();
        // fall back to the spec's hostname when no mapping was ever recorded
        let previous = recorded_mapping(id, &capp.object)
            .or_else(|| {
                capp.object
                    .spec
                    .route_spec
                    .as_ref()
                    .and_then(RouteSpec::custom_hostname)
                    .map(|host| domain_mapping_id(id, host))
            })
            .into_iter()
            .collect::<Vec<_>>();
        let mut mapped = None;
        for kind in DependentKind::TEARDOWN_ORDER {
            let outcome = self
                .sync_kind(kind, id, &mut nothing, &previous, &mut mapped, deadline)
                .await?;
            outcomes.push((kind, outcome));
        }

        if outcomes.iter().any(|(_, o)| o.is_error()) {
            warn!("teardown incomplete, keeping finalizer");
            self.write_status(id, capp, outcomes, mapped, deadline).await?;
            return Ok(RetryDirective::RetryWithBackoff);
        }
        if !capp.object.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(RetryDirective::NoRetry);
        }

        let mut released = capp.object;
        released.finalizers_mut().retain(|f| f != FINALIZER);
        let res = bounded(
            deadline,
            ObjectStore::<Capp>::update(&self.store, &released, &capp.token),
        )
        .await?;
        Ok(match res {
            Ok(_) => {
                info!("dependents removed, finalizer released");
                RetryDirective::NoRetry
            }
            // already released by an earlier pass
            Err(StoreError::NotFound(_)) => RetryDirective::NoRetry,
            Err(e) => {
                warn!(error = %e, "failed to release finalizer");
                RetryDirective::RetryWithBackoff
            }
        })
    }

    /// Returns the Capp as it stands after the finalizer is in place, or
    /// `None` when adding it failed.
    async fn ensure_finalizer(
        &self,
        capp: Versioned<Capp>,
        deadline: Instant,
    ) -> Result<Option<Versioned<Capp>>, Elapsed> {
        if capp.object.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(Some(capp));
        }
        let mut object = capp.object;
        object.finalizers_mut().push(FINALIZER.to_string());
        let res = bounded(
            deadline,
            ObjectStore::<Capp>::update(&self.store, &object, &capp.token),
        )
        .await?;
        Ok(match res {
            Ok(token) => {
                info!("finalizer added");
                Some(Versioned { object, token })
            }
            Err(e) if e.is_conflict() => {
                warn!(error = %e, "finalizer write conflicted");
                None
            }
            Err(e) => {
                error!(error = %e, "failed to add finalizer");
                None
            }
        })
    }

    /// Writes the projected status if it changed. A conflicting write is
    /// retried once against a fresh read. Returns whether the status is
    /// now persisted.
    async fn write_status(
        &self,
        id: &ObjectId,
        mut capp: Versioned<Capp>,
        outcomes: &[(DependentKind, Outcome)],
        mapped: Option<String>,
        deadline: Instant,
    ) -> Result<bool, Elapsed> {
        for attempt in 0..2 {
            let mut status = project(
                capp.object.status.as_ref(),
                outcomes,
                capp.object.metadata.generation,
                Utc::now(),
            );
            status.domain_mapping = mapped.clone();
            if capp.object.status.as_ref() == Some(&status) {
                debug!("status unchanged");
                return Ok(true);
            }
            capp.object.status = Some(status);
            let res = bounded(
                deadline,
                ObjectStore::<Capp>::update_status(
                    &self.store,
                    &capp.object,
                    &capp.token,
                ),
            )
            .await?;
            match res {
                Ok(_) => {
                    info!("status updated");
                    return Ok(true);
                }
                Err(e) if e.is_conflict() && attempt == 0 => {
                    warn!(error = %e, "status write conflicted, re-reading");
                    let fresh = bounded(
                        deadline,
                        ObjectStore::<Capp>::get(&self.store, id),
                    )
                    .await?;
                    match fresh {
                        Ok(fresh) => capp = fresh,
                        Err(e) => {
                            error!(error = %e, "failed to re-read capp");
                            return Ok(false);
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to write status");
                    return Ok(false);
                }
            }
        }
        Ok(false)
    }

    async fn sync_kind(
        &self,
        kind: DependentKind,
        id: &ObjectId,
        desired: &mut DesiredState,
        previous: &[ObjectId],
        mapped: &mut Option<String>,
        deadline: Instant,
    ) -> Result<Outcome, Elapsed> {
        match kind {
            DependentKind::Workload => {
                self.sync_one::<KnativeService>(id, desired, deadline).await
            }
            DependentKind::Route => {
                self.sync_one::<Route>(id, desired, deadline).await
            }
            DependentKind::DomainMapping => {
                let target = DomainMapping::take_desired(desired);
                self.sync_domain_mapping(target, previous, mapped, deadline)
                    .await
            }
            DependentKind::LoggingPipeline => {
                self.sync_one::<LogPipeline>(id, desired, deadline).await
            }
        }
    }

    async fn sync_one<T>(
        &self,
        capp: &ObjectId,
        desired: &mut DesiredState,
        deadline: Instant,
    ) -> Result<Outcome, Elapsed>
    where
        T: Dependent,
        S: ObjectStore<T>,
    {
        sync(&self.store, capp, T::take_desired(desired), deadline).await
    }

    /// DomainMappings are named after the domain, so a hostname change
    /// moves the object. Mappings under `previous` names are removed before
    /// the desired one is applied; `mapped` receives the name to record.
    async fn sync_domain_mapping(
        &self,
        desired: Option<DomainMapping>,
        previous: &[ObjectId],
        mapped: &mut Option<String>,
        deadline: Instant,
    ) -> Result<Outcome, Elapsed> {
        let target = desired.as_ref().map(ObjectId::of);
        let mut removed = false;
        for old in previous.iter().filter(|old| Some(*old) != target.as_ref()) {
            let outcome =
                sync::<DomainMapping, _>(&self.store, old, None, deadline).await?;
            if outcome.is_error() {
                *mapped = Some(old.name.clone());
                return Ok(outcome);
            }
            removed |= outcome == Outcome::Deleted;
        }

        let (Some(desired), Some(target)) = (desired, target) else {
            return Ok(if removed {
                Outcome::Deleted
            } else {
                Outcome::Skipped
            });
        };
        // recorded even when the write fails
        *mapped = Some(target.name.clone());
        let outcome = sync(&self.store, &target, Some(desired), deadline).await?;
        Ok(match outcome {
            Outcome::Unchanged if removed => Outcome::Updated,
            other => other,
        })
    }
}

fn recorded_mapping(id: &ObjectId, capp: &Capp) -> Option<ObjectId> {
    capp.status
        .as_ref()
        .and_then(|s| s.domain_mapping.as_deref())
        .map(|name| ObjectId::new(id.namespace.clone(), name))
}
