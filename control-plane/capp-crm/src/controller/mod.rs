mod backoff;
mod dependent;
mod events;
mod gate;
mod outcome;
mod reconcile;
mod status;
mod sync;

pub use backoff::Backoff;
pub use dependent::{Dependent, DependentKind, owned_meta_eq};
pub use gate::{PassGate, PassResult};
pub use outcome::{Outcome, PassReport, RetryDirective};
pub use reconcile::{CappStore, Reconciler};
pub use status::project;
pub use sync::sync;

use std::fmt::Debug;
use std::sync::Arc;

use capp_store::ObjectId;
use capp_store::k8s::KubeStore;
use futures_util::StreamExt;
use kube::{
    Client, Resource, ResourceExt,
    api::Api,
    runtime::{
        Controller,
        controller::Action,
        events::{Recorder, Reporter},
        reflector::ObjectRef,
        watcher::Config,
    },
};
use serde::de::DeserializeOwned;
use tracing::{error, info, warn};

use crate::config::CappConfig;
use crate::crd::PARENT_CAPP_ANNOTATION;
use crate::crd::capp::Capp;
use crate::crd::knative::{DomainMapping, KnativeService};
use crate::crd::logging::LogPipeline;
use crate::crd::route::Route;

pub const CONTROLLER_NAME: &str = "capp-crm";

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error("pass for {id} did not converge: {summary}")]
    NotConverged { id: ObjectId, summary: String },
}

pub struct ControllerContext {
    pub reconciler: Reconciler<KubeStore>,
    pub backoff: Backoff,
    pub recorder: Option<Recorder>,
    pub cfg: CappConfig,
}

fn api<K>(client: &Client, ns: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
{
    match ns {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Maps a dependent back to the Capp named in its parent annotation.
fn parent_capp<K: ResourceExt>(obj: K) -> Option<ObjectRef<Capp>> {
    let parent = obj.annotations().get(PARENT_CAPP_ANNOTATION)?;
    let ns = obj.namespace()?;
    Some(ObjectRef::new(parent).within(&ns))
}

fn watched<K>(
    controller: Controller<Capp>,
    client: &Client,
    ns: Option<&str>,
) -> Controller<Capp>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    controller.watches(api::<K>(client, ns), Config::default(), parent_capp::<K>)
}

pub async fn run_controller(client: Client, cfg: CappConfig) -> anyhow::Result<()> {
    let ns = cfg.watch_namespace().map(str::to_string);
    let ns = ns.as_deref();

    let recorder = cfg.events_enabled().then(|| {
        Recorder::new(
            client.clone(),
            Reporter {
                controller: CONTROLLER_NAME.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        )
    });
    let ctx = Arc::new(ControllerContext {
        reconciler: Reconciler::new(
            KubeStore::new(client.clone()),
            cfg.build_options(),
            cfg.pass_timeout(),
        ),
        backoff: Backoff::new(cfg.retry.backoff_base(), cfg.retry.backoff_max()),
        recorder,
        cfg: cfg.clone(),
    });

    let mut controller = Controller::new(api::<Capp>(&client, ns), Config::default());
    controller = watched::<KnativeService>(controller, &client, ns);
    controller = watched::<DomainMapping>(controller, &client, ns);
    controller = watched::<LogPipeline>(controller, &client, ns);
    if cfg.routes_enabled() {
        controller = watched::<Route>(controller, &client, ns);
    }

    info!(namespace = ns.unwrap_or("*"), "starting capp controller");
    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj_ref, action)) => {
                    info!(capp = %obj_ref, "reconciled: requeue={:?}", action)
                }
                Err(e) => warn!(error = %e, "reconcile error"),
            }
        })
        .await;

    info!("capp controller stopped");
    Ok(())
}

async fn reconcile(
    obj: Arc<Capp>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let id = ObjectId::of(obj.as_ref());
    let report = match ctx.reconciler.run(&id).await {
        PassResult::Completed(report) => report,
        PassResult::Coalesced => {
            return Ok(Action::requeue(ctx.cfg.retry.requeue_soon()));
        }
    };

    if let Some(recorder) = &ctx.recorder {
        let reference = obj.object_ref(&());
        events::publish_outcomes(recorder, &reference, &report).await;
    }

    match report.directive {
        RetryDirective::NoRetry => {
            ctx.backoff.reset(&id);
            Ok(Action::requeue(ctx.cfg.retry.resync()))
        }
        RetryDirective::RetrySoon => {
            ctx.backoff.reset(&id);
            Ok(Action::requeue(ctx.cfg.retry.requeue_soon()))
        }
        RetryDirective::RetryWithBackoff => Err(ReconcileErr::NotConverged {
            summary: failure_summary(&report),
            id,
        }),
    }
}

fn failure_summary(report: &PassReport) -> String {
    let failing = report
        .outcomes
        .iter()
        .filter(|(_, o)| o.is_error())
        .map(|(kind, o)| format!("{kind}: {o}"))
        .collect::<Vec<_>>();
    if failing.is_empty() {
        "pass aborted before dependents converged".into()
    } else {
        failing.join("; ")
    }
}

fn error_policy(
    obj: Arc<Capp>,
    err: &ReconcileErr,
    ctx: Arc<ControllerContext>,
) -> Action {
    let id = ObjectId::of(obj.as_ref());
    let delay = ctx.backoff.next_delay(&id);
    error!(error = %err, failures = ctx.backoff.failures(&id), ?delay, "backing off");
    Action::requeue(delay)
}
