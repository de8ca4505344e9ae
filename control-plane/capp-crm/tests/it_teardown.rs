mod common;

use capp_crm::controller::{DependentKind, Outcome, RetryDirective};
use capp_crm::crd::FINALIZER;
use capp_crm::crd::capp::{Capp, ConditionStatus, ConditionType};
use capp_crm::crd::knative::{DomainMapping, KnativeService};
use capp_crm::crd::logging::LogPipeline;
use capp_crm::crd::route::Route;
use capp_store::ObjectStore;
use capp_store::memory::{Fault, MemoryStore, Op};
use common::*;
use kube::ResourceExt;

async fn delete_capp(store: &MemoryStore, id: &capp_store::ObjectId) {
    ObjectStore::<Capp>::delete(store, id).await.expect("mark deleted");
}

#[test_log::test(tokio::test)]
async fn deletion_removes_dependents_then_releases_finalizer() {
    let store = MemoryStore::new();
    let id = submit(
        &store,
        &with_logging(with_hostname(capp("shop"), "shop.example.com")),
    )
    .await;
    let rec = reconciler(&store);
    rec.reconcile(&id).await;

    delete_capp(&store, &id).await;
    let marked: Capp = store.peek(&id).await.expect("held by finalizer");
    assert!(marked.metadata.deletion_timestamp.is_some());

    let report = rec.reconcile(&id).await;

    assert_eq!(report.directive, RetryDirective::NoRetry);
    let kinds = report.outcomes.iter().map(|(k, _)| *k).collect::<Vec<_>>();
    assert_eq!(kinds, DependentKind::TEARDOWN_ORDER.to_vec());
    assert!(report.outcomes.iter().all(|(_, o)| *o == Outcome::Deleted));

    assert!(store.peek::<KnativeService>(&id).await.is_none());
    assert!(store.peek::<Route>(&id).await.is_none());
    assert!(
        store
            .peek::<DomainMapping>(&common::id("shop.example.com"))
            .await
            .is_none()
    );
    assert!(store.peek::<LogPipeline>(&id).await.is_none());
    assert!(store.peek::<Capp>(&id).await.is_none());
}

#[test_log::test(tokio::test)]
async fn unrequested_kinds_are_skipped_during_teardown() {
    let store = MemoryStore::new();
    let id = submit(&store, &capp("shop")).await;
    let rec = reconciler(&store);
    rec.reconcile(&id).await;
    delete_capp(&store, &id).await;

    let report = rec.reconcile(&id).await;

    assert_eq!(report.directive, RetryDirective::NoRetry);
    assert_eq!(report.outcome(DependentKind::Workload), Some(&Outcome::Deleted));
    assert_eq!(report.outcome(DependentKind::Route), Some(&Outcome::Skipped));
    assert_eq!(
        report.outcome(DependentKind::LoggingPipeline),
        Some(&Outcome::Skipped)
    );
    assert!(store.peek::<Capp>(&id).await.is_none());
}

#[test_log::test(tokio::test)]
async fn failed_teardown_keeps_the_finalizer_until_it_succeeds() {
    let store = MemoryStore::new();
    let id = submit(&store, &with_hostname(capp("shop"), "shop.example.com"))
        .await;
    let rec = reconciler(&store);
    rec.reconcile(&id).await;
    delete_capp(&store, &id).await;
    store
        .fail_always::<Route>(Op::Delete, Fault::Backend("forbidden".into()))
        .await;

    let report = rec.reconcile(&id).await;

    assert_eq!(report.directive, RetryDirective::RetryWithBackoff);
    assert!(matches!(
        report.outcome(DependentKind::Route),
        Some(Outcome::Failed(_))
    ));
    // later kinds in the teardown order are still attempted
    assert_eq!(report.outcome(DependentKind::Workload), Some(&Outcome::Deleted));
    let held: Capp = store.peek(&id).await.expect("still held");
    assert!(held.finalizers().iter().any(|f| f == FINALIZER));
    assert!(store.peek::<Route>(&id).await.is_some());

    let status = held.status.expect("teardown status");
    let route = status.condition(ConditionType::RouteReady).unwrap();
    assert_eq!(route.status, ConditionStatus::False);
    assert_eq!(route.reason.as_deref(), Some("Failed"));
    assert!(route.message.as_deref().unwrap().contains("forbidden"));
    let ready = status.condition(ConditionType::Ready).unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason.as_deref(), Some("Failed"));
    assert_eq!(
        status.condition(ConditionType::WorkloadReady).unwrap().reason.as_deref(),
        Some("Deleted")
    );
    assert_eq!(status.domain_mapping, None);

    store.clear_faults().await;
    let report = rec.reconcile(&id).await;
    assert_eq!(report.directive, RetryDirective::NoRetry);
    assert_eq!(report.outcome(DependentKind::Route), Some(&Outcome::Deleted));
    assert_eq!(report.outcome(DependentKind::Workload), Some(&Outcome::Skipped));
    assert!(store.peek::<Capp>(&id).await.is_none());
}

#[test_log::test(tokio::test)]
async fn mapping_is_found_from_the_spec_when_never_recorded() {
    let store = MemoryStore::new();
    let id = submit(&store, &with_hostname(capp("shop"), "shop.example.com"))
        .await;
    let rec = reconciler(&store);
    // the first status write is lost, so no mapping gets recorded
    store.fail::<Capp>(Op::UpdateStatus, Fault::Conflict, 2).await;
    rec.reconcile(&id).await;
    let mapping = common::id("shop.example.com");
    assert!(store.peek::<DomainMapping>(&mapping).await.is_some());
    assert!(store.peek::<Capp>(&id).await.unwrap().status.is_none());

    delete_capp(&store, &id).await;
    let report = rec.reconcile(&id).await;

    assert_eq!(report.directive, RetryDirective::NoRetry);
    assert_eq!(
        report.outcome(DependentKind::DomainMapping),
        Some(&Outcome::Deleted)
    );
    assert!(store.peek::<DomainMapping>(&mapping).await.is_none());
}

#[test_log::test(tokio::test)]
async fn finalizer_release_conflict_is_retried_later() {
    let store = MemoryStore::new();
    let id = submit(&store, &capp("shop")).await;
    let rec = reconciler(&store);
    rec.reconcile(&id).await;
    delete_capp(&store, &id).await;
    store.fail::<Capp>(Op::Update, Fault::Conflict, 1).await;

    let report = rec.reconcile(&id).await;
    assert_eq!(report.directive, RetryDirective::RetryWithBackoff);
    assert!(store.peek::<Capp>(&id).await.is_some());

    let report = rec.reconcile(&id).await;
    assert_eq!(report.directive, RetryDirective::NoRetry);
    assert!(store.peek::<Capp>(&id).await.is_none());
}
