use std::collections::BTreeMap;
use std::fmt;

use capp_store::StoredObject;
use kube::ResourceExt;

use crate::builder::{DesiredState, MAX_SCALE_ANNOTATION, MIN_SCALE_ANNOTATION};
use crate::crd::capp::ConditionType;
use crate::crd::knative::{
    Container, DomainMapping, KnativeService, TemplateMetadata,
};
use crate::crd::logging::LogPipeline;
use crate::crd::route::Route;

/// The dependent object kinds a Capp drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependentKind {
    Workload,
    Route,
    DomainMapping,
    LoggingPipeline,
}

impl DependentKind {
    /// Order kinds are synchronized in on a normal pass. Targets come
    /// before the objects that reference them.
    pub const APPLY_ORDER: [DependentKind; 4] = [
        DependentKind::Workload,
        DependentKind::Route,
        DependentKind::DomainMapping,
        DependentKind::LoggingPipeline,
    ];

    /// Order kinds are removed in when the Capp is deleted.
    pub const TEARDOWN_ORDER: [DependentKind; 4] = [
        DependentKind::LoggingPipeline,
        DependentKind::DomainMapping,
        DependentKind::Route,
        DependentKind::Workload,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DependentKind::Workload => "Workload",
            DependentKind::Route => "Route",
            DependentKind::DomainMapping => "DomainMapping",
            DependentKind::LoggingPipeline => "LoggingPipeline",
        }
    }

    pub fn condition_type(self) -> ConditionType {
        match self {
            DependentKind::Workload => ConditionType::WorkloadReady,
            DependentKind::Route => ConditionType::RouteReady,
            DependentKind::DomainMapping => ConditionType::DomainMappingReady,
            DependentKind::LoggingPipeline => ConditionType::LoggingReady,
        }
    }
}

impl fmt::Display for DependentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-kind behaviour the synchronizer is generic over.
///
/// `spec_eq` looks only at what the builder renders, so fields defaulted by
/// the platform (or written by other controllers) never cause a write.
/// `merge_into` lays the desired state over the live object and keeps
/// everything the builder does not own, including fields the mirrors only
/// carry in `extra`.
pub trait Dependent: StoredObject {
    const KIND: DependentKind;

    /// Moves this kind's target out of a rendered desired state.
    fn take_desired(state: &mut DesiredState) -> Option<Self>;

    fn spec_eq(live: &Self, desired: &Self) -> bool;

    fn merge_into(live: Self, desired: Self) -> Self;
}

/// True when every label and annotation `desired` sets is present on `live`
/// with the same value. Extra entries on `live` are not ours to judge.
pub fn owned_meta_eq<K: ResourceExt>(live: &K, desired: &K) -> bool {
    is_subset(desired.labels(), live.labels())
        && is_subset(desired.annotations(), live.annotations())
}

fn merge_owned_meta<K: ResourceExt>(live: &mut K, desired: &K) {
    live.labels_mut().extend(
        desired
            .labels()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    live.annotations_mut().extend(
        desired
            .annotations()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
}

fn is_subset(
    wanted: &BTreeMap<String, String>,
    have: &BTreeMap<String, String>,
) -> bool {
    wanted.iter().all(|(k, v)| have.get(k) == Some(v))
}

impl Dependent for KnativeService {
    const KIND: DependentKind = DependentKind::Workload;

    fn take_desired(state: &mut DesiredState) -> Option<Self> {
        state.workload.take()
    }

    fn spec_eq(live: &Self, desired: &Self) -> bool {
        let (l, d) = (&live.spec.template, &desired.spec.template);
        owned_meta_eq(live, desired)
            && l.spec.container_concurrency == d.spec.container_concurrency
            && template_meta_eq(l.metadata.as_ref(), d.metadata.as_ref())
            && l.spec.containers.len() == d.spec.containers.len()
            && l.spec
                .containers
                .iter()
                .zip(&d.spec.containers)
                .all(|(l, d)| container_eq(l, d))
    }

    fn merge_into(mut live: Self, desired: Self) -> Self {
        merge_owned_meta(&mut live, &desired);
        let tmpl = &mut live.spec.template;
        let want = desired.spec.template;
        tmpl.spec.container_concurrency = want.spec.container_concurrency;

        let mut meta = tmpl.metadata.take().unwrap_or_default();
        let want_meta = want.metadata.unwrap_or_default();
        meta.labels.extend(want_meta.labels);
        for key in [MIN_SCALE_ANNOTATION, MAX_SCALE_ANNOTATION] {
            match want_meta.annotations.get(key) {
                Some(v) => {
                    meta.annotations.insert(key.to_string(), v.clone());
                }
                None => {
                    meta.annotations.remove(key);
                }
            }
        }
        tmpl.metadata = Some(meta);

        let mut live_containers = std::mem::take(&mut tmpl.spec.containers)
            .into_iter();
        tmpl.spec.containers = want
            .spec
            .containers
            .into_iter()
            .map(|mut c| {
                if let Some(prev) = live_containers.next() {
                    c.extra = prev.extra;
                }
                c
            })
            .collect();
        live
    }
}

fn container_eq(live: &Container, desired: &Container) -> bool {
    live.image == desired.image
        && live.env == desired.env
        && live.ports == desired.ports
        && (desired.name.is_none() || live.name == desired.name)
}

fn template_meta_eq(
    live: Option<&TemplateMetadata>,
    desired: Option<&TemplateMetadata>,
) -> bool {
    let empty = TemplateMetadata::default();
    let live = live.unwrap_or(&empty);
    let desired = desired.unwrap_or(&empty);
    is_subset(&desired.labels, &live.labels)
        && [MIN_SCALE_ANNOTATION, MAX_SCALE_ANNOTATION]
            .iter()
            .all(|k| live.annotations.get(*k) == desired.annotations.get(*k))
}

impl Dependent for Route {
    const KIND: DependentKind = DependentKind::Route;

    fn take_desired(state: &mut DesiredState) -> Option<Self> {
        state.route.take()
    }

    fn spec_eq(live: &Self, desired: &Self) -> bool {
        // without a custom hostname the router assigns one
        owned_meta_eq(live, desired)
            && (desired.spec.host.is_none()
                || live.spec.host == desired.spec.host)
            && live.spec.to == desired.spec.to
            && live.spec.tls == desired.spec.tls
    }

    fn merge_into(mut live: Self, desired: Self) -> Self {
        merge_owned_meta(&mut live, &desired);
        if desired.spec.host.is_some() {
            live.spec.host = desired.spec.host;
        }
        live.spec.to = desired.spec.to;
        live.spec.tls = desired.spec.tls;
        live
    }
}

impl Dependent for DomainMapping {
    const KIND: DependentKind = DependentKind::DomainMapping;

    fn take_desired(state: &mut DesiredState) -> Option<Self> {
        state.domain_mapping.take()
    }

    fn spec_eq(live: &Self, desired: &Self) -> bool {
        let (l, d) = (&live.spec.reference, &desired.spec.reference);
        // the serving webhook fills in the reference namespace
        owned_meta_eq(live, desired)
            && l.api_version == d.api_version
            && l.kind == d.kind
            && l.name == d.name
            && (d.namespace.is_none() || l.namespace == d.namespace)
            && live.spec.tls == desired.spec.tls
    }

    fn merge_into(mut live: Self, desired: Self) -> Self {
        merge_owned_meta(&mut live, &desired);
        let namespace = live.spec.reference.namespace.take();
        live.spec.reference = desired.spec.reference;
        if live.spec.reference.namespace.is_none() {
            live.spec.reference.namespace = namespace;
        }
        live.spec.tls = desired.spec.tls;
        live
    }
}

impl Dependent for LogPipeline {
    const KIND: DependentKind = DependentKind::LoggingPipeline;

    fn take_desired(state: &mut DesiredState) -> Option<Self> {
        state.logging.take()
    }

    fn spec_eq(live: &Self, desired: &Self) -> bool {
        owned_meta_eq(live, desired) && live.spec == desired.spec
    }

    fn merge_into(mut live: Self, desired: Self) -> Self {
        merge_owned_meta(&mut live, &desired);
        live.spec = desired.spec;
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::builder::{BuildOptions, DesiredState, build};
    use crate::crd::capp::{Capp, CappSpec, ConfigurationSpec, RouteSpec};

    fn rendered(hostname: Option<&str>) -> DesiredState {
        let mut capp = Capp::new(
            "shop",
            CappSpec {
                configuration_spec: ConfigurationSpec {
                    image: "img:1".into(),
                    ..Default::default()
                },
                route_spec: Some(RouteSpec {
                    hostname: hostname.map(str::to_string),
                    tls_enabled: true,
                }),
                log_spec: None,
            },
        );
        capp.metadata.namespace = Some("team-a".into());
        build(
            &capp,
            &BuildOptions {
                routes_enabled: true,
                ..Default::default()
            },
        )
    }

    fn rendered_workload(image: &str, min_scale: Option<i32>) -> KnativeService {
        let mut capp = Capp::new(
            "shop",
            CappSpec {
                configuration_spec: ConfigurationSpec {
                    image: image.into(),
                    min_scale,
                    ..Default::default()
                },
                route_spec: None,
                log_spec: None,
            },
        );
        capp.metadata.namespace = Some("team-a".into());
        build(&capp, &BuildOptions::default())
            .workload
            .expect("workload")
    }

    #[test]
    fn orders_are_mirror_images() {
        let mut reversed = DependentKind::APPLY_ORDER;
        reversed.reverse();
        assert_eq!(reversed, DependentKind::TEARDOWN_ORDER);
    }

    #[test]
    fn platform_defaults_do_not_count_as_drift() {
        let desired = rendered_workload("img:1", Some(1));
        let mut live = desired.clone();
        live.metadata.resource_version = Some("42".into());
        live.labels_mut()
            .insert("serving.knative.dev/creator".into(), "admin".into());
        live.spec.template.spec.timeout_seconds = Some(300);
        live.spec
            .template
            .metadata
            .as_mut()
            .unwrap()
            .annotations
            .insert("autoscaling.knative.dev/target".into(), "100".into());
        assert!(KnativeService::spec_eq(&live, &desired));
    }

    #[test]
    fn image_and_scale_changes_are_drift() {
        let desired = rendered_workload("img:2", Some(1));
        assert!(!KnativeService::spec_eq(
            &rendered_workload("img:1", Some(1)),
            &desired
        ));
        // a dropped bound must be removed from the live object too
        assert!(!KnativeService::spec_eq(
            &rendered_workload("img:2", Some(1)),
            &rendered_workload("img:2", None)
        ));
    }

    #[test]
    fn merge_keeps_foreign_metadata_and_platform_fields() {
        let mut live = rendered_workload("img:1", Some(1));
        live.metadata.resource_version = Some("7".into());
        live.metadata.uid = Some("uid-1".into());
        live.annotations_mut()
            .insert("team/owner".into(), "ops".into());
        live.spec.template.spec.timeout_seconds = Some(300);

        let desired = rendered_workload("img:2", None);
        let merged = KnativeService::merge_into(live, desired.clone());

        assert_eq!(merged.metadata.resource_version.as_deref(), Some("7"));
        assert_eq!(merged.metadata.uid.as_deref(), Some("uid-1"));
        assert_eq!(merged.annotations()["team/owner"], "ops");
        assert_eq!(merged.spec.template.spec.timeout_seconds, Some(300));
        assert_eq!(merged.spec.template.spec.containers[0].image, "img:2");
        let meta = merged.spec.template.metadata.as_ref().unwrap();
        assert!(!meta.annotations.contains_key(MIN_SCALE_ANNOTATION));
        assert!(KnativeService::spec_eq(&merged, &desired));
    }

    #[test]
    fn overwritten_owner_annotation_is_drift() {
        let desired = rendered_workload("img:1", None);
        let mut live = desired.clone();
        live.annotations_mut().insert(
            crate::crd::PARENT_CAPP_ANNOTATION.into(),
            "someone-else".into(),
        );
        assert!(!KnativeService::spec_eq(&live, &desired));
        let merged = KnativeService::merge_into(live, desired.clone());
        assert!(KnativeService::spec_eq(&merged, &desired));
    }

    #[test]
    fn router_assigned_host_is_not_drift() {
        let desired = rendered(None).route.expect("route");
        let mut live = desired.clone();
        live.spec.host = Some("shop-team-a.apps.example.com".into());
        live.spec.wildcard_policy = Some("None".into());
        assert!(Route::spec_eq(&live, &desired));

        // a TLS change still rewrites the route, keeping the assigned host
        let mut stale = live.clone();
        stale.spec.tls = None;
        assert!(!Route::spec_eq(&stale, &desired));
        let merged = Route::merge_into(stale, desired.clone());
        assert_eq!(
            merged.spec.host.as_deref(),
            Some("shop-team-a.apps.example.com")
        );
        assert!(Route::spec_eq(&merged, &desired));
    }

    #[test]
    fn custom_host_overrides_live_host() {
        let desired = rendered(Some("shop.example.com")).route.expect("route");
        let mut live = desired.clone();
        live.spec.host = Some("shop-team-a.apps.example.com".into());
        assert!(!Route::spec_eq(&live, &desired));
        let merged = Route::merge_into(live, desired);
        assert_eq!(merged.spec.host.as_deref(), Some("shop.example.com"));
    }

    #[test]
    fn defaulted_reference_namespace_is_not_drift() {
        let desired = rendered(Some("shop.example.com"))
            .domain_mapping
            .expect("domain mapping");
        let mut live = desired.clone();
        live.spec.reference.namespace = Some("team-a".into());
        assert!(DomainMapping::spec_eq(&live, &desired));

        live.spec.tls = None;
        assert!(!DomainMapping::spec_eq(&live, &desired));
        let merged = DomainMapping::merge_into(live, desired.clone());
        assert_eq!(merged.spec.reference.namespace.as_deref(), Some("team-a"));
        assert!(DomainMapping::spec_eq(&merged, &desired));
    }

    #[test]
    fn unmodelled_fields_survive_a_merge() {
        let desired = rendered_workload("img:2", None);
        let mut raw = serde_json::to_value(rendered_workload("img:1", None))
            .expect("serialize");
        raw["spec"]["template"]["spec"]["serviceAccountName"] = json!("shop-sa");
        raw["spec"]["template"]["spec"]["containers"][0]["resources"] =
            json!({"limits": {"memory": "256Mi"}});
        let live: KnativeService = serde_json::from_value(raw).expect("parse");
        assert!(!KnativeService::spec_eq(&live, &desired));

        let merged = KnativeService::merge_into(live, desired.clone());
        let out = serde_json::to_value(&merged).expect("serialize");
        let tmpl = &out["spec"]["template"]["spec"];
        assert_eq!(tmpl["serviceAccountName"], json!("shop-sa"));
        assert_eq!(tmpl["containers"][0]["image"], json!("img:2"));
        assert_eq!(
            tmpl["containers"][0]["resources"]["limits"]["memory"],
            json!("256Mi")
        );
        assert!(KnativeService::spec_eq(&merged, &desired));

        let mut raw = serde_json::to_value(rendered(None).route.expect("route"))
            .expect("serialize");
        raw["spec"]["port"] = json!({"targetPort": "http"});
        let live: Route = serde_json::from_value(raw).expect("parse");
        let merged = Route::merge_into(live, rendered(None).route.expect("route"));
        let out = serde_json::to_value(&merged).expect("serialize");
        assert_eq!(out["spec"]["port"]["targetPort"], json!("http"));
    }
}
