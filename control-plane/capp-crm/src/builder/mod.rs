//! Desired-state rendering: turns a Capp into the dependent objects it
//! implies. Pure; the same Capp and options always yield equal objects.

use std::collections::BTreeMap;

use capp_store::ObjectId;
use kube::api::ObjectMeta;

use crate::crd::capp::{Capp, ConfigurationSpec, LogSpec, RouteSpec};
use crate::crd::knative::{
    Container, ContainerPort, DomainMapping, DomainMappingSpec, EnvVar,
    KReference, KnativeService, KnativeServiceSpec, RevisionSpec,
    RevisionTemplateSpec, SERVING_API_VERSION, SecretTls, TemplateMetadata,
};
use crate::crd::logging::{LogOutput, LogPipeline, LogPipelineSpec};
use crate::crd::route::{
    PlatformRouteSpec, Route, RouteTargetReference, TlsConfig,
};
use crate::crd::{CAPP_LABEL, PARENT_CAPP_ANNOTATION};

pub const MIN_SCALE_ANNOTATION: &str = "autoscaling.knative.dev/min-scale";
pub const MAX_SCALE_ANNOTATION: &str = "autoscaling.knative.dev/max-scale";

/// Platform switches that shape what gets rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Render a platform Route when the Capp asks for routing
    pub routes_enabled: bool,
    /// Container port used when the Capp does not set one
    pub default_port: i32,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            routes_enabled: false,
            default_port: 8080,
        }
    }
}

/// Target of every dependent kind for one Capp. `None` means the kind is
/// not requested and any live object of that kind should go away.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DesiredState {
    pub workload: Option<KnativeService>,
    pub route: Option<Route>,
    pub domain_mapping: Option<DomainMapping>,
    pub logging: Option<LogPipeline>,
}

pub fn build(capp: &Capp, opts: &BuildOptions) -> DesiredState {
    let id = ObjectId::of(capp);
    let route_spec = capp.spec.route_spec.as_ref();

    DesiredState {
        workload: Some(workload(&id, &capp.spec.configuration_spec, opts)),
        route: route_spec
            .filter(|_| opts.routes_enabled)
            .map(|rs| route(&id, rs)),
        domain_mapping: route_spec.and_then(|rs| {
            rs.custom_hostname().map(|host| domain_mapping(&id, rs, host))
        }),
        logging: capp.spec.log_spec.as_ref().map(|ls| logging(&id, ls)),
    }
}

/// Labels every object rendered for the Capp carries.
pub fn owned_labels(capp_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(CAPP_LABEL.to_string(), capp_name.to_string())])
}

/// Annotations every object rendered for the Capp carries.
pub fn owned_annotations(capp_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        PARENT_CAPP_ANNOTATION.to_string(),
        capp_name.to_string(),
    )])
}

fn owned_meta(id: &ObjectId) -> ObjectMeta {
    ObjectMeta {
        name: Some(id.name.clone()),
        namespace: Some(id.namespace.clone()),
        labels: Some(owned_labels(&id.name)),
        annotations: Some(owned_annotations(&id.name)),
        ..Default::default()
    }
}

fn workload(
    id: &ObjectId,
    cfg: &ConfigurationSpec,
    opts: &BuildOptions,
) -> KnativeService {
    let mut annotations = BTreeMap::new();
    if let Some(min) = cfg.min_scale {
        annotations.insert(MIN_SCALE_ANNOTATION.to_string(), min.to_string());
    }
    if let Some(max) = cfg.max_scale {
        annotations.insert(MAX_SCALE_ANNOTATION.to_string(), max.to_string());
    }

    let container = Container {
        name: Some(id.name.clone()),
        image: cfg.image.clone(),
        ports: vec![ContainerPort {
            container_port: cfg.container_port.unwrap_or(opts.default_port),
            name: None,
        }],
        env: cfg
            .env
            .iter()
            .map(|e| EnvVar {
                name: e.name.clone(),
                value: Some(e.value.clone()),
            })
            .collect(),
        extra: BTreeMap::new(),
    };

    KnativeService {
        metadata: owned_meta(id),
        spec: KnativeServiceSpec {
            template: RevisionTemplateSpec {
                metadata: Some(TemplateMetadata {
                    labels: owned_labels(&id.name),
                    annotations,
                }),
                spec: RevisionSpec {
                    containers: vec![container],
                    container_concurrency: cfg.container_concurrency,
                    timeout_seconds: None,
                    extra: BTreeMap::new(),
                },
            },
            traffic: Vec::new(),
            extra: BTreeMap::new(),
        },
    }
}

fn route(id: &ObjectId, rs: &RouteSpec) -> Route {
    let tls = rs.tls_enabled.then(|| TlsConfig {
        termination: "edge".into(),
        insecure_edge_termination_policy: Some("Redirect".into()),
    });
    Route {
        metadata: owned_meta(id),
        spec: PlatformRouteSpec {
            host: rs.custom_hostname().map(str::to_string),
            to: RouteTargetReference {
                kind: "Service".into(),
                name: id.name.clone(),
                weight: Some(100),
            },
            tls,
            wildcard_policy: None,
            extra: BTreeMap::new(),
        },
    }
}

/// Identity of the DomainMapping serving `host` for the Capp at `capp`.
/// Object names are lowercase; hostnames compare case-insensitively.
pub fn domain_mapping_id(capp: &ObjectId, host: &str) -> ObjectId {
    ObjectId::new(capp.namespace.clone(), host.to_ascii_lowercase())
}

fn domain_mapping(id: &ObjectId, rs: &RouteSpec, host: &str) -> DomainMapping {
    let mut metadata = owned_meta(id);
    metadata.name = Some(domain_mapping_id(id, host).name);
    DomainMapping {
        metadata,
        spec: DomainMappingSpec {
            reference: KReference {
                api_version: SERVING_API_VERSION.into(),
                kind: "Service".into(),
                name: id.name.clone(),
                namespace: None,
            },
            tls: rs.tls_enabled.then(|| SecretTls {
                secret_name: format!("{}-tls", id.name),
            }),
            extra: BTreeMap::new(),
        },
    }
}

fn logging(id: &ObjectId, ls: &LogSpec) -> LogPipeline {
    LogPipeline {
        metadata: owned_meta(id),
        spec: LogPipelineSpec {
            selector: owned_labels(&id.name),
            output: LogOutput {
                type_: ls.type_,
                host: ls.host.clone(),
                index: ls.index.clone(),
                user: ls.user.clone(),
                password_secret_name: ls.password_secret_name.clone(),
            },
        },
    }
}
