pub mod capp;
pub mod knative;
pub mod logging;
pub mod route;

pub use capp::{Capp, CappSpec, CappStatus};
pub use knative::{DomainMapping, KnativeService};
pub use logging::LogPipeline;
pub use route::Route;

/// Annotation linking a dependent object back to the Capp that owns it.
pub const PARENT_CAPP_ANNOTATION: &str = "rcs.dana.io/parent-capp";
/// Label carried by every dependent object and the workload's pods.
pub const CAPP_LABEL: &str = "rcs.dana.io/capp";
pub const FINALIZER: &str = "rcs.dana.io/finalizer";
