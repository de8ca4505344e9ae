use envconfig::Envconfig;
use tokio::time::Duration;

use crate::builder::BuildOptions;

#[derive(Envconfig, Clone, Debug)]
pub struct CappConfig {
    /// Deployment profile selecting feature defaults: dev | openshift | full
    #[envconfig(from = "CAPP_PROFILE", default = "dev")]
    pub profile: String,

    /// Namespace to watch; empty watches the whole cluster
    #[envconfig(from = "CAPP_WATCH_NAMESPACE", default = "")]
    pub watch_namespace: String,

    /// Upper bound on one reconciliation pass, store calls included.
    /// Env: CAPP_PASS_TIMEOUT_SECS
    #[envconfig(from = "CAPP_PASS_TIMEOUT_SECS", default = "30")]
    pub pass_timeout_secs: u64,

    /// Container port rendered when a Capp does not set one
    #[envconfig(from = "CAPP_DEFAULT_CONTAINER_PORT", default = "8080")]
    pub default_container_port: i32,

    /// Emit JSON log lines instead of the human-readable format
    #[envconfig(from = "CAPP_LOG_JSON", default = "false")]
    pub log_json: bool,

    #[envconfig(nested)]
    pub features: FeaturesConfig,

    #[envconfig(nested)]
    pub retry: RetryConfig,
}

#[derive(Envconfig, Clone, Debug, Default)]
pub struct FeaturesConfig {
    /// If Some, env explicitly set; otherwise, profile defaults apply
    #[envconfig(from = "CAPP_FEATURES_OPENSHIFT_ROUTES")]
    pub openshift_routes: Option<bool>,
    #[envconfig(from = "CAPP_FEATURES_EVENTS")]
    pub events: Option<bool>,
}

#[derive(Envconfig, Clone, Debug)]
pub struct RetryConfig {
    /// Delay before re-checking a Capp whose pass made writes
    #[envconfig(from = "CAPP_REQUEUE_SOON_SECS", default = "5")]
    pub requeue_soon_secs: u64,
    /// Periodic resync of converged Capps
    #[envconfig(from = "CAPP_RESYNC_SECS", default = "300")]
    pub resync_secs: u64,
    #[envconfig(from = "CAPP_BACKOFF_BASE_SECS", default = "1")]
    pub backoff_base_secs: u64,
    #[envconfig(from = "CAPP_BACKOFF_MAX_SECS", default = "300")]
    pub backoff_max_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            requeue_soon_secs: 5,
            resync_secs: 300,
            backoff_base_secs: 1,
            backoff_max_secs: 300,
        }
    }
}

impl CappConfig {
    /// Apply profile → defaults mapping, while respecting explicit env overrides.
    ///
    /// Rules:
    /// - dev: openshift_routes=false, events=false
    /// - openshift: openshift_routes=true, events=true
    /// - full: openshift_routes=true, events=true
    pub fn apply_profile_defaults(mut self) -> Self {
        let (def_routes, def_events) = match self.profile.as_str() {
            "openshift" | "ocp" => (true, true),
            "full" | "prod" | "production" => (true, true),
            _ /* dev */ => (false, false),
        };

        if self.features.openshift_routes.is_none() {
            self.features.openshift_routes = Some(def_routes);
        }
        if self.features.events.is_none() {
            self.features.events = Some(def_events);
        }

        self
    }

    pub fn routes_enabled(&self) -> bool {
        self.features.openshift_routes.unwrap_or(false)
    }

    pub fn events_enabled(&self) -> bool {
        self.features.events.unwrap_or(false)
    }

    pub fn watch_namespace(&self) -> Option<&str> {
        Some(self.watch_namespace.trim()).filter(|ns| !ns.is_empty())
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            routes_enabled: self.routes_enabled(),
            default_port: self.default_container_port,
        }
    }

    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_secs)
    }
}

impl RetryConfig {
    pub fn requeue_soon(&self) -> Duration {
        Duration::from_secs(self.requeue_soon_secs)
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs.max(1))
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }
}
