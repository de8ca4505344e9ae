#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use capp_crm::builder::BuildOptions;
use capp_crm::controller::Reconciler;
use capp_crm::crd::capp::{
    Capp, CappSpec, ConfigurationSpec, LogSpec, LogType, RouteSpec,
};
use capp_store::memory::MemoryStore;
use capp_store::{
    ConflictToken, ObjectId, ObjectStore, StoreResult, StoredObject, Versioned,
};
use tokio::time::Duration;

pub const NS: &str = "team-a";

pub fn id(name: &str) -> ObjectId {
    ObjectId::new(NS, name)
}

// DNS-1123 safe unique names
pub fn uniq(prefix: &str) -> String {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    format!(
        "{prefix}-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

pub fn capp(name: &str) -> Capp {
    let mut capp = Capp::new(
        name,
        CappSpec {
            configuration_spec: ConfigurationSpec {
                image: "ghcr.io/acme/shop:1.0".into(),
                min_scale: Some(1),
                ..Default::default()
            },
            route_spec: None,
            log_spec: None,
        },
    );
    capp.metadata.namespace = Some(NS.into());
    capp
}

pub fn with_hostname(mut capp: Capp, hostname: &str) -> Capp {
    capp.spec.route_spec = Some(RouteSpec {
        hostname: Some(hostname.into()),
        tls_enabled: false,
    });
    capp
}

pub fn with_logging(mut capp: Capp) -> Capp {
    capp.spec.log_spec = Some(LogSpec {
        type_: LogType::Elastic,
        host: "elastic.logging.svc".into(),
        index: "apps".into(),
        user: Some("shipper".into()),
        password_secret_name: Some("elastic-creds".into()),
    });
    capp
}

pub fn options() -> BuildOptions {
    BuildOptions {
        routes_enabled: true,
        default_port: 8080,
    }
}

pub fn reconciler(store: &MemoryStore) -> Reconciler<MemoryStore> {
    Reconciler::new(store.clone(), options(), Duration::from_secs(30))
}

/// Stores `capp` as a user would submit it and returns its identity.
pub async fn submit(store: &MemoryStore, capp: &Capp) -> ObjectId {
    store.put(capp).await.expect("store capp");
    ObjectId::of(capp)
}

/// Replaces the Capp's spec the way `kubectl apply` would, keeping status
/// and finalizers.
pub async fn edit_spec(
    store: &MemoryStore,
    id: &ObjectId,
    edit: impl FnOnce(&mut Capp),
) {
    let mut live: Capp = store.peek(id).await.expect("capp exists");
    edit(&mut live);
    store.put(&live).await.expect("store capp");
}

/// Delays every call before handing it to the wrapped memory store, so
/// passes have real suspension points under a paused clock.
#[derive(Clone)]
pub struct SlowStore {
    pub inner: MemoryStore,
    pub delay: Duration,
}

impl SlowStore {
    pub fn new(inner: MemoryStore, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait::async_trait]
impl<T: StoredObject> ObjectStore<T> for SlowStore {
    async fn get(&self, id: &ObjectId) -> StoreResult<Versioned<T>> {
        tokio::time::sleep(self.delay).await;
        ObjectStore::<T>::get(&self.inner, id).await
    }

    async fn create(&self, object: &T) -> StoreResult<ConflictToken> {
        tokio::time::sleep(self.delay).await;
        self.inner.create(object).await
    }

    async fn update(
        &self,
        object: &T,
        token: &ConflictToken,
    ) -> StoreResult<ConflictToken> {
        tokio::time::sleep(self.delay).await;
        self.inner.update(object, token).await
    }

    async fn update_status(
        &self,
        object: &T,
        token: &ConflictToken,
    ) -> StoreResult<ConflictToken> {
        tokio::time::sleep(self.delay).await;
        self.inner.update_status(object, token).await
    }

    async fn delete(&self, id: &ObjectId) -> StoreResult<()> {
        tokio::time::sleep(self.delay).await;
        ObjectStore::<T>::delete(&self.inner, id).await
    }
}
